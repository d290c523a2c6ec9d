// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Edit sessions against a zone's persistent configuration.

use crate::zone::{
    lookup_resource, lookup_resource_property, ErrorCode, Property, Resource,
    ZoneError, ZoneManager,
};
use slog::{debug, warn, Logger};
use slog_error_chain::InlineErrorChain;
use std::sync::Arc;

/// Errors raised while editing a zone configuration.
#[derive(thiserror::Error, Debug)]
pub enum ZonecfgError {
    #[error("Failed to begin editing zone '{zone}': {err}")]
    Begin {
        zone: String,
        #[source]
        err: ZoneError,
    },

    #[error("Failed to commit configuration of zone '{zone}': {err}")]
    Commit {
        zone: String,
        #[source]
        err: ZoneError,
    },

    #[error(
        "Failed to set '{resource}' property '{property}' of zone '{zone}': {err}"
    )]
    SetProperty {
        zone: String,
        resource: String,
        property: String,
        #[source]
        err: ZoneError,
    },

    #[error("Failed to add '{resource}' resource to zone '{zone}': {err}")]
    AddResource {
        zone: String,
        resource: String,
        #[source]
        err: ZoneError,
    },

    #[error("Failed to remove '{resource}' resources from zone '{zone}': {err}")]
    RemoveResources {
        zone: String,
        resource: String,
        #[source]
        err: ZoneError,
    },

    #[error(
        "Failed to clear '{resource}' properties {properties:?} of zone '{zone}': {err}"
    )]
    ClearProperties {
        zone: String,
        resource: String,
        properties: Vec<String>,
        #[source]
        err: ZoneError,
    },

    #[error("Failed to look up '{resource}' in zone '{zone}': {err}")]
    Lookup {
        zone: String,
        resource: String,
        #[source]
        err: ZoneError,
    },
}

impl ZonecfgError {
    /// The backend error behind this failure.
    pub fn zone_error(&self) -> &ZoneError {
        match self {
            ZonecfgError::Begin { err, .. }
            | ZonecfgError::Commit { err, .. }
            | ZonecfgError::SetProperty { err, .. }
            | ZonecfgError::AddResource { err, .. }
            | ZonecfgError::RemoveResources { err, .. }
            | ZonecfgError::ClearProperties { err, .. }
            | ZonecfgError::Lookup { err, .. } => err,
        }
    }
}

/// An open edit session on one zone.
///
/// Edits are visible to lookups made through this session, and to nobody
/// else, until [ConfigTransaction::commit] succeeds. A session must be
/// finished with `commit`, `cancel` or `end`; a session dropped while still
/// open is cancelled in the background.
pub struct ConfigTransaction {
    log: Logger,
    zones: Arc<dyn ZoneManager>,
    zone: String,
    open: bool,
}

impl ConfigTransaction {
    pub async fn begin(
        log: &Logger,
        zones: Arc<dyn ZoneManager>,
        zone: &str,
    ) -> Result<Self, ZonecfgError> {
        zones.edit_config(zone).await.map_err(|err| ZonecfgError::Begin {
            zone: zone.to_string(),
            err,
        })?;
        debug!(log, "editing zone configuration"; "zone" => zone);
        Ok(Self {
            log: log.clone(),
            zones,
            zone: zone.to_string(),
            open: true,
        })
    }

    pub fn zone(&self) -> &str {
        &self.zone
    }

    /// Sets `key` on the resource selected by `resource`.
    ///
    /// Nothing is sent to the backend when the value is already current. If
    /// no resource matches, one is added carrying the filter's properties
    /// and the new value.
    pub async fn set_property(
        &self,
        resource: &Resource,
        key: &str,
        value: &str,
    ) -> Result<(), ZonecfgError> {
        let current = self.lookup_property(resource, key).await?;
        if current.as_deref() == Some(value) {
            return Ok(());
        }
        let property = Property::new(key, value);
        let err = |err| ZonecfgError::SetProperty {
            zone: self.zone.clone(),
            resource: resource.kind.clone(),
            property: key.to_string(),
            err,
        };
        let exists = current.is_some()
            || self
                .lookup_resource_matching(resource)
                .await?
                .is_some();
        if exists {
            self.zones
                .set_resource_properties(&self.zone, resource, &[property])
                .await
                .map_err(err)
        } else {
            let mut added = resource.clone();
            added.properties.push(property);
            self.zones.add_resource(&self.zone, &added).await.map_err(err)
        }
    }

    /// Adds `resource`. When the backend reports that it already exists and
    /// `ignore_exists` is set, its properties are set instead.
    pub async fn add_resource(
        &self,
        resource: &Resource,
        ignore_exists: bool,
    ) -> Result<(), ZonecfgError> {
        let err = |err| ZonecfgError::AddResource {
            zone: self.zone.clone(),
            resource: resource.kind.clone(),
            err,
        };
        match self.zones.add_resource(&self.zone, resource).await {
            Err(e)
                if ignore_exists
                    && e.code == ErrorCode::ResourceAlreadyExists =>
            {
                debug!(
                    self.log,
                    "resource exists; setting properties instead";
                    "zone" => &self.zone,
                    "resource" => &resource.kind,
                );
                self.zones
                    .set_resource_properties(
                        &self.zone,
                        &Resource::kind(resource.kind.clone()),
                        &resource.properties,
                    )
                    .await
                    .map_err(err)
            }
            result => result.map_err(err),
        }
    }

    /// Removes every resource selected by `filter`.
    pub async fn remove_resources(
        &self,
        filter: &Resource,
    ) -> Result<(), ZonecfgError> {
        self.zones.remove_resources(&self.zone, filter).await.map_err(|err| {
            ZonecfgError::RemoveResources {
                zone: self.zone.clone(),
                resource: filter.kind.clone(),
                err,
            }
        })
    }

    /// Blanks `keys` on the resource selected by `filter`.
    pub async fn clear_properties(
        &self,
        filter: &Resource,
        keys: &[&str],
    ) -> Result<(), ZonecfgError> {
        self.zones
            .clear_resource_properties(&self.zone, filter, keys)
            .await
            .map_err(|err| ZonecfgError::ClearProperties {
                zone: self.zone.clone(),
                resource: filter.kind.clone(),
                properties: keys.iter().map(|k| k.to_string()).collect(),
                err,
            })
    }

    /// Reads a property as this session currently sees it.
    pub async fn lookup_property(
        &self,
        resource: &Resource,
        key: &str,
    ) -> Result<Option<String>, ZonecfgError> {
        lookup_resource_property(&*self.zones, &self.zone, resource, key)
            .await
            .map_err(|err| self.lookup_error(resource, err))
    }

    /// Returns the first resource of `kind` as this session sees it.
    pub async fn lookup_resource(
        &self,
        kind: &str,
    ) -> Result<Option<Resource>, ZonecfgError> {
        lookup_resource(&*self.zones, &self.zone, kind)
            .await
            .map_err(|err| self.lookup_error(&Resource::kind(kind), err))
    }

    async fn lookup_resource_matching(
        &self,
        filter: &Resource,
    ) -> Result<Option<Resource>, ZonecfgError> {
        match self.zones.get_resources(&self.zone, filter).await {
            Ok(found) => Ok(found.into_iter().next()),
            Err(err) if err.is_not_found() => Ok(None),
            Err(err) => Err(self.lookup_error(filter, err)),
        }
    }

    fn lookup_error(&self, resource: &Resource, err: ZoneError) -> ZonecfgError {
        ZonecfgError::Lookup {
            zone: self.zone.clone(),
            resource: resource.kind.clone(),
            err,
        }
    }

    /// Commits all pending edits.
    ///
    /// If the commit fails the session is cancelled before the commit error
    /// is returned.
    pub async fn commit(mut self) -> Result<(), ZonecfgError> {
        self.open = false;
        if let Err(err) = self.zones.commit_config(&self.zone).await {
            if let Err(cancel_err) = self.zones.cancel_config(&self.zone).await
            {
                warn!(
                    self.log,
                    "failed to cancel edit after failed commit";
                    "zone" => &self.zone,
                    "reason" => %cancel_err,
                );
            }
            return Err(ZonecfgError::Commit { zone: self.zone.clone(), err });
        }
        debug!(self.log, "committed zone configuration"; "zone" => &self.zone);
        Ok(())
    }

    /// Discards all pending edits.
    pub async fn cancel(mut self) -> Result<(), ZoneError> {
        self.open = false;
        self.zones.cancel_config(&self.zone).await
    }

    /// Finishes the session according to `result`: commit on success,
    /// cancel on failure. The original error always wins over a cancel
    /// failure.
    pub async fn end<T, E>(self, result: Result<T, E>) -> Result<T, E>
    where
        E: From<ZonecfgError>,
    {
        match result {
            Ok(value) => {
                self.commit().await?;
                Ok(value)
            }
            Err(err) => {
                let log = self.log.clone();
                let zone = self.zone.clone();
                if let Err(cancel_err) = self.cancel().await {
                    warn!(
                        log,
                        "failed to cancel zone configuration edit";
                        "zone" => zone,
                        "reason" => InlineErrorChain::new(&cancel_err),
                    );
                }
                Err(err)
            }
        }
    }
}

impl Drop for ConfigTransaction {
    fn drop(&mut self) {
        if !self.open {
            return;
        }
        warn!(
            self.log,
            "zone configuration edit dropped while open; cancelling";
            "zone" => &self.zone,
        );
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            return;
        };
        let zones = self.zones.clone();
        let zone = self.zone.clone();
        let log = self.log.clone();
        handle.spawn(async move {
            if let Err(err) = zones.cancel_config(&zone).await {
                warn!(
                    log,
                    "failed to cancel dropped zone configuration edit";
                    "zone" => zone,
                    "reason" => %err,
                );
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fakes::zone::FakeZoneManager;
    use crate::test_log;

    async fn native_zone(name: &str) -> Arc<FakeZoneManager> {
        let zones = FakeZoneManager::new();
        zones.create(name, "SYSdefault").await.unwrap();
        zones
    }

    #[tokio::test]
    async fn setting_current_value_issues_no_mutation() {
        let log = test_log("setting_current_value_issues_no_mutation");
        let zones = native_zone("z1").await;
        let global = Resource::kind("global");

        let txn = ConfigTransaction::begin(&log, zones.clone(), "z1")
            .await
            .unwrap();
        txn.set_property(&global, "hostid", "0x1234").await.unwrap();
        txn.end(Ok::<_, ZonecfgError>(())).await.unwrap();
        let mutations = zones.mutations().len();

        for _ in 0..3 {
            let txn = ConfigTransaction::begin(&log, zones.clone(), "z1")
                .await
                .unwrap();
            txn.set_property(&global, "hostid", "0x1234").await.unwrap();
            txn.end(Ok::<_, ZonecfgError>(())).await.unwrap();
        }
        assert_eq!(zones.mutations().len(), mutations);
    }

    #[tokio::test]
    async fn set_property_adds_missing_resource() {
        let log = test_log("set_property_adds_missing_resource");
        let zones = native_zone("z1").await;

        let txn = ConfigTransaction::begin(&log, zones.clone(), "z1")
            .await
            .unwrap();
        txn.set_property(&Resource::kind("capped-cpu"), "ncpus", "2")
            .await
            .unwrap();
        txn.set_property(&Resource::kind("capped-cpu"), "ncpus", "4")
            .await
            .unwrap();
        txn.commit().await.unwrap();

        let config = zones.committed_config("z1").unwrap();
        let cpus = config.select(&Resource::kind("capped-cpu"));
        assert_eq!(cpus.len(), 1);
        assert_eq!(cpus[0].property("ncpus").unwrap().value(), "4");
    }

    #[tokio::test]
    async fn failed_session_leaves_config_untouched() {
        let log = test_log("failed_session_leaves_config_untouched");
        let zones = native_zone("z1").await;
        let before = zones.committed_config("z1").unwrap();

        let txn = ConfigTransaction::begin(&log, zones.clone(), "z1")
            .await
            .unwrap();
        let result: Result<(), ZonecfgError> = async {
            txn.set_property(&Resource::kind("global"), "hostid", "0x1")
                .await?;
            txn.add_resource(
                &Resource::new("anet", vec![Property::new("linkname", "net1")]),
                false,
            )
            .await?;
            txn.add_resource(
                &Resource::new("global", vec![Property::new("brand", "x")]),
                false,
            )
            .await?;
            Ok(())
        }
        .await;
        let err = txn.end(result).await.unwrap_err();
        assert!(matches!(err, ZonecfgError::AddResource { .. }));
        assert_eq!(
            err.zone_error().code,
            ErrorCode::ResourceAlreadyExists
        );

        assert_eq!(zones.committed_config("z1").unwrap(), before);
        assert!(!zones.is_editing("z1"));
    }

    #[tokio::test]
    async fn add_resource_can_fall_back_to_set() {
        let log = test_log("add_resource_can_fall_back_to_set");
        let zones = native_zone("z1").await;

        let txn = ConfigTransaction::begin(&log, zones.clone(), "z1")
            .await
            .unwrap();
        let pool = |uri: &str| {
            Resource::new(
                "rootzpool",
                vec![Property::list("storage", vec![uri.to_string()])],
            )
        };
        txn.add_resource(&pool("dev:/a"), true).await.unwrap();
        txn.add_resource(&pool("dev:/b"), true).await.unwrap();
        txn.commit().await.unwrap();

        let config = zones.committed_config("z1").unwrap();
        let pools = config.select(&Resource::kind("rootzpool"));
        assert_eq!(pools, vec![pool("dev:/b")]);
    }

    #[tokio::test]
    async fn failed_commit_cancels() {
        let log = test_log("failed_commit_cancels");
        let zones = native_zone("z1").await;
        zones.fail_next(
            "commit_config",
            ZoneError::new(ErrorCode::SystemError, "disk full"),
        );

        let txn = ConfigTransaction::begin(&log, zones.clone(), "z1")
            .await
            .unwrap();
        txn.set_property(&Resource::kind("global"), "hostid", "0x1")
            .await
            .unwrap();
        let err = txn.commit().await.unwrap_err();
        assert_eq!(
            err.to_string(),
            "Failed to commit configuration of zone 'z1': SYSTEM_ERROR: disk full"
        );
        assert!(!zones.is_editing("z1"));
        assert!(zones
            .calls()
            .iter()
            .any(|c| c == "cancel_config z1"));
    }

    #[tokio::test]
    async fn dropped_session_is_cancelled() {
        let log = test_log("dropped_session_is_cancelled");
        let zones = native_zone("z1").await;
        {
            let txn = ConfigTransaction::begin(&log, zones.clone(), "z1")
                .await
                .unwrap();
            txn.remove_resources(&Resource::kind("anet")).await.unwrap();
        }
        // Let the spawned cancel run.
        for _ in 0..10 {
            if !zones.is_editing("z1") {
                break;
            }
            tokio::task::yield_now().await;
        }
        assert!(!zones.is_editing("z1"));
        let config = zones.committed_config("z1").unwrap();
        assert_eq!(config.select(&Resource::kind("anet")).len(), 1);
    }
}
