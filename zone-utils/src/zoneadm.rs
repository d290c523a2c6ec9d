// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! A zone backend driving the `zonecfg` and `zoneadm` commands.
//!
//! Configuration edits are staged in memory against the exported
//! configuration and sent to `zonecfg` as one batch on commit, so a
//! cancelled session never touches the zone.

use crate::executor::{run, Executor};
use crate::zone::{
    Connector, ErrorCode, Property, Resource, State, Zone, ZoneError,
    ZoneManager,
};
use crate::zonecfg::{ConfigEdit, ZoneConfiguration};
use crate::{ExecutionError, ZONEADM, ZONECFG};

use async_trait::async_trait;
use slog::{debug, Logger};
use std::collections::HashMap;
use std::str::FromStr;
use std::sync::{Arc, Mutex};

struct Session {
    config: ZoneConfiguration,
    script: Vec<String>,
}

pub struct Zoneadm {
    log: Logger,
    executor: Arc<dyn Executor>,
    sessions: Mutex<HashMap<String, Session>>,
}

fn command_error(op: &str, zone: &str, err: ExecutionError) -> ZoneError {
    match err {
        ExecutionError::CommandFailure(info) => ZoneError::new(
            ErrorCode::CommandError,
            format!("{op} of zone '{zone}' failed"),
        )
        .with_stderr(info.stderr),
        err => ZoneError::new(ErrorCode::SystemError, err.to_string()),
    }
}

/// Parses `zoneadm list -cip` output, skipping the global zone.
///
/// Each line is `id:name:state:path:uuid:brand:ip-type`, with `-` as the id
/// of zones which are not running.
pub fn parse_zone_list(text: &str) -> Result<Vec<Zone>, ZoneError> {
    let mut zones = vec![];
    for line in text.lines().filter(|l| !l.trim().is_empty()) {
        let fields: Vec<&str> = line.split(':').collect();
        let malformed = || {
            ZoneError::new(
                ErrorCode::FrameworkError,
                format!("malformed zone list entry: {line}"),
            )
        };
        if fields.len() < 6 {
            return Err(malformed());
        }
        if fields[1] == "global" {
            continue;
        }
        let state = State::from_str(fields[2]).map_err(|_| malformed())?;
        zones.push(Zone {
            name: fields[1].to_string(),
            id: fields[0].parse().ok(),
            brand: fields[5].to_string(),
            state,
        });
    }
    Ok(zones)
}

impl Zoneadm {
    pub fn new(log: &Logger, executor: Arc<dyn Executor>) -> Arc<Self> {
        Arc::new(Self {
            log: log.new(slog::o!("component" => "Zoneadm")),
            executor,
            sessions: Mutex::new(HashMap::new()),
        })
    }

    async fn zonecfg(
        &self,
        op: &str,
        zone: &str,
        args: &[&str],
    ) -> Result<String, ZoneError> {
        let output = run(
            &*self.executor,
            ZONECFG,
            ["-z", zone].iter().chain(args.iter()),
        )
        .await
        .map_err(|err| command_error(op, zone, err))?;
        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    }

    async fn zoneadm(
        &self,
        op: &str,
        zone: &str,
        options: &[String],
    ) -> Result<(), ZoneError> {
        let args = ["-z", zone, op]
            .into_iter()
            .map(str::to_string)
            .chain(options.iter().cloned());
        run(&*self.executor, ZONEADM, args)
            .await
            .map_err(|err| command_error(op, zone, err))?;
        Ok(())
    }

    async fn exported(
        &self,
        zone: &str,
    ) -> Result<ZoneConfiguration, ZoneError> {
        let text = self.export_config(zone).await?;
        ZoneConfiguration::parse_export(&text).map_err(|err| {
            ZoneError::new(ErrorCode::FrameworkError, err.to_string())
        })
    }

    /// Runs `f` against the configuration visible to readers of `zone`.
    async fn with_config<T>(
        &self,
        zone: &str,
        f: impl FnOnce(&ZoneConfiguration) -> Result<T, ZoneError>,
    ) -> Result<T, ZoneError> {
        {
            let sessions = self.sessions.lock().unwrap();
            if let Some(session) = sessions.get(zone) {
                return f(&session.config);
            }
        }
        f(&self.exported(zone).await?)
    }

    fn stage(&self, zone: &str, edit: ConfigEdit) -> Result<(), ZoneError> {
        let mut sessions = self.sessions.lock().unwrap();
        let session = sessions.get_mut(zone).ok_or_else(|| {
            ZoneError::new(ErrorCode::NotEditing, "no edit in progress")
        })?;
        session.config.apply(&edit)?;
        session.script.extend(edit.script());
        Ok(())
    }
}

#[async_trait]
impl ZoneManager for Zoneadm {
    async fn list(&self, pattern: &str) -> Result<Vec<Zone>, ZoneError> {
        let pattern = glob::Pattern::new(pattern).map_err(|e| {
            ZoneError::new(ErrorCode::InvalidArgument, e.to_string())
        })?;
        let output = run(&*self.executor, ZONEADM, ["list", "-cip"])
            .await
            .map_err(|err| command_error("list", "*", err))?;
        let zones = parse_zone_list(&String::from_utf8_lossy(&output.stdout))?;
        Ok(zones.into_iter().filter(|z| pattern.matches(&z.name)).collect())
    }

    async fn create(
        &self,
        name: &str,
        template: &str,
    ) -> Result<(), ZoneError> {
        self.zonecfg("create", name, &["create", "-t", template]).await?;
        Ok(())
    }

    async fn delete(&self, name: &str) -> Result<(), ZoneError> {
        self.zonecfg("delete", name, &["delete", "-F"]).await?;
        Ok(())
    }

    async fn edit_config(&self, name: &str) -> Result<(), ZoneError> {
        if self.sessions.lock().unwrap().contains_key(name) {
            return Err(ZoneError::new(
                ErrorCode::AlreadyEditing,
                format!("zone '{name}' is already being edited"),
            ));
        }
        let config = self.exported(name).await?;
        self.sessions
            .lock()
            .unwrap()
            .insert(name.to_string(), Session { config, script: vec![] });
        Ok(())
    }

    async fn commit_config(&self, name: &str) -> Result<(), ZoneError> {
        let session =
            self.sessions.lock().unwrap().remove(name).ok_or_else(|| {
                ZoneError::new(ErrorCode::NotEditing, "no edit in progress")
            })?;
        if session.script.is_empty() {
            return Ok(());
        }
        let mut script = session.script;
        script.push("commit".to_string());
        let script = script.join("; ");
        debug!(self.log, "committing zone configuration";
            "zone" => name, "script" => &script);
        self.zonecfg("commit", name, &[script.as_str()]).await?;
        Ok(())
    }

    async fn cancel_config(&self, name: &str) -> Result<(), ZoneError> {
        self.sessions.lock().unwrap().remove(name);
        Ok(())
    }

    async fn get_resources(
        &self,
        name: &str,
        filter: &Resource,
    ) -> Result<Vec<Resource>, ZoneError> {
        self.with_config(name, |config| Ok(config.select(filter))).await
    }

    async fn get_resource_properties(
        &self,
        name: &str,
        filter: &Resource,
        properties: &[&str],
    ) -> Result<Vec<Property>, ZoneError> {
        self.with_config(name, |config| config.properties(filter, properties))
            .await
    }

    async fn add_resource(
        &self,
        name: &str,
        resource: &Resource,
    ) -> Result<(), ZoneError> {
        self.stage(name, ConfigEdit::Add(resource.clone()))
    }

    async fn set_resource_properties(
        &self,
        name: &str,
        filter: &Resource,
        properties: &[Property],
    ) -> Result<(), ZoneError> {
        self.stage(
            name,
            ConfigEdit::Set {
                filter: filter.clone(),
                properties: properties.to_vec(),
            },
        )
    }

    async fn remove_resources(
        &self,
        name: &str,
        filter: &Resource,
    ) -> Result<(), ZoneError> {
        self.stage(name, ConfigEdit::Remove(filter.clone()))
    }

    async fn clear_resource_properties(
        &self,
        name: &str,
        filter: &Resource,
        properties: &[&str],
    ) -> Result<(), ZoneError> {
        self.stage(
            name,
            ConfigEdit::Clear {
                filter: filter.clone(),
                properties: properties.iter().map(|p| p.to_string()).collect(),
            },
        )
    }

    async fn export_config(&self, name: &str) -> Result<String, ZoneError> {
        self.zonecfg("export", name, &["export"]).await
    }

    async fn install(
        &self,
        name: &str,
        options: &[String],
    ) -> Result<(), ZoneError> {
        self.zoneadm("install", name, options).await
    }

    async fn uninstall(
        &self,
        name: &str,
        options: &[String],
    ) -> Result<(), ZoneError> {
        let mut options = options.to_vec();
        if !options.iter().any(|o| o == "-F") {
            options.insert(0, "-F".to_string());
        }
        self.zoneadm("uninstall", name, &options).await
    }

    async fn attach(
        &self,
        name: &str,
        options: &[String],
    ) -> Result<(), ZoneError> {
        self.zoneadm("attach", name, options).await
    }

    async fn detach(
        &self,
        name: &str,
        options: &[String],
    ) -> Result<(), ZoneError> {
        self.zoneadm("detach", name, options).await
    }

    async fn boot(
        &self,
        name: &str,
        options: &[String],
    ) -> Result<(), ZoneError> {
        self.zoneadm("boot", name, options).await
    }

    async fn shutdown(
        &self,
        name: &str,
        options: &[String],
    ) -> Result<(), ZoneError> {
        self.zoneadm("shutdown", name, options).await
    }

    async fn halt(&self, name: &str) -> Result<(), ZoneError> {
        self.zoneadm("halt", name, &[]).await
    }

    async fn reboot(
        &self,
        name: &str,
        options: &[String],
    ) -> Result<(), ZoneError> {
        self.zoneadm("reboot", name, options).await
    }

    async fn suspend(&self, name: &str) -> Result<(), ZoneError> {
        self.zoneadm("suspend", name, &[]).await
    }

    async fn migrate(
        &self,
        name: &str,
        options: &[String],
    ) -> Result<(), ZoneError> {
        self.zoneadm("migrate", name, options).await
    }

    async fn apply(&self, name: &str) -> Result<(), ZoneError> {
        self.zoneadm("apply", name, &[]).await
    }
}

/// Connects to the local zone administration commands.
pub struct ZoneadmConnector {
    log: Logger,
    executor: Arc<dyn Executor>,
}

impl ZoneadmConnector {
    pub fn new(log: &Logger, executor: Arc<dyn Executor>) -> Self {
        Self { log: log.clone(), executor }
    }
}

#[async_trait]
impl Connector for ZoneadmConnector {
    async fn connect(&self) -> Result<Arc<dyn ZoneManager>, ZoneError> {
        Ok(Zoneadm::new(&self.log, self.executor.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::{output_failure, output_success, FakeExecutor};
    use crate::test_log;
    use crate::transaction::ConfigTransaction;

    const EXPORT: &str = "\
create -b
set brand=solaris
set autoboot=false
add anet
set linkname=net0
set lower-link=auto
end
";

    fn zoneadm(name: &str) -> (Arc<FakeExecutor>, Arc<Zoneadm>) {
        let log = test_log(name);
        let executor = FakeExecutor::new(log.clone());
        executor.set_wait_handler(Box::new(|cmd| {
            if cmd.args_start_with(&["list", "-cip"]) {
                output_success(
                    "0:global:running:/::solaris:shared\n\
                     3:web1:running:/system/zones/web1:7c1d:solaris-kz:excl\n\
                     -:db1:installed:/system/zones/db1:8d2e:solaris:excl\n",
                )
            } else if cmd.args.last().is_some_and(|a| a == "export") {
                output_success(EXPORT)
            } else if cmd.args.iter().any(|a| a == "boot") {
                output_failure(
                    1,
                    "zoneadm: zone 'db1': boot failed\nno memory\n",
                )
            } else {
                output_success("")
            }
        }));
        (executor.clone(), Zoneadm::new(&log, executor.as_executor()))
    }

    #[tokio::test]
    async fn lists_non_global_zones() {
        let (_executor, zoneadm) = zoneadm("lists_non_global_zones");
        let zones = zoneadm.list("*").await.unwrap();
        assert_eq!(
            zones,
            vec![
                Zone {
                    name: "web1".to_string(),
                    id: Some(3),
                    brand: "solaris-kz".to_string(),
                    state: State::Running,
                },
                Zone {
                    name: "db1".to_string(),
                    id: None,
                    brand: "solaris".to_string(),
                    state: State::Installed,
                },
            ]
        );
        assert_eq!(zoneadm.list("db*").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn edits_are_committed_as_one_batch() {
        let log = test_log("edits_are_committed_as_one_batch");
        let (executor, zoneadm) = zoneadm("edits_are_committed_as_one_batch");
        let txn = ConfigTransaction::begin(&log, zoneadm.clone(), "db1")
            .await
            .unwrap();
        txn.set_property(
            &Resource::new("anet", vec![Property::new("linkname", "net0")]),
            "lower-link",
            "net1",
        )
        .await
        .unwrap();
        txn.set_property(&Resource::kind("capped-memory"), "swap", "2048M")
            .await
            .unwrap();
        // Lookups inside the session see the staged edit.
        assert_eq!(
            txn.lookup_property(&Resource::kind("capped-memory"), "swap")
                .await
                .unwrap()
                .as_deref(),
            Some("2048M")
        );
        txn.commit().await.unwrap();

        let last = executor.history().last().cloned().unwrap();
        assert_eq!(
            last.args,
            vec![
                "-z",
                "db1",
                "select anet linkname=net0; set lower-link=net1; end; \
                 add capped-memory; set swap=2048M; end; commit",
            ]
        );
    }

    #[tokio::test]
    async fn cancelled_edits_run_nothing() {
        let log = test_log("cancelled_edits_run_nothing");
        let (executor, zoneadm) = zoneadm("cancelled_edits_run_nothing");
        let txn = ConfigTransaction::begin(&log, zoneadm.clone(), "db1")
            .await
            .unwrap();
        txn.remove_resources(&Resource::kind("anet")).await.unwrap();
        let before = executor.history().len();
        txn.cancel().await.unwrap();
        assert_eq!(executor.history().len(), before);
        let anets = zoneadm
            .get_resources("db1", &Resource::kind("anet"))
            .await
            .unwrap();
        assert_eq!(anets.len(), 1);
    }

    #[tokio::test]
    async fn command_failures_carry_stderr() {
        let (_executor, zoneadm) = zoneadm("command_failures_carry_stderr");
        let err = zoneadm.boot("db1", &[]).await.unwrap_err();
        assert_eq!(err.code, ErrorCode::CommandError);
        assert_eq!(
            err.to_string(),
            "COMMAND_ERROR: boot of zone 'db1' failed: \
             zoneadm: zone 'db1': boot failed: no memory"
        );
    }
}
