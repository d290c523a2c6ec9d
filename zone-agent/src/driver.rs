// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The zone driver: the entry point for every instance operation.
//!
//! Operations are split across modules by concern. This module holds the
//! driver itself, its read-only queries, and the helpers the other modules
//! share; `lifecycle`, `devices` and `migration` add further `impl` blocks.

use crate::config::Config;
use crate::console;
use crate::image::{host_architecture, ImageCache, ImageService};
use crate::instance::{sysmeta, Instance, InstanceStore};
use crate::network::NetworkApi;
use crate::volume::VolumeApi;
use crate::Error;

use slog::Logger;
use slog_error_chain::InlineErrorChain;
use std::collections::BTreeMap;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use zone_utils::archive::ArchiveManager;
use zone_utils::backoff::{volume_poll_policy, ExponentialBackoff, FixedAttempts};
use zone_utils::executor::Executor;
use zone_utils::kstat::{KstatReader, StatCollector};
use zone_utils::storage::{StorageLocator, VolumeConnector};
use zone_utils::svc::ConsoleService;
use zone_utils::transaction::ConfigTransaction;
use zone_utils::zone::{
    lookup_resource_property, Brand, ConnectionManager, PowerState, Resource,
    Zone, ZoneManager,
};

/// How long a kernel zone is given after boot before its root pool is
/// expanded.
pub const DEFAULT_SETTLE_DELAY: Duration = Duration::from_secs(15);

/// The collaborators a [ZoneDriver] is built from.
pub struct Backends {
    pub zones: Arc<ConnectionManager>,
    pub executor: Arc<dyn Executor>,
    pub kstat: Arc<dyn KstatReader>,
    pub archives: Arc<dyn ArchiveManager>,
    pub volumes: Arc<dyn VolumeApi>,
    pub networks: Arc<dyn NetworkApi>,
    pub images: Arc<dyn ImageService>,
    pub store: Arc<dyn InstanceStore>,
}

/// A snapshot of an instance as seen by the host.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct InstanceInfo {
    pub state: PowerState,
    pub max_mem_kb: u64,
    pub mem_kb: u64,
    pub num_cpu: u64,
    pub cpu_time_ns: u64,
}

/// Drives compute instances through their lifecycle as zones.
pub struct ZoneDriver {
    pub(crate) log: Logger,
    pub(crate) config: Config,
    pub(crate) zones: Arc<ConnectionManager>,
    pub(crate) storage: StorageLocator,
    pub(crate) stats: StatCollector,
    pub(crate) console: ConsoleService,
    pub(crate) archives: Arc<dyn ArchiveManager>,
    pub(crate) executor: Arc<dyn Executor>,
    pub(crate) volumes: Arc<dyn VolumeApi>,
    pub(crate) networks: Arc<dyn NetworkApi>,
    pub(crate) images: ImageCache,
    pub(crate) store: Arc<dyn InstanceStore>,
    pub(crate) settle_delay: Duration,
    pub(crate) volume_poll_policy: ExponentialBackoff,
    pub(crate) host_arch: String,
}

impl ZoneDriver {
    pub fn new(log: &Logger, config: Config, backends: Backends) -> Self {
        let log = log.new(o!(
            "component" => "ZoneDriver",
            "host" => config.host.host.clone(),
        ));
        let storage = StorageLocator::new(
            &log,
            backends.executor.clone(),
            config.zones.nfs_username.clone(),
            config.zones.nfs_groupname.clone(),
        );
        let stats =
            StatCollector::new(&log, backends.zones.clone(), backends.kstat);
        let console = ConsoleService::new(&log, backends.executor.clone());
        let images = ImageCache::new(
            &log,
            config.zones.glancecache_dirname.clone(),
            backends.images,
        );
        Self {
            log,
            config,
            zones: backends.zones,
            storage,
            stats,
            console,
            archives: backends.archives,
            executor: backends.executor,
            volumes: backends.volumes,
            networks: backends.networks,
            images,
            store: backends.store,
            settle_delay: DEFAULT_SETTLE_DELAY,
            volume_poll_policy: volume_poll_policy(),
            host_arch: host_architecture().to_string(),
        }
    }

    /// Replaces the wait between booting a resized kernel zone and
    /// expanding its root pool.
    pub fn with_settle_delay(mut self, delay: Duration) -> Self {
        self.settle_delay = delay;
        self
    }

    /// Replaces the policy used while volumes are being created.
    pub fn with_volume_poll_policy(mut self, policy: ExponentialBackoff) -> Self {
        self.volume_poll_policy = policy;
        self
    }

    /// Replaces the policy used while waiting for Fibre Channel LUNs.
    pub fn with_lun_lookup_policy(mut self, policy: FixedAttempts) -> Self {
        self.storage = self.storage.with_lun_lookup_policy(policy);
        self
    }

    /// Overrides the architecture archives are checked against.
    pub fn with_host_arch(mut self, arch: impl Into<String>) -> Self {
        self.host_arch = arch.into();
        self
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// The address other hosts reach this one at.
    pub fn host_ip(&self) -> &str {
        &self.config.host.my_ip
    }

    /// Returns the power state, memory, CPU count and CPU time of an
    /// instance.
    pub async fn get_info(
        &self,
        instance: &Instance,
    ) -> Result<InstanceInfo, Error> {
        zone_info(&self.zones, &self.stats, &instance.name).await
    }

    /// Names of every zone on this host.
    pub async fn list_instances(&self) -> Result<Vec<String>, Error> {
        list_zone_names(&self.zones).await
    }

    pub async fn instance_exists(
        &self,
        instance: &Instance,
    ) -> Result<bool, Error> {
        Ok(self.zones.find_zone(&instance.name).await?.is_some())
    }

    /// Returns resource cap usage and CPU statistics of a running instance.
    pub async fn get_diagnostics(
        &self,
        instance: &Instance,
    ) -> Result<Option<BTreeMap<String, i64>>, Error> {
        let zone = self.zone(&instance.name).await?;
        Ok(self.stats.diagnostics(&zone).await?)
    }

    /// Describes this host to the volume service.
    pub async fn volume_connector(&self) -> VolumeConnector {
        self.storage
            .volume_connector(&self.config.host.my_ip, &self.config.host.host)
            .await
    }

    pub async fn get_console_output(
        &self,
        instance: &Instance,
    ) -> Result<String, Error> {
        self.zone(&instance.name).await?;
        console::console_output(&self.config.zones.console_log_dir, &instance.name)
    }

    /// Looks up the zone backing `name`.
    pub(crate) async fn zone(&self, name: &str) -> Result<Zone, Error> {
        self.zones
            .find_zone(name)
            .await?
            .ok_or_else(|| Error::InstanceNotFound { name: name.to_string() })
    }

    pub(crate) async fn backend(&self) -> Result<Arc<dyn ZoneManager>, Error> {
        Ok(self.zones.zones().await?)
    }

    pub(crate) async fn transaction(
        &self,
        name: &str,
    ) -> Result<ConfigTransaction, Error> {
        let zones = self.backend().await?;
        Ok(ConfigTransaction::begin(&self.log, zones, name).await?)
    }

    /// Resolves the brand of an existing zone.
    pub(crate) fn zone_brand(zone: &Zone) -> Result<Brand, Error> {
        zone.brand().ok_or_else(|| Error::InvalidBrand {
            name: zone.name.clone(),
            brand: zone.brand.clone(),
        })
    }

    /// Resolves the brand an instance's flavor asks for. Flavors which do
    /// not name one get native zones.
    pub(crate) fn flavor_brand(&self, instance: &Instance) -> Result<Brand, Error> {
        match instance.flavor.brand() {
            None => {
                warn!(
                    self.log,
                    "flavor does not specify a zone brand; using default";
                    "instance" => &instance.name,
                    "flavor" => &instance.flavor.name,
                    "brand" => %Brand::Native,
                );
                Ok(Brand::Native)
            }
            Some(brand) => {
                Brand::from_str(brand).map_err(|_| Error::InvalidBrand {
                    name: instance.name.clone(),
                    brand: brand.to_string(),
                })
            }
        }
    }

    pub(crate) async fn save(&self, instance: &Instance) -> Result<(), Error> {
        Ok(self.store.save(instance).await?)
    }

    /// Copies the zone's configured `hostid` into the instance, unless the
    /// instance already carries one.
    pub(crate) async fn record_hostid(
        &self,
        instance: &mut Instance,
    ) -> Result<(), Error> {
        if instance.sysmeta(sysmeta::HOSTID).is_some() {
            return Ok(());
        }
        let zones = self.backend().await?;
        let hostid = lookup_resource_property(
            &*zones,
            &instance.name,
            &Resource::kind("global"),
            "hostid",
        )
        .await?;
        if let Some(hostid) = hostid.filter(|h| !h.is_empty()) {
            debug!(
                self.log,
                "recording zone hostid";
                "instance" => &instance.name,
                "hostid" => &hostid,
            );
            instance.set_sysmeta(sysmeta::HOSTID, hostid);
            self.save(instance).await?;
        }
        Ok(())
    }

    /// Logs the failure of a best-effort step.
    pub(crate) fn log_cleanup_failure(
        &self,
        step: &'static str,
        name: &str,
        err: &Error,
    ) {
        warn!(
            self.log,
            "cleanup step failed";
            "step" => step,
            "instance" => name,
            "reason" => InlineErrorChain::new(err),
        );
    }
}

/// Lists the names of every non-global zone.
pub async fn list_zone_names(
    zones: &ConnectionManager,
) -> Result<Vec<String>, Error> {
    Ok(zones
        .list_zones()
        .await?
        .into_iter()
        .map(|zone| zone.name)
        .filter(|name| name != "global")
        .collect())
}

/// Reads what the host knows about zone `name`.
pub async fn zone_info(
    zones: &ConnectionManager,
    stats: &StatCollector,
    name: &str,
) -> Result<InstanceInfo, Error> {
    let zone = zones
        .find_zone(name)
        .await?
        .ok_or_else(|| Error::InstanceNotFound { name: name.to_string() })?;
    let backend = zones.zones().await?;

    let memory_property = match zone.brand() {
        Some(Brand::Native) => "swap",
        _ => "physical",
    };
    let capped = lookup_resource_property(
        &*backend,
        name,
        &Resource::kind("capped-memory"),
        memory_property,
    )
    .await?;
    let max_mem_kb =
        capped.as_deref().and_then(parse_size_kb).unwrap_or_else(host_memory_kb);

    let num_cpu = zone_cpu_count(&*backend, name).await?;
    let cpu_time_ns = stats.cpu_time_nanos(&zone).await;

    Ok(InstanceInfo {
        state: zone.power_state(),
        max_mem_kb,
        mem_kb: max_mem_kb,
        num_cpu,
        cpu_time_ns,
    })
}

/// The number of virtual CPUs a zone boots with: the low end of a
/// `virtual-cpu` range, else the high end of a `dedicated-cpu` range, else
/// every online CPU of the host.
async fn zone_cpu_count(
    zones: &dyn ZoneManager,
    name: &str,
) -> Result<u64, Error> {
    let ncpus = |kind: &'static str| async move {
        lookup_resource_property(zones, name, &Resource::kind(kind), "ncpus")
            .await
    };
    if let Some(ncpus) = ncpus("virtual-cpu").await? {
        let min = ncpus.split('-').next().unwrap_or_default();
        if let Ok(n) = min.parse() {
            return Ok(n);
        }
    }
    if let Some(ncpus) = ncpus("dedicated-cpu").await? {
        let max = ncpus.rsplit('-').next().unwrap_or_default();
        if let Ok(n) = max.parse() {
            return Ok(n);
        }
    }
    Ok(host_cpu_count())
}

/// Parses a zonecfg size such as "4G" or "2048M" into KiB.
pub fn parse_size_kb(size: &str) -> Option<u64> {
    let size = size.trim();
    let size = size
        .strip_suffix('B')
        .or_else(|| size.strip_suffix('b'))
        .unwrap_or(size);
    let split = size.find(|c: char| !c.is_ascii_digit()).unwrap_or(size.len());
    let (digits, unit) = size.split_at(split);
    let value: u64 = digits.parse().ok()?;
    let kb = match unit.to_ascii_uppercase().as_str() {
        "" => value / 1024,
        "K" => value,
        "M" => value * 1024,
        "G" => value * 1024 * 1024,
        "T" => value * 1024 * 1024 * 1024,
        _ => return None,
    };
    Some(kb)
}

fn host_memory_kb() -> u64 {
    // SAFETY: sysconf has no preconditions.
    let (pages, page_size) = unsafe {
        (libc::sysconf(libc::_SC_PHYS_PAGES), libc::sysconf(libc::_SC_PAGESIZE))
    };
    let pages = u64::try_from(pages).unwrap_or(0);
    let page_size = u64::try_from(page_size).unwrap_or(0);
    pages * page_size / 1024
}

fn host_cpu_count() -> u64 {
    // SAFETY: sysconf has no preconditions.
    let online = unsafe { libc::sysconf(libc::_SC_NPROCESSORS_ONLN) };
    u64::try_from(online).unwrap_or(1)
}
