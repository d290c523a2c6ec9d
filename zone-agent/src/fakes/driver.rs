// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! A [ZoneDriver] wired to in-memory collaborators.

use crate::config::{Config, HostConfig, LogConfig, LogLevel, ZonesConfig};
use crate::driver::{Backends, ZoneDriver};
use crate::fakes::archive::FakeArchiveManager;
use crate::fakes::image::FakeImageService;
use crate::fakes::instance::FakeInstanceStore;
use crate::fakes::network::FakeNetworkApi;
use crate::fakes::volume::FakeVolumeApi;
use crate::instance::{
    BlockDeviceInfo, BlockDeviceMapping, Flavor, Instance, VmState,
    BRAND_EXTRA_SPEC,
};
use crate::network::{Network, Vif, VifDetails};

use camino_tempfile::Utf8TempDir;
use slog::Logger;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;
use zone_utils::backoff::{immediate_policy, FixedAttempts};
use zone_utils::executor::FakeExecutor;
use zone_utils::fakes::kstat::FakeKstat;
use zone_utils::fakes::zone::FakeZoneManager;
use zone_utils::storage::{ConnectionData, ConnectionInfo};
use zone_utils::zone::ConnectionManager;

pub const HOST: &str = "compute-1";
pub const MY_IP: &str = "10.0.0.1";

pub struct TestDriver {
    pub driver: ZoneDriver,
    pub zones: Arc<FakeZoneManager>,
    pub kstat: Arc<FakeKstat>,
    pub executor: Arc<FakeExecutor>,
    pub volumes: Arc<FakeVolumeApi>,
    pub networks: Arc<FakeNetworkApi>,
    pub images: Arc<FakeImageService>,
    pub archives: Arc<FakeArchiveManager>,
    pub store: Arc<FakeInstanceStore>,
    pub dir: Utf8TempDir,
}

impl TestDriver {
    pub fn new(log: &Logger) -> Self {
        Self::with_zones_config(log, |_| {})
    }

    pub fn with_zones_config(
        log: &Logger,
        f: impl FnOnce(&mut ZonesConfig),
    ) -> Self {
        let dir = Utf8TempDir::new().unwrap();
        let root = dir.path();
        let mut zones_config = ZonesConfig {
            glancecache_dirname: root.join("images"),
            snapshots_directory: Some(root.join("snapshots")),
            zones_suspend_path: root.join("suspend"),
            console_log_dir: root.join("console"),
            configdrive_dir: root.join("configdrives"),
            ..Default::default()
        };
        f(&mut zones_config);
        for path in [
            &zones_config.glancecache_dirname,
            &zones_config.console_log_dir,
            &zones_config.configdrive_dir,
        ] {
            std::fs::create_dir_all(path).unwrap();
        }
        let config = Config {
            log: LogConfig::StderrTerminal { level: LogLevel::Debug },
            host: HostConfig {
                host: HOST.to_string(),
                my_ip: MY_IP.to_string(),
                instances_path: root.join("instances"),
                state_path: root.join("state"),
            },
            zones: zones_config,
        };
        std::fs::create_dir_all(&config.host.instances_path).unwrap();
        std::fs::create_dir_all(&config.host.state_path).unwrap();

        let zones = FakeZoneManager::new();
        let kstat = FakeKstat::new();
        let executor = FakeExecutor::new(log.clone());
        let volumes = FakeVolumeApi::new();
        let networks = FakeNetworkApi::new();
        let images = FakeImageService::new();
        let archives = FakeArchiveManager::new();
        let store = FakeInstanceStore::new();

        let driver = ZoneDriver::new(
            log,
            config,
            Backends {
                zones: ConnectionManager::fixed(log, zones.clone()),
                executor: executor.clone().as_executor(),
                kstat: kstat.clone(),
                archives: archives.clone(),
                volumes: volumes.clone(),
                networks: networks.clone(),
                images: images.clone(),
                store: store.clone(),
            },
        )
        .with_settle_delay(Duration::ZERO)
        .with_volume_poll_policy(immediate_policy())
        .with_lun_lookup_policy(FixedAttempts::new(2, Duration::ZERO))
        .with_host_arch("i386");

        Self {
            driver,
            zones,
            kstat,
            executor,
            volumes,
            networks,
            images,
            archives,
            store,
            dir,
        }
    }

    /// Commands run through the executor, as "program arg...".
    pub fn commands(&self) -> Vec<String> {
        self.executor
            .history()
            .into_iter()
            .map(|cmd| {
                std::iter::once(cmd.program)
                    .chain(cmd.args)
                    .collect::<Vec<_>>()
                    .join(" ")
            })
            .collect()
    }
}

pub fn instance(name: &str, brand: &str, memory_mb: u64) -> Instance {
    let mut extra_specs = BTreeMap::new();
    extra_specs.insert(BRAND_EXTRA_SPEC.to_string(), brand.to_string());
    Instance {
        name: name.to_string(),
        uuid: Uuid::new_v4(),
        display_name: name.to_string(),
        hostname: name.to_string(),
        vcpus: 2,
        memory_mb,
        root_gb: 10,
        flavor: Flavor {
            name: format!("{brand}-{memory_mb}"),
            root_gb: 10,
            extra_specs,
        },
        root_device_name: Some("/dev/vda".to_string()),
        image_ref: None,
        task_state: None,
        vm_state: VmState::Building,
        host: Some(HOST.to_string()),
        node: Some(HOST.to_string()),
        launched_on: Some(HOST.to_string()),
        config_drive: false,
        metadata: BTreeMap::new(),
        system_metadata: BTreeMap::new(),
    }
}

pub fn native_instance(name: &str, memory_mb: u64) -> Instance {
    instance(name, "solaris", memory_mb)
}

pub fn kernel_instance(name: &str, memory_mb: u64) -> Instance {
    instance(name, "solaris-kz", memory_mb)
}

pub fn iscsi_connection(volume_id: &str) -> ConnectionInfo {
    ConnectionInfo {
        driver_volume_type: "iscsi".to_string(),
        serial: Some(volume_id.to_string()),
        volume_path: None,
        data: ConnectionData {
            target_portal: Some("10.0.0.9:3260".to_string()),
            target_iqn: Some(format!("iqn.2010-10.org:{volume_id}")),
            target_lun: Some(0),
            volume_id: Some(volume_id.to_string()),
            ..Default::default()
        },
    }
}

/// Block devices with a single root volume on "/dev/vda".
pub fn root_only(volume_id: &str) -> BlockDeviceInfo {
    BlockDeviceInfo {
        root_device_name: Some("/dev/vda".to_string()),
        block_device_mapping: vec![BlockDeviceMapping {
            mount_device: "/dev/vda".to_string(),
            connection_info: Some(iscsi_connection(volume_id)),
        }],
    }
}

pub fn vlan_network(id: &str) -> Network {
    Network {
        id: id.to_string(),
        network_type: "vlan".to_string(),
        physical_network: Some("physnet1".to_string()),
        mtu: 1500,
    }
}

pub fn vif(id: &str, mac: &str, network_id: &str) -> Vif {
    Vif {
        id: id.to_string(),
        address: mac.to_string(),
        network_id: network_id.to_string(),
        details: VifDetails {
            phys_interface: Some("net0".to_string()),
            vlan: Some(100),
        },
    }
}
