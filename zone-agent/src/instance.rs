// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The compute instance as handed to us by the control plane.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;
use zone_utils::storage::ConnectionInfo;

/// Flavor extra spec naming the zone brand.
pub const BRAND_EXTRA_SPEC: &str = "zonecfg:brand";

/// Prefix of flavor extra specs which become global zone properties.
pub const ZONECFG_SCOPE: &str = "zonecfg:";

/// Flavor extra spec naming a system configuration profile to install with.
pub const SC_PROFILE_EXTRA_SPEC: &str = "install:sc_profile";

/// Keys of [Instance::system_metadata].
pub mod sysmeta {
    pub const HOSTID: &str = "hostid";
    pub const REBUILDING: &str = "rebuilding";
    pub const EVAC_FROM: &str = "evac_from";
    pub const OLD_INSTANCE_VOLID: &str = "old_instance_volid";
    pub const NEW_INSTANCE_VOLID: &str = "new_instance_volid";
    pub const RESIZE_SAMEHOST: &str = "resize_samehost";
    pub const OLD_VM_STATE: &str = "old_vm_state";
}

/// Keys of [Instance::metadata].
pub mod meta {
    pub const BOOTARGS: &str = "bootargs";
    pub const BOOTARGS_PERSIST: &str = "bootargs_persist";
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Flavor {
    pub name: String,
    #[serde(default)]
    pub root_gb: u64,
    #[serde(default)]
    pub extra_specs: BTreeMap<String, String>,
}

impl Flavor {
    /// The brand string requested by this flavor, if any.
    pub fn brand(&self) -> Option<&str> {
        self.extra_specs.get(BRAND_EXTRA_SPEC).map(String::as_str)
    }

    /// Iterates over `zonecfg:`-scoped extra specs as (property, value).
    pub fn zonecfg_properties(&self) -> impl Iterator<Item = (&str, &str)> {
        self.extra_specs.iter().filter_map(|(key, value)| {
            key.strip_prefix(ZONECFG_SCOPE).map(|prop| (prop, value.as_str()))
        })
    }
}

/// What the control plane is in the middle of doing to an instance.
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize, strum::Display,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum TaskState {
    Spawning,
    RebuildSpawning,
    ResizeMigrating,
    ResizeFinish,
    ResizeReverting,
    ImagePendingUpload,
    ImageUploading,
    Migrating,
    Deleting,
}

#[derive(
    Clone,
    Copy,
    Debug,
    Default,
    PartialEq,
    Eq,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumString,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum VmState {
    #[default]
    Building,
    Active,
    Stopped,
    Suspended,
    Resized,
    Error,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Instance {
    pub name: String,
    pub uuid: Uuid,
    pub display_name: String,
    pub hostname: String,
    pub vcpus: u32,
    pub memory_mb: u64,
    pub root_gb: u64,
    pub flavor: Flavor,
    #[serde(default)]
    pub root_device_name: Option<String>,
    #[serde(default)]
    pub image_ref: Option<String>,
    #[serde(default)]
    pub task_state: Option<TaskState>,
    #[serde(default)]
    pub vm_state: VmState,
    #[serde(default)]
    pub host: Option<String>,
    #[serde(default)]
    pub node: Option<String>,
    #[serde(default)]
    pub launched_on: Option<String>,
    #[serde(default)]
    pub config_drive: bool,
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
    #[serde(default)]
    pub system_metadata: BTreeMap<String, String>,
}

impl Instance {
    pub fn sysmeta(&self, key: &str) -> Option<&str> {
        self.system_metadata.get(key).map(String::as_str)
    }

    pub fn set_sysmeta(&mut self, key: &str, value: impl Into<String>) {
        self.system_metadata.insert(key.to_string(), value.into());
    }

    pub fn clear_sysmeta(&mut self, key: &str) -> Option<String> {
        self.system_metadata.remove(key)
    }

    pub fn is_active(&self) -> bool {
        self.vm_state == VmState::Active
    }
}

/// Attachment of one volume at a mount point.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockDeviceMapping {
    pub mount_device: String,
    #[serde(default)]
    pub connection_info: Option<ConnectionInfo>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockDeviceInfo {
    #[serde(default)]
    pub root_device_name: Option<String>,
    #[serde(default)]
    pub block_device_mapping: Vec<BlockDeviceMapping>,
}

/// Compares device names with any `/dev/` prefix removed.
pub fn same_device(a: &str, b: &str) -> bool {
    strip_dev(a) == strip_dev(b)
}

pub fn strip_dev(name: &str) -> &str {
    name.strip_prefix("/dev/").unwrap_or(name)
}

impl BlockDeviceInfo {
    /// Returns true if `mapping` is the root mapping.
    pub fn is_root(&self, mapping: &BlockDeviceMapping) -> bool {
        self.root_device_name
            .as_deref()
            .is_some_and(|root| same_device(&mapping.mount_device, root))
    }

    pub fn root_mapping(&self) -> Option<&BlockDeviceMapping> {
        self.block_device_mapping.iter().find(|m| self.is_root(m))
    }
}

/// Returns the device index of a mount device: its letters read as a
/// bijective base-26 number, so "vda" is 0, "vdz" is 25 and "vdaa" is 26.
pub fn device_index(mount_device: &str) -> usize {
    let name = strip_dev(mount_device);
    let name = ["xvd", "vd", "sd", "hd"]
        .iter()
        .find_map(|prefix| name.strip_prefix(prefix))
        .unwrap_or(name);
    let letters: Vec<usize> = name
        .chars()
        .filter(char::is_ascii_lowercase)
        .map(|c| usize::from(c as u8 - b'a'))
        .collect();
    let mut index = 0;
    for (i, value) in letters.iter().rev().enumerate() {
        if i == 0 {
            index = *value;
        } else {
            index += 26usize.pow(i as u32) * (value + 1);
        }
    }
    index
}

#[derive(thiserror::Error, Debug)]
#[error("Failed to save instance '{name}': {err}")]
pub struct StoreError {
    pub name: String,
    #[source]
    pub err: anyhow::Error,
}

/// Persists instance changes on behalf of the control plane.
#[async_trait]
pub trait InstanceStore: Send + Sync {
    async fn save(&self, instance: &Instance) -> Result<(), StoreError>;
}
