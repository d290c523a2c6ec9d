// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use crate::volume::{Volume, VolumeApi, VolumeCreate, VolumeError};
use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use uuid::Uuid;
use zone_utils::storage::{ConnectionData, ConnectionInfo, VolumeConnector};

#[derive(Default)]
struct Inner {
    volumes: BTreeMap<String, Volume>,
    connections: BTreeMap<String, ConnectionInfo>,
    attachments: BTreeMap<String, (Uuid, String)>,
    creating_polls: BTreeMap<String, usize>,
    gets: BTreeMap<String, usize>,
    calls: Vec<String>,
    failures: HashMap<String, VecDeque<String>>,
    next_id: usize,
}

/// A volume service holding volumes in memory.
///
/// Mutating calls are recorded as "`op` `id` ...".
#[derive(Default)]
pub struct FakeVolumeApi {
    inner: Mutex<Inner>,
}

impl FakeVolumeApi {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Adds an existing volume.
    pub fn insert(&self, id: &str, display_name: &str, size_gb: u64) {
        self.inner.lock().unwrap().volumes.insert(
            id.to_string(),
            Volume {
                id: id.to_string(),
                display_name: display_name.to_string(),
                display_description: String::new(),
                size_gb,
                status: "available".to_string(),
            },
        );
    }

    /// Sets the connection info handed out for `id`.
    pub fn set_connection(&self, id: &str, info: ConnectionInfo) {
        self.inner.lock().unwrap().connections.insert(id.to_string(), info);
    }

    /// Makes the next `polls` reads of `id` report "creating".
    pub fn set_creating_polls(&self, id: &str, polls: usize) {
        let mut inner = self.inner.lock().unwrap();
        inner.creating_polls.insert(id.to_string(), polls);
    }

    /// Makes the next call of `op` fail.
    pub fn fail_next(&self, op: &str) {
        self.inner
            .lock()
            .unwrap()
            .failures
            .entry(op.to_string())
            .or_default()
            .push_back(format!("injected {op} failure"));
    }

    pub fn calls(&self) -> Vec<String> {
        self.inner.lock().unwrap().calls.clone()
    }

    pub fn gets(&self, id: &str) -> usize {
        self.inner.lock().unwrap().gets.get(id).copied().unwrap_or(0)
    }

    pub fn volume(&self, id: &str) -> Option<Volume> {
        self.inner.lock().unwrap().volumes.get(id).cloned()
    }

    /// The instance and mount point `id` is attached at.
    pub fn attachment(&self, id: &str) -> Option<(Uuid, String)> {
        self.inner.lock().unwrap().attachments.get(id).cloned()
    }

    fn begin(
        &self,
        op: &'static str,
        id: &str,
        call: String,
    ) -> Result<(), VolumeError> {
        let mut inner = self.inner.lock().unwrap();
        inner.calls.push(call);
        match inner.failures.get_mut(op).and_then(|queue| queue.pop_front()) {
            Some(message) => Err(VolumeError::Backend {
                op,
                id: id.to_string(),
                err: anyhow::anyhow!(message),
            }),
            None => Ok(()),
        }
    }

    fn with_volume<T>(
        &self,
        id: &str,
        f: impl FnOnce(&mut Inner) -> T,
    ) -> Result<T, VolumeError> {
        let mut inner = self.inner.lock().unwrap();
        if !inner.volumes.contains_key(id) {
            return Err(VolumeError::NotFound { id: id.to_string() });
        }
        Ok(f(&mut inner))
    }
}

#[async_trait]
impl VolumeApi for FakeVolumeApi {
    async fn create(
        &self,
        request: &VolumeCreate,
    ) -> Result<Volume, VolumeError> {
        let name = &request.display_name;
        self.begin("create", name, format!("create {name}"))?;
        let mut inner = self.inner.lock().unwrap();
        if let Some(source) = &request.source_volume {
            if !inner.volumes.contains_key(source) {
                return Err(VolumeError::NotFound { id: source.clone() });
            }
        }
        inner.next_id += 1;
        let volume = Volume {
            id: format!("vol-{}", inner.next_id),
            display_name: request.display_name.clone(),
            display_description: request.description.clone(),
            size_gb: request.size_gb,
            status: "available".to_string(),
        };
        inner.volumes.insert(volume.id.clone(), volume.clone());
        Ok(volume)
    }

    async fn get(&self, id: &str) -> Result<Volume, VolumeError> {
        self.with_volume(id, |inner| {
            *inner.gets.entry(id.to_string()).or_default() += 1;
            let mut volume = inner.volumes[id].clone();
            if let Some(polls) = inner.creating_polls.get_mut(id) {
                if *polls > 0 {
                    *polls -= 1;
                    volume.status = "creating".to_string();
                }
            }
            volume
        })
    }

    async fn attach(
        &self,
        id: &str,
        instance: Uuid,
        mountpoint: &str,
    ) -> Result<(), VolumeError> {
        self.begin("attach", id, format!("attach {id} {mountpoint}"))?;
        self.with_volume(id, |inner| {
            inner
                .attachments
                .insert(id.to_string(), (instance, mountpoint.to_string()));
        })
    }

    async fn detach(&self, id: &str) -> Result<(), VolumeError> {
        self.begin("detach", id, format!("detach {id}"))?;
        self.with_volume(id, |inner| {
            inner.attachments.remove(id);
        })
    }

    async fn delete(&self, id: &str) -> Result<(), VolumeError> {
        self.begin("delete", id, format!("delete {id}"))?;
        self.with_volume(id, |inner| {
            inner.volumes.remove(id);
            inner.attachments.remove(id);
        })
    }

    async fn extend(&self, id: &str, size_gb: u64) -> Result<(), VolumeError> {
        self.begin("extend", id, format!("extend {id} {size_gb}"))?;
        self.with_volume(id, |inner| {
            if let Some(volume) = inner.volumes.get_mut(id) {
                volume.size_gb = size_gb;
            }
        })
    }

    async fn rename(
        &self,
        id: &str,
        display_name: &str,
    ) -> Result<(), VolumeError> {
        self.begin("rename", id, format!("rename {id} {display_name}"))?;
        self.with_volume(id, |inner| {
            if let Some(volume) = inner.volumes.get_mut(id) {
                volume.display_name = display_name.to_string();
            }
        })
    }

    async fn initialize_connection(
        &self,
        id: &str,
        _connector: &VolumeConnector,
    ) -> Result<ConnectionInfo, VolumeError> {
        self.begin("initialize_connection", id, format!("connect {id}"))?;
        self.with_volume(id, |inner| {
            inner.connections.get(id).cloned().unwrap_or_else(|| {
                ConnectionInfo {
                    driver_volume_type: "iscsi".to_string(),
                    serial: Some(id.to_string()),
                    volume_path: None,
                    data: ConnectionData {
                        target_portal: Some("10.0.0.9:3260".to_string()),
                        target_iqn: Some(format!("iqn.2010-10.org:{id}")),
                        target_lun: Some(0),
                        volume_id: Some(id.to_string()),
                        ..Default::default()
                    },
                }
            })
        })
    }

    async fn update_block_device_mapping(
        &self,
        old_id: &str,
        new_id: &str,
        _connection_info: &ConnectionInfo,
    ) -> Result<(), VolumeError> {
        self.begin(
            "update_bdm",
            old_id,
            format!("update_bdm {old_id} {new_id}"),
        )
    }
}
