// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The block storage service protocol.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use slog::Logger;
use uuid::Uuid;
use zone_utils::backoff::{retry_notify, BackoffError, ExponentialBackoff};
use zone_utils::storage::{ConnectionInfo, VolumeConnector};

/// Status reported while a volume is still being created.
pub const STATUS_CREATING: &str = "creating";

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Volume {
    pub id: String,
    pub display_name: String,
    #[serde(default)]
    pub display_description: String,
    pub size_gb: u64,
    pub status: String,
}

/// Parameters of a new volume.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VolumeCreate {
    pub size_gb: u64,
    pub display_name: String,
    pub description: String,
    pub volume_type: Option<String>,
    pub availability_zone: Option<String>,
    /// Volume to clone.
    pub source_volume: Option<String>,
}

#[derive(thiserror::Error, Debug)]
pub enum VolumeError {
    #[error("Volume {id} could not be found")]
    NotFound { id: String },

    #[error("Failed to {op} volume '{id}': {err}")]
    Backend {
        op: &'static str,
        id: String,
        #[source]
        err: anyhow::Error,
    },
}

#[async_trait]
pub trait VolumeApi: Send + Sync {
    async fn create(&self, request: &VolumeCreate)
        -> Result<Volume, VolumeError>;
    async fn get(&self, id: &str) -> Result<Volume, VolumeError>;
    /// Records that `id` is attached to `instance` at `mountpoint`.
    async fn attach(
        &self,
        id: &str,
        instance: Uuid,
        mountpoint: &str,
    ) -> Result<(), VolumeError>;
    async fn detach(&self, id: &str) -> Result<(), VolumeError>;
    async fn delete(&self, id: &str) -> Result<(), VolumeError>;
    async fn extend(&self, id: &str, size_gb: u64) -> Result<(), VolumeError>;
    async fn rename(
        &self,
        id: &str,
        display_name: &str,
    ) -> Result<(), VolumeError>;
    async fn initialize_connection(
        &self,
        id: &str,
        connector: &VolumeConnector,
    ) -> Result<ConnectionInfo, VolumeError>;
    /// Points the block device mapping of `old_id` at `new_id`.
    async fn update_block_device_mapping(
        &self,
        old_id: &str,
        new_id: &str,
        connection_info: &ConnectionInfo,
    ) -> Result<(), VolumeError>;
}

/// Polls `id` until it leaves the "creating" status.
pub async fn wait_for_volume(
    log: &Logger,
    volumes: &dyn VolumeApi,
    id: &str,
    policy: ExponentialBackoff,
) -> Result<Volume, VolumeError> {
    retry_notify(
        policy,
        || async {
            let volume =
                volumes.get(id).await.map_err(BackoffError::permanent)?;
            if volume.status == STATUS_CREATING {
                return Err(BackoffError::transient(VolumeError::Backend {
                    op: "wait for",
                    id: id.to_string(),
                    err: anyhow::anyhow!("volume is still being created"),
                }));
            }
            Ok(volume)
        },
        |_: VolumeError, delay| {
            debug!(
                log,
                "waiting for volume";
                "volume" => id,
                "delay" => ?delay,
            );
        },
    )
    .await
}
