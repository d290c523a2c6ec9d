// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Errors raised while driving instances through their lifecycle.

use crate::image::ImageError;
use crate::instance::StoreError;
use crate::network::NetworkError;
use crate::volume::VolumeError;
use camino::Utf8PathBuf;
use zone_utils::archive::ArchiveError;
use zone_utils::kstat::StatError;
use zone_utils::storage::StorageError;
use zone_utils::transaction::ZonecfgError;
use zone_utils::zone::ZoneError;
use zone_utils::ExecutionError;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("Instance {name} could not be found")]
    InstanceNotFound { name: String },

    #[error("Instance {name} already exists")]
    InstanceExists { name: String },

    #[error("Instance {name} is not running")]
    InstanceNotRunning { name: String },

    #[error("Invalid brand '{brand}' specified for instance '{name}'")]
    InvalidBrand { name: String, brand: String },

    #[error(
        "Requested flavor, {flavor}, memory size {memory_mb} does not align \
         on {alignment_mb}MB boundary"
    )]
    MemoryAlignment { flavor: String, memory_mb: u64, alignment_mb: u64 },

    #[error("Invalid volume: {reason}")]
    InvalidVolume { reason: String },

    #[error("Volume driver '{driver}' not found")]
    VolumeDriverNotFound { driver: String },

    #[error("Image {image_id} is unacceptable: {reason}")]
    ImageUnacceptable { image_id: String, reason: String },

    #[error("Failed to power on instance: {reason}")]
    PowerOnFailure { reason: String },

    #[error("Failed to power off instance: {reason}")]
    PowerOffFailure { reason: String },

    #[error("Failed to reboot instance: {reason}")]
    RebootFailure { reason: String },

    #[error("Failed to suspend instance: {reason}")]
    SuspendFailure { reason: String },

    #[error("Failed to resume instance: {reason}")]
    ResumeFailure { reason: String },

    #[error("Migration pre-check error: {reason}")]
    MigrationPreCheck { reason: String },

    #[error("Resize error: {reason}")]
    Resize { reason: String },

    #[error("Not supported: {what}")]
    NotSupported { what: String },

    #[error("Network error: {reason}")]
    Network { reason: String },

    #[error("Gave up waiting for {what} after {attempts} attempts")]
    MaxRetriesExceeded { what: String, attempts: usize },

    #[error(transparent)]
    Zone(#[from] ZoneError),

    #[error(transparent)]
    Zonecfg(#[from] ZonecfgError),

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error(transparent)]
    Stat(#[from] StatError),

    #[error(transparent)]
    Volume(#[from] VolumeError),

    #[error(transparent)]
    Image(#[from] ImageError),

    #[error(transparent)]
    Archive(#[from] ArchiveError),

    #[error(transparent)]
    Execution(#[from] ExecutionError),

    #[error("I/O error on {path}: {err}")]
    Io {
        path: Utf8PathBuf,
        #[source]
        err: std::io::Error,
    },

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl From<NetworkError> for Error {
    fn from(err: NetworkError) -> Self {
        Error::Network { reason: err.to_string() }
    }
}

/// How callers should treat an [Error].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ErrorKind {
    /// The request can never succeed as given; do not retry.
    Validation,
    /// The object is absent. Teardown paths tolerate this.
    NotFound,
    /// The backend failed; retrying may help.
    TransientBackend,
}

impl Error {
    pub fn io(path: impl Into<Utf8PathBuf>, err: std::io::Error) -> Self {
        Error::Io { path: path.into(), err }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::InstanceExists { .. }
            | Error::InstanceNotRunning { .. }
            | Error::InvalidBrand { .. }
            | Error::MemoryAlignment { .. }
            | Error::InvalidVolume { .. }
            | Error::VolumeDriverNotFound { .. }
            | Error::ImageUnacceptable { .. }
            | Error::MigrationPreCheck { .. }
            | Error::Resize { .. }
            | Error::NotSupported { .. } => ErrorKind::Validation,

            Error::Storage(
                StorageError::VolumeDriverNotFound { .. }
                | StorageError::MissingField { .. },
            ) => ErrorKind::Validation,

            Error::InstanceNotFound { .. }
            | Error::Volume(VolumeError::NotFound { .. })
            | Error::Image(ImageError::NotFound { .. }) => ErrorKind::NotFound,
            Error::Zone(err) if err.is_not_found() => ErrorKind::NotFound,

            _ => ErrorKind::TransientBackend,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use zone_utils::zone::ErrorCode;

    #[test]
    fn kinds() {
        let err = Error::MemoryAlignment {
            flavor: "kz.small".to_string(),
            memory_mb: 2000,
            alignment_mb: 256,
        };
        assert_eq!(err.kind(), ErrorKind::Validation);
        assert_eq!(
            err.to_string(),
            "Requested flavor, kz.small, memory size 2000 does not align on \
             256MB boundary"
        );

        let err = Error::from(ZoneError::new(
            ErrorCode::ResourceNotFound,
            "no such resource",
        ));
        assert_eq!(err.kind(), ErrorKind::NotFound);

        let err =
            Error::from(ZoneError::new(ErrorCode::CommandError, "boot failed"));
        assert_eq!(err.kind(), ErrorKind::TransientBackend);

        let err = Error::from(StorageError::VolumeDriverNotFound {
            driver: "rbd".to_string(),
        });
        assert_eq!(err.kind(), ErrorKind::Validation);
    }
}
