// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Interfaces for working with zone agent configuration

use camino::{Utf8Path, Utf8PathBuf};
use serde::Deserialize;
use slog::Drain;
use std::fs::OpenOptions;

/// Configuration for a zone agent
#[derive(Clone, Debug, Deserialize)]
pub struct Config {
    /// Configuration for the zone agent log
    pub log: LogConfig,
    pub host: HostConfig,
    #[serde(default)]
    pub zones: ZonesConfig,
}

/// Severity below which log records are dropped.
#[derive(Clone, Copy, Debug, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Trace,
    Debug,
    #[default]
    Info,
    Warn,
    Error,
    Critical,
}

impl From<LogLevel> for slog::Level {
    fn from(level: LogLevel) -> Self {
        match level {
            LogLevel::Trace => slog::Level::Trace,
            LogLevel::Debug => slog::Level::Debug,
            LogLevel::Info => slog::Level::Info,
            LogLevel::Warn => slog::Level::Warning,
            LogLevel::Error => slog::Level::Error,
            LogLevel::Critical => slog::Level::Critical,
        }
    }
}

/// Where log records go.
#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
#[serde(tag = "mode", rename_all = "kebab-case")]
pub enum LogConfig {
    StderrTerminal {
        #[serde(default)]
        level: LogLevel,
    },
    File {
        #[serde(default)]
        level: LogLevel,
        path: Utf8PathBuf,
    },
}

/// Identity and local paths of this compute host.
#[derive(Clone, Debug, Deserialize)]
pub struct HostConfig {
    pub host: String,
    pub my_ip: String,
    #[serde(default = "default_instances_path")]
    pub instances_path: Utf8PathBuf,
    #[serde(default = "default_state_path")]
    pub state_path: Utf8PathBuf,
}

fn default_instances_path() -> Utf8PathBuf {
    "/var/lib/nova/instances".into()
}

fn default_state_path() -> Utf8PathBuf {
    "/var/lib/nova".into()
}

/// Zone-specific tunables.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct ZonesConfig {
    /// Volume type used for boot volumes created on behalf of instances.
    pub boot_volume_type: Option<String>,
    /// Availability zone used for boot volumes.
    pub boot_volume_az: Option<String>,
    /// Where downloaded images are cached.
    pub glancecache_dirname: Utf8PathBuf,
    /// Owner of NFS-backed storage URIs; defaults to this process's uid.
    pub nfs_username: Option<String>,
    /// Group of NFS-backed storage URIs; defaults to this process's gid.
    pub nfs_groupname: Option<String>,
    /// Cipher passed to `zoneadm migrate -c`.
    pub live_migration_cipher: Option<String>,
    /// Where snapshot archives are staged; defaults to
    /// `{instances_path}/snapshots`.
    pub snapshots_directory: Option<Utf8PathBuf>,
    /// Directory holding suspend images of kernel zones.
    pub zones_suspend_path: Utf8PathBuf,
    /// Whether `bootargs` instance metadata is passed to the zone at boot.
    pub boot_options: bool,
    pub console_log_dir: Utf8PathBuf,
    pub configdrive_dir: Utf8PathBuf,
}

impl Default for ZonesConfig {
    fn default() -> Self {
        Self {
            boot_volume_type: None,
            boot_volume_az: None,
            glancecache_dirname: "/var/share/nova/images".into(),
            nfs_username: None,
            nfs_groupname: None,
            live_migration_cipher: None,
            snapshots_directory: None,
            zones_suspend_path: "/var/share/zones/SYSsuspend".into(),
            boot_options: true,
            console_log_dir: "/var/log/zones".into(),
            configdrive_dir: "/var/share/nova/configdrives".into(),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config from {path}: {err}")]
    Io {
        path: Utf8PathBuf,
        #[source]
        err: std::io::Error,
    },
    #[error("Failed to parse config from {path}: {err}")]
    Parse {
        path: Utf8PathBuf,
        #[source]
        err: toml::de::Error,
    },
    #[error("Failed to open log file {path}: {err}")]
    LogFile {
        path: Utf8PathBuf,
        #[source]
        err: std::io::Error,
    },
}

impl Config {
    pub fn from_file<P: AsRef<Utf8Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)
            .map_err(|err| ConfigError::Io { path: path.into(), err })?;
        let config = toml::from_str(&contents)
            .map_err(|err| ConfigError::Parse { path: path.into(), err })?;
        Ok(config)
    }

    pub fn snapshots_directory(&self) -> Utf8PathBuf {
        self.zones
            .snapshots_directory
            .clone()
            .unwrap_or_else(|| self.host.instances_path.join("snapshots"))
    }

    /// Returns the per-instance directory under `instances_path`.
    pub fn instance_dir(&self, uuid: &str) -> Utf8PathBuf {
        self.host.instances_path.join(uuid)
    }

    /// Returns the path of the config drive image of instance `name`.
    pub fn configdrive_path(&self, name: &str) -> Utf8PathBuf {
        self.zones.configdrive_dir.join(format!("config_drive-{name}"))
    }
}

impl LogConfig {
    /// Builds the root logger described by this configuration.
    pub fn to_logger(&self, name: &str) -> Result<slog::Logger, ConfigError> {
        match self {
            LogConfig::StderrTerminal { level } => {
                let decorator = slog_term::TermDecorator::new().stderr().build();
                let drain = slog_term::FullFormat::new(decorator).build().fuse();
                Ok(async_logger(drain, *level, name))
            }
            LogConfig::File { level, path } => {
                let file = OpenOptions::new()
                    .create(true)
                    .append(true)
                    .open(path)
                    .map_err(|err| ConfigError::LogFile {
                        path: path.clone(),
                        err,
                    })?;
                let decorator = slog_term::PlainDecorator::new(file);
                let drain = slog_term::FullFormat::new(decorator).build().fuse();
                Ok(async_logger(drain, *level, name))
            }
        }
    }
}

fn async_logger<D>(drain: D, level: LogLevel, name: &str) -> slog::Logger
where
    D: Drain<Ok = (), Err = slog::Never> + Send + 'static,
{
    let drain = slog_async::Async::new(drain).build().fuse();
    let drain = slog::LevelFilter::new(drain, level.into()).fuse();
    slog::Logger::root(drain, o!("name" => name.to_string()))
}
