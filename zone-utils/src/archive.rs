// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Inspecting and creating unified archives.

use crate::executor::{run, Executor};
use crate::{ExecutionError, ARCHIVEADM};

use async_trait::async_trait;
use camino::Utf8Path;
use std::sync::Arc;

/// A system captured in an archive.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ArchivedSystem {
    pub name: String,
    pub root_only: bool,
}

/// The parts of `archiveadm info -v` used to vet an archive.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ArchiveInfo {
    pub architecture: String,
    pub systems: Vec<ArchivedSystem>,
}

#[derive(thiserror::Error, Debug)]
pub enum ArchiveError {
    #[error("Failed to {op} archive '{path}': {err}")]
    Execution {
        op: &'static str,
        path: String,
        #[source]
        err: ExecutionError,
    },

    #[error("Cannot describe archive '{path}': {reason}")]
    Parse { path: String, reason: String },
}

#[async_trait]
pub trait ArchiveManager: Send + Sync {
    async fn describe(&self, path: &Utf8Path)
        -> Result<ArchiveInfo, ArchiveError>;

    /// Archives the root pool of `zone` into `path`.
    async fn create_root_only(
        &self,
        zone: &str,
        path: &Utf8Path,
    ) -> Result<(), ArchiveError>;
}

/// Parses `archiveadm info -v` output.
pub fn parse_archive_info(text: &str) -> Result<ArchiveInfo, String> {
    let mut architecture = None;
    let mut systems: Vec<ArchivedSystem> = vec![];
    let mut in_systems = false;
    for line in text.lines().map(str::trim) {
        if let Some(arch) = line.strip_prefix("Architecture:") {
            architecture = Some(arch.trim().to_string());
        } else if line == "Deployable Systems" {
            in_systems = true;
        } else if in_systems && line.starts_with('\'') && line.ends_with('\'')
        {
            systems.push(ArchivedSystem {
                name: line.trim_matches('\'').to_string(),
                root_only: false,
            });
        } else if let Some(root_only) = line.strip_prefix("Root-only:") {
            if let Some(system) = systems.last_mut() {
                system.root_only = root_only.trim().eq_ignore_ascii_case("yes");
            }
        }
    }
    Ok(ArchiveInfo {
        architecture: architecture.ok_or("no architecture listed")?,
        systems,
    })
}

/// Manages archives with `archiveadm`.
pub struct Archiveadm {
    executor: Arc<dyn Executor>,
}

impl Archiveadm {
    pub fn new(executor: Arc<dyn Executor>) -> Self {
        Self { executor }
    }
}

#[async_trait]
impl ArchiveManager for Archiveadm {
    async fn describe(
        &self,
        path: &Utf8Path,
    ) -> Result<ArchiveInfo, ArchiveError> {
        let output =
            run(&*self.executor, ARCHIVEADM, ["info", "-v", path.as_str()])
                .await
                .map_err(|err| ArchiveError::Execution {
                    op: "describe",
                    path: path.to_string(),
                    err,
                })?;
        parse_archive_info(&String::from_utf8_lossy(&output.stdout)).map_err(
            |reason| ArchiveError::Parse { path: path.to_string(), reason },
        )
    }

    async fn create_root_only(
        &self,
        zone: &str,
        path: &Utf8Path,
    ) -> Result<(), ArchiveError> {
        run(
            &*self.executor,
            ARCHIVEADM,
            ["create", "--root-only", "-z", zone, path.as_str()],
        )
        .await
        .map_err(|err| ArchiveError::Execution {
            op: "create",
            path: path.to_string(),
            err,
        })?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_info() {
        let info = parse_archive_info(
            "\
Archive Information
          Creation Time:  2015-03-02T21:55:25Z
            Source Host:  build
           Architecture:  sparc
       Operating System:  Oracle Solaris 11.3 SPARC
       Deployable Systems
           'kz1'
             OS Version:  0.5.11
              OS Branch:  0.175.3.0.0.17.0
              Active BE:  solaris
                  Brand:  solaris-kz
                Root-only:  Yes
",
        )
        .unwrap();
        assert_eq!(info.architecture, "sparc");
        assert_eq!(
            info.systems,
            vec![ArchivedSystem { name: "kz1".to_string(), root_only: true }]
        );

        assert!(parse_archive_info("Archive Information\n").is_err());
    }
}
