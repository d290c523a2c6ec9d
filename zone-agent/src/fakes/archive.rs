// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use async_trait::async_trait;
use camino::{Utf8Path, Utf8PathBuf};
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use zone_utils::archive::{ArchiveError, ArchiveInfo, ArchiveManager};

#[derive(Default)]
struct Inner {
    infos: BTreeMap<Utf8PathBuf, ArchiveInfo>,
    describes: BTreeMap<Utf8PathBuf, usize>,
    created: Vec<(String, Utf8PathBuf)>,
}

/// Serves canned archive descriptions and writes placeholder archives.
#[derive(Default)]
pub struct FakeArchiveManager {
    inner: Mutex<Inner>,
}

impl FakeArchiveManager {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn set_info(&self, path: &Utf8Path, info: ArchiveInfo) {
        self.inner.lock().unwrap().infos.insert(path.to_path_buf(), info);
    }

    pub fn describes(&self, path: &Utf8Path) -> usize {
        self.inner
            .lock()
            .unwrap()
            .describes
            .get(path)
            .copied()
            .unwrap_or(0)
    }

    /// (zone, path) of every archive created.
    pub fn created(&self) -> Vec<(String, Utf8PathBuf)> {
        self.inner.lock().unwrap().created.clone()
    }
}

#[async_trait]
impl ArchiveManager for FakeArchiveManager {
    async fn describe(
        &self,
        path: &Utf8Path,
    ) -> Result<ArchiveInfo, ArchiveError> {
        let mut inner = self.inner.lock().unwrap();
        *inner.describes.entry(path.to_path_buf()).or_default() += 1;
        inner.infos.get(path).cloned().ok_or_else(|| ArchiveError::Parse {
            path: path.to_string(),
            reason: "not an archive".to_string(),
        })
    }

    async fn create_root_only(
        &self,
        zone: &str,
        path: &Utf8Path,
    ) -> Result<(), ArchiveError> {
        std::fs::write(path, zone).map_err(|err| ArchiveError::Parse {
            path: path.to_string(),
            reason: err.to_string(),
        })?;
        self.inner
            .lock()
            .unwrap()
            .created
            .push((zone.to_string(), path.to_path_buf()));
        Ok(())
    }
}
