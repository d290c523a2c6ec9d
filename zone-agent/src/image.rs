// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The image service protocol and the local image cache.

use crate::Error;
use async_trait::async_trait;
use camino::{Utf8Path, Utf8PathBuf};
use serde::{Deserialize, Serialize};
use slog::Logger;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex};
use zone_utils::archive::ArchiveManager;

/// Image metadata as kept by the image service.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageMeta {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub container_format: Option<String>,
    #[serde(default)]
    pub disk_format: Option<String>,
    #[serde(default)]
    pub properties: BTreeMap<String, String>,
}

impl ImageMeta {
    /// Unified archives are published with the "ovf" container format.
    pub fn is_archive(&self) -> bool {
        self.container_format.as_deref() == Some("ovf")
    }
}

#[derive(thiserror::Error, Debug)]
pub enum ImageError {
    #[error("Image {image_id} could not be found")]
    NotFound { image_id: String },

    #[error("Image {image_id} was rejected: {reason}")]
    Invalid { image_id: String, reason: String },

    #[error("Failed to {op} image '{image_id}': {err}")]
    Backend {
        op: &'static str,
        image_id: String,
        #[source]
        err: anyhow::Error,
    },

    #[error("Image cache I/O error on {path}: {err}")]
    Io {
        path: Utf8PathBuf,
        #[source]
        err: std::io::Error,
    },
}

#[async_trait]
pub trait ImageService: Send + Sync {
    /// Downloads the image data into `dest`.
    async fn fetch(&self, image_id: &str, dest: &Utf8Path)
        -> Result<(), ImageError>;
    async fn show(&self, image_id: &str) -> Result<ImageMeta, ImageError>;
    /// Updates image metadata, uploading `data` when given.
    async fn upload(
        &self,
        image_id: &str,
        meta: &ImageMeta,
        data: Option<&Utf8Path>,
    ) -> Result<(), ImageError>;
}

/// Returns the archive architecture name of this host.
pub fn host_architecture() -> &'static str {
    match std::env::consts::ARCH {
        "sparc" | "sparc64" => "sparc",
        _ => "i386",
    }
}

/// Images downloaded to local disk.
///
/// Downloads and validation of one image id are serialized; unrelated
/// images proceed concurrently.
pub struct ImageCache {
    log: Logger,
    dir: Utf8PathBuf,
    images: Arc<dyn ImageService>,
    locks: Mutex<BTreeMap<String, Arc<tokio::sync::Mutex<()>>>>,
    validated: Mutex<BTreeSet<String>>,
}

impl ImageCache {
    pub fn new(
        log: &Logger,
        dir: Utf8PathBuf,
        images: Arc<dyn ImageService>,
    ) -> Self {
        Self {
            log: log.new(o!("component" => "ImageCache")),
            dir,
            images,
            locks: Mutex::new(BTreeMap::new()),
            validated: Mutex::new(BTreeSet::new()),
        }
    }

    pub fn service(&self) -> &Arc<dyn ImageService> {
        &self.images
    }

    fn lock_for(&self, image_id: &str) -> Arc<tokio::sync::Mutex<()>> {
        self.locks
            .lock()
            .unwrap()
            .entry(image_id.to_string())
            .or_default()
            .clone()
    }

    /// Gives back a lock from [Self::lock_for], forgetting it once nobody
    /// else holds or waits on it.
    fn release(&self, image_id: &str, lock: Arc<tokio::sync::Mutex<()>>) {
        let mut locks = self.locks.lock().unwrap();
        drop(lock);
        if locks.get(image_id).is_some_and(|l| Arc::strong_count(l) == 1) {
            locks.remove(image_id);
        }
    }

    /// Returns the local path of `image_id`, downloading it if needed.
    ///
    /// A leftover partial download is discarded and fetched again.
    pub async fn fetch(
        &self,
        image_id: &str,
    ) -> Result<Utf8PathBuf, ImageError> {
        let io = |path: &Utf8Path| {
            let path = path.to_path_buf();
            move |err: std::io::Error| ImageError::Io { path, err }
        };
        tokio::fs::create_dir_all(&self.dir).await.map_err(io(&self.dir))?;

        let image = self.dir.join(image_id);
        let downloading = self.dir.join(format!("{image_id}.downloading"));

        let lock = self.lock_for(image_id);
        let result = {
            let _guard = lock.lock().await;
            self.fetch_locked(image_id, &image, &downloading).await
        };
        self.release(image_id, lock);
        result
    }

    async fn fetch_locked(
        &self,
        image_id: &str,
        image: &Utf8Path,
        downloading: &Utf8Path,
    ) -> Result<Utf8PathBuf, ImageError> {
        let io = |path: &Utf8Path| {
            let path = path.to_path_buf();
            move |err: std::io::Error| ImageError::Io { path, err }
        };
        if tokio::fs::try_exists(downloading).await.unwrap_or(false) {
            debug!(
                self.log,
                "cleaning partial download";
                "image" => image_id,
            );
            tokio::fs::remove_file(downloading)
                .await
                .map_err(io(downloading))?;
        } else if tokio::fs::try_exists(image).await.unwrap_or(false) {
            debug!(self.log, "using cached image"; "image" => image_id);
            return Ok(image.to_path_buf());
        }

        info!(self.log, "fetching image"; "image" => image_id);
        self.images.fetch(image_id, downloading).await?;
        tokio::fs::rename(downloading, image).await.map_err(io(image))?;
        Ok(image.to_path_buf())
    }

    /// Checks that the archive at `path` can be installed on this host: it
    /// must hold exactly one deployable, root-only system of this host's
    /// architecture. Images which pass are remembered and not checked again.
    pub async fn validate_archive(
        &self,
        image_id: &str,
        path: &Utf8Path,
        archives: &dyn ArchiveManager,
        host_arch: &str,
    ) -> Result<(), Error> {
        let lock = self.lock_for(image_id);
        let result = {
            let _guard = lock.lock().await;
            self.validate_locked(image_id, path, archives, host_arch).await
        };
        self.release(image_id, lock);
        result
    }

    async fn validate_locked(
        &self,
        image_id: &str,
        path: &Utf8Path,
        archives: &dyn ArchiveManager,
        host_arch: &str,
    ) -> Result<(), Error> {
        if self.validated.lock().unwrap().contains(image_id) {
            return Ok(());
        }

        let unacceptable = |reason: String| Error::ImageUnacceptable {
            image_id: image_id.to_string(),
            reason,
        };
        let info = archives
            .describe(path)
            .await
            .map_err(|err| unacceptable(err.to_string()))?;

        let [system] = info.systems.as_slice() else {
            return Err(unacceptable(
                "Image must contain only a single deployable system."
                    .to_string(),
            ));
        };
        if !info.architecture.eq_ignore_ascii_case(host_arch) {
            let mut reason = format!(
                "Unified Archive architecture '{}' is incompatible with this \
                 compute host's architecture, '{host_arch}'.",
                info.architecture,
            );
            let meta = self.images.show(image_id).await.ok();
            if meta.is_some_and(|m| !m.properties.contains_key("architecture"))
            {
                reason.push_str(
                    " The 'architecture' property is not set on the image.",
                );
            }
            return Err(unacceptable(reason));
        }
        if !system.root_only {
            return Err(unacceptable(
                "Image contains more than one ZFS pool.".to_string(),
            ));
        }

        self.validated.lock().unwrap().insert(image_id.to_string());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fakes::archive::FakeArchiveManager;
    use crate::fakes::image::FakeImageService;
    use camino_tempfile::Utf8TempDir;
    use zone_utils::archive::{ArchiveInfo, ArchivedSystem};
    use zone_utils::test_log;

    fn archive(arch: &str, systems: &[(&str, bool)]) -> ArchiveInfo {
        ArchiveInfo {
            architecture: arch.to_string(),
            systems: systems
                .iter()
                .map(|(name, root_only)| ArchivedSystem {
                    name: name.to_string(),
                    root_only: *root_only,
                })
                .collect(),
        }
    }

    #[tokio::test]
    async fn fetch_caches_downloads() {
        let log = test_log("fetch_caches_downloads");
        let dir = Utf8TempDir::new().unwrap();
        let images = FakeImageService::new();
        images.insert(
            ImageMeta { id: "img-1".to_string(), ..Default::default() },
            b"archive",
        );
        let cache =
            ImageCache::new(&log, dir.path().join("images"), images.clone());

        let path = cache.fetch("img-1").await.unwrap();
        assert_eq!(std::fs::read(&path).unwrap(), b"archive");
        cache.fetch("img-1").await.unwrap();
        assert_eq!(images.fetches("img-1"), 1);

        // A partial download is thrown away and retried.
        std::fs::write(
            dir.path().join("images").join("img-1.downloading"),
            b"partial",
        )
        .unwrap();
        cache.fetch("img-1").await.unwrap();
        assert_eq!(images.fetches("img-1"), 2);

        let err = cache.fetch("img-2").await.unwrap_err();
        assert!(matches!(err, ImageError::NotFound { .. }));
    }

    #[tokio::test]
    async fn archive_validation() {
        let log = test_log("archive_validation");
        let dir = Utf8TempDir::new().unwrap();
        let images = FakeImageService::new();
        let cache = ImageCache::new(&log, dir.path().into(), images.clone());
        let archives = FakeArchiveManager::new();
        let path = Utf8Path::new("/images/img-1");

        archives.set_info(path, archive("i386", &[("a", true), ("b", true)]));
        let err = cache
            .validate_archive("img-1", path, &*archives, "i386")
            .await
            .unwrap_err();
        assert!(err.to_string().contains("single deployable system"));

        archives.set_info(path, archive("sparc", &[("a", true)]));
        let err = cache
            .validate_archive("img-1", path, &*archives, "i386")
            .await
            .unwrap_err();
        assert!(matches!(err, Error::ImageUnacceptable { .. }));
        assert!(err.to_string().contains("incompatible"));

        archives.set_info(path, archive("i386", &[("a", false)]));
        let err = cache
            .validate_archive("img-1", path, &*archives, "i386")
            .await
            .unwrap_err();
        assert!(err.to_string().contains("more than one ZFS pool"));

        archives.set_info(path, archive("i386", &[("a", true)]));
        cache
            .validate_archive("img-1", path, &*archives, "i386")
            .await
            .unwrap();
        // Remembered: a now-broken archive is not described again.
        archives.set_info(path, archive("sparc", &[]));
        cache
            .validate_archive("img-1", path, &*archives, "i386")
            .await
            .unwrap();
        assert_eq!(archives.describes(path), 4);
        assert!(cache.locks.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn image_locks_are_dropped_when_idle() {
        let log = test_log("image_locks_are_dropped_when_idle");
        let dir = Utf8TempDir::new().unwrap();
        let images = FakeImageService::new();
        images.insert(
            ImageMeta { id: "img-1".to_string(), ..Default::default() },
            b"archive",
        );
        let cache = ImageCache::new(&log, dir.path().into(), images.clone());

        let (a, b) = tokio::join!(cache.fetch("img-1"), cache.fetch("img-1"));
        assert_eq!(a.unwrap(), b.unwrap());
        assert_eq!(images.fetches("img-1"), 1);
        assert!(cache.locks.lock().unwrap().is_empty());

        // Someone else still holds the lock, so it stays.
        let held = cache.lock_for("img-1");
        cache.fetch("img-1").await.unwrap();
        assert!(cache.locks.lock().unwrap().contains_key("img-1"));
        cache.release("img-1", held);
        assert!(cache.locks.lock().unwrap().is_empty());

        cache.fetch("img-2").await.unwrap_err();
        assert!(cache.locks.lock().unwrap().is_empty());
    }
}
