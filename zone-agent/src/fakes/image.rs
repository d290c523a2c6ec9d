// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use crate::image::{ImageError, ImageMeta, ImageService};
use async_trait::async_trait;
use camino::Utf8Path;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex};

#[derive(Default)]
struct Inner {
    images: BTreeMap<String, (ImageMeta, Vec<u8>)>,
    fetches: BTreeMap<String, usize>,
    uploads: Vec<(String, ImageMeta, Option<Vec<u8>>)>,
    rejected_formats: BTreeSet<String>,
}

/// An image service holding image data in memory.
#[derive(Default)]
pub struct FakeImageService {
    inner: Mutex<Inner>,
}

impl FakeImageService {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn insert(&self, meta: ImageMeta, data: &[u8]) {
        self.inner
            .lock()
            .unwrap()
            .images
            .insert(meta.id.clone(), (meta, data.to_vec()));
    }

    /// Makes uploads declaring `container_format` fail as invalid.
    pub fn reject_container_format(&self, container_format: &str) {
        self.inner
            .lock()
            .unwrap()
            .rejected_formats
            .insert(container_format.to_string());
    }

    pub fn fetches(&self, image_id: &str) -> usize {
        self.inner
            .lock()
            .unwrap()
            .fetches
            .get(image_id)
            .copied()
            .unwrap_or(0)
    }

    pub fn uploads(&self) -> Vec<(String, ImageMeta, Option<Vec<u8>>)> {
        self.inner.lock().unwrap().uploads.clone()
    }
}

#[async_trait]
impl ImageService for FakeImageService {
    async fn fetch(
        &self,
        image_id: &str,
        dest: &Utf8Path,
    ) -> Result<(), ImageError> {
        let data = {
            let mut inner = self.inner.lock().unwrap();
            *inner.fetches.entry(image_id.to_string()).or_default() += 1;
            inner.images.get(image_id).map(|(_, data)| data.clone()).ok_or_else(
                || ImageError::NotFound { image_id: image_id.to_string() },
            )?
        };
        std::fs::write(dest, data)
            .map_err(|err| ImageError::Io { path: dest.to_path_buf(), err })
    }

    async fn show(&self, image_id: &str) -> Result<ImageMeta, ImageError> {
        self.inner
            .lock()
            .unwrap()
            .images
            .get(image_id)
            .map(|(meta, _)| meta.clone())
            .ok_or_else(|| ImageError::NotFound {
                image_id: image_id.to_string(),
            })
    }

    async fn upload(
        &self,
        image_id: &str,
        meta: &ImageMeta,
        data: Option<&Utf8Path>,
    ) -> Result<(), ImageError> {
        let data = data
            .map(std::fs::read)
            .transpose()
            .map_err(|err| ImageError::Backend {
                op: "upload",
                image_id: image_id.to_string(),
                err: err.into(),
            })?;
        let mut inner = self.inner.lock().unwrap();
        if let Some(format) = &meta.container_format {
            if inner.rejected_formats.contains(format) {
                return Err(ImageError::Invalid {
                    image_id: image_id.to_string(),
                    reason: format!("unknown container format '{format}'"),
                });
            }
        }
        inner.uploads.push((image_id.to_string(), meta.clone(), data));
        Ok(())
    }
}
