// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! A kstat reader serving canned data.

use crate::kstat::{KstatData, KstatReader, StatError};

use async_trait::async_trait;
use std::collections::{BTreeMap, VecDeque};
use std::sync::{Arc, Mutex};

#[derive(Default)]
struct Inner {
    fixed: BTreeMap<String, KstatData>,
    sequences: BTreeMap<String, VecDeque<KstatData>>,
    reads: BTreeMap<String, usize>,
}

/// Serves kstats by URI.
///
/// A URI given a sequence returns successive entries on each read, then
/// keeps returning the last one.
#[derive(Default)]
pub struct FakeKstat {
    inner: Mutex<Inner>,
}

impl FakeKstat {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn insert(&self, uri: &str, data: KstatData) {
        self.inner.lock().unwrap().fixed.insert(uri.to_string(), data);
    }

    pub fn set_sequence(&self, uri: &str, data: Vec<KstatData>) {
        self.inner
            .lock()
            .unwrap()
            .sequences
            .insert(uri.to_string(), data.into());
    }

    /// Number of reads of `uri` so far.
    pub fn reads(&self, uri: &str) -> usize {
        self.inner.lock().unwrap().reads.get(uri).copied().unwrap_or(0)
    }
}

#[async_trait]
impl KstatReader for FakeKstat {
    async fn read(&self, uri: &str) -> Result<Option<KstatData>, StatError> {
        let mut inner = self.inner.lock().unwrap();
        *inner.reads.entry(uri.to_string()).or_default() += 1;
        if let Some(queue) = inner.sequences.get_mut(uri) {
            let data = if queue.len() > 1 {
                queue.pop_front()
            } else {
                queue.front().cloned()
            };
            return Ok(data);
        }
        Ok(inner.fixed.get(uri).cloned())
    }
}
