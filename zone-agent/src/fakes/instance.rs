// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use crate::instance::{Instance, InstanceStore, StoreError};
use async_trait::async_trait;
use std::sync::{Arc, Mutex};

/// Keeps every saved copy of an instance.
#[derive(Default)]
pub struct FakeInstanceStore {
    saved: Mutex<Vec<Instance>>,
}

impl FakeInstanceStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn saves(&self) -> usize {
        self.saved.lock().unwrap().len()
    }

    pub fn last(&self) -> Option<Instance> {
        self.saved.lock().unwrap().last().cloned()
    }
}

#[async_trait]
impl InstanceStore for FakeInstanceStore {
    async fn save(&self, instance: &Instance) -> Result<(), StoreError> {
        self.saved.lock().unwrap().push(instance.clone());
        Ok(())
    }
}
