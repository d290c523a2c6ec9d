// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use crate::network::{Network, NetworkApi, NetworkError, Vif};
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use uuid::Uuid;

#[derive(Default)]
struct Inner {
    networks: BTreeMap<String, Network>,
    calls: Vec<String>,
}

/// A networking service with a fixed set of networks.
#[derive(Default)]
pub struct FakeNetworkApi {
    inner: Mutex<Inner>,
}

impl FakeNetworkApi {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn insert(&self, network: Network) {
        self.inner
            .lock()
            .unwrap()
            .networks
            .insert(network.id.clone(), network);
    }

    /// Plug and unplug calls, as "plug vif-id".
    pub fn calls(&self) -> Vec<String> {
        self.inner.lock().unwrap().calls.clone()
    }

    fn record(&self, op: &str, vifs: &[Vif]) {
        let mut inner = self.inner.lock().unwrap();
        for vif in vifs {
            inner.calls.push(format!("{op} {}", vif.id));
        }
    }
}

#[async_trait]
impl NetworkApi for FakeNetworkApi {
    async fn network(&self, id: &str) -> Result<Network, NetworkError> {
        self.inner
            .lock()
            .unwrap()
            .networks
            .get(id)
            .cloned()
            .ok_or_else(|| NetworkError::NotFound { id: id.to_string() })
    }

    async fn plug(
        &self,
        _instance: Uuid,
        vifs: &[Vif],
    ) -> Result<(), NetworkError> {
        self.record("plug", vifs);
        Ok(())
    }

    async fn unplug(
        &self,
        _instance: Uuid,
        vifs: &[Vif],
    ) -> Result<(), NetworkError> {
        self.record("unplug", vifs);
        Ok(())
    }
}
