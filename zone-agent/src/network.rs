// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The networking service protocol, and the anet properties derived from it.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use uuid::Uuid;
use zone_utils::zone::Property;

/// A provider network.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Network {
    pub id: String,
    /// "vlan", "flat", "gre", "local", ...
    pub network_type: String,
    #[serde(default)]
    pub physical_network: Option<String>,
    #[serde(default)]
    pub mtu: u32,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VifDetails {
    /// Datalink the anet is created over.
    #[serde(default)]
    pub phys_interface: Option<String>,
    #[serde(default)]
    pub vlan: Option<u16>,
}

/// A virtual interface of an instance.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Vif {
    pub id: String,
    /// MAC address.
    pub address: String,
    pub network_id: String,
    #[serde(default)]
    pub details: VifDetails,
}

#[derive(thiserror::Error, Debug)]
pub enum NetworkError {
    #[error("Network {id} could not be found")]
    NotFound { id: String },

    #[error("Unsupported network type: {network_type}")]
    UnsupportedType { network_type: String },

    #[error("Failed to determine the {field} for vif '{vif}'")]
    MissingDetail { vif: String, field: &'static str },

    #[error("Failed to {op} vif '{vif}': {err}")]
    Backend {
        op: &'static str,
        vif: String,
        #[source]
        err: anyhow::Error,
    },
}

#[async_trait]
pub trait NetworkApi: Send + Sync {
    async fn network(&self, id: &str) -> Result<Network, NetworkError>;
    async fn plug(&self, instance: Uuid, vifs: &[Vif])
        -> Result<(), NetworkError>;
    async fn unplug(
        &self,
        instance: Uuid,
        vifs: &[Vif],
    ) -> Result<(), NetworkError>;
}

/// Returns the anet properties connecting `vif` to `network`.
///
/// Only "vlan" and "flat" networks can be plumbed; both need a lower link
/// and "vlan" needs a VLAN id.
pub fn anet_properties(
    network: &Network,
    vif: &Vif,
) -> Result<Vec<Property>, NetworkError> {
    let vlan_id = match network.network_type.as_str() {
        "flat" => None,
        "vlan" => Some(vif.details.vlan.filter(|id| *id > 0).ok_or(
            NetworkError::MissingDetail { vif: vif.id.clone(), field: "vlan_id" },
        )?),
        other => {
            return Err(NetworkError::UnsupportedType {
                network_type: other.to_string(),
            })
        }
    };
    let lower_link = vif
        .details
        .phys_interface
        .clone()
        .filter(|link| !link.is_empty())
        .ok_or(NetworkError::MissingDetail {
            vif: vif.id.clone(),
            field: "lower_link",
        })?;

    let mut props = vec![
        Property::new("lower-link", lower_link),
        Property::new("configure-allowed-address", "false"),
        Property::new("mac-address", vif.address.clone()),
    ];
    if network.mtu > 0 {
        props.push(Property::new("mtu", network.mtu.to_string()));
    }
    if let Some(vlan_id) = vlan_id {
        props.push(Property::new("vlan-id", vlan_id.to_string()));
    }
    Ok(props)
}
