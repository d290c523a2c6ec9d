// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Zone configuration of devices: boot and data volumes, network
//! interfaces, CPU and memory caps.

use crate::instance::{device_index, sysmeta, Instance};
use crate::network::{anet_properties, Vif};
use crate::volume::{wait_for_volume, Volume, VolumeCreate};
use crate::{Error, ZoneDriver};

use slog_error_chain::InlineErrorChain;
use zone_utils::storage::{ConnectionInfo, DriverKind, VolumeConnector};
use zone_utils::transaction::ConfigTransaction;
use zone_utils::zone::{
    lookup_resource_property_value, Brand, Property, Resource, State,
};

/// Properties restored on a device whose detach could not be applied.
const DEVICE_RESTORE_PROPERTIES: &[&str] = &["storage", "bootpri"];

/// Properties restored on an anet whose detach could not be applied, in
/// addition to its naming property.
const ANET_RESTORE_PROPERTIES: &[&str] =
    &["lower-link", "configure-allowed-address", "mac-address", "mtu"];

fn device_filter(uri: &str) -> Resource {
    Resource::new("device", vec![Property::new("storage", uri)])
}

fn mac_filter(mac: &str) -> Resource {
    Resource::new("anet", vec![Property::new("mac-address", mac)])
}

fn retain_properties(resource: &Resource, names: &[&str]) -> Resource {
    Resource::new(
        resource.kind.clone(),
        resource
            .properties
            .iter()
            .filter(|p| names.contains(&p.name.as_str()))
            .cloned()
            .collect(),
    )
}

impl ZoneDriver {
    /// Copies the flavor's `zonecfg:` extra specs and the recorded host id
    /// into the global resource.
    pub(crate) async fn set_global_properties(
        &self,
        txn: &ConfigTransaction,
        instance: &Instance,
        brand: Brand,
    ) -> Result<(), Error> {
        let global = Resource::kind("global");
        for (prop, value) in instance.flavor.zonecfg_properties() {
            if prop == "brand" {
                continue;
            }
            if !brand.allows_global_property(prop) {
                warn!(
                    self.log,
                    "ignoring unsupported zone property";
                    "instance" => &instance.name,
                    "property" => prop,
                    "brand" => %brand,
                );
                continue;
            }
            txn.set_property(&global, prop, value).await?;
        }
        if let Some(hostid) = instance.sysmeta(sysmeta::HOSTID) {
            txn.set_property(&global, "hostid", hostid).await?;
        }
        Ok(())
    }

    /// Points the zone's boot device at the volume described by `info`.
    pub(crate) async fn set_boot_device(
        &self,
        txn: &ConfigTransaction,
        brand: Brand,
        info: &ConnectionInfo,
        mountpoint: &str,
    ) -> Result<(), Error> {
        let uri = self.storage.resolve_storage_uri(info).await?;
        debug!(
            self.log,
            "setting boot device";
            "zone" => txn.zone(),
            "uri" => &uri,
        );
        match brand {
            Brand::Kernel => {
                let boot = Resource::new(
                    "device",
                    vec![
                        Property::new("bootpri", "0"),
                        Property::new("id", device_index(mountpoint).to_string()),
                    ],
                );
                txn.set_property(&boot, "storage", &uri).await?;
            }
            Brand::Native => {
                let rootzpool = Resource::new(
                    "rootzpool",
                    vec![Property::list("storage", vec![uri])],
                );
                txn.add_resource(&rootzpool, true).await?;
            }
        }
        Ok(())
    }

    pub(crate) async fn set_num_cpu(
        &self,
        txn: &ConfigTransaction,
        brand: Brand,
        vcpus: u32,
    ) -> Result<(), Error> {
        let cpu = Resource::kind(brand.capabilities().cpu_resource);
        txn.set_property(&cpu, "ncpus", &vcpus.to_string()).await?;
        Ok(())
    }

    pub(crate) async fn set_memory_cap(
        &self,
        txn: &ConfigTransaction,
        brand: Brand,
        memory_mb: u64,
    ) -> Result<(), Error> {
        txn.set_property(
            &Resource::kind("capped-memory"),
            brand.capabilities().memory_cap_property,
            &format!("{memory_mb}M"),
        )
        .await?;
        Ok(())
    }

    /// Configures one anet per interface. The brand template's anet is
    /// reused for the first interface, or removed when there are none.
    pub(crate) async fn set_network(
        &self,
        txn: &ConfigTransaction,
        brand: Brand,
        vifs: &[Vif],
    ) -> Result<(), Error> {
        let caps = brand.capabilities();
        let (key, value) = caps.default_anet;
        let default_anet =
            Resource::new("anet", vec![Property::new(key, value)]);
        if vifs.is_empty() {
            txn.remove_resources(&default_anet).await?;
            return Ok(());
        }

        for (index, vif) in vifs.iter().enumerate() {
            let network = self.networks.network(&vif.network_id).await?;
            let props = anet_properties(&network, vif)?;
            if index == 0 {
                for prop in &props {
                    txn.set_property(&default_anet, &prop.name, &prop.value())
                        .await?;
                }
            } else {
                let mut anet_props =
                    vec![anet_name_property(brand, index)];
                anet_props.extend(props);
                txn.add_resource(&Resource::new("anet", anet_props), false)
                    .await?;
            }
            debug!(
                self.log,
                "configured anet";
                "zone" => txn.zone(),
                "vif" => &vif.id,
                "link" => anet_link(brand, index),
            );
        }
        Ok(())
    }

    pub(crate) async fn set_configdrive(
        &self,
        txn: &ConfigTransaction,
        name: &str,
    ) -> Result<(), Error> {
        let path = self.config.configdrive_path(name);
        let device = Resource::new(
            "device",
            vec![Property::new("storage", format!("file://root:root@{path}"))],
        );
        txn.add_resource(&device, false).await?;
        Ok(())
    }

    /// Adds a data volume device at `mountpoint`, returning its resource.
    pub(crate) async fn add_volume_device(
        &self,
        txn: &ConfigTransaction,
        brand: Brand,
        info: &ConnectionInfo,
        mountpoint: &str,
    ) -> Result<Resource, Error> {
        if !brand.capabilities().supports_volume_hotplug {
            return Err(Error::NotSupported {
                what: format!("attaching volumes to '{brand}' branded zones"),
            });
        }
        let uri = self.storage.resolve_storage_uri(info).await?;
        let device = Resource::new(
            "device",
            vec![
                Property::new("storage", uri),
                Property::new("id", device_index(mountpoint).to_string()),
            ],
        );
        txn.add_resource(&device, false).await?;
        Ok(device)
    }

    /// Attaches a data volume at `mountpoint`, applying the change to a
    /// running zone.
    pub async fn attach_volume(
        &self,
        instance: &Instance,
        info: &ConnectionInfo,
        mountpoint: &str,
    ) -> Result<(), Error> {
        let zone = self.zone(&instance.name).await?;
        let brand = self.flavor_brand(instance)?;

        let txn = self.transaction(&instance.name).await?;
        let result = self.add_volume_device(&txn, brand, info, mountpoint).await;
        let device = txn.end(result).await?;

        if zone.state == State::Running {
            if let Err(err) = self.backend().await?.apply(&instance.name).await
            {
                error!(
                    self.log,
                    "unable to apply volume attach";
                    "instance" => &instance.name,
                    "mountpoint" => mountpoint,
                    "reason" => %err,
                );
                let txn = self.transaction(&instance.name).await?;
                let result = txn.remove_resources(&device).await;
                txn.end(result).await?;
                return Err(err.into());
            }
        }
        info!(
            self.log,
            "attached volume";
            "instance" => &instance.name,
            "mountpoint" => mountpoint,
        );
        Ok(())
    }

    /// Detaches a data volume. A volume which is not attached is left
    /// alone.
    pub async fn detach_volume(
        &self,
        instance: &Instance,
        info: &ConnectionInfo,
    ) -> Result<(), Error> {
        let zone = self.zone(&instance.name).await?;
        let brand = self.flavor_brand(instance)?;
        if !brand.capabilities().supports_volume_hotplug {
            return Err(Error::NotSupported {
                what: format!("detaching volumes from '{brand}' branded zones"),
            });
        }

        let uri = self.storage.resolve_storage_uri(info).await?;
        let zones = self.backend().await?;
        let Some(device) = lookup_resource_property_value(
            &*zones,
            &instance.name,
            "device",
            "storage",
            &uri,
        )
        .await?
        else {
            warn!(
                self.log,
                "storage resource is not attached to instance";
                "instance" => &instance.name,
                "uri" => &uri,
            );
            return Ok(());
        };

        let txn = self.transaction(&instance.name).await?;
        let result = txn.remove_resources(&device_filter(&uri)).await;
        txn.end(result).await?;

        if zone.state == State::Running {
            if let Err(err) = zones.apply(&instance.name).await {
                error!(
                    self.log,
                    "unable to apply volume detach; resource is most likely \
                     in use";
                    "instance" => &instance.name,
                    "uri" => &uri,
                    "reason" => %err,
                );
                let restored =
                    retain_properties(&device, DEVICE_RESTORE_PROPERTIES);
                let txn = self.transaction(&instance.name).await?;
                let result = txn.add_resource(&restored, false).await;
                txn.end(result).await?;
                return Err(err.into());
            }
        }
        Ok(())
    }

    /// Adds a network interface, hotplugging it into an active instance.
    pub async fn attach_interface(
        &self,
        instance: &Instance,
        vif: &Vif,
    ) -> Result<(), Error> {
        self.zone(&instance.name).await?;
        let brand = self.flavor_brand(instance)?;
        let network = self.networks.network(&vif.network_id).await?;
        let props = anet_properties(&network, vif)?;

        let txn = self.transaction(&instance.name).await?;
        let result = async {
            let index = self.next_anet_index(&txn, brand).await?;
            let mut anet_props = vec![anet_name_property(brand, index)];
            anet_props.extend(props);
            txn.add_resource(&Resource::new("anet", anet_props), false).await?;
            Ok::<_, Error>(anet_link(brand, index))
        }
        .await;
        let link = txn.end(result).await?;

        if !instance.is_active() {
            return Ok(());
        }
        if let Err(err) = self.backend().await?.apply(&instance.name).await {
            let reason = format!(
                "Unable to attach interface to instance '{}': {err}",
                instance.name
            );
            let txn = self.transaction(&instance.name).await?;
            let result = txn.remove_resources(&mac_filter(&vif.address)).await;
            if let Err(cleanup) = txn.end(result).await {
                self.log_cleanup_failure(
                    "remove anet",
                    &instance.name,
                    &cleanup.into(),
                );
            }
            return Err(Error::Network { reason });
        }
        self.networks.plug(instance.uuid, std::slice::from_ref(vif)).await?;
        info!(
            self.log,
            "attached interface";
            "instance" => &instance.name,
            "link" => link,
            "mac" => &vif.address,
        );
        Ok(())
    }

    /// Removes a network interface, hot-unplugging it from an active
    /// instance.
    pub async fn detach_interface(
        &self,
        instance: &Instance,
        vif: &Vif,
    ) -> Result<(), Error> {
        self.zone(&instance.name).await?;
        let zones = self.backend().await?;
        let Some(anet) = lookup_resource_property_value(
            &*zones,
            &instance.name,
            "anet",
            "mac-address",
            &vif.address,
        )
        .await?
        else {
            return Err(Error::Network {
                reason: format!(
                    "Interface with MAC address '{}' is not attached to \
                     instance '{}'.",
                    vif.address, instance.name
                ),
            });
        };
        let brand = self.flavor_brand(instance)?;
        let name_property = brand.capabilities().anet_name_property;
        let link = anet
            .property(name_property)
            .map(|p| brand.anet_link_name(&p.value()))
            .unwrap_or_default();

        let txn = self.transaction(&instance.name).await?;
        let result = txn.remove_resources(&mac_filter(&vif.address)).await;
        txn.end(result).await?;

        if !instance.is_active() {
            return Ok(());
        }
        if zones.apply(&instance.name).await.is_err() {
            let mut needed = ANET_RESTORE_PROPERTIES.to_vec();
            needed.push(name_property);
            let restored = retain_properties(&anet, &needed);
            let txn = self.transaction(&instance.name).await?;
            let result = txn.add_resource(&restored, false).await;
            if let Err(cleanup) = txn.end(result).await {
                self.log_cleanup_failure(
                    "restore anet",
                    &instance.name,
                    &cleanup.into(),
                );
            }
            return Err(Error::Network {
                reason: format!(
                    "Unable to detach interface '{link}' from running \
                     instance '{}' because the resource is most likely in \
                     use.",
                    instance.name
                ),
            });
        }
        self.networks.unplug(instance.uuid, std::slice::from_ref(vif)).await?;
        Ok(())
    }

    /// Returns the lowest anet index not used by the zone.
    async fn next_anet_index(
        &self,
        txn: &ConfigTransaction,
        brand: Brand,
    ) -> Result<usize, Error> {
        let zones = self.backend().await?;
        let anets = match zones
            .get_resources(txn.zone(), &Resource::kind("anet"))
            .await
        {
            Ok(anets) => anets,
            Err(err) if err.is_not_found() => vec![],
            Err(err) => return Err(err.into()),
        };
        let name_property = brand.capabilities().anet_name_property;
        let used: Vec<String> = anets
            .iter()
            .filter_map(|anet| anet.property(name_property))
            .map(|p| p.value())
            .collect();
        Ok((0..)
            .find(|index| {
                !used.contains(&anet_name_property(brand, *index).value())
            })
            .unwrap_or_default())
    }

    /// Creates a boot volume sized for the instance and waits until it is
    /// usable.
    pub async fn create_boot_volume(
        &self,
        instance: &Instance,
    ) -> Result<Volume, Error> {
        debug!(self.log, "creating boot volume"; "instance" => &instance.name);
        let request = VolumeCreate {
            size_gb: instance.root_gb,
            display_name: format!("{}-rootzpool", instance.hostname),
            description: format!(
                "Boot volume for instance '{}' ({})",
                instance.name, instance.uuid
            ),
            volume_type: self.config.zones.boot_volume_type.clone(),
            availability_zone: self.config.zones.boot_volume_az.clone(),
            source_volume: None,
        };
        let result = async {
            let volume = self.volumes.create(&request).await?;
            wait_for_volume(
                &self.log,
                &*self.volumes,
                &volume.id,
                self.volume_poll_policy.clone(),
            )
            .await
        }
        .await;
        result.map_err(|err| {
            error!(
                self.log,
                "unable to create root zpool volume";
                "instance" => &instance.name,
                "reason" => InlineErrorChain::new(&err),
            );
            err.into()
        })
    }

    /// Connects a boot volume to this host and records the attachment.
    ///
    /// Native zones cannot boot from a volume served by this same host, nor
    /// from a transport other than iSCSI or Fibre Channel.
    pub async fn connect_boot_volume(
        &self,
        volume: &Volume,
        mountpoint: &str,
        instance: &Instance,
        connector: &VolumeConnector,
    ) -> Result<ConnectionInfo, Error> {
        debug!(
            self.log,
            "connecting boot volume";
            "instance" => &instance.name,
            "volume" => &volume.id,
        );
        let mut info =
            self.volumes.initialize_connection(&volume.id, connector).await?;
        info.serial = Some(volume.id.clone());

        if self.flavor_brand(instance)? == Brand::Native {
            check_native_boot_volume(&info, connector)?;
        }
        self.volumes.attach(&volume.id, instance.uuid, mountpoint).await?;
        Ok(info)
    }
}

fn check_native_boot_volume(
    info: &ConnectionInfo,
    connector: &VolumeConnector,
) -> Result<(), Error> {
    let invalid = |reason: String| Err(Error::InvalidVolume { reason });
    match info.driver() {
        Ok(DriverKind::Local) => invalid(
            "Detected 'local' zvol driver volume type from volume service, \
             which should not be used as a boot device for 'solaris' branded \
             zones."
                .to_string(),
        ),
        Ok(DriverKind::Iscsi) => {
            let portal = info.data.target_portal.as_deref().unwrap_or_default();
            let host = portal
                .rsplit_once(':')
                .map_or(portal, |(host, _port)| host)
                .trim_matches(|c| c == '[' || c == ']');
            if host == connector.ip || host == connector.host {
                return invalid(
                    "iSCSI connection info from volume service indicates \
                     that the target is a local volume, which should not be \
                     used as a boot device for 'solaris' branded zones."
                        .to_string(),
                );
            }
            Ok(())
        }
        Ok(DriverKind::FibreChannel) => Ok(()),
        _ => invalid(format!(
            "Unsupported volume driver type '{}' can not be used as a boot \
             device for zones.",
            info.driver_volume_type
        )),
    }
}

/// The naming property of the anet at `index`.
fn anet_name_property(brand: Brand, index: usize) -> Property {
    match brand {
        Brand::Native => Property::new("linkname", format!("net{index}")),
        Brand::Kernel => Property::new("id", index.to_string()),
    }
}

fn anet_link(brand: Brand, index: usize) -> String {
    brand.anet_link_name(&anet_name_property(brand, index).value())
}
