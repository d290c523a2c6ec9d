// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Resize, cold migration and live migration.
//!
//! A resize which grows the root disk, or which moves the instance to
//! another host, clones the root volume. The clone and the original are
//! tracked through the `old_instance_volid` and `new_instance_volid` system
//! metadata tags until the resize is confirmed or reverted.

use crate::instance::{
    same_device, sysmeta, BlockDeviceInfo, BlockDeviceMapping, Flavor,
    Instance,
};
use crate::network::Vif;
use crate::volume::{wait_for_volume, Volume, VolumeCreate};
use crate::{Error, PowerOffType, ZoneDriver};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use slog_error_chain::InlineErrorChain;
use zone_utils::executor::run;
use zone_utils::storage::ConnectionInfo;
use zone_utils::zone::Brand;
use zone_utils::ZLOGIN;

/// Where a resize or migration is going.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MigrationInfo {
    pub source_node: String,
    pub dest_node: String,
    /// Address of the destination host.
    pub dest_host: String,
}

/// What the live-migration checks know about a compute host.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ComputeInfo {
    pub hypervisor_hostname: String,
    pub cpu_arch: String,
}

/// Result of the destination-side live-migration check, handed to the
/// source.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct LiveMigrateData {
    pub hypervisor_hostname: String,
}

/// Callbacks into the compute service around a live migration.
#[async_trait]
pub trait LiveMigrationHooks: Send + Sync {
    /// Rolls back after a failed migration.
    async fn recover(&self, instance: &Instance, dest: &str);
    /// Finishes a successful migration.
    async fn post(&self, instance: &Instance, dest: &str);
}

fn root_mapping<'a>(
    instance: &Instance,
    block_devices: &'a BlockDeviceInfo,
) -> Option<&'a BlockDeviceMapping> {
    let root = instance.root_device_name.as_deref()?;
    block_devices
        .block_device_mapping
        .iter()
        .find(|m| same_device(&m.mount_device, root))
}

fn missing_root() -> Error {
    Error::Resize { reason: "Cannot find an attached root device.".to_string() }
}

/// The volume behind a root connection. iSCSI connections name it in their
/// data; every other transport only has the serial.
fn root_volume_id(info: &ConnectionInfo) -> Option<String> {
    if info.driver_volume_type == "iscsi" {
        info.volume_id()
    } else {
        info.serial.clone()
    }
}

impl ZoneDriver {
    /// Powers the instance off ahead of a resize, cloning its root volume
    /// when the resize needs a new one. Returns the clone.
    pub async fn migrate_disk_and_power_off(
        &self,
        instance: &mut Instance,
        dest: &str,
        flavor: &Flavor,
        vifs: &[Vif],
        block_devices: &BlockDeviceInfo,
    ) -> Result<Option<Volume>, Error> {
        debug!(
            self.log,
            "starting migrate_disk_and_power_off";
            "instance" => &instance.name,
            "dest" => dest,
        );
        let samehost = dest == self.host_ip();
        if samehost {
            instance.set_sysmeta(sysmeta::RESIZE_SAMEHOST, "true");
        }

        let brand = self.flavor_brand(instance)?;
        if brand != Brand::Kernel && !samehost {
            return Err(Error::MigrationPreCheck {
                reason: format!(
                    "'{brand}' branded zones do not currently support resize \
                     to a different host."
                ),
            });
        }
        let new_brand = flavor
            .brand()
            .map_or_else(|| Brand::Native.to_string(), str::to_string);
        if new_brand != brand.to_string() {
            return Err(Error::MigrationPreCheck {
                reason: "Unable to change brand of zone during resize."
                    .to_string(),
            });
        }
        let old_root_gb = instance.root_gb;
        let new_root_gb = flavor.root_gb;
        if old_root_gb > new_root_gb {
            return Err(Error::Resize {
                reason: "Unable to resize to a smaller boot volume."
                    .to_string(),
            });
        }

        self.power_off(instance, vifs, PowerOffType::Soft).await?;

        if new_root_gb == old_root_gb && samehost {
            return Ok(None);
        }
        let Some(root) = root_mapping(instance, block_devices) else {
            // A native zone on a dataset only carries its disk size as a
            // quota, so there is nothing to copy.
            if samehost && brand == Brand::Native {
                return Ok(None);
            }
            return Err(missing_root());
        };
        let volume_id = root
            .connection_info
            .as_ref()
            .and_then(root_volume_id)
            .ok_or_else(missing_root)?;

        let source = self.volumes.get(&volume_id).await?;
        let clone = self
            .volumes
            .create(&VolumeCreate {
                size_gb: old_root_gb,
                display_name: format!("{}-resized", source.display_name),
                description: source.display_description.clone(),
                source_volume: Some(volume_id.clone()),
                ..Default::default()
            })
            .await?;
        instance.set_sysmeta(sysmeta::OLD_INSTANCE_VOLID, volume_id);
        instance.set_sysmeta(sysmeta::NEW_INSTANCE_VOLID, clone.id.clone());

        let clone = wait_for_volume(
            &self.log,
            &*self.volumes,
            &clone.id,
            self.volume_poll_policy.clone(),
        )
        .await?;

        if new_root_gb > old_root_gb {
            if let Err(err) = self.volumes.extend(&clone.id, new_root_gb).await
            {
                error!(
                    self.log,
                    "failed to extend the new volume";
                    "volume" => &clone.id,
                    "reason" => InlineErrorChain::new(&err),
                );
                if let Err(cleanup) = self.volumes.delete(&clone.id).await {
                    self.log_cleanup_failure(
                        "delete resized volume",
                        &instance.name,
                        &cleanup.into(),
                    );
                }
                return Err(err.into());
            }
        }
        Ok(Some(clone))
    }

    /// Switches the instance's root over to `replacement`, returning the
    /// new connection. On the same host the zone's boot device is updated
    /// too; native zones are detached around that change.
    async fn resize_disk_migration(
        &self,
        instance: &Instance,
        configured: &str,
        replacement: &str,
        samehost: bool,
    ) -> Result<ConnectionInfo, Error> {
        let connector = self.volume_connector().await;
        let info =
            self.volumes.initialize_connection(replacement, &connector).await?;
        let mountpoint = instance.root_device_name.clone().unwrap_or_default();

        if samehost {
            let name = &instance.name;
            let zone = self.zone(name).await?;
            let brand = Self::zone_brand(&zone)?;
            let zones = self.backend().await?;
            if brand == Brand::Native {
                zones.detach(name, &[]).await?;
            }
            let txn = self.transaction(name).await;
            let result = match txn {
                Ok(txn) => {
                    let result = self
                        .set_boot_device(&txn, brand, &info, &mountpoint)
                        .await;
                    txn.end(result).await
                }
                Err(err) => Err(err),
            };
            let reattached = if brand == Brand::Native {
                zones.attach(name, &[]).await.map_err(Error::from)
            } else {
                Ok(())
            };
            result?;
            reattached?;
        }

        self.volumes.detach(configured).await.inspect_err(|err| {
            error!(
                self.log,
                "failed to detach the volume";
                "volume" => configured,
                "reason" => InlineErrorChain::new(err),
            );
        })?;
        self.volumes
            .attach(replacement, instance.uuid, &mountpoint)
            .await
            .inspect_err(|err| {
                error!(
                    self.log,
                    "failed to attach the volume";
                    "volume" => replacement,
                    "reason" => InlineErrorChain::new(err),
                );
            })?;
        self.volumes
            .update_block_device_mapping(configured, replacement, &info)
            .await?;
        Ok(info)
    }

    /// Completes a resize or migration on the destination host.
    ///
    /// Any failure puts the old root volume back, and for a cross-host move
    /// destroys the half-built instance, before the error is returned.
    pub async fn finish_migration(
        &self,
        migration: &MigrationInfo,
        instance: &mut Instance,
        disk_info: Option<&Volume>,
        vifs: &[Vif],
        block_devices: &BlockDeviceInfo,
        power_on: bool,
    ) -> Result<(), Error> {
        let samehost = migration.dest_node == migration.source_node;
        if samehost {
            instance.set_sysmeta(sysmeta::OLD_VM_STATE, "resized");
        }
        let brand = self.flavor_brand(instance)?;

        let result = self
            .finish_migration_steps(
                instance,
                brand,
                disk_info,
                vifs,
                block_devices,
                samehost,
                power_on,
            )
            .await;
        if let Err(err) = &result {
            error!(
                self.log,
                "unable to finish migration; cleaning up";
                "instance" => &instance.name,
                "reason" => InlineErrorChain::new(err),
            );
            self.cleanup_finish_migration(instance, disk_info, samehost)
                .await;
        }
        result
    }

    #[allow(clippy::too_many_arguments)]
    async fn finish_migration_steps(
        &self,
        instance: &mut Instance,
        brand: Brand,
        disk_info: Option<&Volume>,
        vifs: &[Vif],
        block_devices: &BlockDeviceInfo,
        samehost: bool,
        power_on: bool,
    ) -> Result<(), Error> {
        let root = root_mapping(instance, block_devices)
            .and_then(|m| m.connection_info.clone());
        if samehost {
            let txn = self.transaction(&instance.name).await?;
            let result = async {
                self.set_num_cpu(&txn, brand, instance.vcpus).await?;
                self.set_memory_cap(&txn, brand, instance.memory_mb).await
            }
            .await;
            txn.end(result).await?;

            if let Some(disk) = disk_info {
                let configured = root
                    .and_then(|info| info.serial)
                    .ok_or_else(missing_root)?;
                self.resize_disk_migration(instance, &configured, &disk.id, true)
                    .await?;
            }
        } else {
            let disk = disk_info.ok_or_else(missing_root)?;
            let configured =
                root.and_then(|info| info.serial).ok_or_else(missing_root)?;
            let info = self
                .resize_disk_migration(instance, &configured, &disk.id, false)
                .await?;

            let root_device = instance.root_device_name.clone();
            let new_root = BlockDeviceInfo {
                root_device_name: root_device.clone(),
                block_device_mapping: vec![BlockDeviceMapping {
                    mount_device: root_device.unwrap_or_default(),
                    connection_info: Some(info),
                }],
            };
            self.create_config(instance, brand, &new_root, vifs).await?;
            self.attach(instance).await?;

            for mapping in &block_devices.block_device_mapping {
                let Some(info) = &mapping.connection_info else {
                    continue;
                };
                if new_root.is_root(mapping) {
                    continue;
                }
                self.attach_volume(instance, info, &mapping.mount_device)
                    .await?;
            }
        }

        if !power_on {
            return Ok(());
        }
        self.power_on(instance, vifs).await?;
        if brand == Brand::Native {
            return Ok(());
        }

        // The root pool only grows into a resized disk once autoexpand is
        // toggled, and the zone must have settled after boot to take it.
        tokio::time::sleep(self.settle_delay).await;
        for setting in ["autoexpand=off", "autoexpand=on"] {
            run(
                &*self.executor,
                ZLOGIN,
                [
                    "-S",
                    instance.name.as_str(),
                    "/usr/sbin/zpool",
                    "set",
                    setting,
                    "rpool",
                ],
            )
            .await?;
        }
        Ok(())
    }

    /// Best-effort undo of a failed [ZoneDriver::finish_migration].
    async fn cleanup_finish_migration(
        &self,
        instance: &mut Instance,
        disk_info: Option<&Volume>,
        samehost: bool,
    ) {
        let name = instance.name.clone();
        if let Some(disk) = disk_info {
            if let Err(err) = self.volumes.detach(&disk.id).await {
                self.log_cleanup_failure("detach new volume", &name, &err.into());
            }
            if let Err(err) = self.volumes.delete(&disk.id).await {
                self.log_cleanup_failure("delete new volume", &name, &err.into());
            }

            if let Some(old) = instance.sysmeta(sysmeta::OLD_INSTANCE_VOLID) {
                let old = old.to_string();
                let new = instance
                    .sysmeta(sysmeta::NEW_INSTANCE_VOLID)
                    .map_or_else(|| disk.id.clone(), str::to_string);
                if let Err(err) = self.reattach_root(instance, &old, &new).await {
                    self.log_cleanup_failure("reattach old volume", &name, &err);
                }
                instance.clear_sysmeta(sysmeta::NEW_INSTANCE_VOLID);
                instance.clear_sysmeta(sysmeta::OLD_INSTANCE_VOLID);
            }
        }

        if !samehost {
            if let Err(err) = self.destroy(instance).await {
                self.log_cleanup_failure("destroy", &name, &err);
            }
            instance.host = instance.launched_on.clone();
            instance.node = instance.launched_on.clone();
        }
    }

    /// Attaches `old` as the root volume again and points the mapping that
    /// referred to `new` back at it.
    async fn reattach_root(
        &self,
        instance: &Instance,
        old: &str,
        new: &str,
    ) -> Result<(), Error> {
        let connector = self.volume_connector().await;
        let info = self.volumes.initialize_connection(old, &connector).await?;
        let mountpoint = instance.root_device_name.clone().unwrap_or_default();
        self.volumes.attach(old, instance.uuid, &mountpoint).await?;
        self.volumes.update_block_device_mapping(new, old, &info).await?;
        Ok(())
    }

    /// Confirms a resize, dropping the old root volume and, after a move,
    /// the source zone.
    pub async fn confirm_migration(
        &self,
        migration: &MigrationInfo,
        instance: &mut Instance,
    ) -> Result<(), Error> {
        let samehost = migration.dest_host == self.host_ip();
        let old = instance.sysmeta(sysmeta::OLD_INSTANCE_VOLID);
        let new = instance.sysmeta(sysmeta::NEW_INSTANCE_VOLID);
        if let (Some(old), Some(new)) = (old, new) {
            let (old, new) = (old.to_string(), new.to_string());
            instance.clear_sysmeta(sysmeta::OLD_INSTANCE_VOLID);
            instance.clear_sysmeta(sysmeta::NEW_INSTANCE_VOLID);
            self.volumes.delete(&old).await?;
            self.volumes
                .rename(&new, &format!("{}-rootzpool", instance.display_name))
                .await?;
        }

        if samehost {
            instance.clear_sysmeta(sysmeta::RESIZE_SAMEHOST);
            Ok(())
        } else {
            self.destroy(instance).await
        }
    }

    /// Puts a same-host resize back to the instance's original flavor.
    async fn samehost_revert_resize(
        &self,
        instance: &mut Instance,
        vifs: &[Vif],
    ) -> Result<(), Error> {
        self.power_off(instance, vifs, PowerOffType::Soft).await?;
        let brand = self.flavor_brand(instance)?;

        let txn = self.transaction(&instance.name).await?;
        let result = async {
            self.set_num_cpu(&txn, brand, instance.vcpus).await?;
            self.set_memory_cap(&txn, brand, instance.memory_mb).await
        }
        .await;
        txn.end(result).await?;

        if let Some(old) = instance.clear_sysmeta(sysmeta::OLD_INSTANCE_VOLID) {
            let new = instance
                .sysmeta(sysmeta::NEW_INSTANCE_VOLID)
                .map(str::to_string)
                .unwrap_or_default();
            self.resize_disk_migration(instance, &new, &old, true).await?;
        }
        Ok(())
    }

    /// Reverts a resize or migration and powers the instance back on.
    pub async fn finish_revert_migration(
        &self,
        instance: &mut Instance,
        vifs: &[Vif],
    ) -> Result<(), Error> {
        if instance.sysmeta(sysmeta::RESIZE_SAMEHOST).is_some() {
            self.samehost_revert_resize(instance, vifs).await?;
            instance.clear_sysmeta(sysmeta::RESIZE_SAMEHOST);
        }

        if let Some(old) = instance.sysmeta(sysmeta::OLD_INSTANCE_VOLID) {
            let old = old.to_string();
            let new = instance
                .sysmeta(sysmeta::NEW_INSTANCE_VOLID)
                .map(str::to_string)
                .unwrap_or_default();
            let connector = self.volume_connector().await;
            let info =
                self.volumes.initialize_connection(&old, &connector).await?;
            self.volumes.detach(&new).await?;
            self.volumes.delete(&new).await?;
            let mountpoint =
                instance.root_device_name.clone().unwrap_or_default();
            self.volumes.attach(&old, instance.uuid, &mountpoint).await?;
            self.volumes.update_block_device_mapping(&new, &old, &info).await?;
            instance.clear_sysmeta(sysmeta::NEW_INSTANCE_VOLID);
            instance.clear_sysmeta(sysmeta::OLD_INSTANCE_VOLID);
        } else if let Some(new) =
            instance.clear_sysmeta(sysmeta::NEW_INSTANCE_VOLID)
        {
            self.volumes.delete(&new).await?;
        }

        self.power_on(instance, vifs).await
    }

    /// Options for `zoneadm migrate` to `dest`.
    pub fn live_migration_options(&self, dest: &str, dry_run: bool) -> Vec<String> {
        let mut options = Vec::new();
        if let Some(cipher) = &self.config.zones.live_migration_cipher {
            options.extend(["-c".to_string(), cipher.clone()]);
        }
        if dry_run {
            options.push("-nq".to_string());
        }
        options.push(format!("ssh://nova@{dest}"));
        options
    }

    async fn migrate_zone(
        &self,
        name: &str,
        dest: &str,
        dry_run: bool,
    ) -> Result<(), Error> {
        self.zone(name).await?;
        let options = self.live_migration_options(dest, dry_run);
        self.backend().await?.migrate(name, &options).await?;
        Ok(())
    }

    /// Destination-side checks ahead of a live migration.
    pub fn check_can_live_migrate_destination(
        &self,
        instance: &Instance,
        source: &ComputeInfo,
        dest: &ComputeInfo,
        block_migration: bool,
        disk_over_commit: bool,
    ) -> Result<LiveMigrateData, Error> {
        let precheck = |reason: String| Error::MigrationPreCheck { reason };
        if source.cpu_arch != dest.cpu_arch {
            return Err(precheck(format!(
                "CPU architectures between source host '{}' ({}) and \
                 destination host '{}' ({}) are incompatible.",
                source.hypervisor_hostname,
                source.cpu_arch,
                dest.hypervisor_hostname,
                dest.cpu_arch,
            )));
        }
        let brand = self.flavor_brand(instance)?;
        if !brand.capabilities().supports_live_migration {
            return Err(precheck(format!(
                "'{brand}' branded zones do not currently support live \
                 migration."
            )));
        }
        if block_migration {
            return Err(precheck(
                "Block migration is not currently supported.".to_string(),
            ));
        }
        if disk_over_commit {
            return Err(precheck(
                "Disk overcommit is not currently supported.".to_string(),
            ));
        }
        Ok(LiveMigrateData {
            hypervisor_hostname: dest.hypervisor_hostname.clone(),
        })
    }

    /// Source-side checks ahead of a live migration, ending in a dry run.
    pub async fn check_can_live_migrate_source(
        &self,
        instance: &Instance,
        dest: LiveMigrateData,
        block_devices: &BlockDeviceInfo,
    ) -> Result<LiveMigrateData, Error> {
        for mapping in &block_devices.block_device_mapping {
            let Some(info) = &mapping.connection_info else {
                continue;
            };
            if info.driver_volume_type == "local" {
                return Err(Error::MigrationPreCheck {
                    reason: "Instances with attached 'local' volumes are not \
                             currently supported."
                        .to_string(),
                });
            }
        }
        self.migrate_zone(&instance.name, &dest.hypervisor_hostname, true)
            .await
            .map_err(|err| Error::MigrationPreCheck { reason: err.to_string() })?;
        Ok(dest)
    }

    /// Live migrates the instance to `dest`, calling back into the compute
    /// service when done.
    pub async fn live_migration(
        &self,
        instance: &Instance,
        dest: &str,
        hooks: &dyn LiveMigrationHooks,
    ) -> Result<(), Error> {
        if let Err(err) = self.migrate_zone(&instance.name, dest, false).await {
            error!(
                self.log,
                "unable to live migrate instance";
                "instance" => &instance.name,
                "dest" => dest,
                "reason" => InlineErrorChain::new(&err),
            );
            hooks.recover(instance, dest).await;
            return Err(err);
        }
        hooks.post(instance, dest).await;
        Ok(())
    }

    /// Removes the source zone after a live migration.
    pub async fn post_live_migration(
        &self,
        instance: &Instance,
    ) -> Result<(), Error> {
        let name = &instance.name;
        if self.console.has(name).await {
            if let Err(err) = self.console.delete(name).await {
                debug!(self.log, "console cleanup failed"; "reason" => %err);
            }
        }
        if self.zones.find_zone(name).await?.is_none() {
            warn!(self.log, "unable to find instance"; "instance" => name);
            return Ok(());
        }
        self.delete_config(name).await.inspect_err(|err| {
            error!(
                self.log,
                "unable to delete configuration for instance";
                "instance" => name,
                "reason" => InlineErrorChain::new(err),
            );
        })
    }

    pub async fn post_live_migration_at_source(
        &self,
        instance: &Instance,
        vifs: &[Vif],
    ) -> Result<(), Error> {
        Ok(self.networks.unplug(instance.uuid, vifs).await?)
    }

    pub async fn post_live_migration_at_destination(
        &self,
        instance: &Instance,
        vifs: &[Vif],
    ) -> Result<(), Error> {
        Ok(self.networks.plug(instance.uuid, vifs).await?)
    }
}
