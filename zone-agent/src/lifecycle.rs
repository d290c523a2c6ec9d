// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Creating, booting, stopping and destroying instances.

use crate::image::{ImageError, ImageMeta};
use crate::instance::{
    meta, same_device, sysmeta, BlockDeviceInfo, BlockDeviceMapping,
    Instance, TaskState, SC_PROFILE_EXTRA_SPEC,
};
use crate::network::Vif;
use crate::{Error, ZoneDriver};

use camino::{Utf8Path, Utf8PathBuf};
use slog_error_chain::InlineErrorChain;
use std::os::unix::fs::PermissionsExt;
use uuid::Uuid;
use zone_utils::executor::run;
use zone_utils::storage::{ConnectionData, ConnectionInfo};
use zone_utils::zone::{
    lookup_resource_property, Brand, PowerState, Property, Resource, State,
};
use zone_utils::CP;

/// How an instance is stopped.
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, strum::Display, strum::EnumString,
)]
#[strum(serialize_all = "UPPERCASE")]
pub enum PowerOffType {
    /// Orderly shutdown through the guest.
    Soft,
    /// Immediate halt.
    Hard,
}

/// Boot arguments taken from instance metadata for one boot.
#[derive(Default)]
struct BootArgs {
    options: Vec<String>,
    /// The metadata bootargs are used up by this boot.
    consumed: bool,
    /// Configured bootargs cleared for this boot, restored afterwards.
    restore: Option<String>,
}

const SHARED_STORAGE_DRIVERS: &[&str] = &["iscsi", "fibre_channel"];

impl ZoneDriver {
    /// Checks that the instance's flavor can be realized, returning its
    /// brand.
    pub fn validate_flavor(&self, instance: &Instance) -> Result<Brand, Error> {
        let brand = self.flavor_brand(instance)?;
        if let Some(alignment_mb) = brand.capabilities().memory_alignment_mb {
            if instance.memory_mb % alignment_mb != 0 {
                return Err(Error::MemoryAlignment {
                    flavor: instance.flavor.name.clone(),
                    memory_mb: instance.memory_mb,
                    alignment_mb,
                });
            }
        }
        Ok(brand)
    }

    /// Creates the zone configuration of an instance.
    pub async fn create_config(
        &self,
        instance: &Instance,
        brand: Brand,
        block_devices: &BlockDeviceInfo,
        vifs: &[Vif],
    ) -> Result<(), Error> {
        let name = &instance.name;
        if self.zones.find_zone(name).await?.is_some() {
            return Err(Error::InstanceExists { name: name.clone() });
        }
        info!(
            self.log,
            "creating zone configuration";
            "instance" => name,
            "display_name" => &instance.display_name,
            "brand" => %brand,
        );
        let zones = self.backend().await?;
        zones.create(name, brand.capabilities().template).await?;

        let txn = self.transaction(name).await?;
        let result = async {
            self.set_global_properties(&txn, instance, brand).await?;
            for mapping in &block_devices.block_device_mapping {
                let Some(info) = &mapping.connection_info else {
                    continue;
                };
                if block_devices.is_root(mapping) {
                    self.set_boot_device(&txn, brand, info, &mapping.mount_device)
                        .await?;
                } else {
                    self.add_volume_device(
                        &txn,
                        brand,
                        info,
                        &mapping.mount_device,
                    )
                    .await?;
                }
            }
            self.set_num_cpu(&txn, brand, instance.vcpus).await?;
            self.set_memory_cap(&txn, brand, instance.memory_mb).await?;
            self.set_network(&txn, brand, vifs).await?;
            if instance.config_drive {
                self.set_configdrive(&txn, name).await?;
            }
            Ok::<_, Error>(())
        }
        .await;
        txn.end(result).await.inspect_err(|err| {
            error!(
                self.log,
                "unable to create zone configuration";
                "instance" => name,
                "reason" => InlineErrorChain::new(err),
            );
        })
    }

    async fn log_zone_config(&self, name: &str) -> Result<(), Error> {
        let config = self.backend().await?.export_config(name).await?;
        debug!(self.log, "zone configuration"; "zone" => name, "config" => config);
        Ok(())
    }

    /// Installs the zone root file system from a unified archive.
    pub async fn install(
        &self,
        instance: &mut Instance,
        image: &Utf8Path,
        sc_dir: &Utf8Path,
    ) -> Result<(), Error> {
        let name = instance.name.clone();
        self.zone(&name).await?;
        self.log_zone_config(&name).await?;

        let mut options = vec!["-a".to_string(), image.to_string()];
        let has_profiles = std::fs::read_dir(sc_dir)
            .map_err(|err| Error::io(sc_dir, err))?
            .next()
            .is_some();
        if has_profiles {
            options.extend(["-c".to_string(), sc_dir.to_string()]);
        }

        info!(self.log, "installing instance"; "instance" => &name);
        self.backend().await?.install(&name, &options).await.inspect_err(
            |err| {
                error!(
                    self.log,
                    "unable to install root file system";
                    "instance" => &name,
                    "reason" => %err,
                );
            },
        )?;
        self.record_hostid(instance).await?;
        info!(self.log, "installation complete"; "instance" => &name);
        Ok(())
    }

    /// Attaches an existing root file system to the zone.
    pub async fn attach(&self, instance: &mut Instance) -> Result<(), Error> {
        let name = instance.name.clone();
        self.zone(&name).await?;
        self.log_zone_config(&name).await?;

        info!(self.log, "attaching instance"; "instance" => &name);
        let options = ["-x".to_string(), "initialize-hostdata".to_string()];
        self.backend().await?.attach(&name, &options).await.inspect_err(
            |err| {
                error!(
                    self.log,
                    "unable to attach root file system";
                    "instance" => &name,
                    "reason" => %err,
                );
            },
        )?;
        self.record_hostid(instance).await?;
        Ok(())
    }

    pub(crate) async fn uninstall(&self, name: &str) -> Result<(), Error> {
        let zone = self.zone(name).await?;
        if zone.state == State::Configured {
            debug!(
                self.log,
                "uninstall not required";
                "zone" => name,
                "state" => %zone.state,
            );
            return Ok(());
        }
        self.backend().await?.uninstall(name, &["-F".to_string()]).await?;
        Ok(())
    }

    pub(crate) async fn delete_config(&self, name: &str) -> Result<(), Error> {
        self.zone(name).await?;
        self.backend().await?.delete(name).await?;
        Ok(())
    }

    async fn power_state(&self, name: &str) -> Result<PowerState, Error> {
        Ok(self.zone(name).await?.power_state())
    }

    /// Creates, installs and optionally boots a new instance.
    ///
    /// A failure after the zone was created uninstalls and deletes it
    /// again before the error is returned.
    pub async fn spawn(
        &self,
        instance: &mut Instance,
        vifs: &[Vif],
        block_devices: &BlockDeviceInfo,
        power_on: bool,
    ) -> Result<(), Error> {
        info!(self.log, "spawning instance"; "instance" => &instance.name);
        let brand = self.validate_flavor(instance)?;
        let mut block_devices = block_devices.clone();

        let mut install_image = None;
        if let Some(image_id) = instance.image_ref.clone() {
            let image = self.images.service().show(&image_id).await?;
            let path = self.images.fetch(&image_id).await?;
            if image.is_archive() {
                self.images
                    .validate_archive(
                        &image_id,
                        &path,
                        &*self.archives,
                        &self.host_arch,
                    )
                    .await?;
                install_image = Some(path);
            } else {
                let root = self
                    .stage_raw_image(instance, brand, &image_id, &path)
                    .await?;
                block_devices
                    .root_device_name
                    .get_or_insert_with(|| root.mount_device.clone());
                block_devices.block_device_mapping.push(root);
            }
        }

        let sc_dir = camino_tempfile::Builder::new()
            .prefix("nova-sysconfig-")
            .tempdir_in(&self.config.host.state_path)
            .map_err(|err| Error::io(&self.config.host.state_path, err))?;
        std::fs::set_permissions(
            sc_dir.path(),
            std::fs::Permissions::from_mode(0o755),
        )
        .map_err(|err| Error::io(sc_dir.path(), err))?;
        if wants_sc_profile(instance) {
            if let Some(profile) = instance.flavor.extra_specs.get(SC_PROFILE_EXTRA_SPEC)
            {
                copy_sc_profile(Utf8Path::new(profile), sc_dir.path())?;
            }
        }

        let result = async {
            self.create_config(instance, brand, &block_devices, vifs).await?;
            match &install_image {
                Some(image) => {
                    self.install(instance, image, sc_dir.path()).await?
                }
                None => self.attach(instance).await?,
            }
            if power_on {
                self.power_on(instance, vifs).await?;
            }
            Ok::<_, Error>(())
        }
        .await;

        if let Err(err) = &result {
            error!(
                self.log,
                "unable to spawn instance";
                "instance" => &instance.name,
                "reason" => InlineErrorChain::new(err),
            );
            // The zone belongs to someone else; leave it alone.
            if matches!(err, Error::InstanceExists { .. }) {
                return result;
            }
            if let Err(err) = self.uninstall(&instance.name).await {
                self.log_cleanup_failure("uninstall", &instance.name, &err);
            }
            if let Err(err) = self.delete_config(&instance.name).await {
                self.log_cleanup_failure("delete config", &instance.name, &err);
            }
        }
        result
    }

    /// Copies a raw disk image into the instance directory, returning the
    /// root mapping which boots from it.
    async fn stage_raw_image(
        &self,
        instance: &Instance,
        brand: Brand,
        image_id: &str,
        image: &Utf8Path,
    ) -> Result<BlockDeviceMapping, Error> {
        let unacceptable = |reason: String| Error::ImageUnacceptable {
            image_id: image_id.to_string(),
            reason,
        };
        if brand != Brand::Kernel {
            return Err(unacceptable(
                "Raw devices are compatible only with kernel zones".to_string(),
            ));
        }
        let instance_dir =
            self.config.instance_dir(&instance.uuid.to_string());
        tokio::fs::create_dir_all(&instance_dir)
            .await
            .map_err(|err| Error::io(&instance_dir, err))?;
        let disk = instance_dir.join("disk");
        run(&*self.executor, CP, ["-z", image.as_str(), disk.as_str()])
            .await
            .map_err(|_| {
                unacceptable(format!(
                    "Could not copy image {image} to instance path {disk}"
                ))
            })?;
        Ok(BlockDeviceMapping {
            mount_device: instance
                .root_device_name
                .clone()
                .unwrap_or_else(|| "/dev/vda".to_string()),
            connection_info: Some(ConnectionInfo {
                driver_volume_type: "file".to_string(),
                serial: None,
                volume_path: Some(disk.to_string()),
                data: ConnectionData::default(),
            }),
        })
    }

    /// Looks up the boot arguments for the next boot, clearing configured
    /// bootargs which would conflict with them.
    async fn prepare_bootargs(
        &self,
        instance: &Instance,
    ) -> Result<BootArgs, Error> {
        if !self.config.zones.boot_options {
            return Ok(BootArgs::default());
        }
        let Some(requested) = instance
            .metadata
            .get(meta::BOOTARGS)
            .filter(|args| !args.is_empty())
        else {
            return Ok(BootArgs::default());
        };
        let persistent = instance
            .metadata
            .get(meta::BOOTARGS_PERSIST)
            .is_some_and(|p| !p.eq_ignore_ascii_case("false"));
        let mut boot = BootArgs {
            options: vec!["--".to_string(), requested.clone()],
            consumed: !persistent,
            restore: None,
        };

        let global = Resource::kind("global");
        let zones = self.backend().await?;
        let current =
            lookup_resource_property(&*zones, &instance.name, &global, "bootargs")
                .await?;
        if let Some(current) = current.filter(|c| c != requested) {
            let txn = self.transaction(&instance.name).await?;
            let result = txn.clear_properties(&global, &["bootargs"]).await;
            txn.end(result).await?;
            boot.restore = Some(current);
        }
        Ok(boot)
    }

    /// Undoes [ZoneDriver::prepare_bootargs] once the boot is over.
    async fn finish_bootargs(
        &self,
        instance: &mut Instance,
        boot: BootArgs,
    ) -> Result<(), Error> {
        if boot.consumed {
            instance.metadata.remove(meta::BOOTARGS);
            instance.metadata.remove(meta::BOOTARGS_PERSIST);
        }
        if let Some(bootargs) = boot.restore {
            let txn = self.transaction(&instance.name).await?;
            let result = txn
                .set_property(&Resource::kind("global"), "bootargs", &bootargs)
                .await;
            txn.end(result).await?;
        }
        Ok(())
    }

    /// Boots the instance and plugs its interfaces.
    pub async fn power_on(
        &self,
        instance: &mut Instance,
        vifs: &[Vif],
    ) -> Result<(), Error> {
        let name = instance.name.clone();
        self.zone(&name).await?;
        self.record_hostid(instance).await?;

        let boot = self.prepare_bootargs(instance).await?;
        let result = async {
            self.backend().await?.boot(&name, &boot.options).await?;
            self.networks.plug(instance.uuid, vifs).await?;
            Ok::<_, Error>(())
        }
        .await;
        let restored = self.finish_bootargs(instance, boot).await;

        result.map_err(|err| {
            error!(
                self.log,
                "unable to power on instance";
                "instance" => &name,
                "reason" => InlineErrorChain::new(&err),
            );
            Error::PowerOnFailure { reason: err.to_string() }
        })?;
        restored
    }

    /// Stops the instance. A stop which fails but still leaves the zone
    /// shut down is not an error.
    pub async fn power_off(
        &self,
        instance: &mut Instance,
        vifs: &[Vif],
        kind: PowerOffType,
    ) -> Result<(), Error> {
        let name = instance.name.clone();
        debug!(self.log, "powering off"; "instance" => &name, "type" => %kind);
        self.zone(&name).await?;
        self.record_hostid(instance).await?;

        let result = async {
            self.networks.unplug(instance.uuid, vifs).await?;
            let zones = self.backend().await?;
            match kind {
                PowerOffType::Soft => zones.shutdown(&name, &[]).await?,
                PowerOffType::Hard => zones.halt(&name).await?,
            }
            Ok::<_, Error>(())
        }
        .await;

        let Err(err) = result else {
            return Ok(());
        };
        if matches!(self.power_state(&name).await, Ok(PowerState::Shutdown)) {
            warn!(
                self.log,
                "ignoring error returned while powering off instance";
                "instance" => &name,
                "reason" => InlineErrorChain::new(&err),
            );
            return Ok(());
        }
        error!(
            self.log,
            "unable to power off instance";
            "instance" => &name,
            "reason" => InlineErrorChain::new(&err),
        );
        Err(Error::PowerOffFailure { reason: err.to_string() })
    }

    /// Reboots the instance, or boots it if it is shut down.
    pub async fn reboot(
        &self,
        instance: &mut Instance,
        vifs: &[Vif],
        kind: PowerOffType,
    ) -> Result<(), Error> {
        let name = instance.name.clone();
        if self.power_state(&name).await? == PowerState::Shutdown {
            return self.power_on(instance, vifs).await;
        }

        let boot = self.prepare_bootargs(instance).await?;
        let result = async {
            self.networks.unplug(instance.uuid, vifs).await?;
            let zones = self.backend().await?;
            match kind {
                PowerOffType::Soft => {
                    let mut options = vec!["-r".to_string()];
                    options.extend(boot.options.iter().cloned());
                    zones.shutdown(&name, &options).await?;
                }
                PowerOffType::Hard => zones.reboot(&name, &boot.options).await?,
            }
            self.networks.plug(instance.uuid, vifs).await?;
            Ok::<_, Error>(())
        }
        .await;
        let restored = self.finish_bootargs(instance, boot).await;

        result.map_err(|err| {
            error!(
                self.log,
                "unable to reboot instance";
                "instance" => &name,
                "reason" => InlineErrorChain::new(&err),
            );
            Error::RebootFailure { reason: err.to_string() }
        })?;
        restored
    }

    /// Removes an instance from this host. Destroying an instance which is
    /// already gone succeeds.
    pub async fn destroy(&self, instance: &mut Instance) -> Result<(), Error> {
        if instance.task_state == Some(TaskState::ResizeReverting)
            && instance.sysmeta(sysmeta::OLD_VM_STATE) == Some("resized")
        {
            return Ok(());
        }

        // The source of a failed evacuation must survive its host coming
        // back.
        if instance.task_state.is_none() {
            if let Some(evac_from) = instance.clear_sysmeta(sysmeta::EVAC_FROM)
            {
                instance.host = Some(evac_from.clone());
                instance.node = Some(evac_from);
                self.save(instance).await?;
                return Ok(());
            }
        }

        let name = instance.name.clone();
        if self.console.has(&name).await {
            if let Err(err) = self.console.delete(&name).await {
                warn!(
                    self.log,
                    "unable to delete console service";
                    "instance" => &name,
                    "reason" => InlineErrorChain::new(&err),
                );
            }
        }

        match self.zones.find_zone(&name).await {
            Ok(Some(_)) => {}
            Ok(None) => {
                warn!(self.log, "unable to find instance to destroy"; "instance" => &name);
                return Ok(());
            }
            Err(err) => {
                let err = Error::from(err);
                self.log_cleanup_failure("find zone", &name, &err);
            }
        }
        if let Err(err) = self.teardown(instance).await {
            warn!(
                self.log,
                "unable to destroy instance";
                "instance" => &name,
                "reason" => InlineErrorChain::new(&err),
            );
        }

        // Volume cleanup of a reverting resize happens in
        // finish_revert_migration.
        if instance.task_state == Some(TaskState::ResizeReverting) {
            return Ok(());
        }
        for tag in [sysmeta::OLD_INSTANCE_VOLID, sysmeta::NEW_INSTANCE_VOLID] {
            let Some(volume_id) = instance.sysmeta(tag).map(str::to_string)
            else {
                continue;
            };
            debug!(self.log, "deleting volume"; "volume" => &volume_id);
            match self.volumes.delete(&volume_id).await {
                Ok(()) => {
                    instance.clear_sysmeta(tag);
                }
                Err(err) => warn!(
                    self.log,
                    "unable to delete volume";
                    "volume" => &volume_id,
                    "reason" => InlineErrorChain::new(&err),
                ),
            }
        }
        Ok(())
    }

    /// Walks the zone down to nothing and removes its local files.
    async fn teardown(&self, instance: &mut Instance) -> Result<(), Error> {
        let name = instance.name.clone();
        if self.power_state(&name).await? == PowerState::Running {
            self.power_off(instance, &[], PowerOffType::Hard).await?;
        }
        if self.power_state(&name).await? == PowerState::Shutdown {
            self.uninstall(&name).await?;
        }
        if self.power_state(&name).await? == PowerState::NoState {
            self.delete_config(&name).await?;
        }
        if instance.config_drive {
            let path = self.config.configdrive_path(&name);
            if let Err(err) = tokio::fs::remove_file(&path).await {
                debug!(
                    self.log,
                    "unable to remove config drive";
                    "path" => %path,
                    "reason" => %err,
                );
            }
        }
        let instance_dir =
            self.config.instance_dir(&instance.uuid.to_string());
        match tokio::fs::remove_dir_all(&instance_dir).await {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(Error::io(instance_dir, err)),
        }
    }

    /// Suspends a running kernel zone to disk.
    pub async fn suspend(
        &self,
        instance: &Instance,
        vifs: &[Vif],
    ) -> Result<(), Error> {
        let name = &instance.name;
        let zone = self.zone(name).await?;
        if !zone.brand().is_some_and(|b| b.capabilities().supports_suspend) {
            return Err(Error::SuspendFailure {
                reason: format!(
                    "'{}' branded zones do not currently support suspend. \
                     Reset the state of instance '{}' to 'active' to \
                     recover.",
                    zone.brand, instance.display_name
                ),
            });
        }
        if zone.power_state() != PowerState::Running {
            return Err(Error::SuspendFailure {
                reason: format!("Instance '{name}' is not running."),
            });
        }

        let result = async {
            let path = format!(
                "{}/%{{zonename}}",
                self.config.zones.zones_suspend_path
            );
            let suspend = Resource::kind("suspend");
            let txn = self.transaction(name).await?;
            let edit = async {
                if txn.lookup_resource("suspend").await?.is_some() {
                    let current = txn.lookup_property(&suspend, "path").await?;
                    if current.as_deref() == Some(path.as_str()) {
                        return Ok(());
                    }
                    txn.remove_resources(&suspend).await?;
                }
                txn.add_resource(
                    &Resource::new("suspend", vec![Property::new("path", &path)]),
                    false,
                )
                .await
            }
            .await;
            txn.end(edit).await?;

            self.backend().await?.suspend(name).await?;
            self.networks.unplug(instance.uuid, vifs).await?;
            Ok::<_, Error>(())
        }
        .await;
        result.map_err(|err| {
            error!(
                self.log,
                "unable to suspend instance";
                "instance" => name,
                "reason" => InlineErrorChain::new(&err),
            );
            Error::SuspendFailure { reason: err.to_string() }
        })
    }

    /// Boots a suspended kernel zone.
    pub async fn resume(
        &self,
        instance: &Instance,
        vifs: &[Vif],
    ) -> Result<(), Error> {
        let name = &instance.name;
        let zone = self.zone(name).await?;
        if !zone.brand().is_some_and(|b| b.capabilities().supports_suspend) {
            return Err(Error::ResumeFailure {
                reason: format!(
                    "'{}' branded zones do not currently support resume.",
                    zone.brand
                ),
            });
        }
        if zone.power_state() != PowerState::Shutdown {
            return Err(Error::ResumeFailure {
                reason: format!("Instance '{name}' is not suspended."),
            });
        }

        let result = async {
            self.backend().await?.boot(name, &[]).await?;
            self.networks.plug(instance.uuid, vifs).await?;
            Ok::<_, Error>(())
        }
        .await;
        result.map_err(|err| {
            error!(
                self.log,
                "unable to resume instance";
                "instance" => name,
                "reason" => InlineErrorChain::new(&err),
            );
            Error::ResumeFailure { reason: err.to_string() }
        })
    }

    /// Boots an instance left shut down by a host reboot.
    pub async fn resume_state_on_host_boot(
        &self,
        instance: &mut Instance,
        vifs: &[Vif],
    ) -> Result<(), Error> {
        if self.power_state(&instance.name).await? != PowerState::Shutdown {
            return Ok(());
        }
        self.power_on(instance, vifs).await
    }

    /// Archives the instance's root pool into the pre-created image
    /// `image_id`.
    pub async fn snapshot(
        &self,
        instance: &mut Instance,
        image_id: &str,
    ) -> Result<(), Error> {
        let name = instance.name.clone();
        let zone = self.zone(&name).await?;
        if self.flavor_brand(instance)? == Brand::Kernel
            && zone.state != State::Running
        {
            return Err(Error::InstanceNotRunning { name });
        }

        let images = self.images.service();
        let base = match &instance.image_ref {
            None => None,
            Some(base_id) => match images.show(base_id).await {
                Ok(base) => Some(base),
                Err(ImageError::NotFound { .. }) => None,
                Err(err) => return Err(err.into()),
            },
        };
        let snapshot = images.show(image_id).await?;

        let mut properties = std::collections::BTreeMap::new();
        properties.insert("image_location".to_string(), "snapshot".to_string());
        properties.insert("image_state".to_string(), "available".to_string());
        properties.insert("instance_uuid".to_string(), instance.uuid.to_string());
        if let Some(image_type) = snapshot.properties.get("image_type") {
            properties.insert("image_type".to_string(), image_type.clone());
        }
        for prop in ["architecture", "hypervisor_type", "vm_mode"] {
            if let Some(value) = base.as_ref().and_then(|b| b.properties.get(prop))
            {
                properties.insert(prop.to_string(), value.clone());
            }
        }
        // Generic formats first, in case the image service does not know
        // unified archives.
        let mut metadata = ImageMeta {
            id: image_id.to_string(),
            name: snapshot.name,
            container_format: Some("ovf".to_string()),
            disk_format: Some("raw".to_string()),
            properties,
        };

        instance.task_state = Some(TaskState::ImagePendingUpload);
        self.save(instance).await?;

        let snapshots = self.config.snapshots_directory();
        tokio::fs::create_dir_all(&snapshots)
            .await
            .map_err(|err| Error::io(&snapshots, err))?;
        let tmpdir = camino_tempfile::Builder::new()
            .tempdir_in(&snapshots)
            .map_err(|err| Error::io(&snapshots, err))?;
        let archive: Utf8PathBuf =
            tmpdir.path().join(Uuid::new_v4().simple().to_string());
        self.archives.create_root_only(&name, &archive).await?;

        info!(
            self.log,
            "snapshot extracted, beginning image upload";
            "instance" => &name,
            "image" => image_id,
        );
        instance.task_state = Some(TaskState::ImageUploading);
        self.save(instance).await?;
        images.upload(image_id, &metadata, Some(&archive)).await?;
        info!(self.log, "snapshot image upload complete"; "image" => image_id);

        metadata.container_format = Some("uar".to_string());
        metadata.disk_format = Some("zfs".to_string());
        match images.upload(image_id, &metadata, None).await {
            Ok(()) => Ok(()),
            Err(err @ ImageError::Invalid { .. }) => {
                warn!(
                    self.log,
                    "image service rejected 'uar' and 'zfs' formats; \
                     keeping 'ovf' and 'raw'";
                    "image" => image_id,
                    "reason" => %err,
                );
                Ok(())
            }
            Err(err) => Err(err.into()),
        }
    }

    /// Re-creates an instance from its image, or on a new host from its
    /// shared root volume when `recreate` is set.
    pub async fn rebuild(
        &self,
        instance: &mut Instance,
        block_devices: &BlockDeviceInfo,
        vifs: &[Vif],
        recreate: bool,
    ) -> Result<(), Error> {
        if recreate {
            if let Some(launched_on) = instance.launched_on.clone() {
                instance.set_sysmeta(sysmeta::EVAC_FROM, launched_on);
            }
            self.save(instance).await?;
            let brand = self.flavor_brand(instance)?;
            if brand == Brand::Native {
                return Err(Error::NotSupported {
                    what: format!("evacuation of '{brand}' branded zones"),
                });
            }
        } else {
            self.power_off(instance, vifs, PowerOffType::Hard).await?;
        }

        let root =
            self.rebuild_block_devices(instance, block_devices, recreate).await?;

        if recreate {
            let driver =
                root.as_ref().map_or("local", |ci| ci.driver_volume_type.as_str());
            if !SHARED_STORAGE_DRIVERS.contains(&driver) {
                return Err(Error::InvalidVolume {
                    reason: format!(
                        "Root device is not on shared storage for instance \
                         '{}'.",
                        instance.name
                    ),
                });
            }
        }

        if recreate {
            instance.task_state = Some(TaskState::RebuildSpawning);
            instance.set_sysmeta(sysmeta::REBUILDING, "false");
            let brand = self.flavor_brand(instance)?;
            let root_only = BlockDeviceInfo {
                root_device_name: instance.root_device_name.clone(),
                block_device_mapping: root
                    .map(|info| BlockDeviceMapping {
                        mount_device: instance
                            .root_device_name
                            .clone()
                            .unwrap_or_default(),
                        connection_info: Some(info),
                    })
                    .into_iter()
                    .collect(),
            };
            self.create_config(instance, brand, &root_only, vifs).await?;
            instance.clear_sysmeta(sysmeta::EVAC_FROM);
            self.save(instance).await?;
        } else {
            self.destroy(instance).await?;
            let mut block_devices = block_devices.clone();
            if let Some(volume_id) = root.and_then(|info| info.serial) {
                self.volumes.detach(&volume_id).await?;
                self.volumes.delete(&volume_id).await?;
                let root_name = block_devices.root_device_name.clone();
                block_devices.block_device_mapping.retain(|mapping| {
                    !root_name
                        .as_deref()
                        .is_some_and(|root| same_device(root, &mapping.mount_device))
                });
            }
            instance.task_state = Some(TaskState::RebuildSpawning);
            instance.set_sysmeta(sysmeta::REBUILDING, "true");
            self.spawn(instance, vifs, &block_devices, true).await?;
        }
        instance.clear_sysmeta(sysmeta::REBUILDING);

        if recreate {
            self.attach(instance).await?;
            for mapping in &block_devices.block_device_mapping {
                let Some(info) = &mapping.connection_info else {
                    continue;
                };
                if block_devices.is_root(mapping) {
                    continue;
                }
                self.attach_volume(instance, info, &mapping.mount_device)
                    .await?;
            }
            self.power_on(instance, vifs).await?;
        }
        Ok(())
    }

    /// Returns the root connection info, repairing a missing serial from the
    /// volume id. Unless recreating, the other volumes are detached.
    async fn rebuild_block_devices(
        &self,
        instance: &Instance,
        block_devices: &BlockDeviceInfo,
        recreate: bool,
    ) -> Result<Option<ConnectionInfo>, Error> {
        let root_device = instance.root_device_name.as_deref();
        let mut root = None;
        for mapping in &block_devices.block_device_mapping {
            let Some(info) = &mapping.connection_info else {
                continue;
            };
            if root_device.is_some_and(|r| same_device(r, &mapping.mount_device))
            {
                let mut info = info.clone();
                if info.serial.is_none() {
                    info.serial = info.data.volume_id.clone();
                }
                if info.serial.is_none() {
                    debug!(
                        self.log,
                        "unable to determine the volume id of the root device";
                        "instance" => &instance.name,
                    );
                } else {
                    root = Some(info);
                }
                continue;
            }
            if !recreate {
                self.detach_volume(instance, info).await?;
            }
        }
        if root.is_none() && recreate {
            return Err(Error::InvalidVolume {
                reason: format!(
                    "Unable to find the root device for instance '{}'.",
                    instance.name
                ),
            });
        }
        Ok(root)
    }
}

/// System configuration profiles are only applied to fresh installs, and
/// to rebuilds which reinstall from the image.
fn wants_sc_profile(instance: &Instance) -> bool {
    match instance.task_state {
        Some(TaskState::RebuildSpawning) => {
            instance.sysmeta(sysmeta::REBUILDING) == Some("true")
        }
        Some(
            TaskState::ResizeFinish
            | TaskState::ResizeReverting
            | TaskState::ResizeMigrating,
        ) => false,
        _ => true,
    }
}

/// Copies a profile file into `sc_dir`, or a profile directory to
/// `sc_dir/sysconfig`.
fn copy_sc_profile(profile: &Utf8Path, sc_dir: &Utf8Path) -> Result<(), Error> {
    if profile.is_file() {
        let dest = sc_dir.join(profile.file_name().unwrap_or("sc_profile.xml"));
        std::fs::copy(profile, &dest).map_err(|err| Error::io(profile, err))?;
    } else if profile.is_dir() {
        copy_tree(profile, &sc_dir.join("sysconfig"))?;
    }
    Ok(())
}

fn copy_tree(src: &Utf8Path, dest: &Utf8Path) -> Result<(), Error> {
    std::fs::create_dir_all(dest).map_err(|err| Error::io(dest, err))?;
    for entry in src.read_dir_utf8().map_err(|err| Error::io(src, err))? {
        let entry = entry.map_err(|err| Error::io(src, err))?;
        let target = dest.join(entry.file_name());
        if entry.path().is_dir() {
            copy_tree(entry.path(), &target)?;
        } else {
            std::fs::copy(entry.path(), &target)
                .map_err(|err| Error::io(entry.path(), err))?;
        }
    }
    Ok(())
}
