//! LVM Volume Core
//!
//! Idempotent ensure/remove routines over the LVM engine. The engine is the
//! only source of truth; nothing here caches volume state.

use super::capacity::{allocation_size, CapacityRange};
use super::id::VolumeId;
use super::{
    CAPACITY_CONTEXT_KEY, DEFAULT_VOLUME_GROUP, DEFAULT_VOLUME_GROUP_TAG, LIMIT_CONTEXT_KEY,
    RESERVED_PARAM_PREFIX, SIZE_MIB_KEY, TOPOLOGY_KEY, VOLUME_GROUP_PARAM,
};
use crate::csi::types::{Topology, Volume};
use crate::domain::ports::{DeviceProbeRef, LvmManagerRef};
use crate::error::{Error, Result};
use crate::events::EventSink;
use crate::lvm::{
    round_down_to_extent, round_up_to_extent, CreateLvOptions, CreatePvOptions,
    CreateVgOptions, IgnoreNotFound, LogicalVolume, LvLayout, LvmError, Selector, VolumeGroup,
    EXTENT_SIZE, MIB,
};
use std::collections::{HashMap, HashSet};
use tracing::{debug, info, warn};

// =============================================================================
// Event Reasons
// =============================================================================

const PROVISIONING_PV: &str = "ProvisioningPhysicalVolume";
const PROVISIONED_PV: &str = "ProvisionedPhysicalVolume";
const PROVISIONING_PV_FAILED: &str = "ProvisioningPhysicalVolumeFailed";
const PROVISIONING_VG: &str = "ProvisioningVolumeGroup";
const PROVISIONED_VG: &str = "ProvisionedVolumeGroup";
const PROVISIONING_VG_FAILED: &str = "ProvisioningVolumeGroupFailed";
const PROVISIONING_LV: &str = "ProvisioningLogicalVolume";
const PROVISIONED_LV: &str = "ProvisionedLogicalVolume";
const PROVISIONING_LV_FAILED: &str = "ProvisioningLogicalVolumeFailed";
const LV_SIZE_MISMATCH: &str = "ProvisionedLogicalVolumeSizeMismatch";

/// Per-device overhead reserved for LVM metadata
const PV_METADATA_OVERHEAD: u64 = MIB;

// =============================================================================
// Volume Core
// =============================================================================

/// Node-local volume lifecycle over the LVM engine
pub struct LvmVolumeCore {
    node_id: String,
    lvm: LvmManagerRef,
    probe: DeviceProbeRef,
}

impl LvmVolumeCore {
    pub fn new(node_id: impl Into<String>, lvm: LvmManagerRef, probe: DeviceProbeRef) -> Self {
        Self {
            node_id: node_id.into(),
            lvm,
            probe,
        }
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    /// Topology segment pinning a volume to this node
    pub fn topology(&self) -> Topology {
        Topology {
            segments: HashMap::from([(TOPOLOGY_KEY.to_string(), self.node_id.clone())]),
        }
    }

    /// Provision `name` with the rounded size of `capacity` and describe it
    pub async fn create(
        &self,
        name: &str,
        capacity: Option<&CapacityRange>,
        params: &HashMap<String, String>,
        events: &EventSink,
    ) -> Result<Volume> {
        let vg = params
            .get(VOLUME_GROUP_PARAM)
            .filter(|v| !v.is_empty())
            .map(String::as_str)
            .unwrap_or(DEFAULT_VOLUME_GROUP);
        let size = allocation_size(capacity)?;
        let id = VolumeId::new(vg, name);

        let ensure_params = HashMap::from([
            (SIZE_MIB_KEY.to_string(), (size / MIB).to_string()),
            (VOLUME_GROUP_PARAM.to_string(), vg.to_string()),
        ]);
        let lv = self.ensure_volume(&id, &ensure_params, events).await?;

        let mut context: HashMap<String, String> = params
            .iter()
            .filter(|(k, _)| !k.starts_with(RESERVED_PARAM_PREFIX))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        context.insert(CAPACITY_CONTEXT_KEY.to_string(), lv.size.to_string());
        let limit = capacity.map(|c| c.limit_bytes).unwrap_or_default();
        context.insert(LIMIT_CONTEXT_KEY.to_string(), limit.to_string());

        Ok(Volume {
            volume_id: id.to_string(),
            capacity_bytes: lv.size as i64,
            volume_context: context,
            accessible_topology: vec![self.topology()],
        })
    }

    // =========================================================================
    // Ensure
    // =========================================================================

    /// Create the logical volume behind `id` unless an identical one exists
    pub async fn ensure_volume(
        &self,
        id: &VolumeId,
        params: &HashMap<String, String>,
        events: &EventSink,
    ) -> Result<LogicalVolume> {
        let size_mib = params
            .get(SIZE_MIB_KEY)
            .filter(|v| !v.is_empty())
            .ok_or_else(|| Error::InvalidArgument(format!("{} parameter is required", SIZE_MIB_KEY)))?;
        let size_mib: u64 = size_mib.parse().map_err(|e| {
            Error::InvalidArgument(format!("invalid {} {:?}: {}", SIZE_MIB_KEY, size_mib, e))
        })?;
        if let Some(vg) = params.get(VOLUME_GROUP_PARAM) {
            if *vg != id.volume_group {
                return Err(Error::InvalidArgument(format!(
                    "volume group {} does not match volume id {}",
                    vg, id
                )));
            }
        }
        let size = size_mib
            .checked_mul(MIB)
            .and_then(|bytes| bytes.checked_next_multiple_of(EXTENT_SIZE))
            .ok_or_else(|| {
                Error::InvalidArgument(format!("{} {} is too large", SIZE_MIB_KEY, size_mib))
            })?;

        let existing = self
            .lvm
            .get_logical_volume(&id.volume_group, &id.logical_volume)
            .await
            .ignore_not_found()?;
        if let Some(lv) = existing {
            if lv.size == size {
                debug!("Logical volume {} already provisioned", id);
                return Ok(lv);
            }
            events
                .warning(
                    LV_SIZE_MISMATCH,
                    format!("logical volume {} has {} bytes, requested {}", id, lv.size, size),
                )
                .await;
            return Err(Error::VolumeSizeMismatch {
                volume_id: id.to_string(),
                expected: size,
                actual: lv.size,
            });
        }

        events
            .normal(PROVISIONING_LV, format!("provisioning logical volume {}", id))
            .await;

        let vg = match self
            .lvm
            .get_volume_group(&id.volume_group)
            .await
            .ignore_not_found()?
        {
            Some(vg) => vg,
            None => {
                let devices = self.ensure_physical_volumes(events).await?;
                self.ensure_volume_group(&id.volume_group, &devices, events)
                    .await?
            }
        };

        let layout = LvLayout::for_pv_count(vg.pv_count);
        info!(
            "Creating logical volume {} ({} bytes, {})",
            id, size, layout
        );
        let opts = CreateLvOptions {
            vg_name: id.volume_group.clone(),
            name: id.logical_volume.clone(),
            size_bytes: size,
            layout,
        };
        match self.lvm.create_logical_volume(&opts).await {
            Ok(lv) => {
                events
                    .normal(
                        PROVISIONED_LV,
                        format!("provisioned logical volume {} ({} bytes)", id, lv.size),
                    )
                    .await;
                Ok(lv)
            }
            Err(e) => {
                events
                    .warning(
                        PROVISIONING_LV_FAILED,
                        format!("failed to provision logical volume {}: {}", id, e),
                    )
                    .await;
                match e {
                    LvmError::ResourceExhausted(msg) => Err(Error::ResourceExhausted(msg)),
                    other => Err(other.into()),
                }
            }
        }
    }

    /// Return volume group `name`, creating it from `devices` when absent
    pub async fn ensure_volume_group(
        &self,
        name: &str,
        devices: &[String],
        events: &EventSink,
    ) -> Result<VolumeGroup> {
        if name.is_empty() {
            return Err(Error::InvalidArgument("volume group name is empty".into()));
        }
        if devices.is_empty() {
            return Err(Error::ResourceExhausted(format!(
                "no devices available for volume group {}",
                name
            )));
        }
        if let Some(vg) = self.lvm.get_volume_group(name).await.ignore_not_found()? {
            return Ok(vg);
        }

        events
            .normal(PROVISIONING_VG, format!("provisioning volume group {}", name))
            .await;
        let opts = CreateVgOptions {
            name: name.to_string(),
            pv_names: devices.to_vec(),
            tags: vec![DEFAULT_VOLUME_GROUP_TAG.to_string()],
        };
        match self.lvm.create_volume_group(&opts).await {
            Ok(()) => {}
            Err(LvmError::AlreadyExists(_)) => {
                debug!("Volume group {} created concurrently", name);
            }
            Err(LvmError::PvAlreadyInVolumeGroup(msg)) => {
                events
                    .warning(
                        PROVISIONING_VG_FAILED,
                        format!("failed to provision volume group {}: {}", name, msg),
                    )
                    .await;
                return Err(Error::ResourceExhausted(msg));
            }
            Err(e) => {
                events
                    .warning(
                        PROVISIONING_VG_FAILED,
                        format!("failed to provision volume group {}: {}", name, e),
                    )
                    .await;
                return Err(e.into());
            }
        }
        events
            .normal(PROVISIONED_VG, format!("provisioned volume group {}", name))
            .await;
        info!("Volume group {} ready on {} devices", name, devices.len());

        Ok(self.lvm.get_volume_group(name).await?)
    }

    /// Initialise every candidate device as a physical volume
    pub async fn ensure_physical_volumes(&self, events: &EventSink) -> Result<Vec<String>> {
        let devices = match self.probe.scan_devices().await {
            Ok(devices) => devices,
            Err(e @ (Error::NoDevicesFound | Error::NoDevicesMatchingFilter)) => {
                events
                    .warning(
                        PROVISIONING_PV_FAILED,
                        format!("no devices to provision physical volumes: {}", e),
                    )
                    .await;
                return Err(Error::ResourceExhausted(e.to_string()));
            }
            Err(e) => return Err(e),
        };

        let existing: HashSet<String> = self
            .lvm
            .list_physical_volumes(None)
            .await?
            .into_iter()
            .map(|pv| pv.name)
            .collect();

        for device in devices.iter().filter(|d| !existing.contains(*d)) {
            events
                .normal(
                    PROVISIONING_PV,
                    format!("provisioning physical volume {}", device),
                )
                .await;
            let opts = CreatePvOptions {
                name: device.clone(),
            };
            if let Err(e) = self.lvm.create_physical_volume(&opts).await {
                events
                    .warning(
                        PROVISIONING_PV_FAILED,
                        format!("failed to provision physical volume {}: {}", device, e),
                    )
                    .await;
                return Err(e.into());
            }
            events
                .normal(
                    PROVISIONED_PV,
                    format!("provisioned physical volume {}", device),
                )
                .await;
        }
        Ok(devices)
    }

    // =========================================================================
    // Delete / Expand
    // =========================================================================

    /// Remove the logical volume behind `volume_id`; absent volumes are success
    pub async fn delete(&self, volume_id: &str) -> Result<()> {
        let id = match volume_id.parse::<VolumeId>() {
            Ok(id) => id,
            Err(e) => {
                warn!("Ignoring delete of malformed volume id {}: {}", volume_id, e);
                return Ok(());
            }
        };
        self.lvm
            .remove_logical_volume(&id.volume_group, &id.logical_volume)
            .await
            .ignore_not_found()?;
        info!("Deleted logical volume {}", id);
        Ok(())
    }

    /// Grow the logical volume to cover `required_bytes`, returning its size
    pub async fn expand(&self, volume_id: &str, required_bytes: u64) -> Result<u64> {
        let id: VolumeId = volume_id.parse()?;
        let size = self
            .lvm
            .extend_logical_volume(
                &id.volume_group,
                &id.logical_volume,
                round_up_to_extent(required_bytes),
            )
            .await
            .map_err(|e| match e {
                LvmError::NotFound(_) => Error::VolumeNotFound(volume_id.to_string()),
                LvmError::ResourceExhausted(msg) => Error::ResourceExhausted(msg),
                other => other.into(),
            })?;
        info!("Expanded logical volume {} to {} bytes", id, size);
        Ok(size)
    }

    // =========================================================================
    // Capacity / List
    // =========================================================================

    /// Bytes still allocatable in `vg`, counting devices not yet claimed
    pub async fn available_capacity(&self, vg: &str) -> Result<u64> {
        if let Some(group) = self.lvm.get_volume_group(vg).await.ignore_not_found()? {
            return Ok(group.free);
        }

        let devices = match self.probe.scan_available_devices().await {
            Ok(devices) => devices,
            Err(Error::NoDevicesFound | Error::NoDevicesMatchingFilter) => return Ok(0),
            Err(e) => return Err(e),
        };

        let claimed_elsewhere: HashSet<String> = self
            .lvm
            .list_physical_volumes(None)
            .await?
            .into_iter()
            .filter(|pv| !pv.vg_name.is_empty() && pv.vg_name != vg)
            .map(|pv| pv.name)
            .collect();

        Ok(devices
            .iter()
            .filter(|d| !claimed_elsewhere.contains(&d.device_path()))
            .map(|d| round_down_to_extent(d.size.saturating_sub(PV_METADATA_OVERHEAD)))
            .sum())
    }

    /// Available capacity of the volume group named by `params`
    pub async fn get_capacity(&self, params: &HashMap<String, String>) -> Result<u64> {
        let vg = params
            .get(VOLUME_GROUP_PARAM)
            .filter(|v| !v.is_empty())
            .map(String::as_str)
            .unwrap_or(DEFAULT_VOLUME_GROUP);
        self.available_capacity(vg).await
    }

    /// Every logical volume in a driver-tagged volume group
    pub async fn list(&self) -> Result<Vec<Volume>> {
        let tag = Selector::VgTag(DEFAULT_VOLUME_GROUP_TAG.to_string());
        let mut volumes = Vec::new();
        for vg in self.lvm.list_volume_groups(Some(&tag)).await? {
            let select = Selector::VgName(vg.name.clone());
            for lv in self.lvm.list_logical_volumes(Some(&select)).await? {
                volumes.push(Volume {
                    volume_id: VolumeId::new(&lv.vg_name, &lv.name).to_string(),
                    capacity_bytes: lv.size as i64,
                    volume_context: HashMap::new(),
                    accessible_topology: vec![self.topology()],
                });
            }
        }
        Ok(volumes)
    }

    // =========================================================================
    // Lookups
    // =========================================================================

    /// Logical volume name of `volume_id`
    pub fn get_volume_name(&self, volume_id: &str) -> Result<String> {
        Ok(volume_id.parse::<VolumeId>()?.logical_volume)
    }

    /// Device path of `volume_id` on this node, empty when it does not live here
    pub async fn get_node_device_path(&self, volume_id: &str) -> Result<String> {
        let id: VolumeId = volume_id.parse()?;
        let lv = self
            .lvm
            .get_logical_volume(&id.volume_group, &id.logical_volume)
            .await
            .ignore_not_found()?;
        Ok(match lv {
            Some(lv) if !lv.path.is_empty() => lv.path,
            Some(_) => id.device_path(),
            None => String::new(),
        })
    }

    pub async fn get_logical_volume(&self, volume_id: &str) -> Result<LogicalVolume> {
        let id: VolumeId = volume_id.parse()?;
        self.lvm
            .get_logical_volume(&id.volume_group, &id.logical_volume)
            .await
            .map_err(|e| match e {
                LvmError::NotFound(_) => Error::VolumeNotFound(volume_id.to_string()),
                other => other.into(),
            })
    }

    /// Confirm that `volume_id` names an existing volume on this node
    pub async fn validate_capabilities(&self, volume_id: &str) -> Result<()> {
        self.get_logical_volume(volume_id).await.map(|_| ())
    }

    // =========================================================================
    // Cleanup
    // =========================================================================

    /// Remove every driver-tagged volume group and the physical volumes on
    /// candidate devices
    pub async fn cleanup(&self) -> Result<()> {
        let devices = match self.probe.scan_devices().await {
            Ok(devices) => devices,
            Err(Error::NoDevicesFound | Error::NoDevicesMatchingFilter) => Vec::new(),
            Err(e) => return Err(e),
        };

        let tag = Selector::VgTag(DEFAULT_VOLUME_GROUP_TAG.to_string());
        for vg in self.lvm.list_volume_groups(Some(&tag)).await? {
            if self
                .lvm
                .get_volume_group(&vg.name)
                .await
                .ignore_not_found()?
                .is_none()
            {
                continue;
            }
            info!("Removing volume group {}", vg.name);
            self.lvm
                .remove_volume_group(&vg.name)
                .await
                .ignore_not_found()?;
        }

        let pvs: HashSet<String> = self
            .lvm
            .list_physical_volumes(None)
            .await?
            .into_iter()
            .map(|pv| pv.name)
            .collect();
        for device in devices.iter().filter(|d| pvs.contains(*d)) {
            info!("Removing physical volume {}", device);
            self.lvm
                .remove_physical_volume(device)
                .await
                .ignore_not_found()?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::ports::LvmManager;
    use crate::events::node_ref;
    use crate::probe::BlockDevice;
    use crate::testing::{FakeLvm, FakeProbe, LvmCall, RecordingEvents};
    use crate::lvm::PhysicalVolume;
    use assert_matches::assert_matches;
    use std::sync::Arc;

    const GIB: u64 = 1 << 30;

    fn blank(name: &str, size: u64) -> BlockDevice {
        BlockDevice {
            name: name.to_string(),
            path: format!("/dev/{}", name),
            size,
            device_type: "disk".to_string(),
            ..Default::default()
        }
    }

    fn core_with(lvm: Arc<FakeLvm>, probe: FakeProbe) -> LvmVolumeCore {
        LvmVolumeCore::new("node-1", lvm, Arc::new(probe))
    }

    fn two_disk_probe() -> FakeProbe {
        FakeProbe::new(vec![blank("sdb", 20 * GIB), blank("sdc", 20 * GIB)])
    }

    fn size_params(mib: u64) -> HashMap<String, String> {
        HashMap::from([(SIZE_MIB_KEY.to_string(), mib.to_string())])
    }

    #[tokio::test]
    async fn test_fresh_provisioning_stripes_across_devices() {
        let lvm = Arc::new(FakeLvm::default());
        let core = core_with(lvm.clone(), two_disk_probe());

        let volume = core
            .create(
                "pvc-x",
                Some(&CapacityRange {
                    required_bytes: GIB as i64,
                    limit_bytes: 0,
                }),
                &HashMap::new(),
                &EventSink::detached(),
            )
            .await
            .unwrap();

        assert_eq!(volume.volume_id, "containerstorage#pvc-x");
        assert_eq!(volume.capacity_bytes, GIB as i64);
        assert_eq!(
            volume.accessible_topology[0].segments.get(TOPOLOGY_KEY).map(String::as_str),
            Some("node-1")
        );

        let vg = lvm.get_volume_group("containerstorage").await.unwrap();
        assert_eq!(vg.pv_count, 2);
        assert_eq!(vg.tags, vec![DEFAULT_VOLUME_GROUP_TAG.to_string()]);
        assert_eq!(
            lvm.created_layout("containerstorage", "pvc-x"),
            Some(LvLayout::Striped { stripes: 2 })
        );
    }

    #[tokio::test]
    async fn test_create_volume_context() {
        let lvm = Arc::new(FakeLvm::default());
        let core = core_with(lvm, two_disk_probe());
        let params = HashMap::from([
            (VOLUME_GROUP_PARAM.to_string(), "fast".to_string()),
            ("csi.storage.k8s.io/pvc/name".to_string(), "claim".to_string()),
        ]);

        let volume = core
            .create(
                "pvc-y",
                Some(&CapacityRange {
                    required_bytes: (GIB + 2 * MIB) as i64,
                    limit_bytes: (2 * GIB + 3 * MIB) as i64,
                }),
                &params,
                &EventSink::detached(),
            )
            .await
            .unwrap();

        assert_eq!(volume.volume_id, "fast#pvc-y");
        assert_eq!(volume.capacity_bytes, 1077936128);
        assert_eq!(volume.volume_context.get(VOLUME_GROUP_PARAM).unwrap(), "fast");
        assert_eq!(volume.volume_context.get(CAPACITY_CONTEXT_KEY).unwrap(), "1077936128");
        assert_eq!(volume.volume_context.get(LIMIT_CONTEXT_KEY).unwrap(), "2150629376");
        assert!(!volume.volume_context.contains_key("csi.storage.k8s.io/pvc/name"));
    }

    #[tokio::test]
    async fn test_ensure_volume_is_idempotent() {
        let lvm = Arc::new(FakeLvm::default());
        let core = core_with(lvm.clone(), two_disk_probe());
        let id = VolumeId::new("containerstorage", "pvc-1");

        let first = core
            .ensure_volume(&id, &size_params(1024), &EventSink::detached())
            .await
            .unwrap();
        let mutations = lvm.mutation_count();

        let second = core
            .ensure_volume(&id, &size_params(1024), &EventSink::detached())
            .await
            .unwrap();
        assert_eq!(first, second);
        assert_eq!(lvm.mutation_count(), mutations);
    }

    #[tokio::test]
    async fn test_ensure_volume_size_mismatch() {
        let lvm = Arc::new(FakeLvm::default());
        let core = core_with(lvm, two_disk_probe());
        let recorder = Arc::new(RecordingEvents::default());
        let events = EventSink::new(recorder.clone(), Some(node_ref("node-1")));
        let id = VolumeId::new("containerstorage", "pvc-1");

        core.ensure_volume(&id, &size_params(1024), &events).await.unwrap();
        let result = core.ensure_volume(&id, &size_params(2048), &events).await;

        assert_matches!(result, Err(Error::VolumeSizeMismatch { expected, actual, .. }) => {
            assert_eq!(expected, 2 * GIB);
            assert_eq!(actual, GIB);
        });
        assert!(recorder.reasons().contains(&LV_SIZE_MISMATCH.to_string()));
    }

    #[tokio::test]
    async fn test_ensure_volume_validates_params() {
        let core = core_with(Arc::new(FakeLvm::default()), two_disk_probe());
        let id = VolumeId::new("containerstorage", "pvc-1");
        let sink = EventSink::detached();

        assert_matches!(
            core.ensure_volume(&id, &HashMap::new(), &sink).await,
            Err(Error::InvalidArgument(_))
        );
        assert_matches!(
            core.ensure_volume(&id, &HashMap::from([(SIZE_MIB_KEY.to_string(), "ten".to_string())]), &sink)
                .await,
            Err(Error::InvalidArgument(_))
        );

        assert_matches!(
            core.ensure_volume(&id, &size_params(u64::MAX / MIB + 1), &sink).await,
            Err(Error::InvalidArgument(_))
        );

        let mut params = size_params(4);
        params.insert(VOLUME_GROUP_PARAM.to_string(), "other".to_string());
        assert_matches!(
            core.ensure_volume(&id, &params, &sink).await,
            Err(Error::InvalidArgument(_))
        );
    }

    #[tokio::test]
    async fn test_ensure_volume_without_devices_is_exhausted() {
        let core = core_with(Arc::new(FakeLvm::default()), FakeProbe::new(vec![]));
        let id = VolumeId::new("containerstorage", "pvc-1");
        assert_matches!(
            core.ensure_volume(&id, &size_params(4), &EventSink::detached()).await,
            Err(Error::ResourceExhausted(_))
        );
    }

    #[tokio::test]
    async fn test_ensure_volume_group_maps_claimed_pv() {
        let lvm = Arc::new(FakeLvm::default());
        lvm.fail_next_vg_create(LvmError::PvAlreadyInVolumeGroup("/dev/sdb".into()));
        let core = core_with(lvm, two_disk_probe());
        let recorder = Arc::new(RecordingEvents::default());
        let events = EventSink::new(recorder.clone(), Some(node_ref("node-1")));

        let result = core
            .ensure_volume_group("containerstorage", &["/dev/sdb".to_string()], &events)
            .await;
        assert_matches!(result, Err(Error::ResourceExhausted(_)));
        assert!(recorder
            .reasons()
            .contains(&PROVISIONING_VG_FAILED.to_string()));
    }

    #[tokio::test]
    async fn test_ensure_volume_group_tolerates_concurrent_create() {
        let lvm = Arc::new(FakeLvm::default());
        lvm.fail_next_vg_create(LvmError::AlreadyExists("containerstorage".into()));
        lvm.add_volume_group("containerstorage", &["/dev/sdb"], &[DEFAULT_VOLUME_GROUP_TAG]);
        let core = core_with(lvm, two_disk_probe());

        // Existing group is returned without attempting a create
        let vg = core
            .ensure_volume_group("containerstorage", &["/dev/sdb".to_string()], &EventSink::detached())
            .await
            .unwrap();
        assert_eq!(vg.name, "containerstorage");
    }

    #[tokio::test]
    async fn test_ensure_volume_group_rejects_empty_input() {
        let core = core_with(Arc::new(FakeLvm::default()), two_disk_probe());
        let sink = EventSink::detached();
        assert_matches!(
            core.ensure_volume_group("", &["/dev/sdb".to_string()], &sink).await,
            Err(Error::InvalidArgument(_))
        );
        assert_matches!(
            core.ensure_volume_group("vg", &[], &sink).await,
            Err(Error::ResourceExhausted(_))
        );
    }

    #[tokio::test]
    async fn test_ensure_physical_volumes_skips_existing() {
        let lvm = Arc::new(FakeLvm::default());
        lvm.add_physical_volume("/dev/sdb", "");
        let core = core_with(lvm.clone(), two_disk_probe());

        let devices = core
            .ensure_physical_volumes(&EventSink::detached())
            .await
            .unwrap();
        assert_eq!(devices, vec!["/dev/sdb", "/dev/sdc"]);
        assert_eq!(
            lvm.calls(),
            vec![LvmCall::CreatePhysicalVolume("/dev/sdc".to_string())]
        );
    }

    #[tokio::test]
    async fn test_linear_layout_on_single_device() {
        let lvm = Arc::new(FakeLvm::default());
        let core = core_with(lvm.clone(), FakeProbe::new(vec![blank("sdb", 20 * GIB)]));
        let id = VolumeId::new("containerstorage", "pvc-1");

        core.ensure_volume(&id, &size_params(10), &EventSink::detached())
            .await
            .unwrap();
        assert_eq!(
            lvm.created_layout("containerstorage", "pvc-1"),
            Some(LvLayout::Linear)
        );
        let lv = lvm.get_logical_volume("containerstorage", "pvc-1").await.unwrap();
        assert_eq!(lv.size, 3 * EXTENT_SIZE);
    }

    #[tokio::test]
    async fn test_available_capacity_from_devices() {
        let mib = MIB;
        let cases: Vec<(Vec<BlockDevice>, u64)> = vec![
            (vec![blank("sdb", 10 * mib)], 8 * mib),
            (vec![blank("sdb", 10 * mib), blank("sdc", 10 * mib)], 16 * mib),
            (vec![blank("sdb", 20 * mib), blank("sdc", 10 * mib)], 24 * mib),
            (vec![blank("sdb", 5 * 1024)], 0),
            (vec![], 0),
        ];
        for (devices, expected) in cases {
            let core = core_with(Arc::new(FakeLvm::default()), FakeProbe::new(devices));
            assert_eq!(core.available_capacity("containerstorage").await.unwrap(), expected);
        }
    }

    #[tokio::test]
    async fn test_available_capacity_skips_foreign_pvs() {
        let lvm = Arc::new(FakeLvm::default());
        lvm.add_physical_volume("/dev/sdb", "other");
        lvm.add_physical_volume("/dev/sdc", "containerstorage-pending");
        let core = core_with(
            lvm,
            FakeProbe::new(vec![blank("sdb", 10 * MIB), blank("sdd", 10 * MIB)]),
        );
        assert_eq!(core.available_capacity("containerstorage").await.unwrap(), 8 * MIB);
    }

    #[tokio::test]
    async fn test_available_capacity_of_existing_group() {
        let lvm = Arc::new(FakeLvm::default());
        lvm.add_volume_group("containerstorage", &["/dev/sdb"], &[DEFAULT_VOLUME_GROUP_TAG]);
        let free = lvm.get_volume_group("containerstorage").await.unwrap().free;
        let core = core_with(lvm, FakeProbe::new(vec![]));
        assert_eq!(core.available_capacity("containerstorage").await.unwrap(), free);
    }

    #[tokio::test]
    async fn test_delete_is_idempotent() {
        let lvm = Arc::new(FakeLvm::default());
        let core = core_with(lvm.clone(), two_disk_probe());
        let id = VolumeId::new("containerstorage", "pvc-1");
        core.ensure_volume(&id, &size_params(4), &EventSink::detached())
            .await
            .unwrap();

        core.delete("containerstorage#pvc-1").await.unwrap();
        core.delete("containerstorage#pvc-1").await.unwrap();
        core.delete("not-an-id").await.unwrap();
        assert_eq!(core.get_node_device_path("containerstorage#pvc-1").await.unwrap(), "");
    }

    #[tokio::test]
    async fn test_expand_rounds_up() {
        let lvm = Arc::new(FakeLvm::default());
        let core = core_with(lvm, two_disk_probe());
        let id = VolumeId::new("containerstorage", "pvc-1");
        core.ensure_volume(&id, &size_params(4), &EventSink::detached())
            .await
            .unwrap();

        let size = core.expand("containerstorage#pvc-1", 9 * MIB).await.unwrap();
        assert_eq!(size, 3 * EXTENT_SIZE);
        assert_matches!(
            core.expand("containerstorage#missing", GIB).await,
            Err(Error::VolumeNotFound(_))
        );
    }

    #[tokio::test]
    async fn test_list_and_lookups() {
        let lvm = Arc::new(FakeLvm::default());
        let core = core_with(lvm.clone(), two_disk_probe());
        for name in ["pvc-1", "pvc-2"] {
            core.ensure_volume(
                &VolumeId::new("containerstorage", name),
                &size_params(4),
                &EventSink::detached(),
            )
            .await
            .unwrap();
        }
        // Untagged group is not listed
        lvm.add_volume_group("foreign", &["/dev/sdz"], &[]);

        let mut ids: Vec<String> = core.list().await.unwrap().into_iter().map(|v| v.volume_id).collect();
        ids.sort();
        assert_eq!(ids, vec!["containerstorage#pvc-1", "containerstorage#pvc-2"]);

        assert_eq!(core.get_volume_name("containerstorage#pvc-1").unwrap(), "pvc-1");
        assert_eq!(
            core.get_node_device_path("containerstorage#pvc-1").await.unwrap(),
            "/dev/containerstorage/pvc-1"
        );
        assert_matches!(
            core.validate_capabilities("containerstorage#nope").await,
            Err(Error::VolumeNotFound(_))
        );
        assert_matches!(core.get_volume_name("bad"), Err(Error::InvalidArgument(_)));
    }

    #[tokio::test]
    async fn test_cleanup_removes_tagged_groups_and_pvs() {
        let lvm = Arc::new(FakeLvm::default());
        let core = core_with(lvm.clone(), two_disk_probe());
        core.ensure_volume(
            &VolumeId::new("containerstorage", "pvc-1"),
            &size_params(4),
            &EventSink::detached(),
        )
        .await
        .unwrap();
        lvm.add_volume_group("foreign", &["/dev/sdz"], &[]);

        core.cleanup().await.unwrap();

        assert!(lvm.get_volume_group("containerstorage").await.is_err());
        assert!(lvm.get_volume_group("foreign").await.is_ok());
        let remaining: Vec<PhysicalVolume> = lvm.list_physical_volumes(None).await.unwrap();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].name, "/dev/sdz");
    }
}
