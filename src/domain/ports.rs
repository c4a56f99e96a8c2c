//! Domain Ports - Capability traits at the driver's seams
//!
//! Each trait covers one group of operations a component consumes. Adapters
//! implement them against the LVM tools, the mount helper, the block device
//! utilities and the Kubernetes API; tests substitute in-memory fakes.

use crate::error::Result;
use crate::events::EventType;
use crate::lvm::{
    CreateLvOptions, CreatePvOptions, CreateVgOptions, LogicalVolume, LvmResult,
    PhysicalVolume, Selector, VolumeGroup,
};
use crate::node::throttle::ThrottleRequest;
use crate::probe::BlockDevice;
use async_trait::async_trait;
use k8s_openapi::api::apps::v1::DaemonSet;
use k8s_openapi::api::core::v1::{
    Node, ObjectReference, PersistentVolume, PersistentVolumeClaim, Pod,
};
use k8s_openapi::api::storage::v1::{CSIStorageCapacity, StorageClass};
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

// =============================================================================
// Block Devices
// =============================================================================

/// Raw access to the block device enumeration utilities
#[async_trait]
pub trait BlockDevices: Send + Sync {
    /// Enumerate every block device known to the kernel
    async fn get_devices(&self) -> Result<Vec<BlockDevice>>;

    /// Check whether the device carries no recognisable signature
    async fn is_unformatted(&self, device: &str) -> Result<bool>;
}

/// Candidate device discovery with filtering applied
#[async_trait]
pub trait DeviceProbe: Send + Sync {
    /// Paths of all devices passing the filter, sorted
    async fn scan_devices(&self) -> Result<Vec<String>>;

    /// Devices passing the filter that carry no filesystem or LVM signature
    async fn scan_available_devices(&self) -> Result<Vec<BlockDevice>>;
}

// =============================================================================
// LVM
// =============================================================================

/// Physical volume, volume group and logical volume primitives
#[async_trait]
pub trait LvmManager: Send + Sync {
    async fn create_physical_volume(&self, opts: &CreatePvOptions) -> LvmResult<()>;
    async fn remove_physical_volume(&self, name: &str) -> LvmResult<()>;
    async fn list_physical_volumes(
        &self,
        select: Option<&Selector>,
    ) -> LvmResult<Vec<PhysicalVolume>>;

    async fn create_volume_group(&self, opts: &CreateVgOptions) -> LvmResult<()>;
    async fn remove_volume_group(&self, name: &str) -> LvmResult<()>;
    async fn get_volume_group(&self, name: &str) -> LvmResult<VolumeGroup>;
    async fn list_volume_groups(&self, select: Option<&Selector>) -> LvmResult<Vec<VolumeGroup>>;

    /// Create a logical volume; the returned volume carries the allocated size
    async fn create_logical_volume(&self, opts: &CreateLvOptions) -> LvmResult<LogicalVolume>;
    /// Grow a logical volume to at least `size_bytes`, returning the new size
    async fn extend_logical_volume(&self, vg: &str, name: &str, size_bytes: u64) -> LvmResult<u64>;
    async fn remove_logical_volume(&self, vg: &str, name: &str) -> LvmResult<()>;
    async fn get_logical_volume(&self, vg: &str, name: &str) -> LvmResult<LogicalVolume>;
    async fn list_logical_volumes(
        &self,
        select: Option<&Selector>,
    ) -> LvmResult<Vec<LogicalVolume>>;

    /// Whether the LVM tooling is installed on this host
    fn is_supported(&self) -> bool;
}

// =============================================================================
// Mounts
// =============================================================================

/// Filesystem mount helper
#[async_trait]
pub trait Mounter: Send + Sync {
    /// Check whether `path` is currently a mount point
    async fn is_mount_point(&self, path: &Path) -> Result<bool>;

    /// Bind-mount `source` onto `target`
    async fn bind_mount(&self, source: &Path, target: &Path, read_only: bool) -> Result<()>;

    /// Format `device` with `fs_type` when it carries no filesystem, then mount it
    async fn format_and_mount(
        &self,
        device: &Path,
        target: &Path,
        fs_type: &str,
        options: &[String],
    ) -> Result<()>;

    /// Unmount `target`; an unmounted path is not an error
    async fn unmount(&self, target: &Path) -> Result<()>;

    /// Unmount every mount point backed by `device_path`
    async fn cleanup_staging_dir(&self, device_path: &str) -> Result<()>;

    /// Grow the filesystem on `device` mounted at `mount_path`
    async fn resize_filesystem(&self, device: &Path, mount_path: &Path) -> Result<()>;
}

// =============================================================================
// Events
// =============================================================================

/// Best-effort event emission; failures are logged, never surfaced
#[async_trait]
pub trait EventRecorder: Send + Sync {
    async fn record(
        &self,
        target: &ObjectReference,
        event_type: EventType,
        reason: &str,
        note: &str,
    );
}

// =============================================================================
// Cluster API
// =============================================================================

/// The subset of the Kubernetes API the driver reads and patches.
///
/// Getters return `Ok(None)` for absent objects.
#[async_trait]
pub trait ClusterApi: Send + Sync {
    async fn get_persistent_volume(&self, name: &str) -> Result<Option<PersistentVolume>>;
    async fn delete_persistent_volume(&self, name: &str) -> Result<()>;

    /// Replace the finalizer list in a single patch
    async fn patch_persistent_volume_finalizers(
        &self,
        name: &str,
        finalizers: &[String],
    ) -> Result<()>;

    /// Merge annotations, removing keys mapped to `None`; `resource_version`
    /// guards against concurrent writers
    async fn patch_persistent_volume_annotations(
        &self,
        name: &str,
        resource_version: Option<&str>,
        annotations: &BTreeMap<String, Option<String>>,
    ) -> Result<()>;

    async fn get_node(&self, name: &str) -> Result<Option<Node>>;
    async fn get_pod(&self, namespace: &str, name: &str) -> Result<Option<Pod>>;
    async fn get_daemon_set(&self, namespace: &str, name: &str) -> Result<Option<DaemonSet>>;
    async fn get_persistent_volume_claim(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<PersistentVolumeClaim>>;
    async fn get_storage_class(&self, name: &str) -> Result<Option<StorageClass>>;

    async fn list_storage_capacities(
        &self,
        namespace: &str,
        label_selector: &str,
    ) -> Result<Vec<CSIStorageCapacity>>;
    async fn delete_storage_capacity(&self, namespace: &str, name: &str) -> Result<()>;
}

// =============================================================================
// Garbage Collection
// =============================================================================

/// Everything the GC reconcilers need from the volume stack
#[async_trait]
pub trait LvmVolumeManager: Send + Sync {
    /// Remove the logical volume behind `volume_id`; absent volumes are success
    async fn delete_volume(&self, volume_id: &str) -> Result<()>;

    /// Logical volume name (and PersistentVolume name) for `volume_id`
    fn get_volume_name(&self, volume_id: &str) -> Result<String>;

    /// Device path on this node, empty when the volume does not live here
    async fn get_node_device_path(&self, volume_id: &str) -> Result<String>;

    /// Unmount every mount point of `device_path`
    async fn unmount_volume(&self, device_path: &str) -> Result<()>;

    async fn list_logical_volumes(&self, select: Option<&Selector>) -> Result<Vec<LogicalVolume>>;
    async fn list_volume_groups(&self, select: Option<&Selector>) -> Result<Vec<VolumeGroup>>;
}

// =============================================================================
// Throttling
// =============================================================================

/// Out-of-band update of the IO limits of pods using a volume
#[async_trait]
pub trait ThrottlingUpdater: Send + Sync {
    async fn update_running_pods_throttling(
        &self,
        volume_id: &str,
        request: &ThrottleRequest,
    ) -> Result<()>;
}

// =============================================================================
// Shared references
// =============================================================================

pub type BlockDevicesRef = Arc<dyn BlockDevices>;
pub type DeviceProbeRef = Arc<dyn DeviceProbe>;
pub type LvmManagerRef = Arc<dyn LvmManager>;
pub type MounterRef = Arc<dyn Mounter>;
pub type EventRecorderRef = Arc<dyn EventRecorder>;
pub type ClusterApiRef = Arc<dyn ClusterApi>;
pub type LvmVolumeManagerRef = Arc<dyn LvmVolumeManager>;
pub type ThrottlingUpdaterRef = Arc<dyn ThrottlingUpdater>;
