//! Volume Core
//!
//! Translates storage-plane volume requests into ensure/remove calls on the
//! LVM engine: allocation rounding, striping policy, capacity accounting and
//! the shutdown-cleanup gate.

pub mod capacity;
pub mod cleanup;
pub mod core;
pub mod id;

pub use self::capacity::{allocation_size, CapacityRange};
pub use self::cleanup::{is_cleanup_required, CleanupGate};
pub use self::core::LvmVolumeCore;
pub use self::id::VolumeId;

// =============================================================================
// Driver identity
// =============================================================================

/// Name the driver registers under; only objects carrying it are processed
pub const DRIVER_NAME: &str = "local.csi.azure.com";

/// Topology segment key carrying the node identifier
pub const TOPOLOGY_KEY: &str = "topology.local.csi.azure.com/node";

/// Volume group used when a request does not name one
pub const DEFAULT_VOLUME_GROUP: &str = "containerstorage";

/// Tag identifying volume groups owned by the driver
pub const DEFAULT_VOLUME_GROUP_TAG: &str = "local-csi";

// =============================================================================
// Parameters and attributes
// =============================================================================

/// Storage class parameter overriding the volume group
pub const VOLUME_GROUP_PARAM: &str = "volumeGroup";

/// Size of the logical volume in MiB
pub const SIZE_MIB_KEY: &str = "sizeMiB";

/// Filesystem for mount access volumes
pub const FS_TYPE_PARAM: &str = "fsType";

pub const PVC_NAME_PARAM: &str = "csi.storage.k8s.io/pvc/name";
pub const PVC_NAMESPACE_PARAM: &str = "csi.storage.k8s.io/pvc/namespace";

/// Allocated bytes, recorded in the volume context
pub const CAPACITY_CONTEXT_KEY: &str = "localdisk.csi.acstor.io/capacity";

/// Requested limit bytes, recorded in the volume context
pub const LIMIT_CONTEXT_KEY: &str = "localdisk.csi.acstor.io/limit";

/// Owner annotation on the PersistentVolume
pub const SELECTED_NODE_ANNOTATION: &str = "localdisk.csi.acstor.io/selected-node";

/// Owner chosen at creation, kept in the volume attributes
pub const SELECTED_INITIAL_NODE_PARAM: &str = "localdisk.csi.acstor.io/selected-initial-node";

/// Prefix of the keys reserved by the orchestrator's sidecars
pub const RESERVED_PARAM_PREFIX: &str = "csi.storage.k8s.io/";

/// Failover policy of a volume: `availability` or `durability`
pub const FAILOVER_MODE_PARAM: &str = "localdisk.csi.acstor.io/failover-mode";

/// Well-known node label matched by workload affinity
pub const HOSTNAME_LABEL: &str = "kubernetes.io/hostname";

/// Label carried by capacity objects published for the driver
pub const DRIVER_NAME_LABEL: &str = "csi.storage.k8s.io/drivername";

// =============================================================================
// Finalizers
// =============================================================================

pub const PV_PROTECTION_FINALIZER: &str = "kubernetes.io/pv-protection";
pub const PROVISIONER_FINALIZER: &str = "external-provisioner.volume.kubernetes.io/finalizer";
