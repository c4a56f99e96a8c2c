//! Local LVM CSI Driver
//!
//! A node-local block-storage provisioner. Each worker pools its local disks
//! into an LVM volume group, carves logical volumes out of it for the
//! orchestrator's storage plane and reclaims volumes that no longer belong on
//! the node.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────── per node ─────────────────────────────┐
//! │                                                                   │
//! │   storage-plane socket ──► csi::{ControllerService, NodeService}  │
//! │                                     │                             │
//! │                                     ▼                             │
//! │   probe::DeviceScanner ──► volume::LvmVolumeCore ──► lvm::LvmCli  │
//! │                                     ▲                             │
//! │   gc::VolumeHandleIndex ──► gc::{FailoverReconciler,              │
//! │                                  OrphanScanner}                   │
//! │   capacity::CapacityCleaner   volume::CleanupGate                 │
//! └───────────────────────────────────────────────────────────────────┘
//!
//! ┌─────────────────────────── cluster-wide ──────────────────────────┐
//! │   admission::HyperconvergedHandler (mutating webhook)             │
//! │   reaper::ReleasedVolumeReaper (under leader::LeaderElector)      │
//! └───────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Modules
//!
//! - [`probe`]: Block device discovery and filtering
//! - [`lvm`]: LVM command-line engine
//! - [`volume`]: Volume lifecycle core and shutdown cleanup
//! - [`node`]: Mounts and per-pod I/O throttling
//! - [`csi`]: Storage-plane controller and node services over `csi.v1` gRPC
//! - [`gc`]: Orphan volume garbage collection
//! - [`admission`]: Pod/volume co-location webhook
//! - [`reaper`]: Finalizer removal for volumes of vanished nodes
//! - [`capacity`]: Stale CSIStorageCapacity cleanup
//! - [`domain`]: Ports between the core and its collaborators
//! - [`error`]: Error types and handling

pub mod admission;
pub mod capacity;
pub mod cluster;
pub mod csi;
pub mod domain;
pub mod error;
pub mod events;
pub mod gc;
pub mod leader;
pub mod lvm;
pub mod manager;
pub mod metrics;
pub mod node;
pub mod probe;
pub mod reaper;
pub mod volume;

#[cfg(test)]
mod testing;

// Re-export commonly used types
pub use admission::{FailoverMode, HyperconvergedHandler, WebhookConfig};
pub use capacity::{CapacityCleaner, CapacityCleanupConfig};
pub use cluster::KubeCluster;
pub use csi::{ControllerConfig, ControllerService, CsiController, CsiNode, CsiServer};
pub use domain::ports::{
    BlockDevices, ClusterApi, DeviceProbe, EventRecorder, LvmManager, LvmVolumeManager, Mounter,
    ThrottlingUpdater,
};
pub use error::{Error, ErrorAction, ErrorKind, Result};
pub use events::{KubeEventRecorder, NoopRecorder};
pub use gc::{FailoverReconciler, OrphanScanner, OrphanScannerConfig, VolumeHandleIndex};
pub use leader::{LeaderElector, LeaseConfig};
pub use lvm::{LvmCli, LvmConfig, LvmError};
pub use manager::TaskManager;
pub use metrics::{Metrics, Readiness};
pub use node::{NodeService, SystemMounter, ThrottleConfig};
pub use probe::{DeviceScanner, LsblkBlockDevices, ScannerConfig};
pub use reaper::ReleasedVolumeReaper;
pub use volume::{CleanupGate, LvmVolumeCore, VolumeId, DRIVER_NAME};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Library name
pub const NAME: &str = env!("CARGO_PKG_NAME");
