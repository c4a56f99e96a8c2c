//! Garbage Collection
//!
//! Keeps one invariant: every driver-tagged logical volume on this node is
//! backed by a PersistentVolume whose owner is this node. Two paths enforce
//! it. The failover reconciler reacts to ownership changes as they happen;
//! the orphan scanner sweeps periodically for anything that slipped past.

pub mod adapter;
pub mod failover;
pub mod index;
pub mod owner;
pub mod scanner;

pub use adapter::VolumeManagerAdapter;
pub use failover::{moved_off_node, FailoverReconciler};
pub use index::{PvUpdate, VolumeHandleIndex};
pub use owner::{has_owner_mismatch, owner_node, volume_handle};
pub use scanner::{OrphanScanner, OrphanScannerConfig, ScanReport};
