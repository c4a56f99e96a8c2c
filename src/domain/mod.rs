//! Domain layer - Port definitions
//!
//! The traits adapters implement so the volume, node and GC logic can be
//! exercised without LVM, mounts or an API server.

pub mod ports;

pub use ports::*;
