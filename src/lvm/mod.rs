//! LVM Engine
//!
//! Physical volume, volume group and logical volume primitives with an
//! explicit error taxonomy. Idempotent callers use [`IgnoreNotFound`] to
//! treat absent objects as success.

pub mod cli;
pub mod error;
pub mod types;

pub use cli::{LvmCli, LvmConfig};
pub use error::{IgnoreNotFound, LvmError, LvmResult};
pub use types::{
    round_down_to_extent, round_up_to_extent, CreateLvOptions, CreatePvOptions, CreateVgOptions,
    LogicalVolume, LvLayout, PhysicalVolume, Selector, VolumeGroup, EXTENT_SIZE, MIB,
};
