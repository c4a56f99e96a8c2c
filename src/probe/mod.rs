//! Device Probe
//!
//! Enumerates local block devices and selects the ones the driver may turn
//! into LVM physical volumes.

pub mod block;
pub mod filter;
pub mod scanner;

pub use block::{BlockDevice, DeviceList, LsblkBlockDevices};
pub use filter::{DeviceFilter, FilterConfig};
pub use scanner::{DeviceScanner, ScannerConfig};
