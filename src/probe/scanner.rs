//! Device Scanner
//!
//! Applies the [`DeviceFilter`] to the devices reported by a
//! [`BlockDevices`] adapter. Results are sorted so volume group membership is
//! deterministic across restarts.

use super::block::BlockDevice;
use super::filter::{DeviceFilter, FilterConfig};
use crate::domain::ports::{BlockDevicesRef, DeviceProbe};
use crate::error::{Error, Result};
use async_trait::async_trait;
use tracing::{debug, info};

// =============================================================================
// Scanner Configuration
// =============================================================================

/// Configuration for the device scanner
#[derive(Debug, Clone, Default)]
pub struct ScannerConfig {
    pub filter: FilterConfig,
}

// =============================================================================
// Device Scanner
// =============================================================================

/// Scans for local disks the driver may claim
pub struct DeviceScanner {
    devices: BlockDevicesRef,
    filter: DeviceFilter,
}

impl DeviceScanner {
    /// Create a new device scanner
    pub fn new(devices: BlockDevicesRef, config: ScannerConfig) -> Self {
        Self {
            devices,
            filter: DeviceFilter::new(config.filter),
        }
    }
}

#[async_trait]
impl DeviceProbe for DeviceScanner {
    async fn scan_devices(&self) -> Result<Vec<String>> {
        let devices = self.devices.get_devices().await?;
        if devices.is_empty() {
            return Err(Error::NoDevicesFound);
        }

        let mut paths = Vec::new();
        for device in &devices {
            if !self.filter.matches(device) {
                debug!("Device filtered out: {}", device.device_path());
                continue;
            }
            debug!("Device found: {}", device.device_path());
            paths.push(device.device_path());
        }
        paths.sort();

        if paths.is_empty() {
            return Err(Error::NoDevicesMatchingFilter);
        }
        info!("Found {} candidate devices", paths.len());
        Ok(paths)
    }

    async fn scan_available_devices(&self) -> Result<Vec<BlockDevice>> {
        let devices = self.devices.get_devices().await?;

        let mut unformatted = Vec::new();
        for device in devices {
            if !self.filter.matches(&device) {
                debug!("Device filtered out: {}", device.device_path());
                continue;
            }
            if self.devices.is_unformatted(&device.device_path()).await? {
                debug!("Unformatted device found: {}", device.device_path());
                unformatted.push(device);
            } else {
                debug!("Device is formatted, skipping: {}", device.device_path());
            }
        }

        if unformatted.is_empty() {
            return Err(Error::NoDevicesFound);
        }
        unformatted.sort_by_key(|d| d.device_path());
        Ok(unformatted)
    }
}
