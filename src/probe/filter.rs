//! Candidate device filter
//!
//! Decides which disks the driver may claim. Boot disks, partitioned or
//! formatted media and anything matching an exclusion glob are rejected.

use super::block::BlockDevice;
use glob::Pattern;
use tracing::warn;

/// Mount points that mark a disk as a system disk
const BOOT_MOUNT_POINTS: &[&str] = &["/", "/boot", "/boot/efi", "[SWAP]"];

/// Filesystem type of a device already initialised as an LVM physical volume
pub const LVM_MEMBER_FSTYPE: &str = "LVM2_member";

// =============================================================================
// Filter Configuration
// =============================================================================

/// Configuration for the device filter
#[derive(Debug, Clone)]
pub struct FilterConfig {
    /// `lsblk` device types eligible for claiming
    pub device_types: Vec<String>,
    /// Glob patterns matched against device paths and names
    pub exclude_patterns: Vec<String>,
    /// Glob patterns matched against the device model; empty accepts any model
    pub include_models: Vec<String>,
    /// Minimum device size to include (bytes)
    pub min_size_bytes: u64,
    /// Include device mapper devices
    pub include_dm: bool,
}

impl Default for FilterConfig {
    fn default() -> Self {
        Self {
            device_types: vec!["disk".to_string()],
            exclude_patterns: Vec::new(),
            include_models: Vec::new(),
            min_size_bytes: 0,
            include_dm: false,
        }
    }
}

// =============================================================================
// Device Filter
// =============================================================================

/// Compiled form of [`FilterConfig`]
#[derive(Debug, Clone)]
pub struct DeviceFilter {
    config: FilterConfig,
    exclude: Vec<Pattern>,
    models: Vec<Pattern>,
}

impl DeviceFilter {
    /// Compile the filter; invalid globs are dropped with a warning
    pub fn new(config: FilterConfig) -> Self {
        let compile = |patterns: &[String]| {
            patterns
                .iter()
                .filter_map(|p| match Pattern::new(p) {
                    Ok(pattern) => Some(pattern),
                    Err(e) => {
                        warn!("Ignoring invalid device pattern {}: {}", p, e);
                        None
                    }
                })
                .collect::<Vec<_>>()
        };
        let exclude = compile(&config.exclude_patterns);
        let models = compile(&config.include_models);
        Self {
            config,
            exclude,
            models,
        }
    }

    /// Check whether a device may be claimed
    pub fn matches(&self, device: &BlockDevice) -> bool {
        if !self.should_include_name(&device.name) {
            return false;
        }

        if !self.config.device_types.iter().any(|t| *t == device.device_type) {
            return false;
        }

        if device.ro || device.size < self.config.min_size_bytes {
            return false;
        }

        if self.is_boot_device(device) {
            return false;
        }

        // Physical volumes are still candidates: their children are our own LVs
        let is_pv = device.fstype.as_deref() == Some(LVM_MEMBER_FSTYPE);
        if let Some(fstype) = device.fstype.as_deref() {
            if !fstype.is_empty() && !is_pv {
                return false;
            }
        }
        if !is_pv && !device.children.is_empty() {
            return false;
        }
        if device.mount_points().next().is_some() {
            return false;
        }

        let path = device.device_path();
        if self
            .exclude
            .iter()
            .any(|p| p.matches(&path) || p.matches(&device.name))
        {
            return false;
        }

        if !self.models.is_empty() {
            let model = device.model.as_deref().unwrap_or_default().trim();
            if !self.models.iter().any(|p| p.matches(model)) {
                return false;
            }
        }

        true
    }

    fn should_include_name(&self, name: &str) -> bool {
        // Skip loopback, RAM disks, md RAID and zram
        if ["loop", "ram", "md", "zram"]
            .iter()
            .any(|prefix| name.starts_with(prefix))
        {
            return false;
        }

        // Skip device mapper
        if !self.config.include_dm && name.starts_with("dm-") {
            return false;
        }

        true
    }

    fn is_boot_device(&self, device: &BlockDevice) -> bool {
        device
            .mount_points()
            .any(|m| BOOT_MOUNT_POINTS.contains(&m))
            || device.children.iter().any(|c| self.is_boot_device(c))
    }
}

impl Default for DeviceFilter {
    fn default() -> Self {
        Self::new(FilterConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn disk(name: &str) -> BlockDevice {
        BlockDevice {
            name: name.to_string(),
            path: format!("/dev/{}", name),
            size: 20 << 30,
            device_type: "disk".to_string(),
            mountpoints: vec![None],
            ..Default::default()
        }
    }

    #[test]
    fn test_blank_disk_matches() {
        assert!(DeviceFilter::default().matches(&disk("nvme0n1")));
    }

    #[test]
    fn test_boot_disk_rejected() {
        let mut dev = disk("sda");
        let mut part = disk("sda1");
        part.device_type = "part".into();
        part.mountpoints = vec![Some("/boot/efi".into())];
        dev.children.push(part);
        assert!(!DeviceFilter::default().matches(&dev));
    }

    #[test]
    fn test_partitioned_and_formatted_rejected() {
        let filter = DeviceFilter::default();

        let mut partitioned = disk("sdb");
        let mut part = disk("sdb1");
        part.device_type = "part".into();
        partitioned.children.push(part);
        assert!(!filter.matches(&partitioned));

        let mut formatted = disk("sdc");
        formatted.fstype = Some("xfs".into());
        assert!(!filter.matches(&formatted));
    }

    #[test]
    fn test_existing_physical_volume_still_matches() {
        let mut pv = disk("nvme1n1");
        pv.fstype = Some(LVM_MEMBER_FSTYPE.into());
        let mut lv = disk("containerstorage-pvc--1");
        lv.device_type = "lvm".into();
        pv.children.push(lv);
        assert!(DeviceFilter::default().matches(&pv));
    }

    #[test]
    fn test_exclusion_patterns_and_models() {
        let filter = DeviceFilter::new(FilterConfig {
            exclude_patterns: vec!["/dev/sd*".into()],
            include_models: vec!["Microsoft NVMe Direct Disk*".into()],
            ..Default::default()
        });

        assert!(!filter.matches(&disk("sdd")));

        let mut nvme = disk("nvme0n1");
        assert!(!filter.matches(&nvme));
        nvme.model = Some("Microsoft NVMe Direct Disk v2 ".into());
        assert!(filter.matches(&nvme));
    }

    #[test]
    fn test_virtual_devices_rejected() {
        let filter = DeviceFilter::default();
        assert!(!filter.matches(&disk("loop0")));
        assert!(!filter.matches(&disk("zram0")));
        assert!(!filter.matches(&disk("dm-3")));
    }
}
