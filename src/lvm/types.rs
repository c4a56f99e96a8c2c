//! LVM object model

use crate::error::Error;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

// =============================================================================
// Sizes
// =============================================================================

pub const MIB: u64 = 1 << 20;

/// Allocation unit of every volume group the driver creates
pub const EXTENT_SIZE: u64 = 4 * MIB;

/// Round up to the next extent boundary
pub fn round_up_to_extent(bytes: u64) -> u64 {
    bytes.div_ceil(EXTENT_SIZE) * EXTENT_SIZE
}

/// Round down to the previous extent boundary
pub fn round_down_to_extent(bytes: u64) -> u64 {
    bytes / EXTENT_SIZE * EXTENT_SIZE
}

// =============================================================================
// Objects
// =============================================================================

/// A block device claimed for LVM use
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PhysicalVolume {
    /// Device path
    pub name: String,
    /// Owning volume group, empty when unclaimed
    pub vg_name: String,
    pub size: u64,
    pub free: u64,
}

/// A pool of physical volumes
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VolumeGroup {
    pub name: String,
    pub uuid: String,
    pub size: u64,
    pub free: u64,
    pub extent_size: u64,
    pub pv_count: u32,
    pub lv_count: u32,
    pub tags: Vec<String>,
}

/// A slice of a volume group
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogicalVolume {
    pub name: String,
    pub vg_name: String,
    pub path: String,
    pub size: u64,
    pub attr: String,
}

impl LogicalVolume {
    /// LVM marks open volumes with `o` in the sixth attribute column
    pub fn is_open(&self) -> bool {
        self.attr.chars().nth(5) == Some('o')
    }
}

// =============================================================================
// Options
// =============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreatePvOptions {
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreateVgOptions {
    pub name: String,
    pub pv_names: Vec<String>,
    pub tags: Vec<String>,
}

/// Placement of a logical volume's extents
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LvLayout {
    Linear,
    /// raid0 across `stripes` physical volumes
    Striped { stripes: u32 },
}

impl LvLayout {
    /// Linear on a single physical volume, striped across all of them otherwise
    pub fn for_pv_count(pv_count: u32) -> Self {
        if pv_count > 1 {
            LvLayout::Striped { stripes: pv_count }
        } else {
            LvLayout::Linear
        }
    }
}

impl fmt::Display for LvLayout {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LvLayout::Linear => write!(f, "linear"),
            LvLayout::Striped { stripes } => write!(f, "raid0 ({} stripes)", stripes),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreateLvOptions {
    pub vg_name: String,
    pub name: String,
    /// Requested size; rounded up to the extent by the engine
    pub size_bytes: u64,
    pub layout: LvLayout,
}

// =============================================================================
// Selectors
// =============================================================================

/// Report filter accepted by the list operations, written `<key>=<value>`
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Selector {
    /// `vg_tags=<tag>`
    VgTag(String),
    /// `vg_name=<name>`
    VgName(String),
}

impl Selector {
    /// Render in the LVM reporting `--select` dialect
    pub fn to_lvm_select(&self) -> String {
        match self {
            // Braces request subset matching on the tag list
            Selector::VgTag(tag) => format!("vg_tags={{{}}}", tag),
            Selector::VgName(name) => format!("vg_name={}", name),
        }
    }

    /// Evaluate against a volume group name and its tags
    pub fn matches(&self, vg_name: &str, vg_tags: &[String]) -> bool {
        match self {
            Selector::VgTag(tag) => vg_tags.iter().any(|t| t == tag),
            Selector::VgName(name) => vg_name == name,
        }
    }
}

impl fmt::Display for Selector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Selector::VgTag(tag) => write!(f, "vg_tags={}", tag),
            Selector::VgName(name) => write!(f, "vg_name={}", name),
        }
    }
}

impl FromStr for Selector {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (key, value) = s
            .split_once('=')
            .ok_or_else(|| Error::InvalidArgument(format!("selector {} is not key=value", s)))?;
        if value.is_empty() {
            return Err(Error::InvalidArgument(format!("selector {} has no value", s)));
        }
        match key {
            "vg_tags" => Ok(Selector::VgTag(value.to_string())),
            "vg_name" => Ok(Selector::VgName(value.to_string())),
            _ => Err(Error::InvalidArgument(format!("unsupported selector key {}", key))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extent_rounding() {
        assert_eq!(round_up_to_extent(0), 0);
        assert_eq!(round_up_to_extent(1), EXTENT_SIZE);
        assert_eq!(round_up_to_extent(EXTENT_SIZE), EXTENT_SIZE);
        assert_eq!(round_up_to_extent((1 << 30) + 2 * MIB), 1_077_936_128);
        assert_eq!(round_down_to_extent(EXTENT_SIZE + 1), EXTENT_SIZE);
        assert_eq!(round_down_to_extent(EXTENT_SIZE - 1), 0);
    }

    #[test]
    fn test_rounding_bounds() {
        for r in [1u64, 4095, MIB, 3 * MIB + 7, 1 << 30, (1 << 30) + 1, 10 * EXTENT_SIZE - 1] {
            let s = round_up_to_extent(r);
            assert_eq!(s % EXTENT_SIZE, 0);
            assert!(s >= r);
            assert!(s < r + EXTENT_SIZE);
        }
    }

    #[test]
    fn test_layout_for_pv_count() {
        assert_eq!(LvLayout::for_pv_count(1), LvLayout::Linear);
        assert_eq!(LvLayout::for_pv_count(3), LvLayout::Striped { stripes: 3 });
    }

    #[test]
    fn test_selector_parse() {
        let sel: Selector = "vg_tags=local-csi".parse().unwrap();
        assert_eq!(sel, Selector::VgTag("local-csi".into()));
        assert_eq!(sel.to_string(), "vg_tags=local-csi");
        assert_eq!(sel.to_lvm_select(), "vg_tags={local-csi}");

        let sel: Selector = "vg_name=containerstorage".parse().unwrap();
        assert!(sel.matches("containerstorage", &[]));

        assert!("lv_name=x".parse::<Selector>().is_err());
        assert!("vg_name=".parse::<Selector>().is_err());
        assert!("garbage".parse::<Selector>().is_err());
    }

    #[test]
    fn test_open_attr() {
        let lv = LogicalVolume {
            name: "lv".into(),
            vg_name: "vg".into(),
            path: "/dev/vg/lv".into(),
            size: EXTENT_SIZE,
            attr: "-wi-ao----".into(),
        };
        assert!(lv.is_open());
    }
}
