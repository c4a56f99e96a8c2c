//! Volume identifier
//!
//! The only key the storage plane ever sees, written `<group>#<name>`.

use crate::error::{Error, Result};
use std::fmt;
use std::str::FromStr;

const SEPARATOR: char = '#';

/// A parsed `<group>#<name>` volume identifier
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct VolumeId {
    pub volume_group: String,
    pub logical_volume: String,
}

impl VolumeId {
    pub fn new(volume_group: impl Into<String>, logical_volume: impl Into<String>) -> Self {
        Self {
            volume_group: volume_group.into(),
            logical_volume: logical_volume.into(),
        }
    }

    /// Device node LVM creates for the logical volume
    pub fn device_path(&self) -> String {
        format!("/dev/{}/{}", self.volume_group, self.logical_volume)
    }
}

impl FromStr for VolumeId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let segments: Vec<&str> = s.split(SEPARATOR).collect();
        match segments.as_slice() {
            [vg, lv] if !vg.is_empty() && !lv.is_empty() => Ok(VolumeId::new(*vg, *lv)),
            [_, _] => Err(Error::InvalidArgument(format!(
                "volume id {:?} has an empty segment",
                s
            ))),
            _ => Err(Error::InvalidArgument(format!(
                "volume id {:?}: expected 2 segments, got {}",
                s,
                segments.len()
            ))),
        }
    }
}

impl fmt::Display for VolumeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}{}", self.volume_group, SEPARATOR, self.logical_volume)
    }
}
