//! Block device enumeration
//!
//! Wraps `lsblk` and `blkid`. `lsblk` output differs between util-linux
//! releases (numbers vs strings for sizes and flags), so the model accepts both.

use crate::domain::ports::BlockDevices;
use crate::error::{Error, Result};
use async_trait::async_trait;
use serde::{Deserialize, Deserializer, Serialize};
use std::os::unix::fs::FileTypeExt;
use tokio::process::Command;
use tracing::debug;

// =============================================================================
// Constants
// =============================================================================

const LSBLK_COMMAND: &str = "lsblk";
const BLKID_COMMAND: &str = "blkid";

/// `blkid -p` exit status when no signature was found
const BLKID_NO_SIGNATURE: i32 = 2;

// =============================================================================
// Device Model
// =============================================================================

/// A block device as reported by `lsblk --json --output-all`
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BlockDevice {
    pub name: String,
    #[serde(default)]
    pub path: String,
    #[serde(default, deserialize_with = "number_or_string")]
    pub size: u64,
    #[serde(rename = "type", default)]
    pub device_type: String,
    #[serde(default)]
    pub fstype: Option<String>,
    #[serde(default)]
    pub mountpoint: Option<String>,
    #[serde(default)]
    pub mountpoints: Vec<Option<String>>,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub serial: Option<String>,
    #[serde(default, deserialize_with = "flag")]
    pub ro: bool,
    #[serde(default, deserialize_with = "flag")]
    pub rm: bool,
    #[serde(default)]
    pub children: Vec<BlockDevice>,
}

impl BlockDevice {
    /// Device path, falling back to `/dev/<name>` for old `lsblk` releases
    pub fn device_path(&self) -> String {
        if self.path.is_empty() {
            format!("/dev/{}", self.name)
        } else {
            self.path.clone()
        }
    }

    /// Every mount point of this device, old and new `lsblk` formats merged
    pub fn mount_points(&self) -> impl Iterator<Item = &str> {
        self.mountpoint
            .as_deref()
            .into_iter()
            .chain(self.mountpoints.iter().filter_map(|m| m.as_deref()))
    }
}

/// Top level `lsblk --json` document
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DeviceList {
    #[serde(rename = "blockdevices", default)]
    pub devices: Vec<BlockDevice>,
}

fn number_or_string<'de, D>(deserializer: D) -> std::result::Result<u64, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Number(u64),
        Text(String),
        Null,
    }

    match Raw::deserialize(deserializer)? {
        Raw::Number(n) => Ok(n),
        Raw::Text(s) => s.trim().parse().map_err(serde::de::Error::custom),
        Raw::Null => Ok(0),
    }
}

fn flag<'de, D>(deserializer: D) -> std::result::Result<bool, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Bool(bool),
        Number(u8),
        Text(String),
        Null,
    }

    Ok(match Raw::deserialize(deserializer)? {
        Raw::Bool(b) => b,
        Raw::Number(n) => n != 0,
        Raw::Text(s) => s == "1" || s.eq_ignore_ascii_case("true"),
        Raw::Null => false,
    })
}

/// Parse the JSON document printed by `lsblk --bytes --json --output-all`
pub fn parse_lsblk_output(output: &[u8]) -> Result<DeviceList> {
    serde_json::from_slice(output)
        .map_err(|e| Error::DeviceProbe(format!("failed to parse lsblk output: {}", e)))
}

// =============================================================================
// lsblk / blkid adapter
// =============================================================================

/// [`BlockDevices`] backed by the util-linux command line tools
#[derive(Debug, Clone, Default)]
pub struct LsblkBlockDevices;

impl LsblkBlockDevices {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl BlockDevices for LsblkBlockDevices {
    async fn get_devices(&self) -> Result<Vec<BlockDevice>> {
        let output = Command::new(LSBLK_COMMAND)
            .args(["--bytes", "--json", "--output-all"])
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| Error::DeviceProbe(format!("failed to run {}: {}", LSBLK_COMMAND, e)))?;

        if !output.status.success() {
            return Err(Error::DeviceProbe(format!(
                "{} failed: {}",
                LSBLK_COMMAND,
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }

        Ok(parse_lsblk_output(&output.stdout)?.devices)
    }

    async fn is_unformatted(&self, device: &str) -> Result<bool> {
        let metadata = tokio::fs::metadata(device).await.map_err(|e| {
            Error::DeviceProbe(format!("failed to stat path {}: {}", device, e))
        })?;
        if !metadata.file_type().is_block_device() {
            debug!("{} is not a block device", device);
            return Ok(false);
        }

        let output = Command::new(BLKID_COMMAND)
            .args(["-p", device])
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| Error::DeviceProbe(format!("failed to run {}: {}", BLKID_COMMAND, e)))?;

        match output.status.code() {
            Some(0) => Ok(false),
            Some(BLKID_NO_SIGNATURE) => Ok(true),
            _ => Err(Error::DeviceProbe(format!(
                "could not discover filesystem format for device path ({}): {}",
                device,
                String::from_utf8_lossy(&output.stderr).trim()
            ))),
        }
    }
}
