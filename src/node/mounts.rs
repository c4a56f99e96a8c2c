//! Kernel mount table

use crate::error::{Error, Result};
use std::path::Path;

pub const PROC_MOUNTS: &str = "/proc/mounts";

/// One line of `/proc/mounts`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountEntry {
    pub device: String,
    pub mount_point: String,
    pub fs_type: String,
    pub options: Vec<String>,
}

impl MountEntry {
    pub fn is_read_only(&self) -> bool {
        self.options.iter().any(|o| o == "ro")
    }
}

/// `/proc/mounts` escapes whitespace in paths as octal sequences
fn unescape(field: &str) -> String {
    field
        .replace("\\040", " ")
        .replace("\\011", "\t")
        .replace("\\012", "\n")
        .replace("\\134", "\\")
}

/// Parse mount table content; malformed lines are skipped
pub fn parse_mounts(content: &str) -> Vec<MountEntry> {
    content
        .lines()
        .filter_map(|line| {
            let mut fields = line.split_whitespace();
            let device = fields.next()?;
            let mount_point = fields.next()?;
            let fs_type = fields.next().unwrap_or_default();
            let options = fields.next().unwrap_or_default();
            Some(MountEntry {
                device: unescape(device),
                mount_point: unescape(mount_point),
                fs_type: fs_type.to_string(),
                options: options
                    .split(',')
                    .filter(|o| !o.is_empty())
                    .map(String::from)
                    .collect(),
            })
        })
        .collect()
}

/// Read and parse the mount table at `path`
pub async fn read_mounts(path: &Path) -> Result<Vec<MountEntry>> {
    let content = tokio::fs::read_to_string(path).await.map_err(|e| {
        Error::Mount {
            path: path.display().to_string(),
            reason: format!("failed to read mount table: {}", e),
        }
    })?;
    Ok(parse_mounts(&content))
}
