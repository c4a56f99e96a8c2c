//! Pod cgroup discovery and `io.max` writes
//!
//! Every path is rooted in [`ThrottleConfig`] so the lookups can run against
//! a fixture tree.

use crate::error::{Error, Result};
use nix::sys::stat::{major, minor, stat, SFlag};
use std::path::{Path, PathBuf};
use tracing::debug;

const QOS_CLASSES: [&str; 3] = ["burstable", "besteffort", "guaranteed"];

/// Filesystem locations the throttling path reads and writes
#[derive(Debug, Clone)]
pub struct ThrottleConfig {
    /// cgroup v2 hierarchy root
    pub cgroup_root: PathBuf,
    /// Kernel partitions table
    pub partitions_path: PathBuf,
    /// Kernel mount table
    pub mounts_path: PathBuf,
}

impl Default for ThrottleConfig {
    fn default() -> Self {
        Self {
            cgroup_root: PathBuf::from("/sys/fs/cgroup"),
            partitions_path: PathBuf::from("/proc/partitions"),
            mounts_path: PathBuf::from(super::mounts::PROC_MOUNTS),
        }
    }
}

// =============================================================================
// Pod cgroups
// =============================================================================

/// Pod UID from a kubelet path such as `/var/lib/kubelet/pods/<uid>/volumes/...`
pub fn pod_uid_from_path(path: &str) -> Result<String> {
    let parts: Vec<&str> = path.split('/').collect();
    parts
        .windows(2)
        .find(|w| w[0] == "pods" && !w[1].is_empty() && w[1].contains('-'))
        .map(|w| w[1].to_string())
        .ok_or_else(|| Error::Cgroup(format!("pod UID not found in path {}", path)))
}

/// Cgroup directories a pod may live in, relative to the hierarchy root, in
/// lookup order: systemd driver first, then cgroupfs
pub fn cgroup_candidates(pod_uid: &str) -> Vec<String> {
    let systemd_uid = pod_uid.replace('-', "_");
    let systemd = QOS_CLASSES.iter().map(|qos| {
        format!(
            "kubepods.slice/kubepods-{qos}.slice/kubepods-{qos}-pod{uid}.slice",
            qos = qos,
            uid = systemd_uid
        )
    });
    let cgroupfs = QOS_CLASSES
        .iter()
        .map(|qos| format!("kubepods/{}/pod{}", qos, pod_uid));
    systemd.chain(cgroupfs).collect()
}

/// First candidate cgroup of `pod_uid` present under `root`
pub async fn find_pod_cgroup(root: &Path, pod_uid: &str) -> Result<String> {
    for candidate in cgroup_candidates(pod_uid) {
        if tokio::fs::metadata(root.join(&candidate)).await.is_ok() {
            return Ok(candidate);
        }
    }
    Err(Error::Cgroup(format!("cgroup not found for pod UID {}", pod_uid)))
}

/// Write `line` to the `io.max` file of `cgroup`
pub async fn write_io_max(root: &Path, cgroup: &str, line: &str) -> Result<()> {
    let path = root.join(cgroup).join("io.max");
    debug!("Writing {:?} to {}", line, path.display());
    tokio::fs::write(&path, line).await.map_err(|e| {
        Error::Cgroup(format!("failed to write {:?} to {}: {}", line, path.display(), e))
    })
}

// =============================================================================
// Device numbers
// =============================================================================

/// `major:minor` of the block device behind `device_path`
pub async fn device_numbers(device_path: &str, partitions_path: &Path) -> Result<String> {
    let real = tokio::fs::canonicalize(device_path).await.map_err(|e| {
        Error::Cgroup(format!("failed to resolve device path {}: {}", device_path, e))
    })?;
    let real_str = real.to_string_lossy();

    if real_str.contains("/dev/mapper/") || real_str.contains("/dev/dm-") {
        return device_numbers_from_stat(&real);
    }

    let name = real
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .ok_or_else(|| Error::Cgroup(format!("device path {} has no name", real_str)))?;
    let content = tokio::fs::read_to_string(partitions_path).await.map_err(|e| {
        Error::Cgroup(format!("failed to read {}: {}", partitions_path.display(), e))
    })?;
    lookup_partition(&content, &name)
        .ok_or_else(|| Error::Cgroup(format!("device {} not found in partitions table", name)))
}

/// Find `name` in `/proc/partitions` content (`major minor #blocks name`)
fn lookup_partition(content: &str, name: &str) -> Option<String> {
    content.lines().find_map(|line| {
        let fields: Vec<&str> = line.split_whitespace().collect();
        (fields.len() >= 4 && fields[3] == name).then(|| format!("{}:{}", fields[0], fields[1]))
    })
}

fn device_numbers_from_stat(path: &Path) -> Result<String> {
    let st = stat(path)
        .map_err(|e| Error::Cgroup(format!("failed to stat device {}: {}", path.display(), e)))?;
    if SFlag::from_bits_truncate(st.st_mode) & SFlag::S_IFMT != SFlag::S_IFBLK {
        return Err(Error::Cgroup(format!(
            "{} is not a block device",
            path.display()
        )));
    }
    Ok(format!("{}:{}", major(st.st_rdev), minor(st.st_rdev)))
}
