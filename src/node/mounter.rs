//! Filesystem mount helper
//!
//! Shells out to util-linux `mount`/`umount`, `mkfs` and the filesystem
//! resize tools. Mount state is read from the kernel mount table.

use super::mounts::{read_mounts, MountEntry};
use crate::domain::ports::Mounter;
use crate::error::{Error, Result};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use tokio::process::Command;
use tracing::{debug, info, warn};

/// `blkid` exit status when the device carries no signature
const BLKID_NO_SIGNATURE: i32 = 2;

/// [`Mounter`] backed by the host's mount utilities
#[derive(Debug, Clone)]
pub struct SystemMounter {
    mounts_path: PathBuf,
}

impl Default for SystemMounter {
    fn default() -> Self {
        Self::new(PathBuf::from(super::mounts::PROC_MOUNTS))
    }
}

impl SystemMounter {
    pub fn new(mounts_path: PathBuf) -> Self {
        Self { mounts_path }
    }

    async fn run(&self, command: &str, args: &[&str], target: &Path) -> Result<String> {
        debug!("Running {} {}", command, args.join(" "));
        let output = Command::new(command)
            .args(args)
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| Error::Mount {
                path: target.display().to_string(),
                reason: format!("failed to run {}: {}", command, e),
            })?;
        if !output.status.success() {
            return Err(Error::Mount {
                path: target.display().to_string(),
                reason: format!(
                    "{} failed: {}",
                    command,
                    String::from_utf8_lossy(&output.stderr).trim()
                ),
            });
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }

    /// Filesystem type on `device`, `None` when unformatted
    async fn filesystem_type(&self, device: &Path) -> Result<Option<String>> {
        let device_str = device.to_string_lossy();
        let output = Command::new("blkid")
            .args(["-p", "-s", "TYPE", "-o", "value", &*device_str])
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| Error::Mount {
                path: device_str.to_string(),
                reason: format!("failed to run blkid: {}", e),
            })?;
        match output.status.code() {
            Some(0) => {
                let fs = String::from_utf8_lossy(&output.stdout).trim().to_string();
                Ok((!fs.is_empty()).then_some(fs))
            }
            Some(BLKID_NO_SIGNATURE) => Ok(None),
            _ => Err(Error::Mount {
                path: device_str.to_string(),
                reason: format!(
                    "blkid failed: {}",
                    String::from_utf8_lossy(&output.stderr).trim()
                ),
            }),
        }
    }

    async fn mounts_of_device(&self, device_path: &str) -> Result<Vec<MountEntry>> {
        let target = canonical(device_path).await;
        let mut matching = Vec::new();
        for entry in read_mounts(&self.mounts_path).await? {
            if entry.device == device_path || canonical(&entry.device).await == target {
                matching.push(entry);
            }
        }
        Ok(matching)
    }
}

/// Resolve symlinks, keeping the input when resolution fails
async fn canonical(path: &str) -> PathBuf {
    tokio::fs::canonicalize(path)
        .await
        .unwrap_or_else(|_| PathBuf::from(path))
}

#[async_trait]
impl Mounter for SystemMounter {
    async fn is_mount_point(&self, path: &Path) -> Result<bool> {
        let wanted = path.to_string_lossy();
        Ok(read_mounts(&self.mounts_path)
            .await?
            .iter()
            .any(|m| m.mount_point == *wanted))
    }

    async fn bind_mount(&self, source: &Path, target: &Path, read_only: bool) -> Result<()> {
        let source_str = source.to_string_lossy();
        let target_str = target.to_string_lossy();
        self.run("mount", &["--bind", &*source_str, &*target_str], target)
            .await?;
        if read_only {
            self.run("mount", &["-o", "remount,bind,ro", &*target_str], target)
                .await?;
        }
        info!("Bind mounted {} at {}", source_str, target_str);
        Ok(())
    }

    async fn format_and_mount(
        &self,
        device: &Path,
        target: &Path,
        fs_type: &str,
        options: &[String],
    ) -> Result<()> {
        let device_str = device.to_string_lossy();
        let target_str = target.to_string_lossy();

        match self.filesystem_type(device).await? {
            Some(existing) => debug!("{} already formatted as {}", device_str, existing),
            None => {
                info!("Formatting {} as {}", device_str, fs_type);
                self.run("mkfs", &["-t", fs_type, &*device_str], device).await?;
            }
        }

        let joined = options.join(",");
        let mut args: Vec<&str> = vec!["-t", fs_type];
        if !joined.is_empty() {
            args.push("-o");
            args.push(&joined);
        }
        args.push(&device_str);
        args.push(&target_str);
        self.run("mount", &args, target).await?;
        info!("Mounted {} at {}", device_str, target_str);
        Ok(())
    }

    async fn unmount(&self, target: &Path) -> Result<()> {
        if !self.is_mount_point(target).await? {
            debug!("{} is not mounted", target.display());
            return Ok(());
        }
        let target_str = target.to_string_lossy();
        self.run("umount", &[&*target_str], target).await?;
        info!("Unmounted {}", target_str);
        Ok(())
    }

    async fn cleanup_staging_dir(&self, device_path: &str) -> Result<()> {
        for entry in self.mounts_of_device(device_path).await? {
            let mount_point = PathBuf::from(&entry.mount_point);
            if let Err(e) = self
                .run("umount", &[entry.mount_point.as_str()], &mount_point)
                .await
            {
                warn!("Failed to unmount {}: {}", entry.mount_point, e);
                return Err(e);
            }
            info!("Unmounted {} from {}", device_path, entry.mount_point);
        }
        Ok(())
    }

    async fn resize_filesystem(&self, device: &Path, mount_path: &Path) -> Result<()> {
        let device_str = device.to_string_lossy();
        match self.filesystem_type(device).await?.as_deref() {
            Some("xfs") => {
                let mount_str = mount_path.to_string_lossy();
                self.run("xfs_growfs", &[&*mount_str], mount_path).await?;
            }
            Some(fs) if fs.starts_with("ext") => {
                self.run("resize2fs", &[&*device_str], device).await?;
            }
            Some(other) => {
                return Err(Error::Mount {
                    path: device_str.to_string(),
                    reason: format!("resize of {} filesystems is not supported", other),
                })
            }
            None => debug!("{} carries no filesystem, nothing to resize", device_str),
        }
        Ok(())
    }
}
