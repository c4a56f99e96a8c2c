//! Node service
//!
//! Stages logical volumes on the node, publishes them into pods and keeps
//! the pods' cgroup IO limits in line with the volume's throttle settings.

use super::cgroup::{device_numbers, find_pod_cgroup, pod_uid_from_path, write_io_max, ThrottleConfig};
use super::mounts::read_mounts;
use super::throttle::{ThrottleRequest, ThrottleSpec};
use crate::csi::types::*;
use crate::csi::{CsiNode, CsiResult};
use crate::domain::ports::{MounterRef, ThrottlingUpdater};
use crate::error::{Error, Result};
use crate::metrics::Metrics;
use crate::volume::{LvmVolumeCore, FS_TYPE_PARAM};
use async_trait::async_trait;
use nix::sys::statvfs::statvfs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};

const DEFAULT_FS_TYPE: &str = "ext4";

/// Kubelet directory segment preceding the volume name in pod mount paths
const CSI_VOLUMES_SEGMENT: &str = "kubernetes.io~csi";

/// Whether `mount_path` is a pod mount of the volume named `volume_name`.
///
/// Pod mounts look like
/// `/var/lib/kubelet/pods/<uid>/volumes/kubernetes.io~csi/<name>/mount`.
pub fn is_mount_for_volume(mount_path: &str, volume_name: &str) -> bool {
    if !mount_path.contains("/volumes/kubernetes.io~csi/") {
        return false;
    }
    let parts: Vec<&str> = mount_path.split('/').collect();
    parts
        .windows(2)
        .any(|w| w[0] == CSI_VOLUMES_SEGMENT && w[1] == volume_name)
}

pub struct NodeService {
    core: Arc<LvmVolumeCore>,
    mounter: MounterRef,
    throttle: ThrottleConfig,
    metrics: Arc<Metrics>,
}

impl NodeService {
    pub fn new(
        core: Arc<LvmVolumeCore>,
        mounter: MounterRef,
        throttle: ThrottleConfig,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            core,
            mounter,
            throttle,
            metrics,
        }
    }

    /// Device path of an existing volume on this node
    async fn device_of(&self, volume_id: &str) -> CsiResult<PathBuf> {
        match self.core.get_logical_volume(volume_id).await {
            Ok(lv) if !lv.path.is_empty() => Ok(PathBuf::from(lv.path)),
            Ok(lv) => Ok(PathBuf::from(format!("/dev/{}/{}", lv.vg_name, lv.name))),
            Err(e @ Error::VolumeNotFound(_)) => Err(Status::not_found(e.to_string())),
            Err(e) => Err(e.into()),
        }
    }

    /// Where a staged volume is reachable: the staging directory for
    /// filesystems, a file inside it for raw block volumes
    fn staged_path(&self, staging: &Path, capability: &VolumeCapability, volume_id: &str) -> CsiResult<PathBuf> {
        if !capability.is_block() {
            return Ok(staging.to_path_buf());
        }
        let name = self
            .core
            .get_volume_name(volume_id)
            .map_err(|e| Status::invalid_argument(e.to_string()))?;
        Ok(staging.join(name))
    }

    /// Write the `io.max` line for `request` into the cgroup of the pod
    /// owning `mount_path`
    async fn apply_to_mount(&self, mount_path: &str, device: &str, request: &ThrottleRequest) -> Result<()> {
        let uid = pod_uid_from_path(mount_path)?;
        let cgroup = find_pod_cgroup(&self.throttle.cgroup_root, &uid).await?;
        let maj_min = device_numbers(device, &self.throttle.partitions_path).await?;
        let line = request.io_max_line(&maj_min);
        let result = write_io_max(&self.throttle.cgroup_root, &cgroup, &line).await;
        self.metrics.record_throttle_write(result.is_ok());
        result?;
        info!("Applied IO limits {:?} for mount {}", line, mount_path);
        Ok(())
    }
}

async fn create_file(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    tokio::fs::OpenOptions::new()
        .create(true)
        .truncate(false)
        .write(true)
        .open(path)
        .await?;
    Ok(())
}

async fn remove_path(path: &Path) -> Result<()> {
    let result = match tokio::fs::metadata(path).await {
        Ok(meta) if meta.is_dir() => tokio::fs::remove_dir(path).await,
        Ok(_) => tokio::fs::remove_file(path).await,
        Err(e) => Err(e),
    };
    match result {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}

fn internal(e: Error) -> Status {
    Status::internal(e.to_string())
}

fn filesystem_usage(path: &Path) -> Result<Vec<VolumeUsage>> {
    let st = statvfs(path).map_err(|e| Error::Mount {
        path: path.display().to_string(),
        reason: format!("statvfs failed: {}", e),
    })?;
    let frsize = st.fragment_size() as i64;
    let blocks = st.blocks() as i64;
    let files = st.files() as i64;
    Ok(vec![
        VolumeUsage {
            available: st.blocks_available() as i64 * frsize,
            total: blocks * frsize,
            used: (blocks - st.blocks_free() as i64) * frsize,
            unit: UsageUnit::Bytes,
        },
        VolumeUsage {
            available: st.files_free() as i64,
            total: files,
            used: files - st.files_free() as i64,
            unit: UsageUnit::Inodes,
        },
    ])
}

#[async_trait]
impl CsiNode for NodeService {
    #[instrument(skip(self, req), fields(volume_id = %req.volume_id))]
    async fn node_stage_volume(&self, req: NodeStageVolumeRequest) -> CsiResult<()> {
        if req.volume_id.is_empty() {
            return Err(Status::invalid_argument("Volume ID missing in request"));
        }
        if req.staging_target_path.is_empty() {
            return Err(Status::invalid_argument("Staging target path missing in request"));
        }
        let capability = req
            .volume_capability
            .as_ref()
            .ok_or_else(|| Status::invalid_argument("Volume capability missing in request"))?;

        let device = self.device_of(&req.volume_id).await?;
        let staging = Path::new(&req.staging_target_path);
        let staged = self.staged_path(staging, capability, &req.volume_id)?;

        if self.mounter.is_mount_point(&staged).await.map_err(internal)? {
            debug!("{} already staged at {}", req.volume_id, staged.display());
            return Ok(());
        }

        match &capability.access_type {
            AccessType::Block => {
                create_file(&staged).await.map_err(internal)?;
                self.mounter
                    .bind_mount(&device, &staged, false)
                    .await
                    .map_err(internal)?;
            }
            AccessType::Mount {
                fs_type,
                mount_flags,
            } => {
                let fs_type = if !fs_type.is_empty() {
                    fs_type.as_str()
                } else {
                    req.volume_context
                        .get(FS_TYPE_PARAM)
                        .map(String::as_str)
                        .filter(|f| !f.is_empty())
                        .unwrap_or(DEFAULT_FS_TYPE)
                };
                tokio::fs::create_dir_all(&staged)
                    .await
                    .map_err(|e| internal(e.into()))?;
                self.mounter
                    .format_and_mount(&device, &staged, fs_type, mount_flags)
                    .await
                    .map_err(internal)?;
            }
        }
        info!("Staged {} at {}", req.volume_id, staged.display());
        Ok(())
    }

    async fn node_unstage_volume(&self, req: NodeUnstageVolumeRequest) -> CsiResult<()> {
        if req.volume_id.is_empty() {
            return Err(Status::invalid_argument("Volume ID missing in request"));
        }
        if req.staging_target_path.is_empty() {
            return Err(Status::invalid_argument("Staging target path missing in request"));
        }
        debug!("Keeping {} staged at {}", req.volume_id, req.staging_target_path);
        Ok(())
    }

    #[instrument(skip(self, req), fields(volume_id = %req.volume_id))]
    async fn node_publish_volume(&self, req: NodePublishVolumeRequest) -> CsiResult<()> {
        if req.volume_id.is_empty() {
            return Err(Status::invalid_argument("Volume ID missing in request"));
        }
        if req.staging_target_path.is_empty() {
            return Err(Status::invalid_argument("Staging target path missing in request"));
        }
        if req.target_path.is_empty() {
            return Err(Status::invalid_argument("Target path missing in request"));
        }
        let capability = req
            .volume_capability
            .as_ref()
            .ok_or_else(|| Status::invalid_argument("Volume capability missing in request"))?;

        let device = self.device_of(&req.volume_id).await?;
        let source = self.staged_path(Path::new(&req.staging_target_path), capability, &req.volume_id)?;
        let target = Path::new(&req.target_path);

        if self.mounter.is_mount_point(target).await.map_err(internal)? {
            debug!("{} already published at {}", req.volume_id, req.target_path);
            return Ok(());
        }
        if capability.is_block() {
            create_file(target).await.map_err(internal)?;
        } else {
            tokio::fs::create_dir_all(target)
                .await
                .map_err(|e| internal(e.into()))?;
        }
        self.mounter
            .bind_mount(&source, target, req.readonly)
            .await
            .map_err(internal)?;
        info!("Published {} at {}", req.volume_id, req.target_path);

        if let Some(spec) = ThrottleSpec::from_volume_context(&req.volume_context) {
            let device = device.to_string_lossy();
            if let Err(e) = self
                .apply_to_mount(&req.target_path, &device, &ThrottleRequest::Set(spec))
                .await
            {
                warn!("Failed to apply IO limits {} to {}: {}", spec, req.target_path, e);
            }
        }
        Ok(())
    }

    async fn node_unpublish_volume(&self, req: NodeUnpublishVolumeRequest) -> CsiResult<()> {
        if req.volume_id.is_empty() {
            return Err(Status::invalid_argument("Volume ID missing in request"));
        }
        if req.target_path.is_empty() {
            return Err(Status::invalid_argument("Target path missing in request"));
        }
        let target = Path::new(&req.target_path);
        self.mounter.unmount(target).await.map_err(internal)?;
        remove_path(target).await.map_err(internal)?;
        info!("Unpublished {} from {}", req.volume_id, req.target_path);
        Ok(())
    }

    async fn node_get_volume_stats(
        &self,
        req: NodeGetVolumeStatsRequest,
    ) -> CsiResult<NodeGetVolumeStatsResponse> {
        if req.volume_id.is_empty() {
            return Err(Status::invalid_argument("Volume ID missing in request"));
        }
        if req.volume_path.is_empty() {
            return Err(Status::invalid_argument("Volume path missing in request"));
        }
        let path = Path::new(&req.volume_path);
        let meta = tokio::fs::metadata(path).await.map_err(|e| {
            Status::not_found(format!("volume path {} not found: {}", req.volume_path, e))
        })?;

        if !meta.is_dir() {
            let lv = match self.core.get_logical_volume(&req.volume_id).await {
                Ok(lv) => lv,
                Err(e @ Error::VolumeNotFound(_)) => return Err(Status::not_found(e.to_string())),
                Err(e) => return Err(e.into()),
            };
            return Ok(NodeGetVolumeStatsResponse {
                usage: vec![VolumeUsage {
                    available: 0,
                    total: lv.size as i64,
                    used: 0,
                    unit: UsageUnit::Bytes,
                }],
            });
        }

        let usage = filesystem_usage(path).map_err(internal)?;
        Ok(NodeGetVolumeStatsResponse { usage })
    }

    #[instrument(skip(self, req), fields(volume_id = %req.volume_id))]
    async fn node_expand_volume(
        &self,
        req: NodeExpandVolumeRequest,
    ) -> CsiResult<NodeExpandVolumeResponse> {
        if req.volume_id.is_empty() {
            return Err(Status::invalid_argument("Volume ID missing in request"));
        }
        if req.volume_path.is_empty() {
            return Err(Status::invalid_argument("Volume path missing in request"));
        }
        let required = req
            .capacity_range
            .map(|c| c.required_bytes)
            .filter(|r| *r > 0)
            .ok_or_else(|| Status::invalid_argument("Required capacity missing in request"))?;

        let size = match self.core.expand(&req.volume_id, required as u64).await {
            Ok(size) => size,
            Err(e @ Error::VolumeNotFound(_)) => return Err(Status::not_found(e.to_string())),
            Err(e) => return Err(e.into()),
        };

        let is_block = req.volume_capability.as_ref().is_some_and(|c| c.is_block());
        let volume_path = Path::new(&req.volume_path);
        if !is_block && self.mounter.is_mount_point(volume_path).await.map_err(internal)? {
            let device = self.device_of(&req.volume_id).await?;
            self.mounter
                .resize_filesystem(&device, volume_path)
                .await
                .map_err(internal)?;
        }
        Ok(NodeExpandVolumeResponse {
            capacity_bytes: size as i64,
        })
    }

    fn node_get_capabilities(&self) -> Vec<NodeCapability> {
        vec![
            NodeCapability::StageUnstageVolume,
            NodeCapability::ExpandVolume,
            NodeCapability::GetVolumeStats,
        ]
    }

    fn node_get_info(&self) -> NodeGetInfoResponse {
        NodeGetInfoResponse {
            node_id: self.core.node_id().to_string(),
            max_volumes_per_node: 0,
            accessible_topology: Some(self.core.topology()),
        }
    }
}

#[async_trait]
impl ThrottlingUpdater for NodeService {
    async fn update_running_pods_throttling(
        &self,
        volume_id: &str,
        request: &ThrottleRequest,
    ) -> Result<()> {
        let name = self.core.get_volume_name(volume_id)?;
        let mounts: Vec<_> = read_mounts(&self.throttle.mounts_path)
            .await?
            .into_iter()
            .filter(|m| is_mount_for_volume(&m.mount_point, &name))
            .collect();
        if mounts.is_empty() {
            debug!("No active mounts of {}", volume_id);
            return Ok(());
        }

        let mut failures = Vec::new();
        for mount in &mounts {
            let uid = match pod_uid_from_path(&mount.mount_point) {
                Ok(uid) => uid,
                Err(e) => {
                    debug!("Skipping mount {}: {}", mount.mount_point, e);
                    continue;
                }
            };
            if let Err(e) = find_pod_cgroup(&self.throttle.cgroup_root, &uid).await {
                debug!("Skipping mount {}: {}", mount.mount_point, e);
                continue;
            }
            if let Err(e) = self.apply_to_mount(&mount.mount_point, &mount.device, request).await {
                failures.push(format!("mount {}: {}", mount.mount_point, e));
            }
        }

        if failures.is_empty() {
            Ok(())
        } else {
            Err(Error::Throttle(failures))
        }
    }
}
