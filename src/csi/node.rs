//! Node service trait

use super::types::*;
use super::CsiResult;
use async_trait::async_trait;

/// Node half of the storage protocol, served on every worker.
///
/// Every call is idempotent: repeating a completed stage, publish or
/// unpublish succeeds without side effects.
#[async_trait]
pub trait CsiNode: Send + Sync {
    /// Make the logical volume available at the staging path
    async fn node_stage_volume(&self, req: NodeStageVolumeRequest) -> CsiResult<()>;

    /// Leaves the staging mount in place so the page cache survives pod
    /// restarts; the controller unmounts when the volume is deleted
    async fn node_unstage_volume(&self, req: NodeUnstageVolumeRequest) -> CsiResult<()>;

    /// Bind the staged volume into the pod's target path and apply its limits
    async fn node_publish_volume(&self, req: NodePublishVolumeRequest) -> CsiResult<()>;

    async fn node_unpublish_volume(&self, req: NodeUnpublishVolumeRequest) -> CsiResult<()>;

    async fn node_get_volume_stats(
        &self,
        req: NodeGetVolumeStatsRequest,
    ) -> CsiResult<NodeGetVolumeStatsResponse>;

    async fn node_expand_volume(
        &self,
        req: NodeExpandVolumeRequest,
    ) -> CsiResult<NodeExpandVolumeResponse>;

    fn node_get_capabilities(&self) -> Vec<NodeCapability>;

    fn node_get_info(&self) -> NodeGetInfoResponse;
}
