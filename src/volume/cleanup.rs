//! Shutdown-cleanup gate
//!
//! Volume groups and physical volumes are only torn down when the driver's
//! DaemonSet itself is going away. A rolling restart keeps everything.

use super::core::LvmVolumeCore;
use crate::domain::ports::ClusterApiRef;
use crate::error::{Error, Result};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

const DAEMON_SET_KIND: &str = "DaemonSet";

/// Whether the DaemonSet owning `pod_name` is deleted or being deleted
pub async fn is_cleanup_required(
    cluster: &ClusterApiRef,
    namespace: &str,
    pod_name: &str,
) -> Result<bool> {
    let pod = cluster
        .get_pod(namespace, pod_name)
        .await?
        .ok_or_else(|| Error::ResourceNotFound {
            kind: "Pod".into(),
            name: format!("{}/{}", namespace, pod_name),
        })?;

    let owner = pod
        .metadata
        .owner_references
        .as_deref()
        .unwrap_or_default()
        .iter()
        .find(|o| o.kind == DAEMON_SET_KIND)
        .ok_or_else(|| {
            Error::Internal(format!("pod {}/{} has no DaemonSet owner", namespace, pod_name))
        })?;

    match cluster.get_daemon_set(namespace, &owner.name).await? {
        None => Ok(true),
        Some(ds) => Ok(ds.metadata.deletion_timestamp.is_some()),
    }
}

/// Runs the volume cleanup once the process is asked to stop
pub struct CleanupGate {
    core: Arc<LvmVolumeCore>,
    cluster: ClusterApiRef,
    namespace: String,
    pod_name: String,
}

impl CleanupGate {
    pub fn new(
        core: Arc<LvmVolumeCore>,
        cluster: ClusterApiRef,
        namespace: impl Into<String>,
        pod_name: impl Into<String>,
    ) -> Self {
        Self {
            core,
            cluster,
            namespace: namespace.into(),
            pod_name: pod_name.into(),
        }
    }

    /// Wait for `cancel`, then tear down local storage if the DaemonSet is gone
    pub async fn run(self, cancel: CancellationToken) -> Result<()> {
        cancel.cancelled().await;
        self.cleanup_if_required().await
    }

    pub async fn cleanup_if_required(&self) -> Result<()> {
        let required = match is_cleanup_required(&self.cluster, &self.namespace, &self.pod_name).await {
            Ok(required) => required,
            Err(e) => {
                error!("Failed to determine whether cleanup is required: {}", e);
                return Err(e);
            }
        };
        if !required {
            info!("DaemonSet still present, keeping local volume groups");
            return Ok(());
        }

        info!("DaemonSet is being removed, cleaning up local volume groups");
        self.core.cleanup().await.map_err(|e| {
            error!("Cleanup failed: {}", e);
            e
        })
    }
}
