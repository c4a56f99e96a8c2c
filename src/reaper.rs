//! Released-PV Reaper
//!
//! A released volume keeps its protection finalizers until the provisioner on
//! its home node deletes the logical volume. When that node is gone for good
//! nobody ever will, so the reaper issues the deletion and drops the
//! finalizers itself. Logical volumes are never touched here.

use crate::domain::ports::{ClusterApiRef, EventRecorderRef};
use crate::error::{IgnoreNotFound, Result};
use crate::events::{object_ref, EventSink};
use crate::gc::owner::is_driver_volume;
use crate::manager::{Requeue, WorkQueue};
use crate::metrics::Metrics;
use crate::volume::{PROVISIONER_FINALIZER, PV_PROTECTION_FINALIZER, TOPOLOGY_KEY};
use futures::{StreamExt, TryStreamExt};
use k8s_openapi::api::core::v1::{Node, PersistentVolume};
use kube::runtime::{watcher, WatchStreamExt};
use kube::Api;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

const DELETE_ISSUED: &str = "DeleteIssued";
const DELETE_FAILED: &str = "DeleteFailed";
const FINALIZERS_REMOVED: &str = "FinalizersRemoved";
const FINALIZER_REMOVAL_FAILED: &str = "FinalizerRemovalFailed";

/// Delay before checking a volume again once its deletion was requested
const DELETION_RECHECK: Duration = Duration::from_secs(1);

/// Finalizers the reaper is allowed to remove
const BLOCKING_FINALIZERS: [&str; 2] = [PV_PROTECTION_FINALIZER, PROVISIONER_FINALIZER];

// =============================================================================
// Predicates
// =============================================================================

/// Released driver volume with a `Delete` reclaim policy
pub fn is_released_for_deletion(pv: &PersistentVolume) -> bool {
    if !is_driver_volume(pv) {
        return false;
    }
    let released = pv.status.as_ref().and_then(|s| s.phase.as_deref()) == Some("Released");
    let delete_policy = pv
        .spec
        .as_ref()
        .and_then(|s| s.persistent_volume_reclaim_policy.as_deref())
        == Some("Delete");
    released && delete_policy
}

/// The deletion-blocking finalizers present on `pv`
pub fn blocking_finalizers(pv: &PersistentVolume) -> Vec<String> {
    pv.metadata
        .finalizers
        .iter()
        .flatten()
        .filter(|f| BLOCKING_FINALIZERS.contains(&f.as_str()))
        .cloned()
        .collect()
}

/// Nodes named by the required affinity on the driver's topology key
pub fn topology_hostnames(pv: &PersistentVolume) -> Vec<String> {
    let Some(required) = pv
        .spec
        .as_ref()
        .and_then(|s| s.node_affinity.as_ref())
        .and_then(|a| a.required.as_ref())
    else {
        return Vec::new();
    };

    required
        .node_selector_terms
        .iter()
        .flat_map(|term| term.match_expressions.iter().flatten())
        .filter(|expr| expr.key == TOPOLOGY_KEY && expr.operator == "In")
        .flat_map(|expr| expr.values.iter().flatten().cloned())
        .collect()
}

pub fn is_node_ready(node: &Node) -> bool {
    node.status
        .as_ref()
        .and_then(|s| s.conditions.as_ref())
        .and_then(|conditions| conditions.iter().find(|c| c.type_ == "Ready"))
        .map(|c| c.status == "True")
        .unwrap_or(false)
}

// =============================================================================
// Reconciler
// =============================================================================

pub struct ReleasedVolumeReaper {
    cluster: ClusterApiRef,
    recorder: EventRecorderRef,
    metrics: Arc<Metrics>,
}

impl ReleasedVolumeReaper {
    pub fn new(cluster: ClusterApiRef, recorder: EventRecorderRef, metrics: Arc<Metrics>) -> Self {
        Self {
            cluster,
            recorder,
            metrics,
        }
    }

    /// Whether any of `hostnames` is an existing, ready node
    async fn any_node_available(&self, hostnames: &[String]) -> bool {
        for hostname in hostnames {
            match self.cluster.get_node(hostname).await {
                Ok(Some(node)) if is_node_ready(&node) => {
                    debug!("Node {} is available", hostname);
                    return true;
                }
                Ok(_) => {}
                Err(e) => debug!("Failed to get node {}: {}", hostname, e),
            }
        }
        false
    }

    #[instrument(skip(self))]
    pub async fn reconcile(&self, name: &str) -> Result<Requeue> {
        let Some(pv) = self.cluster.get_persistent_volume(name).await? else {
            return Ok(Requeue::Done);
        };
        if !is_released_for_deletion(&pv) {
            return Ok(Requeue::Done);
        }
        let finalizers = blocking_finalizers(&pv);
        if finalizers.is_empty() {
            return Ok(Requeue::Done);
        }

        let hostnames = topology_hostnames(&pv);
        if hostnames.is_empty() {
            info!("PersistentVolume {} has no node topology, keeping finalizers", name);
            return Ok(Requeue::Done);
        }
        if self.any_node_available(&hostnames).await {
            info!("PersistentVolume {} has an available node, keeping finalizers", name);
            return Ok(Requeue::Done);
        }

        let events = EventSink::new(self.recorder.clone(), Some(object_ref(&pv)));

        // Deletion must be pending before the finalizers go, or the volume
        // would linger as Released with nothing guarding it
        if pv.metadata.deletion_timestamp.is_none() {
            info!("No node of {:?} is available, deleting PersistentVolume {}", hostnames, name);
            if let Err(e) = self.cluster.delete_persistent_volume(name).await {
                events
                    .warning(DELETE_FAILED, format!("Failed to delete PV: {}", e))
                    .await;
                return Err(e);
            }
            events
                .normal(
                    DELETE_ISSUED,
                    "Issued PV delete request because no hostname nodes are available",
                )
                .await;
            return Ok(Requeue::After(DELETION_RECHECK));
        }

        let remaining: Vec<String> = pv
            .metadata
            .finalizers
            .iter()
            .flatten()
            .filter(|f| !finalizers.contains(f))
            .cloned()
            .collect();

        match self
            .cluster
            .patch_persistent_volume_finalizers(name, &remaining)
            .await
            .ignore_not_found()
        {
            Ok(None) => {
                info!("PersistentVolume {} already deleted", name);
                Ok(Requeue::Done)
            }
            Ok(Some(())) => {
                info!("Removed finalizers {:?} from PersistentVolume {}", finalizers, name);
                self.metrics.finalizer_removals.inc();
                events
                    .normal(
                        FINALIZERS_REMOVED,
                        "Removed PV finalizers because no hostname nodes are available",
                    )
                    .await;
                Ok(Requeue::Done)
            }
            Err(e) => {
                warn!("Failed to remove finalizers from {}: {}", name, e);
                events
                    .warning(
                        FINALIZER_REMOVAL_FAILED,
                        format!("Failed to remove finalizers: {}", e),
                    )
                    .await;
                Err(e)
            }
        }
    }

    /// Watch PersistentVolumes and reconcile released ones until `cancel` fires
    pub async fn run(self: Arc<Self>, api: Api<PersistentVolume>, cancel: CancellationToken) -> Result<()> {
        let queue = WorkQueue::new("released-pv-reaper");
        let handle = queue.handle();
        let watch_cancel = cancel.clone();

        tokio::spawn(async move {
            let mut stream = watcher(api, watcher::Config::default())
                .default_backoff()
                .applied_objects()
                .boxed();
            loop {
                let next = tokio::select! {
                    _ = watch_cancel.cancelled() => return,
                    next = stream.try_next() => next,
                };
                match next {
                    Ok(Some(pv)) => {
                        if is_released_for_deletion(&pv) {
                            if let Some(name) = pv.metadata.name {
                                handle.enqueue(name);
                            }
                        }
                    }
                    Ok(None) => return,
                    Err(e) => warn!("PersistentVolume watch error: {}", e),
                }
            }
        });

        queue
            .run(cancel, |name| {
                let this = self.clone();
                async move { this.reconcile(&name).await }
            })
            .await
    }
}
