//! Failover reconciler
//!
//! When a PersistentVolume owned by this node is reassigned to another node,
//! the local copy of its logical volume is removed.

use super::index::PvUpdate;
use super::owner::{has_owner_mismatch, is_driver_volume, owner_node, volume_handle};
use crate::domain::ports::{ClusterApiRef, EventRecorderRef, LvmVolumeManagerRef};
use crate::error::Result;
use crate::events::{object_ref, EventSink};
use crate::manager::{QueueHandle, Requeue, WorkQueue};
use crate::metrics::Metrics;
use k8s_openapi::api::core::v1::PersistentVolume;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

const CLEANING_UP: &str = "CleaningUpOrphanedVolume";
const CLEANED_UP: &str = "CleanedUpOrphanedVolume";
const CLEANUP_FAILED: &str = "CleanupFailed";

/// Whether an update moved a volume away from `node_id`.
///
/// Only volumes of this driver whose new owner exists and differs from an old
/// owner equal to this node pass.
pub fn moved_off_node(old: &PersistentVolume, new: &PersistentVolume, node_id: &str) -> bool {
    if !is_driver_volume(new) {
        return false;
    }
    let Some(new_owner) = owner_node(new) else {
        return false;
    };
    match owner_node(old) {
        Some(old_owner) => old_owner != new_owner && old_owner.eq_ignore_ascii_case(node_id),
        None => false,
    }
}

pub struct FailoverReconciler {
    node_id: String,
    cluster: ClusterApiRef,
    volumes: LvmVolumeManagerRef,
    recorder: EventRecorderRef,
    metrics: Arc<Metrics>,
}

impl FailoverReconciler {
    pub fn new(
        node_id: impl Into<String>,
        cluster: ClusterApiRef,
        volumes: LvmVolumeManagerRef,
        recorder: EventRecorderRef,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            node_id: node_id.into(),
            cluster,
            volumes,
            recorder,
            metrics,
        }
    }

    /// Reconcile the PersistentVolume `name`.
    ///
    /// A failed deletion is returned so the queue retries it.
    #[instrument(skip(self), fields(node = %self.node_id))]
    pub async fn reconcile(&self, name: &str) -> Result<Requeue> {
        let Some(pv) = self.cluster.get_persistent_volume(name).await? else {
            debug!("PersistentVolume {} not found, likely deleted", name);
            return Ok(Requeue::Done);
        };
        let Some(volume_id) = volume_handle(&pv).map(str::to_string) else {
            return Ok(Requeue::Done);
        };

        let phase = pv.status.as_ref().and_then(|s| s.phase.as_deref());
        if !matches!(phase, Some("Available") | Some("Bound")) {
            debug!("PersistentVolume {} in phase {:?}, skipping", name, phase);
            return Ok(Requeue::Done);
        }
        if pv.metadata.deletion_timestamp.is_some() {
            debug!("PersistentVolume {} is being deleted, skipping", name);
            return Ok(Requeue::Done);
        }
        if !has_owner_mismatch(&pv, &self.node_id) {
            return Ok(Requeue::Done);
        }

        let device_path = match self.volumes.get_node_device_path(&volume_id).await {
            Ok(path) if !path.is_empty() => path,
            Ok(_) => {
                debug!("Volume {} is not on this node", volume_id);
                return Ok(Requeue::Done);
            }
            Err(e) => {
                debug!("Volume {} not found on this node: {}", volume_id, e);
                return Ok(Requeue::Done);
            }
        };

        info!(
            "Volume {} moved to {:?}, cleaning up local copy",
            volume_id,
            owner_node(&pv)
        );
        let events = EventSink::new(self.recorder.clone(), Some(object_ref(&pv)));
        events
            .normal(
                CLEANING_UP,
                format!(
                    "Cleaning up LVM volume {} from node {} due to node annotation mismatch",
                    volume_id, self.node_id
                ),
            )
            .await;

        if let Err(e) = self.volumes.unmount_volume(&device_path).await {
            warn!("Failed to unmount {}, deleting anyway: {}", device_path, e);
        }

        if let Err(e) = self.volumes.delete_volume(&volume_id).await {
            error!("Failed to delete orphaned volume {}: {}", volume_id, e);
            self.metrics.record_orphan_cleanup(false);
            events
                .warning(
                    CLEANUP_FAILED,
                    format!(
                        "Failed to cleanup orphaned LVM volume {} from node {}: {}",
                        volume_id, self.node_id, e
                    ),
                )
                .await;
            return Err(e);
        }

        info!("Cleaned up orphaned volume {}", volume_id);
        self.metrics.record_orphan_cleanup(true);
        events
            .normal(
                CLEANED_UP,
                format!(
                    "Successfully cleaned up orphaned LVM volume {} from node {}",
                    volume_id, self.node_id
                ),
            )
            .await;
        Ok(Requeue::Done)
    }

    /// Enqueue updates passing the filter
    async fn filter_updates(
        node_id: String,
        mut updates: mpsc::Receiver<PvUpdate>,
        queue: QueueHandle,
        cancel: CancellationToken,
    ) {
        loop {
            let update = tokio::select! {
                _ = cancel.cancelled() => return,
                update = updates.recv() => match update {
                    Some(update) => update,
                    None => return,
                },
            };
            if moved_off_node(&update.old, &update.new, &node_id) {
                let name = update.new.metadata.name.clone().unwrap_or_default();
                info!("PersistentVolume {} moved off node {}", name, node_id);
                queue.enqueue(name);
            }
        }
    }

    /// Reconcile filtered updates until `cancel` fires
    pub async fn run(
        self: Arc<Self>,
        updates: mpsc::Receiver<PvUpdate>,
        cancel: CancellationToken,
    ) -> Result<()> {
        let queue = WorkQueue::new("pv-failover");
        tokio::spawn(Self::filter_updates(
            self.node_id.clone(),
            updates,
            queue.handle(),
            cancel.clone(),
        ));
        queue
            .run(cancel, |name| {
                let this = self.clone();
                async move { this.reconcile(&name).await }
            })
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::ports::{LvmManager, Mounter};
    use crate::gc::adapter::VolumeManagerAdapter;
    use crate::lvm::LvmError;
    use crate::testing::{persistent_volume, FakeCluster, FakeLvm, FakeMounter, FakeProbe, RecordingEvents};
    use crate::volume::{LvmVolumeCore, SELECTED_INITIAL_NODE_PARAM, SELECTED_NODE_ANNOTATION};
    use assert_matches::assert_matches;
    use std::collections::BTreeMap;

    fn owned_by(name: &str, selected: Option<&str>, initial: Option<&str>) -> PersistentVolume {
        let mut pv = persistent_volume(name, &format!("containerstorage#{}", name));
        if let Some(node) = selected {
            pv.metadata.annotations = Some(BTreeMap::from([(
                SELECTED_NODE_ANNOTATION.to_string(),
                node.to_string(),
            )]));
        }
        if let Some(node) = initial {
            pv.spec.as_mut().and_then(|s| s.csi.as_mut()).unwrap().volume_attributes =
                Some(BTreeMap::from([(
                    SELECTED_INITIAL_NODE_PARAM.to_string(),
                    node.to_string(),
                )]));
        }
        pv
    }

    struct Harness {
        lvm: Arc<FakeLvm>,
        cluster: Arc<FakeCluster>,
        mounter: Arc<FakeMounter>,
        events: Arc<RecordingEvents>,
        reconciler: FailoverReconciler,
    }

    fn harness() -> Harness {
        let lvm = Arc::new(FakeLvm::default());
        lvm.add_volume_group("containerstorage", &["/dev/sdb"], &["local-csi"]);
        lvm.add_logical_volume("containerstorage", "pvc-1", 8 << 20);
        let core = Arc::new(LvmVolumeCore::new(
            "node-1",
            lvm.clone(),
            Arc::new(FakeProbe::new(vec![])),
        ));
        let mounter = Arc::new(FakeMounter::default());
        let cluster = Arc::new(FakeCluster::default());
        let events = Arc::new(RecordingEvents::default());
        let reconciler = FailoverReconciler::new(
            "node-1",
            cluster.clone(),
            Arc::new(VolumeManagerAdapter::new(core, lvm.clone(), mounter.clone())),
            events.clone(),
            Arc::new(Metrics::new().unwrap()),
        );
        Harness {
            lvm,
            cluster,
            mounter,
            events,
            reconciler,
        }
    }

    #[test]
    fn test_update_filter() {
        let initial = owned_by("pvc-1", None, Some("node-1"));
        let moved = owned_by("pvc-1", Some("node-2"), Some("node-1"));
        assert!(moved_off_node(&initial, &moved, "node-1"));
        // Not ours to begin with
        assert!(!moved_off_node(&initial, &moved, "node-3"));
        // No new owner
        assert!(!moved_off_node(&moved, &owned_by("pvc-1", None, None), "node-1"));
        // Owner unchanged
        assert!(!moved_off_node(&moved, &moved, "node-2"));
        // Annotation first set to this node
        let pinned = owned_by("pvc-1", Some("node-1"), Some("node-1"));
        assert!(!moved_off_node(&initial, &pinned, "node-1"));

        let mut other = moved.clone();
        other.spec.as_mut().and_then(|s| s.csi.as_mut()).unwrap().driver = "other.csi.io".into();
        assert!(!moved_off_node(&initial, &other, "node-1"));
    }

    #[tokio::test]
    async fn test_reconcile_removes_moved_volume() {
        let h = harness();
        h.cluster.add_pv(owned_by("pvc-1", Some("node-2"), None));
        h.mounter
            .bind_mount(
                std::path::Path::new("/dev/containerstorage/pvc-1"),
                std::path::Path::new("/staging/pvc-1"),
                false,
            )
            .await
            .unwrap();

        assert_eq!(h.reconciler.reconcile("pvc-1").await.unwrap(), Requeue::Done);
        assert_matches!(
            h.lvm.get_logical_volume("containerstorage", "pvc-1").await,
            Err(LvmError::NotFound(_))
        );
        assert_eq!(h.mounter.cleaned_devices(), vec!["/dev/containerstorage/pvc-1".to_string()]);
        assert_eq!(h.events.reasons(), vec![CLEANING_UP, CLEANED_UP]);
    }

    #[tokio::test]
    async fn test_reconcile_keeps_owned_volume() {
        let h = harness();
        h.cluster.add_pv(owned_by("pvc-1", Some("NODE-1"), None));
        h.reconciler.reconcile("pvc-1").await.unwrap();
        assert!(h.lvm.get_logical_volume("containerstorage", "pvc-1").await.is_ok());
        assert!(h.events.reasons().is_empty());
    }

    #[tokio::test]
    async fn test_reconcile_skips_released_and_deleting() {
        let h = harness();
        let mut released = owned_by("pvc-1", Some("node-2"), None);
        released.status.as_mut().unwrap().phase = Some("Released".into());
        h.cluster.add_pv(released);
        h.reconciler.reconcile("pvc-1").await.unwrap();
        assert!(h.lvm.get_logical_volume("containerstorage", "pvc-1").await.is_ok());

        let mut deleting = owned_by("pvc-1", Some("node-2"), None);
        deleting.metadata.deletion_timestamp = Some(k8s_openapi::apimachinery::pkg::apis::meta::v1::Time(
            chrono::Utc::now(),
        ));
        h.cluster.add_pv(deleting);
        h.reconciler.reconcile("pvc-1").await.unwrap();
        assert!(h.lvm.get_logical_volume("containerstorage", "pvc-1").await.is_ok());
    }

    #[tokio::test]
    async fn test_reconcile_missing_pv_or_volume() {
        let h = harness();
        assert_eq!(h.reconciler.reconcile("pvc-9").await.unwrap(), Requeue::Done);

        h.cluster.add_pv(owned_by("pvc-2", Some("node-2"), None));
        h.reconciler.reconcile("pvc-2").await.unwrap();
        assert!(h.events.reasons().is_empty());
    }

    #[tokio::test]
    async fn test_reconcile_returns_delete_failure() {
        let h = harness();
        h.cluster.add_pv(owned_by("pvc-1", Some("node-2"), None));
        h.lvm.fail_next_lv_remove(LvmError::Other {
            command: "lvremove".into(),
            message: "Logical volume in use".into(),
        });

        assert!(h.reconciler.reconcile("pvc-1").await.is_err());
        assert_eq!(h.events.reasons(), vec![CLEANING_UP, CLEANUP_FAILED]);
    }
}
