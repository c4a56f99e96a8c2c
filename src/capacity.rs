//! Stale CSIStorageCapacity cleanup
//!
//! A per-node provisioner deployed as a DaemonSet publishes capacity objects
//! owned by that DaemonSet. Once capacity is published by the driver itself
//! those objects are stale and would mislead the scheduler, so the driver
//! removes the ones naming its own node.

use crate::domain::ports::{ClusterApiRef, EventRecorderRef};
use crate::error::{IgnoreNotFound, Result};
use crate::events::{object_ref, EventSink};
use crate::metrics::Metrics;
use crate::volume::{DRIVER_NAME, DRIVER_NAME_LABEL, TOPOLOGY_KEY};
use futures::{StreamExt, TryStreamExt};
use k8s_openapi::api::storage::v1::CSIStorageCapacity;
use kube::runtime::{watcher, WatchStreamExt};
use kube::Api;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const CLEANED_UP: &str = "CleanedUpStaleCSIStorageCapacity";

/// Configuration for the capacity cleaner
#[derive(Debug, Clone)]
pub struct CapacityCleanupConfig {
    /// Interval between full passes over the namespace
    pub resync_interval: Duration,
}

impl Default for CapacityCleanupConfig {
    fn default() -> Self {
        Self {
            resync_interval: Duration::from_secs(600),
        }
    }
}

/// Label selector matching capacity objects published for this driver
pub fn driver_selector() -> String {
    format!("{}={}", DRIVER_NAME_LABEL, DRIVER_NAME)
}

/// Whether `capacity` is a DaemonSet-owned leftover for `node_id`
pub fn is_stale(capacity: &CSIStorageCapacity, node_id: &str) -> bool {
    if capacity.metadata.deletion_timestamp.is_some() {
        return false;
    }
    let labels = capacity.metadata.labels.as_ref();
    if labels.and_then(|l| l.get(DRIVER_NAME_LABEL)).map(String::as_str) != Some(DRIVER_NAME) {
        return false;
    }
    let topology_node = capacity
        .node_topology
        .as_ref()
        .and_then(|t| t.match_labels.as_ref())
        .and_then(|l| l.get(TOPOLOGY_KEY));
    if topology_node.map(String::as_str) != Some(node_id) {
        return false;
    }
    capacity
        .metadata
        .owner_references
        .iter()
        .flatten()
        .any(|o| o.kind.eq_ignore_ascii_case("DaemonSet") && o.controller == Some(true))
}

pub struct CapacityCleaner {
    node_id: String,
    namespace: String,
    cluster: ClusterApiRef,
    recorder: EventRecorderRef,
    metrics: Arc<Metrics>,
    config: CapacityCleanupConfig,
}

impl CapacityCleaner {
    pub fn new(
        node_id: impl Into<String>,
        namespace: impl Into<String>,
        cluster: ClusterApiRef,
        recorder: EventRecorderRef,
        metrics: Arc<Metrics>,
        config: CapacityCleanupConfig,
    ) -> Self {
        Self {
            node_id: node_id.into(),
            namespace: namespace.into(),
            cluster,
            recorder,
            metrics,
            config,
        }
    }

    /// Delete `capacity` if stale; returns whether it was removed
    pub async fn cleanup(&self, capacity: &CSIStorageCapacity) -> Result<bool> {
        if !is_stale(capacity, &self.node_id) {
            return Ok(false);
        }
        let name = capacity.metadata.name.clone().unwrap_or_default();
        let namespace = capacity
            .metadata
            .namespace
            .clone()
            .unwrap_or_else(|| self.namespace.clone());

        if self
            .cluster
            .delete_storage_capacity(&namespace, &name)
            .await
            .ignore_not_found()?
            .is_none()
        {
            debug!("CSIStorageCapacity {}/{} already gone", namespace, name);
            return Ok(true);
        }

        info!("Deleted stale CSIStorageCapacity {}/{}", namespace, name);
        self.metrics.capacity_cleanups.inc();
        EventSink::new(self.recorder.clone(), Some(object_ref(capacity)))
            .normal(
                CLEANED_UP,
                "Stale CSIStorageCapacity owned by DaemonSet marked for deletion",
            )
            .await;
        Ok(true)
    }

    /// One pass over every driver capacity object in the namespace
    pub async fn resync(&self) -> Result<usize> {
        let capacities = self
            .cluster
            .list_storage_capacities(&self.namespace, &driver_selector())
            .await?;
        let mut removed = 0;
        for capacity in &capacities {
            match self.cleanup(capacity).await {
                Ok(true) => removed += 1,
                Ok(false) => {}
                Err(e) => warn!(
                    "Failed to clean up CSIStorageCapacity {:?}: {}",
                    capacity.metadata.name, e
                ),
            }
        }
        Ok(removed)
    }

    /// Clean up on creation and on every resync until `cancel` fires
    pub async fn run(self: Arc<Self>, api: Api<CSIStorageCapacity>, cancel: CancellationToken) -> Result<()> {
        info!(
            "Starting CSIStorageCapacity cleanup for node {} in {}",
            self.node_id, self.namespace
        );
        let mut stream = watcher(api, watcher::Config::default().labels(&driver_selector()))
            .default_backoff()
            .applied_objects()
            .boxed();
        let mut ticker = tokio::time::interval(self.config.resync_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    if let Err(e) = self.resync().await {
                        warn!("CSIStorageCapacity resync failed: {}", e);
                    }
                }
                next = stream.try_next() => match next {
                    Ok(Some(capacity)) => {
                        if let Err(e) = self.cleanup(&capacity).await {
                            warn!("Failed to clean up CSIStorageCapacity {:?}: {}", capacity.metadata.name, e);
                        }
                    }
                    Ok(None) => break,
                    Err(e) => warn!("CSIStorageCapacity watch error: {}", e),
                },
            }
        }
        info!("Stopped CSIStorageCapacity cleanup");
        Ok(())
    }
}
