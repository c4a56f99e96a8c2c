//! Periodic orphan scanner
//!
//! Walks every logical volume in the driver's volume groups and removes the
//! ones no PersistentVolume on this node accounts for. Closes the windows the
//! failover reconciler cannot see: volumes created before installation,
//! updates missed while the driver was down and out-of-band LVM changes.

use super::index::VolumeHandleIndex;
use super::owner::{has_owner_mismatch, volume_handle};
use crate::domain::ports::{EventRecorderRef, LvmVolumeManagerRef};
use crate::error::Result;
use crate::events::{node_ref, EventSink};
use crate::lvm::Selector;
use crate::metrics::Metrics;
use crate::volume::{VolumeId, DEFAULT_VOLUME_GROUP, DEFAULT_VOLUME_GROUP_TAG};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

const CLEANING_UP: &str = "CleaningUpOrphanedLV";
const CLEANED_UP: &str = "CleanedUpOrphanedLV";
const CLEANUP_FAILED: &str = "OrphanCleanupFailed";

pub const REASON_NO_PV: &str = "no PV with matching volume handle";
pub const REASON_OTHER_DRIVER: &str = "no corresponding PV found";
pub const REASON_MISMATCH: &str = "node annotation mismatch";

/// Orphan scanner configuration
#[derive(Debug, Clone)]
pub struct OrphanScannerConfig {
    /// Time between scans
    pub interval: Duration,
}

impl Default for OrphanScannerConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(600),
        }
    }
}

/// Outcome of one scan
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScanReport {
    pub total: usize,
    pub orphaned: Vec<(String, &'static str)>,
    pub cleaned: usize,
    pub failed: usize,
}

pub struct OrphanScanner {
    node_id: String,
    volumes: LvmVolumeManagerRef,
    index: Arc<VolumeHandleIndex>,
    recorder: EventRecorderRef,
    metrics: Arc<Metrics>,
    config: OrphanScannerConfig,
}

impl OrphanScanner {
    pub fn new(
        node_id: impl Into<String>,
        volumes: LvmVolumeManagerRef,
        index: Arc<VolumeHandleIndex>,
        recorder: EventRecorderRef,
        metrics: Arc<Metrics>,
        config: OrphanScannerConfig,
    ) -> Self {
        Self {
            node_id: node_id.into(),
            volumes,
            index,
            recorder,
            metrics,
            config,
        }
    }

    /// Why `volume_id` is orphaned, `None` when a PersistentVolume on this
    /// node accounts for it
    pub fn classify(&self, volume_id: &str) -> Option<&'static str> {
        let matching = self.index.lookup(volume_id);
        if matching.is_empty() {
            return Some(REASON_NO_PV);
        }
        match matching.iter().find(|pv| volume_handle(pv).is_some()) {
            Some(pv) if has_owner_mismatch(pv, &self.node_id) => Some(REASON_MISMATCH),
            Some(_) => None,
            None => Some(REASON_OTHER_DRIVER),
        }
    }

    /// Volume groups to inspect: the tagged ones, else the default group
    async fn volume_groups(&self) -> Result<Vec<String>> {
        let tag = Selector::VgTag(DEFAULT_VOLUME_GROUP_TAG.to_string());
        let vgs = self.volumes.list_volume_groups(Some(&tag)).await?;
        if vgs.is_empty() {
            debug!(
                "No volume groups tagged {}, checking {}",
                DEFAULT_VOLUME_GROUP_TAG, DEFAULT_VOLUME_GROUP
            );
            return Ok(vec![DEFAULT_VOLUME_GROUP.to_string()]);
        }
        Ok(vgs.into_iter().map(|vg| vg.name).collect())
    }

    /// Run one scan and remove every orphan found
    pub async fn scan(&self) -> Result<ScanReport> {
        info!("Starting LVM orphan scan on node {}", self.node_id);
        let mut report = ScanReport::default();

        for vg in self.volume_groups().await? {
            let select = Selector::VgName(vg.clone());
            let lvs = match self.volumes.list_logical_volumes(Some(&select)).await {
                Ok(lvs) => lvs,
                Err(e) => {
                    error!("Failed to list logical volumes in {}: {}", vg, e);
                    continue;
                }
            };
            for lv in lvs {
                report.total += 1;
                let volume_id = VolumeId::new(&vg, &lv.name).to_string();
                if let Some(reason) = self.classify(&volume_id) {
                    info!("Found orphaned volume {}: {}", volume_id, reason);
                    report.orphaned.push((volume_id, reason));
                }
            }
        }
        info!(
            "Orphan scan found {} orphaned of {} volumes",
            report.orphaned.len(),
            report.total
        );

        for (volume_id, reason) in &report.orphaned {
            match self.delete_orphan(volume_id, reason).await {
                Ok(()) => report.cleaned += 1,
                Err(e) => {
                    error!("Failed to delete orphaned volume {}: {}", volume_id, e);
                    report.failed += 1;
                }
            }
        }
        if !report.orphaned.is_empty() {
            info!(
                "Orphan cleanup completed: {} cleaned, {} failed",
                report.cleaned, report.failed
            );
        }
        Ok(report)
    }

    async fn delete_orphan(&self, volume_id: &str, reason: &str) -> Result<()> {
        let events = EventSink::new(self.recorder.clone(), Some(node_ref(&self.node_id)));
        events
            .normal(
                CLEANING_UP,
                format!(
                    "Cleaning up orphaned LVM logical volume {} on node {} ({})",
                    volume_id, self.node_id, reason
                ),
            )
            .await;

        match self.volumes.get_node_device_path(volume_id).await {
            Ok(path) if !path.is_empty() => {
                if let Err(e) = self.volumes.unmount_volume(&path).await {
                    warn!("Failed to unmount {}, deleting anyway: {}", path, e);
                }
            }
            Ok(_) => {}
            Err(e) => debug!("No device path for {}, deleting anyway: {}", volume_id, e),
        }

        if let Err(e) = self.volumes.delete_volume(volume_id).await {
            self.metrics.record_orphan_cleanup(false);
            events
                .warning(
                    CLEANUP_FAILED,
                    format!(
                        "Failed to cleanup orphaned LVM logical volume {} on node {}: {}",
                        volume_id, self.node_id, e
                    ),
                )
                .await;
            return Err(e);
        }

        self.metrics.record_orphan_cleanup(true);
        events
            .normal(
                CLEANED_UP,
                format!(
                    "Successfully cleaned up orphaned LVM logical volume {} on node {}",
                    volume_id, self.node_id
                ),
            )
            .await;
        Ok(())
    }

    /// Scan once the index is populated, then every interval until `cancel`
    pub async fn run(self, cancel: CancellationToken) -> Result<()> {
        tokio::select! {
            _ = cancel.cancelled() => return Ok(()),
            _ = self.index.wait_synced() => {}
        }
        info!(
            "Starting LVM orphan scanner every {}s",
            self.config.interval.as_secs()
        );

        let mut ticker = tokio::time::interval(self.config.interval);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!("Stopping LVM orphan scanner");
                    return Ok(());
                }
                // The first tick completes immediately
                _ = ticker.tick() => {
                    if let Err(e) = self.scan().await {
                        error!("LVM orphan scan failed: {}", e);
                    }
                }
            }
        }
    }
}
