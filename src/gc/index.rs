//! Volume-handle index over PersistentVolumes
//!
//! Fed by a single PersistentVolume watch; only volumes provisioned by this
//! driver are indexed. Updates are forwarded to the failover reconciler with
//! the previously indexed version attached.

use super::owner::volume_handle;
use crate::error::Result;
use dashmap::DashMap;
use futures::StreamExt;
use k8s_openapi::api::core::v1::PersistentVolume;
use kube::runtime::{watcher, WatchStreamExt};
use kube::{Api, ResourceExt};
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// A PersistentVolume before and after an update
#[derive(Debug, Clone)]
pub struct PvUpdate {
    pub old: Arc<PersistentVolume>,
    pub new: Arc<PersistentVolume>,
}

/// PersistentVolumes of this driver, looked up by volume handle
pub struct VolumeHandleIndex {
    by_name: DashMap<String, Arc<PersistentVolume>>,
    by_handle: DashMap<String, Vec<String>>,
    synced: watch::Sender<bool>,
}

impl Default for VolumeHandleIndex {
    fn default() -> Self {
        Self::new()
    }
}

impl VolumeHandleIndex {
    pub fn new() -> Self {
        let (synced, _) = watch::channel(false);
        Self {
            by_name: DashMap::new(),
            by_handle: DashMap::new(),
            synced,
        }
    }

    /// Insert or replace `pv`, returning the version it replaced.
    ///
    /// Volumes of other drivers are dropped from the index.
    pub fn apply(&self, pv: PersistentVolume) -> Option<Arc<PersistentVolume>> {
        let name = pv.name_any();
        let Some(handle) = volume_handle(&pv).map(str::to_string) else {
            self.remove(&name);
            return None;
        };

        let previous = self.by_name.insert(name.clone(), Arc::new(pv));
        if let Some(old_handle) = previous.as_deref().and_then(volume_handle) {
            if old_handle != handle {
                self.unlink(old_handle, &name);
            }
        }
        let mut names = self.by_handle.entry(handle).or_default();
        if !names.contains(&name) {
            names.push(name);
        }
        previous
    }

    /// Drop the volume named `name`
    pub fn remove(&self, name: &str) -> Option<Arc<PersistentVolume>> {
        let (_, pv) = self.by_name.remove(name)?;
        if let Some(handle) = volume_handle(&pv) {
            self.unlink(handle, name);
        }
        Some(pv)
    }

    /// Replace the whole index content, as after a watch restart
    ///
    /// The new listing is applied over the old one before dropping names it
    /// no longer holds, so a volume present in both is never missing from a
    /// concurrent lookup.
    pub fn replace_all(&self, pvs: Vec<PersistentVolume>) {
        let mut listed = HashSet::with_capacity(pvs.len());
        for pv in pvs {
            listed.insert(pv.name_any());
            self.apply(pv);
        }
        let stale: Vec<String> = self
            .by_name
            .iter()
            .filter(|entry| !listed.contains(entry.key()))
            .map(|entry| entry.key().clone())
            .collect();
        for name in stale {
            self.remove(&name);
        }
        self.synced.send_replace(true);
    }

    /// Volumes whose handle equals `handle`
    pub fn lookup(&self, handle: &str) -> Vec<Arc<PersistentVolume>> {
        let Some(names) = self.by_handle.get(handle) else {
            return Vec::new();
        };
        names
            .iter()
            .filter_map(|name| self.by_name.get(name).map(|pv| pv.value().clone()))
            .collect()
    }

    pub fn get(&self, name: &str) -> Option<Arc<PersistentVolume>> {
        self.by_name.get(name).map(|pv| pv.value().clone())
    }

    pub fn len(&self) -> usize {
        self.by_name.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_name.is_empty()
    }

    pub fn is_synced(&self) -> bool {
        *self.synced.borrow()
    }

    /// Resolve once the first full listing has been indexed
    pub async fn wait_synced(&self) {
        let mut rx = self.synced.subscribe();
        // The sender lives as long as `self`
        let _ = rx.wait_for(|synced| *synced).await;
    }

    fn unlink(&self, handle: &str, name: &str) {
        let emptied = match self.by_handle.get_mut(handle) {
            Some(mut names) => {
                names.retain(|n| n != name);
                names.is_empty()
            }
            None => false,
        };
        if emptied {
            self.by_handle.remove_if(handle, |_, names| names.is_empty());
        }
    }

    /// Apply one watch event, forwarding updates of known volumes
    pub async fn handle_event(
        &self,
        event: watcher::Event<PersistentVolume>,
        updates: Option<&mpsc::Sender<PvUpdate>>,
    ) {
        match event {
            watcher::Event::Applied(pv) => {
                let name = pv.name_any();
                let previous = self.apply(pv);
                if let (Some(old), Some(tx)) = (previous, updates) {
                    if let Some(new) = self.get(&name) {
                        if tx.send(PvUpdate { old, new }).await.is_err() {
                            debug!("Update receiver dropped, not forwarding {}", name);
                        }
                    }
                }
            }
            watcher::Event::Deleted(pv) => {
                self.remove(&pv.name_any());
            }
            watcher::Event::Restarted(pvs) => {
                info!("Indexing {} PersistentVolumes", pvs.len());
                self.replace_all(pvs);
            }
        }
    }

    /// Keep the index in line with the cluster until `cancel` fires
    pub async fn run(
        self: Arc<Self>,
        api: Api<PersistentVolume>,
        updates: Option<mpsc::Sender<PvUpdate>>,
        cancel: CancellationToken,
    ) -> Result<()> {
        let mut stream = watcher(api, watcher::Config::default())
            .default_backoff()
            .boxed();
        info!("Starting PersistentVolume volume-handle index");

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!("Stopping PersistentVolume volume-handle index");
                    return Ok(());
                }
                event = stream.next() => match event {
                    Some(Ok(event)) => self.handle_event(event, updates.as_ref()).await,
                    Some(Err(e)) => warn!("PersistentVolume watch error: {}", e),
                    None => return Ok(()),
                },
            }
        }
    }
}
