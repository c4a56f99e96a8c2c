//! In-memory fakes of every port, plus object builders for tests

use crate::csi::types::*;
use crate::csi::{CsiController, CsiNode, CsiResult};
use crate::domain::ports::{BlockDevices, ClusterApi, DeviceProbe, EventRecorder, LvmManager, Mounter};
use crate::error::{Error, Result};
use crate::events::EventType;
use crate::lvm::{
    round_down_to_extent, round_up_to_extent, CreateLvOptions, CreatePvOptions, CreateVgOptions,
    LogicalVolume, LvLayout, LvmError, LvmResult, PhysicalVolume, Selector, VolumeGroup,
    EXTENT_SIZE,
};
use crate::probe::BlockDevice;
use crate::volume::{DRIVER_NAME, TOPOLOGY_KEY};
use async_trait::async_trait;
use k8s_openapi::api::apps::v1::DaemonSet;
use k8s_openapi::api::core::v1::{
    CSIPersistentVolumeSource, Node, NodeCondition, NodeStatus, ObjectReference, PersistentVolume,
    PersistentVolumeClaim, PersistentVolumeSpec, PersistentVolumeStatus, Pod,
};
use k8s_openapi::api::storage::v1::{CSIStorageCapacity, StorageClass};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{OwnerReference, Time};
use parking_lot::Mutex;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::{Path, PathBuf};

/// Size of every physical volume the fake creates
pub const FAKE_PV_SIZE: u64 = 20 << 30;

// =============================================================================
// LVM
// =============================================================================

/// A mutating call made against [`FakeLvm`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LvmCall {
    CreatePhysicalVolume(String),
    RemovePhysicalVolume(String),
    CreateVolumeGroup(String),
    RemoveVolumeGroup(String),
    CreateLogicalVolume(String, String),
    ExtendLogicalVolume(String, String),
    RemoveLogicalVolume(String, String),
}

#[derive(Default)]
struct LvmState {
    pvs: BTreeMap<String, PhysicalVolume>,
    /// Volume group name to tags
    vgs: BTreeMap<String, Vec<String>>,
    lvs: BTreeMap<(String, String), LogicalVolume>,
    layouts: HashMap<(String, String), LvLayout>,
    calls: Vec<LvmCall>,
    fail_vg_create: Option<LvmError>,
    fail_lv_remove: Option<LvmError>,
}

impl LvmState {
    fn volume_group(&self, name: &str) -> Option<VolumeGroup> {
        let tags = self.vgs.get(name)?;
        let pvs: Vec<&PhysicalVolume> = self.pvs.values().filter(|pv| pv.vg_name == name).collect();
        let lvs: Vec<&LogicalVolume> = self.lvs.values().filter(|lv| lv.vg_name == name).collect();
        let size: u64 = pvs.iter().map(|pv| round_down_to_extent(pv.size)).sum();
        let used: u64 = lvs.iter().map(|lv| lv.size).sum();
        Some(VolumeGroup {
            name: name.to_string(),
            uuid: format!("uuid-{}", name),
            size,
            free: size.saturating_sub(used),
            extent_size: EXTENT_SIZE,
            pv_count: pvs.len() as u32,
            lv_count: lvs.len() as u32,
            tags: tags.clone(),
        })
    }

    fn vg_matches(&self, vg_name: &str, select: Option<&Selector>) -> bool {
        match select {
            None => true,
            Some(select) => {
                let tags = self.vgs.get(vg_name).cloned().unwrap_or_default();
                select.matches(vg_name, &tags)
            }
        }
    }

    fn insert_pv(&mut self, name: &str, vg: &str) {
        self.pvs.insert(
            name.to_string(),
            PhysicalVolume {
                name: name.to_string(),
                vg_name: vg.to_string(),
                size: FAKE_PV_SIZE,
                free: FAKE_PV_SIZE,
            },
        );
    }
}

/// [`LvmManager`] over an in-memory model; volume group sizes are derived
/// from their physical volumes
#[derive(Default)]
pub struct FakeLvm {
    state: Mutex<LvmState>,
}

impl FakeLvm {
    pub fn add_physical_volume(&self, name: &str, vg: &str) {
        self.state.lock().insert_pv(name, vg);
    }

    pub fn add_volume_group(&self, name: &str, pvs: &[&str], tags: &[&str]) {
        let mut state = self.state.lock();
        for pv in pvs {
            state.insert_pv(pv, name);
        }
        state
            .vgs
            .insert(name.to_string(), tags.iter().map(|t| t.to_string()).collect());
    }

    /// Insert a logical volume as is, without rounding or space checks
    pub fn add_logical_volume(&self, vg: &str, name: &str, size: u64) {
        self.state.lock().lvs.insert(
            (vg.to_string(), name.to_string()),
            LogicalVolume {
                name: name.to_string(),
                vg_name: vg.to_string(),
                path: format!("/dev/{}/{}", vg, name),
                size,
                attr: "-wi-a-----".to_string(),
            },
        );
    }

    pub fn fail_next_vg_create(&self, err: LvmError) {
        self.state.lock().fail_vg_create = Some(err);
    }

    pub fn fail_next_lv_remove(&self, err: LvmError) {
        self.state.lock().fail_lv_remove = Some(err);
    }

    pub fn created_layout(&self, vg: &str, name: &str) -> Option<LvLayout> {
        self.state
            .lock()
            .layouts
            .get(&(vg.to_string(), name.to_string()))
            .copied()
    }

    pub fn calls(&self) -> Vec<LvmCall> {
        self.state.lock().calls.clone()
    }

    pub fn mutation_count(&self) -> usize {
        self.state.lock().calls.len()
    }
}

#[async_trait]
impl LvmManager for FakeLvm {
    async fn create_physical_volume(&self, opts: &CreatePvOptions) -> LvmResult<()> {
        let mut state = self.state.lock();
        state.calls.push(LvmCall::CreatePhysicalVolume(opts.name.clone()));
        if state.pvs.contains_key(&opts.name) {
            return Err(LvmError::AlreadyExists(opts.name.clone()));
        }
        state.insert_pv(&opts.name, "");
        Ok(())
    }

    async fn remove_physical_volume(&self, name: &str) -> LvmResult<()> {
        let mut state = self.state.lock();
        state.calls.push(LvmCall::RemovePhysicalVolume(name.to_string()));
        state
            .pvs
            .remove(name)
            .map(|_| ())
            .ok_or_else(|| LvmError::NotFound(name.to_string()))
    }

    async fn list_physical_volumes(
        &self,
        select: Option<&Selector>,
    ) -> LvmResult<Vec<PhysicalVolume>> {
        let state = self.state.lock();
        Ok(state
            .pvs
            .values()
            .filter(|pv| state.vg_matches(&pv.vg_name, select))
            .cloned()
            .collect())
    }

    async fn create_volume_group(&self, opts: &CreateVgOptions) -> LvmResult<()> {
        let mut state = self.state.lock();
        state.calls.push(LvmCall::CreateVolumeGroup(opts.name.clone()));
        if let Some(err) = state.fail_vg_create.take() {
            return Err(err);
        }
        if state.vgs.contains_key(&opts.name) {
            return Err(LvmError::AlreadyExists(opts.name.clone()));
        }
        for pv in &opts.pv_names {
            match state.pvs.get(pv) {
                Some(existing) if !existing.vg_name.is_empty() => {
                    return Err(LvmError::PvAlreadyInVolumeGroup(pv.clone()));
                }
                _ => {}
            }
        }
        for pv in &opts.pv_names {
            state.insert_pv(pv, &opts.name);
        }
        state.vgs.insert(opts.name.clone(), opts.tags.clone());
        Ok(())
    }

    async fn remove_volume_group(&self, name: &str) -> LvmResult<()> {
        let mut state = self.state.lock();
        state.calls.push(LvmCall::RemoveVolumeGroup(name.to_string()));
        if state.vgs.remove(name).is_none() {
            return Err(LvmError::NotFound(name.to_string()));
        }
        state.lvs.retain(|(vg, _), _| vg != name);
        for pv in state.pvs.values_mut().filter(|pv| pv.vg_name == name) {
            pv.vg_name.clear();
        }
        Ok(())
    }

    async fn get_volume_group(&self, name: &str) -> LvmResult<VolumeGroup> {
        self.state
            .lock()
            .volume_group(name)
            .ok_or_else(|| LvmError::NotFound(name.to_string()))
    }

    async fn list_volume_groups(&self, select: Option<&Selector>) -> LvmResult<Vec<VolumeGroup>> {
        let state = self.state.lock();
        Ok(state
            .vgs
            .keys()
            .filter(|name| state.vg_matches(name, select))
            .filter_map(|name| state.volume_group(name))
            .collect())
    }

    async fn create_logical_volume(&self, opts: &CreateLvOptions) -> LvmResult<LogicalVolume> {
        let mut state = self.state.lock();
        state
            .calls
            .push(LvmCall::CreateLogicalVolume(opts.vg_name.clone(), opts.name.clone()));
        let vg = state
            .volume_group(&opts.vg_name)
            .ok_or_else(|| LvmError::NotFound(opts.vg_name.clone()))?;
        let key = (opts.vg_name.clone(), opts.name.clone());
        if state.lvs.contains_key(&key) {
            return Err(LvmError::AlreadyExists(opts.name.clone()));
        }
        let size = round_up_to_extent(opts.size_bytes);
        if size > vg.free {
            return Err(LvmError::ResourceExhausted(format!(
                "{} bytes requested, {} free in {}",
                size, vg.free, vg.name
            )));
        }
        let lv = LogicalVolume {
            name: opts.name.clone(),
            vg_name: opts.vg_name.clone(),
            path: format!("/dev/{}/{}", opts.vg_name, opts.name),
            size,
            attr: "-wi-a-----".to_string(),
        };
        state.layouts.insert(key.clone(), opts.layout);
        state.lvs.insert(key, lv.clone());
        Ok(lv)
    }

    async fn extend_logical_volume(&self, vg: &str, name: &str, size_bytes: u64) -> LvmResult<u64> {
        let mut state = self.state.lock();
        state
            .calls
            .push(LvmCall::ExtendLogicalVolume(vg.to_string(), name.to_string()));
        let free = state.volume_group(vg).map(|g| g.free).unwrap_or(0);
        let lv = state
            .lvs
            .get_mut(&(vg.to_string(), name.to_string()))
            .ok_or_else(|| LvmError::NotFound(format!("{}/{}", vg, name)))?;
        let target = round_up_to_extent(size_bytes);
        if target <= lv.size {
            return Ok(lv.size);
        }
        if target - lv.size > free {
            return Err(LvmError::ResourceExhausted(format!("{} free in {}", free, vg)));
        }
        lv.size = target;
        Ok(target)
    }

    async fn remove_logical_volume(&self, vg: &str, name: &str) -> LvmResult<()> {
        let mut state = self.state.lock();
        state
            .calls
            .push(LvmCall::RemoveLogicalVolume(vg.to_string(), name.to_string()));
        if let Some(err) = state.fail_lv_remove.take() {
            return Err(err);
        }
        let key = (vg.to_string(), name.to_string());
        state.layouts.remove(&key);
        state
            .lvs
            .remove(&key)
            .map(|_| ())
            .ok_or_else(|| LvmError::NotFound(format!("{}/{}", vg, name)))
    }

    async fn get_logical_volume(&self, vg: &str, name: &str) -> LvmResult<LogicalVolume> {
        self.state
            .lock()
            .lvs
            .get(&(vg.to_string(), name.to_string()))
            .cloned()
            .ok_or_else(|| LvmError::NotFound(format!("{}/{}", vg, name)))
    }

    async fn list_logical_volumes(
        &self,
        select: Option<&Selector>,
    ) -> LvmResult<Vec<LogicalVolume>> {
        let state = self.state.lock();
        Ok(state
            .lvs
            .values()
            .filter(|lv| state.vg_matches(&lv.vg_name, select))
            .cloned()
            .collect())
    }

    fn is_supported(&self) -> bool {
        true
    }
}

// =============================================================================
// Devices
// =============================================================================

/// [`DeviceProbe`] returning a fixed device list, all of them blank
pub struct FakeProbe {
    devices: Vec<BlockDevice>,
}

impl FakeProbe {
    pub fn new(devices: Vec<BlockDevice>) -> Self {
        Self { devices }
    }
}

#[async_trait]
impl DeviceProbe for FakeProbe {
    async fn scan_devices(&self) -> Result<Vec<String>> {
        if self.devices.is_empty() {
            return Err(Error::NoDevicesFound);
        }
        let mut paths: Vec<String> = self.devices.iter().map(BlockDevice::device_path).collect();
        paths.sort();
        Ok(paths)
    }

    async fn scan_available_devices(&self) -> Result<Vec<BlockDevice>> {
        if self.devices.is_empty() {
            return Err(Error::NoDevicesFound);
        }
        let mut devices = self.devices.clone();
        devices.sort_by_key(BlockDevice::device_path);
        Ok(devices)
    }
}

/// [`BlockDevices`] over a fixed enumeration
pub struct FakeBlockDevices {
    devices: Vec<BlockDevice>,
    formatted: BTreeSet<String>,
}

impl FakeBlockDevices {
    pub fn new(devices: Vec<BlockDevice>) -> Self {
        Self {
            devices,
            formatted: BTreeSet::new(),
        }
    }

    /// Report a signature on `path`
    pub fn with_formatted(mut self, path: &str) -> Self {
        self.formatted.insert(path.to_string());
        self
    }
}

#[async_trait]
impl BlockDevices for FakeBlockDevices {
    async fn get_devices(&self) -> Result<Vec<BlockDevice>> {
        Ok(self.devices.clone())
    }

    async fn is_unformatted(&self, device: &str) -> Result<bool> {
        Ok(!self.formatted.contains(device))
    }
}

// =============================================================================
// Mounts
// =============================================================================

#[derive(Debug, Clone)]
struct FakeMount {
    source: PathBuf,
    read_only: bool,
}

#[derive(Default)]
struct MounterState {
    mounts: BTreeMap<PathBuf, FakeMount>,
    formatted: Vec<(PathBuf, String)>,
    cleaned: Vec<String>,
    resized: Vec<PathBuf>,
}

/// [`Mounter`] tracking a mount table in memory
#[derive(Default)]
pub struct FakeMounter {
    state: Mutex<MounterState>,
}

impl FakeMounter {
    /// Devices passed to `cleanup_staging_dir`, in call order
    pub fn cleaned_devices(&self) -> Vec<String> {
        self.state.lock().cleaned.clone()
    }

    pub fn formatted(&self) -> Vec<(PathBuf, String)> {
        self.state.lock().formatted.clone()
    }

    pub fn source_of(&self, target: &Path) -> Option<PathBuf> {
        self.state.lock().mounts.get(target).map(|m| m.source.clone())
    }

    pub fn is_read_only(&self, target: &Path) -> bool {
        self.state
            .lock()
            .mounts
            .get(target)
            .map(|m| m.read_only)
            .unwrap_or(false)
    }

    pub fn resized(&self) -> Vec<PathBuf> {
        self.state.lock().resized.clone()
    }
}

#[async_trait]
impl Mounter for FakeMounter {
    async fn is_mount_point(&self, path: &Path) -> Result<bool> {
        Ok(self.state.lock().mounts.contains_key(path))
    }

    async fn bind_mount(&self, source: &Path, target: &Path, read_only: bool) -> Result<()> {
        self.state.lock().mounts.insert(
            target.to_path_buf(),
            FakeMount {
                source: source.to_path_buf(),
                read_only,
            },
        );
        Ok(())
    }

    async fn format_and_mount(
        &self,
        device: &Path,
        target: &Path,
        fs_type: &str,
        _options: &[String],
    ) -> Result<()> {
        let mut state = self.state.lock();
        state.formatted.push((device.to_path_buf(), fs_type.to_string()));
        state.mounts.insert(
            target.to_path_buf(),
            FakeMount {
                source: device.to_path_buf(),
                read_only: false,
            },
        );
        Ok(())
    }

    async fn unmount(&self, target: &Path) -> Result<()> {
        self.state.lock().mounts.remove(target);
        Ok(())
    }

    async fn cleanup_staging_dir(&self, device_path: &str) -> Result<()> {
        let mut state = self.state.lock();
        state.mounts.retain(|_, m| m.source != Path::new(device_path));
        state.cleaned.push(device_path.to_string());
        Ok(())
    }

    async fn resize_filesystem(&self, _device: &Path, mount_path: &Path) -> Result<()> {
        self.state.lock().resized.push(mount_path.to_path_buf());
        Ok(())
    }
}

// =============================================================================
// Events
// =============================================================================

#[derive(Debug, Clone)]
pub struct RecordedEvent {
    pub target: ObjectReference,
    pub event_type: EventType,
    pub reason: String,
    pub note: String,
}

/// [`EventRecorder`] keeping every event
#[derive(Default)]
pub struct RecordingEvents {
    events: Mutex<Vec<RecordedEvent>>,
}

impl RecordingEvents {
    pub fn events(&self) -> Vec<RecordedEvent> {
        self.events.lock().clone()
    }

    pub fn reasons(&self) -> Vec<String> {
        self.events.lock().iter().map(|e| e.reason.clone()).collect()
    }
}

#[async_trait]
impl EventRecorder for RecordingEvents {
    async fn record(&self, target: &ObjectReference, event_type: EventType, reason: &str, note: &str) {
        self.events.lock().push(RecordedEvent {
            target: target.clone(),
            event_type,
            reason: reason.to_string(),
            note: note.to_string(),
        });
    }
}

// =============================================================================
// Cluster
// =============================================================================

type Key = (String, String);

fn key(namespace: &str, name: &str) -> Key {
    (namespace.to_string(), name.to_string())
}

fn not_found(kind: &str, name: &str) -> Error {
    Error::ResourceNotFound {
        kind: kind.to_string(),
        name: name.to_string(),
    }
}

#[derive(Default)]
struct ClusterState {
    pvs: BTreeMap<String, PersistentVolume>,
    nodes: BTreeMap<String, Node>,
    pods: BTreeMap<Key, Pod>,
    daemon_sets: BTreeMap<Key, DaemonSet>,
    pvcs: BTreeMap<Key, PersistentVolumeClaim>,
    storage_classes: BTreeMap<String, StorageClass>,
    capacities: BTreeMap<Key, CSIStorageCapacity>,
    annotation_conflicts: usize,
}

/// [`ClusterApi`] over in-memory object maps.
///
/// Deleting a PersistentVolume only sets its deletion timestamp, as a
/// finalizer-guarded object would behave.
#[derive(Default)]
pub struct FakeCluster {
    state: Mutex<ClusterState>,
}

fn meta_key(meta: &k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta) -> Key {
    key(
        meta.namespace.as_deref().unwrap_or("default"),
        meta.name.as_deref().unwrap_or_default(),
    )
}

impl FakeCluster {
    pub fn add_pv(&self, pv: PersistentVolume) {
        let name = pv.metadata.name.clone().unwrap_or_default();
        self.state.lock().pvs.insert(name, pv);
    }

    pub fn add_node(&self, node: Node) {
        let name = node.metadata.name.clone().unwrap_or_default();
        self.state.lock().nodes.insert(name, node);
    }

    pub fn add_pod(&self, pod: Pod) {
        let k = meta_key(&pod.metadata);
        self.state.lock().pods.insert(k, pod);
    }

    pub fn add_daemon_set(&self, ds: DaemonSet) {
        let k = meta_key(&ds.metadata);
        self.state.lock().daemon_sets.insert(k, ds);
    }

    pub fn add_pvc(&self, pvc: PersistentVolumeClaim) {
        let k = meta_key(&pvc.metadata);
        self.state.lock().pvcs.insert(k, pvc);
    }

    pub fn add_storage_class(&self, class: StorageClass) {
        let name = class.metadata.name.clone().unwrap_or_default();
        self.state.lock().storage_classes.insert(name, class);
    }

    pub fn add_capacity(&self, capacity: CSIStorageCapacity) {
        let k = meta_key(&capacity.metadata);
        self.state.lock().capacities.insert(k, capacity);
    }

    pub fn pv(&self, name: &str) -> Option<PersistentVolume> {
        self.state.lock().pvs.get(name).cloned()
    }

    /// Capacity objects still present, ordered by namespace and name
    pub fn capacities(&self) -> Vec<CSIStorageCapacity> {
        self.state.lock().capacities.values().cloned().collect()
    }

    /// Fail the next `count` annotation patches with a conflict
    pub fn fail_annotation_patches_with_conflict(&self, count: usize) {
        self.state.lock().annotation_conflicts = count;
    }
}

/// Evaluate a `k=v[,k=v]` label selector
fn labels_match(labels: Option<&BTreeMap<String, String>>, selector: &str) -> bool {
    selector
        .split(',')
        .filter(|term| !term.is_empty())
        .all(|term| match term.split_once('=') {
            Some((k, v)) => labels.and_then(|l| l.get(k)).map(String::as_str) == Some(v),
            None => labels.map(|l| l.contains_key(term)).unwrap_or(false),
        })
}

#[async_trait]
impl ClusterApi for FakeCluster {
    async fn get_persistent_volume(&self, name: &str) -> Result<Option<PersistentVolume>> {
        Ok(self.pv(name))
    }

    async fn delete_persistent_volume(&self, name: &str) -> Result<()> {
        let mut state = self.state.lock();
        let pv = state
            .pvs
            .get_mut(name)
            .ok_or_else(|| not_found("PersistentVolume", name))?;
        pv.metadata
            .deletion_timestamp
            .get_or_insert_with(|| Time(chrono::Utc::now()));
        Ok(())
    }

    async fn patch_persistent_volume_finalizers(
        &self,
        name: &str,
        finalizers: &[String],
    ) -> Result<()> {
        let mut state = self.state.lock();
        let pv = state
            .pvs
            .get_mut(name)
            .ok_or_else(|| not_found("PersistentVolume", name))?;
        pv.metadata.finalizers = Some(finalizers.to_vec());
        Ok(())
    }

    async fn patch_persistent_volume_annotations(
        &self,
        name: &str,
        _resource_version: Option<&str>,
        annotations: &BTreeMap<String, Option<String>>,
    ) -> Result<()> {
        let mut state = self.state.lock();
        if state.annotation_conflicts > 0 {
            state.annotation_conflicts -= 1;
            return Err(Error::Conflict {
                kind: "PersistentVolume".to_string(),
                name: name.to_string(),
            });
        }
        let pv = state
            .pvs
            .get_mut(name)
            .ok_or_else(|| not_found("PersistentVolume", name))?;
        let current = pv.metadata.annotations.get_or_insert_with(BTreeMap::new);
        for (k, v) in annotations {
            match v {
                Some(v) => {
                    current.insert(k.clone(), v.clone());
                }
                None => {
                    current.remove(k);
                }
            }
        }
        Ok(())
    }

    async fn get_node(&self, name: &str) -> Result<Option<Node>> {
        Ok(self.state.lock().nodes.get(name).cloned())
    }

    async fn get_pod(&self, namespace: &str, name: &str) -> Result<Option<Pod>> {
        Ok(self.state.lock().pods.get(&key(namespace, name)).cloned())
    }

    async fn get_daemon_set(&self, namespace: &str, name: &str) -> Result<Option<DaemonSet>> {
        Ok(self.state.lock().daemon_sets.get(&key(namespace, name)).cloned())
    }

    async fn get_persistent_volume_claim(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<PersistentVolumeClaim>> {
        Ok(self.state.lock().pvcs.get(&key(namespace, name)).cloned())
    }

    async fn get_storage_class(&self, name: &str) -> Result<Option<StorageClass>> {
        Ok(self.state.lock().storage_classes.get(name).cloned())
    }

    async fn list_storage_capacities(
        &self,
        namespace: &str,
        label_selector: &str,
    ) -> Result<Vec<CSIStorageCapacity>> {
        Ok(self
            .state
            .lock()
            .capacities
            .iter()
            .filter(|((ns, _), c)| {
                ns == namespace && labels_match(c.metadata.labels.as_ref(), label_selector)
            })
            .map(|(_, c)| c.clone())
            .collect())
    }

    async fn delete_storage_capacity(&self, namespace: &str, name: &str) -> Result<()> {
        self.state
            .lock()
            .capacities
            .remove(&key(namespace, name))
            .map(|_| ())
            .ok_or_else(|| not_found("CSIStorageCapacity", name))
    }
}

// =============================================================================
// Builders
// =============================================================================

pub fn daemon_set(namespace: &str, name: &str) -> DaemonSet {
    let mut ds = DaemonSet::default();
    ds.metadata.name = Some(name.to_string());
    ds.metadata.namespace = Some(namespace.to_string());
    ds
}

/// A pod whose controlling owner is `owner_kind/owner_name`
pub fn pod_owned_by(namespace: &str, name: &str, owner_kind: &str, owner_name: &str) -> Pod {
    let mut pod = Pod::default();
    pod.metadata.name = Some(name.to_string());
    pod.metadata.namespace = Some(namespace.to_string());
    pod.metadata.owner_references = Some(vec![OwnerReference {
        api_version: "apps/v1".to_string(),
        kind: owner_kind.to_string(),
        name: owner_name.to_string(),
        uid: format!("{}-uid", owner_name),
        controller: Some(true),
        ..Default::default()
    }]);
    pod
}

/// A bound PersistentVolume provisioned by this driver
pub fn persistent_volume(name: &str, volume_handle: &str) -> PersistentVolume {
    let mut pv = PersistentVolume::default();
    pv.metadata.name = Some(name.to_string());
    pv.metadata.resource_version = Some("1".to_string());
    pv.spec = Some(PersistentVolumeSpec {
        csi: Some(CSIPersistentVolumeSource {
            driver: DRIVER_NAME.to_string(),
            volume_handle: volume_handle.to_string(),
            ..Default::default()
        }),
        ..Default::default()
    });
    pv.status = Some(PersistentVolumeStatus {
        phase: Some("Bound".to_string()),
        ..Default::default()
    });
    pv
}

pub fn node(name: &str, ready: bool) -> Node {
    let mut node = Node::default();
    node.metadata.name = Some(name.to_string());
    node.status = Some(NodeStatus {
        conditions: Some(vec![NodeCondition {
            type_: "Ready".to_string(),
            status: if ready { "True" } else { "False" }.to_string(),
            ..Default::default()
        }]),
        ..Default::default()
    });
    node
}

pub fn claim(namespace: &str, name: &str) -> PersistentVolumeClaim {
    let mut pvc = PersistentVolumeClaim::default();
    pvc.metadata.name = Some(name.to_string());
    pvc.metadata.namespace = Some(namespace.to_string());
    pvc.metadata.uid = Some(format!("{}-uid", name));
    pvc
}

pub fn storage_class(name: &str, provisioner: &str) -> StorageClass {
    let mut class = StorageClass::default();
    class.metadata.name = Some(name.to_string());
    class.provisioner = provisioner.to_string();
    class
}

// =============================================================================
// Storage-plane services
// =============================================================================

/// Controller that refuses every volume and supports nothing else
pub struct StubController;

#[async_trait]
impl CsiController for StubController {
    async fn create_volume(&self, req: CreateVolumeRequest) -> CsiResult<CreateVolumeResponse> {
        Err(Status::invalid_argument(format!("refusing {}", req.name)))
    }

    async fn delete_volume(&self, _req: DeleteVolumeRequest) -> CsiResult<()> {
        Ok(())
    }

    async fn validate_volume_capabilities(
        &self,
        _req: ValidateVolumeCapabilitiesRequest,
    ) -> CsiResult<ValidateVolumeCapabilitiesResponse> {
        Err(Status::unimplemented())
    }

    async fn list_volumes(&self, _req: ListVolumesRequest) -> CsiResult<ListVolumesResponse> {
        Err(Status::unimplemented())
    }

    async fn get_capacity(&self, _req: GetCapacityRequest) -> CsiResult<GetCapacityResponse> {
        Ok(GetCapacityResponse {
            available_capacity: 0,
        })
    }

    async fn controller_modify_volume(&self, _req: ControllerModifyVolumeRequest) -> CsiResult<()> {
        Err(Status::unimplemented())
    }

    fn controller_get_capabilities(&self) -> Vec<ControllerCapability> {
        vec![ControllerCapability::CreateDeleteVolume]
    }
}

/// Node service of a node named `node-a` that accepts every call
pub struct StubNode;

#[async_trait]
impl CsiNode for StubNode {
    async fn node_stage_volume(&self, _req: NodeStageVolumeRequest) -> CsiResult<()> {
        Ok(())
    }

    async fn node_unstage_volume(&self, _req: NodeUnstageVolumeRequest) -> CsiResult<()> {
        Ok(())
    }

    async fn node_publish_volume(&self, _req: NodePublishVolumeRequest) -> CsiResult<()> {
        Ok(())
    }

    async fn node_unpublish_volume(&self, _req: NodeUnpublishVolumeRequest) -> CsiResult<()> {
        Ok(())
    }

    async fn node_get_volume_stats(
        &self,
        _req: NodeGetVolumeStatsRequest,
    ) -> CsiResult<NodeGetVolumeStatsResponse> {
        Ok(NodeGetVolumeStatsResponse {
            usage: vec![
                VolumeUsage {
                    available: 6 << 20,
                    total: 8 << 20,
                    used: 2 << 20,
                    unit: UsageUnit::Bytes,
                },
                VolumeUsage {
                    available: 900,
                    total: 1000,
                    used: 100,
                    unit: UsageUnit::Inodes,
                },
            ],
        })
    }

    async fn node_expand_volume(
        &self,
        _req: NodeExpandVolumeRequest,
    ) -> CsiResult<NodeExpandVolumeResponse> {
        Err(Status::unimplemented())
    }

    fn node_get_capabilities(&self) -> Vec<NodeCapability> {
        vec![NodeCapability::StageUnstageVolume]
    }

    fn node_get_info(&self) -> NodeGetInfoResponse {
        NodeGetInfoResponse {
            node_id: "node-a".into(),
            max_volumes_per_node: 0,
            accessible_topology: Some(Topology {
                segments: HashMap::from([(TOPOLOGY_KEY.to_string(), "node-a".to_string())]),
            }),
        }
    }
}
