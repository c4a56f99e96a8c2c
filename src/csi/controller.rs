//! Controller service
//!
//! Provisioning calls run on the node that owns the disks. When the driver
//! runs alongside the co-location webhook, volumes carry no node affinity and
//! every node's controller sees every request, so the owner annotation on the
//! PersistentVolume decides which one acts.

use super::types::*;
use super::CsiResult;
use crate::domain::ports::{ClusterApiRef, EventRecorderRef, MounterRef, ThrottlingUpdaterRef};
use crate::error::Error;
use crate::events::{object_ref, EventSink};
use crate::gc::owner::owner_node;
use crate::metrics::Metrics;
use crate::node::throttle::{ThrottleRequest, ThrottleSpec, THROTTLE_CONTEXT_PREFIX};
use crate::volume::{
    LvmVolumeCore, VolumeId, PVC_NAMESPACE_PARAM, PVC_NAME_PARAM, SELECTED_INITIAL_NODE_PARAM,
};
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};

/// Attempts at patching throttle annotations before giving up on conflicts
const ANNOTATION_PATCH_ATTEMPTS: usize = 3;

/// Controller half of the storage protocol.
///
/// Attach calls are not supported by node-local volumes and default to
/// `Unimplemented`. Snapshot calls are not served at all.
#[async_trait]
pub trait CsiController: Send + Sync {
    async fn create_volume(&self, req: CreateVolumeRequest) -> CsiResult<CreateVolumeResponse>;

    async fn delete_volume(&self, req: DeleteVolumeRequest) -> CsiResult<()>;

    async fn validate_volume_capabilities(
        &self,
        req: ValidateVolumeCapabilitiesRequest,
    ) -> CsiResult<ValidateVolumeCapabilitiesResponse>;

    async fn list_volumes(&self, req: ListVolumesRequest) -> CsiResult<ListVolumesResponse>;

    async fn get_capacity(&self, req: GetCapacityRequest) -> CsiResult<GetCapacityResponse>;

    async fn controller_modify_volume(&self, req: ControllerModifyVolumeRequest) -> CsiResult<()>;

    fn controller_get_capabilities(&self) -> Vec<ControllerCapability>;

    async fn controller_publish_volume(&self, _volume_id: &str, _node_id: &str) -> CsiResult<()> {
        Err(Status::unimplemented())
    }

    async fn controller_unpublish_volume(&self, _volume_id: &str, _node_id: &str) -> CsiResult<()> {
        Err(Status::unimplemented())
    }
}

// =============================================================================
// Controller Service
// =============================================================================

#[derive(Debug, Clone, Default)]
pub struct ControllerConfig {
    /// Volumes are placed by the co-location webhook instead of node affinity
    pub run_alongside_webhook: bool,
}

/// Outcome of checking which node owns a volume
#[derive(Debug, PartialEq, Eq)]
enum Ownership {
    /// This node owns the volume, or no owner is recorded
    Local,
    /// The PersistentVolume no longer exists
    VolumeGone,
    /// The recorded owner node no longer exists
    NodeGone(String),
}

pub struct ControllerService {
    core: Arc<LvmVolumeCore>,
    cluster: ClusterApiRef,
    recorder: EventRecorderRef,
    mounter: MounterRef,
    throttling: Option<ThrottlingUpdaterRef>,
    metrics: Arc<Metrics>,
    config: ControllerConfig,
}

impl ControllerService {
    pub fn new(
        core: Arc<LvmVolumeCore>,
        cluster: ClusterApiRef,
        recorder: EventRecorderRef,
        mounter: MounterRef,
        metrics: Arc<Metrics>,
        config: ControllerConfig,
    ) -> Self {
        Self {
            core,
            cluster,
            recorder,
            mounter,
            throttling: None,
            metrics,
            config,
        }
    }

    /// Apply throttle changes to pods already using a modified volume
    pub fn with_throttling_updater(mut self, updater: ThrottlingUpdaterRef) -> Self {
        self.throttling = Some(updater);
        self
    }

    fn node_id(&self) -> &str {
        self.core.node_id()
    }

    /// Resolve who owns the PersistentVolume `pv_name`
    async fn ownership(&self, pv_name: &str, missing_node_ok: bool) -> CsiResult<Ownership> {
        let pv = match self.cluster.get_persistent_volume(pv_name).await {
            Ok(Some(pv)) => pv,
            Ok(None) => return Ok(Ownership::VolumeGone),
            Err(e) => return Err(Status::internal(e.to_string())),
        };
        let owner = match owner_node(&pv) {
            Some(owner) if !owner.is_empty() => owner.to_string(),
            _ => return Ok(Ownership::Local),
        };

        match self.cluster.get_node(&owner).await {
            Ok(Some(_)) => {}
            Ok(None) if missing_node_ok => return Ok(Ownership::NodeGone(owner)),
            Ok(None) => {
                return Err(Status::failed_precondition(format!(
                    "Cannot modify volume on deleted node {}",
                    owner
                )))
            }
            Err(e) => warn!("Failed to get node {}: {}", owner, e),
        }

        if !owner.eq_ignore_ascii_case(self.node_id()) {
            return Err(Status::failed_precondition(format!(
                "Volume is on node {}, current controller is on node {}",
                owner,
                self.node_id()
            )));
        }
        Ok(Ownership::Local)
    }

    /// Merge throttle annotations into the PersistentVolume, retrying on conflict
    async fn patch_throttle_annotations(
        &self,
        pv_name: &str,
        request: &ThrottleRequest,
    ) -> crate::error::Result<()> {
        let annotations: BTreeMap<String, Option<String>> = match request {
            ThrottleRequest::Set(spec) => spec
                .to_context()
                .into_iter()
                .map(|(k, v)| (k, Some(v)))
                .collect(),
            ThrottleRequest::Clear => ["rbps", "wbps", "riops", "wiops"]
                .iter()
                .map(|axis| (format!("{}{}", THROTTLE_CONTEXT_PREFIX, axis), None))
                .collect(),
        };

        let mut last_error = None;
        for attempt in 1..=ANNOTATION_PATCH_ATTEMPTS {
            let pv = self
                .cluster
                .get_persistent_volume(pv_name)
                .await?
                .ok_or_else(|| Error::ResourceNotFound {
                    kind: "PersistentVolume".into(),
                    name: pv_name.to_string(),
                })?;
            let resource_version = pv.metadata.resource_version.as_deref();
            match self
                .cluster
                .patch_persistent_volume_annotations(pv_name, resource_version, &annotations)
                .await
            {
                Ok(()) => return Ok(()),
                Err(e @ Error::Conflict { .. }) => {
                    debug!(
                        "Conflict patching throttle annotations on {} (attempt {}/{})",
                        pv_name, attempt, ANNOTATION_PATCH_ATTEMPTS
                    );
                    last_error = Some(e);
                }
                Err(e) => return Err(e),
            }
        }
        Err(last_error.unwrap_or_else(|| {
            Error::Internal(format!("failed to patch annotations on {}", pv_name))
        }))
    }
}

fn validate_capabilities(capabilities: &[VolumeCapability]) -> CsiResult<()> {
    if capabilities.is_empty() {
        return Err(Status::invalid_argument("Volume capabilities missing in request"));
    }
    if let Some(cap) = capabilities.iter().find(|c| !c.access_mode.is_supported()) {
        return Err(Status::invalid_argument(format!(
            "Unsupported access mode {:?}",
            cap.access_mode
        )));
    }
    Ok(())
}

#[async_trait]
impl CsiController for ControllerService {
    #[instrument(skip(self, req), fields(volume = %req.name))]
    async fn create_volume(&self, req: CreateVolumeRequest) -> CsiResult<CreateVolumeResponse> {
        if req.name.is_empty() {
            return Err(Status::invalid_argument("Volume name missing in request"));
        }
        validate_capabilities(&req.volume_capabilities)?;

        let mut claim_found = false;
        let mut target = None;
        if let (Some(name), Some(namespace)) = (
            req.parameters.get(PVC_NAME_PARAM),
            req.parameters.get(PVC_NAMESPACE_PARAM),
        ) {
            match self.cluster.get_persistent_volume_claim(namespace, name).await {
                Ok(Some(pvc)) => {
                    claim_found = true;
                    target = Some(object_ref(&pvc));
                }
                Ok(None) => {
                    return Err(Status::internal(format!(
                        "PersistentVolumeClaim {}/{} not found",
                        namespace, name
                    )))
                }
                Err(e) => return Err(Status::internal(e.to_string())),
            }
        }
        let events = EventSink::new(self.recorder.clone(), target);

        let result = self
            .core
            .create(&req.name, req.capacity_range.as_ref(), &req.parameters, &events)
            .await;
        self.metrics.record_provision(result.is_ok());
        let mut volume = result.map_err(|e| {
            warn!("Failed to create volume {}: {}", req.name, e);
            Status::from(e)
        })?;

        let mut throttle_params = req.parameters.clone();
        throttle_params.extend(req.mutable_parameters.clone());
        match ThrottleSpec::from_params(&throttle_params) {
            Ok(Some(ThrottleRequest::Set(spec))) => {
                volume.volume_context.extend(spec.to_context());
            }
            Ok(_) => {}
            Err(e) => warn!("Ignoring invalid throttling parameters for {}: {}", req.name, e),
        }

        if self.config.run_alongside_webhook && claim_found {
            volume
                .volume_context
                .insert(SELECTED_INITIAL_NODE_PARAM.to_string(), self.node_id().to_string());
            volume.accessible_topology.clear();
        }

        info!("Created volume {} ({} bytes)", volume.volume_id, volume.capacity_bytes);
        Ok(CreateVolumeResponse { volume })
    }

    #[instrument(skip(self, req), fields(volume_id = %req.volume_id))]
    async fn delete_volume(&self, req: DeleteVolumeRequest) -> CsiResult<()> {
        if req.volume_id.is_empty() {
            return Err(Status::invalid_argument("Volume ID missing in request"));
        }
        let id = match req.volume_id.parse::<VolumeId>() {
            Ok(id) => id,
            Err(e) => {
                warn!("Treating delete of invalid volume {} as done: {}", req.volume_id, e);
                return Ok(());
            }
        };

        if self.config.run_alongside_webhook {
            match self.ownership(&id.logical_volume, true).await? {
                Ownership::Local => {}
                Ownership::VolumeGone => {
                    debug!("PersistentVolume {} already deleted", id.logical_volume);
                    return Ok(());
                }
                Ownership::NodeGone(node) => {
                    debug!("Owner node {} of {} no longer exists", node, id);
                    return Ok(());
                }
            }
        }

        let device_path = self
            .core
            .get_node_device_path(&req.volume_id)
            .await
            .map_err(|e| Status::internal(format!("failed to get node device path: {}", e)))?;
        if !device_path.is_empty() {
            if let Err(e) = self.mounter.cleanup_staging_dir(&device_path).await {
                warn!("Failed to unmount {} before deletion: {}", device_path, e);
            }
        }

        self.core.delete(&req.volume_id).await.map_err(|e| {
            warn!("Failed to delete volume {}: {}", req.volume_id, e);
            Status::internal(e.to_string())
        })
    }

    async fn validate_volume_capabilities(
        &self,
        req: ValidateVolumeCapabilitiesRequest,
    ) -> CsiResult<ValidateVolumeCapabilitiesResponse> {
        if req.volume_id.is_empty() {
            return Err(Status::invalid_argument("Volume ID missing in request"));
        }
        validate_capabilities(&req.volume_capabilities)?;

        match self.core.validate_capabilities(&req.volume_id).await {
            Ok(()) => {}
            Err(e @ Error::VolumeNotFound(_)) => return Err(Status::not_found(e.to_string())),
            Err(e) => return Err(e.into()),
        }

        Ok(ValidateVolumeCapabilitiesResponse {
            confirmed: Some(Confirmed {
                volume_context: req.volume_context,
                volume_capabilities: req.volume_capabilities,
                parameters: req.parameters,
            }),
            message: String::new(),
        })
    }

    async fn list_volumes(&self, req: ListVolumesRequest) -> CsiResult<ListVolumesResponse> {
        let start = if req.starting_token.is_empty() {
            0
        } else {
            req.starting_token.parse::<usize>().map_err(|e| {
                Status::new(
                    Code::Aborted,
                    format!(
                        "ListVolumes starting token({}) parsing with error: {}",
                        req.starting_token, e
                    ),
                )
            })?
        };
        if req.max_entries < 0 {
            return Err(Status::invalid_argument("max_entries cannot be negative"));
        }

        let mut volumes = self.core.list().await.map_err(|e| Status::internal(e.to_string()))?;
        volumes.sort_by(|a, b| a.volume_id.cmp(&b.volume_id));
        if start > volumes.len() {
            return Err(Status::new(
                Code::Aborted,
                format!(
                    "ListVolumes starting token({}) exceeds {} volumes",
                    start,
                    volumes.len()
                ),
            ));
        }

        let end = match req.max_entries {
            0 => volumes.len(),
            max => volumes.len().min(start + max as usize),
        };
        let next_token = if end < volumes.len() {
            end.to_string()
        } else {
            String::new()
        };
        let entries = volumes.drain(start..end).collect();
        Ok(ListVolumesResponse {
            entries,
            next_token,
        })
    }

    async fn get_capacity(&self, req: GetCapacityRequest) -> CsiResult<GetCapacityResponse> {
        let available = self.core.get_capacity(&req.parameters).await.map_err(|e| {
            warn!("Failed to get capacity: {}", e);
            Status::internal(e.to_string())
        })?;
        Ok(GetCapacityResponse {
            available_capacity: i64::try_from(available).unwrap_or(i64::MAX),
        })
    }

    #[instrument(skip(self, req), fields(volume_id = %req.volume_id))]
    async fn controller_modify_volume(&self, req: ControllerModifyVolumeRequest) -> CsiResult<()> {
        if req.volume_id.is_empty() {
            return Err(Status::invalid_argument("Volume ID missing in request"));
        }
        if req.mutable_parameters.is_empty() {
            return Ok(());
        }
        let request = match ThrottleSpec::from_params(&req.mutable_parameters) {
            Ok(Some(request)) => request,
            Ok(None) => return Ok(()),
            Err(e) => {
                return Err(Status::invalid_argument(format!(
                    "Invalid mutable parameters: {}",
                    e
                )))
            }
        };

        let pv_name = self
            .core
            .get_volume_name(&req.volume_id)
            .map_err(|e| Status::internal(e.to_string()))?;

        if self.config.run_alongside_webhook {
            match self.ownership(&pv_name, false).await? {
                Ownership::Local => {}
                Ownership::VolumeGone | Ownership::NodeGone(_) => {
                    debug!("PersistentVolume {} not found, nothing to modify", pv_name);
                    return Ok(());
                }
            }
        }

        self.patch_throttle_annotations(&pv_name, &request)
            .await
            .map_err(|e| {
                Status::internal(format!("failed to update throttle annotations: {}", e))
            })?;
        info!("Updated throttling of {}", req.volume_id);

        let Some(updater) = &self.throttling else {
            return Ok(());
        };
        match self.core.get_node_device_path(&req.volume_id).await {
            Ok(path) if !path.is_empty() => {
                if let Err(e) = updater
                    .update_running_pods_throttling(&req.volume_id, &request)
                    .await
                {
                    warn!("Failed to update throttling of running pods for {}: {}", req.volume_id, e);
                }
            }
            Ok(_) => debug!("Volume {} is not on this node", req.volume_id),
            Err(e) => warn!("Failed to resolve device of {}: {}", req.volume_id, e),
        }
        Ok(())
    }

    fn controller_get_capabilities(&self) -> Vec<ControllerCapability> {
        vec![
            ControllerCapability::CreateDeleteVolume,
            ControllerCapability::GetCapacity,
            ControllerCapability::ListVolumes,
            ControllerCapability::ModifyVolume,
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::ports::{LvmManager, ThrottlingUpdater};
    use crate::probe::BlockDevice;
    use crate::testing::{
        claim, node, persistent_volume, FakeCluster, FakeLvm, FakeMounter, FakeProbe,
        RecordingEvents,
    };
    use crate::volume::{SELECTED_NODE_ANNOTATION, TOPOLOGY_KEY};
    use parking_lot::Mutex;
    use std::collections::HashMap;

    const GIB: i64 = 1 << 30;

    #[derive(Default)]
    struct RecordingThrottler {
        requests: Mutex<Vec<(String, ThrottleRequest)>>,
    }

    #[async_trait]
    impl ThrottlingUpdater for RecordingThrottler {
        async fn update_running_pods_throttling(
            &self,
            volume_id: &str,
            request: &ThrottleRequest,
        ) -> crate::error::Result<()> {
            self.requests.lock().push((volume_id.to_string(), *request));
            Ok(())
        }
    }

    struct Harness {
        lvm: Arc<FakeLvm>,
        cluster: Arc<FakeCluster>,
        mounter: Arc<FakeMounter>,
        recorder: Arc<RecordingEvents>,
        service: ControllerService,
    }

    fn harness(run_alongside_webhook: bool) -> Harness {
        let lvm = Arc::new(FakeLvm::default());
        let probe = FakeProbe::new(vec![disk("sdb"), disk("sdc")]);
        let core = Arc::new(LvmVolumeCore::new("node-1", lvm.clone(), Arc::new(probe)));
        let cluster = Arc::new(FakeCluster::default());
        let mounter = Arc::new(FakeMounter::default());
        let recorder = Arc::new(RecordingEvents::default());
        let service = ControllerService::new(
            core,
            cluster.clone(),
            recorder.clone(),
            mounter.clone(),
            Arc::new(Metrics::new().unwrap()),
            ControllerConfig {
                run_alongside_webhook,
            },
        );
        Harness {
            lvm,
            cluster,
            mounter,
            recorder,
            service,
        }
    }

    fn disk(name: &str) -> BlockDevice {
        BlockDevice {
            name: name.to_string(),
            path: format!("/dev/{}", name),
            size: 20 * GIB as u64,
            device_type: "disk".to_string(),
            ..Default::default()
        }
    }

    fn mount_capability() -> VolumeCapability {
        VolumeCapability {
            access_type: AccessType::Mount {
                fs_type: "ext4".into(),
                mount_flags: vec![],
            },
            access_mode: AccessMode::SingleNodeWriter,
        }
    }

    fn create_request(name: &str) -> CreateVolumeRequest {
        CreateVolumeRequest {
            name: name.to_string(),
            capacity_range: Some(CapacityRange {
                required_bytes: GIB,
                limit_bytes: 0,
            }),
            volume_capabilities: vec![mount_capability()],
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_create_volume() {
        let h = harness(false);
        let resp = h.service.create_volume(create_request("pvc-x")).await.unwrap();
        assert_eq!(resp.volume.volume_id, "containerstorage#pvc-x");
        assert_eq!(resp.volume.capacity_bytes, GIB);
        assert_eq!(
            resp.volume.accessible_topology[0].segments.get(TOPOLOGY_KEY).unwrap(),
            "node-1"
        );
        assert!(h.lvm.get_logical_volume("containerstorage", "pvc-x").await.is_ok());
    }

    #[tokio::test]
    async fn test_create_volume_validation() {
        let h = harness(false);

        let mut req = create_request("");
        assert_eq!(h.service.create_volume(req.clone()).await.unwrap_err().code, Code::InvalidArgument);

        req = create_request("pvc-1");
        req.volume_capabilities.clear();
        assert_eq!(h.service.create_volume(req).await.unwrap_err().code, Code::InvalidArgument);

        req = create_request("pvc-1");
        req.volume_capabilities[0].access_mode = AccessMode::MultiNodeMultiWriter;
        assert_eq!(h.service.create_volume(req).await.unwrap_err().code, Code::InvalidArgument);

        req = create_request("pvc-1");
        req.capacity_range = Some(CapacityRange {
            required_bytes: 2 * GIB,
            limit_bytes: GIB,
        });
        assert_eq!(h.service.create_volume(req).await.unwrap_err().code, Code::InvalidArgument);

        req = create_request("pvc-1");
        req.capacity_range = Some(CapacityRange {
            required_bytes: -1,
            limit_bytes: 0,
        });
        assert_eq!(h.service.create_volume(req).await.unwrap_err().code, Code::InvalidArgument);
    }

    #[tokio::test]
    async fn test_create_volume_size_mismatch_is_already_exists() {
        let h = harness(false);
        h.service.create_volume(create_request("pvc-1")).await.unwrap();

        let mut req = create_request("pvc-1");
        req.capacity_range = Some(CapacityRange {
            required_bytes: 2 * GIB,
            limit_bytes: 0,
        });
        assert_eq!(h.service.create_volume(req).await.unwrap_err().code, Code::AlreadyExists);
    }

    #[tokio::test]
    async fn test_create_volume_records_throttling_and_claim() {
        let h = harness(true);
        h.cluster.add_pvc(claim("default", "data"));

        let mut req = create_request("pvc-1");
        req.parameters = HashMap::from([
            (PVC_NAME_PARAM.to_string(), "data".to_string()),
            (PVC_NAMESPACE_PARAM.to_string(), "default".to_string()),
            ("rbps".to_string(), "10Mi".to_string()),
            ("wiops".to_string(), "bogus".to_string()),
        ]);
        req.mutable_parameters = HashMap::from([("wiops".to_string(), "100".to_string())]);

        let volume = h.service.create_volume(req).await.unwrap().volume;
        let context = &volume.volume_context;
        assert_eq!(context.get("csi.storage.k8s.io/throttle.rbps").unwrap(), "10485760");
        assert_eq!(context.get("csi.storage.k8s.io/throttle.wiops").unwrap(), "100");
        assert_eq!(context.get(SELECTED_INITIAL_NODE_PARAM).unwrap(), "node-1");
        assert!(volume.accessible_topology.is_empty());
        assert!(!h.recorder.reasons().is_empty());
    }

    #[tokio::test]
    async fn test_create_volume_missing_claim_is_internal() {
        let h = harness(false);
        let mut req = create_request("pvc-1");
        req.parameters = HashMap::from([
            (PVC_NAME_PARAM.to_string(), "data".to_string()),
            (PVC_NAMESPACE_PARAM.to_string(), "default".to_string()),
        ]);
        assert_eq!(h.service.create_volume(req).await.unwrap_err().code, Code::Internal);
    }

    #[tokio::test]
    async fn test_delete_volume() {
        let h = harness(false);
        h.service.create_volume(create_request("pvc-1")).await.unwrap();

        let del = |id: &str| DeleteVolumeRequest {
            volume_id: id.to_string(),
        };
        h.service.delete_volume(del("containerstorage#pvc-1")).await.unwrap();
        assert!(h.lvm.get_logical_volume("containerstorage", "pvc-1").await.is_err());
        assert_eq!(h.mounter.cleaned_devices(), vec!["/dev/containerstorage/pvc-1"]);

        h.service.delete_volume(del("containerstorage#pvc-1")).await.unwrap();
        h.service.delete_volume(del("garbage")).await.unwrap();
        assert_eq!(h.service.delete_volume(del("")).await.unwrap_err().code, Code::InvalidArgument);
    }

    #[tokio::test]
    async fn test_delete_volume_alongside_webhook_checks_owner() {
        let h = harness(true);
        h.service.create_volume(create_request("pvc-1")).await.unwrap();
        let req = DeleteVolumeRequest {
            volume_id: "containerstorage#pvc-1".into(),
        };

        // No PersistentVolume: nothing to do
        h.service.delete_volume(req.clone()).await.unwrap();
        assert!(h.lvm.get_logical_volume("containerstorage", "pvc-1").await.is_ok());

        // Owner node gone: nothing to do
        let mut pv = persistent_volume("pvc-1", "containerstorage#pvc-1");
        pv.metadata.annotations =
            Some(BTreeMap::from([(SELECTED_NODE_ANNOTATION.to_string(), "node-2".to_string())]));
        h.cluster.add_pv(pv);
        h.service.delete_volume(req.clone()).await.unwrap();
        assert!(h.lvm.get_logical_volume("containerstorage", "pvc-1").await.is_ok());

        // Owner node elsewhere
        h.cluster.add_node(node("node-2", true));
        let status = h.service.delete_volume(req.clone()).await.unwrap_err();
        assert_eq!(status.code, Code::FailedPrecondition);

        // Owner is this node, compared case-insensitively
        let mut pv = persistent_volume("pvc-1", "containerstorage#pvc-1");
        pv.metadata.annotations =
            Some(BTreeMap::from([(SELECTED_NODE_ANNOTATION.to_string(), "NODE-1".to_string())]));
        h.cluster.add_pv(pv);
        h.cluster.add_node(node("NODE-1", true));
        h.service.delete_volume(req).await.unwrap();
        assert!(h.lvm.get_logical_volume("containerstorage", "pvc-1").await.is_err());
    }

    #[tokio::test]
    async fn test_validate_volume_capabilities() {
        let h = harness(false);
        h.service.create_volume(create_request("pvc-1")).await.unwrap();

        let req = |id: &str| ValidateVolumeCapabilitiesRequest {
            volume_id: id.to_string(),
            volume_capabilities: vec![mount_capability()],
            ..Default::default()
        };
        let resp = h
            .service
            .validate_volume_capabilities(req("containerstorage#pvc-1"))
            .await
            .unwrap();
        assert!(resp.confirmed.is_some());

        let status = h
            .service
            .validate_volume_capabilities(req("containerstorage#missing"))
            .await
            .unwrap_err();
        assert_eq!(status.code, Code::NotFound);

        let status = h.service.validate_volume_capabilities(req("")).await.unwrap_err();
        assert_eq!(status.code, Code::InvalidArgument);
    }

    #[tokio::test]
    async fn test_list_volumes_pagination() {
        let h = harness(false);
        for name in ["pvc-1", "pvc-2", "pvc-3"] {
            h.service.create_volume(create_request(name)).await.unwrap();
        }

        let page = h
            .service
            .list_volumes(ListVolumesRequest {
                max_entries: 2,
                starting_token: String::new(),
            })
            .await
            .unwrap();
        assert_eq!(page.entries.len(), 2);
        assert_eq!(page.next_token, "2");

        let page = h
            .service
            .list_volumes(ListVolumesRequest {
                max_entries: 2,
                starting_token: page.next_token,
            })
            .await
            .unwrap();
        assert_eq!(page.entries.len(), 1);
        assert_eq!(page.entries[0].volume_id, "containerstorage#pvc-3");
        assert!(page.next_token.is_empty());

        for token in ["abc", "-1", "9"] {
            let status = h
                .service
                .list_volumes(ListVolumesRequest {
                    max_entries: 0,
                    starting_token: token.to_string(),
                })
                .await
                .unwrap_err();
            assert_eq!(status.code, Code::Aborted, "{}", token);
        }
    }

    #[tokio::test]
    async fn test_get_capacity() {
        let h = harness(false);
        let resp = h.service.get_capacity(GetCapacityRequest::default()).await.unwrap();
        // Two 20 GiB disks, less metadata overhead rounded to extents
        assert_eq!(resp.available_capacity, 2 * (20 * GIB - 4 * (1 << 20)));
    }

    #[tokio::test]
    async fn test_modify_volume_patches_annotations_and_running_pods() {
        let h = harness(false);
        let throttler = Arc::new(RecordingThrottler::default());
        let service = ControllerService::new(
            Arc::new(LvmVolumeCore::new(
                "node-1",
                h.lvm.clone(),
                Arc::new(FakeProbe::new(vec![disk("sdb")])),
            )),
            h.cluster.clone(),
            h.recorder.clone(),
            h.mounter.clone(),
            Arc::new(Metrics::new().unwrap()),
            ControllerConfig::default(),
        )
        .with_throttling_updater(throttler.clone());
        service.create_volume(create_request("pvc-1")).await.unwrap();
        h.cluster.add_pv(persistent_volume("pvc-1", "containerstorage#pvc-1"));
        h.cluster.fail_annotation_patches_with_conflict(2);

        service
            .controller_modify_volume(ControllerModifyVolumeRequest {
                volume_id: "containerstorage#pvc-1".into(),
                mutable_parameters: HashMap::from([("rbps".to_string(), "1k".to_string())]),
            })
            .await
            .unwrap();

        let pv = h.cluster.pv("pvc-1").unwrap();
        let annotations = pv.metadata.annotations.unwrap();
        assert_eq!(annotations.get("csi.storage.k8s.io/throttle.rbps").unwrap(), "1000");
        let requests = throttler.requests.lock().clone();
        assert_eq!(requests.len(), 1);
        assert_eq!(
            requests[0].1,
            ThrottleRequest::Set(ThrottleSpec {
                rbps: Some(1000),
                ..Default::default()
            })
        );

        service
            .controller_modify_volume(ControllerModifyVolumeRequest {
                volume_id: "containerstorage#pvc-1".into(),
                mutable_parameters: HashMap::from([(
                    "clear-throttling".to_string(),
                    "true".to_string(),
                )]),
            })
            .await
            .unwrap();
        let annotations = h.cluster.pv("pvc-1").unwrap().metadata.annotations.unwrap_or_default();
        assert!(!annotations.contains_key("csi.storage.k8s.io/throttle.rbps"));
        assert_eq!(throttler.requests.lock()[1].1, ThrottleRequest::Clear);
    }

    #[tokio::test]
    async fn test_modify_volume_errors() {
        let h = harness(true);
        let modify = |id: &str, params: &[(&str, &str)]| ControllerModifyVolumeRequest {
            volume_id: id.to_string(),
            mutable_parameters: params
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        };

        let status = h.service.controller_modify_volume(modify("", &[])).await.unwrap_err();
        assert_eq!(status.code, Code::InvalidArgument);
        h.service
            .controller_modify_volume(modify("containerstorage#pvc-1", &[]))
            .await
            .unwrap();
        let status = h
            .service
            .controller_modify_volume(modify("containerstorage#pvc-1", &[("rbps", "-5")]))
            .await
            .unwrap_err();
        assert_eq!(status.code, Code::InvalidArgument);

        // Missing PersistentVolume is not an error
        h.service
            .controller_modify_volume(modify("containerstorage#pvc-1", &[("rbps", "5")]))
            .await
            .unwrap();

        // Owner node deleted
        let mut pv = persistent_volume("pvc-1", "containerstorage#pvc-1");
        pv.metadata.annotations =
            Some(BTreeMap::from([(SELECTED_NODE_ANNOTATION.to_string(), "node-2".to_string())]));
        h.cluster.add_pv(pv);
        let status = h
            .service
            .controller_modify_volume(modify("containerstorage#pvc-1", &[("rbps", "5")]))
            .await
            .unwrap_err();
        assert_eq!(status.code, Code::FailedPrecondition);

        // Owner node elsewhere
        h.cluster.add_node(node("node-2", true));
        let status = h
            .service
            .controller_modify_volume(modify("containerstorage#pvc-1", &[("rbps", "5")]))
            .await
            .unwrap_err();
        assert_eq!(status.code, Code::FailedPrecondition);
        assert!(status.message.contains("node-2"));
    }

    #[tokio::test]
    async fn test_unsupported_calls() {
        let h = harness(false);
        assert_eq!(
            h.service.controller_publish_volume("vg#lv", "node-1").await.unwrap_err().code,
            Code::Unimplemented
        );
        assert_eq!(
            h.service.controller_unpublish_volume("vg#lv", "node-1").await.unwrap_err().code,
            Code::Unimplemented
        );
        assert_eq!(h.service.controller_get_capabilities().len(), 4);
    }
}
