//! gRPC adapter for the storage-plane services
//!
//! Implements the generated `csi.v1` Identity, Controller and Node services
//! on [`CsiServer`] by converting wire messages to the domain shapes in
//! [`super::types`] and back. Status codes map one to one onto
//! [`tonic::Code`].

use super::proto as pb;
use super::proto::controller_server::Controller;
use super::proto::identity_server::Identity;
use super::proto::node_server::Node;
use super::server::CsiServer;
use super::types::{self, AccessMode, AccessType, Code, Status};
use super::CsiResult;
use crate::volume::DRIVER_NAME;
use tonic::{Request, Response};
use tracing::{debug, warn};

type GrpcResult<T> = std::result::Result<Response<T>, tonic::Status>;

// =============================================================================
// Status
// =============================================================================

impl From<Code> for tonic::Code {
    fn from(code: Code) -> Self {
        match code {
            Code::Ok => tonic::Code::Ok,
            Code::Cancelled => tonic::Code::Cancelled,
            Code::Unknown => tonic::Code::Unknown,
            Code::InvalidArgument => tonic::Code::InvalidArgument,
            Code::DeadlineExceeded => tonic::Code::DeadlineExceeded,
            Code::NotFound => tonic::Code::NotFound,
            Code::AlreadyExists => tonic::Code::AlreadyExists,
            Code::PermissionDenied => tonic::Code::PermissionDenied,
            Code::ResourceExhausted => tonic::Code::ResourceExhausted,
            Code::FailedPrecondition => tonic::Code::FailedPrecondition,
            Code::Aborted => tonic::Code::Aborted,
            Code::OutOfRange => tonic::Code::OutOfRange,
            Code::Unimplemented => tonic::Code::Unimplemented,
            Code::Internal => tonic::Code::Internal,
            Code::Unavailable => tonic::Code::Unavailable,
            Code::DataLoss => tonic::Code::DataLoss,
            Code::Unauthenticated => tonic::Code::Unauthenticated,
        }
    }
}

impl From<Status> for tonic::Status {
    fn from(status: Status) -> Self {
        tonic::Status::new(status.code.into(), status.message)
    }
}

/// Answer a call, logging failures other than unsupported calls
fn reply<T, U>(call: &str, result: CsiResult<T>, wrap: impl FnOnce(T) -> U) -> GrpcResult<U> {
    match result {
        Ok(value) => Ok(Response::new(wrap(value))),
        Err(status) => {
            if status.code != Code::Unimplemented {
                warn!("{} failed: {}", call, status);
            }
            Err(status.into())
        }
    }
}

// =============================================================================
// Wire to domain
// =============================================================================

fn access_mode(mode: i32) -> AccessMode {
    use pb::volume_capability::access_mode::Mode;

    match Mode::try_from(mode) {
        Ok(Mode::SingleNodeWriter) => AccessMode::SingleNodeWriter,
        Ok(Mode::SingleNodeReaderOnly) => AccessMode::SingleNodeReaderOnly,
        Ok(Mode::MultiNodeReaderOnly) => AccessMode::MultiNodeReaderOnly,
        Ok(Mode::MultiNodeSingleWriter) => AccessMode::MultiNodeSingleWriter,
        Ok(Mode::MultiNodeMultiWriter) => AccessMode::MultiNodeMultiWriter,
        Ok(Mode::SingleNodeSingleWriter) => AccessMode::SingleNodeSingleWriter,
        Ok(Mode::SingleNodeMultiWriter) => AccessMode::SingleNodeMultiWriter,
        Ok(Mode::Unknown) | Err(_) => AccessMode::Unknown,
    }
}

fn capability(cap: pb::VolumeCapability) -> CsiResult<types::VolumeCapability> {
    use pb::volume_capability::AccessType as Wire;

    let access_type = match cap.access_type {
        Some(Wire::Block(_)) => AccessType::Block,
        Some(Wire::Mount(mount)) => AccessType::Mount {
            fs_type: mount.fs_type,
            mount_flags: mount.mount_flags,
        },
        None => return Err(Status::invalid_argument("Volume capability access type missing")),
    };
    Ok(types::VolumeCapability {
        access_type,
        access_mode: cap
            .access_mode
            .map(|m| access_mode(m.mode))
            .unwrap_or(AccessMode::Unknown),
    })
}

fn capabilities(caps: Vec<pb::VolumeCapability>) -> CsiResult<Vec<types::VolumeCapability>> {
    caps.into_iter().map(capability).collect()
}

fn optional_capability(cap: Option<pb::VolumeCapability>) -> CsiResult<Option<types::VolumeCapability>> {
    cap.map(capability).transpose()
}

fn capacity_range(range: pb::CapacityRange) -> types::CapacityRange {
    types::CapacityRange {
        required_bytes: range.required_bytes,
        limit_bytes: range.limit_bytes,
    }
}

fn topology(topology: pb::Topology) -> types::Topology {
    types::Topology {
        segments: topology.segments,
    }
}

// =============================================================================
// Domain to wire
// =============================================================================

fn wire_access_mode(mode: AccessMode) -> i32 {
    use pb::volume_capability::access_mode::Mode;

    let mode = match mode {
        AccessMode::Unknown => Mode::Unknown,
        AccessMode::SingleNodeWriter => Mode::SingleNodeWriter,
        AccessMode::SingleNodeReaderOnly => Mode::SingleNodeReaderOnly,
        AccessMode::MultiNodeReaderOnly => Mode::MultiNodeReaderOnly,
        AccessMode::MultiNodeSingleWriter => Mode::MultiNodeSingleWriter,
        AccessMode::MultiNodeMultiWriter => Mode::MultiNodeMultiWriter,
        AccessMode::SingleNodeSingleWriter => Mode::SingleNodeSingleWriter,
        AccessMode::SingleNodeMultiWriter => Mode::SingleNodeMultiWriter,
    };
    mode as i32
}

fn wire_capability(cap: types::VolumeCapability) -> pb::VolumeCapability {
    use pb::volume_capability::{AccessType as Wire, BlockVolume, MountVolume};

    let access_type = match cap.access_type {
        AccessType::Block => Wire::Block(BlockVolume {}),
        AccessType::Mount { fs_type, mount_flags } => Wire::Mount(MountVolume {
            fs_type,
            mount_flags,
            volume_mount_group: String::new(),
        }),
    };
    pb::VolumeCapability {
        access_mode: Some(pb::volume_capability::AccessMode {
            mode: wire_access_mode(cap.access_mode),
        }),
        access_type: Some(access_type),
    }
}

fn wire_topology(topology: types::Topology) -> pb::Topology {
    pb::Topology {
        segments: topology.segments,
    }
}

fn wire_volume(volume: types::Volume) -> pb::Volume {
    pb::Volume {
        capacity_bytes: volume.capacity_bytes,
        volume_id: volume.volume_id,
        volume_context: volume.volume_context,
        content_source: None,
        accessible_topology: volume.accessible_topology.into_iter().map(wire_topology).collect(),
    }
}

fn wire_controller_capability(cap: types::ControllerCapability) -> pb::ControllerServiceCapability {
    use pb::controller_service_capability::{rpc, Rpc, Type};

    let rpc_type = match cap {
        types::ControllerCapability::CreateDeleteVolume => rpc::Type::CreateDeleteVolume,
        types::ControllerCapability::GetCapacity => rpc::Type::GetCapacity,
        types::ControllerCapability::ListVolumes => rpc::Type::ListVolumes,
        types::ControllerCapability::ModifyVolume => rpc::Type::ModifyVolume,
    };
    pb::ControllerServiceCapability {
        r#type: Some(Type::Rpc(Rpc {
            r#type: rpc_type as i32,
        })),
    }
}

fn wire_node_capability(cap: types::NodeCapability) -> pb::NodeServiceCapability {
    use pb::node_service_capability::{rpc, Rpc, Type};

    let rpc_type = match cap {
        types::NodeCapability::StageUnstageVolume => rpc::Type::StageUnstageVolume,
        types::NodeCapability::ExpandVolume => rpc::Type::ExpandVolume,
        types::NodeCapability::GetVolumeStats => rpc::Type::GetVolumeStats,
    };
    pb::NodeServiceCapability {
        r#type: Some(Type::Rpc(Rpc {
            r#type: rpc_type as i32,
        })),
    }
}

fn wire_usage(usage: types::VolumeUsage) -> pb::VolumeUsage {
    let unit = match usage.unit {
        types::UsageUnit::Bytes => pb::volume_usage::Unit::Bytes,
        types::UsageUnit::Inodes => pb::volume_usage::Unit::Inodes,
    };
    pb::VolumeUsage {
        available: usage.available,
        total: usage.total,
        used: usage.used,
        unit: unit as i32,
    }
}

fn plugin_capability(
    service: pb::plugin_capability::service::Type,
) -> pb::PluginCapability {
    use pb::plugin_capability::{Service, Type};

    pb::PluginCapability {
        r#type: Some(Type::Service(Service {
            r#type: service as i32,
        })),
    }
}

// =============================================================================
// Identity
// =============================================================================

#[tonic::async_trait]
impl Identity for CsiServer {
    async fn get_plugin_info(
        &self,
        _request: Request<pb::GetPluginInfoRequest>,
    ) -> GrpcResult<pb::GetPluginInfoResponse> {
        Ok(Response::new(pb::GetPluginInfoResponse {
            name: DRIVER_NAME.to_string(),
            vendor_version: crate::VERSION.to_string(),
            manifest: Default::default(),
        }))
    }

    async fn get_plugin_capabilities(
        &self,
        _request: Request<pb::GetPluginCapabilitiesRequest>,
    ) -> GrpcResult<pb::GetPluginCapabilitiesResponse> {
        use pb::plugin_capability::service::Type;

        Ok(Response::new(pb::GetPluginCapabilitiesResponse {
            capabilities: vec![
                plugin_capability(Type::ControllerService),
                plugin_capability(Type::VolumeAccessibilityConstraints),
            ],
        }))
    }

    async fn probe(&self, _request: Request<pb::ProbeRequest>) -> GrpcResult<pb::ProbeResponse> {
        Ok(Response::new(pb::ProbeResponse {
            ready: Some(self.readiness.is_ready()),
        }))
    }
}

// =============================================================================
// Controller
// =============================================================================

#[tonic::async_trait]
impl Controller for CsiServer {
    async fn create_volume(
        &self,
        request: Request<pb::CreateVolumeRequest>,
    ) -> GrpcResult<pb::CreateVolumeResponse> {
        let req = request.into_inner();
        debug!("CreateVolume {}", req.name);
        let req = types::CreateVolumeRequest {
            name: req.name,
            capacity_range: req.capacity_range.map(capacity_range),
            volume_capabilities: capabilities(req.volume_capabilities)?,
            parameters: req.parameters,
            mutable_parameters: req.mutable_parameters,
        };
        reply("CreateVolume", self.controller.create_volume(req).await, |resp| {
            pb::CreateVolumeResponse {
                volume: Some(wire_volume(resp.volume)),
            }
        })
    }

    async fn delete_volume(
        &self,
        request: Request<pb::DeleteVolumeRequest>,
    ) -> GrpcResult<pb::DeleteVolumeResponse> {
        let req = request.into_inner();
        debug!("DeleteVolume {}", req.volume_id);
        let req = types::DeleteVolumeRequest {
            volume_id: req.volume_id,
        };
        reply("DeleteVolume", self.controller.delete_volume(req).await, |_| {
            pb::DeleteVolumeResponse {}
        })
    }

    async fn controller_publish_volume(
        &self,
        request: Request<pb::ControllerPublishVolumeRequest>,
    ) -> GrpcResult<pb::ControllerPublishVolumeResponse> {
        let req = request.into_inner();
        let result = self
            .controller
            .controller_publish_volume(&req.volume_id, &req.node_id)
            .await;
        reply("ControllerPublishVolume", result, |_| {
            pb::ControllerPublishVolumeResponse::default()
        })
    }

    async fn controller_unpublish_volume(
        &self,
        request: Request<pb::ControllerUnpublishVolumeRequest>,
    ) -> GrpcResult<pb::ControllerUnpublishVolumeResponse> {
        let req = request.into_inner();
        let result = self
            .controller
            .controller_unpublish_volume(&req.volume_id, &req.node_id)
            .await;
        reply("ControllerUnpublishVolume", result, |_| {
            pb::ControllerUnpublishVolumeResponse {}
        })
    }

    async fn validate_volume_capabilities(
        &self,
        request: Request<pb::ValidateVolumeCapabilitiesRequest>,
    ) -> GrpcResult<pb::ValidateVolumeCapabilitiesResponse> {
        let req = request.into_inner();
        let req = types::ValidateVolumeCapabilitiesRequest {
            volume_id: req.volume_id,
            volume_context: req.volume_context,
            volume_capabilities: capabilities(req.volume_capabilities)?,
            parameters: req.parameters,
        };
        let result = self.controller.validate_volume_capabilities(req).await;
        reply("ValidateVolumeCapabilities", result, |resp| {
            pb::ValidateVolumeCapabilitiesResponse {
                confirmed: resp.confirmed.map(|confirmed| {
                    pb::validate_volume_capabilities_response::Confirmed {
                        volume_context: confirmed.volume_context,
                        volume_capabilities: confirmed
                            .volume_capabilities
                            .into_iter()
                            .map(wire_capability)
                            .collect(),
                        parameters: confirmed.parameters,
                    }
                }),
                message: resp.message,
            }
        })
    }

    async fn list_volumes(
        &self,
        request: Request<pb::ListVolumesRequest>,
    ) -> GrpcResult<pb::ListVolumesResponse> {
        let req = request.into_inner();
        let req = types::ListVolumesRequest {
            max_entries: req.max_entries,
            starting_token: req.starting_token,
        };
        reply("ListVolumes", self.controller.list_volumes(req).await, |resp| {
            pb::ListVolumesResponse {
                entries: resp
                    .entries
                    .into_iter()
                    .map(|volume| pb::list_volumes_response::Entry {
                        volume: Some(wire_volume(volume)),
                    })
                    .collect(),
                next_token: resp.next_token,
            }
        })
    }

    async fn get_capacity(
        &self,
        request: Request<pb::GetCapacityRequest>,
    ) -> GrpcResult<pb::GetCapacityResponse> {
        let req = request.into_inner();
        let req = types::GetCapacityRequest {
            volume_capabilities: capabilities(req.volume_capabilities)?,
            parameters: req.parameters,
            accessible_topology: req.accessible_topology.map(topology),
        };
        reply("GetCapacity", self.controller.get_capacity(req).await, |resp| {
            pb::GetCapacityResponse {
                available_capacity: resp.available_capacity,
            }
        })
    }

    async fn controller_get_capabilities(
        &self,
        _request: Request<pb::ControllerGetCapabilitiesRequest>,
    ) -> GrpcResult<pb::ControllerGetCapabilitiesResponse> {
        Ok(Response::new(pb::ControllerGetCapabilitiesResponse {
            capabilities: self
                .controller
                .controller_get_capabilities()
                .into_iter()
                .map(wire_controller_capability)
                .collect(),
        }))
    }

    async fn controller_modify_volume(
        &self,
        request: Request<pb::ControllerModifyVolumeRequest>,
    ) -> GrpcResult<pb::ControllerModifyVolumeResponse> {
        let req = request.into_inner();
        debug!("ControllerModifyVolume {}", req.volume_id);
        let req = types::ControllerModifyVolumeRequest {
            volume_id: req.volume_id,
            mutable_parameters: req.mutable_parameters,
        };
        reply(
            "ControllerModifyVolume",
            self.controller.controller_modify_volume(req).await,
            |_| pb::ControllerModifyVolumeResponse {},
        )
    }
}

// =============================================================================
// Node
// =============================================================================

#[tonic::async_trait]
impl Node for CsiServer {
    async fn node_stage_volume(
        &self,
        request: Request<pb::NodeStageVolumeRequest>,
    ) -> GrpcResult<pb::NodeStageVolumeResponse> {
        let req = request.into_inner();
        let req = types::NodeStageVolumeRequest {
            volume_id: req.volume_id,
            staging_target_path: req.staging_target_path,
            volume_capability: optional_capability(req.volume_capability)?,
            volume_context: req.volume_context,
        };
        reply("NodeStageVolume", self.node.node_stage_volume(req).await, |_| {
            pb::NodeStageVolumeResponse {}
        })
    }

    async fn node_unstage_volume(
        &self,
        request: Request<pb::NodeUnstageVolumeRequest>,
    ) -> GrpcResult<pb::NodeUnstageVolumeResponse> {
        let req = request.into_inner();
        let req = types::NodeUnstageVolumeRequest {
            volume_id: req.volume_id,
            staging_target_path: req.staging_target_path,
        };
        reply("NodeUnstageVolume", self.node.node_unstage_volume(req).await, |_| {
            pb::NodeUnstageVolumeResponse {}
        })
    }

    async fn node_publish_volume(
        &self,
        request: Request<pb::NodePublishVolumeRequest>,
    ) -> GrpcResult<pb::NodePublishVolumeResponse> {
        let req = request.into_inner();
        debug!("NodePublishVolume {} at {}", req.volume_id, req.target_path);
        let req = types::NodePublishVolumeRequest {
            volume_id: req.volume_id,
            staging_target_path: req.staging_target_path,
            target_path: req.target_path,
            volume_capability: optional_capability(req.volume_capability)?,
            readonly: req.readonly,
            volume_context: req.volume_context,
        };
        reply("NodePublishVolume", self.node.node_publish_volume(req).await, |_| {
            pb::NodePublishVolumeResponse {}
        })
    }

    async fn node_unpublish_volume(
        &self,
        request: Request<pb::NodeUnpublishVolumeRequest>,
    ) -> GrpcResult<pb::NodeUnpublishVolumeResponse> {
        let req = request.into_inner();
        debug!("NodeUnpublishVolume {} at {}", req.volume_id, req.target_path);
        let req = types::NodeUnpublishVolumeRequest {
            volume_id: req.volume_id,
            target_path: req.target_path,
        };
        reply("NodeUnpublishVolume", self.node.node_unpublish_volume(req).await, |_| {
            pb::NodeUnpublishVolumeResponse {}
        })
    }

    async fn node_get_volume_stats(
        &self,
        request: Request<pb::NodeGetVolumeStatsRequest>,
    ) -> GrpcResult<pb::NodeGetVolumeStatsResponse> {
        let req = request.into_inner();
        let req = types::NodeGetVolumeStatsRequest {
            volume_id: req.volume_id,
            volume_path: req.volume_path,
        };
        reply("NodeGetVolumeStats", self.node.node_get_volume_stats(req).await, |resp| {
            pb::NodeGetVolumeStatsResponse {
                usage: resp.usage.into_iter().map(wire_usage).collect(),
            }
        })
    }

    async fn node_expand_volume(
        &self,
        request: Request<pb::NodeExpandVolumeRequest>,
    ) -> GrpcResult<pb::NodeExpandVolumeResponse> {
        let req = request.into_inner();
        let req = types::NodeExpandVolumeRequest {
            volume_id: req.volume_id,
            volume_path: req.volume_path,
            capacity_range: req.capacity_range.map(capacity_range),
            staging_target_path: req.staging_target_path,
            volume_capability: optional_capability(req.volume_capability)?,
        };
        reply("NodeExpandVolume", self.node.node_expand_volume(req).await, |resp| {
            pb::NodeExpandVolumeResponse {
                capacity_bytes: resp.capacity_bytes,
            }
        })
    }

    async fn node_get_capabilities(
        &self,
        _request: Request<pb::NodeGetCapabilitiesRequest>,
    ) -> GrpcResult<pb::NodeGetCapabilitiesResponse> {
        Ok(Response::new(pb::NodeGetCapabilitiesResponse {
            capabilities: self
                .node
                .node_get_capabilities()
                .into_iter()
                .map(wire_node_capability)
                .collect(),
        }))
    }

    async fn node_get_info(
        &self,
        _request: Request<pb::NodeGetInfoRequest>,
    ) -> GrpcResult<pb::NodeGetInfoResponse> {
        let info = self.node.node_get_info();
        Ok(Response::new(pb::NodeGetInfoResponse {
            node_id: info.node_id,
            max_volumes_per_node: info.max_volumes_per_node,
            accessible_topology: info.accessible_topology.map(wire_topology),
        }))
    }
}
