//! Storage-plane wire types
//!
//! Request and response shapes of the container storage protocol calls the
//! driver serves, reduced to the fields the services read. The gRPC adapter
//! in [`super::grpc`] converts them to and from the wire messages.

use std::collections::HashMap;
use std::fmt;

pub use crate::volume::CapacityRange;

// ---------------------------------------------------------------------------
// Status
// ---------------------------------------------------------------------------

/// Status codes of the storage-plane protocol
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Code {
    Ok,
    Cancelled,
    Unknown,
    InvalidArgument,
    DeadlineExceeded,
    NotFound,
    AlreadyExists,
    PermissionDenied,
    ResourceExhausted,
    FailedPrecondition,
    Aborted,
    OutOfRange,
    Unimplemented,
    Internal,
    Unavailable,
    DataLoss,
    Unauthenticated,
}

/// Error returned by a storage-plane call
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Status {
    pub code: Code,
    pub message: String,
}

impl Status {
    pub fn new(code: Code, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    pub fn invalid_argument(message: impl Into<String>) -> Self {
        Self::new(Code::InvalidArgument, message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(Code::NotFound, message)
    }

    pub fn failed_precondition(message: impl Into<String>) -> Self {
        Self::new(Code::FailedPrecondition, message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(Code::Internal, message)
    }

    pub fn unimplemented() -> Self {
        Self::new(Code::Unimplemented, "")
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}: {}", self.code, self.message)
    }
}

impl std::error::Error for Status {}

// ---------------------------------------------------------------------------
// Volumes and capabilities
// ---------------------------------------------------------------------------

/// Topology constraint expressed as key-value segments
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Topology {
    pub segments: HashMap<String, String>,
}

/// A provisioned volume
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Volume {
    pub volume_id: String,
    pub capacity_bytes: i64,
    pub volume_context: HashMap<String, String>,
    pub accessible_topology: Vec<Topology>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessMode {
    Unknown,
    SingleNodeWriter,
    SingleNodeReaderOnly,
    MultiNodeReaderOnly,
    MultiNodeSingleWriter,
    MultiNodeMultiWriter,
    SingleNodeSingleWriter,
    SingleNodeMultiWriter,
}

impl AccessMode {
    /// Modes a node-local volume can honor
    pub const SUPPORTED: [AccessMode; 3] = [
        AccessMode::SingleNodeWriter,
        AccessMode::SingleNodeReaderOnly,
        AccessMode::SingleNodeSingleWriter,
    ];

    pub fn is_supported(&self) -> bool {
        Self::SUPPORTED.contains(self)
    }
}

/// How the workload consumes the volume
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AccessType {
    Block,
    Mount {
        fs_type: String,
        mount_flags: Vec<String>,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VolumeCapability {
    pub access_type: AccessType,
    pub access_mode: AccessMode,
}

impl VolumeCapability {
    pub fn is_block(&self) -> bool {
        matches!(self.access_type, AccessType::Block)
    }
}

// ---------------------------------------------------------------------------
// Controller requests
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default)]
pub struct CreateVolumeRequest {
    pub name: String,
    pub capacity_range: Option<CapacityRange>,
    pub volume_capabilities: Vec<VolumeCapability>,
    pub parameters: HashMap<String, String>,
    pub mutable_parameters: HashMap<String, String>,
}

#[derive(Debug, Clone)]
pub struct CreateVolumeResponse {
    pub volume: Volume,
}

#[derive(Debug, Clone, Default)]
pub struct DeleteVolumeRequest {
    pub volume_id: String,
}

#[derive(Debug, Clone, Default)]
pub struct ValidateVolumeCapabilitiesRequest {
    pub volume_id: String,
    pub volume_context: HashMap<String, String>,
    pub volume_capabilities: Vec<VolumeCapability>,
    pub parameters: HashMap<String, String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Confirmed {
    pub volume_context: HashMap<String, String>,
    pub volume_capabilities: Vec<VolumeCapability>,
    pub parameters: HashMap<String, String>,
}

#[derive(Debug, Clone, Default)]
pub struct ValidateVolumeCapabilitiesResponse {
    pub confirmed: Option<Confirmed>,
    pub message: String,
}

#[derive(Debug, Clone, Default)]
pub struct ListVolumesRequest {
    /// Zero means no limit
    pub max_entries: i32,
    pub starting_token: String,
}

#[derive(Debug, Clone, Default)]
pub struct ListVolumesResponse {
    pub entries: Vec<Volume>,
    /// Empty when the listing is complete
    pub next_token: String,
}

#[derive(Debug, Clone, Default)]
pub struct GetCapacityRequest {
    pub volume_capabilities: Vec<VolumeCapability>,
    pub parameters: HashMap<String, String>,
    pub accessible_topology: Option<Topology>,
}

#[derive(Debug, Clone, Default)]
pub struct GetCapacityResponse {
    pub available_capacity: i64,
}

#[derive(Debug, Clone, Default)]
pub struct ControllerModifyVolumeRequest {
    pub volume_id: String,
    pub mutable_parameters: HashMap<String, String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControllerCapability {
    CreateDeleteVolume,
    GetCapacity,
    ListVolumes,
    ModifyVolume,
}

// ---------------------------------------------------------------------------
// Node requests
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct NodeStageVolumeRequest {
    pub volume_id: String,
    pub staging_target_path: String,
    pub volume_capability: Option<VolumeCapability>,
    pub volume_context: HashMap<String, String>,
}

#[derive(Debug, Clone)]
pub struct NodeUnstageVolumeRequest {
    pub volume_id: String,
    pub staging_target_path: String,
}

#[derive(Debug, Clone)]
pub struct NodePublishVolumeRequest {
    pub volume_id: String,
    pub staging_target_path: String,
    pub target_path: String,
    pub volume_capability: Option<VolumeCapability>,
    pub readonly: bool,
    pub volume_context: HashMap<String, String>,
}

#[derive(Debug, Clone)]
pub struct NodeUnpublishVolumeRequest {
    pub volume_id: String,
    pub target_path: String,
}

#[derive(Debug, Clone)]
pub struct NodeGetVolumeStatsRequest {
    pub volume_id: String,
    pub volume_path: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UsageUnit {
    Bytes,
    Inodes,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VolumeUsage {
    pub available: i64,
    pub total: i64,
    pub used: i64,
    pub unit: UsageUnit,
}

#[derive(Debug, Clone, Default)]
pub struct NodeGetVolumeStatsResponse {
    pub usage: Vec<VolumeUsage>,
}

#[derive(Debug, Clone)]
pub struct NodeExpandVolumeRequest {
    pub volume_id: String,
    pub volume_path: String,
    pub capacity_range: Option<CapacityRange>,
    pub staging_target_path: String,
    pub volume_capability: Option<VolumeCapability>,
}

#[derive(Debug, Clone, Default)]
pub struct NodeExpandVolumeResponse {
    pub capacity_bytes: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeCapability {
    StageUnstageVolume,
    ExpandVolume,
    GetVolumeStats,
}

#[derive(Debug, Clone)]
pub struct NodeGetInfoResponse {
    pub node_id: String,
    pub max_volumes_per_node: i64,
    pub accessible_topology: Option<Topology>,
}
