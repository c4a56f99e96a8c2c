//! Error types for the local LVM driver
//!
//! Every component maps its failures into [`Error`] before crossing a module
//! boundary. [`Error::kind`] collapses the variants into the small taxonomy the
//! storage plane and the reconcilers act on.

use std::time::Duration;
use thiserror::Error;

use crate::lvm::LvmError;

/// Unified error type for the driver
#[derive(Error, Debug)]
pub enum Error {
    // =========================================================================
    // Internal Errors
    // =========================================================================
    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    // =========================================================================
    // Kubernetes Errors
    // =========================================================================
    #[error("Kubernetes API error: {0}")]
    Kube(#[from] kube::Error),

    #[error("Resource not found: {kind}/{name}")]
    ResourceNotFound { kind: String, name: String },

    #[error("Resource modified concurrently: {kind}/{name}")]
    Conflict { kind: String, name: String },

    // =========================================================================
    // Volume Errors
    // =========================================================================
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Volume not found: {0}")]
    VolumeNotFound(String),

    #[error("Volume size mismatch for {volume_id}: expected {expected} bytes, actual {actual} bytes")]
    VolumeSizeMismatch {
        volume_id: String,
        expected: u64,
        actual: u64,
    },

    #[error("Resource exhausted: {0}")]
    ResourceExhausted(String),

    #[error("Failed precondition: {0}")]
    FailedPrecondition(String),

    // =========================================================================
    // LVM Errors
    // =========================================================================
    #[error("LVM error: {0}")]
    Lvm(#[from] LvmError),

    // =========================================================================
    // Device Probe Errors
    // =========================================================================
    #[error("No devices found")]
    NoDevicesFound,

    #[error("No devices matching filter found")]
    NoDevicesMatchingFilter,

    #[error("Device probe failed: {0}")]
    DeviceProbe(String),

    // =========================================================================
    // Node Errors
    // =========================================================================
    #[error("Mount failed at {path}: {reason}")]
    Mount { path: String, reason: String },

    #[error("Cgroup error: {0}")]
    Cgroup(String),

    #[error("Failed to apply IO throttling: {}", .0.join("; "))]
    Throttle(Vec<String>),

    // =========================================================================
    // Admission Errors
    // =========================================================================
    #[error("Admission error: {0}")]
    Admission(String),

    // =========================================================================
    // Parse Errors
    // =========================================================================
    #[error("Quantity parse error: {0}")]
    QuantityParse(String),

    #[error("JSON parse error: {0}")]
    JsonParse(#[from] serde_json::Error),

    // =========================================================================
    // IO Errors
    // =========================================================================
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Classification shared by the storage plane front-end and the reconcilers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Caller's fault, never retried
    InvalidArgument,
    /// Object absent, usually collapsed to success
    NotFound,
    /// Object present on a create path
    AlreadyExists,
    /// No local capacity, the caller may retry elsewhere
    ResourceExhausted,
    /// Existing volume differs from the request
    VolumeSizeMismatch,
    /// Volume lives on a different node
    FailedPrecondition,
    /// Transient or unclassified
    Other,
}

/// Action to take on error during reconciliation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorAction {
    /// Requeue with exponential backoff
    RequeueWithBackoff,
    /// Requeue after specific duration
    RequeueAfter(Duration),
    /// Don't requeue, wait for changes
    NoRequeue,
}

impl Error {
    /// Map this error onto the driver's error taxonomy
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::InvalidArgument(_) | Error::QuantityParse(_) => ErrorKind::InvalidArgument,

            Error::VolumeNotFound(_) | Error::ResourceNotFound { .. } => ErrorKind::NotFound,
            Error::Kube(kube::Error::Api(resp)) if resp.code == 404 => ErrorKind::NotFound,

            Error::VolumeSizeMismatch { .. } => ErrorKind::VolumeSizeMismatch,
            Error::FailedPrecondition(_) => ErrorKind::FailedPrecondition,

            Error::ResourceExhausted(_)
            | Error::NoDevicesFound
            | Error::NoDevicesMatchingFilter => ErrorKind::ResourceExhausted,

            Error::Lvm(lvm) => match lvm {
                LvmError::NotFound(_) => ErrorKind::NotFound,
                LvmError::AlreadyExists(_) => ErrorKind::AlreadyExists,
                LvmError::ResourceExhausted(_) | LvmError::PvAlreadyInVolumeGroup(_) => {
                    ErrorKind::ResourceExhausted
                }
                LvmError::Other { .. } => ErrorKind::Other,
            },

            _ => ErrorKind::Other,
        }
    }

    /// True when the error means the object does not exist
    pub fn is_not_found(&self) -> bool {
        self.kind() == ErrorKind::NotFound
    }

    /// Determine what action to take for this error
    pub fn action(&self) -> ErrorAction {
        match self {
            // Transient errors - retry with backoff
            Error::Kube(_) | Error::Conflict { .. } | Error::Io(_) => {
                ErrorAction::RequeueWithBackoff
            }

            // Device busy or capacity pressure - medium retry
            Error::ResourceExhausted(_) | Error::NoDevicesFound | Error::NoDevicesMatchingFilter => {
                ErrorAction::RequeueAfter(Duration::from_secs(60))
            }

            // Configuration/validation errors - don't retry automatically
            Error::Configuration(_)
            | Error::InvalidArgument(_)
            | Error::QuantityParse(_)
            | Error::VolumeSizeMismatch { .. } => ErrorAction::NoRequeue,

            // All other errors - retry with backoff
            _ => ErrorAction::RequeueWithBackoff,
        }
    }

    /// Check if this error is retryable
    pub fn is_retryable(&self) -> bool {
        !matches!(self.action(), ErrorAction::NoRequeue)
    }

    /// Check if this error is transient
    pub fn is_transient(&self) -> bool {
        matches!(self, Error::Kube(_) | Error::Conflict { .. } | Error::Io(_))
    }
}

/// Result type alias for the driver
pub type Result<T> = std::result::Result<T, Error>;

/// Collapse not-found errors into `Ok(None)`
pub trait IgnoreNotFound<T> {
    fn ignore_not_found(self) -> Result<Option<T>>;
}

impl<T> IgnoreNotFound<T> for Result<T> {
    fn ignore_not_found(self) -> Result<Option<T>> {
        match self {
            Ok(v) => Ok(Some(v)),
            Err(e) if e.is_not_found() => Ok(None),
            Err(e) => Err(e),
        }
    }
}
