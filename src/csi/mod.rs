//! Storage-plane front-end
//!
//! The controller and node services the container orchestrator calls through
//! the `csi.v1` gRPC protocol. Core errors are mapped to protocol status codes
//! here and nowhere else.

pub mod controller;
pub mod grpc;
pub mod node;
pub mod proto;
pub mod server;
pub mod types;

pub use controller::{ControllerConfig, ControllerService, CsiController};
pub use node::CsiNode;
pub use server::{parse_endpoint, CsiServer};
pub use types::{Code, Status};

use crate::error::{Error, ErrorKind};

impl From<Error> for Status {
    fn from(err: Error) -> Self {
        let code = match err.kind() {
            ErrorKind::ResourceExhausted => Code::ResourceExhausted,
            ErrorKind::VolumeSizeMismatch => Code::AlreadyExists,
            ErrorKind::InvalidArgument => Code::InvalidArgument,
            ErrorKind::FailedPrecondition => Code::FailedPrecondition,
            _ => Code::Internal,
        };
        Status::new(code, err.to_string())
    }
}

/// Result of a storage-plane call
pub type CsiResult<T> = std::result::Result<T, Status>;
