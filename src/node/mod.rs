//! Node Plugin
//!
//! Staging, publishing and IO throttling of volumes on the node the driver
//! runs on.

pub mod cgroup;
pub mod mounter;
pub mod mounts;
pub mod service;
pub mod throttle;

pub use cgroup::ThrottleConfig;
pub use mounter::SystemMounter;
pub use mounts::{parse_mounts, read_mounts, MountEntry, PROC_MOUNTS};
pub use service::NodeService;
pub use throttle::{ThrottleRequest, ThrottleSpec, CLEAR_THROTTLING_PARAM};
