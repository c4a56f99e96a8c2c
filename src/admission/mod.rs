//! Hyperconverged Admission
//!
//! A mutating webhook that pins pods using node-local volumes to the nodes
//! already holding their data.

pub mod hyperconverged;
pub mod retry;
pub mod server;

pub use hyperconverged::{inject_node_affinity, pod_patch, FailoverMode, HyperconvergedHandler, Mutation};
pub use retry::{is_retriable, retry_on_error};
pub use server::{run_webhook_server, WebhookConfig, MUTATE_POD_PATH};
