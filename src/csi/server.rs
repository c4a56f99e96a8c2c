//! Storage-plane socket server
//!
//! Serves the `csi.v1` Identity, Controller and Node gRPC services on a
//! local Unix socket, the transport the kubelet and the CSI sidecars dial.

use super::proto::controller_server::ControllerServer;
use super::proto::identity_server::IdentityServer;
use super::proto::node_server::NodeServer;
use super::{CsiController, CsiNode};
use crate::error::{Error, Result};
use crate::metrics::Readiness;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::net::UnixListener;
use tokio_stream::wrappers::UnixListenerStream;
use tokio_util::sync::CancellationToken;
use tonic::transport::Server;
use tracing::{debug, info};

// =============================================================================
// Endpoint
// =============================================================================

/// Socket path of a `unix://` endpoint; bare paths are accepted as-is
pub fn parse_endpoint(endpoint: &str) -> Result<PathBuf> {
    let path = endpoint.strip_prefix("unix://").unwrap_or(endpoint);
    if path.is_empty() || !path.starts_with('/') {
        return Err(Error::Configuration(format!(
            "Invalid storage-plane endpoint {:?}: expected unix:///absolute/path",
            endpoint
        )));
    }
    Ok(PathBuf::from(path))
}

// =============================================================================
// Server
// =============================================================================

/// The three storage-plane services over one controller and node
/// implementation. Probe answers from `readiness`.
pub struct CsiServer {
    pub(super) controller: Arc<dyn CsiController>,
    pub(super) node: Arc<dyn CsiNode>,
    pub(super) readiness: Readiness,
}

impl CsiServer {
    pub fn new(
        controller: Arc<dyn CsiController>,
        node: Arc<dyn CsiNode>,
        readiness: Readiness,
    ) -> Self {
        Self {
            controller,
            node,
            readiness,
        }
    }

    /// Listen on `endpoint` until `cancel` fires. A stale socket file left by
    /// a previous run is replaced.
    pub async fn serve(self: Arc<Self>, endpoint: String, cancel: CancellationToken) -> Result<()> {
        let path = parse_endpoint(&endpoint)?;
        remove_stale_socket(&path).await?;
        let listener = UnixListener::bind(&path)?;
        info!("Storage-plane server listening on {}", path.display());

        let served = Server::builder()
            .add_service(IdentityServer::from_arc(self.clone()))
            .add_service(ControllerServer::from_arc(self.clone()))
            .add_service(NodeServer::from_arc(self))
            .serve_with_incoming_shutdown(UnixListenerStream::new(listener), cancel.cancelled())
            .await;

        if let Err(e) = tokio::fs::remove_file(&path).await {
            debug!("Failed to remove socket {}: {}", path.display(), e);
        }
        info!("Storage-plane server stopped");
        served.map_err(|e| Error::Internal(format!("Storage-plane server failed: {}", e)))
    }
}

async fn remove_stale_socket(path: &Path) -> Result<()> {
    match tokio::fs::remove_file(path).await {
        Ok(()) => {
            debug!("Removed stale socket {}", path.display());
            Ok(())
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}
