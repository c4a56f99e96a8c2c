//! Admission webhook HTTP server
//!
//! Serves `AdmissionReview` requests over plain HTTP; TLS is terminated in
//! front of the webhook.

use super::hyperconverged::{HyperconvergedHandler, Mutation};
use crate::error::{Error, Result};
use axum::{extract::State, routing::post, Json, Router};
use k8s_openapi::api::core::v1::Pod;
use kube::core::admission::{AdmissionRequest, AdmissionResponse, AdmissionReview, Operation};
use kube::core::DynamicObject;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};

/// Path the mutating webhook configuration points at
pub const MUTATE_POD_PATH: &str = "/mutate-pod";

/// Admission server configuration
#[derive(Debug, Clone)]
pub struct WebhookConfig {
    pub bind_address: SocketAddr,
}

impl Default for WebhookConfig {
    fn default() -> Self {
        Self {
            bind_address: SocketAddr::from(([0, 0, 0, 0], 9443)),
        }
    }
}

#[derive(Clone)]
struct AppState {
    handler: Arc<HyperconvergedHandler>,
}

/// Build the webhook router
pub fn router(handler: Arc<HyperconvergedHandler>) -> Router {
    Router::new()
        .route(MUTATE_POD_PATH, post(mutate_pod))
        .layer(TraceLayer::new_for_http())
        .with_state(AppState { handler })
}

/// Admit one pod request
pub async fn review(
    handler: &HyperconvergedHandler,
    review: AdmissionReview<Pod>,
) -> AdmissionReview<DynamicObject> {
    let req: AdmissionRequest<Pod> = match review.try_into() {
        Ok(req) => req,
        Err(e) => {
            warn!("Invalid admission review: {}", e);
            return AdmissionResponse::invalid(e.to_string()).into_review();
        }
    };
    let response = AdmissionResponse::from(&req);

    // Anything but pod creation is let through untouched
    if req.kind.kind != "Pod" || req.operation != Operation::Create {
        return response.into_review();
    }
    let Some(pod) = req.object.as_ref() else {
        return response.deny("request carries no pod").into_review();
    };
    let namespace = req
        .namespace
        .as_deref()
        .or(pod.metadata.namespace.as_deref())
        .unwrap_or("default");

    match handler.mutate(namespace, pod).await {
        Ok(Mutation::Allow(reason)) => {
            info!("Allowed pod {}/{}: {}", namespace, req.name, reason);
            response.into_review()
        }
        Ok(Mutation::Patch(patch)) => match response.clone().with_patch(patch) {
            Ok(patched) => patched.into_review(),
            Err(e) => {
                error!("Failed to serialize patch: {}", e);
                response.deny(format!("failed to serialize patch: {}", e)).into_review()
            }
        },
        Err(e) => {
            error!("Failed to admit pod {}/{}: {}", namespace, req.name, e);
            response.deny(e.to_string()).into_review()
        }
    }
}

async fn mutate_pod(
    State(state): State<AppState>,
    Json(body): Json<AdmissionReview<Pod>>,
) -> Json<AdmissionReview<DynamicObject>> {
    Json(review(&state.handler, body).await)
}

/// Serve the webhook until `cancel` fires
pub async fn run_webhook_server(
    config: WebhookConfig,
    handler: Arc<HyperconvergedHandler>,
    cancel: CancellationToken,
) -> Result<()> {
    let listener = tokio::net::TcpListener::bind(config.bind_address)
        .await
        .map_err(|e| Error::Internal(format!("Failed to bind webhook server: {}", e)))?;
    info!("Admission webhook listening on {}", config.bind_address);

    axum::serve(listener, router(handler))
        .with_graceful_shutdown(async move {
            cancel.cancelled().await;
            info!("Admission webhook shutting down");
        })
        .await
        .map_err(|e| Error::Internal(format!("Webhook server error: {}", e)))
}
