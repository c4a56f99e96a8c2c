//! Prometheus metrics and the health endpoints

use crate::error::{Error, Result};
use hyper::service::{make_service_fn, service_fn};
use hyper::{Body, Request, Response, Server, StatusCode};
use prometheus::{Encoder, IntCounter, IntCounterVec, Opts, Registry, TextEncoder};
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::info;

// =============================================================================
// Driver Metrics
// =============================================================================

/// Counters shared by every component of the driver
#[derive(Clone)]
pub struct Metrics {
    /// Volume provisioning outcomes, labelled `success` / `failure`
    pub provisions: IntCounterVec,
    /// Orphaned logical volumes, labelled `cleaned` / `failed`
    pub orphan_cleanups: IntCounterVec,
    /// Released volumes whose finalizers were removed
    pub finalizer_removals: IntCounter,
    /// `io.max` writes, labelled `success` / `failure`
    pub throttle_writes: IntCounterVec,
    /// Stale capacity objects deleted
    pub capacity_cleanups: IntCounter,
}

impl Metrics {
    /// Create unregistered counters
    pub fn new() -> Result<Self> {
        let vec = |name: &str, help: &str, label: &str| {
            IntCounterVec::new(Opts::new(name, help), &[label]).map_err(metrics_error)
        };
        Ok(Self {
            provisions: vec(
                "local_csi_provision_total",
                "Logical volume provisioning attempts",
                "result",
            )?,
            orphan_cleanups: vec(
                "local_csi_orphan_cleanup_total",
                "Orphaned logical volumes processed by garbage collection",
                "result",
            )?,
            finalizer_removals: IntCounter::new(
                "local_csi_reaper_finalizer_removals_total",
                "Released volumes unblocked by removing their finalizers",
            )
            .map_err(metrics_error)?,
            throttle_writes: vec(
                "local_csi_throttle_writes_total",
                "Writes of pod cgroup io.max entries",
                "result",
            )?,
            capacity_cleanups: IntCounter::new(
                "local_csi_capacity_cleanup_total",
                "Stale CSIStorageCapacity objects deleted",
            )
            .map_err(metrics_error)?,
        })
    }

    /// Create the counters and register them with `registry`
    pub fn register(registry: &Registry) -> Result<Self> {
        let metrics = Self::new()?;
        registry
            .register(Box::new(metrics.provisions.clone()))
            .map_err(metrics_error)?;
        registry
            .register(Box::new(metrics.orphan_cleanups.clone()))
            .map_err(metrics_error)?;
        registry
            .register(Box::new(metrics.finalizer_removals.clone()))
            .map_err(metrics_error)?;
        registry
            .register(Box::new(metrics.throttle_writes.clone()))
            .map_err(metrics_error)?;
        registry
            .register(Box::new(metrics.capacity_cleanups.clone()))
            .map_err(metrics_error)?;
        Ok(metrics)
    }

    pub fn record_provision(&self, success: bool) {
        let result = if success { "success" } else { "failure" };
        self.provisions.with_label_values(&[result]).inc();
    }

    pub fn record_orphan_cleanup(&self, cleaned: bool) {
        let result = if cleaned { "cleaned" } else { "failed" };
        self.orphan_cleanups.with_label_values(&[result]).inc();
    }

    pub fn record_throttle_write(&self, success: bool) {
        let result = if success { "success" } else { "failure" };
        self.throttle_writes.with_label_values(&[result]).inc();
    }
}

fn metrics_error(e: prometheus::Error) -> Error {
    Error::Internal(format!("metrics: {}", e))
}

/// Accept `:8080` shorthand for all interfaces
pub fn parse_bind_address(addr: &str) -> Result<SocketAddr> {
    let full = if addr.starts_with(':') {
        format!("0.0.0.0{}", addr)
    } else {
        addr.to_string()
    };
    full.parse()
        .map_err(|e| Error::Configuration(format!("invalid bind address {}: {}", addr, e)))
}

fn text_response(status: StatusCode, body: impl Into<Body>) -> Response<Body> {
    let mut response = Response::new(body.into());
    *response.status_mut() = status;
    response
}

// =============================================================================
// Health Server
// =============================================================================

/// Readiness flag flipped once the driver has finished starting
#[derive(Debug, Clone, Default)]
pub struct Readiness(Arc<AtomicBool>);

impl Readiness {
    pub fn set_ready(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_ready(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

fn health_response(path: &str, readiness: &Readiness) -> Response<Body> {
    match path {
        "/healthz" | "/livez" => text_response(StatusCode::OK, "ok"),
        "/readyz" if readiness.is_ready() => text_response(StatusCode::OK, "ok"),
        "/readyz" => text_response(StatusCode::SERVICE_UNAVAILABLE, "not ready"),
        _ => text_response(StatusCode::NOT_FOUND, "not found"),
    }
}

/// Serve `/healthz` and `/readyz` on `addr`
pub async fn run_health_server(addr: &str, readiness: Readiness) -> Result<()> {
    let addr = parse_bind_address(addr)?;
    let make_svc = make_service_fn(move |_conn| {
        let readiness = readiness.clone();
        async move {
            Ok::<_, Infallible>(service_fn(move |req: Request<Body>| {
                let response = health_response(req.uri().path(), &readiness);
                async move { Ok::<_, Infallible>(response) }
            }))
        }
    });

    info!("Health server listening on {}", addr);
    Server::try_bind(&addr)
        .map_err(|e| Error::Internal(format!("Health server bind error: {}", e)))?
        .serve(make_svc)
        .await
        .map_err(|e| Error::Internal(format!("Health server error: {}", e)))
}

// =============================================================================
// Metrics Server
// =============================================================================

fn metrics_response(path: &str, registry: &Registry) -> Response<Body> {
    if path != "/metrics" {
        return text_response(StatusCode::NOT_FOUND, "not found");
    }
    let encoder = TextEncoder::new();
    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&registry.gather(), &mut buffer) {
        return text_response(StatusCode::INTERNAL_SERVER_ERROR, e.to_string());
    }
    let mut response = text_response(StatusCode::OK, buffer);
    if let Ok(value) = encoder.format_type().parse() {
        response.headers_mut().insert(hyper::header::CONTENT_TYPE, value);
    }
    response
}

/// Serve the registry on `addr` under `/metrics`
pub async fn run_metrics_server(addr: &str, registry: Registry) -> Result<()> {
    let addr = parse_bind_address(addr)?;
    let make_svc = make_service_fn(move |_conn| {
        let registry = registry.clone();
        async move {
            Ok::<_, Infallible>(service_fn(move |req: Request<Body>| {
                let response = metrics_response(req.uri().path(), &registry);
                async move { Ok::<_, Infallible>(response) }
            }))
        }
    });

    info!("Metrics server listening on {}", addr);
    Server::try_bind(&addr)
        .map_err(|e| Error::Internal(format!("Metrics server bind error: {}", e)))?
        .serve(make_svc)
        .await
        .map_err(|e| Error::Internal(format!("Metrics server error: {}", e)))
}
