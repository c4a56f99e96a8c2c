//! Local LVM CSI Webhook
//!
//! Cluster-wide companion of the node driver: admits pods next to their
//! node-local volumes and, while holding the leader lease, clears the
//! finalizers of released volumes whose node is gone.

use anyhow::{bail, Context};
use clap::Parser;
use k8s_openapi::api::core::v1::PersistentVolume;
use kube::{Api, Client};
use prometheus::Registry;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn, Level};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use local_lvm_csi::admission::run_webhook_server;
use local_lvm_csi::domain::ports::{ClusterApiRef, EventRecorderRef};
use local_lvm_csi::metrics::{run_health_server, run_metrics_server};
use local_lvm_csi::{
    HyperconvergedHandler, KubeCluster, KubeEventRecorder, LeaderElector, LeaseConfig, Metrics,
    Readiness, ReleasedVolumeReaper, TaskManager, WebhookConfig,
};

const COMPONENT: &str = "local-csi-webhook";

// =============================================================================
// CLI Arguments
// =============================================================================

/// Co-location webhook and released volume reaper
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Admission server bind address
    #[arg(long, env = "BIND_ADDRESS", default_value = "0.0.0.0:9443")]
    bind_address: SocketAddr,

    /// Namespace holding the leader lease
    #[arg(long, env = "NAMESPACE", default_value = "default")]
    namespace: String,

    /// Name of this replica's pod, used as the lease identity
    #[arg(long, env = "POD_NAME")]
    pod_name: Option<String>,

    /// Run the reaper only while holding the leader lease
    #[arg(long, env = "LEADER_ELECTION", default_value = "true", action = clap::ArgAction::Set)]
    leader_election: bool,

    /// Name of the leader lease
    #[arg(long, env = "LEASE_NAME", default_value = "local-csi-webhook-leader")]
    lease_name: String,

    /// Remove finalizers of released volumes whose node is gone
    #[arg(long, env = "ENABLE_PV_CLEANUP", default_value = "true", action = clap::ArgAction::Set)]
    enable_pv_cleanup: bool,

    /// Health probe bind address
    #[arg(long, env = "HEALTH_PROBE_BIND_ADDRESS", default_value = ":8081")]
    health_probe_bind_address: String,

    /// Metrics server bind address, "0" disables it
    #[arg(long, env = "METRICS_BIND_ADDRESS", default_value = ":8080")]
    metrics_bind_address: String,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    log_level: String,

    /// Output logs as JSON
    #[arg(long, env = "LOG_JSON")]
    log_json: bool,
}

// =============================================================================
// Main
// =============================================================================

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_logging(&args.log_level, args.log_json);

    info!("Starting {}", COMPONENT);
    info!("  Version: {}", local_lvm_csi::VERSION);
    info!("  Admission: {}", args.bind_address);
    info!("  Leader election: {}", args.leader_election);

    let client = Client::try_default()
        .await
        .context("failed to create Kubernetes client")?;
    let cluster: ClusterApiRef = Arc::new(KubeCluster::new(client.clone()));
    let recorder: EventRecorderRef = Arc::new(KubeEventRecorder::new(
        client.clone(),
        COMPONENT,
        args.pod_name.clone(),
    ));

    let registry = Registry::new();
    let metrics = Arc::new(Metrics::register(&registry)?);
    let readiness = Readiness::default();

    let mut tasks = TaskManager::new();
    let token = tasks.token();

    // Every replica admits pods
    let handler = Arc::new(HyperconvergedHandler::new(cluster.clone()));
    tasks.spawn(
        "admission-server",
        run_webhook_server(
            WebhookConfig {
                bind_address: args.bind_address,
            },
            handler,
            token.clone(),
        ),
    );

    // Only the leader reaps
    if args.enable_pv_cleanup {
        let reaper = Arc::new(ReleasedVolumeReaper::new(cluster, recorder, metrics));
        let pvs: Api<PersistentVolume> = Api::all(client.clone());

        if args.leader_election {
            let identity = match args.pod_name.clone().or_else(|| std::env::var("HOSTNAME").ok()) {
                Some(identity) => identity,
                None => bail!("leader election needs --pod-name or HOSTNAME"),
            };
            let elector = LeaderElector::new(
                client.clone(),
                LeaseConfig::new(&args.lease_name, &args.namespace, identity),
            );
            let cancel = token.clone();
            tasks.spawn("released-pv-reaper", async move {
                elector
                    .run(cancel, move |leading| reaper.run(pvs, leading))
                    .await
            });
        } else {
            tasks.spawn("released-pv-reaper", reaper.run(pvs, token.clone()));
        }
    } else {
        info!("Released volume cleanup disabled");
    }

    // Health and metrics
    let health_addr = args.health_probe_bind_address.clone();
    let health_readiness = readiness.clone();
    tasks.spawn(
        "health-server",
        until_cancelled(token.clone(), async move {
            run_health_server(&health_addr, health_readiness).await
        }),
    );
    if args.metrics_bind_address != "0" {
        let metrics_addr = args.metrics_bind_address.clone();
        tasks.spawn(
            "metrics-server",
            until_cancelled(token.clone(), async move {
                run_metrics_server(&metrics_addr, registry).await
            }),
        );
    }

    readiness.set_ready();

    if let Err(e) = tasks.run_until(shutdown_signal()).await {
        error!("Webhook failed: {}", e);
        return Err(e.into());
    }
    info!("Webhook shutdown complete");
    Ok(())
}

async fn until_cancelled<F>(cancel: CancellationToken, server: F) -> local_lvm_csi::Result<()>
where
    F: Future<Output = local_lvm_csi::Result<()>>,
{
    tokio::select! {
        _ = cancel.cancelled() => Ok(()),
        result = server => result,
    }
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut terminate) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = terminate.recv() => {}
                }
                return;
            }
            Err(e) => warn!("Failed to install SIGTERM handler: {}", e),
        }
    }
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("Failed to listen for shutdown signal: {}", e);
    }
}

// =============================================================================
// Logging Setup
// =============================================================================

fn init_logging(log_level: &str, log_json: bool) {
    let level = match log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let mut filter = EnvFilter::from_default_env().add_directive(level.into());
    for directive in ["hyper=warn", "kube=info", "tower=warn", "tower_http=info"] {
        if let Ok(directive) = directive.parse() {
            filter = filter.add_directive(directive);
        }
    }

    if log_json {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_target(true))
            .init();
    }
}
