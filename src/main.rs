//! Local LVM CSI Driver
//!
//! Per-node driver process: serves the storage-plane socket, keeps the node's
//! logical volumes in line with the cluster's persistent volumes and cleans
//! up after itself when its pod is removed.

use anyhow::Context;
use clap::Parser;
use k8s_openapi::api::core::v1::PersistentVolume;
use k8s_openapi::api::storage::v1::CSIStorageCapacity;
use kube::Api;
use prometheus::Registry;
use std::future::Future;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn, Level};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use local_lvm_csi::domain::ports::{
    ClusterApiRef, DeviceProbeRef, EventRecorderRef, LvmManagerRef, LvmVolumeManagerRef, MounterRef,
};
use local_lvm_csi::cluster::rate_limited_client;
use local_lvm_csi::gc::VolumeManagerAdapter;
use local_lvm_csi::metrics::{run_health_server, run_metrics_server};
use local_lvm_csi::probe::FilterConfig;
use local_lvm_csi::{
    CapacityCleaner, CapacityCleanupConfig, CleanupGate, ControllerConfig, ControllerService,
    CsiServer, DeviceScanner, FailoverReconciler, KubeCluster, KubeEventRecorder, LsblkBlockDevices,
    LvmCli, LvmConfig, LvmManager, LvmVolumeCore, Metrics, NodeService, NoopRecorder, OrphanScanner,
    OrphanScannerConfig, Readiness, ScannerConfig, SystemMounter, TaskManager, ThrottleConfig,
    VolumeHandleIndex, DRIVER_NAME,
};

// =============================================================================
// CLI Arguments
// =============================================================================

/// Node-local LVM volume driver
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Name of the node this driver runs on
    #[arg(long, env = "NODE_NAME")]
    node_name: String,

    /// Name of the driver's own pod
    #[arg(long, env = "POD_NAME")]
    pod_name: Option<String>,

    /// Namespace the driver runs in
    #[arg(long, env = "NAMESPACE", default_value = "default")]
    namespace: String,

    /// Storage-plane socket endpoint
    #[arg(long, env = "CSI_BIND_ADDRESS", default_value = "unix:///tmp/csi.sock")]
    csi_bind_address: String,

    /// Metrics server bind address, "0" disables it
    #[arg(long, env = "METRICS_BIND_ADDRESS", default_value = ":8080")]
    metrics_bind_address: String,

    /// Health probe bind address
    #[arg(long, env = "HEALTH_PROBE_BIND_ADDRESS", default_value = ":8081")]
    health_probe_bind_address: String,

    /// Runtime worker threads
    #[arg(long, env = "WORKER_THREADS", default_value = "10")]
    worker_threads: usize,

    /// Requests per second allowed against the API server, 0 for no limit
    #[arg(long, env = "KUBE_API_QPS", default_value = "20")]
    kube_api_qps: f32,

    /// Request burst allowed against the API server
    #[arg(long, env = "KUBE_API_BURST", default_value = "30")]
    kube_api_burst: u32,

    /// Trace collector address. Informational only: spans go to the log
    /// output and no collector export is built in
    #[arg(long, env = "TRACE_ADDRESS")]
    trace_address: Option<String>,

    /// Fraction of requests traced. Informational only, see --trace-address
    #[arg(long, env = "TRACE_SAMPLE_RATE", default_value = "0")]
    trace_sample_rate: f64,

    /// Emit Kubernetes events
    #[arg(long, env = "EVENT_RECORDER_ENABLED", default_value = "true", action = clap::ArgAction::Set)]
    event_recorder_enabled: bool,

    /// Remove volume groups and physical volumes when the driver pod is deleted
    #[arg(long, env = "ENABLE_CLEANUP", default_value = "true", action = clap::ArgAction::Set)]
    enable_cleanup: bool,

    /// Remove local volumes whose PersistentVolume moved to another node
    #[arg(long, env = "ENABLE_PV_GARBAGE_COLLECTION", default_value = "true", action = clap::ArgAction::Set)]
    enable_pv_garbage_collection: bool,

    /// Periodically remove local volumes without a PersistentVolume
    #[arg(long, env = "ENABLE_LVM_ORPHAN_CLEANUP", default_value = "true", action = clap::ArgAction::Set)]
    enable_lvm_orphan_cleanup: bool,

    /// Orphan scan interval in seconds
    #[arg(long, env = "LVM_ORPHAN_CLEANUP_INTERVAL_SECS", default_value = "600")]
    lvm_orphan_cleanup_interval_secs: u64,

    /// Placement is handled by the co-location webhook
    #[arg(long, env = "RUN_ALONGSIDE_WEBHOOK")]
    run_alongside_webhook: bool,

    /// Glob of block devices never claimed (repeatable)
    #[arg(long = "device-exclude", env = "DEVICE_EXCLUDE", value_delimiter = ',')]
    device_exclude: Vec<String>,

    /// File the fatal error is written to before exiting
    #[arg(long, env = "TERMINATION_MESSAGE_PATH", default_value = "/tmp/termination-log")]
    termination_message_path: String,

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

fn main() {
    let args = Args::parse();
    init_logging(&args.log_level, args.log_json);

    let result = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(args.worker_threads.max(1))
        .enable_all()
        .build()
        .context("failed to build runtime")
        .and_then(|runtime| runtime.block_on(run(&args)));

    if let Err(e) = result {
        error!("Driver failed: {:#}", e);
        write_termination_message(&args.termination_message_path, &format!("{:#}", e));
        std::process::exit(1);
    }
    info!("Driver shutdown complete");
}

async fn run(args: &Args) -> anyhow::Result<()> {
    info!("Starting {} driver", DRIVER_NAME);
    info!("  Version: {}", local_lvm_csi::VERSION);
    info!("  Node: {}", args.node_name);
    info!("  Storage-plane endpoint: {}", args.csi_bind_address);
    info!("  Run alongside webhook: {}", args.run_alongside_webhook);
    info!(
        "  API client limits: qps={} burst={}",
        args.kube_api_qps, args.kube_api_burst
    );
    if let Some(address) = &args.trace_address {
        warn!(
            "Trace export to {} (sample rate {}) is not built in, spans stay in the log",
            address, args.trace_sample_rate
        );
    }

    let client = rate_limited_client(args.kube_api_qps, args.kube_api_burst)
        .await
        .context("failed to create Kubernetes client")?;
    let cluster: ClusterApiRef = Arc::new(KubeCluster::new(client.clone()));
    let recorder: EventRecorderRef = if args.event_recorder_enabled {
        Arc::new(KubeEventRecorder::new(
            client.clone(),
            DRIVER_NAME,
            args.pod_name.clone(),
        ))
    } else {
        Arc::new(NoopRecorder)
    };

    let registry = Registry::new();
    let metrics = Arc::new(Metrics::register(&registry)?);
    let readiness = Readiness::default();

    // Volume core
    let lvm: LvmManagerRef = Arc::new(LvmCli::new(LvmConfig::default()));
    if !lvm.is_supported() {
        warn!("LVM tools not found, volume operations will fail");
    }
    let probe: DeviceProbeRef = Arc::new(DeviceScanner::new(
        Arc::new(LsblkBlockDevices::new()),
        ScannerConfig {
            filter: FilterConfig {
                exclude_patterns: args.device_exclude.clone(),
                ..Default::default()
            },
        },
    ));
    let core = Arc::new(LvmVolumeCore::new(&args.node_name, lvm.clone(), probe));
    let mounter: MounterRef = Arc::new(SystemMounter::default());

    // Storage-plane services
    let node_service = Arc::new(NodeService::new(
        core.clone(),
        mounter.clone(),
        ThrottleConfig::default(),
        metrics.clone(),
    ));
    let controller = Arc::new(
        ControllerService::new(
            core.clone(),
            cluster.clone(),
            recorder.clone(),
            mounter.clone(),
            metrics.clone(),
            ControllerConfig {
                run_alongside_webhook: args.run_alongside_webhook,
            },
        )
        .with_throttling_updater(node_service.clone()),
    );
    let csi_server = Arc::new(CsiServer::new(controller, node_service, readiness.clone()));

    let mut tasks = TaskManager::new();
    let token = tasks.token();

    tasks.spawn(
        "csi-server",
        csi_server.serve(args.csi_bind_address.clone(), token.clone()),
    );

    // Garbage collection
    let gc_enabled = args.enable_pv_garbage_collection || args.enable_lvm_orphan_cleanup;
    if gc_enabled {
        let index = Arc::new(VolumeHandleIndex::new());
        let volumes: LvmVolumeManagerRef = Arc::new(VolumeManagerAdapter::new(
            core.clone(),
            lvm.clone(),
            mounter.clone(),
        ));

        let updates = if args.enable_pv_garbage_collection {
            let (tx, rx) = mpsc::channel(1024);
            let failover = Arc::new(FailoverReconciler::new(
                &args.node_name,
                cluster.clone(),
                volumes.clone(),
                recorder.clone(),
                metrics.clone(),
            ));
            tasks.spawn("pv-failover", failover.run(rx, token.clone()));
            Some(tx)
        } else {
            None
        };

        if args.enable_lvm_orphan_cleanup {
            let scanner = OrphanScanner::new(
                &args.node_name,
                volumes,
                index.clone(),
                recorder.clone(),
                metrics.clone(),
                OrphanScannerConfig {
                    interval: Duration::from_secs(args.lvm_orphan_cleanup_interval_secs),
                },
            );
            tasks.spawn("lvm-orphan-scanner", scanner.run(token.clone()));
        }

        let pvs: Api<PersistentVolume> = Api::all(client.clone());
        tasks.spawn("pv-index", index.run(pvs, updates, token.clone()));
    }

    // Stale capacity objects
    let cleaner = Arc::new(CapacityCleaner::new(
        &args.node_name,
        &args.namespace,
        cluster.clone(),
        recorder.clone(),
        metrics.clone(),
        CapacityCleanupConfig::default(),
    ));
    let capacities: Api<CSIStorageCapacity> = Api::namespaced(client.clone(), &args.namespace);
    tasks.spawn("capacity-cleanup", cleaner.run(capacities, token.clone()));

    // Shutdown cleanup
    match (&args.pod_name, args.enable_cleanup) {
        (Some(pod_name), true) => {
            let gate = CleanupGate::new(core.clone(), cluster.clone(), &args.namespace, pod_name);
            tasks.spawn("cleanup-gate", gate.run(token.clone()));
        }
        (None, true) => warn!("Pod name unknown, shutdown cleanup disabled"),
        _ => info!("Shutdown cleanup disabled"),
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
    info!("Driver started with {} tasks", tasks.len());

    tasks.run_until(shutdown_signal()).await?;
    Ok(())
}

/// Run `server` until it stops or `cancel` fires
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

fn write_termination_message(path: &str, message: &str) {
    if let Err(e) = std::fs::write(Path::new(path), message) {
        warn!("Failed to write termination message to {}: {}", path, e);
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
    for directive in ["hyper=warn", "kube=info", "tower=warn"] {
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
