//! KECS control plane
//!
//! Runs the reverse path (watchers, sync workers and batch updater) against
//! the Kubernetes cluster from the ambient kubeconfig.

use anyhow::{Context, Result};
use clap::{ArgAction, Parser};
use kecs_controlplane::prelude::*;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, Level};
use tracing_subscriber::fmt::format::FmtSpan;

/// ECS-compatible control plane on Kubernetes
#[derive(Parser, Debug)]
#[command(name = "kecs-controlplane")]
#[command(about = "ECS-compatible control plane that runs workloads on Kubernetes")]
#[command(version)]
struct Args {
    /// YAML configuration file
    #[arg(long, short = 'c', env = "KECS_CONFIG")]
    config: Option<PathBuf>,

    /// Region encoded in ARNs and namespaces
    #[arg(long, env = "KECS_REGION")]
    region: Option<String>,

    /// Account id encoded in ARNs
    #[arg(long, env = "KECS_ACCOUNT_ID")]
    account_id: Option<String>,

    /// Number of sync workers
    #[arg(long, env = "KECS_SYNC_WORKERS")]
    sync_workers: Option<usize>,

    /// Create the `default` cluster on startup
    #[arg(long, env = "KECS_DEFAULT_CLUSTER", default_value = "true", action = ArgAction::Set)]
    default_cluster: bool,

    /// Metrics server address
    #[arg(long, env = "METRICS_ADDR", default_value = "0.0.0.0:9090")]
    metrics_addr: SocketAddr,

    /// Health probe address
    #[arg(long, env = "HEALTH_ADDR", default_value = "0.0.0.0:8081")]
    health_addr: SocketAddr,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    log_level: Level,

    /// Enable JSON log format
    #[arg(long, env = "LOG_JSON", default_value = "false")]
    log_json: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    init_logging(&args)?;
    let config = load_config(&args)?;

    info!(
        version = env!("CARGO_PKG_VERSION"),
        region = %config.region,
        account_id = %config.account_id,
        "Starting KECS control plane"
    );

    let metrics_addr = args.metrics_addr;
    tokio::spawn(async move {
        if let Err(e) = start_metrics_server(metrics_addr).await {
            error!(error = %e, "Metrics server failed");
        }
    });

    let health_addr = args.health_addr;
    tokio::spawn(async move {
        if let Err(e) = start_health_server(health_addr).await {
            error!(error = %e, "Health server failed");
        }
    });

    let platform: SharedPlatform = Arc::new(
        KubePlatform::try_default()
            .await
            .context("Failed to create Kubernetes client")?,
    );
    let storage: SharedStorage = Arc::new(MemoryStorage::new());

    let batch = Arc::new(BatchUpdater::new(storage.clone(), config.batch.clone()));
    let sync = Arc::new(SyncController::new(
        &config,
        storage.clone(),
        platform.clone(),
        batch.clone(),
    ));
    let orchestrator = Orchestrator::new(
        config.clone(),
        storage.clone(),
        platform.clone(),
        batch.clone(),
    );

    if args.default_cluster {
        let cluster = orchestrator
            .create_cluster(CreateClusterRequest::default())
            .await
            .context("Failed to create the default cluster")?;
        info!(cluster_arn = %cluster.cluster_arn, "Default cluster ready");
    }

    let sync_cancel = CancellationToken::new();
    let batch_cancel = CancellationToken::new();
    let batch_handle = tokio::spawn(batch.clone().run(batch_cancel.clone()));
    let sync_handle = tokio::spawn(sync.clone().run(sync_cancel.clone()));

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for shutdown signal")?;
    info!("Shutdown requested");

    // Workers must stop before the batch updater drains their last updates
    sync_cancel.cancel();
    sync_handle
        .await
        .context("Sync controller panicked")?
        .context("Sync controller failed")?;
    batch_cancel.cancel();
    batch_handle.await.context("Batch updater panicked")?;

    info!("KECS control plane stopped");
    Ok(())
}

/// Load the config file, then apply command line overrides
fn load_config(args: &Args) -> Result<ControlPlaneConfig> {
    let mut config = match &args.config {
        Some(path) => ControlPlaneConfig::from_file(path)
            .with_context(|| format!("Failed to load config from {}", path.display()))?,
        None => ControlPlaneConfig::default(),
    };

    if let Some(region) = &args.region {
        config = config.with_region(region);
    }
    if let Some(account_id) = &args.account_id {
        config = config.with_account_id(account_id);
    }
    if let Some(workers) = args.sync_workers {
        let sync = config.sync.clone().with_workers(workers);
        config = config.with_sync(sync);
    }

    config.validate().context("Invalid configuration")?;
    Ok(config)
}

/// Initialize logging subsystem
fn init_logging(args: &Args) -> Result<()> {
    let subscriber = tracing_subscriber::fmt()
        .with_max_level(args.log_level)
        .with_span_events(FmtSpan::CLOSE)
        .with_target(true)
        .with_thread_ids(false)
        .with_line_number(false);

    if args.log_json {
        subscriber.json().init();
    } else {
        subscriber.init();
    }

    Ok(())
}

/// Start the Prometheus metrics server
async fn start_metrics_server(addr: SocketAddr) -> Result<()> {
    use metrics_exporter_prometheus::PrometheusBuilder;

    info!(address = %addr, "Starting metrics server");

    PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
        .context("Failed to install Prometheus exporter")?;

    std::future::pending::<()>().await;

    Ok(())
}

/// Start the health probe server
async fn start_health_server(addr: SocketAddr) -> Result<()> {
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    info!(address = %addr, "Starting health server");

    let listener = TcpListener::bind(addr)
        .await
        .context("Failed to bind health server")?;

    loop {
        let (mut socket, _) = listener.accept().await?;

        tokio::spawn(async move {
            let mut buf = [0; 1024];
            if socket.read(&mut buf).await.is_ok() {
                let response = "HTTP/1.1 200 OK\r\nContent-Length: 2\r\n\r\nOK";
                let _ = socket.write_all(response.as_bytes()).await;
            }
        });
    }
}
