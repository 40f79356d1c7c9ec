//! Prometheus Operator binary
//!
//! Parses flags into an [`OperatorConfig`], installs logging and the metrics
//! exporter, and runs the ThanosRuler and Alertmanager controllers until
//! SIGINT or SIGTERM.

use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};
use kube::Client;
use prometheus_operator::config::{self, OperatorConfig, ReloaderConfig};
use prometheus_operator::controller::run_operator;
use prometheus_operator::crd;
use std::collections::BTreeSet;
use std::net::SocketAddr;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, Level};
use tracing_subscriber::EnvFilter;

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
enum LogFormat {
    Plain,
    Json,
}

/// Prometheus Operator
#[derive(Parser, Debug)]
#[command(name = "prometheus-operator")]
#[command(about = "Kubernetes operator for Thanos Ruler and Alertmanager")]
#[command(version)]
struct Args {
    /// Metrics server address
    #[arg(long, env = "METRICS_ADDR", default_value = "0.0.0.0:8080")]
    metrics_addr: SocketAddr,

    /// Health probe address
    #[arg(long, env = "HEALTH_ADDR", default_value = "0.0.0.0:8081")]
    health_addr: SocketAddr,

    /// Namespace to watch (empty for cluster-wide)
    #[arg(long, env = "WATCH_NAMESPACE", default_value = "")]
    namespace: String,

    /// Namespaces to ignore (comma separated)
    #[arg(long, env = "DENY_NAMESPACES", default_value = "")]
    deny_namespaces: String,

    /// Labels added to every managed object (key=value,...)
    #[arg(long, env = "MANAGED_LABELS", default_value = "")]
    labels: String,

    /// Annotations added to every managed object (key=value,...)
    #[arg(long, env = "MANAGED_ANNOTATIONS", default_value = "")]
    annotations: String,

    /// Only manage resources annotated with this controller ID
    #[arg(long, env = "CONTROLLER_ID", default_value = "")]
    controller_id: String,

    /// Default Thanos image without tag
    #[arg(long, env = "THANOS_DEFAULT_BASE_IMAGE", default_value = config::DEFAULT_THANOS_BASE_IMAGE)]
    thanos_default_base_image: String,

    /// Default Alertmanager image without tag
    #[arg(long, env = "ALERTMANAGER_DEFAULT_BASE_IMAGE", default_value = config::DEFAULT_ALERTMANAGER_BASE_IMAGE)]
    alertmanager_default_base_image: String,

    /// Config-reloader image
    #[arg(long, env = "CONFIG_RELOADER_IMAGE", default_value = config::DEFAULT_RELOADER_IMAGE)]
    config_reloader_image: String,

    /// Config-reloader CPU request (empty to unset)
    #[arg(long, env = "CONFIG_RELOADER_CPU_REQUEST", default_value = "10m")]
    config_reloader_cpu_request: String,

    /// Config-reloader CPU limit (empty to unset)
    #[arg(long, env = "CONFIG_RELOADER_CPU_LIMIT", default_value = "10m")]
    config_reloader_cpu_limit: String,

    /// Config-reloader memory request (empty to unset)
    #[arg(long, env = "CONFIG_RELOADER_MEMORY_REQUEST", default_value = "50Mi")]
    config_reloader_memory_request: String,

    /// Config-reloader memory limit (empty to unset)
    #[arg(long, env = "CONFIG_RELOADER_MEMORY_LIMIT", default_value = "50Mi")]
    config_reloader_memory_limit: String,

    /// Add liveness and readiness probes to the config-reloader
    #[arg(long, env = "CONFIG_RELOADER_ENABLE_PROBES", default_value = "false")]
    config_reloader_enable_probes: bool,

    /// Address used by workloads with listenLocal
    #[arg(long, env = "LOCALHOST", default_value = "localhost")]
    localhost: String,

    /// Rule ConfigMap data ceiling in bytes
    #[arg(long, env = "MAX_CONFIGMAP_DATA_SIZE", default_value_t = config::DEFAULT_MAX_CONFIG_MAP_DATA_SIZE)]
    max_config_map_data_size: usize,

    /// Reconcile workers per controller
    #[arg(long, env = "WORKERS", default_value = "4")]
    workers: usize,

    /// Status refresh interval for unavailable workloads, in seconds
    #[arg(long, env = "STATUS_POLL_INTERVAL", default_value = "60")]
    status_poll_interval_secs: u64,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    log_level: Level,

    /// Log format
    #[arg(long, env = "LOG_FORMAT", value_enum, default_value_t = LogFormat::Plain)]
    log_format: LogFormat,

    /// Print CRD YAML and exit
    #[arg(long)]
    print_crd: bool,
}

impl Args {
    fn operator_config(&self) -> Result<OperatorConfig> {
        let config = OperatorConfig {
            thanos_default_base_image: self.thanos_default_base_image.clone(),
            alertmanager_default_base_image: self.alertmanager_default_base_image.clone(),
            reloader: ReloaderConfig {
                image: self.config_reloader_image.clone(),
                cpu_request: self.config_reloader_cpu_request.clone(),
                cpu_limit: self.config_reloader_cpu_limit.clone(),
                memory_request: self.config_reloader_memory_request.clone(),
                memory_limit: self.config_reloader_memory_limit.clone(),
                enable_probes: self.config_reloader_enable_probes,
            },
            labels: config::parse_key_values(&self.labels).context("Invalid --labels")?,
            annotations: config::parse_key_values(&self.annotations)
                .context("Invalid --annotations")?,
            localhost: self.localhost.clone(),
            controller_id: self.controller_id.clone(),
            namespace: (!self.namespace.is_empty()).then(|| self.namespace.clone()),
            deny_namespaces: self
                .deny_namespaces
                .split(',')
                .map(str::trim)
                .filter(|ns| !ns.is_empty())
                .map(str::to_string)
                .collect::<BTreeSet<_>>(),
            max_config_map_data_size: self.max_config_map_data_size,
            workers: self.workers,
            status_poll_interval: Duration::from_secs(self.status_poll_interval_secs),
        };
        config.validate().context("Invalid operator configuration")?;
        Ok(config)
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    if args.print_crd {
        print_crd()?;
        return Ok(());
    }

    init_logging(&args);
    let config = args.operator_config()?;

    info!(
        version = env!("CARGO_PKG_VERSION"),
        namespace = config.namespace.as_deref().unwrap_or("all"),
        "Starting Prometheus Operator"
    );

    start_metrics_server(args.metrics_addr)?;

    let health_addr = args.health_addr;
    tokio::spawn(async move {
        if let Err(e) = start_health_server(health_addr).await {
            error!(error = %e, "Health server failed");
        }
    });

    let client = Client::try_default()
        .await
        .context("Failed to create Kubernetes client")?;

    let shutdown = CancellationToken::new();
    tokio::spawn(shutdown_on_signal(shutdown.clone()));

    run_operator(client, config, shutdown)
        .await
        .context("Operator failed")?;

    Ok(())
}

/// Initialize logging subsystem
fn init_logging(args: &Args) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(args.log_level.as_str().to_lowercase()));
    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(false)
        .with_line_number(false);

    match args.log_format {
        LogFormat::Json => subscriber.json().init(),
        LogFormat::Plain => subscriber.init(),
    }
}

/// Install the Prometheus exporter with its own HTTP listener
fn start_metrics_server(addr: SocketAddr) -> Result<()> {
    use metrics_exporter_prometheus::PrometheusBuilder;

    info!(address = %addr, "Starting metrics server");

    PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
        .context("Failed to install Prometheus exporter")?;

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

/// Cancel `shutdown` on SIGINT or SIGTERM
async fn shutdown_on_signal(shutdown: CancellationToken) {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for SIGINT");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received SIGINT, shutting down"),
        _ = terminate => info!("Received SIGTERM, shutting down"),
    }
    shutdown.cancel();
}

/// Print the CRD YAML for installation
fn print_crd() -> Result<()> {
    let docs = crd::all_crds()
        .iter()
        .map(serde_yaml::to_string)
        .collect::<std::result::Result<Vec<_>, _>>()?;
    println!("{}", docs.join("---\n"));

    Ok(())
}
