use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use clap::{Parser, ValueEnum};
use libcsi::backend::{ControllerService, Driver, NodeService};
use libcsi::cloud::CloudVolumes;
use libcsi::cloud::hcloud::{DEFAULT_ENDPOINT, HcloudClient, METADATA_ENDPOINT, MetadataClient};
use libcsi::config::{DEFAULT_LOCATION, DriverConfig};
use libcsi::mount::Mounter;
use libcsi::mount::linux::LinuxMounter;
use libcsi::transport::{CsiServer, parse_endpoint};
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
enum Mode {
    /// Only the controller service (create, delete, attach, detach)
    Controller,
    /// Only the node service (stage, publish)
    Node,
    /// Both services in one process
    All,
}

impl Mode {
    fn controller(self) -> bool {
        matches!(self, Mode::Controller | Mode::All)
    }

    fn node(self) -> bool {
        matches!(self, Mode::Node | Mode::All)
    }
}

#[derive(ValueEnum, Debug, Clone, Copy)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Parser, Debug)]
#[command(name = "rkcsi", version, about = "CSI plugin for Hetzner Cloud volumes")]
struct Args {
    /// Socket the plugin serves on (unix:///path or a plain path)
    #[arg(long, env = "CSI_ENDPOINT", default_value = "unix:///run/rkl/csi/hcloud.sock")]
    endpoint: String,

    /// Which services this process runs
    #[arg(long, value_enum, env = "RKCSI_MODE", default_value = "all")]
    mode: Mode,

    /// Cloud API token, required by the controller service
    #[arg(long, env = "HCLOUD_TOKEN", hide_env_values = true)]
    token: Option<String>,

    /// Cloud API base URL
    #[arg(long, env = "HCLOUD_ENDPOINT", default_value = DEFAULT_ENDPOINT)]
    api_endpoint: String,

    /// Instance metadata base URL
    #[arg(long, env = "HCLOUD_METADATA_ENDPOINT", default_value = METADATA_ENDPOINT)]
    metadata_endpoint: String,

    /// Id of this server; looked up from instance metadata when unset
    #[arg(long, env = "HCLOUD_NODE_ID")]
    node_id: Option<String>,

    /// Location of this server and default location for new volumes
    #[arg(long, env = "HCLOUD_LOCATION")]
    location: Option<String>,

    /// Delay between two action status polls, in milliseconds
    #[arg(long, default_value_t = 2000)]
    poll_interval_ms: u64,

    /// Upper bound for waiting on a single cloud action, in seconds
    #[arg(long, default_value_t = 120)]
    max_wait_secs: u64,

    /// Upper bound for a single RPC, in seconds
    #[arg(long, default_value_t = 300)]
    request_timeout_secs: u64,

    /// Maximum number of volumes attachable to this node
    #[arg(long, default_value_t = 16)]
    max_volumes: u64,

    /// Log output format
    #[arg(long, value_enum, env = "RKCSI_LOG_FORMAT", default_value = "text")]
    log_format: LogFormat,
}

fn init_tracing(format: LogFormat) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let registry = tracing_subscriber::registry().with(filter);
    match format {
        LogFormat::Text => registry.with(fmt::layer()).init(),
        LogFormat::Json => registry.with(fmt::layer().json()).init(),
    }
}

async fn shutdown_signal() {
    use tokio::signal::unix::{SignalKind, signal};

    match signal(SignalKind::terminate()) {
        Ok(mut term) => {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {}
                _ = term.recv() => {}
            }
        }
        Err(e) => {
            warn!(error = %e, "cannot listen for SIGTERM, waiting for ctrl-c only");
            let _ = tokio::signal::ctrl_c().await;
        }
    }
    info!("shutdown signal received");
}

/// Fill in node id and location, asking the metadata service for what the
/// flags leave open.
async fn build_config(args: &Args) -> Result<DriverConfig> {
    let mut config = DriverConfig::default();
    config.wait.poll_interval = Duration::from_millis(args.poll_interval_ms);
    config.wait.max_wait = Duration::from_secs(args.max_wait_secs);
    config.request_timeout = Duration::from_secs(args.request_timeout_secs);
    config.operation_timeout = config.operation_timeout.min(config.request_timeout);
    config.max_volumes_per_node = args.max_volumes;

    let metadata = MetadataClient::new(args.metadata_endpoint.clone())
        .context("failed to build metadata client")?;

    config.node_id = match &args.node_id {
        Some(id) => id.as_str().into(),
        None if args.mode.node() => metadata
            .instance_id()
            .await
            .context("no --node-id given and instance metadata is unreachable")?,
        None => "".into(),
    };

    config.location = match &args.location {
        Some(location) => location.clone(),
        None if args.mode.node() => metadata
            .location()
            .await
            .context("no --location given and instance metadata is unreachable")?,
        None => DEFAULT_LOCATION.to_owned(),
    };
    Ok(config)
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_tracing(args.log_format);

    let socket = parse_endpoint(&args.endpoint).context("invalid --endpoint")?;
    let config = build_config(&args).await?;

    let mut driver = Driver::new();
    if args.mode.controller() {
        let Some(token) = args.token.as_deref().filter(|t| !t.is_empty()) else {
            bail!("the controller service needs a cloud API token (HCLOUD_TOKEN)");
        };
        let client = HcloudClient::new(args.api_endpoint.clone(), token)
            .context("failed to build cloud API client")?;
        let cloud: Arc<dyn CloudVolumes> = Arc::new(client);
        driver = driver.with_controller(ControllerService::new(cloud, config.clone()));
    }
    if args.mode.node() {
        let mounter: Arc<dyn Mounter> = Arc::new(LinuxMounter::new());
        driver = driver.with_node(NodeService::new(mounter, &config));
    }

    info!(
        mode = ?args.mode,
        node_id = %config.node_id,
        location = %config.location,
        socket = %socket.display(),
        "starting rkcsi"
    );

    let server = CsiServer::bind(&socket, Arc::new(driver), config.request_timeout)
        .await
        .with_context(|| format!("failed to bind {}", socket.display()))?;
    server
        .serve_with_shutdown(shutdown_signal())
        .await
        .context("CSI server failed")?;
    Ok(())
}
