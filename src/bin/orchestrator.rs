//! Recorral orchestrator binary
//!
//! Single-instance control plane: HTTP ingress plus the health and metrics
//! loops, warm-restarted from the repository when one is reachable.

use recorral::api;
use recorral::config::OrchestratorConfig;
use recorral::dispatch::{HttpNodeRpc, NodeRpc};
use recorral::orchestrator::Orchestrator;
use recorral::repository::{MemoryRepository, Repository};
use recorral::telemetry;

use clap::Parser;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tracing::info;

/// Recorral recording-fleet orchestrator
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// HTTP API port
    #[arg(long, env = "RECORRAL_HTTP_PORT", default_value = "8090")]
    http_port: u16,

    /// Base URL recorders use to reach the event callback endpoint
    #[arg(long, env = "RECORRAL_CALLBACK_URL")]
    callback_url: Option<String>,

    /// Health loop cadence in seconds
    #[arg(long, env = "RECORRAL_HEALTH_INTERVAL_SECS", default_value = "30")]
    health_interval_secs: u64,

    /// Heartbeat staleness threshold in seconds
    #[arg(long, env = "RECORRAL_NODE_TIMEOUT_SECS", default_value = "60")]
    node_timeout_secs: u64,

    /// Metrics aggregation cadence in seconds
    #[arg(long, env = "RECORRAL_METRICS_INTERVAL_SECS", default_value = "15")]
    metrics_interval_secs: u64,

    /// Cap on concurrent recordings per recorder node
    #[arg(long, env = "RECORRAL_MAX_CONCURRENT_PER_NODE", default_value = "6")]
    max_concurrent_per_node: u32,

    /// Log level
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Emit JSON logs
    #[arg(long)]
    log_json: bool,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    telemetry::init_logging(telemetry::parse_level(&args.log_level), args.log_json);
    info!("Starting Recorral orchestrator");

    let config = OrchestratorConfig {
        health_check_interval: Duration::from_secs(args.health_interval_secs),
        node_timeout: Duration::from_secs(args.node_timeout_secs),
        metrics_interval: Duration::from_secs(args.metrics_interval_secs),
        max_concurrent_per_node: args.max_concurrent_per_node,
        callback_base_url: args
            .callback_url
            .unwrap_or_else(|| format!("http://127.0.0.1:{}", args.http_port)),
        ..OrchestratorConfig::default()
    };

    let repository: Arc<dyn Repository> = Arc::new(MemoryRepository::new());
    info!("Using in-memory repository (development mode)");

    let rpc: Arc<dyn NodeRpc> = Arc::new(HttpNodeRpc::new(config.rpc.clone()));

    let orchestrator = Orchestrator::new(config, repository, rpc).await;
    let loops = orchestrator.start();

    let app = api::build_router(orchestrator.clone());
    let addr = SocketAddr::from(([0, 0, 0, 0], args.http_port));
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!("API listening on {}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    for handle in loops {
        handle.abort();
    }
    info!("Shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    let _ = signal::ctrl_c().await;
    info!("Received shutdown signal");
}
