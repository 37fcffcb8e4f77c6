//! Tunnel HA bridge server binary

use anyhow::Context;
use bridge_server::{BridgeServer, Config, setup_tracing};
use clap::Parser;
use common::LogFormat;
use std::path::PathBuf;

/// Liveness and failover engine for HA VPN bridges
#[derive(Debug, Parser)]
#[command(name = "bridge-server", version, about)]
struct Args {
    /// Configuration file; the default search path is used when omitted
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Log level, overrides the configured one
    #[arg(long)]
    log_level: Option<String>,

    /// Log format (text or json), overrides the configured one
    #[arg(long)]
    log_format: Option<LogFormat>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // Can't use tracing yet - not initialized
    let config = Config::load(args.config.as_deref()).context("failed to load configuration")?;

    let log_level = args
        .log_level
        .or_else(|| config.logging.level.clone())
        .unwrap_or_else(|| "info".to_string());
    let log_format = args.log_format.or(config.logging.format).unwrap_or_default();

    // Telemetry guard will flush spans on drop
    let _telemetry_guard = setup_tracing(
        &config.telemetry.service_name,
        &config.telemetry.otlp_endpoint,
        config.telemetry.enabled,
        &log_level,
        log_format,
    )
    .context("failed to initialize tracing")?;

    tracing::info!(version = env!("CARGO_PKG_VERSION"), "Tunnel HA bridge server starting");

    let server = BridgeServer::new(config.to_server_config());
    server.run().await.context("bridge server failed")?;

    Ok(())
}
