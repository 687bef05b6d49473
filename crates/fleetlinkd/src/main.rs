//! # fleetlinkd
//!
//! Bridge server binary: wires configuration, metrics, and the
//! WebSocket transport together and runs until a shutdown signal.

#![deny(unsafe_code)]

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use fleetlink_bridge::InProcessBus;
use fleetlink_server::{BridgeConfig, BridgeServer};
use tracing_subscriber::EnvFilter;

/// Device RPC bridge server.
#[derive(Parser, Debug)]
#[command(name = "fleetlinkd", about = "Device RPC bridge server")]
struct Cli {
    /// Host to bind (overrides the config file).
    #[arg(long)]
    host: Option<String>,

    /// Port to bind (overrides the config file; 0 auto-assigns).
    #[arg(long)]
    port: Option<u16>,

    /// Path to a JSON config file.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Emit logs as JSON.
    #[arg(long)]
    json_logs: bool,
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    if json {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}

async fn wait_for_signal() -> Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm =
            signal(SignalKind::terminate()).context("failed to install SIGTERM handler")?;
        tokio::select! {
            result = tokio::signal::ctrl_c() => result.context("failed to listen for ctrl-c")?,
            _ = sigterm.recv() => {}
        }
        Ok(())
    }
    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c()
            .await
            .context("failed to listen for ctrl-c")
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Cli::parse();
    init_tracing(args.json_logs);

    let mut config = match &args.config {
        Some(path) => BridgeConfig::load(path)
            .with_context(|| format!("failed to load config from {}", path.display()))?,
        None => {
            let mut config = BridgeConfig::default();
            config.apply_env();
            config
        }
    };
    if let Some(host) = args.host {
        config.host = host;
    }
    if let Some(port) = args.port {
        config.port = port;
    }

    let metrics_handle = fleetlink_server::metrics::install_recorder();

    // Single-process bus: with one instance, calls for devices connected
    // elsewhere have no responder and fail fast.
    let bus = Arc::new(InProcessBus::new());
    let server =
        Arc::new(BridgeServer::new(config, Some(bus as _)).with_metrics(metrics_handle));

    let handle = server.listen().await.context("failed to bind server")?;
    tracing::info!(addr = %handle.addr, "fleetlinkd listening");

    wait_for_signal().await?;

    tracing::info!("shutting down");
    server.drain_and_stop().await;
    handle.join().await;
    tracing::info!("shutdown complete");
    Ok(())
}
