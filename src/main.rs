//! # Dispatch Gateway - Main Entry Point
//!
//! Startup sequence:
//!
//! 1. JSON structured logging through `tracing_subscriber`
//! 2. Configuration from `GATEWAY_CONFIG_PATH` (default `config/gateway.yaml`)
//! 3. Prometheus recorder, when enabled
//! 4. Gateway and admin listeners until SIGTERM or SIGINT

use std::sync::Arc;

use anyhow::Context;
use tokio::signal;
use tracing::{info, warn};

use dispatch_gateway::observability::metrics::install_prometheus_recorder;
use dispatch_gateway::{Gateway, GatewayConfig, GatewayServer};

const DEFAULT_CONFIG_PATH: &str = "config/gateway.yaml";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_logging();

    info!(version = env!("CARGO_PKG_VERSION"), "Starting dispatch gateway");

    let config_path =
        std::env::var("GATEWAY_CONFIG_PATH").unwrap_or_else(|_| DEFAULT_CONFIG_PATH.to_string());
    let config = GatewayConfig::load(&config_path)
        .await
        .with_context(|| format!("Failed to load configuration from {}", config_path))?;

    info!(
        path = %config_path,
        routes = config.routes.len(),
        port = config.server.port,
        admin_port = config.server.admin_port(),
        "Configuration loaded"
    );

    let prometheus = if config.metrics.enabled && config.metrics.prometheus_enabled {
        match install_prometheus_recorder() {
            Ok(handle) => Some(handle),
            Err(e) => {
                warn!(error = %e, "Prometheus recorder unavailable, continuing without it");
                None
            }
        }
    } else {
        None
    };

    let gateway = Arc::new(Gateway::new(config).context("Failed to build gateway")?);
    let server = GatewayServer::new(gateway, prometheus);

    server
        .run(shutdown_signal())
        .await
        .context("Gateway server failed")?;

    info!("Dispatch gateway shutdown complete");
    Ok(())
}

fn init_logging() {
    use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(true)
                .with_thread_ids(true)
                .with_file(true)
                .with_line_number(true)
                .json(),
        )
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "dispatch_gateway=info,tower_http=debug".into()),
        )
        .init();
}

/// Resolve on the first SIGTERM or SIGINT
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!(error = %e, "Failed to listen for SIGINT");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to install SIGTERM handler");
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
}
