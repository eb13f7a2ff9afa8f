//! # ws-relay-server - Main Application Entry Point
//!
//! Hosts the relay as a standalone process.
//!
//! ## What happens at startup:
//! 1. **Loads `.env`** so local overrides work without exporting variables
//! 2. **Sets up logging** (`RUST_LOG`, default `ws_relay_server=debug`)
//! 3. **Loads and validates configuration** (defaults → config.toml → environment)
//! 4. **Runs the server** until SIGINT/SIGTERM, then shuts down gracefully

use anyhow::Result;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use ws_relay_server::{AppConfig, Server};

#[tokio::main]
async fn main() -> Result<()> {
    // It's fine if there's no .env file
    dotenv::dotenv().ok();

    init_tracing()?;

    let config = AppConfig::load()?;
    config.validate()?;

    info!("Starting ws-relay-server v{}", env!("CARGO_PKG_VERSION"));
    info!("Configuration loaded: {}", config.bind_address());

    let server = Server::new(config);
    spawn_signal_listener(server.shutdown_token());

    let runner = Arc::clone(&server);
    match tokio::spawn(async move { runner.run().await }).await {
        Ok(Ok(())) => info!("Server stopped gracefully"),
        Ok(Err(e)) => {
            error!("Server error: {}", e);
            return Err(e.into());
        }
        Err(e) => {
            error!("Server task error: {}", e);
            return Err(e.into());
        }
    }

    Ok(())
}

/// Install the tracing subscriber.
///
/// `RUST_LOG` controls the filter, e.g. `ws_relay_server=trace` to see every
/// connection state transition.
fn init_tracing() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "ws_relay_server=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .try_init()?;

    Ok(())
}

/// Cancel `shutdown` on SIGINT (Ctrl+C) or SIGTERM.
fn spawn_signal_listener(shutdown: CancellationToken) {
    tokio::spawn(async move {
        wait_for_signal().await;
        shutdown.cancel();
    });
}

#[cfg(unix)]
async fn wait_for_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigterm = match signal(SignalKind::terminate()) {
        Ok(sigterm) => sigterm,
        Err(e) => {
            warn!("Failed to install SIGTERM handler: {}", e);
            wait_for_ctrl_c().await;
            return;
        }
    };

    tokio::select! {
        _ = sigterm.recv() => info!("Received SIGTERM"),
        _ = wait_for_ctrl_c() => info!("Received SIGINT"),
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() {
    wait_for_ctrl_c().await;
    info!("Received Ctrl+C");
}

async fn wait_for_ctrl_c() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        // Without a signal handler the server can only be stopped by killing it.
        warn!("Failed to listen for Ctrl+C: {}", e);
        std::future::pending::<()>().await;
    }
}
