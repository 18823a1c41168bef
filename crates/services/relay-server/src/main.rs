//! Relay server binary entry point
//!
//! Holds the provider API key and exposes the `/api/avatar/*` endpoints
//! negotiators talk to.
//!
//! # Usage
//!
//! ```bash
//! # Key from the environment, defaults for everything else
//! DUET_PROVIDER_API_KEY=... cargo run -p duet-relay-server
//!
//! # TOML configuration with a bind override
//! cargo run -p duet-relay-server -- --config duet.toml --port 9090
//! ```

use anyhow::Result;
use clap::Parser;
use duet_core::Config;
use duet_relay::{ProviderClient, RelayServer};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::signal;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Duet relay server
///
/// Forwards avatar session calls to the provider, attaching the account
/// key server-side.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// TOML configuration file; `DUET_*` variables still override it
    #[arg(short, long, env = "DUET_CONFIG")]
    config: Option<PathBuf>,

    /// Bind host (overrides configuration)
    #[arg(long)]
    host: Option<String>,

    /// Bind port (overrides configuration)
    #[arg(short, long)]
    port: Option<u16>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let mut config = Config::load(args.config.as_deref())?;
    if let Some(host) = args.host {
        config.server.host = host;
    }
    if let Some(port) = args.port {
        config.server.port = port;
    }

    info!(
        version = duet_core::VERSION,
        provider = %config.provider.base_url,
        timeout_s = config.provider.request_timeout_seconds,
        idle_timeout_s = config.provider.idle_timeout_seconds,
        "Duet relay server starting"
    );

    let provider = ProviderClient::from_config(&config.provider)?;
    if !provider.has_api_key() {
        warn!("No provider API key configured; token requests will fail until DUET_PROVIDER_API_KEY is set");
    }

    let bind_address = format!("{}:{}", config.server.host, config.server.port);
    let server = RelayServer::new(bind_address, Arc::new(provider));
    server
        .serve_with_shutdown(async {
            shutdown_signal().await;
            info!("Shutdown signal received, stopping relay server");
        })
        .await?;

    info!("Relay server shutdown complete");
    Ok(())
}

/// Wait for SIGTERM or SIGINT
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!("Failed to listen for Ctrl+C: {}", e);
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
                warn!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
