//! # Tether Server
//!
//! Realtime server speaking the Tether protocol over WebSocket.
//!
//! ## Usage
//!
//! ```bash
//! # Run with default settings
//! tether
//!
//! # Run with environment variables
//! TETHER_PORT=8080 TETHER_HOST=0.0.0.0 tether
//! ```
//!
//! Settings are read from `tether.toml`, `/etc/tether/tether.toml` or
//! `~/.config/tether/tether.toml`, whichever is found first.

mod config;
mod handlers;
mod metrics;

use anyhow::Result;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "tether=debug,tether_transport=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Load configuration
    let config = config::Config::load()?;

    tracing::info!("Starting Tether server on {}:{}", config.host, config.port);

    // Initialize metrics
    metrics::init_metrics();

    // Start the server
    handlers::run_server(config).await?;

    Ok(())
}
