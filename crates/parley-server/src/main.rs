//! # Parley broker
//!
//! Central relay for the Parley chat system: accepts client connections and
//! forwards each client's messages to everyone else.
//!
//! ## Usage
//!
//! ```bash
//! # Run with default settings
//! parleyd
//!
//! # Run with a custom config
//! parleyd /path/to/parley.toml
//!
//! # Run with environment overrides
//! PARLEY_PORT=7500 PARLEY_HOST=0.0.0.0 parleyd
//! ```

mod config;
mod metrics;
mod relay;

use anyhow::Result;
use parley_transport::{WsConfig, WsListener};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "parley=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Load configuration
    let config = match std::env::args().nth(1) {
        Some(path) => config::Config::from_file(path)?,
        None => config::Config::load()?,
    };

    tracing::info!("Starting Parley broker on {}:{}", config.host, config.port);

    // Initialize metrics
    metrics::init_metrics();
    if config.metrics.enabled {
        if let Err(e) = metrics::start_metrics_server(config.metrics.port) {
            tracing::error!("Failed to start metrics server: {}", e);
        }
    }

    // Bind the transport and run the relay until ctrl-c
    let listener = WsListener::new(WsConfig {
        bind_addr: config.bind_addr(),
        max_message_size: config.limits.max_message_size,
    })
    .await?;

    let relay = relay::Relay::new(config);
    relay.serve_until_ctrl_c(Box::new(listener)).await?;

    Ok(())
}
