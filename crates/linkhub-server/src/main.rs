//! # Linkhub Server
//!
//! Accepts device connections on configured tunnels and bridges them onto
//! the message bus.
//!
//! ## Usage
//!
//! ```bash
//! # Run with default settings
//! linkhub
//!
//! # Run with a specific config file
//! LINKHUB_CONFIG=/path/to/linkhub.toml linkhub
//!
//! # Override the HTTP API address
//! LINKHUB_PORT=8080 LINKHUB_HOST=0.0.0.0 linkhub
//! ```

mod config;
mod handlers;
mod metrics;
mod tap;

use anyhow::Result;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "linkhub=debug,linkhub_core=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = match std::env::var("LINKHUB_CONFIG") {
        Ok(path) => config::Config::from_file(path)?,
        Err(_) => config::Config::load()?,
    };

    tracing::info!(
        "Starting Linkhub on {}:{} with {} tunnel(s)",
        config.host,
        config.port,
        config.tunnels.len()
    );

    metrics::init_metrics();

    handlers::run_server(config).await?;

    Ok(())
}
