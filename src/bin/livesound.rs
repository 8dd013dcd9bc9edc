//! livesound service
//!
//! Listens for raw PCM from network microphones and serves levels,
//! spectrograms and transcoded streams over HTTP.
//!
//! Usage: `livesound [config.toml]`

use anyhow::{Context, Result};
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use livesound::{
    config::AppConfig, sources::SourceRegistry, status::spawn_heartbeat, stream::StreamBridge,
    ui::WebServer,
};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Starting livesound");

    let config_path = std::env::args().nth(1).map(PathBuf::from);
    let config = AppConfig::load(config_path.as_deref()).context("failed to load configuration")?;

    for (name, port) in &config.sources {
        tracing::info!("Configured source '{}' on UDP port {}", name, port);
    }

    let registry = Arc::new(SourceRegistry::from_config(&config)?);
    let start_registry = registry.clone();
    tokio::task::spawn_blocking(move || start_registry.start()).await??;

    let heartbeat = spawn_heartbeat(&config.status, registry.clone());

    let bridge = StreamBridge::new(config.transcoder.clone(), config.stream.clone());
    let server = WebServer::new(config.server.clone(), registry.clone(), bridge);

    let served = server.run(shutdown_signal()).await;

    tracing::info!("Shutting down");
    if let Some(heartbeat) = heartbeat {
        heartbeat.abort();
    }
    let stop_registry = registry.clone();
    tokio::task::spawn_blocking(move || stop_registry.stop()).await?;

    served?;
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("Failed to listen for Ctrl-C: {}", e);
        std::future::pending::<()>().await;
    }
}
