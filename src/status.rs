//! Heartbeat file for external supervisors

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use crate::config::StatusConfig;
use crate::error::Result;
use crate::protocol::SourceStatus;
use crate::sources::SourceRegistry;

#[derive(Debug, Clone, Serialize)]
pub struct Heartbeat {
    pub service: &'static str,
    pub timestamp: DateTime<Utc>,
    pub status: &'static str,
    pub pid: u32,
    pub sources: Vec<SourceStatus>,
}

impl Heartbeat {
    pub fn collect(registry: &SourceRegistry) -> Self {
        Self {
            service: "livesound",
            timestamp: Utc::now(),
            status: if registry.is_running() { "Running" } else { "Stopped" },
            pid: std::process::id(),
            sources: registry.list_sources(),
        }
    }
}

/// Replace `path` with `heartbeat` through a temporary sibling file, so
/// readers never see a half-written document
pub async fn write_heartbeat(path: &Path, heartbeat: &Heartbeat) -> Result<()> {
    let json = serde_json::to_vec_pretty(heartbeat).map_err(std::io::Error::from)?;

    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp = PathBuf::from(tmp);

    tokio::fs::write(&tmp, json).await?;
    tokio::fs::rename(&tmp, path).await?;
    Ok(())
}

/// Spawn the periodic heartbeat writer. Returns `None` when no file is
/// configured.
pub fn spawn_heartbeat(
    config: &StatusConfig,
    registry: Arc<SourceRegistry>,
) -> Option<tokio::task::JoinHandle<()>> {
    let path = config.file.clone()?;
    let period = Duration::from_secs(config.interval_secs.max(1));

    tracing::info!("Writing status heartbeat to {}", path.display());

    Some(tokio::spawn(async move {
        let mut interval = tokio::time::interval(period);
        loop {
            interval.tick().await;
            let heartbeat = Heartbeat::collect(&registry);
            if let Err(e) = write_heartbeat(&path, &heartbeat).await {
                tracing::warn!("Failed to write heartbeat {}: {}", path.display(), e);
            }
        }
    }))
}
