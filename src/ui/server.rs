//! HTTP server wiring

use axum::{
    routing::{delete, get},
    Router,
};
use std::future::Future;
use std::sync::Arc;
use std::time::Instant;
use tower_http::cors::CorsLayer;

use crate::config::ServerConfig;
use crate::error::Result;
use crate::sources::SourceRegistry;
use crate::stream::StreamBridge;
use crate::ui::{handlers, websocket};

/// Shared state of every request handler
pub struct AppState {
    pub registry: Arc<SourceRegistry>,
    pub bridge: StreamBridge,
    pub started_at: Instant,
}

/// HTTP and WebSocket front end of the registry
pub struct WebServer {
    config: ServerConfig,
    state: Arc<AppState>,
}

impl WebServer {
    pub fn new(config: ServerConfig, registry: Arc<SourceRegistry>, bridge: StreamBridge) -> Self {
        Self {
            config,
            state: Arc::new(AppState {
                registry,
                bridge,
                started_at: Instant::now(),
            }),
        }
    }

    pub fn router(&self) -> Router {
        create_router(self.state.clone())
    }

    /// Serve until `shutdown` resolves, then finish in-flight requests
    pub async fn run<F>(self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let addr = format!("{}:{}", self.config.bind_address, self.config.http_port);
        let listener = tokio::net::TcpListener::bind(&addr).await?;
        tracing::info!("HTTP API listening on http://{}", listener.local_addr()?);

        axum::serve(listener, self.router())
            .with_graceful_shutdown(shutdown)
            .await?;

        tracing::info!("HTTP API stopped");
        Ok(())
    }
}

/// Build the API routes
pub fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/", get(handlers::index))
        .route("/health", get(handlers::health))
        .route(
            "/sources",
            get(handlers::list_sources).post(handlers::add_source),
        )
        .route("/sources/:name", delete(handlers::remove_source))
        .route("/sources/:name/snapshot", get(handlers::source_snapshot))
        .route("/stream", get(handlers::stream_audio))
        .route("/ws/spectrogram", get(websocket::spectrogram_ws))
        .layer(CorsLayer::permissive())
        .with_state(state)
}
