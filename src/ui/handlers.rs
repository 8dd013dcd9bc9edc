//! HTTP API handlers

use axum::{
    body::Body,
    extract::{Path, Query, State},
    http::{header, StatusCode},
    response::{Html, IntoResponse, Response},
    Json,
};
use std::sync::Arc;

use crate::error::{Error, NetworkError, SourceError};
use crate::protocol::{
    ErrorResponse, HealthStatus, SourceActionResponse, SourceConfig, SourceQuery, SourceStatus,
};
use crate::ui::server::AppState;

/// Status code for a failed request
pub fn error_status(error: &Error) -> StatusCode {
    match error {
        Error::Source(SourceError::NotFound(_)) | Error::Source(SourceError::Stopped(_)) => {
            StatusCode::NOT_FOUND
        }
        Error::Source(SourceError::AlreadyExists(_)) | Error::Source(SourceError::PortInUse { .. }) => {
            StatusCode::CONFLICT
        }
        Error::Source(SourceError::InvalidName(_)) => StatusCode::BAD_REQUEST,
        Error::Network(NetworkError::BindFailed { .. }) => StatusCode::BAD_REQUEST,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

pub fn error_reply(error: Error) -> (StatusCode, Json<ErrorResponse>) {
    let status = error_status(&error);
    if status.is_server_error() {
        tracing::error!("Request failed: {}", error);
    }
    (
        status,
        Json(ErrorResponse {
            error: error.to_string(),
        }),
    )
}

/// Liveness banner
pub async fn index() -> Html<&'static str> {
    Html("<html><body><h1>livesound</h1><p>Audio ingestion service is running.</p></body></html>")
}

pub async fn health(State(state): State<Arc<AppState>>) -> Json<HealthStatus> {
    Json(HealthStatus {
        status: "ok".to_string(),
        uptime_seconds: state.started_at.elapsed().as_secs(),
        source_count: state.registry.source_count(),
    })
}

/// List all sources
pub async fn list_sources(State(state): State<Arc<AppState>>) -> Json<Vec<SourceStatus>> {
    Json(state.registry.list_sources())
}

/// Register a source and bind its port
pub async fn add_source(
    State(state): State<Arc<AppState>>,
    Json(config): Json<SourceConfig>,
) -> Result<Json<SourceActionResponse>, (StatusCode, Json<ErrorResponse>)> {
    let registry = state.registry.clone();
    let name = config.name.clone();

    let result = tokio::task::spawn_blocking(move || registry.add_source(&config.name, config.port))
        .await
        .map_err(|e| Error::Io(std::io::Error::new(std::io::ErrorKind::Other, e)))
        .and_then(|r| r);

    match result {
        Ok(()) => Ok(Json(SourceActionResponse::added(name))),
        Err(e) => Err(error_reply(e)),
    }
}

/// Stop and forget a source
pub async fn remove_source(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
) -> Result<Json<SourceActionResponse>, (StatusCode, Json<ErrorResponse>)> {
    let registry = state.registry.clone();
    let target = name.clone();

    // Joins the ingestion thread, keep it off the async workers
    let result = tokio::task::spawn_blocking(move || registry.remove_source(&target))
        .await
        .map_err(|e| Error::Io(std::io::Error::new(std::io::ErrorKind::Other, e)))
        .and_then(|r| r);

    match result {
        Ok(()) => Ok(Json(SourceActionResponse::removed(name))),
        Err(e) => Err(error_reply(e)),
    }
}

/// Recent raw PCM of a source
pub async fn source_snapshot(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
) -> Response {
    match state.registry.snapshot(&name) {
        Ok(pcm) => ([(header::CONTENT_TYPE, "application/octet-stream")], pcm).into_response(),
        Err(e) => error_reply(e).into_response(),
    }
}

/// Chunked, transcoded listening stream
pub async fn stream_audio(
    State(state): State<Arc<AppState>>,
    Query(query): Query<SourceQuery>,
) -> Response {
    let subscription = match state.registry.subscribe_audio(query.source.as_deref()) {
        Ok(subscription) => subscription,
        Err(e) => return error_reply(e).into_response(),
    };

    match state.bridge.spawn(subscription) {
        Ok(transcoded) => {
            let content_type = transcoded.content_type().to_string();
            (
                [
                    (header::CONTENT_TYPE, content_type),
                    (header::CACHE_CONTROL, "no-cache".to_string()),
                ],
                Body::from_stream(transcoded.into_stream()),
            )
                .into_response()
        }
        Err(e) => error_reply(e.into()).into_response(),
    }
}
