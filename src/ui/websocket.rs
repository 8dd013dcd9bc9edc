//! Spectrogram push over WebSocket

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Query, State,
    },
    http::StatusCode,
    response::{IntoResponse, Response},
};
use std::sync::Arc;

use crate::audio::SpectrumFrame;
use crate::hub::{SubscriberHub, Subscription};
use crate::protocol::{SourceQuery, SpectrogramMessage};
use crate::ui::handlers::error_reply;
use crate::ui::server::AppState;

/// `GET /ws/spectrogram?source=<name>`
///
/// The subscription is opened before the upgrade so an unknown source is a
/// plain 404 instead of a socket that closes immediately.
pub async fn spectrogram_ws(
    State(state): State<Arc<AppState>>,
    Query(query): Query<SourceQuery>,
    ws: Option<WebSocketUpgrade>,
) -> Response {
    let subscription = match state.registry.subscribe_spectrogram(query.source.as_deref()) {
        Ok(subscription) => subscription,
        Err(e) => return error_reply(e).into_response(),
    };

    let Some(ws) = ws else {
        state.registry.hub().unsubscribe(subscription.handle());
        return (StatusCode::BAD_REQUEST, "WebSocket upgrade required").into_response();
    };

    let hub = state.registry.hub().clone();
    ws.on_upgrade(move |socket| push_spectrogram(socket, subscription, hub))
}

async fn push_spectrogram(
    mut socket: WebSocket,
    mut subscription: Subscription<Arc<SpectrumFrame>>,
    hub: Arc<SubscriberHub>,
) {
    tracing::debug!("Spectrogram client connected to '{}'", subscription.source());

    loop {
        tokio::select! {
            frame = subscription.recv() => {
                let Some(frame) = frame else {
                    // Source removed or service stopping
                    let _ = socket.send(Message::Close(None)).await;
                    break;
                };

                let text = match serde_json::to_string(&SpectrogramMessage::from(frame.as_ref())) {
                    Ok(text) => text,
                    Err(e) => {
                        tracing::warn!("Failed to encode spectrum frame: {}", e);
                        continue;
                    }
                };

                if socket.send(Message::Text(text)).await.is_err() {
                    break;
                }
            }
            msg = socket.recv() => {
                match msg {
                    Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                    _ => {}
                }
            }
        }
    }

    hub.unsubscribe(subscription.handle());
    tracing::debug!(
        "Spectrogram client left '{}' ({} frames dropped)",
        subscription.source(),
        subscription.dropped()
    );
}
