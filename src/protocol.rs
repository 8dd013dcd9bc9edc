//! Wire types of the HTTP and WebSocket API

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::audio::SpectrumFrame;

/// Lifecycle of a source
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceState {
    /// Accepted, listener not bound yet
    Registered,
    /// Bound and waiting for the first frame
    Listening,
    /// Frames are arriving
    Active,
    /// No frame within the idle timeout
    Stale,
    /// Listener closed
    Stopped,
    /// Listener could not be bound
    Error,
}

/// Body of `POST /sources`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceConfig {
    pub name: String,
    pub port: u16,
}

/// Entry of `GET /sources`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceStatus {
    pub name: String,
    pub port: u16,
    /// Frames are currently arriving
    pub active: bool,
    pub rms_db: f32,
    pub state: SourceState,
    pub packets_received: u64,
    pub bytes_received: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_frame_at: Option<DateTime<Utc>>,
    pub spectrogram_subscribers: usize,
    pub audio_subscribers: usize,
    pub dropped_frames: u64,
    #[serde(default)]
    pub receive_errors: u64,
    /// Latest receive or bind failure
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

/// Reply to add/remove requests
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SourceActionResponse {
    pub status: String,
    pub name: String,
}

impl SourceActionResponse {
    pub fn added(name: impl Into<String>) -> Self {
        Self {
            status: "added".to_string(),
            name: name.into(),
        }
    }

    pub fn removed(name: impl Into<String>) -> Self {
        Self {
            status: "removed".to_string(),
            name: name.into(),
        }
    }
}

/// Error body for failed requests
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
}

/// Body of `GET /health`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthStatus {
    pub status: String,
    pub uptime_seconds: u64,
    pub source_count: usize,
}

/// Push message carrying one spectrum frame
#[derive(Debug, Clone, Serialize)]
pub struct SpectrogramMessage<'a> {
    #[serde(rename = "type")]
    pub kind: &'static str,
    pub source: &'a str,
    pub data: &'a [f32],
}

impl<'a> From<&'a SpectrumFrame> for SpectrogramMessage<'a> {
    fn from(frame: &'a SpectrumFrame) -> Self {
        Self {
            kind: "spectrogram",
            source: &frame.source,
            data: &frame.data,
        }
    }
}

/// Query string of the streaming endpoints
#[derive(Debug, Clone, Default, Deserialize)]
pub struct SourceQuery {
    pub source: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_spectrogram_message_shape() {
        let frame = SpectrumFrame {
            source: Arc::from("front"),
            sequence: 0,
            data: vec![-3.5, -100.0],
        };
        let json = serde_json::to_value(SpectrogramMessage::from(&frame)).unwrap();
        assert_eq!(
            json,
            serde_json::json!({"type": "spectrogram", "source": "front", "data": [-3.5, -100.0]})
        );
    }

    #[test]
    fn test_state_serialization() {
        assert_eq!(serde_json::to_string(&SourceState::Stale).unwrap(), "\"stale\"");
    }
}
