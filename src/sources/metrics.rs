//! Externally readable state of one source
//!
//! The ingestion thread is the only writer of these values; HTTP handlers and
//! the status heartbeat read them. Everything the thread needs privately
//! (socket, spectrum accumulator) lives in the ingestor instead.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use crate::constants::SILENCE_DB;
use crate::protocol::SourceState;

struct Live {
    state: SourceState,
    rms_db: f32,
    last_frame_at: Option<Instant>,
    last_frame_wall: Option<DateTime<Utc>>,
    last_error: Option<String>,
}

/// Point-in-time copy of [`SourceMetrics`]
#[derive(Debug, Clone, PartialEq)]
pub struct MetricsSnapshot {
    pub state: SourceState,
    pub rms_db: f32,
    pub last_frame_at: Option<DateTime<Utc>>,
    pub packets_received: u64,
    pub bytes_received: u64,
    pub receive_errors: u64,
    pub last_error: Option<String>,
}

/// Loudness, counters and lifecycle state of a source
pub struct SourceMetrics {
    live: Mutex<Live>,
    packets_received: AtomicU64,
    bytes_received: AtomicU64,
    receive_errors: AtomicU64,
}

impl SourceMetrics {
    pub fn new() -> Self {
        Self {
            live: Mutex::new(Live {
                state: SourceState::Registered,
                rms_db: SILENCE_DB,
                last_frame_at: None,
                last_frame_wall: None,
                last_error: None,
            }),
            packets_received: AtomicU64::new(0),
            bytes_received: AtomicU64::new(0),
            receive_errors: AtomicU64::new(0),
        }
    }

    pub fn state(&self) -> SourceState {
        self.live.lock().state
    }

    pub fn set_state(&self, state: SourceState) {
        let mut live = self.live.lock();
        live.state = state;
        if !matches!(state, SourceState::Active) {
            live.rms_db = SILENCE_DB;
        }
    }

    pub fn rms_db(&self) -> f32 {
        self.live.lock().rms_db
    }

    /// Record a received chunk. Returns the previous state when this frame
    /// moved the source to Active.
    pub fn record_frame(&self, rms_db: f32, bytes: usize) -> Option<SourceState> {
        self.packets_received.fetch_add(1, Ordering::Relaxed);
        self.bytes_received.fetch_add(bytes as u64, Ordering::Relaxed);

        let mut live = self.live.lock();
        live.last_frame_at = Some(Instant::now());
        live.last_frame_wall = Some(Utc::now());
        live.rms_db = rms_db;

        let previous = live.state;
        match previous {
            SourceState::Listening | SourceState::Stale | SourceState::Registered => {
                live.state = SourceState::Active;
                Some(previous)
            }
            _ => None,
        }
    }

    /// Count a failed socket read and keep its message for status reports
    pub fn record_error(&self, error: impl ToString) {
        self.receive_errors.fetch_add(1, Ordering::Relaxed);
        self.live.lock().last_error = Some(error.to_string());
    }

    /// Move Active -> Stale when no frame arrived within `idle_timeout`.
    /// Returns true on transition.
    pub fn mark_stale_if_idle(&self, now: Instant, idle_timeout: Duration) -> bool {
        let mut live = self.live.lock();
        if live.state != SourceState::Active {
            return false;
        }
        let idle = live
            .last_frame_at
            .map(|at| now.saturating_duration_since(at) > idle_timeout)
            .unwrap_or(true);
        if idle {
            live.state = SourceState::Stale;
            live.rms_db = SILENCE_DB;
        }
        idle
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let live = self.live.lock();
        MetricsSnapshot {
            state: live.state,
            rms_db: live.rms_db,
            last_frame_at: live.last_frame_wall,
            packets_received: self.packets_received.load(Ordering::Relaxed),
            bytes_received: self.bytes_received.load(Ordering::Relaxed),
            receive_errors: self.receive_errors.load(Ordering::Relaxed),
            last_error: live.last_error.clone(),
        }
    }
}

impl Default for SourceMetrics {
    fn default() -> Self {
        Self::new()
    }
}
