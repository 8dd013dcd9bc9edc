//! Consumer side of a hub queue

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use uuid::Uuid;

/// What a subscription carries
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum FrameKind {
    Spectrogram,
    Audio,
}

/// Identifies one subscription inside the hub
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscriptionHandle {
    pub id: Uuid,
    pub source: String,
    pub kind: FrameKind,
}

/// Receiving end of a bounded delivery queue.
///
/// `recv` returns `None` once the hub closed the queue (unsubscribe, source
/// removal or shutdown) and everything already queued has been read.
/// Dropping the subscription is enough to detach it; the next publish for
/// the source prunes the dead slot.
pub struct Subscription<T> {
    handle: SubscriptionHandle,
    rx: mpsc::Receiver<T>,
    dropped: Arc<AtomicU64>,
    created_at: DateTime<Utc>,
}

impl<T> Subscription<T> {
    pub(crate) fn new(
        handle: SubscriptionHandle,
        rx: mpsc::Receiver<T>,
        dropped: Arc<AtomicU64>,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self {
            handle,
            rx,
            dropped,
            created_at,
        }
    }

    /// Wait for the next payload
    pub async fn recv(&mut self) -> Option<T> {
        self.rx.recv().await
    }

    /// Take a queued payload without waiting
    pub fn try_recv(&mut self) -> Option<T> {
        self.rx.try_recv().ok()
    }

    pub fn handle(&self) -> &SubscriptionHandle {
        &self.handle
    }

    pub fn source(&self) -> &str {
        &self.handle.source
    }

    pub fn kind(&self) -> FrameKind {
        self.handle.kind
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    /// Payloads discarded because this queue was full
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

impl<T> std::fmt::Debug for Subscription<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("handle", &self.handle)
            .field("dropped", &self.dropped())
            .field("created_at", &self.created_at)
            .finish()
    }
}
