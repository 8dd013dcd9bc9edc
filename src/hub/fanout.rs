//! Per-source fan-out of raw audio and spectrum frames
//!
//! Producers are the ingestion threads; consumers are async tasks. Each
//! subscriber owns a bounded tokio channel and the producer only ever calls
//! `try_send`, so a slow consumer loses frames (the newest one is dropped)
//! instead of stalling ingestion or its neighbours.

use bytes::Bytes;
use chrono::Utc;
use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc::{self, error::TrySendError};
use uuid::Uuid;

use crate::audio::SpectrumFrame;
use crate::error::SourceError;
use crate::hub::subscription::{FrameKind, Subscription, SubscriptionHandle};

/// One subscriber's sending half, opaque outside the hub
pub struct Slot<T> {
    id: Uuid,
    tx: mpsc::Sender<T>,
    dropped: Arc<AtomicU64>,
}

impl<T> Clone for Slot<T> {
    fn clone(&self) -> Self {
        Self {
            id: self.id,
            tx: self.tx.clone(),
            dropped: self.dropped.clone(),
        }
    }
}

/// Subscriber sets of one source
#[derive(Default)]
pub struct SourceSubscribers {
    spectrogram: Vec<Slot<Arc<SpectrumFrame>>>,
    audio: Vec<Slot<Bytes>>,
    /// Drops across all subscribers, including ones already gone
    dropped: Arc<AtomicU64>,
}

/// Payload types the hub can route, one per [`FrameKind`]
pub trait HubPayload: Clone + Send + 'static {
    const KIND: FrameKind;

    #[doc(hidden)]
    fn slots(subscribers: &SourceSubscribers) -> &Vec<Slot<Self>>;

    #[doc(hidden)]
    fn slots_mut(subscribers: &mut SourceSubscribers) -> &mut Vec<Slot<Self>>;
}

impl HubPayload for Bytes {
    const KIND: FrameKind = FrameKind::Audio;

    fn slots(subscribers: &SourceSubscribers) -> &Vec<Slot<Self>> {
        &subscribers.audio
    }

    fn slots_mut(subscribers: &mut SourceSubscribers) -> &mut Vec<Slot<Self>> {
        &mut subscribers.audio
    }
}

impl HubPayload for Arc<SpectrumFrame> {
    const KIND: FrameKind = FrameKind::Spectrogram;

    fn slots(subscribers: &SourceSubscribers) -> &Vec<Slot<Self>> {
        &subscribers.spectrogram
    }

    fn slots_mut(subscribers: &mut SourceSubscribers) -> &mut Vec<Slot<Self>> {
        &mut subscribers.spectrogram
    }
}

/// Result of one publish call
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PublishOutcome {
    pub delivered: usize,
    /// Subscribers whose queue was full
    pub dropped: usize,
    /// Subscribers found closed and pruned
    pub pruned: usize,
}

/// Registry of subscriber queues keyed by source name
pub struct SubscriberHub {
    sources: DashMap<String, SourceSubscribers>,
    capacity: usize,
}

impl SubscriberHub {
    /// Create a hub whose queues hold `capacity` payloads each
    pub fn new(capacity: usize) -> Self {
        Self {
            sources: DashMap::new(),
            capacity: capacity.max(1),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Make a source subscribable. Idempotent.
    pub fn register_source(&self, source: &str) {
        self.sources.entry(source.to_string()).or_default();
    }

    pub fn has_source(&self, source: &str) -> bool {
        self.sources.contains_key(source)
    }

    /// Open a queue for payloads of type `T` from `source`
    pub fn subscribe<T: HubPayload>(&self, source: &str) -> Result<Subscription<T>, SourceError> {
        let mut entry = self
            .sources
            .get_mut(source)
            .ok_or_else(|| SourceError::NotFound(source.to_string()))?;

        let (tx, rx) = mpsc::channel(self.capacity);
        let dropped = Arc::new(AtomicU64::new(0));
        let id = Uuid::new_v4();

        T::slots_mut(&mut entry).push(Slot {
            id,
            tx,
            dropped: dropped.clone(),
        });
        drop(entry);

        tracing::debug!("New {:?} subscriber {} on '{}'", T::KIND, id, source);

        let handle = SubscriptionHandle {
            id,
            source: source.to_string(),
            kind: T::KIND,
        };
        Ok(Subscription::new(handle, rx, dropped, Utc::now()))
    }

    pub fn subscribe_spectrogram(
        &self,
        source: &str,
    ) -> Result<Subscription<Arc<SpectrumFrame>>, SourceError> {
        self.subscribe(source)
    }

    pub fn subscribe_audio(&self, source: &str) -> Result<Subscription<Bytes>, SourceError> {
        self.subscribe(source)
    }

    /// Remove and close one queue. Returns false if it was already gone.
    pub fn unsubscribe(&self, handle: &SubscriptionHandle) -> bool {
        let Some(mut entry) = self.sources.get_mut(&handle.source) else {
            return false;
        };

        let removed = match handle.kind {
            FrameKind::Spectrogram => remove_slot(&mut entry.spectrogram, handle.id),
            FrameKind::Audio => remove_slot(&mut entry.audio, handle.id),
        };
        if removed {
            tracing::debug!("Removed {:?} subscriber {} on '{}'", handle.kind, handle.id, handle.source);
        }
        removed
    }

    /// Offer a payload to every live subscriber of `source` without blocking.
    ///
    /// The subscriber list is copied out first so no lock is held while
    /// enqueueing. Full queues drop this payload; closed queues are pruned.
    pub fn publish<T: HubPayload>(&self, source: &str, payload: T) -> PublishOutcome {
        let (targets, source_dropped) = match self.sources.get(source) {
            Some(entry) if !T::slots(&entry).is_empty() => {
                (T::slots(&entry).clone(), entry.dropped.clone())
            }
            _ => return PublishOutcome::default(),
        };

        let mut outcome = PublishOutcome::default();
        let mut closed = Vec::new();

        for slot in &targets {
            match slot.tx.try_send(payload.clone()) {
                Ok(()) => outcome.delivered += 1,
                Err(TrySendError::Full(_)) => {
                    slot.dropped.fetch_add(1, Ordering::Relaxed);
                    source_dropped.fetch_add(1, Ordering::Relaxed);
                    outcome.dropped += 1;
                }
                Err(TrySendError::Closed(_)) => closed.push(slot.id),
            }
        }
        drop(targets);

        if !closed.is_empty() {
            if let Some(mut entry) = self.sources.get_mut(source) {
                T::slots_mut(&mut entry).retain(|slot| !closed.contains(&slot.id));
            }
            outcome.pruned = closed.len();
        }

        outcome
    }

    pub fn publish_audio(&self, source: &str, chunk: Bytes) -> PublishOutcome {
        self.publish(source, chunk)
    }

    pub fn publish_spectrum(&self, source: &str, frame: Arc<SpectrumFrame>) -> PublishOutcome {
        self.publish(source, frame)
    }

    /// Close every queue of `source` and forget it. Readers drain what is
    /// already queued, then see end-of-stream.
    pub fn close_all(&self, source: &str) -> usize {
        match self.sources.remove(source) {
            Some((_, subscribers)) => {
                let closed = subscribers.spectrogram.len() + subscribers.audio.len();
                if closed > 0 {
                    tracing::debug!("Closed {} subscriber queue(s) of '{}'", closed, source);
                }
                closed
            }
            None => 0,
        }
    }

    /// Whether anyone is listening for `kind` on `source`
    pub fn has_subscribers(&self, source: &str, kind: FrameKind) -> bool {
        self.sources
            .get(source)
            .map(|entry| match kind {
                FrameKind::Spectrogram => entry.spectrogram.iter().any(|s| !s.tx.is_closed()),
                FrameKind::Audio => entry.audio.iter().any(|s| !s.tx.is_closed()),
            })
            .unwrap_or(false)
    }

    /// Live `(spectrogram, audio)` subscriber counts
    pub fn subscriber_counts(&self, source: &str) -> (usize, usize) {
        self.sources
            .get(source)
            .map(|entry| {
                (
                    entry.spectrogram.iter().filter(|s| !s.tx.is_closed()).count(),
                    entry.audio.iter().filter(|s| !s.tx.is_closed()).count(),
                )
            })
            .unwrap_or((0, 0))
    }

    /// Frames dropped on full queues for `source`
    pub fn dropped_frames(&self, source: &str) -> u64 {
        self.sources
            .get(source)
            .map(|entry| entry.dropped.load(Ordering::Relaxed))
            .unwrap_or(0)
    }
}

fn remove_slot<T>(slots: &mut Vec<Slot<T>>, id: Uuid) -> bool {
    let before = slots.len();
    slots.retain(|slot| slot.id != id);
    slots.len() != before
}
