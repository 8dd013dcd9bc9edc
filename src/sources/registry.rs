//! Authoritative map of sources and their ingestors
//!
//! Lifecycle changes (add, remove, start, stop) are serialized by one
//! registry-wide guard, so a name or port is never held by two ingestors.
//! Readers (status, subscribe, snapshot) only take the map's read lock.

use bytes::Bytes;
use parking_lot::{Mutex, RwLock};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::audio::SpectrumFrame;
use crate::config::{AppConfig, NetworkConfig, StreamConfig};
use crate::constants::{DEFAULT_SOURCE_NAME, SILENCE_DB};
use crate::error::{Result, SourceError};
use crate::hub::{SubscriberHub, Subscription};
use crate::network::SourceIngestor;
use crate::protocol::{SourceState, SourceStatus};

/// Configured source whose listener could not be bound at start
#[derive(Debug, Clone)]
struct FailedSource {
    port: u16,
    reason: String,
}

/// Owner of every source of the service
pub struct SourceRegistry {
    stream: StreamConfig,
    network: NetworkConfig,
    /// Sources bound by `start`
    configured: BTreeMap<String, u16>,
    hub: Arc<SubscriberHub>,
    sources: RwLock<BTreeMap<String, SourceIngestor>>,
    /// Reported in state `error` until re-added or removed; holds no port
    failed: RwLock<BTreeMap<String, FailedSource>>,
    lifecycle: Mutex<()>,
    running: AtomicBool,
    stopped: AtomicBool,
}

impl SourceRegistry {
    /// Create a registry. Nothing is bound until [`start`](Self::start) or
    /// [`add_source`](Self::add_source).
    pub fn new(
        stream: StreamConfig,
        network: NetworkConfig,
        configured: BTreeMap<String, u16>,
    ) -> Result<Self> {
        stream.validate()?;
        let hub = Arc::new(SubscriberHub::new(stream.queue_capacity));

        Ok(Self {
            stream,
            network,
            configured,
            hub,
            sources: RwLock::new(BTreeMap::new()),
            failed: RwLock::new(BTreeMap::new()),
            lifecycle: Mutex::new(()),
            running: AtomicBool::new(false),
            stopped: AtomicBool::new(false),
        })
    }

    pub fn from_config(config: &AppConfig) -> Result<Self> {
        Self::new(
            config.stream.clone(),
            config.network.clone(),
            config.sources.clone(),
        )
    }

    /// Bind every configured source and launch all ingestion threads.
    ///
    /// A configured source whose port cannot be bound is logged and listed in
    /// state `error`; the others keep running.
    pub fn start(&self) -> Result<()> {
        if self.stopped.load(Ordering::SeqCst) {
            return Err(SourceError::Stopped("registry".to_string()).into());
        }

        let _guard = self.lifecycle.lock();
        if self.running.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        for (name, &port) in &self.configured {
            if self.sources.read().contains_key(name) {
                continue;
            }
            if let Err(e) = self.bind_locked(name, port) {
                tracing::error!("Source '{}' unavailable: {}", name, e);
                self.failed.write().insert(
                    name.clone(),
                    FailedSource {
                        port,
                        reason: e.to_string(),
                    },
                );
            }
        }

        let mut sources = self.sources.write();
        for (name, ingestor) in sources.iter_mut() {
            if let Err(e) = ingestor.start() {
                tracing::error!("Failed to start ingestion for '{}': {}", name, e);
            }
        }

        tracing::info!("Source registry started with {} source(s)", sources.len());
        Ok(())
    }

    /// Tear down every source. Idempotent.
    pub fn stop(&self) {
        let _guard = self.lifecycle.lock();
        self.stopped.store(true, Ordering::SeqCst);
        if !self.running.swap(false, Ordering::SeqCst) && self.sources.read().is_empty() {
            return;
        }

        self.failed.write().clear();
        let drained = std::mem::take(&mut *self.sources.write());
        for (_, mut ingestor) in drained {
            ingestor.stop();
        }

        tracing::info!("Source registry stopped");
    }

    /// Register and bind a new source, starting its ingestion when the
    /// registry is running.
    pub fn add_source(&self, name: &str, port: u16) -> Result<()> {
        if name.is_empty() || name.contains('/') {
            return Err(SourceError::InvalidName(name.to_string()).into());
        }

        let _guard = self.lifecycle.lock();
        if self.stopped.load(Ordering::SeqCst) {
            return Err(SourceError::Stopped(name.to_string()).into());
        }

        self.bind_locked(name, port)?;
        if self.failed.write().remove(name).is_some() {
            tracing::info!("Source '{}' recovered on port {}", name, port);
        }

        if self.running.load(Ordering::SeqCst) {
            let mut sources = self.sources.write();
            if let Some(ingestor) = sources.get_mut(name) {
                if let Err(e) = ingestor.start() {
                    // Leave no half-started source behind
                    if let Some(mut ingestor) = sources.remove(name) {
                        ingestor.stop();
                    }
                    return Err(e.into());
                }
            }
        }

        Ok(())
    }

    /// Caller holds the lifecycle guard
    fn bind_locked(&self, name: &str, port: u16) -> Result<()> {
        {
            let sources = self.sources.read();
            if sources.contains_key(name) {
                return Err(SourceError::AlreadyExists(name.to_string()).into());
            }
            if port != 0 {
                if let Some(owner) = sources.values().find(|s| s.port() == port) {
                    return Err(SourceError::PortInUse {
                        port,
                        owner: owner.name().to_string(),
                    }
                    .into());
                }
            }
        }

        let ingestor =
            SourceIngestor::bind(name, port, &self.network, &self.stream, self.hub.clone())
                .map_err(|e| {
                    tracing::error!("Failed to bind source '{}' on port {}: {}", name, port, e);
                    e
                })?;

        self.hub.register_source(name);
        self.sources.write().insert(name.to_string(), ingestor);
        Ok(())
    }

    /// Stop a source's ingestion, close its subscriber queues and forget it
    pub fn remove_source(&self, name: &str) -> Result<()> {
        let _guard = self.lifecycle.lock();

        let removed = self.sources.write().remove(name);
        let Some(mut ingestor) = removed else {
            return match self.failed.write().remove(name) {
                Some(_) => {
                    tracing::info!("Removed failed source '{}'", name);
                    Ok(())
                }
                None => Err(SourceError::NotFound(name.to_string()).into()),
            };
        };

        // Joins the ingestion thread first, so nothing publishes after close
        ingestor.stop();

        tracing::info!("Removed source '{}'", name);
        Ok(())
    }

    /// Summaries of all sources in name order, failed ones included
    pub fn list_sources(&self) -> Vec<SourceStatus> {
        let mut statuses: Vec<SourceStatus> = self
            .sources
            .read()
            .values()
            .map(|ingestor| self.status_of(ingestor))
            .collect();
        statuses.extend(
            self.failed
                .read()
                .iter()
                .map(|(name, failed)| failed_status(name, failed)),
        );
        statuses.sort_by(|a, b| a.name.cmp(&b.name));
        statuses
    }

    pub fn status(&self, name: &str) -> Result<SourceStatus> {
        if let Some(ingestor) = self.sources.read().get(name) {
            return Ok(self.status_of(ingestor));
        }
        self.failed
            .read()
            .get(name)
            .map(|failed| failed_status(name, failed))
            .ok_or_else(|| SourceError::NotFound(name.to_string()).into())
    }

    fn status_of(&self, ingestor: &SourceIngestor) -> SourceStatus {
        let metrics = ingestor.metrics().snapshot();
        let (spectrogram_subscribers, audio_subscribers) =
            self.hub.subscriber_counts(ingestor.name());

        SourceStatus {
            name: ingestor.name().to_string(),
            port: ingestor.port(),
            active: metrics.state == SourceState::Active,
            rms_db: metrics.rms_db,
            state: metrics.state,
            packets_received: metrics.packets_received,
            bytes_received: metrics.bytes_received,
            last_frame_at: metrics.last_frame_at,
            spectrogram_subscribers,
            audio_subscribers,
            dropped_frames: self.hub.dropped_frames(ingestor.name()),
            receive_errors: metrics.receive_errors,
            last_error: metrics.last_error,
        }
    }

    /// Copy of the recent PCM kept for a source
    pub fn snapshot(&self, name: &str) -> Result<Bytes> {
        self.sources
            .read()
            .get(name)
            .map(|ingestor| Bytes::from(ingestor.ring().snapshot()))
            .ok_or_else(|| SourceError::NotFound(name.to_string()).into())
    }

    /// Map a client's source choice to a registered name.
    ///
    /// `None` or `"default"` picks the source named `default`, else the first
    /// source in name order.
    pub fn resolve(&self, requested: Option<&str>) -> Result<String> {
        let requested = requested.filter(|s| !s.is_empty());

        if self.stopped.load(Ordering::SeqCst) {
            let name = requested.unwrap_or(DEFAULT_SOURCE_NAME);
            return Err(SourceError::Stopped(name.to_string()).into());
        }

        let sources = self.sources.read();
        match requested {
            Some(name) if name != DEFAULT_SOURCE_NAME => {
                if sources.contains_key(name) {
                    Ok(name.to_string())
                } else {
                    Err(SourceError::NotFound(name.to_string()).into())
                }
            }
            _ => {
                if sources.contains_key(DEFAULT_SOURCE_NAME) {
                    return Ok(DEFAULT_SOURCE_NAME.to_string());
                }
                sources
                    .keys()
                    .next()
                    .cloned()
                    .ok_or_else(|| SourceError::NotFound(DEFAULT_SOURCE_NAME.to_string()).into())
            }
        }
    }

    pub fn subscribe_spectrogram(
        &self,
        requested: Option<&str>,
    ) -> Result<Subscription<Arc<SpectrumFrame>>> {
        let name = self.resolve(requested)?;
        Ok(self.hub.subscribe_spectrogram(&name)?)
    }

    pub fn subscribe_audio(&self, requested: Option<&str>) -> Result<Subscription<Bytes>> {
        let name = self.resolve(requested)?;
        Ok(self.hub.subscribe_audio(&name)?)
    }

    pub fn hub(&self) -> &Arc<SubscriberHub> {
        &self.hub
    }

    pub fn stream_config(&self) -> &StreamConfig {
        &self.stream
    }

    pub fn source_count(&self) -> usize {
        self.sources.read().len()
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }
}

fn failed_status(name: &str, failed: &FailedSource) -> SourceStatus {
    SourceStatus {
        name: name.to_string(),
        port: failed.port,
        active: false,
        rms_db: SILENCE_DB,
        state: SourceState::Error,
        packets_received: 0,
        bytes_received: 0,
        last_frame_at: None,
        spectrogram_subscribers: 0,
        audio_subscribers: 0,
        dropped_frames: 0,
        receive_errors: 0,
        last_error: Some(failed.reason.clone()),
    }
}

impl Drop for SourceRegistry {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{Error, NetworkError};
    use std::net::{IpAddr, UdpSocket};
    use std::time::Duration;

    fn registry_with(configured: &[(&str, u16)]) -> SourceRegistry {
        let stream = StreamConfig {
            fft_window: 256,
            read_timeout_ms: 10,
            idle_timeout_ms: 200,
            ring_buffer_seconds: 1,
            queue_capacity: 8,
            ..Default::default()
        };
        let network = NetworkConfig {
            listen_address: IpAddr::from([127, 0, 0, 1]),
            recv_buffer_size: None,
        };
        let configured = configured
            .iter()
            .map(|(name, port)| (name.to_string(), *port))
            .collect();
        SourceRegistry::new(stream, network, configured).unwrap()
    }

    fn free_port() -> u16 {
        UdpSocket::bind("127.0.0.1:0").unwrap().local_addr().unwrap().port()
    }

    #[test]
    fn test_start_binds_configured_sources() {
        let registry = registry_with(&[("front", 0), ("back", 0)]);
        registry.start().unwrap();

        let sources = registry.list_sources();
        assert_eq!(sources.len(), 2);
        assert_eq!(sources[0].name, "back");
        assert_eq!(sources[1].name, "front");
        for source in &sources {
            assert!(!source.active);
            assert_eq!(source.rms_db, -100.0);
            assert_eq!(source.state, SourceState::Listening);
            assert_ne!(source.port, 0);
        }

        registry.stop();
        assert!(registry.list_sources().is_empty());
        // Idempotent
        registry.stop();
    }

    #[test]
    fn test_duplicate_name_keeps_original() {
        let registry = registry_with(&[]);
        registry.start().unwrap();

        let first = free_port();
        let second = free_port();
        registry.add_source("mic1", first).unwrap();

        let err = registry.add_source("mic1", second).unwrap_err();
        assert!(matches!(err, Error::Source(SourceError::AlreadyExists(_))));
        assert_eq!(registry.status("mic1").unwrap().port, first);
    }

    #[test]
    fn test_duplicate_port_rejected() {
        let registry = registry_with(&[]);
        let port = free_port();
        registry.add_source("a", port).unwrap();

        let err = registry.add_source("b", port).unwrap_err();
        assert!(matches!(err, Error::Source(SourceError::PortInUse { .. })));
        assert_eq!(registry.source_count(), 1);
    }

    #[test]
    fn test_bind_failure_leaves_others_untouched() {
        let registry = registry_with(&[]);
        registry.start().unwrap();
        registry.add_source("ok", 0).unwrap();

        let holder = UdpSocket::bind("127.0.0.1:0").unwrap();
        let taken = holder.local_addr().unwrap().port();

        let err = registry.add_source("blocked", taken).unwrap_err();
        assert!(matches!(err, Error::Network(NetworkError::BindFailed { .. })));
        assert!(registry.status("blocked").is_err());
        assert_eq!(registry.status("ok").unwrap().state, SourceState::Listening);
    }

    #[test]
    fn test_unbindable_configured_source_reports_error() {
        let holder = UdpSocket::bind("127.0.0.1:0").unwrap();
        let taken = holder.local_addr().unwrap().port();

        let registry = registry_with(&[("blocked", taken), ("ok", 0)]);
        registry.start().unwrap();

        let sources = registry.list_sources();
        assert_eq!(sources.len(), 2);
        assert_eq!(sources[0].name, "blocked");
        assert_eq!(sources[0].state, SourceState::Error);
        assert_eq!(sources[0].port, taken);
        assert!(!sources[0].active);
        assert_eq!(sources[0].rms_db, -100.0);
        assert!(sources[0].last_error.is_some());
        assert_eq!(sources[1].state, SourceState::Listening);

        let json = serde_json::to_value(&sources[0]).unwrap();
        assert_eq!(json["state"], "error");

        // Failed entries hold no port and cannot be subscribed to
        assert!(registry.resolve(Some("blocked")).unwrap_err().is_not_found());
        assert_eq!(registry.resolve(None).unwrap(), "ok");

        // Retrying once the port is free recovers the source
        drop(holder);
        registry.add_source("blocked", taken).unwrap();
        let status = registry.status("blocked").unwrap();
        assert_eq!(status.state, SourceState::Listening);
        assert!(status.last_error.is_none());
        assert_eq!(registry.list_sources().len(), 2);
    }

    #[test]
    fn test_remove_failed_source() {
        let holder = UdpSocket::bind("127.0.0.1:0").unwrap();
        let taken = holder.local_addr().unwrap().port();

        let registry = registry_with(&[("blocked", taken)]);
        registry.start().unwrap();
        assert_eq!(registry.status("blocked").unwrap().state, SourceState::Error);

        registry.remove_source("blocked").unwrap();
        assert!(registry.list_sources().is_empty());
        assert!(registry.remove_source("blocked").unwrap_err().is_not_found());
    }

    #[test]
    fn test_invalid_names() {
        let registry = registry_with(&[]);
        assert!(matches!(
            registry.add_source("", 0),
            Err(Error::Source(SourceError::InvalidName(_)))
        ));
        assert!(matches!(
            registry.add_source("a/b", 0),
            Err(Error::Source(SourceError::InvalidName(_)))
        ));
    }

    #[test]
    fn test_remove_unknown_is_not_found() {
        let registry = registry_with(&[]);
        let err = registry.remove_source("ghost").unwrap_err();
        assert!(err.is_not_found());
    }

    #[test]
    fn test_resolve_default_fallback() {
        let registry = registry_with(&[]);
        assert!(registry.resolve(None).unwrap_err().is_not_found());

        registry.add_source("zeta", 0).unwrap();
        registry.add_source("alpha", 0).unwrap();
        assert_eq!(registry.resolve(None).unwrap(), "alpha");
        assert_eq!(registry.resolve(Some("default")).unwrap(), "alpha");
        assert_eq!(registry.resolve(Some("zeta")).unwrap(), "zeta");
        assert!(registry.resolve(Some("nope")).is_err());

        registry.add_source("default", 0).unwrap();
        assert_eq!(registry.resolve(Some("")).unwrap(), "default");
    }

    #[test]
    fn test_stopped_registry_rejects_work() {
        let registry = registry_with(&[("front", 0)]);
        registry.start().unwrap();
        registry.stop();

        assert!(matches!(
            registry.add_source("late", 0),
            Err(Error::Source(SourceError::Stopped(_)))
        ));
        assert!(registry.subscribe_audio(Some("front")).unwrap_err().is_not_found());
        assert!(registry.start().is_err());
    }

    #[tokio::test]
    async fn test_remove_wakes_subscriber() {
        let registry = Arc::new(registry_with(&[]));
        registry.start().unwrap();
        registry.add_source("mic", 0).unwrap();

        let mut sub = registry.subscribe_spectrogram(Some("mic")).unwrap();
        let waiter = tokio::spawn(async move { sub.recv().await });

        tokio::time::sleep(Duration::from_millis(20)).await;
        let remover = registry.clone();
        tokio::task::spawn_blocking(move || remover.remove_source("mic"))
            .await
            .unwrap()
            .unwrap();

        let received = tokio::time::timeout(Duration::from_secs(2), waiter)
            .await
            .expect("subscriber still blocked")
            .unwrap();
        assert!(received.is_none());
        assert!(registry.list_sources().is_empty());
    }

    #[tokio::test]
    async fn test_stop_wakes_subscribers() {
        let registry = Arc::new(registry_with(&[("front", 0), ("back", 0)]));
        registry.start().unwrap();

        let mut spectrogram = registry.subscribe_spectrogram(Some("front")).unwrap();
        let mut audio = registry.subscribe_audio(Some("back")).unwrap();
        let waiter = tokio::spawn(async move { (spectrogram.recv().await, audio.recv().await) });

        tokio::time::sleep(Duration::from_millis(20)).await;
        let stopper = registry.clone();
        tokio::task::spawn_blocking(move || stopper.stop()).await.unwrap();

        let (frame, chunk) = tokio::time::timeout(Duration::from_secs(2), waiter)
            .await
            .expect("subscriber still blocked after stop")
            .unwrap();
        assert!(frame.is_none());
        assert!(chunk.is_none());
        assert!(!registry.is_running());
    }

    #[test]
    fn test_snapshot_and_counts() {
        let registry = registry_with(&[]);
        registry.start().unwrap();
        registry.add_source("mic", 0).unwrap();
        let port = registry.status("mic").unwrap().port;

        let _spec = registry.subscribe_spectrogram(Some("mic")).unwrap();
        let _audio = registry.subscribe_audio(None).unwrap();
        let status = registry.status("mic").unwrap();
        assert_eq!(status.spectrogram_subscribers, 1);
        assert_eq!(status.audio_subscribers, 1);

        let payload: Vec<u8> = (0..200u8).collect();
        let sender = UdpSocket::bind("127.0.0.1:0").unwrap();
        sender.send_to(&payload, ("127.0.0.1", port)).unwrap();

        let deadline = std::time::Instant::now() + Duration::from_secs(2);
        while registry.snapshot("mic").unwrap().is_empty() {
            assert!(std::time::Instant::now() < deadline);
            std::thread::sleep(Duration::from_millis(5));
        }

        assert_eq!(registry.snapshot("mic").unwrap(), Bytes::from(payload));
        assert_eq!(registry.status("mic").unwrap().packets_received, 1);
        assert!(registry.snapshot("other").is_err());
    }
}
