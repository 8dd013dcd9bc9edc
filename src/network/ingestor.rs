//! Per-source UDP ingestion
//!
//! Every source gets its own listener and its own OS thread, so a silent or
//! flooded source never delays another. The thread blocks on the socket with
//! a short read timeout; the timeout doubles as the idle-check tick and
//! bounds how long `stop` waits.

use bytes::Bytes;
use std::io::ErrorKind;
use std::net::{SocketAddr, UdpSocket};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crate::audio::{create_shared_buffer, LevelMeter, SharedRingBuffer, SpectrumEngine};
use crate::config::{NetworkConfig, StreamConfig};
use crate::constants::MAX_DATAGRAM_SIZE;
use crate::error::NetworkError;
use crate::hub::{FrameKind, SubscriberHub};
use crate::network::udp::create_socket;
use crate::protocol::SourceState;
use crate::sources::metrics::SourceMetrics;

/// Ingestion for a single source
pub struct SourceIngestor {
    /// Source name, also the hub key
    name: Arc<str>,

    /// Port the listener actually bound
    port: u16,

    /// Listener, handed to the thread on start
    socket: Option<UdpSocket>,

    /// Analyser, handed to the thread on start
    engine: Option<SpectrumEngine>,

    /// Whether the receive loop should keep going
    running: Arc<AtomicBool>,

    metrics: Arc<SourceMetrics>,
    ring: SharedRingBuffer,
    hub: Arc<SubscriberHub>,
    config: StreamConfig,

    thread_handle: Option<JoinHandle<()>>,
}

impl SourceIngestor {
    /// Bind the listener for `name` on `port` (0 picks a free port).
    ///
    /// On success the source is Listening but no thread runs until
    /// [`start`](Self::start).
    pub fn bind(
        name: &str,
        port: u16,
        network: &NetworkConfig,
        config: &StreamConfig,
        hub: Arc<SubscriberHub>,
    ) -> Result<Self, NetworkError> {
        let metrics = Arc::new(SourceMetrics::new());

        let engine = SpectrumEngine::new(name, config).map_err(|e| NetworkError::BindFailed {
            port,
            reason: e.to_string(),
        })?;

        let addr = SocketAddr::new(network.listen_address, port);
        let socket = create_socket(addr, config.read_timeout(), network.recv_buffer_size)?;
        let port = socket
            .local_addr()
            .map(|a| a.port())
            .unwrap_or(port);

        metrics.set_state(SourceState::Listening);
        tracing::info!("Bound source '{}' to UDP {}:{}", name, network.listen_address, port);

        Ok(Self {
            name: Arc::from(name),
            port,
            socket: Some(socket),
            engine: Some(engine),
            running: Arc::new(AtomicBool::new(false)),
            metrics,
            ring: create_shared_buffer(config.ring_buffer_bytes()),
            hub,
            config: config.clone(),
            thread_handle: None,
        })
    }

    /// Launch the receive thread. Calling it again while running is a no-op.
    pub fn start(&mut self) -> Result<(), NetworkError> {
        if self.running.load(Ordering::SeqCst) {
            return Ok(());
        }

        let (socket, engine) = match (self.socket.take(), self.engine.take()) {
            (Some(socket), Some(engine)) => (socket, engine),
            _ => {
                return Err(NetworkError::Thread(format!(
                    "listener for '{}' is already closed",
                    self.name
                )))
            }
        };

        self.running.store(true, Ordering::SeqCst);

        let receive_loop = ReceiveLoop {
            name: self.name.clone(),
            socket,
            engine,
            running: self.running.clone(),
            metrics: self.metrics.clone(),
            ring: self.ring.clone(),
            hub: self.hub.clone(),
            meter: LevelMeter::new(),
            idle_timeout: self.config.idle_timeout(),
            check_interval: self.config.read_timeout(),
        };

        let handle = thread::Builder::new()
            .name(format!("ingest-{}", self.name))
            .spawn(move || receive_loop.run())
            .map_err(|e| {
                self.running.store(false, Ordering::SeqCst);
                NetworkError::Thread(e.to_string())
            })?;

        self.thread_handle = Some(handle);
        Ok(())
    }

    /// Stop the thread, release the port and close every subscriber queue
    /// of this source. Returns within about one read timeout.
    pub fn stop(&mut self) {
        self.running.store(false, Ordering::SeqCst);

        if let Some(handle) = self.thread_handle.take() {
            if handle.join().is_err() {
                tracing::error!("Ingestion thread for '{}' panicked", self.name);
            }
        }

        // Never started: release the listener here
        self.socket = None;
        self.engine = None;

        if self.metrics.state() != SourceState::Stopped {
            self.metrics.set_state(SourceState::Stopped);
            self.hub.close_all(&self.name);
            tracing::info!("Stopped source '{}'", self.name);
        }
    }

    /// Whether the receive thread is running
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn metrics(&self) -> &Arc<SourceMetrics> {
        &self.metrics
    }

    pub fn ring(&self) -> &SharedRingBuffer {
        &self.ring
    }
}

impl Drop for SourceIngestor {
    fn drop(&mut self) {
        self.stop();
    }
}

/// State owned by the ingestion thread
struct ReceiveLoop {
    name: Arc<str>,
    socket: UdpSocket,
    engine: SpectrumEngine,
    running: Arc<AtomicBool>,
    metrics: Arc<SourceMetrics>,
    ring: SharedRingBuffer,
    hub: Arc<SubscriberHub>,
    meter: LevelMeter,
    idle_timeout: Duration,
    check_interval: Duration,
}

impl ReceiveLoop {
    fn run(mut self) {
        // Sized for the largest UDP payload so no datagram is truncated
        let mut buf = vec![0u8; MAX_DATAGRAM_SIZE];
        let mut next_idle_check = Instant::now() + self.check_interval;

        tracing::info!("Ingestion loop started for '{}'", self.name);

        while self.running.load(Ordering::Relaxed) {
            match self.socket.recv_from(&mut buf) {
                Ok((0, _)) => {}
                Ok((n, _)) => self.process(&buf[..n]),
                Err(e) if matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) => {}
                Err(e) => {
                    if !self.running.load(Ordering::Relaxed) {
                        break;
                    }
                    tracing::warn!("Receive error on '{}': {}", self.name, e);
                    self.metrics.record_error(NetworkError::ReceiveFailed(e.to_string()));
                    // Avoid spinning on a persistent socket error
                    thread::sleep(self.check_interval);
                }
            }

            let now = Instant::now();
            if now >= next_idle_check {
                if self.metrics.mark_stale_if_idle(now, self.idle_timeout) {
                    tracing::info!("Source '{}' is stale, no audio for {:?}", self.name, self.idle_timeout);
                }
                next_idle_check = now + self.check_interval;
            }
        }

        tracing::info!("Ingestion loop for '{}' exited", self.name);
    }

    fn process(&mut self, chunk: &[u8]) {
        let level = self.meter.measure(chunk);
        if let Some(previous) = self.metrics.record_frame(level, chunk.len()) {
            tracing::info!("Source '{}' is active (was {:?})", self.name, previous);
        }

        self.ring.write(chunk);

        if self.hub.has_subscribers(&self.name, FrameKind::Audio) {
            self.hub.publish_audio(&self.name, Bytes::copy_from_slice(chunk));
        }

        for frame in self.engine.feed(chunk) {
            self.hub.publish_spectrum(&self.name, Arc::new(frame));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::IpAddr;

    fn loopback() -> NetworkConfig {
        NetworkConfig {
            listen_address: IpAddr::from([127, 0, 0, 1]),
            recv_buffer_size: None,
        }
    }

    fn fast_config() -> StreamConfig {
        StreamConfig {
            fft_window: 256,
            read_timeout_ms: 10,
            idle_timeout_ms: 100,
            ring_buffer_seconds: 1,
            ..Default::default()
        }
    }

    fn send_to(port: u16, payload: &[u8]) {
        let sender = UdpSocket::bind("127.0.0.1:0").unwrap();
        sender.send_to(payload, ("127.0.0.1", port)).unwrap();
    }

    fn wait_for<F: Fn() -> bool>(condition: F) -> bool {
        let deadline = Instant::now() + Duration::from_secs(2);
        while Instant::now() < deadline {
            if condition() {
                return true;
            }
            thread::sleep(Duration::from_millis(5));
        }
        false
    }

    #[test]
    fn test_bind_sets_listening() {
        let hub = Arc::new(SubscriberHub::new(8));
        let ingestor = SourceIngestor::bind("mic", 0, &loopback(), &fast_config(), hub).unwrap();
        assert_ne!(ingestor.port(), 0);
        assert_eq!(ingestor.metrics().state(), SourceState::Listening);
        assert!(!ingestor.is_running());
    }

    #[test]
    fn test_receives_and_goes_stale() {
        let hub = Arc::new(SubscriberHub::new(8));
        hub.register_source("mic");
        let mut audio = hub.subscribe_audio("mic").unwrap();

        let mut ingestor =
            SourceIngestor::bind("mic", 0, &loopback(), &fast_config(), hub.clone()).unwrap();
        ingestor.start().unwrap();

        let loud: Vec<u8> = [8000i16, -8000].repeat(256).iter().flat_map(|s| s.to_le_bytes()).collect();
        send_to(ingestor.port(), &loud);

        let metrics = ingestor.metrics().clone();
        assert!(wait_for(|| metrics.state() == SourceState::Active));
        assert!(metrics.rms_db() > -20.0);

        let deadline = Instant::now() + Duration::from_secs(2);
        let chunk = loop {
            if let Some(chunk) = audio.try_recv() {
                break chunk;
            }
            assert!(Instant::now() < deadline, "no audio delivered");
            thread::sleep(Duration::from_millis(5));
        };
        assert_eq!(chunk.len(), loud.len());
        assert_eq!(ingestor.ring().snapshot(), loud);

        // No more data: idle check flips it to stale
        assert!(wait_for(|| metrics.state() == SourceState::Stale));
        assert_eq!(metrics.rms_db(), -100.0);
        assert!(hub.has_source("mic"));

        ingestor.stop();
        assert_eq!(metrics.state(), SourceState::Stopped);
        assert!(!hub.has_source("mic"));
    }

    #[test]
    fn test_stop_is_bounded_without_traffic() {
        let hub = Arc::new(SubscriberHub::new(8));
        hub.register_source("quiet");
        let mut ingestor =
            SourceIngestor::bind("quiet", 0, &loopback(), &fast_config(), hub).unwrap();
        ingestor.start().unwrap();
        assert!(ingestor.is_running());

        let started = Instant::now();
        ingestor.stop();
        assert!(started.elapsed() < Duration::from_secs(1));
        assert!(!ingestor.is_running());
        assert_eq!(ingestor.metrics().snapshot().receive_errors, 0);
    }

    #[test]
    fn test_large_datagram_kept_whole() {
        let config = StreamConfig {
            read_timeout_ms: 10,
            ..Default::default()
        };
        assert!(24_576 > 2 * config.chunk_size * config.bytes_per_frame());

        let hub = Arc::new(SubscriberHub::new(8));
        hub.register_source("big");
        let mut audio = hub.subscribe_audio("big").unwrap();
        let mut ingestor = SourceIngestor::bind("big", 0, &loopback(), &config, hub.clone()).unwrap();
        ingestor.start().unwrap();

        let payload: Vec<u8> = (0..24_576u32).map(|i| (i % 251) as u8).collect();
        send_to(ingestor.port(), &payload);

        let metrics = ingestor.metrics().clone();
        assert!(wait_for(|| metrics.snapshot().bytes_received == payload.len() as u64));
        assert_eq!(metrics.snapshot().packets_received, 1);
        assert_eq!(ingestor.ring().snapshot(), payload);

        let deadline = Instant::now() + Duration::from_secs(2);
        let chunk = loop {
            if let Some(chunk) = audio.try_recv() {
                break chunk;
            }
            assert!(Instant::now() < deadline, "no audio delivered");
            thread::sleep(Duration::from_millis(5));
        };
        assert_eq!(chunk.len(), payload.len());

        ingestor.stop();
    }

    #[test]
    fn test_audio_skipped_without_listeners() {
        let hub = Arc::new(SubscriberHub::new(8));
        hub.register_source("mic");
        let mut ingestor = SourceIngestor::bind("mic", 0, &loopback(), &fast_config(), hub.clone()).unwrap();
        ingestor.start().unwrap();

        send_to(ingestor.port(), &[1u8; 64]);
        let metrics = ingestor.metrics().clone();
        assert!(wait_for(|| metrics.snapshot().packets_received == 1));

        // A late listener only sees audio that arrives after it joined
        let mut audio = hub.subscribe_audio("mic").unwrap();
        assert!(audio.try_recv().is_none());
        assert_eq!(hub.dropped_frames("mic"), 0);

        send_to(ingestor.port(), &[2u8; 32]);
        let deadline = Instant::now() + Duration::from_secs(2);
        let chunk = loop {
            if let Some(chunk) = audio.try_recv() {
                break chunk;
            }
            assert!(Instant::now() < deadline, "no audio delivered");
            thread::sleep(Duration::from_millis(5));
        };
        assert_eq!(chunk.as_ref(), &[2u8; 32]);

        ingestor.stop();
    }

    #[test]
    fn test_stop_releases_port() {
        let hub = Arc::new(SubscriberHub::new(8));
        let mut ingestor = SourceIngestor::bind("a", 0, &loopback(), &fast_config(), hub.clone()).unwrap();
        let port = ingestor.port();
        ingestor.start().unwrap();
        ingestor.stop();

        let again = SourceIngestor::bind("b", port, &loopback(), &fast_config(), hub);
        assert!(again.is_ok());
    }

    #[test]
    fn test_restart_after_stop_fails() {
        let hub = Arc::new(SubscriberHub::new(8));
        let mut ingestor = SourceIngestor::bind("r", 0, &loopback(), &fast_config(), hub).unwrap();
        ingestor.stop();
        assert!(matches!(ingestor.start(), Err(NetworkError::Thread(_))));
    }
}
