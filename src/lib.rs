//! # livesound
//!
//! Real-time ingestion of raw PCM from many network microphones, with live
//! loudness metering, spectrogram push and transcoded listening streams.
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌──────────────┐   ┌──────────────┐   ┌──────────────┐
//! │ Mic "front"  │   │ Mic "back"   │   │ Mic "pond"   │      UDP, s16le PCM
//! └──────┬───────┘   └──────┬───────┘   └──────┬───────┘
//!        ▼                  ▼                  ▼
//! ┌─────────────────────────────────────────────────────────────────────┐
//! │                 Source Registry (sources::registry)                  │
//! │  ┌──────────────┐   ┌──────────────┐   ┌──────────────┐             │
//! │  │  Ingestor    │   │  Ingestor    │   │  Ingestor    │  one thread │
//! │  │  thread      │   │  thread      │   │  thread      │  per source │
//! │  ├──────────────┤   ├──────────────┤   ├──────────────┤             │
//! │  │ RMS / Ring   │   │ RMS / Ring   │   │ RMS / Ring   │             │
//! │  │ Spectrum FFT │   │ Spectrum FFT │   │ Spectrum FFT │             │
//! │  └──────┬───────┘   └──────┬───────┘   └──────┬───────┘             │
//! └─────────┼──────────────────┼──────────────────┼─────────────────────┘
//!           ▼                  ▼                  ▼
//! ┌─────────────────────────────────────────────────────────────────────┐
//! │        Subscriber Hub (hub) - bounded queue per subscriber          │
//! │        non-blocking try_send, drop newest when full                 │
//! └──────────────┬──────────────────────────────────┬───────────────────┘
//!                ▼                                  ▼
//!     ┌─────────────────────┐            ┌─────────────────────┐
//!     │ /ws/spectrogram     │            │ Stream Bridge       │
//!     │ JSON dB frames      │            │ PCM -> ffmpeg -> mp3│
//!     └─────────────────────┘            └──────────┬──────────┘
//!                                                   ▼
//!                                          GET /stream (chunked)
//! ```

pub mod audio;
pub mod config;
pub mod error;
pub mod hub;
pub mod network;
pub mod protocol;
pub mod sources;
pub mod status;
pub mod stream;
pub mod ui;

pub use error::{Error, Result};

/// Application-wide constants
pub mod constants {
    /// Default sample rate of incoming PCM
    pub const DEFAULT_SAMPLE_RATE: u32 = 48000;

    /// Default channel count (mono field recorders)
    pub const DEFAULT_CHANNELS: u16 = 1;

    /// Default nominal samples per datagram
    pub const DEFAULT_CHUNK_SIZE: usize = 4096;

    /// Default FFT window in samples
    pub const DEFAULT_FFT_WINDOW: usize = 2048;

    /// Default bounded queue capacity per subscriber
    pub const DEFAULT_QUEUE_CAPACITY: usize = 100;

    /// Default seconds of PCM kept per source
    pub const DEFAULT_RING_BUFFER_SECONDS: u32 = 5;

    /// Default time without frames before a source goes stale
    pub const DEFAULT_IDLE_TIMEOUT_MS: u64 = 5000;

    /// Default socket read timeout
    pub const DEFAULT_READ_TIMEOUT_MS: u64 = 100;

    /// Default HTTP port for the API
    pub const DEFAULT_HTTP_PORT: u16 = 8000;

    /// Default UDP port of the `default` source
    pub const DEFAULT_SOURCE_PORT: u16 = 1234;

    /// Bytes per s16le sample
    pub const BYTES_PER_SAMPLE: usize = 2;

    /// Largest UDP payload
    pub const MAX_DATAGRAM_SIZE: usize = 65_507;

    /// Loudness reported when there is no signal
    pub const SILENCE_DB: f32 = -100.0;

    /// Name resolved when a client does not pick a source
    pub const DEFAULT_SOURCE_NAME: &str = "default";
}
