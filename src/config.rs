//! Service configuration
//!
//! Configuration is read once at startup from a TOML file (if any), then
//! patched from environment variables. Nothing here is reloaded at runtime:
//! changing the stream parameters requires restarting ingestion.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::constants::*;
use crate::error::{Error, Result, SpectrumError};

/// Environment variable overriding the HTTP bind address
pub const ENV_HOST: &str = "LIVESOUND_HOST";

/// Environment variable overriding the HTTP port
pub const ENV_PORT: &str = "LIVESOUND_PORT";

/// Environment variable with the initial source map (`front:1234,back:1235`)
pub const ENV_LISTEN_PORTS: &str = "LIVESOUND_LISTEN_PORTS";

/// Top-level application configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub network: NetworkConfig,
    pub stream: StreamConfig,
    pub transcoder: TranscoderConfig,
    pub status: StatusConfig,
    /// Sources bound when the registry starts, name -> UDP port
    pub sources: BTreeMap<String, u16>,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            network: NetworkConfig::default(),
            stream: StreamConfig::default(),
            transcoder: TranscoderConfig::default(),
            status: StatusConfig::default(),
            sources: default_sources(),
        }
    }
}

/// HTTP server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub bind_address: String,
    pub http_port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0".to_string(),
            http_port: DEFAULT_HTTP_PORT,
        }
    }
}

/// UDP ingestion socket configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// Address every source listener binds to
    pub listen_address: IpAddr,
    /// SO_RCVBUF override in bytes
    pub recv_buffer_size: Option<usize>,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            listen_address: IpAddr::from([0, 0, 0, 0]),
            recv_buffer_size: None,
        }
    }
}

/// Stream parameters shared by every source
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamConfig {
    /// Sample rate of incoming PCM in Hz
    pub sample_rate: u32,
    /// Interleaved channels in incoming PCM
    pub channels: u16,
    /// Nominal samples per datagram
    pub chunk_size: usize,
    /// Samples per FFT frame
    pub fft_window: usize,
    /// Samples to advance between FFT frames; `None` means `fft_window`
    pub hop_length: Option<usize>,
    /// Bounded queue capacity per subscriber
    pub queue_capacity: usize,
    /// Seconds of raw PCM kept in each source's ring buffer
    pub ring_buffer_seconds: u32,
    /// Time without frames before a source is considered stale
    pub idle_timeout_ms: u64,
    /// Socket read timeout, bounds idle checks and shutdown latency
    pub read_timeout_ms: u64,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            sample_rate: DEFAULT_SAMPLE_RATE,
            channels: DEFAULT_CHANNELS,
            chunk_size: DEFAULT_CHUNK_SIZE,
            fft_window: DEFAULT_FFT_WINDOW,
            hop_length: None,
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            ring_buffer_seconds: DEFAULT_RING_BUFFER_SECONDS,
            idle_timeout_ms: DEFAULT_IDLE_TIMEOUT_MS,
            read_timeout_ms: DEFAULT_READ_TIMEOUT_MS,
        }
    }
}

impl StreamConfig {
    /// Check the parameters are usable before anything is bound
    pub fn validate(&self) -> Result<()> {
        if self.fft_window < 2 || self.fft_window % 2 != 0 {
            return Err(SpectrumError::InvalidWindow(self.fft_window).into());
        }
        let hop = self.hop();
        if hop == 0 || hop > self.fft_window {
            return Err(SpectrumError::InvalidHop { hop, window: self.fft_window }.into());
        }
        if self.sample_rate == 0 {
            return Err(Error::Config("sample_rate must be positive".into()));
        }
        if self.channels == 0 {
            return Err(Error::Config("channels must be positive".into()));
        }
        if self.chunk_size == 0 {
            return Err(Error::Config("chunk_size must be positive".into()));
        }
        if self.queue_capacity == 0 {
            return Err(Error::Config("queue_capacity must be positive".into()));
        }
        if self.read_timeout_ms == 0 {
            return Err(Error::Config("read_timeout_ms must be positive".into()));
        }
        Ok(())
    }

    /// Effective hop between FFT frames in samples
    pub fn hop(&self) -> usize {
        self.hop_length.unwrap_or(self.fft_window)
    }

    /// Bytes per interleaved sample frame (s16le)
    pub fn bytes_per_frame(&self) -> usize {
        self.channels as usize * BYTES_PER_SAMPLE
    }

    /// Ring buffer capacity in bytes
    pub fn ring_buffer_bytes(&self) -> usize {
        self.ring_buffer_seconds as usize * self.sample_rate as usize * self.bytes_per_frame()
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_millis(self.idle_timeout_ms)
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms)
    }
}

/// External transcoder configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TranscoderConfig {
    pub program: String,
    /// Output container passed to `-f`
    pub format: String,
    pub bitrate_kbps: u32,
    pub output_sample_rate: u32,
    /// Content-Type of the HTTP response
    pub content_type: String,
    /// Full argument list, replacing the generated ffmpeg arguments
    pub args: Option<Vec<String>>,
}

impl Default for TranscoderConfig {
    fn default() -> Self {
        Self {
            program: "ffmpeg".to_string(),
            format: "mp3".to_string(),
            bitrate_kbps: 128,
            output_sample_rate: 44_100,
            content_type: "audio/mpeg".to_string(),
            args: None,
        }
    }
}

impl TranscoderConfig {
    /// Arguments for the transcoder reading s16le PCM on stdin
    pub fn command_args(&self, stream: &StreamConfig) -> Vec<String> {
        if let Some(args) = &self.args {
            return args.clone();
        }

        let sample_rate = stream.sample_rate.to_string();
        let channels = stream.channels.to_string();
        let bitrate = format!("{}k", self.bitrate_kbps);
        let output_rate = self.output_sample_rate.to_string();

        [
            "-hide_banner",
            "-loglevel",
            "error",
            "-f",
            "s16le",
            "-ar",
            sample_rate.as_str(),
            "-ac",
            channels.as_str(),
            "-i",
            "pipe:0",
            "-f",
            self.format.as_str(),
            "-b:a",
            bitrate.as_str(),
            "-ar",
            output_rate.as_str(),
            "pipe:1",
        ]
        .iter()
        .map(|s| s.to_string())
        .collect()
    }
}

/// Heartbeat file configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StatusConfig {
    /// Heartbeat target; disabled when unset
    pub file: Option<PathBuf>,
    pub interval_secs: u64,
}

impl Default for StatusConfig {
    fn default() -> Self {
        Self {
            file: None,
            interval_secs: 5,
        }
    }
}

fn default_sources() -> BTreeMap<String, u16> {
    BTreeMap::from([("default".to_string(), DEFAULT_SOURCE_PORT)])
}

impl AppConfig {
    /// Load configuration from an explicit file, the platform config
    /// directory, or defaults, then apply environment overrides
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None => match Self::default_path().filter(|p| p.exists()) {
                Some(path) => Self::from_file(&path)?,
                None => Self::default(),
            },
        };

        config.apply_env(|key| std::env::var(key).ok())?;
        config.stream.validate()?;
        Ok(config)
    }

    /// Parse a TOML config file
    pub fn from_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_toml(&text)
    }

    pub fn from_toml(text: &str) -> Result<Self> {
        toml::from_str(text).map_err(|e| Error::Config(e.to_string()))
    }

    /// `<config dir>/livesound/config.toml`
    pub fn default_path() -> Option<PathBuf> {
        directories::ProjectDirs::from("org", "livesound", "livesound")
            .map(|dirs| dirs.config_dir().join("config.toml"))
    }

    /// Apply overrides from a variable lookup
    pub fn apply_env<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(host) = lookup(ENV_HOST) {
            self.server.bind_address = host;
        }
        if let Some(port) = lookup(ENV_PORT) {
            self.server.http_port = port
                .trim()
                .parse()
                .map_err(|_| Error::Config(format!("{ENV_PORT} is not a port: {port}")))?;
        }
        if let Some(ports) = lookup(ENV_LISTEN_PORTS) {
            self.sources = parse_listen_ports(&ports);
        }
        Ok(())
    }
}

/// Parse `name:port` pairs separated by commas.
///
/// Malformed or empty input yields the single `default` source.
pub fn parse_listen_ports(value: &str) -> BTreeMap<String, u16> {
    let mut ports = BTreeMap::new();

    for part in value.split(',').filter(|p| !p.trim().is_empty()) {
        let Some((name, port)) = part.split_once(':') else {
            continue;
        };
        match port.trim().parse::<u16>() {
            Ok(port) if !name.trim().is_empty() => {
                ports.insert(name.trim().to_string(), port);
            }
            _ => return default_sources(),
        }
    }

    if ports.is_empty() {
        default_sources()
    } else {
        ports
    }
}
