//! Error types for the live audio service

use thiserror::Error;

/// Main error type for the application
#[derive(Error, Debug)]
pub enum Error {
    #[error("Source error: {0}")]
    Source(#[from] SourceError),

    #[error("Network error: {0}")]
    Network(#[from] NetworkError),

    #[error("Spectrum error: {0}")]
    Spectrum(#[from] SpectrumError),

    #[error("Transcoder error: {0}")]
    Transcode(#[from] TranscodeError),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Source registry errors
#[derive(Error, Debug)]
pub enum SourceError {
    #[error("Source not found: {0}")]
    NotFound(String),

    #[error("Source already exists: {0}")]
    AlreadyExists(String),

    #[error("Port {port} is already used by source '{owner}'")]
    PortInUse { port: u16, owner: String },

    #[error("Source is stopped: {0}")]
    Stopped(String),

    #[error("Invalid source name: {0:?}")]
    InvalidName(String),
}

/// Network errors
#[derive(Error, Debug)]
pub enum NetworkError {
    #[error("Socket bind failed on port {port}: {reason}")]
    BindFailed { port: u16, reason: String },

    #[error("Receive failed: {0}")]
    ReceiveFailed(String),

    #[error("Failed to spawn ingestion thread: {0}")]
    Thread(String),
}

/// Spectrum analysis errors
#[derive(Error, Debug)]
pub enum SpectrumError {
    #[error("Invalid FFT window: {0} (must be even and at least 2)")]
    InvalidWindow(usize),

    #[error("Invalid hop length {hop} for window {window}")]
    InvalidHop { hop: usize, window: usize },
}

/// External transcoder errors
#[derive(Error, Debug)]
pub enum TranscodeError {
    #[error("Failed to spawn transcoder '{program}': {reason}")]
    SpawnFailed { program: String, reason: String },

    #[error("Transcoder pipe unavailable: {0}")]
    PipeUnavailable(&'static str),
}

impl Error {
    /// Whether the error means the named source does not exist (or is gone)
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            Error::Source(SourceError::NotFound(_)) | Error::Source(SourceError::Stopped(_))
        )
    }
}

/// Result type alias for the application
pub type Result<T> = std::result::Result<T, Error>;
