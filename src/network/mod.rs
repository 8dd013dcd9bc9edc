//! UDP transport for incoming PCM sources

pub mod ingestor;
pub mod udp;

pub use ingestor::SourceIngestor;
pub use udp::create_socket;
