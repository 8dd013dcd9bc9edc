//! Listening streams: raw PCM relayed through an external transcoder

pub mod bridge;

pub use bridge::{StreamBridge, TranscodedStream};
