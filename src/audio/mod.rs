//! Audio processing: ring buffer, loudness and spectrum analysis

pub mod buffer;
pub mod level;
pub mod spectrum;

pub use buffer::{create_shared_buffer, RingBuffer, SharedRingBuffer};
pub use level::{amplitude_to_db, rms_db, LevelMeter};
pub use spectrum::{SpectrumEngine, SpectrumFrame};
