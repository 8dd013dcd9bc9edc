//! PCM decoding and loudness metering

use crate::constants::{BYTES_PER_SAMPLE, SILENCE_DB};

/// Added to magnitudes before taking the log
pub const EPSILON: f32 = 1e-9;

/// Decode little-endian signed 16-bit samples to `[-1.0, 1.0)`.
/// A trailing odd byte is ignored.
pub fn decode_s16le(bytes: &[u8]) -> impl Iterator<Item = f32> + '_ {
    bytes
        .chunks_exact(BYTES_PER_SAMPLE)
        .map(|b| i16::from_le_bytes([b[0], b[1]]) as f32 / 32768.0)
}

/// Root-mean-square over all complete samples in the chunk
pub fn rms(bytes: &[u8]) -> f32 {
    let (sum, count) = decode_s16le(bytes).fold((0.0f64, 0usize), |(sum, count), s| {
        (sum + (s as f64) * (s as f64), count + 1)
    });

    if count == 0 {
        0.0
    } else {
        (sum / count as f64).sqrt() as f32
    }
}

/// Convert a linear amplitude to dB, floored at [`SILENCE_DB`] and rounded
/// to one decimal
pub fn amplitude_to_db(amplitude: f32) -> f32 {
    if !amplitude.is_finite() || amplitude <= 0.0 {
        return SILENCE_DB;
    }
    let db = (20.0 * (amplitude + EPSILON).log10()).max(SILENCE_DB);
    (db * 10.0).round() / 10.0
}

/// Loudness of a raw s16le chunk in dB
pub fn rms_db(bytes: &[u8]) -> f32 {
    amplitude_to_db(rms(bytes))
}

/// Per-read loudness over a continuous byte stream.
///
/// A read that ends mid-sample leaves its odd byte pending; the next read
/// completes that sample first, so sample alignment matches the spectrum.
#[derive(Debug, Default)]
pub struct LevelMeter {
    pending: Option<u8>,
    scratch: Vec<u8>,
}

impl LevelMeter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Loudness in dB of the complete samples available after `chunk`
    pub fn measure(&mut self, chunk: &[u8]) -> f32 {
        let Some(first) = self.pending.take() else {
            if chunk.len() % BYTES_PER_SAMPLE == 1 {
                self.pending = chunk.last().copied();
            }
            return rms_db(chunk);
        };

        self.scratch.clear();
        self.scratch.push(first);
        self.scratch.extend_from_slice(chunk);
        if self.scratch.len() % BYTES_PER_SAMPLE == 1 {
            self.pending = self.scratch.last().copied();
        }
        rms_db(&self.scratch)
    }
}
