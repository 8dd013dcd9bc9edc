//! Windowed FFT producing magnitude-in-dB frames
//!
//! Raw s16le bytes are decoded, downmixed to mono and accumulated. Every
//! time a full window is available one frame of `fft_window / 2` bins is
//! emitted and `hop` samples are consumed (a whole window by default, so
//! frames do not overlap). Output depends only on the bytes fed.

use rustfft::{num_complex::Complex, Fft, FftPlanner};
use std::sync::Arc;

use crate::audio::level::EPSILON;
use crate::config::StreamConfig;
use crate::constants::BYTES_PER_SAMPLE;
use crate::error::SpectrumError;

/// Lowest value a spectrum bin can report
pub const SPECTRUM_FLOOR_DB: f32 = -120.0;

/// One spectrum frame for a source
#[derive(Debug, Clone, PartialEq)]
pub struct SpectrumFrame {
    pub source: Arc<str>,
    /// Index of this frame since the engine was created
    pub sequence: u64,
    /// Magnitudes in dB, `fft_window / 2` bins from DC up to below Nyquist
    pub data: Vec<f32>,
}

impl SpectrumFrame {
    /// Bin with the largest magnitude
    pub fn peak_bin(&self) -> Option<usize> {
        self.data
            .iter()
            .enumerate()
            .max_by(|a, b| a.1.total_cmp(b.1))
            .map(|(i, _)| i)
    }
}

/// Per-source spectrum analyser
pub struct SpectrumEngine {
    source: Arc<str>,
    fft_window: usize,
    hop: usize,
    channels: usize,
    window: Vec<f32>,
    /// Scale so a full-scale sine reads about 0 dB
    norm: f32,
    fft: Arc<dyn Fft<f32>>,
    buffer: Vec<Complex<f32>>,
    scratch: Vec<Complex<f32>>,
    /// Accumulated mono samples not yet consumed
    samples: Vec<f32>,
    /// Bytes of an incomplete interleaved sample frame
    pending: Vec<u8>,
    frames_emitted: u64,
    samples_fed: u64,
}

impl SpectrumEngine {
    /// Create an engine for the given stream parameters
    pub fn new(source: impl Into<Arc<str>>, config: &StreamConfig) -> Result<Self, SpectrumError> {
        let fft_window = config.fft_window;
        if fft_window < 2 || fft_window % 2 != 0 {
            return Err(SpectrumError::InvalidWindow(fft_window));
        }
        let hop = config.hop();
        if hop == 0 || hop > fft_window {
            return Err(SpectrumError::InvalidHop { hop, window: fft_window });
        }

        // Periodic Hann window
        let window: Vec<f32> = (0..fft_window)
            .map(|i| {
                0.5 * (1.0 - (2.0 * std::f32::consts::PI * i as f32 / fft_window as f32).cos())
            })
            .collect();
        let norm = 2.0 / window.iter().sum::<f32>();

        let mut planner = FftPlanner::new();
        let fft = planner.plan_fft_forward(fft_window);
        let scratch = vec![Complex::new(0.0, 0.0); fft.get_inplace_scratch_len()];

        Ok(Self {
            source: source.into(),
            fft_window,
            hop,
            channels: config.channels.max(1) as usize,
            window,
            norm,
            fft,
            buffer: vec![Complex::new(0.0, 0.0); fft_window],
            scratch,
            samples: Vec::with_capacity(fft_window * 2),
            pending: Vec::new(),
            frames_emitted: 0,
            samples_fed: 0,
        })
    }

    /// Append raw bytes and return every frame that became complete
    pub fn feed(&mut self, raw: &[u8]) -> Vec<SpectrumFrame> {
        self.decode_into_samples(raw);

        let mut frames = Vec::new();
        while self.samples.len() >= self.fft_window {
            let data = self.compute();
            frames.push(SpectrumFrame {
                source: self.source.clone(),
                sequence: self.frames_emitted,
                data,
            });
            self.frames_emitted += 1;
            self.samples.drain(..self.hop);
        }
        frames
    }

    fn decode_into_samples(&mut self, mut raw: &[u8]) {
        let frame_bytes = self.channels * BYTES_PER_SAMPLE;

        // Complete a sample frame split across reads
        if !self.pending.is_empty() {
            let take = (frame_bytes - self.pending.len()).min(raw.len());
            self.pending.extend_from_slice(&raw[..take]);
            raw = &raw[take..];
            if self.pending.len() < frame_bytes {
                return;
            }
            let frame = std::mem::take(&mut self.pending);
            self.push_frame(&frame);
        }

        let mut chunks = raw.chunks_exact(frame_bytes);
        for frame in &mut chunks {
            self.push_frame(frame);
        }
        self.pending.extend_from_slice(chunks.remainder());
    }

    /// Downmix one interleaved frame (average of channels)
    fn push_frame(&mut self, frame: &[u8]) {
        let sum: f32 = frame
            .chunks_exact(BYTES_PER_SAMPLE)
            .map(|b| i16::from_le_bytes([b[0], b[1]]) as f32 / 32768.0)
            .sum();
        self.samples.push(sum / self.channels as f32);
        self.samples_fed += 1;
    }

    fn compute(&mut self) -> Vec<f32> {
        for (slot, (&sample, &w)) in self
            .buffer
            .iter_mut()
            .zip(self.samples.iter().zip(self.window.iter()))
        {
            *slot = Complex::new(sample * w, 0.0);
        }

        self.fft.process_with_scratch(&mut self.buffer, &mut self.scratch);

        self.buffer[..self.fft_window / 2]
            .iter()
            .map(|c| (20.0 * (c.norm() * self.norm + EPSILON).log10()).max(SPECTRUM_FLOOR_DB))
            .collect()
    }

    /// Bins per frame
    pub fn bins(&self) -> usize {
        self.fft_window / 2
    }

    pub fn frames_emitted(&self) -> u64 {
        self.frames_emitted
    }

    /// Mono samples decoded so far
    pub fn samples_fed(&self) -> u64 {
        self.samples_fed
    }
}

/// Frequency at the centre of `bin`
pub fn bin_frequency(bin: usize, fft_window: usize, sample_rate: u32) -> f32 {
    bin as f32 * sample_rate as f32 / fft_window as f32
}

/// Bin nearest to `frequency`
pub fn frequency_bin(frequency: f32, fft_window: usize, sample_rate: u32) -> usize {
    (frequency * fft_window as f32 / sample_rate as f32).round() as usize
}
