//! Fixed-capacity byte ring holding the most recent raw PCM of one source
//!
//! The ingestion thread is the only writer. Readers (status endpoints,
//! diagnostics) take copies with [`RingBuffer::snapshot`]. A write happens
//! under the same lock a snapshot takes, so readers never see half of a chunk.

use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

struct Ring {
    data: Box<[u8]>,
    /// Next write position
    head: usize,
    /// Valid bytes, at most `data.len()`
    len: usize,
}

/// Overwriting ring buffer for raw PCM bytes
pub struct RingBuffer {
    ring: Mutex<Ring>,
    capacity: usize,
    bytes_written: AtomicU64,
    bytes_overwritten: AtomicU64,
}

impl RingBuffer {
    /// Create a new ring buffer holding at most `capacity` bytes
    pub fn new(capacity: usize) -> Self {
        Self {
            ring: Mutex::new(Ring {
                data: vec![0u8; capacity].into_boxed_slice(),
                head: 0,
                len: 0,
            }),
            capacity,
            bytes_written: AtomicU64::new(0),
            bytes_overwritten: AtomicU64::new(0),
        }
    }

    /// Append bytes, discarding the oldest contents when full.
    /// Never blocks on readers for longer than a copy and never grows.
    pub fn write(&self, bytes: &[u8]) {
        self.bytes_written.fetch_add(bytes.len() as u64, Ordering::Relaxed);
        let cap = self.capacity;
        if cap == 0 {
            self.bytes_overwritten.fetch_add(bytes.len() as u64, Ordering::Relaxed);
            return;
        }

        let mut ring = self.ring.lock();
        let overflow = (ring.len + bytes.len()).saturating_sub(cap);

        if bytes.len() >= cap {
            // Only the tail of this write survives
            ring.data.copy_from_slice(&bytes[bytes.len() - cap..]);
            ring.head = 0;
            ring.len = cap;
        } else {
            let head = ring.head;
            let first = (cap - head).min(bytes.len());
            ring.data[head..head + first].copy_from_slice(&bytes[..first]);
            let rest = bytes.len() - first;
            if rest > 0 {
                ring.data[..rest].copy_from_slice(&bytes[first..]);
            }
            ring.head = (head + bytes.len()) % cap;
            ring.len = (ring.len + bytes.len()).min(cap);
        }
        drop(ring);

        if overflow > 0 {
            self.bytes_overwritten.fetch_add(overflow as u64, Ordering::Relaxed);
        }
    }

    /// Copy of the current contents, oldest byte first
    pub fn snapshot(&self) -> Vec<u8> {
        let ring = self.ring.lock();
        let mut out = Vec::with_capacity(ring.len);
        if ring.len == 0 {
            return out;
        }

        let start = (ring.head + self.capacity - ring.len) % self.capacity;
        let first = (self.capacity - start).min(ring.len);
        out.extend_from_slice(&ring.data[start..start + first]);
        out.extend_from_slice(&ring.data[..ring.len - first]);
        out
    }

    pub fn len(&self) -> usize {
        self.ring.lock().len
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Total bytes ever written
    pub fn bytes_written(&self) -> u64 {
        self.bytes_written.load(Ordering::Relaxed)
    }

    /// Bytes discarded to make room for newer data
    pub fn bytes_overwritten(&self) -> u64 {
        self.bytes_overwritten.load(Ordering::Relaxed)
    }

    /// Get fill level as a fraction
    pub fn fill_level(&self) -> f32 {
        if self.capacity == 0 {
            return 0.0;
        }
        self.len() as f32 / self.capacity as f32
    }
}

/// Thread-safe handle to a ring buffer
pub type SharedRingBuffer = Arc<RingBuffer>;

/// Create a new shared ring buffer
pub fn create_shared_buffer(capacity: usize) -> SharedRingBuffer {
    Arc::new(RingBuffer::new(capacity))
}
