//! Sample storage.
//!
//! - [`SampleBuffer`]: bounded, absolutely-indexed sample store owned by one
//!   detection session. Appends drop the oldest samples once the configured
//!   duration is exceeded.
//! - [`create_sample_ring`]: lock-free SPSC ring (`ringbuf::HeapRb<f32>`) for
//!   handing samples from an external capture thread to the pipeline thread.

pub mod chunk;

use ringbuf::{traits::Split, HeapRb};
use tracing::warn;

use crate::error::{MeowError, Result};

pub use ringbuf::traits::{Consumer, Observer, Producer};

/// Producer half, held by whoever owns capture.
pub type SampleProducer = ringbuf::HeapProd<f32>;

/// Consumer half, held by the pipeline thread.
pub type SampleConsumer = ringbuf::HeapCons<f32>;

/// Ring capacity: 2^20 = 1 048 576 f32 samples ≈ 23.8 s at 44.1 kHz.
pub const RING_CAPACITY: usize = 1 << 20;

/// Create a matched producer/consumer pair backed by a heap-allocated ring buffer.
pub fn create_sample_ring() -> (SampleProducer, SampleConsumer) {
    HeapRb::<f32>::new(RING_CAPACITY).split()
}

/// Bounded sample store with absolute indexing.
///
/// Sample `i` of the session keeps the index `i` no matter how many older
/// samples have been trimmed, so segment boundaries stay valid across ticks.
#[derive(Debug, Clone)]
pub struct SampleBuffer {
    samples: Vec<f32>,
    /// Absolute index of `samples[0]`.
    base: usize,
    sample_rate: u32,
    capacity: usize,
    overflow_dropped: usize,
}

impl SampleBuffer {
    /// Create a buffer holding at most `max_duration_secs` of audio.
    pub fn new(sample_rate: u32, max_duration_secs: f32) -> Self {
        let capacity = ((sample_rate as f64 * max_duration_secs.max(0.0) as f64).ceil() as usize)
            .max(1);
        Self {
            samples: Vec::with_capacity(capacity.min(1 << 22)),
            base: 0,
            sample_rate,
            capacity,
            overflow_dropped: 0,
        }
    }

    /// Append samples to the tail.
    ///
    /// Returns how many of the oldest samples were dropped to stay within
    /// capacity (0 in the common case).
    pub fn append(&mut self, samples: &[f32]) -> usize {
        if samples.len() > self.capacity {
            // Only the newest `capacity` samples can survive anyway.
            let skipped = samples.len() - self.capacity;
            let dropped = self.samples.len() + skipped;
            self.base += dropped;
            self.samples.clear();
            self.samples.extend_from_slice(&samples[skipped..]);
            self.record_overflow(dropped);
            return dropped;
        }

        let overflow = (self.samples.len() + samples.len()).saturating_sub(self.capacity);
        if overflow > 0 {
            self.samples.drain(..overflow);
            self.base += overflow;
            self.record_overflow(overflow);
        }
        self.samples.extend_from_slice(samples);
        overflow
    }

    /// Read-only view relative to the oldest retained sample.
    pub fn window_view(&self, start_offset: usize, length: usize) -> Result<&[f32]> {
        let end = start_offset.checked_add(length);
        match end {
            Some(end) if end <= self.samples.len() => Ok(&self.samples[start_offset..end]),
            _ => Err(MeowError::Range {
                start: start_offset,
                len: length,
                available: self.samples.len(),
            }),
        }
    }

    /// Read-only view over absolute indices `[start, end)`.
    pub fn absolute_view(&self, start: usize, end: usize) -> Result<&[f32]> {
        if start < self.base || end < start {
            return Err(MeowError::Range {
                start: start.saturating_sub(self.base),
                len: end.saturating_sub(start),
                available: self.samples.len(),
            });
        }
        self.window_view(start - self.base, end - start)
    }

    /// Discard all but the most recent `duration_secs` of audio.
    pub fn retain_tail(&mut self, duration_secs: f32) {
        let keep = (self.sample_rate as f64 * duration_secs.max(0.0) as f64).round() as usize;
        self.retain_tail_samples(keep);
    }

    /// Discard all but the most recent `keep` samples.
    fn retain_tail_samples(&mut self, keep: usize) {
        if self.samples.len() <= keep {
            return;
        }
        let drop = self.samples.len() - keep;
        self.samples.drain(..drop);
        self.base += drop;
    }

    /// Discard every sample with an absolute index below `index`.
    pub fn discard_before(&mut self, index: usize) {
        if index <= self.base {
            return;
        }
        let drop = (index - self.base).min(self.samples.len());
        self.samples.drain(..drop);
        self.base += drop;
    }

    /// Drop all samples and restart absolute indexing at zero.
    pub fn clear(&mut self) {
        self.samples.clear();
        self.base = 0;
        self.overflow_dropped = 0;
    }

    /// Absolute index of the oldest retained sample.
    pub fn start_index(&self) -> usize {
        self.base
    }

    /// Absolute index one past the newest sample.
    pub fn end_index(&self) -> usize {
        self.base + self.samples.len()
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    /// Maximum number of samples retained.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Total samples dropped by overflow since the last `clear`.
    pub fn overflow_dropped(&self) -> usize {
        self.overflow_dropped
    }

    fn record_overflow(&mut self, dropped: usize) {
        self.overflow_dropped = self.overflow_dropped.saturating_add(dropped);
        warn!(
            dropped,
            capacity = self.capacity,
            "sample buffer overflow — dropping oldest samples"
        );
    }
}
