//! Sample-rate conversion using a rubato `FastFixedIn` resampler.
//!
//! ## Design
//!
//! Capture layers deliver audio at whatever rate their device runs at
//! (44.1 kHz handsets, 4.41 kHz decimated embedded streams, 48 kHz desktops).
//! Segmentation, feature extraction and template matching all run at one
//! canonical rate per engine. `RateConverter` bridges the gap at the input
//! boundary.
//!
//! When input rate == canonical rate no rubato session is created and
//! `process` copies its input through.
//!
//! ## Usage
//!
//! ```ignore
//! let mut rc = RateConverter::new(48_000, 44_100, 1024)?;
//! let out = rc.process(&raw_samples)?; // Vec<f32> at 44.1 kHz
//! let tail = rc.flush()?;              // remaining partial chunk
//! ```

use rubato::{FastFixedIn, PolynomialDegree, Resampler};
use tracing::debug;

use crate::error::{MeowError, Result};

/// Input frames per rubato call.
pub const DEFAULT_CHUNK: usize = 1024;

/// Converts f32 mono audio from one fixed sample rate to another.
pub struct RateConverter {
    /// `None` when input rate == output rate (passthrough mode).
    resampler: Option<FastFixedIn<f32>>,
    input_rate: u32,
    output_rate: u32,
    /// Partial input block held between calls.
    input_buf: Vec<f32>,
    /// How many input samples rubato expects per process call.
    chunk_size: usize,
    /// Pre-allocated output buffer: `[1][output_frames_max]`.
    output_buf: Vec<Vec<f32>>,
    consumed_total: usize,
    produced_total: usize,
}

impl RateConverter {
    /// Create a new converter.
    ///
    /// # Errors
    /// Returns `MeowError::Resample` if either rate is zero or rubato fails
    /// to initialise.
    pub fn new(input_rate: u32, output_rate: u32, chunk_size: usize) -> Result<Self> {
        if input_rate == 0 || output_rate == 0 {
            return Err(MeowError::Resample(format!(
                "invalid rates {input_rate} -> {output_rate}"
            )));
        }

        if input_rate == output_rate {
            return Ok(Self {
                resampler: None,
                input_rate,
                output_rate,
                input_buf: Vec::new(),
                chunk_size,
                output_buf: Vec::new(),
                consumed_total: 0,
                produced_total: 0,
            });
        }

        let ratio = output_rate as f64 / input_rate as f64;

        let resampler = FastFixedIn::<f32>::new(
            ratio,
            1.0, // fixed ratio
            PolynomialDegree::Cubic,
            chunk_size,
            1, // mono
        )
        .map_err(|e| MeowError::Resample(format!("resampler init: {e}")))?;

        let max_out = resampler.output_frames_max();
        let output_buf = vec![vec![0f32; max_out]; 1];

        debug!(input_rate, output_rate, chunk_size, max_out, "rate converter ready");

        Ok(Self {
            resampler: Some(resampler),
            input_rate,
            output_rate,
            input_buf: Vec::new(),
            chunk_size,
            output_buf,
            consumed_total: 0,
            produced_total: 0,
        })
    }

    /// Convert `samples`, returning whatever full blocks are ready.
    ///
    /// Input is fed to rubato in `chunk_size` blocks; a trailing partial block
    /// is held until the next call (or `flush`).
    pub fn process(&mut self, samples: &[f32]) -> Result<Vec<f32>> {
        let Some(resampler) = self.resampler.as_mut() else {
            return Ok(samples.to_vec());
        };
        self.input_buf.extend_from_slice(samples);

        let blocks = self.input_buf.len() / self.chunk_size;
        let mut out = Vec::with_capacity(blocks * self.output_buf[0].len());
        for block in self.input_buf.chunks_exact(self.chunk_size) {
            let (_, produced) = resampler
                .process_into_buffer(&[block], &mut self.output_buf, None)
                .map_err(|e| MeowError::Resample(e.to_string()))?;
            out.extend_from_slice(&self.output_buf[0][..produced]);
        }

        let used = blocks * self.chunk_size;
        self.input_buf.drain(..used);
        self.consumed_total += used;
        self.produced_total += out.len();
        Ok(out)
    }

    /// Push the held partial block through, zero-padded, and trim the output
    /// so the total length matches `consumed × ratio`.
    pub fn flush(&mut self) -> Result<Vec<f32>> {
        let Some(resampler) = self.resampler.as_mut() else {
            return Ok(Vec::new());
        };
        if self.input_buf.is_empty() {
            return Ok(Vec::new());
        }

        let pending = std::mem::take(&mut self.input_buf);
        self.consumed_total += pending.len();
        let expected_total = (self.consumed_total as f64 * self.output_rate as f64
            / self.input_rate as f64)
            .round() as usize;

        let wave_in: [&[f32]; 1] = [pending.as_slice()];
        let (_, produced) = resampler
            .process_partial_into_buffer(Some(&wave_in[..]), &mut self.output_buf, None)
            .map_err(|e| MeowError::Resample(e.to_string()))?;
        let wanted = expected_total.saturating_sub(self.produced_total);
        let out = self.output_buf[0][..produced.min(wanted)].to_vec();
        self.produced_total += out.len();
        Ok(out)
    }

    /// Returns `true` when input rate == output rate (no resampling occurs).
    pub fn is_passthrough(&self) -> bool {
        self.resampler.is_none()
    }

    pub fn input_rate(&self) -> u32 {
        self.input_rate
    }

    pub fn output_rate(&self) -> u32 {
        self.output_rate
    }
}

/// Convert a complete clip in one go (process + flush).
pub fn resample_all(samples: &[f32], input_rate: u32, output_rate: u32) -> Result<Vec<f32>> {
    let mut rc = RateConverter::new(input_rate, output_rate, DEFAULT_CHUNK)?;
    if rc.is_passthrough() {
        return Ok(samples.to_vec());
    }
    let mut out = rc.process(samples)?;
    out.extend(rc.flush()?);
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn passthrough_identity() {
        let mut rc = RateConverter::new(44_100, 44_100, 1024).unwrap();
        assert!(rc.is_passthrough());
        let samples: Vec<f32> = (0..480).map(|i| i as f32 * 0.001).collect();
        let out = rc.process(&samples).unwrap();
        assert_eq!(out, samples);
        assert!(rc.flush().unwrap().is_empty());
    }

    #[test]
    fn zero_rate_is_rejected() {
        assert!(matches!(
            RateConverter::new(0, 44_100, 1024),
            Err(MeowError::Resample(_))
        ));
    }

    #[test]
    fn upsample_4410_to_44100_length() {
        let mut rc = RateConverter::new(4_410, 44_100, 441).unwrap();
        assert!(!rc.is_passthrough());
        let out = rc.process(&vec![0.0f32; 441]).unwrap();
        assert!(!out.is_empty(), "expected non-empty output");
        assert!(
            (out.len() as isize - 4_410).unsigned_abs() <= 50,
            "output len={} expected≈4410",
            out.len()
        );
    }

    #[test]
    fn partial_accumulation_returns_empty() {
        let mut rc = RateConverter::new(48_000, 44_100, 1024).unwrap();
        let out = rc.process(&vec![0.0f32; 500]).unwrap();
        assert!(out.is_empty(), "got {}", out.len());
    }

    #[test]
    fn resample_all_matches_ratio() {
        let input = vec![0.1f32; 48_000 + 300];
        let out = resample_all(&input, 48_000, 44_100).unwrap();
        let expected = ((48_300.0f64) * 44_100.0 / 48_000.0).round() as usize;
        assert!(
            (out.len() as isize - expected as isize).unsigned_abs() <= 64,
            "len={} expected≈{}",
            out.len(),
            expected
        );
    }
}
