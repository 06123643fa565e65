//! Mono clip tagged with its sample rate.

use crate::audio::resample_all;
use crate::error::Result;

/// A decoded recording or template file: mono f32 samples at a known rate.
#[derive(Debug, Clone)]
pub struct AudioChunk {
    /// Mono samples in [-1.0, 1.0].
    pub samples: Vec<f32>,
    /// Sample rate in Hz (e.g. 4410, 16000, 44100).
    pub sample_rate: u32,
}

impl AudioChunk {
    pub fn new(samples: Vec<f32>, sample_rate: u32) -> Self {
        Self {
            samples,
            sample_rate,
        }
    }

    pub fn duration_secs(&self) -> f64 {
        if self.sample_rate == 0 {
            return 0.0;
        }
        self.samples.len() as f64 / self.sample_rate as f64
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Convert the whole clip to `sample_rate`. A no-op when it already matches.
    pub fn into_rate(self, sample_rate: u32) -> Result<Self> {
        if self.sample_rate == sample_rate {
            return Ok(self);
        }
        let samples = resample_all(&self.samples, self.sample_rate, sample_rate)?;
        Ok(Self::new(samples, sample_rate))
    }
}
