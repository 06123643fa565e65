//! Audio boundary helpers.
//!
//! meowscan never opens a capture device. Samples arrive from the host
//! application; this module only converts what arrives (or what sits on disk)
//! into mono f32 at the engine's canonical rate.

pub mod resample;
pub mod wav;

pub use resample::{resample_all, RateConverter};
pub use wav::{is_wav_path, read_wav_mono, write_wav_mono};

use crate::error::{MeowError, Result};

/// Reject NaN/∞ samples before they reach any energy computation.
pub fn ensure_finite(samples: &[f32]) -> Result<()> {
    match samples.iter().position(|s| !s.is_finite()) {
        Some(index) => Err(MeowError::NonFiniteSample { index }),
        None => Ok(()),
    }
}

/// Root-mean-square of a sample slice (0 for empty input).
pub fn rms(samples: &[f32]) -> f32 {
    if samples.is_empty() {
        return 0.0;
    }
    let sum_sq: f32 = samples.iter().map(|s| s * s).sum();
    (sum_sq / samples.len() as f32).sqrt()
}
