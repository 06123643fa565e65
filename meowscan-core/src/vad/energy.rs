//! Energy-based classifier using an RMS threshold.
//!
//! ## Algorithm
//!
//! 1. Compute RMS of the analysis window (normalized amplitude).
//! 2. RMS ≥ `threshold` → `Active`.
//! 3. Otherwise → `Silence`.
//!
//! Minimum-silence bridging lives in the segmenter, not here, so this
//! classifier is stateless.

use super::{VadDecision, VoiceActivityDetector};
use crate::audio::rms;

/// A simple energy-based activity detector.
#[derive(Debug, Clone)]
pub struct EnergyVad {
    /// RMS amplitude threshold. Windows at or above it are active.
    threshold: f32,
}

impl EnergyVad {
    /// Create a new `EnergyVad`.
    ///
    /// `threshold` is the RMS level separating silence from activity.
    /// Default: `0.02`.
    pub fn new(threshold: f32) -> Self {
        Self { threshold }
    }
}

impl Default for EnergyVad {
    fn default() -> Self {
        Self::new(0.02)
    }
}

impl VoiceActivityDetector for EnergyVad {
    fn classify(&mut self, window: &[f32]) -> VadDecision {
        if rms(window) >= self.threshold {
            VadDecision::Active
        } else {
            VadDecision::Silence
        }
    }

    fn reset(&mut self) {}
}
