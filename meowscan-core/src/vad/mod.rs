//! Per-window activity classification.
//!
//! The `VoiceActivityDetector` trait is the seam the segmenter classifies
//! analysis windows through. `EnergyVad` (RMS threshold) is the default and
//! the only detector the engine builds today.

pub mod energy;

pub use energy::EnergyVad;

/// Whether a given analysis window contains activity or silence.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VadDecision {
    /// The window carries energy at or above threshold.
    Active,
    /// The window is below threshold.
    Silence,
}

impl VadDecision {
    pub fn is_active(self) -> bool {
        self == VadDecision::Active
    }
}

/// Trait for all window classifiers.
///
/// Implementors may be stateful (adaptive noise floors, hidden states).
pub trait VoiceActivityDetector: Send + 'static {
    /// Classify one analysis window of samples at the engine's canonical rate.
    fn classify(&mut self, window: &[f32]) -> VadDecision;

    /// Reset any internal state between sessions.
    fn reset(&mut self);
}
