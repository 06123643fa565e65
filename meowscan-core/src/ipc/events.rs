//! Events emitted by the detection engine.
//!
//! Wire shape (JSON):
//!
//! ```text
//! { "type": "StateChanged",   "payload": { "from": "listening", "to": "recording" } }
//! { "type": "MeowDetected",   "payload": { "startSample": …, "endSample": …, "startSecs": …, … } }
//! { "type": "AnalysisResult", "payload": { "label": …, "score": …, "detected": true, … } }
//! { "type": "Error",          "payload": { "kind": "processing", "message": "…" } }
//! ```
//!
//! Every event is both returned from the engine call that produced it and
//! sent on the engine's broadcast channel, in the same order.

use serde::{Deserialize, Serialize};

use crate::error::{ErrorKind, MeowError};
use crate::features::SpectralDescriptors;
use crate::matcher::MatchResult;
use crate::segment::Segment;

/// Authoritative engine state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DetectorState {
    /// Constructed or stopped; not consuming audio.
    Idle,
    /// Consuming audio, no activity yet.
    Listening,
    /// An active run is accumulating.
    Recording,
    /// A finalized segment is being analyzed.
    Processing,
    /// The last segment matched above the confidence threshold.
    Detected,
    /// Unrecoverable failure; `reset()` required.
    Error,
}

impl std::fmt::Display for DetectorState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            DetectorState::Idle => "idle",
            DetectorState::Listening => "listening",
            DetectorState::Recording => "recording",
            DetectorState::Processing => "processing",
            DetectorState::Detected => "detected",
            DetectorState::Error => "error",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StateChange {
    pub from: DetectorState,
    pub to: DetectorState,
}

/// Time range of a segment, in canonical-rate samples and seconds.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SegmentRange {
    pub start_sample: usize,
    pub end_sample: usize,
    pub start_secs: f64,
    pub end_secs: f64,
    /// Closed by the duration cap rather than silence.
    pub forced: bool,
}

impl From<&Segment> for SegmentRange {
    fn from(s: &Segment) -> Self {
        Self {
            start_sample: s.start,
            end_sample: s.end,
            start_secs: s.start_secs(),
            end_secs: s.end_secs(),
            forced: s.forced,
        }
    }
}

/// Outcome of matching one segment, emitted whether or not it passed the
/// confidence threshold.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AnalysisReport {
    #[serde(flatten)]
    pub result: MatchResult,
    pub segment: SegmentRange,
    /// Score reached the confidence threshold.
    pub detected: bool,
    pub pitch_hz: f32,
    pub descriptors: SpectralDescriptors,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorReport {
    pub kind: ErrorKind,
    pub message: String,
}

impl From<&MeowError> for ErrorReport {
    fn from(e: &MeowError) -> Self {
        Self {
            kind: e.kind(),
            message: e.to_string(),
        }
    }
}

/// One engine event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload")]
pub enum DetectorEvent {
    StateChanged(StateChange),
    MeowDetected(SegmentRange),
    AnalysisResult(AnalysisReport),
    Error(ErrorReport),
}

impl DetectorEvent {
    /// Target state if this is a `StateChanged` event.
    pub fn new_state(&self) -> Option<DetectorState> {
        match self {
            DetectorEvent::StateChanged(c) => Some(c.to),
            _ => None,
        }
    }
}
