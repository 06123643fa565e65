//! # meowscan-core
//!
//! Streaming cat-vocalization detector: silence-bracketed segmentation,
//! mel-cepstral fingerprints and nearest-template matching.
//!
//! ## Architecture
//!
//! ```text
//! capture ─► submit_samples ─► RateConverter ─► SampleBuffer
//!                                                   │  (tick)
//!                                           SilenceSegmenter ─► Segment
//!                                                   │
//!                                          FeatureExtractor ─► FeatureVector
//!                                                   │
//!                                 Matcher (Arc<TemplateLibrary>) ─► MatchResult
//!                                                   │
//!                                 broadcast::Sender<DetectorEvent>
//! ```
//!
//! `DetectionEngine` is caller-owned and single-session; `SessionRegistry`
//! multiplexes sessions over one shared library, and `BackgroundDetector`
//! drives an engine from a ring buffer on its own thread.

#![forbid(unsafe_code)]
#![warn(clippy::all)]

pub mod audio;
pub mod buffering;
pub mod engine;
pub mod error;
pub mod features;
pub mod ipc;
pub mod library;
pub mod matcher;
pub mod segment;
pub mod sessions;
pub mod vad;

// Convenience re-exports for downstream crates
pub use engine::pipeline::{BackgroundDetector, DiagnosticsSnapshot};
pub use engine::{DetectionEngine, DetectorOptions, EngineConfig};
pub use error::{ErrorKind, MeowError, Result};
pub use features::{FeatureConfig, FeatureExtractor, FeatureVector};
pub use ipc::events::{DetectorEvent, DetectorState};
pub use library::{LabelStatistics, Template, TemplateLibrary};
pub use matcher::{cosine_similarity, MatchResult, Matcher};
pub use segment::{Segment, SilenceSegmenter};
pub use sessions::SessionRegistry;
