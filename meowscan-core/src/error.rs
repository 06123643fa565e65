use serde::{Deserialize, Serialize};
use thiserror::Error;

/// All errors produced by meowscan-core.
#[derive(Debug, Error)]
pub enum MeowError {
    #[error("sample buffer overflow: dropped {dropped} oldest samples")]
    BufferOverflow { dropped: usize },

    #[error("invalid segment: {0}")]
    InvalidSegment(String),

    #[error("template library load failed: {0}")]
    LibraryLoad(String),

    #[error("buffer range [{start}, {start}+{len}) outside 0..{available}")]
    Range {
        start: usize,
        len: usize,
        available: usize,
    },

    #[error("processing error: {0}")]
    Processing(String),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("operation not allowed in state {0}")]
    InvalidState(String),

    #[error("non-finite sample at index {index}")]
    NonFiniteSample { index: usize },

    #[error("unknown session: {0}")]
    UnknownSession(String),

    #[error("resampler error: {0}")]
    Resample(String),

    #[error("WAV error: {0}")]
    Wav(#[from] hound::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl MeowError {
    /// Coarse classification carried by `Error` events.
    pub fn kind(&self) -> ErrorKind {
        match self {
            MeowError::BufferOverflow { .. } => ErrorKind::BufferOverflow,
            MeowError::InvalidSegment(_) => ErrorKind::InvalidSegment,
            MeowError::LibraryLoad(_) => ErrorKind::LibraryLoad,
            MeowError::Range { .. } => ErrorKind::Range,
            MeowError::InvalidConfig(_)
            | MeowError::InvalidState(_)
            | MeowError::NonFiniteSample { .. }
            | MeowError::UnknownSession(_) => ErrorKind::Contract,
            MeowError::Processing(_)
            | MeowError::Resample(_)
            | MeowError::Wav(_)
            | MeowError::Io(_)
            | MeowError::Other(_) => ErrorKind::Processing,
        }
    }
}

/// Error taxonomy exposed to event consumers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ErrorKind {
    /// Oldest samples were dropped; processing continued.
    BufferOverflow,
    /// Segment had no usable audio and was discarded.
    InvalidSegment,
    /// Template corpus could not be loaded.
    LibraryLoad,
    /// Buffer access outside the retained range.
    Range,
    /// Caller misuse (bad config, wrong state, bad input).
    Contract,
    /// Unrecoverable pipeline failure; engine needs a reset.
    Processing,
}

pub type Result<T> = std::result::Result<T, MeowError>;
