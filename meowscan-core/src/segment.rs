//! Silence-bracketed segmentation.
//!
//! ## Algorithm
//!
//! ```text
//! buffer ──► analysis windows (window, hop = window/2) ──► VAD decision
//!                                                            │
//!            Active  → open / extend the active run          │
//!            Silence → close the run once silence ≥ min_silence
//!            span ≥ max_segment → forced cut, unless silence arrives
//!                                  within one more analysis window
//! ```
//!
//! Runs shorter than `min_segment` are dropped as clicks. All positions are
//! absolute sample indices, so the segmenter survives buffer trimming between
//! ticks.

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::buffering::SampleBuffer;
use crate::vad::{VadDecision, VoiceActivityDetector};

/// A finalized candidate vocalization: absolute sample range `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Segment {
    pub start: usize,
    pub end: usize,
    pub sample_rate: u32,
    /// `true` when the segment was closed by the duration cap.
    pub forced: bool,
}

impl Segment {
    pub fn len(&self) -> usize {
        self.end.saturating_sub(self.start)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn start_secs(&self) -> f64 {
        self.start as f64 / self.sample_rate.max(1) as f64
    }

    pub fn end_secs(&self) -> f64 {
        self.end as f64 / self.sample_rate.max(1) as f64
    }

    pub fn duration_secs(&self) -> f64 {
        self.len() as f64 / self.sample_rate.max(1) as f64
    }
}

/// Segmenter parameters, all in samples at the canonical rate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SegmenterConfig {
    pub sample_rate: u32,
    pub window: usize,
    pub hop: usize,
    pub min_silence: usize,
    pub min_segment: usize,
    pub max_segment: usize,
}

impl SegmenterConfig {
    /// Derive sample counts from second-based durations.
    pub fn from_durations(
        sample_rate: u32,
        window_secs: f32,
        min_silence_secs: f32,
        min_segment_secs: f32,
        max_segment_secs: f32,
    ) -> Self {
        let to_samples = |secs: f32| (sample_rate as f64 * secs as f64).round() as usize;
        let window = to_samples(window_secs).max(2);
        Self {
            sample_rate,
            window,
            hop: (window / 2).max(1),
            min_silence: to_samples(min_silence_secs).max(1),
            min_segment: to_samples(min_segment_secs),
            max_segment: to_samples(max_segment_secs).max(window),
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct ActiveRun {
    start: usize,
    /// End of the most recent active window.
    last_active_end: usize,
    /// Cut position awaiting the next window's verdict.
    pending_cut: Option<usize>,
}

/// What one `process` call observed.
#[derive(Debug, Default, Clone)]
pub struct SegmenterOutput {
    /// Finalized segments, in order.
    pub segments: Vec<Segment>,
    /// Runs dropped for being shorter than the minimum duration.
    pub discarded: usize,
    /// A new active run opened during this call.
    pub run_started: bool,
    /// An active run is still open after this call.
    pub active: bool,
    /// Analysis windows classified.
    pub windows: usize,
}

/// Streaming silence/activity segmenter.
pub struct SilenceSegmenter {
    config: SegmenterConfig,
    vad: Box<dyn VoiceActivityDetector>,
    /// Absolute start of the next analysis window.
    cursor: usize,
    run: Option<ActiveRun>,
}

impl SilenceSegmenter {
    pub fn new(config: SegmenterConfig, vad: Box<dyn VoiceActivityDetector>) -> Self {
        Self {
            config,
            vad,
            cursor: 0,
            run: None,
        }
    }

    pub fn config(&self) -> &SegmenterConfig {
        &self.config
    }

    /// `true` while an active run is open.
    pub fn is_active(&self) -> bool {
        self.run.is_some()
    }

    /// Oldest absolute index the segmenter still needs from the buffer.
    pub fn retain_from(&self) -> usize {
        match self.run {
            Some(run) => run.start.min(self.cursor),
            None => self.cursor,
        }
    }

    /// Forget all run state (new session).
    pub fn reset(&mut self) {
        self.cursor = 0;
        self.run = None;
        self.vad.reset();
    }

    /// Classify every complete analysis window now available in `buffer`.
    pub fn process(&mut self, buffer: &SampleBuffer) -> SegmenterOutput {
        let mut out = SegmenterOutput::default();
        let cfg = self.config;

        if self.cursor < buffer.start_index() {
            warn!(
                cursor = self.cursor,
                buffer_start = buffer.start_index(),
                "segmenter fell behind trimmed buffer — resyncing"
            );
            self.cursor = buffer.start_index();
        }
        if let Some(run) = self.run.as_mut() {
            if run.start < buffer.start_index() {
                warn!(
                    run_start = run.start,
                    buffer_start = buffer.start_index(),
                    "active run head dropped by overflow"
                );
                run.start = buffer.start_index();
                run.last_active_end = run.last_active_end.max(run.start);
                // A cut behind the new head no longer bounds anything.
                run.pending_cut = run.pending_cut.filter(|&cut| cut > run.start);
            }
        }

        while self.cursor + cfg.window <= buffer.end_index() {
            let window_start = self.cursor;
            let window_end = window_start + cfg.window;
            let decision = match buffer.absolute_view(window_start, window_end) {
                Ok(window) => self.vad.classify(window),
                Err(e) => {
                    warn!(error = %e, "analysis window unavailable");
                    break;
                }
            };
            out.windows += 1;
            self.cursor += cfg.hop;
            self.step(window_start, window_end, decision, &mut out);
        }

        out.active = self.run.is_some();
        out
    }

    fn step(
        &mut self,
        window_start: usize,
        window_end: usize,
        decision: VadDecision,
        out: &mut SegmenterOutput,
    ) {
        let cfg = self.config;

        let Some(mut run) = self.run else {
            if decision.is_active() {
                debug!(start = window_start, "active run opened");
                self.run = Some(ActiveRun {
                    start: window_start,
                    last_active_end: window_end,
                    pending_cut: None,
                });
                out.run_started = true;
            }
            return;
        };

        // A forced cut waits up to one analysis window: if silence shows up
        // in that span the natural boundary wins.
        if let Some(cut) = run.pending_cut {
            if !decision.is_active() {
                self.run = None;
                self.finalize_natural(run, out);
                return;
            }
            run.last_active_end = window_end;
            if window_end.saturating_sub(cut) > cfg.window {
                let segment = Segment {
                    start: run.start,
                    end: cut,
                    sample_rate: cfg.sample_rate,
                    forced: true,
                };
                if segment.is_empty() {
                    warn!(start = run.start, end = cut, "empty forced cut dropped");
                    out.discarded += 1;
                } else {
                    debug!(start = run.start, end = cut, "forced cut at max duration");
                    out.segments.push(segment);
                }
                self.run = Some(ActiveRun {
                    start: cut,
                    last_active_end: window_end,
                    pending_cut: None,
                });
            } else {
                self.run = Some(run);
            }
            return;
        }

        match decision {
            VadDecision::Active => {
                run.last_active_end = window_end;
                if window_end - run.start >= cfg.max_segment {
                    run.pending_cut = Some(run.start + cfg.max_segment);
                }
                self.run = Some(run);
            }
            VadDecision::Silence => {
                let silence = window_end.saturating_sub(run.last_active_end);
                if silence >= cfg.min_silence || window_end - run.start >= cfg.max_segment {
                    self.run = None;
                    self.finalize_natural(run, out);
                } else {
                    self.run = Some(run);
                }
            }
        }
    }

    fn finalize_natural(&self, run: ActiveRun, out: &mut SegmenterOutput) {
        let segment = Segment {
            start: run.start,
            end: run.last_active_end,
            sample_rate: self.config.sample_rate,
            forced: false,
        };
        if segment.is_empty() || segment.len() < self.config.min_segment {
            debug!(
                start = segment.start,
                end = segment.end,
                "active run shorter than minimum, discarded"
            );
            out.discarded += 1;
        } else {
            out.segments.push(segment);
        }
    }
}
