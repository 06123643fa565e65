//! `DetectionEngine` — the per-session state machine.
//!
//! ## Lifecycle
//!
//! ```text
//! DetectionEngine::new(config)
//!     └─► load_templates() / set_library()     state = Idle
//!         └─► start()        → Listening
//!             ├─► submit_samples() + tick()   (repeat)
//!             └─► stop()     → Idle, buffers cleared
//! ```
//!
//! ## Tick
//!
//! ```text
//! Detected ──► Listening                         (start of next tick)
//! segmenter.process(buffer)
//!   run opened          Listening ──► Recording
//!   segment finalized   Recording ──► Processing ──► analyze
//!   score ≥ threshold   Processing ──► Detected   + MeowDetected + AnalysisResult
//!   score < threshold   AnalysisResult + Processing ──► Listening
//!   invalid segment     Processing ──► Listening
//!   buffer/engine fault any ──► Error             + Error
//! ```
//!
//! `tick()` analyzes inline. The background pipeline splits the same work into
//! `advance()` / `next_job()` / `complete()` so analysis can run on a worker
//! thread while this struct stays the only writer of state.

pub mod analysis;
pub mod pipeline;

use std::collections::{hash_map::Entry, HashMap, VecDeque};
use std::path::Path;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::{debug, error, info};

use crate::{
    audio::{ensure_finite, resample::DEFAULT_CHUNK, RateConverter},
    buffering::SampleBuffer,
    error::{MeowError, Result},
    features::{FeatureConfig, FeatureExtractor},
    ipc::events::{
        AnalysisReport, DetectorEvent, DetectorState, ErrorReport, SegmentRange, StateChange,
    },
    library::{LoadReport, TemplateLibrary},
    segment::{SegmenterConfig, SilenceSegmenter},
    vad::EnergyVad,
};
use analysis::{AnalysisJob, AnalysisOutcome, Analyzer};
use pipeline::EngineDiagnostics;

/// Broadcast channel capacity: events buffered for slow subscribers.
const BROADCAST_CAP: usize = 256;

/// Extra buffer room beyond the longest segment plus its closing silence.
const BUFFER_HEADROOM_SECS: f32 = 2.0;

/// Engine configuration. Field names serialize in camelCase.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct EngineConfig {
    /// Canonical processing rate (Hz). Other input rates are resampled.
    pub sample_rate: u32,
    /// RMS level separating silence from activity (normalized amplitude).
    pub silence_threshold: f32,
    /// Continuous silence (s) that closes an active run.
    pub min_silence_time: f32,
    /// Shortest run (s) analyzed; shorter bursts are dropped.
    pub min_process_time: f32,
    /// Longest segment (s) before a forced cut.
    pub max_buffer_time: f32,
    /// Minimum match score in [0, 1] to report a detection.
    pub confidence_threshold: f32,
    /// Segmenter window and feature frame length (s).
    pub analysis_window: f32,
    /// Pipeline tick interval (ms).
    pub tick_interval_ms: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            sample_rate: 44_100,
            silence_threshold: 0.02,
            min_silence_time: 0.3,
            min_process_time: 1.0,
            max_buffer_time: 5.0,
            confidence_threshold: 0.8,
            analysis_window: 0.025,
            tick_interval_ms: 100,
        }
    }
}

impl EngineConfig {
    /// Read a JSON config file; missing fields take their defaults.
    pub fn from_json_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&text)
            .map_err(|e| MeowError::InvalidConfig(format!("{}: {e}", path.display())))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        let positive = [
            ("minSilenceTime", self.min_silence_time),
            ("maxBufferTime", self.max_buffer_time),
            ("analysisWindow", self.analysis_window),
        ];
        for (name, value) in positive {
            if !(value.is_finite() && value > 0.0) {
                return Err(MeowError::InvalidConfig(format!(
                    "{name} must be positive, got {value}"
                )));
            }
        }
        if self.sample_rate < 1_000 {
            return Err(MeowError::InvalidConfig(format!(
                "sampleRate {} is below 1000 Hz",
                self.sample_rate
            )));
        }
        if !(self.silence_threshold.is_finite() && self.silence_threshold > 0.0) {
            return Err(MeowError::InvalidConfig(format!(
                "silenceThreshold must be positive, got {}",
                self.silence_threshold
            )));
        }
        if !(0.0..=1.0).contains(&self.confidence_threshold) {
            return Err(MeowError::InvalidConfig(format!(
                "confidenceThreshold must be in [0, 1], got {}",
                self.confidence_threshold
            )));
        }
        if !(self.min_process_time.is_finite() && self.min_process_time >= 0.0) {
            return Err(MeowError::InvalidConfig(format!(
                "minProcessTime must be non-negative, got {}",
                self.min_process_time
            )));
        }
        if self.min_process_time > self.max_buffer_time {
            return Err(MeowError::InvalidConfig(format!(
                "minProcessTime ({}) exceeds maxBufferTime ({})",
                self.min_process_time, self.max_buffer_time
            )));
        }
        if self.analysis_window >= self.max_buffer_time {
            return Err(MeowError::InvalidConfig(
                "analysisWindow must be shorter than maxBufferTime".into(),
            ));
        }
        if self.tick_interval_ms == 0 {
            return Err(MeowError::InvalidConfig("tickIntervalMs must be positive".into()));
        }
        Ok(())
    }

    /// Feature extraction settings matching this engine; build the template
    /// library with the same ones.
    pub fn feature_config(&self) -> FeatureConfig {
        FeatureConfig::for_sample_rate(self.sample_rate, self.analysis_window)
    }

    pub fn segmenter_config(&self) -> SegmenterConfig {
        SegmenterConfig::from_durations(
            self.sample_rate,
            self.analysis_window,
            self.min_silence_time,
            self.min_process_time,
            self.max_buffer_time,
        )
    }

    /// SampleBuffer capacity in seconds.
    pub fn buffer_capacity_secs(&self) -> f32 {
        self.max_buffer_time + self.min_silence_time + BUFFER_HEADROOM_SECS
    }

    /// Apply a partial update.
    pub fn merged(&self, options: &DetectorOptions) -> Self {
        let mut next = self.clone();
        if let Some(v) = options.sample_rate {
            next.sample_rate = v;
        }
        if let Some(v) = options.silence_threshold {
            next.silence_threshold = v;
        }
        if let Some(v) = options.min_silence_time {
            next.min_silence_time = v;
        }
        if let Some(v) = options.min_process_time {
            next.min_process_time = v;
        }
        if let Some(v) = options.max_buffer_time {
            next.max_buffer_time = v;
        }
        if let Some(v) = options.confidence_threshold {
            next.confidence_threshold = v;
        }
        next
    }
}

/// Options accepted by `configure`; unset fields keep their current value.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DetectorOptions {
    pub sample_rate: Option<u32>,
    pub silence_threshold: Option<f32>,
    pub min_silence_time: Option<f32>,
    pub min_process_time: Option<f32>,
    pub max_buffer_time: Option<f32>,
    pub confidence_threshold: Option<f32>,
}

/// Single-session detector. Not shared across sessions; see `SessionRegistry`.
pub struct DetectionEngine {
    config: EngineConfig,
    extractor: Arc<FeatureExtractor>,
    library: Option<Arc<TemplateLibrary>>,
    buffer: SampleBuffer,
    segmenter: SilenceSegmenter,
    /// One converter per foreign input rate, so partial chunks carry over.
    converters: HashMap<u32, RateConverter>,
    state: DetectorState,
    /// Bumped on every start/stop/reset; outcomes from older generations are stale.
    generation: u64,
    /// Finalized segments awaiting analysis, oldest first.
    pending: VecDeque<AnalysisJob>,
    in_flight: bool,
    /// Samples dropped by overflow since the last `take_overflow`.
    overflow_pending: usize,
    outbox: Vec<DetectorEvent>,
    events_tx: broadcast::Sender<DetectorEvent>,
    diagnostics: Arc<EngineDiagnostics>,
}

impl std::fmt::Debug for DetectionEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DetectionEngine")
            .field("state", &self.state)
            .field("generation", &self.generation)
            .field("buffered", &self.buffer.len())
            .field("pending", &self.pending.len())
            .finish()
    }
}

impl DetectionEngine {
    /// Create an idle engine with no templates. Load some before `start()`.
    pub fn new(config: EngineConfig) -> Result<Self> {
        config.validate()?;
        let extractor = Arc::new(FeatureExtractor::new(config.feature_config())?);
        let (events_tx, _) = broadcast::channel(BROADCAST_CAP);
        Ok(Self {
            buffer: SampleBuffer::new(config.sample_rate, config.buffer_capacity_secs()),
            segmenter: build_segmenter(&config),
            config,
            extractor,
            library: None,
            converters: HashMap::new(),
            state: DetectorState::Idle,
            generation: 0,
            pending: VecDeque::new(),
            in_flight: false,
            overflow_pending: 0,
            outbox: Vec::new(),
            events_tx,
            diagnostics: Arc::new(EngineDiagnostics::default()),
        })
    }

    /// Create an idle engine around an already-loaded library.
    pub fn with_library(config: EngineConfig, library: Arc<TemplateLibrary>) -> Result<Self> {
        let mut engine = Self::new(config)?;
        engine.set_library(library)?;
        Ok(engine)
    }

    /// Load templates from a corpus directory or a saved JSON library with
    /// this engine's extractor.
    ///
    /// On failure the engine keeps its previous library (if any) and stays
    /// `Idle`.
    pub fn load_templates(&mut self, path: &Path) -> Result<LoadReport> {
        self.require_idle("load templates")?;
        let library = TemplateLibrary::open(path, &self.extractor)?;
        let report = library.report().clone();
        self.library = Some(Arc::new(library));
        Ok(report)
    }

    /// Install a shared library built elsewhere.
    pub fn set_library(&mut self, library: Arc<TemplateLibrary>) -> Result<()> {
        self.require_idle("set library")?;
        self.check_library(&library, &self.config)?;
        self.library = Some(library);
        Ok(())
    }

    /// Apply option changes. Only allowed while `Idle`.
    pub fn configure(&mut self, options: &DetectorOptions) -> Result<()> {
        self.require_idle("configure")?;
        let next = self.config.merged(options);
        next.validate()?;
        if let Some(library) = &self.library {
            self.check_library(library, &next)?;
        }
        if next.feature_config() != self.config.feature_config() {
            self.extractor = Arc::new(FeatureExtractor::new(next.feature_config())?);
        }
        self.buffer = SampleBuffer::new(next.sample_rate, next.buffer_capacity_secs());
        self.segmenter = build_segmenter(&next);
        self.converters.clear();
        info!(?options, "engine reconfigured");
        self.config = next;
        Ok(())
    }

    /// `Idle → Listening`. Requires a loaded library.
    pub fn start(&mut self) -> Result<()> {
        self.require_idle("start")?;
        if self.library.is_none() {
            return Err(MeowError::LibraryLoad(
                "no template library loaded; call load_templates first".into(),
            ));
        }
        self.clear_session();
        self.diagnostics.reset();
        self.transition(DetectorState::Listening);
        info!(generation = self.generation, "detector started");
        Ok(())
    }

    /// Any running state → `Idle`. Buffers are cleared and in-flight
    /// analysis results are discarded when they arrive.
    pub fn stop(&mut self) -> Result<()> {
        match self.state {
            DetectorState::Idle => return Err(MeowError::InvalidState("idle".into())),
            DetectorState::Error => {
                return Err(MeowError::InvalidState(
                    "error (call reset to recover)".into(),
                ))
            }
            _ => {}
        }
        self.clear_session();
        self.transition(DetectorState::Idle);
        info!("detector stopped");
        Ok(())
    }

    /// `Error → Idle`.
    pub fn reset(&mut self) -> Result<()> {
        if self.state != DetectorState::Error {
            return Err(MeowError::InvalidState(format!(
                "{} (reset only recovers from error)",
                self.state
            )));
        }
        self.clear_session();
        self.transition(DetectorState::Idle);
        info!("detector reset");
        Ok(())
    }

    /// Append `samples` captured at `sample_rate` to the session buffer.
    ///
    /// Foreign rates are converted to the canonical rate first. Non-finite
    /// input is rejected without touching the buffer.
    pub fn submit_samples(&mut self, samples: &[f32], sample_rate: u32) -> Result<()> {
        match self.state {
            DetectorState::Idle | DetectorState::Error => {
                return Err(MeowError::InvalidState(format!(
                    "{} (submit_samples needs a started detector)",
                    self.state
                )))
            }
            _ => {}
        }
        if sample_rate == 0 {
            return Err(MeowError::InvalidConfig("input sample rate is zero".into()));
        }
        ensure_finite(samples)?;
        self.diagnostics.add_samples_in(samples.len());

        let dropped = if sample_rate == self.config.sample_rate {
            self.buffer.append(samples)
        } else {
            let converter = match self.converters.entry(sample_rate) {
                Entry::Occupied(slot) => slot.into_mut(),
                Entry::Vacant(slot) => {
                    let converter =
                        RateConverter::new(sample_rate, self.config.sample_rate, DEFAULT_CHUNK)?;
                    info!(
                        from = sample_rate,
                        to = self.config.sample_rate,
                        "resampling input stream"
                    );
                    slot.insert(converter)
                }
            };
            let converted = converter.process(samples)?;
            self.diagnostics.add_samples_resampled(converted.len());
            self.buffer.append(&converted)
        };

        if dropped > 0 {
            self.overflow_pending += dropped;
            self.diagnostics.add_overflow_dropped(dropped);
        }
        Ok(())
    }

    /// Run one processing tick inline and return the events it produced.
    pub fn tick(&mut self) -> Vec<DetectorEvent> {
        self.advance();
        if let Some(library) = self.library.clone() {
            let analyzer = Analyzer::new(Arc::clone(&self.extractor), library);
            while let Some(job) = self.next_job() {
                let outcome = analyzer.analyze(job);
                self.complete(outcome);
            }
        }
        self.settle();
        self.drain_events()
    }

    /// Segment newly buffered audio and queue finalized segments.
    pub fn advance(&mut self) {
        match self.state {
            DetectorState::Idle | DetectorState::Error => return,
            DetectorState::Detected if !self.in_flight => {
                self.walk_to(DetectorState::Listening);
            }
            _ => {}
        }

        let out = self.segmenter.process(&self.buffer);
        self.diagnostics.add_windows(out.windows);
        self.diagnostics.add_segments_discarded(out.discarded);

        for segment in out.segments {
            let samples = match self.buffer.absolute_view(segment.start, segment.end) {
                Ok(view) => view.to_vec(),
                Err(e) => {
                    self.fail(e);
                    return;
                }
            };
            self.diagnostics.add_segments_finalized(1);
            info!(
                start = segment.start,
                end = segment.end,
                secs = segment.duration_secs(),
                forced = segment.forced,
                "segment finalized"
            );
            self.pending.push_back(AnalysisJob {
                generation: self.generation,
                segment,
                samples,
            });
        }

        self.buffer.discard_before(self.segmenter.retain_from());
        self.settle();
    }

    /// Take the next queued segment for analysis, moving to `Processing`.
    ///
    /// Returns `None` while another job is in flight: segments are analyzed
    /// one at a time, in order.
    pub fn next_job(&mut self) -> Option<AnalysisJob> {
        if self.in_flight || !self.is_running() {
            return None;
        }
        let job = self.pending.pop_front()?;
        self.walk_to(DetectorState::Processing);
        self.in_flight = true;
        Some(job)
    }

    /// Apply an analysis outcome. Stale outcomes (older generation) are dropped.
    pub fn complete(&mut self, outcome: AnalysisOutcome) {
        if outcome.generation != self.generation || !self.in_flight {
            self.diagnostics.add_stale_outcome();
            debug!(
                outcome_generation = outcome.generation,
                generation = self.generation,
                "discarding stale analysis outcome"
            );
            return;
        }
        self.in_flight = false;

        let segment = outcome.segment;
        match outcome.result {
            Ok(analysis) => {
                self.diagnostics.add_analysis();
                let matched = analysis.matched;
                let detected = matched.score >= self.config.confidence_threshold;
                info!(
                    label = %matched.label,
                    score = matched.score,
                    detected,
                    elapsed_ms = outcome.elapsed.as_millis() as u64,
                    "segment analyzed"
                );
                let report = AnalysisReport {
                    result: matched,
                    segment: SegmentRange::from(&segment),
                    detected,
                    pitch_hz: analysis.features.pitch_hz,
                    descriptors: analysis.features.descriptors,
                };
                if detected {
                    self.diagnostics.add_detection();
                    self.walk_to(DetectorState::Detected);
                    self.emit(DetectorEvent::MeowDetected(report.segment));
                    self.emit(DetectorEvent::AnalysisResult(report));
                } else {
                    self.emit(DetectorEvent::AnalysisResult(report));
                    self.walk_to(DetectorState::Listening);
                }
            }
            Err(MeowError::InvalidSegment(reason)) => {
                self.diagnostics.add_invalid_segment();
                debug!(reason = %reason, "segment had no usable audio, discarded");
                self.walk_to(DetectorState::Listening);
            }
            Err(e) => self.fail(e),
        }
    }

    /// Overflow since the last call, as a `BufferOverflow`.
    ///
    /// Overflow never changes state or emits an event; the oldest samples are
    /// already gone and segmentation carries on from what is left.
    pub fn take_overflow(&mut self) -> Option<MeowError> {
        let dropped = std::mem::take(&mut self.overflow_pending);
        (dropped > 0).then_some(MeowError::BufferOverflow { dropped })
    }

    /// Events produced since the last drain (already broadcast).
    pub fn drain_events(&mut self) -> Vec<DetectorEvent> {
        std::mem::take(&mut self.outbox)
    }

    /// Subscribe to the live event stream.
    pub fn subscribe(&self) -> broadcast::Receiver<DetectorEvent> {
        self.events_tx.subscribe()
    }

    pub fn state(&self) -> DetectorState {
        self.state
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn library(&self) -> Option<&Arc<TemplateLibrary>> {
        self.library.as_ref()
    }

    pub fn extractor(&self) -> &Arc<FeatureExtractor> {
        &self.extractor
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Seconds of audio currently held in the buffer.
    pub fn buffered_secs(&self) -> f64 {
        self.buffer.len() as f64 / self.config.sample_rate as f64
    }

    /// Segments queued but not yet analyzed.
    pub fn pending_segments(&self) -> usize {
        self.pending.len() + usize::from(self.in_flight)
    }

    pub fn diagnostics(&self) -> &Arc<EngineDiagnostics> {
        &self.diagnostics
    }

    /// Extractor and matcher for running analysis off-thread.
    pub fn analyzer(&self) -> Option<Analyzer> {
        self.library
            .as_ref()
            .map(|lib| Analyzer::new(Arc::clone(&self.extractor), Arc::clone(lib)))
    }

    /// Force the engine into `Error` (e.g. the analysis worker died).
    pub fn abort(&mut self, e: MeowError) {
        if self.is_running() {
            self.fail(e);
        }
    }

    // ── Internal helpers ─────────────────────────────────────────────────────

    fn is_running(&self) -> bool {
        !matches!(self.state, DetectorState::Idle | DetectorState::Error)
    }

    fn require_idle(&self, op: &str) -> Result<()> {
        if self.state == DetectorState::Idle {
            Ok(())
        } else {
            Err(MeowError::InvalidState(format!(
                "{} ({op} requires idle)",
                self.state
            )))
        }
    }

    fn check_library(&self, library: &TemplateLibrary, config: &EngineConfig) -> Result<()> {
        if library.sample_rate() != config.sample_rate {
            return Err(MeowError::InvalidConfig(format!(
                "templates were extracted at {} Hz but the engine runs at {} Hz",
                library.sample_rate(),
                config.sample_rate
            )));
        }
        if library.coefficient_count() != config.feature_config().n_coefficients {
            return Err(MeowError::InvalidConfig(format!(
                "templates carry {} coefficients, extractor produces {}",
                library.coefficient_count(),
                config.feature_config().n_coefficients
            )));
        }
        Ok(())
    }

    fn clear_session(&mut self) {
        self.generation += 1;
        self.buffer.clear();
        self.segmenter.reset();
        self.converters.clear();
        self.pending.clear();
        self.in_flight = false;
        self.overflow_pending = 0;
    }

    /// Lift `Listening` to `Recording` while a run is open, and drop back when
    /// a run was discarded without producing a segment.
    fn settle(&mut self) {
        if self.in_flight || !self.pending.is_empty() {
            return;
        }
        match self.state {
            DetectorState::Listening if self.segmenter.is_active() => {
                self.walk_to(DetectorState::Recording)
            }
            DetectorState::Recording if !self.segmenter.is_active() => {
                self.walk_to(DetectorState::Listening)
            }
            _ => {}
        }
    }

    /// Step along the state cycle to `target`, emitting every hop.
    fn walk_to(&mut self, target: DetectorState) {
        use DetectorState::*;
        while self.state != target {
            let next = match (self.state, target) {
                (Detected, _) => Listening,
                (Listening, Recording | Processing | Detected) => Recording,
                (Recording, Processing | Detected) => Processing,
                _ => target,
            };
            self.transition(next);
        }
    }

    fn transition(&mut self, to: DetectorState) {
        let from = self.state;
        if from == to {
            return;
        }
        self.state = to;
        debug!(%from, %to, "state changed");
        self.emit(DetectorEvent::StateChanged(StateChange { from, to }));
    }

    fn fail(&mut self, e: MeowError) {
        error!(error = %e, state = %self.state, "detector fault — entering error state");
        self.diagnostics.add_processing_error();
        self.pending.clear();
        self.in_flight = false;
        self.transition(DetectorState::Error);
        self.emit(DetectorEvent::Error(ErrorReport::from(&e)));
    }

    fn emit(&mut self, event: DetectorEvent) {
        // Err only means nobody is subscribed right now.
        let _ = self.events_tx.send(event.clone());
        self.outbox.push(event);
    }
}

fn build_segmenter(config: &EngineConfig) -> SilenceSegmenter {
    SilenceSegmenter::new(
        config.segmenter_config(),
        Box::new(EnergyVad::new(config.silence_threshold)),
    )
}
