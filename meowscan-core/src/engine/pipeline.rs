//! Background tick loop.
//!
//! ## Per tick
//!
//! ```text
//! 1. Drain the SPSC ring (capture side pushes raw samples)
//! 2. engine.submit_samples(...)       resample + append (+ advance per drained chunk)
//! 3. engine.complete(outcome)         for every finished analysis
//! 4. engine.advance()                 segment, queue finalized segments
//! 5. engine.next_job() → worker       at most one analysis in flight
//! 6. sleep tick_ms
//! ```
//!
//! Feature extraction and matching run on a dedicated worker thread fed over
//! crossbeam channels. Only this loop touches engine state, under the engine
//! mutex, so every transition is serialized. Events reach subscribers through
//! the engine's broadcast channel.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};
use std::thread::JoinHandle;
use std::time::Duration;

use crossbeam_channel::{Receiver, Sender};
use parking_lot::Mutex;
use serde::Serialize;
use tracing::{debug, error, info, info_span, warn};

use crate::{
    buffering::{create_sample_ring, Consumer, SampleConsumer, SampleProducer},
    engine::analysis::{AnalysisJob, AnalysisOutcome, Analyzer},
    engine::DetectionEngine,
    error::{MeowError, Result},
    ipc::events::DetectorState,
};

/// Samples drained from the ring per `pop_slice` call.
const DRAIN_CHUNK: usize = 4_096;

/// Counters shared between the engine, the pipeline and observers.
#[derive(Debug, Default)]
pub struct EngineDiagnostics {
    samples_in: AtomicUsize,
    samples_resampled: AtomicUsize,
    windows_analyzed: AtomicUsize,
    overflow_dropped: AtomicUsize,
    segments_finalized: AtomicUsize,
    segments_discarded: AtomicUsize,
    analyses: AtomicUsize,
    invalid_segments: AtomicUsize,
    detections: AtomicUsize,
    stale_outcomes: AtomicUsize,
    processing_errors: AtomicUsize,
}

impl EngineDiagnostics {
    pub fn reset(&self) {
        for counter in self.counters() {
            counter.store(0, Ordering::Relaxed);
        }
    }

    pub fn snapshot(&self) -> DiagnosticsSnapshot {
        DiagnosticsSnapshot {
            samples_in: self.samples_in.load(Ordering::Relaxed),
            samples_resampled: self.samples_resampled.load(Ordering::Relaxed),
            windows_analyzed: self.windows_analyzed.load(Ordering::Relaxed),
            overflow_dropped: self.overflow_dropped.load(Ordering::Relaxed),
            segments_finalized: self.segments_finalized.load(Ordering::Relaxed),
            segments_discarded: self.segments_discarded.load(Ordering::Relaxed),
            analyses: self.analyses.load(Ordering::Relaxed),
            invalid_segments: self.invalid_segments.load(Ordering::Relaxed),
            detections: self.detections.load(Ordering::Relaxed),
            stale_outcomes: self.stale_outcomes.load(Ordering::Relaxed),
            processing_errors: self.processing_errors.load(Ordering::Relaxed),
        }
    }

    fn counters(&self) -> [&AtomicUsize; 11] {
        [
            &self.samples_in,
            &self.samples_resampled,
            &self.windows_analyzed,
            &self.overflow_dropped,
            &self.segments_finalized,
            &self.segments_discarded,
            &self.analyses,
            &self.invalid_segments,
            &self.detections,
            &self.stale_outcomes,
            &self.processing_errors,
        ]
    }

    pub(crate) fn add_samples_in(&self, n: usize) {
        self.samples_in.fetch_add(n, Ordering::Relaxed);
    }

    pub(crate) fn add_samples_resampled(&self, n: usize) {
        self.samples_resampled.fetch_add(n, Ordering::Relaxed);
    }

    pub(crate) fn add_windows(&self, n: usize) {
        self.windows_analyzed.fetch_add(n, Ordering::Relaxed);
    }

    pub(crate) fn add_overflow_dropped(&self, n: usize) {
        self.overflow_dropped.fetch_add(n, Ordering::Relaxed);
    }

    pub(crate) fn add_segments_finalized(&self, n: usize) {
        self.segments_finalized.fetch_add(n, Ordering::Relaxed);
    }

    pub(crate) fn add_segments_discarded(&self, n: usize) {
        self.segments_discarded.fetch_add(n, Ordering::Relaxed);
    }

    pub(crate) fn add_analysis(&self) {
        self.analyses.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn add_invalid_segment(&self) {
        self.invalid_segments.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn add_detection(&self) {
        self.detections.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn add_stale_outcome(&self) {
        self.stale_outcomes.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn add_processing_error(&self) {
        self.processing_errors.fetch_add(1, Ordering::Relaxed);
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DiagnosticsSnapshot {
    pub samples_in: usize,
    pub samples_resampled: usize,
    pub windows_analyzed: usize,
    pub overflow_dropped: usize,
    pub segments_finalized: usize,
    pub segments_discarded: usize,
    pub analyses: usize,
    pub invalid_segments: usize,
    pub detections: usize,
    pub stale_outcomes: usize,
    pub processing_errors: usize,
}

/// Tick interval, honouring `MEOWSCAN_TICK_MS` (10–1000 ms) when set.
pub fn tick_ms(configured: u64) -> u64 {
    static TICK_MS: OnceLock<Option<u64>> = OnceLock::new();
    TICK_MS
        .get_or_init(|| {
            std::env::var("MEOWSCAN_TICK_MS")
                .ok()
                .and_then(|v| v.parse::<u64>().ok())
                .map(|v| v.clamp(10, 1_000))
        })
        .unwrap_or(configured)
}

/// Everything the loop needs, passed as one struct so the closure stays tidy.
pub struct PipelineContext {
    pub engine: Arc<Mutex<DetectionEngine>>,
    pub consumer: SampleConsumer,
    pub running: Arc<AtomicBool>,
    /// Rate of the samples pushed into the ring.
    pub capture_sample_rate: u32,
    pub job_tx: Sender<AnalysisJob>,
    pub outcome_rx: Receiver<AnalysisOutcome>,
}

/// Run the tick loop until `ctx.running` becomes false.
pub fn run(mut ctx: PipelineContext) {
    let tick = Duration::from_millis(tick_ms(ctx.engine.lock().config().tick_interval_ms));
    info!(tick_ms = tick.as_millis() as u64, "pipeline started");

    let mut raw = vec![0f32; DRAIN_CHUNK];
    let mut run_span: Option<tracing::Span> = None;

    while ctx.running.load(Ordering::Relaxed) {
        let mut engine = ctx.engine.lock();

        // ── 1–2. Drain ring and submit ───────────────────────────────────
        loop {
            let n = ctx.consumer.pop_slice(&mut raw);
            if n == 0 {
                break;
            }
            if let Err(e) = engine.submit_samples(&raw[..n], ctx.capture_sample_rate) {
                warn!(error = %e, "dropping captured samples");
            }
            // Segment as we go so a large backlog cannot overflow the buffer.
            engine.advance();
        }
        if let Some(e) = engine.take_overflow() {
            warn!(error = %e, "capture outpaced segmentation");
        }

        // ── 3. Apply finished analyses ───────────────────────────────────
        while let Ok(outcome) = ctx.outcome_rx.try_recv() {
            engine.complete(outcome);
        }

        // ── 4–5. Segment and dispatch ────────────────────────────────────
        engine.advance();
        if let Some(job) = engine.next_job() {
            debug!(
                start = job.segment.start,
                end = job.segment.end,
                "dispatching analysis"
            );
            if ctx.job_tx.send(job).is_err() {
                engine.abort(MeowError::Processing("analysis worker is gone".into()));
            }
        }

        match (engine.state(), run_span.is_some()) {
            (DetectorState::Recording, false) => {
                let span = info_span!("recording_run", generation = engine.generation());
                run_span = Some(span);
            }
            (DetectorState::Listening | DetectorState::Idle, true) => run_span = None,
            _ => {}
        }
        if let Some(span) = &run_span {
            let _enter = span.enter();
            debug!(buffered_secs = engine.buffered_secs(), "tick");
        }

        // Events were already broadcast; keep the outbox from growing.
        engine.drain_events();
        drop(engine);

        std::thread::sleep(tick);
    }

    info!("pipeline stopped");
}

/// Worker loop: analyze jobs until the job channel closes.
pub fn run_worker(analyzer: Analyzer, jobs: Receiver<AnalysisJob>, outcomes: Sender<AnalysisOutcome>) {
    for job in jobs.iter() {
        let outcome = analyzer.analyze(job);
        if outcomes.send(outcome).is_err() {
            break;
        }
    }
    debug!("analysis worker exiting");
}

/// A `DetectionEngine` driven by a background tick loop.
///
/// ```ignore
/// let (detector, mut producer) = BackgroundDetector::start(engine, 44_100)?;
/// producer.push_slice(&captured);
/// // ... events arrive on receivers from engine.subscribe()
/// let engine = detector.stop()?;
/// ```
pub struct BackgroundDetector {
    engine: Arc<Mutex<DetectionEngine>>,
    running: Arc<AtomicBool>,
    pipeline: Option<JoinHandle<()>>,
    worker: Option<JoinHandle<()>>,
}

impl BackgroundDetector {
    /// Start `engine` (if idle) and spawn the tick loop plus one analysis
    /// worker. Returns the producer end of the capture ring.
    pub fn start(
        mut engine: DetectionEngine,
        capture_sample_rate: u32,
    ) -> Result<(Self, SampleProducer)> {
        if engine.state() == DetectorState::Idle {
            engine.start()?;
        }
        let analyzer = engine
            .analyzer()
            .ok_or_else(|| MeowError::LibraryLoad("no template library loaded".into()))?;

        let (producer, consumer) = create_sample_ring();
        let (job_tx, job_rx) = crossbeam_channel::bounded::<AnalysisJob>(4);
        let (outcome_tx, outcome_rx) = crossbeam_channel::unbounded::<AnalysisOutcome>();
        let engine = Arc::new(Mutex::new(engine));
        let running = Arc::new(AtomicBool::new(true));

        let worker = std::thread::Builder::new()
            .name("meowscan-analysis".into())
            .spawn(move || run_worker(analyzer, job_rx, outcome_tx))?;

        let ctx = PipelineContext {
            engine: Arc::clone(&engine),
            consumer,
            running: Arc::clone(&running),
            capture_sample_rate,
            job_tx,
            outcome_rx,
        };
        let pipeline = match std::thread::Builder::new()
            .name("meowscan-pipeline".into())
            .spawn(move || run(ctx))
        {
            Ok(handle) => handle,
            Err(e) => {
                // The worker exits once its job sender (inside ctx) is dropped.
                let _ = worker.join();
                return Err(e.into());
            }
        };

        Ok((
            Self {
                engine,
                running,
                pipeline: Some(pipeline),
                worker: Some(worker),
            },
            producer,
        ))
    }

    /// Shared handle for state queries and subscriptions while running.
    pub fn engine(&self) -> &Arc<Mutex<DetectionEngine>> {
        &self.engine
    }

    pub fn state(&self) -> DetectorState {
        self.engine.lock().state()
    }

    /// Stop the loop and worker, stop the engine and hand it back `Idle`.
    ///
    /// Any analysis still in flight is discarded.
    pub fn stop(mut self) -> Result<DetectionEngine> {
        self.shutdown();
        let engine = Arc::clone(&self.engine);
        drop(self);
        let mut engine = Arc::try_unwrap(engine)
            .map_err(|_| MeowError::InvalidState("engine handle is still shared".into()))?
            .into_inner();
        if !matches!(engine.state(), DetectorState::Idle | DetectorState::Error) {
            engine.stop()?;
        }
        Ok(engine)
    }

    fn shutdown(&mut self) {
        self.running.store(false, Ordering::SeqCst);
        if let Some(handle) = self.pipeline.take() {
            if handle.join().is_err() {
                error!("pipeline thread panicked");
            }
        }
        if let Some(handle) = self.worker.take() {
            if handle.join().is_err() {
                error!("analysis worker panicked");
            }
        }
    }
}

impl Drop for BackgroundDetector {
    fn drop(&mut self) {
        self.shutdown();
    }
}
