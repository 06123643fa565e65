use std::path::Path;

use meowscan_core::audio::write_wav_mono;
use meowscan_core::ipc::events::AnalysisReport;
use meowscan_core::{DetectionEngine, DetectorEvent, DetectorState, EngineConfig, MeowError};

const SR: u32 = 44_100;
const CHUNK: usize = SR as usize / 10;

/// Steady four-harmonic tone with short fades, roughly meow-shaped.
fn harmonic_tone(secs: f32, sample_rate: u32) -> Vec<f32> {
    let n = (secs * sample_rate as f32) as usize;
    let fade = (0.01 * sample_rate as f32) as usize;
    (0..n)
        .map(|i| {
            let t = i as f32 / sample_rate as f32;
            let v: f32 = [(1.0, 1.0), (2.0, 0.5), (3.0, 0.25), (4.0, 0.12)]
                .iter()
                .map(|&(h, a)| a * (2.0 * std::f32::consts::PI * 650.0 * h * t).sin())
                .sum();
            let env = (i.min(n - 1 - i) as f32 / fade as f32).min(1.0);
            0.3 * v * env
        })
        .collect()
}

fn silence(secs: f32, sample_rate: u32) -> Vec<f32> {
    vec![0.0; (secs * sample_rate as f32) as usize]
}

fn write_corpus(root: &Path, label: &str, samples: &[f32], sample_rate: u32) {
    let dir = root.join(label);
    std::fs::create_dir_all(&dir).unwrap();
    write_wav_mono(&dir.join("x.wav"), samples, sample_rate).unwrap();
}

fn started_engine(corpus: &Path) -> DetectionEngine {
    let mut engine = DetectionEngine::new(EngineConfig::default()).unwrap();
    let report = engine.load_templates(corpus).unwrap();
    assert_eq!(report.loaded, 1);
    engine.start().unwrap();
    engine
}

/// Submit `audio` in 100 ms chunks, ticking after each one.
fn stream(engine: &mut DetectionEngine, audio: &[f32], sample_rate: u32) -> Vec<DetectorEvent> {
    let chunk = sample_rate as usize / 10;
    let mut events = Vec::new();
    for part in audio.chunks(chunk) {
        engine.submit_samples(part, sample_rate).unwrap();
        events.extend(engine.tick());
    }
    events
}

fn reports(events: &[DetectorEvent]) -> Vec<&AnalysisReport> {
    events
        .iter()
        .filter_map(|e| match e {
            DetectorEvent::AnalysisResult(r) => Some(r),
            _ => None,
        })
        .collect()
}

#[test]
fn silence_keeps_listening() {
    let corpus = tempfile::tempdir().unwrap();
    write_corpus(corpus.path(), "happy_trill", &harmonic_tone(1.2, SR), SR);
    let mut engine = started_engine(corpus.path());
    assert_eq!(
        engine.drain_events(),
        vec![DetectorEvent::StateChanged(meowscan_core::ipc::events::StateChange {
            from: DetectorState::Idle,
            to: DetectorState::Listening,
        })]
    );

    let events = stream(&mut engine, &silence(2.0, SR), SR);
    assert!(events.is_empty(), "unexpected events: {events:?}");
    assert_eq!(engine.state(), DetectorState::Listening);
    assert!(engine.buffered_secs() < 0.1);
}

#[test]
fn bracketed_call_is_detected() {
    let corpus = tempfile::tempdir().unwrap();
    let call = harmonic_tone(1.2, SR);
    write_corpus(corpus.path(), "happy_trill", &call, SR);
    let mut engine = started_engine(corpus.path());
    let mut events = engine.drain_events();

    let mut audio = silence(0.5, SR);
    audio.extend_from_slice(&call);
    audio.extend(silence(0.5, SR));
    events.extend(stream(&mut engine, &audio, SR));

    let states: Vec<DetectorState> = events.iter().filter_map(|e| e.new_state()).collect();
    assert_eq!(
        states[..4],
        [
            DetectorState::Listening,
            DetectorState::Recording,
            DetectorState::Processing,
            DetectorState::Detected,
        ]
    );
    assert_eq!(engine.state(), DetectorState::Listening);

    let detected: Vec<_> = events
        .iter()
        .filter_map(|e| match e {
            DetectorEvent::MeowDetected(range) => Some(range),
            _ => None,
        })
        .collect();
    assert_eq!(detected.len(), 1);
    assert!((detected[0].start_secs - 0.5).abs() < 0.03, "{:?}", detected[0]);
    assert!((detected[0].end_secs - 1.7).abs() < 0.03, "{:?}", detected[0]);
    assert!(!detected[0].forced);

    let reports = reports(&events);
    assert_eq!(reports.len(), 1);
    let report = reports[0];
    assert!(report.detected);
    assert_eq!(report.result.label, "happy_trill");
    assert_eq!(report.result.category, "happy");
    assert_eq!(report.result.template_name, "x");
    assert!(report.result.score >= 0.99, "score={}", report.result.score);
    assert!((report.pitch_hz - 650.0).abs() < 20.0, "pitch={}", report.pitch_hz);
}

#[test]
fn long_call_is_cut_at_max_duration() {
    let corpus = tempfile::tempdir().unwrap();
    write_corpus(corpus.path(), "happy_trill", &harmonic_tone(1.2, SR), SR);
    let mut engine = started_engine(corpus.path());
    engine.drain_events();

    let events = stream(&mut engine, &harmonic_tone(6.0, SR), SR);

    let reports = reports(&events);
    assert_eq!(reports.len(), 1);
    let segment = &reports[0].segment;
    assert!(segment.forced);
    let secs = segment.end_secs - segment.start_secs;
    assert!(secs <= 5.0 + 1e-6 && secs > 4.9, "segment lasted {secs} s");

    // The remainder keeps accumulating as a new run.
    assert_eq!(engine.state(), DetectorState::Recording);
    assert_eq!(engine.pending_segments(), 0);
    assert!(engine.buffered_secs() > 0.8);
    assert_eq!(engine.diagnostics().snapshot().segments_finalized, 1);
}

#[test]
fn empty_corpus_fails_to_load_and_start() {
    let corpus = tempfile::tempdir().unwrap();
    let mut engine = DetectionEngine::new(EngineConfig::default()).unwrap();

    let err = engine.load_templates(corpus.path()).unwrap_err();
    assert!(matches!(err, MeowError::LibraryLoad(_)));
    assert_eq!(err.kind(), meowscan_core::ErrorKind::LibraryLoad);

    assert!(matches!(engine.start(), Err(MeowError::LibraryLoad(_))));
    assert_eq!(engine.state(), DetectorState::Idle);
    assert!(engine.drain_events().is_empty());
}

#[test]
fn unreadable_files_are_skipped() {
    let corpus = tempfile::tempdir().unwrap();
    write_corpus(corpus.path(), "happy_trill", &harmonic_tone(1.2, SR), SR);
    std::fs::write(corpus.path().join("happy_trill").join("broken.wav"), b"not a wav").unwrap();
    std::fs::write(corpus.path().join("README.txt"), b"loose file").unwrap();

    let mut engine = DetectionEngine::new(EngineConfig::default()).unwrap();
    let report = engine.load_templates(corpus.path()).unwrap();
    assert_eq!(report.loaded, 1);
    assert_eq!(report.skipped.len(), 2);
}

#[test]
fn low_rate_input_is_segmented_at_canonical_timing() {
    const LOW: u32 = 4_410;
    let corpus = tempfile::tempdir().unwrap();
    // Template recorded at the low rate too; the loader resamples it.
    let call = harmonic_tone(1.2, LOW);
    write_corpus(corpus.path(), "happy_trill", &call, LOW);
    let mut engine = started_engine(corpus.path());
    engine.drain_events();

    let mut audio = silence(0.5, LOW);
    audio.extend_from_slice(&call);
    audio.extend(silence(0.6, LOW));
    let events = stream(&mut engine, &audio, LOW);

    assert!(engine.diagnostics().snapshot().samples_resampled > 0);
    let reports = reports(&events);
    assert_eq!(reports.len(), 1);
    let segment = &reports[0].segment;
    let secs = segment.end_secs - segment.start_secs;
    assert!((secs - 1.2).abs() < 0.1, "segment lasted {secs} s");
    assert_eq!(reports[0].result.label, "happy_trill");
    assert!(reports[0].result.score > 0.9, "score={}", reports[0].result.score);
}

#[test]
fn restart_starts_a_clean_session() {
    let corpus = tempfile::tempdir().unwrap();
    let call = harmonic_tone(1.2, SR);
    write_corpus(corpus.path(), "happy_trill", &call, SR);
    let mut engine = started_engine(corpus.path());

    // Stop mid-run: the half-heard call must not leak into the next session.
    stream(&mut engine, &call[..CHUNK * 5], SR);
    assert_eq!(engine.state(), DetectorState::Recording);
    engine.stop().unwrap();
    assert_eq!(engine.buffered_secs(), 0.0);

    engine.start().unwrap();
    engine.drain_events();
    let events = stream(&mut engine, &silence(1.0, SR), SR);
    assert!(events.is_empty(), "unexpected events: {events:?}");
    assert_eq!(engine.state(), DetectorState::Listening);
}

#[test]
fn saved_library_detects_like_the_corpus() {
    let corpus = tempfile::tempdir().unwrap();
    let call = harmonic_tone(1.2, SR);
    write_corpus(corpus.path(), "happy_trill", &call, SR);
    let mut engine = DetectionEngine::new(EngineConfig::default()).unwrap();
    engine.load_templates(corpus.path()).unwrap();
    let saved = corpus.path().join("library.json");
    engine.library().unwrap().save_json(&saved).unwrap();

    let mut engine = DetectionEngine::new(EngineConfig::default()).unwrap();
    let report = engine.load_templates(&saved).unwrap();
    assert_eq!(report.loaded, 1);
    assert!(report.skipped.is_empty());
    engine.start().unwrap();

    let mut audio = silence(0.5, SR);
    audio.extend_from_slice(&call);
    audio.extend(silence(0.5, SR));
    let events = stream(&mut engine, &audio, SR);
    let reports = reports(&events);
    assert_eq!(reports.len(), 1);
    assert!(reports[0].detected);
    assert_eq!(reports[0].result.label, "happy_trill");
    assert!(reports[0].result.score >= 0.99, "score={}", reports[0].result.score);
}

#[test]
fn burst_larger_than_the_buffer_mid_call_is_survivable() {
    let corpus = tempfile::tempdir().unwrap();
    write_corpus(corpus.path(), "happy_trill", &harmonic_tone(1.2, SR), SR);
    let mut engine = started_engine(corpus.path());
    engine.drain_events();

    let mut events = stream(&mut engine, &harmonic_tone(3.0, SR), SR);
    assert_eq!(engine.state(), DetectorState::Recording);

    // A stalled host hands over more than the buffer holds in one call.
    let burst_secs = engine.config().buffer_capacity_secs() + 1.0;
    engine.submit_samples(&harmonic_tone(burst_secs, SR), SR).unwrap();
    events.extend(engine.tick());
    events.extend(stream(&mut engine, &silence(1.0, SR), SR));

    assert_ne!(engine.state(), DetectorState::Error);
    assert!(!events.iter().any(|e| matches!(e, DetectorEvent::Error(_))), "{events:?}");
    assert!(matches!(
        engine.take_overflow(),
        Some(MeowError::BufferOverflow { dropped }) if dropped > 0
    ));
    assert!(engine.diagnostics().snapshot().overflow_dropped > 0);

    let reports = reports(&events);
    assert!(!reports.is_empty());
    let max = engine.config().max_buffer_time;
    for report in &reports {
        let segment = &report.segment;
        assert!(segment.end_sample > segment.start_sample, "{segment:?}");
        assert!(segment.end_secs - segment.start_secs <= f64::from(max) + 1e-6, "{segment:?}");
    }
    assert!(reports.iter().any(|r| r.segment.forced));
}
