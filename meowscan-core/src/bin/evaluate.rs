//! Offline corpus evaluation.
//!
//! Streams every WAV under `--recordings` through a detection engine in
//! tick-sized chunks and reports what was detected. When a recording lives in
//! a subdirectory named after a template label, that label is treated as the
//! expected match and counted toward accuracy.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use anyhow::{bail, Context};
use meowscan_core::{
    audio::{is_wav_path, read_wav_mono},
    library::TemplateLibrary,
    DetectionEngine, DetectorEvent, DetectorState, EngineConfig, FeatureExtractor,
};
use serde::Serialize;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Debug)]
struct Args {
    templates: PathBuf,
    recordings: PathBuf,
    config: Option<PathBuf>,
    output: Option<PathBuf>,
    save_library: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
struct Detection {
    start_secs: f64,
    end_secs: f64,
    forced: bool,
    label: String,
    category: String,
    score: f32,
    pitch_hz: f32,
    detected: bool,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
struct FileResult {
    file: String,
    expected: Option<String>,
    duration_secs: f64,
    processing_ms: f64,
    segments: usize,
    detections: Vec<Detection>,
    /// Best detected label matched the expected one.
    correct: Option<bool>,
    errors: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
struct Summary {
    templates_dir: String,
    recordings_dir: String,
    templates: usize,
    labels: Vec<String>,
    files: usize,
    files_with_detection: usize,
    segments: usize,
    detections: usize,
    accuracy: Option<f64>,
    p50_processing_ms: f64,
    p95_processing_ms: f64,
    by_label: BTreeMap<String, usize>,
    results: Vec<FileResult>,
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("meowscan=info")),
        )
        .with_writer(std::io::stderr)
        .init();

    if let Err(e) = run() {
        eprintln!("evaluate failed: {e:#}");
        std::process::exit(1);
    }
}

fn parse_args() -> anyhow::Result<Args> {
    let mut templates: Option<PathBuf> = None;
    let mut recordings: Option<PathBuf> = None;
    let mut config: Option<PathBuf> = None;
    let mut output: Option<PathBuf> = None;
    let mut save_library: Option<PathBuf> = None;

    let mut it = std::env::args().skip(1);
    while let Some(arg) = it.next() {
        let mut value = |flag: &str| -> anyhow::Result<PathBuf> {
            it.next()
                .map(PathBuf::from)
                .with_context(|| format!("missing value for {flag}"))
        };
        match arg.as_str() {
            "--templates" => templates = Some(value("--templates")?),
            "--recordings" => recordings = Some(value("--recordings")?),
            "--config" => config = Some(value("--config")?),
            "--output" => output = Some(value("--output")?),
            "--save-library" => save_library = Some(value("--save-library")?),
            "--help" | "-h" => {
                println!(
                    "Usage: cargo run -p meowscan-core --bin evaluate -- \\
  --templates <dir|library.json> --recordings <dir> [--config <engine.json>] \\
  [--output <file.json>] [--save-library <library.json>]"
                );
                std::process::exit(0);
            }
            other => bail!("unknown argument: {other}"),
        }
    }

    Ok(Args {
        templates: templates.context("--templates is required")?,
        recordings: recordings.context("--recordings is required")?,
        config,
        output,
        save_library,
    })
}

fn collect_wavs(dir: &Path, out: &mut Vec<PathBuf>) -> anyhow::Result<()> {
    for entry in std::fs::read_dir(dir).with_context(|| format!("reading {}", dir.display()))? {
        let path = entry?.path();
        if path.is_dir() {
            collect_wavs(&path, out)?;
        } else if is_wav_path(&path) {
            out.push(path);
        }
    }
    Ok(())
}

fn percentile(values: &[f64], p: f64) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    let mut sorted = values.to_vec();
    sorted.sort_by(|a, b| a.total_cmp(b));
    let idx = ((sorted.len() - 1) as f64 * p.clamp(0.0, 1.0)).round() as usize;
    sorted[idx.min(sorted.len() - 1)]
}

/// Stream one recording through a fresh session of `engine`.
fn evaluate_file(
    engine: &mut DetectionEngine,
    path: &Path,
    recordings_dir: &Path,
    labels: &[String],
) -> anyhow::Result<FileResult> {
    let clip = read_wav_mono(path)?;
    let expected = path
        .parent()
        .and_then(|p| p.file_name())
        .and_then(|n| n.to_str())
        .filter(|n| labels.iter().any(|l| l == n))
        .map(str::to_string);

    let started = Instant::now();
    engine.start()?;
    let chunk = (clip.sample_rate as u64 * engine.config().tick_interval_ms / 1_000).max(1) as usize;
    // Trailing silence closes a run still open at end of file.
    let tail_secs = engine.config().min_silence_time + 2.0 * engine.config().analysis_window;
    let tail = vec![0.0f32; (clip.sample_rate as f32 * tail_secs).ceil() as usize + chunk];

    let mut events = Vec::new();
    for part in clip.samples.chunks(chunk).chain(tail.chunks(chunk)) {
        if engine.state() == DetectorState::Error {
            break;
        }
        engine.submit_samples(part, clip.sample_rate)?;
        events.extend(engine.tick());
    }
    let overflow = engine.take_overflow();
    if engine.state() == DetectorState::Error {
        engine.reset()?;
    } else {
        engine.stop()?;
    }
    events.extend(engine.drain_events());
    let processing_ms = started.elapsed().as_secs_f64() * 1000.0;

    let mut detections = Vec::new();
    let mut errors = Vec::new();
    for event in events {
        match event {
            DetectorEvent::AnalysisResult(r) => detections.push(Detection {
                start_secs: r.segment.start_secs,
                end_secs: r.segment.end_secs,
                forced: r.segment.forced,
                label: r.result.label,
                category: r.result.category,
                score: r.result.score,
                pitch_hz: r.pitch_hz,
                detected: r.detected,
            }),
            DetectorEvent::Error(e) => errors.push(e.message),
            _ => {}
        }
    }
    errors.extend(overflow.map(|e| e.to_string()));

    let best = detections
        .iter()
        .filter(|d| d.detected)
        .fold(None::<&Detection>, |best, d| match best {
            Some(b) if b.score >= d.score => Some(b),
            _ => Some(d),
        });
    let correct = expected
        .as_ref()
        .map(|exp| best.map(|b| &b.label == exp).unwrap_or(false));

    Ok(FileResult {
        file: path
            .strip_prefix(recordings_dir)
            .unwrap_or(path)
            .display()
            .to_string(),
        expected,
        duration_secs: clip.duration_secs(),
        processing_ms,
        segments: detections.len(),
        detections,
        correct,
        errors,
    })
}

fn run() -> anyhow::Result<()> {
    let args = parse_args()?;

    let config = match &args.config {
        Some(path) => EngineConfig::from_json_file(path)?,
        None => EngineConfig::default(),
    };
    let extractor = FeatureExtractor::new(config.feature_config())?;
    let library = Arc::new(
        TemplateLibrary::open(&args.templates, &extractor)
            .with_context(|| format!("loading templates from {}", args.templates.display()))?,
    );
    let labels: Vec<String> = library.labels().into_iter().map(str::to_string).collect();
    info!(
        templates = library.len(),
        labels = labels.len(),
        "template library ready"
    );
    if let Some(path) = &args.save_library {
        library
            .save_json(path)
            .with_context(|| format!("saving library to {}", path.display()))?;
    }

    let mut wavs = Vec::new();
    collect_wavs(&args.recordings, &mut wavs)?;
    wavs.sort();
    if wavs.is_empty() {
        bail!("no .wav recordings found in {}", args.recordings.display());
    }

    let mut engine = DetectionEngine::with_library(config, Arc::clone(&library))?;
    let mut results = Vec::new();
    for wav in &wavs {
        match evaluate_file(&mut engine, wav, &args.recordings, &labels) {
            Ok(result) => {
                println!(
                    "{} segments={} detected={} {:.1} ms",
                    result.file,
                    result.segments,
                    result.detections.iter().filter(|d| d.detected).count(),
                    result.processing_ms
                );
                results.push(result);
            }
            Err(e) => {
                warn!(file = %wav.display(), error = %e, "recording skipped");
                if engine.stop().is_err() {
                    let _ = engine.reset();
                }
            }
        }
    }

    let mut by_label: BTreeMap<String, usize> = BTreeMap::new();
    for d in results.iter().flat_map(|r| &r.detections).filter(|d| d.detected) {
        *by_label.entry(d.label.clone()).or_default() += 1;
    }
    let judged: Vec<bool> = results.iter().filter_map(|r| r.correct).collect();
    let timings: Vec<f64> = results.iter().map(|r| r.processing_ms).collect();

    let summary = Summary {
        templates_dir: args.templates.display().to_string(),
        recordings_dir: args.recordings.display().to_string(),
        templates: library.len(),
        labels,
        files: results.len(),
        files_with_detection: results
            .iter()
            .filter(|r| r.detections.iter().any(|d| d.detected))
            .count(),
        segments: results.iter().map(|r| r.segments).sum(),
        detections: by_label.values().sum(),
        accuracy: if judged.is_empty() {
            None
        } else {
            Some(judged.iter().filter(|&&c| c).count() as f64 / judged.len() as f64)
        },
        p50_processing_ms: percentile(&timings, 0.50),
        p95_processing_ms: percentile(&timings, 0.95),
        by_label,
        results,
    };

    println!(
        "Done. files={} segments={} detections={} accuracy={}",
        summary.files,
        summary.segments,
        summary.detections,
        summary
            .accuracy
            .map(|a| format!("{:.1}%", a * 100.0))
            .unwrap_or_else(|| "n/a".into())
    );

    let json = serde_json::to_string_pretty(&summary)?;
    if let Some(out) = args.output {
        if let Some(parent) = out.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&out, json)?;
        println!("Wrote evaluation report: {}", out.display());
    } else {
        println!("{json}");
    }

    Ok(())
}
