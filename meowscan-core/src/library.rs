//! Labeled reference templates, loaded once from a corpus directory.
//!
//! Layout:
//!
//! ```text
//! corpus/
//!   happy_purr/   a.wav  b.wav
//!   angry_hiss/   c.wav
//! ```
//!
//! Each subdirectory name is a template id (its label); the text before the
//! first `_` is its category. Files are visited in name order so template
//! insertion order, and therefore matcher tie-breaks, are reproducible.
//!
//! An extracted library can be saved as JSON and reopened without the WAVs.
//! The file records the rate and coefficient count its features were
//! computed with, plus per-label statistics:
//!
//! ```json
//! { "version": 1, "sampleRate": 44100, "coefficientCount": 13,
//!   "templates": [ ... ], "statistics": [ ... ] }
//! ```

use std::fs::File;
use std::io::{BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::audio::{is_wav_path, read_wav_mono};
use crate::error::{MeowError, Result};
use crate::features::{FeatureExtractor, FeatureVector};

/// Current on-disk library format.
pub const LIBRARY_FORMAT_VERSION: u32 = 1;

/// One labeled reference vector.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Template {
    /// Label, taken from the corpus subdirectory.
    pub id: String,
    pub category: String,
    /// Source file stem (or caller-chosen name).
    pub name: String,
    pub features: FeatureVector,
}

impl Template {
    pub fn new(id: impl Into<String>, name: impl Into<String>, features: FeatureVector) -> Self {
        let id = id.into();
        Self {
            category: category_of(&id),
            id,
            name: name.into(),
            features,
        }
    }
}

/// `"happy_purr"` → `"happy"`.
pub fn category_of(label: &str) -> String {
    label.split('_').next().unwrap_or(label).to_string()
}

/// Mean and spread of one label's templates.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LabelStatistics {
    pub label: String,
    pub count: usize,
    pub mean_cepstral: Vec<f32>,
    /// Population standard deviation per coefficient.
    pub std_dev_cepstral: Vec<f32>,
    pub mean_pitch_hz: f32,
    pub std_dev_pitch_hz: f32,
    pub mean_duration_secs: f32,
}

impl LabelStatistics {
    fn from_templates(label: &str, templates: &[&Template]) -> Self {
        let n = templates.len().max(1) as f64;
        let dims = templates.first().map_or(0, |t| t.features.cepstral.len());

        let mut mean = vec![0f64; dims];
        let (mut pitch, mut duration) = (0f64, 0f64);
        for t in templates {
            for (m, &c) in mean.iter_mut().zip(&t.features.cepstral) {
                *m += c as f64;
            }
            pitch += t.features.pitch_hz as f64;
            duration += t.features.descriptors.duration_secs as f64;
        }
        mean.iter_mut().for_each(|m| *m /= n);
        let mean_pitch = pitch / n;

        let mut var = vec![0f64; dims];
        let mut pitch_var = 0f64;
        for t in templates {
            for ((v, m), &c) in var.iter_mut().zip(&mean).zip(&t.features.cepstral) {
                *v += (c as f64 - m).powi(2);
            }
            pitch_var += (t.features.pitch_hz as f64 - mean_pitch).powi(2);
        }

        Self {
            label: label.to_string(),
            count: templates.len(),
            mean_cepstral: mean.iter().map(|&m| m as f32).collect(),
            std_dev_cepstral: var.iter().map(|&v| (v / n).sqrt() as f32).collect(),
            mean_pitch_hz: mean_pitch as f32,
            std_dev_pitch_hz: (pitch_var / n).sqrt() as f32,
            mean_duration_secs: (duration / n) as f32,
        }
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct LibraryFileOut<'a> {
    version: u32,
    sample_rate: u32,
    coefficient_count: usize,
    templates: &'a [Template],
    statistics: Vec<LabelStatistics>,
}

/// Statistics are derived data; they are recomputed rather than trusted.
#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct LibraryFileIn {
    version: u32,
    sample_rate: u32,
    coefficient_count: usize,
    templates: Vec<Template>,
}

/// A corpus entry that did not become a template.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SkippedEntry {
    pub path: PathBuf,
    pub reason: String,
}

/// Summary of one corpus load.
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LoadReport {
    pub loaded: usize,
    pub skipped: Vec<SkippedEntry>,
}

impl LoadReport {
    fn skip(&mut self, path: &Path, reason: impl Into<String>) {
        let reason = reason.into();
        warn!(path = %path.display(), reason = %reason, "corpus entry skipped");
        self.skipped.push(SkippedEntry {
            path: path.to_path_buf(),
            reason,
        });
    }
}

/// Immutable template set. Share it as `Arc<TemplateLibrary>`.
#[derive(Debug)]
pub struct TemplateLibrary {
    templates: Vec<Template>,
    sample_rate: u32,
    coefficient_count: usize,
    report: LoadReport,
}

impl TemplateLibrary {
    /// Load every WAV under `dir/<label>/` through `extractor`.
    ///
    /// Files at another sample rate are resampled to the extractor's rate.
    /// Fails with `LibraryLoad` when the directory is missing or unreadable,
    /// or when nothing usable is found.
    pub fn load(dir: &Path, extractor: &FeatureExtractor) -> Result<Self> {
        let label_dirs = sorted_entries(dir)
            .map_err(|e| MeowError::LibraryLoad(format!("{}: {e}", dir.display())))?;

        let mut report = LoadReport::default();
        let mut templates = Vec::new();

        for label_dir in label_dirs {
            if !label_dir.is_dir() {
                report.skip(&label_dir, "not inside a label directory");
                continue;
            }
            let Some(label) = label_dir.file_name().and_then(|n| n.to_str()) else {
                report.skip(&label_dir, "label is not valid UTF-8");
                continue;
            };
            let files = match sorted_entries(&label_dir) {
                Ok(files) => files,
                Err(e) => {
                    report.skip(&label_dir, format!("unreadable: {e}"));
                    continue;
                }
            };
            for file in files {
                match load_template(&file, label, extractor) {
                    Ok(template) => templates.push(template),
                    Err(reason) => report.skip(&file, reason),
                }
            }
        }

        if templates.is_empty() {
            return Err(MeowError::LibraryLoad(format!(
                "no usable templates in {} ({} entries skipped)",
                dir.display(),
                report.skipped.len()
            )));
        }
        report.loaded = templates.len();
        info!(
            dir = %dir.display(),
            loaded = report.loaded,
            skipped = report.skipped.len(),
            "template library loaded"
        );

        Ok(Self {
            templates,
            sample_rate: extractor.sample_rate(),
            coefficient_count: extractor.coefficient_count(),
            report,
        })
    }

    /// Open a saved JSON library (a file) or a corpus (a directory).
    ///
    /// A saved library must match the extractor's sample rate and
    /// coefficient count, otherwise this fails with `InvalidConfig`.
    pub fn open(path: &Path, extractor: &FeatureExtractor) -> Result<Self> {
        if !path.is_file() {
            return Self::load(path, extractor);
        }
        let library = Self::load_json(path)?;
        if library.sample_rate != extractor.sample_rate() {
            return Err(MeowError::InvalidConfig(format!(
                "{} was saved at {} Hz, extractor runs at {} Hz",
                path.display(),
                library.sample_rate,
                extractor.sample_rate()
            )));
        }
        if library.coefficient_count != extractor.coefficient_count() {
            return Err(MeowError::InvalidConfig(format!(
                "{} carries {} coefficients, extractor produces {}",
                path.display(),
                library.coefficient_count,
                extractor.coefficient_count()
            )));
        }
        Ok(library)
    }

    /// Write templates and per-label statistics as pretty JSON.
    pub fn save_json(&self, path: &Path) -> Result<()> {
        let file = LibraryFileOut {
            version: LIBRARY_FORMAT_VERSION,
            sample_rate: self.sample_rate,
            coefficient_count: self.coefficient_count,
            templates: &self.templates,
            statistics: self.statistics(),
        };
        let mut out = BufWriter::new(File::create(path)?);
        serde_json::to_writer_pretty(&mut out, &file)
            .map_err(|e| MeowError::Other(e.into()))?;
        out.flush()?;
        info!(path = %path.display(), templates = self.len(), "template library saved");
        Ok(())
    }

    /// Read a library written by [`save_json`](Self::save_json).
    ///
    /// Fails with `LibraryLoad` on unreadable or malformed files, an unknown
    /// version, or templates whose length disagrees with the header.
    pub fn load_json(path: &Path) -> Result<Self> {
        let reader = File::open(path)
            .map(BufReader::new)
            .map_err(|e| MeowError::LibraryLoad(format!("{}: {e}", path.display())))?;
        let file: LibraryFileIn = serde_json::from_reader(reader)
            .map_err(|e| MeowError::LibraryLoad(format!("{}: {e}", path.display())))?;
        if file.version != LIBRARY_FORMAT_VERSION {
            return Err(MeowError::LibraryLoad(format!(
                "{}: unsupported library version {}",
                path.display(),
                file.version
            )));
        }
        if file.sample_rate == 0 {
            return Err(MeowError::LibraryLoad(format!(
                "{}: sample rate is zero",
                path.display()
            )));
        }
        let library = Self::from_templates(file.templates, file.sample_rate)?;
        if library.coefficient_count != file.coefficient_count {
            return Err(MeowError::LibraryLoad(format!(
                "{}: header says {} coefficients, templates carry {}",
                path.display(),
                file.coefficient_count,
                library.coefficient_count
            )));
        }
        info!(path = %path.display(), loaded = library.len(), "template library loaded");
        Ok(library)
    }

    /// Build a library from already-extracted templates.
    pub fn from_templates(templates: Vec<Template>, sample_rate: u32) -> Result<Self> {
        let Some(first) = templates.first() else {
            return Err(MeowError::LibraryLoad("template list is empty".into()));
        };
        let coefficient_count = first.features.cepstral.len();
        if let Some(bad) = templates
            .iter()
            .find(|t| t.features.cepstral.len() != coefficient_count)
        {
            return Err(MeowError::LibraryLoad(format!(
                "template {}/{} has {} coefficients, expected {coefficient_count}",
                bad.id,
                bad.name,
                bad.features.cepstral.len()
            )));
        }
        Ok(Self {
            report: LoadReport {
                loaded: templates.len(),
                skipped: Vec::new(),
            },
            templates,
            sample_rate,
            coefficient_count,
        })
    }

    pub fn templates(&self) -> &[Template] {
        &self.templates
    }

    pub fn len(&self) -> usize {
        self.templates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.templates.is_empty()
    }

    /// Rate the template features were computed at.
    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    pub fn coefficient_count(&self) -> usize {
        self.coefficient_count
    }

    pub fn report(&self) -> &LoadReport {
        &self.report
    }

    /// Per-label statistics, labels in insertion order.
    pub fn statistics(&self) -> Vec<LabelStatistics> {
        self.labels()
            .into_iter()
            .map(|label| {
                let members: Vec<&Template> =
                    self.templates.iter().filter(|t| t.id == label).collect();
                LabelStatistics::from_templates(label, &members)
            })
            .collect()
    }

    /// Distinct labels in insertion order.
    pub fn labels(&self) -> Vec<&str> {
        let mut out: Vec<&str> = Vec::new();
        for t in &self.templates {
            if !out.contains(&t.id.as_str()) {
                out.push(&t.id);
            }
        }
        out
    }
}

fn sorted_entries(dir: &Path) -> std::io::Result<Vec<PathBuf>> {
    let mut entries = std::fs::read_dir(dir)?
        .map(|entry| entry.map(|e| e.path()))
        .collect::<std::io::Result<Vec<_>>>()?;
    entries.sort();
    Ok(entries)
}

fn load_template(
    path: &Path,
    label: &str,
    extractor: &FeatureExtractor,
) -> std::result::Result<Template, String> {
    if path.is_dir() {
        return Err("nested directory".into());
    }
    if !is_wav_path(path) {
        return Err("unsupported file type".into());
    }
    let clip = read_wav_mono(path)
        .and_then(|clip| clip.into_rate(extractor.sample_rate()))
        .map_err(|e| e.to_string())?;
    let features = extractor.extract(&clip.samples).map_err(|e| e.to_string())?;
    let name = path
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or_default()
        .to_string();
    Ok(Template::new(label, name, features))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::write_wav_mono;
    use crate::features::FeatureConfig;
    use approx::assert_abs_diff_eq;

    const SR: u32 = 8_000;

    fn extractor() -> FeatureExtractor {
        FeatureExtractor::new(FeatureConfig::for_sample_rate(SR, 0.025)).unwrap()
    }

    fn tone(freq: f32, secs: f32, sr: u32) -> Vec<f32> {
        (0..(secs * sr as f32) as usize)
            .map(|i| 0.5 * (2.0 * std::f32::consts::PI * freq * i as f32 / sr as f32).sin())
            .collect()
    }

    #[test]
    fn category_is_prefix_before_underscore() {
        assert_eq!(category_of("happy_purr"), "happy");
        assert_eq!(category_of("angry"), "angry");
        assert_eq!(category_of(""), "");
    }

    #[test]
    fn loads_labels_in_name_order_and_skips_strays() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        std::fs::create_dir(root.join("hungry_chirp")).unwrap();
        std::fs::create_dir(root.join("angry_hiss")).unwrap();
        write_wav_mono(&root.join("hungry_chirp/b.wav"), &tone(900.0, 0.3, SR), SR).unwrap();
        write_wav_mono(&root.join("hungry_chirp/a.wav"), &tone(800.0, 0.3, SR), SR).unwrap();
        // Different rate: resampled on load.
        write_wav_mono(&root.join("angry_hiss/x.wav"), &tone(300.0, 0.3, 16_000), 16_000)
            .unwrap();
        std::fs::write(root.join("hungry_chirp/notes.txt"), "stray").unwrap();
        std::fs::write(root.join("README.md"), "stray").unwrap();
        write_wav_mono(&root.join("angry_hiss/silent.wav"), &[0.0; 800], SR).unwrap();

        let lib = TemplateLibrary::load(root, &extractor()).unwrap();
        let ids: Vec<(&str, &str)> = lib
            .templates()
            .iter()
            .map(|t| (t.id.as_str(), t.name.as_str()))
            .collect();
        assert_eq!(
            ids,
            vec![("angry_hiss", "x"), ("hungry_chirp", "a"), ("hungry_chirp", "b")]
        );
        assert_eq!(lib.templates()[0].category, "angry");
        assert_eq!(lib.labels(), vec!["angry_hiss", "hungry_chirp"]);
        assert_eq!(lib.coefficient_count(), 13);
        assert_eq!(lib.sample_rate(), SR);
        assert_eq!(lib.report().loaded, 3);
        // README.md, notes.txt and the all-zero WAV.
        assert_eq!(lib.report().skipped.len(), 3);
    }

    #[test]
    fn missing_directory_fails_fast() {
        let err = TemplateLibrary::load(Path::new("/definitely/not/here"), &extractor()).unwrap_err();
        assert!(matches!(err, MeowError::LibraryLoad(_)));
    }

    #[test]
    fn empty_directory_fails_fast() {
        let dir = tempfile::tempdir().unwrap();
        let err = TemplateLibrary::load(dir.path(), &extractor()).unwrap_err();
        assert!(matches!(err, MeowError::LibraryLoad(_)));
    }

    #[test]
    fn only_unsupported_files_fails_fast() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir(dir.path().join("happy")).unwrap();
        std::fs::write(dir.path().join("happy/readme.txt"), "x").unwrap();
        std::fs::write(dir.path().join("happy/broken.wav"), "not a wav").unwrap();
        let err = TemplateLibrary::load(dir.path(), &extractor()).unwrap_err();
        assert!(matches!(err, MeowError::LibraryLoad(_)));
    }

    fn corpus_library() -> TemplateLibrary {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir(dir.path().join("happy_trill")).unwrap();
        std::fs::create_dir(dir.path().join("angry_hiss")).unwrap();
        for (name, freq) in [("a", 600.0), ("b", 700.0)] {
            let path = dir.path().join("happy_trill").join(format!("{name}.wav"));
            write_wav_mono(&path, &tone(freq, 0.4, SR), SR).unwrap();
        }
        write_wav_mono(&dir.path().join("angry_hiss/c.wav"), &tone(250.0, 0.3, SR), SR).unwrap();
        TemplateLibrary::load(dir.path(), &extractor()).unwrap()
    }

    #[test]
    fn saved_library_reopens_identically() {
        let lib = corpus_library();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("library.json");
        lib.save_json(&path).unwrap();

        let reopened = TemplateLibrary::open(&path, &extractor()).unwrap();
        assert_eq!(reopened.templates(), lib.templates());
        assert_eq!(reopened.sample_rate(), SR);
        assert_eq!(reopened.coefficient_count(), 13);
        assert_eq!(reopened.report().loaded, 3);
        assert_eq!(reopened.statistics(), lib.statistics());

        let json: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(json["version"], LIBRARY_FORMAT_VERSION);
        assert_eq!(json["sampleRate"], SR);
        assert_eq!(json["statistics"].as_array().unwrap().len(), 2);
    }

    #[test]
    fn statistics_summarize_each_label() {
        let lib = corpus_library();
        let stats = lib.statistics();
        let labels: Vec<&str> = stats.iter().map(|s| s.label.as_str()).collect();
        assert_eq!(labels, vec!["angry_hiss", "happy_trill"]);

        let single = &stats[0];
        assert_eq!(single.count, 1);
        assert_eq!(single.mean_cepstral, lib.templates()[0].features.cepstral);
        assert!(single.std_dev_cepstral.iter().all(|&s| s.abs() < 1e-6));
        assert_abs_diff_eq!(single.std_dev_pitch_hz, 0.0, epsilon = 1e-3);

        let pair = &stats[1];
        assert_eq!(pair.count, 2);
        assert_eq!(pair.mean_cepstral.len(), 13);
        let (a, b) = (&lib.templates()[1].features, &lib.templates()[2].features);
        assert_abs_diff_eq!(
            pair.mean_pitch_hz,
            (a.pitch_hz + b.pitch_hz) / 2.0,
            epsilon = 1e-2
        );
        assert_abs_diff_eq!(
            pair.std_dev_pitch_hz,
            (a.pitch_hz - b.pitch_hz).abs() / 2.0,
            epsilon = 1e-2
        );
        assert_abs_diff_eq!(pair.mean_duration_secs, 0.4, epsilon = 1e-3);
    }

    #[test]
    fn saved_library_at_another_rate_is_rejected() {
        let lib = corpus_library();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("library.json");
        lib.save_json(&path).unwrap();

        let other = FeatureExtractor::new(FeatureConfig::for_sample_rate(16_000, 0.025)).unwrap();
        let err = TemplateLibrary::open(&path, &other).unwrap_err();
        assert!(matches!(err, MeowError::InvalidConfig(_)), "{err:?}");
    }

    #[test]
    fn malformed_library_files_fail_to_load() {
        let dir = tempfile::tempdir().unwrap();
        let garbage = dir.path().join("garbage.json");
        std::fs::write(&garbage, "{ not json").unwrap();
        assert!(matches!(
            TemplateLibrary::load_json(&garbage),
            Err(MeowError::LibraryLoad(_))
        ));

        let lib = corpus_library();
        let saved = dir.path().join("saved.json");
        lib.save_json(&saved).unwrap();
        let mut json: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(&saved).unwrap()).unwrap();

        json["coefficientCount"] = 12.into();
        let lying = dir.path().join("lying.json");
        std::fs::write(&lying, json.to_string()).unwrap();
        assert!(matches!(
            TemplateLibrary::load_json(&lying),
            Err(MeowError::LibraryLoad(_))
        ));

        json["coefficientCount"] = 13.into();
        json["version"] = 99.into();
        let future = dir.path().join("future.json");
        std::fs::write(&future, json.to_string()).unwrap();
        assert!(matches!(
            TemplateLibrary::load_json(&future),
            Err(MeowError::LibraryLoad(_))
        ));

        json["version"] = LIBRARY_FORMAT_VERSION.into();
        json["templates"] = serde_json::json!([]);
        let empty = dir.path().join("empty.json");
        std::fs::write(&empty, json.to_string()).unwrap();
        assert!(matches!(
            TemplateLibrary::load_json(&empty),
            Err(MeowError::LibraryLoad(_))
        ));
    }

    #[test]
    fn from_templates_rejects_mixed_lengths() {
        let fv = |n: usize| FeatureVector {
            cepstral: vec![1.0; n],
            spectrum: vec![],
            pitch_hz: 0.0,
            descriptors: Default::default(),
        };
        assert!(TemplateLibrary::from_templates(vec![], SR).is_err());
        let err = TemplateLibrary::from_templates(
            vec![Template::new("a", "1", fv(13)), Template::new("b", "2", fv(12))],
            SR,
        )
        .unwrap_err();
        assert!(matches!(err, MeowError::LibraryLoad(_)));
        let lib = TemplateLibrary::from_templates(vec![Template::new("a", "1", fv(13))], SR)
            .unwrap();
        assert_eq!(lib.len(), 1);
    }
}
