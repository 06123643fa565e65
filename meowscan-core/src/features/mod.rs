//! Segment → `FeatureVector`.
//!
//! ## Pipeline
//!
//! ```text
//! samples ─► remove DC, scale to unit peak
//!         ─► Hann frames (frame, hop) ─► FFT ─► |X|  ──► mean spectrum
//!                                          └─► |X|² ─► mel bands ─► log10
//!         ─► clamp to (max − 8) ─► mean over frames ─► DCT-II [1..=n]
//!         ─► autocorrelation pitch around the loudest frame
//! ```
//!
//! Averaging the log-mel bands before the DCT is equivalent to averaging the
//! per-frame cepstra, since the transform is linear. c0 (overall level) is
//! dropped so matching reflects spectral shape only.
//!
//! Every reduction runs sequentially in a fixed order, so identical input and
//! configuration produce bit-identical vectors.

pub mod mel;
pub mod pitch;

use std::sync::Arc;

use rustfft::{num_complex::Complex, Fft, FftPlanner};
use serde::{Deserialize, Serialize};

use crate::error::{MeowError, Result};
use mel::{build_hann_window, build_mel_filters, dct_ii};
use pitch::{estimate_pitch, PitchParams};

/// Feature extraction parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FeatureConfig {
    pub sample_rate: u32,
    /// Analysis frame length in samples.
    pub frame_size: usize,
    pub hop_size: usize,
    pub n_mels: usize,
    /// Cepstral coefficients kept (c1..=cN).
    pub n_coefficients: usize,
    pub mel_fmin_hz: f32,
    pub mel_fmax_hz: f32,
    pub min_pitch_hz: f32,
    pub max_pitch_hz: f32,
    /// Minimum normalized autocorrelation peak to call a segment voiced.
    pub voicing_threshold: f32,
}

impl FeatureConfig {
    /// Defaults for `sample_rate`, with frames matching the segmenter's
    /// analysis window.
    pub fn for_sample_rate(sample_rate: u32, window_secs: f32) -> Self {
        let nyquist = sample_rate as f32 / 2.0;
        let frame_size = ((sample_rate as f64 * window_secs as f64).round() as usize).max(16);
        Self {
            sample_rate,
            frame_size,
            hop_size: (frame_size / 2).max(1),
            n_mels: 26,
            n_coefficients: 13,
            mel_fmin_hz: 50.0,
            mel_fmax_hz: nyquist.min(8_000.0),
            min_pitch_hz: 70.0,
            max_pitch_hz: nyquist.min(2_000.0),
            voicing_threshold: 0.3,
        }
    }

    pub fn fft_size(&self) -> usize {
        self.frame_size.next_power_of_two()
    }

    /// Number of bins in the spectral profile.
    pub fn spectrum_bins(&self) -> usize {
        self.fft_size() / 2 + 1
    }

    pub fn validate(&self) -> Result<()> {
        if self.sample_rate == 0 {
            return Err(MeowError::InvalidConfig("sample rate must be positive".into()));
        }
        if self.frame_size < 2 || self.hop_size == 0 {
            return Err(MeowError::InvalidConfig(format!(
                "frame/hop too small: frame={}, hop={}",
                self.frame_size, self.hop_size
            )));
        }
        if self.n_coefficients == 0 || self.n_coefficients >= self.n_mels {
            return Err(MeowError::InvalidConfig(format!(
                "need 0 < coefficients < mel bands (got {} / {})",
                self.n_coefficients, self.n_mels
            )));
        }
        let nyquist = self.sample_rate as f32 / 2.0;
        if !(0.0..nyquist).contains(&self.mel_fmin_hz)
            || self.mel_fmax_hz <= self.mel_fmin_hz
            || self.mel_fmax_hz > nyquist
        {
            return Err(MeowError::InvalidConfig(format!(
                "mel range {}..{} Hz invalid for {} Hz",
                self.mel_fmin_hz, self.mel_fmax_hz, self.sample_rate
            )));
        }
        if self.min_pitch_hz <= 0.0 || self.max_pitch_hz <= self.min_pitch_hz {
            return Err(MeowError::InvalidConfig(format!(
                "pitch range {}..{} Hz invalid",
                self.min_pitch_hz, self.max_pitch_hz
            )));
        }
        Ok(())
    }
}

/// Scalar descriptors of a segment. Informational; not used for matching.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SpectralDescriptors {
    pub duration_secs: f32,
    pub rms: f32,
    pub zero_crossing_rate: f32,
    pub spectral_centroid_hz: f32,
    /// Frequency below which 85% of the spectral magnitude lies.
    pub spectral_rolloff_hz: f32,
    pub peak_frequency_hz: f32,
}

/// Acoustic fingerprint of one segment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FeatureVector {
    /// Mel-cepstral coefficients; length fixed by the extractor config.
    pub cepstral: Vec<f32>,
    /// Mean magnitude spectrum, `fft_size / 2 + 1` bins.
    pub spectrum: Vec<f32>,
    /// Fundamental frequency in Hz, 0 when unvoiced.
    pub pitch_hz: f32,
    pub descriptors: SpectralDescriptors,
}

/// Reusable extractor: FFT plan, window and filterbank are built once.
///
/// `extract` takes `&self`, so one extractor can be shared across threads.
pub struct FeatureExtractor {
    config: FeatureConfig,
    fft: Arc<dyn Fft<f32>>,
    fft_size: usize,
    hann_window: Vec<f32>,
    mel_filters: Vec<Vec<f32>>,
}

impl std::fmt::Debug for FeatureExtractor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FeatureExtractor")
            .field("config", &self.config)
            .field("fft_size", &self.fft_size)
            .finish()
    }
}

impl FeatureExtractor {
    pub fn new(config: FeatureConfig) -> Result<Self> {
        config.validate()?;
        let fft_size = config.fft_size();
        let mut planner = FftPlanner::<f32>::new();
        let fft = planner.plan_fft_forward(fft_size);
        let hann_window = build_hann_window(config.frame_size);
        let mel_filters = build_mel_filters(
            fft_size,
            config.sample_rate,
            config.n_mels,
            config.mel_fmin_hz,
            config.mel_fmax_hz,
        );
        Ok(Self {
            config,
            fft,
            fft_size,
            hann_window,
            mel_filters,
        })
    }

    pub fn config(&self) -> &FeatureConfig {
        &self.config
    }

    pub fn sample_rate(&self) -> u32 {
        self.config.sample_rate
    }

    pub fn coefficient_count(&self) -> usize {
        self.config.n_coefficients
    }

    /// Extract features from one segment's samples at the configured rate.
    pub fn extract(&self, samples: &[f32]) -> Result<FeatureVector> {
        let normalized = normalize(samples)?;
        let cfg = &self.config;
        let sr = cfg.sample_rate as f32;
        let n_bins = self.fft_size / 2 + 1;

        let n_frames = if normalized.len() < cfg.frame_size {
            1
        } else {
            1 + (normalized.len() - cfg.frame_size) / cfg.hop_size
        };

        let mut spectrum = vec![0f32; n_bins];
        let mut log_mel = vec![vec![0f32; cfg.n_mels]; n_frames];
        let mut loudest = (0usize, f32::NEG_INFINITY);
        let mut fft_buf = vec![Complex::new(0.0f32, 0.0); self.fft_size];

        for (frame, bands) in log_mel.iter_mut().enumerate() {
            let start = frame * cfg.hop_size;
            let end = (start + cfg.frame_size).min(normalized.len());

            for v in fft_buf.iter_mut() {
                *v = Complex::new(0.0, 0.0);
            }
            let mut energy = 0.0f32;
            for (i, &s) in normalized[start..end].iter().enumerate() {
                energy += s * s;
                fft_buf[i] = Complex::new(s * self.hann_window[i], 0.0);
            }
            if energy > loudest.1 {
                loudest = (start, energy);
            }
            self.fft.process(&mut fft_buf);

            for (k, bin) in spectrum.iter_mut().enumerate() {
                *bin += fft_buf[k].norm();
            }
            for (m, band) in bands.iter_mut().enumerate() {
                let mut e = 0.0f32;
                for k in 0..n_bins {
                    e += self.mel_filters[m][k] * fft_buf[k].norm_sqr();
                }
                *band = e.max(1e-10).log10();
            }
        }

        let max_val = log_mel
            .iter()
            .flatten()
            .copied()
            .fold(f32::NEG_INFINITY, f32::max);
        let floor = max_val - 8.0;
        let mut mean_log_mel = vec![0f32; cfg.n_mels];
        for bands in &log_mel {
            for (acc, &v) in mean_log_mel.iter_mut().zip(bands) {
                *acc += v.max(floor);
            }
        }
        for v in mean_log_mel.iter_mut() {
            *v /= n_frames as f32;
        }
        let cepstral = dct_ii(&mean_log_mel, 1, cfg.n_coefficients);

        for bin in spectrum.iter_mut() {
            *bin /= n_frames as f32;
        }

        let descriptors = describe(&normalized, &spectrum, sr, self.fft_size);

        let params = PitchParams {
            min_hz: cfg.min_pitch_hz,
            max_hz: cfg.max_pitch_hz,
            voicing_threshold: cfg.voicing_threshold,
        };
        let excerpt = pitch_excerpt(&normalized, loudest.0 + cfg.frame_size / 2, sr, &params);
        let pitch_hz = estimate_pitch(excerpt, cfg.sample_rate, &params);

        Ok(FeatureVector {
            cepstral,
            spectrum,
            pitch_hz,
            descriptors,
        })
    }
}

/// Remove DC and scale to unit peak. Empty or all-zero input is unusable.
fn normalize(samples: &[f32]) -> Result<Vec<f32>> {
    if samples.is_empty() {
        return Err(MeowError::InvalidSegment("zero-length segment".into()));
    }
    if let Some(index) = samples.iter().position(|s| !s.is_finite()) {
        return Err(MeowError::InvalidSegment(format!(
            "non-finite sample at index {index}"
        )));
    }
    let mean = samples.iter().map(|&s| s as f64).sum::<f64>() / samples.len() as f64;
    let centered: Vec<f32> = samples.iter().map(|&s| (s as f64 - mean) as f32).collect();
    let peak = centered.iter().fold(0f32, |m, s| m.max(s.abs()));
    if peak <= 1e-9 {
        return Err(MeowError::InvalidSegment("segment carries no signal".into()));
    }
    Ok(centered.into_iter().map(|s| s / peak).collect())
}

/// Excerpt of about three periods of the lowest pitch, centred on `center`.
fn pitch_excerpt<'a>(samples: &'a [f32], center: usize, sr: f32, params: &PitchParams) -> &'a [f32] {
    let max_lag = (sr / params.min_hz).ceil() as usize;
    let len = (3 * max_lag).min(samples.len());
    let start = center
        .saturating_sub(len / 2)
        .min(samples.len() - len);
    &samples[start..start + len]
}

fn describe(samples: &[f32], spectrum: &[f32], sr: f32, fft_size: usize) -> SpectralDescriptors {
    let n = samples.len();
    let rms = (samples.iter().map(|&s| s as f64 * s as f64).sum::<f64>() / n as f64).sqrt() as f32;

    let crossings = samples
        .windows(2)
        .filter(|w| (w[0] >= 0.0) != (w[1] >= 0.0))
        .count();
    let zero_crossing_rate = if n > 1 {
        crossings as f32 / (n - 1) as f32
    } else {
        0.0
    };

    let bin_hz = sr / fft_size as f32;
    let total: f32 = spectrum.iter().sum();
    let (spectral_centroid_hz, spectral_rolloff_hz) = if total > 0.0 {
        let weighted: f32 = spectrum
            .iter()
            .enumerate()
            .map(|(k, &m)| k as f32 * bin_hz * m)
            .sum();
        let target = 0.85 * total;
        let mut acc = 0.0f32;
        let mut rolloff_bin = spectrum.len().saturating_sub(1);
        for (k, &m) in spectrum.iter().enumerate() {
            acc += m;
            if acc >= target {
                rolloff_bin = k;
                break;
            }
        }
        (weighted / total, rolloff_bin as f32 * bin_hz)
    } else {
        (0.0, 0.0)
    };

    // First maximum wins on ties.
    let peak_bin = spectrum
        .iter()
        .enumerate()
        .fold((0usize, f32::NEG_INFINITY), |best, (k, &m)| {
            if m > best.1 {
                (k, m)
            } else {
                best
            }
        })
        .0;

    SpectralDescriptors {
        duration_secs: n as f32 / sr,
        rms,
        zero_crossing_rate,
        spectral_centroid_hz,
        spectral_rolloff_hz,
        peak_frequency_hz: peak_bin as f32 * bin_hz,
    }
}
