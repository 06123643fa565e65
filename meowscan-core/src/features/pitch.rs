//! Autocorrelation pitch estimation.
//!
//! Normalized cross-correlation between the excerpt and its lagged copy,
//! evaluated over the lag range implied by `[min_hz, max_hz]`. The smallest
//! lag whose peak reaches 90% of the strongest peak is taken (suppresses
//! octave-down errors), refined by parabolic interpolation. A strongest peak
//! below `voicing_threshold` means unvoiced and yields 0.

/// Pitch search parameters.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PitchParams {
    pub min_hz: f32,
    pub max_hz: f32,
    pub voicing_threshold: f32,
}

/// Estimate the fundamental frequency of `samples` in Hz (0 when unvoiced).
pub fn estimate_pitch(samples: &[f32], sample_rate: u32, params: &PitchParams) -> f32 {
    let sr = sample_rate as f32;
    if samples.len() < 4 || params.max_hz <= 0.0 || params.min_hz <= 0.0 {
        return 0.0;
    }
    let min_lag = ((sr / params.max_hz).floor() as usize).max(2);
    let max_lag = ((sr / params.min_hz).ceil() as usize).min(samples.len() / 2);
    if max_lag <= min_lag + 1 {
        return 0.0;
    }

    // nccf[i] is the correlation at lag (min_lag - 1 + i)
    let lo = min_lag - 1;
    let hi = max_lag + 1;
    let nccf: Vec<f32> = (lo..=hi).map(|lag| normalized_correlation(samples, lag)).collect();
    let at = |lag: usize| nccf[lag - lo];

    let peaks: Vec<(usize, f32)> = (min_lag..=max_lag)
        .filter(|&lag| at(lag) > at(lag - 1) && at(lag) >= at(lag + 1))
        .map(|lag| (lag, at(lag)))
        .collect();

    let Some(strongest) = peaks.iter().map(|&(_, v)| v).reduce(f32::max) else {
        return 0.0;
    };
    if strongest < params.voicing_threshold {
        return 0.0;
    }

    let Some(&(lag, _)) = peaks.iter().find(|&&(_, v)| v >= 0.9 * strongest) else {
        return 0.0;
    };

    let (a, b, c) = (at(lag - 1), at(lag), at(lag + 1));
    let denom = a - 2.0 * b + c;
    let delta = if denom.abs() > 1e-12 {
        (0.5 * (a - c) / denom).clamp(-0.5, 0.5)
    } else {
        0.0
    };
    sr / (lag as f32 + delta)
}

fn normalized_correlation(samples: &[f32], lag: usize) -> f32 {
    if lag >= samples.len() {
        return 0.0;
    }
    let n = samples.len() - lag;
    let mut cross = 0.0f64;
    let mut e0 = 0.0f64;
    let mut e1 = 0.0f64;
    for i in 0..n {
        let x = samples[i] as f64;
        let y = samples[i + lag] as f64;
        cross += x * y;
        e0 += x * x;
        e1 += y * y;
    }
    let denom = (e0 * e1).sqrt();
    if denom <= 1e-12 {
        0.0
    } else {
        (cross / denom) as f32
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const PARAMS: PitchParams = PitchParams {
        min_hz: 70.0,
        max_hz: 2_000.0,
        voicing_threshold: 0.3,
    };

    fn sine(freq: f32, sr: u32, n: usize) -> Vec<f32> {
        (0..n)
            .map(|i| (2.0 * std::f32::consts::PI * freq * i as f32 / sr as f32).sin())
            .collect()
    }

    /// xorshift32 broadband noise, deterministic.
    fn noise(n: usize) -> Vec<f32> {
        let mut state = 0x9E37_79B9u32;
        (0..n)
            .map(|_| {
                state ^= state << 13;
                state ^= state >> 17;
                state ^= state << 5;
                (state as f32 / u32::MAX as f32) * 2.0 - 1.0
            })
            .collect()
    }

    #[test]
    fn sine_at_440_hz() {
        let pitch = estimate_pitch(&sine(440.0, 44_100, 2_048), 44_100, &PARAMS);
        assert!((pitch - 440.0).abs() < 4.0, "pitch={pitch}");
    }

    #[test]
    fn low_rate_stream_pitch() {
        let pitch = estimate_pitch(&sine(300.0, 4_410, 441), 4_410, &PARAMS);
        assert!((pitch - 300.0).abs() < 15.0, "pitch={pitch}");
    }

    #[test]
    fn harmonic_tone_reports_fundamental() {
        let a = sine(500.0, 44_100, 2_048);
        let b = sine(1_000.0, 44_100, 2_048);
        let mix: Vec<f32> = a.iter().zip(&b).map(|(x, y)| 0.6 * x + 0.4 * y).collect();
        let pitch = estimate_pitch(&mix, 44_100, &PARAMS);
        assert!((pitch - 500.0).abs() < 6.0, "pitch={pitch}");
    }

    #[test]
    fn noise_is_unvoiced() {
        assert_eq!(estimate_pitch(&noise(2_048), 44_100, &PARAMS), 0.0);
    }

    #[test]
    fn silence_and_tiny_inputs_are_unvoiced() {
        assert_eq!(estimate_pitch(&[0.0; 2_048], 44_100, &PARAMS), 0.0);
        assert_eq!(estimate_pitch(&[0.3, -0.3], 44_100, &PARAMS), 0.0);
    }
}
