//! WAV decoding/encoding via `hound`.
//!
//! Template corpora and evaluation recordings are plain WAV files. Any PCM
//! integer depth (8–32 bit) or 32-bit float is accepted; multi-channel files
//! are down-mixed to mono by averaging each frame.

use std::path::Path;

use crate::buffering::chunk::AudioChunk;
use crate::error::{MeowError, Result};

/// Returns `true` for paths with a `.wav` extension (case-insensitive).
pub fn is_wav_path(path: &Path) -> bool {
    path.extension()
        .and_then(|s| s.to_str())
        .map(|s| s.eq_ignore_ascii_case("wav"))
        .unwrap_or(false)
}

/// Decode a WAV file into a mono chunk at the file's own sample rate.
pub fn read_wav_mono(path: &Path) -> Result<AudioChunk> {
    let mut reader = hound::WavReader::open(path)?;
    let spec = reader.spec();
    let channels = usize::from(spec.channels.max(1));

    let interleaved: Vec<f32> = match spec.sample_format {
        hound::SampleFormat::Float => reader
            .samples::<f32>()
            .collect::<std::result::Result<Vec<_>, _>>()?,
        hound::SampleFormat::Int => {
            if spec.bits_per_sample == 0 || spec.bits_per_sample > 32 {
                return Err(MeowError::Wav(hound::Error::Unsupported));
            }
            let max = ((1_i64 << (spec.bits_per_sample - 1)) - 1).max(1) as f32;
            reader
                .samples::<i32>()
                .map(|s| s.map(|v| v as f32 / max))
                .collect::<std::result::Result<Vec<_>, _>>()?
        }
    };

    if channels == 1 {
        return Ok(AudioChunk::new(interleaved, spec.sample_rate));
    }

    let mut mono = Vec::with_capacity(interleaved.len() / channels);
    for frame in interleaved.chunks(channels) {
        let sum = frame.iter().copied().sum::<f32>();
        mono.push(sum / channels as f32);
    }
    Ok(AudioChunk::new(mono, spec.sample_rate))
}

/// Write mono f32 samples as a 32-bit float WAV file.
pub fn write_wav_mono(path: &Path, samples: &[f32], sample_rate: u32) -> Result<()> {
    let spec = hound::WavSpec {
        channels: 1,
        sample_rate,
        bits_per_sample: 32,
        sample_format: hound::SampleFormat::Float,
    };
    let mut writer = hound::WavWriter::create(path, spec)?;
    for &sample in samples {
        writer.write_sample(sample)?;
    }
    writer.finalize()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn float_round_trip_preserves_samples() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("clip.wav");
        let samples = vec![0.0, 0.25, -0.5, 1.0];
        write_wav_mono(&path, &samples, 8_000).unwrap();

        let chunk = read_wav_mono(&path).unwrap();
        assert_eq!(chunk.sample_rate, 8_000);
        assert_eq!(chunk.samples, samples);
    }

    #[test]
    fn stereo_int16_is_downmixed() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("stereo.wav");
        let spec = hound::WavSpec {
            channels: 2,
            sample_rate: 44_100,
            bits_per_sample: 16,
            sample_format: hound::SampleFormat::Int,
        };
        let mut writer = hound::WavWriter::create(&path, spec).unwrap();
        for _ in 0..4 {
            writer.write_sample(i16::MAX).unwrap();
            writer.write_sample(0i16).unwrap();
        }
        writer.finalize().unwrap();

        let chunk = read_wav_mono(&path).unwrap();
        assert_eq!(chunk.samples.len(), 4);
        for s in chunk.samples {
            assert!((s - 0.5).abs() < 1e-4, "sample={s}");
        }
    }

    #[test]
    fn non_wav_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("notes.wav");
        std::fs::write(&path, b"definitely not riff data").unwrap();
        assert!(matches!(read_wav_mono(&path), Err(MeowError::Wav(_))));
    }

    #[test]
    fn extension_check_is_case_insensitive() {
        assert!(is_wav_path(Path::new("a/b/Meow.WAV")));
        assert!(!is_wav_path(Path::new("a/b/meow.mp3")));
        assert!(!is_wav_path(Path::new("a/b/meow")));
    }
}
