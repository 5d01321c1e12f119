//! Audio file reading and preprocessing.
//!
//! Handles WAV file parsing and conversion to the PCM format a codec
//! encodes (its native rate and channel count).

use anyhow::{bail, Context, Result};
use hound::{SampleFormat, WavReader};
use media_common::{ChannelConverter, Format, Resampler};
use std::path::Path;
use tracing::info;

/// Interleaved PCM samples with their format.
#[derive(Debug, Clone)]
pub struct AudioData {
    // ---
    /// PCM samples as 16-bit signed integers
    pub samples: Vec<i16>,

    pub format: Format,
}

impl AudioData {
    // ---
    pub fn new(samples: Vec<i16>, format: Format) -> Self {
        // ---
        Self { samples, format }
    }

    /// Returns an iterator over frames of `frame_len` interleaved samples.
    ///
    /// The last frame may be shorter; callers pad it.
    pub fn frames(&self, frame_len: usize) -> impl Iterator<Item = &[i16]> {
        // ---
        self.samples.chunks(frame_len.max(1))
    }

    /// Returns the total duration in seconds.
    pub fn duration_secs(&self) -> f64 {
        // ---
        self.samples.len() as f64 / (self.format.rate as f64 * self.format.channels as f64)
    }

    /// Returns the number of frames, counting a trailing partial frame.
    pub fn frame_count(&self, frame_len: usize) -> usize {
        // ---
        self.samples.len().div_ceil(frame_len.max(1))
    }

    /// Converts to `target` rate and channel layout.
    ///
    /// Uses linear interpolation for resampling - sufficient for voice
    /// quality but not suitable for high-fidelity music.
    pub fn convert(&self, target: Format) -> AudioData {
        // ---
        if self.format == target {
            return self.clone();
        }

        let mut channels = Vec::with_capacity(self.samples.len());
        if self.format.channels > 2 {
            info!("Downmixing {} channels", self.format.channels);
            let mut mono = Vec::with_capacity(self.samples.len() / self.format.channels as usize);
            mono.extend(downmix(&self.samples, self.format.channels as usize));
            ChannelConverter::convert(&mono, 1, target.channels, &mut channels);
        } else {
            ChannelConverter::convert(&self.samples, self.format.channels, target.channels, &mut channels);
        }

        if self.format.rate == target.rate {
            return AudioData::new(channels, target);
        }

        info!("Resampling from {}Hz to {}Hz", self.format.rate, target.rate);
        let mut resampled = Vec::new();
        Resampler::new(self.format.rate, target.rate, target.channels)
            .resample(&channels, &mut resampled);

        AudioData::new(resampled, target)
    }
}

/// Averages each frame of `channels` samples into one.
fn downmix(samples: &[i16], channels: usize) -> impl Iterator<Item = i16> + '_ {
    // ---
    samples.chunks_exact(channels).map(move |frame| {
        let sum: i32 = frame.iter().map(|&s| s as i32).sum();
        (sum / channels as i32) as i16
    })
}

/// Reads a WAV file.
///
/// Supports 16-bit integer and 32-bit float files at any rate and
/// channel count; samples are returned in the file's own format.
///
/// # Arguments
///
/// * `path` - Path to the WAV file
///
/// # Errors
///
/// Returns error if:
/// - File cannot be opened
/// - WAV format is invalid
/// - Sample format is unsupported
///
/// # Example
///
/// ```no_run
/// use media_common::Format;
/// use sender::audio::read_wav;
///
/// let audio = read_wav("voice.wav").unwrap().convert(Format::new(8000, 1));
/// println!("Duration: {:.2}s", audio.duration_secs());
/// ```
pub fn read_wav<P: AsRef<Path>>(path: P) -> Result<AudioData> {
    // ---
    let path = path.as_ref();
    info!("Reading WAV file: {}", path.display());

    let mut reader = WavReader::open(path)
        .with_context(|| format!("failed to open WAV file: {}", path.display()))?;

    let spec = reader.spec();
    info!(
        "WAV format: {}Hz, {} channels, {} bits",
        spec.sample_rate, spec.channels, spec.bits_per_sample
    );

    let samples: Vec<i16> = match (spec.sample_format, spec.bits_per_sample) {
        // --- Native path
        (SampleFormat::Int, 16) => reader
            .samples::<i16>()
            .collect::<Result<Vec<_>, _>>()
            .context("failed to read 16-bit PCM WAV samples")?,

        // --- Float path
        (SampleFormat::Float, 32) => reader
            .samples::<f32>()
            .map(|s| s.map(|s| (s.clamp(-1.0, 1.0) * i16::MAX as f32) as i16))
            .collect::<Result<Vec<_>, _>>()
            .context("failed to read 32-bit float WAV samples")?,

        (SampleFormat::Int, bits) => {
            bail!(
                "unsupported integer PCM WAV format: {}-bit (only 16-bit PCM is supported)",
                bits
            );
        }

        (SampleFormat::Float, bits) => {
            bail!(
                "unsupported float WAV format: {}-bit (only 32-bit float is supported)",
                bits
            );
        }
    };

    info!("Read {} samples from file", samples.len());
    Ok(AudioData::new(samples, Format::new(spec.sample_rate, spec.channels)))
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;

    #[test]
    fn test_downmix_quad() {
        // ---
        let quad = [100, 200, 300, 400];
        let mono: Vec<i16> = downmix(&quad, 4).collect();

        assert_eq!(mono, vec![250]);
    }

    #[test]
    fn test_convert_stereo_to_mono() {
        // ---
        let audio = AudioData::new(vec![100, 200, 300, 400, 500, 600], Format::new(16000, 2));
        let mono = audio.convert(Format::new(16000, 1));

        assert_eq!(mono.samples, vec![150, 350, 550]);
        assert_eq!(mono.format, Format::new(16000, 1));
    }

    #[test]
    fn test_convert_upsample_doubles_length() {
        // ---
        let audio = AudioData::new(vec![1000; 160], Format::new(8000, 1));
        let wide = audio.convert(Format::new(16000, 1));

        assert_eq!(wide.samples.len(), 320);
        assert!(wide.samples[2..].iter().all(|&s| s == 1000));
    }

    #[test]
    fn test_convert_mono_to_stereo_48k() {
        // ---
        let audio = AudioData::new(vec![0; 160], Format::new(16000, 1));
        let opus_ready = audio.convert(Format::new(48000, 2));

        assert_eq!(opus_ready.samples.len(), 960);
        assert_eq!(opus_ready.format.channels, 2);
    }

    #[test]
    fn test_audio_data_frames() {
        // ---
        let audio = AudioData::new(vec![0i16; 500], Format::new(16000, 1));

        let frames: Vec<_> = audio.frames(320).collect();
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[0].len(), 320);
        assert_eq!(frames[1].len(), 180);
        assert_eq!(audio.frame_count(320), 2);
    }

    #[test]
    fn test_audio_data_duration() {
        // ---
        let audio = AudioData::new(vec![0i16; 16000], Format::new(8000, 2));

        assert!((audio.duration_secs() - 1.0).abs() < 0.001);
    }

    #[test]
    fn test_read_wav_missing_file() {
        // ---
        assert!(read_wav("/nonexistent/voice.wav").is_err());
    }
}
