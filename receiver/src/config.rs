//! Engine constants and configuration structs.
//!
//! Binaries map their CLI arguments onto these; library code only ever
//! sees the structs.

use media_common::CodecSettings;
use std::path::PathBuf;
use std::time::Duration;

/// Microphone block length in milliseconds.
pub const AUDIO_MIC_BUFFER_LENGTH: u32 = 10;

/// Speaker block length in milliseconds.
pub const AUDIO_SPK_BUFFER_LENGTH: u32 = 10;

/// Speaker blocks the device ring can hold.
pub const AUDIO_SPK_BUFFER_COUNT: usize = 16;

/// Mixer slot pool size.
pub const AUDIO_MIX_CHANNEL_COUNT: usize = 16;

/// Mixer output window in samples.
pub const MIXER_CAPACITY: usize = 32_768;

/// Per-channel input window of the mixer in samples.
pub const MIXER_CHANNEL_CAPACITY: usize = 16_384;

/// Output chunk used when mixing three or more channels.
pub const MIX_CHUNK_SAMPLES: usize = 512;

/// Loss histogram buckets; gaps are clamped to `LOSS_HISTOGRAM_LEN - 1`.
pub const LOSS_HISTOGRAM_LEN: usize = 128;

/// Default low watermark (ms).
pub const RTP_BUFFER_LOW: u32 = 10;

/// Default high watermark (ms).
pub const RTP_BUFFER_HIGH: u32 = 24_480;

/// Default prebuffer (ms).
pub const RTP_BUFFER_PREBUFFER: u32 = 80;

/// Duration assumed for a comfort-noise packet before any regular packet.
pub const CNG_DEFAULT_TIME_LENGTH: u32 = 20;

/// Largest comfort-noise chunk synthesized in one go when filling a gap.
pub const CNG_MAX_CHUNK_MS: u32 = 100;

/// Playout tick of the receive loop in milliseconds.
pub const PLAYOUT_INTERVAL_MS: u64 = 20;

/// Jitter buffer watermarks in milliseconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JitterConfig {
    // ---
    /// Minimum buffered audio before any release
    pub low_ms: u32,

    /// Maximum buffered audio; the excess is trimmed at fetch time
    pub high_ms: u32,

    /// Audio required before the very first release
    pub prebuffer_ms: u32,
}

impl Default for JitterConfig {
    fn default() -> Self {
        // ---
        Self {
            low_ms: RTP_BUFFER_LOW,
            high_ms: RTP_BUFFER_HIGH,
            prebuffer_ms: RTP_BUFFER_PREBUFFER,
        }
    }
}

/// Per-call decode switches for [`crate::AudioReceiver::get_audio`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DecodeOptions {
    // ---
    /// Fetch and account packets but produce no audio
    pub skip_decode: bool,

    /// Emit decoded audio at the codec rate
    pub dont_resample: bool,

    /// Fill the timestamp gap between comfort-noise packets with noise
    pub fill_cng_gap: bool,
}

impl DecodeOptions {
    // ---
    /// Options used by the regular playout loop.
    pub fn playout() -> Self {
        // ---
        Self {
            fill_cng_gap: true,
            ..Self::default()
        }
    }
}

/// Everything needed to build an [`crate::AudioReceiver`].
#[derive(Debug, Clone, Default)]
pub struct ReceiverOptions {
    // ---
    pub codecs: CodecSettings,
    pub jitter: JitterConfig,

    /// Decode on arrival and keep PCM in the jitter buffer
    pub early_decode: bool,

    /// Write every decoded engine-rate block to this WAV file
    pub dump_decoded: Option<PathBuf>,
}

/// Cadences of the receive loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RuntimeConfig {
    // ---
    /// Interval between `get_audio` calls
    pub playout_interval: Duration,

    /// Interval between device pair services
    pub device_interval: Duration,

    /// Interval between statistics logs and metric updates
    pub stats_interval: Duration,

    pub decode: DecodeOptions,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        // ---
        Self {
            playout_interval: Duration::from_millis(PLAYOUT_INTERVAL_MS),
            device_interval: Duration::from_millis(AUDIO_SPK_BUFFER_LENGTH as u64),
            stats_interval: Duration::from_secs(5),
            decode: DecodeOptions::playout(),
        }
    }
}
