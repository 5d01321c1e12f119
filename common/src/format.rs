//! PCM format descriptor.
//!
//! All PCM handled by the engine is signed 16-bit interleaved, so a
//! `Format` only needs rate and channel count to convert between sample
//! counts, byte lengths and durations.

use std::fmt;

/// Internal engine sample rate in Hz.
pub const ENGINE_RATE: u32 = 16_000;

/// Internal engine channel count.
pub const ENGINE_CHANNELS: u16 = 1;

/// Bytes per PCM sample.
pub const BYTES_PER_SAMPLE: usize = 2;

/// Sample rate and channel layout of a PCM stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Format {
    // ---
    /// Samples per second, per channel
    pub rate: u32,

    /// Interleaved channel count (>= 1)
    pub channels: u16,
}

impl Format {
    // ---
    /// Creates a format; a zero channel count is raised to mono.
    pub fn new(rate: u32, channels: u16) -> Self {
        // ---
        Self {
            rate: rate.max(1),
            channels: channels.max(1),
        }
    }

    /// Engine-internal format.
    pub const fn engine() -> Self {
        // ---
        Self {
            rate: ENGINE_RATE,
            channels: ENGINE_CHANNELS,
        }
    }

    /// Byte length of `ms` milliseconds of audio.
    pub fn size_from_time(&self, ms: u32) -> usize {
        // ---
        (ms as u64 * self.rate as u64 / 500 * self.channels as u64) as usize
    }

    /// Duration in milliseconds of `bytes` bytes of audio.
    pub fn time_from_size(&self, bytes: usize) -> u32 {
        // ---
        (self.samples_from_size(bytes) as u64 * 1000 / self.rate as u64) as u32
    }

    /// Per-channel sample count held in `bytes` bytes.
    pub fn samples_from_size(&self, bytes: usize) -> usize {
        // ---
        bytes / BYTES_PER_SAMPLE / self.channels as usize
    }

    /// Byte length of `samples` per-channel samples.
    pub fn size_from_samples(&self, samples: usize) -> usize {
        // ---
        samples * BYTES_PER_SAMPLE * self.channels as usize
    }

    /// Interleaved sample count for `ms` milliseconds.
    pub fn samples_from_time(&self, ms: u32) -> usize {
        // ---
        (ms as u64 * self.rate as u64 / 1000) as usize * self.channels as usize
    }

    /// Duration in milliseconds of `samples` interleaved samples.
    pub fn time_from_samples(&self, samples: usize) -> u32 {
        // ---
        (samples as u64 * 1000 / (self.rate as u64 * self.channels as u64)) as u32
    }
}

impl Default for Format {
    fn default() -> Self {
        // ---
        Self::engine()
    }
}

impl fmt::Display for Format {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // ---
        write!(f, "{}Hz/{}ch", self.rate, self.channels)
    }
}
