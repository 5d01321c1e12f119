//! Codec capability shared by the sender and the receive pipeline.
//!
//! A codec is an opaque encoder/decoder with fixed frame geometry. The
//! receiver uses the geometry to derive how many milliseconds a packet
//! represents and how to split a payload into frames; it never looks at
//! codec internals beyond the optional [`Codec::stats`] accessor.
//!
//! Codec instances are not thread safe: each one belongs to a single
//! stream and is driven by whoever owns that stream.

mod g711;
mod l16;
mod list;
mod opus;

pub use g711::{G711Codec, G711Law, PCMA_PAYLOAD_TYPE, PCMU_PAYLOAD_TYPE};
pub use l16::{L16Codec, L16_MONO_PAYLOAD_TYPE, L16_RATE, L16_STEREO_PAYLOAD_TYPE};
pub use list::{CodecDescriptor, CodecKind, CodecList, CodecMap, CodecSettings, OpusSettings};
pub use self::opus::{OpusCodec, OPUS_DEFAULT_PAYLOAD_TYPE};

use crate::format::Format;
use anyhow::Result;

/// Codec-specific counters surfaced to the engine statistics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CodecStats {
    // ---
    /// Number of times the remote side changed bitrate/mode mid-stream
    pub bitrate_switches: u32,
}

/// Encoder/decoder capability for a single RTP payload format.
///
/// Sample counts are interleaved 16-bit samples; lengths are bytes.
pub trait Codec {
    // ---
    /// Human readable codec name (e.g. `"PCMU"`).
    fn name(&self) -> &str;

    /// Bytes of PCM produced by decoding one frame.
    fn pcm_length(&self) -> usize;

    /// Bytes of RTP payload per frame, or `0` for variable bitrate codecs.
    fn rtp_length(&self) -> usize;

    /// Duration of one frame in milliseconds.
    fn frame_time(&self) -> u32;

    /// Native sample rate in Hz.
    fn sample_rate(&self) -> u32;

    /// Channel count of decoded PCM.
    fn channels(&self) -> u16 {
        // ---
        1
    }

    /// Encodes PCM into `output`, returning the number of bytes appended.
    ///
    /// # Errors
    ///
    /// Returns error if the codec rejects the input frame.
    fn encode(&mut self, pcm: &[i16], output: &mut Vec<u8>) -> Result<usize>;

    /// Decodes one payload into `output`, returning the number of samples appended.
    ///
    /// # Errors
    ///
    /// Returns error on a corrupt bitstream. Callers treat this as "nothing
    /// to emit" rather than a pipeline failure.
    fn decode(&mut self, payload: &[u8], output: &mut Vec<i16>) -> Result<usize>;

    /// Synthesizes audio for `lost_frames` missing frames.
    ///
    /// Returns the number of samples appended; `0` means the codec has no
    /// concealment to offer.
    ///
    /// # Errors
    ///
    /// Returns error if the codec's concealment fails internally.
    fn plc(&mut self, lost_frames: usize, output: &mut Vec<i16>) -> Result<usize>;

    /// Codec-specific statistics, if this codec keeps any.
    fn stats(&self) -> Option<CodecStats> {
        // ---
        None
    }

    /// PCM format of decoded audio.
    fn format(&self) -> Format {
        // ---
        Format::new(self.sample_rate(), self.channels())
    }

    /// Whether the payload size is unrelated to duration.
    fn is_vbr(&self) -> bool {
        // ---
        self.rtp_length() == 0
    }
}
