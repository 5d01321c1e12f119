//! L16: uncompressed big-endian 16-bit PCM (RFC 3551 static types 10/11).

use super::Codec;
use anyhow::{bail, Result};

/// Static payload type for L16 stereo at 44.1 kHz.
pub const L16_STEREO_PAYLOAD_TYPE: u8 = 10;

/// Static payload type for L16 mono at 44.1 kHz.
pub const L16_MONO_PAYLOAD_TYPE: u8 = 11;

/// Sample rate of the static L16 payload types.
pub const L16_RATE: u32 = 44_100;

const L16_PTIME_MS: u32 = 20;

/// Linear PCM codec.
pub struct L16Codec {
    // ---
    channels: u16,
}

impl L16Codec {
    // ---
    /// # Errors
    ///
    /// Returns error for channel counts other than 1 or 2.
    pub fn new(channels: u16) -> Result<Self> {
        // ---
        if !(1..=2).contains(&channels) {
            bail!("unsupported L16 channel count: {}", channels);
        }
        Ok(Self { channels })
    }

    fn frame_samples(&self) -> usize {
        // ---
        (L16_RATE * L16_PTIME_MS / 1000) as usize * self.channels as usize
    }
}

impl Codec for L16Codec {
    fn name(&self) -> &str {
        // ---
        "L16"
    }

    fn pcm_length(&self) -> usize {
        // ---
        self.frame_samples() * 2
    }

    fn rtp_length(&self) -> usize {
        // ---
        self.frame_samples() * 2
    }

    fn frame_time(&self) -> u32 {
        // ---
        L16_PTIME_MS
    }

    fn sample_rate(&self) -> u32 {
        // ---
        L16_RATE
    }

    fn channels(&self) -> u16 {
        // ---
        self.channels
    }

    fn encode(&mut self, pcm: &[i16], output: &mut Vec<u8>) -> Result<usize> {
        // ---
        output.reserve(pcm.len() * 2);
        for sample in pcm {
            output.extend_from_slice(&sample.to_be_bytes());
        }
        Ok(pcm.len() * 2)
    }

    fn decode(&mut self, payload: &[u8], output: &mut Vec<i16>) -> Result<usize> {
        // ---
        if payload.len() % 2 != 0 {
            bail!("odd L16 payload length: {}", payload.len());
        }

        output.extend(
            payload
                .chunks_exact(2)
                .map(|pair| i16::from_be_bytes([pair[0], pair[1]])),
        );
        Ok(payload.len() / 2)
    }

    fn plc(&mut self, _lost_frames: usize, _output: &mut Vec<i16>) -> Result<usize> {
        // ---
        Ok(0)
    }
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;

    #[test]
    fn test_stereo_geometry() {
        // ---
        let codec = L16Codec::new(2).expect("codec");

        assert_eq!(codec.rtp_length(), 882 * 2 * 2);
        assert_eq!(codec.format().channels, 2);
        assert_eq!(codec.format().rate, 44_100);
    }

    #[test]
    fn test_decode_big_endian() {
        // ---
        let mut codec = L16Codec::new(1).expect("codec");
        let mut out = Vec::new();

        let n = codec.decode(&[0x01, 0x02, 0xFF, 0xFE], &mut out).expect("decode");

        assert_eq!(n, 2);
        assert_eq!(out, vec![0x0102, -2]);
    }

    #[test]
    fn test_decode_rejects_odd_length() {
        // ---
        let mut codec = L16Codec::new(1).expect("codec");
        let mut out = Vec::new();

        assert!(codec.decode(&[1, 2, 3], &mut out).is_err());
        assert!(out.is_empty());
    }

    #[test]
    fn test_invalid_channels() {
        // ---
        assert!(L16Codec::new(0).is_err());
        assert!(L16Codec::new(3).is_err());
    }
}
