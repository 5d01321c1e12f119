//! Opus audio codec.
//!
//! Wraps the `opus` crate encoder and decoder behind the [`Codec`]
//! capability. Opus is variable bitrate, so the RTP payload length says
//! nothing about duration; the receiver uses the configured packet time.

use super::{Codec, CodecStats};
use anyhow::{bail, Context, Result};
use opus::{Application, Channels, Decoder, Encoder};
use tracing::debug;

/// Default dynamic payload type for Opus.
pub const OPUS_DEFAULT_PAYLOAD_TYPE: u8 = 106;

/// Largest Opus frame: 120ms.
const MAX_FRAME_MS: u32 = 120;

/// Encoded frame buffer size in bytes.
const MAX_PACKET_BYTES: usize = 4000;

/// Opus encoder/decoder pair.
///
/// # Configuration
///
/// - Sample Rate: 8, 12, 16, 24 or 48 kHz
/// - Channels: Mono or stereo
/// - Frame Size: `ptime_ms` (20ms by default)
/// - Application: VOIP (optimized for speech)
///
/// # Example
///
/// ```no_run
/// use media_common::codec::{Codec, OpusCodec};
///
/// let mut codec = OpusCodec::new(16000, 1, 20, 24000).unwrap();
/// let mut payload = Vec::new();
/// codec.encode(&vec![0i16; 320], &mut payload).unwrap();
/// let mut pcm = Vec::new();
/// codec.decode(&payload, &mut pcm).unwrap();
/// assert_eq!(pcm.len(), 320);
/// ```
pub struct OpusCodec {
    // ---
    encoder: Encoder,
    decoder: Decoder,
    rate: u32,
    channels: u16,
    ptime_ms: u32,

    /// Scratch buffer large enough for the longest Opus frame
    scratch: Vec<i16>,

    /// TOC configuration of the last decoded packet
    last_config: Option<u8>,
    bitrate_switches: u32,
}

impl OpusCodec {
    // ---
    /// Creates a new Opus codec.
    ///
    /// # Arguments
    ///
    /// * `rate` - Sample rate in Hz
    /// * `channels` - 1 or 2
    /// * `ptime_ms` - Frame duration used for encoding and concealment
    /// * `bitrate` - Target encoder bitrate in bits per second
    ///
    /// # Errors
    ///
    /// Returns error if:
    /// - The channel count is unsupported
    /// - Opus encoder or decoder initialization fails
    /// - Bitrate setting fails
    pub fn new(rate: u32, channels: u16, ptime_ms: u32, bitrate: i32) -> Result<Self> {
        // ---
        let opus_channels = match channels {
            1 => Channels::Mono,
            2 => Channels::Stereo,
            n => bail!("unsupported Opus channel count: {}", n),
        };

        let mut encoder = Encoder::new(rate, opus_channels, Application::Voip)
            .context("failed to create Opus encoder")?;
        encoder
            .set_bitrate(opus::Bitrate::Bits(bitrate))
            .context("failed to set bitrate")?;

        let decoder = Decoder::new(rate, opus_channels).context("failed to create Opus decoder")?;

        debug!(
            "Opus codec: {}Hz, {} channel(s), {}ms, {}bps",
            rate, channels, ptime_ms, bitrate
        );

        Ok(Self {
            encoder,
            decoder,
            rate,
            channels,
            ptime_ms,
            scratch: vec![0; (rate * MAX_FRAME_MS / 1000) as usize * channels as usize],
            last_config: None,
            bitrate_switches: 0,
        })
    }

    fn frame_samples(&self) -> usize {
        // ---
        (self.rate * self.ptime_ms / 1000) as usize * self.channels as usize
    }

    /// Counts changes of the TOC configuration (mode/bandwidth/frame size).
    fn track_config(&mut self, payload: &[u8]) {
        // ---
        let Some(&toc) = payload.first() else {
            return;
        };

        let config = toc >> 3;
        if let Some(previous) = self.last_config {
            if previous != config {
                self.bitrate_switches += 1;
            }
        }
        self.last_config = Some(config);
    }
}

impl Codec for OpusCodec {
    fn name(&self) -> &str {
        // ---
        "OPUS"
    }

    fn pcm_length(&self) -> usize {
        // ---
        self.frame_samples() * 2
    }

    fn rtp_length(&self) -> usize {
        // ---
        0
    }

    fn frame_time(&self) -> u32 {
        // ---
        self.ptime_ms
    }

    fn sample_rate(&self) -> u32 {
        // ---
        self.rate
    }

    fn channels(&self) -> u16 {
        // ---
        self.channels
    }

    fn encode(&mut self, pcm: &[i16], output: &mut Vec<u8>) -> Result<usize> {
        // ---
        if pcm.len() != self.frame_samples() {
            bail!(
                "unexpected frame size: expected {}, got {}",
                self.frame_samples(),
                pcm.len()
            );
        }

        let mut encoded = [0u8; MAX_PACKET_BYTES];
        let len = self
            .encoder
            .encode(pcm, &mut encoded)
            .context("Opus encoding failed")?;

        output.extend_from_slice(&encoded[..len]);
        Ok(len)
    }

    fn decode(&mut self, payload: &[u8], output: &mut Vec<i16>) -> Result<usize> {
        // ---
        self.track_config(payload);

        let per_channel = self
            .decoder
            .decode(payload, &mut self.scratch, false)
            .context("Opus decoding failed")?;

        let produced = per_channel * self.channels as usize;
        output.extend_from_slice(&self.scratch[..produced]);
        Ok(produced)
    }

    fn plc(&mut self, lost_frames: usize, output: &mut Vec<i16>) -> Result<usize> {
        // ---
        let frame = self.frame_samples();
        let mut produced = 0;

        for _ in 0..lost_frames {
            let per_channel = self
                .decoder
                .decode(&[], &mut self.scratch[..frame], false)
                .context("Opus PLC failed")?;

            let n = per_channel * self.channels as usize;
            output.extend_from_slice(&self.scratch[..n]);
            produced += n;
        }

        Ok(produced)
    }

    fn stats(&self) -> Option<CodecStats> {
        // ---
        Some(CodecStats {
            bitrate_switches: self.bitrate_switches,
        })
    }
}
