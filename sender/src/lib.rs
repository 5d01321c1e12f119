//! RTP media sender library.
//!
//! Streams a WAV file as RTP with any codec the engine knows. Used as a
//! traffic source for the receiver and in integration tests.

pub mod audio;
pub mod network;

pub use audio::{read_wav, AudioData};
pub use media_common::RtpPacket;
pub use network::{RtpSender, SenderStats};

use anyhow::{Context, Result};
use media_common::codec::{PCMA_PAYLOAD_TYPE, PCMU_PAYLOAD_TYPE};
use media_common::{Codec, MetricsContext};
use std::time::Instant;
use tokio::time::{interval, Duration, MissedTickBehavior};
use tracing::{debug, info, warn};

/// Silent frames between two comfort-noise updates.
const SID_REFRESH_FRAMES: u32 = 10;

/// Per-stream transmission settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamConfig {
    // ---
    pub payload_type: u8,
    pub ssrc: u32,

    /// Milliseconds between packet transmissions
    pub interval_ms: u64,

    /// Replay the audio until the task is cancelled
    pub loop_audio: bool,

    /// Replace frames whose peak stays below this level with comfort-noise
    /// updates (G.711 only)
    pub silence_threshold: Option<i16>,
}

impl StreamConfig {
    // ---
    pub fn new(payload_type: u8, ssrc: u32) -> Self {
        // ---
        Self {
            payload_type,
            ssrc,
            interval_ms: 20,
            loop_audio: false,
            silence_threshold: None,
        }
    }
}

/// Noise level of `frame` in -dBov, as carried by a comfort-noise payload.
pub fn noise_level(frame: &[i16]) -> u8 {
    // ---
    if frame.is_empty() {
        return 127;
    }
    let energy: f64 = frame.iter().map(|&s| (s as f64) * (s as f64)).sum();
    let rms = (energy / frame.len() as f64).sqrt();
    if rms < 1.0 {
        return 127;
    }
    (-20.0 * (rms / 32768.0).log10()).round().clamp(0.0, 127.0) as u8
}

/// Sequence and timestamp state of one outgoing stream.
struct Packetizer {
    // ---
    sequence: u16,
    timestamp: u32,
    silent_frames: u32,
}

impl Packetizer {
    // ---
    fn next(&mut self, config: &StreamConfig, payload_type: u8, payload: Vec<u8>) -> RtpPacket {
        // ---
        let packet = RtpPacket::new(payload_type, self.sequence, self.timestamp, config.ssrc, payload);
        self.sequence = self.sequence.wrapping_add(1);
        packet
    }
}

/// Streams audio frames over RTP.
///
/// The audio is converted to the codec's format, cut into codec frames
/// (the last one zero-padded), encoded and sent one packet per interval.
/// With a silence threshold, silent G.711 frames are suppressed: the
/// first one and every tenth after it become a one-byte comfort-noise
/// packet, the rest are not sent at all. Timestamps keep advancing, so
/// the receiver sees the gap.
///
/// # Arguments
///
/// * `audio` - Audio data to stream, in any format
/// * `codec` - Encoder for the payload type in `config`
/// * `sender` - RTP network sender
/// * `metrics` - Prometheus registry handles
/// * `config` - Payload type, SSRC, pacing and suppression settings
///
/// # Errors
///
/// Returns error if encoding or packet serialization fails.
pub async fn stream_audio(
    audio: &AudioData,
    codec: &mut dyn Codec,
    sender: &mut RtpSender,
    metrics: &MetricsContext,
    config: StreamConfig,
) -> Result<()> {
    // ---
    let format = codec.format();
    let audio = audio.convert(format);
    let frame_len = codec.pcm_length() / 2;
    let ts_step = (frame_len / format.channels as usize) as u32;
    let suppress = config
        .silence_threshold
        .filter(|_| config.payload_type == PCMU_PAYLOAD_TYPE || config.payload_type == PCMA_PAYLOAD_TYPE);

    info!(
        "Streaming {:.2}s as {} (pt={}, {} samples/frame)",
        audio.duration_secs(),
        codec.name(),
        config.payload_type,
        frame_len
    );

    let mut packetizer = Packetizer {
        sequence: rand::random(),
        timestamp: rand::random(),
        silent_frames: 0,
    };
    let mut pacing = interval(Duration::from_millis(config.interval_ms.max(1)));
    pacing.set_missed_tick_behavior(MissedTickBehavior::Delay);

    let mut frame_data = Vec::with_capacity(frame_len);
    let mut payload = Vec::new();
    let mut frame_count = 0u64;

    loop {
        for frame in audio.frames(frame_len) {
            frame_data.clear();
            frame_data.extend_from_slice(frame);
            if frame_data.len() < frame_len {
                debug!("Padding last frame: {} samples -> {}", frame_data.len(), frame_len);
                frame_data.resize(frame_len, 0);
            }

            let silent = suppress.is_some_and(|threshold| {
                frame_data.iter().all(|&s| s.unsigned_abs() < threshold.unsigned_abs())
            });

            let packet = if silent {
                let refresh = packetizer.silent_frames % SID_REFRESH_FRAMES == 0;
                packetizer.silent_frames += 1;
                refresh.then(|| {
                    let level = noise_level(&frame_data);
                    packetizer.next(&config, config.payload_type, vec![level])
                })
            } else {
                packetizer.silent_frames = 0;
                payload.clear();
                let started = Instant::now();
                codec
                    .encode(&frame_data, &mut payload)
                    .with_context(|| format!("failed to encode frame {}", frame_count))?;
                metrics
                    .encode_seconds
                    .observe(started.elapsed().as_secs_f64());
                Some(packetizer.next(&config, config.payload_type, payload.clone()))
            };

            pacing.tick().await;
            if let Some(packet) = packet {
                let bytes = sender
                    .send(&packet)
                    .await
                    .with_context(|| format!("failed to send packet {}", packet.sequence))?;
                if bytes > 0 {
                    metrics.packets_sent_total.inc();
                    metrics.bytes_sent_total.inc_by(bytes as u64);
                }
            }

            packetizer.timestamp = packetizer.timestamp.wrapping_add(ts_step);
            frame_count += 1;
        }

        if !config.loop_audio {
            break;
        }
        if audio.samples.is_empty() {
            warn!("Nothing to loop: input is empty");
            break;
        }
        debug!("Looping input after {} frames", frame_count);
    }

    info!("Streamed {} frames", frame_count);
    Ok(())
}
