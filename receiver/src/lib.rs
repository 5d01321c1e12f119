//! RTP media receiver engine.
//!
//! Turns jittery, lossy, multi-codec RTP streams into a steady stream of
//! engine-format PCM for an audio device. This library can be used to
//! build custom receivers or for integration testing.
//!
//! The pieces, from the network inwards:
//! - [`RtpReceiver`]: UDP socket, RTP parsing, sequence extension
//! - [`AudioReceiver`]: codec resolution, [`JitterBuffer`], decode, PLC,
//!   comfort noise, conversion to the engine format
//! - [`Mixer`]: merges concurrent streams
//! - [`AudioManager`]: device pair lifecycle and file playback
//!
//! [`receive_loop`] wires them together on a single task.

pub mod audio_receiver;
pub mod cng;
pub mod config;
pub mod device;
pub mod error;
pub mod jitter_buffer;
pub mod manager;
pub mod mixer;
pub mod network;
pub mod pcm_window;
pub mod player;
pub mod stats;

pub use audio_receiver::{AudioReceiver, DecodeResult};
pub use config::{DecodeOptions, JitterConfig, ReceiverOptions, RuntimeConfig};
pub use error::{MixerError, MixerResult};
pub use jitter_buffer::{AddResult, FetchResult, JitterBuffer};
pub use manager::AudioManager;
pub use media_common::RtpPacket;
pub use mixer::{ContextId, Mixer};
pub use network::{NetworkStats, RtpReceiver};
pub use stats::{SharedStatistics, Statistics};

use anyhow::Result;
use media_common::resampler::FIXED_RATES;
use media_common::{MetricsContext, UniversalResampler, ENGINE_CHANNELS, ENGINE_RATE};
use std::future::Future;
use std::sync::Arc;
use std::time::Instant;
use tokio::time::{interval, interval_at, MissedTickBehavior};
use tracing::{debug, info, trace};

/// Mixer context used by [`receive_loop`].
pub const PLAYOUT_CONTEXT: ContextId = ContextId(1);

/// Best MOS the network estimate may report.
const MAX_MOS: f64 = 4.5;

/// Playout-side state of [`receive_loop`].
struct Playout {
    // ---
    pcm: Vec<i16>,
    engine_pcm: Vec<i16>,
    resampler: UniversalResampler,
}

impl Playout {
    // ---
    fn new() -> Self {
        // ---
        Self {
            pcm: Vec::new(),
            engine_pcm: Vec::new(),
            resampler: UniversalResampler::new(),
        }
    }

    /// Pulls one block from the receiver and queues it in the mixer.
    fn tick(
        &mut self,
        receiver: &mut AudioReceiver,
        mixer: &Mixer,
        metrics: &MetricsContext,
        config: &RuntimeConfig,
    ) {
        // ---
        self.pcm.clear();
        let started = Instant::now();
        let result = receiver.get_audio(&mut self.pcm, config.decode);
        metrics
            .decode_seconds
            .observe(started.elapsed().as_secs_f64());

        if result == DecodeResult::Concealed {
            metrics.frames_concealed_total.inc();
        }
        if !result.has_audio() || self.pcm.is_empty() {
            trace!("Playout tick: {:?}", result);
            return;
        }

        let mut rate = receiver.output_rate(config.decode);
        let mut samples = &self.pcm[..];
        if !FIXED_RATES.contains(&rate) {
            self.engine_pcm.clear();
            self.resampler.resample(
                rate,
                &self.pcm,
                ENGINE_RATE,
                ENGINE_CHANNELS,
                &mut self.engine_pcm,
            );
            rate = ENGINE_RATE;
            samples = &self.engine_pcm[..];
        }

        let ssrc = receiver.jitter_buffer().ssrc();
        if let Err(e) = mixer.add_pcm(PLAYOUT_CONTEXT, ssrc, samples, rate, false) {
            debug!("Mixer rejected {} samples: {}", samples.len(), e);
        }
    }
}

/// Mirrors receiver statistics into the metrics registry.
struct Reporter {
    // ---
    reported: Statistics,
    network: NetworkStats,
}

impl Reporter {
    // ---
    fn new() -> Self {
        // ---
        Self {
            reported: Statistics::new(),
            network: NetworkStats::default(),
        }
    }

    fn report(
        &mut self,
        receiver: &AudioReceiver,
        network: &RtpReceiver,
        mixer: &Mixer,
        metrics: &MetricsContext,
    ) {
        // ---
        let current = receiver.stats().lock().clone();
        let mut delta = current.clone();
        delta -= &self.reported;

        metrics.packets_received_total.inc_by(delta.received_rtp);
        metrics.packets_rejected_total.inc_by(delta.illegal_rtp);
        metrics.packets_duplicate_total.inc_by(delta.duplicated_rtp);
        metrics.packets_old_total.inc_by(delta.old_rtp);
        metrics.packets_lost_total.inc_by(delta.packet_loss);
        metrics.packets_dropped_total.inc_by(delta.packet_dropped);

        let net = network.stats();
        metrics
            .bytes_received_total
            .inc_by(net.bytes_received.saturating_sub(self.network.bytes_received));
        self.network = net;

        metrics
            .jitter_buffer_ms
            .set(receiver.jitter_buffer().available_ms() as i64);
        metrics
            .mixer_active_channels
            .set(mixer.active_channels() as i64);
        metrics.jitter_seconds.set(current.jitter);
        metrics.estimated_mos.set(current.calculate_mos(MAX_MOS));

        current.log();
        self.reported = current;
    }
}

/// Runs the receiver until `shutdown` completes.
///
/// Drives three cadences on one task: packet arrival feeds the
/// [`AudioReceiver`], the playout tick moves decoded audio into the
/// [`Mixer`], and the device tick lets the [`AudioManager`] service its
/// devices (which pull from the mixer when it is their delegate).
/// Statistics are logged and mirrored into `metrics` periodically.
///
/// # Arguments
///
/// * `network` - Socket delivering RTP packets
/// * `receiver` - Receive pipeline for the stream
/// * `mixer` - Destination of decoded audio
/// * `manager` - Device lifecycle; serviced on the device tick
/// * `metrics` - Prometheus registry handles
/// * `config` - Tick intervals and decode options
/// * `shutdown` - Completes when the loop should stop
///
/// # Errors
///
/// Returns error if the socket fails or the decoded-audio dump cannot be
/// finalized.
pub async fn receive_loop<F>(
    network: &mut RtpReceiver,
    receiver: &mut AudioReceiver,
    mixer: &Mixer,
    manager: &mut AudioManager,
    metrics: &MetricsContext,
    config: RuntimeConfig,
    shutdown: F,
) -> Result<()>
where
    F: Future<Output = ()>,
{
    // ---
    tokio::pin!(shutdown);

    let mut playout_tick = interval(config.playout_interval);
    let mut device_tick = interval(config.device_interval);
    device_tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut stats_tick = interval_at(
        tokio::time::Instant::now() + config.stats_interval,
        config.stats_interval,
    );

    let mut playout = Playout::new();
    let mut reporter = Reporter::new();

    info!(
        "Receive loop started (playout {:?}, device {:?})",
        config.playout_interval, config.device_interval
    );

    loop {
        tokio::select! {
            _ = &mut shutdown => {
                info!("Receive loop stopping");
                break;
            }

            packet = network.receive() => {
                if let Some(packet) = packet? {
                    let sequence = packet.extended_sequence;
                    if !receiver.add(Arc::new(packet)) {
                        trace!("Packet seq={} not buffered", sequence);
                    }
                }
            }

            _ = playout_tick.tick() => {
                playout.tick(receiver, mixer, metrics, &config);
            }

            _ = device_tick.tick() => {
                manager.process();
            }

            _ = stats_tick.tick() => {
                reporter.report(receiver, network, mixer, metrics);
            }
        }
    }

    reporter.report(receiver, network, mixer, metrics);
    mixer.unregister_channel(PLAYOUT_CONTEXT);
    receiver.finish_dump()?;

    Ok(())
}
