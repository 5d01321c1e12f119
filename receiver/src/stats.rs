//! Statistics for the receive pipeline.
//!
//! [`Statistics`] accumulates everything the jitter buffer and the audio
//! receiver account for: traffic counters, duplicate/old/lost/dropped
//! packets, the loss-run histogram, jitter and decode cadence. Snapshots
//! merge with `+=` and subtract with `-=`, which is how periodic deltas
//! are produced for logging and metrics.

use crate::config::LOSS_HISTOGRAM_LEN;
use media_common::RtpPacket;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::fmt;
use std::ops::{AddAssign, SubAssign};
use std::sync::Arc;
use std::time::{Instant, SystemTime};
use tracing::info;

/// Statistics shared by a receiver and its jitter buffer.
pub type SharedStatistics = Arc<Mutex<Statistics>>;

/// Count/min/max/average of a sampled value.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct RunningStat {
    // ---
    count: u64,
    sum: f64,
    min: f64,
    max: f64,
    last: f64,
}

impl RunningStat {
    // ---
    pub fn process(&mut self, value: f64) {
        // ---
        if self.count == 0 {
            self.min = value;
            self.max = value;
        } else {
            self.min = self.min.min(value);
            self.max = self.max.max(value);
        }
        self.count += 1;
        self.sum += value;
        self.last = value;
    }

    pub fn count(&self) -> u64 {
        // ---
        self.count
    }

    pub fn average(&self) -> f64 {
        // ---
        if self.count == 0 {
            0.0
        } else {
            self.sum / self.count as f64
        }
    }

    pub fn min(&self) -> f64 {
        // ---
        self.min
    }

    pub fn max(&self) -> f64 {
        // ---
        self.max
    }

    pub fn last(&self) -> f64 {
        // ---
        self.last
    }
}

/// RFC 3550 interarrival jitter estimator.
///
/// Works in timestamp units internally and reports seconds.
#[derive(Debug, Clone, Default)]
pub struct JitterStatistics {
    // ---
    /// Arrival time and RTP timestamp of the previous packet
    previous: Option<(Instant, u32)>,

    /// Smoothed jitter in timestamp units
    jitter_units: f64,

    /// Smoothed jitter in seconds, sampled after every update
    jitter: RunningStat,

    /// Largest single transit delta in seconds
    max_delta: f64,
}

impl JitterStatistics {
    // ---
    pub fn new() -> Self {
        // ---
        Self::default()
    }

    /// Folds one packet into the estimate.
    ///
    /// Packets whose timestamp does not advance (reordered or duplicated)
    /// are ignored.
    pub fn process(&mut self, packet: &RtpPacket, rate: u32) {
        // ---
        let Some((prev_time, prev_ts)) = self.previous else {
            self.previous = Some((packet.received_at, packet.timestamp));
            return;
        };

        if rate == 0 || packet.timestamp <= prev_ts {
            return;
        }

        let arrival_delta = packet
            .received_at
            .saturating_duration_since(prev_time)
            .as_secs_f64()
            * rate as f64;
        let timestamp_delta = (packet.timestamp - prev_ts) as f64;
        let delta = (arrival_delta - timestamp_delta).abs();

        self.max_delta = self.max_delta.max(delta / rate as f64);
        self.jitter_units += (delta - self.jitter_units) / 16.0;
        self.previous = Some((packet.received_at, packet.timestamp));
        self.jitter.process(self.jitter_units / rate as f64);
    }

    /// Current jitter in seconds.
    pub fn jitter(&self) -> f64 {
        // ---
        self.jitter.last()
    }

    /// Jitter history in seconds.
    pub fn history(&self) -> &RunningStat {
        // ---
        &self.jitter
    }

    /// Largest transit delta in seconds.
    pub fn max_delta(&self) -> f64 {
        // ---
        self.max_delta
    }
}

/// Cumulative receive/send statistics.
#[derive(Debug, Clone)]
pub struct Statistics {
    // ---
    /// Bytes received / sent on the wire
    pub received: u64,
    pub sent: u64,

    pub received_rtp: u64,
    pub sent_rtp: u64,
    pub received_rtcp: u64,
    pub sent_rtcp: u64,

    /// Packets rejected as duplicates of a buffered sequence number
    pub duplicated_rtp: u64,

    /// Packets rejected as older than a full buffer
    pub old_rtp: u64,

    /// Packets never received
    pub packet_loss: u64,

    /// Packets trimmed by the high watermark
    pub packet_dropped: u64,

    /// Packets rejected for unknown payload type or degenerate length
    pub illegal_rtp: u64,

    /// Loss runs indexed by run length
    pub loss: [u64; LOSS_HISTOGRAM_LEN],

    /// Milliseconds of audio emitted
    pub audio_time: u64,

    /// Bytes of PCM decoded
    pub decoded_size: u64,

    pub ssrc: u32,
    pub codec_name: String,

    /// Interarrival jitter and largest transit delta, in seconds
    pub jitter: f64,
    pub max_delta: f64,

    /// Packets seen per payload type
    pub codec_count: BTreeMap<u8, u64>,

    pub first_rtp_time: Option<SystemTime>,

    /// Milliseconds between consecutive decode operations
    pub decoding_interval: RunningStat,

    /// Milliseconds between consecutive playout requests
    pub decode_requested: RunningStat,

    /// Milliseconds between consecutive packet arrivals
    pub packet_interval: RunningStat,

    pub bitrate_switch_counter: u32,
}

impl Default for Statistics {
    fn default() -> Self {
        // ---
        Self {
            received: 0,
            sent: 0,
            received_rtp: 0,
            sent_rtp: 0,
            received_rtcp: 0,
            sent_rtcp: 0,
            duplicated_rtp: 0,
            old_rtp: 0,
            packet_loss: 0,
            packet_dropped: 0,
            illegal_rtp: 0,
            loss: [0; LOSS_HISTOGRAM_LEN],
            audio_time: 0,
            decoded_size: 0,
            ssrc: 0,
            codec_name: String::new(),
            jitter: 0.0,
            max_delta: 0.0,
            codec_count: BTreeMap::new(),
            first_rtp_time: None,
            decoding_interval: RunningStat::default(),
            decode_requested: RunningStat::default(),
            packet_interval: RunningStat::default(),
            bitrate_switch_counter: 0,
        }
    }
}

impl Statistics {
    // ---
    pub fn new() -> Self {
        // ---
        Self::default()
    }

    /// Creates a statistics block ready to be shared.
    pub fn shared() -> SharedStatistics {
        // ---
        Arc::new(Mutex::new(Self::default()))
    }

    /// Clears all counters.
    pub fn reset(&mut self) {
        // ---
        *self = Self::default();
    }

    /// Returns `(burst_ratio, loss_ratio)` from the loss-run histogram.
    ///
    /// Both are zero while fewer than five packets were lost in total.
    pub fn calculate_burstr(&self) -> (f64, f64) {
        // ---
        let (lost, bursts) = self
            .loss
            .iter()
            .enumerate()
            .fold((0u64, 0u64), |(lost, bursts), (len, &count)| {
                (lost + len as u64 * count, bursts + count)
            });

        if lost < 5 || self.received_rtp == 0 {
            return (0.0, 0.0);
        }

        let lossr = lost as f64 / self.received_rtp as f64;
        let burstr = if bursts > 0 {
            let mean_run = lost as f64 / bursts as f64;
            let r = (mean_run * (1.0 - lossr)).abs();
            r.max(1.0)
        } else {
            0.0
        };

        (burstr, lossr)
    }

    /// Network-only MOS estimate (E-model with burst loss), capped at `max_mos`.
    ///
    /// Returns `0.0` until at least 100 RTP packets were received.
    pub fn calculate_mos(&self, max_mos: f64) -> f64 {
        // ---
        if self.received_rtp < 100 {
            return 0.0;
        }

        let (burstr, lossr) = self.calculate_burstr();
        if lossr == 0.0 || burstr == 0.0 {
            return max_mos;
        }
        if lossr > 0.5 {
            return 1.0;
        }

        let bpl = 17.2647;
        let r = 93.2062077233 - 95.0 * (lossr * 100.0 / (lossr * 100.0 / burstr + bpl));
        let mos = 2.06405 + 0.031738 * r - 0.000356641 * r * r + 2.93143e-6 * r * r * r;

        mos.clamp(1.0, max_mos)
    }

    /// Counts a packet for `payload_type`.
    pub fn record_codec(&mut self, payload_type: u8) {
        // ---
        *self.codec_count.entry(payload_type).or_insert(0) += 1;
    }

    /// Records a loss run of `gap` packets.
    pub fn record_loss_run(&mut self, gap: usize) {
        // ---
        let gap = gap.min(LOSS_HISTOGRAM_LEN - 1);
        self.loss[gap] += 1;
        self.packet_loss += gap as u64;
    }

    /// Force log current statistics.
    pub fn log(&self) {
        // ---
        info!("RX Stats: {}", self);
    }
}

impl AddAssign<&Statistics> for Statistics {
    fn add_assign(&mut self, src: &Statistics) {
        // ---
        self.received += src.received;
        self.sent += src.sent;
        self.received_rtp += src.received_rtp;
        self.sent_rtp += src.sent_rtp;
        self.received_rtcp += src.received_rtcp;
        self.sent_rtcp += src.sent_rtcp;
        self.duplicated_rtp += src.duplicated_rtp;
        self.old_rtp += src.old_rtp;
        self.packet_loss += src.packet_loss;
        self.packet_dropped += src.packet_dropped;
        self.illegal_rtp += src.illegal_rtp;
        self.audio_time += src.audio_time;
        self.decoded_size += src.decoded_size;
        self.bitrate_switch_counter += src.bitrate_switch_counter;

        for (dst, &count) in self.loss.iter_mut().zip(src.loss.iter()) {
            *dst += count;
        }
        for (&pt, &count) in &src.codec_count {
            *self.codec_count.entry(pt).or_insert(0) += count;
        }

        self.jitter = src.jitter;
        self.max_delta = self.max_delta.max(src.max_delta);
        self.decoding_interval = src.decoding_interval;
        self.decode_requested = src.decode_requested;
        self.packet_interval = src.packet_interval;
        self.ssrc = src.ssrc;
        if !src.codec_name.is_empty() {
            self.codec_name = src.codec_name.clone();
        }

        self.first_rtp_time = match (self.first_rtp_time, src.first_rtp_time) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        };
    }
}

impl SubAssign<&Statistics> for Statistics {
    fn sub_assign(&mut self, src: &Statistics) {
        // ---
        self.received = self.received.saturating_sub(src.received);
        self.sent = self.sent.saturating_sub(src.sent);
        self.received_rtp = self.received_rtp.saturating_sub(src.received_rtp);
        self.sent_rtp = self.sent_rtp.saturating_sub(src.sent_rtp);
        self.received_rtcp = self.received_rtcp.saturating_sub(src.received_rtcp);
        self.sent_rtcp = self.sent_rtcp.saturating_sub(src.sent_rtcp);
        self.duplicated_rtp = self.duplicated_rtp.saturating_sub(src.duplicated_rtp);
        self.old_rtp = self.old_rtp.saturating_sub(src.old_rtp);
        self.packet_loss = self.packet_loss.saturating_sub(src.packet_loss);
        self.packet_dropped = self.packet_dropped.saturating_sub(src.packet_dropped);
        self.illegal_rtp = self.illegal_rtp.saturating_sub(src.illegal_rtp);
        self.audio_time = self.audio_time.saturating_sub(src.audio_time);
        self.decoded_size = self.decoded_size.saturating_sub(src.decoded_size);
        self.bitrate_switch_counter = self
            .bitrate_switch_counter
            .saturating_sub(src.bitrate_switch_counter);

        for (dst, &count) in self.loss.iter_mut().zip(src.loss.iter()) {
            *dst = dst.saturating_sub(count);
        }
        for (pt, &count) in &src.codec_count {
            if let Some(dst) = self.codec_count.get_mut(pt) {
                *dst = dst.saturating_sub(count);
            }
        }
    }
}

impl fmt::Display for Statistics {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // ---
        write!(
            f,
            "received: {}, lost: {}, dropped: {}, duplicated: {}, old: {}, sent: {}, \
             jitter: {:.2}ms, decoding interval: {:.1}ms, decode requested: {:.1}ms, \
             packet interval: {:.1}ms",
            self.received_rtp,
            self.packet_loss,
            self.packet_dropped,
            self.duplicated_rtp,
            self.old_rtp,
            self.sent_rtp,
            self.jitter * 1000.0,
            self.decoding_interval.average(),
            self.decode_requested.average(),
            self.packet_interval.average()
        )
    }
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;
    use std::time::Duration;

    fn packet_at(timestamp: u32, received_at: Instant) -> RtpPacket {
        // ---
        RtpPacket::new(0, 0, timestamp, 1, vec![]).with_received_at(received_at)
    }

    #[test]
    fn test_running_stat() {
        // ---
        let mut stat = RunningStat::default();
        stat.process(20.0);
        stat.process(10.0);
        stat.process(30.0);

        assert_eq!(stat.count(), 3);
        assert_eq!(stat.min(), 10.0);
        assert_eq!(stat.max(), 30.0);
        assert_eq!(stat.last(), 30.0);
        assert!((stat.average() - 20.0).abs() < 1e-9);
    }

    #[test]
    fn test_loss_run_clamped() {
        // ---
        let mut stats = Statistics::new();
        stats.record_loss_run(2);
        stats.record_loss_run(500);

        assert_eq!(stats.loss[2], 1);
        assert_eq!(stats.loss[127], 1);
        assert_eq!(stats.packet_loss, 129);
    }

    #[test]
    fn test_add_and_sub_assign() {
        // ---
        let mut total = Statistics::new();
        total.received_rtp = 10;
        total.record_codec(0);
        total.record_loss_run(1);

        let mut delta = Statistics::new();
        delta.received_rtp = 5;
        delta.codec_name = "PCMU".into();
        delta.record_codec(0);
        delta.record_codec(8);
        delta.record_loss_run(1);

        total += &delta;
        assert_eq!(total.received_rtp, 15);
        assert_eq!(total.codec_count[&0], 2);
        assert_eq!(total.codec_count[&8], 1);
        assert_eq!(total.loss[1], 2);
        assert_eq!(total.codec_name, "PCMU");

        total -= &delta;
        assert_eq!(total.received_rtp, 10);
        assert_eq!(total.codec_count[&0], 1);
        assert_eq!(total.codec_count[&8], 0);
        assert_eq!(total.loss[1], 1);
        assert_eq!(total.packet_loss, 1);
    }

    #[test]
    fn test_reset() {
        // ---
        let mut stats = Statistics::new();
        stats.duplicated_rtp = 4;
        stats.record_loss_run(3);
        stats.reset();

        assert_eq!(stats.duplicated_rtp, 0);
        assert!(stats.loss.iter().all(|&c| c == 0));
    }

    #[test]
    fn test_mos_requires_traffic() {
        // ---
        let mut stats = Statistics::new();
        stats.received_rtp = 99;
        assert_eq!(stats.calculate_mos(4.5), 0.0);

        stats.received_rtp = 1000;
        assert_eq!(stats.calculate_mos(4.5), 4.5);
    }

    #[test]
    fn test_mos_degrades_with_loss() {
        // ---
        let mut light = Statistics::new();
        light.received_rtp = 1000;
        for _ in 0..10 {
            light.record_loss_run(1);
        }

        let mut heavy = light.clone();
        for _ in 0..20 {
            heavy.record_loss_run(5);
        }

        let light_mos = light.calculate_mos(4.5);
        let heavy_mos = heavy.calculate_mos(4.5);

        assert!(light_mos < 4.5);
        assert!(heavy_mos < light_mos);
        assert!(heavy_mos >= 1.0);
    }

    #[test]
    fn test_burstr_ignores_small_loss() {
        // ---
        let mut stats = Statistics::new();
        stats.received_rtp = 500;
        stats.record_loss_run(2);

        assert_eq!(stats.calculate_burstr(), (0.0, 0.0));
    }

    #[test]
    fn test_jitter_zero_for_steady_stream() {
        // ---
        let start = Instant::now();
        let mut jitter = JitterStatistics::new();

        for i in 0..10u32 {
            let at = start + Duration::from_millis(20 * i as u64);
            jitter.process(&packet_at(i * 160, at), 8000);
        }

        assert!(jitter.jitter() < 1e-6);
        assert!(jitter.max_delta() < 1e-6);
    }

    #[test]
    fn test_jitter_grows_with_variance() {
        // ---
        let start = Instant::now();
        let mut jitter = JitterStatistics::new();

        for i in 0..10u32 {
            let wobble = if i % 2 == 0 { 0 } else { 15 };
            let at = start + Duration::from_millis(20 * i as u64 + wobble);
            jitter.process(&packet_at(i * 160, at), 8000);
        }

        assert!(jitter.jitter() > 0.001);
        assert!((jitter.max_delta() - 0.015).abs() < 0.0005);
    }

    #[test]
    fn test_jitter_ignores_non_advancing_timestamp() {
        // ---
        let start = Instant::now();
        let mut jitter = JitterStatistics::new();

        jitter.process(&packet_at(320, start), 8000);
        jitter.process(&packet_at(160, start + Duration::from_millis(50)), 8000);

        assert_eq!(jitter.history().count(), 0);
    }
}
