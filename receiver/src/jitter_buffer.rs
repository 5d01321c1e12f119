//! Jitter buffer for RTP packet reordering, loss accounting and playout.
//!
//! Packets are kept sorted by extended sequence number. Release is driven
//! by buffered duration against three watermarks: `low` gates every
//! release, `prebuffer` gates only the very first one, and anything above
//! `high` is trimmed from the front at fetch time.

use crate::config::{JitterConfig, LOSS_HISTOGRAM_LEN};
use crate::stats::SharedStatistics;
use media_common::RtpPacket;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, trace};

/// A packet accepted into the jitter buffer.
#[derive(Debug, Clone)]
pub struct BufferedPacket {
    // ---
    pub rtp: Arc<RtpPacket>,

    /// Playout duration in milliseconds
    pub timelength: u32,

    /// Native sample rate of the packet's codec
    pub rate: u32,

    /// PCM decoded on arrival (early-decode mode)
    pub pcm: Option<Arc<[i16]>>,
}

impl BufferedPacket {
    // ---
    pub fn new(rtp: Arc<RtpPacket>, timelength: u32, rate: u32) -> Self {
        // ---
        Self {
            rtp,
            timelength,
            rate,
            pcm: None,
        }
    }

    pub fn with_pcm(mut self, pcm: Arc<[i16]>) -> Self {
        // ---
        self.pcm = Some(pcm);
        self
    }

    pub fn sequence(&self) -> u32 {
        // ---
        self.rtp.extended_sequence
    }
}

/// Outcome of [`JitterBuffer::add`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddResult {
    Accepted,

    /// Same extended sequence number already buffered
    Duplicate,

    /// Older than everything buffered while the buffer is full, or already
    /// played out
    TooOld,
}

impl AddResult {
    // ---
    pub fn is_accepted(self) -> bool {
        // ---
        self == AddResult::Accepted
    }
}

/// Outcome of [`JitterBuffer::fetch`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchResult {
    /// Nothing to play this tick
    NoPacket,

    /// Packets are missing before the next buffered one; conceal instead
    Gap,

    /// The result list holds the next packet
    RegularPacket,
}

struct Inner {
    // ---
    config: JitterConfig,

    /// Sorted ascending by extended sequence number
    packets: VecDeque<BufferedPacket>,

    /// Extended sequence number of the last fetched (or trimmed) packet
    last_sequence: Option<u32>,

    last_arrival: Option<Instant>,
    add_counter: u64,
    returned_counter: u64,
}

impl Inner {
    // ---
    fn available_ms(&self) -> u32 {
        // ---
        self.packets.iter().map(|p| p.timelength).sum()
    }

    /// Moves the oldest packet into `result` and makes it the reference.
    fn release(&mut self, result: &mut Vec<BufferedPacket>) -> FetchResult {
        // ---
        let Some(packet) = self.packets.pop_front() else {
            return FetchResult::NoPacket;
        };
        self.last_sequence = Some(packet.sequence());
        result.push(packet);
        FetchResult::RegularPacket
    }
}

/// Sequence-ordered playout buffer.
///
/// All state sits behind one mutex, so a network task can `add` while the
/// playout task calls `fetch`. Abnormal packets never produce errors: they
/// are rejected and counted in the shared [`crate::Statistics`].
///
/// # Example
///
/// ```
/// use media_common::RtpPacket;
/// use receiver::jitter_buffer::{FetchResult, JitterBuffer};
/// use receiver::{JitterConfig, Statistics};
/// use std::sync::Arc;
///
/// let config = JitterConfig { low_ms: 10, high_ms: 1000, prebuffer_ms: 40 };
/// let buffer = JitterBuffer::new(config, Statistics::shared());
///
/// // Packets may arrive out of order
/// for seq in [2u16, 1, 0] {
///     let packet = RtpPacket::new(0, seq, seq as u32 * 160, 1, vec![0xFF; 160])
///         .with_extended_sequence(seq as u32);
///     buffer.add(Arc::new(packet), 20, 8000);
/// }
///
/// let mut out = Vec::new();
/// assert_eq!(buffer.fetch(&mut out), FetchResult::RegularPacket);
/// assert_eq!(out[0].sequence(), 0);
/// ```
pub struct JitterBuffer {
    // ---
    inner: Mutex<Inner>,
    stats: SharedStatistics,
}

impl JitterBuffer {
    // ---
    /// Creates a buffer accounting into `stats`.
    pub fn new(config: JitterConfig, stats: SharedStatistics) -> Self {
        // ---
        Self {
            inner: Mutex::new(Inner {
                config,
                packets: VecDeque::new(),
                last_sequence: None,
                last_arrival: None,
                add_counter: 0,
                returned_counter: 0,
            }),
            stats,
        }
    }

    /// Adds a received packet.
    ///
    /// # Arguments
    ///
    /// * `packet` - Shared RTP packet; never modified
    /// * `timelength` - Playout duration in milliseconds
    /// * `rate` - Native sample rate of the packet's codec
    pub fn add(&self, packet: Arc<RtpPacket>, timelength: u32, rate: u32) -> AddResult {
        // ---
        self.add_buffered(BufferedPacket::new(packet, timelength, rate))
    }

    /// Adds a packet that may already carry decoded PCM.
    pub fn add_buffered(&self, packet: BufferedPacket) -> AddResult {
        // ---
        let mut inner = self.inner.lock();
        let mut stats = self.stats.lock();

        inner.add_counter += 1;
        stats.ssrc = packet.rtp.ssrc;

        let arrival = packet.rtp.received_at;
        if let Some(previous) = inner.last_arrival {
            let interval = arrival.saturating_duration_since(previous);
            stats.packet_interval.process(interval.as_secs_f64() * 1000.0);
        }
        inner.last_arrival = Some(arrival);

        let sequence = packet.sequence();
        if inner.packets.iter().any(|p| p.sequence() == sequence) {
            stats.duplicated_rtp += 1;
            debug!("Discarding duplicate packet: seq={}", sequence);
            return AddResult::Duplicate;
        }

        if inner.last_sequence.is_some_and(|last| sequence <= last) {
            stats.old_rtp += 1;
            debug!("Discarding packet already played out: seq={}", sequence);
            return AddResult::TooOld;
        }

        let available = inner.available_ms();
        let newer_than_buffered = inner
            .packets
            .front()
            .map_or(true, |oldest| sequence > oldest.sequence());

        if !newer_than_buffered && available >= inner.config.high_ms {
            stats.old_rtp += 1;
            debug!(
                "Discarding too old packet: seq={} (buffered {}ms)",
                sequence, available
            );
            return AddResult::TooOld;
        }

        let position = inner
            .packets
            .partition_point(|p| p.sequence() < sequence);
        let timelength = packet.timelength;
        inner.packets.insert(position, packet);

        let available = available + timelength;
        if available > inner.config.high_ms {
            trace!(
                "Buffered {}ms exceeds high watermark {}ms",
                available,
                inner.config.high_ms
            );
        }

        AddResult::Accepted
    }

    /// Releases the next packet for playout.
    ///
    /// `result` is cleared and, on [`FetchResult::RegularPacket`], holds the
    /// released packet. Buffered duration never exceeds the high watermark
    /// once this returns.
    pub fn fetch(&self, result: &mut Vec<BufferedPacket>) -> FetchResult {
        // ---
        result.clear();

        let mut inner = self.inner.lock();
        let mut stats = self.stats.lock();

        let mut total = inner.available_ms();
        while total > inner.config.high_ms {
            let Some(dropped) = inner.packets.pop_front() else {
                break;
            };
            total -= dropped.timelength;
            inner.last_sequence = Some(dropped.sequence());
            stats.packet_dropped += 1;
            debug!("Dropping packet over high watermark: seq={}", dropped.sequence());
        }

        if total < inner.config.low_ms {
            return FetchResult::NoPacket;
        }

        let next = match (inner.last_sequence, inner.packets.front()) {
            (_, None) => None,
            (last, Some(packet)) => Some((last, packet.sequence())),
        };

        let outcome = match next {
            None => {
                if inner.last_sequence.is_some() {
                    stats.packet_loss += 1;
                }
                FetchResult::NoPacket
            }
            Some((None, _)) if total < inner.config.prebuffer_ms => {
                trace!("Prebuffering: {}ms of {}ms", total, inner.config.prebuffer_ms);
                FetchResult::NoPacket
            }
            Some((None, _)) => inner.release(result),
            Some((Some(last), next)) => {
                let gap = (next as i64 - last as i64 - 1).min(LOSS_HISTOGRAM_LEN as i64 - 1);

                if gap > 0 {
                    stats.record_loss_run(gap as usize);
                    trace!("Loss of {} packet(s) before seq={}", gap, next);
                }

                if gap > 0 && inner.packets.len() == 1 {
                    // Keep the packet for the next tick; the missing ones are
                    // now accounted for.
                    inner.last_sequence = Some(next - 1);
                    FetchResult::Gap
                } else {
                    inner.release(result)
                }
            }
        };

        if outcome != FetchResult::NoPacket {
            inner.returned_counter += 1;
        }
        outcome
    }

    /// Forgets all buffered packets and playout history.
    ///
    /// The next release waits for the prebuffer again. Used when the
    /// stream restarts under a new SSRC and its sequence space starts over.
    pub fn reset(&self) {
        // ---
        let mut inner = self.inner.lock();
        let discarded = inner.packets.len();
        inner.packets.clear();
        inner.last_sequence = None;
        inner.last_arrival = None;
        debug!("Jitter buffer reset, {} packet(s) discarded", discarded);
    }

    /// Buffered audio in milliseconds.
    pub fn available_ms(&self) -> u32 {
        // ---
        self.inner.lock().available_ms()
    }

    pub fn len(&self) -> usize {
        // ---
        self.inner.lock().packets.len()
    }

    pub fn is_empty(&self) -> bool {
        // ---
        self.inner.lock().packets.is_empty()
    }

    pub fn config(&self) -> JitterConfig {
        // ---
        self.inner.lock().config
    }

    pub fn set_low(&self, ms: u32) {
        // ---
        self.inner.lock().config.low_ms = ms;
    }

    pub fn low(&self) -> u32 {
        // ---
        self.inner.lock().config.low_ms
    }

    pub fn set_high(&self, ms: u32) {
        // ---
        self.inner.lock().config.high_ms = ms;
    }

    pub fn high(&self) -> u32 {
        // ---
        self.inner.lock().config.high_ms
    }

    pub fn set_prebuffer(&self, ms: u32) {
        // ---
        self.inner.lock().config.prebuffer_ms = ms;
    }

    pub fn prebuffer(&self) -> u32 {
        // ---
        self.inner.lock().config.prebuffer_ms
    }

    /// Packets accepted or rejected by `add` so far.
    pub fn add_count(&self) -> u64 {
        // ---
        self.inner.lock().add_counter
    }

    /// Fetches that returned a packet or a gap.
    pub fn returned_count(&self) -> u64 {
        // ---
        self.inner.lock().returned_counter
    }

    /// SSRC of the most recent packet.
    pub fn ssrc(&self) -> u32 {
        // ---
        self.stats.lock().ssrc
    }

    pub fn stats(&self) -> &SharedStatistics {
        // ---
        &self.stats
    }
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;
    use crate::stats::Statistics;

    fn make_packet(seq: u32) -> Arc<RtpPacket> {
        // ---
        Arc::new(
            RtpPacket::new(0, seq as u16, seq * 160, 0x12345678, vec![0xFF; 160])
                .with_extended_sequence(seq),
        )
    }

    fn buffer(low_ms: u32, high_ms: u32, prebuffer_ms: u32) -> JitterBuffer {
        // ---
        JitterBuffer::new(
            JitterConfig {
                low_ms,
                high_ms,
                prebuffer_ms,
            },
            Statistics::shared(),
        )
    }

    fn fetch_seq(buffer: &JitterBuffer) -> (FetchResult, Option<u32>) {
        // ---
        let mut out = Vec::new();
        let result = buffer.fetch(&mut out);
        (result, out.first().map(BufferedPacket::sequence))
    }

    #[test]
    fn test_in_order_release() {
        // ---
        let buffer = buffer(10, 1000, 20);
        for seq in 0..3 {
            buffer.add(make_packet(seq), 20, 8000);
        }

        assert_eq!(fetch_seq(&buffer), (FetchResult::RegularPacket, Some(0)));
        assert_eq!(fetch_seq(&buffer), (FetchResult::RegularPacket, Some(1)));
        assert_eq!(fetch_seq(&buffer), (FetchResult::RegularPacket, Some(2)));
    }

    #[test]
    fn test_reordering() {
        // ---
        let buffer = buffer(10, 1000, 20);
        buffer.add(make_packet(0), 20, 8000);
        buffer.add(make_packet(2), 20, 8000);
        buffer.add(make_packet(1), 20, 8000);

        assert_eq!(fetch_seq(&buffer).1, Some(0));
        assert_eq!(fetch_seq(&buffer).1, Some(1));
        assert_eq!(fetch_seq(&buffer).1, Some(2));
    }

    #[test]
    fn test_duplicate_packets() {
        // ---
        let buffer = buffer(10, 1000, 80);
        buffer.add(make_packet(5), 20, 8000);

        assert_eq!(buffer.add(make_packet(5), 20, 8000), AddResult::Duplicate);
        assert_eq!(buffer.len(), 1);
        assert_eq!(buffer.stats().lock().duplicated_rtp, 1);
    }

    #[test]
    fn test_prebuffer_gating() {
        // ---
        let buffer = buffer(10, 1000, 80);

        for seq in 0..3 {
            buffer.add(make_packet(seq), 20, 8000);
            assert_eq!(fetch_seq(&buffer).0, FetchResult::NoPacket);
        }

        buffer.add(make_packet(3), 20, 8000);
        assert_eq!(fetch_seq(&buffer), (FetchResult::RegularPacket, Some(0)));

        // After the first release only `low` matters
        assert_eq!(fetch_seq(&buffer).0, FetchResult::RegularPacket);
    }

    #[test]
    fn test_low_watermark_underrun() {
        // ---
        let buffer = buffer(30, 1000, 20);
        buffer.add(make_packet(0), 20, 8000);
        buffer.add(make_packet(1), 20, 8000);

        assert_eq!(fetch_seq(&buffer).0, FetchResult::RegularPacket);
        assert_eq!(fetch_seq(&buffer).0, FetchResult::NoPacket);
        assert_eq!(buffer.stats().lock().packet_loss, 0);
    }

    #[test]
    fn test_empty_after_release_counts_loss() {
        // ---
        let buffer = buffer(0, 1000, 20);
        buffer.add(make_packet(0), 20, 8000);

        assert_eq!(fetch_seq(&buffer).0, FetchResult::RegularPacket);
        assert_eq!(fetch_seq(&buffer).0, FetchResult::NoPacket);
        assert_eq!(buffer.stats().lock().packet_loss, 1);
    }

    #[test]
    fn test_gap_accounting() {
        // ---
        let buffer = buffer(10, 1000, 20);
        buffer.add(make_packet(100), 20, 8000);
        buffer.add(make_packet(103), 20, 8000);

        assert_eq!(fetch_seq(&buffer), (FetchResult::RegularPacket, Some(100)));
        assert_eq!(fetch_seq(&buffer), (FetchResult::Gap, None));
        assert_eq!(fetch_seq(&buffer), (FetchResult::RegularPacket, Some(103)));

        let stats = buffer.stats().lock();
        assert_eq!(stats.loss[2], 1);
        assert_eq!(stats.packet_loss, 2);
    }

    #[test]
    fn test_gap_with_more_packets_is_regular() {
        // ---
        let buffer = buffer(10, 1000, 20);
        for seq in [0, 2, 3] {
            buffer.add(make_packet(seq), 20, 8000);
        }

        assert_eq!(fetch_seq(&buffer).1, Some(0));
        assert_eq!(fetch_seq(&buffer), (FetchResult::RegularPacket, Some(2)));
        assert_eq!(buffer.stats().lock().loss[1], 1);
    }

    #[test]
    fn test_gap_clamped_to_histogram() {
        // ---
        let buffer = buffer(10, 100_000, 20);
        buffer.add(make_packet(0), 20, 8000);
        buffer.add(make_packet(1000), 20, 8000);
        buffer.add(make_packet(1001), 20, 8000);

        fetch_seq(&buffer);
        fetch_seq(&buffer);

        let stats = buffer.stats().lock();
        assert_eq!(stats.loss[127], 1);
        assert_eq!(stats.packet_loss, 127);
    }

    #[test]
    fn test_high_watermark_trim() {
        // ---
        let buffer = buffer(10, 100, 20);
        for seq in 0..10 {
            buffer.add(make_packet(seq), 20, 8000);
        }

        let (result, seq) = fetch_seq(&buffer);

        assert_eq!(result, FetchResult::RegularPacket);
        assert_eq!(seq, Some(5));
        assert!(buffer.available_ms() <= 100);
        assert_eq!(buffer.stats().lock().packet_dropped, 5);
        // Trimmed packets advance the gap reference: no loss recorded
        assert_eq!(buffer.stats().lock().packet_loss, 0);
    }

    #[test]
    fn test_old_packet_rejected_when_full() {
        // ---
        let buffer = buffer(10, 100, 20);
        for seq in 10..15 {
            assert!(buffer.add(make_packet(seq), 20, 8000).is_accepted());
        }

        assert_eq!(buffer.add(make_packet(5), 20, 8000), AddResult::TooOld);
        assert!(buffer.add(make_packet(20), 20, 8000).is_accepted());
        assert_eq!(buffer.stats().lock().old_rtp, 1);
    }

    #[test]
    fn test_older_packet_accepted_below_high() {
        // ---
        let buffer = buffer(10, 1000, 60);
        buffer.add(make_packet(10), 20, 8000);
        buffer.add(make_packet(11), 20, 8000);

        assert!(buffer.add(make_packet(9), 20, 8000).is_accepted());
        assert_eq!(fetch_seq(&buffer).1, Some(9));
    }

    #[test]
    fn test_played_out_packet_rejected() {
        // ---
        let buffer = buffer(0, 1000, 20);
        buffer.add(make_packet(0), 20, 8000);
        buffer.add(make_packet(1), 20, 8000);
        fetch_seq(&buffer);
        fetch_seq(&buffer);

        assert_eq!(buffer.add(make_packet(0), 20, 8000), AddResult::TooOld);
    }

    #[test]
    fn test_watermark_setters() {
        // ---
        let buffer = buffer(10, 1000, 80);
        buffer.set_low(20);
        buffer.set_high(500);
        buffer.set_prebuffer(40);

        assert_eq!(buffer.low(), 20);
        assert_eq!(buffer.high(), 500);
        assert_eq!(buffer.prebuffer(), 40);
    }

    #[test]
    fn test_counters_and_ssrc() {
        // ---
        let buffer = buffer(10, 1000, 20);
        buffer.add(make_packet(0), 20, 8000);
        buffer.add(make_packet(0), 20, 8000);
        fetch_seq(&buffer);

        assert_eq!(buffer.add_count(), 2);
        assert_eq!(buffer.returned_count(), 1);
        assert_eq!(buffer.ssrc(), 0x12345678);
    }

    #[test]
    fn test_reset_restarts_playout() {
        // ---
        let buffer = buffer(10, 1000, 40);
        for seq in 30_000..30_004 {
            buffer.add(make_packet(seq), 20, 8000);
        }
        fetch_seq(&buffer);
        fetch_seq(&buffer);
        assert_eq!(buffer.add(make_packet(100), 20, 8000), AddResult::TooOld);

        buffer.reset();
        assert!(buffer.is_empty());

        // Prebuffer applies again to the restarted sequence space
        assert!(buffer.add(make_packet(100), 20, 8000).is_accepted());
        assert_eq!(fetch_seq(&buffer), (FetchResult::NoPacket, None));
        assert!(buffer.add(make_packet(101), 20, 8000).is_accepted());
        assert_eq!(fetch_seq(&buffer), (FetchResult::RegularPacket, Some(100)));
        assert_eq!(fetch_seq(&buffer), (FetchResult::RegularPacket, Some(101)));
    }

    #[test]
    fn test_default_high_watermark_trims_long_backlog() {
        // ---
        let buffer = JitterBuffer::new(JitterConfig::default(), Statistics::shared());
        for seq in 0..1500 {
            buffer.add(make_packet(seq), 20, 8000);
        }

        // 24480ms holds 1224 packets; one more is released
        assert_eq!(fetch_seq(&buffer), (FetchResult::RegularPacket, Some(276)));
        assert_eq!(buffer.len(), 1223);
        assert_eq!(buffer.stats().lock().packet_dropped, 276);
    }

    #[test]
    fn test_empty_buffer_without_low_watermark() {
        // ---
        let buffer = buffer(0, 1000, 0);

        assert_eq!(fetch_seq(&buffer), (FetchResult::NoPacket, None));
        assert_eq!(buffer.stats().lock().packet_loss, 0);
    }
}
