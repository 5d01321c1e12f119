//! RTP packet structure, wire codec and sequence extension.
//!
//! Implements the RFC 3550 fixed header plus the optional parts a real
//! peer may send (CSRC list, header extension, padding). Packets carry
//! the receive wall-clock time and a wrap-aware extended sequence number
//! so the jitter buffer can order them across 16-bit wraparound.

use anyhow::{bail, Result};
use std::time::Instant;

/// RTP packet version 2 (as per RFC 3550)
const RTP_VERSION: u8 = 2;

/// Size of the fixed RTP header in bytes.
pub const RTP_HEADER_LEN: usize = 12;

/// RTP packet as seen by the media engine.
///
/// The engine never mutates a packet after it has been received; the
/// jitter buffer holds it behind an `Arc`.
///
/// # Protocol Details
///
/// - Version: Always 2 (RFC 3550)
/// - Payload Type: selects the codec (0 = PCMU, 8 = PCMA, dynamic for Opus)
/// - Sequence: 16-bit on the wire, extended to 32 bits on receive
/// - Timestamp: codec clock units
#[derive(Debug, Clone)]
pub struct RtpPacket {
    // ---
    /// RTP payload type (7 bits)
    pub payload_type: u8,

    /// Marker bit
    pub marker: bool,

    /// Wire sequence number (wraps at 65535)
    pub sequence: u16,

    /// Wrap-aware sequence number used for ordering
    pub extended_sequence: u32,

    /// RTP timestamp in codec clock units
    pub timestamp: u32,

    /// Synchronization source identifier
    pub ssrc: u32,

    /// Encoded audio payload
    pub payload: Vec<u8>,

    /// Wall-clock time the packet was received (or built)
    pub received_at: Instant,
}

impl RtpPacket {
    // ---
    /// Creates a new RTP packet with the given parameters.
    ///
    /// The extended sequence number starts equal to the wire sequence;
    /// receivers overwrite it through [`SequenceExtender`].
    ///
    /// # Arguments
    ///
    /// * `payload_type` - RTP payload type
    /// * `sequence` - Packet sequence number
    /// * `timestamp` - RTP timestamp (in codec clock units)
    /// * `ssrc` - Synchronization source identifier
    /// * `payload` - Encoded audio data
    pub fn new(payload_type: u8, sequence: u16, timestamp: u32, ssrc: u32, payload: Vec<u8>) -> Self {
        // ---
        Self {
            payload_type,
            marker: false,
            sequence,
            extended_sequence: sequence as u32,
            timestamp,
            ssrc,
            payload,
            received_at: Instant::now(),
        }
    }

    /// Sets the extended sequence number.
    pub fn with_extended_sequence(mut self, extended_sequence: u32) -> Self {
        // ---
        self.extended_sequence = extended_sequence;
        self
    }

    /// Sets the receive time.
    pub fn with_received_at(mut self, received_at: Instant) -> Self {
        // ---
        self.received_at = received_at;
        self
    }

    /// Sets the marker bit.
    pub fn with_marker(mut self, marker: bool) -> Self {
        // ---
        self.marker = marker;
        self
    }

    /// Serializes the RTP packet into wire format.
    ///
    /// # Wire Format
    ///
    /// ```text
    ///  0                   1                   2                   3
    ///  0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
    /// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
    /// |V=2|P|X|  CC   |M|     PT      |       sequence number         |
    /// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
    /// |                           timestamp                           |
    /// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
    /// |           synchronization source (SSRC) identifier            |
    /// +=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+
    /// |                           payload...                          |
    /// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
    /// ```
    ///
    /// # Errors
    ///
    /// Returns error if the payload type does not fit in 7 bits.
    pub fn serialize(&self) -> Result<Vec<u8>> {
        // ---
        if self.payload_type > 0x7F {
            bail!("payload type out of range: {}", self.payload_type);
        }

        let mut buf = Vec::with_capacity(RTP_HEADER_LEN + self.payload.len());

        // V=2, P=0, X=0, CC=0
        buf.push(RTP_VERSION << 6);
        buf.push(((self.marker as u8) << 7) | self.payload_type);
        buf.extend_from_slice(&self.sequence.to_be_bytes());
        buf.extend_from_slice(&self.timestamp.to_be_bytes());
        buf.extend_from_slice(&self.ssrc.to_be_bytes());
        buf.extend_from_slice(&self.payload);

        Ok(buf)
    }

    /// Deserializes an RTP packet from wire format.
    ///
    /// Skips the CSRC list and header extension, and strips padding.
    ///
    /// # Errors
    ///
    /// Returns error if:
    /// - Packet is smaller than the header it announces
    /// - RTP version is not 2
    /// - Padding length is larger than the payload
    pub fn deserialize(data: &[u8]) -> Result<Self> {
        // ---
        if data.len() < RTP_HEADER_LEN {
            bail!("packet too small: {} bytes", data.len());
        }

        let version = (data[0] >> 6) & 0x03;
        if version != RTP_VERSION {
            bail!("invalid RTP version: {}", version);
        }

        let has_padding = data[0] & 0x20 != 0;
        let has_extension = data[0] & 0x10 != 0;
        let csrc_count = (data[0] & 0x0F) as usize;
        let marker = data[1] & 0x80 != 0;
        let payload_type = data[1] & 0x7F;

        let sequence = u16::from_be_bytes([data[2], data[3]]);
        let timestamp = u32::from_be_bytes([data[4], data[5], data[6], data[7]]);
        let ssrc = u32::from_be_bytes([data[8], data[9], data[10], data[11]]);

        let mut offset = RTP_HEADER_LEN + csrc_count * 4;
        if data.len() < offset {
            bail!("truncated CSRC list: {} bytes", data.len());
        }

        if has_extension {
            if data.len() < offset + 4 {
                bail!("truncated header extension: {} bytes", data.len());
            }
            let words = u16::from_be_bytes([data[offset + 2], data[offset + 3]]) as usize;
            offset += 4 + words * 4;
            if data.len() < offset {
                bail!("header extension overruns packet: {} bytes", data.len());
            }
        }

        let mut end = data.len();
        if has_padding {
            let pad = data[end - 1] as usize;
            if pad == 0 || offset + pad > end {
                bail!("invalid padding length: {}", pad);
            }
            end -= pad;
        }

        Ok(Self {
            payload_type,
            marker,
            sequence,
            extended_sequence: sequence as u32,
            timestamp,
            ssrc,
            payload: data[offset..end].to_vec(),
            received_at: Instant::now(),
        })
    }
}

/// Extended cycle of the first packet of a stream.
const SEQ_BASE_CYCLE: u32 = 1 << 16;

/// Extends 16-bit wire sequence numbers to a monotonic 32-bit space.
///
/// Follows the RFC 3550 appendix A.1 idea: a jump backwards of more than
/// half the sequence space is a wraparound, anything smaller is reordering.
/// The first packet lands in the second cycle, so late packets from before
/// the stream start still extend below it.
#[derive(Debug, Default, Clone)]
pub struct SequenceExtender {
    // ---
    /// Highest wire sequence seen so far
    max_seq: Option<u16>,

    /// Number of wraparounds, shifted into the upper 16 bits
    cycles: u32,
}

impl SequenceExtender {
    // ---
    pub fn new() -> Self {
        // ---
        Self::default()
    }

    /// Returns the extended sequence number for `seq`.
    pub fn extend(&mut self, seq: u16) -> u32 {
        // ---
        let Some(max) = self.max_seq else {
            self.max_seq = Some(seq);
            self.cycles = SEQ_BASE_CYCLE;
            return self.cycles | seq as u32;
        };

        let delta = seq.wrapping_sub(max);
        if delta < 0x8000 {
            // In order or a forward jump; wrapped if the raw value went down
            if seq < max {
                self.cycles = self.cycles.wrapping_add(1 << 16);
            }
            self.max_seq = Some(seq);
            self.cycles | seq as u32
        } else if seq > max {
            // Late packet from before the last wrap (or the first packet)
            self.cycles.saturating_sub(1 << 16) | seq as u32
        } else {
            self.cycles | seq as u32
        }
    }

    /// Forgets all history (new SSRC).
    pub fn reset(&mut self) {
        // ---
        *self = Self::default();
    }
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;

    #[test]
    fn test_rtp_packet_serialization() {
        // ---
        let packet = RtpPacket::new(8, 100, 32000, 0x12345678, vec![1, 2, 3, 4]).with_marker(true);
        let serialized = packet.serialize().expect("serialization failed");

        assert_eq!(serialized[0] >> 6, 2);
        assert_eq!(serialized[1] & 0x7F, 8);
        assert_eq!(serialized[1] & 0x80, 0x80);
        assert_eq!(u16::from_be_bytes([serialized[2], serialized[3]]), 100);
        assert_eq!(&serialized[12..], &[1, 2, 3, 4]);
    }

    #[test]
    fn test_rtp_packet_deserialization() {
        // ---
        let packet = RtpPacket::new(106, 200, 64000, 0xAABBCCDD, vec![5, 6, 7, 8]);
        let serialized = packet.serialize().expect("serialization failed");

        let deserialized = RtpPacket::deserialize(&serialized).expect("deserialization failed");

        assert_eq!(deserialized.payload_type, 106);
        assert_eq!(deserialized.sequence, 200);
        assert_eq!(deserialized.extended_sequence, 200);
        assert_eq!(deserialized.timestamp, 64000);
        assert_eq!(deserialized.ssrc, 0xAABBCCDD);
        assert_eq!(deserialized.payload, vec![5, 6, 7, 8]);
        assert!(!deserialized.marker);
    }

    #[test]
    fn test_rtp_packet_too_small() {
        // ---
        let data = vec![0, 1, 2];
        assert!(RtpPacket::deserialize(&data).is_err());
    }

    #[test]
    fn test_rtp_invalid_version() {
        // ---
        let mut data = vec![0; 12];
        data[0] = 1 << 6;

        assert!(RtpPacket::deserialize(&data).is_err());
    }

    #[test]
    fn test_rtp_csrc_extension_and_padding() {
        // ---
        let mut data = vec![0xB1, 0x00, 0x00, 0x07, 0, 0, 0, 160, 0, 0, 0, 1];
        // One CSRC
        data.extend_from_slice(&[0xDE, 0xAD, 0xBE, 0xEF]);
        // Extension header with one 32-bit word
        data.extend_from_slice(&[0xBE, 0xDE, 0x00, 0x01, 1, 2, 3, 4]);
        // Payload then two bytes of padding
        data.extend_from_slice(&[9, 9, 9]);
        data.extend_from_slice(&[0, 2]);

        let packet = RtpPacket::deserialize(&data).expect("deserialization failed");

        assert_eq!(packet.sequence, 7);
        assert_eq!(packet.timestamp, 160);
        assert_eq!(packet.payload, vec![9, 9, 9]);
    }

    #[test]
    fn test_rtp_bad_padding() {
        // ---
        let mut data = vec![0xA0, 0x00, 0, 1, 0, 0, 0, 0, 0, 0, 0, 1];
        data.push(40);

        assert!(RtpPacket::deserialize(&data).is_err());
    }

    #[test]
    fn test_sequence_extender_wraparound() {
        // ---
        let mut ext = SequenceExtender::new();

        assert_eq!(ext.extend(65534), 0x1_FFFE);
        assert_eq!(ext.extend(65535), 0x1_FFFF);
        assert_eq!(ext.extend(0), 0x2_0000);
        assert_eq!(ext.extend(1), 0x2_0001);
    }

    #[test]
    fn test_sequence_extender_reordered_across_wrap() {
        // ---
        let mut ext = SequenceExtender::new();

        ext.extend(65534);
        assert_eq!(ext.extend(1), 0x2_0001);
        // Late packet from the previous cycle
        assert_eq!(ext.extend(65535), 0x1_FFFF);
        assert_eq!(ext.extend(2), 0x2_0002);
    }

    #[test]
    fn test_sequence_extender_reordered_same_cycle() {
        // ---
        let mut ext = SequenceExtender::new();

        ext.extend(10);
        ext.extend(12);
        assert_eq!(ext.extend(11), 0x1_000B);
        assert_eq!(ext.extend(13), 0x1_000D);
    }

    #[test]
    fn test_sequence_extender_late_packet_before_stream_start() {
        // ---
        let mut ext = SequenceExtender::new();

        let first = ext.extend(0);
        let second = ext.extend(1);
        let late = ext.extend(65535);
        let third = ext.extend(2);

        assert!(late < first);
        assert_eq!((first, second, third), (0x1_0000, 0x1_0001, 0x1_0002));
        assert_eq!(late, 0xFFFF);
    }

    #[test]
    fn test_sequence_extender_reset_restarts_base() {
        // ---
        let mut ext = SequenceExtender::new();

        ext.extend(65535);
        ext.extend(0);
        ext.reset();

        assert_eq!(ext.extend(500), 0x1_01F4);
    }
}
