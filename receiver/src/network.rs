//! UDP network reception for RTP packets.
//!
//! Provides async UDP socket handling. Each datagram is parsed, its
//! sequence number extended to 32 bits and its arrival time stamped
//! before it is handed to the receive pipeline.

use anyhow::{Context, Result};
use media_common::{RtpPacket, SequenceExtender};
use std::net::SocketAddr;
use std::time::Instant;
use tokio::net::UdpSocket;
use tracing::{debug, info, warn};

/// Largest datagram accepted; RTP over UDP stays well below this.
const MAX_DATAGRAM: usize = 2048;

/// Counters kept by [`RtpReceiver`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct NetworkStats {
    // ---
    pub packets_received: u64,
    pub bytes_received: u64,

    /// Datagrams that failed to parse as RTP
    pub packets_dropped: u64,

    /// Times the sender's SSRC changed
    pub ssrc_changes: u64,
}

/// UDP receiver for RTP packet reception.
///
/// Wraps a tokio UDP socket. Sequence numbers are extended per stream;
/// a new SSRC restarts the extension.
pub struct RtpReceiver {
    // ---
    socket: UdpSocket,
    buf: Vec<u8>,
    extender: SequenceExtender,
    ssrc: Option<u32>,
    stats: NetworkStats,
}

impl RtpReceiver {
    // ---
    /// Creates a new RTP receiver bound to the specified port.
    ///
    /// Listens on all interfaces (0.0.0.0) for incoming packets.
    ///
    /// # Arguments
    ///
    /// * `port` - UDP port to listen on; 0 picks an ephemeral port
    ///
    /// # Errors
    ///
    /// Returns error if socket binding fails.
    pub async fn new(port: u16) -> Result<Self> {
        // ---
        let addr: SocketAddr = ([0, 0, 0, 0], port).into();
        Self::bind(addr).await
    }

    /// Creates a receiver bound to `addr`.
    ///
    /// # Errors
    ///
    /// Returns error if socket binding fails.
    pub async fn bind(addr: SocketAddr) -> Result<Self> {
        // ---
        let socket = UdpSocket::bind(addr)
            .await
            .with_context(|| format!("failed to bind UDP socket to {}", addr))?;

        info!("UDP socket bound to {}", socket.local_addr()?);

        Ok(Self {
            socket,
            buf: vec![0u8; MAX_DATAGRAM],
            extender: SequenceExtender::new(),
            ssrc: None,
            stats: NetworkStats::default(),
        })
    }

    /// Address the socket is bound to.
    ///
    /// # Errors
    ///
    /// Returns error if the socket has no local address.
    pub fn local_addr(&self) -> Result<SocketAddr> {
        // ---
        self.socket
            .local_addr()
            .context("failed to read local address")
    }

    /// Receives the next RTP packet.
    ///
    /// Waits until a datagram arrives, then parses it. Invalid datagrams
    /// are logged and counted as dropped.
    ///
    /// # Returns
    ///
    /// The next valid RTP packet, or None if the datagram was invalid.
    ///
    /// # Errors
    ///
    /// Returns error if network reception fails.
    pub async fn receive(&mut self) -> Result<Option<RtpPacket>> {
        // ---
        let (len, src) = self
            .socket
            .recv_from(&mut self.buf)
            .await
            .context("failed to receive UDP packet")?;
        let received_at = Instant::now();

        self.stats.bytes_received += len as u64;

        match RtpPacket::deserialize(&self.buf[..len]) {
            Ok(packet) => Ok(Some(self.stamp(packet, received_at, src))),
            Err(e) => {
                self.stats.packets_dropped += 1;
                warn!("Dropped invalid packet from {}: {}", src, e);
                Ok(None)
            }
        }
    }

    fn stamp(&mut self, packet: RtpPacket, received_at: Instant, src: SocketAddr) -> RtpPacket {
        // ---
        if self.ssrc != Some(packet.ssrc) {
            if let Some(previous) = self.ssrc {
                info!("SSRC changed {:#010x} -> {:#010x}", previous, packet.ssrc);
                self.stats.ssrc_changes += 1;
            }
            self.ssrc = Some(packet.ssrc);
            self.extender.reset();
        }

        self.stats.packets_received += 1;
        let extended = self.extender.extend(packet.sequence);

        if self.stats.packets_received % 100 == 0 {
            debug!(
                "Received {} packets ({} bytes, {} dropped) from {} - seq={}",
                self.stats.packets_received,
                self.stats.bytes_received,
                self.stats.packets_dropped,
                src,
                extended
            );
        }

        packet
            .with_extended_sequence(extended)
            .with_received_at(received_at)
    }

    pub fn stats(&self) -> NetworkStats {
        // ---
        self.stats
    }
}
