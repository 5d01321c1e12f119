//! UDP network transmission for RTP packets.
//!
//! Provides async UDP socket handling for sending RTP packets
//! to the receiver.

use anyhow::{Context, Result};
use media_common::RtpPacket;
use std::net::SocketAddr;
use tokio::net::{lookup_host, UdpSocket};
use tracing::{debug, warn};

/// Counters kept by [`RtpSender`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SenderStats {
    // ---
    pub packets_sent: u64,
    pub bytes_sent: u64,

    /// Datagrams the socket refused
    pub send_errors: u64,
}

/// UDP sender for RTP packet transmission.
///
/// Network errors are logged and counted but do not stop the stream;
/// a receiver that is not running yet must not kill the sender.
///
/// # Example
///
/// ```ignore
/// use sender::network::RtpSender;
///
/// // Async context required
/// let sender = RtpSender::new("127.0.0.1:5004").await.unwrap();
/// // Use sender.send() to transmit packets
/// ```
pub struct RtpSender {
    // ---
    socket: UdpSocket,
    remote: SocketAddr,
    stats: SenderStats,
}

impl RtpSender {
    // ---
    /// Creates a new RTP sender bound to any available port.
    ///
    /// # Arguments
    ///
    /// * `remote` - Destination in "host:port" format
    ///
    /// # Errors
    ///
    /// Returns error if the address does not resolve or socket binding fails.
    pub async fn new(remote: &str) -> Result<Self> {
        // ---
        let remote = lookup_host(remote)
            .await
            .with_context(|| format!("failed to resolve {}", remote))?
            .next()
            .with_context(|| format!("no address for {}", remote))?;

        let local: SocketAddr = if remote.is_ipv4() {
            ([0, 0, 0, 0], 0).into()
        } else {
            ([0u16; 8], 0).into()
        };
        let socket = UdpSocket::bind(local)
            .await
            .context("failed to bind UDP socket")?;

        debug!("UDP socket bound to {} -> {}", socket.local_addr()?, remote);

        Ok(Self {
            socket,
            remote,
            stats: SenderStats::default(),
        })
    }

    pub fn remote_addr(&self) -> SocketAddr {
        // ---
        self.remote
    }

    /// Sends an RTP packet to the remote endpoint.
    ///
    /// Returns the number of bytes put on the wire, 0 when the socket
    /// refused the datagram.
    ///
    /// # Errors
    ///
    /// Returns error if packet serialization fails.
    pub async fn send(&mut self, packet: &RtpPacket) -> Result<usize> {
        // ---
        let data = packet
            .serialize()
            .context("failed to serialize RTP packet")?;

        match self.socket.send_to(&data, self.remote).await {
            Ok(bytes) => {
                self.stats.packets_sent += 1;
                self.stats.bytes_sent += bytes as u64;

                if self.stats.packets_sent % 100 == 0 {
                    debug!(
                        "Sent {} packets ({} bytes) - seq={}",
                        self.stats.packets_sent, self.stats.bytes_sent, packet.sequence
                    );
                }
                Ok(bytes)
            }
            Err(e) => {
                self.stats.send_errors += 1;
                warn!("Failed to send packet seq={}: {}", packet.sequence, e);
                Ok(0)
            }
        }
    }

    pub fn stats(&self) -> SenderStats {
        // ---
        self.stats
    }
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;

    #[tokio::test]
    async fn test_sender_creation() {
        // ---
        let sender = RtpSender::new("127.0.0.1:5004").await.expect("sender");
        assert_eq!(sender.remote_addr().port(), 5004);
    }

    #[tokio::test]
    async fn test_sender_rejects_bad_address() {
        // ---
        assert!(RtpSender::new("not an address").await.is_err());
    }

    #[tokio::test]
    async fn test_sender_delivers_packet() {
        // ---
        let listener = UdpSocket::bind("127.0.0.1:0").await.expect("bind");
        let target = listener.local_addr().expect("addr").to_string();
        let mut sender = RtpSender::new(&target).await.expect("sender creation failed");

        let packet = RtpPacket::new(0, 1, 160, 0x12345678, vec![0xFF; 160]);
        let bytes = sender.send(&packet).await.expect("send");

        let mut buf = [0u8; 512];
        let (len, _) = listener.recv_from(&mut buf).await.expect("recv");
        let received = RtpPacket::deserialize(&buf[..len]).expect("parse");

        assert_eq!(bytes, 172);
        assert_eq!(received.sequence, 1);
        assert_eq!(sender.stats().packets_sent, 1);
        assert_eq!(sender.stats().bytes_sent, 172);
    }
}
