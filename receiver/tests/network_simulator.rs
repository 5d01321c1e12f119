//! Network simulator for testing resilience.
//!
//! Provides in-process network condition simulation including packet loss,
//! jitter, duplication and reordering for integration testing.

#![allow(dead_code)]

use media_common::RtpPacket;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::VecDeque;
use std::time::{Duration, Instant};

/// Network simulator configuration.
#[derive(Debug, Clone, Default)]
pub struct NetworkSimulatorConfig {
    // ---
    /// Packet loss rate (0.0 to 1.0)
    pub loss_rate: f64,

    /// Maximum extra delivery delay in milliseconds
    pub jitter_ms: u32,

    /// Packet reordering rate (0.0 to 1.0)
    pub reorder_rate: f64,

    /// Packet duplication rate (0.0 to 1.0)
    pub duplicate_rate: f64,

    /// Random seed for deterministic testing
    pub seed: Option<u64>,
}

/// Packet with delayed delivery.
#[derive(Debug, Clone)]
struct DelayedPacket {
    packet: RtpPacket,
    delivery_time: Instant,
}

/// Simulates network conditions for testing.
///
/// Applies configurable loss, jitter, duplication and reordering to
/// packets passing through it.
pub struct NetworkSimulator {
    // ---
    config: NetworkSimulatorConfig,
    rng: StdRng,
    delayed_queue: VecDeque<DelayedPacket>,
    stats: NetworkSimulatorStats,
}

impl NetworkSimulator {
    // ---
    /// Creates a new network simulator with the given configuration.
    pub fn new(config: NetworkSimulatorConfig) -> Self {
        // ---
        let rng = match config.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };

        Self {
            config,
            rng,
            delayed_queue: VecDeque::new(),
            stats: NetworkSimulatorStats::default(),
        }
    }

    /// Sends a packet through the simulator.
    ///
    /// The packet may be dropped, delayed, duplicated or moved ahead of
    /// packets already in flight.
    pub fn send(&mut self, packet: RtpPacket) {
        // ---
        self.stats.packets_sent += 1;

        if self.rng.gen_bool(self.config.loss_rate) {
            self.stats.packets_lost += 1;
            return;
        }

        if self.rng.gen_bool(self.config.duplicate_rate) {
            self.stats.packets_duplicated += 1;
            let copy = self.delayed(packet.clone());
            self.delayed_queue.push_back(copy);
        }

        let delayed = self.delayed(packet);
        if self.rng.gen_bool(self.config.reorder_rate) && !self.delayed_queue.is_empty() {
            self.stats.packets_reordered += 1;
            let position = self.rng.gen_range(0..self.delayed_queue.len());
            self.delayed_queue.insert(position, delayed);
        } else {
            self.delayed_queue.push_back(delayed);
        }
    }

    fn delayed(&mut self, packet: RtpPacket) -> DelayedPacket {
        // ---
        let delay = if self.config.jitter_ms == 0 {
            Duration::ZERO
        } else {
            self.stats.packets_delayed += 1;
            Duration::from_millis(self.rng.gen_range(0..=self.config.jitter_ms) as u64)
        };

        DelayedPacket {
            packet,
            delivery_time: Instant::now() + delay,
        }
    }

    /// Retrieves the next packet ready for delivery.
    ///
    /// Returns `None` if no packets are ready yet.
    pub fn receive(&mut self) -> Option<RtpPacket> {
        // ---
        let ready = self
            .delayed_queue
            .front()
            .is_some_and(|d| d.delivery_time <= Instant::now());

        if ready {
            self.delayed_queue.pop_front().map(|d| d.packet)
        } else {
            None
        }
    }

    /// Delivers everything in flight in queue order, ignoring delays.
    pub fn drain(&mut self) -> Vec<RtpPacket> {
        // ---
        self.delayed_queue.drain(..).map(|d| d.packet).collect()
    }

    /// Returns number of packets currently in flight.
    pub fn in_flight(&self) -> usize {
        // ---
        self.delayed_queue.len()
    }

    pub fn stats(&self) -> NetworkSimulatorStats {
        // ---
        self.stats.clone()
    }
}

/// Network simulator statistics.
#[derive(Debug, Clone, Default)]
pub struct NetworkSimulatorStats {
    pub packets_sent: u64,
    pub packets_lost: u64,
    pub packets_delayed: u64,
    pub packets_reordered: u64,
    pub packets_duplicated: u64,
}

impl NetworkSimulatorStats {
    // ---
    pub fn loss_rate(&self) -> f64 {
        // ---
        if self.packets_sent == 0 {
            0.0
        } else {
            self.packets_lost as f64 / self.packets_sent as f64
        }
    }
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;

    fn make_packet(seq: u16) -> RtpPacket {
        RtpPacket::new(0, seq, seq as u32 * 160, 0x12345678, vec![0xFF; 160])
    }

    #[test]
    fn test_no_loss_no_delay() {
        // ---
        let mut sim = NetworkSimulator::new(NetworkSimulatorConfig::default());

        sim.send(make_packet(0));
        sim.send(make_packet(1));

        assert_eq!(sim.receive().expect("first").sequence, 0);
        assert_eq!(sim.receive().expect("second").sequence, 1);

        let stats = sim.stats();
        assert_eq!(stats.packets_lost, 0);
        assert_eq!(stats.loss_rate(), 0.0);
    }

    #[test]
    fn test_packet_loss() {
        // ---
        let config = NetworkSimulatorConfig {
            loss_rate: 1.0,
            seed: Some(42),
            ..Default::default()
        };
        let mut sim = NetworkSimulator::new(config);

        for i in 0..10 {
            sim.send(make_packet(i));
        }

        assert!(sim.receive().is_none());
        assert_eq!(sim.stats().packets_lost, 10);
        assert_eq!(sim.stats().loss_rate(), 1.0);
    }

    #[test]
    fn test_jitter_delivers_eventually() {
        // ---
        let config = NetworkSimulatorConfig {
            jitter_ms: 50,
            seed: Some(42),
            ..Default::default()
        };
        let mut sim = NetworkSimulator::new(config);

        sim.send(make_packet(0));
        std::thread::sleep(Duration::from_millis(80));

        assert!(sim.receive().is_some());
        assert_eq!(sim.in_flight(), 0);
    }

    #[test]
    fn test_duplication() {
        // ---
        let config = NetworkSimulatorConfig {
            duplicate_rate: 1.0,
            seed: Some(7),
            ..Default::default()
        };
        let mut sim = NetworkSimulator::new(config);

        sim.send(make_packet(3));

        let delivered = sim.drain();
        assert_eq!(delivered.len(), 2);
        assert!(delivered.iter().all(|p| p.sequence == 3));
    }

    #[test]
    fn test_deterministic_with_seed() {
        // ---
        let config = NetworkSimulatorConfig {
            loss_rate: 0.5,
            reorder_rate: 0.2,
            seed: Some(42),
            ..Default::default()
        };

        let mut sim1 = NetworkSimulator::new(config.clone());
        let mut sim2 = NetworkSimulator::new(config);

        for i in 0..100 {
            sim1.send(make_packet(i));
            sim2.send(make_packet(i));
        }

        let order1: Vec<u16> = sim1.drain().iter().map(|p| p.sequence).collect();
        let order2: Vec<u16> = sim2.drain().iter().map(|p| p.sequence).collect();
        assert_eq!(order1, order2);
        assert_eq!(sim1.stats().packets_lost, sim2.stats().packets_lost);
    }
}
