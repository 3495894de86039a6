//! Deterministic network simulator: latency, jitter, loss and duplication
//! driven by the caller's clock.

use std::net::SocketAddr;

use bytes::Bytes;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::error::{NetError, Result};

/// Link impairment settings. Times are in seconds, rates in `0.0..=1.0`.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct SimulatorConfig {
    pub latency: f64,
    /// Uniform +/- spread added to `latency`; large values reorder packets
    pub jitter: f64,
    pub packet_loss: f32,
    pub duplicate: f32,
}

impl SimulatorConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn latency_ms(mut self, ms: f64) -> Self {
        self.latency = ms / 1000.0;
        self
    }

    pub fn jitter_ms(mut self, ms: f64) -> Self {
        self.jitter = ms / 1000.0;
        self
    }

    pub fn packet_loss(mut self, rate: f32) -> Self {
        self.packet_loss = rate;
        self
    }

    pub fn duplicate(mut self, rate: f32) -> Self {
        self.duplicate = rate;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.latency < 0.0 || self.jitter < 0.0 {
            return Err(NetError::config("latency and jitter must not be negative"));
        }
        if !(0.0..=1.0).contains(&self.packet_loss) || !(0.0..=1.0).contains(&self.duplicate) {
            return Err(NetError::config("loss and duplicate rates must be within 0.0..=1.0"));
        }
        Ok(())
    }

    pub fn is_perfect(&self) -> bool {
        *self == Self::default()
    }

    /// Delivery delays for one datagram: empty when lost, two entries when
    /// duplicated.
    pub fn sample<R: Rng + ?Sized>(&self, rng: &mut R) -> Vec<f64> {
        if self.packet_loss > 0.0 && rng.gen::<f32>() < self.packet_loss {
            return Vec::new();
        }
        let copies = if self.duplicate > 0.0 && rng.gen::<f32>() < self.duplicate {
            2
        } else {
            1
        };
        (0..copies)
            .map(|_| {
                let jitter = if self.jitter > 0.0 {
                    rng.gen_range(-self.jitter..=self.jitter)
                } else {
                    0.0
                };
                (self.latency + jitter).max(0.0)
            })
            .collect()
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SimulatorStats {
    pub sent: u64,
    pub dropped: u64,
    pub duplicated: u64,
    pub delivered: u64,
}

#[derive(Debug)]
struct InFlight {
    deliver_at: f64,
    from: SocketAddr,
    to: SocketAddr,
    data: Bytes,
}

/// Datagrams in flight between addresses
#[derive(Debug)]
pub struct NetworkSimulator {
    config: SimulatorConfig,
    rng: StdRng,
    in_flight: Vec<InFlight>,
    stats: SimulatorStats,
}

impl NetworkSimulator {
    pub fn new(config: SimulatorConfig) -> Self {
        Self::with_rng(config, StdRng::from_entropy())
    }

    /// Reproducible runs
    pub fn with_seed(config: SimulatorConfig, seed: u64) -> Self {
        Self::with_rng(config, StdRng::seed_from_u64(seed))
    }

    fn with_rng(config: SimulatorConfig, rng: StdRng) -> Self {
        Self {
            config,
            rng,
            in_flight: Vec::new(),
            stats: SimulatorStats::default(),
        }
    }

    pub fn config(&self) -> &SimulatorConfig {
        &self.config
    }

    /// Applies to datagrams sent from now on
    pub fn set_config(&mut self, config: SimulatorConfig) {
        self.config = config;
    }

    pub fn stats(&self) -> SimulatorStats {
        self.stats
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.len()
    }

    pub fn send(&mut self, from: SocketAddr, to: SocketAddr, data: Bytes, now: f64) {
        self.stats.sent += 1;
        let delays = self.config.sample(&mut self.rng);
        match delays.len() {
            0 => self.stats.dropped += 1,
            1 => {}
            _ => self.stats.duplicated += 1,
        }
        for delay in delays {
            self.in_flight.push(InFlight {
                deliver_at: now + delay,
                from,
                to,
                data: data.clone(),
            });
        }
    }

    /// Datagrams due at `now` as `(from, to, data)`, earliest first
    pub fn drain_ready(&mut self, now: f64) -> Vec<(SocketAddr, SocketAddr, Bytes)> {
        let (mut ready, pending): (Vec<_>, Vec<_>) = self.in_flight.drain(..).partition(|p| p.deliver_at <= now);
        self.in_flight = pending;
        ready.sort_by(|a, b| a.deliver_at.total_cmp(&b.deliver_at));
        self.stats.delivered += ready.len() as u64;
        ready.into_iter().map(|p| (p.from, p.to, p.data)).collect()
    }

    pub fn clear(&mut self) {
        self.in_flight.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(port: u16) -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], port))
    }

    #[test]
    fn test_latency_holds_packets() {
        let mut sim = NetworkSimulator::with_seed(SimulatorConfig::new().latency_ms(50.0), 1);
        sim.send(addr(1), addr(2), Bytes::from_static(b"a"), 0.0);
        assert!(sim.drain_ready(0.04).is_empty());
        let ready = sim.drain_ready(0.05);
        assert_eq!(ready, vec![(addr(1), addr(2), Bytes::from_static(b"a"))]);
        assert_eq!(sim.in_flight(), 0);
    }

    #[test]
    fn test_loss_and_duplication_rates() {
        let config = SimulatorConfig::new().packet_loss(0.25).duplicate(0.1);
        let mut sim = NetworkSimulator::with_seed(config, 7);
        for _ in 0..10_000 {
            sim.send(addr(1), addr(2), Bytes::from_static(b"x"), 0.0);
        }
        let stats = sim.stats();
        assert!((2_200..=2_800).contains(&stats.dropped), "dropped {}", stats.dropped);
        assert!((500..=1_000).contains(&stats.duplicated), "duplicated {}", stats.duplicated);
        assert_eq!(sim.drain_ready(0.0).len() as u64, stats.sent - stats.dropped + stats.duplicated);
    }

    #[test]
    fn test_jitter_reorders() {
        let config = SimulatorConfig::new().latency_ms(50.0).jitter_ms(40.0);
        let mut sim = NetworkSimulator::with_seed(config, 3);
        for i in 0..100u8 {
            sim.send(addr(1), addr(2), Bytes::from(vec![i]), i as f64 * 0.001);
        }
        let order: Vec<u8> = sim.drain_ready(1.0).into_iter().map(|(_, _, data)| data[0]).collect();
        assert_eq!(order.len(), 100);
        assert!(order.windows(2).any(|pair| pair[0] > pair[1]));
    }

    #[test]
    fn test_validate() {
        assert!(SimulatorConfig::new().validate().is_ok());
        assert!(SimulatorConfig::new().packet_loss(1.5).validate().is_err());
        assert!(SimulatorConfig::new().latency_ms(-1.0).validate().is_err());
        assert!(SimulatorConfig::new().is_perfect());
    }
}
