//! Configuration types for netlane.
//!
//! [`ClientConfig`] and [`ServerConfig`] wrap the core [`ReliableConfig`] and
//! [`ChannelConfig`] with handshake and runtime settings (tickrate, keys,
//! slot count, datagram queue size).

use crate::crypto::Key;
use crate::error::{NetError, Result};
use crate::packet::constants::MAX_PAYLOAD_BYTES;
use netlane_core::protocol::constants::{FRAGMENT_HEADER_BYTES, MAX_PACKET_HEADER_BYTES};
use std::net::{Ipv4Addr, SocketAddr};

// Re-export from netlane-core so users see a single set of config types.
pub use netlane_core::config::{ChannelConfig, ReliableConfig};

/// Allowed tick frequencies
pub const TICKRATE_RANGE: std::ops::RangeInclusive<u32> = 1..=1000;

// ── AddressCheck ────────────────────────────────────────────────────────

/// What the server does with a token that does not list its own address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AddressCheck {
    /// Log at debug and accept
    #[default]
    Lenient,
    /// Drop the request
    Strict,
}

// ── ClientConfig ────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub protocol_id: u64,
    pub bind_address: SocketAddr,
    pub tickrate: u32,
    pub datagram_queue_capacity: usize,
    pub event_queue_capacity: usize,
    pub reliable: ReliableConfig,
    pub channel: ChannelConfig,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            protocol_id: 0,
            bind_address: SocketAddr::from((Ipv4Addr::UNSPECIFIED, 0)),
            tickrate: 60,
            datagram_queue_capacity: 1024,
            event_queue_capacity: 1024,
            reliable: ReliableConfig::default().name("client"),
            channel: ChannelConfig::default(),
        }
    }
}

impl ClientConfig {
    pub fn new(protocol_id: u64) -> Self {
        Self {
            protocol_id,
            ..Self::default()
        }
    }

    pub fn bind_address(mut self, addr: SocketAddr) -> Self {
        self.bind_address = addr;
        self
    }

    pub fn tickrate(mut self, tickrate: u32) -> Self {
        self.tickrate = tickrate;
        self
    }

    pub fn datagram_queue_capacity(mut self, capacity: usize) -> Self {
        self.datagram_queue_capacity = capacity;
        self
    }

    pub fn event_queue_capacity(mut self, capacity: usize) -> Self {
        self.event_queue_capacity = capacity;
        self
    }

    pub fn reliable(mut self, config: ReliableConfig) -> Self {
        self.reliable = config;
        self
    }

    pub fn channel(mut self, config: ChannelConfig) -> Self {
        self.channel = config;
        self
    }

    /// Seconds between ticks
    pub fn tick_interval(&self) -> f64 {
        1.0 / self.tickrate.max(1) as f64
    }

    pub fn validate(&self) -> Result<()> {
        validate_runtime(self.tickrate, self.datagram_queue_capacity, self.event_queue_capacity)?;
        validate_reliable(&self.reliable)?;
        self.channel.validate()?;
        Ok(())
    }
}

// ── ServerConfig ────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub protocol_id: u64,
    pub private_key: Key,
    /// Address clients are told to connect to; checked against tokens
    pub public_address: SocketAddr,
    pub bind_address: SocketAddr,
    pub max_slots: usize,
    pub tickrate: u32,
    pub datagram_queue_capacity: usize,
    pub event_queue_capacity: usize,
    pub address_check: AddressCheck,
    pub reliable: ReliableConfig,
    pub channel: ChannelConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        let addr = SocketAddr::from((Ipv4Addr::LOCALHOST, 40000));
        Self {
            protocol_id: 0,
            private_key: [0u8; 32],
            public_address: addr,
            bind_address: addr,
            max_slots: 64,
            tickrate: 60,
            datagram_queue_capacity: 4096,
            event_queue_capacity: 4096,
            address_check: AddressCheck::Lenient,
            reliable: ReliableConfig::default().name("server"),
            channel: ChannelConfig::default(),
        }
    }
}

impl ServerConfig {
    pub fn new(protocol_id: u64, private_key: Key, public_address: SocketAddr) -> Self {
        Self {
            protocol_id,
            private_key,
            public_address,
            bind_address: public_address,
            ..Self::default()
        }
    }

    pub fn bind_address(mut self, addr: SocketAddr) -> Self {
        self.bind_address = addr;
        self
    }

    pub fn max_slots(mut self, slots: usize) -> Self {
        self.max_slots = slots;
        self
    }

    pub fn tickrate(mut self, tickrate: u32) -> Self {
        self.tickrate = tickrate;
        self
    }

    pub fn datagram_queue_capacity(mut self, capacity: usize) -> Self {
        self.datagram_queue_capacity = capacity;
        self
    }

    pub fn event_queue_capacity(mut self, capacity: usize) -> Self {
        self.event_queue_capacity = capacity;
        self
    }

    pub fn address_check(mut self, policy: AddressCheck) -> Self {
        self.address_check = policy;
        self
    }

    pub fn reliable(mut self, config: ReliableConfig) -> Self {
        self.reliable = config;
        self
    }

    pub fn channel(mut self, config: ChannelConfig) -> Self {
        self.channel = config;
        self
    }

    pub fn tick_interval(&self) -> f64 {
        1.0 / self.tickrate.max(1) as f64
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_slots == 0 || self.max_slots > u32::MAX as usize {
            return Err(NetError::config("max_slots must be at least 1"));
        }
        validate_runtime(self.tickrate, self.datagram_queue_capacity, self.event_queue_capacity)?;
        validate_reliable(&self.reliable)?;
        self.channel.validate()?;
        Ok(())
    }
}

// ── Presets ──────────────────────────────────────────────────────────────

impl ServerConfig {
    /// Small LAN server ticking fast with strict address checks
    pub fn lan(protocol_id: u64, private_key: Key, public_address: SocketAddr) -> Self {
        Self::new(protocol_id, private_key, public_address)
            .max_slots(16)
            .tickrate(120)
            .address_check(AddressCheck::Strict)
    }

    /// Few slots, estimators on, for tests
    pub fn testing(protocol_id: u64, private_key: Key, public_address: SocketAddr) -> Self {
        Self::new(protocol_id, private_key, public_address)
            .max_slots(4)
            .reliable(ReliableConfig::diagnostics().name("server"))
    }
}

/// Every packet the reliable layer emits must fit in one handshake payload
fn validate_reliable(reliable: &ReliableConfig) -> Result<()> {
    reliable.validate()?;
    let largest_regular = reliable.fragment_threshold + MAX_PACKET_HEADER_BYTES;
    let largest_fragment = reliable.fragment_size + FRAGMENT_HEADER_BYTES + MAX_PACKET_HEADER_BYTES;
    if largest_regular.max(largest_fragment) > MAX_PAYLOAD_BYTES {
        return Err(NetError::config(format!(
            "reliable packets up to {} bytes exceed the {MAX_PAYLOAD_BYTES} byte payload limit",
            largest_regular.max(largest_fragment)
        )));
    }
    Ok(())
}

fn validate_runtime(tickrate: u32, datagram_capacity: usize, event_capacity: usize) -> Result<()> {
    if !TICKRATE_RANGE.contains(&tickrate) {
        return Err(NetError::config(format!(
            "tickrate {tickrate} outside {}..={}",
            TICKRATE_RANGE.start(),
            TICKRATE_RANGE.end()
        )));
    }
    if datagram_capacity == 0 {
        return Err(NetError::config("datagram queue capacity must be greater than 0"));
    }
    if event_capacity == 0 {
        return Err(NetError::config("event queue capacity must be greater than 0"));
    }
    Ok(())
}
