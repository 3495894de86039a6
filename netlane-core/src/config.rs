//! Configuration types for the packet controller and message channels

use crate::error::{CoreError, CoreResult};
use crate::protocol::constants;

/// Packet controller tuning.
///
/// The defaults keep a 1024 byte fragment size. Raising it toward a typical
/// 1400 byte MTU leaves no room for the netcode header and AEAD tag, so
/// fragments would be dropped by the handshake layer's payload limit.
#[derive(Debug, Clone)]
pub struct ReliableConfig {
    /// Label used in logs
    pub name: String,
    /// Largest payload accepted by `send_packet`
    pub max_packet_size: usize,
    /// Payloads above this are fragmented
    pub fragment_threshold: usize,
    /// Upper bound on fragments per packet
    pub max_fragments: usize,
    /// Bytes of payload per fragment
    pub fragment_size: usize,
    /// Capacity of the sent packet window
    pub sent_packet_buffer_size: usize,
    /// Capacity of the received packet window
    pub received_packet_buffer_size: usize,
    /// Capacity of the fragment reassembly window
    pub fragment_reassembly_buffer_size: usize,
    /// EMA factor for RTT samples
    pub rtt_smoothing_factor: f32,
    /// EMA factor for packet loss
    pub packet_loss_smoothing_factor: f32,
    /// EMA factor for bandwidth estimates
    pub bandwidth_smoothing_factor: f32,
    /// Per-packet overhead counted by the bandwidth estimators
    pub packet_header_size: usize,
    /// Run loss/bandwidth estimators on every update
    pub enable_estimators: bool,
}

impl Default for ReliableConfig {
    fn default() -> Self {
        Self {
            name: "endpoint".to_string(),
            max_packet_size: 16 * 1024,
            fragment_threshold: 1024,
            max_fragments: 16,
            fragment_size: 1024,
            sent_packet_buffer_size: 256,
            received_packet_buffer_size: 256,
            fragment_reassembly_buffer_size: 64,
            rtt_smoothing_factor: 0.25,
            packet_loss_smoothing_factor: 0.1,
            bandwidth_smoothing_factor: 0.1,
            packet_header_size: 28,
            enable_estimators: false,
        }
    }
}

impl ReliableConfig {
    /// Create a configuration with default values
    pub fn new() -> Self {
        Self::default()
    }

    /// Defaults with loss and bandwidth estimators switched on
    pub fn diagnostics() -> Self {
        Self::default().estimators(true)
    }

    /// Set the log label
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Set maximum packet size
    pub fn max_packet_size(mut self, size: usize) -> Self {
        self.max_packet_size = size;
        self
    }

    /// Set fragmentation parameters
    pub fn fragmentation(mut self, threshold: usize, fragment_size: usize, max_fragments: usize) -> Self {
        self.fragment_threshold = threshold;
        self.fragment_size = fragment_size;
        self.max_fragments = max_fragments;
        self
    }

    /// Set sequence buffer capacities
    pub fn buffer_sizes(mut self, sent: usize, received: usize, reassembly: usize) -> Self {
        self.sent_packet_buffer_size = sent;
        self.received_packet_buffer_size = received;
        self.fragment_reassembly_buffer_size = reassembly;
        self
    }

    /// Toggle loss/bandwidth estimators
    pub fn estimators(mut self, enabled: bool) -> Self {
        self.enable_estimators = enabled;
        self
    }

    /// Validate configuration
    pub fn validate(&self) -> CoreResult<()> {
        if self.fragment_size == 0 || self.fragment_threshold == 0 {
            return Err(CoreError::config("Fragment size and threshold must be greater than 0"));
        }

        if self.fragment_threshold <= constants::MAX_PACKET_HEADER_BYTES {
            return Err(CoreError::config("Fragment threshold is smaller than the packet header"));
        }

        if self.max_fragments == 0 || self.max_fragments > 256 {
            return Err(CoreError::config("Max fragments must be between 1 and 256"));
        }

        if self.max_packet_size > self.max_fragments * self.fragment_size {
            return Err(CoreError::config(
                "Max packet size must not exceed max_fragments * fragment_size",
            ));
        }

        if self.max_packet_size <= constants::FRAGMENT_HEADER_BYTES + constants::MAX_PACKET_HEADER_BYTES {
            return Err(CoreError::config("Max packet size is smaller than the packet headers"));
        }

        for (label, size) in [
            ("sent packet", self.sent_packet_buffer_size),
            ("received packet", self.received_packet_buffer_size),
            ("fragment reassembly", self.fragment_reassembly_buffer_size),
        ] {
            if size == 0 || size > constants::MAX_SEQUENCE_BUFFER_SIZE {
                return Err(CoreError::config(format!(
                    "{label} buffer size must be between 1 and {}",
                    constants::MAX_SEQUENCE_BUFFER_SIZE
                )));
            }
        }

        Ok(())
    }
}

/// Message channel tuning
#[derive(Debug, Clone)]
pub struct ChannelConfig {
    /// Capacity of the reliable send/receive/ack windows
    pub reliable_buffer_size: usize,
    /// Overflow queue depth before sends fail with backpressure
    pub max_queue_size: usize,
    /// Overflow messages moved into the send window per update
    pub max_dequeue_per_update: usize,
    /// RTT at or above this marks the link as congested
    pub congestion_rtt_threshold_ms: f32,
    /// Capacity of the unreliable duplicate filter
    pub unreliable_receive_buffer_size: usize,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            reliable_buffer_size: 1024,
            max_queue_size: 2000,
            max_dequeue_per_update: 100,
            congestion_rtt_threshold_ms: 250.0,
            unreliable_receive_buffer_size: 256,
        }
    }
}

impl ChannelConfig {
    /// Create a configuration with default values
    pub fn new() -> Self {
        Self::default()
    }

    /// Set reliable window capacity
    pub fn reliable_buffer_size(mut self, size: usize) -> Self {
        self.reliable_buffer_size = size;
        self
    }

    /// Set overflow queue limit
    pub fn max_queue_size(mut self, size: usize) -> Self {
        self.max_queue_size = size;
        self
    }

    /// Set the congestion threshold
    pub fn congestion_rtt_threshold_ms(mut self, ms: f32) -> Self {
        self.congestion_rtt_threshold_ms = ms;
        self
    }

    /// Validate configuration
    pub fn validate(&self) -> CoreResult<()> {
        if self.reliable_buffer_size == 0 || self.reliable_buffer_size > constants::MAX_SEQUENCE_BUFFER_SIZE {
            return Err(CoreError::config(format!(
                "Reliable buffer size must be between 1 and {}",
                constants::MAX_SEQUENCE_BUFFER_SIZE
            )));
        }

        if self.unreliable_receive_buffer_size == 0
            || self.unreliable_receive_buffer_size > constants::MAX_SEQUENCE_BUFFER_SIZE
        {
            return Err(CoreError::config("Unreliable receive buffer size out of range"));
        }

        if self.max_dequeue_per_update == 0 {
            return Err(CoreError::config("Max dequeue per update must be greater than 0"));
        }

        Ok(())
    }
}
