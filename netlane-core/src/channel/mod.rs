//! Message channels layered on the packet controller

mod reliable;
mod unreliable;

pub use reliable::ReliableChannel;
pub use unreliable::UnreliableChannel;

use bytes::Bytes;

use crate::error::CoreResult;

/// Delivery guarantee of a channel. The discriminant is the wire channel byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum QosType {
    /// Ordered, retransmitted until acked
    Reliable = 0,
    /// Deduplicated, never retransmitted
    Unreliable = 2,
}

impl QosType {
    /// Channel byte on the wire
    pub fn channel_id(self) -> u8 {
        self as u8
    }

    /// Map a wire channel byte back to a channel
    pub fn from_channel_id(id: u8) -> Option<Self> {
        match id {
            0 => Some(QosType::Reliable),
            2 => Some(QosType::Unreliable),
            _ => None,
        }
    }
}

/// Per-channel byte and message counters
#[derive(Debug, Default, Clone, Copy)]
pub struct ChannelStats {
    /// Application bytes accepted by `send_message`
    pub bytes_sent: u64,
    /// Application bytes delivered
    pub bytes_received: u64,
    /// Messages accepted by `send_message`
    pub messages_sent: u64,
    /// Messages delivered
    pub messages_received: u64,
    /// Messages refused with backpressure
    pub messages_dropped: u64,
}

/// A channel of either kind, dispatched by variant
pub enum MessageChannel {
    Reliable(ReliableChannel),
    Unreliable(UnreliableChannel),
}

impl MessageChannel {
    pub fn qos(&self) -> QosType {
        match self {
            MessageChannel::Reliable(_) => QosType::Reliable,
            MessageChannel::Unreliable(_) => QosType::Unreliable,
        }
    }

    pub fn send_message(&mut self, data: &[u8]) -> CoreResult<()> {
        match self {
            MessageChannel::Reliable(channel) => channel.send_message(data),
            MessageChannel::Unreliable(channel) => channel.send_message(data),
        }
    }

    pub fn receive_packet(&mut self, data: Bytes) -> CoreResult<()> {
        match self {
            MessageChannel::Reliable(channel) => channel.receive_packet(data),
            MessageChannel::Unreliable(channel) => channel.receive_packet(data),
        }
    }

    pub fn update(&mut self, now: f64) {
        match self {
            MessageChannel::Reliable(channel) => channel.update(now),
            MessageChannel::Unreliable(channel) => channel.update(now),
        }
    }

    /// Flush pending sends. A no-op for the unreliable channel.
    pub fn process_send_buffer(&mut self) -> CoreResult<()> {
        match self {
            MessageChannel::Reliable(channel) => channel.process_send_buffer(),
            MessageChannel::Unreliable(_) => Ok(()),
        }
    }

    pub fn drain_output(&mut self) -> Vec<Bytes> {
        match self {
            MessageChannel::Reliable(channel) => channel.drain_output(),
            MessageChannel::Unreliable(channel) => channel.drain_output(),
        }
    }

    pub fn drain_received(&mut self) -> Vec<Bytes> {
        match self {
            MessageChannel::Reliable(channel) => channel.drain_received(),
            MessageChannel::Unreliable(channel) => channel.drain_received(),
        }
    }

    pub fn reset(&mut self) {
        match self {
            MessageChannel::Reliable(channel) => channel.reset(),
            MessageChannel::Unreliable(channel) => channel.reset(),
        }
    }

    pub fn stats(&self) -> ChannelStats {
        match self {
            MessageChannel::Reliable(channel) => channel.stats(),
            MessageChannel::Unreliable(channel) => channel.stats(),
        }
    }

    pub fn usage_statistics(&self) -> String {
        match self {
            MessageChannel::Reliable(channel) => channel.usage_statistics(),
            MessageChannel::Unreliable(channel) => channel.controller().usage_statistics(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_channel_ids() {
        assert_eq!(QosType::Reliable.channel_id(), 0);
        assert_eq!(QosType::Unreliable.channel_id(), 2);
        assert_eq!(QosType::from_channel_id(2), Some(QosType::Unreliable));
        assert_eq!(QosType::from_channel_id(1), None);
    }
}
