use bytes::Bytes;
use tracing::trace;

use super::{ChannelStats, QosType};
use crate::config::{ChannelConfig, ReliableConfig};
use crate::controller::PacketController;
use crate::error::CoreResult;
use crate::sequence_buffer::SequenceBuffer;

/// Fire-and-forget channel; each packet is delivered at most once
pub struct UnreliableChannel {
    controller: PacketController,
    receive_buffer: SequenceBuffer<()>,
    received: Vec<Bytes>,
    stats: ChannelStats,
    time: f64,
    last_send: Option<f64>,
}

impl UnreliableChannel {
    pub fn new(reliable: ReliableConfig, channel: &ChannelConfig, now: f64) -> CoreResult<Self> {
        Ok(Self {
            controller: PacketController::new(reliable, now)?,
            receive_buffer: SequenceBuffer::new(channel.unreliable_receive_buffer_size),
            received: Vec::new(),
            stats: ChannelStats::default(),
            time: now,
            last_send: None,
        })
    }

    /// Underlying packet controller
    pub fn controller(&self) -> &PacketController {
        &self.controller
    }

    pub fn send_message(&mut self, data: &[u8]) -> CoreResult<()> {
        self.controller
            .send_packet(data, QosType::Unreliable.channel_id())?;
        self.stats.messages_sent += 1;
        self.stats.bytes_sent += data.len() as u64;
        self.last_send = Some(self.time);
        Ok(())
    }

    pub fn receive_packet(&mut self, data: Bytes) -> CoreResult<()> {
        self.controller.receive_packet(data)?;

        for (sequence, payload) in self.controller.drain_received() {
            if self.receive_buffer.exists(sequence) {
                trace!(sequence, "duplicate unreliable packet");
                continue;
            }
            if self.receive_buffer.insert(sequence).is_none() {
                continue;
            }
            self.stats.messages_received += 1;
            self.stats.bytes_received += payload.len() as u64;
            self.received.push(payload);
        }

        // nothing to retire, acks only feed the controller's estimates
        self.controller.clear_acks();
        Ok(())
    }

    pub fn update(&mut self, now: f64) {
        self.time = now;
        self.controller.update(now);
    }

    pub fn drain_output(&mut self) -> Vec<Bytes> {
        self.controller.drain_output()
    }

    pub fn drain_received(&mut self) -> Vec<Bytes> {
        std::mem::take(&mut self.received)
    }

    pub fn reset(&mut self) {
        self.controller.reset();
        self.receive_buffer.reset();
        self.received.clear();
        self.last_send = None;
    }

    pub fn stats(&self) -> ChannelStats {
        self.stats
    }

    /// Seconds since the last send, `None` before the first
    pub fn time_since_last_send(&self) -> Option<f64> {
        self.last_send.map(|at| self.time - at)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn channel() -> UnreliableChannel {
        UnreliableChannel::new(ReliableConfig::default(), &ChannelConfig::default(), 0.0).unwrap()
    }

    #[test]
    fn test_duplicates_delivered_once() {
        let mut a = channel();
        let mut b = channel();

        a.send_message(b"one").unwrap();
        a.send_message(b"two").unwrap();
        let packets = a.drain_output();
        for packet in packets.iter().chain(packets.iter()) {
            b.receive_packet(packet.clone()).unwrap();
        }

        let received = b.drain_received();
        assert_eq!(received, vec![Bytes::from_static(b"one"), Bytes::from_static(b"two")]);
        assert_eq!(b.stats().messages_received, 2);
    }

    #[test]
    fn test_large_message_fragments() {
        let mut a = channel();
        let mut b = channel();
        let payload = vec![7u8; 3000];

        a.send_message(&payload).unwrap();
        for packet in a.drain_output() {
            b.receive_packet(packet).unwrap();
        }
        assert_eq!(b.drain_received(), vec![Bytes::from(payload)]);
    }
}
