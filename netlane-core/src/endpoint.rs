//! Reliable endpoint: one reliable and one unreliable channel over one link

use bytes::Bytes;
use tracing::trace;

use crate::channel::{MessageChannel, QosType, ReliableChannel, UnreliableChannel};
use crate::config::{ChannelConfig, ReliableConfig};
use crate::error::{CoreError, CoreResult};
use crate::protocol::peek_channel;
use crate::telemetry::EndpointTelemetry;

/// Message delivered by an endpoint
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceivedMessage {
    pub qos: QosType,
    pub payload: Bytes,
}

/// Multiplexes the message channels over a single packet stream.
///
/// Inbound packets are routed by the channel byte at offset 1. Outbound
/// packets from both channels are collected by [`drain_output`](Self::drain_output)
/// and must be delivered to the peer's [`receive_packet`](Self::receive_packet).
///
/// ```text
///  send_message(qos) ──► channel[qos] ──► controller ──► drain_output()
///  receive_packet()  ──► channel[byte 1] ──► drain_received()
/// ```
pub struct ReliableEndpoint {
    channels: [MessageChannel; 2],
    time: f64,
}

impl ReliableEndpoint {
    /// Create an endpoint; `now` is the caller's clock in seconds
    pub fn new(reliable: ReliableConfig, channel: ChannelConfig, now: f64) -> CoreResult<Self> {
        let base = reliable.name.clone();
        let reliable_channel = ReliableChannel::new(
            reliable.clone().name(format!("{base}/reliable")),
            channel.clone(),
            now,
        )?;
        let unreliable_channel =
            UnreliableChannel::new(reliable.name(format!("{base}/unreliable")), &channel, now)?;

        Ok(Self {
            channels: [
                MessageChannel::Reliable(reliable_channel),
                MessageChannel::Unreliable(unreliable_channel),
            ],
            time: now,
        })
    }

    /// Create an endpoint with default configuration
    pub fn with_defaults(now: f64) -> CoreResult<Self> {
        Self::new(ReliableConfig::default(), ChannelConfig::default(), now)
    }

    /// Last time passed to `update`
    pub fn time(&self) -> f64 {
        self.time
    }

    fn channel_mut(&mut self, qos: QosType) -> &mut MessageChannel {
        match qos {
            QosType::Reliable => &mut self.channels[0],
            QosType::Unreliable => &mut self.channels[1],
        }
    }

    /// Queue a message on the given channel
    pub fn send_message(&mut self, qos: QosType, data: &[u8]) -> CoreResult<()> {
        self.channel_mut(qos).send_message(data)
    }

    /// Route an inbound packet to its channel
    pub fn receive_packet(&mut self, data: Bytes) -> CoreResult<()> {
        let qos = peek_channel(&data)
            .and_then(QosType::from_channel_id)
            .ok_or_else(|| CoreError::protocol("packet for unknown channel"))?;
        self.channel_mut(qos).receive_packet(data).inspect_err(|e| {
            trace!(channel = ?qos, error = %e, "dropped inbound packet");
        })
    }

    /// Advance every channel's clock
    pub fn update(&mut self, now: f64) {
        self.time = now;
        for channel in self.channels.iter_mut() {
            channel.update(now);
        }
    }

    /// Flush channels whose send timers have fired
    pub fn process_send_buffer(&mut self) -> CoreResult<()> {
        for channel in self.channels.iter_mut() {
            channel.process_send_buffer()?;
        }
        Ok(())
    }

    /// Take packets for the transport
    pub fn drain_output(&mut self) -> Vec<Bytes> {
        let mut output = Vec::new();
        for channel in self.channels.iter_mut() {
            output.extend(channel.drain_output());
        }
        output
    }

    /// Take messages delivered since the last call
    pub fn drain_received(&mut self) -> Vec<ReceivedMessage> {
        let mut received = Vec::new();
        for channel in self.channels.iter_mut() {
            let qos = channel.qos();
            received.extend(
                channel
                    .drain_received()
                    .into_iter()
                    .map(|payload| ReceivedMessage { qos, payload }),
            );
        }
        received
    }

    /// Smoothed RTT of the reliable channel
    pub fn rtt_ms(&self) -> f32 {
        self.channels
            .iter()
            .find_map(|channel| match channel {
                MessageChannel::Reliable(reliable) => Some(reliable.controller().rtt_ms()),
                MessageChannel::Unreliable(_) => None,
            })
            .unwrap_or_default()
    }

    /// Drop all channel state, used when the underlying connection changes
    pub fn reset(&mut self) {
        for channel in self.channels.iter_mut() {
            channel.reset();
        }
    }

    pub fn telemetry(&self) -> EndpointTelemetry {
        let mut telemetry = EndpointTelemetry::default();
        for channel in &self.channels {
            let stats = channel.stats();
            match channel {
                MessageChannel::Reliable(reliable) => {
                    let controller = reliable.controller();
                    telemetry.reliable_messages_queued = reliable.queued_messages();
                    telemetry.reliable_bytes_sent = stats.bytes_sent;
                    telemetry.reliable_bytes_received = stats.bytes_received;
                    telemetry.reliable_rtt_ms = controller.rtt_ms();
                    telemetry.is_congestion_control_active = reliable.is_congested();
                    telemetry.reliable_messages_dropped = stats.messages_dropped;
                    telemetry.time_since_last_reliable_send =
                        reliable.time_since_last_send().unwrap_or(-1.0);
                    telemetry.packet_loss = controller.packet_loss();
                    telemetry.sent_bandwidth_kbps = controller.sent_bandwidth_kbps();
                    telemetry.received_bandwidth_kbps = controller.received_bandwidth_kbps();
                }
                MessageChannel::Unreliable(unreliable) => {
                    telemetry.unreliable_messages_queued = unreliable.controller().pending_output();
                    telemetry.unreliable_bytes_sent = stats.bytes_sent;
                    telemetry.unreliable_bytes_received = stats.bytes_received;
                    telemetry.unreliable_estimated_latency_ms = unreliable.controller().rtt_ms() / 2.0;
                    telemetry.unreliable_messages_dropped = stats.messages_dropped;
                    telemetry.time_since_last_unreliable_send =
                        unreliable.time_since_last_send().unwrap_or(-1.0);
                }
            }
        }
        telemetry
    }

    /// Per-channel usage summary, one line per channel
    pub fn usage_statistics(&self) -> String {
        self.channels
            .iter()
            .map(MessageChannel::usage_statistics)
            .collect::<Vec<_>>()
            .join("\n")
    }
}
