//! Point-in-time view of an endpoint's channels

use std::fmt;

/// Snapshot taken by [`ReliableEndpoint::telemetry`](crate::ReliableEndpoint::telemetry)
#[derive(Debug, Default, Clone, Copy, PartialEq)]
pub struct EndpointTelemetry {
    /// Messages waiting in the reliable overflow queue
    pub reliable_messages_queued: usize,
    /// Unreliable packets built but not yet handed to the transport
    pub unreliable_messages_queued: usize,
    pub reliable_bytes_sent: u64,
    pub unreliable_bytes_sent: u64,
    pub reliable_bytes_received: u64,
    pub unreliable_bytes_received: u64,
    pub reliable_rtt_ms: f32,
    /// Half the unreliable controller's RTT
    pub unreliable_estimated_latency_ms: f32,
    pub is_congestion_control_active: bool,
    pub reliable_messages_dropped: u64,
    pub unreliable_messages_dropped: u64,
    /// Seconds since the last reliable send, negative before the first
    pub time_since_last_reliable_send: f64,
    /// Seconds since the last unreliable send, negative before the first
    pub time_since_last_unreliable_send: f64,
    /// 0..=1, only maintained when estimators are enabled
    pub packet_loss: f32,
    pub sent_bandwidth_kbps: f32,
    pub received_bandwidth_kbps: f32,
}

impl fmt::Display for EndpointTelemetry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[Telemetry] R_Queued:{} U_Queued:{} R_RTT:{:.1}ms U_Latency:{:.1}ms Congestion:{} \
             PacketLoss:{:.1}% SendBW:{:.1}KB/s RecvBW:{:.1}KB/s",
            self.reliable_messages_queued,
            self.unreliable_messages_queued,
            self.reliable_rtt_ms,
            self.unreliable_estimated_latency_ms,
            self.is_congestion_control_active,
            self.packet_loss * 100.0,
            self.sent_bandwidth_kbps,
            self.received_bandwidth_kbps,
        )
    }
}
