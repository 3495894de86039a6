//! Per-actor traffic counters

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// Counters shared between an actor and its handles
#[derive(Debug, Default)]
pub struct LinkMetrics {
    pub packets_sent: AtomicU64,
    pub packets_received: AtomicU64,
    pub bytes_sent: AtomicU64,
    pub bytes_received: AtomicU64,
    /// Transport send failures
    pub send_errors: AtomicU64,
    /// Inbound datagrams dropped because the queue was full
    pub datagrams_dropped: AtomicU64,
    pub messages_sent: AtomicU64,
    pub messages_received: AtomicU64,
    /// Events dropped because the application stopped reading
    pub events_dropped: AtomicU64,
    pub connections_opened: AtomicU64,
    pub connections_closed: AtomicU64,
}

impl LinkMetrics {
    pub fn record_sent(&self, bytes: usize) {
        self.packets_sent.fetch_add(1, Ordering::Relaxed);
        self.bytes_sent.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub fn record_received(&self, bytes: usize) {
        self.packets_received.fetch_add(1, Ordering::Relaxed);
        self.bytes_received.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub fn record_send_error(&self) {
        self.send_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_datagram_dropped(&self) {
        self.datagrams_dropped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_message_sent(&self) {
        self.messages_sent.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_message_received(&self) {
        self.messages_received.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_event_dropped(&self) {
        self.events_dropped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn connection_opened(&self) {
        self.connections_opened.fetch_add(1, Ordering::Relaxed);
    }

    pub fn connection_closed(&self) {
        self.connections_closed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            packets_sent: self.packets_sent.load(Ordering::Relaxed),
            packets_received: self.packets_received.load(Ordering::Relaxed),
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
            bytes_received: self.bytes_received.load(Ordering::Relaxed),
            send_errors: self.send_errors.load(Ordering::Relaxed),
            datagrams_dropped: self.datagrams_dropped.load(Ordering::Relaxed),
            messages_sent: self.messages_sent.load(Ordering::Relaxed),
            messages_received: self.messages_received.load(Ordering::Relaxed),
            events_dropped: self.events_dropped.load(Ordering::Relaxed),
            connections_opened: self.connections_opened.load(Ordering::Relaxed),
            connections_closed: self.connections_closed.load(Ordering::Relaxed),
        }
    }
}

/// Snapshot of metrics at a point in time
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub packets_sent: u64,
    pub packets_received: u64,
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub send_errors: u64,
    pub datagrams_dropped: u64,
    pub messages_sent: u64,
    pub messages_received: u64,
    pub events_dropped: u64,
    pub connections_opened: u64,
    pub connections_closed: u64,
}

impl MetricsSnapshot {
    pub fn active_connections(&self) -> u64 {
        self.connections_opened.saturating_sub(self.connections_closed)
    }

    /// Share of inbound datagrams lost to a full queue
    pub fn drop_rate(&self) -> f64 {
        let arrived = self.packets_received;
        if arrived == 0 {
            0.0
        } else {
            self.datagrams_dropped as f64 / arrived as f64
        }
    }

    /// Total throughput in bytes per second
    pub fn throughput_bps(&self, duration: Duration) -> f64 {
        let total_bytes = self.bytes_sent + self.bytes_received;
        total_bytes as f64 / duration.as_secs_f64()
    }
}

/// Format metrics for human-readable display
pub fn format_metrics(snapshot: &MetricsSnapshot) -> String {
    format!(
        "netlane metrics:\n\
         Connections: {} opened, {} active\n\
         Traffic: {} bytes sent, {} bytes received\n\
         Packets: {} sent, {} received, {} send errors\n\
         Messages: {} sent, {} received\n\
         Dropped: {} datagrams ({:.2}%), {} events",
        snapshot.connections_opened,
        snapshot.active_connections(),
        snapshot.bytes_sent,
        snapshot.bytes_received,
        snapshot.packets_sent,
        snapshot.packets_received,
        snapshot.send_errors,
        snapshot.messages_sent,
        snapshot.messages_received,
        snapshot.datagrams_dropped,
        snapshot.drop_rate() * 100.0,
        snapshot.events_dropped,
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_link_metrics() {
        let metrics = LinkMetrics::default();
        metrics.connection_opened();
        metrics.record_sent(100);
        metrics.record_received(40);
        metrics.record_received(60);
        metrics.record_datagram_dropped();

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.active_connections(), 1);
        assert_eq!(snapshot.bytes_sent, 100);
        assert_eq!(snapshot.packets_received, 2);
        assert_eq!(snapshot.drop_rate(), 0.5);

        metrics.connection_closed();
        assert_eq!(metrics.snapshot().active_connections(), 0);
    }

    #[test]
    fn test_format_metrics() {
        let text = format_metrics(&MetricsSnapshot {
            bytes_sent: 10,
            ..MetricsSnapshot::default()
        });
        assert!(text.contains("10 bytes sent"));
        assert!(text.contains("0.00%"));
    }
}
