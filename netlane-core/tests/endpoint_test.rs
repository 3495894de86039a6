//! Core-only integration tests: channels over lossy, reordering and
//! delayed links, driven with synthetic time.

use std::collections::VecDeque;

use bytes::Bytes;
use netlane_core::{
    ChannelConfig, CoreError, QosType, ReceivedMessage, ReliableChannel, ReliableConfig, ReliableEndpoint,
};
use rand::seq::SliceRandom;
use rand::Rng;

const TICK: f64 = 1.0 / 60.0;

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Advance an endpoint and collect what it wants to send.
fn step(endpoint: &mut ReliableEndpoint, now: f64) -> Vec<Bytes> {
    endpoint.update(now);
    endpoint.process_send_buffer().unwrap();
    endpoint.drain_output()
}

/// Deliver packets, dropping each with probability `loss_rate` and
/// optionally shuffling them first.
fn deliver(mut packets: Vec<Bytes>, dst: &mut ReliableEndpoint, loss_rate: f32, reorder: bool) {
    let mut rng = rand::thread_rng();
    if reorder {
        packets.shuffle(&mut rng);
    }
    for packet in packets {
        if rng.gen::<f32>() >= loss_rate {
            let _ = dst.receive_packet(packet);
        }
    }
}

/// Run both endpoints for `seconds`, collecting everything `b` receives.
fn run(
    a: &mut ReliableEndpoint,
    b: &mut ReliableEndpoint,
    start: f64,
    seconds: f64,
    loss_rate: f32,
    reorder: bool,
) -> (f64, Vec<ReceivedMessage>) {
    let mut now = start;
    let mut received = Vec::new();
    while now < start + seconds {
        now += TICK;
        let out = step(a, now);
        deliver(out, b, loss_rate, reorder);
        let back = step(b, now);
        deliver(back, a, loss_rate, reorder);
        received.extend(b.drain_received());
    }
    (now, received)
}

fn payloads(received: &[ReceivedMessage], qos: QosType) -> Vec<Bytes> {
    received
        .iter()
        .filter(|message| message.qos == qos)
        .map(|message| message.payload.clone())
        .collect()
}

/// FIFO pipe that releases packets `latency` seconds after they enter.
struct DelayedPipe {
    latency: f64,
    in_flight: VecDeque<(f64, Bytes)>,
}

impl DelayedPipe {
    fn new(latency: f64) -> Self {
        Self {
            latency,
            in_flight: VecDeque::new(),
        }
    }

    fn push(&mut self, now: f64, packets: Vec<Bytes>) {
        for packet in packets {
            self.in_flight.push_back((now + self.latency, packet));
        }
    }

    fn release(&mut self, now: f64) -> Vec<Bytes> {
        let mut ready = Vec::new();
        while let Some((due, _)) = self.in_flight.front() {
            if *due > now {
                break;
            }
            if let Some((_, packet)) = self.in_flight.pop_front() {
                ready.push(packet);
            }
        }
        ready
    }
}

// ---------------------------------------------------------------------------
// Reliable ordering
// ---------------------------------------------------------------------------

#[test]
fn test_reliable_ordering_under_loss_and_reorder() {
    let mut a = ReliableEndpoint::with_defaults(0.0).unwrap();
    let mut b = ReliableEndpoint::with_defaults(0.0).unwrap();

    let sent: Vec<Bytes> = (0..500u32)
        .map(|i| Bytes::from(format!("message-{i:04}-{}", "x".repeat((i % 90) as usize))))
        .collect();
    for message in &sent {
        a.send_message(QosType::Reliable, message).unwrap();
    }

    let (_, received) = run(&mut a, &mut b, 0.0, 20.0, 0.2, true);
    assert_eq!(payloads(&received, QosType::Reliable), sent);

    let telemetry = a.telemetry();
    assert_eq!(telemetry.reliable_messages_queued, 0);
    assert!(telemetry.reliable_rtt_ms > 0.0);
}

#[test]
fn test_reliable_large_messages_under_loss() {
    let mut a = ReliableEndpoint::with_defaults(0.0).unwrap();
    let mut b = ReliableEndpoint::with_defaults(0.0).unwrap();

    let sent: Vec<Bytes> = (0..5u8).map(|i| Bytes::from(vec![i; 5000])).collect();
    for message in &sent {
        a.send_message(QosType::Reliable, message).unwrap();
    }

    let (_, received) = run(&mut a, &mut b, 0.0, 30.0, 0.1, false);
    assert_eq!(payloads(&received, QosType::Reliable), sent);
}

#[test]
fn test_ack_retires_everything_without_loss() {
    let mut a = ReliableEndpoint::with_defaults(0.0).unwrap();
    let mut b = ReliableEndpoint::with_defaults(0.0).unwrap();

    for i in 0..100u8 {
        a.send_message(QosType::Reliable, &[i; 32]).unwrap();
    }
    let (now, received) = run(&mut a, &mut b, 0.0, 2.0, 0.0, false);
    assert_eq!(received.len(), 100);

    // once everything is acked the sender only emits ack-only packets
    let out = step(&mut a, now + 0.2);
    assert!(out.iter().all(|packet| packet[0] == 0x80));
}

// ---------------------------------------------------------------------------
// Unreliable + fragmentation
// ---------------------------------------------------------------------------

#[test]
fn test_fragmented_message_any_order_with_duplicate() {
    let mut a = ReliableEndpoint::with_defaults(0.0).unwrap();
    let mut b = ReliableEndpoint::with_defaults(0.0).unwrap();

    let payload: Vec<u8> = (0..10_000u32).map(|i| (i * 7) as u8).collect();
    a.send_message(QosType::Unreliable, &payload).unwrap();

    let mut fragments = a.drain_output();
    assert_eq!(fragments.len(), 10);
    let duplicate = fragments[3].clone();
    fragments.push(duplicate);
    fragments.shuffle(&mut rand::thread_rng());

    for fragment in fragments {
        let _ = b.receive_packet(fragment);
    }

    let received = b.drain_received();
    assert_eq!(received.len(), 1);
    assert_eq!(received[0].qos, QosType::Unreliable);
    assert_eq!(&received[0].payload[..], &payload[..]);
}

#[test]
fn test_unreliable_loss_is_not_retransmitted() {
    let mut a = ReliableEndpoint::with_defaults(0.0).unwrap();
    let mut b = ReliableEndpoint::with_defaults(0.0).unwrap();

    a.send_message(QosType::Unreliable, b"dropped").unwrap();
    a.drain_output();
    a.send_message(QosType::Unreliable, b"kept").unwrap();

    let (_, received) = run(&mut a, &mut b, 0.0, 1.0, 0.0, false);
    assert_eq!(payloads(&received, QosType::Unreliable), vec![Bytes::from_static(b"kept")]);
}

#[test]
fn test_threshold_below_header_rejected() {
    let tiny = ReliableConfig::default().fragmentation(5, 1024, 16);
    assert!(matches!(
        ReliableEndpoint::new(tiny, ChannelConfig::default(), 0.0),
        Err(CoreError::Config { .. })
    ));
}

#[test]
fn test_smallest_threshold_sends_one_message_per_packet() {
    let config = ReliableConfig::default().fragmentation(11, 1024, 16);
    let mut a = ReliableEndpoint::new(config.clone(), ChannelConfig::default(), 0.0).unwrap();
    let mut b = ReliableEndpoint::new(config, ChannelConfig::default(), 0.0).unwrap();

    let sent: Vec<Bytes> = (0..10u8).map(|i| Bytes::from(vec![i])).collect();
    for message in &sent {
        a.send_message(QosType::Reliable, message).unwrap();
    }
    let (_, received) = run(&mut a, &mut b, 0.0, 1.0, 0.0, false);
    assert_eq!(payloads(&received, QosType::Reliable), sent);
}

// ---------------------------------------------------------------------------
// Backpressure
// ---------------------------------------------------------------------------

#[test]
fn test_backpressure_then_drain() {
    let channel = ChannelConfig::default().reliable_buffer_size(8).max_queue_size(4);
    let mut a = ReliableEndpoint::new(ReliableConfig::default(), channel.clone(), 0.0).unwrap();
    let mut b = ReliableEndpoint::new(ReliableConfig::default(), channel, 0.0).unwrap();

    for i in 0..12u8 {
        a.send_message(QosType::Reliable, &[i]).unwrap();
    }
    assert_eq!(a.telemetry().reliable_messages_queued, 4);

    let err = a.send_message(QosType::Reliable, &[99; 10]).unwrap_err();
    assert!(err.is_backpressure());
    assert_eq!(
        err,
        CoreError::QueueExhausted {
            current_depth: 4,
            max_queue_size: 4,
            dropped_message_size: 10,
            channel_id: 0,
        }
    );
    assert_eq!(a.telemetry().reliable_messages_dropped, 1);

    let (_, received) = run(&mut a, &mut b, 0.0, 3.0, 0.0, false);
    let expected: Vec<Bytes> = (0..12u8).map(|i| Bytes::from(vec![i])).collect();
    assert_eq!(payloads(&received, QosType::Reliable), expected);
    assert_eq!(a.telemetry().reliable_messages_queued, 0);

    // room again after the drain
    a.send_message(QosType::Reliable, b"again").unwrap();
}

// ---------------------------------------------------------------------------
// Congestion hysteresis
// ---------------------------------------------------------------------------

/// Two reliable channels joined by delayed pipes, both sending every tick.
struct CongestionHarness {
    a: ReliableChannel,
    b: ReliableChannel,
    a_to_b: DelayedPipe,
    b_to_a: DelayedPipe,
    now: f64,
}

impl CongestionHarness {
    fn new(latency: f64) -> Self {
        Self {
            a: ReliableChannel::new(ReliableConfig::default(), ChannelConfig::default(), 0.0).unwrap(),
            b: ReliableChannel::new(ReliableConfig::default(), ChannelConfig::default(), 0.0).unwrap(),
            a_to_b: DelayedPipe::new(latency),
            b_to_a: DelayedPipe::new(latency),
            now: 0.0,
        }
    }

    fn set_latency(&mut self, latency: f64) {
        self.a_to_b.latency = latency;
        self.b_to_a.latency = latency;
    }

    fn run_until(&mut self, until: f64) {
        while self.now < until {
            self.now += TICK;
            let now = self.now;

            self.a.send_message(b"tick").unwrap();
            self.b.send_message(b"tock").unwrap();
            self.a.update(now);
            self.b.update(now);
            self.a.process_send_buffer().unwrap();
            self.b.process_send_buffer().unwrap();
            self.a_to_b.push(now, self.a.drain_output());
            self.b_to_a.push(now, self.b.drain_output());

            for packet in self.a_to_b.release(now) {
                let _ = self.b.receive_packet(packet);
            }
            for packet in self.b_to_a.release(now) {
                let _ = self.a.receive_packet(packet);
            }
            self.a.drain_received();
            self.b.drain_received();
        }
    }
}

#[test]
fn test_congestion_hysteresis() {
    let mut harness = CongestionHarness::new(0.2);

    // 400 ms round trips: congestion mode on, interval untouched
    harness.run_until(3.0);
    assert!(harness.a.is_congested());
    assert!(harness.a.controller().rtt_ms() >= 250.0);
    assert_eq!(harness.a.congestion_disable_interval(), 5.0);

    // fast link: off again after 5 s of good conditions
    harness.set_latency(0.01);
    harness.run_until(12.0);
    assert!(!harness.a.is_congested());
    assert!(harness.a.controller().rtt_ms() < 250.0);

    // bad again within 10 s of the last switch: disable interval doubles
    harness.set_latency(0.2);
    harness.run_until(14.0);
    assert!(harness.a.is_congested());
    assert_eq!(harness.a.congestion_disable_interval(), 10.0);
}
