//! Packet controller: sequencing, acks, fragmentation and link estimates

use bytes::{BufMut, Bytes, BytesMut};
use tracing::trace;

use crate::config::ReliableConfig;
use crate::error::{CoreError, CoreResult};
use crate::protocol::{
    constants, AckHeader, ControllerStats, FragmentHeader, PacketHeader, Sequence, WirePacket,
};
use crate::sequence_buffer::SequenceBuffer;

#[derive(Debug, Default, Clone, Copy)]
struct SentPacketData {
    time: f64,
    bytes: usize,
    acked: bool,
}

#[derive(Debug, Default, Clone, Copy)]
struct ReceivedPacketData {
    time: f64,
    bytes: usize,
}

#[derive(Debug, Default)]
struct FragmentReassembly {
    num_fragments_total: usize,
    num_fragments_received: usize,
    header: Option<PacketHeader>,
    fragments: Vec<Option<Bytes>>,
}

/// Sequenced packet layer under a message channel.
///
/// Sans-IO: outbound packets collect in an internal queue read through
/// [`drain_output`](Self::drain_output); delivered payloads and acked
/// sequences are read through [`drain_received`](Self::drain_received) and
/// [`drain_acked`](Self::drain_acked).
pub struct PacketController {
    config: ReliableConfig,
    time: f64,

    rtt_ms: f32,
    packet_loss: f32,
    sent_bandwidth_kbps: f32,
    received_bandwidth_kbps: f32,
    acked_bandwidth_kbps: f32,

    sequence: Sequence,
    sent_packets: SequenceBuffer<SentPacketData>,
    received_packets: SequenceBuffer<ReceivedPacketData>,
    fragment_reassembly: SequenceBuffer<FragmentReassembly>,

    output: Vec<Bytes>,
    received: Vec<(Sequence, Bytes)>,
    acked: Vec<Sequence>,
    stats: ControllerStats,
}

impl PacketController {
    /// Create a controller; `now` is the caller's clock in seconds
    pub fn new(config: ReliableConfig, now: f64) -> CoreResult<Self> {
        config.validate()?;
        Ok(Self {
            time: now,
            rtt_ms: 0.0,
            packet_loss: 0.0,
            sent_bandwidth_kbps: 0.0,
            received_bandwidth_kbps: 0.0,
            acked_bandwidth_kbps: 0.0,
            sequence: 0,
            sent_packets: SequenceBuffer::new(config.sent_packet_buffer_size),
            received_packets: SequenceBuffer::new(config.received_packet_buffer_size),
            fragment_reassembly: SequenceBuffer::new(config.fragment_reassembly_buffer_size),
            output: Vec::new(),
            received: Vec::new(),
            acked: Vec::new(),
            stats: ControllerStats::default(),
            config,
        })
    }

    /// Get configuration
    pub fn config(&self) -> &ReliableConfig {
        &self.config
    }

    /// Sequence the next `send_packet` call will use
    pub fn next_packet_sequence(&self) -> Sequence {
        self.sequence
    }

    /// Smoothed round trip time
    pub fn rtt_ms(&self) -> f32 {
        self.rtt_ms
    }

    /// Smoothed fraction of sent packets not acked, 0..=1
    pub fn packet_loss(&self) -> f32 {
        self.packet_loss
    }

    pub fn sent_bandwidth_kbps(&self) -> f32 {
        self.sent_bandwidth_kbps
    }

    pub fn received_bandwidth_kbps(&self) -> f32 {
        self.received_bandwidth_kbps
    }

    pub fn acked_bandwidth_kbps(&self) -> f32 {
        self.acked_bandwidth_kbps
    }

    /// Get counters
    pub fn stats(&self) -> ControllerStats {
        self.stats
    }

    /// Forget all sequencing state and pending output
    pub fn reset(&mut self) {
        self.sequence = 0;
        self.rtt_ms = 0.0;
        self.packet_loss = 0.0;
        self.sent_bandwidth_kbps = 0.0;
        self.received_bandwidth_kbps = 0.0;
        self.acked_bandwidth_kbps = 0.0;
        self.sent_packets.reset();
        self.received_packets.reset();
        self.fragment_reassembly.reset();
        self.output.clear();
        self.received.clear();
        self.acked.clear();
    }

    /// Advance the clock and refresh estimators
    pub fn update(&mut self, now: f64) {
        self.time = now;
        if self.config.enable_estimators {
            self.estimate_packet_loss();
            self.estimate_sent_bandwidth();
            self.estimate_received_bandwidth();
            self.estimate_acked_bandwidth();
        }
    }

    /// Queue a payload, fragmenting above the threshold. Returns its sequence.
    pub fn send_packet(&mut self, payload: &[u8], channel: u8) -> CoreResult<Sequence> {
        if payload.len() > self.config.max_packet_size {
            return Err(CoreError::buffer(format!(
                "packet of {} bytes exceeds max packet size {}",
                payload.len(),
                self.config.max_packet_size
            )));
        }

        let sequence = self.sequence;
        self.sequence = self.sequence.wrapping_add(1);

        let (ack, ack_bits) = self.received_packets.generate_ack_bits();
        let header = PacketHeader {
            channel,
            sequence,
            ack,
            ack_bits,
        };

        if let Some(sent) = self.sent_packets.insert(sequence) {
            sent.time = self.time;
            sent.bytes = self.config.packet_header_size + payload.len();
            sent.acked = false;
        }

        if payload.len() <= self.config.fragment_threshold {
            let mut buf = BytesMut::with_capacity(constants::MAX_PACKET_HEADER_BYTES + payload.len());
            header.encode(&mut buf);
            buf.put_slice(payload);
            self.push_output(buf.freeze());
            return Ok(sequence);
        }

        let fragment_size = self.config.fragment_size;
        let num_fragments = payload.len().div_ceil(fragment_size);
        for (fragment_id, chunk) in payload.chunks(fragment_size).enumerate() {
            let mut buf = BytesMut::with_capacity(
                constants::FRAGMENT_HEADER_BYTES + constants::MAX_PACKET_HEADER_BYTES + chunk.len(),
            );
            FragmentHeader {
                channel,
                sequence,
                fragment_id: fragment_id as u8,
                num_fragments: num_fragments as u16,
            }
            .encode(&mut buf);
            if fragment_id == 0 {
                header.encode(&mut buf);
            }
            buf.put_slice(chunk);
            self.stats.fragments_sent += 1;
            self.push_output(buf.freeze());
        }

        trace!(sequence, num_fragments, channel, "fragmented packet");
        Ok(sequence)
    }

    /// Queue an ack-only packet for the current receive window
    pub fn send_ack(&mut self, channel: u8) {
        let (ack, ack_bits) = self.received_packets.generate_ack_bits();
        let mut buf = BytesMut::with_capacity(constants::ACK_PACKET_BYTES);
        AckHeader {
            channel,
            ack,
            ack_bits,
        }
        .encode(&mut buf);
        self.push_output(buf.freeze());
    }

    /// Process one inbound packet.
    ///
    /// Stale packets are ignored silently; malformed ones return a protocol
    /// error the caller is expected to drop.
    pub fn receive_packet(&mut self, data: Bytes) -> CoreResult<()> {
        if data.len() > self.config.max_packet_size + constants::FRAGMENT_HEADER_BYTES + constants::MAX_PACKET_HEADER_BYTES {
            self.stats.packets_invalid += 1;
            return Err(CoreError::protocol("packet exceeds max packet size"));
        }

        let wire_len = data.len();
        let Some(packet) = WirePacket::decode(data) else {
            self.stats.packets_invalid += 1;
            return Err(CoreError::protocol("malformed packet header"));
        };

        self.stats.packets_received += 1;
        self.stats.bytes_received += wire_len as u64;

        match packet {
            WirePacket::Regular { header, payload } => {
                self.receive_regular(header, Some(payload), wire_len);
                Ok(())
            }
            WirePacket::AckOnly(ack) => {
                self.process_acks(ack.ack, ack.ack_bits);
                Ok(())
            }
            WirePacket::Fragment { header, data } => self.receive_fragment(header, data),
        }
    }

    /// Take packets waiting to be transmitted
    pub fn drain_output(&mut self) -> Vec<Bytes> {
        std::mem::take(&mut self.output)
    }

    /// Packets waiting in the output queue
    pub fn pending_output(&self) -> usize {
        self.output.len()
    }

    /// Take delivered `(sequence, payload)` pairs
    pub fn drain_received(&mut self) -> Vec<(Sequence, Bytes)> {
        std::mem::take(&mut self.received)
    }

    /// Take sequences newly acked by the peer
    pub fn drain_acked(&mut self) -> Vec<Sequence> {
        std::mem::take(&mut self.acked)
    }

    /// Forget pending acks for callers that keep no per-packet state
    pub fn clear_acks(&mut self) {
        self.acked.clear();
    }

    /// One-line summary of the packet windows
    pub fn usage_statistics(&self) -> String {
        let in_flight = (0..self.sent_packets.capacity() as u16)
            .map(|offset| self.sequence.wrapping_sub(offset + 1))
            .filter(|seq| self.sent_packets.find(*seq).is_some_and(|sent| !sent.acked))
            .count();
        let reassembling = (0..self.fragment_reassembly.capacity())
            .filter(|index| self.fragment_reassembly.at_index(*index).is_some())
            .count();
        format!(
            "[{}] next_seq:{} in_flight:{}/{} reassembling:{} rtt:{:.1}ms loss:{:.1}% \
             sent:{:.1}kbps recv:{:.1}kbps acked:{:.1}kbps",
            self.config.name,
            self.sequence,
            in_flight,
            self.sent_packets.capacity(),
            reassembling,
            self.rtt_ms,
            self.packet_loss * 100.0,
            self.sent_bandwidth_kbps,
            self.received_bandwidth_kbps,
            self.acked_bandwidth_kbps,
        )
    }

    fn push_output(&mut self, packet: Bytes) {
        self.stats.packets_sent += 1;
        self.stats.bytes_sent += packet.len() as u64;
        self.output.push(packet);
    }

    fn receive_regular(&mut self, header: PacketHeader, payload: Option<Bytes>, wire_len: usize) {
        if !self.received_packets.test_insert(header.sequence) {
            self.stats.packets_stale += 1;
            trace!(sequence = header.sequence, "stale packet ignored");
            return;
        }

        if let Some(payload) = payload {
            self.received.push((header.sequence, payload));
            if let Some(entry) = self.received_packets.insert(header.sequence) {
                entry.time = self.time;
                entry.bytes = self.config.packet_header_size + wire_len;
            }
        }

        self.process_acks(header.ack, header.ack_bits);
    }

    fn process_acks(&mut self, ack: Sequence, ack_bits: u32) {
        for i in 0..constants::ACK_BITS {
            if ack_bits & (1 << i) == 0 {
                continue;
            }

            let sequence = ack.wrapping_sub(i);
            let Some(sent) = self.sent_packets.find_mut(sequence) else {
                continue;
            };
            if sent.acked {
                continue;
            }

            sent.acked = true;
            let sample = ((self.time - sent.time) * 1000.0) as f32;
            self.acked.push(sequence);
            self.stats.packets_acked += 1;

            if (self.rtt_ms == 0.0 && sample > 0.0) || (self.rtt_ms - sample).abs() < 0.00001 {
                self.rtt_ms = sample;
            } else {
                self.rtt_ms += (sample - self.rtt_ms) * self.config.rtt_smoothing_factor;
            }
        }
    }

    fn receive_fragment(&mut self, header: FragmentHeader, mut data: Bytes) -> CoreResult<()> {
        let num_fragments = header.num_fragments as usize;
        if num_fragments > self.config.max_fragments {
            self.stats.packets_invalid += 1;
            return Err(CoreError::protocol(format!(
                "fragment count {num_fragments} exceeds max {}",
                self.config.max_fragments
            )));
        }
        if header.fragment_id as usize >= num_fragments {
            self.stats.packets_invalid += 1;
            return Err(CoreError::protocol("fragment id out of range"));
        }

        let embedded = if header.fragment_id == 0 {
            match PacketHeader::decode(&mut data) {
                Some(regular) if regular.sequence == header.sequence && regular.channel == header.channel => {
                    Some(regular)
                }
                _ => {
                    self.stats.packets_invalid += 1;
                    return Err(CoreError::protocol("fragment 0 carries a bad packet header"));
                }
            }
        } else {
            None
        };

        let is_last = header.fragment_id as usize == num_fragments - 1;
        if data.len() > self.config.fragment_size || (!is_last && data.len() != self.config.fragment_size) {
            self.stats.packets_invalid += 1;
            return Err(CoreError::protocol("fragment has a bad size"));
        }

        if !self.fragment_reassembly.exists(header.sequence) {
            if !self.received_packets.test_insert(header.sequence)
                || self.received_packets.exists(header.sequence)
            {
                self.stats.packets_stale += 1;
                return Ok(());
            }
            let Some(entry) = self.fragment_reassembly.insert(header.sequence) else {
                self.stats.packets_stale += 1;
                return Ok(());
            };
            entry.num_fragments_total = num_fragments;
            entry.fragments = vec![None; num_fragments];
        }

        let Some(entry) = self.fragment_reassembly.find_mut(header.sequence) else {
            return Ok(());
        };

        if entry.num_fragments_total != num_fragments {
            trace!(sequence = header.sequence, "fragment count mismatch, dropped");
            return Ok(());
        }
        let slot = &mut entry.fragments[header.fragment_id as usize];
        if slot.is_some() {
            trace!(sequence = header.sequence, fragment_id = header.fragment_id, "duplicate fragment");
            return Ok(());
        }

        *slot = Some(data);
        entry.num_fragments_received += 1;
        if embedded.is_some() {
            entry.header = embedded;
        }
        self.stats.fragments_received += 1;

        if entry.num_fragments_received < entry.num_fragments_total {
            return Ok(());
        }

        let Some(regular) = entry.header else {
            return Ok(());
        };
        let mut payload = BytesMut::new();
        for fragment in entry.fragments.iter().flatten() {
            payload.extend_from_slice(fragment);
        }
        let wire_len = payload.len() + constants::MAX_PACKET_HEADER_BYTES;
        self.fragment_reassembly.remove(header.sequence);

        trace!(sequence = header.sequence, num_fragments, "reassembled packet");
        self.receive_regular(regular, Some(payload.freeze()), wire_len);
        Ok(())
    }

    fn sample_base(&self, window: usize) -> Sequence {
        self.sent_packets.sequence().wrapping_sub(window as u16)
    }

    fn estimate_packet_loss(&mut self) {
        let samples = self.sent_packets.capacity() / 2;
        let base = self.sample_base(self.sent_packets.capacity());
        let mut dropped = 0usize;
        for offset in 0..samples {
            let sequence = base.wrapping_add(offset as u16);
            if self.sent_packets.find(sequence).is_some_and(|sent| !sent.acked) {
                dropped += 1;
            }
        }

        let loss = dropped as f32 / samples.max(1) as f32;
        self.packet_loss = smooth(self.packet_loss, loss, self.config.packet_loss_smoothing_factor);
    }

    fn estimate_sent_bandwidth(&mut self) {
        let samples = self.sent_packets.capacity() / 2;
        let base = self.sample_base(self.sent_packets.capacity());
        let mut window = Window::default();
        for offset in 0..samples {
            if let Some(sent) = self.sent_packets.find(base.wrapping_add(offset as u16)) {
                window.add(sent.time, sent.bytes);
            }
        }
        if let Some(kbps) = window.kbps() {
            self.sent_bandwidth_kbps =
                smooth(self.sent_bandwidth_kbps, kbps, self.config.bandwidth_smoothing_factor);
        }
    }

    fn estimate_received_bandwidth(&mut self) {
        let samples = self.received_packets.capacity() / 2;
        let base = self.received_packets.sequence().wrapping_sub(self.received_packets.capacity() as u16);
        let mut window = Window::default();
        for offset in 0..samples {
            if let Some(received) = self.received_packets.find(base.wrapping_add(offset as u16)) {
                window.add(received.time, received.bytes);
            }
        }
        if let Some(kbps) = window.kbps() {
            self.received_bandwidth_kbps =
                smooth(self.received_bandwidth_kbps, kbps, self.config.bandwidth_smoothing_factor);
        }
    }

    fn estimate_acked_bandwidth(&mut self) {
        let samples = self.sent_packets.capacity() / 2;
        let base = self.sample_base(self.sent_packets.capacity());
        let mut window = Window::default();
        for offset in 0..samples {
            if let Some(sent) = self.sent_packets.find(base.wrapping_add(offset as u16)) {
                if sent.acked {
                    window.add(sent.time, sent.bytes);
                }
            }
        }
        if let Some(kbps) = window.kbps() {
            self.acked_bandwidth_kbps =
                smooth(self.acked_bandwidth_kbps, kbps, self.config.bandwidth_smoothing_factor);
        }
    }
}

/// Byte count and time span over a run of sampled packets
#[derive(Default)]
struct Window {
    bytes: usize,
    start: f64,
    finish: f64,
    any: bool,
}

impl Window {
    fn add(&mut self, time: f64, bytes: usize) {
        if !self.any {
            self.start = time;
            self.finish = time;
            self.any = true;
        }
        self.bytes += bytes;
        self.start = self.start.min(time);
        self.finish = self.finish.max(time);
    }

    fn kbps(&self) -> Option<f32> {
        if !self.any || self.finish <= self.start {
            return None;
        }
        Some((self.bytes as f64 / (self.finish - self.start) * 8.0 / 1000.0) as f32)
    }
}

fn smooth(current: f32, sample: f32, factor: f32) -> f32 {
    let value = if (current - sample).abs() > 0.00001 {
        current + (sample - current) * factor
    } else {
        sample
    };
    if value.is_finite() {
        value
    } else {
        0.0
    }
}
