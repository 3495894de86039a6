use std::collections::VecDeque;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tracing::{debug, error, info, trace, warn};

use super::{ChannelStats, QosType};
use crate::config::{ChannelConfig, ReliableConfig};
use crate::controller::PacketController;
use crate::error::{CoreError, CoreResult};
use crate::protocol::{constants, get_var_u16, put_var_u16, sequence_less_than, Sequence};
use crate::sequence_buffer::SequenceBuffer;

const RESEND_INTERVAL: f64 = 0.1;
const ACK_INTERVAL: f64 = 0.1;
const CONGESTED_FLUSH_INTERVAL: f64 = 1.0 / 10.0;
const NORMAL_FLUSH_INTERVAL: f64 = 1.0 / 90.0;
const MIN_CONGESTION_DISABLE_INTERVAL: f64 = 5.0;
const MAX_CONGESTION_DISABLE_INTERVAL: f64 = 60.0;
const CONGESTION_RETRIGGER_WINDOW: f64 = 10.0;
const CONGESTION_RELAX_PERIOD: f64 = 10.0;

/// Framed message waiting for an ack
#[derive(Debug, Clone)]
struct BufferedMessage {
    /// Last transmission, negative when never sent
    time: f64,
    frame: Bytes,
}

impl Default for BufferedMessage {
    fn default() -> Self {
        Self {
            time: -1.0,
            frame: Bytes::new(),
        }
    }
}

/// Reliable-ordered message channel.
///
/// Messages get a u16 id and travel as `id | varint size | bytes` frames,
/// several per packet. A packet ack retires every id it carried. Unacked
/// messages are resent no more than every 100 ms. Receivers buffer early
/// ids and deliver strictly in order.
pub struct ReliableChannel {
    config: ChannelConfig,
    controller: PacketController,
    time: f64,

    congestion_control: bool,
    congestion_disable_timer: f64,
    congestion_disable_interval: f64,
    last_congestion_switch_time: f64,

    message_packer: BytesMut,
    packed_ids: Vec<Sequence>,
    send_buffer: SequenceBuffer<BufferedMessage>,
    receive_buffer: SequenceBuffer<Bytes>,
    ack_buffer: SequenceBuffer<Vec<Sequence>>,
    message_queue: VecDeque<Bytes>,

    last_buffer_flush: f64,
    last_message_send: f64,
    flush_due: bool,

    oldest_unacked: Sequence,
    sequence: Sequence,
    next_receive: Sequence,

    last_queue_depth_log_time: f64,
    last_logged_queue_depth: usize,

    received: Vec<Bytes>,
    stats: ChannelStats,
    last_send: Option<f64>,
}

impl ReliableChannel {
    pub fn new(reliable: ReliableConfig, config: ChannelConfig, now: f64) -> CoreResult<Self> {
        config.validate()?;
        let capacity = config.reliable_buffer_size;
        Ok(Self {
            controller: PacketController::new(reliable, now)?,
            time: now,
            congestion_control: false,
            congestion_disable_timer: 0.0,
            congestion_disable_interval: MIN_CONGESTION_DISABLE_INTERVAL,
            last_congestion_switch_time: f64::NEG_INFINITY,
            message_packer: BytesMut::new(),
            packed_ids: Vec::new(),
            send_buffer: SequenceBuffer::new(capacity),
            receive_buffer: SequenceBuffer::new(capacity),
            ack_buffer: SequenceBuffer::new(capacity),
            message_queue: VecDeque::new(),
            last_buffer_flush: -1.0,
            last_message_send: now,
            flush_due: false,
            oldest_unacked: 0,
            sequence: 0,
            next_receive: 0,
            last_queue_depth_log_time: 0.0,
            last_logged_queue_depth: 0,
            received: Vec::new(),
            stats: ChannelStats::default(),
            last_send: None,
            config,
        })
    }

    /// Underlying packet controller
    pub fn controller(&self) -> &PacketController {
        &self.controller
    }

    /// Whether the channel is pacing at the congested rate
    pub fn is_congested(&self) -> bool {
        self.congestion_control
    }

    /// Seconds good conditions must last before congestion mode ends
    pub fn congestion_disable_interval(&self) -> f64 {
        self.congestion_disable_interval
    }

    /// Messages waiting in the overflow queue
    pub fn queued_messages(&self) -> usize {
        self.message_queue.len()
    }

    /// Messages in the send window not yet acked
    pub fn unacked_messages(&self) -> usize {
        self.window()
            .filter(|id| self.send_buffer.exists(*id))
            .count()
    }

    /// Seconds since the last send, `None` before the first
    pub fn time_since_last_send(&self) -> Option<f64> {
        self.last_send.map(|at| self.time - at)
    }

    pub fn stats(&self) -> ChannelStats {
        self.stats
    }

    /// Accept a message for delivery.
    ///
    /// When the send window is full the message waits in the overflow queue;
    /// when that queue is at its limit the message is dropped and
    /// `QueueExhausted` is returned.
    pub fn send_message(&mut self, data: &[u8]) -> CoreResult<()> {
        if data.is_empty() {
            return Err(CoreError::buffer("reliable messages must not be empty"));
        }
        let limit = self.max_message_size();
        if data.len() > limit {
            return Err(CoreError::buffer(format!(
                "reliable message of {} bytes exceeds limit {limit}",
                data.len()
            )));
        }

        if self.send_window_full() || !self.message_queue.is_empty() {
            if self.message_queue.len() >= self.config.max_queue_size {
                self.stats.messages_dropped += 1;
                error!(
                    depth = self.message_queue.len(),
                    max = self.config.max_queue_size,
                    size = data.len(),
                    "reliable message queue exhausted, message dropped"
                );
                return Err(CoreError::queue_exhausted(
                    self.message_queue.len(),
                    self.config.max_queue_size,
                    data.len(),
                    QosType::Reliable.channel_id(),
                ));
            }
            self.message_queue.push_back(Bytes::copy_from_slice(data));
        } else {
            self.buffer_message(data);
        }

        self.stats.messages_sent += 1;
        self.stats.bytes_sent += data.len() as u64;
        self.last_send = Some(self.time);
        Ok(())
    }

    pub fn receive_packet(&mut self, data: Bytes) -> CoreResult<()> {
        self.controller.receive_packet(data)?;

        for (sequence, payload) in self.controller.drain_received() {
            if let Err(e) = self.process_packet(payload) {
                trace!(sequence, error = %e, "dropped malformed message frames");
            }
        }
        for sequence in self.controller.drain_acked() {
            self.ack_packet(sequence);
        }
        Ok(())
    }

    /// Advance the clock: refill the window, run congestion hysteresis and
    /// arm the next flush.
    pub fn update(&mut self, now: f64) {
        let dt = now - self.time;
        self.time = now;
        self.controller.update(now);

        let mut dequeued = 0;
        while dequeued < self.config.max_dequeue_per_update && !self.send_window_full() {
            let Some(message) = self.message_queue.pop_front() else {
                break;
            };
            self.buffer_message(&message);
            dequeued += 1;
        }

        self.update_congestion(dt);

        let flush_interval = if self.congestion_control {
            CONGESTED_FLUSH_INTERVAL
        } else {
            NORMAL_FLUSH_INTERVAL
        };
        if self.time - self.last_buffer_flush >= flush_interval {
            self.flush_due = true;
        }

        self.log_queue_depth();
    }

    /// Pack and send due messages if the flush timer has fired
    pub fn process_send_buffer(&mut self) -> CoreResult<()> {
        if !self.flush_due {
            return Ok(());
        }
        self.flush_due = false;
        self.last_buffer_flush = self.time;
        self.flush_send_buffer()
    }

    pub fn drain_output(&mut self) -> Vec<Bytes> {
        self.controller.drain_output()
    }

    pub fn drain_received(&mut self) -> Vec<Bytes> {
        std::mem::take(&mut self.received)
    }

    /// Drop every buffered message and rewind all cursors
    pub fn reset(&mut self) {
        self.controller.reset();
        self.send_buffer.reset();
        self.receive_buffer.reset();
        self.ack_buffer.reset();
        self.message_queue.clear();
        self.message_packer.clear();
        self.packed_ids.clear();
        self.received.clear();

        self.last_buffer_flush = -1.0;
        self.last_message_send = self.time;
        self.flush_due = false;

        self.congestion_control = false;
        self.last_congestion_switch_time = f64::NEG_INFINITY;
        self.congestion_disable_timer = 0.0;
        self.congestion_disable_interval = MIN_CONGESTION_DISABLE_INTERVAL;

        self.sequence = 0;
        self.next_receive = 0;
        self.oldest_unacked = 0;
        self.last_logged_queue_depth = 0;
        self.last_send = None;
    }

    pub fn usage_statistics(&self) -> String {
        format!(
            "{} send_buffer:{}/{} queue:{}/{} last_flush:{:.3} last_send:{:.3} time:{:.3} \
             oldest_unacked:{} sequence:{} next_receive:{} congestion:{} disable_interval:{:.1} \
             last_congestion_switch:{:.3}",
            self.controller.usage_statistics(),
            self.unacked_messages(),
            self.send_buffer.capacity(),
            self.message_queue.len(),
            self.config.max_queue_size,
            self.last_buffer_flush,
            self.last_message_send,
            self.time,
            self.oldest_unacked,
            self.sequence,
            self.next_receive,
            self.congestion_control,
            self.congestion_disable_interval,
            self.last_congestion_switch_time,
        )
    }

    /// Largest message that still fits one packet after framing
    fn max_message_size(&self) -> usize {
        let reliable = self.controller.config();
        let budget = reliable
            .max_packet_size
            .saturating_sub(constants::FRAGMENT_HEADER_BYTES + constants::MAX_PACKET_HEADER_BYTES + 4);
        budget.min(constants::MAX_MESSAGE_SIZE)
    }

    fn window(&self) -> impl Iterator<Item = Sequence> + '_ {
        let span = self.sequence.wrapping_sub(self.oldest_unacked);
        (0..span).map(move |offset| self.oldest_unacked.wrapping_add(offset))
    }

    fn send_window_full(&self) -> bool {
        self.sequence.wrapping_sub(self.oldest_unacked) as usize >= self.send_buffer.capacity()
    }

    fn buffer_message(&mut self, data: &[u8]) {
        let id = self.sequence;
        self.sequence = self.sequence.wrapping_add(1);

        let mut frame = BytesMut::with_capacity(data.len() + 4);
        frame.put_u16_le(id);
        put_var_u16(&mut frame, data.len() as u16);
        frame.put_slice(data);

        if let Some(entry) = self.send_buffer.insert(id) {
            entry.time = -1.0;
            entry.frame = frame.freeze();
        }
    }

    fn flush_send_buffer(&mut self) -> CoreResult<()> {
        let threshold = self.controller.config().fragment_threshold;
        let max_packet = self.controller.config().max_packet_size;
        let span = self
            .sequence
            .wrapping_sub(self.oldest_unacked)
            .min(self.send_buffer.capacity() as u16);

        for offset in 0..span {
            let id = self.oldest_unacked.wrapping_add(offset);
            let Some(message) = self.send_buffer.find(id) else {
                continue;
            };
            if self.time - message.time < RESEND_INTERVAL {
                continue;
            }

            let len = message.frame.len();
            let fits = if len < threshold {
                self.message_packer.len() + len <= threshold.saturating_sub(constants::MAX_PACKET_HEADER_BYTES)
            } else {
                self.message_packer.len() + len
                    <= max_packet.saturating_sub(constants::FRAGMENT_HEADER_BYTES + constants::MAX_PACKET_HEADER_BYTES)
            };
            if !fits {
                self.flush_message_packer()?;
            }

            if let Some(message) = self.send_buffer.find_mut(id) {
                message.time = self.time;
                self.message_packer.extend_from_slice(&message.frame);
                self.packed_ids.push(id);
                self.last_message_send = self.time;
            }
        }

        if self.time - self.last_message_send >= ACK_INTERVAL {
            self.controller.send_ack(QosType::Reliable.channel_id());
            self.last_message_send = self.time;
        }

        self.flush_message_packer()
    }

    fn flush_message_packer(&mut self) -> CoreResult<()> {
        if self.message_packer.is_empty() {
            return Ok(());
        }

        let packet_sequence = self
            .controller
            .send_packet(&self.message_packer, QosType::Reliable.channel_id())?;
        let ids = std::mem::take(&mut self.packed_ids);
        if let Some(entry) = self.ack_buffer.insert(packet_sequence) {
            *entry = ids;
        }
        self.message_packer.clear();
        Ok(())
    }

    fn ack_packet(&mut self, packet_sequence: Sequence) {
        let Some(ids) = self.ack_buffer.find_mut(packet_sequence).map(std::mem::take) else {
            return;
        };
        for id in ids {
            self.send_buffer.remove(id);
        }

        let mut id = self.oldest_unacked;
        while id != self.sequence && !self.send_buffer.exists(id) {
            id = id.wrapping_add(1);
        }
        self.oldest_unacked = id;
    }

    fn process_packet(&mut self, mut payload: Bytes) -> CoreResult<()> {
        while payload.has_remaining() {
            if payload.remaining() < 2 {
                return Err(CoreError::protocol("truncated message id"));
            }
            let id = payload.get_u16_le();
            let len = get_var_u16(&mut payload)
                .ok_or_else(|| CoreError::protocol("truncated message size"))? as usize;
            if len == 0 {
                continue;
            }
            if payload.remaining() < len {
                return Err(CoreError::protocol("message size exceeds packet"));
            }

            let message = payload.split_to(len);
            if sequence_less_than(id, self.next_receive) || self.receive_buffer.exists(id) {
                continue;
            }
            if let Some(slot) = self.receive_buffer.insert(id) {
                *slot = message;
            }

            while let Some(message) = self.receive_buffer.find(self.next_receive).cloned() {
                self.receive_buffer.remove(self.next_receive);
                self.next_receive = self.next_receive.wrapping_add(1);
                self.stats.messages_received += 1;
                self.stats.bytes_received += message.len() as u64;
                self.received.push(message);
            }
        }
        Ok(())
    }

    fn update_congestion(&mut self, dt: f64) {
        let conditions_bad = self.controller.rtt_ms() >= self.config.congestion_rtt_threshold_ms;

        if conditions_bad {
            if !self.congestion_control {
                if self.time - self.last_congestion_switch_time < CONGESTION_RETRIGGER_WINDOW {
                    self.congestion_disable_interval =
                        (self.congestion_disable_interval * 2.0).min(MAX_CONGESTION_DISABLE_INTERVAL);
                }
                self.last_congestion_switch_time = self.time;
                debug!(
                    rtt_ms = self.controller.rtt_ms(),
                    disable_interval = self.congestion_disable_interval,
                    "congestion control enabled"
                );
            }
            self.congestion_control = true;
            self.congestion_disable_timer = 0.0;
        }

        if self.congestion_control && !conditions_bad {
            self.congestion_disable_timer += dt;
            if self.congestion_disable_timer >= self.congestion_disable_interval {
                self.congestion_control = false;
                self.last_congestion_switch_time = self.time;
                self.congestion_disable_timer = 0.0;
                debug!(rtt_ms = self.controller.rtt_ms(), "congestion control disabled");
            }
        }

        if !self.congestion_control {
            self.congestion_disable_timer += dt;
            if self.congestion_disable_timer >= CONGESTION_RELAX_PERIOD {
                self.congestion_disable_interval =
                    (self.congestion_disable_interval * 0.5).max(MIN_CONGESTION_DISABLE_INTERVAL);
                self.congestion_disable_timer = 0.0;
            }
        }
    }

    fn log_queue_depth(&mut self) {
        let depth = self.message_queue.len();
        if depth == 0 {
            if self.last_logged_queue_depth > 0 {
                info!(was = self.last_logged_queue_depth, "reliable message queue drained");
                self.last_logged_queue_depth = 0;
            }
            return;
        }

        let interval = match depth {
            d if d > 400 => 0.1,
            d if d > 200 => 0.5,
            d if d > 50 => 1.0,
            _ => 5.0,
        };
        if self.time - self.last_queue_depth_log_time < interval || depth == self.last_logged_queue_depth {
            return;
        }

        let rtt_ms = self.controller.rtt_ms();
        let congestion = self.congestion_control;
        if depth > 400 {
            error!(depth, rtt_ms, congestion, "reliable message queue near limit");
        } else if depth > 200 {
            warn!(depth, rtt_ms, congestion, "reliable message queue high");
        } else {
            info!(depth, rtt_ms, congestion, "reliable message queue building");
        }
        self.last_queue_depth_log_time = self.time;
        self.last_logged_queue_depth = depth;
    }
}
