//! Reliability layer wire types, constants, and utilities

use bytes::{Buf, BufMut, Bytes, BytesMut};

/// Wire constants
pub mod constants {
    pub const MAX_PACKET_HEADER_BYTES: usize = 10; // prefix, channel, seq, ack, ack bits
    pub const FRAGMENT_HEADER_BYTES: usize = 6; // prefix, channel, seq, id, count
    pub const ACK_PACKET_BYTES: usize = 8; // prefix, channel, ack, ack bits
    pub const PREFIX_FRAGMENT: u8 = 0x01; // fragment packet
    pub const PREFIX_SHORT_ACK: u8 = 0x20; // ack stored as 1 byte diff
    pub const PREFIX_ACK_ONLY: u8 = 0x80; // ack-only packet
    pub const ACK_BITS: u16 = 32; // sequences covered by ack bits
    pub const MAX_MESSAGE_SIZE: usize = 0x7fff; // varint size limit
    pub const MAX_SEQUENCE_BUFFER_SIZE: usize = 32768; // half the sequence space
}

/// Packet and message sequence number
pub type Sequence = u16;

/// Check if a sequence number is before another (handling wrapping)
pub fn sequence_less_than(a: Sequence, b: Sequence) -> bool {
    (a.wrapping_sub(b) as i16) < 0
}

/// Check if a sequence number is after another (handling wrapping)
pub fn sequence_greater_than(a: Sequence, b: Sequence) -> bool {
    (a.wrapping_sub(b) as i16) > 0
}

/// Regular packet header.
///
/// Encoded as a prefix byte followed by channel, sequence and then a
/// compressed ack block. Prefix bits 1-4 mark which ack-bit bytes are present
/// (a byte equal to `0xFF` is omitted), bit 5 marks an ack stored as a one
/// byte distance behind `sequence`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PacketHeader {
    pub channel: u8,
    pub sequence: Sequence,
    pub ack: Sequence,
    pub ack_bits: u32,
}

impl PacketHeader {
    /// Encode header into buffer
    pub fn encode(&self, buf: &mut BytesMut) {
        let mut prefix = 0u8;
        let ack_bytes = self.ack_bits.to_le_bytes();
        for (i, byte) in ack_bytes.iter().enumerate() {
            if *byte != 0xFF {
                prefix |= 1 << (i + 1);
            }
        }

        let ack_distance = self.sequence.wrapping_sub(self.ack);
        if ack_distance <= 0xFF {
            prefix |= constants::PREFIX_SHORT_ACK;
        }

        buf.put_u8(prefix);
        buf.put_u8(self.channel);
        buf.put_u16_le(self.sequence);

        if ack_distance <= 0xFF {
            buf.put_u8(ack_distance as u8);
        } else {
            buf.put_u16_le(self.ack);
        }

        for (i, byte) in ack_bytes.iter().enumerate() {
            if prefix & (1 << (i + 1)) != 0 {
                buf.put_u8(*byte);
            }
        }
    }

    /// Decode header from buffer
    pub fn decode(buf: &mut Bytes) -> Option<Self> {
        if buf.len() < 5 {
            return None;
        }

        let prefix = buf.get_u8();
        if prefix & (constants::PREFIX_FRAGMENT | constants::PREFIX_ACK_ONLY) != 0 {
            return None;
        }

        let channel = buf.get_u8();
        let sequence = buf.get_u16_le();

        let ack = if prefix & constants::PREFIX_SHORT_ACK != 0 {
            sequence.wrapping_sub(buf.get_u8() as u16)
        } else {
            if buf.remaining() < 2 {
                return None;
            }
            buf.get_u16_le()
        };

        let mut ack_bytes = [0xFFu8; 4];
        for (i, byte) in ack_bytes.iter_mut().enumerate() {
            if prefix & (1 << (i + 1)) != 0 {
                if !buf.has_remaining() {
                    return None;
                }
                *byte = buf.get_u8();
            }
        }

        Some(Self {
            channel,
            sequence,
            ack,
            ack_bits: u32::from_le_bytes(ack_bytes),
        })
    }
}

/// Ack-only packet, carries no payload
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AckHeader {
    pub channel: u8,
    pub ack: Sequence,
    pub ack_bits: u32,
}

impl AckHeader {
    /// Encode header into buffer
    pub fn encode(&self, buf: &mut BytesMut) {
        buf.put_u8(constants::PREFIX_ACK_ONLY);
        buf.put_u8(self.channel);
        buf.put_u16_le(self.ack);
        buf.put_u32_le(self.ack_bits);
    }

    /// Decode header from buffer
    pub fn decode(buf: &mut Bytes) -> Option<Self> {
        if buf.len() < constants::ACK_PACKET_BYTES || buf[0] != constants::PREFIX_ACK_ONLY {
            return None;
        }
        buf.advance(1);

        Some(Self {
            channel: buf.get_u8(),
            ack: buf.get_u16_le(),
            ack_bits: buf.get_u32_le(),
        })
    }
}

/// Fragment header. `num_fragments` is the real count; the wire stores it minus one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FragmentHeader {
    pub channel: u8,
    pub sequence: Sequence,
    pub fragment_id: u8,
    pub num_fragments: u16,
}

impl FragmentHeader {
    /// Encode header into buffer
    pub fn encode(&self, buf: &mut BytesMut) {
        buf.put_u8(constants::PREFIX_FRAGMENT | ((self.channel & 0x03) << 6));
        buf.put_u8(self.channel);
        buf.put_u16_le(self.sequence);
        buf.put_u8(self.fragment_id);
        buf.put_u8(self.num_fragments.saturating_sub(1) as u8);
    }

    /// Decode header from buffer
    pub fn decode(buf: &mut Bytes) -> Option<Self> {
        if buf.len() < constants::FRAGMENT_HEADER_BYTES || buf[0] & constants::PREFIX_FRAGMENT == 0 {
            return None;
        }
        buf.advance(1);

        Some(Self {
            channel: buf.get_u8(),
            sequence: buf.get_u16_le(),
            fragment_id: buf.get_u8(),
            num_fragments: buf.get_u8() as u16 + 1,
        })
    }
}

/// Any reliability-layer packet, classified by its prefix byte
#[derive(Debug, Clone, PartialEq)]
pub enum WirePacket {
    Regular { header: PacketHeader, payload: Bytes },
    AckOnly(AckHeader),
    Fragment { header: FragmentHeader, data: Bytes },
}

impl WirePacket {
    /// Classify and decode a packet; the remaining bytes become the payload
    pub fn decode(mut buf: Bytes) -> Option<Self> {
        let prefix = *buf.first()?;
        if prefix & constants::PREFIX_FRAGMENT != 0 {
            let header = FragmentHeader::decode(&mut buf)?;
            Some(WirePacket::Fragment { header, data: buf })
        } else if prefix & constants::PREFIX_ACK_ONLY != 0 {
            AckHeader::decode(&mut buf).map(WirePacket::AckOnly)
        } else {
            let header = PacketHeader::decode(&mut buf)?;
            Some(WirePacket::Regular { header, payload: buf })
        }
    }

    /// Channel byte, stored at offset 1 of every packet form
    pub fn channel(&self) -> u8 {
        match self {
            WirePacket::Regular { header, .. } => header.channel,
            WirePacket::AckOnly(header) => header.channel,
            WirePacket::Fragment { header, .. } => header.channel,
        }
    }
}

/// Read the channel byte without decoding the packet
pub fn peek_channel(buf: &[u8]) -> Option<u8> {
    buf.get(1).copied()
}

/// Write a message size as a 1-2 byte varint (max `0x7fff`)
pub fn put_var_u16(buf: &mut BytesMut, value: u16) {
    debug_assert!(value as usize <= constants::MAX_MESSAGE_SIZE);
    if value < 0x80 {
        buf.put_u8(value as u8);
    } else {
        buf.put_u8(0x80 | (value & 0x7F) as u8);
        buf.put_u8((value >> 7) as u8);
    }
}

/// Read a 1-2 byte varint written by [`put_var_u16`]
pub fn get_var_u16(buf: &mut Bytes) -> Option<u16> {
    if !buf.has_remaining() {
        return None;
    }
    let low = buf.get_u8();
    if low & 0x80 == 0 {
        return Some(low as u16);
    }
    if !buf.has_remaining() {
        return None;
    }
    let high = buf.get_u8();
    Some((low & 0x7F) as u16 | ((high as u16) << 7))
}

/// Packet controller counters
#[derive(Debug, Default, Clone, Copy)]
pub struct ControllerStats {
    /// Packets handed to the transport, fragments counted individually
    pub packets_sent: u64,
    /// Packets accepted from the transport
    pub packets_received: u64,
    /// Fragments emitted
    pub fragments_sent: u64,
    /// Fragments accepted into reassembly
    pub fragments_received: u64,
    /// Sent packets confirmed by the peer
    pub packets_acked: u64,
    /// Packets dropped as stale
    pub packets_stale: u64,
    /// Packets dropped as malformed
    pub packets_invalid: u64,
    /// Wire bytes sent
    pub bytes_sent: u64,
    /// Wire bytes received
    pub bytes_received: u64,
}
