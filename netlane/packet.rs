//! Handshake-layer packets: prefix/sequence header, typed bodies, AEAD
//!
//! Every packet except the connection request is
//! `prefix | sequence (1-8 bytes LE) | ciphertext+tag`. The prefix holds the
//! packet type in its low nibble and the sequence byte count in its high
//! nibble; it is authenticated as part of the associated data.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::crypto::{self, Key, MAC_BYTES};
use crate::error::{NetError, Result};

/// Handshake-layer constants
pub mod constants {
    pub const VERSION_INFO: &[u8; 13] = b"NETCODE 1.01\0"; // protocol version string
    pub const VERSION_INFO_BYTES: usize = 13;
    pub const CONNECT_TOKEN_BYTES: usize = 2048; // public token
    pub const CONNECT_TOKEN_PRIVATE_BYTES: usize = 1024; // encrypted private part incl. tag
    pub const CHALLENGE_TOKEN_BYTES: usize = 300; // encrypted challenge incl. tag
    pub const USER_DATA_BYTES: usize = 256;
    pub const MAX_SERVERS_PER_CONNECT: usize = 32;
    pub const MAX_PAYLOAD_BYTES: usize = 1200;
    pub const MAX_PACKET_BYTES: usize = 1 + 8 + MAX_PAYLOAD_BYTES + 16; // prefix, seq, payload, tag
    pub const CONNECTION_REQUEST_BYTES: usize = 1 + VERSION_INFO_BYTES + 8 + 8 + 8 + CONNECT_TOKEN_PRIVATE_BYTES;
    pub const NETCODE_TIMEOUT_SECONDS: f64 = 5.0; // connected client silence limit
    pub const NUM_DISCONNECT_PACKETS: usize = 10; // redundant disconnects
    pub const PACKET_SEND_INTERVAL: f64 = 0.1; // handshake resend and keep-alive cadence
    pub const REPLAY_PROTECTION_BUFFER_SIZE: usize = 256;
    pub const GLOBAL_SEQUENCE_BIT: u64 = 1 << 63; // marks sequences outside any client stream
}

/// Packet type, stored in the low nibble of the prefix byte
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum PacketType {
    ConnectionRequest = 0,
    ConnectionDenied = 1,
    ConnectionChallenge = 2,
    ConnectionResponse = 3,
    ConnectionKeepAlive = 4,
    ConnectionPayload = 5,
    ConnectionDisconnect = 6,
}

impl PacketType {
    pub fn from_u8(value: u8) -> Option<Self> {
        Some(match value {
            0 => PacketType::ConnectionRequest,
            1 => PacketType::ConnectionDenied,
            2 => PacketType::ConnectionChallenge,
            3 => PacketType::ConnectionResponse,
            4 => PacketType::ConnectionKeepAlive,
            5 => PacketType::ConnectionPayload,
            6 => PacketType::ConnectionDisconnect,
            _ => return None,
        })
    }

    /// Types subject to per-connection replay protection
    pub fn is_replay_protected(self) -> bool {
        matches!(
            self,
            PacketType::ConnectionKeepAlive | PacketType::ConnectionPayload | PacketType::ConnectionDisconnect
        )
    }
}

/// Unencrypted connection request, carrying the still-encrypted private token
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionRequest {
    pub protocol_id: u64,
    pub expire_timestamp: u64,
    pub token_sequence: u64,
    pub private_data: Bytes,
}

impl ConnectionRequest {
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(constants::CONNECTION_REQUEST_BYTES);
        buf.put_u8(PacketType::ConnectionRequest as u8);
        buf.put_slice(constants::VERSION_INFO);
        buf.put_u64_le(self.protocol_id);
        buf.put_u64_le(self.expire_timestamp);
        buf.put_u64_le(self.token_sequence);
        buf.put_slice(&self.private_data);
        buf.freeze()
    }

    pub fn decode(mut data: Bytes) -> Result<Self> {
        if data.len() != constants::CONNECTION_REQUEST_BYTES {
            return Err(NetError::protocol("connection request has the wrong size"));
        }
        if data.get_u8() != PacketType::ConnectionRequest as u8 {
            return Err(NetError::protocol("connection request prefix must be zero"));
        }
        let version = data.split_to(constants::VERSION_INFO_BYTES);
        if &version[..] != constants::VERSION_INFO {
            return Err(NetError::protocol("version mismatch"));
        }
        Ok(Self {
            protocol_id: data.get_u64_le(),
            expire_timestamp: data.get_u64_le(),
            token_sequence: data.get_u64_le(),
            private_data: data,
        })
    }
}

/// Decrypted body of an encrypted packet
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Packet {
    Denied,
    Challenge { challenge_sequence: u64, token: Bytes },
    Response { challenge_sequence: u64, token: Bytes },
    KeepAlive { client_index: u32, max_slots: u32 },
    Payload(Bytes),
    Disconnect,
}

impl Packet {
    pub fn packet_type(&self) -> PacketType {
        match self {
            Packet::Denied => PacketType::ConnectionDenied,
            Packet::Challenge { .. } => PacketType::ConnectionChallenge,
            Packet::Response { .. } => PacketType::ConnectionResponse,
            Packet::KeepAlive { .. } => PacketType::ConnectionKeepAlive,
            Packet::Payload(_) => PacketType::ConnectionPayload,
            Packet::Disconnect => PacketType::ConnectionDisconnect,
        }
    }

    fn encode_body(&self, buf: &mut BytesMut) {
        match self {
            Packet::Denied | Packet::Disconnect => {}
            Packet::Challenge {
                challenge_sequence,
                token,
            }
            | Packet::Response {
                challenge_sequence,
                token,
            } => {
                buf.put_u64_le(*challenge_sequence);
                buf.put_slice(token);
            }
            Packet::KeepAlive {
                client_index,
                max_slots,
            } => {
                buf.put_u32_le(*client_index);
                buf.put_u32_le(*max_slots);
            }
            Packet::Payload(payload) => buf.put_slice(payload),
        }
    }

    fn decode_body(packet_type: PacketType, mut body: Bytes) -> Result<Self> {
        let challenge_len = 8 + constants::CHALLENGE_TOKEN_BYTES;
        match packet_type {
            PacketType::ConnectionDenied if body.is_empty() => Ok(Packet::Denied),
            PacketType::ConnectionDisconnect if body.is_empty() => Ok(Packet::Disconnect),
            PacketType::ConnectionChallenge if body.len() == challenge_len => Ok(Packet::Challenge {
                challenge_sequence: body.get_u64_le(),
                token: body,
            }),
            PacketType::ConnectionResponse if body.len() == challenge_len => Ok(Packet::Response {
                challenge_sequence: body.get_u64_le(),
                token: body,
            }),
            PacketType::ConnectionKeepAlive if body.len() == 8 => Ok(Packet::KeepAlive {
                client_index: body.get_u32_le(),
                max_slots: body.get_u32_le(),
            }),
            PacketType::ConnectionPayload if (1..=constants::MAX_PAYLOAD_BYTES).contains(&body.len()) => {
                Ok(Packet::Payload(body))
            }
            _ => Err(NetError::protocol(format!("bad {packet_type:?} body of {} bytes", body.len()))),
        }
    }

    /// Serialize, encrypt and frame with `sequence`
    pub fn encrypt(&self, sequence: u64, protocol_id: u64, key: &Key) -> Result<Bytes> {
        let sequence_bytes = sequence_byte_count(sequence);
        let prefix = self.packet_type() as u8 | ((sequence_bytes as u8) << 4);

        let mut body = BytesMut::with_capacity(8 + constants::CHALLENGE_TOKEN_BYTES);
        self.encode_body(&mut body);
        let sealed = crypto::encrypt(&body, &additional_data(protocol_id, prefix), sequence, key)?;

        let mut buf = BytesMut::with_capacity(1 + sequence_bytes + sealed.len());
        buf.put_u8(prefix);
        buf.put_slice(&sequence.to_le_bytes()[..sequence_bytes]);
        buf.put_slice(&sealed);
        Ok(buf.freeze())
    }

    /// Authenticate and decrypt a packet split off by [`classify`]
    pub fn decrypt(header: &EncryptedHeader, ciphertext: &[u8], protocol_id: u64, key: &Key) -> Result<Self> {
        let plain = crypto::decrypt(
            ciphertext,
            &additional_data(protocol_id, header.prefix),
            header.sequence,
            key,
        )?;
        Self::decode_body(header.packet_type, Bytes::from(plain))
    }
}

/// Prefix and sequence of an encrypted packet
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EncryptedHeader {
    pub packet_type: PacketType,
    pub sequence: u64,
    pub prefix: u8,
}

/// Inbound datagram split by prefix
#[derive(Debug, Clone)]
pub enum Inbound {
    Request(ConnectionRequest),
    Encrypted { header: EncryptedHeader, ciphertext: Bytes },
}

/// Parse the unauthenticated framing of a datagram.
pub fn classify(mut data: Bytes) -> Result<Inbound> {
    let Some(&prefix) = data.first() else {
        return Err(NetError::protocol("empty datagram"));
    };
    if prefix == PacketType::ConnectionRequest as u8 {
        return ConnectionRequest::decode(data).map(Inbound::Request);
    }
    if data.len() > constants::MAX_PACKET_BYTES {
        return Err(NetError::protocol("datagram too large"));
    }

    let packet_type = PacketType::from_u8(prefix & 0x0F)
        .filter(|kind| *kind != PacketType::ConnectionRequest)
        .ok_or_else(|| NetError::protocol(format!("unknown packet type in prefix {prefix:#04x}")))?;
    let sequence_bytes = (prefix >> 4) as usize;
    if !(1..=8).contains(&sequence_bytes) {
        return Err(NetError::protocol("bad sequence byte count"));
    }
    if data.len() < 1 + sequence_bytes + MAC_BYTES {
        return Err(NetError::protocol("datagram too short"));
    }

    data.advance(1);
    let mut sequence = [0u8; 8];
    sequence[..sequence_bytes].copy_from_slice(&data[..sequence_bytes]);
    data.advance(sequence_bytes);

    Ok(Inbound::Encrypted {
        header: EncryptedHeader {
            packet_type,
            sequence: u64::from_le_bytes(sequence),
            prefix,
        },
        ciphertext: data,
    })
}

/// Minimum bytes needed for `sequence`, at least one
fn sequence_byte_count(sequence: u64) -> usize {
    let significant = 8 - (sequence.leading_zeros() as usize / 8);
    significant.max(1)
}

fn additional_data(protocol_id: u64, prefix: u8) -> [u8; constants::VERSION_INFO_BYTES + 9] {
    let mut aad = [0u8; constants::VERSION_INFO_BYTES + 9];
    aad[..constants::VERSION_INFO_BYTES].copy_from_slice(constants::VERSION_INFO);
    aad[constants::VERSION_INFO_BYTES..constants::VERSION_INFO_BYTES + 8].copy_from_slice(&protocol_id.to_le_bytes());
    aad[constants::VERSION_INFO_BYTES + 8] = prefix;
    aad
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::generate_key;

    const PROTOCOL_ID: u64 = 0x1122334455667788;

    fn open(data: Bytes, key: &Key) -> Result<(EncryptedHeader, Packet)> {
        match classify(data)? {
            Inbound::Encrypted { header, ciphertext } => {
                let packet = Packet::decrypt(&header, &ciphertext, PROTOCOL_ID, key)?;
                Ok((header, packet))
            }
            Inbound::Request(_) => Err(NetError::protocol("unexpected request")),
        }
    }

    #[test]
    fn test_sequence_bytes() {
        assert_eq!(sequence_byte_count(0), 1);
        assert_eq!(sequence_byte_count(255), 1);
        assert_eq!(sequence_byte_count(256), 2);
        assert_eq!(sequence_byte_count(u64::MAX), 8);
    }

    #[test]
    fn test_keep_alive_framing() {
        let key = generate_key();
        let packet = Packet::KeepAlive {
            client_index: 3,
            max_slots: 16,
        };
        let data = packet.encrypt(300, PROTOCOL_ID, &key).unwrap();
        // prefix, 2 sequence bytes, 8 byte body, tag
        assert_eq!(data.len(), 1 + 2 + 8 + MAC_BYTES);
        assert_eq!(data[0], 0x24);

        let (header, decoded) = open(data, &key).unwrap();
        assert_eq!(header.sequence, 300);
        assert_eq!(decoded, packet);
    }

    #[test]
    fn test_prefix_is_authenticated() {
        let key = generate_key();
        let mut data = BytesMut::from(&Packet::Disconnect.encrypt(1, PROTOCOL_ID, &key).unwrap()[..]);
        data[0] = PacketType::ConnectionDenied as u8 | (1 << 4);
        assert!(open(data.freeze(), &key).is_err());
    }

    #[test]
    fn test_wrong_protocol_id_rejected() {
        let key = generate_key();
        let data = Packet::Payload(Bytes::from_static(b"hi")).encrypt(9, PROTOCOL_ID, &key).unwrap();
        let Inbound::Encrypted { header, ciphertext } = classify(data).unwrap() else {
            panic!("expected encrypted packet");
        };
        assert!(Packet::decrypt(&header, &ciphertext, PROTOCOL_ID + 1, &key).is_err());
    }

    #[test]
    fn test_connection_request() {
        let request = ConnectionRequest {
            protocol_id: PROTOCOL_ID,
            expire_timestamp: 1000,
            token_sequence: 5,
            private_data: Bytes::from(vec![9u8; constants::CONNECT_TOKEN_PRIVATE_BYTES]),
        };
        let data = request.encode();
        assert_eq!(data.len(), constants::CONNECTION_REQUEST_BYTES);
        match classify(data.clone()).unwrap() {
            Inbound::Request(decoded) => assert_eq!(decoded, request),
            other => panic!("expected request, got {other:?}"),
        }

        let mut bad_version = BytesMut::from(&data[..]);
        bad_version[1] = b'X';
        assert!(classify(bad_version.freeze()).is_err());
        assert!(classify(data.slice(..100)).is_err());
    }

    #[test]
    fn test_body_size_checked() {
        let key = generate_key();
        let empty = Packet::Payload(Bytes::new()).encrypt(1, PROTOCOL_ID, &key).unwrap();
        assert!(open(empty, &key).is_err());

        let short_challenge = Packet::Challenge {
            challenge_sequence: 1,
            token: Bytes::from_static(&[0u8; 10]),
        }
        .encrypt(1, PROTOCOL_ID, &key)
        .unwrap();
        assert!(open(short_challenge, &key).is_err());
    }
}
