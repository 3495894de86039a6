//! Connect tokens and challenge tokens
//!
//! A [`ConnectToken`] is the 2048-byte public token a client receives from
//! the token authority ([`TokenFactory`]). Its private part is sealed with a
//! key only the dedicated servers know and carries the client id, the
//! session keys and the user data ([`PrivateConnectToken`]). During the
//! handshake the server hands the client an opaque [`ChallengeToken`] sealed
//! with a per-process key.

use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr, SocketAddrV4, SocketAddrV6};
use std::time::{SystemTime, UNIX_EPOCH};

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::crypto::{self, Key, KEY_BYTES, MAC_BYTES};
use crate::error::{NetError, Result};
use crate::packet::constants::{
    CHALLENGE_TOKEN_BYTES, CONNECT_TOKEN_BYTES, CONNECT_TOKEN_PRIVATE_BYTES, MAX_SERVERS_PER_CONNECT,
    USER_DATA_BYTES, VERSION_INFO, VERSION_INFO_BYTES,
};

const ADDRESS_IPV4: u8 = 1;
const ADDRESS_IPV6: u8 = 2;

/// Opaque application data carried from the token authority to the server
pub type UserData = [u8; USER_DATA_BYTES];

/// Seconds since the Unix epoch
pub fn unix_timestamp() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_secs())
        .unwrap_or(0)
}

// ---------------------------------------------------------------------------
// Public connect token
// ---------------------------------------------------------------------------

/// Public connect token as seen by the client
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectToken {
    pub protocol_id: u64,
    pub create_timestamp: u64,
    pub expire_timestamp: u64,
    pub sequence: u64,
    /// Sealed [`PrivateConnectToken`], `CONNECT_TOKEN_PRIVATE_BYTES` long
    pub private_data: Bytes,
    /// Negative disables timeouts
    pub timeout_seconds: i32,
    pub server_addresses: Vec<SocketAddr>,
    pub client_to_server_key: Key,
    pub server_to_client_key: Key,
}

impl ConnectToken {
    /// Serialize into exactly `CONNECT_TOKEN_BYTES`, zero padded
    pub fn write(&self) -> Result<Bytes> {
        if self.private_data.len() != CONNECT_TOKEN_PRIVATE_BYTES {
            return Err(NetError::token("private data has the wrong size"));
        }
        check_addresses(&self.server_addresses)?;

        let mut buf = BytesMut::with_capacity(CONNECT_TOKEN_BYTES);
        buf.put_slice(VERSION_INFO);
        buf.put_u64_le(self.protocol_id);
        buf.put_u64_le(self.create_timestamp);
        buf.put_u64_le(self.expire_timestamp);
        buf.put_u64_le(self.sequence);
        buf.put_slice(&self.private_data);
        buf.put_i32_le(self.timeout_seconds);
        write_addresses(&mut buf, &self.server_addresses);
        buf.put_slice(&self.client_to_server_key);
        buf.put_slice(&self.server_to_client_key);
        buf.resize(CONNECT_TOKEN_BYTES, 0);
        Ok(buf.freeze())
    }

    /// Parse a public token; does not touch the private part
    pub fn read(data: &[u8]) -> Result<Self> {
        if data.len() != CONNECT_TOKEN_BYTES {
            return Err(NetError::token(format!(
                "connect token must be {CONNECT_TOKEN_BYTES} bytes, got {}",
                data.len()
            )));
        }
        let mut buf = Bytes::copy_from_slice(data);
        if &buf.split_to(VERSION_INFO_BYTES)[..] != VERSION_INFO {
            return Err(NetError::token("version mismatch"));
        }
        let protocol_id = buf.get_u64_le();
        let create_timestamp = buf.get_u64_le();
        let expire_timestamp = buf.get_u64_le();
        let sequence = buf.get_u64_le();
        let private_data = buf.split_to(CONNECT_TOKEN_PRIVATE_BYTES);
        let timeout_seconds = buf.get_i32_le();
        let server_addresses = read_addresses(&mut buf)?;
        let client_to_server_key = read_key(&mut buf)?;
        let server_to_client_key = read_key(&mut buf)?;

        Ok(Self {
            protocol_id,
            create_timestamp,
            expire_timestamp,
            sequence,
            private_data,
            timeout_seconds,
            server_addresses,
            client_to_server_key,
            server_to_client_key,
        })
    }

    /// Tag of the sealed private part; identifies the token in server history
    pub fn mac(&self) -> [u8; MAC_BYTES] {
        private_mac(&self.private_data)
    }

    /// Seconds between creation and expiry
    pub fn lifetime_seconds(&self) -> u64 {
        self.expire_timestamp.saturating_sub(self.create_timestamp)
    }
}

/// Last `MAC_BYTES` of a sealed private token
pub fn private_mac(private_data: &[u8]) -> [u8; MAC_BYTES] {
    let mut mac = [0u8; MAC_BYTES];
    if private_data.len() >= MAC_BYTES {
        mac.copy_from_slice(&private_data[private_data.len() - MAC_BYTES..]);
    }
    mac
}

// ---------------------------------------------------------------------------
// Private connect token
// ---------------------------------------------------------------------------

/// Server-only part of a connect token
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PrivateConnectToken {
    pub client_id: u64,
    pub timeout_seconds: i32,
    pub server_addresses: Vec<SocketAddr>,
    pub client_to_server_key: Key,
    pub server_to_client_key: Key,
    pub user_data: UserData,
}

impl PrivateConnectToken {
    /// Seal with the server private key; nonce is the token sequence
    pub fn seal(&self, protocol_id: u64, expire_timestamp: u64, sequence: u64, key: &Key) -> Result<Bytes> {
        check_addresses(&self.server_addresses)?;

        let mut buf = BytesMut::with_capacity(CONNECT_TOKEN_PRIVATE_BYTES);
        buf.put_u64_le(self.client_id);
        buf.put_i32_le(self.timeout_seconds);
        write_addresses(&mut buf, &self.server_addresses);
        buf.put_slice(&self.client_to_server_key);
        buf.put_slice(&self.server_to_client_key);
        buf.put_slice(&self.user_data);
        buf.resize(CONNECT_TOKEN_PRIVATE_BYTES - MAC_BYTES, 0);

        let sealed = crypto::encrypt(&buf, &private_aad(protocol_id, expire_timestamp), sequence, key)?;
        Ok(Bytes::from(sealed))
    }

    /// Authenticate and parse a sealed private token
    pub fn open(sealed: &[u8], protocol_id: u64, expire_timestamp: u64, sequence: u64, key: &Key) -> Result<Self> {
        if sealed.len() != CONNECT_TOKEN_PRIVATE_BYTES {
            return Err(NetError::token("private token has the wrong size"));
        }
        let plain = crypto::decrypt(sealed, &private_aad(protocol_id, expire_timestamp), sequence, key)?;
        let mut buf = Bytes::from(plain);

        let client_id = buf.get_u64_le();
        let timeout_seconds = buf.get_i32_le();
        let server_addresses = read_addresses(&mut buf)?;
        let client_to_server_key = read_key(&mut buf)?;
        let server_to_client_key = read_key(&mut buf)?;
        if buf.remaining() < USER_DATA_BYTES {
            return Err(NetError::token("private token truncated"));
        }
        let mut user_data = [0u8; USER_DATA_BYTES];
        buf.copy_to_slice(&mut user_data);

        Ok(Self {
            client_id,
            timeout_seconds,
            server_addresses,
            client_to_server_key,
            server_to_client_key,
            user_data,
        })
    }
}

fn private_aad(protocol_id: u64, expire_timestamp: u64) -> [u8; VERSION_INFO_BYTES + 16] {
    let mut aad = [0u8; VERSION_INFO_BYTES + 16];
    aad[..VERSION_INFO_BYTES].copy_from_slice(VERSION_INFO);
    aad[VERSION_INFO_BYTES..VERSION_INFO_BYTES + 8].copy_from_slice(&protocol_id.to_le_bytes());
    aad[VERSION_INFO_BYTES + 8..].copy_from_slice(&expire_timestamp.to_le_bytes());
    aad
}

// ---------------------------------------------------------------------------
// Challenge token
// ---------------------------------------------------------------------------

/// Handshake challenge the client must echo back unchanged
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChallengeToken {
    pub client_id: u64,
    pub user_data: UserData,
}

impl ChallengeToken {
    pub fn seal(&self, challenge_sequence: u64, key: &Key) -> Result<Bytes> {
        let mut buf = BytesMut::with_capacity(CHALLENGE_TOKEN_BYTES);
        buf.put_u64_le(self.client_id);
        buf.put_slice(&self.user_data);
        buf.resize(CHALLENGE_TOKEN_BYTES - MAC_BYTES, 0);
        let sealed = crypto::encrypt(&buf, &[], challenge_sequence, key)?;
        Ok(Bytes::from(sealed))
    }

    pub fn open(sealed: &[u8], challenge_sequence: u64, key: &Key) -> Result<Self> {
        if sealed.len() != CHALLENGE_TOKEN_BYTES {
            return Err(NetError::token("challenge token has the wrong size"));
        }
        let plain = crypto::decrypt(sealed, &[], challenge_sequence, key)?;
        let mut buf = Bytes::from(plain);
        let client_id = buf.get_u64_le();
        let mut user_data = [0u8; USER_DATA_BYTES];
        buf.copy_to_slice(&mut user_data);
        Ok(Self { client_id, user_data })
    }
}

// ---------------------------------------------------------------------------
// Token authority
// ---------------------------------------------------------------------------

/// Issues connect tokens for a set of dedicated servers sharing `private_key`.
#[derive(Clone)]
pub struct TokenFactory {
    protocol_id: u64,
    private_key: Key,
}

impl std::fmt::Debug for TokenFactory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenFactory")
            .field("protocol_id", &self.protocol_id)
            .finish_non_exhaustive()
    }
}

/// Parameters for one token
#[derive(Debug, Clone)]
pub struct TokenRequest<'a> {
    pub client_id: u64,
    pub server_addresses: &'a [SocketAddr],
    pub expire_seconds: u64,
    pub timeout_seconds: i32,
    pub sequence: u64,
    pub user_data: &'a [u8],
}

impl TokenFactory {
    pub fn new(protocol_id: u64, private_key: Key) -> Self {
        Self {
            protocol_id,
            private_key,
        }
    }

    pub fn protocol_id(&self) -> u64 {
        self.protocol_id
    }

    /// Token created now, valid for `request.expire_seconds`
    pub fn generate(&self, request: &TokenRequest<'_>) -> Result<Bytes> {
        self.generate_at(unix_timestamp(), request)
    }

    /// Token created at `create_timestamp` (Unix seconds)
    pub fn generate_at(&self, create_timestamp: u64, request: &TokenRequest<'_>) -> Result<Bytes> {
        if request.user_data.len() > USER_DATA_BYTES {
            return Err(NetError::token(format!("user data exceeds {USER_DATA_BYTES} bytes")));
        }
        let mut user_data = [0u8; USER_DATA_BYTES];
        user_data[..request.user_data.len()].copy_from_slice(request.user_data);

        let expire_timestamp = create_timestamp + request.expire_seconds;
        let private = PrivateConnectToken {
            client_id: request.client_id,
            timeout_seconds: request.timeout_seconds,
            server_addresses: request.server_addresses.to_vec(),
            client_to_server_key: crypto::generate_key(),
            server_to_client_key: crypto::generate_key(),
            user_data,
        };
        let private_data = private.seal(self.protocol_id, expire_timestamp, request.sequence, &self.private_key)?;

        ConnectToken {
            protocol_id: self.protocol_id,
            create_timestamp,
            expire_timestamp,
            sequence: request.sequence,
            private_data,
            timeout_seconds: request.timeout_seconds,
            server_addresses: private.server_addresses,
            client_to_server_key: private.client_to_server_key,
            server_to_client_key: private.server_to_client_key,
        }
        .write()
    }
}

// ---------------------------------------------------------------------------
// Address and key encoding
// ---------------------------------------------------------------------------

fn check_addresses(addresses: &[SocketAddr]) -> Result<()> {
    if addresses.is_empty() || addresses.len() > MAX_SERVERS_PER_CONNECT {
        return Err(NetError::token(format!(
            "token needs 1..={MAX_SERVERS_PER_CONNECT} server addresses, got {}",
            addresses.len()
        )));
    }
    Ok(())
}

fn write_addresses(buf: &mut BytesMut, addresses: &[SocketAddr]) {
    buf.put_u32_le(addresses.len() as u32);
    for address in addresses {
        match address {
            SocketAddr::V4(v4) => {
                buf.put_u8(ADDRESS_IPV4);
                buf.put_slice(&v4.ip().octets());
                buf.put_u16_le(v4.port());
            }
            SocketAddr::V6(v6) => {
                buf.put_u8(ADDRESS_IPV6);
                for segment in v6.ip().segments() {
                    buf.put_u16_le(segment);
                }
                buf.put_u16_le(v6.port());
            }
        }
    }
}

fn read_addresses(buf: &mut Bytes) -> Result<Vec<SocketAddr>> {
    if buf.remaining() < 4 {
        return Err(NetError::token("address list truncated"));
    }
    let count = buf.get_u32_le() as usize;
    if count == 0 || count > MAX_SERVERS_PER_CONNECT {
        return Err(NetError::token(format!("invalid server address count {count}")));
    }

    let mut addresses = Vec::with_capacity(count);
    for _ in 0..count {
        if !buf.has_remaining() {
            return Err(NetError::token("address list truncated"));
        }
        let address = match buf.get_u8() {
            ADDRESS_IPV4 if buf.remaining() >= 6 => {
                let mut octets = [0u8; 4];
                buf.copy_to_slice(&mut octets);
                SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::from(octets), buf.get_u16_le()))
            }
            ADDRESS_IPV6 if buf.remaining() >= 18 => {
                let mut segments = [0u16; 8];
                for segment in &mut segments {
                    *segment = buf.get_u16_le();
                }
                SocketAddr::V6(SocketAddrV6::new(Ipv6Addr::from(segments), buf.get_u16_le(), 0, 0))
            }
            kind => return Err(NetError::token(format!("bad address type {kind}"))),
        };
        addresses.push(address);
    }
    Ok(addresses)
}

fn read_key(buf: &mut Bytes) -> Result<Key> {
    if buf.remaining() < KEY_BYTES {
        return Err(NetError::token("key truncated"));
    }
    let mut key = [0u8; KEY_BYTES];
    buf.copy_to_slice(&mut key);
    Ok(key)
}
