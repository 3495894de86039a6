//! # netlane
//!
//! Encrypted connect-token handshake with reliable and unreliable message
//! channels over UDP, for client/server games.
//!
//! A dedicated web backend hands out connect tokens; clients present them to
//! a dedicated server, finish a challenge/response, and then exchange
//! authenticated, encrypted payloads. On top of the payloads each side runs a
//! reliable endpoint with acks, fragmentation and ordered delivery.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────┐
//! │  netlane  (this crate)                      │
//! │                                             │
//! │  actor          ← tokio tick tasks, handles │
//! │  link           ← handshake + reliability   │
//! │  client/server  ← handshake state machines  │
//! │  token/packet   ← wire formats, AEAD        │
//! │  transport/sim  ← UDP, in-memory, simulator │
//! ├─────────────────────────────────────────────┤
//! │  netlane-core  (dependency)                 │
//! │                                             │
//! │  ReliableEndpoint  ← sync reliability       │
//! │  protocol          ← reliable wire header   │
//! └─────────────────────────────────────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use netlane::{spawn_client, spawn_server, ClientConfig, QosType, ServerConfig};
//! use netlane::{TokenFactory, TokenRequest, UdpFactory};
//! use std::net::SocketAddr;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let protocol_id = 0x1122_3344_5566_7788;
//!     let key = netlane::crypto::generate_key();
//!     let addr: SocketAddr = "127.0.0.1:40000".parse()?;
//!
//!     let (_server, _server_events) =
//!         spawn_server(ServerConfig::new(protocol_id, key, addr), UdpFactory).await?;
//!
//!     let token = TokenFactory::new(protocol_id, key).generate(&TokenRequest {
//!         client_id: 7,
//!         server_addresses: &[addr],
//!         expire_seconds: 30,
//!         timeout_seconds: 5,
//!         sequence: 1,
//!         user_data: &[],
//!     })?;
//!
//!     let (client, mut events) = spawn_client(ClientConfig::new(protocol_id), UdpFactory)?;
//!     client.connect(token).await?;
//!     while let Some(event) = events.recv().await {
//!         if let netlane::ClientLinkEvent::Connected { .. } = event {
//!             client.send(QosType::Reliable, &b"hello"[..]).await?;
//!         }
//!     }
//!     Ok(())
//! }
//! ```

// ── Layer 1: Reliability (re-exported from netlane-core) ───────────────

/// Reliable wire types and constants.
pub use netlane_core::protocol;

/// Direct access to the standalone `netlane-core` crate.
pub use netlane_core;

pub use netlane_core::{EndpointTelemetry, QosType, ReceivedMessage, ReliableEndpoint};

// ── Layer 2: Wire formats & crypto ──────────────────────────────────────

pub mod crypto;
pub mod encryption;
pub mod history;
pub mod packet;
pub mod replay;
pub mod token;
pub use token::{ConnectToken, TokenFactory, TokenRequest};

// ── Layer 3: Configuration & errors ─────────────────────────────────────

pub mod config;
pub mod error;
pub use config::{AddressCheck, ChannelConfig, ClientConfig, ReliableConfig, ServerConfig};
pub use error::{ConnectionError, NetError, Result};

// ── Layer 4: Handshake state machines & links ───────────────────────────

pub mod client;
pub mod datagram;
pub mod link;
pub mod server;
pub use client::{Client, ClientEvent, ClientState};
pub use link::{ClientLink, ClientLinkEvent, ServerLink, ServerLinkEvent};
pub use server::{DisconnectReason, Server, ServerEvent};

// ── Layer 5: Transports & runtime ───────────────────────────────────────

pub mod metrics;
pub mod sim;
pub mod transport;
pub use metrics::{LinkMetrics, MetricsSnapshot};
pub use sim::{NetworkSimulator, SimulatorConfig};
pub use transport::{Transport, TransportFactory};
#[cfg(feature = "tokio")]
pub use transport::{MemoryNetwork, MemoryTransport, UdpFactory, UdpTransport};

#[cfg(feature = "tokio")]
pub mod actor;
#[cfg(feature = "tokio")]
pub use actor::{spawn_client, spawn_server, ClientHandle, ServerHandle};

// ── Version info ────────────────────────────────────────────────────────

pub const VERSION: &str = env!("CARGO_PKG_VERSION");
/// Handshake protocol revision, matching [`packet::constants::VERSION_INFO`]
pub const PROTOCOL_VERSION: &str = "1.01";

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version() {
        assert!(!VERSION.is_empty());
        let version_info = std::str::from_utf8(packet::constants::VERSION_INFO).unwrap();
        assert!(version_info.contains(PROTOCOL_VERSION));
    }
}
