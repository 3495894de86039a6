//! Pure synchronous reliability engine for netlane.
//!
//! Sequenced packets with ack bitfields, fragmentation, RTT/loss/bandwidth
//! estimation and two message channels. No tokio, no async, no I/O: time is
//! passed in by the caller and packets are moved with `drain_output` /
//! `receive_packet`. Depends only on `bytes` and `tracing`.
//!
//! ```text
//! ┌──────────────────────────────────────────┐
//! │  netlane-core                            │
//! │                                          │
//! │  endpoint         ← channel multiplexer  │
//! │  channel          ← reliable/unreliable  │
//! │  controller       ← acks, fragments, RTT │
//! │  sequence_buffer  ← u16 ring window      │
//! │  protocol         ← wire types           │
//! └──────────────────────────────────────────┘
//! ```

pub mod channel;
pub mod config;
pub mod controller;
pub mod endpoint;
pub mod error;
pub mod protocol;
pub mod sequence_buffer;
pub mod telemetry;

pub use channel::{MessageChannel, QosType, ReliableChannel, UnreliableChannel};
pub use config::{ChannelConfig, ReliableConfig};
pub use controller::PacketController;
pub use endpoint::{ReceivedMessage, ReliableEndpoint};
pub use error::{CoreError, CoreResult};
pub use protocol::*;
pub use sequence_buffer::SequenceBuffer;
pub use telemetry::EndpointTelemetry;
