//! Error types for the netlane transport

use std::fmt;
use thiserror::Error;

pub use netlane_core::CoreError;

/// Result type for netlane operations
pub type Result<T> = std::result::Result<T, NetError>;

/// Errors surfaced by the handshake layer, links and actors.
///
/// Handshake rejections and timeouts are client states, not errors; packets
/// failing authentication are dropped without one.
#[derive(Error, Debug)]
pub enum NetError {
    /// I/O related errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Reliability layer errors, including queue backpressure
    #[error(transparent)]
    Core(#[from] CoreError),

    /// Malformed or unexpected packet
    #[error("Protocol error: {message}")]
    Protocol { message: String },

    /// Connection-related errors
    #[error("Connection error: {kind}")]
    Connection { kind: ConnectionError },

    /// Configuration errors
    #[error("Configuration error: {message}")]
    Config { message: String },

    /// AEAD failure
    #[error("Crypto error: {message}")]
    Crypto { message: String },

    /// Connect token could not be built or parsed
    #[error("Token error: {message}")]
    Token { message: String },

    /// Internal errors that shouldn't normally occur
    #[error("Internal error: {message}")]
    Internal { message: String },
}

/// Specific connection error types
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionError {
    /// Actor or link already shut down
    Closed,
    /// Operation requires a connected link
    NotConnected,
    /// `connect` called while not disconnected
    AlreadyConnected,
    /// Client slot index out of range or empty
    InvalidClient,
    /// Server not started
    NotRunning,
}

impl fmt::Display for ConnectionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionError::Closed => write!(f, "connection closed"),
            ConnectionError::NotConnected => write!(f, "not connected"),
            ConnectionError::AlreadyConnected => write!(f, "already connected"),
            ConnectionError::InvalidClient => write!(f, "invalid client index"),
            ConnectionError::NotRunning => write!(f, "server not running"),
        }
    }
}

impl NetError {
    /// Create a protocol error
    pub fn protocol(message: impl Into<String>) -> Self {
        NetError::Protocol {
            message: message.into(),
        }
    }

    /// Create a connection error
    pub fn connection(kind: ConnectionError) -> Self {
        NetError::Connection { kind }
    }

    /// Create a config error
    pub fn config(message: impl Into<String>) -> Self {
        NetError::Config {
            message: message.into(),
        }
    }

    /// Create a crypto error
    pub fn crypto(message: impl Into<String>) -> Self {
        NetError::Crypto {
            message: message.into(),
        }
    }

    /// Create a token error
    pub fn token(message: impl Into<String>) -> Self {
        NetError::Token {
            message: message.into(),
        }
    }

    /// Create an internal error
    pub fn internal(message: impl Into<String>) -> Self {
        NetError::Internal {
            message: message.into(),
        }
    }

    /// Check if this is a recoverable error
    pub fn is_recoverable(&self) -> bool {
        match self {
            NetError::Io(e) => {
                matches!(
                    e.kind(),
                    std::io::ErrorKind::WouldBlock
                        | std::io::ErrorKind::TimedOut
                        | std::io::ErrorKind::Interrupted
                        | std::io::ErrorKind::ConnectionReset
                )
            }
            NetError::Core(e) => e.is_backpressure() || e.is_protocol(),
            NetError::Protocol { .. } | NetError::Crypto { .. } => true,
            _ => false,
        }
    }

    /// Check if the link or actor is gone
    pub fn is_closed(&self) -> bool {
        matches!(
            self,
            NetError::Connection {
                kind: ConnectionError::Closed
            }
        )
    }

    /// Check if this is reliable queue backpressure
    pub fn is_backpressure(&self) -> bool {
        matches!(self, NetError::Core(e) if e.is_backpressure())
    }
}
