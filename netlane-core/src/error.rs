//! Error types for the netlane reliability engine

use std::fmt;

/// Result type for core operations
pub type CoreResult<T> = std::result::Result<T, CoreError>;

/// Errors produced by the packet controller and message channels.
///
/// Loss, duplication and reordering are normal operating conditions and are
/// never reported here. Malformed or stale packets surface as `Protocol`
/// and callers drop them.
#[derive(Debug, Clone, PartialEq)]
pub enum CoreError {
    /// Malformed packet, bad header or invalid fragment
    Protocol { message: String },
    /// Payload too large or buffer misuse
    Buffer { message: String },
    /// Reliable overflow queue is full; the message was dropped
    QueueExhausted {
        current_depth: usize,
        max_queue_size: usize,
        dropped_message_size: usize,
        channel_id: u8,
    },
    /// Invalid configuration value
    Config { message: String },
}

impl CoreError {
    /// Create a protocol error
    pub fn protocol(message: impl Into<String>) -> Self {
        CoreError::Protocol {
            message: message.into(),
        }
    }

    /// Create a buffer error
    pub fn buffer(message: impl Into<String>) -> Self {
        CoreError::Buffer {
            message: message.into(),
        }
    }

    /// Create a config error
    pub fn config(message: impl Into<String>) -> Self {
        CoreError::Config {
            message: message.into(),
        }
    }

    /// Create a queue exhaustion error
    pub fn queue_exhausted(
        current_depth: usize,
        max_queue_size: usize,
        dropped_message_size: usize,
        channel_id: u8,
    ) -> Self {
        CoreError::QueueExhausted {
            current_depth,
            max_queue_size,
            dropped_message_size,
            channel_id,
        }
    }

    /// True when the caller should throttle instead of treating this as a bug
    pub fn is_backpressure(&self) -> bool {
        matches!(self, CoreError::QueueExhausted { .. })
    }

    /// True for errors caused by a bad inbound packet
    pub fn is_protocol(&self) -> bool {
        matches!(self, CoreError::Protocol { .. })
    }
}

impl fmt::Display for CoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CoreError::Protocol { message } => write!(f, "Protocol error: {message}"),
            CoreError::Buffer { message } => write!(f, "Buffer error: {message}"),
            CoreError::QueueExhausted {
                current_depth,
                max_queue_size,
                dropped_message_size,
                channel_id,
            } => write!(
                f,
                "Reliable message queue exhausted: {current_depth}/{max_queue_size} queued, \
                 dropped {dropped_message_size} bytes on channel {channel_id}"
            ),
            CoreError::Config { message } => write!(f, "Configuration error: {message}"),
        }
    }
}

impl std::error::Error for CoreError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_queue_exhausted_display() {
        let err = CoreError::queue_exhausted(2000, 2000, 120, 0);
        assert!(err.is_backpressure());
        let text = err.to_string();
        assert!(text.contains("2000/2000"));
        assert!(text.contains("120 bytes"));
        assert!(text.contains("channel 0"));
    }
}
