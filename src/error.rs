//! Error types for rpcwire-server.

use thiserror::Error;

/// Main error type for all connection engine operations.
#[derive(Debug, Error)]
pub enum RpcwireError {
    /// I/O error during socket operations.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON error (configuration loading).
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// MsgPack serialization error.
    #[error("MsgPack encode error: {0}")]
    MsgPackEncode(#[from] rmp_serde::encode::Error),

    /// MsgPack deserialization error.
    #[error("MsgPack decode error: {0}")]
    MsgPackDecode(#[from] rmp_serde::decode::Error),

    /// Protocol error (bad preamble, truncated frame, unexpected state).
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Frame length prefix above the configured limit.
    #[error("Frame size {size} exceeds maximum {max}")]
    FrameTooLarge { size: u32, max: u32 },

    /// SASL handshake, wrap or unwrap failure.
    #[error("SASL error: {0}")]
    Sasl(String),

    /// Authentication policy rejected the connection.
    #[error("Access denied: {0}")]
    AccessDenied(String),

    /// Connection header named a service nobody registered.
    #[error("Unknown service: {0}")]
    UnknownService(String),

    /// Preamble carried a protocol version this server does not speak.
    #[error("Unsupported protocol version: {0}")]
    UnsupportedVersion(u8),

    /// Connection closed (locally or by the peer).
    #[error("Connection closed")]
    ConnectionClosed,

    /// Outbound queue for this connection is full. The frame was not sent,
    /// so the connection cannot continue.
    #[error("Backpressure: {pending} frames pending")]
    Backpressure { pending: usize },
}

impl RpcwireError {
    /// Whether the read loop must close the connection after this error.
    ///
    /// Call-level failures are answered with an exception response and never
    /// surface here. `ConnectionClosed` only reports that somebody else
    /// already closed the connection.
    pub fn is_connection_fatal(&self) -> bool {
        !matches!(self, RpcwireError::ConnectionClosed)
    }
}

/// Result type alias using RpcwireError.
pub type Result<T> = std::result::Result<T, RpcwireError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backpressure_is_fatal() {
        assert!(RpcwireError::Backpressure { pending: 3 }.is_connection_fatal());
        assert!(RpcwireError::Sasl("bad token".into()).is_connection_fatal());
        assert!(!RpcwireError::ConnectionClosed.is_connection_fatal());
    }

    #[test]
    fn test_display_messages() {
        let err = RpcwireError::FrameTooLarge { size: 10, max: 5 };
        assert_eq!(err.to_string(), "Frame size 10 exceeds maximum 5");
        let err = RpcwireError::UnknownService("Admin".into());
        assert!(err.to_string().contains("Admin"));
    }
}
