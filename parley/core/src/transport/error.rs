//! Transport errors

use std::io;

use thiserror::Error;

/// Errors raised by the socket transport
#[derive(Debug, Error)]
pub enum TransportError {
    /// Could not reach the daemon socket
    #[error("connection failed: {0}")]
    ConnectionFailed(String),

    /// The peer closed the connection
    #[error("connection closed")]
    ConnectionClosed,

    /// A single frame exceeded the configured limit
    #[error("frame too large: {size} bytes (max: {max})")]
    FrameTooLarge {
        /// Observed size (lower bound when the frame was still incomplete)
        size: usize,
        /// Configured maximum
        max: usize,
    },

    /// A frame was not valid JSON or not a valid envelope
    #[error("malformed frame: {0}")]
    Malformed(String),

    /// Serialization of an outbound message failed
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Peer credentials did not match
    #[error("authentication failed: {0}")]
    AuthenticationFailed(String),

    /// Operation not valid in the current state
    #[error("invalid state: {0}")]
    InvalidState(String),

    /// Waiting for a reply took too long
    #[error("timed out: {0}")]
    Timeout(String),

    /// Underlying socket error
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl TransportError {
    /// Whether this error came from a bad inbound frame (the connection survives)
    #[must_use]
    pub fn is_frame_error(&self) -> bool {
        matches!(self, Self::FrameTooLarge { .. } | Self::Malformed(_))
    }
}
