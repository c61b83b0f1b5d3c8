//! Codec error types.

use std::io;

use pgwire_protocol::ProtocolError;
use thiserror::Error;

/// Errors raised by the framing and socket layer.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum CodecError {
    /// Underlying socket failure.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Malformed message.
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// A readiness wait did not complete before its deadline.
    #[error("timed out waiting for socket to become {0}")]
    Timeout(&'static str),

    /// The peer closed the connection.
    #[error("connection closed by peer")]
    ConnectionClosed,
}

impl CodecError {
    /// Whether this error was a deadline expiry.
    #[must_use]
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout(_))
    }
}
