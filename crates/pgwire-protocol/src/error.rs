//! Protocol-level error types.

use thiserror::Error;

/// Errors that can occur while encoding or decoding protocol messages.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[non_exhaustive]
pub enum ProtocolError {
    /// The message body ended before a field could be read.
    #[error("unexpected end of message: expected {expected} more bytes, {actual} available")]
    UnexpectedEof {
        /// Bytes required.
        expected: usize,
        /// Bytes remaining.
        actual: usize,
    },

    /// The message tag is not a known backend message.
    #[error("unknown backend message tag: {0:#04x}")]
    UnknownMessage(u8),

    /// The length prefix is smaller than the length field itself.
    #[error("invalid message length: {0}")]
    InvalidLength(i32),

    /// The message exceeds the configured size limit.
    #[error("message too large: {size} bytes (max {max})")]
    MessageTooLarge {
        /// Declared size.
        size: usize,
        /// Maximum accepted size.
        max: usize,
    },

    /// A string field was not valid UTF-8.
    #[error("invalid UTF-8 in {0}")]
    InvalidUtf8(&'static str),

    /// A field had an unrecognized value.
    #[error("invalid {field}: {value}")]
    InvalidField {
        /// Field name.
        field: &'static str,
        /// Offending value.
        value: i64,
    },

    /// A valid message arrived in a state that does not accept it.
    #[error("unexpected message: {0}")]
    UnexpectedMessage(String),
}
