//! # pgwire-protocol
//!
//! Pure implementation of the PostgreSQL frontend/backend protocol, version 3.
//!
//! This crate encodes the messages a client sends and decodes the messages a
//! server returns. It performs no I/O and makes no assumptions about the async
//! runtime; the framing and socket layers live in `pgwire-codec`.
//!
//! ## Features
//!
//! - Startup, password, and SASL authentication messages
//! - Simple query and extended query (Parse/Bind/Describe/Execute/Sync/Close)
//! - Out-of-band `CancelRequest`
//! - Backend message decoding including `ErrorResponse` field maps
//! - Well-known SQLSTATE codes
//!
//! ## Example
//!
//! ```rust
//! use bytes::BytesMut;
//! use pgwire_protocol::FrontendMessage;
//!
//! let mut buf = BytesMut::new();
//! FrontendMessage::Query("SELECT 1").encode(&mut buf);
//! assert_eq!(buf[0], b'Q');
//! ```

#![warn(missing_docs)]
#![deny(unsafe_code)]

pub mod backend;
pub mod codec;
pub mod error;
pub mod frontend;
pub mod sqlstate;

pub use backend::{
    AuthenticationRequest, BackendKeyData, BackendMessage, DataRow, ErrorFields, FieldDescription,
    TransactionStatus,
};
pub use error::ProtocolError;
pub use frontend::{FrontendMessage, StartupMessage, Target};

/// Protocol version 3.0 as sent in the startup packet.
pub const PROTOCOL_VERSION: i32 = 196_608;

/// Magic "protocol version" identifying a cancel request.
pub const CANCEL_REQUEST_CODE: i32 = 80_877_102;

/// Size of a backend message header: one tag byte plus a 4-byte length.
pub const HEADER_SIZE: usize = 5;

/// Largest backend message accepted by the decoder (1 GiB).
pub const MAX_MESSAGE_SIZE: usize = 1 << 30;
