//! # pgwire-codec
//!
//! Async framing layer for PostgreSQL protocol messages.
//!
//! This crate turns a raw byte stream into [`BackendMessage`]s and queues
//! outgoing [`FrontendMessage`]s, without ever blocking the calling executor.
//!
//! ## Features
//!
//! - Message reassembly across TCP segment boundaries
//! - Integration with tokio-util's codec framework
//! - Readiness-driven I/O: every wait suspends on socket readiness with a deadline
//! - A [`Socket`] abstraction over TCP, Unix domain sockets, and test fakes
//!
//! ## Architecture
//!
//! ```text
//! Socket (readiness) → MessageIo (buffers) → PgCodec (framing) → Client
//! ```
//!
//! [`MessageIo`] owns one read buffer and one write buffer. Writes are
//! queued with [`MessageIo::queue`] and pushed out with [`MessageIo::flush`];
//! reads pull everything currently available on each readiness wakeup so that
//! several messages can be decoded per wakeup.
//!
//! [`BackendMessage`]: pgwire_protocol::BackendMessage
//! [`FrontendMessage`]: pgwire_protocol::FrontendMessage

#![warn(missing_docs)]
#![deny(unsafe_code)]

pub mod error;
pub mod io;
pub mod message_codec;
pub mod socket;

pub use error::CodecError;
pub use io::MessageIo;
pub use message_codec::PgCodec;
pub use socket::{Socket, Stream};
