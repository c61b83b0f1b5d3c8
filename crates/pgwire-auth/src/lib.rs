//! # pgwire-auth
//!
//! Authentication exchanges for PostgreSQL connections.
//!
//! This crate computes the client side of each supported password method,
//! isolated from connection logic so it can be tested without a server.
//!
//! ## Supported Authentication Methods
//!
//! | Method | Server request | Description |
//! |--------|----------------|-------------|
//! | Trust | `AuthenticationOk` | No credentials exchanged |
//! | Cleartext | `AuthenticationCleartextPassword` | Password sent as-is |
//! | MD5 | `AuthenticationMD5Password` | Salted double MD5 digest |
//! | SCRAM-SHA-256 | `AuthenticationSASL` | RFC 7677, no channel binding |
//!
//! The SCRAM salted-password derivation is deliberately exposed as a free
//! function, [`salted_password`], so callers can run it off the async
//! executor.

#![warn(missing_docs)]
#![deny(unsafe_code)]

pub mod credentials;
pub mod error;
pub mod password;
pub mod scram;

pub use credentials::Credentials;
pub use error::AuthError;
pub use password::md5_password;
pub use scram::{SCRAM_SHA_256, ScramSha256, ServerFirst, salted_password};
