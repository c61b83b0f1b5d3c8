//! # pgwire-testing
//!
//! Test infrastructure for the pgwire crates.
//!
//! The centerpiece is [`MockPgServer`], an in-process PostgreSQL protocol
//! server with scripted responses and fault injection, so driver and pool
//! behavior can be tested without a database.
//!
//! ## Example
//!
//! ```rust,ignore
//! use pgwire_testing::{AuthMode, MockPgServer, MockResponse};
//!
//! #[tokio::test]
//! async fn test_with_mock_server() {
//!     let server = MockPgServer::builder()
//!         .with_auth(AuthMode::Md5("secret".into()))
//!         .with_response(
//!             "INSERT INTO users (email) VALUES ($1)",
//!             MockResponse::error("23505", "duplicate key value violates unique constraint"),
//!         )
//!         .build()
//!         .await
//!         .unwrap();
//!
//!     // Point a client at server.host() / server.port()...
//! }
//! ```

#![warn(missing_docs)]
#![deny(unsafe_code)]

pub mod mock_server;

pub use mock_server::{
    AuthMode, MockEvent, MockPgServer, MockResponse, MockServerBuilder, MockServerConfig,
    MockServerError,
};
