//! Authentication error types.

use thiserror::Error;

/// Errors that can occur during authentication.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[non_exhaustive]
pub enum AuthError {
    /// The server requested a password but none was configured.
    #[error("server requested a password but none was provided")]
    MissingPassword,

    /// The server requested an authentication method this client lacks.
    #[error("unsupported authentication method: {0}")]
    UnsupportedMethod(String),

    /// None of the offered SASL mechanisms is supported.
    #[error("no supported SASL mechanism among: {0}")]
    UnsupportedMechanism(String),

    /// A SCRAM message from the server could not be parsed.
    #[error("invalid SCRAM message from server: {0}")]
    InvalidServerMessage(String),

    /// The server nonce does not extend the client nonce.
    #[error("SCRAM server nonce does not match client nonce")]
    NonceMismatch,

    /// The server could not prove knowledge of the password.
    #[error("SCRAM server signature verification failed")]
    ServerSignatureMismatch,

    /// The server reported a SCRAM error attribute.
    #[error("SCRAM authentication failed: {0}")]
    ServerError(String),
}
