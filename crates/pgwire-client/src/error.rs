//! Client error types.
//!
//! Errors fall into two classes. *Infrastructure* errors (transport
//! failures, timeouts, protocol desynchronization, fatal server errors)
//! mean the session can no longer be trusted; the driver closes it.
//! *Domain* errors are ordinary `ERROR` responses from the server
//! (constraint violations, syntax errors); the session stays usable.

use pgwire_protocol::{ErrorFields, sqlstate};
use thiserror::Error;

/// Classification of the server errors callers commonly branch on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DbErrorCode {
    /// SQLSTATE 23505.
    UniqueViolation,
    /// SQLSTATE 23503.
    ForeignKeyViolation,
    /// SQLSTATE 23502.
    NotNullViolation,
    /// Any other SQLSTATE.
    Unknown,
}

impl DbErrorCode {
    /// Map a SQLSTATE to its classification.
    #[must_use]
    pub fn from_sqlstate(code: &str) -> Self {
        match code {
            sqlstate::UNIQUE_VIOLATION => Self::UniqueViolation,
            sqlstate::FOREIGN_KEY_VIOLATION => Self::ForeignKeyViolation,
            sqlstate::NOT_NULL_VIOLATION => Self::NotNullViolation,
            _ => Self::Unknown,
        }
    }
}

/// An error reported by the server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DbError {
    /// Classified code.
    pub code: DbErrorCode,
    /// Raw five-character SQLSTATE.
    pub sqlstate: String,
    /// Severity (`ERROR`, `FATAL`, `PANIC`).
    pub severity: String,
    /// Primary message.
    pub message: String,
    /// Optional detail.
    pub detail: Option<String>,
    /// Violated constraint, when applicable.
    pub constraint: Option<String>,
}

impl DbError {
    /// Whether the server terminated the session along with this error.
    #[must_use]
    pub fn is_fatal(&self) -> bool {
        matches!(self.severity.as_str(), "FATAL" | "PANIC")
    }
}

impl From<ErrorFields> for DbError {
    fn from(fields: ErrorFields) -> Self {
        Self {
            code: DbErrorCode::from_sqlstate(&fields.code),
            sqlstate: fields.code,
            severity: fields.severity,
            message: fields.message,
            detail: fields.detail,
            constraint: fields.constraint,
        }
    }
}

impl std::fmt::Display for DbError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} {}: {}", self.severity, self.sqlstate, self.message)?;
        if let Some(detail) = &self.detail {
            write!(f, " ({detail})")?;
        }
        Ok(())
    }
}

/// Errors that can occur during client operations.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// Session could not be established.
    #[error("connection failed: {0}")]
    Connection(String),

    /// The session was closed and cannot be used.
    #[error("connection closed")]
    ConnectionClosed,

    /// Authentication exchange failed on the client side.
    #[error("authentication failed: {0}")]
    Authentication(#[from] pgwire_auth::AuthError),

    /// Malformed or out-of-sequence protocol message.
    #[error("protocol error: {0}")]
    Protocol(#[from] pgwire_protocol::ProtocolError),

    /// Framing or socket failure.
    #[error("codec error: {0}")]
    Codec(#[from] pgwire_codec::CodecError),

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// A network wait exceeded its deadline.
    #[error("timed out during {0}")]
    Timeout(&'static str),

    /// Server returned an error.
    #[error("database error: {0}")]
    Database(DbError),

    /// Invalid configuration.
    #[error("configuration error: {0}")]
    Config(String),

    /// Offloaded work did not complete.
    #[error("offloaded task failed: {0}")]
    Offload(String),

    /// A result value could not be decoded.
    #[error("cannot decode {value:?} as {target}")]
    Decode {
        /// Raw text.
        value: String,
        /// Target type name.
        target: &'static str,
    },
}

impl Error {
    /// Whether this error signals an unhealthy session or server.
    ///
    /// Everything except a non-fatal server error response counts.
    #[must_use]
    pub fn is_infrastructure(&self) -> bool {
        match self {
            Self::Database(db) => db.is_fatal(),
            Self::Decode { .. } | Self::Config(_) => false,
            _ => true,
        }
    }

    /// Whether this error was a deadline expiry.
    #[must_use]
    pub fn is_timeout(&self) -> bool {
        match self {
            Self::Timeout(_) => true,
            Self::Codec(e) => e.is_timeout(),
            _ => false,
        }
    }

    /// The server error, if this is one.
    #[must_use]
    pub fn as_db_error(&self) -> Option<&DbError> {
        match self {
            Self::Database(db) => Some(db),
            _ => None,
        }
    }

    /// Classified server error code, if this is a server error.
    #[must_use]
    pub fn db_code(&self) -> Option<DbErrorCode> {
        self.as_db_error().map(|db| db.code)
    }

    /// Whether this is a server error with the given SQLSTATE.
    #[must_use]
    pub fn is_sqlstate(&self, code: &str) -> bool {
        self.as_db_error().is_some_and(|db| db.sqlstate == code)
    }
}

impl From<DbError> for Error {
    fn from(err: DbError) -> Self {
        Self::Database(err)
    }
}

/// Result type for client operations.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use pgwire_codec::CodecError;

    #[test]
    fn test_sqlstate_mapping() {
        assert_eq!(DbErrorCode::from_sqlstate("23505"), DbErrorCode::UniqueViolation);
        assert_eq!(DbErrorCode::from_sqlstate("23503"), DbErrorCode::ForeignKeyViolation);
        assert_eq!(DbErrorCode::from_sqlstate("23502"), DbErrorCode::NotNullViolation);
        assert_eq!(DbErrorCode::from_sqlstate("42601"), DbErrorCode::Unknown);
        assert_eq!(DbErrorCode::from_sqlstate(""), DbErrorCode::Unknown);
    }

    #[test]
    fn test_domain_errors_are_not_infrastructure() {
        let err = Error::Database(ErrorFields::error("23505", "duplicate key").into());
        assert!(!err.is_infrastructure());
        assert_eq!(err.db_code(), Some(DbErrorCode::UniqueViolation));
        assert!(err.is_sqlstate("23505"));
    }

    #[test]
    fn test_fatal_server_error_is_infrastructure() {
        let mut fields = ErrorFields::error("57P01", "terminating connection");
        fields.severity = "FATAL".into();
        let err = Error::Database(fields.into());
        assert!(err.is_infrastructure());
    }

    #[test]
    fn test_transport_errors_are_infrastructure() {
        assert!(Error::ConnectionClosed.is_infrastructure());
        assert!(Error::Timeout("query").is_infrastructure());
        assert!(Error::Codec(CodecError::Timeout("readable")).is_timeout());
        assert!(Error::Connection("refused".into()).is_infrastructure());
        assert_eq!(Error::ConnectionClosed.db_code(), None);
    }

    #[test]
    fn test_db_error_display() {
        let mut fields = ErrorFields::error("23505", "duplicate key value");
        fields.detail = Some("Key (email)=(a@b) already exists.".into());
        let db: DbError = fields.into();
        assert_eq!(
            db.to_string(),
            "ERROR 23505: duplicate key value (Key (email)=(a@b) already exists.)"
        );
    }
}
