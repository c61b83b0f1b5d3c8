//! Pool error types.

use std::time::Duration;

use pgwire_client::{DbErrorCode, Error};
use thiserror::Error;

/// Errors that can occur during pool operations.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum PoolError {
    /// The pool was shut down.
    #[error("pool is shutting down")]
    PoolShuttingDown,

    /// The circuit breaker is rejecting new work.
    #[error("circuit breaker is open")]
    CircuitOpen,

    /// A new session could not be established.
    #[error("failed to create connection: {0}")]
    ConnectFailed(#[source] Error),

    /// Too many requests are already waiting for a connection.
    #[error("waiter queue full ({max} waiting)")]
    PoolExhausted {
        /// Configured waiter limit.
        max: usize,
    },

    /// No connection was handed over within the acquire timeout.
    #[error("connection acquisition timeout after {0:?}")]
    AcquisitionTimeout(Duration),

    /// Invalid pool configuration.
    #[error("pool configuration error: {0}")]
    Configuration(String),

    /// A statement failed on a pooled connection.
    #[error(transparent)]
    Query(#[from] Error),
}

impl PoolError {
    /// Whether this is an infrastructure failure rather than an ordinary
    /// server error a caller can branch on.
    ///
    /// Pool exhaustion and an open circuit count, though only connect and
    /// session failures are fed back into the breaker.
    #[must_use]
    pub fn is_infrastructure(&self) -> bool {
        match self {
            Self::ConnectFailed(_)
            | Self::CircuitOpen
            | Self::PoolExhausted { .. }
            | Self::AcquisitionTimeout(_) => true,
            Self::Query(e) => e.is_infrastructure(),
            Self::PoolShuttingDown | Self::Configuration(_) => false,
        }
    }

    /// Classified server error code, if a statement failed on the server.
    #[must_use]
    pub fn db_code(&self) -> Option<DbErrorCode> {
        match self {
            Self::Query(e) | Self::ConnectFailed(e) => e.db_code(),
            _ => None,
        }
    }

    /// The underlying driver error, if any.
    #[must_use]
    pub fn as_client_error(&self) -> Option<&Error> {
        match self {
            Self::Query(e) | Self::ConnectFailed(e) => Some(e),
            _ => None,
        }
    }
}

/// Result type for pool operations.
pub type Result<T> = std::result::Result<T, PoolError>;

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_classification() {
        assert!(PoolError::CircuitOpen.is_infrastructure());
        assert!(PoolError::ConnectFailed(Error::ConnectionClosed).is_infrastructure());
        assert!(PoolError::Query(Error::Timeout("read")).is_infrastructure());
        assert!(!PoolError::PoolShuttingDown.is_infrastructure());
        assert!(PoolError::PoolExhausted { max: 4 }.is_infrastructure());
        assert!(PoolError::AcquisitionTimeout(Duration::from_secs(1)).is_infrastructure());
        assert!(!PoolError::Query(Error::Config("x".into())).is_infrastructure());
    }

    #[test]
    fn test_display() {
        assert_eq!(
            PoolError::PoolExhausted { max: 8 }.to_string(),
            "waiter queue full (8 waiting)"
        );
        assert_eq!(
            PoolError::Query(Error::ConnectionClosed).to_string(),
            "connection closed"
        );
        assert!(PoolError::CircuitOpen.db_code().is_none());
    }
}
