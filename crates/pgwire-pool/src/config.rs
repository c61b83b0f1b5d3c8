//! Pool configuration.

use std::time::Duration;

use pgwire_client::Config;

use crate::breaker::CircuitBreakerConfig;
use crate::error::PoolError;

/// Default number of connections.
pub const DEFAULT_POOL_SIZE: usize = 10;

/// Default limit on requests queued for a connection.
pub const DEFAULT_MAX_WAITERS: usize = 1024;

/// Environment variable holding the connection string.
pub const ENV_DATABASE_URL: &str = "DATABASE_URL";

/// Environment variable overriding the pool size.
pub const ENV_POOL_SIZE: &str = "PG_POOL_SIZE";

/// Configuration for the connection pool.
///
/// This struct is marked `#[non_exhaustive]`; use the builder methods or
/// [`Default::default()`] to construct instances.
#[derive(Debug, Clone)]
#[non_exhaustive]
pub struct PoolConfig {
    /// Maximum number of connections, counting ones being established.
    pub size: usize,

    /// Maximum number of requests waiting for a connection.
    pub max_waiters: usize,

    /// How long a queued request waits before giving up. `None` waits until
    /// a connection is handed over or the pool shuts down.
    pub acquire_timeout: Option<Duration>,

    /// Circuit breaker tuning.
    pub breaker: CircuitBreakerConfig,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            size: DEFAULT_POOL_SIZE,
            max_waiters: DEFAULT_MAX_WAITERS,
            acquire_timeout: None,
            breaker: CircuitBreakerConfig::default(),
        }
    }
}

impl PoolConfig {
    /// Create a new pool configuration with default values.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the number of connections.
    #[must_use]
    pub fn size(mut self, size: usize) -> Self {
        self.size = size;
        self
    }

    /// Set the waiter queue limit.
    #[must_use]
    pub fn max_waiters(mut self, max: usize) -> Self {
        self.max_waiters = max;
        self
    }

    /// Bound how long a queued request waits.
    #[must_use]
    pub fn acquire_timeout(mut self, timeout: Duration) -> Self {
        self.acquire_timeout = Some(timeout);
        self
    }

    /// Set the circuit breaker configuration.
    #[must_use]
    pub fn breaker(mut self, breaker: CircuitBreakerConfig) -> Self {
        self.breaker = breaker;
        self
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), PoolError> {
        if self.size == 0 {
            return Err(PoolError::Configuration(
                "size must be greater than 0".into(),
            ));
        }
        if self.acquire_timeout.is_some_and(|t| t.is_zero()) {
            return Err(PoolError::Configuration(
                "acquire_timeout must be greater than 0".into(),
            ));
        }
        self.breaker.validate()
    }

    /// Read `DATABASE_URL` and `PG_POOL_SIZE` from the environment.
    ///
    /// A missing `DATABASE_URL` yields the default client configuration
    /// (`postgres@localhost:5432`); a missing `PG_POOL_SIZE` keeps the
    /// default size.
    pub fn from_env() -> Result<(Config, Self), PoolError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<(Config, Self), PoolError> {
        let client = match lookup(ENV_DATABASE_URL).filter(|url| !url.trim().is_empty()) {
            Some(url) => Config::from_dsn(&url)
                .map_err(|e| PoolError::Configuration(format!("{ENV_DATABASE_URL}: {e}")))?,
            None => Config::default(),
        };

        let mut pool = Self::default();
        if let Some(raw) = lookup(ENV_POOL_SIZE) {
            pool.size = raw.trim().parse().map_err(|_| {
                PoolError::Configuration(format!("invalid integer for {ENV_POOL_SIZE}: {raw:?}"))
            })?;
        }
        pool.validate()?;

        tracing::debug!(
            host = %client.host,
            port = client.port,
            size = pool.size,
            "pool configuration loaded from environment"
        );
        Ok((client, pool))
    }
}
