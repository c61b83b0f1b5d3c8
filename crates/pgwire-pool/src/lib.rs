//! # pgwire-pool
//!
//! Async PostgreSQL connection pool with a circuit breaker.
//!
//! The pool hands out [`Lease`]s over [`pgwire_client::Connection`]s. A lease
//! is the only way to reach its connection and is returned exactly once, on
//! [`Lease::release`] or drop.
//!
//! ## Features
//!
//! - Lazy connection creation up to a fixed size, LIFO reuse of idle
//!   connections, and a bounded FIFO queue of waiters
//! - A [`CircuitBreaker`] that fails acquires fast after repeated connection
//!   or network failures and lets a single probe test recovery
//! - Server errors such as unique violations pass through without tripping
//!   the breaker; the connection stays in the pool
//! - [`Transaction`] with commit, rollback and discard-on-drop
//! - Idempotent [`Pool::shutdown`]
//!
//! ## Example
//!
//! ```rust,ignore
//! use std::time::Duration;
//! use pgwire_pool::{Pool, PoolConfig, Transaction};
//!
//! let (client, config) = PoolConfig::from_env()?;
//! let pool = Pool::new(client, config)?;
//!
//! let rows = pool
//!     .query("SELECT name FROM users WHERE id = $1", &[Some("7")], Duration::from_secs(2))
//!     .await?;
//!
//! let mut tx = Transaction::begin(&pool, Duration::from_secs(2)).await?;
//! tx.query("UPDATE accounts SET balance = balance - 10 WHERE id = $1", &[Some("7")])
//!     .await?;
//! tx.commit().await?;
//!
//! pool.shutdown();
//! ```

#![warn(missing_docs)]
#![deny(unsafe_code)]

pub mod breaker;
pub mod config;
pub mod error;
pub mod pool;
pub mod transaction;

pub use breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitState};
pub use config::PoolConfig;
pub use error::{PoolError, Result};
pub use pool::{Lease, Pool, PoolBuilder, PoolStatus};
pub use transaction::Transaction;
