//! Names of statements prepared on the current session, with LRU eviction.
//!
//! ## Lifecycle
//!
//! 1. The first `exec_prepared` for a name sends `Parse` and records the name
//! 2. Later executions skip straight to `Bind`/`Execute`
//! 3. When the cache is full the least recently used name is evicted and
//!    closed on the server before the next `Parse`
//! 4. A reconnect clears the cache, since server-side statements died with
//!    the old session

use std::num::NonZeroUsize;
use std::time::Instant;

use lru::LruCache;

/// Default maximum number of prepared statements to remember per connection.
pub const DEFAULT_MAX_STATEMENTS: usize = 256;

/// A statement known to exist on the server.
#[derive(Debug, Clone)]
pub struct PreparedStatement {
    name: String,
    sql: String,
    prepared_at: Instant,
}

impl PreparedStatement {
    /// Record a statement prepared just now.
    pub fn new(name: impl Into<String>, sql: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            sql: sql.into(),
            prepared_at: Instant::now(),
        }
    }

    /// Server-side statement name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// SQL text it was prepared from.
    #[must_use]
    pub fn sql(&self) -> &str {
        &self.sql
    }

    /// Time since preparation.
    #[must_use]
    pub fn age(&self) -> std::time::Duration {
        self.prepared_at.elapsed()
    }
}

/// LRU set of prepared statement names.
pub struct StatementCache {
    cache: LruCache<String, PreparedStatement>,
    hits: u64,
    misses: u64,
}

impl StatementCache {
    /// Create a cache holding at most `max_size` names (at least one).
    #[must_use]
    pub fn new(max_size: usize) -> Self {
        let cap = NonZeroUsize::new(max_size).unwrap_or(NonZeroUsize::MIN);
        Self {
            cache: LruCache::new(cap),
            hits: 0,
            misses: 0,
        }
    }

    /// Whether `name` is prepared, refreshing its LRU position.
    pub fn contains(&mut self, name: &str) -> bool {
        if self.cache.get(name).is_some() {
            self.hits += 1;
            tracing::trace!(statement = name, "statement cache hit");
            true
        } else {
            self.misses += 1;
            tracing::trace!(statement = name, "statement cache miss");
            false
        }
    }

    /// Peek at a statement without touching LRU order.
    pub fn peek(&self, name: &str) -> Option<&PreparedStatement> {
        self.cache.peek(name)
    }

    /// Record a prepared statement.
    ///
    /// Returns the evicted statement if capacity was exceeded; the caller
    /// should close it on the server.
    pub fn insert(&mut self, stmt: PreparedStatement) -> Option<PreparedStatement> {
        tracing::debug!(statement = stmt.name(), "caching prepared statement");
        let name = stmt.name.clone();
        // `push` also returns the old entry when the key was already present.
        match self.cache.push(name.clone(), stmt) {
            Some((evicted_name, evicted)) if evicted_name != name => Some(evicted),
            _ => None,
        }
    }

    /// Forget a statement, e.g. after the server reported it missing.
    pub fn remove(&mut self, name: &str) -> Option<PreparedStatement> {
        self.cache.pop(name)
    }

    /// Forget every statement.
    pub fn clear(&mut self) {
        let count = self.cache.len();
        self.cache.clear();
        if count > 0 {
            tracing::debug!(count = count, "cleared statement cache");
        }
    }

    /// Number of cached statements.
    #[must_use]
    pub fn len(&self) -> usize {
        self.cache.len()
    }

    /// Whether the cache is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.cache.is_empty()
    }

    /// Maximum number of cached statements.
    #[must_use]
    pub fn max_size(&self) -> usize {
        self.cache.cap().get()
    }

    /// Number of lookups that found the statement.
    #[must_use]
    pub fn hits(&self) -> u64 {
        self.hits
    }

    /// Number of lookups that did not.
    #[must_use]
    pub fn misses(&self) -> u64 {
        self.misses
    }
}

impl Default for StatementCache {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_STATEMENTS)
    }
}

impl std::fmt::Debug for StatementCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StatementCache")
            .field("len", &self.cache.len())
            .field("max_size", &self.max_size())
            .field("hits", &self.hits)
            .field("misses", &self.misses)
            .finish()
    }
}
