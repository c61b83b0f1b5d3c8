//! Connection pool implementation.
//!
//! All bookkeeping lives in one [`PoolState`] behind a `parking_lot` mutex
//! that is never held across an await. Connects, queries and waiter
//! suspension happen outside it.
//!
//! ## Capacity
//!
//! `created + pending <= size` at all times: `created` counts established
//! connections (idle or leased), `pending` counts connects in progress. A
//! released connection goes to the oldest live waiter before it is parked
//! idle. When a connection is discarded or a connect fails, the freed slot is
//! offered to the oldest waiter as permission to connect itself.

use std::collections::VecDeque;
use std::ops::{Deref, DerefMut};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use pgwire_client::{Config, Connection, Error, QueryResult, TransactionStatus, WorkerPool};
use tokio::sync::oneshot;
use tokio::time::Instant;
use tracing::{Instrument, Span};

use crate::breaker::{CircuitBreaker, CircuitState};
use crate::config::PoolConfig;
use crate::error::{PoolError, Result};

/// What a queued request receives.
enum Handoff {
    /// A live connection released by another lease.
    Connection(Connection),
    /// A freed slot; `pending` was already incremented on the waiter's behalf.
    Capacity,
}

struct PoolState {
    idle: Vec<Connection>,
    created: usize,
    pending: usize,
    waiters: VecDeque<oneshot::Sender<Handoff>>,
    stopping: bool,
    breaker: CircuitBreaker,
}

impl PoolState {
    /// Give `item` to the oldest waiter still listening, or hand it back.
    fn hand_off(&mut self, mut item: Handoff) -> Option<Handoff> {
        while let Some(waiter) = self.waiters.pop_front() {
            match waiter.send(item) {
                Ok(()) => return None,
                Err(returned) => item = returned,
            }
        }
        Some(item)
    }

    /// Offer a freed slot to the oldest waiter.
    fn offer_capacity(&mut self) {
        if self.stopping || self.waiters.is_empty() {
            return;
        }
        self.pending += 1;
        if self.hand_off(Handoff::Capacity).is_some() {
            self.pending -= 1;
        }
    }

    fn live_waiters(&self) -> usize {
        self.waiters.iter().filter(|w| !w.is_closed()).count()
    }
}

struct PoolInner {
    config: PoolConfig,
    client: Arc<Config>,
    offload: WorkerPool,
    span: Span,
    state: Mutex<PoolState>,
}

/// A pool of PostgreSQL connections with a circuit breaker.
///
/// Cloning is cheap; clones share the same connections. Connections are
/// created lazily on demand, never more than [`PoolConfig::size`].
#[derive(Clone)]
pub struct Pool {
    inner: Arc<PoolInner>,
}

enum Admission {
    Idle { conn: Connection, probe: bool },
    Create(Reservation),
    Wait(Waiter),
}

impl Pool {
    /// Create a pool. No connection is opened until the first acquire.
    pub fn new(client_config: impl Into<Arc<Config>>, config: PoolConfig) -> Result<Self> {
        Self::builder()
            .client_config(client_config)
            .config(config)
            .build()
    }

    /// Create a pool that logs under `span`. Each connection logs under a
    /// child of it.
    pub fn with_span(
        client_config: impl Into<Arc<Config>>,
        config: PoolConfig,
        span: Span,
    ) -> Result<Self> {
        Self::builder()
            .client_config(client_config)
            .config(config)
            .span(span)
            .build()
    }

    /// Start building a pool.
    #[must_use]
    pub fn builder() -> PoolBuilder {
        PoolBuilder::default()
    }

    /// Lease a connection.
    ///
    /// Reuses the most recently returned idle connection, opens a new one
    /// while below capacity, or queues until one is released. Fails fast
    /// with [`PoolError::CircuitOpen`] while the breaker is open, without
    /// touching the network.
    pub async fn acquire(&self) -> Result<Lease> {
        let span = self.inner.span.clone();
        async move {
            match self.admit()? {
                Admission::Idle { conn, probe } => {
                    tracing::trace!(pid = conn.backend_pid(), "reusing idle connection");
                    Ok(Lease::new(self.clone(), conn, probe))
                }
                Admission::Create(reservation) => self.create(reservation).await,
                Admission::Wait(waiter) => self.wait(waiter).await,
            }
        }
        .instrument(span)
        .await
    }

    /// Run `sql` with text parameters on a leased connection.
    pub async fn query(
        &self,
        sql: &str,
        params: &[Option<&str>],
        timeout: Duration,
    ) -> Result<QueryResult> {
        let mut lease = self.acquire().await?;
        let result = lease.query(sql, params, timeout).await;
        lease.release();
        result
    }

    /// Run a named prepared statement on a leased connection, preparing it
    /// on that session first if needed.
    pub async fn query_prepared(
        &self,
        name: &str,
        sql: &str,
        params: &[Option<&str>],
        timeout: Duration,
    ) -> Result<QueryResult> {
        let mut lease = self.acquire().await?;
        let result = lease.query_prepared(name, sql, params, timeout).await;
        lease.release();
        result
    }

    /// Stop the pool.
    ///
    /// Queued requests fail with [`PoolError::PoolShuttingDown`], idle
    /// connections are closed, and leased connections are closed when they
    /// come back. Calling it again does nothing.
    pub fn shutdown(&self) {
        let (idle, waiters) = {
            let mut state = self.inner.state.lock();
            if state.stopping {
                return;
            }
            state.stopping = true;
            let idle = std::mem::take(&mut state.idle);
            state.created -= idle.len();
            (idle, std::mem::take(&mut state.waiters))
        };

        let _enter = self.inner.span.enter();
        tracing::info!(
            closed = idle.len(),
            waiters = waiters.len(),
            "connection pool shutting down"
        );
        drop(waiters);
        drop(idle);
    }

    /// Whether [`shutdown`](Self::shutdown) was called.
    #[must_use]
    pub fn is_shut_down(&self) -> bool {
        self.inner.state.lock().stopping
    }

    /// Snapshot of the pool's counters.
    #[must_use]
    pub fn status(&self) -> PoolStatus {
        let state = self.inner.state.lock();
        PoolStatus {
            idle: state.idle.len(),
            in_use: state.created - state.idle.len(),
            created: state.created,
            pending: state.pending,
            waiters: state.live_waiters(),
            size: self.inner.config.size,
            breaker: state.breaker.state(),
            stopping: state.stopping,
        }
    }

    /// The pool configuration.
    #[must_use]
    pub fn config(&self) -> &PoolConfig {
        &self.inner.config
    }

    /// The configuration every connection is opened with.
    #[must_use]
    pub fn client_config(&self) -> &Config {
        &self.inner.client
    }

    fn admit(&self) -> Result<Admission> {
        let mut state = self.inner.state.lock();
        if state.stopping {
            return Err(PoolError::PoolShuttingDown);
        }
        if !state.breaker.allow(Instant::now()) {
            tracing::debug!("acquire rejected; circuit open");
            return Err(PoolError::CircuitOpen);
        }
        let probe = state.breaker.state() == CircuitState::HalfOpen;

        if let Some(conn) = state.idle.pop() {
            return Ok(Admission::Idle { conn, probe });
        }

        if state.created + state.pending < self.inner.config.size {
            state.pending += 1;
            return Ok(Admission::Create(Reservation::new(self.clone(), probe)));
        }

        state.waiters.retain(|w| !w.is_closed());
        let max = self.inner.config.max_waiters;
        if state.waiters.len() >= max {
            if probe {
                state.breaker.release_probe();
            }
            tracing::warn!(max, "waiter queue full");
            return Err(PoolError::PoolExhausted { max });
        }

        let (tx, rx) = oneshot::channel();
        state.waiters.push_back(tx);
        Ok(Admission::Wait(Waiter {
            pool: self.clone(),
            rx,
            probe,
        }))
    }

    async fn create(&self, mut reservation: Reservation) -> Result<Lease> {
        let inner = &self.inner;
        let mut conn = Connection::new(Arc::clone(&inner.client))
            .with_offload(inner.offload.clone())
            .with_span(tracing::info_span!(parent: &inner.span, "pg_conn"));
        let result = conn.connect().await;

        reservation.armed = false;
        let probe = reservation.probe;
        let mut state = inner.state.lock();
        state.pending -= 1;
        match result {
            Ok(()) if state.stopping => {
                if probe {
                    state.breaker.release_probe();
                }
                drop(state);
                tracing::debug!("discarding new connection; pool shutting down");
                Err(PoolError::PoolShuttingDown)
            }
            Ok(()) => {
                state.created += 1;
                state.breaker.record(true, probe, Instant::now());
                let created = state.created;
                drop(state);
                tracing::info!(pid = conn.backend_pid(), created, "connection established");
                Ok(Lease::new(self.clone(), conn, false))
            }
            Err(e) => {
                state.breaker.record(false, probe, Instant::now());
                state.offer_capacity();
                let failures = state.breaker.failures();
                drop(state);
                tracing::warn!(error = %e, failures, "connection attempt failed");
                Err(PoolError::ConnectFailed(e))
            }
        }
    }

    async fn wait(&self, mut waiter: Waiter) -> Result<Lease> {
        tracing::trace!("waiting for a connection");
        let received = match self.inner.config.acquire_timeout {
            Some(limit) => match tokio::time::timeout(limit, &mut waiter.rx).await {
                Ok(received) => received,
                Err(_) => {
                    tracing::debug!(timeout = ?limit, "acquire timed out");
                    return Err(PoolError::AcquisitionTimeout(limit));
                }
            },
            None => (&mut waiter.rx).await,
        };

        match received {
            Ok(Handoff::Connection(conn)) => {
                let probe = waiter.disarm();
                tracing::trace!(pid = conn.backend_pid(), "received released connection");
                Ok(Lease::new(self.clone(), conn, probe))
            }
            Ok(Handoff::Capacity) => {
                let was_probe = waiter.disarm();
                let reservation = {
                    let mut state = self.inner.state.lock();
                    if state.stopping {
                        state.pending -= 1;
                        return Err(PoolError::PoolShuttingDown);
                    }
                    // A probe keeps its admission only while the circuit is
                    // still half-open; anything else is admitted afresh.
                    let probe_holds = was_probe && state.breaker.state() == CircuitState::HalfOpen;
                    if !probe_holds && !state.breaker.allow(Instant::now()) {
                        state.pending -= 1;
                        state.offer_capacity();
                        return Err(PoolError::CircuitOpen);
                    }
                    let probe = state.breaker.state() == CircuitState::HalfOpen;
                    Reservation::new(self.clone(), probe)
                };
                self.create(reservation).await
            }
            Err(_) => Err(PoolError::PoolShuttingDown),
        }
    }

    /// Take back a handoff whose waiter went away.
    fn reclaim(&self, handoff: Handoff) {
        match handoff {
            Handoff::Connection(conn) => self.check_in(conn, false),
            Handoff::Capacity => {
                let mut state = self.inner.state.lock();
                state.pending -= 1;
                state.offer_capacity();
            }
        }
    }

    fn check_in(&self, conn: Connection, probe: bool) {
        let healthy = conn.is_healthy();
        let status = conn.transaction_status();

        let mut state = self.inner.state.lock();
        if probe {
            state.breaker.record(healthy, true, Instant::now());
        }

        let stopping = state.stopping;
        let discard = if !healthy {
            Some("connection unhealthy")
        } else if status != TransactionStatus::Idle {
            Some("returned inside a transaction block")
        } else {
            None
        };

        if stopping || discard.is_some() {
            state.created -= 1;
            state.offer_capacity();
            drop(state);
            let _enter = self.inner.span.enter();
            match discard {
                Some(reason) => {
                    tracing::warn!(pid = conn.backend_pid(), reason, ?status, "discarding connection");
                }
                None => tracing::debug!(pid = conn.backend_pid(), "closing returned connection"),
            }
            drop(conn);
            return;
        }

        if let Some(Handoff::Connection(conn)) = state.hand_off(Handoff::Connection(conn)) {
            state.idle.push(conn);
        }
    }

    /// Feed an outcome to the breaker; only the probe's outcome moves a
    /// half-open circuit. Returns whether the outcome counted.
    fn record(&self, result: &std::result::Result<(), &Error>, probe: bool) -> bool {
        let success = match result {
            Ok(()) => true,
            Err(e) if e.is_infrastructure() => false,
            Err(_) => return false,
        };
        self.inner
            .state
            .lock()
            .breaker
            .record(success, probe, Instant::now());
        true
    }
}

impl std::fmt::Debug for Pool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pool")
            .field("config", &self.inner.config)
            .field("status", &self.status())
            .finish_non_exhaustive()
    }
}

/// Builder for [`Pool`].
#[derive(Debug, Default)]
pub struct PoolBuilder {
    client: Option<Arc<Config>>,
    config: PoolConfig,
    span: Option<Span>,
    offload: Option<WorkerPool>,
}

impl PoolBuilder {
    /// Set the configuration connections are opened with.
    #[must_use]
    pub fn client_config(mut self, config: impl Into<Arc<Config>>) -> Self {
        self.client = Some(config.into());
        self
    }

    /// Replace the whole pool configuration.
    #[must_use]
    pub fn config(mut self, config: PoolConfig) -> Self {
        self.config = config;
        self
    }

    /// Set the number of connections.
    #[must_use]
    pub fn size(mut self, size: usize) -> Self {
        self.config.size = size;
        self
    }

    /// Set the waiter queue limit.
    #[must_use]
    pub fn max_waiters(mut self, max: usize) -> Self {
        self.config.max_waiters = max;
        self
    }

    /// Bound how long a queued request waits.
    #[must_use]
    pub fn acquire_timeout(mut self, timeout: Duration) -> Self {
        self.config.acquire_timeout = Some(timeout);
        self
    }

    /// Set the span the pool and its connections log under.
    #[must_use]
    pub fn span(mut self, span: Span) -> Self {
        self.span = Some(span);
        self
    }

    /// Share `offload` for SCRAM key derivation across all connections.
    #[must_use]
    pub fn offload(mut self, offload: WorkerPool) -> Self {
        self.offload = Some(offload);
        self
    }

    /// Validate and build the pool.
    pub fn build(self) -> Result<Pool> {
        let client = self.client.ok_or_else(|| {
            PoolError::Configuration("client configuration is required".into())
        })?;
        client
            .validate()
            .map_err(|e| PoolError::Configuration(e.to_string()))?;
        self.config.validate()?;

        let span = self.span.unwrap_or_else(|| {
            tracing::info_span!(
                "pg_pool",
                host = %client.host,
                port = client.port,
                size = self.config.size
            )
        });
        span.in_scope(|| {
            tracing::debug!(
                size = self.config.size,
                max_waiters = self.config.max_waiters,
                "connection pool created"
            );
        });

        Ok(Pool {
            inner: Arc::new(PoolInner {
                state: Mutex::new(PoolState {
                    idle: Vec::with_capacity(self.config.size),
                    created: 0,
                    pending: 0,
                    waiters: VecDeque::new(),
                    stopping: false,
                    breaker: CircuitBreaker::new(self.config.breaker),
                }),
                offload: self.offload.unwrap_or_default(),
                client,
                config: self.config,
                span,
            }),
        })
    }
}

/// Status information about the pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolStatus {
    /// Connections parked idle.
    pub idle: usize,
    /// Connections leased out.
    pub in_use: usize,
    /// Established connections, idle or leased.
    pub created: usize,
    /// Connects in progress.
    pub pending: usize,
    /// Requests queued for a connection.
    pub waiters: usize,
    /// Configured capacity.
    pub size: usize,
    /// Circuit breaker state.
    pub breaker: CircuitState,
    /// Whether the pool is shutting down.
    pub stopping: bool,
}

/// A pending slot reserved for a connect in progress.
///
/// Dropped while still armed (the acquiring future was cancelled mid-connect),
/// it gives the slot back.
struct Reservation {
    pool: Pool,
    probe: bool,
    armed: bool,
}

impl Reservation {
    fn new(pool: Pool, probe: bool) -> Self {
        Self {
            pool,
            probe,
            armed: true,
        }
    }
}

impl Drop for Reservation {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let mut state = self.pool.inner.state.lock();
        state.pending -= 1;
        if self.probe {
            state.breaker.release_probe();
        }
        state.offer_capacity();
    }
}

/// A queued acquire. Anything handed over after it gave up goes back to the
/// pool.
struct Waiter {
    pool: Pool,
    rx: oneshot::Receiver<Handoff>,
    probe: bool,
}

impl Waiter {
    fn disarm(&mut self) -> bool {
        std::mem::replace(&mut self.probe, false)
    }
}

impl Drop for Waiter {
    fn drop(&mut self) {
        self.rx.close();
        if let Ok(handoff) = self.rx.try_recv() {
            self.pool.reclaim(handoff);
        }
        if self.probe {
            self.pool.inner.state.lock().breaker.release_probe();
        }
    }
}

/// A connection leased from a [`Pool`].
///
/// Derefs to [`Connection`]. Returned to the pool by [`release`](Self::release)
/// or on drop; a connection that is unhealthy or still inside a transaction
/// block is closed instead of reused.
///
/// Queries run through [`query`](Self::query) and
/// [`query_prepared`](Self::query_prepared) feed the circuit breaker; calls
/// made directly on the connection do not.
pub struct Lease {
    pool: Pool,
    conn: Option<Connection>,
    probe: bool,
}

impl Lease {
    fn new(pool: Pool, conn: Connection, probe: bool) -> Self {
        Self {
            pool,
            conn: Some(conn),
            probe,
        }
    }

    /// Run `sql` with text parameters.
    pub async fn query(
        &mut self,
        sql: &str,
        params: &[Option<&str>],
        timeout: Duration,
    ) -> Result<QueryResult> {
        let result = self.connection_mut().exec_params(sql, params, timeout).await;
        self.record(result.as_ref().map(|_| ()));
        Ok(result?)
    }

    /// Run a named prepared statement, preparing it on this session first if
    /// needed.
    pub async fn query_prepared(
        &mut self,
        name: &str,
        sql: &str,
        params: &[Option<&str>],
        timeout: Duration,
    ) -> Result<QueryResult> {
        let result = self
            .connection_mut()
            .exec_prepared(name, sql, params, timeout)
            .await;
        self.record(result.as_ref().map(|_| ()));
        Ok(result?)
    }

    /// Return the connection to the pool.
    pub fn release(mut self) {
        self.return_to_pool();
    }

    /// Whether this lease is the half-open probe and has not been judged yet.
    #[must_use]
    pub fn is_probe(&self) -> bool {
        self.probe
    }

    /// Feed an outcome to the breaker. Server errors that leave the session
    /// usable are ignored.
    pub(crate) fn record(&mut self, result: std::result::Result<(), &Error>) {
        if self.pool.record(&result, self.probe) {
            self.probe = false;
        }
    }

    #[allow(clippy::expect_used)]
    fn connection_ref(&self) -> &Connection {
        self.conn.as_ref().expect("lease holds its connection until released")
    }

    #[allow(clippy::expect_used)]
    fn connection_mut(&mut self) -> &mut Connection {
        self.conn.as_mut().expect("lease holds its connection until released")
    }

    fn return_to_pool(&mut self) {
        if let Some(conn) = self.conn.take() {
            self.pool.check_in(conn, self.probe);
        }
    }
}

impl Deref for Lease {
    type Target = Connection;

    fn deref(&self) -> &Connection {
        self.connection_ref()
    }
}

impl DerefMut for Lease {
    fn deref_mut(&mut self) -> &mut Connection {
        self.connection_mut()
    }
}

impl Drop for Lease {
    fn drop(&mut self) {
        self.return_to_pool();
    }
}

impl std::fmt::Debug for Lease {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Lease")
            .field("pid", &self.conn.as_ref().and_then(Connection::backend_pid))
            .field("probe", &self.probe)
            .finish_non_exhaustive()
    }
}
