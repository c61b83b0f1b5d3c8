//! The connection driver: one PostgreSQL session.
//!
//! A [`Connection`] owns its socket exclusively. Every network wait is a
//! suspension on socket readiness bounded by a deadline, so a slow or dead
//! server costs the caller time but never blocks the executor thread.
//!
//! ## Failure handling
//!
//! Server `ERROR` responses are read through to `ReadyForQuery`, so the
//! session stays synchronized and reusable. Anything else (a timeout, an
//! I/O error, a protocol desync, a `FATAL` response) means the session
//! state is unknown: the driver sends a best-effort cancel on a fresh
//! socket and closes the connection. The next operation reconnects.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use pgwire_auth::salted_password;
use pgwire_codec::{MessageIo, Stream};
use pgwire_protocol::{
    BackendKeyData, BackendMessage, FrontendMessage, ProtocolError, Target, TransactionStatus,
    sqlstate,
};
use smallvec::SmallVec;
use tokio::time::Instant;
use tracing::{Instrument, Span};

use crate::cancel::{self, spawn_cancel};
use crate::config::Config;
use crate::error::{DbError, Error, Result};
use crate::handshake::{Handshake, HandshakeStep};
use crate::offload::WorkerPool;
use crate::result::{QueryResult, Row};
use crate::statement_cache::{PreparedStatement, StatementCache};

/// Timeout used by [`Connection::ping`].
pub const PING_TIMEOUT: Duration = Duration::from_secs(3);

/// A single database session.
pub struct Connection {
    config: Arc<Config>,
    io: Option<MessageIo<Stream>>,
    key_data: Option<BackendKeyData>,
    transaction_status: TransactionStatus,
    parameters: HashMap<String, String>,
    statements: StatementCache,
    /// Evicted statement names awaiting `Close` on the server.
    pending_close: SmallVec<[String; 4]>,
    offload: WorkerPool,
    span: Span,
}

impl Connection {
    /// Create a disconnected driver. Nothing touches the network until
    /// [`connect`](Self::connect) or the first query.
    pub fn new(config: impl Into<Arc<Config>>) -> Self {
        let config = config.into();
        let span = tracing::info_span!("pg_conn", host = %config.host, port = config.port);
        Self {
            statements: StatementCache::new(config.statement_cache_size),
            config,
            io: None,
            key_data: None,
            transaction_status: TransactionStatus::Idle,
            parameters: HashMap::new(),
            pending_close: SmallVec::new(),
            offload: WorkerPool::default(),
            span,
        }
    }

    /// Create a driver and connect it.
    pub async fn open(config: impl Into<Arc<Config>>) -> Result<Self> {
        let mut conn = Self::new(config);
        conn.connect().await?;
        Ok(conn)
    }

    /// Use `pool` for CPU-bound work such as SCRAM key derivation.
    #[must_use]
    pub fn with_offload(mut self, pool: WorkerPool) -> Self {
        self.offload = pool;
        self
    }

    /// Log under `span` instead of a fresh `pg_conn` span.
    #[must_use]
    pub fn with_span(mut self, span: Span) -> Self {
        self.span = span;
        self
    }

    /// Connection configuration.
    #[must_use]
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Whether the session is open and usable.
    #[must_use]
    pub fn is_healthy(&self) -> bool {
        self.io.is_some()
    }

    /// Transaction status reported by the last `ReadyForQuery`.
    #[must_use]
    pub fn transaction_status(&self) -> TransactionStatus {
        self.transaction_status
    }

    /// Server process id of the current session.
    #[must_use]
    pub fn backend_pid(&self) -> Option<i32> {
        self.io.as_ref().and(self.key_data).map(|k| k.process_id)
    }

    /// A run-time parameter reported by the server, e.g. `server_version`.
    #[must_use]
    pub fn parameter(&self, name: &str) -> Option<&str> {
        self.parameters.get(name).map(String::as_str)
    }

    /// Prepared statement bookkeeping for this session.
    #[must_use]
    pub fn statement_cache(&self) -> &StatementCache {
        &self.statements
    }

    /// Establish the session if it is not already healthy.
    pub async fn connect(&mut self) -> Result<()> {
        let span = self.span.clone();
        self.ensure_connected().instrument(span).await
    }

    /// Run `SELECT 1`, reconnecting first if needed. Never fails.
    pub async fn ping(&mut self) -> bool {
        match self.exec_params("SELECT 1", &[], PING_TIMEOUT).await {
            Ok(_) => true,
            Err(e) => {
                tracing::debug!(parent: &self.span, error = %e, "ping failed");
                false
            }
        }
    }

    /// Run a parameterized statement through the unnamed statement.
    ///
    /// `params` are text values bound to `$1..$n`; `None` binds NULL.
    pub async fn exec_params(
        &mut self,
        sql: &str,
        params: &[Option<&str>],
        timeout: Duration,
    ) -> Result<QueryResult> {
        let span = self.span.clone();
        async move {
            self.ensure_connected().await?;
            let deadline = Instant::now() + timeout;
            self.send([
                FrontendMessage::Parse {
                    name: "",
                    sql,
                    param_types: &[],
                },
                FrontendMessage::Bind {
                    portal: "",
                    statement: "",
                    params,
                },
                FrontendMessage::Describe {
                    target: Target::Portal,
                    name: "",
                },
                FrontendMessage::Execute {
                    portal: "",
                    max_rows: 0,
                },
                FrontendMessage::Sync,
            ])?;
            self.exchange(deadline).await
        }
        .instrument(span)
        .await
    }

    /// Run a named prepared statement, preparing it from `sql` on first use.
    ///
    /// If the server no longer knows the statement (SQLSTATE 26000, e.g.
    /// after a pooler reset the session), it is prepared again and the
    /// execution retried once within the same deadline.
    pub async fn exec_prepared(
        &mut self,
        name: &str,
        sql: &str,
        params: &[Option<&str>],
        timeout: Duration,
    ) -> Result<QueryResult> {
        let span = self.span.clone();
        async move {
            self.ensure_connected().await?;
            let deadline = Instant::now() + timeout;
            if !self.statements.contains(name) {
                self.prepare(name, sql, deadline).await?;
            }
            match self.execute_named(name, params, deadline).await {
                Err(e) if e.is_sqlstate(sqlstate::INVALID_SQL_STATEMENT_NAME) => {
                    tracing::info!(statement = name, "prepared statement missing on server, re-preparing");
                    self.statements.remove(name);
                    self.prepare(name, sql, deadline).await?;
                    self.execute_named(name, params, deadline).await
                }
                other => other,
            }
        }
        .instrument(span)
        .await
    }

    /// Start a transaction block.
    pub async fn begin(&mut self, timeout: Duration) -> Result<()> {
        self.exec_params("BEGIN", &[], timeout).await.map(drop)
    }

    /// Commit the current transaction block.
    pub async fn commit(&mut self, timeout: Duration) -> Result<()> {
        self.exec_params("COMMIT", &[], timeout).await.map(drop)
    }

    /// Roll back the current transaction block.
    pub async fn rollback(&mut self, timeout: Duration) -> Result<()> {
        self.exec_params("ROLLBACK", &[], timeout).await.map(drop)
    }

    /// Close the session. The next operation reconnects.
    pub fn close(&mut self) {
        if let Some(mut io) = self.io.take() {
            io.try_terminate();
            tracing::info!(parent: &self.span, "connection closed");
        }
        self.key_data = None;
        self.transaction_status = TransactionStatus::Idle;
        self.statements.clear();
        self.pending_close.clear();
    }

    async fn ensure_connected(&mut self) -> Result<()> {
        if self.is_healthy() {
            return Ok(());
        }
        let config = Arc::clone(&self.config);
        let step = config.connect_timeout;
        tracing::debug!("connecting");

        let stream = match tokio::time::timeout(step, cancel::open(&config)).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => return Err(Error::Connection(e.to_string())),
            Err(_) => {
                return Err(Error::Connection(format!(
                    "timed out after {step:?} opening socket"
                )));
            }
        };

        let mut io = MessageIo::new(stream);
        let mut handshake = Handshake::new(&config);
        loop {
            match handshake.step() {
                HandshakeStep::NeedWrite => {
                    io.queue_raw(&handshake.take_output());
                    match io.flush(Instant::now() + step).await {
                        Ok(()) => handshake.on_written(),
                        Err(e) => handshake.fail(e.into()),
                    }
                }
                HandshakeStep::NeedRead => match io.recv(Instant::now() + step).await {
                    Ok(msg) => {
                        tracing::trace!(message = msg.name(), "handshake message");
                        handshake.on_message(msg);
                    }
                    Err(e) => handshake.fail(e.into()),
                },
                HandshakeStep::NeedKey(job) => {
                    let salted = self
                        .offload
                        .run(move || salted_password(&job.password, &job.salt, job.iterations))
                        .await
                        .and_then(|r| r.map_err(Error::from));
                    handshake.on_salted_password(salted);
                }
                HandshakeStep::Ready | HandshakeStep::Failed => break,
            }
        }

        let session = match handshake.finish() {
            Ok(session) => session,
            Err(e) => {
                io.try_terminate();
                tracing::warn!(error = %e, "connection attempt failed");
                return Err(match e {
                    e @ Error::Connection(_) => e,
                    other => Error::Connection(other.to_string()),
                });
            }
        };

        self.statements.clear();
        self.pending_close.clear();
        self.key_data = session.key_data;
        self.parameters = session.parameters;
        self.transaction_status = session.transaction_status;
        self.io = Some(io);
        tracing::info!(
            backend_pid = self.key_data.map(|k| k.process_id),
            server_version = self.parameter("server_version"),
            "connection established"
        );
        Ok(())
    }

    async fn prepare(&mut self, name: &str, sql: &str, deadline: Instant) -> Result<()> {
        let closing = std::mem::take(&mut self.pending_close);
        let mut msgs: SmallVec<[FrontendMessage<'_>; 6]> = closing
            .iter()
            .map(|stale| FrontendMessage::Close {
                target: Target::Statement,
                name: stale,
            })
            .collect();
        msgs.push(FrontendMessage::Parse {
            name,
            sql,
            param_types: &[],
        });
        msgs.push(FrontendMessage::Sync);
        self.send(msgs)?;

        match self.exchange(deadline).await {
            Ok(_) => tracing::debug!(statement = name, closed = closing.len(), "statement prepared"),
            Err(e) if e.is_sqlstate(sqlstate::DUPLICATE_PREPARED_STATEMENT) => {
                tracing::debug!(statement = name, "statement already prepared on server");
            }
            Err(e) => return Err(e),
        }

        if let Some(evicted) = self.statements.insert(PreparedStatement::new(name, sql)) {
            self.pending_close.push(evicted.name().to_string());
        }
        Ok(())
    }

    async fn execute_named(
        &mut self,
        name: &str,
        params: &[Option<&str>],
        deadline: Instant,
    ) -> Result<QueryResult> {
        self.send([
            FrontendMessage::Bind {
                portal: "",
                statement: name,
                params,
            },
            FrontendMessage::Describe {
                target: Target::Portal,
                name: "",
            },
            FrontendMessage::Execute {
                portal: "",
                max_rows: 0,
            },
            FrontendMessage::Sync,
        ])?;
        self.exchange(deadline).await
    }

    fn send<'m>(&mut self, msgs: impl IntoIterator<Item = FrontendMessage<'m>>) -> Result<()> {
        let io = self.io.as_mut().ok_or(Error::ConnectionClosed)?;
        let queued = msgs.into_iter().try_for_each(|msg| io.queue(msg));
        queued.map_err(|e| {
            let err = Error::from(e);
            self.abandon(&err);
            err
        })
    }

    /// Flush the queued cycle and read its response through `ReadyForQuery`.
    async fn exchange(&mut self, deadline: Instant) -> Result<QueryResult> {
        let io = self.io.as_mut().ok_or(Error::ConnectionClosed)?;
        match read_cycle(io, deadline, &mut self.parameters).await {
            Ok((outcome, status)) => {
                self.transaction_status = status;
                outcome
            }
            Err(e) => {
                self.abandon(&e);
                Err(e)
            }
        }
    }

    /// Give up on the session after an infrastructure failure.
    fn abandon(&mut self, err: &Error) {
        tracing::warn!(error = %err, "closing connection after infrastructure error");
        if let Some(key) = self.key_data.filter(|_| self.io.is_some()) {
            spawn_cancel(Arc::clone(&self.config), key);
        }
        self.close();
    }
}

/// Read one extended-query cycle.
///
/// The outer `Result` carries infrastructure failures; the inner one a
/// server `ERROR`, which leaves the session synchronized.
async fn read_cycle(
    io: &mut MessageIo<Stream>,
    deadline: Instant,
    parameters: &mut HashMap<String, String>,
) -> Result<(Result<QueryResult>, TransactionStatus)> {
    io.flush(deadline).await?;

    let mut result = QueryResult::default();
    let mut server_error: Option<DbError> = None;
    loop {
        let msg = io.recv(deadline).await?;
        tracing::trace!(message = msg.name(), "received");
        match msg {
            BackendMessage::RowDescription(fields) => {
                result.column_names = fields.into_iter().map(|f| f.name).collect();
                result.rows.clear();
            }
            BackendMessage::DataRow(row) => {
                if row.columns.len() != result.column_names.len() {
                    return Err(ProtocolError::UnexpectedMessage(format!(
                        "DataRow with {} columns after {} described",
                        row.columns.len(),
                        result.column_names.len()
                    ))
                    .into());
                }
                result.rows.push(Row::try_from(row)?);
            }
            BackendMessage::CommandComplete(tag) => result.command_tag = tag,
            BackendMessage::ParseComplete
            | BackendMessage::BindComplete
            | BackendMessage::CloseComplete
            | BackendMessage::NoData
            | BackendMessage::EmptyQueryResponse
            | BackendMessage::PortalSuspended
            | BackendMessage::ParameterDescription(_) => {}
            BackendMessage::ErrorResponse(fields) => {
                let err = DbError::from(fields);
                if err.is_fatal() {
                    return Err(err.into());
                }
                tracing::debug!(sqlstate = %err.sqlstate, message = %err.message, "server error");
                server_error.get_or_insert(err);
            }
            BackendMessage::NoticeResponse(notice) => {
                tracing::debug!(code = %notice.code, message = %notice.message, "notice");
            }
            BackendMessage::ParameterStatus { name, value } => {
                parameters.insert(name, value);
            }
            BackendMessage::NotificationResponse { channel, .. } => {
                tracing::debug!(channel = %channel, "dropping asynchronous notification");
            }
            BackendMessage::ReadyForQuery(status) => {
                let outcome = match server_error {
                    Some(err) => Err(err.into()),
                    None => Ok(result),
                };
                return Ok((outcome, status));
            }
            other => {
                return Err(ProtocolError::UnexpectedMessage(format!(
                    "{} during query",
                    other.name()
                ))
                .into());
            }
        }
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        if let Some(mut io) = self.io.take() {
            io.try_terminate();
        }
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("host", &self.config.host)
            .field("port", &self.config.port)
            .field("healthy", &self.is_healthy())
            .field("backend_pid", &self.backend_pid())
            .field("transaction_status", &self.transaction_status)
            .field("statements", &self.statements)
            .finish_non_exhaustive()
    }
}
