//! Mock PostgreSQL server for tests.
//!
//! Speaks enough of the v3 protocol to exercise a real driver: startup with
//! trust, cleartext, MD5 or SCRAM-SHA-256 authentication, the extended query cycle
//! (Parse/Bind/Describe/Execute/Close/Sync), and out-of-band cancel
//! requests. Responses are scripted by SQL text.
//!
//! ## Features
//!
//! - Per-connection named statements with the real server's errors:
//!   `42P05` for a duplicate `Parse`, `26000` for a `Bind` to an unknown name
//! - [`MockPgServer::forget_prepared`] drops every session's statements,
//!   like a transaction pooler handing out a fresh backend, and
//!   [`MockServerBuilder::with_lost_statement`] does so before every `Bind`
//! - Fault injection: server errors, `FATAL` errors, delays, hangs,
//!   and abrupt disconnects
//! - An event log of what clients sent
//!
//! ## Example
//!
//! ```rust,ignore
//! use pgwire_testing::{MockPgServer, MockResponse};
//!
//! let server = MockPgServer::builder()
//!     .with_response("SELECT name FROM users", MockResponse::rows(["name"], [["alice"]]))
//!     .build()
//!     .await?;
//! // Connect a client to server.host() / server.port()...
//! ```

use std::collections::HashMap;
use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicI32, AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use bytes::{Buf, Bytes, BytesMut};
use hmac::{Hmac, Mac};
use parking_lot::Mutex;
use pgwire_auth::SCRAM_SHA_256;
use pgwire_protocol::codec::{ensure, get_cstr, get_i16, get_i32};
use pgwire_protocol::{
    AuthenticationRequest, BackendKeyData, BackendMessage, CANCEL_REQUEST_CODE, DataRow,
    ErrorFields, FieldDescription, PROTOCOL_VERSION, TransactionStatus, sqlstate,
};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;

/// SSL negotiation request code.
const SSL_REQUEST_CODE: i32 = 80_877_103;

/// Salt sent with MD5 password requests.
const MD5_SALT: [u8; 4] = [0x5a, 0x17, 0x01, 0xc3];

/// Salt, iteration count and nonce suffix of SCRAM challenges.
const SCRAM_SALT: [u8; 16] = *b"mock-server-salt";
const SCRAM_ITERATIONS: u32 = 4096;
const SCRAM_SERVER_NONCE: &str = "mockServerNonce0";

/// Error type for mock server operations.
#[derive(Debug, Error)]
pub enum MockServerError {
    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Malformed client message.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// The client closed the connection.
    #[error("client disconnected")]
    Disconnected,
}

impl From<pgwire_protocol::ProtocolError> for MockServerError {
    fn from(e: pgwire_protocol::ProtocolError) -> Self {
        Self::Protocol(e.to_string())
    }
}

/// Result type for mock server operations.
pub type Result<T> = std::result::Result<T, MockServerError>;

/// How the server authenticates new sessions.
#[derive(Debug, Clone, Default)]
pub enum AuthMode {
    /// Accept without credentials.
    #[default]
    Trust,
    /// Request the password in cleartext and compare.
    Cleartext(String),
    /// Request an MD5 digest and compare.
    Md5(String),
    /// Run a SCRAM-SHA-256 exchange and check the client proof.
    ScramSha256(String),
    /// Refuse every session with `FATAL 28P01`.
    Reject,
}

/// Scripted response to a statement.
#[derive(Clone)]
pub enum MockResponse {
    /// A result set; the command tag is `SELECT <n>`.
    Rows {
        /// Column names.
        columns: Vec<String>,
        /// Row values; `None` is NULL.
        rows: Vec<Vec<Option<String>>>,
    },

    /// A command with no result set.
    Command(String),

    /// An `ERROR` response; the session stays usable.
    Error {
        /// SQLSTATE.
        code: String,
        /// Message.
        message: String,
    },

    /// A `FATAL` response followed by closing the socket.
    Fatal {
        /// SQLSTATE.
        code: String,
        /// Message.
        message: String,
    },

    /// Wait, then respond.
    Delay(Duration, Box<MockResponse>),

    /// Never respond.
    Hang,

    /// Close the socket without a response.
    Disconnect,

    /// Compute the response from the SQL and parameters.
    Custom(Arc<dyn Fn(&str, &[Option<String>]) -> MockResponse + Send + Sync>),
}

impl fmt::Debug for MockResponse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Rows { columns, rows } => f
                .debug_struct("Rows")
                .field("columns", columns)
                .field("rows", &rows.len())
                .finish(),
            Self::Command(tag) => f.debug_tuple("Command").field(tag).finish(),
            Self::Error { code, message } => f
                .debug_struct("Error")
                .field("code", code)
                .field("message", message)
                .finish(),
            Self::Fatal { code, message } => f
                .debug_struct("Fatal")
                .field("code", code)
                .field("message", message)
                .finish(),
            Self::Delay(d, inner) => f.debug_tuple("Delay").field(d).field(inner).finish(),
            Self::Hang => f.write_str("Hang"),
            Self::Disconnect => f.write_str("Disconnect"),
            Self::Custom(_) => f.debug_tuple("Custom").field(&"<fn>").finish(),
        }
    }
}

impl MockResponse {
    /// One column, one row.
    pub fn scalar(column: impl Into<String>, value: impl Into<String>) -> Self {
        Self::Rows {
            columns: vec![column.into()],
            rows: vec![vec![Some(value.into())]],
        }
    }

    /// A result set of non-NULL values.
    pub fn rows<C, R, V>(columns: C, rows: R) -> Self
    where
        C: IntoIterator,
        C::Item: Into<String>,
        R: IntoIterator<Item = V>,
        V: IntoIterator,
        V::Item: Into<String>,
    {
        Self::Rows {
            columns: columns.into_iter().map(Into::into).collect(),
            rows: rows
                .into_iter()
                .map(|row| row.into_iter().map(|v| Some(v.into())).collect())
                .collect(),
        }
    }

    /// A command tag, e.g. `INSERT 0 1`.
    pub fn command(tag: impl Into<String>) -> Self {
        Self::Command(tag.into())
    }

    /// An `ERROR` response.
    pub fn error(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Error {
            code: code.into(),
            message: message.into(),
        }
    }

    /// A `FATAL` response that ends the session.
    pub fn fatal(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Fatal {
            code: code.into(),
            message: message.into(),
        }
    }

    /// Respond with `self` after `delay`.
    #[must_use]
    pub fn delayed(self, delay: Duration) -> Self {
        Self::Delay(delay, Box::new(self))
    }

    /// A response computed per call.
    pub fn custom(f: impl Fn(&str, &[Option<String>]) -> MockResponse + Send + Sync + 'static) -> Self {
        Self::Custom(Arc::new(f))
    }

    /// Resolve `Custom` responses.
    fn resolve(&self, sql: &str, params: &[Option<String>]) -> Self {
        match self {
            Self::Custom(f) => f(sql, params).resolve(sql, params),
            Self::Delay(d, inner) => Self::Delay(*d, Box::new(inner.resolve(sql, params))),
            other => other.clone(),
        }
    }

    /// Columns this response describes, looking through delays.
    fn columns(&self) -> Option<&[String]> {
        match self {
            Self::Rows { columns, .. } => Some(columns),
            Self::Delay(_, inner) => inner.columns(),
            _ => None,
        }
    }
}

/// Something a client did, in arrival order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MockEvent {
    /// A session finished startup.
    Connected {
        /// Assigned backend process id.
        process_id: i32,
        /// Requested user.
        user: String,
    },
    /// A `Parse` was accepted.
    Parse {
        /// Statement name; empty for the unnamed statement.
        name: String,
        /// SQL text.
        sql: String,
    },
    /// A portal was executed.
    Execute {
        /// SQL text.
        sql: String,
        /// Bound parameters.
        params: Vec<Option<String>>,
    },
    /// A statement was closed.
    Close {
        /// Statement name.
        name: String,
    },
    /// A cancel request arrived.
    Cancel {
        /// Target backend process id.
        process_id: i32,
    },
    /// A session sent `Terminate`.
    Terminate,
}

/// Configuration for the mock server.
#[derive(Debug, Default)]
pub struct MockServerConfig {
    responses: HashMap<String, MockResponse>,
    default_response: Option<MockResponse>,
    auth: AuthMode,
    startup_delay: Option<Duration>,
    server_version: String,
    prepared: Vec<(String, String)>,
    lost: Vec<String>,
}

/// Builder for [`MockPgServer`].
#[derive(Debug)]
pub struct MockServerBuilder {
    config: MockServerConfig,
}

impl MockServerBuilder {
    /// Create a builder with trust authentication and no scripted responses.
    pub fn new() -> Self {
        Self {
            config: MockServerConfig {
                server_version: "16.4 (mock)".to_string(),
                ..MockServerConfig::default()
            },
        }
    }

    /// Respond to `sql` with `response`.
    #[must_use]
    pub fn with_response(mut self, sql: impl Into<String>, response: MockResponse) -> Self {
        self.config.responses.insert(sql.into(), response);
        self
    }

    /// Response for statements without a scripted one.
    #[must_use]
    pub fn with_default_response(mut self, response: MockResponse) -> Self {
        self.config.default_response = Some(response);
        self
    }

    /// Set the authentication mode.
    #[must_use]
    pub fn with_auth(mut self, auth: AuthMode) -> Self {
        self.config.auth = auth;
        self
    }

    /// Stall each new session for `delay` before answering its startup.
    #[must_use]
    pub fn with_startup_delay(mut self, delay: Duration) -> Self {
        self.config.startup_delay = Some(delay);
        self
    }

    /// Start every session with `name` already prepared, as if a previous
    /// client of the same backend had prepared it.
    #[must_use]
    pub fn with_prepared(mut self, name: impl Into<String>, sql: impl Into<String>) -> Self {
        self.config.prepared.push((name.into(), sql.into()));
        self
    }

    /// Forget `name` before every `Bind` to it, so each execution fails
    /// with `26000` as if it landed on a backend that never saw the `Parse`.
    #[must_use]
    pub fn with_lost_statement(mut self, name: impl Into<String>) -> Self {
        self.config.lost.push(name.into());
        self
    }

    /// Set the reported `server_version`.
    #[must_use]
    pub fn with_server_version(mut self, version: impl Into<String>) -> Self {
        self.config.server_version = version.into();
        self
    }

    /// Build and start the server.
    pub async fn build(self) -> Result<MockPgServer> {
        MockPgServer::start(self.config).await
    }
}

impl Default for MockServerBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// State shared between the server handle and its sessions.
#[derive(Debug, Default)]
struct Shared {
    active: AtomicUsize,
    accepted: AtomicUsize,
    next_pid: AtomicI32,
    /// Bumped by `forget_prepared`; sessions drop their statements when it moves.
    statement_epoch: AtomicU64,
    events: Mutex<Vec<MockEvent>>,
}

impl Shared {
    fn record(&self, event: MockEvent) {
        self.events.lock().push(event);
    }
}

/// A mock PostgreSQL server listening on `127.0.0.1`.
pub struct MockPgServer {
    addr: SocketAddr,
    shutdown_tx: broadcast::Sender<()>,
    shared: Arc<Shared>,
}

impl MockPgServer {
    /// Create a builder.
    pub fn builder() -> MockServerBuilder {
        MockServerBuilder::new()
    }

    /// Start a server on an ephemeral port.
    pub async fn start(config: MockServerConfig) -> Result<Self> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        let (shutdown_tx, _) = broadcast::channel(1);
        let config = Arc::new(config);
        let shared = Arc::new(Shared {
            next_pid: AtomicI32::new(1000),
            ..Shared::default()
        });

        let mut shutdown_rx = shutdown_tx.subscribe();
        let accept_shutdown = shutdown_tx.clone();
        let accept_shared = Arc::clone(&shared);
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    result = listener.accept() => match result {
                        Ok((stream, _peer)) => {
                            let config = Arc::clone(&config);
                            let shared = Arc::clone(&accept_shared);
                            let mut session_shutdown = accept_shutdown.subscribe();
                            shared.accepted.fetch_add(1, Ordering::SeqCst);
                            shared.active.fetch_add(1, Ordering::SeqCst);
                            tokio::spawn(async move {
                                tokio::select! {
                                    result = handle_connection(stream, &config, &shared) => {
                                        if let Err(e) = result {
                                            tracing::debug!(error = %e, "mock session ended");
                                        }
                                    }
                                    _ = session_shutdown.recv() => {}
                                }
                                shared.active.fetch_sub(1, Ordering::SeqCst);
                            });
                        }
                        Err(e) => {
                            tracing::error!(error = %e, "mock accept failed");
                            break;
                        }
                    },
                    _ = shutdown_rx.recv() => break,
                }
            }
        });

        Ok(Self {
            addr,
            shutdown_tx,
            shared,
        })
    }

    /// Listening address.
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Host string for client configuration.
    pub fn host(&self) -> String {
        self.addr.ip().to_string()
    }

    /// Listening port.
    pub fn port(&self) -> u16 {
        self.addr.port()
    }

    /// Sessions currently open.
    pub fn connection_count(&self) -> usize {
        self.shared.active.load(Ordering::SeqCst)
    }

    /// TCP connections accepted since start, cancel requests included.
    pub fn accepted_count(&self) -> usize {
        self.shared.accepted.load(Ordering::SeqCst)
    }

    /// Drop every session's prepared statements.
    pub fn forget_prepared(&self) {
        self.shared.statement_epoch.fetch_add(1, Ordering::SeqCst);
    }

    /// Everything clients have done so far.
    pub fn events(&self) -> Vec<MockEvent> {
        self.shared.events.lock().clone()
    }

    /// Number of accepted `Parse` messages for a statement name.
    pub fn parse_count(&self, name: &str) -> usize {
        self.shared
            .events
            .lock()
            .iter()
            .filter(|e| matches!(e, MockEvent::Parse { name: n, .. } if n == name))
            .count()
    }

    /// Stop accepting and close every session.
    pub fn stop(&self) {
        let _ = self.shutdown_tx.send(());
    }
}

impl fmt::Debug for MockPgServer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MockPgServer")
            .field("addr", &self.addr)
            .field("connections", &self.connection_count())
            .finish()
    }
}

impl Drop for MockPgServer {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Per-session protocol state.
struct Session<'a> {
    stream: TcpStream,
    read_buf: BytesMut,
    out: BytesMut,
    config: &'a MockServerConfig,
    shared: &'a Shared,
    statements: HashMap<String, String>,
    epoch: u64,
    /// SQL and parameters bound to the unnamed portal, with its response.
    portal: Option<(String, Vec<Option<String>>, MockResponse)>,
    /// An error occurred; ignore messages until `Sync`.
    skipping: bool,
    status: TransactionStatus,
}

enum Flow {
    Continue,
    Close,
}

async fn handle_connection(
    stream: TcpStream,
    config: &MockServerConfig,
    shared: &Shared,
) -> Result<()> {
    let mut session = Session {
        stream,
        read_buf: BytesMut::with_capacity(4096),
        out: BytesMut::new(),
        config,
        shared,
        statements: config.prepared.iter().cloned().collect(),
        epoch: shared.statement_epoch.load(Ordering::SeqCst),
        portal: None,
        skipping: false,
        status: TransactionStatus::Idle,
    };
    if !session.startup().await? {
        return Ok(());
    }
    loop {
        let (tag, body) = session.read_message().await?;
        if let Flow::Close = session.handle(tag, body).await? {
            session.flush().await?;
            return Ok(());
        }
    }
}

impl Session<'_> {
    /// Run the startup and authentication exchange.
    ///
    /// Returns `false` when the session ends without becoming ready.
    async fn startup(&mut self) -> Result<bool> {
        let mut body = loop {
            let mut body = self.read_untagged().await?;
            let code = get_i32(&mut body)?;
            match code {
                SSL_REQUEST_CODE => {
                    self.stream.write_all(b"N").await?;
                }
                CANCEL_REQUEST_CODE => {
                    let process_id = get_i32(&mut body)?;
                    let _secret = get_i32(&mut body)?;
                    self.shared.record(MockEvent::Cancel { process_id });
                    return Ok(false);
                }
                PROTOCOL_VERSION => break body,
                other => {
                    return Err(MockServerError::Protocol(format!(
                        "unsupported protocol version {other}"
                    )));
                }
            }
        };

        let mut params = HashMap::new();
        while body.first().is_some_and(|&b| b != 0) {
            let name = get_cstr(&mut body, "parameter name")?;
            let value = get_cstr(&mut body, "parameter value")?;
            params.insert(name, value);
        }
        let user = params.remove("user").unwrap_or_default();

        if let Some(delay) = self.config.startup_delay {
            tokio::time::sleep(delay).await;
        }

        let password = match &self.config.auth {
            AuthMode::Trust => None,
            AuthMode::Cleartext(pw) => {
                self.send(BackendMessage::Authentication(
                    AuthenticationRequest::CleartextPassword,
                ));
                Some(pw.clone())
            }
            AuthMode::Md5(pw) => {
                self.send(BackendMessage::Authentication(
                    AuthenticationRequest::Md5Password(MD5_SALT),
                ));
                Some(pgwire_auth::md5_password(&user, pw, MD5_SALT))
            }
            AuthMode::ScramSha256(pw) => {
                let pw = pw.clone();
                if !self.scram(&pw, &user).await? {
                    return Ok(false);
                }
                None
            }
            AuthMode::Reject => {
                self.fatal(sqlstate::INVALID_PASSWORD, "password authentication failed")
                    .await?;
                return Ok(false);
            }
        };

        if let Some(expected) = password {
            self.flush().await?;
            let (tag, mut body) = self.read_message().await?;
            let supplied = get_cstr(&mut body, "password")?;
            if tag != b'p' || supplied != expected {
                self.fatal(
                    sqlstate::INVALID_PASSWORD,
                    &format!("password authentication failed for user \"{user}\""),
                )
                .await?;
                return Ok(false);
            }
        }

        let process_id = self.shared.next_pid.fetch_add(1, Ordering::SeqCst);
        self.send(BackendMessage::Authentication(AuthenticationRequest::Ok));
        for (name, value) in [
            ("server_version", self.config.server_version.as_str()),
            ("server_encoding", "UTF8"),
            ("client_encoding", "UTF8"),
            ("DateStyle", "ISO, MDY"),
        ] {
            self.send(BackendMessage::ParameterStatus {
                name: name.to_string(),
                value: value.to_string(),
            });
        }
        self.send(BackendMessage::BackendKeyData(BackendKeyData {
            process_id,
            secret_key: process_id.wrapping_mul(7919),
        }));
        self.send(BackendMessage::ReadyForQuery(TransactionStatus::Idle));
        self.flush().await?;
        self.shared.record(MockEvent::Connected { process_id, user });
        Ok(true)
    }

    /// Server side of SCRAM-SHA-256. Returns `false` after rejecting the proof.
    async fn scram(&mut self, password: &str, user: &str) -> Result<bool> {
        self.send(BackendMessage::Authentication(AuthenticationRequest::Sasl(
            vec![SCRAM_SHA_256.to_string()],
        )));
        self.flush().await?;

        let (tag, mut body) = self.read_message().await?;
        let mechanism = get_cstr(&mut body, "SASL mechanism")?;
        let len = get_i32(&mut body)?;
        if tag != b'p' || mechanism != SCRAM_SHA_256 || len < 0 {
            return Err(MockServerError::Protocol(format!(
                "bad SASLInitialResponse for {mechanism}"
            )));
        }
        let client_first = String::from_utf8_lossy(&body).into_owned();
        let bare = client_first
            .strip_prefix("n,,")
            .ok_or_else(|| MockServerError::Protocol("channel binding requested".into()))?;
        let client_nonce = bare
            .split(',')
            .find_map(|attr| attr.strip_prefix("r="))
            .ok_or_else(|| MockServerError::Protocol("missing client nonce".into()))?;

        let nonce = format!("{client_nonce}{SCRAM_SERVER_NONCE}");
        let server_first = format!(
            "r={nonce},s={},i={SCRAM_ITERATIONS}",
            STANDARD.encode(SCRAM_SALT)
        );
        self.send(BackendMessage::Authentication(
            AuthenticationRequest::SaslContinue(Bytes::from(server_first.clone())),
        ));
        self.flush().await?;

        let (tag, body) = self.read_message().await?;
        let client_final = String::from_utf8_lossy(&body).into_owned();
        let (without_proof, proof) = client_final
            .rsplit_once(",p=")
            .ok_or_else(|| MockServerError::Protocol("missing client proof".into()))?;
        let auth_message = format!("{bare},{server_first},{without_proof}");

        let salted = pgwire_auth::salted_password(password, &SCRAM_SALT, SCRAM_ITERATIONS)
            .map_err(|e| MockServerError::Protocol(e.to_string()))?;
        let client_key = hmac_sha256(&salted, b"Client Key")?;
        let client_signature = hmac_sha256(&Sha256::digest(client_key), auth_message.as_bytes())?;
        let expected: Vec<u8> = client_key
            .iter()
            .zip(client_signature.iter())
            .map(|(k, s)| k ^ s)
            .collect();

        let nonce_ok = without_proof.ends_with(&format!("r={nonce}"));
        if tag != b'p' || !nonce_ok || STANDARD.decode(proof).ok() != Some(expected) {
            self.fatal(
                sqlstate::INVALID_PASSWORD,
                &format!("password authentication failed for user \"{user}\""),
            )
            .await?;
            return Ok(false);
        }

        let server_key = hmac_sha256(&salted, b"Server Key")?;
        let verifier = hmac_sha256(&server_key, auth_message.as_bytes())?;
        self.send(BackendMessage::Authentication(AuthenticationRequest::SaslFinal(
            Bytes::from(format!("v={}", STANDARD.encode(verifier))),
        )));
        Ok(true)
    }

    async fn handle(&mut self, tag: u8, mut body: Bytes) -> Result<Flow> {
        self.sync_epoch();
        if tag == b'X' {
            self.shared.record(MockEvent::Terminate);
            return Ok(Flow::Close);
        }
        if tag == b'S' {
            self.skipping = false;
            self.send(BackendMessage::ReadyForQuery(self.status));
            self.flush().await?;
            return Ok(Flow::Continue);
        }
        if self.skipping {
            return Ok(Flow::Continue);
        }

        match tag {
            b'P' => {
                let name = get_cstr(&mut body, "statement")?;
                let sql = get_cstr(&mut body, "query")?;
                if !name.is_empty() && self.statements.contains_key(&name) {
                    self.error(
                        sqlstate::DUPLICATE_PREPARED_STATEMENT,
                        &format!("prepared statement \"{name}\" already exists"),
                    );
                } else {
                    self.statements.insert(name.clone(), sql.clone());
                    self.shared.record(MockEvent::Parse { name, sql });
                    self.send(BackendMessage::ParseComplete);
                }
            }
            b'B' => {
                let _portal = get_cstr(&mut body, "portal")?;
                let statement = get_cstr(&mut body, "statement")?;
                let formats = get_i16(&mut body)?;
                for _ in 0..formats {
                    get_i16(&mut body)?;
                }
                let count = get_i16(&mut body)?;
                let mut params = Vec::with_capacity(count.max(0) as usize);
                for _ in 0..count {
                    let len = get_i32(&mut body)?;
                    if len < 0 {
                        params.push(None);
                    } else {
                        let len = len as usize;
                        if body.len() < len {
                            return Err(MockServerError::Protocol("short parameter".into()));
                        }
                        let value = body.split_to(len);
                        params.push(Some(String::from_utf8_lossy(&value).into_owned()));
                    }
                }
                if self.config.lost.contains(&statement) {
                    self.statements.remove(&statement);
                }
                match self.statements.get(&statement) {
                    Some(sql) => {
                        let sql = sql.clone();
                        let response = self.lookup(&sql).resolve(&sql, &params);
                        self.portal = Some((sql, params, response));
                        self.send(BackendMessage::BindComplete);
                    }
                    None => self.error(
                        sqlstate::INVALID_SQL_STATEMENT_NAME,
                        &format!("prepared statement \"{statement}\" does not exist"),
                    ),
                }
            }
            b'D' => {
                let columns = self
                    .portal
                    .as_ref()
                    .and_then(|(_, _, response)| response.columns().map(<[String]>::to_vec));
                match columns {
                    Some(columns) => self.send(BackendMessage::RowDescription(
                        columns.into_iter().map(FieldDescription::text).collect(),
                    )),
                    None => self.send(BackendMessage::NoData),
                }
            }
            b'E' => {
                if let Some((sql, params, response)) = self.portal.take() {
                    self.shared.record(MockEvent::Execute {
                        sql: sql.clone(),
                        params,
                    });
                    return self.respond(&sql, response).await;
                }
                self.error("34000", "portal \"\" does not exist");
            }
            b'C' => {
                ensure(&body, 1)?;
                body.advance(1);
                let name = get_cstr(&mut body, "name")?;
                self.statements.remove(&name);
                self.shared.record(MockEvent::Close { name });
                self.send(BackendMessage::CloseComplete);
            }
            b'H' => self.flush().await?,
            other => {
                return Err(MockServerError::Protocol(format!(
                    "unsupported message '{}'",
                    other as char
                )));
            }
        }
        Ok(Flow::Continue)
    }

    async fn respond(&mut self, sql: &str, response: MockResponse) -> Result<Flow> {
        let mut response = response;
        loop {
            match response {
                MockResponse::Delay(delay, inner) => {
                    self.flush().await?;
                    tokio::time::sleep(delay).await;
                    response = *inner;
                }
                MockResponse::Rows { rows, .. } => {
                    let count = rows.len();
                    for row in rows {
                        self.send(BackendMessage::DataRow(DataRow {
                            columns: row.into_iter().map(|v| v.map(Bytes::from)).collect(),
                        }));
                    }
                    self.send(BackendMessage::CommandComplete(format!("SELECT {count}")));
                    self.track_transaction(sql);
                    return Ok(Flow::Continue);
                }
                MockResponse::Command(tag) => {
                    self.send(BackendMessage::CommandComplete(tag));
                    self.track_transaction(sql);
                    return Ok(Flow::Continue);
                }
                MockResponse::Error { code, message } => {
                    self.error(&code, &message);
                    return Ok(Flow::Continue);
                }
                MockResponse::Fatal { code, message } => {
                    self.fatal(&code, &message).await?;
                    return Ok(Flow::Close);
                }
                MockResponse::Hang => {
                    self.flush().await?;
                    std::future::pending::<()>().await;
                }
                MockResponse::Disconnect => {
                    self.out.clear();
                    return Ok(Flow::Close);
                }
                MockResponse::Custom(f) => response = f(sql, &[]),
            }
        }
    }

    fn lookup(&self, sql: &str) -> MockResponse {
        if let Some(response) = self.config.responses.get(sql) {
            return response.clone();
        }
        let keyword = sql.split_whitespace().next().unwrap_or("").to_ascii_uppercase();
        match keyword.as_str() {
            "BEGIN" | "COMMIT" | "ROLLBACK" => self.transaction_tag(&keyword),
            _ if sql.trim() == "SELECT 1" => MockResponse::scalar("?column?", "1"),
            _ => self
                .config
                .default_response
                .clone()
                .unwrap_or_else(|| MockResponse::command("SELECT 0")),
        }
    }

    fn transaction_tag(&self, keyword: &str) -> MockResponse {
        match (keyword, self.status) {
            ("COMMIT", TransactionStatus::Failed) => MockResponse::command("ROLLBACK"),
            (keyword, _) => MockResponse::command(keyword),
        }
    }

    fn track_transaction(&mut self, sql: &str) {
        let keyword = sql.split_whitespace().next().unwrap_or("").to_ascii_uppercase();
        match keyword.as_str() {
            "BEGIN" => self.status = TransactionStatus::InTransaction,
            "COMMIT" | "ROLLBACK" => self.status = TransactionStatus::Idle,
            _ => {}
        }
    }

    fn sync_epoch(&mut self) {
        let epoch = self.shared.statement_epoch.load(Ordering::SeqCst);
        if epoch != self.epoch {
            self.epoch = epoch;
            self.statements.clear();
        }
    }

    fn error(&mut self, code: &str, message: &str) {
        self.send(BackendMessage::ErrorResponse(ErrorFields::error(code, message)));
        if self.status == TransactionStatus::InTransaction {
            self.status = TransactionStatus::Failed;
        }
        self.portal = None;
        self.skipping = true;
    }

    async fn fatal(&mut self, code: &str, message: &str) -> Result<()> {
        let mut fields = ErrorFields::error(code, message);
        fields.severity = "FATAL".to_string();
        self.send(BackendMessage::ErrorResponse(fields));
        self.flush().await
    }

    fn send(&mut self, msg: BackendMessage) {
        msg.encode(&mut self.out);
    }

    async fn flush(&mut self) -> Result<()> {
        if !self.out.is_empty() {
            self.stream.write_all(&self.out).await?;
            self.out.clear();
        }
        Ok(())
    }

    async fn fill(&mut self, needed: usize) -> Result<()> {
        while self.read_buf.len() < needed {
            if self.stream.read_buf(&mut self.read_buf).await? == 0 {
                return Err(MockServerError::Disconnected);
            }
        }
        Ok(())
    }

    /// Read a length-prefixed message without a tag byte (startup, cancel).
    async fn read_untagged(&mut self) -> Result<Bytes> {
        self.fill(4).await?;
        let len = i32::from_be_bytes([
            self.read_buf[0],
            self.read_buf[1],
            self.read_buf[2],
            self.read_buf[3],
        ]);
        if !(8..=10_000).contains(&len) {
            return Err(MockServerError::Protocol(format!("bad startup length {len}")));
        }
        self.fill(len as usize).await?;
        let mut msg = self.read_buf.split_to(len as usize).freeze();
        msg.advance(4);
        Ok(msg)
    }

    async fn read_message(&mut self) -> Result<(u8, Bytes)> {
        self.fill(5).await?;
        let tag = self.read_buf[0];
        let len = i32::from_be_bytes([
            self.read_buf[1],
            self.read_buf[2],
            self.read_buf[3],
            self.read_buf[4],
        ]);
        if len < 4 {
            return Err(MockServerError::Protocol(format!("bad message length {len}")));
        }
        self.fill(1 + len as usize).await?;
        let mut msg = self.read_buf.split_to(1 + len as usize).freeze();
        msg.advance(5);
        Ok((tag, msg))
    }
}

fn hmac_sha256(key: &[u8], data: &[u8]) -> Result<[u8; 32]> {
    let mut mac = Hmac::<Sha256>::new_from_slice(key)
        .map_err(|e| MockServerError::Protocol(e.to_string()))?;
    mac.update(data);
    let mut out = [0u8; 32];
    out.copy_from_slice(&mac.finalize().into_bytes());
    Ok(out)
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::panic)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_mock_server_starts() {
        let server = MockPgServer::builder().build().await.unwrap();
        assert!(server.port() > 0);
        assert_eq!(server.host(), "127.0.0.1");
        assert_eq!(server.connection_count(), 0);
        assert!(server.events().is_empty());
    }

    #[test]
    fn test_rows_helper() {
        let response = MockResponse::rows(["id", "name"], [["1", "alice"], ["2", "bob"]]);
        match response {
            MockResponse::Rows { columns, rows } => {
                assert_eq!(columns, vec!["id", "name"]);
                assert_eq!(rows[1][1].as_deref(), Some("bob"));
            }
            other => panic!("unexpected response {other:?}"),
        }
    }

    #[test]
    fn test_custom_resolves_through_delay() {
        let response = MockResponse::custom(|_, params| {
            MockResponse::scalar("echo", params[0].clone().unwrap_or_default())
        })
        .delayed(Duration::from_millis(5));

        let resolved = response.resolve("SELECT $1", &[Some("hi".into())]);
        assert_eq!(resolved.columns().unwrap(), ["echo".to_string()]);
    }

    #[tokio::test]
    async fn test_cancel_request_is_recorded() {
        let server = MockPgServer::builder().build().await.unwrap();
        let mut stream = TcpStream::connect(server.addr()).await.unwrap();
        let mut packet = Vec::new();
        packet.extend_from_slice(&16i32.to_be_bytes());
        packet.extend_from_slice(&CANCEL_REQUEST_CODE.to_be_bytes());
        packet.extend_from_slice(&1001i32.to_be_bytes());
        packet.extend_from_slice(&9i32.to_be_bytes());
        stream.write_all(&packet).await.unwrap();

        // The server closes the socket once the request is read.
        let mut buf = [0u8; 1];
        assert_eq!(stream.read(&mut buf).await.unwrap(), 0);
        assert_eq!(server.events(), vec![MockEvent::Cancel { process_id: 1001 }]);
    }
}
