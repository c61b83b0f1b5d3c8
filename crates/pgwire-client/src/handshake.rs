//! Session establishment as an explicit state machine.
//!
//! The handshake performs no I/O. The driver asks it what to do next with
//! [`Handshake::step`], performs that wait (writability, readability, or an
//! offloaded key derivation) and feeds the outcome back. This keeps the
//! protocol logic testable without sockets:
//!
//! ```text
//! Connecting ─► PollingWrite ─► PollingRead ─┬─► Ready
//!                    ▲               │        └─► Failed
//!                    └───────────────┤
//!                                    ▼
//!                               DerivingKey
//! ```

use std::collections::HashMap;

use bytes::BytesMut;
use pgwire_auth::{Credentials, SCRAM_SHA_256, ScramSha256, ServerFirst, md5_password};
use pgwire_protocol::{
    AuthenticationRequest, BackendKeyData, BackendMessage, FrontendMessage, ProtocolError,
    StartupMessage, TransactionStatus,
};

use crate::config::Config;
use crate::error::{DbError, Error, Result};

/// Where the handshake currently stands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeState {
    /// Socket opened; startup packet not yet queued.
    Connecting,
    /// Output is queued and must be written.
    PollingWrite,
    /// Waiting for the next server message.
    PollingRead,
    /// Waiting for the SCRAM salted password.
    DerivingKey,
    /// Session is ready for queries.
    Ready,
    /// Handshake failed; see [`Handshake::finish`].
    Failed,
}

/// What the driver must do next.
#[derive(Debug)]
pub enum HandshakeStep {
    /// Write [`Handshake::take_output`] fully, then call [`Handshake::on_written`].
    NeedWrite,
    /// Read one message and pass it to [`Handshake::on_message`].
    NeedRead,
    /// Compute the salted password and pass it to [`Handshake::on_salted_password`].
    NeedKey(KeyDerivation),
    /// Done; call [`Handshake::finish`].
    Ready,
    /// Failed; call [`Handshake::finish`] for the error.
    Failed,
}

/// Inputs for the SCRAM salted-password derivation.
#[derive(Debug, Clone)]
pub struct KeyDerivation {
    /// Password.
    pub password: String,
    /// Server-provided salt.
    pub salt: Vec<u8>,
    /// Iteration count.
    pub iterations: u32,
}

/// Facts about an established session.
#[derive(Debug, Clone, Default)]
pub struct SessionInfo {
    /// Cancellation key, if the server sent one.
    pub key_data: Option<BackendKeyData>,
    /// Reported run-time parameters (`server_version`, `TimeZone`, ...).
    pub parameters: HashMap<String, String>,
    /// Transaction status from the first `ReadyForQuery`.
    pub transaction_status: TransactionStatus,
}

/// The connection handshake state machine.
pub struct Handshake {
    state: HandshakeState,
    startup: StartupMessage,
    credentials: Credentials,
    output: BytesMut,
    scram: Option<ScramSha256>,
    server_first: Option<ServerFirst>,
    session: SessionInfo,
    error: Option<Error>,
}

impl Handshake {
    /// Prepare a handshake for `config`.
    #[must_use]
    pub fn new(config: &Config) -> Self {
        let mut startup = StartupMessage::new(config.user.clone())
            .parameter("application_name", config.application_name.clone())
            .parameter("client_encoding", "UTF8");
        if let Some(db) = &config.database {
            startup = startup.database(db.clone());
        }
        for (name, value) in &config.runtime_params {
            startup = startup.parameter(name.clone(), value.clone());
        }
        Self {
            state: HandshakeState::Connecting,
            startup,
            credentials: config.credentials(),
            output: BytesMut::new(),
            scram: None,
            server_first: None,
            session: SessionInfo::default(),
            error: None,
        }
    }

    /// Current state.
    #[must_use]
    pub fn state(&self) -> HandshakeState {
        self.state
    }

    /// Decide the next action, advancing out of `Connecting` if needed.
    pub fn step(&mut self) -> HandshakeStep {
        match self.state {
            HandshakeState::Connecting => {
                FrontendMessage::Startup(&self.startup).encode(&mut self.output);
                self.state = HandshakeState::PollingWrite;
                HandshakeStep::NeedWrite
            }
            HandshakeState::PollingWrite => HandshakeStep::NeedWrite,
            HandshakeState::PollingRead => HandshakeStep::NeedRead,
            HandshakeState::DerivingKey => match (&self.server_first, self.credentials.password()) {
                (Some(first), Ok(password)) => HandshakeStep::NeedKey(KeyDerivation {
                    password: password.to_string(),
                    salt: first.salt.clone(),
                    iterations: first.iterations,
                }),
                _ => {
                    self.fail(Error::Protocol(ProtocolError::UnexpectedMessage(
                        "SCRAM state lost before key derivation".into(),
                    )));
                    HandshakeStep::Failed
                }
            },
            HandshakeState::Ready => HandshakeStep::Ready,
            HandshakeState::Failed => HandshakeStep::Failed,
        }
    }

    /// Take the bytes that must be written.
    pub fn take_output(&mut self) -> BytesMut {
        self.output.split()
    }

    /// All queued output has been written.
    pub fn on_written(&mut self) {
        if self.state == HandshakeState::PollingWrite {
            self.state = HandshakeState::PollingRead;
        }
    }

    /// Feed one server message.
    pub fn on_message(&mut self, msg: BackendMessage) {
        if self.state != HandshakeState::PollingRead {
            return;
        }
        let result = match msg {
            BackendMessage::Authentication(auth) => self.on_authentication(auth),
            BackendMessage::BackendKeyData(key) => {
                self.session.key_data = Some(key);
                Ok(())
            }
            BackendMessage::ParameterStatus { name, value } => {
                self.session.parameters.insert(name, value);
                Ok(())
            }
            BackendMessage::NoticeResponse(notice) => {
                tracing::debug!(code = %notice.code, message = %notice.message, "notice during startup");
                Ok(())
            }
            BackendMessage::ReadyForQuery(status) => {
                self.session.transaction_status = status;
                self.state = HandshakeState::Ready;
                Ok(())
            }
            BackendMessage::ErrorResponse(fields) => {
                let db = DbError::from(fields);
                Err(Error::Connection(db.to_string()))
            }
            other => Err(Error::Protocol(ProtocolError::UnexpectedMessage(format!(
                "{} during startup",
                other.name()
            )))),
        };
        if let Err(e) = result {
            self.fail(e);
        }
    }

    /// Feed the outcome of the salted-password derivation.
    pub fn on_salted_password(&mut self, salted: Result<[u8; 32]>) {
        if self.state != HandshakeState::DerivingKey {
            return;
        }
        let result = salted.and_then(|salted| {
            let (Some(scram), Some(first)) = (self.scram.as_mut(), self.server_first.as_ref()) else {
                return Err(Error::Protocol(ProtocolError::UnexpectedMessage(
                    "SCRAM state lost before client-final".into(),
                )));
            };
            let payload = scram.client_final(first, &salted)?;
            FrontendMessage::SaslResponse(&payload).encode(&mut self.output);
            Ok(())
        });
        match result {
            Ok(()) => self.state = HandshakeState::PollingWrite,
            Err(e) => self.fail(e),
        }
    }

    /// A wait failed; the handshake cannot continue.
    pub fn fail(&mut self, err: Error) {
        if self.error.is_none() {
            self.error = Some(err);
        }
        self.state = HandshakeState::Failed;
    }

    /// Consume the handshake, yielding the session or the failure.
    pub fn finish(self) -> Result<SessionInfo> {
        match (self.state, self.error) {
            (HandshakeState::Ready, _) => Ok(self.session),
            (_, Some(err)) => Err(err),
            (state, None) => Err(Error::Connection(format!(
                "handshake abandoned in state {state:?}"
            ))),
        }
    }

    fn on_authentication(&mut self, auth: AuthenticationRequest) -> Result<()> {
        match auth {
            AuthenticationRequest::Ok => {
                tracing::debug!(user = self.credentials.user(), "authenticated");
            }
            AuthenticationRequest::CleartextPassword => {
                let password = self.credentials.password()?;
                FrontendMessage::Password(password).encode(&mut self.output);
                self.state = HandshakeState::PollingWrite;
            }
            AuthenticationRequest::Md5Password(salt) => {
                let hashed = md5_password(self.credentials.user(), self.credentials.password()?, salt);
                FrontendMessage::Password(&hashed).encode(&mut self.output);
                self.state = HandshakeState::PollingWrite;
            }
            AuthenticationRequest::Sasl(mechanisms) => {
                if !mechanisms.iter().any(|m| m == SCRAM_SHA_256) {
                    return Err(pgwire_auth::AuthError::UnsupportedMechanism(mechanisms.join(", ")).into());
                }
                // Fail before the exchange starts rather than mid-way.
                self.credentials.password()?;
                let scram = ScramSha256::new();
                FrontendMessage::SaslInitialResponse {
                    mechanism: SCRAM_SHA_256,
                    data: &scram.client_first(),
                }
                .encode(&mut self.output);
                self.scram = Some(scram);
                self.state = HandshakeState::PollingWrite;
            }
            AuthenticationRequest::SaslContinue(data) => {
                let scram = self.scram.as_ref().ok_or_else(|| {
                    Error::Protocol(ProtocolError::UnexpectedMessage(
                        "SASL continue without SASL start".into(),
                    ))
                })?;
                self.server_first = Some(scram.parse_server_first(&data)?);
                self.state = HandshakeState::DerivingKey;
            }
            AuthenticationRequest::SaslFinal(data) => {
                let scram = self.scram.as_ref().ok_or_else(|| {
                    Error::Protocol(ProtocolError::UnexpectedMessage(
                        "SASL final without SASL start".into(),
                    ))
                })?;
                scram.verify_server_final(&data)?;
            }
            AuthenticationRequest::Unsupported(code) => {
                return Err(pgwire_auth::AuthError::UnsupportedMethod(format!(
                    "authentication request code {code}"
                ))
                .into());
            }
        }
        Ok(())
    }
}

impl std::fmt::Debug for Handshake {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Handshake")
            .field("state", &self.state)
            .field("user", &self.credentials.user())
            .field("pending_output", &self.output.len())
            .finish()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use pgwire_protocol::ErrorFields;

    fn config() -> Config {
        Config::new().user("app").password("pencil").database("orders")
    }

    /// Drive the machine through its startup write.
    fn started(config: &Config) -> Handshake {
        let mut hs = Handshake::new(config);
        assert_eq!(hs.state(), HandshakeState::Connecting);
        assert!(matches!(hs.step(), HandshakeStep::NeedWrite));
        let out = hs.take_output();
        assert_eq!(&out[4..8], &pgwire_protocol::PROTOCOL_VERSION.to_be_bytes());
        hs.on_written();
        assert!(matches!(hs.step(), HandshakeStep::NeedRead));
        hs
    }

    fn finish_startup(hs: &mut Handshake) {
        hs.on_message(BackendMessage::Authentication(AuthenticationRequest::Ok));
        hs.on_message(BackendMessage::ParameterStatus {
            name: "server_version".into(),
            value: "16.2".into(),
        });
        hs.on_message(BackendMessage::BackendKeyData(BackendKeyData {
            process_id: 42,
            secret_key: 7,
        }));
        hs.on_message(BackendMessage::ReadyForQuery(TransactionStatus::Idle));
    }

    #[test]
    fn test_trust_auth() {
        let mut hs = started(&config());
        finish_startup(&mut hs);
        assert!(matches!(hs.step(), HandshakeStep::Ready));

        let session = hs.finish().unwrap();
        assert_eq!(session.key_data.unwrap().process_id, 42);
        assert_eq!(session.parameters["server_version"], "16.2");
        assert_eq!(session.transaction_status, TransactionStatus::Idle);
    }

    #[test]
    fn test_cleartext_password() {
        let mut hs = started(&config());
        hs.on_message(BackendMessage::Authentication(
            AuthenticationRequest::CleartextPassword,
        ));
        assert!(matches!(hs.step(), HandshakeStep::NeedWrite));
        assert_eq!(&hs.take_output()[..], b"p\0\0\0\x0bpencil\0");
        hs.on_written();
        finish_startup(&mut hs);
        hs.finish().unwrap();
    }

    #[test]
    fn test_md5_password() {
        let mut hs = started(&config());
        hs.on_message(BackendMessage::Authentication(
            AuthenticationRequest::Md5Password([1, 2, 3, 4]),
        ));
        assert_eq!(hs.state(), HandshakeState::PollingWrite);
        let out = hs.take_output();
        let expected = md5_password("app", "pencil", [1, 2, 3, 4]);
        assert_eq!(&out[5..out.len() - 1], expected.as_bytes());
    }

    #[test]
    fn test_missing_password_fails() {
        let config = Config::new().user("app");
        let mut hs = started(&config);
        hs.on_message(BackendMessage::Authentication(
            AuthenticationRequest::CleartextPassword,
        ));
        assert!(matches!(hs.step(), HandshakeStep::Failed));
        assert!(matches!(hs.finish(), Err(Error::Authentication(_))));
    }

    #[test]
    fn test_scram_requests_key_derivation() {
        let mut hs = started(&config());
        hs.on_message(BackendMessage::Authentication(AuthenticationRequest::Sasl(
            vec![SCRAM_SHA_256.into()],
        )));
        assert!(matches!(hs.step(), HandshakeStep::NeedWrite));
        let out = hs.take_output();
        let nonce_start = out
            .windows(8)
            .position(|w| w == b"n,,n=,r=")
            .unwrap()
            + 8;
        let client_nonce = String::from_utf8(out[nonce_start..].to_vec()).unwrap();
        hs.on_written();

        let server_first = format!("r={client_nonce}SERVER,s=QSXCR+Q6sek8bf92,i=4096");
        hs.on_message(BackendMessage::Authentication(
            AuthenticationRequest::SaslContinue(Bytes::from(server_first)),
        ));
        let HandshakeStep::NeedKey(job) = hs.step() else {
            unreachable!("expected key derivation");
        };
        assert_eq!(job.iterations, 4096);
        assert_eq!(job.password, "pencil");

        let salted = pgwire_auth::salted_password(&job.password, &job.salt, job.iterations).unwrap();
        hs.on_salted_password(Ok(salted));
        assert!(matches!(hs.step(), HandshakeStep::NeedWrite));
        let out = hs.take_output();
        assert_eq!(out[0], b'p');
        assert!(out.windows(2).any(|w| w == b"p="));
    }

    #[test]
    fn test_unsupported_sasl_mechanism() {
        let mut hs = started(&config());
        hs.on_message(BackendMessage::Authentication(AuthenticationRequest::Sasl(
            vec!["SCRAM-SHA-256-PLUS".into()],
        )));
        assert!(matches!(
            hs.finish(),
            Err(Error::Authentication(pgwire_auth::AuthError::UnsupportedMechanism(_)))
        ));
    }

    #[test]
    fn test_server_error_fails_with_message() {
        let mut hs = started(&config());
        let mut fields = ErrorFields::error("28P01", "password authentication failed");
        fields.severity = "FATAL".into();
        hs.on_message(BackendMessage::ErrorResponse(fields));

        let Err(Error::Connection(msg)) = hs.finish() else {
            unreachable!("expected connection error");
        };
        assert!(msg.contains("password authentication failed"));
    }

    #[test]
    fn test_unexpected_message_fails() {
        let mut hs = started(&config());
        hs.on_message(BackendMessage::DataRow(Default::default()));
        assert_eq!(hs.state(), HandshakeState::Failed);
        assert!(matches!(hs.finish(), Err(Error::Protocol(_))));
    }

    #[test]
    fn test_io_failure_is_kept() {
        let mut hs = started(&config());
        hs.fail(Error::Timeout("handshake read"));
        assert!(matches!(hs.step(), HandshakeStep::Failed));
        assert!(matches!(hs.finish(), Err(Error::Timeout(_))));
    }
}
