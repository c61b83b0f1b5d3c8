//! Messages sent from the client to the server.
//!
//! All parameter values and result columns are exchanged in the text format;
//! the driver never requests binary encodings.

use bytes::{BufMut, BytesMut};

use crate::codec::{put_cstr, write_message};
use crate::{CANCEL_REQUEST_CODE, PROTOCOL_VERSION};

/// Kind of server-side object addressed by `Describe` and `Close`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Target {
    /// A prepared statement.
    Statement,
    /// A bound portal.
    Portal,
}

impl Target {
    fn as_byte(self) -> u8 {
        match self {
            Self::Statement => b'S',
            Self::Portal => b'P',
        }
    }
}

/// The untagged startup packet opening a session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StartupMessage {
    /// Role to connect as.
    pub user: String,
    /// Database name; the server defaults it to the user name when absent.
    pub database: Option<String>,
    /// Additional run-time parameters such as `application_name`.
    pub parameters: Vec<(String, String)>,
}

impl StartupMessage {
    /// Create a startup message for `user`.
    pub fn new(user: impl Into<String>) -> Self {
        Self {
            user: user.into(),
            database: None,
            parameters: Vec::new(),
        }
    }

    /// Set the target database.
    #[must_use]
    pub fn database(mut self, database: impl Into<String>) -> Self {
        self.database = Some(database.into());
        self
    }

    /// Add a run-time parameter.
    #[must_use]
    pub fn parameter(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.parameters.push((name.into(), value.into()));
        self
    }

    /// Encode the startup packet.
    pub fn encode(&self, dst: &mut BytesMut) {
        write_message(dst, None, |b| {
            b.put_i32(PROTOCOL_VERSION);
            put_cstr(b, "user");
            put_cstr(b, &self.user);
            if let Some(db) = &self.database {
                put_cstr(b, "database");
                put_cstr(b, db);
            }
            for (name, value) in &self.parameters {
                put_cstr(b, name);
                put_cstr(b, value);
            }
            b.put_u8(0);
        });
    }
}

/// A client-to-server message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FrontendMessage<'a> {
    /// Session startup packet.
    Startup(&'a StartupMessage),
    /// Cleartext or MD5-hashed password.
    Password(&'a str),
    /// First SASL message naming the selected mechanism.
    SaslInitialResponse {
        /// Mechanism name, e.g. `SCRAM-SHA-256`.
        mechanism: &'a str,
        /// Client-first message.
        data: &'a [u8],
    },
    /// Subsequent SASL message.
    SaslResponse(&'a [u8]),
    /// Simple query.
    Query(&'a str),
    /// Create a prepared statement. An empty name targets the unnamed statement.
    Parse {
        /// Statement name.
        name: &'a str,
        /// SQL text with `$n` placeholders.
        sql: &'a str,
        /// Parameter type OIDs; zero lets the server infer.
        param_types: &'a [u32],
    },
    /// Bind text parameters to a statement, creating a portal.
    Bind {
        /// Destination portal.
        portal: &'a str,
        /// Source statement.
        statement: &'a str,
        /// Parameter values; `None` is SQL NULL.
        params: &'a [Option<&'a str>],
    },
    /// Request a description of a statement or portal.
    Describe {
        /// Object kind.
        target: Target,
        /// Object name.
        name: &'a str,
    },
    /// Execute a portal.
    Execute {
        /// Portal name.
        portal: &'a str,
        /// Row limit; zero means no limit.
        max_rows: i32,
    },
    /// Close a statement or portal.
    Close {
        /// Object kind.
        target: Target,
        /// Object name.
        name: &'a str,
    },
    /// End of an extended-query cycle.
    Sync,
    /// Ask the server to flush pending output.
    Flush,
    /// Graceful session termination.
    Terminate,
    /// Out-of-band cancel, sent on a separate connection.
    CancelRequest {
        /// Backend process id.
        process_id: i32,
        /// Backend secret key.
        secret_key: i32,
    },
}

impl FrontendMessage<'_> {
    /// Append the encoded message to `dst`.
    pub fn encode(&self, dst: &mut BytesMut) {
        match self {
            Self::Startup(startup) => startup.encode(dst),
            Self::Password(password) => write_message(dst, Some(b'p'), |b| put_cstr(b, password)),
            Self::SaslInitialResponse { mechanism, data } => {
                write_message(dst, Some(b'p'), |b| {
                    put_cstr(b, mechanism);
                    b.put_i32(data.len() as i32);
                    b.put_slice(data);
                });
            }
            Self::SaslResponse(data) => write_message(dst, Some(b'p'), |b| b.put_slice(data)),
            Self::Query(sql) => write_message(dst, Some(b'Q'), |b| put_cstr(b, sql)),
            Self::Parse {
                name,
                sql,
                param_types,
            } => write_message(dst, Some(b'P'), |b| {
                put_cstr(b, name);
                put_cstr(b, sql);
                b.put_i16(param_types.len() as i16);
                for oid in *param_types {
                    b.put_u32(*oid);
                }
            }),
            Self::Bind {
                portal,
                statement,
                params,
            } => write_message(dst, Some(b'B'), |b| {
                put_cstr(b, portal);
                put_cstr(b, statement);
                // No parameter format codes: all text.
                b.put_i16(0);
                b.put_i16(params.len() as i16);
                for param in *params {
                    match param {
                        Some(value) => {
                            b.put_i32(value.len() as i32);
                            b.put_slice(value.as_bytes());
                        }
                        None => b.put_i32(-1),
                    }
                }
                // No result format codes: all text.
                b.put_i16(0);
            }),
            Self::Describe { target, name } => write_message(dst, Some(b'D'), |b| {
                b.put_u8(target.as_byte());
                put_cstr(b, name);
            }),
            Self::Execute { portal, max_rows } => write_message(dst, Some(b'E'), |b| {
                put_cstr(b, portal);
                b.put_i32(*max_rows);
            }),
            Self::Close { target, name } => write_message(dst, Some(b'C'), |b| {
                b.put_u8(target.as_byte());
                put_cstr(b, name);
            }),
            Self::Sync => write_message(dst, Some(b'S'), |_| {}),
            Self::Flush => write_message(dst, Some(b'H'), |_| {}),
            Self::Terminate => write_message(dst, Some(b'X'), |_| {}),
            Self::CancelRequest {
                process_id,
                secret_key,
            } => write_message(dst, None, |b| {
                b.put_i32(CANCEL_REQUEST_CODE);
                b.put_i32(*process_id);
                b.put_i32(*secret_key);
            }),
        }
    }
}
