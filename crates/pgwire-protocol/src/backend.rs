//! Messages sent from the server to the client.
//!
//! [`BackendMessage::decode`] parses one complete message body once the framing
//! layer has split it off the stream. [`BackendMessage::encode`] produces the
//! same wire form and is used by test servers.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use smallvec::SmallVec;

use crate::codec::{ensure, get_cstr, get_i16, get_i32, put_cstr, write_message};
use crate::error::ProtocolError;

/// Transaction status reported by `ReadyForQuery`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TransactionStatus {
    /// Not inside a transaction block.
    #[default]
    Idle,
    /// Inside a transaction block.
    InTransaction,
    /// Inside a failed transaction block; queries are rejected until rollback.
    Failed,
}

impl TransactionStatus {
    /// Parse the status byte.
    pub fn from_byte(b: u8) -> Result<Self, ProtocolError> {
        match b {
            b'I' => Ok(Self::Idle),
            b'T' => Ok(Self::InTransaction),
            b'E' => Ok(Self::Failed),
            other => Err(ProtocolError::InvalidField {
                field: "transaction status",
                value: i64::from(other),
            }),
        }
    }

    fn as_byte(self) -> u8 {
        match self {
            Self::Idle => b'I',
            Self::InTransaction => b'T',
            Self::Failed => b'E',
        }
    }
}

/// Authentication request carried by an `R` message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthenticationRequest {
    /// Authentication succeeded.
    Ok,
    /// Send the password in clear text.
    CleartextPassword,
    /// Send the MD5-hashed password using this salt.
    Md5Password([u8; 4]),
    /// Start a SASL exchange using one of these mechanisms.
    Sasl(Vec<String>),
    /// SASL challenge data.
    SaslContinue(Bytes),
    /// SASL outcome data.
    SaslFinal(Bytes),
    /// A method this client does not implement (Kerberos, GSSAPI, SSPI).
    Unsupported(i32),
}

/// Cancellation key for the session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackendKeyData {
    /// Backend process id.
    pub process_id: i32,
    /// Secret key.
    pub secret_key: i32,
}

/// One column of a `RowDescription`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldDescription {
    /// Column name.
    pub name: String,
    /// Source table OID, or zero.
    pub table_oid: u32,
    /// Source column attribute number, or zero.
    pub column_id: i16,
    /// Data type OID.
    pub type_oid: u32,
    /// Data type size; negative for variable width.
    pub type_size: i16,
    /// Type modifier.
    pub type_modifier: i32,
    /// Format code; always zero (text) for this client.
    pub format: i16,
}

impl FieldDescription {
    /// A text column with no source table, as test servers describe results.
    pub fn text(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            table_oid: 0,
            column_id: 0,
            type_oid: 25,
            type_size: -1,
            type_modifier: -1,
            format: 0,
        }
    }
}

/// A single result row. `None` columns are SQL NULL.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct DataRow {
    /// Raw column values in text format.
    pub columns: SmallVec<[Option<Bytes>; 8]>,
}

/// Fields of an `ErrorResponse` or `NoticeResponse`.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ErrorFields {
    /// Severity, e.g. `ERROR` or `FATAL` (non-localized when available).
    pub severity: String,
    /// SQLSTATE code.
    pub code: String,
    /// Primary message.
    pub message: String,
    /// Optional detail.
    pub detail: Option<String>,
    /// Optional hint.
    pub hint: Option<String>,
    /// Violated constraint name.
    pub constraint: Option<String>,
    /// Table name.
    pub table: Option<String>,
    /// Column name.
    pub column: Option<String>,
}

impl ErrorFields {
    /// Build an `ERROR` severity field set.
    pub fn error(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            severity: "ERROR".into(),
            code: code.into(),
            message: message.into(),
            ..Self::default()
        }
    }

    /// Whether the server is about to terminate the session.
    pub fn is_fatal(&self) -> bool {
        matches!(self.severity.as_str(), "FATAL" | "PANIC")
    }

    fn decode(body: &mut Bytes) -> Result<Self, ProtocolError> {
        let mut fields = Self::default();
        let mut localized_severity = None;
        loop {
            ensure(body, 1)?;
            let kind = body.get_u8();
            if kind == 0 {
                break;
            }
            let value = get_cstr(body, "error field")?;
            match kind {
                b'S' => localized_severity = Some(value),
                b'V' => fields.severity = value,
                b'C' => fields.code = value,
                b'M' => fields.message = value,
                b'D' => fields.detail = Some(value),
                b'H' => fields.hint = Some(value),
                b'n' => fields.constraint = Some(value),
                b't' => fields.table = Some(value),
                b'c' => fields.column = Some(value),
                _ => {}
            }
        }
        if fields.severity.is_empty() {
            fields.severity = localized_severity.unwrap_or_default();
        }
        Ok(fields)
    }

    fn encode(&self, b: &mut BytesMut) {
        let required = [
            (b'S', &self.severity),
            (b'V', &self.severity),
            (b'C', &self.code),
            (b'M', &self.message),
        ];
        for (kind, value) in required {
            b.put_u8(kind);
            put_cstr(b, value);
        }
        let optional = [
            (b'D', &self.detail),
            (b'H', &self.hint),
            (b'n', &self.constraint),
            (b't', &self.table),
            (b'c', &self.column),
        ];
        for (kind, value) in optional {
            if let Some(value) = value {
                b.put_u8(kind);
                put_cstr(b, value);
            }
        }
        b.put_u8(0);
    }
}

/// A server-to-client message.
#[derive(Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum BackendMessage {
    /// Authentication request or outcome.
    Authentication(AuthenticationRequest),
    /// Cancellation key.
    BackendKeyData(BackendKeyData),
    /// Run-time parameter report.
    ParameterStatus {
        /// Parameter name.
        name: String,
        /// Current value.
        value: String,
    },
    /// Server is ready for a new query cycle.
    ReadyForQuery(TransactionStatus),
    /// Result column metadata.
    RowDescription(Vec<FieldDescription>),
    /// One result row.
    DataRow(DataRow),
    /// Statement finished; carries the command tag.
    CommandComplete(String),
    /// The query string was empty.
    EmptyQueryResponse,
    /// Statement failed.
    ErrorResponse(ErrorFields),
    /// Informational notice.
    NoticeResponse(ErrorFields),
    /// `Parse` succeeded.
    ParseComplete,
    /// `Bind` succeeded.
    BindComplete,
    /// `Close` succeeded.
    CloseComplete,
    /// The described object returns no rows.
    NoData,
    /// Parameter type OIDs of a described statement.
    ParameterDescription(Vec<u32>),
    /// `Execute` row limit reached.
    PortalSuspended,
    /// Asynchronous `NOTIFY` delivery.
    NotificationResponse {
        /// Notifying backend.
        process_id: i32,
        /// Channel name.
        channel: String,
        /// Payload.
        payload: String,
    },
}

impl BackendMessage {
    /// Decode a message body for the given tag.
    pub fn decode(tag: u8, mut body: Bytes) -> Result<Self, ProtocolError> {
        let msg = match tag {
            b'R' => Self::Authentication(decode_authentication(&mut body)?),
            b'K' => Self::BackendKeyData(BackendKeyData {
                process_id: get_i32(&mut body)?,
                secret_key: get_i32(&mut body)?,
            }),
            b'S' => Self::ParameterStatus {
                name: get_cstr(&mut body, "parameter name")?,
                value: get_cstr(&mut body, "parameter value")?,
            },
            b'Z' => {
                ensure(&body, 1)?;
                Self::ReadyForQuery(TransactionStatus::from_byte(body.get_u8())?)
            }
            b'T' => Self::RowDescription(decode_row_description(&mut body)?),
            b'D' => Self::DataRow(decode_data_row(&mut body)?),
            b'C' => Self::CommandComplete(get_cstr(&mut body, "command tag")?),
            b'I' => Self::EmptyQueryResponse,
            b'E' => Self::ErrorResponse(ErrorFields::decode(&mut body)?),
            b'N' => Self::NoticeResponse(ErrorFields::decode(&mut body)?),
            b'1' => Self::ParseComplete,
            b'2' => Self::BindComplete,
            b'3' => Self::CloseComplete,
            b'n' => Self::NoData,
            b't' => {
                let count = get_i16(&mut body)?;
                let mut oids = Vec::with_capacity(count.max(0) as usize);
                for _ in 0..count {
                    oids.push(get_i32(&mut body)? as u32);
                }
                Self::ParameterDescription(oids)
            }
            b's' => Self::PortalSuspended,
            b'A' => Self::NotificationResponse {
                process_id: get_i32(&mut body)?,
                channel: get_cstr(&mut body, "channel")?,
                payload: get_cstr(&mut body, "payload")?,
            },
            other => return Err(ProtocolError::UnknownMessage(other)),
        };
        Ok(msg)
    }

    /// Append the encoded message, header included, to `dst`.
    pub fn encode(&self, dst: &mut BytesMut) {
        match self {
            Self::Authentication(auth) => write_message(dst, Some(b'R'), |b| match auth {
                AuthenticationRequest::Ok => b.put_i32(0),
                AuthenticationRequest::CleartextPassword => b.put_i32(3),
                AuthenticationRequest::Md5Password(salt) => {
                    b.put_i32(5);
                    b.put_slice(salt);
                }
                AuthenticationRequest::Sasl(mechanisms) => {
                    b.put_i32(10);
                    for m in mechanisms {
                        put_cstr(b, m);
                    }
                    b.put_u8(0);
                }
                AuthenticationRequest::SaslContinue(data) => {
                    b.put_i32(11);
                    b.put_slice(data);
                }
                AuthenticationRequest::SaslFinal(data) => {
                    b.put_i32(12);
                    b.put_slice(data);
                }
                AuthenticationRequest::Unsupported(code) => b.put_i32(*code),
            }),
            Self::BackendKeyData(key) => write_message(dst, Some(b'K'), |b| {
                b.put_i32(key.process_id);
                b.put_i32(key.secret_key);
            }),
            Self::ParameterStatus { name, value } => write_message(dst, Some(b'S'), |b| {
                put_cstr(b, name);
                put_cstr(b, value);
            }),
            Self::ReadyForQuery(status) => {
                write_message(dst, Some(b'Z'), |b| b.put_u8(status.as_byte()));
            }
            Self::RowDescription(fields) => write_message(dst, Some(b'T'), |b| {
                b.put_i16(fields.len() as i16);
                for f in fields {
                    put_cstr(b, &f.name);
                    b.put_u32(f.table_oid);
                    b.put_i16(f.column_id);
                    b.put_u32(f.type_oid);
                    b.put_i16(f.type_size);
                    b.put_i32(f.type_modifier);
                    b.put_i16(f.format);
                }
            }),
            Self::DataRow(row) => write_message(dst, Some(b'D'), |b| {
                b.put_i16(row.columns.len() as i16);
                for col in &row.columns {
                    match col {
                        Some(v) => {
                            b.put_i32(v.len() as i32);
                            b.put_slice(v);
                        }
                        None => b.put_i32(-1),
                    }
                }
            }),
            Self::CommandComplete(tag) => write_message(dst, Some(b'C'), |b| put_cstr(b, tag)),
            Self::EmptyQueryResponse => write_message(dst, Some(b'I'), |_| {}),
            Self::ErrorResponse(fields) => write_message(dst, Some(b'E'), |b| fields.encode(b)),
            Self::NoticeResponse(fields) => write_message(dst, Some(b'N'), |b| fields.encode(b)),
            Self::ParseComplete => write_message(dst, Some(b'1'), |_| {}),
            Self::BindComplete => write_message(dst, Some(b'2'), |_| {}),
            Self::CloseComplete => write_message(dst, Some(b'3'), |_| {}),
            Self::NoData => write_message(dst, Some(b'n'), |_| {}),
            Self::ParameterDescription(oids) => write_message(dst, Some(b't'), |b| {
                b.put_i16(oids.len() as i16);
                for oid in oids {
                    b.put_u32(*oid);
                }
            }),
            Self::PortalSuspended => write_message(dst, Some(b's'), |_| {}),
            Self::NotificationResponse {
                process_id,
                channel,
                payload,
            } => write_message(dst, Some(b'A'), |b| {
                b.put_i32(*process_id);
                put_cstr(b, channel);
                put_cstr(b, payload);
            }),
        }
    }

    /// Short message name for diagnostics.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Authentication(_) => "Authentication",
            Self::BackendKeyData(_) => "BackendKeyData",
            Self::ParameterStatus { .. } => "ParameterStatus",
            Self::ReadyForQuery(_) => "ReadyForQuery",
            Self::RowDescription(_) => "RowDescription",
            Self::DataRow(_) => "DataRow",
            Self::CommandComplete(_) => "CommandComplete",
            Self::EmptyQueryResponse => "EmptyQueryResponse",
            Self::ErrorResponse(_) => "ErrorResponse",
            Self::NoticeResponse(_) => "NoticeResponse",
            Self::ParseComplete => "ParseComplete",
            Self::BindComplete => "BindComplete",
            Self::CloseComplete => "CloseComplete",
            Self::NoData => "NoData",
            Self::ParameterDescription(_) => "ParameterDescription",
            Self::PortalSuspended => "PortalSuspended",
            Self::NotificationResponse { .. } => "NotificationResponse",
        }
    }
}

fn decode_authentication(body: &mut Bytes) -> Result<AuthenticationRequest, ProtocolError> {
    let code = get_i32(body)?;
    let req = match code {
        0 => AuthenticationRequest::Ok,
        3 => AuthenticationRequest::CleartextPassword,
        5 => {
            ensure(body, 4)?;
            let mut salt = [0u8; 4];
            body.copy_to_slice(&mut salt);
            AuthenticationRequest::Md5Password(salt)
        }
        10 => {
            let mut mechanisms = Vec::new();
            loop {
                let m = get_cstr(body, "SASL mechanism")?;
                if m.is_empty() {
                    break;
                }
                mechanisms.push(m);
            }
            AuthenticationRequest::Sasl(mechanisms)
        }
        11 => AuthenticationRequest::SaslContinue(body.split_off(0)),
        12 => AuthenticationRequest::SaslFinal(body.split_off(0)),
        other => AuthenticationRequest::Unsupported(other),
    };
    Ok(req)
}

fn decode_row_description(body: &mut Bytes) -> Result<Vec<FieldDescription>, ProtocolError> {
    let count = get_i16(body)?;
    let mut fields = Vec::with_capacity(count.max(0) as usize);
    for _ in 0..count {
        let name = get_cstr(body, "column name")?;
        ensure(body, 18)?;
        fields.push(FieldDescription {
            name,
            table_oid: body.get_u32(),
            column_id: body.get_i16(),
            type_oid: body.get_u32(),
            type_size: body.get_i16(),
            type_modifier: body.get_i32(),
            format: body.get_i16(),
        });
    }
    Ok(fields)
}

fn decode_data_row(body: &mut Bytes) -> Result<DataRow, ProtocolError> {
    let count = get_i16(body)?;
    let mut columns = SmallVec::with_capacity(count.max(0) as usize);
    for _ in 0..count {
        let len = get_i32(body)?;
        if len < 0 {
            columns.push(None);
        } else {
            let len = len as usize;
            ensure(body, len)?;
            columns.push(Some(body.split_to(len)));
        }
    }
    Ok(DataRow { columns })
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn roundtrip(msg: &BackendMessage) -> BackendMessage {
        let mut buf = BytesMut::new();
        msg.encode(&mut buf);
        let tag = buf[0];
        let len = i32::from_be_bytes([buf[1], buf[2], buf[3], buf[4]]) as usize;
        assert_eq!(len + 1, buf.len());
        BackendMessage::decode(tag, buf.freeze().slice(5..)).unwrap()
    }

    // =========================================================================
    // Authentication
    // =========================================================================

    #[test]
    fn test_decode_md5_request() {
        let body = Bytes::from_static(&[0, 0, 0, 5, 1, 2, 3, 4]);
        let msg = BackendMessage::decode(b'R', body).unwrap();
        assert_eq!(
            msg,
            BackendMessage::Authentication(AuthenticationRequest::Md5Password([1, 2, 3, 4]))
        );
    }

    #[test]
    fn test_decode_sasl_mechanisms() {
        let body = Bytes::from_static(b"\0\0\0\x0aSCRAM-SHA-256-PLUS\0SCRAM-SHA-256\0\0");
        let msg = BackendMessage::decode(b'R', body).unwrap();
        assert_eq!(
            msg,
            BackendMessage::Authentication(AuthenticationRequest::Sasl(vec![
                "SCRAM-SHA-256-PLUS".into(),
                "SCRAM-SHA-256".into()
            ]))
        );
    }

    #[test]
    fn test_decode_unsupported_auth() {
        let body = Bytes::from_static(&[0, 0, 0, 7]);
        assert_eq!(
            BackendMessage::decode(b'R', body).unwrap(),
            BackendMessage::Authentication(AuthenticationRequest::Unsupported(7))
        );
    }

    // =========================================================================
    // Results
    // =========================================================================

    #[test]
    fn test_data_row_null_column() {
        let row = DataRow {
            columns: SmallVec::from_vec(vec![Some(Bytes::from_static(b"1")), None, Some(Bytes::new())]),
        };
        let decoded = roundtrip(&BackendMessage::DataRow(row.clone()));
        assert_eq!(decoded, BackendMessage::DataRow(row));
    }

    #[test]
    fn test_row_description() {
        let msg = BackendMessage::RowDescription(vec![
            FieldDescription::text("id"),
            FieldDescription::text("email"),
        ]);
        assert_eq!(roundtrip(&msg), msg);
    }

    #[test]
    fn test_ready_for_query_status() {
        for status in [
            TransactionStatus::Idle,
            TransactionStatus::InTransaction,
            TransactionStatus::Failed,
        ] {
            let msg = BackendMessage::ReadyForQuery(status);
            assert_eq!(roundtrip(&msg), msg);
        }
        assert!(BackendMessage::decode(b'Z', Bytes::from_static(b"Q")).is_err());
    }

    // =========================================================================
    // Errors
    // =========================================================================

    #[test]
    fn test_error_response_fields() {
        let body = Bytes::from_static(
            b"SERROR\0VERROR\0C23505\0Mduplicate key value\0Dalready exists\0nusers_email_key\0\0",
        );
        let BackendMessage::ErrorResponse(fields) = BackendMessage::decode(b'E', body).unwrap()
        else {
            unreachable!("expected ErrorResponse");
        };
        assert_eq!(fields.severity, "ERROR");
        assert_eq!(fields.code, "23505");
        assert_eq!(fields.message, "duplicate key value");
        assert_eq!(fields.detail.as_deref(), Some("already exists"));
        assert_eq!(fields.constraint.as_deref(), Some("users_email_key"));
        assert!(!fields.is_fatal());
    }

    #[test]
    fn test_error_prefers_non_localized_severity() {
        let body = Bytes::from_static(b"SFATAL-LOCALISE\0VFATAL\0C57P01\0Mterminating\0\0");
        let BackendMessage::ErrorResponse(fields) = BackendMessage::decode(b'E', body).unwrap()
        else {
            unreachable!("expected ErrorResponse");
        };
        assert_eq!(fields.severity, "FATAL");
        assert!(fields.is_fatal());
    }

    #[test]
    fn test_unknown_tag() {
        assert_eq!(
            BackendMessage::decode(b'?', Bytes::new()),
            Err(ProtocolError::UnknownMessage(b'?'))
        );
    }

    #[test]
    fn test_truncated_data_row() {
        let body = Bytes::from_static(&[0, 1, 0, 0, 0, 10, b'a']);
        assert!(matches!(
            BackendMessage::decode(b'D', body),
            Err(ProtocolError::UnexpectedEof { .. })
        ));
    }

    proptest! {
        #[test]
        fn decode_never_panics(tag in any::<u8>(), body in proptest::collection::vec(any::<u8>(), 0..64)) {
            let _ = BackendMessage::decode(tag, Bytes::from(body));
        }
    }
}
