//! Postgres Backend Messages
use bytes::{Buf, Bytes};
use std::sync::Arc;

use super::{DatabaseError, Notice, Notification, Oid, PgFormat, ProtocolError};
use crate::ext::BytesExt;

/// A type that can be decoded into postgres backend message
pub trait BackendProtocol: Sized {
    fn decode(msgtype: u8, body: Bytes) -> Result<Self,ProtocolError>;
}

/// Postgres backend messages
#[derive(Debug)]
pub enum BackendMessage {
    Authentication(Authentication),
    BackendKeyData(BackendKeyData),
    BindComplete(BindComplete),
    CloseComplete(CloseComplete),
    CommandComplete(CommandComplete),
    DataRow(DataRow),
    ErrorResponse(ErrorResponse),
    EmptyQueryResponse(EmptyQueryResponse),
    NegotiateProtocolVersion(NegotiateProtocolVersion),
    NoData(NoData),
    NoticeResponse(NoticeResponse),
    NotificationResponse(NotificationResponse),
    ParameterDescription(ParameterDescription),
    ParameterStatus(ParameterStatus),
    ParseComplete(ParseComplete),
    PortalSuspended(PortalSuspended),
    ReadyForQuery(ReadyForQuery),
    RowDescription(RowDescription),
}

macro_rules! match_backend {
    ($($name:ident,)*) => {
        impl BackendMessage {
            pub fn msgtype(&self) -> u8 {
                match self {
                    $(Self::$name(_) => $name::MSGTYPE,)*
                }
            }

            /// Get message name from message type.
            ///
            /// Returns `"Unknown"` for unknown message type.
            pub fn message_name(msgtype: u8) -> &'static str {
                match msgtype {
                    $($name::MSGTYPE => stringify!($name),)*
                    _ => "Unknown",
                }
            }
        }
        impl BackendProtocol for BackendMessage {
            fn decode(msgtype: u8, body: Bytes) -> Result<Self, ProtocolError> {
                let message = match msgtype {
                    $($name::MSGTYPE => Self::$name(<$name as BackendProtocol>::decode(msgtype, body)?),)*
                    _ => return Err(ProtocolError::unknown(msgtype)),
                };
                Ok(message)
            }
        }
    };
}

match_backend! {
    Authentication,
    BackendKeyData,
    BindComplete,
    CloseComplete,
    CommandComplete,
    DataRow,
    ErrorResponse,
    EmptyQueryResponse,
    NegotiateProtocolVersion,
    NoData,
    NoticeResponse,
    NotificationResponse,
    ParameterDescription,
    ParameterStatus,
    ParseComplete,
    PortalSuspended,
    ReadyForQuery,
    RowDescription,
}

impl BackendMessage {
    /// Convert into [`ProtocolError`] reporting this message as unexpected in given phase.
    pub fn unexpected(&self, phase: &'static str) -> ProtocolError {
        ProtocolError::unexpected_phase(self.msgtype(), phase)
    }
}

macro_rules! assert_msgtype {
    ($typ:ident) => {
        if Self::MSGTYPE != $typ {
            return Err(ProtocolError::unexpected(Self::MSGTYPE,$typ))
        }
    };
}

/// Identifies the message as an authentication request.
#[derive(Debug)]
pub enum Authentication {
    /// Specifies that the authentication was successful.
    Ok,
    /// Specifies that Kerberos V5 authentication is required.
    KerberosV5,
    /// Specifies that a clear-text password is required.
    CleartextPassword,
    /// Specifies that an MD5-encrypted password is required.
    MD5Password {
        /// The salt to use when encrypting the password.
        salt: [u8;4],
    },
    /// Specifies that GSSAPI authentication is required.
    GSS,
    /// GSSAPI or SSPI authentication data.
    GSSContinue {
        data: Bytes,
    },
    /// Specifies that SSPI authentication is required.
    SSPI,
    /// Specifies that SASL authentication is required.
    SASL {
        /// SASL authentication mechanisms, in the server's order of preference.
        mechanisms: Vec<String>,
    },
    /// Specifies that this message contains a SASL challenge.
    SASLContinue {
        /// SASL data, specific to the SASL mechanism being used.
        data: Bytes,
    },
    /// Specifies that SASL authentication has completed.
    SASLFinal {
        /// SASL outcome "additional data", specific to the SASL mechanism being used.
        data: Bytes,
    },
}

impl Authentication {
    pub const MSGTYPE: u8 = b'R';

    /// Name of the authentication method, for error reporting.
    pub fn method_name(&self) -> &'static str {
        match self {
            Authentication::Ok => "ok",
            Authentication::KerberosV5 => "kerberos v5",
            Authentication::CleartextPassword => "cleartext password",
            Authentication::MD5Password { .. } => "md5 password",
            Authentication::GSS | Authentication::GSSContinue { .. } => "gssapi",
            Authentication::SSPI => "sspi",
            Authentication::SASL { .. } => "sasl",
            Authentication::SASLContinue { .. } => "sasl continue",
            Authentication::SASLFinal { .. } => "sasl final",
        }
    }
}

impl BackendProtocol for Authentication {
    fn decode(msgtype: u8, mut body: Bytes) -> Result<Self,ProtocolError> {
        assert_msgtype!(msgtype);
        let auth = match body.try_get_u32()? {
            0 => Authentication::Ok,
            2 => Authentication::KerberosV5,
            3 => Authentication::CleartextPassword,
            5 => Authentication::MD5Password { salt: body.try_get_u32()?.to_be_bytes(), },
            7 => Authentication::GSS,
            8 => Authentication::GSSContinue { data: body },
            9 => Authentication::SSPI,
            10 => {
                let mut mechanisms = vec![];
                loop {
                    let name = body.get_nul_string()?;
                    if name.is_empty() {
                        break;
                    }
                    mechanisms.push(name);
                }
                Authentication::SASL { mechanisms }
            },
            11 => Authentication::SASLContinue { data: body },
            12 => Authentication::SASLFinal { data: body },
            auth => return Err(ProtocolError::unknown_auth(auth)),
        };
        Ok(auth)
    }
}

/// Identifies the message as cancellation key data.
///
/// The frontend must save these values if it wishes to be able to issue CancelRequest messages later.
#[derive(Debug, Clone, Copy)]
pub struct BackendKeyData {
    /// The process ID of this backend.
    pub process_id: u32,
    /// The secret key of this backend.
    pub secret_key: u32,
}

impl BackendKeyData {
    pub const MSGTYPE: u8 = b'K';
}

impl BackendProtocol for BackendKeyData {
    fn decode(msgtype: u8, mut body: Bytes) -> Result<Self,ProtocolError> {
        assert_msgtype!(msgtype);
        Ok(Self {
            process_id: body.try_get_u32()?,
            secret_key: body.try_get_u32()?,
        })
    }
}

/// Identifies the message as a run-time parameter status report
#[derive(Debug)]
pub struct ParameterStatus {
    /// The name of the run-time parameter being reported
    pub name: String,
    /// The current value of the parameter
    pub value: String
}

impl ParameterStatus {
    pub const MSGTYPE: u8 = b'S';
}

impl BackendProtocol for ParameterStatus {
    fn decode(msgtype: u8, mut body: Bytes) -> Result<Self,ProtocolError> {
        assert_msgtype!(msgtype);
        Ok(Self {
            name: body.get_nul_string()?,
            value: body.get_nul_string()?,
        })
    }
}

/// A warning message. The frontend should display the message.
#[derive(Debug)]
pub struct NoticeResponse {
    pub notice: Notice,
}

impl NoticeResponse {
    pub const MSGTYPE: u8 = b'N';
}

impl BackendProtocol for NoticeResponse {
    fn decode(msgtype: u8, body: Bytes) -> Result<Self,ProtocolError> {
        assert_msgtype!(msgtype);
        Ok(NoticeResponse { notice: DatabaseError::parse(body)? })
    }
}

/// Identifies the message as an error
#[derive(Debug)]
pub struct ErrorResponse {
    pub error: DatabaseError,
}

impl ErrorResponse {
    pub const MSGTYPE: u8 = b'E';
}

impl BackendProtocol for ErrorResponse {
    fn decode(msgtype: u8, body: Bytes) -> Result<Self,ProtocolError> {
        assert_msgtype!(msgtype);
        Ok(Self { error: DatabaseError::parse(body)? })
    }
}

/// Identifies the message as a notification response.
#[derive(Debug)]
pub struct NotificationResponse {
    pub notification: Notification,
}

impl NotificationResponse {
    pub const MSGTYPE: u8 = b'A';
}

impl BackendProtocol for NotificationResponse {
    fn decode(msgtype: u8, mut body: Bytes) -> Result<Self,ProtocolError> {
        assert_msgtype!(msgtype);
        Ok(Self {
            notification: Notification {
                process_id: body.try_get_u32()?,
                channel: body.get_nul_string()?,
                payload: body.get_nul_string()?,
            },
        })
    }
}

/// A single field of a [`RowDescription`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldDescription {
    /// The field name.
    pub name: Arc<str>,
    /// If the field can be identified as a column of a specific table, the object ID of the table; otherwise zero.
    pub table_oid: Oid,
    /// If the field can be identified as a column of a specific table, the attribute number of the column; otherwise zero.
    pub column_id: i16,
    /// The object ID of the field's data type.
    pub type_oid: Oid,
    /// The data type size (see pg_type.typlen). Note that negative values denote variable-width types.
    pub type_size: i16,
    /// The type modifier (see pg_attribute.atttypmod). The meaning of the modifier is type-specific.
    pub type_modifier: i32,
    /// The format code being used for the field.
    pub format: PgFormat,
}

/// Identifies the message as a row description
#[derive(Debug)]
pub struct RowDescription {
    pub fields: Vec<FieldDescription>,
}

impl RowDescription {
    pub const MSGTYPE: u8 = b'T';
}

impl BackendProtocol for RowDescription {
    fn decode(msgtype: u8, mut body: Bytes) -> Result<Self, ProtocolError> {
        assert_msgtype!(msgtype);
        let len = body.try_get_u16()?;
        let mut fields = Vec::with_capacity(len as usize);
        for _ in 0..len {
            let name = body.get_nul_string()?;
            fields.push(FieldDescription {
                name: name.into(),
                table_oid: body.try_get_u32()?,
                column_id: body.try_get_i16()?,
                type_oid: body.try_get_u32()?,
                type_size: body.try_get_i16()?,
                type_modifier: body.try_get_i32()?,
                format: PgFormat::from_code(body.try_get_u16()?)?,
            });
        }
        Ok(Self { fields })
    }
}

/// Identifies the message as a data row.
#[derive(Debug)]
pub struct DataRow {
    /// Column values, `None` is NULL.
    pub values: Vec<Option<Bytes>>,
}

impl DataRow {
    pub const MSGTYPE: u8 = b'D';
}

impl BackendProtocol for DataRow {
    fn decode(msgtype: u8, mut body: Bytes) -> Result<Self, ProtocolError> {
        assert_msgtype!(msgtype);
        let len = body.try_get_u16()?;
        let mut values = Vec::with_capacity(len as usize);
        for _ in 0..len {
            values.push(body.get_value()?);
        }
        Ok(Self { values })
    }
}

/// Identifies the message as a command-completed response
///
/// For an INSERT command, the tag is `INSERT oid rows`, where rows is the number of rows inserted.
/// For DELETE, UPDATE, MERGE, SELECT, MOVE, FETCH and COPY, the tag is `<COMMAND> rows`.
#[derive(Debug)]
pub struct CommandComplete {
    /// The command tag. This is usually a single word that identifies which SQL command was completed.
    pub tag: String,
}

impl CommandComplete {
    pub const MSGTYPE: u8 = b'C';

    /// Number of rows affected, if the command reports one.
    pub fn rows_affected(&self) -> Option<u64> {
        let mut words = self.tag.split_whitespace();
        let nth = match words.next()? {
            "INSERT" => 1,
            "SELECT" | "UPDATE" | "DELETE" | "MERGE" | "FETCH" | "MOVE" | "COPY" => 0,
            _ => return None,
        };
        words.nth(nth)?.parse().ok()
    }
}

impl BackendProtocol for CommandComplete {
    fn decode(msgtype: u8, mut body: Bytes) -> Result<Self, ProtocolError> {
        assert_msgtype!(msgtype);
        Ok(Self {
            tag: body.get_nul_string()?,
        })
    }
}

/// Identifies the message as a protocol version negotiation message.
#[derive(Debug)]
pub struct NegotiateProtocolVersion {
    /// Newest minor protocol version supported by the server for the major protocol version requested by the client.
    pub minor: u32,
    /// Protocol options not recognized by the server.
    pub unrecognized: Vec<String>,
}

impl NegotiateProtocolVersion {
    pub const MSGTYPE: u8 = b'v';
}

impl BackendProtocol for NegotiateProtocolVersion {
    fn decode(msgtype: u8, mut body: Bytes) -> Result<Self,ProtocolError> {
        assert_msgtype!(msgtype);
        let minor = body.try_get_u32()?;
        let len = body.try_get_u32()?;
        let mut unrecognized = vec![];
        for _ in 0..len {
            unrecognized.push(body.get_nul_string()?);
        }
        Ok(Self { minor, unrecognized })
    }
}

/// Identifies the message as a parameter description.
#[derive(Debug)]
pub struct ParameterDescription {
    /// The object ID of each parameter data type.
    pub oids: Vec<Oid>,
}

impl ParameterDescription  {
    pub const MSGTYPE: u8 = b't';
}

impl BackendProtocol for ParameterDescription {
    fn decode(msgtype: u8, mut body: Bytes) -> Result<Self,ProtocolError> {
        assert_msgtype!(msgtype);
        let len = body.try_get_u16()?;
        let mut oids = Vec::with_capacity(len as usize);
        for _ in 0..len {
            oids.push(body.try_get_u32()?);
        }
        Ok(Self { oids })
    }
}

/// Identifies the message type. ReadyForQuery is sent whenever the backend is ready for a new query cycle.
#[derive(Debug)]
pub struct ReadyForQuery {
    /// Current backend transaction status indicator.
    ///
    /// `I` if idle (not in a transaction block), `T` if in a transaction block,
    /// or `E` if in a failed transaction block.
    pub tx_status: u8,
}

impl ReadyForQuery {
    pub const MSGTYPE: u8 = b'Z';
}

impl BackendProtocol for ReadyForQuery {
    fn decode(msgtype: u8, mut body: Bytes) -> Result<Self,ProtocolError> {
        assert_msgtype!(msgtype);
        match body.try_get_u8()? {
            tx_status @ (b'I' | b'T' | b'E') => Ok(Self { tx_status }),
            _ => Err(ProtocolError::malformed("unknown transaction status")),
        }
    }
}

macro_rules! unit_msg {
    ($(
        $(#[$doc:meta])* struct $name:ident, $ty:literal;
    )*) => {$(
            $(#[$doc])*
            #[derive(Debug)]
            pub struct $name;

            impl $name {
                pub const MSGTYPE: u8 = $ty;
            }

            impl BackendProtocol for $name {
                fn decode(msgtype: u8, _: Bytes) -> Result<Self,ProtocolError> {
                    if $name::MSGTYPE != msgtype {
                        return Err(ProtocolError::unexpected(Self::MSGTYPE,msgtype))
                    }
                    Ok(Self)
                }
            }
    )*};
}

unit_msg! {
    /// Identifies the message as a Bind-complete indicator.
    struct BindComplete, b'2';

    /// Identifies the message as a Close-complete indicator.
    struct CloseComplete, b'3';

    /// Identifies the message as a response to an empty query string.
    ///
    /// This substitutes for CommandComplete.
    struct EmptyQueryResponse, b'I';

    /// Identifies the message as a no-data indicator.
    struct NoData, b'n';

    /// Identifies the message as a Parse-complete indicator.
    struct ParseComplete, b'1';

    /// Identifies the message as a portal-suspended indicator.
    ///
    /// Note this only appears if an Execute message's row-count limit was reached.
    struct PortalSuspended, b's';
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn command_tag_rows() {
        let tag = |t: &str| CommandComplete { tag: t.into() }.rows_affected();
        assert_eq!(tag("INSERT 0 5"), Some(5));
        assert_eq!(tag("UPDATE 3"), Some(3));
        assert_eq!(tag("SELECT 10"), Some(10));
        assert_eq!(tag("CREATE TABLE"), None);
        assert_eq!(tag("BEGIN"), None);
    }

    #[test]
    fn sasl_mechanisms() {
        let body = Bytes::from_static(b"\0\0\0\x0aSCRAM-SHA-256-PLUS\0SCRAM-SHA-256\0\0");
        let Authentication::SASL { mechanisms } = Authentication::decode(b'R', body).unwrap() else {
            panic!("expected SASL")
        };
        assert_eq!(mechanisms, ["SCRAM-SHA-256-PLUS", "SCRAM-SHA-256"]);
    }

    #[test]
    fn truncated_body_is_error() {
        assert!(BackendKeyData::decode(b'K', Bytes::from_static(b"\0\0\0\x01")).is_err());
        assert!(DataRow::decode(b'D', Bytes::from_static(b"\0\x01\0\0\0\x08abc")).is_err());
        assert!(ReadyForQuery::decode(b'Z', Bytes::from_static(b"X")).is_err());
    }
}
