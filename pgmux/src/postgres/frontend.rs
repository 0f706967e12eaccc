//! Postgres Frontend Messages
//!
//! <https://www.postgresql.org/docs/current/protocol-message-formats.html>
use bytes::{BufMut, Bytes, BytesMut};

use super::{Oid, PgFormat};
use crate::ext::{BufMutExt, StrExt, UsizeExt};

/// Protocol version 3.0.
pub const PROTOCOL_VERSION: u32 = 196_608;

/// Code sent in place of protocol version for [`CancelRequest`].
pub const CANCEL_REQUEST_CODE: u32 = 80_877_102;

/// Most parameters a single `Parse` or `Bind` can carry, counts are sent as `int16`.
pub const MAX_PARAMS: usize = u16::MAX as usize;

/// Largest message the `int32` length field can describe.
pub const MAX_MESSAGE_LEN: usize = i32::MAX as usize;

/// Write a frontend message to `buf`.
pub fn write<F: FrontendProtocol>(msg: F, buf: &mut BytesMut) {
    // msgtype + length
    const PREFIX: usize = 1 + 4;

    let size_hint = msg.size_hint();
    buf.reserve(PREFIX + size_hint as usize);

    let offset = buf.len();
    buf.put_u8(F::MSGTYPE);
    buf.put_u32(4 + size_hint);

    msg.encode(&mut *buf);

    debug_assert_eq!(
        buf.len() - offset,
        PREFIX + size_hint as usize,
        "Frontend message body size not equal to size hint"
    );
}

/// A type which can be encoded into postgres frontend message
pub trait FrontendProtocol {
    /// Message type.
    const MSGTYPE: u8;

    /// Size of the main body.
    ///
    /// Note that this is **only** the size of main body as oppose of actual postgres message which
    /// include the length itself.
    fn size_hint(&self) -> u32;

    /// Write the main body of the message.
    ///
    /// The lenght of body written must be equal to the
    /// length returned by [`size_hint`][FrontendProtocol::size_hint].
    fn encode(self, buf: impl BufMut);
}

/// Postgres Startup frontend message
///
/// For historical reasons, the very first message sent by the client (the [`Startup`] message)
/// has no initial message-type byte, thus [`Startup`] does not implement [`FrontendProtocol`].
///
/// To write startup message, use [`Startup::write`].
#[derive(Debug)]
pub struct Startup<'a> {
    /// The database user name to connect as. Required; there is no default.
    pub user: &'a str,
    /// The database to connect to. Defaults to the user name.
    pub database: Option<&'a str>,
    /// Used to connect in streaming replication mode.
    pub replication: Option<&'a str>,
    /// Other run-time parameters, applied as session defaults.
    pub params: &'a [(&'a str, &'a str)],
}

impl Startup<'_> {
    pub fn write(self, buf: &mut BytesMut) {
        let offset = buf.len();

        // reserve 4 bytes for length
        buf.put_u32(0);
        buf.put_u32(PROTOCOL_VERSION);

        buf.put_nul_string("user");
        buf.put_nul_string(self.user);

        if let Some(db) = self.database {
            buf.put_nul_string("database");
            buf.put_nul_string(db);
        }

        if let Some(repl) = self.replication {
            buf.put_nul_string("replication");
            buf.put_nul_string(repl);
        }

        for (name, value) in self.params {
            buf.put_nul_string(name);
            buf.put_nul_string(value);
        }

        buf.put_u8(b'\0');

        let mut written_buf = &mut buf[offset..];
        written_buf.put_u32(written_buf.len().to_u32());
    }
}

/// Request to cancel the command currently running on another connection.
///
/// Sent on a brand new connection instead of [`Startup`], the server closes that connection
/// right after reading it, without any response.
#[derive(Debug, Clone, Copy)]
pub struct CancelRequest {
    /// The process ID of the target backend.
    pub process_id: u32,
    /// The secret key for the target backend.
    pub secret_key: u32,
}

impl CancelRequest {
    /// Length of the message, including the length itself.
    pub const LEN: u32 = 16;

    pub fn write(self, buf: &mut BytesMut) {
        buf.reserve(Self::LEN as usize);
        buf.put_u32(Self::LEN);
        buf.put_u32(CANCEL_REQUEST_CODE);
        buf.put_u32(self.process_id);
        buf.put_u32(self.secret_key);
    }
}

macro_rules! size_of {
    ($s1:tt.$f1:ident as $t1:ty, in ..$len:expr) => {
        ($len as u32 * size_of::<$t1>() as u32)
    };
    ($self:tt.$field:ident) => {
        (size_of_val(&$self.$field) as u32)
    };
}

/// Identifies the message as a password response.
#[derive(Debug)]
pub struct PasswordMessage<'a> {
    /// The password (encrypted, if requested)
    pub password: &'a str,
}

impl FrontendProtocol for PasswordMessage<'_> {
    const MSGTYPE: u8 = b'p';

    fn size_hint(&self) -> u32 {
        self.password.nul_string_len()
    }

    fn encode(self, mut buf: impl BufMut) {
        buf.put_nul_string(self.password);
    }
}

/// Identifies the message as an initial SASL response.
pub struct SaslInitialResponse<'a> {
    /// Name of the SASL authentication mechanism that the client selected.
    pub mechanism: &'a str,
    /// SASL mechanism specific "Initial Response".
    pub data: &'a [u8],
}

impl FrontendProtocol for SaslInitialResponse<'_> {
    const MSGTYPE: u8 = b'p';

    fn size_hint(&self) -> u32 {
        self.mechanism.nul_string_len() + 4 + self.data.len().to_u32()
    }

    fn encode(self, mut buf: impl BufMut) {
        buf.put_nul_string(self.mechanism);
        buf.put_i32(self.data.len().to_u32() as i32);
        buf.put(self.data);
    }
}

/// Identifies the message as a SASL response.
pub struct SaslResponse<'a> {
    /// SASL mechanism specific message data.
    pub data: &'a [u8],
}

impl FrontendProtocol for SaslResponse<'_> {
    const MSGTYPE: u8 = b'p';

    fn size_hint(&self) -> u32 {
        self.data.len().to_u32()
    }

    fn encode(self, mut buf: impl BufMut) {
        buf.put(self.data);
    }
}

/// Identifies the message as a simple query
pub struct Query<'a> {
    /// the query string itself
    pub sql: &'a str,
}

impl FrontendProtocol for Query<'_> {
    const MSGTYPE: u8 = b'Q';

    fn size_hint(&self) -> u32 {
        self.sql.nul_string_len()
    }

    fn encode(self, mut buf: impl BufMut) {
        buf.put_nul_string(self.sql);
    }
}

/// Identifies the message as a Parse command
pub struct Parse<'a> {
    /// prepared statement name (an empty string selects the unnamed prepared statement).
    pub prepare_name: &'a str,
    /// The query string to be parsed.
    pub sql: &'a str,
    /// Prespecified parameter types, zero leaves the type unspecified.
    pub oids: &'a [Oid],
}

impl FrontendProtocol for Parse<'_> {
    const MSGTYPE: u8 = b'P';

    fn size_hint(&self) -> u32 {
        self.prepare_name.nul_string_len()
            + self.sql.nul_string_len()
            + 2
            + size_of!(self.oids as Oid, in ..self.oids.len())
    }

    fn encode(self, mut buf: impl BufMut) {
        buf.put_nul_string(self.prepare_name);
        buf.put_nul_string(self.sql);
        buf.put_u16(self.oids.len().to_u16());
        for oid in self.oids {
            buf.put_u32(*oid);
        }
    }
}

/// Identifies the message as a Sync command
pub struct Sync;

impl FrontendProtocol for Sync {
    const MSGTYPE: u8 = b'S';

    fn size_hint(&self) -> u32 { 0 }

    fn encode(self, _: impl BufMut) { }
}

/// Identifies the message as a Flush command
pub struct Flush;

impl FrontendProtocol for Flush {
    const MSGTYPE: u8 = b'H';

    fn size_hint(&self) -> u32 { 0 }

    fn encode(self, _: impl BufMut) { }
}

/// Identifies the message as a termination.
pub struct Terminate;

impl FrontendProtocol for Terminate {
    const MSGTYPE: u8 = b'X';

    fn size_hint(&self) -> u32 { 0 }

    fn encode(self, _: impl BufMut) { }
}

/// Identifies the message as a Bind command.
pub struct Bind<'a> {
    /// The name of the destination portal (an empty string selects the unnamed portal).
    pub portal_name: &'a str,
    /// The name of the source prepared statement (an empty string selects the unnamed prepared statement).
    pub stmt_name: &'a str,
    /// Zero entries means all text, one entry applies to all parameters,
    /// otherwise one entry per parameter.
    pub param_formats: &'a [PgFormat],
    /// Parameter values, `None` is NULL.
    pub params: &'a [Option<Bytes>],
    /// Same rules as `param_formats`, applied to result columns.
    pub result_formats: &'a [PgFormat],
}

impl FrontendProtocol for Bind<'_> {
    const MSGTYPE: u8 = b'B';

    fn size_hint(&self) -> u32 {
        let params = self
            .params
            .iter()
            .map(|e| 4 + e.as_ref().map(|e| e.len().to_u32()).unwrap_or(0))
            .sum::<u32>();

        self.portal_name.nul_string_len()
            + self.stmt_name.nul_string_len()
            + 2
            + size_of!(self.param_formats as u16, in ..self.param_formats.len())
            + 2
            + params
            + 2
            + size_of!(self.result_formats as u16, in ..self.result_formats.len())
    }

    fn encode(self, mut buf: impl BufMut) {
        buf.put_nul_string(self.portal_name);
        buf.put_nul_string(self.stmt_name);

        buf.put_u16(self.param_formats.len().to_u16());
        for format in self.param_formats {
            buf.put_u16(format.format_code());
        }

        buf.put_u16(self.params.len().to_u16());
        for param in self.params {
            match param {
                Some(value) => {
                    buf.put_i32(value.len().to_u32() as i32);
                    buf.put_slice(value);
                }
                None => buf.put_i32(-1),
            }
        }

        buf.put_u16(self.result_formats.len().to_u16());
        for format in self.result_formats {
            buf.put_u16(format.format_code());
        }
    }
}

/// Identifies the message as a Execute command
pub struct Execute<'a> {
    /// The name of the portal to execute (an empty string selects the unnamed portal).
    pub portal_name: &'a str,
    /// Maximum number of rows to return, if portal contains a query that returns rows
    /// (ignored otherwise). Zero denotes “no limit”.
    pub max_row: u32,
}

impl FrontendProtocol for Execute<'_> {
    const MSGTYPE: u8 = b'E';

    fn size_hint(&self) -> u32 {
        self.portal_name.nul_string_len() + size_of!(self.max_row)
    }

    fn encode(self, mut buf: impl BufMut) {
        buf.put_nul_string(self.portal_name);
        buf.put_u32(self.max_row);
    }
}

/// Identifies the message as a Close command
pub struct Close<'a> {
    /// 'S' to close a prepared statement; or 'P' to close a portal.
    pub variant: u8,
    /// The name of the prepared statement or portal to close
    /// (an empty string selects the unnamed prepared statement or portal).
    pub name: &'a str,
}

impl FrontendProtocol for Close<'_> {
    const MSGTYPE: u8 = b'C';

    fn size_hint(&self) -> u32 {
        size_of!(self.variant) + self.name.nul_string_len()
    }

    fn encode(self, mut buf: impl BufMut) {
        buf.put_u8(self.variant);
        buf.put_nul_string(self.name);
    }
}

/// Identifies the message as a Describe command.
pub struct Describe<'a> {
    /// 'S' to describe a prepared statement; or 'P' to describe a portal.
    pub kind: u8,
    /// The name of the prepared statement or portal to describe
    /// (an empty string selects the unnamed prepared statement or portal).
    pub name: &'a str,
}

impl FrontendProtocol for Describe<'_> {
    const MSGTYPE: u8 = b'D';

    fn size_hint(&self) -> u32 {
        size_of!(self.kind) + self.name.nul_string_len()
    }

    fn encode(self, mut buf: impl BufMut) {
        buf.put_u8(self.kind);
        buf.put_nul_string(self.name);
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn startup_layout() {
        let mut buf = BytesMut::new();
        Startup { user: "alice", database: Some("app"), replication: None, params: &[("client_encoding", "UTF8")] }
            .write(&mut buf);

        let len = u32::from_be_bytes(buf[..4].try_into().unwrap());
        assert_eq!(len as usize, buf.len());
        assert_eq!(&buf[4..8], &196_608u32.to_be_bytes());
        assert_eq!(&buf[8..], b"user\0alice\0database\0app\0client_encoding\0UTF8\0\0");
    }

    #[test]
    fn cancel_request_layout() {
        let mut buf = BytesMut::new();
        CancelRequest { process_id: 7, secret_key: 0xdead_beef }.write(&mut buf);
        assert_eq!(
            &buf[..],
            &[0, 0, 0, 16, 0x04, 0xd2, 0x16, 0x2e, 0, 0, 0, 7, 0xde, 0xad, 0xbe, 0xef]
        );
    }

    #[test]
    fn bind_with_null() {
        let mut buf = BytesMut::new();
        let params = [Some(Bytes::from_static(&[0, 0, 0, 1])), None];
        write(Bind {
            portal_name: "p1",
            stmt_name: "",
            param_formats: &[PgFormat::Binary],
            params: &params,
            result_formats: &[PgFormat::Binary],
        }, &mut buf);

        assert_eq!(buf[0], b'B');
        let len = u32::from_be_bytes(buf[1..5].try_into().unwrap());
        assert_eq!(len as usize, buf.len() - 1);
        assert_eq!(
            &buf[5..],
            b"p1\0\0\0\x01\0\x01\0\x02\0\0\0\x04\0\0\0\x01\xff\xff\xff\xff\0\x01\0\x01"
        );
    }

    #[test]
    fn sasl_initial_response() {
        let mut buf = BytesMut::new();
        write(SaslInitialResponse { mechanism: "SCRAM-SHA-256", data: b"n,,n=,r=abc" }, &mut buf);
        assert_eq!(buf[0], b'p');
        assert_eq!(&buf[5..], b"SCRAM-SHA-256\0\0\0\0\x0bn,,n=,r=abc");
    }
}
