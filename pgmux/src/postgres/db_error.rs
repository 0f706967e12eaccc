//! Error and notice fields reported by the server.
use bytes::{Buf, Bytes};
use std::fmt;

use super::ProtocolError;
use crate::ext::BytesExt;

/// SQLSTATE reported when a command is canceled by user request.
pub const QUERY_CANCELED: &str = "57014";

/// An error reported by the server through `ErrorResponse`.
///
/// <https://www.postgresql.org/docs/current/protocol-error-fields.html>
#[derive(Clone, Default, PartialEq, Eq)]
pub struct DatabaseError {
    /// `ERROR`, `FATAL`, or `PANIC` (in an error message), or `WARNING`, `NOTICE`, `DEBUG`, `INFO`,
    /// or `LOG` (in a notice message), possibly localized.
    pub severity: String,
    /// Same as `severity`, never localized. Absent on servers older than 9.6.
    pub severity_nonlocalized: Option<String>,
    /// The SQLSTATE code for the error.
    pub code: String,
    /// The primary human-readable error message.
    pub message: String,
    pub detail: Option<String>,
    pub hint: Option<String>,
    /// Error cursor position as an index into the original query string, counted in characters from 1.
    pub position: Option<u32>,
    pub internal_position: Option<u32>,
    pub internal_query: Option<String>,
    /// Context in which the error occurred, like a call stack traceback.
    pub where_: Option<String>,
    pub schema: Option<String>,
    pub table: Option<String>,
    pub column: Option<String>,
    pub data_type: Option<String>,
    pub constraint: Option<String>,
    pub file: Option<String>,
    pub line: Option<u32>,
    pub routine: Option<String>,
}

/// A warning or informational message sent by the server.
///
/// Shares the field layout of [`DatabaseError`].
pub type Notice = DatabaseError;

/// Asynchronous notification from `NOTIFY`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notification {
    /// The process ID of the notifying backend process.
    pub process_id: u32,
    /// The name of the channel that the notify has been raised on.
    pub channel: String,
    /// The "payload" string passed from the notifying process.
    pub payload: String,
}

impl DatabaseError {
    /// Parse `ErrorResponse` or `NoticeResponse` body.
    pub fn parse(mut body: Bytes) -> Result<DatabaseError, ProtocolError> {
        let mut me = DatabaseError::default();

        loop {
            let field = body.try_get_u8()?;
            if field == 0 {
                break;
            }
            let value = body.get_nul_string()?;
            match field {
                b'S' => me.severity = value,
                b'V' => me.severity_nonlocalized = Some(value),
                b'C' => me.code = value,
                b'M' => me.message = value,
                b'D' => me.detail = Some(value),
                b'H' => me.hint = Some(value),
                b'P' => me.position = value.parse().ok(),
                b'p' => me.internal_position = value.parse().ok(),
                b'q' => me.internal_query = Some(value),
                b'W' => me.where_ = Some(value),
                b's' => me.schema = Some(value),
                b't' => me.table = Some(value),
                b'c' => me.column = Some(value),
                b'd' => me.data_type = Some(value),
                b'n' => me.constraint = Some(value),
                b'F' => me.file = Some(value),
                b'L' => me.line = value.parse().ok(),
                b'R' => me.routine = Some(value),
                // frontends should silently ignore fields of unrecognized type
                _ => {}
            }
        }

        Ok(me)
    }

    /// Construct an error carrying only a code and message.
    pub(crate) fn new(code: &str, message: impl Into<String>) -> DatabaseError {
        DatabaseError {
            severity: "ERROR".into(),
            code: code.into(),
            message: message.into(),
            ..Default::default()
        }
    }

    /// The SQLSTATE code.
    pub fn code(&self) -> &str {
        &self.code
    }

    /// Returns `true` if the command was canceled by user request.
    pub fn is_query_canceled(&self) -> bool {
        self.code == QUERY_CANCELED
    }

    /// Returns `true` if the server is about to terminate the session.
    pub fn is_fatal(&self) -> bool {
        let severity = self.severity_nonlocalized.as_deref().unwrap_or(&self.severity);
        matches!(severity, "FATAL" | "PANIC")
    }

    /// Returns `true` for invalid authorization specification and invalid password class.
    pub fn is_auth_failure(&self) -> bool {
        self.code.starts_with("28")
    }
}

impl std::error::Error for DatabaseError { }

impl fmt::Display for DatabaseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {} (SQLSTATE {})", self.severity, self.message, self.code)?;
        if let Some(detail) = &self.detail {
            write!(f, "\nDETAIL: {detail}")?;
        }
        if let Some(hint) = &self.hint {
            write!(f, "\nHINT: {hint}")?;
        }
        Ok(())
    }
}

impl fmt::Debug for DatabaseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "\"{self}\"")
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn parse_fields() {
        let body = Bytes::from_static(
            b"SERROR\0VERROR\0C23505\0Mduplicate key\0Dkey (id)=(1) exists\0P12\0tusers\0Zunknown\0\0",
        );
        let err = DatabaseError::parse(body).unwrap();
        assert_eq!(err.code(), "23505");
        assert_eq!(err.message, "duplicate key");
        assert_eq!(err.detail.as_deref(), Some("key (id)=(1) exists"));
        assert_eq!(err.position, Some(12));
        assert_eq!(err.table.as_deref(), Some("users"));
        assert!(!err.is_fatal());
        assert!(!err.is_query_canceled());
    }

    #[test]
    fn missing_terminator() {
        assert!(DatabaseError::parse(Bytes::from_static(b"SERROR\0")).is_err());
    }
}
