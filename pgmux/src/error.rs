//! `pgmux` error types.
use std::{backtrace::Backtrace, borrow::Cow, fmt, io, time::Duration};

use crate::{
    auth::AuthError,
    connection::ConfigError,
    postgres::{DatabaseError, ProtocolError},
    row::{DecodeError, RowNotFound},
};

/// A specialized [`Result`] type for `pgmux` operation.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// All possible error from `pgmux` library.
pub struct Error {
    context: String,
    backtrace: Backtrace,
    kind: ErrorKind,
}

impl Error {
    pub fn kind(&self) -> &ErrorKind {
        &self.kind
    }

    pub fn into_kind(self) -> ErrorKind {
        self.kind
    }

    pub fn backtrace(&self) -> &Backtrace {
        &self.backtrace
    }

    /// Prefix the error message with `context`.
    pub fn context(mut self, context: impl Into<String>) -> Self {
        self.context = context.into();
        self
    }

    /// Returns server reported error, if any.
    pub fn as_database(&self) -> Option<&DatabaseError> {
        match &self.kind {
            ErrorKind::Database(e) | ErrorKind::Cancelled(Some(e)) => Some(e),
            ErrorKind::Auth(AuthError::Rejected(e)) => Some(e),
            _ => None,
        }
    }

    /// Returns the SQLSTATE code of server reported error.
    pub fn code(&self) -> Option<&str> {
        self.as_database().map(DatabaseError::code)
    }

    /// Returns `true` if this error leaves the connection unusable.
    ///
    /// A server error for one statement is not fatal, the session stays synchronized.
    pub fn is_fatal(&self) -> bool {
        match &self.kind {
            ErrorKind::Protocol(_) | ErrorKind::Io(_) | ErrorKind::Closed(_) | ErrorKind::Auth(_) => true,
            ErrorKind::Database(e) => e.is_fatal(),
            _ => false,
        }
    }

    /// Returns `true` if the command was canceled, either by a cancel request or a pending read cancellation.
    pub fn is_cancelled(&self) -> bool {
        matches!(self.kind, ErrorKind::Cancelled(_))
    }

    pub(crate) fn closed(reason: impl Into<Cow<'static, str>>) -> Self {
        ErrorKind::Closed(reason.into()).into()
    }

    pub(crate) fn cancelled() -> Self {
        ErrorKind::Cancelled(None).into()
    }

    pub(crate) fn pool_timeout(waited: Duration) -> Self {
        ErrorKind::PoolTimeout(waited).into()
    }

    pub(crate) fn config(reason: impl Into<Cow<'static, str>>) -> Self {
        ConfigError::new(reason).into()
    }
}

/// All possible error kind from `pgmux` library.
pub enum ErrorKind {
    /// Invalid configuration or invalid use of the api.
    Config(ConfigError),
    /// Malformed or out of order backend message.
    Protocol(ProtocolError),
    Io(io::Error),
    Auth(AuthError),
    /// Error reported by the server.
    Database(DatabaseError),
    /// Command canceled, carries the server error when canceled out of band.
    Cancelled(Option<DatabaseError>),
    /// No pooled connection became available in time.
    PoolTimeout(Duration),
    /// Connection already failed or closed.
    Closed(Cow<'static, str>),
    Decode(DecodeError),
    RowNotFound(RowNotFound),
}

macro_rules! from {
    (<$ty:ty>$pat:pat => $body:expr) => {
        impl From<$ty> for Error {
            fn from($pat: $ty) -> Self {
                let backtrace = std::backtrace::Backtrace::capture();
                Self { context: String::new(), backtrace, kind: $body }
            }
        }
    };
}

from!(<ErrorKind>e => e);
from!(<ConfigError>e => ErrorKind::Config(e));
from!(<ProtocolError>e => ErrorKind::Protocol(e));
from!(<io::Error>e => ErrorKind::Io(e));
from!(<AuthError>e => ErrorKind::Auth(e));
from!(<DatabaseError>e => match e.is_query_canceled() {
    true => ErrorKind::Cancelled(Some(e)),
    false => ErrorKind::Database(e),
});
from!(<DecodeError>e => ErrorKind::Decode(e));
from!(<RowNotFound>e => ErrorKind::RowNotFound(e));

impl std::error::Error for Error { }

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if !self.context.is_empty() {
            write!(f, "{}: ", self.context)?;
        }

        fmt::Display::fmt(&self.kind, f)?;

        if let std::backtrace::BacktraceStatus::Captured = self.backtrace.status() {
            let mut backtrace = self.backtrace.to_string();
            write!(f, "\n\n")?;
            writeln!(f, "Stack backtrace:")?;
            backtrace.truncate(backtrace.trim_end().len());
            write!(f, "{}", backtrace)?;
        }

        Ok(())
    }
}

impl fmt::Debug for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "\"{self}\"")
    }
}

impl std::error::Error for ErrorKind { }

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Config(e) => e.fmt(f),
            Self::Protocol(e) => e.fmt(f),
            Self::Io(e) => e.fmt(f),
            Self::Auth(e) => e.fmt(f),
            Self::Database(e) => e.fmt(f),
            Self::Cancelled(Some(e)) => e.fmt(f),
            Self::Cancelled(None) => f.write_str("operation cancelled"),
            Self::PoolTimeout(d) => write!(f, "timed out after {d:?} waiting for a pooled connection"),
            Self::Closed(reason) => write!(f, "connection closed: {reason}"),
            Self::Decode(e) => e.fmt(f),
            Self::RowNotFound(e) => e.fmt(f),
        }
    }
}

impl fmt::Debug for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "\"{self}\"")
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn cancel_code_maps_to_cancelled() {
        let err = Error::from(DatabaseError::new("57014", "canceling statement due to user request"));
        assert!(err.is_cancelled());
        assert_eq!(err.code(), Some("57014"));
        assert!(!err.is_fatal());

        let err = Error::from(DatabaseError::new("22012", "division by zero"));
        assert!(matches!(err.kind(), ErrorKind::Database(_)));
    }

    #[test]
    fn context_prefix() {
        let err = Error::closed("eof").context("fetch");
        assert!(err.to_string().starts_with("fetch: connection closed: eof"));
        assert!(err.is_fatal());
    }
}
