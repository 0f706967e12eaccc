//! Protocol error
use std::{borrow::Cow, fmt};

use super::BackendMessage;

/// An error when translating buffer from postgres.
///
/// Any protocol error leaves the byte stream in an unknown position, the connection that produced
/// it cannot be used anymore.
pub enum ProtocolError {
    Unexpected {
        expect: Option<u8>,
        found: u8,
        phase: Option<&'static str>,
    },
    UnknownAuth {
        auth: u32,
    },
    InvalidLength {
        msgtype: u8,
        len: i64,
        max: usize,
    },
    Malformed {
        reason: Cow<'static, str>,
    },
}

impl std::error::Error for ProtocolError { }

impl fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProtocolError::Unexpected { expect, found, phase } => {
                let found = BackendMessage::message_name(*found);
                match expect {
                    Some(m) => {
                        write!(
                            f,
                            "Expected message `{}` found `{found}`",
                            BackendMessage::message_name(*m),
                        )?
                    },
                    None => write!(f, "Unexpected message `{found}`")?,
                }
                if let Some(phase) = phase {
                    write!(f, " in `{phase}`")?
                }
                Ok(())
            },
            ProtocolError::UnknownAuth { auth } => write!(f, "Unknown authentication request code {auth}"),
            ProtocolError::InvalidLength { msgtype, len, max } => write!(
                f,
                "Invalid length {len} for message `{}`, allowed range is 4..={max}",
                BackendMessage::message_name(*msgtype),
            ),
            ProtocolError::Malformed { reason } => write!(f, "Malformed message: {reason}"),
        }
    }
}

impl fmt::Debug for ProtocolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

impl From<bytes::TryGetError> for ProtocolError {
    fn from(_: bytes::TryGetError) -> Self {
        Self::malformed("message body truncated")
    }
}

impl ProtocolError {
    pub(crate) fn unknown(found: u8) -> ProtocolError {
        Self::Unexpected {
            expect: None,
            found,
            phase: None,
        }
    }

    pub(crate) fn unexpected(expect: u8, found: u8) -> ProtocolError {
        Self::Unexpected {
            expect: Some(expect),
            found,
            phase: None,
        }
    }

    pub(crate) fn unexpected_phase(found: u8, phase: &'static str) -> ProtocolError {
        Self::Unexpected {
            expect: None,
            found,
            phase: Some(phase),
        }
    }

    pub(crate) fn unknown_auth(auth: u32) -> ProtocolError {
        Self::UnknownAuth { auth }
    }

    pub(crate) fn malformed(reason: impl Into<Cow<'static, str>>) -> ProtocolError {
        Self::Malformed { reason: reason.into() }
    }
}
