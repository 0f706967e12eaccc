//! Framing of backend messages from a byte buffer.
//!
//! Encoding is done by [`frontend::write`][super::frontend::write], this module only handles
//! splitting complete frames off the read buffer.
use bytes::{Buf, Bytes, BytesMut};

use super::{BackendMessage, BackendProtocol, ProtocolError};

/// Message type plus length.
pub const HEADER_LEN: usize = 1 + 4;

/// Default upper bound of a single backend message, 1 GiB, the largest value postgres can send.
pub const DEFAULT_MAX_MESSAGE_LEN: usize = 1 << 30;

/// Try to split one complete backend frame off the front of `buf`.
///
/// Returns `Ok(None)` when more bytes are required, in that case `buf` is left untouched
/// and has capacity reserved for the remaining frame.
///
/// The declared length includes the length field itself, a value below 4 or above `max_len`
/// is rejected.
pub fn decode_frame(buf: &mut BytesMut, max_len: usize) -> Result<Option<(u8, Bytes)>, ProtocolError> {
    let Some(header) = buf.get(..HEADER_LEN) else {
        return Ok(None);
    };

    let msgtype = header[0];
    let len = i32::from_be_bytes([header[1], header[2], header[3], header[4]]);

    if len < 4 || len as usize > max_len {
        return Err(ProtocolError::InvalidLength { msgtype, len: len.into(), max: max_len });
    }

    let len = len as usize;
    if buf.len() < 1 + len {
        buf.reserve(1 + len - buf.len());
        return Ok(None);
    }

    buf.advance(HEADER_LEN);
    let body = buf.split_to(len - 4).freeze();

    Ok(Some((msgtype, body)))
}

/// Split and decode one complete backend message.
pub fn decode<B: BackendProtocol>(buf: &mut BytesMut, max_len: usize) -> Result<Option<B>, ProtocolError> {
    match decode_frame(buf, max_len)? {
        Some((msgtype, body)) => B::decode(msgtype, body).map(Some),
        None => Ok(None),
    }
}

/// Decode a frame into [`BackendMessage`].
pub fn decode_message(msgtype: u8, body: Bytes) -> Result<BackendMessage, ProtocolError> {
    BackendMessage::decode(msgtype, body)
}
