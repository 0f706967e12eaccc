use bytes::BytesMut;
use std::{
    io,
    pin::Pin,
    task::{Context, Poll, ready},
};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

use super::{ConnectionState, NoticeHandler};
use crate::{
    Result,
    common::verbose,
    net::Socket,
    postgres::{
        BackendProtocol, DatabaseError, FrontendProtocol,
        backend::{ErrorResponse, NoticeResponse},
        codec, frontend,
    },
    transport::PgTransport,
};

const DEFAULT_BUF_CAPACITY: usize = 1024;

/// Buffered connection to postgres, owning the whole socket.
///
/// Used until startup completes, then split into the multiplexer halves.
#[derive(Debug)]
pub struct PgStream {
    socket: Socket,
    read_buf: BytesMut,
    write_buf: BytesMut,
    max_message_len: usize,
    state: ConnectionState,
    notices: Notices,
}

struct Notices(Option<NoticeHandler>);

impl std::fmt::Debug for Notices {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(if self.0.is_some() { "Some(..)" } else { "None" })
    }
}

impl PgStream {
    pub fn new(socket: Socket, max_message_len: usize, notices: Option<NoticeHandler>) -> Self {
        Self {
            socket,
            read_buf: BytesMut::with_capacity(DEFAULT_BUF_CAPACITY),
            write_buf: BytesMut::with_capacity(DEFAULT_BUF_CAPACITY),
            max_message_len,
            state: ConnectionState::Connecting,
            notices: Notices(notices),
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub(crate) fn set_state(&mut self, state: ConnectionState) {
        verbose!(?state, "startup state");
        self.state = state;
    }

    /// Returns the socket and any bytes already read past the last message.
    pub fn into_parts(self) -> (Socket, BytesMut) {
        (self.socket, self.read_buf)
    }

    fn poll_read_socket(&mut self, cx: &mut Context) -> Poll<io::Result<()>> {
        let mut chunk = [0u8; DEFAULT_BUF_CAPACITY * 4];
        let mut buf = ReadBuf::new(&mut chunk);
        ready!(Pin::new(&mut self.socket).poll_read(cx, &mut buf))?;

        if buf.filled().is_empty() {
            return Poll::Ready(Err(io::ErrorKind::UnexpectedEof.into()));
        }

        self.read_buf.extend_from_slice(buf.filled());
        Poll::Ready(Ok(()))
    }
}

impl PgTransport for PgStream {
    fn poll_flush(&mut self, cx: &mut Context) -> Poll<io::Result<()>> {
        while !self.write_buf.is_empty() {
            let n = ready!(Pin::new(&mut self.socket).poll_write(cx, &self.write_buf))?;
            if n == 0 {
                return Poll::Ready(Err(io::ErrorKind::WriteZero.into()));
            }
            let _ = self.write_buf.split_to(n);
        }
        Pin::new(&mut self.socket).poll_flush(cx)
    }

    fn poll_recv<B: BackendProtocol>(&mut self, cx: &mut Context) -> Poll<Result<B>> {
        loop {
            let Some((msgtype, body)) = codec::decode_frame(&mut self.read_buf, self.max_message_len)? else {
                ready!(self.poll_read_socket(cx))?;
                continue;
            };

            match msgtype {
                NoticeResponse::MSGTYPE => {
                    let notice = DatabaseError::parse(body)?;
                    match &self.notices.0 {
                        Some(handler) => handler(&notice),
                        None => {
                            #[cfg(feature = "log")]
                            log::info!("{notice}");
                        }
                    }
                }
                ErrorResponse::MSGTYPE => {
                    let err = DatabaseError::parse(body)?;
                    return Poll::Ready(Err(err.into()));
                }
                _ => {
                    verbose!(msgtype = %(msgtype as char), "startup recv");
                    return Poll::Ready(Ok(B::decode(msgtype, body)?));
                }
            }
        }
    }

    fn send<F: FrontendProtocol>(&mut self, message: F) {
        frontend::write(message, &mut self.write_buf);
    }

    fn send_startup(&mut self, startup: frontend::Startup) {
        startup.write(&mut self.write_buf);
    }
}
