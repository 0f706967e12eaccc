//! Multiple active result sets over one socket.
//!
//! Writes are serialized: a caller composes one message group (for example
//! `Parse`/`Bind`/`Execute`/`Sync`) and flushes it while holding the writer lock, and registers
//! the group in the in-flight queue under that same lock. The lock is released before waiting
//! for any response.
//!
//! One reader task owns the read half. The server answers message groups in the order they were
//! written, so every message belongs to the oldest in-flight group, until its `ReadyForQuery`.
//! The reader forwards each message to the channel of that group and wakes the
//! [`PendingRead`] of the portal owning it, if any.
//!
//! ```text
//! caller A ──┐                ┌── group A ◄── reader task ◄── socket
//! caller B ──┼─► writer lock ─┤
//! caller C ──┘                └── group B
//! ```
use bytes::{Bytes, BytesMut};
use std::{
    collections::{HashMap, HashSet, VecDeque},
    sync::{
        Arc, Mutex, MutexGuard,
        atomic::{AtomicBool, Ordering},
    },
};
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt, ReadHalf, WriteHalf},
    sync::mpsc::{self, UnboundedReceiver, UnboundedSender},
};

use crate::{
    Error, Result,
    common::verbose,
    connection::{ConnectionState, NoticeHandler, NotificationHandler},
    net::Socket,
    postgres::{
        BackendMessage, BackendProtocol, DatabaseError,
        backend::{NoticeResponse, NotificationResponse, ParameterStatus},
        codec,
        frontend::{self, Close, Query, Sync},
    },
};

mod pending;

pub use pending::{Outcome, PendingRead};

/// Messages of one message group, ending with `ReadyForQuery`.
pub type GroupReceiver = UnboundedReceiver<Result<BackendMessage>>;

type GroupSender = UnboundedSender<Result<BackendMessage>>;

/// Shared state of one physical connection.
pub struct Mux {
    state: Mutex<MuxState>,
    writer: tokio::sync::Mutex<Writer>,
    max_message_len: usize,
    notice: Option<NoticeHandler>,
    notification: Option<NotificationHandler>,
    rollback_pending: AtomicBool,
    pending_close: Mutex<Vec<(u8, String)>>,
}

struct MuxState {
    inflight: VecDeque<Inflight>,
    tx_status: u8,
    failed: Option<String>,
    closed: bool,
    open_portals: usize,
    pending: HashMap<Arc<str>, Arc<PendingRead>>,
    forced: HashSet<Arc<str>>,
    params: HashMap<String, String>,
}

struct Inflight {
    label: Option<Arc<str>>,
    /// `None` for groups whose responses are discarded.
    tx: Option<GroupSender>,
}

struct Writer {
    io: WriteHalf<Socket>,
    buf: BytesMut,
    /// Set while a write is in progress, a write abandoned halfway leaves the stream corrupted.
    dirty: bool,
}

impl Mux {
    pub fn new(
        io: WriteHalf<Socket>,
        max_message_len: usize,
        params: HashMap<String, String>,
        notice: Option<NoticeHandler>,
        notification: Option<NotificationHandler>,
    ) -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(MuxState {
                inflight: VecDeque::new(),
                tx_status: b'I',
                failed: None,
                closed: false,
                open_portals: 0,
                pending: HashMap::new(),
                forced: HashSet::new(),
                params,
            }),
            writer: tokio::sync::Mutex::new(Writer { io, buf: BytesMut::with_capacity(1024), dirty: false }),
            max_message_len,
            notice,
            notification,
            rollback_pending: AtomicBool::new(false),
            pending_close: Mutex::new(Vec::new()),
        })
    }

    fn lock(&self) -> MutexGuard<'_, MuxState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    // ===== State =====

    /// Current connection state, derived from the last transaction status and open portals.
    pub fn state(&self) -> ConnectionState {
        let st = self.lock();
        if st.closed {
            ConnectionState::Closed
        } else if st.failed.is_some() {
            ConnectionState::Failed
        } else if st.open_portals > 0 {
            ConnectionState::Executing
        } else if matches!(st.tx_status, b'T' | b'E') {
            ConnectionState::InTransaction
        } else {
            ConnectionState::Idle
        }
    }

    /// Transaction status of the last `ReadyForQuery`.
    pub fn tx_status(&self) -> u8 {
        self.lock().tx_status
    }

    pub fn is_broken(&self) -> bool {
        let st = self.lock();
        st.failed.is_some() || st.closed
    }

    /// Returns `true` when the connection must be reset before reuse.
    pub fn needs_reset(&self) -> bool {
        self.rollback_pending.load(Ordering::Acquire) || self.tx_status() != b'I'
    }

    pub fn parameter(&self, name: &str) -> Option<String> {
        self.lock().params.get(name).cloned()
    }

    pub fn portal_opened(&self) {
        self.lock().open_portals += 1;
    }

    pub fn portal_closed(&self, label: &str) {
        let mut st = self.lock();
        st.open_portals = st.open_portals.saturating_sub(1);
        st.pending.remove(label);
        st.forced.remove(label);
    }

    /// Roll back the current transaction before the next message group.
    pub fn schedule_rollback(&self) {
        self.rollback_pending.store(true, Ordering::Release);
    }

    /// Close a statement (`b'S'`) or portal (`b'P'`) before the next message group.
    pub fn schedule_close(&self, variant: u8, name: String) {
        self.pending_close.lock().unwrap_or_else(|e| e.into_inner()).push((variant, name));
    }

    fn check(&self) -> Result<()> {
        let st = self.lock();
        if let Some(reason) = &st.failed {
            return Err(Error::closed(reason.clone()));
        }
        if st.closed {
            return Err(Error::closed("connection closed"));
        }
        Ok(())
    }

    // ===== Write side =====

    /// Compose and flush one message group.
    ///
    /// `compose` receives the buffer and the transaction status the group will run in. The group
    /// must end with `Sync` or a simple `Query`, its responses arrive in the returned channel.
    pub async fn send_group<R>(
        &self,
        label: Option<Arc<str>>,
        compose: impl FnOnce(&mut BytesMut, u8) -> R,
    ) -> Result<(GroupReceiver, R)> {
        let mut writer = self.writer.lock().await;
        if writer.dirty {
            self.fail(Error::closed("write interrupted"));
        }
        self.check()?;

        // composed before anything is registered, a panicking compose leaves the connection intact
        let rollback = self.rollback_pending.load(Ordering::Acquire);
        let tx_status = if rollback { b'I' } else { self.tx_status() };
        let mut group = BytesMut::new();
        let out = compose(&mut group, tx_status);

        let Writer { io, buf, dirty } = &mut *writer;

        // a rollback scheduled while composing is left for the next group
        if rollback {
            self.rollback_pending.store(false, Ordering::Release);
            verbose!("rollback before next group");
            self.register(None, None);
            frontend::write(Query { sql: "ROLLBACK" }, buf);
        }

        let closes = std::mem::take(&mut *self.pending_close.lock().unwrap_or_else(|e| e.into_inner()));
        if !closes.is_empty() {
            self.register(None, None);
            for (variant, name) in &closes {
                frontend::write(Close { variant: *variant, name }, buf);
            }
            frontend::write(Sync, buf);
        }

        let (tx, rx) = mpsc::unbounded_channel();
        self.register(label, Some(tx));
        buf.extend_from_slice(&group);

        *dirty = true;
        let result = async {
            io.write_all(&buf[..]).await?;
            io.flush().await
        }
        .await;
        buf.clear();
        *dirty = false;

        if let Err(err) = result {
            self.fail(Error::closed(format!("write failed: {err}")));
            return Err(err.into());
        }

        Ok((rx, out))
    }

    fn register(&self, label: Option<Arc<str>>, tx: Option<GroupSender>) {
        self.lock().inflight.push_back(Inflight { label, tx });
    }

    /// Send `Terminate` and shut the socket down.
    pub async fn terminate(&self) -> Result<()> {
        let mut writer = self.writer.lock().await;
        {
            let mut st = self.lock();
            if st.closed || st.failed.is_some() {
                return Ok(());
            }
            st.closed = true;
        }
        let Writer { io, buf, .. } = &mut *writer;
        frontend::write(frontend::Terminate, buf);
        let result = async {
            io.write_all(&buf[..]).await?;
            io.shutdown().await
        }
        .await;
        buf.clear();
        self.fail(Error::closed("connection closed"));
        Ok(result?)
    }

    // ===== Read side =====

    /// Receive the next message of a portal group.
    ///
    /// Returns a buffered message when there is one, otherwise registers a [`PendingRead`] for
    /// `label` and waits until the reader delivers, the read is cancelled, or the connection fails.
    pub async fn recv(&self, label: &Arc<str>, rx: &mut GroupReceiver) -> Result<BackendMessage> {
        let forced = self.lock().forced.remove(label);

        if !forced {
            if let Ok(message) = rx.try_recv() {
                return message;
            }
        }

        let pending = PendingRead::new(forced);
        self.lock().pending.insert(label.clone(), pending.clone());

        // the reader may have delivered between the first check and the registration
        if !forced {
            if let Ok(message) = rx.try_recv() {
                self.clear_pending(label, &pending);
                return message;
            }
        }

        let outcome = pending.wait().await;
        self.clear_pending(label, &pending);

        match outcome {
            Outcome::Delivered | Outcome::Failed(None) => match rx.recv().await {
                Some(message) => message,
                None => Err(self.closed_error()),
            },
            Outcome::Failed(Some(code)) => {
                Err(DatabaseError::new(&code, "pending read completed with error").into())
            }
            Outcome::Cancelled => Err(Error::cancelled()),
        }
    }

    fn clear_pending(&self, label: &str, pending: &Arc<PendingRead>) {
        let mut st = self.lock();
        if st.pending.get(label).is_some_and(|e| Arc::ptr_eq(e, pending)) {
            st.pending.remove(label);
        }
    }

    fn closed_error(&self) -> Error {
        match &self.lock().failed {
            Some(reason) => Error::closed(reason.clone()),
            None => Error::closed("connection closed"),
        }
    }

    /// Cancel the pending read of a portal, returns `false` if nothing was waiting.
    pub fn cancel_pending(&self, label: &str) -> bool {
        let pending = self.lock().pending.remove(label);
        pending.is_some_and(|e| e.resolve(Outcome::Cancelled))
    }

    /// Make the next read of `label` wait until explicitly completed.
    #[cfg(test)]
    pub fn force_wait(&self, label: &str) {
        self.lock().forced.insert(label.into());
    }

    /// Complete the pending read of `label`, `code` fails it with that SQLSTATE.
    #[cfg(test)]
    pub fn complete(&self, label: &str, code: Option<&str>) -> bool {
        let pending = self.lock().pending.remove(label);
        let outcome = match code {
            Some(code) => Outcome::Failed(Some(code.into())),
            None => Outcome::Delivered,
        };
        pending.is_some_and(|e| e.resolve(outcome))
    }

    /// Route one backend frame.
    fn dispatch(&self, msgtype: u8, body: Bytes) -> Result<()> {
        match msgtype {
            NoticeResponse::MSGTYPE => {
                let notice = DatabaseError::parse(body)?;
                match &self.notice {
                    Some(handler) => handler(&notice),
                    None => {
                        #[cfg(feature = "log")]
                        log::info!("{notice}");
                    }
                }
                return Ok(());
            }
            NotificationResponse::MSGTYPE => {
                let message = NotificationResponse::decode(msgtype, body)?;
                if let Some(handler) = &self.notification {
                    handler(&message.notification);
                }
                return Ok(());
            }
            ParameterStatus::MSGTYPE => {
                let param = ParameterStatus::decode(msgtype, body)?;
                verbose!(name = %param.name, value = %param.value, "parameter status");
                self.lock().params.insert(param.name, param.value);
                return Ok(());
            }
            _ => {}
        }

        let message = BackendMessage::decode(msgtype, body)?;
        verbose!(msgtype = %(msgtype as char), "recv");

        let mut st = self.lock();
        let Some(front) = st.inflight.front() else {
            // the server terminating the session reports a FATAL error outside any group
            return Err(match message {
                BackendMessage::ErrorResponse(err) => err.error.into(),
                other => other.unexpected("idle connection").into(),
            });
        };

        let ready = match &message {
            BackendMessage::ReadyForQuery(r) => Some(r.tx_status),
            _ => None,
        };

        let label = front.label.clone();
        if let Some(tx) = &front.tx {
            // receiver dropped means the consumer is gone, the rest of the group is drained here
            let _ = tx.send(Ok(message));
        }

        if let Some(label) = label {
            if st.pending.get(&label).is_some_and(|e| e.deliver()) {
                st.pending.remove(&label);
            }
        }

        if let Some(tx_status) = ready {
            st.tx_status = tx_status;
            st.inflight.pop_front();
        }

        Ok(())
    }

    /// Mark the connection failed and wake every waiter.
    ///
    /// The first in-flight group receives `err` itself, the others a closed error.
    pub fn fail(&self, err: Error) {
        let mut st = self.lock();
        if st.failed.is_some() {
            return;
        }

        let reason = err.to_string();
        if !st.closed {
            #[cfg(feature = "log")]
            log::error!("connection failed: {reason}");
        }
        st.failed = Some(reason.clone());

        let mut inflight = std::mem::take(&mut st.inflight);
        if let Some(first) = inflight.pop_front().and_then(|e| e.tx) {
            let _ = first.send(Err(err));
        }
        for group in inflight {
            if let Some(tx) = group.tx {
                let _ = tx.send(Err(Error::closed(reason.clone())));
            }
        }

        for (_, pending) in st.pending.drain() {
            pending.resolve(Outcome::Failed(None));
        }
    }
}

/// The reader task of one physical connection.
///
/// `buf` holds bytes already read past the startup phase.
pub async fn read_loop(mux: Arc<Mux>, mut io: ReadHalf<Socket>, mut buf: BytesMut) {
    let err = loop {
        match codec::decode_frame(&mut buf, mux.max_message_len) {
            Ok(Some((msgtype, body))) => {
                if let Err(err) = mux.dispatch(msgtype, body) {
                    break err;
                }
            }
            Ok(None) => match io.read_buf(&mut buf).await {
                Ok(0) => break Error::closed("server closed the connection"),
                Ok(_) => {}
                Err(err) => break err.into(),
            },
            Err(err) => break err.into(),
        }
    };
    mux.fail(err);
}

impl std::fmt::Debug for Mux {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let st = self.lock();
        f.debug_struct("Mux")
            .field("inflight", &st.inflight.len())
            .field("tx_status", &(st.tx_status as char))
            .field("failed", &st.failed)
            .field("open_portals", &st.open_portals)
            .finish_non_exhaustive()
    }
}
