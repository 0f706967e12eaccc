//! The [`Portal`] type, one executing command.
//!
//! A portal sends its whole message group eagerly and then reads the responses lazily, one
//! message per [`Portal::fetch_next`] step. Several portals may be open on the same connection,
//! each reads only its own messages.
//!
//! Outside a transaction block the unnamed portal is executed to completion in one go, `Sync`
//! would destroy anything else. Inside a transaction block a named portal is executed
//! `fetch_size` rows at a time and resumed when the caller asks for more.
use bytes::Bytes;
use futures_core::Stream;
use std::{
    collections::VecDeque,
    marker::PhantomData,
    pin::Pin,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    task::{Context, Poll, ready},
};

use crate::{
    Connection, Error, Result,
    common::verbose,
    connection::CancelToken,
    encode::Encoded,
    error::ErrorKind,
    executor::Acquired,
    mars::{GroupReceiver, Mux},
    postgres::{
        BackendMessage, FieldDescription, Oid, PgFormat,
        frontend::{self, Bind, Describe, Execute, Parse, Query, Sync},
    },
    row::{FromRow, Row},
    sql,
    statement::{PortalName, Prepared, Statement, StatementName, statement_key},
    types::TypeRegistry,
};

/// Unique label identifying the message groups of one portal.
pub(crate) fn next_label() -> Arc<str> {
    static LABEL: AtomicU64 = AtomicU64::new(0);
    let n = LABEL.fetch_add(1, Ordering::Relaxed);
    format!("p{n}").into()
}

/// Reject a statement that cannot be framed, before any of it is written to the socket.
pub(crate) fn check_message_limits(sql: &str, values: &[Option<Bytes>]) -> Result<()> {
    use frontend::{MAX_MESSAGE_LEN, MAX_PARAMS};

    if values.len() > MAX_PARAMS {
        return Err(Error::config(format!(
            "{} parameters bound, a statement takes at most {MAX_PARAMS}",
            values.len()
        )));
    }

    // names, format codes and counts of parse and bind stay well within the slack
    const SLACK: usize = 1024;
    let parse = sql.len() + values.len() * 4;
    let bind = values.iter().map(|e| 4 + e.as_ref().map_or(0, Bytes::len)).sum::<usize>() + values.len() * 2;
    if parse.max(bind) > MAX_MESSAGE_LEN - SLACK {
        return Err(Error::config("statement or parameters exceed the protocol message size"));
    }
    Ok(())
}

/// Bound parameter values.
#[derive(Debug, Clone)]
pub(crate) enum Params {
    Positional(Vec<Encoded>),
    Named(Vec<(String, Encoded)>),
}

impl Params {
    fn is_empty(&self) -> bool {
        match self {
            Params::Positional(p) => p.is_empty(),
            Params::Named(p) => p.is_empty(),
        }
    }

    /// Every named value must be used by at least one statement.
    fn check_used<'a>(&self, names: impl Iterator<Item = &'a String> + Clone) -> Result<()> {
        let Params::Named(p) = self else {
            return Ok(());
        };
        match p.iter().find(|(bound, _)| !names.clone().any(|e| e == bound)) {
            Some((unused, _)) => Err(Error::config(format!("parameter `{unused}` is not used by the sql"))),
            None => Ok(()),
        }
    }

    /// Values in `$n` order for sql with the given parameter names.
    fn resolve(&self, names: &[String]) -> Result<Vec<Encoded>> {
        match (self, names.is_empty()) {
            (Params::Positional(p), true) => Ok(p.clone()),
            (Params::Positional(p), false) if p.is_empty() => {
                Err(Error::config(format!("missing parameter `{}`", names[0])))
            }
            (Params::Positional(_), false) => Err(Error::config("sql with named parameters requires named binding")),
            (Params::Named(_), true) => Ok(vec![]),
            (Params::Named(p), false) => names
                .iter()
                .map(|name| match p.iter().find(|(e, _)| e == name) {
                    Some((_, value)) => Ok(value.clone()),
                    None => Err(Error::config(format!("missing parameter `{name}`"))),
                })
                .collect(),
        }
    }
}

/// One statement of a command.
#[derive(Debug)]
enum Unit {
    Extended {
        sql: Arc<str>,
        names: Vec<String>,
        /// Parameter types come from a prepared [`Statement`].
        declared: bool,
    },
    Simple(String),
}

/// Progress of the current statement.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Unprepared,
    Parsed,
    Bound,
    Described,
    Executing,
    Complete,
    Failed,
}

/// The statement currently in flight.
struct Current {
    rx: GroupReceiver,
    stmt: StatementName,
    /// Cache key of a persistent statement.
    key: Option<u64>,
    /// `Parse` sent and `ParseComplete` not yet seen.
    parse_pending: bool,
    portal: PortalName,
    max_row: u32,
    columns: Option<Arc<[FieldDescription]>>,
    types: Arc<TypeRegistry>,
    error: Option<Error>,
    tag: Option<String>,
    rows_affected: Option<u64>,
    suspended: bool,
    ready: bool,
}

/// An executing command.
///
/// Dropping a portal before it is exhausted discards the rest of its rows, the connection stays
/// usable.
pub struct Portal {
    conn: Acquired,
    label: Arc<str>,
    units: VecDeque<Unit>,
    params: Params,
    persistent: bool,
    phase: Phase,
    current: Option<Current>,
}

impl Portal {
    /// Parse sql into statements and send the first one.
    pub(crate) async fn start(conn: Acquired, sql: &str, params: Params, persistent: bool) -> Result<Portal> {
        let pieces = sql::split_statements(sql);

        let units = if pieces.len() <= 1 {
            let (sql, names) = sql::rewrite_named_parameters(pieces.first().copied().unwrap_or(""))?;
            params.check_used(names.iter())?;
            params.resolve(&names)?;
            vec![Unit::Extended { sql: sql.into(), names, declared: false }]
        } else {
            if matches!(&params, Params::Positional(p) if !p.is_empty())
                || pieces.iter().any(|e| sql::positional_count(e) > 0)
            {
                return Err(Error::config("multiple statements cannot take positional parameters"));
            }

            match params.is_empty() {
                // extended protocol is needed to bind values
                false => {
                    let units = pieces
                        .iter()
                        .map(|piece| {
                            let (sql, names) = sql::rewrite_named_parameters(piece)?;
                            params.resolve(&names)?;
                            Ok(Unit::Extended { sql: sql.into(), names, declared: false })
                        })
                        .collect::<Result<Vec<_>>>()?;
                    let used = units.iter().flat_map(|e| match e {
                        Unit::Extended { names, .. } => names.as_slice(),
                        Unit::Simple(_) => &[],
                    });
                    params.check_used(used)?;
                    units
                }
                true => pieces.iter().map(|e| Unit::Simple((*e).to_owned())).collect(),
            }
        };

        Self::open(conn, units, params, persistent).await
    }

    /// Run every statement of a script with the simple query protocol.
    pub(crate) async fn script(conn: Acquired, sql: &str) -> Result<Portal> {
        let units = sql::split_statements(sql)
            .into_iter()
            .map(|e| Unit::Simple(e.to_owned()))
            .collect();
        Self::open(conn, units, Params::Positional(vec![]), false).await
    }

    /// Execute a prepared statement with already coerced parameters.
    pub(crate) async fn prepared(conn: Acquired, stmt: &Statement, params: Vec<Encoded>) -> Result<Portal> {
        let unit = Unit::Extended { sql: stmt.sql.clone(), names: vec![], declared: true };
        Self::open(conn, vec![unit], Params::Positional(params), true).await
    }

    async fn open(conn: Acquired, units: Vec<Unit>, params: Params, persistent: bool) -> Result<Portal> {
        conn.mux().portal_opened();
        let mut me = Portal {
            conn,
            label: next_label(),
            units: units.into(),
            params,
            persistent,
            phase: Phase::Unprepared,
            current: None,
        };
        me.advance().await?;
        Ok(me)
    }

    // ===== Accessors =====

    /// Progress of the current statement.
    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn connection(&self) -> &Connection {
        &self.conn
    }

    /// Columns of the current result, `None` when unknown yet or the statement returns no rows.
    pub fn columns(&self) -> Option<&[FieldDescription]> {
        self.current.as_ref()?.columns.as_deref()
    }

    /// Command tag of the current result, available once its rows are exhausted.
    pub fn tag(&self) -> Option<&str> {
        self.current.as_ref()?.tag.as_deref()
    }

    /// Rows affected by the current result, available once its rows are exhausted.
    pub fn rows_affected(&self) -> Option<u64> {
        self.current.as_ref()?.rows_affected
    }

    /// Handle to cancel reads of this portal from another task.
    pub fn cancel_handle(&self) -> PortalCancel {
        PortalCancel {
            mux: self.conn.mux().clone(),
            label: self.label.clone(),
            token: self.conn.cancel_token(),
        }
    }

    // ===== Write side =====

    /// Retire the current statement and send the next one, `false` when there is none.
    async fn advance(&mut self) -> Result<bool> {
        self.retire();
        let Some(unit) = self.units.pop_front() else {
            return Ok(false);
        };

        self.phase = Phase::Unprepared;
        let sent = match unit {
            Unit::Extended { sql, names, declared } => self.send_extended(sql, &names, declared).await,
            Unit::Simple(sql) => self.send_simple(&sql).await,
        };

        match sent {
            Ok(current) => {
                self.current = Some(current);
                Ok(true)
            }
            Err(err) => {
                self.abandon();
                Err(err)
            }
        }
    }

    async fn send_extended(&self, sql: Arc<str>, names: &[String], declared: bool) -> Result<Current> {
        let params = self.params.resolve(names)?;
        let oids: Vec<Oid> = match declared {
            true => vec![],
            false => params.iter().map(Encoded::oid).collect(),
        };
        let formats: Vec<PgFormat> = params.iter().map(Encoded::format).collect();
        let values: Vec<Option<Bytes>> = params.iter().map(|e| e.value().cloned()).collect();
        check_message_limits(&sql, &values)?;

        let key = statement_key(&sql, &oids);
        let conn: &Connection = &self.conn;
        let persistent = self.persistent;
        let fetch_size = conn.config().fetch_size;

        let (rx, (stmt, parse, portal, max_row, columns)) = conn
            .mux()
            .send_group(Some(self.label.clone()), |buf, tx_status| {
                let cached = if persistent { conn.cached(key) } else { None };
                let (stmt, parse, columns) = match cached {
                    Some(Prepared { name, columns }) => (name, false, columns),
                    None if persistent => (StatementName::next(), true, None),
                    None => (StatementName::unnamed(), true, None),
                };

                if parse {
                    frontend::write(Parse { prepare_name: stmt.as_str(), sql: &sql, oids: &oids }, buf);
                }

                let (portal, max_row) = match tx_status == b'T' && fetch_size > 0 {
                    true => (PortalName::next(), fetch_size),
                    false => (PortalName::unnamed(), 0),
                };

                frontend::write(
                    Bind {
                        portal_name: portal.as_str(),
                        stmt_name: stmt.as_str(),
                        param_formats: &formats,
                        params: &values,
                        result_formats: &[PgFormat::Binary],
                    },
                    buf,
                );
                if columns.is_none() {
                    frontend::write(Describe { kind: b'P', name: portal.as_str() }, buf);
                }
                frontend::write(Execute { portal_name: portal.as_str(), max_row }, buf);
                frontend::write(Sync, buf);

                (stmt, parse, portal, max_row, columns)
            })
            .await?;

        verbose!(label = %self.label, stmt = %stmt, portal = %portal, parse, max_row, "extended query sent");

        Ok(Current {
            rx,
            key: persistent.then_some(key),
            parse_pending: parse,
            stmt,
            portal,
            max_row,
            columns,
            types: conn.types(),
            error: None,
            tag: None,
            rows_affected: None,
            suspended: false,
            ready: false,
        })
    }

    async fn send_simple(&self, sql: &str) -> Result<Current> {
        check_message_limits(sql, &[])?;
        let (rx, ()) = self
            .conn
            .mux()
            .send_group(Some(self.label.clone()), |buf, _| frontend::write(Query { sql }, buf))
            .await?;

        verbose!(label = %self.label, "simple query sent");

        Ok(Current {
            rx,
            key: None,
            parse_pending: false,
            stmt: StatementName::unnamed(),
            portal: PortalName::unnamed(),
            max_row: 0,
            columns: None,
            types: self.conn.types(),
            error: None,
            tag: None,
            rows_affected: None,
            suspended: false,
            ready: false,
        })
    }

    /// Continue a suspended named portal.
    async fn resume(&mut self) -> Result<()> {
        let mux = self.conn.mux().clone();
        let Some(cur) = self.current.as_mut() else {
            return Ok(());
        };
        let (portal, max_row) = (cur.portal.clone(), cur.max_row);

        let (rx, ()) = mux
            .send_group(Some(self.label.clone()), |buf, _| {
                frontend::write(Execute { portal_name: portal.as_str(), max_row }, buf);
                frontend::write(Sync, buf);
            })
            .await?;

        cur.rx = rx;
        cur.suspended = false;
        cur.ready = false;
        Ok(())
    }

    /// Drop the current statement, scheduling cleanup of server side objects left behind.
    fn retire(&mut self) {
        let Some(cur) = self.current.take() else {
            return;
        };
        let mux = self.conn.mux();
        if !cur.portal.is_unnamed() && cur.tag.is_none() {
            mux.schedule_close(b'P', cur.portal.to_string());
        }
        // parsed into a name the cache never learned about
        if cur.parse_pending && cur.key.is_some() {
            mux.schedule_close(b'S', cur.stmt.to_string());
        }
    }

    fn abandon(&mut self) {
        self.units.clear();
        self.phase = Phase::Failed;
        self.retire();
    }

    // ===== Read side =====

    /// Fetch the next row of the current result.
    ///
    /// Returns `None` when the current result is exhausted, use [`next_result`][Self::next_result]
    /// to move to the next statement. A server error fails the portal, the statements after it
    /// are not executed.
    pub async fn fetch_next(&mut self) -> Result<Option<Row>> {
        loop {
            let Some(cur) = self.current.as_mut() else {
                return Ok(None);
            };

            if cur.ready {
                if let Some(err) = cur.error.take() {
                    self.abandon();
                    return Err(err);
                }
                if cur.suspended {
                    self.resume().await?;
                    continue;
                }
                return Ok(None);
            }

            let message = match self.conn.mux().recv(&self.label, &mut cur.rx).await {
                Ok(message) => message,
                // the group is still in flight, reading can continue later
                Err(err) if matches!(err.kind(), ErrorKind::Cancelled(None)) => return Err(err),
                Err(err) => {
                    self.abandon();
                    return Err(err);
                }
            };

            match message {
                BackendMessage::ParseComplete(_) => {
                    self.phase = Phase::Parsed;
                    cur.parse_pending = false;
                    if let Some(key) = cur.key {
                        self.conn.cache_insert(key, Prepared { name: cur.stmt.clone(), columns: None });
                    }
                }
                BackendMessage::BindComplete(_) => self.phase = Phase::Bound,
                BackendMessage::ParameterDescription(_) | BackendMessage::CloseComplete(_) => {}
                BackendMessage::RowDescription(rd) => {
                    let columns: Arc<[FieldDescription]> = rd.fields.into();
                    self.conn.ensure_types(columns.iter().map(|e| e.type_oid)).await;
                    cur.types = self.conn.types();
                    if let Some(key) = cur.key {
                        self.conn.cache_columns(key, &columns);
                    }
                    cur.columns = Some(columns);
                    self.phase = Phase::Described;
                }
                BackendMessage::NoData(_) => {
                    cur.columns = None;
                    self.phase = Phase::Described;
                }
                BackendMessage::DataRow(dr) => {
                    self.phase = Phase::Executing;
                    let columns = cur.columns.clone().unwrap_or_else(|| Arc::new([]));
                    let row = Row::new(columns, dr.values, cur.types.clone())
                        .map_err(|e| self.conn.protocol_violation(e))?;
                    return Ok(Some(row));
                }
                BackendMessage::CommandComplete(cmd) => {
                    self.phase = Phase::Complete;
                    cur.rows_affected = cmd.rows_affected();
                    cur.tag = Some(cmd.tag);
                    if !cur.portal.is_unnamed() {
                        self.conn.mux().schedule_close(b'P', cur.portal.to_string());
                    }
                }
                BackendMessage::EmptyQueryResponse(_) => {
                    self.phase = Phase::Complete;
                    cur.tag = Some(String::new());
                }
                BackendMessage::PortalSuspended(_) => cur.suspended = true,
                BackendMessage::ErrorResponse(e) => {
                    self.phase = Phase::Failed;
                    cur.error = Some(e.error.into());
                }
                BackendMessage::ReadyForQuery(_) => cur.ready = true,
                other => return Err(self.conn.protocol_violation(other.unexpected("extended query"))),
            }
        }
    }

    /// Move to the result of the next statement, discarding unread rows of the current one.
    ///
    /// Returns `false` when there are no more statements.
    pub async fn next_result(&mut self) -> Result<bool> {
        while self.fetch_next().await?.is_some() { }
        self.advance().await
    }

    /// Next row across all results.
    pub(crate) async fn next_row(&mut self) -> Result<Option<Row>> {
        loop {
            if let Some(row) = self.fetch_next().await? {
                return Ok(Some(row));
            }
            if !self.advance().await? {
                return Ok(None);
            }
        }
    }

    /// Run every remaining statement to completion, returns the total rows affected.
    pub async fn finish(&mut self) -> Result<u64> {
        let mut total = 0;
        loop {
            while self.fetch_next().await?.is_some() { }
            total += self.rows_affected().unwrap_or(0);
            if !self.advance().await? {
                return Ok(total);
            }
        }
    }

    /// Convert into a [`Stream`] of rows across all results.
    pub fn into_stream<R: FromRow>(self) -> RowStream<R> {
        RowStream { portal: Some(self), fut: None, _p: PhantomData }
    }
}

impl Drop for Portal {
    fn drop(&mut self) {
        self.retire();
        self.conn.mux().portal_closed(&self.label);
    }
}

impl std::fmt::Debug for Portal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Portal")
            .field("label", &self.label)
            .field("phase", &self.phase)
            .field("remaining", &self.units.len())
            .finish()
    }
}

/// Cancel handle of a [`Portal`].
#[derive(Clone)]
pub struct PortalCancel {
    mux: Arc<Mux>,
    label: Arc<str>,
    token: Option<CancelToken>,
}

impl PortalCancel {
    /// Give up the read the portal is waiting on, the waiting call fails with a cancelled error.
    ///
    /// The statement keeps running, returns `false` if nothing was waiting.
    pub fn cancel_pending(&self) -> bool {
        self.mux.cancel_pending(&self.label)
    }

    /// Ask the server to cancel the running statement, see [`CancelToken`].
    pub async fn cancel_statement(&self) -> Result<()> {
        match &self.token {
            Some(token) => token.cancel().await,
            None => Err(Error::config("server did not provide a cancellation key")),
        }
    }

    /// Hold the next read of the portal until [`complete`][Self::complete] is called.
    #[cfg(test)]
    pub(crate) fn force_wait(&self) {
        self.mux.force_wait(&self.label);
    }

    /// Resolve a forced read, `code` fails it with that SQLSTATE.
    #[cfg(test)]
    pub(crate) fn complete(&self, code: Option<&str>) -> bool {
        self.mux.complete(&self.label, code)
    }
}

impl std::fmt::Debug for PortalCancel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("PortalCancel").field(&self.label).finish()
    }
}

type NextRow = Pin<Box<dyn Future<Output = (Portal, Result<Option<Row>>)> + Send>>;

/// [`Stream`] of rows decoded with [`FromRow`].
#[must_use = "streams do nothing unless polled"]
pub struct RowStream<R> {
    portal: Option<Portal>,
    fut: Option<NextRow>,
    _p: PhantomData<fn() -> R>,
}

impl<R: FromRow> Stream for RowStream<R> {
    type Item = Result<R>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let me = self.get_mut();
        loop {
            if let Some(fut) = me.fut.as_mut() {
                let (portal, result) = ready!(fut.as_mut().poll(cx));
                me.fut = None;
                return Poll::Ready(match result {
                    Ok(Some(row)) => {
                        me.portal = Some(portal);
                        Some(R::from_row(row).map_err(Into::into))
                    }
                    Ok(None) => None,
                    Err(err) => Some(Err(err)),
                });
            }

            let Some(mut portal) = me.portal.take() else {
                return Poll::Ready(None);
            };
            me.fut = Some(Box::pin(async move {
                let result = portal.next_row().await;
                (portal, result)
            }));
        }
    }
}

impl<R> std::fmt::Debug for RowStream<R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RowStream").field("portal", &self.portal).finish_non_exhaustive()
    }
}
