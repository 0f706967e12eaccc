//! Postgres connection.
//!
//! A [`Connection`] is a cheap handle to one physical connection. Clones share the socket, the
//! statement cache and the type registry. Every clone can run statements concurrently, the
//! multiplexer serializes their writes and routes responses back.
use lru::LruCache;
use std::{
    num::NonZeroUsize,
    sync::{
        Arc, Mutex, MutexGuard, RwLock,
        atomic::{AtomicU64, Ordering},
    },
    time::Instant,
};
use tokio::task::JoinHandle;

use crate::{
    Error, Result,
    common::verbose,
    mars::{self, Mux},
    net::Socket,
    portal::{self, Portal},
    postgres::{
        BackendMessage, FieldDescription, Oid, ProtocolError,
        backend::BackendKeyData,
        frontend::{self, Close, Describe, Parse, Query, Sync},
    },
    row::Row,
    sql,
    statement::{Prepared, Statement, StatementName, statement_key},
    transaction::{Isolation, Transaction},
    types::{self, TypeRegistry},
};

mod cancel;
mod config;
mod startup;
mod state;
mod stream;

pub use cancel::CancelToken;
pub use config::{Config, ConfigError, NoticeHandler, NotificationHandler};
pub use startup::{StartupResponse, startup};
pub use state::ConnectionState;
pub use stream::PgStream;

pub(crate) use config::{parse_pairs, parse_secs};

static CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

/// Postgres connection.
#[derive(Clone)]
pub struct Connection {
    pub(crate) shared: Arc<Shared>,
}

pub(crate) struct Shared {
    id: u64,
    config: Config,
    key: Option<BackendKeyData>,
    mux: Arc<Mux>,
    stmts: Mutex<Option<LruCache<u64, Prepared>>>,
    types: RwLock<Arc<TypeRegistry>>,
    types_loaded: tokio::sync::Mutex<bool>,
    reader: JoinHandle<()>,
    created: Instant,
}

impl Drop for Shared {
    fn drop(&mut self) {
        self.reader.abort();
    }
}

/// Result of one statement of a simple query.
#[derive(Debug, Clone)]
pub struct ResultSet {
    /// `None` for statements returning no rows.
    pub columns: Option<Arc<[FieldDescription]>>,
    pub rows: Vec<Row>,
    /// Command tag, empty for an empty query.
    pub tag: String,
    pub rows_affected: Option<u64>,
}

impl Connection {
    /// Connect to the database using url or key/value connection string.
    pub async fn connect(url: &str) -> Result<Connection> {
        Self::connect_with(Config::parse(url)?).await
    }

    /// Connect to the database using environment variables.
    ///
    /// See [`Config::from_env`] for more details on env.
    pub async fn connect_env() -> Result<Connection> {
        Self::connect_with(Config::from_env()).await
    }

    /// Connect to the database with the given config.
    pub async fn connect_with(config: Config) -> Result<Connection> {
        config.validate()?;

        let timeout = config.connect_timeout;
        let handshake = async {
            let socket = match &config.socket {
                Some(dir) => Socket::connect_socket(dir, config.port).await?,
                None => Socket::connect_tcp(&config.host, config.port).await?,
            };

            let mut stream = PgStream::new(socket, config.max_message_len, config.notice_handler.clone());
            stream.set_state(ConnectionState::Authenticating);
            let response = startup(&config, &mut stream).await?;
            stream.set_state(ConnectionState::Idle);
            Ok::<_, Error>((stream, response))
        };

        let (stream, response) = match tokio::time::timeout(timeout, handshake).await {
            Ok(result) => result?,
            Err(_) => {
                let msg = format!("connect timed out after {timeout:?}");
                return Err(std::io::Error::new(std::io::ErrorKind::TimedOut, msg).into());
            }
        };

        let (socket, leftover) = stream.into_parts();
        let (rd, wr) = tokio::io::split(socket);
        let mux = Mux::new(
            wr,
            config.max_message_len,
            response.params,
            config.notice_handler.clone(),
            config.notification_handler.clone(),
        );
        let reader = tokio::spawn(mars::read_loop(mux.clone(), rd, leftover));

        let stmts = NonZeroUsize::new(config.statement_cache).map(LruCache::new);
        let id = CONNECTION_ID.fetch_add(1, Ordering::Relaxed);

        #[cfg(feature = "log")]
        log::debug!(
            "connection {id} established, backend {:?}",
            response.backend_key_data.map(|e| e.process_id)
        );

        Ok(Connection {
            shared: Arc::new(Shared {
                id,
                key: response.backend_key_data,
                config,
                mux,
                stmts: Mutex::new(stmts),
                types: RwLock::new(Arc::new(TypeRegistry::builtin())),
                types_loaded: tokio::sync::Mutex::new(false),
                reader,
                created: Instant::now(),
            }),
        })
    }

    // ===== Accessors =====

    /// Client side identifier, unique in this process.
    pub fn id(&self) -> u64 {
        self.shared.id
    }

    pub fn config(&self) -> &Config {
        &self.shared.config
    }

    /// Backend process id, `None` when the server did not send the cancellation key.
    pub fn process_id(&self) -> Option<u32> {
        self.shared.key.map(|e| e.process_id)
    }

    /// Current value of a server parameter, such as `server_version`.
    pub fn parameter(&self, name: &str) -> Option<String> {
        self.shared.mux.parameter(name)
    }

    pub fn state(&self) -> ConnectionState {
        self.shared.mux.state()
    }

    /// Returns `true` when the connection failed or was closed.
    pub fn is_broken(&self) -> bool {
        self.shared.mux.is_broken()
    }

    /// When the connection was established.
    pub fn created(&self) -> Instant {
        self.shared.created
    }

    pub(crate) fn mux(&self) -> &Arc<Mux> {
        &self.shared.mux
    }

    /// Number of live handles to the physical connection.
    pub(crate) fn handles(&self) -> usize {
        Arc::strong_count(&self.shared)
    }

    pub(crate) fn protocol_violation(&self, err: ProtocolError) -> Error {
        self.shared.mux.fail(Error::closed(err.to_string()));
        err.into()
    }

    // ===== Cancellation =====

    /// Token to cancel the running command from elsewhere.
    pub fn cancel_token(&self) -> Option<CancelToken> {
        self.shared.key.map(|key| CancelToken::new(&self.shared.config, key))
    }

    /// Ask the server to cancel the command currently running on this connection.
    pub async fn cancel(&self) -> Result<()> {
        match self.cancel_token() {
            Some(token) => token.cancel().await,
            None => Err(Error::config("server did not provide a cancellation key")),
        }
    }

    // ===== Types =====

    /// Snapshot of the type registry.
    pub fn types(&self) -> Arc<TypeRegistry> {
        self.shared.types.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Load the type registry from the catalog again, picking up types created since.
    pub async fn reload_types(&self) -> Result<()> {
        let mut loaded = self.shared.types_loaded.lock().await;
        let registry = self.load_types().await?;
        *self.shared.types.write().unwrap_or_else(|e| e.into_inner()) = Arc::new(registry);
        *loaded = true;
        Ok(())
    }

    /// Make sure the registry knows `oids`, loading the catalog once per connection.
    ///
    /// A failed load leaves the registry as is, unknown types then decode as opaque values.
    pub(crate) async fn ensure_types(&self, oids: impl IntoIterator<Item = Oid>) {
        let types = self.types();
        if oids.into_iter().all(|oid| types.contains(oid)) {
            return;
        }

        let mut loaded = self.shared.types_loaded.lock().await;
        if *loaded {
            return;
        }

        match self.load_types().await {
            Ok(registry) => {
                verbose!(types = registry.len(), "type catalog loaded");
                *self.shared.types.write().unwrap_or_else(|e| e.into_inner()) = Arc::new(registry);
                *loaded = true;
            }
            Err(_err) => {
                #[cfg(feature = "log")]
                log::warn!("failed to load type catalog: {_err}");
            }
        }
    }

    async fn load_types(&self) -> Result<TypeRegistry> {
        let rows = |mut sets: Vec<ResultSet>| sets.pop().map(|e| e.rows).unwrap_or_default();

        let catalog = rows(self.simple_query(types::CATALOG_TYPES).await?)
            .iter()
            .map(types::catalog_type)
            .collect::<Result<Vec<_>, _>>()?;
        let attributes = rows(self.simple_query(types::CATALOG_ATTRIBUTES).await?)
            .iter()
            .map(types::catalog_attribute)
            .collect::<Result<Vec<_>, _>>()?;
        let labels = rows(self.simple_query(types::CATALOG_ENUMS).await?)
            .iter()
            .map(types::catalog_label)
            .collect::<Result<Vec<_>, _>>()?;

        Ok(TypeRegistry::from_catalog(&catalog, &attributes, &labels))
    }

    // ===== Statement cache =====

    fn stmts(&self) -> MutexGuard<'_, Option<LruCache<u64, Prepared>>> {
        self.shared.stmts.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub(crate) fn cached(&self, key: u64) -> Option<Prepared> {
        self.stmts().as_mut()?.get(&key).cloned()
    }

    /// Insert into the statement cache, closing whatever it replaces or evicts.
    pub(crate) fn cache_insert(&self, key: u64, prepared: Prepared) {
        let name = prepared.name.clone();
        let evicted = match self.stmts().as_mut() {
            // `push` returns the replaced entry too, which may be the statement itself
            Some(cache) => cache.push(key, prepared).filter(|(_, old)| old.name != name),
            None => Some((key, prepared)),
        };
        if let Some((_, old)) = evicted {
            verbose!(name = %old.name, "statement evicted");
            self.shared.mux.schedule_close(b'S', old.name.to_string());
        }
    }

    pub(crate) fn cache_columns(&self, key: u64, columns: &Arc<[FieldDescription]>) {
        if let Some(entry) = self.stmts().as_mut().and_then(|e| e.peek_mut(&key)) {
            entry.columns = Some(columns.clone());
        }
    }

    /// Number of statements in the cache.
    pub fn cached_statements(&self) -> usize {
        self.stmts().as_ref().map(LruCache::len).unwrap_or(0)
    }

    // ===== Operations =====

    /// Prepare a statement.
    ///
    /// Named parameters are rewritten to positional ones, the statement is described to learn
    /// its parameter and result types.
    pub async fn prepare(&self, sql: &str) -> Result<Statement> {
        if sql::split_statements(sql).len() > 1 {
            return Err(Error::config("cannot prepare multiple statements"));
        }
        let (sql, names) = sql::rewrite_named_parameters(sql)?;
        portal::check_message_limits(&sql, &[])?;
        let sql: Arc<str> = sql.into();
        let key = statement_key(&sql, &[]);

        let label = portal::next_label();
        let mux = self.mux();
        let (mut rx, (name, parse)) = mux
            .send_group(Some(label.clone()), |buf, _| {
                let (name, parse) = match self.cached(key) {
                    Some(prepared) => (prepared.name, false),
                    None => (StatementName::next(), true),
                };
                if parse {
                    frontend::write(Parse { prepare_name: name.as_str(), sql: &sql, oids: &[] }, buf);
                }
                frontend::write(Describe { kind: b'S', name: name.as_str() }, buf);
                frontend::write(Sync, buf);
                (name, parse)
            })
            .await?;

        let mut params = None;
        let mut columns = None;
        let mut error = None;
        loop {
            match mux.recv(&label, &mut rx).await? {
                BackendMessage::ParseComplete(_) => {
                    self.cache_insert(key, Prepared { name: name.clone(), columns: None });
                }
                BackendMessage::ParameterDescription(p) => params = Some(p.oids),
                BackendMessage::RowDescription(rd) => columns = Some(Arc::<[_]>::from(rd.fields)),
                BackendMessage::NoData(_) => {}
                BackendMessage::ErrorResponse(e) => error = Some(e.error),
                BackendMessage::ReadyForQuery(_) => break,
                other => return Err(self.protocol_violation(other.unexpected("prepare"))),
            }
        }

        if let Some(err) = error {
            if parse {
                // the name may have been cached before the describe failed
                if let Some(cache) = self.stmts().as_mut() {
                    cache.pop(&key);
                }
                mux.schedule_close(b'S', name.to_string());
            }
            return Err(err.into());
        }

        // statement describe reports text format, the cache keeps portal columns only
        if let Some(columns) = &columns {
            self.ensure_types(columns.iter().map(|e| e.type_oid)).await;
        }

        Ok(Statement {
            conn: self.clone(),
            sql,
            names,
            name,
            params: params.unwrap_or_default().into(),
            columns,
        })
    }

    /// Prepare a stored procedure call, see [`sql::procedure_call`].
    pub async fn prepare_call(&self, procedure: &str, params: usize) -> Result<Statement> {
        self.prepare(&sql::procedure_call(procedure, params)).await
    }

    pub(crate) async fn close_statement(&self, sql: &str, name: &StatementName) -> Result<()> {
        let key = statement_key(sql, &[]);
        let evicted = self.stmts().as_mut().and_then(|e| e.pop(&key));
        let mut names = vec![name.clone()];
        if let Some(old) = evicted.filter(|e| &e.name != name) {
            names.push(old.name);
        }

        let label = portal::next_label();
        let mux = self.mux();
        let (mut rx, ()) = mux
            .send_group(Some(label.clone()), |buf, _| {
                for name in &names {
                    frontend::write(Close { variant: b'S', name: name.as_str() }, buf);
                }
                frontend::write(Sync, buf);
            })
            .await?;

        let mut error = None;
        loop {
            match mux.recv(&label, &mut rx).await? {
                BackendMessage::CloseComplete(_) => {}
                BackendMessage::ErrorResponse(e) => error = Some(e.error),
                BackendMessage::ReadyForQuery(_) => break,
                other => return Err(self.protocol_violation(other.unexpected("close statement"))),
            }
        }
        match error {
            Some(err) => Err(err.into()),
            None => Ok(()),
        }
    }

    /// Run sql using the simple query protocol.
    ///
    /// Multiple statements run in one implicit transaction, unless they contain transaction
    /// control. Values are in text format.
    pub async fn simple_query(&self, sql: &str) -> Result<Vec<ResultSet>> {
        portal::check_message_limits(sql, &[])?;
        let label = portal::next_label();
        let mux = self.mux();
        let (mut rx, ()) = mux
            .send_group(Some(label.clone()), |buf, _| frontend::write(Query { sql }, buf))
            .await?;

        let types = self.types();
        let mut results = vec![];
        let mut columns: Option<Arc<[FieldDescription]>> = None;
        let mut rows = vec![];
        let mut error = None;

        loop {
            match mux.recv(&label, &mut rx).await? {
                BackendMessage::RowDescription(rd) => columns = Some(rd.fields.into()),
                BackendMessage::DataRow(dr) => {
                    let columns = columns.clone().unwrap_or_else(|| Arc::new([]));
                    let row = Row::new(columns, dr.values, types.clone()).map_err(|e| self.protocol_violation(e))?;
                    rows.push(row);
                }
                BackendMessage::CommandComplete(cmd) => results.push(ResultSet {
                    columns: columns.take(),
                    rows: std::mem::take(&mut rows),
                    rows_affected: cmd.rows_affected(),
                    tag: cmd.tag,
                }),
                BackendMessage::EmptyQueryResponse(_) => results.push(ResultSet {
                    columns: None,
                    rows: vec![],
                    tag: String::new(),
                    rows_affected: None,
                }),
                BackendMessage::ErrorResponse(e) => error = Some(e.error),
                BackendMessage::ReadyForQuery(_) => break,
                other => return Err(self.protocol_violation(other.unexpected("simple query"))),
            }
        }

        match error {
            Some(err) => Err(err.into()),
            None => Ok(results),
        }
    }

    /// Run a script statement by statement, stopping at the first error.
    ///
    /// Returns the total number of rows affected.
    pub async fn execute_script(&self, sql: &str) -> Result<u64> {
        let mut portal = Portal::script(self.clone().into(), sql).await?;
        portal.finish().await
    }

    /// Start executing sql with positional parameters, returns the open portal.
    pub async fn execute(&self, sql: &str, params: Vec<crate::Encoded>) -> Result<Portal> {
        Portal::start(self.clone().into(), sql, portal::Params::Positional(params), true).await
    }

    // ===== Transaction =====

    /// Begin a transaction with the default isolation level.
    pub async fn begin(&self) -> Result<Transaction> {
        Transaction::begin(self.clone().into(), None).await
    }

    /// Begin a transaction with the given isolation level.
    pub async fn begin_with(&self, isolation: Isolation) -> Result<Transaction> {
        Transaction::begin(self.clone().into(), Some(isolation)).await
    }

    /// Commit the transaction block opened with `BEGIN`.
    pub async fn commit(&self) -> Result<()> {
        self.simple_query("COMMIT").await.map(drop)
    }

    /// Roll back the transaction block opened with `BEGIN`.
    pub async fn rollback(&self) -> Result<()> {
        self.simple_query("ROLLBACK").await.map(drop)
    }

    /// Send `Terminate` and close the socket.
    ///
    /// Other handles to the same connection fail with a closed error afterwards.
    pub async fn close(self) -> Result<()> {
        self.shared.mux.terminate().await
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.shared.id)
            .field("process_id", &self.process_id())
            .field("state", &self.state())
            .finish()
    }
}

#[cfg(test)]
mod test {
    use bytes::Bytes;
    use std::{
        sync::{Arc, Mutex},
        time::Duration,
    };

    use super::*;
    use crate::{
        Encode, ErrorKind,
        auth::AuthError,
        mock::{AuthMode, MockServer, PAIR},
        postgres::oid,
        types::Value,
    };

    #[tokio::test]
    async fn authenticates_every_method() {
        for mode in [AuthMode::Trust, AuthMode::Cleartext, AuthMode::Md5, AuthMode::Scram] {
            let server = MockServer::start(mode).await;
            let conn = server.connect().await;
            assert_eq!(conn.parameter("server_version").as_deref(), Some("16.0"));
            assert!(conn.process_id().is_some());
            assert_eq!(conn.state(), ConnectionState::Idle);
        }
    }

    #[tokio::test]
    async fn rejects_bad_credentials() {
        for mode in [AuthMode::Cleartext, AuthMode::Md5, AuthMode::Scram] {
            let server = MockServer::start(mode).await;
            let err = Connection::connect_with(server.config().password("wrong")).await.unwrap_err();
            assert!(
                matches!(err.kind(), ErrorKind::Auth(AuthError::Rejected(e)) if e.code == "28P01"),
                "{mode:?}: {err}"
            );
        }

        let server = MockServer::start(AuthMode::ScramBadSignature).await;
        let err = Connection::connect_with(server.config()).await.unwrap_err();
        assert!(matches!(err.kind(), ErrorKind::Auth(AuthError::ServerSignature)), "{err}");

        let server = MockServer::start(AuthMode::Md5).await;
        let mut config = server.config();
        config.password = None;
        let err = Connection::connect_with(config).await.unwrap_err();
        assert!(matches!(err.kind(), ErrorKind::Auth(AuthError::MissingPassword)), "{err}");
    }

    #[tokio::test]
    async fn simple_query_results() {
        let server = MockServer::trust().await;
        let conn = server.connect().await;

        let sets = conn.simple_query("SELECT a; INSERT INTO t VALUES (1)").await.unwrap();
        assert_eq!(sets.len(), 2);
        assert_eq!(sets[0].rows.len(), 3);
        assert_eq!(sets[0].rows[0].try_get::<_, i32>(0).unwrap(), 1);
        assert_eq!(sets[0].tag, "SELECT 3");
        assert!(sets[1].columns.is_none());
        assert_eq!(sets[1].rows_affected, Some(1));

        let err = conn.simple_query("SELECT fail").await.unwrap_err();
        assert_eq!(err.code(), Some("22012"));
        assert!(!err.is_fatal());
        assert_eq!(conn.state(), ConnectionState::Idle);

        let script = "INSERT INTO t VALUES (1); INSERT INTO t VALUES (2); UPDATE t SET x = 1";
        assert_eq!(conn.execute_script(script).await.unwrap(), 4);
        assert_eq!(server.log().queries("UPDATE t SET x = 1"), 1);
    }

    #[tokio::test]
    async fn statement_cache_skips_parse() {
        let server = MockServer::trust().await;
        let conn = server.connect().await;

        for _ in 0..3 {
            let rows = crate::query::<_, _, (i32,)>("SELECT a", &conn).fetch_all().await.unwrap();
            assert_eq!(rows, [(1,), (2,), (3,)]);
        }
        assert_eq!(server.log().parses("SELECT a"), 1);
        assert_eq!(conn.cached_statements(), 1);

        // one-shot sql never enters the cache
        use crate::SqlExt;
        for _ in 0..2 {
            crate::query_row("SELECT b".once(), &conn).fetch_all().await.unwrap();
        }
        assert_eq!(server.log().parses("SELECT b"), 2);
        assert_eq!(conn.cached_statements(), 1);
    }

    #[tokio::test]
    async fn cache_eviction_closes_statement() {
        let server = MockServer::trust().await;
        let conn = Connection::connect_with(server.config().statement_cache(1)).await.unwrap();

        crate::query_row("SELECT a", &conn).fetch_all().await.unwrap();
        crate::query_row("SELECT b", &conn).fetch_all().await.unwrap();
        // the close is sent ahead of the next group
        crate::query_row("SELECT a", &conn).fetch_all().await.unwrap();

        let log = server.log();
        assert_eq!(log.parses("SELECT a"), 2);
        assert!(log.closes.iter().any(|(kind, _)| *kind == b'S'));
        assert_eq!(conn.cached_statements(), 1);
    }

    #[tokio::test]
    async fn prepared_statement() {
        let server = MockServer::trust().await;
        let conn = server.connect().await;

        let stmt = conn.prepare("SELECT @v::int4").await.unwrap();
        assert_eq!(stmt.sql(), "SELECT $1::int4");
        assert_eq!(stmt.param_names(), ["v"]);
        assert_eq!(stmt.param_types(), [oid::INT4]);

        // int2 is widened to the declared int4
        let mut portal = stmt.execute_named(vec![("v".into(), 7i16.encode())]).await.unwrap();
        let row = portal.fetch_next().await.unwrap().unwrap();
        assert_eq!(row.try_get::<_, i32>(0).unwrap(), 7);
        assert!(portal.fetch_next().await.unwrap().is_none());
        drop(portal);

        let err = stmt.execute_named(vec![]).await.unwrap_err();
        assert!(matches!(err.kind(), ErrorKind::Config(_)));

        assert!(conn.prepare("SELECT a; SELECT b").await.is_err());

        let name = stmt.name().to_owned();
        stmt.close().await.unwrap();
        assert!(server.log().closes.contains(&(b'S', name)));
        assert_eq!(server.log().parses("SELECT $1::int4"), 1);

        let stmt = conn.prepare("SELECT @v").await.unwrap();
        assert_eq!(stmt.param_types(), [oid::TEXT]);
    }

    #[tokio::test]
    async fn decodes_catalog_types() {
        let server = MockServer::trust().await;
        let conn = server.connect().await;

        let row = crate::query_row("SELECT composite", &conn).fetch_one().await.unwrap();
        let pair = row.get_value(0).unwrap();
        assert_eq!(pair.field("a"), Some(&Value::Int4(1)));
        assert_eq!(pair.field("b").and_then(Value::as_str), Some("x"));
        assert_eq!(row.get_value(1).unwrap(), Value::Enum("happy".into()));
        assert_eq!(row.try_get::<_, String>(1).unwrap(), "happy");
        assert_eq!(row.get_value(2).unwrap().as_array(), Some(&[Value::Int4(1), Value::Int4(2)][..]));
        let moods = row.get_value(3).unwrap();
        assert_eq!(moods.as_array().and_then(|e| e[1].as_str()), Some("sad"));
        assert_eq!(conn.types().get(PAIR).map(|e| e.name.as_str()), Some("pair"));

        // the catalog is loaded once, unknown types fall back to raw bytes
        let row = crate::query_row("SELECT opaque", &conn).fetch_one().await.unwrap();
        assert_eq!(row.get_value(0).unwrap(), Value::Unknown(Bytes::from_static(&[1, 2])));
        assert_eq!(server.log().queries(types::CATALOG_TYPES), 1);
    }

    #[tokio::test]
    async fn notices_and_notifications() {
        let server = MockServer::trust().await;
        let notices = Arc::new(Mutex::new(vec![]));
        let notifications = Arc::new(Mutex::new(vec![]));
        let config = server
            .config()
            .on_notice({
                let notices = notices.clone();
                move |e| notices.lock().unwrap().push(e.message.clone())
            })
            .on_notification({
                let notifications = notifications.clone();
                move |e| notifications.lock().unwrap().push((e.channel.clone(), e.payload.clone()))
            });
        let conn = Connection::connect_with(config).await.unwrap();

        let rows = crate::query_row("SELECT notice", &conn).fetch_all().await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(*notices.lock().unwrap(), ["mock notice"]);
        assert_eq!(*notifications.lock().unwrap(), [("mock_channel".to_owned(), "payload".to_owned())]);
    }

    #[tokio::test]
    async fn cancel_out_of_band() {
        let server = MockServer::trust().await;
        let conn = server.connect().await;

        let mut portal = conn.execute("SELECT sleep", vec![]).await.unwrap();
        conn.cancel().await.unwrap();
        let err = portal.fetch_next().await.unwrap_err();
        assert!(err.is_cancelled());
        assert!(matches!(err.kind(), ErrorKind::Cancelled(Some(e)) if e.code == "57014"));
        drop(portal);

        let sets = conn.simple_query("SELECT b").await.unwrap();
        assert_eq!(sets[0].rows.len(), 2);
        assert_eq!(server.log().cancels, 1);
    }

    #[tokio::test]
    async fn close_terminates() {
        let server = MockServer::trust().await;
        let conn = server.connect().await;
        let other = conn.clone();

        conn.close().await.unwrap();
        assert_eq!(other.state(), ConnectionState::Closed);
        let err = other.simple_query("SELECT a").await.unwrap_err();
        assert!(matches!(err.kind(), ErrorKind::Closed(_)));

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(server.log().terminated, 1);
    }

    #[tokio::test]
    async fn connect_refused() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let config = Config::default().host("127.0.0.1").port(port).user("mock");
        let err = Connection::connect_with(config).await.unwrap_err();
        assert!(matches!(err.kind(), ErrorKind::Io(_)));
        assert!(err.is_fatal());
    }
}
