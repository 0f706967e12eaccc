//! Scripted postgres backend on a loopback socket.
//!
//! Speaks enough of the protocol to drive the driver in tests: startup with every supported
//! authentication method, the simple and extended query flows, cancel requests, and a fixed set
//! of canned statements.
//!
//! | sql                | reply                                                   |
//! |--------------------|---------------------------------------------------------|
//! | `SELECT a`         | int4 rows 1, 2, 3                                       |
//! | `SELECT b`         | int4 rows 10, 20                                        |
//! | `SELECT series`    | int4 rows 1 to 5                                        |
//! | `SELECT $1`        | the bound parameter, untyped parameters are text        |
//! | `SELECT notice`    | a notice and a notification, then one row               |
//! | `SELECT composite` | composite, enum and array values                        |
//! | `SELECT opaque`    | a value of a type missing from the catalog              |
//! | `SELECT fail`      | error `22012`                                           |
//! | `SELECT sleep`     | waits for a cancel request, then error `57014`          |
//! | `SELECT malformed` | a frame with invalid length                             |
//! | `BEGIN`, `COMMIT`, `ROLLBACK`, `INSERT`, `UPDATE` | command tags, tracking the transaction status |
use base64::{Engine, engine::general_purpose::STANDARD};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use hmac::{Hmac, Mac};
use sha2::{Digest, Sha256};
use std::{
    collections::HashMap,
    net::SocketAddr,
    sync::{
        Arc, Mutex,
        atomic::{AtomicU32, Ordering},
    },
    time::Duration,
};
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::{TcpListener, TcpStream},
    sync::Notify,
    task::JoinHandle,
};

use crate::{
    Config, Connection,
    auth::{md5_password, pbkdf2_hmac_sha256},
    ext::{BufMutExt, BytesExt},
    postgres::{Oid, frontend::CANCEL_REQUEST_CODE, oid},
    types,
};

type BoxError = Box<dyn std::error::Error + Send + Sync>;
type Result<T, E = BoxError> = std::result::Result<T, E>;

pub(crate) const USER: &str = "mock";
pub(crate) const PASSWORD: &str = "secret";

const PROTOCOL_VERSION: u32 = 196_608;
const SCRAM_SALT: &[u8] = b"mock salt";
const SCRAM_ITERATIONS: u32 = 16;
const SLEEP_LIMIT: Duration = Duration::from_secs(5);

pub(crate) const PAIR: Oid = 90_001;
pub(crate) const MOOD: Oid = 90_002;
pub(crate) const PAIR_ARRAY: Oid = 90_003;
pub(crate) const MOOD_ARRAY: Oid = 90_004;
pub(crate) const UNKNOWN: Oid = 99_999;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum AuthMode {
    Trust,
    Cleartext,
    Md5,
    Scram,
    /// SCRAM exchange with a wrong server signature.
    ScramBadSignature,
}

/// What the server observed, for assertions.
#[derive(Debug, Clone, Default)]
pub(crate) struct Log {
    pub sessions: usize,
    pub terminated: usize,
    pub cancels: usize,
    pub queries: Vec<String>,
    pub parses: Vec<String>,
    /// Portal name and row limit of every `Execute`.
    pub executes: Vec<(String, i32)>,
    pub closes: Vec<(u8, String)>,
    /// Kind and name of every `Describe`.
    pub describes: Vec<(u8, String)>,
}

impl Log {
    pub fn parses(&self, sql: &str) -> usize {
        self.parses.iter().filter(|e| *e == sql).count()
    }

    pub fn describes(&self, kind: u8) -> usize {
        self.describes.iter().filter(|(e, _)| *e == kind).count()
    }

    pub fn queries(&self, sql: &str) -> usize {
        self.queries.iter().filter(|e| *e == sql).count()
    }
}

pub(crate) struct MockServer {
    addr: SocketAddr,
    shared: Arc<Shared>,
    task: JoinHandle<()>,
}

struct Shared {
    auth: AuthMode,
    next_pid: AtomicU32,
    backends: Mutex<HashMap<u32, Backend>>,
    log: Mutex<Log>,
}

struct Backend {
    secret: u32,
    cancel: Arc<Notify>,
}

impl MockServer {
    pub(crate) async fn start(auth: AuthMode) -> MockServer {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let shared = Arc::new(Shared {
            auth,
            next_pid: AtomicU32::new(1000),
            backends: Mutex::new(HashMap::new()),
            log: Mutex::new(Log::default()),
        });
        let task = tokio::spawn(accept(listener, shared.clone()));
        MockServer { addr, shared, task }
    }

    pub(crate) async fn trust() -> MockServer {
        Self::start(AuthMode::Trust).await
    }

    pub(crate) fn config(&self) -> Config {
        Config::default()
            .host("127.0.0.1")
            .port(self.addr.port())
            .user(USER)
            .password(PASSWORD)
    }

    pub(crate) async fn connect(&self) -> Connection {
        Connection::connect_with(self.config()).await.unwrap()
    }

    pub(crate) fn log(&self) -> Log {
        self.shared.log.lock().unwrap().clone()
    }
}

impl Drop for MockServer {
    fn drop(&mut self) {
        self.task.abort();
    }
}

impl Shared {
    fn log(&self, f: impl FnOnce(&mut Log)) {
        f(&mut self.log.lock().unwrap())
    }

    fn register(&self) -> (u32, u32, Arc<Notify>) {
        let pid = self.next_pid.fetch_add(1, Ordering::Relaxed);
        let secret = pid.wrapping_mul(2_654_435_761);
        let cancel = Arc::new(Notify::new());
        self.backends
            .lock()
            .unwrap()
            .insert(pid, Backend { secret, cancel: cancel.clone() });
        self.log(|l| l.sessions += 1);
        (pid, secret, cancel)
    }

    fn cancel(&self, pid: u32, secret: u32) {
        self.log(|l| l.cancels += 1);
        let backends = self.backends.lock().unwrap();
        if let Some(backend) = backends.get(&pid).filter(|e| e.secret == secret) {
            backend.cancel.notify_one();
        }
    }
}

async fn accept(listener: TcpListener, shared: Arc<Shared>) {
    while let Ok((io, _)) = listener.accept().await {
        let _ = io.set_nodelay(true);
        let shared = shared.clone();
        tokio::spawn(async move {
            let _ = serve(shared, io).await;
        });
    }
}

async fn serve(shared: Arc<Shared>, mut io: TcpStream) -> Result<()> {
    let len = io.read_i32().await?;
    let code = io.read_u32().await?;
    let mut body = vec![0; usize::try_from(len)?.checked_sub(8).ok_or("invalid startup length")?];
    io.read_exact(&mut body).await?;
    let mut body = Bytes::from(body);

    if code == CANCEL_REQUEST_CODE {
        let (pid, secret) = (body.try_get_u32()?, body.try_get_u32()?);
        shared.cancel(pid, secret);
        return Ok(());
    }
    if code != PROTOCOL_VERSION {
        return Err(format!("unsupported protocol {code}").into());
    }

    let mut params = HashMap::new();
    loop {
        let key = body.get_nul_string()?;
        if key.is_empty() {
            break;
        }
        params.insert(key, body.get_nul_string()?);
    }
    let user = params.remove("user").unwrap_or_default();

    let (pid, secret, cancel) = shared.register();
    let mut session = Session {
        shared,
        io,
        out: BytesMut::new(),
        cancel,
        status: b'I',
        skipping: false,
        statements: HashMap::new(),
        portals: HashMap::new(),
    };

    if !session.authenticate(&user).await? {
        return Ok(());
    }

    for (name, value) in [("server_version", "16.0"), ("client_encoding", "UTF8"), ("integer_datetimes", "on")] {
        message(&mut session.out, b'S', |b| {
            b.put_nul_string(name);
            b.put_nul_string(value);
        });
    }
    message(&mut session.out, b'K', |b| {
        b.put_u32(pid);
        b.put_u32(secret);
    });
    session.ready();
    session.flush().await?;

    session.run().await
}

// ===== Canned replies =====

#[derive(Debug, Clone)]
struct Cell {
    text: Vec<u8>,
    binary: Vec<u8>,
}

impl Cell {
    fn int4(value: i32) -> Option<Cell> {
        Some(Cell { text: value.to_string().into_bytes(), binary: value.to_be_bytes().to_vec() })
    }

    fn text(value: &str) -> Option<Cell> {
        Some(Cell { text: value.into(), binary: value.into() })
    }

    fn raw(text: &str, binary: impl Into<Vec<u8>>) -> Option<Cell> {
        Some(Cell { text: text.into(), binary: binary.into() })
    }
}

struct Rows {
    columns: Vec<(&'static str, Oid)>,
    rows: Vec<Vec<Option<Cell>>>,
    /// Send a notice and a notification before the first row.
    notice: bool,
}

enum Reply {
    Rows(Rows),
    Command(String),
    Error(&'static str, &'static str),
    Empty,
    Sleep,
    Malformed,
}

fn int_rows(name: &'static str, values: &[i32]) -> Reply {
    Reply::Rows(Rows {
        columns: vec![(name, oid::INT4)],
        rows: values.iter().map(|v| vec![Cell::int4(*v)]).collect(),
        notice: false,
    })
}

fn text_rows(columns: &[&'static str], rows: &[&[&str]]) -> Reply {
    Reply::Rows(Rows {
        columns: columns.iter().map(|e| (*e, oid::TEXT)).collect(),
        rows: rows.iter().map(|row| row.iter().map(|e| Cell::text(e)).collect()).collect(),
        notice: false,
    })
}

fn reply(sql: &str, params: &[Option<Bytes>], oids: &[Oid]) -> Reply {
    let sql = sql.trim();
    match sql {
        "" => Reply::Empty,
        "SELECT a" => int_rows("a", &[1, 2, 3]),
        "SELECT b" => int_rows("b", &[10, 20]),
        "SELECT series" => int_rows("n", &[1, 2, 3, 4, 5]),
        "SELECT $1" | "SELECT $1::int4" => {
            let cell = params
                .first()
                .cloned()
                .flatten()
                .map(|e| Cell { text: e.to_vec(), binary: e.to_vec() });
            Reply::Rows(Rows {
                columns: vec![("echo", oids.first().copied().unwrap_or(oid::TEXT))],
                rows: vec![vec![cell]],
                notice: false,
            })
        }
        "SELECT notice" => match int_rows("n", &[1]) {
            Reply::Rows(rows) => Reply::Rows(Rows { notice: true, ..rows }),
            other => other,
        },
        "SELECT composite" => composite(),
        "SELECT opaque" => Reply::Rows(Rows {
            columns: vec![("x", UNKNOWN)],
            rows: vec![vec![Cell::raw("\\x0102", vec![1u8, 2])]],
            notice: false,
        }),
        "SELECT fail" => Reply::Error("22012", "division by zero"),
        "SELECT sleep" => Reply::Sleep,
        "SELECT malformed" => Reply::Malformed,
        "COMMIT" | "ROLLBACK" | "END" => Reply::Command(sql.into()),
        _ if sql.starts_with("BEGIN") => Reply::Command("BEGIN".into()),
        _ if sql.starts_with("INSERT") => Reply::Command("INSERT 0 1".into()),
        _ if sql.starts_with("UPDATE") => Reply::Command("UPDATE 2".into()),
        _ if sql == types::CATALOG_TYPES => text_rows(
            &["oid", "nspname", "typname", "typtype", "typelem", "typrelid", "typbasetype"],
            &[
                &["90001", "public", "pair", "c", "0", "90010", "0"],
                &["90002", "public", "mood", "e", "0", "0", "0"],
                &["90003", "public", "_pair", "b", "90001", "0", "0"],
                &["90004", "public", "_mood", "b", "90002", "0", "0"],
            ],
        ),
        _ if sql == types::CATALOG_ATTRIBUTES => text_rows(
            &["attrelid", "attname", "atttypid"],
            &[&["90010", "a", "23"], &["90010", "b", "25"]],
        ),
        _ if sql == types::CATALOG_ENUMS => text_rows(
            &["enumtypid", "enumlabel"],
            &[&["90002", "happy"], &["90002", "sad"]],
        ),
        _ => Reply::Error("42601", "syntax error"),
    }
}

/// One dimensional array header.
fn array(element: Oid, len: i32) -> BytesMut {
    let mut buf = BytesMut::new();
    buf.put_i32(1);
    buf.put_i32(0);
    buf.put_u32(element);
    buf.put_i32(len);
    buf.put_i32(1);
    buf
}

fn composite() -> Reply {
    let mut pair = BytesMut::new();
    pair.put_i32(2);
    pair.put_u32(oid::INT4);
    pair.put_i32(4);
    pair.put_i32(1);
    pair.put_u32(oid::TEXT);
    pair.put_i32(1);
    pair.put_slice(b"x");

    let mut ints = array(oid::INT4, 2);
    for v in [1, 2] {
        ints.put_i32(4);
        ints.put_i32(v);
    }

    let mut moods = array(MOOD, 2);
    for label in ["happy", "sad"] {
        moods.put_i32(label.len() as i32);
        moods.put_slice(label.as_bytes());
    }

    Reply::Rows(Rows {
        columns: vec![("pair", PAIR), ("mood", MOOD), ("ints", oid::INT4_ARRAY), ("moods", MOOD_ARRAY)],
        rows: vec![vec![
            Cell::raw("(1,x)", pair.to_vec()),
            Cell::raw("happy", "happy"),
            Cell::raw("{1,2}", ints.to_vec()),
            Cell::raw("{happy,sad}", moods.to_vec()),
        ]],
        notice: false,
    })
}

/// Highest `$n` placeholder in sql.
fn count_params(sql: &str) -> usize {
    sql.match_indices('$')
        .filter_map(|(i, _)| {
            let digits = sql[i + 1..].split(|c: char| !c.is_ascii_digit()).next()?;
            digits.parse::<usize>().ok()
        })
        .max()
        .unwrap_or(0)
}

// ===== Backend messages =====

fn message(out: &mut BytesMut, tag: u8, body: impl FnOnce(&mut BytesMut)) {
    out.put_u8(tag);
    let at = out.len();
    out.put_i32(0);
    body(out);
    let len = (out.len() - at) as i32;
    out[at..at + 4].copy_from_slice(&len.to_be_bytes());
}

fn error(out: &mut BytesMut, tag: u8, severity: &str, code: &str, text: &str) {
    message(out, tag, |b| {
        for (field, value) in [(b'S', severity), (b'V', severity), (b'C', code), (b'M', text)] {
            b.put_u8(field);
            b.put_nul_string(value);
        }
        b.put_u8(0);
    });
}

fn row_description(out: &mut BytesMut, columns: &[(&str, Oid)], binary: bool) {
    message(out, b'T', |b| {
        b.put_i16(columns.len() as i16);
        for (name, oid) in columns {
            b.put_nul_string(name);
            b.put_u32(0);
            b.put_i16(0);
            b.put_u32(*oid);
            b.put_i16(-1);
            b.put_i32(-1);
            b.put_i16(binary.into());
        }
    });
}

fn data_row(out: &mut BytesMut, row: &[Option<Cell>], binary: bool) {
    message(out, b'D', |b| {
        b.put_i16(row.len() as i16);
        for cell in row {
            match cell {
                Some(cell) => {
                    let value = if binary { &cell.binary } else { &cell.text };
                    b.put_i32(value.len() as i32);
                    b.put_slice(value);
                }
                None => b.put_i32(-1),
            }
        }
    });
}

fn describe_reply(out: &mut BytesMut, reply: &Reply, binary: bool) {
    match reply {
        Reply::Rows(rows) => row_description(out, &rows.columns, binary),
        _ => message(out, b'n', |_| {}),
    }
}

fn command_complete(out: &mut BytesMut, tag: &str) {
    message(out, b'C', |b| b.put_nul_string(tag));
}

// ===== Session =====

struct MockStatement {
    sql: String,
    oids: Vec<Oid>,
}

impl MockStatement {
    /// Declared types, unspecified ones inferred as text unless cast with `::int4`.
    fn param_types(&self) -> Vec<Oid> {
        (0..count_params(&self.sql))
            .map(|i| match self.oids.get(i).copied().filter(|e| *e != 0) {
                Some(oid) => oid,
                None if self.sql.contains(&format!("${}::int4", i + 1)) => oid::INT4,
                None => oid::TEXT,
            })
            .collect()
    }
}

struct MockPortal {
    sql: String,
    reply: Reply,
    binary: bool,
    sent: usize,
}

struct Session {
    shared: Arc<Shared>,
    io: TcpStream,
    out: BytesMut,
    cancel: Arc<Notify>,
    status: u8,
    /// An extended query failed, messages are ignored until `Sync`.
    skipping: bool,
    statements: HashMap<String, MockStatement>,
    portals: HashMap<String, MockPortal>,
}

impl Session {
    async fn read(&mut self) -> Result<(u8, Bytes)> {
        let tag = self.io.read_u8().await?;
        let len = self.io.read_i32().await?;
        let mut body = vec![0; usize::try_from(len)?.checked_sub(4).ok_or("invalid length")?];
        self.io.read_exact(&mut body).await?;
        Ok((tag, body.into()))
    }

    async fn flush(&mut self) -> Result<()> {
        self.io.write_all(&self.out).await?;
        self.out.clear();
        Ok(())
    }

    fn ready(&mut self) {
        let status = self.status;
        message(&mut self.out, b'Z', |b| b.put_u8(status));
    }

    // ===== Authentication =====

    async fn authenticate(&mut self, user: &str) -> Result<bool> {
        match self.shared.auth {
            AuthMode::Trust => {}
            AuthMode::Cleartext => {
                self.auth_request(3, &[]).await?;
                if self.read_password().await? != PASSWORD {
                    return self.reject().await;
                }
            }
            AuthMode::Md5 => {
                let salt = [7, 11, 13, 17];
                self.auth_request(5, &salt).await?;
                if self.read_password().await? != md5_password(user, PASSWORD, salt) {
                    return self.reject().await;
                }
            }
            AuthMode::Scram | AuthMode::ScramBadSignature => {
                if !self.scram().await? {
                    return self.reject().await;
                }
            }
        }
        self.auth_request(0, &[]).await?;
        Ok(true)
    }

    async fn auth_request(&mut self, code: i32, data: &[u8]) -> Result<()> {
        message(&mut self.out, b'R', |b| {
            b.put_i32(code);
            b.put_slice(data);
        });
        self.flush().await
    }

    async fn read_password(&mut self) -> Result<String> {
        let (tag, mut body) = self.read().await?;
        if tag != b'p' {
            return Err("expected password message".into());
        }
        Ok(body.get_nul_string()?)
    }

    async fn reject(&mut self) -> Result<bool> {
        error(&mut self.out, b'E', "FATAL", "28P01", "password authentication failed");
        self.flush().await?;
        Ok(false)
    }

    async fn scram(&mut self) -> Result<bool> {
        let mut mechanisms = BytesMut::new();
        mechanisms.put_nul_string("SCRAM-SHA-256");
        mechanisms.put_u8(0);
        self.auth_request(10, &mechanisms).await?;

        let (_, mut body) = self.read().await?;
        let _mechanism = body.get_nul_string()?;
        let len = usize::try_from(body.try_get_i32()?)?;
        let client_first = String::from_utf8(body.split_to(len).to_vec())?;
        let first_bare = client_first.strip_prefix("n,,").ok_or("unexpected gs2 header")?;
        let (_, client_nonce) = first_bare.split_once("r=").ok_or("missing client nonce")?;

        let server_first = format!(
            "r={client_nonce}mocknonce,s={},i={SCRAM_ITERATIONS}",
            STANDARD.encode(SCRAM_SALT)
        );
        self.auth_request(11, server_first.as_bytes()).await?;

        let (_, body) = self.read().await?;
        let client_final = String::from_utf8(body.to_vec())?;
        let (without_proof, proof) = client_final.split_once(",p=").ok_or("missing proof")?;
        let proof = STANDARD.decode(proof)?;

        let mut salted = [0u8; 32];
        pbkdf2_hmac_sha256(PASSWORD.as_bytes(), SCRAM_SALT, SCRAM_ITERATIONS, &mut salted);
        let stored_key = Sha256::digest(hmac(&salted, b"Client Key"));
        let auth_message = format!("{first_bare},{server_first},{without_proof}");
        let signature = hmac(&stored_key, auth_message.as_bytes());
        let client_key: Vec<u8> = proof.iter().zip(signature).map(|(p, s)| p ^ s).collect();
        if Sha256::digest(&client_key) != stored_key {
            return Ok(false);
        }

        let mut server_signature = hmac(&hmac(&salted, b"Server Key"), auth_message.as_bytes());
        if self.shared.auth == AuthMode::ScramBadSignature {
            server_signature[0] ^= 0xff;
        }
        let server_final = format!("v={}", STANDARD.encode(server_signature));
        self.auth_request(12, server_final.as_bytes()).await?;
        Ok(true)
    }

    // ===== Queries =====

    async fn run(&mut self) -> Result<()> {
        loop {
            let (tag, body) = self.read().await?;
            if tag == b'X' {
                self.shared.log(|l| l.terminated += 1);
                return Ok(());
            }
            if self.skipping && tag != b'S' {
                continue;
            }
            match tag {
                b'Q' => self.simple(body).await?,
                b'P' => self.parse(body)?,
                b'B' => self.bind(body)?,
                b'D' => self.describe(body)?,
                b'E' => self.execute(body).await?,
                b'C' => self.close(body)?,
                b'H' => self.flush().await?,
                b'S' => self.sync().await?,
                other => return Err(format!("unexpected frontend message {}", other as char).into()),
            }
        }
    }

    /// Apply transaction status rules to a reply about to run.
    fn gate(&mut self, sql: &str, reply: Reply) -> Reply {
        let sql = sql.trim();
        let ends = matches!(sql, "COMMIT" | "ROLLBACK" | "END");
        if self.status == b'E' && !ends {
            return Reply::Error("25P02", "current transaction is aborted");
        }
        if let Reply::Command(tag) = &reply {
            if tag == "BEGIN" {
                self.status = b'T';
            }
            if ends {
                let failed = self.status == b'E';
                self.status = b'I';
                if failed {
                    return Reply::Command("ROLLBACK".into());
                }
            }
        }
        reply
    }

    fn fail(&mut self, code: &str, text: &str) {
        error(&mut self.out, b'E', "ERROR", code, text);
        if self.status == b'T' {
            self.status = b'E';
        }
    }

    fn fail_extended(&mut self, code: &str, text: &str) {
        self.fail(code, text);
        self.skipping = true;
    }

    fn notices(&mut self, rows: &Rows) {
        if rows.notice {
            error(&mut self.out, b'N', "NOTICE", "00000", "mock notice");
            message(&mut self.out, b'A', |b| {
                b.put_u32(4242);
                b.put_nul_string("mock_channel");
                b.put_nul_string("payload");
            });
        }
    }

    /// Wait for a cancel request, returns `false` when canceled.
    async fn sleep(&mut self) -> Result<bool> {
        self.flush().await?;
        match tokio::time::timeout(SLEEP_LIMIT, self.cancel.notified()).await {
            Ok(()) => {
                self.fail("57014", "canceling statement due to user request");
                Ok(false)
            }
            Err(_) => {
                command_complete(&mut self.out, "SELECT 0");
                Ok(true)
            }
        }
    }

    async fn malformed(&mut self) -> Result<()> {
        self.out.put_u8(b'D');
        self.out.put_i32(2);
        self.flush().await?;
        Err("malformed frame sent".into())
    }

    async fn simple(&mut self, mut body: Bytes) -> Result<()> {
        let sql = body.get_nul_string()?;
        self.shared.log(|l| l.queries.push(sql.clone()));

        let statements: Vec<&str> = sql.split(';').map(str::trim).filter(|e| !e.is_empty()).collect();
        if statements.is_empty() {
            message(&mut self.out, b'I', |_| {});
        }

        for stmt in statements {
            let reply = reply(stmt, &[], &[]);
            match self.gate(stmt, reply) {
                Reply::Rows(rows) => {
                    self.notices(&rows);
                    row_description(&mut self.out, &rows.columns, false);
                    for row in &rows.rows {
                        data_row(&mut self.out, row, false);
                    }
                    command_complete(&mut self.out, &format!("SELECT {}", rows.rows.len()));
                }
                Reply::Command(tag) => command_complete(&mut self.out, &tag),
                Reply::Empty => message(&mut self.out, b'I', |_| {}),
                Reply::Error(code, text) => {
                    self.fail(code, text);
                    break;
                }
                Reply::Sleep => {
                    if !self.sleep().await? {
                        break;
                    }
                }
                Reply::Malformed => return self.malformed().await,
            }
        }

        self.ready();
        self.flush().await
    }

    fn parse(&mut self, mut body: Bytes) -> Result<()> {
        let name = body.get_nul_string()?;
        let sql = body.get_nul_string()?;
        let count = body.try_get_i16()?;
        let oids = (0..count).map(|_| body.try_get_u32()).collect::<Result<Vec<_>, _>>()?;
        self.shared.log(|l| l.parses.push(sql.clone()));

        if !name.is_empty() && self.statements.contains_key(&name) {
            self.fail_extended("42P05", "prepared statement already exists");
            return Ok(());
        }
        self.statements.insert(name, MockStatement { sql, oids });
        message(&mut self.out, b'1', |_| {});
        Ok(())
    }

    fn bind(&mut self, mut body: Bytes) -> Result<()> {
        let portal = body.get_nul_string()?;
        let stmt = body.get_nul_string()?;
        for _ in 0..body.try_get_i16()? {
            body.try_get_i16()?;
        }
        let mut params = vec![];
        for _ in 0..body.try_get_i16()? {
            params.push(body.get_value()?);
        }
        let formats = (0..body.try_get_i16()?)
            .map(|_| body.try_get_i16())
            .collect::<Result<Vec<_>, _>>()?;

        let Some((sql, oids)) = self.statements.get(&stmt).map(|e| (e.sql.clone(), e.param_types())) else {
            self.fail_extended("26000", "prepared statement does not exist");
            return Ok(());
        };

        let reply = reply(&sql, &params, &oids);
        let binary = formats.first() == Some(&1);
        self.portals.insert(portal, MockPortal { sql, reply, binary, sent: 0 });
        message(&mut self.out, b'2', |_| {});
        Ok(())
    }

    fn describe(&mut self, mut body: Bytes) -> Result<()> {
        let kind = body.try_get_u8()?;
        let name = body.get_nul_string()?;
        self.shared.log(|l| l.describes.push((kind, name.clone())));

        if kind == b'S' {
            let Some((sql, oids)) = self.statements.get(&name).map(|e| (e.sql.clone(), e.param_types())) else {
                self.fail_extended("26000", "prepared statement does not exist");
                return Ok(());
            };
            message(&mut self.out, b't', |b| {
                b.put_i16(oids.len() as i16);
                for oid in &oids {
                    b.put_u32(*oid);
                }
            });
            describe_reply(&mut self.out, &reply(&sql, &[], &oids), false);
            return Ok(());
        }

        match self.portals.get(&name) {
            Some(portal) => describe_reply(&mut self.out, &portal.reply, portal.binary),
            None => self.fail_extended("34000", "portal does not exist"),
        }
        Ok(())
    }

    async fn execute(&mut self, mut body: Bytes) -> Result<()> {
        let name = body.get_nul_string()?;
        let max_row = body.try_get_i32()?;
        self.shared.log(|l| l.executes.push((name.clone(), max_row)));

        let Some(mut portal) = self.portals.remove(&name) else {
            self.fail_extended("34000", "portal does not exist");
            return Ok(());
        };
        let reply = std::mem::replace(&mut portal.reply, Reply::Empty);
        portal.reply = self.gate(&portal.sql, reply);

        let mut suspended = false;
        match &portal.reply {
            Reply::Rows(rows) => {
                if portal.sent == 0 {
                    self.notices(rows);
                }
                let total = rows.rows.len();
                let end = match usize::try_from(max_row) {
                    Ok(0) | Err(_) => total,
                    Ok(max) => (portal.sent + max).min(total),
                };
                for row in &rows.rows[portal.sent..end] {
                    data_row(&mut self.out, row, portal.binary);
                }
                portal.sent = end;
                suspended = end < total;
                match suspended {
                    true => message(&mut self.out, b's', |_| {}),
                    false => command_complete(&mut self.out, &format!("SELECT {end}")),
                }
            }
            Reply::Command(tag) => command_complete(&mut self.out, tag),
            Reply::Empty => message(&mut self.out, b'I', |_| {}),
            Reply::Error(code, text) => self.fail_extended(code, text),
            Reply::Sleep => {
                if !self.sleep().await? {
                    self.skipping = true;
                }
            }
            Reply::Malformed => return self.malformed().await,
        }

        if suspended {
            self.portals.insert(name, portal);
        }
        Ok(())
    }

    fn close(&mut self, mut body: Bytes) -> Result<()> {
        let kind = body.try_get_u8()?;
        let name = body.get_nul_string()?;
        self.shared.log(|l| l.closes.push((kind, name.clone())));
        match kind {
            b'S' => self.statements.remove(&name).map(drop),
            _ => self.portals.remove(&name).map(drop),
        };
        message(&mut self.out, b'3', |_| {});
        Ok(())
    }

    async fn sync(&mut self) -> Result<()> {
        self.skipping = false;
        // portals live until the end of the transaction
        if self.status != b'T' {
            self.portals.clear();
        }
        self.ready();
        self.flush().await
    }
}

fn hmac(key: &[u8], data: &[u8]) -> [u8; 32] {
    let mut mac = Hmac::<Sha256>::new_from_slice(key).unwrap();
    mac.update(data);
    let mut out = [0u8; 32];
    out.copy_from_slice(&mac.finalize().into_bytes());
    out
}

mod test {
    use super::*;

    #[test]
    fn placeholders() {
        assert_eq!(count_params("SELECT a"), 0);
        assert_eq!(count_params("SELECT $1, $2"), 2);
        assert_eq!(count_params("SELECT $10 + $2"), 10);
    }
}
