//! Database connection pooling.
//!
//! A [`Pool`] is bounded by a semaphore sized to [`PoolConfig::max_size`]. Every checked out
//! connection holds one permit, an idle connection holds none. Checking out pops the freshest
//! idle connection, or opens a new one while holding the permit.
//!
//! A [`PoolRegistry`] maps [`Config::key`] to pools, so every open with the same configuration
//! shares one pool.
use std::{
    collections::{HashMap, VecDeque},
    ops::Deref,
    sync::{
        Arc, Mutex, MutexGuard,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};
use tokio::{
    sync::{OwnedSemaphorePermit, Semaphore},
    time::Instant,
};

use crate::{
    Config, Connection, Error, Result,
    transaction::{Isolation, Transaction},
};

mod config;

pub use config::PoolConfig;

/// How often a blocked checkout looks for emancipated connections.
const RECLAIM_INTERVAL: Duration = Duration::from_millis(50);

/// Database connection pool.
///
/// Cheap to clone, clones share the same connections.
#[derive(Clone)]
pub struct Pool {
    inner: Arc<PoolInner>,
}

struct PoolInner {
    config: PoolConfig,
    key: String,
    semaphore: Arc<Semaphore>,
    generation: AtomicU64,
    state: Mutex<PoolState>,
}

#[derive(Default)]
struct PoolState {
    /// Front is the most recently released.
    idle: VecDeque<IdleEntry>,
    in_use: usize,
    /// Released while other handles to the connection were still alive.
    parked: Vec<ParkedEntry>,
}

struct IdleEntry {
    conn: Connection,
    generation: u64,
    since: Instant,
}

struct ParkedEntry {
    conn: Connection,
    generation: u64,
    _permit: OwnedSemaphorePermit,
}

/// Pool statistics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolStats {
    /// Every physical connection the pool accounts for.
    pub size: usize,
    pub idle: usize,
    pub in_use: usize,
    /// Released connections still referenced elsewhere, counted in `size`.
    pub parked: usize,
}

impl Pool {
    /// Create [`Pool`] and try to create one connection.
    pub async fn connect(url: &str) -> Result<Self> {
        PoolConfig::parse(url)?.connect().await
    }

    /// Create [`Pool`] without trying to create connection.
    pub fn connect_lazy(url: &str) -> Result<Self> {
        PoolConfig::parse(url)?.connect_lazy()
    }

    /// Create [`Pool`] and try to create one connection.
    ///
    /// See [`Config::from_env`][1] for more details on env.
    ///
    /// [1]: crate::Config::from_env
    pub async fn connect_env() -> Result<Pool> {
        PoolConfig::from_env().connect().await
    }

    /// Create [`Pool`] without connecting.
    pub fn new(config: PoolConfig) -> Result<Pool> {
        config.validate()?;
        Ok(Self {
            inner: Arc::new(PoolInner {
                key: config.conn.key(),
                semaphore: Arc::new(Semaphore::new(config.max_size)),
                generation: AtomicU64::new(0),
                state: Mutex::new(PoolState::default()),
                config,
            }),
        })
    }

    /// The normalized configuration string this pool is keyed by.
    pub fn key(&self) -> &str {
        &self.inner.key
    }

    pub fn config(&self) -> &PoolConfig {
        &self.inner.config
    }

    pub fn stats(&self) -> PoolStats {
        let st = self.inner.state();
        PoolStats {
            size: st.idle.len() + st.in_use + st.parked.len(),
            idle: st.idle.len(),
            in_use: st.in_use,
            parked: st.parked.len(),
        }
    }

    /// Check out a connection.
    ///
    /// Waits up to [`PoolConfig::acquire_timeout`] when the pool is at capacity, then fails with
    /// a pool timeout error leaving the pool untouched.
    pub async fn acquire(&self) -> Result<PooledConnection> {
        let inner = &self.inner;
        let timeout = inner.config.acquire_timeout;
        let deadline = Instant::now() + timeout;

        let permit = loop {
            if let Ok(permit) = inner.semaphore.clone().try_acquire_owned() {
                break permit;
            }
            if inner.reclaim() > 0 {
                continue;
            }

            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                #[cfg(feature = "log")]
                log::debug!("pool checkout timed out after {timeout:?}");
                return Err(Error::pool_timeout(timeout));
            }

            let wait = remaining.min(RECLAIM_INTERVAL);
            match tokio::time::timeout(wait, inner.semaphore.clone().acquire_owned()).await {
                Ok(Ok(permit)) => break permit,
                Ok(Err(_)) => return Err(Error::closed("pool closed")),
                Err(_) => continue,
            }
        };

        let generation = inner.generation();
        while let Some(entry) = inner.pop_idle() {
            if entry.conn.is_broken() || entry.generation != generation {
                #[cfg(feature = "log")]
                log::debug!("discarding stale pooled connection #{}", entry.conn.id());
                continue;
            }
            if entry.since.elapsed() >= inner.config.idle_timeout {
                #[cfg(feature = "log")]
                log::debug!("closing idle pooled connection #{}", entry.conn.id());
                close_in_background(entry.conn);
                continue;
            }
            return Ok(inner.checkout(self, entry.conn, generation, permit));
        }

        // the permit is released when connecting fails
        let conn = Connection::connect_with(inner.config.conn.clone()).await?;
        Ok(inner.checkout(self, conn, generation, permit))
    }

    /// Check out a connection and begin a transaction on it.
    pub async fn begin(&self) -> Result<Transaction> {
        Transaction::begin(self.acquire().await?.into(), None).await
    }

    /// Check out a connection and begin a transaction with the given isolation level.
    pub async fn begin_with(&self, isolation: Isolation) -> Result<Transaction> {
        Transaction::begin(self.acquire().await?.into(), Some(isolation)).await
    }

    /// Close every idle connection, connections checked out now are discarded when released.
    pub fn clear(&self) {
        let inner = &self.inner;
        inner.generation.fetch_add(1, Ordering::AcqRel);
        let idle = std::mem::take(&mut inner.state().idle);

        #[cfg(feature = "log")]
        log::debug!("pool cleared, closing {} idle connections", idle.len());

        for entry in idle {
            close_in_background(entry.conn);
        }
        inner.reclaim();
    }

    /// Reclaim released connections no longer referenced anywhere, returns how many.
    ///
    /// Checkout does this by itself when the pool is at capacity.
    pub fn reclaim(&self) -> usize {
        self.inner.reclaim()
    }
}

/// Send `Terminate` when a runtime is available, dropping the last handle closes the socket anyway.
fn close_in_background(conn: Connection) {
    if let Ok(handle) = tokio::runtime::Handle::try_current() {
        handle.spawn(conn.close());
    }
}

impl PoolInner {
    fn state(&self) -> MutexGuard<'_, PoolState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    fn pop_idle(&self) -> Option<IdleEntry> {
        self.state().idle.pop_front()
    }

    fn checkout(&self, pool: &Pool, conn: Connection, generation: u64, permit: OwnedSemaphorePermit) -> PooledConnection {
        self.state().in_use += 1;
        PooledConnection {
            conn: Some(conn),
            pool: pool.clone(),
            generation,
            permit: Some(permit),
        }
    }

    fn release(&self, conn: Connection, generation: u64, permit: OwnedSemaphorePermit) {
        let mut st = self.state();
        st.in_use = st.in_use.saturating_sub(1);

        if conn.is_broken() || generation != self.generation() {
            #[cfg(feature = "log")]
            log::debug!("discarding released connection #{}", conn.id());
            return;
        }

        if conn.mux().needs_reset() {
            conn.mux().schedule_rollback();
        }

        if conn.handles() > 1 {
            st.parked.push(ParkedEntry { conn, generation, _permit: permit });
            return;
        }

        st.idle.push_front(IdleEntry { conn, generation, since: Instant::now() });
        drop(st);
        drop(permit);
    }

    fn reclaim(&self) -> usize {
        let generation = self.generation();
        let mut st = self.state();

        let (free, parked): (Vec<_>, Vec<_>) = std::mem::take(&mut st.parked)
            .into_iter()
            .partition(|e| e.conn.handles() == 1);
        st.parked = parked;

        let reclaimed = free.len();
        let mut permits = Vec::with_capacity(reclaimed);
        for ParkedEntry { conn, generation: released, _permit: permit } in free {
            #[cfg(feature = "log")]
            log::debug!("reclaimed emancipated connection #{}", conn.id());
            if !conn.is_broken() && released == generation {
                st.idle.push_front(IdleEntry { conn, generation, since: Instant::now() });
            }
            permits.push(permit);
        }

        drop(st);
        drop(permits);
        reclaimed
    }
}

impl std::fmt::Debug for Pool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pool")
            .field("config", &self.inner.config)
            .field("stats", &self.stats())
            .finish()
    }
}

/// Instance of [`Pool`] with the checked out connection.
///
/// Returns the connection to the pool on drop. A connection still referenced elsewhere, by a
/// [`Statement`][crate::Statement] for example, is parked until the last reference goes away.
pub struct PooledConnection {
    pool: Pool,
    conn: Option<Connection>,
    generation: u64,
    permit: Option<OwnedSemaphorePermit>,
}

impl PooledConnection {
    /// Returns the [`Pool`] handle.
    pub fn pool(&self) -> &Pool {
        &self.pool
    }

    /// Take the connection out of the pool, freeing its slot.
    pub fn detach(mut self) -> Option<Connection> {
        let conn = self.conn.take();
        let mut st = self.pool.inner.state();
        st.in_use = st.in_use.saturating_sub(1);
        conn
    }
}

impl Deref for PooledConnection {
    type Target = Connection;

    fn deref(&self) -> &Self::Target {
        match &self.conn {
            Some(conn) => conn,
            // `conn` is only taken by `detach` and `drop`, both consume `self`
            None => unreachable!("connection already released"),
        }
    }
}

impl Drop for PooledConnection {
    fn drop(&mut self) {
        if let (Some(conn), Some(permit)) = (self.conn.take(), self.permit.take()) {
            self.pool.inner.release(conn, self.generation, permit);
        }
    }
}

impl std::fmt::Debug for PooledConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PooledConnection")
            .field("conn", &self.conn)
            .field("generation", &self.generation)
            .finish()
    }
}

/// Pools keyed by normalized configuration.
///
/// Create one at application start and share it, clones refer to the same pools.
#[derive(Clone, Default)]
pub struct PoolRegistry {
    pools: Arc<Mutex<HashMap<String, Pool>>>,
}

impl PoolRegistry {
    pub fn new() -> PoolRegistry {
        Self::default()
    }

    fn pools_mut(&self) -> MutexGuard<'_, HashMap<String, Pool>> {
        self.pools.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Returns the pool for `config`, creating it on first use.
    ///
    /// Pool settings of an existing pool are kept.
    pub fn get_or_create(&self, config: PoolConfig) -> Result<Pool> {
        config.validate()?;
        let key = config.conn.key();
        let mut pools = self.pools_mut();
        if let Some(pool) = pools.get(&key) {
            return Ok(pool.clone());
        }
        let pool = Pool::new(config)?;
        pools.insert(key, pool.clone());
        Ok(pool)
    }

    /// Returns the pool for a connection string.
    pub fn open(&self, input: &str) -> Result<Pool> {
        self.get_or_create(PoolConfig::parse(input)?)
    }

    /// Check out a connection from the pool for a connection string.
    pub async fn acquire(&self, input: &str) -> Result<PooledConnection> {
        self.open(input)?.acquire().await
    }

    /// Returns the pool for `config`, if any.
    pub fn get(&self, config: &Config) -> Option<Pool> {
        self.pools_mut().get(&config.key()).cloned()
    }

    /// Every registered pool.
    pub fn pools(&self) -> Vec<Pool> {
        self.pools_mut().values().cloned().collect()
    }

    /// Clear every registered pool.
    pub fn clear_all(&self) {
        for pool in self.pools() {
            pool.clear();
        }
    }

    /// Unregister and clear the pool for `config`.
    pub fn remove(&self, config: &Config) -> Option<Pool> {
        let pool = self.pools_mut().remove(&config.key())?;
        pool.clear();
        Some(pool)
    }
}

impl std::fmt::Debug for PoolRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PoolRegistry").field("pools", &self.pools_mut().len()).finish()
    }
}
