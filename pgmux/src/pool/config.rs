use std::time::Duration;

use crate::{
    Config, Result,
    connection::{ConfigError, parse_pairs, parse_secs},
};

use super::Pool;

const DEFAULT_MAX_SIZE: usize = 10;
const DEFAULT_ACQUIRE_TIMEOUT: Duration = Duration::from_secs(15);
const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(5 * 60);

/// Pool configuration builder.
#[derive(Clone, Debug)]
pub struct PoolConfig {
    pub(crate) conn: Config,
    pub(crate) max_size: usize,
    pub(crate) acquire_timeout: Duration,
    pub(crate) idle_timeout: Duration,
}

impl PoolConfig {
    pub fn new(conn: Config) -> PoolConfig {
        Self {
            conn,
            max_size: DEFAULT_MAX_SIZE,
            acquire_timeout: DEFAULT_ACQUIRE_TIMEOUT,
            idle_timeout: DEFAULT_IDLE_TIMEOUT,
        }
    }

    pub fn from_env() -> PoolConfig {
        Self::new(Config::from_env())
    }

    /// Parse connection string, pool keys are `Max Pool Size`, `Acquire Timeout` and
    /// `Idle Timeout`, everything else goes to [`Config::parse`].
    pub fn parse(input: &str) -> Result<PoolConfig, ConfigError> {
        let mut me = Self::new(Config::default());
        for (key, value) in parse_pairs(input)? {
            if me.apply(&key, &value)? || me.conn.apply(&key, &value)? {
                continue;
            }
            return Err(ConfigError::new(format!("unknown key `{key}`")));
        }
        me.validate()?;
        Ok(me)
    }

    fn apply(&mut self, key: &str, value: &str) -> Result<bool, ConfigError> {
        match key {
            "maxpoolsize" | "maxsize" | "poolsize" => {
                self.max_size = value.parse().map_err(|_| ConfigError::new("invalid pool size"))?;
            }
            "acquiretimeout" | "pooltimeout" => self.acquire_timeout = parse_secs(value)?,
            "idletimeout" | "connectionidlelifetime" => self.idle_timeout = parse_secs(value)?,
            _ => return Ok(false),
        }
        Ok(true)
    }

    pub(crate) fn validate(&self) -> Result<(), ConfigError> {
        if self.max_size == 0 {
            return Err(ConfigError::new("pool size must be at least 1"));
        }
        self.conn.validate()
    }

    /// Get connection config.
    pub fn connection(&self) -> &Config {
        &self.conn
    }

    /// Set max connection value.
    pub fn max_size(mut self, value: usize) -> Self {
        self.max_size = value;
        self
    }

    /// How long [`Pool::acquire`] waits for a free slot.
    pub fn acquire_timeout(mut self, value: Duration) -> Self {
        self.acquire_timeout = value;
        self
    }

    /// Idle connections older than this are closed instead of handed out.
    pub fn idle_timeout(mut self, value: Duration) -> Self {
        self.idle_timeout = value;
        self
    }
}

impl PoolConfig {
    /// Create the pool and check out one connection to verify the config.
    pub async fn connect(self) -> Result<Pool> {
        let pool = Pool::new(self)?;
        drop(pool.acquire().await?);
        Ok(pool)
    }

    /// Create the pool without connecting.
    pub fn connect_lazy(self) -> Result<Pool> {
        Pool::new(self)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn parse_pool_keys() {
        let config = PoolConfig::parse(
            "Host=db;Username=app;Max Pool Size=3;Acquire Timeout=2;Idle Timeout=60;Timeout=4",
        )
        .unwrap();
        assert_eq!(config.max_size, 3);
        assert_eq!(config.acquire_timeout, Duration::from_secs(2));
        assert_eq!(config.idle_timeout, Duration::from_secs(60));
        assert_eq!(config.conn.connect_timeout, Duration::from_secs(4));
        assert_eq!(config.conn.host, "db");
    }

    #[test]
    fn zero_pool_size() {
        assert!(PoolConfig::parse("user=app;maxpoolsize=0").is_err());
        assert!(PoolConfig::parse("user=app;bogus=1").is_err());
    }
}
