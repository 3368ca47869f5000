//! Pool configuration.

use std::time::Duration;

use pgloop_driver::ConnInfo;

use crate::error::PoolError;

/// Largest pool the configuration accepts.
pub const MAX_POOL_SIZE: usize = 1024;

/// Environment variable holding the pool size.
pub const ENV_POOL_SIZE: &str = "DB_POOL_SIZE";

/// Environment variable holding the acquire timeout in milliseconds.
pub const ENV_ACQUIRE_TIMEOUT_MS: &str = "DB_ACQUIRE_TIMEOUT_MS";

/// Environment variable holding the idle timeout in milliseconds.
pub const ENV_IDLE_TIMEOUT_MS: &str = "DB_IDLE_TIMEOUT_MS";

/// How long an asynchronous request may wait for a free connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AcquireTimeout {
    /// Fail immediately when every connection is in use.
    NoWait,
    /// Wait in the queue for at most this long.
    After(Duration),
    /// Wait in the queue until a connection is returned or the pool closes.
    Infinite,
}

impl AcquireTimeout {
    /// Convert from the integer-milliseconds convention: `0` means no
    /// waiting, a positive value is a timeout and a negative value waits
    /// forever.
    #[must_use]
    pub fn from_millis(ms: i64) -> Self {
        match ms {
            0 => Self::NoWait,
            ms if ms > 0 => Self::After(Duration::from_millis(ms.unsigned_abs())),
            _ => Self::Infinite,
        }
    }

    /// Whether requesters may join the wait queue at all.
    #[must_use]
    pub fn allows_waiting(&self) -> bool {
        !matches!(self, Self::NoWait)
    }
}

impl Default for AcquireTimeout {
    fn default() -> Self {
        Self::After(Duration::from_secs(30))
    }
}

/// Configuration for a connection pool.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Where to connect.
    pub connection: ConnInfo,

    /// Number of connections, fixed for the life of the pool.
    pub size: usize,

    /// How long asynchronous requests wait for a connection.
    pub acquire_timeout: AcquireTimeout,

    /// Idle threshold for the background reaper. `None` disables it.
    pub idle_timeout: Option<Duration>,

    /// Poll interval used when a connection exposes no socket.
    pub poll_interval: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            connection: ConnInfo::default(),
            size: 10,
            acquire_timeout: AcquireTimeout::default(),
            idle_timeout: None,
            poll_interval: Duration::from_millis(10),
        }
    }
}

impl PoolConfig {
    /// Create a new configuration with default values.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Load the connection from `DB_HOST`, `DB_PORT`, `DB_NAME`, `DB_USER`
    /// and `DB_PASSWORD`, plus `DB_POOL_SIZE`, `DB_ACQUIRE_TIMEOUT_MS` and
    /// `DB_IDLE_TIMEOUT_MS` for the pool itself.
    pub fn from_env() -> Result<Self, PoolError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Like [`PoolConfig::from_env`] but reads through `lookup`.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, PoolError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self {
            connection: ConnInfo::from_lookup(&lookup)?,
            ..Self::default()
        };

        if let Some(size) = lookup(ENV_POOL_SIZE) {
            config.size = size.trim().parse().map_err(|_| {
                PoolError::InvalidConfig(format!("invalid {ENV_POOL_SIZE}: {size}"))
            })?;
        }
        if let Some(ms) = lookup(ENV_ACQUIRE_TIMEOUT_MS) {
            let ms: i64 = ms.trim().parse().map_err(|_| {
                PoolError::InvalidConfig(format!("invalid {ENV_ACQUIRE_TIMEOUT_MS}: {ms}"))
            })?;
            config.acquire_timeout = AcquireTimeout::from_millis(ms);
        }
        if let Some(ms) = lookup(ENV_IDLE_TIMEOUT_MS) {
            let ms: u64 = ms.trim().parse().map_err(|_| {
                PoolError::InvalidConfig(format!("invalid {ENV_IDLE_TIMEOUT_MS}: {ms}"))
            })?;
            config.idle_timeout = (ms > 0).then(|| Duration::from_millis(ms));
        }

        Ok(config)
    }

    /// Set the connection parameters.
    #[must_use]
    pub fn connection(mut self, connection: ConnInfo) -> Self {
        self.connection = connection;
        self
    }

    /// Set the number of connections.
    #[must_use]
    pub fn size(mut self, size: usize) -> Self {
        self.size = size;
        self
    }

    /// Set the acquire timeout.
    #[must_use]
    pub fn acquire_timeout(mut self, timeout: AcquireTimeout) -> Self {
        self.acquire_timeout = timeout;
        self
    }

    /// Set the idle timeout used by the background reaper.
    #[must_use]
    pub fn idle_timeout(mut self, timeout: Duration) -> Self {
        self.idle_timeout = Some(timeout);
        self
    }

    /// Set the fallback poll interval.
    #[must_use]
    pub fn poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), PoolError> {
        if self.size == 0 || self.size > MAX_POOL_SIZE {
            return Err(PoolError::InvalidConfig(format!(
                "pool size must be between 1 and {MAX_POOL_SIZE}, got {}",
                self.size
            )));
        }
        if self.poll_interval.is_zero() {
            return Err(PoolError::InvalidConfig(
                "poll_interval must be non-zero".into(),
            ));
        }
        if matches!(self.acquire_timeout, AcquireTimeout::After(d) if d.is_zero()) {
            return Err(PoolError::InvalidConfig(
                "acquire timeout must be non-zero; use NoWait instead".into(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_acquire_timeout_from_millis() {
        assert_eq!(AcquireTimeout::from_millis(0), AcquireTimeout::NoWait);
        assert_eq!(
            AcquireTimeout::from_millis(250),
            AcquireTimeout::After(Duration::from_millis(250))
        );
        assert_eq!(AcquireTimeout::from_millis(-1), AcquireTimeout::Infinite);
        assert!(!AcquireTimeout::NoWait.allows_waiting());
        assert!(AcquireTimeout::Infinite.allows_waiting());
    }

    #[test]
    fn test_validate_size_bounds() {
        assert!(PoolConfig::new().size(0).validate().is_err());
        assert!(PoolConfig::new().size(1).validate().is_ok());
        assert!(PoolConfig::new().size(MAX_POOL_SIZE).validate().is_ok());
        assert!(PoolConfig::new().size(MAX_POOL_SIZE + 1).validate().is_err());
    }

    #[test]
    fn test_validate_rejects_zero_durations() {
        assert!(
            PoolConfig::new()
                .poll_interval(Duration::ZERO)
                .validate()
                .is_err()
        );
        assert!(
            PoolConfig::new()
                .acquire_timeout(AcquireTimeout::After(Duration::ZERO))
                .validate()
                .is_err()
        );
    }

    #[test]
    fn test_from_lookup() {
        let vars: HashMap<&str, &str> = [
            ("DB_HOST", "pg.local"),
            ("DB_POOL_SIZE", "4"),
            ("DB_ACQUIRE_TIMEOUT_MS", "0"),
            ("DB_IDLE_TIMEOUT_MS", "60000"),
        ]
        .into_iter()
        .collect();

        let config = PoolConfig::from_lookup(|k| vars.get(k).map(|v| (*v).to_string())).unwrap();
        assert_eq!(config.connection.host, "pg.local");
        assert_eq!(config.size, 4);
        assert_eq!(config.acquire_timeout, AcquireTimeout::NoWait);
        assert_eq!(config.idle_timeout, Some(Duration::from_secs(60)));
    }

    #[test]
    fn test_from_lookup_invalid_size() {
        let err = PoolConfig::from_lookup(|k| (k == "DB_POOL_SIZE").then(|| "many".to_string()))
            .unwrap_err();
        assert!(matches!(err, PoolError::InvalidConfig(_)));
    }
}
