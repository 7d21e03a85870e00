//! Pooling configuration

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::{PoolingError, ResourceKind, Result};

/// Prefix shared by every environment variable the pooling layer reads
pub const ENV_PREFIX: &str = "SERVICE_POOL_";

/// Tunables for the pooling layer
///
/// Controls the broker's acquire loop, pool sizing, the pool-internal
/// reconnect/retry policy, connection lifetime and maintenance cadence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolingConfig {
    /// Candidates the broker tries before giving up on an acquisition
    acquire_attempts: u32,
    /// Pause in milliseconds between broker attempts (0 = none)
    acquire_backoff_ms: u64,
    /// Maximum connections per service pool
    pool_size: usize,
    /// Factory retries when the pool fails to create a connection
    reconnect_attempts: u32,
    /// Pause in milliseconds between factory retries
    reconnect_sleep_ms: u64,
    /// Retries when the pool is at capacity with nothing idle
    retry_attempts: u32,
    /// Pause in milliseconds between exhaustion retries
    retry_sleep_ms: u64,
    /// Age in seconds at which a connection is destroyed instead of reused
    connection_lifetime_secs: u64,
    /// Minimum seconds between two scheduled cleanups
    cleanup_interval_secs: u64,
    /// Run a live query against database connections on every check
    check_db_connection: bool,
    /// PING redis connections on every check
    check_redis_connection: bool,
    /// Chance that a return-all also sweeps the pools
    maintenance_probability: f64,
}

impl PoolingConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load configuration from the process environment
    pub fn from_env() -> Result<Self> {
        Self::from_vars(std::env::vars())
    }

    /// Load configuration from `SERVICE_POOL_*` key/value pairs
    ///
    /// Keys without the prefix and unknown keys are ignored. Sleep and
    /// lifetime values are in seconds.
    pub fn from_vars<I, K, V>(vars: I) -> Result<Self>
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: AsRef<str>,
    {
        let mut config = Self::default();

        for (key, value) in vars {
            let Some(name) = key.as_ref().strip_prefix(ENV_PREFIX) else {
                continue;
            };
            let value = value.as_ref().trim();

            match name {
                "GET_RETRY_ATTEMPTS" => config.acquire_attempts = parse_number(name, value)?,
                "GET_RETRY_BACKOFF_MS" => config.acquire_backoff_ms = parse_number(name, value)?,
                "DEFAULT_SIZE" => config.pool_size = parse_number(name, value)?,
                "RECONNECT_ATTEMPTS" => config.reconnect_attempts = parse_number(name, value)?,
                "RECONNECT_SLEEP" => {
                    config.reconnect_sleep_ms = parse_number::<u64>(name, value)?.saturating_mul(1000)
                }
                "RETRY_ATTEMPTS" => config.retry_attempts = parse_number(name, value)?,
                "RETRY_SLEEP" => config.retry_sleep_ms = parse_number::<u64>(name, value)?.saturating_mul(1000),
                "CONNECTION_LIFETIME" => {
                    config.connection_lifetime_secs = parse_number(name, value)?
                }
                "CLEANUP_INTERVAL" => config.cleanup_interval_secs = parse_number(name, value)?,
                "CHECK_DB_CONNECTION" => config.check_db_connection = parse_flag(value),
                "CHECK_REDIS_CONNECTION" => config.check_redis_connection = parse_flag(value),
                "MAINTENANCE_PROBABILITY" => {
                    config.maintenance_probability = parse_number(name, value)?
                }
                other => tracing::trace!(key = other, "ignoring unknown pooling variable"),
            }
        }

        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a TOML document using the field names of this struct
    pub fn from_toml_str(source: &str) -> Result<Self> {
        let config: Self = toml::from_str(source)
            .map_err(|e| PoolingError::Configuration(format!("Invalid TOML: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Reject values the pooling layer cannot work with
    pub fn validate(&self) -> Result<()> {
        if self.acquire_attempts == 0 {
            return Err(PoolingError::Configuration(
                "acquire_attempts must be at least 1".into(),
            ));
        }
        if self.pool_size == 0 {
            return Err(PoolingError::Configuration(
                "pool_size must be greater than 0".into(),
            ));
        }
        if !(0.0..=1.0).contains(&self.maintenance_probability) {
            return Err(PoolingError::Configuration(format!(
                "maintenance_probability must be within 0.0..=1.0, got {}",
                self.maintenance_probability
            )));
        }
        Ok(())
    }

    /// Set the number of broker acquire attempts (at least 1)
    pub fn with_acquire_attempts(mut self, attempts: u32) -> Self {
        self.acquire_attempts = attempts.max(1);
        self
    }

    /// Set the pause between broker acquire attempts in milliseconds
    pub fn with_acquire_backoff_ms(mut self, backoff_ms: u64) -> Self {
        self.acquire_backoff_ms = backoff_ms;
        self
    }

    /// Set the per-service pool capacity (at least 1)
    pub fn with_pool_size(mut self, size: usize) -> Self {
        self.pool_size = size.max(1);
        self
    }

    /// Set the pool's factory retry policy
    pub fn with_reconnect(mut self, attempts: u32, sleep_ms: u64) -> Self {
        self.reconnect_attempts = attempts;
        self.reconnect_sleep_ms = sleep_ms;
        self
    }

    /// Set the pool's exhaustion retry policy
    pub fn with_retry(mut self, attempts: u32, sleep_ms: u64) -> Self {
        self.retry_attempts = attempts;
        self.retry_sleep_ms = sleep_ms;
        self
    }

    /// Set the connection lifetime in seconds
    pub fn with_connection_lifetime_secs(mut self, secs: u64) -> Self {
        self.connection_lifetime_secs = secs;
        self
    }

    /// Set the minimum interval between scheduled cleanups in seconds
    pub fn with_cleanup_interval_secs(mut self, secs: u64) -> Self {
        self.cleanup_interval_secs = secs;
        self
    }

    /// Enable or disable the live database probe
    pub fn with_check_db_connection(mut self, enabled: bool) -> Self {
        self.check_db_connection = enabled;
        self
    }

    /// Enable or disable the live redis probe
    pub fn with_check_redis_connection(mut self, enabled: bool) -> Self {
        self.check_redis_connection = enabled;
        self
    }

    /// Set the chance that a return-all triggers a pool sweep (clamped to 0..=1)
    pub fn with_maintenance_probability(mut self, probability: f64) -> Self {
        self.maintenance_probability = probability.clamp(0.0, 1.0);
        self
    }

    pub fn acquire_attempts(&self) -> u32 {
        self.acquire_attempts
    }

    pub fn acquire_backoff(&self) -> Duration {
        Duration::from_millis(self.acquire_backoff_ms)
    }

    pub fn pool_size(&self) -> usize {
        self.pool_size
    }

    pub fn reconnect_attempts(&self) -> u32 {
        self.reconnect_attempts
    }

    pub fn reconnect_sleep(&self) -> Duration {
        Duration::from_millis(self.reconnect_sleep_ms)
    }

    pub fn retry_attempts(&self) -> u32 {
        self.retry_attempts
    }

    pub fn retry_sleep(&self) -> Duration {
        Duration::from_millis(self.retry_sleep_ms)
    }

    pub fn connection_lifetime(&self) -> Duration {
        Duration::from_secs(self.connection_lifetime_secs)
    }

    pub fn cleanup_interval(&self) -> Duration {
        Duration::from_secs(self.cleanup_interval_secs)
    }

    pub fn check_db_connection(&self) -> bool {
        self.check_db_connection
    }

    pub fn check_redis_connection(&self) -> bool {
        self.check_redis_connection
    }

    /// Whether resources of `kind` get a live probe on every check
    pub fn probes(&self, kind: ResourceKind) -> bool {
        match kind {
            ResourceKind::Database => self.check_db_connection,
            ResourceKind::Redis => self.check_redis_connection,
            ResourceKind::Other => false,
        }
    }

    pub fn maintenance_probability(&self) -> f64 {
        self.maintenance_probability
    }
}

impl Default for PoolingConfig {
    /// Defaults:
    /// - acquire_attempts: 5, no backoff
    /// - pool_size: 500
    /// - reconnect: 3 attempts, 1 second apart
    /// - retry: 3 attempts, 1 second apart
    /// - connection_lifetime: 60 seconds
    /// - cleanup_interval: 60 seconds
    /// - live probes: off
    /// - maintenance_probability: 1%
    fn default() -> Self {
        Self {
            acquire_attempts: 5,
            acquire_backoff_ms: 0,
            pool_size: 500,
            reconnect_attempts: 3,
            reconnect_sleep_ms: 1_000,
            retry_attempts: 3,
            retry_sleep_ms: 1_000,
            connection_lifetime_secs: 60,
            cleanup_interval_secs: 60,
            check_db_connection: false,
            check_redis_connection: false,
            maintenance_probability: 0.01,
        }
    }
}

fn parse_number<T: std::str::FromStr>(name: &str, value: &str) -> Result<T> {
    value.parse().map_err(|_| {
        PoolingError::Configuration(format!("{}{} has invalid value {:?}", ENV_PREFIX, name, value))
    })
}

fn parse_flag(value: &str) -> bool {
    matches!(value, "true" | "1")
}
