//! Configuration management for the access limiter.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use tracing::info;

use crate::error::{LimiterError, Result};

/// Prefix for environment overrides, e.g. `ACCESS_LIMITER__COUNTER__OPTIONS_TTL_SECS`.
pub const ENV_PREFIX: &str = "ACCESS_LIMITER";

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AccessLimiterConfig {
    /// Storage backend selection
    #[serde(default)]
    pub storage: StorageConfig,

    /// Rate counter behaviour
    #[serde(default)]
    pub counter: CounterConfig,
}

/// Storage backend selection.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(tag = "backend", rename_all = "snake_case")]
pub enum StorageConfig {
    /// Process-local maps
    #[default]
    Memory,
    /// Shared Redis instance
    Redis(RedisStorageConfig),
}

/// Redis backend configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RedisStorageConfig {
    /// `host:port`, or a full `redis://` URL
    #[serde(default = "default_redis_address")]
    pub address: String,

    #[serde(default)]
    pub password: Option<String>,

    /// Logical database index
    #[serde(default)]
    pub db: i64,

    /// Idle connections kept by the reaper
    #[serde(default = "default_pool_size")]
    pub max_idle: usize,

    /// Upper bound on open connections
    #[serde(default = "default_pool_size")]
    pub max_active: usize,

    /// Connections idle longer than this are dropped
    #[serde(default = "default_idle_timeout")]
    pub idle_timeout_ms: u64,

    /// Namespace prepended to every key
    #[serde(default)]
    pub prefix: String,

    /// Use WATCH/MULTI/EXEC for bounded increases
    #[serde(default = "default_transaction")]
    pub transaction: bool,

    /// Retries after the first optimistic attempt
    #[serde(default = "default_consistent_retry")]
    pub consistent_retry: u32,

    /// Pause between optimistic attempts, 0 for none
    #[serde(default)]
    pub retry_backoff_ms: u64,
}

impl Default for RedisStorageConfig {
    fn default() -> Self {
        Self {
            address: default_redis_address(),
            password: None,
            db: 0,
            max_idle: default_pool_size(),
            max_active: default_pool_size(),
            idle_timeout_ms: default_idle_timeout(),
            prefix: String::new(),
            transaction: default_transaction(),
            consistent_retry: default_consistent_retry(),
            retry_backoff_ms: 0,
        }
    }
}

impl RedisStorageConfig {
    /// Create a configuration for `address` with defaults everywhere else.
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            ..Self::default()
        }
    }

    pub fn idle_timeout(&self) -> Duration {
        match self.idle_timeout_ms {
            0 => Duration::from_millis(default_idle_timeout()),
            ms => Duration::from_millis(ms),
        }
    }

    pub fn retry_backoff(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_ms)
    }

    pub fn max_idle(&self) -> usize {
        self.max_idle.max(1)
    }

    pub fn max_active(&self) -> usize {
        self.max_active.max(1)
    }

    /// The connection URL handed to the pool.
    ///
    /// The password is inserted verbatim and must be URL-safe.
    pub fn connection_url(&self) -> String {
        if self.address.starts_with("redis://") || self.address.starts_with("rediss://") {
            return self.address.clone();
        }
        match self.password.as_deref() {
            Some(password) if !password.is_empty() => {
                format!("redis://:{}@{}/{}", password, self.address, self.db)
            }
            _ => format!("redis://{}/{}", self.address, self.db),
        }
    }
}

fn default_redis_address() -> String {
    "127.0.0.1:6379".to_string()
}

fn default_pool_size() -> usize {
    1
}

fn default_idle_timeout() -> u64 {
    1000
}

fn default_transaction() -> bool {
    true
}

fn default_consistent_retry() -> u32 {
    3
}

/// Rate counter configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CounterConfig {
    /// Soft TTL of cached options in seconds
    #[serde(default = "default_options_ttl")]
    pub options_ttl_secs: u64,

    /// Period of the rate aggregation task in milliseconds
    #[serde(default = "default_sync_interval")]
    pub sync_interval_ms: u64,

    /// Spawn the rate aggregation task at construction
    #[serde(default = "default_background_sync")]
    pub background_sync: bool,
}

impl Default for CounterConfig {
    fn default() -> Self {
        Self {
            options_ttl_secs: default_options_ttl(),
            sync_interval_ms: default_sync_interval(),
            background_sync: default_background_sync(),
        }
    }
}

impl CounterConfig {
    pub fn options_ttl(&self) -> Duration {
        Duration::from_secs(self.options_ttl_secs)
    }

    pub fn sync_interval(&self) -> Duration {
        Duration::from_millis(self.sync_interval_ms.max(1))
    }
}

fn default_options_ttl() -> u64 {
    10
}

fn default_sync_interval() -> u64 {
    1000
}

fn default_background_sync() -> bool {
    true
}

impl AccessLimiterConfig {
    /// Load configuration from a YAML file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        info!(path = %path.display(), "Loading access limiter configuration");

        let contents = std::fs::read_to_string(path)?;
        Self::from_yaml(&contents)
    }

    /// Load configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        serde_yaml::from_str(yaml)
            .map_err(|e| LimiterError::Config(format!("Failed to parse config: {}", e)))
    }

    /// Load an optional file layered with `ACCESS_LIMITER__*` environment overrides.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            info!(path = %path.display(), "Loading access limiter configuration");
            builder = builder.add_source(config::File::from(path));
        }

        builder
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .and_then(|settings| settings.try_deserialize())
            .map_err(|e| LimiterError::Config(format!("Failed to load config: {}", e)))
    }
}
