//! Configuration management for tierlimit.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use tracing::info;

use crate::error::{Result, TierlimitError};

/// Prefix for environment variable overrides, e.g. `TIERLIMIT__STORE__URL`.
const ENV_PREFIX: &str = "TIERLIMIT";

/// Main configuration for the tierlimit service.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TierlimitConfig {
    /// Shared counter store configuration
    #[serde(default)]
    pub store: StoreConfig,

    /// Rate limiting configuration
    #[serde(default)]
    pub rate_limiting: RateLimitingConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Which counter store implementation backs the coordinator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    /// Shared Redis instance, authoritative across processes
    #[default]
    Redis,
    /// Process-local store, authoritative for a single instance only
    Memory,
}

/// Shared counter store configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Store implementation
    #[serde(default)]
    pub backend: StoreBackend,

    /// Connection URL of the store
    #[serde(default = "default_store_url")]
    pub url: String,

    /// Number of multiplexed connections shared by all callers
    #[serde(default = "default_pool_size")]
    pub pool_size: usize,

    /// Upper bound on a single store round trip, in milliseconds
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,

    /// Prefix prepended to every counter key
    #[serde(default = "default_key_prefix")]
    pub key_prefix: String,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: StoreBackend::default(),
            url: default_store_url(),
            pool_size: default_pool_size(),
            timeout_ms: default_timeout_ms(),
            key_prefix: default_key_prefix(),
        }
    }
}

impl StoreConfig {
    /// Per-call timeout as a `Duration`.
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

fn default_store_url() -> String {
    "redis://127.0.0.1:6379/".to_string()
}

fn default_pool_size() -> usize {
    10
}

fn default_timeout_ms() -> u64 {
    3000
}

fn default_key_prefix() -> String {
    "rate_limit".to_string()
}

/// Rate limiting configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitingConfig {
    /// Fixed window length in seconds
    #[serde(default = "default_window_secs")]
    pub window_secs: u64,

    /// How often the sweeper evicts expired local entries, in seconds
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_secs: u64,

    /// Limit applied when a caller does not supply one
    #[serde(default = "default_limit")]
    pub default_limit: u64,
}

impl Default for RateLimitingConfig {
    fn default() -> Self {
        Self {
            window_secs: default_window_secs(),
            sweep_interval_secs: default_sweep_interval(),
            default_limit: default_limit(),
        }
    }
}

impl RateLimitingConfig {
    /// Window length as a `Duration`.
    pub fn window(&self) -> Duration {
        Duration::from_secs(self.window_secs)
    }

    /// Sweep interval as a `Duration`.
    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }
}

fn default_window_secs() -> u64 {
    60
}

fn default_sweep_interval() -> u64 {
    30
}

fn default_limit() -> u64 {
    100
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Default filter directive, overridden by `RUST_LOG`
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Emit JSON lines instead of human-readable output
    #[serde(default)]
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

impl TierlimitConfig {
    /// Load configuration from defaults, an optional YAML file and
    /// `TIERLIMIT__*` environment variables, in increasing precedence.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = config::Config::builder();

        if let Some(path) = path {
            info!(path = %path.display(), "Loading configuration file");
            builder = builder.add_source(
                config::File::from(path)
                    .format(config::FileFormat::Yaml)
                    .required(true),
            );
        }

        let config: TierlimitConfig = builder
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .and_then(|c| c.try_deserialize())
            .map_err(|e| TierlimitError::Config(e.to_string()))?;

        config.validate()?;
        Ok(config)
    }

    /// Parse configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let config: TierlimitConfig = serde_yaml::from_str(yaml)
            .map_err(|e| TierlimitError::Config(format!("Failed to parse configuration: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Reject values the limiter cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.store.pool_size == 0 {
            return Err(TierlimitError::Config("store.pool_size must be > 0".into()));
        }
        if self.store.timeout_ms == 0 {
            return Err(TierlimitError::Config("store.timeout_ms must be > 0".into()));
        }
        if self.store.key_prefix.is_empty() {
            return Err(TierlimitError::Config("store.key_prefix must not be empty".into()));
        }
        if self.rate_limiting.window_secs == 0 {
            return Err(TierlimitError::Config(
                "rate_limiting.window_secs must be > 0".into(),
            ));
        }
        if self.rate_limiting.sweep_interval_secs == 0 {
            return Err(TierlimitError::Config(
                "rate_limiting.sweep_interval_secs must be > 0".into(),
            ));
        }
        if self.rate_limiting.default_limit == 0 {
            return Err(TierlimitError::Config(
                "rate_limiting.default_limit must be > 0".into(),
            ));
        }
        Ok(())
    }
}
