//! Configuration types

use crate::constants::*;
use crate::error::{CacheError, CacheResult, ConfigError};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

// ============================================================================
// KEY DISTRIBUTION
// ============================================================================

/// How wire keys are mapped onto servers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum KeyDistribution {
    /// Ketama consistent hashing over weighted virtual nodes
    #[default]
    Ketama,
    /// `hash(key) % servers`, servers repeated by weight
    Modulo,
}

impl KeyDistribution {
    /// Convert to config string representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Ketama => "ketama",
            Self::Modulo => "modulo",
        }
    }
}

impl fmt::Display for KeyDistribution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for KeyDistribution {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "ketama" | "consistent" => Ok(Self::Ketama),
            "modulo" | "array" => Ok(Self::Modulo),
            _ => Err(ConfigError::InvalidValue {
                field: "key_distribution".to_string(),
                value: s.to_string(),
                reason: "expected ketama or modulo".to_string(),
            }),
        }
    }
}

// ============================================================================
// CACHE CONFIG
// ============================================================================

/// Pool and facade configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct CacheConfig {
    /// Name reported in logs and listener events.
    pub name: String,
    /// Maximum keys merged into one multi-get.
    pub merge_factor: usize,
    /// Whether concurrent single-key gets are merged.
    pub optimize_get: bool,
    /// Extra time a batch waits for more gets before dispatching.
    pub merge_window: Duration,
    /// Upper bound for establishing a connection.
    pub connect_timeout: Duration,
    /// Default upper bound for one operation.
    pub op_timeout: Duration,
    /// Interval between reconnect passes.
    pub heal_interval: Duration,
    /// Whether evicted endpoints are reconnected in the background.
    pub enable_heal_session: bool,
    /// Keep unavailable endpoints on the continuum and route to standbys.
    pub failure_mode: bool,
    /// Consecutive timeout/IO failures before eviction.
    pub failure_threshold: u32,
    /// Connections per endpoint.
    pub pool_size: usize,
    /// URL-encode logical keys before transmission.
    pub sanitize_keys: bool,
    /// Key to server mapping.
    pub key_distribution: KeyDistribution,
    /// Reject unbalanced `end_namespace` calls instead of ignoring them.
    pub strict_namespaces: bool,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            name: "kaisen".to_string(),
            merge_factor: DEFAULT_MERGE_FACTOR,
            optimize_get: true,
            merge_window: Duration::ZERO,
            connect_timeout: Duration::from_millis(DEFAULT_CONNECT_TIMEOUT_MS),
            op_timeout: Duration::from_millis(DEFAULT_OP_TIMEOUT_MS),
            heal_interval: Duration::from_millis(DEFAULT_HEAL_INTERVAL_MS),
            enable_heal_session: true,
            failure_mode: false,
            failure_threshold: DEFAULT_FAILURE_THRESHOLD,
            pool_size: DEFAULT_POOL_SIZE,
            sanitize_keys: false,
            key_distribution: KeyDistribution::Ketama,
            strict_namespaces: false,
        }
    }
}

impl CacheConfig {
    /// Create a new cache config with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the client name.
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Set the merge factor.
    pub fn with_merge_factor(mut self, merge_factor: usize) -> Self {
        self.merge_factor = merge_factor;
        self
    }

    /// Enable or disable get merging.
    pub fn with_optimize_get(mut self, enabled: bool) -> Self {
        self.optimize_get = enabled;
        self
    }

    /// Set the merge window.
    pub fn with_merge_window(mut self, window: Duration) -> Self {
        self.merge_window = window;
        self
    }

    /// Set the connect timeout.
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Set the default operation timeout.
    pub fn with_op_timeout(mut self, timeout: Duration) -> Self {
        self.op_timeout = timeout;
        self
    }

    /// Set the reconnect interval.
    pub fn with_heal_interval(mut self, interval: Duration) -> Self {
        self.heal_interval = interval;
        self
    }

    /// Enable or disable background reconnects.
    pub fn with_heal_session(mut self, enabled: bool) -> Self {
        self.enable_heal_session = enabled;
        self
    }

    /// Enable or disable failure mode.
    pub fn with_failure_mode(mut self, enabled: bool) -> Self {
        self.failure_mode = enabled;
        self
    }

    /// Set the eviction threshold.
    pub fn with_failure_threshold(mut self, threshold: u32) -> Self {
        self.failure_threshold = threshold;
        self
    }

    /// Set the connections per endpoint.
    pub fn with_pool_size(mut self, pool_size: usize) -> Self {
        self.pool_size = pool_size;
        self
    }

    /// Enable or disable key sanitizing.
    pub fn with_sanitize_keys(mut self, enabled: bool) -> Self {
        self.sanitize_keys = enabled;
        self
    }

    /// Set the key distribution.
    pub fn with_key_distribution(mut self, distribution: KeyDistribution) -> Self {
        self.key_distribution = distribution;
        self
    }

    /// Enable or disable strict namespace balancing.
    pub fn with_strict_namespaces(mut self, enabled: bool) -> Self {
        self.strict_namespaces = enabled;
        self
    }

    /// Validate the configuration.
    ///
    /// Validates:
    /// - merge_factor > 0
    /// - pool_size > 0
    /// - failure_threshold > 0
    /// - connect, operation and heal durations are positive
    pub fn validate(&self) -> CacheResult<()> {
        if self.merge_factor == 0 {
            return Err(invalid("merge_factor", self.merge_factor, "must be greater than 0"));
        }

        if self.pool_size == 0 {
            return Err(invalid("pool_size", self.pool_size, "must be greater than 0"));
        }

        if self.failure_threshold == 0 {
            return Err(invalid(
                "failure_threshold",
                self.failure_threshold,
                "must be greater than 0",
            ));
        }

        if self.connect_timeout.is_zero() {
            return Err(invalid(
                "connect_timeout",
                format!("{:?}", self.connect_timeout),
                "must be positive",
            ));
        }

        if self.op_timeout.is_zero() {
            return Err(invalid(
                "op_timeout",
                format!("{:?}", self.op_timeout),
                "must be positive",
            ));
        }

        if self.heal_interval.is_zero() {
            return Err(invalid(
                "heal_interval",
                format!("{:?}", self.heal_interval),
                "must be positive",
            ));
        }

        Ok(())
    }

    /// Create from environment variables with fallback to defaults.
    ///
    /// Environment variables:
    /// - `KAISEN_CACHE_NAME`
    /// - `KAISEN_CACHE_MERGE_FACTOR` (default: 150)
    /// - `KAISEN_CACHE_OPTIMIZE_GET` (default: true)
    /// - `KAISEN_CACHE_MERGE_WINDOW_MS` (default: 0)
    /// - `KAISEN_CACHE_CONNECT_TIMEOUT_MS` (default: 60000)
    /// - `KAISEN_CACHE_OP_TIMEOUT_MS` (default: 1000)
    /// - `KAISEN_CACHE_HEAL_INTERVAL_MS` (default: 2000)
    /// - `KAISEN_CACHE_ENABLE_HEAL_SESSION` (default: true)
    /// - `KAISEN_CACHE_FAILURE_MODE` (default: false)
    /// - `KAISEN_CACHE_FAILURE_THRESHOLD` (default: 1000)
    /// - `KAISEN_CACHE_POOL_SIZE` (default: 1)
    /// - `KAISEN_CACHE_SANITIZE_KEYS` (default: false)
    /// - `KAISEN_CACHE_KEY_DISTRIBUTION` (default: ketama)
    /// - `KAISEN_CACHE_STRICT_NAMESPACES` (default: false)
    pub fn from_env() -> Self {
        let defaults = Self::default();

        Self {
            name: std::env::var("KAISEN_CACHE_NAME").unwrap_or(defaults.name),
            merge_factor: env_parse("KAISEN_CACHE_MERGE_FACTOR").unwrap_or(defaults.merge_factor),
            optimize_get: env_parse("KAISEN_CACHE_OPTIMIZE_GET").unwrap_or(defaults.optimize_get),
            merge_window: env_parse("KAISEN_CACHE_MERGE_WINDOW_MS")
                .map(Duration::from_millis)
                .unwrap_or(defaults.merge_window),
            connect_timeout: env_parse("KAISEN_CACHE_CONNECT_TIMEOUT_MS")
                .map(Duration::from_millis)
                .unwrap_or(defaults.connect_timeout),
            op_timeout: env_parse("KAISEN_CACHE_OP_TIMEOUT_MS")
                .map(Duration::from_millis)
                .unwrap_or(defaults.op_timeout),
            heal_interval: env_parse("KAISEN_CACHE_HEAL_INTERVAL_MS")
                .map(Duration::from_millis)
                .unwrap_or(defaults.heal_interval),
            enable_heal_session: env_parse("KAISEN_CACHE_ENABLE_HEAL_SESSION")
                .unwrap_or(defaults.enable_heal_session),
            failure_mode: env_parse("KAISEN_CACHE_FAILURE_MODE").unwrap_or(defaults.failure_mode),
            failure_threshold: env_parse("KAISEN_CACHE_FAILURE_THRESHOLD")
                .unwrap_or(defaults.failure_threshold),
            pool_size: env_parse("KAISEN_CACHE_POOL_SIZE").unwrap_or(defaults.pool_size),
            sanitize_keys: env_parse("KAISEN_CACHE_SANITIZE_KEYS").unwrap_or(defaults.sanitize_keys),
            key_distribution: env_parse("KAISEN_CACHE_KEY_DISTRIBUTION")
                .unwrap_or(defaults.key_distribution),
            strict_namespaces: env_parse("KAISEN_CACHE_STRICT_NAMESPACES")
                .unwrap_or(defaults.strict_namespaces),
        }
    }

    /// Parse a TOML document. Missing fields keep their defaults.
    pub fn from_toml_str(contents: &str) -> CacheResult<Self> {
        let file: CacheConfigFile = toml::from_str(contents).map_err(|e| ConfigError::Parse {
            reason: e.to_string(),
        })?;
        let config = file.into_config();
        config.validate()?;
        Ok(config)
    }

    /// Load and validate a TOML config file.
    pub fn from_path(path: impl AsRef<Path>) -> CacheResult<Self> {
        let contents = std::fs::read_to_string(path.as_ref()).map_err(|e| ConfigError::Io {
            reason: e.to_string(),
        })?;
        Self::from_toml_str(&contents)
    }
}

/// On-disk shape of [`CacheConfig`]. Durations are in milliseconds.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct CacheConfigFile {
    pub name: Option<String>,
    pub merge_factor: Option<usize>,
    pub optimize_get: Option<bool>,
    pub merge_window_ms: Option<u64>,
    pub connect_timeout_ms: Option<u64>,
    pub op_timeout_ms: Option<u64>,
    pub heal_interval_ms: Option<u64>,
    pub enable_heal_session: Option<bool>,
    pub failure_mode: Option<bool>,
    pub failure_threshold: Option<u32>,
    pub pool_size: Option<usize>,
    pub sanitize_keys: Option<bool>,
    pub key_distribution: Option<KeyDistribution>,
    pub strict_namespaces: Option<bool>,
}

impl CacheConfigFile {
    /// Overlay the file's values on the defaults.
    pub fn into_config(self) -> CacheConfig {
        let defaults = CacheConfig::default();
        CacheConfig {
            name: self.name.unwrap_or(defaults.name),
            merge_factor: self.merge_factor.unwrap_or(defaults.merge_factor),
            optimize_get: self.optimize_get.unwrap_or(defaults.optimize_get),
            merge_window: self
                .merge_window_ms
                .map(Duration::from_millis)
                .unwrap_or(defaults.merge_window),
            connect_timeout: self
                .connect_timeout_ms
                .map(Duration::from_millis)
                .unwrap_or(defaults.connect_timeout),
            op_timeout: self
                .op_timeout_ms
                .map(Duration::from_millis)
                .unwrap_or(defaults.op_timeout),
            heal_interval: self
                .heal_interval_ms
                .map(Duration::from_millis)
                .unwrap_or(defaults.heal_interval),
            enable_heal_session: self
                .enable_heal_session
                .unwrap_or(defaults.enable_heal_session),
            failure_mode: self.failure_mode.unwrap_or(defaults.failure_mode),
            failure_threshold: self.failure_threshold.unwrap_or(defaults.failure_threshold),
            pool_size: self.pool_size.unwrap_or(defaults.pool_size),
            sanitize_keys: self.sanitize_keys.unwrap_or(defaults.sanitize_keys),
            key_distribution: self.key_distribution.unwrap_or(defaults.key_distribution),
            strict_namespaces: self.strict_namespaces.unwrap_or(defaults.strict_namespaces),
        }
    }
}

fn env_parse<T: FromStr>(name: &str) -> Option<T> {
    std::env::var(name).ok().and_then(|s| s.trim().parse().ok())
}

fn invalid(field: &str, value: impl ToString, reason: &str) -> CacheError {
    CacheError::Config(ConfigError::InvalidValue {
        field: field.to_string(),
        value: value.to_string(),
        reason: reason.to_string(),
    })
}

// =============================================================================
// TESTS
// =============================================================================
