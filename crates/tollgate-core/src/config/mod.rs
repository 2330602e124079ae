//! Configuration loading and validation.
//!
//! Supports JSON5 format. Config location: `~/.tollgate/tollgate.json`

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Environment variable overriding the Redis URL.
pub const ENV_REDIS_URL: &str = "TOLLGATE_REDIS_URL";
/// Environment variable overriding the failure mode.
pub const ENV_FAILURE_MODE: &str = "TOLLGATE_FAILURE_MODE";
/// Environment variable overriding the gateway port.
pub const ENV_GATEWAY_PORT: &str = "TOLLGATE_GATEWAY_PORT";

/// Configuration errors.
#[derive(Error, Debug)]
pub enum ConfigError {
    /// IO error reading config file.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON5 parsing error.
    #[error("Parse error: {0}")]
    Parse(#[from] json5::Error),

    /// Config validation error.
    #[error("Validation error: {0}")]
    Validation(String),

    /// Invalid environment override.
    #[error("Invalid value for {var}: {value}")]
    InvalidEnv {
        /// Variable name.
        var: &'static str,
        /// Offending value.
        value: String,
    },
}

/// Main configuration structure.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    /// Admin gateway configuration.
    #[serde(default)]
    pub gateway: GatewayConfig,

    /// Rate limiter engine configuration.
    #[serde(default)]
    pub limiter: LimiterSettings,

    /// Usage plan storage configuration.
    #[serde(default)]
    pub plans: PlansConfig,

    /// Counter storage configuration.
    #[serde(default)]
    pub counters: CountersConfig,

    /// Global settings.
    #[serde(default)]
    pub settings: GlobalSettings,
}

impl Config {
    /// Load configuration from the default location, applying environment
    /// overrides.
    ///
    /// # Errors
    ///
    /// Returns error if config cannot be loaded, parsed, or validated.
    pub fn load_default() -> Result<Self, ConfigError> {
        let path = Self::default_path();
        let mut config = if path.exists() {
            Self::load(&path)?
        } else {
            Self::default()
        };
        config.apply_overrides(|var| std::env::var(var).ok())?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a specific path.
    ///
    /// # Errors
    ///
    /// Returns error if file cannot be read or parsed.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        let config: Self = json5::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Save configuration to a path.
    ///
    /// # Errors
    ///
    /// Returns error if serialization or file write fails.
    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let content = serde_json::to_string_pretty(self)
            .map_err(|e| ConfigError::Validation(e.to_string()))?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Get the default config file path.
    #[must_use]
    pub fn default_path() -> PathBuf {
        Self::state_dir().join("tollgate.json")
    }

    /// Get the Tollgate state directory.
    ///
    /// Uses `TOLLGATE_STATE_DIR` env var if set, otherwise `~/.tollgate`.
    #[must_use]
    pub fn state_dir() -> PathBuf {
        if let Ok(dir) = std::env::var("TOLLGATE_STATE_DIR") {
            PathBuf::from(dir)
        } else if let Some(home) = dirs::home_dir() {
            home.join(".tollgate")
        } else {
            PathBuf::from(".tollgate")
        }
    }

    /// Get the sled plan database path.
    #[must_use]
    pub fn plans_path(&self) -> PathBuf {
        self.plans
            .path
            .clone()
            .unwrap_or_else(|| Self::state_dir().join("plans"))
    }

    /// Apply overrides from a variable lookup (normally the process environment).
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::InvalidEnv` if a variable holds an unparseable value.
    pub fn apply_overrides<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(url) = lookup(ENV_REDIS_URL) {
            self.counters.redis_url = url;
        }

        if let Some(mode) = lookup(ENV_FAILURE_MODE) {
            self.limiter.failure_mode = match mode.to_ascii_lowercase().as_str() {
                "closed" => FailureMode::Closed,
                "open" => FailureMode::Open,
                _ => {
                    return Err(ConfigError::InvalidEnv {
                        var: ENV_FAILURE_MODE,
                        value: mode,
                    });
                }
            };
        }

        if let Some(port) = lookup(ENV_GATEWAY_PORT) {
            self.gateway.port = port.parse().map_err(|_| ConfigError::InvalidEnv {
                var: ENV_GATEWAY_PORT,
                value: port,
            })?;
        }

        Ok(())
    }

    /// Validate the configuration.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::Validation` describing the first problem found.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.gateway.port == 0 {
            return Err(ConfigError::Validation(
                "Gateway port cannot be 0".to_string(),
            ));
        }

        if self.gateway.admin_requests_per_minute == 0 {
            return Err(ConfigError::Validation(
                "gateway.adminRequestsPerMinute must be positive".to_string(),
            ));
        }

        if self.limiter.window_secs == 0 {
            return Err(ConfigError::Validation(
                "limiter.windowSecs must be positive".to_string(),
            ));
        }

        if self.limiter.counter_ttl_secs <= self.limiter.window_secs {
            return Err(ConfigError::Validation(format!(
                "limiter.counterTtlSecs ({}) must exceed limiter.windowSecs ({})",
                self.limiter.counter_ttl_secs, self.limiter.window_secs
            )));
        }

        if self.limiter.store_timeout_ms == 0 {
            return Err(ConfigError::Validation(
                "limiter.storeTimeoutMs must be positive".to_string(),
            ));
        }

        if self.limiter.key_prefix.chars().any(char::is_control) {
            return Err(ConfigError::Validation(
                "limiter.keyPrefix contains control characters".to_string(),
            ));
        }

        if self.limiter.key_prefix.contains(['{', '}']) {
            return Err(ConfigError::Validation(
                "limiter.keyPrefix must not contain braces".to_string(),
            ));
        }

        if self.plans.cache_capacity == 0 {
            return Err(ConfigError::Validation(
                "plans.cacheCapacity must be positive".to_string(),
            ));
        }

        if self.counters.backend == CounterBackend::Redis && self.counters.redis_url.is_empty() {
            return Err(ConfigError::Validation(
                "counters.redisUrl is required for the redis backend".to_string(),
            ));
        }

        Ok(())
    }
}

/// Admin gateway server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GatewayConfig {
    /// Port to listen on.
    #[serde(default = "default_port")]
    pub port: u16,

    /// Bind address mode.
    #[serde(default)]
    pub mode: BindMode,

    /// Enable CORS.
    #[serde(default = "default_true")]
    pub cors: bool,

    /// Admin requests allowed per client per minute.
    #[serde(default = "default_admin_rpm")]
    pub admin_requests_per_minute: u32,
}

impl GatewayConfig {
    /// Address string to bind, e.g. `127.0.0.1:18790`.
    #[must_use]
    pub fn bind_address(&self) -> String {
        let host = match &self.mode {
            BindMode::Local => "127.0.0.1",
            BindMode::Public => "0.0.0.0",
            BindMode::Custom(host) => host.as_str(),
        };
        format!("{host}:{}", self.port)
    }
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            port: default_port(),
            mode: BindMode::default(),
            cors: true,
            admin_requests_per_minute: default_admin_rpm(),
        }
    }
}

const fn default_port() -> u16 {
    18790
}

const fn default_admin_rpm() -> u32 {
    120
}

const fn default_true() -> bool {
    true
}

/// Gateway bind mode.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BindMode {
    /// Bind to localhost only.
    #[default]
    Local,
    /// Bind to all interfaces.
    Public,
    /// Custom bind host.
    Custom(String),
}

/// What the engine does when the counter store cannot be reached.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FailureMode {
    /// Reject with `SERVICE_DEGRADED`.
    #[default]
    Closed,
    /// Admit without metering.
    Open,
}

/// Rate limiter engine settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LimiterSettings {
    /// Fixed window length in seconds.
    #[serde(default = "default_window_secs")]
    pub window_secs: u64,

    /// Counter expiry, set when a key is first created.
    #[serde(default = "default_counter_ttl_secs")]
    pub counter_ttl_secs: u64,

    /// Behaviour on counter store failure.
    #[serde(default)]
    pub failure_mode: FailureMode,

    /// Upper bound on any single counter store call.
    #[serde(default = "default_store_timeout_ms")]
    pub store_timeout_ms: u64,

    /// Prefix prepended to every counter key.
    #[serde(default = "default_key_prefix")]
    pub key_prefix: String,
}

impl Default for LimiterSettings {
    fn default() -> Self {
        Self {
            window_secs: default_window_secs(),
            counter_ttl_secs: default_counter_ttl_secs(),
            failure_mode: FailureMode::default(),
            store_timeout_ms: default_store_timeout_ms(),
            key_prefix: default_key_prefix(),
        }
    }
}

const fn default_window_secs() -> u64 {
    60
}

const fn default_counter_ttl_secs() -> u64 {
    90
}

const fn default_store_timeout_ms() -> u64 {
    250
}

fn default_key_prefix() -> String {
    "tollgate:".to_string()
}

/// Usage plan store backend.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PlanBackend {
    /// In-process map, lost on restart.
    Memory,
    /// Embedded sled database.
    #[default]
    Sled,
}

/// Usage plan storage configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlansConfig {
    /// Backend kind.
    #[serde(default)]
    pub backend: PlanBackend,

    /// Sled database path. Defaults to `<state dir>/plans`.
    #[serde(default)]
    pub path: Option<PathBuf>,

    /// How long a resolved plan may be served from cache.
    #[serde(default = "default_cache_ttl_secs")]
    pub cache_ttl_secs: u64,

    /// Maximum number of cached plans.
    #[serde(default = "default_cache_capacity")]
    pub cache_capacity: u64,
}

impl Default for PlansConfig {
    fn default() -> Self {
        Self {
            backend: PlanBackend::default(),
            path: None,
            cache_ttl_secs: default_cache_ttl_secs(),
            cache_capacity: default_cache_capacity(),
        }
    }
}

const fn default_cache_ttl_secs() -> u64 {
    5
}

const fn default_cache_capacity() -> u64 {
    10_000
}

/// Counter store backend.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CounterBackend {
    /// In-process counters, single instance only.
    #[default]
    Memory,
    /// Shared Redis counters.
    Redis,
}

/// Counter storage configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CountersConfig {
    /// Backend kind.
    #[serde(default)]
    pub backend: CounterBackend,

    /// Redis connection URL.
    #[serde(default = "default_redis_url")]
    pub redis_url: String,
}

impl Default for CountersConfig {
    fn default() -> Self {
        Self {
            backend: CounterBackend::default(),
            redis_url: default_redis_url(),
        }
    }
}

fn default_redis_url() -> String {
    "redis://127.0.0.1:6379".to_string()
}

/// Global settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GlobalSettings {
    /// Enable debug logging.
    #[serde(default)]
    pub debug: bool,

    /// Log format.
    #[serde(default)]
    pub log_format: LogFormat,
}

/// Log format.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Human-readable format.
    #[default]
    Pretty,
    /// JSON format.
    Json,
}
