/// Configuration system for tiers, identity bindings, and the shared store
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;
use tracing::{info, warn};

/// Errors raised while loading or validating configuration.
///
/// All of these are fatal at startup; a running process never swaps in a
/// configuration that failed validation.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read configuration file {path}: {source}")]
    Io {
        path: String,
        source: std::io::Error,
    },

    #[error("invalid JSON in configuration file {path}: {source}")]
    Parse {
        path: String,
        source: serde_json::Error,
    },

    #[error("invalid configuration: {message}")]
    Invalid { message: String },
}

impl ConfigError {
    fn invalid(message: impl Into<String>) -> Self {
        ConfigError::Invalid {
            message: message.into(),
        }
    }
}

/// Limit descriptor for a single tier.
///
/// `base_limit` is the SLA floor, `burst_limit` the headroom granted while the
/// system is healthy, and `degraded_limit` the load-shedding value applied to
/// the free tier when health is DEGRADED.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TierLimits {
    pub base_limit: u64,
    pub burst_limit: u64,
    pub degraded_limit: u64,
    #[serde(default = "default_window_seconds")]
    pub window_seconds: u64,
}

/// Connection parameters for the shared Redis store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    #[serde(default = "default_store_host")]
    pub host: String,
    #[serde(default = "default_store_port")]
    pub port: u16,
    #[serde(default)]
    pub db: i64,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
    #[serde(default = "default_op_timeout_ms")]
    pub op_timeout_ms: u64,
}

impl StoreConfig {
    /// Builds the Redis connection URL from the individual parameters.
    pub fn url(&self) -> String {
        match &self.password {
            Some(password) => format!(
                "redis://:{}@{}:{}/{}",
                password, self.host, self.port, self.db
            ),
            None => format!("redis://{}:{}/{}", self.host, self.port, self.db),
        }
    }

    /// Per-operation socket deadline.
    pub fn op_timeout(&self) -> Duration {
        Duration::from_millis(self.op_timeout_ms)
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        StoreConfig {
            host: default_store_host(),
            port: default_store_port(),
            db: 0,
            password: None,
            max_connections: default_max_connections(),
            op_timeout_ms: default_op_timeout_ms(),
        }
    }
}

/// Top-level limiter configuration.
///
/// The identity tables (`identities`, `api_keys`) are materialised into the
/// in-memory directory at startup and on reload; the `store` section is only
/// read once, when the store client is constructed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimiterConfig {
    pub tiers: HashMap<String, TierLimits>,
    #[serde(default)]
    pub identities: HashMap<String, String>,
    #[serde(default)]
    pub api_keys: HashMap<String, String>,
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default = "default_key_header")]
    pub key_header: String,
    #[serde(default = "default_exclude_paths")]
    pub exclude_paths: Vec<String>,
    #[serde(default = "default_listen")]
    pub listen: String,
}

impl LimiterConfig {
    /// Loads configuration from a JSON file, applies environment overrides,
    /// and validates the result.
    ///
    /// # Arguments
    /// * `path` - Path to the configuration file. If `None`, the built-in
    ///   demo configuration is used.
    ///
    /// # Returns
    /// * `Ok(LimiterConfig)` - Validated configuration
    /// * `Err(ConfigError)` - On read, parse, or validation failure (fatal)
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut config = match path {
            Some(path) => {
                info!(path = %path.display(), "loading configuration");
                let content = fs::read_to_string(path).map_err(|source| ConfigError::Io {
                    path: path.display().to_string(),
                    source,
                })?;
                serde_json::from_str::<LimiterConfig>(&content).map_err(|source| {
                    ConfigError::Parse {
                        path: path.display().to_string(),
                        source,
                    }
                })?
            }
            None => {
                warn!("no configuration file given, using built-in demo configuration");
                LimiterConfig::default()
            }
        };

        config.apply_env_overrides()?;
        config.validate()?;

        info!(
            tiers = config.tiers.len(),
            identities = config.identities.len(),
            api_keys = config.api_keys.len(),
            store_host = %config.store.host,
            store_port = config.store.port,
            "configuration loaded"
        );

        Ok(config)
    }

    /// Applies `REDIS_*` environment overrides to the store section.
    /// Environment values win over the document.
    fn apply_env_overrides(&mut self) -> Result<(), ConfigError> {
        if let Ok(host) = std::env::var("REDIS_HOST") {
            self.store.host = host;
        }
        if let Ok(port) = std::env::var("REDIS_PORT") {
            self.store.port = port
                .parse()
                .map_err(|_| ConfigError::invalid(format!("REDIS_PORT is not a port: {port}")))?;
        }
        if let Ok(db) = std::env::var("REDIS_DB") {
            self.store.db = db
                .parse()
                .map_err(|_| ConfigError::invalid(format!("REDIS_DB is not a number: {db}")))?;
        }
        if let Ok(password) = std::env::var("REDIS_PASSWORD") {
            self.store.password = Some(password);
        }
        if let Ok(timeout) = std::env::var("REDIS_TIMEOUT_MS") {
            self.store.op_timeout_ms = timeout.parse().map_err(|_| {
                ConfigError::invalid(format!("REDIS_TIMEOUT_MS is not a number: {timeout}"))
            })?;
        }
        Ok(())
    }

    /// Validates structural invariants.
    ///
    /// Tier limits must satisfy base >= 1, burst >= base, degraded >= 1 and a
    /// positive window; every identity must reference a configured tier and
    /// every API key a configured identity.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.tiers.is_empty() {
            return Err(ConfigError::invalid("no tiers configured"));
        }

        for (name, limits) in &self.tiers {
            if limits.base_limit < 1 {
                return Err(ConfigError::invalid(format!(
                    "tier {name}: base_limit must be >= 1"
                )));
            }
            if limits.burst_limit < limits.base_limit {
                return Err(ConfigError::invalid(format!(
                    "tier {name}: burst_limit {} must be >= base_limit {}",
                    limits.burst_limit, limits.base_limit
                )));
            }
            if limits.degraded_limit < 1 {
                return Err(ConfigError::invalid(format!(
                    "tier {name}: degraded_limit must be >= 1"
                )));
            }
            if limits.window_seconds < 1 {
                return Err(ConfigError::invalid(format!(
                    "tier {name}: window_seconds must be >= 1"
                )));
            }
        }

        for (identity, tier) in &self.identities {
            if !self.tiers.contains_key(tier) {
                return Err(ConfigError::invalid(format!(
                    "identity {identity} references unknown tier {tier}"
                )));
            }
        }

        for (key, identity) in &self.api_keys {
            if !self.identities.contains_key(identity) {
                return Err(ConfigError::invalid(format!(
                    "API key {} references unknown identity {identity}",
                    &key[..key.len().min(8)]
                )));
            }
        }

        if self.store.max_connections < 1 {
            return Err(ConfigError::invalid("store.max_connections must be >= 1"));
        }
        if self.store.op_timeout_ms < 1 {
            return Err(ConfigError::invalid("store.op_timeout_ms must be >= 1"));
        }
        if self.key_header.trim().is_empty() {
            return Err(ConfigError::invalid("key_header must not be empty"));
        }

        Ok(())
    }

    /// Gets the limit descriptor for a named tier.
    pub fn tier_limits(&self, tier: &str) -> Option<&TierLimits> {
        self.tiers.get(tier)
    }
}

impl Default for LimiterConfig {
    /// Built-in demo configuration mirroring the documented quick-start keys.
    fn default() -> Self {
        let mut tiers = HashMap::new();
        tiers.insert(
            "free".to_string(),
            TierLimits {
                base_limit: 10,
                burst_limit: 20,
                degraded_limit: 2,
                window_seconds: 60,
            },
        );
        tiers.insert(
            "pro".to_string(),
            TierLimits {
                base_limit: 100,
                burst_limit: 150,
                degraded_limit: 100,
                window_seconds: 60,
            },
        );
        tiers.insert(
            "enterprise".to_string(),
            TierLimits {
                base_limit: 1000,
                burst_limit: 1000,
                degraded_limit: 1000,
                window_seconds: 60,
            },
        );

        let mut identities = HashMap::new();
        identities.insert("demo_free_user".to_string(), "free".to_string());
        identities.insert("demo_pro_user".to_string(), "pro".to_string());
        identities.insert("demo_enterprise_user".to_string(), "enterprise".to_string());

        let mut api_keys = HashMap::new();
        api_keys.insert("demo_free_key_123".to_string(), "demo_free_user".to_string());
        api_keys.insert("demo_free_key_456".to_string(), "demo_free_user".to_string());
        api_keys.insert("demo_pro_key_789".to_string(), "demo_pro_user".to_string());
        api_keys.insert(
            "demo_enterprise_key_abc".to_string(),
            "demo_enterprise_user".to_string(),
        );

        LimiterConfig {
            tiers,
            identities,
            api_keys,
            store: StoreConfig::default(),
            key_header: default_key_header(),
            exclude_paths: default_exclude_paths(),
            listen: default_listen(),
        }
    }
}

fn default_window_seconds() -> u64 {
    60
}

fn default_store_host() -> String {
    "localhost".to_string()
}

fn default_store_port() -> u16 {
    6379
}

fn default_max_connections() -> usize {
    50
}

fn default_op_timeout_ms() -> u64 {
    5
}

fn default_key_header() -> String {
    "X-API-Key".to_string()
}

fn default_exclude_paths() -> Vec<String> {
    vec!["/".to_string(), "/health".to_string(), "/admin/*".to_string()]
}

fn default_listen() -> String {
    "0.0.0.0:8000".to_string()
}
