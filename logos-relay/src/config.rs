//! Relay configuration, read once at startup.
//!
//! | Variable | Default |
//! |----------|---------|
//! | `RELAY_HOST` | `0.0.0.0` |
//! | `RELAY_PORT` | `1234` |
//! | `RELAY_STORE_PATH` | unset (in-memory store) |
//! | `RELAY_FLUSH_SIZE` | `100` |
//! | `RELAY_CACHE_ENABLED` | `false` |
//! | `RELAY_CACHE_TTL` | `3600` (seconds, at most one year) |
//! | `RELAY_CACHE_CAPACITY` | `1024` |

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::persistence::WriteBackPolicy;
use crate::session::SessionConfig;

pub const ENV_HOST: &str = "RELAY_HOST";
pub const ENV_PORT: &str = "RELAY_PORT";
pub const ENV_STORE_PATH: &str = "RELAY_STORE_PATH";
pub const ENV_FLUSH_SIZE: &str = "RELAY_FLUSH_SIZE";
pub const ENV_CACHE_ENABLED: &str = "RELAY_CACHE_ENABLED";
pub const ENV_CACHE_TTL: &str = "RELAY_CACHE_TTL";
pub const ENV_CACHE_CAPACITY: &str = "RELAY_CACHE_CAPACITY";

/// Longest accepted cache TTL (one year).
pub const MAX_CACHE_TTL: Duration = Duration::from_secs(365 * 24 * 60 * 60);

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid value for {key}: {value:?}")]
    Invalid { key: &'static str, value: String },
}

/// Cache tier settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheConfig {
    pub enabled: bool,
    pub ttl: Duration,
    /// Maximum number of cached documents
    pub capacity: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            ttl: Duration::from_secs(3600),
            capacity: 1024,
        }
    }
}

/// Relay server configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelayConfig {
    /// Address to bind to
    pub bind_addr: String,
    /// RocksDB directory (None = in-memory store, nothing survives restart)
    pub storage_path: Option<PathBuf>,
    /// Update-log length that triggers compaction in the durable store
    pub flush_size: usize,
    pub cache: CacheConfig,
    pub write_back: WriteBackPolicy,
    /// How long an unreferenced document stays resident
    pub eviction_cooldown: Duration,
    pub close_flush_timeout: Duration,
    /// Broadcast channel capacity per document
    pub broadcast_capacity: usize,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            bind_addr: "0.0.0.0:1234".to_string(),
            storage_path: None,
            flush_size: 100,
            cache: CacheConfig::default(),
            write_back: WriteBackPolicy::default(),
            eviction_cooldown: Duration::from_secs(30),
            close_flush_timeout: Duration::from_secs(5),
            broadcast_capacity: 256,
        }
    }
}

impl RelayConfig {
    /// Read from the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Read through `lookup`; missing or blank keys keep their defaults.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| {
            lookup(key)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };
        let mut config = Self::default();

        let host = get(ENV_HOST).unwrap_or_else(|| "0.0.0.0".to_string());
        let port: u16 = parse(ENV_PORT, get(ENV_PORT))?.unwrap_or(1234);
        config.bind_addr = format!("{host}:{port}");

        config.storage_path = get(ENV_STORE_PATH).map(PathBuf::from);

        if let Some(flush_size) = parse::<usize>(ENV_FLUSH_SIZE, get(ENV_FLUSH_SIZE))? {
            if flush_size == 0 {
                return Err(invalid(ENV_FLUSH_SIZE, "0"));
            }
            config.flush_size = flush_size;
        }

        if let Some(raw) = get(ENV_CACHE_ENABLED) {
            config.cache.enabled = parse_bool(&raw).ok_or_else(|| invalid(ENV_CACHE_ENABLED, &raw))?;
        }
        if let Some(secs) = parse::<u64>(ENV_CACHE_TTL, get(ENV_CACHE_TTL))? {
            let ttl = Duration::from_secs(secs);
            if ttl.is_zero() || ttl > MAX_CACHE_TTL {
                return Err(invalid(ENV_CACHE_TTL, &secs.to_string()));
            }
            config.cache.ttl = ttl;
        }
        if let Some(capacity) = parse(ENV_CACHE_CAPACITY, get(ENV_CACHE_CAPACITY))? {
            config.cache.capacity = capacity;
        }

        Ok(config)
    }

    pub fn session(&self) -> SessionConfig {
        SessionConfig {
            close_flush_timeout: self.close_flush_timeout,
        }
    }
}

fn parse<T: FromStr>(key: &'static str, raw: Option<String>) -> Result<Option<T>, ConfigError> {
    raw.map(|v| v.parse().map_err(|_| invalid(key, &v))).transpose()
}

fn parse_bool(raw: &str) -> Option<bool> {
    match raw.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

fn invalid(key: &'static str, value: &str) -> ConfigError {
    ConfigError::Invalid {
        key,
        value: value.to_string(),
    }
}
