//! Configuration management for the twin sync service

use serde::Deserialize;
use std::env;
use std::time::Duration;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub server: ServerConfig,
    pub database: DatabaseConfig,
    pub sync: SyncConfig,
    /// Device ids registered with the store at startup
    #[serde(default)]
    pub devices: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    pub url: String,
}

/// Session and protocol tuning
#[derive(Debug, Clone, Deserialize)]
pub struct SyncConfig {
    /// Bounded capacity of each session's push stream
    pub push_capacity: usize,
    /// Bounded capacity of each session's callback channel
    pub callback_capacity: usize,
    /// Upper bound on any network-facing call
    pub operation_timeout_ms: u64,
    /// How long a session may stay off `Synced` before it is closed; 0 disables
    pub session_timeout_ms: u64,
    pub retry: RetryConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RetryConfig {
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
    pub multiplier: u32,
    pub max_retries: u32,
}

impl SyncConfig {
    pub fn operation_timeout(&self) -> Duration {
        Duration::from_millis(self.operation_timeout_ms)
    }

    pub fn session_timeout(&self) -> Option<Duration> {
        (self.session_timeout_ms > 0).then(|| Duration::from_millis(self.session_timeout_ms))
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        SyncConfig {
            push_capacity: 64,
            callback_capacity: 64,
            operation_timeout_ms: 5_000,
            session_timeout_ms: 300_000,
            retry: RetryConfig::default(),
        }
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        RetryConfig {
            initial_delay_ms: 100,
            max_delay_ms: 10_000,
            multiplier: 2,
            max_retries: 8,
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Config {
            server: ServerConfig {
                host: "0.0.0.0".to_string(),
                port: 3000,
            },
            database: DatabaseConfig {
                url: "sqlite:./twins.db".to_string(),
            },
            sync: SyncConfig::default(),
            devices: Vec::new(),
        }
    }
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = Config::default();
        let retry_defaults = RetryConfig::default();

        Ok(Config {
            server: ServerConfig {
                host: env::var("SERVER_HOST").unwrap_or(defaults.server.host),
                port: parse_var("SERVER_PORT", defaults.server.port)?,
            },
            database: DatabaseConfig {
                url: env::var("DATABASE_URL").unwrap_or(defaults.database.url),
            },
            sync: SyncConfig {
                push_capacity: parse_var("TWIN_PUSH_CAPACITY", defaults.sync.push_capacity)?,
                callback_capacity: parse_var(
                    "TWIN_CALLBACK_CAPACITY",
                    defaults.sync.callback_capacity,
                )?,
                operation_timeout_ms: parse_var(
                    "TWIN_OPERATION_TIMEOUT_MS",
                    defaults.sync.operation_timeout_ms,
                )?,
                session_timeout_ms: parse_var(
                    "TWIN_SESSION_TIMEOUT_MS",
                    defaults.sync.session_timeout_ms,
                )?,
                retry: RetryConfig {
                    initial_delay_ms: parse_var(
                        "TWIN_RETRY_INITIAL_DELAY_MS",
                        retry_defaults.initial_delay_ms,
                    )?,
                    max_delay_ms: parse_var("TWIN_RETRY_MAX_DELAY_MS", retry_defaults.max_delay_ms)?,
                    multiplier: parse_var("TWIN_RETRY_MULTIPLIER", retry_defaults.multiplier)?,
                    max_retries: parse_var("TWIN_RETRY_MAX_ATTEMPTS", retry_defaults.max_retries)?,
                },
            },
            devices: env::var("TWIN_DEVICES")
                .map(|v| parse_device_list(&v))
                .unwrap_or_default(),
        })
    }
}

/// Configuration loading errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid value for {name}: {value}")]
    InvalidValue { name: &'static str, value: String },
}

fn parse_var<T: std::str::FromStr>(name: &'static str, default: T) -> Result<T, ConfigError> {
    match env::var(name) {
        Ok(value) => value
            .trim()
            .parse()
            .map_err(|_| ConfigError::InvalidValue { name, value }),
        Err(_) => Ok(default),
    }
}

fn parse_device_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(String::from)
        .collect()
}
