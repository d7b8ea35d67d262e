use std::env;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid value for {key}: {value:?} ({reason})")]
    InvalidValue {
        key: &'static str,
        value: String,
        reason: String,
    },
}

/// Fully resolved configuration for one edge instance.
///
/// Every field is driven by environment variables with production defaults;
/// there is no configuration file. `pod_id` must be stable for the lifetime
/// of the process because producer tiers address fragments to it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub server: ServerConfig,
    pub redis: RedisConfig,
    pub nats: NatsConfig,
    pub buffer: BufferConfig,
    pub database: DatabaseConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub read_timeout: Duration,
    pub write_timeout: Duration,
    pub pod_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RedisConfig {
    pub host: String,
    pub port: u16,
    pub password: String,
    pub db: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NatsConfig {
    pub url: String,
    /// `-1` means retry forever.
    pub max_reconnects: i64,
    pub reconnect_wait: Duration,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BufferConfig {
    pub max_buffers: usize,
    pub max_chunks_per_buffer: usize,
    pub max_buffer_age: Duration,
    pub cleanup_interval: Duration,
    pub missing_chunk_timeout: Duration,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// Optional; when unset the instance runs without a persistence sink.
    pub url: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    pub level: String,
    pub format: LogFormat,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    Text,
    Json,
}

impl Config {
    /// Reads configuration from the environment, falling back to defaults.
    pub fn from_env() -> Result<Self, ConfigError> {
        Ok(Self {
            server: ServerConfig {
                host: env_or("SERVER_HOST", "0.0.0.0"),
                port: env_parse("SERVER_PORT", 8080)?,
                read_timeout: env_duration("SERVER_READ_TIMEOUT", Duration::from_secs(30))?,
                write_timeout: env_duration("SERVER_WRITE_TIMEOUT", Duration::from_secs(30))?,
                pod_id: env::var("POD_ID")
                    .ok()
                    .filter(|value| !value.is_empty())
                    .unwrap_or_else(default_pod_id),
            },
            redis: RedisConfig {
                host: env_or("REDIS_HOST", "localhost"),
                port: env_parse("REDIS_PORT", 6379)?,
                password: env_or("REDIS_PASSWORD", ""),
                db: env_parse("REDIS_DB", 0)?,
            },
            nats: NatsConfig {
                url: env_or("NATS_URL", "nats://localhost:4222"),
                max_reconnects: env_parse("NATS_MAX_RECONNECTS", -1)?,
                reconnect_wait: env_duration("NATS_RECONNECT_WAIT", Duration::from_secs(2))?,
            },
            buffer: BufferConfig {
                max_buffers: env_parse("BUFFER_MAX_BUFFERS", 10_000)?,
                max_chunks_per_buffer: env_parse("BUFFER_MAX_CHUNKS", 10_000)?,
                max_buffer_age: env_duration("BUFFER_MAX_AGE", Duration::from_secs(300))?,
                cleanup_interval: env_duration("BUFFER_CLEANUP_INTERVAL", Duration::from_secs(30))?,
                missing_chunk_timeout: env_duration(
                    "BUFFER_MISSING_CHUNK_TIMEOUT",
                    Duration::from_secs(30),
                )?,
            },
            database: DatabaseConfig {
                url: env::var("DATABASE_URL").ok().filter(|value| !value.is_empty()),
            },
            logging: LoggingConfig {
                level: env_or("LOG_LEVEL", "info"),
                format: match env_or("LOG_FORMAT", "text").as_str() {
                    "json" => LogFormat::Json,
                    _ => LogFormat::Text,
                },
            },
        })
    }
}

impl ServerConfig {
    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl RedisConfig {
    /// Connection URL in the form `redis://[:password@]host:port/db`.
    pub fn url(&self) -> String {
        if self.password.is_empty() {
            format!("redis://{}:{}/{}", self.host, self.port, self.db)
        } else {
            format!(
                "redis://:{}@{}:{}/{}",
                self.password, self.host, self.port, self.db
            )
        }
    }
}

impl NatsConfig {
    /// Reconnect limit in the form the NATS client expects; `None` retries
    /// forever.
    pub fn reconnect_limit(&self) -> Option<usize> {
        if self.max_reconnects < 0 {
            None
        } else {
            Some(self.max_reconnects as usize)
        }
    }
}

fn default_pod_id() -> String {
    let hostname = whoami::fallible::hostname().unwrap_or_else(|_| "unknown".into());
    format!("pod-{hostname}")
}

fn env_or(key: &'static str, default: &str) -> String {
    env::var(key)
        .ok()
        .filter(|value| !value.is_empty())
        .unwrap_or_else(|| default.to_string())
}

fn env_parse<T>(key: &'static str, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match env::var(key) {
        Ok(value) if !value.is_empty() => {
            value.parse().map_err(|err: T::Err| ConfigError::InvalidValue {
                key,
                value,
                reason: err.to_string(),
            })
        }
        _ => Ok(default),
    }
}

fn env_duration(key: &'static str, default: Duration) -> Result<Duration, ConfigError> {
    match env::var(key) {
        Ok(value) if !value.is_empty() => {
            parse_duration(&value).ok_or_else(|| ConfigError::InvalidValue {
                key,
                value,
                reason: "expected seconds or a value like 30s, 5m, 1h".into(),
            })
        }
        _ => Ok(default),
    }
}

/// Parses `10`, `500ms`, `30s`, `5m` or `1h`.
fn parse_duration(value: &str) -> Option<Duration> {
    let value = value.trim();
    if let Ok(seconds) = value.parse::<u64>() {
        return Some(Duration::from_secs(seconds));
    }

    let split = value.find(|c: char| !c.is_ascii_digit())?;
    let (digits, unit) = value.split_at(split);
    let amount: u64 = digits.parse().ok()?;

    match unit {
        "ms" => Some(Duration::from_millis(amount)),
        "s" => Some(Duration::from_secs(amount)),
        "m" => Some(Duration::from_secs(amount * 60)),
        "h" => Some(Duration::from_secs(amount * 3600)),
        _ => None,
    }
}
