//! Typed configuration from environment variables or a TOML file.
//!
//! Loads once at startup, fails fast on malformed values.

use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// How context keys map onto queues.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum QueueMode {
    /// One queue per live context key, evicted once idle and empty.
    PerKey,
    /// A fixed table of queues indexed by `hash(key) % shards`. Distinct keys
    /// that land in the same shard are serialized against each other.
    Sharded,
}

impl FromStr for QueueMode {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "per-key" | "per_key" | "perkey" => Ok(QueueMode::PerKey),
            "sharded" => Ok(QueueMode::Sharded),
            other => Err(Error::Config(format!(
                "unknown queue mode {other:?} (expected \"per-key\" or \"sharded\")"
            ))),
        }
    }
}

/// Dispatcher tuning.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatcherConfig {
    pub mode: QueueMode,
    /// Number of queues in sharded mode. Ignored in per-key mode.
    pub shards: usize,
    /// Maximum pending tasks per queue, not counting the one in flight.
    pub queue_capacity: usize,
    /// Default wait for buffer space used by the CLI and by callers that
    /// opt into blocking. `None` never blocks.
    pub enqueue_timeout_ms: Option<u64>,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            mode: QueueMode::PerKey,
            shards: 64,
            queue_capacity: 1_000,
            enqueue_timeout_ms: None,
        }
    }
}

impl DispatcherConfig {
    pub fn per_key(queue_capacity: usize) -> Self {
        Self {
            mode: QueueMode::PerKey,
            queue_capacity,
            ..Self::default()
        }
    }

    pub fn sharded(shards: usize, queue_capacity: usize) -> Self {
        Self {
            mode: QueueMode::Sharded,
            shards,
            queue_capacity,
            ..Self::default()
        }
    }

    pub fn enqueue_timeout(&self) -> Option<Duration> {
        self.enqueue_timeout_ms.map(Duration::from_millis)
    }

    pub fn validate(&self) -> Result<()> {
        if self.mode == QueueMode::Sharded && self.shards == 0 {
            return Err(Error::Config(
                "sharded mode needs at least one shard".to_string(),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub dispatcher: DispatcherConfig,
    pub otel_endpoint: Option<String>,
    pub log_level: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            dispatcher: DispatcherConfig::default(),
            otel_endpoint: None,
            log_level: "info".to_string(),
        }
    }
}

impl Config {
    /// Load configuration from environment variables. Unset variables keep
    /// their defaults.
    ///
    /// In local dev, call `dotenvy::dotenv().ok()` before this.
    pub fn from_env() -> Result<Self> {
        let defaults = DispatcherConfig::default();
        let config = Self {
            dispatcher: DispatcherConfig {
                mode: parsed_var("DISPATCH_MODE")?.unwrap_or(defaults.mode),
                shards: parsed_var("DISPATCH_SHARDS")?.unwrap_or(defaults.shards),
                queue_capacity: parsed_var("DISPATCH_QUEUE_CAPACITY")?
                    .unwrap_or(defaults.queue_capacity),
                enqueue_timeout_ms: parsed_var("DISPATCH_ENQUEUE_TIMEOUT_MS")?,
            },
            otel_endpoint: std::env::var("OTEL_ENDPOINT").ok(),
            log_level: std::env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string()),
        };
        config.dispatcher.validate()?;
        Ok(config)
    }

    pub fn from_toml_str(content: &str) -> Result<Self> {
        let config: Config =
            toml::from_str(content).map_err(|e| Error::Config(format!("bad config: {e}")))?;
        config.dispatcher.validate()?;
        Ok(config)
    }

    pub fn load_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            Error::Config(format!("cannot read config file {}: {e}", path.display()))
        })?;
        Self::from_toml_str(&content)
    }
}

fn parsed_var<T>(name: &str) -> Result<Option<T>>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match std::env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|e| Error::Config(format!("invalid value {raw:?} for {name}: {e}"))),
        Err(_) => Ok(None),
    }
}
