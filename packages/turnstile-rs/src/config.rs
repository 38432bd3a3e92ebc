//! Store configuration: admission strategy and idle timeout.
//!
//! Configuration can come from code ([`StoreConfig::default`] plus builder
//! methods), from JSON, or from the environment:
//!
//! | Variable | Meaning | Default |
//! |---|---|---|
//! | `TURNSTILE_STRATEGY` | `exclusive` or `concurrent` | `concurrent` |
//! | `TURNSTILE_IDLE_TIMEOUT_MS` | bound for `Store::wait_until_idle` | `30000` |

use std::env;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::error::StoreError;

/// Default bound for `Store::wait_until_idle`.
pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(30);

/// Admission policy for root dispatches.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Strategy {
    /// One root chain at a time. A new root waits until the ledger is empty.
    Exclusive,
    /// Roots start immediately, chains may overlap.
    #[default]
    Concurrent,
}

impl Strategy {
    pub fn is_exclusive(&self) -> bool {
        matches!(self, Strategy::Exclusive)
    }
}

impl fmt::Display for Strategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Strategy::Exclusive => write!(f, "exclusive"),
            Strategy::Concurrent => write!(f, "concurrent"),
        }
    }
}

impl FromStr for Strategy {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "exclusive" => Ok(Strategy::Exclusive),
            "concurrent" => Ok(Strategy::Concurrent),
            _ => Err(StoreError::InvalidStrategy {
                value: s.to_string(),
            }),
        }
    }
}

/// Store-level settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    pub strategy: Strategy,
    #[serde(with = "duration_ms", rename = "idle_timeout_ms")]
    pub idle_timeout: Duration,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            strategy: Strategy::default(),
            idle_timeout: DEFAULT_IDLE_TIMEOUT,
        }
    }
}

impl StoreConfig {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self> {
        // Load .env file if present (development)
        let _ = dotenvy::dotenv();

        let mut config = Self::default();

        if let Ok(value) = env::var("TURNSTILE_STRATEGY") {
            config.strategy = value
                .parse()
                .context("TURNSTILE_STRATEGY must be \"exclusive\" or \"concurrent\"")?;
        }

        if let Ok(value) = env::var("TURNSTILE_IDLE_TIMEOUT_MS") {
            let ms: u64 = value
                .parse()
                .context("TURNSTILE_IDLE_TIMEOUT_MS must be a valid number")?;
            config.idle_timeout = Duration::from_millis(ms);
        }

        Ok(config)
    }

    /// Parse configuration from JSON. Missing fields take their defaults.
    pub fn from_json(json: &str) -> Result<Self, StoreError> {
        serde_json::from_str(json).map_err(|e| StoreError::Config {
            message: e.to_string(),
        })
    }

    pub fn with_strategy(mut self, strategy: Strategy) -> Self {
        self.strategy = strategy;
        self
    }

    pub fn with_idle_timeout(mut self, idle_timeout: Duration) -> Self {
        self.idle_timeout = idle_timeout;
        self
    }
}

mod duration_ms {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(duration.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}
