//! Engine configuration.
//!
//! Configuration is read once at startup from a [`ConfigSource`] into an
//! immutable [`GatewayConfig`] that is passed to every component.

use std::collections::HashMap;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

/// Error type for configuration loading. Values are never echoed back.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("{0} is required")]
    Missing(&'static str),

    #[error("{key} is invalid: {reason}")]
    Invalid { key: &'static str, reason: String },

    #[error("Failed to read configuration file: {0}")]
    File(String),
}

// ─────────────────────────────────────────────────────────────────────────────
// Sources
// ─────────────────────────────────────────────────────────────────────────────

/// Where configuration values come from.
pub trait ConfigSource: Send + Sync {
    fn get(&self, key: &str) -> Option<String>;
}

/// Reads the process environment.
#[derive(Debug, Default, Clone, Copy)]
pub struct EnvConfigSource;

impl ConfigSource for EnvConfigSource {
    fn get(&self, key: &str) -> Option<String> {
        std::env::var(key).ok()
    }
}

/// Reads a dotenv-format file once, without touching the process environment.
#[derive(Debug, Clone)]
pub struct FileConfigSource {
    values: HashMap<String, String>,
}

impl FileConfigSource {
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let iter =
            dotenvy::from_path_iter(path.as_ref()).map_err(|e| ConfigError::File(e.to_string()))?;
        let values = iter
            .collect::<Result<HashMap<_, _>, _>>()
            .map_err(|e| ConfigError::File(e.to_string()))?;
        Ok(Self { values })
    }
}

impl ConfigSource for FileConfigSource {
    fn get(&self, key: &str) -> Option<String> {
        self.values.get(key).cloned()
    }
}

/// In-memory source.
#[derive(Debug, Default, Clone)]
pub struct MapConfigSource {
    values: HashMap<String, String>,
}

impl MapConfigSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.values.insert(key.into(), value.into());
        self
    }
}

impl ConfigSource for MapConfigSource {
    fn get(&self, key: &str) -> Option<String> {
        self.values.get(key).cloned()
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for MapConfigSource {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self {
            values: iter
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Configuration value
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    pub url: String,
    /// Upper bound for a single store call.
    pub timeout: Duration,
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub port: u16,
}

#[derive(Debug, Clone)]
pub struct OutboxConfig {
    pub poll_interval: Duration,
    pub batch_size: i64,
    /// How long a claimed row stays invisible to other dispatchers.
    pub lease: Duration,
    pub broker_timeout: Duration,
    /// How long a published message may go unconsumed before it is
    /// published again.
    pub redelivery_timeout: Duration,
}

#[derive(Debug, Clone)]
pub struct RetryConfig {
    pub base_delay: Duration,
    pub max_delay: Duration,
}

#[derive(Debug, Clone)]
pub struct SettlementConfig {
    /// Deliveries of one settle message before the transaction is failed.
    pub max_attempts: u32,
    pub timeout: Duration,
    /// Consumer workers, one per broker partition.
    pub workers: usize,
    /// Queue a capture as soon as a payment is authorized.
    pub auto_capture: bool,
    /// Base URL of the settlement processor; simulated when unset.
    pub processor_url: Option<String>,
}

#[derive(Debug, Clone)]
pub struct IdempotencyConfig {
    pub ttl: Duration,
    /// How long a duplicate waits for an in-flight original.
    pub wait: Duration,
    /// How long a reservation is held before another caller may take it over.
    pub lease: Duration,
}

#[derive(Debug, Clone)]
pub struct ReconciliationConfig {
    pub interval: Duration,
    pub stale_after: Duration,
    pub report_url: Option<String>,
}

/// Immutable engine configuration.
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub database: DatabaseConfig,
    pub server: ServerConfig,
    pub outbox: OutboxConfig,
    pub retry: RetryConfig,
    pub settlement: SettlementConfig,
    pub idempotency: IdempotencyConfig,
    pub reconciliation: ReconciliationConfig,
}

impl GatewayConfig {
    /// Loads configuration from `source`, applying defaults for optional keys.
    pub fn load(source: &dyn ConfigSource) -> Result<Self, ConfigError> {
        let url = source
            .get("DATABASE_URL")
            .filter(|v| !v.trim().is_empty())
            .ok_or(ConfigError::Missing("DATABASE_URL"))?;

        let config = Self {
            database: DatabaseConfig {
                url,
                timeout: millis(source, "DB_TIMEOUT_MS", 5_000)?,
            },
            server: ServerConfig {
                port: value(source, "PORT", 3000)?,
            },
            outbox: OutboxConfig {
                poll_interval: millis(source, "OUTBOX_POLL_INTERVAL_MS", 500)?,
                batch_size: value(source, "OUTBOX_BATCH_SIZE", 50)?,
                lease: millis(source, "OUTBOX_LEASE_MS", 30_000)?,
                broker_timeout: millis(source, "BROKER_TIMEOUT_MS", 2_000)?,
                redelivery_timeout: millis(source, "OUTBOX_REDELIVERY_MS", 300_000)?,
            },
            retry: RetryConfig {
                base_delay: millis(source, "RETRY_BASE_DELAY_MS", 200)?,
                max_delay: millis(source, "RETRY_MAX_DELAY_MS", 30_000)?,
            },
            settlement: SettlementConfig {
                max_attempts: value(source, "SETTLEMENT_MAX_ATTEMPTS", 5)?,
                timeout: millis(source, "SETTLEMENT_TIMEOUT_MS", 10_000)?,
                workers: value(source, "CONSUMER_WORKERS", 4)?,
                auto_capture: value(source, "AUTO_CAPTURE", true)?,
                processor_url: optional(source, "SETTLEMENT_PROCESSOR_URL"),
            },
            idempotency: IdempotencyConfig {
                ttl: secs(source, "IDEMPOTENCY_TTL_SECS", 86_400)?,
                wait: millis(source, "IDEMPOTENCY_WAIT_MS", 2_000)?,
                lease: millis(source, "IDEMPOTENCY_LEASE_MS", 30_000)?,
            },
            reconciliation: ReconciliationConfig {
                interval: secs(source, "RECONCILIATION_INTERVAL_SECS", 300)?,
                stale_after: secs(source, "STALE_AFTER_SECS", 900)?,
                report_url: optional(source, "PROCESSOR_REPORT_URL"),
            },
        };

        config.validate()?;
        Ok(config)
    }

    /// Defaults with the given database URL.
    pub fn with_database_url(url: impl Into<String>) -> Result<Self, ConfigError> {
        Self::load(&MapConfigSource::new().with("DATABASE_URL", url))
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.outbox.batch_size < 1 {
            return Err(invalid("OUTBOX_BATCH_SIZE", "must be at least 1"));
        }
        if self.settlement.max_attempts < 1 {
            return Err(invalid("SETTLEMENT_MAX_ATTEMPTS", "must be at least 1"));
        }
        if self.settlement.workers < 1 {
            return Err(invalid("CONSUMER_WORKERS", "must be at least 1"));
        }
        if self.retry.max_delay < self.retry.base_delay {
            return Err(invalid(
                "RETRY_MAX_DELAY_MS",
                "must not be below RETRY_BASE_DELAY_MS",
            ));
        }
        Ok(())
    }
}

fn invalid(key: &'static str, reason: &str) -> ConfigError {
    ConfigError::Invalid {
        key,
        reason: reason.to_string(),
    }
}

fn value<T>(source: &dyn ConfigSource, key: &'static str, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match source.get(key) {
        Some(raw) => raw.trim().parse().map_err(|e: T::Err| ConfigError::Invalid {
            key,
            reason: e.to_string(),
        }),
        None => Ok(default),
    }
}

fn millis(source: &dyn ConfigSource, key: &'static str, default: u64) -> Result<Duration, ConfigError> {
    value(source, key, default).map(Duration::from_millis)
}

fn secs(source: &dyn ConfigSource, key: &'static str, default: u64) -> Result<Duration, ConfigError> {
    value(source, key, default).map(Duration::from_secs)
}

fn optional(source: &dyn ConfigSource, key: &str) -> Option<String> {
    source.get(key).filter(|v| !v.trim().is_empty())
}
