use serde::{Deserialize, Serialize};
use std::time::Duration;
use uuid::Uuid;

use crate::error::{EventBusError, Result};

/// Environment variable prefix, e.g. `EVENTS_BUS__REDIS__DSN`.
pub const ENV_PREFIX: &str = "EVENTS_BUS";

/// Broker implementation backing the bus
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BrokerBackend {
    #[default]
    Redis,
    /// In-process broker, nothing leaves the process
    Memory,
}

/// Top-level event bus configuration
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct EventBusConfig {
    #[serde(default)]
    pub backend: BrokerBackend,

    #[serde(default)]
    pub redis: RedisConfig,

    #[serde(default)]
    pub consumer: ConsumerConfig,
}

/// Redis connection settings. These only govern the connection layer and
/// never the retry policy applied to messages.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RedisConfig {
    #[serde(default = "default_dsn")]
    pub dsn: String,

    /// Upper bound on idle connections kept for blocking reads
    #[serde(default = "default_pool_size")]
    pub pool_size: usize,

    #[serde(default = "default_max_retries")]
    pub max_retries: usize,

    #[serde(default = "default_min_retry_backoff")]
    pub min_retry_backoff_ms: u64,

    /// Longest reconnect wait; attempts that would wait longer are not made
    #[serde(default = "default_max_retry_backoff")]
    pub max_retry_backoff_ms: u64,

    #[serde(default = "default_dial_timeout")]
    pub dial_timeout_ms: u64,

    #[serde(default = "default_read_timeout")]
    pub read_timeout_ms: u64,

    #[serde(default = "default_write_timeout")]
    pub write_timeout_ms: u64,
}

/// Consumer group membership and pull-loop tuning
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ConsumerConfig {
    #[serde(default)]
    pub group: String,

    /// Generated on load when left empty
    #[serde(default)]
    pub consumer_id: String,

    #[serde(default = "default_block_duration")]
    pub block_duration_ms: u64,

    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    #[serde(default = "default_max_concurrency")]
    pub max_concurrency: usize,
}

fn default_dsn() -> String { "redis://localhost:6379/0".to_string() }
fn default_pool_size() -> usize { 10 }
fn default_max_retries() -> usize { 3 }
fn default_min_retry_backoff() -> u64 { 8 }
fn default_max_retry_backoff() -> u64 { 512 }
fn default_dial_timeout() -> u64 { 5000 } // 5 seconds
fn default_read_timeout() -> u64 { 3000 }
fn default_write_timeout() -> u64 { 3000 }

fn default_block_duration() -> u64 { 1000 } // 1 second
fn default_batch_size() -> usize { 10 }
fn default_max_concurrency() -> usize { 5 }

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            dsn: default_dsn(),
            pool_size: default_pool_size(),
            max_retries: default_max_retries(),
            min_retry_backoff_ms: default_min_retry_backoff(),
            max_retry_backoff_ms: default_max_retry_backoff(),
            dial_timeout_ms: default_dial_timeout(),
            read_timeout_ms: default_read_timeout(),
            write_timeout_ms: default_write_timeout(),
        }
    }
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self {
            group: String::new(),
            consumer_id: String::new(),
            block_duration_ms: default_block_duration(),
            batch_size: default_batch_size(),
            max_concurrency: default_max_concurrency(),
        }
    }
}

impl EventBusConfig {
    /// Load configuration from an optional file overlaid with
    /// `EVENTS_BUS__<SECTION>__<KEY>` environment variables.
    pub fn load(path: Option<&str>) -> Result<Self> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(config::File::with_name(path).required(false));
        }

        let settings = builder
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let mut config: EventBusConfig = settings.try_deserialize()?;
        config.consumer.ensure_consumer_id();
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.backend == BrokerBackend::Redis {
            self.redis.validate()?;
        }
        self.consumer.validate()
    }
}

impl RedisConfig {
    pub fn validate(&self) -> Result<()> {
        if self.dsn.trim().is_empty() {
            return Err(EventBusError::Configuration("redis dsn must not be empty".to_string()));
        }
        if self.pool_size == 0 {
            return Err(EventBusError::Configuration("redis pool_size must be positive".to_string()));
        }
        if self.min_retry_backoff_ms > self.max_retry_backoff_ms {
            return Err(EventBusError::Configuration(
                "redis min_retry_backoff_ms exceeds max_retry_backoff_ms".to_string(),
            ));
        }
        Ok(())
    }

    pub fn dial_timeout(&self) -> Duration {
        Duration::from_millis(self.dial_timeout_ms)
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms)
    }

    pub fn write_timeout(&self) -> Duration {
        Duration::from_millis(self.write_timeout_ms)
    }

    /// Base delay between reconnect attempts
    pub fn min_retry_backoff(&self) -> Duration {
        Duration::from_millis(self.min_retry_backoff_ms)
    }

    pub fn max_retry_backoff(&self) -> Duration {
        Duration::from_millis(self.max_retry_backoff_ms)
    }
}

impl ConsumerConfig {
    pub fn validate(&self) -> Result<()> {
        if self.block_duration_ms == 0 {
            return Err(EventBusError::Configuration("consumer block_duration_ms must be positive".to_string()));
        }
        if self.batch_size == 0 {
            return Err(EventBusError::Configuration("consumer batch_size must be positive".to_string()));
        }
        if self.max_concurrency == 0 {
            return Err(EventBusError::Configuration("consumer max_concurrency must be positive".to_string()));
        }
        Ok(())
    }

    /// Fill in a unique consumer id when none was configured.
    pub fn ensure_consumer_id(&mut self) {
        if self.consumer_id.trim().is_empty() {
            self.consumer_id = generate_consumer_id();
        }
    }

    pub fn block_duration(&self) -> Duration {
        Duration::from_millis(self.block_duration_ms)
    }
}

/// `<host>-<uuid>`, falling back to a fixed prefix when the host is unknown.
pub fn generate_consumer_id() -> String {
    let host = std::env::var("HOSTNAME")
        .ok()
        .filter(|h| !h.trim().is_empty())
        .unwrap_or_else(|| "events-bus".to_string());
    format!("{}-{}", host, Uuid::new_v4())
}
