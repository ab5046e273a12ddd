//! Stream broker seam.
//!
//! The engine only ever talks to a broker through [`StreamBroker`], which
//! exposes the handful of log-structured stream primitives it needs:
//! append, consumer-group creation, group reads with "never delivered"
//! semantics, acknowledgment and a connectivity ping.
//!
//! Two implementations ship with the crate:
//!
//! - [`RedisStreamBroker`]: Redis Streams (`XADD`, `XGROUP CREATE`,
//!   `XREADGROUP`, `XACK`) over pooled connections
//! - [`InMemoryStreamBroker`]: an in-process broker with the same
//!   consumer-group semantics, for tests and local development

pub mod memory;
pub mod redis_streams;

pub use self::memory::InMemoryStreamBroker;
pub use self::redis_streams::RedisStreamBroker;

use async_trait::async_trait;
use std::collections::HashMap;
use std::time::Duration;
use thiserror::Error;

/// Consumer group start offset that replays the whole stream.
pub const STREAM_START: &str = "0";

/// Field/value pairs of one stream entry, in insertion order.
pub type EntryFields = Vec<(String, String)>;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BrokerError {
    #[error("consumer group already exists")]
    GroupExists,

    #[error("no such consumer group '{group}' on stream '{stream}'")]
    NoGroup { stream: String, group: String },

    #[error("broker connection closed")]
    Closed,

    #[error("broker operation timed out after {0:?}")]
    Timeout(Duration),

    #[error("broker connection error: {0}")]
    Connection(String),

    #[error("broker command failed: {0}")]
    Command(String),
}

pub type BrokerResult<T> = std::result::Result<T, BrokerError>;

/// One entry as delivered by the broker: its broker-assigned id and raw fields.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamEntry {
    pub id: String,
    pub fields: HashMap<String, String>,
}

impl StreamEntry {
    pub fn new(id: impl Into<String>, fields: HashMap<String, String>) -> Self {
        Self {
            id: id.into(),
            fields,
        }
    }

    pub fn field(&self, name: &str) -> Option<&str> {
        self.fields.get(name).map(String::as_str)
    }
}

/// Broker primitives required by the publisher and the consumption engine.
///
/// Implementations must tolerate concurrent, interleaved calls from the pull
/// loop and every worker it spawns.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait StreamBroker: Send + Sync {
    /// Append one entry to `stream`, returning its broker-assigned id.
    async fn append(&self, stream: &str, fields: EntryFields) -> BrokerResult<String>;

    /// Append several entries in one pipelined, all-or-nothing round trip.
    async fn append_batch(&self, stream: &str, entries: Vec<EntryFields>) -> BrokerResult<Vec<String>>;

    /// Create `group` on `stream` (creating the stream if needed) starting at
    /// `start_id`. Reports [`BrokerError::GroupExists`] if it is already there.
    async fn create_group(&self, stream: &str, group: &str, start_id: &str) -> BrokerResult<()>;

    /// Read up to `count` entries never delivered to any consumer of `group`,
    /// blocking for at most `block`. An empty vec means nothing arrived.
    async fn read_group(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        count: usize,
        block: Duration,
    ) -> BrokerResult<Vec<StreamEntry>>;

    /// Remove `id` from the group's pending entries. Unknown ids are a no-op.
    async fn ack(&self, stream: &str, group: &str, id: &str) -> BrokerResult<()>;

    async fn ping(&self) -> BrokerResult<()>;

    /// Release connections. Every later call fails with [`BrokerError::Closed`].
    async fn close(&self) -> BrokerResult<()>;
}
