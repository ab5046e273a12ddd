use super::{BrokerError, BrokerResult, EntryFields, StreamBroker, StreamEntry};
use crate::config::RedisConfig;
use async_trait::async_trait;
use parking_lot::Mutex;
use redis::aio::ConnectionManager;
use redis::streams::{StreamReadOptions, StreamReadReply};
use redis::{AsyncCommands, RedisError, RedisResult};
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tracing::{debug, warn};

/// Redis Streams broker.
///
/// Appends, acknowledgments and group management share one multiplexed
/// [`ConnectionManager`]. Blocking `XREADGROUP` calls each check out a
/// dedicated connection from a small idle pool so a blocked read never
/// delays the commands queued behind it.
pub struct RedisStreamBroker {
    client: redis::Client,
    commands: ConnectionManager,
    readers: Mutex<Vec<ConnectionManager>>,
    config: RedisConfig,
    closed: AtomicBool,
}

impl RedisStreamBroker {
    /// Dial Redis and verify the command connection.
    pub async fn connect(config: &RedisConfig) -> BrokerResult<Self> {
        let client = redis::Client::open(config.dsn.as_str())
            .map_err(|e| BrokerError::Connection(format!("invalid redis dsn: {}", e)))?;

        let commands = dial(&client, config).await?;
        debug!(pool_size = config.pool_size, "Connected to Redis");

        Ok(Self {
            client,
            commands,
            readers: Mutex::new(Vec::with_capacity(config.pool_size)),
            config: config.clone(),
            closed: AtomicBool::new(false),
        })
    }

    fn ensure_open(&self) -> BrokerResult<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(BrokerError::Closed);
        }
        Ok(())
    }

    async fn checkout_reader(&self) -> BrokerResult<ConnectionManager> {
        let idle = self.readers.lock().pop();
        match idle {
            Some(conn) => Ok(conn),
            None => dial(&self.client, &self.config).await,
        }
    }

    fn checkin_reader(&self, conn: ConnectionManager) {
        if self.closed.load(Ordering::Acquire) {
            return;
        }
        let mut readers = self.readers.lock();
        if readers.len() < self.config.pool_size {
            readers.push(conn);
        }
    }
}

const BACKOFF_BASE: u64 = 2;

async fn dial(client: &redis::Client, config: &RedisConfig) -> BrokerResult<ConnectionManager> {
    let connect = ConnectionManager::new_with_backoff(
        client.clone(),
        BACKOFF_BASE,
        config.min_retry_backoff_ms.max(1),
        reconnect_retries(config),
    );
    bounded(config.dial_timeout(), connect).await
}

/// Reconnect attempts wait `min * 2^n` ms; stop before a wait would pass
/// `max_retry_backoff_ms`, and never exceed `max_retries`.
fn reconnect_retries(config: &RedisConfig) -> usize {
    let min = config.min_retry_backoff_ms.max(1);
    let max = config.max_retry_backoff_ms.max(min);
    let mut retries = 0;
    let mut delay = min.saturating_mul(BACKOFF_BASE);
    while retries < config.max_retries && delay <= max {
        retries += 1;
        delay = delay.saturating_mul(BACKOFF_BASE);
    }
    retries
}

fn block_millis(block: Duration) -> usize {
    usize::try_from(block.as_millis()).unwrap_or(usize::MAX)
}

/// Run a Redis call under `limit`, classifying whatever comes back.
async fn bounded<T, F>(limit: Duration, call: F) -> BrokerResult<T>
where
    F: Future<Output = RedisResult<T>>,
{
    match tokio::time::timeout(limit, call).await {
        Ok(result) => result.map_err(classify),
        Err(_) => Err(BrokerError::Timeout(limit)),
    }
}

fn classify(err: RedisError) -> BrokerError {
    if err.code() == Some("BUSYGROUP") {
        return BrokerError::GroupExists;
    }
    if err.is_io_error() || err.is_connection_dropped() || err.is_connection_refusal() {
        return BrokerError::Connection(err.to_string());
    }
    BrokerError::Command(err.to_string())
}

fn into_entries(reply: Option<StreamReadReply>) -> Vec<StreamEntry> {
    let Some(reply) = reply else {
        return Vec::new();
    };

    reply
        .keys
        .into_iter()
        .flat_map(|key| key.ids)
        .map(|stream_id| {
            let fields = stream_id
                .map
                .into_iter()
                .filter_map(|(name, value)| match redis::from_redis_value::<String>(&value) {
                    Ok(text) => Some((name, text)),
                    Err(e) => {
                        warn!(id = %stream_id.id, field = %name, error = %e, "Dropping non-string stream field");
                        None
                    }
                })
                .collect();
            StreamEntry::new(stream_id.id, fields)
        })
        .collect()
}

#[async_trait]
impl StreamBroker for RedisStreamBroker {
    async fn append(&self, stream: &str, fields: EntryFields) -> BrokerResult<String> {
        self.ensure_open()?;
        let mut conn = self.commands.clone();

        bounded(
            self.config.write_timeout(),
            conn.xadd::<_, _, _, _, String>(stream, "*", fields.as_slice()),
        )
        .await
    }

    async fn append_batch(&self, stream: &str, entries: Vec<EntryFields>) -> BrokerResult<Vec<String>> {
        self.ensure_open()?;
        if entries.is_empty() {
            return Ok(Vec::new());
        }

        let mut pipe = redis::pipe();
        pipe.atomic();
        for fields in &entries {
            pipe.xadd(stream, "*", fields.as_slice());
        }

        let mut conn = self.commands.clone();
        bounded(self.config.write_timeout(), pipe.query_async::<_, Vec<String>>(&mut conn)).await
    }

    async fn create_group(&self, stream: &str, group: &str, start_id: &str) -> BrokerResult<()> {
        self.ensure_open()?;
        let mut conn = self.commands.clone();

        bounded(
            self.config.write_timeout(),
            conn.xgroup_create_mkstream::<_, _, _, ()>(stream, group, start_id),
        )
        .await
    }

    async fn read_group(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        count: usize,
        block: Duration,
    ) -> BrokerResult<Vec<StreamEntry>> {
        self.ensure_open()?;

        let mut options = StreamReadOptions::default()
            .group(group, consumer)
            .count(count.max(1));
        if !block.is_zero() {
            options = options.block(block_millis(block));
        }

        let mut conn = self.checkout_reader().await?;
        let limit = block + self.config.read_timeout();
        let read = tokio::time::timeout(
            limit,
            conn.xread_options::<_, _, Option<StreamReadReply>>(&[stream], &[">"], &options),
        )
        .await;

        // Only connections that finished their command go back to the pool.
        match read {
            Ok(Ok(reply)) => {
                self.checkin_reader(conn);
                Ok(into_entries(reply))
            }
            Ok(Err(e)) if e.code() == Some("NOGROUP") => {
                self.checkin_reader(conn);
                Err(BrokerError::NoGroup {
                    stream: stream.to_string(),
                    group: group.to_string(),
                })
            }
            Ok(Err(e)) => Err(classify(e)),
            Err(_) => Err(BrokerError::Timeout(limit)),
        }
    }

    async fn ack(&self, stream: &str, group: &str, id: &str) -> BrokerResult<()> {
        self.ensure_open()?;
        let mut conn = self.commands.clone();

        bounded(
            self.config.write_timeout(),
            conn.xack::<_, _, _, i64>(stream, group, &[id]),
        )
        .await
        .map(|_| ())
    }

    async fn ping(&self) -> BrokerResult<()> {
        self.ensure_open()?;
        let mut conn = self.commands.clone();

        let pong = bounded(
            self.config.read_timeout(),
            redis::cmd("PING").query_async::<_, String>(&mut conn),
        )
        .await?;

        if pong == "PONG" {
            Ok(())
        } else {
            Err(BrokerError::Command(format!("unexpected PING reply: {}", pong)))
        }
    }

    async fn close(&self) -> BrokerResult<()> {
        self.closed.store(true, Ordering::Release);
        self.readers.lock().clear();
        debug!("Redis stream broker closed");
        Ok(())
    }
}
