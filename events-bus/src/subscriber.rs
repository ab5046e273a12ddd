//! Consumer-group subscription engine.
//!
//! [`Subscriber::subscribe`] makes sure the consumer group exists, then runs a
//! pull loop: read a batch of never-delivered entries, fan each one out to its
//! own worker behind a [`ConcurrencyLimiter`], wait for the whole batch, read
//! again. Workers decode the entry, run the handler under a deadline, resubmit
//! or drop failed events and acknowledge the delivery they were given.
//!
//! The loop only ends when its cancellation token fires or the broker fails.

pub mod ack;
pub mod group;
pub mod limiter;
pub mod retry;
pub mod stats;
pub mod worker;

pub use self::group::ensure_group;
pub use self::limiter::ConcurrencyLimiter;
pub use self::retry::{backoff_delay, MAX_ATTEMPTS};
pub use self::stats::SubscriberStats;
pub use self::worker::Disposition;

use futures::future::join_all;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use self::stats::StatsCounters;
use self::worker::MessageProcessor;
use crate::brokers::{BrokerError, StreamBroker};
use crate::config::{generate_consumer_id, ConsumerConfig};
use crate::error::{EventBusError, Result};
use crate::handlers::{DeadLetterHook, EventHandler};

const DEFAULT_BATCH_SIZE: usize = 1;
const DEFAULT_BLOCK_DURATION: Duration = Duration::from_secs(1);
const DEFAULT_MAX_CONCURRENCY: usize = 1;

/// What to consume and how. Fixed for the lifetime of one `subscribe` call.
#[derive(Clone)]
pub struct SubscriptionSpec {
    pub stream: String,
    pub group: String,
    /// Unique per process within the group
    pub consumer_id: String,
    handler: Arc<dyn EventHandler>,
    batch_size: usize,
    block_duration: Duration,
    max_concurrency: usize,
    dead_letter: Option<Arc<dyn DeadLetterHook>>,
}

impl SubscriptionSpec {
    pub fn new<H>(
        stream: impl Into<String>,
        group: impl Into<String>,
        consumer_id: impl Into<String>,
        handler: H,
    ) -> Self
    where
        H: EventHandler + 'static,
    {
        Self::with_shared_handler(stream, group, consumer_id, Arc::new(handler))
    }

    pub fn with_shared_handler(
        stream: impl Into<String>,
        group: impl Into<String>,
        consumer_id: impl Into<String>,
        handler: Arc<dyn EventHandler>,
    ) -> Self {
        Self {
            stream: stream.into(),
            group: group.into(),
            consumer_id: consumer_id.into(),
            handler,
            batch_size: DEFAULT_BATCH_SIZE,
            block_duration: DEFAULT_BLOCK_DURATION,
            max_concurrency: DEFAULT_MAX_CONCURRENCY,
            dead_letter: None,
        }
    }

    /// Build from loaded configuration; an empty consumer id gets generated.
    pub fn from_config<H>(stream: impl Into<String>, config: &ConsumerConfig, handler: H) -> Self
    where
        H: EventHandler + 'static,
    {
        let consumer_id = if config.consumer_id.trim().is_empty() {
            generate_consumer_id()
        } else {
            config.consumer_id.clone()
        };

        Self::new(stream, config.group.clone(), consumer_id, handler)
            .batch_size(config.batch_size)
            .block_duration(config.block_duration())
            .max_concurrency(config.max_concurrency)
    }

    /// Entries requested per read. Zero means the default of 1.
    pub fn batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }

    /// Longest a read blocks waiting for entries, also the handler deadline.
    /// Zero means the default of 1s.
    pub fn block_duration(mut self, block_duration: Duration) -> Self {
        self.block_duration = block_duration;
        self
    }

    /// Workers allowed to run at once. Zero means the default of 1.
    pub fn max_concurrency(mut self, max_concurrency: usize) -> Self {
        self.max_concurrency = max_concurrency;
        self
    }

    pub fn dead_letter(mut self, hook: impl DeadLetterHook + 'static) -> Self {
        self.dead_letter = Some(Arc::new(hook));
        self
    }

    fn normalized(mut self) -> Self {
        if self.batch_size == 0 {
            self.batch_size = DEFAULT_BATCH_SIZE;
        }
        if self.block_duration.is_zero() {
            self.block_duration = DEFAULT_BLOCK_DURATION;
        }
        if self.max_concurrency == 0 {
            self.max_concurrency = DEFAULT_MAX_CONCURRENCY;
        }
        self
    }

    fn check(&self) -> Result<()> {
        for (name, value) in [
            ("stream", &self.stream),
            ("consumer group", &self.group),
            ("consumer id", &self.consumer_id),
        ] {
            if value.trim().is_empty() {
                return Err(EventBusError::SubscriptionFailed(format!("{} must not be empty", name)));
            }
        }
        Ok(())
    }
}

impl std::fmt::Debug for SubscriptionSpec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubscriptionSpec")
            .field("stream", &self.stream)
            .field("group", &self.group)
            .field("consumer_id", &self.consumer_id)
            .field("batch_size", &self.batch_size)
            .field("block_duration", &self.block_duration)
            .field("max_concurrency", &self.max_concurrency)
            .field("dead_letter", &self.dead_letter.is_some())
            .finish()
    }
}

/// Consumes streams through consumer groups.
pub struct Subscriber {
    broker: Arc<dyn StreamBroker>,
    stats: Arc<StatsCounters>,
    closed: AtomicBool,
}

impl Subscriber {
    pub fn new(broker: Arc<dyn StreamBroker>) -> Self {
        Self {
            broker,
            stats: Arc::new(StatsCounters::default()),
            closed: AtomicBool::new(false),
        }
    }

    /// Consume `spec.stream` until `cancel` fires.
    ///
    /// Returns [`EventBusError::Cancelled`] once every worker of the last
    /// dispatched batch has finished. Deliveries interrupted by cancellation
    /// stay pending in the group.
    pub async fn subscribe(&self, spec: SubscriptionSpec, cancel: CancellationToken) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(EventBusError::ConnectionClosed);
        }

        let spec = spec.normalized();
        spec.check()?;

        ensure_group(self.broker.as_ref(), &spec.stream, &spec.group).await?;

        info!(
            stream = %spec.stream,
            group = %spec.group,
            consumer = %spec.consumer_id,
            batch_size = spec.batch_size,
            max_concurrency = spec.max_concurrency,
            "Subscription started"
        );

        let limiter = ConcurrencyLimiter::new(spec.max_concurrency);
        let processor = Arc::new(MessageProcessor::new(
            self.broker.clone(),
            &spec.stream,
            &spec.group,
            &spec.consumer_id,
            spec.handler.clone(),
            spec.block_duration,
            spec.dead_letter.clone(),
            self.stats.clone(),
        ));

        loop {
            let read = tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                read = self.broker.read_group(
                    &spec.stream,
                    &spec.group,
                    &spec.consumer_id,
                    spec.batch_size,
                    spec.block_duration,
                ) => read,
            };

            let entries = match read {
                Ok(entries) => entries,
                Err(e) => {
                    error!(stream = %spec.stream, group = %spec.group, error = %e, "Failed to read from stream");
                    return Err(EventBusError::subscription("failed to read from stream", e));
                }
            };

            if entries.is_empty() {
                continue;
            }
            debug!(stream = %spec.stream, count = entries.len(), "Dispatching batch");

            let total = entries.len();
            let mut workers = Vec::with_capacity(total);
            for entry in entries {
                let permit = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => break,
                    permit = limiter.acquire() => permit,
                };
                let permit = match permit {
                    Ok(permit) => permit,
                    Err(e) => {
                        join_workers(workers).await;
                        return Err(e);
                    }
                };

                let processor = processor.clone();
                let cancel = cancel.clone();
                workers.push(tokio::spawn(async move {
                    let _permit = permit;
                    processor.process(entry, cancel).await
                }));
            }

            let undispatched = total - workers.len();
            join_workers(workers).await;

            if undispatched > 0 {
                debug!(stream = %spec.stream, undispatched, "Cancelled mid-batch, leaving rest pending");
                self.stats.abandoned(undispatched as u64);
            }
            if cancel.is_cancelled() {
                break;
            }
        }

        info!(stream = %spec.stream, group = %spec.group, consumer = %spec.consumer_id, "Subscription cancelled");
        Err(EventBusError::Cancelled)
    }

    pub async fn health(&self) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(EventBusError::ConnectionClosed);
        }
        self.broker.ping().await.map_err(|e| match e {
            BrokerError::Closed => EventBusError::ConnectionClosed,
            other => EventBusError::Connection(other.to_string()),
        })
    }

    /// Close the underlying broker. Later calls fail with `ConnectionClosed`.
    pub async fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        self.broker
            .close()
            .await
            .map_err(|e| EventBusError::Connection(e.to_string()))
    }

    pub fn stats(&self) -> SubscriberStats {
        self.stats.snapshot()
    }
}

async fn join_workers(workers: Vec<tokio::task::JoinHandle<Disposition>>) {
    for joined in join_all(workers).await {
        if let Err(e) = joined {
            error!(error = %e, "Worker task failed, message left pending");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::brokers::MockStreamBroker;
    use crate::event::ReceivedEvent;
    use crate::handlers::HandlerContext;

    fn noop() -> impl EventHandler {
        |_ctx: HandlerContext, _event: ReceivedEvent| async { Ok::<(), anyhow::Error>(()) }
    }

    #[test]
    fn test_zero_values_are_normalized() {
        let spec = SubscriptionSpec::new("s", "g", "c", noop())
            .batch_size(0)
            .block_duration(Duration::ZERO)
            .max_concurrency(0)
            .normalized();

        assert_eq!(spec.batch_size, 1);
        assert_eq!(spec.block_duration, Duration::from_secs(1));
        assert_eq!(spec.max_concurrency, 1);
    }

    #[test]
    fn test_from_config() {
        let config = ConsumerConfig {
            group: "mailer".to_string(),
            ..ConsumerConfig::default()
        };
        let spec = SubscriptionSpec::from_config("events:users", &config, noop());

        assert_eq!(spec.group, "mailer");
        assert!(!spec.consumer_id.is_empty());
        assert_eq!(spec.batch_size, 10);
        assert_eq!(spec.max_concurrency, 5);
        assert_eq!(spec.block_duration, Duration::from_secs(1));
    }

    #[tokio::test]
    async fn test_empty_names_are_rejected_before_touching_the_broker() {
        let broker = MockStreamBroker::new();
        let subscriber = Subscriber::new(Arc::new(broker));

        let err = subscriber
            .subscribe(SubscriptionSpec::new("s", "", "c", noop()), CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, EventBusError::SubscriptionFailed(_)));
    }

    #[tokio::test]
    async fn test_read_failure_ends_subscription() {
        let mut broker = MockStreamBroker::new();
        broker.expect_create_group().returning(|_, _, _| Ok(()));
        broker
            .expect_read_group()
            .times(1)
            .returning(|_, _, _, _, _| Err(BrokerError::Command("ERR boom".to_string())));

        let subscriber = Subscriber::new(Arc::new(broker));
        let err = subscriber
            .subscribe(SubscriptionSpec::new("s", "g", "c", noop()), CancellationToken::new())
            .await
            .unwrap_err();

        assert!(matches!(err, EventBusError::SubscriptionFailed(_)));
        assert!(err.to_string().contains("failed to read from stream"));
    }

    #[tokio::test]
    async fn test_read_timeout_ends_subscription() {
        let mut broker = MockStreamBroker::new();
        broker.expect_create_group().returning(|_, _, _| Ok(()));
        broker
            .expect_read_group()
            .times(1)
            .returning(|_, _, _, _, _| Err(BrokerError::Timeout(Duration::from_secs(4))));

        let subscriber = Subscriber::new(Arc::new(broker));
        let result = tokio::time::timeout(
            Duration::from_secs(1),
            subscriber.subscribe(SubscriptionSpec::new("s", "g", "c", noop()), CancellationToken::new()),
        )
        .await
        .expect("subscribe should return instead of retrying the read");

        let err = result.unwrap_err();
        assert!(matches!(err, EventBusError::SubscriptionFailed(_)));
        assert!(err.to_string().contains("failed to read from stream"));
    }

    #[tokio::test]
    async fn test_group_creation_failure_ends_subscription() {
        let mut broker = MockStreamBroker::new();
        broker
            .expect_create_group()
            .returning(|_, _, _| Err(BrokerError::Connection("refused".to_string())));
        broker.expect_read_group().never();

        let subscriber = Subscriber::new(Arc::new(broker));
        let err = subscriber
            .subscribe(SubscriptionSpec::new("s", "g", "c", noop()), CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, EventBusError::SubscriptionFailed(_)));
    }

    #[tokio::test]
    async fn test_closed_subscriber() {
        let mut broker = MockStreamBroker::new();
        broker.expect_close().times(1).returning(|| Ok(()));

        let subscriber = Subscriber::new(Arc::new(broker));
        subscriber.close().await.unwrap();
        subscriber.close().await.unwrap();

        assert!(matches!(subscriber.health().await, Err(EventBusError::ConnectionClosed)));
        let err = subscriber
            .subscribe(SubscriptionSpec::new("s", "g", "c", noop()), CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, EventBusError::ConnectionClosed));
    }
}
