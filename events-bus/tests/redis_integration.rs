//! Redis Streams Broker Tests
//!
//! To run these tests:
//! 1. Ensure Redis (5.0+) is running, e.g. `docker run -p 6379:6379 redis:7`
//! 2. Optionally point REDIS_URL at it (default redis://localhost:6379/0)
//! 3. cargo test --test redis_integration -- --ignored --test-threads=1
//!
//! Every test works on its own uniquely named stream.

use events_bus::brokers::{BrokerError, StreamBroker};
use events_bus::events::UserRegisteredEvent;
use events_bus::message::StreamMessage;
use events_bus::*;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

fn redis_config() -> RedisConfig {
    RedisConfig {
        dsn: std::env::var("REDIS_URL").unwrap_or_else(|_| "redis://localhost:6379/0".to_string()),
        ..RedisConfig::default()
    }
}

async fn setup_broker() -> Arc<RedisStreamBroker> {
    Arc::new(
        RedisStreamBroker::connect(&redis_config())
            .await
            .expect("Failed to connect to Redis"),
    )
}

fn test_stream() -> String {
    format!("test:events:{}", Uuid::new_v4())
}

#[tokio::test]
#[ignore] // Run with: cargo test --test redis_integration -- --ignored
async fn test_redis_ping() {
    let broker = setup_broker().await;
    broker.ping().await.unwrap();
}

#[tokio::test]
#[ignore]
async fn test_redis_group_creation_is_idempotent() {
    let broker = setup_broker().await;
    let stream = test_stream();

    broker.create_group(&stream, "g", "0").await.unwrap();
    assert_eq!(
        broker.create_group(&stream, "g", "0").await.unwrap_err(),
        BrokerError::GroupExists
    );
}

#[tokio::test]
#[ignore]
async fn test_redis_read_unknown_group() {
    let broker = setup_broker().await;
    let stream = test_stream();
    broker
        .append(&stream, vec![("payload".to_string(), "{}".to_string())])
        .await
        .unwrap();

    let err = broker
        .read_group(&stream, "missing", "c1", 1, Duration::from_millis(10))
        .await
        .unwrap_err();
    assert!(matches!(err, BrokerError::NoGroup { .. }));
}

#[tokio::test]
#[ignore]
async fn test_redis_append_read_ack() {
    let broker = setup_broker().await;
    let stream = test_stream();
    broker.create_group(&stream, "g", "0").await.unwrap();

    let ids = broker
        .append_batch(
            &stream,
            vec![
                vec![("payload".to_string(), "a".to_string())],
                vec![("payload".to_string(), "b".to_string())],
            ],
        )
        .await
        .unwrap();
    assert_eq!(ids.len(), 2);

    let batch = broker
        .read_group(&stream, "g", "c1", 10, Duration::from_millis(100))
        .await
        .unwrap();
    assert_eq!(batch.len(), 2);
    assert_eq!(batch[0].field("payload"), Some("a"));

    for entry in &batch {
        broker.ack(&stream, "g", &entry.id).await.unwrap();
    }

    // Nothing new for the group: the blocking read times out empty
    let empty = broker
        .read_group(&stream, "g", "c1", 10, Duration::from_millis(100))
        .await
        .unwrap();
    assert!(empty.is_empty());
}

#[tokio::test]
#[ignore]
async fn test_redis_end_to_end_retry_chain() {
    let broker = setup_broker().await;
    let stream = test_stream();
    let bus = EventBus::with_broker(broker.clone(), EventBusConfig::default());

    let calls = Arc::new(AtomicUsize::new(0));
    let handler = {
        let calls = calls.clone();
        move |_ctx: HandlerContext, _event: ReceivedEvent| {
            let calls = calls.clone();
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err::<(), _>(anyhow::anyhow!("always failing"))
            }
        }
    };

    let cancel = CancellationToken::new();
    let spec = SubscriptionSpec::new(stream.clone(), "g", "c1", handler)
        .block_duration(Duration::from_millis(200));
    let subscriber = bus.subscriber();
    let task = {
        let cancel = cancel.clone();
        tokio::spawn(async move { subscriber.subscribe(spec, cancel).await })
    };

    bus.publisher()
        .publish(&stream, &UserRegisteredEvent::new("u-1", "ada@example.com"))
        .await
        .unwrap();

    let deadline = Instant::now() + Duration::from_secs(10);
    while calls.load(Ordering::SeqCst) < 3 {
        assert!(Instant::now() < deadline, "expected three attempts");
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    tokio::time::sleep(Duration::from_millis(500)).await;

    cancel.cancel();
    let result = task.await.unwrap();
    assert!(matches!(result, Err(EventBusError::Cancelled)));
    assert_eq!(calls.load(Ordering::SeqCst), 3);

    // A fresh group replays the whole chain: attempts 1, 2 and 3
    broker.create_group(&stream, "audit", "0").await.unwrap();
    let chain = broker
        .read_group(&stream, "audit", "c1", 10, Duration::from_millis(100))
        .await
        .unwrap();
    let attempts: Vec<u32> = chain
        .iter()
        .map(|entry| StreamMessage::parse(entry).unwrap().attempt())
        .collect();
    assert_eq!(attempts, vec![1, 2, 3]);
}

#[tokio::test]
#[ignore]
async fn test_redis_closed_broker() {
    let broker = setup_broker().await;
    broker.close().await.unwrap();
    assert_eq!(broker.ping().await.unwrap_err(), BrokerError::Closed);
}
