//! Typed event bus over consumer-group streams
//!
//! Services publish validated events onto named streams and consume them
//! through consumer groups with at-least-once delivery:
//! - Redis Streams backend (`XADD`, `XGROUP`, `XREADGROUP`, `XACK`) and an
//!   in-process backend with the same semantics
//! - Load sharing between the consumers of a group
//! - Bounded concurrency per subscription
//! - Bounded retries with exponential backoff, then drop (optionally through
//!   a dead-letter hook)
//! - Malformed messages acknowledged and skipped
//!
//! # Example
//!
//! ```rust,no_run
//! use events_bus::events::{UserRegisteredEvent, STREAM_USERS};
//! use events_bus::{EventBus, EventBusConfig, HandlerContext, ReceivedEvent, SubscriptionSpec};
//! use tokio_util::sync::CancellationToken;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let bus = EventBus::connect(EventBusConfig::load(None)?).await?;
//!
//!     // Publish an event
//!     let event = UserRegisteredEvent::new("user-123", "user@example.com");
//!     bus.publisher().publish(STREAM_USERS, &event).await?;
//!
//!     // Consume until cancelled
//!     let spec = SubscriptionSpec::new(
//!         STREAM_USERS,
//!         "welcome-mailer",
//!         "mailer-1",
//!         |_ctx: HandlerContext, event: ReceivedEvent| async move {
//!             let user: UserRegisteredEvent = event.decode()?;
//!             println!("Welcome {}", user.email);
//!             Ok::<(), anyhow::Error>(())
//!         },
//!     )
//!     .batch_size(10)
//!     .max_concurrency(5);
//!
//!     let cancel = CancellationToken::new();
//!     bus.subscriber().subscribe(spec, cancel).await?;
//!     Ok(())
//! }
//! ```

pub mod brokers;
pub mod bus;
pub mod config;
pub mod error;
pub mod event;
pub mod events;
pub mod handlers;
pub mod message;
pub mod publisher;
pub mod subscriber;
pub mod validation;

pub use brokers::{InMemoryStreamBroker, RedisStreamBroker, StreamBroker};
pub use bus::EventBus;
pub use config::{BrokerBackend, ConsumerConfig, EventBusConfig, RedisConfig};
pub use error::{EventBusError, Result};
pub use event::{BaseEvent, Event, ReceivedEvent};
pub use handlers::{DeadLetterHook, EventHandler, HandlerContext, LogDeadLetters};
pub use message::{EventMetadata, StreamMessage};
pub use publisher::Publisher;
pub use subscriber::{Subscriber, SubscriberStats, SubscriptionSpec};
pub use validation::EventValidator;
