// Event bus facade: one broker shared by a publisher and a subscriber
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

use crate::brokers::{BrokerError, InMemoryStreamBroker, RedisStreamBroker, StreamBroker};
use crate::config::{BrokerBackend, EventBusConfig};
use crate::error::{EventBusError, Result};
use crate::publisher::Publisher;
use crate::subscriber::Subscriber;
use crate::validation::EventValidator;

/// Upper bound on the connectivity check done while connecting.
pub const CONNECT_PING_TIMEOUT: Duration = Duration::from_secs(5);

pub struct EventBus {
    broker: Arc<dyn StreamBroker>,
    publisher: Arc<Publisher>,
    subscriber: Arc<Subscriber>,
    config: EventBusConfig,
}

impl EventBus {
    /// Build the configured broker and make sure it answers.
    pub async fn connect(config: EventBusConfig) -> Result<Self> {
        config.validate()?;

        let broker: Arc<dyn StreamBroker> = match config.backend {
            BrokerBackend::Redis => Arc::new(
                RedisStreamBroker::connect(&config.redis)
                    .await
                    .map_err(|e| EventBusError::Connection(e.to_string()))?,
            ),
            BrokerBackend::Memory => Arc::new(InMemoryStreamBroker::new()),
        };

        match tokio::time::timeout(CONNECT_PING_TIMEOUT, broker.ping()).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => return Err(EventBusError::Connection(format!("ping failed: {}", e))),
            Err(_) => {
                return Err(EventBusError::Connection(format!(
                    "ping timed out after {:?}",
                    CONNECT_PING_TIMEOUT
                )))
            }
        }

        info!(backend = ?config.backend, "Event bus connected");
        Ok(Self::with_broker(broker, config))
    }

    /// Bus over a fresh in-process broker.
    pub fn in_memory() -> Self {
        let config = EventBusConfig {
            backend: BrokerBackend::Memory,
            ..EventBusConfig::default()
        };
        Self::with_broker(Arc::new(InMemoryStreamBroker::new()), config)
    }

    pub fn with_broker(broker: Arc<dyn StreamBroker>, config: EventBusConfig) -> Self {
        Self {
            publisher: Arc::new(Publisher::new(broker.clone(), EventValidator::new())),
            subscriber: Arc::new(Subscriber::new(broker.clone())),
            broker,
            config,
        }
    }

    pub fn publisher(&self) -> Arc<Publisher> {
        self.publisher.clone()
    }

    pub fn subscriber(&self) -> Arc<Subscriber> {
        self.subscriber.clone()
    }

    pub fn broker(&self) -> Arc<dyn StreamBroker> {
        self.broker.clone()
    }

    pub fn config(&self) -> &EventBusConfig {
        &self.config
    }

    pub async fn health(&self) -> Result<()> {
        self.broker.ping().await.map_err(|e| match e {
            BrokerError::Closed => EventBusError::ConnectionClosed,
            other => EventBusError::Connection(other.to_string()),
        })
    }

    /// Close the publisher, the subscriber and the shared broker.
    pub async fn close(&self) -> Result<()> {
        self.publisher.close().await?;
        self.subscriber.close().await?;
        info!("Event bus closed");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{UserRegisteredEvent, STREAM_USERS};

    #[tokio::test]
    async fn test_connect_memory_backend() {
        let config = EventBusConfig {
            backend: BrokerBackend::Memory,
            ..EventBusConfig::default()
        };
        let bus = EventBus::connect(config).await.unwrap();
        assert!(bus.health().await.is_ok());
    }

    #[tokio::test]
    async fn test_connect_rejects_invalid_config() {
        let mut config = EventBusConfig::default();
        config.consumer.max_concurrency = 0;
        assert!(matches!(
            EventBus::connect(config).await,
            Err(EventBusError::Configuration(_))
        ));
    }

    #[tokio::test]
    async fn test_close_shuts_everything() {
        let bus = EventBus::in_memory();
        let publisher = bus.publisher();
        publisher
            .publish(STREAM_USERS, &UserRegisteredEvent::new("u-1", "ada@example.com"))
            .await
            .unwrap();

        bus.close().await.unwrap();

        assert!(matches!(bus.health().await, Err(EventBusError::ConnectionClosed)));
        assert!(matches!(
            publisher
                .publish(STREAM_USERS, &UserRegisteredEvent::new("u-2", "bob@example.com"))
                .await,
            Err(EventBusError::ConnectionClosed)
        ));
        assert!(matches!(bus.subscriber().health().await, Err(EventBusError::ConnectionClosed)));
    }
}
