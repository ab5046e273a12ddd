// Event publishing
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, info};

use crate::brokers::{BrokerError, EntryFields, StreamBroker};
use crate::error::{EventBusError, Result};
use crate::event::Event;
use crate::message::{encode_fields, EventMetadata};
use crate::validation::EventValidator;

/// Validates events and appends them to streams.
pub struct Publisher {
    broker: Arc<dyn StreamBroker>,
    validator: EventValidator,
    closed: AtomicBool,
}

impl Publisher {
    pub fn new(broker: Arc<dyn StreamBroker>, validator: EventValidator) -> Self {
        Self {
            broker,
            validator,
            closed: AtomicBool::new(false),
        }
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(EventBusError::ConnectionClosed);
        }
        Ok(())
    }

    /// Validate and append one event, returning its broker id.
    pub async fn publish(&self, stream: &str, event: &dyn Event) -> Result<String> {
        self.ensure_open()?;
        self.validator.validate(event)?;

        let fields = encode(event)?;
        let id = self
            .broker
            .append(stream, fields)
            .await
            .map_err(EventBusError::publish)?;

        debug!(
            stream = %stream,
            id = %id,
            event_id = %event.event_id(),
            event_type = %event.event_type(),
            "Published event"
        );
        Ok(id)
    }

    /// Append several events in one round trip.
    ///
    /// Every event is validated before anything is sent, so one invalid event
    /// means nothing is published.
    pub async fn publish_batch(&self, stream: &str, events: &[&dyn Event]) -> Result<Vec<String>> {
        self.ensure_open()?;
        if events.is_empty() {
            return Ok(Vec::new());
        }

        for event in events {
            self.validator.validate(*event)?;
        }

        let entries = events
            .iter()
            .map(|event| encode(*event))
            .collect::<Result<Vec<_>>>()?;

        let ids = self
            .broker
            .append_batch(stream, entries)
            .await
            .map_err(EventBusError::publish)?;

        info!(stream = %stream, count = ids.len(), "Published event batch");
        Ok(ids)
    }

    pub async fn health(&self) -> Result<()> {
        self.ensure_open()?;
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
}

fn encode(event: &dyn Event) -> Result<EntryFields> {
    let payload = event.to_payload()?;
    let metadata = EventMetadata::first(event.event_id(), event.event_type(), event.event_time());
    Ok(encode_fields(&metadata, &payload)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::brokers::{InMemoryStreamBroker, MockStreamBroker};
    use crate::events::{UserLocationUpdatedEvent, UserRegisteredEvent};
    use crate::message::StreamMessage;

    fn publisher() -> (Publisher, Arc<InMemoryStreamBroker>) {
        let broker = Arc::new(InMemoryStreamBroker::new());
        (Publisher::new(broker.clone(), EventValidator::new()), broker)
    }

    #[tokio::test]
    async fn test_publish_writes_metadata_and_payload() {
        let (publisher, broker) = publisher();
        let event = UserRegisteredEvent::new("u-1", "ada@example.com");

        let id = publisher.publish("events:users", &event).await.unwrap();

        let entries = broker.entries("events:users");
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].id, id);

        let message = StreamMessage::parse(&entries[0]).unwrap();
        assert_eq!(message.metadata.id, event.base.id);
        assert_eq!(message.metadata.event_type, "user.registered");
        assert_eq!(message.metadata.version, "1.0");
        assert_eq!(message.attempt(), 1);

        let payload: UserRegisteredEvent = serde_json::from_str(&message.payload).unwrap();
        assert_eq!(payload, event);
    }

    #[tokio::test]
    async fn test_invalid_event_is_not_published() {
        let (publisher, broker) = publisher();
        let event = UserRegisteredEvent::new("u-1", "not-an-email");

        let err = publisher.publish("events:users", &event).await.unwrap_err();
        assert!(matches!(err, EventBusError::InvalidEvent(_)));
        assert_eq!(broker.stream_len("events:users"), 0);
    }

    #[tokio::test]
    async fn test_batch_is_all_or_nothing() {
        let (publisher, broker) = publisher();
        let good = UserRegisteredEvent::new("u-1", "ada@example.com");
        let bad = UserLocationUpdatedEvent::new("u-1", 123.0, 0.0);

        let err = publisher
            .publish_batch("events:users", &[&good, &bad])
            .await
            .unwrap_err();
        assert!(matches!(err, EventBusError::InvalidEvent(_)));
        assert_eq!(broker.stream_len("events:users"), 0);

        let other = UserLocationUpdatedEvent::new("u-1", 12.0, 0.0);
        let ids = publisher
            .publish_batch("events:users", &[&good, &other])
            .await
            .unwrap();
        assert_eq!(ids.len(), 2);
        assert_eq!(broker.stream_len("events:users"), 2);
    }

    #[tokio::test]
    async fn test_empty_batch_is_a_no_op() {
        let mut broker = MockStreamBroker::new();
        broker.expect_append_batch().never();

        let publisher = Publisher::new(Arc::new(broker), EventValidator::new());
        assert!(publisher.publish_batch("events:users", &[]).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_broker_rejection_is_publish_failed() {
        let mut broker = MockStreamBroker::new();
        broker
            .expect_append()
            .returning(|_, _| Err(BrokerError::Command("OOM".to_string())));

        let publisher = Publisher::new(Arc::new(broker), EventValidator::new());
        let err = publisher
            .publish("events:users", &UserRegisteredEvent::new("u-1", "ada@example.com"))
            .await
            .unwrap_err();
        assert!(matches!(err, EventBusError::PublishFailed(_)));
    }

    #[tokio::test]
    async fn test_closed_publisher() {
        let (publisher, _) = publisher();
        publisher.close().await.unwrap();

        let err = publisher
            .publish("events:users", &UserRegisteredEvent::new("u-1", "ada@example.com"))
            .await
            .unwrap_err();
        assert!(matches!(err, EventBusError::ConnectionClosed));
        assert!(matches!(publisher.health().await, Err(EventBusError::ConnectionClosed)));
    }
}
