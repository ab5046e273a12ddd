// Event capability and the base fields shared by every concrete event
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use uuid::Uuid;
use validator::{Validate, ValidationError, ValidationErrors};

use crate::error::{EventBusError, Result};
use crate::message::{StreamMessage, SCHEMA_VERSION};

/// Uniform capability the bus needs from any event.
///
/// The trait is object safe so heterogeneous batches can be published as
/// `&[&dyn Event]`.
pub trait Event: Send + Sync {
    fn event_type(&self) -> &str;

    fn event_id(&self) -> &str;

    fn event_time(&self) -> DateTime<Utc>;

    /// Run the event's field rules.
    fn validate(&self) -> std::result::Result<(), ValidationErrors>;

    /// JSON body stored in the `payload` field.
    fn to_payload(&self) -> serde_json::Result<String>;
}

/// Fields every event carries. Concrete events flatten this into their body.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Validate)]
pub struct BaseEvent {
    #[validate(length(min = 1, code = "required"))]
    pub id: String,

    #[serde(rename = "type")]
    #[validate(length(min = 1, code = "required"))]
    pub event_type: String,

    #[validate(custom(function = "validate_timestamp"))]
    pub timestamp: DateTime<Utc>,

    pub version: String,

    #[serde(default)]
    pub source: String,
}

impl BaseEvent {
    pub fn new(event_type: impl Into<String>, source: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            event_type: event_type.into(),
            timestamp: Utc::now(),
            version: SCHEMA_VERSION.to_string(),
            source: source.into(),
        }
    }
}

/// The Unix epoch stands in for "no timestamp".
fn validate_timestamp(timestamp: &DateTime<Utc>) -> std::result::Result<(), ValidationError> {
    if *timestamp == DateTime::<Utc>::UNIX_EPOCH {
        return Err(ValidationError::new("required"));
    }
    Ok(())
}

/// Implement [`Event`] for structs holding a `base: BaseEvent` field.
#[macro_export]
macro_rules! impl_event {
    ($($ty:ty),+ $(,)?) => {$(
        impl $crate::event::Event for $ty {
            fn event_type(&self) -> &str {
                &self.base.event_type
            }

            fn event_id(&self) -> &str {
                &self.base.id
            }

            fn event_time(&self) -> ::chrono::DateTime<::chrono::Utc> {
                self.base.timestamp
            }

            fn validate(&self) -> ::std::result::Result<(), ::validator::ValidationErrors> {
                ::validator::Validate::validate(self)
            }

            fn to_payload(&self) -> ::serde_json::Result<String> {
                ::serde_json::to_string(self)
            }
        }
    )+};
}

impl Event for BaseEvent {
    fn event_type(&self) -> &str {
        &self.event_type
    }

    fn event_id(&self) -> &str {
        &self.id
    }

    fn event_time(&self) -> DateTime<Utc> {
        self.timestamp
    }

    fn validate(&self) -> std::result::Result<(), ValidationErrors> {
        Validate::validate(self)
    }

    fn to_payload(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}

/// An event as delivered to a handler.
///
/// Carries the decoded metadata plus the raw payload; [`ReceivedEvent::decode`]
/// turns the payload into a concrete event type.
#[derive(Debug, Clone, PartialEq)]
pub struct ReceivedEvent {
    /// Broker id of the delivery this event came from
    pub message_id: String,
    pub id: String,
    pub event_type: String,
    pub timestamp: DateTime<Utc>,
    pub version: String,
    pub attempt: u32,
    pub payload: String,
}

impl ReceivedEvent {
    pub fn from_message(message: &StreamMessage) -> Self {
        Self {
            message_id: message.id.clone(),
            id: message.metadata.id.clone(),
            event_type: message.metadata.event_type.clone(),
            timestamp: message.metadata.event_time(),
            version: message.metadata.version.clone(),
            attempt: message.metadata.attempt,
            payload: message.payload.clone(),
        }
    }

    pub fn decode<T: DeserializeOwned>(&self) -> Result<T> {
        serde_json::from_str(&self.payload).map_err(|e| {
            EventBusError::Serialization(format!("failed to decode {} payload: {}", self.event_type, e))
        })
    }
}

impl Event for ReceivedEvent {
    fn event_type(&self) -> &str {
        &self.event_type
    }

    fn event_id(&self) -> &str {
        &self.id
    }

    fn event_time(&self) -> DateTime<Utc> {
        self.timestamp
    }

    /// Delivered events were validated before publication.
    fn validate(&self) -> std::result::Result<(), ValidationErrors> {
        Ok(())
    }

    fn to_payload(&self) -> serde_json::Result<String> {
        Ok(self.payload.clone())
    }
}
