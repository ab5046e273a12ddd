use thiserror::Error;

use crate::brokers::BrokerError;

#[derive(Error, Debug)]
pub enum EventBusError {
    #[error("invalid event: {0}")]
    InvalidEvent(String),

    #[error("failed to publish event: {0}")]
    PublishFailed(String),

    #[error("failed to subscribe: {0}")]
    SubscriptionFailed(String),

    #[error("connection closed")]
    ConnectionClosed,

    /// The subscription's cancellation token fired.
    #[error("subscription cancelled")]
    Cancelled,

    #[error("serialization failed: {0}")]
    Serialization(String),

    #[error("invalid configuration: {0}")]
    Configuration(String),

    #[error("broker connection failed: {0}")]
    Connection(String),

    #[error("Internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

pub type Result<T> = std::result::Result<T, EventBusError>;

impl EventBusError {
    /// Map a broker failure raised while appending.
    pub fn publish(err: BrokerError) -> Self {
        match err {
            BrokerError::Closed => EventBusError::ConnectionClosed,
            other => EventBusError::PublishFailed(other.to_string()),
        }
    }

    /// Map a broker failure raised while creating a group or reading a batch.
    pub fn subscription(context: &str, err: BrokerError) -> Self {
        match err {
            BrokerError::Closed => EventBusError::ConnectionClosed,
            other => EventBusError::SubscriptionFailed(format!("{}: {}", context, other)),
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, EventBusError::Cancelled)
    }

    /// Whether retrying the same operation later may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            EventBusError::PublishFailed(_)
                | EventBusError::SubscriptionFailed(_)
                | EventBusError::Connection(_)
        )
    }
}

impl From<serde_json::Error> for EventBusError {
    fn from(err: serde_json::Error) -> Self {
        EventBusError::Serialization(err.to_string())
    }
}

impl From<config::ConfigError> for EventBusError {
    fn from(err: config::ConfigError) -> Self {
        EventBusError::Configuration(err.to_string())
    }
}
