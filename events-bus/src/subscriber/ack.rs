use std::sync::Arc;
use tracing::{debug, warn};

use crate::brokers::StreamBroker;

/// Resolves deliveries so they leave the group's pending set.
pub struct Acknowledger {
    broker: Arc<dyn StreamBroker>,
    stream: String,
    group: String,
}

impl Acknowledger {
    pub fn new(broker: Arc<dyn StreamBroker>, stream: impl Into<String>, group: impl Into<String>) -> Self {
        Self {
            broker,
            stream: stream.into(),
            group: group.into(),
        }
    }

    /// Acknowledge delivery `id`. Failures are logged and reported as `false`;
    /// the entry then simply stays pending.
    pub async fn ack(&self, id: &str) -> bool {
        match self.broker.ack(&self.stream, &self.group, id).await {
            Ok(()) => {
                debug!(stream = %self.stream, group = %self.group, id = %id, "Acknowledged message");
                true
            }
            Err(e) => {
                warn!(stream = %self.stream, group = %self.group, id = %id, error = %e, "Failed to acknowledge message");
                false
            }
        }
    }
}
