use tracing::{debug, info};

use crate::brokers::{BrokerError, StreamBroker, STREAM_START};
use crate::error::{EventBusError, Result};

/// Create `group` on `stream` from the very first entry, so a new group
/// works through the backlog. An existing group is left untouched.
pub async fn ensure_group(broker: &dyn StreamBroker, stream: &str, group: &str) -> Result<()> {
    match broker.create_group(stream, group, STREAM_START).await {
        Ok(()) => {
            info!(stream = %stream, group = %group, "Created consumer group");
            Ok(())
        }
        Err(BrokerError::GroupExists) => {
            debug!(stream = %stream, group = %group, "Consumer group already exists");
            Ok(())
        }
        Err(e) => Err(EventBusError::subscription("failed to create consumer group", e)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::brokers::MockStreamBroker;
    use mockall::predicate::eq;

    #[tokio::test]
    async fn test_existing_group_is_success() {
        let mut broker = MockStreamBroker::new();
        broker
            .expect_create_group()
            .with(eq("events:users"), eq("mailer"), eq("0"))
            .times(1)
            .returning(|_, _, _| Err(BrokerError::GroupExists));

        assert!(ensure_group(&broker, "events:users", "mailer").await.is_ok());
    }

    #[tokio::test]
    async fn test_other_failures_surface_as_subscription_failed() {
        let mut broker = MockStreamBroker::new();
        broker
            .expect_create_group()
            .returning(|_, _, _| Err(BrokerError::Command("WRONGTYPE".to_string())));

        let err = ensure_group(&broker, "events:users", "mailer").await.unwrap_err();
        assert!(matches!(err, EventBusError::SubscriptionFailed(_)));
        assert!(err.to_string().contains("WRONGTYPE"));
    }
}
