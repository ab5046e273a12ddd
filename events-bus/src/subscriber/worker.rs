use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use super::ack::Acknowledger;
use super::retry::{decide, RetryCoordinator, RetryDecision, RetryOutcome};
use super::stats::StatsCounters;
use crate::brokers::{StreamBroker, StreamEntry};
use crate::event::ReceivedEvent;
use crate::handlers::{DeadLetterHook, EventHandler, HandlerContext};
use crate::message::StreamMessage;

/// How one delivery was resolved.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Disposition {
    /// Handled successfully
    Acknowledged,
    /// Failed, a copy with the next attempt was appended
    Resubmitted { retry_id: String },
    /// Final attempt failed, the event is gone
    Dropped,
    /// Metadata could not be decoded
    Malformed,
    /// Cancelled before resolution, left pending
    Abandoned,
    /// The retry copy could not be appended, original acknowledged and lost
    ResubmitFailed,
}

/// Runs the per-delivery pipeline: decode, handle, retry or drop, acknowledge.
pub(crate) struct MessageProcessor {
    stream: String,
    group: String,
    consumer: String,
    handler: Arc<dyn EventHandler>,
    handler_timeout: Duration,
    retry: RetryCoordinator,
    acker: Acknowledger,
    dead_letter: Option<Arc<dyn DeadLetterHook>>,
    stats: Arc<StatsCounters>,
}

impl MessageProcessor {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        broker: Arc<dyn StreamBroker>,
        stream: &str,
        group: &str,
        consumer: &str,
        handler: Arc<dyn EventHandler>,
        handler_timeout: Duration,
        dead_letter: Option<Arc<dyn DeadLetterHook>>,
        stats: Arc<StatsCounters>,
    ) -> Self {
        Self {
            stream: stream.to_string(),
            group: group.to_string(),
            consumer: consumer.to_string(),
            handler,
            handler_timeout,
            retry: RetryCoordinator::new(broker.clone(), stream),
            acker: Acknowledger::new(broker, stream, group),
            dead_letter,
            stats,
        }
    }

    pub(crate) async fn process(&self, entry: StreamEntry, cancel: CancellationToken) -> Disposition {
        self.stats.received();

        let message = match StreamMessage::parse(&entry) {
            Ok(message) => message,
            Err(e) => {
                warn!(stream = %self.stream, error = %e, "Skipping malformed message");
                self.stats.malformed();
                self.resolve(&entry.id).await;
                return Disposition::Malformed;
            }
        };

        let event = ReceivedEvent::from_message(&message);
        let ctx = HandlerContext::new(
            cancel.child_token(),
            Instant::now() + self.handler_timeout,
            &self.stream,
            &self.group,
            &self.consumer,
            &message.id,
            message.attempt(),
        );

        let outcome = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                debug!(id = %message.id, "Handler cancelled, leaving message pending");
                self.stats.abandoned(1);
                return Disposition::Abandoned;
            }
            result = tokio::time::timeout(self.handler_timeout, self.handler.handle(ctx, event.clone())) => {
                match result {
                    Ok(handled) => handled,
                    Err(_) => Err(anyhow::anyhow!("handler timed out after {:?}", self.handler_timeout)),
                }
            }
        };

        let err = match outcome {
            Ok(()) => {
                self.resolve(&message.id).await;
                return Disposition::Acknowledged;
            }
            Err(err) => err,
        };

        warn!(
            stream = %self.stream,
            id = %message.id,
            event_id = %event.id,
            event_type = %event.event_type,
            attempt = message.attempt(),
            error = %err,
            "Handler failed"
        );

        match decide(message.attempt()) {
            RetryDecision::Exhausted => {
                if let Some(hook) = &self.dead_letter {
                    hook.on_exhausted(&self.stream, &event, &err).await;
                }
                warn!(
                    stream = %self.stream,
                    event_id = %event.id,
                    attempt = message.attempt(),
                    "Max attempts reached, dropping event"
                );
                self.stats.dropped();
                self.resolve(&message.id).await;
                Disposition::Dropped
            }
            RetryDecision::Resubmit { delay, next_attempt } => {
                match self.retry.resubmit(&message, delay, &cancel).await {
                    RetryOutcome::Resubmitted(retry_id) => {
                        debug!(id = %message.id, retry_id = %retry_id, next_attempt, "Resubmitted event");
                        self.stats.retried();
                        self.resolve(&message.id).await;
                        Disposition::Resubmitted { retry_id }
                    }
                    RetryOutcome::Abandoned => {
                        debug!(id = %message.id, "Cancelled during backoff, leaving message pending");
                        self.stats.abandoned(1);
                        Disposition::Abandoned
                    }
                    RetryOutcome::Failed(reason) => {
                        error!(
                            stream = %self.stream,
                            id = %message.id,
                            event_id = %event.id,
                            error = %reason,
                            "Failed to resubmit event, dropping it"
                        );
                        self.stats.dropped();
                        self.resolve(&message.id).await;
                        Disposition::ResubmitFailed
                    }
                }
            }
        }
    }

    async fn resolve(&self, id: &str) {
        if self.acker.ack(id).await {
            self.stats.acknowledged();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::brokers::{BrokerError, InMemoryStreamBroker, MockStreamBroker};
    use crate::message::{encode_fields, EventMetadata};
    use async_trait::async_trait;
    use chrono::Utc;
    use parking_lot::Mutex;
    use std::collections::HashMap;

    fn entry(attempt: u32) -> StreamEntry {
        let mut metadata = EventMetadata::first("evt-1", "user.registered", Utc::now());
        metadata.attempt = attempt;
        StreamEntry::new("5-0", encode_fields(&metadata, "{}").unwrap().into_iter().collect())
    }

    fn processor(broker: Arc<dyn StreamBroker>, handler: Arc<dyn EventHandler>) -> (MessageProcessor, Arc<StatsCounters>) {
        let stats = Arc::new(StatsCounters::default());
        let processor = MessageProcessor::new(
            broker,
            "events:users",
            "mailer",
            "c1",
            handler,
            Duration::from_millis(200),
            None,
            stats.clone(),
        );
        (processor, stats)
    }

    fn failing() -> Arc<dyn EventHandler> {
        Arc::new(|_ctx: HandlerContext, _event: ReceivedEvent| async { Err::<(), _>(anyhow::anyhow!("boom")) })
    }

    #[tokio::test]
    async fn test_malformed_is_acked_without_handler() {
        let mut broker = MockStreamBroker::new();
        broker.expect_ack().times(1).returning(|_, _, _| Ok(()));
        broker.expect_append().never();

        // A handler run would fail and resubmit, which the mock rejects
        let handler = failing();
        let (processor, stats) = processor(Arc::new(broker), handler);

        let disposition = processor
            .process(StreamEntry::new("9-0", HashMap::new()), CancellationToken::new())
            .await;
        assert_eq!(disposition, Disposition::Malformed);
        assert_eq!(stats.snapshot().malformed, 1);
        assert_eq!(stats.snapshot().acknowledged, 1);
    }

    #[tokio::test]
    async fn test_wrongly_typed_metadata_still_reaches_handler() {
        let broker = Arc::new(InMemoryStreamBroker::new());
        let calls = Arc::new(Mutex::new(Vec::new()));
        let handler: Arc<dyn EventHandler> = {
            let calls = calls.clone();
            Arc::new(move |_ctx: HandlerContext, event: ReceivedEvent| {
                let calls = calls.clone();
                async move {
                    calls.lock().push((event.id.clone(), event.event_type.clone()));
                    Ok::<(), anyhow::Error>(())
                }
            })
        };
        let (processor, stats) = processor(broker, handler);

        let fields = HashMap::from([
            (
                "metadata".to_string(),
                r#"{"id":42,"type":"user.registered","version":null,"attempt":1}"#.to_string(),
            ),
            ("payload".to_string(), "{}".to_string()),
        ]);
        let disposition = processor
            .process(StreamEntry::new("6-0", fields), CancellationToken::new())
            .await;

        assert_eq!(disposition, Disposition::Acknowledged);
        assert_eq!(stats.snapshot().malformed, 0);
        assert_eq!(calls.lock().clone(), vec![(String::new(), "user.registered".to_string())]);
    }

    #[tokio::test]
    async fn test_failure_resubmits_then_acks_original() {
        let broker = Arc::new(InMemoryStreamBroker::new());
        let (processor, stats) = processor(broker.clone(), failing());

        let disposition = processor.process(entry(1), CancellationToken::new()).await;
        assert!(matches!(disposition, Disposition::Resubmitted { .. }));
        assert_eq!(broker.stream_len("events:users"), 1);
        assert_eq!(stats.snapshot().retried, 1);
        assert_eq!(stats.snapshot().acknowledged, 1);
    }

    #[tokio::test]
    async fn test_last_attempt_is_dropped_and_reported() {
        struct Recorder(Mutex<Vec<(String, u32, String)>>);

        #[async_trait]
        impl DeadLetterHook for Recorder {
            async fn on_exhausted(&self, stream: &str, event: &ReceivedEvent, error: &anyhow::Error) {
                self.0
                    .lock()
                    .push((stream.to_string(), event.attempt, error.to_string()));
            }
        }

        let broker = Arc::new(InMemoryStreamBroker::new());
        let recorder = Arc::new(Recorder(Mutex::new(Vec::new())));
        let stats = Arc::new(StatsCounters::default());
        let processor = MessageProcessor::new(
            broker.clone(),
            "events:users",
            "mailer",
            "c1",
            failing(),
            Duration::from_millis(200),
            Some(recorder.clone()),
            stats.clone(),
        );

        let disposition = processor.process(entry(3), CancellationToken::new()).await;
        assert_eq!(disposition, Disposition::Dropped);
        assert_eq!(broker.stream_len("events:users"), 0);
        assert_eq!(stats.snapshot().dropped, 1);
        assert_eq!(
            recorder.0.lock().clone(),
            vec![("events:users".to_string(), 3, "boom".to_string())]
        );
    }

    #[tokio::test]
    async fn test_timeout_counts_as_failure() {
        let broker = Arc::new(InMemoryStreamBroker::new());
        let slow: Arc<dyn EventHandler> = Arc::new(|_ctx: HandlerContext, _event: ReceivedEvent| async {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok::<(), anyhow::Error>(())
        });
        let (processor, _) = processor(broker.clone(), slow);

        let disposition = processor.process(entry(1), CancellationToken::new()).await;
        assert!(matches!(disposition, Disposition::Resubmitted { .. }));
    }

    #[tokio::test]
    async fn test_failed_resubmission_still_acks_original() {
        let mut broker = MockStreamBroker::new();
        broker
            .expect_append()
            .times(1)
            .returning(|_, _| Err(BrokerError::Connection("down".to_string())));
        broker
            .expect_ack()
            .times(1)
            .returning(|_, _, _| Ok(()));

        let (processor, stats) = processor(Arc::new(broker), failing());
        let disposition = processor.process(entry(1), CancellationToken::new()).await;

        assert_eq!(disposition, Disposition::ResubmitFailed);
        assert_eq!(stats.snapshot().acknowledged, 1);
        assert_eq!(stats.snapshot().dropped, 1);
        assert_eq!(stats.snapshot().retried, 0);
    }

    #[tokio::test]
    async fn test_cancelled_handler_is_abandoned() {
        let mut broker = MockStreamBroker::new();
        broker.expect_ack().never();
        broker.expect_append().never();

        let handler: Arc<dyn EventHandler> = Arc::new(|ctx: HandlerContext, _event: ReceivedEvent| async move {
            ctx.cancellation().cancelled().await;
            Err::<(), _>(anyhow::anyhow!("cancelled"))
        });
        let (processor, stats) = processor(Arc::new(broker), handler);

        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            trigger.cancel();
        });

        assert_eq!(processor.process(entry(1), cancel).await, Disposition::Abandoned);
        assert_eq!(stats.snapshot().abandoned, 1);
    }
}
