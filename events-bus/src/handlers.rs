// Event handler capability and the per-delivery context handed to it
use async_trait::async_trait;
use std::future::Future;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::error;

use crate::event::ReceivedEvent;

/// Everything a handler may want to know about the delivery it is processing.
#[derive(Debug, Clone)]
pub struct HandlerContext {
    cancel: CancellationToken,
    deadline: Instant,
    stream: String,
    group: String,
    consumer: String,
    message_id: String,
    attempt: u32,
}

impl HandlerContext {
    pub fn new(
        cancel: CancellationToken,
        deadline: Instant,
        stream: impl Into<String>,
        group: impl Into<String>,
        consumer: impl Into<String>,
        message_id: impl Into<String>,
        attempt: u32,
    ) -> Self {
        Self {
            cancel,
            deadline,
            stream: stream.into(),
            group: group.into(),
            consumer: consumer.into(),
            message_id: message_id.into(),
            attempt,
        }
    }

    /// Fires when the subscription is cancelled.
    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Point in time after which the handler counts as failed.
    pub fn deadline(&self) -> Instant {
        self.deadline
    }

    pub fn remaining(&self) -> Duration {
        self.deadline.saturating_duration_since(Instant::now())
    }

    pub fn stream(&self) -> &str {
        &self.stream
    }

    pub fn group(&self) -> &str {
        &self.group
    }

    pub fn consumer(&self) -> &str {
        &self.consumer
    }

    pub fn message_id(&self) -> &str {
        &self.message_id
    }

    pub fn attempt(&self) -> u32 {
        self.attempt
    }
}

/// Processes delivered events. Returning an error sends the event down the
/// retry path.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait EventHandler: Send + Sync {
    async fn handle(&self, ctx: HandlerContext, event: ReceivedEvent) -> anyhow::Result<()>;
}

#[async_trait]
impl<F, Fut> EventHandler for F
where
    F: Fn(HandlerContext, ReceivedEvent) -> Fut + Send + Sync,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    async fn handle(&self, ctx: HandlerContext, event: ReceivedEvent) -> anyhow::Result<()> {
        (self)(ctx, event).await
    }
}

/// Called once for an event whose final attempt failed, right before that
/// delivery is acknowledged and the event is gone from the stream.
#[async_trait]
pub trait DeadLetterHook: Send + Sync {
    async fn on_exhausted(&self, stream: &str, event: &ReceivedEvent, error: &anyhow::Error);
}

/// Dead-letter hook that only records the loss in the log.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogDeadLetters;

#[async_trait]
impl DeadLetterHook for LogDeadLetters {
    async fn on_exhausted(&self, stream: &str, event: &ReceivedEvent, error: &anyhow::Error) {
        error!(
            stream = %stream,
            event_id = %event.id,
            event_type = %event.event_type,
            attempt = event.attempt,
            error = %error,
            "Event dropped after final attempt"
        );
    }
}
