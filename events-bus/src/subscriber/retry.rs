//! Bounded resubmission of failed events.
//!
//! A failed event is not redelivered: a copy with `attempt + 1` is appended
//! to the same stream after a backoff, and the failed delivery is then
//! acknowledged by the worker. The backoff sleep holds the worker's
//! concurrency slot.

use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::brokers::{BrokerError, StreamBroker};
use crate::message::StreamMessage;

/// Total deliveries an event gets, the first one included.
pub const MAX_ATTEMPTS: u32 = 3;

const BASE_BACKOFF: Duration = Duration::from_millis(100);
const MAX_BACKOFF: Duration = Duration::from_secs(10);
const BACKOFF_FACTOR: u32 = 5;

/// Delay before resubmitting a failed `attempt`:
/// 0 for the first attempt, then `100ms * 5^(attempt - 2)` capped at 10s.
pub fn backoff_delay(attempt: u32) -> Duration {
    if attempt <= 1 {
        return Duration::ZERO;
    }

    let mut delay = BASE_BACKOFF;
    for _ in 2..attempt {
        delay = delay.saturating_mul(BACKOFF_FACTOR);
        if delay >= MAX_BACKOFF {
            return MAX_BACKOFF;
        }
    }
    delay
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    Resubmit { delay: Duration, next_attempt: u32 },
    Exhausted,
}

pub fn decide(attempt: u32) -> RetryDecision {
    if attempt >= MAX_ATTEMPTS {
        RetryDecision::Exhausted
    } else {
        RetryDecision::Resubmit {
            delay: backoff_delay(attempt),
            next_attempt: attempt + 1,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryOutcome {
    /// The copy was appended under this id
    Resubmitted(String),
    /// Cancelled while backing off, nothing appended
    Abandoned,
    Failed(String),
}

pub struct RetryCoordinator {
    broker: Arc<dyn StreamBroker>,
    stream: String,
}

impl RetryCoordinator {
    pub fn new(broker: Arc<dyn StreamBroker>, stream: impl Into<String>) -> Self {
        Self {
            broker,
            stream: stream.into(),
        }
    }

    /// Wait out the backoff for `message` and append its next attempt.
    pub async fn resubmit(&self, message: &StreamMessage, delay: Duration, cancel: &CancellationToken) -> RetryOutcome {
        if cancel.is_cancelled() {
            return RetryOutcome::Abandoned;
        }

        if !delay.is_zero() {
            debug!(id = %message.id, delay_ms = delay.as_millis() as u64, "Backing off before retry");
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return RetryOutcome::Abandoned,
                _ = tokio::time::sleep(delay) => {}
            }
        }

        let fields = match message.retry_fields() {
            Ok(fields) => fields,
            Err(e) => return RetryOutcome::Failed(format!("failed to encode retry metadata: {}", e)),
        };

        match self.broker.append(&self.stream, fields).await {
            Ok(id) => RetryOutcome::Resubmitted(id),
            Err(BrokerError::Closed) => RetryOutcome::Failed("broker connection closed".to_string()),
            Err(e) => RetryOutcome::Failed(e.to_string()),
        }
    }
}
