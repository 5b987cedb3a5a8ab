use crate::model::ChangeEvent;
use crate::resilience::{Classify, FailureClass};
use async_trait::async_trait;
use std::time::Duration;
use thiserror::Error;

/// Errors reported by event publishers
#[derive(Debug, Error)]
pub enum PublishError {
    #[error("event bus unreachable: {0}")]
    Unreachable(String),

    #[error("local producer queue is full")]
    QueueFull,

    /// No delivery report arrived in time; the broker may still have the
    /// message.
    #[error("delivery not confirmed within {0:?}")]
    Timeout(Duration),

    #[error("failed to serialize event: {0}")]
    Serialization(String),

    #[error("event bus rejected the message: {0}")]
    Rejected(String),
}

impl Classify for PublishError {
    fn failure_class(&self) -> FailureClass {
        match self {
            PublishError::Unreachable(_) | PublishError::QueueFull => FailureClass::Transient,
            PublishError::Timeout(_) => FailureClass::Ambiguous,
            PublishError::Serialization(_) | PublishError::Rejected(_) => FailureClass::Permanent,
        }
    }
}

/// At-least-once delivery of change events.
///
/// Consumers must tolerate duplicates and use [`ChangeEvent::version`] to
/// discard stale deliveries.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait EventPublisher: Send + Sync {
    async fn publish(&self, event: &ChangeEvent) -> Result<(), PublishError>;
}
