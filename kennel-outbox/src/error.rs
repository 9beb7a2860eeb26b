use kennel_queue::{JobError, QueueError};
use thiserror::Error;

use crate::OutboxEntryId;

pub type MessagingResult<T> = Result<T, MessagingError>;

/// Errors raised by outbox and inbox stores
#[derive(Error, Debug, Clone)]
pub enum MessagingError {
    #[error(transparent)]
    Queue(#[from] QueueError),

    #[error("Store error: {0}")]
    Store(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Outbox entry not found: {0}")]
    EntryNotFound(OutboxEntryId),
}

impl From<serde_json::Error> for MessagingError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

#[cfg(feature = "redis")]
impl From<redis::RedisError> for MessagingError {
    fn from(err: redis::RedisError) -> Self {
        Self::Store(err.to_string())
    }
}

/// Store trouble inside a handler is worth another attempt
impl From<MessagingError> for JobError {
    fn from(err: MessagingError) -> Self {
        match err {
            MessagingError::Serialization(msg) => JobError::Permanent(msg),
            other => JobError::Retryable(other.to_string()),
        }
    }
}
