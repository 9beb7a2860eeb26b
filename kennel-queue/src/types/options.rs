use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Per-job overrides applied at enqueue time.
///
/// Unset fields fall back to the queue's configured defaults.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnqueueOptions {
    /// Delay before the job becomes visible to workers
    pub delay: Option<Duration>,

    /// Total attempts before the job is dead-lettered
    pub max_attempts: Option<u32>,

    /// Base retry delay in seconds
    pub backoff_seconds: Option<u64>,

    /// Deduplication key, scoped by job name
    pub idempotency_key: Option<String>,
}

impl EnqueueOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the job visible only after `delay`
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = Some(max_attempts);
        self
    }

    pub fn with_backoff_seconds(mut self, backoff_seconds: u64) -> Self {
        self.backoff_seconds = Some(backoff_seconds);
        self
    }

    /// Return the live job instead of inserting a second one with the same key
    pub fn with_idempotency_key(mut self, key: impl Into<String>) -> Self {
        self.idempotency_key = Some(key.into());
        self
    }
}
