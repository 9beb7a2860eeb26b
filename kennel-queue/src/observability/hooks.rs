use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{Job, JobError, JobId};

/// Shared observer handle
pub type SharedObserver = Arc<dyn QueueObserver>;

/// Result of one outbound delivery attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DeliveryOutcome {
    /// Endpoint acknowledged with a 2xx
    Delivered,
    /// Failed in a way worth retrying
    TransientFailure,
    /// Failed in a way retries cannot fix
    PermanentFailure,
    /// No destination configured for the topic
    Skipped,
    /// Already delivered according to the inbox
    Duplicate,
}

impl DeliveryOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Delivered => "delivered",
            Self::TransientFailure => "transient_failure",
            Self::PermanentFailure => "permanent_failure",
            Self::Skipped => "skipped",
            Self::Duplicate => "duplicate",
        }
    }
}

/// Callbacks fired at each lifecycle transition.
///
/// Every method has a no-op default so implementors pick what they need.
/// Callbacks run inline on the calling task and must not block.
pub trait QueueObserver: Send + Sync {
    fn job_enqueued(&self, _job: &Job) {}

    fn job_leased(&self, _job: &Job) {}

    fn job_completed(&self, _job: &Job, _at: DateTime<Utc>) {}

    fn job_retry_scheduled(&self, _job: &Job, _error: &str) {}

    fn job_dead_lettered(&self, _job: &Job, _error: &str) {}

    fn job_requeued(&self, _job: &Job) {}

    /// An ack, fail or extend arrived with a token that no longer matches
    fn stale_lease(&self, _job_id: &JobId, _operation: &'static str) {}

    fn handler_failed(&self, _job: &Job, _error: &JobError) {}

    fn delivery_outcome(&self, _topic: &str, _outcome: DeliveryOutcome, _latency: Option<Duration>) {}

    /// Destination answered 429
    fn rate_limited(&self, _destination: &str) {}
}

/// Observer that ignores everything
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopObserver;

impl QueueObserver for NoopObserver {}

/// Fans every callback out to several observers
#[derive(Clone, Default)]
pub struct CompositeObserver {
    observers: Vec<SharedObserver>,
}

impl CompositeObserver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, observer: SharedObserver) -> Self {
        self.observers.push(observer);
        self
    }

    pub fn len(&self) -> usize {
        self.observers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.observers.is_empty()
    }
}

impl QueueObserver for CompositeObserver {
    fn job_enqueued(&self, job: &Job) {
        self.observers.iter().for_each(|o| o.job_enqueued(job));
    }

    fn job_leased(&self, job: &Job) {
        self.observers.iter().for_each(|o| o.job_leased(job));
    }

    fn job_completed(&self, job: &Job, at: DateTime<Utc>) {
        self.observers.iter().for_each(|o| o.job_completed(job, at));
    }

    fn job_retry_scheduled(&self, job: &Job, error: &str) {
        self.observers.iter().for_each(|o| o.job_retry_scheduled(job, error));
    }

    fn job_dead_lettered(&self, job: &Job, error: &str) {
        self.observers.iter().for_each(|o| o.job_dead_lettered(job, error));
    }

    fn job_requeued(&self, job: &Job) {
        self.observers.iter().for_each(|o| o.job_requeued(job));
    }

    fn stale_lease(&self, job_id: &JobId, operation: &'static str) {
        self.observers.iter().for_each(|o| o.stale_lease(job_id, operation));
    }

    fn handler_failed(&self, job: &Job, error: &JobError) {
        self.observers.iter().for_each(|o| o.handler_failed(job, error));
    }

    fn delivery_outcome(&self, topic: &str, outcome: DeliveryOutcome, latency: Option<Duration>) {
        self.observers
            .iter()
            .for_each(|o| o.delivery_outcome(topic, outcome, latency));
    }

    fn rate_limited(&self, destination: &str) {
        self.observers.iter().for_each(|o| o.rate_limited(destination));
    }
}
