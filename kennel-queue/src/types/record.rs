use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::{JobId, LeaseToken, WorkerId};

/// Observable job state.
///
/// Completed jobs are removed from the store, so there is no terminal
/// success state here.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum JobState {
    /// Waiting for `available_at`, or eligible now
    Pending { available_at: DateTime<Utc> },

    /// Held by a worker until the lease lapses
    Leased { until: DateTime<Utc> },

    /// Parked in the dead-letter queue
    DeadLettered { at: DateTime<Utc> },
}

impl JobState {
    /// Get the state name as a string
    pub fn name(&self) -> &'static str {
        match self {
            Self::Pending { .. } => "pending",
            Self::Leased { .. } => "leased",
            Self::DeadLettered { .. } => "dead_lettered",
        }
    }
}

/// A unit of deferred work and its delivery bookkeeping
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    /// Unique job identifier
    pub id: JobId,

    /// Routing key used to pick a handler
    pub name: String,

    /// JSON-serializable argument for the handler
    pub payload: Value,

    /// Earliest time the job may be leased
    pub available_at: DateTime<Utc>,

    /// Number of leases granted so far
    pub attempts: u32,

    /// Lease count at which a failure dead-letters instead of retrying
    pub max_attempts: u32,

    /// Attempt allowance fixed at enqueue; each DLQ requeue grants this many more
    pub attempt_budget: u32,

    /// Base retry delay in seconds
    pub backoff_seconds: u64,

    /// Most recent failure description
    pub last_error: Option<String>,

    /// Token of the current lease
    pub lease_token: Option<LeaseToken>,

    /// When the current lease lapses
    pub leased_until: Option<DateTime<Utc>>,

    /// Worker holding the current lease
    pub leased_by: Option<WorkerId>,

    /// Deduplication key supplied at enqueue
    pub idempotency_key: Option<String>,

    pub created_at: DateTime<Utc>,

    /// Set while the job sits in the dead-letter queue
    pub dead_lettered_at: Option<DateTime<Utc>>,
}

impl Job {
    /// Create a pending job
    pub fn new(
        name: impl Into<String>,
        payload: Value,
        available_at: DateTime<Utc>,
        max_attempts: u32,
        backoff_seconds: u64,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: JobId::new(),
            name: name.into(),
            payload,
            available_at,
            attempts: 0,
            max_attempts,
            attempt_budget: max_attempts,
            backoff_seconds,
            last_error: None,
            lease_token: None,
            leased_until: None,
            leased_by: None,
            idempotency_key: None,
            created_at,
            dead_lettered_at: None,
        }
    }

    pub fn with_idempotency_key(mut self, key: Option<String>) -> Self {
        self.idempotency_key = key;
        self
    }

    /// Current state as seen at `now`
    pub fn state(&self, now: DateTime<Utc>) -> JobState {
        if let Some(at) = self.dead_lettered_at {
            return JobState::DeadLettered { at };
        }
        match self.leased_until {
            Some(until) if self.lease_token.is_some() && until > now => JobState::Leased { until },
            _ => JobState::Pending {
                available_at: self.ready_at(),
            },
        }
    }

    /// Earliest instant a worker may claim this job
    pub fn ready_at(&self) -> DateTime<Utc> {
        match (&self.lease_token, self.leased_until) {
            (Some(_), Some(until)) => until.max(self.available_at),
            _ => self.available_at,
        }
    }

    /// Whether a worker may claim the job at `now`
    pub fn is_claimable(&self, now: DateTime<Utc>) -> bool {
        self.dead_lettered_at.is_none() && self.ready_at() <= now
    }

    /// Whether `token` is the live lease token
    pub fn holds_lease(&self, token: &LeaseToken) -> bool {
        self.dead_lettered_at.is_none() && self.lease_token.as_ref() == Some(token)
    }

    /// Whether the next failure should dead-letter the job
    pub fn attempts_exhausted(&self) -> bool {
        self.attempts >= self.max_attempts
    }

    /// Grant a new lease, counting it as an attempt
    pub fn start_lease(&mut self, token: LeaseToken, until: DateTime<Utc>, worker: WorkerId) {
        self.attempts += 1;
        self.lease_token = Some(token);
        self.leased_until = Some(until);
        self.leased_by = Some(worker);
    }

    /// Drop lease bookkeeping
    pub fn clear_lease(&mut self) {
        self.lease_token = None;
        self.leased_until = None;
        self.leased_by = None;
    }

    /// Return to pending with a new availability time
    pub fn schedule_retry(&mut self, available_at: DateTime<Utc>, error: impl Into<String>) {
        self.clear_lease();
        self.available_at = available_at;
        self.last_error = Some(error.into());
    }

    /// Move into the dead-letter queue
    pub fn bury(&mut self, at: DateTime<Utc>, error: impl Into<String>) {
        self.clear_lease();
        self.dead_lettered_at = Some(at);
        self.last_error = Some(error.into());
    }

    /// Leave the dead-letter queue with a fresh attempt allowance
    pub fn revive(&mut self, available_at: DateTime<Utc>) {
        self.dead_lettered_at = None;
        self.available_at = available_at;
        self.max_attempts = self.attempts + self.attempt_budget;
    }
}
