use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::JobId;

/// Lifecycle events published to subscribers of an event recorder
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum JobEvent {
    /// Job was enqueued
    Enqueued {
        job_id: JobId,
        name: String,
        available_at: DateTime<Utc>,
        at: DateTime<Utc>,
    },

    /// Job was leased by a worker
    Leased {
        job_id: JobId,
        attempt: u32,
        leased_until: DateTime<Utc>,
        at: DateTime<Utc>,
    },

    /// Job failed and will become visible again later
    RetryScheduled {
        job_id: JobId,
        attempt: u32,
        available_at: DateTime<Utc>,
        error: String,
        at: DateTime<Utc>,
    },

    /// Job completed and was removed
    Completed {
        job_id: JobId,
        at: DateTime<Utc>,
    },

    /// Job moved to the dead-letter queue
    DeadLettered {
        job_id: JobId,
        error: String,
        at: DateTime<Utc>,
    },

    /// Job was moved out of the dead-letter queue
    Requeued {
        job_id: JobId,
        at: DateTime<Utc>,
    },
}

impl JobEvent {
    /// Get event type name as string
    pub fn event_name(&self) -> &'static str {
        match self {
            Self::Enqueued { .. } => "enqueued",
            Self::Leased { .. } => "leased",
            Self::RetryScheduled { .. } => "retry_scheduled",
            Self::Completed { .. } => "completed",
            Self::DeadLettered { .. } => "dead_lettered",
            Self::Requeued { .. } => "requeued",
        }
    }

    /// Get the job ID from any event
    pub fn job_id(&self) -> &JobId {
        match self {
            Self::Enqueued { job_id, .. }
            | Self::Leased { job_id, .. }
            | Self::RetryScheduled { job_id, .. }
            | Self::Completed { job_id, .. }
            | Self::DeadLettered { job_id, .. }
            | Self::Requeued { job_id, .. } => job_id,
        }
    }

    /// Get the timestamp from any event
    pub fn timestamp(&self) -> DateTime<Utc> {
        match self {
            Self::Enqueued { at, .. }
            | Self::Leased { at, .. }
            | Self::RetryScheduled { at, .. }
            | Self::Completed { at, .. }
            | Self::DeadLettered { at, .. }
            | Self::Requeued { at, .. } => *at,
        }
    }
}
