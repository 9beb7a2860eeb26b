//! Storage primitives behind [`JobQueue`](crate::JobQueue).
//!
//! Every method that changes lease state is a single atomic operation in the
//! backend. Callers never read-modify-write job state across two calls when a
//! lease token is involved.

pub mod memory;

#[cfg(feature = "redis")]
pub mod redis;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures_core::Stream;
use serde::{Deserialize, Serialize};
use std::pin::Pin;

use crate::{Job, JobId, LeaseToken, QueueResult, WorkerId};

/// Type alias for boxed streams (stable Rust compatible)
pub type BoxStream<T> = Pin<Box<dyn Stream<Item = T> + Send + 'static>>;

/// Lease parameters handed to [`QueueBackend::claim_next`]
#[derive(Debug, Clone)]
pub struct LeaseGrant {
    pub token: LeaseToken,
    pub leased_until: DateTime<Utc>,
    pub worker_id: WorkerId,
}

/// Result of inserting a job
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Insertion {
    pub job_id: JobId,
    /// False when an idempotency key matched a live job
    pub created: bool,
}

/// Point-in-time job counts
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueStats {
    /// Not leased and not dead-lettered, delayed jobs included
    pub pending: usize,
    /// Holding a lease token, lapsed leases included until reclaimed
    pub leased: usize,
    pub dead_lettered: usize,
}

/// Backend trait for queue storage primitives
#[async_trait]
pub trait QueueBackend: Send + Sync {
    /// Store a new pending job, honouring its idempotency key
    async fn insert(&self, job: Job) -> QueueResult<Insertion>;

    /// Atomically pick the oldest claimable job and lease it.
    ///
    /// A job is claimable when it is not dead-lettered and either unleased with
    /// `available_at <= now` or leased with `leased_until <= now`. Claiming
    /// increments `attempts` and installs the grant.
    async fn claim_next(&self, now: DateTime<Utc>, grant: LeaseGrant) -> QueueResult<Option<Job>>;

    /// Fetch a job by id
    async fn get(&self, job_id: &JobId) -> QueueResult<Option<Job>>;

    /// Remove the job if `token` is its live lease. Returns the removed job.
    async fn complete(&self, job_id: &JobId, token: &LeaseToken) -> QueueResult<Option<Job>>;

    /// Return the job to pending if `token` is its live lease
    async fn release(
        &self,
        job_id: &JobId,
        token: &LeaseToken,
        available_at: DateTime<Utc>,
        error: &str,
    ) -> QueueResult<Option<Job>>;

    /// Move the job to the dead-letter queue if `token` is its live lease
    async fn bury(
        &self,
        job_id: &JobId,
        token: &LeaseToken,
        at: DateTime<Utc>,
        error: &str,
    ) -> QueueResult<Option<Job>>;

    /// Push the lease expiry out if `token` is its live lease
    async fn extend_lease(
        &self,
        job_id: &JobId,
        token: &LeaseToken,
        leased_until: DateTime<Utc>,
    ) -> QueueResult<bool>;

    /// Dead-lettered jobs, oldest burial first
    async fn dead_letters(&self, limit: usize, offset: usize) -> QueueResult<Vec<Job>>;

    /// Move a dead-lettered job back to pending. `None` if it is not in the DLQ.
    async fn revive(&self, job_id: &JobId, available_at: DateTime<Utc>) -> QueueResult<Option<Job>>;

    /// Current counts
    async fn stats(&self) -> QueueResult<QueueStats>;
}
