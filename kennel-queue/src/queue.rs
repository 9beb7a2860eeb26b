use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde_json::Value;
use tracing::{debug, error, info, instrument, warn};

use crate::{
    backend::{memory::MemoryBackend, Insertion, LeaseGrant, QueueBackend, QueueStats},
    backoff::BackoffPolicy,
    clock::{offset, SharedClock, SystemClock},
    config::QueueConfig,
    observability::{NoopObserver, SharedObserver},
    EnqueueOptions, Job, JobId, JobState, LeaseToken, QueueError, QueueResult, WorkerId,
};

/// What happened to a job reported as failed
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailOutcome {
    /// Back to pending, visible again at `available_at`
    RetryScheduled { available_at: DateTime<Utc> },
    /// Moved to the dead-letter queue
    DeadLettered,
    /// The token no longer matched; nothing changed
    Stale,
}

/// Durable job queue with visibility-timeout leases.
///
/// Cheap to clone; clones share the backend, clock and observer.
#[derive(Clone)]
pub struct JobQueue {
    backend: Arc<dyn QueueBackend>,
    clock: SharedClock,
    observer: SharedObserver,
    backoff: BackoffPolicy,
    config: QueueConfig,
}

impl JobQueue {
    /// Create a queue over `backend` with default settings
    pub fn new(backend: Arc<dyn QueueBackend>) -> Self {
        Self {
            backend,
            clock: Arc::new(SystemClock),
            observer: Arc::new(NoopObserver),
            backoff: BackoffPolicy::default(),
            config: QueueConfig::default(),
        }
    }

    /// In-memory queue, mostly for tests and single-process use
    pub fn in_memory() -> Self {
        Self::new(Arc::new(MemoryBackend::new()))
    }

    pub fn with_clock(mut self, clock: SharedClock) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_observer(mut self, observer: SharedObserver) -> Self {
        self.observer = observer;
        self
    }

    pub fn with_backoff(mut self, backoff: BackoffPolicy) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn with_config(mut self, config: QueueConfig) -> Self {
        self.config = config;
        self
    }

    /// Add a job. Returns the existing id when the idempotency key matches a live job.
    pub async fn enqueue(
        &self,
        name: impl AsRef<str>,
        payload: Value,
        options: EnqueueOptions,
    ) -> QueueResult<JobId> {
        Ok(self.enqueue_unique(name, payload, options).await?.job_id)
    }

    /// [`JobQueue::enqueue`] that also reports whether a new job was created
    /// or the idempotency key matched a live one.
    #[instrument(skip(self, name, payload, options), fields(job_name = %name.as_ref()))]
    pub async fn enqueue_unique(
        &self,
        name: impl AsRef<str>,
        payload: Value,
        options: EnqueueOptions,
    ) -> QueueResult<Insertion> {
        let name = name.as_ref();
        if name.is_empty() {
            return Err(QueueError::InvalidJob("job name must not be empty".into()));
        }
        let max_attempts = options.max_attempts.unwrap_or(self.config.default_max_attempts);
        if max_attempts == 0 {
            return Err(QueueError::InvalidJob("max_attempts must be at least 1".into()));
        }

        let now = self.clock.now();
        let available_at = match options.delay {
            Some(delay) => offset(now, delay)?,
            None => now,
        };
        let backoff_seconds = options
            .backoff_seconds
            .unwrap_or(self.config.default_backoff_seconds);

        let job = Job::new(name, payload, available_at, max_attempts, backoff_seconds, now)
            .with_idempotency_key(options.idempotency_key);
        let insertion = self.backend.insert(job.clone()).await?;

        if insertion.created {
            self.observer.job_enqueued(&job);
            debug!(job_id = %insertion.job_id, %available_at, "Enqueued job");
        } else {
            debug!(job_id = %insertion.job_id, "Idempotency key matched a live job");
        }
        Ok(insertion)
    }

    /// Claim the next available job for `visibility_timeout`.
    ///
    /// The returned job carries the fresh lease token and the incremented
    /// attempt count. Expired leases of other workers are reclaimed here.
    pub async fn lease(&self, worker_id: &WorkerId, visibility_timeout: Duration) -> QueueResult<Option<Job>> {
        let now = self.clock.now();
        let grant = LeaseGrant {
            token: LeaseToken::new(),
            leased_until: offset(now, visibility_timeout)?,
            worker_id: worker_id.clone(),
        };

        let leased = self.backend.claim_next(now, grant).await?;
        if let Some(job) = &leased {
            self.observer.job_leased(job);
            debug!(job_id = %job.id, job_name = %job.name, attempt = job.attempts, worker = %worker_id, "Leased job");
        }
        Ok(leased)
    }

    /// [`JobQueue::lease`] with the configured visibility timeout
    pub async fn lease_default(&self, worker_id: &WorkerId) -> QueueResult<Option<Job>> {
        self.lease(worker_id, self.config.visibility_timeout).await
    }

    /// Remove a completed job. `false` when the token is stale.
    #[instrument(skip(self, job_id, lease_token), fields(job_id = %job_id))]
    pub async fn ack(&self, job_id: &JobId, lease_token: &LeaseToken) -> QueueResult<bool> {
        match self.backend.complete(job_id, lease_token).await? {
            Some(job) => {
                self.observer.job_completed(&job, self.clock.now());
                info!(job_name = %job.name, attempts = job.attempts, "Job completed");
                Ok(true)
            }
            None => {
                self.report_stale(job_id, "ack");
                Ok(false)
            }
        }
    }

    /// Record a failure: retry after backoff, or dead-letter once attempts are exhausted
    #[instrument(skip(self, job_id, lease_token, error), fields(job_id = %job_id))]
    pub async fn fail(&self, job_id: &JobId, lease_token: &LeaseToken, error: &str) -> QueueResult<FailOutcome> {
        let Some(job) = self.backend.get(job_id).await? else {
            self.report_stale(job_id, "fail");
            return Ok(FailOutcome::Stale);
        };
        if !job.holds_lease(lease_token) {
            self.report_stale(job_id, "fail");
            return Ok(FailOutcome::Stale);
        }

        if job.attempts_exhausted() {
            return self.bury(job_id, lease_token, error).await;
        }

        let now = self.clock.now();
        let delay = self.backoff.delay_for(job.backoff_seconds, job.attempts);
        // Saturates; the lease is settled either way
        let available_at = offset(now, delay).unwrap_or(DateTime::<Utc>::MAX_UTC);
        match self.backend.release(job_id, lease_token, available_at, error).await? {
            Some(job) => {
                self.observer.job_retry_scheduled(&job, error);
                warn!(job_name = %job.name, attempt = job.attempts, %available_at, error, "Job failed, will retry");
                Ok(FailOutcome::RetryScheduled { available_at })
            }
            None => {
                self.report_stale(job_id, "fail");
                Ok(FailOutcome::Stale)
            }
        }
    }

    /// Dead-letter immediately regardless of remaining attempts
    #[instrument(skip(self, job_id, lease_token, error), fields(job_id = %job_id))]
    pub async fn fail_permanently(
        &self,
        job_id: &JobId,
        lease_token: &LeaseToken,
        error: &str,
    ) -> QueueResult<FailOutcome> {
        self.bury(job_id, lease_token, error).await
    }

    async fn bury(&self, job_id: &JobId, lease_token: &LeaseToken, error: &str) -> QueueResult<FailOutcome> {
        let now = self.clock.now();
        match self.backend.bury(job_id, lease_token, now, error).await? {
            Some(job) => {
                self.observer.job_dead_lettered(&job, error);
                error!(job_name = %job.name, attempts = job.attempts, error, "Job dead-lettered");
                Ok(FailOutcome::DeadLettered)
            }
            None => {
                self.report_stale(job_id, "fail");
                Ok(FailOutcome::Stale)
            }
        }
    }

    /// Push the lease out to now + `visibility_timeout`. `false` when the token is stale.
    pub async fn extend_lease(
        &self,
        job_id: &JobId,
        lease_token: &LeaseToken,
        visibility_timeout: Duration,
    ) -> QueueResult<bool> {
        let leased_until = offset(self.clock.now(), visibility_timeout)?;
        let extended = self.backend.extend_lease(job_id, lease_token, leased_until).await?;
        if extended {
            debug!(job_id = %job_id, %leased_until, "Extended lease");
        } else {
            self.report_stale(job_id, "extend_lease");
        }
        Ok(extended)
    }

    /// Page through dead-lettered jobs, oldest burial first
    pub async fn dead_letter_jobs(&self, limit: usize, offset: usize) -> QueueResult<Vec<Job>> {
        self.backend.dead_letters(limit, offset).await
    }

    /// Move a dead-lettered job back to pending, available now.
    ///
    /// The attempt count is kept and the job gets its original attempt
    /// allowance again on top of it.
    #[instrument(skip(self, job_id), fields(job_id = %job_id))]
    pub async fn requeue_from_dlq(&self, job_id: &JobId) -> QueueResult<Job> {
        let now = self.clock.now();
        let job = self
            .backend
            .revive(job_id, now)
            .await?
            .ok_or_else(|| QueueError::NotDeadLettered(job_id.to_string()))?;

        self.observer.job_requeued(&job);
        info!(job_name = %job.name, max_attempts = job.max_attempts, "Requeued job from dead-letter queue");
        Ok(job)
    }

    pub async fn get(&self, job_id: &JobId) -> QueueResult<Option<Job>> {
        self.backend.get(job_id).await
    }

    /// Current state, `None` once completed (or never enqueued)
    pub async fn status(&self, job_id: &JobId) -> QueueResult<Option<JobState>> {
        let now = self.clock.now();
        Ok(self.backend.get(job_id).await?.map(|job| job.state(now)))
    }

    pub async fn stats(&self) -> QueueResult<QueueStats> {
        self.backend.stats().await
    }

    pub fn clock(&self) -> &SharedClock {
        &self.clock
    }

    pub fn observer(&self) -> &SharedObserver {
        &self.observer
    }

    pub fn config(&self) -> &QueueConfig {
        &self.config
    }

    fn report_stale(&self, job_id: &JobId, operation: &'static str) {
        self.observer.stale_lease(job_id, operation);
        debug!(job_id = %job_id, operation, "Lease token no longer valid; ignoring");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::{Clock, ManualClock};
    use serde_json::json;

    fn queue() -> (JobQueue, ManualClock) {
        let clock = ManualClock::at_unix(1_700_000_000);
        (JobQueue::in_memory().with_clock(clock.shared()), clock)
    }

    #[tokio::test]
    async fn test_enqueue_rejects_empty_name_and_zero_attempts() {
        let (queue, _) = queue();

        let empty = queue.enqueue("", json!({}), EnqueueOptions::new()).await;
        let zero = queue
            .enqueue("email", json!({}), EnqueueOptions::new().with_max_attempts(0))
            .await;

        assert!(matches!(empty, Err(QueueError::InvalidJob(_))));
        assert!(matches!(zero, Err(QueueError::InvalidJob(_))));
    }

    #[tokio::test]
    async fn test_enqueue_applies_queue_defaults() {
        let (queue, _) = queue();

        let job_id = queue.enqueue("email", json!({"to": "x"}), EnqueueOptions::new()).await.unwrap();
        let job = queue.get(&job_id).await.unwrap().unwrap();

        assert_eq!(job.max_attempts, 5);
        assert_eq!(job.backoff_seconds, 60);
        assert_eq!(job.attempts, 0);
    }

    #[tokio::test]
    async fn test_delayed_job_waits_for_clock() {
        let (queue, clock) = queue();
        let worker = WorkerId::from("w1");
        queue
            .enqueue("email", json!({}), EnqueueOptions::new().with_delay(Duration::from_secs(30)))
            .await
            .unwrap();

        assert!(queue.lease(&worker, Duration::from_secs(10)).await.unwrap().is_none());
        clock.advance(Duration::from_secs(30));
        assert!(queue.lease(&worker, Duration::from_secs(10)).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_fail_uses_linear_backoff() {
        let (queue, clock) = queue();
        let worker = WorkerId::from("w1");
        let options = EnqueueOptions::new().with_max_attempts(3).with_backoff_seconds(10);
        let job_id = queue.enqueue("email", json!({}), options).await.unwrap();

        let first = queue.lease(&worker, Duration::from_secs(5)).await.unwrap().unwrap();
        let outcome = queue
            .fail(&job_id, first.lease_token.as_ref().unwrap(), "smtp down")
            .await
            .unwrap();
        assert_eq!(outcome, FailOutcome::RetryScheduled { available_at: clock.now() + chrono::Duration::seconds(10) });

        clock.advance(Duration::from_secs(10));
        let second = queue.lease(&worker, Duration::from_secs(5)).await.unwrap().unwrap();
        let outcome = queue
            .fail(&job_id, second.lease_token.as_ref().unwrap(), "smtp down")
            .await
            .unwrap();
        assert_eq!(outcome, FailOutcome::RetryScheduled { available_at: clock.now() + chrono::Duration::seconds(20) });

        let job = queue.get(&job_id).await.unwrap().unwrap();
        assert_eq!(job.last_error.as_deref(), Some("smtp down"));
        assert_eq!(job.attempts, 2);
    }

    #[tokio::test]
    async fn test_status_follows_lifecycle() {
        let (queue, _) = queue();
        let worker = WorkerId::from("w1");
        let job_id = queue.enqueue("email", json!({}), EnqueueOptions::new()).await.unwrap();
        assert_eq!(queue.status(&job_id).await.unwrap().unwrap().name(), "pending");

        let leased = queue.lease(&worker, Duration::from_secs(5)).await.unwrap().unwrap();
        assert_eq!(queue.status(&job_id).await.unwrap().unwrap().name(), "leased");

        queue.fail_permanently(&job_id, leased.lease_token.as_ref().unwrap(), "bad").await.unwrap();
        assert_eq!(queue.status(&job_id).await.unwrap().unwrap().name(), "dead_lettered");

        let requeued = queue.requeue_from_dlq(&job_id).await.unwrap();
        assert_eq!(requeued.attempts, 1);
        assert_eq!(requeued.max_attempts, 6);

        let leased = queue.lease(&worker, Duration::from_secs(5)).await.unwrap().unwrap();
        assert!(queue.ack(&job_id, leased.lease_token.as_ref().unwrap()).await.unwrap());
        assert!(queue.status(&job_id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_requeue_unknown_job_is_an_error() {
        let (queue, _) = queue();
        let err = queue.requeue_from_dlq(&JobId::from("missing")).await.unwrap_err();
        assert!(matches!(err, QueueError::NotDeadLettered(_)));
    }

    #[tokio::test]
    async fn test_overflowing_delay_is_rejected() {
        let (queue, _) = queue();
        let options = EnqueueOptions::new().with_delay(Duration::from_secs(10u64.pow(13)));

        let err = queue.enqueue("email", json!({}), options).await.unwrap_err();

        assert!(matches!(err, QueueError::InvalidJob(_)));
        assert_eq!(queue.stats().await.unwrap().pending, 0);
    }

    #[tokio::test]
    async fn test_overflowing_visibility_timeout_is_rejected() {
        let (queue, _) = queue();
        let worker = WorkerId::from("w1");
        let job_id = queue.enqueue("email", json!({}), EnqueueOptions::new()).await.unwrap();
        let huge = Duration::from_secs(10u64.pow(13));

        assert!(queue.lease(&worker, huge).await.is_err());
        let leased = queue.lease(&worker, Duration::from_secs(5)).await.unwrap().unwrap();
        let token = leased.lease_token.unwrap();
        assert!(queue.extend_lease(&job_id, &token, huge).await.is_err());
        assert!(queue.ack(&job_id, &token).await.unwrap());
    }

    #[tokio::test]
    async fn test_huge_backoff_is_clamped() {
        let (queue, clock) = queue();
        let worker = WorkerId::from("w1");
        let options = EnqueueOptions::new().with_max_attempts(3).with_backoff_seconds(10u64.pow(13));
        let job_id = queue.enqueue("email", json!({}), options).await.unwrap();
        let leased = queue.lease(&worker, Duration::from_secs(5)).await.unwrap().unwrap();

        let outcome = queue
            .fail(&job_id, leased.lease_token.as_ref().unwrap(), "smtp down")
            .await
            .unwrap();

        let expected = clock.now() + chrono::Duration::from_std(crate::backoff::MAX_RETRY_DELAY).unwrap();
        assert_eq!(outcome, FailOutcome::RetryScheduled { available_at: expected });
        assert_eq!(queue.status(&job_id).await.unwrap().unwrap().name(), "pending");
    }

    #[tokio::test]
    async fn test_enqueue_unique_reports_matched_key() {
        let (queue, _) = queue();
        let options = EnqueueOptions::new().with_idempotency_key("order-7");

        let first = queue.enqueue_unique("email", json!({}), options.clone()).await.unwrap();
        let second = queue.enqueue_unique("email", json!({}), options).await.unwrap();

        assert!(first.created);
        assert!(!second.created);
        assert_eq!(first.job_id, second.job_id);
    }
}
