//! Worker loop: lease, dispatch, settle.
//!
//! Each iteration leases at most one job and hands it to a bounded pool of
//! in-flight tasks (`concurrency`, default one). Handler outcomes map onto
//! the queue: success acks, [`JobError::Retryable`] fails with backoff,
//! [`JobError::Permanent`] and unknown job names dead-letter immediately.
//! Panics, timeouts and handler errors never escape the loop.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use tokio::sync::{watch, Semaphore};
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::{interval_at, Instant};
use tracing::{debug, error, info, info_span, warn, Instrument};

use crate::{
    config::WorkerConfig, job::JobHandler, queue::FailOutcome, Job, JobError, JobQueue, JobRegistry, LeaseToken,
    QueueError, QueueResult,
};

/// How a single leased job was settled
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobOutcome {
    Completed,
    RetryScheduled,
    DeadLettered,
    /// The lease was lost before the result could be recorded
    Stale,
}

impl From<FailOutcome> for JobOutcome {
    fn from(outcome: FailOutcome) -> Self {
        match outcome {
            FailOutcome::RetryScheduled { .. } => Self::RetryScheduled,
            FailOutcome::DeadLettered => Self::DeadLettered,
            FailOutcome::Stale => Self::Stale,
        }
    }
}

/// Totals for one run of the worker loop
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WorkerReport {
    /// Poll iterations
    pub loops: u64,
    /// Jobs leased and settled
    pub processed: u64,
    pub completed: u64,
    pub retried: u64,
    pub dead_lettered: u64,
    pub stale: u64,
    /// Jobs whose settlement hit a store error
    pub errors: u64,
}

impl WorkerReport {
    fn record(&mut self, outcome: &QueueResult<JobOutcome>) {
        self.processed += 1;
        match outcome {
            Ok(JobOutcome::Completed) => self.completed += 1,
            Ok(JobOutcome::RetryScheduled) => self.retried += 1,
            Ok(JobOutcome::DeadLettered) => self.dead_lettered += 1,
            Ok(JobOutcome::Stale) => self.stale += 1,
            Err(_) => self.errors += 1,
        }
    }
}

/// Pulls jobs from a [`JobQueue`] and runs them through a [`JobRegistry`]
#[derive(Clone)]
pub struct Worker {
    queue: JobQueue,
    registry: Arc<JobRegistry>,
    config: WorkerConfig,
}

impl Worker {
    pub fn new(queue: JobQueue, registry: JobRegistry, config: WorkerConfig) -> Self {
        Self {
            queue,
            registry: Arc::new(registry),
            config,
        }
    }

    pub fn config(&self) -> &WorkerConfig {
        &self.config
    }

    pub fn queue(&self) -> &JobQueue {
        &self.queue
    }

    /// Lease one job and settle it inline. `false` when nothing was available.
    pub async fn process_one(&self) -> QueueResult<bool> {
        match self
            .queue
            .lease(&self.config.worker_id, self.config.visibility_timeout)
            .await?
        {
            Some(job) => {
                self.execute(job).await?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Poll until `max_loops` iterations ran, or forever.
    ///
    /// In-flight jobs are awaited before returning.
    pub async fn run(&self, max_loops: Option<u64>) -> QueueResult<WorkerReport> {
        let (_tx, rx) = watch::channel(None);
        self.run_until(max_loops, rx).await
    }

    /// Spawn the loop on the runtime and return a handle that stops it
    pub fn start(self) -> WorkerHandle {
        let (shutdown_tx, shutdown_rx) = watch::channel(None);
        let worker_id = self.config.worker_id.clone();
        let join_handle = tokio::spawn(async move { self.run_until(None, shutdown_rx).await });

        info!(worker = %worker_id, "Started worker");
        WorkerHandle {
            shutdown_tx,
            join_handle,
        }
    }

    async fn run_until(
        &self,
        max_loops: Option<u64>,
        mut shutdown: watch::Receiver<Option<Duration>>,
    ) -> QueueResult<WorkerReport> {
        self.config.validate()?;

        let permits = Arc::new(Semaphore::new(self.config.concurrency));
        let mut in_flight: JoinSet<QueueResult<JobOutcome>> = JoinSet::new();
        let mut report = WorkerReport::default();

        info!(worker = %self.config.worker_id, concurrency = self.config.concurrency, "Worker loop started");

        loop {
            if max_loops.is_some_and(|max| report.loops >= max) || shutdown.borrow().is_some() {
                break;
            }
            report.loops += 1;

            while let Some(done) = in_flight.try_join_next() {
                report.record(&flatten(done));
            }

            let permit = tokio::select! {
                permit = permits.clone().acquire_owned() => {
                    permit.map_err(|_| QueueError::WorkerShutdown)?
                }
                _ = shutdown.changed() => break,
            };

            match self
                .queue
                .lease(&self.config.worker_id, self.config.visibility_timeout)
                .await
            {
                Ok(Some(job)) => {
                    let worker = self.clone();
                    in_flight.spawn(async move {
                        let _permit = permit;
                        worker.execute(job).await
                    });
                    continue;
                }
                Ok(None) => {
                    drop(permit);
                    debug!("No job available");
                }
                Err(e) => {
                    drop(permit);
                    error!(error = %e, "Lease failed");
                }
            }

            if max_loops.is_some_and(|max| report.loops >= max) {
                break;
            }
            tokio::select! {
                _ = tokio::time::sleep(self.config.poll_interval) => {}
                _ = shutdown.changed() => break,
            }
        }

        let grace = *shutdown.borrow();
        match grace {
            Some(grace) => {
                let drained = tokio::time::timeout(grace, drain(&mut in_flight, &mut report)).await;
                if drained.is_err() {
                    warn!(
                        abandoned = in_flight.len(),
                        ?grace,
                        "Grace period elapsed; abandoning in-flight jobs to lease expiry"
                    );
                    in_flight.abort_all();
                }
            }
            None => drain(&mut in_flight, &mut report).await,
        }

        info!(worker = %self.config.worker_id, ?report, "Worker loop stopped");
        Ok(report)
    }

    /// Run the handler for a leased job and record the result on the queue
    async fn execute(&self, job: Job) -> QueueResult<JobOutcome> {
        let Some(token) = job.lease_token.clone() else {
            return Err(QueueError::Internal(format!("job {} leased without a token", job.id)));
        };
        let span = info_span!("job", job_id = %job.id, job_name = %job.name, attempt = job.attempts);

        async move {
            let Some(handler) = self.registry.resolve(&job.name) else {
                let reason = QueueError::UnregisteredHandler(job.name.clone()).to_string();
                warn!("{reason}");
                return Ok(self.queue.fail_permanently(&job.id, &token, &reason).await?.into());
            };

            let result = self.run_handler(handler, &job, &token).await;
            match result {
                Ok(()) => {
                    if self.queue.ack(&job.id, &token).await? {
                        Ok(JobOutcome::Completed)
                    } else {
                        warn!("Lease lost before ack; another worker may run this job again");
                        Ok(JobOutcome::Stale)
                    }
                }
                Err(err) => {
                    self.queue.observer().handler_failed(&job, &err);
                    let outcome = match &err {
                        JobError::Retryable(msg) => self.queue.fail(&job.id, &token, msg).await?,
                        JobError::Permanent(msg) => self.queue.fail_permanently(&job.id, &token, msg).await?,
                    };
                    Ok(outcome.into())
                }
            }
        }
        .instrument(span)
        .await
    }

    async fn run_handler(&self, handler: Arc<dyn JobHandler>, job: &Job, token: &LeaseToken) -> Result<(), JobError> {
        let guarded = AssertUnwindSafe(handler.handle(job)).catch_unwind();
        let work = async {
            let outcome = match self.config.handler_timeout {
                Some(limit) => match tokio::time::timeout(limit, guarded).await {
                    Ok(outcome) => outcome,
                    Err(_) => return Err(JobError::retryable(format!("handler timed out after {limit:?}"))),
                },
                None => guarded.await,
            };
            outcome.unwrap_or_else(|panic| Err(JobError::retryable(panic_message(panic))))
        };

        match self.config.heartbeat_interval {
            Some(every) => self.with_heartbeat(work, job, token, every).await,
            None => work.await,
        }
    }

    /// Drive `work` while renewing the lease every `every`
    async fn with_heartbeat<F>(&self, work: F, job: &Job, token: &LeaseToken, every: Duration) -> Result<(), JobError>
    where
        F: std::future::Future<Output = Result<(), JobError>>,
    {
        tokio::pin!(work);
        let mut ticker = interval_at(Instant::now() + every, every);
        let mut renewing = true;

        loop {
            tokio::select! {
                result = &mut work => return result,
                _ = ticker.tick(), if renewing => {
                    match self.queue.extend_lease(&job.id, token, self.config.visibility_timeout).await {
                        Ok(true) => debug!("Lease renewed"),
                        Ok(false) => {
                            warn!("Lease lost while handler was running");
                            renewing = false;
                        }
                        Err(e) => warn!(error = %e, "Lease renewal failed"),
                    }
                }
            }
        }
    }
}

/// Handle for a worker started with [`Worker::start`]
pub struct WorkerHandle {
    shutdown_tx: watch::Sender<Option<Duration>>,
    join_handle: JoinHandle<QueueResult<WorkerReport>>,
}

impl WorkerHandle {
    /// Stop polling and wait up to `grace` for in-flight jobs.
    ///
    /// Jobs still running after `grace` are abandoned; their leases lapse and
    /// another worker picks them up.
    pub async fn shutdown(self, grace: Duration) -> QueueResult<WorkerReport> {
        // Err only when the loop already exited
        let _ = self.shutdown_tx.send(Some(grace));
        self.join_handle
            .await
            .map_err(|e| QueueError::Internal(format!("Worker join error: {e}")))?
    }

    pub fn is_finished(&self) -> bool {
        self.join_handle.is_finished()
    }
}

async fn drain(in_flight: &mut JoinSet<QueueResult<JobOutcome>>, report: &mut WorkerReport) {
    while let Some(done) = in_flight.join_next().await {
        report.record(&flatten(done));
    }
}

fn flatten(joined: Result<QueueResult<JobOutcome>, tokio::task::JoinError>) -> QueueResult<JobOutcome> {
    let outcome = joined.map_err(|e| QueueError::Internal(format!("job task failed: {e}")))?;
    if let Err(e) = &outcome {
        error!(error = %e, "Failed to record job outcome");
    }
    outcome
}

fn panic_message(panic: Box<dyn std::any::Any + Send>) -> String {
    let detail = panic
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| panic.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "non-string panic payload".to_string());
    format!("handler panicked: {detail}")
}
