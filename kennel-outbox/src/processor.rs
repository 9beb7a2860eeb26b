//! Outbox processor: moves staged entries onto the job queue.
//!
//! Each tick fetches a bounded batch of unprocessed entries, enqueues one
//! `outbox.{topic}` job per entry and marks the entry processed. Jobs carry
//! the idempotency key `outbox:{id}`, which collapses a re-run while the
//! first job is still live; a crash between enqueue and mark can still
//! produce a duplicate later, which consumers absorb through the inbox.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use kennel_queue::{EnqueueOptions, Job, JobError, JobHandler, JobQueue, JobRegistry, QueueResult, Scheduler};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{debug, info, instrument, warn};

use crate::{MessagingResult, OutboxEntry, OutboxEntryId, OutboxStore};

/// Job name prefix for entries handed to the queue
pub const OUTBOX_JOB_PREFIX: &str = "outbox.";

/// Job name the scheduled tick runs under
pub const OUTBOX_TICK_JOB: &str = "kennel.outbox_tick";

const DEFAULT_BATCH_SIZE: usize = 100;

pub fn outbox_job_name(topic: &str) -> String {
    format!("{OUTBOX_JOB_PREFIX}{topic}")
}

/// Payload of an `outbox.{topic}` job
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutboxJobPayload {
    pub outbox_id: OutboxEntryId,
    pub topic: String,
    pub payload: Value,
}

impl OutboxJobPayload {
    pub fn from_job(job: &Job) -> Result<Self, JobError> {
        serde_json::from_value(job.payload.clone())
            .map_err(|e| JobError::permanent(format!("malformed outbox job payload: {e}")))
    }
}

impl From<&OutboxEntry> for OutboxJobPayload {
    fn from(entry: &OutboxEntry) -> Self {
        Self {
            outbox_id: entry.id,
            topic: entry.topic.clone(),
            payload: entry.payload.clone(),
        }
    }
}

/// One pass of the outbox processor. Also a [`JobHandler`] so the scheduler can drive it.
#[derive(Clone)]
pub struct OutboxTick {
    outbox: Arc<dyn OutboxStore>,
    queue: JobQueue,
    batch_size: usize,
    topics: Option<Vec<String>>,
    options: EnqueueOptions,
}

/// Build a tick moving entries from `outbox` onto `queue`
pub fn make_outbox_tick(outbox: Arc<dyn OutboxStore>, queue: JobQueue) -> OutboxTick {
    OutboxTick {
        outbox,
        queue,
        batch_size: DEFAULT_BATCH_SIZE,
        topics: None,
        options: EnqueueOptions::new(),
    }
}

impl OutboxTick {
    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    /// Only move entries for these topics
    pub fn with_topics(mut self, topics: Vec<String>) -> Self {
        self.topics = Some(topics);
        self
    }

    /// Attempts and backoff for the jobs this tick enqueues
    pub fn with_job_options(mut self, options: EnqueueOptions) -> Self {
        self.options = options;
        self
    }

    /// Move one batch. Returns how many entries were handed to the queue.
    ///
    /// An entry whose enqueue fails gets `mark_failed` and stays for the
    /// next tick; store errors abort the pass.
    #[instrument(skip(self))]
    pub async fn run_once(&self) -> MessagingResult<usize> {
        let batch = self
            .outbox
            .fetch_unprocessed(self.batch_size, self.topics.as_deref())
            .await?;

        let mut moved = 0;
        for entry in &batch {
            let payload = serde_json::to_value(OutboxJobPayload::from(entry))?;
            let options = self.options.clone().with_idempotency_key(format!("outbox:{}", entry.id));

            match self.queue.enqueue(outbox_job_name(&entry.topic), payload, options).await {
                Ok(job_id) => {
                    if self.outbox.mark_processed(entry.id).await? {
                        moved += 1;
                    }
                    debug!(outbox_id = %entry.id, job_id = %job_id, topic = %entry.topic, "Outbox entry enqueued");
                }
                Err(e) => {
                    warn!(outbox_id = %entry.id, error = %e, "Failed to enqueue outbox entry");
                    self.outbox.mark_failed(entry.id, &e.to_string()).await?;
                }
            }
        }

        if moved > 0 {
            info!(moved, fetched = batch.len(), "Outbox tick");
        }
        Ok(moved)
    }
}

#[async_trait]
impl JobHandler for OutboxTick {
    async fn handle(&self, _job: &Job) -> Result<(), JobError> {
        self.run_once().await?;
        Ok(())
    }
}

/// Register `tick` under [`OUTBOX_TICK_JOB`] and have `scheduler` enqueue it every `interval`
pub fn schedule_outbox_tick(
    scheduler: &Scheduler,
    registry: &mut JobRegistry,
    tick: OutboxTick,
    interval: Duration,
) -> QueueResult<()> {
    registry.register(OUTBOX_TICK_JOB, tick)?;
    // One attempt: a failed tick is superseded by the next slot
    scheduler.add_task_with_options(
        "outbox-processor",
        interval,
        OUTBOX_TICK_JOB,
        || json!({}),
        EnqueueOptions::new().with_max_attempts(1),
    )
}
