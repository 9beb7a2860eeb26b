//! Fixed-interval task scheduler.
//!
//! Each registered task enqueues a job every `interval`. Slots sit on a grid
//! of whole multiples of `interval` since the unix epoch, independent of when
//! a process registered the task; when ticks are missed (process asleep, slow
//! loop) the task fires once for the current slot and skips ahead to the next
//! one. Every slot's job carries an idempotency key of the form
//! `schedule:{task}:{slot_ms}`, so several schedulers ticking against one
//! store enqueue each slot once while its job is live.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::watch;
use tracing::{debug, error, info, instrument};

use crate::{clock::to_chrono, config::SchedulerConfig, EnqueueOptions, JobQueue, QueueError, QueueResult};

/// Produces the payload for each scheduled run
pub type PayloadFactory = Arc<dyn Fn() -> Value + Send + Sync>;

struct ScheduledTask {
    name: String,
    interval: Duration,
    job_name: String,
    payload: PayloadFactory,
    options: EnqueueOptions,
    next_run_at: DateTime<Utc>,
}

/// Read-only view of a registered task
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskInfo {
    pub name: String,
    pub interval: Duration,
    pub job_name: String,
    pub next_run_at: DateTime<Utc>,
}

/// Enqueues jobs for registered tasks on a fixed cadence
pub struct Scheduler {
    queue: JobQueue,
    config: SchedulerConfig,
    tasks: Mutex<Vec<ScheduledTask>>,
}

impl Scheduler {
    pub fn new(queue: JobQueue) -> Self {
        Self::with_config(queue, SchedulerConfig::default())
    }

    pub fn with_config(queue: JobQueue, config: SchedulerConfig) -> Self {
        Self {
            queue,
            config,
            tasks: Mutex::new(Vec::new()),
        }
    }

    /// Register a task that enqueues `job_name` every `interval`.
    ///
    /// The first run covers the grid slot containing the registration time and
    /// happens on the next tick. A zero interval fires on every tick.
    pub fn add_task<F>(
        &self,
        name: impl Into<String>,
        interval: Duration,
        job_name: impl Into<String>,
        payload_factory: F,
    ) -> QueueResult<()>
    where
        F: Fn() -> Value + Send + Sync + 'static,
    {
        self.add_task_with_options(name, interval, job_name, payload_factory, EnqueueOptions::default())
    }

    /// Like [`Scheduler::add_task`] with per-job options (attempts, backoff).
    ///
    /// Any idempotency key in `options` is replaced by the per-slot key.
    pub fn add_task_with_options<F>(
        &self,
        name: impl Into<String>,
        interval: Duration,
        job_name: impl Into<String>,
        payload_factory: F,
        options: EnqueueOptions,
    ) -> QueueResult<()>
    where
        F: Fn() -> Value + Send + Sync + 'static,
    {
        let name = name.into();
        to_chrono(interval)?;

        let mut tasks = self.tasks.lock();
        if tasks.iter().any(|task| task.name == name) {
            return Err(QueueError::TaskAlreadyRegistered(name));
        }

        let job_name = job_name.into();
        let next_run_at = slot_at(self.queue.clock().now(), interval);
        info!(task = %name, job_name = %job_name, ?interval, %next_run_at, "Registered scheduled task");
        tasks.push(ScheduledTask {
            name,
            interval,
            job_name,
            payload: Arc::new(payload_factory),
            options,
            next_run_at,
        });
        Ok(())
    }

    /// Snapshot of registered tasks
    pub fn tasks(&self) -> Vec<TaskInfo> {
        self.tasks
            .lock()
            .iter()
            .map(|task| TaskInfo {
                name: task.name.clone(),
                interval: task.interval,
                job_name: task.job_name.clone(),
                next_run_at: task.next_run_at,
            })
            .collect()
    }

    /// Enqueue a job for every due task and advance its next run.
    ///
    /// Returns how many jobs this tick created. A slot whose job another
    /// scheduler already enqueued is advanced past but not counted. A task
    /// whose enqueue fails keeps its slot and is retried on the next tick;
    /// the first such error is returned after all due tasks were attempted.
    #[instrument(skip(self))]
    pub async fn tick(&self) -> QueueResult<usize> {
        let now = self.queue.clock().now();

        let due: Vec<(String, String, PayloadFactory, EnqueueOptions, DateTime<Utc>, DateTime<Utc>)> = self
            .tasks
            .lock()
            .iter()
            .filter(|task| task.next_run_at <= now)
            .map(|task| {
                let slot = slot_at(now, task.interval);
                (
                    task.name.clone(),
                    task.job_name.clone(),
                    task.payload.clone(),
                    task.options.clone(),
                    task.next_run_at,
                    slot,
                )
            })
            .collect();

        let mut fired = 0;
        let mut first_error = None;
        for (name, job_name, payload, options, due_at, slot) in due {
            let options = options.with_idempotency_key(format!("schedule:{name}:{}", slot.timestamp_millis()));
            match self.queue.enqueue_unique(&job_name, payload(), options).await {
                Ok(insertion) => {
                    if insertion.created {
                        fired += 1;
                        debug!(task = %name, job_id = %insertion.job_id, %slot, "Scheduled task fired");
                    } else {
                        debug!(task = %name, job_id = %insertion.job_id, %slot, "Slot already enqueued elsewhere");
                    }
                    self.advance(&name, due_at, now);
                }
                Err(e) => {
                    error!(task = %name, error = %e, "Failed to enqueue scheduled task");
                    first_error.get_or_insert(e);
                }
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(fired),
        }
    }

    /// Tick every poll interval until `max_loops` ticks ran, or forever.
    ///
    /// Tick errors are logged and do not stop the loop.
    pub async fn run(&self, max_loops: Option<u64>) -> QueueResult<u64> {
        let (_tx, rx) = watch::channel(false);
        self.run_until(max_loops, rx).await
    }

    /// [`Scheduler::run`] that also stops when `shutdown` turns true
    pub async fn run_until(&self, max_loops: Option<u64>, mut shutdown: watch::Receiver<bool>) -> QueueResult<u64> {
        let mut loops = 0;
        info!(poll_interval = ?self.config.poll_interval, "Scheduler started");

        while max_loops.map_or(true, |max| loops < max) && !*shutdown.borrow() {
            loops += 1;
            if let Err(e) = self.tick().await {
                error!(error = %e, "Scheduler tick failed");
            }
            if max_loops.is_some_and(|max| loops >= max) {
                break;
            }
            tokio::select! {
                _ = tokio::time::sleep(self.config.poll_interval) => {}
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }

        info!(loops, "Scheduler stopped");
        Ok(loops)
    }

    fn advance(&self, name: &str, due_at: DateTime<Utc>, now: DateTime<Utc>) {
        let mut tasks = self.tasks.lock();
        if let Some(task) = tasks.iter_mut().find(|task| task.name == name && task.next_run_at == due_at) {
            task.next_run_at = next_slot(now, task.interval);
        }
    }
}

fn step_millis(interval: Duration) -> i64 {
    i64::try_from(interval.as_millis()).unwrap_or(i64::MAX).max(1)
}

/// Start of the grid slot containing `now`. Zero-interval tasks have no
/// grid; each tick is its own slot.
fn slot_at(now: DateTime<Utc>, interval: Duration) -> DateTime<Utc> {
    if interval.is_zero() {
        return now;
    }
    let step = step_millis(interval);
    let start = now.timestamp_millis().div_euclid(step).saturating_mul(step);
    DateTime::from_timestamp_millis(start).unwrap_or(now)
}

/// First grid slot strictly after `now`.
/// A zero interval is due again on the next tick.
fn next_slot(now: DateTime<Utc>, interval: Duration) -> DateTime<Utc> {
    if interval.is_zero() {
        return now;
    }
    let next = slot_at(now, interval)
        .timestamp_millis()
        .saturating_add(step_millis(interval));
    DateTime::from_timestamp_millis(next).unwrap_or(DateTime::<Utc>::MAX_UTC)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(seconds: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(seconds, 0).single().unwrap()
    }

    #[test]
    fn test_slot_is_anchored_on_the_epoch_grid() {
        assert_eq!(slot_at(at(120), Duration::from_secs(60)), at(120));
        assert_eq!(slot_at(at(179), Duration::from_secs(60)), at(120));
        assert_eq!(slot_at(at(101), Duration::from_secs(30)), at(90));
    }

    #[test]
    fn test_next_slot_moves_one_interval() {
        assert_eq!(next_slot(at(120), Duration::from_secs(60)), at(180));
        assert_eq!(next_slot(at(150), Duration::from_secs(60)), at(180));
    }

    #[test]
    fn test_next_slot_coalesces_missed_runs() {
        // Three slots missed: fire once, resume on the grid
        assert_eq!(next_slot(at(310), Duration::from_secs(60)), at(360));
    }

    #[test]
    fn test_zero_interval_is_due_every_tick() {
        assert_eq!(slot_at(at(150), Duration::ZERO), at(150));
        assert_eq!(next_slot(at(150), Duration::ZERO), at(150));
    }

    #[test]
    fn test_huge_interval_does_not_overflow() {
        let slot = slot_at(at(1_700_000_000), Duration::from_secs(u64::MAX));
        assert_eq!(slot, DateTime::<Utc>::UNIX_EPOCH);
        assert_eq!(next_slot(at(1_700_000_000), Duration::from_secs(u64::MAX)), DateTime::<Utc>::MAX_UTC);
    }
}
