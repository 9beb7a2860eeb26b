use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use super::hooks::{DeliveryOutcome, QueueObserver};
use crate::{Job, JobError, JobId};

/// Live counters for queue operations.
///
/// Register it as the queue's observer (or inside a
/// [`CompositeObserver`](super::CompositeObserver)) and read
/// [`LiveMetrics::snapshot`] whenever needed.
#[derive(Default)]
pub struct LiveMetrics {
    jobs_enqueued: AtomicU64,
    jobs_leased: AtomicU64,
    jobs_completed: AtomicU64,
    jobs_retried: AtomicU64,
    jobs_dead_lettered: AtomicU64,
    jobs_requeued: AtomicU64,
    stale_leases: AtomicU64,
    handler_failures: AtomicU64,
    rate_limited: AtomicU64,

    // Per-job-name metrics
    by_name: RwLock<HashMap<String, JobNameMetrics>>,

    deliveries: RwLock<HashMap<DeliveryOutcome, u64>>,
    delivery_latency_total: RwLock<Duration>,
    latency_samples: AtomicU64,
}

/// Per-job-name counters
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobNameMetrics {
    pub enqueued: u64,
    pub completed: u64,
    pub retried: u64,
    pub dead_lettered: u64,
    /// Total time from availability to completion, in milliseconds
    pub total_run_ms: u64,
}

impl JobNameMetrics {
    /// Mean time from availability to completion
    pub fn average_run_time(&self) -> Option<Duration> {
        (self.completed > 0).then(|| Duration::from_millis(self.total_run_ms / self.completed))
    }
}

/// Point-in-time copy of [`LiveMetrics`]
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub jobs_enqueued: u64,
    pub jobs_leased: u64,
    pub jobs_completed: u64,
    pub jobs_retried: u64,
    pub jobs_dead_lettered: u64,
    pub jobs_requeued: u64,
    pub stale_leases: u64,
    pub handler_failures: u64,
    pub rate_limited: u64,
    pub by_name: HashMap<String, JobNameMetrics>,
    pub deliveries: HashMap<String, u64>,
    pub timestamp: DateTime<Utc>,
}

impl MetricsSnapshot {
    /// Share of finished jobs (completed or dead-lettered) that completed
    pub fn success_rate(&self) -> f64 {
        let finished = self.jobs_completed + self.jobs_dead_lettered;
        if finished == 0 {
            return 1.0;
        }
        self.jobs_completed as f64 / finished as f64
    }
}

impl LiveMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            jobs_enqueued: self.jobs_enqueued.load(Ordering::Relaxed),
            jobs_leased: self.jobs_leased.load(Ordering::Relaxed),
            jobs_completed: self.jobs_completed.load(Ordering::Relaxed),
            jobs_retried: self.jobs_retried.load(Ordering::Relaxed),
            jobs_dead_lettered: self.jobs_dead_lettered.load(Ordering::Relaxed),
            jobs_requeued: self.jobs_requeued.load(Ordering::Relaxed),
            stale_leases: self.stale_leases.load(Ordering::Relaxed),
            handler_failures: self.handler_failures.load(Ordering::Relaxed),
            rate_limited: self.rate_limited.load(Ordering::Relaxed),
            by_name: self.by_name.read().clone(),
            deliveries: self
                .deliveries
                .read()
                .iter()
                .map(|(outcome, count)| (outcome.as_str().to_string(), *count))
                .collect(),
            timestamp: Utc::now(),
        }
    }

    /// Count for one delivery outcome
    pub fn deliveries(&self, outcome: DeliveryOutcome) -> u64 {
        self.deliveries.read().get(&outcome).copied().unwrap_or(0)
    }

    /// Mean latency across deliveries that reported one
    pub fn average_delivery_latency(&self) -> Option<Duration> {
        let samples = self.latency_samples.load(Ordering::Relaxed);
        let total = *self.delivery_latency_total.read();
        u32::try_from(samples)
            .ok()
            .filter(|n| *n > 0)
            .map(|n| total / n)
    }

    fn update_name(&self, name: &str, update: impl FnOnce(&mut JobNameMetrics)) {
        let mut by_name = self.by_name.write();
        update(by_name.entry(name.to_string()).or_default());
    }
}

impl QueueObserver for LiveMetrics {
    fn job_enqueued(&self, job: &Job) {
        self.jobs_enqueued.fetch_add(1, Ordering::Relaxed);
        self.update_name(&job.name, |m| m.enqueued += 1);
    }

    fn job_leased(&self, _job: &Job) {
        self.jobs_leased.fetch_add(1, Ordering::Relaxed);
    }

    fn job_completed(&self, job: &Job, at: DateTime<Utc>) {
        self.jobs_completed.fetch_add(1, Ordering::Relaxed);
        let run_ms = (at - job.available_at).num_milliseconds().max(0) as u64;
        self.update_name(&job.name, |m| {
            m.completed += 1;
            m.total_run_ms = m.total_run_ms.saturating_add(run_ms);
        });
    }

    fn job_retry_scheduled(&self, job: &Job, _error: &str) {
        self.jobs_retried.fetch_add(1, Ordering::Relaxed);
        self.update_name(&job.name, |m| m.retried += 1);
    }

    fn job_dead_lettered(&self, job: &Job, _error: &str) {
        self.jobs_dead_lettered.fetch_add(1, Ordering::Relaxed);
        self.update_name(&job.name, |m| m.dead_lettered += 1);
    }

    fn job_requeued(&self, _job: &Job) {
        self.jobs_requeued.fetch_add(1, Ordering::Relaxed);
    }

    fn stale_lease(&self, _job_id: &JobId, _operation: &'static str) {
        self.stale_leases.fetch_add(1, Ordering::Relaxed);
    }

    fn handler_failed(&self, _job: &Job, _error: &JobError) {
        self.handler_failures.fetch_add(1, Ordering::Relaxed);
    }

    fn delivery_outcome(&self, _topic: &str, outcome: DeliveryOutcome, latency: Option<Duration>) {
        *self.deliveries.write().entry(outcome).or_insert(0) += 1;
        if let Some(latency) = latency {
            *self.delivery_latency_total.write() += latency;
            self.latency_samples.fetch_add(1, Ordering::Relaxed);
        }
    }

    fn rate_limited(&self, _destination: &str) {
        self.rate_limited.fetch_add(1, Ordering::Relaxed);
    }
}
