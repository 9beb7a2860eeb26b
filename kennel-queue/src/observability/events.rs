use futures::StreamExt;
use tokio::sync::broadcast;
use tokio_stream::wrappers::BroadcastStream;

use super::hooks::QueueObserver;
use crate::backend::BoxStream;
use crate::{Job, JobEvent};
use chrono::{DateTime, Utc};

/// Observer that republishes lifecycle transitions as [`JobEvent`]s.
///
/// Subscribers that fall behind lose the oldest events rather than blocking
/// the queue.
#[derive(Clone)]
pub struct EventRecorder {
    sender: broadcast::Sender<JobEvent>,
}

impl EventRecorder {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<JobEvent> {
        self.sender.subscribe()
    }

    /// Event stream for observability, skipping anything lost to lag
    pub fn stream(&self) -> BoxStream<JobEvent> {
        let stream = BroadcastStream::new(self.sender.subscribe())
            .filter_map(|result| async move { result.ok() });
        Box::pin(stream)
    }

    fn publish(&self, event: JobEvent) {
        // No subscribers is fine
        let _ = self.sender.send(event);
    }
}

impl Default for EventRecorder {
    fn default() -> Self {
        Self::new(1000)
    }
}

impl QueueObserver for EventRecorder {
    fn job_enqueued(&self, job: &Job) {
        self.publish(JobEvent::Enqueued {
            job_id: job.id.clone(),
            name: job.name.clone(),
            available_at: job.available_at,
            at: job.created_at,
        });
    }

    fn job_leased(&self, job: &Job) {
        if let Some(leased_until) = job.leased_until {
            self.publish(JobEvent::Leased {
                job_id: job.id.clone(),
                attempt: job.attempts,
                leased_until,
                at: Utc::now(),
            });
        }
    }

    fn job_completed(&self, job: &Job, at: DateTime<Utc>) {
        self.publish(JobEvent::Completed {
            job_id: job.id.clone(),
            at,
        });
    }

    fn job_retry_scheduled(&self, job: &Job, error: &str) {
        self.publish(JobEvent::RetryScheduled {
            job_id: job.id.clone(),
            attempt: job.attempts,
            available_at: job.available_at,
            error: error.to_string(),
            at: Utc::now(),
        });
    }

    fn job_dead_lettered(&self, job: &Job, error: &str) {
        self.publish(JobEvent::DeadLettered {
            job_id: job.id.clone(),
            error: error.to_string(),
            at: job.dead_lettered_at.unwrap_or_else(Utc::now),
        });
    }

    fn job_requeued(&self, job: &Job) {
        self.publish(JobEvent::Requeued {
            job_id: job.id.clone(),
            at: job.available_at,
        });
    }
}
