//! # kennel-queue: durable background jobs
//!
//! A job queue built around visibility-timeout leases:
//!
//! - **At-least-once delivery**: a leased job that is neither acked nor failed
//!   before its lease lapses becomes claimable again.
//! - **Lease tokens**: every lease carries a fresh token; ack, fail and
//!   extend calls with a stale token are ignored.
//! - **Retry with backoff**: failures reschedule the job until
//!   `max_attempts` leases were granted, then it moves to a dead-letter queue.
//! - **Scheduler and worker loops** that only talk to the queue.
//!
//! Backends: in-memory (always available) and Redis (feature `redis`).
//!
//! ```rust,no_run
//! use std::time::Duration;
//! use kennel_queue::prelude::*;
//! use serde_json::json;
//!
//! # async fn demo() -> QueueResult<()> {
//! let queue = JobQueue::in_memory();
//!
//! let mut registry = JobRegistry::new();
//! registry.register("email.send", handler_fn(|job: Job| async move {
//!     println!("sending to {}", job.payload["to"]);
//!     Ok(())
//! }))?;
//!
//! queue.enqueue("email.send", json!({"to": "ada@example.com"}), EnqueueOptions::new()).await?;
//!
//! let worker = Worker::new(queue.clone(), registry, WorkerConfig::default());
//! let handle = worker.start();
//! tokio::time::sleep(Duration::from_millis(50)).await;
//! handle.shutdown(Duration::from_secs(5)).await?;
//! # Ok(())
//! # }
//! ```

pub mod backend;
pub mod backoff;
pub mod clock;
pub mod config;
pub mod error;
pub mod job;
pub mod observability;
pub mod queue;
pub mod scheduler;
pub mod types;
pub mod worker;

pub use backend::{memory::MemoryBackend, Insertion, QueueBackend, QueueStats};
pub use backoff::BackoffPolicy;
pub use clock::{Clock, ManualClock, SharedClock, SystemClock};
pub use config::{backend_from_config, ConfigSnapshot, Driver, QueueConfig, SchedulerConfig, WorkerConfig};
pub use error::{JobError, QueueError, QueueResult};
pub use job::{handler_fn, typed_handler_fn, JobHandler, JobRegistry};
pub use observability::{DeliveryOutcome, EventRecorder, LiveMetrics, NoopObserver, QueueObserver};
pub use queue::{FailOutcome, JobQueue};
pub use scheduler::Scheduler;
pub use types::{EnqueueOptions, Job, JobEvent, JobId, JobState, LeaseToken, WorkerId};
pub use worker::{JobOutcome, Worker, WorkerHandle, WorkerReport};

#[cfg(feature = "redis")]
pub use backend::redis::RedisBackend;

/// Common imports for queue producers and workers
pub mod prelude {
    pub use crate::{
        handler_fn, typed_handler_fn, EnqueueOptions, Job, JobError, JobHandler, JobId, JobQueue, JobRegistry,
        QueueResult, Scheduler, Worker, WorkerConfig,
    };

    pub use async_trait::async_trait;
}
