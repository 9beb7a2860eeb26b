//! # kennel-outbox: lossless publishing, duplicate-free consumption
//!
//! - [`OutboxStore`]: business code writes an entry next to the state change
//!   it belongs to; the [`OutboxTick`] later turns each entry into one job.
//! - [`InboxStore`]: consumers record the business id of every message whose
//!   side effect already happened, so redelivered jobs become no-ops.
//!
//! Both stores have an in-memory implementation and, with the `redis`
//! feature, a Redis one.

pub mod error;
pub mod inbox;
pub mod outbox;
pub mod processor;

pub use error::{MessagingError, MessagingResult};
pub use inbox::{memory::InMemoryInbox, InboxStore};
pub use outbox::{memory::InMemoryOutbox, OutboxEntry, OutboxEntryId, OutboxStore};
pub use processor::{
    make_outbox_tick, outbox_job_name, schedule_outbox_tick, OutboxJobPayload, OutboxTick, OUTBOX_JOB_PREFIX,
    OUTBOX_TICK_JOB,
};

#[cfg(feature = "redis")]
pub use inbox::redis::RedisInbox;
#[cfg(feature = "redis")]
pub use outbox::redis::RedisOutbox;
