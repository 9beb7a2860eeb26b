//! Outbox entries and the store they live in.
//!
//! An entry is created once and flips to processed exactly once. Marking an
//! already-processed entry again is a no-op, so a tick that crashed halfway
//! can simply run again.

pub mod memory;

#[cfg(feature = "redis")]
pub mod redis;

use std::fmt;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::MessagingResult;

/// Monotonic outbox entry id, assigned by the store
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OutboxEntryId(pub u64);

impl OutboxEntryId {
    pub fn value(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for OutboxEntryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u64> for OutboxEntryId {
    fn from(id: u64) -> Self {
        Self(id)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutboxEntry {
    pub id: OutboxEntryId,
    pub topic: String,
    pub payload: Value,
    pub created_at: DateTime<Utc>,
    /// Set once a job was enqueued for this entry
    pub processed_at: Option<DateTime<Utc>>,
    /// Failed hand-offs to the queue
    pub attempts: u32,
    pub last_error: Option<String>,
}

impl OutboxEntry {
    pub fn new(id: OutboxEntryId, topic: impl Into<String>, payload: Value, created_at: DateTime<Utc>) -> Self {
        Self {
            id,
            topic: topic.into(),
            payload,
            created_at,
            processed_at: None,
            attempts: 0,
            last_error: None,
        }
    }

    pub fn is_processed(&self) -> bool {
        self.processed_at.is_some()
    }

    pub(crate) fn matches(&self, topics: Option<&[String]>) -> bool {
        topics.map_or(true, |topics| topics.iter().any(|t| t == &self.topic))
    }
}

/// Staging area for events written alongside a business change.
///
/// Co-locating `add` with the change it describes (same transaction, same
/// store) is the caller's job.
#[async_trait]
pub trait OutboxStore: Send + Sync {
    /// Stage an event and return its id
    async fn add(&self, topic: &str, payload: Value) -> MessagingResult<OutboxEntryId>;

    /// Oldest unprocessed entries first, optionally limited to `topics`
    async fn fetch_unprocessed(&self, limit: usize, topics: Option<&[String]>) -> MessagingResult<Vec<OutboxEntry>>;

    /// Flip an entry to processed. `false` when it already was.
    async fn mark_processed(&self, id: OutboxEntryId) -> MessagingResult<bool>;

    /// Record a failed hand-off; the entry stays unprocessed
    async fn mark_failed(&self, id: OutboxEntryId, error: &str) -> MessagingResult<()>;

    async fn get(&self, id: OutboxEntryId) -> MessagingResult<Option<OutboxEntry>>;
}
