//! Processed-message ledger.
//!
//! A record for a message id means its side effect already happened. Records
//! expire after a TTL; redelivery races are bounded in time. Keys should
//! come from business identity (an outbox entry id), never from a job id.

pub mod memory;

#[cfg(feature = "redis")]
pub mod redis;

use std::time::Duration;

use async_trait::async_trait;

use crate::MessagingResult;

/// TTL used when a caller passes none
pub const DEFAULT_INBOX_TTL: Duration = Duration::from_secs(24 * 60 * 60);

#[async_trait]
pub trait InboxStore: Send + Sync {
    /// Whether an unexpired record exists for `message_id`
    async fn has_processed(&self, message_id: &str) -> MessagingResult<bool>;

    /// Record `message_id`, refreshing the TTL of an existing record
    async fn mark_processed(&self, message_id: &str, ttl: Option<Duration>) -> MessagingResult<()>;

    /// Record `message_id` unless present. `true` when this call created it.
    async fn mark_if_new(&self, message_id: &str, ttl: Option<Duration>) -> MessagingResult<bool>;

    /// Drop expired records, returning how many went
    async fn purge_expired(&self) -> MessagingResult<usize>;
}
