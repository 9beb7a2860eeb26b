use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use kennel_queue::{SharedClock, SystemClock};
use parking_lot::Mutex;

use super::{InboxStore, DEFAULT_INBOX_TTL};
use crate::{MessagingError, MessagingResult};

/// Inbox kept in process memory
#[derive(Clone)]
pub struct InMemoryInbox {
    // message id -> expiry
    records: Arc<Mutex<HashMap<String, DateTime<Utc>>>>,
    clock: SharedClock,
    default_ttl: Duration,
}

impl InMemoryInbox {
    pub fn new() -> Self {
        Self {
            records: Arc::new(Mutex::new(HashMap::new())),
            clock: Arc::new(SystemClock),
            default_ttl: DEFAULT_INBOX_TTL,
        }
    }

    pub fn with_clock(mut self, clock: SharedClock) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_default_ttl(mut self, ttl: Duration) -> Self {
        self.default_ttl = ttl;
        self
    }

    pub fn len(&self) -> usize {
        self.records.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn expiry(&self, ttl: Option<Duration>) -> MessagingResult<DateTime<Utc>> {
        let ttl = chrono::Duration::from_std(ttl.unwrap_or(self.default_ttl))
            .map_err(|e| MessagingError::Store(format!("inbox ttl out of range: {e}")))?;
        Ok(self.clock.now() + ttl)
    }
}

impl Default for InMemoryInbox {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl InboxStore for InMemoryInbox {
    async fn has_processed(&self, message_id: &str) -> MessagingResult<bool> {
        let now = self.clock.now();
        Ok(self
            .records
            .lock()
            .get(message_id)
            .is_some_and(|expires_at| *expires_at > now))
    }

    async fn mark_processed(&self, message_id: &str, ttl: Option<Duration>) -> MessagingResult<()> {
        let expires_at = self.expiry(ttl)?;
        self.records.lock().insert(message_id.to_string(), expires_at);
        Ok(())
    }

    async fn mark_if_new(&self, message_id: &str, ttl: Option<Duration>) -> MessagingResult<bool> {
        let now = self.clock.now();
        let expires_at = self.expiry(ttl)?;
        let mut records = self.records.lock();
        match records.get(message_id) {
            Some(existing) if *existing > now => Ok(false),
            _ => {
                records.insert(message_id.to_string(), expires_at);
                Ok(true)
            }
        }
    }

    async fn purge_expired(&self) -> MessagingResult<usize> {
        let now = self.clock.now();
        let mut records = self.records.lock();
        let before = records.len();
        records.retain(|_, expires_at| *expires_at > now);
        Ok(before - records.len())
    }
}
