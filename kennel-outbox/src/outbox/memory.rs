use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use kennel_queue::{SharedClock, SystemClock};
use parking_lot::Mutex;
use serde_json::Value;
use tracing::debug;

use super::{OutboxEntry, OutboxEntryId, OutboxStore};
use crate::{MessagingError, MessagingResult};

#[derive(Default)]
struct OutboxState {
    next_id: u64,
    entries: BTreeMap<OutboxEntryId, OutboxEntry>,
}

/// Outbox kept in process memory, ordered by id
#[derive(Clone)]
pub struct InMemoryOutbox {
    state: Arc<Mutex<OutboxState>>,
    clock: SharedClock,
}

impl InMemoryOutbox {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(OutboxState::default())),
            clock: Arc::new(SystemClock),
        }
    }

    pub fn with_clock(mut self, clock: SharedClock) -> Self {
        self.clock = clock;
        self
    }

    pub fn len(&self) -> usize {
        self.state.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for InMemoryOutbox {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl OutboxStore for InMemoryOutbox {
    async fn add(&self, topic: &str, payload: Value) -> MessagingResult<OutboxEntryId> {
        let now = self.clock.now();
        let mut state = self.state.lock();
        state.next_id += 1;
        let id = OutboxEntryId(state.next_id);
        state.entries.insert(id, OutboxEntry::new(id, topic, payload, now));
        debug!(outbox_id = %id, topic, "Staged outbox entry");
        Ok(id)
    }

    async fn fetch_unprocessed(&self, limit: usize, topics: Option<&[String]>) -> MessagingResult<Vec<OutboxEntry>> {
        let state = self.state.lock();
        Ok(state
            .entries
            .values()
            .filter(|entry| !entry.is_processed() && entry.matches(topics))
            .take(limit)
            .cloned()
            .collect())
    }

    async fn mark_processed(&self, id: OutboxEntryId) -> MessagingResult<bool> {
        let now = self.clock.now();
        let mut state = self.state.lock();
        let entry = state.entries.get_mut(&id).ok_or(MessagingError::EntryNotFound(id))?;
        if entry.is_processed() {
            return Ok(false);
        }
        entry.processed_at = Some(now);
        Ok(true)
    }

    async fn mark_failed(&self, id: OutboxEntryId, error: &str) -> MessagingResult<()> {
        let mut state = self.state.lock();
        let entry = state.entries.get_mut(&id).ok_or(MessagingError::EntryNotFound(id))?;
        entry.attempts += 1;
        entry.last_error = Some(error.to_string());
        Ok(())
    }

    async fn get(&self, id: OutboxEntryId) -> MessagingResult<Option<OutboxEntry>> {
        Ok(self.state.lock().entries.get(&id).cloned())
    }
}
