//! Publishing side: one outbox entry per matching subscription.

use std::sync::Arc;

use kennel_outbox::{OutboxEntryId, OutboxStore};
use kennel_queue::{SharedClock, SystemClock};
use serde_json::{json, Value};
use tracing::{debug, instrument};

use crate::{SubscriptionStore, WebhookResult};

pub struct WebhookService {
    outbox: Arc<dyn OutboxStore>,
    subscriptions: Arc<dyn SubscriptionStore>,
    clock: SharedClock,
}

impl WebhookService {
    pub fn new(outbox: Arc<dyn OutboxStore>, subscriptions: Arc<dyn SubscriptionStore>) -> Self {
        Self {
            outbox,
            subscriptions,
            clock: Arc::new(SystemClock),
        }
    }

    pub fn with_clock(mut self, clock: SharedClock) -> Self {
        self.clock = clock;
        self
    }

    /// Stage `payload` for every subscriber of `topic`.
    ///
    /// Each entry carries the envelope
    /// `{event: {topic, payload, version, created_at}, subscription: {id, topic, url, secret}}`.
    /// Returns the last entry id, or `None` when nobody subscribes.
    #[instrument(skip(self, payload))]
    pub async fn publish(&self, topic: &str, payload: Value, version: u32) -> WebhookResult<Option<OutboxEntryId>> {
        let event = json!({
            "topic": topic,
            "payload": payload,
            "version": version,
            "created_at": self.clock.now().to_rfc3339(),
        });

        let mut last = None;
        for subscription in self.subscriptions.for_topic(topic) {
            let envelope = json!({
                "event": event,
                "subscription": subscription,
            });
            let id = self.outbox.add(topic, envelope).await?;
            debug!(outbox_id = %id, subscription = %subscription.id, "Staged webhook");
            last = Some(id);
        }
        Ok(last)
    }
}
