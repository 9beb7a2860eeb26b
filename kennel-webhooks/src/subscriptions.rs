use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// An endpoint that wants events for one topic
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WebhookSubscription {
    pub id: String,
    pub topic: String,
    pub url: String,
    pub secret: String,
}

impl WebhookSubscription {
    pub fn new(topic: impl Into<String>, url: impl Into<String>, secret: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            topic: topic.into(),
            url: url.into(),
            secret: secret.into(),
        }
    }
}

pub trait SubscriptionStore: Send + Sync {
    fn add(&self, subscription: WebhookSubscription);

    /// Subscriptions for `topic` in registration order
    fn for_topic(&self, topic: &str) -> Vec<WebhookSubscription>;

    /// Drop a subscription by id. `false` when unknown.
    fn remove(&self, id: &str) -> bool;
}

#[derive(Clone, Default)]
pub struct InMemorySubscriptions {
    by_topic: Arc<RwLock<HashMap<String, Vec<WebhookSubscription>>>>,
}

impl InMemorySubscriptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a subscription and return it
    pub fn subscribe(&self, topic: &str, url: &str, secret: &str) -> WebhookSubscription {
        let subscription = WebhookSubscription::new(topic, url, secret);
        self.add(subscription.clone());
        subscription
    }
}

impl SubscriptionStore for InMemorySubscriptions {
    fn add(&self, subscription: WebhookSubscription) {
        self.by_topic
            .write()
            .entry(subscription.topic.clone())
            .or_default()
            .push(subscription);
    }

    fn for_topic(&self, topic: &str) -> Vec<WebhookSubscription> {
        self.by_topic.read().get(topic).cloned().unwrap_or_default()
    }

    fn remove(&self, id: &str) -> bool {
        let mut by_topic = self.by_topic.write();
        for subscriptions in by_topic.values_mut() {
            if let Some(pos) = subscriptions.iter().position(|s| s.id == id) {
                subscriptions.remove(pos);
                return true;
            }
        }
        false
    }
}
