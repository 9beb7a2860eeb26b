//! # kennel-webhooks: signed, deduplicated webhook delivery
//!
//! Publishing writes one outbox entry per subscription. The outbox tick turns
//! entries into `outbox.{topic}` jobs, and the handler built by
//! [`make_webhook_handler`] POSTs each one as canonical JSON signed with
//! HMAC-SHA256:
//!
//! - 2xx: delivered, recorded in the inbox, job acked
//! - 4xx: recorded in the inbox, job dead-lettered without further attempts
//! - 5xx, timeouts, connection errors: retried with the queue's backoff
//!
//! Receivers check signatures with [`verify_any`], which accepts any secret
//! in a rotation set.

pub mod canonical;
pub mod client;
pub mod delivery;
pub mod error;
pub mod service;
pub mod signing;
pub mod subscriptions;

pub use canonical::{canonical_bytes, canonical_json};
pub use client::{DeliveryRequest, DeliveryResponse, HttpClient, ReqwestClient};
pub use delivery::{make_webhook_handler, RetryPolicy, WebhookConfig, WebhookHandler};
pub use error::{WebhookError, WebhookResult};
pub use service::WebhookService;
pub use signing::{sign, sign_bytes, verify, verify_any, SIGNATURE_ALGORITHM, SIGNATURE_VERSION};
pub use subscriptions::{InMemorySubscriptions, SubscriptionStore, WebhookSubscription};
