//! Job handler that delivers `outbox.{topic}` jobs as signed webhooks.
//!
//! Per job:
//!
//! 1. Read `{outbox_id, topic, payload}`; the payload falls back to the
//!    outbox entry when the job carries none.
//! 2. Return early when the inbox already holds `webhook:{outbox_id}`.
//! 3. Pick the destination: the subscription embedded by
//!    [`WebhookService`](crate::WebhookService), else the topic lookups.
//!    No destination means nothing to deliver.
//! 4. POST the canonical JSON body with its HMAC-SHA256 signature.
//! 5. 2xx and 4xx both record the inbox entry; only 2xx succeeds. 4xx is a
//!    permanent failure unless listed in [`RetryPolicy::transient_statuses`].

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use kennel_outbox::{InboxStore, OutboxEntryId, OutboxStore};
use kennel_queue::{
    observability::{NoopObserver, SharedObserver},
    ConfigSnapshot, DeliveryOutcome, Job, JobError, JobHandler, QueueError, QueueResult,
};
use serde_json::Value;
use tracing::{debug, info, info_span, warn, Instrument};

use crate::{
    canonical_bytes, sign_bytes, DeliveryRequest, HttpClient, ReqwestClient, WebhookError, WebhookResult,
    SIGNATURE_ALGORITHM, SIGNATURE_VERSION,
};

/// Resolves a topic to a URL or a signing secret
pub type TopicLookup = Arc<dyn Fn(&str) -> Option<String> + Send + Sync>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WebhookConfig {
    pub timeout: Duration,
    pub user_agent: String,
    /// Sent as `X-Payload-Version` when the event does not carry one
    pub payload_version: u32,
    /// How long a delivered event id stays in the inbox
    pub inbox_ttl: Duration,
}

impl Default for WebhookConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(10),
            user_agent: concat!("kennel-webhooks/", env!("CARGO_PKG_VERSION")).to_string(),
            payload_version: 1,
            inbox_ttl: Duration::from_secs(24 * 60 * 60),
        }
    }
}

impl WebhookConfig {
    /// Read `webhooks.*` keys, falling back to defaults
    pub fn from_snapshot(snapshot: &ConfigSnapshot) -> QueueResult<Self> {
        let defaults = Self::default();
        let config = Self {
            timeout: snapshot
                .get_seconds("webhooks.timeout_seconds")?
                .unwrap_or(defaults.timeout),
            user_agent: snapshot
                .get_string("webhooks.user_agent")
                .unwrap_or(defaults.user_agent),
            payload_version: snapshot
                .parse("webhooks.payload_version")?
                .unwrap_or(defaults.payload_version),
            inbox_ttl: snapshot
                .get_seconds("webhooks.inbox_ttl_seconds")?
                .unwrap_or(defaults.inbox_ttl),
        };
        if config.timeout.is_zero() {
            return Err(QueueError::InvalidConfig("webhooks.timeout_seconds must be positive".into()));
        }
        Ok(config)
    }
}

/// Which non-2xx answers are worth retrying besides 5xx
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RetryPolicy {
    pub transient_statuses: Vec<u16>,
}

impl RetryPolicy {
    /// Retry 408 and 429 on top of 5xx
    pub fn lenient() -> Self {
        Self {
            transient_statuses: vec![408, 429],
        }
    }

    pub fn is_transient(&self, status: u16) -> bool {
        status >= 500 || self.transient_statuses.contains(&status)
    }
}

/// Where and how one message goes out
struct Destination {
    url: String,
    secret: String,
    subscription_id: Option<String>,
    body: Value,
    version: u32,
}

#[derive(Clone)]
pub struct WebhookHandler {
    outbox: Arc<dyn OutboxStore>,
    inbox: Arc<dyn InboxStore>,
    url_for_topic: TopicLookup,
    secret_for_topic: TopicLookup,
    retry_policy: RetryPolicy,
    config: WebhookConfig,
    client: Arc<dyn HttpClient>,
    /// False once a caller supplied its own client
    owns_client: bool,
    observer: SharedObserver,
}

/// Build the delivery handler around a pooled HTTP client with `timeout`
pub fn make_webhook_handler<U, S>(
    outbox: Arc<dyn OutboxStore>,
    inbox: Arc<dyn InboxStore>,
    url_for_topic: U,
    secret_for_topic: S,
    timeout: Duration,
    retry_policy: RetryPolicy,
) -> WebhookResult<WebhookHandler>
where
    U: Fn(&str) -> Option<String> + Send + Sync + 'static,
    S: Fn(&str) -> Option<String> + Send + Sync + 'static,
{
    let config = WebhookConfig {
        timeout,
        ..WebhookConfig::default()
    };
    let client = ReqwestClient::new(&config.user_agent, timeout)?;

    Ok(WebhookHandler {
        outbox,
        inbox,
        url_for_topic: Arc::new(url_for_topic),
        secret_for_topic: Arc::new(secret_for_topic),
        retry_policy,
        config,
        client: Arc::new(client),
        owns_client: true,
        observer: Arc::new(NoopObserver),
    })
}

impl WebhookHandler {
    pub fn with_client(mut self, client: Arc<dyn HttpClient>) -> Self {
        self.client = client;
        self.owns_client = false;
        self
    }

    pub fn with_retry_policy(mut self, retry_policy: RetryPolicy) -> Self {
        self.retry_policy = retry_policy;
        self
    }

    pub fn with_observer(mut self, observer: SharedObserver) -> Self {
        self.observer = observer;
        self
    }

    /// Replace the config.
    ///
    /// The built-in client is rebuilt with the new user agent and connect
    /// timeout; a client passed to [`WebhookHandler::with_client`] is kept and
    /// only sees the per-request timeout.
    pub fn with_config(mut self, config: WebhookConfig) -> WebhookResult<Self> {
        if self.owns_client {
            self.client = Arc::new(ReqwestClient::new(&config.user_agent, config.timeout)?);
        }
        self.config = config;
        Ok(self)
    }

    pub fn config(&self) -> &WebhookConfig {
        &self.config
    }

    fn inbox_key(outbox_id: OutboxEntryId) -> String {
        format!("webhook:{outbox_id}")
    }

    async fn message(&self, job: &Job) -> Result<(OutboxEntryId, String, Value), JobError> {
        let outbox_id: OutboxEntryId = job
            .payload
            .get("outbox_id")
            .cloned()
            .map(serde_json::from_value::<OutboxEntryId>)
            .transpose()
            .map_err(|e| JobError::permanent(format!("invalid outbox_id: {e}")))?
            .ok_or_else(|| JobError::permanent("job payload has no outbox_id"))?;

        let stored = match job.payload.get("payload") {
            Some(payload) if !payload.is_null() => None,
            _ => Some(
                self.outbox
                    .get(outbox_id)
                    .await?
                    .ok_or_else(|| JobError::permanent(format!("outbox entry {outbox_id} no longer exists")))?,
            ),
        };

        let topic = job
            .payload
            .get("topic")
            .and_then(Value::as_str)
            .map(str::to_string)
            .or_else(|| stored.as_ref().map(|entry| entry.topic.clone()))
            .ok_or_else(|| JobError::permanent("job payload has no topic"))?;

        let payload = match stored {
            Some(entry) => entry.payload,
            None => job.payload.get("payload").cloned().unwrap_or(Value::Null),
        };
        Ok((outbox_id, topic, payload))
    }

    fn destination(&self, topic: &str, payload: Value) -> Option<Destination> {
        if let Some(envelope) = Envelope::parse(&payload) {
            let version = envelope.version.unwrap_or(self.config.payload_version);
            return Some(Destination {
                url: envelope.url,
                secret: envelope.secret,
                subscription_id: envelope.subscription_id,
                body: envelope.event,
                version,
            });
        }

        let url = (self.url_for_topic)(topic)?;
        let secret = (self.secret_for_topic)(topic)?;
        Some(Destination {
            url,
            secret,
            subscription_id: None,
            body: payload,
            version: self.config.payload_version,
        })
    }

    fn request(
        &self,
        event_id: OutboxEntryId,
        topic: &str,
        attempt: u32,
        dest: &Destination,
    ) -> WebhookResult<DeliveryRequest> {
        let body = canonical_bytes(&dest.body);
        let signature = sign_bytes(&dest.secret, &body)?;

        let mut headers = vec![
            ("Content-Type".to_string(), "application/json".to_string()),
            ("X-Event-Id".to_string(), event_id.to_string()),
            ("X-Topic".to_string(), topic.to_string()),
            ("X-Attempt".to_string(), attempt.to_string()),
            ("X-Signature".to_string(), signature),
            ("X-Signature-Alg".to_string(), SIGNATURE_ALGORITHM.to_string()),
            ("X-Signature-Version".to_string(), SIGNATURE_VERSION.to_string()),
            ("X-Payload-Version".to_string(), dest.version.to_string()),
        ];
        if let Some(id) = &dest.subscription_id {
            headers.push(("X-Webhook-Subscription".to_string(), id.clone()));
        }

        Ok(DeliveryRequest {
            url: dest.url.clone(),
            headers,
            body: Bytes::from(body),
            timeout: self.config.timeout,
        })
    }

    async fn deliver(&self, job: &Job) -> Result<(), JobError> {
        let (event_id, topic, payload) = self.message(job).await?;
        let inbox_key = Self::inbox_key(event_id);

        if self.inbox.has_processed(&inbox_key).await? {
            debug!(event_id = %event_id, "Already delivered");
            self.observer.delivery_outcome(&topic, DeliveryOutcome::Duplicate, None);
            return Ok(());
        }

        let Some(dest) = self.destination(&topic, payload) else {
            debug!(topic = %topic, "No webhook subscription for topic");
            self.observer.delivery_outcome(&topic, DeliveryOutcome::Skipped, None);
            return Ok(());
        };

        let request = self.request(event_id, &topic, job.attempts, &dest).map_err(to_job_error)?;
        let response = match self.client.post(request).await {
            Ok(response) => response,
            Err(e) => {
                let outcome = if e.is_transient() {
                    DeliveryOutcome::TransientFailure
                } else {
                    DeliveryOutcome::PermanentFailure
                };
                warn!(error = %e, "Webhook delivery failed");
                self.observer.delivery_outcome(&topic, outcome, None);
                return Err(to_job_error(e));
            }
        };

        let status = response.status;
        if status == 429 {
            self.observer.rate_limited(&dest.url);
        }

        if response.is_success() {
            self.inbox
                .mark_processed(&inbox_key, Some(self.config.inbox_ttl))
                .await?;
            self.observer
                .delivery_outcome(&topic, DeliveryOutcome::Delivered, Some(response.duration));
            info!(status, "Webhook delivered");
            return Ok(());
        }

        if self.retry_policy.is_transient(status) || !(400..500).contains(&status) {
            self.observer
                .delivery_outcome(&topic, DeliveryOutcome::TransientFailure, Some(response.duration));
            warn!(status, "Webhook endpoint failed; will retry");
            return Err(JobError::retryable(format!("webhook endpoint returned {status}")));
        }

        // Retrying cannot change a client error
        self.inbox
            .mark_processed(&inbox_key, Some(self.config.inbox_ttl))
            .await?;
        self.observer
            .delivery_outcome(&topic, DeliveryOutcome::PermanentFailure, Some(response.duration));
        warn!(status, "Webhook endpoint rejected delivery");
        Err(JobError::permanent(format!("webhook endpoint returned {status}")))
    }
}

#[async_trait]
impl JobHandler for WebhookHandler {
    async fn handle(&self, job: &Job) -> Result<(), JobError> {
        let span = info_span!("webhook_delivery", job_id = %job.id, attempt = job.attempts);
        self.deliver(job).instrument(span).await
    }
}

fn to_job_error(err: WebhookError) -> JobError {
    if err.is_transient() {
        JobError::retryable(err.to_string())
    } else {
        JobError::permanent(err.to_string())
    }
}

/// Entry payload written by `WebhookService::publish`
struct Envelope {
    event: Value,
    version: Option<u32>,
    url: String,
    secret: String,
    subscription_id: Option<String>,
}

impl Envelope {
    fn parse(payload: &Value) -> Option<Self> {
        let event = payload.get("event")?;
        let subscription = payload.get("subscription")?;
        Some(Self {
            event: event.clone(),
            version: event
                .get("version")
                .and_then(Value::as_u64)
                .and_then(|v| u32::try_from(v).ok()),
            url: subscription.get("url")?.as_str()?.to_string(),
            secret: subscription.get("secret")?.as_str()?.to_string(),
            subscription_id: subscription.get("id").and_then(Value::as_str).map(str::to_string),
        })
    }
}
