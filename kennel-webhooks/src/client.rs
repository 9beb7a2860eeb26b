//! Outbound HTTP for webhook delivery.
//!
//! [`HttpClient`] is the seam tests replace; [`ReqwestClient`] is the real
//! one. Non-2xx responses are returned, not raised: status classification
//! belongs to the delivery handler.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use bytes::Bytes;
use tracing::{debug, info_span, warn, Instrument};

use crate::{WebhookError, WebhookResult};

/// One POST to a webhook endpoint
#[derive(Debug, Clone)]
pub struct DeliveryRequest {
    pub url: String,
    pub headers: Vec<(String, String)>,
    pub body: Bytes,
    /// Upper bound for the whole exchange
    pub timeout: Duration,
}

impl DeliveryRequest {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeliveryResponse {
    pub status: u16,
    pub duration: Duration,
}

impl DeliveryResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

#[async_trait]
pub trait HttpClient: Send + Sync {
    /// Send the request. Errors only for timeouts and transport failures.
    async fn post(&self, request: DeliveryRequest) -> WebhookResult<DeliveryResponse>;
}

/// [`HttpClient`] backed by a pooled `reqwest::Client`
#[derive(Debug, Clone)]
pub struct ReqwestClient {
    client: reqwest::Client,
}

impl ReqwestClient {
    pub fn new(user_agent: &str, connect_timeout: Duration) -> WebhookResult<Self> {
        let client = reqwest::Client::builder()
            .user_agent(user_agent)
            .connect_timeout(connect_timeout)
            .redirect(reqwest::redirect::Policy::none())
            .build()
            .map_err(|e| WebhookError::Configuration(format!("failed to build HTTP client: {e}")))?;
        Ok(Self { client })
    }

    pub fn from_client(client: reqwest::Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl HttpClient for ReqwestClient {
    async fn post(&self, request: DeliveryRequest) -> WebhookResult<DeliveryResponse> {
        let span = info_span!("webhook_post", url = %request.url);
        async move {
            let url = reqwest::Url::parse(&request.url)
                .map_err(|e| WebhookError::InvalidUrl(format!("{}: {e}", request.url)))?;
            let mut builder = self.client.post(url).timeout(request.timeout).body(request.body.clone());
            for (name, value) in &request.headers {
                builder = builder.header(name.as_str(), value.as_str());
            }

            let started = Instant::now();
            let response = builder.send().await.map_err(|e| {
                warn!(error = %e, "Webhook request failed");
                if e.is_timeout() {
                    WebhookError::Timeout(request.timeout)
                } else if e.is_builder() {
                    WebhookError::InvalidUrl(e.to_string())
                } else {
                    WebhookError::Network(e.to_string())
                }
            })?;

            let status = response.status().as_u16();
            // Drain so the connection returns to the pool
            let _ = response.bytes().await;
            let duration = started.elapsed();
            debug!(status, duration_ms = duration.as_millis() as u64, "Webhook response");

            Ok(DeliveryResponse { status, duration })
        }
        .instrument(span)
        .await
    }
}
