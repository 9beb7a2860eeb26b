use std::time::Duration;

use kennel_outbox::MessagingError;
use thiserror::Error;

pub type WebhookResult<T> = Result<T, WebhookError>;

#[derive(Error, Debug, Clone)]
pub enum WebhookError {
    #[error("Request timed out after {0:?}")]
    Timeout(Duration),

    #[error("Network error: {0}")]
    Network(String),

    #[error("Invalid URL: {0}")]
    InvalidUrl(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Signing error: {0}")]
    Signing(String),

    #[error("Client configuration error: {0}")]
    Configuration(String),

    #[error(transparent)]
    Messaging(#[from] MessagingError),
}

impl WebhookError {
    /// Whether a later attempt could succeed
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Timeout(_) | Self::Network(_) => true,
            Self::Messaging(err) => !matches!(err, MessagingError::Serialization(_)),
            Self::InvalidUrl(_) | Self::Serialization(_) | Self::Signing(_) | Self::Configuration(_) => false,
        }
    }
}

impl From<serde_json::Error> for WebhookError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}
