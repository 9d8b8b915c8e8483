//! Billing error types

use thiserror::Error;

pub type BillingResult<T> = Result<T, BillingError>;

#[derive(Debug, Error)]
pub enum BillingError {
    #[error("Webhook signature verification failed")]
    WebhookSignatureInvalid,

    #[error("Webhook payload could not be decoded: {0}")]
    WebhookPayloadInvalid(String),

    #[error("Webhook event not supported: {0}")]
    WebhookEventNotSupported(String),

    #[error("Invalid checkout metadata: {0}")]
    InvalidMetadata(String),

    #[error("Database error: {0}")]
    Database(String),

    #[error("Email delivery failed: {0}")]
    Email(String),

    #[error("Stripe API error: {0}")]
    StripeApi(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl BillingError {
    /// Whether the request should fail so that Stripe redelivers the event.
    ///
    /// Anything caused by the event itself (bad signature, bad metadata) will
    /// fail the same way on every delivery, so it is acknowledged instead.
    pub fn is_retryable(&self) -> bool {
        match self {
            BillingError::Database(_)
            | BillingError::Email(_)
            | BillingError::StripeApi(_)
            | BillingError::Internal(_)
            | BillingError::Config(_) => true,
            BillingError::WebhookSignatureInvalid
            | BillingError::WebhookPayloadInvalid(_)
            | BillingError::WebhookEventNotSupported(_)
            | BillingError::InvalidMetadata(_)
            | BillingError::NotFound(_)
            | BillingError::InvalidInput(_) => false,
        }
    }
}

impl From<sqlx::Error> for BillingError {
    fn from(err: sqlx::Error) -> Self {
        BillingError::Database(err.to_string())
    }
}

impl From<reqwest::Error> for BillingError {
    fn from(err: reqwest::Error) -> Self {
        BillingError::Email(err.to_string())
    }
}

impl From<serde_json::Error> for BillingError {
    fn from(err: serde_json::Error) -> Self {
        BillingError::Internal(format!("JSON serialization: {}", err))
    }
}

impl From<stripe::StripeError> for BillingError {
    fn from(err: stripe::StripeError) -> Self {
        BillingError::StripeApi(err.to_string())
    }
}
