//! Application state

use std::sync::Arc;

use wellness_billing::{BillingService, WebhookHandler};

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub webhooks: Arc<WebhookHandler>,
}

impl AppState {
    pub fn new(billing: &BillingService) -> Self {
        Self {
            webhooks: billing.webhooks.clone(),
        }
    }
}
