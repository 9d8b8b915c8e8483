// Billing crate clippy configuration
#![allow(clippy::result_large_err)] // BillingError variants carry provider messages
// Test code patterns (expected in test files):
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

//! Studio Billing Module
//!
//! Handles the Stripe webhook for the Studio membership and the storefront.
//!
//! ## Features
//!
//! - **Signature Verification**: HMAC-SHA256 over the raw body with a replay window
//! - **Subscription Reconciliation**: Mirror Stripe status onto `user_subscriptions`
//! - **Bookings**: Record paid event bookings and send the calendar invite
//! - **Course Purchases**: Grant course access and confirm by email
//! - **Notification Outbox**: Park failed emails and retry them from the worker
//! - **Webhook Ledger**: Idempotent processing, replay and cleanup

pub mod calendar;
pub mod client;
pub mod customer;
pub mod email;
pub mod error;
pub mod event;
pub mod materializer;
pub mod memory_store;
pub mod metadata;
pub mod outbox;
pub mod pg_store;
pub mod reconciler;
pub mod signature;
pub mod store;
pub mod webhooks;


use std::sync::Arc;

use sqlx::PgPool;

// Calendar
pub use calendar::{CalendarConfig, CalendarEvent};

// Client
pub use client::{StripeClient, StripeConfig};

// Customer
pub use customer::{Contact, CustomerDirectory, StaticCustomerDirectory, StripeCustomerDirectory};

// Email
pub use email::{
    BillingEmailService, EmailConfig, EmailMessage, Mailer, Notification, NotificationKind,
    RecordingMailer, ResendMailer,
};

// Error
pub use error::{BillingError, BillingResult};

// Events
pub use event::{EventKind, WebhookEvent};

// Checkout
pub use materializer::{CheckoutMaterializer, MaterializeOutcome};
pub use metadata::{CheckoutIntent, MetadataError};

// Outbox
pub use outbox::{DeliveryOutcome, FlushSummary, NotificationOutbox, MAX_ATTEMPTS};

// Subscriptions
pub use reconciler::{ReconcileOutcome, SubscriptionReconciler, WriteOutcome};

// Storage
pub use memory_store::MemoryBillingStore;
pub use pg_store::PgBillingStore;
pub use store::{BillingStore, ProcessingResult, WebhookEventRecord};

// Webhooks
pub use webhooks::{EventDisposition, EventEffect, WebhookHandler, WebhookReplayResult};

pub const DEFAULT_EVENT_TIMEZONE: &str = "Europe/London";

/// Everything the billing service needs, loaded once at startup
#[derive(Debug, Clone)]
pub struct BillingConfig {
    pub stripe: StripeConfig,
    pub email: EmailConfig,
    pub calendar: CalendarConfig,
}

impl BillingConfig {
    pub fn from_env() -> BillingResult<Self> {
        let stripe = StripeConfig::from_env()?;
        let email = EmailConfig::from_env()?;

        let calendar = CalendarConfig {
            timezone: std::env::var("EVENT_TIMEZONE")
                .unwrap_or_else(|_| DEFAULT_EVENT_TIMEZONE.to_string()),
            organizer_name: std::env::var("EVENT_ORGANIZER_NAME")
                .unwrap_or_else(|_| "Studio".to_string()),
            organizer_email: email.admin_address.clone(),
            location: std::env::var("EVENT_LOCATION").ok().filter(|l| !l.is_empty()),
        };

        Ok(Self {
            stripe,
            email,
            calendar,
        })
    }
}

/// Main billing service that wires the webhook flow together
pub struct BillingService {
    pub webhooks: Arc<WebhookHandler>,
    pub outbox: NotificationOutbox,
    pub store: Arc<dyn BillingStore>,
}

impl BillingService {
    /// Create a new billing service from environment variables
    pub fn from_env(pool: PgPool) -> BillingResult<Self> {
        Self::new(BillingConfig::from_env()?, pool)
    }

    /// Production wiring: Postgres, Resend and the Stripe customer API
    pub fn new(config: BillingConfig, pool: PgPool) -> BillingResult<Self> {
        let store: Arc<dyn BillingStore> = Arc::new(PgBillingStore::new(pool));
        let mailer: Arc<dyn Mailer> = Arc::new(ResendMailer::from_config(&config.email)?);
        let customers: Arc<dyn CustomerDirectory> = Arc::new(StripeCustomerDirectory::new(
            StripeClient::new(config.stripe.clone()),
        ));

        Ok(Self::with_components(config, store, mailer, customers))
    }

    /// Wire the service from explicit parts
    pub fn with_components(
        config: BillingConfig,
        store: Arc<dyn BillingStore>,
        mailer: Arc<dyn Mailer>,
        customers: Arc<dyn CustomerDirectory>,
    ) -> Self {
        let email = BillingEmailService::new(config.email);
        let outbox = NotificationOutbox::new(store.clone(), mailer);

        let reconciler =
            SubscriptionReconciler::new(store.clone(), customers, email.clone(), outbox.clone());
        let materializer =
            CheckoutMaterializer::new(store.clone(), email, outbox.clone(), config.calendar);

        let webhooks = WebhookHandler::new(&config.stripe, store.clone(), reconciler, materializer);

        Self {
            webhooks: Arc::new(webhooks),
            outbox,
            store,
        }
    }
}
