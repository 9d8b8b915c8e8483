//! Persistence seam for the webhook flow
//!
//! [`BillingStore`] is everything the handlers need from the database.
//! [`PgBillingStore`](crate::pg_store::PgBillingStore) is the production
//! implementation; [`MemoryBillingStore`](crate::memory_store::MemoryBillingStore)
//! backs tests and local runs.

use async_trait::async_trait;
use serde::Serialize;
use time::{Date, OffsetDateTime};
use uuid::Uuid;
use wellness_shared::SubscriptionStatus;

use crate::customer::Contact;
use crate::email::{EmailMessage, NotificationKind};
use crate::error::BillingResult;
use crate::event::WebhookEvent;

/// Processing state of a ledger row
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessingResult {
    Processing,
    Success,
    Error,
    PendingReplay,
    /// Failed in a way no retry can fix; never claimed or replayed again
    Rejected,
}

impl ProcessingResult {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProcessingResult::Processing => "processing",
            ProcessingResult::Success => "success",
            ProcessingResult::Error => "error",
            ProcessingResult::PendingReplay => "pending_replay",
            ProcessingResult::Rejected => "rejected",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "processing" => Some(ProcessingResult::Processing),
            "success" => Some(ProcessingResult::Success),
            "error" => Some(ProcessingResult::Error),
            "pending_replay" => Some(ProcessingResult::PendingReplay),
            "rejected" => Some(ProcessingResult::Rejected),
            _ => None,
        }
    }

    /// Rows in these states may be claimed again by a redelivery or replay
    pub fn is_reclaimable(&self) -> bool {
        matches!(self, ProcessingResult::Error | ProcessingResult::PendingReplay)
    }
}

/// Outcome of trying to take ownership of an event in the ledger
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClaimResult {
    Claimed,
    Duplicate { existing: Option<ProcessingResult> },
}

/// Stored webhook event record
#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct WebhookEventRecord {
    pub id: Uuid,
    pub stripe_event_id: String,
    pub event_type: String,
    pub event_timestamp: OffsetDateTime,
    pub payload: serde_json::Value,
    pub processing_result: String,
    pub processing_started_at: Option<OffsetDateTime>,
    pub error_message: Option<String>,
    pub created_at: OffsetDateTime,
}

/// Fields copied from a Stripe event onto `user_subscriptions`.
///
/// `None` leaves the stored value untouched; invoice events only know the status.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscriptionUpdate {
    pub stripe_subscription_id: String,
    pub status: SubscriptionStatus,
    pub current_period_start: Option<OffsetDateTime>,
    pub current_period_end: Option<OffsetDateTime>,
    pub cancel_at_period_end: Option<bool>,
}

impl SubscriptionUpdate {
    pub fn status_only(stripe_subscription_id: impl Into<String>, status: SubscriptionStatus) -> Self {
        Self {
            stripe_subscription_id: stripe_subscription_id.into(),
            status,
            current_period_start: None,
            current_period_end: None,
            cancel_at_period_end: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, sqlx::FromRow)]
pub struct SubscriptionRecord {
    pub id: Uuid,
    pub user_id: Uuid,
    pub stripe_customer_id: String,
    pub stripe_subscription_id: String,
    pub status: String,
    pub current_period_start: Option<OffsetDateTime>,
    pub current_period_end: Option<OffsetDateTime>,
    pub cancel_at_period_end: bool,
    pub updated_at: OffsetDateTime,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewEventBooking {
    pub user_id: Option<Uuid>,
    pub attendee_name: String,
    pub attendee_email: String,
    pub attendee_phone: Option<String>,
    pub event_type: String,
    pub event_title: String,
    pub event_date: Date,
    pub event_time: String,
    pub quantity: i32,
    pub amount_cents: i64,
    pub currency: String,
    pub stripe_session_id: String,
    pub stripe_payment_intent_id: Option<String>,
    pub safety_accepted: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertOutcome {
    Inserted(Uuid),
    /// A booking for this checkout session already exists
    Duplicate,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewCoursePurchase {
    pub user_id: Uuid,
    pub course_id: Uuid,
    pub stripe_session_id: String,
    pub stripe_payment_intent_id: Option<String>,
    pub amount_cents: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, sqlx::FromRow)]
pub struct UpsertOutcome {
    pub id: Uuid,
    /// False when the `(user_id, course_id)` row already existed
    pub created: bool,
}

#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct QueuedNotification {
    pub id: Uuid,
    pub kind: String,
    pub message: serde_json::Value,
    pub status: String,
    pub attempts: i32,
    pub last_error: Option<String>,
    pub created_at: OffsetDateTime,
}

#[async_trait]
pub trait BillingStore: Send + Sync {
    // Webhook ledger

    /// Atomically claim exclusive processing rights for `event`
    async fn claim_event(
        &self,
        event: &WebhookEvent,
        payload: &serde_json::Value,
        stale_after_minutes: i32,
    ) -> BillingResult<ClaimResult>;

    async fn finish_event(
        &self,
        stripe_event_id: &str,
        result: ProcessingResult,
        error_message: Option<&str>,
    ) -> BillingResult<()>;

    async fn find_event(&self, stripe_event_id: &str) -> BillingResult<Option<WebhookEventRecord>>;

    async fn list_events(
        &self,
        status: Option<ProcessingResult>,
        limit: i64,
        offset: i64,
    ) -> BillingResult<Vec<WebhookEventRecord>>;

    /// Rows with `status`, oldest first, for the replay backlog
    async fn oldest_events(
        &self,
        status: ProcessingResult,
        limit: i64,
    ) -> BillingResult<Vec<WebhookEventRecord>>;

    /// Move an errored, rejected or stuck event to `pending_replay`; false if no such row
    async fn reset_event(&self, stripe_event_id: &str) -> BillingResult<bool>;

    /// Delete successfully processed events older than `days`
    async fn prune_events(&self, days: i32) -> BillingResult<u64>;

    // Subscriptions

    /// Apply `update`, returning the row after the write, or `None` when no
    /// local subscription exists for that Stripe id
    async fn update_subscription(
        &self,
        update: &SubscriptionUpdate,
    ) -> BillingResult<Option<SubscriptionRecord>>;

    async fn user_contact(&self, user_id: Uuid) -> BillingResult<Option<Contact>>;

    // Bookings and purchases

    async fn insert_event_booking(&self, booking: &NewEventBooking) -> BillingResult<InsertOutcome>;

    async fn upsert_course_purchase(
        &self,
        purchase: &NewCoursePurchase,
    ) -> BillingResult<UpsertOutcome>;

    async fn course_title(&self, course_id: Uuid) -> BillingResult<Option<String>>;

    // Notification outbox

    async fn enqueue_notification(
        &self,
        kind: NotificationKind,
        message: &EmailMessage,
        error: &str,
    ) -> BillingResult<Uuid>;

    async fn pending_notifications(&self, limit: i64) -> BillingResult<Vec<QueuedNotification>>;

    async fn mark_notification_sent(&self, id: Uuid) -> BillingResult<()>;

    /// Count another failed attempt; `abandon` stops further retries
    async fn record_notification_failure(
        &self,
        id: Uuid,
        error: &str,
        abandon: bool,
    ) -> BillingResult<()>;

    /// Delete sent or abandoned notifications older than `days`
    async fn prune_notifications(&self, days: i32) -> BillingResult<u64>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_processing_result_round_trip() {
        for result in [
            ProcessingResult::Processing,
            ProcessingResult::Success,
            ProcessingResult::Error,
            ProcessingResult::PendingReplay,
            ProcessingResult::Rejected,
        ] {
            assert_eq!(ProcessingResult::parse(result.as_str()), Some(result));
        }
    }

    #[test]
    fn test_only_failed_or_reset_events_are_reclaimable() {
        assert!(ProcessingResult::Error.is_reclaimable());
        assert!(ProcessingResult::PendingReplay.is_reclaimable());
        assert!(!ProcessingResult::Success.is_reclaimable());
        assert!(!ProcessingResult::Processing.is_reclaimable());
        assert!(!ProcessingResult::Rejected.is_reclaimable());
    }
}
