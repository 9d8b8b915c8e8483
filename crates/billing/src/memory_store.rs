//! In-memory [`BillingStore`] for tests and local development
//!
//! Mirrors the Postgres constraints the webhook flow relies on: unique
//! `stripe_session_id` on bookings, unique `(user_id, course_id)` on purchases
//! and the ledger's claim rules.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use time::{Duration, OffsetDateTime};
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::customer::Contact;
use crate::email::{EmailMessage, NotificationKind};
use crate::error::{BillingError, BillingResult};
use crate::event::WebhookEvent;
use crate::store::{
    BillingStore, ClaimResult, InsertOutcome, NewCoursePurchase, NewEventBooking,
    ProcessingResult, QueuedNotification, SubscriptionRecord, SubscriptionUpdate, UpsertOutcome,
    WebhookEventRecord,
};

#[derive(Default)]
struct MemoryState {
    events: HashMap<String, WebhookEventRecord>,
    subscriptions: HashMap<String, SubscriptionRecord>,
    profiles: HashMap<Uuid, Contact>,
    courses: HashMap<Uuid, String>,
    bookings: Vec<(Uuid, NewEventBooking)>,
    purchases: Vec<(Uuid, NewCoursePurchase)>,
    outbox: Vec<QueuedNotification>,
}

#[derive(Default)]
pub struct MemoryBillingStore {
    state: RwLock<MemoryState>,
    /// When set, domain writes (subscriptions, bookings, purchases) fail
    failing_writes: RwLock<Option<String>>,
    calls: AtomicUsize,
}

impl MemoryBillingStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of store operations performed so far
    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub async fn fail_writes(&self, reason: Option<&str>) {
        *self.failing_writes.write().await = reason.map(str::to_string);
    }

    pub async fn seed_subscription(
        &self,
        user_id: Uuid,
        stripe_customer_id: &str,
        stripe_subscription_id: &str,
        status: &str,
    ) -> SubscriptionRecord {
        let record = SubscriptionRecord {
            id: Uuid::new_v4(),
            user_id,
            stripe_customer_id: stripe_customer_id.to_string(),
            stripe_subscription_id: stripe_subscription_id.to_string(),
            status: status.to_string(),
            current_period_start: None,
            current_period_end: None,
            cancel_at_period_end: false,
            updated_at: OffsetDateTime::now_utc(),
        };
        self.state
            .write()
            .await
            .subscriptions
            .insert(stripe_subscription_id.to_string(), record.clone());
        record
    }

    pub async fn seed_profile(&self, user_id: Uuid, contact: Contact) {
        self.state.write().await.profiles.insert(user_id, contact);
    }

    pub async fn seed_course(&self, course_id: Uuid, title: &str) {
        self.state
            .write()
            .await
            .courses
            .insert(course_id, title.to_string());
    }

    pub async fn subscription(&self, stripe_subscription_id: &str) -> Option<SubscriptionRecord> {
        self.state
            .read()
            .await
            .subscriptions
            .get(stripe_subscription_id)
            .cloned()
    }

    pub async fn bookings(&self) -> Vec<NewEventBooking> {
        self.state
            .read()
            .await
            .bookings
            .iter()
            .map(|(_, b)| b.clone())
            .collect()
    }

    pub async fn purchases(&self) -> Vec<NewCoursePurchase> {
        self.state
            .read()
            .await
            .purchases
            .iter()
            .map(|(_, p)| p.clone())
            .collect()
    }

    /// Shift a ledger row's `created_at` into the past
    pub async fn backdate_event(&self, stripe_event_id: &str, by: Duration) {
        if let Some(record) = self.state.write().await.events.get_mut(stripe_event_id) {
            record.created_at -= by;
        }
    }

    /// Every outbox row regardless of status
    pub async fn outbox(&self) -> Vec<QueuedNotification> {
        self.state.read().await.outbox.clone()
    }

    fn touch(&self) {
        self.calls.fetch_add(1, Ordering::SeqCst);
    }

    async fn check_writes(&self) -> BillingResult<()> {
        match self.failing_writes.read().await.as_ref() {
            Some(reason) => Err(BillingError::Database(reason.clone())),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl BillingStore for MemoryBillingStore {
    async fn claim_event(
        &self,
        event: &WebhookEvent,
        payload: &serde_json::Value,
        stale_after_minutes: i32,
    ) -> BillingResult<ClaimResult> {
        self.touch();
        let now = OffsetDateTime::now_utc();
        let mut state = self.state.write().await;

        if let Some(existing) = state.events.get_mut(&event.id) {
            let status = ProcessingResult::parse(&existing.processing_result);
            let stale = status == Some(ProcessingResult::Processing)
                && existing
                    .processing_started_at
                    .map(|started| started < now - Duration::minutes(stale_after_minutes.into()))
                    .unwrap_or(true);

            if status.map(|s| s.is_reclaimable()).unwrap_or(false) || stale {
                existing.processing_result = ProcessingResult::Processing.as_str().to_string();
                existing.processing_started_at = Some(now);
                existing.error_message = None;
                return Ok(ClaimResult::Claimed);
            }
            return Ok(ClaimResult::Duplicate { existing: status });
        }

        state.events.insert(
            event.id.clone(),
            WebhookEventRecord {
                id: Uuid::new_v4(),
                stripe_event_id: event.id.clone(),
                event_type: event.type_.clone(),
                event_timestamp: OffsetDateTime::from_unix_timestamp(event.created)
                    .unwrap_or(now),
                payload: payload.clone(),
                processing_result: ProcessingResult::Processing.as_str().to_string(),
                processing_started_at: Some(now),
                error_message: None,
                created_at: now,
            },
        );
        Ok(ClaimResult::Claimed)
    }

    async fn finish_event(
        &self,
        stripe_event_id: &str,
        result: ProcessingResult,
        error_message: Option<&str>,
    ) -> BillingResult<()> {
        self.touch();
        if let Some(record) = self.state.write().await.events.get_mut(stripe_event_id) {
            record.processing_result = result.as_str().to_string();
            record.error_message = error_message.map(str::to_string);
        }
        Ok(())
    }

    async fn find_event(&self, stripe_event_id: &str) -> BillingResult<Option<WebhookEventRecord>> {
        self.touch();
        Ok(self.state.read().await.events.get(stripe_event_id).cloned())
    }

    async fn list_events(
        &self,
        status: Option<ProcessingResult>,
        limit: i64,
        offset: i64,
    ) -> BillingResult<Vec<WebhookEventRecord>> {
        self.touch();
        let state = self.state.read().await;
        let mut records: Vec<_> = state
            .events
            .values()
            .filter(|r| status.map(|s| r.processing_result == s.as_str()).unwrap_or(true))
            .cloned()
            .collect();
        records.sort_by(|a, b| b.created_at.cmp(&a.created_at));

        Ok(records
            .into_iter()
            .skip(offset.max(0) as usize)
            .take(limit.max(0) as usize)
            .collect())
    }

    async fn oldest_events(
        &self,
        status: ProcessingResult,
        limit: i64,
    ) -> BillingResult<Vec<WebhookEventRecord>> {
        self.touch();
        let state = self.state.read().await;
        let mut records: Vec<_> = state
            .events
            .values()
            .filter(|r| r.processing_result == status.as_str())
            .cloned()
            .collect();
        records.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        records.truncate(limit.max(0) as usize);

        Ok(records)
    }

    async fn reset_event(&self, stripe_event_id: &str) -> BillingResult<bool> {
        self.touch();
        let mut state = self.state.write().await;
        match state.events.get_mut(stripe_event_id) {
            Some(record)
                if matches!(
                    ProcessingResult::parse(&record.processing_result),
                    Some(
                        ProcessingResult::Processing
                            | ProcessingResult::Error
                            | ProcessingResult::Rejected
                    )
                ) =>
            {
                record.processing_result = ProcessingResult::PendingReplay.as_str().to_string();
                record.error_message = Some("Reset for replay".to_string());
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn prune_events(&self, days: i32) -> BillingResult<u64> {
        self.touch();
        let cutoff = OffsetDateTime::now_utc() - Duration::days(days.into());
        let mut state = self.state.write().await;
        let before = state.events.len();
        state.events.retain(|_, r| {
            !(r.processing_result == ProcessingResult::Success.as_str() && r.created_at < cutoff)
        });
        Ok((before - state.events.len()) as u64)
    }

    async fn update_subscription(
        &self,
        update: &SubscriptionUpdate,
    ) -> BillingResult<Option<SubscriptionRecord>> {
        self.touch();
        self.check_writes().await?;
        let mut state = self.state.write().await;
        let Some(record) = state.subscriptions.get_mut(&update.stripe_subscription_id) else {
            return Ok(None);
        };

        record.status = update.status.as_str().to_string();
        if let Some(start) = update.current_period_start {
            record.current_period_start = Some(start);
        }
        if let Some(end) = update.current_period_end {
            record.current_period_end = Some(end);
        }
        if let Some(cancel) = update.cancel_at_period_end {
            record.cancel_at_period_end = cancel;
        }
        record.updated_at = OffsetDateTime::now_utc();

        Ok(Some(record.clone()))
    }

    async fn user_contact(&self, user_id: Uuid) -> BillingResult<Option<Contact>> {
        self.touch();
        Ok(self.state.read().await.profiles.get(&user_id).cloned())
    }

    async fn insert_event_booking(&self, booking: &NewEventBooking) -> BillingResult<InsertOutcome> {
        self.touch();
        self.check_writes().await?;
        let mut state = self.state.write().await;
        if state
            .bookings
            .iter()
            .any(|(_, b)| b.stripe_session_id == booking.stripe_session_id)
        {
            return Ok(InsertOutcome::Duplicate);
        }
        let id = Uuid::new_v4();
        state.bookings.push((id, booking.clone()));
        Ok(InsertOutcome::Inserted(id))
    }

    async fn upsert_course_purchase(
        &self,
        purchase: &NewCoursePurchase,
    ) -> BillingResult<UpsertOutcome> {
        self.touch();
        self.check_writes().await?;
        let mut state = self.state.write().await;
        if let Some((id, existing)) = state
            .purchases
            .iter_mut()
            .find(|(_, p)| p.user_id == purchase.user_id && p.course_id == purchase.course_id)
        {
            existing.stripe_session_id = purchase.stripe_session_id.clone();
            if purchase.stripe_payment_intent_id.is_some() {
                existing.stripe_payment_intent_id = purchase.stripe_payment_intent_id.clone();
            }
            existing.amount_cents = purchase.amount_cents;
            return Ok(UpsertOutcome {
                id: *id,
                created: false,
            });
        }
        let id = Uuid::new_v4();
        state.purchases.push((id, purchase.clone()));
        Ok(UpsertOutcome { id, created: true })
    }

    async fn course_title(&self, course_id: Uuid) -> BillingResult<Option<String>> {
        self.touch();
        Ok(self.state.read().await.courses.get(&course_id).cloned())
    }

    async fn enqueue_notification(
        &self,
        kind: NotificationKind,
        message: &EmailMessage,
        error: &str,
    ) -> BillingResult<Uuid> {
        self.touch();
        let message = serde_json::to_value(message)
            .map_err(|e| BillingError::Internal(format!("Serialize notification: {}", e)))?;
        let id = Uuid::new_v4();
        self.state.write().await.outbox.push(QueuedNotification {
            id,
            kind: kind.as_str().to_string(),
            message,
            status: "pending".to_string(),
            attempts: 1,
            last_error: Some(error.to_string()),
            created_at: OffsetDateTime::now_utc(),
        });
        Ok(id)
    }

    async fn pending_notifications(&self, limit: i64) -> BillingResult<Vec<QueuedNotification>> {
        self.touch();
        Ok(self
            .state
            .read()
            .await
            .outbox
            .iter()
            .filter(|n| n.status == "pending")
            .take(limit.max(0) as usize)
            .cloned()
            .collect())
    }

    async fn mark_notification_sent(&self, id: Uuid) -> BillingResult<()> {
        self.touch();
        if let Some(n) = self.state.write().await.outbox.iter_mut().find(|n| n.id == id) {
            n.status = "sent".to_string();
        }
        Ok(())
    }

    async fn record_notification_failure(
        &self,
        id: Uuid,
        error: &str,
        abandon: bool,
    ) -> BillingResult<()> {
        self.touch();
        if let Some(n) = self.state.write().await.outbox.iter_mut().find(|n| n.id == id) {
            n.attempts += 1;
            n.last_error = Some(error.to_string());
            n.status = if abandon { "abandoned" } else { "pending" }.to_string();
        }
        Ok(())
    }

    async fn prune_notifications(&self, days: i32) -> BillingResult<u64> {
        self.touch();
        let cutoff = OffsetDateTime::now_utc() - Duration::days(days.into());
        let mut state = self.state.write().await;
        let before = state.outbox.len();
        state
            .outbox
            .retain(|n| n.status == "pending" || n.created_at >= cutoff);
        Ok((before - state.outbox.len()) as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn event(id: &str) -> WebhookEvent {
        serde_json::from_value(json!({
            "id": id,
            "type": "invoice.payment_succeeded",
            "created": 1_717_000_000,
            "data": { "object": {} }
        }))
        .unwrap()
    }

    #[tokio::test]
    async fn test_claim_rules() {
        let store = MemoryBillingStore::new();
        let evt = event("evt_1");
        let payload = json!({});

        assert_eq!(store.claim_event(&evt, &payload, 30).await.unwrap(), ClaimResult::Claimed);
        // still processing and fresh
        assert_eq!(
            store.claim_event(&evt, &payload, 30).await.unwrap(),
            ClaimResult::Duplicate { existing: Some(ProcessingResult::Processing) }
        );

        store
            .finish_event("evt_1", ProcessingResult::Error, Some("boom"))
            .await
            .unwrap();
        assert_eq!(store.claim_event(&evt, &payload, 30).await.unwrap(), ClaimResult::Claimed);

        store.finish_event("evt_1", ProcessingResult::Success, None).await.unwrap();
        assert_eq!(
            store.claim_event(&evt, &payload, 30).await.unwrap(),
            ClaimResult::Duplicate { existing: Some(ProcessingResult::Success) }
        );
    }

    #[tokio::test]
    async fn test_rejected_event_is_never_reclaimed() {
        let store = MemoryBillingStore::new();
        let evt = event("evt_rejected");
        store.claim_event(&evt, &json!({}), 30).await.unwrap();
        store
            .finish_event("evt_rejected", ProcessingResult::Rejected, Some("bad metadata"))
            .await
            .unwrap();

        assert_eq!(
            store.claim_event(&evt, &json!({}), 30).await.unwrap(),
            ClaimResult::Duplicate { existing: Some(ProcessingResult::Rejected) }
        );
    }

    #[tokio::test]
    async fn test_oldest_events_sorted_ascending() {
        let store = MemoryBillingStore::new();
        for id in ["evt_old", "evt_mid", "evt_new"] {
            store.claim_event(&event(id), &json!({}), 30).await.unwrap();
            store.finish_event(id, ProcessingResult::Error, Some("x")).await.unwrap();
        }
        store.backdate_event("evt_old", Duration::hours(2)).await;
        store.backdate_event("evt_mid", Duration::hours(1)).await;

        let oldest = store.oldest_events(ProcessingResult::Error, 2).await.unwrap();
        let ids: Vec<_> = oldest.iter().map(|r| r.stripe_event_id.as_str()).collect();
        assert_eq!(ids, vec!["evt_old", "evt_mid"]);
    }

    #[tokio::test]
    async fn test_stale_processing_is_reclaimed() {
        let store = MemoryBillingStore::new();
        let evt = event("evt_stale");
        store.claim_event(&evt, &json!({}), 30).await.unwrap();
        // a negative window makes any processing row stale
        assert_eq!(
            store.claim_event(&evt, &json!({}), -1).await.unwrap(),
            ClaimResult::Claimed
        );
    }

    #[tokio::test]
    async fn test_reset_only_applies_to_failed_or_stuck() {
        let store = MemoryBillingStore::new();
        store.claim_event(&event("evt_a"), &json!({}), 30).await.unwrap();
        store.finish_event("evt_a", ProcessingResult::Success, None).await.unwrap();
        assert!(!store.reset_event("evt_a").await.unwrap());
        assert!(!store.reset_event("evt_missing").await.unwrap());

        store.claim_event(&event("evt_b"), &json!({}), 30).await.unwrap();
        store.finish_event("evt_b", ProcessingResult::Error, Some("x")).await.unwrap();
        assert!(store.reset_event("evt_b").await.unwrap());
        let record = store.find_event("evt_b").await.unwrap().unwrap();
        assert_eq!(record.processing_result, "pending_replay");
    }

    #[tokio::test]
    async fn test_update_missing_subscription_returns_none() {
        let store = MemoryBillingStore::new();
        let update = SubscriptionUpdate::status_only(
            "sub_missing",
            wellness_shared::SubscriptionStatus::Active,
        );
        assert_eq!(store.update_subscription(&update).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_failing_writes() {
        let store = MemoryBillingStore::new();
        store.fail_writes(Some("connection refused")).await;
        let update = SubscriptionUpdate::status_only(
            "sub_1",
            wellness_shared::SubscriptionStatus::Active,
        );
        let err = store.update_subscription(&update).await.unwrap_err();
        assert!(matches!(err, BillingError::Database(_)));
    }
}
