//! Stripe webhook handling
//!
//! Verifies deliveries, records them in the `stripe_webhook_events` ledger and
//! routes each event to the subscription reconciler or the checkout
//! materializer. Also exposes the replay tooling used by the worker.

use std::sync::Arc;

use serde::Serialize;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::client::StripeConfig;
use crate::error::{BillingError, BillingResult};
use crate::event::{
    CheckoutSessionObject, EventKind, InvoiceObject, SubscriptionObject, WebhookEvent,
};
use crate::materializer::{CheckoutMaterializer, MaterializeOutcome};
use crate::reconciler::{ReconcileOutcome, SubscriptionReconciler};
use crate::signature::verify_signature;
use crate::store::{BillingStore, ClaimResult, ProcessingResult, WebhookEventRecord};

/// Events stuck in `processing` for longer than this may be claimed again
pub const PROCESSING_TIMEOUT_MINUTES: i32 = 30;

/// What a handled event did
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EventEffect {
    Subscription(ReconcileOutcome),
    Checkout(MaterializeOutcome),
    /// Invoice not tied to a subscription
    Skipped,
    Unhandled,
}

/// How a delivery was settled. Every variant is acknowledged with a 200.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EventDisposition {
    Processed(EventEffect),
    Duplicate { existing: Option<ProcessingResult> },
    /// Failed in a way a redelivery cannot fix
    Rejected { reason: String },
}

/// Webhook handler for Stripe events
pub struct WebhookHandler {
    webhook_secret: String,
    tolerance_secs: i64,
    store: Arc<dyn BillingStore>,
    reconciler: SubscriptionReconciler,
    materializer: CheckoutMaterializer,
}

impl WebhookHandler {
    pub fn new(
        config: &StripeConfig,
        store: Arc<dyn BillingStore>,
        reconciler: SubscriptionReconciler,
        materializer: CheckoutMaterializer,
    ) -> Self {
        Self {
            webhook_secret: config.webhook_secret.clone(),
            tolerance_secs: config.webhook_tolerance_secs,
            store,
            reconciler,
            materializer,
        }
    }

    /// Verify the `stripe-signature` header and parse the event
    pub fn verify_event(&self, payload: &str, signature: &str) -> BillingResult<WebhookEvent> {
        self.verify_event_at(payload, signature, OffsetDateTime::now_utc().unix_timestamp())
    }

    pub fn verify_event_at(
        &self,
        payload: &str,
        signature: &str,
        now: i64,
    ) -> BillingResult<WebhookEvent> {
        verify_signature(
            payload,
            signature,
            &self.webhook_secret,
            self.tolerance_secs,
            now,
        )?;

        let event = WebhookEvent::from_json(payload)?;
        tracing::debug!(
            event_type = %event.type_,
            event_id = %event.id,
            livemode = event.livemode,
            "Webhook signature verified"
        );
        Ok(event)
    }

    /// Handle a verified Stripe event.
    ///
    /// The ledger claim is a single `INSERT ... ON CONFLICT ... RETURNING`, so
    /// two concurrent deliveries of one event cannot both process it. Returns
    /// `Err` only for failures worth a redelivery.
    pub async fn handle_event(&self, event: WebhookEvent) -> BillingResult<EventDisposition> {
        let payload = serde_json::to_value(&event)?;

        let claim = self
            .store
            .claim_event(&event, &payload, PROCESSING_TIMEOUT_MINUTES)
            .await
            .map_err(|e| {
                tracing::error!(
                    event_id = %event.id,
                    error = %e,
                    "Failed to claim webhook event for processing"
                );
                e
            })?;

        if let ClaimResult::Duplicate { existing } = claim {
            let reason = match existing {
                Some(ProcessingResult::Success) => "already processed successfully",
                Some(ProcessingResult::Processing) => "currently being processed by another worker",
                Some(ProcessingResult::Rejected) => "previously rejected",
                Some(_) => "exists with another status",
                None => "unknown status",
            };
            tracing::info!(
                event_id = %event.id,
                event_type = %event.type_,
                reason = %reason,
                "Duplicate webhook event"
            );
            return Ok(EventDisposition::Duplicate { existing });
        }

        tracing::info!(
            event_type = %event.type_,
            event_id = %event.id,
            "Processing Stripe webhook event"
        );

        let result = self.process_event(&event).await;

        let (processing_result, error_message) = ledger_status(&result);
        self.record_result(&event, processing_result, error_message.as_deref())
            .await;

        match result {
            Ok(effect) => Ok(EventDisposition::Processed(effect)),
            Err(e) if e.is_retryable() => {
                tracing::error!(
                    event_id = %event.id,
                    event_type = %event.type_,
                    error = %e,
                    "Webhook processing failed, Stripe will retry"
                );
                Err(e)
            }
            Err(e) => {
                tracing::warn!(
                    event_id = %event.id,
                    event_type = %event.type_,
                    error = %e,
                    "Webhook event rejected"
                );
                Ok(EventDisposition::Rejected {
                    reason: e.to_string(),
                })
            }
        }
    }

    /// Route an event to its handler without touching the ledger
    pub async fn process_event(&self, event: &WebhookEvent) -> BillingResult<EventEffect> {
        match event.kind() {
            EventKind::SubscriptionUpdated => {
                let subscription: SubscriptionObject = event.object()?;
                let outcome = self.reconciler.subscription_updated(&subscription).await?;
                subscription_effect(outcome)
            }
            EventKind::SubscriptionDeleted => {
                let subscription: SubscriptionObject = event.object()?;
                let outcome = self.reconciler.subscription_deleted(&subscription).await?;
                subscription_effect(outcome)
            }
            EventKind::InvoicePaymentFailed => {
                let invoice: InvoiceObject = event.object()?;
                match self.reconciler.payment_failed(&invoice).await? {
                    Some(outcome) => subscription_effect(outcome),
                    None => Ok(EventEffect::Skipped),
                }
            }
            EventKind::InvoicePaymentSucceeded => {
                let invoice: InvoiceObject = event.object()?;
                match self.reconciler.payment_succeeded(&invoice).await? {
                    Some(outcome) => subscription_effect(outcome),
                    None => Ok(EventEffect::Skipped),
                }
            }
            EventKind::CheckoutSessionCompleted => {
                let session: CheckoutSessionObject = event.object()?;
                let outcome = self.materializer.session_completed(&session).await?;
                Ok(EventEffect::Checkout(outcome))
            }
            EventKind::Unhandled => {
                tracing::debug!(event_type = %event.type_, "Unhandled webhook event type");
                Ok(EventEffect::Unhandled)
            }
        }
    }

    /// Update the ledger row; retried once since a lost update leaves the
    /// event looking stuck
    async fn record_result(
        &self,
        event: &WebhookEvent,
        result: ProcessingResult,
        error_message: Option<&str>,
    ) {
        let Err(e) = self
            .store
            .finish_event(&event.id, result, error_message)
            .await
        else {
            return;
        };

        tracing::warn!(
            event_id = %event.id,
            error = %e,
            "First attempt to update webhook event failed, retrying..."
        );

        if let Err(retry_err) = self
            .store
            .finish_event(&event.id, result, error_message)
            .await
        {
            tracing::error!(
                event_id = %event.id,
                event_type = %event.type_,
                processing_result = result.as_str(),
                error_message = ?error_message,
                first_error = %e,
                retry_error = %retry_err,
                "Failed to update webhook ledger after retry, event may appear stuck in processing"
            );
        }
    }

    // ============ WEBHOOK REPLAY FUNCTIONALITY ============

    /// List failed webhook events that can be replayed
    pub async fn list_failed_webhooks(
        &self,
        limit: i64,
        offset: i64,
    ) -> BillingResult<Vec<WebhookEventRecord>> {
        self.store
            .list_events(Some(ProcessingResult::Error), limit, offset)
            .await
    }

    /// List webhook events with an optional status filter
    pub async fn list_webhooks(
        &self,
        status_filter: Option<&str>,
        limit: i64,
        offset: i64,
    ) -> BillingResult<Vec<WebhookEventRecord>> {
        let status = match status_filter {
            Some(raw) => Some(ProcessingResult::parse(raw).ok_or_else(|| {
                BillingError::InvalidInput(format!("Unknown processing status: {}", raw))
            })?),
            None => None,
        };
        self.store.list_events(status, limit, offset).await
    }

    /// Re-run a recorded event from its stored payload
    pub async fn replay_webhook(&self, stripe_event_id: &str) -> BillingResult<WebhookReplayResult> {
        tracing::info!(
            stripe_event_id = %stripe_event_id,
            "Attempting to replay webhook event"
        );

        let record = self.store.find_event(stripe_event_id).await?.ok_or_else(|| {
            BillingError::NotFound(format!(
                "Webhook event {} not found in ledger",
                stripe_event_id
            ))
        })?;

        let event: WebhookEvent = serde_json::from_value(record.payload.clone()).map_err(|e| {
            BillingError::WebhookPayloadInvalid(format!(
                "Stored payload for {} is unreadable: {}",
                stripe_event_id, e
            ))
        })?;

        let note = format!(
            "Replay initiated. Previous status: {}. Previous error: {}",
            record.processing_result,
            record.error_message.as_deref().unwrap_or("none")
        );
        self.store
            .finish_event(stripe_event_id, ProcessingResult::Processing, Some(&note))
            .await?;

        let process_result = self.process_event(&event).await;

        let (new_status, new_error) = ledger_status(&process_result);
        self.store
            .finish_event(stripe_event_id, new_status, new_error.as_deref())
            .await?;

        tracing::info!(
            stripe_event_id = %stripe_event_id,
            previous_status = %record.processing_result,
            new_status = new_status.as_str(),
            success = process_result.is_ok(),
            "Webhook replay completed"
        );

        Ok(WebhookReplayResult {
            record_id: record.id,
            stripe_event_id: stripe_event_id.to_string(),
            event_type: record.event_type,
            previous_status: record.processing_result,
            previous_error: record.error_message,
            new_status: new_status.as_str().to_string(),
            new_error,
            success: process_result.is_ok(),
        })
    }

    /// Replay reset events, then failed ones, oldest first up to `max_events`.
    /// Rejected events are left alone unless reset by hand.
    pub async fn replay_all_failed(
        &self,
        max_events: Option<i64>,
    ) -> BillingResult<Vec<WebhookReplayResult>> {
        let limit = max_events.unwrap_or(100);

        let mut candidates = self
            .store
            .oldest_events(ProcessingResult::PendingReplay, limit)
            .await?;
        let remaining = limit - candidates.len() as i64;
        if remaining > 0 {
            candidates.extend(
                self.store
                    .oldest_events(ProcessingResult::Error, remaining)
                    .await?,
            );
        }

        let mut results = Vec::with_capacity(candidates.len());

        for record in candidates {
            match self.replay_webhook(&record.stripe_event_id).await {
                Ok(result) => results.push(result),
                Err(e) => {
                    tracing::error!(
                        stripe_event_id = %record.stripe_event_id,
                        error = %e,
                        "Failed to replay webhook"
                    );
                    results.push(WebhookReplayResult {
                        record_id: record.id,
                        stripe_event_id: record.stripe_event_id,
                        event_type: record.event_type,
                        previous_status: record.processing_result,
                        previous_error: record.error_message,
                        new_status: ProcessingResult::Error.as_str().to_string(),
                        new_error: Some(e.to_string()),
                        success: false,
                    });
                }
            }
        }

        Ok(results)
    }

    /// Reset a stuck or failed webhook so the next delivery or replay reprocesses it
    pub async fn reset_stuck_webhook(&self, stripe_event_id: &str) -> BillingResult<()> {
        if !self.store.reset_event(stripe_event_id).await? {
            return Err(BillingError::NotFound(format!(
                "Webhook {} not found or not in resettable state",
                stripe_event_id
            )));
        }

        tracing::info!(
            stripe_event_id = %stripe_event_id,
            "Webhook reset for replay"
        );

        Ok(())
    }

    /// Delete successfully processed ledger rows older than `days`
    pub async fn cleanup(&self, days: i32) -> BillingResult<u64> {
        let deleted = self.store.prune_events(days).await?;
        if deleted > 0 {
            tracing::info!(deleted = deleted, days = days, "Pruned webhook ledger");
        }
        Ok(deleted)
    }
}

/// Retryable failures stay `error` for redelivery and replay; the rest are
/// `rejected` for good
fn ledger_status<T>(result: &BillingResult<T>) -> (ProcessingResult, Option<String>) {
    match result {
        Ok(_) => (ProcessingResult::Success, None),
        Err(e) if e.is_retryable() => (ProcessingResult::Error, Some(e.to_string())),
        Err(e) => (ProcessingResult::Rejected, Some(e.to_string())),
    }
}

/// A lost status write is fatal so Stripe redelivers; the email has already
/// been attempted or queued by then
fn subscription_effect(outcome: ReconcileOutcome) -> BillingResult<EventEffect> {
    match outcome.write_error() {
        Some(error) => Err(BillingError::Database(error.to_string())),
        None => Ok(EventEffect::Subscription(outcome)),
    }
}

/// Result of a webhook replay operation
#[derive(Debug, Clone, Serialize)]
pub struct WebhookReplayResult {
    pub record_id: Uuid,
    pub stripe_event_id: String,
    pub event_type: String,
    pub previous_status: String,
    pub previous_error: Option<String>,
    pub new_status: String,
    pub new_error: Option<String>,
    pub success: bool,
}
