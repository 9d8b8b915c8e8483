//! Notification delivery with a durable retry queue
//!
//! A send that fails after the database write has already happened is not
//! worth a 500: Stripe would redeliver the event, the write would be a no-op
//! and the email would still be missing. Failed messages are parked in
//! `notification_outbox` instead and retried by the worker.

use std::sync::Arc;

use uuid::Uuid;

use crate::email::{EmailMessage, Mailer, Notification, NotificationKind};
use crate::error::{BillingError, BillingResult};
use crate::store::BillingStore;

/// Give up on a queued notification after this many send attempts
pub const MAX_ATTEMPTS: i32 = 5;

/// What happened to one notification
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeliveryOutcome {
    Sent { message_id: String },
    /// Send failed; stored for a later retry
    Queued { outbox_id: Uuid, error: String },
    /// Send failed and the outbox write failed too
    Dropped { error: String },
    /// Nobody to send it to
    NoRecipient,
}

impl DeliveryOutcome {
    pub fn is_sent(&self) -> bool {
        matches!(self, DeliveryOutcome::Sent { .. })
    }
}

/// Result of one outbox flush
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FlushSummary {
    pub sent: usize,
    pub failed: usize,
    pub abandoned: usize,
}

#[derive(Clone)]
pub struct NotificationOutbox {
    store: Arc<dyn BillingStore>,
    mailer: Arc<dyn Mailer>,
}

impl NotificationOutbox {
    pub fn new(store: Arc<dyn BillingStore>, mailer: Arc<dyn Mailer>) -> Self {
        Self { store, mailer }
    }

    /// Send now, or queue on failure. Never returns an error.
    pub async fn dispatch(&self, notification: Notification) -> DeliveryOutcome {
        let Notification { kind, message } = notification;

        match self.mailer.send(&message).await {
            Ok(message_id) => {
                tracing::info!(
                    kind = kind.as_str(),
                    message_id = %message_id,
                    "Notification sent"
                );
                DeliveryOutcome::Sent { message_id }
            }
            Err(e) => {
                let error = e.to_string();
                tracing::warn!(kind = kind.as_str(), error = %error, "Notification send failed, queueing");
                self.enqueue(kind, &message, error).await
            }
        }
    }

    async fn enqueue(
        &self,
        kind: NotificationKind,
        message: &EmailMessage,
        error: String,
    ) -> DeliveryOutcome {
        match self.store.enqueue_notification(kind, message, &error).await {
            Ok(outbox_id) => DeliveryOutcome::Queued { outbox_id, error },
            Err(store_err) => {
                tracing::error!(
                    kind = kind.as_str(),
                    error = %store_err,
                    send_error = %error,
                    "Failed to queue notification, it will not be retried"
                );
                DeliveryOutcome::Dropped { error }
            }
        }
    }

    /// Retry up to `limit` pending notifications
    pub async fn flush_pending(&self, limit: i64) -> BillingResult<FlushSummary> {
        let pending = self.store.pending_notifications(limit).await?;
        let mut summary = FlushSummary::default();

        for queued in pending {
            let message: EmailMessage = match serde_json::from_value(queued.message.clone()) {
                Ok(message) => message,
                Err(e) => {
                    // Unreadable rows never get better
                    tracing::error!(outbox_id = %queued.id, error = %e, "Abandoning undecodable notification");
                    self.store
                        .record_notification_failure(queued.id, &e.to_string(), true)
                        .await?;
                    summary.abandoned += 1;
                    continue;
                }
            };

            match self.mailer.send(&message).await {
                Ok(message_id) => {
                    self.store.mark_notification_sent(queued.id).await?;
                    tracing::info!(
                        outbox_id = %queued.id,
                        kind = %queued.kind,
                        message_id = %message_id,
                        "Queued notification delivered"
                    );
                    summary.sent += 1;
                }
                Err(e) => {
                    let abandon = queued.attempts + 1 >= MAX_ATTEMPTS;
                    self.store
                        .record_notification_failure(queued.id, &e.to_string(), abandon)
                        .await?;
                    if abandon {
                        tracing::error!(
                            outbox_id = %queued.id,
                            kind = %queued.kind,
                            attempts = queued.attempts + 1,
                            error = %e,
                            "Giving up on notification"
                        );
                        summary.abandoned += 1;
                    } else {
                        tracing::warn!(
                            outbox_id = %queued.id,
                            attempts = queued.attempts + 1,
                            error = %e,
                            "Queued notification failed again"
                        );
                        summary.failed += 1;
                    }
                }
            }
        }

        Ok(summary)
    }

    /// Drop delivered and abandoned rows older than `days`
    pub async fn prune(&self, days: i32) -> BillingResult<u64> {
        if days < 0 {
            return Err(BillingError::InvalidInput("days must not be negative".to_string()));
        }
        self.store.prune_notifications(days).await
    }
}
