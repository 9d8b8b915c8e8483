//! Mirrors Stripe subscription state onto `user_subscriptions`
//!
//! Every handler performs two independent side effects, the status write and
//! the customer notification, and reports both in a [`ReconcileOutcome`]. A
//! failed write does not stop the email; the webhook dispatcher decides which
//! failures are fatal.

use std::sync::Arc;

use time::macros::format_description;
use time::OffsetDateTime;
use uuid::Uuid;
use wellness_shared::SubscriptionStatus;

use crate::customer::{Contact, CustomerDirectory};
use crate::email::BillingEmailService;
use crate::error::{BillingError, BillingResult};
use crate::event::{InvoiceObject, SubscriptionObject};
use crate::outbox::{DeliveryOutcome, NotificationOutbox};
use crate::store::{BillingStore, SubscriptionUpdate};

/// Result of the status write
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WriteOutcome {
    Updated { user_id: Uuid },
    /// No local row carries this Stripe subscription id
    NoLocalRecord,
    Failed(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconcileOutcome {
    pub subscription_id: String,
    pub status: SubscriptionStatus,
    pub write: WriteOutcome,
    /// `None` when the transition sends no email
    pub notification: Option<DeliveryOutcome>,
}

impl ReconcileOutcome {
    pub fn write_error(&self) -> Option<&str> {
        match &self.write {
            WriteOutcome::Failed(error) => Some(error),
            _ => None,
        }
    }
}

/// Where to look for the recipient, best source first
struct RecipientHints<'a> {
    customer_id: Option<&'a str>,
    fallback: Option<Contact>,
}

#[derive(Clone)]
pub struct SubscriptionReconciler {
    store: Arc<dyn BillingStore>,
    customers: Arc<dyn CustomerDirectory>,
    email: BillingEmailService,
    outbox: NotificationOutbox,
}

impl SubscriptionReconciler {
    pub fn new(
        store: Arc<dyn BillingStore>,
        customers: Arc<dyn CustomerDirectory>,
        email: BillingEmailService,
        outbox: NotificationOutbox,
    ) -> Self {
        Self {
            store,
            customers,
            email,
            outbox,
        }
    }

    /// `customer.subscription.updated`: copy status, period and cancel flag
    pub async fn subscription_updated(
        &self,
        subscription: &SubscriptionObject,
    ) -> BillingResult<ReconcileOutcome> {
        let status: SubscriptionStatus = subscription.status.parse().map_err(|e| {
            BillingError::WebhookEventNotSupported(format!(
                "subscription {}: {}",
                subscription.id, e
            ))
        })?;

        let update = SubscriptionUpdate {
            stripe_subscription_id: subscription.id.clone(),
            status,
            current_period_start: timestamp(subscription.period_start()),
            current_period_end: timestamp(subscription.period_end()),
            cancel_at_period_end: Some(subscription.cancel_at_period_end),
        };
        let write = self.write(&update).await;

        let notification = if status.needs_payment_attention() {
            let hints = RecipientHints {
                customer_id: subscription.customer.as_deref(),
                fallback: None,
            };
            Some(match self.recipient(&write, hints).await {
                Some(contact) => {
                    self.outbox
                        .dispatch(self.email.payment_issue(&contact, None))
                        .await
                }
                None => no_recipient(&subscription.id),
            })
        } else {
            None
        };

        tracing::info!(
            subscription_id = %subscription.id,
            status = %status,
            cancel_at_period_end = subscription.cancel_at_period_end,
            "Subscription updated"
        );

        Ok(ReconcileOutcome {
            subscription_id: subscription.id.clone(),
            status,
            write,
            notification,
        })
    }

    /// `customer.subscription.deleted`: mark canceled and send one cancellation email
    pub async fn subscription_deleted(
        &self,
        subscription: &SubscriptionObject,
    ) -> BillingResult<ReconcileOutcome> {
        let status = SubscriptionStatus::Canceled;
        let update = SubscriptionUpdate {
            current_period_end: timestamp(subscription.period_end()),
            ..SubscriptionUpdate::status_only(&subscription.id, status)
        };
        let write = self.write(&update).await;

        let hints = RecipientHints {
            customer_id: subscription.customer.as_deref(),
            fallback: None,
        };
        let notification = match self.recipient(&write, hints).await {
            Some(contact) => {
                let period_end = timestamp(subscription.period_end()).and_then(display_date);
                self.outbox
                    .dispatch(
                        self.email
                            .subscription_canceled(&contact, period_end.as_deref()),
                    )
                    .await
            }
            None => no_recipient(&subscription.id),
        };

        tracing::info!(subscription_id = %subscription.id, "Subscription canceled");

        Ok(ReconcileOutcome {
            subscription_id: subscription.id.clone(),
            status,
            write,
            notification: Some(notification),
        })
    }

    /// `invoice.payment_failed`: mark past_due and ask the customer to pay.
    ///
    /// Returns `None` for invoices that do not belong to a subscription.
    pub async fn payment_failed(
        &self,
        invoice: &InvoiceObject,
    ) -> BillingResult<Option<ReconcileOutcome>> {
        let Some(subscription_id) = invoice.subscription_id() else {
            tracing::info!(invoice_id = %invoice.id, "Failed invoice has no subscription, skipping");
            return Ok(None);
        };

        let status = SubscriptionStatus::PastDue;
        let write = self
            .write(&SubscriptionUpdate::status_only(subscription_id, status))
            .await;

        let hints = RecipientHints {
            customer_id: invoice.customer.as_deref(),
            fallback: invoice
                .customer_email
                .as_deref()
                .filter(|email| !email.is_empty())
                .map(|email| Contact::new(email, invoice.customer_name.clone())),
        };
        let notification = match self.recipient(&write, hints).await {
            Some(contact) => {
                self.outbox
                    .dispatch(
                        self.email
                            .payment_issue(&contact, invoice.hosted_invoice_url.as_deref()),
                    )
                    .await
            }
            None => no_recipient(subscription_id),
        };

        tracing::warn!(
            subscription_id = %subscription_id,
            invoice_id = %invoice.id,
            attempt_count = ?invoice.attempt_count,
            "Invoice payment failed"
        );

        Ok(Some(ReconcileOutcome {
            subscription_id: subscription_id.to_string(),
            status,
            write,
            notification: Some(notification),
        }))
    }

    /// `invoice.payment_succeeded`: back to active whatever the prior status
    pub async fn payment_succeeded(
        &self,
        invoice: &InvoiceObject,
    ) -> BillingResult<Option<ReconcileOutcome>> {
        let Some(subscription_id) = invoice.subscription_id() else {
            return Ok(None);
        };

        let status = SubscriptionStatus::Active;
        let write = self
            .write(&SubscriptionUpdate::status_only(subscription_id, status))
            .await;

        tracing::info!(
            subscription_id = %subscription_id,
            invoice_id = %invoice.id,
            "Invoice paid, subscription active"
        );

        Ok(Some(ReconcileOutcome {
            subscription_id: subscription_id.to_string(),
            status,
            write,
            notification: None,
        }))
    }

    async fn write(&self, update: &SubscriptionUpdate) -> WriteOutcome {
        match self.store.update_subscription(update).await {
            Ok(Some(record)) => WriteOutcome::Updated {
                user_id: record.user_id,
            },
            Ok(None) => {
                tracing::warn!(
                    subscription_id = %update.stripe_subscription_id,
                    "No local subscription for Stripe subscription"
                );
                WriteOutcome::NoLocalRecord
            }
            Err(e) => {
                tracing::error!(
                    subscription_id = %update.stripe_subscription_id,
                    status = %update.status,
                    error = %e,
                    "Failed to update subscription status"
                );
                WriteOutcome::Failed(e.to_string())
            }
        }
    }

    /// Profile email first, then the Stripe customer, then whatever the event carried
    async fn recipient(&self, write: &WriteOutcome, hints: RecipientHints<'_>) -> Option<Contact> {
        if let WriteOutcome::Updated { user_id } = write {
            match self.store.user_contact(*user_id).await {
                Ok(Some(contact)) => return Some(contact),
                Ok(None) => {}
                Err(e) => {
                    tracing::warn!(user_id = %user_id, error = %e, "Profile lookup failed");
                }
            }
        }

        if let Some(customer_id) = hints.customer_id {
            match self.customers.customer_contact(customer_id).await {
                Ok(Some(contact)) => return Some(contact),
                Ok(None) => {}
                Err(e) => {
                    tracing::warn!(customer_id = %customer_id, error = %e, "Stripe customer lookup failed");
                }
            }
        }

        hints.fallback
    }
}

fn no_recipient(subscription_id: &str) -> DeliveryOutcome {
    tracing::warn!(subscription_id = %subscription_id, "No email address for subscription, notification skipped");
    DeliveryOutcome::NoRecipient
}

fn timestamp(secs: Option<i64>) -> Option<OffsetDateTime> {
    secs.and_then(|s| OffsetDateTime::from_unix_timestamp(s).ok())
}

fn display_date(at: OffsetDateTime) -> Option<String> {
    at.format(format_description!("[day padding:none] [month repr:long] [year]"))
        .ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::customer::StaticCustomerDirectory;
    use crate::email::{EmailConfig, RecordingMailer};
    use crate::memory_store::MemoryBillingStore;
    use serde_json::json;

    struct Harness {
        store: Arc<MemoryBillingStore>,
        mailer: Arc<RecordingMailer>,
        reconciler: SubscriptionReconciler,
        user_id: Uuid,
    }

    async fn harness() -> Harness {
        let store = Arc::new(MemoryBillingStore::new());
        let mailer = Arc::new(RecordingMailer::new());
        let user_id = Uuid::new_v4();
        store
            .seed_subscription(user_id, "cus_1", "sub_1", "active")
            .await;
        store
            .seed_profile(user_id, Contact::new("member@example.com", Some("Mina Park".to_string())))
            .await;

        let customers = StaticCustomerDirectory::new()
            .with_contact("cus_2", Contact::new("stripe@example.com", None));
        let email = BillingEmailService::new(EmailConfig {
            resend_api_key: "re_test".to_string(),
            resend_api_url: "http://localhost".to_string(),
            from_address: "Studio <hello@example.com>".to_string(),
            admin_address: "admin@example.com".to_string(),
            site_url: "https://studio.example.com".to_string(),
        });
        let outbox = NotificationOutbox::new(store.clone(), mailer.clone());
        let reconciler =
            SubscriptionReconciler::new(store.clone(), Arc::new(customers), email, outbox);

        Harness {
            store,
            mailer,
            reconciler,
            user_id,
        }
    }

    fn subscription(id: &str, customer: &str, status: &str) -> SubscriptionObject {
        serde_json::from_value(json!({
            "id": id,
            "customer": customer,
            "status": status,
            "current_period_start": 1_717_200_000,
            "current_period_end": 1_719_792_000,
            "cancel_at_period_end": true
        }))
        .unwrap()
    }

    fn invoice(subscription: Option<&str>, customer: &str) -> InvoiceObject {
        serde_json::from_value(json!({
            "id": "in_1",
            "customer": customer,
            "subscription": subscription,
            "customer_email": "invoice@example.com",
            "hosted_invoice_url": "https://invoice.stripe.com/i/in_1"
        }))
        .unwrap()
    }

    #[tokio::test]
    async fn test_update_copies_fields_without_email() {
        let h = harness().await;
        let outcome = h
            .reconciler
            .subscription_updated(&subscription("sub_1", "cus_1", "trialing"))
            .await
            .unwrap();

        assert_eq!(outcome.write, WriteOutcome::Updated { user_id: h.user_id });
        assert_eq!(outcome.notification, None);
        let record = h.store.subscription("sub_1").await.unwrap();
        assert_eq!(record.status, "trialing");
        assert!(record.cancel_at_period_end);
        assert_eq!(
            record.current_period_end,
            Some(OffsetDateTime::from_unix_timestamp(1_719_792_000).unwrap())
        );
        assert!(h.mailer.sent().await.is_empty());
    }

    #[tokio::test]
    async fn test_update_to_unpaid_emails_profile_address() {
        let h = harness().await;
        let outcome = h
            .reconciler
            .subscription_updated(&subscription("sub_1", "cus_1", "unpaid"))
            .await
            .unwrap();

        assert!(outcome.notification.unwrap().is_sent());
        let sent = h.mailer.sent_to("member@example.com").await;
        assert_eq!(sent.len(), 1);
        assert!(sent[0].html.contains("Hi Mina"));
    }

    #[tokio::test]
    async fn test_unknown_status_is_rejected() {
        let h = harness().await;
        let err = h
            .reconciler
            .subscription_updated(&subscription("sub_1", "cus_1", "mystery"))
            .await
            .unwrap_err();
        assert!(!err.is_retryable());
    }

    #[tokio::test]
    async fn test_deleted_without_local_row_uses_stripe_customer() {
        let h = harness().await;
        let outcome = h
            .reconciler
            .subscription_deleted(&subscription("sub_unknown", "cus_2", "canceled"))
            .await
            .unwrap();

        assert_eq!(outcome.write, WriteOutcome::NoLocalRecord);
        assert_eq!(h.mailer.sent_to("stripe@example.com").await.len(), 1);
    }

    #[tokio::test]
    async fn test_payment_failed_falls_back_to_invoice_email() {
        let h = harness().await;
        let outcome = h
            .reconciler
            .payment_failed(&invoice(Some("sub_unknown"), "cus_missing"))
            .await
            .unwrap()
            .unwrap();

        assert_eq!(outcome.status, SubscriptionStatus::PastDue);
        let sent = h.mailer.sent_to("invoice@example.com").await;
        assert_eq!(sent.len(), 1);
        assert!(sent[0].html.contains("https://invoice.stripe.com/i/in_1"));
    }

    #[tokio::test]
    async fn test_invoice_without_subscription_is_skipped() {
        let h = harness().await;
        assert!(h
            .reconciler
            .payment_failed(&invoice(None, "cus_1"))
            .await
            .unwrap()
            .is_none());
        assert!(h.mailer.sent().await.is_empty());
    }

    #[tokio::test]
    async fn test_no_recipient_is_reported() {
        let h = harness().await;
        let outcome = h
            .reconciler
            .subscription_deleted(&subscription("sub_unknown", "cus_missing", "canceled"))
            .await
            .unwrap();
        assert_eq!(outcome.notification, Some(DeliveryOutcome::NoRecipient));
    }
}
