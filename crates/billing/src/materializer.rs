//! Turns paid Checkout Sessions into bookings and course purchases

use std::sync::Arc;

use time::macros::format_description;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::calendar::{event_title_from_slug, CalendarConfig, CalendarEvent};
use crate::email::{BillingEmailService, BookingSummary};
use crate::error::{BillingError, BillingResult};
use crate::event::CheckoutSessionObject;
use crate::metadata::{BookingMetadata, CheckoutIntent, CoursePurchaseMetadata};
use crate::outbox::{DeliveryOutcome, NotificationOutbox};
use crate::store::{BillingStore, InsertOutcome, NewCoursePurchase, NewEventBooking};

const DEFAULT_CURRENCY: &str = "gbp";
const FALLBACK_COURSE_TITLE: &str = "your course";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MaterializeOutcome {
    /// Session completed without payment (e.g. delayed payment methods)
    NotPaid { payment_status: String },
    /// Session does not belong to this service
    Ignored { reason: String },
    Booking {
        /// `None` when the session had already been booked
        booking_id: Option<Uuid>,
        notifications: Vec<DeliveryOutcome>,
    },
    CoursePurchase {
        purchase_id: Uuid,
        created: bool,
        notification: Option<DeliveryOutcome>,
    },
}

#[derive(Clone)]
pub struct CheckoutMaterializer {
    store: Arc<dyn BillingStore>,
    email: BillingEmailService,
    outbox: NotificationOutbox,
    calendar: CalendarConfig,
}

impl CheckoutMaterializer {
    pub fn new(
        store: Arc<dyn BillingStore>,
        email: BillingEmailService,
        outbox: NotificationOutbox,
        calendar: CalendarConfig,
    ) -> Self {
        Self {
            store,
            email,
            outbox,
            calendar,
        }
    }

    /// Handle `checkout.session.completed`.
    ///
    /// Invalid metadata on a recognised type yields `InvalidMetadata`; database
    /// failures propagate so the delivery is retried.
    pub async fn session_completed(
        &self,
        session: &CheckoutSessionObject,
    ) -> BillingResult<MaterializeOutcome> {
        if !session.is_paid() {
            tracing::info!(
                session_id = %session.id,
                payment_status = %session.payment_status,
                "Checkout session not paid, skipping"
            );
            return Ok(MaterializeOutcome::NotPaid {
                payment_status: session.payment_status.clone(),
            });
        }

        let intent = match CheckoutIntent::from_session(session) {
            Ok(intent) => intent,
            Err(e) if e.is_foreign() => {
                tracing::info!(session_id = %session.id, reason = %e, "Ignoring checkout session");
                return Ok(MaterializeOutcome::Ignored {
                    reason: e.to_string(),
                });
            }
            Err(e) => {
                tracing::error!(session_id = %session.id, error = %e, "Invalid checkout metadata");
                return Err(BillingError::InvalidMetadata(e.to_string()));
            }
        };

        match intent {
            CheckoutIntent::EventBooking(booking) => self.book_event(session, &booking).await,
            CheckoutIntent::CoursePurchase(purchase) => {
                self.record_course_purchase(session, &purchase).await
            }
        }
    }

    async fn book_event(
        &self,
        session: &CheckoutSessionObject,
        meta: &BookingMetadata,
    ) -> BillingResult<MaterializeOutcome> {
        let event_title = event_title_from_slug(&meta.event_type);
        let event_time = meta
            .event_time
            .format(format_description!("[hour]:[minute]"))
            .map_err(|e| BillingError::Internal(e.to_string()))?;
        let currency = session
            .currency
            .clone()
            .unwrap_or_else(|| DEFAULT_CURRENCY.to_string());
        let amount_cents = session.amount_total.unwrap_or(0);

        let booking = NewEventBooking {
            user_id: meta.user_id,
            attendee_name: meta.attendee_name.clone(),
            attendee_email: meta.attendee_email.clone(),
            attendee_phone: meta.attendee_phone.clone(),
            event_type: meta.event_type.clone(),
            event_title: event_title.clone(),
            event_date: meta.event_date,
            event_time: event_time.clone(),
            quantity: meta.quantity,
            amount_cents,
            currency: currency.clone(),
            stripe_session_id: session.id.clone(),
            stripe_payment_intent_id: session.payment_intent.clone(),
            safety_accepted: meta.safety_accepted,
        };

        let booking_id = match self.store.insert_event_booking(&booking).await? {
            InsertOutcome::Inserted(id) => id,
            InsertOutcome::Duplicate => {
                tracing::info!(session_id = %session.id, "Booking already recorded for session");
                return Ok(MaterializeOutcome::Booking {
                    booking_id: None,
                    notifications: Vec::new(),
                });
            }
        };

        tracing::info!(
            booking_id = %booking_id,
            session_id = %session.id,
            event_type = %meta.event_type,
            event_date = %meta.event_date,
            quantity = meta.quantity,
            "Event booking created"
        );

        let ics = match CalendarEvent::for_booking(&self.calendar, meta, &session.id)
            .and_then(|event| event.to_ics(OffsetDateTime::now_utc()))
        {
            Ok(ics) => Some(ics),
            Err(e) => {
                tracing::warn!(session_id = %session.id, error = %e, "Calendar invite not generated");
                None
            }
        };

        let event_date = meta
            .event_date
            .format(format_description!(
                "[weekday] [day padding:none] [month repr:long] [year]"
            ))
            .map_err(|e| BillingError::Internal(e.to_string()))?;

        let summary = BookingSummary {
            attendee_name: &meta.attendee_name,
            attendee_email: &meta.attendee_email,
            attendee_phone: meta.attendee_phone.as_deref(),
            event_title: &event_title,
            event_date: &event_date,
            event_time: &event_time,
            quantity: meta.quantity,
            amount_cents,
            currency: &currency,
            safety_accepted: meta.safety_accepted,
        };

        let confirmation = self
            .outbox
            .dispatch(self.email.booking_confirmation(&summary, ics.as_deref()))
            .await;
        let admin = self
            .outbox
            .dispatch(self.email.booking_admin_notice(&summary))
            .await;

        Ok(MaterializeOutcome::Booking {
            booking_id: Some(booking_id),
            notifications: vec![confirmation, admin],
        })
    }

    async fn record_course_purchase(
        &self,
        session: &CheckoutSessionObject,
        meta: &CoursePurchaseMetadata,
    ) -> BillingResult<MaterializeOutcome> {
        let purchase = NewCoursePurchase {
            user_id: meta.user_id,
            course_id: meta.course_id,
            stripe_session_id: session.id.clone(),
            stripe_payment_intent_id: session.payment_intent.clone(),
            amount_cents: session.amount_total.unwrap_or(0),
        };
        let upsert = self.store.upsert_course_purchase(&purchase).await?;

        if !upsert.created {
            tracing::info!(
                purchase_id = %upsert.id,
                session_id = %session.id,
                "Course purchase already recorded"
            );
            return Ok(MaterializeOutcome::CoursePurchase {
                purchase_id: upsert.id,
                created: false,
                notification: None,
            });
        }

        tracing::info!(
            purchase_id = %upsert.id,
            user_id = %meta.user_id,
            course_id = %meta.course_id,
            "Course purchase recorded"
        );

        let notification = match meta.email.as_deref() {
            Some(to) => {
                let title = match self.store.course_title(meta.course_id).await {
                    Ok(Some(title)) => title,
                    Ok(None) => FALLBACK_COURSE_TITLE.to_string(),
                    Err(e) => {
                        tracing::warn!(course_id = %meta.course_id, error = %e, "Course lookup failed");
                        FALLBACK_COURSE_TITLE.to_string()
                    }
                };
                self.outbox
                    .dispatch(self.email.course_purchase_confirmation(to, &title))
                    .await
            }
            None => {
                tracing::warn!(session_id = %session.id, "No email for course purchase confirmation");
                DeliveryOutcome::NoRecipient
            }
        };

        Ok(MaterializeOutcome::CoursePurchase {
            purchase_id: upsert.id,
            created: true,
            notification: Some(notification),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::email::{EmailConfig, RecordingMailer};
    use crate::memory_store::MemoryBillingStore;
    use base64::engine::general_purpose::STANDARD as BASE64;
    use base64::Engine;
    use serde_json::json;
    use time::macros::date;

    struct Harness {
        store: Arc<MemoryBillingStore>,
        mailer: Arc<RecordingMailer>,
        materializer: CheckoutMaterializer,
    }

    fn harness() -> Harness {
        let store = Arc::new(MemoryBillingStore::new());
        let mailer = Arc::new(RecordingMailer::new());
        let email = BillingEmailService::new(EmailConfig {
            resend_api_key: "re_test".to_string(),
            resend_api_url: "http://localhost".to_string(),
            from_address: "Studio <hello@example.com>".to_string(),
            admin_address: "admin@example.com".to_string(),
            site_url: "https://studio.example.com".to_string(),
        });
        let calendar = CalendarConfig {
            timezone: "Europe/London".to_string(),
            organizer_name: "Studio".to_string(),
            organizer_email: "hello@example.com".to_string(),
            location: None,
        };
        let outbox = NotificationOutbox::new(store.clone(), mailer.clone());
        let materializer = CheckoutMaterializer::new(store.clone(), email, outbox, calendar);
        Harness {
            store,
            mailer,
            materializer,
        }
    }

    fn session(id: &str, payment_status: &str, metadata: serde_json::Value) -> CheckoutSessionObject {
        serde_json::from_value(json!({
            "id": id,
            "payment_status": payment_status,
            "payment_intent": "pi_1",
            "amount_total": 4500,
            "currency": "gbp",
            "customer_details": { "email": "buyer@example.com", "name": "Buyer Name" },
            "metadata": metadata
        }))
        .unwrap()
    }

    fn booking_metadata() -> serde_json::Value {
        json!({
            "type": "event_booking",
            "event_type": "breathwork-journey",
            "event_date": "2024-09-14",
            "event_time": "18:30",
            "attendee_name": "Ada Lovelace",
            "attendee_email": "ada@example.com",
            "quantity": "2",
            "safety_accepted": "true"
        })
    }

    #[tokio::test]
    async fn test_booking_is_recorded_with_invite() {
        let h = harness();
        let outcome = h
            .materializer
            .session_completed(&session("cs_1", "paid", booking_metadata()))
            .await
            .unwrap();

        let MaterializeOutcome::Booking { booking_id, notifications } = outcome else {
            panic!("expected booking outcome");
        };
        assert!(booking_id.is_some());
        assert!(notifications.iter().all(DeliveryOutcome::is_sent));

        let bookings = h.store.bookings().await;
        assert_eq!(bookings.len(), 1);
        assert_eq!(bookings[0].event_title, "Breathwork Journey");
        assert_eq!(bookings[0].event_date, date!(2024 - 09 - 14));
        assert_eq!(bookings[0].event_time, "18:30");
        assert_eq!(bookings[0].quantity, 2);
        assert_eq!(bookings[0].amount_cents, 4500);

        let attendee = h.mailer.sent_to("ada@example.com").await;
        assert_eq!(attendee.len(), 1);
        assert_eq!(attendee[0].attachments.len(), 1);
        assert_eq!(attendee[0].attachments[0].filename, "event.ics");
        let ics = String::from_utf8(BASE64.decode(&attendee[0].attachments[0].content).unwrap())
            .unwrap();
        assert!(ics.contains("DTSTART;TZID=Europe/London:20240914T183000"));
        assert!(ics.contains("DTEND;TZID=Europe/London:20240914T203000"));

        assert_eq!(h.mailer.sent_to("admin@example.com").await.len(), 1);
    }

    #[tokio::test]
    async fn test_unpaid_session_is_skipped() {
        let h = harness();
        let outcome = h
            .materializer
            .session_completed(&session("cs_1", "unpaid", booking_metadata()))
            .await
            .unwrap();
        assert_eq!(
            outcome,
            MaterializeOutcome::NotPaid {
                payment_status: "unpaid".to_string()
            }
        );
        assert!(h.store.bookings().await.is_empty());
    }

    #[tokio::test]
    async fn test_foreign_session_is_ignored() {
        let h = harness();
        let outcome = h
            .materializer
            .session_completed(&session("cs_1", "paid", json!({ "type": "gift_card" })))
            .await
            .unwrap();
        assert!(matches!(outcome, MaterializeOutcome::Ignored { .. }));

        let outcome = h
            .materializer
            .session_completed(&session("cs_2", "paid", json!({})))
            .await
            .unwrap();
        assert!(matches!(outcome, MaterializeOutcome::Ignored { .. }));
        assert!(h.mailer.sent().await.is_empty());
    }

    #[tokio::test]
    async fn test_missing_booking_field_is_invalid_metadata() {
        let h = harness();
        let err = h
            .materializer
            .session_completed(&session(
                "cs_1",
                "paid",
                json!({ "type": "event_booking", "event_type": "sound-bath" }),
            ))
            .await
            .unwrap_err();
        assert!(matches!(err, BillingError::InvalidMetadata(_)));
        assert!(!err.is_retryable());
    }

    #[tokio::test]
    async fn test_course_purchase_uses_title_and_buyer_email() {
        let h = harness();
        let user_id = Uuid::new_v4();
        let course_id = Uuid::new_v4();
        h.store.seed_course(course_id, "Foundations of Breath").await;

        let metadata = json!({
            "type": "course_purchase",
            "user_id": user_id.to_string(),
            "course_id": course_id.to_string()
        });
        let outcome = h
            .materializer
            .session_completed(&session("cs_1", "paid", metadata))
            .await
            .unwrap();
        assert!(matches!(outcome, MaterializeOutcome::CoursePurchase { created: true, .. }));

        let sent = h.mailer.sent_to("buyer@example.com").await;
        assert_eq!(sent.len(), 1);
        assert!(sent[0].subject.contains("Foundations of Breath"));
    }

    #[tokio::test]
    async fn test_unknown_course_falls_back_to_generic_title() {
        let h = harness();
        let metadata = json!({
            "type": "course_purchase",
            "user_id": Uuid::new_v4().to_string(),
            "course_id": Uuid::new_v4().to_string(),
            "email": "student@example.com"
        });
        h.materializer
            .session_completed(&session("cs_1", "paid", metadata))
            .await
            .unwrap();

        let sent = h.mailer.sent_to("student@example.com").await;
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].subject, "You now have access to your course");
    }
}
