//! Postgres implementation of [`BillingStore`]

use async_trait::async_trait;
use sqlx::PgPool;
use time::OffsetDateTime;
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

#[derive(Clone)]
pub struct PgBillingStore {
    pool: PgPool,
}

impl PgBillingStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

const EVENT_COLUMNS: &str = "id, stripe_event_id, event_type, event_timestamp, payload, \
     processing_result, processing_started_at, error_message, created_at";

#[async_trait]
impl BillingStore for PgBillingStore {
    async fn claim_event(
        &self,
        event: &WebhookEvent,
        payload: &serde_json::Value,
        stale_after_minutes: i32,
    ) -> BillingResult<ClaimResult> {
        let event_timestamp = OffsetDateTime::from_unix_timestamp(event.created)
            .unwrap_or_else(|_| OffsetDateTime::now_utc());

        // INSERT…ON CONFLICT…RETURNING only yields a row to one concurrent caller.
        // Failed or reset events, and rows stuck in 'processing', can be taken over.
        let claimed: Option<(Uuid,)> = sqlx::query_as(
            r#"
            INSERT INTO stripe_webhook_events
                (stripe_event_id, event_type, event_timestamp, payload, processing_result, processing_started_at)
            VALUES ($1, $2, $3, $4, 'processing', NOW())
            ON CONFLICT (stripe_event_id) DO UPDATE SET
                processing_result = 'processing',
                processing_started_at = NOW(),
                error_message = NULL
            WHERE stripe_webhook_events.processing_result IN ('error', 'pending_replay')
               OR (stripe_webhook_events.processing_result = 'processing'
                   AND stripe_webhook_events.processing_started_at < NOW() - make_interval(mins => $5))
            RETURNING id
            "#,
        )
        .bind(&event.id)
        .bind(&event.type_)
        .bind(event_timestamp)
        .bind(payload)
        .bind(stale_after_minutes)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| {
            tracing::error!(
                event_id = %event.id,
                error = %e,
                "Failed to claim webhook event for processing"
            );
            BillingError::Database(e.to_string())
        })?;

        if claimed.is_some() {
            return Ok(ClaimResult::Claimed);
        }

        let existing: Option<(String,)> = sqlx::query_as(
            "SELECT processing_result FROM stripe_webhook_events WHERE stripe_event_id = $1",
        )
        .bind(&event.id)
        .fetch_optional(&self.pool)
        .await
        .unwrap_or_else(|e| {
            tracing::warn!(
                event_id = %event.id,
                error = %e,
                "Failed to read status of duplicate webhook event"
            );
            None
        });

        Ok(ClaimResult::Duplicate {
            existing: existing.and_then(|(status,)| ProcessingResult::parse(&status)),
        })
    }

    async fn finish_event(
        &self,
        stripe_event_id: &str,
        result: ProcessingResult,
        error_message: Option<&str>,
    ) -> BillingResult<()> {
        sqlx::query(
            r#"
            UPDATE stripe_webhook_events
            SET processing_result = $1, error_message = $2
            WHERE stripe_event_id = $3
            "#,
        )
        .bind(result.as_str())
        .bind(error_message)
        .bind(stripe_event_id)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn find_event(&self, stripe_event_id: &str) -> BillingResult<Option<WebhookEventRecord>> {
        let record = sqlx::query_as(&format!(
            "SELECT {} FROM stripe_webhook_events WHERE stripe_event_id = $1",
            EVENT_COLUMNS
        ))
        .bind(stripe_event_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(record)
    }

    async fn list_events(
        &self,
        status: Option<ProcessingResult>,
        limit: i64,
        offset: i64,
    ) -> BillingResult<Vec<WebhookEventRecord>> {
        let records = match status {
            Some(status) => {
                sqlx::query_as(&format!(
                    r#"
                    SELECT {} FROM stripe_webhook_events
                    WHERE processing_result = $1
                    ORDER BY created_at DESC
                    LIMIT $2 OFFSET $3
                    "#,
                    EVENT_COLUMNS
                ))
                .bind(status.as_str())
                .bind(limit)
                .bind(offset)
                .fetch_all(&self.pool)
                .await?
            }
            None => {
                sqlx::query_as(&format!(
                    r#"
                    SELECT {} FROM stripe_webhook_events
                    ORDER BY created_at DESC
                    LIMIT $1 OFFSET $2
                    "#,
                    EVENT_COLUMNS
                ))
                .bind(limit)
                .bind(offset)
                .fetch_all(&self.pool)
                .await?
            }
        };

        Ok(records)
    }

    async fn oldest_events(
        &self,
        status: ProcessingResult,
        limit: i64,
    ) -> BillingResult<Vec<WebhookEventRecord>> {
        let records = sqlx::query_as(&format!(
            r#"
            SELECT {} FROM stripe_webhook_events
            WHERE processing_result = $1
            ORDER BY created_at ASC
            LIMIT $2
            "#,
            EVENT_COLUMNS
        ))
        .bind(status.as_str())
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        Ok(records)
    }

    async fn reset_event(&self, stripe_event_id: &str) -> BillingResult<bool> {
        let result = sqlx::query(
            r#"
            UPDATE stripe_webhook_events
            SET processing_result = 'pending_replay',
                error_message = CONCAT('Reset for replay at ', NOW()::TEXT)
            WHERE stripe_event_id = $1
              AND processing_result IN ('processing', 'error', 'rejected')
            "#,
        )
        .bind(stripe_event_id)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn prune_events(&self, days: i32) -> BillingResult<u64> {
        let result = sqlx::query(
            r#"
            DELETE FROM stripe_webhook_events
            WHERE processing_result = 'success'
              AND created_at < NOW() - make_interval(days => $1)
            "#,
        )
        .bind(days)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }

    async fn update_subscription(
        &self,
        update: &SubscriptionUpdate,
    ) -> BillingResult<Option<SubscriptionRecord>> {
        let record = sqlx::query_as(
            r#"
            UPDATE user_subscriptions
            SET status = $2,
                current_period_start = COALESCE($3, current_period_start),
                current_period_end = COALESCE($4, current_period_end),
                cancel_at_period_end = COALESCE($5, cancel_at_period_end),
                updated_at = NOW()
            WHERE stripe_subscription_id = $1
            RETURNING id, user_id, stripe_customer_id, stripe_subscription_id, status,
                      current_period_start, current_period_end, cancel_at_period_end, updated_at
            "#,
        )
        .bind(&update.stripe_subscription_id)
        .bind(update.status.as_str())
        .bind(update.current_period_start)
        .bind(update.current_period_end)
        .bind(update.cancel_at_period_end)
        .fetch_optional(&self.pool)
        .await?;

        Ok(record)
    }

    async fn user_contact(&self, user_id: Uuid) -> BillingResult<Option<Contact>> {
        let row: Option<(String, Option<String>)> =
            sqlx::query_as("SELECT email, full_name FROM profiles WHERE id = $1")
                .bind(user_id)
                .fetch_optional(&self.pool)
                .await?;

        Ok(row.map(|(email, name)| Contact::new(email, name)))
    }

    async fn insert_event_booking(&self, booking: &NewEventBooking) -> BillingResult<InsertOutcome> {
        let inserted: Option<(Uuid,)> = sqlx::query_as(
            r#"
            INSERT INTO event_bookings (
                user_id, attendee_name, attendee_email, attendee_phone,
                event_type, event_title, event_date, event_time,
                quantity, amount_cents, currency,
                stripe_session_id, stripe_payment_intent_id, safety_accepted
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14)
            ON CONFLICT (stripe_session_id) DO NOTHING
            RETURNING id
            "#,
        )
        .bind(booking.user_id)
        .bind(&booking.attendee_name)
        .bind(&booking.attendee_email)
        .bind(&booking.attendee_phone)
        .bind(&booking.event_type)
        .bind(&booking.event_title)
        .bind(booking.event_date)
        .bind(&booking.event_time)
        .bind(booking.quantity)
        .bind(booking.amount_cents)
        .bind(&booking.currency)
        .bind(&booking.stripe_session_id)
        .bind(&booking.stripe_payment_intent_id)
        .bind(booking.safety_accepted)
        .fetch_optional(&self.pool)
        .await?;

        Ok(match inserted {
            Some((id,)) => InsertOutcome::Inserted(id),
            None => InsertOutcome::Duplicate,
        })
    }

    async fn upsert_course_purchase(
        &self,
        purchase: &NewCoursePurchase,
    ) -> BillingResult<UpsertOutcome> {
        // xmax is zero only for rows written by a plain insert
        let outcome = sqlx::query_as(
            r#"
            INSERT INTO user_course_purchases
                (user_id, course_id, stripe_session_id, stripe_payment_intent_id, amount_cents)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (user_id, course_id) DO UPDATE SET
                stripe_session_id = EXCLUDED.stripe_session_id,
                stripe_payment_intent_id = COALESCE(
                    EXCLUDED.stripe_payment_intent_id,
                    user_course_purchases.stripe_payment_intent_id
                ),
                amount_cents = EXCLUDED.amount_cents
            RETURNING id, (xmax = 0) AS created
            "#,
        )
        .bind(purchase.user_id)
        .bind(purchase.course_id)
        .bind(&purchase.stripe_session_id)
        .bind(&purchase.stripe_payment_intent_id)
        .bind(purchase.amount_cents)
        .fetch_one(&self.pool)
        .await?;

        Ok(outcome)
    }

    async fn course_title(&self, course_id: Uuid) -> BillingResult<Option<String>> {
        let row: Option<(String,)> = sqlx::query_as("SELECT title FROM courses WHERE id = $1")
            .bind(course_id)
            .fetch_optional(&self.pool)
            .await?;

        Ok(row.map(|(title,)| title))
    }

    async fn enqueue_notification(
        &self,
        kind: NotificationKind,
        message: &EmailMessage,
        error: &str,
    ) -> BillingResult<Uuid> {
        let message = serde_json::to_value(message)?;

        let (id,): (Uuid,) = sqlx::query_as(
            r#"
            INSERT INTO notification_outbox (kind, message, status, attempts, last_error)
            VALUES ($1, $2, 'pending', 1, $3)
            RETURNING id
            "#,
        )
        .bind(kind.as_str())
        .bind(message)
        .bind(error)
        .fetch_one(&self.pool)
        .await?;

        Ok(id)
    }

    async fn pending_notifications(&self, limit: i64) -> BillingResult<Vec<QueuedNotification>> {
        let rows = sqlx::query_as(
            r#"
            SELECT id, kind, message, status, attempts, last_error, created_at
            FROM notification_outbox
            WHERE status = 'pending'
            ORDER BY created_at ASC
            LIMIT $1
            "#,
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows)
    }

    async fn mark_notification_sent(&self, id: Uuid) -> BillingResult<()> {
        sqlx::query(
            "UPDATE notification_outbox SET status = 'sent', updated_at = NOW() WHERE id = $1",
        )
        .bind(id)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn record_notification_failure(
        &self,
        id: Uuid,
        error: &str,
        abandon: bool,
    ) -> BillingResult<()> {
        sqlx::query(
            r#"
            UPDATE notification_outbox
            SET attempts = attempts + 1,
                last_error = $2,
                status = CASE WHEN $3 THEN 'abandoned' ELSE 'pending' END,
                updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(error)
        .bind(abandon)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn prune_notifications(&self, days: i32) -> BillingResult<u64> {
        let result = sqlx::query(
            r#"
            DELETE FROM notification_outbox
            WHERE status IN ('sent', 'abandoned')
              AND updated_at < NOW() - make_interval(days => $1)
            "#,
        )
        .bind(days)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }
}
