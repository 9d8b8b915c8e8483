//! Typed view of the Stripe events this service reacts to
//!
//! Only the fields we read are modelled. Stripe adds fields freely, so every
//! struct ignores unknown keys, and expandable references are accepted either
//! as a bare id or as the expanded object.

use std::collections::HashMap;
use std::fmt;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer, Serialize};

use crate::error::{BillingError, BillingResult};

/// A verified Stripe event envelope
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookEvent {
    pub id: String,
    #[serde(rename = "type")]
    pub type_: String,
    pub created: i64,
    #[serde(default)]
    pub livemode: bool,
    pub data: EventData,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventData {
    pub object: serde_json::Value,
}

/// Event types with a handler; everything else is acknowledged and logged
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    CheckoutSessionCompleted,
    SubscriptionUpdated,
    SubscriptionDeleted,
    InvoicePaymentFailed,
    InvoicePaymentSucceeded,
    Unhandled,
}

impl EventKind {
    pub fn from_type(type_: &str) -> Self {
        match type_ {
            "checkout.session.completed" => EventKind::CheckoutSessionCompleted,
            "customer.subscription.updated" => EventKind::SubscriptionUpdated,
            "customer.subscription.deleted" => EventKind::SubscriptionDeleted,
            "invoice.payment_failed" => EventKind::InvoicePaymentFailed,
            "invoice.payment_succeeded" => EventKind::InvoicePaymentSucceeded,
            _ => EventKind::Unhandled,
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            EventKind::CheckoutSessionCompleted => "checkout.session.completed",
            EventKind::SubscriptionUpdated => "customer.subscription.updated",
            EventKind::SubscriptionDeleted => "customer.subscription.deleted",
            EventKind::InvoicePaymentFailed => "invoice.payment_failed",
            EventKind::InvoicePaymentSucceeded => "invoice.payment_succeeded",
            EventKind::Unhandled => "unhandled",
        };
        f.write_str(name)
    }
}

impl WebhookEvent {
    pub fn from_json(payload: &str) -> BillingResult<Self> {
        serde_json::from_str(payload).map_err(|e| {
            tracing::warn!(parse_error = %e, "Failed to parse webhook event JSON");
            BillingError::WebhookPayloadInvalid(e.to_string())
        })
    }

    pub fn kind(&self) -> EventKind {
        EventKind::from_type(&self.type_)
    }

    /// Decode `data.object` into the shape the handler expects
    pub fn object<T: DeserializeOwned>(&self) -> BillingResult<T> {
        serde_json::from_value(self.data.object.clone()).map_err(|e| {
            BillingError::WebhookEventNotSupported(format!(
                "{} carried an unexpected object: {}",
                self.type_, e
            ))
        })
    }
}

/// `customer.subscription.*` payload
#[derive(Debug, Clone, Deserialize)]
pub struct SubscriptionObject {
    pub id: String,
    #[serde(default, deserialize_with = "expandable_id")]
    pub customer: Option<String>,
    pub status: String,
    #[serde(default)]
    pub current_period_start: Option<i64>,
    #[serde(default)]
    pub current_period_end: Option<i64>,
    #[serde(default)]
    pub cancel_at_period_end: bool,
    #[serde(default)]
    pub items: Option<SubscriptionItems>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SubscriptionItems {
    #[serde(default)]
    pub data: Vec<SubscriptionItem>,
}

/// Newer API versions report the billing period per item
#[derive(Debug, Clone, Deserialize)]
pub struct SubscriptionItem {
    #[serde(default)]
    pub current_period_start: Option<i64>,
    #[serde(default)]
    pub current_period_end: Option<i64>,
}

impl SubscriptionObject {
    pub fn period_start(&self) -> Option<i64> {
        self.current_period_start
            .or_else(|| self.first_item().and_then(|i| i.current_period_start))
    }

    pub fn period_end(&self) -> Option<i64> {
        self.current_period_end
            .or_else(|| self.first_item().and_then(|i| i.current_period_end))
    }

    fn first_item(&self) -> Option<&SubscriptionItem> {
        self.items.as_ref().and_then(|items| items.data.first())
    }
}

/// `invoice.*` payload
#[derive(Debug, Clone, Deserialize)]
pub struct InvoiceObject {
    pub id: String,
    #[serde(default, deserialize_with = "expandable_id")]
    pub customer: Option<String>,
    #[serde(default, deserialize_with = "expandable_id")]
    pub subscription: Option<String>,
    #[serde(default)]
    pub parent: Option<InvoiceParent>,
    #[serde(default)]
    pub customer_email: Option<String>,
    #[serde(default)]
    pub customer_name: Option<String>,
    #[serde(default)]
    pub amount_due: Option<i64>,
    #[serde(default)]
    pub currency: Option<String>,
    #[serde(default)]
    pub hosted_invoice_url: Option<String>,
    #[serde(default)]
    pub attempt_count: Option<i64>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct InvoiceParent {
    #[serde(default)]
    pub subscription_details: Option<SubscriptionDetails>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SubscriptionDetails {
    #[serde(default, deserialize_with = "expandable_id")]
    pub subscription: Option<String>,
}

impl InvoiceObject {
    /// Subscription the invoice belongs to, from either API shape
    pub fn subscription_id(&self) -> Option<&str> {
        self.subscription.as_deref().or_else(|| {
            self.parent
                .as_ref()
                .and_then(|p| p.subscription_details.as_ref())
                .and_then(|d| d.subscription.as_deref())
        })
    }
}

/// `checkout.session.completed` payload
#[derive(Debug, Clone, Deserialize)]
pub struct CheckoutSessionObject {
    pub id: String,
    #[serde(default)]
    pub payment_status: String,
    #[serde(default, deserialize_with = "expandable_id")]
    pub payment_intent: Option<String>,
    #[serde(default, deserialize_with = "expandable_id")]
    pub customer: Option<String>,
    #[serde(default)]
    pub customer_email: Option<String>,
    #[serde(default)]
    pub customer_details: Option<CustomerDetails>,
    #[serde(default)]
    pub amount_total: Option<i64>,
    #[serde(default)]
    pub currency: Option<String>,
    #[serde(default)]
    pub metadata: Option<HashMap<String, String>>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct CustomerDetails {
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub phone: Option<String>,
}

impl CheckoutSessionObject {
    pub fn is_paid(&self) -> bool {
        self.payment_status == "paid"
    }

    pub fn metadata_value(&self, key: &str) -> Option<&str> {
        self.metadata
            .as_ref()
            .and_then(|m| m.get(key))
            .map(|v| v.trim())
            .filter(|v| !v.is_empty())
    }

    /// Email Stripe collected at checkout
    pub fn buyer_email(&self) -> Option<&str> {
        self.customer_details
            .as_ref()
            .and_then(|d| d.email.as_deref())
            .or(self.customer_email.as_deref())
    }

    pub fn buyer_name(&self) -> Option<&str> {
        self.customer_details.as_ref().and_then(|d| d.name.as_deref())
    }

    pub fn buyer_phone(&self) -> Option<&str> {
        self.customer_details.as_ref().and_then(|d| d.phone.as_deref())
    }
}

/// Accept an expandable field as `"id"`, `{"id": …}` or `null`
fn expandable_id<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Expandable {
        Id(String),
        Object { id: String },
    }

    Ok(
        Option::<Expandable>::deserialize(deserializer)?.map(|value| match value {
            Expandable::Id(id) => id,
            Expandable::Object { id } => id,
        }),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn event(type_: &str, object: serde_json::Value) -> WebhookEvent {
        serde_json::from_value(json!({
            "id": "evt_123",
            "type": type_,
            "created": 1_717_000_000,
            "data": { "object": object }
        }))
        .unwrap()
    }

    #[test]
    fn test_event_kind_mapping() {
        assert_eq!(
            EventKind::from_type("customer.subscription.deleted"),
            EventKind::SubscriptionDeleted
        );
        assert_eq!(
            EventKind::from_type("invoice.payment_succeeded"),
            EventKind::InvoicePaymentSucceeded
        );
        assert_eq!(EventKind::from_type("charge.refunded"), EventKind::Unhandled);
    }

    #[test]
    fn test_invalid_json_is_payload_error() {
        let err = WebhookEvent::from_json("{not json").unwrap_err();
        assert!(matches!(err, BillingError::WebhookPayloadInvalid(_)));
    }

    #[test]
    fn test_expanded_customer_accepted() {
        let evt = event(
            "customer.subscription.updated",
            json!({
                "id": "sub_1",
                "customer": { "id": "cus_9", "object": "customer" },
                "status": "active"
            }),
        );
        let sub: SubscriptionObject = evt.object().unwrap();
        assert_eq!(sub.customer.as_deref(), Some("cus_9"));
        assert!(!sub.cancel_at_period_end);
    }

    #[test]
    fn test_period_falls_back_to_first_item() {
        let evt = event(
            "customer.subscription.updated",
            json!({
                "id": "sub_1",
                "customer": "cus_1",
                "status": "active",
                "items": { "data": [ { "current_period_start": 10, "current_period_end": 20 } ] }
            }),
        );
        let sub: SubscriptionObject = evt.object().unwrap();
        assert_eq!(sub.period_start(), Some(10));
        assert_eq!(sub.period_end(), Some(20));
    }

    #[test]
    fn test_invoice_subscription_from_parent() {
        let evt = event(
            "invoice.payment_failed",
            json!({
                "id": "in_1",
                "customer": "cus_1",
                "parent": { "subscription_details": { "subscription": "sub_7" } }
            }),
        );
        let invoice: InvoiceObject = evt.object().unwrap();
        assert_eq!(invoice.subscription_id(), Some("sub_7"));
    }

    #[test]
    fn test_wrong_object_shape_is_not_supported() {
        let evt = event("invoice.payment_failed", json!({ "amount": 5 }));
        let err = evt.object::<InvoiceObject>().unwrap_err();
        assert!(matches!(err, BillingError::WebhookEventNotSupported(_)));
    }

    #[test]
    fn test_session_metadata_null_and_blank_values() {
        let evt = event(
            "checkout.session.completed",
            json!({
                "id": "cs_1",
                "payment_status": "paid",
                "metadata": { "type": "course_purchase", "course_id": "  " }
            }),
        );
        let session: CheckoutSessionObject = evt.object().unwrap();
        assert_eq!(session.metadata_value("type"), Some("course_purchase"));
        assert_eq!(session.metadata_value("course_id"), None);

        let evt = event(
            "checkout.session.completed",
            json!({ "id": "cs_2", "payment_status": "unpaid", "metadata": null }),
        );
        let session: CheckoutSessionObject = evt.object().unwrap();
        assert!(!session.is_paid());
        assert_eq!(session.metadata_value("type"), None);
    }
}
