//! Transactional email for billing and booking events
//!
//! Messages are built by [`BillingEmailService`] and handed to a [`Mailer`].
//! Production uses [`ResendMailer`]; [`RecordingMailer`] keeps messages in
//! memory for tests and dry runs.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use crate::customer::Contact;
use crate::error::{BillingError, BillingResult};

pub const DEFAULT_RESEND_API_URL: &str = "https://api.resend.com";

/// Email settings
#[derive(Clone)]
pub struct EmailConfig {
    pub resend_api_key: String,
    /// Base URL of the Resend API, overridable for tests
    pub resend_api_url: String,
    pub from_address: String,
    /// Receives a copy of every new booking
    pub admin_address: String,
    /// Public site, used for account links
    pub site_url: String,
}

impl EmailConfig {
    pub fn from_env() -> BillingResult<Self> {
        let resend_api_key = std::env::var("RESEND_API_KEY")
            .map_err(|_| BillingError::Config("RESEND_API_KEY not set".to_string()))?;
        let admin_address = std::env::var("ADMIN_EMAIL")
            .map_err(|_| BillingError::Config("ADMIN_EMAIL not set".to_string()))?;

        Ok(Self {
            resend_api_key,
            resend_api_url: std::env::var("RESEND_API_URL")
                .unwrap_or_else(|_| DEFAULT_RESEND_API_URL.to_string()),
            from_address: std::env::var("EMAIL_FROM")
                .unwrap_or_else(|_| "Studio <hello@studio.local>".to_string()),
            admin_address,
            site_url: std::env::var("SITE_URL")
                .unwrap_or_else(|_| "http://localhost:3000".to_string()),
        })
    }
}

impl std::fmt::Debug for EmailConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EmailConfig")
            .field("resend_api_key", &"[redacted]")
            .field("resend_api_url", &self.resend_api_url)
            .field("from_address", &self.from_address)
            .field("admin_address", &self.admin_address)
            .field("site_url", &self.site_url)
            .finish()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EmailAttachment {
    pub filename: String,
    /// Base64-encoded file body
    pub content: String,
}

impl EmailAttachment {
    pub fn from_bytes(filename: impl Into<String>, bytes: &[u8]) -> Self {
        Self {
            filename: filename.into(),
            content: BASE64.encode(bytes),
        }
    }
}

/// Resend request body, also the serialized form stored in the outbox
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EmailMessage {
    pub from: String,
    pub to: Vec<String>,
    pub subject: String,
    pub html: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub attachments: Vec<EmailAttachment>,
}

/// Which template produced a message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationKind {
    PaymentIssue,
    SubscriptionCanceled,
    BookingConfirmation,
    BookingAdminNotice,
    CoursePurchaseConfirmation,
}

impl NotificationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            NotificationKind::PaymentIssue => "payment_issue",
            NotificationKind::SubscriptionCanceled => "subscription_canceled",
            NotificationKind::BookingConfirmation => "booking_confirmation",
            NotificationKind::BookingAdminNotice => "booking_admin_notice",
            NotificationKind::CoursePurchaseConfirmation => "course_purchase_confirmation",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "payment_issue" => Some(NotificationKind::PaymentIssue),
            "subscription_canceled" => Some(NotificationKind::SubscriptionCanceled),
            "booking_confirmation" => Some(NotificationKind::BookingConfirmation),
            "booking_admin_notice" => Some(NotificationKind::BookingAdminNotice),
            "course_purchase_confirmation" => Some(NotificationKind::CoursePurchaseConfirmation),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notification {
    pub kind: NotificationKind,
    pub message: EmailMessage,
}

#[async_trait]
pub trait Mailer: Send + Sync {
    /// Send one message, returning the provider's message id
    async fn send(&self, message: &EmailMessage) -> BillingResult<String>;
}

#[derive(Debug, Deserialize)]
struct ResendEmailResponse {
    id: String,
}

/// Sends mail through the Resend HTTP API
#[derive(Clone)]
pub struct ResendMailer {
    api_key: String,
    api_url: String,
    http_client: Client,
}

impl ResendMailer {
    pub fn new(api_key: impl Into<String>, api_url: impl Into<String>) -> BillingResult<Self> {
        let http_client = Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| BillingError::Config(format!("HTTP client: {}", e)))?;

        Ok(Self {
            api_key: api_key.into(),
            api_url: api_url.into().trim_end_matches('/').to_string(),
            http_client,
        })
    }

    pub fn from_config(config: &EmailConfig) -> BillingResult<Self> {
        Self::new(&config.resend_api_key, &config.resend_api_url)
    }
}

#[async_trait]
impl Mailer for ResendMailer {
    async fn send(&self, message: &EmailMessage) -> BillingResult<String> {
        let response = self
            .http_client
            .post(format!("{}/emails", self.api_url))
            .bearer_auth(&self.api_key)
            .json(message)
            .send()
            .await
            .map_err(|e| {
                tracing::error!(error = %e, "Failed to send request to Resend API");
                BillingError::from(e)
            })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            tracing::error!(status = %status, body = %body, "Resend API returned an error");
            return Err(BillingError::Email(format!("{} - {}", status, body)));
        }

        let parsed: ResendEmailResponse = response.json().await.map_err(|e| {
            tracing::error!(error = %e, "Failed to parse Resend API response");
            BillingError::Email(format!("unexpected response: {}", e))
        })?;

        Ok(parsed.id)
    }
}

/// Keeps sent messages in memory; can be told to fail
#[derive(Debug, Default)]
pub struct RecordingMailer {
    sent: Mutex<Vec<EmailMessage>>,
    failure: Mutex<Option<String>>,
}

impl RecordingMailer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every following send fail with `reason` (or succeed again with `None`)
    pub async fn set_failure(&self, reason: Option<&str>) {
        *self.failure.lock().await = reason.map(str::to_string);
    }

    pub async fn sent(&self) -> Vec<EmailMessage> {
        self.sent.lock().await.clone()
    }

    pub async fn sent_to(&self, address: &str) -> Vec<EmailMessage> {
        self.sent
            .lock()
            .await
            .iter()
            .filter(|m| m.to.iter().any(|to| to == address))
            .cloned()
            .collect()
    }
}

#[async_trait]
impl Mailer for RecordingMailer {
    async fn send(&self, message: &EmailMessage) -> BillingResult<String> {
        if let Some(reason) = self.failure.lock().await.clone() {
            return Err(BillingError::Email(reason));
        }
        let mut sent = self.sent.lock().await;
        sent.push(message.clone());
        Ok(format!("rec_{}", sent.len()))
    }
}

/// Booking details rendered into the confirmation and admin emails
#[derive(Debug, Clone)]
pub struct BookingSummary<'a> {
    pub attendee_name: &'a str,
    pub attendee_email: &'a str,
    pub attendee_phone: Option<&'a str>,
    pub event_title: &'a str,
    pub event_date: &'a str,
    pub event_time: &'a str,
    pub quantity: i32,
    pub amount_cents: i64,
    pub currency: &'a str,
    pub safety_accepted: bool,
}

/// Builds the transactional emails
#[derive(Clone)]
pub struct BillingEmailService {
    config: Arc<EmailConfig>,
}

impl BillingEmailService {
    pub fn new(config: EmailConfig) -> Self {
        Self {
            config: Arc::new(config),
        }
    }

    pub fn config(&self) -> &EmailConfig {
        &self.config
    }

    fn message(&self, to: &str, subject: String, body: String) -> EmailMessage {
        EmailMessage {
            from: self.config.from_address.clone(),
            to: vec![to.to_string()],
            subject,
            html: layout(&body),
            attachments: Vec::new(),
        }
    }

    pub fn payment_issue(&self, contact: &Contact, invoice_url: Option<&str>) -> Notification {
        let action = match invoice_url {
            Some(url) => format!(
                r#"<p><a href="{}" style="color: #5b4b8a;">Review and pay your invoice</a></p>"#,
                html_escape(url)
            ),
            None => format!(
                r#"<p>You can update your payment method from <a href="{}/account" style="color: #5b4b8a;">your account</a>.</p>"#,
                self.config.site_url
            ),
        };
        let body = format!(
            "<h2>There was a problem with your payment</h2>\
             <p>Hi {},</p>\
             <p>We couldn't take the latest payment for your Studio membership. \
             Your access stays open while Stripe retries, but please check your card details.</p>{}",
            html_escape(contact.greeting_name()),
            action
        );

        Notification {
            kind: NotificationKind::PaymentIssue,
            message: self.message(
                &contact.email,
                "Action needed: payment issue with your Studio membership".to_string(),
                body,
            ),
        }
    }

    pub fn subscription_canceled(&self, contact: &Contact, period_end: Option<&str>) -> Notification {
        let access = match period_end {
            Some(date) => format!("<p>Your access continues until {}.</p>", html_escape(date)),
            None => String::new(),
        };
        let body = format!(
            "<h2>Your Studio membership has been cancelled</h2>\
             <p>Hi {},</p>\
             <p>We're sorry to see you go. Your membership has been cancelled and you won't be charged again.</p>{}\
             <p>You can rejoin any time from <a href=\"{}/studio\" style=\"color: #5b4b8a;\">the Studio page</a>.</p>",
            html_escape(contact.greeting_name()),
            access,
            self.config.site_url
        );

        Notification {
            kind: NotificationKind::SubscriptionCanceled,
            message: self.message(
                &contact.email,
                "Your Studio membership has been cancelled".to_string(),
                body,
            ),
        }
    }

    pub fn booking_confirmation(
        &self,
        booking: &BookingSummary<'_>,
        calendar_ics: Option<&str>,
    ) -> Notification {
        let body = format!(
            "<h2>You're booked in</h2>\
             <p>Hi {},</p>\
             <p>Thank you for booking <strong>{}</strong>.</p>{}\
             <p>We've attached a calendar invite. Please arrive ten minutes early.</p>",
            html_escape(booking.attendee_name),
            html_escape(booking.event_title),
            booking_table(booking)
        );

        let mut message = self.message(
            booking.attendee_email,
            format!("Booking confirmed: {}", booking.event_title),
            body,
        );
        if let Some(ics) = calendar_ics {
            message
                .attachments
                .push(EmailAttachment::from_bytes("event.ics", ics.as_bytes()));
        }

        Notification {
            kind: NotificationKind::BookingConfirmation,
            message,
        }
    }

    pub fn booking_admin_notice(&self, booking: &BookingSummary<'_>) -> Notification {
        let body = format!(
            "<h2>New booking</h2>\
             <p><strong>{}</strong> ({}) booked <strong>{}</strong>.</p>{}\
             <p>Phone: {}</p>\
             <p>Safety information accepted: {}</p>",
            html_escape(booking.attendee_name),
            html_escape(booking.attendee_email),
            html_escape(booking.event_title),
            booking_table(booking),
            html_escape(booking.attendee_phone.unwrap_or("not provided")),
            if booking.safety_accepted { "yes" } else { "no" }
        );

        Notification {
            kind: NotificationKind::BookingAdminNotice,
            message: self.message(
                &self.config.admin_address,
                format!(
                    "New booking: {} on {}",
                    booking.event_title, booking.event_date
                ),
                body,
            ),
        }
    }

    pub fn course_purchase_confirmation(&self, to: &str, course_title: &str) -> Notification {
        let body = format!(
            "<h2>Your course is ready</h2>\
             <p>Thank you for purchasing <strong>{}</strong>.</p>\
             <p>You can start any time from <a href=\"{}/courses\" style=\"color: #5b4b8a;\">your courses</a>.</p>",
            html_escape(course_title),
            self.config.site_url
        );

        Notification {
            kind: NotificationKind::CoursePurchaseConfirmation,
            message: self.message(to, format!("You now have access to {}", course_title), body),
        }
    }
}

fn booking_table(booking: &BookingSummary<'_>) -> String {
    format!(
        r#"<table style="border-collapse: collapse; margin: 16px 0;">
<tr><td style="padding: 4px 12px 4px 0; color: #666;">Date</td><td>{}</td></tr>
<tr><td style="padding: 4px 12px 4px 0; color: #666;">Time</td><td>{}</td></tr>
<tr><td style="padding: 4px 12px 4px 0; color: #666;">Places</td><td>{}</td></tr>
<tr><td style="padding: 4px 12px 4px 0; color: #666;">Paid</td><td>{}</td></tr>
</table>"#,
        html_escape(booking.event_date),
        html_escape(booking.event_time),
        booking.quantity,
        format_amount(booking.amount_cents, booking.currency)
    )
}

fn layout(body: &str) -> String {
    format!(
        r#"<!DOCTYPE html>
<html>
<head><meta charset="utf-8"></head>
<body style="font-family: -apple-system, BlinkMacSystemFont, 'Segoe UI', Roboto, sans-serif; max-width: 600px; margin: 0 auto; padding: 20px; color: #333;">
{}
<hr style="border: none; border-top: 1px solid #eee; margin: 30px 0;">
<p style="color: #999; font-size: 12px;">Studio · breathwork and meditation</p>
</body>
</html>"#,
        body
    )
}

/// `2500, "gbp"` → `"£25.00"`
pub fn format_amount(amount_cents: i64, currency: &str) -> String {
    let symbol = match currency.to_ascii_lowercase().as_str() {
        "gbp" => "£",
        "usd" => "$",
        "eur" => "€",
        _ => "",
    };
    let major = amount_cents / 100;
    let minor = (amount_cents % 100).abs();
    if symbol.is_empty() {
        format!("{}.{:02} {}", major, minor, currency.to_ascii_uppercase())
    } else {
        format!("{}{}.{:02}", symbol, major, minor)
    }
}

fn html_escape(value: &str) -> String {
    value
        .replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
}
