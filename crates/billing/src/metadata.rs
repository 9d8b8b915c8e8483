//! Checkout metadata validated into a tagged intent
//!
//! The storefront attaches a flat string map to each Checkout Session and uses
//! its `type` key as a discriminator. The map is turned into a
//! [`CheckoutIntent`] here, before any branching on it happens.

use time::macros::format_description;
use time::{Date, Time};
use uuid::Uuid;

use crate::event::CheckoutSessionObject;

/// What a paid checkout session was for
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CheckoutIntent {
    EventBooking(BookingMetadata),
    CoursePurchase(CoursePurchaseMetadata),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BookingMetadata {
    pub event_type: String,
    pub event_date: Date,
    pub event_time: Time,
    pub attendee_name: String,
    pub attendee_email: String,
    pub attendee_phone: Option<String>,
    pub user_id: Option<Uuid>,
    pub quantity: i32,
    pub safety_accepted: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CoursePurchaseMetadata {
    pub user_id: Uuid,
    pub course_id: Uuid,
    pub email: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum MetadataError {
    #[error("metadata has no type")]
    MissingType,
    #[error("unknown checkout type: {0}")]
    UnknownType(String),
    #[error("missing metadata field: {0}")]
    MissingField(&'static str),
    #[error("invalid value for {field}: {value}")]
    InvalidField { field: &'static str, value: String },
}

impl MetadataError {
    /// Sessions created by other products share the Stripe account; those
    /// carry no type or one we do not know and are simply not ours.
    pub fn is_foreign(&self) -> bool {
        matches!(self, MetadataError::MissingType | MetadataError::UnknownType(_))
    }
}

impl CheckoutIntent {
    pub fn from_session(session: &CheckoutSessionObject) -> Result<Self, MetadataError> {
        match session.metadata_value("type") {
            None => Err(MetadataError::MissingType),
            Some("event_booking") => parse_booking(session).map(CheckoutIntent::EventBooking),
            Some("course_purchase") => {
                parse_course_purchase(session).map(CheckoutIntent::CoursePurchase)
            }
            Some(other) => Err(MetadataError::UnknownType(other.to_string())),
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            CheckoutIntent::EventBooking(_) => "event_booking",
            CheckoutIntent::CoursePurchase(_) => "course_purchase",
        }
    }
}

fn parse_booking(session: &CheckoutSessionObject) -> Result<BookingMetadata, MetadataError> {
    let event_type = single_line("event_type", required(session, "event_type")?)?;
    let event_date = parse_date(required(session, "event_date")?)?;
    let event_time = parse_time(required(session, "event_time")?)?;

    let attendee_name = session
        .metadata_value("attendee_name")
        .or_else(|| session.metadata_value("customer_name"))
        .or_else(|| session.buyer_name())
        .ok_or(MetadataError::MissingField("attendee_name"))?;
    let attendee_name = single_line("attendee_name", attendee_name)?;

    let attendee_email = session
        .metadata_value("attendee_email")
        .or_else(|| session.metadata_value("customer_email"))
        .or_else(|| session.buyer_email())
        .ok_or(MetadataError::MissingField("attendee_email"))?;
    let attendee_email = parse_email("attendee_email", attendee_email)?;

    let attendee_phone = session
        .metadata_value("attendee_phone")
        .or_else(|| session.buyer_phone())
        .map(str::to_string);

    let user_id = match session.metadata_value("user_id") {
        Some(raw) => Some(parse_uuid("user_id", raw)?),
        None => None,
    };

    let quantity = match session.metadata_value("quantity") {
        Some(raw) => raw
            .parse::<i32>()
            .ok()
            .filter(|q| *q > 0)
            .ok_or_else(|| MetadataError::InvalidField {
                field: "quantity",
                value: raw.to_string(),
            })?,
        None => 1,
    };

    let safety_accepted = session
        .metadata_value("safety_accepted")
        .map(|v| matches!(v.to_ascii_lowercase().as_str(), "true" | "1" | "yes"))
        .unwrap_or(false);

    Ok(BookingMetadata {
        event_type,
        event_date,
        event_time,
        attendee_name,
        attendee_email,
        attendee_phone,
        user_id,
        quantity,
        safety_accepted,
    })
}

fn parse_course_purchase(
    session: &CheckoutSessionObject,
) -> Result<CoursePurchaseMetadata, MetadataError> {
    let user_id = parse_uuid("user_id", required(session, "user_id")?)?;
    let course_id = parse_uuid("course_id", required(session, "course_id")?)?;
    let email = session
        .metadata_value("email")
        .or_else(|| session.buyer_email())
        .map(str::to_string);

    Ok(CoursePurchaseMetadata {
        user_id,
        course_id,
        email,
    })
}

fn required<'a>(
    session: &'a CheckoutSessionObject,
    field: &'static str,
) -> Result<&'a str, MetadataError> {
    session
        .metadata_value(field)
        .ok_or(MetadataError::MissingField(field))
}

/// Values that end up in email headers and calendar properties
fn single_line(field: &'static str, raw: &str) -> Result<String, MetadataError> {
    if raw.chars().any(char::is_control) {
        return Err(MetadataError::InvalidField {
            field,
            value: raw.escape_debug().to_string(),
        });
    }
    Ok(raw.to_string())
}

fn parse_email(field: &'static str, raw: &str) -> Result<String, MetadataError> {
    let email = single_line(field, raw)?;
    if !email.contains('@') || email.chars().any(char::is_whitespace) {
        return Err(MetadataError::InvalidField { field, value: email });
    }
    Ok(email)
}

fn parse_uuid(field: &'static str, raw: &str) -> Result<Uuid, MetadataError> {
    Uuid::parse_str(raw).map_err(|_| MetadataError::InvalidField {
        field,
        value: raw.to_string(),
    })
}

fn parse_date(raw: &str) -> Result<Date, MetadataError> {
    Date::parse(raw, format_description!("[year]-[month]-[day]")).map_err(|_| {
        MetadataError::InvalidField {
            field: "event_date",
            value: raw.to_string(),
        }
    })
}

/// Accepts `HH:MM` and `HH:MM:SS`
fn parse_time(raw: &str) -> Result<Time, MetadataError> {
    Time::parse(raw, format_description!("[hour]:[minute]:[second]"))
        .or_else(|_| Time::parse(raw, format_description!("[hour]:[minute]")))
        .map_err(|_| MetadataError::InvalidField {
            field: "event_time",
            value: raw.to_string(),
        })
}
