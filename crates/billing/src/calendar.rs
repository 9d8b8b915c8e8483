//! iCalendar attachments for event bookings

use time::macros::format_description;
use time::{Duration, OffsetDateTime, PrimitiveDateTime};

use crate::error::{BillingError, BillingResult};
use crate::metadata::BookingMetadata;

/// Calendar settings for generated invites
#[derive(Debug, Clone)]
pub struct CalendarConfig {
    /// IANA zone the event date/time metadata is expressed in
    pub timezone: String,
    pub organizer_name: String,
    pub organizer_email: String,
    pub location: Option<String>,
}

/// Turn an event slug into a display title: `"breathwork-journey"` → `"Breathwork Journey"`
pub fn event_title_from_slug(slug: &str) -> String {
    slug.split(['-', '_', ' '])
        .filter(|word| !word.is_empty())
        .map(|word| {
            let mut chars = word.chars();
            match chars.next() {
                Some(first) => first.to_uppercase().chain(chars).collect::<String>(),
                None => String::new(),
            }
        })
        .collect::<Vec<_>>()
        .join(" ")
}

/// Session length for an event type. Matched by substring, first hit wins.
pub fn duration_for_event_type(event_type: &str) -> Duration {
    const DURATIONS: &[(&str, i64)] = &[
        ("retreat", 360),
        ("workshop", 180),
        ("ceremony", 150),
        ("journey", 120),
    ];
    const DEFAULT_MINUTES: i64 = 90;

    let event_type = event_type.to_ascii_lowercase();
    let minutes = DURATIONS
        .iter()
        .find(|(needle, _)| event_type.contains(needle))
        .map(|(_, minutes)| *minutes)
        .unwrap_or(DEFAULT_MINUTES);

    Duration::minutes(minutes)
}

/// A single VEVENT
#[derive(Debug, Clone)]
pub struct CalendarEvent {
    pub uid: String,
    pub title: String,
    pub description: String,
    pub location: Option<String>,
    pub start: PrimitiveDateTime,
    pub end: PrimitiveDateTime,
    pub timezone: String,
    pub organizer_name: String,
    pub organizer_email: String,
    pub attendee_name: String,
    pub attendee_email: String,
}

impl CalendarEvent {
    pub fn for_booking(
        config: &CalendarConfig,
        booking: &BookingMetadata,
        session_id: &str,
    ) -> BillingResult<Self> {
        let start = PrimitiveDateTime::new(booking.event_date, booking.event_time);
        let end = start
            .checked_add(duration_for_event_type(&booking.event_type))
            .ok_or_else(|| BillingError::InvalidInput("event end out of range".to_string()))?;
        let title = event_title_from_slug(&booking.event_type);

        let description = if booking.quantity > 1 {
            format!("{} ({} places)", title, booking.quantity)
        } else {
            title.clone()
        };

        Ok(Self {
            uid: format!("{}@bookings", session_id),
            title,
            description,
            location: config.location.clone(),
            start,
            end,
            timezone: config.timezone.clone(),
            organizer_name: config.organizer_name.clone(),
            organizer_email: config.organizer_email.clone(),
            attendee_name: booking.attendee_name.clone(),
            attendee_email: booking.attendee_email.clone(),
        })
    }

    /// Render as an RFC 5545 calendar with CRLF line endings
    pub fn to_ics(&self, stamp: OffsetDateTime) -> BillingResult<String> {
        let local = format_description!("[year][month][day]T[hour][minute][second]");
        let utc = format_description!("[year][month][day]T[hour][minute][second]Z");
        let format_err = |e: time::error::Format| BillingError::Internal(e.to_string());

        let dtstamp = stamp
            .to_offset(time::UtcOffset::UTC)
            .format(utc)
            .map_err(format_err)?;
        let dtstart = self.start.format(local).map_err(format_err)?;
        let dtend = self.end.format(local).map_err(format_err)?;

        let mut lines = vec![
            "BEGIN:VCALENDAR".to_string(),
            "VERSION:2.0".to_string(),
            "PRODID:-//Studio//Bookings//EN".to_string(),
            "CALSCALE:GREGORIAN".to_string(),
            "METHOD:REQUEST".to_string(),
            "BEGIN:VEVENT".to_string(),
            format!("UID:{}", self.uid),
            format!("DTSTAMP:{}", dtstamp),
            format!("DTSTART;TZID={}:{}", self.timezone, dtstart),
            format!("DTEND;TZID={}:{}", self.timezone, dtend),
            format!("SUMMARY:{}", escape_text(&self.title)),
            format!("DESCRIPTION:{}", escape_text(&self.description)),
        ];
        if let Some(location) = &self.location {
            lines.push(format!("LOCATION:{}", escape_text(location)));
        }
        lines.push(format!(
            "ORGANIZER;CN={}:mailto:{}",
            escape_param(&self.organizer_name),
            self.organizer_email
        ));
        lines.push(format!(
            "ATTENDEE;CN={};ROLE=REQ-PARTICIPANT;RSVP=FALSE:mailto:{}",
            escape_param(&self.attendee_name),
            self.attendee_email
        ));
        lines.push("STATUS:CONFIRMED".to_string());
        lines.push("END:VEVENT".to_string());
        lines.push("END:VCALENDAR".to_string());

        let mut out = String::new();
        for line in lines {
            out.push_str(&fold_line(&line));
            out.push_str("\r\n");
        }
        Ok(out)
    }
}

fn escape_text(value: &str) -> String {
    value
        .replace('\\', "\\\\")
        .replace(';', "\\;")
        .replace(',', "\\,")
        .replace("\r\n", "\\n")
        .replace(['\r', '\n'], "\\n")
}

fn escape_param(value: &str) -> String {
    let value = value.replace(|c: char| c.is_control(), "");
    if value.contains([':', ';', ',']) {
        format!("\"{}\"", value.replace('"', "'"))
    } else {
        value
    }
}

/// Fold content lines at 75 octets without splitting a UTF-8 sequence
fn fold_line(line: &str) -> String {
    const LIMIT: usize = 75;

    if line.len() <= LIMIT {
        return line.to_string();
    }

    let mut out = String::with_capacity(line.len() + line.len() / LIMIT * 3);
    let mut width = 0;
    for ch in line.chars() {
        let len = ch.len_utf8();
        if width + len > LIMIT {
            out.push_str("\r\n ");
            // continuation lines start with the space, which counts
            width = 1;
        }
        out.push(ch);
        width += len;
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::macros::{date, datetime, time};

    fn config() -> CalendarConfig {
        CalendarConfig {
            timezone: "Europe/London".to_string(),
            organizer_name: "Studio".to_string(),
            organizer_email: "hello@example.com".to_string(),
            location: Some("Hall 2, Main St".to_string()),
        }
    }

    fn booking(event_type: &str) -> BookingMetadata {
        BookingMetadata {
            event_type: event_type.to_string(),
            event_date: date!(2024 - 09 - 14),
            event_time: time!(18:30),
            attendee_name: "Ada Lovelace".to_string(),
            attendee_email: "ada@example.com".to_string(),
            attendee_phone: None,
            user_id: None,
            quantity: 2,
            safety_accepted: true,
        }
    }

    #[test]
    fn test_title_from_slug() {
        assert_eq!(event_title_from_slug("breathwork-journey"), "Breathwork Journey");
        assert_eq!(event_title_from_slug("ice_bath--workshop"), "Ice Bath Workshop");
        assert_eq!(event_title_from_slug(""), "");
    }

    #[test]
    fn test_duration_lookup_by_substring() {
        assert_eq!(duration_for_event_type("weekend-retreat"), Duration::hours(6));
        assert_eq!(duration_for_event_type("Ice-Bath-WORKSHOP"), Duration::hours(3));
        assert_eq!(duration_for_event_type("cacao-ceremony"), Duration::minutes(150));
        assert_eq!(duration_for_event_type("breathwork-journey"), Duration::hours(2));
        assert_eq!(duration_for_event_type("sound-bath"), Duration::minutes(90));
    }

    #[test]
    fn test_booking_event_times() {
        let event = CalendarEvent::for_booking(&config(), &booking("breathwork-journey"), "cs_1")
            .unwrap();
        assert_eq!(event.start, datetime!(2024-09-14 18:30));
        assert_eq!(event.end, datetime!(2024-09-14 20:30));
        assert_eq!(event.uid, "cs_1@bookings");
        assert_eq!(event.description, "Breathwork Journey (2 places)");
    }

    #[test]
    fn test_ics_rendering() {
        let event = CalendarEvent::for_booking(&config(), &booking("breathwork-journey"), "cs_1")
            .unwrap();
        let ics = event.to_ics(datetime!(2024-09-01 12:00 UTC)).unwrap();

        assert!(ics.starts_with("BEGIN:VCALENDAR\r\n"));
        assert!(ics.ends_with("END:VCALENDAR\r\n"));
        assert!(ics.contains("DTSTAMP:20240901T120000Z\r\n"));
        assert!(ics.contains("DTSTART;TZID=Europe/London:20240914T183000\r\n"));
        assert!(ics.contains("DTEND;TZID=Europe/London:20240914T203000\r\n"));
        assert!(ics.contains("LOCATION:Hall 2\\, Main St\r\n"));
        assert!(ics.contains("SUMMARY:Breathwork Journey\r\n"));
    }

    #[test]
    fn test_line_breaks_cannot_add_properties() {
        assert_eq!(escape_text("a\rb\r\nc"), "a\\nb\\nc");
        assert_eq!(escape_param("Studio\r\nATTENDEE"), "StudioATTENDEE");
    }

    #[test]
    fn test_long_lines_are_folded() {
        let folded = fold_line(&format!("DESCRIPTION:{}", "é".repeat(60)));
        for (i, part) in folded.split("\r\n").enumerate() {
            assert!(part.len() <= 75, "line {} too long: {}", i, part.len());
            if i > 0 {
                assert!(part.starts_with(' '));
            }
        }
        let unfolded = folded.replace("\r\n ", "");
        assert_eq!(unfolded, format!("DESCRIPTION:{}", "é".repeat(60)));
    }
}
