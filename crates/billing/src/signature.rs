//! Stripe webhook signature verification
//!
//! Stripe signs `"{timestamp}.{payload}"` with HMAC-SHA256 using the endpoint
//! secret and sends the result in the `stripe-signature` header as
//! `t=<unix>,v1=<hex>[,v1=<hex>…][,v0=<hex>]`. During secret rotation more
//! than one `v1` entry may be present; any match is accepted.

use hmac::{Hmac, Mac};
use sha2::Sha256;
use subtle::ConstantTimeEq;

use crate::error::{BillingError, BillingResult};

type HmacSha256 = Hmac<Sha256>;

/// Default replay window, matching Stripe's own libraries
pub const DEFAULT_TOLERANCE_SECS: i64 = 300;

/// Parsed `stripe-signature` header
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignatureHeader {
    pub timestamp: i64,
    pub signatures: Vec<String>,
}

impl SignatureHeader {
    pub fn parse(header: &str) -> BillingResult<Self> {
        let mut timestamp: Option<i64> = None;
        let mut signatures = Vec::new();

        for part in header.split(',') {
            let Some((key, value)) = part.trim().split_once('=') else {
                continue;
            };
            match key {
                "t" => timestamp = value.parse().ok(),
                "v1" => signatures.push(value.to_string()),
                _ => {}
            }
        }

        let timestamp = timestamp.ok_or_else(|| {
            tracing::warn!("Missing timestamp in signature header");
            BillingError::WebhookSignatureInvalid
        })?;

        if signatures.is_empty() {
            tracing::warn!("Missing v1 signature in signature header");
            return Err(BillingError::WebhookSignatureInvalid);
        }

        Ok(Self {
            timestamp,
            signatures,
        })
    }
}

/// Hex-encoded HMAC-SHA256 of `"{timestamp}.{payload}"`
pub fn compute_signature(secret: &str, timestamp: i64, payload: &str) -> BillingResult<String> {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .map_err(|_| BillingError::Config("Invalid webhook secret key".to_string()))?;
    mac.update(timestamp.to_string().as_bytes());
    mac.update(b".");
    mac.update(payload.as_bytes());
    Ok(hex::encode(mac.finalize().into_bytes()))
}

/// Build a header value the way Stripe would for `payload` signed at `timestamp`.
///
/// Used by the Stripe CLI style local tooling and by tests.
pub fn signature_header(secret: &str, timestamp: i64, payload: &str) -> BillingResult<String> {
    let signature = compute_signature(secret, timestamp, payload)?;
    Ok(format!("t={},v1={}", timestamp, signature))
}

/// Verify `header` against `payload` at wall-clock time `now` (unix seconds)
pub fn verify_signature(
    payload: &str,
    header: &str,
    secret: &str,
    tolerance_secs: i64,
    now: i64,
) -> BillingResult<()> {
    let parsed = SignatureHeader::parse(header)?;

    let age = now.abs_diff(parsed.timestamp);
    if age > tolerance_secs.max(0) as u64 {
        tracing::warn!(
            timestamp = parsed.timestamp,
            now = now,
            diff = age,
            "Webhook timestamp outside tolerance"
        );
        return Err(BillingError::WebhookSignatureInvalid);
    }

    let expected = compute_signature(secret, parsed.timestamp, payload)?;
    let matched = parsed
        .signatures
        .iter()
        .any(|candidate| bool::from(candidate.as_bytes().ct_eq(expected.as_bytes())));

    if !matched {
        tracing::warn!(
            candidates = parsed.signatures.len(),
            "Webhook signature mismatch"
        );
        return Err(BillingError::WebhookSignatureInvalid);
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    const SECRET: &str = "whsec_test_secret";
    const PAYLOAD: &str = r#"{"id":"evt_1","type":"invoice.payment_succeeded"}"#;
    const NOW: i64 = 1_717_000_000;

    #[test]
    fn test_valid_signature_accepted() {
        let header = signature_header(SECRET, NOW, PAYLOAD).unwrap();
        verify_signature(PAYLOAD, &header, SECRET, DEFAULT_TOLERANCE_SECS, NOW).unwrap();
    }

    #[test]
    fn test_tampered_payload_rejected() {
        let header = signature_header(SECRET, NOW, PAYLOAD).unwrap();
        let tampered = PAYLOAD.replace("succeeded", "failed");
        let err = verify_signature(&tampered, &header, SECRET, DEFAULT_TOLERANCE_SECS, NOW)
            .unwrap_err();
        assert!(matches!(err, BillingError::WebhookSignatureInvalid));
    }

    #[test]
    fn test_wrong_secret_rejected() {
        let header = signature_header("whsec_other", NOW, PAYLOAD).unwrap();
        assert!(verify_signature(PAYLOAD, &header, SECRET, DEFAULT_TOLERANCE_SECS, NOW).is_err());
    }

    #[test]
    fn test_timestamp_tolerance_boundary() {
        let header = signature_header(SECRET, NOW - 300, PAYLOAD).unwrap();
        assert!(verify_signature(PAYLOAD, &header, SECRET, 300, NOW).is_ok());

        let header = signature_header(SECRET, NOW - 301, PAYLOAD).unwrap();
        assert!(verify_signature(PAYLOAD, &header, SECRET, 300, NOW).is_err());
    }

    #[test]
    fn test_extreme_timestamps_rejected() {
        for timestamp in [i64::MIN, i64::MAX, 0] {
            let header = format!("t={},v1=00", timestamp);
            let err = verify_signature("{}", &header, SECRET, DEFAULT_TOLERANCE_SECS, NOW)
                .unwrap_err();
            assert!(matches!(err, BillingError::WebhookSignatureInvalid));
        }
    }

    #[test]
    fn test_any_v1_entry_may_match() {
        let good = compute_signature(SECRET, NOW, PAYLOAD).unwrap();
        let header = format!("t={},v1={},v1={},v0=ignored", NOW, "deadbeef", good);
        assert!(verify_signature(PAYLOAD, &header, SECRET, DEFAULT_TOLERANCE_SECS, NOW).is_ok());
    }

    #[test]
    fn test_malformed_headers_rejected() {
        assert!(SignatureHeader::parse("").is_err());
        assert!(SignatureHeader::parse("v1=abc").is_err());
        assert!(SignatureHeader::parse("t=notanumber,v1=abc").is_err());
        assert!(SignatureHeader::parse("t=123").is_err());
    }

    #[test]
    fn test_header_parse_keeps_all_v1_values() {
        let parsed = SignatureHeader::parse("t=42, v1=aa, v1=bb").unwrap();
        assert_eq!(parsed.timestamp, 42);
        assert_eq!(parsed.signatures, vec!["aa".to_string(), "bb".to_string()]);
    }
}
