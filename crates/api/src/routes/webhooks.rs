//! Stripe webhook endpoint

use axum::{extract::State, http::HeaderMap, Json};
use serde_json::{json, Value};
use wellness_billing::EventDisposition;

use crate::{
    error::{ApiError, ApiResult},
    state::AppState,
};

const SIGNATURE_HEADER: &str = "stripe-signature";

/// `POST /webhooks/stripe`
///
/// The body is taken as the raw string Stripe signed; it is only parsed after
/// the signature checks out.
pub async fn stripe_webhook(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: String,
) -> ApiResult<Json<Value>> {
    let signature = headers
        .get(SIGNATURE_HEADER)
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| ApiError::BadRequest("Missing stripe-signature header".to_string()))?;

    let event = state.webhooks.verify_event(&body, signature)?;
    let event_id = event.id.clone();

    match state.webhooks.handle_event(event).await? {
        EventDisposition::Processed(_) => {}
        EventDisposition::Duplicate { .. } => {
            tracing::debug!(event_id = %event_id, "Acknowledged duplicate delivery");
        }
        EventDisposition::Rejected { reason } => {
            tracing::warn!(event_id = %event_id, reason = %reason, "Acknowledged rejected event");
        }
    }

    Ok(Json(json!({ "received": true })))
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use axum::{
        body::{to_bytes, Body},
        http::{Request, StatusCode},
        Router,
    };
    use serde_json::json;
    use tower::ServiceExt;
    use wellness_billing::{
        calendar::CalendarConfig, signature::signature_header, BillingConfig, BillingService,
        EmailConfig, MemoryBillingStore, RecordingMailer, StaticCustomerDirectory, StripeConfig,
    };

    use crate::{routes::create_router, state::AppState};

    const SECRET: &str = "whsec_route_test";

    struct TestApp {
        router: Router,
        store: Arc<MemoryBillingStore>,
        mailer: Arc<RecordingMailer>,
    }

    fn app() -> TestApp {
        let store = Arc::new(MemoryBillingStore::new());
        let mailer = Arc::new(RecordingMailer::new());
        let config = BillingConfig {
            stripe: StripeConfig::new("sk_test_123", SECRET),
            email: EmailConfig {
                resend_api_key: "re_test".to_string(),
                resend_api_url: "http://localhost".to_string(),
                from_address: "Studio <hello@example.com>".to_string(),
                admin_address: "admin@example.com".to_string(),
                site_url: "https://studio.example.com".to_string(),
            },
            calendar: CalendarConfig {
                timezone: "Europe/London".to_string(),
                organizer_name: "Studio".to_string(),
                organizer_email: "admin@example.com".to_string(),
                location: None,
            },
        };
        let billing = BillingService::with_components(
            config,
            store.clone(),
            mailer.clone(),
            Arc::new(StaticCustomerDirectory::new()),
        );

        TestApp {
            router: create_router(AppState::new(&billing)),
            store,
            mailer,
        }
    }

    fn request(body: &str, signature: Option<String>) -> Request<Body> {
        let mut builder = Request::builder()
            .method("POST")
            .uri("/webhooks/stripe")
            .header("content-type", "application/json");
        if let Some(signature) = signature {
            builder = builder.header("stripe-signature", signature);
        }
        builder.body(Body::from(body.to_string())).unwrap()
    }

    fn signed(body: &str) -> Option<String> {
        let now = time::OffsetDateTime::now_utc().unix_timestamp();
        Some(signature_header(SECRET, now, body).unwrap())
    }

    async fn json_body(response: axum::response::Response) -> serde_json::Value {
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    fn event_body(id: &str, event_type: &str, object: serde_json::Value) -> String {
        json!({
            "id": id,
            "type": event_type,
            "created": time::OffsetDateTime::now_utc().unix_timestamp(),
            "data": { "object": object }
        })
        .to_string()
    }

    #[tokio::test]
    async fn test_missing_signature_is_bad_request() {
        let app = app();
        let body = event_body("evt_1", "customer.created", json!({}));
        let response = app.router.oneshot(request(&body, None)).await.unwrap();

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(app.store.call_count(), 0);
    }

    #[tokio::test]
    async fn test_invalid_signature_is_bad_request_and_store_untouched() {
        let app = app();
        let body = event_body("evt_1", "customer.subscription.deleted", json!({"id": "sub_1"}));
        let response = app
            .router
            .oneshot(request(&body, Some("t=1,v1=deadbeef".to_string())))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let body = json_body(response).await;
        assert!(body["error"].as_str().unwrap().contains("signature"));
        assert_eq!(app.store.call_count(), 0);
        assert!(app.mailer.sent().await.is_empty());
    }

    #[tokio::test]
    async fn test_unknown_event_type_is_acknowledged() {
        let app = app();
        let body = event_body("evt_2", "product.created", json!({"id": "prod_1"}));
        let response = app.router.oneshot(request(&body, signed(&body))).await.unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(json_body(response).await, json!({ "received": true }));
    }

    #[tokio::test]
    async fn test_database_failure_is_server_error() {
        let app = app();
        app.store.fail_writes(Some("connection refused")).await;
        let body = event_body(
            "evt_3",
            "invoice.payment_succeeded",
            json!({"id": "in_1", "subscription": "sub_1"}),
        );
        let response = app.router.oneshot(request(&body, signed(&body))).await.unwrap();

        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        let body = json_body(response).await;
        assert_eq!(body["error"], "Internal server error");
        assert!(!body.to_string().contains("connection refused"));
    }

    #[tokio::test]
    async fn test_health() {
        let app = app();
        let response = app
            .router
            .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(json_body(response).await["status"], "ok");
    }
}
