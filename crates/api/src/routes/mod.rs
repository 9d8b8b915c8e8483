//! HTTP routes

mod health;
mod webhooks;

use axum::{
    routing::{get, post},
    Router,
};

use crate::state::AppState;

pub use health::health;
pub use webhooks::stripe_webhook;

pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/webhooks/stripe", post(stripe_webhook))
        .with_state(state)
}
