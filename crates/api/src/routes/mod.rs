//! HTTP routes

pub mod accounts;
pub mod credits;
pub mod payments;
pub mod subscription;
pub mod webhooks;

use axum::{
    middleware,
    routing::{get, post},
    Json, Router,
};
use serde_json::json;

use crate::{auth::require_auth, state::AppState};

pub fn create_router(state: AppState) -> Router {
    let authed = Router::new()
        .route("/api/v1/credits/balance", get(credits::get_balance))
        .route("/api/v1/credits/check", get(credits::check_balance))
        .route("/api/v1/credits/history", get(credits::get_history))
        .route("/api/v1/credits/debit", post(credits::debit))
        .route("/api/v1/credits/refund", post(credits::refund))
        .route("/api/v1/payments", get(payments::list_payments))
        .route(
            "/api/v1/payments/checkout/{session_id}",
            get(payments::get_checkout_payment),
        )
        .route("/api/v1/subscription", get(subscription::get_subscription))
        .layer(middleware::from_fn_with_state(
            state.jwt_verifier.clone(),
            require_auth,
        ));

    Router::new()
        .route("/health", get(health))
        .route("/api/v1/webhooks/billing", post(webhooks::receive))
        .route("/internal/v1/accounts", post(accounts::create_account))
        .route(
            "/internal/v1/accounts/{account_id}/anonymize",
            post(accounts::anonymize_account),
        )
        .merge(authed)
        .with_state(state)
}

async fn health() -> Json<serde_json::Value> {
    Json(json!({ "status": "ok" }))
}
