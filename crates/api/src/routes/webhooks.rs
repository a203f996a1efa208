//! Billing webhook receiver.
//!
//! The raw body must reach verification byte-for-byte, so this handler
//! takes the unparsed payload. Outcomes map to HTTP statuses the provider
//! understands: 2xx acknowledges (including drops that redelivery cannot
//! fix), 400 rejects a bad signature, and 5xx asks for redelivery.

use axum::{
    extract::State,
    http::HeaderMap,
    Json,
};
use serde_json::json;

use scribe_billing::ReconcileOutcome;

use crate::{error::ApiError, state::AppState};

const SIGNATURE_HEADER: &str = "provider-signature";

pub async fn receive(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: String,
) -> Result<Json<serde_json::Value>, ApiError> {
    let signature = headers
        .get(SIGNATURE_HEADER)
        .and_then(|v| v.to_str().ok())
        .ok_or(ApiError::SignatureInvalid)?;

    let outcome = state.billing.webhooks.receive(&body, signature).await?;

    let status = match &outcome {
        ReconcileOutcome::Applied => "applied",
        ReconcileOutcome::Duplicate => "duplicate",
        ReconcileOutcome::Skipped(_) => "skipped",
        ReconcileOutcome::Ignored => "ignored",
    };

    Ok(Json(json!({ "received": true, "outcome": status })))
}
