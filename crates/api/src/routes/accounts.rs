//! Internal account provisioning routes.
//!
//! Called service-to-service by the identity service: account creation at
//! registration and anonymization when a user deletes their profile.
//! Guarded by the internal shared secret, not user bearer tokens.

use axum::{
    extract::{Path, State},
    http::HeaderMap,
    Json,
};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{error::ApiError, state::AppState};

const INTERNAL_TOKEN_HEADER: &str = "x-internal-token";

fn check_internal_token(state: &AppState, headers: &HeaderMap) -> Result<(), ApiError> {
    let provided = headers
        .get(INTERNAL_TOKEN_HEADER)
        .and_then(|v| v.to_str().ok())
        .ok_or(ApiError::Unauthorized)?;

    if provided != state.config.internal_api_token {
        return Err(ApiError::Unauthorized);
    }
    Ok(())
}

#[derive(Debug, Deserialize)]
pub struct CreateAccountRequest {
    pub email: String,
}

#[derive(Debug, Serialize)]
pub struct AccountResponse {
    pub account_id: Uuid,
    pub credit_balance: i64,
    pub plan_id: String,
}

/// Create the billing account for a freshly registered user.
pub async fn create_account(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(req): Json<CreateAccountRequest>,
) -> Result<Json<AccountResponse>, ApiError> {
    check_internal_token(&state, &headers)?;

    if req.email.trim().is_empty() {
        return Err(ApiError::BadRequest("email must not be empty".to_string()));
    }

    let account = state.billing.accounts.create_account(&req.email).await?;

    Ok(Json(AccountResponse {
        account_id: account.id,
        credit_balance: account.credit_balance,
        plan_id: account.plan_id.to_string(),
    }))
}

/// Strip PII from an account while preserving its ledger.
pub async fn anonymize_account(
    State(state): State<AppState>,
    Path(account_id): Path<Uuid>,
    headers: HeaderMap,
) -> Result<Json<serde_json::Value>, ApiError> {
    check_internal_token(&state, &headers)?;

    state.billing.accounts.anonymize(account_id).await?;

    Ok(Json(serde_json::json!({ "anonymized": true })))
}
