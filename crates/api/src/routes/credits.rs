//! Credit balance, history, and debit routes.

use axum::{
    extract::{Extension, Query, State},
    Json,
};
use serde::{Deserialize, Serialize};
use tokio_retry::{strategy::ExponentialBackoff, RetryIf};

use scribe_billing::{BillingError, LedgerEntry};
use scribe_shared::RequestContext;

use crate::{auth::AuthUser, error::ApiError, state::AppState};

/// Balance response
#[derive(Debug, Serialize)]
pub struct BalanceResponse {
    pub credit_balance: i64,
    pub plan_id: String,
}

/// Query params for ledger history
#[derive(Debug, Deserialize)]
pub struct HistoryQuery {
    #[serde(default = "default_limit")]
    pub limit: i64,
    #[serde(default)]
    pub offset: i64,
}

fn default_limit() -> i64 {
    50
}

/// Ledger history response
#[derive(Debug, Serialize)]
pub struct HistoryResponse {
    pub entries: Vec<LedgerEntry>,
}

/// Request to debit credits after a costed operation completed.
///
/// Called service-to-service by feature handlers; the recommended
/// discipline is an admission-time balance check, the costed operation,
/// then this call.
#[derive(Debug, Deserialize)]
pub struct DebitRequest {
    pub cost: i64,
    pub endpoint: String,
    /// Correlation id of the originating request, when the caller has one.
    pub request_id: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct DebitResponse {
    pub credit_balance: i64,
}

/// Query params for the admission check
#[derive(Debug, Deserialize)]
pub struct CheckQuery {
    pub cost: i64,
}

#[derive(Debug, Serialize)]
pub struct CheckResponse {
    pub sufficient: bool,
}

/// Request to return credits after a costed operation was rolled back.
#[derive(Debug, Deserialize)]
pub struct RefundRequest {
    pub amount: i64,
    /// Correlation id of the debited request being rolled back.
    pub request_id: Option<String>,
    pub reason: Option<String>,
}

/// Current balance and plan for the authenticated account
pub async fn get_balance(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
) -> Result<Json<BalanceResponse>, ApiError> {
    let account = state.billing.accounts.get(auth_user.account_id).await?;

    Ok(Json(BalanceResponse {
        credit_balance: account.credit_balance,
        plan_id: account.plan_id.to_string(),
    }))
}

/// Advisory admission check before performing a costed operation.
///
/// The authoritative check runs inside the debit's own transaction; this
/// only lets feature handlers reject obviously unfunded requests early.
pub async fn check_balance(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
    Query(query): Query<CheckQuery>,
) -> Result<Json<CheckResponse>, ApiError> {
    if query.cost <= 0 {
        return Err(ApiError::BadRequest("cost must be positive".to_string()));
    }

    let sufficient = state
        .billing
        .accounting
        .check_balance(auth_user.account_id, query.cost)
        .await?;

    Ok(Json(CheckResponse { sufficient }))
}

/// Ledger audit trail, newest first
pub async fn get_history(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
    Query(query): Query<HistoryQuery>,
) -> Result<Json<HistoryResponse>, ApiError> {
    let entries = state
        .billing
        .history
        .list_entries(auth_user.account_id, query.limit, query.offset)
        .await?;

    Ok(Json(HistoryResponse { entries }))
}

/// Debit credits for a completed costed operation.
///
/// Transient store failures are retried here with backoff; a failure that
/// survives the retries surfaces as 503 for the caller to retry later.
/// `InsufficientCredits` is returned as-is — it is a business outcome, not
/// a fault, and retrying cannot change it.
pub async fn debit(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
    Json(req): Json<DebitRequest>,
) -> Result<Json<DebitResponse>, ApiError> {
    if req.cost <= 0 {
        return Err(ApiError::BadRequest("cost must be positive".to_string()));
    }

    let ctx = match &req.request_id {
        Some(request_id) => RequestContext::with_request_id(auth_user.account_id, request_id),
        None => RequestContext::new(auth_user.account_id),
    };

    let backoff = ExponentialBackoff::from_millis(10).factor(5).take(3);
    let new_balance = RetryIf::spawn(
        backoff,
        || {
            state
                .billing
                .accounting
                .debit(auth_user.account_id, req.cost, &req.endpoint, &ctx)
        },
        |err: &BillingError| err.is_transient(),
    )
    .await
    .map_err(|e| {
        if let BillingError::InsufficientCredits { .. } = &e {
            tracing::warn!(
                account_id = %auth_user.account_id,
                endpoint = %req.endpoint,
                cost = req.cost,
                "Debit after admission check found insufficient credits"
            );
        }
        ApiError::from(e)
    })?;

    Ok(Json(DebitResponse {
        credit_balance: new_balance,
    }))
}

/// Return credits for a costed operation the caller rolled back after a
/// successful debit.
pub async fn refund(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
    Json(req): Json<RefundRequest>,
) -> Result<Json<DebitResponse>, ApiError> {
    if req.amount <= 0 {
        return Err(ApiError::BadRequest("amount must be positive".to_string()));
    }

    let description = req
        .reason
        .unwrap_or_else(|| "Rolled back costed operation".to_string());

    let new_balance = state
        .billing
        .accounting
        .refund(
            auth_user.account_id,
            req.amount,
            req.request_id.as_deref(),
            &description,
        )
        .await?;

    Ok(Json(DebitResponse {
        credit_balance: new_balance,
    }))
}
