//! Payment receipt routes.

use axum::{
    extract::{Extension, Path, State},
    Json,
};
use serde::Serialize;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::{auth::AuthUser, error::ApiError, state::AppState};

#[derive(Debug, Serialize)]
pub struct PaymentInfo {
    pub id: Uuid,
    pub amount_cents: i64,
    pub currency: String,
    pub status: String,
    pub payment_type: String,
    pub credits_granted: i64,
    pub created_at: OffsetDateTime,
}

#[derive(Debug, Serialize)]
pub struct PaymentListResponse {
    pub payments: Vec<PaymentInfo>,
}

/// Recent payment receipts for the authenticated account
pub async fn list_payments(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
) -> Result<Json<PaymentListResponse>, ApiError> {
    let records = state
        .billing
        .payments
        .list_for_account(auth_user.account_id, 50)
        .await?;

    let payments = records
        .into_iter()
        .map(|r| PaymentInfo {
            id: r.id,
            amount_cents: r.amount_cents,
            currency: r.currency,
            status: r.status,
            payment_type: r.payment_type,
            credits_granted: r.credits_granted,
            created_at: r.created_at,
        })
        .collect();

    Ok(Json(PaymentListResponse { payments }))
}

/// Look up the receipt for a checkout session.
///
/// The frontend success page polls this until the webhook lands; 404 means
/// the checkout-completed event has not been reconciled yet.
pub async fn get_checkout_payment(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
    Path(session_id): Path<String>,
) -> Result<Json<PaymentInfo>, ApiError> {
    let record = state
        .billing
        .payments
        .find_by_checkout_session(&session_id)
        .await?
        .filter(|r| r.account_id == auth_user.account_id)
        .ok_or(ApiError::NotFound)?;

    Ok(Json(PaymentInfo {
        id: record.id,
        amount_cents: record.amount_cents,
        currency: record.currency,
        status: record.status,
        payment_type: record.payment_type,
        credits_granted: record.credits_granted,
        created_at: record.created_at,
    }))
}
