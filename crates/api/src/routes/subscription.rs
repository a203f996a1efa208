//! Subscription projection route.

use axum::{
    extract::{Extension, State},
    Json,
};
use serde::Serialize;

use crate::{auth::AuthUser, error::ApiError, state::AppState};

/// Subscription info response
#[derive(Debug, Serialize)]
pub struct SubscriptionInfo {
    pub plan_id: String,
    pub subscription_status: String,
    pub current_period_start: Option<String>,
    pub current_period_end: Option<String>,
    pub allows_priority_models: bool,
}

/// Current plan, status, and billing period for the authenticated account
pub async fn get_subscription(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
) -> Result<Json<SubscriptionInfo>, ApiError> {
    let projection = state.billing.projection.get(auth_user.account_id).await?;

    Ok(Json(SubscriptionInfo {
        plan_id: projection.plan_id.to_string(),
        subscription_status: projection.subscription_status.to_string(),
        current_period_start: projection.current_period_start.map(|t| t.to_string()),
        current_period_end: projection.current_period_end.map(|t| t.to_string()),
        allows_priority_models: projection.allows_priority_models(),
    }))
}
