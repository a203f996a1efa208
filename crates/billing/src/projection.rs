//! Account/subscription projection.
//!
//! Pure read model over the fields the reconciler maintains: plan,
//! subscription status, billing period bounds. Consumed by entitlement
//! checks and profile endpoints; never written from here.

use serde::Serialize;
use sqlx::PgPool;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::{BillingError, BillingResult};
use crate::plans::{PlanId, SubscriptionStatus};

#[derive(Debug, Clone, Serialize)]
pub struct SubscriptionProjection {
    pub account_id: Uuid,
    pub plan_id: PlanId,
    pub subscription_status: SubscriptionStatus,
    pub current_period_start: Option<OffsetDateTime>,
    pub current_period_end: Option<OffsetDateTime>,
}

impl SubscriptionProjection {
    /// Entitlement check used by feature handlers.
    pub fn allows_priority_models(&self) -> bool {
        self.plan_id.allows_priority_models()
    }
}

pub struct ProjectionReader {
    pool: PgPool,
}

impl ProjectionReader {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn get(&self, account_id: Uuid) -> BillingResult<SubscriptionProjection> {
        let row: Option<(String, String, Option<OffsetDateTime>, Option<OffsetDateTime>)> =
            sqlx::query_as(
                r#"
                SELECT plan_id, subscription_status, current_period_start, current_period_end
                FROM accounts
                WHERE id = $1
                "#,
            )
            .bind(account_id)
            .fetch_optional(&self.pool)
            .await?;

        let (plan, status, period_start, period_end) =
            row.ok_or_else(|| BillingError::NotFound(format!("account {account_id}")))?;

        Ok(SubscriptionProjection {
            account_id,
            plan_id: PlanId::from_str(&plan).unwrap_or(PlanId::Free),
            subscription_status: SubscriptionStatus::from_provider(&status),
            current_period_start: period_start,
            current_period_end: period_end,
        })
    }
}
