//! Account lifecycle and lookup.
//!
//! Accounts are created at registration with the free-tier signup grant,
//! mutated by the accounting service (balance) and the reconciler
//! (plan/subscription fields), and never deleted — only anonymized.

use sqlx::PgPool;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::{BillingError, BillingResult};
use crate::ledger::{self, LedgerEntryKind, LedgerSource};
use crate::plans::{PlanId, SubscriptionStatus};

/// The billing/credit identity of one user.
#[derive(Debug, Clone)]
pub struct Account {
    pub id: Uuid,
    pub email: Option<String>,
    pub credit_balance: i64,
    pub plan_id: PlanId,
    pub provider_customer_id: Option<String>,
    pub provider_subscription_id: Option<String>,
    pub subscription_status: SubscriptionStatus,
    pub current_period_start: Option<OffsetDateTime>,
    pub current_period_end: Option<OffsetDateTime>,
    pub created_at: OffsetDateTime,
}

#[derive(Debug, sqlx::FromRow)]
struct AccountRow {
    id: Uuid,
    email: Option<String>,
    credit_balance: i64,
    plan_id: String,
    provider_customer_id: Option<String>,
    provider_subscription_id: Option<String>,
    subscription_status: String,
    current_period_start: Option<OffsetDateTime>,
    current_period_end: Option<OffsetDateTime>,
    created_at: OffsetDateTime,
}

impl From<AccountRow> for Account {
    fn from(row: AccountRow) -> Self {
        Account {
            id: row.id,
            email: row.email,
            credit_balance: row.credit_balance,
            plan_id: PlanId::from_str(&row.plan_id).unwrap_or(PlanId::Free),
            provider_customer_id: row.provider_customer_id,
            provider_subscription_id: row.provider_subscription_id,
            subscription_status: SubscriptionStatus::from_provider(&row.subscription_status),
            current_period_start: row.current_period_start,
            current_period_end: row.current_period_end,
            created_at: row.created_at,
        }
    }
}

const SELECT_ACCOUNT: &str = r#"
    SELECT id, email, credit_balance, plan_id, provider_customer_id,
           provider_subscription_id, subscription_status,
           current_period_start, current_period_end, created_at
    FROM accounts
"#;

/// Account store and lifecycle operations.
pub struct AccountService {
    pool: PgPool,
}

impl AccountService {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Create an account with the free-tier signup allowance.
    ///
    /// The initial balance and its `earned` entry are written in one
    /// transaction so even the signup grant is auditable.
    pub async fn create_account(&self, email: &str) -> BillingResult<Account> {
        let account_id = Uuid::new_v4();
        let signup_grant = PlanId::Free.monthly_allowance();

        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r#"
            INSERT INTO accounts (id, email, credit_balance, plan_id, subscription_status)
            VALUES ($1, $2, $3, 'free', 'none')
            "#,
        )
        .bind(account_id)
        .bind(email)
        .bind(signup_grant)
        .execute(&mut *tx)
        .await?;

        ledger::append_entry(
            &mut tx,
            account_id,
            LedgerEntryKind::Earned,
            signup_grant,
            signup_grant,
            LedgerSource::Subscription,
            None,
            "Free plan signup grant",
        )
        .await?;

        tx.commit().await?;

        tracing::info!(
            account_id = %account_id,
            signup_grant = signup_grant,
            "Account created with signup grant"
        );

        self.get(account_id).await
    }

    pub async fn get(&self, account_id: Uuid) -> BillingResult<Account> {
        let row: Option<AccountRow> = sqlx::query_as(&format!("{SELECT_ACCOUNT} WHERE id = $1"))
            .bind(account_id)
            .fetch_optional(&self.pool)
            .await?;

        row.map(Account::from)
            .ok_or_else(|| BillingError::NotFound(format!("account {account_id}")))
    }

    /// Resolve an account from the provider's customer id. Returns `None`
    /// when no account carries that correlation — the caller decides
    /// whether that drops an event or is an error.
    pub async fn find_by_customer_id(&self, customer_id: &str) -> BillingResult<Option<Account>> {
        let row: Option<AccountRow> =
            sqlx::query_as(&format!("{SELECT_ACCOUNT} WHERE provider_customer_id = $1"))
                .bind(customer_id)
                .fetch_optional(&self.pool)
                .await?;

        Ok(row.map(Account::from))
    }

    /// Attach the provider customer id after the first checkout resolves
    /// the account by metadata.
    pub async fn link_customer_id(
        &self,
        account_id: Uuid,
        customer_id: &str,
    ) -> BillingResult<()> {
        let result = sqlx::query(
            r#"
            UPDATE accounts
            SET provider_customer_id = $1, updated_at = NOW()
            WHERE id = $2 AND (provider_customer_id IS NULL OR provider_customer_id = $1)
            "#,
        )
        .bind(customer_id)
        .bind(account_id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            tracing::warn!(
                account_id = %account_id,
                customer_id = %customer_id,
                "Account already linked to a different provider customer id"
            );
        }
        Ok(())
    }

    /// Strip PII while preserving the ledger. Accounts are never deleted;
    /// the audit trail must stay intact.
    pub async fn anonymize(&self, account_id: Uuid) -> BillingResult<()> {
        let result = sqlx::query(
            r#"
            UPDATE accounts
            SET email = NULL, anonymized_at = NOW(), updated_at = NOW()
            WHERE id = $1 AND anonymized_at IS NULL
            "#,
        )
        .bind(account_id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(BillingError::NotFound(format!(
                "account {account_id} (or already anonymized)"
            )));
        }

        tracing::info!(account_id = %account_id, "Account anonymized");
        Ok(())
    }
}
