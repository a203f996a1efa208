//! Credit accounting operations.
//!
//! Every mutating operation here runs as one transaction spanning
//! read-validate-write-append: the account row is locked with
//! `SELECT ... FOR UPDATE`, the balance is re-read under that lock, the new
//! balance is written, and the ledger entry is appended before commit. The
//! store's transactional isolation is the only concurrency control — two
//! concurrent debits against the same account serialize on the row lock,
//! and the second observes the first's write.

use sqlx::{PgConnection, PgPool};
use uuid::Uuid;

use scribe_shared::RequestContext;

use crate::error::{BillingError, BillingResult};
use crate::ledger::{self, LedgerEntryKind, LedgerSource};

/// Signed amount a reset must apply to land exactly on `allowance`.
pub(crate) fn reset_delta(prior_balance: i64, allowance: i64) -> i64 {
    allowance - prior_balance
}

fn validate_amount(amount: i64) -> BillingResult<()> {
    if amount <= 0 {
        return Err(BillingError::Invalid(format!(
            "amount must be positive, got {amount}"
        )));
    }
    Ok(())
}

/// Re-read the balance under the account row lock. Serializes all balance
/// mutations for the account until the enclosing transaction ends.
async fn lock_balance(conn: &mut PgConnection, account_id: Uuid) -> BillingResult<i64> {
    let row: Option<(i64,)> =
        sqlx::query_as("SELECT credit_balance FROM accounts WHERE id = $1 FOR UPDATE")
            .bind(account_id)
            .fetch_optional(&mut *conn)
            .await?;

    row.map(|(balance,)| balance)
        .ok_or_else(|| BillingError::NotFound(format!("account {account_id}")))
}

async fn write_balance(
    conn: &mut PgConnection,
    account_id: Uuid,
    new_balance: i64,
) -> BillingResult<()> {
    sqlx::query("UPDATE accounts SET credit_balance = $1, updated_at = NOW() WHERE id = $2")
        .bind(new_balance)
        .bind(account_id)
        .execute(&mut *conn)
        .await?;
    Ok(())
}

/// Credit accounting service.
pub struct CreditAccounting {
    pool: PgPool,
}

impl CreditAccounting {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Advisory admission check: true iff the current balance covers
    /// `required`. Never mutates, never locks — the authoritative check
    /// happens inside `debit`'s own transaction.
    pub async fn check_balance(&self, account_id: Uuid, required: i64) -> BillingResult<bool> {
        let row: Option<(i64,)> =
            sqlx::query_as("SELECT credit_balance FROM accounts WHERE id = $1")
                .bind(account_id)
                .fetch_optional(&self.pool)
                .await?;

        let balance = row
            .map(|(b,)| b)
            .ok_or_else(|| BillingError::NotFound(format!("account {account_id}")))?;

        Ok(balance >= required)
    }

    /// Deduct credits for a completed costed operation.
    ///
    /// The insufficiency check runs under the same row lock as the write,
    /// closing the race between an admission-time `check_balance` and this
    /// call. Writes the `spent` ledger entry and a usage record, returns
    /// the new balance.
    pub async fn debit(
        &self,
        account_id: Uuid,
        amount: i64,
        endpoint: &str,
        ctx: &RequestContext,
    ) -> BillingResult<i64> {
        validate_amount(amount)?;

        let mut tx = self.pool.begin().await?;

        let balance = lock_balance(&mut tx, account_id).await?;
        if balance < amount {
            // Rolls back via drop; the caller has not been charged.
            return Err(BillingError::InsufficientCredits {
                required: amount,
                available: balance,
            });
        }

        let new_balance = balance - amount;
        write_balance(&mut tx, account_id, new_balance).await?;

        ledger::append_entry(
            &mut tx,
            account_id,
            LedgerEntryKind::Spent,
            -amount,
            new_balance,
            LedgerSource::ApiUsage,
            Some(&ctx.request_id),
            &format!("Usage: {endpoint}"),
        )
        .await?;

        sqlx::query(
            r#"
            INSERT INTO usage_records (account_id, endpoint, credits_spent, request_id)
            VALUES ($1, $2, $3, $4)
            "#,
        )
        .bind(account_id)
        .bind(endpoint)
        .bind(amount)
        .bind(&ctx.request_id)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;

        tracing::info!(
            account_id = %account_id,
            endpoint = %endpoint,
            amount = amount,
            new_balance = new_balance,
            request_id = %ctx.request_id,
            "Credits debited"
        );

        Ok(new_balance)
    }

    /// Grant credits (purchase or entitlement grant).
    ///
    /// Not self-deduplicating: idempotency comes from the caller fencing
    /// `source_ref` first (the reconciler inserts the payment record under
    /// its unique constraint before calling this).
    pub async fn credit(
        &self,
        account_id: Uuid,
        amount: i64,
        source: LedgerSource,
        source_ref: Option<&str>,
        description: &str,
    ) -> BillingResult<i64> {
        let mut tx = self.pool.begin().await?;
        let new_balance =
            Self::credit_in_tx(&mut tx, account_id, amount, source, source_ref, description)
                .await?;
        tx.commit().await?;
        Ok(new_balance)
    }

    /// Transaction-scoped form of `credit`, for composition into the
    /// reconciler's single per-event transaction.
    pub async fn credit_in_tx(
        conn: &mut PgConnection,
        account_id: Uuid,
        amount: i64,
        source: LedgerSource,
        source_ref: Option<&str>,
        description: &str,
    ) -> BillingResult<i64> {
        validate_amount(amount)?;

        let balance = lock_balance(conn, account_id).await?;
        let new_balance = balance + amount;
        write_balance(conn, account_id, new_balance).await?;

        ledger::append_entry(
            conn,
            account_id,
            LedgerEntryKind::Earned,
            amount,
            new_balance,
            source,
            source_ref,
            description,
        )
        .await?;

        tracing::info!(
            account_id = %account_id,
            amount = amount,
            new_balance = new_balance,
            source = source.as_str(),
            source_ref = ?source_ref,
            "Credits granted"
        );

        Ok(new_balance)
    }

    /// Return credits after a costed operation was rolled back post-debit.
    pub async fn refund(
        &self,
        account_id: Uuid,
        amount: i64,
        source_ref: Option<&str>,
        description: &str,
    ) -> BillingResult<i64> {
        validate_amount(amount)?;

        let mut tx = self.pool.begin().await?;

        let balance = lock_balance(&mut tx, account_id).await?;
        let new_balance = balance + amount;
        write_balance(&mut tx, account_id, new_balance).await?;

        ledger::append_entry(
            &mut tx,
            account_id,
            LedgerEntryKind::Refunded,
            amount,
            new_balance,
            LedgerSource::ApiUsage,
            source_ref,
            description,
        )
        .await?;

        tx.commit().await?;

        tracing::info!(
            account_id = %account_id,
            amount = amount,
            new_balance = new_balance,
            "Credits refunded"
        );

        Ok(new_balance)
    }

    /// Set the balance to exactly `allowance` (not additive), once per
    /// billing period on renewal.
    ///
    /// The ledger entry's amount is the signed delta from the prior
    /// balance, so the audit trail stays additive even though the
    /// operation is a reset.
    pub async fn reset_to_plan_allowance(
        &self,
        account_id: Uuid,
        allowance: i64,
        reason: &str,
    ) -> BillingResult<i64> {
        let mut tx = self.pool.begin().await?;
        let new_balance = Self::reset_in_tx(&mut tx, account_id, allowance, reason).await?;
        tx.commit().await?;
        Ok(new_balance)
    }

    /// Transaction-scoped form of `reset_to_plan_allowance`.
    pub async fn reset_in_tx(
        conn: &mut PgConnection,
        account_id: Uuid,
        allowance: i64,
        reason: &str,
    ) -> BillingResult<i64> {
        if allowance < 0 {
            return Err(BillingError::Invalid(format!(
                "allowance must be non-negative, got {allowance}"
            )));
        }

        let balance = lock_balance(conn, account_id).await?;
        let delta = reset_delta(balance, allowance);

        // A renewal that lands on the current balance still gets an audit
        // entry so each period's reset is visible in the trail.
        write_balance(conn, account_id, allowance).await?;

        ledger::append_entry(
            conn,
            account_id,
            LedgerEntryKind::Earned,
            delta,
            allowance,
            LedgerSource::SubscriptionRenewal,
            None,
            reason,
        )
        .await?;

        tracing::info!(
            account_id = %account_id,
            prior_balance = balance,
            allowance = allowance,
            delta = delta,
            reason = %reason,
            "Balance reset to plan allowance"
        );

        Ok(allowance)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reset_delta_is_signed() {
        assert_eq!(reset_delta(30, 150), 120);
        assert_eq!(reset_delta(200, 150), -50);
        assert_eq!(reset_delta(150, 150), 0);
        assert_eq!(reset_delta(0, 150), 150);
    }

    #[test]
    fn zero_and_negative_amounts_rejected() {
        assert!(matches!(validate_amount(0), Err(BillingError::Invalid(_))));
        assert!(matches!(validate_amount(-3), Err(BillingError::Invalid(_))));
        assert!(validate_amount(1).is_ok());
    }
}
