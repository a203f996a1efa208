//! Ledger invariants.
//!
//! Runnable consistency checks for the credit system. Each invariant is a
//! real SQL query that only reads; violations carry enough context to
//! debug. The worker runs the full sweep on a schedule, and any of these
//! can be run after a webhook replay to confirm the system converged.

use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::BillingResult;

/// Result of running a single invariant check
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvariantViolation {
    /// Which invariant was violated
    pub invariant: String,
    /// Account(s) affected
    pub account_ids: Vec<Uuid>,
    /// Human-readable description of the violation
    pub description: String,
    /// Additional context for debugging
    pub context: serde_json::Value,
    /// Severity level
    pub severity: ViolationSeverity,
}

/// Severity of an invariant violation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ViolationSeverity {
    /// Critical - balances may be wrong
    Critical,
    /// High - data inconsistency that needs attention
    High,
    /// Medium - potential issue, should investigate
    Medium,
    /// Low - minor inconsistency, informational
    Low,
}

impl std::fmt::Display for ViolationSeverity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ViolationSeverity::Critical => write!(f, "CRITICAL"),
            ViolationSeverity::High => write!(f, "HIGH"),
            ViolationSeverity::Medium => write!(f, "MEDIUM"),
            ViolationSeverity::Low => write!(f, "LOW"),
        }
    }
}

/// Summary of all invariant checks
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvariantCheckSummary {
    pub checked_at: OffsetDateTime,
    pub checks_run: usize,
    pub checks_passed: usize,
    pub checks_failed: usize,
    pub violations: Vec<InvariantViolation>,
    pub healthy: bool,
}

#[derive(Debug, sqlx::FromRow)]
struct BalanceDriftRow {
    account_id: Uuid,
    credit_balance: i64,
    ledger_sum: i64,
}

#[derive(Debug, sqlx::FromRow)]
struct BrokenChainRow {
    account_id: Uuid,
    seq: i64,
    amount: i64,
    resulting_balance: i64,
    prior_balance: Option<i64>,
}

#[derive(Debug, sqlx::FromRow)]
struct PlanMismatchRow {
    account_id: Uuid,
    account_plan: String,
    mirror_plan: String,
    provider_subscription_id: String,
}

#[derive(Debug, sqlx::FromRow)]
struct UnledgeredPurchaseRow {
    account_id: Uuid,
    checkout_session_id: String,
    credits_granted: i64,
}

#[derive(Debug, sqlx::FromRow)]
struct CanceledNotFreeRow {
    account_id: Uuid,
    plan_id: String,
}

/// Service for running ledger invariant checks
pub struct InvariantChecker {
    pool: PgPool,
}

impl InvariantChecker {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Run all invariant checks and return summary
    pub async fn run_all_checks(&self) -> BillingResult<InvariantCheckSummary> {
        let now = OffsetDateTime::now_utc();
        let mut violations = Vec::new();

        violations.extend(self.check_balance_matches_ledger().await?);
        violations.extend(self.check_entry_chain_consistent().await?);
        violations.extend(self.check_plan_matches_mirror().await?);
        violations.extend(self.check_credit_purchases_ledgered().await?);
        violations.extend(self.check_canceled_accounts_on_free().await?);

        let checks_run = 5;
        let checks_failed = violations
            .iter()
            .map(|v| &v.invariant)
            .collect::<std::collections::HashSet<_>>()
            .len();
        let checks_passed = checks_run - checks_failed;

        Ok(InvariantCheckSummary {
            checked_at: now,
            checks_run,
            checks_passed,
            checks_failed,
            healthy: violations.is_empty(),
            violations,
        })
    }

    /// Invariant 1: The denormalized balance equals the ledger sum.
    ///
    /// Every balance change writes an entry in the same transaction, so
    /// any drift here means a write path bypassed the ledger.
    async fn check_balance_matches_ledger(&self) -> BillingResult<Vec<InvariantViolation>> {
        let rows: Vec<BalanceDriftRow> = sqlx::query_as(
            r#"
            SELECT
                a.id as account_id,
                a.credit_balance,
                COALESCE(SUM(l.amount), 0) as ledger_sum
            FROM accounts a
            LEFT JOIN ledger_entries l ON l.account_id = a.id
            GROUP BY a.id, a.credit_balance
            HAVING a.credit_balance != COALESCE(SUM(l.amount), 0)
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| InvariantViolation {
                invariant: "balance_matches_ledger".to_string(),
                account_ids: vec![row.account_id],
                description: format!(
                    "Account balance {} does not equal ledger sum {}",
                    row.credit_balance, row.ledger_sum
                ),
                context: serde_json::json!({
                    "credit_balance": row.credit_balance,
                    "ledger_sum": row.ledger_sum,
                    "drift": row.credit_balance - row.ledger_sum,
                }),
                severity: ViolationSeverity::Critical,
            })
            .collect())
    }

    /// Invariant 2: Each entry's resulting_balance equals the previous
    /// entry's resulting_balance plus its amount (first entry: equals its
    /// amount). A break means entries were applied without the account
    /// row lock.
    async fn check_entry_chain_consistent(&self) -> BillingResult<Vec<InvariantViolation>> {
        let rows: Vec<BrokenChainRow> = sqlx::query_as(
            r#"
            SELECT account_id, seq, amount, resulting_balance, prior_balance
            FROM (
                SELECT
                    account_id, seq, amount, resulting_balance,
                    LAG(resulting_balance) OVER (
                        PARTITION BY account_id ORDER BY seq
                    ) as prior_balance
                FROM ledger_entries
            ) chain
            WHERE resulting_balance != COALESCE(prior_balance, 0) + amount
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| InvariantViolation {
                invariant: "entry_chain_consistent".to_string(),
                account_ids: vec![row.account_id],
                description: format!(
                    "Ledger entry seq {} breaks the balance chain: {} != {} + {}",
                    row.seq,
                    row.resulting_balance,
                    row.prior_balance.unwrap_or(0),
                    row.amount
                ),
                context: serde_json::json!({
                    "seq": row.seq,
                    "amount": row.amount,
                    "resulting_balance": row.resulting_balance,
                    "prior_balance": row.prior_balance,
                }),
                severity: ViolationSeverity::Critical,
            })
            .collect())
    }

    /// Invariant 3: Account plan matches its active subscription mirror.
    async fn check_plan_matches_mirror(&self) -> BillingResult<Vec<InvariantViolation>> {
        let rows: Vec<PlanMismatchRow> = sqlx::query_as(
            r#"
            SELECT
                a.id as account_id,
                a.plan_id as account_plan,
                m.plan_id as mirror_plan,
                m.provider_subscription_id
            FROM accounts a
            JOIN subscription_mirror m ON m.account_id = a.id
            WHERE m.status IN ('active', 'trialing', 'past_due')
              AND a.plan_id != m.plan_id
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| InvariantViolation {
                invariant: "plan_matches_mirror".to_string(),
                account_ids: vec![row.account_id],
                description: format!(
                    "Account plan '{}' does not match active mirror plan '{}'",
                    row.account_plan, row.mirror_plan
                ),
                context: serde_json::json!({
                    "account_plan": row.account_plan,
                    "mirror_plan": row.mirror_plan,
                    "provider_subscription_id": row.provider_subscription_id,
                }),
                severity: ViolationSeverity::High,
            })
            .collect())
    }

    /// Invariant 4: Every succeeded credit purchase has its ledger entry.
    ///
    /// The grant is gated on the payment-record insert, so a missing
    /// entry means the gate fired without the grant landing.
    async fn check_credit_purchases_ledgered(&self) -> BillingResult<Vec<InvariantViolation>> {
        let rows: Vec<UnledgeredPurchaseRow> = sqlx::query_as(
            r#"
            SELECT
                p.account_id,
                p.checkout_session_id,
                p.credits_granted
            FROM payment_records p
            WHERE p.payment_type = 'credits'
              AND p.status = 'succeeded'
              AND p.credits_granted > 0
              AND p.checkout_session_id IS NOT NULL
              AND NOT EXISTS (
                  SELECT 1 FROM ledger_entries l
                  WHERE l.account_id = p.account_id
                    AND l.source = 'purchase'
                    AND l.source_ref = p.checkout_session_id
              )
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| InvariantViolation {
                invariant: "credit_purchases_ledgered".to_string(),
                account_ids: vec![row.account_id],
                description: format!(
                    "Succeeded purchase of {} credits (session '{}') has no ledger entry",
                    row.credits_granted, row.checkout_session_id
                ),
                context: serde_json::json!({
                    "checkout_session_id": row.checkout_session_id,
                    "credits_granted": row.credits_granted,
                }),
                severity: ViolationSeverity::High,
            })
            .collect())
    }

    /// Invariant 5: A canceled subscription leaves the account on the
    /// free plan.
    async fn check_canceled_accounts_on_free(&self) -> BillingResult<Vec<InvariantViolation>> {
        let rows: Vec<CanceledNotFreeRow> = sqlx::query_as(
            r#"
            SELECT a.id as account_id, a.plan_id
            FROM accounts a
            WHERE a.subscription_status = 'canceled'
              AND a.plan_id != 'free'
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| InvariantViolation {
                invariant: "canceled_accounts_on_free".to_string(),
                account_ids: vec![row.account_id],
                description: format!(
                    "Canceled subscription but account still on plan '{}'",
                    row.plan_id
                ),
                context: serde_json::json!({
                    "plan_id": row.plan_id,
                }),
                severity: ViolationSeverity::High,
            })
            .collect())
    }

    /// Run a single invariant check by name
    pub async fn run_check(&self, name: &str) -> BillingResult<Vec<InvariantViolation>> {
        match name {
            "balance_matches_ledger" => self.check_balance_matches_ledger().await,
            "entry_chain_consistent" => self.check_entry_chain_consistent().await,
            "plan_matches_mirror" => self.check_plan_matches_mirror().await,
            "credit_purchases_ledgered" => self.check_credit_purchases_ledgered().await,
            "canceled_accounts_on_free" => self.check_canceled_accounts_on_free().await,
            _ => Ok(vec![]),
        }
    }

    /// Get list of all available invariant checks
    pub fn available_checks() -> Vec<&'static str> {
        vec![
            "balance_matches_ledger",
            "entry_chain_consistent",
            "plan_matches_mirror",
            "credit_purchases_ledgered",
            "canceled_accounts_on_free",
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_violation_severity_display() {
        assert_eq!(ViolationSeverity::Critical.to_string(), "CRITICAL");
        assert_eq!(ViolationSeverity::High.to_string(), "HIGH");
        assert_eq!(ViolationSeverity::Medium.to_string(), "MEDIUM");
        assert_eq!(ViolationSeverity::Low.to_string(), "LOW");
    }

    #[test]
    fn test_available_checks() {
        let checks = InvariantChecker::available_checks();
        assert_eq!(checks.len(), 5);
        assert!(checks.contains(&"balance_matches_ledger"));
        assert!(checks.contains(&"entry_chain_consistent"));
    }
}
