//! Append-only credit ledger.
//!
//! Every change to an account's balance writes exactly one entry here, in
//! the same transaction as the balance update. Entries are immutable once
//! written; `seq` gives each account's trail a strict order and
//! `resulting_balance` snapshots the balance immediately after the entry's
//! amount was applied.

use serde::{Deserialize, Serialize};
use sqlx::PgConnection;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::{BillingError, BillingResult};

/// Direction/category of a ledger entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LedgerEntryKind {
    Earned,
    Spent,
    Refunded,
    Expired,
}

impl LedgerEntryKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            LedgerEntryKind::Earned => "earned",
            LedgerEntryKind::Spent => "spent",
            LedgerEntryKind::Refunded => "refunded",
            LedgerEntryKind::Expired => "expired",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "earned" => Some(LedgerEntryKind::Earned),
            "spent" => Some(LedgerEntryKind::Spent),
            "refunded" => Some(LedgerEntryKind::Refunded),
            "expired" => Some(LedgerEntryKind::Expired),
            _ => None,
        }
    }
}

/// What caused a ledger entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LedgerSource {
    ApiUsage,
    Purchase,
    Subscription,
    SubscriptionRenewal,
    SubscriptionUpdated,
}

impl LedgerSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            LedgerSource::ApiUsage => "api_usage",
            LedgerSource::Purchase => "purchase",
            LedgerSource::Subscription => "subscription",
            LedgerSource::SubscriptionRenewal => "subscription_renewal",
            LedgerSource::SubscriptionUpdated => "subscription_updated",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "api_usage" => Some(LedgerSource::ApiUsage),
            "purchase" => Some(LedgerSource::Purchase),
            "subscription" => Some(LedgerSource::Subscription),
            "subscription_renewal" => Some(LedgerSource::SubscriptionRenewal),
            "subscription_updated" => Some(LedgerSource::SubscriptionUpdated),
            _ => None,
        }
    }
}

/// One immutable, signed balance-affecting record.
#[derive(Debug, Clone, Serialize)]
pub struct LedgerEntry {
    pub id: Uuid,
    pub seq: i64,
    pub account_id: Uuid,
    pub kind: LedgerEntryKind,
    pub amount: i64,
    pub resulting_balance: i64,
    pub source: LedgerSource,
    pub source_ref: Option<String>,
    pub description: String,
    pub created_at: OffsetDateTime,
}

#[derive(Debug, sqlx::FromRow)]
struct LedgerEntryRow {
    id: Uuid,
    seq: i64,
    account_id: Uuid,
    kind: String,
    amount: i64,
    resulting_balance: i64,
    source: String,
    source_ref: Option<String>,
    description: String,
    created_at: OffsetDateTime,
}

impl TryFrom<LedgerEntryRow> for LedgerEntry {
    type Error = BillingError;

    fn try_from(row: LedgerEntryRow) -> Result<Self, Self::Error> {
        let kind = LedgerEntryKind::from_str(&row.kind)
            .ok_or_else(|| BillingError::Database(format!("unknown ledger kind '{}'", row.kind)))?;
        let source = LedgerSource::from_str(&row.source).ok_or_else(|| {
            BillingError::Database(format!("unknown ledger source '{}'", row.source))
        })?;
        Ok(LedgerEntry {
            id: row.id,
            seq: row.seq,
            account_id: row.account_id,
            kind,
            amount: row.amount,
            resulting_balance: row.resulting_balance,
            source,
            source_ref: row.source_ref,
            description: row.description,
            created_at: row.created_at,
        })
    }
}

/// Append one entry inside the caller's transaction.
///
/// The caller must hold the account row lock and must have already applied
/// `amount` to the balance, so `resulting_balance` is the post-entry value.
pub async fn append_entry(
    conn: &mut PgConnection,
    account_id: Uuid,
    kind: LedgerEntryKind,
    amount: i64,
    resulting_balance: i64,
    source: LedgerSource,
    source_ref: Option<&str>,
    description: &str,
) -> BillingResult<Uuid> {
    let entry_id = Uuid::new_v4();

    sqlx::query(
        r#"
        INSERT INTO ledger_entries
            (id, account_id, kind, amount, resulting_balance, source, source_ref, description)
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
        "#,
    )
    .bind(entry_id)
    .bind(account_id)
    .bind(kind.as_str())
    .bind(amount)
    .bind(resulting_balance)
    .bind(source.as_str())
    .bind(source_ref)
    .bind(description)
    .execute(&mut *conn)
    .await?;

    Ok(entry_id)
}

/// Read access to an account's audit trail.
pub struct LedgerHistory {
    pool: sqlx::PgPool,
}

impl LedgerHistory {
    pub fn new(pool: sqlx::PgPool) -> Self {
        Self { pool }
    }

    /// Most recent entries first.
    pub async fn list_entries(
        &self,
        account_id: Uuid,
        limit: i64,
        offset: i64,
    ) -> BillingResult<Vec<LedgerEntry>> {
        let rows: Vec<LedgerEntryRow> = sqlx::query_as(
            r#"
            SELECT id, seq, account_id, kind, amount, resulting_balance,
                   source, source_ref, description, created_at
            FROM ledger_entries
            WHERE account_id = $1
            ORDER BY seq DESC
            LIMIT $2 OFFSET $3
            "#,
        )
        .bind(account_id)
        .bind(limit.clamp(1, 200))
        .bind(offset.max(0))
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(LedgerEntry::try_from).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_round_trips_through_str() {
        for kind in [
            LedgerEntryKind::Earned,
            LedgerEntryKind::Spent,
            LedgerEntryKind::Refunded,
            LedgerEntryKind::Expired,
        ] {
            assert_eq!(LedgerEntryKind::from_str(kind.as_str()), Some(kind));
        }
        assert_eq!(LedgerEntryKind::from_str("granted"), None);
    }

    #[test]
    fn source_round_trips_through_str() {
        for source in [
            LedgerSource::ApiUsage,
            LedgerSource::Purchase,
            LedgerSource::Subscription,
            LedgerSource::SubscriptionRenewal,
            LedgerSource::SubscriptionUpdated,
        ] {
            assert_eq!(LedgerSource::from_str(source.as_str()), Some(source));
        }
    }
}
