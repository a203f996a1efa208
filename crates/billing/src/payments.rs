//! Payment records.
//!
//! A payment record is both a receipt and an idempotency fence: each
//! external correlation id (checkout session, payment intent, invoice) may
//! appear at most once. Handlers insert the record first and only apply
//! downstream effects (credit grants) when the insert actually landed.

use serde::{Deserialize, Serialize};
use sqlx::{PgConnection, PgPool};
use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::BillingResult;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PaymentStatus {
    Pending,
    Succeeded,
    Failed,
    Canceled,
    Refunded,
}

impl PaymentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PaymentStatus::Pending => "pending",
            PaymentStatus::Succeeded => "succeeded",
            PaymentStatus::Failed => "failed",
            PaymentStatus::Canceled => "canceled",
            PaymentStatus::Refunded => "refunded",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PaymentType {
    Subscription,
    Credits,
    OneTime,
}

impl PaymentType {
    pub fn as_str(&self) -> &'static str {
        match self {
            PaymentType::Subscription => "subscription",
            PaymentType::Credits => "credits",
            PaymentType::OneTime => "one_time",
        }
    }
}

/// Fields for a new payment record.
#[derive(Debug, Clone)]
pub struct NewPayment {
    pub account_id: Uuid,
    pub checkout_session_id: Option<String>,
    pub payment_intent_id: Option<String>,
    pub invoice_id: Option<String>,
    pub amount_cents: i64,
    pub currency: String,
    pub status: PaymentStatus,
    pub payment_type: PaymentType,
    pub credits_granted: i64,
    pub metadata: serde_json::Value,
}

/// Result of an idempotent insert attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertOutcome {
    /// The record was written; downstream effects may proceed.
    Inserted(Uuid),
    /// A correlation id already existed. Retried delivery — no-op.
    Duplicate,
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct PaymentRecord {
    pub id: Uuid,
    pub account_id: Uuid,
    pub checkout_session_id: Option<String>,
    pub payment_intent_id: Option<String>,
    pub invoice_id: Option<String>,
    pub amount_cents: i64,
    pub currency: String,
    pub status: String,
    pub payment_type: String,
    pub credits_granted: i64,
    pub created_at: OffsetDateTime,
}

/// Payment record storage.
pub struct PaymentService {
    pool: PgPool,
}

impl PaymentService {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Insert a payment record, treating any correlation-id collision as a
    /// duplicate delivery rather than an error.
    ///
    /// `ON CONFLICT DO NOTHING RETURNING id` makes the claim atomic: a row
    /// back means this call owns the insert and may apply downstream
    /// effects exactly once.
    pub async fn insert_in_tx(
        conn: &mut PgConnection,
        payment: &NewPayment,
    ) -> BillingResult<InsertOutcome> {
        let claimed: Option<(Uuid,)> = sqlx::query_as(
            r#"
            INSERT INTO payment_records
                (account_id, checkout_session_id, payment_intent_id, invoice_id,
                 amount_cents, currency, status, payment_type, credits_granted, metadata)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            ON CONFLICT DO NOTHING
            RETURNING id
            "#,
        )
        .bind(payment.account_id)
        .bind(payment.checkout_session_id.as_deref())
        .bind(payment.payment_intent_id.as_deref())
        .bind(payment.invoice_id.as_deref())
        .bind(payment.amount_cents)
        .bind(&payment.currency)
        .bind(payment.status.as_str())
        .bind(payment.payment_type.as_str())
        .bind(payment.credits_granted)
        .bind(&payment.metadata)
        .fetch_optional(&mut *conn)
        .await?;

        Ok(match claimed {
            Some((id,)) => InsertOutcome::Inserted(id),
            None => InsertOutcome::Duplicate,
        })
    }

    pub async fn insert(&self, payment: &NewPayment) -> BillingResult<InsertOutcome> {
        let mut tx = self.pool.begin().await?;
        let outcome = Self::insert_in_tx(&mut tx, payment).await?;
        tx.commit().await?;
        Ok(outcome)
    }

    /// Update the status of the record matching a payment-intent id.
    ///
    /// Returns the number of rows touched. Zero is legitimate: the intent
    /// event may race ahead of the checkout-completed event that creates
    /// the record, and the state converges when that event arrives.
    pub async fn set_status_by_intent_in_tx(
        conn: &mut PgConnection,
        payment_intent_id: &str,
        status: PaymentStatus,
    ) -> BillingResult<u64> {
        let result = sqlx::query(
            r#"
            UPDATE payment_records
            SET status = $1, updated_at = NOW()
            WHERE payment_intent_id = $2
            "#,
        )
        .bind(status.as_str())
        .bind(payment_intent_id)
        .execute(&mut *conn)
        .await?;

        Ok(result.rows_affected())
    }

    pub async fn find_by_checkout_session(
        &self,
        session_id: &str,
    ) -> BillingResult<Option<PaymentRecord>> {
        let record: Option<PaymentRecord> = sqlx::query_as(
            r#"
            SELECT id, account_id, checkout_session_id, payment_intent_id, invoice_id,
                   amount_cents, currency, status, payment_type, credits_granted, created_at
            FROM payment_records
            WHERE checkout_session_id = $1
            "#,
        )
        .bind(session_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(record)
    }

    /// Recent payments for an account, newest first.
    pub async fn list_for_account(
        &self,
        account_id: Uuid,
        limit: i64,
    ) -> BillingResult<Vec<PaymentRecord>> {
        let records: Vec<PaymentRecord> = sqlx::query_as(
            r#"
            SELECT id, account_id, checkout_session_id, payment_intent_id, invoice_id,
                   amount_cents, currency, status, payment_type, credits_granted, created_at
            FROM payment_records
            WHERE account_id = $1
            ORDER BY created_at DESC
            LIMIT $2
            "#,
        )
        .bind(account_id)
        .bind(limit.clamp(1, 100))
        .fetch_all(&self.pool)
        .await?;

        Ok(records)
    }
}
