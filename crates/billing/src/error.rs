//! Billing error taxonomy.
//!
//! Business-rule errors (`InsufficientCredits`) propagate to the caller for
//! user-visible handling. Infrastructure errors (`Unavailable`) propagate so
//! the outer HTTP layer can return a retryable status. `Conflict` marks a
//! duplicate external correlation id and is handled as a no-op by the
//! reconciler rather than surfaced.

use thiserror::Error;

/// Result type for billing operations
pub type BillingResult<T> = Result<T, BillingError>;

#[derive(Debug, Error)]
pub enum BillingError {
    /// The account's balance cannot cover the requested debit. User-facing
    /// and retryable by the user after topping up.
    #[error("insufficient credits: required {required}, available {available}")]
    InsufficientCredits { required: i64, available: i64 },

    /// A unique external correlation id was inserted twice. Expected under
    /// at-least-once webhook delivery.
    #[error("duplicate correlation id: {0}")]
    Conflict(String),

    /// Account or subscription could not be resolved.
    #[error("not found: {0}")]
    NotFound(String),

    /// Transient store failure (pool exhaustion, connection loss, statement
    /// timeout). Callers retry with backoff; the webhook path rejects the
    /// event so the provider redelivers it.
    #[error("temporarily unavailable: {0}")]
    Unavailable(String),

    /// Malformed input or event payload.
    #[error("invalid: {0}")]
    Invalid(String),

    /// Webhook signature header failed verification.
    #[error("webhook signature verification failed")]
    WebhookSignatureInvalid,

    /// Non-transient database error.
    #[error("database error: {0}")]
    Database(String),
}

impl BillingError {
    /// True when the error is a duplicate-correlation conflict, which
    /// idempotent handlers treat as "already applied".
    pub fn is_conflict(&self) -> bool {
        matches!(self, BillingError::Conflict(_))
    }

    /// True when a retry may succeed (transient infrastructure failure).
    pub fn is_transient(&self) -> bool {
        matches!(self, BillingError::Unavailable(_))
    }
}

impl From<sqlx::Error> for BillingError {
    fn from(err: sqlx::Error) -> Self {
        match &err {
            sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed | sqlx::Error::Io(_) => {
                BillingError::Unavailable(err.to_string())
            }
            sqlx::Error::RowNotFound => BillingError::NotFound(err.to_string()),
            sqlx::Error::Database(db) if db.is_unique_violation() => {
                BillingError::Conflict(db.message().to_string())
            }
            _ => BillingError::Database(err.to_string()),
        }
    }
}
