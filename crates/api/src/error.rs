//! API error type and HTTP status mapping.
//!
//! Insufficient credits surfaces a specific, actionable message with a
//! 402. Transient store failures map to 503 so clients (and the provider's
//! webhook redelivery) retry. Everything else surfaces a generic failure
//! without leaking internal state; the detail is logged server-side.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;

use scribe_billing::BillingError;

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("authentication required")]
    Unauthorized,

    #[error("insufficient credits: required {required}, available {available}")]
    InsufficientCredits { required: i64, available: i64 },

    #[error("not found")]
    NotFound,

    #[error("invalid request: {0}")]
    BadRequest(String),

    #[error("invalid webhook signature")]
    SignatureInvalid,

    #[error("service temporarily unavailable")]
    Unavailable,

    #[error("internal error")]
    Internal,
}

impl From<BillingError> for ApiError {
    fn from(err: BillingError) -> Self {
        match err {
            BillingError::InsufficientCredits {
                required,
                available,
            } => ApiError::InsufficientCredits {
                required,
                available,
            },
            BillingError::NotFound(_) => ApiError::NotFound,
            BillingError::Invalid(msg) => ApiError::BadRequest(msg),
            BillingError::WebhookSignatureInvalid => ApiError::SignatureInvalid,
            BillingError::Unavailable(detail) => {
                tracing::warn!(detail = %detail, "Store unavailable");
                ApiError::Unavailable
            }
            // Duplicate correlation ids are handled as no-ops below the
            // API layer; one reaching here is a bug worth logging.
            BillingError::Conflict(detail) | BillingError::Database(detail) => {
                tracing::error!(detail = %detail, "Billing operation failed");
                ApiError::Internal
            }
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match &self {
            ApiError::Unauthorized => (StatusCode::UNAUTHORIZED, self.to_string()),
            ApiError::InsufficientCredits {
                required,
                available,
            } => (
                StatusCode::PAYMENT_REQUIRED,
                format!(
                    "Insufficient credits: this request costs {required} but your balance is {available}. \
                     Purchase credits or upgrade your plan to continue."
                ),
            ),
            ApiError::NotFound => (StatusCode::NOT_FOUND, self.to_string()),
            ApiError::BadRequest(_) => (StatusCode::BAD_REQUEST, self.to_string()),
            ApiError::SignatureInvalid => (StatusCode::BAD_REQUEST, self.to_string()),
            ApiError::Unavailable => (StatusCode::SERVICE_UNAVAILABLE, self.to_string()),
            ApiError::Internal => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "An internal error occurred".to_string(),
            ),
        };

        (status, Json(json!({ "error": message }))).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn insufficient_credits_maps_to_402() {
        let err: ApiError = BillingError::InsufficientCredits {
            required: 5,
            available: 1,
        }
        .into();
        assert!(matches!(
            err,
            ApiError::InsufficientCredits {
                required: 5,
                available: 1
            }
        ));
    }

    #[test]
    fn transient_failure_maps_to_unavailable() {
        let err: ApiError = BillingError::Unavailable("pool timed out".to_string()).into();
        assert!(matches!(err, ApiError::Unavailable));
    }

    #[test]
    fn internal_errors_do_not_leak_detail() {
        let err: ApiError = BillingError::Database("relation accounts broke".to_string()).into();
        assert_eq!(err.to_string(), "internal error");
    }
}
