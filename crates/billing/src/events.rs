//! Provider event model.
//!
//! Webhook payloads arrive as open JSON. They are mapped here, at the
//! boundary, into a closed tagged enum — one variant per handled lifecycle
//! event plus an `Unknown` catch-all — so the reconciler's state machine is
//! exhaustive and testable. Nothing downstream of this module touches raw
//! payload JSON.

use std::collections::HashMap;

use serde::Deserialize;
use time::OffsetDateTime;

use crate::error::{BillingError, BillingResult};
use crate::plans::SubscriptionStatus;

/// A verified provider event with its envelope identity.
#[derive(Debug, Clone)]
pub struct EventEnvelope {
    /// Provider-assigned event id: the reconciler's idempotency key.
    pub event_id: String,
    /// Raw event type string, kept for logging and the fence record.
    pub event_type: String,
    pub created: OffsetDateTime,
    pub event: ProviderEvent,
}

/// Closed set of billing lifecycle events the reconciler handles.
#[derive(Debug, Clone)]
pub enum ProviderEvent {
    CheckoutCompleted(CheckoutSession),
    SubscriptionCreated(SubscriptionState),
    SubscriptionUpdated(SubscriptionState),
    SubscriptionDeleted(SubscriptionState),
    InvoicePaymentSucceeded(InvoiceState),
    InvoicePaymentFailed(InvoiceState),
    PaymentIntentSucceeded(PaymentIntentState),
    PaymentIntentFailed(PaymentIntentState),
    ChargeRefunded(PaymentIntentState),
    /// Anything else: logged and ignored, never an error.
    Unknown,
}

#[derive(Debug, Clone)]
pub struct CheckoutSession {
    pub session_id: String,
    pub customer_id: Option<String>,
    pub payment_intent_id: Option<String>,
    pub amount_total_cents: i64,
    pub currency: String,
    pub metadata: HashMap<String, String>,
}

impl CheckoutSession {
    /// Account correlation carried in checkout metadata. Absent means the
    /// event cannot be processed and is dropped with a warning.
    pub fn account_id(&self) -> Option<uuid::Uuid> {
        self.metadata
            .get("account_id")
            .and_then(|s| uuid::Uuid::parse_str(s).ok())
    }

    /// True when this checkout bought a one-off credit package.
    pub fn is_credit_purchase(&self) -> bool {
        self.metadata.get("checkout_type").map(String::as_str) == Some("credits")
    }

    /// Credits purchased, from checkout metadata.
    pub fn credits(&self) -> i64 {
        self.metadata
            .get("credits")
            .and_then(|s| s.parse().ok())
            .unwrap_or(0)
    }
}

#[derive(Debug, Clone)]
pub struct SubscriptionState {
    pub subscription_id: String,
    pub customer_id: Option<String>,
    pub status: SubscriptionStatus,
    pub price_id: Option<String>,
    pub current_period_start: Option<OffsetDateTime>,
    pub current_period_end: Option<OffsetDateTime>,
}

#[derive(Debug, Clone)]
pub struct InvoiceState {
    pub invoice_id: String,
    pub customer_id: Option<String>,
    pub subscription_id: Option<String>,
    pub amount_cents: i64,
    pub currency: String,
}

#[derive(Debug, Clone)]
pub struct PaymentIntentState {
    pub payment_intent_id: String,
}

#[derive(Debug, Deserialize)]
struct RawEnvelope {
    id: String,
    #[serde(rename = "type")]
    event_type: String,
    #[serde(default)]
    created: i64,
    data: RawData,
}

#[derive(Debug, Deserialize)]
struct RawData {
    object: serde_json::Value,
}

fn str_field(object: &serde_json::Value, key: &str) -> Option<String> {
    object.get(key).and_then(|v| v.as_str()).map(str::to_string)
}

fn i64_field(object: &serde_json::Value, key: &str) -> i64 {
    object.get(key).and_then(|v| v.as_i64()).unwrap_or(0)
}

fn timestamp_field(object: &serde_json::Value, key: &str) -> Option<OffsetDateTime> {
    object
        .get(key)
        .and_then(|v| v.as_i64())
        .and_then(|ts| OffsetDateTime::from_unix_timestamp(ts).ok())
}

fn require_id(object: &serde_json::Value, event_type: &str) -> BillingResult<String> {
    str_field(object, "id")
        .ok_or_else(|| BillingError::Invalid(format!("{event_type} object has no id")))
}

fn parse_checkout(object: &serde_json::Value) -> BillingResult<CheckoutSession> {
    let metadata = object
        .get("metadata")
        .and_then(|v| v.as_object())
        .map(|m| {
            m.iter()
                .filter_map(|(k, v)| v.as_str().map(|s| (k.clone(), s.to_string())))
                .collect()
        })
        .unwrap_or_default();

    Ok(CheckoutSession {
        session_id: require_id(object, "checkout.session")?,
        customer_id: str_field(object, "customer"),
        payment_intent_id: str_field(object, "payment_intent"),
        amount_total_cents: i64_field(object, "amount_total"),
        currency: str_field(object, "currency").unwrap_or_else(|| "usd".to_string()),
        metadata,
    })
}

fn parse_subscription(object: &serde_json::Value) -> BillingResult<SubscriptionState> {
    // The entitled price lives on the first subscription item.
    let price_id = object
        .get("items")
        .and_then(|items| items.get("data"))
        .and_then(|data| data.get(0))
        .and_then(|item| item.get("price"))
        .and_then(|price| price.get("id"))
        .and_then(|id| id.as_str())
        .map(str::to_string);

    let status = str_field(object, "status")
        .map(|s| SubscriptionStatus::from_provider(&s))
        .unwrap_or(SubscriptionStatus::None);

    Ok(SubscriptionState {
        subscription_id: require_id(object, "subscription")?,
        customer_id: str_field(object, "customer"),
        status,
        price_id,
        current_period_start: timestamp_field(object, "current_period_start"),
        current_period_end: timestamp_field(object, "current_period_end"),
    })
}

fn parse_invoice(object: &serde_json::Value) -> BillingResult<InvoiceState> {
    Ok(InvoiceState {
        invoice_id: require_id(object, "invoice")?,
        customer_id: str_field(object, "customer"),
        subscription_id: str_field(object, "subscription"),
        amount_cents: i64_field(object, "amount_paid").max(i64_field(object, "amount_due")),
        currency: str_field(object, "currency").unwrap_or_else(|| "usd".to_string()),
    })
}

fn parse_payment_intent(object: &serde_json::Value) -> BillingResult<PaymentIntentState> {
    Ok(PaymentIntentState {
        payment_intent_id: require_id(object, "payment_intent")?,
    })
}

fn parse_charge(object: &serde_json::Value) -> BillingResult<PaymentIntentState> {
    // Charges correlate to our records through their payment intent.
    let payment_intent_id = str_field(object, "payment_intent")
        .ok_or_else(|| BillingError::Invalid("charge has no payment_intent".to_string()))?;
    Ok(PaymentIntentState { payment_intent_id })
}

/// Parse a verified webhook payload into the closed event model.
///
/// Fails with `Invalid` only on malformed JSON or a handled event type
/// missing its object id; unrecognized event types parse to `Unknown`.
pub fn parse_event(payload: &str) -> BillingResult<EventEnvelope> {
    let raw: RawEnvelope = serde_json::from_str(payload)
        .map_err(|e| BillingError::Invalid(format!("malformed event payload: {e}")))?;

    let object = &raw.data.object;
    let event = match raw.event_type.as_str() {
        "checkout.session.completed" => ProviderEvent::CheckoutCompleted(parse_checkout(object)?),
        "customer.subscription.created" => {
            ProviderEvent::SubscriptionCreated(parse_subscription(object)?)
        }
        "customer.subscription.updated" => {
            ProviderEvent::SubscriptionUpdated(parse_subscription(object)?)
        }
        "customer.subscription.deleted" => {
            ProviderEvent::SubscriptionDeleted(parse_subscription(object)?)
        }
        "invoice.paid" | "invoice.payment_succeeded" => {
            ProviderEvent::InvoicePaymentSucceeded(parse_invoice(object)?)
        }
        "invoice.payment_failed" => ProviderEvent::InvoicePaymentFailed(parse_invoice(object)?),
        "payment_intent.succeeded" => {
            ProviderEvent::PaymentIntentSucceeded(parse_payment_intent(object)?)
        }
        "payment_intent.payment_failed" => {
            ProviderEvent::PaymentIntentFailed(parse_payment_intent(object)?)
        }
        "charge.refunded" => ProviderEvent::ChargeRefunded(parse_charge(object)?),
        _ => ProviderEvent::Unknown,
    };

    let created = OffsetDateTime::from_unix_timestamp(raw.created)
        .unwrap_or_else(|_| OffsetDateTime::now_utc());

    Ok(EventEnvelope {
        event_id: raw.id,
        event_type: raw.event_type,
        created,
        event,
    })
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parses_checkout_completed_with_metadata() {
        let payload = json!({
            "id": "evt_1",
            "type": "checkout.session.completed",
            "created": 1722470400,
            "data": { "object": {
                "id": "cs_test_123",
                "customer": "cus_9",
                "payment_intent": "pi_7",
                "amount_total": 1299,
                "currency": "usd",
                "metadata": {
                    "account_id": "7f8a3cc0-61c9-4f0e-93f8-0a4e2f1b6d15",
                    "checkout_type": "credits",
                    "credits": "50"
                }
            }}
        });

        let envelope = parse_event(&payload.to_string()).unwrap();
        assert_eq!(envelope.event_id, "evt_1");
        let ProviderEvent::CheckoutCompleted(session) = envelope.event else {
            panic!("expected checkout event");
        };
        assert_eq!(session.session_id, "cs_test_123");
        assert_eq!(session.amount_total_cents, 1299);
        assert!(session.is_credit_purchase());
        assert_eq!(session.credits(), 50);
        assert!(session.account_id().is_some());
    }

    #[test]
    fn parses_subscription_with_price_and_period() {
        let payload = json!({
            "id": "evt_2",
            "type": "customer.subscription.updated",
            "created": 1722470400,
            "data": { "object": {
                "id": "sub_42",
                "customer": "cus_9",
                "status": "active",
                "current_period_start": 1722470400,
                "current_period_end": 1725148800,
                "items": { "data": [ { "price": { "id": "price_pro_m" } } ] }
            }}
        });

        let envelope = parse_event(&payload.to_string()).unwrap();
        let ProviderEvent::SubscriptionUpdated(sub) = envelope.event else {
            panic!("expected subscription event");
        };
        assert_eq!(sub.subscription_id, "sub_42");
        assert_eq!(sub.status, SubscriptionStatus::Active);
        assert_eq!(sub.price_id.as_deref(), Some("price_pro_m"));
        assert!(sub.current_period_end.unwrap() > sub.current_period_start.unwrap());
    }

    #[test]
    fn invoice_paid_and_payment_succeeded_are_equivalent() {
        for event_type in ["invoice.paid", "invoice.payment_succeeded"] {
            let payload = json!({
                "id": "evt_3",
                "type": event_type,
                "created": 1722470400,
                "data": { "object": {
                    "id": "in_55",
                    "customer": "cus_9",
                    "subscription": "sub_42",
                    "amount_paid": 2900,
                    "currency": "usd"
                }}
            });

            let envelope = parse_event(&payload.to_string()).unwrap();
            assert!(matches!(
                envelope.event,
                ProviderEvent::InvoicePaymentSucceeded(_)
            ));
        }
    }

    #[test]
    fn unknown_event_type_is_not_an_error() {
        let payload = json!({
            "id": "evt_4",
            "type": "customer.tax_id.created",
            "created": 1722470400,
            "data": { "object": { "id": "txi_1" } }
        });

        let envelope = parse_event(&payload.to_string()).unwrap();
        assert!(matches!(envelope.event, ProviderEvent::Unknown));
        assert_eq!(envelope.event_type, "customer.tax_id.created");
    }

    #[test]
    fn malformed_payload_is_invalid() {
        let err = parse_event("{not json").unwrap_err();
        assert!(matches!(err, BillingError::Invalid(_)));
    }

    #[test]
    fn handled_event_without_object_id_is_invalid() {
        let payload = json!({
            "id": "evt_5",
            "type": "checkout.session.completed",
            "created": 1722470400,
            "data": { "object": { "customer": "cus_9" } }
        });
        let err = parse_event(&payload.to_string()).unwrap_err();
        assert!(matches!(err, BillingError::Invalid(_)));
    }

    #[test]
    fn missing_metadata_yields_no_account() {
        let payload = json!({
            "id": "evt_6",
            "type": "checkout.session.completed",
            "created": 1722470400,
            "data": { "object": { "id": "cs_1", "amount_total": 500 } }
        });
        let envelope = parse_event(&payload.to_string()).unwrap();
        let ProviderEvent::CheckoutCompleted(session) = envelope.event else {
            panic!("expected checkout event");
        };
        assert!(session.account_id().is_none());
        assert!(!session.is_credit_purchase());
        assert_eq!(session.credits(), 0);
    }
}
