//! Reconciliation decisions.
//!
//! One pure function per provider event kind. Each takes the parsed event
//! plus whatever already-resolved state it needs and returns the list of
//! effects to apply; it performs no IO. The reconciler resolves the
//! account, calls the decision function, and applies the effects inside a
//! single transaction. Keeping the branch logic here means the state
//! machine is testable without a database.

use serde_json::json;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::events::{CheckoutSession, InvoiceState, PaymentIntentState, SubscriptionState};
use crate::ledger::LedgerSource;
use crate::payments::{NewPayment, PaymentStatus, PaymentType};
use crate::plans::{PlanCatalog, PlanId, SubscriptionStatus};

/// A single mutation the reconciler applies. All effects produced for one
/// event are applied in one transaction; any failure rejects the event so
/// provider redelivery retries it.
#[derive(Debug)]
pub enum Effect {
    /// Insert a payment record under its unique correlation ids. The
    /// nested effects run only when the insert landed — a duplicate
    /// (retried delivery) skips them, which is what makes credit grants
    /// exactly-once.
    RecordPayment {
        payment: NewPayment,
        on_insert: Vec<Effect>,
    },
    /// Grant credits with an `earned` ledger entry.
    GrantCredits {
        amount: i64,
        source: LedgerSource,
        source_ref: String,
        description: String,
    },
    /// Set the balance to exactly the plan allowance (renewal).
    ResetBalance { allowance: i64, reason: String },
    /// Update the account's plan/subscription projection and upsert the
    /// subscription mirror row.
    SyncSubscription {
        subscription_id: String,
        plan: PlanId,
        status: SubscriptionStatus,
        period_start: Option<OffsetDateTime>,
        period_end: Option<OffsetDateTime>,
    },
    /// Subscription ended: free plan, canceled status, mirror canceled.
    /// The credit balance is left untouched.
    ClearSubscription { subscription_id: String },
    /// Invoice payment failed: subscription goes past_due.
    MarkPastDue,
    /// Update a payment record's status by payment-intent id. A missing
    /// record is a no-op (the intent event can race ahead of checkout
    /// completion).
    SetPaymentStatusByIntent {
        payment_intent_id: String,
        status: PaymentStatus,
    },
    /// Attach the provider customer id to the account.
    LinkCustomerId { customer_id: String },
}

/// Checkout completed: record the payment; for one-off credit purchases,
/// grant the purchased credits gated on the record insert.
pub fn decide_checkout_completed(account_id: Uuid, session: &CheckoutSession) -> Vec<Effect> {
    let is_credit_purchase = session.is_credit_purchase();
    let credits = session.credits();

    let mut on_insert = Vec::new();
    if is_credit_purchase && credits > 0 {
        on_insert.push(Effect::GrantCredits {
            amount: credits,
            source: LedgerSource::Purchase,
            source_ref: session.session_id.clone(),
            description: format!("Purchased {credits} credits"),
        });
    }

    let payment = NewPayment {
        account_id,
        checkout_session_id: Some(session.session_id.clone()),
        payment_intent_id: session.payment_intent_id.clone(),
        invoice_id: None,
        amount_cents: session.amount_total_cents,
        currency: session.currency.clone(),
        status: PaymentStatus::Succeeded,
        payment_type: if is_credit_purchase {
            PaymentType::Credits
        } else {
            PaymentType::Subscription
        },
        credits_granted: if is_credit_purchase { credits } else { 0 },
        metadata: json!(session.metadata),
    };

    let mut effects = vec![Effect::RecordPayment { payment, on_insert }];

    if let Some(customer_id) = &session.customer_id {
        effects.push(Effect::LinkCustomerId {
            customer_id: customer_id.clone(),
        });
    }

    effects
}

/// Subscription created or updated: map the price to a plan (free when
/// unmapped) and sync the projection and mirror. A terminal status folds
/// into the deleted handling.
pub fn decide_subscription_changed(
    catalog: &PlanCatalog,
    sub: &SubscriptionState,
) -> Vec<Effect> {
    if sub.status.is_terminal() {
        return decide_subscription_deleted(sub);
    }

    let plan = sub
        .price_id
        .as_deref()
        .map(|price| catalog.plan_for_price(price))
        .unwrap_or(PlanId::Free);

    vec![Effect::SyncSubscription {
        subscription_id: sub.subscription_id.clone(),
        plan,
        status: sub.status,
        period_start: sub.current_period_start,
        period_end: sub.current_period_end,
    }]
}

/// Subscription deleted: back to the free plan, canceled status. Earned
/// credits are not clawed back.
pub fn decide_subscription_deleted(sub: &SubscriptionState) -> Vec<Effect> {
    vec![Effect::ClearSubscription {
        subscription_id: sub.subscription_id.clone(),
    }]
}

/// Invoice paid: always record the payment; when the subscription mirror
/// resolves to an entitled plan, reset the balance to that plan's
/// allowance for the new period. The reset is gated on the record insert
/// so a replayed invoice cannot reset twice.
pub fn decide_invoice_paid(
    account_id: Uuid,
    invoice: &InvoiceState,
    entitled_plan: Option<PlanId>,
) -> Vec<Effect> {
    let mut on_insert = Vec::new();
    if let Some(plan) = entitled_plan {
        on_insert.push(Effect::ResetBalance {
            allowance: plan.monthly_allowance(),
            reason: format!("{} plan renewal", plan.as_str()),
        });
    }

    vec![Effect::RecordPayment {
        payment: NewPayment {
            account_id,
            checkout_session_id: None,
            payment_intent_id: None,
            invoice_id: Some(invoice.invoice_id.clone()),
            amount_cents: invoice.amount_cents,
            currency: invoice.currency.clone(),
            status: PaymentStatus::Succeeded,
            payment_type: PaymentType::Subscription,
            credits_granted: 0,
            metadata: json!({ "subscription_id": invoice.subscription_id }),
        },
        on_insert,
    }]
}

/// Invoice payment failed: record the failure and mark the subscription
/// past due. The balance is not reduced.
pub fn decide_invoice_failed(account_id: Uuid, invoice: &InvoiceState) -> Vec<Effect> {
    vec![
        Effect::RecordPayment {
            payment: NewPayment {
                account_id,
                checkout_session_id: None,
                payment_intent_id: None,
                invoice_id: Some(invoice.invoice_id.clone()),
                amount_cents: invoice.amount_cents,
                currency: invoice.currency.clone(),
                status: PaymentStatus::Failed,
                payment_type: PaymentType::Subscription,
                credits_granted: 0,
                metadata: json!({ "subscription_id": invoice.subscription_id }),
            },
            on_insert: Vec::new(),
        },
        Effect::MarkPastDue,
    ]
}

/// Payment intent settled either way: converge the matching record's
/// status if one exists.
pub fn decide_payment_intent(intent: &PaymentIntentState, status: PaymentStatus) -> Vec<Effect> {
    vec![Effect::SetPaymentStatusByIntent {
        payment_intent_id: intent.payment_intent_id.clone(),
        status,
    }]
}
