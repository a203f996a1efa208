//! Billing event reconciler.
//!
//! Ingests verified provider lifecycle events and translates each into at
//! most one set of ledger/account mutations. Idempotency is two-layered:
//! the provider event id is claimed atomically in `provider_webhook_events`
//! before any mutation, and payment-record correlation ids carry unique
//! constraints that turn duplicate object deliveries into no-ops.
//!
//! All effects for one event apply inside a single transaction. A store
//! failure rejects the whole event so the provider's redelivery retries
//! it; an unresolvable account drops the event with a warning, since
//! redelivery cannot change the resolution outcome.

use sqlx::{PgConnection, PgPool};
use uuid::Uuid;

use crate::accounting::CreditAccounting;
use crate::accounts::AccountService;
use crate::error::{BillingError, BillingResult};
use crate::events::{EventEnvelope, ProviderEvent};
use crate::payments::{InsertOutcome, PaymentService, PaymentStatus};
use crate::plans::{PlanCatalog, PlanId};
use crate::reconcile::{self, Effect};

/// How long a claim may sit in `processing` before another delivery may
/// take it over (crashed worker recovery).
const PROCESSING_TIMEOUT_MINUTES: i32 = 30;

/// What became of one delivered event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReconcileOutcome {
    /// Effects were applied.
    Applied,
    /// The event id was already processed (or is being processed) —
    /// duplicate delivery, no-op.
    Duplicate,
    /// The event was valid but could not be tied to an account; dropped
    /// with a warning and not retried.
    Skipped(String),
    /// Unhandled event type; acknowledged and ignored.
    Ignored,
}

pub struct Reconciler {
    pool: PgPool,
    accounts: AccountService,
    catalog: PlanCatalog,
}

impl Reconciler {
    pub fn new(pool: PgPool, catalog: PlanCatalog) -> Self {
        let accounts = AccountService::new(pool.clone());
        Self {
            pool,
            accounts,
            catalog,
        }
    }

    /// Process one verified event end to end: claim, decide, apply,
    /// finalize.
    pub async fn process_event(&self, envelope: &EventEnvelope) -> BillingResult<ReconcileOutcome> {
        if !self.claim_event(envelope).await? {
            tracing::info!(
                event_id = %envelope.event_id,
                event_type = %envelope.event_type,
                "Duplicate provider event, already claimed"
            );
            return Ok(ReconcileOutcome::Duplicate);
        }

        tracing::info!(
            event_id = %envelope.event_id,
            event_type = %envelope.event_type,
            "Processing provider event"
        );

        let result = self.apply_event(envelope).await;

        match &result {
            Ok(outcome) => {
                let note = match outcome {
                    ReconcileOutcome::Skipped(reason) => Some(reason.clone()),
                    _ => None,
                };
                self.finalize_claim(&envelope.event_id, "success", note.as_deref())
                    .await;
            }
            Err(e) => {
                // The claim is left in 'error' so the provider's retry can
                // reclaim it; the mutation transaction has already rolled
                // back, so no partial effects persist.
                self.finalize_claim(&envelope.event_id, "error", Some(&e.to_string()))
                    .await;
            }
        }

        result
    }

    /// Atomically claim exclusive processing rights for an event id.
    ///
    /// The upsert's WHERE clause admits reclaiming rows whose last attempt
    /// errored (so redelivery retries transient failures) and rows stuck
    /// in `processing` past the timeout (crashed worker). A successfully
    /// processed id can never be reclaimed.
    async fn claim_event(&self, envelope: &EventEnvelope) -> BillingResult<bool> {
        let claimed: Option<(Uuid,)> = sqlx::query_as(
            r#"
            INSERT INTO provider_webhook_events
                (provider_event_id, event_type, event_timestamp, processing_result, processing_started_at)
            VALUES ($1, $2, $3, 'processing', NOW())
            ON CONFLICT (provider_event_id) DO UPDATE SET
                processing_result = 'processing',
                processing_started_at = NOW(),
                error_message = NULL
            WHERE provider_webhook_events.processing_result = 'error'
               OR (provider_webhook_events.processing_result = 'processing'
                   AND provider_webhook_events.processing_started_at
                       < NOW() - ($4 || ' minutes')::INTERVAL)
            RETURNING id
            "#,
        )
        .bind(&envelope.event_id)
        .bind(&envelope.event_type)
        .bind(envelope.created)
        .bind(PROCESSING_TIMEOUT_MINUTES)
        .fetch_optional(&self.pool)
        .await?;

        Ok(claimed.is_some())
    }

    async fn finalize_claim(&self, event_id: &str, result: &str, message: Option<&str>) {
        let update = sqlx::query(
            r#"
            UPDATE provider_webhook_events
            SET processing_result = $1, error_message = $2
            WHERE provider_event_id = $3
            "#,
        )
        .bind(result)
        .bind(message)
        .bind(event_id)
        .execute(&self.pool)
        .await;

        if let Err(e) = update {
            tracing::error!(
                event_id = %event_id,
                intended_result = %result,
                error = %e,
                "Failed to finalize webhook claim; row may sit in 'processing' until timeout recovery"
            );
        }
    }

    /// Resolve state, run the pure decision for the event kind, apply the
    /// effects in one transaction.
    async fn apply_event(&self, envelope: &EventEnvelope) -> BillingResult<ReconcileOutcome> {
        let (account_id, effects) = match &envelope.event {
            ProviderEvent::Unknown => {
                tracing::info!(
                    event_id = %envelope.event_id,
                    event_type = %envelope.event_type,
                    "Unhandled provider event type, ignoring"
                );
                return Ok(ReconcileOutcome::Ignored);
            }

            ProviderEvent::CheckoutCompleted(session) => {
                let Some(account_id) = session.account_id() else {
                    tracing::warn!(
                        event_id = %envelope.event_id,
                        session_id = %session.session_id,
                        "Checkout event carries no account correlation, dropping"
                    );
                    return Ok(ReconcileOutcome::Skipped(
                        "checkout metadata has no account_id".to_string(),
                    ));
                };
                (
                    Some(account_id),
                    reconcile::decide_checkout_completed(account_id, session),
                )
            }

            ProviderEvent::SubscriptionCreated(sub) | ProviderEvent::SubscriptionUpdated(sub) => {
                match self.resolve_by_customer(sub.customer_id.as_deref()).await? {
                    Resolution::Found(account_id) => (
                        Some(account_id),
                        reconcile::decide_subscription_changed(&self.catalog, sub),
                    ),
                    Resolution::Missing(reason) => {
                        return Ok(self.skip(envelope, reason));
                    }
                }
            }

            ProviderEvent::SubscriptionDeleted(sub) => {
                match self.resolve_by_customer(sub.customer_id.as_deref()).await? {
                    Resolution::Found(account_id) => (
                        Some(account_id),
                        reconcile::decide_subscription_deleted(sub),
                    ),
                    Resolution::Missing(reason) => {
                        return Ok(self.skip(envelope, reason));
                    }
                }
            }

            ProviderEvent::InvoicePaymentSucceeded(invoice) => {
                match self
                    .resolve_by_customer(invoice.customer_id.as_deref())
                    .await?
                {
                    Resolution::Found(account_id) => {
                        let entitled_plan = match invoice.subscription_id.as_deref() {
                            Some(sub_id) => self.find_mirror_plan(sub_id).await?,
                            None => None,
                        };
                        if entitled_plan.is_none() {
                            tracing::warn!(
                                event_id = %envelope.event_id,
                                invoice_id = %invoice.invoice_id,
                                subscription_id = ?invoice.subscription_id,
                                "Invoice paid but no subscription mirror found; recording payment without renewal reset"
                            );
                        }
                        (
                            Some(account_id),
                            reconcile::decide_invoice_paid(account_id, invoice, entitled_plan),
                        )
                    }
                    Resolution::Missing(reason) => {
                        return Ok(self.skip(envelope, reason));
                    }
                }
            }

            ProviderEvent::InvoicePaymentFailed(invoice) => {
                match self
                    .resolve_by_customer(invoice.customer_id.as_deref())
                    .await?
                {
                    Resolution::Found(account_id) => (
                        Some(account_id),
                        reconcile::decide_invoice_failed(account_id, invoice),
                    ),
                    Resolution::Missing(reason) => {
                        return Ok(self.skip(envelope, reason));
                    }
                }
            }

            ProviderEvent::PaymentIntentSucceeded(intent) => (
                None,
                reconcile::decide_payment_intent(intent, PaymentStatus::Succeeded),
            ),
            ProviderEvent::PaymentIntentFailed(intent) => (
                None,
                reconcile::decide_payment_intent(intent, PaymentStatus::Failed),
            ),
            ProviderEvent::ChargeRefunded(intent) => (
                None,
                reconcile::decide_payment_intent(intent, PaymentStatus::Refunded),
            ),
        };

        let mut tx = self.pool.begin().await?;
        for effect in effects {
            apply_effect(&mut tx, account_id, effect).await?;
        }
        tx.commit().await?;

        tracing::info!(
            event_id = %envelope.event_id,
            event_type = %envelope.event_type,
            account_id = ?account_id,
            "Provider event applied"
        );

        Ok(ReconcileOutcome::Applied)
    }

    fn skip(&self, envelope: &EventEnvelope, reason: String) -> ReconcileOutcome {
        tracing::warn!(
            event_id = %envelope.event_id,
            event_type = %envelope.event_type,
            reason = %reason,
            "Dropping unresolvable provider event"
        );
        ReconcileOutcome::Skipped(reason)
    }

    async fn resolve_by_customer(&self, customer_id: Option<&str>) -> BillingResult<Resolution> {
        let Some(customer_id) = customer_id else {
            return Ok(Resolution::Missing("event has no customer id".to_string()));
        };

        match self.accounts.find_by_customer_id(customer_id).await? {
            Some(account) => Ok(Resolution::Found(account.id)),
            None => Ok(Resolution::Missing(format!(
                "no account for provider customer {customer_id}"
            ))),
        }
    }

    /// Entitled plan from the local subscription mirror, keyed by the
    /// provider subscription id.
    async fn find_mirror_plan(&self, provider_subscription_id: &str) -> BillingResult<Option<PlanId>> {
        let row: Option<(String,)> = sqlx::query_as(
            "SELECT plan_id FROM subscription_mirror WHERE provider_subscription_id = $1",
        )
        .bind(provider_subscription_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.and_then(|(plan,)| PlanId::from_str(&plan)))
    }
}

enum Resolution {
    Found(Uuid),
    Missing(String),
}

/// Apply one effect inside the event's transaction.
async fn apply_effect(
    conn: &mut PgConnection,
    account_id: Option<Uuid>,
    effect: Effect,
) -> BillingResult<()> {
    match effect {
        Effect::RecordPayment { payment, on_insert } => {
            let outcome = PaymentService::insert_in_tx(conn, &payment).await?;
            match outcome {
                InsertOutcome::Inserted(payment_id) => {
                    tracing::debug!(payment_id = %payment_id, "Payment record written");
                    for nested in on_insert {
                        apply_leaf_effect(conn, account_id, nested).await?;
                    }
                }
                InsertOutcome::Duplicate => {
                    tracing::info!(
                        checkout_session_id = ?payment.checkout_session_id,
                        invoice_id = ?payment.invoice_id,
                        "Payment record already exists, skipping gated effects"
                    );
                }
            }
            Ok(())
        }
        other => apply_leaf_effect(conn, account_id, other).await,
    }
}

async fn apply_leaf_effect(
    conn: &mut PgConnection,
    account_id: Option<Uuid>,
    effect: Effect,
) -> BillingResult<()> {
    let require_account = |what: &str| {
        account_id.ok_or_else(|| {
            BillingError::Invalid(format!("{what} effect requires a resolved account"))
        })
    };

    match effect {
        Effect::RecordPayment { .. } => Err(BillingError::Invalid(
            "payment records cannot be nested under another payment record".to_string(),
        )),

        Effect::GrantCredits {
            amount,
            source,
            source_ref,
            description,
        } => {
            let account_id = require_account("credit grant")?;
            CreditAccounting::credit_in_tx(
                conn,
                account_id,
                amount,
                source,
                Some(&source_ref),
                &description,
            )
            .await?;
            Ok(())
        }

        Effect::ResetBalance { allowance, reason } => {
            let account_id = require_account("balance reset")?;
            CreditAccounting::reset_in_tx(conn, account_id, allowance, &reason).await?;
            Ok(())
        }

        Effect::SyncSubscription {
            subscription_id,
            plan,
            status,
            period_start,
            period_end,
        } => {
            let account_id = require_account("subscription sync")?;

            sqlx::query(
                r#"
                UPDATE accounts SET
                    plan_id = $1,
                    provider_subscription_id = $2,
                    subscription_status = $3,
                    current_period_start = $4,
                    current_period_end = $5,
                    updated_at = NOW()
                WHERE id = $6
                "#,
            )
            .bind(plan.as_str())
            .bind(&subscription_id)
            .bind(status.as_str())
            .bind(period_start)
            .bind(period_end)
            .bind(account_id)
            .execute(&mut *conn)
            .await?;

            // The mirror is keyed by the provider's subscription id so
            // out-of-order created/updated deliveries both land here.
            sqlx::query(
                r#"
                INSERT INTO subscription_mirror
                    (provider_subscription_id, account_id, plan_id, status,
                     current_period_start, current_period_end)
                VALUES ($1, $2, $3, $4, $5, $6)
                ON CONFLICT (provider_subscription_id) DO UPDATE SET
                    plan_id = EXCLUDED.plan_id,
                    status = EXCLUDED.status,
                    current_period_start = EXCLUDED.current_period_start,
                    current_period_end = EXCLUDED.current_period_end,
                    updated_at = NOW()
                "#,
            )
            .bind(&subscription_id)
            .bind(account_id)
            .bind(plan.as_str())
            .bind(status.as_str())
            .bind(period_start)
            .bind(period_end)
            .execute(&mut *conn)
            .await?;

            Ok(())
        }

        Effect::ClearSubscription { subscription_id } => {
            let account_id = require_account("subscription clear")?;

            sqlx::query(
                r#"
                UPDATE accounts SET
                    plan_id = 'free',
                    subscription_status = 'canceled',
                    updated_at = NOW()
                WHERE id = $1
                "#,
            )
            .bind(account_id)
            .execute(&mut *conn)
            .await?;

            sqlx::query(
                r#"
                UPDATE subscription_mirror SET status = 'canceled', updated_at = NOW()
                WHERE provider_subscription_id = $1
                "#,
            )
            .bind(&subscription_id)
            .execute(&mut *conn)
            .await?;

            Ok(())
        }

        Effect::MarkPastDue => {
            let account_id = require_account("past-due mark")?;
            sqlx::query(
                "UPDATE accounts SET subscription_status = 'past_due', updated_at = NOW() WHERE id = $1",
            )
            .bind(account_id)
            .execute(&mut *conn)
            .await?;
            Ok(())
        }

        Effect::SetPaymentStatusByIntent {
            payment_intent_id,
            status,
        } => {
            let updated =
                PaymentService::set_status_by_intent_in_tx(conn, &payment_intent_id, status)
                    .await?;
            if updated == 0 {
                // The intent event can race ahead of checkout completion;
                // the record converges when that event arrives.
                tracing::info!(
                    payment_intent_id = %payment_intent_id,
                    status = status.as_str(),
                    "No payment record for intent yet, no-op"
                );
            }
            Ok(())
        }

        Effect::LinkCustomerId { customer_id } => {
            let account_id = require_account("customer link")?;
            sqlx::query(
                r#"
                UPDATE accounts
                SET provider_customer_id = $1, updated_at = NOW()
                WHERE id = $2 AND (provider_customer_id IS NULL OR provider_customer_id = $1)
                "#,
            )
            .bind(&customer_id)
            .bind(account_id)
            .execute(&mut *conn)
            .await?;
            Ok(())
        }
    }
}
