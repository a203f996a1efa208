// Test file - these are expected patterns in test code
#![allow(clippy::unwrap_used)]
#![allow(clippy::expect_used)]

//! Concurrency and idempotency tests against a live Postgres.
//!
//! These exercise the row-lock serialization and the webhook idempotency
//! fences end to end, so they need a real database. They are ignored by
//! default; run them against a scratch database with:
//!
//! ```text
//! DATABASE_URL=postgres://localhost/scribe_test cargo test -p scribe-billing -- --ignored
//! ```

use std::sync::Arc;

use sqlx::PgPool;
use tokio::sync::Barrier;
use uuid::Uuid;

use scribe_billing::{
    parse_event, AccountService, BillingError, CreditAccounting, PlanCatalog, ReconcileOutcome,
    Reconciler,
};
use scribe_shared::RequestContext;

async fn test_pool() -> PgPool {
    let database_url =
        std::env::var("DATABASE_URL").expect("DATABASE_URL must be set for live-database tests");
    let pool = sqlx::postgres::PgPoolOptions::new()
        .max_connections(10)
        .connect(&database_url)
        .await
        .expect("connect to test database");
    sqlx::migrate!("../../migrations")
        .run(&pool)
        .await
        .expect("apply migrations");
    pool
}

fn catalog() -> PlanCatalog {
    PlanCatalog {
        starter_price_id: Some("price_starter_test".to_string()),
        pro_price_id: Some("price_pro_test".to_string()),
        enterprise_price_id: None,
    }
}

/// Create an account and force its balance to `balance` through a ledger
/// reset so the audit chain stays valid.
async fn account_with_balance(pool: &PgPool, balance: i64) -> Uuid {
    let accounts = AccountService::new(pool.clone());
    let account = accounts
        .create_account(&format!("test+{}@example.com", Uuid::new_v4()))
        .await
        .expect("create account");

    let accounting = CreditAccounting::new(pool.clone());
    accounting
        .reset_to_plan_allowance(account.id, balance, "test setup")
        .await
        .expect("seed balance");

    account.id
}

async fn balance_of(pool: &PgPool, account_id: Uuid) -> i64 {
    let (balance,): (i64,) = sqlx::query_as("SELECT credit_balance FROM accounts WHERE id = $1")
        .bind(account_id)
        .fetch_one(pool)
        .await
        .expect("read balance");
    balance
}

async fn ledger_sum(pool: &PgPool, account_id: Uuid) -> i64 {
    let (sum,): (i64,) = sqlx::query_as(
        "SELECT COALESCE(SUM(amount), 0) FROM ledger_entries WHERE account_id = $1",
    )
    .bind(account_id)
    .fetch_one(pool)
    .await
    .expect("read ledger sum");
    sum
}

// =============================================================================
// Two concurrent debits of 2 against a balance of 3: exactly one succeeds,
// the other fails with insufficient credits, final balance is 1.
// =============================================================================
#[tokio::test]
#[ignore = "requires a live Postgres (set DATABASE_URL)"]
async fn concurrent_debits_never_overdraw() {
    let pool = test_pool().await;
    let account_id = account_with_balance(&pool, 3).await;

    let barrier = Arc::new(Barrier::new(2));
    let mut handles = Vec::new();

    for _ in 0..2 {
        let pool = pool.clone();
        let barrier = barrier.clone();
        handles.push(tokio::spawn(async move {
            let accounting = CreditAccounting::new(pool);
            let ctx = RequestContext::new(account_id);
            barrier.wait().await;
            accounting.debit(account_id, 2, "generate", &ctx).await
        }));
    }

    let mut successes = 0;
    let mut insufficient = 0;
    for handle in handles {
        match handle.await.unwrap() {
            Ok(_) => successes += 1,
            Err(BillingError::InsufficientCredits { .. }) => insufficient += 1,
            Err(e) => panic!("unexpected error: {e}"),
        }
    }

    assert_eq!(successes, 1, "exactly one debit wins the race");
    assert_eq!(insufficient, 1, "the loser sees insufficient credits");
    assert_eq!(balance_of(&pool, account_id).await, 1);
    assert_eq!(ledger_sum(&pool, account_id).await, 1);
}

// =============================================================================
// N concurrent debits of amount a against balance B succeed exactly
// floor(B/a) times, and the final balance is B - a * successes.
// =============================================================================
#[tokio::test]
#[ignore = "requires a live Postgres (set DATABASE_URL)"]
async fn concurrent_debits_succeed_floor_of_balance_over_amount() {
    let pool = test_pool().await;
    let (balance, amount, callers) = (10, 3, 8);
    let account_id = account_with_balance(&pool, balance).await;

    let barrier = Arc::new(Barrier::new(callers));
    let mut handles = Vec::new();

    for _ in 0..callers {
        let pool = pool.clone();
        let barrier = barrier.clone();
        handles.push(tokio::spawn(async move {
            let accounting = CreditAccounting::new(pool);
            let ctx = RequestContext::new(account_id);
            barrier.wait().await;
            accounting.debit(account_id, amount, "generate", &ctx).await
        }));
    }

    let mut successes: i64 = 0;
    for handle in handles {
        if handle.await.unwrap().is_ok() {
            successes += 1;
        }
    }

    assert_eq!(successes, balance / amount);
    assert_eq!(balance_of(&pool, account_id).await, balance - amount * successes);
    assert_eq!(ledger_sum(&pool, account_id).await, balance - amount * successes);
}

fn checkout_payload(event_id: &str, session_id: &str, account_id: Uuid) -> String {
    serde_json::json!({
        "id": event_id,
        "type": "checkout.session.completed",
        "created": 1722470400,
        "data": { "object": {
            "id": session_id,
            "customer": format!("cus_{session_id}"),
            "payment_intent": format!("pi_{session_id}"),
            "amount_total": 1299,
            "currency": "usd",
            "metadata": {
                "account_id": account_id.to_string(),
                "checkout_type": "credits",
                "credits": "50"
            }
        }}
    })
    .to_string()
}

// =============================================================================
// A 50-credit checkout delivered twice (same event id) grants once: one
// payment record, one earned ledger entry, balance up by exactly 50.
// =============================================================================
#[tokio::test]
#[ignore = "requires a live Postgres (set DATABASE_URL)"]
async fn duplicate_checkout_delivery_grants_once() {
    let pool = test_pool().await;
    let account_id = account_with_balance(&pool, 5).await;
    let reconciler = Reconciler::new(pool.clone(), catalog());

    let event_id = format!("evt_{}", Uuid::new_v4());
    let session_id = format!("cs_{}", Uuid::new_v4());
    let payload = checkout_payload(&event_id, &session_id, account_id);

    let first = reconciler
        .process_event(&parse_event(&payload).unwrap())
        .await
        .unwrap();
    assert_eq!(first, ReconcileOutcome::Applied);

    let second = reconciler
        .process_event(&parse_event(&payload).unwrap())
        .await
        .unwrap();
    assert_eq!(second, ReconcileOutcome::Duplicate);

    assert_eq!(balance_of(&pool, account_id).await, 55);

    let (payment_count,): (i64,) = sqlx::query_as(
        "SELECT COUNT(*) FROM payment_records WHERE checkout_session_id = $1",
    )
    .bind(&session_id)
    .fetch_one(&pool)
    .await
    .unwrap();
    assert_eq!(payment_count, 1);

    let (grant_count,): (i64,) = sqlx::query_as(
        "SELECT COUNT(*) FROM ledger_entries WHERE account_id = $1 AND source_ref = $2",
    )
    .bind(account_id)
    .bind(&session_id)
    .fetch_one(&pool)
    .await
    .unwrap();
    assert_eq!(grant_count, 1);
}

// =============================================================================
// A distinct redelivery (new event id, same checkout session) still grants
// once: the payment-record fence catches what the event-id fence cannot.
// =============================================================================
#[tokio::test]
#[ignore = "requires a live Postgres (set DATABASE_URL)"]
async fn same_session_under_new_event_id_grants_once() {
    let pool = test_pool().await;
    let account_id = account_with_balance(&pool, 0).await;
    let reconciler = Reconciler::new(pool.clone(), catalog());

    let session_id = format!("cs_{}", Uuid::new_v4());
    for _ in 0..2 {
        let event_id = format!("evt_{}", Uuid::new_v4());
        let payload = checkout_payload(&event_id, &session_id, account_id);
        let outcome = reconciler
            .process_event(&parse_event(&payload).unwrap())
            .await
            .unwrap();
        assert_eq!(outcome, ReconcileOutcome::Applied);
    }

    assert_eq!(balance_of(&pool, account_id).await, 50);
}

fn subscription_payload(event_id: &str, sub_id: &str, customer_id: &str, status: &str) -> String {
    serde_json::json!({
        "id": event_id,
        "type": "customer.subscription.updated",
        "created": 1722470400,
        "data": { "object": {
            "id": sub_id,
            "customer": customer_id,
            "status": status,
            "current_period_start": 1722470400,
            "current_period_end": 1725148800,
            "items": { "data": [ { "price": { "id": "price_pro_test" } } ] }
        }}
    })
    .to_string()
}

// =============================================================================
// Pro renewal: subscription sync establishes the mirror, then invoice paid
// resets the balance to exactly 150 with a signed-delta earned entry.
// =============================================================================
#[tokio::test]
#[ignore = "requires a live Postgres (set DATABASE_URL)"]
async fn invoice_paid_resets_balance_to_plan_allowance() {
    let pool = test_pool().await;
    let account_id = account_with_balance(&pool, 30).await;
    let accounts = AccountService::new(pool.clone());
    let reconciler = Reconciler::new(pool.clone(), catalog());

    let customer_id = format!("cus_{}", Uuid::new_v4());
    let sub_id = format!("sub_{}", Uuid::new_v4());
    accounts
        .link_customer_id(account_id, &customer_id)
        .await
        .unwrap();

    let sync = subscription_payload(
        &format!("evt_{}", Uuid::new_v4()),
        &sub_id,
        &customer_id,
        "active",
    );
    reconciler
        .process_event(&parse_event(&sync).unwrap())
        .await
        .unwrap();

    let invoice = serde_json::json!({
        "id": format!("evt_{}", Uuid::new_v4()),
        "type": "invoice.paid",
        "created": 1722470400,
        "data": { "object": {
            "id": format!("in_{}", Uuid::new_v4()),
            "customer": customer_id,
            "subscription": sub_id,
            "amount_paid": 2900,
            "currency": "usd"
        }}
    })
    .to_string();
    let outcome = reconciler
        .process_event(&parse_event(&invoice).unwrap())
        .await
        .unwrap();
    assert_eq!(outcome, ReconcileOutcome::Applied);

    assert_eq!(balance_of(&pool, account_id).await, 150);

    // The reset entry carries the signed delta from the prior balance.
    let (delta,): (i64,) = sqlx::query_as(
        r#"
        SELECT amount FROM ledger_entries
        WHERE account_id = $1 AND source = 'subscription_renewal'
        ORDER BY seq DESC LIMIT 1
        "#,
    )
    .bind(account_id)
    .fetch_one(&pool)
    .await
    .unwrap();
    assert_eq!(delta, 120);
}

// =============================================================================
// Subscription deleted: plan reverts to free, status goes canceled, and
// the credit balance is left exactly where it was.
// =============================================================================
#[tokio::test]
#[ignore = "requires a live Postgres (set DATABASE_URL)"]
async fn subscription_deleted_keeps_balance() {
    let pool = test_pool().await;
    let account_id = account_with_balance(&pool, 42).await;
    let accounts = AccountService::new(pool.clone());
    let reconciler = Reconciler::new(pool.clone(), catalog());

    let customer_id = format!("cus_{}", Uuid::new_v4());
    let sub_id = format!("sub_{}", Uuid::new_v4());
    accounts
        .link_customer_id(account_id, &customer_id)
        .await
        .unwrap();

    let sync = subscription_payload(
        &format!("evt_{}", Uuid::new_v4()),
        &sub_id,
        &customer_id,
        "active",
    );
    reconciler
        .process_event(&parse_event(&sync).unwrap())
        .await
        .unwrap();

    let deleted = serde_json::json!({
        "id": format!("evt_{}", Uuid::new_v4()),
        "type": "customer.subscription.deleted",
        "created": 1722470400,
        "data": { "object": {
            "id": sub_id,
            "customer": customer_id,
            "status": "canceled"
        }}
    })
    .to_string();
    reconciler
        .process_event(&parse_event(&deleted).unwrap())
        .await
        .unwrap();

    let (plan, status): (String, String) = sqlx::query_as(
        "SELECT plan_id, subscription_status FROM accounts WHERE id = $1",
    )
    .bind(account_id)
    .fetch_one(&pool)
    .await
    .unwrap();
    assert_eq!(plan, "free");
    assert_eq!(status, "canceled");
    assert_eq!(balance_of(&pool, account_id).await, 42);
}
