//! Scribe Background Worker
//!
//! Handles scheduled jobs including:
//! - Ledger invariant sweep (hourly)
//! - Stuck webhook claim reporting (every 15 minutes)
//! - Processed webhook event retention purge (daily at 4:00 AM UTC)

use std::sync::Arc;
use std::time::Duration;

use sqlx::postgres::PgPoolOptions;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info, warn};

use scribe_billing::{InvariantCheckSummary, InvariantChecker};

/// Successful webhook claims older than this are safe to purge; the
/// provider never redelivers events this old.
const WEBHOOK_RETENTION_DAYS: i32 = 90;

/// Create a database connection pool
async fn create_db_pool() -> anyhow::Result<sqlx::PgPool> {
    #[allow(clippy::expect_used)] // Fail-fast on startup if required config is missing
    let database_url = std::env::var("DATABASE_URL").expect("DATABASE_URL must be set");

    let pool = PgPoolOptions::new()
        .max_connections(5)
        .acquire_timeout(Duration::from_secs(5))
        .connect(&database_url)
        .await?;

    info!("Database pool created");
    Ok(pool)
}

/// Log results of an invariant sweep
fn log_invariant_summary(summary: &InvariantCheckSummary) {
    info!(
        checks_run = summary.checks_run,
        checks_passed = summary.checks_passed,
        checks_failed = summary.checks_failed,
        healthy = summary.healthy,
        "Invariant sweep complete"
    );

    for violation in &summary.violations {
        error!(
            invariant = %violation.invariant,
            severity = %violation.severity,
            account_ids = ?violation.account_ids,
            context = %violation.context,
            "Invariant violation: {}",
            violation.description
        );
    }
}

/// Report webhook events stuck in 'processing' or parked in 'error'.
/// Stuck rows recover via the claim timeout; error rows wait on provider
/// redelivery. Either piling up means something upstream is wrong.
async fn report_unsettled_webhook_events(pool: &sqlx::PgPool) {
    let counts: Result<(i64, i64), sqlx::Error> = sqlx::query_as(
        r#"
        SELECT
            COUNT(*) FILTER (
                WHERE processing_result = 'processing'
                  AND processing_started_at < NOW() - INTERVAL '30 minutes'
            ),
            COUNT(*) FILTER (WHERE processing_result = 'error')
        FROM provider_webhook_events
        "#,
    )
    .fetch_one(pool)
    .await;

    match counts {
        Ok((stuck, errored)) => {
            if stuck > 0 || errored > 0 {
                warn!(
                    stuck_processing = stuck,
                    awaiting_redelivery = errored,
                    "Unsettled webhook events found"
                );
            } else {
                info!("No unsettled webhook events");
            }
        }
        Err(e) => error!(error = %e, "Failed to query unsettled webhook events"),
    }
}

/// Purge successfully processed webhook claims past the retention window.
async fn purge_processed_webhook_events(pool: &sqlx::PgPool) {
    let result = sqlx::query(
        r#"
        DELETE FROM provider_webhook_events
        WHERE processing_result = 'success'
          AND created_at < NOW() - ($1 || ' days')::INTERVAL
        "#,
    )
    .bind(WEBHOOK_RETENTION_DAYS)
    .execute(pool)
    .await;

    match result {
        Ok(r) => info!(
            purged = r.rows_affected(),
            retention_days = WEBHOOK_RETENTION_DAYS,
            "Webhook event retention purge complete"
        ),
        Err(e) => error!(error = %e, "Webhook event retention purge failed"),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    // Load environment
    dotenvy::dotenv().ok();

    info!("Starting Scribe Worker");

    // Create database pool
    let pool = create_db_pool().await?;

    let invariants = Arc::new(InvariantChecker::new(pool.clone()));

    // Create scheduler
    let scheduler = JobScheduler::new().await?;

    // Job 1: Invariant sweep every hour
    let sweep_checker = invariants.clone();
    scheduler
        .add(Job::new_async("0 0 * * * *", move |_uuid, _l| {
            let checker = sweep_checker.clone();
            Box::pin(async move {
                info!("Running scheduled ledger invariant sweep");
                match checker.run_all_checks().await {
                    Ok(summary) => log_invariant_summary(&summary),
                    Err(e) => error!(error = %e, "Invariant sweep failed"),
                }
            })
        })?)
        .await?;
    info!("Scheduled: Ledger invariant sweep (hourly)");

    // Job 2: Unsettled webhook event report (every 15 minutes)
    let report_pool = pool.clone();
    scheduler
        .add(Job::new_async("0 */15 * * * *", move |_uuid, _l| {
            let pool = report_pool.clone();
            Box::pin(async move {
                report_unsettled_webhook_events(&pool).await;
            })
        })?)
        .await?;
    info!("Scheduled: Unsettled webhook event report (every 15 minutes)");

    // Job 3: Webhook event retention purge (daily at 4:00 AM UTC)
    let purge_pool = pool.clone();
    scheduler
        .add(Job::new_async("0 0 4 * * *", move |_uuid, _l| {
            let pool = purge_pool.clone();
            Box::pin(async move {
                purge_processed_webhook_events(&pool).await;
            })
        })?)
        .await?;
    info!("Scheduled: Webhook event retention purge (daily 04:00 UTC)");

    // Job 4: Health check heartbeat (every 5 minutes)
    scheduler
        .add(Job::new_async("0 */5 * * * *", |_uuid, _l| {
            Box::pin(async move {
                info!("Worker heartbeat - all systems operational");
            })
        })?)
        .await?;
    info!("Scheduled: Health check heartbeat (every 5 minutes)");

    scheduler.start().await?;
    info!("Scheduler started");

    // Run one sweep immediately so a fresh deploy reports health without
    // waiting for the first cron tick.
    match invariants.run_all_checks().await {
        Ok(summary) => log_invariant_summary(&summary),
        Err(e) => error!(error = %e, "Initial invariant sweep failed"),
    }

    // Keep the worker alive
    loop {
        tokio::time::sleep(Duration::from_secs(3600)).await;
    }
}
