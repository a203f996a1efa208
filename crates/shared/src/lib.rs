//! Shared infrastructure for the Scribe services.
//!
//! Database pool construction, the migration runner, and the request
//! context type that ties ledger mutations back to originating requests.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use uuid::Uuid;

/// Create the application connection pool.
///
/// The acquire timeout bounds how long any caller can wait for a
/// connection; a timeout surfaces as a transient error, never a hang.
pub async fn create_pool(database_url: &str) -> Result<PgPool, sqlx::Error> {
    let pool = PgPoolOptions::new()
        .max_connections(20)
        .acquire_timeout(Duration::from_secs(5))
        .connect(database_url)
        .await?;

    tracing::info!("Database pool created");
    Ok(pool)
}

/// Pool used only for running migrations (longer timeouts, single connection).
pub async fn create_migration_pool(database_url: &str) -> Result<PgPool, sqlx::Error> {
    PgPoolOptions::new()
        .max_connections(1)
        .acquire_timeout(Duration::from_secs(30))
        .connect(database_url)
        .await
}

/// Apply pending migrations from the workspace `migrations/` directory.
pub async fn run_migrations(pool: &PgPool) -> Result<(), sqlx::migrate::MigrateError> {
    sqlx::migrate!("../../migrations").run(pool).await?;
    tracing::info!("Database migrations applied");
    Ok(())
}

/// Context carried from the HTTP layer into ledger mutations so audit rows
/// can be correlated with the originating request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestContext {
    /// Request correlation id assigned at the edge.
    pub request_id: String,
    /// Authenticated account the request acted on behalf of.
    pub account_id: Uuid,
}

impl RequestContext {
    pub fn new(account_id: Uuid) -> Self {
        Self {
            request_id: Uuid::new_v4().to_string(),
            account_id,
        }
    }

    pub fn with_request_id(account_id: Uuid, request_id: impl Into<String>) -> Self {
        Self {
            request_id: request_id.into(),
            account_id,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_context_preserves_supplied_id() {
        let account_id = Uuid::new_v4();
        let ctx = RequestContext::with_request_id(account_id, "req_123");
        assert_eq!(ctx.request_id, "req_123");
        assert_eq!(ctx.account_id, account_id);
    }
}
