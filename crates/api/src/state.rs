//! Application state

use std::sync::Arc;

use sqlx::PgPool;

use scribe_billing::{BillingService, PlanCatalog};

use crate::{auth::JwtVerifier, config::Config};

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub pool: PgPool,
    pub config: Config,
    pub billing: Arc<BillingService>,
    pub jwt_verifier: JwtVerifier,
}

impl AppState {
    pub fn new(pool: PgPool, config: Config) -> Self {
        let catalog = PlanCatalog::from_env();
        let billing = Arc::new(BillingService::new(
            pool.clone(),
            config.billing_webhook_secret.clone(),
            catalog,
        ));
        let jwt_verifier = JwtVerifier::new(&config.jwt_secret);

        Self {
            pool,
            config,
            billing,
            jwt_verifier,
        }
    }
}
