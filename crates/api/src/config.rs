//! API server configuration

use serde::Deserialize;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Postgres connection string.
    pub database_url: String,
    /// Address the HTTP server binds to.
    pub bind_address: String,
    /// HS256 secret for verifying bearer tokens. Token issuance lives in
    /// the identity service; this server only verifies.
    pub jwt_secret: String,
    /// Endpoint secret for provider webhook signatures.
    pub billing_webhook_secret: String,
    /// Comma-separated CORS origin allowlist.
    pub allowed_origins: String,
    /// Shared secret for internal service-to-service endpoints (account
    /// provisioning from the identity service).
    pub internal_api_token: String,
}

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        let require = |key: &str| {
            std::env::var(key).map_err(|_| anyhow::anyhow!("{key} must be set"))
        };

        Ok(Self {
            database_url: require("DATABASE_URL")?,
            bind_address: std::env::var("BIND_ADDRESS")
                .unwrap_or_else(|_| "0.0.0.0:8080".to_string()),
            jwt_secret: require("JWT_SECRET")?,
            billing_webhook_secret: require("BILLING_WEBHOOK_SECRET")?,
            allowed_origins: std::env::var("ALLOWED_ORIGINS")
                .unwrap_or_else(|_| "http://localhost:3000".to_string()),
            internal_api_token: require("INTERNAL_API_TOKEN")?,
        })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use serial_test::serial;

    fn set_required_env() {
        std::env::set_var("DATABASE_URL", "postgres://localhost/scribe_test");
        std::env::set_var("JWT_SECRET", "test-secret");
        std::env::set_var("BILLING_WEBHOOK_SECRET", "whsec_test");
        std::env::set_var("INTERNAL_API_TOKEN", "internal-test-token");
    }

    #[test]
    #[serial]
    fn defaults_apply_for_optional_vars() {
        set_required_env();
        std::env::remove_var("BIND_ADDRESS");
        std::env::remove_var("ALLOWED_ORIGINS");

        let config = Config::from_env().unwrap();
        assert_eq!(config.bind_address, "0.0.0.0:8080");
        assert_eq!(config.allowed_origins, "http://localhost:3000");
    }

    #[test]
    #[serial]
    fn missing_required_var_fails() {
        set_required_env();
        std::env::remove_var("JWT_SECRET");
        assert!(Config::from_env().is_err());
        std::env::set_var("JWT_SECRET", "test-secret");
    }
}
