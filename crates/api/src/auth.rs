//! Authentication middleware.
//!
//! Verifies HS256 bearer tokens issued by the identity service and attaches
//! the authenticated account to the request. Token issuance, password
//! handling, and session management live outside this server.

use axum::{
    extract::{Request, State},
    http::header::AUTHORIZATION,
    middleware::Next,
    response::{IntoResponse, Response},
};
use jsonwebtoken::{decode, DecodingKey, Validation};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::ApiError;

/// JWT claims the identity service signs.
#[derive(Debug, Serialize, Deserialize)]
pub struct Claims {
    /// Account id.
    pub sub: String,
    pub exp: i64,
    pub iat: i64,
}

/// Authenticated account extracted from the bearer token.
#[derive(Debug, Clone)]
pub struct AuthUser {
    pub account_id: Uuid,
}

/// Token verifier shared through app state.
#[derive(Clone)]
pub struct JwtVerifier {
    decoding_key: DecodingKey,
    validation: Validation,
}

impl JwtVerifier {
    pub fn new(secret: &str) -> Self {
        Self {
            decoding_key: DecodingKey::from_secret(secret.as_bytes()),
            validation: Validation::default(),
        }
    }

    pub fn verify(&self, token: &str) -> Result<AuthUser, ApiError> {
        let data = decode::<Claims>(token, &self.decoding_key, &self.validation)
            .map_err(|_| ApiError::Unauthorized)?;

        let account_id =
            Uuid::parse_str(&data.claims.sub).map_err(|_| ApiError::Unauthorized)?;

        Ok(AuthUser { account_id })
    }
}

fn extract_bearer_token(request: &Request) -> Option<&str> {
    request
        .headers()
        .get(AUTHORIZATION)
        .and_then(|h| h.to_str().ok())
        .and_then(|header| header.strip_prefix("Bearer "))
}

/// Middleware that requires a valid bearer token.
pub async fn require_auth(
    State(verifier): State<JwtVerifier>,
    mut request: Request,
    next: Next,
) -> Response {
    let Some(token) = extract_bearer_token(&request) else {
        return ApiError::Unauthorized.into_response();
    };

    match verifier.verify(token) {
        Ok(user) => {
            request.extensions_mut().insert(user);
            next.run(request).await
        }
        Err(e) => e.into_response(),
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use jsonwebtoken::{encode, EncodingKey, Header};
    use time::OffsetDateTime;

    fn token_for(secret: &str, sub: &str, ttl_secs: i64) -> String {
        let now = OffsetDateTime::now_utc().unix_timestamp();
        let claims = Claims {
            sub: sub.to_string(),
            exp: now + ttl_secs,
            iat: now,
        };
        encode(
            &Header::default(),
            &claims,
            &EncodingKey::from_secret(secret.as_bytes()),
        )
        .unwrap()
    }

    #[test]
    fn valid_token_yields_account() {
        let account_id = Uuid::new_v4();
        let verifier = JwtVerifier::new("secret");
        let token = token_for("secret", &account_id.to_string(), 3600);

        let user = verifier.verify(&token).unwrap();
        assert_eq!(user.account_id, account_id);
    }

    #[test]
    fn wrong_secret_rejected() {
        let verifier = JwtVerifier::new("secret");
        let token = token_for("other-secret", &Uuid::new_v4().to_string(), 3600);
        assert!(verifier.verify(&token).is_err());
    }

    #[test]
    fn expired_token_rejected() {
        let verifier = JwtVerifier::new("secret");
        let token = token_for("secret", &Uuid::new_v4().to_string(), -3600);
        assert!(verifier.verify(&token).is_err());
    }

    #[test]
    fn non_uuid_subject_rejected() {
        let verifier = JwtVerifier::new("secret");
        let token = token_for("secret", "user-42", 3600);
        assert!(verifier.verify(&token).is_err());
    }
}
