//! User token verification.
//!
//! User-facing endpoints require an `Authorization: Bearer <jwt>` header
//! signed with the issuer-managed HS256 secret. The lab callback
//! endpoint uses per-runtime shared secrets instead and is handled in
//! its route.

use axum::http::HeaderMap;
use jsonwebtoken::{decode, Algorithm, DecodingKey, Validation};
use serde::{Deserialize, Serialize};

use quern_core::config::JwtSecrets;

use crate::error::ApiError;

/// Claims carried by a user bearer token.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserClaims {
    /// The user the token was issued to.
    pub sub: String,
    /// Expiry, seconds since the epoch.
    pub exp: i64,
    /// Groups the user belongs to.
    #[serde(default)]
    pub groups: Vec<String>,
}

/// Verifies user bearer tokens.
#[derive(Debug, Clone)]
pub struct UserTokenVerifier {
    secret: String,
    issuer: Option<String>,
}

impl UserTokenVerifier {
    /// Creates a verifier from the configured signing secrets.
    #[must_use]
    pub fn new(secrets: &JwtSecrets) -> Self {
        Self {
            secret: secrets.secret.clone(),
            issuer: secrets.issuer.clone(),
        }
    }

    /// Verifies a raw token and returns its claims.
    ///
    /// # Errors
    ///
    /// Returns `Unauthorized` on any signature, expiry or claim failure.
    pub fn verify(&self, token: &str) -> Result<UserClaims, ApiError> {
        if self.secret.is_empty() {
            tracing::error!("user auth is enabled but no signing secret is configured");
            return Err(ApiError::Unauthorized);
        }

        let mut validation = Validation::new(Algorithm::HS256);
        validation.set_required_spec_claims(&["exp"]);
        if let Some(issuer) = self.issuer.as_deref() {
            validation.set_issuer(&[issuer]);
            validation.required_spec_claims.insert("iss".to_string());
        }

        decode::<UserClaims>(
            token,
            &DecodingKey::from_secret(self.secret.as_bytes()),
            &validation,
        )
        .map(|data| data.claims)
        .map_err(|_| ApiError::Unauthorized)
    }

    /// Extracts and verifies the bearer token from request headers.
    ///
    /// # Errors
    ///
    /// Returns `Unauthorized` when the header is missing or invalid.
    pub fn verify_headers(&self, headers: &HeaderMap) -> Result<UserClaims, ApiError> {
        let token = bearer_token(headers).ok_or(ApiError::Unauthorized)?;
        self.verify(token)
    }
}

/// Returns the bearer token from an `Authorization` header, if any.
#[must_use]
pub fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(axum::http::header::AUTHORIZATION)?
        .to_str()
        .ok()?
        .strip_prefix("Bearer ")
        .map(str::trim)
}

/// Returns the raw shared secret from an `Authorization` header.
///
/// Labs present their secret either bare or with a `Bearer`/`Token`
/// prefix.
#[must_use]
pub fn shared_secret(headers: &HeaderMap) -> Option<&str> {
    let raw = headers
        .get(axum::http::header::AUTHORIZATION)?
        .to_str()
        .ok()?
        .trim();
    let token = raw
        .strip_prefix("Bearer ")
        .or_else(|| raw.strip_prefix("Token "))
        .unwrap_or(raw);
    (!token.is_empty()).then_some(token.trim())
}
