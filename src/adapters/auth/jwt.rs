//! Shared-secret JWT token verifier.
//!
//! Verifies HS256 access tokens signed with the platform's token secret and
//! returns the user they were issued to.
//!
//! # Security
//!
//! - Signature and `exp` are always validated
//! - The user comes from `sub`, falling back to a `user_id` claim
//! - The secret is held as a `SecretString` and never logged

use async_trait::async_trait;
use jsonwebtoken::{decode, errors::ErrorKind, Algorithm, DecodingKey, Validation};
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;

use crate::domain::foundation::{AuthError, UserId};
use crate::ports::TokenVerifier;

/// Claims read from the access token.
#[derive(Debug, Deserialize)]
struct AccessClaims {
    #[serde(default)]
    sub: Option<String>,

    #[serde(default)]
    user_id: Option<String>,

    #[allow(dead_code)]
    exp: i64,
}

/// HS256 verifier backed by the shared token secret.
pub struct JwtTokenVerifier {
    key: DecodingKey,
    validation: Validation,
}

impl JwtTokenVerifier {
    pub fn new(secret: &SecretString) -> Self {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.validate_exp = true;
        validation.set_required_spec_claims(&["exp"]);

        Self {
            key: DecodingKey::from_secret(secret.expose_secret().as_bytes()),
            validation,
        }
    }

    /// Tolerated clock skew when checking `exp`.
    pub fn with_leeway(mut self, seconds: u64) -> Self {
        self.validation.leeway = seconds;
        self
    }
}

#[async_trait]
impl TokenVerifier for JwtTokenVerifier {
    async fn verify(&self, token: &str) -> Result<UserId, AuthError> {
        let data = decode::<AccessClaims>(token, &self.key, &self.validation).map_err(|e| {
            match e.kind() {
                ErrorKind::ExpiredSignature => {
                    tracing::debug!("Token expired");
                    AuthError::TokenExpired
                }
                _ => {
                    tracing::debug!("Token validation failed: {}", e);
                    AuthError::InvalidToken
                }
            }
        })?;

        let claims = data.claims;
        let subject = claims
            .sub
            .filter(|sub| !sub.is_empty())
            .or(claims.user_id)
            .ok_or_else(|| {
                tracing::warn!("Token has neither sub nor user_id claim");
                AuthError::InvalidToken
            })?;

        UserId::new(subject).map_err(|_| AuthError::InvalidToken)
    }
}

impl std::fmt::Debug for JwtTokenVerifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JwtTokenVerifier")
            .field("algorithm", &Algorithm::HS256)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use jsonwebtoken::{encode, EncodingKey, Header};
    use serde_json::json;

    const SECRET: &str = "test-secret-that-is-at-least-32-chars-long";

    fn verifier() -> JwtTokenVerifier {
        JwtTokenVerifier::new(&SecretString::new(SECRET.to_string()))
    }

    fn sign(claims: serde_json::Value, secret: &str) -> String {
        encode(
            &Header::new(Algorithm::HS256),
            &claims,
            &EncodingKey::from_secret(secret.as_bytes()),
        )
        .unwrap()
    }

    fn in_one_hour() -> i64 {
        chrono::Utc::now().timestamp() + 3600
    }

    #[tokio::test]
    async fn valid_token_yields_subject() {
        let token = sign(json!({"sub": "user-1", "exp": in_one_hour()}), SECRET);
        assert_eq!(verifier().verify(&token).await.unwrap().as_str(), "user-1");
    }

    #[tokio::test]
    async fn user_id_claim_is_accepted_without_sub() {
        let token = sign(json!({"user_id": "user-2", "exp": in_one_hour()}), SECRET);
        assert_eq!(verifier().verify(&token).await.unwrap().as_str(), "user-2");
    }

    #[tokio::test]
    async fn expired_token_is_reported_as_expired() {
        let exp = chrono::Utc::now().timestamp() - 3600;
        let token = sign(json!({"sub": "user-1", "exp": exp}), SECRET);
        assert_eq!(verifier().verify(&token).await, Err(AuthError::TokenExpired));
    }

    #[tokio::test]
    async fn wrong_secret_is_invalid() {
        let token = sign(
            json!({"sub": "user-1", "exp": in_one_hour()}),
            "another-secret-that-is-also-32-chars-long",
        );
        assert_eq!(verifier().verify(&token).await, Err(AuthError::InvalidToken));
    }

    #[tokio::test]
    async fn token_without_subject_is_invalid() {
        let token = sign(json!({"exp": in_one_hour()}), SECRET);
        assert_eq!(verifier().verify(&token).await, Err(AuthError::InvalidToken));
    }

    #[tokio::test]
    async fn garbage_is_invalid() {
        assert_eq!(
            verifier().verify("not.a.jwt").await,
            Err(AuthError::InvalidToken)
        );
    }

    #[test]
    fn debug_does_not_leak_secret() {
        let debug = format!("{:?}", verifier());
        assert!(!debug.contains(SECRET));
    }
}
