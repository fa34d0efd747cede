//! Token verification port.
//!
//! Token issuance and the identity provider live outside this service; the
//! live layer only needs to turn a bearer token into a user id before it
//! accepts a WebSocket upgrade.

use async_trait::async_trait;

use crate::domain::foundation::{AuthError, UserId};

/// Verifies access tokens and extracts the user they were issued to.
///
/// # Contract
///
/// Implementations must:
/// - Return `AuthError::InvalidToken` for malformed or badly signed tokens
/// - Return `AuthError::TokenExpired` for expired tokens
/// - Return `AuthError::ServiceUnavailable` for transient errors
#[async_trait]
pub trait TokenVerifier: Send + Sync {
    /// Verify a raw token (without the "Bearer " prefix).
    async fn verify(&self, token: &str) -> Result<UserId, AuthError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    // Compile-time check that trait is object-safe
    #[allow(dead_code)]
    fn assert_object_safe(_: &dyn TokenVerifier) {}

    struct FixedVerifier;

    #[async_trait]
    impl TokenVerifier for FixedVerifier {
        async fn verify(&self, token: &str) -> Result<UserId, AuthError> {
            if token == "good" {
                UserId::new("user-1").map_err(|_| AuthError::InvalidToken)
            } else {
                Err(AuthError::InvalidToken)
            }
        }
    }

    #[tokio::test]
    async fn trait_object_dispatch_works() {
        let verifier: Box<dyn TokenVerifier> = Box::new(FixedVerifier);
        assert_eq!(verifier.verify("good").await.unwrap().as_str(), "user-1");
        assert_eq!(verifier.verify("bad").await, Err(AuthError::InvalidToken));
    }
}
