//! Mock authentication adapters for testing.
//!
//! These adapters implement the `TokenVerifier` and `ChannelAuthorizer`
//! ports for use in tests, avoiding the need for a signing secret or a
//! membership service.
//!
//! # Example
//!
//! ```ignore
//! use connect_live::adapters::auth::MockTokenVerifier;
//!
//! let verifier = MockTokenVerifier::new().with_user("valid-token", "user-123");
//! let user_id = verifier.verify("valid-token").await?;
//! ```

use std::collections::{HashMap, HashSet};

use async_trait::async_trait;
use parking_lot::RwLock;

use crate::domain::foundation::{AuthError, UserId};
use crate::ports::{ChannelAuthorizer, TokenVerifier};

/// Mock token verifier for testing.
///
/// Stores a map of tokens to users. Tokens not in the map return `InvalidToken`.
#[derive(Debug, Default)]
pub struct MockTokenVerifier {
    /// Map of valid tokens to their associated users
    tokens: RwLock<HashMap<String, UserId>>,
    /// Optional error to return for all verifications (for error testing)
    force_error: RwLock<Option<AuthError>>,
}

impl MockTokenVerifier {
    /// Creates a new empty mock verifier.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a valid token that maps to a user.
    ///
    /// Invalid user ids are ignored, so the token stays unknown.
    pub fn with_user(self, token: impl Into<String>, user_id: impl Into<String>) -> Self {
        self.add_token(token, user_id);
        self
    }

    /// Forces all verifications to return the specified error.
    pub fn with_error(self, error: AuthError) -> Self {
        *self.force_error.write() = Some(error);
        self
    }

    /// Clears the forced error and returns to normal operation.
    pub fn clear_error(&self) {
        *self.force_error.write() = None;
    }

    /// Registers a new valid token at runtime.
    pub fn add_token(&self, token: impl Into<String>, user_id: impl Into<String>) {
        if let Ok(user_id) = UserId::new(user_id) {
            self.tokens.write().insert(token.into(), user_id);
        }
    }

    /// Removes a token, making it invalid.
    pub fn remove_token(&self, token: &str) {
        self.tokens.write().remove(token);
    }

    /// Returns the number of registered valid tokens.
    pub fn token_count(&self) -> usize {
        self.tokens.read().len()
    }
}

#[async_trait]
impl TokenVerifier for MockTokenVerifier {
    async fn verify(&self, token: &str) -> Result<UserId, AuthError> {
        if let Some(error) = self.force_error.read().clone() {
            return Err(error);
        }

        self.tokens
            .read()
            .get(token)
            .cloned()
            .ok_or(AuthError::InvalidToken)
    }
}

/// Mock channel authorizer with an explicit grant list.
///
/// Every `(user, channel)` pair not granted is denied.
#[derive(Debug, Default)]
pub struct MockChannelAuthorizer {
    grants: RwLock<HashSet<(String, String)>>,
}

impl MockChannelAuthorizer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_grant(self, user_id: impl Into<String>, channel: impl Into<String>) -> Self {
        self.grant(user_id, channel);
        self
    }

    pub fn grant(&self, user_id: impl Into<String>, channel: impl Into<String>) {
        self.grants.write().insert((user_id.into(), channel.into()));
    }

    pub fn revoke(&self, user_id: &str, channel: &str) {
        self.grants
            .write()
            .remove(&(user_id.to_string(), channel.to_string()));
    }
}

#[async_trait]
impl ChannelAuthorizer for MockChannelAuthorizer {
    async fn can_access_channel(&self, user_id: &UserId, channel: &str) -> bool {
        self.grants
            .read()
            .contains(&(user_id.as_str().to_string(), channel.to_string()))
    }
}
