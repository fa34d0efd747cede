//! Channel authorizer that keeps user channels private.
//!
//! A `user:<id>` channel carries notifications and presence meant for one
//! person, so only that user may subscribe to it. Every other channel is
//! handed to an optional inner authorizer (membership checks in real
//! deployments) or allowed when none is configured.

use std::sync::Arc;

use async_trait::async_trait;

use crate::domain::foundation::UserId;
use crate::domain::live::ChannelKind;
use crate::ports::ChannelAuthorizer;

#[derive(Clone, Default)]
pub struct UserChannelGuard {
    inner: Option<Arc<dyn ChannelAuthorizer>>,
}

impl UserChannelGuard {
    /// Guard that allows every non-user channel.
    pub fn new() -> Self {
        Self::default()
    }

    /// Guard that delegates non-user channels to `inner`.
    pub fn wrapping(inner: Arc<dyn ChannelAuthorizer>) -> Self {
        Self { inner: Some(inner) }
    }
}

#[async_trait]
impl ChannelAuthorizer for UserChannelGuard {
    async fn can_access_channel(&self, user_id: &UserId, channel: &str) -> bool {
        if let ChannelKind::User(owner) = ChannelKind::parse(channel) {
            return owner == user_id.as_str();
        }
        match &self.inner {
            Some(inner) => inner.can_access_channel(user_id, channel).await,
            None => true,
        }
    }
}

impl std::fmt::Debug for UserChannelGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UserChannelGuard")
            .field("delegates", &self.inner.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::auth::MockChannelAuthorizer;

    fn alice() -> UserId {
        UserId::new("alice").unwrap()
    }

    #[tokio::test]
    async fn other_users_channels_are_denied() {
        let guard = UserChannelGuard::new();
        assert!(guard.can_access_channel(&alice(), "user:alice").await);
        assert!(!guard.can_access_channel(&alice(), "user:bob").await);
    }

    #[tokio::test]
    async fn non_user_channels_are_allowed_without_inner() {
        let guard = UserChannelGuard::new();
        assert!(guard.can_access_channel(&alice(), "space:abc").await);
        assert!(guard.can_access_channel(&alice(), "global").await);
    }

    #[tokio::test]
    async fn non_user_channels_are_delegated() {
        let inner = Arc::new(MockChannelAuthorizer::new().with_grant("alice", "conv:1"));
        let guard = UserChannelGuard::wrapping(inner);

        assert!(guard.can_access_channel(&alice(), "conv:1").await);
        assert!(!guard.can_access_channel(&alice(), "conv:2").await);
        // The inner authorizer is never asked about user channels.
        assert!(guard.can_access_channel(&alice(), "user:alice").await);
    }
}
