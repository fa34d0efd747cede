//! Channel authorization port.
//!
//! Decides whether a user may subscribe to a channel other than their own
//! user channel (which is always allowed and never consults this port).
//! Real deployments back this with space and conversation membership.

use async_trait::async_trait;

use crate::domain::foundation::UserId;

/// Subscription permission check.
#[async_trait]
pub trait ChannelAuthorizer: Send + Sync {
    /// Returns true if `user_id` may receive events published to `channel`.
    async fn can_access_channel(&self, user_id: &UserId, channel: &str) -> bool;
}
