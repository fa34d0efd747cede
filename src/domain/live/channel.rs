//! Channel naming.
//!
//! Channels are plain strings of the form `<prefix>:<id>`. The prefixes are
//! shared with publishers in other processes and must be reproduced exactly.
//!
//! | Channel            | Audience                                  |
//! |--------------------|-------------------------------------------|
//! | `user:<id>`        | every session of one user                 |
//! | `space:<uuid>`     | members of a space                        |
//! | `conv:<uuid>`      | participants of a conversation            |
//! | `post:<uuid>`      | viewers of a post                         |
//! | `event:<uuid>`     | attendees of a calendar event             |

use crate::domain::foundation::{CalendarEventId, ConversationId, PostId, SpaceId, UserId};

pub const USER_PREFIX: &str = "user:";
pub const SPACE_PREFIX: &str = "space:";
pub const CONVERSATION_PREFIX: &str = "conv:";
pub const POST_PREFIX: &str = "post:";
pub const EVENT_PREFIX: &str = "event:";

/// Channel addressing a single user's sessions.
pub fn user(user_id: &UserId) -> String {
    format!("{}{}", USER_PREFIX, user_id)
}

/// Channel for activity inside a space.
pub fn space(space_id: &SpaceId) -> String {
    format!("{}{}", SPACE_PREFIX, space_id)
}

/// Channel for a conversation's messages and typing indicators.
pub fn conversation(conversation_id: &ConversationId) -> String {
    format!("{}{}", CONVERSATION_PREFIX, conversation_id)
}

/// Channel for a single post's likes and comments.
pub fn post(post_id: &PostId) -> String {
    format!("{}{}", POST_PREFIX, post_id)
}

/// Channel for a calendar event.
pub fn event(event_id: &CalendarEventId) -> String {
    format!("{}{}", EVENT_PREFIX, event_id)
}

/// Classification of a channel name by its prefix.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelKind<'a> {
    User(&'a str),
    Space(&'a str),
    Conversation(&'a str),
    Post(&'a str),
    Event(&'a str),
    Other,
}

impl<'a> ChannelKind<'a> {
    /// Splits a channel into its kind and id part.
    ///
    /// Channels with a known prefix but no id are classified as `Other`.
    pub fn parse(channel: &'a str) -> Self {
        let table: [(&str, fn(&'a str) -> ChannelKind<'a>); 5] = [
            (USER_PREFIX, ChannelKind::User),
            (SPACE_PREFIX, ChannelKind::Space),
            (CONVERSATION_PREFIX, ChannelKind::Conversation),
            (POST_PREFIX, ChannelKind::Post),
            (EVENT_PREFIX, ChannelKind::Event),
        ];

        table
            .iter()
            .find_map(|(prefix, make)| {
                channel
                    .strip_prefix(prefix)
                    .filter(|id| !id.is_empty())
                    .map(|id| make(id))
            })
            .unwrap_or(ChannelKind::Other)
    }
}

/// True when `channel` is the personal channel of `user_id`.
pub fn is_own_user_channel(user_id: &UserId, channel: &str) -> bool {
    matches!(ChannelKind::parse(channel), ChannelKind::User(id) if id == user_id.as_str())
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    #[test]
    fn helpers_use_stable_prefixes() {
        let uuid = Uuid::parse_str("6f1c1c1e-0000-4000-8000-000000000001").unwrap();
        assert_eq!(
            space(&SpaceId::from_uuid(uuid)),
            "space:6f1c1c1e-0000-4000-8000-000000000001"
        );
        assert_eq!(
            conversation(&ConversationId::from_uuid(uuid)),
            "conv:6f1c1c1e-0000-4000-8000-000000000001"
        );
        assert_eq!(
            post(&PostId::from_uuid(uuid)),
            "post:6f1c1c1e-0000-4000-8000-000000000001"
        );
        assert_eq!(
            event(&CalendarEventId::from_uuid(uuid)),
            "event:6f1c1c1e-0000-4000-8000-000000000001"
        );
        assert_eq!(user(&UserId::new("alice").unwrap()), "user:alice");
    }

    #[test]
    fn parse_classifies_known_prefixes() {
        assert_eq!(ChannelKind::parse("user:42"), ChannelKind::User("42"));
        assert_eq!(ChannelKind::parse("conv:abc"), ChannelKind::Conversation("abc"));
        assert_eq!(ChannelKind::parse("space:s"), ChannelKind::Space("s"));
        assert_eq!(ChannelKind::parse("post:p"), ChannelKind::Post("p"));
        assert_eq!(ChannelKind::parse("event:e"), ChannelKind::Event("e"));
    }

    #[test]
    fn parse_treats_bare_prefix_as_other() {
        assert_eq!(ChannelKind::parse("user:"), ChannelKind::Other);
        assert_eq!(ChannelKind::parse("global"), ChannelKind::Other);
    }

    #[test]
    fn own_user_channel_detection() {
        let alice = UserId::new("alice").unwrap();
        assert!(is_own_user_channel(&alice, "user:alice"));
        assert!(!is_own_user_channel(&alice, "user:bob"));
        assert!(!is_own_user_channel(&alice, "conv:alice"));
    }
}
