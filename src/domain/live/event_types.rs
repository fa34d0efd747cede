//! Well-known event type names.
//!
//! Types are dot-namespaced (`<resource>.<action>`). Publishers in other
//! processes match on these exact strings, so they must never change.

// Messaging
pub const MESSAGE_CREATED: &str = "message.created";
pub const MESSAGE_DELIVERED: &str = "message.delivered";
pub const MESSAGE_READ: &str = "message.read";
pub const MESSAGE_DELETED: &str = "message.deleted";
pub const TYPING_STARTED: &str = "typing.started";
pub const TYPING_STOPPED: &str = "typing.stopped";
pub const REACTION_ADDED: &str = "reaction.added";
pub const REACTION_REMOVED: &str = "reaction.removed";

// Notifications
pub const NOTIFICATION_CREATED: &str = "notification.created";
pub const NOTIFICATION_READ: &str = "notification.read";
pub const NOTIFICATION_DELETED: &str = "notification.deleted";

// Feed
pub const POST_CREATED: &str = "post.created";
pub const POST_UPDATED: &str = "post.updated";
pub const POST_DELETED: &str = "post.deleted";
pub const POST_LIKED: &str = "post.liked";
pub const POST_UNLIKED: &str = "post.unliked";
pub const COMMENT_CREATED: &str = "comment.created";
pub const COMMENT_UPDATED: &str = "comment.updated";
pub const COMMENT_DELETED: &str = "comment.deleted";

// Spaces
pub const SPACE_UPDATED: &str = "space.updated";
pub const SPACE_MEMBER_JOINED: &str = "space.member.joined";
pub const SPACE_MEMBER_LEFT: &str = "space.member.left";

// Courses
pub const LESSON_PUBLISHED: &str = "lesson.published";
pub const SESSION_STARTED: &str = "session.started";
pub const ASSIGNMENT_GRADED: &str = "assignment.graded";

// Calendar
pub const EVENT_UPDATED: &str = "event.updated";
pub const EVENT_CANCELLED: &str = "event.cancelled";
pub const EVENT_RSVP_ADDED: &str = "event.rsvp.added";

// Presence
pub const USER_ONLINE: &str = "user.online";
pub const USER_OFFLINE: &str = "user.offline";
pub const USER_IDLE: &str = "user.idle";
