//! Foundation module - Shared domain primitives.
//!
//! Contains value objects, identifiers and error types that form the
//! vocabulary of the live fan-out domain.

mod auth;
mod errors;
mod ids;
mod timestamp;

pub use auth::AuthError;
pub use errors::ValidationError;
pub use ids::{
    CalendarEventId, CommentId, ConnectionId, ConversationId, EventId, LessonId, MessageId,
    NotificationId, PostId, SpaceId, UserId,
};
pub use timestamp::Timestamp;
