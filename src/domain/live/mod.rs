//! Live domain - events and the channels they are addressed to.

pub mod channel;
pub mod event_types;

mod event;

pub use channel::ChannelKind;
pub use event::{Event, Payload};
