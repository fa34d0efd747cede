//! Domain layer - pure value objects with no I/O.
//!
//! - `foundation` - identifiers, timestamps, shared errors
//! - `live` - bus events and channel naming

pub mod foundation;
pub mod live;
