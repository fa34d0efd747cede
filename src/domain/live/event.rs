//! The bus event value object.
//!
//! An [`Event`] is the unit of communication on the event bus: a typed,
//! timestamped fact addressed to exactly one channel. Events are built once
//! (optionally decorated with the `with_*` builders) and never mutated
//! after they are handed to a bus.
//!
//! # Wire format
//!
//! ```json
//! {
//!   "id": "6f1c…",
//!   "type": "message.created",
//!   "channel": "conv:2a9e…",
//!   "payload": { "text": "hi" },
//!   "timestamp": "2024-03-01T12:30:05Z",
//!   "user_id": null,
//!   "space_id": null,
//!   "metadata": {}
//! }
//! ```
//!
//! Decoding is lenient about `null` collections but strict about the
//! channel: an event without a channel is rejected.

use std::collections::HashMap;

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};

use crate::domain::foundation::{EventId, SpaceId, Timestamp, UserId, ValidationError};

/// Arbitrary JSON object carried by an event.
pub type Payload = Map<String, Value>;

/// Immutable, channel-addressed domain event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "EventRecord")]
pub struct Event {
    id: EventId,
    #[serde(rename = "type")]
    event_type: String,
    channel: String,
    payload: Payload,
    timestamp: Timestamp,
    user_id: Option<UserId>,
    space_id: Option<SpaceId>,
    metadata: HashMap<String, String>,
}

impl Event {
    /// Creates a new event with a fresh id and the current time.
    ///
    /// # Errors
    ///
    /// Returns `ValidationError::EmptyField` if `channel` or `event_type`
    /// is empty.
    pub fn new(
        event_type: impl Into<String>,
        channel: impl Into<String>,
        payload: Payload,
    ) -> Result<Self, ValidationError> {
        let event_type = event_type.into();
        let channel = channel.into();

        if channel.trim().is_empty() {
            return Err(ValidationError::empty_field("channel"));
        }
        if event_type.trim().is_empty() {
            return Err(ValidationError::empty_field("type"));
        }

        Ok(Self {
            id: EventId::new(),
            event_type,
            channel,
            payload,
            timestamp: Timestamp::now(),
            user_id: None,
            space_id: None,
            metadata: HashMap::new(),
        })
    }

    /// Targets the event at a single user's sessions.
    pub fn with_user_id(mut self, user_id: UserId) -> Self {
        self.user_id = Some(user_id);
        self
    }

    /// Tags the event with the space it happened in.
    pub fn with_space_id(mut self, space_id: SpaceId) -> Self {
        self.space_id = Some(space_id);
        self
    }

    /// Adds a metadata entry.
    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    pub fn id(&self) -> EventId {
        self.id
    }

    pub fn event_type(&self) -> &str {
        &self.event_type
    }

    pub fn channel(&self) -> &str {
        &self.channel
    }

    pub fn payload(&self) -> &Payload {
        &self.payload
    }

    pub fn timestamp(&self) -> Timestamp {
        self.timestamp
    }

    pub fn user_id(&self) -> Option<&UserId> {
        self.user_id.as_ref()
    }

    pub fn space_id(&self) -> Option<SpaceId> {
        self.space_id
    }

    pub fn metadata(&self) -> &HashMap<String, String> {
        &self.metadata
    }

    /// Serializes the event to its JSON wire form.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// Decodes an event from its JSON wire form.
    pub fn from_json(raw: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(raw)
    }
}

/// Unvalidated decoding target for [`Event`].
#[derive(Deserialize)]
struct EventRecord {
    id: EventId,
    #[serde(rename = "type")]
    event_type: String,
    channel: String,
    #[serde(default, deserialize_with = "null_as_default")]
    payload: Payload,
    timestamp: Timestamp,
    #[serde(default)]
    user_id: Option<UserId>,
    #[serde(default)]
    space_id: Option<SpaceId>,
    #[serde(default, deserialize_with = "null_as_default")]
    metadata: HashMap<String, String>,
}

impl TryFrom<EventRecord> for Event {
    type Error = ValidationError;

    fn try_from(record: EventRecord) -> Result<Self, Self::Error> {
        if record.channel.trim().is_empty() {
            return Err(ValidationError::empty_field("channel"));
        }
        Ok(Self {
            id: record.id,
            event_type: record.event_type,
            channel: record.channel,
            payload: record.payload,
            timestamp: record.timestamp,
            user_id: record.user_id,
            space_id: record.space_id,
            metadata: record.metadata,
        })
    }
}

fn null_as_default<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}
