//! WebSocket message protocol.
//!
//! - Server → Client: events, acks, errors, pongs
//! - Client → Server: subscribe, unsubscribe, ping, typing, read
//!
//! Every frame is a JSON object with a `type` discriminator. Several server
//! messages may share one text frame, separated by `\n`.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::domain::foundation::{ConnectionId, Timestamp};
use crate::domain::live::{Event, Payload};

// ============================================
// Server → Client Messages
// ============================================

/// Kind of a server message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ServerMessageType {
    Event,
    Ack,
    Error,
    Pong,
}

/// Message sent from server to client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerMessage {
    #[serde(rename = "type")]
    pub kind: ServerMessageType,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channel: Option<String>,

    /// Event type for `event` frames.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub event: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<Value>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,

    pub timestamp: Timestamp,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ServerMessage {
    fn new(kind: ServerMessageType) -> Self {
        Self {
            kind,
            channel: None,
            event: None,
            payload: None,
            id: None,
            timestamp: Timestamp::now(),
            error: None,
        }
    }

    /// Event delivery frame. Carries the event's own id and timestamp.
    pub fn event(event: &Event) -> Self {
        Self {
            channel: Some(event.channel().to_string()),
            event: Some(event.event_type().to_string()),
            payload: Some(Value::Object(event.payload().clone())),
            id: Some(event.id().to_string()),
            timestamp: event.timestamp(),
            ..Self::new(ServerMessageType::Event)
        }
    }

    pub fn ack(id: Option<String>, message: impl Into<String>) -> Self {
        let mut payload = Payload::new();
        payload.insert("message".to_string(), Value::String(message.into()));
        Self {
            payload: Some(Value::Object(payload)),
            id,
            ..Self::new(ServerMessageType::Ack)
        }
    }

    pub fn error(id: Option<String>, error: impl Into<String>) -> Self {
        Self {
            id,
            error: Some(error.into()),
            ..Self::new(ServerMessageType::Error)
        }
    }

    pub fn pong(id: Option<String>) -> Self {
        Self {
            id,
            ..Self::new(ServerMessageType::Pong)
        }
    }

    /// First message on every accepted connection.
    pub fn welcome(client_id: &ConnectionId, user_channel: &str) -> Self {
        let payload = serde_json::json!({
            "message": "Connected successfully",
            "client_id": client_id.to_string(),
            "subscriptions": [user_channel],
        });
        Self {
            payload: Some(payload),
            ..Self::new(ServerMessageType::Ack)
        }
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

// ============================================
// Client → Server Messages
// ============================================

/// Message received from a client.
///
/// `type` is kept as a raw string so unknown types can be echoed back in
/// the error reply rather than failing to parse.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ClientMessage {
    #[serde(rename = "type", default)]
    pub kind: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channel: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<Payload>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
}

/// What a client message asks for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientAction {
    Subscribe,
    Unsubscribe,
    Ping,
    Typing,
    Read,
    Unknown,
}

impl ClientMessage {
    pub fn parse(raw: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(raw)
    }

    pub fn action(&self) -> ClientAction {
        match self.kind.as_str() {
            "subscribe" => ClientAction::Subscribe,
            "unsubscribe" => ClientAction::Unsubscribe,
            "ping" => ClientAction::Ping,
            "typing" => ClientAction::Typing,
            "read" => ClientAction::Read,
            _ => ClientAction::Unknown,
        }
    }

    /// Channel, treating an empty string as absent.
    pub fn channel(&self) -> Option<&str> {
        self.channel.as_deref().filter(|c| !c.is_empty())
    }

    pub fn payload_field(&self, key: &str) -> Option<&Value> {
        self.payload.as_ref().and_then(|p| p.get(key))
    }
}

// ============================================
// Error strings sent to clients
// ============================================

pub(crate) mod errors {
    pub const INVALID_FORMAT: &str = "Invalid message format";
    pub const SUBSCRIBE_CHANNEL_REQUIRED: &str = "Channel is required for subscription";
    pub const UNSUBSCRIBE_CHANNEL_REQUIRED: &str = "Channel is required for unsubscription";
    pub const TYPING_CHANNEL_REQUIRED: &str = "Channel is required for typing indicator";
    pub const READ_CHANNEL_REQUIRED: &str = "Channel is required for read receipt";
    pub const NOT_SUBSCRIBED: &str = "Not subscribed to channel";
    pub const BUS_UNAVAILABLE: &str = "Event bus unavailable";

    pub fn access_denied(channel: &str) -> String {
        format!("Access denied to channel: {}", channel)
    }

    pub fn unknown_type(kind: &str) -> String {
        format!("Unknown message type: {}", kind)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::live::event_types;

    #[test]
    fn event_frame_carries_event_identity() {
        let mut payload = Payload::new();
        payload.insert("content".to_string(), Value::String("hi".to_string()));
        let event = Event::new(event_types::MESSAGE_CREATED, "conv:1", payload).unwrap();

        let msg = ServerMessage::event(&event);
        let json: Value = serde_json::from_str(&msg.to_json().unwrap()).unwrap();

        assert_eq!(json["type"], "event");
        assert_eq!(json["channel"], "conv:1");
        assert_eq!(json["event"], "message.created");
        assert_eq!(json["payload"]["content"], "hi");
        assert_eq!(json["id"], event.id().to_string());
        assert_eq!(json["timestamp"], serde_json::to_value(event.timestamp()).unwrap());
    }

    #[test]
    fn error_frame_omits_empty_fields() {
        let msg = ServerMessage::error(Some("m1".to_string()), errors::INVALID_FORMAT);
        let json: Value = serde_json::from_str(&msg.to_json().unwrap()).unwrap();

        assert_eq!(json["type"], "error");
        assert_eq!(json["error"], "Invalid message format");
        assert_eq!(json["id"], "m1");
        assert!(json.get("channel").is_none());
        assert!(json.get("payload").is_none());
    }

    #[test]
    fn welcome_lists_own_user_channel() {
        let id = ConnectionId::new();
        let msg = ServerMessage::welcome(&id, "user:alice");
        let json: Value = serde_json::from_str(&msg.to_json().unwrap()).unwrap();

        assert_eq!(json["type"], "ack");
        assert_eq!(json["payload"]["message"], "Connected successfully");
        assert_eq!(json["payload"]["client_id"], id.to_string());
        assert_eq!(json["payload"]["subscriptions"][0], "user:alice");
    }

    #[test]
    fn ack_wraps_message_in_payload() {
        let msg = ServerMessage::ack(Some("7".to_string()), "Subscribed to conv:1");
        assert_eq!(msg.kind, ServerMessageType::Ack);
        assert_eq!(
            msg.payload,
            Some(serde_json::json!({"message": "Subscribed to conv:1"}))
        );
    }

    #[test]
    fn client_message_parses_known_actions() {
        let msg = ClientMessage::parse(r#"{"type":"subscribe","channel":"conv:1","id":"a"}"#).unwrap();
        assert_eq!(msg.action(), ClientAction::Subscribe);
        assert_eq!(msg.channel(), Some("conv:1"));
        assert_eq!(msg.id.as_deref(), Some("a"));

        let msg = ClientMessage::parse(r#"{"type":"ping"}"#).unwrap();
        assert_eq!(msg.action(), ClientAction::Ping);
    }

    #[test]
    fn client_message_keeps_unknown_type() {
        let msg = ClientMessage::parse(r#"{"type":"shout"}"#).unwrap();
        assert_eq!(msg.action(), ClientAction::Unknown);
        assert_eq!(errors::unknown_type(&msg.kind), "Unknown message type: shout");
    }

    #[test]
    fn empty_channel_counts_as_missing() {
        let msg = ClientMessage::parse(r#"{"type":"subscribe","channel":""}"#).unwrap();
        assert_eq!(msg.channel(), None);
    }

    #[test]
    fn malformed_client_message_is_rejected() {
        assert!(ClientMessage::parse("not json").is_err());
        assert!(ClientMessage::parse(r#"{"type":"typing","payload":"x"}"#).is_err());
    }
}
