//! Per-connection client session.
//!
//! A session is shared between its read loop, its write loop and the
//! connection manager. Everything mutable sits behind a short-lived
//! `parking_lot` lock or an atomic; nothing here is held across an await.
//!
//! ```text
//!   manager ──try_enqueue──► outbound (bounded) ──► write loop ──► socket
//!   socket ──► read loop ──handle_message──► subscriptions / bus / replies
//! ```

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use serde_json::Value;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::domain::foundation::{ConnectionId, SpaceId, Timestamp, UserId};
use crate::domain::live::{channel, event_types, Event, Payload};
use crate::ports::{ChannelAuthorizer, EventBus};

use super::frame::CloseReason;
use super::messages::{errors, ClientAction, ClientMessage, ServerMessage};
use super::metrics::ConnectionMetrics;

/// Receiving half of a session's outbound queue, owned by its write loop.
pub type Outbound = mpsc::Receiver<Arc<str>>;

/// Identity of a new connection, known at upgrade time.
#[derive(Debug, Clone)]
pub struct SessionParams {
    pub user_id: UserId,
    pub space_id: Option<SpaceId>,
    pub ip_address: String,
}

/// Result of a non-blocking enqueue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnqueueOutcome {
    Sent,
    Full,
    Closed,
}

/// Collaborators every session of one manager shares.
pub(crate) struct SessionServices {
    pub authorizer: Arc<dyn ChannelAuthorizer>,
    pub bus: Option<Arc<dyn EventBus>>,
    pub metrics: Arc<ConnectionMetrics>,
}

/// One live client connection.
pub struct ClientSession {
    id: ConnectionId,
    user_id: UserId,
    space_id: Option<SpaceId>,
    ip_address: String,
    user_channel: String,
    connected_at: Timestamp,
    outbound: Mutex<Option<mpsc::Sender<Arc<str>>>>,
    subscriptions: RwLock<HashSet<String>>,
    last_activity: Mutex<Instant>,
    cancel: CancellationToken,
    finished: CancellationToken,
    started: AtomicBool,
    close_reason: Mutex<Option<CloseReason>>,
    services: Arc<SessionServices>,
}

impl ClientSession {
    pub(crate) fn new(
        params: SessionParams,
        outbound: mpsc::Sender<Arc<str>>,
        cancel: CancellationToken,
        services: Arc<SessionServices>,
    ) -> Self {
        let user_channel = channel::user(&params.user_id);
        Self {
            id: ConnectionId::new(),
            user_id: params.user_id,
            space_id: params.space_id,
            ip_address: params.ip_address,
            user_channel,
            connected_at: Timestamp::now(),
            outbound: Mutex::new(Some(outbound)),
            subscriptions: RwLock::new(HashSet::new()),
            last_activity: Mutex::new(Instant::now()),
            cancel,
            finished: CancellationToken::new(),
            started: AtomicBool::new(false),
            close_reason: Mutex::new(None),
            services,
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn user_id(&self) -> &UserId {
        &self.user_id
    }

    pub fn space_id(&self) -> Option<SpaceId> {
        self.space_id
    }

    pub fn ip_address(&self) -> &str {
        &self.ip_address
    }

    /// `user:<id>` for the session owner.
    pub fn user_channel(&self) -> &str {
        &self.user_channel
    }

    pub fn connected_at(&self) -> Timestamp {
        self.connected_at
    }

    pub(crate) fn metrics(&self) -> &ConnectionMetrics {
        &self.services.metrics
    }

    // ════════════════════════════════════════════════════════════════════════
    // Activity
    // ════════════════════════════════════════════════════════════════════════

    pub fn touch(&self) {
        *self.last_activity.lock() = Instant::now();
    }

    pub fn idle_for(&self) -> Duration {
        self.last_activity.lock().elapsed()
    }

    // ════════════════════════════════════════════════════════════════════════
    // Subscriptions
    // ════════════════════════════════════════════════════════════════════════

    pub fn is_subscribed(&self, channel: &str) -> bool {
        self.subscriptions.read().contains(channel)
    }

    /// Current subscriptions, sorted.
    pub fn subscriptions(&self) -> Vec<String> {
        let mut channels: Vec<String> = self.subscriptions.read().iter().cloned().collect();
        channels.sort();
        channels
    }

    pub(crate) fn add_subscription(&self, channel: impl Into<String>) {
        self.subscriptions.write().insert(channel.into());
    }

    fn remove_subscription(&self, channel: &str) {
        self.subscriptions.write().remove(channel);
    }

    // ════════════════════════════════════════════════════════════════════════
    // Outbound queue
    // ════════════════════════════════════════════════════════════════════════

    /// Queues an already-encoded message without waiting.
    ///
    /// A full queue drops the message and counts it; the caller is never
    /// blocked by a slow client.
    pub fn try_enqueue(&self, message: Arc<str>) -> EnqueueOutcome {
        let guard = self.outbound.lock();
        let Some(sender) = guard.as_ref() else {
            return EnqueueOutcome::Closed;
        };
        match sender.try_send(message) {
            Ok(()) => EnqueueOutcome::Sent,
            Err(TrySendError::Full(_)) => {
                drop(guard);
                self.services.metrics.record_dropped();
                tracing::warn!(
                    client_id = %self.id,
                    user_id = %self.user_id,
                    "Outbound queue full, dropping message"
                );
                EnqueueOutcome::Full
            }
            Err(TrySendError::Closed(_)) => EnqueueOutcome::Closed,
        }
    }

    pub fn send(&self, message: &ServerMessage) -> EnqueueOutcome {
        match message.to_json() {
            Ok(json) => self.try_enqueue(Arc::from(json)),
            Err(e) => {
                tracing::error!(client_id = %self.id, error = %e, "Failed to encode server message");
                self.services.metrics.record_error(e.to_string());
                EnqueueOutcome::Closed
            }
        }
    }

    /// Drops the sending half; the write loop drains what is queued, then
    /// sends a close frame. Idempotent.
    pub(crate) fn close_outbound(&self) {
        self.outbound.lock().take();
    }

    pub fn is_outbound_closed(&self) -> bool {
        self.outbound.lock().is_none()
    }

    // ════════════════════════════════════════════════════════════════════════
    // Cancellation
    // ════════════════════════════════════════════════════════════════════════

    /// Forces both loops to exit. The first recorded reason is the one the
    /// write loop sends in its close frame.
    pub fn close_with(&self, reason: CloseReason) {
        {
            let mut slot = self.close_reason.lock();
            if slot.is_none() {
                *slot = Some(reason);
            }
        }
        self.cancel.cancel();
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub(crate) fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub(crate) fn close_reason(&self) -> Option<CloseReason> {
        self.close_reason.lock().clone()
    }

    pub(crate) fn mark_started(&self) {
        self.started.store(true, Ordering::Release);
    }

    pub(crate) fn is_started(&self) -> bool {
        self.started.load(Ordering::Acquire)
    }

    pub(crate) fn mark_finished(&self) {
        self.finished.cancel();
    }

    /// Resolves once both loops of a started session have exited.
    pub(crate) async fn finished(&self) {
        self.finished.cancelled().await;
    }

    // ════════════════════════════════════════════════════════════════════════
    // Inbound protocol
    // ════════════════════════════════════════════════════════════════════════

    /// Dispatches one inbound text message. Protocol problems are answered
    /// with an error frame; they never close the connection.
    pub async fn handle_message(&self, raw: &str) {
        let message = match ClientMessage::parse(raw) {
            Ok(message) => message,
            Err(e) => {
                tracing::debug!(client_id = %self.id, error = %e, "Unparseable client message");
                self.send_error(None, errors::INVALID_FORMAT);
                return;
            }
        };

        match message.action() {
            ClientAction::Subscribe => self.handle_subscribe(&message).await,
            ClientAction::Unsubscribe => self.handle_unsubscribe(&message),
            ClientAction::Ping => {
                self.send(&ServerMessage::pong(message.id.clone()));
            }
            ClientAction::Typing => self.handle_typing(&message).await,
            ClientAction::Read => self.handle_read(&message).await,
            ClientAction::Unknown => {
                self.send_error(message.id.clone(), errors::unknown_type(&message.kind));
            }
        }
    }

    async fn handle_subscribe(&self, message: &ClientMessage) {
        let Some(channel) = message.channel() else {
            self.send_error(message.id.clone(), errors::SUBSCRIBE_CHANNEL_REQUIRED);
            return;
        };

        if !self.can_access_channel(channel).await {
            tracing::warn!(
                client_id = %self.id,
                user_id = %self.user_id,
                channel = %channel,
                "Unauthorized channel subscription attempt"
            );
            self.send_error(message.id.clone(), errors::access_denied(channel));
            return;
        }

        self.add_subscription(channel);
        self.send(&ServerMessage::ack(
            message.id.clone(),
            format!("Subscribed to {}", channel),
        ));
        tracing::debug!(client_id = %self.id, channel = %channel, "Client subscribed to channel");
    }

    fn handle_unsubscribe(&self, message: &ClientMessage) {
        let Some(channel) = message.channel() else {
            self.send_error(message.id.clone(), errors::UNSUBSCRIBE_CHANNEL_REQUIRED);
            return;
        };

        self.remove_subscription(channel);
        self.send(&ServerMessage::ack(
            message.id.clone(),
            format!("Unsubscribed from {}", channel),
        ));
        tracing::debug!(client_id = %self.id, channel = %channel, "Client unsubscribed from channel");
    }

    async fn handle_typing(&self, message: &ClientMessage) {
        let Some(channel) = message.channel() else {
            self.send_error(message.id.clone(), errors::TYPING_CHANNEL_REQUIRED);
            return;
        };

        let active = message
            .payload_field("active")
            .and_then(Value::as_bool)
            .unwrap_or(true);
        let event_type = if active {
            event_types::TYPING_STARTED
        } else {
            event_types::TYPING_STOPPED
        };

        let mut payload = Payload::new();
        payload.insert("user_id".to_string(), Value::String(self.user_id.to_string()));
        if let Some(username) = message.payload_field("username").and_then(Value::as_str) {
            payload.insert("username".to_string(), Value::String(username.to_string()));
        }

        self.publish_from_client(message, channel, event_type, payload).await;
    }

    async fn handle_read(&self, message: &ClientMessage) {
        let Some(channel) = message.channel() else {
            self.send_error(message.id.clone(), errors::READ_CHANNEL_REQUIRED);
            return;
        };

        let message_ids: Vec<Value> = message
            .payload_field("message_ids")
            .and_then(Value::as_array)
            .map(|ids| ids.iter().filter(|id| id.is_string()).cloned().collect())
            .unwrap_or_default();

        let mut payload = Payload::new();
        payload.insert("message_ids".to_string(), Value::Array(message_ids));
        payload.insert("user_id".to_string(), Value::String(self.user_id.to_string()));

        self.publish_from_client(message, channel, event_types::MESSAGE_READ, payload)
            .await;
    }

    /// Publishes a client-originated event to a channel the session is
    /// subscribed to.
    async fn publish_from_client(
        &self,
        message: &ClientMessage,
        channel: &str,
        event_type: &str,
        payload: Payload,
    ) {
        if !self.is_subscribed(channel) {
            self.send_error(message.id.clone(), errors::NOT_SUBSCRIBED);
            return;
        }
        let Some(bus) = self.services.bus.as_ref() else {
            self.send_error(message.id.clone(), errors::BUS_UNAVAILABLE);
            return;
        };

        let event = match Event::new(event_type, channel, payload) {
            Ok(event) => event.with_metadata("client_id", self.id.to_string()),
            Err(e) => {
                self.send_error(message.id.clone(), e.to_string());
                return;
            }
        };

        if let Err(e) = bus.publish(event).await {
            tracing::warn!(
                client_id = %self.id,
                channel = %channel,
                event_type = %event_type,
                error = %e,
                "Failed to publish client event"
            );
            self.send_error(message.id.clone(), format!("Failed to publish {}", event_type));
            return;
        }
        tracing::debug!(client_id = %self.id, channel = %channel, event_type = %event_type, "Client event published");
    }

    async fn can_access_channel(&self, channel: &str) -> bool {
        if channel == self.user_channel {
            return true;
        }
        self.services
            .authorizer
            .can_access_channel(&self.user_id, channel)
            .await
    }

    fn send_error(&self, id: Option<String>, error: impl Into<String>) {
        let error = error.into();
        self.services.metrics.record_error(error.clone());
        self.send(&ServerMessage::error(id, error));
    }
}

impl std::fmt::Debug for ClientSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientSession")
            .field("id", &self.id)
            .field("user_id", &self.user_id)
            .field("ip_address", &self.ip_address)
            .finish_non_exhaustive()
    }
}


#[cfg(test)]
mod tests {
    use super::test_support::*;
    use super::*;
    use crate::adapters::events::MemoryBroker;

    fn allow_all() -> Arc<dyn ChannelAuthorizer> {
        Arc::new(DenyList(Vec::new()))
    }

    #[tokio::test]
    async fn subscribe_adds_channel_and_acks() {
        let (session, mut rx, _) = session_with(allow_all(), None, 8);

        session
            .handle_message(r#"{"type":"subscribe","channel":"conv:1","id":"s1"}"#)
            .await;

        assert!(session.is_subscribed("conv:1"));
        let reply = next_json(&mut rx);
        assert_eq!(reply["type"], "ack");
        assert_eq!(reply["id"], "s1");
        assert_eq!(reply["payload"]["message"], "Subscribed to conv:1");
    }

    #[tokio::test]
    async fn denied_subscription_leaves_state_unchanged() {
        let authorizer = Arc::new(DenyList(vec!["space:secret".to_string()]));
        let (session, mut rx, metrics) = session_with(authorizer, None, 8);

        session
            .handle_message(r#"{"type":"subscribe","channel":"space:secret","id":"s2"}"#)
            .await;

        assert!(!session.is_subscribed("space:secret"));
        let reply = next_json(&mut rx);
        assert_eq!(reply["type"], "error");
        assert_eq!(reply["error"], "Access denied to channel: space:secret");
        assert_eq!(metrics.snapshot().errors, 1);
    }

    #[tokio::test]
    async fn own_user_channel_bypasses_authorizer() {
        let authorizer = Arc::new(DenyList(vec!["user:alice".to_string()]));
        let (session, mut rx, _) = session_with(authorizer, None, 8);

        session
            .handle_message(r#"{"type":"subscribe","channel":"user:alice"}"#)
            .await;

        assert!(session.is_subscribed("user:alice"));
        assert_eq!(next_json(&mut rx)["type"], "ack");
    }

    #[tokio::test]
    async fn subscribe_without_channel_is_an_error() {
        let (session, mut rx, _) = session_with(allow_all(), None, 8);

        session.handle_message(r#"{"type":"subscribe"}"#).await;

        assert_eq!(
            next_json(&mut rx)["error"],
            "Channel is required for subscription"
        );
        assert!(session.subscriptions().is_empty());
    }

    #[tokio::test]
    async fn unsubscribe_is_idempotent() {
        let (session, mut rx, _) = session_with(allow_all(), None, 8);
        session.add_subscription("conv:1");

        session
            .handle_message(r#"{"type":"unsubscribe","channel":"conv:1"}"#)
            .await;
        session
            .handle_message(r#"{"type":"unsubscribe","channel":"conv:1"}"#)
            .await;

        assert!(!session.is_subscribed("conv:1"));
        assert_eq!(next_json(&mut rx)["payload"]["message"], "Unsubscribed from conv:1");
        assert_eq!(next_json(&mut rx)["type"], "ack");
    }

    #[tokio::test]
    async fn ping_echoes_id() {
        let (session, mut rx, _) = session_with(allow_all(), None, 8);

        session.handle_message(r#"{"type":"ping","id":"p-9"}"#).await;

        let reply = next_json(&mut rx);
        assert_eq!(reply["type"], "pong");
        assert_eq!(reply["id"], "p-9");
    }

    #[tokio::test]
    async fn malformed_and_unknown_messages_get_error_frames() {
        let (session, mut rx, metrics) = session_with(allow_all(), None, 8);

        session.handle_message("{not json").await;
        session.handle_message(r#"{"type":"dance","id":"d"}"#).await;

        assert_eq!(next_json(&mut rx)["error"], "Invalid message format");
        let unknown = next_json(&mut rx);
        assert_eq!(unknown["error"], "Unknown message type: dance");
        assert_eq!(unknown["id"], "d");
        assert_eq!(metrics.snapshot().errors, 2);
        assert!(!session.is_cancelled());
    }

    #[tokio::test]
    async fn typing_publishes_to_subscribed_channel() {
        let broker = Arc::new(MemoryBroker::new());
        let mut stream = broker.subscribe("conv:1").await.unwrap();
        let (session, _rx, _) = session_with(allow_all(), Some(broker.clone() as Arc<dyn EventBus>), 8);
        session.add_subscription("conv:1");

        session
            .handle_message(
                r#"{"type":"typing","channel":"conv:1","payload":{"active":false,"username":"Alice"}}"#,
            )
            .await;

        let event = stream.recv().await.unwrap();
        assert_eq!(event.event_type(), "typing.stopped");
        assert_eq!(event.payload()["user_id"], "alice");
        assert_eq!(event.payload()["username"], "Alice");
        assert!(event.user_id().is_none());
    }

    #[tokio::test]
    async fn read_receipt_requires_subscription() {
        let broker = Arc::new(MemoryBroker::new());
        let mut stream = broker.subscribe("conv:1").await.unwrap();
        let (session, mut rx, _) = session_with(allow_all(), Some(broker.clone() as Arc<dyn EventBus>), 8);

        let receipt = r#"{"type":"read","channel":"conv:1","payload":{"message_ids":["m1","m2"]}}"#;
        session.handle_message(receipt).await;
        assert_eq!(next_json(&mut rx)["error"], "Not subscribed to channel");

        session.add_subscription("conv:1");
        session.handle_message(receipt).await;

        let event = stream.recv().await.unwrap();
        assert_eq!(event.event_type(), "message.read");
        assert_eq!(event.payload()["message_ids"], serde_json::json!(["m1", "m2"]));
    }

    #[tokio::test]
    async fn full_queue_drops_and_counts() {
        let (session, _rx, metrics) = session_with(allow_all(), None, 1);

        assert_eq!(session.try_enqueue(Arc::from("a")), EnqueueOutcome::Sent);
        assert_eq!(session.try_enqueue(Arc::from("b")), EnqueueOutcome::Full);
        assert_eq!(metrics.messages_dropped(), 1);
    }

    #[tokio::test]
    async fn closed_outbound_rejects_enqueue() {
        let (session, mut rx, _) = session_with(allow_all(), None, 4);
        session.try_enqueue(Arc::from("queued"));
        session.close_outbound();
        session.close_outbound();

        assert_eq!(session.try_enqueue(Arc::from("late")), EnqueueOutcome::Closed);
        assert_eq!(rx.recv().await.as_deref(), Some("queued"));
        assert!(rx.recv().await.is_none());
    }

    #[test]
    fn first_close_reason_wins() {
        let (session, _rx, _) = session_with(allow_all(), None, 1);
        session.close_with(CloseReason::shutting_down());
        session.close_with(CloseReason::normal());

        assert!(session.is_cancelled());
        assert_eq!(session.close_reason(), Some(CloseReason::shutting_down()));
    }
}
