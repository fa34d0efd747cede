//! LiveService - typed publishing facade over the event bus.
//!
//! Business services call the `publish_*` methods after their own state
//! change has committed. Each method builds one well-known event, picks its
//! channel, and hands it to the bus. Delivery is best-effort: a returned
//! error means the bus refused the event, and callers decide whether that
//! matters.
//!
//! # Targeting
//!
//! The connection manager delivers an event carrying a `user_id` only to
//! that user's sessions. The facade therefore sets `user_id` solely on
//! events addressed to one person (notifications, presence). Channel-wide
//! events carry their actor in the payload and as `actor_id` metadata.

use std::sync::Arc;

use serde_json::{json, Value};
use thiserror::Error;

use crate::adapters::websocket::{ConnectionManager, ConnectionMetricsSnapshot};
use crate::domain::foundation::{
    CalendarEventId, ConversationId, MessageId, PostId, SpaceId, UserId, ValidationError,
};
use crate::domain::live::{channel, event_types, Event, Payload};
use crate::ports::{BrokerMetricsSnapshot, BusError, EventBus};

const ACTOR_METADATA_KEY: &str = "actor_id";

/// Errors returned by the publishing facade.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LiveServiceError {
    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error(transparent)]
    Bus(#[from] BusError),
}

/// The application's entry point for pushing live updates.
#[derive(Clone)]
pub struct LiveService {
    bus: Arc<dyn EventBus>,
    manager: Option<ConnectionManager>,
}

impl LiveService {
    pub fn new(bus: Arc<dyn EventBus>) -> Self {
        Self { bus, manager: None }
    }

    /// Attaches the connection manager used for metrics.
    pub fn with_connection_manager(mut self, manager: ConnectionManager) -> Self {
        self.manager = Some(manager);
        self
    }

    pub fn bus(&self) -> &Arc<dyn EventBus> {
        &self.bus
    }

    pub fn connection_manager(&self) -> Option<&ConnectionManager> {
        self.manager.as_ref()
    }

    /// WebSocket counters, zeroed when no manager is attached.
    pub fn websocket_metrics(&self) -> ConnectionMetricsSnapshot {
        self.manager
            .as_ref()
            .map(ConnectionManager::metrics)
            .unwrap_or_default()
    }

    /// Network broker counters; `None` for the in-process broker.
    pub fn broker_metrics(&self) -> Option<BrokerMetricsSnapshot> {
        self.bus.metrics()
    }

    // ════════════════════════════════════════════════════════════════════════════
    // Messaging
    // ════════════════════════════════════════════════════════════════════════════

    pub async fn publish_message_created(
        &self,
        conversation_id: &ConversationId,
        sender_id: &UserId,
        message: Payload,
    ) -> Result<(), LiveServiceError> {
        let event = Event::new(
            event_types::MESSAGE_CREATED,
            channel::conversation(conversation_id),
            message,
        )?;
        self.publish(with_actor(event, sender_id)).await
    }

    pub async fn publish_message_delivered(
        &self,
        conversation_id: &ConversationId,
        message_id: &MessageId,
        recipient_id: &UserId,
    ) -> Result<(), LiveServiceError> {
        let event = Event::new(
            event_types::MESSAGE_DELIVERED,
            channel::conversation(conversation_id),
            object(json!({
                "message_id": message_id.to_string(),
                "recipient_id": recipient_id.as_str(),
            })),
        )?;
        self.publish(with_actor(event, recipient_id)).await
    }

    pub async fn publish_message_read(
        &self,
        conversation_id: &ConversationId,
        message_ids: &[MessageId],
        user_id: &UserId,
    ) -> Result<(), LiveServiceError> {
        let ids: Vec<String> = message_ids.iter().map(ToString::to_string).collect();
        let event = Event::new(
            event_types::MESSAGE_READ,
            channel::conversation(conversation_id),
            object(json!({
                "message_ids": ids,
                "user_id": user_id.as_str(),
            })),
        )?;
        self.publish(with_actor(event, user_id)).await
    }

    pub async fn publish_message_deleted(
        &self,
        conversation_id: &ConversationId,
        message_id: &MessageId,
        deleted_by: &UserId,
    ) -> Result<(), LiveServiceError> {
        let event = Event::new(
            event_types::MESSAGE_DELETED,
            channel::conversation(conversation_id),
            object(json!({
                "message_id": message_id.to_string(),
                "user_id": deleted_by.as_str(),
            })),
        )?;
        self.publish(with_actor(event, deleted_by)).await
    }

    pub async fn publish_typing_started(
        &self,
        conversation_id: &ConversationId,
        user_id: &UserId,
        username: &str,
    ) -> Result<(), LiveServiceError> {
        self.publish_typing(event_types::TYPING_STARTED, conversation_id, user_id, username)
            .await
    }

    pub async fn publish_typing_stopped(
        &self,
        conversation_id: &ConversationId,
        user_id: &UserId,
        username: &str,
    ) -> Result<(), LiveServiceError> {
        self.publish_typing(event_types::TYPING_STOPPED, conversation_id, user_id, username)
            .await
    }

    async fn publish_typing(
        &self,
        event_type: &str,
        conversation_id: &ConversationId,
        user_id: &UserId,
        username: &str,
    ) -> Result<(), LiveServiceError> {
        let event = Event::new(
            event_type,
            channel::conversation(conversation_id),
            object(json!({
                "user_id": user_id.as_str(),
                "username": username,
            })),
        )?;
        self.publish(with_actor(event, user_id)).await
    }

    /// Announces a reaction on a message.
    ///
    /// Payload: `{message_id, emoji, user_id}`.
    pub async fn publish_reaction_added(
        &self,
        conversation_id: &ConversationId,
        message_id: &MessageId,
        emoji: &str,
        user_id: &UserId,
    ) -> Result<(), LiveServiceError> {
        self.publish_reaction(
            event_types::REACTION_ADDED,
            conversation_id,
            message_id,
            emoji,
            user_id,
        )
        .await
    }

    /// Withdraws one user's reaction, identified by its emoji.
    pub async fn publish_reaction_removed(
        &self,
        conversation_id: &ConversationId,
        message_id: &MessageId,
        emoji: &str,
        user_id: &UserId,
    ) -> Result<(), LiveServiceError> {
        self.publish_reaction(
            event_types::REACTION_REMOVED,
            conversation_id,
            message_id,
            emoji,
            user_id,
        )
        .await
    }

    async fn publish_reaction(
        &self,
        event_type: &str,
        conversation_id: &ConversationId,
        message_id: &MessageId,
        emoji: &str,
        user_id: &UserId,
    ) -> Result<(), LiveServiceError> {
        if emoji.trim().is_empty() {
            return Err(ValidationError::empty_field("emoji").into());
        }
        let event = Event::new(
            event_type,
            channel::conversation(conversation_id),
            object(json!({
                "message_id": message_id.to_string(),
                "emoji": emoji,
                "user_id": user_id.as_str(),
            })),
        )?;
        self.publish(with_actor(event, user_id)).await
    }

    // ════════════════════════════════════════════════════════════════════════════
    // Notifications and presence (targeted at one user)
    // ════════════════════════════════════════════════════════════════════════════

    pub async fn publish_notification_created(
        &self,
        user_id: &UserId,
        notification: Payload,
    ) -> Result<(), LiveServiceError> {
        let event = Event::new(
            event_types::NOTIFICATION_CREATED,
            channel::user(user_id),
            notification,
        )?
        .with_user_id(user_id.clone());
        self.publish(event).await
    }

    pub async fn publish_user_online(
        &self,
        user_id: &UserId,
        metadata: Option<Payload>,
    ) -> Result<(), LiveServiceError> {
        let mut payload = object(json!({
            "user_id": user_id.as_str(),
            "status": "online",
        }));
        if let Some(metadata) = metadata {
            payload.insert("metadata".to_string(), Value::Object(metadata));
        }
        let event = Event::new(event_types::USER_ONLINE, channel::user(user_id), payload)?
            .with_user_id(user_id.clone());
        self.publish(event).await
    }

    pub async fn publish_user_offline(&self, user_id: &UserId) -> Result<(), LiveServiceError> {
        let event = Event::new(
            event_types::USER_OFFLINE,
            channel::user(user_id),
            object(json!({
                "user_id": user_id.as_str(),
                "status": "offline",
            })),
        )?
        .with_user_id(user_id.clone());
        self.publish(event).await
    }

    // ════════════════════════════════════════════════════════════════════════════
    // Spaces, posts and comments
    // ════════════════════════════════════════════════════════════════════════════

    pub async fn publish_post_created(
        &self,
        space_id: &SpaceId,
        author_id: &UserId,
        post: Payload,
    ) -> Result<(), LiveServiceError> {
        let event = Event::new(event_types::POST_CREATED, channel::space(space_id), post)?
            .with_space_id(*space_id);
        self.publish(with_actor(event, author_id)).await
    }

    /// Publishes to the post channel, then to the space channel.
    ///
    /// Stops at the first failure.
    pub async fn publish_post_updated(
        &self,
        space_id: &SpaceId,
        post_id: &PostId,
        author_id: &UserId,
        updates: Payload,
    ) -> Result<(), LiveServiceError> {
        let post_event = Event::new(
            event_types::POST_UPDATED,
            channel::post(post_id),
            updates.clone(),
        )?
        .with_space_id(*space_id);
        let space_event = Event::new(event_types::POST_UPDATED, channel::space(space_id), updates)?
            .with_space_id(*space_id);

        self.publish(with_actor(post_event, author_id)).await?;
        self.publish(with_actor(space_event, author_id)).await
    }

    pub async fn publish_post_liked(
        &self,
        post_id: &PostId,
        user_id: &UserId,
        space_id: &SpaceId,
        like_count: u64,
    ) -> Result<(), LiveServiceError> {
        let event = Event::new(
            event_types::POST_LIKED,
            channel::post(post_id),
            object(json!({
                "post_id": post_id.to_string(),
                "user_id": user_id.as_str(),
                "like_count": like_count,
            })),
        )?
        .with_space_id(*space_id);
        self.publish(with_actor(event, user_id)).await
    }

    pub async fn publish_comment_created(
        &self,
        post_id: &PostId,
        author_id: &UserId,
        comment: Payload,
    ) -> Result<(), LiveServiceError> {
        let event = Event::new(event_types::COMMENT_CREATED, channel::post(post_id), comment)?;
        self.publish(with_actor(event, author_id)).await
    }

    pub async fn publish_space_member_joined(
        &self,
        space_id: &SpaceId,
        user_id: &UserId,
        member: Payload,
    ) -> Result<(), LiveServiceError> {
        let event = Event::new(
            event_types::SPACE_MEMBER_JOINED,
            channel::space(space_id),
            member,
        )?
        .with_space_id(*space_id);
        self.publish(with_actor(event, user_id)).await
    }

    pub async fn publish_space_member_left(
        &self,
        space_id: &SpaceId,
        user_id: &UserId,
    ) -> Result<(), LiveServiceError> {
        let event = Event::new(
            event_types::SPACE_MEMBER_LEFT,
            channel::space(space_id),
            object(json!({ "user_id": user_id.as_str() })),
        )?
        .with_space_id(*space_id);
        self.publish(with_actor(event, user_id)).await
    }

    pub async fn publish_lesson_published(
        &self,
        space_id: &SpaceId,
        lesson: Payload,
    ) -> Result<(), LiveServiceError> {
        let event = Event::new(
            event_types::LESSON_PUBLISHED,
            channel::space(space_id),
            lesson,
        )?
        .with_space_id(*space_id);
        self.publish(event).await
    }

    /// Publishes to the calendar event channel, then to the space channel.
    pub async fn publish_event_updated(
        &self,
        event_id: &CalendarEventId,
        space_id: &SpaceId,
        updates: Payload,
    ) -> Result<(), LiveServiceError> {
        let event = Event::new(
            event_types::EVENT_UPDATED,
            channel::event(event_id),
            updates.clone(),
        )?
        .with_space_id(*space_id);
        let space_event = Event::new(event_types::EVENT_UPDATED, channel::space(space_id), updates)?
            .with_space_id(*space_id);

        self.publish(event).await?;
        self.publish(space_event).await
    }

    /// Publishes an arbitrary event.
    ///
    /// Passing `user_id` restricts delivery to that user's sessions.
    pub async fn publish_event(
        &self,
        event_type: &str,
        channel: &str,
        payload: Payload,
        user_id: Option<&UserId>,
        space_id: Option<&SpaceId>,
    ) -> Result<(), LiveServiceError> {
        let mut event = Event::new(event_type, channel, payload)?;
        if let Some(user_id) = user_id {
            event = event.with_user_id(user_id.clone());
        }
        if let Some(space_id) = space_id {
            event = event.with_space_id(*space_id);
        }
        self.publish(event).await
    }

    async fn publish(&self, event: Event) -> Result<(), LiveServiceError> {
        let event_type = event.event_type().to_string();
        let channel = event.channel().to_string();
        self.bus.publish(event).await.map_err(|e| {
            tracing::warn!(
                event_type = %event_type,
                channel = %channel,
                error = %e,
                "Failed to publish live event"
            );
            LiveServiceError::from(e)
        })
    }
}

fn with_actor(event: Event, actor: &UserId) -> Event {
    event.with_metadata(ACTOR_METADATA_KEY, actor.as_str())
}

fn object(value: Value) -> Payload {
    match value {
        Value::Object(map) => map,
        _ => Payload::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::events::MemoryBroker;
    use crate::ports::EventStream;
    use std::time::Duration;

    fn alice() -> UserId {
        UserId::new("alice").unwrap()
    }

    async fn service_with(channel: &str) -> (LiveService, EventStream) {
        let broker = MemoryBroker::new();
        let stream = broker.subscribe(channel).await.unwrap();
        (LiveService::new(Arc::new(broker)), stream)
    }

    async fn next(stream: &mut EventStream) -> Arc<Event> {
        tokio::time::timeout(Duration::from_secs(1), stream.recv())
            .await
            .expect("event not delivered")
            .expect("stream closed")
    }

    #[tokio::test]
    async fn message_created_goes_to_conversation_channel_untargeted() {
        let conversation_id = ConversationId::new();
        let (service, mut stream) = service_with(&channel::conversation(&conversation_id)).await;

        let message = object(json!({"id": "m1", "text": "hi"}));
        service
            .publish_message_created(&conversation_id, &alice(), message)
            .await
            .unwrap();

        let event = next(&mut stream).await;
        assert_eq!(event.event_type(), event_types::MESSAGE_CREATED);
        assert_eq!(event.payload()["text"], "hi");
        assert!(event.user_id().is_none());
        assert_eq!(
            event.metadata().get(ACTOR_METADATA_KEY).map(String::as_str),
            Some("alice")
        );
    }

    #[tokio::test]
    async fn message_read_lists_ids_as_strings() {
        let conversation_id = ConversationId::new();
        let (service, mut stream) = service_with(&channel::conversation(&conversation_id)).await;
        let ids = [MessageId::new(), MessageId::new()];

        service
            .publish_message_read(&conversation_id, &ids, &alice())
            .await
            .unwrap();

        let event = next(&mut stream).await;
        assert_eq!(event.event_type(), event_types::MESSAGE_READ);
        assert_eq!(event.payload()["message_ids"][1], ids[1].to_string());
        assert_eq!(event.payload()["user_id"], "alice");
    }

    #[tokio::test]
    async fn typing_events_carry_username() {
        let conversation_id = ConversationId::new();
        let (service, mut stream) = service_with(&channel::conversation(&conversation_id)).await;

        service
            .publish_typing_started(&conversation_id, &alice(), "Alice")
            .await
            .unwrap();
        service
            .publish_typing_stopped(&conversation_id, &alice(), "Alice")
            .await
            .unwrap();

        let started = next(&mut stream).await;
        let stopped = next(&mut stream).await;
        assert_eq!(started.event_type(), event_types::TYPING_STARTED);
        assert_eq!(started.payload()["username"], "Alice");
        assert_eq!(stopped.event_type(), event_types::TYPING_STOPPED);
    }

    #[tokio::test]
    async fn reactions_use_explicit_triple() {
        let conversation_id = ConversationId::new();
        let message_id = MessageId::new();
        let (service, mut stream) = service_with(&channel::conversation(&conversation_id)).await;

        service
            .publish_reaction_added(&conversation_id, &message_id, "👍", &alice())
            .await
            .unwrap();
        service
            .publish_reaction_removed(&conversation_id, &message_id, "👍", &alice())
            .await
            .unwrap();

        let added = next(&mut stream).await;
        assert_eq!(added.event_type(), event_types::REACTION_ADDED);
        assert_eq!(added.payload()["message_id"], message_id.to_string());
        assert_eq!(added.payload()["emoji"], "👍");
        assert_eq!(added.payload()["user_id"], "alice");

        let removed = next(&mut stream).await;
        assert_eq!(removed.event_type(), event_types::REACTION_REMOVED);
    }

    #[tokio::test]
    async fn reaction_without_emoji_is_rejected() {
        let service = LiveService::new(Arc::new(MemoryBroker::new()));
        let result = service
            .publish_reaction_added(&ConversationId::new(), &MessageId::new(), " ", &alice())
            .await;
        assert!(matches!(result, Err(LiveServiceError::Validation(_))));
    }

    #[tokio::test]
    async fn notification_targets_its_user() {
        let (service, mut stream) = service_with(&channel::user(&alice())).await;

        service
            .publish_notification_created(&alice(), object(json!({"title": "New follower"})))
            .await
            .unwrap();

        let event = next(&mut stream).await;
        assert_eq!(event.event_type(), event_types::NOTIFICATION_CREATED);
        assert_eq!(event.user_id(), Some(&alice()));
    }

    #[tokio::test]
    async fn presence_events_include_status() {
        let (service, mut stream) = service_with(&channel::user(&alice())).await;

        service
            .publish_user_online(&alice(), Some(object(json!({"device": "web"}))))
            .await
            .unwrap();
        service.publish_user_offline(&alice()).await.unwrap();

        let online = next(&mut stream).await;
        assert_eq!(online.payload()["status"], "online");
        assert_eq!(online.payload()["metadata"]["device"], "web");
        let offline = next(&mut stream).await;
        assert_eq!(offline.payload()["status"], "offline");
        assert!(offline.payload().get("metadata").is_none());
    }

    #[tokio::test]
    async fn post_updated_reaches_post_and_space_channels() {
        let space_id = SpaceId::new();
        let post_id = PostId::new();
        let broker = MemoryBroker::new();
        let mut post_stream = broker.subscribe(&channel::post(&post_id)).await.unwrap();
        let mut space_stream = broker.subscribe(&channel::space(&space_id)).await.unwrap();
        let service = LiveService::new(Arc::new(broker));

        service
            .publish_post_updated(&space_id, &post_id, &alice(), object(json!({"title": "v2"})))
            .await
            .unwrap();

        for stream in [&mut post_stream, &mut space_stream] {
            let event = next(stream).await;
            assert_eq!(event.event_type(), event_types::POST_UPDATED);
            assert_eq!(event.space_id(), Some(space_id));
            assert_eq!(event.payload()["title"], "v2");
        }
    }

    #[tokio::test]
    async fn post_liked_reports_count() {
        let post_id = PostId::new();
        let (service, mut stream) = service_with(&channel::post(&post_id)).await;

        service
            .publish_post_liked(&post_id, &alice(), &SpaceId::new(), 7)
            .await
            .unwrap();

        let event = next(&mut stream).await;
        assert_eq!(event.payload()["like_count"], 7);
        assert_eq!(event.payload()["post_id"], post_id.to_string());
    }

    #[tokio::test]
    async fn event_updated_reaches_event_and_space_channels() {
        let space_id = SpaceId::new();
        let event_id = CalendarEventId::new();
        let broker = MemoryBroker::new();
        let mut event_stream = broker.subscribe(&channel::event(&event_id)).await.unwrap();
        let mut space_stream = broker.subscribe(&channel::space(&space_id)).await.unwrap();
        let service = LiveService::new(Arc::new(broker));

        service
            .publish_event_updated(&event_id, &space_id, object(json!({"starts_at": "noon"})))
            .await
            .unwrap();

        assert_eq!(next(&mut event_stream).await.channel(), channel::event(&event_id));
        assert_eq!(next(&mut space_stream).await.channel(), channel::space(&space_id));
    }

    #[tokio::test]
    async fn member_events_and_lessons_use_space_channel() {
        let space_id = SpaceId::new();
        let (service, mut stream) = service_with(&channel::space(&space_id)).await;

        service
            .publish_space_member_joined(&space_id, &alice(), object(json!({"role": "member"})))
            .await
            .unwrap();
        service
            .publish_space_member_left(&space_id, &alice())
            .await
            .unwrap();
        service
            .publish_lesson_published(&space_id, object(json!({"title": "Intro"})))
            .await
            .unwrap();
        service
            .publish_post_created(&space_id, &alice(), object(json!({"body": "hello"})))
            .await
            .unwrap();

        let types: Vec<String> = [
            next(&mut stream).await,
            next(&mut stream).await,
            next(&mut stream).await,
            next(&mut stream).await,
        ]
        .iter()
        .map(|event| event.event_type().to_string())
        .collect();
        assert_eq!(
            types,
            vec![
                event_types::SPACE_MEMBER_JOINED,
                event_types::SPACE_MEMBER_LEFT,
                event_types::LESSON_PUBLISHED,
                event_types::POST_CREATED,
            ]
        );
    }

    #[tokio::test]
    async fn generic_publish_sets_optional_fields() {
        let (service, mut stream) = service_with("global").await;
        let space_id = SpaceId::new();

        service
            .publish_event("custom.thing", "global", Payload::new(), Some(&alice()), Some(&space_id))
            .await
            .unwrap();

        let event = next(&mut stream).await;
        assert_eq!(event.user_id(), Some(&alice()));
        assert_eq!(event.space_id(), Some(space_id));
    }

    #[tokio::test]
    async fn generic_publish_rejects_empty_channel() {
        let service = LiveService::new(Arc::new(MemoryBroker::new()));
        let result = service
            .publish_event("custom.thing", "", Payload::new(), None, None)
            .await;
        assert!(matches!(result, Err(LiveServiceError::Validation(_))));
    }

    #[tokio::test]
    async fn closed_bus_surfaces_error() {
        let broker = MemoryBroker::new();
        broker.close().await.unwrap();
        let service = LiveService::new(Arc::new(broker));

        let result = service.publish_user_offline(&alice()).await;
        assert_eq!(result, Err(LiveServiceError::Bus(BusError::Closed)));
    }

    #[tokio::test]
    async fn metrics_default_without_manager_or_network_broker() {
        let service = LiveService::new(Arc::new(MemoryBroker::new()));
        assert_eq!(service.websocket_metrics(), ConnectionMetricsSnapshot::default());
        assert!(service.broker_metrics().is_none());
    }
}
