//! Connection manager.
//!
//! Owns every live [`ClientSession`]. Structural changes (register,
//! unregister, broadcast, idle sweep) go through one event loop task;
//! presence and metrics queries read the indices directly under a
//! `parking_lot` read lock.
//!
//! ```text
//!   register ───┐
//!   unregister ─┼──► event loop ──► indices { clients, by_user, by_ip }
//!   broadcast ──┘        │
//!   sweep tick ──────────┘
//!
//!   EventBus ──subscribe_pattern("*")──► bus bridge ──► broadcast
//! ```

use std::collections::{HashMap, HashSet};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::future::join_all;
use parking_lot::RwLock;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{interval_at, timeout, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::domain::foundation::{ConnectionId, Timestamp, UserId};
use crate::domain::live::Event;
use crate::ports::{BusError, ChannelAuthorizer, EventBus};

use super::frame::CloseReason;
use super::messages::ServerMessage;
use super::metrics::{ConnectionMetrics, ConnectionMetricsSnapshot};
use super::session::{ClientSession, EnqueueOutcome, Outbound, SessionParams, SessionServices};

const REGISTER_QUEUE: usize = 256;
const UNREGISTER_QUEUE: usize = 256;
const BROADCAST_QUEUE: usize = 1024;

/// Pattern the bus bridge subscribes with.
pub const CATCH_ALL_PATTERN: &str = "*";

// ════════════════════════════════════════════════════════════════════════════
// Configuration and errors
// ════════════════════════════════════════════════════════════════════════════

/// Connection manager settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManagerConfig {
    pub max_connections_per_user: usize,
    pub max_connections_per_ip: usize,
    /// Capacity of each session's outbound queue.
    pub send_buffer_size: usize,
    pub idle_timeout: Duration,
    /// Idle sweep interval.
    pub heartbeat_interval: Duration,
    /// Read deadline; pings go out at 90% of it.
    pub pong_wait: Duration,
    pub write_wait: Duration,
    pub max_message_size: usize,
    pub shutdown_timeout: Duration,
    /// Delay before the bus bridge retries a failed catch-all subscription.
    pub resubscribe_delay: Duration,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            max_connections_per_user: 100,
            max_connections_per_ip: 100,
            send_buffer_size: 256,
            idle_timeout: Duration::from_secs(5 * 60),
            heartbeat_interval: Duration::from_secs(30),
            pong_wait: Duration::from_secs(60),
            write_wait: Duration::from_secs(10),
            max_message_size: 2 * 1024 * 1024,
            shutdown_timeout: Duration::from_secs(10),
            resubscribe_delay: Duration::from_secs(1),
        }
    }
}

impl ManagerConfig {
    pub fn ping_period(&self) -> Duration {
        self.pong_wait * 9 / 10
    }
}

/// Why a connection was refused.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RegistrationError {
    #[error("Maximum connections per user exceeded")]
    UserLimitExceeded { user_id: UserId, limit: usize },

    #[error("Maximum connections per IP exceeded")]
    IpLimitExceeded { ip_address: String, limit: usize },

    #[error("Server shutting down")]
    ManagerStopped,
}

impl RegistrationError {
    /// Close frame sent to the refused client.
    pub fn close_reason(&self) -> CloseReason {
        match self {
            RegistrationError::UserLimitExceeded { .. }
            | RegistrationError::IpLimitExceeded { .. } => CloseReason::policy(self.to_string()),
            RegistrationError::ManagerStopped => CloseReason::shutting_down(),
        }
    }
}

/// Default authorizer: every channel is allowed.
#[derive(Debug, Clone, Copy, Default)]
pub struct AllowAllChannels;

#[async_trait]
impl ChannelAuthorizer for AllowAllChannels {
    async fn can_access_channel(&self, _user_id: &UserId, _channel: &str) -> bool {
        true
    }
}

/// One delivery instruction.
#[derive(Debug, Clone)]
pub struct Broadcast {
    /// Only sessions of these users; `None` means every session.
    pub targets: Option<Vec<UserId>>,
    /// Sessions must be subscribed to it; empty means always deliver.
    pub channel: String,
    /// Encoded server message.
    pub payload: Arc<str>,
    /// When the event was created, for latency accounting.
    pub sent_at: Option<Timestamp>,
}

impl Broadcast {
    /// Delivery instruction for a bus event: to `event.user_id` if set,
    /// otherwise to everyone subscribed to the event's channel.
    pub fn from_event(event: &Event) -> Result<Self, serde_json::Error> {
        let payload = ServerMessage::event(event).to_json()?;
        Ok(Self {
            targets: event.user_id().map(|user_id| vec![user_id.clone()]),
            channel: event.channel().to_string(),
            payload: Arc::from(payload),
            sent_at: Some(event.timestamp()),
        })
    }
}

// ════════════════════════════════════════════════════════════════════════════
// Indices
// ════════════════════════════════════════════════════════════════════════════

#[derive(Default)]
struct Indices {
    clients: HashMap<ConnectionId, Arc<ClientSession>>,
    by_user: HashMap<UserId, Vec<ConnectionId>>,
    by_ip: HashMap<String, Vec<ConnectionId>>,
}

impl Indices {
    fn user_count(&self, user_id: &UserId) -> usize {
        self.by_user.get(user_id).map_or(0, Vec::len)
    }

    fn ip_count(&self, ip_address: &str) -> usize {
        self.by_ip.get(ip_address).map_or(0, Vec::len)
    }

    fn insert(&mut self, session: Arc<ClientSession>) {
        let id = session.id();
        self.by_user
            .entry(session.user_id().clone())
            .or_default()
            .push(id);
        self.by_ip
            .entry(session.ip_address().to_string())
            .or_default()
            .push(id);
        self.clients.insert(id, session);
    }

    fn remove(&mut self, id: &ConnectionId) -> Option<Arc<ClientSession>> {
        let session = self.clients.remove(id)?;
        prune(&mut self.by_user, session.user_id(), id);
        prune(&mut self.by_ip, session.ip_address(), id);
        Some(session)
    }

    fn drain(&mut self) -> Vec<Arc<ClientSession>> {
        self.by_user.clear();
        self.by_ip.clear();
        self.clients.drain().map(|(_, session)| session).collect()
    }

    fn sessions_for_user(&self, user_id: &UserId) -> Vec<Arc<ClientSession>> {
        self.by_user
            .get(user_id)
            .into_iter()
            .flatten()
            .filter_map(|id| self.clients.get(id).cloned())
            .collect()
    }
}

/// Removes `id` from the bucket at `key`, dropping the bucket once empty.
fn prune<K, Q>(index: &mut HashMap<K, Vec<ConnectionId>>, key: &Q, id: &ConnectionId)
where
    K: std::borrow::Borrow<Q> + std::hash::Hash + Eq,
    Q: std::hash::Hash + Eq + ?Sized,
{
    let emptied = match index.get_mut(key) {
        Some(bucket) => {
            bucket.retain(|existing| existing != id);
            bucket.is_empty()
        }
        None => false,
    };
    if emptied {
        index.remove(key);
    }
}

// ════════════════════════════════════════════════════════════════════════════
// Manager
// ════════════════════════════════════════════════════════════════════════════

struct RegisterRequest {
    session: Arc<ClientSession>,
    reply: oneshot::Sender<Result<(), RegistrationError>>,
}

struct UnregisterRequest {
    id: ConnectionId,
    reply: Option<oneshot::Sender<bool>>,
}

struct ManagerInner {
    config: ManagerConfig,
    indices: RwLock<Indices>,
    metrics: Arc<ConnectionMetrics>,
    services: Arc<SessionServices>,
    register_tx: mpsc::Sender<RegisterRequest>,
    unregister_tx: mpsc::Sender<UnregisterRequest>,
    broadcast_tx: mpsc::Sender<Broadcast>,
    cancel: CancellationToken,
    /// Cancelled when the event loop task has returned.
    loop_exited: CancellationToken,
    stopped: AtomicBool,
}

/// Handle to the connection manager. Cheap to clone.
#[derive(Clone)]
pub struct ConnectionManager {
    inner: Arc<ManagerInner>,
}

impl ConnectionManager {
    /// Starts the event loop and, when a bus is given, the bus bridge.
    ///
    /// Must be called inside a Tokio runtime. Without an authorizer every
    /// channel is allowed.
    pub fn start(
        config: ManagerConfig,
        bus: Option<Arc<dyn EventBus>>,
        authorizer: Option<Arc<dyn ChannelAuthorizer>>,
    ) -> Self {
        let (register_tx, register_rx) = mpsc::channel(REGISTER_QUEUE);
        let (unregister_tx, unregister_rx) = mpsc::channel(UNREGISTER_QUEUE);
        let (broadcast_tx, broadcast_rx) = mpsc::channel(BROADCAST_QUEUE);
        let metrics = Arc::new(ConnectionMetrics::new());

        let services = Arc::new(SessionServices {
            authorizer: authorizer.unwrap_or_else(|| Arc::new(AllowAllChannels)),
            bus: bus.clone(),
            metrics: metrics.clone(),
        });

        let inner = Arc::new(ManagerInner {
            config,
            indices: RwLock::new(Indices::default()),
            metrics,
            services,
            register_tx,
            unregister_tx,
            broadcast_tx,
            cancel: CancellationToken::new(),
            loop_exited: CancellationToken::new(),
            stopped: AtomicBool::new(false),
        });

        tokio::spawn(run_event_loop(
            inner.clone(),
            register_rx,
            unregister_rx,
            broadcast_rx,
        ));
        if let Some(bus) = bus {
            tokio::spawn(run_bus_bridge(inner.clone(), bus));
        }

        tracing::info!(
            max_connections_per_user = inner.config.max_connections_per_user,
            max_connections_per_ip = inner.config.max_connections_per_ip,
            "Connection manager started"
        );

        Self { inner }
    }

    pub fn config(&self) -> &ManagerConfig {
        &self.inner.config
    }

    /// Creates an unregistered session and the receiving end of its queue.
    pub fn create_session(&self, params: SessionParams) -> (Arc<ClientSession>, Outbound) {
        let (tx, rx) = mpsc::channel(self.inner.config.send_buffer_size.max(1));
        let session = ClientSession::new(
            params,
            tx,
            self.inner.cancel.child_token(),
            self.inner.services.clone(),
        );
        (Arc::new(session), rx)
    }

    /// Registers a session through the event loop.
    ///
    /// Limits are checked before any index changes, so a refused session
    /// leaves no trace.
    pub async fn register(&self, session: Arc<ClientSession>) -> Result<(), RegistrationError> {
        if self.is_stopped() {
            return Err(RegistrationError::ManagerStopped);
        }
        let (reply, response) = oneshot::channel();
        let request = RegisterRequest { session, reply };

        tokio::select! {
            _ = self.inner.cancel.cancelled() => Err(RegistrationError::ManagerStopped),
            result = async {
                self.inner
                    .register_tx
                    .send(request)
                    .await
                    .map_err(|_| RegistrationError::ManagerStopped)?;
                response.await.unwrap_or(Err(RegistrationError::ManagerStopped))
            } => result,
        }
    }

    /// Unregisters a session. Returns false if it was not registered,
    /// including on a second call for the same session.
    pub async fn unregister(&self, id: ConnectionId) -> bool {
        let (reply, response) = oneshot::channel();
        let request = UnregisterRequest {
            id,
            reply: Some(reply),
        };

        tokio::select! {
            _ = self.inner.cancel.cancelled() => false,
            removed = async {
                if self.inner.unregister_tx.send(request).await.is_err() {
                    return false;
                }
                response.await.unwrap_or(false)
            } => removed,
        }
    }

    /// Queues a delivery instruction. Returns false once stopped.
    pub async fn broadcast(&self, broadcast: Broadcast) -> bool {
        self.inner.enqueue_broadcast(broadcast).await
    }

    pub fn is_user_online(&self, user_id: &UserId) -> bool {
        self.inner.indices.read().by_user.contains_key(user_id)
    }

    pub fn user_connections(&self, user_id: &UserId) -> usize {
        self.inner.indices.read().user_count(user_id)
    }

    pub fn ip_connections(&self, ip_address: &str) -> usize {
        self.inner.indices.read().ip_count(ip_address)
    }

    pub fn active_connections(&self) -> usize {
        self.inner.indices.read().clients.len()
    }

    pub fn session(&self, id: &ConnectionId) -> Option<Arc<ClientSession>> {
        self.inner.indices.read().clients.get(id).cloned()
    }

    pub fn sessions_for_user(&self, user_id: &UserId) -> Vec<Arc<ClientSession>> {
        self.inner.indices.read().sessions_for_user(user_id)
    }

    pub fn metrics(&self) -> ConnectionMetricsSnapshot {
        self.inner.metrics.snapshot()
    }

    pub fn is_stopped(&self) -> bool {
        self.inner.stopped.load(Ordering::Acquire)
    }

    /// Stops the event loop and the bus bridge, closes every session with
    /// 1001 and waits up to `shutdown_timeout` for their loops to exit.
    /// Idempotent.
    pub async fn shutdown(&self) {
        if self.inner.stopped.swap(true, Ordering::AcqRel) {
            return;
        }
        tracing::info!("Shutting down connection manager");

        let mut sessions = self.inner.indices.write().drain();
        for session in &sessions {
            session.close_with(CloseReason::shutting_down());
        }
        self.inner.cancel.cancel();

        // A register step already in flight may still insert; drain again
        // once the loop is gone.
        if timeout(self.inner.config.shutdown_timeout, self.inner.loop_exited.cancelled())
            .await
            .is_err()
        {
            tracing::warn!("Timed out waiting for the connection manager loop to stop");
        }
        let late = self.inner.indices.write().drain();
        for session in &late {
            session.close_with(CloseReason::shutting_down());
        }
        sessions.extend(late);

        for session in &sessions {
            session.close_outbound();
            self.inner.metrics.record_disconnected();
        }

        let waits = sessions
            .iter()
            .filter(|session| session.is_started())
            .map(|session| session.finished());
        let count = sessions.len();
        if timeout(self.inner.config.shutdown_timeout, join_all(waits))
            .await
            .is_err()
        {
            tracing::warn!(
                sessions = count,
                timeout_secs = self.inner.config.shutdown_timeout.as_secs(),
                "Timed out waiting for connections to close"
            );
        } else {
            tracing::info!(sessions = count, "All connections closed");
        }
    }

    #[cfg(test)]
    fn check_indices(&self) -> Result<(), String> {
        self.inner.indices.read().check()
    }
}

impl std::fmt::Debug for ConnectionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionManager")
            .field("config", &self.inner.config)
            .field("active_connections", &self.active_connections())
            .finish_non_exhaustive()
    }
}

// ════════════════════════════════════════════════════════════════════════════
// Event loop
// ════════════════════════════════════════════════════════════════════════════

async fn run_event_loop(
    inner: Arc<ManagerInner>,
    mut register_rx: mpsc::Receiver<RegisterRequest>,
    mut unregister_rx: mpsc::Receiver<UnregisterRequest>,
    mut broadcast_rx: mpsc::Receiver<Broadcast>,
) {
    let _exited = inner.loop_exited.clone().drop_guard();
    let period = inner.config.heartbeat_interval;
    let mut sweep = interval_at(Instant::now() + period, period);
    sweep.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            biased;
            _ = inner.cancel.cancelled() => break,
            Some(request) = register_rx.recv() => {
                guarded("register", || inner.register_client(request));
            }
            Some(request) = unregister_rx.recv() => {
                guarded("unregister", || {
                    let removed = inner.unregister_client(&request.id);
                    if let Some(reply) = request.reply {
                        let _ = reply.send(removed);
                    }
                });
            }
            Some(broadcast) = broadcast_rx.recv() => {
                guarded("broadcast", || inner.broadcast_message(&broadcast));
            }
            _ = sweep.tick() => {
                guarded("idle sweep", || inner.sweep_idle());
            }
        }
    }

    register_rx.close();
    while let Ok(request) = register_rx.try_recv() {
        let _ = request.reply.send(Err(RegistrationError::ManagerStopped));
    }
    tracing::debug!("Connection manager event loop stopped");
}

/// Runs one loop step; a panic is logged instead of killing the loop.
fn guarded(step: &str, f: impl FnOnce()) {
    if catch_unwind(AssertUnwindSafe(f)).is_err() {
        tracing::error!(step, "Connection manager step panicked");
    }
}

impl ManagerInner {
    fn register_client(&self, request: RegisterRequest) {
        let session = request.session;
        let result = {
            let mut indices = self.indices.write();
            let user_limit = self.config.max_connections_per_user;
            let ip_limit = self.config.max_connections_per_ip;

            if indices.user_count(session.user_id()) >= user_limit {
                Err(RegistrationError::UserLimitExceeded {
                    user_id: session.user_id().clone(),
                    limit: user_limit,
                })
            } else if indices.ip_count(session.ip_address()) >= ip_limit {
                Err(RegistrationError::IpLimitExceeded {
                    ip_address: session.ip_address().to_string(),
                    limit: ip_limit,
                })
            } else {
                indices.insert(session.clone());
                Ok(())
            }
        };

        match &result {
            Ok(()) => {
                self.metrics.record_connected();
                tracing::info!(
                    client_id = %session.id(),
                    user_id = %session.user_id(),
                    ip_address = %session.ip_address(),
                    "Client registered"
                );
            }
            Err(e) => {
                self.metrics.record_rejected();
                tracing::warn!(
                    client_id = %session.id(),
                    user_id = %session.user_id(),
                    ip_address = %session.ip_address(),
                    reason = %e,
                    "Client registration rejected"
                );
            }
        }

        let accepted = result.is_ok();
        if request.reply.send(result).is_err() && accepted {
            // Caller went away before hearing back; nobody will serve it.
            self.unregister_client(&session.id());
        }
    }

    fn unregister_client(&self, id: &ConnectionId) -> bool {
        let Some(session) = self.indices.write().remove(id) else {
            return false;
        };
        session.close_outbound();
        self.metrics.record_disconnected();
        tracing::info!(
            client_id = %session.id(),
            user_id = %session.user_id(),
            "Client unregistered"
        );
        true
    }

    fn broadcast_message(&self, broadcast: &Broadcast) {
        let candidates: Vec<Arc<ClientSession>> = {
            let indices = self.indices.read();
            match &broadcast.targets {
                None => indices.clients.values().cloned().collect(),
                Some(users) => {
                    let mut seen = HashSet::new();
                    users
                        .iter()
                        .flat_map(|user_id| indices.sessions_for_user(user_id))
                        .filter(|session| seen.insert(session.id()))
                        .collect()
                }
            }
        };

        let latency = broadcast.sent_at.map(|sent_at| sent_at.elapsed());
        let mut delivered = 0usize;
        for session in candidates {
            if !broadcast.channel.is_empty() && !session.is_subscribed(&broadcast.channel) {
                continue;
            }
            if session.try_enqueue(broadcast.payload.clone()) == EnqueueOutcome::Sent {
                delivered += 1;
                if let Some(latency) = latency {
                    self.metrics.record_latency(latency);
                }
            }
        }

        tracing::debug!(channel = %broadcast.channel, delivered, "Broadcast delivered");
    }

    fn sweep_idle(&self) {
        let idle_timeout = self.config.idle_timeout;
        let idle: Vec<Arc<ClientSession>> = self
            .indices
            .read()
            .clients
            .values()
            .filter(|session| session.idle_for() > idle_timeout)
            .cloned()
            .collect();

        for session in idle {
            tracing::info!(
                client_id = %session.id(),
                user_id = %session.user_id(),
                idle_secs = session.idle_for().as_secs(),
                "Evicting idle client"
            );
            session.close_with(CloseReason::idle_timeout());
            self.unregister_client(&session.id());
        }
    }

    async fn enqueue_broadcast(&self, broadcast: Broadcast) -> bool {
        tokio::select! {
            _ = self.cancel.cancelled() => false,
            sent = self.broadcast_tx.send(broadcast) => sent.is_ok(),
        }
    }
}

// ════════════════════════════════════════════════════════════════════════════
// Bus bridge
// ════════════════════════════════════════════════════════════════════════════

/// Forwards every bus event into the broadcast queue.
///
/// When the catch-all stream ends (broker reconnect) or the subscription
/// fails, waits for the broker's reconnect notification, or the retry
/// delay, and subscribes again. Stops when the bus is closed, when the bus
/// cannot reconnect, or when the manager shuts down.
async fn run_bus_bridge(inner: Arc<ManagerInner>, bus: Arc<dyn EventBus>) {
    let mut notifications = bus.reconnect_notifications();

    loop {
        if inner.cancel.is_cancelled() {
            return;
        }

        match bus.subscribe_pattern(CATCH_ALL_PATTERN).await {
            Ok(mut stream) => {
                tracing::info!(pattern = CATCH_ALL_PATTERN, "Bus bridge subscribed");
                loop {
                    let event = tokio::select! {
                        biased;
                        _ = inner.cancel.cancelled() => return,
                        event = stream.recv() => event,
                    };
                    let Some(event) = event else { break };
                    forward_event(&inner, &event).await;
                }
                tracing::warn!("Bus bridge stream ended");
            }
            Err(BusError::Closed) => {
                tracing::info!("Event bus closed, bus bridge stopping");
                return;
            }
            Err(BusError::AlreadySubscribed(pattern)) => {
                tracing::warn!(pattern = %pattern, "Stale bridge subscription, releasing it");
                let _ = bus.unsubscribe(&pattern).await;
            }
            Err(e) => {
                tracing::warn!(error = %e, "Bus bridge failed to subscribe");
            }
        }

        let Some(reconnects) = notifications.as_mut() else {
            tracing::info!("Event bus does not reconnect, bus bridge stopping");
            return;
        };
        tokio::select! {
            _ = inner.cancel.cancelled() => return,
            changed = reconnects.changed() => {
                if changed.is_err() {
                    return;
                }
            }
            _ = tokio::time::sleep(inner.config.resubscribe_delay) => {}
        }
    }
}

async fn forward_event(inner: &ManagerInner, event: &Event) {
    match Broadcast::from_event(event) {
        Ok(broadcast) => {
            inner.enqueue_broadcast(broadcast).await;
        }
        Err(e) => {
            tracing::error!(event_id = %event.id(), error = %e, "Failed to encode event frame");
            inner.metrics.record_error(e.to_string());
        }
    }
}

#[cfg(test)]
impl Indices {
    /// Every client sits in exactly the buckets its own fields name, and no
    /// bucket is empty or dangling.
    fn check(&self) -> Result<(), String> {
        let mut expected_users: HashMap<&UserId, HashSet<ConnectionId>> = HashMap::new();
        let mut expected_ips: HashMap<&str, HashSet<ConnectionId>> = HashMap::new();
        for (id, session) in &self.clients {
            expected_users.entry(session.user_id()).or_default().insert(*id);
            expected_ips.entry(session.ip_address()).or_default().insert(*id);
        }

        if self.by_user.len() != expected_users.len() {
            return Err("by_user bucket count mismatch".to_string());
        }
        for (user_id, ids) in &self.by_user {
            let actual: HashSet<ConnectionId> = ids.iter().copied().collect();
            if ids.is_empty() || actual.len() != ids.len() {
                return Err(format!("bad bucket for {}", user_id));
            }
            if expected_users.get(user_id) != Some(&actual) {
                return Err(format!("by_user mismatch for {}", user_id));
            }
        }

        if self.by_ip.len() != expected_ips.len() {
            return Err("by_ip bucket count mismatch".to_string());
        }
        for (ip, ids) in &self.by_ip {
            let actual: HashSet<ConnectionId> = ids.iter().copied().collect();
            if ids.is_empty() || expected_ips.get(ip.as_str()) != Some(&actual) {
                return Err(format!("by_ip mismatch for {}", ip));
            }
        }
        Ok(())
    }
}
