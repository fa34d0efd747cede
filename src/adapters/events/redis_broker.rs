//! Redis-backed event bus.
//!
//! Events are JSON-encoded and published to a Redis channel named after
//! `event.channel()`, so every process subscribed to that channel (or a
//! matching pattern) receives them.
//!
//! # Architecture
//!
//! ```text
//!                        ┌──────────────────────── RedisBroker ───────────────────────┐
//!  publish ─ retry x3 ──►│ transport.publish ─► Redis                                  │
//!           (linear)     │                                                             │
//!                        │ monitor task ── every 10s ── ping ──┐                       │
//!                        │      ▲                              ▼ fail                  │
//!                        │      └──── reconnect signal (mpsc 1, coalesced) ◄── publish │
//!                        │                                          failure / stream   │
//!                        │                                          end                │
//!                        │ receive task per subscription:                              │
//!                        │   payload stream ─ decode ─ try_send ─► EventStream (100)   │
//!                        └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Reconnects
//!
//! The monitor task owns the [`ReconnectMachine`]: exponential backoff from
//! 1s to 30s, looping until a connect succeeds. A successful reconnect bumps
//! the metrics and the generation published on
//! [`EventBus::reconnect_notifications`]. Subscriptions whose stream ended
//! while the connection was down are removed; subscribers re-subscribe
//! after the notification. Events published during the gap are lost.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use parking_lot::Mutex;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use crate::domain::live::Event;
use crate::ports::{BrokerMetricsSnapshot, BusError, EventBus, EventStream};

use super::metrics::BrokerMetrics;
use super::reconnect::{Backoff, ConnectionState, ReconnectMachine};
use super::redis_transport::{
    PayloadStream, PubSubTransport, RedisTimeouts, RedisTransport, SubscriptionKind,
};

/// Tunables for [`RedisBroker`].
#[derive(Debug, Clone)]
pub struct RedisBrokerConfig {
    pub url: String,
    pub timeouts: RedisTimeouts,
    pub health_check_interval: Duration,
    pub backoff: Backoff,
    pub publish_attempts: u32,
    /// Sleep after failed attempt `n` is `n * publish_retry_step`.
    pub publish_retry_step: Duration,
    pub subscriber_queue_capacity: usize,
}

impl Default for RedisBrokerConfig {
    fn default() -> Self {
        Self {
            url: "redis://127.0.0.1:6379".to_string(),
            timeouts: RedisTimeouts::default(),
            health_check_interval: Duration::from_secs(10),
            backoff: Backoff::default(),
            publish_attempts: 3,
            publish_retry_step: Duration::from_millis(100),
            subscriber_queue_capacity: 100,
        }
    }
}

struct SubscriptionEntry {
    id: u64,
    cancel: CancellationToken,
}

struct Inner {
    transport: Arc<dyn PubSubTransport>,
    config: RedisBrokerConfig,
    closed: AtomicBool,
    subscriptions: Mutex<HashMap<String, SubscriptionEntry>>,
    next_subscription_id: AtomicU64,
    machine: Mutex<ReconnectMachine>,
    reconnect_tx: mpsc::Sender<()>,
    generation: watch::Sender<u64>,
    metrics: BrokerMetrics,
    cancel: CancellationToken,
}

/// Multi-process event bus over Redis pub/sub.
pub struct RedisBroker {
    inner: Arc<Inner>,
}

impl RedisBroker {
    /// Connects to Redis and starts the connection monitor.
    ///
    /// # Errors
    ///
    /// Fails if the URL is malformed or the initial PING does not succeed.
    pub async fn connect(config: RedisBrokerConfig) -> Result<Self, BusError> {
        let transport = RedisTransport::new(&config.url, config.timeouts)?;
        Self::with_transport(Arc::new(transport), config).await
    }

    /// Starts a broker over an arbitrary transport.
    pub async fn with_transport(
        transport: Arc<dyn PubSubTransport>,
        config: RedisBrokerConfig,
    ) -> Result<Self, BusError> {
        transport.connect().await?;

        let (reconnect_tx, reconnect_rx) = mpsc::channel(1);
        let (generation, _) = watch::channel(0u64);
        let inner = Arc::new(Inner {
            transport,
            machine: Mutex::new(ReconnectMachine::new(config.backoff)),
            config,
            closed: AtomicBool::new(false),
            subscriptions: Mutex::new(HashMap::new()),
            next_subscription_id: AtomicU64::new(1),
            reconnect_tx,
            generation,
            metrics: BrokerMetrics::new(),
            cancel: CancellationToken::new(),
        });

        tokio::spawn(monitor_connection(Arc::clone(&inner), reconnect_rx));

        tracing::info!("Redis live broker active (multi-instance ready)");
        Ok(Self { inner })
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.inner.machine.lock().state()
    }

    pub fn reconnect_count(&self) -> u64 {
        self.inner.metrics.reconnect_count()
    }

    /// Asks the monitor task to reconnect. Coalesced with pending requests.
    pub fn request_reconnect(&self) {
        self.inner.request_reconnect();
    }

    async fn open_subscription(
        &self,
        key: &str,
        kind: SubscriptionKind,
    ) -> Result<EventStream, BusError> {
        let inner = &self.inner;
        if inner.is_closed() {
            return Err(BusError::Closed);
        }

        // Reserve the key before any I/O so concurrent callers see it.
        let id = inner.next_subscription_id.fetch_add(1, Ordering::Relaxed);
        let cancel = inner.cancel.child_token();
        {
            let mut subscriptions = inner.subscriptions.lock();
            if subscriptions.contains_key(key) {
                return Err(BusError::AlreadySubscribed(key.to_string()));
            }
            subscriptions.insert(
                key.to_string(),
                SubscriptionEntry {
                    id,
                    cancel: cancel.clone(),
                },
            );
        }

        let stream = match inner.transport.subscribe(key, kind).await {
            Ok(stream) => stream,
            Err(e) => {
                inner.remove_subscription(key, id);
                return Err(e);
            }
        };

        let (tx, rx) = mpsc::channel(inner.config.subscriber_queue_capacity);
        tokio::spawn(receive_messages(
            Arc::clone(inner),
            key.to_string(),
            id,
            stream,
            tx,
            cancel,
        ));

        match kind {
            SubscriptionKind::Channel => tracing::info!(channel = %key, "Subscribed to channel"),
            SubscriptionKind::Pattern => tracing::info!(pattern = %key, "Subscribed to pattern"),
        }
        Ok(rx)
    }
}

impl std::fmt::Debug for RedisBroker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisBroker")
            .field("state", &self.connection_state())
            .field("closed", &self.inner.is_closed())
            .finish_non_exhaustive()
    }
}

impl Inner {
    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    fn request_reconnect(&self) {
        match self.reconnect_tx.try_send(()) {
            Ok(()) => tracing::debug!("Redis reconnect requested"),
            // A request is already queued or the monitor has stopped.
            Err(TrySendError::Full(())) | Err(TrySendError::Closed(())) => {}
        }
    }

    fn remove_subscription(&self, key: &str, id: u64) {
        let mut subscriptions = self.subscriptions.lock();
        if subscriptions.get(key).is_some_and(|entry| entry.id == id) {
            subscriptions.remove(key);
        }
    }

    async fn reconnect(&self) {
        if !self.machine.lock().begin() {
            return;
        }

        tracing::warn!("Redis connection lost, attempting to reconnect");

        loop {
            if self.cancel.is_cancelled() {
                return;
            }

            let attempt = self.machine.lock().attempt().unwrap_or(1);
            tracing::info!(attempt, "Attempting Redis reconnect");

            match self.transport.connect().await {
                Ok(()) => {
                    if self.machine.lock().attempt_succeeded().is_none() {
                        // Closed while the attempt was in flight.
                        return;
                    }
                    let total = self.metrics.record_reconnect();
                    self.generation.send_modify(|g| *g += 1);
                    tracing::info!(
                        attempt,
                        total_reconnects = total,
                        "Redis reconnected successfully"
                    );
                    return;
                }
                Err(e) => {
                    let next = self.machine.lock().attempt_failed();
                    let Some(delay) = next else {
                        return;
                    };
                    tracing::error!(
                        attempt,
                        error = %e,
                        backoff_ms = delay.as_millis() as u64,
                        "Redis reconnect failed"
                    );
                    tokio::select! {
                        _ = self.cancel.cancelled() => return,
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
            }
        }
    }
}

/// Health-checks the connection and runs reconnects. One per broker.
async fn monitor_connection(inner: Arc<Inner>, mut reconnect_rx: mpsc::Receiver<()>) {
    let period = inner.config.health_check_interval;
    let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = inner.cancel.cancelled() => break,
            _ = ticker.tick() => {
                if let Err(e) = inner.transport.ping().await {
                    tracing::warn!(error = %e, "Redis health check failed, initiating reconnect");
                    inner.request_reconnect();
                }
            }
            Some(()) = reconnect_rx.recv() => {
                inner.reconnect().await;
                // Requests raised during the outage were served by this run.
                while reconnect_rx.try_recv().is_ok() {}
            }
        }
    }

    tracing::debug!("Redis connection monitor stopped");
}

/// Decodes one subscription's payloads into its event queue.
async fn receive_messages(
    inner: Arc<Inner>,
    key: String,
    id: u64,
    mut stream: PayloadStream,
    tx: mpsc::Sender<Arc<Event>>,
    cancel: CancellationToken,
) {
    let mut stream_lost = false;

    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                tracing::debug!(subscription = %key, "Subscription cancelled, stopping message receiver");
                break;
            }
            _ = tx.closed() => {
                tracing::debug!(subscription = %key, "Subscriber dropped, stopping message receiver");
                break;
            }
            next = stream.next() => {
                let Some(payload) = next else {
                    tracing::debug!(subscription = %key, "Redis subscription stream closed");
                    stream_lost = true;
                    break;
                };

                let event = match Event::from_json(&payload) {
                    Ok(event) => event,
                    Err(e) => {
                        tracing::error!(
                            subscription = %key,
                            error = %e,
                            payload = %payload,
                            "Failed to decode event"
                        );
                        continue;
                    }
                };

                inner.metrics.record_received();

                match tx.try_send(Arc::new(event)) {
                    Ok(()) => {}
                    Err(TrySendError::Full(event)) => {
                        tracing::warn!(
                            event_id = %event.id(),
                            channel = %event.channel(),
                            "Event channel full, dropping event"
                        );
                    }
                    Err(TrySendError::Closed(_)) => break,
                }
            }
        }
    }

    inner.remove_subscription(&key, id);
    if stream_lost && !inner.is_closed() {
        inner.request_reconnect();
    }
}

#[async_trait]
impl EventBus for RedisBroker {
    async fn publish(&self, event: Event) -> Result<(), BusError> {
        let inner = &self.inner;
        if inner.is_closed() {
            return Err(BusError::Closed);
        }

        let data = event.to_json().map_err(|e| {
            inner.metrics.record_publish_error();
            BusError::Serialization(e.to_string())
        })?;

        let attempts = inner.config.publish_attempts.max(1);
        let mut last_error = None;
        for attempt in 1..=attempts {
            match inner.transport.publish(event.channel(), &data).await {
                Ok(()) => {
                    inner.metrics.record_published();
                    tracing::debug!(
                        event_id = %event.id(),
                        event_type = %event.event_type(),
                        channel = %event.channel(),
                        "Event published"
                    );
                    return Ok(());
                }
                Err(e) => {
                    if attempt < attempts {
                        tracing::warn!(retry = attempt, error = %e, "Publish failed, retrying");
                        tokio::time::sleep(inner.config.publish_retry_step * attempt).await;
                    }
                    last_error = Some(e);
                }
            }
        }

        inner.metrics.record_publish_error();
        inner.request_reconnect();
        Err(BusError::PublishFailed {
            attempts,
            reason: last_error.map(|e| e.to_string()).unwrap_or_default(),
        })
    }

    async fn subscribe(&self, channel: &str) -> Result<EventStream, BusError> {
        self.open_subscription(channel, SubscriptionKind::Channel).await
    }

    async fn subscribe_pattern(&self, pattern: &str) -> Result<EventStream, BusError> {
        self.open_subscription(pattern, SubscriptionKind::Pattern).await
    }

    async fn unsubscribe(&self, channel: &str) -> Result<(), BusError> {
        if self.inner.is_closed() {
            return Err(BusError::Closed);
        }

        let entry = self
            .inner
            .subscriptions
            .lock()
            .remove(channel)
            .ok_or_else(|| BusError::NotSubscribed(channel.to_string()))?;
        entry.cancel.cancel();

        tracing::info!(channel = %channel, "Unsubscribed from channel");
        Ok(())
    }

    async fn close(&self) -> Result<(), BusError> {
        let inner = &self.inner;
        if inner.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }

        inner.machine.lock().close();
        inner.cancel.cancel();
        inner.subscriptions.lock().clear();
        inner.transport.close().await;

        tracing::info!("Redis event bus closed");
        Ok(())
    }

    async fn health_check(&self) -> Result<(), BusError> {
        if self.inner.is_closed() {
            return Err(BusError::Closed);
        }
        self.inner.transport.ping().await
    }

    fn metrics(&self) -> Option<BrokerMetricsSnapshot> {
        Some(self.inner.metrics.snapshot())
    }

    fn reconnect_notifications(&self) -> Option<watch::Receiver<u64>> {
        Some(self.inner.generation.subscribe())
    }
}

impl Drop for RedisBroker {
    fn drop(&mut self) {
        self.inner.cancel.cancel();
    }
}
