//! In-process event bus.
//!
//! Fans events out to bounded per-subscriber queues inside one process. It
//! is the default for development and single-instance deployments, and the
//! bus most tests run against.
//!
//! ```text
//!              ┌──────────── Hub (shared) ─────────────┐
//!  publish ──► │ exact:    "conv:1" → [q(h1), q(h2)]   │ ──► try_send per queue
//!              │ patterns: "*"      → [q(h3)]          │
//!              └────────────────────────────────────────┘
//! ```
//!
//! Several [`MemoryBroker`] handles can share one hub (see [`MemoryBroker::attach`]).
//! Duplicate-subscription checks are per handle, so independent components
//! can each subscribe to the same channel while one component cannot
//! accidentally subscribe twice.
//!
//! Patterns use glob syntax (`*`, `?`, `[..]`, `{a,b}`) and are matched
//! against the full channel name, so `*` receives every event.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use globset::{Glob, GlobMatcher};
use parking_lot::RwLock;
use tokio::sync::mpsc::{self, error::TrySendError};

use crate::domain::live::Event;
use crate::ports::{BusError, EventBus, EventStream};

/// Capacity of each subscriber queue.
pub const SUBSCRIBER_QUEUE_CAPACITY: usize = 100;

struct Subscriber {
    handle: u64,
    tx: mpsc::Sender<Arc<Event>>,
}

struct PatternSubscriber {
    handle: u64,
    pattern: String,
    matcher: GlobMatcher,
    tx: mpsc::Sender<Arc<Event>>,
}

#[derive(Default)]
struct HubState {
    closed: bool,
    exact: HashMap<String, Vec<Subscriber>>,
    patterns: Vec<PatternSubscriber>,
}

impl HubState {
    fn prune_disconnected(&mut self) {
        self.exact.retain(|_, subs| {
            subs.retain(|s| !s.tx.is_closed());
            !subs.is_empty()
        });
        self.patterns.retain(|p| !p.tx.is_closed());
    }
}

struct Hub {
    state: RwLock<HubState>,
    next_handle: AtomicU64,
}

/// Handle onto an in-process event hub.
pub struct MemoryBroker {
    hub: Arc<Hub>,
    handle: u64,
}

impl MemoryBroker {
    /// Creates a new hub and returns the first handle onto it.
    pub fn new() -> Self {
        tracing::warn!("Using in-memory event bus - not suitable for multi-instance deployments");
        Self {
            hub: Arc::new(Hub {
                state: RwLock::new(HubState::default()),
                next_handle: AtomicU64::new(1),
            }),
            handle: 0,
        }
    }

    /// Returns another handle onto the same hub.
    ///
    /// Events published through any handle reach subscribers of every
    /// handle. Closing any handle closes the hub.
    pub fn attach(&self) -> Self {
        Self {
            hub: Arc::clone(&self.hub),
            handle: self.hub.next_handle.fetch_add(1, Ordering::Relaxed),
        }
    }

    /// Number of live subscriptions (exact and pattern) that would receive
    /// an event on `channel`.
    pub fn subscriber_count(&self, channel: &str) -> usize {
        let state = self.hub.state.read();
        let exact = state
            .exact
            .get(channel)
            .map(|subs| subs.iter().filter(|s| !s.tx.is_closed()).count())
            .unwrap_or(0);
        let patterns = state
            .patterns
            .iter()
            .filter(|p| !p.tx.is_closed() && p.matcher.is_match(channel))
            .count();
        exact + patterns
    }

    fn subscribe_exact(&self, channel: &str) -> Result<EventStream, BusError> {
        let mut state = self.hub.state.write();
        if state.closed {
            return Err(BusError::Closed);
        }

        let subs = state.exact.entry(channel.to_string()).or_default();
        if subs.iter().any(|s| s.handle == self.handle && !s.tx.is_closed()) {
            return Err(BusError::AlreadySubscribed(channel.to_string()));
        }
        subs.retain(|s| !s.tx.is_closed());

        let (tx, rx) = mpsc::channel(SUBSCRIBER_QUEUE_CAPACITY);
        subs.push(Subscriber {
            handle: self.handle,
            tx,
        });

        tracing::info!(
            channel = %channel,
            total_subscribers = subs.len(),
            "Subscribed to channel"
        );
        Ok(rx)
    }
}

impl Default for MemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for MemoryBroker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryBroker")
            .field("handle", &self.handle)
            .finish_non_exhaustive()
    }
}

fn is_glob(pattern: &str) -> bool {
    pattern.contains(['*', '?', '[', '{'])
}

#[async_trait]
impl EventBus for MemoryBroker {
    async fn publish(&self, event: Event) -> Result<(), BusError> {
        let event = Arc::new(event);
        let mut saw_disconnected = false;

        {
            let state = self.hub.state.read();
            if state.closed {
                return Err(BusError::Closed);
            }

            let exact = state
                .exact
                .get(event.channel())
                .into_iter()
                .flatten()
                .map(|s| &s.tx);
            let patterns = state
                .patterns
                .iter()
                .filter(|p| p.matcher.is_match(event.channel()))
                .map(|p| &p.tx);

            let mut delivered = 0usize;
            for tx in exact.chain(patterns) {
                match tx.try_send(Arc::clone(&event)) {
                    Ok(()) => delivered += 1,
                    Err(TrySendError::Full(_)) => {
                        tracing::warn!(
                            event_id = %event.id(),
                            channel = %event.channel(),
                            "Subscriber channel full, dropping event"
                        );
                    }
                    Err(TrySendError::Closed(_)) => saw_disconnected = true,
                }
            }

            if delivered == 0 {
                tracing::debug!(
                    event_id = %event.id(),
                    channel = %event.channel(),
                    "No subscribers received event"
                );
            } else {
                tracing::debug!(
                    event_id = %event.id(),
                    event_type = %event.event_type(),
                    channel = %event.channel(),
                    delivered,
                    "Event published"
                );
            }
        }

        if saw_disconnected {
            self.hub.state.write().prune_disconnected();
        }
        Ok(())
    }

    async fn subscribe(&self, channel: &str) -> Result<EventStream, BusError> {
        self.subscribe_exact(channel)
    }

    async fn subscribe_pattern(&self, pattern: &str) -> Result<EventStream, BusError> {
        if !is_glob(pattern) {
            return self.subscribe_exact(pattern);
        }

        let matcher = Glob::new(pattern)
            .map_err(|e| BusError::InvalidPattern {
                pattern: pattern.to_string(),
                reason: e.to_string(),
            })?
            .compile_matcher();

        let mut state = self.hub.state.write();
        if state.closed {
            return Err(BusError::Closed);
        }
        if state
            .patterns
            .iter()
            .any(|p| p.handle == self.handle && p.pattern == pattern && !p.tx.is_closed())
        {
            return Err(BusError::AlreadySubscribed(pattern.to_string()));
        }

        let (tx, rx) = mpsc::channel(SUBSCRIBER_QUEUE_CAPACITY);
        state.patterns.push(PatternSubscriber {
            handle: self.handle,
            pattern: pattern.to_string(),
            matcher,
            tx,
        });

        tracing::info!(pattern = %pattern, "Subscribed to channel pattern");
        Ok(rx)
    }

    async fn unsubscribe(&self, channel: &str) -> Result<(), BusError> {
        let mut state = self.hub.state.write();
        if state.closed {
            return Err(BusError::Closed);
        }

        let mut removed = 0usize;
        if let Some(subs) = state.exact.get_mut(channel) {
            let before = subs.len();
            subs.retain(|s| s.handle != self.handle);
            removed += before - subs.len();
            if subs.is_empty() {
                state.exact.remove(channel);
            }
        }

        let before = state.patterns.len();
        state
            .patterns
            .retain(|p| !(p.handle == self.handle && p.pattern == channel));
        removed += before - state.patterns.len();

        if removed == 0 {
            return Err(BusError::NotSubscribed(channel.to_string()));
        }

        tracing::info!(channel = %channel, "Unsubscribed from channel");
        Ok(())
    }

    async fn close(&self) -> Result<(), BusError> {
        let mut state = self.hub.state.write();
        if state.closed {
            return Ok(());
        }

        state.closed = true;
        // Dropping the senders ends every subscriber stream.
        state.exact.clear();
        state.patterns.clear();

        tracing::info!("Memory event bus closed");
        Ok(())
    }

    async fn health_check(&self) -> Result<(), BusError> {
        if self.hub.state.read().closed {
            return Err(BusError::Closed);
        }
        Ok(())
    }
}
