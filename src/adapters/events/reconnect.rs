//! Reconnect state machine for network-backed brokers.
//!
//! ```text
//!             begin()                 attempt_failed()
//!  Connected ─────────► Reconnecting ◄──────────────┐
//!      ▲                 {attempt, delay} ──────────┘
//!      │ attempt_succeeded()   │
//!      └───────────────────────┘
//!
//!  any state ── close() ──► Closed   (terminal)
//! ```
//!
//! `begin()` only succeeds from `Connected`, which is what keeps two
//! reconnect loops from running at once.

use std::time::Duration;

/// Exponential backoff: `initial`, doubling per attempt, capped at `max`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Backoff {
    initial: Duration,
    max: Duration,
}

impl Backoff {
    pub fn new(initial: Duration, max: Duration) -> Self {
        Self {
            initial,
            max: max.max(initial),
        }
    }

    /// Delay to wait after failed attempt number `attempt` (1-based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(31);
        self.initial
            .checked_mul(1u32 << exponent)
            .map_or(self.max, |delay| delay.min(self.max))
    }

    pub fn initial(&self) -> Duration {
        self.initial
    }

    pub fn max(&self) -> Duration {
        self.max
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new(Duration::from_secs(1), Duration::from_secs(30))
    }
}

/// Broker connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connected,
    Reconnecting { attempt: u32, next_delay: Duration },
    Closed,
}

/// Drives [`ConnectionState`] transitions.
#[derive(Debug)]
pub struct ReconnectMachine {
    state: ConnectionState,
    backoff: Backoff,
}

impl ReconnectMachine {
    pub fn new(backoff: Backoff) -> Self {
        Self {
            state: ConnectionState::Connected,
            backoff,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// Enters `Reconnecting` at attempt 1.
    ///
    /// Returns false when a reconnect is already in progress or the broker
    /// is closed; the caller must not start another loop.
    pub fn begin(&mut self) -> bool {
        match self.state {
            ConnectionState::Connected => {
                self.state = ConnectionState::Reconnecting {
                    attempt: 1,
                    next_delay: self.backoff.delay_for(1),
                };
                true
            }
            ConnectionState::Reconnecting { .. } | ConnectionState::Closed => false,
        }
    }

    /// Current attempt number, if reconnecting.
    pub fn attempt(&self) -> Option<u32> {
        match self.state {
            ConnectionState::Reconnecting { attempt, .. } => Some(attempt),
            _ => None,
        }
    }

    /// Records a failed attempt and returns how long to wait before the next.
    ///
    /// Returns `None` if the machine is not reconnecting (closed meanwhile).
    pub fn attempt_failed(&mut self) -> Option<Duration> {
        match self.state {
            ConnectionState::Reconnecting {
                attempt,
                next_delay,
            } => {
                let attempt = attempt.saturating_add(1);
                self.state = ConnectionState::Reconnecting {
                    attempt,
                    next_delay: self.backoff.delay_for(attempt),
                };
                Some(next_delay)
            }
            _ => None,
        }
    }

    /// Returns to `Connected`. Returns the number of attempts it took.
    pub fn attempt_succeeded(&mut self) -> Option<u32> {
        match self.state {
            ConnectionState::Reconnecting { attempt, .. } => {
                self.state = ConnectionState::Connected;
                Some(attempt)
            }
            _ => None,
        }
    }

    pub fn close(&mut self) {
        self.state = ConnectionState::Closed;
    }

    pub fn is_closed(&self) -> bool {
        self.state == ConnectionState::Closed
    }
}
