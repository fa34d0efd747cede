//! Transport-neutral WebSocket frames.
//!
//! The connection loops speak [`Frame`] so they can run over axum's socket
//! in production and over plain channels in tests.

/// A WebSocket frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Text(String),
    Binary(Vec<u8>),
    Ping(Vec<u8>),
    Pong(Vec<u8>),
    Close(Option<CloseReason>),
}

/// Close code and reason sent to a client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloseReason {
    pub code: u16,
    pub reason: String,
}

impl CloseReason {
    pub const NORMAL: u16 = 1000;
    pub const GOING_AWAY: u16 = 1001;
    pub const POLICY_VIOLATION: u16 = 1008;

    pub fn new(code: u16, reason: impl Into<String>) -> Self {
        Self {
            code,
            reason: reason.into(),
        }
    }

    pub fn normal() -> Self {
        Self::new(Self::NORMAL, "")
    }

    pub fn shutting_down() -> Self {
        Self::new(Self::GOING_AWAY, "Server shutting down")
    }

    pub fn idle_timeout() -> Self {
        Self::new(Self::GOING_AWAY, "Idle timeout")
    }

    pub fn policy(reason: impl Into<String>) -> Self {
        Self::new(Self::POLICY_VIOLATION, reason)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn close_reasons_use_standard_codes() {
        assert_eq!(CloseReason::normal().code, 1000);
        assert_eq!(CloseReason::shutting_down().code, 1001);
        assert_eq!(CloseReason::shutting_down().reason, "Server shutting down");
        assert_eq!(CloseReason::policy("limit").code, 1008);
    }
}
