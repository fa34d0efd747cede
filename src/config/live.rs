//! Live layer configuration

use serde::Deserialize;
use std::time::Duration;

use crate::adapters::websocket::ManagerConfig;

use super::error::ValidationError;

/// Live layer configuration (connection limits, timeouts, broker choice)
#[derive(Debug, Clone, Deserialize)]
pub struct LiveConfig {
    /// Serve WebSocket connections at all
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Use the in-process broker even when a Redis URL is set
    #[serde(default)]
    pub use_memory_broker: bool,

    #[serde(default = "default_connection_limit")]
    pub max_connections_per_user: usize,

    #[serde(default = "default_connection_limit")]
    pub max_connections_per_ip: usize,

    /// Capacity of each session's outbound queue
    #[serde(default = "default_send_buffer")]
    pub send_buffer_size: usize,

    #[serde(default = "default_idle_timeout")]
    pub idle_timeout_secs: u64,

    /// Idle sweep interval
    #[serde(default = "default_heartbeat_interval")]
    pub heartbeat_interval_secs: u64,

    #[serde(default = "default_pong_wait")]
    pub pong_wait_secs: u64,

    #[serde(default = "default_write_wait")]
    pub write_wait_secs: u64,

    /// Largest accepted client frame in bytes
    #[serde(default = "default_max_message_size")]
    pub max_message_size: usize,

    #[serde(default = "default_shutdown_timeout")]
    pub shutdown_timeout_secs: u64,

    /// Take the client IP from the first `X-Forwarded-For` hop
    #[serde(default)]
    pub trust_forwarded_for: bool,
}

impl LiveConfig {
    pub fn manager_config(&self) -> ManagerConfig {
        ManagerConfig {
            max_connections_per_user: self.max_connections_per_user,
            max_connections_per_ip: self.max_connections_per_ip,
            send_buffer_size: self.send_buffer_size,
            idle_timeout: Duration::from_secs(self.idle_timeout_secs),
            heartbeat_interval: Duration::from_secs(self.heartbeat_interval_secs),
            pong_wait: Duration::from_secs(self.pong_wait_secs),
            write_wait: Duration::from_secs(self.write_wait_secs),
            max_message_size: self.max_message_size,
            shutdown_timeout: Duration::from_secs(self.shutdown_timeout_secs),
            ..ManagerConfig::default()
        }
    }

    /// Validate live configuration
    pub fn validate(&self) -> Result<(), ValidationError> {
        let positive = [
            ("live.max_connections_per_user", self.max_connections_per_user as u64),
            ("live.max_connections_per_ip", self.max_connections_per_ip as u64),
            ("live.send_buffer_size", self.send_buffer_size as u64),
            ("live.idle_timeout_secs", self.idle_timeout_secs),
            ("live.heartbeat_interval_secs", self.heartbeat_interval_secs),
            ("live.write_wait_secs", self.write_wait_secs),
            ("live.max_message_size", self.max_message_size as u64),
        ];
        if let Some((name, _)) = positive.iter().find(|(_, value)| *value == 0) {
            return Err(ValidationError::MustBePositive(*name));
        }
        if self.pong_wait_secs <= self.write_wait_secs {
            return Err(ValidationError::InvalidPongWait);
        }
        Ok(())
    }
}

impl Default for LiveConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            use_memory_broker: false,
            max_connections_per_user: default_connection_limit(),
            max_connections_per_ip: default_connection_limit(),
            send_buffer_size: default_send_buffer(),
            idle_timeout_secs: default_idle_timeout(),
            heartbeat_interval_secs: default_heartbeat_interval(),
            pong_wait_secs: default_pong_wait(),
            write_wait_secs: default_write_wait(),
            max_message_size: default_max_message_size(),
            shutdown_timeout_secs: default_shutdown_timeout(),
            trust_forwarded_for: false,
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_connection_limit() -> usize {
    100
}

fn default_send_buffer() -> usize {
    256
}

fn default_idle_timeout() -> u64 {
    300
}

fn default_heartbeat_interval() -> u64 {
    30
}

fn default_pong_wait() -> u64 {
    60
}

fn default_write_wait() -> u64 {
    10
}

fn default_max_message_size() -> usize {
    2 * 1024 * 1024
}

fn default_shutdown_timeout() -> u64 {
    10
}
