//! HTTP DTOs for the live endpoints.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::adapters::websocket::ConnectionMetricsSnapshot;
use crate::ports::BrokerMetricsSnapshot;

// ════════════════════════════════════════════════════════════════════════════════
// Request DTOs
// ════════════════════════════════════════════════════════════════════════════════

/// Request for the online state of several users.
#[derive(Debug, Clone, Deserialize)]
pub struct BulkPresenceRequest {
    pub user_ids: Vec<String>,
}

// ════════════════════════════════════════════════════════════════════════════════
// Response DTOs
// ════════════════════════════════════════════════════════════════════════════════

/// Online state of one user on this instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PresenceResponse {
    pub user_id: String,
    pub online: bool,
    pub connection_count: usize,
}

/// Online state keyed by user id. Ids that fail validation are omitted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BulkPresenceResponse {
    pub presence: BTreeMap<String, bool>,
}

/// Combined metrics snapshot.
#[derive(Debug, Clone, Serialize)]
pub struct LiveMetricsResponse {
    pub websocket: ConnectionMetricsSnapshot,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub redis: Option<BrokerMetricsSnapshot>,
}

/// Standard error response.
#[derive(Debug, Clone, Serialize)]
pub struct ErrorResponse {
    /// Error code for programmatic handling.
    pub error_code: String,
    /// Human-readable error message.
    pub message: String,
}

impl ErrorResponse {
    pub fn new(error_code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            error_code: error_code.into(),
            message: message.into(),
        }
    }

    pub fn invalid_request(message: impl Into<String>) -> Self {
        Self::new("INVALID_REQUEST", message)
    }

    pub fn unavailable() -> Self {
        Self::new("SERVICE_UNAVAILABLE", "Live service not available")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn metrics_response_omits_redis_for_memory_broker() {
        let response = LiveMetricsResponse {
            websocket: ConnectionMetricsSnapshot::default(),
            redis: None,
        };
        let value = serde_json::to_value(response).unwrap();
        assert!(value.get("redis").is_none());
        assert_eq!(value["websocket"]["active_connections"], 0);
    }

    #[test]
    fn bulk_request_requires_user_ids() {
        assert!(serde_json::from_str::<BulkPresenceRequest>("{}").is_err());
        let request: BulkPresenceRequest =
            serde_json::from_str(r#"{"user_ids":["a","b"]}"#).unwrap();
        assert_eq!(request.user_ids.len(), 2);
    }
}
