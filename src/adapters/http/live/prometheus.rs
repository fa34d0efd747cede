//! Prometheus exposition of the live metrics.
//!
//! The connection manager and the broker keep their own counters. At scrape
//! time their snapshots are copied into a private `metrics` recorder and
//! rendered by `metrics-exporter-prometheus`. The recorder is local to the
//! exporter, so no global recorder has to be installed.

use std::sync::Arc;

use metrics::{counter, describe_counter, describe_gauge, gauge, with_local_recorder};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle, PrometheusRecorder};

use crate::adapters::websocket::ConnectionMetricsSnapshot;
use crate::ports::BrokerMetricsSnapshot;

pub const CONTENT_TYPE: &str = "text/plain; version=0.0.4; charset=utf-8";

// Metric names.

pub const WEBSOCKET_ACTIVE_CONNECTIONS: &str = "websocket_active_connections";
pub const WEBSOCKET_TOTAL_CONNECTIONS: &str = "websocket_total_connections";
pub const WEBSOCKET_CONNECTIONS_REJECTED: &str = "websocket_connections_rejected";
pub const WEBSOCKET_MESSAGES_RECEIVED: &str = "websocket_messages_received";
pub const WEBSOCKET_MESSAGES_SENT: &str = "websocket_messages_sent";
pub const WEBSOCKET_MESSAGES_DROPPED: &str = "websocket_messages_dropped";
pub const WEBSOCKET_ERRORS: &str = "websocket_errors";
pub const WEBSOCKET_AVERAGE_LATENCY_MS: &str = "websocket_average_latency_ms";
pub const WEBSOCKET_MESSAGE_THROUGHPUT_SEC: &str = "websocket_message_throughput_sec";
pub const REDIS_EVENTS_PUBLISHED: &str = "redis_events_published";
pub const REDIS_EVENTS_RECEIVED: &str = "redis_events_received";
pub const REDIS_PUBLISH_ERRORS: &str = "redis_publish_errors";
pub const REDIS_RECONNECT_COUNT: &str = "redis_reconnect_count";
pub const REDIS_LAST_RECONNECT_TIMESTAMP: &str = "redis_last_reconnect_timestamp";

/// Renders live metrics in the Prometheus text format. Cheap to clone;
/// clones share one recorder.
#[derive(Clone)]
pub struct PrometheusExporter {
    recorder: Arc<PrometheusRecorder>,
    handle: PrometheusHandle,
}

impl PrometheusExporter {
    pub fn new() -> Self {
        let recorder = PrometheusBuilder::new().build_recorder();
        let handle = recorder.handle();
        Self {
            recorder: Arc::new(recorder),
            handle,
        }
    }

    /// Records the websocket snapshot and, when present, the broker
    /// snapshot, then renders everything recorded so far.
    pub fn render(
        &self,
        websocket: &ConnectionMetricsSnapshot,
        broker: Option<&BrokerMetricsSnapshot>,
    ) -> String {
        with_local_recorder(self.recorder.as_ref(), || {
            record_websocket(websocket);
            if let Some(broker) = broker {
                record_broker(broker);
            }
        });
        self.handle.render()
    }
}

impl Default for PrometheusExporter {
    fn default() -> Self {
        Self::new()
    }
}

fn record_websocket(snapshot: &ConnectionMetricsSnapshot) {
    describe_gauge!(
        WEBSOCKET_ACTIVE_CONNECTIONS,
        "Current number of active WebSocket connections"
    );
    describe_counter!(
        WEBSOCKET_TOTAL_CONNECTIONS,
        "Total number of WebSocket connections since start"
    );
    describe_counter!(
        WEBSOCKET_CONNECTIONS_REJECTED,
        "Total number of rejected connections due to limits"
    );
    describe_counter!(WEBSOCKET_MESSAGES_RECEIVED, "Total number of messages received");
    describe_counter!(WEBSOCKET_MESSAGES_SENT, "Total number of messages sent");
    describe_counter!(
        WEBSOCKET_MESSAGES_DROPPED,
        "Total number of messages dropped on full client queues"
    );
    describe_counter!(WEBSOCKET_ERRORS, "Total number of WebSocket errors");
    describe_gauge!(
        WEBSOCKET_AVERAGE_LATENCY_MS,
        "Average message latency in milliseconds"
    );
    describe_gauge!(WEBSOCKET_MESSAGE_THROUGHPUT_SEC, "Message throughput per second");

    gauge!(WEBSOCKET_ACTIVE_CONNECTIONS).set(snapshot.active_connections as f64);
    counter!(WEBSOCKET_TOTAL_CONNECTIONS).absolute(snapshot.total_connections);
    counter!(WEBSOCKET_CONNECTIONS_REJECTED).absolute(snapshot.connections_rejected);
    counter!(WEBSOCKET_MESSAGES_RECEIVED).absolute(snapshot.messages_received);
    counter!(WEBSOCKET_MESSAGES_SENT).absolute(snapshot.messages_sent);
    counter!(WEBSOCKET_MESSAGES_DROPPED).absolute(snapshot.messages_dropped);
    counter!(WEBSOCKET_ERRORS).absolute(snapshot.errors);
    gauge!(WEBSOCKET_AVERAGE_LATENCY_MS).set(snapshot.average_latency_ms);
    gauge!(WEBSOCKET_MESSAGE_THROUGHPUT_SEC).set(snapshot.message_throughput_sec);
}

fn record_broker(snapshot: &BrokerMetricsSnapshot) {
    describe_counter!(REDIS_EVENTS_PUBLISHED, "Total events published to Redis");
    describe_counter!(REDIS_EVENTS_RECEIVED, "Total events received from Redis");
    describe_counter!(REDIS_PUBLISH_ERRORS, "Total Redis publish errors");
    describe_counter!(REDIS_RECONNECT_COUNT, "Total Redis reconnections");

    counter!(REDIS_EVENTS_PUBLISHED).absolute(snapshot.events_published);
    counter!(REDIS_EVENTS_RECEIVED).absolute(snapshot.events_received);
    counter!(REDIS_PUBLISH_ERRORS).absolute(snapshot.publish_errors);
    counter!(REDIS_RECONNECT_COUNT).absolute(snapshot.reconnect_count);

    if let Some(at) = snapshot.last_reconnect_time {
        describe_gauge!(
            REDIS_LAST_RECONNECT_TIMESTAMP,
            "Unix timestamp of last reconnection"
        );
        gauge!(REDIS_LAST_RECONNECT_TIMESTAMP).set(at.as_unix_secs() as f64);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::foundation::Timestamp;

    /// Value of the unlabelled sample `name`, if rendered.
    fn sample(text: &str, name: &str) -> Option<f64> {
        text.lines()
            .filter(|line| !line.starts_with('#'))
            .find_map(|line| {
                let mut parts = line.split_whitespace();
                (parts.next() == Some(name)).then(|| parts.next())?
            })
            .and_then(|value| value.parse().ok())
    }

    #[test]
    fn websocket_metrics_render_with_help_and_type() {
        let snapshot = ConnectionMetricsSnapshot {
            active_connections: 3,
            messages_dropped: 7,
            average_latency_ms: 1.5,
            ..Default::default()
        };

        let text = PrometheusExporter::new().render(&snapshot, None);

        assert!(text.contains(
            "# HELP websocket_active_connections Current number of active WebSocket connections"
        ));
        assert!(text.contains("# TYPE websocket_active_connections gauge"));
        assert!(text.contains("# TYPE websocket_messages_dropped counter"));
        assert_eq!(sample(&text, WEBSOCKET_ACTIVE_CONNECTIONS), Some(3.0));
        assert_eq!(sample(&text, WEBSOCKET_MESSAGES_DROPPED), Some(7.0));
        assert_eq!(sample(&text, WEBSOCKET_AVERAGE_LATENCY_MS), Some(1.5));
        assert!(!text.contains("redis_"));
    }

    #[test]
    fn broker_metrics_are_included_when_present() {
        let broker = BrokerMetricsSnapshot {
            events_published: 10,
            reconnect_count: 2,
            ..Default::default()
        };

        let text =
            PrometheusExporter::new().render(&ConnectionMetricsSnapshot::default(), Some(&broker));

        assert_eq!(sample(&text, REDIS_EVENTS_PUBLISHED), Some(10.0));
        assert!(text.contains("# TYPE redis_reconnect_count counter"));
        assert_eq!(sample(&text, REDIS_RECONNECT_COUNT), Some(2.0));
        assert!(!text.contains(REDIS_LAST_RECONNECT_TIMESTAMP));
    }

    #[test]
    fn last_reconnect_is_rendered_in_seconds() {
        let at = Timestamp::now();
        let broker = BrokerMetricsSnapshot {
            last_reconnect_time: Some(at),
            ..Default::default()
        };

        let text =
            PrometheusExporter::new().render(&ConnectionMetricsSnapshot::default(), Some(&broker));

        assert_eq!(
            sample(&text, REDIS_LAST_RECONNECT_TIMESTAMP),
            Some(at.as_unix_secs() as f64)
        );
    }

    #[test]
    fn later_scrapes_report_current_values() {
        let exporter = PrometheusExporter::new();
        let mut snapshot = ConnectionMetricsSnapshot {
            active_connections: 5,
            total_connections: 5,
            ..Default::default()
        };
        exporter.render(&snapshot, None);

        snapshot.active_connections = 2;
        snapshot.total_connections = 9;
        let text = exporter.clone().render(&snapshot, None);

        assert_eq!(sample(&text, WEBSOCKET_ACTIVE_CONNECTIONS), Some(2.0));
        assert_eq!(sample(&text, WEBSOCKET_TOTAL_CONNECTIONS), Some(9.0));
    }

    #[test]
    fn metric_names_are_snake_case() {
        let names = [
            WEBSOCKET_ACTIVE_CONNECTIONS,
            WEBSOCKET_TOTAL_CONNECTIONS,
            WEBSOCKET_CONNECTIONS_REJECTED,
            WEBSOCKET_MESSAGES_RECEIVED,
            WEBSOCKET_MESSAGES_SENT,
            WEBSOCKET_MESSAGES_DROPPED,
            WEBSOCKET_ERRORS,
            WEBSOCKET_AVERAGE_LATENCY_MS,
            WEBSOCKET_MESSAGE_THROUGHPUT_SEC,
            REDIS_EVENTS_PUBLISHED,
            REDIS_EVENTS_RECEIVED,
            REDIS_PUBLISH_ERRORS,
            REDIS_RECONNECT_COUNT,
            REDIS_LAST_RECONNECT_TIMESTAMP,
        ];
        for name in names {
            assert!(
                name.chars().all(|c| c.is_ascii_lowercase() || c == '_'),
                "metric name '{name}' must be snake_case"
            );
        }
    }
}
