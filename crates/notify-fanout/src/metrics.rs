//! Connection metrics
//!
//! Counters live in a per-manager Prometheus registry and are read directly,
//! never through the manager's event loop.

use prometheus::{Encoder, IntCounter, IntGauge, Registry, TextEncoder};
use serde::Serialize;

/// Point-in-time copy of the connection counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct MetricsSnapshot {
    pub total_connections: u64,
    pub active_connections: i64,
    pub messages_sent: u64,
    pub messages_received: u64,
    pub errors: u64,
}

/// Prometheus counters for the connection registry
pub struct ConnectionMetrics {
    registry: Registry,
    pub(crate) connections_total: IntCounter,
    pub(crate) connections_active: IntGauge,
    pub(crate) messages_sent_total: IntCounter,
    pub(crate) messages_received_total: IntCounter,
    pub(crate) errors_total: IntCounter,
}

impl ConnectionMetrics {
    pub fn new() -> Self {
        let registry = Registry::new();
        let counter = |name: &str, help: &str| {
            let counter = IntCounter::new(name, help).expect("metric name is valid");
            registry
                .register(Box::new(counter.clone()))
                .expect("metric registered once");
            counter
        };

        let connections_total = counter("connections_total", "Connections accepted since start");
        let messages_sent_total = counter("messages_sent_total", "Payloads enqueued for clients");
        let messages_received_total =
            counter("messages_received_total", "Data frames received from clients");
        let errors_total = counter("errors_total", "Connection errors and slow-consumer drops");

        let connections_active =
            IntGauge::new("connections_active", "Currently open connections").expect("metric name is valid");
        registry
            .register(Box::new(connections_active.clone()))
            .expect("metric registered once");

        Self {
            registry,
            connections_total,
            connections_active,
            messages_sent_total,
            messages_received_total,
            errors_total,
        }
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            total_connections: self.connections_total.get(),
            active_connections: self.connections_active.get(),
            messages_sent: self.messages_sent_total.get(),
            messages_received: self.messages_received_total.get(),
            errors: self.errors_total.get(),
        }
    }

    /// Render in the Prometheus text exposition format
    pub fn render(&self) -> prometheus::Result<String> {
        let encoder = TextEncoder::new();
        let mut buffer = Vec::new();
        encoder.encode(&self.registry.gather(), &mut buffer)?;
        String::from_utf8(buffer).map_err(|e| prometheus::Error::Msg(e.to_string()))
    }

    pub fn content_type(&self) -> String {
        TextEncoder::new().format_type().to_string()
    }
}

impl Default for ConnectionMetrics {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn renders_all_series() {
        let metrics = ConnectionMetrics::new();
        metrics.connections_total.inc();
        metrics.connections_active.inc();
        metrics.errors_total.inc_by(2);

        let text = metrics.render().unwrap();
        for line in [
            "connections_total 1",
            "connections_active 1",
            "messages_sent_total 0",
            "messages_received_total 0",
            "errors_total 2",
        ] {
            assert!(text.contains(line), "missing {line:?} in\n{text}");
        }
        assert!(text.contains("# TYPE connections_active gauge"));
    }
}
