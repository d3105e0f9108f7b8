//! Metrics Collector

use prometheus::{Counter, Gauge, Histogram, HistogramOpts, Registry, TextEncoder};
use std::time::Duration;
use tracing::error;

use crate::Result;

/// Prometheus metrics for the chat server
pub struct Metrics {
    registry: Registry,
    connections_total: Counter,
    connections_rejected_total: Counter,
    active_connections: Gauge,
    messages_received_total: Counter,
    bytes_received_total: Counter,
    deliveries_total: Counter,
    delivery_failures_total: Counter,
    connection_duration: Histogram,
}

impl Metrics {
    /// Create and register all chat metrics
    pub fn new() -> Result<Self> {
        let registry = Registry::new();

        let connections_total = Counter::new(
            "chat_connections_total",
            "Total number of accepted chat connections",
        )?;
        let connections_rejected_total = Counter::new(
            "chat_connections_rejected_total",
            "Connections dropped because the server was full",
        )?;
        let active_connections = Gauge::new(
            "chat_active_connections",
            "Number of currently registered chat connections",
        )?;
        let messages_received_total = Counter::new(
            "chat_messages_received_total",
            "Chunks received from clients",
        )?;
        let bytes_received_total = Counter::new(
            "chat_bytes_received_total",
            "Bytes received from clients",
        )?;
        let deliveries_total = Counter::new(
            "chat_deliveries_total",
            "Successful per-target broadcast sends",
        )?;
        let delivery_failures_total = Counter::new(
            "chat_delivery_failures_total",
            "Failed per-target broadcast sends",
        )?;
        let connection_duration = Histogram::with_opts(
            HistogramOpts::new(
                "chat_connection_duration_seconds",
                "Lifetime of chat connections in seconds",
            )
            .buckets(vec![1.0, 10.0, 60.0, 300.0, 1800.0, 3600.0, 14400.0]),
        )?;

        registry.register(Box::new(connections_total.clone()))?;
        registry.register(Box::new(connections_rejected_total.clone()))?;
        registry.register(Box::new(active_connections.clone()))?;
        registry.register(Box::new(messages_received_total.clone()))?;
        registry.register(Box::new(bytes_received_total.clone()))?;
        registry.register(Box::new(deliveries_total.clone()))?;
        registry.register(Box::new(delivery_failures_total.clone()))?;
        registry.register(Box::new(connection_duration.clone()))?;

        Ok(Self {
            registry,
            connections_total,
            connections_rejected_total,
            active_connections,
            messages_received_total,
            bytes_received_total,
            deliveries_total,
            delivery_failures_total,
            connection_duration,
        })
    }

    pub fn connection_opened(&self) {
        self.connections_total.inc();
        self.active_connections.inc();
    }

    pub fn connection_closed(&self, lifetime: Duration) {
        self.active_connections.dec();
        self.connection_duration.observe(lifetime.as_secs_f64());
    }

    pub fn connection_rejected(&self) {
        self.connections_rejected_total.inc();
    }

    pub fn message_received(&self, bytes: usize) {
        self.messages_received_total.inc();
        self.bytes_received_total.inc_by(bytes as f64);
    }

    pub fn record_broadcast(&self, delivered: usize, failed: usize) {
        self.deliveries_total.inc_by(delivered as f64);
        self.delivery_failures_total.inc_by(failed as f64);
    }

    pub fn active_connections(&self) -> u64 {
        self.active_connections.get() as u64
    }

    pub fn messages_received(&self) -> u64 {
        self.messages_received_total.get() as u64
    }

    pub fn deliveries(&self) -> u64 {
        self.deliveries_total.get() as u64
    }

    pub fn delivery_failures(&self) -> u64 {
        self.delivery_failures_total.get() as u64
    }

    /// Render all metrics in the Prometheus text format
    pub fn export_prometheus(&self) -> String {
        let encoder = TextEncoder::new();
        let families = self.registry.gather();
        match encoder.encode_to_string(&families) {
            Ok(text) => text,
            Err(e) => {
                error!("Failed to encode metrics: {}", e);
                String::new()
            }
        }
    }
}
