//! Broadcast Dispatcher

use std::sync::Arc;

use bytes::Bytes;
use tracing::{debug, warn};

use crate::connection::{ConnectionId, ConnectionRegistry};
use crate::metrics::Metrics;

/// Outcome of one fan-out
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BroadcastReport {
    /// Connections other than the sender present in the snapshot
    pub targets: usize,
    pub delivered: usize,
    pub failed: usize,
}

/// Delivers a message to every registered connection except its origin.
///
/// Delivery is best-effort and at-most-once. A target whose send fails is
/// only logged; its own handler loop notices the broken stream and
/// unregisters it.
#[derive(Clone)]
pub struct BroadcastDispatcher {
    registry: Arc<ConnectionRegistry>,
    metrics: Option<Arc<Metrics>>,
}

impl BroadcastDispatcher {
    pub fn new(registry: Arc<ConnectionRegistry>) -> Self {
        Self {
            registry,
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Send `message` to everyone registered except `sender`
    pub async fn broadcast(&self, message: &Bytes, sender: ConnectionId) -> BroadcastReport {
        let mut report = BroadcastReport::default();

        // Registry lock is released here; sends below never hold it.
        let targets = self.registry.snapshot();

        for target in targets.iter().filter(|c| c.id() != sender) {
            report.targets += 1;
            match target.send(message).await {
                Ok(()) => report.delivered += 1,
                Err(e) => {
                    report.failed += 1;
                    warn!(
                        "Error broadcasting to {} ({}){}: {}",
                        target.id(),
                        target.peer_addr(),
                        if e.is_disconnect() { ", peer gone" } else { "" },
                        e
                    );
                }
            }
        }

        if let Some(metrics) = &self.metrics {
            metrics.record_broadcast(report.delivered, report.failed);
        }

        debug!(
            sender = %sender,
            bytes = message.len(),
            targets = report.targets,
            delivered = report.delivered,
            failed = report.failed,
            "Broadcast complete"
        );

        report
    }
}
