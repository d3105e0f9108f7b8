//! Per-connection handler loop

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast;
use tokio::time::timeout;
use tracing::{debug, info, instrument, trace};

use super::connection::Connection;
use super::registry::ConnectionRegistry;
use crate::broadcast::BroadcastDispatcher;
use crate::error::RecvError;
use crate::metrics::Metrics;

/// Why a handler loop stopped
#[derive(Debug)]
pub enum TerminationReason {
    /// The peer closed the stream
    EndOfStream,
    /// Receive failed; treated like end-of-stream
    RecvFailed(RecvError),
    /// No data arrived within the configured idle timeout
    IdleTimeout(Duration),
    /// The server is shutting down
    Shutdown,
}

impl fmt::Display for TerminationReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TerminationReason::EndOfStream => write!(f, "peer closed the connection"),
            TerminationReason::RecvFailed(e) => write!(f, "{}", e),
            TerminationReason::IdleTimeout(d) => write!(f, "idle for {:?}", d),
            TerminationReason::Shutdown => write!(f, "server shutdown"),
        }
    }
}

/// State of a handler loop
#[derive(Debug)]
pub enum HandlerState {
    Active,
    Terminated(TerminationReason),
}

/// Owns one registered connection and drives it until it ends
pub struct ConnectionHandler {
    connection: Arc<Connection>,
    registry: Arc<ConnectionRegistry>,
    dispatcher: BroadcastDispatcher,
    metrics: Option<Arc<Metrics>>,
    idle_timeout: Option<Duration>,
    shutdown_rx: broadcast::Receiver<()>,
}

impl ConnectionHandler {
    pub fn new(
        connection: Arc<Connection>,
        registry: Arc<ConnectionRegistry>,
        dispatcher: BroadcastDispatcher,
        shutdown_rx: broadcast::Receiver<()>,
    ) -> Self {
        Self {
            connection,
            registry,
            dispatcher,
            metrics: None,
            idle_timeout: None,
            shutdown_rx,
        }
    }

    pub fn with_idle_timeout(mut self, idle_timeout: Option<Duration>) -> Self {
        self.idle_timeout = idle_timeout;
        self
    }

    pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Receive and dispatch until the connection terminates, then clean up.
    ///
    /// Cleanup runs exactly once: the connection is unregistered, then
    /// closed.
    #[instrument(skip(self), fields(connection_id = %self.connection.id(), addr = %self.connection.peer_addr()))]
    pub async fn run(mut self) -> TerminationReason {
        let reason = loop {
            match self.step().await {
                HandlerState::Active => continue,
                HandlerState::Terminated(reason) => break reason,
            }
        };

        let id = self.connection.id();
        self.registry.remove(id);
        self.connection.close().await;

        let lifetime = self.connection.age();
        if let Some(metrics) = &self.metrics {
            metrics.connection_closed(lifetime);
        }

        let traffic = self.connection.traffic();
        info!(
            "Connection {} from {} disconnected after {:?}: {} ({} messages, {} bytes received)",
            id,
            self.connection.peer_addr(),
            lifetime,
            reason,
            traffic.messages_received,
            traffic.bytes_received
        );

        reason
    }

    /// One receive + dispatch cycle
    async fn step(&mut self) -> HandlerState {
        let received = tokio::select! {
            received = Self::receive_with_timeout(&self.connection, self.idle_timeout) => received,
            _ = self.shutdown_rx.recv() => {
                return HandlerState::Terminated(TerminationReason::Shutdown);
            }
        };

        let message = match received {
            Ok(message) => message,
            Err(reason) => return HandlerState::Terminated(reason),
        };

        if message.is_empty() {
            return HandlerState::Terminated(TerminationReason::EndOfStream);
        }

        debug!("Received {} bytes from {}", message.len(), self.connection.id());
        trace!(payload = %String::from_utf8_lossy(&message), "Message payload");

        if let Some(metrics) = &self.metrics {
            metrics.message_received(message.len());
        }

        self.dispatcher.broadcast(&message, self.connection.id()).await;
        HandlerState::Active
    }

    async fn receive_with_timeout(
        connection: &Connection,
        idle_timeout: Option<Duration>,
    ) -> Result<bytes::Bytes, TerminationReason> {
        let received = match idle_timeout {
            Some(limit) => timeout(limit, connection.receive())
                .await
                .map_err(|_| TerminationReason::IdleTimeout(limit))?,
            None => connection.receive().await,
        };

        received.map_err(TerminationReason::RecvFailed)
    }
}
