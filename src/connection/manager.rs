//! Connection Manager Implementation
//!
//! Owns the listener and runs the accept loop. Every accepted stream is
//! registered and handed to its own `ConnectionHandler` task.

use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;
use tokio::time::{sleep, Duration};
use tracing::{debug, error, info, warn};

use super::connection::Connection;
use super::handler::ConnectionHandler;
use super::registry::ConnectionRegistry;
use crate::broadcast::BroadcastDispatcher;
use crate::config::ChatConfig;
use crate::error::ConnectError;
use crate::metrics::Metrics;

/// What to do after a failed `accept`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AcceptErrorAction {
    /// The failure belonged to one incoming connection; keep going
    Continue,
    /// The process is out of sockets or memory; pause, then keep going
    Backoff,
    /// The listener itself is broken
    Fatal,
}

/// Classify an accept error
pub fn classify_accept_error(error: &io::Error) -> AcceptErrorAction {
    match error.kind() {
        io::ErrorKind::ConnectionAborted
        | io::ErrorKind::ConnectionReset
        | io::ErrorKind::ConnectionRefused
        | io::ErrorKind::Interrupted
        | io::ErrorKind::WouldBlock
        | io::ErrorKind::TimedOut
        | io::ErrorKind::NetworkDown
        | io::ErrorKind::NetworkUnreachable
        | io::ErrorKind::HostUnreachable => return AcceptErrorAction::Continue,
        io::ErrorKind::OutOfMemory => return AcceptErrorAction::Backoff,
        _ => {}
    }

    match error.raw_os_error() {
        Some(code) => classify_os_error(code),
        None => AcceptErrorAction::Fatal,
    }
}

/// accept(2) passes pending network errors of the new socket through; those
/// are retried like `EAGAIN`.
#[cfg(unix)]
fn classify_os_error(code: i32) -> AcceptErrorAction {
    const TRANSIENT: &[i32] = &[
        libc::EPROTO,
        libc::ENOPROTOOPT,
        libc::EOPNOTSUPP,
        libc::ENETDOWN,
        libc::ENETUNREACH,
        libc::EHOSTDOWN,
        libc::EHOSTUNREACH,
    ];
    const EXHAUSTED: &[i32] = &[libc::EMFILE, libc::ENFILE, libc::ENOBUFS, libc::ENOMEM];

    if TRANSIENT.contains(&code) {
        AcceptErrorAction::Continue
    } else if EXHAUSTED.contains(&code) {
        AcceptErrorAction::Backoff
    } else {
        AcceptErrorAction::Fatal
    }
}

#[cfg(not(unix))]
fn classify_os_error(_code: i32) -> AcceptErrorAction {
    AcceptErrorAction::Fatal
}

/// Connection statistics
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionStats {
    pub active_connections: usize,
    pub total_connections_accepted: u64,
    pub total_connections_rejected: u64,
    pub max_connections_allowed: usize,
}

/// Accepts TCP connections and manages their lifecycle
pub struct ConnectionManager {
    listener: Option<TcpListener>,
    config: Arc<ChatConfig>,
    registry: Arc<ConnectionRegistry>,
    dispatcher: BroadcastDispatcher,
    metrics: Arc<Metrics>,
    total_accepted: AtomicU64,
    total_rejected: AtomicU64,
    shutdown_flag: AtomicBool,
    shutdown_tx: broadcast::Sender<()>,
}

impl ConnectionManager {
    /// Create a new ConnectionManager
    pub fn new(config: Arc<ChatConfig>, metrics: Arc<Metrics>) -> Self {
        let registry = Arc::new(ConnectionRegistry::new());
        let dispatcher =
            BroadcastDispatcher::new(Arc::clone(&registry)).with_metrics(Arc::clone(&metrics));
        let (shutdown_tx, _) = broadcast::channel(1);

        Self {
            listener: None,
            config,
            registry,
            dispatcher,
            metrics,
            total_accepted: AtomicU64::new(0),
            total_rejected: AtomicU64::new(0),
            shutdown_flag: AtomicBool::new(false),
            shutdown_tx,
        }
    }

    /// The shared registry of live connections
    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.registry
    }

    pub fn metrics(&self) -> &Arc<Metrics> {
        &self.metrics
    }

    /// Bind the listener and return the address it is bound to
    pub async fn bind(&mut self) -> Result<SocketAddr, ConnectError> {
        let bind_addr = self.config.server.bind_addr;

        info!("Binding TCP listener to {}", bind_addr);
        let listener = TcpListener::bind(bind_addr)
            .await
            .map_err(|source| ConnectError::Bind { addr: bind_addr, source })?;
        let local_addr = listener.local_addr().map_err(ConnectError::LocalAddr)?;

        info!("Chat server listening on {}", local_addr);
        self.listener = Some(listener);
        Ok(local_addr)
    }

    /// Bind, then accept connections until shutdown or a fatal listener error
    pub async fn start(&mut self) -> Result<(), ConnectError> {
        self.bind().await?;
        self.accept_connections().await
    }

    /// Main connection acceptance loop
    pub async fn accept_connections(&self) -> Result<(), ConnectError> {
        let listener = self.listener.as_ref().ok_or(ConnectError::NotBound)?;

        info!("Starting connection acceptance loop");
        let mut shutdown_rx = self.shutdown_tx.subscribe();

        loop {
            if self.is_shutting_down() {
                info!("Shutdown flag set, stopping connection acceptance");
                break;
            }

            tokio::select! {
                accept_result = listener.accept() => {
                    match accept_result {
                        Ok((stream, addr)) => self.admit(stream, addr),
                        Err(e) => match classify_accept_error(&e) {
                            AcceptErrorAction::Continue => {
                                warn!("Error accepting connection: {}", e);
                            }
                            AcceptErrorAction::Backoff => {
                                let backoff = self.config.server.accept_backoff;
                                error!("Error accepting connection: {} (retrying in {:?})", e, backoff);
                                sleep(backoff).await;
                            }
                            AcceptErrorAction::Fatal => {
                                error!("Listener failed: {}", e);
                                return Err(ConnectError::Accept(e));
                            }
                        },
                    }
                }
                _ = shutdown_rx.recv() => {
                    info!("Received shutdown signal, stopping connection acceptance");
                    break;
                }
            }
        }

        info!("Connection acceptance loop stopped");
        Ok(())
    }

    /// Register an accepted stream and spawn its handler
    fn admit(&self, stream: TcpStream, addr: SocketAddr) {
        debug!("Accepted connection from {}", addr);

        if self.is_shutting_down() {
            debug!("Rejecting connection from {} due to shutdown", addr);
            self.total_rejected.fetch_add(1, Ordering::Relaxed);
            self.metrics.connection_rejected();
            return;
        }

        let max_connections = self.config.server.max_connections;
        if self.registry.len() >= max_connections {
            warn!(
                "Connection limit of {} reached, rejecting connection from {}",
                max_connections, addr
            );
            self.total_rejected.fetch_add(1, Ordering::Relaxed);
            self.metrics.connection_rejected();
            return;
        }

        if self.config.server.tcp_nodelay {
            if let Err(e) = stream.set_nodelay(true) {
                debug!("Failed to set TCP_NODELAY for {}: {}", addr, e);
            }
        }

        let id = self.registry.allocate_id();
        let connection = Arc::new(Connection::new(
            id,
            stream,
            addr,
            self.config.server.read_chunk_size,
        ));

        if let Err(e) = self.registry.add(Arc::clone(&connection)) {
            error!("Failed to register connection from {}: {}", addr, e);
            return;
        }

        self.total_accepted.fetch_add(1, Ordering::Relaxed);
        self.metrics.connection_opened();
        info!("New connection {} from {}", id, addr);

        let handler = ConnectionHandler::new(
            connection,
            Arc::clone(&self.registry),
            self.dispatcher.clone(),
            self.shutdown_tx.subscribe(),
        )
        .with_idle_timeout(self.config.server.idle_timeout)
        .with_metrics(Arc::clone(&self.metrics));

        tokio::spawn(handler.run());
    }

    /// Get the number of active connections
    pub fn get_active_connections(&self) -> usize {
        self.registry.len()
    }

    /// Get the bind address if the listener is bound
    pub fn get_bind_addr(&self) -> Option<SocketAddr> {
        self.listener
            .as_ref()
            .and_then(|listener| listener.local_addr().ok())
    }

    /// Get connection statistics
    pub fn get_connection_stats(&self) -> ConnectionStats {
        ConnectionStats {
            active_connections: self.registry.len(),
            total_connections_accepted: self.total_accepted.load(Ordering::Relaxed),
            total_connections_rejected: self.total_rejected.load(Ordering::Relaxed),
            max_connections_allowed: self.config.server.max_connections,
        }
    }

    /// Stop accepting and tell every handler to finish
    pub fn initiate_shutdown(&self) {
        info!("Initiating graceful shutdown of connection manager");
        self.shutdown_flag.store(true, Ordering::Relaxed);

        if let Err(e) = self.shutdown_tx.send(()) {
            debug!("No shutdown listeners: {}", e);
        }
    }

    /// Check if shutdown has been initiated
    pub fn is_shutting_down(&self) -> bool {
        self.shutdown_flag.load(Ordering::Relaxed)
    }

    /// Wait for all connections to close, up to the configured shutdown timeout
    pub async fn wait_for_connections_to_close(&self) -> usize {
        let shutdown_timeout = self.config.server.shutdown_timeout;
        let start_time = Instant::now();

        info!(
            "Waiting for {} active connections to close (timeout: {:?})",
            self.get_active_connections(),
            shutdown_timeout
        );

        while self.get_active_connections() > 0 && start_time.elapsed() < shutdown_timeout {
            sleep(Duration::from_millis(20)).await;
        }

        let remaining = self.get_active_connections();
        if remaining == 0 {
            info!("All connections closed gracefully in {:?}", start_time.elapsed());
        } else {
            warn!(
                "Shutdown timeout reached after {:?} with {} connections still active",
                start_time.elapsed(),
                remaining
            );
        }

        remaining
    }

    /// Gracefully shut down the connection manager
    pub async fn shutdown(&self) -> usize {
        self.initiate_shutdown();
        self.wait_for_connections_to_close().await
    }
}
