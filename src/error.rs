//! Error types for the chat server
//!
//! Per-connection failures are typed so the handler loop and the dispatcher
//! can tell them apart. Application glue uses `anyhow` on top of these.

use std::io;
use std::net::SocketAddr;
use thiserror::Error;

use crate::connection::ConnectionId;

/// Listener-level failures
#[derive(Error, Debug)]
pub enum ConnectError {
    /// The listening socket could not be bound
    #[error("failed to bind listener on {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },

    /// The listener failed in a way that cannot be recovered from
    #[error("listener accept failed: {0}")]
    Accept(#[source] io::Error),

    /// The bound address could not be read back from the socket
    #[error("failed to read listener address: {0}")]
    LocalAddr(#[source] io::Error),

    /// `accept_connections` was called before `bind`
    #[error("listener not bound")]
    NotBound,
}

/// Failure while receiving from a connection
#[derive(Error, Debug)]
pub enum RecvError {
    #[error("receive failed: {0}")]
    Io(#[from] io::Error),

    /// The connection was closed locally
    #[error("connection closed")]
    Closed,
}

/// Failure while sending to a connection
#[derive(Error, Debug)]
pub enum SendError {
    #[error("send failed: {0}")]
    Io(#[from] io::Error),

    #[error("connection closed")]
    Closed,
}

impl SendError {
    /// True when the peer went away (reset or broken pipe)
    pub fn is_disconnect(&self) -> bool {
        match self {
            SendError::Closed => true,
            SendError::Io(e) => matches!(
                e.kind(),
                io::ErrorKind::BrokenPipe
                    | io::ErrorKind::ConnectionReset
                    | io::ErrorKind::ConnectionAborted
                    | io::ErrorKind::NotConnected
            ),
        }
    }
}

/// Registry bookkeeping failures
#[derive(Error, Debug, PartialEq, Eq)]
pub enum RegistryError {
    #[error("connection {0} is already registered")]
    Duplicate(ConnectionId),
}
