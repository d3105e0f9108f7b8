//! Connection Management Module
//!
//! Handles TCP connection acceptance, registration, and per-connection
//! handler loops.

#[allow(clippy::module_inception)]
pub mod connection;
pub mod handler;
pub mod manager;
pub mod registry;

pub use connection::{Connection, ConnectionId, ConnectionTraffic};
pub use handler::{ConnectionHandler, HandlerState, TerminationReason};
pub use manager::{classify_accept_error, AcceptErrorAction, ConnectionManager, ConnectionStats};
pub use registry::ConnectionRegistry;
