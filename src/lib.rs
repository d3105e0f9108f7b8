//! RustChat Library
//!
//! A real-time TCP chat server: every chunk a client sends is rebroadcast
//! verbatim to all other connected clients.
//!
//! The pieces, leaves first:
//! - [`connection::Connection`] wraps one accepted stream
//! - [`connection::ConnectionRegistry`] tracks the live connections
//! - [`broadcast::BroadcastDispatcher`] fans a message out to everyone but its sender
//! - [`connection::ConnectionHandler`] drives one connection until it ends
//! - [`connection::ConnectionManager`] runs the accept loop

pub mod broadcast;
pub mod client;
pub mod config;
pub mod connection;
pub mod error;
pub mod metrics;
pub mod shutdown;

pub use config::ChatConfig;
pub use connection::{ConnectionManager, ConnectionRegistry};
pub use shutdown::ShutdownCoordinator;

/// Common error type for application glue
pub type Result<T> = anyhow::Result<T>;
