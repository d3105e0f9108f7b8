//! Broadcast Module
//!
//! Fans each received message out to every other connection.

pub mod dispatcher;

pub use dispatcher::{BroadcastDispatcher, BroadcastReport};
