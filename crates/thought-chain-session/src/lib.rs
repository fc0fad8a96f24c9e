//! Session lifecycle and the client facade.
//!
//! Provides:
//! - `SessionLifecycle` - create/delete, periodic heartbeat, invalidation
//! - `ChatClient` - wires lifecycle, connection, dispatcher and aggregator

pub mod client;
pub mod manager;

#[cfg(test)]
mod fakes;

pub use client::{ChatClient, ClientError};
pub use manager::{LifecycleError, SessionLifecycle};
