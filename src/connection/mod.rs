//! Connection Management Module
//!
//! Inbound side (listener) and outbound side (upstream connector) of the relay.

pub mod connector;
pub mod listener;

pub use connector::UpstreamConnector;
pub use listener::{Listener, ListenerStats};
