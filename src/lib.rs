//! TCP Relay Library
//!
//! Listens on a fixed local address and, for every client, opens a fresh
//! connection to a fixed upstream address and copies bytes verbatim in both
//! directions until either side closes.

pub mod config;
pub mod connection;
pub mod metrics;
pub mod relay;
pub mod resource;
pub mod shutdown;

pub use config::Config;
pub use connection::{Listener, UpstreamConnector};
pub use relay::{RelayEngine, RelayPair};
pub use resource::ResourceManager;
pub use shutdown::ShutdownCoordinator;

/// Common error type for the relay
pub type Result<T> = anyhow::Result<T>;
