//! Data Relay Module
//!
//! Relay pairs, the loops that pump bytes between their two connections, and
//! the engine that runs them.

pub mod buffer;
pub mod engine;
pub mod pair;
pub mod session;

pub use buffer::{BufferPool, BufferPoolStats, PooledBuffer};
pub use engine::RelayEngine;
pub use pair::{Connection, RelayPair, Side};
pub use session::{CloseReason, ConnectionStats, Direction, PairId, PairState, RelaySession};
