//! Resource Management
//!
//! Caps the number of relay pairs alive at once. Each accepted client must
//! hold a connection slot for the lifetime of its pair.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::{debug, warn};

use crate::Result;

/// Tracks and enforces the concurrent pair limit
pub struct ResourceManager {
    max_connections: usize,
    connection_semaphore: Arc<Semaphore>,
    stats: ResourceStats,
}

#[derive(Debug, Default)]
struct ResourceStats {
    peak_connections: AtomicUsize,
    total_connections_created: AtomicUsize,
    total_connections_rejected: AtomicUsize,
}

/// Resource usage statistics for monitoring
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceUsageStats {
    pub active_connections: usize,
    pub peak_connections: usize,
    pub total_connections_created: usize,
    pub total_connections_rejected: usize,
    pub max_connections: usize,
}

impl ResourceManager {
    pub fn new(max_connections: usize) -> Self {
        Self {
            max_connections,
            connection_semaphore: Arc::new(Semaphore::new(max_connections)),
            stats: ResourceStats::default(),
        }
    }

    /// Try to acquire a connection slot without waiting
    pub fn acquire_connection_slot(&self) -> Result<ConnectionSlot> {
        match Arc::clone(&self.connection_semaphore).try_acquire_owned() {
            Ok(permit) => {
                self.stats
                    .total_connections_created
                    .fetch_add(1, Ordering::Relaxed);

                let active = self.active_connections();
                self.stats
                    .peak_connections
                    .fetch_max(active, Ordering::Relaxed);

                debug!("Acquired connection slot, active pairs: {}", active);
                Ok(ConnectionSlot { _permit: permit })
            }
            Err(_) => {
                self.stats
                    .total_connections_rejected
                    .fetch_add(1, Ordering::Relaxed);
                warn!(
                    "Connection limit reached ({}), rejecting connection",
                    self.max_connections
                );
                Err(anyhow::anyhow!("Connection limit reached"))
            }
        }
    }

    pub fn active_connections(&self) -> usize {
        self.max_connections - self.connection_semaphore.available_permits()
    }

    pub fn get_stats(&self) -> ResourceUsageStats {
        ResourceUsageStats {
            active_connections: self.active_connections(),
            peak_connections: self.stats.peak_connections.load(Ordering::Relaxed),
            total_connections_created: self.stats.total_connections_created.load(Ordering::Relaxed),
            total_connections_rejected: self.stats.total_connections_rejected.load(Ordering::Relaxed),
            max_connections: self.max_connections,
        }
    }
}

/// Held by a relay pair for as long as it is alive
#[derive(Debug)]
pub struct ConnectionSlot {
    _permit: OwnedSemaphorePermit,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connection_slot_acquisition() {
        let resources = ResourceManager::new(2);

        let slot1 = resources.acquire_connection_slot();
        assert!(slot1.is_ok());
        let slot2 = resources.acquire_connection_slot();
        assert!(slot2.is_ok());

        assert!(resources.acquire_connection_slot().is_err());

        drop(slot1);
        assert!(resources.acquire_connection_slot().is_ok());
    }

    #[test]
    fn test_resource_stats() {
        let resources = ResourceManager::new(4);
        let _a = resources.acquire_connection_slot().unwrap();
        let b = resources.acquire_connection_slot().unwrap();
        drop(b);

        let stats = resources.get_stats();
        assert_eq!(stats.active_connections, 1);
        assert_eq!(stats.peak_connections, 2);
        assert_eq!(stats.total_connections_created, 2);
        assert_eq!(stats.total_connections_rejected, 0);
        assert_eq!(stats.max_connections, 4);
    }
}
