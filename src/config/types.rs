//! Configuration Types

use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::time::Duration;

/// Main configuration structure
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    pub server: ServerConfig,
    #[serde(default)]
    pub monitoring: MonitoringConfig,
}

/// Relay endpoints and per-connection tuning
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Local address accepted clients connect to
    pub listen_addr: SocketAddr,
    /// Fixed target every relay pair dials
    pub upstream_addr: SocketAddr,
    /// Pending-accept queue length handed to listen(2)
    pub backlog: u32,
    /// Size of each relay buffer; one per direction per pair
    pub buffer_size: usize,
    #[serde(with = "humantime_serde")]
    pub connect_timeout: Duration,
    #[serde(with = "humantime_serde")]
    pub shutdown_timeout: Duration,
    /// Upper bound on concurrently live relay pairs
    pub max_connections: usize,
    /// Released buffers kept for reuse instead of being freed
    pub max_idle_buffers: usize,
    pub tcp_nodelay: bool,
}

/// Monitoring configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct MonitoringConfig {
    pub log_level: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metrics_addr: Option<SocketAddr>,
    pub prometheus_enabled: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: SocketAddr::from(([127, 0, 0, 1], 6380)),
            upstream_addr: SocketAddr::from(([127, 0, 0, 1], 6379)),
            backlog: 128,
            buffer_size: 8192,
            connect_timeout: Duration::from_secs(10),
            shutdown_timeout: Duration::from_secs(30),
            max_connections: 1024,
            max_idle_buffers: 256,
            tcp_nodelay: true,
        }
    }
}

impl Default for MonitoringConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            metrics_addr: None,
            prometheus_enabled: true,
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            monitoring: MonitoringConfig::default(),
        }
    }
}
