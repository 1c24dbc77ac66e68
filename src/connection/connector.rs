//! Upstream Connector
//!
//! Dials the fixed upstream target, once per relay pair. No pooling, no retry.

use std::net::SocketAddr;
use std::time::Duration;

use anyhow::{anyhow, Context};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::debug;

use crate::config::Config;
use crate::Result;

/// Opens outbound connections to the configured upstream address
#[derive(Debug, Clone)]
pub struct UpstreamConnector {
    target: SocketAddr,
    connect_timeout: Duration,
    nodelay: bool,
}

impl UpstreamConnector {
    pub fn new(target: SocketAddr, connect_timeout: Duration) -> Self {
        Self {
            target,
            connect_timeout,
            nodelay: true,
        }
    }

    pub fn from_config(config: &Config) -> Self {
        Self {
            target: config.server.upstream_addr,
            connect_timeout: config.server.connect_timeout,
            nodelay: config.server.tcp_nodelay,
        }
    }

    pub fn target(&self) -> SocketAddr {
        self.target
    }

    /// Establish one new upstream connection
    pub async fn connect(&self) -> Result<(TcpStream, SocketAddr)> {
        debug!("Dialing upstream {}", self.target);

        let stream = match timeout(self.connect_timeout, TcpStream::connect(self.target)).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => {
                return Err(e).with_context(|| format!("Failed to connect to {}", self.target));
            }
            Err(_) => {
                return Err(anyhow!(
                    "Connection to {} timed out after {:?}",
                    self.target,
                    self.connect_timeout
                ));
            }
        };

        if self.nodelay {
            stream
                .set_nodelay(true)
                .context("Failed to set TCP_NODELAY on upstream socket")?;
        }

        Ok((stream, self.target))
    }
}
