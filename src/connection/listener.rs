//! Listener
//!
//! Accepts clients on the configured local address and hands each one to the
//! relay engine as a new relay pair.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tokio::net::{TcpListener, TcpSocket, TcpStream};
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::metrics::Metrics;
use crate::relay::RelayEngine;
use crate::resource::ResourceManager;
use crate::shutdown::ShutdownCoordinator;
use crate::Result;

/// Pause after a failed accept so a persistent error (e.g. EMFILE) does not spin
const ACCEPT_ERROR_BACKOFF: Duration = Duration::from_millis(50);

/// Bound listening socket plus what it needs to start relay pairs
pub struct Listener {
    listener: TcpListener,
    config: Arc<Config>,
    engine: Arc<RelayEngine>,
    resources: Arc<ResourceManager>,
    metrics: Arc<Metrics>,
    shutdown: ShutdownCoordinator,
}

/// Listener statistics
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListenerStats {
    pub local_addr: Option<SocketAddr>,
    pub active_pairs: usize,
    pub total_pairs_served: usize,
    pub rejected_connections: usize,
    pub max_connections: usize,
}

impl Listener {
    /// Bind and listen. Failure here is a startup error.
    pub async fn bind(
        config: Arc<Config>,
        engine: Arc<RelayEngine>,
        metrics: Arc<Metrics>,
        shutdown: ShutdownCoordinator,
    ) -> Result<Self> {
        let listen_addr = config.server.listen_addr;
        info!("Binding TCP listener to {}", listen_addr);

        let socket = if listen_addr.is_ipv4() {
            TcpSocket::new_v4()
        } else {
            TcpSocket::new_v6()
        }
        .context("Failed to create listening socket")?;

        socket
            .set_reuseaddr(true)
            .context("Failed to set SO_REUSEADDR")?;
        socket
            .bind(listen_addr)
            .with_context(|| format!("Failed to bind {}", listen_addr))?;
        let listener = socket
            .listen(config.server.backlog)
            .with_context(|| format!("Failed to listen on {}", listen_addr))?;

        info!(
            "Listening on {} (backlog {}), relaying to {}",
            listener.local_addr()?,
            config.server.backlog,
            engine.upstream_addr()
        );

        let resources = Arc::new(ResourceManager::new(config.server.max_connections));

        Ok(Self {
            listener,
            config,
            engine,
            resources,
            metrics,
            shutdown,
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    pub fn engine(&self) -> &Arc<RelayEngine> {
        &self.engine
    }

    /// Accept until shutdown. Accept errors are logged and the loop keeps going.
    pub async fn run(&self) -> Result<()> {
        let mut shutdown = self.shutdown.subscribe();
        info!("Starting connection acceptance loop");

        loop {
            tokio::select! {
                accept_result = self.listener.accept() => {
                    match accept_result {
                        Ok((stream, addr)) => self.handle_accept(stream, addr),
                        Err(e) => {
                            error!("Error accepting connection: {}", e);
                            self.metrics.accept_error();
                            tokio::time::sleep(ACCEPT_ERROR_BACKOFF).await;
                        }
                    }
                }
                _ = shutdown.recv() => {
                    info!("Received shutdown signal, stopping connection acceptance");
                    break;
                }
            }
        }

        info!("Connection acceptance loop stopped");
        Ok(())
    }

    fn handle_accept(&self, stream: TcpStream, addr: SocketAddr) {
        debug!("Accepted connection from {}", addr);

        if self.shutdown.is_shutting_down() {
            debug!("Rejecting connection from {} due to shutdown", addr);
            return;
        }

        let slot = match self.resources.acquire_connection_slot() {
            Ok(slot) => slot,
            Err(_) => {
                warn!("Connection limit reached, closing connection from {}", addr);
                self.metrics.connection_rejected();
                return;
            }
        };

        if self.config.server.tcp_nodelay {
            if let Err(e) = stream.set_nodelay(true) {
                debug!("Failed to set TCP_NODELAY for {}: {}", addr, e);
            }
        }

        self.engine
            .spawn_pair(stream, addr, slot, self.shutdown.subscribe());
    }

    pub fn get_stats(&self) -> ListenerStats {
        let resources = self.resources.get_stats();
        ListenerStats {
            local_addr: self.listener.local_addr().ok(),
            active_pairs: self.engine.active_session_count(),
            total_pairs_served: resources.total_connections_created,
            rejected_connections: resources.total_connections_rejected,
            max_connections: resources.max_connections,
        }
    }

    /// Stop accepting and wait for live pairs to close
    pub async fn shutdown(&self) -> usize {
        self.shutdown.trigger();
        self.shutdown.drain(&self.engine).await
    }
}
