//! Graceful Shutdown Handling
//!
//! Signal handling plus a broadcast that stops the accept loop and tears down
//! every live relay pair.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::signal;
use tokio::sync::broadcast::{self, error::RecvError};
use tracing::{debug, info, warn};

use crate::relay::RelayEngine;
use crate::Result;

const DRAIN_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Shutdown coordinator that manages graceful shutdown process
#[derive(Debug, Clone)]
pub struct ShutdownCoordinator {
    shutdown_tx: broadcast::Sender<()>,
    triggered: Arc<AtomicBool>,
    timeout: Duration,
}

/// Per-task handle for observing the shutdown broadcast
#[derive(Debug)]
pub struct ShutdownListener {
    triggered: Arc<AtomicBool>,
    shutdown_rx: broadcast::Receiver<()>,
}

impl ShutdownCoordinator {
    pub fn new(timeout: Duration) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);

        Self {
            shutdown_tx,
            triggered: Arc::new(AtomicBool::new(false)),
            timeout,
        }
    }

    pub fn subscribe(&self) -> ShutdownListener {
        ShutdownListener {
            triggered: Arc::clone(&self.triggered),
            shutdown_rx: self.shutdown_tx.subscribe(),
        }
    }

    pub fn is_shutting_down(&self) -> bool {
        self.triggered.load(Ordering::Acquire)
    }

    /// Broadcast shutdown to every subscriber. Repeated calls are ignored.
    pub fn trigger(&self) {
        if self.triggered.swap(true, Ordering::AcqRel) {
            return;
        }
        if self.shutdown_tx.send(()).is_err() {
            debug!("Shutdown triggered with no active subscribers");
        }
    }

    /// Block until SIGTERM, SIGINT or Ctrl+C, then trigger shutdown
    pub async fn listen_for_signals(&self) -> Result<()> {
        info!("Starting shutdown signal listener");

        #[cfg(unix)]
        {
            let mut sigterm = signal::unix::signal(signal::unix::SignalKind::terminate())?;
            let mut sigint = signal::unix::signal(signal::unix::SignalKind::interrupt())?;

            tokio::select! {
                _ = sigterm.recv() => info!("Received SIGTERM, initiating graceful shutdown"),
                _ = sigint.recv() => info!("Received SIGINT, initiating graceful shutdown"),
                _ = signal::ctrl_c() => info!("Received Ctrl+C, initiating graceful shutdown"),
            }
        }

        #[cfg(windows)]
        {
            signal::ctrl_c().await?;
            info!("Received Ctrl+C, initiating graceful shutdown");
        }

        self.trigger();
        Ok(())
    }

    /// Wait for live relay pairs to finish closing, up to the shutdown timeout.
    /// Returns the number of pairs still registered when the wait ended.
    pub async fn drain(&self, engine: &RelayEngine) -> usize {
        let start_time = Instant::now();
        let mut last_count = engine.active_session_count();
        info!(
            "Waiting for {} relay pairs to close (timeout: {:?})",
            last_count, self.timeout
        );

        while last_count > 0 && start_time.elapsed() < self.timeout {
            tokio::time::sleep(DRAIN_POLL_INTERVAL).await;

            let current_count = engine.active_session_count();
            if current_count != last_count {
                debug!("Active relay pairs: {} -> {}", last_count, current_count);
                last_count = current_count;
            }
        }

        if last_count == 0 {
            info!("All relay pairs closed in {:?}", start_time.elapsed());
        } else {
            warn!(
                "Shutdown timeout reached after {:?} with {} relay pairs still active",
                start_time.elapsed(),
                last_count
            );
        }

        last_count
    }
}

impl ShutdownListener {
    pub fn is_triggered(&self) -> bool {
        self.triggered.load(Ordering::Acquire)
    }

    /// Resolve once shutdown has been triggered. Cancel safe.
    pub async fn recv(&mut self) {
        if self.is_triggered() {
            return;
        }

        match self.shutdown_rx.recv().await {
            Ok(()) | Err(RecvError::Lagged(_)) => {}
            // Every coordinator is gone, so nothing can trigger shutdown anymore.
            Err(RecvError::Closed) => std::future::pending::<()>().await,
        }
    }
}
