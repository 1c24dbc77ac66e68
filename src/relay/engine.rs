//! Relay Engine
//!
//! Creates relay pairs for accepted clients, runs each one on its own task and
//! keeps a registry of the sessions that are still alive.

use std::collections::HashMap;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard};

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::task::JoinHandle;
use tracing::{debug, info_span, Instrument};

use super::buffer::{BufferPool, BufferPoolStats};
use super::pair::RelayPair;
use super::session::{ConnectionStats, PairId, RelaySession};
use crate::config::Config;
use crate::connection::UpstreamConnector;
use crate::metrics::Metrics;
use crate::resource::ConnectionSlot;
use crate::shutdown::ShutdownListener;
use crate::Result;

/// Owns the shared, read-only pieces every relay pair needs
pub struct RelayEngine {
    connector: UpstreamConnector,
    buffers: Arc<BufferPool>,
    metrics: Arc<Metrics>,
    active_sessions: Mutex<HashMap<PairId, Arc<RelaySession>>>,
}

impl RelayEngine {
    pub fn new(connector: UpstreamConnector, buffers: Arc<BufferPool>, metrics: Arc<Metrics>) -> Self {
        Self {
            connector,
            buffers,
            metrics,
            active_sessions: Mutex::new(HashMap::new()),
        }
    }

    pub fn from_config(config: &Config, metrics: Arc<Metrics>) -> Self {
        Self::new(
            UpstreamConnector::from_config(config),
            BufferPool::new(config.server.buffer_size, config.server.max_idle_buffers),
            metrics,
        )
    }

    pub fn upstream_addr(&self) -> SocketAddr {
        self.connector.target()
    }

    /// Start a pair for an accepted TCP client on its own task.
    /// The connection slot is held until the pair is closed.
    pub fn spawn_pair(
        self: &Arc<Self>,
        client: TcpStream,
        client_addr: SocketAddr,
        slot: ConnectionSlot,
        shutdown: ShutdownListener,
    ) -> JoinHandle<Arc<RelaySession>> {
        let engine = Arc::clone(self);
        let pair_id = PairId::new();
        let span = info_span!("pair", id = %pair_id, client = %client_addr);

        tokio::spawn(
            async move {
                let _slot = slot;
                let mut shutdown = shutdown;
                let dial = engine.connector.connect();
                engine
                    .relay_with_id(pair_id, client, Some(client_addr), dial, &mut shutdown)
                    .await
            }
            .instrument(span),
        )
    }

    /// Run one relay pair to completion on the current task
    pub async fn relay<C, U, F>(
        &self,
        client: C,
        client_addr: Option<SocketAddr>,
        dial: F,
        shutdown: &mut ShutdownListener,
    ) -> Arc<RelaySession>
    where
        C: AsyncRead + AsyncWrite,
        U: AsyncRead + AsyncWrite,
        F: Future<Output = Result<(U, SocketAddr)>>,
    {
        self.relay_with_id(PairId::new(), client, client_addr, dial, shutdown)
            .await
    }

    async fn relay_with_id<C, U, F>(
        &self,
        pair_id: PairId,
        client: C,
        client_addr: Option<SocketAddr>,
        dial: F,
        shutdown: &mut ShutdownListener,
    ) -> Arc<RelaySession>
    where
        C: AsyncRead + AsyncWrite,
        U: AsyncRead + AsyncWrite,
        F: Future<Output = Result<(U, SocketAddr)>>,
    {
        let session = Arc::new(RelaySession::new(
            pair_id,
            client_addr,
            self.connector.target(),
        ));
        self.register(&session);
        self.metrics.pair_opened();

        let pair = RelayPair::new(Arc::clone(&session), client, Arc::clone(&self.buffers));
        pair.run(dial, shutdown).await;

        self.remove_session(&session.pair_id);
        self.metrics.pair_closed(&session);
        session.log_stats();
        session
    }

    fn register(&self, session: &Arc<RelaySession>) {
        self.sessions().insert(session.pair_id, Arc::clone(session));
    }

    /// Remove a session from active tracking
    pub fn remove_session(&self, pair_id: &PairId) {
        if self.sessions().remove(pair_id).is_some() {
            debug!("Removed pair {} from active tracking", pair_id);
        }
    }

    pub fn get_active_sessions(&self) -> Vec<Arc<RelaySession>> {
        self.sessions().values().cloned().collect()
    }

    pub fn active_session_count(&self) -> usize {
        self.sessions().len()
    }

    pub fn get_session(&self, pair_id: &PairId) -> Option<Arc<RelaySession>> {
        self.sessions().get(pair_id).cloned()
    }

    pub fn get_active_session_stats(&self) -> Vec<ConnectionStats> {
        self.sessions().values().map(|session| session.to_stats()).collect()
    }

    pub fn buffer_stats(&self) -> BufferPoolStats {
        self.buffers.stats()
    }

    fn sessions(&self) -> MutexGuard<'_, HashMap<PairId, Arc<RelaySession>>> {
        self.active_sessions
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
