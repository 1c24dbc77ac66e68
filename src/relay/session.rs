//! Relay Session
//!
//! Observable record of one relay pair: identity, lifecycle state, byte
//! counters and the reason it closed. The session never holds the pair's
//! sockets, so registries and metrics can share it freely.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::{Instant, SystemTime};
use tokio::sync::watch;
use tracing::{debug, info};
use uuid::Uuid;

/// Non-owning identifier of a relay pair
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PairId(Uuid);

impl PairId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for PairId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for PairId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.simple())
    }
}

/// Relay pair lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PairState {
    /// Client accepted, upstream dial in flight
    Connecting,
    /// Both sides connected, bytes flowing in both directions
    Active,
    /// Teardown requested, endpoints being closed
    Closing,
    /// Both endpoints released
    Closed,
}

/// One direction of a relay pair
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    ClientToUpstream,
    UpstreamToClient,
}

impl Direction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Direction::ClientToUpstream => "client_to_upstream",
            Direction::UpstreamToClient => "upstream_to_client",
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why a relay pair was torn down
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum CloseReason {
    ClientEof,
    UpstreamEof,
    ReadError { direction: Direction, error: String },
    WriteError { direction: Direction, error: String },
    DialFailed { error: String },
    ClientClosedDuringDial,
    Shutdown,
}

impl CloseReason {
    /// Short stable name, used as a metrics label
    pub fn label(&self) -> &'static str {
        match self {
            CloseReason::ClientEof => "client_eof",
            CloseReason::UpstreamEof => "upstream_eof",
            CloseReason::ReadError { .. } => "read_error",
            CloseReason::WriteError { .. } => "write_error",
            CloseReason::DialFailed { .. } => "dial_failed",
            CloseReason::ClientClosedDuringDial => "client_closed_during_dial",
            CloseReason::Shutdown => "shutdown",
        }
    }

    /// Whether the pair closed because something went wrong rather than an orderly EOF
    pub fn is_error(&self) -> bool {
        matches!(
            self,
            CloseReason::ReadError { .. }
                | CloseReason::WriteError { .. }
                | CloseReason::DialFailed { .. }
        )
    }
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CloseReason::ClientEof => f.write_str("client closed"),
            CloseReason::UpstreamEof => f.write_str("upstream closed"),
            CloseReason::ReadError { direction, error } => {
                write!(f, "read error ({}): {}", direction, error)
            }
            CloseReason::WriteError { direction, error } => {
                write!(f, "write error ({}): {}", direction, error)
            }
            CloseReason::DialFailed { error } => write!(f, "upstream dial failed: {}", error),
            CloseReason::ClientClosedDuringDial => f.write_str("client closed during dial"),
            CloseReason::Shutdown => f.write_str("relay shutting down"),
        }
    }
}

/// Shared view of a relay pair
#[derive(Debug)]
pub struct RelaySession {
    pub pair_id: PairId,
    pub client_addr: Option<SocketAddr>,
    pub upstream_addr: SocketAddr,
    pub start_time: Instant,
    started_at: SystemTime,
    alive: AtomicBool,
    state: watch::Sender<PairState>,
    bytes_up: AtomicU64,
    bytes_down: AtomicU64,
    in_flight_up: AtomicU64,
    in_flight_down: AtomicU64,
    close_reason: Mutex<Option<CloseReason>>,
}

/// Connection statistics for a pair, live or completed
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionStats {
    pub pair_id: PairId,
    pub client_addr: Option<SocketAddr>,
    pub upstream_addr: SocketAddr,
    pub state: PairState,
    pub start_time: SystemTime,
    pub duration_ms: u64,
    pub bytes_up: u64,
    pub bytes_down: u64,
    pub total_bytes: u64,
    pub close_reason: Option<CloseReason>,
}

impl RelaySession {
    pub fn new(pair_id: PairId, client_addr: Option<SocketAddr>, upstream_addr: SocketAddr) -> Self {
        debug!(pair_id = %pair_id, client_addr = ?client_addr, upstream_addr = %upstream_addr,
               "Creating relay session");

        let (state, _) = watch::channel(PairState::Connecting);
        Self {
            pair_id,
            client_addr,
            upstream_addr,
            start_time: Instant::now(),
            started_at: SystemTime::now(),
            alive: AtomicBool::new(true),
            state,
            bytes_up: AtomicU64::new(0),
            bytes_down: AtomicU64::new(0),
            in_flight_up: AtomicU64::new(0),
            in_flight_down: AtomicU64::new(0),
            close_reason: Mutex::new(None),
        }
    }

    pub fn state(&self) -> PairState {
        *self.state.borrow()
    }

    /// Watch lifecycle transitions
    pub fn subscribe_state(&self) -> watch::Receiver<PairState> {
        self.state.subscribe()
    }

    pub(crate) fn set_state(&self, state: PairState) {
        let previous = self.state.send_replace(state);
        if previous != state {
            debug!(pair_id = %self.pair_id, from = ?previous, to = ?state, "Relay pair state change");
        }
    }

    /// False once teardown has begun; loops must not pump into a dead pair
    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::Acquire)
    }

    /// Mark the pair dead, recording the first reason given. Returns false if already dead.
    pub(crate) fn terminate(&self, reason: CloseReason) -> bool {
        if self.alive.swap(false, Ordering::AcqRel) {
            let mut slot = self
                .close_reason
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            slot.get_or_insert(reason);
            true
        } else {
            false
        }
    }

    pub fn close_reason(&self) -> Option<CloseReason> {
        self.close_reason
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    /// Record `bytes` read from the source and now held while the write drains
    pub(crate) fn begin_write(&self, direction: Direction, bytes: usize) {
        self.in_flight(direction).store(bytes as u64, Ordering::Relaxed);
    }

    /// Record that the pending write completed
    pub(crate) fn end_write(&self, direction: Direction, bytes: usize) {
        self.in_flight(direction).store(0, Ordering::Relaxed);
        self.counter(direction).fetch_add(bytes as u64, Ordering::Relaxed);
    }

    /// Bytes read from the source but not yet acknowledged by the destination
    pub fn in_flight_bytes(&self, direction: Direction) -> u64 {
        match direction {
            Direction::ClientToUpstream => self.in_flight_up.load(Ordering::Relaxed),
            Direction::UpstreamToClient => self.in_flight_down.load(Ordering::Relaxed),
        }
    }

    /// Bytes delivered client to upstream
    pub fn bytes_up(&self) -> u64 {
        self.bytes_up.load(Ordering::Relaxed)
    }

    /// Bytes delivered upstream to client
    pub fn bytes_down(&self) -> u64 {
        self.bytes_down.load(Ordering::Relaxed)
    }

    pub fn total_bytes(&self) -> u64 {
        self.bytes_up() + self.bytes_down()
    }

    pub fn duration(&self) -> std::time::Duration {
        self.start_time.elapsed()
    }

    fn in_flight(&self, direction: Direction) -> &AtomicU64 {
        match direction {
            Direction::ClientToUpstream => &self.in_flight_up,
            Direction::UpstreamToClient => &self.in_flight_down,
        }
    }

    fn counter(&self, direction: Direction) -> &AtomicU64 {
        match direction {
            Direction::ClientToUpstream => &self.bytes_up,
            Direction::UpstreamToClient => &self.bytes_down,
        }
    }

    pub fn to_stats(&self) -> ConnectionStats {
        ConnectionStats {
            pair_id: self.pair_id,
            client_addr: self.client_addr,
            upstream_addr: self.upstream_addr,
            state: self.state(),
            start_time: self.started_at,
            duration_ms: self.duration().as_millis() as u64,
            bytes_up: self.bytes_up(),
            bytes_down: self.bytes_down(),
            total_bytes: self.total_bytes(),
            close_reason: self.close_reason(),
        }
    }

    pub fn log_stats(&self) {
        let reason = self
            .close_reason()
            .map(|r| r.to_string())
            .unwrap_or_else(|| "unknown".to_string());

        info!(
            pair_id = %self.pair_id,
            client_addr = ?self.client_addr,
            upstream_addr = %self.upstream_addr,
            duration_ms = self.duration().as_millis() as u64,
            bytes_up = self.bytes_up(),
            bytes_down = self.bytes_down(),
            total_bytes = self.total_bytes(),
            reason = %reason,
            "Relay pair closed"
        );
    }
}
