//! Metrics Collector

use prometheus::{
    Histogram, HistogramOpts, IntCounter, IntCounterVec, IntGauge, Opts, Registry, TextEncoder,
};
use tracing::error;

use crate::relay::{CloseReason, Direction, RelaySession};
use crate::Result;

/// Relay-wide prometheus metrics
pub struct Metrics {
    registry: Registry,
    pairs_total: IntCounter,
    active_pairs: IntGauge,
    rejected_total: IntCounter,
    dial_failures_total: IntCounter,
    accept_errors_total: IntCounter,
    bytes_relayed_total: IntCounterVec,
    closes_total: IntCounterVec,
    pair_duration: Histogram,
}

/// Plain-number view of the counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub pairs_total: u64,
    pub active_pairs: i64,
    pub rejected_total: u64,
    pub dial_failures_total: u64,
    pub accept_errors_total: u64,
    pub bytes_up: u64,
    pub bytes_down: u64,
}

impl Metrics {
    pub fn new() -> Result<Self> {
        let registry = Registry::new();

        let pairs_total = IntCounter::new("relay_pairs_total", "Relay pairs created")?;
        let active_pairs = IntGauge::new("relay_active_pairs", "Relay pairs not yet closed")?;
        let rejected_total = IntCounter::new(
            "relay_rejected_connections_total",
            "Clients closed immediately because the pair limit was reached",
        )?;
        let dial_failures_total =
            IntCounter::new("relay_dial_failures_total", "Failed upstream dials")?;
        let accept_errors_total =
            IntCounter::new("relay_accept_errors_total", "Errors returned by accept")?;
        let bytes_relayed_total = IntCounterVec::new(
            Opts::new("relay_bytes_total", "Bytes delivered to the destination side"),
            &["direction"],
        )?;
        let closes_total = IntCounterVec::new(
            Opts::new("relay_pair_closes_total", "Relay pair teardowns by reason"),
            &["reason"],
        )?;
        let pair_duration = Histogram::with_opts(
            HistogramOpts::new("relay_pair_duration_seconds", "Lifetime of relay pairs")
                .buckets(vec![0.01, 0.1, 0.5, 1.0, 5.0, 30.0, 60.0, 300.0, 1800.0]),
        )?;

        registry.register(Box::new(pairs_total.clone()))?;
        registry.register(Box::new(active_pairs.clone()))?;
        registry.register(Box::new(rejected_total.clone()))?;
        registry.register(Box::new(dial_failures_total.clone()))?;
        registry.register(Box::new(accept_errors_total.clone()))?;
        registry.register(Box::new(bytes_relayed_total.clone()))?;
        registry.register(Box::new(closes_total.clone()))?;
        registry.register(Box::new(pair_duration.clone()))?;

        Ok(Self {
            registry,
            pairs_total,
            active_pairs,
            rejected_total,
            dial_failures_total,
            accept_errors_total,
            bytes_relayed_total,
            closes_total,
            pair_duration,
        })
    }

    pub fn pair_opened(&self) {
        self.pairs_total.inc();
        self.active_pairs.inc();
    }

    /// Fold a finished pair's totals into the counters
    pub fn pair_closed(&self, session: &RelaySession) {
        self.active_pairs.dec();
        self.pair_duration.observe(session.duration().as_secs_f64());
        self.bytes_relayed_total
            .with_label_values(&[Direction::ClientToUpstream.as_str()])
            .inc_by(session.bytes_up());
        self.bytes_relayed_total
            .with_label_values(&[Direction::UpstreamToClient.as_str()])
            .inc_by(session.bytes_down());

        if let Some(reason) = session.close_reason() {
            if matches!(reason, CloseReason::DialFailed { .. }) {
                self.dial_failures_total.inc();
            }
            self.closes_total.with_label_values(&[reason.label()]).inc();
        }
    }

    pub fn connection_rejected(&self) {
        self.rejected_total.inc();
    }

    pub fn accept_error(&self) {
        self.accept_errors_total.inc();
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            pairs_total: self.pairs_total.get(),
            active_pairs: self.active_pairs.get(),
            rejected_total: self.rejected_total.get(),
            dial_failures_total: self.dial_failures_total.get(),
            accept_errors_total: self.accept_errors_total.get(),
            bytes_up: self
                .bytes_relayed_total
                .with_label_values(&[Direction::ClientToUpstream.as_str()])
                .get(),
            bytes_down: self
                .bytes_relayed_total
                .with_label_values(&[Direction::UpstreamToClient.as_str()])
                .get(),
        }
    }

    /// Render every registered metric in the prometheus text format
    pub fn export_prometheus(&self) -> String {
        let encoder = TextEncoder::new();
        match encoder.encode_to_string(&self.registry.gather()) {
            Ok(text) => text,
            Err(e) => {
                error!("Failed to encode metrics: {}", e);
                String::new()
            }
        }
    }
}
