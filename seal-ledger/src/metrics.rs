//! Metrics collection for observability
//!
//! Prometheus metrics for monitoring the sealer, lock and reconciler.
//! Collectors live in a private registry so several ledgers can run in one
//! process.
//!
//! # Metrics
//!
//! - `ledger_blocks_sealed_total{ledger}` - Blocks sealed
//! - `ledger_items_sealed_total{ledger}` - Items sealed
//! - `ledger_commit_conflicts_total{ledger}` - Commits refused by the lock or a unique race
//! - `ledger_seal_duration_seconds{ledger}` - Time spent holding the lock
//! - `ledger_lock_heartbeat_lost_total{ledger}` - Leases lost while sealing
//! - `ledger_pointers_relinked_total` - Trade fills relinked by the reconciler
//! - `ledger_chain_verifications_total{ledger,outcome}` - Chain verification runs

use prometheus::{
    Encoder, HistogramOpts, HistogramVec, IntCounter, IntCounterVec, Opts, Registry, TextEncoder,
};
use std::sync::Arc;

use crate::types::LedgerKind;

/// Metrics collector
#[derive(Clone, Debug)]
pub struct Metrics {
    /// Blocks sealed
    pub blocks_sealed: IntCounterVec,

    /// Items sealed
    pub items_sealed: IntCounterVec,

    /// Commit conflicts
    pub commit_conflicts: IntCounterVec,

    /// Seal duration histogram
    pub seal_duration: HistogramVec,

    /// Heartbeat losses
    pub heartbeat_lost: IntCounterVec,

    /// Rows relinked by the reconciler
    pub pointers_relinked: IntCounter,

    /// Chain verification runs
    pub chain_verifications: IntCounterVec,

    /// Prometheus registry
    pub registry: Arc<Registry>,
}

impl Metrics {
    /// Create new metrics collector
    pub fn new() -> prometheus::Result<Self> {
        let registry = Arc::new(Registry::new());

        let blocks_sealed = IntCounterVec::new(
            Opts::new("ledger_blocks_sealed_total", "Total number of sealed blocks"),
            &["ledger"],
        )?;
        registry.register(Box::new(blocks_sealed.clone()))?;

        let items_sealed = IntCounterVec::new(
            Opts::new("ledger_items_sealed_total", "Total number of sealed items"),
            &["ledger"],
        )?;
        registry.register(Box::new(items_sealed.clone()))?;

        let commit_conflicts = IntCounterVec::new(
            Opts::new(
                "ledger_commit_conflicts_total",
                "Commits refused by the lock or a unique index race",
            ),
            &["ledger"],
        )?;
        registry.register(Box::new(commit_conflicts.clone()))?;

        let seal_duration = HistogramVec::new(
            HistogramOpts::new("ledger_seal_duration_seconds", "Histogram of seal latencies")
                .buckets(vec![0.005, 0.010, 0.025, 0.050, 0.100, 0.250, 0.500, 1.0, 2.5, 5.0]),
            &["ledger"],
        )?;
        registry.register(Box::new(seal_duration.clone()))?;

        let heartbeat_lost = IntCounterVec::new(
            Opts::new(
                "ledger_lock_heartbeat_lost_total",
                "Commit leases lost during a seal",
            ),
            &["ledger"],
        )?;
        registry.register(Box::new(heartbeat_lost.clone()))?;

        let pointers_relinked = IntCounter::new(
            "ledger_pointers_relinked_total",
            "Trade fills relinked to their wallet transaction's ledger pointers",
        )?;
        registry.register(Box::new(pointers_relinked.clone()))?;

        let chain_verifications = IntCounterVec::new(
            Opts::new("ledger_chain_verifications_total", "Chain verification runs"),
            &["ledger", "outcome"],
        )?;
        registry.register(Box::new(chain_verifications.clone()))?;

        Ok(Self {
            blocks_sealed,
            items_sealed,
            commit_conflicts,
            seal_duration,
            heartbeat_lost,
            pointers_relinked,
            chain_verifications,
            registry,
        })
    }

    /// Record a sealed block
    pub fn record_block_sealed(&self, kind: LedgerKind, items: usize) {
        self.blocks_sealed.with_label_values(&[kind.as_str()]).inc();
        self.items_sealed
            .with_label_values(&[kind.as_str()])
            .inc_by(items as u64);
    }

    /// Record a refused commit
    pub fn record_conflict(&self, kind: LedgerKind) {
        self.commit_conflicts.with_label_values(&[kind.as_str()]).inc();
    }

    /// Record time spent sealing
    pub fn record_seal_duration(&self, kind: LedgerKind, duration_seconds: f64) {
        self.seal_duration
            .with_label_values(&[kind.as_str()])
            .observe(duration_seconds);
    }

    /// Record a lost lease
    pub fn record_heartbeat_lost(&self, kind: LedgerKind) {
        self.heartbeat_lost.with_label_values(&[kind.as_str()]).inc();
    }

    /// Record relinked rows
    pub fn record_relinked(&self, rows: u64) {
        self.pointers_relinked.inc_by(rows);
    }

    /// Record a chain verification
    pub fn record_verification(&self, kind: LedgerKind, ok: bool) {
        let outcome = if ok { "ok" } else { "broken" };
        self.chain_verifications
            .with_label_values(&[kind.as_str(), outcome])
            .inc();
    }

    /// Get metrics registry
    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Text exposition of all collectors
    pub fn render(&self) -> String {
        let mut buffer = Vec::new();
        let encoder = TextEncoder::new();
        if encoder.encode(&self.registry.gather(), &mut buffer).is_err() {
            return String::new();
        }
        String::from_utf8(buffer).unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_creation() {
        let metrics = Metrics::new().unwrap();
        assert_eq!(
            metrics
                .blocks_sealed
                .with_label_values(&["settlement"])
                .get(),
            0
        );
        // A second collector in the same process must not clash
        assert!(Metrics::new().is_ok());
    }

    #[test]
    fn test_record_block_sealed() {
        let metrics = Metrics::new().unwrap();
        metrics.record_block_sealed(LedgerKind::Audit, 3);
        metrics.record_block_sealed(LedgerKind::Audit, 2);
        assert_eq!(metrics.blocks_sealed.with_label_values(&["audit"]).get(), 2);
        assert_eq!(metrics.items_sealed.with_label_values(&["audit"]).get(), 5);
        assert_eq!(
            metrics.blocks_sealed.with_label_values(&["settlement"]).get(),
            0
        );
    }

    #[test]
    fn test_render_contains_names() {
        let metrics = Metrics::new().unwrap();
        metrics.record_conflict(LedgerKind::Settlement);
        metrics.record_relinked(4);
        let text = metrics.render();
        assert!(text.contains("ledger_commit_conflicts_total"));
        assert!(text.contains("ledger_pointers_relinked_total 4"));
    }
}
