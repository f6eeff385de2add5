//! Metrics for the log and for rebalancing.
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                         NodeMetrics                          │
//! │  ┌─────────────────────────┐  ┌───────────────────────────┐ │
//! │  │       WalMetrics        │  │     RebalanceMetrics      │ │
//! │  │ - records/bytes/fsyncs  │  │ - historical/full demands │ │
//! │  │ - archived/compacted    │  │ - fallbacks by reason     │ │
//! │  │ - write retries         │  │ - records applied (shard) │ │
//! │  └─────────────────────────┘  └───────────────────────────┘ │
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! All metrics are lock-free atomics. Snapshots are plain structs.

mod counters;
mod gauges;

pub use counters::{Counter, LabeledCounter, ShardedCounter};
pub use gauges::Gauge;

use std::sync::Arc;

/// Number of slots for per-worker rebalance counters.
pub const REBALANCE_WORKER_SHARDS: usize = 16;

/// Write-ahead log metrics.
#[derive(Debug)]
pub struct WalMetrics {
    pub records_appended: Counter,
    pub bytes_appended: Counter,
    pub fsyncs: Counter,
    pub write_retries: Counter,
    pub segments_archived: Counter,
    pub segments_compacted: Counter,
    pub segments_truncated: Counter,
    pub current_segment: Gauge,
}

impl WalMetrics {
    pub fn new() -> Self {
        Self {
            records_appended: Counter::new("wal_records_appended", "Records appended to the WAL"),
            bytes_appended: Counter::new("wal_bytes_appended", "Framed bytes appended to the WAL"),
            fsyncs: Counter::new("wal_fsyncs", "fsync calls on WAL segments"),
            write_retries: Counter::new("wal_write_retries", "Retried WAL append attempts"),
            segments_archived: Counter::new("wal_segments_archived", "Segments moved to archive"),
            segments_compacted: Counter::new("wal_segments_compacted", "Archived segments compressed"),
            segments_truncated: Counter::new("wal_segments_truncated", "Archived segments deleted"),
            current_segment: Gauge::new("wal_current_segment"),
        }
    }

    pub fn snapshot(&self) -> WalMetricsSnapshot {
        WalMetricsSnapshot {
            records_appended: self.records_appended.get(),
            bytes_appended: self.bytes_appended.get(),
            fsyncs: self.fsyncs.get(),
            write_retries: self.write_retries.get(),
            segments_archived: self.segments_archived.get(),
            segments_compacted: self.segments_compacted.get(),
            segments_truncated: self.segments_truncated.get(),
            current_segment: self.current_segment.get(),
        }
    }
}

impl Default for WalMetrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Point-in-time copy of [`WalMetrics`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WalMetricsSnapshot {
    pub records_appended: u64,
    pub bytes_appended: u64,
    pub fsyncs: u64,
    pub write_retries: u64,
    pub segments_archived: u64,
    pub segments_compacted: u64,
    pub segments_truncated: u64,
    pub current_segment: i64,
}

/// Rebalance metrics, on both the demander and the supplier side.
#[derive(Debug)]
pub struct RebalanceMetrics {
    /// Demand messages asking for WAL history.
    pub historical_demands: Counter,
    /// Demand messages asking for full partition snapshots.
    pub full_demands: Counter,
    /// Historical supplies that failed and were downgraded, by reason.
    pub historical_fallbacks: LabeledCounter<1>,
    pub rebalances_started: Counter,
    pub rebalances_succeeded: Counter,
    pub rebalances_cancelled: Counter,
    pub partitions_owned: Counter,
    /// Records and rows applied by demander workers.
    pub records_applied: ShardedCounter,
    /// Records and rows shipped by the supplier.
    pub records_supplied: Counter,
    pub in_flight: Gauge,
}

impl RebalanceMetrics {
    pub fn new() -> Self {
        Self {
            historical_demands: Counter::new(
                "rebalance_historical_demands",
                "Historical demand messages sent",
            ),
            full_demands: Counter::new("rebalance_full_demands", "Full demand messages sent"),
            historical_fallbacks: LabeledCounter::new(
                "rebalance_historical_fallbacks",
                ["reason"],
            ),
            rebalances_started: Counter::new("rebalance_started", "Rebalance futures started"),
            rebalances_succeeded: Counter::new("rebalance_succeeded", "Rebalances completed"),
            rebalances_cancelled: Counter::new("rebalance_cancelled", "Rebalances finished false"),
            partitions_owned: Counter::new(
                "rebalance_partitions_owned",
                "Partitions moved to OWNING after rebalance",
            ),
            records_applied: ShardedCounter::new(
                "rebalance_records_applied",
                REBALANCE_WORKER_SHARDS,
            ),
            records_supplied: Counter::new("rebalance_records_supplied", "Records supplied"),
            in_flight: Gauge::new("rebalance_in_flight"),
        }
    }

    /// Count one demand message by kind.
    pub fn record_demand(&self, historical: bool) {
        if historical {
            self.historical_demands.inc();
        } else {
            self.full_demands.inc();
        }
    }

    /// Count a historical supply that was downgraded.
    pub fn record_fallback(&self, reason: &str) {
        self.historical_fallbacks.inc([reason]);
    }

    pub fn snapshot(&self) -> RebalanceMetricsSnapshot {
        RebalanceMetricsSnapshot {
            historical_demands: self.historical_demands.get(),
            full_demands: self.full_demands.get(),
            historical_fallbacks: self.historical_fallbacks.total(),
            rebalances_started: self.rebalances_started.get(),
            rebalances_succeeded: self.rebalances_succeeded.get(),
            rebalances_cancelled: self.rebalances_cancelled.get(),
            partitions_owned: self.partitions_owned.get(),
            records_applied: self.records_applied.sum(),
            records_supplied: self.records_supplied.get(),
        }
    }
}

impl Default for RebalanceMetrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Point-in-time copy of [`RebalanceMetrics`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RebalanceMetricsSnapshot {
    pub historical_demands: u64,
    pub full_demands: u64,
    pub historical_fallbacks: u64,
    pub rebalances_started: u64,
    pub rebalances_succeeded: u64,
    pub rebalances_cancelled: u64,
    pub partitions_owned: u64,
    pub records_applied: u64,
    pub records_supplied: u64,
}

/// All metrics of one node.
#[derive(Debug, Clone, Default)]
pub struct NodeMetrics {
    pub wal: Arc<WalMetrics>,
    pub rebalance: Arc<RebalanceMetrics>,
}

impl NodeMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> NodeMetricsSnapshot {
        NodeMetricsSnapshot {
            wal: self.wal.snapshot(),
            rebalance: self.rebalance.snapshot(),
        }
    }
}

/// Point-in-time copy of [`NodeMetrics`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NodeMetricsSnapshot {
    pub wal: WalMetricsSnapshot,
    pub rebalance: RebalanceMetricsSnapshot,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_demand_kinds_counted_separately() {
        let metrics = RebalanceMetrics::new();
        metrics.record_demand(true);
        metrics.record_demand(false);
        metrics.record_demand(false);
        metrics.record_fallback("corruption");

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.historical_demands, 1);
        assert_eq!(snapshot.full_demands, 2);
        assert_eq!(snapshot.historical_fallbacks, 1);
        assert_eq!(metrics.historical_fallbacks.get(["corruption"]), 1);
    }

    #[test]
    fn test_wal_snapshot() {
        let metrics = WalMetrics::new();
        metrics.records_appended.inc_by(3);
        metrics.current_segment.set(4);
        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.records_appended, 3);
        assert_eq!(snapshot.current_segment, 4);
    }

    #[test]
    fn test_node_snapshot_shares_metrics() {
        let metrics = NodeMetrics::new();
        let rebalance = metrics.rebalance.clone();
        rebalance.partitions_owned.inc();
        metrics.wal.fsyncs.inc();

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.rebalance.partitions_owned, 1);
        assert_eq!(snapshot.wal.fsyncs, 1);
    }
}
