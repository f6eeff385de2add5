//! Supplier side: serves demand messages from local partitions and the WAL.

use crate::error::WalError;
use crate::metrics::RebalanceMetrics;
use crate::partition::{GroupContext, PartitionState};
use crate::rebalance::message::{
    DemandMessage, GroupAdvertisement, HistoricalRecord, PartitionAdvert, SupplyMessage,
};
use crate::types::{GroupId, GroupPartition, NodeId, PartitionId};
use crate::wal::{WalManager, WalPointer, WalRecord};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Receives supply messages. Returning `false` stops the supply.
pub type SupplySink<'a> = dyn FnMut(SupplyMessage) -> bool + 'a;

/// Serves demands for the cache groups of one node.
pub struct Supplier {
    node: NodeId,
    groups: HashMap<GroupId, Arc<GroupContext>>,
    wal: Arc<WalManager>,
    batch_size: usize,
    metrics: Arc<RebalanceMetrics>,
}

impl Supplier {
    pub fn new(
        node: NodeId,
        groups: impl IntoIterator<Item = Arc<GroupContext>>,
        wal: Arc<WalManager>,
        batch_size: usize,
        metrics: Arc<RebalanceMetrics>,
    ) -> Self {
        Self {
            node,
            groups: groups.into_iter().map(|g| (g.id(), g)).collect(),
            wal,
            batch_size: batch_size.max(1),
            metrics,
        }
    }

    pub fn node(&self) -> NodeId {
        self.node
    }

    /// Partition map of `group` as published during exchange.
    pub fn advertise(&self, group: GroupId) -> GroupAdvertisement {
        let mut advert = GroupAdvertisement::new(self.node, group);
        let Some(ctx) = self.groups.get(&group) else {
            return advert;
        };
        for partition in ctx.partitions() {
            let Some(local) = ctx.partition(partition) else {
                continue;
            };
            let (state, size) = {
                let guard = local.read();
                (guard.state(), guard.len() as u64)
            };
            if state == PartitionState::Evicted {
                continue;
            }
            let id = GroupPartition::new(group, partition);
            advert.partitions.insert(
                partition,
                PartitionAdvert {
                    state,
                    counter: ctx.counter(partition),
                    size,
                    history_start: ctx.tracker().earliest_historical_counter(id),
                },
            );
        }
        advert
    }

    /// Serve one demand. Messages are pushed to `sink` in order; the last
    /// message for a partition carries its final counter in `last`.
    pub fn handle_demand(&self, demander: NodeId, demand: &DemandMessage, sink: &mut SupplySink<'_>) {
        let Some(ctx) = self.groups.get(&demand.group) else {
            let mut msg = self.message(demand);
            msg.missed.extend(demand.partitions());
            sink(msg);
            return;
        };
        debug!(
            group = demand.group,
            demander,
            full = demand.full.len(),
            historical = demand.historical.len(),
            "Demand received"
        );

        if !self.supply_full(ctx, demand, sink) {
            return;
        }
        if !demand.historical.is_empty() {
            self.supply_historical(ctx, demander, demand, sink);
        }
    }

    fn message(&self, demand: &DemandMessage) -> SupplyMessage {
        SupplyMessage::new(demand.group, demand.topology, self.node)
    }

    fn send(&self, msg: SupplyMessage, sink: &mut SupplySink<'_>) -> bool {
        self.metrics.records_supplied.inc_by(msg.record_count() as u64);
        sink(msg)
    }

    fn supply_full(&self, ctx: &GroupContext, demand: &DemandMessage, sink: &mut SupplySink<'_>) -> bool {
        for &partition in &demand.full {
            let supplies = matches!(
                ctx.state(partition),
                Some(PartitionState::Owning) | Some(PartitionState::Renting)
            );
            let snapshot = if supplies { ctx.snapshot(partition) } else { None };
            let Some(snapshot) = snapshot else {
                let mut msg = self.message(demand);
                msg.missed.insert(partition);
                if !self.send(msg, sink) {
                    return false;
                }
                continue;
            };

            let mut rows = snapshot.rows.into_iter().peekable();
            loop {
                let batch: Vec<_> = rows.by_ref().take(self.batch_size).collect();
                let mut msg = self.message(demand);
                let done = rows.peek().is_none();
                msg.full.insert(partition, batch);
                if done {
                    msg.last.insert(partition, snapshot.counter);
                }
                if !self.send(msg, sink) {
                    return false;
                }
                if done {
                    break;
                }
            }
        }
        true
    }

    fn supply_historical(
        &self,
        ctx: &GroupContext,
        demander: NodeId,
        demand: &DemandMessage,
        sink: &mut SupplySink<'_>,
    ) {
        let group = demand.group;
        let mut failed: BTreeMap<PartitionId, String> = BTreeMap::new();
        let mut from: BTreeMap<PartitionId, u64> = BTreeMap::new();
        let mut start: Option<WalPointer> = None;

        for (&partition, &counter) in &demand.historical {
            let id = GroupPartition::new(group, partition);
            match ctx.tracker().historical_range(id, counter) {
                Some(ptr) => {
                    start = Some(start.map_or(ptr, |s| s.min(ptr)));
                    from.insert(partition, counter);
                }
                None => {
                    failed.insert(partition, "range_unavailable".to_string());
                }
            }
        }

        let history = ctx.tracker().history().clone();
        let reserved = match start {
            Some(ptr) if history.reserve(ptr) => Some(ptr),
            _ => None,
        };
        let Some(start) = reserved else {
            failed.extend(from.keys().map(|p| (*p, "range_unavailable".to_string())));
            self.report_failed(demand, demander, failed, sink);
            return;
        };

        let result = self.replay(ctx, demand, start, &from, sink);
        history.release(start);

        match result {
            Ok(Some(finals)) => {
                let mut msg = self.message(demand);
                msg.last = finals;
                msg.failed_historical = failed;
                self.send(msg, sink);
                info!(
                    group,
                    demander,
                    partitions = from.len(),
                    from = %start,
                    "Historical supply finished"
                );
            }
            // Cancelled by the demander.
            Ok(None) => {}
            Err(e) => {
                let reason = e.fallback_reason();
                warn!(
                    group,
                    demander,
                    partitions = ?from.keys().collect::<Vec<_>>(),
                    reason,
                    error = %e,
                    "Failed to supply history"
                );
                failed.extend(from.keys().map(|p| (*p, reason.to_string())));
                self.report_failed(demand, demander, failed, sink);
            }
        }
    }

    /// Replay `[start, end)` of the log. Returns the final counters, or
    /// `None` if the sink stopped the supply.
    fn replay(
        &self,
        ctx: &GroupContext,
        demand: &DemandMessage,
        start: WalPointer,
        from: &BTreeMap<PartitionId, u64>,
        sink: &mut SupplySink<'_>,
    ) -> Result<Option<BTreeMap<PartitionId, u64>>, WalError> {
        // Counters first: everything up to them is logged before `end`.
        let finals: BTreeMap<PartitionId, u64> =
            from.keys().map(|&p| (p, ctx.counter(p))).collect();
        let end = self.wal.end_pointer();

        let mut batch = Vec::with_capacity(self.batch_size);
        for item in self.wal.iterator(start, Some(end))? {
            let (_, record) = item?;
            let replayed = match record {
                WalRecord::DataEntry(entry) if entry.group == demand.group => from
                    .get(&entry.partition)
                    .filter(|&&counter| entry.update_counter > counter)
                    .map(|_| HistoricalRecord::Entry(entry)),
                WalRecord::Rollback {
                    group,
                    partition,
                    start,
                    range,
                } if group == demand.group => from
                    .get(&partition)
                    .filter(|&&counter| start + range > counter)
                    .map(|_| HistoricalRecord::Rollback {
                        partition,
                        start,
                        delta: range,
                    }),
                _ => None,
            };
            if let Some(record) = replayed {
                batch.push(record);
            }
            if batch.len() >= self.batch_size {
                let mut msg = self.message(demand);
                msg.historical = std::mem::take(&mut batch);
                if !self.send(msg, sink) {
                    return Ok(None);
                }
            }
        }

        if !batch.is_empty() {
            let mut msg = self.message(demand);
            msg.historical = batch;
            if !self.send(msg, sink) {
                return Ok(None);
            }
        }
        Ok(Some(finals))
    }

    fn report_failed(
        &self,
        demand: &DemandMessage,
        demander: NodeId,
        failed: BTreeMap<PartitionId, String>,
        sink: &mut SupplySink<'_>,
    ) {
        if failed.is_empty() {
            return;
        }
        warn!(
            group = demand.group,
            demander,
            partitions = ?failed.keys().collect::<Vec<_>>(),
            "Historical supply not possible"
        );
        let mut msg = self.message(demand);
        msg.failed_historical = failed;
        self.send(msg, sink);
    }
}

impl std::fmt::Debug for Supplier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Supplier")
            .field("node", &self.node)
            .field("groups", &self.groups.len())
            .finish()
    }
}
