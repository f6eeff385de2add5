//! A storage node: the log, the partitions and the rebalance machinery wired
//! together.
//!
//! Start order matters. Binary metadata is restored before anything reads
//! records, the WAL is opened before the partitions are recovered from the
//! newest checkpoint plus the log tail, and the supplier is registered before
//! the exchange worker accepts its first topology.

use crate::binary::BinaryMetadataFileStore;
use crate::checkpoint::{CheckpointInfo, CheckpointSnapshot, Checkpointer};
use crate::config::{CacheGroupConfig, NodeConfig};
use crate::counters::{CheckpointHistory, UpdateCounterTracker};
use crate::error::{Error, ExchangeError, Result};
use crate::exchange::{
    AffinityAssignment, ExchangeContext, ExchangeFuture, ExchangeListener, ExchangeWorker,
    HistoricalExclusions,
};
use crate::failure::FailureProcessor;
use crate::metrics::{NodeMetrics, NodeMetricsSnapshot};
use crate::partition::{GroupContext, PartitionHash, PartitionState, WriteBarrier};
use crate::rebalance::{
    Demander, LocalPartitionInfo, RebalanceFuture, RebalancePlanner, RebalanceTransport, Supplier,
};
use crate::testing::failpoint::FailpointRegistry;
use crate::types::{ExchangeId, GroupId, NodeId, PartitionId, TopologyEvent, TopologyVersion};
use crate::wal::{DataEntry, WalManager, WalPointer, WalRecord};
use bytes::Bytes;
use parking_lot::RwLock;
use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use tracing::{debug, info, warn};

/// Affinity of the last completed exchange.
#[derive(Debug, Clone)]
struct Topology {
    exchange: ExchangeId,
    nodes: Vec<NodeId>,
    assignments: BTreeMap<GroupId, AffinityAssignment>,
}

struct NodeInner {
    me: Weak<NodeInner>,
    config: NodeConfig,
    failure: Arc<FailureProcessor>,
    metadata: BinaryMetadataFileStore,
    wal: Arc<WalManager>,
    history: Arc<CheckpointHistory>,
    checkpointer: Checkpointer,
    barrier: WriteBarrier,
    groups: BTreeMap<GroupId, Arc<GroupContext>>,
    transport: Arc<dyn RebalanceTransport>,
    planner: RebalancePlanner,
    demander: Demander,
    metrics: NodeMetrics,
    topology: RwLock<Option<Topology>>,
    stopped: AtomicBool,
}

/// A running node.
pub struct Node {
    inner: Arc<NodeInner>,
    worker: ExchangeWorker,
}

impl Node {
    /// Start a node hosting `groups`, recovering whatever `config.work_dir`
    /// already holds.
    pub fn start(
        config: NodeConfig,
        groups: Vec<CacheGroupConfig>,
        transport: Arc<dyn RebalanceTransport>,
        failpoints: Option<Arc<FailpointRegistry>>,
    ) -> Result<Self> {
        Self::start_with_failure(
            config,
            groups,
            transport,
            failpoints,
            Arc::new(FailureProcessor::default()),
        )
    }

    /// Like [`start`](Self::start) with an explicit failure processor.
    pub fn start_with_failure(
        config: NodeConfig,
        groups: Vec<CacheGroupConfig>,
        transport: Arc<dyn RebalanceTransport>,
        failpoints: Option<Arc<FailpointRegistry>>,
        failure: Arc<FailureProcessor>,
    ) -> Result<Self> {
        config.validate()?;
        let node_id = config.node_id;
        info!(node = node_id, work_dir = %config.work_dir.display(), "Starting node");

        let metadata = BinaryMetadataFileStore::new(
            config.metadata_dir(),
            config.metadata.persistence_enabled,
            config.metadata.queue_capacity,
            failure.clone(),
            failpoints.clone(),
        )?;
        let types = metadata.restore();

        let metrics = NodeMetrics::new();
        let wal = Arc::new(WalManager::open(
            config.wal.clone(),
            config.wal_dir(),
            config.wal_archive_dir(),
            failure.clone(),
            failpoints,
            metrics.wal.clone(),
        )?);

        let history = Arc::new(CheckpointHistory::new());
        let tracker = Arc::new(UpdateCounterTracker::new(history.clone()));
        let checkpointer = Checkpointer::new(
            config.checkpoint_dir(),
            config.checkpoint.clone(),
            history.clone(),
        )?;

        let barrier: WriteBarrier = Arc::new(RwLock::new(()));
        let groups: BTreeMap<GroupId, Arc<GroupContext>> = groups
            .into_iter()
            .map(|g| {
                let ctx = GroupContext::new(g, tracker.clone(), wal.clone(), barrier.clone());
                (ctx.id(), Arc::new(ctx))
            })
            .collect();

        let replayed = recover(&wal, &history, &checkpointer, &groups)?;

        let supplier = Arc::new(Supplier::new(
            node_id,
            groups.values().cloned(),
            wal.clone(),
            config.rebalance.batch_size,
            metrics.rebalance.clone(),
        ));
        transport.register(supplier);

        let worker = ExchangeWorker::new(config.exchange.clone());
        let planner = RebalancePlanner::new(
            node_id,
            config.rebalance.historical_threshold,
            metrics.rebalance.clone(),
        );
        let demander = Demander::new(
            node_id,
            config.rebalance.clone(),
            transport.clone(),
            metrics.rebalance.clone(),
            Some(worker.queue()),
        );

        let inner = Arc::new_cyclic(|me| NodeInner {
            me: me.clone(),
            config,
            failure,
            metadata,
            wal,
            history,
            checkpointer,
            barrier,
            groups,
            transport,
            planner,
            demander,
            metrics,
            topology: RwLock::new(None),
            stopped: AtomicBool::new(false),
        });

        let weak: Weak<NodeInner> = Arc::downgrade(&inner);
        let listener: Weak<dyn ExchangeListener> = weak;
        worker.start(listener)?;

        info!(node = node_id, types, replayed, groups = inner.groups.len(), "Node started");
        Ok(Self { inner, worker })
    }

    pub fn id(&self) -> NodeId {
        self.inner.config.node_id
    }

    pub fn config(&self) -> &NodeConfig {
        &self.inner.config
    }

    pub fn group(&self, group: GroupId) -> Option<&Arc<GroupContext>> {
        self.inner.groups.get(&group)
    }

    pub fn wal(&self) -> &Arc<WalManager> {
        &self.inner.wal
    }

    pub fn history(&self) -> &Arc<CheckpointHistory> {
        &self.inner.history
    }

    pub fn binary_metadata(&self) -> &BinaryMetadataFileStore {
        &self.inner.metadata
    }

    pub fn failure_processor(&self) -> &Arc<FailureProcessor> {
        &self.inner.failure
    }

    /// Primary write of `key` in `group`.
    pub fn put(&self, group: GroupId, key: impl Into<Bytes>, value: impl Into<Bytes>) -> Result<DataEntry> {
        self.inner.check_running()?;
        self.inner.group(group)?.put(key, value)
    }

    pub fn remove(&self, group: GroupId, key: impl Into<Bytes>) -> Result<DataEntry> {
        self.inner.check_running()?;
        self.inner.group(group)?.remove(key)
    }

    pub fn get(&self, group: GroupId, key: &[u8]) -> Option<Bytes> {
        self.inner.groups.get(&group)?.get(key)
    }

    /// Backup write carrying the primary's counter.
    pub fn apply_replicated(&self, entry: &DataEntry) -> Result<bool> {
        self.inner.check_running()?;
        self.inner.group(entry.group)?.apply_replicated(entry)
    }

    /// Take a checkpoint of every group.
    pub fn checkpoint(&self) -> Result<CheckpointInfo> {
        self.inner.checkpoint()
    }

    /// Stop logging updates of `group`. Its WAL history is dropped.
    pub fn disable_wal(&self, group: GroupId) -> Result<()> {
        self.inner.check_running()?;
        self.inner.group(group)?;
        {
            let _barrier = self.inner.barrier.write();
            self.inner
                .wal
                .append(&WalRecord::WalStateChange { group, enabled: false })?;
            self.inner.history.disable_wal(group);
        }
        info!(group, "WAL disabled");
        Ok(())
    }

    /// Resume logging updates of `group`. History for the group restarts at
    /// the checkpoint taken here.
    pub fn enable_wal(&self, group: GroupId) -> Result<CheckpointInfo> {
        self.inner.check_running()?;
        self.inner.group(group)?;
        {
            let _barrier = self.inner.barrier.write();
            self.inner.history.enable_wal(group);
            self.inner
                .wal
                .append(&WalRecord::WalStateChange { group, enabled: true })?;
        }
        info!(group, "WAL enabled");
        self.inner.checkpoint()
    }

    /// Queue a topology change.
    pub fn on_topology_change(
        &self,
        version: TopologyVersion,
        nodes: Vec<NodeId>,
        event: TopologyEvent,
    ) -> ExchangeFuture {
        self.worker
            .queue()
            .submit_topology(ExchangeId::new(version, event), nodes)
    }

    /// Version of the last completed exchange.
    pub fn topology_version(&self) -> TopologyVersion {
        self.worker.queue().last_version()
    }

    /// Owners of `group` at the last completed exchange.
    pub fn assignment(&self, group: GroupId) -> Option<AffinityAssignment> {
        self.inner
            .topology
            .read()
            .as_ref()
            .and_then(|t| t.assignments.get(&group).cloned())
    }

    /// Current rebalance of `group`.
    pub fn rebalance_future(&self, group: GroupId) -> Option<Arc<RebalanceFuture>> {
        self.inner.demander.future(group)
    }

    /// Idle-verify records of the `Owning` partitions of `group`.
    pub fn partition_hashes(&self, group: GroupId) -> BTreeMap<PartitionId, PartitionHash> {
        let Some(ctx) = self.inner.groups.get(&group) else {
            return BTreeMap::new();
        };
        ctx.partitions()
            .into_iter()
            .filter(|p| ctx.state(*p) == Some(PartitionState::Owning))
            .filter_map(|p| ctx.partition_hash(p).map(|h| (p, h)))
            .collect()
    }

    /// Close every counter gap on this node with logged rollbacks.
    pub fn finalize_update_counters(&self) -> Result<usize> {
        self.inner.finalize_update_counters(|_, _| true)
    }

    pub fn metrics(&self) -> NodeMetricsSnapshot {
        self.inner.metrics.snapshot()
    }

    pub fn is_stopped(&self) -> bool {
        self.inner.stopped.load(Ordering::Acquire)
    }

    /// Stop the node, in reverse start order.
    pub fn stop(&self) {
        if self.inner.stopped.swap(true, Ordering::AcqRel) {
            return;
        }
        let node = self.id();
        info!(node, "Stopping node");
        self.worker.stop();
        self.inner.demander.stop();
        self.inner.transport.unregister(node);
        self.inner.metadata.stop();
        if let Err(e) = self.inner.wal.stop() {
            warn!(node, error = %e, "Failed to stop WAL cleanly");
        }
        info!(node, "Node stopped");
    }
}

impl Drop for Node {
    fn drop(&mut self) {
        self.stop();
    }
}

impl std::fmt::Debug for Node {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Node")
            .field("id", &self.inner.config.node_id)
            .field("groups", &self.inner.groups.len())
            .field("stopped", &self.is_stopped())
            .finish()
    }
}

/// Load the newest checkpoint and replay the WAL after it. Returns the number
/// of records replayed.
fn recover(
    wal: &WalManager,
    history: &CheckpointHistory,
    checkpointer: &Checkpointer,
    groups: &BTreeMap<GroupId, Arc<GroupContext>>,
) -> Result<usize> {
    let recovered = checkpointer.recover()?;
    let from = match &recovered {
        Some(cp) => {
            for group in groups.values() {
                group.restore(&cp.partitions, &cp.rows);
            }
            Some(cp.info.pointer.next())
        }
        None => wal.oldest_segment().map(WalPointer::segment_start),
    };

    let mut replayed = 0;
    if let Some(from) = from {
        let iter = match wal.iterator(from, None) {
            Ok(iter) => Some(iter),
            Err(e) => {
                warn!(%from, error = %e, "WAL tail not available, skipping replay");
                None
            }
        };
        for item in iter.into_iter().flatten() {
            let (_, record) = item?;
            match &record {
                WalRecord::WalStateChange { group, enabled } => {
                    if *enabled {
                        history.enable_wal(*group);
                    } else {
                        history.disable_wal(*group);
                    }
                }
                WalRecord::DataEntry(_)
                | WalRecord::Rollback { .. }
                | WalRecord::DataPageInsert { .. }
                | WalRecord::DataPageUpdate { .. }
                | WalRecord::DataPageRemove { .. } => {
                    let ctx = record.group().and_then(|g| groups.get(&g));
                    if let Some(ctx) = ctx {
                        if ctx.replay(&record)? {
                            replayed += 1;
                        }
                    }
                }
                WalRecord::Checkpoint { .. } => {}
            }
        }
    }

    if let Some(oldest) = wal.oldest_segment() {
        history.truncate(oldest);
    }
    debug!(replayed, history = history.len(), "Recovery finished");
    Ok(replayed)
}

impl NodeInner {
    fn check_running(&self) -> Result<()> {
        if self.stopped.load(Ordering::Acquire) || self.failure.is_stopping() {
            return Err(Error::NodeStopping);
        }
        Ok(())
    }

    fn group(&self, group: GroupId) -> Result<&Arc<GroupContext>> {
        self.groups.get(&group).ok_or(Error::GroupNotFound(group))
    }

    fn checkpoint(&self) -> Result<CheckpointInfo> {
        self.check_running()?;
        let _barrier = self.barrier.write();
        let mut snapshot = CheckpointSnapshot::default();
        for (&id, group) in &self.groups {
            snapshot.groups.push(self.history.group_record(id));
            let (partitions, rows) = group.checkpoint_records();
            snapshot.partitions.extend(partitions);
            snapshot.rows.extend(rows);
        }
        self.checkpointer.checkpoint(&self.wal, snapshot)
    }

    fn finalize_update_counters(&self, filter: impl Fn(GroupId, PartitionId) -> bool) -> Result<usize> {
        let mut closed = 0;
        for (&id, group) in &self.groups {
            closed += group.close_gaps(|p| filter(id, p))?;
        }
        if closed > 0 {
            info!(node = self.config.node_id, closed, "Update counters finalized");
        }
        Ok(closed)
    }

    /// Bring the partitions of `group` in line with `assignment` and start
    /// rebalancing the ones that need data.
    fn rebalance_group(
        &self,
        group: &Arc<GroupContext>,
        exchange: ExchangeId,
        assignment: &AffinityAssignment,
        exclusions: HashSet<NodeId>,
    ) -> Result<()> {
        let node = self.config.node_id;
        let assigned: BTreeSet<PartitionId> = assignment.partitions_of(node).into_iter().collect();

        for partition in group.partitions() {
            if assigned.contains(&partition) {
                continue;
            }
            match group.state(partition) {
                Some(PartitionState::Renting) => group.evict(partition),
                Some(PartitionState::Evicted) | None => {}
                Some(_) => {
                    debug!(group = group.id(), partition, "Partition no longer assigned, renting");
                    group.set_state(partition, PartitionState::Renting)?;
                }
            }
        }

        let mut local = BTreeMap::new();
        for &partition in &assigned {
            let existed = group.partition(partition).is_some();
            let state = group.state(partition).unwrap_or(PartitionState::Moving);
            let counter = group.counter(partition);
            if !existed || state == PartitionState::Evicted {
                group.ensure_partition(partition, PartitionState::Moving);
            }
            local.insert(
                partition,
                LocalPartitionInfo {
                    state,
                    counter,
                    existing: existed
                        && state != PartitionState::Evicted
                        && (state == PartitionState::Owning || counter > 0),
                },
            );
        }

        let mut adverts = Vec::new();
        for &other in assignment.nodes().iter().filter(|n| **n != node) {
            match self.transport.advertise(other, group.id()) {
                Ok(advert) => adverts.push(advert),
                Err(e) => warn!(group = group.id(), node = other, error = %e, "No partition map from node"),
            }
        }

        let plan = self
            .planner
            .plan(group.id(), exchange.version, &local, &adverts, &exclusions);
        for &partition in &plan.owning {
            group.set_state(partition, PartitionState::Owning)?;
        }
        for demand in plan.demands.values() {
            for partition in demand.partitions() {
                group.set_state(partition, PartitionState::Moving)?;
            }
        }

        let needs_data = !plan.is_empty();
        let fut = self.demander.start(group.clone(), exchange, plan, exclusions);
        if needs_data {
            let me = self.me.clone();
            let group_id = group.id();
            fut.listen(move |success| {
                if !success {
                    return;
                }
                let Some(inner) = me.upgrade() else {
                    return;
                };
                if let Err(e) = inner.checkpoint() {
                    warn!(group = group_id, error = %e, "Checkpoint after rebalance failed");
                }
            });
        }
        Ok(())
    }
}

impl ExchangeListener for NodeInner {
    fn on_exchange(&self, ctx: &ExchangeContext) -> std::result::Result<(), ExchangeError> {
        let failed = |e: Error| ExchangeError::Failed {
            version: ctx.id.version.to_string(),
            reason: e.to_string(),
        };
        self.check_running().map_err(failed)?;

        let assignments: BTreeMap<GroupId, AffinityAssignment> = self
            .groups
            .values()
            .map(|g| {
                let cfg = g.config();
                (
                    g.id(),
                    AffinityAssignment::compute(ctx.id.version, &ctx.nodes, cfg.partitions, cfg.backups),
                )
            })
            .collect();
        *self.topology.write() = Some(Topology {
            exchange: ctx.id,
            nodes: ctx.nodes.clone(),
            assignments: assignments.clone(),
        });

        // A departed primary may have left holes that nobody will fill.
        if ctx.merged.iter().any(|id| id.event.is_departure()) {
            let node = self.config.node_id;
            self.finalize_update_counters(|group, partition| {
                assignments
                    .get(&group)
                    .and_then(|a| a.primary(partition))
                    == Some(node)
            })
            .map_err(failed)?;
        }

        for (id, assignment) in &assignments {
            if let Some(group) = self.groups.get(id) {
                self.rebalance_group(group, ctx.id, assignment, HashSet::new())
                    .map_err(failed)?;
            }
        }
        Ok(())
    }

    fn on_reassign(&self, exchange_id: ExchangeId, exclusions: &HistoricalExclusions) {
        let Some(topology) = self.topology.read().clone() else {
            return;
        };
        if topology.exchange != exchange_id {
            debug!(exchange = %exchange_id, current = %topology.exchange, "Reassignment for an old exchange ignored");
            return;
        }
        for (id, excluded) in exclusions {
            let (Some(group), Some(assignment)) = (self.groups.get(id), topology.assignments.get(id)) else {
                continue;
            };
            info!(group = *id, excluded = ?excluded, nodes = ?topology.nodes, "Re-planning rebalance");
            if let Err(e) = self.rebalance_group(group, exchange_id, assignment, excluded.clone()) {
                warn!(group = *id, error = %e, "Rebalance reassignment failed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CheckpointConfig;
    use crate::rebalance::LocalTransport;
    use crate::types::GroupPartition;
    use std::path::Path;
    use std::time::Duration;
    use tempfile::tempdir;

    fn groups() -> Vec<CacheGroupConfig> {
        vec![CacheGroupConfig::new(1, "default").with_partitions(8).with_backups(1)]
    }

    fn start(id: NodeId, dir: &Path, transport: &Arc<LocalTransport>) -> Node {
        let config = NodeConfig::new(id, dir)
            .with_checkpoint_config(CheckpointConfig::default().with_history_size(4));
        Node::start(config, groups(), transport.clone(), None).unwrap()
    }

    fn activate(node: &Node, nodes: Vec<NodeId>, version: TopologyVersion, event: TopologyEvent) {
        node.on_topology_change(version, nodes, event)
            .wait(Duration::from_secs(10))
            .unwrap()
            .unwrap();
    }

    #[test]
    fn test_single_node_owns_every_partition() {
        let dir = tempdir().unwrap();
        let transport = Arc::new(LocalTransport::new());
        let node = start(1, dir.path(), &transport);
        activate(&node, vec![1], TopologyVersion::new(1, 0), TopologyEvent::Activated);

        assert_eq!(node.topology_version(), TopologyVersion::new(1, 0));
        assert!(node.rebalance_future(1).unwrap().get());
        assert_eq!(node.group(1).unwrap().partitions().len(), 8);
        assert_eq!(node.partition_hashes(1).len(), 8);

        node.put(1, "k", "v").unwrap();
        assert_eq!(node.get(1, b"k"), Some(Bytes::from("v")));
        node.remove(1, "k").unwrap();
        assert_eq!(node.get(1, b"k"), None);
    }

    #[test]
    fn test_restart_recovers_checkpoint_and_tail() {
        let dir = tempdir().unwrap();
        let transport = Arc::new(LocalTransport::new());
        let before = {
            let node = start(1, dir.path(), &transport);
            activate(&node, vec![1], TopologyVersion::new(1, 0), TopologyEvent::Activated);
            for i in 0..20 {
                node.put(1, format!("a{}", i), "v").unwrap();
            }
            node.checkpoint().unwrap();
            for i in 0..20 {
                node.put(1, format!("b{}", i), "v").unwrap();
            }
            let hashes = node.partition_hashes(1);
            node.stop();
            hashes
        };

        let node = start(1, dir.path(), &transport);
        assert_eq!(node.partition_hashes(1), before);
        assert_eq!(node.get(1, b"b7"), Some(Bytes::from("v")));
        assert!(!node.history().is_empty());
    }

    #[test]
    fn test_disable_wal_drops_history() {
        let dir = tempdir().unwrap();
        let transport = Arc::new(LocalTransport::new());
        let node = start(1, dir.path(), &transport);
        activate(&node, vec![1], TopologyVersion::new(1, 0), TopologyEvent::Activated);
        node.put(1, "a", "1").unwrap();
        node.checkpoint().unwrap();
        let id = GroupPartition::new(1, node.group(1).unwrap().partition_of(b"a"));
        assert!(node.history().earliest_counter(id).is_some());

        node.disable_wal(1).unwrap();
        assert!(!node.group(1).unwrap().wal_enabled());
        assert!(node.history().earliest_counter(id).is_none());

        node.enable_wal(1).unwrap();
        assert!(node.group(1).unwrap().wal_enabled());
        assert!(node.history().earliest_counter(id).is_some());
    }

    #[test]
    fn test_recovery_skips_page_deltas() {
        let dir = tempdir().unwrap();
        let transport = Arc::new(LocalTransport::new());
        let before = {
            let node = start(1, dir.path(), &transport);
            activate(&node, vec![1], TopologyVersion::new(1, 0), TopologyEvent::Activated);
            node.checkpoint().unwrap();
            node.put(1, "a", "1").unwrap();
            node.wal()
                .append(&WalRecord::DataPageInsert {
                    group: 1,
                    page_id: 3,
                    payload: Bytes::from_static(b"a=1"),
                })
                .unwrap();
            node.wal()
                .append(&WalRecord::DataPageRemove {
                    group: 1,
                    page_id: 3,
                    item_id: 0,
                })
                .unwrap();
            node.put(1, "b", "2").unwrap();
            let hashes = node.partition_hashes(1);
            node.stop();
            hashes
        };

        let node = start(1, dir.path(), &transport);
        assert_eq!(node.partition_hashes(1), before);
        assert_eq!(node.get(1, b"a"), Some(Bytes::from("1")));
        assert_eq!(node.get(1, b"b"), Some(Bytes::from("2")));
    }

    #[test]
    fn test_wal_state_survives_restart() {
        let dir = tempdir().unwrap();
        let transport = Arc::new(LocalTransport::new());
        let id = {
            let node = start(1, dir.path(), &transport);
            activate(&node, vec![1], TopologyVersion::new(1, 0), TopologyEvent::Activated);
            node.put(1, "a", "1").unwrap();
            node.checkpoint().unwrap();
            node.disable_wal(1).unwrap();
            node.put(1, "b", "2").unwrap();
            node.checkpoint().unwrap();
            let id = GroupPartition::new(1, node.group(1).unwrap().partition_of(b"a"));
            node.stop();
            id
        };

        let node = start(1, dir.path(), &transport);
        assert!(!node.group(1).unwrap().wal_enabled());
        assert!(node.history().earliest_counter(id).is_none());
        assert_eq!(node.get(1, b"b"), Some(Bytes::from("2")));

        node.enable_wal(1).unwrap();
        let earliest = node.history().earliest_counter(id);
        assert!(earliest.is_some());
        node.stop();

        let node = start(1, dir.path(), &transport);
        assert!(node.group(1).unwrap().wal_enabled());
        assert_eq!(node.history().earliest_counter(id), earliest);
    }

    #[test]
    fn test_unknown_group_rejected() {
        let dir = tempdir().unwrap();
        let transport = Arc::new(LocalTransport::new());
        let node = start(1, dir.path(), &transport);
        assert!(matches!(node.put(9, "k", "v"), Err(Error::GroupNotFound(9))));
        assert!(node.disable_wal(9).is_err());
    }

    #[test]
    fn test_stop_rejects_writes_and_unregisters() {
        let dir = tempdir().unwrap();
        let transport = Arc::new(LocalTransport::new());
        let node = start(1, dir.path(), &transport);
        assert!(transport.advertise(1, 1).is_ok());

        node.stop();
        assert!(node.is_stopped());
        assert!(matches!(node.put(1, "k", "v"), Err(Error::NodeStopping)));
        assert!(transport.advertise(1, 1).is_err());
    }
}
