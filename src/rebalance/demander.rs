//! Demander side: requests partitions from suppliers and applies what they send.
//!
//! One [`RebalanceFuture`] per cache group tracks the partitions of the
//! current rebalance. Each supplier is served by its own routine, which
//! retries transient transport failures with exponential backoff and applies
//! every supply message across a bounded pool of partition workers.
//!
//! A historical failure never aborts the rebalance: the affected partitions
//! are cancelled, the supplier is excluded from historical supply, and once
//! all routines finish the future reports `false` and a
//! [`ExchangeTask::RebalanceReassign`] is queued to redo them.

use crate::config::RebalanceConfig;
use crate::counters::CounterRange;
use crate::error::RebalanceError;
use crate::exchange::{ExchangeQueue, ExchangeTask, HistoricalExclusions};
use crate::future::CompletionFuture;
use crate::metrics::RebalanceMetrics;
use crate::partition::{GroupContext, PartitionState, Row};
use crate::rebalance::message::{DemandMessage, HistoricalRecord, SupplyMessage};
use crate::rebalance::planner::RebalancePlan;
use crate::rebalance::state::PartitionRebalanceState;
use crate::rebalance::transport::RebalanceTransport;
use crate::timeout::ExponentialBackoffTimeout;
use crate::types::{ExchangeId, GroupId, NodeId, PartitionId, TopologyVersion};
use bytes::Bytes;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Progress and outcome of one cache group's rebalance.
///
/// Completes with `true` when every demanded partition reached `Owning`, and
/// with `false` when it was cancelled or some partitions must be redone.
#[derive(Debug)]
pub struct RebalanceFuture {
    id: Uuid,
    group: GroupId,
    exchange: ExchangeId,
    states: Mutex<BTreeMap<PartitionId, PartitionRebalanceState>>,
    exclusions: Mutex<HashSet<NodeId>>,
    errors: Mutex<Vec<RebalanceError>>,
    cancelled: AtomicBool,
    result: CompletionFuture<bool, RebalanceError>,
}

impl RebalanceFuture {
    fn new(
        group: GroupId,
        exchange: ExchangeId,
        partitions: impl IntoIterator<Item = PartitionId>,
        exclusions: HashSet<NodeId>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            group,
            exchange,
            states: Mutex::new(
                partitions
                    .into_iter()
                    .map(|p| (p, PartitionRebalanceState::NeedsAssignment))
                    .collect(),
            ),
            exclusions: Mutex::new(exclusions),
            errors: Mutex::new(Vec::new()),
            cancelled: AtomicBool::new(false),
            result: CompletionFuture::new(),
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn group(&self) -> GroupId {
        self.group
    }

    pub fn exchange_id(&self) -> ExchangeId {
        self.exchange
    }

    pub fn topology(&self) -> TopologyVersion {
        self.exchange.version
    }

    /// Cancel the rebalance. The future completes with `false` right away;
    /// running routines stop at the next message boundary.
    pub fn cancel(&self) -> bool {
        if self.cancelled.swap(true, Ordering::AcqRel) {
            return false;
        }
        self.result.complete(Ok(false))
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }

    pub fn is_done(&self) -> bool {
        self.result.is_done()
    }

    /// Block until the rebalance finishes.
    pub fn get(&self) -> bool {
        matches!(self.result.get(), Ok(true))
    }

    /// Block for at most `timeout`. `None` if still running.
    pub fn wait(&self, timeout: Duration) -> Option<bool> {
        self.result.wait(timeout).map(|o| matches!(o, Ok(true)))
    }

    /// Run `f` with the outcome once the rebalance finishes.
    pub fn listen<F>(&self, f: F)
    where
        F: FnOnce(bool) + Send + 'static,
    {
        self.result.listen(move |outcome| f(matches!(outcome, Ok(true))));
    }

    pub fn state(&self, partition: PartitionId) -> Option<PartitionRebalanceState> {
        self.states.lock().get(&partition).copied()
    }

    pub fn states(&self) -> BTreeMap<PartitionId, PartitionRebalanceState> {
        self.states.lock().clone()
    }

    /// Suppliers that failed a historical supply during this rebalance.
    pub fn exclusions(&self) -> HashSet<NodeId> {
        self.exclusions.lock().clone()
    }

    pub fn errors(&self) -> Vec<RebalanceError> {
        self.errors.lock().clone()
    }

    fn transition(&self, partition: PartitionId, to: PartitionRebalanceState) -> Result<(), RebalanceError> {
        let mut states = self.states.lock();
        let Some(state) = states.get_mut(&partition) else {
            return Err(RebalanceError::Apply(format!(
                "partition {} is not part of rebalance {}",
                partition, self.id
            )));
        };
        *state = state.transition(partition, to)?;
        Ok(())
    }

    /// Move a partition to `Cancelled` unless it already finished.
    fn fail_partition(&self, partition: PartitionId, err: RebalanceError) {
        {
            let mut states = self.states.lock();
            match states.get_mut(&partition) {
                Some(state) if !state.is_terminal() => *state = PartitionRebalanceState::Cancelled,
                _ => return,
            }
        }
        self.errors.lock().push(err);
    }

    fn is_in_progress(&self, partition: PartitionId) -> bool {
        matches!(
            self.state(partition),
            Some(PartitionRebalanceState::HistoricalInProgress)
                | Some(PartitionRebalanceState::FullInProgress)
        )
    }

    fn exclude(&self, supplier: NodeId) {
        self.exclusions.lock().insert(supplier);
    }

    fn finish(&self, success: bool) -> bool {
        self.result.complete(Ok(success))
    }
}

#[derive(Default)]
struct PartitionWork {
    historical: Vec<HistoricalRecord>,
    rows: Vec<(Bytes, Row)>,
}

struct DemanderShared {
    node: NodeId,
    config: RebalanceConfig,
    transport: Arc<dyn RebalanceTransport>,
    metrics: Arc<RebalanceMetrics>,
    reassign: Option<ExchangeQueue>,
}

/// Starts and tracks rebalances of the local node.
pub struct Demander {
    shared: Arc<DemanderShared>,
    futures: DashMap<GroupId, Arc<RebalanceFuture>>,
}

impl Demander {
    /// `reassign` receives the reassignment tasks after historical failures.
    pub fn new(
        node: NodeId,
        config: RebalanceConfig,
        transport: Arc<dyn RebalanceTransport>,
        metrics: Arc<RebalanceMetrics>,
        reassign: Option<ExchangeQueue>,
    ) -> Self {
        Self {
            shared: Arc::new(DemanderShared {
                node,
                config,
                transport,
                metrics,
                reassign,
            }),
            futures: DashMap::new(),
        }
    }

    /// Current rebalance future of a group.
    pub fn future(&self, group: GroupId) -> Option<Arc<RebalanceFuture>> {
        self.futures.get(&group).map(|f| f.clone())
    }

    /// Start rebalancing `ctx` according to `plan`, cancelling the group's
    /// previous rebalance.
    pub fn start(
        &self,
        ctx: Arc<GroupContext>,
        exchange: ExchangeId,
        plan: RebalancePlan,
        exclusions: HashSet<NodeId>,
    ) -> Arc<RebalanceFuture> {
        let group = ctx.id();
        let partitions: Vec<PartitionId> = plan
            .demands
            .values()
            .flat_map(|d| d.partitions().collect::<Vec<_>>())
            .collect();
        let fut = Arc::new(RebalanceFuture::new(
            group,
            exchange,
            partitions.iter().copied(),
            exclusions,
        ));

        if let Some(previous) = self.futures.insert(group, fut.clone()) {
            if previous.cancel() {
                info!(
                    group,
                    rebalance = %previous.id(),
                    topology = %previous.topology(),
                    "Rebalance cancelled by a newer topology"
                );
            }
        }

        if plan.is_empty() {
            fut.finish(true);
            debug!(group, topology = %exchange.version, "Nothing to rebalance");
            return fut;
        }

        for &partition in &partitions {
            if let Err(e) = fut.transition(partition, PartitionRebalanceState::AwaitingSupplier) {
                fut.fail_partition(partition, e);
            }
        }

        self.shared.metrics.rebalances_started.inc();
        self.shared.metrics.in_flight.inc();
        info!(
            group,
            rebalance = %fut.id(),
            topology = %exchange.version,
            suppliers = ?plan.demands.keys().collect::<Vec<_>>(),
            partitions = partitions.len(),
            "Rebalance started"
        );

        let shared = self.shared.clone();
        let worker_fut = fut.clone();
        let spawned = thread::Builder::new()
            .name(format!("rebalance-g{}", group))
            .spawn(move || shared.run(worker_fut, ctx, plan));
        if let Err(e) = spawned {
            error!(group, error = %e, "Failed to start rebalance routine");
            self.shared.metrics.in_flight.dec();
            fut.finish(false);
        }
        fut
    }

    /// Cancel every running rebalance.
    pub fn stop(&self) {
        for entry in self.futures.iter() {
            entry.value().cancel();
        }
    }
}

impl DemanderShared {
    fn run(&self, fut: Arc<RebalanceFuture>, ctx: Arc<GroupContext>, plan: RebalancePlan) {
        thread::scope(|s| {
            for (&supplier, demand) in &plan.demands {
                let fut = &fut;
                let ctx = &ctx;
                let spawned = thread::Builder::new()
                    .name(format!("rebalance-g{}-n{}", plan.group, supplier))
                    .spawn_scoped(s, move || self.run_supplier(fut, ctx, supplier, demand));
                if let Err(e) = spawned {
                    let err = RebalanceError::Apply(format!("cannot start supplier routine: {}", e));
                    for partition in demand.partitions() {
                        fut.fail_partition(partition, err.clone());
                    }
                }
            }
        });

        let states = fut.states();
        let success = states.values().all(|s| *s == PartitionRebalanceState::Owning);
        let completed = fut.finish(success);
        self.metrics.in_flight.dec();

        if success && completed {
            self.metrics.rebalances_succeeded.inc();
            info!(group = plan.group, rebalance = %fut.id(), topology = %plan.topology, "Rebalance completed");
            return;
        }

        self.metrics.rebalances_cancelled.inc();
        if fut.is_cancelled() {
            debug!(group = plan.group, rebalance = %fut.id(), "Rebalance routine finished after cancel");
            return;
        }

        let cancelled: Vec<_> = states
            .iter()
            .filter(|(_, s)| **s != PartitionRebalanceState::Owning)
            .map(|(p, _)| *p)
            .collect();
        let exclusions = fut.exclusions();
        info!(
            group = plan.group,
            rebalance = %fut.id(),
            topology = %plan.topology,
            partitions = ?cancelled,
            exclusions = ?exclusions,
            "Rebalance finished with cancelled partitions"
        );

        if exclusions.is_empty() {
            return;
        }
        if let Some(queue) = &self.reassign {
            let mut historical_exclusions = HistoricalExclusions::new();
            historical_exclusions.insert(plan.group, exclusions);
            queue.submit(ExchangeTask::RebalanceReassign {
                exchange_id: fut.exchange_id(),
                historical_exclusions,
            });
        }
    }

    fn run_supplier(&self, fut: &RebalanceFuture, ctx: &GroupContext, supplier: NodeId, demand: &DemandMessage) {
        for &partition in demand.historical.keys() {
            if let Err(e) = fut.transition(partition, PartitionRebalanceState::HistoricalInProgress) {
                fut.fail_partition(partition, e);
            }
        }
        for &partition in &demand.full {
            let started = fut
                .transition(partition, PartitionRebalanceState::FullInProgress)
                .and_then(|_| {
                    ctx.clear_partition(partition)
                        .map_err(|e| RebalanceError::Apply(e.to_string()))
                });
            if let Err(e) = started {
                fut.fail_partition(partition, e);
            }
        }

        let mut backoff = ExponentialBackoffTimeout::new(
            self.config.total_timeout,
            self.config.initial_timeout,
            self.config.max_timeout,
        );
        loop {
            if fut.is_cancelled() {
                return;
            }
            let mut sink = |msg: SupplyMessage| {
                if fut.is_cancelled() {
                    return false;
                }
                self.apply_message(fut, ctx, supplier, msg);
                !fut.is_cancelled()
            };
            let err = match self.transport.demand(supplier, self.node, demand, &mut sink) {
                Ok(()) => break,
                Err(e) => e,
            };
            let retry = if err.is_transient() {
                backoff.next_timeout().map_err(|t| t.to_string())
            } else {
                Err(err.to_string())
            };
            match retry {
                Ok(delay) => {
                    warn!(
                        group = demand.group,
                        supplier,
                        error = %err,
                        retry_in = ?delay,
                        "Supplier request failed, retrying"
                    );
                    thread::sleep(delay);
                }
                Err(reason) => {
                    warn!(group = demand.group, supplier, error = %err, "Supplier unreachable");
                    let err = RebalanceError::SupplierUnreachable { supplier, reason };
                    for partition in demand.partitions() {
                        fut.fail_partition(partition, err.clone());
                    }
                    return;
                }
            }
        }

        for partition in demand.partitions() {
            if fut.is_in_progress(partition) {
                fut.fail_partition(
                    partition,
                    RebalanceError::Apply(format!(
                        "supplier {} finished without completing partition {}",
                        supplier, partition
                    )),
                );
            }
        }
    }

    fn apply_message(&self, fut: &RebalanceFuture, ctx: &GroupContext, supplier: NodeId, msg: SupplyMessage) {
        let mut work: BTreeMap<PartitionId, PartitionWork> = BTreeMap::new();
        for record in msg.historical {
            work.entry(record.partition()).or_default().historical.push(record);
        }
        for (partition, rows) in msg.full {
            work.entry(partition).or_default().rows = rows;
        }
        let work: VecDeque<(PartitionId, PartitionWork)> = work
            .into_iter()
            .filter(|(p, _)| fut.is_in_progress(*p))
            .collect();

        for (partition, err) in self.apply_parallel(ctx, work) {
            error!(group = msg.group, partition, supplier, error = %err, "Failed to apply supplied data");
            fut.fail_partition(partition, err);
        }

        for (partition, counter) in msg.last {
            self.finish_partition(fut, ctx, supplier, partition, counter);
        }
        for (partition, reason) in msg.failed_historical {
            self.historical_failed(fut, supplier, partition, &reason);
        }
        for partition in msg.missed {
            warn!(group = msg.group, partition, supplier, "Supplier does not have the partition");
            fut.fail_partition(
                partition,
                RebalanceError::Apply(format!("partition {} missed by supplier {}", partition, supplier)),
            );
        }
    }

    /// Apply per-partition work on up to `max_concurrent_partitions` workers.
    fn apply_parallel(
        &self,
        ctx: &GroupContext,
        work: VecDeque<(PartitionId, PartitionWork)>,
    ) -> Vec<(PartitionId, RebalanceError)> {
        let workers = self.config.max_concurrent_partitions.max(1).min(work.len());
        let queue = Mutex::new(work);
        let failures = Mutex::new(Vec::new());

        let worker = |index: usize| loop {
            let Some((partition, item)) = queue.lock().pop_front() else {
                break;
            };
            match Self::apply_partition(ctx, partition, item) {
                Ok(applied) => self.metrics.records_applied.add(index, applied),
                Err(e) => failures.lock().push((partition, e)),
            }
        };

        if workers <= 1 {
            worker(0);
        } else {
            thread::scope(|s| {
                for index in 0..workers {
                    let worker = &worker;
                    s.spawn(move || worker(index));
                }
            });
        }
        failures.into_inner()
    }

    fn apply_partition(ctx: &GroupContext, partition: PartitionId, work: PartitionWork) -> Result<u64, RebalanceError> {
        let apply_err = |e: crate::error::Error| RebalanceError::Apply(e.to_string());
        let mut applied = 0;
        for record in work.historical {
            match record {
                HistoricalRecord::Entry(entry) => {
                    ctx.apply_rebalanced(&entry).map_err(apply_err)?;
                }
                HistoricalRecord::Rollback { start, delta, .. } => {
                    ctx.apply_rollback(partition, CounterRange::new(start, delta))
                        .map_err(apply_err)?;
                }
            }
            applied += 1;
        }
        if !work.rows.is_empty() {
            applied += work.rows.len() as u64;
            ctx.apply_full_rows(partition, work.rows).map_err(apply_err)?;
        }
        Ok(applied)
    }

    /// The supplier sent everything for `partition`: own it if the counter
    /// caught up.
    fn finish_partition(
        &self,
        fut: &RebalanceFuture,
        ctx: &GroupContext,
        supplier: NodeId,
        partition: PartitionId,
        counter: u64,
    ) {
        let historical = match fut.state(partition) {
            Some(PartitionRebalanceState::HistoricalInProgress) => true,
            Some(PartitionRebalanceState::FullInProgress) => {
                if let Err(e) = ctx.finish_full(partition, counter) {
                    fut.fail_partition(partition, RebalanceError::Apply(e.to_string()));
                    return;
                }
                false
            }
            _ => return,
        };

        let actual = ctx.counter(partition);
        if actual < counter {
            let err = RebalanceError::CounterMismatch {
                partition,
                expected: counter,
                actual,
            };
            warn!(group = ctx.id(), partition, supplier, error = %err, "Partition counter did not catch up");
            if historical {
                self.historical_failed(fut, supplier, partition, "counter_mismatch");
            } else {
                fut.fail_partition(partition, err);
            }
            return;
        }

        let owned = fut
            .transition(partition, PartitionRebalanceState::Owning)
            .and_then(|_| {
                ctx.set_state(partition, PartitionState::Owning)
                    .map_err(|e| RebalanceError::Apply(e.to_string()))
            });
        match owned {
            Ok(()) => {
                self.metrics.partitions_owned.inc();
                debug!(group = ctx.id(), partition, supplier, counter = actual, historical, "Partition rebalanced");
            }
            Err(e) => fut.fail_partition(partition, e),
        }
    }

    fn historical_failed(&self, fut: &RebalanceFuture, supplier: NodeId, partition: PartitionId, reason: &str) {
        if fut.state(partition) != Some(PartitionRebalanceState::HistoricalInProgress) {
            return;
        }
        warn!(
            group = fut.group(),
            partition,
            supplier,
            reason,
            "Historical rebalance failed, partition will be rebalanced in full"
        );
        self.metrics.record_fallback(reason);
        fut.exclude(supplier);
        fut.fail_partition(
            partition,
            RebalanceError::HistoricalFailed {
                supplier,
                partitions: vec![partition],
                reason: reason.to_string(),
            },
        );
    }
}

impl std::fmt::Debug for Demander {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Demander")
            .field("node", &self.shared.node)
            .field("groups", &self.futures.len())
            .finish()
    }
}
