//! Chooses a supplier and a transfer mode for every partition that needs data.
//!
//! For each partition assigned to the local node, the candidates are the other
//! nodes that advertise it as `Owning` or `Renting`. Only candidates at the
//! highest advertised counter can bring the partition up to date. Among them,
//! a node qualifies for a historical (WAL) transfer when its retained history
//! starts at or below the local counter. Everything else is transferred in full.

use crate::metrics::RebalanceMetrics;
use crate::partition::PartitionState;
use crate::rebalance::message::{DemandMessage, GroupAdvertisement, PartitionAdvert};
use crate::types::{GroupId, NodeId, PartitionId, TopologyVersion};
use rand::seq::IndexedRandom;
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use tracing::{debug, warn};

/// Local view of an assigned partition at planning time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LocalPartitionInfo {
    pub state: PartitionState,
    pub counter: u64,
    /// The partition held data before this exchange. Only such partitions
    /// can be caught up from history.
    pub existing: bool,
}

/// Why a partition with local data is transferred in full.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FullReason {
    /// No up-to-date supplier retains history back to the local counter.
    HistoryUnavailable,
    /// Every supplier with enough history is excluded after a failure.
    SuppliersExcluded,
    /// The partition is below the historical size threshold.
    BelowThreshold,
    /// The local counter is ahead of every supplier.
    CounterAhead,
}

/// Per-supplier demands for one cache group.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RebalancePlan {
    pub group: GroupId,
    pub topology: TopologyVersion,
    pub demands: BTreeMap<NodeId, DemandMessage>,
    /// Assigned partitions that need no data and can be owned right away.
    pub owning: Vec<PartitionId>,
}

impl RebalancePlan {
    pub fn is_empty(&self) -> bool {
        self.demands.is_empty()
    }

    /// Supplier chosen for `partition`, with `true` for historical.
    pub fn supplier_of(&self, partition: PartitionId) -> Option<(NodeId, bool)> {
        self.demands.iter().find_map(|(node, demand)| {
            if demand.historical.contains_key(&partition) {
                Some((*node, true))
            } else if demand.full.contains(&partition) {
                Some((*node, false))
            } else {
                None
            }
        })
    }
}

/// Builds a [`RebalancePlan`] from the exchanged advertisements.
pub struct RebalancePlanner {
    local_node: NodeId,
    historical_threshold: u64,
    metrics: Arc<RebalanceMetrics>,
}

impl RebalancePlanner {
    pub fn new(local_node: NodeId, historical_threshold: u64, metrics: Arc<RebalanceMetrics>) -> Self {
        Self {
            local_node,
            historical_threshold,
            metrics,
        }
    }

    /// Plan the rebalance of `group`.
    ///
    /// `exclusions` are nodes that already failed a historical supply for this
    /// exchange. They may still supply full partitions.
    pub fn plan(
        &self,
        group: GroupId,
        topology: TopologyVersion,
        local: &BTreeMap<PartitionId, LocalPartitionInfo>,
        adverts: &[GroupAdvertisement],
        exclusions: &HashSet<NodeId>,
    ) -> RebalancePlan {
        let mut plan = RebalancePlan {
            group,
            topology,
            demands: BTreeMap::new(),
            owning: Vec::new(),
        };

        for (&partition, info) in local {
            let candidates: Vec<(NodeId, &PartitionAdvert)> = adverts
                .iter()
                .filter(|a| a.node != self.local_node && a.group == group)
                .filter_map(|a| a.supplier_advert(partition).map(|p| (a.node, p)))
                .collect();

            let Some(max) = candidates.iter().map(|(_, a)| a.counter).max() else {
                // Nobody else has the data: whatever is local is all there is.
                plan.owning.push(partition);
                continue;
            };
            if info.counter >= max && (info.state == PartitionState::Owning || max == 0) {
                plan.owning.push(partition);
                continue;
            }

            let latest: Vec<(NodeId, &PartitionAdvert)> = candidates
                .iter()
                .filter(|(_, a)| a.counter == max)
                .copied()
                .collect();

            match self.historical_supplier(info, &latest, exclusions) {
                Ok(supplier) => {
                    plan.demands
                        .entry(supplier)
                        .or_insert_with(|| DemandMessage::new(group, topology))
                        .historical
                        .insert(partition, info.counter);
                    debug!(group, partition, supplier, from = info.counter, "Historical supplier selected");
                }
                Err(reason) => {
                    let Some(&(supplier, _)) = latest.choose(&mut rand::rng()) else {
                        plan.owning.push(partition);
                        continue;
                    };
                    if info.existing && info.counter > 0 {
                        warn!(
                            group,
                            partition,
                            supplier,
                            counter = info.counter,
                            supplier_counter = max,
                            reason = ?reason,
                            "Historical rebalance not possible, falling back to full"
                        );
                    }
                    plan.demands
                        .entry(supplier)
                        .or_insert_with(|| DemandMessage::new(group, topology))
                        .full
                        .insert(partition);
                }
            }
        }

        for demand in plan.demands.values() {
            if !demand.historical.is_empty() {
                self.metrics.record_demand(true);
            }
            if !demand.full.is_empty() {
                self.metrics.record_demand(false);
            }
        }
        plan
    }

    /// Pick the historical supplier among the most up-to-date candidates:
    /// the one with the shortest history that still reaches the local
    /// counter, then the lowest node id.
    fn historical_supplier(
        &self,
        info: &LocalPartitionInfo,
        latest: &[(NodeId, &PartitionAdvert)],
        exclusions: &HashSet<NodeId>,
    ) -> Result<NodeId, FullReason> {
        if !info.existing {
            return Err(FullReason::HistoryUnavailable);
        }
        let Some(size) = latest.iter().map(|(_, a)| a.size).max() else {
            return Err(FullReason::HistoryUnavailable);
        };
        if latest.iter().all(|(_, a)| a.counter < info.counter) {
            return Err(FullReason::CounterAhead);
        }
        if size < self.historical_threshold {
            return Err(FullReason::BelowThreshold);
        }

        let covering: Vec<(NodeId, u64)> = latest
            .iter()
            .filter_map(|(node, a)| match a.history_start {
                Some(start) if start <= info.counter => Some((*node, start)),
                _ => None,
            })
            .collect();
        if covering.is_empty() {
            return Err(FullReason::HistoryUnavailable);
        }

        covering
            .iter()
            .filter(|(node, _)| !exclusions.contains(node))
            .max_by(|a, b| a.1.cmp(&b.1).then(b.0.cmp(&a.0)))
            .map(|(node, _)| *node)
            .ok_or(FullReason::SuppliersExcluded)
    }
}
