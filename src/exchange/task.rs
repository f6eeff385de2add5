//! Tasks processed by the exchange worker.

use crate::error::ExchangeError;
use crate::future::CompletionFuture;
use crate::types::{ExchangeId, GroupId, NodeId, TopologyVersion};
use std::collections::{HashMap, HashSet};
use std::fmt;

/// Completes with the topology version the exchange produced. For merged
/// exchanges that is the version of the last merged task.
pub type ExchangeFuture = CompletionFuture<TopologyVersion, ExchangeError>;

/// Nodes that must not be picked as historical suppliers, per cache group.
pub type HistoricalExclusions = HashMap<GroupId, HashSet<NodeId>>;

/// One unit of work for the exchange worker.
pub enum ExchangeTask {
    /// A membership change: recompute affinity and rebalance.
    Topology {
        id: ExchangeId,
        nodes: Vec<NodeId>,
        future: ExchangeFuture,
    },
    /// Re-plan the rebalance of `exchange_id` without recomputing affinity,
    /// after historical supply failed on some suppliers.
    RebalanceReassign {
        exchange_id: ExchangeId,
        historical_exclusions: HistoricalExclusions,
    },
}

impl ExchangeTask {
    pub fn topology(id: ExchangeId, nodes: Vec<NodeId>) -> (Self, ExchangeFuture) {
        let future = ExchangeFuture::new();
        (
            ExchangeTask::Topology {
                id,
                nodes,
                future: future.clone(),
            },
            future,
        )
    }

    pub fn exchange_id(&self) -> ExchangeId {
        match self {
            ExchangeTask::Topology { id, .. } => *id,
            ExchangeTask::RebalanceReassign { exchange_id, .. } => *exchange_id,
        }
    }

    /// A reassign must run against the exact exchange it was created for, so
    /// it is never folded into a merged exchange.
    pub fn skip_for_exchange_merge(&self) -> bool {
        matches!(self, ExchangeTask::RebalanceReassign { .. })
    }

    /// Fail the task's future, if it has one.
    pub(crate) fn fail(self, err: ExchangeError) {
        if let ExchangeTask::Topology { future, .. } = self {
            future.complete(Err(err));
        }
    }
}

impl fmt::Debug for ExchangeTask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExchangeTask::Topology { id, nodes, .. } => f
                .debug_struct("Topology")
                .field("id", id)
                .field("nodes", nodes)
                .finish(),
            ExchangeTask::RebalanceReassign {
                exchange_id,
                historical_exclusions,
            } => f
                .debug_struct("RebalanceReassign")
                .field("exchange_id", exchange_id)
                .field("historical_exclusions", historical_exclusions)
                .finish(),
        }
    }
}
