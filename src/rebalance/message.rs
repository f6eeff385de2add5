//! Demand and supply messages exchanged between demander and supplier.

use crate::partition::{PartitionState, Row};
use crate::types::{GroupId, NodeId, PartitionId, TopologyVersion};
use crate::wal::DataEntry;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// What a node publishes about one of its partitions during exchange.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartitionAdvert {
    pub state: PartitionState,
    /// Low-water mark of the update counter.
    pub counter: u64,
    /// Live rows.
    pub size: u64,
    /// Lowest counter the node can replay this partition from, if any.
    pub history_start: Option<u64>,
}

/// Partition map of one cache group on one node.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupAdvertisement {
    pub node: NodeId,
    pub group: GroupId,
    pub partitions: BTreeMap<PartitionId, PartitionAdvert>,
}

impl GroupAdvertisement {
    pub fn new(node: NodeId, group: GroupId) -> Self {
        Self {
            node,
            group,
            partitions: BTreeMap::new(),
        }
    }

    /// The partition if this node can supply it.
    pub fn supplier_advert(&self, partition: PartitionId) -> Option<&PartitionAdvert> {
        self.partitions
            .get(&partition)
            .filter(|a| matches!(a.state, PartitionState::Owning | PartitionState::Renting))
    }
}

/// Request for data of one cache group sent to one supplier.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DemandMessage {
    pub group: GroupId,
    pub topology: TopologyVersion,
    /// Partitions to send as full snapshots.
    pub full: BTreeSet<PartitionId>,
    /// Partitions to replay from the WAL, with the demander's counter. Only
    /// updates with a higher counter are sent.
    pub historical: BTreeMap<PartitionId, u64>,
}

impl DemandMessage {
    pub fn new(group: GroupId, topology: TopologyVersion) -> Self {
        Self {
            group,
            topology,
            full: BTreeSet::new(),
            historical: BTreeMap::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.full.is_empty() && self.historical.is_empty()
    }

    /// All demanded partitions.
    pub fn partitions(&self) -> impl Iterator<Item = PartitionId> + '_ {
        self.full.iter().copied().chain(self.historical.keys().copied())
    }
}

/// One replayed WAL record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum HistoricalRecord {
    Entry(DataEntry),
    /// Counters `(start, start + delta]` that will never carry data.
    Rollback {
        partition: PartitionId,
        start: u64,
        delta: u64,
    },
}

impl HistoricalRecord {
    pub fn partition(&self) -> PartitionId {
        match self {
            HistoricalRecord::Entry(e) => e.partition,
            HistoricalRecord::Rollback { partition, .. } => *partition,
        }
    }
}

/// A batch of data from a supplier.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SupplyMessage {
    pub group: GroupId,
    pub topology: TopologyVersion,
    pub supplier: NodeId,
    /// Replayed records in log order.
    pub historical: Vec<HistoricalRecord>,
    /// Snapshot rows per partition.
    pub full: BTreeMap<PartitionId, Vec<(Bytes, Row)>>,
    /// Partitions finished with this message, with the counter the
    /// demander must have reached once everything is applied.
    pub last: BTreeMap<PartitionId, u64>,
    /// Historical partitions the supplier could not serve, with the reason.
    pub failed_historical: BTreeMap<PartitionId, String>,
    /// Partitions the supplier does not have.
    pub missed: BTreeSet<PartitionId>,
}

impl SupplyMessage {
    pub fn new(group: GroupId, topology: TopologyVersion, supplier: NodeId) -> Self {
        Self {
            group,
            topology,
            supplier,
            historical: Vec::new(),
            full: BTreeMap::new(),
            last: BTreeMap::new(),
            failed_historical: BTreeMap::new(),
            missed: BTreeSet::new(),
        }
    }

    /// Number of records and rows carried.
    pub fn record_count(&self) -> usize {
        self.historical.len() + self.full.values().map(Vec::len).sum::<usize>()
    }

    pub fn is_empty(&self) -> bool {
        self.record_count() == 0
            && self.last.is_empty()
            && self.failed_historical.is_empty()
            && self.missed.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_supplier_advert_requires_data_state() {
        let mut advert = GroupAdvertisement::new(1, 1);
        for (p, state) in [
            (0, PartitionState::Owning),
            (1, PartitionState::Moving),
            (2, PartitionState::Renting),
        ] {
            advert.partitions.insert(
                p,
                PartitionAdvert {
                    state,
                    counter: 5,
                    size: 5,
                    history_start: None,
                },
            );
        }
        assert!(advert.supplier_advert(0).is_some());
        assert!(advert.supplier_advert(1).is_none());
        assert!(advert.supplier_advert(2).is_some());
        assert!(advert.supplier_advert(3).is_none());
    }

    #[test]
    fn test_supply_record_count() {
        let mut msg = SupplyMessage::new(1, TopologyVersion::new(1, 0), 2);
        assert!(msg.is_empty());
        msg.historical
            .push(HistoricalRecord::Entry(DataEntry::put(1, 0, "k", "v", 1, 1)));
        msg.full.insert(
            1,
            vec![(
                Bytes::from("a"),
                Row {
                    value: Some(Bytes::from("b")),
                    version: 3,
                },
            )],
        );
        assert_eq!(msg.record_count(), 2);
        assert!(!msg.is_empty());
    }

    #[test]
    fn test_demand_partitions() {
        let mut demand = DemandMessage::new(1, TopologyVersion::new(2, 0));
        demand.full.insert(3);
        demand.historical.insert(1, 10);
        let mut parts: Vec<_> = demand.partitions().collect();
        parts.sort_unstable();
        assert_eq!(parts, vec![1, 3]);
    }
}
