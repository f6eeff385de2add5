//! Core identifiers shared by the log, the counters and the rebalance protocol.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Node identifier in the cluster.
pub type NodeId = u64;

/// Cache group identifier. Partitions and their counters are scoped by group.
pub type GroupId = u32;

/// Partition number within a cache group.
pub type PartitionId = u16;

/// A `(group, partition)` pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct GroupPartition {
    pub group: GroupId,
    pub partition: PartitionId,
}

impl GroupPartition {
    pub fn new(group: GroupId, partition: PartitionId) -> Self {
        Self { group, partition }
    }
}

impl fmt::Display for GroupPartition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "g{}-p{}", self.group, self.partition)
    }
}

/// Cluster topology version.
///
/// The major version advances on membership changes, the minor version on
/// changes that keep the node set (for example a rebalance reassignment).
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
pub struct TopologyVersion {
    pub major: u64,
    pub minor: u32,
}

impl TopologyVersion {
    /// Version that precedes every real topology.
    pub const NONE: TopologyVersion = TopologyVersion { major: 0, minor: 0 };

    pub fn new(major: u64, minor: u32) -> Self {
        Self { major, minor }
    }

    /// Next membership change.
    pub fn next_major(&self) -> Self {
        Self {
            major: self.major + 1,
            minor: 0,
        }
    }

    /// Next change within the same node set.
    pub fn next_minor(&self) -> Self {
        Self {
            major: self.major,
            minor: self.minor + 1,
        }
    }
}

impl fmt::Display for TopologyVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {}]", self.major, self.minor)
    }
}

/// The membership event that started an exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TopologyEvent {
    /// A node joined the cluster.
    NodeJoined(NodeId),
    /// A node left gracefully.
    NodeLeft(NodeId),
    /// A node was detected as failed.
    NodeFailed(NodeId),
    /// Cluster activation (first exchange on a fresh cluster).
    Activated,
}

impl TopologyEvent {
    /// Whether the event removed a node from the topology.
    pub fn is_departure(&self) -> bool {
        matches!(self, TopologyEvent::NodeLeft(_) | TopologyEvent::NodeFailed(_))
    }
}

/// Identity of one exchange: the topology version it produces and the event behind it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ExchangeId {
    pub version: TopologyVersion,
    pub event: TopologyEvent,
}

impl ExchangeId {
    pub fn new(version: TopologyVersion, event: TopologyEvent) -> Self {
        Self { version, event }
    }
}

impl fmt::Display for ExchangeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "exchange{} {:?}", self.version, self.event)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_topology_version_ordering() {
        let v1 = TopologyVersion::new(1, 0);
        let v1_1 = v1.next_minor();
        let v2 = v1_1.next_major();

        assert!(v1 < v1_1);
        assert!(v1_1 < v2);
        assert_eq!(v2, TopologyVersion::new(2, 0));
        assert!(TopologyVersion::NONE < v1);
    }

    #[test]
    fn test_departure_events() {
        assert!(TopologyEvent::NodeLeft(1).is_departure());
        assert!(TopologyEvent::NodeFailed(1).is_departure());
        assert!(!TopologyEvent::NodeJoined(1).is_departure());
        assert!(!TopologyEvent::Activated.is_departure());
    }

    #[test]
    fn test_group_partition_display() {
        assert_eq!(GroupPartition::new(3, 17).to_string(), "g3-p17");
    }
}
