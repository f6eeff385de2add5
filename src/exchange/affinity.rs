//! Partition-to-node assignment.
//!
//! Rendezvous (highest random weight) hashing: every node gets a weight per
//! partition and the `backups + 1` heaviest nodes own it, the heaviest being
//! the primary. A node joining or leaving only moves the partitions whose top
//! owners change.

use crate::types::{NodeId, PartitionId, TopologyVersion};
use std::hash::Hasher;
use twox_hash::XxHash64;

/// Owners of every partition of one cache group at one topology version.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AffinityAssignment {
    version: TopologyVersion,
    /// Sorted node set the assignment was computed for.
    nodes: Vec<NodeId>,
    /// Owners per partition, primary first.
    owners: Vec<Vec<NodeId>>,
}

impl AffinityAssignment {
    /// Assign `partitions` partitions to `backups + 1` owners each.
    pub fn compute(
        version: TopologyVersion,
        nodes: &[NodeId],
        partitions: PartitionId,
        backups: usize,
    ) -> Self {
        let mut nodes = nodes.to_vec();
        nodes.sort_unstable();
        nodes.dedup();

        let copies = (backups + 1).min(nodes.len());
        let owners = (0..partitions)
            .map(|p| {
                let mut weighted: Vec<(u64, NodeId)> =
                    nodes.iter().map(|&n| (Self::weight(n, p), n)).collect();
                // Heaviest first; equal weights fall back to the lower node id.
                weighted.sort_unstable_by(|a, b| b.0.cmp(&a.0).then(a.1.cmp(&b.1)));
                weighted.into_iter().take(copies).map(|(_, n)| n).collect()
            })
            .collect();

        Self {
            version,
            nodes,
            owners,
        }
    }

    fn weight(node: NodeId, partition: PartitionId) -> u64 {
        let mut hasher = XxHash64::with_seed(0);
        hasher.write_u64(node);
        hasher.write_u16(partition);
        hasher.finish()
    }

    pub fn version(&self) -> TopologyVersion {
        self.version
    }

    pub fn nodes(&self) -> &[NodeId] {
        &self.nodes
    }

    pub fn partitions(&self) -> PartitionId {
        self.owners.len() as PartitionId
    }

    /// Primary owner of a partition.
    pub fn primary(&self, partition: PartitionId) -> Option<NodeId> {
        self.owners(partition).first().copied()
    }

    /// All owners of a partition, primary first.
    pub fn owners(&self, partition: PartitionId) -> &[NodeId] {
        self.owners
            .get(partition as usize)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    pub fn is_owner(&self, node: NodeId, partition: PartitionId) -> bool {
        self.owners(partition).contains(&node)
    }

    /// Partitions owned by `node` as primary or backup.
    pub fn partitions_of(&self, node: NodeId) -> Vec<PartitionId> {
        self.owners
            .iter()
            .enumerate()
            .filter(|(_, owners)| owners.contains(&node))
            .map(|(p, _)| p as PartitionId)
            .collect()
    }
}
