//! In-process cluster of [`Node`]s sharing one [`LocalTransport`].

use crate::config::{CacheGroupConfig, NodeConfig};
use crate::error::{Error, ExchangeError, Result};
use crate::node::Node;
use crate::partition::{partition_for_key, PartitionHash, PartitionState};
use crate::rebalance::{LocalTransport, RebalanceFuture};
use crate::testing::failpoint::FailpointRegistry;
use crate::types::{GroupId, GroupPartition, NodeId, PartitionId, TopologyEvent, TopologyVersion};
use crate::wal::DataEntry;
use bytes::Bytes;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, info};

/// Nodes whose idle-verify records disagree, per partition.
pub type IdleVerifyConflicts = BTreeMap<PartitionId, Vec<(NodeId, PartitionHash)>>;

const EXCHANGE_TIMEOUT: Duration = Duration::from_secs(30);

/// Starts, stops and drives nodes in one process.
///
/// Client writes go to the first `Owning` owner of the key's partition and
/// are replicated to the other owners, the way a primary would.
pub struct TestCluster {
    root: PathBuf,
    groups: Vec<CacheGroupConfig>,
    template: NodeConfig,
    transport: Arc<LocalTransport>,
    nodes: BTreeMap<NodeId, Node>,
    failpoints: BTreeMap<NodeId, Arc<FailpointRegistry>>,
    version: TopologyVersion,
}

impl TestCluster {
    /// `root` holds one work directory per node.
    pub fn new(root: impl Into<PathBuf>, groups: Vec<CacheGroupConfig>) -> Self {
        Self {
            root: root.into(),
            groups,
            template: NodeConfig::default(),
            transport: Arc::new(LocalTransport::new()),
            nodes: BTreeMap::new(),
            failpoints: BTreeMap::new(),
            version: TopologyVersion::NONE,
        }
    }

    /// Base config for every node. Id, consistent id and work dir are
    /// filled in per node.
    pub fn with_node_config(mut self, template: NodeConfig) -> Self {
        self.template = template;
        self
    }

    pub fn transport(&self) -> &Arc<LocalTransport> {
        &self.transport
    }

    pub fn version(&self) -> TopologyVersion {
        self.version
    }

    pub fn node(&self, id: NodeId) -> Option<&Node> {
        self.nodes.get(&id)
    }

    /// Ids of the running nodes.
    pub fn node_ids(&self) -> Vec<NodeId> {
        self.nodes.keys().copied().collect()
    }

    /// Failpoints of `id`. They survive restarts of the node.
    pub fn failpoints(&mut self, id: NodeId) -> Arc<FailpointRegistry> {
        self.failpoints
            .entry(id)
            .or_insert_with(|| Arc::new(FailpointRegistry::new()))
            .clone()
    }

    fn config_for(&self, id: NodeId) -> NodeConfig {
        let mut config = self.template.clone();
        config.node_id = id;
        config.consistent_id = format!("node-{}", id);
        config.work_dir = self.root.clone();
        config
    }

    fn launch(&mut self, id: NodeId) -> Result<()> {
        let failpoints = self.failpoints(id);
        let node = Node::start(
            self.config_for(id),
            self.groups.clone(),
            self.transport.clone(),
            Some(failpoints),
        )?;
        self.nodes.insert(id, node);
        Ok(())
    }

    /// Start `ids` and run the activation exchange on all of them.
    pub fn activate(&mut self, ids: &[NodeId]) -> Result<TopologyVersion> {
        for &id in ids {
            self.launch(id)?;
        }
        self.exchange(TopologyEvent::Activated)
    }

    /// Start (or restart) a node and let it join.
    pub fn start_node(&mut self, id: NodeId) -> Result<TopologyVersion> {
        self.launch(id)?;
        self.exchange(TopologyEvent::NodeJoined(id))
    }

    /// Stop a node gracefully and let the others rebalance without it.
    pub fn stop_node(&mut self, id: NodeId) -> Result<TopologyVersion> {
        self.shutdown(id);
        self.exchange(TopologyEvent::NodeLeft(id))
    }

    /// Stop a node without a graceful leave.
    pub fn fail_node(&mut self, id: NodeId) -> Result<TopologyVersion> {
        self.shutdown(id);
        self.exchange(TopologyEvent::NodeFailed(id))
    }

    fn shutdown(&mut self, id: NodeId) {
        if let Some(node) = self.nodes.remove(&id) {
            node.stop();
            info!(node = id, "Test node stopped");
        }
    }

    /// Run one exchange on every running node and wait for all of them.
    pub fn exchange(&mut self, event: TopologyEvent) -> Result<TopologyVersion> {
        let version = self.version.next_major();
        let ids = self.node_ids();
        let futures: Vec<_> = self
            .nodes
            .values()
            .map(|n| n.on_topology_change(version, ids.clone(), event))
            .collect();
        for future in futures {
            match future.wait(EXCHANGE_TIMEOUT) {
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    return Err(Error::Exchange(ExchangeError::Failed {
                        version: version.to_string(),
                        reason: e.to_string(),
                    }))
                }
                None => {
                    return Err(Error::Exchange(ExchangeError::Failed {
                        version: version.to_string(),
                        reason: "timed out".to_string(),
                    }))
                }
            }
        }
        self.version = version;
        debug!(%version, nodes = ?ids, ?event, "Test exchange finished");
        Ok(version)
    }

    /// Running node that serves writes to `partition` of `group`.
    pub fn primary(&self, group: GroupId, partition: PartitionId) -> Option<NodeId> {
        let assignment = self.nodes.values().find_map(|n| n.assignment(group))?;
        assignment.owners(partition).iter().copied().find(|id| {
            self.nodes.get(id).and_then(|n| n.group(group)).and_then(|g| g.state(partition))
                == Some(PartitionState::Owning)
        })
    }

    fn partition_of(&self, group: GroupId, key: &[u8]) -> Result<PartitionId> {
        let cfg = self
            .groups
            .iter()
            .find(|g| g.id == group)
            .ok_or(Error::GroupNotFound(group))?;
        Ok(partition_for_key(key, cfg.partitions))
    }

    fn write(&self, group: GroupId, key: Bytes, value: Option<Bytes>) -> Result<DataEntry> {
        let partition = self.partition_of(group, &key)?;
        let primary = self
            .primary(group, partition)
            .and_then(|id| self.nodes.get(&id))
            .ok_or(Error::PartitionNotLocal(GroupPartition::new(group, partition)))?;
        let entry = match value {
            Some(value) => primary.put(group, key, value)?,
            None => primary.remove(group, key)?,
        };
        for (id, node) in &self.nodes {
            if *id != primary.id() {
                node.apply_replicated(&entry)?;
            }
        }
        Ok(entry)
    }

    pub fn put(&self, group: GroupId, key: impl Into<Bytes>, value: impl Into<Bytes>) -> Result<DataEntry> {
        self.write(group, key.into(), Some(value.into()))
    }

    pub fn remove(&self, group: GroupId, key: impl Into<Bytes>) -> Result<DataEntry> {
        self.write(group, key.into(), None)
    }

    /// Read from the primary.
    pub fn get(&self, group: GroupId, key: &[u8]) -> Option<Bytes> {
        let partition = self.partition_of(group, key).ok()?;
        let primary = self.primary(group, partition)?;
        self.nodes.get(&primary)?.get(group, key)
    }

    /// Checkpoint every running node.
    pub fn checkpoint_all(&self) -> Result<()> {
        for node in self.nodes.values() {
            node.checkpoint()?;
        }
        Ok(())
    }

    /// Current rebalance of `group` on `node`.
    pub fn rebalance_future(&self, node: NodeId, group: GroupId) -> Option<Arc<RebalanceFuture>> {
        self.nodes.get(&node)?.rebalance_future(group)
    }

    /// Wait until the latest rebalance of `group` on every node finished
    /// successfully. A failed rebalance counts only if no reassignment
    /// replaces it before the deadline.
    pub fn await_rebalance(&self, group: GroupId, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        self.nodes
            .values()
            .all(|node| Self::await_node(node, group, deadline))
    }

    fn await_node(node: &Node, group: GroupId, deadline: Instant) -> bool {
        loop {
            let Some(fut) = node.rebalance_future(group) else {
                return true;
            };
            let remaining = deadline.saturating_duration_since(Instant::now());
            let Some(success) = fut.wait(remaining) else {
                return false;
            };
            let replaced = |n: &Node| n.rebalance_future(group).is_some_and(|f| f.id() != fut.id());
            if success && !replaced(node) {
                return true;
            }
            while !replaced(node) {
                if Instant::now() >= deadline {
                    return false;
                }
                thread::sleep(Duration::from_millis(10));
            }
        }
    }

    /// Compare idle-verify records of every partition across the nodes that
    /// own it. Empty when consistent.
    pub fn idle_verify(&self, group: GroupId) -> IdleVerifyConflicts {
        let mut by_partition: IdleVerifyConflicts = BTreeMap::new();
        for (id, node) in &self.nodes {
            for (partition, hash) in node.partition_hashes(group) {
                by_partition.entry(partition).or_default().push((*id, hash));
            }
        }
        by_partition.retain(|_, hashes| hashes.windows(2).any(|w| w[0].1 != w[1].1));
        by_partition
    }

    /// Stop every node.
    pub fn stop_all(&mut self) {
        let ids = self.node_ids();
        for id in ids {
            self.shutdown(id);
        }
    }
}

impl Drop for TestCluster {
    fn drop(&mut self) {
        self.stop_all();
    }
}

impl std::fmt::Debug for TestCluster {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TestCluster")
            .field("root", &self.root)
            .field("nodes", &self.node_ids())
            .field("version", &self.version)
            .finish()
    }
}
