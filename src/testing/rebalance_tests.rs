//! Multi-node rebalance scenarios over [`TestCluster`].

use crate::config::{CacheGroupConfig, CheckpointConfig, NodeConfig, RebalanceConfig};
use crate::counters::CounterRange;
use crate::rebalance::{DemandMessage, HistoricalRecord, RebalanceTransport};
use crate::testing::cluster::TestCluster;
use crate::testing::failpoint::{names, FailpointAction};
use crate::types::{GroupId, GroupPartition, PartitionId};
use std::collections::{BTreeMap, HashSet};
use std::path::Path;
use std::time::Duration;
use tempfile::tempdir;

const GROUP: GroupId = 1;
const PARTITIONS: PartitionId = 8;
const TIMEOUT: Duration = Duration::from_secs(30);

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn cluster(root: &Path, backups: usize, history_size: usize) -> TestCluster {
    init_tracing();
    let groups = vec![CacheGroupConfig::new(GROUP, "default")
        .with_partitions(PARTITIONS)
        .with_backups(backups)];
    let template = NodeConfig::default()
        .with_checkpoint_config(CheckpointConfig::default().with_history_size(history_size))
        .with_rebalance_config(RebalanceConfig::default().with_batch_size(16));
    TestCluster::new(root, groups).with_node_config(template)
}

fn load(cluster: &TestCluster, prefix: &str, count: usize) {
    for i in 0..count {
        cluster
            .put(GROUP, format!("{}{}", prefix, i), format!("{}-value-{}", prefix, i))
            .unwrap();
    }
}

fn assert_consistent(cluster: &TestCluster) {
    let conflicts = cluster.idle_verify(GROUP);
    assert!(conflicts.is_empty(), "idle verify found conflicts: {:?}", conflicts);
}

#[test]
fn test_historical_rebalance_after_restart() {
    let dir = tempdir().unwrap();
    let mut cluster = cluster(dir.path(), 1, 8);
    cluster.activate(&[1, 2]).unwrap();
    assert!(cluster.await_rebalance(GROUP, TIMEOUT));

    load(&cluster, "a", 50);
    cluster.checkpoint_all().unwrap();
    cluster.stop_node(2).unwrap();

    load(&cluster, "b", 100);
    cluster.remove(GROUP, "a3").unwrap();
    cluster.transport().clear_demands();

    cluster.start_node(2).unwrap();
    assert!(cluster.await_rebalance(GROUP, TIMEOUT));

    let demands = cluster.transport().demands();
    assert!(!demands.is_empty());
    for record in &demands {
        assert_eq!((record.supplier, record.demander), (1, 2));
        assert!(record.demand.full.is_empty());
        assert!(!record.demand.historical.is_empty());
    }

    let metrics = cluster.node(2).unwrap().metrics().rebalance;
    assert_eq!(metrics.full_demands, 0);
    assert!(metrics.historical_demands > 0);
    assert_eq!(metrics.historical_fallbacks, 0);

    assert_consistent(&cluster);
    assert_eq!(cluster.node(2).unwrap().get(GROUP, b"a3"), None);
    assert!(cluster.node(2).unwrap().get(GROUP, b"b99").is_some());
}

#[test]
fn test_historical_failure_reassigns_to_other_supplier() {
    let dir = tempdir().unwrap();
    let mut cluster = cluster(dir.path(), 2, 8);
    cluster.activate(&[1, 2, 3]).unwrap();
    assert!(cluster.await_rebalance(GROUP, TIMEOUT));

    load(&cluster, "a", 50);
    cluster.checkpoint_all().unwrap();
    cluster.stop_node(3).unwrap();
    load(&cluster, "b", 100);

    // Both suppliers hold the same history, node 1 wins the tie.
    cluster
        .failpoints(1)
        .enable(names::WAL_ITERATOR_READ, FailpointAction::ErrorAfter(5));
    cluster.transport().clear_demands();
    cluster.start_node(3).unwrap();

    // The first rebalance fails and is replaced by a reassignment that
    // keeps node 1 out of historical supply.
    assert!(cluster.await_rebalance(GROUP, TIMEOUT));
    let fut = cluster.rebalance_future(3, GROUP).unwrap();
    assert!(fut.get());
    assert_eq!(fut.exclusions(), HashSet::from([1]));
    assert!(fut.errors().is_empty());

    let suppliers: Vec<_> = cluster
        .transport()
        .demands()
        .iter()
        .filter(|d| d.demander == 3)
        .map(|d| (d.supplier, d.demand.full.is_empty()))
        .collect();
    assert_eq!(suppliers, vec![(1, true), (2, true)]);

    let metrics = cluster.node(3).unwrap().metrics().rebalance;
    assert_eq!(metrics.rebalances_started, 2);
    assert_eq!(metrics.rebalances_succeeded, 1);
    assert_eq!(metrics.rebalances_cancelled, 1);
    assert_eq!(metrics.full_demands, 0);
    assert_eq!(metrics.historical_demands, 2);
    assert!(metrics.historical_fallbacks > 0);
    assert_consistent(&cluster);
}

#[test]
fn test_full_rebalance_after_wal_disabled() {
    let dir = tempdir().unwrap();
    let mut cluster = cluster(dir.path(), 1, 8);
    cluster.activate(&[1, 2]).unwrap();
    assert!(cluster.await_rebalance(GROUP, TIMEOUT));

    load(&cluster, "a", 50);
    cluster.checkpoint_all().unwrap();
    cluster.stop_node(2).unwrap();

    let node1 = cluster.node(1).unwrap();
    node1.disable_wal(GROUP).unwrap();
    load(&cluster, "b", 100);
    cluster.node(1).unwrap().enable_wal(GROUP).unwrap();

    cluster.start_node(2).unwrap();
    assert!(cluster.await_rebalance(GROUP, TIMEOUT));

    let metrics = cluster.node(2).unwrap().metrics().rebalance;
    assert_eq!(metrics.historical_demands, 0);
    assert!(metrics.full_demands > 0);
    assert_consistent(&cluster);
    assert!(cluster.node(2).unwrap().get(GROUP, b"b42").is_some());
}

#[test]
fn test_full_rebalance_after_wal_disabled_and_supplier_restart() {
    let dir = tempdir().unwrap();
    let mut cluster = cluster(dir.path(), 1, 8);
    cluster.activate(&[1, 2]).unwrap();
    assert!(cluster.await_rebalance(GROUP, TIMEOUT));

    load(&cluster, "a", 50);
    cluster.checkpoint_all().unwrap();
    cluster.stop_node(2).unwrap();

    cluster.node(1).unwrap().disable_wal(GROUP).unwrap();
    load(&cluster, "b", 100);
    cluster.node(1).unwrap().enable_wal(GROUP).unwrap();

    let earliest: Vec<Option<u64>> = (0..PARTITIONS)
        .map(|p| cluster.node(1).unwrap().history().earliest_counter(GroupPartition::new(GROUP, p)))
        .collect();

    cluster.stop_node(1).unwrap();
    cluster.start_node(1).unwrap();
    assert!(cluster.await_rebalance(GROUP, TIMEOUT));

    let node1 = cluster.node(1).unwrap();
    assert!(node1.group(GROUP).unwrap().wal_enabled());
    let restored: Vec<Option<u64>> = (0..PARTITIONS)
        .map(|p| node1.history().earliest_counter(GroupPartition::new(GROUP, p)))
        .collect();
    assert_eq!(restored, earliest);

    cluster.start_node(2).unwrap();
    assert!(cluster.await_rebalance(GROUP, TIMEOUT));

    let metrics = cluster.node(2).unwrap().metrics().rebalance;
    assert_eq!(metrics.historical_demands, 0);
    assert!(metrics.full_demands > 0);
    assert_consistent(&cluster);
    assert!(cluster.node(2).unwrap().get(GROUP, b"b42").is_some());
}

#[test]
fn test_full_rebalance_when_history_truncated() {
    let dir = tempdir().unwrap();
    let mut cluster = cluster(dir.path(), 1, 1);
    cluster.activate(&[1, 2]).unwrap();
    assert!(cluster.await_rebalance(GROUP, TIMEOUT));

    load(&cluster, "a", 50);
    cluster.checkpoint_all().unwrap();
    cluster.stop_node(2).unwrap();

    load(&cluster, "b", 100);
    // Only the newest checkpoint is retained, past node 2's counters.
    cluster.node(1).unwrap().checkpoint().unwrap();
    assert_eq!(cluster.node(1).unwrap().history().len(), 1);

    cluster.start_node(2).unwrap();
    assert!(cluster.await_rebalance(GROUP, TIMEOUT));

    let metrics = cluster.node(2).unwrap().metrics().rebalance;
    assert_eq!(metrics.historical_demands, 0);
    assert!(metrics.full_demands > 0);
    assert_consistent(&cluster);
}

#[test]
fn test_new_node_joins_with_full_rebalance() {
    let dir = tempdir().unwrap();
    let mut cluster = cluster(dir.path(), 1, 8);
    cluster.activate(&[1, 2]).unwrap();
    load(&cluster, "a", 80);

    cluster.start_node(3).unwrap();
    assert!(cluster.await_rebalance(GROUP, TIMEOUT));

    let node3 = cluster.node(3).unwrap();
    assert!(!node3.partition_hashes(GROUP).is_empty());
    assert_eq!(node3.metrics().rebalance.historical_demands, 0);
    assert_consistent(&cluster);
    for i in 0..80 {
        let key = format!("a{}", i);
        assert!(cluster.get(GROUP, key.as_bytes()).is_some(), "missing {}", key);
    }
}

#[test]
fn test_historical_replay_is_idempotent() {
    let dir = tempdir().unwrap();
    let mut cluster = cluster(dir.path(), 1, 8);
    cluster.activate(&[1, 2]).unwrap();
    load(&cluster, "a", 30);
    cluster.checkpoint_all().unwrap();
    load(&cluster, "b", 30);
    assert_consistent(&cluster);

    let supplier = cluster.node(1).unwrap();
    let mut demand = DemandMessage::new(GROUP, cluster.version());
    for p in 0..PARTITIONS {
        if let Some(from) = supplier.history().earliest_counter(GroupPartition::new(GROUP, p)) {
            demand.historical.insert(p, from);
        }
    }
    assert!(!demand.historical.is_empty());

    let demander = cluster.node(2).unwrap();
    let group = demander.group(GROUP).unwrap().clone();
    let before = demander.partition_hashes(GROUP);

    for _ in 0..2 {
        let mut replayed = 0;
        cluster
            .transport()
            .demand(1, 2, &demand, &mut |msg| {
                assert!(msg.failed_historical.is_empty());
                for record in msg.historical {
                    match record {
                        HistoricalRecord::Entry(entry) => {
                            group.apply_rebalanced(&entry).unwrap();
                        }
                        HistoricalRecord::Rollback { partition, start, delta } => {
                            group
                                .apply_rollback(partition, CounterRange::new(start, delta))
                                .unwrap();
                        }
                    }
                    replayed += 1;
                }
                true
            })
            .unwrap();
        assert!(replayed >= 30);
        assert_eq!(demander.partition_hashes(GROUP), before);
    }
}

#[test]
fn test_departure_closes_counter_gaps() {
    let dir = tempdir().unwrap();
    let mut cluster = cluster(dir.path(), 1, 8);
    cluster.activate(&[1, 2]).unwrap();

    // Writes that reach node 1 only, then a replication that skips one.
    let node1 = cluster.node(1).unwrap();
    let entries: Vec<_> = (0..40)
        .map(|i| node1.put(GROUP, format!("k{}", i), "v").unwrap())
        .collect();
    let mut by_partition: BTreeMap<PartitionId, Vec<_>> = BTreeMap::new();
    for entry in &entries {
        by_partition.entry(entry.partition).or_default().push(entry.clone());
    }
    let (&partition, lost) = by_partition
        .iter()
        .find(|(_, e)| e.len() >= 2)
        .unwrap();
    let skipped = lost[0].update_counter;
    let last = lost.last().unwrap().update_counter;

    let node2 = cluster.node(2).unwrap();
    for entry in entries.iter().filter(|e| e.update_counter != skipped || e.partition != partition) {
        node2.apply_replicated(entry).unwrap();
    }
    let id = GroupPartition::new(GROUP, partition);
    let tracker = node2.group(GROUP).unwrap().tracker().clone();
    assert!(!tracker.gaps(id).is_empty());
    assert!(tracker.get(id) < last);

    cluster.fail_node(1).unwrap();
    assert!(tracker.gaps(id).is_empty());
    assert_eq!(tracker.get(id), last);
}
