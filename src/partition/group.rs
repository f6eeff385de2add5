//! Cache group context: partitions, counters and logging for one group.

use crate::checkpoint::{PartitionRecord, RowEntry};
use crate::config::CacheGroupConfig;
use crate::counters::{CounterRange, TxCounters, UpdateCounterTracker};
use crate::error::{Error, Result};
use crate::partition::local::{LocalPartition, PartitionState, Row};
use crate::types::{GroupId, GroupPartition, PartitionId};
use crate::wal::{DataEntry, WalManager, WalRecord};
use bytes::Bytes;
use dashmap::DashMap;
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::hash::Hasher;
use std::sync::Arc;
use tracing::{debug, info, trace};
use twox_hash::XxHash64;

/// Node-wide barrier between updates (shared) and checkpoints (exclusive).
pub type WriteBarrier = Arc<RwLock<()>>;

/// Rows and counter of a partition, taken atomically.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartitionSnapshot {
    pub partition: PartitionId,
    pub counter: u64,
    pub rows: Vec<(Bytes, Row)>,
}

/// Idle-verify record of one partition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PartitionHash {
    pub partition: PartitionId,
    pub counter: u64,
    pub size: usize,
    pub hash: u64,
}

/// Ties one cache group's local partitions to the update counters and the WAL.
///
/// Every mutation holds the write barrier shared and the partition lock
/// exclusively from counter reservation to apply, so within a partition the
/// log order matches the counter order.
pub struct GroupContext {
    config: CacheGroupConfig,
    partitions: DashMap<PartitionId, Arc<RwLock<LocalPartition>>>,
    tracker: Arc<UpdateCounterTracker>,
    wal: Arc<WalManager>,
    barrier: WriteBarrier,
}

impl GroupContext {
    pub fn new(
        config: CacheGroupConfig,
        tracker: Arc<UpdateCounterTracker>,
        wal: Arc<WalManager>,
        barrier: WriteBarrier,
    ) -> Self {
        Self {
            config,
            partitions: DashMap::new(),
            tracker,
            wal,
            barrier,
        }
    }

    pub fn id(&self) -> GroupId {
        self.config.id
    }

    pub fn config(&self) -> &CacheGroupConfig {
        &self.config
    }

    pub fn tracker(&self) -> &Arc<UpdateCounterTracker> {
        &self.tracker
    }

    fn gp(&self, partition: PartitionId) -> GroupPartition {
        GroupPartition::new(self.config.id, partition)
    }

    /// Partition a key maps to.
    pub fn partition_of(&self, key: &[u8]) -> PartitionId {
        partition_for_key(key, self.config.partitions)
    }

    pub fn wal_enabled(&self) -> bool {
        !self.tracker.history().is_wal_disabled(self.config.id)
    }

    pub fn partition(&self, partition: PartitionId) -> Option<Arc<RwLock<LocalPartition>>> {
        self.partitions.get(&partition).map(|p| p.clone())
    }

    fn local(&self, partition: PartitionId) -> Result<Arc<RwLock<LocalPartition>>> {
        self.partition(partition)
            .ok_or_else(|| Error::PartitionNotLocal(self.gp(partition)))
    }

    /// Create the partition if missing, in `state`.
    pub fn ensure_partition(
        &self,
        partition: PartitionId,
        state: PartitionState,
    ) -> Arc<RwLock<LocalPartition>> {
        self.partitions
            .entry(partition)
            .or_insert_with(|| Arc::new(RwLock::new(LocalPartition::new(self.gp(partition), state))))
            .clone()
    }

    /// Local partitions, sorted.
    pub fn partitions(&self) -> Vec<PartitionId> {
        let mut out: Vec<_> = self.partitions.iter().map(|e| *e.key()).collect();
        out.sort_unstable();
        out
    }

    pub fn state(&self, partition: PartitionId) -> Option<PartitionState> {
        self.partition(partition).map(|p| p.read().state())
    }

    pub fn set_state(&self, partition: PartitionId, state: PartitionState) -> Result<()> {
        self.local(partition)?.write().set_state(state);
        Ok(())
    }

    /// Low-water mark of a partition's update counter.
    pub fn counter(&self, partition: PartitionId) -> u64 {
        self.tracker.get(self.gp(partition))
    }

    pub fn get(&self, key: &[u8]) -> Option<Bytes> {
        let partition = self.partition(self.partition_of(key))?;
        let guard = partition.read();
        guard.get(key)
    }

    fn log(&self, record: &WalRecord) -> Result<()> {
        if self.wal_enabled() {
            self.wal.append(record)?;
        }
        Ok(())
    }

    /// Primary update: reserve a counter, log, apply.
    pub fn put(&self, key: impl Into<Bytes>, value: impl Into<Bytes>) -> Result<DataEntry> {
        self.update(key.into(), Some(value.into()))
    }

    pub fn remove(&self, key: impl Into<Bytes>) -> Result<DataEntry> {
        self.update(key.into(), None)
    }

    fn update(&self, key: Bytes, value: Option<Bytes>) -> Result<DataEntry> {
        let partition = self.partition_of(&key);
        let _barrier = self.barrier.read();
        let local = self.local(partition)?;
        let mut guard = local.write();

        let counter = self.tracker.reserve(self.config.id, partition)?;
        let entry = match value {
            Some(value) => DataEntry::put(self.config.id, partition, key, value, counter, counter),
            None => DataEntry::remove(self.config.id, partition, key, counter, counter),
        };
        self.log(&WalRecord::DataEntry(entry.clone()))?;
        guard.apply_entry(&entry);
        self.tracker.update(self.gp(partition), counter)?;
        Ok(entry)
    }

    /// Apply a batch of updates as one transaction.
    ///
    /// Counters are reserved as one range per touched partition and
    /// published once every entry is applied.
    pub fn put_all(&self, updates: Vec<(Bytes, Option<Bytes>)>) -> Result<Vec<DataEntry>> {
        let _barrier = self.barrier.read();

        let mut by_partition: BTreeMap<PartitionId, Vec<(Bytes, Option<Bytes>)>> = BTreeMap::new();
        for (key, value) in updates {
            by_partition
                .entry(self.partition_of(&key))
                .or_default()
                .push((key, value));
        }

        // Partition locks are taken in ascending order.
        let mut locals = Vec::with_capacity(by_partition.len());
        for partition in by_partition.keys() {
            locals.push(self.local(*partition)?);
        }
        let mut guards: Vec<_> = locals.iter().map(|l| l.write()).collect();

        let mut tx = TxCounters::new();
        for (partition, rows) in &by_partition {
            let id = self.gp(*partition);
            tx.accumulate(id, rows.len() as u64);
        }
        let ranges = tx.finalize(&self.tracker)?;

        let mut entries = Vec::new();
        for ((partition, rows), guard) in by_partition.into_iter().zip(guards.iter_mut()) {
            let id = self.gp(partition);
            for (key, value) in rows {
                let counter = tx.generate_next_counter(id)?;
                let entry = match value {
                    Some(value) => DataEntry::put(id.group, partition, key, value, counter, counter),
                    None => DataEntry::remove(id.group, partition, key, counter, counter),
                };
                self.log(&WalRecord::DataEntry(entry.clone()))?;
                guard.apply_entry(&entry);
                entries.push(entry);
            }
        }

        for (id, range) in ranges {
            self.tracker.apply_final(id, range)?;
        }
        debug!(group = self.config.id, entries = entries.len(), "Transaction applied");
        Ok(entries)
    }

    /// Backup path: apply an update carrying the primary's counter.
    ///
    /// Returns `false` if the partition is not hosted here or the update was
    /// already applied.
    pub fn apply_replicated(&self, entry: &DataEntry) -> Result<bool> {
        let _barrier = self.barrier.read();
        let Some(local) = self.partition(entry.partition) else {
            return Ok(false);
        };
        let mut guard = local.write();
        if guard.state() == PartitionState::Evicted || guard.state() == PartitionState::Renting {
            return Ok(false);
        }
        self.log(&WalRecord::DataEntry(entry.clone()))?;
        let applied = guard.apply_entry(entry);
        let counted = self.tracker.update(entry.group_partition(), entry.update_counter)?;
        Ok(applied || counted)
    }

    /// Demander path for historical records: same as a replicated update.
    pub fn apply_rebalanced(&self, entry: &DataEntry) -> Result<bool> {
        self.apply_replicated(entry)
    }

    /// Close a counter range that will never carry data.
    pub fn apply_rollback(&self, partition: PartitionId, range: CounterRange) -> Result<bool> {
        let _barrier = self.barrier.read();
        let local = self.local(partition)?;
        let _guard = local.write();
        self.log(&WalRecord::Rollback {
            group: self.config.id,
            partition,
            start: range.start,
            range: range.delta,
        })?;
        Ok(self.tracker.apply_final(self.gp(partition), range)?)
    }

    /// Close every counter gap of the local partitions accepted by `filter`
    /// with a logged rollback.
    pub fn close_gaps(&self, filter: impl Fn(PartitionId) -> bool) -> Result<usize> {
        let mut closed = 0;
        for partition in self.partitions().into_iter().filter(|p| filter(*p)) {
            for gap in self.tracker.gaps(self.gp(partition)) {
                if self.apply_rollback(partition, gap)? {
                    info!(group = self.config.id, partition, range = %gap, "Counter gap closed");
                    closed += 1;
                }
            }
        }
        Ok(closed)
    }

    /// Drop all rows of a partition, before a full transfer or on eviction.
    pub fn clear_partition(&self, partition: PartitionId) -> Result<()> {
        let _barrier = self.barrier.read();
        let local = self.local(partition)?;
        let mut guard = local.write();
        guard.clear();
        self.tracker.update_initial(self.gp(partition), 0);
        self.tracker.history().reset_partition(self.gp(partition));
        Ok(())
    }

    /// Install rows received from a full transfer. Rows are not logged; the
    /// node checkpoints after the rebalance instead.
    pub fn apply_full_rows(&self, partition: PartitionId, rows: Vec<(Bytes, Row)>) -> Result<usize> {
        let _barrier = self.barrier.read();
        let local = self.local(partition)?;
        let mut guard = local.write();
        let mut applied = 0;
        for (key, row) in rows {
            if guard.apply(key, row.value, row.version) {
                applied += 1;
            }
        }
        Ok(applied)
    }

    /// Set the counter a full transfer ended at.
    pub fn finish_full(&self, partition: PartitionId, counter: u64) -> Result<()> {
        let _barrier = self.barrier.read();
        let local = self.local(partition)?;
        let _guard = local.write();
        let id = self.gp(partition);
        if self.tracker.get(id) < counter {
            self.tracker.update_initial(id, counter);
        }
        Ok(())
    }

    /// Rows and counter of a partition, consistent with each other.
    pub fn snapshot(&self, partition: PartitionId) -> Option<PartitionSnapshot> {
        let local = self.partition(partition)?;
        let guard = local.read();
        Some(PartitionSnapshot {
            partition,
            counter: self.tracker.get(self.gp(partition)),
            rows: guard.rows().map(|(k, r)| (k.clone(), r.clone())).collect(),
        })
    }

    /// Idle-verify record of a partition.
    pub fn partition_hash(&self, partition: PartitionId) -> Option<PartitionHash> {
        let local = self.partition(partition)?;
        let guard = local.read();
        Some(PartitionHash {
            partition,
            counter: self.tracker.get(self.gp(partition)),
            size: guard.len(),
            hash: guard.content_hash(),
        })
    }

    /// Remove a partition that is no longer assigned here.
    pub fn evict(&self, partition: PartitionId) {
        let _barrier = self.barrier.read();
        if let Some((_, local)) = self.partitions.remove(&partition) {
            let mut guard = local.write();
            guard.set_state(PartitionState::Evicted);
            guard.clear();
            self.tracker.update_initial(self.gp(partition), 0);
            self.tracker.history().reset_partition(self.gp(partition));
            debug!(group = self.config.id, partition, "Partition evicted");
        }
    }

    /// Partition records and rows for a checkpoint. The caller holds the
    /// write barrier exclusively.
    pub fn checkpoint_records(&self) -> (Vec<PartitionRecord>, Vec<RowEntry>) {
        let mut records = Vec::new();
        let mut rows = Vec::new();
        for partition in self.partitions() {
            let Some(local) = self.partition(partition) else {
                continue;
            };
            let guard = local.read();
            let id = self.gp(partition);
            records.push(PartitionRecord {
                group: id.group,
                partition,
                counter: self.tracker.get(id),
                state: guard.state().as_u8(),
                has_gaps: !self.tracker.gaps(id).is_empty(),
                history_from: self.tracker.history().history_from(id),
            });
            rows.extend(guard.rows().map(|(key, row)| RowEntry {
                group: id.group,
                partition,
                key: key.clone(),
                value: row.value.clone(),
                version: row.version,
            }));
        }
        (records, rows)
    }

    /// Load partitions from a checkpoint.
    pub fn restore(&self, records: &[PartitionRecord], rows: &[RowEntry]) {
        for record in records.iter().filter(|r| r.group == self.config.id) {
            let state = PartitionState::from_u8(record.state).unwrap_or(PartitionState::Moving);
            if state == PartitionState::Evicted {
                continue;
            }
            self.ensure_partition(record.partition, state);
            self.tracker
                .update_initial(self.gp(record.partition), record.counter);
        }
        for row in rows.iter().filter(|r| r.group == self.config.id) {
            if let Some(local) = self.partition(row.partition) {
                local
                    .write()
                    .apply(row.key.clone(), row.value.clone(), row.version);
            }
        }
    }

    /// Re-apply a logged record during recovery. Nothing is logged again.
    pub fn replay(&self, record: &WalRecord) -> Result<bool> {
        match record {
            WalRecord::DataEntry(entry) => {
                if entry.group != self.config.id {
                    return Ok(false);
                }
                let local = self.ensure_partition(entry.partition, PartitionState::Owning);
                let applied = local.write().apply_entry(entry);
                let counted = if entry.update_counter > 0 {
                    self.tracker
                        .update(entry.group_partition(), entry.update_counter)?
                } else {
                    false
                };
                Ok(applied || counted)
            }
            WalRecord::Rollback {
                group,
                partition,
                start,
                range,
            } => {
                if *group != self.config.id {
                    return Ok(false);
                }
                self.ensure_partition(*partition, PartitionState::Owning);
                Ok(self
                    .tracker
                    .apply_final(self.gp(*partition), CounterRange::new(*start, *range))?)
            }
            WalRecord::DataPageInsert { group, page_id, .. }
            | WalRecord::DataPageUpdate { group, page_id, .. }
            | WalRecord::DataPageRemove { group, page_id, .. } => {
                // Rows are rebuilt from data entries; page deltas have nothing to apply.
                trace!(group, page_id, "Skipping page delta record");
                Ok(false)
            }
            WalRecord::Checkpoint { .. } | WalRecord::WalStateChange { .. } => Ok(false),
        }
    }
}

impl std::fmt::Debug for GroupContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GroupContext")
            .field("group", &self.config.id)
            .field("name", &self.config.name)
            .field("partitions", &self.partitions.len())
            .finish()
    }
}

/// Partition of `key` in a group with `partitions` partitions.
pub fn partition_for_key(key: &[u8], partitions: PartitionId) -> PartitionId {
    let mut hasher = XxHash64::with_seed(0);
    hasher.write(key);
    (hasher.finish() % partitions.max(1) as u64) as PartitionId
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::WalConfig;
    use crate::counters::CheckpointHistory;
    use crate::failure::FailureProcessor;
    use crate::metrics::WalMetrics;
    use std::path::Path;
    use tempfile::tempdir;

    struct Fixture {
        group: GroupContext,
        wal: Arc<WalManager>,
        history: Arc<CheckpointHistory>,
    }

    fn fixture(dir: &Path) -> Fixture {
        let wal = Arc::new(
            WalManager::open(
                WalConfig::default(),
                dir.join("wal"),
                dir.join("archive"),
                Arc::new(FailureProcessor::default()),
                None,
                Arc::new(WalMetrics::new()),
            )
            .unwrap(),
        );
        let history = Arc::new(CheckpointHistory::new());
        let tracker = Arc::new(UpdateCounterTracker::new(history.clone()));
        let group = GroupContext::new(
            CacheGroupConfig::new(1, "default").with_partitions(4),
            tracker,
            wal.clone(),
            Arc::new(RwLock::new(())),
        );
        for p in 0..4 {
            group.ensure_partition(p, PartitionState::Owning);
        }
        Fixture {
            group,
            wal,
            history,
        }
    }

    fn logged_entries(wal: &WalManager) -> Vec<DataEntry> {
        wal.iterator(crate::wal::WalPointer::new(0, 0, 0), None)
            .unwrap()
            .filter_map(|r| match r.unwrap().1 {
                WalRecord::DataEntry(e) => Some(e),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn test_put_logs_and_counts() {
        let dir = tempdir().unwrap();
        let f = fixture(dir.path());

        let e1 = f.group.put("a", "1").unwrap();
        let e2 = f.group.put("a", "2").unwrap();
        assert_eq!(e2.update_counter, e1.update_counter + 1);
        assert_eq!(f.group.get(b"a"), Some(Bytes::from("2")));
        assert_eq!(f.group.counter(e1.partition), 2);
        assert_eq!(logged_entries(&f.wal), vec![e1, e2]);
    }

    #[test]
    fn test_remove_leaves_tombstone() {
        let dir = tempdir().unwrap();
        let f = fixture(dir.path());

        f.group.put("a", "1").unwrap();
        let removed = f.group.remove("a").unwrap();
        assert!(removed.value.is_none());
        assert_eq!(f.group.get(b"a"), None);
    }

    #[test]
    fn test_disabled_wal_skips_logging() {
        let dir = tempdir().unwrap();
        let f = fixture(dir.path());

        f.history.disable_wal(1);
        f.group.put("a", "1").unwrap();
        assert!(logged_entries(&f.wal).is_empty());
        assert_eq!(f.group.get(b"a"), Some(Bytes::from("1")));
    }

    #[test]
    fn test_put_all_uses_one_range_per_partition() {
        let dir = tempdir().unwrap();
        let f = fixture(dir.path());

        let updates: Vec<_> = (0..20)
            .map(|i| (Bytes::from(format!("k{}", i)), Some(Bytes::from("v"))))
            .collect();
        let entries = f.group.put_all(updates).unwrap();
        assert_eq!(entries.len(), 20);

        let mut total = 0;
        for p in f.group.partitions() {
            let counter = f.group.counter(p);
            let mut counters: Vec<_> = entries
                .iter()
                .filter(|e| e.partition == p)
                .map(|e| e.update_counter)
                .collect();
            counters.sort_unstable();
            assert_eq!(counters, (1..=counter).collect::<Vec<_>>());
            assert!(f.group.tracker().gaps(GroupPartition::new(1, p)).is_empty());
            total += counter;
        }
        assert_eq!(total, 20);
    }

    #[test]
    fn test_put_all_sizes_follow_live_rows() {
        let dir = tempdir().unwrap();
        let f = fixture(dir.path());

        let puts: Vec<_> = (0..10)
            .map(|i| (Bytes::from(format!("k{}", i)), Some(Bytes::from("v"))))
            .collect();
        f.group.put_all(puts).unwrap();

        let mixed: Vec<_> = (0..6)
            .map(|i| {
                let key = Bytes::from(format!("k{}", i));
                if i % 2 == 0 {
                    (key, None)
                } else {
                    (key, Some(Bytes::from("w")))
                }
            })
            .chain([(Bytes::from("missing"), None)])
            .collect();
        let entries = f.group.put_all(mixed).unwrap();
        assert_eq!(entries.len(), 7);

        let size: usize = f
            .group
            .partitions()
            .into_iter()
            .filter_map(|p| f.group.partition_hash(p))
            .map(|h| h.size)
            .sum();
        assert_eq!(size, 7);
    }

    #[test]
    fn test_replicated_apply_is_idempotent() {
        let dir = tempdir().unwrap();
        let f = fixture(dir.path());

        let entry = DataEntry::put(1, 2, "k", "v", 1, 1);
        assert!(f.group.apply_replicated(&entry).unwrap());
        assert!(!f.group.apply_replicated(&entry).unwrap());
        assert_eq!(f.group.counter(2), 1);
    }

    #[test]
    fn test_out_of_order_replication_leaves_gap_until_filled() {
        let dir = tempdir().unwrap();
        let f = fixture(dir.path());
        let id = GroupPartition::new(1, 0);

        f.group
            .apply_replicated(&DataEntry::put(1, 0, "b", "2", 2, 2))
            .unwrap();
        assert_eq!(f.group.counter(0), 0);
        assert!(!f.group.tracker().gaps(id).is_empty());

        f.group
            .apply_replicated(&DataEntry::put(1, 0, "a", "1", 1, 1))
            .unwrap();
        assert_eq!(f.group.counter(0), 2);
        assert!(f.group.tracker().gaps(id).is_empty());
    }

    #[test]
    fn test_close_gaps_logs_rollback() {
        let dir = tempdir().unwrap();
        let f = fixture(dir.path());

        f.group
            .apply_replicated(&DataEntry::put(1, 0, "c", "3", 3, 3))
            .unwrap();
        assert_eq!(f.group.close_gaps(|_| true).unwrap(), 1);
        assert_eq!(f.group.counter(0), 3);

        let rollbacks = f
            .wal
            .iterator(crate::wal::WalPointer::new(0, 0, 0), None)
            .unwrap()
            .filter(|r| matches!(r.as_ref().unwrap().1, WalRecord::Rollback { .. }))
            .count();
        assert_eq!(rollbacks, 1);
    }

    #[test]
    fn test_checkpoint_records_and_restore() {
        let dir = tempdir().unwrap();
        let f = fixture(dir.path());
        for i in 0..10 {
            f.group.put(format!("k{}", i), format!("v{}", i)).unwrap();
        }
        let (records, rows) = f.group.checkpoint_records();
        assert_eq!(records.len(), 4);
        assert_eq!(rows.len(), 10);

        let other = tempdir().unwrap();
        let g = fixture(other.path());
        g.group.restore(&records, &rows);
        for p in 0..4 {
            assert_eq!(g.group.partition_hash(p), f.group.partition_hash(p));
        }
    }

    #[test]
    fn test_replay_rebuilds_state() {
        let dir = tempdir().unwrap();
        let f = fixture(dir.path());
        for i in 0..10 {
            f.group.put(format!("k{}", i), format!("v{}", i)).unwrap();
        }

        let other = tempdir().unwrap();
        let g = fixture(other.path());
        let records: Vec<_> = f
            .wal
            .iterator(crate::wal::WalPointer::new(0, 0, 0), None)
            .unwrap()
            .map(|r| r.unwrap().1)
            .collect();
        for record in records.iter().chain(records.iter()) {
            g.group.replay(record).unwrap();
        }
        for p in 0..4 {
            assert_eq!(g.group.partition_hash(p), f.group.partition_hash(p));
        }
    }

    #[test]
    fn test_replay_skips_page_deltas() {
        let dir = tempdir().unwrap();
        let f = fixture(dir.path());
        f.group.put("k", "v").unwrap();
        let before: Vec<_> = (0..4).map(|p| f.group.partition_hash(p)).collect();

        let deltas = [
            WalRecord::DataPageInsert {
                group: 1,
                page_id: 7,
                payload: Bytes::from_static(b"row"),
            },
            WalRecord::DataPageUpdate {
                group: 1,
                page_id: 7,
                item_id: 0,
                payload: Bytes::from_static(b"row2"),
            },
            WalRecord::DataPageRemove {
                group: 1,
                page_id: 7,
                item_id: 0,
            },
        ];
        for record in &deltas {
            assert!(!f.group.replay(record).unwrap());
        }

        let after: Vec<_> = (0..4).map(|p| f.group.partition_hash(p)).collect();
        assert_eq!(after, before);
        assert_eq!(f.group.counter(f.group.partition_of(b"k")), 1);
    }

    #[test]
    fn test_put_to_missing_partition_fails() {
        let dir = tempdir().unwrap();
        let f = fixture(dir.path());
        let p = f.group.partition_of(b"x");
        f.group.evict(p);
        assert!(matches!(
            f.group.put("x", "1"),
            Err(Error::PartitionNotLocal(_))
        ));
    }

    #[test]
    fn test_clear_forgets_partition_history() {
        let dir = tempdir().unwrap();
        let f = fixture(dir.path());
        let id = GroupPartition::new(1, 0);
        f.history.on_checkpoint(crate::counters::CheckpointEntry::new(
            1,
            crate::wal::WalPointer::new(0, 0, 0),
            [(id, 0)].into_iter().collect(),
        ));
        assert!(f.history.search(id, 0).is_some());

        f.group.clear_partition(0).unwrap();
        assert!(f.history.search(id, 0).is_none());
    }

    #[test]
    fn test_partition_for_key_is_stable() {
        let p = partition_for_key(b"key-1", 16);
        assert_eq!(p, partition_for_key(b"key-1", 16));
        assert!(p < 16);
        assert_eq!(partition_for_key(b"key-1", 1), 0);
    }
}
