//! Node-wide registry of partition update counters.

use crate::counters::history::CheckpointHistory;
use crate::counters::update_counter::{CounterRange, PartitionUpdateCounter};
use crate::error::CounterError;
use crate::types::{GroupId, GroupPartition, PartitionId};
use crate::wal::WalPointer;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::sync::Arc;
use tracing::trace;

/// Update counters of every local partition.
///
/// Updates to distinct partitions never contend; updates to one partition are
/// serialized by that partition's mutex.
#[derive(Debug)]
pub struct UpdateCounterTracker {
    counters: DashMap<GroupPartition, Arc<Mutex<PartitionUpdateCounter>>>,
    history: Arc<CheckpointHistory>,
}

impl UpdateCounterTracker {
    pub fn new(history: Arc<CheckpointHistory>) -> Self {
        Self {
            counters: DashMap::new(),
            history,
        }
    }

    pub fn history(&self) -> &Arc<CheckpointHistory> {
        &self.history
    }

    fn counter(&self, id: GroupPartition) -> Arc<Mutex<PartitionUpdateCounter>> {
        self.counters
            .entry(id)
            .or_insert_with(|| Arc::new(Mutex::new(PartitionUpdateCounter::new(id))))
            .clone()
    }

    /// Allocate the next counter for a single update.
    pub fn reserve(&self, group: GroupId, partition: PartitionId) -> Result<u64, CounterError> {
        let start = self.reserve_range(GroupPartition::new(group, partition), 1)?;
        Ok(start + 1)
    }

    /// Allocate `delta` counters and return the range start.
    pub fn reserve_range(&self, id: GroupPartition, delta: u64) -> Result<u64, CounterError> {
        if delta == 0 {
            return Err(CounterError::InvalidRange { start: 0, delta });
        }
        self.counter(id).lock().reserve(delta)
    }

    /// Publish a committed range. Ranges may arrive in any order.
    ///
    /// Returns `false` if the range was already applied.
    pub fn apply_final(&self, id: GroupPartition, range: CounterRange) -> Result<bool, CounterError> {
        let applied = self.counter(id).lock().update(range.start, range.delta)?;
        trace!(partition = %id, range = %range, applied, "Counter range finalized");
        Ok(applied)
    }

    /// Publish a single counter value.
    pub fn update(&self, id: GroupPartition, counter: u64) -> Result<bool, CounterError> {
        if counter == 0 {
            return Err(CounterError::InvalidRange { start: 0, delta: 0 });
        }
        self.apply_final(id, CounterRange::new(counter - 1, 1))
    }

    /// Low-water mark of a partition.
    pub fn get(&self, id: GroupPartition) -> u64 {
        self.counters.get(&id).map_or(0, |c| c.lock().get())
    }

    /// High-water mark of a partition.
    pub fn hwm(&self, id: GroupPartition) -> u64 {
        self.counters.get(&id).map_or(0, |c| c.lock().hwm())
    }

    pub fn gaps(&self, id: GroupPartition) -> Vec<CounterRange> {
        self.counters.get(&id).map_or_else(Vec::new, |c| c.lock().gaps())
    }

    /// Reset a partition to a known applied counter.
    pub fn update_initial(&self, id: GroupPartition, counter: u64) {
        self.counter(id).lock().update_initial(counter);
    }

    /// Low-water marks of all partitions of a group. Partitions with holes
    /// are reported with `has_gaps = true`.
    pub fn group_counters(&self, group: GroupId) -> Vec<(PartitionId, u64, bool)> {
        let mut out: Vec<_> = self
            .counters
            .iter()
            .filter(|e| e.key().group == group)
            .map(|e| {
                let c = e.value().lock();
                (e.key().partition, c.get(), c.has_gaps())
            })
            .collect();
        out.sort_unstable_by_key(|(p, _, _)| *p);
        out
    }

    /// Snapshot of every partition: `(id, lwm, has_gaps)`.
    pub fn snapshot(&self) -> Vec<(GroupPartition, u64, bool)> {
        let mut out: Vec<_> = self
            .counters
            .iter()
            .map(|e| {
                let c = e.value().lock();
                (*e.key(), c.get(), c.has_gaps())
            })
            .collect();
        out.sort_unstable_by_key(|(id, _, _)| *id);
        out
    }

    /// Whether history lets this node replay `id` from `from_counter` up to
    /// its current low-water mark.
    pub fn historical_range_available(&self, id: GroupPartition, from_counter: u64) -> bool {
        self.historical_range(id, from_counter).is_some()
    }

    /// Pointer to start replaying `id` from `from_counter`.
    pub fn historical_range(&self, id: GroupPartition, from_counter: u64) -> Option<WalPointer> {
        if from_counter > self.get(id) {
            return None;
        }
        self.history.search(id, from_counter)
    }

    /// Lowest counter from which this node can replay `id`.
    pub fn earliest_historical_counter(&self, id: GroupPartition) -> Option<u64> {
        self.history.earliest_counter(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::counters::history::CheckpointEntry;
    use std::collections::HashSet;
    use std::thread;

    fn tracker() -> UpdateCounterTracker {
        UpdateCounterTracker::new(Arc::new(CheckpointHistory::new()))
    }

    #[test]
    fn test_concurrent_partitions_never_duplicate() {
        let tracker = Arc::new(tracker());
        let mut handles = Vec::new();
        for t in 0..8u16 {
            let tracker = tracker.clone();
            handles.push(thread::spawn(move || {
                let partition = t % 2;
                let mut seen = Vec::new();
                for _ in 0..500 {
                    let c = tracker.reserve(1, partition).unwrap();
                    tracker
                        .update(GroupPartition::new(1, partition), c)
                        .unwrap();
                    seen.push((partition, c));
                }
                seen
            }));
        }

        let mut all = HashSet::new();
        for h in handles {
            for item in h.join().unwrap() {
                assert!(all.insert(item), "duplicate counter {:?}", item);
            }
        }
        assert_eq!(tracker.get(GroupPartition::new(1, 0)), 2000);
        assert_eq!(tracker.get(GroupPartition::new(1, 1)), 2000);
    }

    #[test]
    fn test_lwm_is_monotonic_under_out_of_order_commit() {
        let tracker = tracker();
        let id = GroupPartition::new(1, 0);
        let ranges: Vec<_> = (0..5)
            .map(|_| CounterRange::new(tracker.reserve_range(id, 2).unwrap(), 2))
            .collect();

        let mut last = 0;
        for range in ranges.iter().rev() {
            assert!(tracker.apply_final(id, *range).unwrap());
            let lwm = tracker.get(id);
            assert!(lwm >= last);
            last = lwm;
        }
        assert_eq!(tracker.get(id), 10);
        assert!(!tracker.apply_final(id, ranges[0]).unwrap());
    }

    #[test]
    fn test_historical_range_requires_history() {
        let history = Arc::new(CheckpointHistory::new());
        let tracker = UpdateCounterTracker::new(history.clone());
        let id = GroupPartition::new(1, 0);

        for _ in 0..10 {
            let c = tracker.reserve(1, 0).unwrap();
            tracker.update(id, c).unwrap();
        }
        assert!(!tracker.historical_range_available(id, 5));

        history.on_checkpoint(CheckpointEntry::new(
            1,
            WalPointer::new(0, 32, 8),
            [(id, 3)].into_iter().collect(),
        ));
        assert!(tracker.historical_range_available(id, 5));
        assert!(!tracker.historical_range_available(id, 2));
        assert!(!tracker.historical_range_available(id, 11));
        assert_eq!(tracker.earliest_historical_counter(id), Some(3));
    }

    #[test]
    fn test_group_counters_report_gaps() {
        let tracker = tracker();
        tracker.update_initial(GroupPartition::new(2, 1), 7);
        tracker.reserve(2, 0).unwrap();

        let counters = tracker.group_counters(2);
        assert_eq!(counters, vec![(0, 0, true), (1, 7, false)]);
    }
}
