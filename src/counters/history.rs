//! Checkpoint history: which WAL pointer replays a partition from a counter.
//!
//! Every checkpoint leaves an entry `{id, pointer, counters}`. Replaying the
//! log from `pointer` yields every update above the recorded counter of each
//! partition listed in the entry. A partition is left out of an entry when
//! its counter had holes at checkpoint time, and a group is stripped from all
//! entries when logging is switched off or back on for it.
//!
//! What was stripped is remembered as a *history start*: the id of the first
//! checkpoint whose counters are valid again for a group or partition.
//! Checkpoints persist these starts together with the per-group WAL state,
//! and [`CheckpointHistory::restore`] applies them when the history is rebuilt
//! from checkpoint files on restart.

use crate::checkpoint::{GroupRecord, PartitionRecord};
use crate::types::{GroupId, GroupPartition};
use crate::wal::WalPointer;
use parking_lot::{Mutex, RwLock};
use std::collections::{BTreeMap, HashMap, HashSet};
use tracing::debug;

/// One retained checkpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckpointEntry {
    pub id: u64,
    pub pointer: WalPointer,
    pub counters: HashMap<GroupPartition, u64>,
}

impl CheckpointEntry {
    pub fn new(id: u64, pointer: WalPointer, counters: HashMap<GroupPartition, u64>) -> Self {
        Self {
            id,
            pointer,
            counters,
        }
    }

    pub fn counter(&self, id: GroupPartition) -> Option<u64> {
        self.counters.get(&id).copied()
    }
}

#[derive(Debug, Default)]
struct HistoryState {
    entries: BTreeMap<u64, CheckpointEntry>,
    wal_disabled: HashSet<GroupId>,
    group_from: HashMap<GroupId, u64>,
    partition_from: HashMap<GroupPartition, u64>,
    /// Highest checkpoint id seen.
    last_id: u64,
}

impl HistoryState {
    fn next_id(&self) -> u64 {
        self.last_id + 1
    }

    fn history_from(&self, id: GroupPartition) -> u64 {
        let group = self.group_from.get(&id.group).copied().unwrap_or(0);
        let partition = self.partition_from.get(&id).copied().unwrap_or(0);
        group.max(partition)
    }
}

/// Retained checkpoint entries plus WAL reservations held by suppliers.
#[derive(Debug, Default)]
pub struct CheckpointHistory {
    state: RwLock<HistoryState>,
    reservations: Mutex<BTreeMap<WalPointer, usize>>,
}

impl CheckpointHistory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a completed checkpoint.
    pub fn on_checkpoint(&self, mut entry: CheckpointEntry) {
        let mut state = self.state.write();
        entry
            .counters
            .retain(|id, _| !state.wal_disabled.contains(&id.group));
        state.last_id = state.last_id.max(entry.id);
        debug!(
            id = entry.id,
            pointer = %entry.pointer,
            partitions = entry.counters.len(),
            "Checkpoint history entry added"
        );
        state.entries.insert(entry.id, entry);
    }

    /// Pointer of the newest entry from which `id` can be replayed past
    /// `from_counter`.
    pub fn search(&self, id: GroupPartition, from_counter: u64) -> Option<WalPointer> {
        let state = self.state.read();
        if state.wal_disabled.contains(&id.group) {
            return None;
        }
        state
            .entries
            .values()
            .rev()
            .find(|e| e.counter(id).is_some_and(|c| c <= from_counter))
            .map(|e| e.pointer)
    }

    /// Lowest counter from which `id` can be replayed.
    pub fn earliest_counter(&self, id: GroupPartition) -> Option<u64> {
        let state = self.state.read();
        if state.wal_disabled.contains(&id.group) {
            return None;
        }
        state.entries.values().filter_map(|e| e.counter(id)).min()
    }

    /// Stop trusting history for `group` until logging is re-enabled and a
    /// new checkpoint is taken.
    pub fn disable_wal(&self, group: GroupId) {
        let mut state = self.state.write();
        state.wal_disabled.insert(group);
        Self::strip_group(&mut state, group);
    }

    /// Resume recording history for `group`. Entries older than the call
    /// stay stripped.
    pub fn enable_wal(&self, group: GroupId) {
        let mut state = self.state.write();
        state.wal_disabled.remove(&group);
        Self::strip_group(&mut state, group);
    }

    fn strip_group(state: &mut HistoryState, group: GroupId) {
        for entry in state.entries.values_mut() {
            entry.counters.retain(|id, _| id.group != group);
        }
        let next = state.next_id();
        state.group_from.insert(group, next);
    }

    /// Forget `id` in every entry. Used when a partition's rows are replaced
    /// without going through the log.
    pub fn reset_partition(&self, id: GroupPartition) {
        let mut state = self.state.write();
        for entry in state.entries.values_mut() {
            entry.counters.remove(&id);
        }
        let next = state.next_id();
        state.partition_from.insert(id, next);
    }

    /// Id of the oldest checkpoint that may cover `id`.
    pub fn history_from(&self, id: GroupPartition) -> u64 {
        self.state.read().history_from(id)
    }

    /// WAL state of `group` as a checkpoint records it.
    pub fn group_record(&self, group: GroupId) -> GroupRecord {
        let state = self.state.read();
        GroupRecord {
            group,
            wal_enabled: !state.wal_disabled.contains(&group),
            history_from: state.group_from.get(&group).copied().unwrap_or(0),
        }
    }

    /// Apply the state saved by checkpoint `newest` to entries rebuilt from
    /// older checkpoint files. Partitions the newest checkpoint does not hold
    /// lose their history.
    pub fn restore(&self, newest: u64, groups: &[GroupRecord], partitions: &[PartitionRecord]) {
        let mut state = self.state.write();
        for group in groups {
            if group.wal_enabled {
                state.wal_disabled.remove(&group.group);
            } else {
                state.wal_disabled.insert(group.group);
            }
            state.group_from.insert(group.group, group.history_from);
        }
        for partition in partitions {
            state.partition_from.insert(partition.id(), partition.history_from);
        }
        state.last_id = state.last_id.max(newest);

        let present: HashSet<GroupPartition> = partitions.iter().map(|p| p.id()).collect();
        let HistoryState {
            entries,
            wal_disabled,
            group_from,
            partition_from,
            ..
        } = &mut *state;
        let mut stripped = 0;
        for entry in entries.values_mut() {
            let before = entry.counters.len();
            entry.counters.retain(|id, _| {
                let from = group_from
                    .get(&id.group)
                    .copied()
                    .unwrap_or(0)
                    .max(partition_from.get(id).copied().unwrap_or(0));
                present.contains(id) && !wal_disabled.contains(&id.group) && entry.id >= from
            });
            stripped += before - entry.counters.len();
        }
        debug!(
            checkpoint = newest,
            disabled = wal_disabled.len(),
            stripped,
            "Checkpoint history state restored"
        );
    }

    pub fn is_wal_disabled(&self, group: GroupId) -> bool {
        self.state.read().wal_disabled.contains(&group)
    }

    /// Pin the log from `pointer` on. Returns `false` if no retained entry
    /// covers it.
    pub fn reserve(&self, pointer: WalPointer) -> bool {
        let covered = self
            .state
            .read()
            .entries
            .values()
            .next()
            .is_some_and(|oldest| oldest.pointer <= pointer);
        if covered {
            *self.reservations.lock().entry(pointer).or_insert(0) += 1;
        }
        covered
    }

    pub fn release(&self, pointer: WalPointer) {
        let mut reservations = self.reservations.lock();
        if let Some(count) = reservations.get_mut(&pointer) {
            *count -= 1;
            if *count == 0 {
                reservations.remove(&pointer);
            }
        }
    }

    /// Lowest pinned pointer.
    pub fn min_reserved(&self) -> Option<WalPointer> {
        self.reservations.lock().keys().next().copied()
    }

    /// Keep the newest `keep` entries and return the removed ones, oldest first.
    pub fn retain_last(&self, keep: usize) -> Vec<CheckpointEntry> {
        let mut state = self.state.write();
        let excess = state.entries.len().saturating_sub(keep);
        let ids: Vec<u64> = state.entries.keys().take(excess).copied().collect();
        ids.into_iter()
            .filter_map(|id| state.entries.remove(&id))
            .collect()
    }

    /// Drop entries whose pointer lies in a segment the log no longer holds.
    pub fn truncate(&self, oldest_segment: u64) -> usize {
        let mut state = self.state.write();
        let before = state.entries.len();
        state.entries.retain(|_, e| e.pointer.segment >= oldest_segment);
        before - state.entries.len()
    }

    /// Oldest retained entry.
    pub fn oldest(&self) -> Option<CheckpointEntry> {
        self.state.read().entries.values().next().cloned()
    }

    /// Newest retained entry.
    pub fn latest(&self) -> Option<CheckpointEntry> {
        self.state.read().entries.values().next_back().cloned()
    }

    pub fn len(&self) -> usize {
        self.state.read().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
