//! Logged record kinds.
//!
//! Every mutation that reaches the log is one variant of [`WalRecord`].
//! Records are immutable once appended and are serialized with `bincode`
//! inside the checksummed frame described in [`super::segment`].

use crate::types::{GroupId, GroupPartition, PartitionId};
use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// Logical row operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DataOp {
    Create,
    Update,
    Delete,
}

/// A logical row mutation with its partition update counter.
///
/// `value` is `None` for deletes. `version` orders mutations of one key so the
/// entry can be applied idempotently: an entry whose version is not newer than
/// the stored row is a no-op.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataEntry {
    pub group: GroupId,
    pub partition: PartitionId,
    pub op: DataOp,
    pub key: Bytes,
    pub value: Option<Bytes>,
    pub version: u64,
    pub update_counter: u64,
}

impl DataEntry {
    /// Insert or update entry.
    pub fn put(
        group: GroupId,
        partition: PartitionId,
        key: impl Into<Bytes>,
        value: impl Into<Bytes>,
        version: u64,
        update_counter: u64,
    ) -> Self {
        Self {
            group,
            partition,
            op: DataOp::Update,
            key: key.into(),
            value: Some(value.into()),
            version,
            update_counter,
        }
    }

    /// Delete entry.
    pub fn remove(
        group: GroupId,
        partition: PartitionId,
        key: impl Into<Bytes>,
        version: u64,
        update_counter: u64,
    ) -> Self {
        Self {
            group,
            partition,
            op: DataOp::Delete,
            key: key.into(),
            value: None,
            version,
            update_counter,
        }
    }

    pub fn group_partition(&self) -> GroupPartition {
        GroupPartition::new(self.group, self.partition)
    }
}

/// Discriminant of [`WalRecord`], used for logging and filtering.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RecordType {
    DataEntry,
    DataPageInsert,
    DataPageUpdate,
    DataPageRemove,
    Rollback,
    Checkpoint,
    WalStateChange,
}

/// A logged mutation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum WalRecord {
    /// Logical row mutation. Historical rebalance replays these.
    DataEntry(DataEntry),

    /// A row was inserted into a data page.
    DataPageInsert {
        group: GroupId,
        page_id: u64,
        payload: Bytes,
    },

    /// A row inside a data page was overwritten.
    DataPageUpdate {
        group: GroupId,
        page_id: u64,
        item_id: u16,
        payload: Bytes,
    },

    /// A row was removed from a data page.
    DataPageRemove {
        group: GroupId,
        page_id: u64,
        item_id: u16,
    },

    /// Counters `(start, start + range]` were reserved but will never carry
    /// data. Applying the record closes the gap.
    Rollback {
        group: GroupId,
        partition: PartitionId,
        start: u64,
        range: u64,
    },

    /// Checkpoint marker. Replay after a checkpoint starts here.
    Checkpoint { id: u64 },

    /// Logging was switched off or on for a group.
    WalStateChange { group: GroupId, enabled: bool },
}

impl WalRecord {
    pub fn record_type(&self) -> RecordType {
        match self {
            WalRecord::DataEntry(_) => RecordType::DataEntry,
            WalRecord::DataPageInsert { .. } => RecordType::DataPageInsert,
            WalRecord::DataPageUpdate { .. } => RecordType::DataPageUpdate,
            WalRecord::DataPageRemove { .. } => RecordType::DataPageRemove,
            WalRecord::Rollback { .. } => RecordType::Rollback,
            WalRecord::Checkpoint { .. } => RecordType::Checkpoint,
            WalRecord::WalStateChange { .. } => RecordType::WalStateChange,
        }
    }

    /// Cache group the record belongs to, if any.
    pub fn group(&self) -> Option<GroupId> {
        match self {
            WalRecord::DataEntry(e) => Some(e.group),
            WalRecord::DataPageInsert { group, .. }
            | WalRecord::DataPageUpdate { group, .. }
            | WalRecord::DataPageRemove { group, .. }
            | WalRecord::Rollback { group, .. }
            | WalRecord::WalStateChange { group, .. } => Some(*group),
            WalRecord::Checkpoint { .. } => None,
        }
    }

    /// Partition and the highest update counter the record covers, for
    /// records that advance a partition counter.
    pub fn counter_update(&self) -> Option<(GroupPartition, u64)> {
        match self {
            WalRecord::DataEntry(e) => Some((e.group_partition(), e.update_counter)),
            WalRecord::Rollback {
                group,
                partition,
                start,
                range,
            } => Some((GroupPartition::new(*group, *partition), start + range)),
            _ => None,
        }
    }

    pub(crate) fn encode(&self) -> Result<Vec<u8>, bincode::Error> {
        bincode::serialize(self)
    }

    pub(crate) fn decode(bytes: &[u8]) -> Result<Self, bincode::Error> {
        bincode::deserialize(bytes)
    }
}

impl From<DataEntry> for WalRecord {
    fn from(entry: DataEntry) -> Self {
        WalRecord::DataEntry(entry)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counter_update() {
        let entry = WalRecord::from(DataEntry::put(1, 4, "k", "v", 1, 9));
        assert_eq!(entry.counter_update(), Some((GroupPartition::new(1, 4), 9)));

        let rollback = WalRecord::Rollback {
            group: 1,
            partition: 4,
            start: 10,
            range: 3,
        };
        assert_eq!(
            rollback.counter_update(),
            Some((GroupPartition::new(1, 4), 13))
        );

        assert_eq!(WalRecord::Checkpoint { id: 1 }.counter_update(), None);
    }

    #[test]
    fn test_group_and_type() {
        let remove = WalRecord::DataPageRemove {
            group: 2,
            page_id: 77,
            item_id: 3,
        };
        assert_eq!(remove.group(), Some(2));
        assert_eq!(remove.record_type(), RecordType::DataPageRemove);
        assert_eq!(WalRecord::Checkpoint { id: 5 }.group(), None);
    }

    #[test]
    fn test_encode_decode() {
        let record = WalRecord::from(DataEntry::remove(3, 0, "gone", 7, 12));
        let bytes = record.encode().unwrap();
        assert_eq!(WalRecord::decode(&bytes).unwrap(), record);
    }
}
