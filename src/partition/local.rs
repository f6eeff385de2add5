//! A single partition's rows and state.

use crate::types::GroupPartition;
use crate::wal::DataEntry;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::hash::Hasher;
use twox_hash::XxHash64;

/// Lifecycle of a partition on one node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PartitionState {
    /// Assigned here, data still arriving.
    Moving,
    /// Complete and serving.
    Owning,
    /// No longer assigned here, waiting to be cleared.
    Renting,
    /// Cleared.
    Evicted,
}

impl PartitionState {
    pub fn as_u8(self) -> u8 {
        match self {
            PartitionState::Moving => 0,
            PartitionState::Owning => 1,
            PartitionState::Renting => 2,
            PartitionState::Evicted => 3,
        }
    }

    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(PartitionState::Moving),
            1 => Some(PartitionState::Owning),
            2 => Some(PartitionState::Renting),
            3 => Some(PartitionState::Evicted),
            _ => None,
        }
    }
}

impl fmt::Display for PartitionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            PartitionState::Moving => "MOVING",
            PartitionState::Owning => "OWNING",
            PartitionState::Renting => "RENTING",
            PartitionState::Evicted => "EVICTED",
        };
        f.write_str(s)
    }
}

/// A stored row. `value == None` is a tombstone.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Row {
    pub value: Option<Bytes>,
    pub version: u64,
}

/// Rows of one partition, ordered by key.
///
/// Applying a row is last-version-wins, so replaying the same updates any
/// number of times converges to the same state.
#[derive(Debug)]
pub struct LocalPartition {
    id: GroupPartition,
    state: PartitionState,
    rows: BTreeMap<Bytes, Row>,
}

impl LocalPartition {
    pub fn new(id: GroupPartition, state: PartitionState) -> Self {
        Self {
            id,
            state,
            rows: BTreeMap::new(),
        }
    }

    pub fn id(&self) -> GroupPartition {
        self.id
    }

    pub fn state(&self) -> PartitionState {
        self.state
    }

    pub fn set_state(&mut self, state: PartitionState) {
        self.state = state;
    }

    pub fn row(&self, key: &[u8]) -> Option<&Row> {
        self.rows.get(key)
    }

    /// Live value of `key`.
    pub fn get(&self, key: &[u8]) -> Option<Bytes> {
        self.rows.get(key).and_then(|r| r.value.clone())
    }

    /// Apply a row version. Returns `false` if an equal or newer version is
    /// already present.
    pub fn apply(&mut self, key: Bytes, value: Option<Bytes>, version: u64) -> bool {
        match self.rows.get_mut(&key) {
            Some(row) if row.version >= version => false,
            Some(row) => {
                row.value = value;
                row.version = version;
                true
            }
            None => {
                self.rows.insert(key, Row { value, version });
                true
            }
        }
    }

    pub fn apply_entry(&mut self, entry: &DataEntry) -> bool {
        self.apply(entry.key.clone(), entry.value.clone(), entry.version)
    }

    /// Number of live rows.
    pub fn len(&self) -> usize {
        self.rows.values().filter(|r| r.value.is_some()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// All rows including tombstones, ordered by key.
    pub fn rows(&self) -> impl Iterator<Item = (&Bytes, &Row)> {
        self.rows.iter()
    }

    pub fn clear(&mut self) {
        self.rows.clear();
    }

    /// XxHash64 over the live rows in key order.
    pub fn content_hash(&self) -> u64 {
        let mut hasher = XxHash64::with_seed(0);
        for (key, row) in &self.rows {
            if let Some(value) = &row.value {
                hasher.write_u32(key.len() as u32);
                hasher.write(key);
                hasher.write_u32(value.len() as u32);
                hasher.write(value);
            }
        }
        hasher.finish()
    }
}
