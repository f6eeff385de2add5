//! Local partition storage.
//!
//! Stands in for the page store: each partition is an ordered row map with
//! last-version-wins apply. [`GroupContext`] routes every mutation through
//! the update counter tracker and the WAL.

pub mod group;
pub mod local;

pub use group::{partition_for_key, GroupContext, PartitionHash, PartitionSnapshot, WriteBarrier};
pub use local::{LocalPartition, PartitionState, Row};
