//! Partition update counters.
//!
//! Every logical update of a partition carries a counter. The
//! [`UpdateCounterTracker`] hands counters out and tracks which of them have
//! been applied; together with the [`CheckpointHistory`] it answers whether
//! the local log can replay a partition from a given counter.

pub mod history;
pub mod tracker;
pub mod tx;
pub mod update_counter;

pub use history::{CheckpointEntry, CheckpointHistory};
pub use tracker::UpdateCounterTracker;
pub use tx::TxCounters;
pub use update_counter::{CounterRange, PartitionUpdateCounter};
