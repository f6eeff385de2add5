//! Checkpoints: periodic snapshots of partitions and counters.
//!
//! A checkpoint bounds WAL replay on restart and anchors historical
//! rebalance: each one records the WAL position of its marker together with
//! the update counter of every partition that had no gaps, plus the WAL state
//! of every cache group so history survives a restart.
//!
//! - LZ4 compression for efficient storage
//! - CRC32 checksums per record and over the whole data block
//! - Temp file plus rename, so a crash never leaves a half-written checkpoint
//! - Retention that drives WAL truncation
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                       Checkpointer                           │
//! │  ┌──────────────────┐ ┌──────────────────┐ ┌─────────────┐ │
//! │  │ CheckpointWriter │ │ CheckpointReader │ │   History   │ │
//! │  │  (compression)   │ │ (decompression)  │ │ (retention) │ │
//! │  └────────┬─────────┘ └────────┬─────────┘ └──────┬──────┘ │
//! │           │                    │                  │         │
//! │           ▼                    ▼                  ▼         │
//! │  ┌──────────────────────────────────┐   ┌───────────────┐  │
//! │  │ Header (72B) + Data (LZ4) + CRC  │   │ WAL truncation│  │
//! │  └──────────────────────────────────┘   └───────────────┘  │
//! └─────────────────────────────────────────────────────────────┘
//! ```

mod format;
mod manager;
mod reader;
mod writer;

pub use format::{
    CheckpointHeader, FormatError, GroupRecord, PartitionRecord, RowEntry, HEADER_SIZE, MAGIC,
    VERSION,
};
pub use manager::{
    checkpoint_file_name, CheckpointInfo, CheckpointSnapshot, Checkpointer, RecoveredCheckpoint,
};
pub use reader::{CheckpointData, CheckpointReader};
pub use writer::{CheckpointFileInfo, CheckpointWriter};
