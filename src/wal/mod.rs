//! Write-ahead log.
//!
//! The log is a sequence of fixed-capacity segment files. Every record gets a
//! [`WalPointer`] on append; iterating a pointer range returns exactly the
//! records appended in that range, in append order, as long as the segments
//! covering it are retained.
//!
//! ```text
//!  append ──► active segment (work dir)
//!                 │ full: fsync + rollover
//!                 ▼
//!            filled segment ──► wal-archiver thread ──► archive dir
//!                                                        │ compaction
//!                                                        ▼
//!                                                   <idx>.wal.lz4
//! ```
//!
//! Truncation only ever removes archived segments, oldest first.

pub mod events;
pub mod iterator;
pub mod manager;
pub mod pointer;
pub mod record;
pub mod segment;

pub use events::{LoggingWalListener, WalEvent, WalEventListener};
pub use iterator::WalIterator;
pub use manager::WalManager;
pub use pointer::WalPointer;
pub use record::{DataEntry, DataOp, RecordType, WalRecord};
pub use segment::SegmentState;
