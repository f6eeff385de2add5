//! Error types for the log, the counters, the metadata store and rebalancing.

use crate::rebalance::PartitionRebalanceState;
use crate::types::{GroupId, GroupPartition, NodeId, PartitionId};
use crate::wal::WalPointer;
use std::io;
use thiserror::Error;

/// Checkpoint file errors.
pub use crate::checkpoint::FormatError as CheckpointError;

/// Result type alias for crate operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type.
#[derive(Error, Debug)]
pub enum Error {
    /// Write-ahead log errors.
    #[error("wal error: {0}")]
    Wal(#[from] WalError),

    /// Update counter errors.
    #[error("counter error: {0}")]
    Counter(#[from] CounterError),

    /// Binary metadata errors.
    #[error("metadata error: {0}")]
    Metadata(#[from] MetadataError),

    /// Checkpoint errors.
    #[error("checkpoint error: {0}")]
    Checkpoint(#[from] CheckpointError),

    /// Exchange errors.
    #[error("exchange error: {0}")]
    Exchange(#[from] ExchangeError),

    /// Rebalance errors.
    #[error("rebalance error: {0}")]
    Rebalance(#[from] RebalanceError),

    /// Configuration errors.
    #[error("config error: {0}")]
    Config(String),

    /// Unknown cache group.
    #[error("cache group not found: {0}")]
    GroupNotFound(GroupId),

    /// The partition is not hosted by this node.
    #[error("partition {0} is not local")]
    PartitionNotLocal(GroupPartition),

    /// The node is stopping after a critical failure or a shutdown request.
    #[error("node is stopping")]
    NodeStopping,

    /// Filesystem errors outside the log.
    #[error("io error: {0}")]
    Io(#[from] io::Error),

    /// Generic internal error.
    #[error("internal error: {0}")]
    Internal(String),
}

/// Write-ahead log errors.
#[derive(Error, Debug)]
pub enum WalError {
    /// The requested pointer precedes the oldest retained segment.
    #[error("wal range unavailable: requested {requested}, oldest retained segment {oldest:?}")]
    RangeUnavailable {
        requested: WalPointer,
        oldest: Option<u64>,
    },

    /// Checksum mismatch or truncated record inside the requested range.
    #[error("wal corruption in segment {segment} at offset {offset}: {reason}")]
    Corruption {
        segment: u64,
        offset: u64,
        reason: String,
    },

    /// A single record does not fit into an empty segment.
    #[error("record of {size} bytes exceeds segment capacity {capacity}")]
    RecordTooLarge { size: usize, capacity: u64 },

    /// Appending failed more times than the configured retry limit.
    #[error("wal write failed after {attempts} attempts")]
    WriteFailed {
        attempts: u32,
        #[source]
        source: io::Error,
    },

    /// Record (de)serialization failed.
    #[error("record encoding failed: {0}")]
    Encoding(String),

    /// The manager was stopped or hit a fatal write failure.
    #[error("wal manager is stopped")]
    Stopped,

    /// I/O error while reading or maintaining segments.
    #[error("wal io error: {0}")]
    Io(#[from] io::Error),
}

impl WalError {
    /// Metric label used when a historical supply falls back because of this error.
    pub fn fallback_reason(&self) -> &'static str {
        match self {
            WalError::RangeUnavailable { .. } => "range_unavailable",
            WalError::Corruption { .. } | WalError::Encoding(_) => "corruption",
            WalError::Io(_) | WalError::WriteFailed { .. } => "io",
            WalError::RecordTooLarge { .. } | WalError::Stopped => "other",
        }
    }
}

/// Update counter errors.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CounterError {
    /// The counter would wrap around.
    #[error("update counter overflow for g{group}-p{partition} at {value}")]
    Overflow {
        group: GroupId,
        partition: PartitionId,
        value: u64,
    },

    /// A transaction decremented a partition below zero updates.
    #[error("negative update delta for g{group}-p{partition}")]
    NegativeDelta {
        group: GroupId,
        partition: PartitionId,
    },

    /// The transaction has no finalized range for the partition.
    #[error("no reserved counter range for g{group}-p{partition}")]
    NotReserved {
        group: GroupId,
        partition: PartitionId,
    },

    /// The transaction generated more counters than it reserved.
    #[error("reserved counter range exhausted for g{group}-p{partition}")]
    RangeExhausted {
        group: GroupId,
        partition: PartitionId,
    },

    /// A zero-length or otherwise malformed range.
    #[error("invalid counter range start={start} delta={delta}")]
    InvalidRange { start: u64, delta: u64 },
}

/// Binary metadata errors.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MetadataError {
    /// Two schema versions disagree on a field type.
    #[error("type {type_id}: field '{field}' has type {existing}, cannot change to {new}")]
    FieldTypeConflict {
        type_id: i32,
        field: String,
        existing: String,
        new: String,
    },

    /// Two schema versions disagree on the type name.
    #[error("type {type_id}: name '{existing}' conflicts with '{new}'")]
    TypeNameConflict {
        type_id: i32,
        existing: String,
        new: String,
    },

    /// Two schema versions disagree on the affinity key field.
    #[error("type {type_id}: affinity key '{existing}' conflicts with '{new}'")]
    AffinityKeyConflict {
        type_id: i32,
        existing: String,
        new: String,
    },

    /// An enum constant was redefined with another ordinal.
    #[error("type {type_id}: enum constant '{name}' ordinal conflict")]
    EnumValueConflict { type_id: i32, name: String },

    /// Persisting a metadata file failed.
    #[error("failed to write metadata for type {type_id}: {reason}")]
    WriteFailed { type_id: i32, reason: String },

    /// The pending write was cancelled, carrying the failure that caused it.
    #[error("metadata write cancelled: {reason}")]
    Cancelled { reason: String },

    /// The metadata file could not be decoded.
    #[error("metadata serialization error: {0}")]
    Serialization(String),

    /// The writer is stopped.
    #[error("metadata writer stopped")]
    Stopped,
}

/// Exchange errors.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ExchangeError {
    /// The exchange worker is stopped.
    #[error("exchange worker stopped")]
    Stopped,

    /// The exchange listener failed.
    #[error("exchange {version} failed: {reason}")]
    Failed { version: String, reason: String },
}

/// Rebalance errors.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RebalanceError {
    /// Superseded by a newer topology or stopped.
    #[error("rebalance cancelled")]
    Cancelled,

    /// The supplier could not be reached within the backoff budget.
    #[error("supplier {supplier} unreachable: {reason}")]
    SupplierUnreachable { supplier: NodeId, reason: String },

    /// The supplier could not serve history for some partitions.
    #[error("historical supply from {supplier} failed for {partitions:?}: {reason}")]
    HistoricalFailed {
        supplier: NodeId,
        partitions: Vec<PartitionId>,
        reason: String,
    },

    /// The partition counter did not reach the supplier's final counter.
    #[error("partition {partition} counter {actual} below expected {expected}")]
    CounterMismatch {
        partition: PartitionId,
        expected: u64,
        actual: u64,
    },

    /// Illegal partition state transition.
    #[error("partition {partition}: invalid transition {from:?} -> {to:?}")]
    InvalidTransition {
        partition: PartitionId,
        from: PartitionRebalanceState,
        to: PartitionRebalanceState,
    },

    /// Applying supplied data failed locally.
    #[error("failed to apply supplied data: {0}")]
    Apply(String),
}

/// Transport errors between demander and supplier.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    /// No route to the node.
    #[error("node {0} unreachable")]
    Unreachable(NodeId),

    /// The request did not complete in time.
    #[error("request to node {0} timed out")]
    Timeout(NodeId),
}

impl TransportError {
    /// Whether a retry with backoff makes sense.
    pub fn is_transient(&self) -> bool {
        matches!(self, TransportError::Unreachable(_) | TransportError::Timeout(_))
    }
}

/// Render an error and all of its sources as `outer: inner: root`.
pub fn chain(err: &(dyn std::error::Error + 'static)) -> String {
    let mut out = err.to_string();
    let mut source = err.source();
    while let Some(cause) = source {
        out.push_str(": ");
        out.push_str(&cause.to_string());
        source = cause.source();
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_chain_includes_sources() {
        let err = WalError::WriteFailed {
            attempts: 3,
            source: io::Error::other("disk full"),
        };
        let rendered = chain(&err);
        assert!(rendered.starts_with("wal write failed after 3 attempts"));
        assert!(rendered.ends_with("disk full"));
    }

    #[test]
    fn test_fallback_reason_labels() {
        let unavailable = WalError::RangeUnavailable {
            requested: WalPointer::new(0, 0, 0),
            oldest: Some(2),
        };
        assert_eq!(unavailable.fallback_reason(), "range_unavailable");

        let corrupt = WalError::Corruption {
            segment: 1,
            offset: 40,
            reason: "crc".into(),
        };
        assert_eq!(corrupt.fallback_reason(), "corruption");
        assert_eq!(WalError::Io(io::Error::other("x")).fallback_reason(), "io");
    }

    #[test]
    fn test_error_conversion() {
        let err: Error = CounterError::InvalidRange { start: 1, delta: 0 }.into();
        assert!(matches!(err, Error::Counter(_)));
    }
}
