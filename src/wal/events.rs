//! Segment lifecycle events.

use std::path::PathBuf;

/// Events published by the WAL manager as segments move through their lifecycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WalEvent {
    /// A filled segment reached the archive directory.
    SegmentArchived {
        /// Segment index.
        index: u64,
        /// Path of the archived file.
        path: PathBuf,
    },

    /// An archived segment was rewritten in compressed form.
    SegmentCompacted {
        /// Segment index.
        index: u64,
        /// Size of the compressed file.
        compressed_size: u64,
    },

    /// Archived segments below `before` were deleted.
    SegmentsTruncated {
        /// First retained segment index.
        before: u64,
        /// Number of deleted segments.
        count: usize,
    },
}

impl WalEvent {
    /// Get the segment index associated with this event.
    pub fn segment(&self) -> u64 {
        match self {
            WalEvent::SegmentArchived { index, .. } => *index,
            WalEvent::SegmentCompacted { index, .. } => *index,
            WalEvent::SegmentsTruncated { before, .. } => *before,
        }
    }
}

/// Listener for WAL events.
pub trait WalEventListener: Send + Sync + 'static {
    /// Called from the archiver thread, or from the caller of a maintenance
    /// operation. Must not block.
    fn on_event(&self, event: &WalEvent);
}

/// Event listener that logs events.
pub struct LoggingWalListener;

impl WalEventListener for LoggingWalListener {
    fn on_event(&self, event: &WalEvent) {
        match event {
            WalEvent::SegmentArchived { index, path } => {
                tracing::info!(segment = index, path = %path.display(), "WAL segment archived");
            }
            WalEvent::SegmentCompacted {
                index,
                compressed_size,
            } => {
                tracing::info!(segment = index, compressed_size, "WAL segment compacted");
            }
            WalEvent::SegmentsTruncated { before, count } => {
                tracing::info!(before, count, "WAL segments truncated");
            }
        }
    }
}
