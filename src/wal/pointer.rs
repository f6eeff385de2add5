//! Stable locators into the log.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Position of one record: segment index, byte offset inside the segment and
/// framed length.
///
/// Pointers order by segment first, then offset, which is exactly the order in
/// which records were appended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct WalPointer {
    pub segment: u64,
    pub offset: u32,
    pub length: u32,
}

impl WalPointer {
    pub const fn new(segment: u64, offset: u32, length: u32) -> Self {
        Self {
            segment,
            offset,
            length,
        }
    }

    /// Pointer to the first record position of `segment`.
    pub const fn segment_start(segment: u64) -> Self {
        Self::new(segment, super::segment::SEGMENT_HEADER_SIZE as u32, 0)
    }

    /// Zero-length pointer just past this record.
    pub fn next(&self) -> Self {
        Self::new(self.segment, self.offset + self.length, 0)
    }

    /// Position key that ignores the record length.
    pub(crate) fn position(&self) -> (u64, u32) {
        (self.segment, self.offset)
    }
}

impl fmt::Display for WalPointer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "WalPointer[idx={}, off={}, len={}]",
            self.segment, self.offset, self.length
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pointer_ordering() {
        let a = WalPointer::new(0, 32, 10);
        let b = a.next();
        let c = WalPointer::new(1, 32, 5);

        assert!(a < WalPointer::new(0, 42, 7));
        assert_eq!(b, WalPointer::new(0, 42, 0));
        assert!(b < c);
        assert_eq!(a.position(), (0, 32));
    }

    #[test]
    fn test_segment_start() {
        let start = WalPointer::segment_start(3);
        assert_eq!(start.segment, 3);
        assert_eq!(start.length, 0);
        assert!(start < WalPointer::new(3, start.offset, 1));
    }
}
