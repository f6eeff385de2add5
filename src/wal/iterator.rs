//! Forward iteration over a pointer range.

use crate::error::WalError;
use crate::testing::failpoint::{check_io, names};
use crate::wal::manager::WalShared;
use crate::wal::pointer::WalPointer;
use crate::wal::record::WalRecord;
use crate::wal::segment::{read_frame, SegmentReader, SEGMENT_HEADER_SIZE};
use std::io;
use std::sync::Arc;
use tracing::trace;

/// Iterator over `[from, to)`, yielding records with their pointers in append order.
///
/// The end bound is fixed when the iterator is opened; records appended
/// afterwards are not visible. Segments are read from wherever they currently
/// live (work directory, archive, or compacted archive). After an error the
/// iterator is exhausted.
pub struct WalIterator {
    shared: Arc<WalShared>,
    segment: u64,
    offset: u64,
    end: (u64, u64),
    reader: Option<SegmentReader>,
    done: bool,
}

impl WalIterator {
    pub(crate) fn open(
        shared: Arc<WalShared>,
        from: WalPointer,
        to: Option<WalPointer>,
    ) -> Result<Self, WalError> {
        let oldest = shared.oldest_segment();
        if oldest.map_or(true, |oldest| from.segment < oldest) {
            return Err(WalError::RangeUnavailable {
                requested: from,
                oldest,
            });
        }

        check_io(shared.failpoints(), names::WAL_ITERATOR_OPEN)?;

        let current_end = shared.end().position();
        let end = match to {
            Some(to) if to.position() < current_end => to.position(),
            _ => current_end,
        };

        trace!(%from, end_segment = end.0, end_offset = end.1, "Opening WAL iterator");

        Ok(Self {
            shared,
            segment: from.segment,
            offset: (from.offset as u64).max(SEGMENT_HEADER_SIZE as u64),
            end: (end.0, end.1 as u64),
            reader: None,
            done: false,
        })
    }

    fn advance(&mut self) -> Result<Option<(WalPointer, WalRecord)>, WalError> {
        loop {
            if (self.segment, self.offset) >= self.end {
                return Ok(None);
            }

            if self.reader.is_none() {
                let mut reader = self.shared.open_segment(self.segment)?;
                reader
                    .skip_to(SEGMENT_HEADER_SIZE as u64, self.offset)
                    .map_err(|e| self.read_error(e))?;
                self.reader = Some(reader);
            }

            if let Err(e) = check_io(self.shared.failpoints(), names::WAL_ITERATOR_READ) {
                return Err(self.read_error(e));
            }

            let (segment, offset) = (self.segment, self.offset);
            let Some(reader) = self.reader.as_mut() else {
                continue;
            };

            match read_frame(reader, segment, offset)? {
                Some((record, len)) => {
                    let pointer = WalPointer::new(self.segment, self.offset as u32, len);
                    self.offset += len as u64;
                    return Ok(Some((pointer, record)));
                }
                None if self.segment < self.end.0 => {
                    self.reader = None;
                    self.segment += 1;
                    self.offset = SEGMENT_HEADER_SIZE as u64;
                }
                None => {
                    return Err(WalError::Corruption {
                        segment: self.segment,
                        offset: self.offset,
                        reason: "log ends before the iterator bound".into(),
                    })
                }
            }
        }
    }

    fn read_error(&self, e: io::Error) -> WalError {
        match e.kind() {
            io::ErrorKind::InvalidData | io::ErrorKind::UnexpectedEof => WalError::Corruption {
                segment: self.segment,
                offset: self.offset,
                reason: e.to_string(),
            },
            _ => WalError::Io(e),
        }
    }
}

impl Iterator for WalIterator {
    type Item = Result<(WalPointer, WalRecord), WalError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        match self.advance() {
            Ok(Some(item)) => Some(Ok(item)),
            Ok(None) => {
                self.done = true;
                None
            }
            Err(e) => {
                self.done = true;
                self.reader = None;
                Some(Err(e))
            }
        }
    }
}

impl std::fmt::Debug for WalIterator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WalIterator")
            .field("segment", &self.segment)
            .field("offset", &self.offset)
            .field("end", &self.end)
            .field("done", &self.done)
            .finish()
    }
}
