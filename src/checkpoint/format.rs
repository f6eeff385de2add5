//! Checkpoint file format definitions.
//!
//! # File Format
//!
//! ```text
//! ┌─────────────────────────────────────────────────┐
//! │ MAGIC_NUMBER: [u8; 4] = "PWCP"                  │
//! ├─────────────────────────────────────────────────┤
//! │ VERSION: u32 = 1                                │
//! ├─────────────────────────────────────────────────┤
//! │ FLAGS: u32                                      │
//! │   bit 0: compressed (LZ4)                       │
//! │   bits 1-31: reserved                           │
//! ├─────────────────────────────────────────────────┤
//! │ CHECKPOINT_ID: u64                              │
//! ├─────────────────────────────────────────────────┤
//! │ WAL_POINTER: u64 segment, u32 offset, u32 len   │
//! ├─────────────────────────────────────────────────┤
//! │ TIMESTAMP: u64 (Unix timestamp seconds)         │
//! ├─────────────────────────────────────────────────┤
//! │ PARTITION_COUNT: u32                            │
//! ├─────────────────────────────────────────────────┤
//! │ ENTRY_COUNT: u64                                │
//! ├─────────────────────────────────────────────────┤
//! │ DATA_SIZE: u64 (uncompressed size)              │
//! ├─────────────────────────────────────────────────┤
//! │ GROUP_COUNT: u32, RESERVED: [u8; 4]             │
//! ├─────────────────────────────────────────────────┤
//! │                   DATA BLOCK                     │
//! │ (possibly LZ4 compressed)                       │
//! │ ┌─────────────────────────────────────────────┐ │
//! │ │ Group 1..GROUP_COUNT:                       │ │
//! │ │  - Group: u32, WAL Enabled: u8              │ │
//! │ │  - History From: u64                        │ │
//! │ │  - CRC32: u32                               │ │
//! │ ├─────────────────────────────────────────────┤ │
//! │ │ Partition 1..PARTITION_COUNT:               │ │
//! │ │  - Group: u32, Partition: u16               │ │
//! │ │  - Counter: u64                             │ │
//! │ │  - State: u8, Has Gaps: u8                  │ │
//! │ │  - History From: u64                        │ │
//! │ │  - CRC32: u32                               │ │
//! │ ├─────────────────────────────────────────────┤ │
//! │ │ Row 1..ENTRY_COUNT:                         │ │
//! │ │  - Group: u32, Partition: u16               │ │
//! │ │  - Key Length: u32, Key: [u8]               │ │
//! │ │  - Has Value: u8 (0 = tombstone)            │ │
//! │ │  - Value Length: u32, Value: [u8]           │ │
//! │ │  - Version: u64                             │ │
//! │ │  - CRC32: u32                               │ │
//! │ └─────────────────────────────────────────────┘ │
//! ├─────────────────────────────────────────────────┤
//! │ CRC32: u32 (over the stored data block)         │
//! └─────────────────────────────────────────────────┘
//!
//! Total header size: 72 bytes
//!
//! `History From` is the id of the oldest checkpoint whose counters are
//! valid history for the group or partition.
//! ```

use crate::types::{GroupId, GroupPartition, PartitionId};
use crate::wal::WalPointer;
use bytes::Bytes;
use std::time::{SystemTime, UNIX_EPOCH};

/// Magic number for checkpoint files: "PWCP"
pub const MAGIC: [u8; 4] = [b'P', b'W', b'C', b'P'];

/// Current format version
pub const VERSION: u32 = 1;

/// Header size in bytes
pub const HEADER_SIZE: usize = 72;

/// Flag: data is LZ4 compressed
pub const FLAG_COMPRESSED: u32 = 1 << 0;

/// Fixed size of a serialized partition record, CRC excluded.
pub const PARTITION_RECORD_SIZE: usize = 24;

/// Fixed size of a serialized group record, CRC excluded.
pub const GROUP_RECORD_SIZE: usize = 13;

/// Checkpoint file header
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckpointHeader {
    pub version: u32,
    pub flags: u32,
    pub id: u64,
    /// Position of the checkpoint marker in the WAL.
    pub pointer: WalPointer,
    pub timestamp: u64,
    pub partition_count: u32,
    pub entry_count: u64,
    /// Uncompressed data size
    pub data_size: u64,
    pub group_count: u32,
}

impl CheckpointHeader {
    pub fn new(id: u64, pointer: WalPointer) -> Self {
        let timestamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs();

        Self {
            version: VERSION,
            flags: 0,
            id,
            pointer,
            timestamp,
            partition_count: 0,
            entry_count: 0,
            data_size: 0,
            group_count: 0,
        }
    }

    pub fn is_compressed(&self) -> bool {
        self.flags & FLAG_COMPRESSED != 0
    }

    pub fn set_compressed(&mut self, compressed: bool) {
        if compressed {
            self.flags |= FLAG_COMPRESSED;
        } else {
            self.flags &= !FLAG_COMPRESSED;
        }
    }

    pub fn to_bytes(&self) -> [u8; HEADER_SIZE] {
        let mut buf = [0u8; HEADER_SIZE];
        buf[0..4].copy_from_slice(&MAGIC);
        buf[4..8].copy_from_slice(&self.version.to_le_bytes());
        buf[8..12].copy_from_slice(&self.flags.to_le_bytes());
        buf[12..20].copy_from_slice(&self.id.to_le_bytes());
        buf[20..28].copy_from_slice(&self.pointer.segment.to_le_bytes());
        buf[28..32].copy_from_slice(&self.pointer.offset.to_le_bytes());
        buf[32..36].copy_from_slice(&self.pointer.length.to_le_bytes());
        buf[36..44].copy_from_slice(&self.timestamp.to_le_bytes());
        buf[44..48].copy_from_slice(&self.partition_count.to_le_bytes());
        buf[48..56].copy_from_slice(&self.entry_count.to_le_bytes());
        buf[56..64].copy_from_slice(&self.data_size.to_le_bytes());
        buf[64..68].copy_from_slice(&self.group_count.to_le_bytes());
        buf
    }

    pub fn from_bytes(buf: &[u8]) -> Result<Self, FormatError> {
        if buf.len() < HEADER_SIZE {
            return Err(FormatError::InvalidHeader("header too short".into()));
        }
        if buf[0..4] != MAGIC {
            return Err(FormatError::InvalidMagic);
        }

        let mut cursor = Cursor::new(&buf[4..HEADER_SIZE]);
        let version = cursor.u32()?;
        if version > VERSION {
            return Err(FormatError::UnsupportedVersion(version));
        }
        let flags = cursor.u32()?;
        let id = cursor.u64()?;
        let pointer = WalPointer::new(cursor.u64()?, cursor.u32()?, cursor.u32()?);

        Ok(Self {
            version,
            flags,
            id,
            pointer,
            timestamp: cursor.u64()?,
            partition_count: cursor.u32()?,
            entry_count: cursor.u64()?,
            data_size: cursor.u64()?,
            group_count: cursor.u32()?,
        })
    }
}

/// WAL state of one cache group at checkpoint time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GroupRecord {
    pub group: GroupId,
    pub wal_enabled: bool,
    pub history_from: u64,
}

impl GroupRecord {
    pub fn to_bytes(&self) -> [u8; GROUP_RECORD_SIZE] {
        let mut buf = [0u8; GROUP_RECORD_SIZE];
        buf[0..4].copy_from_slice(&self.group.to_le_bytes());
        buf[4] = self.wal_enabled as u8;
        buf[5..13].copy_from_slice(&self.history_from.to_le_bytes());
        buf
    }

    pub fn from_bytes(buf: &[u8]) -> Result<Self, FormatError> {
        let mut cursor = Cursor::new(buf);
        Ok(Self {
            group: cursor.u32()?,
            wal_enabled: cursor.u8()? != 0,
            history_from: cursor.u64()?,
        })
    }
}

/// Counter and state of one partition at checkpoint time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartitionRecord {
    pub group: GroupId,
    pub partition: PartitionId,
    pub counter: u64,
    pub state: u8,
    /// The counter had holes; the log cannot replay this partition from here.
    pub has_gaps: bool,
    /// Older checkpoints do not cover this partition.
    pub history_from: u64,
}

impl PartitionRecord {
    pub fn id(&self) -> GroupPartition {
        GroupPartition::new(self.group, self.partition)
    }

    pub fn to_bytes(&self) -> [u8; PARTITION_RECORD_SIZE] {
        let mut buf = [0u8; PARTITION_RECORD_SIZE];
        buf[0..4].copy_from_slice(&self.group.to_le_bytes());
        buf[4..6].copy_from_slice(&self.partition.to_le_bytes());
        buf[6..14].copy_from_slice(&self.counter.to_le_bytes());
        buf[14] = self.state;
        buf[15] = self.has_gaps as u8;
        buf[16..24].copy_from_slice(&self.history_from.to_le_bytes());
        buf
    }

    pub fn from_bytes(buf: &[u8]) -> Result<Self, FormatError> {
        let mut cursor = Cursor::new(buf);
        Ok(Self {
            group: cursor.u32()?,
            partition: cursor.u16()?,
            counter: cursor.u64()?,
            state: cursor.u8()?,
            has_gaps: cursor.u8()? != 0,
            history_from: cursor.u64()?,
        })
    }
}

/// A single row in the checkpoint. `value == None` is a tombstone.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RowEntry {
    pub group: GroupId,
    pub partition: PartitionId,
    pub key: Bytes,
    pub value: Option<Bytes>,
    pub version: u64,
}

impl RowEntry {
    /// Serialized size of this entry, CRC excluded
    pub fn serialized_size(&self) -> usize {
        4 + 2 + 4 + self.key.len() + 1 + self.value.as_ref().map_or(0, |v| 4 + v.len()) + 8
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(self.serialized_size());
        buf.extend_from_slice(&self.group.to_le_bytes());
        buf.extend_from_slice(&self.partition.to_le_bytes());
        buf.extend_from_slice(&(self.key.len() as u32).to_le_bytes());
        buf.extend_from_slice(&self.key);
        match &self.value {
            Some(value) => {
                buf.push(1);
                buf.extend_from_slice(&(value.len() as u32).to_le_bytes());
                buf.extend_from_slice(value);
            }
            None => buf.push(0),
        }
        buf.extend_from_slice(&self.version.to_le_bytes());
        buf
    }

    /// Parse entry from bytes, returns (entry, bytes_consumed)
    pub fn from_bytes(buf: &[u8]) -> Result<(Self, usize), FormatError> {
        let mut cursor = Cursor::new(buf);
        let group = cursor.u32()?;
        let partition = cursor.u16()?;
        let key_len = cursor.u32()? as usize;
        let key = Bytes::copy_from_slice(cursor.take(key_len)?);
        let value = match cursor.u8()? {
            0 => None,
            _ => {
                let len = cursor.u32()? as usize;
                Some(Bytes::copy_from_slice(cursor.take(len)?))
            }
        };
        let version = cursor.u64()?;
        Ok((
            Self {
                group,
                partition,
                key,
                value,
                version,
            },
            cursor.pos,
        ))
    }
}

/// Bounds-checked little-endian reader over a byte slice.
struct Cursor<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], FormatError> {
        if self.buf.len() < self.pos + n {
            return Err(FormatError::UnexpectedEof);
        }
        let out = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(out)
    }

    fn array<const N: usize>(&mut self) -> Result<[u8; N], FormatError> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.take(N)?);
        Ok(out)
    }

    fn u8(&mut self) -> Result<u8, FormatError> {
        Ok(self.take(1)?[0])
    }

    fn u16(&mut self) -> Result<u16, FormatError> {
        Ok(u16::from_le_bytes(self.array()?))
    }

    fn u32(&mut self) -> Result<u32, FormatError> {
        Ok(u32::from_le_bytes(self.array()?))
    }

    fn u64(&mut self) -> Result<u64, FormatError> {
        Ok(u64::from_le_bytes(self.array()?))
    }
}

/// Format-related errors
#[derive(Debug, thiserror::Error)]
pub enum FormatError {
    #[error("invalid magic number")]
    InvalidMagic,

    #[error("unsupported version: {0}")]
    UnsupportedVersion(u32),

    #[error("invalid header: {0}")]
    InvalidHeader(String),

    #[error("unexpected end of file")]
    UnexpectedEof,

    #[error("checksum mismatch: expected {expected}, got {actual}")]
    ChecksumMismatch { expected: u32, actual: u32 },

    #[error("entry corrupted: expected crc {expected}, got {actual}")]
    EntryCorrupted { expected: u32, actual: u32 },

    #[error("compression failed: {0}")]
    CompressionFailed(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_roundtrip() {
        let mut header = CheckpointHeader::new(7, WalPointer::new(3, 128, 21));
        header.set_compressed(true);
        header.partition_count = 4;
        header.entry_count = 1000;
        header.data_size = 50000;
        header.group_count = 2;

        let parsed = CheckpointHeader::from_bytes(&header.to_bytes()).unwrap();
        assert_eq!(parsed, header);
        assert!(parsed.is_compressed());
    }

    #[test]
    fn test_group_and_partition_records() {
        let group = GroupRecord {
            group: 3,
            wal_enabled: false,
            history_from: 12,
        };
        assert_eq!(GroupRecord::from_bytes(&group.to_bytes()).unwrap(), group);

        let partition = PartitionRecord {
            group: 3,
            partition: 511,
            counter: 90,
            state: 1,
            has_gaps: true,
            history_from: 7,
        };
        assert_eq!(
            PartitionRecord::from_bytes(&partition.to_bytes()).unwrap(),
            partition
        );
    }

    #[test]
    fn test_row_with_tombstone() {
        let row = RowEntry {
            group: 1,
            partition: 9,
            key: Bytes::from_static(b"key"),
            value: None,
            version: 4,
        };
        let bytes = row.to_bytes();
        assert_eq!(bytes.len(), row.serialized_size());
        let (parsed, consumed) = RowEntry::from_bytes(&bytes).unwrap();
        assert_eq!(consumed, bytes.len());
        assert_eq!(parsed, row);
    }

    #[test]
    fn test_truncated_row() {
        let row = RowEntry {
            group: 1,
            partition: 0,
            key: Bytes::from_static(b"k"),
            value: Some(Bytes::from_static(b"value")),
            version: 1,
        };
        let bytes = row.to_bytes();
        assert!(matches!(
            RowEntry::from_bytes(&bytes[..bytes.len() - 2]),
            Err(FormatError::UnexpectedEof)
        ));
    }

    #[test]
    fn test_invalid_magic() {
        let mut bytes = [0u8; HEADER_SIZE];
        bytes[0..4].copy_from_slice(b"XXXX");
        assert!(matches!(
            CheckpointHeader::from_bytes(&bytes),
            Err(FormatError::InvalidMagic)
        ));
    }
}
