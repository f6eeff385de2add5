//! Segment file format.
//!
//! # File Format
//!
//! ```text
//! ┌─────────────────────────────────────────────────┐
//! │ MAGIC: [u8; 4] = "PWAL"                         │
//! ├─────────────────────────────────────────────────┤
//! │ VERSION: u32 = 1                                │
//! ├─────────────────────────────────────────────────┤
//! │ SEGMENT_INDEX: u64                              │
//! ├─────────────────────────────────────────────────┤
//! │ CREATED_AT: u64 (Unix timestamp seconds)        │
//! ├─────────────────────────────────────────────────┤
//! │ RESERVED: [u8; 8]                               │
//! ├─────────────────────────────────────────────────┤
//! │ Frame 1:                                        │
//! │  - Payload Length: u32                          │
//! │  - Payload: [u8] (bincode WalRecord)            │
//! │  - CRC32: u32 over length + payload             │
//! ├─────────────────────────────────────────────────┤
//! │ Frame 2: ...                                    │
//! └─────────────────────────────────────────────────┘
//! ```
//!
//! Segments are named `<index:016>.wal`. Compacted archive segments hold the
//! whole file (header included) as one LZ4 frame stream and are named
//! `<index:016>.wal.lz4`, so offsets are identical in both forms.

use crate::error::WalError;
use crate::wal::record::WalRecord;
use crc::{Crc, CRC_32_ISCSI};
use lz4_flex::frame::{FrameDecoder, FrameEncoder};
use std::fs::{self, File};
use std::io::{self, BufReader, BufWriter, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

/// CRC-32 calculator (iSCSI polynomial)
const CRC32: Crc<u32> = Crc::<u32>::new(&CRC_32_ISCSI);

/// Magic number for segment files.
pub const MAGIC: [u8; 4] = [b'P', b'W', b'A', b'L'];

/// Current format version.
pub const VERSION: u32 = 1;

/// Header size in bytes.
pub const SEGMENT_HEADER_SIZE: usize = 32;

/// Length prefix plus trailing checksum.
pub const FRAME_OVERHEAD: usize = 8;

const SEGMENT_EXT: &str = "wal";
const COMPACTED_EXT: &str = "lz4";

/// Lifecycle of a segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SegmentState {
    /// Receiving appends.
    Active,
    /// Full, waiting for the archiver.
    Filled,
    /// Copied to the archive directory. Never modified again.
    Archived,
    /// Archived and rewritten as an LZ4 frame stream.
    Compacted,
}

/// Segment file header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SegmentHeader {
    pub version: u32,
    pub index: u64,
    pub created_at: u64,
}

impl SegmentHeader {
    pub fn new(index: u64) -> Self {
        let created_at = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs();
        Self {
            version: VERSION,
            index,
            created_at,
        }
    }

    pub fn to_bytes(&self) -> [u8; SEGMENT_HEADER_SIZE] {
        let mut buf = [0u8; SEGMENT_HEADER_SIZE];
        buf[0..4].copy_from_slice(&MAGIC);
        buf[4..8].copy_from_slice(&self.version.to_le_bytes());
        buf[8..16].copy_from_slice(&self.index.to_le_bytes());
        buf[16..24].copy_from_slice(&self.created_at.to_le_bytes());
        buf
    }

    pub fn from_bytes(buf: &[u8; SEGMENT_HEADER_SIZE]) -> Result<Self, WalError> {
        if buf[0..4] != MAGIC {
            return Err(WalError::Corruption {
                segment: u64::from_le_bytes(le8(&buf[8..16])),
                offset: 0,
                reason: "invalid segment magic".into(),
            });
        }
        let version = u32::from_le_bytes(le4(&buf[4..8]));
        let index = u64::from_le_bytes(le8(&buf[8..16]));
        if version > VERSION {
            return Err(WalError::Corruption {
                segment: index,
                offset: 0,
                reason: format!("unsupported segment version {}", version),
            });
        }
        Ok(Self {
            version,
            index,
            created_at: u64::from_le_bytes(le8(&buf[16..24])),
        })
    }
}

fn le4(b: &[u8]) -> [u8; 4] {
    let mut out = [0u8; 4];
    out.copy_from_slice(&b[..4]);
    out
}

fn le8(b: &[u8]) -> [u8; 8] {
    let mut out = [0u8; 8];
    out.copy_from_slice(&b[..8]);
    out
}

/// Serialize a record into a checksummed frame.
pub fn encode_frame(record: &WalRecord) -> Result<Vec<u8>, WalError> {
    let payload = record
        .encode()
        .map_err(|e| WalError::Encoding(e.to_string()))?;
    let len = u32::try_from(payload.len())
        .map_err(|_| WalError::Encoding(format!("payload of {} bytes", payload.len())))?;

    let mut frame = Vec::with_capacity(payload.len() + FRAME_OVERHEAD);
    frame.extend_from_slice(&len.to_le_bytes());
    frame.extend_from_slice(&payload);

    let crc = CRC32.checksum(&frame);
    frame.extend_from_slice(&crc.to_le_bytes());
    Ok(frame)
}

/// Read the frame starting at `offset`.
///
/// Returns `Ok(None)` at a clean end of data (no bytes, or a zero length
/// marker). A frame cut in the middle or failing its checksum is corruption.
pub fn read_frame<R: Read>(
    reader: &mut R,
    segment: u64,
    offset: u64,
) -> Result<Option<(WalRecord, u32)>, WalError> {
    let corruption = |reason: String| WalError::Corruption {
        segment,
        offset,
        reason,
    };

    let mut len_buf = [0u8; 4];
    let mut filled = 0;
    while filled < len_buf.len() {
        match reader.read(&mut len_buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(WalError::Io(e)),
        }
    }
    if filled == 0 {
        return Ok(None);
    }
    if filled < len_buf.len() {
        return Err(corruption("truncated frame length".into()));
    }

    let len = u32::from_le_bytes(len_buf);
    if len == 0 {
        return Ok(None);
    }

    let mut rest = vec![0u8; len as usize + 4];
    match reader.read_exact(&mut rest) {
        Ok(()) => {}
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => {
            return Err(corruption("truncated record".into()))
        }
        Err(e) => return Err(WalError::Io(e)),
    }

    let (payload, crc_bytes) = rest.split_at(len as usize);
    let stored = u32::from_le_bytes(le4(crc_bytes));
    let mut digest = CRC32.digest();
    digest.update(&len_buf);
    digest.update(payload);
    let actual = digest.finalize();
    if stored != actual {
        return Err(corruption(format!(
            "checksum mismatch: expected {:#x}, got {:#x}",
            stored, actual
        )));
    }

    let record = WalRecord::decode(payload).map_err(|e| corruption(e.to_string()))?;
    Ok(Some((record, len + FRAME_OVERHEAD as u32)))
}

/// File name of an uncompressed segment.
pub fn segment_file_name(index: u64) -> String {
    format!("{:016}.{}", index, SEGMENT_EXT)
}

/// File name of a compacted segment.
pub fn compacted_file_name(index: u64) -> String {
    format!("{:016}.{}.{}", index, SEGMENT_EXT, COMPACTED_EXT)
}

/// Parse a segment file name into `(index, compacted)`.
pub fn parse_segment_file_name(name: &str) -> Option<(u64, bool)> {
    let (stem, compacted) = match name.strip_suffix(&format!(".{}", COMPACTED_EXT)) {
        Some(stem) => (stem, true),
        None => (name, false),
    };
    let index = stem.strip_suffix(&format!(".{}", SEGMENT_EXT))?;
    if index.len() != 16 {
        return None;
    }
    index.parse().ok().map(|i| (i, compacted))
}

/// Where a segment currently lives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SegmentLocation {
    pub path: PathBuf,
    pub compacted: bool,
}

/// Sequential reader over one segment, plain or compacted.
pub enum SegmentReader {
    Plain(BufReader<File>),
    Compacted(FrameDecoder<BufReader<File>>),
}

impl SegmentReader {
    /// Open a segment and validate its header.
    pub fn open(location: &SegmentLocation, expected_index: u64) -> Result<Self, WalError> {
        let file = File::open(&location.path)?;
        let mut reader = if location.compacted {
            SegmentReader::Compacted(FrameDecoder::new(BufReader::new(file)))
        } else {
            SegmentReader::Plain(BufReader::new(file))
        };

        let mut header = [0u8; SEGMENT_HEADER_SIZE];
        match reader.read_exact(&mut header) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => {
                return Err(WalError::Corruption {
                    segment: expected_index,
                    offset: 0,
                    reason: "truncated segment header".into(),
                })
            }
            Err(e) => return Err(WalError::Io(e)),
        }
        let header = SegmentHeader::from_bytes(&header)?;
        if header.index != expected_index {
            return Err(WalError::Corruption {
                segment: expected_index,
                offset: 0,
                reason: format!("header names segment {}", header.index),
            });
        }
        Ok(reader)
    }

    /// Move to `offset`, which must not be before the current position.
    pub fn skip_to(&mut self, current: u64, offset: u64) -> io::Result<()> {
        if offset <= current {
            return Ok(());
        }
        match self {
            SegmentReader::Plain(r) => {
                r.seek(SeekFrom::Start(offset))?;
            }
            SegmentReader::Compacted(r) => {
                let skip = offset - current;
                let copied = io::copy(&mut r.by_ref().take(skip), &mut io::sink())?;
                if copied < skip {
                    return Err(io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        "offset beyond compacted segment",
                    ));
                }
            }
        }
        Ok(())
    }
}

impl Read for SegmentReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            SegmentReader::Plain(r) => r.read(buf),
            SegmentReader::Compacted(r) => r.read(buf),
        }
    }
}

/// Create a new segment file with its header, fsynced.
pub fn create_segment(path: &Path, index: u64) -> io::Result<File> {
    let mut file = fs::OpenOptions::new()
        .create(true)
        .truncate(true)
        .read(true)
        .write(true)
        .open(path)?;
    file.write_all(&SegmentHeader::new(index).to_bytes())?;
    file.sync_all()?;
    Ok(file)
}

/// Copy `src` to `dst` through a temp file and an atomic rename.
pub fn copy_durably(src: &Path, dst: &Path) -> io::Result<u64> {
    let tmp = dst.with_extension("tmp");
    let copied = {
        let mut input = File::open(src)?;
        let mut output = File::create(&tmp)?;
        let n = io::copy(&mut input, &mut output)?;
        output.sync_all()?;
        n
    };
    fs::rename(&tmp, dst)?;
    Ok(copied)
}

/// Compress `src` into `dst` as an LZ4 frame stream through a temp file.
pub fn compress_segment(src: &Path, dst: &Path) -> io::Result<u64> {
    let tmp = dst.with_extension("tmp");
    {
        let mut input = BufReader::new(File::open(src)?);
        let mut encoder = FrameEncoder::new(BufWriter::new(File::create(&tmp)?));
        io::copy(&mut input, &mut encoder)?;
        let writer = encoder
            .finish()
            .map_err(|e| io::Error::other(e.to_string()))?;
        let file = writer
            .into_inner()
            .map_err(|e| io::Error::other(e.to_string()))?;
        file.sync_all()?;
    }
    fs::rename(&tmp, dst)?;
    Ok(fs::metadata(dst)?.len())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wal::record::DataEntry;
    use std::io::Cursor;

    #[test]
    fn test_header_roundtrip() {
        let header = SegmentHeader::new(42);
        let parsed = SegmentHeader::from_bytes(&header.to_bytes()).unwrap();
        assert_eq!(parsed, header);
    }

    #[test]
    fn test_bad_magic_is_corruption() {
        let mut bytes = SegmentHeader::new(1).to_bytes();
        bytes[0] = b'X';
        assert!(matches!(
            SegmentHeader::from_bytes(&bytes),
            Err(WalError::Corruption { .. })
        ));
    }

    #[test]
    fn test_frame_checksum_detects_flip() {
        let record = WalRecord::from(DataEntry::put(1, 0, "k", "v", 1, 1));
        let mut frame = encode_frame(&record).unwrap();

        let (decoded, len) = read_frame(&mut Cursor::new(&frame), 0, 32).unwrap().unwrap();
        assert_eq!(decoded, record);
        assert_eq!(len as usize, frame.len());

        let mid = frame.len() / 2;
        frame[mid] ^= 0xff;
        let err = read_frame(&mut Cursor::new(&frame), 0, 32).unwrap_err();
        assert!(matches!(err, WalError::Corruption { offset: 32, .. }));
    }

    #[test]
    fn test_truncated_frame_is_corruption() {
        let record = WalRecord::Checkpoint { id: 9 };
        let frame = encode_frame(&record).unwrap();
        let cut = &frame[..frame.len() - 3];
        assert!(matches!(
            read_frame(&mut Cursor::new(cut), 0, 32),
            Err(WalError::Corruption { .. })
        ));
        assert!(matches!(
            read_frame(&mut Cursor::new(&frame[..2]), 0, 32),
            Err(WalError::Corruption { .. })
        ));
    }

    #[test]
    fn test_clean_end() {
        assert!(read_frame(&mut Cursor::new(Vec::<u8>::new()), 0, 32)
            .unwrap()
            .is_none());
        assert!(read_frame(&mut Cursor::new(vec![0u8; 8]), 0, 32)
            .unwrap()
            .is_none());
    }

    #[test]
    fn test_file_names() {
        assert_eq!(segment_file_name(7), "0000000000000007.wal");
        assert_eq!(compacted_file_name(7), "0000000000000007.wal.lz4");
        assert_eq!(parse_segment_file_name("0000000000000007.wal"), Some((7, false)));
        assert_eq!(
            parse_segment_file_name("0000000000000007.wal.lz4"),
            Some((7, true))
        );
        assert_eq!(parse_segment_file_name("7.wal"), None);
        assert_eq!(parse_segment_file_name("0000000000000007.tmp"), None);
    }

    #[test]
    fn test_compressed_segment_reads_like_plain() {
        let dir = tempfile::tempdir().unwrap();
        let plain = dir.path().join(segment_file_name(3));
        let mut file = create_segment(&plain, 3).unwrap();
        let record = WalRecord::Checkpoint { id: 1 };
        let frame = encode_frame(&record).unwrap();
        file.write_all(&frame).unwrap();
        file.write_all(&frame).unwrap();
        drop(file);

        let packed = dir.path().join(compacted_file_name(3));
        compress_segment(&plain, &packed).unwrap();

        let location = SegmentLocation {
            path: packed,
            compacted: true,
        };
        let mut reader = SegmentReader::open(&location, 3).unwrap();
        let second = SEGMENT_HEADER_SIZE as u64 + frame.len() as u64;
        reader.skip_to(SEGMENT_HEADER_SIZE as u64, second).unwrap();
        let (decoded, _) = read_frame(&mut reader, 3, second).unwrap().unwrap();
        assert_eq!(decoded, record);
        assert!(read_frame(&mut reader, 3, second).unwrap().is_none());
    }
}
