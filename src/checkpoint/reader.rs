//! Checkpoint reader with streaming LZ4 decompression.

use crate::checkpoint::format::{
    CheckpointHeader, FormatError, GroupRecord, PartitionRecord, RowEntry, GROUP_RECORD_SIZE,
    HEADER_SIZE, PARTITION_RECORD_SIZE,
};
use crate::checkpoint::writer::CRC32;
use lz4_flex::frame::FrameDecoder;
use std::fs::File;
use std::io::{self, BufReader, Read, Seek, SeekFrom, Take};
use std::path::Path;

/// Upper bound for a single key or value, guards against garbage lengths.
const MAX_FIELD_LEN: usize = 64 * 1024 * 1024;

/// Wrapper that calculates CRC32 while reading.
struct CrcReader<R: Read> {
    inner: R,
    digest: crc::Digest<'static, u32>,
}

impl<R: Read> CrcReader<R> {
    fn new(inner: R) -> Self {
        Self {
            inner,
            digest: CRC32.digest(),
        }
    }

    fn current_crc(&self) -> u32 {
        self.digest.clone().finalize()
    }
}

impl<R: Read> Read for CrcReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.inner.read(buf)?;
        self.digest.update(&buf[..n]);
        Ok(n)
    }
}

type DataReader = CrcReader<Take<BufReader<File>>>;

enum ReaderInner {
    Compressed { decoder: FrameDecoder<DataReader> },
    Uncompressed { reader: DataReader },
}

/// Decoded body of a checkpoint file.
#[derive(Debug, Clone, Default)]
pub struct CheckpointData {
    pub groups: Vec<GroupRecord>,
    pub partitions: Vec<PartitionRecord>,
    pub rows: Vec<RowEntry>,
}

/// Reads a checkpoint file: header, group records, partition records, then rows.
///
/// The data block is bounded so the CRC covers exactly the stored bytes,
/// compressed or not. [`verify`](Self::verify) checks it against the trailer.
pub struct CheckpointReader {
    header: CheckpointHeader,
    inner: ReaderInner,
    stored_crc: u32,
    groups_read: u32,
    partitions_read: u32,
    entries_read: u64,
}

impl CheckpointReader {
    /// Open a checkpoint file. Only the header and the CRC trailer are read.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, FormatError> {
        let file = File::open(path.as_ref())?;
        let file_size = file.metadata()?.len();
        if file_size < HEADER_SIZE as u64 + 4 {
            return Err(FormatError::InvalidHeader("file too small".into()));
        }
        let mut reader = BufReader::new(file);

        let mut header_buf = [0u8; HEADER_SIZE];
        reader.read_exact(&mut header_buf)?;
        let header = CheckpointHeader::from_bytes(&header_buf)?;

        reader.seek(SeekFrom::End(-4))?;
        let mut crc_buf = [0u8; 4];
        reader.read_exact(&mut crc_buf)?;
        let stored_crc = u32::from_le_bytes(crc_buf);

        reader.seek(SeekFrom::Start(HEADER_SIZE as u64))?;
        let data_len = file_size - HEADER_SIZE as u64 - 4;
        let crc_reader = CrcReader::new(reader.take(data_len));

        let inner = if header.is_compressed() {
            ReaderInner::Compressed {
                decoder: FrameDecoder::new(crc_reader),
            }
        } else {
            ReaderInner::Uncompressed { reader: crc_reader }
        };

        Ok(Self {
            header,
            inner,
            stored_crc,
            groups_read: 0,
            partitions_read: 0,
            entries_read: 0,
        })
    }

    pub fn header(&self) -> &CheckpointHeader {
        &self.header
    }

    fn reader(&mut self) -> &mut dyn Read {
        match &mut self.inner {
            ReaderInner::Compressed { decoder } => decoder,
            ReaderInner::Uncompressed { reader } => reader,
        }
    }

    fn read_exact(&mut self, buf: &mut [u8]) -> Result<(), FormatError> {
        self.reader().read_exact(buf).map_err(|e| match e.kind() {
            io::ErrorKind::UnexpectedEof => FormatError::UnexpectedEof,
            _ => FormatError::Io(e),
        })
    }

    fn read_u32(&mut self, body: &mut Vec<u8>) -> Result<u32, FormatError> {
        let mut buf = [0u8; 4];
        self.read_exact(&mut buf)?;
        body.extend_from_slice(&buf);
        Ok(u32::from_le_bytes(buf))
    }

    fn read_field(&mut self, len: usize, body: &mut Vec<u8>) -> Result<(), FormatError> {
        if len > MAX_FIELD_LEN {
            return Err(FormatError::InvalidHeader(format!("field length {}", len)));
        }
        let start = body.len();
        body.resize(start + len, 0);
        self.read_exact(&mut body[start..])
    }

    fn check_crc(&mut self, body: &[u8]) -> Result<(), FormatError> {
        let mut crc_buf = [0u8; 4];
        self.read_exact(&mut crc_buf)?;
        let expected = u32::from_le_bytes(crc_buf);
        let actual = CRC32.checksum(body);
        if expected != actual {
            return Err(FormatError::EntryCorrupted { expected, actual });
        }
        Ok(())
    }

    /// Read all group records. Must be called before reading partitions.
    pub fn read_groups(&mut self) -> Result<Vec<GroupRecord>, FormatError> {
        let mut out = Vec::with_capacity(self.header.group_count as usize);
        while self.groups_read < self.header.group_count {
            let mut buf = [0u8; GROUP_RECORD_SIZE];
            self.read_exact(&mut buf)?;
            self.check_crc(&buf)?;
            out.push(GroupRecord::from_bytes(&buf)?);
            self.groups_read += 1;
        }
        Ok(out)
    }

    /// Read all partition records. Must be called before reading rows;
    /// unread group records are skipped.
    pub fn read_partitions(&mut self) -> Result<Vec<PartitionRecord>, FormatError> {
        if self.groups_read < self.header.group_count {
            self.read_groups()?;
        }
        let mut out = Vec::with_capacity(self.header.partition_count as usize);
        while self.partitions_read < self.header.partition_count {
            let mut buf = [0u8; PARTITION_RECORD_SIZE];
            self.read_exact(&mut buf)?;
            self.check_crc(&buf)?;
            out.push(PartitionRecord::from_bytes(&buf)?);
            self.partitions_read += 1;
        }
        Ok(out)
    }

    /// Read the next row, `None` after the last one.
    pub fn read_row(&mut self) -> Result<Option<RowEntry>, FormatError> {
        if self.partitions_read < self.header.partition_count {
            self.read_partitions()?;
        }
        if self.entries_read >= self.header.entry_count {
            return Ok(None);
        }

        let mut body = Vec::with_capacity(64);
        let mut prefix = [0u8; 6];
        self.read_exact(&mut prefix)?;
        body.extend_from_slice(&prefix);

        let key_len = self.read_u32(&mut body)? as usize;
        self.read_field(key_len, &mut body)?;

        let mut has_value = [0u8; 1];
        self.read_exact(&mut has_value)?;
        body.push(has_value[0]);
        if has_value[0] != 0 {
            let value_len = self.read_u32(&mut body)? as usize;
            self.read_field(value_len, &mut body)?;
        }
        self.read_field(8, &mut body)?;
        self.check_crc(&body)?;

        let (row, _) = RowEntry::from_bytes(&body)?;
        self.entries_read += 1;
        Ok(Some(row))
    }

    /// Read every remaining row and verify the file checksum.
    pub fn read_all(mut self) -> Result<CheckpointData, FormatError> {
        let groups = self.read_groups()?;
        let partitions = self.read_partitions()?;
        let mut rows = Vec::with_capacity(self.header.entry_count as usize);
        while let Some(row) = self.read_row()? {
            rows.push(row);
        }
        self.verify()?;
        Ok(CheckpointData {
            groups,
            partitions,
            rows,
        })
    }

    /// Consume the rest of the data block and compare its CRC with the trailer.
    pub fn verify(mut self) -> Result<(), FormatError> {
        io::copy(self.reader(), &mut io::sink())?;
        let crc_reader = match &mut self.inner {
            ReaderInner::Compressed { decoder } => decoder.get_mut(),
            ReaderInner::Uncompressed { reader } => reader,
        };
        io::copy(crc_reader, &mut io::sink())?;

        let actual = crc_reader.current_crc();
        if actual != self.stored_crc {
            return Err(FormatError::ChecksumMismatch {
                expected: self.stored_crc,
                actual,
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checkpoint::writer::CheckpointWriter;
    use crate::wal::WalPointer;
    use bytes::Bytes;
    use std::path::PathBuf;
    use tempfile::tempdir;

    fn write_file(path: &PathBuf, compress: bool, rows: u32) {
        let mut writer = CheckpointWriter::new(path, 2, WalPointer::new(1, 10, 5), compress).unwrap();
        writer
            .write_group(&GroupRecord {
                group: 7,
                wal_enabled: false,
                history_from: 2,
            })
            .unwrap();
        for p in 0..3u16 {
            writer
                .write_partition(&PartitionRecord {
                    group: 7,
                    partition: p,
                    counter: 100 + p as u64,
                    state: 1,
                    has_gaps: p == 2,
                    history_from: p as u64,
                })
                .unwrap();
        }
        for i in 0..rows {
            writer
                .write_row(&RowEntry {
                    group: 7,
                    partition: (i % 3) as u16,
                    key: Bytes::from(format!("k{}", i)),
                    value: if i % 5 == 0 {
                        None
                    } else {
                        Some(Bytes::from(format!("v{}", i)))
                    },
                    version: i as u64,
                })
                .unwrap();
        }
        writer.finalize().unwrap();
    }

    #[test]
    fn test_read_uncompressed() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("cp.bin");
        write_file(&path, false, 20);

        let reader = CheckpointReader::open(&path).unwrap();
        assert_eq!(reader.header().id, 2);
        assert_eq!(reader.header().pointer, WalPointer::new(1, 10, 5));

        let data = reader.read_all().unwrap();
        assert_eq!(data.groups.len(), 1);
        assert!(!data.groups[0].wal_enabled);
        assert_eq!(data.groups[0].history_from, 2);
        assert_eq!(data.partitions.len(), 3);
        assert!(data.partitions[2].has_gaps);
        assert_eq!(data.partitions[1].counter, 101);
        assert_eq!(data.partitions[1].history_from, 1);
        assert_eq!(data.rows.len(), 20);
        assert_eq!(data.rows[0].value, None);
        assert_eq!(data.rows[1].value, Some(Bytes::from("v1")));
    }

    #[test]
    fn test_read_compressed() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("cp.lz4");
        write_file(&path, true, 1000);

        let reader = CheckpointReader::open(&path).unwrap();
        assert!(reader.header().is_compressed());
        let rows = reader.read_all().unwrap().rows;
        assert_eq!(rows.len(), 1000);
        assert_eq!(rows[999].key, Bytes::from("k999"));
    }

    #[test]
    fn test_corrupted_entry_detected() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("cp.bin");
        write_file(&path, false, 5);

        let mut bytes = std::fs::read(&path).unwrap();
        // Flip a byte inside the first row's key.
        let offset = HEADER_SIZE + (GROUP_RECORD_SIZE + 4) + 3 * (PARTITION_RECORD_SIZE + 4) + 10;
        bytes[offset] ^= 0xFF;
        std::fs::write(&path, &bytes).unwrap();

        let reader = CheckpointReader::open(&path).unwrap();
        assert!(matches!(
            reader.read_all(),
            Err(FormatError::EntryCorrupted { .. })
        ));
    }

    #[test]
    fn test_trailer_mismatch_detected() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("cp.lz4");
        write_file(&path, true, 50);

        let mut bytes = std::fs::read(&path).unwrap();
        let last = bytes.len() - 1;
        bytes[last] ^= 0xFF;
        std::fs::write(&path, &bytes).unwrap();

        let reader = CheckpointReader::open(&path).unwrap();
        assert!(matches!(
            reader.read_all(),
            Err(FormatError::ChecksumMismatch { .. })
        ));
    }

    #[test]
    fn test_truncated_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("short.bin");
        std::fs::write(&path, [0u8; 10]).unwrap();
        assert!(CheckpointReader::open(&path).is_err());
    }
}
