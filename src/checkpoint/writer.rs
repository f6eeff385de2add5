//! Checkpoint writer with streaming LZ4 compression and CRC32 integrity.

use crate::checkpoint::format::{
    CheckpointHeader, FormatError, GroupRecord, PartitionRecord, RowEntry, GROUP_RECORD_SIZE,
    HEADER_SIZE, PARTITION_RECORD_SIZE,
};
use crate::wal::WalPointer;
use crc::{Crc, CRC_32_ISCSI};
use lz4_flex::frame::FrameEncoder;
use std::fs::File;
use std::io::{BufWriter, Seek, SeekFrom, Write};
use std::path::Path;

/// CRC-32 calculator (iSCSI polynomial)
pub(crate) const CRC32: Crc<u32> = Crc::<u32>::new(&CRC_32_ISCSI);

enum WriterInner {
    Compressed {
        encoder: FrameEncoder<CrcWriter<BufWriter<File>>>,
    },
    Uncompressed {
        writer: CrcWriter<BufWriter<File>>,
    },
}

/// Wrapper that calculates CRC32 while writing.
struct CrcWriter<W: Write> {
    inner: W,
    digest: crc::Digest<'static, u32>,
}

impl<W: Write> CrcWriter<W> {
    fn new(inner: W) -> Self {
        Self {
            inner,
            digest: CRC32.digest(),
        }
    }

    fn finalize_crc(self) -> (W, u32) {
        (self.inner, self.digest.finalize())
    }
}

impl<W: Write> Write for CrcWriter<W> {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        let n = self.inner.write(buf)?;
        self.digest.update(&buf[..n]);
        Ok(n)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.inner.flush()
    }
}

/// Streams group records, partition records and rows into a checkpoint file,
/// in that order.
/// The header is
/// written as a placeholder and rewritten by [`finalize`](Self::finalize).
pub struct CheckpointWriter {
    inner: WriterInner,
    header: CheckpointHeader,
    group_count: u32,
    partition_count: u32,
    entry_count: u64,
    data_size: u64,
}

impl CheckpointWriter {
    pub fn new(
        path: impl AsRef<Path>,
        id: u64,
        pointer: WalPointer,
        compress: bool,
    ) -> Result<Self, FormatError> {
        let file = File::create(path.as_ref())?;
        let mut buf_writer = BufWriter::new(file);

        let mut header = CheckpointHeader::new(id, pointer);
        header.set_compressed(compress);
        buf_writer.write_all(&header.to_bytes())?;

        let crc_writer = CrcWriter::new(buf_writer);
        let inner = if compress {
            WriterInner::Compressed {
                encoder: FrameEncoder::new(crc_writer),
            }
        } else {
            WriterInner::Uncompressed { writer: crc_writer }
        };

        Ok(Self {
            inner,
            header,
            group_count: 0,
            partition_count: 0,
            entry_count: 0,
            data_size: 0,
        })
    }

    fn writer(&mut self) -> &mut dyn Write {
        match &mut self.inner {
            WriterInner::Compressed { encoder } => encoder,
            WriterInner::Uncompressed { writer } => writer,
        }
    }

    fn write_block(&mut self, bytes: &[u8]) -> Result<(), FormatError> {
        let crc = CRC32.checksum(bytes);
        let writer = self.writer();
        writer.write_all(bytes)?;
        writer.write_all(&crc.to_le_bytes())?;
        self.data_size += bytes.len() as u64 + 4;
        Ok(())
    }

    pub fn write_group(&mut self, record: &GroupRecord) -> Result<(), FormatError> {
        if self.partition_count > 0 || self.entry_count > 0 {
            return Err(FormatError::InvalidHeader(
                "group record written after partitions".into(),
            ));
        }
        let bytes: [u8; GROUP_RECORD_SIZE] = record.to_bytes();
        self.write_block(&bytes)?;
        self.group_count += 1;
        Ok(())
    }

    pub fn write_partition(&mut self, record: &PartitionRecord) -> Result<(), FormatError> {
        if self.entry_count > 0 {
            return Err(FormatError::InvalidHeader(
                "partition record written after rows".into(),
            ));
        }
        let bytes: [u8; PARTITION_RECORD_SIZE] = record.to_bytes();
        self.write_block(&bytes)?;
        self.partition_count += 1;
        Ok(())
    }

    pub fn write_row(&mut self, row: &RowEntry) -> Result<(), FormatError> {
        self.write_block(&row.to_bytes())?;
        self.entry_count += 1;
        Ok(())
    }

    /// Finish compression, append the CRC trailer, rewrite the header and sync.
    pub fn finalize(self) -> Result<CheckpointFileInfo, FormatError> {
        let (mut buf_writer, crc, compressed_size) = match self.inner {
            WriterInner::Compressed { encoder } => {
                let crc_writer = encoder
                    .finish()
                    .map_err(|e| FormatError::CompressionFailed(e.to_string()))?;
                let (mut buf_writer, crc) = crc_writer.finalize_crc();
                let pos = buf_writer.stream_position()?;
                (buf_writer, crc, pos.saturating_sub(HEADER_SIZE as u64))
            }
            WriterInner::Uncompressed { writer } => {
                let (buf_writer, crc) = writer.finalize_crc();
                (buf_writer, crc, self.data_size)
            }
        };

        buf_writer.write_all(&crc.to_le_bytes())?;
        buf_writer.flush()?;

        let mut header = self.header;
        header.group_count = self.group_count;
        header.partition_count = self.partition_count;
        header.entry_count = self.entry_count;
        header.data_size = self.data_size;

        buf_writer.seek(SeekFrom::Start(0))?;
        buf_writer.write_all(&header.to_bytes())?;
        buf_writer.flush()?;

        let file = buf_writer
            .into_inner()
            .map_err(|e| FormatError::Io(std::io::Error::other(e.to_string())))?;
        file.sync_all()?;
        let file_size = file.metadata()?.len();

        Ok(CheckpointFileInfo {
            id: header.id,
            pointer: header.pointer,
            timestamp: header.timestamp,
            partition_count: self.partition_count,
            entry_count: self.entry_count,
            uncompressed_size: self.data_size,
            compressed_size,
            file_size,
            checksum: crc,
        })
    }
}

/// Metadata about a written checkpoint file.
#[derive(Debug, Clone)]
pub struct CheckpointFileInfo {
    pub id: u64,
    /// WAL position of the checkpoint marker.
    pub pointer: WalPointer,
    pub timestamp: u64,
    pub partition_count: u32,
    pub entry_count: u64,
    pub uncompressed_size: u64,
    /// Same as uncompressed if not compressed
    pub compressed_size: u64,
    /// Total file size including header and checksum
    pub file_size: u64,
    pub checksum: u32,
}

impl CheckpointFileInfo {
    /// 1.0 means no compression benefit
    pub fn compression_ratio(&self) -> f64 {
        if self.compressed_size == 0 {
            1.0
        } else {
            self.uncompressed_size as f64 / self.compressed_size as f64
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use tempfile::tempdir;

    fn row(i: u32) -> RowEntry {
        RowEntry {
            group: 1,
            partition: (i % 4) as u16,
            key: Bytes::from(format!("key{:04}", i)),
            value: Some(Bytes::from(format!("value{:04}", i))),
            version: i as u64,
        }
    }

    fn partition(p: u16, counter: u64) -> PartitionRecord {
        PartitionRecord {
            group: 1,
            partition: p,
            counter,
            state: 0,
            has_gaps: false,
            history_from: 0,
        }
    }

    #[test]
    fn test_write_uncompressed() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("cp.bin");

        let mut writer = CheckpointWriter::new(&path, 3, WalPointer::new(0, 64, 20), false).unwrap();
        writer.write_partition(&partition(0, 10)).unwrap();
        writer.write_row(&row(1)).unwrap();
        writer.write_row(&row(2)).unwrap();

        let info = writer.finalize().unwrap();
        assert_eq!(info.id, 3);
        assert_eq!(info.pointer, WalPointer::new(0, 64, 20));
        assert_eq!(info.partition_count, 1);
        assert_eq!(info.entry_count, 2);
        assert!(info.file_size > HEADER_SIZE as u64);
    }

    #[test]
    fn test_write_compressed() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("cp.lz4");

        let mut writer = CheckpointWriter::new(&path, 1, WalPointer::new(0, 0, 1), true).unwrap();
        for i in 0..500 {
            writer.write_row(&row(i)).unwrap();
        }
        let info = writer.finalize().unwrap();
        assert_eq!(info.entry_count, 500);
        assert!(info.compression_ratio() >= 1.0);
    }

    #[test]
    fn test_partition_after_rows_rejected() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("cp.bin");

        let mut writer = CheckpointWriter::new(&path, 1, WalPointer::new(0, 0, 1), false).unwrap();
        writer.write_row(&row(0)).unwrap();
        assert!(writer.write_partition(&partition(0, 1)).is_err());
    }

    #[test]
    fn test_group_after_partitions_rejected() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("cp.bin");

        let mut writer = CheckpointWriter::new(&path, 1, WalPointer::new(0, 0, 1), false).unwrap();
        writer.write_partition(&partition(0, 1)).unwrap();
        let group = GroupRecord {
            group: 1,
            wal_enabled: true,
            history_from: 0,
        };
        assert!(writer.write_group(&group).is_err());
    }
}
