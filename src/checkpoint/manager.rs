//! Checkpointer: writes checkpoint files, keeps the history and drives WAL retention.

use crate::checkpoint::format::{FormatError, GroupRecord, PartitionRecord, RowEntry};
use crate::checkpoint::reader::CheckpointReader;
use crate::checkpoint::writer::CheckpointWriter;
use crate::config::CheckpointConfig;
use crate::counters::{CheckpointEntry, CheckpointHistory};
use crate::error::Result;
use crate::wal::{WalManager, WalPointer, WalRecord};
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};

const FILE_PREFIX: &str = "checkpoint-";
const FILE_SUFFIX: &str = ".cp";

pub fn checkpoint_file_name(id: u64) -> String {
    format!("{}{:016x}{}", FILE_PREFIX, id, FILE_SUFFIX)
}

fn parse_checkpoint_file_name(name: &str) -> Option<u64> {
    let hex = name.strip_prefix(FILE_PREFIX)?.strip_suffix(FILE_SUFFIX)?;
    u64::from_str_radix(hex, 16).ok()
}

/// Everything a checkpoint persists, collected under the node's write barrier.
#[derive(Debug, Clone, Default)]
pub struct CheckpointSnapshot {
    pub groups: Vec<GroupRecord>,
    pub partitions: Vec<PartitionRecord>,
    pub rows: Vec<RowEntry>,
}

/// Information about a checkpoint file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckpointInfo {
    pub path: PathBuf,
    pub id: u64,
    pub pointer: WalPointer,
    pub timestamp: u64,
    pub partition_count: u32,
    pub entry_count: u64,
    pub file_size: u64,
}

/// The newest valid checkpoint found on disk.
#[derive(Debug, Clone)]
pub struct RecoveredCheckpoint {
    pub info: CheckpointInfo,
    pub groups: Vec<GroupRecord>,
    pub partitions: Vec<PartitionRecord>,
    pub rows: Vec<RowEntry>,
}

pub struct Checkpointer {
    dir: PathBuf,
    config: CheckpointConfig,
    history: Arc<CheckpointHistory>,
    next_id: AtomicU64,
    last: RwLock<Option<CheckpointInfo>>,
    /// Serializes checkpoints and retention.
    lock: Mutex<()>,
}

impl Checkpointer {
    pub fn new(
        dir: impl Into<PathBuf>,
        config: CheckpointConfig,
        history: Arc<CheckpointHistory>,
    ) -> std::result::Result<Self, FormatError> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        Self::cleanup_temp_files(&dir)?;

        Ok(Self {
            dir,
            config,
            history,
            next_id: AtomicU64::new(1),
            last: RwLock::new(None),
            lock: Mutex::new(()),
        })
    }

    /// Remove orphaned .tmp files from an interrupted checkpoint.
    fn cleanup_temp_files(dir: &Path) -> std::result::Result<(), FormatError> {
        for entry in fs::read_dir(dir)? {
            let path = entry?.path();
            if path.is_file() && path.extension().is_some_and(|ext| ext == "tmp") {
                debug!(path = %path.display(), "Removing orphaned temp file");
                if let Err(e) = fs::remove_file(&path) {
                    warn!(path = %path.display(), error = %e, "Failed to remove temp file");
                }
            }
        }
        Ok(())
    }

    pub fn history(&self) -> &Arc<CheckpointHistory> {
        &self.history
    }

    pub fn last_checkpoint(&self) -> Option<CheckpointInfo> {
        self.last.read().clone()
    }

    fn path_of(&self, id: u64) -> PathBuf {
        self.dir.join(checkpoint_file_name(id))
    }

    /// Take a checkpoint.
    ///
    /// The caller must hold its write barrier so that no update lands between
    /// the snapshot and the WAL marker.
    pub fn checkpoint(&self, wal: &WalManager, snapshot: CheckpointSnapshot) -> Result<CheckpointInfo> {
        let _guard = self.lock.lock();
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);

        let pointer = wal.append(&WalRecord::Checkpoint { id })?;
        wal.flush(pointer)?;

        let final_path = self.path_of(id);
        let temp_path = self.dir.join(format!("{}.tmp", checkpoint_file_name(id)));

        let mut writer = CheckpointWriter::new(&temp_path, id, pointer, self.config.compress)?;
        for group in &snapshot.groups {
            writer.write_group(group)?;
        }
        for partition in &snapshot.partitions {
            writer.write_partition(partition)?;
        }
        for row in &snapshot.rows {
            writer.write_row(row)?;
        }
        let file = writer.finalize()?;

        if let Err(e) = fs::rename(&temp_path, &final_path) {
            let _ = fs::remove_file(&temp_path);
            return Err(FormatError::Io(e).into());
        }

        let counters: HashMap<_, _> = snapshot
            .partitions
            .iter()
            .filter(|p| !p.has_gaps)
            .map(|p| (p.id(), p.counter))
            .collect();
        self.history
            .on_checkpoint(CheckpointEntry::new(id, pointer, counters));

        let info = CheckpointInfo {
            path: final_path,
            id,
            pointer,
            timestamp: file.timestamp,
            partition_count: file.partition_count,
            entry_count: file.entry_count,
            file_size: file.file_size,
        };
        *self.last.write() = Some(info.clone());

        self.apply_retention(wal)?;

        info!(
            checkpoint = id,
            %pointer,
            partitions = file.partition_count,
            entry_count = file.entry_count,
            file_size = file.file_size,
            compression_ratio = format!("{:.2}", file.compression_ratio()),
            "Checkpoint finished"
        );
        Ok(info)
    }

    /// Keep `history_size` checkpoints and truncate the WAL below the oldest one,
    /// never past a pointer a supplier has reserved.
    fn apply_retention(&self, wal: &WalManager) -> Result<()> {
        let keep = self.config.history_size.max(1);
        for entry in self.history.retain_last(keep) {
            let path = self.path_of(entry.id);
            debug!(checkpoint = entry.id, path = %path.display(), "Removing old checkpoint");
            if let Err(e) = fs::remove_file(&path) {
                warn!(path = %path.display(), error = %e, "Failed to remove old checkpoint");
            }
        }

        let Some(oldest) = self.history.oldest() else {
            return Ok(());
        };
        let bound = match self.history.min_reserved() {
            Some(reserved) => reserved.min(oldest.pointer),
            None => oldest.pointer,
        };
        let truncated = wal.truncate_before(bound.segment)?;
        if truncated > 0 {
            info!(before = bound.segment, count = truncated, "WAL truncated after checkpoint");
        }
        Ok(())
    }

    /// List checkpoint files with a readable header, oldest first.
    pub fn list_checkpoints(&self) -> std::result::Result<Vec<CheckpointInfo>, FormatError> {
        let mut checkpoints = Vec::new();
        for entry in fs::read_dir(&self.dir)? {
            let entry = entry?;
            let path = entry.path();
            let Some(id) = path
                .file_name()
                .and_then(|n| n.to_str())
                .and_then(parse_checkpoint_file_name)
            else {
                continue;
            };

            match CheckpointReader::open(&path) {
                Ok(reader) => {
                    let header = reader.header();
                    checkpoints.push(CheckpointInfo {
                        path: path.clone(),
                        id,
                        pointer: header.pointer,
                        timestamp: header.timestamp,
                        partition_count: header.partition_count,
                        entry_count: header.entry_count,
                        file_size: entry.metadata()?.len(),
                    });
                }
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "Failed to read checkpoint header");
                }
            }
        }
        checkpoints.sort_by_key(|c| c.id);
        Ok(checkpoints)
    }

    /// Rebuild the history from every valid checkpoint and return the newest one.
    ///
    /// The WAL state and history starts saved by the newest checkpoint are
    /// applied to the entries of the older ones. Corrupt files are skipped
    /// with a warning.
    pub fn recover(&self) -> std::result::Result<Option<RecoveredCheckpoint>, FormatError> {
        let _guard = self.lock.lock();
        let checkpoints = self.list_checkpoints()?;
        if let Some(max) = checkpoints.iter().map(|c| c.id).max() {
            self.next_id.store(max + 1, Ordering::SeqCst);
        }

        let mut newest: Option<RecoveredCheckpoint> = None;
        for info in checkpoints.into_iter().rev() {
            let loaded = CheckpointReader::open(&info.path).and_then(|r| r.read_all());
            match loaded {
                Ok(data) => {
                    let counters: HashMap<_, _> = data
                        .partitions
                        .iter()
                        .filter(|p| !p.has_gaps)
                        .map(|p| (p.id(), p.counter))
                        .collect();
                    self.history
                        .on_checkpoint(CheckpointEntry::new(info.id, info.pointer, counters));
                    if newest.is_none() {
                        newest = Some(RecoveredCheckpoint {
                            info,
                            groups: data.groups,
                            partitions: data.partitions,
                            rows: data.rows,
                        });
                    }
                }
                Err(e) => {
                    warn!(
                        checkpoint = info.id,
                        path = %info.path.display(),
                        error = %e,
                        "Skipping corrupt checkpoint"
                    );
                }
            }
        }

        if let Some(recovered) = &newest {
            self.history
                .restore(recovered.info.id, &recovered.groups, &recovered.partitions);
            *self.last.write() = Some(recovered.info.clone());
            info!(
                checkpoint = recovered.info.id,
                pointer = %recovered.info.pointer,
                rows = recovered.rows.len(),
                history = self.history.len(),
                "Checkpoint recovered"
            );
        }
        Ok(newest)
    }
}

impl std::fmt::Debug for Checkpointer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Checkpointer")
            .field("dir", &self.dir)
            .field("next_id", &self.next_id.load(Ordering::Relaxed))
            .field("history", &self.history.len())
            .finish()
    }
}
