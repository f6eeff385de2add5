//! WAL manager: appends, flushes, archiving, compaction and truncation.

use crate::config::{WalConfig, WalMode};
use crate::error::WalError;
use crate::failure::{FailureContext, FailureProcessor, FailureType};
use crate::metrics::WalMetrics;
use crate::testing::failpoint::{check_io, names, FailpointRegistry};
use crate::wal::events::{WalEvent, WalEventListener};
use crate::wal::iterator::WalIterator;
use crate::wal::pointer::WalPointer;
use crate::wal::record::WalRecord;
use crate::wal::segment::{
    compacted_file_name, compress_segment, copy_durably, create_segment, encode_frame,
    parse_segment_file_name, read_frame, segment_file_name, SegmentLocation, SegmentReader,
    SegmentState, SEGMENT_HEADER_SIZE,
};
use parking_lot::{Condvar, Mutex, RwLock};
use std::collections::BTreeMap;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

/// State of the segment receiving appends.
struct WriterState {
    file: File,
    index: u64,
    position: u64,
    unsynced: bool,
}

/// State shared between the manager, the archiver, the flusher and iterators.
pub(crate) struct WalShared {
    config: WalConfig,
    work_dir: PathBuf,
    archive_dir: PathBuf,
    writer: Mutex<WriterState>,
    segments: RwLock<BTreeMap<u64, SegmentState>>,
    /// Zero-length pointer just past the last appended record.
    end: RwLock<WalPointer>,
    /// Everything before this position is on stable storage.
    flushed: Mutex<WalPointer>,
    listeners: RwLock<Vec<Arc<dyn WalEventListener>>>,
    /// Serializes compaction between the archiver and explicit calls.
    compaction: Mutex<()>,
    failure: Arc<FailureProcessor>,
    failpoints: Option<Arc<FailpointRegistry>>,
    metrics: Arc<WalMetrics>,
    /// Set after a fatal write failure.
    failed: AtomicBool,
    /// Set by `stop`.
    closed: AtomicBool,
}

impl WalShared {
    fn segment_path(&self, index: u64) -> PathBuf {
        self.work_dir.join(segment_file_name(index))
    }

    fn archive_path(&self, index: u64) -> PathBuf {
        self.archive_dir.join(segment_file_name(index))
    }

    fn compacted_path(&self, index: u64) -> PathBuf {
        self.archive_dir.join(compacted_file_name(index))
    }

    pub(crate) fn failpoints(&self) -> Option<&FailpointRegistry> {
        self.failpoints.as_deref()
    }

    pub(crate) fn end(&self) -> WalPointer {
        *self.end.read()
    }

    pub(crate) fn oldest_segment(&self) -> Option<u64> {
        self.segments.read().keys().next().copied()
    }

    pub(crate) fn locate(&self, index: u64) -> Option<SegmentLocation> {
        let state = *self.segments.read().get(&index)?;
        Some(match state {
            SegmentState::Active | SegmentState::Filled => SegmentLocation {
                path: self.segment_path(index),
                compacted: false,
            },
            SegmentState::Archived => SegmentLocation {
                path: self.archive_path(index),
                compacted: false,
            },
            SegmentState::Compacted => SegmentLocation {
                path: self.compacted_path(index),
                compacted: true,
            },
        })
    }

    /// Open a segment for reading. A segment can move between directories
    /// while we resolve it, so a missing file is looked up once more.
    pub(crate) fn open_segment(&self, index: u64) -> Result<SegmentReader, WalError> {
        for _ in 0..2 {
            let location = self.locate(index).ok_or_else(|| WalError::RangeUnavailable {
                requested: WalPointer::segment_start(index),
                oldest: self.oldest_segment(),
            })?;
            match SegmentReader::open(&location, index) {
                Err(WalError::Io(e)) if e.kind() == io::ErrorKind::NotFound => continue,
                other => return other,
            }
        }
        Err(WalError::RangeUnavailable {
            requested: WalPointer::segment_start(index),
            oldest: self.oldest_segment(),
        })
    }

    fn is_writable(&self) -> bool {
        !self.failed.load(Ordering::Acquire) && !self.closed.load(Ordering::Acquire)
    }

    fn publish(&self, event: WalEvent) {
        for listener in self.listeners.read().iter() {
            listener.on_event(&event);
        }
    }

    /// Mark the log unusable and report the failure.
    fn fatal(&self, err: WalError) -> WalError {
        self.failed.store(true, Ordering::Release);
        self.failure
            .process(FailureContext::from_error(FailureType::CriticalError, &err));
        err
    }

    fn sync_locked(&self, writer: &mut WriterState) -> Result<(), WalError> {
        if writer.unsynced {
            let res = check_io(self.failpoints(), names::WAL_FSYNC)
                .and_then(|_| writer.file.sync_data());
            if let Err(e) = res {
                return Err(self.fatal(WalError::WriteFailed {
                    attempts: 1,
                    source: e,
                }));
            }
            writer.unsynced = false;
            self.metrics.fsyncs.inc();
        }
        *self.flushed.lock() = WalPointer::new(writer.index, writer.position as u32, 0);
        Ok(())
    }

    fn flush_all(&self) -> Result<(), WalError> {
        let mut writer = self.writer.lock();
        self.sync_locked(&mut writer)
    }

    fn write_with_retry(&self, writer: &mut WriterState, frame: &[u8]) -> Result<(), WalError> {
        let limit = self.config.write_retry_limit.max(1);
        let mut attempt = 0;
        loop {
            attempt += 1;
            let res = check_io(self.failpoints(), names::WAL_APPEND).and_then(|_| {
                writer.file.seek(SeekFrom::Start(writer.position))?;
                writer.file.write_all(frame)
            });
            match res {
                Ok(()) => return Ok(()),
                Err(e) if attempt < limit => {
                    warn!(
                        segment = writer.index,
                        attempt,
                        limit,
                        error = %e,
                        "WAL append failed, retrying"
                    );
                    self.metrics.write_retries.inc();
                    thread::sleep(self.config.write_retry_delay);
                }
                Err(e) => {
                    return Err(self.fatal(WalError::WriteFailed {
                        attempts: attempt,
                        source: e,
                    }))
                }
            }
        }
    }

    fn rollover(&self, writer: &mut WriterState, archiver: &ArchiverHandle) -> Result<(), WalError> {
        self.sync_locked(writer)?;

        let filled = writer.index;
        let next = filled + 1;
        let file = create_segment(&self.segment_path(next), next).map_err(|e| {
            self.fatal(WalError::WriteFailed {
                attempts: 1,
                source: e,
            })
        })?;

        {
            let mut segments = self.segments.write();
            segments.insert(filled, SegmentState::Filled);
            segments.insert(next, SegmentState::Active);
        }

        writer.file = file;
        writer.index = next;
        writer.position = SEGMENT_HEADER_SIZE as u64;
        writer.unsynced = false;

        let start = WalPointer::segment_start(next);
        *self.end.write() = start;
        *self.flushed.lock() = start;
        self.metrics.current_segment.set(next as i64);

        debug!(filled, next, "WAL segment rollover");
        archiver.enqueue(filled);
        Ok(())
    }

    fn archive_segment(&self, index: u64) -> Result<(), WalError> {
        let src = self.segment_path(index);
        let dst = self.archive_path(index);
        copy_durably(&src, &dst)?;

        {
            let mut segments = self.segments.write();
            match segments.get(&index).copied() {
                Some(SegmentState::Filled) => {
                    segments.insert(index, SegmentState::Archived);
                }
                // Truncated while we were copying.
                None => {
                    drop(segments);
                    let _ = fs::remove_file(&dst);
                    let _ = fs::remove_file(&src);
                    return Ok(());
                }
                Some(_) => {}
            }
        }
        fs::remove_file(&src)?;

        self.metrics.segments_archived.inc();
        self.publish(WalEvent::SegmentArchived {
            index,
            path: dst,
        });

        if self.config.compaction_enabled {
            self.compact_archived()?;
        }
        Ok(())
    }

    fn compact_archived(&self) -> Result<usize, WalError> {
        let _guard = self.compaction.lock();
        let archived: Vec<u64> = self
            .segments
            .read()
            .iter()
            .filter(|(_, state)| **state == SegmentState::Archived)
            .map(|(idx, _)| *idx)
            .collect();

        let keep = self.config.keep_uncompressed_segments;
        if archived.len() <= keep {
            return Ok(0);
        }

        let mut compacted = 0;
        for index in &archived[..archived.len() - keep] {
            let src = self.archive_path(*index);
            let dst = self.compacted_path(*index);
            let compressed_size = match compress_segment(&src, &dst) {
                Ok(size) => size,
                // Truncated under us.
                Err(e)
                    if e.kind() == io::ErrorKind::NotFound
                        && !self.segments.read().contains_key(index) =>
                {
                    let _ = fs::remove_file(dst.with_extension("tmp"));
                    continue;
                }
                Err(e) => return Err(e.into()),
            };

            {
                let mut segments = self.segments.write();
                if segments.get(index) != Some(&SegmentState::Archived) {
                    drop(segments);
                    let _ = fs::remove_file(&dst);
                    continue;
                }
                segments.insert(*index, SegmentState::Compacted);
            }
            fs::remove_file(&src)?;

            compacted += 1;
            self.metrics.segments_compacted.inc();
            self.publish(WalEvent::SegmentCompacted {
                index: *index,
                compressed_size,
            });
        }
        Ok(compacted)
    }
}

/// Sender side of the archiver queue.
struct ArchiverHandle {
    tx: Mutex<Option<mpsc::UnboundedSender<u64>>>,
}

impl ArchiverHandle {
    fn enqueue(&self, index: u64) {
        match self.tx.lock().as_ref() {
            Some(tx) => {
                if tx.send(index).is_err() {
                    warn!(segment = index, "WAL archiver gone, segment left in work directory");
                }
            }
            None => debug!(segment = index, "WAL archiver stopped, segment left in work directory"),
        }
    }

    fn close(&self) {
        self.tx.lock().take();
    }
}

/// Background flusher shutdown signal.
struct FlusherSignal {
    stop: Mutex<bool>,
    cond: Condvar,
}

/// Segmented, checksummed write-ahead log.
///
/// # Example
///
/// ```rust,ignore
/// let wal = WalManager::open(config, wal_dir, archive_dir, failure, None, metrics)?;
/// let p1 = wal.append(&WalRecord::from(entry))?;
/// wal.flush(p1)?;
/// for item in wal.iterator(p1, None)? {
///     let (ptr, record) = item?;
/// }
/// ```
pub struct WalManager {
    shared: Arc<WalShared>,
    archiver: ArchiverHandle,
    archiver_thread: Mutex<Option<JoinHandle<()>>>,
    flusher_signal: Arc<FlusherSignal>,
    flusher_thread: Mutex<Option<JoinHandle<()>>>,
}

impl WalManager {
    /// Open the log, recovering segment state from disk.
    pub fn open(
        config: WalConfig,
        work_dir: impl Into<PathBuf>,
        archive_dir: impl Into<PathBuf>,
        failure: Arc<FailureProcessor>,
        failpoints: Option<Arc<FailpointRegistry>>,
        metrics: Arc<WalMetrics>,
    ) -> Result<Self, WalError> {
        let work_dir = work_dir.into();
        let archive_dir = archive_dir.into();
        fs::create_dir_all(&work_dir)?;
        fs::create_dir_all(&archive_dir)?;
        remove_temp_files(&work_dir)?;
        remove_temp_files(&archive_dir)?;

        let mut segments = scan_archive(&archive_dir)?;
        let mut pending_archive = Vec::new();

        let mut work: Vec<u64> = list_segments(&work_dir)?
            .into_iter()
            .filter(|(_, compacted)| !compacted)
            .map(|(idx, _)| idx)
            .collect();
        work.sort_unstable();

        let active = match work.pop() {
            Some(idx) => idx,
            None => segments.keys().next_back().map(|i| i + 1).unwrap_or(0),
        };

        for idx in work {
            if segments.contains_key(&idx) {
                // Archived copy is complete; the work copy is a leftover.
                fs::remove_file(work_dir.join(segment_file_name(idx)))?;
            } else {
                segments.insert(idx, SegmentState::Filled);
                pending_archive.push(idx);
            }
        }
        segments.insert(active, SegmentState::Active);

        let active_path = work_dir.join(segment_file_name(active));
        let (file, position) = recover_active(&active_path, active)?;

        let end = WalPointer::new(active, position as u32, 0);
        metrics.current_segment.set(active as i64);

        info!(
            dir = %work_dir.display(),
            active,
            position,
            retained = segments.len(),
            "WAL opened"
        );

        let shared = Arc::new(WalShared {
            config,
            work_dir,
            archive_dir,
            writer: Mutex::new(WriterState {
                file,
                index: active,
                position,
                unsynced: false,
            }),
            segments: RwLock::new(segments),
            end: RwLock::new(end),
            flushed: Mutex::new(end),
            listeners: RwLock::new(Vec::new()),
            compaction: Mutex::new(()),
            failure,
            failpoints,
            metrics,
            failed: AtomicBool::new(false),
            closed: AtomicBool::new(false),
        });

        let (tx, rx) = mpsc::unbounded_channel();
        let archiver_thread = spawn_archiver(shared.clone(), rx)?;

        let flusher_signal = Arc::new(FlusherSignal {
            stop: Mutex::new(false),
            cond: Condvar::new(),
        });
        let flusher_thread = if shared.config.mode == WalMode::Background {
            Some(spawn_flusher(shared.clone(), flusher_signal.clone())?)
        } else {
            None
        };

        let manager = Self {
            shared,
            archiver: ArchiverHandle {
                tx: Mutex::new(Some(tx)),
            },
            archiver_thread: Mutex::new(Some(archiver_thread)),
            flusher_signal,
            flusher_thread: Mutex::new(flusher_thread),
        };

        for idx in pending_archive {
            manager.archiver.enqueue(idx);
        }
        Ok(manager)
    }

    pub(crate) fn shared(&self) -> &Arc<WalShared> {
        &self.shared
    }

    /// Register a listener for segment events.
    pub fn add_listener(&self, listener: Arc<dyn WalEventListener>) {
        self.shared.listeners.write().push(listener);
    }

    /// Append a record and return the pointer it occupies.
    ///
    /// In [`WalMode::Fsync`] the record is durable on return. Otherwise it is
    /// durable after [`WalManager::flush`] or the next rollover.
    pub fn append(&self, record: &WalRecord) -> Result<WalPointer, WalError> {
        if !self.shared.is_writable() {
            return Err(WalError::Stopped);
        }

        let frame = encode_frame(record)?;
        let capacity = self.shared.config.segment_size;
        if (frame.len() + SEGMENT_HEADER_SIZE) as u64 > capacity {
            return Err(WalError::RecordTooLarge {
                size: frame.len(),
                capacity,
            });
        }

        let mut writer = self.shared.writer.lock();
        if !self.shared.is_writable() {
            return Err(WalError::Stopped);
        }

        if writer.position + frame.len() as u64 > capacity {
            self.shared.rollover(&mut writer, &self.archiver)?;
        }

        self.shared.write_with_retry(&mut writer, &frame)?;

        let pointer = WalPointer::new(writer.index, writer.position as u32, frame.len() as u32);
        writer.position += frame.len() as u64;
        writer.unsynced = true;
        *self.shared.end.write() = pointer.next();

        self.shared.metrics.records_appended.inc();
        self.shared.metrics.bytes_appended.inc_by(frame.len() as u64);

        if self.shared.config.mode == WalMode::Fsync {
            self.shared.sync_locked(&mut writer)?;
        }
        Ok(pointer)
    }

    /// Block until every record up to and including `pointer` is durable.
    pub fn flush(&self, pointer: WalPointer) -> Result<(), WalError> {
        if pointer.next().position() <= self.shared.flushed.lock().position() {
            return Ok(());
        }
        if self.shared.failed.load(Ordering::Acquire) {
            return Err(WalError::Stopped);
        }
        self.shared.flush_all()
    }

    /// Iterate records from `from` (inclusive) to `to` (exclusive, defaults
    /// to the current end of the log).
    pub fn iterator(
        &self,
        from: WalPointer,
        to: Option<WalPointer>,
    ) -> Result<WalIterator, WalError> {
        WalIterator::open(self.shared.clone(), from, to)
    }

    /// Zero-length pointer just past the last appended record.
    pub fn end_pointer(&self) -> WalPointer {
        self.shared.end()
    }

    /// Index of the oldest retained segment.
    pub fn oldest_segment(&self) -> Option<u64> {
        self.shared.oldest_segment()
    }

    /// Index of the segment receiving appends.
    pub fn current_segment(&self) -> u64 {
        self.shared.writer.lock().index
    }

    /// Lifecycle state of a retained segment.
    pub fn segment_state(&self, index: u64) -> Option<SegmentState> {
        self.shared.segments.read().get(&index).copied()
    }

    /// Compress archived segments beyond the newest `keep_uncompressed_segments`.
    pub fn compact(&self) -> Result<usize, WalError> {
        self.shared.compact_archived()
    }

    /// Delete archived and compacted segments below `segment`.
    ///
    /// Segments that are still active or waiting for the archiver are kept.
    pub fn truncate_before(&self, segment: u64) -> Result<usize, WalError> {
        let removed: Vec<(u64, SegmentState)> = {
            let mut segments = self.shared.segments.write();
            let candidates: Vec<(u64, SegmentState)> = segments
                .range(..segment)
                .filter(|(_, s)| matches!(s, SegmentState::Archived | SegmentState::Compacted))
                .map(|(i, s)| (*i, *s))
                .collect();
            for (idx, _) in &candidates {
                segments.remove(idx);
            }
            candidates
        };

        for (idx, state) in &removed {
            let path = match state {
                SegmentState::Compacted => self.shared.compacted_path(*idx),
                _ => self.shared.archive_path(*idx),
            };
            if let Err(e) = fs::remove_file(&path) {
                if e.kind() != io::ErrorKind::NotFound {
                    warn!(segment = idx, error = %e, "Failed to delete truncated WAL segment");
                }
            }
        }

        if !removed.is_empty() {
            self.shared
                .metrics
                .segments_truncated
                .inc_by(removed.len() as u64);
            self.shared.publish(WalEvent::SegmentsTruncated {
                before: segment,
                count: removed.len(),
            });
        }
        Ok(removed.len())
    }

    /// Wait until the archiver has processed every filled segment, or the timeout passes.
    pub fn await_archived(&self, timeout: std::time::Duration) -> bool {
        let deadline = std::time::Instant::now() + timeout;
        loop {
            let pending = self
                .shared
                .segments
                .read()
                .values()
                .any(|s| *s == SegmentState::Filled);
            if !pending {
                return true;
            }
            if std::time::Instant::now() >= deadline {
                return false;
            }
            thread::sleep(std::time::Duration::from_millis(5));
        }
    }

    /// Whether a fatal write failure disabled the log.
    pub fn is_failed(&self) -> bool {
        self.shared.failed.load(Ordering::Acquire)
    }

    /// Flush, then stop the archiver and the flusher.
    pub fn stop(&self) -> Result<(), WalError> {
        if self.shared.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }

        let flushed = if self.shared.failed.load(Ordering::Acquire) {
            Ok(())
        } else {
            self.shared.flush_all()
        };

        {
            let mut stop = self.flusher_signal.stop.lock();
            *stop = true;
            self.flusher_signal.cond.notify_all();
        }
        if let Some(handle) = self.flusher_thread.lock().take() {
            let _ = handle.join();
        }

        self.archiver.close();
        if let Some(handle) = self.archiver_thread.lock().take() {
            let _ = handle.join();
        }

        info!(dir = %self.shared.work_dir.display(), "WAL stopped");
        flushed
    }
}

impl Drop for WalManager {
    fn drop(&mut self) {
        if let Err(e) = self.stop() {
            warn!(error = %e, "WAL stop on drop failed");
        }
    }
}

impl std::fmt::Debug for WalManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WalManager")
            .field("work_dir", &self.shared.work_dir)
            .field("end", &self.shared.end())
            .field("segments", &self.shared.segments.read().len())
            .finish()
    }
}

fn spawn_archiver(
    shared: Arc<WalShared>,
    mut rx: mpsc::UnboundedReceiver<u64>,
) -> Result<JoinHandle<()>, WalError> {
    let handle = thread::Builder::new()
        .name("wal-archiver".to_string())
        .spawn(move || {
            while let Some(index) = rx.blocking_recv() {
                if let Err(e) = shared.archive_segment(index) {
                    error!(segment = index, error = %e, "Failed to archive WAL segment");
                    shared.failure.process(FailureContext::from_error(
                        FailureType::SystemWorkerTermination,
                        &e,
                    ));
                    return;
                }
            }
            debug!("WAL archiver stopped");
        })?;
    Ok(handle)
}

fn spawn_flusher(
    shared: Arc<WalShared>,
    signal: Arc<FlusherSignal>,
) -> Result<JoinHandle<()>, WalError> {
    let frequency = shared.config.flush_frequency;
    let handle = thread::Builder::new()
        .name("wal-flusher".to_string())
        .spawn(move || loop {
            {
                let mut stop = signal.stop.lock();
                if *stop {
                    break;
                }
                signal.cond.wait_for(&mut stop, frequency);
                if *stop {
                    break;
                }
            }
            if let Err(e) = shared.flush_all() {
                error!(error = %e, "Background WAL flush failed");
                break;
            }
        })?;
    Ok(handle)
}

fn list_segments(dir: &Path) -> Result<Vec<(u64, bool)>, WalError> {
    let mut out = Vec::new();
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        if let Some(parsed) = entry.file_name().to_str().and_then(parse_segment_file_name) {
            out.push(parsed);
        }
    }
    Ok(out)
}

fn scan_archive(dir: &Path) -> Result<BTreeMap<u64, SegmentState>, WalError> {
    let mut segments = BTreeMap::new();
    for (idx, compacted) in list_segments(dir)? {
        if compacted {
            if segments.insert(idx, SegmentState::Compacted) == Some(SegmentState::Archived) {
                fs::remove_file(dir.join(segment_file_name(idx)))?;
            }
        } else if segments.get(&idx) == Some(&SegmentState::Compacted) {
            fs::remove_file(dir.join(segment_file_name(idx)))?;
        } else {
            segments.insert(idx, SegmentState::Archived);
        }
    }
    Ok(segments)
}

fn remove_temp_files(dir: &Path) -> Result<(), WalError> {
    for entry in fs::read_dir(dir)? {
        let path = entry?.path();
        if path.extension().and_then(|e| e.to_str()) == Some("tmp") {
            warn!(path = %path.display(), "Removing leftover WAL temp file");
            fs::remove_file(&path)?;
        }
    }
    Ok(())
}

/// Open the active segment and find the end of its valid records, cutting a
/// torn tail left by a crash.
fn recover_active(path: &Path, index: u64) -> Result<(File, u64), WalError> {
    if !path.exists() {
        return Ok((create_segment(path, index)?, SEGMENT_HEADER_SIZE as u64));
    }

    let location = SegmentLocation {
        path: path.to_path_buf(),
        compacted: false,
    };
    let mut reader = match SegmentReader::open(&location, index) {
        Ok(reader) => reader,
        Err(WalError::Corruption { reason, .. }) => {
            warn!(segment = index, reason = %reason, "Active WAL segment header damaged, recreating");
            return Ok((create_segment(path, index)?, SEGMENT_HEADER_SIZE as u64));
        }
        Err(e) => return Err(e),
    };

    let mut position = SEGMENT_HEADER_SIZE as u64;
    loop {
        match read_frame(&mut reader, index, position) {
            Ok(Some((_, len))) => position += len as u64,
            Ok(None) => break,
            Err(WalError::Corruption { reason, .. }) => {
                warn!(segment = index, offset = position, reason = %reason, "Truncating torn WAL tail");
                break;
            }
            Err(e) => return Err(e),
        }
    }
    drop(reader);

    let file = OpenOptions::new().read(true).write(true).open(path)?;
    if file.metadata()?.len() > position {
        file.set_len(position)?;
        file.sync_all()?;
    }
    Ok((file, position))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::failure::NoOpFailureHandler;
    use crate::testing::failpoint::FailpointAction;
    use crate::wal::record::DataEntry;
    use std::time::Duration;

    fn open_wal(dir: &Path, config: WalConfig) -> WalManager {
        open_wal_with(dir, config, None, Arc::new(FailureProcessor::default()))
    }

    fn open_wal_with(
        dir: &Path,
        config: WalConfig,
        failpoints: Option<Arc<FailpointRegistry>>,
        failure: Arc<FailureProcessor>,
    ) -> WalManager {
        WalManager::open(
            config,
            dir.join("wal"),
            dir.join("archive"),
            failure,
            failpoints,
            Arc::new(WalMetrics::new()),
        )
        .unwrap()
    }

    fn entry(counter: u64) -> WalRecord {
        WalRecord::from(DataEntry::put(
            1,
            0,
            format!("key-{}", counter),
            vec![7u8; 64],
            counter,
            counter,
        ))
    }

    fn small_segments() -> WalConfig {
        WalConfig::default().with_segment_size(1024)
    }

    #[test]
    fn test_append_returns_increasing_pointers() {
        let dir = tempfile::tempdir().unwrap();
        let wal = open_wal(dir.path(), small_segments());

        let mut last = None;
        for i in 1..=50 {
            let ptr = wal.append(&entry(i)).unwrap();
            if let Some(prev) = last {
                assert!(ptr > prev);
            }
            last = Some(ptr);
        }
        assert!(wal.current_segment() > 0);
    }

    #[test]
    fn test_iterator_half_open_range() {
        let dir = tempfile::tempdir().unwrap();
        let wal = open_wal(dir.path(), WalConfig::default());

        let p1 = wal.append(&entry(1)).unwrap();
        let p2 = wal.append(&entry(2)).unwrap();
        let p3 = wal.append(&entry(3)).unwrap();

        let items: Vec<_> = wal
            .iterator(p1, Some(p3))
            .unwrap()
            .map(|r| r.unwrap())
            .collect();
        assert_eq!(items.len(), 2);
        assert_eq!(items[0], (p1, entry(1)));
        assert_eq!(items[1], (p2, entry(2)));
    }

    #[test]
    fn test_iterator_spans_archived_segments_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let wal = open_wal(dir.path(), small_segments());

        let pointers: Vec<_> = (1..=40).map(|i| wal.append(&entry(i)).unwrap()).collect();
        assert!(wal.await_archived(Duration::from_secs(5)));
        assert_eq!(wal.segment_state(0), Some(SegmentState::Archived));

        let read: Vec<_> = wal
            .iterator(pointers[0], None)
            .unwrap()
            .map(|r| r.unwrap())
            .collect();
        assert_eq!(read.len(), 40);
        for (i, (ptr, record)) in read.iter().enumerate() {
            assert_eq!(*ptr, pointers[i]);
            assert_eq!(*record, entry(i as u64 + 1));
        }

        let again: Vec<_> = wal
            .iterator(pointers[0], None)
            .unwrap()
            .map(|r| r.unwrap().0)
            .collect();
        assert_eq!(again, pointers);
    }

    #[test]
    fn test_truncated_range_is_unavailable() {
        let dir = tempfile::tempdir().unwrap();
        let wal = open_wal(dir.path(), small_segments());

        let first = wal.append(&entry(1)).unwrap();
        for i in 2..=40 {
            wal.append(&entry(i)).unwrap();
        }
        assert!(wal.await_archived(Duration::from_secs(5)));

        let removed = wal.truncate_before(2).unwrap();
        assert_eq!(removed, 2);
        assert_eq!(wal.oldest_segment(), Some(2));

        let err = wal.iterator(first, None).unwrap_err();
        assert!(matches!(err, WalError::RangeUnavailable { .. }));
    }

    #[test]
    fn test_compacted_segments_remain_readable() {
        let dir = tempfile::tempdir().unwrap();
        let config = small_segments()
            .with_compaction(true)
            .with_keep_uncompressed_segments(1);
        let wal = open_wal(dir.path(), config);

        let first = wal.append(&entry(1)).unwrap();
        for i in 2..=60 {
            wal.append(&entry(i)).unwrap();
        }
        assert!(wal.await_archived(Duration::from_secs(5)));
        wal.compact().unwrap();
        assert_eq!(wal.segment_state(0), Some(SegmentState::Compacted));

        let count = wal.iterator(first, None).unwrap().map(|r| r.unwrap()).count();
        assert_eq!(count, 60);
    }

    #[test]
    fn test_archived_event_published() {
        struct Collect(Mutex<Vec<WalEvent>>);
        impl WalEventListener for Collect {
            fn on_event(&self, event: &WalEvent) {
                self.0.lock().push(event.clone());
            }
        }

        let dir = tempfile::tempdir().unwrap();
        let wal = open_wal(dir.path(), small_segments());
        let events = Arc::new(Collect(Mutex::new(Vec::new())));
        wal.add_listener(events.clone());

        for i in 1..=20 {
            wal.append(&entry(i)).unwrap();
        }
        assert!(wal.await_archived(Duration::from_secs(5)));

        let seen = events.0.lock();
        assert!(seen
            .iter()
            .any(|e| matches!(e, WalEvent::SegmentArchived { index: 0, .. })));
    }

    #[test]
    fn test_reopen_recovers_and_truncates_torn_tail() {
        let dir = tempfile::tempdir().unwrap();
        let (first, last) = {
            let wal = open_wal(dir.path(), WalConfig::default());
            let first = wal.append(&entry(1)).unwrap();
            let last = wal.append(&entry(2)).unwrap();
            wal.stop().unwrap();
            (first, last)
        };

        // Simulate a crash in the middle of the next append.
        let active = dir.path().join("wal").join(segment_file_name(0));
        let mut file = OpenOptions::new().append(true).open(&active).unwrap();
        file.write_all(&[0x40, 0, 0, 0, 1, 2, 3]).unwrap();
        drop(file);

        let wal = open_wal(dir.path(), WalConfig::default());
        assert_eq!(wal.end_pointer(), last.next());

        let p3 = wal.append(&entry(3)).unwrap();
        assert_eq!(p3.offset, last.next().offset);

        let read: Vec<_> = wal
            .iterator(first, None)
            .unwrap()
            .map(|r| r.unwrap().1)
            .collect();
        assert_eq!(read, vec![entry(1), entry(2), entry(3)]);
    }

    #[test]
    fn test_write_retry_then_success() {
        let dir = tempfile::tempdir().unwrap();
        let failpoints = Arc::new(FailpointRegistry::new());
        failpoints.enable(names::WAL_APPEND, FailpointAction::ErrorOnce);
        let wal = open_wal_with(
            dir.path(),
            WalConfig::default().with_write_retry_limit(3),
            Some(failpoints),
            Arc::new(FailureProcessor::default()),
        );

        let ptr = wal.append(&entry(1)).unwrap();
        let read: Vec<_> = wal.iterator(ptr, None).unwrap().collect();
        assert_eq!(read.len(), 1);
        assert!(!wal.is_failed());
    }

    #[test]
    fn test_write_failure_beyond_retries_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let failpoints = Arc::new(FailpointRegistry::new());
        failpoints.enable(names::WAL_APPEND, FailpointAction::Error);
        let failure = Arc::new(FailureProcessor::new(Arc::new(NoOpFailureHandler)));
        let wal = open_wal_with(
            dir.path(),
            WalConfig::default()
                .with_write_retry_limit(2)
                .with_write_retry_delay(Duration::from_millis(1)),
            Some(failpoints),
            failure.clone(),
        );

        let err = wal.append(&entry(1)).unwrap_err();
        assert!(matches!(err, WalError::WriteFailed { attempts: 2, .. }));
        assert!(wal.is_failed());
        assert!(matches!(wal.append(&entry(2)), Err(WalError::Stopped)));

        let ctx = failure.failure_context().unwrap();
        assert_eq!(ctx.failure_type, FailureType::CriticalError);
        assert!(ctx.error.contains("failpoint"));
    }

    #[test]
    fn test_flush_and_fsync_mode() {
        let dir = tempfile::tempdir().unwrap();
        let metrics = Arc::new(WalMetrics::new());
        let wal = WalManager::open(
            WalConfig::default().with_mode(WalMode::Fsync),
            dir.path().join("wal"),
            dir.path().join("archive"),
            Arc::new(FailureProcessor::default()),
            None,
            metrics.clone(),
        )
        .unwrap();

        let ptr = wal.append(&entry(1)).unwrap();
        assert_eq!(metrics.fsyncs.get(), 1);
        wal.flush(ptr).unwrap();
        assert_eq!(metrics.fsyncs.get(), 1);
    }

    #[test]
    fn test_record_too_large() {
        let dir = tempfile::tempdir().unwrap();
        let wal = open_wal(dir.path(), small_segments());
        let big = WalRecord::from(DataEntry::put(1, 0, "k", vec![0u8; 4096], 1, 1));
        assert!(matches!(
            wal.append(&big),
            Err(WalError::RecordTooLarge { .. })
        ));
    }
}
