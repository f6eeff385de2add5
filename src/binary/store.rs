//! Durable per-type metadata files written by a single background worker.
//!
//! Every write of a `<typeId>.bin` file goes through one bounded queue
//! consumed by the `binary-metadata-writer` thread, so at most one writer
//! touches the directory at any time. Files are replaced through a temp file
//! and a rename, so a reader never sees a partially written file.

use crate::binary::metadata::{BinaryMetadata, BinaryMetadataHolder, TypeId, VersionedMetadata};
use crate::error::MetadataError;
use crate::failure::{FailureContext, FailureProcessor, FailureType};
use crate::future::{CompletionFuture, FutureError};
use crate::testing::failpoint::{check_io, names, FailpointRegistry};
use dashmap::DashMap;
use parking_lot::Mutex;
use std::fs::{self, File};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

const FILE_EXT: &str = "bin";

type WriteFuture = CompletionFuture<(), MetadataError>;

/// Key of an in-flight write.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct OperationSyncKey {
    pub type_id: TypeId,
    pub version: i32,
}

enum WriteTask {
    Write {
        metadata: BinaryMetadata,
        version: i32,
    },
    MergeAndWrite {
        metadata: BinaryMetadata,
        reply: CompletionFuture<VersionedMetadata, MetadataError>,
    },
}

struct WriterShared {
    dir: PathBuf,
    futures: DashMap<OperationSyncKey, WriteFuture>,
    /// Highest version on disk per type.
    written: DashMap<TypeId, i32>,
    cancelled: AtomicBool,
    /// Error the pending futures were failed with.
    cause: Mutex<Option<MetadataError>>,
    stopping: AtomicBool,
    failure: Arc<FailureProcessor>,
    failpoints: Option<Arc<FailpointRegistry>>,
}

impl WriterShared {
    fn file_path(&self, type_id: TypeId) -> PathBuf {
        self.dir.join(format!("{}.{}", type_id, FILE_EXT))
    }

    fn write_file(&self, versioned: &VersionedMetadata) -> Result<(), MetadataError> {
        let type_id = versioned.metadata.type_id;
        let bytes = versioned.encode()?;
        let path = self.file_path(type_id);
        let tmp = path.with_extension("tmp");

        let res = (|| -> io::Result<()> {
            check_io(self.failpoints.as_deref(), names::METADATA_WRITE)?;
            let mut file = File::create(&tmp)?;
            file.write_all(&bytes)?;
            file.sync_all()?;
            fs::rename(&tmp, &path)
        })();

        res.map_err(|e| MetadataError::WriteFailed {
            type_id,
            reason: e.to_string(),
        })
    }

    fn read_file(&self, type_id: TypeId) -> Option<VersionedMetadata> {
        let path = self.file_path(type_id);
        let bytes = match fs::read(&path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return None,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Failed to read metadata file");
                return None;
            }
        };
        match VersionedMetadata::decode(&bytes) {
            Ok(meta) => Some(meta),
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Failed to decode metadata file");
                None
            }
        }
    }

    /// Complete every pending future of `type_id` with a version not above `version`.
    fn finish_write(&self, type_id: TypeId, version: i32) {
        let keys: Vec<OperationSyncKey> = self
            .futures
            .iter()
            .filter(|e| e.key().type_id == type_id && e.key().version <= version)
            .map(|e| *e.key())
            .collect();
        for key in keys {
            if let Some((_, fut)) = self.futures.remove(&key) {
                debug!(type_id, version = key.version, "Metadata write future completed");
                fut.complete(Ok(()));
            }
        }
    }

    /// Fail all pending futures and refuse further writes.
    fn cancel(&self, err: &MetadataError) {
        self.cause.lock().get_or_insert_with(|| err.clone());
        self.cancelled.store(true, Ordering::Release);
        let keys: Vec<OperationSyncKey> = self.futures.iter().map(|e| *e.key()).collect();
        for key in keys {
            if let Some((_, fut)) = self.futures.remove(&key) {
                debug!(type_id = key.type_id, version = key.version, "Cancelling metadata write future");
                fut.complete(Err(err.clone()));
            }
        }
    }

    fn reject(task: WriteTask, err: MetadataError) {
        if let WriteTask::MergeAndWrite { reply, .. } = task {
            reply.complete(Err(err));
        }
    }

    fn process(&self, task: WriteTask) -> Result<(), MetadataError> {
        match task {
            WriteTask::Write { metadata, version } => {
                let type_id = metadata.type_id;
                let on_disk = self.written.get(&type_id).map(|v| *v);
                if on_disk.is_some_and(|v| v >= version) {
                    debug!(type_id, version, ?on_disk, "Skipping stale metadata write");
                } else {
                    debug!(type_id, version, "Starting metadata write");
                    self.write_file(&VersionedMetadata { version, metadata })?;
                    self.written.insert(type_id, version);
                }
                self.finish_write(type_id, version);
            }
            WriteTask::MergeAndWrite { metadata, reply } => {
                let type_id = metadata.type_id;
                let merged = match self.read_file(type_id) {
                    Some(existing) => match existing.metadata.merge(&metadata) {
                        Ok((merged, true)) => VersionedMetadata {
                            version: existing.version + 1,
                            metadata: merged,
                        },
                        Ok((_, false)) => {
                            reply.complete(Ok(existing));
                            return Ok(());
                        }
                        Err(e) => {
                            // Schema conflicts are the caller's problem, not the node's.
                            reply.complete(Err(e));
                            return Ok(());
                        }
                    },
                    None => VersionedMetadata {
                        version: 1,
                        metadata,
                    },
                };
                if let Err(e) = self.write_file(&merged) {
                    reply.complete(Err(e.clone()));
                    return Err(e);
                }
                self.written
                    .entry(type_id)
                    .and_modify(|v| *v = (*v).max(merged.version))
                    .or_insert(merged.version);
                self.finish_write(type_id, merged.version);
                reply.complete(Ok(merged));
            }
        }
        Ok(())
    }

    fn run(self: Arc<Self>, mut rx: mpsc::Receiver<WriteTask>) {
        while let Some(task) = rx.blocking_recv() {
            if self.cancelled.load(Ordering::Acquire) {
                Self::reject(task, MetadataError::Stopped);
                break;
            }
            if let Err(e) = self.process(task) {
                error!(error = %e, "Failed to save binary metadata");
                self.cancel(&e);
                self.failure
                    .process(FailureContext::from_error(FailureType::CriticalError, &e));
                break;
            }
        }

        rx.close();
        while let Ok(task) = rx.try_recv() {
            let cause = self.cause.lock().clone().unwrap_or(MetadataError::Stopped);
            Self::reject(task, cause);
        }

        if !self.stopping.load(Ordering::Acquire) && !self.cancelled.load(Ordering::Acquire) {
            let err = MetadataError::Stopped;
            self.cancel(&err);
            self.failure.process(FailureContext::from_error(
                FailureType::SystemWorkerTermination,
                &err,
            ));
        }
        debug!("Metadata writer stopped");
    }
}

/// Persistent binary metadata store with an in-memory cache.
pub struct BinaryMetadataFileStore {
    persistence_enabled: bool,
    cache: DashMap<TypeId, BinaryMetadataHolder>,
    shared: Arc<WriterShared>,
    tx: Mutex<Option<mpsc::Sender<WriteTask>>>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl BinaryMetadataFileStore {
    /// Create the store. With persistence disabled no thread is started and
    /// every write completes immediately.
    pub fn new(
        dir: impl Into<PathBuf>,
        persistence_enabled: bool,
        queue_capacity: usize,
        failure: Arc<FailureProcessor>,
        failpoints: Option<Arc<FailpointRegistry>>,
    ) -> Result<Self, MetadataError> {
        let dir = dir.into();
        let shared = Arc::new(WriterShared {
            dir,
            futures: DashMap::new(),
            written: DashMap::new(),
            cancelled: AtomicBool::new(false),
            cause: Mutex::new(None),
            stopping: AtomicBool::new(false),
            failure,
            failpoints,
        });

        let (tx, worker) = if persistence_enabled {
            fs::create_dir_all(&shared.dir).map_err(|e| MetadataError::WriteFailed {
                type_id: 0,
                reason: format!("cannot create {}: {}", shared.dir.display(), e),
            })?;
            let (tx, rx) = mpsc::channel(queue_capacity.max(1));
            let worker_shared = shared.clone();
            let handle = thread::Builder::new()
                .name("binary-metadata-writer".to_string())
                .spawn(move || worker_shared.run(rx))
                .map_err(|e| MetadataError::WriteFailed {
                    type_id: 0,
                    reason: format!("cannot start writer: {}", e),
                })?;
            (Some(tx), Some(handle))
        } else {
            (None, None)
        };

        Ok(Self {
            persistence_enabled,
            cache: DashMap::new(),
            shared,
            tx: Mutex::new(tx),
            worker: Mutex::new(worker),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.shared.dir
    }

    /// Load every persisted type into the cache. Unreadable files are
    /// skipped with a warning.
    pub fn restore(&self) -> usize {
        if !self.persistence_enabled {
            return 0;
        }
        let entries = match fs::read_dir(&self.shared.dir) {
            Ok(entries) => entries,
            Err(e) => {
                warn!(dir = %self.shared.dir.display(), error = %e, "Cannot list metadata directory");
                return 0;
            }
        };

        let mut restored = 0;
        for entry in entries.flatten() {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some(FILE_EXT) {
                continue;
            }
            let loaded = fs::read(&path)
                .map_err(|e| MetadataError::Serialization(e.to_string()))
                .and_then(|bytes| VersionedMetadata::decode(&bytes));
            match loaded {
                Ok(v) => {
                    self.shared.written.insert(v.metadata.type_id, v.version);
                    self.cache.insert(
                        v.metadata.type_id,
                        BinaryMetadataHolder::new(v.metadata, v.version, v.version),
                    );
                    restored += 1;
                }
                Err(e) => {
                    warn!(file = %path.display(), error = %e, "Failed to restore metadata from file");
                }
            }
        }
        info!(dir = %self.shared.dir.display(), restored, "Binary metadata restored");
        restored
    }

    /// Cached metadata of a type.
    pub fn metadata(&self, type_id: TypeId) -> Option<BinaryMetadata> {
        self.cache.get(&type_id).map(|h| h.metadata.clone())
    }

    pub fn holder(&self, type_id: TypeId) -> Option<BinaryMetadataHolder> {
        self.cache.get(&type_id).map(|h| h.clone())
    }

    /// Register a future write of `(type_id, version)` so waiters can block on it.
    pub fn prepare_to_write(&self, type_id: TypeId, version: i32) {
        if !self.persistence_enabled || self.shared.cancelled.load(Ordering::Acquire) {
            return;
        }
        debug!(type_id, version, "Prepare metadata write");
        self.shared
            .futures
            .entry(OperationSyncKey { type_id, version })
            .or_default();
    }

    /// Queue a write of `metadata` as `version`.
    pub fn write_async(&self, metadata: BinaryMetadata, version: i32) -> Result<(), MetadataError> {
        if !self.persistence_enabled {
            return Ok(());
        }
        self.prepare_to_write(metadata.type_id, version);
        debug!(
            type_id = metadata.type_id,
            type_name = %metadata.type_name,
            version,
            "Submitting metadata write"
        );
        self.submit(WriteTask::Write { metadata, version })
    }

    fn submit(&self, task: WriteTask) -> Result<(), MetadataError> {
        if self.shared.cancelled.load(Ordering::Acquire) {
            return Err(MetadataError::Stopped);
        }
        let tx = self.tx.lock().clone().ok_or(MetadataError::Stopped)?;
        tx.blocking_send(task).map_err(|_| MetadataError::Stopped)
    }

    /// Block until `(type_id, version)` is on disk, then mark it accepted. A
    /// negative version, or a version that was never prepared, returns
    /// immediately.
    pub fn wait_for_write(&self, type_id: TypeId, version: i32) -> Result<(), MetadataError> {
        if version < 0 {
            return Ok(());
        }
        if !self.persistence_enabled {
            self.accept(type_id, version);
            return Ok(());
        }
        let fut = self
            .shared
            .futures
            .get(&OperationSyncKey { type_id, version })
            .map(|f| f.clone());
        let Some(fut) = fut else {
            if self.shared.cancelled.load(Ordering::Acquire) {
                return Err(self
                    .shared
                    .cause
                    .lock()
                    .clone()
                    .unwrap_or(MetadataError::Stopped));
            }
            if self.shared.written.get(&type_id).is_some_and(|v| *v >= version) {
                self.accept(type_id, version);
            }
            return Ok(());
        };
        debug!(type_id, version, "Waiting for metadata write");
        match fut.get() {
            Ok(()) => {
                self.accept(type_id, version);
                Ok(())
            }
            Err(FutureError::Cancelled) => Err(MetadataError::Cancelled {
                reason: "write cancelled".into(),
            }),
            Err(FutureError::Failed(e)) => Err(e),
        }
    }

    /// Merge `metadata` with what is on disk and write the result. Blocks
    /// until the file is replaced.
    pub fn merge_and_write(&self, metadata: BinaryMetadata) -> Result<BinaryMetadata, MetadataError> {
        if !self.persistence_enabled {
            return self.register_in_cache(metadata).map(|(m, _)| m);
        }
        let reply = CompletionFuture::new();
        self.submit(WriteTask::MergeAndWrite {
            metadata,
            reply: reply.clone(),
        })?;
        let versioned = match reply.get() {
            Ok(v) => v,
            Err(FutureError::Cancelled) => {
                return Err(MetadataError::Cancelled {
                    reason: "merge cancelled".into(),
                })
            }
            Err(FutureError::Failed(e)) => return Err(e),
        };
        let type_id = versioned.metadata.type_id;
        self.cache.insert(
            type_id,
            BinaryMetadataHolder::new(
                versioned.metadata.clone(),
                versioned.version,
                versioned.version,
            ),
        );
        Ok(versioned.metadata)
    }

    /// Merge `metadata` into the cache and queue a write if it changed.
    ///
    /// Returns the merged metadata and the version to wait for, or `-1` when
    /// nothing new was registered.
    pub fn register(&self, metadata: BinaryMetadata) -> Result<(BinaryMetadata, i32), MetadataError> {
        let (merged, version) = self.register_in_cache(metadata)?;
        if version >= 0 {
            self.write_async(merged.clone(), version)?;
        }
        Ok((merged, version))
    }

    fn register_in_cache(&self, metadata: BinaryMetadata) -> Result<(BinaryMetadata, i32), MetadataError> {
        let type_id = metadata.type_id;
        let mut entry = self
            .cache
            .entry(type_id)
            .or_insert_with(|| BinaryMetadataHolder::new(BinaryMetadata::new(type_id, metadata.type_name.clone()), 0, 0));

        let (merged, changed) = entry.metadata.merge(&metadata)?;
        if !changed {
            return Ok((merged, -1));
        }
        entry.metadata = merged.clone();
        entry.pending_version += 1;
        Ok((merged, entry.pending_version))
    }

    /// Mark `version` of a type as durable in the cache. Never moves past
    /// the pending version.
    fn accept(&self, type_id: TypeId, version: i32) {
        if let Some(mut holder) = self.cache.get_mut(&type_id) {
            let accepted = version.min(holder.pending_version);
            if accepted > holder.accepted_version {
                debug!(type_id, version = accepted, "Metadata version accepted");
                holder.accepted_version = accepted;
            }
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.shared.cancelled.load(Ordering::Acquire)
    }

    /// Drain the queue, stop the writer and fail anything still pending.
    pub fn stop(&self) {
        self.shared.stopping.store(true, Ordering::Release);
        self.tx.lock().take();
        if let Some(handle) = self.worker.lock().take() {
            if handle.join().is_err() {
                error!("Metadata writer panicked");
            }
        }
        self.shared.cancel(&MetadataError::Cancelled {
            reason: "node is stopping".into(),
        });
    }
}

impl Drop for BinaryMetadataFileStore {
    fn drop(&mut self) {
        self.stop();
    }
}

impl std::fmt::Debug for BinaryMetadataFileStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BinaryMetadataFileStore")
            .field("dir", &self.shared.dir)
            .field("persistence_enabled", &self.persistence_enabled)
            .field("types", &self.cache.len())
            .field("pending", &self.shared.futures.len())
            .finish()
    }
}
