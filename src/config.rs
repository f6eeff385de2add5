//! Configuration types for a storage node.

use crate::error::{Error, Result};
use crate::types::{GroupId, NodeId, PartitionId};
use std::path::PathBuf;
use std::time::Duration;

/// Main configuration for a node.
#[derive(Debug, Clone)]
pub struct NodeConfig {
    /// Unique identifier for this node.
    pub node_id: NodeId,

    /// Stable identifier used to name on-disk directories.
    pub consistent_id: String,

    /// Root directory for the log, checkpoints and metadata.
    pub work_dir: PathBuf,

    /// Write-ahead log configuration.
    pub wal: WalConfig,

    /// Binary metadata store configuration.
    pub metadata: MetadataConfig,

    /// Checkpoint configuration.
    pub checkpoint: CheckpointConfig,

    /// Rebalance configuration.
    pub rebalance: RebalanceConfig,

    /// Exchange configuration.
    pub exchange: ExchangeConfig,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            node_id: 1,
            consistent_id: "node-1".to_string(),
            work_dir: PathBuf::from("./work"),
            wal: WalConfig::default(),
            metadata: MetadataConfig::default(),
            checkpoint: CheckpointConfig::default(),
            rebalance: RebalanceConfig::default(),
            exchange: ExchangeConfig::default(),
        }
    }
}

impl NodeConfig {
    /// Create a config with the given node id and work directory.
    pub fn new(node_id: NodeId, work_dir: impl Into<PathBuf>) -> Self {
        Self {
            node_id,
            consistent_id: format!("node-{}", node_id),
            work_dir: work_dir.into(),
            ..Default::default()
        }
    }

    /// Set the consistent id.
    pub fn with_consistent_id(mut self, id: impl Into<String>) -> Self {
        self.consistent_id = id.into();
        self
    }

    /// Set the WAL configuration.
    pub fn with_wal_config(mut self, wal: WalConfig) -> Self {
        self.wal = wal;
        self
    }

    /// Set the metadata configuration.
    pub fn with_metadata_config(mut self, metadata: MetadataConfig) -> Self {
        self.metadata = metadata;
        self
    }

    /// Set the checkpoint configuration.
    pub fn with_checkpoint_config(mut self, checkpoint: CheckpointConfig) -> Self {
        self.checkpoint = checkpoint;
        self
    }

    /// Set the rebalance configuration.
    pub fn with_rebalance_config(mut self, rebalance: RebalanceConfig) -> Self {
        self.rebalance = rebalance;
        self
    }

    /// Set the exchange configuration.
    pub fn with_exchange_config(mut self, exchange: ExchangeConfig) -> Self {
        self.exchange = exchange;
        self
    }

    /// Directory holding the active WAL segments.
    pub fn wal_dir(&self) -> PathBuf {
        self.work_dir.join("wal").join(&self.consistent_id)
    }

    /// Directory holding archived WAL segments.
    pub fn wal_archive_dir(&self) -> PathBuf {
        self.work_dir.join("wal").join("archive").join(&self.consistent_id)
    }

    /// Directory holding checkpoint files.
    pub fn checkpoint_dir(&self) -> PathBuf {
        self.work_dir.join("cp").join(&self.consistent_id)
    }

    /// Directory holding binary metadata files.
    pub fn metadata_dir(&self) -> PathBuf {
        self.work_dir.join("binary_meta").join(&self.consistent_id)
    }

    /// Check every section for values the node cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.consistent_id.is_empty() {
            return Err(Error::Config("consistent_id must not be empty".into()));
        }
        self.wal.validate()?;
        self.metadata.validate()?;
        self.checkpoint.validate()?;
        self.rebalance.validate()?;
        Ok(())
    }
}

/// When appended records reach stable storage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WalMode {
    /// fsync on every append.
    Fsync,
    /// Hand records to the OS on append, fsync only on explicit flush and rollover.
    LogOnly,
    /// Like `LogOnly`, plus a background thread that flushes periodically.
    Background,
}

/// Write-ahead log configuration.
#[derive(Debug, Clone)]
pub struct WalConfig {
    /// Capacity of one segment file in bytes, header included.
    pub segment_size: u64,

    /// Durability mode.
    pub mode: WalMode,

    /// Flush period for [`WalMode::Background`].
    pub flush_frequency: Duration,

    /// Attempts made for a single append before the failure is fatal.
    pub write_retry_limit: u32,

    /// Pause between append attempts.
    pub write_retry_delay: Duration,

    /// Rewrite older archived segments as LZ4 frames.
    pub compaction_enabled: bool,

    /// Number of newest archived segments kept uncompressed.
    pub keep_uncompressed_segments: usize,
}

impl Default for WalConfig {
    fn default() -> Self {
        Self {
            segment_size: 64 * 1024 * 1024,
            mode: WalMode::LogOnly,
            flush_frequency: Duration::from_secs(2),
            write_retry_limit: 3,
            write_retry_delay: Duration::from_millis(10),
            compaction_enabled: false,
            keep_uncompressed_segments: 2,
        }
    }
}

impl WalConfig {
    /// Set the segment size.
    pub fn with_segment_size(mut self, size: u64) -> Self {
        self.segment_size = size;
        self
    }

    /// Set the durability mode.
    pub fn with_mode(mut self, mode: WalMode) -> Self {
        self.mode = mode;
        self
    }

    /// Set the background flush period.
    pub fn with_flush_frequency(mut self, frequency: Duration) -> Self {
        self.flush_frequency = frequency;
        self
    }

    /// Set the append retry limit.
    pub fn with_write_retry_limit(mut self, limit: u32) -> Self {
        self.write_retry_limit = limit;
        self
    }

    /// Set the pause between append attempts.
    pub fn with_write_retry_delay(mut self, delay: Duration) -> Self {
        self.write_retry_delay = delay;
        self
    }

    /// Enable or disable compaction of archived segments.
    pub fn with_compaction(mut self, enabled: bool) -> Self {
        self.compaction_enabled = enabled;
        self
    }

    /// Set how many archived segments stay uncompressed.
    pub fn with_keep_uncompressed_segments(mut self, count: usize) -> Self {
        self.keep_uncompressed_segments = count;
        self
    }

    fn validate(&self) -> Result<()> {
        if self.segment_size < 1024 {
            return Err(Error::Config(format!(
                "wal segment_size {} is below the 1 KiB minimum",
                self.segment_size
            )));
        }
        if self.segment_size > u32::MAX as u64 {
            return Err(Error::Config("wal segment_size must fit in 32 bits".into()));
        }
        if self.write_retry_limit == 0 {
            return Err(Error::Config("wal write_retry_limit must be at least 1".into()));
        }
        if self.mode == WalMode::Background && self.flush_frequency.is_zero() {
            return Err(Error::Config(
                "background wal mode needs a non-zero flush_frequency".into(),
            ));
        }
        Ok(())
    }
}

/// Binary metadata store configuration.
#[derive(Debug, Clone)]
pub struct MetadataConfig {
    /// Persist metadata files. When disabled, writes complete immediately.
    pub persistence_enabled: bool,

    /// Capacity of the writer queue.
    pub queue_capacity: usize,
}

impl Default for MetadataConfig {
    fn default() -> Self {
        Self {
            persistence_enabled: true,
            queue_capacity: 1024,
        }
    }
}

impl MetadataConfig {
    /// Enable or disable persistence.
    pub fn with_persistence(mut self, enabled: bool) -> Self {
        self.persistence_enabled = enabled;
        self
    }

    /// Set the writer queue capacity.
    pub fn with_queue_capacity(mut self, capacity: usize) -> Self {
        self.queue_capacity = capacity;
        self
    }

    fn validate(&self) -> Result<()> {
        if self.queue_capacity == 0 {
            return Err(Error::Config("metadata queue_capacity must be positive".into()));
        }
        Ok(())
    }
}

/// Checkpoint configuration.
#[derive(Debug, Clone)]
pub struct CheckpointConfig {
    /// Compress checkpoint files using LZ4.
    pub compress: bool,

    /// Number of checkpoints kept on disk. Older history is truncated from the WAL.
    pub history_size: usize,
}

impl Default for CheckpointConfig {
    fn default() -> Self {
        Self {
            compress: true,
            history_size: 8,
        }
    }
}

impl CheckpointConfig {
    /// Enable or disable compression.
    pub fn with_compression(mut self, compress: bool) -> Self {
        self.compress = compress;
        self
    }

    /// Set the number of retained checkpoints.
    pub fn with_history_size(mut self, size: usize) -> Self {
        self.history_size = size;
        self
    }

    fn validate(&self) -> Result<()> {
        if self.history_size == 0 {
            return Err(Error::Config("checkpoint history_size must be at least 1".into()));
        }
        Ok(())
    }
}

/// Rebalance configuration.
#[derive(Debug, Clone)]
pub struct RebalanceConfig {
    /// Maximum records or rows per supply message.
    pub batch_size: usize,

    /// Minimum supplier partition size for which historical rebalance is attempted.
    /// Smaller partitions are always transferred in full.
    pub historical_threshold: u64,

    /// Upper bound on partitions applied in parallel by one demander routine.
    pub max_concurrent_partitions: usize,

    /// First per-attempt timeout when a supplier request fails transiently.
    pub initial_timeout: Duration,

    /// Cap on the per-attempt timeout.
    pub max_timeout: Duration,

    /// Total budget for one supplier request, retries included.
    pub total_timeout: Duration,
}

impl Default for RebalanceConfig {
    fn default() -> Self {
        Self {
            batch_size: 512,
            historical_threshold: 0,
            max_concurrent_partitions: 4,
            initial_timeout: Duration::from_millis(50),
            max_timeout: Duration::from_secs(2),
            total_timeout: Duration::from_secs(10),
        }
    }
}

impl RebalanceConfig {
    /// Set the batch size.
    pub fn with_batch_size(mut self, size: usize) -> Self {
        self.batch_size = size;
        self
    }

    /// Set the historical threshold.
    pub fn with_historical_threshold(mut self, threshold: u64) -> Self {
        self.historical_threshold = threshold;
        self
    }

    /// Set the partition apply parallelism.
    pub fn with_max_concurrent_partitions(mut self, max: usize) -> Self {
        self.max_concurrent_partitions = max;
        self
    }

    /// Set the retry timeouts.
    pub fn with_timeouts(mut self, initial: Duration, max: Duration, total: Duration) -> Self {
        self.initial_timeout = initial;
        self.max_timeout = max;
        self.total_timeout = total;
        self
    }

    fn validate(&self) -> Result<()> {
        if self.batch_size == 0 {
            return Err(Error::Config("rebalance batch_size must be positive".into()));
        }
        if self.max_concurrent_partitions == 0 {
            return Err(Error::Config(
                "rebalance max_concurrent_partitions must be positive".into(),
            ));
        }
        if self.initial_timeout > self.max_timeout {
            return Err(Error::Config(
                "rebalance initial_timeout exceeds max_timeout".into(),
            ));
        }
        Ok(())
    }
}

/// Exchange configuration.
#[derive(Debug, Clone)]
pub struct ExchangeConfig {
    /// Coalesce consecutive queued topology changes into one exchange.
    pub merge_exchanges: bool,
}

impl Default for ExchangeConfig {
    fn default() -> Self {
        Self {
            merge_exchanges: true,
        }
    }
}

impl ExchangeConfig {
    /// Enable or disable exchange merging.
    pub fn with_merge(mut self, merge: bool) -> Self {
        self.merge_exchanges = merge;
        self
    }
}

/// Static description of a cache group.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheGroupConfig {
    /// Group id.
    pub id: GroupId,

    /// Human readable name.
    pub name: String,

    /// Number of partitions.
    pub partitions: PartitionId,

    /// Number of backup copies per partition.
    pub backups: usize,
}

impl CacheGroupConfig {
    pub fn new(id: GroupId, name: impl Into<String>) -> Self {
        Self {
            id,
            name: name.into(),
            partitions: 32,
            backups: 1,
        }
    }

    /// Set the partition count.
    pub fn with_partitions(mut self, partitions: PartitionId) -> Self {
        self.partitions = partitions;
        self
    }

    /// Set the backup count.
    pub fn with_backups(mut self, backups: usize) -> Self {
        self.backups = backups;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        assert!(NodeConfig::default().validate().is_ok());
    }

    #[test]
    fn test_directory_layout() {
        let config = NodeConfig::new(7, "/data").with_consistent_id("abc");
        assert_eq!(config.metadata_dir(), PathBuf::from("/data/binary_meta/abc"));
        assert_eq!(config.wal_dir(), PathBuf::from("/data/wal/abc"));
        assert_eq!(config.wal_archive_dir(), PathBuf::from("/data/wal/archive/abc"));
    }

    #[test]
    fn test_invalid_values_rejected() {
        let config =
            NodeConfig::default().with_wal_config(WalConfig::default().with_segment_size(10));
        assert!(matches!(config.validate(), Err(Error::Config(_))));

        let config = NodeConfig::default()
            .with_rebalance_config(RebalanceConfig::default().with_batch_size(0));
        assert!(config.validate().is_err());

        let config = NodeConfig::default()
            .with_checkpoint_config(CheckpointConfig::default().with_history_size(0));
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_builders() {
        let wal = WalConfig::default()
            .with_mode(WalMode::Fsync)
            .with_compaction(true)
            .with_write_retry_limit(5);
        assert_eq!(wal.mode, WalMode::Fsync);
        assert!(wal.compaction_enabled);
        assert_eq!(wal.write_retry_limit, 5);

        let group = CacheGroupConfig::new(1, "accounts")
            .with_partitions(8)
            .with_backups(2);
        assert_eq!(group.partitions, 8);
        assert_eq!(group.backups, 2);
    }
}
