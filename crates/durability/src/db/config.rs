//! Log database configuration.

use crate::chunk::{ReaderPolicy, ReaderPoolConfig};
use crate::format::{CHUNK_FOOTER_SIZE, CHUNK_HEADER_SIZE};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Smallest accepted chunk capacity.
pub const MIN_CHUNK_SIZE: u32 = 1024;

const DEFAULT_CHUNK_SIZE: u32 = 256 * 1024 * 1024;

/// Log database configuration.
///
/// Built with `with_*` setters and checked by [`DbConfig::validate`]
/// before the database is opened.
#[derive(Debug, Clone)]
pub struct DbConfig {
    /// Directory holding chunk and checkpoint files (ignored when in memory)
    pub path: Option<PathBuf>,

    /// Keep chunks and checkpoints in memory only
    pub in_memory: bool,

    /// Data capacity of one chunk in bytes (default: 256MB)
    pub chunk_size: u32,

    /// Readers opened per chunk up front (default: 2)
    pub initial_reader_count: usize,

    /// Upper bound of concurrent readers per chunk (default: 8)
    pub max_reader_count: usize,

    /// Behaviour when a chunk's reader pool is exhausted
    pub reader_policy: ReaderPolicy,

    /// Reject appends that would grow the log past this many bytes
    pub max_log_size: Option<u64>,

    /// Verify body checksums of completed chunks on open (default: true)
    pub verify_checksums_on_open: bool,

    /// Flush the chaser checkpoint at least every this many records (default: 1000)
    pub chaser_flush_every: usize,

    /// How long the chaser waits for new durable data before re-checking
    pub chaser_wait: Duration,

    /// Bytes of completed chunk files held in memory, newest first
    /// (default: two full chunk files; 0 disables caching)
    pub cached_chunks_size: u64,

    /// How long finished scavenges stay in the history (default: 30 days)
    pub scavenge_history_max_age: Duration,
}

impl Default for DbConfig {
    fn default() -> Self {
        DbConfig {
            path: None,
            in_memory: false,
            chunk_size: DEFAULT_CHUNK_SIZE, // 256MB
            initial_reader_count: 2,
            max_reader_count: 8,
            reader_policy: ReaderPolicy::Block {
                timeout: Duration::from_secs(5),
            },
            max_log_size: None,
            verify_checksums_on_open: true,
            chaser_flush_every: 1000,
            chaser_wait: Duration::from_millis(100),
            cached_chunks_size: 2 * chunk_file_size(DEFAULT_CHUNK_SIZE),
            scavenge_history_max_age: Duration::from_secs(30 * 24 * 60 * 60),
        }
    }
}

/// Largest file a chunk of `chunk_size` data bytes can occupy.
pub fn chunk_file_size(chunk_size: u32) -> u64 {
    (CHUNK_HEADER_SIZE + CHUNK_FOOTER_SIZE) as u64 + u64::from(chunk_size)
}

impl DbConfig {
    /// File-backed database in `path`.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        DbConfig {
            path: Some(path.into()),
            ..Default::default()
        }
    }

    /// In-memory database; nothing survives a restart.
    pub fn in_memory() -> Self {
        DbConfig {
            in_memory: true,
            ..Default::default()
        }
    }

    /// Create a configuration optimized for testing (small chunks).
    pub fn for_testing(path: impl Into<PathBuf>) -> Self {
        DbConfig {
            path: Some(path.into()),
            chunk_size: 64 * 1024, // 64KB for faster rollover in tests
            chaser_flush_every: 1,
            chaser_wait: Duration::from_millis(10),
            ..Default::default()
        }
    }

    /// Set chunk capacity (builder pattern).
    pub fn with_chunk_size(mut self, size: u32) -> Self {
        self.chunk_size = size;
        self
    }

    /// Set reader pool bounds (builder pattern).
    pub fn with_reader_counts(mut self, initial: usize, max: usize) -> Self {
        self.initial_reader_count = initial;
        self.max_reader_count = max;
        self
    }

    /// Set reader pool exhaustion policy (builder pattern).
    pub fn with_reader_policy(mut self, policy: ReaderPolicy) -> Self {
        self.reader_policy = policy;
        self
    }

    /// Cap the total log size (builder pattern).
    pub fn with_max_log_size(mut self, bytes: u64) -> Self {
        self.max_log_size = Some(bytes);
        self
    }

    /// Toggle body checksum verification on open (builder pattern).
    pub fn with_verify_checksums(mut self, verify: bool) -> Self {
        self.verify_checksums_on_open = verify;
        self
    }

    /// Set chaser checkpoint flush cadence (builder pattern).
    pub fn with_chaser_flush_every(mut self, records: usize) -> Self {
        self.chaser_flush_every = records;
        self
    }

    /// Set chaser wait timeout (builder pattern).
    pub fn with_chaser_wait(mut self, wait: Duration) -> Self {
        self.chaser_wait = wait;
        self
    }

    /// Set the chunk cache budget in bytes (builder pattern).
    pub fn with_cached_chunks_size(mut self, bytes: u64) -> Self {
        self.cached_chunks_size = bytes;
        self
    }

    /// Set scavenge history retention (builder pattern).
    pub fn with_scavenge_history_max_age(mut self, max_age: Duration) -> Self {
        self.scavenge_history_max_age = max_age;
        self
    }

    /// Directory for files, `None` when in memory
    pub fn dir(&self) -> Option<&Path> {
        if self.in_memory {
            None
        } else {
            self.path.as_deref()
        }
    }

    /// Reader pool settings for each chunk
    pub fn reader_pool(&self) -> ReaderPoolConfig {
        ReaderPoolConfig {
            initial: self.initial_reader_count,
            max: self.max_reader_count,
            policy: self.reader_policy,
        }
    }

    /// Validate configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !self.in_memory && self.path.is_none() {
            return Err(ConfigError::MissingPath);
        }
        if self.chunk_size < MIN_CHUNK_SIZE {
            return Err(ConfigError::ChunkSizeTooSmall {
                min: MIN_CHUNK_SIZE,
            });
        }
        if self.max_reader_count == 0 || self.initial_reader_count > self.max_reader_count {
            return Err(ConfigError::InvalidReaderCounts {
                initial: self.initial_reader_count,
                max: self.max_reader_count,
            });
        }
        if self.chaser_flush_every == 0 {
            return Err(ConfigError::ChaserFlushEveryZero);
        }
        Ok(())
    }
}

/// Configuration errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    /// File-backed database without a directory
    #[error("Database path is required unless running in memory")]
    MissingPath,

    /// Chunk capacity below the minimum
    #[error("Chunk size must be at least {min} bytes")]
    ChunkSizeTooSmall {
        /// Minimum accepted capacity
        min: u32,
    },

    /// Reader counts out of order or zero
    #[error("Invalid reader counts: initial {initial}, max {max}")]
    InvalidReaderCounts {
        /// Configured initial count
        initial: usize,
        /// Configured max count
        max: usize,
    },

    /// Chaser flush cadence of zero
    #[error("Chaser flush cadence must be at least one record")]
    ChaserFlushEveryZero,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = DbConfig::default();
        assert_eq!(config.chunk_size, 256 * 1024 * 1024);
        assert_eq!(config.initial_reader_count, 2);
        assert_eq!(config.max_reader_count, 8);
        assert!(config.verify_checksums_on_open);
        assert_eq!(config.cached_chunks_size, 2 * (256 * 1024 * 1024 + 128 + 64));
        assert_eq!(
            config.scavenge_history_max_age,
            Duration::from_secs(30 * 24 * 60 * 60)
        );
    }

    #[test]
    fn test_builder_pattern() {
        let config = DbConfig::new("/tmp/db")
            .with_chunk_size(4096)
            .with_reader_counts(1, 3)
            .with_reader_policy(ReaderPolicy::Fail)
            .with_max_log_size(1 << 20)
            .with_chaser_flush_every(10)
            .with_cached_chunks_size(0)
            .with_scavenge_history_max_age(Duration::from_secs(60));

        assert_eq!(config.chunk_size, 4096);
        assert_eq!(config.max_reader_count, 3);
        assert_eq!(config.reader_policy, ReaderPolicy::Fail);
        assert_eq!(config.max_log_size, Some(1 << 20));
        assert_eq!(config.cached_chunks_size, 0);
        assert_eq!(config.scavenge_history_max_age, Duration::from_secs(60));
        assert_eq!(config.dir(), Some(Path::new("/tmp/db")));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validation_missing_path() {
        assert_eq!(DbConfig::default().validate(), Err(ConfigError::MissingPath));
        assert!(DbConfig::in_memory().validate().is_ok());
        assert_eq!(DbConfig::in_memory().dir(), None);
    }

    #[test]
    fn test_validation_chunk_too_small() {
        let config = DbConfig::new("/tmp/db").with_chunk_size(512);
        assert!(matches!(
            config.validate(),
            Err(ConfigError::ChunkSizeTooSmall { .. })
        ));
    }

    #[test]
    fn test_validation_reader_counts() {
        let config = DbConfig::new("/tmp/db").with_reader_counts(4, 2);
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidReaderCounts { .. })
        ));
        let config = DbConfig::new("/tmp/db").with_reader_counts(0, 0);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validation_chaser_flush() {
        let config = DbConfig::new("/tmp/db").with_chaser_flush_every(0);
        assert_eq!(config.validate(), Err(ConfigError::ChaserFlushEveryZero));
    }

    #[test]
    fn test_testing_config() {
        let config = DbConfig::for_testing("/tmp/db");
        assert!(config.validate().is_ok());
        assert!(config.chunk_size < DbConfig::default().chunk_size);
    }
}
