//! Error taxonomy for the log engine
//!
//! Each subsystem has its own error enum (`CodecError`, `CheckpointError`,
//! `ConfigError`); all of them convert into [`LogError`], which is what the
//! public API returns.

use crate::checkpoint::CheckpointError;
use crate::db::ConfigError;
use crate::format::CodecError;

/// Result alias used throughout the engine.
pub type LogResult<T> = std::result::Result<T, LogError>;

/// Errors surfaced by the log engine.
#[derive(Debug, thiserror::Error)]
pub enum LogError {
    /// A record frame failed length, checksum or tag validation.
    ///
    /// Fatal to the reading component; never silently skipped.
    #[error("Corrupt record at position {position}: {reason}")]
    CorruptRecord {
        /// Log position where the frame starts
        position: i64,
        /// What failed to validate
        reason: String,
    },

    /// A chunk header, footer or body failed validation.
    #[error("Chunk {chunk} corrupted: {reason}")]
    ChunkCorrupted {
        /// Chunk file name or number range
        chunk: String,
        /// What failed to validate
        reason: String,
    },

    /// Disk or OS error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// The chunk's reader pool had no free reader and the policy is to fail.
    #[error("Reader pool exhausted for chunk #{chunk_number} (max {max_readers})")]
    ReaderPoolExhausted {
        /// First chunk number of the chunk
        chunk_number: u32,
        /// Configured reader cap
        max_readers: usize,
    },

    /// A scavenge run was cancelled before this unit completed.
    #[error("Scavenge cancelled")]
    ScavengeCancelled,

    /// Appending would exceed the configured maximum log size.
    #[error("Database full: appending {size} bytes at {position} exceeds {max_log_size}")]
    DatabaseFull {
        /// Position the append would start at
        position: i64,
        /// Encoded size of the rejected record
        size: usize,
        /// Configured cap
        max_log_size: u64,
    },

    /// Encoded record does not fit in an empty chunk.
    #[error("Record of {size} bytes exceeds chunk capacity {capacity}")]
    RecordTooLarge {
        /// Encoded size
        size: usize,
        /// Chunk data capacity
        capacity: u64,
    },

    /// Checkpoint store failure
    #[error("Checkpoint error: {0}")]
    Checkpoint(#[from] CheckpointError),

    /// Invalid configuration
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// The chaser is not running (stopped or failed earlier).
    #[error("Storage chaser stopped")]
    ChaserStopped,
}

impl LogError {
    /// Wrap a codec failure at `position`.
    pub fn corrupt_record(position: i64, err: CodecError) -> Self {
        LogError::CorruptRecord {
            position,
            reason: err.to_string(),
        }
    }

    /// Chunk validation failure.
    pub fn chunk_corrupted(chunk: impl Into<String>, reason: impl Into<String>) -> Self {
        LogError::ChunkCorrupted {
            chunk: chunk.into(),
            reason: reason.into(),
        }
    }

    /// True for errors a background reader must not retry.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            LogError::CorruptRecord { .. }
                | LogError::ChunkCorrupted { .. }
                | LogError::Io(_)
                | LogError::Checkpoint(_)
        )
    }
}
