//! Checkpoint store
//!
//! A checkpoint is a named 64-bit position marker used for recovery and
//! coordination. `-1` means unset.
//!
//! Two implementations share the [`Checkpoint`] capability:
//!
//! - **InMemory**: volatile, lost on restart; used by in-memory databases and tests
//! - **File**: one 16-byte file per checkpoint, flushed via write-fsync-rename
//!
//! # Contract
//!
//! `write` is volatile until `flush`. `read` returns the last flushed value,
//! `read_non_flushed` the last written one. A crash between `write` and
//! `flush` leaves the previous flushed value on disk, never a torn value.
//!
//! The Writer flushes its checkpoint only after the chunk bytes it covers are
//! durable, so a flushed Writer value never points past durable data.

pub mod file;
pub mod memory;

pub use file::FileCheckpoint;
pub use memory::InMemoryCheckpoint;

use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Value of a checkpoint that has never been set.
pub const UNSET: i64 = -1;

/// Names of the checkpoints kept by a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CheckpointName {
    /// End of durable log data
    Writer,
    /// End of the data the chaser has processed
    Chaser,
    /// Position of the last epoch record
    Epoch,
    /// Last proposed epoch number
    Proposal,
    /// Crash-recovery directive: truncate the log here on next open
    Truncate,
    /// Replicated position
    Replication,
    /// Indexed position
    Index,
}

impl CheckpointName {
    /// Every checkpoint name, in file-creation order
    pub const ALL: [CheckpointName; 7] = [
        CheckpointName::Writer,
        CheckpointName::Chaser,
        CheckpointName::Epoch,
        CheckpointName::Proposal,
        CheckpointName::Truncate,
        CheckpointName::Replication,
        CheckpointName::Index,
    ];

    /// Short name used for files and logging
    pub fn as_str(&self) -> &'static str {
        match self {
            CheckpointName::Writer => "writer",
            CheckpointName::Chaser => "chaser",
            CheckpointName::Epoch => "epoch",
            CheckpointName::Proposal => "proposal",
            CheckpointName::Truncate => "truncate",
            CheckpointName::Replication => "replication",
            CheckpointName::Index => "index",
        }
    }

    /// Checkpoint file path inside `dir`
    pub fn file_path(&self, dir: &Path) -> PathBuf {
        dir.join(format!("{}.chk", self.as_str()))
    }
}

impl std::fmt::Display for CheckpointName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Named position marker.
///
/// Implementations must be `Send + Sync`; each checkpoint has a single
/// writer but may be read from any thread.
pub trait Checkpoint: Send + Sync {
    /// Which checkpoint this is
    fn name(&self) -> CheckpointName;

    /// Last flushed value
    fn read(&self) -> i64;

    /// Last written value, flushed or not
    fn read_non_flushed(&self) -> i64;

    /// Record a new value; volatile until [`Checkpoint::flush`]
    fn write(&self, value: i64);

    /// Make the last written value durable
    fn flush(&self) -> Result<(), CheckpointError>;
}

/// The seven checkpoints of a node.
#[derive(Clone)]
pub struct CheckpointSet {
    /// End of durable log data
    pub writer: Arc<dyn Checkpoint>,
    /// Chaser progress
    pub chaser: Arc<dyn Checkpoint>,
    /// Last epoch position
    pub epoch: Arc<dyn Checkpoint>,
    /// Last proposed epoch
    pub proposal: Arc<dyn Checkpoint>,
    /// Truncation directive
    pub truncate: Arc<dyn Checkpoint>,
    /// Replication progress
    pub replication: Arc<dyn Checkpoint>,
    /// Index progress
    pub index: Arc<dyn Checkpoint>,
}

impl CheckpointSet {
    /// Open (or create) file-backed checkpoints in `dir`.
    pub fn open(dir: &Path) -> Result<Self, CheckpointError> {
        std::fs::create_dir_all(dir)?;
        let open = |name| -> Result<Arc<dyn Checkpoint>, CheckpointError> {
            Ok(Arc::new(FileCheckpoint::open(dir, name, UNSET)?))
        };
        Ok(CheckpointSet {
            writer: open(CheckpointName::Writer)?,
            chaser: open(CheckpointName::Chaser)?,
            epoch: open(CheckpointName::Epoch)?,
            proposal: open(CheckpointName::Proposal)?,
            truncate: open(CheckpointName::Truncate)?,
            replication: open(CheckpointName::Replication)?,
            index: open(CheckpointName::Index)?,
        })
    }

    /// Volatile checkpoints, all unset.
    pub fn in_memory() -> Self {
        let mem = |name| -> Arc<dyn Checkpoint> { Arc::new(InMemoryCheckpoint::new(name)) };
        CheckpointSet {
            writer: mem(CheckpointName::Writer),
            chaser: mem(CheckpointName::Chaser),
            epoch: mem(CheckpointName::Epoch),
            proposal: mem(CheckpointName::Proposal),
            truncate: mem(CheckpointName::Truncate),
            replication: mem(CheckpointName::Replication),
            index: mem(CheckpointName::Index),
        }
    }

    /// Look up a checkpoint by name
    pub fn get(&self, name: CheckpointName) -> &Arc<dyn Checkpoint> {
        match name {
            CheckpointName::Writer => &self.writer,
            CheckpointName::Chaser => &self.chaser,
            CheckpointName::Epoch => &self.epoch,
            CheckpointName::Proposal => &self.proposal,
            CheckpointName::Truncate => &self.truncate,
            CheckpointName::Replication => &self.replication,
            CheckpointName::Index => &self.index,
        }
    }

    /// Flush every checkpoint
    pub fn flush_all(&self) -> Result<(), CheckpointError> {
        for name in CheckpointName::ALL {
            self.get(name).flush()?;
        }
        Ok(())
    }
}

impl std::fmt::Debug for CheckpointSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut s = f.debug_struct("CheckpointSet");
        for name in CheckpointName::ALL {
            s.field(name.as_str(), &self.get(name).read_non_flushed());
        }
        s.finish()
    }
}

/// Checkpoint store errors.
#[derive(Debug, thiserror::Error)]
pub enum CheckpointError {
    /// IO error reading or flushing a checkpoint file
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Checkpoint file content failed validation
    #[error("Checkpoint {name} corrupted: {reason}")]
    Corrupted {
        /// Checkpoint name
        name: CheckpointName,
        /// What failed to validate
        reason: String,
    },
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_in_memory_set_starts_unset() {
        let set = CheckpointSet::in_memory();
        for name in CheckpointName::ALL {
            assert_eq!(set.get(name).read(), UNSET);
            assert_eq!(set.get(name).name(), name);
        }
    }

    #[test]
    fn test_file_set_persists_across_open() {
        let dir = tempdir().unwrap();
        {
            let set = CheckpointSet::open(dir.path()).unwrap();
            set.writer.write(4096);
            set.chaser.write(1024);
            set.flush_all().unwrap();
        }
        let set = CheckpointSet::open(dir.path()).unwrap();
        assert_eq!(set.writer.read(), 4096);
        assert_eq!(set.chaser.read(), 1024);
        assert_eq!(set.truncate.read(), UNSET);
        assert!(CheckpointName::Writer.file_path(dir.path()).exists());
    }

    #[test]
    fn test_checkpoint_names() {
        assert_eq!(CheckpointName::Writer.to_string(), "writer");
        assert_eq!(
            CheckpointName::Truncate.file_path(Path::new("/db")),
            PathBuf::from("/db/truncate.chk")
        );
    }
}
