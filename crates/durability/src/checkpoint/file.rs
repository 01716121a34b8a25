//! File-backed checkpoint.
//!
//! # Binary Format (16 bytes)
//!
//! ```text
//! magic("ECHK", 4) + value(i64, 8) + crc32(4) = 16 bytes
//! ```
//!
//! Flushes go through `<name>.chk.tmp`: write, fsync, rename over
//! `<name>.chk`, fsync the parent directory. A leftover temp file from an
//! interrupted flush is removed on open.

use super::{Checkpoint, CheckpointError, CheckpointName};
use parking_lot::Mutex;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicI64, Ordering};
use tracing::{debug, warn};

/// Magic bytes for checkpoint files.
pub const CHECKPOINT_MAGIC: &[u8; 4] = b"ECHK";

/// Size of a checkpoint file in bytes.
pub const CHECKPOINT_FILE_SIZE: usize = 16;

/// Checkpoint persisted in its own file.
#[derive(Debug)]
pub struct FileCheckpoint {
    name: CheckpointName,
    path: PathBuf,
    last: AtomicI64,
    last_flushed: AtomicI64,
    flush_lock: Mutex<()>,
}

impl FileCheckpoint {
    /// Open the checkpoint file in `dir`, creating it at `init_value` if absent.
    pub fn open(dir: &Path, name: CheckpointName, init_value: i64) -> Result<Self, CheckpointError> {
        let path = name.file_path(dir);
        let temp_path = temp_path(&path);
        if temp_path.exists() {
            warn!(target: "eventlog::checkpoint", checkpoint = %name, "Removing interrupted checkpoint flush");
            std::fs::remove_file(&temp_path)?;
        }

        let value = if path.exists() {
            let bytes = std::fs::read(&path)?;
            decode(name, &bytes)?
        } else {
            write_durably(&path, init_value)?;
            debug!(target: "eventlog::checkpoint", checkpoint = %name, value = init_value, "Created checkpoint file");
            init_value
        };

        Ok(FileCheckpoint {
            name,
            path,
            last: AtomicI64::new(value),
            last_flushed: AtomicI64::new(value),
            flush_lock: Mutex::new(()),
        })
    }

    /// Path of the checkpoint file
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Checkpoint for FileCheckpoint {
    fn name(&self) -> CheckpointName {
        self.name
    }

    fn read(&self) -> i64 {
        self.last_flushed.load(Ordering::Acquire)
    }

    fn read_non_flushed(&self) -> i64 {
        self.last.load(Ordering::Acquire)
    }

    fn write(&self, value: i64) {
        self.last.store(value, Ordering::Release);
    }

    fn flush(&self) -> Result<(), CheckpointError> {
        let _guard = self.flush_lock.lock();
        let value = self.last.load(Ordering::Acquire);
        if value == self.last_flushed.load(Ordering::Acquire) {
            return Ok(());
        }
        write_durably(&self.path, value)?;
        self.last_flushed.store(value, Ordering::Release);
        Ok(())
    }
}

fn temp_path(path: &Path) -> PathBuf {
    path.with_extension("chk.tmp")
}

fn encode(value: i64) -> [u8; CHECKPOINT_FILE_SIZE] {
    let mut bytes = [0u8; CHECKPOINT_FILE_SIZE];
    bytes[0..4].copy_from_slice(CHECKPOINT_MAGIC);
    bytes[4..12].copy_from_slice(&value.to_le_bytes());
    let crc = crc32fast::hash(&bytes[0..12]);
    bytes[12..16].copy_from_slice(&crc.to_le_bytes());
    bytes
}

fn decode(name: CheckpointName, bytes: &[u8]) -> Result<i64, CheckpointError> {
    let corrupted = |reason: &str| CheckpointError::Corrupted {
        name,
        reason: reason.to_string(),
    };
    if bytes.len() != CHECKPOINT_FILE_SIZE {
        return Err(corrupted("wrong file size"));
    }
    if &bytes[0..4] != CHECKPOINT_MAGIC {
        return Err(corrupted("invalid magic"));
    }
    let mut crc = [0u8; 4];
    crc.copy_from_slice(&bytes[12..16]);
    if u32::from_le_bytes(crc) != crc32fast::hash(&bytes[0..12]) {
        return Err(corrupted("checksum mismatch"));
    }
    let mut value = [0u8; 8];
    value.copy_from_slice(&bytes[4..12]);
    Ok(i64::from_le_bytes(value))
}

fn write_durably(path: &Path, value: i64) -> Result<(), CheckpointError> {
    let temp_path = temp_path(path);

    let mut file = OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(true)
        .open(&temp_path)?;
    file.write_all(&encode(value))?;
    file.sync_all()?;
    drop(file);

    std::fs::rename(&temp_path, path)?;

    // Sync parent directory
    if let Some(parent) = path.parent() {
        if parent.exists() {
            File::open(parent)?.sync_all()?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checkpoint::UNSET;
    use tempfile::tempdir;

    #[test]
    fn test_created_at_init_value() {
        let dir = tempdir().unwrap();
        let chk = FileCheckpoint::open(dir.path(), CheckpointName::Epoch, UNSET).unwrap();
        assert_eq!(chk.read(), UNSET);
        assert_eq!(
            std::fs::metadata(chk.path()).unwrap().len(),
            CHECKPOINT_FILE_SIZE as u64
        );
    }

    #[test]
    fn test_unflushed_write_lost_on_reopen() {
        let dir = tempdir().unwrap();
        {
            let chk = FileCheckpoint::open(dir.path(), CheckpointName::Writer, UNSET).unwrap();
            chk.write(10);
            chk.flush().unwrap();
            chk.write(20);
            assert_eq!(chk.read(), 10);
            assert_eq!(chk.read_non_flushed(), 20);
        }
        let chk = FileCheckpoint::open(dir.path(), CheckpointName::Writer, UNSET).unwrap();
        assert_eq!(chk.read(), 10);
    }

    #[test]
    fn test_stale_temp_file_removed() {
        let dir = tempdir().unwrap();
        let path = CheckpointName::Chaser.file_path(dir.path());
        std::fs::write(temp_path(&path), [0xAB; 7]).unwrap();

        let chk = FileCheckpoint::open(dir.path(), CheckpointName::Chaser, 5).unwrap();
        assert_eq!(chk.read(), 5);
        assert!(!temp_path(&path).exists());
    }

    #[test]
    fn test_corrupt_file_rejected() {
        let dir = tempdir().unwrap();
        {
            let chk = FileCheckpoint::open(dir.path(), CheckpointName::Writer, 0).unwrap();
            chk.write(99);
            chk.flush().unwrap();
        }
        let path = CheckpointName::Writer.file_path(dir.path());
        let mut bytes = std::fs::read(&path).unwrap();
        bytes[6] ^= 0xFF;
        std::fs::write(&path, &bytes).unwrap();

        let err = FileCheckpoint::open(dir.path(), CheckpointName::Writer, 0).unwrap_err();
        assert!(matches!(err, CheckpointError::Corrupted { .. }));

        std::fs::write(&path, [0u8; 3]).unwrap();
        assert!(FileCheckpoint::open(dir.path(), CheckpointName::Writer, 0).is_err());
    }

    #[test]
    fn test_encode_decode() {
        for value in [UNSET, 0, 1, i64::MAX] {
            assert_eq!(decode(CheckpointName::Index, &encode(value)).unwrap(), value);
        }
    }
}
