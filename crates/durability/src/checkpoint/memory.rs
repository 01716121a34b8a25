//! Volatile checkpoint

use super::{Checkpoint, CheckpointError, CheckpointName, UNSET};
use std::sync::atomic::{AtomicI64, Ordering};

/// Checkpoint held only in memory. Lost on restart.
#[derive(Debug)]
pub struct InMemoryCheckpoint {
    name: CheckpointName,
    last: AtomicI64,
    last_flushed: AtomicI64,
}

impl InMemoryCheckpoint {
    /// New unset checkpoint
    pub fn new(name: CheckpointName) -> Self {
        Self::with_value(name, UNSET)
    }

    /// New checkpoint already flushed at `value`
    pub fn with_value(name: CheckpointName, value: i64) -> Self {
        InMemoryCheckpoint {
            name,
            last: AtomicI64::new(value),
            last_flushed: AtomicI64::new(value),
        }
    }
}

impl Checkpoint for InMemoryCheckpoint {
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
        let value = self.last.load(Ordering::Acquire);
        self.last_flushed.store(value, Ordering::Release);
        Ok(())
    }
}
