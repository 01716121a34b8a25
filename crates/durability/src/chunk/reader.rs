//! Bounded per-chunk reader pool.
//!
//! Each chunk hands out at most `max` readers at a time. A reader owns a
//! file handle (or nothing, for in-memory chunks) and returns it to the pool
//! when dropped. When the pool is exhausted the caller either blocks up to a
//! timeout or fails immediately with `ReaderPoolExhausted`.

use super::{Chunk, FrameRead};
use crate::error::{LogError, LogResult};
use eventlog_core::LogRecord;
use parking_lot::{Condvar, Mutex};
use std::fs::File;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// What to do when every reader of a chunk is in use.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReaderPolicy {
    /// Wait for a reader to be released, failing after `timeout`
    Block {
        /// Maximum wait
        timeout: Duration,
    },
    /// Fail immediately
    Fail,
}

/// Reader pool bounds for one chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReaderPoolConfig {
    /// Handles opened up front
    pub initial: usize,
    /// Maximum handles in use at once
    pub max: usize,
    /// Exhaustion policy
    pub policy: ReaderPolicy,
}

impl Default for ReaderPoolConfig {
    fn default() -> Self {
        ReaderPoolConfig {
            initial: 1,
            max: 4,
            policy: ReaderPolicy::Block {
                timeout: Duration::from_secs(5),
            },
        }
    }
}

/// Read access to a chunk's bytes.
#[derive(Debug)]
pub(crate) enum ReaderHandle {
    File(File),
    Memory,
}

struct PoolState {
    idle: Vec<ReaderHandle>,
    in_use: usize,
}

pub(crate) struct ReaderPool {
    config: ReaderPoolConfig,
    state: Mutex<PoolState>,
    released: Condvar,
}

impl ReaderPool {
    pub(crate) fn new(config: ReaderPoolConfig, initial: Vec<ReaderHandle>) -> Self {
        ReaderPool {
            config,
            state: Mutex::new(PoolState {
                idle: initial,
                in_use: 0,
            }),
            released: Condvar::new(),
        }
    }

    /// Take a handle, opening a new one with `open` if under the cap.
    pub(crate) fn acquire(
        &self,
        chunk_number: u32,
        open: impl FnOnce() -> std::io::Result<ReaderHandle>,
    ) -> LogResult<ReaderHandle> {
        let mut state = self.state.lock();
        let deadline = match self.config.policy {
            ReaderPolicy::Block { timeout } => Some(Instant::now() + timeout),
            ReaderPolicy::Fail => None,
        };

        loop {
            if let Some(handle) = state.idle.pop() {
                state.in_use += 1;
                return Ok(handle);
            }
            if state.in_use < self.config.max {
                state.in_use += 1;
                drop(state);
                return match open() {
                    Ok(handle) => Ok(handle),
                    Err(e) => {
                        self.state.lock().in_use -= 1;
                        self.released.notify_one();
                        Err(e.into())
                    }
                };
            }

            let exhausted = LogError::ReaderPoolExhausted {
                chunk_number,
                max_readers: self.config.max,
            };
            match deadline {
                None => return Err(exhausted),
                Some(deadline) => {
                    if self.released.wait_until(&mut state, deadline).timed_out()
                        && state.idle.is_empty()
                        && state.in_use >= self.config.max
                    {
                        return Err(exhausted);
                    }
                }
            }
        }
    }

    pub(crate) fn release(&self, handle: ReaderHandle) {
        let mut state = self.state.lock();
        state.in_use = state.in_use.saturating_sub(1);
        state.idle.push(handle);
        drop(state);
        self.released.notify_one();
    }

    #[cfg(test)]
    pub(crate) fn in_use(&self) -> usize {
        self.state.lock().in_use
    }
}

/// A reader bound to one chunk.
///
/// Holds the chunk alive, so a chunk swapped out by a scavenge stays
/// readable (and its file on disk) until the last reader is dropped.
pub struct ChunkReader {
    chunk: Arc<Chunk>,
    handle: ReaderHandle,
}

impl ChunkReader {
    pub(crate) fn new(chunk: Arc<Chunk>, handle: ReaderHandle) -> Self {
        ChunkReader { chunk, handle }
    }

    /// Chunk this reader is bound to
    pub fn chunk(&self) -> &Arc<Chunk> {
        &self.chunk
    }

    /// Read the record starting exactly at `position`.
    ///
    /// `Ok(None)` when no record starts there (removed by a scavenge, or
    /// not complete before `limit`).
    pub fn read_frame_at(&mut self, position: i64, limit: i64) -> LogResult<Option<FrameRead>> {
        self.chunk.read_frame_at(&mut self.handle, position, limit)
    }

    /// Read the first record at or after `position` that ends by `limit`.
    pub fn read_next_frame(&mut self, position: i64, limit: i64) -> LogResult<Option<FrameRead>> {
        self.chunk.read_next_frame(&mut self.handle, position, limit)
    }

    /// Read every record of the chunk in order.
    ///
    /// Unknown record kinds are returned with `record: None`.
    pub fn scan(&mut self) -> LogResult<Vec<(FrameRead, Option<LogRecord>)>> {
        let mut out = Vec::new();
        let mut position = self.chunk.start_position();
        let end = self.chunk.end_position();
        while let Some(frame) = self.read_next_frame(position, end)? {
            let record = frame.decode()?;
            position = frame.next_position;
            out.push((frame, record));
        }
        Ok(out)
    }
}

impl Drop for ChunkReader {
    fn drop(&mut self) {
        let handle = std::mem::replace(&mut self.handle, ReaderHandle::Memory);
        self.chunk.pool().release(handle);
    }
}

impl std::fmt::Debug for ChunkReader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChunkReader")
            .field("chunk", &self.chunk.describe())
            .finish()
    }
}
