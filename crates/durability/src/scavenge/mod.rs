//! Online scavenging of completed chunks.
//!
//! A scavenge rewrites completed chunks without the records its
//! [`ScavengePolicy`] reports as superseded, then swaps the rewritten chunk
//! in with [`ChunkDb::replace_chunks`](crate::db::ChunkDb::replace_chunks).
//! A second phase merges neighbouring chunks whose live data fits in one
//! chunk. Finally the external [`TableIndex`] is asked to scavenge.
//!
//! # Guarantees
//!
//! - The active chunk is never touched
//! - Log positions of surviving records never change
//! - Readers see either the old or the new chunk, never a mix
//! - A cancelled or failed rewrite leaves the old chunk untouched and
//!   removes its temp file
//!
//! Every unit and merge group is recorded in a [`ScavengeLog`]; the logs of
//! recent runs are kept in a [`ScavengeHistory`].

pub mod history;
pub mod log;
mod scavenger;

pub use history::ScavengeHistory;
pub use log::{EntryStatus, ScavengeEntry, ScavengeLog, ScavengeResult};
pub use scavenger::{ScavengeHandle, Scavenger};

use eventlog_core::PrepareRecord;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Which chunks to scavenge and how.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScavengeOptions {
    /// First chunk number to scavenge
    pub start_chunk: u32,
    /// Last chunk number to scavenge; `None` = through the last completed
    /// chunk when the run starts
    pub end_chunk: Option<u32>,
    /// Worker threads for the scavenge phase (default: 1)
    pub threads: usize,
    /// Run the merge phase (default: true)
    pub merge_chunks: bool,
}

impl Default for ScavengeOptions {
    fn default() -> Self {
        ScavengeOptions {
            start_chunk: 0,
            end_chunk: None,
            threads: 1,
            merge_chunks: true,
        }
    }
}

impl ScavengeOptions {
    /// Scavenge every completed chunk
    pub fn all() -> Self {
        Self::default()
    }

    /// Scavenge chunks `start..=end`
    pub fn range(start: u32, end: u32) -> Self {
        ScavengeOptions {
            start_chunk: start,
            end_chunk: Some(end),
            ..Default::default()
        }
    }

    /// Set the first chunk (builder pattern).
    pub fn with_start_chunk(mut self, start: u32) -> Self {
        self.start_chunk = start;
        self
    }

    /// Set the last chunk (builder pattern).
    pub fn with_end_chunk(mut self, end: u32) -> Self {
        self.end_chunk = Some(end);
        self
    }

    /// Set worker thread count (builder pattern).
    pub fn with_threads(mut self, threads: usize) -> Self {
        self.threads = threads;
        self
    }

    /// Enable or disable the merge phase (builder pattern).
    pub fn with_merge(mut self, merge: bool) -> Self {
        self.merge_chunks = merge;
        self
    }
}

/// Cooperative cancellation flag shared between a run and its controller.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken(Arc<AtomicBool>);

impl CancellationToken {
    /// New, not cancelled
    pub fn new() -> Self {
        Self::default()
    }

    /// Request cancellation
    pub fn cancel(&self) {
        self.0.store(true, Ordering::Release);
    }

    /// True once cancelled
    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

/// Decides which prepares a scavenge may drop.
///
/// Only prepares are ever offered; commits, system and epoch records are
/// always kept.
pub trait ScavengePolicy: Send + Sync {
    /// True if `prepare` is superseded and may be removed
    fn is_superseded(&self, prepare: &PrepareRecord) -> bool;
}

/// Keeps everything.
#[derive(Debug, Clone, Copy, Default)]
pub struct KeepAll;

impl ScavengePolicy for KeepAll {
    fn is_superseded(&self, _prepare: &PrepareRecord) -> bool {
        false
    }
}

impl<F> ScavengePolicy for F
where
    F: Fn(&PrepareRecord) -> bool + Send + Sync,
{
    fn is_superseded(&self, prepare: &PrepareRecord) -> bool {
        self(prepare)
    }
}

/// External index notified once per scavenge run.
pub trait TableIndex: Send + Sync {
    /// Scavenge index entries pointing at removed records
    fn scavenge(&self);
}

/// Index that does nothing.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoIndex;

impl TableIndex for NoIndex {
    fn scavenge(&self) {}
}
