//! Caller-supplied instrumentation hook.
//!
//! The engine reports notable events to a [`LogObserver`] instead of
//! keeping process-wide counters. Every method has an empty default, so an
//! observer implements only what it cares about.

use crate::chaser::CommitAck;
use crate::error::LogError;
use crate::scavenge::{ScavengeEntry, ScavengeResult};
use std::time::Duration;
use uuid::Uuid;

/// Receives engine events. Called inline on engine threads; keep it cheap.
pub trait LogObserver: Send + Sync {
    /// A record was appended and made durable at `position`
    fn on_append(&self, _position: i64, _bytes: usize) {}

    /// The active chunk was sealed
    fn on_chunk_completed(&self, _start_number: u32, _end_number: u32) {}

    /// A historical chunk failed validation and was isolated
    fn on_chunk_corrupted(&self, _chunk: &str, _reason: &str) {}

    /// The chaser emitted a commit acknowledgement
    fn on_commit_ack(&self, _ack: &CommitAck) {}

    /// The chaser stopped on a fatal error
    fn on_chaser_error(&self, _error: &LogError) {}

    /// A scavenge unit or merge group finished
    fn on_scavenge_entry(&self, _entry: &ScavengeEntry) {}

    /// The external index was asked to scavenge
    fn on_index_scavenged(&self, _scavenge_id: Uuid) {}

    /// A scavenge run reached its terminal result
    fn on_scavenge_finished(&self, _scavenge_id: Uuid, _result: ScavengeResult, _elapsed: Duration) {}
}

/// Observer that ignores everything.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopObserver;

impl LogObserver for NoopObserver {}
