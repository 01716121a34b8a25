//! Structured record of one scavenge run.

use eventlog_core::Timestamp;
use parking_lot::{Condvar, Mutex};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use uuid::Uuid;

/// Terminal (or current) outcome of a scavenge run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ScavengeResult {
    /// Every unit completed
    Success,
    /// Cancelled before every unit completed
    Stopped,
    /// At least one unit or merge group failed
    Failed,
    /// Still running
    InProgress,
}

impl ScavengeResult {
    /// Name for logging
    pub fn name(&self) -> &'static str {
        match self {
            ScavengeResult::Success => "success",
            ScavengeResult::Stopped => "stopped",
            ScavengeResult::Failed => "failed",
            ScavengeResult::InProgress => "in_progress",
        }
    }
}

impl std::fmt::Display for ScavengeResult {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// Outcome of one unit or merge group.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum EntryStatus {
    /// Finished (whether or not anything was removed)
    Success,
    /// Failed; the original chunks were left in place
    Failed(String),
    /// Skipped or abandoned because the run was cancelled
    Stopped,
}

/// One line of the scavenge log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScavengeEntry {
    /// First chunk number of the unit
    pub chunk_start: u32,
    /// Last chunk number of the unit
    pub chunk_end: u32,
    /// A replacement chunk was swapped in
    pub scavenged: bool,
    /// Physical bytes reclaimed (negative if the rewrite grew)
    pub space_saved: i64,
    /// Records dropped as superseded
    pub records_removed: u64,
    /// Time spent on the unit
    pub elapsed: Duration,
    /// How the unit ended
    pub status: EntryStatus,
}

impl ScavengeEntry {
    pub(crate) fn stopped(chunk_start: u32, chunk_end: u32) -> Self {
        ScavengeEntry {
            chunk_start,
            chunk_end,
            scavenged: false,
            space_saved: 0,
            records_removed: 0,
            elapsed: Duration::ZERO,
            status: EntryStatus::Stopped,
        }
    }

    pub(crate) fn failed(chunk_start: u32, chunk_end: u32, reason: String, elapsed: Duration) -> Self {
        ScavengeEntry {
            chunk_start,
            chunk_end,
            scavenged: false,
            space_saved: 0,
            records_removed: 0,
            elapsed,
            status: EntryStatus::Failed(reason),
        }
    }
}

#[derive(Debug)]
struct LogState {
    scavenged: Vec<ScavengeEntry>,
    merged: Vec<ScavengeEntry>,
    result: ScavengeResult,
    elapsed: Option<Duration>,
    finished_at: Option<Timestamp>,
}

/// Log of a scavenge run, shared between the run and its observers.
#[derive(Debug)]
pub struct ScavengeLog {
    id: Uuid,
    started_at: Timestamp,
    state: Mutex<LogState>,
    finished: Condvar,
}

impl ScavengeLog {
    /// Empty log for a new run
    pub fn new() -> Self {
        ScavengeLog {
            id: Uuid::new_v4(),
            started_at: Timestamp::now(),
            state: Mutex::new(LogState {
                scavenged: Vec::new(),
                merged: Vec::new(),
                result: ScavengeResult::InProgress,
                elapsed: None,
                finished_at: None,
            }),
            finished: Condvar::new(),
        }
    }

    /// Run id
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// When the run started
    pub fn started_at(&self) -> Timestamp {
        self.started_at
    }

    /// Current result; `InProgress` until the run finishes
    pub fn result(&self) -> ScavengeResult {
        self.state.lock().result
    }

    /// Entries of the scavenge phase, in completion order
    pub fn scavenged(&self) -> Vec<ScavengeEntry> {
        self.state.lock().scavenged.clone()
    }

    /// Entries of the merge phase
    pub fn merged(&self) -> Vec<ScavengeEntry> {
        self.state.lock().merged.clone()
    }

    /// Total bytes reclaimed so far
    pub fn space_saved(&self) -> i64 {
        let state = self.state.lock();
        state
            .scavenged
            .iter()
            .chain(state.merged.iter())
            .map(|e| e.space_saved)
            .sum()
    }

    /// Run duration once finished
    pub fn elapsed(&self) -> Option<Duration> {
        self.state.lock().elapsed
    }

    /// Wall-clock time the run finished
    pub fn finished_at(&self) -> Option<Timestamp> {
        self.state.lock().finished_at
    }

    /// Block until the run finishes or `timeout` passes; returns the result.
    pub fn wait(&self, timeout: Duration) -> ScavengeResult {
        let mut state = self.state.lock();
        if state.result == ScavengeResult::InProgress {
            self.finished
                .wait_while_for(&mut state, |s| s.result == ScavengeResult::InProgress, timeout);
        }
        state.result
    }

    pub(crate) fn record_scavenged(&self, entry: ScavengeEntry) {
        self.state.lock().scavenged.push(entry);
    }

    pub(crate) fn record_merged(&self, entry: ScavengeEntry) {
        self.state.lock().merged.push(entry);
    }

    pub(crate) fn has_failures(&self) -> bool {
        let state = self.state.lock();
        state
            .scavenged
            .iter()
            .chain(state.merged.iter())
            .any(|e| matches!(e.status, EntryStatus::Failed(_)))
    }

    pub(crate) fn finish(&self, result: ScavengeResult, elapsed: Duration) {
        let mut state = self.state.lock();
        state.result = result;
        state.elapsed = Some(elapsed);
        state.finished_at = Some(Timestamp::now());
        drop(state);
        self.finished.notify_all();
    }
}

impl Default for ScavengeLog {
    fn default() -> Self {
        Self::new()
    }
}
