//! Scavenge runs kept for inspection.
//!
//! Running scavenges stay until they finish. Finished ones are dropped once
//! they are older than the configured maximum age.

use super::log::{ScavengeLog, ScavengeResult};
use super::CancellationToken;
use eventlog_core::Timestamp;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;
use uuid::Uuid;

struct TrackedRun {
    token: CancellationToken,
    log: Arc<ScavengeLog>,
}

/// Scavenge runs of one log, oldest first.
pub struct ScavengeHistory {
    max_age: Duration,
    runs: Mutex<Vec<TrackedRun>>,
}

impl ScavengeHistory {
    /// History keeping finished runs for `max_age`
    pub fn new(max_age: Duration) -> Self {
        ScavengeHistory {
            max_age,
            runs: Mutex::new(Vec::new()),
        }
    }

    /// Record a newly started run.
    pub fn track(&self, token: CancellationToken, log: Arc<ScavengeLog>) {
        self.prune(Timestamp::now());
        self.runs.lock().push(TrackedRun { token, log });
    }

    /// Cancel the run `id`. False if it is unknown or already finished.
    pub fn cancel(&self, id: Uuid) -> bool {
        let runs = self.runs.lock();
        match runs.iter().find(|r| r.log.id() == id) {
            Some(run) if run.log.result() == ScavengeResult::InProgress => {
                run.token.cancel();
                true
            }
            _ => false,
        }
    }

    /// Cancel every run still in progress
    pub fn cancel_all(&self) {
        for run in self.runs.lock().iter() {
            run.token.cancel();
        }
    }

    /// Log of the run `id`, if still retained
    pub fn get(&self, id: Uuid) -> Option<Arc<ScavengeLog>> {
        self.prune(Timestamp::now());
        self.runs
            .lock()
            .iter()
            .find(|r| r.log.id() == id)
            .map(|r| Arc::clone(&r.log))
    }

    /// Logs of all retained runs, oldest first
    pub fn runs(&self) -> Vec<Arc<ScavengeLog>> {
        self.prune(Timestamp::now());
        self.runs.lock().iter().map(|r| Arc::clone(&r.log)).collect()
    }

    /// Drop finished runs older than the maximum age at `now`. Returns how
    /// many were dropped.
    pub fn prune(&self, now: Timestamp) -> usize {
        let mut runs = self.runs.lock();
        let before = runs.len();
        runs.retain(|run| {
            let expired = run
                .log
                .finished_at()
                .and_then(|finished| now.duration_since(finished))
                .is_some_and(|age| age > self.max_age);
            if expired {
                debug!(
                    target: "eventlog::scavenge",
                    id = %run.log.id(),
                    finished_at = %run.log.finished_at().unwrap_or_default(),
                    "Scavenge dropped from history"
                );
            }
            !expired
        });
        before - runs.len()
    }
}

impl std::fmt::Debug for ScavengeHistory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScavengeHistory")
            .field("max_age", &self.max_age)
            .field("runs", &self.runs.lock().len())
            .finish()
    }
}
