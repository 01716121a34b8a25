//! `EventLog`: the assembled log engine.
//!
//! Opening an `EventLog` recovers the chunk set against the checkpoints,
//! then wires the writer, the storage chaser and the scavenger together:
//!
//! ```text
//! append ──> LogWriter ──> ChunkDb (active chunk) ──> Writer checkpoint
//!                 │
//!                 └─ durable frontier ──> StorageChaser ──> CommitAck feed
//!                                              └────────> Chaser checkpoint
//! ```
//!
//! # Example
//!
//! ```ignore
//! let log = EventLog::open(DbConfig::new("/var/lib/node/log"))?;
//! let acks = log.commit_acks().expect("taken once");
//! let position = log.append(PrepareRecord::single_write(id, "orders-1", -1, "Placed", data, vec![]))?;
//! let ack = acks.recv()?;
//! ```

use crate::chaser::{ChaserConfig, CommitAck, StorageChaser};
use crate::checkpoint::{Checkpoint, CheckpointSet};
use crate::chunk::Chunk;
use crate::db::{ChunkDb, DbConfig, ReadResult};
use crate::error::LogResult;
use crate::observer::{LogObserver, NoopObserver};
use crate::scavenge::{
    KeepAll, NoIndex, ScavengeHandle, ScavengeHistory, ScavengeLog, ScavengeOptions,
    ScavengePolicy, Scavenger, TableIndex,
};
use crate::writer::{LogWriter, WriterCounters};
use eventlog_core::LogRecord;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver};
use std::sync::Arc;
use tracing::{info, warn};
use uuid::Uuid;

/// External collaborators of an [`EventLog`].
#[derive(Clone)]
pub struct Collaborators {
    /// Decides which prepares scavenges may drop
    pub policy: Arc<dyn ScavengePolicy>,
    /// Index notified after each scavenge
    pub index: Arc<dyn TableIndex>,
    /// Instrumentation hook
    pub observer: Arc<dyn LogObserver>,
}

impl Default for Collaborators {
    fn default() -> Self {
        Collaborators {
            policy: Arc::new(KeepAll),
            index: Arc::new(NoIndex),
            observer: Arc::new(NoopObserver),
        }
    }
}

impl Collaborators {
    /// Set the scavenge policy (builder pattern).
    pub fn with_policy(mut self, policy: Arc<dyn ScavengePolicy>) -> Self {
        self.policy = policy;
        self
    }

    /// Set the table index (builder pattern).
    pub fn with_index(mut self, index: Arc<dyn TableIndex>) -> Self {
        self.index = index;
        self
    }

    /// Set the observer (builder pattern).
    pub fn with_observer(mut self, observer: Arc<dyn LogObserver>) -> Self {
        self.observer = observer;
        self
    }
}

/// An open transaction log.
pub struct EventLog {
    checkpoints: CheckpointSet,
    db: Arc<ChunkDb>,
    writer: LogWriter,
    chaser: StorageChaser,
    scavenger: Scavenger,
    acks: Mutex<Option<Receiver<CommitAck>>>,
    scavenges: ScavengeHistory,
    closed: AtomicBool,
}

impl EventLog {
    /// Open with default collaborators (keep every record, no index).
    pub fn open(config: DbConfig) -> LogResult<Self> {
        Self::open_with(config, Collaborators::default())
    }

    /// Open a volatile log; nothing survives the process.
    pub fn open_in_memory() -> LogResult<Self> {
        Self::open(DbConfig::in_memory())
    }

    /// Open with explicit collaborators.
    pub fn open_with(config: DbConfig, collaborators: Collaborators) -> LogResult<Self> {
        config.validate()?;
        let checkpoints = match config.dir() {
            Some(dir) => CheckpointSet::open(dir)?,
            None => CheckpointSet::in_memory(),
        };
        let Collaborators {
            policy,
            index,
            observer,
        } = collaborators;

        let chaser_config = ChaserConfig {
            flush_every: config.chaser_flush_every,
            wait: config.chaser_wait,
        };
        let scavenges = ScavengeHistory::new(config.scavenge_history_max_age);
        let db = Arc::new(ChunkDb::open(config, &checkpoints, Arc::clone(&observer))?);
        let writer = LogWriter::new(
            Arc::clone(&db),
            Arc::clone(&checkpoints.writer),
            Arc::clone(&observer),
        );

        let (tx, rx) = mpsc::channel();
        let chaser = StorageChaser::start(
            Arc::clone(&db),
            Arc::clone(&checkpoints.chaser),
            Arc::clone(writer.frontier()),
            Arc::clone(&observer),
            chaser_config,
            tx,
        )?;
        let scavenger = Scavenger::new(
            Arc::clone(&db),
            Arc::clone(writer.frontier()),
            policy,
            index,
            observer,
        );

        info!(
            target: "eventlog::database",
            write_position = db.write_position(),
            chaser = chaser.position(),
            chunks = db.chunks().len(),
            "Event log opened"
        );
        Ok(EventLog {
            checkpoints,
            db,
            writer,
            chaser,
            scavenger,
            acks: Mutex::new(Some(rx)),
            scavenges,
            closed: AtomicBool::new(false),
        })
    }

    // ========================================================================
    // Writing
    // ========================================================================

    /// Append a record; returns its position once it is durable.
    pub fn append(&self, record: impl Into<LogRecord>) -> LogResult<i64> {
        self.writer.append(record.into())
    }

    /// Append records under one durability barrier.
    pub fn append_batch(&self, records: Vec<LogRecord>) -> LogResult<Vec<i64>> {
        self.writer.append_batch(records)
    }

    /// Seal the active chunk now instead of when it fills up.
    pub fn seal_active_chunk(&self) -> LogResult<()> {
        self.db.seal_active_chunk()
    }

    // ========================================================================
    // Reading
    // ========================================================================

    /// End of durable data
    pub fn durable_position(&self) -> i64 {
        self.writer.frontier().position()
    }

    /// Read the record at `position`.
    pub fn read_at(&self, position: i64) -> LogResult<ReadResult> {
        self.db.read_at(position, self.durable_position())
    }

    /// Iterate records from `from` up to the durable end of the log.
    pub fn read_sequence(&self, from: i64) -> LogIter<'_> {
        LogIter {
            db: &self.db,
            position: from.max(0),
            limit: self.durable_position(),
            done: false,
        }
    }

    /// Take the commit acknowledgement feed. `None` after the first call.
    pub fn commit_acks(&self) -> Option<Receiver<CommitAck>> {
        self.acks.lock().take()
    }

    /// Position processed by the chaser
    pub fn chaser_position(&self) -> i64 {
        self.chaser.position()
    }

    /// Error that stopped the chaser, if any
    pub fn chaser_error(&self) -> Option<String> {
        self.chaser.fatal_error()
    }

    // ========================================================================
    // Scavenging
    // ========================================================================

    /// Start a background scavenge.
    pub fn start_scavenge(&self, options: ScavengeOptions) -> LogResult<ScavengeHandle> {
        let handle = self.scavenger.start(options)?;
        self.scavenges
            .track(handle.token().clone(), Arc::clone(handle.log()));
        Ok(handle)
    }

    /// Cancel a running scavenge. False if no such run is in progress.
    pub fn cancel_scavenge(&self, id: Uuid) -> bool {
        let cancelled = self.scavenges.cancel(id);
        if cancelled {
            info!(target: "eventlog::database", %id, "Cancelling scavenge");
        }
        cancelled
    }

    /// Log of a scavenge run still in the history
    pub fn scavenge_log(&self, id: Uuid) -> Option<Arc<ScavengeLog>> {
        self.scavenges.get(id)
    }

    /// Logs of retained scavenge runs, oldest first
    pub fn scavenge_history(&self) -> Vec<Arc<ScavengeLog>> {
        self.scavenges.runs()
    }

    // ========================================================================
    // Inspection
    // ========================================================================

    /// Checkpoints of this log
    pub fn checkpoints(&self) -> &CheckpointSet {
        &self.checkpoints
    }

    /// Current chunk list, oldest first
    pub fn chunks(&self) -> Vec<Arc<Chunk>> {
        self.db.chunks()
    }

    /// Cumulative writer counters
    pub fn writer_counters(&self) -> WriterCounters {
        self.writer.counters()
    }

    /// Stop background work and flush everything.
    ///
    /// Running scavenges are cancelled. Returns the chaser's fatal error if
    /// it stopped early.
    pub fn close(&self) -> LogResult<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        self.scavenges.cancel_all();
        let chaser = self.chaser.stop();
        self.writer.close()?;
        self.checkpoints.flush_all()?;
        info!(
            target: "eventlog::database",
            write_position = self.db.write_position(),
            chaser = self.checkpoints.chaser.read(),
            "Event log closed"
        );
        chaser
    }
}

impl Drop for EventLog {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            warn!(target: "eventlog::database", error = %e, "Error closing event log");
        }
    }
}

impl std::fmt::Debug for EventLog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventLog")
            .field("db", &self.db)
            .field("checkpoints", &self.checkpoints)
            .finish()
    }
}

/// Forward iterator over durable records.
///
/// Bounded by the durable position at creation. Record kinds this build
/// does not know are skipped. After an error the iterator ends; resume
/// with a new iterator from [`LogIter::position`].
pub struct LogIter<'a> {
    db: &'a ChunkDb,
    position: i64,
    limit: i64,
    done: bool,
}

impl LogIter<'_> {
    /// Position the next call to `next` reads from
    pub fn position(&self) -> i64 {
        self.position
    }
}

impl Iterator for LogIter<'_> {
    type Item = LogResult<(i64, LogRecord)>;

    fn next(&mut self) -> Option<Self::Item> {
        while !self.done {
            match self.db.read_next(self.position, self.limit) {
                Ok(Some(next)) => {
                    self.position = next.next_position;
                    if let Some(record) = next.record {
                        return Some(Ok((next.position, record)));
                    }
                }
                Ok(None) => self.done = true,
                Err(e) => {
                    self.done = true;
                    return Some(Err(e));
                }
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scavenge::ScavengeResult;
    use eventlog_core::PrepareRecord;
    use std::time::Duration;

    fn write(stream: &str) -> PrepareRecord {
        PrepareRecord::single_write(Uuid::new_v4(), stream, -1, "t", b"x".to_vec(), vec![])
    }

    #[test]
    fn test_append_and_iterate() {
        let log = EventLog::open_in_memory().unwrap();
        let a = log.append(write("a")).unwrap();
        let b = log.append(write("b")).unwrap();

        let records: Vec<_> = log.read_sequence(0).map(|r| r.unwrap()).collect();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].0, a);
        assert_eq!(records[1].0, b);

        let mut iter = log.read_sequence(0);
        iter.next();
        assert_eq!(iter.position(), b);
        log.close().unwrap();
    }

    #[test]
    fn test_commit_acks_taken_once() {
        let log = EventLog::open_in_memory().unwrap();
        let acks = log.commit_acks().unwrap();
        assert!(log.commit_acks().is_none());

        let record = write("a");
        let id = record.correlation_id;
        log.append(record).unwrap();
        let ack = acks.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(ack.correlation_id, id);
    }

    #[test]
    fn test_cancel_unknown_scavenge() {
        let log = EventLog::open_in_memory().unwrap();
        assert!(!log.cancel_scavenge(Uuid::new_v4()));
        let handle = log.start_scavenge(ScavengeOptions::all()).unwrap();
        assert_eq!(handle.wait(), ScavengeResult::Success);
        assert!(!log.cancel_scavenge(handle.id()));
    }

    #[test]
    fn test_scavenge_history_retention() {
        let log = EventLog::open(
            DbConfig::in_memory().with_scavenge_history_max_age(Duration::from_millis(50)),
        )
        .unwrap();
        let first = log.start_scavenge(ScavengeOptions::all()).unwrap();
        assert_eq!(first.wait(), ScavengeResult::Success);
        assert!(log.scavenge_log(first.id()).is_some());

        // Finished runs older than the maximum age are dropped
        std::thread::sleep(Duration::from_millis(100));
        let second = log.start_scavenge(ScavengeOptions::all()).unwrap();
        assert_eq!(second.wait(), ScavengeResult::Success);
        assert!(log.scavenge_log(first.id()).is_none());
    }

    #[test]
    fn test_scavenge_history_keeps_recent_runs() {
        let log = EventLog::open_in_memory().unwrap();
        let ids: Vec<Uuid> = (0..3)
            .map(|_| {
                let handle = log.start_scavenge(ScavengeOptions::all()).unwrap();
                assert_eq!(handle.wait(), ScavengeResult::Success);
                handle.id()
            })
            .collect();
        let history: Vec<Uuid> = log.scavenge_history().iter().map(|l| l.id()).collect();
        assert_eq!(history, ids);
    }

    #[test]
    fn test_close_is_idempotent() {
        let log = EventLog::open_in_memory().unwrap();
        log.append(write("a")).unwrap();
        log.close().unwrap();
        log.close().unwrap();
    }
}
