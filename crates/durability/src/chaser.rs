//! Storage chaser: follows the durable log and acknowledges commits.
//!
//! A single background thread replays records from the Chaser checkpoint up
//! to the durable frontier published by the writer. For every record that
//! completes a transaction it sends a [`CommitAck`]; then it advances the
//! Chaser checkpoint to the end of the record.
//!
//! The thread never reads past the durable frontier, so an acknowledgement
//! is never emitted for data that could be lost in a crash. After a restart
//! the chaser resumes from its last flushed checkpoint, which can repeat
//! acknowledgements (at-least-once per node lifetime).

use crate::checkpoint::Checkpoint;
use crate::db::ChunkDb;
use crate::error::{LogError, LogResult};
use crate::observer::LogObserver;
use crate::writer::DurableFrontier;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::mpsc::Sender;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;
use tracing::{debug, error, info, trace, warn};
use uuid::Uuid;

/// A transaction became durable and committed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CommitAck {
    /// Transaction id
    pub correlation_id: Uuid,
    /// Position of the record that completed the transaction
    pub log_position: i64,
    /// Position of the transaction's first record
    pub transaction_position: i64,
}

/// Chaser tuning, usually taken from `DbConfig`.
#[derive(Debug, Clone, Copy)]
pub struct ChaserConfig {
    /// Flush the checkpoint at least every this many records
    pub flush_every: usize,
    /// Longest wait on the frontier before re-checking for stop
    pub wait: Duration,
}

struct ChaserShared {
    db: Arc<ChunkDb>,
    checkpoint: Arc<dyn Checkpoint>,
    frontier: Arc<DurableFrontier>,
    observer: Arc<dyn LogObserver>,
    config: ChaserConfig,
    stop: AtomicBool,
    position: AtomicI64,
    fatal: Mutex<Option<LogError>>,
}

/// Handle to the running chaser thread.
pub struct StorageChaser {
    shared: Arc<ChaserShared>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl StorageChaser {
    /// Spawn the chaser, resuming from `checkpoint`.
    pub fn start(
        db: Arc<ChunkDb>,
        checkpoint: Arc<dyn Checkpoint>,
        frontier: Arc<DurableFrontier>,
        observer: Arc<dyn LogObserver>,
        config: ChaserConfig,
        acks: Sender<CommitAck>,
    ) -> LogResult<Self> {
        let start = checkpoint.read().max(0);
        let shared = Arc::new(ChaserShared {
            db,
            checkpoint,
            frontier,
            observer,
            config,
            stop: AtomicBool::new(false),
            position: AtomicI64::new(start),
            fatal: Mutex::new(None),
        });

        let thread_shared = Arc::clone(&shared);
        let handle = std::thread::Builder::new()
            .name("eventlog-chaser".to_string())
            .spawn(move || chase(&thread_shared, &acks))?;
        info!(target: "eventlog::chaser", position = start, "Storage chaser started");

        Ok(StorageChaser {
            shared,
            handle: Mutex::new(Some(handle)),
        })
    }

    /// Position the chaser has processed up to
    pub fn position(&self) -> i64 {
        self.shared.position.load(Ordering::Acquire)
    }

    /// Description of the error that stopped the chaser, if any
    pub fn fatal_error(&self) -> Option<String> {
        self.shared.fatal.lock().as_ref().map(|e| e.to_string())
    }

    /// True while the thread is running
    pub fn is_running(&self) -> bool {
        self.handle
            .lock()
            .as_ref()
            .is_some_and(|h| !h.is_finished())
    }

    /// Stop the thread and wait for it.
    ///
    /// Returns the fatal error that ended the chaser early, if any.
    pub fn stop(&self) -> LogResult<()> {
        self.shared.stop.store(true, Ordering::Release);
        self.shared.frontier.close();
        if let Some(handle) = self.handle.lock().take() {
            if handle.join().is_err() {
                error!(target: "eventlog::chaser", "Chaser thread panicked");
                return Err(LogError::ChaserStopped);
            }
        }
        match self.shared.fatal.lock().take() {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

impl Drop for StorageChaser {
    fn drop(&mut self) {
        if let Err(e) = self.stop() {
            warn!(target: "eventlog::chaser", error = %e, "Chaser stopped with error");
        }
    }
}

impl std::fmt::Debug for StorageChaser {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StorageChaser")
            .field("position", &self.position())
            .field("running", &self.is_running())
            .finish()
    }
}

fn chase(shared: &ChaserShared, acks: &Sender<CommitAck>) {
    if let Err(e) = chase_loop(shared, acks) {
        error!(target: "eventlog::chaser", error = %e, "Storage chaser stopped on fatal error");
        shared.observer.on_chaser_error(&e);
        *shared.fatal.lock() = Some(e);
    }
}

fn chase_loop(shared: &ChaserShared, acks: &Sender<CommitAck>) -> LogResult<()> {
    let mut position = shared.position.load(Ordering::Acquire);
    let mut unflushed = 0usize;

    while !shared.stop.load(Ordering::Acquire) {
        let limit = shared.frontier.position();
        if position >= limit {
            if unflushed > 0 {
                flush(shared, position)?;
                unflushed = 0;
            }
            shared.frontier.wait_beyond(position, shared.config.wait);
            continue;
        }

        let next = match shared.db.read_next(position, limit) {
            Ok(next) => next,
            Err(e) if !e.is_fatal() => {
                warn!(target: "eventlog::chaser", position, error = %e, "Read failed, retrying");
                std::thread::sleep(shared.config.wait);
                continue;
            }
            Err(e) => return Err(e),
        };
        let Some(next) = next else {
            // Record straddles the frontier; wait for the rest
            shared.frontier.wait_beyond(limit, shared.config.wait);
            continue;
        };

        if let Some((correlation_id, transaction_position)) =
            next.record.as_ref().and_then(|r| r.completed_transaction())
        {
            let ack = CommitAck {
                correlation_id,
                log_position: next.position,
                transaction_position,
            };
            trace!(target: "eventlog::chaser", %correlation_id, position = next.position, "Commit acknowledged");
            shared.observer.on_commit_ack(&ack);
            if acks.send(ack).is_err() {
                trace!(target: "eventlog::chaser", "Commit ack receiver dropped");
            }
        }

        position = next.next_position;
        shared.position.store(position, Ordering::Release);
        shared.checkpoint.write(position);
        unflushed += 1;
        if unflushed >= shared.config.flush_every {
            flush(shared, position)?;
            unflushed = 0;
        }
    }

    if unflushed > 0 {
        flush(shared, position)?;
    }
    debug!(target: "eventlog::chaser", position, "Storage chaser exiting");
    Ok(())
}

fn flush(shared: &ChaserShared, position: i64) -> LogResult<()> {
    shared.checkpoint.flush()?;
    trace!(target: "eventlog::chaser", position, "Chaser checkpoint flushed");
    Ok(())
}
