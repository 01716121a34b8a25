//! Single append path into the log.
//!
//! Appends are serialised. For every call the writer assigns the position,
//! encodes the record, appends it to the active chunk, fsyncs the chunk,
//! then writes and flushes the Writer checkpoint. Only after that is the
//! new durable frontier published and the position returned, so anything
//! observable through the frontier survives a crash.

use crate::checkpoint::Checkpoint;
use crate::db::ChunkDb;
use crate::error::LogResult;
use crate::format::encode;
use crate::observer::LogObserver;
use eventlog_core::LogRecord;
use parking_lot::{Condvar, Mutex};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, trace};

/// Cumulative writer counters.
///
/// Never reset over the lifetime of the writer.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WriterCounters {
    /// Records appended
    pub appends: u64,
    /// Batches committed (a single append counts as a batch of one)
    pub batches: u64,
    /// Encoded bytes written
    pub bytes_written: u64,
    /// Chunk fsyncs plus checkpoint flushes
    pub flushes: u64,
    /// Nanoseconds spent making data durable
    pub flush_nanos: u64,
}

/// End of durable data, shared between the writer and its consumers.
///
/// Consumers block in [`DurableFrontier::wait_beyond`] instead of polling
/// the Writer checkpoint.
#[derive(Debug)]
pub struct DurableFrontier {
    state: Mutex<FrontierState>,
    advanced: Condvar,
}

#[derive(Debug)]
struct FrontierState {
    position: i64,
    closed: bool,
}

impl DurableFrontier {
    /// Frontier starting at `position`
    pub fn new(position: i64) -> Self {
        DurableFrontier {
            state: Mutex::new(FrontierState {
                position,
                closed: false,
            }),
            advanced: Condvar::new(),
        }
    }

    /// Current durable end of the log
    pub fn position(&self) -> i64 {
        self.state.lock().position
    }

    /// Wait until the frontier moves past `position`, the frontier is
    /// closed, or `timeout` elapses. Returns the frontier at wake-up.
    pub fn wait_beyond(&self, position: i64, timeout: Duration) -> i64 {
        let mut state = self.state.lock();
        if state.position <= position && !state.closed {
            self.advanced.wait_for(&mut state, timeout);
        }
        state.position
    }

    /// Wake every waiter; later waits return immediately.
    pub fn close(&self) {
        self.state.lock().closed = true;
        self.advanced.notify_all();
    }

    /// True once [`DurableFrontier::close`] was called
    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    fn publish(&self, position: i64) {
        let mut state = self.state.lock();
        if position > state.position {
            state.position = position;
            drop(state);
            self.advanced.notify_all();
        }
    }
}

/// Serialised appender over a [`ChunkDb`].
pub struct LogWriter {
    db: Arc<ChunkDb>,
    checkpoint: Arc<dyn Checkpoint>,
    frontier: Arc<DurableFrontier>,
    observer: Arc<dyn LogObserver>,
    counters: Mutex<WriterCounters>,
}

impl LogWriter {
    /// Writer appending to `db` and advancing `checkpoint`.
    ///
    /// The frontier starts at the database's recovered write position.
    pub fn new(
        db: Arc<ChunkDb>,
        checkpoint: Arc<dyn Checkpoint>,
        observer: Arc<dyn LogObserver>,
    ) -> Self {
        let frontier = Arc::new(DurableFrontier::new(db.write_position()));
        LogWriter {
            db,
            checkpoint,
            frontier,
            observer,
            counters: Mutex::new(WriterCounters::default()),
        }
    }

    /// Shared durable frontier
    pub fn frontier(&self) -> &Arc<DurableFrontier> {
        &self.frontier
    }

    /// Snapshot of the cumulative counters
    pub fn counters(&self) -> WriterCounters {
        self.counters.lock().clone()
    }

    /// Append one record and make it durable. Returns its log position.
    ///
    /// The record's `log_position` is overwritten. A prepare with no
    /// transaction position starts its own transaction at that position.
    pub fn append(&self, record: LogRecord) -> LogResult<i64> {
        let mut counters = self.counters.lock();
        let (position, len) = self.write_one(record)?;
        let end = position + len as i64;
        self.commit(&mut counters, end)?;
        counters.appends += 1;
        counters.batches += 1;
        counters.bytes_written += len as u64;
        drop(counters);

        self.observer.on_append(position, len);
        Ok(position)
    }

    /// Append several records with one durability barrier.
    ///
    /// Positions are returned in input order. If a record fails, the
    /// records before it are still made durable and the error is returned.
    pub fn append_batch(&self, records: Vec<LogRecord>) -> LogResult<Vec<i64>> {
        if records.is_empty() {
            return Ok(Vec::new());
        }
        let mut counters = self.counters.lock();
        let mut written = Vec::with_capacity(records.len());
        let mut failure = None;
        for record in records {
            match self.write_one(record) {
                Ok(entry) => written.push(entry),
                Err(e) => {
                    failure = Some(e);
                    break;
                }
            }
        }
        if let Some(&(last_position, last_len)) = written.last() {
            self.commit(&mut counters, last_position + last_len as i64)?;
            let bytes: usize = written.iter().map(|(_, len)| len).sum();
            counters.appends += written.len() as u64;
            counters.batches += 1;
            counters.bytes_written += bytes as u64;
        }
        drop(counters);

        for (position, len) in &written {
            self.observer.on_append(*position, *len);
        }
        match failure {
            Some(e) => {
                debug!(target: "eventlog::writer", committed = written.len(), error = %e, "Batch stopped early");
                Err(e)
            }
            None => Ok(written.into_iter().map(|(position, _)| position).collect()),
        }
    }

    /// Encode and append without making it durable yet.
    fn write_one(&self, mut record: LogRecord) -> LogResult<(i64, usize)> {
        let position = self.db.write_position();
        record.set_log_position(position);
        if let LogRecord::Prepare(prepare) = &mut record {
            if prepare.transaction_position < 0 {
                prepare.transaction_position = position;
            }
        }
        let frame = encode(&record);
        let written = self.db.append_active_chunk(&frame)?;
        debug_assert_eq!(written, position);
        trace!(target: "eventlog::writer", position = written, bytes = frame.len(), "Record appended");
        Ok((written, frame.len()))
    }

    /// Fsync the chunk, then advance and flush the checkpoint, then publish.
    fn commit(&self, counters: &mut WriterCounters, end: i64) -> LogResult<()> {
        let start = Instant::now();
        if let Err(e) = self.db.flush() {
            error!(target: "eventlog::writer", error = %e, "Chunk flush failed");
            return Err(e);
        }
        self.checkpoint.write(end);
        if let Err(e) = self.checkpoint.flush() {
            error!(target: "eventlog::writer", error = %e, "Writer checkpoint flush failed");
            return Err(e.into());
        }
        counters.flushes += 2;
        counters.flush_nanos += start.elapsed().as_nanos() as u64;

        self.frontier.publish(end);
        debug!(target: "eventlog::writer", durable = end, "Durable frontier advanced");
        Ok(())
    }

    /// Flush the active chunk and close the frontier.
    pub fn close(&self) -> LogResult<()> {
        let _counters = self.counters.lock();
        self.db.close()?;
        self.frontier.close();
        Ok(())
    }
}

impl std::fmt::Debug for LogWriter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LogWriter")
            .field("frontier", &self.frontier.position())
            .field("counters", &*self.counters.lock())
            .finish()
    }
}
