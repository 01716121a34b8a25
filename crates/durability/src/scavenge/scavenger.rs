//! Scavenge runs.
//!
//! A run has two phases. The scavenge phase rewrites each completed chunk in
//! the requested range on a small pool of scoped worker threads; a chunk from
//! which nothing was dropped is left alone. The merge phase then walks every
//! completed chunk up to the end of the range and merges runs of neighbours
//! whose live data fits in a single chunk.
//!
//! Runs on one scavenger are serialised.

use super::log::{EntryStatus, ScavengeEntry, ScavengeLog, ScavengeResult};
use super::{CancellationToken, ScavengeOptions, ScavengePolicy, TableIndex};
use crate::chunk::{Chunk, ChunkBuilder};
use crate::db::ChunkDb;
use crate::error::{LogError, LogResult};
use crate::format::{ChunkHeader, POSMAP_ENTRY_SIZE};
use crate::observer::LogObserver;
use crate::writer::DurableFrontier;
use eventlog_core::{LogRecord, Timestamp};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Records between cancellation checks inside a rewrite.
const CANCEL_CHECK_INTERVAL: usize = 256;

/// Rewrites completed chunks without superseded records.
#[derive(Clone)]
pub struct Scavenger {
    db: Arc<ChunkDb>,
    frontier: Arc<DurableFrontier>,
    policy: Arc<dyn ScavengePolicy>,
    index: Arc<dyn TableIndex>,
    observer: Arc<dyn LogObserver>,
    run_lock: Arc<Mutex<()>>,
}

/// Control handle for a scavenge running in the background.
pub struct ScavengeHandle {
    log: Arc<ScavengeLog>,
    cancel: CancellationToken,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl ScavengeHandle {
    /// Run id
    pub fn id(&self) -> Uuid {
        self.log.id()
    }

    /// Live log of the run
    pub fn log(&self) -> &Arc<ScavengeLog> {
        &self.log
    }

    /// Cancellation token of the run
    pub fn token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Request cancellation; the run stops at its next check
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Wait for the run to finish and return its result.
    pub fn wait(&self) -> ScavengeResult {
        if let Some(thread) = self.thread.lock().take() {
            if thread.join().is_err() {
                warn!(target: "eventlog::scavenge", id = %self.id(), "Scavenge thread panicked");
                return ScavengeResult::Failed;
            }
        }
        self.log.result()
    }
}

impl std::fmt::Debug for ScavengeHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScavengeHandle")
            .field("id", &self.id())
            .field("result", &self.log.result())
            .finish()
    }
}

impl Scavenger {
    /// Scavenger over `db` using `policy`, notifying `index` once per run.
    ///
    /// Only chunks that end at or before `frontier` are touched.
    pub fn new(
        db: Arc<ChunkDb>,
        frontier: Arc<DurableFrontier>,
        policy: Arc<dyn ScavengePolicy>,
        index: Arc<dyn TableIndex>,
        observer: Arc<dyn LogObserver>,
    ) -> Self {
        Scavenger {
            db,
            frontier,
            policy,
            index,
            observer,
            run_lock: Arc::new(Mutex::new(())),
        }
    }

    /// Start a run on a background thread.
    pub fn start(&self, options: ScavengeOptions) -> LogResult<ScavengeHandle> {
        let log = Arc::new(ScavengeLog::new());
        let cancel = CancellationToken::new();
        let thread = {
            let scavenger = self.clone();
            let log = Arc::clone(&log);
            let cancel = cancel.clone();
            std::thread::Builder::new()
                .name(format!("eventlog-scavenge-{}", &log.id().simple().to_string()[..8]))
                .spawn(move || {
                    scavenger.run(&options, &cancel, &log);
                })?
        };
        Ok(ScavengeHandle {
            log,
            cancel,
            thread: Mutex::new(Some(thread)),
        })
    }

    /// Run a scavenge on the calling thread, recording into `log`.
    pub fn run(
        &self,
        options: &ScavengeOptions,
        cancel: &CancellationToken,
        log: &ScavengeLog,
    ) -> ScavengeResult {
        let _running = self.run_lock.lock();
        let started = Instant::now();
        let id = log.id();

        let last_completed = self.db.last_completed_number(self.frontier.position());
        let end_chunk = match (options.end_chunk, last_completed) {
            (_, None) => None,
            (Some(end), Some(last)) => Some(end.min(last)),
            (None, Some(last)) => Some(last),
        };
        info!(
            target: "eventlog::scavenge",
            %id,
            start_chunk = options.start_chunk,
            end_chunk = ?end_chunk,
            threads = options.threads,
            "Scavenge started"
        );

        if let Some(end_chunk) = end_chunk.filter(|end| *end >= options.start_chunk) {
            let units = self.db.completed_chunks(options.start_chunk, end_chunk);
            self.scavenge_phase(&units, options.threads.max(1), cancel, log);
            if options.merge_chunks && !cancel.is_cancelled() {
                if let Err(e) = self.merge_phase(end_chunk, cancel, log) {
                    if !matches!(e, LogError::ScavengeCancelled) {
                        warn!(target: "eventlog::scavenge", %id, error = %e, "Merge phase failed");
                    }
                }
            }
        }

        if !cancel.is_cancelled() {
            self.index.scavenge();
            self.observer.on_index_scavenged(id);
        }

        let result = if cancel.is_cancelled() {
            ScavengeResult::Stopped
        } else if log.has_failures() {
            ScavengeResult::Failed
        } else {
            ScavengeResult::Success
        };
        let elapsed = started.elapsed();
        log.finish(result, elapsed);
        self.observer.on_scavenge_finished(id, result, elapsed);
        info!(
            target: "eventlog::scavenge",
            %id,
            %result,
            space_saved = log.space_saved(),
            elapsed_ms = elapsed.as_millis() as u64,
            "Scavenge finished"
        );
        result
    }

    // ========================================================================
    // Scavenge phase
    // ========================================================================

    fn scavenge_phase(
        &self,
        units: &[Arc<Chunk>],
        threads: usize,
        cancel: &CancellationToken,
        log: &ScavengeLog,
    ) {
        let next = AtomicUsize::new(0);
        std::thread::scope(|scope| {
            for _ in 0..threads.min(units.len()) {
                scope.spawn(|| loop {
                    let i = next.fetch_add(1, Ordering::Relaxed);
                    let Some(chunk) = units.get(i) else {
                        break;
                    };
                    let entry = if cancel.is_cancelled() {
                        ScavengeEntry::stopped(chunk.start_number(), chunk.end_number())
                    } else {
                        self.scavenge_unit(chunk, cancel)
                    };
                    self.observer.on_scavenge_entry(&entry);
                    log.record_scavenged(entry);
                });
            }
        });
    }

    fn scavenge_unit(&self, chunk: &Arc<Chunk>, cancel: &CancellationToken) -> ScavengeEntry {
        let started = Instant::now();
        let (start, end) = (chunk.start_number(), chunk.end_number());
        let header = ChunkHeader::new_scavenged(
            start,
            end,
            chunk.start_position(),
            chunk.end_position(),
            chunk.header().chunk_size,
            Timestamp::now().as_micros(),
        );

        let outcome = self
            .rewrite(std::slice::from_ref(chunk), header, chunk.version() + 1, cancel)
            .and_then(|rewrite| match rewrite {
                Rewrite::Unchanged => Ok((false, 0, 0)),
                Rewrite::Replaced {
                    chunk: replacement,
                    removed,
                } => {
                    let saved = chunk.physical_size() as i64 - replacement.physical_size() as i64;
                    self.db.replace_chunks(replacement)?;
                    Ok((true, saved, removed))
                }
            });

        match outcome {
            Ok((scavenged, space_saved, records_removed)) => {
                debug!(
                    target: "eventlog::scavenge",
                    chunk_start = start,
                    chunk_end = end,
                    scavenged,
                    space_saved,
                    records_removed,
                    "Chunk scavenged"
                );
                ScavengeEntry {
                    chunk_start: start,
                    chunk_end: end,
                    scavenged,
                    space_saved,
                    records_removed,
                    elapsed: started.elapsed(),
                    status: EntryStatus::Success,
                }
            }
            Err(LogError::ScavengeCancelled) => ScavengeEntry {
                elapsed: started.elapsed(),
                ..ScavengeEntry::stopped(start, end)
            },
            Err(e) => {
                warn!(target: "eventlog::scavenge", chunk_start = start, chunk_end = end, error = %e, "Scavenging chunk failed");
                ScavengeEntry::failed(start, end, e.to_string(), started.elapsed())
            }
        }
    }

    // ========================================================================
    // Merge phase
    // ========================================================================

    fn merge_phase(
        &self,
        end_chunk: u32,
        cancel: &CancellationToken,
        log: &ScavengeLog,
    ) -> LogResult<()> {
        let capacity = u64::from(self.db.config().chunk_size);
        let chunks = self.db.completed_chunks(0, end_chunk);

        let mut group: Vec<Arc<Chunk>> = Vec::new();
        let mut group_size = 0u64;
        for chunk in chunks.into_iter().filter(|c| c.end_number() <= end_chunk) {
            // Merged output carries a position map entry for every record
            let size = chunk.data_size() + chunk.record_count() * POSMAP_ENTRY_SIZE as u64;
            if chunk.corruption().is_some() || group_size + size > capacity {
                self.merge_group(&group, cancel, log)?;
                group.clear();
                group_size = 0;
                if chunk.corruption().is_some() {
                    continue;
                }
            }
            group_size += size;
            group.push(chunk);
        }
        self.merge_group(&group, cancel, log)
    }

    fn merge_group(
        &self,
        group: &[Arc<Chunk>],
        cancel: &CancellationToken,
        log: &ScavengeLog,
    ) -> LogResult<()> {
        if group.len() < 2 {
            return Ok(());
        }
        if cancel.is_cancelled() {
            return Err(LogError::ScavengeCancelled);
        }
        let started = Instant::now();
        let first = &group[0];
        let last = &group[group.len() - 1];
        let (start, end) = (first.start_number(), last.end_number());
        let header = ChunkHeader::new_scavenged(
            start,
            end,
            first.start_position(),
            last.end_position(),
            self.db.config().chunk_size,
            Timestamp::now().as_micros(),
        );
        let version = group.iter().map(|c| c.version()).max().unwrap_or(0) + 1;
        let before: u64 = group.iter().map(|c| c.physical_size()).sum();

        let outcome = self
            .rewrite(group, header, version, cancel)
            .and_then(|rewrite| match rewrite {
                Rewrite::Unchanged => Err(LogError::chunk_corrupted(
                    format!("{}-{}", start, end),
                    "merge produced no replacement",
                )),
                Rewrite::Replaced { chunk, removed } => {
                    let saved = before as i64 - chunk.physical_size() as i64;
                    self.db.replace_chunks(chunk)?;
                    Ok((saved, removed))
                }
            });

        let entry = match outcome {
            Ok((space_saved, records_removed)) => {
                info!(
                    target: "eventlog::scavenge",
                    chunk_start = start,
                    chunk_end = end,
                    chunks = group.len(),
                    space_saved,
                    "Chunks merged"
                );
                ScavengeEntry {
                    chunk_start: start,
                    chunk_end: end,
                    scavenged: true,
                    space_saved,
                    records_removed,
                    elapsed: started.elapsed(),
                    status: EntryStatus::Success,
                }
            }
            Err(LogError::ScavengeCancelled) => return Err(LogError::ScavengeCancelled),
            Err(e) => {
                warn!(target: "eventlog::scavenge", chunk_start = start, chunk_end = end, error = %e, "Merging chunks failed");
                ScavengeEntry::failed(start, end, e.to_string(), started.elapsed())
            }
        };
        self.observer.on_scavenge_entry(&entry);
        log.record_merged(entry);
        Ok(())
    }

    // ========================================================================
    // Rewrite
    // ========================================================================

    /// Copy the surviving records of `sources` into a new chunk.
    ///
    /// With a single source and nothing removed the partial output is
    /// discarded and `Unchanged` returned.
    fn rewrite(
        &self,
        sources: &[Arc<Chunk>],
        header: ChunkHeader,
        version: u32,
        cancel: &CancellationToken,
    ) -> LogResult<Rewrite> {
        let mut builder = ChunkBuilder::create(self.db.config().dir(), header, version)?;
        let mut removed = 0u64;
        let mut seen = 0usize;

        for source in sources {
            let mut reader = source.acquire_reader()?;
            let end = source.end_position();
            let mut position = source.start_position();
            while let Some(frame) = reader.read_next_frame(position, end)? {
                if seen % CANCEL_CHECK_INTERVAL == 0 && cancel.is_cancelled() {
                    return Err(LogError::ScavengeCancelled);
                }
                seen += 1;
                position = frame.next_position;

                let superseded = match frame.decode()? {
                    Some(LogRecord::Prepare(prepare)) => self.policy.is_superseded(&prepare),
                    _ => false,
                };
                if superseded {
                    removed += 1;
                    continue;
                }
                builder.append(frame.position, &frame.frame)?;
            }
        }

        if sources.len() == 1 && removed == 0 {
            return Ok(Rewrite::Unchanged);
        }
        if cancel.is_cancelled() {
            return Err(LogError::ScavengeCancelled);
        }
        let chunk = builder.finish(self.db.config().reader_pool())?;
        Ok(Rewrite::Replaced { chunk, removed })
    }
}

enum Rewrite {
    Unchanged,
    Replaced { chunk: Chunk, removed: u64 },
}

impl std::fmt::Debug for Scavenger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scavenger").field("db", &self.db).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checkpoint::CheckpointSet;
    use crate::db::DbConfig;
    use crate::observer::NoopObserver;
    use crate::scavenge::{KeepAll, NoIndex};
    use crate::writer::LogWriter;
    use eventlog_core::PrepareRecord;

    struct Fixture {
        db: Arc<ChunkDb>,
        writer: LogWriter,
        _checkpoints: CheckpointSet,
    }

    fn fixture() -> Fixture {
        let checkpoints = CheckpointSet::in_memory();
        let db = Arc::new(
            ChunkDb::open(
                DbConfig::in_memory().with_chunk_size(4096),
                &checkpoints,
                Arc::new(NoopObserver),
            )
            .unwrap(),
        );
        let writer = LogWriter::new(
            Arc::clone(&db),
            Arc::clone(&checkpoints.writer),
            Arc::new(NoopObserver),
        );
        Fixture {
            db,
            writer,
            _checkpoints: checkpoints,
        }
    }

    fn write(f: &Fixture, stream: &str) -> i64 {
        f.writer
            .append(
                PrepareRecord::single_write(Uuid::new_v4(), stream, -1, "t", vec![0; 64], vec![])
                    .into(),
            )
            .unwrap()
    }

    fn scavenger(f: &Fixture, policy: Arc<dyn ScavengePolicy>) -> Scavenger {
        Scavenger::new(
            Arc::clone(&f.db),
            Arc::clone(f.writer.frontier()),
            policy,
            Arc::new(NoIndex),
            Arc::new(NoopObserver),
        )
    }

    fn streams(f: &Fixture) -> Vec<String> {
        let limit = f.writer.frontier().position();
        let mut out = Vec::new();
        let mut position = 0;
        while let Some(next) = f.db.read_next(position, limit).unwrap() {
            if let Some(LogRecord::Prepare(p)) = next.record {
                out.push(p.event_stream_id);
            }
            position = next.next_position;
        }
        out
    }

    #[test]
    fn test_keep_all_changes_nothing() {
        let f = fixture();
        for _ in 0..3 {
            write(&f, "a");
        }
        f.db.seal_active_chunk().unwrap();
        let before = f.db.chunks();

        let log = ScavengeLog::new();
        let result = scavenger(&f, Arc::new(KeepAll)).run(
            &ScavengeOptions::all(),
            &CancellationToken::new(),
            &log,
        );
        assert_eq!(result, ScavengeResult::Success);
        assert_eq!(log.scavenged().len(), 1);
        assert!(!log.scavenged()[0].scavenged);
        assert!(log.merged().is_empty());
        assert!(Arc::ptr_eq(&before[0], &f.db.chunks()[0]));
    }

    #[test]
    fn test_superseded_records_removed_positions_kept() {
        let f = fixture();
        write(&f, "drop");
        let keep = write(&f, "keep");
        write(&f, "drop");
        f.db.seal_active_chunk().unwrap();
        let tail = write(&f, "drop");

        let policy = |p: &PrepareRecord| p.event_stream_id == "drop";
        let log = ScavengeLog::new();
        let result = scavenger(&f, Arc::new(policy)).run(
            &ScavengeOptions::all(),
            &CancellationToken::new(),
            &log,
        );
        assert_eq!(result, ScavengeResult::Success);
        let entries = log.scavenged();
        assert_eq!(entries.len(), 1);
        assert!(entries[0].scavenged);
        assert_eq!(entries[0].records_removed, 2);
        assert!(entries[0].space_saved > 0);

        // The active chunk is never scavenged
        assert_eq!(streams(&f), vec!["keep".to_string(), "drop".to_string()]);
        let limit = f.writer.frontier().position();
        assert!(matches!(
            f.db.read_at(keep, limit).unwrap(),
            crate::db::ReadResult::Record(_)
        ));
        assert!(matches!(
            f.db.read_at(tail, limit).unwrap(),
            crate::db::ReadResult::Record(_)
        ));
        assert_eq!(f.db.read_at(0, limit).unwrap(), crate::db::ReadResult::Absent);
    }

    #[test]
    fn test_cancelled_run_is_stopped() {
        let f = fixture();
        write(&f, "drop");
        f.db.seal_active_chunk().unwrap();
        let before = f.db.chunks();

        let cancel = CancellationToken::new();
        cancel.cancel();
        let log = ScavengeLog::new();
        let result = scavenger(&f, Arc::new(|_: &PrepareRecord| true)).run(
            &ScavengeOptions::all(),
            &cancel,
            &log,
        );
        assert_eq!(result, ScavengeResult::Stopped);
        assert_eq!(log.scavenged()[0].status, EntryStatus::Stopped);
        assert!(Arc::ptr_eq(&before[0], &f.db.chunks()[0]));
    }

    #[test]
    fn test_background_handle() {
        let f = fixture();
        write(&f, "a");
        f.db.seal_active_chunk().unwrap();
        let handle = scavenger(&f, Arc::new(KeepAll))
            .start(ScavengeOptions::all().with_threads(2))
            .unwrap();
        assert_eq!(handle.wait(), ScavengeResult::Success);
        assert_eq!(handle.log().result(), ScavengeResult::Success);
    }

    #[test]
    fn test_chunk_sealed_ahead_of_checkpoint_is_skipped() {
        let f = fixture();
        write(&f, "drop");

        // A batch rolling over seals chunk 0 before the checkpoint moves
        while f.db.chunks().len() < 2 {
            let mut record = LogRecord::from(PrepareRecord::single_write(
                Uuid::new_v4(),
                "drop",
                -1,
                "t",
                vec![0; 64],
                vec![],
            ));
            record.set_log_position(f.db.write_position());
            f.db.append_active_chunk(&crate::format::encode(&record))
                .unwrap();
        }
        let before = f.db.chunks();
        assert!(before[0].is_completed());
        assert!(before[0].end_position() > f.writer.frontier().position());

        let log = ScavengeLog::new();
        let result = scavenger(&f, Arc::new(|_: &PrepareRecord| true)).run(
            &ScavengeOptions::all(),
            &CancellationToken::new(),
            &log,
        );
        assert_eq!(result, ScavengeResult::Success);
        assert!(log.scavenged().is_empty());
        assert!(log.merged().is_empty());
        assert!(Arc::ptr_eq(&before[0], &f.db.chunks()[0]));
    }

    #[test]
    fn test_empty_log_succeeds() {
        let f = fixture();
        let log = ScavengeLog::new();
        let result = scavenger(&f, Arc::new(KeepAll)).run(
            &ScavengeOptions::all(),
            &CancellationToken::new(),
            &log,
        );
        assert_eq!(result, ScavengeResult::Success);
        assert!(log.scavenged().is_empty());
    }
}
