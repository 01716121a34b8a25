//! Chunk manager: the ordered set of chunks that makes up the log.
//!
//! `ChunkDb` owns the chunk list and resolves log positions to chunks. The
//! last chunk is always the active one; everything before it is completed.
//! Readers take a snapshot of the chunk they need under a short read lock
//! and keep it alive through their `Arc`, so a scavenge can swap chunks out
//! without disturbing in-flight reads.

pub mod config;
pub mod naming;
mod recovery;

pub use config::{ConfigError, DbConfig, MIN_CHUNK_SIZE};

use crate::checkpoint::CheckpointSet;
use crate::chunk::{Chunk, ChunkReader, FrameRead};
use crate::error::{LogError, LogResult};
use crate::format::{CHUNK_FOOTER_SIZE, CHUNK_HEADER_SIZE};
use crate::observer::LogObserver;
use eventlog_core::LogRecord;
use parking_lot::{Mutex, RwLock};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Outcome of a point read.
#[derive(Debug, Clone, PartialEq)]
pub enum ReadResult {
    /// A record starts at the requested position
    Record(LogRecord),
    /// The position is at or past the durable end of the log
    EndOfLog,
    /// No record starts there (removed by scavenge, or not a record boundary
    /// of a scavenged chunk)
    Absent,
}

/// One record of a forward scan.
#[derive(Debug, Clone)]
pub struct NextRecord {
    /// Position of the record
    pub position: i64,
    /// Position to continue scanning from
    pub next_position: i64,
    /// Encoded frame length
    pub frame_len: usize,
    /// Decoded record, `None` for kinds this build does not know
    pub record: Option<LogRecord>,
}

impl NextRecord {
    fn from_frame(frame: FrameRead) -> LogResult<Self> {
        let record = frame.decode()?;
        Ok(NextRecord {
            position: frame.position,
            next_position: frame.next_position,
            frame_len: frame.frame.len(),
            record,
        })
    }
}

/// The chunk set of one log database.
pub struct ChunkDb {
    config: DbConfig,
    chunks: RwLock<Vec<Arc<Chunk>>>,
    append_lock: Mutex<()>,
    observer: Arc<dyn LogObserver>,
}

impl ChunkDb {
    /// Open the chunk set, running recovery against `checkpoints`.
    pub fn open(
        config: DbConfig,
        checkpoints: &CheckpointSet,
        observer: Arc<dyn LogObserver>,
    ) -> LogResult<Self> {
        config.validate()?;
        let chunks = recovery::recover(&config, checkpoints, observer.as_ref())?;
        let db = ChunkDb {
            config,
            chunks: RwLock::new(chunks),
            append_lock: Mutex::new(()),
            observer,
        };
        db.refresh_cache();
        Ok(db)
    }

    /// Configuration this database was opened with
    pub fn config(&self) -> &DbConfig {
        &self.config
    }

    /// Snapshot of the current chunk list, oldest first
    pub fn chunks(&self) -> Vec<Arc<Chunk>> {
        self.chunks.read().clone()
    }

    /// Position the next append will be written at
    pub fn write_position(&self) -> i64 {
        self.chunks.read().last().map_or(0, |c| c.end_position())
    }

    fn active_chunk(&self) -> LogResult<Arc<Chunk>> {
        self.chunks
            .read()
            .last()
            .filter(|c| !c.is_completed())
            .cloned()
            .ok_or_else(|| LogError::chunk_corrupted("active", "no active chunk"))
    }

    // ========================================================================
    // Writing
    // ========================================================================

    /// Append an encoded frame to the active chunk, sealing it and opening
    /// the next one when it is full. Returns the frame's position.
    ///
    /// The caller encodes the frame for [`ChunkDb::write_position`]; the
    /// position does not move when the chunk rolls over.
    pub fn append_active_chunk(&self, frame: &[u8]) -> LogResult<i64> {
        let _guard = self.append_lock.lock();
        let capacity = u64::from(self.config.chunk_size);
        if frame.len() as u64 > capacity {
            return Err(LogError::RecordTooLarge {
                size: frame.len(),
                capacity,
            });
        }

        let active = self.active_chunk()?;
        let position = active.end_position();
        if let Some(max_log_size) = self.config.max_log_size {
            if position as u64 + frame.len() as u64 > max_log_size {
                return Err(LogError::DatabaseFull {
                    position,
                    size: frame.len(),
                    max_log_size,
                });
            }
        }

        if let Some(offset) = active.append(frame)? {
            return Ok(active.start_position() + offset as i64);
        }
        let next = self.seal_locked(&active)?;
        match next.append(frame)? {
            Some(offset) => Ok(next.start_position() + offset as i64),
            None => Err(LogError::RecordTooLarge {
                size: frame.len(),
                capacity,
            }),
        }
    }

    /// Seal the active chunk and start a new one. A no-op when the active
    /// chunk holds no data.
    pub fn seal_active_chunk(&self) -> LogResult<()> {
        let _guard = self.append_lock.lock();
        let active = self.active_chunk()?;
        if active.data_size() == 0 {
            debug!(target: "eventlog::db", chunk = active.start_number(), "Active chunk empty, not sealing");
            return Ok(());
        }
        self.seal_locked(&active)?;
        Ok(())
    }

    fn seal_locked(&self, active: &Arc<Chunk>) -> LogResult<Arc<Chunk>> {
        active.flush()?;
        active.complete()?;
        self.observer
            .on_chunk_completed(active.start_number(), active.end_number());

        let next = Arc::new(Chunk::create_active(
            self.config.dir(),
            active.end_number() + 1,
            active.end_position(),
            self.config.chunk_size,
            self.config.reader_pool(),
        )?);
        self.chunks.write().push(Arc::clone(&next));
        self.refresh_cache();
        info!(
            target: "eventlog::db",
            sealed = active.start_number(),
            next = next.start_number(),
            position = next.start_position(),
            "Chunk sealed"
        );
        Ok(next)
    }

    /// Make everything appended so far durable.
    pub fn flush(&self) -> LogResult<()> {
        self.active_chunk()?.flush()
    }

    // ========================================================================
    // Reading
    // ========================================================================

    /// Chunk whose range holds `position`. The active chunk also answers for
    /// its current end.
    pub fn chunk_for(&self, position: i64) -> Option<Arc<Chunk>> {
        let chunks = self.chunks.read();
        let idx = chunks.partition_point(|c| c.start_position() <= position);
        if idx == 0 {
            return None;
        }
        Some(Arc::clone(&chunks[idx - 1]))
    }

    /// Take a reader on the chunk holding `position`.
    pub fn reader_for(&self, position: i64) -> LogResult<Option<ChunkReader>> {
        // The list lock is released before waiting on the reader pool
        let Some(chunk) = self.chunk_for(position) else {
            return Ok(None);
        };
        chunk.acquire_reader().map(Some)
    }

    /// Read the record starting exactly at `position`, seeing only data
    /// before `limit`.
    ///
    /// A position inside a raw chunk that is not a record boundary is
    /// `CorruptRecord`; so is a record kind this build does not know.
    pub fn read_at(&self, position: i64, limit: i64) -> LogResult<ReadResult> {
        if position < 0 {
            return Ok(ReadResult::Absent);
        }
        if position >= limit {
            return Ok(ReadResult::EndOfLog);
        }
        let Some(chunk) = self.chunk_for(position) else {
            return Ok(ReadResult::Absent);
        };
        if position >= chunk.end_position() {
            return Ok(ReadResult::EndOfLog);
        }

        let mut reader = chunk.acquire_reader()?;
        match reader.read_frame_at(position, limit)? {
            Some(frame) => match frame.decode()? {
                Some(record) => Ok(ReadResult::Record(record)),
                None => Err(LogError::CorruptRecord {
                    position,
                    reason: "unknown record kind".to_string(),
                }),
            },
            None if chunk.is_scavenged() => Ok(ReadResult::Absent),
            None => Ok(ReadResult::EndOfLog),
        }
    }

    /// First record at or after `position` that ends by `limit`, crossing
    /// into later chunks as needed.
    pub fn read_next(&self, position: i64, limit: i64) -> LogResult<Option<NextRecord>> {
        let mut position = position.max(0);
        loop {
            if position >= limit {
                return Ok(None);
            }
            let Some(chunk) = self.chunk_for(position) else {
                return Ok(None);
            };
            let mut reader = chunk.acquire_reader()?;
            if let Some(frame) = reader.read_next_frame(position, limit)? {
                return NextRecord::from_frame(frame).map(Some);
            }
            drop(reader);

            // Nothing left in this chunk: move on if it is sealed and durable
            let end = chunk.end_position();
            if chunk.is_completed() && end > position && end <= limit {
                position = end;
                continue;
            }
            return Ok(None);
        }
    }

    // ========================================================================
    // Scavenge support
    // ========================================================================

    /// Completed chunks overlapping chunk numbers `first..=last`, in order.
    pub fn completed_chunks(&self, first: u32, last: u32) -> Vec<Arc<Chunk>> {
        self.chunks
            .read()
            .iter()
            .filter(|c| c.is_completed() && c.end_number() >= first && c.start_number() <= last)
            .cloned()
            .collect()
    }

    /// Number of the last completed chunk ending at or before `limit`.
    ///
    /// A batch that rolls over seals a chunk before its Writer checkpoint is
    /// written, so a completed chunk is not necessarily durable yet.
    pub fn last_completed_number(&self, limit: i64) -> Option<u32> {
        self.chunks
            .read()
            .iter()
            .rev()
            .find(|c| c.is_completed() && c.end_position() <= limit)
            .map(|c| c.end_number())
    }

    /// Swap the completed chunks covered by `replacement` for it.
    ///
    /// The replacement must cover exactly the numbers and positions of a run
    /// of existing completed chunks. The old chunks are marked for deletion
    /// and disappear once their last reader is dropped.
    pub fn replace_chunks(&self, replacement: Chunk) -> LogResult<Arc<Chunk>> {
        let replacement = Arc::new(replacement);
        let mut chunks = self.chunks.write();
        let mismatch = |reason: &str| LogError::chunk_corrupted(replacement.describe(), reason);

        let first = chunks
            .iter()
            .position(|c| c.start_number() == replacement.start_number())
            .ok_or_else(|| mismatch("no chunk starts at the replacement's first number"))?;
        let last = chunks[first..]
            .iter()
            .position(|c| c.end_number() == replacement.end_number())
            .map(|i| first + i)
            .ok_or_else(|| mismatch("no chunk ends at the replacement's last number"))?;
        let replaced = &chunks[first..=last];

        if replaced.iter().any(|c| !c.is_completed()) {
            return Err(mismatch("cannot replace the active chunk"));
        }
        if replaced[0].start_position() != replacement.start_position()
            || replaced[replaced.len() - 1].end_position() != replacement.end_position()
        {
            return Err(mismatch("position range differs from the replaced chunks"));
        }

        let old: Vec<Arc<Chunk>> = chunks
            .splice(first..=last, std::iter::once(Arc::clone(&replacement)))
            .collect();
        drop(chunks);
        self.refresh_cache();

        for chunk in &old {
            if chunk.path() != replacement.path() {
                chunk.mark_for_deletion();
            }
        }
        info!(
            target: "eventlog::db",
            replacement = %replacement.describe(),
            replaced = old.len(),
            "Chunks replaced"
        );
        Ok(replacement)
    }

    /// Hold the newest completed chunks in memory within
    /// [`DbConfig::cached_chunks_size`]; older ones are released.
    fn refresh_cache(&self) {
        let budget = self.config.cached_chunks_size;
        let mut used = 0u64;
        let mut full = false;
        for chunk in self.chunks().iter().rev().filter(|c| c.is_completed()) {
            let size = chunk.physical_size() + (CHUNK_HEADER_SIZE + CHUNK_FOOTER_SIZE) as u64;
            if full || used + size > budget {
                full = true;
                chunk.uncache();
                continue;
            }
            match chunk.cache() {
                Ok(bytes) => used += bytes,
                Err(e) => {
                    warn!(target: "eventlog::db", chunk = %chunk.describe(), error = %e, "Caching chunk failed");
                }
            }
        }
        debug!(target: "eventlog::db", cached_bytes = used, budget, "Chunk cache refreshed");
    }

    /// Flush the active chunk. Chunks close when the last handle drops.
    pub fn close(&self) -> LogResult<()> {
        self.flush()?;
        debug!(target: "eventlog::db", position = self.write_position(), "Chunk database closed");
        Ok(())
    }
}

impl std::fmt::Debug for ChunkDb {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChunkDb")
            .field("chunks", &self.chunks.read().len())
            .field("write_position", &self.write_position())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checkpoint::Checkpoint;
    use crate::chunk::ChunkBuilder;
    use crate::format::{encode, ChunkHeader};
    use crate::observer::NoopObserver;
    use eventlog_core::{CommitRecord, Timestamp};
    use tempfile::tempdir;
    use uuid::Uuid;

    fn commit_at(position: i64) -> Vec<u8> {
        encode(&LogRecord::Commit(CommitRecord {
            log_position: position,
            correlation_id: Uuid::new_v4(),
            transaction_position: position,
            first_event_number: 0,
            timestamp: Timestamp::EPOCH,
        }))
    }

    fn append(db: &ChunkDb) -> i64 {
        let frame = commit_at(db.write_position());
        db.append_active_chunk(&frame).unwrap()
    }

    fn open_memory(chunk_size: u32) -> ChunkDb {
        ChunkDb::open(
            DbConfig::in_memory().with_chunk_size(chunk_size),
            &CheckpointSet::in_memory(),
            Arc::new(NoopObserver),
        )
        .unwrap()
    }

    #[test]
    fn test_positions_are_gap_free_across_chunks() {
        let db = open_memory(1024);
        let mut positions = Vec::new();
        for _ in 0..40 {
            positions.push(append(&db));
        }
        assert!(db.chunks().len() > 1);
        let limit = db.write_position();

        let mut position = 0;
        let mut seen = Vec::new();
        while let Some(next) = db.read_next(position, limit).unwrap() {
            seen.push(next.position);
            position = next.next_position;
        }
        assert_eq!(seen, positions);

        for window in db.chunks().windows(2) {
            assert_eq!(window[0].end_position(), window[1].start_position());
            assert_eq!(window[0].end_number() + 1, window[1].start_number());
        }
    }

    #[test]
    fn test_read_at_results() {
        let db = open_memory(4096);
        let a = append(&db);
        let b = append(&db);
        let limit = db.write_position();

        assert!(matches!(db.read_at(a, limit).unwrap(), ReadResult::Record(_)));
        assert!(matches!(db.read_at(b, limit).unwrap(), ReadResult::Record(_)));
        assert_eq!(db.read_at(limit, limit).unwrap(), ReadResult::EndOfLog);
        assert_eq!(db.read_at(b, b).unwrap(), ReadResult::EndOfLog);
        assert!(matches!(
            db.read_at(a + 1, limit),
            Err(LogError::CorruptRecord { .. })
        ));
    }

    #[test]
    fn test_record_too_large() {
        let db = open_memory(1024);
        let big = vec![0u8; 2048];
        assert!(matches!(
            db.append_active_chunk(&big),
            Err(LogError::RecordTooLarge { .. })
        ));
    }

    #[test]
    fn test_database_full() {
        let db = ChunkDb::open(
            DbConfig::in_memory().with_max_log_size(100),
            &CheckpointSet::in_memory(),
            Arc::new(NoopObserver),
        )
        .unwrap();
        append(&db);
        let mut result = Ok(0);
        for _ in 0..10 {
            result = db.append_active_chunk(&commit_at(db.write_position()));
            if result.is_err() {
                break;
            }
        }
        assert!(matches!(result, Err(LogError::DatabaseFull { .. })));
        assert!(db.write_position() <= 100);
    }

    #[test]
    fn test_seal_empty_active_is_noop() {
        let db = open_memory(4096);
        db.seal_active_chunk().unwrap();
        assert_eq!(db.chunks().len(), 1);
        append(&db);
        db.seal_active_chunk().unwrap();
        assert_eq!(db.chunks().len(), 2);
        assert!(db.chunks()[0].is_completed());
    }

    #[test]
    fn test_replace_chunks_swaps_range() {
        let db = open_memory(1024);
        while db.chunks().len() < 3 {
            append(&db);
        }
        let chunks = db.chunks();
        let (first, second) = (&chunks[0], &chunks[1]);
        let header = ChunkHeader::new_scavenged(
            first.start_number(),
            second.end_number(),
            first.start_position(),
            second.end_position(),
            1024,
            0,
        );
        let builder = ChunkBuilder::create(None, header, 1).unwrap();
        let replacement = builder.finish(db.config().reader_pool()).unwrap();
        db.replace_chunks(replacement).unwrap();

        let chunks = db.chunks();
        assert_eq!(chunks.len(), 2);
        assert!(chunks[0].is_scavenged());
        assert_eq!(chunks[0].end_number(), 1);

        // Everything removed: reads find nothing until the active chunk
        let next = db.read_next(0, db.write_position()).unwrap().unwrap();
        assert_eq!(next.position, chunks[1].start_position());
        assert_eq!(db.read_at(0, db.write_position()).unwrap(), ReadResult::Absent);
    }

    #[test]
    fn test_replace_rejects_active_chunk() {
        let db = open_memory(4096);
        append(&db);
        let active = &db.chunks()[0];
        let header =
            ChunkHeader::new_scavenged(0, 0, 0, active.end_position(), 4096, 0);
        let replacement = ChunkBuilder::create(None, header, 1)
            .unwrap()
            .finish(db.config().reader_pool())
            .unwrap();
        assert!(db.replace_chunks(replacement).is_err());
    }

    #[test]
    fn test_newest_completed_chunks_are_cached() {
        let dir = tempdir().unwrap();
        let config = DbConfig::for_testing(dir.path())
            .with_chunk_size(1024)
            .with_cached_chunks_size(2 * config::chunk_file_size(1024));
        let db = ChunkDb::open(config, &CheckpointSet::in_memory(), Arc::new(NoopObserver)).unwrap();
        let mut positions = Vec::new();
        while db.chunks().len() < 5 {
            positions.push(append(&db));
        }

        let chunks = db.chunks();
        let cached: Vec<bool> = chunks.iter().map(|c| c.is_cached()).collect();
        assert_eq!(cached, vec![false, false, true, true, false]);

        // Reads of a cached chunk no longer touch its file
        let cached_chunk = &chunks[3];
        let path = cached_chunk.path().unwrap().to_path_buf();
        let len = std::fs::metadata(&path).unwrap().len() as usize;
        std::fs::write(&path, vec![0u8; len]).unwrap();
        let limit = db.write_position();
        for &position in positions.iter().filter(|p| cached_chunk.contains(**p)) {
            assert!(matches!(db.read_at(position, limit).unwrap(), ReadResult::Record(_)));
        }
    }

    #[test]
    fn test_zero_budget_disables_cache() {
        let dir = tempdir().unwrap();
        let config = DbConfig::for_testing(dir.path())
            .with_chunk_size(1024)
            .with_cached_chunks_size(0);
        let db = ChunkDb::open(config, &CheckpointSet::in_memory(), Arc::new(NoopObserver)).unwrap();
        while db.chunks().len() < 3 {
            append(&db);
        }
        assert!(db.chunks().iter().all(|c| !c.is_cached()));
    }

    #[test]
    fn test_reopen_recovers_to_writer_checkpoint() {
        let dir = tempdir().unwrap();
        let checkpoints = CheckpointSet::open(dir.path()).unwrap();
        let config = DbConfig::for_testing(dir.path()).with_chunk_size(1024);
        let durable = {
            let db = ChunkDb::open(config.clone(), &checkpoints, Arc::new(NoopObserver)).unwrap();
            for _ in 0..30 {
                append(&db);
            }
            db.flush().unwrap();
            let durable = db.write_position();
            checkpoints.writer.write(durable);
            checkpoints.writer.flush().unwrap();
            // Written but never covered by the checkpoint
            append(&db);
            db.flush().unwrap();
            durable
        };

        let db = ChunkDb::open(config, &checkpoints, Arc::new(NoopObserver)).unwrap();
        assert_eq!(db.write_position(), durable);
        let mut count = 0;
        let mut position = 0;
        while let Some(next) = db.read_next(position, durable).unwrap() {
            count += 1;
            position = next.next_position;
        }
        assert_eq!(count, 30);
    }
}
