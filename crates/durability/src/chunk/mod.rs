//! Log chunks.
//!
//! A chunk holds a contiguous range of the log. There are three shapes:
//!
//! - **Active**: raw, writable, no footer. Exactly one per database.
//! - **Completed raw**: sealed with a footer, records at `position - start`.
//! - **Scavenged**: rewritten by the scavenger; may cover several chunk
//!   numbers and locates records through a position map.
//!
//! Chunks live either in a file or, for in-memory databases, in a byte
//! buffer holding the same image a file would.
//!
//! A completed chunk that failed validation on open is kept as a corrupted
//! placeholder so the positions it covers stay accounted for; every read
//! from it reports `ChunkCorrupted`.

pub mod builder;
pub mod reader;

pub use builder::ChunkBuilder;
pub use reader::{ChunkReader, ReaderPolicy, ReaderPoolConfig};

use crate::error::{LogError, LogResult};
use crate::format::chunk::{decode_posmap, BodyChecksum};
use crate::format::log_record::{decode_body, read_frame, FRAME_OVERHEAD};
use crate::format::{
    ChunkFooter, ChunkHeader, CodecError, PosMapEntry, CHUNK_FOOTER_SIZE, CHUNK_HEADER_SIZE,
    POSMAP_ENTRY_SIZE,
};
use eventlog_core::{LogRecord, Timestamp};
use parking_lot::{Mutex, RwLock};
use reader::{ReaderHandle, ReaderPool};
use std::fs::{File, OpenOptions};
use std::io::{BufReader, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, trace, warn};

const HEADER: u64 = CHUNK_HEADER_SIZE as u64;

/// One record frame read from a chunk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FrameRead {
    /// Log position of the record
    pub position: i64,
    /// Validated frame bytes
    pub frame: Vec<u8>,
    /// Position of the next record in the log
    pub next_position: i64,
}

impl FrameRead {
    /// Interpret the frame. `Ok(None)` for record kinds this build does not know.
    pub fn decode(&self) -> LogResult<Option<LogRecord>> {
        let raw = read_frame(&self.frame).map_err(|e| LogError::corrupt_record(self.position, e))?;
        match decode_body(&raw) {
            Ok(record) => Ok(Some(record)),
            Err(CodecError::UnknownRecordType(tag)) => {
                trace!(target: "eventlog::chunk", position = self.position, tag, "Skipping unknown record kind");
                Ok(None)
            }
            Err(e) => Err(LogError::corrupt_record(self.position, e)),
        }
    }
}

enum Backing {
    Disk { path: PathBuf },
    Memory { bytes: RwLock<Vec<u8>> },
}

struct Completion {
    footer: ChunkFooter,
    posmap: Vec<PosMapEntry>,
}

struct Appender {
    file: Option<File>,
    checksum: BodyChecksum,
    record_count: u64,
}

/// Header and, when valid, footer of a chunk file.
#[derive(Debug, Clone, Copy)]
pub struct ChunkProbe {
    /// Parsed header
    pub header: ChunkHeader,
    /// Footer if the chunk was completed
    pub footer: Option<ChunkFooter>,
    /// File length in bytes
    pub file_len: u64,
}

/// One segment of the log.
pub struct Chunk {
    header: ChunkHeader,
    version: u32,
    backing: Backing,
    data_size: AtomicU64,
    completion: RwLock<Option<Completion>>,
    appender: Mutex<Option<Appender>>,
    pool: ReaderPool,
    corruption: Option<String>,
    delete_on_drop: AtomicBool,
    cached: RwLock<Option<Arc<[u8]>>>,
}

impl Chunk {
    /// Create a new empty active chunk, in `dir` or in memory.
    pub fn create_active(
        dir: Option<&Path>,
        chunk_number: u32,
        start_position: i64,
        chunk_size: u32,
        pool: ReaderPoolConfig,
    ) -> LogResult<Chunk> {
        let header = ChunkHeader::new_raw(
            chunk_number,
            start_position,
            chunk_size,
            Timestamp::now().as_micros(),
        );
        let header_bytes = header.to_bytes();
        let mut checksum = BodyChecksum::new();
        checksum.update(&header_bytes);

        let (backing, file) = match dir {
            Some(dir) => {
                let path = crate::db::naming::chunk_path(dir, chunk_number, 0);
                let mut file = OpenOptions::new()
                    .create_new(true)
                    .read(true)
                    .write(true)
                    .open(&path)?;
                file.write_all(&header_bytes)?;
                file.sync_all()?;
                sync_dir(dir)?;
                (Backing::Disk { path }, Some(file))
            }
            None => (
                Backing::Memory {
                    bytes: RwLock::new(header_bytes.to_vec()),
                },
                None,
            ),
        };

        debug!(target: "eventlog::chunk", chunk = chunk_number, start_position, "Created active chunk");
        Chunk::assemble(
            header,
            0,
            backing,
            0,
            None,
            Some(Appender {
                file,
                checksum,
                record_count: 0,
            }),
            pool,
        )
    }

    /// Read the header and, if present, the footer of a chunk file.
    pub fn probe(path: &Path) -> LogResult<ChunkProbe> {
        let mut file = File::open(path)?;
        let file_len = file.metadata()?.len();
        let name = display_name(path);
        if file_len < HEADER {
            return Err(LogError::chunk_corrupted(name, "file shorter than header"));
        }
        let mut header_bytes = [0u8; CHUNK_HEADER_SIZE];
        file.read_exact(&mut header_bytes)?;
        let header = ChunkHeader::from_bytes(&header_bytes)
            .map_err(|e| LogError::chunk_corrupted(&name, e.to_string()))?;

        let mut footer = None;
        if file_len >= HEADER + CHUNK_FOOTER_SIZE as u64 {
            let mut footer_bytes = [0u8; CHUNK_FOOTER_SIZE];
            file.seek(SeekFrom::Start(file_len - CHUNK_FOOTER_SIZE as u64))?;
            file.read_exact(&mut footer_bytes)?;
            if let Ok(parsed) = ChunkFooter::from_bytes(&footer_bytes) {
                let expected = HEADER
                    + parsed.physical_data_size
                    + u64::from(parsed.map_count) * POSMAP_ENTRY_SIZE as u64
                    + CHUNK_FOOTER_SIZE as u64;
                if parsed.is_completed && expected == file_len {
                    footer = Some(parsed);
                }
            }
        }
        Ok(ChunkProbe {
            header,
            footer,
            file_len,
        })
    }

    /// Open a completed chunk read-only, validating header, footer and
    /// (optionally) the body checksum.
    pub fn open_completed(
        path: &Path,
        version: u32,
        pool: ReaderPoolConfig,
        verify_body: bool,
    ) -> LogResult<Chunk> {
        let name = display_name(path);
        let probe = Chunk::probe(path)?;
        let header = probe.header;
        let footer = probe
            .footer
            .ok_or_else(|| LogError::chunk_corrupted(&name, "missing or invalid footer"))?;

        if !header.is_scavenged {
            if footer.map_count != 0 || footer.logical_data_size != footer.physical_data_size as i64 {
                return Err(LogError::chunk_corrupted(&name, "raw chunk sizes disagree"));
            }
            if footer.physical_data_size > u64::from(header.chunk_size) {
                return Err(LogError::chunk_corrupted(&name, "data exceeds chunk capacity"));
            }
        } else if header.start_position + footer.logical_data_size != header.end_position {
            return Err(LogError::chunk_corrupted(&name, "logical range disagrees with header"));
        }

        let mut file = File::open(path)?;
        let posmap = if footer.map_count > 0 {
            let mut bytes = vec![0u8; footer.map_count as usize * POSMAP_ENTRY_SIZE];
            file.seek(SeekFrom::Start(HEADER + footer.physical_data_size))?;
            file.read_exact(&mut bytes)?;
            decode_posmap(&bytes).map_err(|e| LogError::chunk_corrupted(&name, e.to_string()))?
        } else {
            Vec::new()
        };

        if verify_body {
            let body_len = probe.file_len - CHUNK_FOOTER_SIZE as u64;
            file.seek(SeekFrom::Start(0))?;
            let mut reader = BufReader::new(file.take(body_len));
            let mut checksum = BodyChecksum::new();
            let mut buf = vec![0u8; 64 * 1024];
            loop {
                let n = reader.read(&mut buf)?;
                if n == 0 {
                    break;
                }
                checksum.update(&buf[..n]);
            }
            let computed = checksum.finalize();
            if computed != footer.body_crc {
                return Err(LogError::chunk_corrupted(
                    &name,
                    format!(
                        "body checksum mismatch: expected {:08x}, computed {:08x}",
                        footer.body_crc, computed
                    ),
                ));
            }
        }

        Chunk::assemble(
            header,
            version,
            Backing::Disk {
                path: path.to_path_buf(),
            },
            footer.physical_data_size,
            Some(Completion { footer, posmap }),
            None,
            pool,
        )
    }

    /// Open a raw chunk for appending with `data_size` bytes of trusted data.
    ///
    /// Bytes past `data_size` (and any footer) are cut off. Every frame in
    /// the kept range is validated; a bad frame is `ChunkCorrupted`.
    pub fn open_active(
        path: &Path,
        version: u32,
        data_size: u64,
        pool: ReaderPoolConfig,
    ) -> LogResult<Chunk> {
        let name = display_name(path);
        let mut file = OpenOptions::new().read(true).write(true).open(path)?;
        let file_len = file.metadata()?.len();
        let mut header_bytes = [0u8; CHUNK_HEADER_SIZE];
        file.read_exact(&mut header_bytes)?;
        let header = ChunkHeader::from_bytes(&header_bytes)
            .map_err(|e| LogError::chunk_corrupted(&name, e.to_string()))?;
        if header.is_scavenged {
            return Err(LogError::chunk_corrupted(&name, "scavenged chunk cannot be active"));
        }
        if data_size > u64::from(header.chunk_size) || file_len < HEADER + data_size {
            return Err(LogError::chunk_corrupted(
                &name,
                format!(
                    "writer checkpoint at {} is past the end of chunk data",
                    header.start_position + data_size as i64
                ),
            ));
        }
        if file_len > HEADER + data_size {
            warn!(
                target: "eventlog::chunk",
                chunk = %name,
                discarded = file_len - HEADER - data_size,
                "Discarding bytes past the writer checkpoint"
            );
            file.set_len(HEADER + data_size)?;
            file.sync_all()?;
        }

        let mut checksum = BodyChecksum::new();
        checksum.update(&header_bytes);
        let mut record_count = 0u64;
        let mut reader = BufReader::new(&file);
        reader.seek(SeekFrom::Start(HEADER))?;
        let mut offset = 0u64;
        while offset < data_size {
            let position = header.start_position + offset as i64;
            let frame = read_frame_from(&mut reader, data_size - offset)
                .map_err(|reason| LogError::chunk_corrupted(&name, format!("record at {}: {}", position, reason)))?;
            let raw = read_frame(&frame)
                .map_err(|e| LogError::chunk_corrupted(&name, format!("record at {}: {}", position, e)))?;
            if raw.log_position != position {
                return Err(LogError::chunk_corrupted(
                    &name,
                    format!("record at {} claims position {}", position, raw.log_position),
                ));
            }
            checksum.update(&frame);
            offset += frame.len() as u64;
            record_count += 1;
        }
        drop(reader);

        debug!(target: "eventlog::chunk", chunk = %name, data_size, record_count, "Opened active chunk");
        Chunk::assemble(
            header,
            version,
            Backing::Disk {
                path: path.to_path_buf(),
            },
            data_size,
            None,
            Some(Appender {
                file: Some(file),
                checksum,
                record_count,
            }),
            pool,
        )
    }

    /// Completed in-memory chunk built from a full chunk image.
    pub(crate) fn completed_in_memory(
        header: ChunkHeader,
        version: u32,
        image: Vec<u8>,
        footer: ChunkFooter,
        posmap: Vec<PosMapEntry>,
        pool: ReaderPoolConfig,
    ) -> LogResult<Chunk> {
        Chunk::assemble(
            header,
            version,
            Backing::Memory {
                bytes: RwLock::new(image),
            },
            footer.physical_data_size,
            Some(Completion { footer, posmap }),
            None,
            pool,
        )
    }

    /// Placeholder for a historical chunk that failed validation.
    pub fn corrupted(
        path: &Path,
        version: u32,
        header: ChunkHeader,
        reason: impl Into<String>,
    ) -> Chunk {
        let footer = ChunkFooter {
            is_completed: true,
            physical_data_size: 0,
            logical_data_size: header.end_position - header.start_position,
            map_count: 0,
            record_count: 0,
            body_crc: 0,
        };
        Chunk {
            header,
            version,
            backing: Backing::Disk {
                path: path.to_path_buf(),
            },
            data_size: AtomicU64::new(0),
            completion: RwLock::new(Some(Completion {
                footer,
                posmap: Vec::new(),
            })),
            appender: Mutex::new(None),
            pool: ReaderPool::new(ReaderPoolConfig::default(), Vec::new()),
            corruption: Some(reason.into()),
            delete_on_drop: AtomicBool::new(false),
            cached: RwLock::new(None),
        }
    }

    fn assemble(
        header: ChunkHeader,
        version: u32,
        backing: Backing,
        data_size: u64,
        completion: Option<Completion>,
        appender: Option<Appender>,
        pool: ReaderPoolConfig,
    ) -> LogResult<Chunk> {
        let mut initial = Vec::with_capacity(pool.initial);
        for _ in 0..pool.initial {
            initial.push(match &backing {
                Backing::Disk { path } => ReaderHandle::File(File::open(path)?),
                Backing::Memory { .. } => ReaderHandle::Memory,
            });
        }
        Ok(Chunk {
            header,
            version,
            backing,
            data_size: AtomicU64::new(data_size),
            completion: RwLock::new(completion),
            appender: Mutex::new(appender),
            pool: ReaderPool::new(pool, initial),
            corruption: None,
            delete_on_drop: AtomicBool::new(false),
            cached: RwLock::new(None),
        })
    }

    // ========================================================================
    // Accessors
    // ========================================================================

    /// Parsed header
    pub fn header(&self) -> &ChunkHeader {
        &self.header
    }

    /// File version (bumped by each scavenge rewrite)
    pub fn version(&self) -> u32 {
        self.version
    }

    /// First chunk number covered
    pub fn start_number(&self) -> u32 {
        self.header.start_number
    }

    /// Last chunk number covered
    pub fn end_number(&self) -> u32 {
        self.header.end_number
    }

    /// First log position covered
    pub fn start_position(&self) -> i64 {
        self.header.start_position
    }

    /// Position just past the last byte covered
    pub fn end_position(&self) -> i64 {
        match self.completion.read().as_ref() {
            Some(c) => self.header.start_position + c.footer.logical_data_size,
            None => self.header.start_position + self.data_size() as i64,
        }
    }

    /// Bytes of record data
    pub fn data_size(&self) -> u64 {
        self.data_size.load(Ordering::Acquire)
    }

    /// Data plus position map bytes
    pub fn physical_size(&self) -> u64 {
        let map = self
            .completion
            .read()
            .as_ref()
            .map_or(0, |c| c.posmap.len() as u64 * POSMAP_ENTRY_SIZE as u64);
        self.data_size() + map
    }

    /// Data capacity
    pub fn chunk_size(&self) -> u64 {
        u64::from(self.header.chunk_size)
    }

    /// Number of records held
    pub fn record_count(&self) -> u64 {
        if let Some(c) = self.completion.read().as_ref() {
            return c.footer.record_count;
        }
        self.appender.lock().as_ref().map_or(0, |a| a.record_count)
    }

    /// Sealed and read-only
    pub fn is_completed(&self) -> bool {
        self.completion.read().is_some()
    }

    /// Rewritten by the scavenger
    pub fn is_scavenged(&self) -> bool {
        self.header.is_scavenged
    }

    /// Failure reason for a corrupted placeholder
    pub fn corruption(&self) -> Option<&str> {
        self.corruption.as_deref()
    }

    /// Backing file, `None` in memory
    pub fn path(&self) -> Option<&Path> {
        match &self.backing {
            Backing::Disk { path } => Some(path),
            Backing::Memory { .. } => None,
        }
    }

    /// Human-readable identifier for logs and errors
    pub fn describe(&self) -> String {
        match &self.backing {
            Backing::Disk { path } => display_name(path),
            Backing::Memory { .. } => format!(
                "memory-chunk-{}-{}.{}",
                self.header.start_number, self.header.end_number, self.version
            ),
        }
    }

    /// True if `position` lies inside this chunk's logical range
    pub fn contains(&self, position: i64) -> bool {
        position >= self.start_position() && position < self.end_position()
    }

    pub(crate) fn pool(&self) -> &ReaderPool {
        &self.pool
    }

    /// Remove the backing file once the last reference is dropped.
    pub fn mark_for_deletion(&self) {
        self.delete_on_drop.store(true, Ordering::Release);
    }

    // ========================================================================
    // Caching
    // ========================================================================

    /// Load the whole file of a completed chunk into memory so reads stop
    /// touching the disk. Returns the bytes now held, 0 when the chunk
    /// cannot be cached (active, in memory, corrupted).
    pub fn cache(&self) -> LogResult<u64> {
        if let Some(image) = self.cached.read().as_ref() {
            return Ok(image.len() as u64);
        }
        let Backing::Disk { path } = &self.backing else {
            return Ok(0);
        };
        if self.corruption.is_some() || !self.is_completed() {
            return Ok(0);
        }
        let image: Arc<[u8]> = std::fs::read(path)?.into();
        let len = image.len() as u64;
        *self.cached.write() = Some(image);
        trace!(target: "eventlog::chunk", chunk = %self.describe(), bytes = len, "Chunk cached");
        Ok(len)
    }

    /// Drop the in-memory image, if any
    pub fn uncache(&self) {
        if self.cached.write().take().is_some() {
            trace!(target: "eventlog::chunk", chunk = %self.describe(), "Chunk uncached");
        }
    }

    /// True while reads are served from memory
    pub fn is_cached(&self) -> bool {
        self.cached.read().is_some()
    }

    /// Full image of an in-memory chunk; `None` for file-backed chunks.
    pub fn memory_image(&self) -> Option<Vec<u8>> {
        match &self.backing {
            Backing::Memory { bytes } => Some(bytes.read().clone()),
            Backing::Disk { .. } => None,
        }
    }

    // ========================================================================
    // Writing
    // ========================================================================

    /// Append a frame to the active chunk.
    ///
    /// Returns the data offset it was written at, or `None` if it does not
    /// fit in the remaining capacity.
    pub fn append(&self, frame: &[u8]) -> LogResult<Option<u64>> {
        let mut guard = self.appender.lock();
        let appender = guard
            .as_mut()
            .ok_or_else(|| LogError::chunk_corrupted(self.describe(), "append to completed chunk"))?;

        let offset = self.data_size();
        let len = frame.len() as u64;
        if offset + len > self.chunk_size() {
            return Ok(None);
        }

        match (&self.backing, appender.file.as_mut()) {
            (Backing::Disk { .. }, Some(file)) => {
                file.seek(SeekFrom::Start(HEADER + offset))?;
                file.write_all(frame)?;
            }
            (Backing::Memory { bytes }, _) => {
                let mut bytes = bytes.write();
                bytes.truncate((HEADER + offset) as usize);
                bytes.extend_from_slice(frame);
            }
            (Backing::Disk { .. }, None) => {
                return Err(LogError::chunk_corrupted(self.describe(), "active chunk has no file"));
            }
        }

        appender.checksum.update(frame);
        appender.record_count += 1;
        self.data_size.store(offset + len, Ordering::Release);
        Ok(Some(offset))
    }

    /// Make appended bytes durable.
    pub fn flush(&self) -> LogResult<()> {
        if let Some(Appender {
            file: Some(file), ..
        }) = self.appender.lock().as_mut()
        {
            file.sync_data()?;
        }
        Ok(())
    }

    /// Seal the chunk: write the footer, fsync and make it read-only.
    ///
    /// A no-op for chunks that are already completed.
    pub fn complete(&self) -> LogResult<()> {
        let mut guard = self.appender.lock();
        let Some(appender) = guard.as_mut() else {
            return Ok(());
        };

        let size = self.data_size();
        let footer = ChunkFooter {
            is_completed: true,
            physical_data_size: size,
            logical_data_size: size as i64,
            map_count: 0,
            record_count: appender.record_count,
            body_crc: std::mem::take(&mut appender.checksum).finalize(),
        };
        let footer_bytes = footer.to_bytes();

        match (&self.backing, appender.file.as_mut()) {
            (Backing::Disk { .. }, Some(file)) => {
                file.seek(SeekFrom::Start(HEADER + size))?;
                file.write_all(&footer_bytes)?;
                file.set_len(HEADER + size + CHUNK_FOOTER_SIZE as u64)?;
                file.sync_all()?;
            }
            (Backing::Memory { bytes }, _) => {
                let mut bytes = bytes.write();
                bytes.truncate((HEADER + size) as usize);
                bytes.extend_from_slice(&footer_bytes);
            }
            (Backing::Disk { .. }, None) => {
                return Err(LogError::chunk_corrupted(self.describe(), "active chunk has no file"));
            }
        }

        *self.completion.write() = Some(Completion {
            footer,
            posmap: Vec::new(),
        });
        *guard = None;
        debug!(
            target: "eventlog::chunk",
            chunk = %self.describe(),
            data_size = size,
            records = footer.record_count,
            "Completed chunk"
        );
        Ok(())
    }

    // ========================================================================
    // Reading
    // ========================================================================

    /// Take a reader from this chunk's pool.
    pub fn acquire_reader(self: &Arc<Self>) -> LogResult<ChunkReader> {
        if let Some(reason) = &self.corruption {
            return Err(LogError::chunk_corrupted(self.describe(), reason.clone()));
        }
        let handle = self.pool.acquire(self.header.start_number, || match &self.backing {
            Backing::Disk { path } => File::open(path).map(ReaderHandle::File),
            Backing::Memory { .. } => Ok(ReaderHandle::Memory),
        })?;
        Ok(ChunkReader::new(Arc::clone(self), handle))
    }

    pub(crate) fn read_frame_at(
        &self,
        handle: &mut ReaderHandle,
        position: i64,
        limit: i64,
    ) -> LogResult<Option<FrameRead>> {
        if position < self.start_position() || position >= self.end_position().min(limit) {
            return Ok(None);
        }

        let located = {
            let completion = self.completion.read();
            match completion.as_ref() {
                Some(c) if self.header.is_scavenged => {
                    match c.posmap.binary_search_by_key(&position, |e| e.log_position) {
                        Ok(i) => {
                            let entry = c.posmap[i];
                            let next = c.posmap.get(i + 1);
                            let data_end = next.map_or(c.footer.physical_data_size, |n| u64::from(n.data_offset));
                            let next_position = next.map_or(
                                self.header.start_position + c.footer.logical_data_size,
                                |n| n.log_position,
                            );
                            Some((u64::from(entry.data_offset), data_end, Some(next_position)))
                        }
                        Err(_) => None,
                    }
                }
                _ => Some(((position - self.start_position()) as u64, self.data_size(), None)),
            }
        };
        let Some((offset, data_end, scavenged_next)) = located else {
            return Ok(None);
        };

        let limit_end = match scavenged_next {
            Some(_) => data_end,
            None => data_end.min((limit - self.start_position()) as u64),
        };
        let Some(frame) = self.read_frame_bytes(handle, position, offset, data_end, limit_end)? else {
            return Ok(None);
        };
        let next_position = scavenged_next.unwrap_or(position + frame.len() as i64);
        if next_position > limit {
            return Ok(None);
        }
        Ok(Some(FrameRead {
            position,
            frame,
            next_position,
        }))
    }

    pub(crate) fn read_next_frame(
        &self,
        handle: &mut ReaderHandle,
        position: i64,
        limit: i64,
    ) -> LogResult<Option<FrameRead>> {
        let position = position.max(self.start_position());
        if !self.header.is_scavenged {
            return self.read_frame_at(handle, position, limit);
        }
        let next = {
            let completion = self.completion.read();
            completion.as_ref().and_then(|c| {
                let idx = c.posmap.partition_point(|e| e.log_position < position);
                c.posmap.get(idx).map(|e| e.log_position)
            })
        };
        match next {
            Some(next) => self.read_frame_at(handle, next, limit),
            None => Ok(None),
        }
    }

    /// Read one validated frame at data `offset`.
    ///
    /// `data_end` is the end of valid data; a frame overrunning it is
    /// corrupt. `limit_end` is the end of durable data; a frame overrunning
    /// only that is not readable yet.
    fn read_frame_bytes(
        &self,
        handle: &mut ReaderHandle,
        position: i64,
        offset: u64,
        data_end: u64,
        limit_end: u64,
    ) -> LogResult<Option<Vec<u8>>> {
        if offset + 4 > limit_end {
            return Ok(None);
        }
        let mut len_bytes = [0u8; 4];
        self.read_bytes(handle, HEADER + offset, &mut len_bytes)?;
        let len = u64::from(u32::from_le_bytes(len_bytes));
        if len < FRAME_OVERHEAD as u64 || offset + 4 + len > data_end {
            return Err(LogError::CorruptRecord {
                position,
                reason: format!("frame length {} overruns chunk data", len),
            });
        }
        if offset + 4 + len > limit_end {
            return Ok(None);
        }

        let mut frame = vec![0u8; (4 + len) as usize];
        self.read_bytes(handle, HEADER + offset, &mut frame)?;
        let raw = read_frame(&frame).map_err(|e| LogError::corrupt_record(position, e))?;
        if raw.log_position != position {
            return Err(LogError::CorruptRecord {
                position,
                reason: format!("frame claims position {}", raw.log_position),
            });
        }
        Ok(Some(frame))
    }

    fn read_bytes(&self, handle: &mut ReaderHandle, at: u64, buf: &mut [u8]) -> LogResult<()> {
        if let Some(image) = self.cached.read().as_ref() {
            return copy_range(image, at, buf);
        }
        match (handle, &self.backing) {
            (ReaderHandle::File(file), _) => {
                file.seek(SeekFrom::Start(at))?;
                file.read_exact(buf)?;
            }
            (ReaderHandle::Memory, Backing::Memory { bytes }) => {
                return copy_range(&bytes.read(), at, buf);
            }
            (ReaderHandle::Memory, Backing::Disk { .. }) => {
                return Err(std::io::Error::new(
                    std::io::ErrorKind::InvalidInput,
                    "memory reader used on file-backed chunk",
                )
                .into());
            }
        }
        Ok(())
    }
}

impl Drop for Chunk {
    fn drop(&mut self) {
        if !self.delete_on_drop.load(Ordering::Acquire) {
            return;
        }
        if let Backing::Disk { path } = &self.backing {
            match std::fs::remove_file(path) {
                Ok(()) => debug!(target: "eventlog::chunk", path = %path.display(), "Deleted replaced chunk"),
                Err(e) => warn!(target: "eventlog::chunk", path = %path.display(), error = %e, "Failed to delete replaced chunk"),
            }
        }
    }
}

impl std::fmt::Debug for Chunk {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Chunk")
            .field("name", &self.describe())
            .field("numbers", &(self.start_number()..=self.end_number()))
            .field("positions", &(self.start_position()..self.end_position()))
            .field("completed", &self.is_completed())
            .field("scavenged", &self.is_scavenged())
            .finish()
    }
}

/// Read one length-prefixed frame from a sequential reader.
fn read_frame_from(reader: &mut impl Read, remaining: u64) -> Result<Vec<u8>, String> {
    if remaining < 4 {
        return Err("truncated length prefix".to_string());
    }
    let mut len_bytes = [0u8; 4];
    reader.read_exact(&mut len_bytes).map_err(|e| e.to_string())?;
    let len = u64::from(u32::from_le_bytes(len_bytes));
    if len < FRAME_OVERHEAD as u64 || 4 + len > remaining {
        return Err(format!("frame length {} overruns chunk data", len));
    }
    let mut frame = vec![0u8; (4 + len) as usize];
    frame[..4].copy_from_slice(&len_bytes);
    reader.read_exact(&mut frame[4..]).map_err(|e| e.to_string())?;
    Ok(frame)
}

fn copy_range(bytes: &[u8], at: u64, buf: &mut [u8]) -> LogResult<()> {
    let start = at as usize;
    let end = start + buf.len();
    if end > bytes.len() {
        return Err(std::io::Error::from(std::io::ErrorKind::UnexpectedEof).into());
    }
    buf.copy_from_slice(&bytes[start..end]);
    Ok(())
}

fn display_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string())
}

/// Fsync a directory so renames and creations inside it are durable.
pub(crate) fn sync_dir(dir: &Path) -> std::io::Result<()> {
    File::open(dir)?.sync_all()
}
