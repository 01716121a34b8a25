//! Scavenged chunk construction.
//!
//! The scavenger streams surviving frames into a `ChunkBuilder`, which writes
//! them to `chunk-SSSSSS.VVVVVV.scavenge.tmp` (or a memory buffer). `finish`
//! appends the position map and footer, fsyncs and renames the file into
//! place. A builder dropped without `finish` removes its temp file, so a
//! cancelled or failed rewrite leaves nothing behind.

use super::{sync_dir, Chunk, ReaderPoolConfig};
use crate::db::naming;
use crate::error::{LogError, LogResult};
use crate::format::chunk::{encode_posmap, BodyChecksum};
use crate::format::{ChunkFooter, ChunkHeader, PosMapEntry};
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

enum Target {
    File {
        writer: BufWriter<File>,
        temp_path: PathBuf,
        final_path: PathBuf,
        dir: PathBuf,
    },
    Memory {
        image: Vec<u8>,
    },
}

/// Writes one scavenged chunk.
pub struct ChunkBuilder {
    header: ChunkHeader,
    version: u32,
    target: Option<Target>,
    checksum: BodyChecksum,
    data_size: u64,
    posmap: Vec<PosMapEntry>,
}

impl ChunkBuilder {
    /// Start a scavenged chunk with `header`, in `dir` or in memory.
    pub fn create(dir: Option<&Path>, header: ChunkHeader, version: u32) -> LogResult<Self> {
        let header_bytes = header.to_bytes();
        let mut checksum = BodyChecksum::new();
        checksum.update(&header_bytes);

        let target = match dir {
            Some(dir) => {
                let temp_path = naming::temp_chunk_path(dir, header.start_number, version);
                let final_path = naming::chunk_path(dir, header.start_number, version);
                let file = OpenOptions::new()
                    .create(true)
                    .write(true)
                    .truncate(true)
                    .open(&temp_path)?;
                let mut writer = BufWriter::new(file);
                writer.write_all(&header_bytes)?;
                Target::File {
                    writer,
                    temp_path,
                    final_path,
                    dir: dir.to_path_buf(),
                }
            }
            None => Target::Memory {
                image: header_bytes.to_vec(),
            },
        };

        Ok(ChunkBuilder {
            header,
            version,
            target: Some(target),
            checksum,
            data_size: 0,
            posmap: Vec::new(),
        })
    }

    /// Append a validated frame for the record at `position`.
    pub fn append(&mut self, position: i64, frame: &[u8]) -> LogResult<()> {
        if let Some(last) = self.posmap.last() {
            if position <= last.log_position {
                return Err(LogError::CorruptRecord {
                    position,
                    reason: format!("out of order after {}", last.log_position),
                });
            }
        }
        let data_offset = u32::try_from(self.data_size).map_err(|_| LogError::RecordTooLarge {
            size: frame.len(),
            capacity: u64::from(self.header.chunk_size),
        })?;

        match self.target.as_mut() {
            Some(Target::File { writer, .. }) => writer.write_all(frame)?,
            Some(Target::Memory { image }) => image.extend_from_slice(frame),
            None => return Err(LogError::chunk_corrupted(self.describe(), "builder already finished")),
        }
        self.checksum.update(frame);
        self.posmap.push(PosMapEntry {
            log_position: position,
            data_offset,
        });
        self.data_size += frame.len() as u64;
        Ok(())
    }

    /// Bytes of record data written so far
    pub fn data_size(&self) -> u64 {
        self.data_size
    }

    /// Records written so far
    pub fn record_count(&self) -> usize {
        self.posmap.len()
    }

    /// Seal the chunk and move it into place.
    pub fn finish(mut self, pool: ReaderPoolConfig) -> LogResult<Chunk> {
        let map_bytes = encode_posmap(&self.posmap);
        self.checksum.update(&map_bytes);
        let footer = ChunkFooter {
            is_completed: true,
            physical_data_size: self.data_size,
            logical_data_size: self.header.end_position - self.header.start_position,
            map_count: self.posmap.len() as u32,
            record_count: self.posmap.len() as u64,
            body_crc: std::mem::take(&mut self.checksum).finalize(),
        };
        let footer_bytes = footer.to_bytes();

        match self.target.take() {
            Some(Target::File {
                mut writer,
                temp_path,
                final_path,
                dir,
            }) => {
                writer.write_all(&map_bytes)?;
                writer.write_all(&footer_bytes)?;
                let file = writer.into_inner().map_err(|e| e.into_error())?;
                file.sync_all()?;
                drop(file);
                std::fs::rename(&temp_path, &final_path)?;
                sync_dir(&dir)?;
                debug!(
                    target: "eventlog::chunk",
                    path = %final_path.display(),
                    records = footer.record_count,
                    data_size = footer.physical_data_size,
                    "Finished scavenged chunk"
                );
                Chunk::open_completed(&final_path, self.version, pool, false)
            }
            Some(Target::Memory { mut image }) => {
                image.extend_from_slice(&map_bytes);
                image.extend_from_slice(&footer_bytes);
                let posmap = std::mem::take(&mut self.posmap);
                Chunk::completed_in_memory(self.header, self.version, image, footer, posmap, pool)
            }
            None => Err(LogError::chunk_corrupted(self.describe(), "builder already finished")),
        }
    }

    fn describe(&self) -> String {
        naming::chunk_file_name(self.header.start_number, self.version)
    }
}

impl Drop for ChunkBuilder {
    fn drop(&mut self) {
        if let Some(Target::File { temp_path, .. }) = self.target.take() {
            if let Err(e) = std::fs::remove_file(&temp_path) {
                warn!(target: "eventlog::chunk", path = %temp_path.display(), error = %e, "Failed to remove scavenge temp file");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::format::encode;
    use eventlog_core::{CommitRecord, LogRecord, Timestamp};
    use std::sync::Arc;
    use tempfile::tempdir;
    use uuid::Uuid;

    fn commit_frame(position: i64) -> Vec<u8> {
        encode(&LogRecord::Commit(CommitRecord {
            log_position: position,
            correlation_id: Uuid::new_v4(),
            transaction_position: position,
            first_event_number: 0,
            timestamp: Timestamp::EPOCH,
        }))
    }

    fn header() -> ChunkHeader {
        ChunkHeader::new_scavenged(2, 3, 1000, 5000, 4096, 0)
    }

    #[test]
    fn test_file_builder_produces_completed_chunk() {
        let dir = tempdir().unwrap();
        let mut builder = ChunkBuilder::create(Some(dir.path()), header(), 4).unwrap();
        builder.append(1000, &commit_frame(1000)).unwrap();
        builder.append(3000, &commit_frame(3000)).unwrap();
        let chunk = Arc::new(builder.finish(ReaderPoolConfig::default()).unwrap());

        assert!(chunk.is_scavenged());
        assert!(chunk.is_completed());
        assert_eq!(chunk.end_position(), 5000);
        assert_eq!(chunk.record_count(), 2);
        assert!(dir.path().join("chunk-000002.000004").exists());
        assert!(!dir.path().join("chunk-000002.000004.scavenge.tmp").exists());

        // Body checksum verifies on reopen
        let path = chunk.path().unwrap().to_path_buf();
        assert!(Chunk::open_completed(&path, 4, ReaderPoolConfig::default(), true).is_ok());

        let mut reader = chunk.acquire_reader().unwrap();
        assert!(reader.read_frame_at(2000, i64::MAX).unwrap().is_none());
        let read = reader.read_next_frame(1500, i64::MAX).unwrap().unwrap();
        assert_eq!(read.position, 3000);
        assert_eq!(read.next_position, 5000);
    }

    #[test]
    fn test_dropped_builder_removes_temp() {
        let dir = tempdir().unwrap();
        {
            let mut builder = ChunkBuilder::create(Some(dir.path()), header(), 1).unwrap();
            builder.append(1000, &commit_frame(1000)).unwrap();
            assert!(dir.path().join("chunk-000002.000001.scavenge.tmp").exists());
        }
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[test]
    fn test_empty_memory_chunk_keeps_range() {
        let builder = ChunkBuilder::create(None, header(), 1).unwrap();
        let chunk = Arc::new(builder.finish(ReaderPoolConfig::default()).unwrap());
        assert_eq!(chunk.start_position(), 1000);
        assert_eq!(chunk.end_position(), 5000);
        assert_eq!(chunk.physical_size(), 0);
        let mut reader = chunk.acquire_reader().unwrap();
        assert!(reader.scan().unwrap().is_empty());
    }

    #[test]
    fn test_out_of_order_append_rejected() {
        let mut builder = ChunkBuilder::create(None, header(), 1).unwrap();
        builder.append(3000, &commit_frame(3000)).unwrap();
        assert!(builder.append(1000, &commit_frame(1000)).is_err());
    }
}
