//! Open-time recovery of the chunk set.
//!
//! # Algorithm
//!
//! 1. Remove interrupted scavenge temp files
//! 2. Keep the highest version per start chunk number, delete the rest
//! 3. Compute the recovery target: the Writer checkpoint, lowered to the
//!    Truncate checkpoint when that is set
//! 4. Walk chunks in order:
//!    - files whose start number is covered by a previous merged chunk are orphans
//!    - chunks entirely below the target are opened read-only; a historical
//!      chunk that fails validation becomes a corrupted placeholder
//!    - the chunk holding the target becomes the active chunk, cut back to it;
//!      a scavenged chunk holding the target is dropped whole
//!    - chunks past the target are deleted
//! 5. Create a fresh active chunk if the target sits on a chunk boundary
//! 6. Rewrite checkpoints if the target moved, and clear Truncate
//!
//! A Writer checkpoint past the end of the data is `ChunkCorrupted`.

use super::naming;
use super::DbConfig;
use crate::checkpoint::{Checkpoint, CheckpointSet, UNSET};
use crate::chunk::{Chunk, ChunkProbe};
use crate::error::{LogError, LogResult};
use crate::format::ChunkHeader;
use crate::observer::LogObserver;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};

#[derive(Debug)]
struct ChunkFile {
    start_number: u32,
    version: u32,
    path: PathBuf,
}

/// Rebuild the chunk set for `config`, applying checkpoint directives.
pub(crate) fn recover(
    config: &DbConfig,
    checkpoints: &CheckpointSet,
    observer: &dyn LogObserver,
) -> LogResult<Vec<Arc<Chunk>>> {
    let pool = config.reader_pool();
    let Some(dir) = config.dir() else {
        return Ok(vec![Arc::new(Chunk::create_active(
            None,
            0,
            0,
            config.chunk_size,
            pool,
        )?)]);
    };
    std::fs::create_dir_all(dir)?;

    let writer = checkpoints.writer.read().max(0);
    let truncate = checkpoints.truncate.read();
    let mut target = writer;
    if truncate != UNSET && truncate < target {
        info!(target: "eventlog::recovery", writer, truncate, "Applying truncate checkpoint");
        target = truncate.max(0);
    }

    let files = list_chunk_files(dir)?;
    let mut chunks: Vec<Arc<Chunk>> = Vec::with_capacity(files.len() + 1);
    let mut active: Option<Arc<Chunk>> = None;
    let mut expected_number = 0u32;
    let mut prev_end = 0i64;

    for (idx, file) in files.iter().enumerate() {
        if active.is_some() {
            warn!(target: "eventlog::recovery", path = %file.path.display(), "Removing chunk past the writer checkpoint");
            std::fs::remove_file(&file.path)?;
            continue;
        }
        if file.start_number < expected_number {
            warn!(target: "eventlog::recovery", path = %file.path.display(), "Removing chunk covered by a merged chunk");
            std::fs::remove_file(&file.path)?;
            continue;
        }
        if file.start_number > expected_number {
            return Err(LogError::chunk_corrupted(
                naming::chunk_file_name(expected_number, 0),
                "chunk file missing",
            ));
        }
        let next = files.get(idx + 1);

        let probe = match Chunk::probe(&file.path) {
            Ok(probe) => probe,
            Err(LogError::ChunkCorrupted { reason, .. }) => {
                // Unreadable header: only recoverable if a later chunk bounds it
                let chunk = placeholder(file, prev_end, next, target, &reason)?;
                observer.on_chunk_corrupted(&chunk.describe(), &reason);
                expected_number = chunk.end_number() + 1;
                prev_end = chunk.end_position();
                chunks.push(Arc::new(chunk));
                continue;
            }
            Err(e) => return Err(e),
        };
        let header = probe.header;
        check_contiguous(file, &header, expected_number, prev_end)?;
        let start = header.start_position;

        match probe.footer {
            Some(footer) if start + footer.logical_data_size <= target => {
                let end = start + footer.logical_data_size;
                let chunk = match Chunk::open_completed(
                    &file.path,
                    file.version,
                    pool,
                    config.verify_checksums_on_open,
                ) {
                    Ok(chunk) => chunk,
                    Err(LogError::ChunkCorrupted { reason, .. }) => {
                        warn!(target: "eventlog::recovery", path = %file.path.display(), %reason, "Isolating corrupted chunk");
                        observer.on_chunk_corrupted(&file_name(&file.path), &reason);
                        Chunk::corrupted(
                            &file.path,
                            file.version,
                            ChunkHeader {
                                end_position: end,
                                ..header
                            },
                            reason,
                        )
                    }
                    Err(e) => return Err(e),
                };
                debug!(target: "eventlog::recovery", chunk = %chunk.describe(), "Opened completed chunk");
                expected_number = header.end_number + 1;
                prev_end = end;
                chunks.push(Arc::new(chunk));
            }
            Some(_) if header.is_scavenged => {
                // Truncation point inside a scavenged chunk: drop it whole
                warn!(
                    target: "eventlog::recovery",
                    path = %file.path.display(),
                    target,
                    new_target = start,
                    "Truncating into a scavenged chunk, dropping it"
                );
                std::fs::remove_file(&file.path)?;
                target = start;
                let chunk = Chunk::create_active(
                    Some(dir),
                    header.start_number,
                    start,
                    config.chunk_size,
                    pool,
                )?;
                active = Some(Arc::new(chunk));
            }
            Some(_) => {
                info!(target: "eventlog::recovery", path = %file.path.display(), target, "Reopening completed chunk for truncation");
                let chunk =
                    Chunk::open_active(&file.path, file.version, (target - start) as u64, pool)?;
                active = Some(Arc::new(chunk));
            }
            None => {
                if let Some(bound) = historical_bound(next, target)? {
                    let reason = "missing or invalid footer";
                    warn!(target: "eventlog::recovery", path = %file.path.display(), reason, "Isolating corrupted chunk");
                    observer.on_chunk_corrupted(&file_name(&file.path), reason);
                    let chunk = Chunk::corrupted(
                        &file.path,
                        file.version,
                        ChunkHeader {
                            end_number: bound.0 - 1,
                            end_position: bound.1,
                            ..header
                        },
                        reason,
                    );
                    expected_number = bound.0;
                    prev_end = bound.1;
                    chunks.push(Arc::new(chunk));
                    continue;
                }
                if header.is_scavenged {
                    return Err(LogError::chunk_corrupted(
                        file_name(&file.path),
                        "scavenged chunk without footer",
                    ));
                }
                if target < start {
                    return Err(LogError::chunk_corrupted(
                        file_name(&file.path),
                        "chunk starts past the writer checkpoint",
                    ));
                }
                let chunk =
                    Chunk::open_active(&file.path, file.version, (target - start) as u64, pool)?;
                active = Some(Arc::new(chunk));
            }
        }
    }

    let active = match active {
        Some(active) => active,
        None => {
            if prev_end != target {
                return Err(LogError::chunk_corrupted(
                    naming::chunk_file_name(expected_number, 0),
                    format!(
                        "writer checkpoint at {} is past the end of log data at {}",
                        target, prev_end
                    ),
                ));
            }
            Arc::new(Chunk::create_active(
                Some(dir),
                expected_number,
                prev_end,
                config.chunk_size,
                pool,
            )?)
        }
    };
    chunks.push(active);

    if target != checkpoints.writer.read() || truncate != UNSET {
        fix_checkpoints(checkpoints, target)?;
    }

    info!(
        target: "eventlog::recovery",
        dir = %dir.display(),
        chunks = chunks.len(),
        write_position = target,
        "Recovered chunk set"
    );
    Ok(chunks)
}

/// List chunk files, removing temp files and superseded versions.
fn list_chunk_files(dir: &Path) -> LogResult<Vec<ChunkFile>> {
    let mut by_start: BTreeMap<u32, Vec<(u32, PathBuf)>> = BTreeMap::new();
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        let name = entry.file_name().to_string_lossy().into_owned();
        if naming::is_temp_chunk_file(&name) {
            warn!(target: "eventlog::recovery", file = %name, "Removing interrupted scavenge output");
            std::fs::remove_file(entry.path())?;
            continue;
        }
        if let Some((start, version)) = naming::parse_chunk_file_name(&name) {
            by_start
                .entry(start)
                .or_default()
                .push((version, entry.path()));
        }
    }

    let mut files = Vec::with_capacity(by_start.len());
    for (start_number, mut versions) in by_start {
        versions.sort_by_key(|(version, _)| *version);
        let Some((version, path)) = versions.pop() else {
            continue;
        };
        for (_, stale) in versions {
            debug!(target: "eventlog::recovery", path = %stale.display(), "Removing superseded chunk version");
            std::fs::remove_file(&stale)?;
        }
        files.push(ChunkFile {
            start_number,
            version,
            path,
        });
    }
    Ok(files)
}

fn check_contiguous(
    file: &ChunkFile,
    header: &ChunkHeader,
    expected_number: u32,
    prev_end: i64,
) -> LogResult<()> {
    if header.start_number != expected_number || header.start_number != file.start_number {
        return Err(LogError::chunk_corrupted(
            file_name(&file.path),
            format!(
                "header chunk number {} does not match expected {}",
                header.start_number, expected_number
            ),
        ));
    }
    if header.start_position != prev_end {
        return Err(LogError::chunk_corrupted(
            file_name(&file.path),
            format!(
                "chunk starts at {} but previous chunk ends at {}",
                header.start_position, prev_end
            ),
        ));
    }
    Ok(())
}

/// (next start number, next start position) when the following chunk
/// proves this one is historical.
fn historical_bound(next: Option<&ChunkFile>, target: i64) -> LogResult<Option<(u32, i64)>> {
    let Some(next) = next else {
        return Ok(None);
    };
    let probe: ChunkProbe = match Chunk::probe(&next.path) {
        Ok(probe) => probe,
        Err(LogError::ChunkCorrupted { .. }) => return Ok(None),
        Err(e) => return Err(e),
    };
    if probe.header.start_position <= target {
        Ok(Some((probe.header.start_number, probe.header.start_position)))
    } else {
        Ok(None)
    }
}

fn placeholder(
    file: &ChunkFile,
    prev_end: i64,
    next: Option<&ChunkFile>,
    target: i64,
    reason: &str,
) -> LogResult<Chunk> {
    let Some((next_number, next_start)) = historical_bound(next, target)? else {
        return Err(LogError::chunk_corrupted(file_name(&file.path), reason));
    };
    warn!(target: "eventlog::recovery", path = %file.path.display(), reason, "Isolating chunk with unreadable header");
    let mut header = ChunkHeader::new_raw(file.start_number, prev_end, 0, 0);
    header.end_number = next_number.saturating_sub(1).max(file.start_number);
    header.end_position = next_start;
    Ok(Chunk::corrupted(&file.path, file.version, header, reason))
}

fn fix_checkpoints(checkpoints: &CheckpointSet, target: i64) -> LogResult<()> {
    checkpoints.writer.write(target);
    checkpoints.writer.flush()?;
    if checkpoints.chaser.read() > target {
        checkpoints.chaser.write(target);
        checkpoints.chaser.flush()?;
    }
    checkpoints.truncate.write(UNSET);
    checkpoints.truncate.flush()?;
    info!(target: "eventlog::recovery", writer = target, "Checkpoints adjusted to recovered log end");
    Ok(())
}

fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::observer::NoopObserver;
    use tempfile::tempdir;

    #[test]
    fn test_fresh_directory_gets_chunk_zero() {
        let dir = tempdir().unwrap();
        let config = DbConfig::for_testing(dir.path());
        let checkpoints = CheckpointSet::in_memory();
        let chunks = recover(&config, &checkpoints, &NoopObserver).unwrap();
        assert_eq!(chunks.len(), 1);
        assert!(!chunks[0].is_completed());
        assert!(dir.path().join("chunk-000000.000000").exists());
    }

    #[test]
    fn test_writer_checkpoint_without_data_is_corrupt() {
        let dir = tempdir().unwrap();
        let config = DbConfig::for_testing(dir.path());
        let checkpoints = CheckpointSet::in_memory();
        checkpoints.writer.write(500);
        checkpoints.writer.flush().unwrap();
        let err = recover(&config, &checkpoints, &NoopObserver).unwrap_err();
        assert!(matches!(err, LogError::ChunkCorrupted { .. }));
    }

    #[test]
    fn test_temp_and_stale_files_removed() {
        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join("chunk-000003.000001.scavenge.tmp"), b"partial").unwrap();
        std::fs::write(dir.path().join("chunk-000000.000000"), b"old").unwrap();
        std::fs::write(dir.path().join("chunk-000000.000002"), b"new").unwrap();

        let files = list_chunk_files(dir.path()).unwrap();
        assert_eq!(files.len(), 1);
        assert_eq!(files[0].version, 2);
        assert!(!dir.path().join("chunk-000000.000000").exists());
        assert!(!dir.path().join("chunk-000003.000001.scavenge.tmp").exists());
    }

    #[test]
    fn test_in_memory_starts_empty() {
        let config = DbConfig::in_memory();
        let chunks = recover(&config, &CheckpointSet::in_memory(), &NoopObserver).unwrap();
        assert_eq!(chunks.len(), 1);
        assert!(chunks[0].path().is_none());
        assert_eq!(chunks[0].end_position(), 0);
    }
}
