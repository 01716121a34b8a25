//! Chunk file naming.
//!
//! Chunk files are named `chunk-SSSSSS.VVVVVV` where `SSSSSS` is the first
//! chunk number covered and `VVVVVV` the version. Each scavenge rewrite of a
//! range bumps the version, so on open the highest version per start number
//! wins. In-progress rewrites use a `.scavenge.tmp` suffix.

use std::path::{Path, PathBuf};

const PREFIX: &str = "chunk-";
const TEMP_SUFFIX: &str = ".scavenge.tmp";

/// File name for a chunk.
pub fn chunk_file_name(start_number: u32, version: u32) -> String {
    format!("{}{:06}.{:06}", PREFIX, start_number, version)
}

/// Path of a chunk inside `dir`.
pub fn chunk_path(dir: &Path, start_number: u32, version: u32) -> PathBuf {
    dir.join(chunk_file_name(start_number, version))
}

/// Path of an in-progress scavenge rewrite.
pub fn temp_chunk_path(dir: &Path, start_number: u32, version: u32) -> PathBuf {
    dir.join(format!(
        "{}{}",
        chunk_file_name(start_number, version),
        TEMP_SUFFIX
    ))
}

/// Parse `chunk-SSSSSS.VVVVVV` into (start number, version).
pub fn parse_chunk_file_name(name: &str) -> Option<(u32, u32)> {
    let rest = name.strip_prefix(PREFIX)?;
    let (start, version) = rest.split_once('.')?;
    if start.len() != 6 || version.len() != 6 {
        return None;
    }
    if !start.bytes().all(|b| b.is_ascii_digit()) || !version.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    Some((start.parse().ok()?, version.parse().ok()?))
}

/// True for leftover scavenge temp files.
pub fn is_temp_chunk_file(name: &str) -> bool {
    name.starts_with(PREFIX) && name.ends_with(TEMP_SUFFIX)
}
