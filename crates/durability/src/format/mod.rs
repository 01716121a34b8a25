//! On-disk byte formats for log records and chunk files.
//!
//! Keeping serialization separate from the chunk and manager logic makes
//! format evolution easier to manage.
//!
//! # Module Structure
//!
//! - `log_record`: record frame and per-kind bodies
//! - `chunk`: chunk header, footer and position map

pub mod chunk;
pub mod log_record;

pub use chunk::{
    ChunkFooter, ChunkFormatError, ChunkHeader, PosMapEntry, CHUNK_FOOTER_SIZE,
    CHUNK_FORMAT_VERSION, CHUNK_HEADER_SIZE, CHUNK_MAGIC, POSMAP_ENTRY_SIZE,
};
pub use log_record::{
    decode, decode_body, encode, frame_size, read_frame, CodecError, RawFrame,
    LOG_RECORD_VERSION,
};
