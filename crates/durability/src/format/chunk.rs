//! Chunk file format.
//!
//! A chunk is one segment of the log. Raw chunks hold records exactly as the
//! writer appended them; scavenged chunks hold the surviving records of one or
//! more original chunks plus a position map from original log position to
//! offset in the data region.
//!
//! # File Layout
//!
//! ```text
//! ┌────────────────────────────────────┐
//! │ Header (128 bytes)                 │
//! ├────────────────────────────────────┤
//! │ Data: record frames                │
//! ├────────────────────────────────────┤
//! │ Position map (scavenged only)      │
//! ├────────────────────────────────────┤
//! │ Footer (64 bytes, completed only)  │
//! └────────────────────────────────────┘
//! ```
//!
//! The active chunk has no footer; its data size is recovered from the
//! Writer checkpoint on open.

use crc32fast::Hasher;
use uuid::Uuid;

/// Magic bytes at the start of a chunk file: "ELCK"
pub const CHUNK_MAGIC: [u8; 4] = *b"ELCK";

/// Magic bytes at the start of a chunk footer: "ELCF"
pub const FOOTER_MAGIC: [u8; 4] = *b"ELCF";

/// Current chunk format version
pub const CHUNK_FORMAT_VERSION: u8 = 1;

/// Size of the chunk header in bytes
pub const CHUNK_HEADER_SIZE: usize = 128;

/// Size of the chunk footer in bytes
pub const CHUNK_FOOTER_SIZE: usize = 64;

/// Size of one position map entry in bytes
pub const POSMAP_ENTRY_SIZE: usize = 12;

const HEADER_FLAG_SCAVENGED: u8 = 0x01;
const FOOTER_FLAG_COMPLETED: u8 = 0x01;
const FOOTER_FLAG_HAS_POSMAP: u8 = 0x02;

/// Chunk header (128 bytes).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkHeader {
    /// Format version
    pub version: u8,
    /// Chunk holds a scavenged rewrite
    pub is_scavenged: bool,
    /// Data capacity in bytes
    pub chunk_size: u32,
    /// First chunk number covered
    pub start_number: u32,
    /// Last chunk number covered (equals `start_number` for raw chunks)
    pub end_number: u32,
    /// Global log position of the first byte covered
    pub start_position: i64,
    /// Upper bound of the logical range covered
    pub end_position: i64,
    /// Creation time, microseconds since epoch
    pub created_at: u64,
    /// Unique id of this chunk file
    pub chunk_id: Uuid,
}

impl ChunkHeader {
    /// Header for a new raw chunk.
    pub fn new_raw(chunk_number: u32, start_position: i64, chunk_size: u32, created_at: u64) -> Self {
        ChunkHeader {
            version: CHUNK_FORMAT_VERSION,
            is_scavenged: false,
            chunk_size,
            start_number: chunk_number,
            end_number: chunk_number,
            start_position,
            end_position: start_position + i64::from(chunk_size),
            created_at,
            chunk_id: Uuid::new_v4(),
        }
    }

    /// Header for a scavenged chunk covering `start_number..=end_number`.
    pub fn new_scavenged(
        start_number: u32,
        end_number: u32,
        start_position: i64,
        end_position: i64,
        chunk_size: u32,
        created_at: u64,
    ) -> Self {
        ChunkHeader {
            version: CHUNK_FORMAT_VERSION,
            is_scavenged: true,
            chunk_size,
            start_number,
            end_number,
            start_position,
            end_position,
            created_at,
            chunk_id: Uuid::new_v4(),
        }
    }

    /// Serialize header to bytes.
    pub fn to_bytes(&self) -> [u8; CHUNK_HEADER_SIZE] {
        let mut bytes = [0u8; CHUNK_HEADER_SIZE];
        bytes[0..4].copy_from_slice(&CHUNK_MAGIC);
        bytes[4] = self.version;
        bytes[5] = if self.is_scavenged {
            HEADER_FLAG_SCAVENGED
        } else {
            0
        };
        bytes[8..12].copy_from_slice(&self.chunk_size.to_le_bytes());
        bytes[12..16].copy_from_slice(&self.start_number.to_le_bytes());
        bytes[16..20].copy_from_slice(&self.end_number.to_le_bytes());
        bytes[24..32].copy_from_slice(&self.start_position.to_le_bytes());
        bytes[32..40].copy_from_slice(&self.end_position.to_le_bytes());
        bytes[40..48].copy_from_slice(&self.created_at.to_le_bytes());
        bytes[48..64].copy_from_slice(self.chunk_id.as_bytes());
        let crc = crc(&bytes[..CHUNK_HEADER_SIZE - 4]);
        bytes[CHUNK_HEADER_SIZE - 4..].copy_from_slice(&crc.to_le_bytes());
        bytes
    }

    /// Deserialize and validate a header.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, ChunkFormatError> {
        if bytes.len() < CHUNK_HEADER_SIZE {
            return Err(ChunkFormatError::Truncated("header"));
        }
        if bytes[0..4] != CHUNK_MAGIC {
            return Err(ChunkFormatError::InvalidMagic("header"));
        }
        let stored = le_u32(&bytes[CHUNK_HEADER_SIZE - 4..CHUNK_HEADER_SIZE]);
        let computed = crc(&bytes[..CHUNK_HEADER_SIZE - 4]);
        if stored != computed {
            return Err(ChunkFormatError::ChecksumMismatch {
                section: "header",
                expected: stored,
                computed,
            });
        }
        if bytes[4] != CHUNK_FORMAT_VERSION {
            return Err(ChunkFormatError::UnsupportedVersion(bytes[4]));
        }

        let mut id = [0u8; 16];
        id.copy_from_slice(&bytes[48..64]);
        let header = ChunkHeader {
            version: bytes[4],
            is_scavenged: bytes[5] & HEADER_FLAG_SCAVENGED != 0,
            chunk_size: le_u32(&bytes[8..12]),
            start_number: le_u32(&bytes[12..16]),
            end_number: le_u32(&bytes[16..20]),
            start_position: le_i64(&bytes[24..32]),
            end_position: le_i64(&bytes[32..40]),
            created_at: le_u64(&bytes[40..48]),
            chunk_id: Uuid::from_bytes(id),
        };
        if header.end_number < header.start_number {
            return Err(ChunkFormatError::InvalidFormat("end number before start number"));
        }
        Ok(header)
    }
}

/// Chunk footer (64 bytes), written when a chunk is completed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkFooter {
    /// Chunk is complete and read-only
    pub is_completed: bool,
    /// Bytes of record data in the file
    pub physical_data_size: u64,
    /// Length of the logical position range covered
    pub logical_data_size: i64,
    /// Number of position map entries
    pub map_count: u32,
    /// Number of records in the data region
    pub record_count: u64,
    /// CRC32 over header, data and position map
    pub body_crc: u32,
}

impl ChunkFooter {
    /// Serialize footer to bytes.
    pub fn to_bytes(&self) -> [u8; CHUNK_FOOTER_SIZE] {
        let mut bytes = [0u8; CHUNK_FOOTER_SIZE];
        bytes[0..4].copy_from_slice(&FOOTER_MAGIC);
        let mut flags = 0;
        if self.is_completed {
            flags |= FOOTER_FLAG_COMPLETED;
        }
        if self.map_count > 0 {
            flags |= FOOTER_FLAG_HAS_POSMAP;
        }
        bytes[4] = flags;
        bytes[8..16].copy_from_slice(&self.physical_data_size.to_le_bytes());
        bytes[16..24].copy_from_slice(&self.logical_data_size.to_le_bytes());
        bytes[24..28].copy_from_slice(&self.map_count.to_le_bytes());
        bytes[32..40].copy_from_slice(&self.record_count.to_le_bytes());
        bytes[40..44].copy_from_slice(&self.body_crc.to_le_bytes());
        let crc = crc(&bytes[..CHUNK_FOOTER_SIZE - 4]);
        bytes[CHUNK_FOOTER_SIZE - 4..].copy_from_slice(&crc.to_le_bytes());
        bytes
    }

    /// Deserialize and validate a footer.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, ChunkFormatError> {
        if bytes.len() < CHUNK_FOOTER_SIZE {
            return Err(ChunkFormatError::Truncated("footer"));
        }
        if bytes[0..4] != FOOTER_MAGIC {
            return Err(ChunkFormatError::InvalidMagic("footer"));
        }
        let stored = le_u32(&bytes[CHUNK_FOOTER_SIZE - 4..CHUNK_FOOTER_SIZE]);
        let computed = crc(&bytes[..CHUNK_FOOTER_SIZE - 4]);
        if stored != computed {
            return Err(ChunkFormatError::ChecksumMismatch {
                section: "footer",
                expected: stored,
                computed,
            });
        }
        Ok(ChunkFooter {
            is_completed: bytes[4] & FOOTER_FLAG_COMPLETED != 0,
            physical_data_size: le_u64(&bytes[8..16]),
            logical_data_size: le_i64(&bytes[16..24]),
            map_count: le_u32(&bytes[24..28]),
            record_count: le_u64(&bytes[32..40]),
            body_crc: le_u32(&bytes[40..44]),
        })
    }
}

/// Maps an original log position to an offset in a scavenged chunk's data.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PosMapEntry {
    /// Original global log position of the record
    pub log_position: i64,
    /// Offset of the record frame within the data region
    pub data_offset: u32,
}

/// Serialize a position map.
pub fn encode_posmap(entries: &[PosMapEntry]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(entries.len() * POSMAP_ENTRY_SIZE);
    for entry in entries {
        bytes.extend_from_slice(&entry.log_position.to_le_bytes());
        bytes.extend_from_slice(&entry.data_offset.to_le_bytes());
    }
    bytes
}

/// Deserialize a position map, checking entries are strictly ascending.
pub fn decode_posmap(bytes: &[u8]) -> Result<Vec<PosMapEntry>, ChunkFormatError> {
    if bytes.len() % POSMAP_ENTRY_SIZE != 0 {
        return Err(ChunkFormatError::InvalidFormat("position map length"));
    }
    let mut entries: Vec<PosMapEntry> = Vec::with_capacity(bytes.len() / POSMAP_ENTRY_SIZE);
    for raw in bytes.chunks_exact(POSMAP_ENTRY_SIZE) {
        let entry = PosMapEntry {
            log_position: le_i64(&raw[0..8]),
            data_offset: le_u32(&raw[8..12]),
        };
        if let Some(prev) = entries.last() {
            if entry.log_position <= prev.log_position || entry.data_offset <= prev.data_offset {
                return Err(ChunkFormatError::InvalidFormat("position map not ascending"));
            }
        }
        entries.push(entry);
    }
    Ok(entries)
}

/// Running CRC over a chunk body.
#[derive(Default)]
pub struct BodyChecksum(Hasher);

impl BodyChecksum {
    /// Start a new checksum
    pub fn new() -> Self {
        BodyChecksum(Hasher::new())
    }

    /// Feed bytes
    pub fn update(&mut self, bytes: &[u8]) {
        self.0.update(bytes);
    }

    /// Final value
    pub fn finalize(self) -> u32 {
        self.0.finalize()
    }
}

fn crc(bytes: &[u8]) -> u32 {
    let mut hasher = Hasher::new();
    hasher.update(bytes);
    hasher.finalize()
}

fn le_u32(b: &[u8]) -> u32 {
    let mut a = [0u8; 4];
    a.copy_from_slice(&b[..4]);
    u32::from_le_bytes(a)
}

fn le_u64(b: &[u8]) -> u64 {
    let mut a = [0u8; 8];
    a.copy_from_slice(&b[..8]);
    u64::from_le_bytes(a)
}

fn le_i64(b: &[u8]) -> i64 {
    let mut a = [0u8; 8];
    a.copy_from_slice(&b[..8]);
    i64::from_le_bytes(a)
}

/// Chunk header/footer parsing errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ChunkFormatError {
    /// Section shorter than its fixed size
    #[error("Truncated chunk {0}")]
    Truncated(&'static str),

    /// Magic bytes do not match
    #[error("Invalid chunk {0} magic")]
    InvalidMagic(&'static str),

    /// Checksum verification failed
    #[error("Chunk {section} checksum mismatch: expected {expected:08x}, computed {computed:08x}")]
    ChecksumMismatch {
        /// Which section failed
        section: &'static str,
        /// Stored checksum
        expected: u32,
        /// Computed checksum
        computed: u32,
    },

    /// Unsupported chunk format version
    #[error("Unsupported chunk format version: {0}")]
    UnsupportedVersion(u8),

    /// Structurally invalid content
    #[error("Invalid chunk format: {0}")]
    InvalidFormat(&'static str),
}
