//! Log record frame format.
//!
//! Every record in a chunk is a self-delimiting frame, so a sequential
//! reader can step over record kinds it does not understand as long as the
//! frame itself is intact.
//!
//! # Frame Layout
//!
//! ```text
//! ┌──────────┬─────────┬─────────┬──────────────┬──────────────────┬──────────┐
//! │ Len (4)  │ Type (1)│ Ver (1) │ Position (8) │ Body (variable)  │ CRC32 (4)│
//! └──────────┴─────────┴─────────┴──────────────┴──────────────────┴──────────┘
//! ```
//!
//! `Len` counts every byte after itself. The CRC covers type, version,
//! position and body. All integers are little endian.
//!
//! # Bodies
//!
//! ```text
//! Prepare v1: correlation(16) event_id(16) txn_pos(8) txn_offset(4)
//!             expected_version(8) timestamp(8) flags(2)
//!             stream(str) event_type(str) data(bytes) metadata(bytes)
//! Prepare v0: as v1 with a 4-byte expected_version
//! Commit:     correlation(16) txn_pos(8) first_event_number(8) timestamp(8)
//! System:     timestamp(8) system_type(1) serialization(1) data(bytes)
//! Epoch:      epoch_number(4) epoch_id(16) prev_epoch_pos(8) timestamp(8)
//! ```
//!
//! `str` and `bytes` are a u32 length followed by the raw bytes.

use crc32fast::Hasher;
use eventlog_core::{
    CommitRecord, EpochRecord, LogRecord, PrepareFlags, PrepareRecord, RecordType, SystemRecord,
    Timestamp,
};
use uuid::Uuid;

/// Current record format version written by the encoder
pub const LOG_RECORD_VERSION: u8 = 1;

/// Prepare version with a 32-bit expected version
pub const PREPARE_V0: u8 = 0;

/// Bytes of the length prefix
pub const FRAME_LEN_SIZE: usize = 4;

/// Fixed bytes inside a frame besides the body: type + version + position + crc
pub const FRAME_OVERHEAD: usize = 1 + 1 + 8 + 4;

/// A validated frame whose body has not been interpreted yet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RawFrame<'a> {
    /// Record type tag
    pub record_type: u8,
    /// Record format version
    pub version: u8,
    /// Position stored in the frame
    pub log_position: i64,
    /// Body bytes
    pub body: &'a [u8],
    /// Total bytes including the length prefix
    pub frame_len: usize,
}

/// Encode a record into a frame.
pub fn encode(record: &LogRecord) -> Vec<u8> {
    let mut body = Vec::with_capacity(64);
    match record {
        LogRecord::Prepare(p) => {
            body.extend_from_slice(p.correlation_id.as_bytes());
            body.extend_from_slice(p.event_id.as_bytes());
            body.extend_from_slice(&p.transaction_position.to_le_bytes());
            body.extend_from_slice(&p.transaction_offset.to_le_bytes());
            body.extend_from_slice(&p.expected_version.to_le_bytes());
            body.extend_from_slice(&p.timestamp.as_micros().to_le_bytes());
            body.extend_from_slice(&p.flags.bits().to_le_bytes());
            put_bytes(&mut body, p.event_stream_id.as_bytes());
            put_bytes(&mut body, p.event_type.as_bytes());
            put_bytes(&mut body, &p.data);
            put_bytes(&mut body, &p.metadata);
        }
        LogRecord::Commit(c) => {
            body.extend_from_slice(c.correlation_id.as_bytes());
            body.extend_from_slice(&c.transaction_position.to_le_bytes());
            body.extend_from_slice(&c.first_event_number.to_le_bytes());
            body.extend_from_slice(&c.timestamp.as_micros().to_le_bytes());
        }
        LogRecord::System(s) => {
            body.extend_from_slice(&s.timestamp.as_micros().to_le_bytes());
            body.push(s.system_record_type);
            body.push(s.serialization);
            put_bytes(&mut body, &s.data);
        }
        LogRecord::Epoch(e) => {
            body.extend_from_slice(&e.epoch_number.to_le_bytes());
            body.extend_from_slice(e.epoch_id.as_bytes());
            body.extend_from_slice(&e.prev_epoch_position.to_le_bytes());
            body.extend_from_slice(&e.timestamp.as_micros().to_le_bytes());
        }
    }
    encode_frame(
        record.record_type().to_byte(),
        LOG_RECORD_VERSION,
        record.log_position(),
        &body,
    )
}

/// Wrap an already-encoded body in a frame.
pub fn encode_frame(record_type: u8, version: u8, log_position: i64, body: &[u8]) -> Vec<u8> {
    let len = FRAME_OVERHEAD + body.len();
    let mut frame = Vec::with_capacity(FRAME_LEN_SIZE + len);
    frame.extend_from_slice(&(len as u32).to_le_bytes());
    frame.push(record_type);
    frame.push(version);
    frame.extend_from_slice(&log_position.to_le_bytes());
    frame.extend_from_slice(body);
    let crc = compute_crc(&frame[FRAME_LEN_SIZE..]);
    frame.extend_from_slice(&crc.to_le_bytes());
    frame
}

/// Encoded size of a frame without building it.
pub fn frame_size(record: &LogRecord) -> usize {
    let body = match record {
        LogRecord::Prepare(p) => {
            16 + 16 + 8 + 4 + 8 + 8 + 2
                + 4 * 4
                + p.event_stream_id.len()
                + p.event_type.len()
                + p.data.len()
                + p.metadata.len()
        }
        LogRecord::Commit(_) => 16 + 8 + 8 + 8,
        LogRecord::System(s) => 8 + 1 + 1 + 4 + s.data.len(),
        LogRecord::Epoch(_) => 4 + 16 + 8 + 8,
    };
    FRAME_LEN_SIZE + FRAME_OVERHEAD + body
}

/// Validate the frame at the start of `bytes` without interpreting its body.
pub fn read_frame(bytes: &[u8]) -> Result<RawFrame<'_>, CodecError> {
    if bytes.len() < FRAME_LEN_SIZE {
        return Err(CodecError::InsufficientData);
    }
    let len = u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]) as usize;
    if len < FRAME_OVERHEAD {
        return Err(CodecError::InvalidFormat("frame length below minimum"));
    }
    if bytes.len() < FRAME_LEN_SIZE + len {
        return Err(CodecError::InsufficientData);
    }

    let content = &bytes[FRAME_LEN_SIZE..FRAME_LEN_SIZE + len - 4];
    let crc_bytes = &bytes[FRAME_LEN_SIZE + len - 4..FRAME_LEN_SIZE + len];
    let stored = u32::from_le_bytes([crc_bytes[0], crc_bytes[1], crc_bytes[2], crc_bytes[3]]);
    let computed = compute_crc(content);
    if stored != computed {
        return Err(CodecError::ChecksumMismatch {
            expected: stored,
            computed,
        });
    }

    let mut cursor = Cursor::new(content);
    let record_type = cursor.u8()?;
    let version = cursor.u8()?;
    let log_position = cursor.i64()?;

    Ok(RawFrame {
        record_type,
        version,
        log_position,
        body: cursor.rest(),
        frame_len: FRAME_LEN_SIZE + len,
    })
}

/// Decode the frame at the start of `bytes`.
///
/// Returns the record and the number of bytes consumed.
pub fn decode(bytes: &[u8]) -> Result<(LogRecord, usize), CodecError> {
    let frame = read_frame(bytes)?;
    let record = decode_body(&frame)?;
    Ok((record, frame.frame_len))
}

/// Interpret the body of a validated frame.
pub fn decode_body(frame: &RawFrame<'_>) -> Result<LogRecord, CodecError> {
    let record_type = RecordType::try_from(frame.record_type)
        .map_err(|e| CodecError::UnknownRecordType(e.0))?;
    let mut c = Cursor::new(frame.body);
    let log_position = frame.log_position;

    let record = match (record_type, frame.version) {
        (RecordType::Prepare, PREPARE_V0 | LOG_RECORD_VERSION) => {
            let correlation_id = c.uuid()?;
            let event_id = c.uuid()?;
            let transaction_position = c.i64()?;
            let transaction_offset = c.i32()?;
            let expected_version = if frame.version == PREPARE_V0 {
                i64::from(c.i32()?)
            } else {
                c.i64()?
            };
            let timestamp = Timestamp::from_micros(c.u64()?);
            let flags = PrepareFlags::from_bits(c.u16()?);
            let event_stream_id = c.string()?;
            let event_type = c.string()?;
            let data = c.bytes()?.to_vec();
            let metadata = c.bytes()?.to_vec();
            LogRecord::Prepare(PrepareRecord {
                log_position,
                correlation_id,
                event_id,
                transaction_position,
                transaction_offset,
                event_stream_id,
                expected_version,
                timestamp,
                flags,
                event_type,
                data,
                metadata,
            })
        }
        (RecordType::Commit, LOG_RECORD_VERSION) => LogRecord::Commit(CommitRecord {
            log_position,
            correlation_id: c.uuid()?,
            transaction_position: c.i64()?,
            first_event_number: c.i64()?,
            timestamp: Timestamp::from_micros(c.u64()?),
        }),
        (RecordType::System, LOG_RECORD_VERSION) => LogRecord::System(SystemRecord {
            log_position,
            timestamp: Timestamp::from_micros(c.u64()?),
            system_record_type: c.u8()?,
            serialization: c.u8()?,
            data: c.bytes()?.to_vec(),
        }),
        (RecordType::Epoch, LOG_RECORD_VERSION) => LogRecord::Epoch(EpochRecord {
            log_position,
            epoch_number: c.i32()?,
            epoch_id: c.uuid()?,
            prev_epoch_position: c.i64()?,
            timestamp: Timestamp::from_micros(c.u64()?),
        }),
        (_, version) => return Err(CodecError::UnsupportedVersion(version)),
    };

    if !c.rest().is_empty() {
        return Err(CodecError::InvalidFormat("trailing bytes after body"));
    }
    Ok(record)
}

fn put_bytes(buf: &mut Vec<u8>, bytes: &[u8]) {
    buf.extend_from_slice(&(bytes.len() as u32).to_le_bytes());
    buf.extend_from_slice(bytes);
}

fn compute_crc(data: &[u8]) -> u32 {
    let mut hasher = Hasher::new();
    hasher.update(data);
    hasher.finalize()
}

struct Cursor<'a> {
    buf: &'a [u8],
}

impl<'a> Cursor<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Cursor { buf }
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], CodecError> {
        if self.buf.len() < n {
            return Err(CodecError::InvalidFormat("body truncated"));
        }
        let (head, tail) = self.buf.split_at(n);
        self.buf = tail;
        Ok(head)
    }

    fn array<const N: usize>(&mut self) -> Result<[u8; N], CodecError> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.take(N)?);
        Ok(out)
    }

    fn u8(&mut self) -> Result<u8, CodecError> {
        Ok(self.take(1)?[0])
    }

    fn u16(&mut self) -> Result<u16, CodecError> {
        Ok(u16::from_le_bytes(self.array()?))
    }

    fn i32(&mut self) -> Result<i32, CodecError> {
        Ok(i32::from_le_bytes(self.array()?))
    }

    fn u64(&mut self) -> Result<u64, CodecError> {
        Ok(u64::from_le_bytes(self.array()?))
    }

    fn i64(&mut self) -> Result<i64, CodecError> {
        Ok(i64::from_le_bytes(self.array()?))
    }

    fn uuid(&mut self) -> Result<Uuid, CodecError> {
        Ok(Uuid::from_bytes(self.array()?))
    }

    fn bytes(&mut self) -> Result<&'a [u8], CodecError> {
        let len = u32::from_le_bytes(self.array()?) as usize;
        self.take(len)
    }

    fn string(&mut self) -> Result<String, CodecError> {
        let bytes = self.bytes()?;
        String::from_utf8(bytes.to_vec()).map_err(|_| CodecError::InvalidFormat("invalid utf-8"))
    }

    fn rest(&self) -> &'a [u8] {
        self.buf
    }
}

/// Record frame parsing errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CodecError {
    /// Not enough bytes for the declared frame
    #[error("Insufficient data to parse record")]
    InsufficientData,

    /// Frame or body is malformed
    #[error("Invalid record format: {0}")]
    InvalidFormat(&'static str),

    /// Checksum verification failed
    #[error("Checksum mismatch: expected {expected:08x}, computed {computed:08x}")]
    ChecksumMismatch {
        /// Checksum stored in the frame
        expected: u32,
        /// Checksum computed over the frame
        computed: u32,
    },

    /// Intact frame with a tag this build does not know
    #[error("Unknown record type: {0}")]
    UnknownRecordType(u8),

    /// Known tag with an unsupported version
    #[error("Unsupported record version: {0}")]
    UnsupportedVersion(u8),
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn prepare(position: i64) -> LogRecord {
        LogRecord::Prepare(PrepareRecord {
            log_position: position,
            correlation_id: Uuid::new_v4(),
            event_id: Uuid::new_v4(),
            transaction_position: position,
            transaction_offset: 0,
            event_stream_id: "account-42".to_string(),
            expected_version: 7,
            timestamp: Timestamp::from_micros(1_000_000),
            flags: PrepareFlags::SINGLE_WRITE | PrepareFlags::IS_JSON,
            event_type: "Deposited".to_string(),
            data: br#"{"amount":10}"#.to_vec(),
            metadata: vec![1, 2, 3],
        })
    }

    fn all_kinds() -> Vec<LogRecord> {
        vec![
            prepare(0),
            LogRecord::Commit(CommitRecord {
                log_position: 200,
                correlation_id: Uuid::new_v4(),
                transaction_position: 0,
                first_event_number: 12,
                timestamp: Timestamp::from_micros(5),
            }),
            LogRecord::System(SystemRecord {
                log_position: 300,
                timestamp: Timestamp::from_micros(6),
                system_record_type: 1,
                serialization: 2,
                data: vec![9; 40],
            }),
            LogRecord::Epoch(EpochRecord {
                log_position: 400,
                epoch_number: 3,
                epoch_id: Uuid::new_v4(),
                prev_epoch_position: 120,
                timestamp: Timestamp::from_micros(7),
            }),
        ]
    }

    #[test]
    fn test_every_kind_decodes_to_itself() {
        for record in all_kinds() {
            let bytes = encode(&record);
            assert_eq!(bytes.len(), frame_size(&record));
            let (decoded, consumed) = decode(&bytes).unwrap();
            assert_eq!(decoded, record);
            assert_eq!(consumed, bytes.len());
        }
    }

    #[test]
    fn test_decode_consumes_only_first_frame() {
        let mut bytes = encode(&prepare(0));
        let first_len = bytes.len();
        bytes.extend(encode(&prepare(first_len as i64)));

        let (_, consumed) = decode(&bytes).unwrap();
        assert_eq!(consumed, first_len);
        let (second, _) = decode(&bytes[consumed..]).unwrap();
        assert_eq!(second.log_position(), first_len as i64);
    }

    #[test]
    fn test_bit_flip_is_detected() {
        let mut bytes = encode(&prepare(0));
        bytes[20] ^= 0xFF;
        assert!(matches!(
            decode(&bytes),
            Err(CodecError::ChecksumMismatch { .. })
        ));
    }

    #[test]
    fn test_truncated_frame() {
        let bytes = encode(&prepare(0));
        assert_eq!(
            decode(&bytes[..bytes.len() - 1]),
            Err(CodecError::InsufficientData)
        );
        assert_eq!(decode(&bytes[..2]), Err(CodecError::InsufficientData));
    }

    #[test]
    fn test_length_below_minimum() {
        let bytes = [3u8, 0, 0, 0, 0, 0, 0];
        assert!(matches!(decode(&bytes), Err(CodecError::InvalidFormat(_))));
    }

    #[test]
    fn test_unknown_kind_frame_is_skippable() {
        let unknown = encode_frame(42, 1, 0, &[1, 2, 3, 4]);
        let frame = read_frame(&unknown).unwrap();
        assert_eq!(frame.record_type, 42);
        assert_eq!(frame.frame_len, unknown.len());
        assert_eq!(
            decode_body(&frame),
            Err(CodecError::UnknownRecordType(42))
        );
    }

    #[test]
    fn test_unsupported_version() {
        let frame = encode_frame(RecordType::Commit.to_byte(), 9, 0, &[0; 40]);
        assert_eq!(decode(&frame), Err(CodecError::UnsupportedVersion(9)));
    }

    #[test]
    fn test_prepare_v0_widens_expected_version() {
        let correlation = Uuid::new_v4();
        let mut body = Vec::new();
        body.extend_from_slice(correlation.as_bytes());
        body.extend_from_slice(Uuid::nil().as_bytes());
        body.extend_from_slice(&0i64.to_le_bytes());
        body.extend_from_slice(&0i32.to_le_bytes());
        body.extend_from_slice(&(-2i32).to_le_bytes());
        body.extend_from_slice(&0u64.to_le_bytes());
        body.extend_from_slice(&PrepareFlags::SINGLE_WRITE.bits().to_le_bytes());
        put_bytes(&mut body, b"legacy");
        put_bytes(&mut body, b"type");
        put_bytes(&mut body, &[]);
        put_bytes(&mut body, &[]);

        let frame = encode_frame(RecordType::Prepare.to_byte(), PREPARE_V0, 64, &body);
        let (record, _) = decode(&frame).unwrap();
        match record {
            LogRecord::Prepare(p) => {
                assert_eq!(p.expected_version, -2);
                assert_eq!(p.correlation_id, correlation);
                assert_eq!(p.log_position, 64);
                assert_eq!(p.event_stream_id, "legacy");
            }
            other => panic!("expected prepare, got {:?}", other),
        }
    }

    #[test]
    fn test_trailing_body_bytes_rejected() {
        let record = all_kinds().remove(1);
        let good = encode(&record);
        let frame = read_frame(&good).unwrap();
        let mut body = frame.body.to_vec();
        body.push(0);
        let bad = encode_frame(frame.record_type, frame.version, frame.log_position, &body);
        assert!(matches!(decode(&bad), Err(CodecError::InvalidFormat(_))));
    }

    proptest! {
        #[test]
        fn prop_prepare_survives_encoding(
            position in 0i64..i64::MAX / 2,
            stream in "[a-zA-Z0-9-]{1,40}",
            event_type in "[a-zA-Z]{0,20}",
            data in proptest::collection::vec(any::<u8>(), 0..512),
            metadata in proptest::collection::vec(any::<u8>(), 0..64),
            expected_version in any::<i64>(),
            flags in any::<u16>(),
        ) {
            let record = LogRecord::Prepare(PrepareRecord {
                log_position: position,
                correlation_id: Uuid::new_v4(),
                event_id: Uuid::new_v4(),
                transaction_position: position,
                transaction_offset: 1,
                event_stream_id: stream,
                expected_version,
                timestamp: Timestamp::from_micros(position as u64),
                flags: PrepareFlags::from_bits(flags),
                event_type,
                data,
                metadata,
            });
            let bytes = encode(&record);
            prop_assert_eq!(bytes.len(), frame_size(&record));
            let (decoded, _) = decode(&bytes).unwrap();
            prop_assert_eq!(decoded, record);
        }
    }
}
