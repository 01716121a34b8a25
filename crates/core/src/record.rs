//! Log record types
//!
//! The transaction log is a sequence of immutable records. Every record kind
//! is a variant of the closed [`LogRecord`] enum; adding a kind means adding
//! a variant, a [`RecordType`] tag and a decoder arm.
//!
//! - `Prepare`: one event of a transaction (stream, type, payload)
//! - `Commit`: makes a multi-record transaction visible
//! - `System`: internal bookkeeping written by the node itself
//! - `Epoch`: marks the start of a leadership epoch

use crate::timestamp::Timestamp;
use std::fmt;
use std::ops::{BitOr, BitOrAssign};
use uuid::Uuid;

/// Wire tag identifying a record kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum RecordType {
    /// Event write belonging to a transaction
    Prepare = 0,
    /// Transaction commit
    Commit = 1,
    /// Node-internal record
    System = 2,
    /// Leadership epoch marker
    Epoch = 3,
}

impl RecordType {
    /// Tag byte written to disk
    pub fn to_byte(self) -> u8 {
        self as u8
    }

    /// Human-readable name for logging
    pub fn name(self) -> &'static str {
        match self {
            RecordType::Prepare => "prepare",
            RecordType::Commit => "commit",
            RecordType::System => "system",
            RecordType::Epoch => "epoch",
        }
    }
}

impl TryFrom<u8> for RecordType {
    type Error = UnknownRecordType;

    fn try_from(byte: u8) -> Result<Self, Self::Error> {
        match byte {
            0 => Ok(RecordType::Prepare),
            1 => Ok(RecordType::Commit),
            2 => Ok(RecordType::System),
            3 => Ok(RecordType::Epoch),
            other => Err(UnknownRecordType(other)),
        }
    }
}

impl fmt::Display for RecordType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// A record tag this build does not know how to interpret.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("unknown record type tag {0}")]
pub struct UnknownRecordType(pub u8);

/// Bit set carried by every prepare.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct PrepareFlags(u16);

impl PrepareFlags {
    /// No flags set
    pub const NONE: PrepareFlags = PrepareFlags(0);
    /// Record carries event data
    pub const DATA: PrepareFlags = PrepareFlags(0x01);
    /// First record of its transaction
    pub const TRANSACTION_BEGIN: PrepareFlags = PrepareFlags(0x02);
    /// Last record of its transaction
    pub const TRANSACTION_END: PrepareFlags = PrepareFlags(0x04);
    /// Stream tombstone
    pub const IS_DELETED: PrepareFlags = PrepareFlags(0x08);
    /// Transaction is committed inline, no separate commit record follows
    pub const IS_COMMITTED: PrepareFlags = PrepareFlags(0x20);
    /// Payload is JSON
    pub const IS_JSON: PrepareFlags = PrepareFlags(0x100);

    /// Single-record implicitly committed write.
    pub const SINGLE_WRITE: PrepareFlags = PrepareFlags(0x01 | 0x02 | 0x04 | 0x20);

    /// Raw bits
    pub const fn bits(self) -> u16 {
        self.0
    }

    /// Rebuild from raw bits. Unknown bits are preserved.
    pub const fn from_bits(bits: u16) -> Self {
        PrepareFlags(bits)
    }

    /// True if every bit in `other` is set
    pub const fn contains(self, other: PrepareFlags) -> bool {
        self.0 & other.0 == other.0
    }

    /// True if any bit in `other` is set
    pub const fn intersects(self, other: PrepareFlags) -> bool {
        self.0 & other.0 != 0
    }
}

impl BitOr for PrepareFlags {
    type Output = PrepareFlags;

    fn bitor(self, rhs: PrepareFlags) -> PrepareFlags {
        PrepareFlags(self.0 | rhs.0)
    }
}

impl BitOrAssign for PrepareFlags {
    fn bitor_assign(&mut self, rhs: PrepareFlags) {
        self.0 |= rhs.0;
    }
}

/// One event of a transaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PrepareRecord {
    /// Global byte offset of this record
    pub log_position: i64,
    /// Transaction id shared by every record of the transaction
    pub correlation_id: Uuid,
    /// Unique event id
    pub event_id: Uuid,
    /// Position of the first record of the transaction
    pub transaction_position: i64,
    /// Index of this event within its transaction
    pub transaction_offset: i32,
    /// Stream the event belongs to
    pub event_stream_id: String,
    /// Optimistic concurrency check value supplied by the client
    pub expected_version: i64,
    /// Time of the write
    pub timestamp: Timestamp,
    /// Transaction and payload flags
    pub flags: PrepareFlags,
    /// Event type name
    pub event_type: String,
    /// Event payload
    pub data: Vec<u8>,
    /// Event metadata
    pub metadata: Vec<u8>,
}

impl PrepareRecord {
    /// Single-event, implicitly committed write to `stream`.
    ///
    /// The log position is assigned by the writer on append.
    pub fn single_write(
        correlation_id: Uuid,
        stream: impl Into<String>,
        expected_version: i64,
        event_type: impl Into<String>,
        data: Vec<u8>,
        metadata: Vec<u8>,
    ) -> Self {
        PrepareRecord {
            log_position: -1,
            correlation_id,
            event_id: Uuid::new_v4(),
            transaction_position: -1,
            transaction_offset: 0,
            event_stream_id: stream.into(),
            expected_version,
            timestamp: Timestamp::now(),
            flags: PrepareFlags::SINGLE_WRITE,
            event_type: event_type.into(),
            data,
            metadata,
        }
    }

    /// Committed inline and closes its transaction.
    pub fn is_committed_end(&self) -> bool {
        self.flags
            .contains(PrepareFlags::IS_COMMITTED | PrepareFlags::TRANSACTION_END)
    }
}

/// Makes the prepares of one transaction visible.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommitRecord {
    /// Global byte offset of this record
    pub log_position: i64,
    /// Transaction id being committed
    pub correlation_id: Uuid,
    /// Position of the first prepare of the transaction
    pub transaction_position: i64,
    /// Stream event number assigned to the first prepare
    pub first_event_number: i64,
    /// Time of the commit
    pub timestamp: Timestamp,
}

/// Node-internal record with an opaque payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SystemRecord {
    /// Global byte offset of this record
    pub log_position: i64,
    /// Time of the write
    pub timestamp: Timestamp,
    /// Kind of system record
    pub system_record_type: u8,
    /// Payload serialization format
    pub serialization: u8,
    /// Opaque payload
    pub data: Vec<u8>,
}

/// Leadership epoch marker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EpochRecord {
    /// Global byte offset of this record
    pub log_position: i64,
    /// Monotonic epoch number
    pub epoch_number: i32,
    /// Unique epoch id
    pub epoch_id: Uuid,
    /// Position of the previous epoch record, -1 for the first epoch
    pub prev_epoch_position: i64,
    /// Time the epoch started
    pub timestamp: Timestamp,
}

/// A record of the transaction log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LogRecord {
    /// Event write
    Prepare(PrepareRecord),
    /// Transaction commit
    Commit(CommitRecord),
    /// Node-internal record
    System(SystemRecord),
    /// Epoch marker
    Epoch(EpochRecord),
}

impl LogRecord {
    /// Wire tag of this record
    pub fn record_type(&self) -> RecordType {
        match self {
            LogRecord::Prepare(_) => RecordType::Prepare,
            LogRecord::Commit(_) => RecordType::Commit,
            LogRecord::System(_) => RecordType::System,
            LogRecord::Epoch(_) => RecordType::Epoch,
        }
    }

    /// Global byte offset of this record
    pub fn log_position(&self) -> i64 {
        match self {
            LogRecord::Prepare(r) => r.log_position,
            LogRecord::Commit(r) => r.log_position,
            LogRecord::System(r) => r.log_position,
            LogRecord::Epoch(r) => r.log_position,
        }
    }

    /// Assign the global byte offset. Called by the writer before encoding.
    pub fn set_log_position(&mut self, position: i64) {
        match self {
            LogRecord::Prepare(r) => r.log_position = position,
            LogRecord::Commit(r) => r.log_position = position,
            LogRecord::System(r) => r.log_position = position,
            LogRecord::Epoch(r) => r.log_position = position,
        }
    }

    /// Time the record was produced
    pub fn timestamp(&self) -> Timestamp {
        match self {
            LogRecord::Prepare(r) => r.timestamp,
            LogRecord::Commit(r) => r.timestamp,
            LogRecord::System(r) => r.timestamp,
            LogRecord::Epoch(r) => r.timestamp,
        }
    }

    /// Transaction id if the record completes a transaction.
    ///
    /// A commit record completes its transaction; a prepare does only when
    /// it is committed inline and ends the transaction.
    pub fn completed_transaction(&self) -> Option<(Uuid, i64)> {
        match self {
            LogRecord::Prepare(p) if p.is_committed_end() => {
                Some((p.correlation_id, p.transaction_position))
            }
            LogRecord::Commit(c) => Some((c.correlation_id, c.transaction_position)),
            _ => None,
        }
    }

    /// Stream this record is scoped to, if any
    pub fn stream_id(&self) -> Option<&str> {
        match self {
            LogRecord::Prepare(p) => Some(&p.event_stream_id),
            _ => None,
        }
    }
}

impl From<PrepareRecord> for LogRecord {
    fn from(record: PrepareRecord) -> Self {
        LogRecord::Prepare(record)
    }
}

impl From<CommitRecord> for LogRecord {
    fn from(record: CommitRecord) -> Self {
        LogRecord::Commit(record)
    }
}

impl From<SystemRecord> for LogRecord {
    fn from(record: SystemRecord) -> Self {
        LogRecord::System(record)
    }
}

impl From<EpochRecord> for LogRecord {
    fn from(record: EpochRecord) -> Self {
        LogRecord::Epoch(record)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn prepare(flags: PrepareFlags) -> PrepareRecord {
        PrepareRecord {
            log_position: 0,
            correlation_id: Uuid::new_v4(),
            event_id: Uuid::new_v4(),
            transaction_position: 0,
            transaction_offset: 0,
            event_stream_id: "stream".to_string(),
            expected_version: -1,
            timestamp: Timestamp::EPOCH,
            flags,
            event_type: "type".to_string(),
            data: vec![1],
            metadata: vec![],
        }
    }

    #[test]
    fn test_record_type_tags() {
        for ty in [
            RecordType::Prepare,
            RecordType::Commit,
            RecordType::System,
            RecordType::Epoch,
        ] {
            assert_eq!(RecordType::try_from(ty.to_byte()), Ok(ty));
        }
        assert_eq!(RecordType::try_from(9), Err(UnknownRecordType(9)));
    }

    #[test]
    fn test_flags_contains() {
        let flags = PrepareFlags::IS_COMMITTED | PrepareFlags::TRANSACTION_END;
        assert!(flags.contains(PrepareFlags::IS_COMMITTED));
        assert!(flags.contains(PrepareFlags::TRANSACTION_END));
        assert!(!flags.contains(PrepareFlags::TRANSACTION_BEGIN));
        assert!(flags.intersects(PrepareFlags::SINGLE_WRITE));
        assert!(PrepareFlags::SINGLE_WRITE.contains(flags));
    }

    #[test]
    fn test_completed_transaction_committed_prepare() {
        let p = prepare(PrepareFlags::IS_COMMITTED | PrepareFlags::TRANSACTION_END);
        let id = p.correlation_id;
        let record = LogRecord::Prepare(p);
        assert_eq!(record.completed_transaction(), Some((id, 0)));
    }

    #[test]
    fn test_completed_transaction_uncommitted_prepare() {
        let record = LogRecord::Prepare(prepare(PrepareFlags::TRANSACTION_BEGIN));
        assert_eq!(record.completed_transaction(), None);

        // Committed but not the end of the transaction
        let record = LogRecord::Prepare(prepare(PrepareFlags::IS_COMMITTED));
        assert_eq!(record.completed_transaction(), None);
    }

    #[test]
    fn test_completed_transaction_commit() {
        let id = Uuid::new_v4();
        let record = LogRecord::Commit(CommitRecord {
            log_position: 100,
            correlation_id: id,
            transaction_position: 40,
            first_event_number: 3,
            timestamp: Timestamp::EPOCH,
        });
        assert_eq!(record.completed_transaction(), Some((id, 40)));
        assert_eq!(record.stream_id(), None);
    }

    #[test]
    fn test_set_log_position() {
        let mut record = LogRecord::from(prepare(PrepareFlags::SINGLE_WRITE));
        record.set_log_position(4096);
        assert_eq!(record.log_position(), 4096);
        assert_eq!(record.record_type(), RecordType::Prepare);
    }
}

#[cfg(test)]
mod proptests {
    use super::*;
    use proptest::prelude::*;

    proptest! {
        #[test]
        fn prop_flag_union_contains_both(a in any::<u16>(), b in any::<u16>()) {
            let (a, b) = (PrepareFlags::from_bits(a), PrepareFlags::from_bits(b));
            let union = a | b;
            prop_assert!(union.contains(a));
            prop_assert!(union.contains(b));
            prop_assert_eq!(union.bits(), a.bits() | b.bits());
        }

        #[test]
        fn prop_record_type_tag_roundtrip(tag in any::<u8>()) {
            match RecordType::try_from(tag) {
                Ok(ty) => prop_assert_eq!(ty.to_byte(), tag),
                Err(e) => prop_assert_eq!(e, UnknownRecordType(tag)),
            }
        }
    }
}
