//! Core types for the transaction log
//!
//! This crate defines the values that flow through the log engine:
//! - LogRecord: closed set of record kinds (prepare, commit, system, epoch)
//! - PrepareFlags: transaction and payload flag bits
//! - Timestamp: microsecond wall-clock time carried by every record

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod record;
pub mod timestamp;

pub use record::{
    CommitRecord, EpochRecord, LogRecord, PrepareFlags, PrepareRecord, RecordType, SystemRecord,
    UnknownRecordType,
};
pub use timestamp::Timestamp;
