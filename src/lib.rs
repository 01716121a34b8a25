//! EventLog - chunked transaction log engine for an event-sourced database node
//!
//! The log is a single append-only sequence of records addressed by global
//! byte position. Storage is split into fixed-capacity chunk files; named
//! checkpoints mark how far the log is durable and processed.
//!
//! # Quick Start
//!
//! ```ignore
//! use eventlog::{DbConfig, EventLog, PrepareRecord};
//!
//! let log = EventLog::open(DbConfig::new("/var/lib/node/log"))?;
//! let acks = log.commit_acks().expect("feed taken once");
//!
//! let position = log.append(PrepareRecord::single_write(id, "orders-1", -1, "Placed", data, vec![]))?;
//! let ack = acks.recv()?;
//! assert_eq!(ack.log_position, position);
//! ```
//!
//! # Architecture
//!
//! - `eventlog-core`: record types and timestamps, no I/O
//! - `eventlog-durability`: codec, checkpoints, chunks, writer, chaser, scavenger

pub use eventlog_core::*;
pub use eventlog_durability::*;
