//! Durability layer of the event log
//!
//! This crate handles everything that touches disk:
//!
//! - Record codec: checksummed, versioned log record frames
//! - Checkpoints: named crash-atomic position markers
//! - Chunks: fixed-capacity log segments, raw or scavenged
//! - Chunk manager: position resolution, sealing, recovery on open
//! - Writer: serialised durable appends
//! - Storage chaser: commit acknowledgements behind the durable frontier
//! - Scavenger: online removal of superseded records and chunk merging

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod chaser;
pub mod checkpoint;
pub mod chunk;
pub mod database;
pub mod db;
pub mod error;
pub mod format;
pub mod observer;
pub mod scavenge;
pub mod writer;

pub use chaser::{ChaserConfig, CommitAck, StorageChaser};
pub use checkpoint::{
    Checkpoint, CheckpointError, CheckpointName, CheckpointSet, FileCheckpoint,
    InMemoryCheckpoint, UNSET,
};
pub use chunk::{Chunk, ChunkBuilder, ChunkReader, FrameRead, ReaderPolicy, ReaderPoolConfig};
pub use database::{Collaborators, EventLog, LogIter};
pub use db::{ChunkDb, ConfigError, DbConfig, NextRecord, ReadResult};
pub use error::{LogError, LogResult};
pub use format::CodecError;
pub use observer::{LogObserver, NoopObserver};
pub use scavenge::{
    CancellationToken, EntryStatus, KeepAll, NoIndex, ScavengeEntry, ScavengeHandle,
    ScavengeHistory, ScavengeLog, ScavengeOptions, ScavengePolicy, ScavengeResult, Scavenger,
    TableIndex,
};
pub use writer::{DurableFrontier, LogWriter, WriterCounters};
