//! Concurrent read tests
//!
//! Readers racing the writer and a scavenge only ever see durable records,
//! and every position they were handed stays readable at the same content.

use eventlog_core::{LogRecord, PrepareRecord};
use eventlog_durability::{
    Collaborators, DbConfig, EventLog, ReadResult, ReaderPolicy, ScavengeOptions, ScavengeResult,
};
use parking_lot::RwLock;
use rand::Rng;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use uuid::Uuid;

fn event(stream: String) -> PrepareRecord {
    PrepareRecord::single_write(Uuid::new_v4(), stream, -1, "Happened", vec![9; 64], vec![])
}

#[test]
fn test_random_reads_race_appends() {
    let log = Arc::new(
        EventLog::open(
            DbConfig::in_memory()
                .with_chunk_size(2048)
                .with_reader_counts(1, 2)
                .with_reader_policy(ReaderPolicy::Block {
                    timeout: Duration::from_secs(5),
                }),
        )
        .unwrap(),
    );
    let written: Arc<RwLock<Vec<(i64, String)>>> = Arc::new(RwLock::new(Vec::new()));
    let done = Arc::new(AtomicBool::new(false));

    let readers: Vec<_> = (0..4)
        .map(|_| {
            let log = Arc::clone(&log);
            let written = Arc::clone(&written);
            let done = Arc::clone(&done);
            thread::spawn(move || {
                let mut rng = rand::thread_rng();
                let mut reads = 0usize;
                while !done.load(Ordering::Acquire) || reads == 0 {
                    let picked = {
                        let written = written.read();
                        if written.is_empty() {
                            None
                        } else {
                            Some(written[rng.gen_range(0..written.len())].clone())
                        }
                    };
                    let Some((position, stream)) = picked else {
                        thread::yield_now();
                        continue;
                    };
                    match log.read_at(position).unwrap() {
                        ReadResult::Record(LogRecord::Prepare(p)) => {
                            assert_eq!(p.event_stream_id, stream);
                            assert_eq!(p.log_position, position);
                        }
                        other => panic!("position {} read as {:?}", position, other),
                    }
                    reads += 1;
                }
                reads
            })
        })
        .collect();

    for i in 0..300 {
        let stream = format!("stream-{}", i);
        let position = log.append(event(stream.clone())).unwrap();
        written.write().push((position, stream));
    }
    done.store(true, Ordering::Release);

    for reader in readers {
        assert!(reader.join().unwrap() > 0);
    }
    assert!(log.chunks().len() > 1);
}

#[test]
fn test_reads_survive_concurrent_scavenge() {
    let log = Arc::new(
        EventLog::open_with(
            DbConfig::in_memory().with_chunk_size(2048),
            Collaborators::default().with_policy(Arc::new(|p: &PrepareRecord| {
                p.event_stream_id.starts_with("drop-")
            })),
        )
        .unwrap(),
    );
    let mut kept = Vec::new();
    for i in 0..120 {
        let stream = if i % 3 == 0 {
            format!("drop-{}", i)
        } else {
            format!("keep-{}", i)
        };
        let position = log.append(event(stream.clone())).unwrap();
        if stream.starts_with("keep-") {
            kept.push((position, stream));
        }
    }
    log.seal_active_chunk().unwrap();

    let kept = Arc::new(kept);
    let reader = {
        let log = Arc::clone(&log);
        let kept = Arc::clone(&kept);
        thread::spawn(move || {
            let mut rng = rand::thread_rng();
            for _ in 0..2000 {
                let (position, stream) = &kept[rng.gen_range(0..kept.len())];
                match log.read_at(*position).unwrap() {
                    ReadResult::Record(record) => {
                        assert_eq!(record.stream_id(), Some(stream.as_str()))
                    }
                    other => panic!("kept record at {} read as {:?}", position, other),
                }
            }
        })
    };

    let handle = log
        .start_scavenge(ScavengeOptions::all().with_threads(2))
        .unwrap();
    assert_eq!(handle.wait(), ScavengeResult::Success);
    reader.join().unwrap();

    let streams: Vec<String> = log
        .read_sequence(0)
        .map(|r| r.unwrap())
        .filter_map(|(_, record)| record.stream_id().map(str::to_string))
        .collect();
    let expected: Vec<String> = kept.iter().map(|(_, s)| s.clone()).collect();
    assert_eq!(streams, expected);
}
