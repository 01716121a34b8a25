//! End-to-end tests through the `eventlog` re-exports.

use eventlog::{
    DbConfig, EventLog, LogRecord, PrepareRecord, ReadResult, ScavengeOptions, ScavengeResult,
};
use std::time::Duration;
use tempfile::TempDir;
use uuid::Uuid;

fn event(stream: &str, data: &[u8]) -> PrepareRecord {
    PrepareRecord::single_write(Uuid::new_v4(), stream, -1, "Happened", data.to_vec(), vec![])
}

#[test]
fn test_log_survives_reopen() {
    let dir = TempDir::new().unwrap();
    let config = DbConfig::for_testing(dir.path()).with_chunk_size(1024);

    let positions: Vec<i64> = {
        let log = EventLog::open(config.clone()).unwrap();
        let acks = log.commit_acks().unwrap();
        let positions = (0..20)
            .map(|i| log.append(event(&format!("order-{}", i), &[i as u8; 48])).unwrap())
            .collect::<Vec<_>>();
        let first = acks.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(first.log_position, positions[0]);
        log.close().unwrap();
        positions
    };

    let log = EventLog::open(config).unwrap();
    assert!(log.chunks().len() > 1);
    for (i, position) in positions.iter().enumerate() {
        match log.read_at(*position).unwrap() {
            ReadResult::Record(LogRecord::Prepare(p)) => {
                assert_eq!(p.event_stream_id, format!("order-{}", i));
                assert_eq!(p.data, vec![i as u8; 48]);
            }
            other => panic!("position {} read as {:?}", position, other),
        }
    }
    let next = log.append(event("order-20", b"late")).unwrap();
    assert!(next > positions[19]);
    assert!(matches!(log.read_at(next).unwrap(), ReadResult::Record(_)));
}

#[test]
fn test_scavenge_history_is_visible() {
    let dir = TempDir::new().unwrap();
    let log = EventLog::open(DbConfig::for_testing(dir.path())).unwrap();
    log.append(event("a", b"x")).unwrap();
    log.seal_active_chunk().unwrap();

    let handle = log.start_scavenge(ScavengeOptions::all()).unwrap();
    assert_eq!(handle.wait(), ScavengeResult::Success);
    let history = log.scavenge_history();
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].id(), handle.id());
    assert!(history[0].finished_at().is_some());
}
