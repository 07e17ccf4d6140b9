//! Probes against real SQLite files in a temporary directory.

use kvprobe_core::{
    AlwaysContinue, BackendKind, Destination, Outcome, ProbeConfig, ProbeSession, RecordingSink,
    COUNT_STORE,
};
use std::sync::Arc;

fn sqlite_config(dir: &std::path::Path) -> ProbeConfig {
    let mut config = ProbeConfig::default();
    config.backend.kind = BackendKind::Sqlite;
    config.backend.dir = dir.to_path_buf();
    config.gate.pause_ms = 0;
    config.delete_grace_ms = 0;
    config
}

fn new_session(config: ProbeConfig) -> (ProbeSession, Arc<RecordingSink>) {
    let sink = Arc::new(RecordingSink::new());
    let session = ProbeSession::from_config(config, sink.clone(), Arc::new(AlwaysContinue));
    (session, sink)
}

#[tokio::test]
async fn capacity_hits_file_quota() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = sqlite_config(dir.path());
    config.backend.quota_bytes = Some(256 * 1024);
    config.capacity.unit_bytes = 1024;
    config.capacity.chunk_mb = 16;
    config.capacity.target_mb = 4096;
    let (session, sink) = new_session(config);

    let report = session.run_capacity().await.unwrap();

    assert_eq!(report.outcome, Outcome::LimitFound);
    assert!(report.message.starts_with("Quota exceeded"), "{}", report.message);
    let estimate = report.estimate_bytes().unwrap();
    assert!(estimate > 0 && estimate < 256 * 1024, "estimate {estimate}");
    assert!(sink.contains(Destination::Capacity, "Estimated limit"));
}

#[tokio::test]
async fn size_finds_record_length_limit() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = sqlite_config(dir.path());
    config.backend.max_record_bytes = Some(100 * 1024);
    config.size.unit_bytes = 1024;
    config.size.trial_frequency = 0;
    let (session, _) = new_session(config);

    let report = session.run_size().await.unwrap();

    assert_eq!(report.outcome, Outcome::LimitFound);
    // The length limit covers the whole row value, so the estimate lands
    // just under it.
    let estimate = report.estimate.unwrap();
    assert!((99..=100).contains(&estimate), "estimate {estimate}");
}

#[tokio::test]
async fn count_persists_across_sessions_and_clear_removes_files() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = sqlite_config(dir.path());
    config.count.target = 150;
    let (session, _) = new_session(config.clone());

    let report = session.run_count().await.unwrap();
    assert_eq!(report.outcome, Outcome::TargetReached);
    assert_eq!(report.estimate, Some(1_100));
    session.teardown();

    let db_file = dir.path().join("kvprobe.sqlite3");
    assert!(db_file.exists());

    let (second, sink) = new_session(config);
    second.clear_all().await.unwrap();
    assert!(!db_file.exists());
    assert!(sink.contains(Destination::Clear, "completed"));

    // A fresh run starts from an empty store.
    let report = second.run_count().await.unwrap();
    assert_eq!(report.estimate, Some(1_100));
    let conn = second.gateway().open().await.unwrap();
    assert!(conn.contains_store(COUNT_STORE));
}
