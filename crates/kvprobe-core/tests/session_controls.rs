//! Control-level behavior: run exclusivity, clearing, estimate and persistence.

use async_trait::async_trait;
use kvprobe_core::storage::Opened;
use kvprobe_core::{
    AlwaysContinue, BackendError, BackendKind, Channel, Confirmer, Destination, MemoryBackend,
    MemoryLimits, Outcome, ProbeConfig, ProbeError, ProbeSession, RecordingSink, StorageBackend,
    StoreSpec, TrialPrompt, CAPACITY_STORE, COUNT_STORE, SIZE_STORE,
};
use std::sync::Arc;
use tokio::sync::Notify;

fn config() -> ProbeConfig {
    let mut config = ProbeConfig::default();
    config.backend.kind = BackendKind::Memory;
    config.gate.pause_ms = 0;
    config.delete_grace_ms = 0;
    config.abort_grace_ms = 50;
    config.capacity.unit_bytes = 1;
    config.capacity.trial_frequency = 1;
    config
}

/// Parks the probe at its first checkpoint until released.
struct HoldingConfirmer {
    reached: Notify,
    release: Notify,
}

#[async_trait]
impl Confirmer for HoldingConfirmer {
    async fn confirm(&self, _prompt: &TrialPrompt) -> anyhow::Result<bool> {
        self.reached.notify_one();
        self.release.notified().await;
        Ok(true)
    }
}

fn holding_confirmer() -> Arc<HoldingConfirmer> {
    Arc::new(HoldingConfirmer {
        reached: Notify::new(),
        release: Notify::new(),
    })
}

/// Memory backend whose database deletion fails with an I/O error.
struct UndeletableBackend(MemoryBackend);

#[async_trait]
impl StorageBackend for UndeletableBackend {
    async fn open(
        &self,
        name: &str,
        version: u32,
        schema: &[StoreSpec],
    ) -> Result<Opened, BackendError> {
        self.0.open(name, version, schema).await
    }

    async fn delete_database(&self, _name: &str) -> Result<(), BackendError> {
        Err(BackendError::Io("device busy".into()))
    }
}

#[tokio::test]
async fn second_run_is_rejected_while_one_is_active() {
    let confirmer = holding_confirmer();
    let sink = Arc::new(RecordingSink::new());
    let session = Arc::new(ProbeSession::new(
        config(),
        Arc::new(MemoryBackend::default()),
        sink.clone(),
        confirmer.clone(),
    ));

    let running = tokio::spawn({
        let session = session.clone();
        async move { session.run_capacity().await }
    });
    confirmer.reached.notified().await;

    assert!(session.is_running());
    assert_eq!(session.run_size().await.unwrap_err(), ProbeError::RunInProgress);
    assert_eq!(session.check_estimate().await, Ok(None));

    session.abort_flag().request();
    confirmer.release.notify_one();
    let report = running.await.unwrap().unwrap();

    assert_eq!(report.outcome, Outcome::Aborted);
    assert!(!session.is_running());
    assert_eq!(sink.controls_history(), vec![false, true]);
}

#[tokio::test]
async fn new_run_resets_a_previous_abort() {
    let mut config = config();
    config.capacity.target_mb = 20;
    config.capacity.trial_frequency = 0;
    let session = ProbeSession::new(
        config,
        Arc::new(MemoryBackend::default()),
        Arc::new(RecordingSink::new()),
        Arc::new(AlwaysContinue),
    );
    session.abort_flag().request();

    let report = session.run_capacity().await.unwrap();
    assert_eq!(report.outcome, Outcome::TargetReached);
}

#[tokio::test]
async fn clear_all_deletes_database_and_refreshes_estimate() {
    let backend = MemoryBackend::default();
    let sink = Arc::new(RecordingSink::new());
    let session = ProbeSession::new(
        config(),
        Arc::new(backend.clone()),
        sink.clone(),
        Arc::new(AlwaysContinue),
    )
    .with_environment(Arc::new(backend.clone()));
    session
        .gateway()
        .batch_add(COUNT_STORE, 10, &kvprobe_core::Payload::from("x"))
        .await
        .unwrap();
    Channel::new(sink.clone(), Destination::Capacity).info("Test succeeded.");
    Channel::new(sink.clone(), Destination::Persist).info("Persistence state: enabled");

    session.clear_all().await.unwrap();

    assert!(!backend.database_exists("kvprobe"));
    assert!(sink.contains(Destination::Clear, "Deletion of database 'kvprobe' completed."));
    assert!(sink.messages(Destination::Capacity).is_empty());
    assert!(sink.messages(Destination::Persist).is_empty());
    assert!(sink.contains(Destination::Storage, "Current usage: 0 Bytes"));
    let progress = sink.last_progress(Destination::Count).unwrap();
    assert_eq!(progress.value, 0);
}

#[tokio::test]
async fn clear_all_reports_blocked_delete() {
    let backend = MemoryBackend::default();
    let sink = Arc::new(RecordingSink::new());
    let session = ProbeSession::new(
        config(),
        Arc::new(backend.clone()),
        sink.clone(),
        Arc::new(AlwaysContinue),
    );
    let _foreign = kvprobe_core::StorageBackend::open(
        &backend,
        "kvprobe",
        1,
        &kvprobe_core::default_schema(),
    )
    .await
    .unwrap();

    let err = session.clear_all().await.unwrap_err();

    assert!(matches!(err, ProbeError::DeleteBlocked(_)));
    assert!(backend.database_exists("kvprobe"));
    assert!(sink.contains(Destination::Clear, "Error while deleting test data"));
}

#[tokio::test]
async fn failed_delete_falls_back_to_clearing_stores() {
    let backend = MemoryBackend::default();
    let sink = Arc::new(RecordingSink::new());
    let session = ProbeSession::new(
        config(),
        Arc::new(UndeletableBackend(backend.clone())),
        sink.clone(),
        Arc::new(AlwaysContinue),
    );
    let filler = kvprobe_core::Payload::from("x");
    session.gateway().batch_add(COUNT_STORE, 5, &filler).await.unwrap();
    session
        .gateway()
        .put(CAPACITY_STORE, kvprobe_core::Key::from("chunk"), filler.clone())
        .await
        .unwrap();
    session
        .gateway()
        .put(SIZE_STORE, kvprobe_core::Key::from("record"), filler)
        .await
        .unwrap();

    session.clear_all().await.unwrap();

    assert!(backend.database_exists("kvprobe"));
    for store in [CAPACITY_STORE, SIZE_STORE, COUNT_STORE] {
        assert_eq!(backend.record_count("kvprobe", store), 0, "{store}");
    }
    assert!(sink.contains(Destination::Clear, "device busy"));
    assert!(sink.contains(Destination::Clear, "clearing the object stores instead"));
    assert!(sink.contains(Destination::Clear, "Cleared the object stores."));
}

#[tokio::test]
async fn abort_during_confirmation_skips_the_pending_write() {
    let confirmer = holding_confirmer();
    let backend = MemoryBackend::default();
    let session = Arc::new(ProbeSession::new(
        config(),
        Arc::new(backend.clone()),
        Arc::new(RecordingSink::new()),
        confirmer.clone(),
    ));

    let running = tokio::spawn({
        let session = session.clone();
        async move { session.run_capacity().await }
    });
    confirmer.reached.notified().await;
    session.abort_flag().request();
    confirmer.release.notify_one();
    let report = running.await.unwrap().unwrap();

    assert_eq!(report.outcome, Outcome::Aborted);
    assert_eq!(report.state.trial_count, 1);
    assert_eq!(report.estimate, Some(0));
    assert_eq!(backend.record_count("kvprobe", CAPACITY_STORE), 0);
}

#[tokio::test]
async fn clear_during_confirmation_keeps_database_deleted() {
    let confirmer = holding_confirmer();
    let backend = MemoryBackend::default();
    let sink = Arc::new(RecordingSink::new());
    let session = Arc::new(
        ProbeSession::new(
            config(),
            Arc::new(backend.clone()),
            sink.clone(),
            confirmer.clone(),
        )
        .with_environment(Arc::new(backend.clone())),
    );

    let running = tokio::spawn({
        let session = session.clone();
        async move { session.run_capacity().await }
    });
    confirmer.reached.notified().await;
    assert!(backend.database_exists("kvprobe"));

    session.clear_all().await.unwrap();

    assert!(!backend.database_exists("kvprobe"));
    assert!(sink.contains(Destination::Clear, "Still waiting for the running test to stop"));
    // The running probe still owns the controls.
    assert_eq!(sink.controls_history(), vec![false]);
    assert!(session.is_running());

    confirmer.release.notify_one();
    let report = running.await.unwrap().unwrap();

    assert_eq!(report.outcome, Outcome::Aborted);
    assert!(!backend.database_exists("kvprobe"));
    assert_eq!(sink.controls_history(), vec![false, true]);
}

#[tokio::test]
async fn estimate_lists_per_store_usage() {
    let limits = MemoryLimits {
        quota_bytes: Some(1024 * 1024),
        ..Default::default()
    };
    let backend = MemoryBackend::new(limits);
    let sink = Arc::new(RecordingSink::new());
    let session = ProbeSession::new(
        config(),
        Arc::new(backend.clone()),
        sink.clone(),
        Arc::new(AlwaysContinue),
    )
    .with_environment(Arc::new(backend.clone()));
    session
        .gateway()
        .batch_add(COUNT_STORE, 4, &kvprobe_core::Payload::from("abcd"))
        .await
        .unwrap();

    let estimate = session.check_estimate().await.unwrap().unwrap();

    assert_eq!(estimate.usage, 16);
    assert_eq!(estimate.quota, 1024 * 1024);
    assert!(sink.contains(Destination::Storage, "countStore=16 Bytes"));
    assert!(sink.contains(Destination::Storage, "Quota: 1 MiB"));
    assert!(sink.contains(Destination::Storage, "Persistence: disabled"));
}

#[tokio::test]
async fn estimate_without_environment_is_unsupported() {
    let sink = Arc::new(RecordingSink::new());
    let session = ProbeSession::new(
        config(),
        Arc::new(MemoryBackend::default()),
        sink.clone(),
        Arc::new(AlwaysContinue),
    );

    assert_eq!(session.check_estimate().await, Ok(None));
    assert_eq!(session.request_persistence().await, Ok(None));
    assert!(sink.contains(Destination::Storage, "not supported"));
    assert!(sink.contains(Destination::Persist, "not supported"));
}

#[tokio::test]
async fn persistence_request_granted_then_already_persistent() {
    let backend = MemoryBackend::default();
    backend.set_persist_grant(true);
    let sink = Arc::new(RecordingSink::new());
    let session = ProbeSession::new(
        config(),
        Arc::new(backend.clone()),
        sink.clone(),
        Arc::new(AlwaysContinue),
    )
    .with_environment(Arc::new(backend.clone()));

    assert_eq!(session.request_persistence().await, Ok(Some(true)));
    assert!(sink.contains(Destination::Persist, "request was granted"));

    assert_eq!(session.request_persistence().await, Ok(Some(true)));
    assert!(sink.contains(Destination::Persist, "already persistent"));
}

#[tokio::test]
async fn persistence_request_denied_lists_reasons() {
    let backend = MemoryBackend::default();
    let sink = Arc::new(RecordingSink::new());
    let session = ProbeSession::new(
        config(),
        Arc::new(backend.clone()),
        sink.clone(),
        Arc::new(AlwaysContinue),
    )
    .with_environment(Arc::new(backend.clone()));

    assert_eq!(session.request_persistence().await, Ok(Some(false)));
    assert!(sink.contains(Destination::Persist, "was not granted"));
    assert!(sink.contains(Destination::Persist, "Possible reasons"));
}

#[tokio::test]
async fn teardown_closes_connection() {
    let backend = MemoryBackend::default();
    let session = ProbeSession::new(
        config(),
        Arc::new(backend.clone()),
        Arc::new(RecordingSink::new()),
        Arc::new(AlwaysContinue),
    );
    session.gateway().open().await.unwrap();
    assert_eq!(backend.open_connections("kvprobe"), 1);

    session.teardown();

    assert_eq!(backend.open_connections("kvprobe"), 0);
}
