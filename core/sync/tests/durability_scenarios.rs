//! End-to-end scenarios across snapshot store, ledger, coordinator and queue.

use async_trait::async_trait;
use chrono::{Duration as ChronoDuration, Utc};
use serde_json::json;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use fieldkeep_common::{CollectionName, Error, Payload, Result};
use fieldkeep_storage::{KeyValueStore, MemoryDataProvider, MemoryStore};
use fieldkeep_sync::{
    Delta, DurabilityConfig, EventKind, IntegrityValidator, IssueKind, MockTransport,
    OfflineOperation, OfflineQueue, OperationHandler, OperationKind, OperationStatus,
    RecordingNotifier, RemoteVersionMeta, RetryConfig, Services, Snapshot, StoreTransport,
    SyncStatus, VersionOrigin,
};

fn name(raw: &str) -> CollectionName {
    CollectionName::new(raw).unwrap()
}

struct Harness {
    provider: Arc<MemoryDataProvider>,
    transport: Arc<MockTransport>,
    notifier: Arc<RecordingNotifier>,
    services: Services,
}

async fn harness() -> Harness {
    let config = DurabilityConfig::default();
    let provider = Arc::new(MemoryDataProvider::new(config.collections.clone()));
    let transport = Arc::new(MockTransport::new());
    let notifier = Arc::new(RecordingNotifier::new());
    let services = Services::open(
        config,
        Arc::new(MemoryStore::new()),
        provider.clone(),
        transport.clone(),
        notifier.clone(),
    )
    .await
    .unwrap();

    Harness {
        provider,
        transport,
        notifier,
        services,
    }
}

/// Fails a fixed number of times, then succeeds.
struct FlakyHandler {
    failures_left: AtomicU32,
    attempts: AtomicU32,
}

impl FlakyHandler {
    fn new(failures: u32) -> Self {
        Self {
            failures_left: AtomicU32::new(failures),
            attempts: AtomicU32::new(0),
        }
    }
}

#[async_trait]
impl OperationHandler for FlakyHandler {
    async fn apply(&self, _op: &OfflineOperation) -> Result<()> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        let failing = self
            .failures_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(Error::ProviderUnavailable("flaky".to_string()));
        }
        Ok(())
    }
}

fn immediate_retry(max: u32) -> RetryConfig {
    RetryConfig::new(max)
        .with_initial_delay(Duration::ZERO)
        .with_jitter(false)
}

#[tokio::test]
async fn test_snapshot_version_sync_then_stale() {
    let h = harness().await;
    let services = &h.services;
    assert_eq!(services.coordinator.get_state().await.status, SyncStatus::Pending);

    h.provider.set_collection(name("favorites"), json!(["aphid"]));
    services.snapshots.create_snapshot().await.unwrap();
    services
        .ledger
        .record_version(Delta::added([name("favorites")]))
        .await
        .unwrap();

    let state = services.coordinator.sync().await.unwrap();
    assert_eq!(state.status, SyncStatus::Synced);
    assert_eq!(services.coordinator.get_state().await.status, SyncStatus::Synced);

    // A new snapshot alone does not make the remote stale
    services.snapshots.create_snapshot().await.unwrap();
    assert_eq!(services.coordinator.get_state().await.status, SyncStatus::Synced);

    services.ledger.record_version(Delta::new()).await.unwrap();
    assert_eq!(services.coordinator.get_state().await.status, SyncStatus::Pending);
}

#[tokio::test]
async fn test_repeated_transport_failures_leave_history_intact() {
    let h = harness().await;
    let services = &h.services;
    services.snapshots.create_snapshot().await.unwrap();
    let history_before = services.snapshots.get_history(10).await;

    h.transport.fail_next(3);
    for _ in 0..3 {
        let state = services.coordinator.sync().await.unwrap();
        assert_eq!(state.status, SyncStatus::Failed);
        assert!(state.last_error.is_some());
    }

    assert_eq!(services.snapshots.get_history(10).await, history_before);
    assert_eq!(h.notifier.count(EventKind::SyncFailed), 3);

    let state = services.coordinator.sync().await.unwrap();
    assert_eq!(state.status, SyncStatus::Synced);
}

#[tokio::test]
async fn test_newer_remote_wins_reconcile() {
    let h = harness().await;
    let services = &h.services;
    h.provider.set_collection(name("favorites"), json!(["local"]));
    services.snapshots.create_snapshot().await.unwrap();
    services.ledger.record_version(Delta::new()).await.unwrap();

    let mut remote_payload: Payload = h.provider.payload();
    remote_payload.insert(name("favorites"), json!(["remote"]));
    let mut remote = Snapshot::new(remote_payload, "1.0.0");
    remote.timestamp = Utc::now() + ChronoDuration::minutes(5);
    let meta = RemoteVersionMeta::for_snapshot("remote-newer", &remote);
    h.transport.pin_remote(remote, meta);

    let state = services.coordinator.sync().await.unwrap();

    assert_eq!(state.status, SyncStatus::Synced);
    assert_eq!(state.remote_snapshot_id.as_deref(), Some("remote-newer"));
    assert_eq!(h.provider.payload()[&name("favorites")], json!(["remote"]));

    let versions = services.ledger.get_history(10).await;
    assert_eq!(versions[0].origin, VersionOrigin::Remote);
    assert!(!versions[0].superseded);
    assert!(versions[1].superseded);
    assert_eq!(h.notifier.count(EventKind::ConflictResolved), 1);
}

#[tokio::test]
async fn test_older_remote_loses_reconcile() {
    let h = harness().await;
    let services = &h.services;
    h.provider.set_collection(name("favorites"), json!(["local"]));
    services.snapshots.create_snapshot().await.unwrap();
    services.ledger.record_version(Delta::new()).await.unwrap();

    let mut remote = Snapshot::new(h.provider.payload(), "1.0.0");
    remote.timestamp = Utc::now() - ChronoDuration::days(1);
    let meta = RemoteVersionMeta::for_snapshot("remote-older", &remote);
    h.transport.pin_remote(remote, meta);

    services.coordinator.sync().await.unwrap();

    assert_eq!(h.provider.payload()[&name("favorites")], json!(["local"]));
    let versions = services.ledger.get_history(10).await;
    assert_eq!(versions[0].origin, VersionOrigin::Local);
    assert!(!versions[0].superseded);
    assert_eq!(versions[1].origin, VersionOrigin::Remote);
    assert!(versions[1].superseded);
}

/// A device with its own local state, syncing through a shared remote store.
async fn device(remote: Arc<MemoryStore>) -> (Arc<MemoryDataProvider>, Services) {
    let config = DurabilityConfig::default();
    let provider = Arc::new(MemoryDataProvider::new(config.collections.clone()));
    let services = Services::open(
        config,
        Arc::new(MemoryStore::new()),
        provider.clone(),
        Arc::new(StoreTransport::new(remote)),
        Arc::new(RecordingNotifier::new()),
    )
    .await
    .unwrap();
    (provider, services)
}

#[tokio::test]
async fn test_devices_sharing_a_remote_reconcile() {
    let remote = Arc::new(MemoryStore::new());
    let (field_provider, field) = device(remote.clone()).await;
    let (office_provider, office) = device(remote).await;

    field_provider.set_collection(name("favorites"), json!(["from-field"]));
    field.snapshots.create_snapshot().await.unwrap();
    field.ledger.record_version(Delta::new()).await.unwrap();
    let first = field.coordinator.sync().await.unwrap();
    assert_eq!(first.status, SyncStatus::Synced);

    tokio::time::sleep(Duration::from_millis(5)).await;
    office_provider.set_collection(name("favorites"), json!(["from-office"]));
    office.snapshots.create_snapshot().await.unwrap();
    office.ledger.record_version(Delta::new()).await.unwrap();

    // The office copy is newer, so it overwrites the remote
    let pushed = office.coordinator.sync().await.unwrap();
    assert_eq!(pushed.status, SyncStatus::Synced);
    assert_ne!(pushed.remote_snapshot_id, first.remote_snapshot_id);
    assert_eq!(office_provider.payload()[&name("favorites")], json!(["from-office"]));
    let office_versions = office.ledger.get_history(10).await;
    assert_eq!(office_versions.len(), 2);
    assert!(office_versions[1].superseded);

    // The field device sees a remote it never synced with and adopts it
    let adopted = field.coordinator.sync().await.unwrap();
    assert_eq!(adopted.remote_snapshot_id, pushed.remote_snapshot_id);
    assert_eq!(field_provider.payload()[&name("favorites")], json!(["from-office"]));
    let field_versions = field.ledger.get_history(10).await;
    assert_eq!(field_versions[0].origin, VersionOrigin::Remote);
    assert!(field_versions[1].superseded);
}

#[tokio::test]
async fn test_operation_exhausts_retries() {
    let store: Arc<dyn KeyValueStore> = Arc::new(MemoryStore::new());
    let handler = Arc::new(FlakyHandler::new(u32::MAX));
    let queue = OfflineQueue::open(store, immediate_retry(3))
        .await
        .unwrap()
        .with_default_handler(handler.clone());

    let op = queue
        .enqueue(OfflineOperation::new(
            OperationKind::Create,
            name("favorites"),
            json!({"id": "aphid"}),
        ))
        .await
        .unwrap();

    for _ in 0..3 {
        queue.drain().await.unwrap();
    }

    let failed = queue.get_failed().await;
    assert_eq!(failed.len(), 1);
    assert_eq!(failed[0].id, op.id);
    assert_eq!(failed[0].status, OperationStatus::Failed);
    assert_eq!(failed[0].attempt_count, 3);

    let report = queue.drain().await.unwrap();
    assert!(!report.applied_any());
    assert_eq!(handler.attempts.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn test_operation_succeeds_on_last_retry() {
    let store: Arc<dyn KeyValueStore> = Arc::new(MemoryStore::new());
    let queue = OfflineQueue::open(store, immediate_retry(3))
        .await
        .unwrap()
        .with_default_handler(Arc::new(FlakyHandler::new(2)));

    queue
        .enqueue(OfflineOperation::new(
            OperationKind::Update,
            name("pests"),
            json!({"id": "aphid"}),
        ))
        .await
        .unwrap();

    assert_eq!(queue.drain().await.unwrap().retried, 1);
    assert_eq!(queue.drain().await.unwrap().retried, 1);
    let report = queue.drain().await.unwrap();

    assert_eq!(report.applied, vec![(OperationKind::Update, name("pests"))]);
    assert!(queue.is_empty().await);
    assert!(queue.get_failed().await.is_empty());
}

#[tokio::test]
async fn test_queue_survives_restart() {
    let store: Arc<dyn KeyValueStore> = Arc::new(MemoryStore::new());
    let queue = OfflineQueue::open(store.clone(), RetryConfig::default())
        .await
        .unwrap();
    queue
        .enqueue(OfflineOperation::new(
            OperationKind::Delete,
            name("history"),
            json!({"id": "h-1"}),
        ))
        .await
        .unwrap();

    let reopened = OfflineQueue::open(store, RetryConfig::default())
        .await
        .unwrap();
    let pending = reopened.get_pending().await;
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].kind, OperationKind::Delete);
}

#[tokio::test]
async fn test_missing_version_is_invalid() {
    let h = harness().await;
    h.services.snapshots.create_snapshot().await.unwrap();
    let snapshot = h.services.snapshots.get_snapshot().await.unwrap();

    let mut value = serde_json::to_value(snapshot.as_ref()).unwrap();
    value.as_object_mut().unwrap().remove("schema_version");
    let bytes = serde_json::to_vec(&value).unwrap();

    let validator = IntegrityValidator::new(
        h.services.config.collections.clone(),
        h.services.config.validation.clone(),
    );
    let result = validator.validate_bytes(&bytes);

    assert!(!result.is_valid);
    assert!(result.has_issue(IssueKind::MissingVersion));
    assert_eq!(result.performance.size_bytes, bytes.len() as u64);
}

#[tokio::test]
async fn test_restore_round_trip_and_delete_idempotent() {
    let h = harness().await;
    let services = &h.services;
    h.provider.set_collection(name("pests"), json!({"aphid": {"id": "aphid"}}));
    services.snapshots.create_snapshot().await.unwrap();
    let original = services.snapshots.get_snapshot().await.unwrap();

    h.provider.set_collection(name("pests"), json!({}));
    services.snapshots.restore_snapshot(&original).await.unwrap();

    assert_eq!(*services.snapshots.get_snapshot().await.unwrap(), *original);
    assert_eq!(h.provider.payload(), original.payload);

    services.snapshots.delete_snapshot().await.unwrap();
    assert!(services.snapshots.get_history(10).await.is_empty());
    services.snapshots.delete_snapshot().await.unwrap();
    assert!(services.snapshots.get_history(10).await.is_empty());
    assert!(matches!(
        services.snapshots.get_snapshot().await,
        Err(Error::NotFound(_))
    ));
}
