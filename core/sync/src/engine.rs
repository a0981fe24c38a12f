//! Sync coordinator: drives the current snapshot against the remote.

use chrono::Utc;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::{watch, Mutex, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use fieldkeep_common::{Error, Result};
use fieldkeep_storage::{keys, load_record, save_record, KeyValueStore};

use crate::config::SyncConfig;
use crate::conflict::{ConflictInfo, ConflictResolver, Side};
use crate::ledger::{VersionLedger, VersionOrigin};
use crate::notify::{EventKind, NotificationSink};
use crate::snapshot::{Snapshot, SnapshotStore};
use crate::state::{SyncState, SyncStatus};
use crate::transport::{RemoteVersionMeta, Transport};

/// Owner of the sync state.
///
/// Sync failures never propagate: they are logged, surfaced to the
/// notification sink and recorded in the state.
#[derive(Clone)]
pub struct SyncCoordinator {
    store: Arc<dyn KeyValueStore>,
    snapshots: SnapshotStore,
    ledger: VersionLedger,
    transport: Arc<dyn Transport>,
    notifier: Arc<dyn NotificationSink>,
    config: SyncConfig,
    resolver: ConflictResolver,
    revisions: watch::Receiver<u64>,
    state: Arc<RwLock<Arc<SyncState>>>,
    write_gate: Arc<Mutex<()>>,
}

impl SyncCoordinator {
    /// Open the coordinator, loading the persisted sync state.
    pub async fn open(
        store: Arc<dyn KeyValueStore>,
        snapshots: SnapshotStore,
        ledger: VersionLedger,
        transport: Arc<dyn Transport>,
        notifier: Arc<dyn NotificationSink>,
        config: SyncConfig,
    ) -> Result<Self> {
        let state: SyncState = load_record(store.as_ref(), keys::SYNC_STATE)
            .await?
            .unwrap_or_default();

        debug!("Opened sync coordinator via {}: status {}", transport.name(), state.status);

        let revisions = ledger.subscribe();
        Ok(Self {
            store,
            snapshots,
            ledger,
            transport,
            notifier,
            config,
            resolver: ConflictResolver::new(),
            revisions,
            state: Arc::new(RwLock::new(Arc::new(state))),
            write_gate: Arc::new(Mutex::new(())),
        })
    }

    /// Current sync state.
    ///
    /// A synced state flips to pending once the ledger has recorded a local
    /// change the remote has not seen.
    pub async fn get_state(&self) -> SyncState {
        let revision = *self.revisions.borrow();
        {
            let state = self.state.read().await;
            if !state.is_stale(revision) {
                return state.as_ref().clone();
            }
        }

        let mut state = self.state.write().await;
        if state.is_stale(revision) {
            let mut updated = state.as_ref().clone();
            updated.mark_pending();
            debug!("Local revision {} is ahead of remote, sync pending", revision);
            self.persist(&updated).await;
            *state = Arc::new(updated);
        }
        state.as_ref().clone()
    }

    /// Reconcile with the remote and push the current snapshot.
    pub async fn sync(&self) -> Result<SyncState> {
        self.sync_cancellable(&CancellationToken::new()).await
    }

    /// Sync, checking `cancel` before each transport call.
    ///
    /// # Errors
    /// - `NotFound` if there is no snapshot to sync
    /// - `Cancelled` if cancelled; the state is left pending
    ///
    /// Transport failures and timeouts are not errors: they yield a `failed`
    /// state.
    pub async fn sync_cancellable(&self, cancel: &CancellationToken) -> Result<SyncState> {
        let _gate = self.write_gate.lock().await;

        let snapshot = self.snapshots.get_snapshot().await?;
        let started = Utc::now();
        let revision = *self.revisions.borrow();

        self.update_state(|s| s.mark_pending()).await;

        match self.exchange(&snapshot, cancel).await {
            Ok(remote_id) => {
                if let Err(e) = self.ledger.mark_synced(started).await {
                    error!("Failed to mark versions synced: {}", e);
                }
                let now = Utc::now();
                let state = self
                    .update_state(|s| s.mark_synced(remote_id.clone(), now, revision))
                    .await;

                info!("Synced snapshot {} as {}", snapshot.id, remote_id);
                self.notifier.notify(EventKind::SyncCompleted, &remote_id);
                Ok(state)
            }
            Err(Error::Cancelled(reason)) => {
                info!("Sync cancelled: {}", reason);
                Err(Error::Cancelled(reason))
            }
            Err(e) => Ok(self.fail(started, e).await),
        }
    }

    /// Pull the remote, settle any divergence, then push unless the remote
    /// won. Returns the remote id the device is now in line with.
    async fn exchange(&self, snapshot: &Snapshot, cancel: &CancellationToken) -> Result<String> {
        if cancel.is_cancelled() {
            return Err(Error::Cancelled("sync cancelled before pull".to_string()));
        }
        let remote = match self.bounded("pull", self.transport.pull()).await {
            Ok(remote) => Some(remote),
            Err(Error::NotFound(_)) => None,
            Err(e) => return Err(e),
        };

        if let Some((remote_snapshot, remote_meta)) = remote {
            let known = self.state.read().await.remote_snapshot_id.clone();
            if self.resolver.detect_conflict(known.as_deref(), &remote_meta)
                && self.settle(snapshot, &remote_snapshot, &remote_meta).await? == Side::Remote
            {
                return Ok(remote_meta.remote_id);
            }
        }

        if cancel.is_cancelled() {
            return Err(Error::Cancelled("sync cancelled before push".to_string()));
        }
        self.bounded("push", self.transport.push(snapshot)).await
    }

    /// Resolve a remote that moved since the last sync.
    async fn settle(
        &self,
        snapshot: &Snapshot,
        remote_snapshot: &Snapshot,
        remote_meta: &RemoteVersionMeta,
    ) -> Result<Side> {
        warn!(
            "{}",
            Error::ConflictDetected(format!(
                "remote holds {} which this device has not seen",
                remote_meta.remote_id
            ))
        );

        let winner = match self.ledger.latest_local().await {
            Some(local) => match self.ledger.reconcile(&local, remote_meta).await?.origin {
                VersionOrigin::Local => Side::Local,
                VersionOrigin::Remote => Side::Remote,
            },
            None => self
                .resolver
                .resolve(&ConflictInfo::for_snapshot(snapshot, remote_meta)),
        };

        match winner {
            Side::Local => {
                self.notifier.notify(
                    EventKind::ConflictResolved,
                    &format!("kept local snapshot {}", snapshot.id),
                );
            }
            Side::Remote => {
                self.snapshots.restore_snapshot(remote_snapshot).await?;
                self.notifier.notify(
                    EventKind::ConflictResolved,
                    &format!("applied newer remote {}", remote_meta.remote_id),
                );
            }
        }
        Ok(winner)
    }

    async fn fail(&self, started: chrono::DateTime<Utc>, err: Error) -> SyncState {
        warn!("Sync failed: {}", err);
        if let Err(e) = self.ledger.mark_failed(started).await {
            error!("Failed to mark versions failed: {}", e);
        }
        let detail = err.to_string();
        let state = self.update_state(|s| s.mark_failed(detail.clone())).await;
        self.notifier.notify(EventKind::SyncFailed, &detail);
        state
    }

    /// Pull the remote snapshot and apply it locally.
    ///
    /// Falling back to the local snapshot when the remote is unreachable is
    /// up to the caller.
    ///
    /// # Errors
    /// - `TransportUnreachable` if the remote cannot be reached in time
    /// - `NotFound` if the remote holds no snapshot
    /// - Any error of `SnapshotStore::restore_snapshot`, or a failure to
    ///   record the restore, in which case the local data is rolled back
    pub async fn restore_from_remote(&self) -> Result<RemoteVersionMeta> {
        let _gate = self.write_gate.lock().await;

        let (snapshot, meta) = self.bounded("pull", self.transport.pull()).await?;
        self.ledger
            .restore_and_record(&snapshot, VersionOrigin::Remote)
            .await?;

        let now = Utc::now();
        let revision = *self.revisions.borrow();
        self.update_state(|s| s.mark_synced(meta.remote_id.clone(), now, revision))
            .await;

        info!("Restored remote snapshot {}", meta.remote_id);
        self.notifier.notify(EventKind::SnapshotRestored, &meta.remote_id);
        Ok(meta)
    }

    /// Run a transport call under the configured timeout.
    async fn bounded<T>(&self, op: &str, call: impl Future<Output = Result<T>>) -> Result<T> {
        let limit = self.config.transport_timeout();
        match tokio::time::timeout(limit, call).await {
            Ok(result) => result,
            Err(_) => Err(Error::TransportUnreachable(format!(
                "{} via {} timed out after {:?}",
                op,
                self.transport.name(),
                limit
            ))),
        }
    }

    async fn update_state(&self, change: impl FnOnce(&mut SyncState)) -> SyncState {
        let mut state = self.state.write().await;
        let mut updated = state.as_ref().clone();
        change(&mut updated);
        self.persist(&updated).await;
        *state = Arc::new(updated.clone());
        updated
    }

    async fn persist(&self, state: &SyncState) {
        if let Err(e) = save_record(self.store.as_ref(), keys::SYNC_STATE, state).await {
            error!("Failed to persist sync state: {}", e);
        }
    }

    /// Whether the last sync attempt failed.
    pub async fn is_failed(&self) -> bool {
        self.state.read().await.status == SyncStatus::Failed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{default_collections, BackupConfig, VersionConfig};
    use crate::ledger::Delta;
    use crate::notify::RecordingNotifier;
    use crate::transport::MockTransport;
    use chrono::Duration;
    use fieldkeep_common::CollectionName;
    use fieldkeep_storage::{MemoryDataProvider, MemoryStore};
    use serde_json::json;

    fn name(raw: &str) -> CollectionName {
        CollectionName::new(raw).unwrap()
    }

    struct Fixture {
        store: Arc<MemoryStore>,
        provider: Arc<MemoryDataProvider>,
        snapshots: SnapshotStore,
        ledger: VersionLedger,
        transport: Arc<MockTransport>,
        notifier: Arc<RecordingNotifier>,
        coordinator: SyncCoordinator,
    }

    async fn setup_with(config: SyncConfig) -> Fixture {
        let store = Arc::new(MemoryStore::new());
        let provider = Arc::new(MemoryDataProvider::new(default_collections()));
        let snapshots = SnapshotStore::open(store.clone(), provider.clone(), BackupConfig::default())
            .await
            .unwrap();
        let ledger = VersionLedger::open(store.clone(), snapshots.clone(), VersionConfig::default())
            .await
            .unwrap();
        let transport = Arc::new(MockTransport::new());
        let notifier = Arc::new(RecordingNotifier::new());
        let coordinator = SyncCoordinator::open(
            store.clone(),
            snapshots.clone(),
            ledger.clone(),
            transport.clone(),
            notifier.clone(),
            config,
        )
        .await
        .unwrap();

        Fixture {
            store,
            provider,
            snapshots,
            ledger,
            transport,
            notifier,
            coordinator,
        }
    }

    async fn setup() -> Fixture {
        setup_with(SyncConfig::default()).await
    }

    #[tokio::test]
    async fn test_sync_requires_snapshot() {
        let fx = setup().await;
        assert!(matches!(fx.coordinator.sync().await, Err(Error::NotFound(_))));
        assert_eq!(fx.transport.push_count(), 0);
    }

    #[tokio::test]
    async fn test_successful_sync() {
        let fx = setup().await;
        fx.snapshots.create_snapshot().await.unwrap();
        fx.ledger.record_version(Delta::new()).await.unwrap();

        let state = fx.coordinator.sync().await.unwrap();

        assert_eq!(state.status, SyncStatus::Synced);
        assert!(state.last_sync_timestamp.is_some());
        let (_, meta) = fx.transport.remote().unwrap();
        assert_eq!(state.remote_snapshot_id, Some(meta.remote_id));
        assert_eq!(
            fx.ledger.get_history(1).await[0].sync_status,
            crate::ledger::VersionSyncStatus::Synced
        );
        assert_eq!(fx.notifier.count(EventKind::SyncCompleted), 1);
    }

    #[tokio::test]
    async fn test_new_local_version_makes_state_pending() {
        let fx = setup().await;
        fx.snapshots.create_snapshot().await.unwrap();
        fx.coordinator.sync().await.unwrap();
        assert_eq!(fx.coordinator.get_state().await.status, SyncStatus::Synced);

        fx.snapshots.create_snapshot().await.unwrap();
        assert_eq!(fx.coordinator.get_state().await.status, SyncStatus::Synced);

        fx.ledger.record_version(Delta::new()).await.unwrap();
        assert_eq!(fx.coordinator.get_state().await.status, SyncStatus::Pending);
    }

    #[tokio::test]
    async fn test_transport_failure_is_recorded_not_raised() {
        let fx = setup().await;
        fx.snapshots.create_snapshot().await.unwrap();
        fx.ledger.record_version(Delta::new()).await.unwrap();
        fx.transport.fail_next(1);

        let state = fx.coordinator.sync().await.unwrap();

        assert_eq!(state.status, SyncStatus::Failed);
        assert!(state.last_error.unwrap().contains("simulated network failure"));
        assert!(fx.coordinator.is_failed().await);
        assert_eq!(
            fx.ledger.get_history(1).await[0].sync_status,
            crate::ledger::VersionSyncStatus::Failed
        );
        assert_eq!(fx.notifier.count(EventKind::SyncFailed), 1);

        let state = fx.coordinator.sync().await.unwrap();
        assert_eq!(state.status, SyncStatus::Synced);
        assert!(state.last_error.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_transport_times_out() {
        let fx = setup_with(SyncConfig {
            transport_timeout_secs: 1,
        })
        .await;
        fx.snapshots.create_snapshot().await.unwrap();
        fx.transport.set_latency(std::time::Duration::from_secs(60));

        let state = fx.coordinator.sync().await.unwrap();

        assert_eq!(state.status, SyncStatus::Failed);
        assert!(state.last_error.unwrap().contains("timed out"));
    }

    #[tokio::test]
    async fn test_cancelled_sync_stays_pending() {
        let fx = setup().await;
        fx.snapshots.create_snapshot().await.unwrap();

        let cancel = CancellationToken::new();
        cancel.cancel();
        let result = fx.coordinator.sync_cancellable(&cancel).await;

        assert!(matches!(result, Err(Error::Cancelled(_))));
        assert_eq!(fx.coordinator.get_state().await.status, SyncStatus::Pending);
        assert_eq!(fx.transport.push_count(), 0);
    }

    #[tokio::test]
    async fn test_newer_remote_wins_conflict() {
        let fx = setup().await;
        fx.provider.set_collection(name("favorites"), json!(["local"]));
        fx.snapshots.create_snapshot().await.unwrap();
        let local = fx.ledger.record_version(Delta::new()).await.unwrap();

        let mut remote_payload = fx.provider.payload();
        remote_payload.insert(name("favorites"), json!(["remote"]));
        let mut remote = Snapshot::new(remote_payload, "1.0.0");
        remote.timestamp = local.timestamp + Duration::hours(1);
        let meta = RemoteVersionMeta::for_snapshot("remote-other-device", &remote);
        fx.transport.pin_remote(remote, meta);

        let state = fx.coordinator.sync().await.unwrap();

        assert_eq!(state.status, SyncStatus::Synced);
        assert_eq!(state.remote_snapshot_id.as_deref(), Some("remote-other-device"));
        assert_eq!(fx.provider.payload()[&name("favorites")], json!(["remote"]));
        assert!(fx.ledger.get_version(&local.id).await.unwrap().superseded);
        assert_eq!(fx.notifier.count(EventKind::ConflictResolved), 1);
    }

    #[tokio::test]
    async fn test_older_remote_loses_conflict() {
        let fx = setup().await;
        fx.provider.set_collection(name("favorites"), json!(["local"]));
        fx.snapshots.create_snapshot().await.unwrap();
        let local = fx.ledger.record_version(Delta::new()).await.unwrap();

        let mut remote = Snapshot::new(fx.provider.payload(), "1.0.0");
        remote.timestamp = local.timestamp - Duration::hours(1);
        let meta = RemoteVersionMeta::for_snapshot("remote-stale", &remote);
        fx.transport.pin_remote(remote, meta);

        let state = fx.coordinator.sync().await.unwrap();

        assert_eq!(state.status, SyncStatus::Synced);
        assert_ne!(state.remote_snapshot_id.as_deref(), Some("remote-stale"));
        assert_eq!(fx.provider.payload()[&name("favorites")], json!(["local"]));
        assert!(!fx.ledger.get_version(&local.id).await.unwrap().superseded);
    }

    #[tokio::test]
    async fn test_remote_moved_since_last_sync_is_a_conflict() {
        let fx = setup().await;
        fx.snapshots.create_snapshot().await.unwrap();
        fx.ledger.record_version(Delta::new()).await.unwrap();
        fx.coordinator.sync().await.unwrap();
        fx.coordinator.sync().await.unwrap();
        assert_eq!(fx.transport.push_count(), 2);
        assert_eq!(fx.notifier.count(EventKind::ConflictResolved), 0);

        let mut remote = Snapshot::new(fx.provider.payload(), "1.0.0");
        remote.timestamp = Utc::now() + Duration::hours(1);
        let meta = RemoteVersionMeta::for_snapshot("remote-other-device", &remote);
        fx.transport.pin_remote(remote, meta);

        let state = fx.coordinator.sync().await.unwrap();

        assert_eq!(state.remote_snapshot_id.as_deref(), Some("remote-other-device"));
        assert_eq!(fx.transport.push_count(), 2);
        assert_eq!(fx.notifier.count(EventKind::ConflictResolved), 1);
    }

    #[tokio::test]
    async fn test_restore_from_remote_rolls_back_when_unrecorded() {
        let fx = setup().await;
        fx.provider.set_collection(name("favorites"), json!(["aphid"]));
        fx.snapshots.create_snapshot().await.unwrap();
        fx.coordinator.sync().await.unwrap();
        let synced = fx.coordinator.get_state().await;

        fx.provider.set_collection(name("favorites"), json!([]));
        fx.store.fail_puts_to(keys::VERSION_HISTORY, 1);

        assert!(matches!(
            fx.coordinator.restore_from_remote().await,
            Err(Error::Storage(_))
        ));
        assert_eq!(fx.provider.payload()[&name("favorites")], json!([]));
        assert!(fx.ledger.get_history(10).await.is_empty());
        assert_eq!(fx.coordinator.get_state().await, synced);
        assert_eq!(fx.notifier.count(EventKind::SnapshotRestored), 0);
    }

    #[tokio::test]
    async fn test_restore_from_remote() {
        let fx = setup().await;
        fx.provider.set_collection(name("favorites"), json!(["aphid"]));
        fx.snapshots.create_snapshot().await.unwrap();
        fx.coordinator.sync().await.unwrap();
        let revision = fx.ledger.revision();

        fx.provider.set_collection(name("favorites"), json!([]));
        let meta = fx.coordinator.restore_from_remote().await.unwrap();

        assert_eq!(fx.provider.payload()[&name("favorites")], json!(["aphid"]));
        let history = fx.ledger.get_history(1).await;
        let latest = &history[0];
        assert_eq!(latest.origin, VersionOrigin::Remote);
        assert!(latest.delta.added.contains(&name("favorites")));
        assert_eq!(fx.ledger.revision(), revision);

        let state = fx.coordinator.get_state().await;
        assert_eq!(state.status, SyncStatus::Synced);
        assert_eq!(state.remote_snapshot_id, Some(meta.remote_id));
        assert_eq!(fx.notifier.count(EventKind::SnapshotRestored), 1);
    }

    #[tokio::test]
    async fn test_restore_from_unreachable_remote() {
        let fx = setup().await;
        fx.transport.fail_next(1);
        assert!(matches!(
            fx.coordinator.restore_from_remote().await,
            Err(Error::TransportUnreachable(_))
        ));
        assert!(matches!(
            fx.coordinator.restore_from_remote().await,
            Err(Error::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_state_survives_reopen() {
        let fx = setup().await;
        fx.snapshots.create_snapshot().await.unwrap();
        fx.transport.fail_next(1);
        fx.coordinator.sync().await.unwrap();

        let reopened = SyncCoordinator::open(
            fx.store.clone(),
            fx.snapshots.clone(),
            fx.ledger.clone(),
            fx.transport.clone(),
            fx.notifier.clone(),
            SyncConfig::default(),
        )
        .await
        .unwrap();
        assert_eq!(reopened.get_state().await.status, SyncStatus::Failed);
    }
}
