//! Scheduler: the one place that decides what runs when.
//!
//! Four independent periodic triggers (backup, sync, validation, drain), each
//! guarded by its own in-flight flag. A tick that finds its flag held is
//! skipped, never queued. Scheduled work runs in its own task and its failures
//! stop at the trigger boundary; manual triggers return errors to the caller.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{watch, Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use fieldkeep_common::{Error, Result};
use fieldkeep_storage::{keys, load_record, save_record};

use crate::ledger::{Delta, VersionOrigin, VersionRecord};
use crate::notify::EventKind;
use crate::queue::{DrainReport, OfflineOperation};
use crate::services::Services;
use crate::snapshot::BackupHistoryEntry;
use crate::state::SyncState;
use crate::transport::RemoteVersionMeta;
use crate::validation::ValidationResult;

/// Outcome of the last validation run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ValidationStatus {
    #[default]
    Pending,
    Valid,
    Invalid,
}

/// Which backup cadences are enabled.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackupCadence {
    pub daily: bool,
    pub weekly: bool,
    pub monthly: bool,
}

impl Default for BackupCadence {
    fn default() -> Self {
        Self {
            daily: true,
            weekly: true,
            monthly: true,
        }
    }
}

/// Length of each backup cadence.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CadenceIntervals {
    pub daily_secs: u64,
    pub weekly_secs: u64,
    pub monthly_secs: u64,
}

impl Default for CadenceIntervals {
    fn default() -> Self {
        Self {
            daily_secs: 24 * 60 * 60,
            weekly_secs: 7 * 24 * 60 * 60,
            monthly_secs: 30 * 24 * 60 * 60,
        }
    }
}

/// Persisted scheduling state and user preferences.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Schedule {
    #[serde(default)]
    pub backup_enabled: BackupCadence,
    #[serde(default)]
    pub intervals: CadenceIntervals,
    pub last_backup_at: Option<DateTime<Utc>>,
    pub last_sync_at: Option<DateTime<Utc>>,
    pub last_validation_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub validation_status: ValidationStatus,
}

impl Schedule {
    /// Shortest enabled backup cadence, if any is enabled.
    pub fn backup_interval(&self) -> Option<chrono::Duration> {
        let enabled = &self.backup_enabled;
        let intervals = &self.intervals;
        [
            (enabled.daily, intervals.daily_secs),
            (enabled.weekly, intervals.weekly_secs),
            (enabled.monthly, intervals.monthly_secs),
        ]
        .into_iter()
        .filter(|(on, _)| *on)
        .filter_map(|(_, secs)| i64::try_from(secs).ok().and_then(chrono::Duration::try_seconds))
        .min()
    }

    /// Whether a backup is due at `now`.
    pub fn backup_due(&self, now: DateTime<Utc>) -> bool {
        match (self.backup_interval(), self.last_backup_at) {
            (None, _) => false,
            (Some(_), None) => true,
            (Some(interval), Some(last)) => now - last >= interval,
        }
    }
}

/// A periodic trigger.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Trigger {
    Backup,
    Sync,
    Validation,
    Drain,
}

impl Trigger {
    fn slot(self) -> usize {
        match self {
            Trigger::Backup => 0,
            Trigger::Sync => 1,
            Trigger::Validation => 2,
            Trigger::Drain => 3,
        }
    }
}

impl fmt::Display for Trigger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Trigger::Backup => "backup",
            Trigger::Sync => "sync",
            Trigger::Validation => "validation",
            Trigger::Drain => "drain",
        };
        f.write_str(s)
    }
}

/// Held while a trigger's work is in flight.
struct TriggerGuard {
    flags: Arc<[AtomicBool; 4]>,
    slot: usize,
}

impl Drop for TriggerGuard {
    fn drop(&mut self) {
        self.flags[self.slot].store(false, Ordering::Release);
    }
}

/// Reachability of the remote, as reported by the platform.
#[derive(Clone)]
pub struct Connectivity {
    tx: Arc<watch::Sender<bool>>,
}

impl Connectivity {
    pub fn new(online: bool) -> Self {
        let (tx, _) = watch::channel(online);
        Self { tx: Arc::new(tx) }
    }

    /// Report a connectivity change. Repeated reports of the same state are
    /// ignored.
    pub fn set_online(&self, online: bool) {
        self.tx.send_if_modified(|current| {
            let changed = *current != online;
            *current = online;
            changed
        });
    }

    pub fn is_online(&self) -> bool {
        *self.tx.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.tx.subscribe()
    }
}

/// How a submitted operation was handled.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubmitOutcome {
    Applied,
    /// Queued under this operation id.
    Queued(String),
}

/// Where a restore came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RestoreSource {
    Remote(RemoteVersionMeta),
    /// The local snapshot with this id.
    Local(String),
}

#[derive(Clone)]
pub struct Scheduler {
    services: Services,
    connectivity: Connectivity,
    schedule: Arc<RwLock<Arc<Schedule>>>,
    schedule_gate: Arc<Mutex<()>>,
    in_flight: Arc<[AtomicBool; 4]>,
    shutdown: CancellationToken,
}

impl Scheduler {
    /// Load the persisted schedule, creating it with defaults on first run.
    pub async fn open(services: Services, connectivity: Connectivity) -> Result<Self> {
        let store = services.store.clone();
        let schedule: Schedule = match load_record(store.as_ref(), keys::SCHEDULE_CONFIG).await? {
            Some(schedule) => schedule,
            None => {
                let schedule = Schedule::default();
                save_record(store.as_ref(), keys::SCHEDULE_CONFIG, &schedule).await?;
                info!("Created default schedule");
                schedule
            }
        };

        Ok(Self {
            services,
            connectivity,
            schedule: Arc::new(RwLock::new(Arc::new(schedule))),
            schedule_gate: Arc::new(Mutex::new(())),
            in_flight: Arc::new(Default::default()),
            shutdown: CancellationToken::new(),
        })
    }

    pub fn services(&self) -> &Services {
        &self.services
    }

    pub fn connectivity(&self) -> &Connectivity {
        &self.connectivity
    }

    pub async fn schedule(&self) -> Schedule {
        self.schedule.read().await.as_ref().clone()
    }

    /// Apply `change` to the schedule under its writer lock and persist it.
    pub async fn update_schedule(&self, change: impl FnOnce(&mut Schedule)) -> Result<Schedule> {
        let _gate = self.schedule_gate.lock().await;
        let mut updated = self.schedule.read().await.as_ref().clone();
        change(&mut updated);

        save_record(self.services.store.as_ref(), keys::SCHEDULE_CONFIG, &updated).await?;
        *self.schedule.write().await = Arc::new(updated.clone());
        Ok(updated)
    }

    fn try_acquire(&self, trigger: Trigger) -> Option<TriggerGuard> {
        let slot = trigger.slot();
        self.in_flight[slot]
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| TriggerGuard {
                flags: self.in_flight.clone(),
                slot,
            })
    }

    fn acquire(&self, trigger: Trigger) -> Result<TriggerGuard> {
        self.try_acquire(trigger)
            .ok_or_else(|| Error::InProgress(format!("{} already running", trigger)))
    }

    // Manual triggers

    /// Take a backup now, record its version and validate it.
    pub async fn trigger_backup(&self) -> Result<BackupHistoryEntry> {
        let _guard = self.acquire(Trigger::Backup)?;
        self.run_backup(&self.shutdown.child_token()).await
    }

    pub async fn trigger_sync(&self) -> Result<SyncState> {
        let _guard = self.acquire(Trigger::Sync)?;
        self.run_sync(&self.shutdown.child_token()).await
    }

    /// Validate the current snapshot and record the outcome.
    pub async fn trigger_validation(&self) -> Result<ValidationResult> {
        let _guard = self.acquire(Trigger::Validation)?;
        Ok(self.validate_once().await)
    }

    pub async fn trigger_drain(&self) -> Result<DrainReport> {
        let _guard = self.acquire(Trigger::Drain)?;
        self.run_drain(&self.shutdown.child_token()).await
    }

    /// Apply a mutation now if the remote is reachable and sync is healthy,
    /// otherwise queue it.
    ///
    /// A mutation on a collection that still has queued operations is queued
    /// behind them so replay keeps submission order.
    pub async fn submit(&self, op: OfflineOperation) -> Result<SubmitOutcome> {
        let queue = &self.services.queue;

        let behind_queued = queue.has_pending_for(&op.target_collection).await;
        if behind_queued {
            debug!(
                "{} has queued operations, queueing {}",
                op.target_collection, op.kind
            );
        }

        if !behind_queued
            && self.connectivity.is_online()
            && !self.services.coordinator.is_failed().await
        {
            match queue.apply_now(&op).await {
                Ok(()) => {
                    debug!("Applied {} on {} directly", op.kind, op.target_collection);
                    return Ok(SubmitOutcome::Applied);
                }
                Err(e) if e.is_recoverable() => {
                    warn!(
                        "Applying {} on {} failed, queueing: {}",
                        op.kind, op.target_collection, e
                    );
                }
                Err(e) => return Err(e),
            }
        }

        let queued = queue.enqueue(op).await?;
        Ok(SubmitOutcome::Queued(queued.id))
    }

    /// Restore from the remote, falling back to the local snapshot when the
    /// remote is unreachable.
    pub async fn restore(&self) -> Result<RestoreSource> {
        match self.services.coordinator.restore_from_remote().await {
            Ok(meta) => Ok(RestoreSource::Remote(meta)),
            Err(Error::TransportUnreachable(reason)) => {
                warn!("Remote unreachable ({}), restoring local snapshot", reason);
                self.restore_local().await.map(RestoreSource::Local)
            }
            Err(e) => Err(e),
        }
    }

    /// Re-apply the current local snapshot and record the restore.
    pub async fn restore_local(&self) -> Result<String> {
        let snapshots = &self.services.snapshots;
        let snapshot = snapshots.get_snapshot().await?;
        self.services
            .ledger
            .restore_and_record(&snapshot, VersionOrigin::Local)
            .await?;

        self.services
            .notifier
            .notify(EventKind::SnapshotRestored, &snapshot.id);
        Ok(snapshot.id.clone())
    }

    /// Revert to a recorded version.
    pub async fn revert(&self, version_id: &str) -> Result<VersionRecord> {
        let record = self.services.ledger.revert_to(version_id).await?;
        self.services.notifier.notify(
            EventKind::VersionReverted,
            &format!("{} ({})", version_id, record.delta),
        );
        Ok(record)
    }

    // Work items

    async fn run_backup(&self, cancel: &CancellationToken) -> Result<BackupHistoryEntry> {
        let entry = self.backup_once(cancel).await?;
        match self.try_acquire(Trigger::Validation) {
            Some(_validation) => {
                self.validate_once().await;
            }
            None => debug!("Validation already running, status left pending"),
        }
        Ok(entry)
    }

    async fn backup_once(&self, cancel: &CancellationToken) -> Result<BackupHistoryEntry> {
        let snapshots = &self.services.snapshots;
        let before = snapshots.get_snapshot().await.ok();

        let entry = match snapshots.create_snapshot_cancellable(cancel).await {
            Ok(entry) => entry,
            Err(e) => {
                if !matches!(e, Error::Cancelled(_)) {
                    self.services
                        .notifier
                        .notify(EventKind::BackupFailed, &e.to_string());
                }
                return Err(e);
            }
        };

        let after = snapshots.get_snapshot().await?;
        let delta = Delta::between(before.as_ref().map(|s| &s.payload), &after.payload);
        if let Err(e) = self.services.ledger.record_version(delta).await {
            warn!("Backup {} taken but no version recorded: {}", after.id, e);
        }

        let now = Utc::now();
        if let Err(e) = self
            .update_schedule(|s| {
                s.last_backup_at = Some(now);
                s.validation_status = ValidationStatus::Pending;
            })
            .await
        {
            error!("Failed to update schedule after backup: {}", e);
        }

        self.services
            .notifier
            .notify(EventKind::BackupCreated, &after.id);
        Ok(entry)
    }

    async fn validate_once(&self) -> ValidationResult {
        let result = self
            .services
            .validator
            .validate_current(&self.services.snapshots)
            .await;

        let status = if result.is_valid {
            ValidationStatus::Valid
        } else {
            ValidationStatus::Invalid
        };
        let now = Utc::now();
        if let Err(e) = self
            .update_schedule(|s| {
                s.last_validation_at = Some(now);
                s.validation_status = status;
            })
            .await
        {
            error!("Failed to record validation status: {}", e);
        }

        if result.is_valid {
            self.services.notifier.notify(
                EventKind::ValidationPassed,
                &format!("{} warnings", result.warnings.len()),
            );
        } else {
            let detail: Vec<&str> = result.errors.iter().map(|e| e.message.as_str()).collect();
            self.services
                .notifier
                .notify(EventKind::ValidationFailed, &detail.join("; "));
        }
        result
    }

    /// Daily validation; an invalid snapshot gets one corrective backup.
    async fn scheduled_validation(&self, cancel: &CancellationToken) {
        if self.validate_once().await.is_valid {
            return;
        }

        let Some(_backup) = self.try_acquire(Trigger::Backup) else {
            info!("Snapshot invalid but a backup is already running");
            return;
        };
        warn!("Snapshot invalid, taking corrective backup");
        match self.backup_once(cancel).await {
            Ok(_) => {
                self.validate_once().await;
            }
            Err(e) => error!("Corrective backup failed: {}", e),
        }
    }

    async fn run_sync(&self, cancel: &CancellationToken) -> Result<SyncState> {
        let state = self.services.coordinator.sync_cancellable(cancel).await?;

        let now = Utc::now();
        if let Err(e) = self.update_schedule(|s| s.last_sync_at = Some(now)).await {
            error!("Failed to update schedule after sync: {}", e);
        }
        Ok(state)
    }

    async fn run_drain(&self, cancel: &CancellationToken) -> Result<DrainReport> {
        let report = self.services.queue.drain_cancellable(cancel).await?;

        for id in &report.failed {
            self.services.notifier.notify(EventKind::OperationFailed, id);
        }

        if report.applied_any() {
            match self.try_acquire(Trigger::Backup) {
                Some(_backup) => self.snapshot_after_drain(&report, cancel).await,
                None => info!("Backup already running, post-drain snapshot skipped"),
            }
        }
        Ok(report)
    }

    async fn snapshot_after_drain(&self, report: &DrainReport, cancel: &CancellationToken) {
        if let Err(e) = self
            .services
            .snapshots
            .create_snapshot_cancellable(cancel)
            .await
        {
            warn!("Post-drain snapshot failed: {}", e);
            return;
        }
        if let Err(e) = self.services.ledger.record_version(report.delta()).await {
            warn!("Post-drain version not recorded: {}", e);
        }
    }

    // Loop

    /// Start `trigger`'s work in its own task unless it is already running.
    ///
    /// Returns `None` when the tick was skipped.
    pub fn spawn_trigger(&self, trigger: Trigger) -> Option<JoinHandle<()>> {
        if trigger == Trigger::Drain && !self.connectivity.is_online() {
            debug!("Offline, drain tick skipped");
            return None;
        }
        let Some(guard) = self.try_acquire(trigger) else {
            debug!("{} still running, tick skipped", trigger);
            return None;
        };

        let this = self.clone();
        let cancel = self.shutdown.child_token();
        Some(tokio::spawn(async move {
            let _guard = guard;
            this.run_scheduled(trigger, &cancel).await;
        }))
    }

    async fn run_scheduled(&self, trigger: Trigger, cancel: &CancellationToken) {
        match trigger {
            Trigger::Backup => {
                if !self.schedule().await.backup_due(Utc::now()) {
                    debug!("No backup due");
                    return;
                }
                if let Err(e) = self.run_backup(cancel).await {
                    error!("Scheduled backup failed: {}", e);
                }
            }
            Trigger::Sync => match self.run_sync(cancel).await {
                Ok(state) => debug!("Scheduled sync finished: {}", state.status),
                Err(e) => warn!("Scheduled sync skipped: {}", e),
            },
            Trigger::Validation => self.scheduled_validation(cancel).await,
            Trigger::Drain => {
                if let Err(e) = self.run_drain(cancel).await {
                    error!("Scheduled drain failed: {}", e);
                }
            }
        }
    }

    /// Run the trigger loop until `shutdown` is called.
    pub async fn run(&self) {
        let cadence = &self.services.config.schedule;
        let mut backup = interval(cadence.backup_check());
        let mut sync = interval(cadence.sync_interval());
        let mut validation = interval(cadence.validation_interval());
        let mut drain = interval(cadence.drain_interval());
        for timer in [&mut backup, &mut sync, &mut validation, &mut drain] {
            timer.set_missed_tick_behavior(MissedTickBehavior::Skip);
        }

        let mut online = self.connectivity.subscribe();
        let mut was_online = *online.borrow_and_update();
        info!(
            "Scheduler started ({})",
            if was_online { "online" } else { "offline" }
        );

        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                _ = backup.tick() => {
                    self.spawn_trigger(Trigger::Backup);
                }
                _ = sync.tick() => {
                    self.spawn_trigger(Trigger::Sync);
                }
                _ = validation.tick() => {
                    self.spawn_trigger(Trigger::Validation);
                }
                _ = drain.tick() => {
                    self.spawn_trigger(Trigger::Drain);
                }
                Ok(()) = online.changed() => {
                    let now_online = *online.borrow_and_update();
                    if now_online && !was_online {
                        info!("Connectivity restored, draining offline queue");
                        self.spawn_trigger(Trigger::Drain);
                    } else if !now_online && was_online {
                        info!("Connectivity lost");
                    }
                    was_online = now_online;
                }
            }
        }

        info!("Scheduler stopped");
    }

    /// Stop the loop and cancel in-flight work at its next checkpoint.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DurabilityConfig;
    use crate::notify::RecordingNotifier;
    use crate::queue::{OfflineOperation, OperationKind};
    use crate::transport::MockTransport;
    use chrono::Duration;
    use fieldkeep_common::CollectionName;
    use fieldkeep_storage::{MemoryDataProvider, MemoryStore};
    use serde_json::json;

    fn name(raw: &str) -> CollectionName {
        CollectionName::new(raw).unwrap()
    }

    struct Fixture {
        provider: Arc<MemoryDataProvider>,
        transport: Arc<MockTransport>,
        notifier: Arc<RecordingNotifier>,
        scheduler: Scheduler,
    }

    async fn setup(online: bool) -> Fixture {
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
        let scheduler = Scheduler::open(services, Connectivity::new(online))
            .await
            .unwrap();

        Fixture {
            provider,
            transport,
            notifier,
            scheduler,
        }
    }

    fn favorite(id: &str) -> OfflineOperation {
        OfflineOperation::new(OperationKind::Create, name("favorites"), json!({"id": id}))
    }

    #[test]
    fn test_backup_due_uses_shortest_enabled_cadence() {
        let now = Utc::now();
        let mut schedule = Schedule::default();
        assert!(schedule.backup_due(now));

        schedule.last_backup_at = Some(now - Duration::hours(25));
        assert!(schedule.backup_due(now));

        schedule.backup_enabled.daily = false;
        assert!(!schedule.backup_due(now));
        assert_eq!(schedule.backup_interval(), Some(Duration::days(7)));

        schedule.backup_enabled = BackupCadence {
            daily: false,
            weekly: false,
            monthly: false,
        };
        assert!(!schedule.backup_due(now));
    }

    #[tokio::test]
    async fn test_manual_backup_records_version_and_validates() {
        let fx = setup(true).await;
        fx.provider.set_collection(name("favorites"), json!(["aphid"]));

        fx.scheduler.trigger_backup().await.unwrap();

        let services = fx.scheduler.services();
        let versions = services.ledger.get_history(10).await;
        assert_eq!(versions.len(), 1);
        assert!(versions[0].delta.added.contains(&name("favorites")));

        let schedule = fx.scheduler.schedule().await;
        assert!(schedule.last_backup_at.is_some());
        assert_eq!(schedule.validation_status, ValidationStatus::Valid);
        assert_eq!(fx.notifier.count(EventKind::BackupCreated), 1);
        assert_eq!(fx.notifier.count(EventKind::ValidationPassed), 1);
    }

    #[tokio::test]
    async fn test_manual_backup_failure_propagates() {
        let fx = setup(true).await;
        fx.provider.set_fail_reads(true);

        let result = fx.scheduler.trigger_backup().await;

        assert!(matches!(result, Err(Error::ProviderUnavailable(_))));
        assert_eq!(fx.notifier.count(EventKind::BackupFailed), 1);
        let history = fx.scheduler.services().snapshots.get_history(10).await;
        assert_eq!(history.len(), 1);
        assert!(!history[0].is_success());
    }

    #[tokio::test]
    async fn test_in_flight_trigger_is_exclusive() {
        let fx = setup(true).await;
        let _held = fx.scheduler.try_acquire(Trigger::Backup).unwrap();

        assert!(matches!(
            fx.scheduler.trigger_backup().await,
            Err(Error::InProgress(_))
        ));
        assert!(fx.scheduler.spawn_trigger(Trigger::Backup).is_none());
        assert!(fx.scheduler.try_acquire(Trigger::Sync).is_some());
    }

    #[tokio::test]
    async fn test_guard_released_on_drop() {
        let fx = setup(true).await;
        drop(fx.scheduler.try_acquire(Trigger::Drain).unwrap());
        assert!(fx.scheduler.try_acquire(Trigger::Drain).is_some());
    }

    #[tokio::test]
    async fn test_scheduled_validation_takes_corrective_backup() {
        let fx = setup(true).await;

        let handle = fx.scheduler.spawn_trigger(Trigger::Validation).unwrap();
        handle.await.unwrap();

        let services = fx.scheduler.services();
        assert!(services.snapshots.get_snapshot().await.is_ok());
        assert_eq!(fx.notifier.count(EventKind::ValidationFailed), 1);
        assert_eq!(
            fx.scheduler.schedule().await.validation_status,
            ValidationStatus::Valid
        );
    }

    #[tokio::test]
    async fn test_scheduled_failures_are_swallowed() {
        let fx = setup(true).await;
        fx.provider.set_fail_reads(true);

        let handle = fx.scheduler.spawn_trigger(Trigger::Backup).unwrap();
        handle.await.unwrap();
        let handle = fx.scheduler.spawn_trigger(Trigger::Sync).unwrap();
        handle.await.unwrap();

        assert_eq!(fx.notifier.count(EventKind::BackupFailed), 1);
        assert!(fx.scheduler.try_acquire(Trigger::Backup).is_some());
    }

    #[tokio::test]
    async fn test_submit_online_applies_directly() {
        let fx = setup(true).await;
        let outcome = fx.scheduler.submit(favorite("aphid")).await.unwrap();

        assert_eq!(outcome, SubmitOutcome::Applied);
        assert_eq!(fx.provider.payload()[&name("favorites")], json!([{"id": "aphid"}]));
        assert!(fx.scheduler.services().queue.is_empty().await);
    }

    #[tokio::test]
    async fn test_submit_queues_when_offline_or_sync_failed() {
        let fx = setup(false).await;
        assert!(matches!(
            fx.scheduler.submit(favorite("aphid")).await.unwrap(),
            SubmitOutcome::Queued(_)
        ));

        fx.scheduler.connectivity().set_online(true);
        fx.scheduler.trigger_drain().await.unwrap();
        assert!(fx.scheduler.services().queue.is_empty().await);
        fx.scheduler.trigger_backup().await.unwrap();
        fx.transport.fail_next(1);
        fx.scheduler.trigger_sync().await.unwrap();
        assert!(matches!(
            fx.scheduler.submit(favorite("thrips")).await.unwrap(),
            SubmitOutcome::Queued(_)
        ));

        fx.provider.set_fail_writes(true);
        fx.transport.fail_next(0);
        fx.scheduler.trigger_sync().await.unwrap();
        let pest = OfflineOperation::new(OperationKind::Create, name("pests"), json!({"id": "mite"}));
        assert!(matches!(
            fx.scheduler.submit(pest).await.unwrap(),
            SubmitOutcome::Queued(_)
        ));
        assert_eq!(fx.scheduler.services().queue.len().await, 2);
    }

    #[tokio::test]
    async fn test_submit_queues_behind_pending_operations() {
        let fx = setup(false).await;
        fx.scheduler.submit(favorite("aphid")).await.unwrap();
        fx.scheduler.connectivity().set_online(true);

        let delete =
            OfflineOperation::new(OperationKind::Delete, name("favorites"), json!({"id": "aphid"}));
        assert!(matches!(
            fx.scheduler.submit(delete).await.unwrap(),
            SubmitOutcome::Queued(_)
        ));
        assert_eq!(fx.provider.payload()[&name("favorites")], json!([]));

        // Other collections are not held back
        let pest = OfflineOperation::new(OperationKind::Create, name("pests"), json!({"id": "mite"}));
        assert_eq!(
            fx.scheduler.submit(pest).await.unwrap(),
            SubmitOutcome::Applied
        );

        fx.scheduler.trigger_drain().await.unwrap();

        assert!(fx.scheduler.services().queue.is_empty().await);
        assert_eq!(fx.provider.payload()[&name("favorites")], json!([]));
        assert_eq!(
            fx.provider.payload()[&name("pests")],
            json!({"mite": {"id": "mite"}})
        );
    }

    #[tokio::test]
    async fn test_backup_skips_validation_already_running() {
        let fx = setup(true).await;
        let held = fx.scheduler.try_acquire(Trigger::Validation).unwrap();

        fx.scheduler.trigger_backup().await.unwrap();

        let schedule = fx.scheduler.schedule().await;
        assert_eq!(schedule.validation_status, ValidationStatus::Pending);
        assert!(schedule.last_validation_at.is_none());
        assert_eq!(fx.notifier.count(EventKind::ValidationPassed), 0);

        drop(held);
        fx.scheduler.trigger_backup().await.unwrap();
        assert_eq!(
            fx.scheduler.schedule().await.validation_status,
            ValidationStatus::Valid
        );
    }

    #[tokio::test]
    async fn test_drain_snapshots_applied_changes() {
        let fx = setup(false).await;
        fx.scheduler.submit(favorite("aphid")).await.unwrap();

        let report = fx.scheduler.trigger_drain().await.unwrap();

        assert_eq!(report.applied.len(), 1);
        let services = fx.scheduler.services();
        let snapshot = services.snapshots.get_snapshot().await.unwrap();
        assert_eq!(snapshot.payload[&name("favorites")], json!([{"id": "aphid"}]));
        let versions = services.ledger.get_history(1).await;
        assert!(versions[0].delta.added.contains(&name("favorites")));
    }

    #[tokio::test]
    async fn test_drain_tick_skipped_offline() {
        let fx = setup(false).await;
        assert!(fx.scheduler.spawn_trigger(Trigger::Drain).is_none());
    }

    #[tokio::test]
    async fn test_restore_falls_back_to_local_snapshot() {
        let fx = setup(true).await;
        fx.provider.set_collection(name("favorites"), json!(["aphid"]));
        fx.scheduler.trigger_backup().await.unwrap();
        fx.provider.set_collection(name("favorites"), json!([]));
        fx.transport.fail_next(1);

        let source = fx.scheduler.restore().await.unwrap();

        assert!(matches!(source, RestoreSource::Local(_)));
        assert_eq!(fx.provider.payload()[&name("favorites")], json!(["aphid"]));
        let versions = fx.scheduler.services().ledger.get_history(1).await;
        assert_eq!(versions[0].origin, VersionOrigin::Local);
        assert_eq!(fx.notifier.count(EventKind::SnapshotRestored), 1);
    }

    #[tokio::test]
    async fn test_revert_notifies() {
        let fx = setup(true).await;
        fx.scheduler.trigger_backup().await.unwrap();
        let first = fx.scheduler.services().ledger.get_history(1).await[0].id.clone();

        let record = fx.scheduler.revert(&first).await.unwrap();

        assert_eq!(record.reverted_from, Some(first));
        assert_eq!(fx.notifier.count(EventKind::VersionReverted), 1);
    }

    #[tokio::test]
    async fn test_schedule_persists() {
        let fx = setup(true).await;
        fx.scheduler
            .update_schedule(|s| s.backup_enabled.monthly = false)
            .await
            .unwrap();

        let reopened = Scheduler::open(fx.scheduler.services().clone(), Connectivity::new(true))
            .await
            .unwrap();
        assert!(!reopened.schedule().await.backup_enabled.monthly);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconnect_drains_queue() {
        let fx = setup(false).await;
        fx.scheduler.submit(favorite("aphid")).await.unwrap();

        let runner = fx.scheduler.clone();
        let handle = tokio::spawn(async move { runner.run().await });

        tokio::time::sleep(std::time::Duration::from_secs(1)).await;
        assert_eq!(fx.scheduler.services().queue.len().await, 1);

        fx.scheduler.connectivity().set_online(true);
        tokio::time::sleep(std::time::Duration::from_secs(1)).await;

        assert!(fx.scheduler.services().queue.is_empty().await);
        assert_eq!(fx.provider.payload()[&name("favorites")], json!([{"id": "aphid"}]));

        fx.scheduler.shutdown();
        handle.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_loop_takes_first_backup() {
        let fx = setup(true).await;

        let runner = fx.scheduler.clone();
        let handle = tokio::spawn(async move { runner.run().await });
        tokio::time::sleep(std::time::Duration::from_secs(1)).await;

        let services = fx.scheduler.services();
        assert!(!services.snapshots.get_history(10).await.is_empty());
        assert!(fx.scheduler.schedule().await.last_backup_at.is_some());

        fx.scheduler.shutdown();
        handle.await.unwrap();
    }
}
