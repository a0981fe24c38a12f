//! Point-in-time snapshots of application data and the backup history.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use fieldkeep_common::{Error, Payload, Result, SchemaVersion};
use fieldkeep_storage::{keys, load_record, save_record, DataProvider, KeyValueStore};

use crate::config::BackupConfig;
use crate::staging::{as_provider_error, RestorePlan};

/// Immutable point-in-time copy of the application's durable data.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    /// Unique snapshot identifier.
    pub id: String,
    /// When the snapshot was taken.
    pub timestamp: DateTime<Utc>,
    /// Schema version of the payload.
    pub schema_version: String,
    /// Every collection read from the data provider.
    pub payload: Payload,
}

impl Snapshot {
    /// Create a snapshot of `payload` taken now.
    pub fn new(payload: Payload, schema_version: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            timestamp: Utc::now(),
            schema_version: schema_version.into(),
            payload,
        }
    }

    /// Serialize to bytes for storage.
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        serde_json::to_vec(self).map_err(|e| Error::Serialization(e.to_string()))
    }

    /// Deserialize from bytes.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        serde_json::from_slice(bytes).map_err(|e| Error::Serialization(e.to_string()))
    }
}

/// Outcome of a backup attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackupOutcome {
    Success,
    Failed,
}

/// One line of the backup audit trail.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackupHistoryEntry {
    pub id: String,
    pub timestamp: DateTime<Utc>,
    /// Encoded snapshot size (0 for failed attempts).
    pub size_bytes: u64,
    pub schema_version: String,
    pub outcome: BackupOutcome,
    /// Snapshot written by this attempt.
    pub snapshot_id: Option<String>,
    pub error_detail: Option<String>,
}

impl BackupHistoryEntry {
    fn success(snapshot: &Snapshot, size_bytes: u64) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            timestamp: Utc::now(),
            size_bytes,
            schema_version: snapshot.schema_version.clone(),
            outcome: BackupOutcome::Success,
            snapshot_id: Some(snapshot.id.clone()),
            error_detail: None,
        }
    }

    fn failed(schema_version: &str, err: &Error) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            timestamp: Utc::now(),
            size_bytes: 0,
            schema_version: schema_version.to_string(),
            outcome: BackupOutcome::Failed,
            snapshot_id: None,
            error_detail: Some(err.to_string()),
        }
    }

    pub fn is_success(&self) -> bool {
        self.outcome == BackupOutcome::Success
    }
}

/// Aggregate view over the backup history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackupMetrics {
    pub total_backups: usize,
    pub successful_backups: usize,
    pub failed_backups: usize,
    pub last_backup_at: Option<DateTime<Utc>>,
    pub last_successful_backup_at: Option<DateTime<Utc>>,
    /// Sum of the recorded snapshot sizes.
    pub total_size_bytes: u64,
    /// Successful / total, 0.0 when there is no history.
    pub success_ratio: f64,
}

/// Owner of the current snapshot slot and the bounded backup history.
///
/// Writers are serialized by a gate and publish fully built values; readers
/// only ever see a complete snapshot.
#[derive(Clone)]
pub struct SnapshotStore {
    store: Arc<dyn KeyValueStore>,
    provider: Arc<dyn DataProvider>,
    config: BackupConfig,
    current: Arc<RwLock<Option<Arc<Snapshot>>>>,
    history: Arc<RwLock<Arc<Vec<BackupHistoryEntry>>>>,
    write_gate: Arc<Mutex<()>>,
}

impl SnapshotStore {
    /// Open the snapshot store, loading any persisted snapshot and history.
    ///
    /// # Errors
    /// - The key-value store could not be read
    pub async fn open(
        store: Arc<dyn KeyValueStore>,
        provider: Arc<dyn DataProvider>,
        config: BackupConfig,
    ) -> Result<Self> {
        let current: Option<Snapshot> = load_record(store.as_ref(), keys::BACKUP_CURRENT).await?;
        let mut history: Vec<BackupHistoryEntry> = load_record(store.as_ref(), keys::BACKUP_HISTORY)
            .await?
            .unwrap_or_default();
        history.truncate(config.history_cap);

        debug!(
            "Opened snapshot store: current={}, history={}",
            current.as_ref().map(|s| s.id.as_str()).unwrap_or("none"),
            history.len()
        );

        Ok(Self {
            store,
            provider,
            config,
            current: Arc::new(RwLock::new(current.map(Arc::new))),
            history: Arc::new(RwLock::new(Arc::new(history))),
            write_gate: Arc::new(Mutex::new(())),
        })
    }

    /// The data provider snapshots are taken from.
    pub fn provider(&self) -> &Arc<dyn DataProvider> {
        &self.provider
    }

    /// Take a new snapshot from the data provider.
    ///
    /// Failures still append a `failed` history entry.
    pub async fn create_snapshot(&self) -> Result<BackupHistoryEntry> {
        self.create_snapshot_cancellable(&CancellationToken::new())
            .await
    }

    /// Take a new snapshot, checking `cancel` between steps.
    ///
    /// # Errors
    /// - `ProviderUnavailable` if the data provider cannot be read
    /// - `Serialization` if the snapshot cannot be encoded
    /// - `Storage` if the snapshot cannot be persisted
    /// - `Cancelled` if cancelled before anything was written
    pub async fn create_snapshot_cancellable(
        &self,
        cancel: &CancellationToken,
    ) -> Result<BackupHistoryEntry> {
        let _gate = self.write_gate.lock().await;

        if cancel.is_cancelled() {
            return Err(Error::Cancelled("backup cancelled before start".to_string()));
        }

        match self.write_new_snapshot(cancel).await {
            Ok(entry) => {
                info!(
                    "Backup {} created ({} bytes)",
                    entry.snapshot_id.as_deref().unwrap_or("?"),
                    entry.size_bytes
                );
                self.append_history(entry.clone()).await;
                Ok(entry)
            }
            Err(Error::Cancelled(reason)) => Err(Error::Cancelled(reason)),
            Err(e) => {
                error!("Backup failed: {}", e);
                self.append_history(BackupHistoryEntry::failed(&self.config.schema_version, &e))
                    .await;
                Err(e)
            }
        }
    }

    async fn write_new_snapshot(&self, cancel: &CancellationToken) -> Result<BackupHistoryEntry> {
        let payload = self.provider.read_all().await.map_err(as_provider_error)?;

        if cancel.is_cancelled() {
            return Err(Error::Cancelled("backup cancelled after reading data".to_string()));
        }

        let snapshot = Snapshot::new(payload, self.config.schema_version.clone());
        let bytes = snapshot.to_bytes()?;
        let size = bytes.len() as u64;

        self.store.put(keys::BACKUP_CURRENT, bytes).await?;

        let entry = BackupHistoryEntry::success(&snapshot, size);
        *self.current.write().await = Some(Arc::new(snapshot));
        Ok(entry)
    }

    /// Insert at the front, then truncate to the cap.
    async fn append_history(&self, entry: BackupHistoryEntry) {
        let updated = {
            let history = self.history.read().await;
            let mut updated = Vec::with_capacity(history.len() + 1);
            updated.push(entry);
            updated.extend(history.iter().cloned());
            updated.truncate(self.config.history_cap);
            updated
        };

        if let Err(e) = save_record(self.store.as_ref(), keys::BACKUP_HISTORY, &updated).await {
            error!("Failed to persist backup history: {}", e);
        }
        *self.history.write().await = Arc::new(updated);
    }

    /// Get the current snapshot.
    ///
    /// # Errors
    /// - `NotFound` if no snapshot has been taken yet
    pub async fn get_snapshot(&self) -> Result<Arc<Snapshot>> {
        self.current
            .read()
            .await
            .clone()
            .ok_or_else(|| Error::NotFound("No backup found".to_string()))
    }

    /// Push a snapshot's payload back into the data provider and make it current.
    ///
    /// The write runs in its own task so that dropping the returned future
    /// cannot interrupt it: it either completes or is rolled back.
    ///
    /// # Errors
    /// - `ValidationFailed` if the snapshot lacks a required collection or has
    ///   an incompatible schema (nothing is written)
    /// - `ProviderUnavailable` if the provider could not be read or written
    /// - `Storage` if the snapshot could not be persisted as current (the
    ///   provider is rolled back)
    pub async fn restore_snapshot(&self, snapshot: &Snapshot) -> Result<()> {
        self.restore_then(snapshot, |_| async { Ok::<(), Error>(()) })
            .await
    }

    /// Restore `snapshot`, then run `commit` with the provider state it
    /// replaced, all under the write gate.
    ///
    /// If `commit` fails the provider and the current snapshot are put back
    /// and its error is returned, so a caller never sees an error after a
    /// restore took effect.
    pub(crate) async fn restore_then<T, F, Fut>(&self, snapshot: &Snapshot, commit: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(Payload) -> Fut + Send + 'static,
        Fut: Future<Output = Result<T>> + Send + 'static,
    {
        let this = self.clone();
        let snapshot = snapshot.clone();

        tokio::spawn(async move { this.restore_inner(snapshot, commit).await })
            .await
            .map_err(|e| Error::Storage(format!("Restore task failed: {}", e)))?
    }

    async fn restore_inner<T, F, Fut>(&self, snapshot: Snapshot, commit: F) -> Result<T>
    where
        F: FnOnce(Payload) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let version = SchemaVersion::parse(&snapshot.schema_version)
            .map_err(|e| Error::ValidationFailed(e.to_string()))?;
        if !version.is_compatible() {
            return Err(Error::ValidationFailed(format!(
                "Snapshot {} has incompatible schema version {}",
                snapshot.id, version
            )));
        }

        let _gate = self.write_gate.lock().await;

        let required = self.provider.required_collections();
        let pre_image = self.provider.read_all().await.map_err(as_provider_error)?;
        let plan = RestorePlan::prepare(pre_image.clone(), &snapshot, &required)?;
        let restored = plan.replaced().len();

        let applied = plan.apply(self.provider.as_ref()).await?;

        if let Err(e) = save_record(self.store.as_ref(), keys::BACKUP_CURRENT, &snapshot).await {
            warn!("Restored data but could not persist snapshot, rolling back: {}", e);
            applied.rollback(self.provider.as_ref()).await;
            return Err(e);
        }

        match commit(pre_image).await {
            Ok(value) => {
                info!("Restored snapshot {} ({} collections)", snapshot.id, restored);
                *self.current.write().await = Some(Arc::new(snapshot));
                Ok(value)
            }
            Err(e) => {
                warn!("Restore of {} not recorded, rolling back: {}", snapshot.id, e);
                self.reinstate_current().await;
                applied.rollback(self.provider.as_ref()).await;
                Err(e)
            }
        }
    }

    /// Write the published current snapshot back to the store.
    async fn reinstate_current(&self) {
        let previous = self.current.read().await.clone();
        let result = match previous {
            Some(previous) => {
                save_record(self.store.as_ref(), keys::BACKUP_CURRENT, previous.as_ref())
                    .await
                    .map(|_| ())
            }
            None => self.store.remove(keys::BACKUP_CURRENT).await,
        };
        if let Err(e) = result {
            error!("Failed to reinstate the previous snapshot: {}", e);
        }
    }

    /// Gate held by every writer of the provider.
    pub(crate) fn mutation_gate(&self) -> Arc<Mutex<()>> {
        self.write_gate.clone()
    }

    /// Clear the current snapshot and the history. Idempotent.
    pub async fn delete_snapshot(&self) -> Result<()> {
        let _gate = self.write_gate.lock().await;

        self.store.remove(keys::BACKUP_CURRENT).await?;
        self.store.remove(keys::BACKUP_HISTORY).await?;

        *self.current.write().await = None;
        *self.history.write().await = Arc::new(Vec::new());

        info!("Backup and history deleted");
        Ok(())
    }

    /// Up to `limit` history entries, newest first.
    pub async fn get_history(&self, limit: usize) -> Vec<BackupHistoryEntry> {
        let history = self.history.read().await.clone();
        history.iter().take(limit).cloned().collect()
    }

    /// Aggregate counts over the history.
    pub async fn get_metrics(&self) -> BackupMetrics {
        let history = self.history.read().await.clone();

        let total_backups = history.len();
        let successful_backups = history.iter().filter(|h| h.is_success()).count();
        let success_ratio = if total_backups == 0 {
            0.0
        } else {
            successful_backups as f64 / total_backups as f64
        };

        BackupMetrics {
            total_backups,
            successful_backups,
            failed_backups: total_backups - successful_backups,
            last_backup_at: history.first().map(|h| h.timestamp),
            last_successful_backup_at: history
                .iter()
                .find(|h| h.is_success())
                .map(|h| h.timestamp),
            total_size_bytes: history.iter().map(|h| h.size_bytes).sum(),
            success_ratio,
        }
    }
}
