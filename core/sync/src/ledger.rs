//! Version ledger: a bounded, append-only list of version records.
//!
//! Every record keeps a full copy of the snapshot that was current when it was
//! written, so any record still in the ledger can be reverted to. Recording a
//! local change bumps a revision counter that sync staleness is derived from.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;
use tokio::sync::{watch, Mutex, RwLock};
use tracing::{debug, info, warn};
use uuid::Uuid;

use fieldkeep_common::{CollectionName, Error, Payload, Result};
use fieldkeep_storage::{keys, load_record, save_record, KeyValueStore};

use crate::config::VersionConfig;
use crate::conflict::{ConflictInfo, ConflictResolver, Side};
use crate::snapshot::{Snapshot, SnapshotStore};
use crate::transport::RemoteVersionMeta;

/// Sync status of a single version record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VersionSyncStatus {
    Pending,
    Synced,
    Failed,
}

/// Where a version originated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VersionOrigin {
    Local,
    Remote,
}

/// Collections that changed between two snapshots.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Delta {
    pub added: BTreeSet<CollectionName>,
    pub removed: BTreeSet<CollectionName>,
    pub updated: BTreeSet<CollectionName>,
}

impl Delta {
    pub fn new() -> Self {
        Self::default()
    }

    /// A delta that only adds the given collections.
    pub fn added(names: impl IntoIterator<Item = CollectionName>) -> Self {
        Self {
            added: names.into_iter().collect(),
            ..Self::default()
        }
    }

    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty() && self.updated.is_empty()
    }

    /// Derive the delta from `before` to `after`.
    ///
    /// An absent collection counts as empty. A collection that gains its
    /// first record is added, one that loses its last record is removed, and
    /// any other change is an update.
    pub fn between(before: Option<&Payload>, after: &Payload) -> Self {
        let empty = Payload::new();
        let before = before.unwrap_or(&empty);

        let mut delta = Self::new();
        let names: BTreeSet<&CollectionName> = before.keys().chain(after.keys()).collect();
        for name in names {
            let old = before.get(name);
            let new = after.get(name);
            let was_empty = old.map_or(true, is_empty_collection);
            let is_empty = new.map_or(true, is_empty_collection);

            match (was_empty, is_empty) {
                (true, false) => {
                    delta.added.insert(name.clone());
                }
                (false, true) => {
                    delta.removed.insert(name.clone());
                }
                (false, false) if old != new => {
                    delta.updated.insert(name.clone());
                }
                _ => {}
            }
        }
        delta
    }
}

fn is_empty_collection(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::Array(items) => items.is_empty(),
        Value::Object(map) => map.is_empty(),
        _ => false,
    }
}

impl fmt::Display for Delta {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_empty() {
            return f.write_str("no changes");
        }
        let parts: Vec<String> = self
            .added
            .iter()
            .map(|n| format!("+{}", n))
            .chain(self.updated.iter().map(|n| format!("~{}", n)))
            .chain(self.removed.iter().map(|n| format!("-{}", n)))
            .collect();
        f.write_str(&parts.join(" "))
    }
}

/// One entry of the version history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VersionRecord {
    pub id: String,
    pub timestamp: DateTime<Utc>,
    pub schema_version: String,
    /// Changes relative to the snapshot in force before this record.
    pub delta: Delta,
    pub sync_status: VersionSyncStatus,
    pub origin: VersionOrigin,
    /// Snapshot this record describes (a remote id for remote records).
    pub snapshot_id: String,
    /// Lost a last-writer-wins reconcile.
    #[serde(default)]
    pub superseded: bool,
    /// Version this record reverted to, if it describes a revert.
    #[serde(default)]
    pub reverted_from: Option<String>,
}

impl VersionRecord {
    fn for_snapshot(snapshot: &Snapshot, delta: Delta, origin: VersionOrigin) -> Self {
        let sync_status = match origin {
            VersionOrigin::Local => VersionSyncStatus::Pending,
            VersionOrigin::Remote => VersionSyncStatus::Synced,
        };
        Self {
            id: Uuid::new_v4().to_string(),
            timestamp: Utc::now(),
            schema_version: snapshot.schema_version.clone(),
            delta,
            sync_status,
            origin,
            snapshot_id: snapshot.id.clone(),
            superseded: false,
            reverted_from: None,
        }
    }

    fn for_remote(remote: &RemoteVersionMeta) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            timestamp: remote.timestamp,
            schema_version: remote.schema_version.clone(),
            delta: Delta::new(),
            sync_status: VersionSyncStatus::Synced,
            origin: VersionOrigin::Remote,
            snapshot_id: remote.remote_id.clone(),
            superseded: false,
            reverted_from: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct StoredVersion {
    record: VersionRecord,
    /// Remote records learned through reconcile carry no snapshot.
    snapshot: Option<Snapshot>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct LedgerRecord {
    revision: u64,
    versions: Vec<StoredVersion>,
}

/// Owner of the version history.
#[derive(Clone)]
pub struct VersionLedger {
    store: Arc<dyn KeyValueStore>,
    snapshots: SnapshotStore,
    config: VersionConfig,
    resolver: ConflictResolver,
    versions: Arc<RwLock<Arc<Vec<StoredVersion>>>>,
    write_gate: Arc<Mutex<()>>,
    revision: Arc<watch::Sender<u64>>,
}

impl VersionLedger {
    /// Open the ledger, loading any persisted history.
    pub async fn open(
        store: Arc<dyn KeyValueStore>,
        snapshots: SnapshotStore,
        config: VersionConfig,
    ) -> Result<Self> {
        let mut persisted: LedgerRecord = load_record(store.as_ref(), keys::VERSION_HISTORY)
            .await?
            .unwrap_or_default();
        persisted.versions.truncate(config.max_versions);

        debug!(
            "Opened version ledger: {} versions, revision {}",
            persisted.versions.len(),
            persisted.revision
        );

        let (revision, _) = watch::channel(persisted.revision);
        Ok(Self {
            store,
            snapshots,
            config,
            resolver: ConflictResolver::new(),
            versions: Arc::new(RwLock::new(Arc::new(persisted.versions))),
            write_gate: Arc::new(Mutex::new(())),
            revision: Arc::new(revision),
        })
    }

    /// Number of local changes ever recorded.
    pub fn revision(&self) -> u64 {
        *self.revision.borrow()
    }

    /// Watch the revision counter.
    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.revision.subscribe()
    }

    /// Record a local change against the current snapshot.
    ///
    /// # Errors
    /// - `NotFound` if no snapshot exists yet
    /// - `Storage` if the ledger cannot be persisted
    pub async fn record_version(&self, delta: Delta) -> Result<VersionRecord> {
        let _gate = self.write_gate.lock().await;

        let snapshot = self.snapshots.get_snapshot().await.map_err(|_| {
            Error::NotFound("No backup found; take a snapshot before recording a version".to_string())
        })?;

        let record = VersionRecord::for_snapshot(&snapshot, delta, VersionOrigin::Local);
        self.append(record.clone(), Some((*snapshot).clone()), true)
            .await?;

        info!("Recorded version {} ({})", record.id, record.delta);
        Ok(record)
    }

    /// Restore `snapshot` and record the restore as one step.
    ///
    /// Remote restores bring the device in line with the remote and do not
    /// make it stale; local restores are fresh local changes. If the record
    /// cannot be persisted the restore is rolled back.
    ///
    /// # Errors
    /// - Any error of `SnapshotStore::restore_snapshot`
    /// - `Storage` if the ledger cannot be persisted (nothing was restored)
    pub(crate) async fn restore_and_record(
        &self,
        snapshot: &Snapshot,
        origin: VersionOrigin,
    ) -> Result<VersionRecord> {
        let _gate = self.write_gate.lock().await;
        let record = self.restore_recorded(snapshot.clone(), origin, None).await?;

        info!("Recorded {:?} restore of snapshot {}", origin, snapshot.id);
        Ok(record)
    }

    /// Caller holds the write gate.
    async fn restore_recorded(
        &self,
        snapshot: Snapshot,
        origin: VersionOrigin,
        reverted_from: Option<String>,
    ) -> Result<VersionRecord> {
        let ledger = self.clone();
        let stored = snapshot.clone();
        self.snapshots
            .restore_then(&snapshot, move |before| async move {
                let delta = Delta::between(Some(&before), &stored.payload);
                let mut record = VersionRecord::for_snapshot(&stored, delta, origin);
                record.reverted_from = reverted_from;
                ledger
                    .append(record.clone(), Some(stored), origin == VersionOrigin::Local)
                    .await?;
                Ok::<_, Error>(record)
            })
            .await
    }

    /// Up to `limit` records, newest first.
    pub async fn get_history(&self, limit: usize) -> Vec<VersionRecord> {
        let versions = self.versions.read().await.clone();
        versions
            .iter()
            .take(limit)
            .map(|v| v.record.clone())
            .collect()
    }

    /// Look up a single record.
    pub async fn get_version(&self, id: &str) -> Result<VersionRecord> {
        let versions = self.versions.read().await.clone();
        versions
            .iter()
            .find(|v| v.record.id == id)
            .map(|v| v.record.clone())
            .ok_or_else(|| Error::NotFound(format!("Version {} not found", id)))
    }

    /// Newest local record that has not been superseded.
    pub async fn latest_local(&self) -> Option<VersionRecord> {
        let versions = self.versions.read().await.clone();
        versions
            .iter()
            .map(|v| &v.record)
            .find(|r| r.origin == VersionOrigin::Local && !r.superseded)
            .cloned()
    }

    /// Restore the snapshot stored with version `id` and record the revert.
    ///
    /// History is never rewritten: the revert is appended as a new local
    /// version.
    ///
    /// # Errors
    /// - `NotFound` if the version does not exist or carries no snapshot
    /// - Any error of `SnapshotStore::restore_snapshot`
    pub async fn revert_to(&self, id: &str) -> Result<VersionRecord> {
        let _gate = self.write_gate.lock().await;

        let target = {
            let versions = self.versions.read().await;
            versions
                .iter()
                .find(|v| v.record.id == id)
                .cloned()
                .ok_or_else(|| Error::NotFound(format!("Version {} not found", id)))?
        };
        let snapshot = target
            .snapshot
            .ok_or_else(|| Error::NotFound(format!("Version {} has no stored snapshot", id)))?;

        let record = self
            .restore_recorded(snapshot, VersionOrigin::Local, Some(id.to_string()))
            .await?;

        info!("Reverted to version {} as {}", id, record.id);
        Ok(record)
    }

    /// Resolve a divergence between a local record and the remote's copy.
    ///
    /// The later timestamp wins. The remote version is recorded either way
    /// and whichever side lost is marked superseded. Returns the
    /// authoritative record.
    pub async fn reconcile(
        &self,
        local: &VersionRecord,
        remote: &RemoteVersionMeta,
    ) -> Result<VersionRecord> {
        let _gate = self.write_gate.lock().await;

        let conflict = ConflictInfo::new(local, remote);
        let winner = self.resolver.resolve(&conflict);
        warn!(
            "Version conflict: local {} at {} vs remote {} at {}, keeping {:?}",
            conflict.local_id,
            conflict.local_timestamp,
            conflict.remote_id,
            conflict.remote_timestamp,
            winner
        );

        let mut remote_record = VersionRecord::for_remote(remote);
        remote_record.superseded = winner == Side::Local;

        let mut local_record = local.clone();
        local_record.superseded = winner == Side::Remote;

        let mut updated: Vec<StoredVersion> = self.versions.read().await.iter().cloned().collect();
        if let Some(entry) = updated.iter_mut().find(|v| v.record.id == local.id) {
            entry.record.superseded = local_record.superseded;
        }
        insert_newest_first(
            &mut updated,
            StoredVersion {
                record: remote_record.clone(),
                snapshot: None,
            },
        );
        updated.truncate(self.config.max_versions);
        self.persist(updated, false).await?;

        Ok(match winner {
            Side::Local => local_record,
            Side::Remote => remote_record,
        })
    }

    /// Mark local records up to `cutoff` as synced. Returns how many changed.
    pub async fn mark_synced(&self, cutoff: DateTime<Utc>) -> Result<usize> {
        self.set_sync_status(cutoff, VersionSyncStatus::Synced).await
    }

    /// Mark pending local records up to `cutoff` as failed.
    pub async fn mark_failed(&self, cutoff: DateTime<Utc>) -> Result<usize> {
        self.set_sync_status(cutoff, VersionSyncStatus::Failed).await
    }

    async fn set_sync_status(&self, cutoff: DateTime<Utc>, to: VersionSyncStatus) -> Result<usize> {
        let _gate = self.write_gate.lock().await;

        let mut changed = 0;
        let updated: Vec<StoredVersion> = self
            .versions
            .read()
            .await
            .iter()
            .cloned()
            .map(|mut v| {
                let record = &mut v.record;
                let eligible = record.origin == VersionOrigin::Local
                    && record.timestamp <= cutoff
                    && match to {
                        VersionSyncStatus::Synced => record.sync_status != VersionSyncStatus::Synced,
                        _ => record.sync_status == VersionSyncStatus::Pending,
                    };
                if eligible {
                    record.sync_status = to;
                    changed += 1;
                }
                v
            })
            .collect();

        if changed > 0 {
            self.persist(updated, false).await?;
            debug!("Marked {} versions {:?}", changed, to);
        }
        Ok(changed)
    }

    /// Insert by timestamp, truncate, persist. Caller holds the write gate.
    async fn append(
        &self,
        record: VersionRecord,
        snapshot: Option<Snapshot>,
        bump: bool,
    ) -> Result<()> {
        let mut updated: Vec<StoredVersion> = self.versions.read().await.iter().cloned().collect();
        insert_newest_first(&mut updated, StoredVersion { record, snapshot });
        updated.truncate(self.config.max_versions);
        self.persist(updated, bump).await
    }

    async fn persist(&self, versions: Vec<StoredVersion>, bump: bool) -> Result<()> {
        let revision = if bump { self.revision() + 1 } else { self.revision() };
        let record = LedgerRecord { revision, versions };

        save_record(self.store.as_ref(), keys::VERSION_HISTORY, &record).await?;

        *self.versions.write().await = Arc::new(record.versions);
        if bump {
            self.revision.send_replace(revision);
        }
        Ok(())
    }
}

/// Keep the history newest first; a new record goes ahead of equal
/// timestamps.
fn insert_newest_first(versions: &mut Vec<StoredVersion>, entry: StoredVersion) {
    let at = versions
        .iter()
        .position(|v| v.record.timestamp <= entry.record.timestamp)
        .unwrap_or(versions.len());
    versions.insert(at, entry);
}
