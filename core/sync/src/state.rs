//! Sync state tracking and persistence.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Sync status of the current snapshot against the remote.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncStatus {
    /// Local changes not yet confirmed by the remote.
    #[default]
    Pending,
    /// Remote holds the current snapshot.
    Synced,
    /// Last sync attempt failed.
    Failed,
}

impl fmt::Display for SyncStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SyncStatus::Pending => "pending",
            SyncStatus::Synced => "synced",
            SyncStatus::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// Singleton sync state, owned by the coordinator.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncState {
    /// Last successful sync time.
    pub last_sync_timestamp: Option<DateTime<Utc>>,
    /// Remote identifier of the last pushed snapshot.
    pub remote_snapshot_id: Option<String>,
    pub status: SyncStatus,
    /// Last error message if failed.
    pub last_error: Option<String>,
    /// Ledger revision the remote was last brought up to.
    #[serde(default)]
    pub synced_revision: u64,
}

impl SyncState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mark as awaiting a sync. Keeps the last error for display.
    pub fn mark_pending(&mut self) {
        self.status = SyncStatus::Pending;
    }

    /// Mark as synced up to `revision`.
    pub fn mark_synced(&mut self, remote_id: impl Into<String>, at: DateTime<Utc>, revision: u64) {
        self.status = SyncStatus::Synced;
        self.remote_snapshot_id = Some(remote_id.into());
        self.last_sync_timestamp = Some(at);
        self.synced_revision = revision;
        self.last_error = None;
    }

    /// Mark as failed.
    pub fn mark_failed(&mut self, error: impl Into<String>) {
        self.status = SyncStatus::Failed;
        self.last_error = Some(error.into());
    }

    /// A synced state is stale once the ledger has moved past what was pushed.
    pub fn is_stale(&self, revision: u64) -> bool {
        self.status == SyncStatus::Synced && revision > self.synced_revision
    }
}
