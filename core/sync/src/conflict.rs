//! Conflict detection and resolution between local and remote versions.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::ledger::VersionRecord;
use crate::snapshot::Snapshot;
use crate::transport::RemoteVersionMeta;

/// Which copy a resolution kept.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Side {
    Local,
    Remote,
}

/// Information about a detected divergence.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConflictInfo {
    /// Local version record id.
    pub local_id: String,
    pub local_timestamp: DateTime<Utc>,
    /// Identifier the remote reports for its copy.
    pub remote_id: String,
    pub remote_timestamp: DateTime<Utc>,
    /// When the conflict was detected.
    pub detected_at: DateTime<Utc>,
}

impl ConflictInfo {
    pub fn new(local: &VersionRecord, remote: &RemoteVersionMeta) -> Self {
        Self {
            local_id: local.id.clone(),
            local_timestamp: local.timestamp,
            remote_id: remote.remote_id.clone(),
            remote_timestamp: remote.timestamp,
            detected_at: Utc::now(),
        }
    }

    /// Conflict for a device that has no version record yet.
    pub fn for_snapshot(local: &Snapshot, remote: &RemoteVersionMeta) -> Self {
        Self {
            local_id: local.id.clone(),
            local_timestamp: local.timestamp,
            remote_id: remote.remote_id.clone(),
            remote_timestamp: remote.timestamp,
            detected_at: Utc::now(),
        }
    }
}

/// Last-writer-wins resolver.
///
/// No merge of concurrent deltas is attempted. A timestamp tie keeps the
/// local copy.
#[derive(Debug, Clone, Copy, Default)]
pub struct ConflictResolver;

impl ConflictResolver {
    pub fn new() -> Self {
        Self
    }

    /// The remote diverges when it holds anything other than the copy this
    /// device last synced with.
    pub fn detect_conflict(&self, last_synced: Option<&str>, remote: &RemoteVersionMeta) -> bool {
        last_synced != Some(remote.remote_id.as_str())
    }

    /// Pick the authoritative side.
    pub fn resolve(&self, conflict: &ConflictInfo) -> Side {
        if conflict.remote_timestamp > conflict.local_timestamp {
            Side::Remote
        } else {
            Side::Local
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn conflict(local: DateTime<Utc>, remote: DateTime<Utc>) -> ConflictInfo {
        ConflictInfo {
            local_id: "local".into(),
            local_timestamp: local,
            remote_id: "remote".into(),
            remote_timestamp: remote,
            detected_at: Utc::now(),
        }
    }

    #[test]
    fn test_later_writer_wins() {
        let resolver = ConflictResolver::new();
        let t1 = Utc::now();
        let t2 = t1 + Duration::minutes(5);

        assert_eq!(resolver.resolve(&conflict(t1, t2)), Side::Remote);
        assert_eq!(resolver.resolve(&conflict(t2, t1)), Side::Local);
    }

    #[test]
    fn test_tie_keeps_local() {
        let now = Utc::now();
        assert_eq!(ConflictResolver::new().resolve(&conflict(now, now)), Side::Local);
    }

    #[test]
    fn test_detect_conflict() {
        let resolver = ConflictResolver::new();
        let meta = RemoteVersionMeta {
            remote_id: "remote-1".into(),
            timestamp: Utc::now(),
            schema_version: "1.0.0".into(),
        };
        assert!(!resolver.detect_conflict(Some("remote-1"), &meta));
        assert!(resolver.detect_conflict(Some("remote-2"), &meta));
        assert!(resolver.detect_conflict(None, &meta));
    }
}
