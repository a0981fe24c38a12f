//! Network transport port.
//!
//! The transport moves whole snapshots to and from the remote store. Every
//! call may fail with `TransportUnreachable`; callers bound calls with a
//! timeout of their own.

mod mock;
mod store;

pub use mock::MockTransport;
pub use store::StoreTransport;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use fieldkeep_common::Result;

use crate::snapshot::Snapshot;

/// What the remote reports about the snapshot it holds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteVersionMeta {
    /// Identifier the remote assigned on push.
    pub remote_id: String,
    /// Creation time of the remote snapshot.
    pub timestamp: DateTime<Utc>,
    pub schema_version: String,
}

impl RemoteVersionMeta {
    /// Metadata describing `snapshot` stored under `remote_id`.
    pub fn for_snapshot(remote_id: impl Into<String>, snapshot: &Snapshot) -> Self {
        Self {
            remote_id: remote_id.into(),
            timestamp: snapshot.timestamp,
            schema_version: snapshot.schema_version.clone(),
        }
    }
}

/// Bytes-over-wire access to the remote snapshot store.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Transport name, for logs.
    fn name(&self) -> &str;

    /// Upload a snapshot, returning the identifier the remote assigned.
    async fn push(&self, snapshot: &Snapshot) -> Result<String>;

    /// Download the remote snapshot and its metadata.
    ///
    /// # Errors
    /// - `NotFound` if the remote holds no snapshot
    /// - `TransportUnreachable` if the remote cannot be reached
    async fn pull(&self) -> Result<(Snapshot, RemoteVersionMeta)>;
}
