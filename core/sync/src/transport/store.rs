//! Transport backed by a key-value store standing in for the remote.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::debug;
use uuid::Uuid;

use fieldkeep_common::{Error, Result};
use fieldkeep_storage::{load_record, save_record, KeyValueStore};

use super::{RemoteVersionMeta, Transport};
use crate::snapshot::Snapshot;

const REMOTE_KEY: &str = "remote.current";

#[derive(Debug, Serialize, Deserialize)]
struct RemoteRecord {
    meta: RemoteVersionMeta,
    snapshot: Snapshot,
}

/// Pushes and pulls snapshots through any `KeyValueStore`.
///
/// Any failure of the underlying store is reported as `TransportUnreachable`.
pub struct StoreTransport {
    remote: Arc<dyn KeyValueStore>,
}

impl StoreTransport {
    pub fn new(remote: Arc<dyn KeyValueStore>) -> Self {
        Self { remote }
    }
}

fn unreachable(err: Error) -> Error {
    match err {
        Error::TransportUnreachable(_) => err,
        other => Error::TransportUnreachable(other.to_string()),
    }
}

#[async_trait]
impl Transport for StoreTransport {
    fn name(&self) -> &str {
        self.remote.name()
    }

    async fn push(&self, snapshot: &Snapshot) -> Result<String> {
        let remote_id = Uuid::new_v4().to_string();
        let record = RemoteRecord {
            meta: RemoteVersionMeta::for_snapshot(remote_id.clone(), snapshot),
            snapshot: snapshot.clone(),
        };

        let size = save_record(self.remote.as_ref(), REMOTE_KEY, &record)
            .await
            .map_err(unreachable)?;

        debug!("Pushed snapshot {} to {} ({} bytes)", snapshot.id, self.remote.name(), size);
        Ok(remote_id)
    }

    async fn pull(&self) -> Result<(Snapshot, RemoteVersionMeta)> {
        let record: Option<RemoteRecord> = load_record(self.remote.as_ref(), REMOTE_KEY)
            .await
            .map_err(unreachable)?;

        record
            .map(|r| (r.snapshot, r.meta))
            .ok_or_else(|| Error::NotFound("Remote holds no snapshot".to_string()))
    }
}
