//! In-memory transport for tests and offline demos.

use async_trait::async_trait;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;
use tracing::debug;
use uuid::Uuid;

use fieldkeep_common::{Error, Result};

use super::{RemoteVersionMeta, Transport};
use crate::snapshot::Snapshot;

type RemoteCopy = (Snapshot, RemoteVersionMeta);

/// Transport that keeps the "remote" in memory.
///
/// Supports failure injection, artificial latency and a pinned remote whose
/// metadata differs from whatever was last pushed.
#[derive(Debug, Default)]
pub struct MockTransport {
    remote: Mutex<Option<RemoteCopy>>,
    pinned: Mutex<Option<RemoteCopy>>,
    fail_remaining: AtomicU32,
    latency: Mutex<Duration>,
    pushes: AtomicUsize,
}

impl MockTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `count` calls fail with `TransportUnreachable`.
    pub fn fail_next(&self, count: u32) {
        self.fail_remaining.store(count, Ordering::SeqCst);
    }

    /// Delay every call by `latency`.
    pub fn set_latency(&self, latency: Duration) {
        *self.latency.lock().unwrap_or_else(PoisonError::into_inner) = latency;
    }

    /// Make `pull` return this copy regardless of what gets pushed.
    pub fn pin_remote(&self, snapshot: Snapshot, meta: RemoteVersionMeta) {
        *self.pinned.lock().unwrap_or_else(PoisonError::into_inner) = Some((snapshot, meta));
    }

    /// Number of successful pushes.
    pub fn push_count(&self) -> usize {
        self.pushes.load(Ordering::SeqCst)
    }

    /// The last pushed copy.
    pub fn remote(&self) -> Option<RemoteCopy> {
        self.remote
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    async fn simulate_network(&self) -> Result<()> {
        let latency = *self.latency.lock().unwrap_or_else(PoisonError::into_inner);
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }

        let failing = self
            .fail_remaining
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(Error::TransportUnreachable(
                "simulated network failure".to_string(),
            ));
        }
        Ok(())
    }
}

#[async_trait]
impl Transport for MockTransport {
    fn name(&self) -> &str {
        "mock"
    }

    async fn push(&self, snapshot: &Snapshot) -> Result<String> {
        self.simulate_network().await?;

        let remote_id = format!("remote-{}", Uuid::new_v4());
        let meta = RemoteVersionMeta::for_snapshot(remote_id.clone(), snapshot);
        *self.remote.lock().unwrap_or_else(PoisonError::into_inner) =
            Some((snapshot.clone(), meta));
        self.pushes.fetch_add(1, Ordering::SeqCst);

        debug!("Mock push stored snapshot {} as {}", snapshot.id, remote_id);
        Ok(remote_id)
    }

    async fn pull(&self) -> Result<(Snapshot, RemoteVersionMeta)> {
        self.simulate_network().await?;

        if let Some(pinned) = self
            .pinned
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
        {
            return Ok(pinned);
        }

        self.remote()
            .ok_or_else(|| Error::NotFound("Remote holds no snapshot".to_string()))
    }
}
