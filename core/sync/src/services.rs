//! Process-wide service bundle.
//!
//! Every component is constructed once here and handed to the scheduler and
//! the CLI by value; all of them are cheap handles over shared state.

use std::sync::Arc;
use tracing::info;

use fieldkeep_common::Result;
use fieldkeep_storage::{DataProvider, KeyValueStore};

use crate::config::DurabilityConfig;
use crate::engine::SyncCoordinator;
use crate::ledger::VersionLedger;
use crate::notify::NotificationSink;
use crate::queue::{OfflineQueue, ProviderHandler};
use crate::snapshot::SnapshotStore;
use crate::transport::Transport;
use crate::validation::IntegrityValidator;

#[derive(Clone)]
pub struct Services {
    pub config: DurabilityConfig,
    pub store: Arc<dyn KeyValueStore>,
    pub snapshots: SnapshotStore,
    pub validator: IntegrityValidator,
    pub ledger: VersionLedger,
    pub coordinator: SyncCoordinator,
    pub queue: OfflineQueue,
    pub notifier: Arc<dyn NotificationSink>,
}

impl Services {
    /// Open every component over `store`.
    ///
    /// # Errors
    /// - `InvalidInput` if the configuration is unusable
    /// - Any error reading persisted state
    pub async fn open(
        config: DurabilityConfig,
        store: Arc<dyn KeyValueStore>,
        provider: Arc<dyn DataProvider>,
        transport: Arc<dyn Transport>,
        notifier: Arc<dyn NotificationSink>,
    ) -> Result<Self> {
        config.check()?;

        let snapshots =
            SnapshotStore::open(store.clone(), provider, config.backup.clone()).await?;
        let validator =
            IntegrityValidator::new(config.collections.clone(), config.validation.clone());
        let ledger =
            VersionLedger::open(store.clone(), snapshots.clone(), config.versions.clone()).await?;
        let coordinator = SyncCoordinator::open(
            store.clone(),
            snapshots.clone(),
            ledger.clone(),
            transport,
            notifier.clone(),
            config.sync.clone(),
        )
        .await?;
        let queue = OfflineQueue::open(store.clone(), config.queue.retry_config())
            .await?
            .with_default_handler(Arc::new(ProviderHandler::for_snapshots(&snapshots)));

        info!("Durability services opened on {}", store.name());

        Ok(Self {
            config,
            store,
            snapshots,
            validator,
            ledger,
            coordinator,
            queue,
            notifier,
        })
    }
}
