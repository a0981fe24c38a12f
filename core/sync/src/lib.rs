//! Fieldkeep durability core
//!
//! This module keeps the application's field data recoverable:
//! - Snapshots of every collection, with bounded backup history
//! - Integrity validation of the current snapshot
//! - A version ledger with deltas, reverts and remote reconciliation
//! - Push/pull sync with last-writer-wins conflict resolution
//! - An offline queue of mutations drained with retry and backoff
//! - A scheduler driving all of the above in the background

pub mod config;
pub mod conflict;
pub mod engine;
pub mod ledger;
pub mod notify;
pub mod queue;
pub mod retry;
pub mod scheduler;
pub mod services;
pub mod snapshot;
pub mod staging;
pub mod state;
pub mod transport;
pub mod validation;

// Re-export main types
pub use config::{
    default_collections, BackupConfig, DurabilityConfig, QueueConfig, ScheduleConfig, SyncConfig,
    ValidationConfig, VersionConfig,
};
pub use conflict::{ConflictInfo, ConflictResolver, Side};
pub use engine::SyncCoordinator;
pub use ledger::{Delta, VersionLedger, VersionOrigin, VersionRecord, VersionSyncStatus};
pub use notify::{EventKind, LogNotifier, NotificationSink, RecordingNotifier};
pub use queue::{
    DrainReport, OfflineOperation, OfflineQueue, OperationHandler, OperationKind,
    OperationStatus, ProviderHandler,
};
pub use retry::RetryConfig;
pub use scheduler::{
    BackupCadence, CadenceIntervals, Connectivity, RestoreSource, Schedule, Scheduler,
    SubmitOutcome, Trigger, ValidationStatus,
};
pub use services::Services;
pub use snapshot::{BackupHistoryEntry, BackupMetrics, BackupOutcome, Snapshot, SnapshotStore};
pub use staging::{AppliedRestore, RestorePlan};
pub use state::{SyncState, SyncStatus};
pub use transport::{MockTransport, RemoteVersionMeta, StoreTransport, Transport};
pub use validation::{
    CollectionIntegrity, IntegrityValidator, IssueKind, PerformanceMetrics, ValidationIssue,
    ValidationResult,
};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_module_exports() {
        let config = DurabilityConfig::default();
        assert!(config.check().is_ok());
        let _retry = RetryConfig::default();
        let _resolver = ConflictResolver::default();
        let _state = SyncState::new();
        assert_eq!(Schedule::default().validation_status, ValidationStatus::Pending);
    }
}
