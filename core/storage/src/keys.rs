//! Logical keys for persisted durability state.
//!
//! Each key holds one serialized record and is read and written on its own.

/// The current snapshot.
pub const BACKUP_CURRENT: &str = "backup.current";

/// Bounded backup history, newest first.
pub const BACKUP_HISTORY: &str = "backup.history";

/// Bounded version ledger, newest first.
pub const VERSION_HISTORY: &str = "version.history";

/// Sync state singleton.
pub const SYNC_STATE: &str = "sync.state";

/// Offline operation queue, FIFO order.
pub const OFFLINE_QUEUE: &str = "offline.queue";

/// Scheduler configuration and bookkeeping.
pub const SCHEDULE_CONFIG: &str = "schedule.config";

/// All keys owned by the durability core.
pub const ALL: [&str; 6] = [
    BACKUP_CURRENT,
    BACKUP_HISTORY,
    VERSION_HISTORY,
    SYNC_STATE,
    OFFLINE_QUEUE,
    SCHEDULE_CONFIG,
];
