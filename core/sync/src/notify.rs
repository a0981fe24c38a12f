//! Notification sink for surfacing outcomes to a user interface.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::{Mutex, PoisonError};
use tracing::{info, warn};

/// Kind of event surfaced to the user.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventKind {
    BackupCreated,
    BackupFailed,
    SnapshotRestored,
    VersionReverted,
    SyncCompleted,
    SyncFailed,
    ConflictResolved,
    ValidationPassed,
    ValidationFailed,
    OperationFailed,
}

impl EventKind {
    /// Whether this event reports something going wrong.
    pub fn is_failure(&self) -> bool {
        matches!(
            self,
            EventKind::BackupFailed
                | EventKind::SyncFailed
                | EventKind::ValidationFailed
                | EventKind::OperationFailed
        )
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Fire-and-forget receiver of user-facing events.
///
/// Implementations must not block and have no way to report failure back.
pub trait NotificationSink: Send + Sync {
    fn notify(&self, kind: EventKind, detail: &str);
}

/// Sink that writes events to the log.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogNotifier;

impl NotificationSink for LogNotifier {
    fn notify(&self, kind: EventKind, detail: &str) {
        if kind.is_failure() {
            warn!("[{}] {}", kind, detail);
        } else {
            info!("[{}] {}", kind, detail);
        }
    }
}

/// Sink that remembers every event, for tests.
#[derive(Debug, Default)]
pub struct RecordingNotifier {
    events: Mutex<Vec<(EventKind, String)>>,
}

impl RecordingNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    /// All events received so far, oldest first.
    pub fn events(&self) -> Vec<(EventKind, String)> {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Number of events of the given kind.
    pub fn count(&self, kind: EventKind) -> usize {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|(k, _)| *k == kind)
            .count()
    }
}

impl NotificationSink for RecordingNotifier {
    fn notify(&self, kind: EventKind, detail: &str) {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push((kind, detail.to_string()));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_recording_notifier() {
        let notifier = RecordingNotifier::new();
        notifier.notify(EventKind::SyncFailed, "offline");
        notifier.notify(EventKind::SyncCompleted, "remote-1");
        notifier.notify(EventKind::SyncFailed, "timeout");

        assert_eq!(notifier.count(EventKind::SyncFailed), 2);
        assert_eq!(notifier.events()[1], (EventKind::SyncCompleted, "remote-1".to_string()));
    }

    #[test]
    fn test_failure_classification() {
        assert!(EventKind::BackupFailed.is_failure());
        assert!(!EventKind::BackupCreated.is_failure());
    }
}
