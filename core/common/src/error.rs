//! Common error types for fieldkeep.

use thiserror::Error;

/// Top-level error type for durability and sync operations.
#[derive(Debug, Error)]
pub enum Error {
    /// No snapshot, version or operation exists under the requested identity.
    #[error("Not found: {0}")]
    NotFound(String),

    /// The data provider could not be read or written.
    #[error("Provider unavailable: {0}")]
    ProviderUnavailable(String),

    /// The network transport failed or timed out.
    #[error("Transport unreachable: {0}")]
    TransportUnreachable(String),

    /// Serialization or deserialization failed.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// A snapshot has a structural defect.
    #[error("Validation failed: {0}")]
    ValidationFailed(String),

    /// An offline operation exceeded its retry ceiling.
    #[error("Retry exhausted: {0}")]
    RetryExhausted(String),

    /// Local and remote versions diverged.
    #[error("Conflict detected: {0}")]
    ConflictDetected(String),

    /// Key-value persistence failed.
    #[error("Storage error: {0}")]
    Storage(String),

    /// I/O operation failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Invalid input provided.
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Another run of the same resource is already in flight.
    #[error("Already in progress: {0}")]
    InProgress(String),

    /// The operation was cancelled between steps.
    #[error("Cancelled: {0}")]
    Cancelled(String),
}

impl Error {
    /// Whether the failure is expected to clear up on a later cycle.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Error::ProviderUnavailable(_)
                | Error::TransportUnreachable(_)
                | Error::Storage(_)
                | Error::Io(_)
                | Error::InProgress(_)
                | Error::Cancelled(_)
        )
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Serialization(err.to_string())
    }
}

/// Result type alias using the common Error.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_recoverable_classification() {
        assert!(Error::ProviderUnavailable("down".into()).is_recoverable());
        assert!(Error::TransportUnreachable("offline".into()).is_recoverable());
        assert!(!Error::ValidationFailed("no version".into()).is_recoverable());
        assert!(!Error::RetryExhausted("op-1".into()).is_recoverable());
        assert!(!Error::NotFound("snapshot".into()).is_recoverable());
    }

    #[test]
    fn test_json_error_converts_to_serialization() {
        let err: Error = serde_json::from_str::<u32>("nope").unwrap_err().into();
        assert!(matches!(err, Error::Serialization(_)));
    }
}
