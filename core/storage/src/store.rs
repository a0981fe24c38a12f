//! Key-value persistence port.

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::error;

use fieldkeep_common::{Error, Result};

/// Key-value persistence for durability records.
///
/// Every key is independently readable and writable. Implementations must make
/// a single `put` all-or-nothing for that key, but nothing spans keys.
#[async_trait]
pub trait KeyValueStore: Send + Sync {
    /// Get the backend name (e.g., "memory", "local").
    fn name(&self) -> &str;

    /// Read the raw value stored under `key`.
    ///
    /// # Returns
    /// `None` when nothing has been written under the key.
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>>;

    /// Replace the value stored under `key`.
    ///
    /// # Postconditions
    /// - Readers see either the previous value or the new one, never a mix
    async fn put(&self, key: &str, value: Vec<u8>) -> Result<()>;

    /// Remove `key`. Removing an absent key is not an error.
    async fn remove(&self, key: &str) -> Result<()>;
}

/// Load and decode a JSON record.
///
/// A value that fails to decode is logged and reported as absent: there is no
/// other source of truth to recover it from.
///
/// # Errors
/// - The store itself failed to read
pub async fn load_record<T: DeserializeOwned>(
    store: &dyn KeyValueStore,
    key: &str,
) -> Result<Option<T>> {
    let Some(bytes) = store.get(key).await? else {
        return Ok(None);
    };

    match serde_json::from_slice(&bytes) {
        Ok(value) => Ok(Some(value)),
        Err(e) => {
            error!(
                "Persisted record {} in {} store is unreadable, treating as absent: {}",
                key,
                store.name(),
                e
            );
            Ok(None)
        }
    }
}

/// Encode and store a JSON record, returning the encoded size in bytes.
///
/// # Errors
/// - Serialization failed (nothing is written)
/// - The store failed to write
pub async fn save_record<T: Serialize + ?Sized>(
    store: &dyn KeyValueStore,
    key: &str,
    value: &T,
) -> Result<usize> {
    let bytes = serde_json::to_vec(value).map_err(|e| Error::Serialization(e.to_string()))?;
    let size = bytes.len();
    store.put(key, bytes).await?;
    Ok(size)
}
