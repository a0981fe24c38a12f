//! Local filesystem store and data provider.

use async_trait::async_trait;
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::debug;
use uuid::Uuid;

use crate::provider::{CollectionSpec, DataProvider};
use crate::store::KeyValueStore;
use fieldkeep_common::{Error, Payload, Result};

/// Write `data` next to `target` and rename it into place.
async fn replace_file(target: &Path, data: &[u8]) -> std::io::Result<()> {
    let file_name = target
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let tmp = target.with_file_name(format!(".{}.{}.tmp", file_name, Uuid::new_v4()));

    fs::write(&tmp, data).await?;
    if let Err(e) = fs::rename(&tmp, target).await {
        let _ = fs::remove_file(&tmp).await;
        return Err(e);
    }
    Ok(())
}

/// Local filesystem key-value store.
///
/// Stores each key as its own file in a directory. Writes go to a temporary
/// file first and are renamed over the old value.
pub struct LocalStore {
    root: PathBuf,
}

impl LocalStore {
    /// Create a new local store with the given root directory.
    ///
    /// # Postconditions
    /// - Root directory is created if it doesn't exist
    ///
    /// # Errors
    /// - Permission denied
    pub fn new(root: impl AsRef<Path>) -> Result<Self> {
        let root = root.as_ref().to_path_buf();

        if !root.exists() {
            std::fs::create_dir_all(&root)?;
        }

        Ok(Self { root })
    }

    /// Root directory of this store.
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn key_path(&self, key: &str) -> Result<PathBuf> {
        if key.is_empty() || key.contains('/') || key.contains('\\') || key.starts_with('.') {
            return Err(Error::InvalidInput(format!("Invalid store key: {:?}", key)));
        }
        Ok(self.root.join(format!("{}.json", key)))
    }
}

#[async_trait]
impl KeyValueStore for LocalStore {
    fn name(&self) -> &str {
        "local"
    }

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let path = self.key_path(key)?;
        match fs::read(&path).await {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(Error::Storage(format!("Failed to read {}: {}", key, e))),
        }
    }

    async fn put(&self, key: &str, value: Vec<u8>) -> Result<()> {
        let path = self.key_path(key)?;
        replace_file(&path, &value)
            .await
            .map_err(|e| Error::Storage(format!("Failed to write {}: {}", key, e)))?;
        debug!("Wrote {} ({} bytes)", key, value.len());
        Ok(())
    }

    async fn remove(&self, key: &str) -> Result<()> {
        let path = self.key_path(key)?;
        match fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(Error::Storage(format!("Failed to remove {}: {}", key, e))),
        }
    }
}

/// Data provider backed by a single JSON document on disk.
///
/// The document is an object mapping collection names to records. A missing
/// file reads as every required collection being empty.
pub struct JsonFileProvider {
    path: PathBuf,
    required: Vec<CollectionSpec>,
}

impl JsonFileProvider {
    /// Create a provider for the document at `path`.
    pub fn new(path: impl AsRef<Path>, required: Vec<CollectionSpec>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            required,
        }
    }

    /// Path of the backing document.
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn empty_payload(&self) -> Payload {
        self.required
            .iter()
            .map(|spec| (spec.name.clone(), spec.shape.empty()))
            .collect()
    }
}

#[async_trait]
impl DataProvider for JsonFileProvider {
    fn required_collections(&self) -> Vec<CollectionSpec> {
        self.required.clone()
    }

    async fn read_all(&self) -> Result<Payload> {
        let bytes = match fs::read(&self.path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Ok(self.empty_payload());
            }
            Err(e) => {
                return Err(Error::ProviderUnavailable(format!(
                    "Failed to read {}: {}",
                    self.path.display(),
                    e
                )));
            }
        };

        serde_json::from_slice(&bytes).map_err(|e| {
            Error::ProviderUnavailable(format!(
                "Application data at {} is unreadable: {}",
                self.path.display(),
                e
            ))
        })
    }

    async fn write_all(&self, payload: Payload) -> Result<()> {
        let bytes = serde_json::to_vec_pretty(&payload)?;

        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).await.map_err(|e| {
                    Error::ProviderUnavailable(format!("Failed to create data directory: {}", e))
                })?;
            }
        }

        replace_file(&self.path, &bytes).await.map_err(|e| {
            Error::ProviderUnavailable(format!("Failed to write {}: {}", self.path.display(), e))
        })
    }
}
