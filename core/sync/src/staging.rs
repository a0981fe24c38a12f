//! Staging for all-or-nothing snapshot restores.
//!
//! A restore is planned entirely in memory first: the provider's current
//! state is captured as a pre-image and the snapshot's collections are laid
//! over it. Only the fully built result is handed to the provider, in a single
//! write. If anything after that write fails, the pre-image is written back.

use tracing::{error, warn};

use fieldkeep_common::{CollectionName, Error, Payload, Result};
use fieldkeep_storage::{CollectionSpec, DataProvider};

use crate::snapshot::Snapshot;

/// A restore that has been staged but not yet written.
#[derive(Debug, Clone)]
pub struct RestorePlan {
    pre_image: Payload,
    staged: Payload,
    replaced: Vec<CollectionName>,
}

impl RestorePlan {
    /// Stage `snapshot` on top of `pre_image`.
    ///
    /// # Errors
    /// - `ValidationFailed` if the snapshot lacks a required collection or a
    ///   required collection has the wrong shape
    pub fn prepare(
        pre_image: Payload,
        snapshot: &Snapshot,
        required: &[CollectionSpec],
    ) -> Result<Self> {
        let mut defects = Vec::new();
        for spec in required {
            match snapshot.payload.get(&spec.name) {
                None => defects.push(format!("missing collection {}", spec.name)),
                Some(records) if !spec.shape.matches(records) => {
                    defects.push(format!("collection {} is not a {:?}", spec.name, spec.shape))
                }
                Some(_) => {}
            }
        }
        if !defects.is_empty() {
            return Err(Error::ValidationFailed(format!(
                "Snapshot {} cannot be restored: {}",
                snapshot.id,
                defects.join(", ")
            )));
        }

        let mut staged = pre_image.clone();
        let mut replaced = Vec::with_capacity(snapshot.payload.len());
        for (name, records) in &snapshot.payload {
            staged.insert(name.clone(), records.clone());
            replaced.push(name.clone());
        }

        Ok(Self {
            pre_image,
            staged,
            replaced,
        })
    }

    /// The provider state the restore will produce.
    pub fn staged(&self) -> &Payload {
        &self.staged
    }

    /// Collections overwritten by the restore.
    pub fn replaced(&self) -> &[CollectionName] {
        &self.replaced
    }

    /// Write the staged state in one step.
    ///
    /// On failure the pre-image is written back before the error is returned.
    pub async fn apply(self, provider: &dyn DataProvider) -> Result<AppliedRestore> {
        if let Err(e) = provider.write_all(self.staged).await {
            warn!("Staged restore write failed, rolling back: {}", e);
            restore_pre_image(provider, self.pre_image).await;
            return Err(as_provider_error(e));
        }

        Ok(AppliedRestore {
            pre_image: self.pre_image,
        })
    }
}

/// A restore that reached the provider and can still be undone.
#[derive(Debug)]
pub struct AppliedRestore {
    pre_image: Payload,
}

impl AppliedRestore {
    /// Put the provider back into its pre-restore state.
    pub async fn rollback(self, provider: &dyn DataProvider) {
        restore_pre_image(provider, self.pre_image).await;
    }
}

async fn restore_pre_image(provider: &dyn DataProvider, pre_image: Payload) {
    if let Err(e) = provider.write_all(pre_image).await {
        error!("Rollback of staged restore failed, provider state is unknown: {}", e);
    }
}

/// Normalize any provider failure to `ProviderUnavailable`.
pub(crate) fn as_provider_error(err: Error) -> Error {
    match err {
        Error::ProviderUnavailable(_) => err,
        other => Error::ProviderUnavailable(other.to_string()),
    }
}
