//! Durability configuration.

use serde::{Deserialize, Serialize};
use std::time::Duration;

use fieldkeep_common::{CollectionName, Error, Result, SchemaVersion};
use fieldkeep_storage::{CollectionShape, CollectionSpec};

use crate::retry::RetryConfig;

/// Snapshot store settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BackupConfig {
    /// Maximum number of backup history entries kept.
    pub history_cap: usize,
    /// Schema version stamped on new snapshots.
    pub schema_version: String,
}

impl Default for BackupConfig {
    fn default() -> Self {
        Self {
            history_cap: 7,
            schema_version: SchemaVersion::CURRENT.to_string(),
        }
    }
}

/// Version ledger settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct VersionConfig {
    /// Maximum number of version records kept.
    pub max_versions: usize,
}

impl Default for VersionConfig {
    fn default() -> Self {
        Self { max_versions: 10 }
    }
}

/// Sync coordinator settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Upper bound for a single transport call.
    pub transport_timeout_secs: u64,
}

impl SyncConfig {
    pub fn transport_timeout(&self) -> Duration {
        Duration::from_secs(self.transport_timeout_secs)
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            transport_timeout_secs: 30,
        }
    }
}

/// Offline queue settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    /// Failed attempts after which an operation becomes terminal.
    pub max_retries: u32,
    /// Delay before the first retry.
    pub initial_delay_ms: u64,
    /// Cap for the exponential delay.
    pub max_delay_ms: u64,
    /// Multiplier applied per attempt.
    pub backoff_multiplier: f64,
    /// Whether to add jitter to delays.
    pub jitter: bool,
}

impl QueueConfig {
    /// Backoff policy derived from these settings.
    pub fn retry_config(&self) -> RetryConfig {
        RetryConfig::new(self.max_retries)
            .with_initial_delay(Duration::from_millis(self.initial_delay_ms))
            .with_max_delay(Duration::from_millis(self.max_delay_ms))
            .with_backoff_multiplier(self.backoff_multiplier)
            .with_jitter(self.jitter)
    }
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_delay_ms: 10_000,
            max_delay_ms: 300_000,
            backoff_multiplier: 2.0,
            jitter: true,
        }
    }
}

/// Integrity validator settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ValidationConfig {
    /// Snapshots larger than this produce a warning.
    pub size_warning_bytes: u64,
    /// Collections holding more records than this produce a warning.
    pub record_count_warning: usize,
}

impl Default for ValidationConfig {
    fn default() -> Self {
        Self {
            size_warning_bytes: 1_000_000,
            record_count_warning: 100,
        }
    }
}

/// Scheduler cadences.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ScheduleConfig {
    /// How often backup due-ness is checked.
    pub backup_check_secs: u64,
    /// Sync trigger period.
    pub sync_interval_secs: u64,
    /// Validation trigger period.
    pub validation_interval_secs: u64,
    /// Offline queue drain period.
    pub drain_interval_secs: u64,
}

impl ScheduleConfig {
    pub fn backup_check(&self) -> Duration {
        Duration::from_secs(self.backup_check_secs)
    }

    pub fn sync_interval(&self) -> Duration {
        Duration::from_secs(self.sync_interval_secs)
    }

    pub fn validation_interval(&self) -> Duration {
        Duration::from_secs(self.validation_interval_secs)
    }

    pub fn drain_interval(&self) -> Duration {
        Duration::from_secs(self.drain_interval_secs)
    }
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self {
            backup_check_secs: 60 * 60,
            sync_interval_secs: 4 * 60 * 60,
            validation_interval_secs: 24 * 60 * 60,
            drain_interval_secs: 5 * 60,
        }
    }
}

/// Top-level configuration for all durability components.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DurabilityConfig {
    pub backup: BackupConfig,
    pub versions: VersionConfig,
    pub sync: SyncConfig,
    pub queue: QueueConfig,
    pub validation: ValidationConfig,
    pub schedule: ScheduleConfig,
    /// Collections every snapshot must contain.
    pub collections: Vec<CollectionSpec>,
}

impl DurabilityConfig {
    /// Deserialize configuration from JSON. Missing fields take defaults.
    pub fn from_json(json: &str) -> Result<Self> {
        let config: Self =
            serde_json::from_str(json).map_err(|e| Error::Serialization(e.to_string()))?;
        config.check()?;
        Ok(config)
    }

    /// Serialize configuration to JSON.
    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string_pretty(self).map_err(|e| Error::Serialization(e.to_string()))
    }

    /// Reject settings the components cannot run with.
    pub fn check(&self) -> Result<()> {
        if self.backup.history_cap == 0 {
            return Err(Error::InvalidInput("backup.history_cap must be at least 1".into()));
        }
        if self.versions.max_versions == 0 {
            return Err(Error::InvalidInput("versions.max_versions must be at least 1".into()));
        }
        if self.queue.max_retries == 0 {
            return Err(Error::InvalidInput("queue.max_retries must be at least 1".into()));
        }
        SchemaVersion::parse(&self.backup.schema_version)?;

        let schedule = &self.schedule;
        for (name, secs) in [
            ("backup_check_secs", schedule.backup_check_secs),
            ("sync_interval_secs", schedule.sync_interval_secs),
            ("validation_interval_secs", schedule.validation_interval_secs),
            ("drain_interval_secs", schedule.drain_interval_secs),
        ] {
            if secs == 0 {
                return Err(Error::InvalidInput(format!("schedule.{} must be positive", name)));
            }
        }
        Ok(())
    }
}

impl Default for DurabilityConfig {
    fn default() -> Self {
        Self {
            backup: BackupConfig::default(),
            versions: VersionConfig::default(),
            sync: SyncConfig::default(),
            queue: QueueConfig::default(),
            validation: ValidationConfig::default(),
            schedule: ScheduleConfig::default(),
            collections: default_collections(),
        }
    }
}

/// Favorites, pest cache and detection history.
pub fn default_collections() -> Vec<CollectionSpec> {
    [
        ("favorites", CollectionShape::List),
        ("pests", CollectionShape::Map),
        ("history", CollectionShape::List),
    ]
    .into_iter()
    .filter_map(|(name, shape)| {
        CollectionName::new(name)
            .ok()
            .map(|name| CollectionSpec::new(name, shape))
    })
    .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = DurabilityConfig::default();
        assert_eq!(config.backup.history_cap, 7);
        assert_eq!(config.versions.max_versions, 10);
        assert_eq!(config.queue.max_retries, 3);
        assert_eq!(config.schedule.sync_interval(), Duration::from_secs(4 * 3600));
        assert_eq!(config.collections.len(), 3);
        assert!(config.check().is_ok());
    }

    #[test]
    fn test_partial_json_fills_defaults() {
        let config = DurabilityConfig::from_json(r#"{"backup": {"history_cap": 3}}"#).unwrap();
        assert_eq!(config.backup.history_cap, 3);
        assert_eq!(config.backup.schema_version, "1.0.0");
        assert_eq!(config.validation.size_warning_bytes, 1_000_000);
    }

    #[test]
    fn test_invalid_settings_rejected() {
        assert!(DurabilityConfig::from_json(r#"{"queue": {"max_retries": 0}}"#).is_err());
        assert!(DurabilityConfig::from_json(r#"{"backup": {"schema_version": "1.0"}}"#).is_err());
        assert!(DurabilityConfig::from_json(r#"{"schedule": {"drain_interval_secs": 0}}"#).is_err());
    }

    #[test]
    fn test_custom_collections() {
        let config = DurabilityConfig::from_json(
            r#"{"collections": [{"name": "notes", "shape": "list"}]}"#,
        )
        .unwrap();
        assert_eq!(config.collections.len(), 1);
        assert_eq!(config.collections[0].name.as_str(), "notes");
    }
}
