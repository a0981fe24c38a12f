//! Snapshot integrity validation.
//!
//! Every check runs on every call, so one result carries the full defect
//! list. Errors make a snapshot invalid; warnings never do.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::time::{Duration, Instant};
use tracing::debug;

use fieldkeep_common::{CollectionName, SchemaVersion};
use fieldkeep_storage::CollectionSpec;

use crate::config::ValidationConfig;
use crate::snapshot::{Snapshot, SnapshotStore};

/// Category of a validation finding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum IssueKind {
    /// There is no current snapshot.
    NoSnapshot,
    /// The snapshot bytes are not a JSON document.
    Unreadable,
    MissingTimestamp,
    InvalidTimestamp,
    MissingVersion,
    InvalidVersion,
    IncompatibleVersion,
    MissingPayload,
    MissingCollection,
    MalformedCollection,
    EmptyCollection,
    LargeCollection,
    OversizedSnapshot,
}

/// A single error or warning.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationIssue {
    pub kind: IssueKind,
    pub collection: Option<CollectionName>,
    pub message: String,
}

impl ValidationIssue {
    fn new(kind: IssueKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            collection: None,
            message: message.into(),
        }
    }

    fn for_collection(kind: IssueKind, collection: &CollectionName, message: impl Into<String>) -> Self {
        Self {
            kind,
            collection: Some(collection.clone()),
            message: message.into(),
        }
    }
}

/// Integrity flags for one required collection.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CollectionIntegrity {
    pub present: bool,
    pub well_formed: bool,
    /// Holds at least one record.
    pub populated: bool,
    pub record_count: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PerformanceMetrics {
    pub load_time_ms: u64,
    pub size_bytes: u64,
}

/// Outcome of validating one snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidationResult {
    pub is_valid: bool,
    pub errors: Vec<ValidationIssue>,
    pub warnings: Vec<ValidationIssue>,
    pub data_integrity: BTreeMap<CollectionName, CollectionIntegrity>,
    pub performance: PerformanceMetrics,
}

impl ValidationResult {
    fn new(size_bytes: u64, load_time: Duration) -> Self {
        Self {
            is_valid: true,
            errors: Vec::new(),
            warnings: Vec::new(),
            data_integrity: BTreeMap::new(),
            performance: PerformanceMetrics {
                load_time_ms: load_time.as_millis() as u64,
                size_bytes,
            },
        }
    }

    fn error(&mut self, issue: ValidationIssue) {
        self.errors.push(issue);
    }

    fn warn(&mut self, issue: ValidationIssue) {
        self.warnings.push(issue);
    }

    fn finish(mut self) -> Self {
        self.is_valid = self.errors.is_empty();
        self
    }

    /// Whether any error or warning has the given kind.
    pub fn has_issue(&self, kind: IssueKind) -> bool {
        self.errors.iter().chain(&self.warnings).any(|i| i.kind == kind)
    }
}

/// Structural and integrity checks over snapshots.
#[derive(Debug, Clone)]
pub struct IntegrityValidator {
    required: Vec<CollectionSpec>,
    config: ValidationConfig,
}

impl IntegrityValidator {
    pub fn new(required: Vec<CollectionSpec>, config: ValidationConfig) -> Self {
        Self { required, config }
    }

    /// Validate a snapshot value.
    pub fn validate(&self, snapshot: &Snapshot) -> ValidationResult {
        let start = Instant::now();
        match serde_json::to_vec(snapshot) {
            Ok(bytes) => self.validate_bytes_timed(&bytes, start),
            Err(e) => {
                let mut result = ValidationResult::new(0, start.elapsed());
                result.error(ValidationIssue::new(
                    IssueKind::Unreadable,
                    format!("Snapshot cannot be encoded: {}", e),
                ));
                result.finish()
            }
        }
    }

    /// Validate an encoded snapshot, as read from persistence.
    pub fn validate_bytes(&self, bytes: &[u8]) -> ValidationResult {
        self.validate_bytes_timed(bytes, Instant::now())
    }

    /// Validate the store's current snapshot, timing how long it takes to load.
    pub async fn validate_current(&self, snapshots: &SnapshotStore) -> ValidationResult {
        let start = Instant::now();
        let loaded = snapshots.get_snapshot().await;
        let load_time = start.elapsed();

        let mut result = match loaded {
            Ok(snapshot) => self.validate(&snapshot),
            Err(_) => {
                let mut result = ValidationResult::new(0, load_time);
                result.error(ValidationIssue::new(
                    IssueKind::NoSnapshot,
                    "No backup data found",
                ));
                result.finish()
            }
        };
        result.performance.load_time_ms = load_time.as_millis() as u64;
        result
    }

    fn validate_bytes_timed(&self, bytes: &[u8], start: Instant) -> ValidationResult {
        let size_bytes = bytes.len() as u64;

        let value: Value = match serde_json::from_slice(bytes) {
            Ok(value) => value,
            Err(e) => {
                let mut result = ValidationResult::new(size_bytes, start.elapsed());
                result.error(ValidationIssue::new(
                    IssueKind::Unreadable,
                    format!("Snapshot is not valid JSON: {}", e),
                ));
                self.check_size(&mut result);
                return result.finish();
            }
        };

        let mut result = ValidationResult::new(size_bytes, start.elapsed());
        self.check_timestamp(&value, &mut result);
        self.check_version(&value, &mut result);
        self.check_collections(&value, &mut result);
        self.check_size(&mut result);

        let result = result.finish();
        debug!(
            "Validated snapshot: valid={}, {} errors, {} warnings",
            result.is_valid,
            result.errors.len(),
            result.warnings.len()
        );
        result
    }

    fn check_timestamp(&self, value: &Value, result: &mut ValidationResult) {
        match value.get("timestamp") {
            None | Some(Value::Null) => {
                result.error(ValidationIssue::new(
                    IssueKind::MissingTimestamp,
                    "Missing timestamp in backup",
                ));
            }
            Some(Value::String(raw)) => {
                if DateTime::parse_from_rfc3339(raw).is_err() {
                    result.error(ValidationIssue::new(
                        IssueKind::InvalidTimestamp,
                        format!("Invalid timestamp in backup: {:?}", raw),
                    ));
                }
            }
            // Epoch milliseconds, as written by older clients
            Some(Value::Number(n)) => {
                let parsed = n.as_i64().and_then(DateTime::<Utc>::from_timestamp_millis);
                if parsed.is_none() {
                    result.error(ValidationIssue::new(
                        IssueKind::InvalidTimestamp,
                        format!("Invalid timestamp in backup: {}", n),
                    ));
                }
            }
            Some(other) => {
                result.error(ValidationIssue::new(
                    IssueKind::InvalidTimestamp,
                    format!("Invalid timestamp in backup: {}", other),
                ));
            }
        }
    }

    fn check_version(&self, value: &Value, result: &mut ValidationResult) {
        let raw = match value.get("schema_version") {
            None | Some(Value::Null) => None,
            Some(Value::String(s)) if s.trim().is_empty() => None,
            Some(Value::String(s)) => Some(s.as_str()),
            Some(other) => {
                result.error(ValidationIssue::new(
                    IssueKind::InvalidVersion,
                    format!("Version is not a string: {}", other),
                ));
                return;
            }
        };

        let Some(raw) = raw else {
            result.error(ValidationIssue::new(
                IssueKind::MissingVersion,
                "Missing version in backup",
            ));
            return;
        };

        match SchemaVersion::parse(raw) {
            Ok(version) if !version.is_compatible() => {
                result.error(ValidationIssue::new(
                    IssueKind::IncompatibleVersion,
                    format!(
                        "Schema version {} is not compatible with {}",
                        version,
                        SchemaVersion::CURRENT
                    ),
                ));
            }
            Ok(_) => {}
            Err(_) => {
                result.error(ValidationIssue::new(
                    IssueKind::InvalidVersion,
                    format!("Invalid version format: {:?}", raw),
                ));
            }
        }
    }

    fn check_collections(&self, value: &Value, result: &mut ValidationResult) {
        let payload = value.get("payload").and_then(Value::as_object);
        if payload.is_none() {
            result.error(ValidationIssue::new(
                IssueKind::MissingPayload,
                "Backup has no payload",
            ));
        }

        for spec in &self.required {
            let mut integrity = CollectionIntegrity::default();

            match payload.and_then(|p| p.get(spec.name.as_str())) {
                None => {
                    result.error(ValidationIssue::for_collection(
                        IssueKind::MissingCollection,
                        &spec.name,
                        format!("Missing {} in backup", spec.name),
                    ));
                }
                Some(records) => {
                    integrity.present = true;
                    match spec.shape.record_count(records) {
                        None => {
                            result.error(ValidationIssue::for_collection(
                                IssueKind::MalformedCollection,
                                &spec.name,
                                format!("Invalid {} format", spec.name),
                            ));
                        }
                        Some(count) => {
                            integrity.well_formed = true;
                            integrity.record_count = count;
                            integrity.populated = count > 0;

                            if count == 0 {
                                result.warn(ValidationIssue::for_collection(
                                    IssueKind::EmptyCollection,
                                    &spec.name,
                                    format!("No {} in backup", spec.name),
                                ));
                            } else if count > self.config.record_count_warning {
                                result.warn(ValidationIssue::for_collection(
                                    IssueKind::LargeCollection,
                                    &spec.name,
                                    format!(
                                        "Large number of {} (>{})",
                                        spec.name, self.config.record_count_warning
                                    ),
                                ));
                            }
                        }
                    }
                }
            }

            result.data_integrity.insert(spec.name.clone(), integrity);
        }
    }

    fn check_size(&self, result: &mut ValidationResult) {
        if result.performance.size_bytes > self.config.size_warning_bytes {
            let size = result.performance.size_bytes;
            result.warn(ValidationIssue::new(
                IssueKind::OversizedSnapshot,
                format!(
                    "Backup size is large ({} bytes > {})",
                    size, self.config.size_warning_bytes
                ),
            ));
        }
    }
}
