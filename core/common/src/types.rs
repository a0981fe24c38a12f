//! Common types used throughout fieldkeep.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Name of a data collection exposed by the data provider
/// (e.g. `favorites`, `pests`, `history`).
///
/// Collection names double as the entity classes recorded in version deltas.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CollectionName(String);

impl CollectionName {
    /// Create a new collection name.
    ///
    /// # Errors
    /// - Returns error if the name is empty or contains whitespace
    pub fn new(name: impl Into<String>) -> crate::Result<Self> {
        let name = name.into();
        if name.is_empty() {
            return Err(crate::Error::InvalidInput(
                "Collection name cannot be empty".to_string(),
            ));
        }
        if name.chars().any(char::is_whitespace) {
            return Err(crate::Error::InvalidInput(format!(
                "Collection name cannot contain whitespace: {:?}",
                name
            )));
        }
        Ok(Self(name))
    }

    /// Get the inner string value.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CollectionName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Snapshot payload: every named collection mapped to its records.
pub type Payload = BTreeMap<CollectionName, serde_json::Value>;

/// Parsed `MAJOR.MINOR.PATCH` schema version.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SchemaVersion {
    pub major: u32,
    pub minor: u32,
    pub patch: u32,
}

impl SchemaVersion {
    /// Schema version written by this build.
    pub const CURRENT: Self = Self {
        major: 1,
        minor: 0,
        patch: 0,
    };

    /// Parse a version string of exactly three numeric components.
    pub fn parse(raw: &str) -> crate::Result<Self> {
        let parts: Vec<&str> = raw.trim().split('.').collect();
        if parts.len() != 3 {
            return Err(crate::Error::InvalidInput(format!(
                "Schema version must have three components: {:?}",
                raw
            )));
        }

        let mut numbers = [0u32; 3];
        for (slot, part) in numbers.iter_mut().zip(&parts) {
            *slot = part.parse().map_err(|_| {
                crate::Error::InvalidInput(format!("Non-numeric schema version: {:?}", raw))
            })?;
        }

        Ok(Self {
            major: numbers[0],
            minor: numbers[1],
            patch: numbers[2],
        })
    }

    /// Check if data written at this version can be read by this build.
    pub fn is_compatible(&self) -> bool {
        self.major == Self::CURRENT.major
    }
}

impl Default for SchemaVersion {
    fn default() -> Self {
        Self::CURRENT
    }
}

impl fmt::Display for SchemaVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_collection_name_validation() {
        assert!(CollectionName::new("favorites").is_ok());
        assert!(CollectionName::new("").is_err());
        assert!(CollectionName::new("pest cache").is_err());
    }

    #[test]
    fn test_collection_name_serializes_as_plain_string() {
        let name = CollectionName::new("pests").unwrap();
        assert_eq!(serde_json::to_string(&name).unwrap(), "\"pests\"");

        let mut payload = Payload::new();
        payload.insert(name, serde_json::json!({}));
        let json = serde_json::to_string(&payload).unwrap();
        assert_eq!(json, r#"{"pests":{}}"#);
    }

    #[test]
    fn test_schema_version_parse() {
        let version = SchemaVersion::parse("1.2.3").unwrap();
        assert_eq!(version.major, 1);
        assert_eq!(version.minor, 2);
        assert_eq!(version.patch, 3);
        assert_eq!(version.to_string(), "1.2.3");

        assert!(SchemaVersion::parse("1.0").is_err());
        assert!(SchemaVersion::parse("1.x.0").is_err());
        assert!(SchemaVersion::parse("").is_err());
    }

    #[test]
    fn test_schema_version_compatibility() {
        assert!(SchemaVersion::parse("1.4.0").unwrap().is_compatible());
        assert!(!SchemaVersion::parse("2.0.0").unwrap().is_compatible());
    }

    proptest! {
        #[test]
        fn prop_parse_rejects_wrong_component_count(parts in proptest::collection::vec(0u32..1000, 0..6)) {
            let raw = parts.iter().map(u32::to_string).collect::<Vec<_>>().join(".");
            let parsed = SchemaVersion::parse(&raw);
            prop_assert_eq!(parsed.is_ok(), parts.len() == 3);
        }
    }
}
