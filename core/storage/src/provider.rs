//! Data provider trait definition.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use fieldkeep_common::{CollectionName, Payload, Result};

/// Expected JSON shape of a collection's records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CollectionShape {
    /// A JSON array of records.
    List,
    /// A JSON object keyed by record id.
    Map,
}

impl CollectionShape {
    /// Check if a value has this shape.
    pub fn matches(&self, value: &serde_json::Value) -> bool {
        match self {
            CollectionShape::List => value.is_array(),
            CollectionShape::Map => value.is_object(),
        }
    }

    /// Number of records held by a value of this shape.
    pub fn record_count(&self, value: &serde_json::Value) -> Option<usize> {
        match self {
            CollectionShape::List => value.as_array().map(Vec::len),
            CollectionShape::Map => value.as_object().map(|m| m.len()),
        }
    }

    /// An empty value of this shape.
    pub fn empty(&self) -> serde_json::Value {
        match self {
            CollectionShape::List => serde_json::Value::Array(Vec::new()),
            CollectionShape::Map => serde_json::Value::Object(serde_json::Map::new()),
        }
    }
}

/// A collection the provider declares as required in every snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CollectionSpec {
    pub name: CollectionName,
    pub shape: CollectionShape,
}

impl CollectionSpec {
    /// Create a new collection spec.
    pub fn new(name: CollectionName, shape: CollectionShape) -> Self {
        Self { name, shape }
    }
}

/// Source of the application data that snapshots capture.
///
/// Implementations own the live favorites/detections/history state.
#[async_trait]
pub trait DataProvider: Send + Sync {
    /// Collections that every snapshot must contain.
    fn required_collections(&self) -> Vec<CollectionSpec>;

    /// Read the current state of every collection.
    ///
    /// # Errors
    /// - `ProviderUnavailable` if the state cannot be read
    async fn read_all(&self) -> Result<Payload>;

    /// Replace the state of every collection in one step.
    ///
    /// # Postconditions
    /// - Either every collection in `payload` is written or none is
    ///
    /// # Errors
    /// - `ProviderUnavailable` if the write failed (state is unchanged)
    async fn write_all(&self, payload: Payload) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_shape_matching() {
        assert!(CollectionShape::List.matches(&json!([1, 2])));
        assert!(!CollectionShape::List.matches(&json!({"a": 1})));
        assert!(CollectionShape::Map.matches(&json!({"a": 1})));
        assert!(!CollectionShape::Map.matches(&json!("text")));
    }

    #[test]
    fn test_record_count() {
        assert_eq!(CollectionShape::List.record_count(&json!([1, 2, 3])), Some(3));
        assert_eq!(CollectionShape::Map.record_count(&json!({})), Some(0));
        assert_eq!(CollectionShape::Map.record_count(&json!([1])), None);
    }

    #[test]
    fn test_shape_serialization() {
        let spec = CollectionSpec::new(
            CollectionName::new("pests").unwrap(),
            CollectionShape::Map,
        );
        let json = serde_json::to_string(&spec).unwrap();
        assert_eq!(json, r#"{"name":"pests","shape":"map"}"#);
    }
}
