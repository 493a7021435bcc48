//! Schemaless JSON documents with CouchDB-style `_id` / `_rev` bookkeeping.

use crate::error::{Result, StoreError};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// A stored document: an id, a revision, and an arbitrary JSON body.
///
/// Typed views (aggregate, analysis) are obtained with [`Document::to_typed`]
/// and written back with [`Document::from_typed`]; the store itself never
/// looks inside the body.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Document {
    /// Unique id, assigned by the store on save when empty
    #[serde(rename = "_id", default, skip_serializing_if = "String::is_empty")]
    pub id: String,

    /// Revision, assigned by the store on every write
    #[serde(rename = "_rev", default, skip_serializing_if = "Option::is_none")]
    pub rev: Option<String>,

    /// Document body
    #[serde(flatten)]
    pub body: Map<String, Value>,
}

impl Document {
    /// Create a document with the given id and an empty body.
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            rev: None,
            body: Map::new(),
        }
    }

    /// Serialize any serde type into a document.
    ///
    /// The value must serialize to a JSON object; `_id` / `_rev` keys are
    /// lifted out of the body.
    pub fn from_typed<T: Serialize>(value: &T) -> Result<Self> {
        let value = serde_json::to_value(value)?;
        if !value.is_object() {
            return Err(StoreError::InvalidDocument(format!(
                "expected a JSON object, got {}",
                value
            )));
        }
        Ok(serde_json::from_value(value)?)
    }

    /// Deserialize this document into a typed view.
    pub fn to_typed<T: DeserializeOwned>(&self) -> Result<T> {
        Ok(serde_json::from_value(serde_json::to_value(self)?)?)
    }

    /// Builder: set a body field.
    pub fn with_field(mut self, key: impl Into<String>, value: Value) -> Self {
        self.body.insert(key.into(), value);
        self
    }

    /// Read a body field.
    pub fn field(&self, key: &str) -> Option<&Value> {
        self.body.get(key)
    }

    /// Whether this document is flagged `aggregate = true`.
    pub fn is_aggregate(&self) -> bool {
        matches!(self.body.get("aggregate"), Some(Value::Bool(true)))
    }

    /// Copy holding only `_id` and `_rev`.
    pub fn stub(&self) -> Self {
        Self {
            id: self.id.clone(),
            rev: self.rev.clone(),
            body: Map::new(),
        }
    }

    /// Generation number encoded in the revision (`0` when never written).
    pub fn generation(&self) -> u64 {
        self.rev
            .as_deref()
            .and_then(|rev| rev.split_once('-'))
            .and_then(|(n, _)| n.parse().ok())
            .unwrap_or(0)
    }
}

/// Options for [`crate::DocumentStore::get`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GetOptions {
    /// Return the full body, not just `_id` / `_rev`
    pub include_body: bool,
}

impl Default for GetOptions {
    fn default() -> Self {
        Self { include_body: true }
    }
}

impl GetOptions {
    /// Fetch only `_id` / `_rev`.
    pub fn stub_only() -> Self {
        Self {
            include_body: false,
        }
    }
}

/// Derive a document id from the store name and a sequence number.
pub(crate) fn derive_id(store: &str, seq: u64) -> String {
    let mut hasher = blake3::Hasher::new();
    hasher.update(store.as_bytes());
    hasher.update(&seq.to_be_bytes());
    hex::encode(&hasher.finalize().as_bytes()[..16])
}

/// Compute the next revision for a document body.
pub(crate) fn next_rev(generation: u64, body: &Map<String, Value>) -> Result<String> {
    let bytes = serde_json::to_vec(body)?;
    let digest = blake3::hash(&bytes);
    Ok(format!(
        "{}-{}",
        generation + 1,
        hex::encode(&digest.as_bytes()[..16])
    ))
}

/// Check an incoming update against the stored revision.
pub(crate) fn check_rev(incoming: &Document, stored: &Document) -> Result<()> {
    if incoming.rev != stored.rev {
        return Err(StoreError::Conflict {
            id: incoming.id.clone(),
            expected: stored.rev.clone(),
            actual: incoming.rev.clone(),
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Probe {
        #[serde(rename = "_id")]
        id: String,
        #[serde(rename = "_rev", default)]
        rev: Option<String>,
        aggregate: bool,
        count: u32,
    }

    #[test]
    fn typed_views_lift_id_and_rev() {
        let probe = Probe {
            id: "agg".into(),
            rev: Some("3-abc".into()),
            aggregate: true,
            count: 7,
        };
        let doc = Document::from_typed(&probe).unwrap();
        assert_eq!(doc.id, "agg");
        assert_eq!(doc.rev.as_deref(), Some("3-abc"));
        assert_eq!(doc.generation(), 3);
        assert!(doc.is_aggregate());
        assert!(!doc.body.contains_key("_id"));

        let back: Probe = doc.to_typed().unwrap();
        assert_eq!(back, probe);
    }

    #[test]
    fn non_object_is_rejected() {
        assert!(matches!(
            Document::from_typed(&json!([1, 2, 3])),
            Err(StoreError::InvalidDocument(_))
        ));
    }

    #[test]
    fn aggregate_flag_must_be_literal_true() {
        let doc = Document::new("x").with_field("aggregate", json!("true"));
        assert!(!doc.is_aggregate());
    }

    #[test]
    fn revisions_advance_generation() {
        let body = Document::new("a").with_field("n", json!(1)).body;
        let rev = next_rev(0, &body).unwrap();
        assert!(rev.starts_with("1-"));
        let doc = Document {
            rev: Some(rev),
            ..Document::new("a")
        };
        assert!(next_rev(doc.generation(), &body).unwrap().starts_with("2-"));
    }

    #[test]
    fn derived_ids_are_unique_per_sequence() {
        assert_ne!(derive_id("s", 1), derive_id("s", 2));
        assert_eq!(derive_id("s", 1), derive_id("s", 1));
        assert_eq!(derive_id("s", 1).len(), 32);
    }
}
