//! Deterministic cache keys.
//!
//! A key is derived from a collection namespace plus an ordered list of key
//! parts. Each part is canonicalized (object keys sorted, query parameters
//! sorted, credential fields dropped) and the whole list is encoded as one JSON
//! array before hashing, so equivalent requests always land on the same key.

use serde_json::{Map, Number, Value};
use sha2::{Digest, Sha256};
use std::fmt::Display;

/// Field names that never contribute to a cache key
pub const EXCLUDED_KEY_FIELDS: &[&str] = &["api_key", "apikey", "token", "access_token"];

/// Logical cache namespaces. Keys in different collections never collide.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Collection {
    /// Raw upstream catalog responses
    Upstream,
    /// Credits and critic score lookups
    Enrichment,
    /// Discovery cursor documents
    Cursors,
    /// Full catalog snapshots
    Catalog,
    /// Accumulated candidates per discovery signature
    Discovery,
}

impl Collection {
    pub fn as_str(&self) -> &'static str {
        match self {
            Collection::Upstream => "upstream",
            Collection::Enrichment => "enrichment",
            Collection::Cursors => "cursors",
            Collection::Catalog => "catalog",
            Collection::Discovery => "discovery",
        }
    }
}

impl Display for Collection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// One component of a cache key
#[derive(Debug, Clone, PartialEq)]
pub enum KeyPart {
    Text(String),
    Number(Number),
    /// Free-form object; keys are sorted during canonicalization
    Map(Map<String, Value>),
    /// Query parameters; order is irrelevant to the key
    Params(Vec<(String, String)>),
    List(Vec<KeyPart>),
}

impl From<&str> for KeyPart {
    fn from(value: &str) -> Self {
        KeyPart::Text(value.to_string())
    }
}

impl From<String> for KeyPart {
    fn from(value: String) -> Self {
        KeyPart::Text(value)
    }
}

impl From<u32> for KeyPart {
    fn from(value: u32) -> Self {
        KeyPart::Number(value.into())
    }
}

impl From<u64> for KeyPart {
    fn from(value: u64) -> Self {
        KeyPart::Number(value.into())
    }
}

impl From<i64> for KeyPart {
    fn from(value: i64) -> Self {
        KeyPart::Number(value.into())
    }
}

impl From<Vec<(String, String)>> for KeyPart {
    fn from(value: Vec<(String, String)>) -> Self {
        KeyPart::Params(value)
    }
}

impl From<Map<String, Value>> for KeyPart {
    fn from(value: Map<String, Value>) -> Self {
        KeyPart::Map(value)
    }
}

fn is_excluded(field: &str) -> bool {
    EXCLUDED_KEY_FIELDS
        .iter()
        .any(|excluded| excluded.eq_ignore_ascii_case(field))
}

/// Strips excluded fields at every depth. `serde_json::Map` is ordered, so
/// rebuilding the object also sorts its keys.
fn canonical_value(value: &Value) -> Value {
    match value {
        Value::Object(map) => Value::Object(
            map.iter()
                .filter(|(k, _)| !is_excluded(k))
                .map(|(k, v)| (k.clone(), canonical_value(v)))
                .collect(),
        ),
        Value::Array(items) => Value::Array(items.iter().map(canonical_value).collect()),
        other => other.clone(),
    }
}

impl KeyPart {
    fn canonical(&self) -> Value {
        match self {
            KeyPart::Text(text) => Value::String(text.clone()),
            KeyPart::Number(number) => Value::Number(number.clone()),
            KeyPart::Map(map) => canonical_value(&Value::Object(map.clone())),
            KeyPart::Params(params) => {
                let mut pairs: Vec<(&str, &str)> = params
                    .iter()
                    .filter(|(k, _)| !is_excluded(k))
                    .map(|(k, v)| (k.as_str(), v.as_str()))
                    .collect();
                pairs.sort();
                let encoded: Vec<Value> = pairs
                    .into_iter()
                    .map(|(k, v)| Value::Array(vec![k.into(), v.into()]))
                    .collect();
                // Tagged so a param list never equals a plain list of pairs
                let mut tagged = Map::new();
                tagged.insert("$params".to_string(), Value::Array(encoded));
                Value::Object(tagged)
            }
            KeyPart::List(items) => Value::Array(items.iter().map(KeyPart::canonical).collect()),
        }
    }
}

/// Canonical string form of a key part list, before hashing
pub fn canonicalize(parts: &[KeyPart]) -> String {
    let array = Value::Array(parts.iter().map(KeyPart::canonical).collect());
    array.to_string()
}

/// Derives the storage key for `parts` within `collection`.
///
/// The result is `<collection>:<64 hex chars>` and is safe to use as a Redis key.
pub fn derive_key(collection: Collection, parts: &[KeyPart]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(canonicalize(parts).as_bytes());
    format!("{}:{}", collection, hex::encode(hasher.finalize()))
}
