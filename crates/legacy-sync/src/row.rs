//! Row representation shared by source, target and transform collaborators.
//!
//! A [`Row`] is an ordered map of field name to JSON value. Ordering makes the
//! serialized form canonical, which is what the content hash is computed over.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;

/// Field value. JSON covers every scalar the stores exchange.
pub type Value = serde_json::Value;

/// A single record, keyed by field name.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Row(BTreeMap<String, Value>);

impl Row {
    /// Create an empty row.
    pub fn new() -> Self {
        Self(BTreeMap::new())
    }

    /// Build a row from a JSON object. Returns `None` for non-objects.
    pub fn from_json(value: Value) -> Option<Self> {
        match value {
            Value::Object(map) => Some(Self(map.into_iter().collect())),
            _ => None,
        }
    }

    /// Get a field value.
    pub fn get(&self, field: &str) -> Option<&Value> {
        self.0.get(field)
    }

    /// Set a field value, returning the previous one.
    pub fn insert(&mut self, field: impl Into<String>, value: impl Into<Value>) -> Option<Value> {
        self.0.insert(field.into(), value.into())
    }

    /// Remove a field.
    pub fn remove(&mut self, field: &str) -> Option<Value> {
        self.0.remove(field)
    }

    /// Read a field as an integer id.
    ///
    /// Legacy data frequently stores ids as strings, so numeric strings are
    /// accepted as well as JSON integers.
    pub fn get_i64(&self, field: &str) -> Option<i64> {
        match self.0.get(field)? {
            Value::Number(n) => n.as_i64(),
            Value::String(s) => s.trim().parse().ok(),
            _ => None,
        }
    }

    /// Whether the field is absent or null.
    pub fn is_null(&self, field: &str) -> bool {
        matches!(self.0.get(field), None | Some(Value::Null))
    }

    /// Iterate over fields in name order.
    pub fn iter(&self) -> impl Iterator<Item = (&String, &Value)> {
        self.0.iter()
    }

    /// Number of fields.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Whether the row has no fields.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// SHA-256 (hex) of the canonical JSON encoding.
    pub fn content_hash(&self) -> String {
        let encoded = serde_json::to_vec(&self.0).unwrap_or_default();
        let mut hasher = Sha256::new();
        hasher.update(&encoded);
        hex::encode(hasher.finalize())
    }

    /// Names of fields present in `self` whose value differs in `other`.
    ///
    /// Fields missing from `other` count as differing unless `self` holds null.
    pub fn changed_fields(&self, other: &Row) -> Vec<String> {
        self.0
            .iter()
            .filter(|(k, v)| match other.0.get(*k) {
                Some(o) => !values_equal(v, o),
                None => !v.is_null(),
            })
            .map(|(k, _)| k.clone())
            .collect()
    }

    /// Consume into the underlying map.
    pub fn into_inner(self) -> BTreeMap<String, Value> {
        self.0
    }

    /// Convert into a JSON object value.
    pub fn to_json(&self) -> Value {
        Value::Object(self.0.clone().into_iter().collect())
    }
}

/// Numeric-aware equality: `1` and `1.0` compare equal, as do a number and
/// its string rendering (target stores often round-trip through text).
fn values_equal(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => x.as_f64() == y.as_f64(),
        (Value::Number(n), Value::String(s)) | (Value::String(s), Value::Number(n)) => {
            s.parse::<f64>().ok() == n.as_f64()
        }
        _ => a == b,
    }
}

impl FromIterator<(String, Value)> for Row {
    fn from_iter<I: IntoIterator<Item = (String, Value)>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

impl From<BTreeMap<String, Value>> for Row {
    fn from(map: BTreeMap<String, Value>) -> Self {
        Self(map)
    }
}
