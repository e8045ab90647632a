//! Dynamic field values.
//!
//! Entities of a schemaless store carry loosely typed fields. Values are
//! modeled as a closed tagged variant so the validator and the compilers can
//! match exhaustively instead of inspecting types at runtime.
//!
//! On the wire, binary data is carried as a `{"$binary": <base64>}` object
//! and relations as `{"$ref": <collection>, "$id": <id>}`; everything else
//! maps directly onto JSON.

use crate::relation::Relation;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use serde::de::Deserializer;
use serde::ser::Serializer;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Wire tag for binary field values.
pub const BINARY_TAG: &str = "$binary";
/// Wire tag for the collection half of a relation reference.
pub const REF_TAG: &str = "$ref";
/// Wire tag for the id half of a relation reference.
pub const REF_ID_TAG: &str = "$id";

/// A field mapping, as stored in an entity snapshot or sent as a filter.
pub type Document = BTreeMap<String, Value>;

/// A numeric field value.
///
/// Integers and floats are kept apart so counters stay integral on the
/// wire, but the two compare and accumulate numerically.
#[derive(Debug, Clone, Copy)]
pub enum Number {
    /// A signed integer.
    Int(i64),
    /// A double-precision float.
    Float(f64),
}

impl Number {
    /// Returns the value as a float.
    #[must_use]
    pub fn as_f64(self) -> f64 {
        match self {
            Number::Int(i) => i as f64,
            Number::Float(f) => f,
        }
    }

    /// Returns the value as an integer if it is one.
    #[must_use]
    pub fn as_i64(self) -> Option<i64> {
        match self {
            Number::Int(i) => Some(i),
            Number::Float(_) => None,
        }
    }

    /// Returns true for floats that are NaN or infinite.
    #[must_use]
    pub fn is_finite(self) -> bool {
        match self {
            Number::Int(_) => true,
            Number::Float(f) => f.is_finite(),
        }
    }

    /// Adds two numbers, staying integral when both operands are integers.
    ///
    /// Integer overflow promotes the result to a float.
    #[must_use]
    pub fn accumulate(self, other: Number) -> Number {
        match (self, other) {
            (Number::Int(a), Number::Int(b)) => match a.checked_add(b) {
                Some(sum) => Number::Int(sum),
                None => Number::Float(a as f64 + b as f64),
            },
            (a, b) => Number::Float(a.as_f64() + b.as_f64()),
        }
    }
}

impl PartialEq for Number {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Number::Int(a), Number::Int(b)) => a == b,
            (Number::Float(a), Number::Float(b)) => a == b,
            (Number::Int(a), Number::Float(b)) | (Number::Float(b), Number::Int(a)) => {
                *a as f64 == *b
            }
        }
    }
}

impl PartialOrd for Number {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        match (self, other) {
            (Number::Int(a), Number::Int(b)) => a.partial_cmp(b),
            (a, b) => a.as_f64().partial_cmp(&b.as_f64()),
        }
    }
}

impl From<i64> for Number {
    fn from(v: i64) -> Self {
        Number::Int(v)
    }
}

impl From<i32> for Number {
    fn from(v: i32) -> Self {
        Number::Int(i64::from(v))
    }
}

impl From<u32> for Number {
    fn from(v: u32) -> Self {
        Number::Int(i64::from(v))
    }
}

impl From<f64> for Number {
    fn from(v: f64) -> Self {
        Number::Float(v)
    }
}

/// A dynamic field value.
///
/// Closed over the types the wire format can carry: JSON primitives and
/// containers, opaque binary data, and relation references.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    /// The null value.
    Null,
    /// A boolean.
    Bool(bool),
    /// A number.
    Number(Number),
    /// A UTF-8 string.
    String(String),
    /// Opaque binary data.
    Binary(Vec<u8>),
    /// An ordered list of values.
    List(Vec<Value>),
    /// A nested document.
    Map(Document),
    /// A reference to another entity.
    Relation(Relation),
}

impl Value {
    /// Returns true for `Value::Null`.
    #[must_use]
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// Returns the string slice if this is a string value.
    #[must_use]
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    /// Returns the boolean if this is a bool value.
    #[must_use]
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    /// Returns the number if this is a numeric value.
    #[must_use]
    pub fn as_number(&self) -> Option<Number> {
        match self {
            Value::Number(n) => Some(*n),
            _ => None,
        }
    }

    /// Returns the integer if this is an integral numeric value.
    #[must_use]
    pub fn as_i64(&self) -> Option<i64> {
        self.as_number().and_then(Number::as_i64)
    }

    /// Returns the list if this is a list value.
    #[must_use]
    pub fn as_list(&self) -> Option<&[Value]> {
        match self {
            Value::List(items) => Some(items),
            _ => None,
        }
    }

    /// Returns the nested document if this is a map value.
    #[must_use]
    pub fn as_map(&self) -> Option<&Document> {
        match self {
            Value::Map(map) => Some(map),
            _ => None,
        }
    }

    /// Returns the relation if this value references another entity.
    #[must_use]
    pub fn as_relation(&self) -> Option<&Relation> {
        match self {
            Value::Relation(rel) => Some(rel),
            _ => None,
        }
    }

    /// Converts the value into its JSON wire representation.
    #[must_use]
    pub fn to_wire(&self) -> serde_json::Value {
        match self {
            Value::Null => serde_json::Value::Null,
            Value::Bool(b) => serde_json::Value::Bool(*b),
            Value::Number(Number::Int(i)) => serde_json::Value::Number((*i).into()),
            Value::Number(Number::Float(f)) => serde_json::Number::from_f64(*f)
                .map(serde_json::Value::Number)
                .unwrap_or(serde_json::Value::Null),
            Value::String(s) => serde_json::Value::String(s.clone()),
            Value::Binary(bytes) => {
                let mut map = serde_json::Map::new();
                map.insert(
                    BINARY_TAG.to_owned(),
                    serde_json::Value::String(BASE64.encode(bytes)),
                );
                serde_json::Value::Object(map)
            }
            Value::List(items) => {
                serde_json::Value::Array(items.iter().map(Value::to_wire).collect())
            }
            Value::Map(map) => document_to_wire(map),
            Value::Relation(rel) => {
                let mut map = serde_json::Map::new();
                map.insert(
                    REF_TAG.to_owned(),
                    serde_json::Value::String(rel.collection().to_owned()),
                );
                map.insert(
                    REF_ID_TAG.to_owned(),
                    serde_json::Value::String(rel.id().as_str().to_owned()),
                );
                serde_json::Value::Object(map)
            }
        }
    }

    /// Reconstructs a value from its JSON wire representation.
    ///
    /// Objects carrying the binary or relation tags decode to their typed
    /// variants; any other object becomes a nested document.
    #[must_use]
    pub fn from_wire(json: &serde_json::Value) -> Value {
        match json {
            serde_json::Value::Null => Value::Null,
            serde_json::Value::Bool(b) => Value::Bool(*b),
            serde_json::Value::Number(n) => {
                if let Some(i) = n.as_i64() {
                    Value::Number(Number::Int(i))
                } else {
                    Value::Number(Number::Float(n.as_f64().unwrap_or(f64::NAN)))
                }
            }
            serde_json::Value::String(s) => Value::String(s.clone()),
            serde_json::Value::Array(items) => {
                Value::List(items.iter().map(Value::from_wire).collect())
            }
            serde_json::Value::Object(map) => {
                if map.len() == 1 {
                    if let Some(serde_json::Value::String(encoded)) = map.get(BINARY_TAG) {
                        if let Ok(bytes) = BASE64.decode(encoded) {
                            return Value::Binary(bytes);
                        }
                    }
                }
                if map.len() == 2 {
                    if let (
                        Some(serde_json::Value::String(collection)),
                        Some(serde_json::Value::String(id)),
                    ) = (map.get(REF_TAG), map.get(REF_ID_TAG))
                    {
                        return Value::Relation(Relation::new(collection.clone(), id.as_str()));
                    }
                }
                Value::Map(
                    map.iter()
                        .map(|(k, v)| (k.clone(), Value::from_wire(v)))
                        .collect(),
                )
            }
        }
    }
}

/// Converts a document into its JSON wire representation.
#[must_use]
pub fn document_to_wire(doc: &Document) -> serde_json::Value {
    let mut map = serde_json::Map::new();
    for (key, value) in doc {
        map.insert(key.clone(), value.to_wire());
    }
    serde_json::Value::Object(map)
}

/// Reconstructs a document from a JSON object.
///
/// Returns `None` when the JSON value is not an object.
#[must_use]
pub fn document_from_wire(json: &serde_json::Value) -> Option<Document> {
    match json {
        serde_json::Value::Object(map) => Some(
            map.iter()
                .map(|(k, v)| (k.clone(), Value::from_wire(v)))
                .collect(),
        ),
        _ => None,
    }
}

impl Serialize for Value {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.to_wire().serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for Value {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let json = serde_json::Value::deserialize(deserializer)?;
        Ok(Value::from_wire(&json))
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Number(Number::Int(v))
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Value::Number(Number::Int(i64::from(v)))
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Number(Number::Float(v))
    }
}

impl From<Number> for Value {
    fn from(v: Number) -> Self {
        Value::Number(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::String(v.to_owned())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::String(v)
    }
}

impl From<Vec<Value>> for Value {
    fn from(v: Vec<Value>) -> Self {
        Value::List(v)
    }
}

impl From<Document> for Value {
    fn from(v: Document) -> Self {
        Value::Map(v)
    }
}

impl From<Relation> for Value {
    fn from(v: Relation) -> Self {
        Value::Relation(v)
    }
}
