//! Staged field mutations.
//!
//! Edits to an entity are not applied to its saved snapshot. They accumulate
//! here, keyed by field name across several operator maps, and are compiled
//! into a minimal wire update document when the entity is saved.

use crate::error::CoreResult;
use crate::field;
use crate::value::{Document, Number, Value};
use std::collections::{BTreeMap, BTreeSet};

/// Which end of a list a pop operation trims.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PopEnd {
    /// Remove the first element.
    First,
    /// Remove the last element.
    Last,
}

impl PopEnd {
    /// Wire encoding: `-1` pops the first element, `1` the last.
    #[must_use]
    pub fn wire(self) -> i8 {
        match self {
            PopEnd::First => -1,
            PopEnd::Last => 1,
        }
    }
}

/// Staged edits for one entity.
///
/// Each operator family keeps its own map keyed by field name. The merge
/// rules per family:
///
/// - `set` replaces, and evicts the field from `unset` (and vice versa);
///   the later call wins across the two maps
/// - `inc` deltas accumulate additively for repeated increments
/// - `push` and `push_all` replace per field
/// - `add_to_set` values append, de-duplicated at compile time
/// - `pop` keeps only the most recently requested direction per field
/// - `pull_all` replaces per field; a single-value pull folds into a
///   one-element list
///
/// Field keys are validated when the operation is staged, not at compile
/// time.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PendingOps {
    set: BTreeMap<String, Value>,
    unset: BTreeSet<String>,
    inc: BTreeMap<String, Number>,
    push: BTreeMap<String, Value>,
    push_all: BTreeMap<String, Vec<Value>>,
    add_to_set: BTreeMap<String, Vec<Value>>,
    pop: BTreeMap<String, PopEnd>,
    pull_all: BTreeMap<String, Vec<Value>>,
}

impl PendingOps {
    /// Creates an empty set of staged edits.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns true when nothing is staged.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.set.is_empty()
            && self.unset.is_empty()
            && self.inc.is_empty()
            && self.push.is_empty()
            && self.push_all.is_empty()
            && self.add_to_set.is_empty()
            && self.pop.is_empty()
            && self.pull_all.is_empty()
    }

    /// Stages a field assignment.
    pub fn set(&mut self, key: &str, value: Value) -> CoreResult<()> {
        field::validate_entry(key, &value)?;
        self.unset.remove(key);
        self.set.insert(key.to_owned(), value);
        Ok(())
    }

    /// Stages a field removal.
    pub fn unset(&mut self, key: &str) -> CoreResult<()> {
        field::validate_key(key)?;
        self.set.remove(key);
        self.unset.insert(key.to_owned());
        Ok(())
    }

    /// Stages an increment; repeated deltas on one field accumulate.
    pub fn increment(&mut self, key: &str, delta: Number) -> CoreResult<()> {
        field::validate_delta(key, delta)?;
        let entry = self.inc.entry(key.to_owned()).or_insert(Number::Int(0));
        *entry = entry.accumulate(delta);
        Ok(())
    }

    /// Stages a single-element list append.
    pub fn push(&mut self, key: &str, value: Value) -> CoreResult<()> {
        field::validate_entry(key, &value)?;
        self.push.insert(key.to_owned(), value);
        Ok(())
    }

    /// Stages a multi-element list append.
    pub fn push_all(&mut self, key: &str, values: Vec<Value>) -> CoreResult<()> {
        field::validate_key(key)?;
        for value in &values {
            field::validate_value(value)?;
        }
        self.push_all.insert(key.to_owned(), values);
        Ok(())
    }

    /// Stages a set-style append of one value.
    pub fn add_to_set(&mut self, key: &str, value: Value) -> CoreResult<()> {
        field::validate_entry(key, &value)?;
        self.add_to_set.entry(key.to_owned()).or_default().push(value);
        Ok(())
    }

    /// Stages a set-style append of several values.
    pub fn add_all_to_set(&mut self, key: &str, values: Vec<Value>) -> CoreResult<()> {
        field::validate_key(key)?;
        for value in &values {
            field::validate_value(value)?;
        }
        self.add_to_set.entry(key.to_owned()).or_default().extend(values);
        Ok(())
    }

    /// Stages removal of the first list element.
    pub fn pop_first(&mut self, key: &str) -> CoreResult<()> {
        field::validate_key(key)?;
        self.pop.insert(key.to_owned(), PopEnd::First);
        Ok(())
    }

    /// Stages removal of the last list element.
    pub fn pop_last(&mut self, key: &str) -> CoreResult<()> {
        field::validate_key(key)?;
        self.pop.insert(key.to_owned(), PopEnd::Last);
        Ok(())
    }

    /// Stages removal of all occurrences of one value.
    pub fn pull(&mut self, key: &str, value: Value) -> CoreResult<()> {
        self.pull_all(key, vec![value])
    }

    /// Stages removal of all occurrences of the given values.
    pub fn pull_all(&mut self, key: &str, values: Vec<Value>) -> CoreResult<()> {
        field::validate_key(key)?;
        for value in &values {
            field::validate_value(value)?;
        }
        self.pull_all.insert(key.to_owned(), values);
        Ok(())
    }

    /// Returns the staged assignment for a key, if any.
    ///
    /// A staged unset reads as `Some(None)`: the field is pending removal.
    #[must_use]
    pub fn staged(&self, key: &str) -> Option<Option<&Value>> {
        if self.unset.contains(key) {
            return Some(None);
        }
        self.set.get(key).map(Some)
    }

    /// Re-validates every staged key and value.
    ///
    /// Staging already validated each call; save runs this once more so a
    /// compiled document can never carry an illegal key.
    pub fn validate(&self) -> CoreResult<()> {
        for (key, value) in &self.set {
            field::validate_entry(key, value)?;
        }
        for key in &self.unset {
            field::validate_key(key)?;
        }
        for (key, delta) in &self.inc {
            field::validate_delta(key, *delta)?;
        }
        for (key, value) in &self.push {
            field::validate_entry(key, value)?;
        }
        for map in [&self.push_all, &self.add_to_set, &self.pull_all] {
            for (key, values) in map {
                field::validate_key(key)?;
                for value in values {
                    field::validate_value(value)?;
                }
            }
        }
        for key in self.pop.keys() {
            field::validate_key(key)?;
        }
        Ok(())
    }

    /// Compiles the staged edits into a minimal wire update document.
    ///
    /// List operations (push, push-all, add-to-set, pop, pull-all) have no
    /// effect on a new entity, since the server has no record to modify yet,
    /// and are dropped here without error. Only set, unset, and increment
    /// compile for a new entity.
    #[must_use]
    pub fn compile(&self, is_new: bool) -> UpdateDocument {
        let mut update = UpdateDocument {
            set: self.set.clone(),
            unset: self.unset.iter().cloned().collect(),
            inc: self.inc.clone(),
            ..UpdateDocument::default()
        };
        if !is_new {
            update.push = self.push.clone();
            update.push_all = self.push_all.clone();
            update.add_to_set = self
                .add_to_set
                .iter()
                .map(|(key, values)| (key.clone(), dedup(values)))
                .collect();
            update.pop = self.pop.clone();
            update.pull_all = self.pull_all.clone();
        }
        update
    }

    /// Discards all staged edits. The snapshot is untouched.
    pub fn reset(&mut self) {
        *self = Self::default();
    }
}

/// De-duplicates while preserving first-occurrence order.
fn dedup(values: &[Value]) -> Vec<Value> {
    let mut out: Vec<Value> = Vec::with_capacity(values.len());
    for value in values {
        if !out.contains(value) {
            out.push(value.clone());
        }
    }
    out
}

/// A compiled, wire-ready update document.
///
/// Only the operator families that carry entries appear on the wire.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct UpdateDocument {
    /// Field assignments.
    pub set: Document,
    /// Fields to remove.
    pub unset: Vec<String>,
    /// Accumulated increment deltas.
    pub inc: BTreeMap<String, Number>,
    /// Single-element list appends.
    pub push: BTreeMap<String, Value>,
    /// Multi-element list appends.
    pub push_all: BTreeMap<String, Vec<Value>>,
    /// De-duplicated set-style appends.
    pub add_to_set: BTreeMap<String, Vec<Value>>,
    /// List trims, by end.
    pub pop: BTreeMap<String, PopEnd>,
    /// Values to remove from lists.
    pub pull_all: BTreeMap<String, Vec<Value>>,
}

impl UpdateDocument {
    /// Returns true when no operator family carries an entry.
    ///
    /// Saving an empty document is a successful no-op; the caller must not
    /// issue a network call for it.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.set.is_empty()
            && self.unset.is_empty()
            && self.inc.is_empty()
            && self.push.is_empty()
            && self.push_all.is_empty()
            && self.add_to_set.is_empty()
            && self.pop.is_empty()
            && self.pull_all.is_empty()
    }

    /// Serializes the update into the JSON operator document the service
    /// expects (`$set`, `$unset`, `$inc`, `$push`, `$pushAll`, `$addToSet`
    /// with `$each`, `$pop`, `$pullAll`).
    #[must_use]
    pub fn to_wire(&self) -> serde_json::Value {
        let mut update = serde_json::Map::new();
        if !self.set.is_empty() {
            update.insert("$set".into(), crate::value::document_to_wire(&self.set));
        }
        if !self.unset.is_empty() {
            let mut map = serde_json::Map::new();
            for key in &self.unset {
                map.insert(key.clone(), serde_json::Value::Number(1.into()));
            }
            update.insert("$unset".into(), serde_json::Value::Object(map));
        }
        if !self.inc.is_empty() {
            let mut map = serde_json::Map::new();
            for (key, delta) in &self.inc {
                map.insert(key.clone(), Value::from(*delta).to_wire());
            }
            update.insert("$inc".into(), serde_json::Value::Object(map));
        }
        if !self.push.is_empty() {
            let mut map = serde_json::Map::new();
            for (key, value) in &self.push {
                map.insert(key.clone(), value.to_wire());
            }
            update.insert("$push".into(), serde_json::Value::Object(map));
        }
        if !self.push_all.is_empty() {
            update.insert("$pushAll".into(), list_map_to_wire(&self.push_all));
        }
        if !self.add_to_set.is_empty() {
            let mut map = serde_json::Map::new();
            for (key, values) in &self.add_to_set {
                let mut each = serde_json::Map::new();
                each.insert(
                    "$each".into(),
                    serde_json::Value::Array(values.iter().map(Value::to_wire).collect()),
                );
                map.insert(key.clone(), serde_json::Value::Object(each));
            }
            update.insert("$addToSet".into(), serde_json::Value::Object(map));
        }
        if !self.pop.is_empty() {
            let mut map = serde_json::Map::new();
            for (key, end) in &self.pop {
                map.insert(key.clone(), serde_json::Value::Number(end.wire().into()));
            }
            update.insert("$pop".into(), serde_json::Value::Object(map));
        }
        if !self.pull_all.is_empty() {
            update.insert("$pullAll".into(), list_map_to_wire(&self.pull_all));
        }
        serde_json::Value::Object(update)
    }
}

fn list_map_to_wire(map: &BTreeMap<String, Vec<Value>>) -> serde_json::Value {
    let mut out = serde_json::Map::new();
    for (key, values) in map {
        out.insert(
            key.clone(),
            serde_json::Value::Array(values.iter().map(Value::to_wire).collect()),
        );
    }
    serde_json::Value::Object(out)
}
