//! In-memory document store.
//!
//! [`MemoryServer`] mirrors the remote service's observable behavior close
//! enough for end-to-end tests: update-operator application, filter
//! evaluation, sorting, projection, relation resolution, and unique
//! indexes. It holds everything in process memory and has no durability.

use farstore_core::{
    CompiledRead, Document, EntityId, MapReduceJob, Number, PopEnd, Projection, TransportError,
    TransportResult, UpdateDocument, Value, WireRequest, WireResponse, CREATED_FIELD, ID_FIELD,
    SEQUENCE_FIELD, UPDATED_FIELD,
};
use parking_lot::RwLock;
use std::cmp::Ordering;
use std::collections::HashMap;

/// Handler evaluating a map-reduce job over the matched documents.
pub type MapReduceHandler =
    Box<dyn Fn(&MapReduceJob, Vec<Document>) -> Value + Send + Sync>;

#[derive(Default)]
struct Collection {
    documents: Vec<Document>,
    next_seq: u64,
    unique_keys: Vec<String>,
}

/// An in-memory document store implementing the service's semantics.
///
/// Collections are created on first use. Documents keep insertion order,
/// which is also the order unsorted finds return them in.
pub struct MemoryServer {
    collections: RwLock<HashMap<String, Collection>>,
    map_reduce: RwLock<Option<MapReduceHandler>>,
}

impl MemoryServer {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self {
            collections: RwLock::new(HashMap::new()),
            map_reduce: RwLock::new(None),
        }
    }

    /// Installs a handler evaluating map-reduce jobs.
    ///
    /// Without one, map-reduce requests answer with the matched documents
    /// as a raw list.
    pub fn set_map_reduce_handler<F>(&self, handler: F)
    where
        F: Fn(&MapReduceJob, Vec<Document>) -> Value + Send + Sync + 'static,
    {
        *self.map_reduce.write() = Some(Box::new(handler));
    }

    /// Number of documents stored in a collection.
    pub fn len(&self, collection: &str) -> usize {
        self.collections
            .read()
            .get(collection)
            .map_or(0, |c| c.documents.len())
    }

    /// Returns true when the collection is absent or empty.
    pub fn is_empty(&self, collection: &str) -> bool {
        self.len(collection) == 0
    }

    /// Inserts a document directly, bypassing the save pipeline.
    ///
    /// Assigns `_id`, `_created`, `_updated`, and `_seq` the way a save
    /// would. Returns the stored document.
    pub fn seed(&self, collection: &str, mut document: Document) -> Document {
        let mut collections = self.collections.write();
        let entry = collections.entry(collection.to_owned()).or_default();
        let ts = now_secs();
        entry.next_seq += 1;
        document.insert(ID_FIELD.into(), Value::from(fresh_id()));
        document.insert(CREATED_FIELD.into(), Value::from(ts));
        document.insert(UPDATED_FIELD.into(), Value::from(ts));
        document.insert(SEQUENCE_FIELD.into(), Value::from(entry.next_seq as i64));
        entry.documents.push(document.clone());
        document
    }

    /// Executes one compiled operation against the store.
    pub fn execute(&self, request: &WireRequest) -> TransportResult<WireResponse> {
        match request {
            WireRequest::Save {
                collection,
                id,
                update,
            } => self
                .save(collection, id.as_ref(), update)
                .map(WireResponse::Document),
            WireRequest::Refresh { collection, id } => self
                .find_by_id(collection, id)
                .map(WireResponse::Document),
            WireRequest::Delete { collection, id } => {
                self.delete(collection, id)?;
                Ok(WireResponse::None)
            }
            WireRequest::Find { read, .. } => {
                Ok(WireResponse::Documents(self.find(read)))
            }
            WireRequest::Count { read } => Ok(WireResponse::Count(self.count(read))),
            WireRequest::MapReduce { read, job } => {
                let matched = self.find(read);
                let handler = self.map_reduce.read();
                let raw = match handler.as_ref() {
                    Some(handler) => handler(job, matched),
                    None => Value::List(matched.into_iter().map(Value::Map).collect()),
                };
                Ok(WireResponse::Raw(raw))
            }
            WireRequest::EnsureIndex {
                collection,
                key,
                unique,
                drop_duplicates,
            } => {
                self.ensure_index(collection, key, *unique, *drop_duplicates);
                Ok(WireResponse::None)
            }
        }
    }

    fn save(
        &self,
        collection: &str,
        id: Option<&EntityId>,
        update: &UpdateDocument,
    ) -> TransportResult<Document> {
        let mut collections = self.collections.write();
        let entry = collections.entry(collection.to_owned()).or_default();
        let ts = now_secs();

        let mut document = match id {
            Some(id) => match entry
                .documents
                .iter()
                .find(|doc| doc_id(doc) == Some(id.as_str()))
                .cloned()
            {
                Some(doc) => doc,
                None => {
                    // Upsert: a save with an unknown id creates the record.
                    let mut doc = Document::new();
                    doc.insert(ID_FIELD.into(), Value::from(id.as_str()));
                    doc.insert(CREATED_FIELD.into(), Value::from(ts));
                    entry.next_seq += 1;
                    doc.insert(SEQUENCE_FIELD.into(), Value::from(entry.next_seq as i64));
                    doc
                }
            },
            None => {
                let mut doc = Document::new();
                doc.insert(ID_FIELD.into(), Value::from(fresh_id()));
                doc.insert(CREATED_FIELD.into(), Value::from(ts));
                entry.next_seq += 1;
                doc.insert(SEQUENCE_FIELD.into(), Value::from(entry.next_seq as i64));
                doc
            }
        };

        apply_update(&mut document, update)?;
        document.insert(UPDATED_FIELD.into(), Value::from(ts));

        let own_id = doc_id(&document).map(str::to_owned);
        for key in &entry.unique_keys {
            if let Some(value) = document.get(key) {
                let clash = entry.documents.iter().any(|other| {
                    doc_id(other).map(str::to_owned) != own_id && other.get(key) == Some(value)
                });
                if clash {
                    return Err(TransportError::Rejected {
                        code: 201,
                        message: "Save failed because of a duplicate key".into(),
                    });
                }
            }
        }

        match entry
            .documents
            .iter_mut()
            .find(|doc| doc_id(doc).map(str::to_owned) == own_id)
        {
            Some(stored) => *stored = document.clone(),
            None => entry.documents.push(document.clone()),
        }
        Ok(document)
    }

    fn find_by_id(&self, collection: &str, id: &EntityId) -> TransportResult<Document> {
        self.collections
            .read()
            .get(collection)
            .and_then(|entry| {
                entry
                    .documents
                    .iter()
                    .find(|doc| doc_id(doc) == Some(id.as_str()))
                    .cloned()
            })
            .ok_or(TransportError::NotFound)
    }

    fn delete(&self, collection: &str, id: &EntityId) -> TransportResult<()> {
        let mut collections = self.collections.write();
        let entry = collections
            .get_mut(collection)
            .ok_or(TransportError::NotFound)?;
        let before = entry.documents.len();
        entry
            .documents
            .retain(|doc| doc_id(doc) != Some(id.as_str()));
        if entry.documents.len() == before {
            return Err(TransportError::NotFound);
        }
        Ok(())
    }

    fn find(&self, read: &CompiledRead) -> Vec<Document> {
        let collections = self.collections.read();
        let Some(entry) = collections.get(&read.collection) else {
            return Vec::new();
        };
        let mut matched: Vec<Document> = entry
            .documents
            .iter()
            .filter(|doc| matches_filter(doc, &read.filter))
            .cloned()
            .collect();

        if !read.sort.is_empty() {
            matched.sort_by(|a, b| {
                for (field, direction) in &read.sort {
                    let ordering = sort_cmp(a.get(field), b.get(field));
                    let ordering = if *direction < 0 {
                        ordering.reverse()
                    } else {
                        ordering
                    };
                    if ordering != Ordering::Equal {
                        return ordering;
                    }
                }
                Ordering::Equal
            });
        }

        let skip = read.skip as usize;
        let mut matched: Vec<Document> = if skip >= matched.len() {
            Vec::new()
        } else {
            matched.split_off(skip)
        };
        if read.limit > 0 {
            matched.truncate(read.limit as usize);
        }

        for doc in &mut matched {
            for field in &read.includes {
                let resolved = doc.get(field).and_then(Value::as_relation).and_then(|rel| {
                    collections.get(rel.collection()).and_then(|target| {
                        target
                            .documents
                            .iter()
                            .find(|candidate| doc_id(candidate) == Some(rel.id().as_str()))
                            .cloned()
                    })
                });
                if let Some(resolved) = resolved {
                    doc.insert(field.clone(), Value::Map(resolved));
                }
            }
            if let Some(projection) = &read.projection {
                project(doc, projection);
            }
        }
        matched
    }

    fn count(&self, read: &CompiledRead) -> u64 {
        self.collections
            .read()
            .get(&read.collection)
            .map_or(0, |entry| {
                entry
                    .documents
                    .iter()
                    .filter(|doc| matches_filter(doc, &read.filter))
                    .count() as u64
            })
    }

    fn ensure_index(&self, collection: &str, key: &str, unique: bool, drop_duplicates: bool) {
        let mut collections = self.collections.write();
        let entry = collections.entry(collection.to_owned()).or_default();
        if !unique {
            return;
        }
        if drop_duplicates {
            let mut seen: Vec<Value> = Vec::new();
            entry.documents.retain(|doc| match doc.get(key) {
                Some(value) => {
                    if seen.contains(value) {
                        false
                    } else {
                        seen.push(value.clone());
                        true
                    }
                }
                None => true,
            });
        }
        if !entry.unique_keys.iter().any(|existing| existing == key) {
            entry.unique_keys.push(key.to_owned());
        }
    }
}

impl Default for MemoryServer {
    fn default() -> Self {
        Self::new()
    }
}

fn doc_id(doc: &Document) -> Option<&str> {
    doc.get(ID_FIELD).and_then(Value::as_str)
}

fn fresh_id() -> String {
    uuid::Uuid::new_v4().simple().to_string()
}

fn now_secs() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|elapsed| elapsed.as_secs() as i64)
        .unwrap_or(0)
}

fn apply_update(document: &mut Document, update: &UpdateDocument) -> TransportResult<()> {
    for (key, value) in &update.set {
        document.insert(key.clone(), value.clone());
    }
    for key in &update.unset {
        document.remove(key);
    }
    for (key, delta) in &update.inc {
        // A missing or non-numeric field increments from zero.
        let current = document
            .get(key)
            .and_then(Value::as_number)
            .unwrap_or(Number::Int(0));
        document.insert(key.clone(), Value::from(current.accumulate(*delta)));
    }
    for (key, value) in &update.push {
        list_field(document, key)?.push(value.clone());
    }
    for (key, values) in &update.push_all {
        list_field(document, key)?.extend(values.iter().cloned());
    }
    for (key, values) in &update.add_to_set {
        let list = list_field(document, key)?;
        for value in values {
            if !list.contains(value) {
                list.push(value.clone());
            }
        }
    }
    for (key, end) in &update.pop {
        if let Some(Value::List(list)) = document.get_mut(key) {
            if !list.is_empty() {
                match end {
                    PopEnd::First => {
                        list.remove(0);
                    }
                    PopEnd::Last => {
                        list.pop();
                    }
                }
            }
        }
    }
    for (key, values) in &update.pull_all {
        if let Some(Value::List(list)) = document.get_mut(key) {
            list.retain(|element| !values.contains(element));
        }
    }
    Ok(())
}

fn list_field<'a>(
    document: &'a mut Document,
    key: &str,
) -> TransportResult<&'a mut Vec<Value>> {
    let entry = document
        .entry(key.to_owned())
        .or_insert_with(|| Value::List(Vec::new()));
    match entry {
        Value::List(list) => Ok(list),
        _ => Err(TransportError::Rejected {
            code: 200,
            message: format!("Save failed: field {key:?} is not a list"),
        }),
    }
}

fn matches_filter(doc: &Document, filter: &Document) -> bool {
    filter.iter().all(|(key, expected)| match key.as_str() {
        "$or" => expected.as_list().is_some_and(|alternatives| {
            alternatives.iter().any(|alternative| {
                alternative
                    .as_map()
                    .is_some_and(|sub| matches_filter(doc, sub))
            })
        }),
        "$and" => expected.as_list().is_some_and(|clauses| {
            clauses.iter().all(|clause| {
                clause.as_map().is_some_and(|sub| matches_filter(doc, sub))
            })
        }),
        field => match expected.as_map().filter(|map| is_operator_doc(map)) {
            Some(operators) => {
                // A regex condition carries its flags as a sibling $options
                // key; the pair evaluates as one unit.
                let regex_ok = if operators.contains_key("$regex") {
                    match (doc.get(field), regex_with_options(operators)) {
                        (Some(Value::String(text)), Some(re)) => re.is_match(text),
                        _ => false,
                    }
                } else {
                    true
                };
                regex_ok
                    && operators
                        .iter()
                        .filter(|(op, _)| op.as_str() != "$regex" && op.as_str() != "$options")
                        .all(|(op, operand)| matches_operator(doc.get(field), op, operand))
            }
            None => values_equal(doc.get(field), expected),
        },
    })
}

fn is_operator_doc(map: &Document) -> bool {
    !map.is_empty() && map.keys().all(|key| key.starts_with('$'))
}

/// Equality over a field: a list field also matches when any element equals
/// the expected value.
fn values_equal(actual: Option<&Value>, expected: &Value) -> bool {
    match actual {
        Some(value) if value == expected => true,
        Some(Value::List(elements)) => elements.contains(expected),
        _ => false,
    }
}

fn matches_operator(actual: Option<&Value>, op: &str, operand: &Value) -> bool {
    match op {
        "$ne" => !values_equal(actual, operand),
        "$lt" => compare(actual, operand).is_some_and(|o| o == Ordering::Less),
        "$lte" => compare(actual, operand).is_some_and(|o| o != Ordering::Greater),
        "$gt" => compare(actual, operand).is_some_and(|o| o == Ordering::Greater),
        "$gte" => compare(actual, operand).is_some_and(|o| o != Ordering::Less),
        "$in" => operand
            .as_list()
            .is_some_and(|candidates| candidates.iter().any(|c| values_equal(actual, c))),
        "$nin" => operand
            .as_list()
            .is_some_and(|candidates| !candidates.iter().any(|c| values_equal(actual, c))),
        "$all" => match (actual, operand.as_list()) {
            (Some(Value::List(elements)), Some(required)) => {
                required.iter().all(|value| elements.contains(value))
            }
            _ => false,
        },
        "$exists" => operand
            .as_bool()
            .is_some_and(|required| actual.is_some() == required),
        _ => false,
    }
}

fn compare(actual: Option<&Value>, operand: &Value) -> Option<Ordering> {
    match (actual?, operand) {
        (Value::Number(a), Value::Number(b)) => a.partial_cmp(b),
        (Value::String(a), Value::String(b)) => Some(a.cmp(b)),
        (Value::Bool(a), Value::Bool(b)) => Some(a.cmp(b)),
        _ => None,
    }
}

/// Total order over field values for sorting: absent first, then by type
/// rank, then within-type.
fn sort_cmp(a: Option<&Value>, b: Option<&Value>) -> Ordering {
    match (a, b) {
        (None, None) => Ordering::Equal,
        (None, Some(_)) => Ordering::Less,
        (Some(_), None) => Ordering::Greater,
        (Some(a), Some(b)) => {
            let rank = type_rank(a).cmp(&type_rank(b));
            if rank != Ordering::Equal {
                return rank;
            }
            match (a, b) {
                (Value::Bool(x), Value::Bool(y)) => x.cmp(y),
                (Value::Number(x), Value::Number(y)) => {
                    x.partial_cmp(y).unwrap_or(Ordering::Equal)
                }
                (Value::String(x), Value::String(y)) => x.cmp(y),
                (Value::Binary(x), Value::Binary(y)) => x.cmp(y),
                _ => Ordering::Equal,
            }
        }
    }
}

fn type_rank(value: &Value) -> u8 {
    match value {
        Value::Null => 0,
        Value::Bool(_) => 1,
        Value::Number(_) => 2,
        Value::String(_) => 3,
        Value::Binary(_) => 4,
        Value::List(_) => 5,
        Value::Map(_) => 6,
        Value::Relation(_) => 7,
    }
}

fn project(doc: &mut Document, projection: &Projection) {
    match projection {
        Projection::Include(fields) => {
            // The id always survives an inclusion projection.
            doc.retain(|key, _| key == ID_FIELD || fields.iter().any(|f| f == key));
        }
        Projection::Exclude(fields) => {
            doc.retain(|key, _| !fields.iter().any(|f| f == key));
        }
    }
}

// Regex conditions compile as {$regex, $options} pairs; evaluation needs
// both together, so filter matching special-cases that shape before falling
// back to per-operator checks.
fn regex_with_options(operators: &Document) -> Option<regex::Regex> {
    let pattern = operators.get("$regex")?.as_str()?;
    let flags = operators
        .get("$options")
        .and_then(Value::as_str)
        .unwrap_or("");
    regex::RegexBuilder::new(pattern)
        .case_insensitive(flags.contains('i'))
        .multi_line(flags.contains('m'))
        .dot_matches_new_line(flags.contains('s'))
        .build()
        .ok()
}
