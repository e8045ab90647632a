//! Query condition accumulation and filter compilation.
//!
//! A [`ConditionSet`] collects base conditions (implicit AND), OR/AND
//! groups, sort order, paging, projection, and relation inclusion, and
//! compiles them into the wire filter document.

use crate::value::{Document, Value};
use serde::Serialize;

/// Sort direction for one sort key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortDirection {
    /// Smallest values first.
    Ascending,
    /// Largest values first.
    Descending,
}

impl SortDirection {
    /// Wire encoding: `1` ascending, `-1` descending.
    #[must_use]
    pub fn wire(self) -> i8 {
        match self {
            SortDirection::Ascending => 1,
            SortDirection::Descending => -1,
        }
    }
}

/// Options for a regex match condition.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RegexOptions {
    /// Match letters regardless of case.
    pub case_insensitive: bool,
    /// `^` and `$` match at line boundaries.
    pub multiline: bool,
    /// `.` also matches newlines.
    pub dot_matches_newline: bool,
}

impl RegexOptions {
    /// Compiles the options into the wire flag string over `{i, m, s}`.
    #[must_use]
    pub fn flags(&self) -> String {
        let mut flags = String::new();
        if self.case_insensitive {
            flags.push('i');
        }
        if self.multiline {
            flags.push('m');
        }
        if self.dot_matches_newline {
            flags.push('s');
        }
        flags
    }
}

/// A single staged condition.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct Condition {
    pub(crate) field: String,
    pub(crate) op: ConditionOp,
}

/// The comparison a condition applies to its field.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum ConditionOp {
    Equal(Value),
    NotEqual(Value),
    LessThan(Value),
    LessOrEqual(Value),
    GreaterThan(Value),
    GreaterOrEqual(Value),
    ContainedIn(Vec<Value>),
    NotContainedIn(Vec<Value>),
    ContainsAll(Vec<Value>),
    MatchesRegex {
        pattern: String,
        options: RegexOptions,
    },
    Exists(bool),
}

/// Which condition list a builder call appends to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Target {
    /// The base list (implicit AND).
    Base,
    /// An OR group by index.
    Or(usize),
    /// An AND group by index.
    And(usize),
}

/// Field projection: which fields a read returns.
///
/// Include and exclude are mutually exclusive; setting one clears the other.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum Projection {
    /// Return only the named fields.
    Include(Vec<String>),
    /// Return everything except the named fields.
    Exclude(Vec<String>),
}

/// A compiled, wire-ready read request.
///
/// This is the value-equality identity of a read: two reads with equal
/// compiled state are the same read no matter which query built them.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CompiledRead {
    /// Target collection.
    pub collection: String,
    /// Compiled filter document.
    pub filter: Document,
    /// Sort keys in priority order, with wire directions.
    pub sort: Vec<(String, i8)>,
    /// Number of matching records to skip.
    pub skip: u64,
    /// Maximum number of records to return; `0` means unbounded.
    pub limit: u64,
    /// Optional field projection.
    pub projection: Option<Projection>,
    /// Fields whose relation references the server resolves inline.
    pub includes: Vec<String>,
}

/// Accumulated filter/sort/projection state for one query.
#[derive(Debug, Clone, PartialEq)]
pub struct ConditionSet {
    collection: String,
    base: Vec<Condition>,
    or_groups: Vec<Vec<Condition>>,
    and_groups: Vec<Vec<Condition>>,
    sort: Vec<(String, SortDirection)>,
    limit: u64,
    skip: u64,
    projection: Option<Projection>,
    includes: Vec<String>,
}

impl ConditionSet {
    /// Creates an empty condition set for a collection.
    #[must_use]
    pub fn new(collection: impl Into<String>) -> Self {
        Self {
            collection: collection.into(),
            base: Vec::new(),
            or_groups: Vec::new(),
            and_groups: Vec::new(),
            sort: Vec::new(),
            limit: 0,
            skip: 0,
            projection: None,
            includes: Vec::new(),
        }
    }

    /// The collection this query targets.
    #[must_use]
    pub fn collection(&self) -> &str {
        &self.collection
    }

    pub(crate) fn add(&mut self, target: Target, field: impl Into<String>, op: ConditionOp) {
        let condition = Condition {
            field: field.into(),
            op,
        };
        match target {
            Target::Base => self.base.push(condition),
            Target::Or(index) => self.or_groups[index].push(condition),
            Target::And(index) => self.and_groups[index].push(condition),
        }
    }

    /// Opens a new OR group and returns its index.
    pub(crate) fn open_or_group(&mut self) -> usize {
        self.or_groups.push(Vec::new());
        self.or_groups.len() - 1
    }

    /// Opens a new AND group and returns its index.
    pub(crate) fn open_and_group(&mut self) -> usize {
        self.and_groups.push(Vec::new());
        self.and_groups.len() - 1
    }

    /// Adds or updates a sort key.
    ///
    /// Re-setting a field's direction overwrites the direction but keeps the
    /// field's original position in the tie-break order.
    pub fn order_by(&mut self, field: impl Into<String>, direction: SortDirection) {
        let field = field.into();
        if let Some(entry) = self.sort.iter_mut().find(|(name, _)| *name == field) {
            entry.1 = direction;
        } else {
            self.sort.push((field, direction));
        }
    }

    /// Sets the maximum result count; `0` means unbounded.
    pub fn set_limit(&mut self, limit: u64) {
        self.limit = limit;
    }

    /// Sets the number of matching records to skip.
    pub fn set_skip(&mut self, skip: u64) {
        self.skip = skip;
    }

    /// The current result limit.
    #[must_use]
    pub fn limit(&self) -> u64 {
        self.limit
    }

    /// The current skip offset.
    #[must_use]
    pub fn skip(&self) -> u64 {
        self.skip
    }

    /// Restricts results to the named fields. Clears any exclusion.
    pub fn include_fields<I, S>(&mut self, fields: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.projection = Some(Projection::Include(
            fields.into_iter().map(Into::into).collect(),
        ));
    }

    /// Drops the named fields from results. Clears any inclusion.
    pub fn exclude_fields<I, S>(&mut self, fields: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.projection = Some(Projection::Exclude(
            fields.into_iter().map(Into::into).collect(),
        ));
    }

    /// The current projection, if any.
    #[must_use]
    pub fn projection(&self) -> Option<&Projection> {
        self.projection.as_ref()
    }

    /// Asks the server to resolve the relation stored at `field` inline.
    pub fn include_relation_at(&mut self, field: impl Into<String>) {
        let field = field.into();
        if !self.includes.contains(&field) {
            self.includes.push(field);
        }
    }

    /// Clears all condition, sort, paging, and projection state.
    ///
    /// The collection name is preserved.
    pub fn reset(&mut self) {
        let collection = std::mem::take(&mut self.collection);
        *self = Self::new(collection);
    }

    /// Compiles the staged conditions into a filter document.
    ///
    /// Base conditions form an implicit-AND document. The first OR group
    /// compiles to a top-level `$or` clause; further OR groups and all AND
    /// groups nest under `$and`, since the wire format accepts only one
    /// `$or` key per document level.
    #[must_use]
    pub fn compile_filter(&self) -> Document {
        let mut filter = compile_conditions(&self.base);
        let mut and_clauses: Vec<Value> = Vec::new();

        let mut first_or_used = false;
        for group in &self.or_groups {
            if group.is_empty() {
                continue;
            }
            let alternatives = Value::List(
                group
                    .iter()
                    .map(|condition| Value::Map(compile_conditions(std::slice::from_ref(condition))))
                    .collect(),
            );
            if !first_or_used {
                first_or_used = true;
                filter.insert("$or".to_owned(), alternatives);
            } else {
                let mut clause = Document::new();
                clause.insert("$or".to_owned(), alternatives);
                and_clauses.push(Value::Map(clause));
            }
        }

        for group in &self.and_groups {
            if group.is_empty() {
                continue;
            }
            and_clauses.push(Value::Map(compile_conditions(group)));
        }

        if !and_clauses.is_empty() {
            filter.insert("$and".to_owned(), Value::List(and_clauses));
        }

        filter
    }

    /// Compiles the full read request.
    #[must_use]
    pub fn compile_read(&self) -> CompiledRead {
        CompiledRead {
            collection: self.collection.clone(),
            filter: self.compile_filter(),
            sort: self
                .sort
                .iter()
                .map(|(field, direction)| (field.clone(), direction.wire()))
                .collect(),
            skip: self.skip,
            limit: self.limit,
            projection: self.projection.clone(),
            includes: self.includes.clone(),
        }
    }
}

/// Compiles an ordered condition list into an implicit-AND document.
///
/// An Equal condition replaces the field's entry outright. Comparison
/// operators merge into the field's operator sub-document, which is how a
/// range over one field stays expressible; a comparison following an Equal
/// rebuilds the field as an operator document.
fn compile_conditions(conditions: &[Condition]) -> Document {
    let mut doc = Document::new();
    for condition in conditions {
        match &condition.op {
            ConditionOp::Equal(value) => {
                doc.insert(condition.field.clone(), value.clone());
            }
            op => {
                let pairs = operator_pairs(op);
                match doc.entry(condition.field.clone()) {
                    std::collections::btree_map::Entry::Occupied(mut entry) => {
                        match entry.get_mut() {
                            Value::Map(existing) if is_operator_doc(existing) => {
                                existing.extend(pairs);
                            }
                            other => *other = Value::Map(pairs.into_iter().collect()),
                        }
                    }
                    std::collections::btree_map::Entry::Vacant(entry) => {
                        entry.insert(Value::Map(pairs.into_iter().collect()));
                    }
                }
            }
        }
    }
    doc
}

fn is_operator_doc(doc: &Document) -> bool {
    !doc.is_empty() && doc.keys().all(|key| key.starts_with('$'))
}

fn operator_pairs(op: &ConditionOp) -> Vec<(String, Value)> {
    match op {
        ConditionOp::Equal(_) => unreachable!("equality compiles to a direct value"),
        ConditionOp::NotEqual(value) => vec![("$ne".to_owned(), value.clone())],
        ConditionOp::LessThan(value) => vec![("$lt".to_owned(), value.clone())],
        ConditionOp::LessOrEqual(value) => vec![("$lte".to_owned(), value.clone())],
        ConditionOp::GreaterThan(value) => vec![("$gt".to_owned(), value.clone())],
        ConditionOp::GreaterOrEqual(value) => vec![("$gte".to_owned(), value.clone())],
        ConditionOp::ContainedIn(values) => {
            vec![("$in".to_owned(), Value::List(values.clone()))]
        }
        ConditionOp::NotContainedIn(values) => {
            vec![("$nin".to_owned(), Value::List(values.clone()))]
        }
        ConditionOp::ContainsAll(values) => {
            vec![("$all".to_owned(), Value::List(values.clone()))]
        }
        ConditionOp::MatchesRegex { pattern, options } => {
            let mut pairs = vec![("$regex".to_owned(), Value::from(pattern.as_str()))];
            let flags = options.flags();
            if !flags.is_empty() {
                pairs.push(("$options".to_owned(), Value::from(flags)));
            }
            pairs
        }
        ConditionOp::Exists(exists) => vec![("$exists".to_owned(), Value::Bool(*exists))],
    }
}

/// Escapes regex metacharacters so a literal string matches itself.
#[must_use]
pub fn regex_escape(literal: &str) -> String {
    let mut escaped = String::with_capacity(literal.len());
    for c in literal.chars() {
        if matches!(
            c,
            '\\' | '^' | '$' | '.' | '|' | '?' | '*' | '+' | '(' | ')' | '[' | ']' | '{' | '}'
        ) {
            escaped.push('\\');
        }
        escaped.push(c);
    }
    escaped
}
