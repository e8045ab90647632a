//! Query building and execution.
//!
//! A [`Query`] accumulates conditions against one collection and executes
//! finds, counts, and map-reduce runs under a configurable cache policy.

pub mod condition;
pub mod map_reduce;

use crate::cache::QueryKey;
use crate::client::ClientInner;
use crate::dispatch::CancelHandle;
use crate::error::{CoreResult, Error};
use crate::policy::{self, CachePolicy, Delivery};
use crate::transport::{WireRequest, WireResponse};
use crate::types::{EntityId, ID_FIELD, SEQUENCE_FIELD};
use crate::value::{Document, Value};
use condition::{CompiledRead, ConditionOp, ConditionSet, RegexOptions, SortDirection, Target};
use map_reduce::MapReduce;
use std::sync::Arc;
use tracing::debug;

use crate::entity::Entity;

/// A query over one remote collection.
///
/// Conditions accumulate through the `where_*` builders; [`Query::or`] and
/// [`Query::and`] open logical groups. Execution happens through
/// [`find_all`](Query::find_all) and friends, each of which also has a
/// non-blocking `*_in_background` form whose completion runs on the
/// client's dispatch thread (so it must not issue blocking calls on the
/// same client).
pub struct Query {
    client: Arc<ClientInner>,
    conditions: ConditionSet,
    cache_policy: CachePolicy,
    map_reduce: Option<MapReduce>,
}

impl Query {
    pub(crate) fn new(client: Arc<ClientInner>, collection: String) -> Self {
        Self {
            client,
            conditions: ConditionSet::new(collection),
            cache_policy: CachePolicy::default(),
            map_reduce: None,
        }
    }

    /// The collection this query targets.
    #[must_use]
    pub fn collection(&self) -> &str {
        self.conditions.collection()
    }

    /// The policy governing cache/network execution for reads.
    #[must_use]
    pub fn cache_policy(&self) -> CachePolicy {
        self.cache_policy
    }

    /// Sets the cache policy for subsequent reads.
    pub fn set_cache_policy(&mut self, policy: CachePolicy) -> &mut Self {
        self.cache_policy = policy;
        self
    }

    /// Sets the map-reduce descriptor used by
    /// [`perform_map_reduce`](Query::perform_map_reduce).
    pub fn set_map_reduce(&mut self, descriptor: MapReduce) -> &mut Self {
        self.map_reduce = Some(descriptor);
        self
    }

    /// Clears all conditions, sort, paging, projection, and map-reduce
    /// state. The collection and cache policy are preserved.
    pub fn reset(&mut self) {
        self.conditions.reset();
        self.map_reduce = None;
    }

    fn base(&mut self) -> GroupProxy<'_> {
        GroupProxy {
            conditions: &mut self.conditions,
            target: Target::Base,
        }
    }

    /// Opens an OR group: conditions added through the returned proxy are
    /// alternatives of one another.
    ///
    /// The proxy is a view into this query, not a separate one: it shares
    /// the query's sort, paging, and projection state.
    pub fn or(&mut self) -> GroupProxy<'_> {
        let index = self.conditions.open_or_group();
        GroupProxy {
            conditions: &mut self.conditions,
            target: Target::Or(index),
        }
    }

    /// Opens an AND group: conditions added through the returned proxy must
    /// all hold.
    pub fn and(&mut self) -> GroupProxy<'_> {
        let index = self.conditions.open_and_group();
        GroupProxy {
            conditions: &mut self.conditions,
            target: Target::And(index),
        }
    }

    /// Requires `field == value`.
    pub fn where_equal(&mut self, field: &str, value: impl Into<Value>) -> &mut Self {
        self.base().where_equal(field, value);
        self
    }

    /// Requires `field != value`.
    pub fn where_not_equal(&mut self, field: &str, value: impl Into<Value>) -> &mut Self {
        self.base().where_not_equal(field, value);
        self
    }

    /// Requires `field < value`.
    pub fn where_less_than(&mut self, field: &str, value: impl Into<Value>) -> &mut Self {
        self.base().where_less_than(field, value);
        self
    }

    /// Requires `field <= value`.
    pub fn where_less_or_equal(&mut self, field: &str, value: impl Into<Value>) -> &mut Self {
        self.base().where_less_or_equal(field, value);
        self
    }

    /// Requires `field > value`.
    pub fn where_greater_than(&mut self, field: &str, value: impl Into<Value>) -> &mut Self {
        self.base().where_greater_than(field, value);
        self
    }

    /// Requires `field >= value`.
    pub fn where_greater_or_equal(&mut self, field: &str, value: impl Into<Value>) -> &mut Self {
        self.base().where_greater_or_equal(field, value);
        self
    }

    /// Requires the field's value to be one of the given values.
    pub fn where_contained_in(&mut self, field: &str, values: Vec<Value>) -> &mut Self {
        self.base().where_contained_in(field, values);
        self
    }

    /// Requires the field's value to be none of the given values.
    pub fn where_not_contained_in(&mut self, field: &str, values: Vec<Value>) -> &mut Self {
        self.base().where_not_contained_in(field, values);
        self
    }

    /// Requires the field's list to contain every given value.
    pub fn where_contains_all(&mut self, field: &str, values: Vec<Value>) -> &mut Self {
        self.base().where_contains_all(field, values);
        self
    }

    /// Requires the field to match a regex under the given options.
    pub fn where_matches_regex(
        &mut self,
        field: &str,
        pattern: impl Into<String>,
        options: RegexOptions,
    ) -> &mut Self {
        self.base().where_matches_regex(field, pattern, options);
        self
    }

    /// Requires the field's string to contain the given substring.
    pub fn where_contains(&mut self, field: &str, substring: &str) -> &mut Self {
        self.base().where_contains(field, substring);
        self
    }

    /// Requires the field's string to start with the given prefix.
    pub fn where_has_prefix(&mut self, field: &str, prefix: &str) -> &mut Self {
        self.base().where_has_prefix(field, prefix);
        self
    }

    /// Requires the field's string to end with the given suffix.
    pub fn where_has_suffix(&mut self, field: &str, suffix: &str) -> &mut Self {
        self.base().where_has_suffix(field, suffix);
        self
    }

    /// Requires the field to be present.
    pub fn where_key_exists(&mut self, field: &str) -> &mut Self {
        self.base().where_key_exists(field);
        self
    }

    /// Requires the field to be absent.
    pub fn where_key_does_not_exist(&mut self, field: &str) -> &mut Self {
        self.base().where_key_does_not_exist(field);
        self
    }

    /// Requires the record id to equal the given id.
    pub fn where_id(&mut self, id: impl Into<EntityId>) -> &mut Self {
        self.base().where_id(id);
        self
    }

    /// Requires the record's sequence number to equal the given value.
    pub fn where_sequence_number(&mut self, sequence: u64) -> &mut Self {
        self.base().where_sequence_number(sequence);
        self
    }

    /// Sorts ascending by `field`; earlier sort keys break ties first.
    pub fn order_ascending(&mut self, field: &str) -> &mut Self {
        self.conditions.order_by(field, SortDirection::Ascending);
        self
    }

    /// Sorts descending by `field`.
    pub fn order_descending(&mut self, field: &str) -> &mut Self {
        self.conditions.order_by(field, SortDirection::Descending);
        self
    }

    /// Caps the number of results; `0` means unbounded.
    pub fn set_limit(&mut self, limit: u64) -> &mut Self {
        self.conditions.set_limit(limit);
        self
    }

    /// Skips the first `skip` matching records.
    pub fn set_skip(&mut self, skip: u64) -> &mut Self {
        self.conditions.set_skip(skip);
        self
    }

    /// The current result limit.
    #[must_use]
    pub fn limit(&self) -> u64 {
        self.conditions.limit()
    }

    /// The current skip offset.
    #[must_use]
    pub fn skip(&self) -> u64 {
        self.conditions.skip()
    }

    /// Moves the skip offset forward, for page-by-page fetching.
    pub fn advance_skip(&mut self, delta: u64) -> &mut Self {
        let skip = self.conditions.skip().saturating_add(delta);
        self.conditions.set_skip(skip);
        self
    }

    /// Restricts results to the named fields. Clears any exclusion.
    pub fn include_fields<I, S>(&mut self, fields: I) -> &mut Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.conditions.include_fields(fields);
        self
    }

    /// Drops the named fields from results. Clears any inclusion.
    pub fn exclude_fields<I, S>(&mut self, fields: I) -> &mut Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.conditions.exclude_fields(fields);
        self
    }

    /// Asks the server to resolve the relation stored at `field` inline.
    pub fn include_relation_at(&mut self, field: &str) -> &mut Self {
        self.conditions.include_relation_at(field);
        self
    }

    /// Compiles the current conditions into a read request.
    #[must_use]
    pub fn compile_read(&self) -> CompiledRead {
        self.conditions.compile_read()
    }

    /// Finds all matching entities, blocking until results arrive.
    pub fn find_all(&self) -> CoreResult<Vec<Entity>> {
        let read = self.compile_read();
        let key = QueryKey::for_read(&read);
        let request = WireRequest::Find { read, one: false };
        debug!(collection = %self.collection(), policy = ?self.cache_policy, "executing find");
        let response = policy::fetch_blocking(
            &self.client.dispatcher,
            &self.client.cache,
            request,
            key,
            self.cache_policy,
        )?;
        entities_from_response(&self.client, self.collection(), response)
    }

    /// Finds all matching entities without blocking.
    ///
    /// Under [`CachePolicy::CacheThenNetwork`] with a warm cache the
    /// completion is invoked twice: first with the cached result
    /// (`is_final` false), then with the network result (`is_final` true).
    pub fn find_all_in_background<F>(&self, mut completion: F) -> CoreResult<CancelHandle>
    where
        F: FnMut(CoreResult<Delivery<Vec<Entity>>>) + Send + 'static,
    {
        let read = self.compile_read();
        let key = QueryKey::for_read(&read);
        let request = WireRequest::Find { read, one: false };
        let client = Arc::clone(&self.client);
        let collection = self.collection().to_owned();
        policy::fetch_in_background(
            &self.client.dispatcher,
            Arc::clone(&self.client.cache),
            request,
            key,
            self.cache_policy,
            Box::new(move |outcome| {
                completion(outcome.and_then(|delivery| {
                    let source = delivery.source;
                    let is_final = delivery.is_final;
                    entities_from_response(&client, &collection, delivery.value).map(|entities| {
                        Delivery {
                            value: entities,
                            source,
                            is_final,
                        }
                    })
                }));
            }),
        )
    }

    /// Finds the first matching entity.
    ///
    /// Equivalent to a find with the limit forced to `1`.
    pub fn find_one(&self) -> CoreResult<Option<Entity>> {
        let mut read = self.compile_read();
        read.limit = 1;
        let key = QueryKey::for_read(&read);
        let request = WireRequest::Find { read, one: true };
        let response = policy::fetch_blocking(
            &self.client.dispatcher,
            &self.client.cache,
            request,
            key,
            self.cache_policy,
        )?;
        Ok(entities_from_response(&self.client, self.collection(), response)?.into_iter().next())
    }

    /// Finds the first matching entity without blocking.
    pub fn find_one_in_background<F>(&self, mut completion: F) -> CoreResult<CancelHandle>
    where
        F: FnMut(CoreResult<Delivery<Option<Entity>>>) + Send + 'static,
    {
        let mut read = self.compile_read();
        read.limit = 1;
        let key = QueryKey::for_read(&read);
        let request = WireRequest::Find { read, one: true };
        let client = Arc::clone(&self.client);
        let collection = self.collection().to_owned();
        policy::fetch_in_background(
            &self.client.dispatcher,
            Arc::clone(&self.client.cache),
            request,
            key,
            self.cache_policy,
            Box::new(move |outcome| {
                completion(outcome.and_then(|delivery| {
                    let source = delivery.source;
                    let is_final = delivery.is_final;
                    entities_from_response(&client, &collection, delivery.value).map(|entities| {
                        Delivery {
                            value: entities.into_iter().next(),
                            source,
                            is_final,
                        }
                    })
                }));
            }),
        )
    }

    /// Fetches the entity with the given id.
    ///
    /// Ignores all staged conditions; fails with [`Error::NotFound`] when
    /// no record has that id.
    pub fn find_by_id(&self, id: impl Into<EntityId>) -> CoreResult<Entity> {
        let id = id.into();
        let mut filter = Document::new();
        filter.insert(ID_FIELD.to_owned(), Value::from(id.as_str()));
        let read = CompiledRead {
            collection: self.collection().to_owned(),
            filter,
            sort: Vec::new(),
            skip: 0,
            limit: 1,
            projection: None,
            includes: Vec::new(),
        };
        let key = QueryKey::for_read(&read);
        let request = WireRequest::Find { read, one: true };
        let response = policy::fetch_blocking(
            &self.client.dispatcher,
            &self.client.cache,
            request,
            key,
            self.cache_policy,
        )?;
        entities_from_response(&self.client, self.collection(), response)?
            .into_iter()
            .next()
            .ok_or_else(|| Error::not_found(format!("no record with id {id}")))
    }

    /// Counts matching records.
    pub fn count_all(&self) -> CoreResult<u64> {
        let read = self.compile_read();
        let key = QueryKey::for_read(&read);
        let request = WireRequest::Count { read };
        let response = policy::fetch_blocking(
            &self.client.dispatcher,
            &self.client.cache,
            request,
            key,
            self.cache_policy,
        )?;
        count_from_response(response)
    }

    /// Counts matching records without blocking.
    pub fn count_all_in_background<F>(&self, mut completion: F) -> CoreResult<CancelHandle>
    where
        F: FnMut(CoreResult<Delivery<u64>>) + Send + 'static,
    {
        let read = self.compile_read();
        let key = QueryKey::for_read(&read);
        let request = WireRequest::Count { read };
        policy::fetch_in_background(
            &self.client.dispatcher,
            Arc::clone(&self.client.cache),
            request,
            key,
            self.cache_policy,
            Box::new(move |outcome| {
                completion(outcome.and_then(|delivery| {
                    let source = delivery.source;
                    let is_final = delivery.is_final;
                    count_from_response(delivery.value).map(|count| Delivery {
                        value: count,
                        source,
                        is_final,
                    })
                }));
            }),
        )
    }

    /// Runs the configured map-reduce over matching records, blocking until
    /// the result arrives.
    ///
    /// Map-reduce is incompatible with `skip` and `sort`; both are dropped
    /// from the compiled request. The query cache is bypassed, and the
    /// descriptor's result processor is applied to the raw result before it
    /// is returned.
    pub fn perform_map_reduce(&self) -> CoreResult<Value> {
        let (request, descriptor) = self.map_reduce_request()?;
        let response = self.client.dispatcher.execute_blocking(request)?;
        Ok(descriptor.process(raw_from_response(response)))
    }

    /// Runs the configured map-reduce without blocking.
    pub fn perform_map_reduce_in_background<F>(&self, completion: F) -> CoreResult<CancelHandle>
    where
        F: FnOnce(CoreResult<Value>) + Send + 'static,
    {
        let (request, descriptor) = self.map_reduce_request()?;
        let handle = CancelHandle::new();
        let token = handle.clone();
        self.client.dispatcher.submit(Box::new(move |transport| {
            let outcome = transport
                .execute(&request)
                .map_err(Error::from)
                .map(|response| descriptor.process(raw_from_response(response)));
            if !token.is_cancelled() {
                completion(outcome);
            }
        }))?;
        Ok(handle)
    }

    fn map_reduce_request(&self) -> CoreResult<(WireRequest, MapReduce)> {
        let descriptor = self
            .map_reduce
            .clone()
            .ok_or_else(|| Error::invalid_value("query has no map-reduce descriptor"))?;
        let mut read = self.compile_read();
        // Documented incompatibility: map-reduce ignores skip and sort.
        read.skip = 0;
        read.sort.clear();
        let request = WireRequest::MapReduce {
            read,
            job: descriptor.compile(),
        };
        Ok((request, descriptor))
    }
}

/// Scoped handle appending conditions to one logical group of a query.
///
/// Returned by [`Query::or`] and [`Query::and`]. The proxy writes into its
/// parent query; it carries no state of its own.
pub struct GroupProxy<'a> {
    conditions: &'a mut ConditionSet,
    target: Target,
}

impl GroupProxy<'_> {
    fn add(&mut self, field: &str, op: ConditionOp) -> &mut Self {
        self.conditions.add(self.target, field, op);
        self
    }

    /// Requires `field == value`.
    pub fn where_equal(&mut self, field: &str, value: impl Into<Value>) -> &mut Self {
        self.add(field, ConditionOp::Equal(value.into()))
    }

    /// Requires `field != value`.
    pub fn where_not_equal(&mut self, field: &str, value: impl Into<Value>) -> &mut Self {
        self.add(field, ConditionOp::NotEqual(value.into()))
    }

    /// Requires `field < value`.
    pub fn where_less_than(&mut self, field: &str, value: impl Into<Value>) -> &mut Self {
        self.add(field, ConditionOp::LessThan(value.into()))
    }

    /// Requires `field <= value`.
    pub fn where_less_or_equal(&mut self, field: &str, value: impl Into<Value>) -> &mut Self {
        self.add(field, ConditionOp::LessOrEqual(value.into()))
    }

    /// Requires `field > value`.
    pub fn where_greater_than(&mut self, field: &str, value: impl Into<Value>) -> &mut Self {
        self.add(field, ConditionOp::GreaterThan(value.into()))
    }

    /// Requires `field >= value`.
    pub fn where_greater_or_equal(&mut self, field: &str, value: impl Into<Value>) -> &mut Self {
        self.add(field, ConditionOp::GreaterOrEqual(value.into()))
    }

    /// Requires the field's value to be one of the given values.
    pub fn where_contained_in(&mut self, field: &str, values: Vec<Value>) -> &mut Self {
        self.add(field, ConditionOp::ContainedIn(values))
    }

    /// Requires the field's value to be none of the given values.
    pub fn where_not_contained_in(&mut self, field: &str, values: Vec<Value>) -> &mut Self {
        self.add(field, ConditionOp::NotContainedIn(values))
    }

    /// Requires the field's list to contain every given value.
    pub fn where_contains_all(&mut self, field: &str, values: Vec<Value>) -> &mut Self {
        self.add(field, ConditionOp::ContainsAll(values))
    }

    /// Requires the field to match a regex under the given options.
    pub fn where_matches_regex(
        &mut self,
        field: &str,
        pattern: impl Into<String>,
        options: RegexOptions,
    ) -> &mut Self {
        self.add(
            field,
            ConditionOp::MatchesRegex {
                pattern: pattern.into(),
                options,
            },
        )
    }

    /// Requires the field's string to contain the given substring.
    pub fn where_contains(&mut self, field: &str, substring: &str) -> &mut Self {
        self.add(
            field,
            ConditionOp::MatchesRegex {
                pattern: condition::regex_escape(substring),
                options: RegexOptions::default(),
            },
        )
    }

    /// Requires the field's string to start with the given prefix.
    pub fn where_has_prefix(&mut self, field: &str, prefix: &str) -> &mut Self {
        self.add(
            field,
            ConditionOp::MatchesRegex {
                pattern: format!("^{}", condition::regex_escape(prefix)),
                options: RegexOptions::default(),
            },
        )
    }

    /// Requires the field's string to end with the given suffix.
    pub fn where_has_suffix(&mut self, field: &str, suffix: &str) -> &mut Self {
        self.add(
            field,
            ConditionOp::MatchesRegex {
                pattern: format!("{}$", condition::regex_escape(suffix)),
                options: RegexOptions::default(),
            },
        )
    }

    /// Requires the field to be present.
    pub fn where_key_exists(&mut self, field: &str) -> &mut Self {
        self.add(field, ConditionOp::Exists(true))
    }

    /// Requires the field to be absent.
    pub fn where_key_does_not_exist(&mut self, field: &str) -> &mut Self {
        self.add(field, ConditionOp::Exists(false))
    }

    /// Requires the record id to equal the given id.
    pub fn where_id(&mut self, id: impl Into<EntityId>) -> &mut Self {
        let id = id.into();
        self.add(ID_FIELD, ConditionOp::Equal(Value::from(id.as_str())))
    }

    /// Requires the record's sequence number to equal the given value.
    pub fn where_sequence_number(&mut self, sequence: u64) -> &mut Self {
        self.add(
            SEQUENCE_FIELD,
            ConditionOp::Equal(Value::from(sequence as i64)),
        )
    }
}

fn entities_from_response(
    client: &Arc<ClientInner>,
    collection: &str,
    response: WireResponse,
) -> CoreResult<Vec<Entity>> {
    match response {
        WireResponse::Documents(documents) => Ok(documents
            .into_iter()
            .map(|doc| Entity::from_document(Arc::clone(client), collection.to_owned(), doc))
            .collect()),
        WireResponse::Document(document) => Ok(vec![Entity::from_document(
            Arc::clone(client),
            collection.to_owned(),
            document,
        )]),
        other => Err(Error::transport(format!(
            "unexpected response to find: {other:?}"
        ))),
    }
}

fn count_from_response(response: WireResponse) -> CoreResult<u64> {
    match response {
        WireResponse::Count(count) => Ok(count),
        other => Err(Error::transport(format!(
            "unexpected response to count: {other:?}"
        ))),
    }
}

fn raw_from_response(response: WireResponse) -> Value {
    match response {
        WireResponse::Raw(value) => value,
        WireResponse::Documents(documents) => {
            Value::List(documents.into_iter().map(Value::Map).collect())
        }
        WireResponse::Document(document) => Value::Map(document),
        WireResponse::Count(count) => Value::from(count as i64),
        WireResponse::None => Value::Null,
    }
}
