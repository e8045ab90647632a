//! End-to-end tests driving the public client surface against the
//! in-memory server, so update-operator and filter semantics are exercised
//! through a real transport rather than scripted responses.

use farstore_core::{
    CachePolicy, Document, Error, RegexOptions, ResultSource, TransportError, Value,
};
use farstore_testkit::{init_test_logging, scenarios, TestStore};
use std::sync::mpsc::channel;

#[test]
fn first_save_assigns_server_fields() {
    init_test_logging();
    let store = TestStore::new();

    let entity = store.client.entity("users");
    entity.set("name", "ada").unwrap();
    entity.increment_by("logins", 2i64).unwrap();
    entity.save().unwrap();

    assert!(!entity.is_new());
    assert!(!entity.is_dirty());
    assert!(entity.created_at().is_some());
    assert!(entity.updated_at().is_some());
    assert_eq!(entity.sequence_number().map(|s| s.as_u64()), Some(1));
    assert_eq!(entity.get("logins"), Some(Value::from(2i64)));
}

#[test]
fn increments_accumulate_against_the_stored_value() {
    let store = TestStore::new();

    let entity = store.client.entity("counters");
    entity.increment_by("hits", 3i64).unwrap();
    entity.increment_by("hits", 4i64).unwrap();
    entity.save().unwrap();
    assert_eq!(entity.get("hits"), Some(Value::from(7i64)));

    // A second save increments from the stored value, not from zero.
    entity.increment_by("hits", 10i64).unwrap();
    entity.save().unwrap();
    assert_eq!(entity.get("hits"), Some(Value::from(17i64)));
}

#[test]
fn list_operations_apply_after_the_first_save() {
    let store = TestStore::new();

    let entity = store.client.entity("posts");
    entity.set("title", "hello").unwrap();
    entity.save().unwrap();

    entity.push("tags", "a").unwrap();
    entity.save().unwrap();
    entity
        .push_all("tags", vec![Value::from("b"), Value::from("c")])
        .unwrap();
    entity.save().unwrap();
    assert_eq!(
        entity.get("tags"),
        Some(Value::List(vec![
            Value::from("a"),
            Value::from("b"),
            Value::from("c")
        ]))
    );

    // addToSet skips the existing element.
    entity.add_to_set("tags", "b").unwrap();
    entity.add_to_set("tags", "d").unwrap();
    entity.save().unwrap();
    assert_eq!(
        entity.get("tags"),
        Some(Value::List(vec![
            Value::from("a"),
            Value::from("b"),
            Value::from("c"),
            Value::from("d")
        ]))
    );

    entity.pop_first("tags").unwrap();
    entity.save().unwrap();
    entity.pop_last("tags").unwrap();
    entity.save().unwrap();
    assert_eq!(
        entity.get("tags"),
        Some(Value::List(vec![Value::from("b"), Value::from("c")]))
    );

    entity.pull("tags", "b").unwrap();
    entity.save().unwrap();
    assert_eq!(entity.get("tags"), Some(Value::List(vec![Value::from("c")])));
}

#[test]
fn list_operations_on_a_new_entity_leave_no_trace() {
    let store = TestStore::new();

    let entity = store.client.entity("posts");
    entity.set("title", "hello").unwrap();
    entity.push("tags", "a").unwrap();
    entity.pop_last("tags").unwrap();
    entity.pull("tags", "b").unwrap();
    entity.save().unwrap();

    // Only the set survived compilation; the server never saw a tags field.
    assert_eq!(entity.get("title"), Some(Value::from("hello")));
    assert_eq!(entity.get("tags"), None);
}

#[test]
fn range_query_bounds_both_ends() {
    // Ages 20..=29.
    let store = scenarios::store_with_users(10);

    let mut query = store.client.query("users");
    query
        .where_greater_than("age", 22i64)
        .where_less_than("age", 26i64);
    let found = query.find_all().unwrap();

    let ages: Vec<Option<Value>> = found.iter().map(|e| e.get("age")).collect();
    assert_eq!(
        ages,
        vec![
            Some(Value::from(23i64)),
            Some(Value::from(24i64)),
            Some(Value::from(25i64))
        ]
    );
}

#[test]
fn sort_skip_and_limit_page_through_results() {
    let store = scenarios::store_with_users(10);

    let mut query = store.client.query("users");
    query.order_descending("age").set_skip(2).set_limit(3);
    let found = query.find_all().unwrap();

    let ages: Vec<Option<Value>> = found.iter().map(|e| e.get("age")).collect();
    assert_eq!(
        ages,
        vec![
            Some(Value::from(27i64)),
            Some(Value::from(26i64)),
            Some(Value::from(25i64))
        ]
    );

    // Paging forward continues where the previous page ended.
    query.advance_skip(3);
    let next = query.find_all().unwrap();
    assert_eq!(next[0].get("age"), Some(Value::from(24i64)));
}

#[test]
fn projection_restricts_returned_fields() {
    let store = scenarios::store_with_users(1);

    let mut query = store.client.query("users");
    query.include_fields(["name"]);
    let found = query.find_all().unwrap();
    assert_eq!(found[0].get("name"), Some(Value::from("user0")));
    assert_eq!(found[0].get("age"), None);
    // The id always comes back.
    assert!(found[0].id().is_some());

    let mut query = store.client.query("users");
    query.exclude_fields(["age"]);
    let found = query.find_all().unwrap();
    assert_eq!(found[0].get("age"), None);
    assert!(found[0].get("name").is_some());
}

#[test]
fn string_matching_operators() {
    let store = TestStore::new();
    for name in ["Ada Lovelace", "Grace Hopper", "adam smith"] {
        let mut doc = Document::new();
        doc.insert("name".into(), Value::from(name));
        store.seed("users", doc);
    }

    let mut query = store.client.query("users");
    query.where_has_prefix("name", "Ada");
    assert_eq!(query.find_all().unwrap().len(), 1);

    let mut query = store.client.query("users");
    query.where_matches_regex(
        "name",
        "^ada",
        RegexOptions {
            case_insensitive: true,
            ..RegexOptions::default()
        },
    );
    assert_eq!(query.find_all().unwrap().len(), 2);

    let mut query = store.client.query("users");
    query.where_contains("name", "Hopper");
    let found = query.find_all().unwrap();
    assert_eq!(found.len(), 1);
    assert_eq!(found[0].get("name"), Some(Value::from("Grace Hopper")));
}

#[test]
fn or_groups_and_key_existence() {
    let store = scenarios::store_with_users(4);
    let mut doc = Document::new();
    doc.insert("name".into(), Value::from("anonymous"));
    store.seed("users", doc);

    let mut query = store.client.query("users");
    query
        .or()
        .where_equal("age", 20i64)
        .where_equal("age", 21i64);
    assert_eq!(query.find_all().unwrap().len(), 2);

    let mut query = store.client.query("users");
    query.where_key_does_not_exist("age");
    let found = query.find_all().unwrap();
    assert_eq!(found.len(), 1);
    assert_eq!(found[0].get("name"), Some(Value::from("anonymous")));
}

#[test]
fn relations_survive_the_wire_and_resolve_inline() {
    let store = TestStore::new();

    let author = store.client.entity("authors");
    author.set("name", "ada").unwrap();
    author.save().unwrap();
    let relation = author.relation().unwrap();

    let post = store.client.entity("posts");
    post.set("title", "on computable numbers").unwrap();
    post.set("author", relation.clone()).unwrap();
    post.save().unwrap();

    // Without inclusion the field reads back as a bare reference.
    let found = store.client.query("posts").find_all().unwrap();
    assert_eq!(found[0].get("author"), Some(Value::Relation(relation)));

    // With inclusion the server resolves the referenced record inline.
    let mut query = store.client.query("posts");
    query.include_relation_at("author");
    let found = query.find_all().unwrap();
    let resolved = found[0].get("author").unwrap();
    let resolved = resolved.as_map().unwrap();
    assert_eq!(resolved.get("name"), Some(&Value::from("ada")));
}

#[test]
fn binary_fields_round_trip() {
    let store = TestStore::new();

    let entity = store.client.entity("blobs");
    entity.set("payload", Value::Binary(vec![0, 1, 2, 255])).unwrap();
    entity.save().unwrap();

    let found = store.client.query("blobs").find_all().unwrap();
    assert_eq!(
        found[0].get("payload"),
        Some(Value::Binary(vec![0, 1, 2, 255]))
    );
}

#[test]
fn refresh_and_delete_against_the_server() {
    let store = TestStore::new();

    let entity = store.client.entity("users");
    entity.set("name", "ada").unwrap();
    entity.save().unwrap();
    let id = entity.id().unwrap();

    // A second handle to the same record sees the update after refresh.
    let twin = store.client.query("users").find_by_id(id.clone()).unwrap();
    entity.set("name", "renamed").unwrap();
    entity.save().unwrap();
    assert_eq!(twin.get("name"), Some(Value::from("ada")));
    twin.refresh().unwrap();
    assert_eq!(twin.get("name"), Some(Value::from("renamed")));

    entity.delete().unwrap();
    assert!(store.server.is_empty("users"));
    assert!(matches!(
        store.client.query("users").find_by_id(id),
        Err(Error::NotFound { .. })
    ));
}

#[test]
fn cache_then_network_delivers_stale_then_fresh() {
    let store = TestStore::new();
    let mut doc = Document::new();
    doc.insert("name".into(), Value::from("ada"));
    store.seed("users", doc);

    // Warm the cache, then change the data behind it.
    let mut query = store.client.query("users");
    query.set_cache_policy(CachePolicy::CacheElseNetwork);
    assert_eq!(query.find_all().unwrap().len(), 1);
    let mut doc = Document::new();
    doc.insert("name".into(), Value::from("grace"));
    store.seed("users", doc);

    query.set_cache_policy(CachePolicy::CacheThenNetwork);
    let (tx, rx) = channel();
    query
        .find_all_in_background(move |outcome| {
            let _ = tx.send(outcome);
        })
        .unwrap();

    let first = rx.recv().unwrap().unwrap();
    assert_eq!(first.source, ResultSource::Cache);
    assert!(!first.is_final);
    assert_eq!(first.value.len(), 1);

    let second = rx.recv().unwrap().unwrap();
    assert_eq!(second.source, ResultSource::Network);
    assert!(second.is_final);
    assert_eq!(second.value.len(), 2);
}

#[test]
fn network_else_cache_falls_back_when_offline() {
    let store = TestStore::new();
    let mut doc = Document::new();
    doc.insert("name".into(), Value::from("ada"));
    store.seed("users", doc);

    let mut query = store.client.query("users");
    query.set_cache_policy(CachePolicy::NetworkElseCache);
    assert_eq!(query.find_all().unwrap().len(), 1);

    // The network result above primed the cache; an injected failure now
    // answers from it.
    store
        .transport
        .fail_next(TransportError::Connection("offline".into()));
    assert_eq!(query.find_all().unwrap().len(), 1);

    // A different query has no cached fallback, so the error surfaces.
    store
        .transport
        .fail_next(TransportError::Connection("offline".into()));
    let mut other = store.client.query("users");
    other
        .set_cache_policy(CachePolicy::NetworkElseCache)
        .where_equal("name", "ada");
    assert!(matches!(other.find_all(), Err(Error::Transport { .. })));
}

#[test]
fn unique_index_surfaces_the_duplicate_key_code() {
    let store = TestStore::new();
    store.client.ensure_index("users", "email", true, false).unwrap();

    let first = store.client.entity("users");
    first.set("email", "ada@example.com").unwrap();
    first.save().unwrap();

    let second = store.client.entity("users");
    second.set("email", "ada@example.com").unwrap();
    let err = second.save().unwrap_err();
    assert!(matches!(err, Error::OperationFailed { code: 201, .. }));
    // The failed save is retryable after fixing the field.
    assert!(second.is_dirty());
    second.set("email", "grace@example.com").unwrap();
    second.save().unwrap();
}

#[test]
fn map_reduce_runs_the_handler_and_local_processor() {
    let store = scenarios::store_with_users(4);
    store.server.set_map_reduce_handler(|job, docs| {
        // The context travels with the job.
        let offset = job
            .context
            .get("offset")
            .and_then(Value::as_i64)
            .unwrap_or(0);
        let total: i64 = docs
            .iter()
            .filter_map(|doc| doc.get("age").and_then(Value::as_i64))
            .sum();
        Value::from(total + offset)
    });

    let mut context = Document::new();
    context.insert("offset".into(), Value::from(100i64));
    let mut query = store.client.query("users");
    query.set_map_reduce(
        farstore_core::MapReduce::new(
            "function() { emit(1, this.age); }",
            "function(k, v) { return Array.sum(v); }",
        )
        .with_context(context)
        .with_result_processor(|value| match value {
            Value::Number(n) => Value::from(n.as_f64() / 2.0),
            other => other,
        }),
    );

    // Ages 20+21+22+23 = 86, plus the context offset, halved locally.
    let result = query.perform_map_reduce().unwrap();
    assert_eq!(result, Value::from(93.0));
}
