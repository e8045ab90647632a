//! Client-side entity handles.
//!
//! An [`Entity`] is a handle to one record in a named remote collection. It
//! keeps the last-known-saved snapshot of the record and a set of staged
//! edits; a successful save is the only thing that moves staged state into
//! the snapshot.

pub mod pending;

use crate::client::ClientInner;
use crate::dispatch::CancelHandle;
use crate::error::{CoreResult, Error};
use crate::relation::Relation;
use crate::transport::{WireRequest, WireResponse};
use crate::types::{
    EntityId, SequenceNumber, CREATED_FIELD, ID_FIELD, SEQUENCE_FIELD, UPDATED_FIELD,
};
use crate::value::{Document, Number, Value};
use parking_lot::RwLock;
use pending::PendingOps;
use std::sync::Arc;
use tracing::{debug, trace};

struct EntityState {
    id: Option<EntityId>,
    snapshot: Document,
    pending: PendingOps,
    invalidated: bool,
}

struct EntityInner {
    client: Arc<ClientInner>,
    collection: String,
    state: RwLock<EntityState>,
}

/// A handle to one record in a remote collection.
///
/// Handles are cheap to clone and share their state; staged edits made
/// through one clone are visible through the others. The staged state is
/// not designed for concurrent mutation from multiple threads; callers
/// doing that need their own synchronization.
///
/// A deleted entity is invalidated: staging further edits or saving it is a
/// caller bug and panics.
#[derive(Clone)]
pub struct Entity {
    inner: Arc<EntityInner>,
}

impl std::fmt::Debug for Entity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.inner.state.read();
        f.debug_struct("Entity")
            .field("collection", &self.inner.collection)
            .field("id", &state.id)
            .field("invalidated", &state.invalidated)
            .finish()
    }
}

impl Entity {
    pub(crate) fn new(client: Arc<ClientInner>, collection: String) -> Self {
        Self {
            inner: Arc::new(EntityInner {
                client,
                collection,
                state: RwLock::new(EntityState {
                    id: None,
                    snapshot: Document::new(),
                    pending: PendingOps::new(),
                    invalidated: false,
                }),
            }),
        }
    }

    /// Wraps a server document in an entity handle.
    pub(crate) fn from_document(
        client: Arc<ClientInner>,
        collection: String,
        document: Document,
    ) -> Self {
        let id = document
            .get(ID_FIELD)
            .and_then(Value::as_str)
            .map(EntityId::new);
        Self {
            inner: Arc::new(EntityInner {
                client,
                collection,
                state: RwLock::new(EntityState {
                    id,
                    snapshot: document,
                    pending: PendingOps::new(),
                    invalidated: false,
                }),
            }),
        }
    }

    /// The collection this entity belongs to.
    #[must_use]
    pub fn collection(&self) -> &str {
        &self.inner.collection
    }

    /// The server-assigned id, absent until the first successful save.
    #[must_use]
    pub fn id(&self) -> Option<EntityId> {
        self.inner.state.read().id.clone()
    }

    /// True until the first successful save assigns an id.
    #[must_use]
    pub fn is_new(&self) -> bool {
        self.inner.state.read().id.is_none()
    }

    /// True while edits are staged.
    #[must_use]
    pub fn is_dirty(&self) -> bool {
        !self.inner.state.read().pending.is_empty()
    }

    /// Server-assigned creation timestamp, if known.
    #[must_use]
    pub fn created_at(&self) -> Option<i64> {
        self.timestamp_field(CREATED_FIELD)
    }

    /// Server-assigned last-update timestamp, if known.
    #[must_use]
    pub fn updated_at(&self) -> Option<i64> {
        self.timestamp_field(UPDATED_FIELD)
    }

    /// Server-assigned sequence number, if known.
    #[must_use]
    pub fn sequence_number(&self) -> Option<SequenceNumber> {
        self.inner
            .state
            .read()
            .snapshot
            .get(SEQUENCE_FIELD)
            .and_then(Value::as_i64)
            .map(|seq| SequenceNumber::new(seq as u64))
    }

    fn timestamp_field(&self, field: &str) -> Option<i64> {
        self.inner
            .state
            .read()
            .snapshot
            .get(field)
            .and_then(Value::as_i64)
    }

    /// A relation value referencing this entity.
    ///
    /// Absent while the entity has no id to reference.
    #[must_use]
    pub fn relation(&self) -> Option<Relation> {
        self.id()
            .map(|id| Relation::new(self.inner.collection.clone(), id))
    }

    /// Reads a field.
    ///
    /// A staged edit wins over the saved snapshot, so a caller observes
    /// their own writes; a staged unset reads as absent.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<Value> {
        let state = self.inner.state.read();
        match state.pending.staged(key) {
            Some(Some(value)) => Some(value.clone()),
            Some(None) => None,
            None => state.snapshot.get(key).cloned(),
        }
    }

    fn with_pending<R>(&self, f: impl FnOnce(&mut PendingOps) -> R) -> R {
        let mut state = self.inner.state.write();
        if state.invalidated {
            panic!(
                "entity in collection {:?} was deleted; using it afterwards is a bug",
                self.inner.collection
            );
        }
        f(&mut state.pending)
    }

    /// Stages a field assignment.
    pub fn set(&self, key: &str, value: impl Into<Value>) -> CoreResult<()> {
        let value = value.into();
        self.with_pending(|pending| pending.set(key, value))
    }

    /// Stages a field removal.
    pub fn unset(&self, key: &str) -> CoreResult<()> {
        self.with_pending(|pending| pending.unset(key))
    }

    /// Stages an increment by one.
    pub fn increment(&self, key: &str) -> CoreResult<()> {
        self.increment_by(key, Number::Int(1))
    }

    /// Stages an increment by an arbitrary (possibly negative) delta.
    ///
    /// Repeated increments on one field accumulate into a single delta.
    pub fn increment_by(&self, key: &str, delta: impl Into<Number>) -> CoreResult<()> {
        let delta = delta.into();
        self.with_pending(|pending| pending.increment(key, delta))
    }

    /// Stages a list append.
    ///
    /// List operations have no effect on a new entity; they compile to
    /// nothing until the entity has been saved once.
    pub fn push(&self, key: &str, value: impl Into<Value>) -> CoreResult<()> {
        let value = value.into();
        self.with_pending(|pending| pending.push(key, value))
    }

    /// Stages a multi-element list append.
    pub fn push_all(&self, key: &str, values: Vec<Value>) -> CoreResult<()> {
        self.with_pending(|pending| pending.push_all(key, values))
    }

    /// Stages a set-style append: the value is added only if absent.
    pub fn add_to_set(&self, key: &str, value: impl Into<Value>) -> CoreResult<()> {
        let value = value.into();
        self.with_pending(|pending| pending.add_to_set(key, value))
    }

    /// Stages a set-style append of several values.
    pub fn add_all_to_set(&self, key: &str, values: Vec<Value>) -> CoreResult<()> {
        self.with_pending(|pending| pending.add_all_to_set(key, values))
    }

    /// Stages removal of the first list element.
    pub fn pop_first(&self, key: &str) -> CoreResult<()> {
        self.with_pending(|pending| pending.pop_first(key))
    }

    /// Stages removal of the last list element.
    pub fn pop_last(&self, key: &str) -> CoreResult<()> {
        self.with_pending(|pending| pending.pop_last(key))
    }

    /// Stages removal of every occurrence of a value.
    pub fn pull(&self, key: &str, value: impl Into<Value>) -> CoreResult<()> {
        let value = value.into();
        self.with_pending(|pending| pending.pull(key, value))
    }

    /// Stages removal of every occurrence of the given values.
    pub fn pull_all(&self, key: &str, values: Vec<Value>) -> CoreResult<()> {
        self.with_pending(|pending| pending.pull_all(key, values))
    }

    /// Discards all staged edits without contacting the server.
    ///
    /// The snapshot is left exactly as the last save or refresh produced it.
    pub fn reset(&self) {
        self.inner.state.write().pending.reset();
    }

    /// Compiles the save request for the current staged state.
    ///
    /// `None` means nothing is staged and the save is a local no-op.
    fn compile_save(&self) -> CoreResult<Option<WireRequest>> {
        let state = self.inner.state.read();
        if state.invalidated {
            panic!(
                "entity in collection {:?} was deleted; using it afterwards is a bug",
                self.inner.collection
            );
        }
        state.pending.validate()?;
        let update = state.pending.compile(state.id.is_none());
        if update.is_empty() {
            trace!(collection = %self.inner.collection, "save with no effective changes, skipping network");
            return Ok(None);
        }
        Ok(Some(WireRequest::Save {
            collection: self.inner.collection.clone(),
            id: state.id.clone(),
            update,
        }))
    }

    /// Commits a server result document into the snapshot and clears the
    /// staged edits. Nothing else ever mutates the snapshot.
    fn commit(&self, document: Document) {
        let mut state = self.inner.state.write();
        if let Some(id) = document.get(ID_FIELD).and_then(Value::as_str) {
            state.id = Some(EntityId::new(id));
        }
        state.snapshot = document;
        state.pending.reset();
    }

    /// Saves staged changes, blocking until the server answers.
    ///
    /// A save with nothing staged performs zero transport calls and reports
    /// success. On success the server's result document becomes the new
    /// snapshot and the staged edits are cleared; on failure both are left
    /// untouched so the caller may retry or [`reset`](Entity::reset).
    pub fn save(&self) -> CoreResult<()> {
        let Some(request) = self.compile_save()? else {
            return Ok(());
        };
        debug!(collection = %self.inner.collection, new = self.is_new(), "saving entity");
        let response = self.inner.client.dispatcher.execute_blocking(request)?;
        let document = expect_document(response, "save")?;
        self.commit(document);
        Ok(())
    }

    /// Saves staged changes without blocking.
    ///
    /// The completion runs on the dispatch thread once the save's turn
    /// completes; it must not issue blocking calls on this client. Errors
    /// are delivered as the completion's argument. Cancelling suppresses the
    /// completion but not the save itself.
    pub fn save_in_background<F>(&self, completion: F) -> CoreResult<CancelHandle>
    where
        F: FnOnce(CoreResult<()>) + Send + 'static,
    {
        let Some(request) = self.compile_save()? else {
            completion(Ok(()));
            return Ok(CancelHandle::new());
        };
        let handle = CancelHandle::new();
        let token = handle.clone();
        let entity = self.clone();
        self.inner.client.dispatcher.submit(Box::new(move |transport| {
            let outcome = transport
                .execute(&request)
                .map_err(Error::from)
                .and_then(|response| expect_document(response, "save"))
                .map(|document| entity.commit(document));
            if !token.is_cancelled() {
                completion(outcome);
            }
        }))?;
        Ok(handle)
    }

    /// Replaces the snapshot with the server's current record.
    ///
    /// Staged edits are kept; only the snapshot is replaced wholesale.
    /// Fails with [`Error::NotFound`] when the entity has no id.
    pub fn refresh(&self) -> CoreResult<()> {
        let request = self.refresh_request()?;
        let response = self.inner.client.dispatcher.execute_blocking(request)?;
        let document = expect_document(response, "refresh")?;
        self.inner.state.write().snapshot = document;
        Ok(())
    }

    /// Refreshes the snapshot without blocking.
    pub fn refresh_in_background<F>(&self, completion: F) -> CoreResult<CancelHandle>
    where
        F: FnOnce(CoreResult<()>) + Send + 'static,
    {
        let request = self.refresh_request()?;
        let handle = CancelHandle::new();
        let token = handle.clone();
        let entity = self.clone();
        self.inner.client.dispatcher.submit(Box::new(move |transport| {
            let outcome = transport
                .execute(&request)
                .map_err(Error::from)
                .and_then(|response| expect_document(response, "refresh"))
                .map(|document| {
                    entity.inner.state.write().snapshot = document;
                });
            if !token.is_cancelled() {
                completion(outcome);
            }
        }))?;
        Ok(handle)
    }

    fn refresh_request(&self) -> CoreResult<WireRequest> {
        let id = self
            .id()
            .ok_or_else(|| Error::not_found("entity has no id to refresh from"))?;
        Ok(WireRequest::Refresh {
            collection: self.inner.collection.clone(),
            id,
        })
    }

    /// Deletes the record, blocking until the server answers.
    ///
    /// On success the entity is invalidated: any further field operation or
    /// save panics. Fails with [`Error::NotFound`] when the entity has no
    /// id.
    pub fn delete(&self) -> CoreResult<()> {
        let request = self.delete_request()?;
        debug!(collection = %self.inner.collection, "deleting entity");
        self.inner.client.dispatcher.execute_blocking(request)?;
        self.inner.state.write().invalidated = true;
        Ok(())
    }

    /// Deletes the record without blocking.
    pub fn delete_in_background<F>(&self, completion: F) -> CoreResult<CancelHandle>
    where
        F: FnOnce(CoreResult<()>) + Send + 'static,
    {
        let request = self.delete_request()?;
        let handle = CancelHandle::new();
        let token = handle.clone();
        let entity = self.clone();
        self.inner.client.dispatcher.submit(Box::new(move |transport| {
            let outcome = transport.execute(&request).map_err(Error::from).map(|_| {
                entity.inner.state.write().invalidated = true;
            });
            if !token.is_cancelled() {
                completion(outcome);
            }
        }))?;
        Ok(handle)
    }

    fn delete_request(&self) -> CoreResult<WireRequest> {
        let id = self
            .id()
            .ok_or_else(|| Error::not_found("entity has no id to delete"))?;
        Ok(WireRequest::Delete {
            collection: self.inner.collection.clone(),
            id,
        })
    }
}

fn expect_document(response: WireResponse, operation: &str) -> CoreResult<Document> {
    match response {
        WireResponse::Document(document) => Ok(document),
        WireResponse::Documents(mut documents) if !documents.is_empty() => {
            Ok(documents.remove(0))
        }
        other => Err(Error::transport(format!(
            "unexpected response to {operation}: {other:?}"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::Client;
    use crate::config::ClientConfig;
    use crate::transport::{MockTransport, TransportError};
    use std::sync::mpsc::channel;

    fn client_with(mock: &Arc<MockTransport>) -> Client {
        Client::new(
            ClientConfig::new("https://api.example.com", "secret"),
            Arc::clone(mock) as Arc<dyn crate::transport::Transport>,
        )
    }

    fn saved_doc(id: &str) -> Document {
        let mut doc = Document::new();
        doc.insert(ID_FIELD.into(), Value::from(id));
        doc.insert(CREATED_FIELD.into(), Value::from(1_700_000_000i64));
        doc.insert(UPDATED_FIELD.into(), Value::from(1_700_000_050i64));
        doc.insert(SEQUENCE_FIELD.into(), Value::from(7i64));
        doc.insert("name".into(), Value::from("widget"));
        doc
    }

    #[test]
    fn fresh_entity_is_new_and_clean() {
        let mock = Arc::new(MockTransport::new());
        let entity = client_with(&mock).entity("things");
        assert!(entity.is_new());
        assert!(!entity.is_dirty());
        assert_eq!(entity.id(), None);
        assert_eq!(entity.relation(), None);
    }

    #[test]
    fn save_commits_snapshot_and_clears_pending() {
        let mock = Arc::new(MockTransport::new());
        mock.push_response(WireResponse::Document(saved_doc("e1")));
        let entity = client_with(&mock).entity("things");

        entity.set("name", "widget").unwrap();
        assert!(entity.is_dirty());
        entity.save().unwrap();

        assert!(!entity.is_new());
        assert!(!entity.is_dirty());
        assert_eq!(entity.id(), Some(EntityId::new("e1")));
        assert_eq!(entity.created_at(), Some(1_700_000_000));
        assert_eq!(entity.updated_at(), Some(1_700_000_050));
        assert_eq!(entity.sequence_number(), Some(SequenceNumber::new(7)));
        assert_eq!(entity.get("name"), Some(Value::from("widget")));
        assert_eq!(entity.relation(), Some(Relation::new("things", "e1")));
    }

    #[test]
    fn empty_save_skips_the_network() {
        let mock = Arc::new(MockTransport::new());
        let entity = client_with(&mock).entity("things");
        entity.save().unwrap();
        assert_eq!(mock.request_count(), 0);
    }

    #[test]
    fn list_ops_only_save_compiles_to_noop_for_new_entity() {
        let mock = Arc::new(MockTransport::new());
        let entity = client_with(&mock).entity("things");
        entity.push("tags", "a").unwrap();
        entity.pop_last("tags").unwrap();
        entity.pull("tags", "b").unwrap();

        // Everything staged is a new-entity no-op, so no request goes out.
        entity.save().unwrap();
        assert_eq!(mock.request_count(), 0);
    }

    #[test]
    fn failed_save_leaves_state_untouched() {
        let mock = Arc::new(MockTransport::new());
        mock.push_error(TransportError::Connection("offline".into()));
        let entity = client_with(&mock).entity("things");

        entity.set("name", "widget").unwrap();
        let err = entity.save().unwrap_err();
        assert!(matches!(err, Error::Transport { .. }));

        assert!(entity.is_new());
        assert!(entity.is_dirty());
        assert_eq!(entity.get("name"), Some(Value::from("widget")));
    }

    #[test]
    fn save_sends_upsert_for_new_and_update_for_existing() {
        let mock = Arc::new(MockTransport::new());
        mock.push_response(WireResponse::Document(saved_doc("e1")));
        mock.push_response(WireResponse::Document(saved_doc("e1")));
        let entity = client_with(&mock).entity("things");

        entity.set("name", "widget").unwrap();
        entity.save().unwrap();
        entity.set("name", "gadget").unwrap();
        entity.save().unwrap();

        let requests = mock.requests();
        assert!(matches!(&requests[0], WireRequest::Save { id: None, .. }));
        assert!(matches!(&requests[1], WireRequest::Save { id: Some(id), .. } if id.as_str() == "e1"));
    }

    #[test]
    fn reset_discards_pending_and_keeps_snapshot() {
        let mock = Arc::new(MockTransport::new());
        mock.push_response(WireResponse::Document(saved_doc("e1")));
        let entity = client_with(&mock).entity("things");
        entity.set("name", "widget").unwrap();
        entity.save().unwrap();

        entity.set("name", "other").unwrap();
        entity.increment_by("count", 3i64).unwrap();
        assert!(entity.is_dirty());

        entity.reset();
        assert!(!entity.is_dirty());
        assert_eq!(entity.get("name"), Some(Value::from("widget")));
    }

    #[test]
    fn get_prefers_staged_values() {
        let mock = Arc::new(MockTransport::new());
        mock.push_response(WireResponse::Document(saved_doc("e1")));
        let entity = client_with(&mock).entity("things");
        entity.set("name", "widget").unwrap();
        entity.save().unwrap();

        entity.set("name", "staged").unwrap();
        assert_eq!(entity.get("name"), Some(Value::from("staged")));

        entity.unset("name").unwrap();
        assert_eq!(entity.get("name"), None);

        entity.reset();
        assert_eq!(entity.get("name"), Some(Value::from("widget")));
    }

    #[test]
    fn invalid_key_is_rejected_at_staging_time() {
        let mock = Arc::new(MockTransport::new());
        let entity = client_with(&mock).entity("things");
        assert!(matches!(
            entity.set("a.b", 1i64),
            Err(Error::InvalidKey { .. })
        ));
        assert!(matches!(
            entity.set("a$b", 1i64),
            Err(Error::InvalidKey { .. })
        ));
        assert!(!entity.is_dirty());
    }

    #[test]
    fn refresh_requires_an_id() {
        let mock = Arc::new(MockTransport::new());
        let entity = client_with(&mock).entity("things");
        assert!(matches!(entity.refresh(), Err(Error::NotFound { .. })));
        assert_eq!(mock.request_count(), 0);
    }

    #[test]
    fn refresh_replaces_snapshot_wholesale() {
        let mock = Arc::new(MockTransport::new());
        mock.push_response(WireResponse::Document(saved_doc("e1")));
        let entity = client_with(&mock).entity("things");
        entity.set("name", "widget").unwrap();
        entity.save().unwrap();

        let mut fresh = Document::new();
        fresh.insert(ID_FIELD.into(), Value::from("e1"));
        fresh.insert("name".into(), Value::from("renamed"));
        mock.push_response(WireResponse::Document(fresh));

        entity.refresh().unwrap();
        assert_eq!(entity.get("name"), Some(Value::from("renamed")));
        // Fields absent from the fresh record are gone.
        assert_eq!(entity.created_at(), None);
    }

    #[test]
    fn delete_invalidates_the_entity() {
        let mock = Arc::new(MockTransport::new());
        mock.push_response(WireResponse::Document(saved_doc("e1")));
        mock.push_response(WireResponse::None);
        let entity = client_with(&mock).entity("things");
        entity.set("name", "widget").unwrap();
        entity.save().unwrap();

        entity.delete().unwrap();
        let requests = mock.requests();
        assert!(matches!(&requests[1], WireRequest::Delete { .. }));
    }

    #[test]
    #[should_panic(expected = "was deleted")]
    fn mutating_a_deleted_entity_panics() {
        let mock = Arc::new(MockTransport::new());
        mock.push_response(WireResponse::Document(saved_doc("e1")));
        mock.push_response(WireResponse::None);
        let entity = client_with(&mock).entity("things");
        entity.set("name", "widget").unwrap();
        entity.save().unwrap();
        entity.delete().unwrap();

        let _ = entity.set("name", "zombie");
    }

    #[test]
    fn background_save_reports_through_completion() {
        let mock = Arc::new(MockTransport::new());
        mock.push_response(WireResponse::Document(saved_doc("e1")));
        let entity = client_with(&mock).entity("things");
        entity.set("name", "widget").unwrap();

        let (tx, rx) = channel();
        entity
            .save_in_background(move |outcome| {
                let _ = tx.send(outcome);
            })
            .unwrap();

        rx.recv().unwrap().unwrap();
        assert_eq!(entity.id(), Some(EntityId::new("e1")));
        assert!(!entity.is_dirty());
    }

    #[test]
    fn background_save_with_nothing_staged_completes_inline() {
        let mock = Arc::new(MockTransport::new());
        let entity = client_with(&mock).entity("things");

        let (tx, rx) = channel();
        entity
            .save_in_background(move |outcome| {
                let _ = tx.send(outcome);
            })
            .unwrap();
        rx.recv().unwrap().unwrap();
        assert_eq!(mock.request_count(), 0);
    }

    #[test]
    fn cancelled_background_save_suppresses_completion_but_commits() {
        let mock = Arc::new(MockTransport::new());
        let client = client_with(&mock);

        // A gate entity whose completion cancels the second save from the
        // dispatch thread, before that save's turn comes up.
        let gate = client.entity("things");
        gate.set("gate", true).unwrap();
        mock.push_response(WireResponse::Document(saved_doc("g1")));
        let (handle_tx, handle_rx) = channel::<crate::dispatch::CancelHandle>();
        gate.save_in_background(move |_| {
            if let Ok(handle) = handle_rx.recv() {
                handle.cancel();
            }
        })
        .unwrap();

        let entity = client.entity("things");
        entity.set("name", "widget").unwrap();
        mock.push_response(WireResponse::Document(saved_doc("e1")));

        let (tx, rx) = channel();
        let handle = entity
            .save_in_background(move |outcome| {
                let _ = tx.send(outcome);
            })
            .unwrap();
        handle_tx.send(handle).unwrap();

        // Drain the dispatcher by queueing a blocking call behind the save.
        mock.push_response(WireResponse::None);
        client.ensure_index("things", "name", false, false).unwrap();

        assert!(rx.try_recv().is_err());
        // The save itself still happened and was committed.
        assert_eq!(entity.id(), Some(EntityId::new("e1")));
    }
}
