//! The client root handle.

use crate::cache::{MemoryCache, QueryCache};
use crate::config::ClientConfig;
use crate::dispatch::Dispatcher;
use crate::entity::Entity;
use crate::error::{CoreResult, Error};
use crate::query::Query;
use crate::transport::{Transport, WireRequest, WireResponse};
use std::sync::Arc;

/// Shared state behind every entity and query of one client.
pub(crate) struct ClientInner {
    pub(crate) config: ClientConfig,
    pub(crate) cache: Arc<dyn QueryCache>,
    pub(crate) dispatcher: Dispatcher,
}

/// Handle to one remote document store.
///
/// Owns the configuration, the query cache, and the single request
/// dispatcher all operations of this client are serialized through.
/// Cloning is cheap; clones share all of it.
#[derive(Clone)]
pub struct Client {
    inner: Arc<ClientInner>,
}

impl Client {
    /// Creates a client over a transport, with an in-memory query cache.
    #[must_use]
    pub fn new(config: ClientConfig, transport: Arc<dyn Transport>) -> Self {
        Self::with_cache(config, transport, Arc::new(MemoryCache::new()))
    }

    /// Creates a client with a caller-provided query cache.
    #[must_use]
    pub fn with_cache(
        config: ClientConfig,
        transport: Arc<dyn Transport>,
        cache: Arc<dyn QueryCache>,
    ) -> Self {
        Self {
            inner: Arc::new(ClientInner {
                config,
                cache,
                dispatcher: Dispatcher::new(transport),
            }),
        }
    }

    /// The client's configuration.
    #[must_use]
    pub fn config(&self) -> &ClientConfig {
        &self.inner.config
    }

    /// Creates a new, unsaved entity in the named collection.
    #[must_use]
    pub fn entity(&self, collection: impl Into<String>) -> Entity {
        Entity::new(Arc::clone(&self.inner), collection.into())
    }

    /// Creates an empty query over the named collection.
    #[must_use]
    pub fn query(&self, collection: impl Into<String>) -> Query {
        Query::new(Arc::clone(&self.inner), collection.into())
    }

    /// Creates an index on a collection field.
    ///
    /// With `unique` set the server enforces distinct values;
    /// `drop_duplicates` additionally removes offending records while the
    /// index is built.
    pub fn ensure_index(
        &self,
        collection: impl Into<String>,
        key: impl Into<String>,
        unique: bool,
        drop_duplicates: bool,
    ) -> CoreResult<()> {
        let request = WireRequest::EnsureIndex {
            collection: collection.into(),
            key: key.into(),
            unique,
            drop_duplicates,
        };
        match self.inner.dispatcher.execute_blocking(request)? {
            WireResponse::None => Ok(()),
            other => Err(Error::transport(format!(
                "unexpected response to ensure-index: {other:?}"
            ))),
        }
    }
}
