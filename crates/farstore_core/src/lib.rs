//! # farstore core
//!
//! Client-side entity and query engine for a remote schemaless document
//! store.
//!
//! This crate provides:
//! - Entity handles with staged field mutations and snapshot commit
//! - Update-document compilation with operator precedence rules
//! - Query condition accumulation and filter compilation
//! - Cache policy execution, including dual cache-then-network delivery
//! - A serialized request dispatcher with blocking and callback modes
//!
//! ## Architecture
//!
//! The core never performs I/O itself. Network operations go through the
//! [`Transport`] trait and query results through the [`QueryCache`] trait;
//! both are injected at [`Client`] construction. Every compiled operation,
//! blocking or not, passes through a single per-client dispatcher that
//! executes operations one at a time in submission order.
//!
//! ## Key invariants
//!
//! - An entity's snapshot is mutated only by committing a server result;
//!   staged edits never touch it until a save succeeds
//! - A field never appears in both the set and unset maps; the later call
//!   wins
//! - List operations compile to nothing for unsaved entities
//! - Under cache-then-network, the cached delivery always precedes the
//!   network delivery, and the cache write is the last effect
//!
//! ## Quick start
//!
//! ```rust
//! use farstore_core::{Client, ClientConfig, MockTransport, WireResponse, Value, Document};
//! use std::sync::Arc;
//!
//! let transport = Arc::new(MockTransport::new());
//! # let mut doc = Document::new();
//! # doc.insert("_id".into(), Value::from("e1"));
//! # transport.push_response(WireResponse::Document(doc));
//! let client = Client::new(
//!     ClientConfig::new("https://store.example.com", "secret"),
//!     transport.clone(),
//! );
//!
//! let entity = client.entity("users");
//! entity.set("name", "Ada").unwrap();
//! entity.increment("logins").unwrap();
//! entity.save().unwrap();
//! assert!(!entity.is_new());
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod cache;
pub mod client;
pub mod config;
pub mod dispatch;
pub mod entity;
pub mod error;
pub mod field;
pub mod policy;
pub mod query;
pub mod relation;
pub mod transport;
pub mod types;
pub mod value;

pub use cache::{MemoryCache, QueryCache, QueryKey};
pub use client::Client;
pub use config::ClientConfig;
pub use dispatch::{CancelHandle, Dispatcher};
pub use entity::pending::{PendingOps, PopEnd, UpdateDocument};
pub use entity::Entity;
pub use error::{CoreResult, Error};
pub use policy::{CachePolicy, Delivery, ResultSource};
pub use query::condition::{
    CompiledRead, ConditionSet, Projection, RegexOptions, SortDirection,
};
pub use query::map_reduce::{MapReduce, MapReduceJob};
pub use query::{GroupProxy, Query};
pub use relation::Relation;
pub use transport::{
    MockTransport, Transport, TransportError, TransportResult, WireRequest, WireResponse,
};
pub use types::{EntityId, SequenceNumber, CREATED_FIELD, ID_FIELD, SEQUENCE_FIELD, UPDATED_FIELD};
pub use value::{document_from_wire, document_to_wire, Document, Number, Value};
