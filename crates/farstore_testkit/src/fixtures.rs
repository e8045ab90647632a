//! Test fixtures and client helpers.
//!
//! Provides convenience functions for setting up clients backed by the
//! in-memory server and common pre-populated scenarios.

use crate::server::MemoryServer;
use crate::transport::MemoryTransport;
use farstore_core::{Client, ClientConfig, Document, Value};
use std::sync::Arc;

/// A client wired to an in-memory server, with handles to both ends.
pub struct TestStore {
    /// The client under test.
    pub client: Client,
    /// The transport, for failure injection and request inspection.
    pub transport: Arc<MemoryTransport>,
    /// The server, for seeding and direct inspection.
    pub server: Arc<MemoryServer>,
}

impl TestStore {
    /// Creates a client over a fresh in-memory server.
    pub fn new() -> Self {
        let server = Arc::new(MemoryServer::new());
        let transport = Arc::new(MemoryTransport::over(Arc::clone(&server)));
        let client = Client::new(
            ClientConfig::new("memory://test", "test-secret"),
            Arc::clone(&transport) as Arc<dyn farstore_core::Transport>,
        );
        Self {
            client,
            transport,
            server,
        }
    }

    /// Seeds a document directly into the server, bypassing the client.
    ///
    /// Returns the stored document, server fields included.
    pub fn seed(&self, collection: &str, document: Document) -> Document {
        self.server.seed(collection, document)
    }
}

impl Default for TestStore {
    fn default() -> Self {
        Self::new()
    }
}

/// Runs a test against a fresh in-memory store.
pub fn with_store<F, R>(f: F) -> R
where
    F: FnOnce(&TestStore) -> R,
{
    f(&TestStore::new())
}

/// Initializes test logging from `RUST_LOG`.
///
/// Safe to call from every test; only the first call installs the
/// subscriber.
pub fn init_test_logging() {
    use tracing_subscriber::EnvFilter;
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Pre-populated scenarios.
pub mod scenarios {
    use super::*;

    /// A store seeded with `count` user records carrying `name` and `age`.
    ///
    /// Ages run 20, 21, 22, … so range queries have predictable hit counts.
    pub fn store_with_users(count: usize) -> TestStore {
        let store = TestStore::new();
        for i in 0..count {
            let mut doc = Document::new();
            doc.insert("name".into(), Value::from(format!("user{i}")));
            doc.insert("age".into(), Value::from(20 + i as i64));
            store.seed("users", doc);
        }
        store
    }
}
