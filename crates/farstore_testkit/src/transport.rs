//! Transport over the in-memory server.
//!
//! [`MemoryTransport`] implements the core's transport contract against a
//! [`MemoryServer`], records every request, and supports failure injection
//! for exercising error paths and cache fallbacks.

use crate::server::MemoryServer;
use farstore_core::{Transport, TransportError, TransportResult, WireRequest, WireResponse};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;

/// A [`Transport`] delegating to a [`MemoryServer`].
///
/// Injected failures are consumed one per request, before the server is
/// consulted, so a failed request has no server-side effect: the same
/// observable behavior as a connection that died on the way out.
pub struct MemoryTransport {
    server: Arc<MemoryServer>,
    failures: Mutex<VecDeque<TransportError>>,
    requests: Mutex<Vec<WireRequest>>,
}

impl MemoryTransport {
    /// Creates a transport over a fresh server.
    pub fn new() -> Self {
        Self::over(Arc::new(MemoryServer::new()))
    }

    /// Creates a transport over an existing server.
    pub fn over(server: Arc<MemoryServer>) -> Self {
        Self {
            server,
            failures: Mutex::new(VecDeque::new()),
            requests: Mutex::new(Vec::new()),
        }
    }

    /// The underlying server.
    pub fn server(&self) -> &Arc<MemoryServer> {
        &self.server
    }

    /// Queues a failure; the next request consumes it and fails.
    pub fn fail_next(&self, error: TransportError) {
        self.failures.lock().push_back(error);
    }

    /// All requests executed so far, in order.
    pub fn requests(&self) -> Vec<WireRequest> {
        self.requests.lock().clone()
    }

    /// Number of requests executed so far, including failed ones.
    pub fn request_count(&self) -> usize {
        self.requests.lock().len()
    }
}

impl Default for MemoryTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl Transport for MemoryTransport {
    fn execute(&self, request: &WireRequest) -> TransportResult<WireResponse> {
        self.requests.lock().push(request.clone());
        if let Some(error) = self.failures.lock().pop_front() {
            return Err(error);
        }
        self.server.execute(request)
    }
}
