//! Transport layer abstraction.
//!
//! The core never speaks HTTP itself. Every compiled operation is handed to
//! a [`Transport`] implementation, which is responsible for delivery,
//! authentication headers, and any retry/backoff it wants to apply. The
//! core adds no retry logic of its own.

use crate::entity::pending::UpdateDocument;
use crate::query::condition::CompiledRead;
use crate::query::map_reduce::MapReduceJob;
use crate::types::EntityId;
use crate::value::Document;
use parking_lot::Mutex;
use std::collections::VecDeque;
use thiserror::Error;

/// Errors a transport can report.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TransportError {
    /// The connection failed before the server answered.
    #[error("connection failed: {0}")]
    Connection(String),

    /// The server rejected the operation.
    #[error("server rejected operation with status {code}: {message}")]
    Rejected {
        /// Server status code.
        code: u32,
        /// Server-provided message.
        message: String,
    },

    /// The requested record does not exist.
    #[error("record not found")]
    NotFound,

    /// The server's answer could not be interpreted.
    #[error("malformed response: {0}")]
    Protocol(String),
}

impl From<TransportError> for crate::error::Error {
    fn from(err: TransportError) -> Self {
        match err {
            TransportError::Connection(message) => crate::error::Error::Transport { message },
            TransportError::Rejected { code, message } => {
                crate::error::Error::OperationFailed { code, message }
            }
            TransportError::NotFound => crate::error::Error::not_found("record not found"),
            TransportError::Protocol(message) => crate::error::Error::Transport {
                message: format!("malformed response: {message}"),
            },
        }
    }
}

/// Result type for transport operations.
pub type TransportResult<T> = Result<T, TransportError>;

/// A compiled operation ready for the wire.
#[derive(Debug, Clone, PartialEq)]
pub enum WireRequest {
    /// Save staged changes: upsert-by-id for new entities, partial update
    /// for existing ones.
    Save {
        /// Target collection.
        collection: String,
        /// Record id; absent for a first save.
        id: Option<EntityId>,
        /// Compiled update document.
        update: UpdateDocument,
    },
    /// Fetch the full current record by id.
    Refresh {
        /// Target collection.
        collection: String,
        /// Record id.
        id: EntityId,
    },
    /// Delete a record by id.
    Delete {
        /// Target collection.
        collection: String,
        /// Record id.
        id: EntityId,
    },
    /// Find matching records.
    Find {
        /// Compiled read request.
        read: CompiledRead,
        /// Return only the first match.
        one: bool,
    },
    /// Count matching records.
    Count {
        /// Compiled read request.
        read: CompiledRead,
    },
    /// Run a server-side map-reduce over matching records.
    MapReduce {
        /// Compiled read request (sort and skip are ignored for map-reduce).
        read: CompiledRead,
        /// The compiled map-reduce functions and context.
        job: MapReduceJob,
    },
    /// Create an index on a collection field.
    EnsureIndex {
        /// Target collection.
        collection: String,
        /// Field to index.
        key: String,
        /// Enforce unique values.
        unique: bool,
        /// Drop duplicate records while building a unique index.
        drop_duplicates: bool,
    },
}

impl WireRequest {
    /// The collection an operation targets.
    #[must_use]
    pub fn collection(&self) -> &str {
        match self {
            WireRequest::Save { collection, .. }
            | WireRequest::Refresh { collection, .. }
            | WireRequest::Delete { collection, .. }
            | WireRequest::EnsureIndex { collection, .. } => collection,
            WireRequest::Find { read, .. }
            | WireRequest::Count { read }
            | WireRequest::MapReduce { read, .. } => &read.collection,
        }
    }
}

/// A transport's answer to a [`WireRequest`].
#[derive(Debug, Clone, PartialEq)]
pub enum WireResponse {
    /// A single record (save, refresh, find-one).
    Document(Document),
    /// A list of records (find).
    Documents(Vec<Document>),
    /// A count (count).
    Count(u64),
    /// A raw value (map-reduce output).
    Raw(crate::value::Value),
    /// No payload (delete, ensure-index).
    None,
}

/// Network collaborator executing compiled operations.
///
/// Implementations must preserve field types end-to-end: numbers, strings,
/// booleans, null, nested documents and lists, binary data, and relation
/// references.
pub trait Transport: Send + Sync {
    /// Executes one compiled operation and returns the server's answer.
    fn execute(&self, request: &WireRequest) -> TransportResult<WireResponse>;
}

/// A scripted transport for tests.
///
/// Records every request it receives and answers from a queue of scripted
/// responses. With an empty queue it reports a protocol error.
#[derive(Default)]
pub struct MockTransport {
    responses: Mutex<VecDeque<TransportResult<WireResponse>>>,
    requests: Mutex<Vec<WireRequest>>,
}

impl MockTransport {
    /// Creates a mock with no scripted responses.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Queues a successful response.
    pub fn push_response(&self, response: WireResponse) {
        self.responses.lock().push_back(Ok(response));
    }

    /// Queues a failure.
    pub fn push_error(&self, error: TransportError) {
        self.responses.lock().push_back(Err(error));
    }

    /// All requests executed so far, in order.
    #[must_use]
    pub fn requests(&self) -> Vec<WireRequest> {
        self.requests.lock().clone()
    }

    /// Number of requests executed so far.
    #[must_use]
    pub fn request_count(&self) -> usize {
        self.requests.lock().len()
    }
}

impl Transport for MockTransport {
    fn execute(&self, request: &WireRequest) -> TransportResult<WireResponse> {
        self.requests.lock().push(request.clone());
        self.responses
            .lock()
            .pop_front()
            .unwrap_or_else(|| Err(TransportError::Protocol("no scripted response".into())))
    }
}
