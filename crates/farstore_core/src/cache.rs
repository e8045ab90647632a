//! Query result caching.
//!
//! The cache is a capability, not a storage format: the core only ever asks
//! "give me the cached result for this compiled read" and "remember this
//! result for this compiled read". Where and how results are stored is the
//! implementation's business.

use crate::query::condition::CompiledRead;
use crate::transport::WireResponse;
use parking_lot::Mutex;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::fmt;

/// Value-equality identity of a compiled read.
///
/// Two reads with equal compiled filter, sort, limit, skip, and projection
/// share a key regardless of which `Query` instance produced them. The key
/// is a SHA-256 digest over the canonical JSON form of the compiled read.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct QueryKey([u8; 32]);

impl QueryKey {
    /// Computes the key for a compiled read.
    #[must_use]
    pub fn for_read(read: &CompiledRead) -> Self {
        let bytes =
            serde_json::to_vec(read).unwrap_or_else(|_| format!("{read:?}").into_bytes());
        let digest = Sha256::digest(&bytes);
        Self(digest.into())
    }
}

impl fmt::Debug for QueryKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "QueryKey(")?;
        for byte in &self.0[..6] {
            write!(f, "{byte:02x}")?;
        }
        write!(f, "…)")
    }
}

/// Cache collaborator for query results.
pub trait QueryCache: Send + Sync {
    /// Returns the cached result for a compiled read, if any.
    fn get(&self, key: &QueryKey) -> Option<WireResponse>;

    /// Stores the result for a compiled read, replacing any previous entry.
    fn put(&self, key: &QueryKey, result: WireResponse);
}

/// An unbounded in-memory cache.
#[derive(Default)]
pub struct MemoryCache {
    entries: Mutex<HashMap<QueryKey, WireResponse>>,
}

impl MemoryCache {
    /// Creates an empty cache.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of cached results.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    /// Returns true when nothing is cached.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    /// Drops every cached result.
    pub fn clear(&self) {
        self.entries.lock().clear();
    }
}

impl QueryCache for MemoryCache {
    fn get(&self, key: &QueryKey) -> Option<WireResponse> {
        self.entries.lock().get(key).cloned()
    }

    fn put(&self, key: &QueryKey, result: WireResponse) {
        self.entries.lock().insert(*key, result);
    }
}
