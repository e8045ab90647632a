//! Map-reduce descriptors.

use crate::value::{Document, Value};
use serde::Serialize;
use std::fmt;
use std::sync::Arc;

/// Transform applied locally to a raw map-reduce result before delivery.
pub type ResultProcessor = Arc<dyn Fn(Value) -> Value + Send + Sync>;

/// Configuration for a server-side map-reduce run.
///
/// The map and reduce function bodies are opaque to the client and are
/// evaluated by the server; the optional finalize function runs over the
/// reduced output. `context` injects a flat key/value mapping into the
/// function scope. The descriptor performs no I/O itself.
#[derive(Clone)]
pub struct MapReduce {
    map: String,
    reduce: String,
    finalize: Option<String>,
    context: Document,
    result_processor: Option<ResultProcessor>,
}

impl MapReduce {
    /// Creates a descriptor from map and reduce function bodies.
    ///
    /// Both functions are required; finalize is optional and set separately.
    #[must_use]
    pub fn new(map: impl Into<String>, reduce: impl Into<String>) -> Self {
        Self {
            map: map.into(),
            reduce: reduce.into(),
            finalize: None,
            context: Document::new(),
            result_processor: None,
        }
    }

    /// Sets the finalize function body.
    #[must_use]
    pub fn with_finalize(mut self, finalize: impl Into<String>) -> Self {
        self.finalize = Some(finalize.into());
        self
    }

    /// Injects context values into the function scope.
    #[must_use]
    pub fn with_context(mut self, context: Document) -> Self {
        self.context = context;
        self
    }

    /// Sets the local transform applied to the raw result before delivery.
    #[must_use]
    pub fn with_result_processor<F>(mut self, processor: F) -> Self
    where
        F: Fn(Value) -> Value + Send + Sync + 'static,
    {
        self.result_processor = Some(Arc::new(processor));
        self
    }

    /// The map function body.
    #[must_use]
    pub fn map_function(&self) -> &str {
        &self.map
    }

    /// The reduce function body.
    #[must_use]
    pub fn reduce_function(&self) -> &str {
        &self.reduce
    }

    /// The finalize function body, if set.
    #[must_use]
    pub fn finalize_function(&self) -> Option<&str> {
        self.finalize.as_deref()
    }

    /// The injected context mapping.
    #[must_use]
    pub fn context(&self) -> &Document {
        &self.context
    }

    /// Applies the result processor, passing the value through when none is
    /// configured.
    #[must_use]
    pub fn process(&self, raw: Value) -> Value {
        match &self.result_processor {
            Some(processor) => processor(raw),
            None => raw,
        }
    }

    /// Compiles the wire-facing part of the descriptor.
    #[must_use]
    pub fn compile(&self) -> MapReduceJob {
        MapReduceJob {
            map: self.map.clone(),
            reduce: self.reduce.clone(),
            finalize: self.finalize.clone(),
            context: self.context.clone(),
        }
    }
}

impl fmt::Debug for MapReduce {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MapReduce")
            .field("map", &self.map)
            .field("reduce", &self.reduce)
            .field("finalize", &self.finalize)
            .field("context", &self.context)
            .field("result_processor", &self.result_processor.is_some())
            .finish()
    }
}

/// The wire-facing half of a map-reduce descriptor.
///
/// The local result processor never crosses the wire.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MapReduceJob {
    /// Map function body.
    pub map: String,
    /// Reduce function body.
    pub reduce: String,
    /// Optional finalize function body.
    pub finalize: Option<String>,
    /// Context mapping injected into function scope.
    pub context: Document,
}
