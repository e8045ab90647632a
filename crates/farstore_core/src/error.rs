//! Error types for farstore core.

use thiserror::Error;

/// Result type for core operations.
pub type CoreResult<T> = Result<T, Error>;

/// Errors that can occur in farstore core operations.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum Error {
    /// A field key contains an illegal character.
    #[error("invalid field key {key:?}: {reason}")]
    InvalidKey {
        /// The offending key.
        key: String,
        /// Why the key was rejected.
        reason: String,
    },

    /// A field value is not representable on the wire.
    #[error("invalid field value: {message}")]
    InvalidValue {
        /// Description of the problem.
        message: String,
    },

    /// A cache-only read found nothing in the cache.
    #[error("no cached result for query")]
    NoCachedResult,

    /// The transport collaborator failed before the server answered.
    #[error("transport failure: {message}")]
    Transport {
        /// Opaque transport-level description.
        message: String,
    },

    /// The server rejected the operation.
    #[error("operation failed with status {code}: {message}")]
    OperationFailed {
        /// Server status code (e.g. 201 for a duplicate key).
        code: u32,
        /// Server-provided message.
        message: String,
    },

    /// The requested record does not exist, or the entity has no id yet.
    #[error("not found: {message}")]
    NotFound {
        /// What was missing.
        message: String,
    },

    /// The request dispatcher has shut down.
    #[error("request dispatcher is shut down")]
    Shutdown,
}

impl Error {
    /// Creates an invalid-key error.
    pub fn invalid_key(key: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidKey {
            key: key.into(),
            reason: reason.into(),
        }
    }

    /// Creates an invalid-value error.
    pub fn invalid_value(message: impl Into<String>) -> Self {
        Self::InvalidValue {
            message: message.into(),
        }
    }

    /// Creates a transport error.
    pub fn transport(message: impl Into<String>) -> Self {
        Self::Transport {
            message: message.into(),
        }
    }

    /// Creates a not-found error.
    pub fn not_found(message: impl Into<String>) -> Self {
        Self::NotFound {
            message: message.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display() {
        let err = Error::invalid_key("a.b", "contains '.'");
        assert_eq!(err.to_string(), "invalid field key \"a.b\": contains '.'");

        let err = Error::OperationFailed {
            code: 201,
            message: "duplicate key".into(),
        };
        assert_eq!(
            err.to_string(),
            "operation failed with status 201: duplicate key"
        );

        assert_eq!(
            Error::NoCachedResult.to_string(),
            "no cached result for query"
        );
    }
}
