//! Client configuration.

use std::fmt;
use std::time::Duration;

/// Connection parameters for a [`Client`](crate::client::Client).
///
/// Built once, injected at client construction, and immutable afterwards.
/// There is no process-wide configuration; two clients with different
/// endpoints coexist without interference.
#[derive(Clone)]
pub struct ClientConfig {
    /// Absolute URL of the service endpoint.
    pub endpoint: String,
    /// Request timeout handed to the transport.
    pub timeout: Duration,
    secret: String,
}

impl ClientConfig {
    /// Creates a configuration for an endpoint and shared secret.
    #[must_use]
    pub fn new(endpoint: impl Into<String>, secret: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            timeout: Duration::from_secs(30),
            secret: secret.into(),
        }
    }

    /// Sets the request timeout.
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// The shared secret the transport sends with each request.
    #[must_use]
    pub fn secret(&self) -> &str {
        &self.secret
    }
}

impl fmt::Debug for ClientConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientConfig")
            .field("endpoint", &self.endpoint)
            .field("timeout", &self.timeout)
            .field("secret", &"<redacted>")
            .finish()
    }
}
