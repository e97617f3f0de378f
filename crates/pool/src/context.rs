//! Execution context with cancellation support

use std::collections::HashMap;
use tokio_util::sync::CancellationToken;

/// Context for pool operations.
///
/// Carries a request identifier, cooperative cancellation and arbitrary
/// metadata. States created under a context derive their own token from it,
/// so cancelling the context a pool was started with cancels every state it
/// allocated.
#[derive(Debug, Clone)]
pub struct Context {
    /// Identifier of the request on whose behalf the pool is used.
    pub request_id: String,
    /// Cooperative cancellation token. Running chunks observe it through the
    /// execution watchdog and abort once it fires.
    pub cancellation: CancellationToken,
    /// Arbitrary key-value pairs (e.g. tenant, route) surfaced in logs.
    pub metadata: HashMap<String, String>,
}

impl Context {
    /// Create a new context for the given request ID.
    pub fn new(request_id: impl Into<String>) -> Self {
        Self {
            request_id: request_id.into(),
            cancellation: CancellationToken::new(),
            metadata: HashMap::new(),
        }
    }

    /// Create a background context with no request attached.
    pub fn background() -> Self {
        Self::new("background")
    }

    /// Add a key-value metadata pair to the context.
    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    /// Replace the default cancellation token with the provided one.
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancellation = token;
        self
    }

    /// Derive a child context sharing metadata whose token is cancelled
    /// together with this one.
    #[must_use]
    pub fn child(&self, request_id: impl Into<String>) -> Self {
        Self {
            request_id: request_id.into(),
            cancellation: self.cancellation.child_token(),
            metadata: self.metadata.clone(),
        }
    }

    /// Whether the context has been cancelled.
    pub fn is_cancelled(&self) -> bool {
        self.cancellation.is_cancelled()
    }
}

impl Default for Context {
    fn default() -> Self {
        Self::background()
    }
}
