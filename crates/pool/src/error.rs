//! Error types for the state pool
use thiserror::Error;

/// Result type for pool operations
pub type Result<T> = std::result::Result<T, Error>;

/// Error type for configuration, allocation and execution failures
#[derive(Error, Debug)]
pub enum Error {
    /// Every slot is checked out and the pool may not grow any further
    #[error("State pool is full: {max_num} states in use")]
    PoolFull {
        /// Configured capacity
        max_num: usize,
    },

    /// The pool is draining; no new checkouts are accepted
    #[error("State pool is exiting")]
    Exiting,

    /// The pool has been terminated and cannot be restarted
    #[error("State pool is dead")]
    Dead,

    /// The state was already closed and cannot be returned
    #[error("Lua state is already closed")]
    Closed,

    /// Idle timeout is not `<integer><d|h|m|s>`
    #[error("Invalid idle timeout format '{value}': expected <n><d|h|m|s>")]
    IdleTimeoutFormat {
        /// The rejected input
        value: String,
    },

    /// Pool configuration is invalid
    #[error("Configuration error: {message}")]
    Configuration {
        /// The error message
        message: String,
        /// The underlying parse error (if available)
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// Building a Lua state or running its init hook failed
    #[error("Failed to initialize Lua state: {reason}")]
    Initialization {
        /// The failure reason
        reason: String,
        /// The interpreter error
        #[source]
        source: mlua::Error,
    },

    /// A chunk failed to compile or raised an error while running
    #[error("Script error: {0}")]
    Script(#[from] mlua::Error),

    /// Execution exceeded the request terminate timeout
    #[error("Execution timed out after {timeout_secs}s")]
    Timeout {
        /// The configured timeout in seconds
        timeout_secs: u64,
    },

    /// Execution was aborted because its context was cancelled
    #[error("Execution cancelled")]
    Cancelled,

    /// Reading a chunk from a file or reader failed
    #[error("Failed to read chunk '{name}': {source}")]
    Io {
        /// File path or chunk name
        name: String,
        /// The underlying I/O error
        #[source]
        source: std::io::Error,
    },
}

impl Error {
    /// Create a configuration error caused by a parse failure
    pub fn configuration<S, E>(message: S, source: E) -> Self
    where
        S: Into<String>,
        E: std::error::Error + Send + Sync + 'static,
    {
        Self::Configuration {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    /// Create an initialization error from an interpreter failure
    pub fn initialization<S: Into<String>>(reason: S, source: mlua::Error) -> Self {
        Self::Initialization {
            reason: reason.into(),
            source,
        }
    }

    /// Check if the caller may retry the same request later
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::PoolFull { .. } | Self::Timeout { .. })
    }

    /// Check if this error reflects the pool's lifecycle rather than the request
    #[must_use]
    pub fn is_lifecycle(&self) -> bool {
        matches!(self, Self::Exiting | Self::Dead | Self::Closed)
    }
}
