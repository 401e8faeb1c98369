//! Error types for the rate window counter.

use std::fmt;
use std::time::Duration;

use thiserror::Error;

/// Main error type for counter operations.
#[derive(Error, Debug)]
pub enum RateWindowError {
    /// Configuration-related errors, including a backend that cannot be
    /// reached while the counter is being constructed.
    #[error("Configuration error: {0}")]
    Config(String),

    /// A command against the backend failed during `increment` or `get`.
    #[error("Backend {phase} failed: {source}")]
    Backend {
        /// Which step of the operation failed.
        phase: Phase,
        /// The underlying backend failure.
        #[source]
        source: BackendError,
    },

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl RateWindowError {
    pub(crate) fn backend(phase: Phase, source: BackendError) -> Self {
        RateWindowError::Backend { phase, source }
    }

    /// The failing phase, for backend errors.
    pub fn phase(&self) -> Option<Phase> {
        match self {
            RateWindowError::Backend { phase, .. } => Some(*phase),
            _ => None,
        }
    }

    /// Whether this error came from talking to the backend.
    pub fn is_backend(&self) -> bool {
        matches!(self, RateWindowError::Backend { .. })
    }
}

/// The step of a counter operation a backend failure belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Phase {
    /// Incrementing the current window's bucket.
    Increment,
    /// Refreshing the bucket's time-to-live.
    Expire,
    /// Reading the current and previous buckets.
    Read,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Phase::Increment => "increment",
            Phase::Expire => "expire",
            Phase::Read => "read",
        };
        f.write_str(name)
    }
}

/// Failures reported by a [`Backend`](crate::ratelimit::Backend).
#[derive(Error, Debug)]
pub enum BackendError {
    /// Transport or protocol failure from the Redis client.
    #[error("redis error: {0}")]
    Redis(#[from] redis::RedisError),

    /// The server rejected a single command in a batch.
    #[error("server error: {0}")]
    Server(String),

    /// The server answered with a value the counter cannot interpret.
    #[error("unexpected reply: {0}")]
    UnexpectedReply(String),

    /// The configured per-command timeout elapsed.
    #[error("command timed out after {0:?}")]
    Timeout(Duration),

    /// The caller's deadline passed before the backend answered.
    #[error("deadline exceeded")]
    DeadlineExceeded,

    /// The backend cannot serve requests.
    #[error("backend unavailable: {0}")]
    Unavailable(String),
}

/// Result type alias for counter operations.
pub type Result<T> = std::result::Result<T, RateWindowError>;
