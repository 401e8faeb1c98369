//! Backend trait for abstracting the shared key-value store.

use async_trait::async_trait;

use crate::error::BackendError;

/// A single command in a backend batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Atomically add one to `key`, creating it at 1 if absent.
    Incr {
        /// Bucket key
        key: String,
    },
    /// Set the time-to-live of `key` to `seconds`.
    Expire {
        /// Bucket key
        key: String,
        /// Whole seconds until the key is removed
        seconds: u64,
    },
    /// Read the integer stored at `key`.
    Get {
        /// Bucket key
        key: String,
    },
}

impl Command {
    /// The key this command operates on.
    pub fn key(&self) -> &str {
        match self {
            Command::Incr { key } | Command::Expire { key, .. } | Command::Get { key } => key,
        }
    }
}

/// The outcome of a successful command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reply {
    /// An integer result (post-increment value, stored value, or the
    /// store's expire acknowledgement).
    Integer(i64),
    /// The key does not exist.
    Nil,
}

/// Per-command outcomes of a batch, in command order.
pub type BatchReplies = Vec<Result<Reply, BackendError>>;

/// Trait for key-value stores a counter can run against.
///
/// Implementations must be safe to share across tasks without external
/// locking. A batch is sent together; only single-key operations are
/// atomic.
#[async_trait]
pub trait Backend: Send + Sync {
    /// Execute `commands` as one batch.
    ///
    /// An outer error means the batch as a whole failed. Otherwise the
    /// result holds one outcome per command.
    async fn execute(&self, commands: &[Command]) -> Result<BatchReplies, BackendError>;

    /// Release the backend's resources.
    async fn shutdown(&self) {}
}
