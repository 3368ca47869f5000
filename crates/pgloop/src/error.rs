//! Query engine error types.

use pgloop_pool::PoolError;
use thiserror::Error;

/// Errors from pipelines and parallel contexts.
///
/// Errors are cloneable so one failure can be reported to the completion
/// callback, the fan-in barrier and an awaiting handle alike.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[non_exhaustive]
pub enum Error {
    /// No connection could be obtained from the pool.
    #[error("no connection: {0}")]
    Pool(#[from] PoolError),

    /// The pipeline has neither a bound connection nor a pool.
    #[error("pipeline has no connection")]
    NotConnected,

    /// A statement could not be queued.
    #[error("invalid statement: {0}")]
    InvalidStatement(String),

    /// Dispatching statement `index` failed.
    #[error("failed to send statement {index}: {message}")]
    Send {
        /// Position of the statement in the queue.
        index: usize,
        /// Driver message.
        message: String,
    },

    /// Reading results for statement `index` failed.
    #[error("failed to read results for statement {index}: {message}")]
    Consume {
        /// Position of the statement in the queue.
        index: usize,
        /// Driver message.
        message: String,
    },

    /// Statement `index` completed with an error status.
    #[error("statement {index} failed: {message}")]
    Statement {
        /// Position of the statement in the queue.
        index: usize,
        /// Server message.
        message: String,
        /// SQLSTATE code, when reported.
        sqlstate: Option<String>,
    },

    /// Waiting for socket readiness failed.
    #[error("readiness I/O error: {0}")]
    Io(String),

    /// A parallel stream index was out of range.
    #[error("stream index {index} out of range for {count} streams")]
    StreamIndex {
        /// Requested index.
        index: usize,
        /// Configured stream count.
        count: usize,
    },

    /// A parallel context was configured with zero streams.
    #[error("parallel context needs at least one stream")]
    NoStreams,

    /// `execute` was called outside a Tokio runtime.
    #[error("no async runtime available")]
    NoRuntime,

    /// Text referenced by a queued statement is no longer in its arena.
    #[error("arena was reset while statements referenced it")]
    ArenaReset,
}

impl Error {
    /// SQLSTATE code for statement errors.
    #[must_use]
    pub fn sqlstate(&self) -> Option<&str> {
        match self {
            Self::Statement { sqlstate, .. } => sqlstate.as_deref(),
            _ => None,
        }
    }

    /// Whether the error was raised before any statement was sent.
    #[must_use]
    pub fn is_acquire_failure(&self) -> bool {
        matches!(self, Self::Pool(_) | Self::NotConnected | Self::NoRuntime)
    }
}
