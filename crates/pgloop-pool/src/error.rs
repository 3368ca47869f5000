//! Pool error types.

use std::time::Duration;

use pgloop_driver::DriverError;
use thiserror::Error;

/// Errors from the connection pool.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[non_exhaustive]
pub enum PoolError {
    /// The pool configuration is invalid.
    #[error("invalid pool configuration: {0}")]
    InvalidConfig(String),

    /// Not a single connection could be opened at startup.
    #[error("no connections could be established ({attempted} attempted): {last_error}")]
    NoConnections {
        /// Number of connections attempted.
        attempted: usize,
        /// The last connection error seen.
        last_error: DriverError,
    },

    /// Every connection is in use and the pool does not queue requests.
    #[error("no connection available")]
    Exhausted,

    /// The request waited in the queue for the full acquire timeout.
    #[error("timed out after {0:?} waiting for a connection")]
    Timeout(Duration),

    /// The pool has been closed.
    #[error("pool is closed")]
    PoolClosed,

    /// An asynchronous request was made outside a Tokio runtime.
    #[error("no async runtime available to wait for a connection")]
    NoRuntime,

    /// Repairing or opening a connection failed.
    #[error(transparent)]
    Driver(#[from] DriverError),
}

impl PoolError {
    /// Whether retrying the same request later may succeed.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Exhausted | Self::Timeout(_) | Self::Driver(_))
    }
}
