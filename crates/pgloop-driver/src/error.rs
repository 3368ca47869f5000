//! Driver-level error types.

use thiserror::Error;

/// Errors reported by a database driver.
///
/// Every variant carries the driver's own message text so the error can be
/// cloned and handed to several observers of the same failure.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[non_exhaustive]
pub enum DriverError {
    /// Establishing or re-establishing a connection failed.
    #[error("connection failed: {0}")]
    Connect(String),

    /// The connection could not be switched into the requested blocking mode.
    #[error("failed to change blocking mode: {0}")]
    BlockingMode(String),

    /// Dispatching a statement to the server failed.
    #[error("failed to send statement: {0}")]
    Send(String),

    /// Flushing buffered output or reading input from the socket failed.
    #[error("I/O error: {0}")]
    Io(String),

    /// The cancel request could not be delivered.
    #[error("cancel request failed: {0}")]
    Cancel(String),

    /// A conninfo string or environment setting was malformed.
    #[error("invalid connection parameters: {0}")]
    Config(String),
}
