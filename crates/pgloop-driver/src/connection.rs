//! Connection and driver traits.
//!
//! These traits describe the non-blocking libpq-style surface the pool and
//! the query pipeline are written against. A connection sends one statement
//! at a time, is driven forward with [`Connection::consume_input`] when its
//! socket turns readable, and hands back results until
//! [`Connection::next_result`] returns `None`.

use crate::error::DriverError;
use crate::result::QueryResult;

/// Raw OS socket handle used for readiness notification.
#[cfg(unix)]
pub type RawSocket = std::os::unix::io::RawFd;

/// Raw OS socket handle used for readiness notification.
#[cfg(not(unix))]
pub type RawSocket = u64;

/// Connection health as reported by the driver.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnStatus {
    /// The connection is usable.
    Ok,
    /// The connection is broken and must be reset or replaced.
    Bad,
}

/// Outcome of flushing buffered outgoing data.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushStatus {
    /// Everything has been written.
    Done,
    /// Data remains; wait for the socket to become writable and flush again.
    Pending,
}

/// A single server connection in non-blocking mode.
pub trait Connection: Send {
    /// Current health status.
    fn status(&self) -> ConnStatus;

    /// The most recent error message reported by the connection.
    fn error_message(&self) -> String;

    /// Switch the connection between blocking and non-blocking I/O.
    fn set_nonblocking(&mut self, nonblocking: bool) -> Result<(), DriverError>;

    /// Send a statement with positional text parameters (`$1`, `$2`, ...).
    ///
    /// `None` entries are sent as SQL NULL. Only one statement may be in
    /// flight at a time.
    fn send_query(&mut self, sql: &str, params: &[Option<&str>]) -> Result<(), DriverError>;

    /// Flush buffered outgoing data.
    fn flush(&mut self) -> Result<FlushStatus, DriverError> {
        Ok(FlushStatus::Done)
    }

    /// Read whatever input is available from the socket.
    fn consume_input(&mut self) -> Result<(), DriverError>;

    /// Whether a result is still being received.
    fn is_busy(&self) -> bool;

    /// Take the next complete result, or `None` once the statement is done.
    fn next_result(&mut self) -> Option<QueryResult>;

    /// Ask the server to cancel the statement in flight.
    fn cancel(&mut self) -> Result<(), DriverError>;

    /// Re-establish the connection in place. Blocking.
    fn reset(&mut self) -> Result<(), DriverError>;

    /// Socket handle for readiness polling, if the driver exposes one.
    ///
    /// Connections without a socket are polled on a timer instead.
    fn socket(&self) -> Option<RawSocket> {
        None
    }

    /// Whether the connection reports itself healthy.
    fn is_ok(&self) -> bool {
        self.status() == ConnStatus::Ok
    }
}

/// Factory for new connections.
pub trait Driver: Send + Sync {
    /// Open a blocking connection described by a libpq-style conninfo string.
    fn connect(&self, conninfo: &str) -> Result<Box<dyn Connection>, DriverError>;
}
