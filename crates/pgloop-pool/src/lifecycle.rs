//! Connection lifecycle: opening, health checks and repair.
//!
//! Every function here is blocking. The pool runs them directly at startup
//! and from [`Pool::try_get`](crate::Pool::try_get), and on a blocking
//! worker thread everywhere else.

use std::time::Instant;

use pgloop_driver::{Connection, Driver, DriverError};

/// Bookkeeping kept for each pool slot.
#[derive(Debug, Clone, Copy)]
pub struct ConnectionMetadata {
    /// Slot index within the pool.
    pub slot: usize,
    /// When the current physical connection was opened.
    pub created_at: Instant,
    /// When the connection was last returned to the pool.
    pub last_used: Instant,
    /// Number of times the slot has been checked out.
    pub checkouts: u64,
}

impl ConnectionMetadata {
    pub(crate) fn new(slot: usize) -> Self {
        let now = Instant::now();
        Self {
            slot,
            created_at: now,
            last_used: now,
            checkouts: 0,
        }
    }

    /// How long the connection has been open.
    #[must_use]
    pub fn age(&self) -> std::time::Duration {
        self.created_at.elapsed()
    }

    /// How long since the connection was last returned.
    #[must_use]
    pub fn idle_time(&self) -> std::time::Duration {
        self.last_used.elapsed()
    }
}

/// How a connection was brought back into service.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthCheckResult {
    /// The existing connection was reset in place.
    Reset,
    /// A new physical connection replaced the old one.
    Reconnected,
}

/// Open a connection and switch it to non-blocking mode.
pub(crate) fn open(driver: &dyn Driver, conninfo: &str) -> Result<Box<dyn Connection>, DriverError> {
    let mut conn = driver.connect(conninfo)?;
    if !conn.is_ok() {
        return Err(DriverError::Connect(conn.error_message()));
    }
    conn.set_nonblocking(true)?;
    Ok(conn)
}

/// Bring a slot back into service.
///
/// An existing connection is reset first; if the reset fails or leaves the
/// connection unhealthy it is closed and a new one opened. An empty slot
/// always gets a new connection.
pub(crate) fn repair(
    driver: &dyn Driver,
    conninfo: &str,
    conn: Option<Box<dyn Connection>>,
) -> Result<(Box<dyn Connection>, HealthCheckResult), DriverError> {
    if let Some(mut conn) = conn {
        match conn.reset() {
            Ok(()) if conn.is_ok() => {
                conn.set_nonblocking(true)?;
                return Ok((conn, HealthCheckResult::Reset));
            }
            Ok(()) => {
                tracing::debug!(error = %conn.error_message(), "reset left connection unhealthy");
            }
            Err(e) => {
                tracing::debug!(error = %e, "connection reset failed");
            }
        }
    }

    open(driver, conninfo).map(|conn| (conn, HealthCheckResult::Reconnected))
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use pgloop_testing::MockDriver;

    #[test]
    fn test_open_sets_nonblocking() {
        let driver = MockDriver::new();
        let conn = open(&driver, "host=x").unwrap();
        assert!(conn.is_ok());
        assert_eq!(driver.conninfos(), vec!["host=x".to_string()]);
    }

    #[test]
    fn test_repair_prefers_reset() {
        let driver = MockDriver::new();
        let conn = open(&driver, "").unwrap();
        driver.break_all();

        let (conn, how) = repair(&driver, "", Some(conn)).unwrap();
        assert_eq!(how, HealthCheckResult::Reset);
        assert!(conn.is_ok());
        assert_eq!(driver.connect_attempts(), 1);
    }

    #[test]
    fn test_repair_reconnects_when_reset_fails() {
        let driver = MockDriver::new();
        let conn = open(&driver, "").unwrap();
        driver.break_all();
        driver.fail_resets(true);

        let (_conn, how) = repair(&driver, "", Some(conn)).unwrap();
        assert_eq!(how, HealthCheckResult::Reconnected);
        assert_eq!(driver.connect_attempts(), 2);
        assert_eq!(driver.live_connections(), 1);
    }

    #[test]
    fn test_repair_empty_slot() {
        let driver = MockDriver::new();
        driver.refuse_connects(true);
        assert!(repair(&driver, "", None).is_err());

        driver.refuse_connects(false);
        let (_conn, how) = repair(&driver, "", None).unwrap();
        assert_eq!(how, HealthCheckResult::Reconnected);
    }
}
