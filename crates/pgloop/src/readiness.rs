//! Socket readiness for in-flight statements.
//!
//! Connections that expose a socket are registered with the Tokio reactor.
//! Anything else, or a socket the reactor refuses, is polled on an interval.

use std::time::Duration;

use pgloop_driver::RawSocket;
use tokio::time::{Interval, MissedTickBehavior};

use crate::error::Error;

#[cfg(unix)]
use tokio::io::Interest;
#[cfg(unix)]
use tokio::io::unix::AsyncFd;

/// Borrowed socket descriptor. The driver keeps ownership; dropping this
/// only deregisters it.
#[cfg(unix)]
#[derive(Debug)]
struct SocketFd(RawSocket);

#[cfg(unix)]
impl std::os::unix::io::AsRawFd for SocketFd {
    fn as_raw_fd(&self) -> std::os::unix::io::RawFd {
        self.0
    }
}

/// A readiness registration for one connection.
#[derive(Debug)]
pub(crate) enum Readiness {
    /// Native reactor registration.
    #[cfg(unix)]
    Socket(AsyncFd<SocketFd>),
    /// Interval-based fallback.
    Poll(Interval),
}

impl Readiness {
    /// Register a connection socket, falling back to polling every
    /// `poll_interval`. Must be called from within a Tokio runtime.
    pub(crate) fn register(socket: Option<RawSocket>, poll_interval: Duration) -> Self {
        if let Some(readiness) = socket.and_then(Self::register_socket) {
            return readiness;
        }

        let mut interval = tokio::time::interval(poll_interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        Self::Poll(interval)
    }

    #[cfg(unix)]
    fn register_socket(fd: RawSocket) -> Option<Self> {
        match AsyncFd::with_interest(SocketFd(fd), Interest::READABLE | Interest::WRITABLE) {
            Ok(fd) => Some(Self::Socket(fd)),
            Err(e) => {
                tracing::debug!(error = %e, "socket registration failed; polling instead");
                None
            }
        }
    }

    #[cfg(not(unix))]
    fn register_socket(_fd: RawSocket) -> Option<Self> {
        None
    }

    /// Wait until the socket may have input.
    pub(crate) async fn readable(&mut self) -> Result<(), Error> {
        match self {
            #[cfg(unix)]
            Self::Socket(fd) => {
                let mut guard = fd.readable().await.map_err(|e| Error::Io(e.to_string()))?;
                // Cleared before the driver reads so a later arrival re-arms it.
                guard.clear_ready();
                Ok(())
            }
            Self::Poll(interval) => {
                interval.tick().await;
                Ok(())
            }
        }
    }

    /// Wait until the socket can take more output.
    pub(crate) async fn writable(&mut self) -> Result<(), Error> {
        match self {
            #[cfg(unix)]
            Self::Socket(fd) => {
                let mut guard = fd.writable().await.map_err(|e| Error::Io(e.to_string()))?;
                guard.clear_ready();
                Ok(())
            }
            Self::Poll(interval) => {
                interval.tick().await;
                Ok(())
            }
        }
    }

    /// Whether this registration uses the interval fallback.
    pub(crate) fn is_polling(&self) -> bool {
        matches!(self, Self::Poll(_))
    }
}
