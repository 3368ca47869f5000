//! # pgloop-driver
//!
//! Driver abstraction for the pgloop connection pool and query pipeline.
//!
//! The pool and the pipeline never talk to a socket directly. They drive a
//! [`Connection`] through the same non-blocking cycle libpq exposes:
//! send a statement, flush, wait for the socket to become readable, consume
//! input, and drain results once the connection is no longer busy.
//!
//! The `libpq` feature adds `LibpqDriver`, which runs that cycle over the
//! system libpq.
//!
//! ## Example
//!
//! ```rust,ignore
//! use pgloop_driver::{ConnInfo, Driver};
//!
//! let info = ConnInfo::from_env()?;
//! let mut conn = my_driver.connect(&info.to_conninfo())?;
//! conn.set_nonblocking(true)?;
//! conn.send_query("SELECT $1::int + 1", &[Some("41")])?;
//! ```

#![warn(missing_docs)]
#![deny(unsafe_code)]

pub mod connection;
pub mod conninfo;
pub mod error;
#[cfg(feature = "libpq")]
pub mod libpq;
pub mod result;

pub use connection::{ConnStatus, Connection, Driver, FlushStatus, RawSocket};
pub use conninfo::ConnInfo;
pub use error::DriverError;
#[cfg(feature = "libpq")]
pub use libpq::{LibpqConnection, LibpqDriver};
pub use result::{Column, ExecStatus, QueryResult, ResultError};
