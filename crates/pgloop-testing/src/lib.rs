//! # pgloop-testing
//!
//! Test infrastructure for the pgloop crates.
//!
//! [`MockDriver`] implements the driver traits entirely in memory. Tests
//! script responses per statement, slow statements down with busy polls,
//! pause progress to hold a statement in flight, and break connections to
//! exercise health repair.
//!
//! ## Example
//!
//! ```rust,ignore
//! use pgloop_testing::{MockDriver, MockResponse};
//!
//! let driver = MockDriver::new();
//! driver.respond("FROM users", MockResponse::rows(&["id"], &[&["1"]]));
//! driver.respond("INSERT", MockResponse::error("23505", "duplicate key"));
//!
//! let pool = Pool::builder().size(2).driver(driver.clone()).build()?;
//! ```

#![warn(missing_docs)]
#![deny(unsafe_code)]

pub mod mock;

pub use mock::{MockConnection, MockDriver, MockResponse, SentQuery};
