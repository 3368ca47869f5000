//! # pgloop
//!
//! Async query pipelines over a pooled PostgreSQL connection.
//!
//! Statements are queued on a [`Pipeline`], copied into an [`Arena`], and
//! executed strictly one at a time on a single connection taken from a
//! [`Pool`]. Each statement's callback sees its raw results; the first
//! failure stops the run. A completion callback fires exactly once, before
//! the connection goes back to the pool.
//!
//! ## Features
//!
//! - Ordered statement pipelines with per-statement result callbacks
//! - Transactional execution with automatic `ROLLBACK` on failure
//! - Parallel fan-out of several pipelines with a single completion
//! - Socket-readiness driven I/O, with interval polling when the driver
//!   exposes no socket
//! - Abort of in-flight statements when the pool shuts down
//!
//! ## Example
//!
//! ```rust,ignore
//! use pgloop::{Pipeline, Pool, PoolConfig};
//!
//! let pool = Pool::new(PoolConfig::from_env()?, driver)?;
//!
//! let mut pipeline = Pipeline::new(&pool);
//! pipeline
//!     .queue_params("UPDATE accounts SET balance = balance - $1 WHERE id = $2",
//!         &[Some("100"), Some("1")], |_| {})?
//!     .queue_params("UPDATE accounts SET balance = balance + $1 WHERE id = $2",
//!         &[Some("100"), Some("2")], |_| {})?;
//!
//! match pipeline.execute_transactional()?.outcome().await {
//!     pgloop::Outcome::Completed => println!("transferred"),
//!     other => eprintln!("transfer failed: {other:?}"),
//! }
//! ```

#![warn(missing_docs)]
#![deny(unsafe_code)]

pub mod arena;
pub mod error;
pub mod instrumentation;
pub mod parallel;
pub mod pipeline;
mod readiness;
pub mod transaction;

// Arenas
pub use arena::{Arena, ArenaPool, PooledArena};

// Error types
pub use error::Error;

// Pipelines
pub use pipeline::{CompletionCallback, Outcome, Pipeline, PipelineHandle, ResultCallback};

// Transactions
pub use transaction::IsolationLevel;

// Parallel execution
pub use parallel::{ParallelCallback, ParallelContext, ParallelHandle, ParallelOutcome};

// Instrumentation
pub use instrumentation::SanitizationConfig;

// Re-exports from the pool and driver crates
pub use pgloop_driver::{Connection, Driver, DriverError, ExecStatus, QueryResult};
#[cfg(feature = "libpq")]
pub use pgloop_driver::LibpqDriver;
pub use pgloop_pool::{AcquireTimeout, Pool, PoolConfig, PoolError, PooledConnection};
