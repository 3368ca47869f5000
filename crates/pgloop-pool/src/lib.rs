//! # pgloop-pool
//!
//! Fixed-size connection pool for the pgloop query engine.
//!
//! Every connection is opened when the pool is created and the slot array
//! never grows or shrinks afterwards. Connections are handed out to exactly
//! one holder at a time and go back to the pool when the holder drops them.
//!
//! ## Features
//!
//! - Non-waiting borrow for setup work ([`Pool::try_get`])
//! - Callback-style requests that complete synchronously when a connection
//!   is free ([`Pool::request`]) and an async form ([`Pool::acquire`])
//! - FIFO hand-off from returning holders to queued requesters
//! - Acquisition timeouts that race safely against hand-off
//! - Transparent repair of broken connections on a blocking worker
//! - Idle connection cleanup and metrics
//!
//! ## Example
//!
//! ```rust,ignore
//! use pgloop_pool::{AcquireTimeout, Pool, PoolConfig};
//! use std::time::Duration;
//!
//! let config = PoolConfig::from_env()?
//!     .size(8)
//!     .acquire_timeout(AcquireTimeout::After(Duration::from_secs(2)));
//!
//! let pool = Pool::new(config, driver)?;
//!
//! // Synchronous borrow for schema setup
//! if let Some(mut conn) = pool.try_get()? {
//!     conn.set_nonblocking(false)?;
//!     // ...
//! }
//!
//! // Async acquisition
//! let conn = pool.acquire().await?;
//!
//! // Check pool status
//! let status = pool.status();
//! println!("Pool utilization: {:.1}%", status.utilization());
//! ```

#![warn(missing_docs)]
#![deny(unsafe_code)]

pub mod config;
pub mod error;
pub mod lifecycle;
pub mod pool;

// Configuration
pub use config::{AcquireTimeout, MAX_POOL_SIZE, PoolConfig};

// Error types
pub use error::PoolError;

// Pool types
pub use pool::{Pool, PoolBuilder, PoolMetrics, PoolStatus, PooledConnection};

// Lifecycle management
pub use lifecycle::{ConnectionMetadata, HealthCheckResult};
