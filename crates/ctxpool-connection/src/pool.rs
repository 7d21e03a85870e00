//! Bounded per-service connection storage
//!
//! This module provides the pool primitive the manager builds on: a bounded
//! set of connections created lazily by a factory, with its own reconnect
//! policy for failed creates and retry policy for exhaustion.
//!
//! # Example
//!
//! ```ignore
//! use ctxpool_connection::pool::{BoundedPool, RetryPolicy};
//!
//! let pool = BoundedPool::new(
//!     "db.default".into(),
//!     20,
//!     factory,
//!     RetryPolicy::fixed(3, Duration::from_secs(1)),
//!     RetryPolicy::fixed(3, Duration::from_secs(1)),
//! );
//! let conn = pool.pop().await?;
//! // Use connection...
//! pool.push(conn)?;
//! ```

mod backoff;
mod bounded;
mod stats;


pub use backoff::{BackoffStrategy, RetryPolicy};
pub use bounded::BoundedPool;
pub use stats::PoolStats;
