//! ctxpool connection - unit-of-work scoped connection pooling
//!
//! This crate hands out pooled resource handles per unit of work and takes
//! them back when the unit ends:
//!
//! - `ConnectionBroker` - per-context reuse, retrying acquisition, return-all
//! - `ConnectionPoolManager` - one bounded pool per service, stats, sampled eviction
//! - `ConnectionLifecycleHandler` - age and health decisions
//! - `CleanupScheduler` - time-gated maintenance and unit-of-work boundaries
//! - `ServiceRegistry` - which services are pooled and how they are built
//! - `UnitOfWork` - scoped acquisition with guaranteed release
//!
//! # Example
//!
//! ```ignore
//! use ctxpool_connection::{ConnectionBroker, ServiceRegistry, UnitOfWork};
//!
//! let registry = ServiceRegistry::new();
//! registry.register("db.default", PostgresFactory::new(url));
//! let broker = ConnectionBroker::new(PoolingConfig::from_env()?, Arc::new(registry));
//!
//! UnitOfWork::new(broker.clone(), ContextId::from("req-1"))
//!     .run(|unit| async move {
//!         let conn = unit.acquire(&"db.default".into()).await?;
//!         // Use connection...
//!         Ok::<_, PoolingError>(())
//!     })
//!     .await?;
//! ```

mod broker;
mod connection;
pub mod context;
mod lifecycle;
mod manager;
pub mod pool;
mod registry;
mod scheduler;
pub mod testing;

pub use broker::{ConnectionBroker, ReturnReport};
pub use connection::Connection;
pub use context::{
    ExecutionContextProvider, TaskLocalContextProvider, UnitHandle, UnitOfWork, current_context,
};
pub use lifecycle::ConnectionLifecycleHandler;
pub use manager::{CleanupReport, ConnectionPoolManager};
pub use pool::{BackoffStrategy, BoundedPool, PoolStats, RetryPolicy};
pub use registry::{PatternClassifier, ServiceClassifier, ServiceRegistry};
pub use scheduler::CleanupScheduler;

pub use ctxpool_core::{
    AcquisitionFailure, Clock, ConnectionId, ContextId, InstanceFactory, ManualClock,
    PoolingConfig, PoolingError, Resource, ResourceKind, Result, ServiceId, SharedClock,
    SystemClock,
};
