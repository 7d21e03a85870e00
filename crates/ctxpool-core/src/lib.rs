//! ctxpool core - shared abstractions for unit-of-work scoped connection pooling
//!
//! This crate provides the types every other ctxpool crate depends on:
//!
//! - `ServiceId`, `ContextId`, `ConnectionId` - identity keys
//! - `Resource` / `InstanceFactory` - the traits a host implements for its clients
//! - `Clock` - injectable time source (`SystemClock`, `ManualClock`)
//! - `PoolingConfig` - tunables loaded from the environment or TOML
//! - `PoolingError` - the error taxonomy shared by the pooling layer

mod clock;
mod config;
mod error;
mod ids;
mod resource;

pub use clock::*;
pub use config::*;
pub use error::*;
pub use ids::*;
pub use resource::*;
