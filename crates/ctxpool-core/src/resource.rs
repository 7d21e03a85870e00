//! Resource handle and factory traits implemented by the host

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::Result;

/// Family of a pooled resource, used to pick the live health probe
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceKind {
    /// Relational database connection, probed with a trivial query
    Database,
    /// Redis client, probed with PING
    Redis,
    /// Anything else; never probed, only aged out
    Other,
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResourceKind::Database => write!(f, "database"),
            ResourceKind::Redis => write!(f, "redis"),
            ResourceKind::Other => write!(f, "other"),
        }
    }
}

/// A shared resource handle that can be pooled
///
/// Implementations wrap a real client (database connection, cache client).
/// The pool never looks inside a resource beyond these operations.
#[async_trait]
pub trait Resource: Send + Sync {
    /// Resource family, used to gate live probes
    fn kind(&self) -> ResourceKind;

    /// Cheap liveness check (`SELECT 1`, `PING`)
    ///
    /// Default implementation reports healthy.
    async fn ping(&self) -> Result<()> {
        Ok(())
    }

    /// Release the underlying client
    async fn close(&self) -> Result<()>;
}

/// Builds new resource instances for one service
#[async_trait]
pub trait InstanceFactory: Send + Sync + 'static {
    /// Create a new resource
    async fn create(&self) -> Result<Arc<dyn Resource>>;
}

#[async_trait]
impl<T: InstanceFactory> InstanceFactory for Arc<T> {
    async fn create(&self) -> Result<Arc<dyn Resource>> {
        (**self).create().await
    }
}
