//! Pooled connection handle

use std::fmt;
use std::ops::Deref;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use ctxpool_core::{ConnectionId, Resource, ResourceKind};

/// A resource handle plus the metadata the pool tracks for it
///
/// Cloning is cheap and keeps the same identity: two handles refer to the
/// same pooled connection exactly when their ids are equal.
#[derive(Clone)]
pub struct Connection {
    id: ConnectionId,
    resource: Arc<dyn Resource>,
    created_at: DateTime<Utc>,
}

impl Connection {
    /// Wrap a freshly created resource, allocating a new id
    pub fn new(resource: Arc<dyn Resource>) -> Self {
        Self {
            id: ConnectionId::next(),
            resource,
            created_at: Utc::now(),
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// Get the underlying resource as an Arc
    pub fn resource(&self) -> &Arc<dyn Resource> {
        &self.resource
    }

    pub fn kind(&self) -> ResourceKind {
        self.resource.kind()
    }

    /// Wall-clock time the factory produced this connection
    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    /// Whether both handles refer to the same pooled connection
    pub fn same_as(&self, other: &Connection) -> bool {
        self.id == other.id
    }
}

impl Deref for Connection {
    type Target = dyn Resource;

    fn deref(&self) -> &Self::Target {
        self.resource.as_ref()
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("kind", &self.resource.kind())
            .field("created_at", &self.created_at)
            .finish()
    }
}
