//! Connection age and health decisions
//!
//! The lifecycle handler remembers when each connection was first seen and
//! decides whether a connection may go back into rotation: anything at or
//! past the configured lifetime is expired, and resource kinds with a live
//! probe enabled must also answer a ping.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use ctxpool_core::{ConnectionId, PoolingConfig, PoolingError, Result, SharedClock};
use parking_lot::Mutex;

use crate::Connection;


/// Tracks connection ages and runs health checks
pub struct ConnectionLifecycleHandler {
    config: PoolingConfig,
    clock: SharedClock,
    started: Mutex<HashMap<ConnectionId, Instant>>,
}

impl ConnectionLifecycleHandler {
    pub fn new(config: PoolingConfig, clock: SharedClock) -> Self {
        Self {
            config,
            clock,
            started: Mutex::new(HashMap::new()),
        }
    }

    /// Record the first time this connection was seen. Idempotent.
    pub fn register_connection(&self, conn: &Connection) {
        let now = self.clock.now();
        self.started.lock().entry(conn.id()).or_insert(now);
    }

    /// Decide whether a connection is still fit for use
    ///
    /// An unseen connection is registered now and treated as healthy. A seen
    /// one fails with `Expired` once its age reaches the lifetime, and with
    /// `Unhealthy` if its kind has a live probe enabled and the probe fails.
    pub async fn check_connection(&self, conn: &Connection) -> Result<()> {
        let now = self.clock.now();
        let started = {
            let mut started = self.started.lock();
            match started.get(&conn.id()) {
                Some(at) => *at,
                None => {
                    started.insert(conn.id(), now);
                    return Ok(());
                }
            }
        };

        let age = now.saturating_duration_since(started);
        let lifetime = self.config.connection_lifetime();
        if age >= lifetime {
            return Err(PoolingError::Expired {
                connection: conn.id(),
                age_secs: age.as_secs(),
                lifetime_secs: lifetime.as_secs(),
            });
        }

        let kind = conn.kind();
        if self.config.probes(kind) {
            conn.resource()
                .ping()
                .await
                .map_err(|e| PoolingError::Unhealthy {
                    connection: conn.id(),
                    reason: format!("{} connection unhealthy: {}", kind, e),
                })?;
        }

        Ok(())
    }

    /// Forget a connection, typically right after it was destroyed
    pub fn unregister_connection(&self, conn: &Connection) {
        self.started.lock().remove(&conn.id());
    }

    /// Stable identity key for the connection's whole lifetime
    pub fn connection_id(&self, conn: &Connection) -> ConnectionId {
        conn.id()
    }

    /// Time since the connection was first registered, if it is tracked
    pub fn connection_age(&self, conn: &Connection) -> Option<Duration> {
        let started = *self.started.lock().get(&conn.id())?;
        Some(self.clock.now().saturating_duration_since(started))
    }

    /// Number of connections with a tracked age
    pub fn tracked_count(&self) -> usize {
        self.started.lock().len()
    }

    pub fn lifetime(&self) -> Duration {
        self.config.connection_lifetime()
    }
}
