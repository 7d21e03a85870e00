//! Per-service pool registry, borrow/return/destroy mediation and stats

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use ctxpool_core::{InstanceFactory, PoolingConfig, PoolingError, Result, ServiceId};
use parking_lot::{Mutex, RwLock};

use crate::pool::{BoundedPool, PoolStats, RetryPolicy};
use crate::{Connection, ConnectionLifecycleHandler};

#[cfg(test)]
mod tests;

/// Pools with fewer idle connections than this are left alone by cleanup
const CLEANUP_MIN_IDLE: usize = 5;

/// Cleanup destroys one in this many idle connections (5%)
const CLEANUP_SAMPLE_DIVISOR: usize = 20;

/// Outcome of one maintenance sweep
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CleanupReport {
    /// Pools looked at
    pub pools: usize,
    /// Idle connections destroyed
    pub destroyed: usize,
    /// Connections that could not be taken out of rotation
    pub failed: usize,
}

/// Owns one bounded pool per service
///
/// The pool map is private: callers only ever see `Arc<BoundedPool>` handles
/// and go through the manager to borrow, return or destroy, so every change
/// to a pool is reflected in its stats.
pub struct ConnectionPoolManager {
    config: PoolingConfig,
    lifecycle: Arc<ConnectionLifecycleHandler>,
    pools: RwLock<HashMap<ServiceId, Arc<BoundedPool>>>,
    stats: Mutex<HashMap<ServiceId, PoolStats>>,
}

impl ConnectionPoolManager {
    pub fn new(config: PoolingConfig, lifecycle: Arc<ConnectionLifecycleHandler>) -> Self {
        Self {
            config,
            lifecycle,
            pools: RwLock::new(HashMap::new()),
            stats: Mutex::new(HashMap::new()),
        }
    }

    /// Get the pool for a service, creating it on first use
    ///
    /// `factory` is only used when the pool does not exist yet.
    pub fn get_pool(
        &self,
        service: &ServiceId,
        factory: Arc<dyn InstanceFactory>,
    ) -> Arc<BoundedPool> {
        if let Some(pool) = self.pools.read().get(service) {
            return pool.clone();
        }

        let mut pools = self.pools.write();
        if let Some(pool) = pools.get(service) {
            return pool.clone();
        }

        let pool = Arc::new(BoundedPool::new(
            service.clone(),
            self.config.pool_size(),
            factory,
            RetryPolicy::fixed(
                self.config.reconnect_attempts(),
                self.config.reconnect_sleep(),
            ),
            RetryPolicy::fixed(self.config.retry_attempts(), self.config.retry_sleep()),
        ));
        pools.insert(service.clone(), pool.clone());
        self.stats
            .lock()
            .insert(service.clone(), PoolStats::new(self.config.pool_size()));

        tracing::info!(
            service = %service,
            capacity = self.config.pool_size(),
            "created connection pool"
        );
        pool
    }

    /// Look up an existing pool
    pub fn get_pool_by_id(&self, service: &ServiceId) -> Result<Arc<BoundedPool>> {
        self.pools
            .read()
            .get(service)
            .cloned()
            .ok_or_else(|| PoolingError::PoolNotFound(service.clone()))
    }

    /// Check a connection out of the pool
    pub async fn borrow_connection(
        &self,
        service: &ServiceId,
        pool: &BoundedPool,
    ) -> Result<Connection> {
        let conn = pool.pop().await?;
        self.update_stats(service, PoolStats::record_borrow);
        Ok(conn)
    }

    /// Put a borrowed connection back into rotation
    pub fn return_connection(
        &self,
        service: &ServiceId,
        pool: &BoundedPool,
        conn: Connection,
    ) -> Result<()> {
        pool.push(conn)?;
        self.update_stats(service, PoolStats::record_return);
        Ok(())
    }

    /// Close a borrowed connection and take it out of rotation for good
    ///
    /// Close failures are logged and swallowed; the pool bookkeeping always
    /// runs.
    pub async fn destroy_connection(
        &self,
        service: &ServiceId,
        pool: &BoundedPool,
        conn: Connection,
    ) -> Result<()> {
        close_resource(service, &conn).await;
        self.lifecycle.unregister_connection(&conn);
        pool.destroy(&conn)?;
        self.update_stats(service, PoolStats::record_destroy);

        tracing::debug!(
            service = %service,
            connection_id = %conn.id(),
            pool_available = pool.count(),
            "destroyed connection"
        );
        Ok(())
    }

    /// Close a connection its pool no longer knows and stop tracking its age
    ///
    /// Used when a borrowed connection outlived its pool, e.g. across a
    /// [`reset`](Self::reset). No pool counters change.
    pub(crate) async fn discard_connection(&self, service: &ServiceId, conn: &Connection) {
        close_resource(service, conn).await;
        self.lifecycle.unregister_connection(conn);
        tracing::debug!(
            service = %service,
            connection_id = %conn.id(),
            "discarded connection without a pool"
        );
    }

    /// Destroy a random ~5% of idle connections in every pool holding at
    /// least five, so idle connections don't go stale in place
    #[tracing::instrument(skip(self))]
    pub async fn cleanup(&self) -> CleanupReport {
        let pools: Vec<_> = self
            .pools
            .read()
            .iter()
            .map(|(service, pool)| (service.clone(), pool.clone()))
            .collect();

        let mut report = CleanupReport::default();
        for (service, pool) in pools {
            report.pools += 1;
            tracing::info!(
                service = %service,
                stats = ?self.stats(&service),
                "cleaning connection pool"
            );
            self.cleanup_pool(&service, &pool, &mut report).await;
        }
        report
    }

    async fn cleanup_pool(&self, service: &ServiceId, pool: &BoundedPool, report: &mut CleanupReport) {
        let idle = pool.idle_count();
        if idle < CLEANUP_MIN_IDLE {
            return;
        }

        let to_destroy = (idle / CLEANUP_SAMPLE_DIVISOR).max(1);
        for conn in pool.take_random_idle(to_destroy) {
            close_resource(service, &conn).await;
            self.lifecycle.unregister_connection(&conn);

            match pool.destroy(&conn) {
                Ok(()) => {
                    self.update_stats(service, PoolStats::record_eviction);
                    report.destroyed += 1;
                    tracing::debug!(
                        service = %service,
                        connection_id = %conn.id(),
                        remaining = pool.idle_count(),
                        "evicted idle connection"
                    );
                }
                Err(err) => {
                    report.failed += 1;
                    tracing::debug!(
                        service = %service,
                        error = %err,
                        "failed to evict idle connection"
                    );
                }
            }
        }
    }

    /// Close every idle connection and forget all pools and stats
    ///
    /// Borrowed connections are not touched; return them first.
    pub async fn reset(&self) {
        let pools: Vec<_> = self.pools.write().drain().collect();
        self.stats.lock().clear();

        for (service, pool) in pools {
            for conn in pool.drain_idle() {
                close_resource(&service, &conn).await;
                self.lifecycle.unregister_connection(&conn);
            }
            tracing::info!(service = %service, "closed connection pool");
        }
    }

    /// Snapshot of one pool's counters
    pub fn stats(&self, service: &ServiceId) -> Option<PoolStats> {
        self.stats.lock().get(service).cloned()
    }

    /// Snapshot of every pool's counters, ordered by service
    pub fn all_stats(&self) -> BTreeMap<ServiceId, PoolStats> {
        self.stats
            .lock()
            .iter()
            .map(|(service, stats)| (service.clone(), stats.clone()))
            .collect()
    }

    pub fn pool_count(&self) -> usize {
        self.pools.read().len()
    }

    pub fn config(&self) -> &PoolingConfig {
        &self.config
    }

    pub fn lifecycle(&self) -> &Arc<ConnectionLifecycleHandler> {
        &self.lifecycle
    }

    fn update_stats(&self, service: &ServiceId, update: impl FnOnce(&mut PoolStats)) {
        let mut stats = self.stats.lock();
        let entry = stats
            .entry(service.clone())
            .or_insert_with(|| PoolStats::new(self.config.pool_size()));
        update(entry);
    }
}

async fn close_resource(service: &ServiceId, conn: &Connection) {
    if let Err(err) = conn.resource().close().await {
        tracing::warn!(
            service = %service,
            connection_id = %conn.id(),
            kind = %conn.kind(),
            error = %err,
            "failed to close connection"
        );
    }
}
