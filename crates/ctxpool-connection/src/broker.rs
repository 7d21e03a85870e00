//! Per-context connection reuse on top of the pool manager
//!
//! The broker keeps a table of what each unit of work has borrowed. Within
//! one context the same service always yields the same connection until the
//! context returns everything; new connections are checked for age and
//! health before they are handed out, and rejected candidates are destroyed.

use std::collections::HashMap;
use std::sync::Arc;

use ctxpool_core::{
    AcquisitionFailure, ContextId, PoolingConfig, PoolingError, Result, ServiceId, SharedClock,
    system_clock,
};
use parking_lot::Mutex;
use rand::Rng;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

use crate::pool::BoundedPool;
use crate::{Connection, ConnectionLifecycleHandler, ConnectionPoolManager, ServiceRegistry};


/// Connections one context currently holds, at most one per service
///
/// The row lock is held for the whole of an acquire or return, so work on
/// one context serializes. A row is only taken out of the table while its
/// lock is held, and lockers re-check the table once they get the lock.
type BorrowedRow = Arc<AsyncMutex<HashMap<ServiceId, Connection>>>;
type HeldRow = OwnedMutexGuard<HashMap<ServiceId, Connection>>;

/// Outcome of returning everything a context borrowed
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReturnReport {
    /// Connections put back into their pool
    pub returned: usize,
    /// Expired or unhealthy connections destroyed instead
    pub destroyed: usize,
    /// Entries that could not be handed back to any pool
    pub failed: usize,
}

/// Hands out pooled connections per unit of work
pub struct ConnectionBroker {
    config: PoolingConfig,
    manager: Arc<ConnectionPoolManager>,
    lifecycle: Arc<ConnectionLifecycleHandler>,
    registry: Arc<ServiceRegistry>,
    borrowed: Mutex<HashMap<ContextId, BorrowedRow>>,
}

impl ConnectionBroker {
    /// Create a broker measuring connection age with the system clock
    pub fn new(config: PoolingConfig, registry: Arc<ServiceRegistry>) -> Arc<Self> {
        Self::with_clock(config, registry, system_clock())
    }

    /// Create a broker with its own pool manager and lifecycle handler
    pub fn with_clock(
        config: PoolingConfig,
        registry: Arc<ServiceRegistry>,
        clock: SharedClock,
    ) -> Arc<Self> {
        let lifecycle = Arc::new(ConnectionLifecycleHandler::new(config.clone(), clock));
        let manager = Arc::new(ConnectionPoolManager::new(config.clone(), lifecycle));
        Self::with_parts(config, manager, registry)
    }

    /// Create a broker on top of an existing pool manager
    pub fn with_parts(
        config: PoolingConfig,
        manager: Arc<ConnectionPoolManager>,
        registry: Arc<ServiceRegistry>,
    ) -> Arc<Self> {
        Arc::new(Self {
            config,
            lifecycle: manager.lifecycle().clone(),
            manager,
            registry,
            borrowed: Mutex::new(HashMap::new()),
        })
    }

    /// Get the connection for `service` within `ctx`
    ///
    /// This will:
    /// 1. Return the connection `ctx` already holds for `service`, without
    ///    touching the pool
    /// 2. Otherwise borrow candidates from the service's pool, destroying
    ///    every expired or unhealthy one, until one passes or the configured
    ///    attempts run out
    ///
    /// Running out of attempts fails with `AcquisitionFailed`, which is
    /// fatal for the worker.
    #[tracing::instrument(skip_all, fields(service = %service, context = %ctx))]
    pub async fn acquire(&self, service: &ServiceId, ctx: &ContextId) -> Result<Connection> {
        let (row, mut held) = self.lock_row(ctx).await;

        if let Some(conn) = held.get(service) {
            tracing::trace!(connection_id = %conn.id(), "reusing borrowed connection");
            return Ok(conn.clone());
        }

        match self.acquire_new(service, ctx, held.len()).await {
            Ok(conn) => {
                held.insert(service.clone(), conn.clone());
                Ok(conn)
            }
            Err(err) => {
                if held.is_empty() {
                    self.detach_row(ctx, &row);
                }
                Err(err)
            }
        }
    }

    async fn acquire_new(
        &self,
        service: &ServiceId,
        ctx: &ContextId,
        context_borrowed: usize,
    ) -> Result<Connection> {
        let factory = self.registry.resolve(service)?;
        let pool = self.manager.get_pool(service, factory);

        let attempts = self.config.acquire_attempts();
        let backoff = self.config.acquire_backoff();
        let mut errors = Vec::with_capacity(attempts as usize);

        for attempt in 1..=attempts {
            match self.try_candidate(service, &pool).await {
                Ok(conn) => {
                    tracing::debug!(
                        connection_id = %conn.id(),
                        attempt,
                        pool_available = pool.count(),
                        "borrowed connection"
                    );
                    return Ok(conn);
                }
                Err(err) => {
                    tracing::warn!(attempt, error = %err, "connection candidate rejected");
                    errors.push(err.to_string());
                    if !backoff.is_zero() && attempt < attempts {
                        tokio::time::sleep(backoff).await;
                    }
                }
            }
        }

        let live_contexts = self.context_count().saturating_sub(usize::from(context_borrowed == 0));
        let failure = AcquisitionFailure {
            service: service.clone(),
            context: ctx.clone(),
            attempts,
            errors,
            context_borrowed,
            live_contexts,
        };
        tracing::error!(
            attempts,
            errors = ?failure.errors,
            context_borrowed,
            live_contexts,
            pool_available = pool.count(),
            "failed to acquire connection"
        );
        Err(PoolingError::AcquisitionFailed(Box::new(failure)))
    }

    /// Borrow one candidate and vet it, destroying it if it fails
    async fn try_candidate(&self, service: &ServiceId, pool: &BoundedPool) -> Result<Connection> {
        let conn = self.manager.borrow_connection(service, pool).await?;
        self.lifecycle.register_connection(&conn);

        if let Err(err) = self.lifecycle.check_connection(&conn).await {
            let id = conn.id();
            if let Err(destroy_err) = self.manager.destroy_connection(service, pool, conn).await {
                tracing::warn!(
                    connection_id = %id,
                    error = %destroy_err,
                    "failed to destroy rejected candidate"
                );
            }
            return Err(err);
        }
        Ok(conn)
    }

    /// Hand back everything `ctx` borrowed
    ///
    /// Healthy connections go back to their pool, expired or unhealthy ones
    /// are destroyed. An entry whose pool no longer knows it is closed,
    /// logged and counted as failed. The context has no borrowed connections
    /// afterwards.
    ///
    /// Each entry stays in the context's row until it has been handled, so
    /// if this future is dropped part way the next `return_all` for `ctx`
    /// picks up the rest.
    #[tracing::instrument(skip_all, fields(context = %ctx))]
    pub async fn return_all(&self, ctx: &ContextId) -> ReturnReport {
        let mut report = ReturnReport::default();

        if let Some((row, mut held)) = self.lock_existing_row(ctx).await {
            let services: Vec<ServiceId> = held.keys().cloned().collect();
            for service in services {
                let Some(conn) = held.get(&service).cloned() else {
                    continue;
                };
                self.return_one(&service, conn, &mut report).await;
                held.remove(&service);
            }
            self.detach_row(ctx, &row);
        }

        self.maybe_run_maintenance().await;
        report
    }

    async fn return_one(&self, service: &ServiceId, conn: Connection, report: &mut ReturnReport) {
        let pool = match self.manager.get_pool_by_id(service) {
            Ok(pool) => pool,
            Err(err) => {
                tracing::error!(
                    service = %service,
                    connection_id = %conn.id(),
                    error = %err,
                    "failed to find pool for borrowed connection"
                );
                self.manager.discard_connection(service, &conn).await;
                report.failed += 1;
                return;
            }
        };

        match self.lifecycle.check_connection(&conn).await {
            Ok(()) => match self.manager.return_connection(service, &pool, conn.clone()) {
                Ok(()) => {
                    report.returned += 1;
                    tracing::debug!(
                        service = %service,
                        connection_id = %conn.id(),
                        pool_available = pool.count(),
                        "returned connection"
                    );
                }
                Err(err) => {
                    tracing::error!(
                        service = %service,
                        connection_id = %conn.id(),
                        error = %err,
                        "failed to return connection"
                    );
                    self.manager.discard_connection(service, &conn).await;
                    report.failed += 1;
                }
            },
            Err(reason) => {
                tracing::warn!(
                    service = %service,
                    connection_id = %conn.id(),
                    reason = %reason,
                    "destroying connection instead of returning it"
                );
                match self.manager.destroy_connection(service, &pool, conn).await {
                    Ok(()) => report.destroyed += 1,
                    Err(err) => {
                        report.failed += 1;
                        tracing::error!(service = %service, error = %err, "failed to destroy connection");
                    }
                }
            }
        }
    }

    /// Occasionally sweep idle connections as part of normal traffic
    async fn maybe_run_maintenance(&self) {
        let probability = self.config.maintenance_probability();
        if probability <= 0.0 {
            return;
        }

        let due = probability >= 1.0 || rand::thread_rng().gen_bool(probability);
        if due {
            let report = self.manager.cleanup().await;
            tracing::debug!(
                pools = report.pools,
                destroyed = report.destroyed,
                failed = report.failed,
                "ran piggybacked pool maintenance"
            );
        }
    }

    /// Lock the row for `ctx`, creating it if needed
    async fn lock_row(&self, ctx: &ContextId) -> (BorrowedRow, HeldRow) {
        loop {
            let row = self.borrowed.lock().entry(ctx.clone()).or_default().clone();
            let held = row.clone().lock_owned().await;
            if self.is_current_row(ctx, &row) {
                return (row, held);
            }
        }
    }

    /// Lock the row for `ctx` if it has one
    async fn lock_existing_row(&self, ctx: &ContextId) -> Option<(BorrowedRow, HeldRow)> {
        loop {
            let row = self.borrowed.lock().get(ctx).cloned()?;
            let held = row.clone().lock_owned().await;
            if self.is_current_row(ctx, &row) {
                return Some((row, held));
            }
        }
    }

    fn is_current_row(&self, ctx: &ContextId, row: &BorrowedRow) -> bool {
        self.borrowed
            .lock()
            .get(ctx)
            .is_some_and(|current| Arc::ptr_eq(current, row))
    }

    /// Take `row` out of the table; callers hold its lock
    fn detach_row(&self, ctx: &ContextId, row: &BorrowedRow) {
        let mut rows = self.borrowed.lock();
        if rows.get(ctx).is_some_and(|current| Arc::ptr_eq(current, row)) {
            rows.remove(ctx);
        }
    }

    /// Number of connections `ctx` currently holds
    pub async fn borrowed_count(&self, ctx: &ContextId) -> usize {
        let row = self.borrowed.lock().get(ctx).cloned();
        match row {
            Some(row) => row.lock().await.len(),
            None => 0,
        }
    }

    /// Whether `ctx` currently holds a connection for `service`
    pub async fn is_borrowed(&self, ctx: &ContextId, service: &ServiceId) -> bool {
        let row = self.borrowed.lock().get(ctx).cloned();
        match row {
            Some(row) => row.lock().await.contains_key(service),
            None => false,
        }
    }

    /// Number of contexts with a borrowed-connection row
    pub fn context_count(&self) -> usize {
        self.borrowed.lock().len()
    }

    pub fn config(&self) -> &PoolingConfig {
        &self.config
    }

    pub fn manager(&self) -> &Arc<ConnectionPoolManager> {
        &self.manager
    }

    pub fn lifecycle(&self) -> &Arc<ConnectionLifecycleHandler> {
        &self.lifecycle
    }

    pub fn registry(&self) -> &Arc<ServiceRegistry> {
        &self.registry
    }
}
