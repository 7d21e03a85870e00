//! Execution contexts and scoped units of work
//!
//! A unit of work (one request, one queue message) runs inside a
//! [`UnitOfWork`], which makes its `ContextId` visible to everything the
//! task calls and hands every borrowed connection back when the work ends,
//! however it ends.

use std::future::Future;
use std::sync::Arc;

use ctxpool_core::{ContextId, Result, ServiceId};

use crate::{Connection, ConnectionBroker};

tokio::task_local! {
    /// Context of the unit of work the current task is running
    static CURRENT_CONTEXT: ContextId;
}

/// Identifies the unit of work the caller is running in
pub trait ExecutionContextProvider: Send + Sync {
    fn current_id(&self) -> ContextId;
}

/// Context of the enclosing [`UnitOfWork`], if any
pub fn current_context() -> Option<ContextId> {
    CURRENT_CONTEXT.try_with(|ctx| ctx.clone()).ok()
}

/// Reads the context set by [`UnitOfWork::run`]
///
/// Outside any unit of work every caller shares one per-process context.
#[derive(Debug, Clone, Copy, Default)]
pub struct TaskLocalContextProvider;

impl ExecutionContextProvider for TaskLocalContextProvider {
    fn current_id(&self) -> ContextId {
        current_context().unwrap_or_else(ContextId::process)
    }
}

/// Scoped acquisition with guaranteed release
pub struct UnitOfWork {
    broker: Arc<ConnectionBroker>,
    context: ContextId,
}

impl UnitOfWork {
    pub fn new(broker: Arc<ConnectionBroker>, context: impl Into<ContextId>) -> Self {
        Self {
            broker,
            context: context.into(),
        }
    }

    /// Run `work` as this unit of work
    ///
    /// Everything borrowed through the handle (or through the broker with
    /// this context) is returned once `work` finishes, whether it produced
    /// an error or not. If the returned future is dropped before that, or
    /// `work` panics, the return is spawned on the current tokio runtime.
    pub async fn run<F, Fut, T>(self, work: F) -> T
    where
        F: FnOnce(UnitHandle) -> Fut,
        Fut: Future<Output = T>,
    {
        let handle = UnitHandle {
            broker: self.broker.clone(),
            context: self.context.clone(),
        };
        let guard = ReleaseGuard {
            broker: Some(self.broker.clone()),
            context: self.context.clone(),
        };

        tracing::debug!(context = %self.context, "starting unit of work");
        let output = CURRENT_CONTEXT
            .scope(self.context.clone(), work(handle))
            .await;

        let report = self.broker.return_all(&self.context).await;
        guard.disarm();
        tracing::debug!(
            context = %self.context,
            returned = report.returned,
            destroyed = report.destroyed,
            failed = report.failed,
            "finished unit of work"
        );
        output
    }

    pub fn context(&self) -> &ContextId {
        &self.context
    }
}

/// What the work closure of a [`UnitOfWork`] acquires through
#[derive(Clone)]
pub struct UnitHandle {
    broker: Arc<ConnectionBroker>,
    context: ContextId,
}

impl UnitHandle {
    /// Acquire `service` for this unit of work
    pub async fn acquire(&self, service: &ServiceId) -> Result<Connection> {
        self.broker.acquire(service, &self.context).await
    }

    pub fn context(&self) -> &ContextId {
        &self.context
    }

    pub fn broker(&self) -> &Arc<ConnectionBroker> {
        &self.broker
    }
}

/// Returns a unit's connections if it never reached its own return
struct ReleaseGuard {
    broker: Option<Arc<ConnectionBroker>>,
    context: ContextId,
}

impl ReleaseGuard {
    fn disarm(mut self) {
        self.broker = None;
    }
}

impl Drop for ReleaseGuard {
    fn drop(&mut self) {
        let Some(broker) = self.broker.take() else {
            return;
        };
        let context = self.context.clone();

        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                tracing::warn!(
                    context = %context,
                    "unit of work dropped before completion, returning connections in background"
                );
                handle.spawn(async move {
                    broker.return_all(&context).await;
                });
            }
            Err(_) => {
                tracing::error!(
                    context = %context,
                    "unit of work dropped outside a tokio runtime, borrowed connections are not returned"
                );
            }
        }
    }
}
