//! Time-gated pool maintenance and unit-of-work boundaries

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};

use ctxpool_core::SharedClock;
use futures::FutureExt;
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use crate::context::ExecutionContextProvider;
use crate::{ConnectionBroker, ConnectionPoolManager, ReturnReport};

/// Runs pool cleanup at most once per interval and returns a context's
/// connections when the host says the unit of work is over
pub struct CleanupScheduler {
    manager: Arc<ConnectionPoolManager>,
    broker: Arc<ConnectionBroker>,
    contexts: Arc<dyn ExecutionContextProvider>,
    clock: SharedClock,
    interval: Duration,
    last_run: Mutex<Option<Instant>>,
}

impl CleanupScheduler {
    /// Create a scheduler using the broker's cleanup interval
    pub fn new(
        broker: Arc<ConnectionBroker>,
        contexts: Arc<dyn ExecutionContextProvider>,
        clock: SharedClock,
    ) -> Self {
        Self {
            manager: broker.manager().clone(),
            interval: broker.config().cleanup_interval(),
            broker,
            contexts,
            clock,
            last_run: Mutex::new(None),
        }
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    /// Run a cleanup sweep unless one ran less than an interval ago
    ///
    /// Returns whether a sweep ran. A failing sweep is logged, never
    /// propagated.
    pub async fn schedule_cleanup(&self) -> bool {
        let now = self.clock.now();
        {
            let mut last_run = self.last_run.lock();
            if last_run.is_some_and(|at| now.saturating_duration_since(at) < self.interval) {
                return false;
            }
            *last_run = Some(now);
        }

        match AssertUnwindSafe(self.manager.cleanup()).catch_unwind().await {
            Ok(report) => {
                tracing::info!(
                    pools = report.pools,
                    destroyed = report.destroyed,
                    failed = report.failed,
                    "pool cleanup finished"
                );
            }
            Err(panic) => {
                tracing::error!(panic = %panic_message(&*panic), "pool cleanup panicked");
            }
        }
        true
    }

    /// Return everything the current unit of work borrowed
    ///
    /// Hosts call this at every unit-of-work boundary, including failure
    /// paths.
    pub async fn return_all(&self) -> ReturnReport {
        let ctx = self.contexts.current_id();
        self.broker.return_all(&ctx).await
    }

    /// Tick `schedule_cleanup` from a background task every `period`
    pub fn spawn(self: Arc<Self>, period: Duration) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                self.schedule_cleanup().await;
            }
        })
    }

    /// Return the current context's connections and close every pool
    pub async fn shutdown(&self) -> ReturnReport {
        let report = self.return_all().await;
        self.manager.reset().await;
        tracing::info!(
            returned = report.returned,
            destroyed = report.destroyed,
            "connection pools shut down"
        );
        report
    }

    pub fn last_run(&self) -> Option<Instant> {
        *self.last_run.lock()
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;
    use ctxpool_core::{
        ContextId, InstanceFactory, ManualClock, PoolingConfig, Resource, ResourceKind, Result,
        ServiceId,
    };
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::ServiceRegistry;
    use crate::testing::MockFactory;

    struct FixedContext(ContextId);

    impl ExecutionContextProvider for FixedContext {
        fn current_id(&self) -> ContextId {
            self.0.clone()
        }
    }

    struct PanickingResource;

    #[async_trait]
    impl Resource for PanickingResource {
        fn kind(&self) -> ResourceKind {
            ResourceKind::Other
        }

        async fn close(&self) -> Result<()> {
            panic!("close exploded");
        }
    }

    struct PanickingFactory;

    #[async_trait]
    impl InstanceFactory for PanickingFactory {
        async fn create(&self) -> Result<Arc<dyn Resource>> {
            Ok(Arc::new(PanickingResource))
        }
    }

    fn setup(registry: ServiceRegistry) -> (Arc<ConnectionBroker>, CleanupScheduler, ManualClock) {
        let clock = ManualClock::new();
        let config = PoolingConfig::default()
            .with_retry(0, 0)
            .with_reconnect(0, 0)
            .with_maintenance_probability(0.0);
        let broker = ConnectionBroker::with_clock(config, Arc::new(registry), Arc::new(clock.clone()));
        let scheduler = CleanupScheduler::new(
            broker.clone(),
            Arc::new(FixedContext(ContextId::from("worker"))),
            Arc::new(clock.clone()),
        );
        (broker, scheduler, clock)
    }

    /// Leave `n` idle connections in the pool of `service`
    async fn fill_idle(broker: &ConnectionBroker, service: &ServiceId, n: usize) {
        let contexts: Vec<_> = (0..n).map(|i| ContextId::from(format!("fill-{i}"))).collect();
        for ctx in &contexts {
            broker.acquire(service, ctx).await.expect("acquire");
        }
        for ctx in &contexts {
            broker.return_all(ctx).await;
        }
    }

    #[tokio::test]
    async fn test_schedule_cleanup_is_time_gated() {
        let (_broker, scheduler, clock) = setup(ServiceRegistry::new());
        assert_eq!(scheduler.interval(), Duration::from_secs(60));
        assert!(scheduler.last_run().is_none());

        assert!(scheduler.schedule_cleanup().await);
        assert!(!scheduler.schedule_cleanup().await);

        clock.advance(Duration::from_secs(59));
        assert!(!scheduler.schedule_cleanup().await);

        clock.advance(Duration::from_secs(1));
        assert!(scheduler.schedule_cleanup().await);
    }

    #[tokio::test]
    async fn test_schedule_cleanup_sweeps_idle_connections() {
        let registry = ServiceRegistry::new();
        let factory = Arc::new(MockFactory::new(ResourceKind::Database));
        registry.register_shared("db.default", factory.clone());
        let (broker, scheduler, _clock) = setup(registry);

        let service = ServiceId::from("db.default");
        fill_idle(&broker, &service, 20).await;

        assert!(scheduler.schedule_cleanup().await);
        assert_eq!(factory.closed_count(), 1);
    }

    #[tokio::test]
    async fn test_schedule_cleanup_survives_a_panicking_sweep() {
        let registry = ServiceRegistry::new();
        registry.register("queue.default", PanickingFactory);
        let (broker, scheduler, clock) = setup(registry);
        fill_idle(&broker, &ServiceId::from("queue.default"), 5).await;

        assert!(scheduler.schedule_cleanup().await);

        clock.advance(Duration::from_secs(60));
        assert!(scheduler.schedule_cleanup().await);
    }

    #[tokio::test]
    async fn test_return_all_uses_the_current_context() {
        let registry = ServiceRegistry::new();
        registry.register("db.default", MockFactory::new(ResourceKind::Database));
        let (broker, scheduler, _clock) = setup(registry);

        let service = ServiceId::from("db.default");
        broker
            .acquire(&service, &ContextId::from("worker"))
            .await
            .expect("acquire");
        broker
            .acquire(&service, &ContextId::from("other"))
            .await
            .expect("acquire");

        let report = scheduler.return_all().await;
        assert_eq!(report.returned, 1);
        assert_eq!(broker.context_count(), 1);
        assert!(broker.is_borrowed(&ContextId::from("other"), &service).await);
    }

    #[tokio::test]
    async fn test_shutdown_returns_and_closes_pools() {
        let registry = ServiceRegistry::new();
        let factory = Arc::new(MockFactory::new(ResourceKind::Redis));
        registry.register_shared("cache.default", factory.clone());
        let (broker, scheduler, _clock) = setup(registry);

        broker
            .acquire(&ServiceId::from("cache.default"), &ContextId::from("worker"))
            .await
            .expect("acquire");

        let report = scheduler.shutdown().await;
        assert_eq!(report.returned, 1);
        assert_eq!(broker.manager().pool_count(), 0);
        assert_eq!(factory.closed_count(), 1);
    }

    #[tokio::test]
    async fn test_spawned_ticker_runs_cleanup() {
        let registry = ServiceRegistry::new();
        let factory = Arc::new(MockFactory::new(ResourceKind::Database));
        registry.register_shared("db.default", factory.clone());
        let (broker, scheduler, _clock) = setup(registry);
        fill_idle(&broker, &ServiceId::from("db.default"), 5).await;

        let scheduler = Arc::new(scheduler.with_interval(Duration::ZERO));
        let ticker = scheduler.clone().spawn(Duration::from_millis(5));
        for _ in 0..100 {
            if factory.closed_count() > 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        ticker.abort();

        assert!(factory.closed_count() >= 1);
        assert!(scheduler.last_run().is_some());
    }
}
