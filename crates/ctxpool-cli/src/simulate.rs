//! Simulated workload against in-memory resources
//!
//! Runs a series of units of work that each acquire every configured service
//! twice, on a simulated clock, so pool reuse, expiry, destroy-on-failure and
//! cleanup can be watched without a real database.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use ctxpool_connection::testing::MockFactory;
use ctxpool_connection::{
    CleanupScheduler, ConnectionBroker, ManualClock, PoolStats, ServiceRegistry,
    TaskLocalContextProvider, UnitOfWork,
};
use ctxpool_core::{PoolingConfig, PoolingError, ResourceKind, ServiceId};
use serde::Serialize;

/// Knobs for one simulation run
#[derive(Debug, Clone)]
pub struct SimulationOptions {
    pub services: Vec<ServiceId>,
    pub units: usize,
    /// Simulated time between units of work
    pub step: Duration,
    /// Every nth created resource starts unhealthy (0 disables)
    pub unhealthy_every: usize,
}

/// What happened during a run
#[derive(Debug, Clone, Default, Serialize)]
pub struct SimulationSummary {
    pub units_run: usize,
    pub units_failed: usize,
    pub returned: usize,
    pub destroyed: usize,
    pub cleanups: usize,
    /// Set when an acquisition exhausted its attempts and the run stopped
    pub fatal: Option<String>,
    pub created: BTreeMap<ServiceId, usize>,
    pub stats: BTreeMap<ServiceId, PoolStats>,
}

/// Guess a resource family from a service name
pub fn kind_for(service: &ServiceId) -> ResourceKind {
    let name = service.as_str();
    if name.starts_with("db") || name.contains("database") {
        ResourceKind::Database
    } else if name.starts_with("cache") || name.contains("redis") {
        ResourceKind::Redis
    } else {
        ResourceKind::Other
    }
}

/// Run the simulation to completion, or until a fatal acquisition failure
pub async fn run(config: PoolingConfig, options: SimulationOptions) -> anyhow::Result<SimulationSummary> {
    config.validate()?;

    let registry = ServiceRegistry::new();
    let mut factories = BTreeMap::new();
    for service in &options.services {
        let factory = Arc::new(MockFactory::new(kind_for(service)));
        factory.set_unhealthy_every(options.unhealthy_every);
        registry.register_shared(service.clone(), factory.clone());
        factories.insert(service.clone(), factory);
    }

    let clock = ManualClock::new();
    let broker = ConnectionBroker::with_clock(config, Arc::new(registry), Arc::new(clock.clone()));
    let scheduler = CleanupScheduler::new(
        broker.clone(),
        Arc::new(TaskLocalContextProvider),
        Arc::new(clock.clone()),
    );

    let mut summary = SimulationSummary::default();
    for unit in 0..options.units {
        let services = options.services.clone();
        let scheduler_ref = &scheduler;
        let outcome = UnitOfWork::new(broker.clone(), format!("unit-{unit}"))
            .run(|handle| async move {
                for service in &services {
                    let first = handle.acquire(service).await?;
                    let again = handle.acquire(service).await?;
                    debug_assert!(first.same_as(&again));
                }
                // the host's end-of-unit hook; UnitOfWork then finds nothing left
                Ok::<_, PoolingError>(scheduler_ref.return_all().await)
            })
            .await;

        summary.units_run += 1;
        match outcome {
            Ok(report) => {
                summary.returned += report.returned;
                summary.destroyed += report.destroyed;
            }
            Err(err) if err.is_fatal() => {
                tracing::error!(unit, error = %err, "fatal acquisition failure, stopping");
                summary.units_failed += 1;
                summary.fatal = Some(err.to_string());
                break;
            }
            Err(err) => {
                tracing::warn!(unit, error = %err, "unit of work failed");
                summary.units_failed += 1;
            }
        }

        clock.advance(options.step);
        if scheduler.schedule_cleanup().await {
            summary.cleanups += 1;
        }
    }

    summary.stats = broker.manager().all_stats();
    summary.created = factories
        .iter()
        .map(|(service, factory)| (service.clone(), factory.count()))
        .collect();

    scheduler.shutdown().await;
    Ok(summary)
}
