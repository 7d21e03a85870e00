//! End-to-end scenarios across broker, pools, lifecycle and scheduler

use std::sync::Arc;
use std::time::Duration;

use ctxpool_connection::testing::MockFactory;
use ctxpool_connection::{
    CleanupScheduler, ConnectionBroker, ContextId, ManualClock, PatternClassifier, PoolingConfig,
    PoolingError, ResourceKind, ServiceId, ServiceRegistry, TaskLocalContextProvider, UnitOfWork,
};
use pretty_assertions::assert_eq;

fn base_config() -> PoolingConfig {
    PoolingConfig::default()
        .with_reconnect(0, 0)
        .with_retry(0, 0)
        .with_maintenance_probability(0.0)
}

#[tokio::test]
async fn small_pool_reuse_and_hand_over() {
    let registry = ServiceRegistry::new();
    let factory = Arc::new(MockFactory::new(ResourceKind::Database));
    registry.register_shared("X", factory.clone());

    let clock = ManualClock::new();
    let config = base_config()
        .with_pool_size(2)
        .with_connection_lifetime_secs(60);
    let broker = ConnectionBroker::with_clock(config, Arc::new(registry), Arc::new(clock.clone()));

    let x = ServiceId::from("X");
    let a = ContextId::from("A");
    let b = ContextId::from("B");

    let first = broker.acquire(&x, &a).await.expect("A first");
    let second = broker.acquire(&x, &a).await.expect("A second");
    assert_eq!(first.id(), second.id());

    let report = broker.return_all(&a).await;
    assert_eq!(report.returned, 1);

    clock.advance(Duration::from_secs(10));
    let handed_over = broker.acquire(&x, &b).await.expect("B");
    assert_eq!(handed_over.id(), first.id());
    assert_eq!(factory.count(), 1);

    let pool = broker.manager().get_pool_by_id(&x).expect("pool");
    assert_eq!(pool.capacity(), 2);
    assert_eq!(pool.count(), 1);
}

#[tokio::test]
async fn stale_candidate_is_replaced_transparently() {
    let registry = ServiceRegistry::new();
    let factory = Arc::new(MockFactory::new(ResourceKind::Redis));
    registry.register_shared("cache.sessions", factory.clone());

    let clock = ManualClock::new();
    let broker = ConnectionBroker::with_clock(
        base_config().with_pool_size(2),
        Arc::new(registry),
        Arc::new(clock.clone()),
    );
    let cache = ServiceId::from("cache.sessions");

    let old = broker.acquire(&cache, &ContextId::from("A")).await.expect("A");
    broker.return_all(&ContextId::from("A")).await;

    clock.advance(Duration::from_secs(61));
    let age = broker.lifecycle().connection_age(&old).expect("tracked");
    assert!(age >= Duration::from_secs(61));

    let new = broker.acquire(&cache, &ContextId::from("B")).await.expect("B");
    assert_ne!(new.id(), old.id());
    assert!(factory.resource(0).expect("old").is_closed());
}

#[tokio::test]
async fn pool_lookup_for_unused_service_fails() {
    let broker = ConnectionBroker::new(base_config(), Arc::new(ServiceRegistry::new()));
    let err = broker
        .manager()
        .get_pool_by_id(&ServiceId::from("db.never_connection"))
        .expect_err("no pool");
    assert!(matches!(err, PoolingError::PoolNotFound(_)));
}

#[tokio::test]
async fn classified_services_are_pooled_on_demand() {
    let registry = ServiceRegistry::new();
    registry.register_classifier(PatternClassifier::new("db.", "_connection", |_| {
        Arc::new(MockFactory::new(ResourceKind::Database))
    }));
    let broker = ConnectionBroker::new(base_config(), Arc::new(registry));

    let orders = ServiceId::from("db.orders_connection");
    let users = ServiceId::from("db.users_connection");
    let ctx = ContextId::from("req-1");

    let a = broker.acquire(&orders, &ctx).await.expect("orders");
    let b = broker.acquire(&users, &ctx).await.expect("users");
    assert_ne!(a.id(), b.id());
    assert_eq!(broker.manager().pool_count(), 2);

    let err = broker
        .acquire(&ServiceId::from("db.orders"), &ctx)
        .await
        .expect_err("not pooled");
    assert!(matches!(err, PoolingError::ServiceNotFound(_)));
    assert_eq!(broker.borrowed_count(&ctx).await, 2);
}

#[tokio::test]
async fn units_of_work_release_on_error_and_keep_pools_warm() {
    let registry = ServiceRegistry::new();
    let factory = Arc::new(MockFactory::new(ResourceKind::Database));
    registry.register_shared("db.default", factory.clone());
    let broker = ConnectionBroker::new(base_config().with_pool_size(1), Arc::new(registry));
    let db = ServiceId::from("db.default");

    for i in 0..10 {
        let db = db.clone();
        let result = UnitOfWork::new(broker.clone(), format!("job-{i}"))
            .run(|unit| async move {
                unit.acquire(&db).await?;
                if i % 2 == 0 {
                    return Err(PoolingError::Resource(format!("job {i} failed")));
                }
                Ok::<(), PoolingError>(())
            })
            .await;
        assert_eq!(result.is_ok(), i % 2 == 1);
    }

    // a pool of one served every job because each returned its connection
    assert_eq!(factory.count(), 1);
    assert_eq!(broker.context_count(), 0);
}

#[tokio::test]
async fn scheduler_returns_the_task_local_context() {
    let registry = ServiceRegistry::new();
    registry.register("db.default", MockFactory::new(ResourceKind::Database));
    let clock = ManualClock::new();
    let broker = ConnectionBroker::with_clock(
        base_config(),
        Arc::new(registry),
        Arc::new(clock.clone()),
    );
    let scheduler = Arc::new(CleanupScheduler::new(
        broker.clone(),
        Arc::new(TaskLocalContextProvider),
        Arc::new(clock),
    ));
    let db = ServiceId::from("db.default");

    let returned = UnitOfWork::new(broker.clone(), "req-7")
        .run(|unit| {
            let scheduler = scheduler.clone();
            async move {
                unit.acquire(&db).await.expect("acquire");
                scheduler.return_all().await.returned
            }
        })
        .await;

    assert_eq!(returned, 1);
    assert_eq!(broker.context_count(), 0);
}

#[tokio::test]
async fn sustained_unhealthy_resources_never_exhaust_the_pool() {
    let registry = ServiceRegistry::new();
    let factory = Arc::new(MockFactory::new(ResourceKind::Database));
    factory.set_start_unhealthy(true);
    registry.register_shared("db.default", factory.clone());
    let broker = ConnectionBroker::new(
        base_config().with_pool_size(2).with_check_db_connection(true),
        Arc::new(registry),
    );
    let db = ServiceId::from("db.default");

    for i in 0..3 {
        let err = broker
            .acquire(&db, &ContextId::from(format!("req-{i}")))
            .await
            .expect_err("unhealthy");
        let failure = err.acquisition_failure().expect("fatal");
        assert_eq!(failure.errors.len(), 5);
        assert!(failure.errors.iter().all(|e| !e.contains("is empty")));
    }

    factory.set_start_unhealthy(false);
    broker
        .acquire(&db, &ContextId::from("req-ok"))
        .await
        .expect("pool still has capacity");
}
