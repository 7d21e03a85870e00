//! Tests for the pool manager

use std::sync::Arc;

use ctxpool_core::{ManualClock, PoolingConfig, PoolingError, ResourceKind, ServiceId};
use pretty_assertions::assert_eq;

use super::{CleanupReport, ConnectionPoolManager};
use crate::ConnectionLifecycleHandler;
use crate::pool::BoundedPool;
use crate::testing::MockFactory;

fn config(pool_size: usize) -> PoolingConfig {
    PoolingConfig::default()
        .with_pool_size(pool_size)
        .with_reconnect(0, 0)
        .with_retry(0, 0)
}

fn manager(config: PoolingConfig) -> ConnectionPoolManager {
    let lifecycle = Arc::new(ConnectionLifecycleHandler::new(
        config.clone(),
        Arc::new(ManualClock::new()),
    ));
    ConnectionPoolManager::new(config, lifecycle)
}

fn factory() -> Arc<MockFactory> {
    Arc::new(MockFactory::new(ResourceKind::Database))
}

/// Borrow `n` connections and return them all, leaving `n` idle
async fn fill_idle(manager: &ConnectionPoolManager, service: &ServiceId, pool: &BoundedPool, n: usize) {
    let mut conns = Vec::with_capacity(n);
    for _ in 0..n {
        conns.push(manager.borrow_connection(service, pool).await.expect("borrow"));
    }
    for conn in conns {
        manager.return_connection(service, pool, conn).expect("return");
    }
}

#[tokio::test]
async fn test_get_pool_is_memoized_per_service() {
    let manager = manager(config(10));
    let db = ServiceId::from("db.default");
    let cache = ServiceId::from("cache.default");

    let first = manager.get_pool(&db, factory());
    let second = manager.get_pool(&db, factory());
    let other = manager.get_pool(&cache, factory());

    assert!(Arc::ptr_eq(&first, &second));
    assert!(!Arc::ptr_eq(&first, &other));
    assert_eq!(manager.pool_count(), 2);
    assert_eq!(first.capacity(), 10);

    let stats = manager.stats(&db).expect("stats initialised");
    assert_eq!(stats.available(), 10);
    assert_eq!(stats.borrowed(), 0);
}

#[tokio::test]
async fn test_get_pool_by_id_requires_existing_pool() {
    let manager = manager(config(10));
    let service = ServiceId::from("db.never");

    let err = manager.get_pool_by_id(&service).expect_err("no pool");
    assert!(matches!(err, PoolingError::PoolNotFound(ref s) if *s == service));

    manager.get_pool(&service, factory());
    assert!(manager.get_pool_by_id(&service).is_ok());
}

#[tokio::test]
async fn test_borrow_and_return_update_stats() {
    let manager = manager(config(10));
    let service = ServiceId::from("db.default");
    let pool = manager.get_pool(&service, factory());

    let conn = manager.borrow_connection(&service, &pool).await.expect("borrow");
    let stats = manager.stats(&service).expect("stats");
    assert_eq!(stats.borrowed(), 1);
    assert_eq!(stats.available(), 9);

    manager.return_connection(&service, &pool, conn).expect("return");
    let stats = manager.stats(&service).expect("stats");
    assert_eq!(stats.borrowed(), 0);
    assert_eq!(stats.available(), 10);
    assert!(stats.last_updated().is_some());
    assert_eq!(pool.idle_count(), 1);
}

#[tokio::test]
async fn test_borrow_from_exhausted_pool_leaves_stats_alone() {
    let manager = manager(config(1));
    let service = ServiceId::from("db.default");
    let pool = manager.get_pool(&service, factory());

    let _held = manager.borrow_connection(&service, &pool).await.expect("borrow");
    let err = manager
        .borrow_connection(&service, &pool)
        .await
        .expect_err("exhausted");
    assert!(matches!(err, PoolingError::PoolExhausted { .. }));
    assert_eq!(manager.stats(&service).expect("stats").borrowed(), 1);
}

#[tokio::test]
async fn test_destroy_closes_and_accounts() {
    let manager = manager(config(10));
    let service = ServiceId::from("db.default");
    let factory = factory();
    let pool = manager.get_pool(&service, factory.clone());

    let conn = manager.borrow_connection(&service, &pool).await.expect("borrow");
    manager.lifecycle().register_connection(&conn);
    manager
        .destroy_connection(&service, &pool, conn)
        .await
        .expect("destroy");

    let resource = factory.resource(0).expect("created");
    assert!(resource.is_closed());
    assert_eq!(pool.created_count(), 0);
    assert_eq!(manager.lifecycle().tracked_count(), 0);

    let stats = manager.stats(&service).expect("stats");
    assert_eq!(stats.borrowed(), 0);
    assert_eq!(stats.destroyed(), 1);
}

#[tokio::test]
async fn test_destroy_swallows_close_failures() {
    let manager = manager(config(10));
    let service = ServiceId::from("db.default");
    let factory = factory();
    factory.set_fail_close(true);
    let pool = manager.get_pool(&service, factory.clone());

    let conn = manager.borrow_connection(&service, &pool).await.expect("borrow");
    manager
        .destroy_connection(&service, &pool, conn)
        .await
        .expect("close failure is not an error");

    assert_eq!(pool.created_count(), 0);
    assert_eq!(manager.stats(&service).expect("stats").destroyed(), 1);
}

#[tokio::test]
async fn test_cleanup_skips_pools_with_few_idle() {
    let manager = manager(config(50));
    let service = ServiceId::from("db.default");
    let pool = manager.get_pool(&service, factory());
    fill_idle(&manager, &service, &pool, 4).await;

    let report = manager.cleanup().await;
    assert_eq!(
        report,
        CleanupReport {
            pools: 1,
            destroyed: 0,
            failed: 0,
        }
    );
    assert_eq!(pool.idle_count(), 4);
}

#[tokio::test]
async fn test_cleanup_destroys_five_percent_of_idle() {
    let manager = manager(config(50));
    let service = ServiceId::from("db.default");
    let factory = factory();
    let pool = manager.get_pool(&service, factory.clone());
    fill_idle(&manager, &service, &pool, 40).await;

    let report = manager.cleanup().await;
    assert_eq!(report.destroyed, 2);
    assert_eq!(pool.idle_count(), 38);
    assert_eq!(pool.created_count(), 38);
    assert_eq!(factory.closed_count(), 2);
    assert_eq!(manager.stats(&service).expect("stats").destroyed(), 2);
}

#[tokio::test]
async fn test_cleanup_destroys_at_least_one() {
    let manager = manager(config(50));
    let service = ServiceId::from("db.default");
    let pool = manager.get_pool(&service, factory());
    fill_idle(&manager, &service, &pool, 19).await;

    assert_eq!(manager.cleanup().await.destroyed, 1);
    assert_eq!(pool.idle_count(), 18);
}

#[tokio::test]
async fn test_cleanup_continues_past_close_failures() {
    let manager = manager(config(50));
    let first = ServiceId::from("db.default");
    let second = ServiceId::from("db.replica");
    let failing = factory();
    failing.set_fail_close(true);

    let pool_a = manager.get_pool(&first, failing);
    let pool_b = manager.get_pool(&second, factory());
    fill_idle(&manager, &first, &pool_a, 5).await;
    fill_idle(&manager, &second, &pool_b, 5).await;

    let report = manager.cleanup().await;
    assert_eq!(report.pools, 2);
    assert_eq!(report.destroyed, 2);
    assert_eq!(pool_a.idle_count(), 4);
    assert_eq!(pool_b.idle_count(), 4);
}

#[tokio::test]
async fn test_reset_closes_idle_and_forgets_pools() {
    let manager = manager(config(10));
    let service = ServiceId::from("db.default");
    let factory = factory();
    let pool = manager.get_pool(&service, factory.clone());
    fill_idle(&manager, &service, &pool, 3).await;

    manager.reset().await;
    assert_eq!(manager.pool_count(), 0);
    assert!(manager.all_stats().is_empty());
    assert_eq!(factory.closed_count(), 3);
    assert!(matches!(
        manager.get_pool_by_id(&service),
        Err(PoolingError::PoolNotFound(_))
    ));
}

#[tokio::test]
async fn test_pool_factory_is_the_registered_one() {
    let manager = manager(config(10));
    let service = ServiceId::from("cache.default");
    let redis = Arc::new(MockFactory::new(ResourceKind::Redis));
    let pool = manager.get_pool(&service, redis.clone());

    let conn = manager.borrow_connection(&service, &pool).await.expect("borrow");
    assert_eq!(conn.kind(), ResourceKind::Redis);
    assert_eq!(redis.count(), 1);

    // a second factory for the same service is ignored
    let ignored = Arc::new(MockFactory::new(ResourceKind::Other));
    let same = manager.get_pool(&service, ignored.clone());
    let next = manager.borrow_connection(&service, &same).await.expect("borrow");
    assert_eq!(next.kind(), ResourceKind::Redis);
    assert_eq!(ignored.count(), 0);
    assert_eq!(redis.count(), 2);
}
