//! In-memory resources for tests and simulations
//!
//! `MockFactory` builds `MockResource`s whose health, ping and close
//! behaviour can be flipped at runtime, and remembers everything it built so
//! callers can inspect what happened to each resource.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use ctxpool_core::{InstanceFactory, PoolingError, Resource, ResourceKind, Result};
use parking_lot::Mutex;

/// Resource that lives entirely in memory
pub struct MockResource {
    serial: usize,
    kind: ResourceKind,
    healthy: AtomicBool,
    fail_close: AtomicBool,
    closed: AtomicBool,
    pings: AtomicUsize,
    ping_delay: Mutex<Duration>,
}

impl MockResource {
    pub fn new(serial: usize, kind: ResourceKind) -> Self {
        Self {
            serial,
            kind,
            healthy: AtomicBool::new(true),
            fail_close: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            pings: AtomicUsize::new(0),
            ping_delay: Mutex::new(Duration::ZERO),
        }
    }

    /// Creation order within the factory that built it, starting at 0
    pub fn serial(&self) -> usize {
        self.serial
    }

    pub fn set_healthy(&self, healthy: bool) {
        self.healthy.store(healthy, Ordering::SeqCst);
    }

    pub fn set_fail_close(&self, fail: bool) {
        self.fail_close.store(fail, Ordering::SeqCst);
    }

    /// Make every ping take this long before answering
    pub fn set_ping_delay(&self, delay: Duration) {
        *self.ping_delay.lock() = delay;
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn ping_count(&self) -> usize {
        self.pings.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Resource for MockResource {
    fn kind(&self) -> ResourceKind {
        self.kind
    }

    async fn ping(&self) -> Result<()> {
        self.pings.fetch_add(1, Ordering::SeqCst);
        let delay = *self.ping_delay.lock();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        if self.is_closed() {
            return Err(PoolingError::Resource("connection is closed".into()));
        }
        if !self.healthy.load(Ordering::SeqCst) {
            return Err(anyhow::anyhow!("server went away (resource {})", self.serial).into());
        }
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.closed.store(true, Ordering::SeqCst);
        if self.fail_close.load(Ordering::SeqCst) {
            return Err(PoolingError::Resource(format!(
                "close failed for resource {}",
                self.serial
            )));
        }
        Ok(())
    }
}

/// Factory that counts and remembers the resources it creates
pub struct MockFactory {
    kind: ResourceKind,
    created: AtomicUsize,
    failing_creates: AtomicUsize,
    unhealthy_every: AtomicUsize,
    start_unhealthy: AtomicBool,
    fail_close: AtomicBool,
    resources: Mutex<Vec<Arc<MockResource>>>,
}

impl MockFactory {
    pub fn new(kind: ResourceKind) -> Self {
        Self {
            kind,
            created: AtomicUsize::new(0),
            failing_creates: AtomicUsize::new(0),
            unhealthy_every: AtomicUsize::new(0),
            start_unhealthy: AtomicBool::new(false),
            fail_close: AtomicBool::new(false),
            resources: Mutex::new(Vec::new()),
        }
    }

    /// Number of resources successfully created
    pub fn count(&self) -> usize {
        self.created.load(Ordering::SeqCst)
    }

    /// Make the next `n` create calls fail
    pub fn fail_next_creates(&self, n: usize) {
        self.failing_creates.store(n, Ordering::SeqCst);
    }

    /// Every resource created from now on starts unhealthy (or healthy again)
    pub fn set_start_unhealthy(&self, unhealthy: bool) {
        self.start_unhealthy.store(unhealthy, Ordering::SeqCst);
    }

    /// Every `n`th created resource starts unhealthy (0 disables)
    pub fn set_unhealthy_every(&self, n: usize) {
        self.unhealthy_every.store(n, Ordering::SeqCst);
    }

    /// Resources created from now on fail when closed
    pub fn set_fail_close(&self, fail: bool) {
        self.fail_close.store(fail, Ordering::SeqCst);
    }

    /// Everything created so far, in creation order
    pub fn resources(&self) -> Vec<Arc<MockResource>> {
        self.resources.lock().clone()
    }

    /// Look up a created resource by serial
    pub fn resource(&self, serial: usize) -> Option<Arc<MockResource>> {
        self.resources.lock().get(serial).cloned()
    }

    pub fn closed_count(&self) -> usize {
        self.resources
            .lock()
            .iter()
            .filter(|resource| resource.is_closed())
            .count()
    }
}

#[async_trait]
impl InstanceFactory for MockFactory {
    async fn create(&self) -> Result<Arc<dyn Resource>> {
        let failing = self
            .failing_creates
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(PoolingError::Resource("connection refused".into()));
        }

        let serial = self.created.fetch_add(1, Ordering::SeqCst);
        let resource = Arc::new(MockResource::new(serial, self.kind));

        let every = self.unhealthy_every.load(Ordering::SeqCst);
        if self.start_unhealthy.load(Ordering::SeqCst) || (every > 0 && (serial + 1) % every == 0)
        {
            resource.set_healthy(false);
        }
        resource.set_fail_close(self.fail_close.load(Ordering::SeqCst));

        self.resources.lock().push(resource.clone());
        Ok(resource)
    }
}
