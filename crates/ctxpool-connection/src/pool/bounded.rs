//! Bounded pool implementation

use std::collections::{HashSet, VecDeque};
use std::fmt;
use std::sync::Arc;

use ctxpool_core::{ConnectionId, InstanceFactory, PoolingError, Result, ServiceId};
use parking_lot::Mutex;
use rand::seq::index;

use super::backoff::RetryPolicy;
use crate::Connection;

/// Bookkeeping guarded by the pool lock
struct PoolState {
    /// Connections waiting to be handed out, oldest first
    idle: VecDeque<Connection>,
    /// Connections handed out and not yet pushed back or destroyed
    checked_out: HashSet<ConnectionId>,
    /// Live connections plus creations in flight
    created: usize,
}

/// Outcome of looking for something to hand out
enum Slot {
    Idle(Connection),
    Create,
    Exhausted,
}

/// A bounded set of connections for one service
///
/// Connections are created lazily by the factory until `capacity` exist.
/// Every connection is either idle in the pool, checked out, or destroyed;
/// pushing or destroying a connection the pool did not hand out is refused.
pub struct BoundedPool {
    service: ServiceId,
    capacity: usize,
    factory: Arc<dyn InstanceFactory>,
    /// Applied when the factory fails to create a connection
    reconnect: RetryPolicy,
    /// Applied when the pool is at capacity with nothing idle
    retry: RetryPolicy,
    state: Mutex<PoolState>,
}

impl fmt::Debug for BoundedPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BoundedPool")
            .field("service", &self.service)
            .field("capacity", &self.capacity)
            .field("reconnect", &self.reconnect)
            .field("retry", &self.retry)
            .finish_non_exhaustive()
    }
}

impl BoundedPool {
    pub fn new(
        service: ServiceId,
        capacity: usize,
        factory: Arc<dyn InstanceFactory>,
        reconnect: RetryPolicy,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            service,
            capacity,
            factory,
            reconnect,
            retry,
            state: Mutex::new(PoolState {
                idle: VecDeque::new(),
                checked_out: HashSet::new(),
                created: 0,
            }),
        }
    }

    /// Check out a connection
    ///
    /// This will:
    /// 1. Take the oldest idle connection, if any
    /// 2. Otherwise create one if fewer than `capacity` exist, retrying
    ///    failed creates per the reconnect policy
    /// 3. Otherwise wait per the retry policy and look again, failing with
    ///    `PoolExhausted` once retries run out
    pub async fn pop(&self) -> Result<Connection> {
        let mut attempt = 0u32;

        loop {
            match self.reserve() {
                Slot::Idle(conn) => return Ok(conn),
                Slot::Create => return self.create_reserved().await,
                Slot::Exhausted => {
                    if attempt >= self.retry.attempts() {
                        return Err(PoolingError::PoolExhausted {
                            service: self.service.clone(),
                            capacity: self.capacity,
                        });
                    }

                    let delay = self.retry.delay(attempt);
                    tracing::debug!(
                        service = %self.service,
                        attempt = attempt + 1,
                        delay_ms = delay.as_millis() as u64,
                        "pool exhausted, waiting for a connection"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
            }
        }
    }

    fn reserve(&self) -> Slot {
        let mut state = self.state.lock();
        if let Some(conn) = state.idle.pop_front() {
            state.checked_out.insert(conn.id());
            Slot::Idle(conn)
        } else if state.created < self.capacity {
            state.created += 1;
            Slot::Create
        } else {
            Slot::Exhausted
        }
    }

    /// Fill a capacity slot reserved by `reserve`
    async fn create_reserved(&self) -> Result<Connection> {
        let reservation = Reservation { pool: self, armed: true };
        let mut attempt = 0u32;

        loop {
            match self.factory.create().await {
                Ok(resource) => {
                    let conn = Connection::new(resource);
                    self.state.lock().checked_out.insert(conn.id());
                    reservation.commit();
                    tracing::debug!(
                        service = %self.service,
                        connection_id = %conn.id(),
                        "created pooled connection"
                    );
                    return Ok(conn);
                }
                Err(err) => {
                    if attempt >= self.reconnect.attempts() {
                        tracing::warn!(
                            service = %self.service,
                            attempts = attempt + 1,
                            error = %err,
                            "giving up creating connection"
                        );
                        return Err(err);
                    }

                    let delay = self.reconnect.delay(attempt);
                    tracing::warn!(
                        service = %self.service,
                        attempt = attempt + 1,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "failed to create connection, reconnecting"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
            }
        }
    }

    /// Return a checked-out connection to the idle queue
    pub fn push(&self, conn: Connection) -> Result<()> {
        let mut state = self.state.lock();
        if !state.checked_out.remove(&conn.id()) {
            return Err(self.unknown(&conn));
        }
        state.idle.push_back(conn);
        Ok(())
    }

    /// Permanently remove a checked-out connection, freeing its capacity slot
    ///
    /// Closing the underlying resource is the caller's job.
    pub fn destroy(&self, conn: &Connection) -> Result<()> {
        let mut state = self.state.lock();
        if !state.checked_out.remove(&conn.id()) {
            return Err(self.unknown(conn));
        }
        state.created = state.created.saturating_sub(1);
        Ok(())
    }

    /// Check out up to `n` idle connections chosen at random
    pub fn take_random_idle(&self, n: usize) -> Vec<Connection> {
        let mut state = self.state.lock();
        let n = n.min(state.idle.len());
        if n == 0 {
            return Vec::new();
        }

        let mut picked = index::sample(&mut rand::thread_rng(), state.idle.len(), n).into_vec();
        picked.sort_unstable_by(|a, b| b.cmp(a));

        let mut taken = Vec::with_capacity(n);
        for i in picked {
            if let Some(conn) = state.idle.remove(i) {
                state.checked_out.insert(conn.id());
                taken.push(conn);
            }
        }
        taken
    }

    /// Remove every idle connection from the pool and free their slots
    ///
    /// Closing the returned resources is the caller's job.
    pub fn drain_idle(&self) -> Vec<Connection> {
        let mut state = self.state.lock();
        let drained: Vec<_> = state.idle.drain(..).collect();
        state.created = state.created.saturating_sub(drained.len());
        drained
    }

    /// Connections that can be handed out without waiting: idle ones plus
    /// capacity not yet created
    pub fn count(&self) -> usize {
        let state = self.state.lock();
        state.idle.len() + self.capacity.saturating_sub(state.created)
    }

    pub fn idle_count(&self) -> usize {
        self.state.lock().idle.len()
    }

    pub fn active_count(&self) -> usize {
        self.state.lock().checked_out.len()
    }

    /// Live connections, idle or checked out
    pub fn created_count(&self) -> usize {
        self.state.lock().created
    }

    pub fn is_checked_out(&self, id: ConnectionId) -> bool {
        self.state.lock().checked_out.contains(&id)
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn service(&self) -> &ServiceId {
        &self.service
    }

    fn unknown(&self, conn: &Connection) -> PoolingError {
        PoolingError::UnknownConnection {
            service: self.service.clone(),
            connection: conn.id(),
        }
    }
}

/// Releases a reserved capacity slot unless the create succeeded
///
/// Covers both a failed create and the pop future being dropped mid-create.
struct Reservation<'a> {
    pool: &'a BoundedPool,
    armed: bool,
}

impl Reservation<'_> {
    fn commit(mut self) {
        self.armed = false;
    }
}

impl Drop for Reservation<'_> {
    fn drop(&mut self) {
        if self.armed {
            let mut state = self.pool.state.lock();
            state.created = state.created.saturating_sub(1);
        }
    }
}
