//! Pool statistics types

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Counters the manager keeps for one service pool
///
/// `borrowed` and `available` move together on borrow and return;
/// destroying a borrowed connection lowers `borrowed` and raises
/// `destroyed`. Counters are bookkeeping, not a live view of the pool.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolStats {
    /// When the pool was created
    created: DateTime<Utc>,
    /// Configured pool capacity
    capacity: usize,
    /// Connections currently checked out
    borrowed: i64,
    /// Connections the pool can still hand out
    available: i64,
    /// Connections permanently removed from rotation
    destroyed: u64,
    /// Time of the last counter change
    last_updated: Option<DateTime<Utc>>,
}

impl PoolStats {
    /// Fresh counters for a pool of the given capacity
    pub fn new(capacity: usize) -> Self {
        Self {
            created: Utc::now(),
            capacity,
            borrowed: 0,
            available: i64::try_from(capacity).unwrap_or(i64::MAX),
            destroyed: 0,
            last_updated: None,
        }
    }

    pub(crate) fn record_borrow(&mut self) {
        self.borrowed += 1;
        self.available -= 1;
        self.touch();
    }

    pub(crate) fn record_return(&mut self) {
        self.borrowed -= 1;
        self.available += 1;
        self.touch();
    }

    pub(crate) fn record_destroy(&mut self) {
        self.borrowed -= 1;
        self.destroyed += 1;
        self.touch();
    }

    /// An idle connection removed by a maintenance sweep
    pub(crate) fn record_eviction(&mut self) {
        self.destroyed += 1;
        self.touch();
    }

    fn touch(&mut self) {
        self.last_updated = Some(Utc::now());
    }

    pub fn created(&self) -> DateTime<Utc> {
        self.created
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn borrowed(&self) -> i64 {
        self.borrowed
    }

    pub fn available(&self) -> i64 {
        self.available
    }

    pub fn destroyed(&self) -> u64 {
        self.destroyed
    }

    pub fn last_updated(&self) -> Option<DateTime<Utc>> {
        self.last_updated
    }

    /// Borrowed share of capacity (0.0 to 1.0)
    ///
    /// Returns 0.0 for a zero-capacity pool to avoid division by zero.
    pub fn utilization(&self) -> f64 {
        if self.capacity == 0 {
            0.0
        } else {
            self.borrowed.max(0) as f64 / self.capacity as f64
        }
    }
}
