//! Delay calculation for the pool's internal retries
//!
//! Pools retry in two places: when the factory fails to create a connection
//! (reconnect) and when the pool is at capacity with nothing idle (retry).
//! Both use a `RetryPolicy`: a number of extra attempts and a backoff.

use std::time::Duration;

use rand::Rng;

/// Delay strategy between retries
///
/// With a multiplier of 1.0 every delay equals the initial delay; larger
/// multipliers grow the delay exponentially up to the cap.
///
/// # Example
///
/// ```
/// use ctxpool_connection::pool::BackoffStrategy;
/// use std::time::Duration;
///
/// let backoff = BackoffStrategy::exponential(Duration::from_millis(100), Duration::from_secs(5));
/// assert_eq!(backoff.delay(0), Duration::from_millis(100));
/// assert_eq!(backoff.delay(1), Duration::from_millis(200));
/// assert!(backoff.delay(20) <= Duration::from_secs(5));
///
/// let fixed = BackoffStrategy::fixed(Duration::from_secs(1));
/// assert_eq!(fixed.delay(7), Duration::from_secs(1));
/// ```
#[derive(Debug, Clone, PartialEq)]
pub struct BackoffStrategy {
    initial: Duration,
    max: Duration,
    multiplier: f64,
    jitter: bool,
}

impl BackoffStrategy {
    /// Same delay before every retry
    pub fn fixed(delay: Duration) -> Self {
        Self {
            initial: delay,
            max: delay,
            multiplier: 1.0,
            jitter: false,
        }
    }

    /// Doubling delay starting at `initial`, capped at `max`
    pub fn exponential(initial: Duration, max: Duration) -> Self {
        Self {
            initial,
            max: max.max(initial),
            multiplier: 2.0,
            jitter: false,
        }
    }

    /// No delay at all
    pub fn none() -> Self {
        Self::fixed(Duration::ZERO)
    }

    pub fn with_multiplier(mut self, multiplier: f64) -> Self {
        self.multiplier = multiplier.max(1.0);
        self
    }

    /// Spread each delay by up to ±25% so workers don't retry in lockstep
    pub fn with_jitter(mut self, jitter: bool) -> Self {
        self.jitter = jitter;
        self
    }

    /// Delay before retry number `attempt` (0-based)
    pub fn delay(&self, attempt: u32) -> Duration {
        let exponent = i32::try_from(attempt).unwrap_or(i32::MAX);
        let scaled = self.initial.as_secs_f64() * self.multiplier.powi(exponent);
        let capped = scaled.min(self.max.as_secs_f64());

        let secs = if self.jitter && capped > 0.0 {
            let spread = capped / 4.0;
            capped + rand::thread_rng().gen_range(-spread..=spread)
        } else {
            capped
        };

        Duration::from_secs_f64(secs.max(0.0))
    }

    pub fn initial_delay(&self) -> Duration {
        self.initial
    }

    pub fn max_delay(&self) -> Duration {
        self.max
    }
}

impl Default for BackoffStrategy {
    /// One second between attempts
    fn default() -> Self {
        Self::fixed(Duration::from_secs(1))
    }
}

/// Extra attempts plus the delay before each of them
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    attempts: u32,
    backoff: BackoffStrategy,
}

impl RetryPolicy {
    pub fn new(attempts: u32, backoff: BackoffStrategy) -> Self {
        Self { attempts, backoff }
    }

    /// `attempts` retries, `delay` apart
    pub fn fixed(attempts: u32, delay: Duration) -> Self {
        Self::new(attempts, BackoffStrategy::fixed(delay))
    }

    /// Fail on the first error
    pub fn none() -> Self {
        Self::new(0, BackoffStrategy::none())
    }

    /// Number of retries after the first try
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn backoff(&self) -> &BackoffStrategy {
        &self.backoff
    }

    /// Delay before retry number `attempt` (0-based)
    pub fn delay(&self, attempt: u32) -> Duration {
        self.backoff.delay(attempt)
    }
}

impl Default for RetryPolicy {
    /// 3 retries, 1 second apart
    fn default() -> Self {
        Self::fixed(3, Duration::from_secs(1))
    }
}
