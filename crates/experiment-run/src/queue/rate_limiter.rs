//! Requeue delay policies
//!
//! The default controller limiter takes the larger of a per-key exponential
//! backoff and a process-wide token bucket, so a single hot key backs off on
//! its own while a burst of failures across many keys is still throttled.

use std::collections::HashMap;
use std::hash::Hash;
use std::num::NonZeroU32;
use std::time::Duration;

use governor::clock::{Clock, DefaultClock};
use governor::{DefaultDirectRateLimiter, Quota};
use parking_lot::Mutex;

/// Decides how long an item waits before it is requeued
pub trait RateLimiter<K>: Send + Sync {
    /// Delay before `item` may be processed again. Records a failure.
    fn when(&self, item: &K) -> Duration;

    /// Stop tracking `item`; its next failure starts from the base delay
    fn forget(&self, item: &K);

    /// How many failures have been recorded for `item`
    fn num_requeues(&self, item: &K) -> u32;
}

/// Per-item `base * 2^failures`, capped at `max`
pub struct ItemExponentialFailureRateLimiter<K> {
    failures: Mutex<HashMap<K, u32>>,
    base: Duration,
    max: Duration,
}

impl<K: Eq + Hash + Clone> ItemExponentialFailureRateLimiter<K> {
    /// Create a limiter starting at `base` and never exceeding `max`
    pub fn new(base: Duration, max: Duration) -> Self {
        Self {
            failures: Mutex::new(HashMap::new()),
            base,
            max,
        }
    }
}

impl<K> RateLimiter<K> for ItemExponentialFailureRateLimiter<K>
where
    K: Eq + Hash + Clone + Send + Sync,
{
    fn when(&self, item: &K) -> Duration {
        let mut failures = self.failures.lock();
        let count = failures.entry(item.clone()).or_insert(0);
        let exp = *count;
        *count = count.saturating_add(1);

        // Overflow means we are far past the cap anyway
        2u32.checked_pow(exp)
            .and_then(|factor| self.base.checked_mul(factor))
            .map_or(self.max, |delay| delay.min(self.max))
    }

    fn forget(&self, item: &K) {
        self.failures.lock().remove(item);
    }

    fn num_requeues(&self, item: &K) -> u32 {
        self.failures.lock().get(item).copied().unwrap_or(0)
    }
}

/// Overall token bucket shared by every item
pub struct BucketRateLimiter {
    bucket: DefaultDirectRateLimiter,
}

impl BucketRateLimiter {
    /// Bucket refilling at `qps` tokens per second holding at most `burst`
    pub fn new(qps: u32, burst: u32) -> Self {
        let qps = NonZeroU32::new(qps).unwrap_or(NonZeroU32::MIN);
        let burst = NonZeroU32::new(burst).unwrap_or(NonZeroU32::MIN);
        Self {
            bucket: governor::RateLimiter::direct(Quota::per_second(qps).allow_burst(burst)),
        }
    }
}

impl<K> RateLimiter<K> for BucketRateLimiter {
    fn when(&self, _item: &K) -> Duration {
        match self.bucket.check() {
            Ok(()) => Duration::ZERO,
            Err(not_until) => not_until.wait_time_from(DefaultClock::default().now()),
        }
    }

    fn forget(&self, _item: &K) {}

    fn num_requeues(&self, _item: &K) -> u32 {
        0
    }
}

/// Combines limiters, waiting as long as the strictest one demands
pub struct MaxOfRateLimiter<K> {
    limiters: Vec<Box<dyn RateLimiter<K>>>,
}

impl<K> MaxOfRateLimiter<K> {
    /// Combine `limiters`
    pub fn new(limiters: Vec<Box<dyn RateLimiter<K>>>) -> Self {
        Self { limiters }
    }
}

impl<K> RateLimiter<K> for MaxOfRateLimiter<K>
where
    K: Send + Sync,
{
    fn when(&self, item: &K) -> Duration {
        // Every limiter must see the failure, not just the first that wins
        self.limiters
            .iter()
            .map(|l| l.when(item))
            .fold(Duration::ZERO, Duration::max)
    }

    fn forget(&self, item: &K) {
        for limiter in &self.limiters {
            limiter.forget(item);
        }
    }

    fn num_requeues(&self, item: &K) -> u32 {
        self.limiters
            .iter()
            .map(|l| l.num_requeues(item))
            .max()
            .unwrap_or(0)
    }
}

/// Parameters of the default controller limiter
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RateLimiterConfig {
    /// First per-item retry delay
    pub base_delay: Duration,
    /// Per-item retry delay ceiling
    pub max_delay: Duration,
    /// Overall requeues per second
    pub qps: u32,
    /// Overall requeue burst
    pub burst: u32,
}

impl Default for RateLimiterConfig {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_millis(5),
            max_delay: Duration::from_secs(1000),
            qps: 10,
            burst: 100,
        }
    }
}

/// Max of a per-item exponential limiter and an overall token bucket
pub fn default_controller_rate_limiter<K>(config: &RateLimiterConfig) -> MaxOfRateLimiter<K>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
{
    MaxOfRateLimiter::new(vec![
        Box::new(ItemExponentialFailureRateLimiter::new(
            config.base_delay,
            config.max_delay,
        )),
        Box::new(BucketRateLimiter::new(config.qps, config.burst)),
    ])
}
