use std::hash::Hash;
use std::time::Duration;

use rustc_hash::FxHashMap;
use tokio::time::Instant;

/// Decides how long an item waits before it is retried.
pub trait RateLimiter<T>: Send {
    /// Delay for the next retry of `item`; counts as one failure.
    fn when(&mut self, item: &T) -> Duration;
    /// Clear failure history for `item`.
    fn forget(&mut self, item: &T);
    fn num_requeues(&self, item: &T) -> u32;
}

/// `base * 2^failures`, capped at `max`. Tracked per item.
pub struct ItemExponentialRateLimiter<T> {
    base: Duration,
    max: Duration,
    failures: FxHashMap<T, u32>,
}

impl<T: Hash + Eq + Clone> ItemExponentialRateLimiter<T> {
    pub fn new(base: Duration, max: Duration) -> Self {
        Self { base, max: max.max(base), failures: FxHashMap::default() }
    }

    fn backoff(&self, failures: u32) -> Duration {
        if failures >= 32 {
            return self.max;
        }
        self.base.checked_mul(1u32 << failures).map_or(self.max, |d| d.min(self.max))
    }
}

impl<T: Hash + Eq + Clone + Send> RateLimiter<T> for ItemExponentialRateLimiter<T> {
    fn when(&mut self, item: &T) -> Duration {
        let count = self.failures.entry(item.clone()).or_insert(0);
        let exp = *count;
        *count = count.saturating_add(1);
        self.backoff(exp)
    }

    fn forget(&mut self, item: &T) { self.failures.remove(item); }

    fn num_requeues(&self, item: &T) -> u32 { self.failures.get(item).copied().unwrap_or(0) }
}

/// Token bucket shared by all items: `qps` refill rate, `burst` capacity.
pub struct BucketRateLimiter {
    qps: f64,
    burst: f64,
    tokens: f64,
    last: Instant,
}

impl BucketRateLimiter {
    pub fn new(qps: f64, burst: u32) -> Self {
        let burst = f64::from(burst.max(1));
        Self { qps: qps.max(0.001), burst, tokens: burst, last: Instant::now() }
    }
}

impl<T> RateLimiter<T> for BucketRateLimiter {
    fn when(&mut self, _item: &T) -> Duration {
        let now = Instant::now();
        let refill = now.saturating_duration_since(self.last).as_secs_f64() * self.qps;
        self.tokens = (self.tokens + refill).min(self.burst);
        self.last = now;
        self.tokens -= 1.0;
        if self.tokens >= 0.0 {
            Duration::ZERO
        } else {
            Duration::try_from_secs_f64(-self.tokens / self.qps).unwrap_or(Duration::MAX)
        }
    }

    fn forget(&mut self, _item: &T) {}

    fn num_requeues(&self, _item: &T) -> u32 { 0 }
}

/// Longest delay of all children wins.
pub struct MaxOfRateLimiter<T> {
    limiters: Vec<Box<dyn RateLimiter<T>>>,
}

impl<T> MaxOfRateLimiter<T> {
    pub fn new(limiters: Vec<Box<dyn RateLimiter<T>>>) -> Self { Self { limiters } }
}

impl<T> RateLimiter<T> for MaxOfRateLimiter<T> {
    fn when(&mut self, item: &T) -> Duration {
        self.limiters.iter_mut().map(|l| l.when(item)).max().unwrap_or(Duration::ZERO)
    }

    fn forget(&mut self, item: &T) {
        for l in self.limiters.iter_mut() {
            l.forget(item);
        }
    }

    fn num_requeues(&self, item: &T) -> u32 {
        self.limiters.iter().map(|l| l.num_requeues(item)).max().unwrap_or(0)
    }
}

/// Per-item 5ms..1000s exponential backoff combined with a 10 qps / 100 burst
/// overall bucket.
pub fn default_controller_rate_limiter<T>() -> MaxOfRateLimiter<T>
where
    T: Hash + Eq + Clone + Send + 'static,
{
    MaxOfRateLimiter::new(vec![
        Box::new(ItemExponentialRateLimiter::new(Duration::from_millis(5), Duration::from_secs(1000))),
        Box::new(BucketRateLimiter::new(10.0, 100)),
    ])
}
