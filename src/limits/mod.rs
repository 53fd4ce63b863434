//! Priority-tiered rate limiting
//!
//! Every call that crosses the wire (chat protocol, drive providers, KV L2,
//! durable queue, database) is admitted through one of five priority tiers,
//! each backed by its own token bucket. UI edits outrank everything so
//! progress messages stay responsive while bulk transfers saturate the
//! lower tiers.

pub mod retry;

pub use retry::{with_retry, Backoff, RetryPolicy, RetryableError};

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use thiserror::Error;

/// Rate limit errors.
#[derive(Error, Debug)]
pub enum LimitError {
    #[error("rate limit wait exceeded budget of {0:?}")]
    Budget(Duration),
}

/// Priority tiers, highest first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Priority {
    /// Status message edits
    Ui,
    /// Leader/lock and webhook-critical calls
    High,
    Normal,
    Low,
    /// Bulk transfers and sweeps
    Background,
}

impl Priority {
    fn index(&self) -> usize {
        match self {
            Priority::Ui => 0,
            Priority::High => 1,
            Priority::Normal => 2,
            Priority::Low => 3,
            Priority::Background => 4,
        }
    }

    pub fn all() -> &'static [Priority] {
        &[
            Priority::Ui,
            Priority::High,
            Priority::Normal,
            Priority::Low,
            Priority::Background,
        ]
    }
}

/// Token bucket with nanosecond refill accounting. Lock-free: tokens are
/// consumed with CAS, refill races are resolved by the timestamp CAS.
#[derive(Debug)]
struct TokenBucket {
    capacity: u64,
    tokens: AtomicU64,
    refill_per_sec: f64,
    last_refill_nanos: AtomicU64,
}

impl TokenBucket {
    fn new(capacity: u64, refill_per_sec: f64) -> Self {
        Self {
            capacity,
            tokens: AtomicU64::new(capacity),
            refill_per_sec,
            last_refill_nanos: AtomicU64::new(Self::now_nanos()),
        }
    }

    fn now_nanos() -> u64 {
        use std::time::{SystemTime, UNIX_EPOCH};
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos() as u64)
            .unwrap_or(0)
    }

    fn refill(&self) {
        let now = Self::now_nanos();
        let last = self.last_refill_nanos.load(Ordering::Acquire);
        let elapsed_secs = now.saturating_sub(last) as f64 / 1e9;
        let new_tokens = (elapsed_secs * self.refill_per_sec) as u64;
        if new_tokens == 0 {
            return;
        }

        if self
            .last_refill_nanos
            .compare_exchange(last, now, Ordering::Release, Ordering::Acquire)
            .is_ok()
        {
            let current = self.tokens.load(Ordering::Acquire);
            let next = (current + new_tokens).min(self.capacity);
            self.tokens.store(next, Ordering::Release);
        }
    }

    /// Try to consume one token. Returns the wait hint on denial.
    fn try_acquire(&self) -> Result<(), Duration> {
        self.refill();

        loop {
            let current = self.tokens.load(Ordering::Acquire);
            if current == 0 {
                let wait_secs = 1.0 / self.refill_per_sec.max(0.001);
                return Err(Duration::from_secs_f64(wait_secs));
            }
            if self
                .tokens
                .compare_exchange(current, current - 1, Ordering::Release, Ordering::Acquire)
                .is_ok()
            {
                return Ok(());
            }
        }
    }
}

/// Per-tier bucket sizing.
#[derive(Debug, Clone)]
pub struct RateLimiterConfig {
    /// `(capacity, refill per second)` for each tier, highest priority first
    pub tiers: [(u64, f64); 5],

    /// Upper bound on how long a single acquire may wait
    pub max_wait: Duration,
}

impl Default for RateLimiterConfig {
    fn default() -> Self {
        Self {
            tiers: [
                (10, 5.0), // Ui
                (20, 10.0),
                (30, 10.0),
                (30, 5.0),
                (50, 2.0), // Background
            ],
            max_wait: Duration::from_secs(120),
        }
    }
}

/// Priority-tiered token bucket set.
#[derive(Debug)]
pub struct RateLimiter {
    buckets: [TokenBucket; 5],
    max_wait: Duration,
}

impl RateLimiter {
    pub fn new(config: RateLimiterConfig) -> Self {
        let [ui, high, normal, low, background] = config.tiers;
        Self {
            buckets: [
                TokenBucket::new(ui.0, ui.1),
                TokenBucket::new(high.0, high.1),
                TokenBucket::new(normal.0, normal.1),
                TokenBucket::new(low.0, low.1),
                TokenBucket::new(background.0, background.1),
            ],
            max_wait: config.max_wait,
        }
    }

    /// Wait until the tier grants a token.
    pub async fn acquire(&self, priority: Priority) -> Result<(), LimitError> {
        let bucket = &self.buckets[priority.index()];
        let mut waited = Duration::ZERO;

        loop {
            match bucket.try_acquire() {
                Ok(()) => return Ok(()),
                Err(hint) => {
                    if waited >= self.max_wait {
                        return Err(LimitError::Budget(self.max_wait));
                    }
                    let sleep_for = hint.min(Duration::from_millis(250));
                    waited += sleep_for;
                    tokio::time::sleep(sleep_for).await;
                }
            }
        }
    }

    /// Non-blocking probe, used by tests and the watchdog.
    pub fn try_acquire(&self, priority: Priority) -> bool {
        self.buckets[priority.index()].try_acquire().is_ok()
    }
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new(RateLimiterConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn acquire_succeeds_within_capacity() {
        let limiter = RateLimiter::default();
        for _ in 0..5 {
            limiter.acquire(Priority::Ui).await.unwrap();
        }
    }

    #[test]
    fn bucket_denies_when_empty() {
        let bucket = TokenBucket::new(2, 0.001);
        assert!(bucket.try_acquire().is_ok());
        assert!(bucket.try_acquire().is_ok());
        assert!(bucket.try_acquire().is_err());
    }

    #[test]
    fn tiers_are_independent() {
        let limiter = RateLimiter::new(RateLimiterConfig {
            tiers: [(1, 0.001), (1, 0.001), (1, 0.001), (1, 0.001), (1, 0.001)],
            max_wait: Duration::from_millis(1),
        });
        assert!(limiter.try_acquire(Priority::Ui));
        assert!(!limiter.try_acquire(Priority::Ui));
        // Draining UI must not affect Background.
        assert!(limiter.try_acquire(Priority::Background));
    }
}
