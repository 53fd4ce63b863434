//! Bounded retry with backoff and jitter
//!
//! `with_retry` re-runs an async operation while its error reports as
//! transient: timeouts, network failures, 5xx responses, and 429 with a
//! Retry-After hint. Permanent and business errors pass through on the
//! first attempt.

use rand::Rng;
use std::future::Future;
use std::time::Duration;

/// Implemented by error types that know their own retry class.
pub trait RetryableError {
    /// Whether another attempt could succeed.
    fn is_retryable(&self) -> bool;

    /// Server-provided wait hint (429 Retry-After), if any.
    fn retry_after(&self) -> Option<Duration> {
        None
    }
}

/// Delay schedule between attempts.
#[derive(Debug, Clone, Copy)]
pub enum Backoff {
    /// `base * attempt`
    Linear { base: Duration },
    /// `base * multiplier^(attempt - 1)`
    Exponential { base: Duration, multiplier: f64 },
}

impl Backoff {
    /// Delay before the given 1-indexed retry attempt.
    pub fn delay(&self, attempt: u32) -> Duration {
        match self {
            Backoff::Linear { base } => base.saturating_mul(attempt),
            Backoff::Exponential { base, multiplier } => {
                let factor = multiplier.powi(attempt.saturating_sub(1) as i32);
                base.mul_f64(factor)
            }
        }
    }
}

/// Retry policy: attempt bound, schedule, cap, and jitter fraction.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub backoff: Backoff,
    pub max_delay: Duration,
    /// Fraction of the delay added as random jitter (0.0 disables)
    pub jitter: f64,
}

impl RetryPolicy {
    pub fn exponential(max_retries: u32, base: Duration) -> Self {
        Self {
            max_retries,
            backoff: Backoff::Exponential {
                base,
                multiplier: 2.0,
            },
            max_delay: Duration::from_secs(60),
            jitter: 0.2,
        }
    }

    pub fn linear(max_retries: u32, base: Duration) -> Self {
        Self {
            max_retries,
            backoff: Backoff::Linear { base },
            max_delay: Duration::from_secs(30),
            jitter: 0.2,
        }
    }

    pub fn no_jitter(mut self) -> Self {
        self.jitter = 0.0;
        self
    }

    fn delay_for(&self, attempt: u32, hint: Option<Duration>) -> Duration {
        let mut delay = hint.unwrap_or_else(|| self.backoff.delay(attempt));
        if delay > self.max_delay {
            delay = self.max_delay;
        }
        if self.jitter > 0.0 {
            let jitter = delay.mul_f64(rand::thread_rng().gen_range(0.0..self.jitter));
            delay += jitter;
        }
        delay
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::exponential(3, Duration::from_millis(500))
    }
}

/// Run `operation` under `policy`, retrying transient failures.
pub async fn with_retry<T, E, Fut, Op>(policy: &RetryPolicy, mut operation: Op) -> Result<T, E>
where
    E: RetryableError + std::fmt::Display,
    Fut: Future<Output = Result<T, E>>,
    Op: FnMut() -> Fut,
{
    let mut attempt: u32 = 0;

    loop {
        match operation().await {
            Ok(value) => return Ok(value),
            Err(err) => {
                if !err.is_retryable() {
                    return Err(err);
                }
                attempt += 1;
                if attempt > policy.max_retries {
                    return Err(err);
                }

                let delay = policy.delay_for(attempt, err.retry_after());
                tracing::debug!(attempt, ?delay, error = %err, "retrying after transient failure");
                tokio::time::sleep(delay).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    #[derive(Debug, thiserror::Error)]
    #[error("{message}")]
    struct TestError {
        message: String,
        transient: bool,
        hint: Option<Duration>,
    }

    impl RetryableError for TestError {
        fn is_retryable(&self) -> bool {
            self.transient
        }

        fn retry_after(&self) -> Option<Duration> {
            self.hint
        }
    }

    fn transient() -> TestError {
        TestError {
            message: "timeout".into(),
            transient: true,
            hint: None,
        }
    }

    fn permanent() -> TestError {
        TestError {
            message: "bad request".into(),
            transient: false,
            hint: None,
        }
    }

    #[tokio::test]
    async fn retries_transient_until_success() {
        let calls = Arc::new(AtomicU32::new(0));
        let policy = RetryPolicy::linear(5, Duration::from_millis(1)).no_jitter();

        let calls_in = calls.clone();
        let result: Result<u32, TestError> = with_retry(&policy, move || {
            let calls = calls_in.clone();
            async move {
                if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(transient())
                } else {
                    Ok(42)
                }
            }
        })
        .await;

        assert_eq!(result.unwrap(), 42);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn permanent_errors_fail_fast() {
        let calls = Arc::new(AtomicU32::new(0));
        let policy = RetryPolicy::linear(5, Duration::from_millis(1)).no_jitter();

        let calls_in = calls.clone();
        let result: Result<u32, TestError> = with_retry(&policy, move || {
            let calls = calls_in.clone();
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(permanent())
            }
        })
        .await;

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn budget_is_bounded() {
        let calls = Arc::new(AtomicU32::new(0));
        let policy = RetryPolicy::linear(2, Duration::from_millis(1)).no_jitter();

        let calls_in = calls.clone();
        let result: Result<u32, TestError> = with_retry(&policy, move || {
            let calls = calls_in.clone();
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(transient())
            }
        })
        .await;

        assert!(result.is_err());
        // initial attempt + 2 retries
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn exponential_backoff_grows_and_caps() {
        let policy = RetryPolicy::exponential(5, Duration::from_secs(1)).no_jitter();
        assert_eq!(policy.delay_for(1, None), Duration::from_secs(1));
        assert_eq!(policy.delay_for(2, None), Duration::from_secs(2));
        assert_eq!(policy.delay_for(3, None), Duration::from_secs(4));
        assert_eq!(policy.delay_for(10, None), Duration::from_secs(60));
    }

    #[test]
    fn retry_after_hint_wins() {
        let policy = RetryPolicy::exponential(5, Duration::from_secs(1)).no_jitter();
        let delay = policy.delay_for(1, Some(Duration::from_secs(7)));
        assert_eq!(delay, Duration::from_secs(7));
    }
}
