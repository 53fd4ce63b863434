//! Circuit breaker for the protocol connection
//!
//! `execute` is the only execution path; counters and transitions update
//! under one lock so state changes are atomic.
//!
//! ```text
//! CLOSED    --failures >= threshold--> OPEN
//! OPEN      --recovery elapsed------>  HALF_OPEN
//! OPEN      --execute()------------->  error "circuit breaker open"
//! HALF_OPEN --success-------------->   CLOSED (failures = 0)
//! HALF_OPEN --failure-------------->   OPEN
//! ```
//!
//! Trip thresholds depend on the classified kind: a duplicated auth key
//! trips immediately, network errors at 8, the other recoverable kinds at
//! 6, anything else at the default of 5.

use super::classifier::{classify, ErrorKind};
use super::transport::ClientError;
use crate::clock::Clock;
use parking_lot::Mutex;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug)]
struct BreakerInner {
    state: BreakerState,
    failures: u32,
    opened_at_millis: u64,
}

/// Breaker tuning.
#[derive(Debug, Clone)]
pub struct BreakerConfig {
    pub default_threshold: u32,
    pub recovery_timeout: Duration,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            default_threshold: 5,
            recovery_timeout: Duration::from_secs(60),
        }
    }
}

fn trip_threshold(kind: ErrorKind, default_threshold: u32) -> u32 {
    match kind {
        ErrorKind::AuthKeyDuplicated => 1,
        ErrorKind::Network => 8,
        ErrorKind::Timeout
        | ErrorKind::NotConnected
        | ErrorKind::ConnectionLost
        | ErrorKind::BinaryReader
        | ErrorKind::RpcError => 6,
        ErrorKind::Unknown => default_threshold,
    }
}

/// Circuit breaker guarding every protocol call.
pub struct CircuitBreaker {
    inner: Mutex<BreakerInner>,
    config: BreakerConfig,
    clock: Arc<dyn Clock>,
}

impl CircuitBreaker {
    pub fn new(config: BreakerConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            inner: Mutex::new(BreakerInner {
                state: BreakerState::Closed,
                failures: 0,
                opened_at_millis: 0,
            }),
            config,
            clock,
        }
    }

    pub fn state(&self) -> BreakerState {
        self.inner.lock().state
    }

    pub fn failure_count(&self) -> u32 {
        self.inner.lock().failures
    }

    /// Admission check: moves OPEN to HALF_OPEN once the recovery window
    /// elapsed, otherwise rejects with the remaining wait.
    fn admit(&self) -> Result<(), ClientError> {
        let mut inner = self.inner.lock();
        match inner.state {
            BreakerState::Closed | BreakerState::HalfOpen => Ok(()),
            BreakerState::Open => {
                let elapsed = self
                    .clock
                    .now_millis()
                    .saturating_sub(inner.opened_at_millis);
                let recovery = self.config.recovery_timeout.as_millis() as u64;
                if elapsed >= recovery {
                    inner.state = BreakerState::HalfOpen;
                    tracing::info!("circuit breaker half-open");
                    Ok(())
                } else {
                    let wait_secs = (recovery - elapsed).div_ceil(1000);
                    Err(ClientError::breaker_open(wait_secs))
                }
            }
        }
    }

    fn record_success(&self) {
        let mut inner = self.inner.lock();
        if inner.state == BreakerState::HalfOpen {
            tracing::info!("circuit breaker closed");
        }
        inner.state = BreakerState::Closed;
        inner.failures = 0;
    }

    fn record_failure(&self, kind: ErrorKind) {
        let mut inner = self.inner.lock();
        inner.failures += 1;

        let tripped = match inner.state {
            // A half-open probe failure reopens immediately.
            BreakerState::HalfOpen => true,
            _ => inner.failures >= trip_threshold(kind, self.config.default_threshold),
        };

        if tripped && inner.state != BreakerState::Open {
            inner.state = BreakerState::Open;
            inner.opened_at_millis = self.clock.now_millis();
            tracing::warn!(failures = inner.failures, ?kind, "circuit breaker open");
        }
    }

    /// Run `operation` under the breaker.
    pub async fn execute<T, Fut, Op>(&self, operation: Op) -> Result<T, ClientError>
    where
        Fut: Future<Output = Result<T, ClientError>>,
        Op: FnOnce() -> Fut,
    {
        self.admit()?;

        match operation().await {
            Ok(value) => {
                self.record_success();
                Ok(value)
            }
            Err(err) => {
                self.record_failure(classify(&err));
                Err(err)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;

    fn breaker() -> (CircuitBreaker, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(0));
        (
            CircuitBreaker::new(BreakerConfig::default(), clock.clone()),
            clock,
        )
    }

    async fn fail(breaker: &CircuitBreaker, message: &str) {
        let _ = breaker
            .execute(|| async { Err::<(), _>(ClientError::new(message)) })
            .await;
    }

    #[tokio::test]
    async fn five_unknown_failures_open_the_breaker() {
        let (breaker, _) = breaker();
        for _ in 0..4 {
            fail(&breaker, "odd failure").await;
            assert_eq!(breaker.state(), BreakerState::Closed);
        }
        fail(&breaker, "odd failure").await;
        assert_eq!(breaker.state(), BreakerState::Open);
    }

    #[tokio::test]
    async fn open_rejects_without_invoking() {
        let (breaker, _) = breaker();
        for _ in 0..5 {
            fail(&breaker, "odd failure").await;
        }

        let invoked = std::sync::Arc::new(std::sync::atomic::AtomicBool::new(false));
        let invoked_in = invoked.clone();
        let result = breaker
            .execute(|| async move {
                invoked_in.store(true, std::sync::atomic::Ordering::SeqCst);
                Ok::<_, ClientError>(())
            })
            .await;

        assert!(result.is_err());
        assert!(!invoked.load(std::sync::atomic::Ordering::SeqCst));
        assert!(result.unwrap_err().message.contains("circuit breaker open"));
    }

    #[tokio::test]
    async fn recovers_through_half_open() {
        let (breaker, clock) = breaker();
        for _ in 0..5 {
            fail(&breaker, "odd failure").await;
        }
        assert_eq!(breaker.state(), BreakerState::Open);

        clock.advance_secs(60);
        let result = breaker.execute(|| async { Ok::<_, ClientError>(7) }).await;
        assert_eq!(result.unwrap(), 7);
        assert_eq!(breaker.state(), BreakerState::Closed);
        assert_eq!(breaker.failure_count(), 0);
    }

    #[tokio::test]
    async fn half_open_failure_reopens() {
        let (breaker, clock) = breaker();
        for _ in 0..5 {
            fail(&breaker, "odd failure").await;
        }

        clock.advance_secs(60);
        fail(&breaker, "odd failure").await;
        assert_eq!(breaker.state(), BreakerState::Open);

        // Still rejecting before another full recovery window.
        clock.advance_secs(30);
        let result = breaker
            .execute(|| async { Ok::<_, ClientError>(()) })
            .await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn auth_key_duplicated_trips_immediately() {
        let (breaker, _) = breaker();
        let _ = breaker
            .execute(|| async {
                Err::<(), _>(ClientError::with_code(406, "AUTH_KEY_DUPLICATED"))
            })
            .await;
        assert_eq!(breaker.state(), BreakerState::Open);
    }

    #[tokio::test]
    async fn network_failures_trip_at_eight() {
        let (breaker, _) = breaker();
        for _ in 0..7 {
            fail(&breaker, "getaddrinfo ENOTFOUND network unreachable").await;
            assert_eq!(breaker.state(), BreakerState::Closed);
        }
        fail(&breaker, "getaddrinfo ENOTFOUND network unreachable").await;
        assert_eq!(breaker.state(), BreakerState::Open);
    }

    #[tokio::test]
    async fn timeouts_trip_at_six() {
        let (breaker, _) = breaker();
        for _ in 0..5 {
            fail(&breaker, "request timed out").await;
            assert_eq!(breaker.state(), BreakerState::Closed);
        }
        fail(&breaker, "request timed out").await;
        assert_eq!(breaker.state(), BreakerState::Open);
    }

    #[tokio::test]
    async fn success_resets_failure_count() {
        let (breaker, _) = breaker();
        for _ in 0..4 {
            fail(&breaker, "odd failure").await;
        }
        breaker
            .execute(|| async { Ok::<_, ClientError>(()) })
            .await
            .unwrap();
        assert_eq!(breaker.failure_count(), 0);
    }
}
