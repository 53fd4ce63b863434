//! Protocol client supervision
//!
//! One long-lived chat connection per cluster, owned by whichever instance
//! holds the leader lock. The supervisor routes every call through the
//! rate limiter and circuit breaker, classifies failures, and drives the
//! bounded reconnect procedure:
//!
//! `disconnect (5 s cap) -> optional session reset -> jittered delay ->
//! connect`, always re-checking leadership first.

pub mod breaker;
pub mod classifier;
pub mod transport;
pub mod watchdog;

pub use breaker::{BreakerConfig, BreakerState, CircuitBreaker};
pub use classifier::{
    classify, is_recoverable, reconnect_strategy, should_reset_session, ErrorKind,
    ReconnectStrategy, ReconnectType,
};
pub use transport::{
    CallbackQuery, ChatEvent, ChatMessage, ChatTransport, ClientError, DetachedTransport,
    MediaInfo,
};

use crate::coordinator::{InstanceCoordinator, LEADER_LOCK};
use crate::limits::{Priority, RateLimiter, RetryableError};
use rand::Rng;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

impl RetryableError for ClientError {
    fn is_retryable(&self) -> bool {
        matches!(
            classify(self),
            ErrorKind::Timeout
                | ErrorKind::Network
                | ErrorKind::ConnectionLost
                | ErrorKind::NotConnected
        )
    }
}

/// Supervisor tuning.
#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    /// Hard cap on a disconnect; on timeout we proceed as if disconnected
    pub disconnect_timeout: Duration,
    /// Quiet window after an error before reconnecting
    pub error_debounce: Duration,
    pub watchdog: watchdog::WatchdogConfig,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            disconnect_timeout: Duration::from_secs(5),
            error_debounce: Duration::from_secs(2),
            watchdog: watchdog::WatchdogConfig::default(),
        }
    }
}

/// Supervisor for the chat protocol connection.
pub struct ClientSupervisor {
    transport: Arc<dyn ChatTransport>,
    breaker: CircuitBreaker,
    coordinator: Arc<InstanceCoordinator>,
    limiter: Arc<RateLimiter>,
    config: SupervisorConfig,
    /// Consecutive reconnect failures; feeds the strategy table
    failure_count: AtomicU32,
    is_reconnecting: AtomicBool,
    repair_tx: mpsc::UnboundedSender<ErrorKind>,
    repair_rx: parking_lot::Mutex<Option<mpsc::UnboundedReceiver<ErrorKind>>>,
}

impl ClientSupervisor {
    pub fn new(
        transport: Arc<dyn ChatTransport>,
        breaker: CircuitBreaker,
        coordinator: Arc<InstanceCoordinator>,
        limiter: Arc<RateLimiter>,
        config: SupervisorConfig,
    ) -> Self {
        let (repair_tx, repair_rx) = mpsc::unbounded_channel();
        Self {
            transport,
            breaker,
            coordinator,
            limiter,
            config,
            failure_count: AtomicU32::new(0),
            is_reconnecting: AtomicBool::new(false),
            repair_tx,
            repair_rx: parking_lot::Mutex::new(Some(repair_rx)),
        }
    }

    pub fn transport(&self) -> Arc<dyn ChatTransport> {
        self.transport.clone()
    }

    pub async fn is_leader(&self) -> bool {
        self.coordinator.has_lock(LEADER_LOCK).await
    }

    /// Boot the supervisor: connect when leading, then keep the watchdog,
    /// the debounced repair loop, and the leadership follower running.
    pub async fn start(self: &Arc<Self>) {
        if self.is_leader().await {
            if let Err(err) = self.connect().await {
                tracing::warn!(error = %err, "initial connect failed");
            }
        }

        let watchdog_config = self.config.watchdog.clone();
        tokio::spawn(watchdog::run(Arc::clone(self), watchdog_config));

        if let Some(repair_rx) = self.repair_rx.lock().take() {
            let supervisor = Arc::clone(self);
            tokio::spawn(supervisor.repair_loop(repair_rx));
        }

        let supervisor = Arc::clone(self);
        tokio::spawn(supervisor.follow_leadership());
    }

    /// React to leadership changes: connect on gain, disconnect on loss.
    async fn follow_leadership(self: Arc<Self>) {
        let mut watch = self.coordinator.leader_watch();
        loop {
            if watch.changed().await.is_err() {
                return;
            }
            let leading = *watch.borrow();
            if leading {
                if let Err(err) = self.connect().await {
                    tracing::warn!(error = %err, "connect after leadership gain failed");
                }
            } else {
                tracing::info!("leadership lost; disconnecting protocol client");
                self.bounded_disconnect().await;
            }
        }
    }

    /// Execute one protocol call through the rate limiter and breaker.
    /// Failures are classified and queue a debounced reconnect.
    pub async fn call<T, Fut, Op>(&self, priority: Priority, operation: Op) -> Result<T, ClientError>
    where
        Fut: Future<Output = Result<T, ClientError>>,
        Op: FnOnce() -> Fut,
    {
        self.limiter
            .acquire(priority)
            .await
            .map_err(|e| ClientError::new(format!("rate limit: {e}")))?;

        match self.breaker.execute(operation).await {
            Ok(value) => Ok(value),
            Err(err) => {
                let kind = classify(&err);
                if is_recoverable(kind) {
                    let _ = self.repair_tx.send(kind);
                } else {
                    tracing::error!(?kind, error = %err, "unrecoverable protocol error");
                }
                Err(err)
            }
        }
    }

    pub async fn ping(&self) -> Result<(), ClientError> {
        let transport = self.transport.clone();
        self.call(Priority::Background, || async move {
            tokio::time::timeout(Duration::from_secs(10), transport.ping())
                .await
                .map_err(|_| ClientError::timeout("ping"))?
        })
        .await
    }

    async fn connect(&self) -> Result<(), ClientError> {
        let transport = self.transport.clone();
        self.breaker.execute(|| async move { transport.connect().await }).await
    }

    /// Disconnect with the hard timeout; on expiry proceed as if the
    /// transport were down.
    async fn bounded_disconnect(&self) {
        let result = tokio::time::timeout(
            self.config.disconnect_timeout,
            self.transport.disconnect(),
        )
        .await;
        match result {
            Ok(Ok(())) => {}
            Ok(Err(err)) => tracing::debug!(error = %err, "disconnect returned error"),
            Err(_) => tracing::warn!("disconnect timed out; proceeding as disconnected"),
        }
    }

    /// Debounced error-triggered reconnects: wait out the quiet window,
    /// coalesce whatever queued up in the meantime, then reconnect once.
    async fn repair_loop(self: Arc<Self>, mut repair_rx: mpsc::UnboundedReceiver<ErrorKind>) {
        while let Some(first) = repair_rx.recv().await {
            tokio::time::sleep(self.config.error_debounce).await;

            let mut kind = first;
            while let Ok(next) = repair_rx.try_recv() {
                kind = next;
            }

            self.reconnect(kind).await;
        }
    }

    /// Immediate reconnect, bypassing the debounce (watchdog path).
    pub async fn force_reconnect(&self, kind: ErrorKind) {
        self.reconnect(kind).await;
    }

    /// The reconnect procedure. Re-entrancy is prevented by the
    /// `is_reconnecting` flag; leadership is re-verified before any
    /// attempt, and losing it skips the reconnect entirely.
    async fn reconnect(&self, initial_kind: ErrorKind) {
        if self
            .is_reconnecting
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            tracing::debug!("reconnect already in flight");
            return;
        }

        let mut kind = initial_kind;
        loop {
            if !self.is_leader().await {
                tracing::info!("not leader; skipping reconnect");
                break;
            }

            let failures = self.failure_count.load(Ordering::SeqCst);
            let strategy = reconnect_strategy(kind, failures);
            if !strategy.should_retry {
                tracing::error!(?kind, failures, "giving up on reconnect");
                break;
            }

            tracing::info!(
                ?kind,
                failures,
                reconnect_type = ?strategy.reconnect_type,
                delay_ms = strategy.delay.as_millis() as u64,
                "reconnecting"
            );

            self.bounded_disconnect().await;

            if should_reset_session(kind, failures) {
                if let Err(err) = self.transport.reset_session().await {
                    tracing::warn!(error = %err, "session reset failed");
                }
            }

            tokio::time::sleep(with_jitter(strategy.delay)).await;

            match self.transport.connect().await {
                Ok(()) => {
                    self.failure_count.store(0, Ordering::SeqCst);
                    tracing::info!("protocol client reconnected");
                    break;
                }
                Err(err) => {
                    self.failure_count.fetch_add(1, Ordering::SeqCst);
                    kind = classify(&err);
                    tracing::warn!(error = %err, ?kind, "reconnect attempt failed");
                }
            }
        }

        self.is_reconnecting.store(false, Ordering::SeqCst);
    }
}

/// Up to 10% random jitter on top of a delay.
fn with_jitter(delay: Duration) -> Duration {
    if delay.is_zero() {
        return delay;
    }
    delay + delay.mul_f64(rand::thread_rng().gen_range(0.0..0.1))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::{ManualClock, SystemClock};
    use crate::coordinator::{CoordinatorConfig, MemoryInstanceStore};
    use crate::kv::{KvStore, KvStoreConfig, MemoryKv};
    use crate::pipeline::cancel::CancelToken;
    use async_trait::async_trait;
    use std::path::Path;
    use std::sync::atomic::AtomicU32;

    /// Transport whose connect fails a scripted number of times.
    struct FlakyTransport {
        connects: AtomicU32,
        fail_first: u32,
        connected: AtomicBool,
    }

    impl FlakyTransport {
        fn new(fail_first: u32) -> Self {
            Self {
                connects: AtomicU32::new(0),
                fail_first,
                connected: AtomicBool::new(false),
            }
        }
    }

    #[async_trait]
    impl ChatTransport for FlakyTransport {
        async fn connect(&self) -> Result<(), ClientError> {
            let attempt = self.connects.fetch_add(1, Ordering::SeqCst);
            if attempt < self.fail_first {
                Err(ClientError::new("connection lost during handshake"))
            } else {
                self.connected.store(true, Ordering::SeqCst);
                Ok(())
            }
        }

        async fn disconnect(&self) -> Result<(), ClientError> {
            self.connected.store(false, Ordering::SeqCst);
            Ok(())
        }

        async fn reset_session(&self) -> Result<(), ClientError> {
            Ok(())
        }

        async fn ping(&self) -> Result<(), ClientError> {
            if self.connected.load(Ordering::SeqCst) {
                Ok(())
            } else {
                Err(ClientError::not_connected())
            }
        }

        fn is_connected(&self) -> bool {
            self.connected.load(Ordering::SeqCst)
        }

        async fn next_event(&self) -> Result<Option<ChatEvent>, ClientError> {
            Ok(None)
        }

        async fn get_message(
            &self,
            _chat_id: i64,
            _msg_id: i64,
        ) -> Result<Option<ChatMessage>, ClientError> {
            Ok(None)
        }

        async fn download_media(
            &self,
            _message: &ChatMessage,
            _dest: &Path,
            _progress: transport::ProgressFn<'_>,
            _cancel: &CancelToken,
        ) -> Result<u64, ClientError> {
            Ok(0)
        }

        async fn send_message(&self, _chat_id: i64, _text: &str) -> Result<i64, ClientError> {
            Ok(1)
        }

        async fn edit_message(
            &self,
            _chat_id: i64,
            _msg_id: i64,
            _text: &str,
        ) -> Result<(), ClientError> {
            Ok(())
        }

        async fn answer_callback(&self, _query_id: &str, _text: &str) -> Result<(), ClientError> {
            Ok(())
        }
    }

    async fn leader_coordinator() -> Arc<InstanceCoordinator> {
        let kv = Arc::new(KvStore::new(
            Arc::new(MemoryKv::new("primary")),
            None,
            KvStoreConfig::default(),
        ));
        let coordinator = Arc::new(InstanceCoordinator::new(
            kv,
            Arc::new(MemoryInstanceStore::new()),
            Arc::new(SystemClock),
            CoordinatorConfig::default(),
        ));
        assert!(coordinator
            .acquire_lock(LEADER_LOCK, Duration::from_secs(60))
            .await
            .unwrap());
        coordinator
    }

    fn supervisor_with(
        transport: Arc<dyn ChatTransport>,
        coordinator: Arc<InstanceCoordinator>,
    ) -> Arc<ClientSupervisor> {
        Arc::new(ClientSupervisor::new(
            transport,
            CircuitBreaker::new(BreakerConfig::default(), Arc::new(ManualClock::new(0))),
            coordinator,
            Arc::new(RateLimiter::default()),
            SupervisorConfig {
                disconnect_timeout: Duration::from_millis(100),
                error_debounce: Duration::from_millis(10),
                watchdog: watchdog::WatchdogConfig {
                    interval: Duration::from_secs(3600),
                    max_failures: 5,
                },
            },
        ))
    }

    #[tokio::test(start_paused = true)]
    async fn reconnect_retries_until_connected() {
        let transport = Arc::new(FlakyTransport::new(2));
        let coordinator = leader_coordinator().await;
        let supervisor = supervisor_with(transport.clone(), coordinator);

        supervisor.force_reconnect(ErrorKind::ConnectionLost).await;
        assert!(transport.is_connected());
        // two failures then a success
        assert_eq!(transport.connects.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn reconnect_skipped_without_leadership() {
        let transport = Arc::new(FlakyTransport::new(0));
        let kv = Arc::new(KvStore::new(
            Arc::new(MemoryKv::new("primary")),
            None,
            KvStoreConfig::default(),
        ));
        let coordinator = Arc::new(InstanceCoordinator::new(
            kv,
            Arc::new(MemoryInstanceStore::new()),
            Arc::new(SystemClock),
            CoordinatorConfig::default(),
        ));
        let supervisor = supervisor_with(transport.clone(), coordinator);

        supervisor.force_reconnect(ErrorKind::ConnectionLost).await;
        assert!(!transport.is_connected());
        assert_eq!(transport.connects.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn call_routes_through_breaker() {
        let transport = Arc::new(FlakyTransport::new(0));
        let coordinator = leader_coordinator().await;
        let supervisor = supervisor_with(transport, coordinator);

        let value = supervisor
            .call(Priority::Normal, || async { Ok::<_, ClientError>(5) })
            .await
            .unwrap();
        assert_eq!(value, 5);
    }

    #[tokio::test]
    async fn auth_key_duplicated_gives_up() {
        struct AlwaysDuplicated;

        #[async_trait]
        impl ChatTransport for AlwaysDuplicated {
            async fn connect(&self) -> Result<(), ClientError> {
                Err(ClientError::with_code(406, "AUTH_KEY_DUPLICATED"))
            }
            async fn disconnect(&self) -> Result<(), ClientError> {
                Ok(())
            }
            async fn reset_session(&self) -> Result<(), ClientError> {
                Ok(())
            }
            async fn ping(&self) -> Result<(), ClientError> {
                Err(ClientError::not_connected())
            }
            fn is_connected(&self) -> bool {
                false
            }
            async fn next_event(&self) -> Result<Option<ChatEvent>, ClientError> {
                Ok(None)
            }
            async fn get_message(
                &self,
                _chat_id: i64,
                _msg_id: i64,
            ) -> Result<Option<ChatMessage>, ClientError> {
                Ok(None)
            }
            async fn download_media(
                &self,
                _message: &ChatMessage,
                _dest: &Path,
                _progress: transport::ProgressFn<'_>,
                _cancel: &CancelToken,
            ) -> Result<u64, ClientError> {
                Err(ClientError::not_connected())
            }
            async fn send_message(&self, _chat_id: i64, _text: &str) -> Result<i64, ClientError> {
                Err(ClientError::not_connected())
            }
            async fn edit_message(
                &self,
                _chat_id: i64,
                _msg_id: i64,
                _text: &str,
            ) -> Result<(), ClientError> {
                Err(ClientError::not_connected())
            }
            async fn answer_callback(
                &self,
                _query_id: &str,
                _text: &str,
            ) -> Result<(), ClientError> {
                Err(ClientError::not_connected())
            }
        }

        let coordinator = leader_coordinator().await;
        let supervisor = supervisor_with(Arc::new(AlwaysDuplicated), coordinator);

        // Unrecoverable: the strategy refuses to retry, so this terminates.
        supervisor.force_reconnect(ErrorKind::AuthKeyDuplicated).await;
        assert!(!supervisor.is_reconnecting.load(Ordering::SeqCst));
    }
}
