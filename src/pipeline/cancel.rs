//! Cooperative cancellation
//!
//! Workers check the token between chunks, after each retry attempt, and
//! before each repository write. A cancelled task never transitions to
//! `completed` or `failed`, only `cancelled`.

use dashmap::DashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::Notify;

#[derive(Debug, Default)]
struct Inner {
    cancelled: AtomicBool,
    notify: Notify,
}

/// Cloneable cancellation token.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    inner: Arc<Inner>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// Signal cancellation; wakes every waiter.
    pub fn cancel(&self) {
        self.inner.cancelled.store(true, Ordering::SeqCst);
        self.inner.notify.notify_waiters();
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::SeqCst)
    }

    /// Resolve once the token is cancelled.
    pub async fn cancelled(&self) {
        if self.is_cancelled() {
            return;
        }
        loop {
            let notified = self.inner.notify.notified();
            if self.is_cancelled() {
                return;
            }
            notified.await;
            if self.is_cancelled() {
                return;
            }
        }
    }
}

/// Per-task token registry; one live token per in-flight task.
#[derive(Debug, Default)]
pub struct CancelRegistry {
    tokens: DashMap<String, CancelToken>,
}

impl CancelRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Get or create the token for a task.
    pub fn register(&self, task_id: &str) -> CancelToken {
        self.tokens
            .entry(task_id.to_string())
            .or_default()
            .clone()
    }

    /// Signal a task's token. Returns whether a token existed.
    pub fn cancel(&self, task_id: &str) -> bool {
        match self.tokens.get(task_id) {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        }
    }

    /// Drop the token once the task reaches a terminal state.
    pub fn remove(&self, task_id: &str) {
        self.tokens.remove(task_id);
    }

    pub fn is_cancelled(&self, task_id: &str) -> bool {
        self.tokens
            .get(task_id)
            .map(|t| t.is_cancelled())
            .unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn token_signals_waiters() {
        let token = CancelToken::new();
        assert!(!token.is_cancelled());

        let waiter = token.clone();
        let handle = tokio::spawn(async move {
            waiter.cancelled().await;
            true
        });

        token.cancel();
        assert!(handle.await.unwrap());
        assert!(token.is_cancelled());
    }

    #[test]
    fn registry_round_trip() {
        let registry = CancelRegistry::new();
        let token = registry.register("t-1");
        assert!(!registry.is_cancelled("t-1"));

        assert!(registry.cancel("t-1"));
        assert!(token.is_cancelled());
        assert!(registry.is_cancelled("t-1"));

        registry.remove("t-1");
        assert!(!registry.cancel("t-1"));
    }
}
