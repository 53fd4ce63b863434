//! In-memory KV backend
//!
//! Development and test double for the remote providers. Supports TTLs and
//! scripted failure injection so failover behavior can be exercised without
//! a network.

use super::provider::{KvEntry, KvProvider, ProviderError, ProviderErrorKind};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};

#[derive(Debug, Clone)]
struct StoredValue {
    value: String,
    expires_at: Option<Instant>,
}

/// In-memory `KvProvider`.
#[derive(Default)]
pub struct MemoryKv {
    name: &'static str,
    data: Mutex<HashMap<String, StoredValue>>,
    /// Errors returned (in order) before real behavior resumes
    injected_failures: Mutex<VecDeque<ProviderErrorKind>>,
}

impl MemoryKv {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            data: Mutex::new(HashMap::new()),
            injected_failures: Mutex::new(VecDeque::new()),
        }
    }

    /// Queue `count` failures of the given class ahead of real operations.
    pub fn inject_failures(&self, kind: ProviderErrorKind, count: usize) {
        let mut queue = self.injected_failures.lock();
        for _ in 0..count {
            queue.push_back(kind);
        }
    }

    pub fn len(&self) -> usize {
        self.data.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.lock().is_empty()
    }

    fn take_failure(&self) -> Option<ProviderError> {
        self.injected_failures.lock().pop_front().map(|kind| match kind {
            ProviderErrorKind::Quota => ProviderError::quota(self.name, "injected quota error"),
            ProviderErrorKind::Transport => {
                ProviderError::transport(self.name, "injected transport error")
            }
            ProviderErrorKind::Validation => {
                ProviderError::validation(self.name, "injected validation error")
            }
        })
    }

    fn live_value(&self, key: &str) -> Option<String> {
        let mut data = self.data.lock();
        match data.get(key) {
            Some(stored) => {
                if !stored.expires_at.is_some_and(|at| Instant::now() >= at) {
                    return Some(stored.value.clone());
                }
            }
            None => return None,
        }
        data.remove(key);
        None
    }
}

#[async_trait]
impl KvProvider for MemoryKv {
    fn name(&self) -> &'static str {
        self.name
    }

    async fn get(&self, key: &str) -> Result<Option<String>, ProviderError> {
        if let Some(err) = self.take_failure() {
            return Err(err);
        }
        Ok(self.live_value(key))
    }

    async fn set(
        &self,
        key: &str,
        value: &str,
        ttl: Option<Duration>,
    ) -> Result<(), ProviderError> {
        if let Some(err) = self.take_failure() {
            return Err(err);
        }
        self.data.lock().insert(
            key.to_string(),
            StoredValue {
                value: value.to_string(),
                expires_at: ttl.map(|ttl| Instant::now() + ttl),
            },
        );
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), ProviderError> {
        if let Some(err) = self.take_failure() {
            return Err(err);
        }
        self.data.lock().remove(key);
        Ok(())
    }

    async fn list_keys(&self, prefix: Option<&str>) -> Result<Vec<String>, ProviderError> {
        if let Some(err) = self.take_failure() {
            return Err(err);
        }
        let data = self.data.lock();
        let mut keys: Vec<String> = data
            .keys()
            .filter(|k| prefix.map_or(true, |p| k.starts_with(p)))
            .cloned()
            .collect();
        keys.sort();
        Ok(keys)
    }

    async fn bulk_set(&self, entries: &[KvEntry]) -> Result<(), ProviderError> {
        if let Some(err) = self.take_failure() {
            return Err(err);
        }
        let mut data = self.data.lock();
        for entry in entries {
            data.insert(
                entry.key.clone(),
                StoredValue {
                    value: entry.value.clone(),
                    expires_at: entry.ttl.map(|ttl| Instant::now() + ttl),
                },
            );
        }
        Ok(())
    }
}
