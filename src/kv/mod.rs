//! Multi-tier KV facade
//!
//! Two layers sit behind one interface:
//! - L1: in-process LRU of `key -> (value, expiry)`, default TTL 30 minutes
//! - L2: a remote provider pair (primary + optional backup) reached over
//!   REST
//!
//! Writes go through a smart-write filter (an unexpired, byte-identical L1
//! entry skips the remote PUT), and repeated quota/transport failures on
//! the primary flip a `current_provider` flag to the backup until a
//! scheduled probe finds the primary healthy again.

pub mod cloudflare;
pub mod memory;
pub mod provider;
pub mod upstash;

pub use cloudflare::CloudflareKv;
pub use memory::MemoryKv;
pub use provider::{KvEntry, KvProvider, ProviderError, ProviderErrorKind};
pub use upstash::UpstashRedis;

use crate::limits::RetryableError;
use lru::LruCache;
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::num::NonZeroUsize;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;

/// Facade errors carry the provider that failed and the underlying class.
#[derive(Error, Debug)]
pub enum CacheError {
    #[error("cache get via {provider} failed: {message}")]
    Get {
        provider: &'static str,
        kind: ProviderErrorKind,
        message: String,
    },

    #[error("cache set via {provider} failed: {message}")]
    Set {
        provider: &'static str,
        kind: ProviderErrorKind,
        message: String,
    },

    #[error("cache delete via {provider} failed: {message}")]
    Delete {
        provider: &'static str,
        kind: ProviderErrorKind,
        message: String,
    },

    #[error("cache list via {provider} failed: {message}")]
    List {
        provider: &'static str,
        kind: ProviderErrorKind,
        message: String,
    },

    #[error("cache codec error: {0}")]
    Codec(String),
}

impl CacheError {
    pub fn kind(&self) -> Option<ProviderErrorKind> {
        match self {
            CacheError::Get { kind, .. }
            | CacheError::Set { kind, .. }
            | CacheError::Delete { kind, .. }
            | CacheError::List { kind, .. } => Some(*kind),
            CacheError::Codec(_) => None,
        }
    }
}

impl RetryableError for CacheError {
    fn is_retryable(&self) -> bool {
        matches!(
            self.kind(),
            Some(ProviderErrorKind::Transport) | Some(ProviderErrorKind::Quota)
        )
    }
}

/// Options for `get`.
#[derive(Debug, Clone, Copy, Default)]
pub struct GetOptions {
    /// Bypass L1 entirely (read-through)
    pub skip_cache: bool,
    /// L1 backfill TTL; facade default when `None`
    pub cache_ttl: Option<Duration>,
}

/// Options for `set`.
#[derive(Debug, Clone, Copy, Default)]
pub struct SetOptions {
    /// Disable the smart-write filter and L1 update
    pub skip_cache: bool,
}

/// Which L2 backend currently services operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActiveProvider {
    Primary,
    Backup,
}

/// Decision returned by a `compare_and_swap` closure.
pub enum CasDecision {
    Write(String),
    Delete,
    Keep,
}

/// What `compare_and_swap` did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CasOutcome {
    Written,
    Deleted,
    Unchanged,
}

#[derive(Debug)]
struct FailoverState {
    active: ActiveProvider,
    consecutive_failures: u32,
    last_error_kind: Option<ProviderErrorKind>,
    /// When on backup: earliest instant the next primary probe may run
    recover_after: Option<Instant>,
}

/// Facade tuning.
#[derive(Debug, Clone)]
pub struct KvStoreConfig {
    pub l1_capacity: usize,
    pub l1_default_ttl: Duration,
    /// Consecutive quota/transport failures on the primary before switching
    pub failover_threshold: u32,
    /// Probe interval after a quota-class failure
    pub quota_recovery: Duration,
    /// Probe interval after a transport-class failure
    pub transport_recovery: Duration,
}

impl Default for KvStoreConfig {
    fn default() -> Self {
        Self {
            l1_capacity: 4096,
            l1_default_ttl: Duration::from_secs(30 * 60),
            failover_threshold: 3,
            quota_recovery: Duration::from_secs(12 * 60 * 60),
            transport_recovery: Duration::from_secs(30 * 60),
        }
    }
}

#[derive(Debug, Clone)]
struct L1Entry {
    value: String,
    expires_at: Instant,
}

const WRITE_SHARDS: usize = 16;
const RECOVERY_PROBE_KEY: &str = "health:recovery-probe";

/// Multi-tier KV store with primary/backup failover.
pub struct KvStore {
    l1: Mutex<LruCache<String, L1Entry>>,
    primary: Arc<dyn KvProvider>,
    backup: Option<Arc<dyn KvProvider>>,
    failover: Mutex<FailoverState>,
    /// Per-key write sections, sharded by key hash. The L2 write happens
    /// inside the same section that mutates L1 so smart-write ordering
    /// holds.
    write_shards: Vec<tokio::sync::Mutex<()>>,
    config: KvStoreConfig,
}

impl KvStore {
    pub fn new(
        primary: Arc<dyn KvProvider>,
        backup: Option<Arc<dyn KvProvider>>,
        config: KvStoreConfig,
    ) -> Self {
        let capacity = NonZeroUsize::new(config.l1_capacity.max(1)).unwrap();
        Self {
            l1: Mutex::new(LruCache::new(capacity)),
            primary,
            backup,
            failover: Mutex::new(FailoverState {
                active: ActiveProvider::Primary,
                consecutive_failures: 0,
                last_error_kind: None,
                recover_after: None,
            }),
            write_shards: (0..WRITE_SHARDS)
                .map(|_| tokio::sync::Mutex::new(()))
                .collect(),
            config,
        }
    }

    /// Currently active L2 backend.
    pub fn current_provider(&self) -> ActiveProvider {
        self.failover.lock().active
    }

    pub fn current_provider_name(&self) -> &'static str {
        match self.current_provider() {
            ActiveProvider::Primary => self.primary.name(),
            ActiveProvider::Backup => self
                .backup
                .as_ref()
                .map(|b| b.name())
                .unwrap_or_else(|| self.primary.name()),
        }
    }

    fn shard_for(&self, key: &str) -> &tokio::sync::Mutex<()> {
        use std::hash::{Hash, Hasher};
        let mut hasher = std::collections::hash_map::DefaultHasher::new();
        key.hash(&mut hasher);
        &self.write_shards[(hasher.finish() as usize) % WRITE_SHARDS]
    }

    fn l2(&self) -> Arc<dyn KvProvider> {
        match self.failover.lock().active {
            ActiveProvider::Primary => self.primary.clone(),
            ActiveProvider::Backup => self
                .backup
                .clone()
                .unwrap_or_else(|| self.primary.clone()),
        }
    }

    fn record_success(&self) {
        let mut state = self.failover.lock();
        if state.active == ActiveProvider::Primary {
            state.consecutive_failures = 0;
        }
    }

    /// Count a quota/transport failure on the primary; flip to the backup
    /// once the threshold is hit. Failover is disabled with no backup.
    fn record_failure(&self, kind: ProviderErrorKind) {
        if self.backup.is_none() {
            return;
        }
        if !matches!(
            kind,
            ProviderErrorKind::Quota | ProviderErrorKind::Transport
        ) {
            return;
        }

        let mut state = self.failover.lock();
        if state.active != ActiveProvider::Primary {
            return;
        }

        state.consecutive_failures += 1;
        state.last_error_kind = Some(kind);

        if state.consecutive_failures >= self.config.failover_threshold {
            let interval = match kind {
                ProviderErrorKind::Quota => self.config.quota_recovery,
                _ => self.config.transport_recovery,
            };
            state.active = ActiveProvider::Backup;
            state.consecutive_failures = 0;
            state.recover_after = Some(Instant::now() + interval);
            tracing::warn!(
                provider = self.primary.name(),
                ?kind,
                recovery_in_secs = interval.as_secs(),
                "KV primary failed over to backup"
            );
        }
    }

    /// If the recovery window elapsed, probe the primary and switch back on
    /// success. Runs inline ahead of operations; cheap when not due.
    async fn maybe_recover(&self) {
        let due = {
            let state = self.failover.lock();
            state.active == ActiveProvider::Backup
                && state.recover_after.is_some_and(|at| Instant::now() >= at)
        };
        if !due {
            return;
        }
        self.probe_primary().await;
    }

    /// Probe the primary immediately; switch back when healthy.
    pub async fn probe_primary(&self) -> bool {
        match self.primary.get(RECOVERY_PROBE_KEY).await {
            Ok(_) => {
                let mut state = self.failover.lock();
                state.active = ActiveProvider::Primary;
                state.consecutive_failures = 0;
                state.last_error_kind = None;
                state.recover_after = None;
                tracing::info!(provider = self.primary.name(), "KV primary recovered");
                true
            }
            Err(err) => {
                let interval = match err.kind {
                    ProviderErrorKind::Quota => self.config.quota_recovery,
                    _ => self.config.transport_recovery,
                };
                let mut state = self.failover.lock();
                if state.active == ActiveProvider::Backup {
                    state.recover_after = Some(Instant::now() + interval);
                }
                tracing::debug!(error = %err, "KV primary probe failed; staying on backup");
                false
            }
        }
    }

    fn l1_get(&self, key: &str) -> Option<String> {
        let mut l1 = self.l1.lock();
        match l1.get(key) {
            Some(entry) => {
                if Instant::now() < entry.expires_at {
                    return Some(entry.value.clone());
                }
            }
            None => return None,
        }
        // TTL-expired entries are misses.
        l1.pop(key);
        None
    }

    fn l1_put(&self, key: &str, value: &str, ttl: Duration) {
        let mut l1 = self.l1.lock();
        l1.put(
            key.to_string(),
            L1Entry {
                value: value.to_string(),
                expires_at: Instant::now() + ttl,
            },
        );
    }

    fn l1_invalidate(&self, key: &str) {
        self.l1.lock().pop(key);
    }

    /// Unexpired L1 entry byte-equal to `value`?
    fn l1_matches(&self, key: &str, value: &str) -> bool {
        let mut l1 = self.l1.lock();
        matches!(
            l1.get(key),
            Some(entry) if Instant::now() < entry.expires_at && entry.value == value
        )
    }

    pub async fn get(&self, key: &str, opts: GetOptions) -> Result<Option<String>, CacheError> {
        if !opts.skip_cache {
            if let Some(value) = self.l1_get(key) {
                return Ok(Some(value));
            }
        }

        self.maybe_recover().await;
        let provider = self.l2();
        match provider.get(key).await {
            Ok(Some(value)) => {
                self.record_success();
                if !opts.skip_cache {
                    let ttl = opts.cache_ttl.unwrap_or(self.config.l1_default_ttl);
                    self.l1_put(key, &value, ttl);
                }
                Ok(Some(value))
            }
            Ok(None) => {
                self.record_success();
                Ok(None)
            }
            Err(err) => {
                self.record_failure(err.kind);
                Err(CacheError::Get {
                    provider: err.provider,
                    kind: err.kind,
                    message: err.message,
                })
            }
        }
    }

    pub async fn set(
        &self,
        key: &str,
        value: &str,
        ttl: Option<Duration>,
        opts: SetOptions,
    ) -> Result<(), CacheError> {
        let _guard = self.shard_for(key).lock().await;

        // Smart-write filter: identical unexpired L1 entry means the remote
        // already holds this value.
        if !opts.skip_cache && self.l1_matches(key, value) {
            return Ok(());
        }

        self.maybe_recover().await;
        let provider = self.l2();
        match provider.set(key, value, ttl).await {
            Ok(()) => {
                self.record_success();
                if !opts.skip_cache {
                    let l1_ttl = ttl.unwrap_or(self.config.l1_default_ttl);
                    self.l1_put(key, value, l1_ttl);
                }
                Ok(())
            }
            Err(err) => {
                self.record_failure(err.kind);
                Err(CacheError::Set {
                    provider: err.provider,
                    kind: err.kind,
                    message: err.message,
                })
            }
        }
    }

    pub async fn delete(&self, key: &str) -> Result<(), CacheError> {
        let _guard = self.shard_for(key).lock().await;

        // L1 goes first, unconditionally.
        self.l1_invalidate(key);

        self.maybe_recover().await;
        let provider = self.l2();
        match provider.delete(key).await {
            Ok(()) => {
                self.record_success();
                Ok(())
            }
            Err(err) => {
                self.record_failure(err.kind);
                Err(CacheError::Delete {
                    provider: err.provider,
                    kind: err.kind,
                    message: err.message,
                })
            }
        }
    }

    pub async fn list_keys(&self, prefix: Option<&str>) -> Result<Vec<String>, CacheError> {
        self.maybe_recover().await;
        let provider = self.l2();
        match provider.list_keys(prefix).await {
            Ok(keys) => {
                self.record_success();
                Ok(keys)
            }
            Err(err) => {
                self.record_failure(err.kind);
                Err(CacheError::List {
                    provider: err.provider,
                    kind: err.kind,
                    message: err.message,
                })
            }
        }
    }

    /// Pipelined write. No smart-write filtering; L1 is refreshed after the
    /// remote write succeeds.
    pub async fn bulk_set(&self, entries: &[KvEntry]) -> Result<(), CacheError> {
        if entries.is_empty() {
            return Ok(());
        }

        self.maybe_recover().await;
        let provider = self.l2();
        match provider.bulk_set(entries).await {
            Ok(()) => {
                self.record_success();
                for entry in entries {
                    let ttl = entry.ttl.unwrap_or(self.config.l1_default_ttl);
                    self.l1_put(&entry.key, &entry.value, ttl);
                }
                Ok(())
            }
            Err(err) => {
                self.record_failure(err.kind);
                Err(CacheError::Set {
                    provider: err.provider,
                    kind: err.kind,
                    message: err.message,
                })
            }
        }
    }

    /// Atomic read-modify-write under the key's write section. The closure
    /// sees the current remote value (L1 is bypassed for freshness) and
    /// decides whether to write, delete, or leave the key untouched. This
    /// is the primitive lock records are built on.
    pub async fn compare_and_swap<F>(
        &self,
        key: &str,
        ttl: Option<Duration>,
        decide: F,
    ) -> Result<CasOutcome, CacheError>
    where
        F: FnOnce(Option<&str>) -> CasDecision,
    {
        let _guard = self.shard_for(key).lock().await;

        self.maybe_recover().await;
        let provider = self.l2();

        let current = match provider.get(key).await {
            Ok(value) => {
                self.record_success();
                value
            }
            Err(err) => {
                self.record_failure(err.kind);
                return Err(CacheError::Get {
                    provider: err.provider,
                    kind: err.kind,
                    message: err.message,
                });
            }
        };

        match decide(current.as_deref()) {
            CasDecision::Keep => Ok(CasOutcome::Unchanged),
            CasDecision::Write(value) => match provider.set(key, &value, ttl).await {
                Ok(()) => {
                    self.record_success();
                    let l1_ttl = ttl.unwrap_or(self.config.l1_default_ttl);
                    self.l1_put(key, &value, l1_ttl);
                    Ok(CasOutcome::Written)
                }
                Err(err) => {
                    self.record_failure(err.kind);
                    Err(CacheError::Set {
                        provider: err.provider,
                        kind: err.kind,
                        message: err.message,
                    })
                }
            },
            CasDecision::Delete => {
                self.l1_invalidate(key);
                match provider.delete(key).await {
                    Ok(()) => {
                        self.record_success();
                        Ok(CasOutcome::Deleted)
                    }
                    Err(err) => {
                        self.record_failure(err.kind);
                        Err(CacheError::Delete {
                            provider: err.provider,
                            kind: err.kind,
                            message: err.message,
                        })
                    }
                }
            }
        }
    }

    /// Typed read of a JSON value.
    pub async fn get_json<T: DeserializeOwned>(
        &self,
        key: &str,
        opts: GetOptions,
    ) -> Result<Option<T>, CacheError> {
        match self.get(key, opts).await? {
            Some(raw) => serde_json::from_str(&raw)
                .map(Some)
                .map_err(|e| CacheError::Codec(format!("{key}: {e}"))),
            None => Ok(None),
        }
    }

    /// Typed write of a JSON value.
    pub async fn set_json<T: Serialize>(
        &self,
        key: &str,
        value: &T,
        ttl: Option<Duration>,
        opts: SetOptions,
    ) -> Result<(), CacheError> {
        let raw =
            serde_json::to_string(value).map_err(|e| CacheError::Codec(format!("{key}: {e}")))?;
        self.set(key, &raw, ttl, opts).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store_with_backup() -> (Arc<MemoryKv>, Arc<MemoryKv>, KvStore) {
        let primary = Arc::new(MemoryKv::new("primary"));
        let backup = Arc::new(MemoryKv::new("backup"));
        let store = KvStore::new(
            primary.clone(),
            Some(backup.clone()),
            KvStoreConfig::default(),
        );
        (primary, backup, store)
    }

    #[tokio::test]
    async fn read_your_writes() {
        let (_, _, store) = store_with_backup();
        store
            .set("k", "v1", None, SetOptions::default())
            .await
            .unwrap();
        let value = store.get("k", GetOptions::default()).await.unwrap();
        assert_eq!(value, Some("v1".to_string()));
    }

    #[tokio::test]
    async fn set_delete_get_is_null() {
        let (_, _, store) = store_with_backup();
        store
            .set("k", "v1", None, SetOptions::default())
            .await
            .unwrap();
        store.delete("k").await.unwrap();
        assert_eq!(store.get("k", GetOptions::default()).await.unwrap(), None);
    }

    #[tokio::test]
    async fn smart_write_skips_identical_remote_put() {
        let (primary, _, store) = store_with_backup();
        store
            .set("k", "same", None, SetOptions::default())
            .await
            .unwrap();

        // Second identical write must not reach the provider: a scripted
        // failure would surface if it did.
        primary.inject_failures(ProviderErrorKind::Validation, 1);
        store
            .set("k", "same", None, SetOptions::default())
            .await
            .unwrap();

        // A different value does reach the provider and consumes the
        // injected failure.
        let err = store
            .set("k", "different", None, SetOptions::default())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), Some(ProviderErrorKind::Validation));
    }

    #[tokio::test]
    async fn skip_cache_disables_smart_write() {
        let (primary, _, store) = store_with_backup();
        store
            .set("k", "same", None, SetOptions::default())
            .await
            .unwrap();

        primary.inject_failures(ProviderErrorKind::Validation, 1);
        let result = store
            .set("k", "same", None, SetOptions { skip_cache: true })
            .await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn l1_hit_avoids_provider() {
        let (primary, _, store) = store_with_backup();
        store
            .set("k", "v", None, SetOptions::default())
            .await
            .unwrap();

        primary.inject_failures(ProviderErrorKind::Transport, 1);
        // Served from L1; the injected failure stays queued.
        assert_eq!(
            store.get("k", GetOptions::default()).await.unwrap(),
            Some("v".to_string())
        );
        // skip_cache forces the remote read and trips the failure.
        assert!(store
            .get(
                "k",
                GetOptions {
                    skip_cache: true,
                    cache_ttl: None
                }
            )
            .await
            .is_err());
    }

    #[tokio::test]
    async fn quota_failures_flip_to_backup_and_reset_counter() {
        let (primary, backup, store) = store_with_backup();
        primary.inject_failures(ProviderErrorKind::Quota, 3);

        for _ in 0..3 {
            assert!(store
                .set("k", "v", None, SetOptions { skip_cache: true })
                .await
                .is_err());
        }

        assert_eq!(store.current_provider(), ActiveProvider::Backup);
        assert_eq!(store.failover.lock().consecutive_failures, 0);

        // Fourth write lands on the backup.
        store
            .set("k", "v", None, SetOptions { skip_cache: true })
            .await
            .unwrap();
        assert_eq!(backup.get("k").await.unwrap(), Some("v".to_string()));
        assert!(primary.get("k").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn validation_errors_do_not_trip_failover() {
        let (primary, _, store) = store_with_backup();
        primary.inject_failures(ProviderErrorKind::Validation, 5);

        for _ in 0..5 {
            assert!(store
                .set("k", "v", None, SetOptions { skip_cache: true })
                .await
                .is_err());
        }
        assert_eq!(store.current_provider(), ActiveProvider::Primary);
    }

    #[tokio::test]
    async fn no_backup_means_no_failover() {
        let primary = Arc::new(MemoryKv::new("primary"));
        let store = KvStore::new(primary.clone(), None, KvStoreConfig::default());
        primary.inject_failures(ProviderErrorKind::Quota, 5);

        for _ in 0..5 {
            assert!(store
                .set("k", "v", None, SetOptions { skip_cache: true })
                .await
                .is_err());
        }
        assert_eq!(store.current_provider(), ActiveProvider::Primary);
    }

    #[tokio::test]
    async fn probe_switches_back_when_primary_is_healthy() {
        let (primary, _, store) = store_with_backup();
        primary.inject_failures(ProviderErrorKind::Transport, 3);
        for _ in 0..3 {
            let _ = store
                .set("k", "v", None, SetOptions { skip_cache: true })
                .await;
        }
        assert_eq!(store.current_provider(), ActiveProvider::Backup);

        assert!(store.probe_primary().await);
        assert_eq!(store.current_provider(), ActiveProvider::Primary);
        assert!(store.failover.lock().last_error_kind.is_none());
    }

    #[tokio::test]
    async fn missing_key_is_none_not_error() {
        let (_, _, store) = store_with_backup();
        assert_eq!(
            store.get("absent", GetOptions::default()).await.unwrap(),
            None
        );
    }
}
