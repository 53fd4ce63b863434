//! Instance coordination
//!
//! Two jobs:
//! - elect a single active instance per named role (the `telegram_client`
//!   leader governs the protocol client), and
//! - provide per-task mutual exclusion across instances.
//!
//! Locks are records in the KV namespace under `lock:<name>`; expiration is
//! wall-clock via the record's `acquired_at + ttl_seconds`, checked against
//! the injected clock so tests can advance time. Acquire/release go through
//! the KV facade's compare-and-swap so concurrent acquires serialize.

use crate::clock::Clock;
use crate::kv::{CacheError, CasDecision, GetOptions, KvStore};
use crate::models::{InstanceRecord, InstanceStatus, LockRecord};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::watch;

/// Name of the leader role that gates the protocol client.
pub const LEADER_LOCK: &str = "telegram_client";

/// Coordinator errors.
#[derive(Error, Debug)]
pub enum CoordinatorError {
    #[error(transparent)]
    Cache(#[from] CacheError),

    #[error("instance store error: {0}")]
    Store(String),

    #[error("lock codec error: {0}")]
    Codec(String),
}

/// Persistence seam for the instance table. Implemented by the durable
/// store; tests use an in-memory version.
#[async_trait]
pub trait InstanceStore: Send + Sync {
    async fn register(&self, record: &InstanceRecord) -> Result<(), CoordinatorError>;
    async fn heartbeat(&self, id: &str, at: DateTime<Utc>) -> Result<(), CoordinatorError>;
    async fn mark_offline(&self, id: &str) -> Result<(), CoordinatorError>;
    async fn list(&self) -> Result<Vec<InstanceRecord>, CoordinatorError>;
}

/// Coordinator tuning.
#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    pub heartbeat_interval: Duration,
    pub default_lock_ttl: Duration,
    /// Heartbeat liveness window for the instance table
    pub activity_timeout: Duration,
    pub region: String,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_secs(30),
            default_lock_ttl: Duration::from_secs(60),
            activity_timeout: Duration::from_secs(120),
            region: "local".to_string(),
        }
    }
}

fn lock_key(name: &str) -> String {
    format!("lock:{name}")
}

fn task_lock_name(task_id: &str) -> String {
    format!("task:{task_id}")
}

/// Per-instance coordinator.
pub struct InstanceCoordinator {
    kv: Arc<KvStore>,
    store: Arc<dyn InstanceStore>,
    clock: Arc<dyn Clock>,
    instance: InstanceRecord,
    config: CoordinatorConfig,
    leader_tx: watch::Sender<bool>,
}

impl InstanceCoordinator {
    pub fn new(
        kv: Arc<KvStore>,
        store: Arc<dyn InstanceStore>,
        clock: Arc<dyn Clock>,
        config: CoordinatorConfig,
    ) -> Self {
        let hostname = gethostname::gethostname().to_string_lossy().into_owned();
        let now = Utc::now();
        let instance = InstanceRecord {
            id: uuid::Uuid::new_v4().to_string(),
            hostname,
            region: config.region.clone(),
            started_at: now,
            last_heartbeat: now,
            status: InstanceStatus::Active,
        };
        let (leader_tx, _) = watch::channel(false);

        Self {
            kv,
            store,
            clock,
            instance,
            config,
            leader_tx,
        }
    }

    pub fn instance_id(&self) -> &str {
        &self.instance.id
    }

    /// Observe leadership changes; used by the protocol supervisor to gate
    /// connect/disconnect.
    pub fn leader_watch(&self) -> watch::Receiver<bool> {
        self.leader_tx.subscribe()
    }

    pub fn is_leader_hint(&self) -> bool {
        *self.leader_tx.borrow()
    }

    /// Register this instance and launch the heartbeat loop.
    pub async fn start(self: &Arc<Self>) -> Result<(), CoordinatorError> {
        self.store.register(&self.instance).await?;
        tracing::info!(
            instance_id = %self.instance.id,
            hostname = %self.instance.hostname,
            region = %self.instance.region,
            "instance registered"
        );

        let coordinator = Arc::clone(self);
        tokio::spawn(async move {
            coordinator.heartbeat_loop().await;
        });
        Ok(())
    }

    async fn heartbeat_loop(self: Arc<Self>) {
        let mut ticker = tokio::time::interval(self.config.heartbeat_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            if let Err(err) = self.store.heartbeat(&self.instance.id, Utc::now()).await {
                tracing::warn!(error = %err, "instance heartbeat failed");
            }
        }
    }

    /// Mark this instance offline; called on graceful shutdown.
    pub async fn shutdown(&self) -> Result<(), CoordinatorError> {
        let _ = self.release_lock(LEADER_LOCK).await;
        self.store.mark_offline(&self.instance.id).await
    }

    /// Try to take (or renew) the named lock. Succeeds iff the lock is
    /// unset, expired, or already owned by this instance; renewal writes a
    /// fresh `acquired_at`, extending the TTL.
    pub async fn acquire_lock(&self, name: &str, ttl: Duration) -> Result<bool, CoordinatorError> {
        let now = self.clock.now_secs();
        let record = LockRecord {
            owner_instance_id: self.instance.id.clone(),
            acquired_at: now,
            ttl_seconds: ttl.as_secs(),
        };
        let serialized =
            serde_json::to_string(&record).map_err(|e| CoordinatorError::Codec(e.to_string()))?;

        let mut acquired = false;
        self.kv
            .compare_and_swap(&lock_key(name), Some(ttl), |current| {
                let holder: Option<LockRecord> =
                    current.and_then(|raw| serde_json::from_str(raw).ok());
                match holder {
                    Some(existing)
                        if !existing.is_expired(now)
                            && existing.owner_instance_id != self.instance.id =>
                    {
                        CasDecision::Keep
                    }
                    _ => {
                        acquired = true;
                        CasDecision::Write(serialized)
                    }
                }
            })
            .await?;

        if acquired && name == LEADER_LOCK {
            let _ = self.leader_tx.send_replace(true);
        }
        Ok(acquired)
    }

    /// Delete the lock iff this instance owns it.
    pub async fn release_lock(&self, name: &str) -> Result<(), CoordinatorError> {
        self.kv
            .compare_and_swap(&lock_key(name), None, |current| {
                let holder: Option<LockRecord> =
                    current.and_then(|raw| serde_json::from_str(raw).ok());
                match holder {
                    Some(existing) if existing.owner_instance_id == self.instance.id => {
                        CasDecision::Delete
                    }
                    _ => CasDecision::Keep,
                }
            })
            .await?;

        if name == LEADER_LOCK {
            let _ = self.leader_tx.send_replace(false);
        }
        Ok(())
    }

    /// True iff this instance owns the lock and the tenure has not expired.
    pub async fn has_lock(&self, name: &str) -> bool {
        let record: Option<LockRecord> = match self
            .kv
            .get_json(&lock_key(name), GetOptions::default())
            .await
        {
            Ok(record) => record,
            Err(err) => {
                tracing::warn!(lock = name, error = %err, "lock read failed");
                return false;
            }
        };

        match record {
            Some(existing) => {
                existing.owner_instance_id == self.instance.id
                    && !existing.is_expired(self.clock.now_secs())
            }
            None => false,
        }
    }

    pub async fn acquire_task_lock(&self, task_id: &str) -> Result<bool, CoordinatorError> {
        self.acquire_lock(&task_lock_name(task_id), self.config.default_lock_ttl)
            .await
    }

    pub async fn release_task_lock(&self, task_id: &str) -> Result<(), CoordinatorError> {
        self.release_lock(&task_lock_name(task_id)).await
    }

    pub async fn has_task_lock(&self, task_id: &str) -> bool {
        self.has_lock(&task_lock_name(task_id)).await
    }

    /// Leadership maintenance: re-acquire every `ttl/2`. Publishes changes
    /// to the leader watch so dependents (the protocol supervisor) can
    /// disconnect when tenure is lost.
    pub async fn run_leader_loop(self: Arc<Self>, ttl: Duration) {
        let interval = ttl / 2;
        let mut ticker = tokio::time::interval(interval.max(Duration::from_secs(1)));
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            ticker.tick().await;
            match self.acquire_lock(LEADER_LOCK, ttl).await {
                Ok(true) => {}
                Ok(false) => {
                    if self.is_leader_hint() {
                        tracing::warn!("leader lock lost; demoting");
                    }
                    let _ = self.leader_tx.send_replace(false);
                }
                Err(err) => {
                    // A KV outage must not silently keep leadership alive.
                    tracing::warn!(error = %err, "leader renewal failed; demoting");
                    let _ = self.leader_tx.send_replace(false);
                }
            }
        }
    }
}

/// In-memory instance store for tests and single-node runs.
#[derive(Default)]
pub struct MemoryInstanceStore {
    instances: parking_lot::Mutex<Vec<InstanceRecord>>,
}

impl MemoryInstanceStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl InstanceStore for MemoryInstanceStore {
    async fn register(&self, record: &InstanceRecord) -> Result<(), CoordinatorError> {
        let mut instances = self.instances.lock();
        instances.retain(|i| i.id != record.id);
        instances.push(record.clone());
        Ok(())
    }

    async fn heartbeat(&self, id: &str, at: DateTime<Utc>) -> Result<(), CoordinatorError> {
        let mut instances = self.instances.lock();
        if let Some(instance) = instances.iter_mut().find(|i| i.id == id) {
            instance.last_heartbeat = at;
        }
        Ok(())
    }

    async fn mark_offline(&self, id: &str) -> Result<(), CoordinatorError> {
        let mut instances = self.instances.lock();
        if let Some(instance) = instances.iter_mut().find(|i| i.id == id) {
            instance.status = InstanceStatus::Offline;
        }
        Ok(())
    }

    async fn list(&self) -> Result<Vec<InstanceRecord>, CoordinatorError> {
        Ok(self.instances.lock().clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::kv::{KvStoreConfig, MemoryKv};

    fn coordinator_pair() -> (Arc<InstanceCoordinator>, Arc<InstanceCoordinator>, Arc<ManualClock>) {
        let kv = Arc::new(KvStore::new(
            Arc::new(MemoryKv::new("primary")),
            None,
            KvStoreConfig::default(),
        ));
        let store = Arc::new(MemoryInstanceStore::new());
        let clock = Arc::new(ManualClock::new(1_000_000));

        let a = Arc::new(InstanceCoordinator::new(
            kv.clone(),
            store.clone(),
            clock.clone(),
            CoordinatorConfig::default(),
        ));
        let b = Arc::new(InstanceCoordinator::new(
            kv,
            store,
            clock.clone(),
            CoordinatorConfig::default(),
        ));
        (a, b, clock)
    }

    #[tokio::test]
    async fn only_one_instance_wins_the_lock() {
        let (a, b, _) = coordinator_pair();
        assert!(a.acquire_lock("job", Duration::from_secs(60)).await.unwrap());
        assert!(!b.acquire_lock("job", Duration::from_secs(60)).await.unwrap());
        assert!(a.has_lock("job").await);
        assert!(!b.has_lock("job").await);
    }

    #[tokio::test]
    async fn reacquire_by_owner_renews() {
        let (a, _, _) = coordinator_pair();
        assert!(a.acquire_lock("job", Duration::from_secs(60)).await.unwrap());
        assert!(a.acquire_lock("job", Duration::from_secs(60)).await.unwrap());
    }

    #[tokio::test]
    async fn expired_lock_can_be_stolen() {
        let (a, b, clock) = coordinator_pair();
        assert!(a.acquire_lock("job", Duration::from_secs(60)).await.unwrap());

        clock.advance_secs(61);
        assert!(!a.has_lock("job").await);
        assert!(b.acquire_lock("job", Duration::from_secs(60)).await.unwrap());
        assert!(b.has_lock("job").await);
        assert!(!a.has_lock("job").await);
    }

    #[tokio::test]
    async fn release_only_by_owner() {
        let (a, b, _) = coordinator_pair();
        assert!(a.acquire_lock("job", Duration::from_secs(60)).await.unwrap());

        // Non-owner release is a no-op.
        b.release_lock("job").await.unwrap();
        assert!(a.has_lock("job").await);

        a.release_lock("job").await.unwrap();
        assert!(!a.has_lock("job").await);
        assert!(b.acquire_lock("job", Duration::from_secs(60)).await.unwrap());
    }

    #[tokio::test]
    async fn concurrent_acquires_have_single_winner() {
        let (a, b, _) = coordinator_pair();
        let mut handles = Vec::new();
        for _ in 0..10 {
            let a = a.clone();
            handles.push(tokio::spawn(async move {
                a.acquire_task_lock("t-1").await.unwrap()
            }));
            let b = b.clone();
            handles.push(tokio::spawn(async move {
                b.acquire_task_lock("t-1").await.unwrap()
            }));
        }

        let mut owners = 0;
        for handle in handles {
            if handle.await.unwrap() {
                owners += 1;
            }
        }
        // Renewals by the same instance all succeed; the point is that the
        // two instances never both hold the lock.
        assert!(owners >= 1);
        let a_holds = a.has_task_lock("t-1").await;
        let b_holds = b.has_task_lock("t-1").await;
        assert!(a_holds ^ b_holds, "exactly one instance may hold the task lock");
    }

    #[tokio::test]
    async fn leader_watch_tracks_acquisition() {
        let (a, _, _) = coordinator_pair();
        let watch = a.leader_watch();
        assert!(!*watch.borrow());

        assert!(a
            .acquire_lock(LEADER_LOCK, Duration::from_secs(60))
            .await
            .unwrap());
        assert!(*watch.borrow());

        a.release_lock(LEADER_LOCK).await.unwrap();
        assert!(!*watch.borrow());
    }

    #[tokio::test]
    async fn instance_registration_and_offline() {
        let kv = Arc::new(KvStore::new(
            Arc::new(MemoryKv::new("primary")),
            None,
            KvStoreConfig::default(),
        ));
        let store = Arc::new(MemoryInstanceStore::new());
        let coordinator = Arc::new(InstanceCoordinator::new(
            kv,
            store.clone(),
            Arc::new(ManualClock::new(0)),
            CoordinatorConfig::default(),
        ));

        coordinator.start().await.unwrap();
        let listed = store.list().await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].status, InstanceStatus::Active);

        coordinator.shutdown().await.unwrap();
        let listed = store.list().await.unwrap();
        assert_eq!(listed[0].status, InstanceStatus::Offline);
    }
}
