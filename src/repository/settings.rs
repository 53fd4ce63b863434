//! Settings
//!
//! Strongly consistent key/value settings. Reads go L1 -> L2 (through the
//! KV facade under `setting:<name>`) and fall through to the durable store,
//! backfilling the cache on the way out. Writes land in the durable store
//! first, then refresh the cache.

use super::d1::{col_str, D1Client};
use super::RepositoryError;
use crate::kv::{GetOptions, KvStore, SetOptions};
use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

/// Name of the access-mode setting consulted by the global guard.
pub const ACCESS_MODE_KEY: &str = "access_mode";

fn setting_key(name: &str) -> String {
    format!("setting:{name}")
}

/// Durable setting table.
#[async_trait]
pub trait SettingStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>, RepositoryError>;
    async fn set(&self, key: &str, value: &str) -> Result<(), RepositoryError>;
}

/// D1-backed setting store.
pub struct D1SettingStore {
    d1: D1Client,
}

impl D1SettingStore {
    pub fn new(d1: D1Client) -> Self {
        Self { d1 }
    }
}

#[async_trait]
impl SettingStore for D1SettingStore {
    async fn get(&self, key: &str) -> Result<Option<String>, RepositoryError> {
        let rows = self
            .d1
            .query(
                "SELECT value FROM settings WHERE key = ? LIMIT 1",
                &[json!(key)],
            )
            .await?;
        rows.first().map(|row| col_str(row, "value")).transpose()
    }

    async fn set(&self, key: &str, value: &str) -> Result<(), RepositoryError> {
        self.d1
            .exec(
                "INSERT INTO settings (key, value) VALUES (?, ?) \
                 ON CONFLICT(key) DO UPDATE SET value = excluded.value",
                &[json!(key), json!(value)],
            )
            .await
    }
}

/// In-memory setting store.
#[derive(Default)]
pub struct MemorySettingStore {
    settings: Mutex<HashMap<String, String>>,
}

impl MemorySettingStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SettingStore for MemorySettingStore {
    async fn get(&self, key: &str) -> Result<Option<String>, RepositoryError> {
        Ok(self.settings.lock().get(key).cloned())
    }

    async fn set(&self, key: &str, value: &str) -> Result<(), RepositoryError> {
        self.settings.lock().insert(key.to_string(), value.to_string());
        Ok(())
    }
}

/// Cached settings repository.
pub struct SettingsRepository {
    kv: Arc<KvStore>,
    store: Arc<dyn SettingStore>,
    cache_ttl: Duration,
}

impl SettingsRepository {
    pub fn new(kv: Arc<KvStore>, store: Arc<dyn SettingStore>) -> Self {
        Self {
            kv,
            store,
            cache_ttl: Duration::from_secs(5 * 60),
        }
    }

    pub async fn get(&self, name: &str) -> Result<Option<String>, RepositoryError> {
        let key = setting_key(name);

        match self.kv.get(&key, GetOptions::default()).await {
            Ok(Some(value)) => return Ok(Some(value)),
            Ok(None) => {}
            // A cache outage must not take settings reads down.
            Err(err) => tracing::warn!(setting = name, error = %err, "setting cache read failed"),
        }

        let value = self.store.get(name).await?;
        if let Some(value) = &value {
            if let Err(err) = self
                .kv
                .set(&key, value, Some(self.cache_ttl), SetOptions::default())
                .await
            {
                tracing::debug!(setting = name, error = %err, "setting cache backfill failed");
            }
        }
        Ok(value)
    }

    pub async fn set(&self, name: &str, value: &str) -> Result<(), RepositoryError> {
        self.store.set(name, value).await?;
        if let Err(err) = self
            .kv
            .set(
                &setting_key(name),
                value,
                Some(self.cache_ttl),
                SetOptions::default(),
            )
            .await
        {
            tracing::warn!(setting = name, error = %err, "setting cache refresh failed");
        }
        Ok(())
    }
}
