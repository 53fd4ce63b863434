//! Global access guard
//!
//! The owner always passes. Everyone else is admitted while the
//! `access_mode` setting is `public`; in `private` mode non-owners are
//! blocked (callbacks get an acknowledgement so the button stops
//! spinning).

use crate::repository::settings::ACCESS_MODE_KEY;
use crate::repository::SettingsRepository;
use std::sync::Arc;

/// Access decision input.
pub struct AuthGuard {
    owner_id: Option<i64>,
    settings: Arc<SettingsRepository>,
    /// Mode used when the setting row is absent (env-driven)
    fallback_mode: String,
}

impl AuthGuard {
    pub fn new(
        owner_id: Option<i64>,
        settings: Arc<SettingsRepository>,
        fallback_mode: impl Into<String>,
    ) -> Self {
        Self {
            owner_id,
            settings,
            fallback_mode: fallback_mode.into(),
        }
    }

    pub fn is_owner(&self, user_id: i64) -> bool {
        self.owner_id == Some(user_id)
    }

    /// Whether the user may interact at all.
    pub async fn allow(&self, user_id: i64) -> bool {
        if self.is_owner(user_id) {
            return true;
        }

        let mode = match self.settings.get(ACCESS_MODE_KEY).await {
            Ok(Some(mode)) => mode,
            Ok(None) => self.fallback_mode.clone(),
            Err(err) => {
                // Fail closed only in private fallback; a settings outage
                // must not lock a public bot.
                tracing::warn!(error = %err, "access mode read failed; using fallback");
                self.fallback_mode.clone()
            }
        };

        mode != "private"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kv::{KvStore, KvStoreConfig, MemoryKv};
    use crate::repository::settings::MemorySettingStore;
    use crate::repository::SettingStore;

    fn guard_with(owner: Option<i64>, fallback: &str) -> (Arc<MemorySettingStore>, AuthGuard) {
        let kv = Arc::new(KvStore::new(
            Arc::new(MemoryKv::new("primary")),
            None,
            KvStoreConfig::default(),
        ));
        let store = Arc::new(MemorySettingStore::new());
        let settings = Arc::new(SettingsRepository::new(kv, store.clone()));
        (store, AuthGuard::new(owner, settings, fallback))
    }

    #[tokio::test]
    async fn owner_always_allowed() {
        let (store, guard) = guard_with(Some(1), "public");
        store.set(ACCESS_MODE_KEY, "private").await.unwrap();
        assert!(guard.allow(1).await);
        assert!(!guard.allow(2).await);
    }

    #[tokio::test]
    async fn public_mode_admits_everyone() {
        let (store, guard) = guard_with(Some(1), "private");
        store.set(ACCESS_MODE_KEY, "public").await.unwrap();
        assert!(guard.allow(99).await);
    }

    #[tokio::test]
    async fn fallback_applies_without_setting_row() {
        let (_, guard) = guard_with(Some(1), "private");
        assert!(!guard.allow(99).await);

        let (_, guard) = guard_with(Some(1), "public");
        assert!(guard.allow(99).await);
    }
}
