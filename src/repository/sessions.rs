//! Conversational sessions
//!
//! Per-user state for the drive config flow, stored in KV under
//! `session:<userId>` with an idle TTL. Each write refreshes the TTL.

use super::RepositoryError;
use crate::kv::{GetOptions, KvStore, SetOptions};
use crate::models::Session;
use std::sync::Arc;
use std::time::Duration;

fn session_key(user_id: i64) -> String {
    format!("session:{user_id}")
}

/// KV-backed session store.
pub struct SessionStore {
    kv: Arc<KvStore>,
    idle_ttl: Duration,
}

impl SessionStore {
    pub fn new(kv: Arc<KvStore>) -> Self {
        Self {
            kv,
            idle_ttl: Duration::from_secs(30 * 60),
        }
    }

    pub fn with_idle_ttl(mut self, idle_ttl: Duration) -> Self {
        self.idle_ttl = idle_ttl;
        self
    }

    pub async fn get(&self, user_id: i64) -> Result<Option<Session>, RepositoryError> {
        Ok(self
            .kv
            .get_json(&session_key(user_id), GetOptions::default())
            .await?)
    }

    pub async fn put(&self, user_id: i64, mut session: Session) -> Result<(), RepositoryError> {
        session.touch();
        self.kv
            .set_json(
                &session_key(user_id),
                &session,
                Some(self.idle_ttl),
                SetOptions::default(),
            )
            .await?;
        Ok(())
    }

    pub async fn clear(&self, user_id: i64) -> Result<(), RepositoryError> {
        self.kv.delete(&session_key(user_id)).await?;
        Ok(())
    }
}
