//! Durable persistence
//!
//! The durable store is Cloudflare D1 behind its REST query API; every
//! table gets a store trait so the rest of the system never sees SQL, and
//! in-memory implementations back the tests.
//!
//! - `tasks`: task rows plus the write-coalescing status buffer
//! - `drives`: per-user drive bindings
//! - `settings`: strongly consistent settings with the L1 -> L2 -> durable
//!   read path
//! - `sessions`: KV-backed conversational state
//! - `instances`: the instance table used by the coordinator

pub mod d1;
pub mod drives;
pub mod instances;
pub mod sessions;
pub mod settings;
pub mod tasks;

pub use d1::D1Client;
pub use drives::{DriveStore, MemoryDriveStore};
pub use sessions::SessionStore;
pub use settings::{SettingStore, SettingsRepository};
pub use tasks::{MemoryTaskStore, StatusUpdate, TaskRepository, TaskStore};

use crate::kv::CacheError;
use crate::limits::RetryableError;
use thiserror::Error;

/// Persistence errors.
#[derive(Error, Debug)]
pub enum RepositoryError {
    /// The database rejected the statement
    #[error("database error: {0}")]
    Database(String),

    /// The database was unreachable (transport-class, retryable)
    #[error("database unreachable: {0}")]
    Http(String),

    #[error("row decode error: {0}")]
    Decode(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error(transparent)]
    Cache(#[from] CacheError),
}

impl RetryableError for RepositoryError {
    fn is_retryable(&self) -> bool {
        match self {
            RepositoryError::Http(_) => true,
            RepositoryError::Cache(err) => err.is_retryable(),
            _ => false,
        }
    }
}
