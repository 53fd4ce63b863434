//! Drive bindings
//!
//! One row per bound drive. At most one default per user; `set_default`
//! clears the previous default in the same statement batch.

use super::d1::{col_bool, col_i64, col_str, D1Client};
use super::RepositoryError;
use crate::models::{Drive, DriveType};
use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::str::FromStr;

/// Durable drive table.
#[async_trait]
pub trait DriveStore: Send + Sync {
    async fn create(&self, drive: &Drive) -> Result<(), RepositoryError>;

    async fn find_by_id(&self, id: &str) -> Result<Option<Drive>, RepositoryError>;

    async fn list_by_user(&self, user_id: i64) -> Result<Vec<Drive>, RepositoryError>;

    /// Default drive, falling back to the user's only drive.
    async fn find_default(&self, user_id: i64) -> Result<Option<Drive>, RepositoryError>;

    async fn set_default(&self, user_id: i64, drive_id: &str) -> Result<(), RepositoryError>;

    async fn delete(&self, user_id: i64, drive_id: &str) -> Result<(), RepositoryError>;

    /// Remove every binding for the user (`/unbind`).
    async fn delete_all(&self, user_id: i64) -> Result<u32, RepositoryError>;
}

fn row_to_drive(row: &Value) -> Result<Drive, RepositoryError> {
    let drive_type =
        DriveType::from_str(&col_str(row, "type")?).map_err(RepositoryError::Decode)?;
    let credentials: Value = serde_json::from_str(&col_str(row, "credentials")?)
        .map_err(|e| RepositoryError::Decode(format!("credentials: {e}")))?;

    Ok(Drive {
        id: col_str(row, "id")?,
        user_id: col_i64(row, "user_id")?,
        name: col_str(row, "name")?,
        drive_type,
        credentials,
        is_default: col_bool(row, "is_default"),
    })
}

/// D1-backed drive store.
pub struct D1DriveStore {
    d1: D1Client,
}

impl D1DriveStore {
    pub fn new(d1: D1Client) -> Self {
        Self { d1 }
    }
}

#[async_trait]
impl DriveStore for D1DriveStore {
    async fn create(&self, drive: &Drive) -> Result<(), RepositoryError> {
        if drive.is_default {
            self.d1
                .exec(
                    "UPDATE drives SET is_default = 0 WHERE user_id = ?",
                    &[json!(drive.user_id)],
                )
                .await?;
        }
        self.d1
            .exec(
                "INSERT INTO drives (id, user_id, name, type, credentials, is_default) \
                 VALUES (?, ?, ?, ?, ?, ?)",
                &[
                    json!(drive.id),
                    json!(drive.user_id),
                    json!(drive.name),
                    json!(drive.drive_type.as_str()),
                    json!(drive.credentials.to_string()),
                    json!(drive.is_default as i64),
                ],
            )
            .await
    }

    async fn find_by_id(&self, id: &str) -> Result<Option<Drive>, RepositoryError> {
        let rows = self
            .d1
            .query("SELECT * FROM drives WHERE id = ? LIMIT 1", &[json!(id)])
            .await?;
        rows.first().map(row_to_drive).transpose()
    }

    async fn list_by_user(&self, user_id: i64) -> Result<Vec<Drive>, RepositoryError> {
        let rows = self
            .d1
            .query(
                "SELECT * FROM drives WHERE user_id = ? ORDER BY name ASC",
                &[json!(user_id)],
            )
            .await?;
        rows.iter().map(row_to_drive).collect()
    }

    async fn find_default(&self, user_id: i64) -> Result<Option<Drive>, RepositoryError> {
        let rows = self
            .d1
            .query(
                "SELECT * FROM drives WHERE user_id = ? ORDER BY is_default DESC LIMIT 1",
                &[json!(user_id)],
            )
            .await?;
        rows.first().map(row_to_drive).transpose()
    }

    async fn set_default(&self, user_id: i64, drive_id: &str) -> Result<(), RepositoryError> {
        self.d1
            .exec(
                "UPDATE drives SET is_default = 0 WHERE user_id = ?",
                &[json!(user_id)],
            )
            .await?;
        self.d1
            .exec(
                "UPDATE drives SET is_default = 1 WHERE user_id = ? AND id = ?",
                &[json!(user_id), json!(drive_id)],
            )
            .await
    }

    async fn delete(&self, user_id: i64, drive_id: &str) -> Result<(), RepositoryError> {
        self.d1
            .exec(
                "DELETE FROM drives WHERE user_id = ? AND id = ?",
                &[json!(user_id), json!(drive_id)],
            )
            .await
    }

    async fn delete_all(&self, user_id: i64) -> Result<u32, RepositoryError> {
        let rows = self
            .d1
            .query(
                "DELETE FROM drives WHERE user_id = ? RETURNING id",
                &[json!(user_id)],
            )
            .await?;
        Ok(rows.len() as u32)
    }
}

/// In-memory drive store.
#[derive(Default)]
pub struct MemoryDriveStore {
    drives: Mutex<HashMap<String, Drive>>,
}

impl MemoryDriveStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl DriveStore for MemoryDriveStore {
    async fn create(&self, drive: &Drive) -> Result<(), RepositoryError> {
        let mut drives = self.drives.lock();
        if drive.is_default {
            for existing in drives.values_mut() {
                if existing.user_id == drive.user_id {
                    existing.is_default = false;
                }
            }
        }
        drives.insert(drive.id.clone(), drive.clone());
        Ok(())
    }

    async fn find_by_id(&self, id: &str) -> Result<Option<Drive>, RepositoryError> {
        Ok(self.drives.lock().get(id).cloned())
    }

    async fn list_by_user(&self, user_id: i64) -> Result<Vec<Drive>, RepositoryError> {
        let mut drives: Vec<Drive> = self
            .drives
            .lock()
            .values()
            .filter(|d| d.user_id == user_id)
            .cloned()
            .collect();
        drives.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(drives)
    }

    async fn find_default(&self, user_id: i64) -> Result<Option<Drive>, RepositoryError> {
        let drives = self.list_by_user(user_id).await?;
        Ok(drives
            .iter()
            .find(|d| d.is_default)
            .or_else(|| drives.first())
            .cloned())
    }

    async fn set_default(&self, user_id: i64, drive_id: &str) -> Result<(), RepositoryError> {
        let mut drives = self.drives.lock();
        for drive in drives.values_mut() {
            if drive.user_id == user_id {
                drive.is_default = drive.id == drive_id;
            }
        }
        Ok(())
    }

    async fn delete(&self, user_id: i64, drive_id: &str) -> Result<(), RepositoryError> {
        self.drives
            .lock()
            .retain(|_, d| !(d.user_id == user_id && d.id == drive_id));
        Ok(())
    }

    async fn delete_all(&self, user_id: i64) -> Result<u32, RepositoryError> {
        let mut drives = self.drives.lock();
        let before = drives.len();
        drives.retain(|_, d| d.user_id != user_id);
        Ok((before - drives.len()) as u32)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn drive(user_id: i64, name: &str, is_default: bool) -> Drive {
        Drive {
            id: uuid::Uuid::new_v4().to_string(),
            user_id,
            name: name.to_string(),
            drive_type: DriveType::WebDav,
            credentials: json!({"url": "https://dav.example.com"}),
            is_default,
        }
    }

    #[tokio::test]
    async fn at_most_one_default_per_user() {
        let store = MemoryDriveStore::new();
        let a = drive(7, "alpha", true);
        let b = drive(7, "beta", true);
        store.create(&a).await.unwrap();
        store.create(&b).await.unwrap();

        let drives = store.list_by_user(7).await.unwrap();
        let defaults: Vec<_> = drives.iter().filter(|d| d.is_default).collect();
        assert_eq!(defaults.len(), 1);
        assert_eq!(defaults[0].name, "beta");
    }

    #[tokio::test]
    async fn find_default_falls_back_to_only_drive() {
        let store = MemoryDriveStore::new();
        let a = drive(7, "alpha", false);
        store.create(&a).await.unwrap();

        let found = store.find_default(7).await.unwrap().unwrap();
        assert_eq!(found.id, a.id);
    }

    #[tokio::test]
    async fn unbind_removes_everything() {
        let store = MemoryDriveStore::new();
        store.create(&drive(7, "alpha", true)).await.unwrap();
        store.create(&drive(7, "beta", false)).await.unwrap();
        store.create(&drive(8, "other", true)).await.unwrap();

        assert_eq!(store.delete_all(7).await.unwrap(), 2);
        assert!(store.list_by_user(7).await.unwrap().is_empty());
        assert_eq!(store.list_by_user(8).await.unwrap().len(), 1);
    }
}
