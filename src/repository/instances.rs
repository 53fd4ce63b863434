//! Instance table store
//!
//! D1 implementation of the coordinator's `InstanceStore` seam. Rows are
//! upserted on registration and refreshed by the 30 second heartbeat.

use super::d1::{col_str, D1Client};
use super::RepositoryError;
use crate::coordinator::{CoordinatorError, InstanceStore};
use crate::models::{InstanceRecord, InstanceStatus};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::{json, Value};

fn row_to_instance(row: &Value) -> Result<InstanceRecord, RepositoryError> {
    let parse_time = |name: &str| -> Result<DateTime<Utc>, RepositoryError> {
        DateTime::parse_from_rfc3339(&col_str(row, name)?)
            .map(|t| t.with_timezone(&Utc))
            .map_err(|e| RepositoryError::Decode(format!("{name}: {e}")))
    };
    let status = match col_str(row, "status")?.as_str() {
        "active" => InstanceStatus::Active,
        _ => InstanceStatus::Offline,
    };

    Ok(InstanceRecord {
        id: col_str(row, "id")?,
        hostname: col_str(row, "hostname")?,
        region: col_str(row, "region")?,
        started_at: parse_time("started_at")?,
        last_heartbeat: parse_time("last_heartbeat")?,
        status,
    })
}

fn store_err(err: RepositoryError) -> CoordinatorError {
    CoordinatorError::Store(err.to_string())
}

/// D1-backed instance store.
pub struct D1InstanceStore {
    d1: D1Client,
}

impl D1InstanceStore {
    pub fn new(d1: D1Client) -> Self {
        Self { d1 }
    }
}

#[async_trait]
impl InstanceStore for D1InstanceStore {
    async fn register(&self, record: &InstanceRecord) -> Result<(), CoordinatorError> {
        self.d1
            .exec(
                "INSERT INTO instances (id, hostname, region, started_at, last_heartbeat, status) \
                 VALUES (?, ?, ?, ?, ?, ?) \
                 ON CONFLICT(id) DO UPDATE SET \
                 hostname = excluded.hostname, region = excluded.region, \
                 last_heartbeat = excluded.last_heartbeat, status = excluded.status",
                &[
                    json!(record.id),
                    json!(record.hostname),
                    json!(record.region),
                    json!(record.started_at.to_rfc3339()),
                    json!(record.last_heartbeat.to_rfc3339()),
                    json!("active"),
                ],
            )
            .await
            .map_err(store_err)
    }

    async fn heartbeat(&self, id: &str, at: DateTime<Utc>) -> Result<(), CoordinatorError> {
        self.d1
            .exec(
                "UPDATE instances SET last_heartbeat = ?, status = 'active' WHERE id = ?",
                &[json!(at.to_rfc3339()), json!(id)],
            )
            .await
            .map_err(store_err)
    }

    async fn mark_offline(&self, id: &str) -> Result<(), CoordinatorError> {
        self.d1
            .exec(
                "UPDATE instances SET status = 'offline' WHERE id = ?",
                &[json!(id)],
            )
            .await
            .map_err(store_err)
    }

    async fn list(&self) -> Result<Vec<InstanceRecord>, CoordinatorError> {
        let rows = self
            .d1
            .query("SELECT * FROM instances ORDER BY started_at ASC", &[])
            .await
            .map_err(store_err)?;
        rows.iter()
            .map(|row| row_to_instance(row).map_err(store_err))
            .collect()
    }
}
