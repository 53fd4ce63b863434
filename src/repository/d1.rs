//! Cloudflare D1 REST client
//!
//! Minimal parameterized-query surface over the `/query` endpoint. Rows
//! come back as JSON objects keyed by column name; the per-table stores do
//! the mapping.

use super::RepositoryError;
use crate::config::D1Config;
use serde::Deserialize;
use serde_json::Value;
use std::time::Duration;

const DEFAULT_API_BASE: &str = "https://api.cloudflare.com/client/v4";

#[derive(Debug, Deserialize)]
struct QueryEnvelope {
    #[serde(default)]
    success: bool,
    #[serde(default)]
    errors: Vec<ApiError>,
    #[serde(default)]
    result: Vec<QueryResult>,
}

#[derive(Debug, Deserialize)]
struct ApiError {
    #[serde(default)]
    message: String,
}

#[derive(Debug, Deserialize)]
struct QueryResult {
    #[serde(default)]
    results: Vec<Value>,
}

/// Shared D1 connection handle.
#[derive(Clone)]
pub struct D1Client {
    http: reqwest::Client,
    api_base: String,
    config: D1Config,
}

impl D1Client {
    pub fn new(http: reqwest::Client, config: D1Config) -> Self {
        Self {
            http,
            api_base: DEFAULT_API_BASE.to_string(),
            config,
        }
    }

    /// Point the client at a different API host (test servers).
    pub fn with_api_base(mut self, base: impl Into<String>) -> Self {
        self.api_base = base.into();
        self
    }

    fn query_url(&self) -> String {
        format!(
            "{}/accounts/{}/d1/database/{}/query",
            self.api_base, self.config.account_id, self.config.database_id
        )
    }

    /// Run one parameterized statement and return its rows.
    pub async fn query(&self, sql: &str, params: &[Value]) -> Result<Vec<Value>, RepositoryError> {
        let response = self
            .http
            .post(self.query_url())
            .bearer_auth(&self.config.token)
            .timeout(Duration::from_secs(10))
            .json(&serde_json::json!({ "sql": sql, "params": params }))
            .send()
            .await
            .map_err(|e| RepositoryError::Http(e.to_string()))?;

        let status = response.status();
        if status.is_server_error() {
            return Err(RepositoryError::Http(format!("d1 returned {status}")));
        }

        let envelope: QueryEnvelope = response
            .json()
            .await
            .map_err(|e| RepositoryError::Http(e.to_string()))?;

        if !envelope.success {
            let message = envelope
                .errors
                .first()
                .map(|e| e.message.clone())
                .unwrap_or_else(|| format!("d1 query failed with {status}"));
            return Err(RepositoryError::Database(message));
        }

        Ok(envelope
            .result
            .into_iter()
            .next()
            .map(|r| r.results)
            .unwrap_or_default())
    }

    /// Run a statement, discarding rows.
    pub async fn exec(&self, sql: &str, params: &[Value]) -> Result<(), RepositoryError> {
        self.query(sql, params).await.map(|_| ())
    }

    /// Create the tables on first boot. Statements are idempotent.
    pub async fn ensure_schema(&self) -> Result<(), RepositoryError> {
        for statement in SCHEMA {
            self.exec(statement, &[]).await?;
        }
        Ok(())
    }
}

const SCHEMA: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS tasks (
        id TEXT PRIMARY KEY,
        user_id INTEGER NOT NULL,
        chat_id INTEGER NOT NULL,
        msg_id INTEGER NOT NULL,
        source_msg_id INTEGER NOT NULL,
        file_name TEXT NOT NULL,
        file_size INTEGER NOT NULL,
        status TEXT NOT NULL,
        error_msg TEXT,
        group_id TEXT,
        local_path TEXT,
        created_at TEXT NOT NULL,
        updated_at TEXT NOT NULL
    )",
    "CREATE INDEX IF NOT EXISTS idx_tasks_user ON tasks (user_id, created_at)",
    "CREATE INDEX IF NOT EXISTS idx_tasks_dedup ON tasks (user_id, file_name, file_size, status)",
    "CREATE TABLE IF NOT EXISTS drives (
        id TEXT PRIMARY KEY,
        user_id INTEGER NOT NULL,
        name TEXT NOT NULL,
        type TEXT NOT NULL,
        credentials TEXT NOT NULL,
        is_default INTEGER NOT NULL DEFAULT 0
    )",
    "CREATE INDEX IF NOT EXISTS idx_drives_user ON drives (user_id)",
    "CREATE TABLE IF NOT EXISTS settings (
        key TEXT PRIMARY KEY,
        value TEXT NOT NULL
    )",
    "CREATE TABLE IF NOT EXISTS instances (
        id TEXT PRIMARY KEY,
        hostname TEXT NOT NULL,
        region TEXT NOT NULL,
        started_at TEXT NOT NULL,
        last_heartbeat TEXT NOT NULL,
        status TEXT NOT NULL
    )",
];

/// Column accessors tolerant of D1's mixed number/string typing.
pub(crate) fn col_str(row: &Value, name: &str) -> Result<String, RepositoryError> {
    match row.get(name) {
        Some(Value::String(s)) => Ok(s.clone()),
        Some(Value::Number(n)) => Ok(n.to_string()),
        _ => Err(RepositoryError::Decode(format!("missing column {name}"))),
    }
}

pub(crate) fn col_opt_str(row: &Value, name: &str) -> Option<String> {
    match row.get(name) {
        Some(Value::String(s)) if !s.is_empty() => Some(s.clone()),
        _ => None,
    }
}

pub(crate) fn col_i64(row: &Value, name: &str) -> Result<i64, RepositoryError> {
    match row.get(name) {
        Some(Value::Number(n)) => n
            .as_i64()
            .ok_or_else(|| RepositoryError::Decode(format!("non-integer column {name}"))),
        Some(Value::String(s)) => s
            .parse()
            .map_err(|_| RepositoryError::Decode(format!("non-integer column {name}"))),
        _ => Err(RepositoryError::Decode(format!("missing column {name}"))),
    }
}

pub(crate) fn col_u64(row: &Value, name: &str) -> Result<u64, RepositoryError> {
    col_i64(row, name).map(|v| v.max(0) as u64)
}

pub(crate) fn col_bool(row: &Value, name: &str) -> bool {
    match row.get(name) {
        Some(Value::Bool(b)) => *b,
        Some(Value::Number(n)) => n.as_i64().unwrap_or(0) != 0,
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn column_accessors_handle_d1_typing() {
        let row = json!({
            "id": "t-1",
            "user_id": 42,
            "file_size": "1024",
            "is_default": 1,
            "error_msg": "",
        });

        assert_eq!(col_str(&row, "id").unwrap(), "t-1");
        assert_eq!(col_i64(&row, "user_id").unwrap(), 42);
        assert_eq!(col_u64(&row, "file_size").unwrap(), 1024);
        assert!(col_bool(&row, "is_default"));
        assert_eq!(col_opt_str(&row, "error_msg"), None);
        assert!(col_str(&row, "missing").is_err());
    }
}
