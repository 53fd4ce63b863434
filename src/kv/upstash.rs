//! Upstash Redis over the REST command API
//!
//! Commands are posted as JSON arrays to the REST endpoint; pipelined
//! writes go to `/pipeline`. Used as the backup L2 provider, which enables
//! facade failover.

use super::provider::{
    parse_retry_after, transport_error, KvEntry, KvProvider, ProviderError,
};
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;
use std::time::Duration;

const PROVIDER: &str = "upstash_redis";

#[derive(Debug, Deserialize)]
struct CommandReply {
    #[serde(default)]
    result: Option<serde_json::Value>,
    #[serde(default)]
    error: Option<String>,
}

/// Backup L2 provider.
pub struct UpstashRedis {
    http: reqwest::Client,
    rest_url: String,
    token: String,
}

impl UpstashRedis {
    pub fn new(http: reqwest::Client, rest_url: impl Into<String>, token: impl Into<String>) -> Self {
        let rest_url = rest_url.into();
        Self {
            http,
            rest_url: rest_url.trim_end_matches('/').to_string(),
            token: token.into(),
        }
    }

    async fn command(&self, command: serde_json::Value) -> Result<serde_json::Value, ProviderError> {
        let response = self
            .http
            .post(&self.rest_url)
            .bearer_auth(&self.token)
            .timeout(Duration::from_secs(5))
            .json(&command)
            .send()
            .await
            .map_err(|e| transport_error(PROVIDER, e))?;

        let status = response.status();
        let retry_after = parse_retry_after(response.headers());
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(classify_status(status.as_u16(), body, retry_after));
        }

        let reply: CommandReply = response
            .json()
            .await
            .map_err(|e| transport_error(PROVIDER, e))?;
        if let Some(error) = reply.error {
            return Err(classify_reply_error(error));
        }
        Ok(reply.result.unwrap_or(serde_json::Value::Null))
    }
}

fn classify_status(status: u16, body: String, retry_after: Option<Duration>) -> ProviderError {
    let lowered = body.to_lowercase();
    if status == 429 || lowered.contains("max requests") || lowered.contains("quota") {
        ProviderError::quota(PROVIDER, format!("{status}: {body}")).with_retry_after(retry_after)
    } else if status >= 500 {
        ProviderError::transport(PROVIDER, format!("{status}: {body}"))
    } else {
        ProviderError::validation(PROVIDER, format!("{status}: {body}"))
    }
}

fn classify_reply_error(error: String) -> ProviderError {
    let lowered = error.to_lowercase();
    if lowered.contains("max requests") || lowered.contains("quota") {
        ProviderError::quota(PROVIDER, error)
    } else {
        ProviderError::validation(PROVIDER, error)
    }
}

#[async_trait]
impl KvProvider for UpstashRedis {
    fn name(&self) -> &'static str {
        PROVIDER
    }

    async fn get(&self, key: &str) -> Result<Option<String>, ProviderError> {
        let result = self.command(json!(["GET", key])).await?;
        match result {
            serde_json::Value::Null => Ok(None),
            serde_json::Value::String(value) => Ok(Some(value)),
            other => Ok(Some(other.to_string())),
        }
    }

    async fn set(
        &self,
        key: &str,
        value: &str,
        ttl: Option<Duration>,
    ) -> Result<(), ProviderError> {
        let command = match ttl {
            Some(ttl) => json!(["SET", key, value, "EX", ttl.as_secs().max(1).to_string()]),
            None => json!(["SET", key, value]),
        };
        self.command(command).await?;
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), ProviderError> {
        self.command(json!(["DEL", key])).await?;
        Ok(())
    }

    async fn list_keys(&self, prefix: Option<&str>) -> Result<Vec<String>, ProviderError> {
        let pattern = match prefix {
            Some(prefix) => format!("{prefix}*"),
            None => "*".to_string(),
        };

        let mut keys = Vec::new();
        let mut cursor = "0".to_string();

        loop {
            let result = self
                .command(json!(["SCAN", cursor, "MATCH", pattern, "COUNT", "1000"]))
                .await?;

            let page = result
                .as_array()
                .ok_or_else(|| ProviderError::validation(PROVIDER, "malformed SCAN reply"))?;
            cursor = page
                .first()
                .and_then(|c| c.as_str())
                .unwrap_or("0")
                .to_string();
            if let Some(batch) = page.get(1).and_then(|b| b.as_array()) {
                keys.extend(
                    batch
                        .iter()
                        .filter_map(|k| k.as_str().map(|s| s.to_string())),
                );
            }

            if cursor == "0" {
                return Ok(keys);
            }
        }
    }

    async fn bulk_set(&self, entries: &[KvEntry]) -> Result<(), ProviderError> {
        if entries.is_empty() {
            return Ok(());
        }

        let pipeline: Vec<serde_json::Value> = entries
            .iter()
            .map(|entry| match entry.ttl {
                Some(ttl) => json!([
                    "SET",
                    entry.key,
                    entry.value,
                    "EX",
                    ttl.as_secs().max(1).to_string()
                ]),
                None => json!(["SET", entry.key, entry.value]),
            })
            .collect();

        let response = self
            .http
            .post(format!("{}/pipeline", self.rest_url))
            .bearer_auth(&self.token)
            .timeout(Duration::from_secs(10))
            .json(&pipeline)
            .send()
            .await
            .map_err(|e| transport_error(PROVIDER, e))?;

        let status = response.status();
        let retry_after = parse_retry_after(response.headers());
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(classify_status(status.as_u16(), body, retry_after));
        }

        let replies: Vec<CommandReply> = response
            .json()
            .await
            .map_err(|e| transport_error(PROVIDER, e))?;
        if let Some(error) = replies.into_iter().find_map(|r| r.error) {
            return Err(classify_reply_error(error));
        }
        Ok(())
    }
}
