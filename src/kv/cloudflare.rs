//! Cloudflare Workers KV over the REST namespace API

use super::provider::{
    parse_retry_after, transport_error, KvEntry, KvProvider, ProviderError,
};
use async_trait::async_trait;
use serde::Deserialize;
use std::time::Duration;

const PROVIDER: &str = "cloudflare_kv";
const DEFAULT_API_BASE: &str = "https://api.cloudflare.com/client/v4";

/// Cloudflare KV quota error codes (daily/plan limits).
const QUOTA_CODES: &[i64] = &[10016, 10043];

#[derive(Debug, Deserialize)]
struct ApiEnvelope {
    #[serde(default)]
    success: bool,
    #[serde(default)]
    errors: Vec<ApiError>,
    #[serde(default)]
    result_info: Option<ResultInfo>,
    #[serde(default)]
    result: Option<serde_json::Value>,
}

#[derive(Debug, Deserialize)]
struct ApiError {
    #[serde(default)]
    code: i64,
    #[serde(default)]
    message: String,
}

#[derive(Debug, Deserialize)]
struct ResultInfo {
    #[serde(default)]
    cursor: Option<String>,
}

#[derive(Debug, Deserialize)]
struct KeyEntry {
    name: String,
}

/// Primary L2 provider.
pub struct CloudflareKv {
    http: reqwest::Client,
    api_base: String,
    account_id: String,
    namespace_id: String,
    token: String,
}

impl CloudflareKv {
    pub fn new(
        http: reqwest::Client,
        account_id: impl Into<String>,
        namespace_id: impl Into<String>,
        token: impl Into<String>,
    ) -> Self {
        Self {
            http,
            api_base: DEFAULT_API_BASE.to_string(),
            account_id: account_id.into(),
            namespace_id: namespace_id.into(),
            token: token.into(),
        }
    }

    /// Point the client at a different API host (test servers).
    pub fn with_api_base(mut self, base: impl Into<String>) -> Self {
        self.api_base = base.into();
        self
    }

    fn namespace_url(&self, suffix: &str) -> String {
        format!(
            "{}/accounts/{}/storage/kv/namespaces/{}{}",
            self.api_base, self.account_id, self.namespace_id, suffix
        )
    }

    fn value_url(&self, key: &str) -> String {
        self.namespace_url(&format!("/values/{}", urlencoding::encode(key)))
    }

    /// Classify a non-2xx response body.
    async fn classify_failure(&self, response: reqwest::Response) -> ProviderError {
        let status = response.status();
        let retry_after = parse_retry_after(response.headers());
        let body = response.text().await.unwrap_or_default();

        let quota_by_code = serde_json::from_str::<ApiEnvelope>(&body)
            .map(|env| env.errors.iter().any(|e| QUOTA_CODES.contains(&e.code)))
            .unwrap_or(false);
        let lowered = body.to_lowercase();
        let quota_by_text = lowered.contains("quota") || lowered.contains("limit exceeded");

        if status.as_u16() == 429 || quota_by_code || quota_by_text {
            ProviderError::quota(PROVIDER, format!("{status}: {body}"))
                .with_retry_after(retry_after)
        } else if status.is_server_error() {
            ProviderError::transport(PROVIDER, format!("{status}: {body}"))
        } else {
            ProviderError::validation(PROVIDER, format!("{status}: {body}"))
        }
    }
}

#[async_trait]
impl KvProvider for CloudflareKv {
    fn name(&self) -> &'static str {
        PROVIDER
    }

    async fn get(&self, key: &str) -> Result<Option<String>, ProviderError> {
        let response = self
            .http
            .get(self.value_url(key))
            .bearer_auth(&self.token)
            .timeout(Duration::from_secs(5))
            .send()
            .await
            .map_err(|e| transport_error(PROVIDER, e))?;

        if response.status().as_u16() == 404 {
            return Ok(None);
        }
        if !response.status().is_success() {
            return Err(self.classify_failure(response).await);
        }

        let body = response
            .text()
            .await
            .map_err(|e| transport_error(PROVIDER, e))?;
        Ok(Some(body))
    }

    async fn set(
        &self,
        key: &str,
        value: &str,
        ttl: Option<Duration>,
    ) -> Result<(), ProviderError> {
        let mut url = self.value_url(key);
        if let Some(ttl) = ttl {
            // Cloudflare enforces a 60 second minimum TTL.
            let secs = ttl.as_secs().max(60);
            url = format!("{url}?expiration_ttl={secs}");
        }

        let response = self
            .http
            .put(url)
            .bearer_auth(&self.token)
            .timeout(Duration::from_secs(5))
            .body(value.to_string())
            .send()
            .await
            .map_err(|e| transport_error(PROVIDER, e))?;

        if !response.status().is_success() {
            return Err(self.classify_failure(response).await);
        }
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), ProviderError> {
        let response = self
            .http
            .delete(self.value_url(key))
            .bearer_auth(&self.token)
            .timeout(Duration::from_secs(5))
            .send()
            .await
            .map_err(|e| transport_error(PROVIDER, e))?;

        // Deleting a missing key is a no-op.
        if response.status().as_u16() == 404 || response.status().is_success() {
            return Ok(());
        }
        Err(self.classify_failure(response).await)
    }

    async fn list_keys(&self, prefix: Option<&str>) -> Result<Vec<String>, ProviderError> {
        let mut keys = Vec::new();
        let mut cursor: Option<String> = None;

        loop {
            let mut url = self.namespace_url("/keys?limit=1000");
            if let Some(prefix) = prefix {
                url.push_str(&format!("&prefix={}", urlencoding::encode(prefix)));
            }
            if let Some(cursor) = &cursor {
                url.push_str(&format!("&cursor={}", urlencoding::encode(cursor)));
            }

            let response = self
                .http
                .get(url)
                .bearer_auth(&self.token)
                .timeout(Duration::from_secs(5))
                .send()
                .await
                .map_err(|e| transport_error(PROVIDER, e))?;

            if !response.status().is_success() {
                return Err(self.classify_failure(response).await);
            }

            let envelope: ApiEnvelope = response
                .json()
                .await
                .map_err(|e| transport_error(PROVIDER, e))?;
            if !envelope.success {
                let message = envelope
                    .errors
                    .first()
                    .map(|e| e.message.clone())
                    .unwrap_or_else(|| "list keys failed".to_string());
                return Err(ProviderError::validation(PROVIDER, message));
            }

            if let Some(result) = envelope.result {
                let page: Vec<KeyEntry> = serde_json::from_value(result)
                    .map_err(|e| ProviderError::validation(PROVIDER, e.to_string()))?;
                keys.extend(page.into_iter().map(|k| k.name));
            }

            cursor = envelope
                .result_info
                .and_then(|info| info.cursor)
                .filter(|c| !c.is_empty());
            if cursor.is_none() {
                return Ok(keys);
            }
        }
    }

    async fn bulk_set(&self, entries: &[KvEntry]) -> Result<(), ProviderError> {
        let payload: Vec<serde_json::Value> = entries
            .iter()
            .map(|entry| {
                let mut item = serde_json::json!({
                    "key": entry.key,
                    "value": entry.value,
                });
                if let Some(ttl) = entry.ttl {
                    item["expiration_ttl"] = serde_json::json!(ttl.as_secs().max(60));
                }
                item
            })
            .collect();

        let response = self
            .http
            .put(self.namespace_url("/bulk"))
            .bearer_auth(&self.token)
            .timeout(Duration::from_secs(10))
            .json(&payload)
            .send()
            .await
            .map_err(|e| transport_error(PROVIDER, e))?;

        if !response.status().is_success() {
            return Err(self.classify_failure(response).await);
        }
        Ok(())
    }
}
