//! Remote KV provider seam
//!
//! Both L2 backends (Cloudflare KV, Upstash Redis REST) implement this
//! trait; the facade only ever talks to `dyn KvProvider`. Error classes
//! drive the failover state machine, so classification lives here with the
//! providers rather than in the facade.

use crate::limits::RetryableError;
use async_trait::async_trait;
use std::time::Duration;

/// Error classes a provider can report. Only `Quota` and `Transport` count
/// toward failover; `Validation` surfaces to the caller unchanged.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProviderErrorKind {
    /// 429 / plan limit exceeded
    Quota,
    /// Timeout, connect failure, 5xx
    Transport,
    /// Malformed request, auth failure, 4xx non-quota
    Validation,
}

/// Error from a remote KV backend.
#[derive(Debug, thiserror::Error)]
#[error("{provider}: {message}")]
pub struct ProviderError {
    pub provider: &'static str,
    pub kind: ProviderErrorKind,
    pub message: String,
    /// Server wait hint from a 429 response
    pub retry_after: Option<Duration>,
}

impl ProviderError {
    pub fn quota(provider: &'static str, message: impl Into<String>) -> Self {
        Self {
            provider,
            kind: ProviderErrorKind::Quota,
            message: message.into(),
            retry_after: None,
        }
    }

    pub fn transport(provider: &'static str, message: impl Into<String>) -> Self {
        Self {
            provider,
            kind: ProviderErrorKind::Transport,
            message: message.into(),
            retry_after: None,
        }
    }

    pub fn validation(provider: &'static str, message: impl Into<String>) -> Self {
        Self {
            provider,
            kind: ProviderErrorKind::Validation,
            message: message.into(),
            retry_after: None,
        }
    }

    pub fn with_retry_after(mut self, retry_after: Option<Duration>) -> Self {
        self.retry_after = retry_after;
        self
    }
}

impl RetryableError for ProviderError {
    fn is_retryable(&self) -> bool {
        match self.kind {
            ProviderErrorKind::Transport => true,
            ProviderErrorKind::Quota => self.retry_after.is_some(),
            ProviderErrorKind::Validation => false,
        }
    }

    fn retry_after(&self) -> Option<Duration> {
        self.retry_after
    }
}

/// One entry of a pipelined bulk write.
#[derive(Debug, Clone)]
pub struct KvEntry {
    pub key: String,
    pub value: String,
    pub ttl: Option<Duration>,
}

/// Remote KV backend. Values are UTF-8 JSON strings.
#[async_trait]
pub trait KvProvider: Send + Sync {
    fn name(&self) -> &'static str;

    /// `Ok(None)` for missing keys; 404 is not an error.
    async fn get(&self, key: &str) -> Result<Option<String>, ProviderError>;

    async fn set(
        &self,
        key: &str,
        value: &str,
        ttl: Option<Duration>,
    ) -> Result<(), ProviderError>;

    async fn delete(&self, key: &str) -> Result<(), ProviderError>;

    async fn list_keys(&self, prefix: Option<&str>) -> Result<Vec<String>, ProviderError>;

    /// Pipelined write; no read-before-write filtering at this layer.
    async fn bulk_set(&self, entries: &[KvEntry]) -> Result<(), ProviderError>;
}

/// Map an outbound reqwest failure to a transport-class provider error.
pub(crate) fn transport_error(provider: &'static str, err: reqwest::Error) -> ProviderError {
    let message = if err.is_timeout() {
        format!("request timed out: {err}")
    } else if err.is_connect() {
        format!("connect failure: {err}")
    } else {
        err.to_string()
    };
    ProviderError::transport(provider, message)
}

/// Parse a Retry-After header value (seconds form only).
pub(crate) fn parse_retry_after(headers: &reqwest::header::HeaderMap) -> Option<Duration> {
    headers
        .get(reqwest::header::RETRY_AFTER)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse::<u64>().ok())
        .map(Duration::from_secs)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn quota_without_hint_is_not_retryable() {
        let err = ProviderError::quota("cloudflare_kv", "limit exceeded");
        assert!(!err.is_retryable());

        let err = err.with_retry_after(Some(Duration::from_secs(30)));
        assert!(err.is_retryable());
        assert_eq!(err.retry_after(), Some(Duration::from_secs(30)));
    }

    #[test]
    fn transport_is_retryable_validation_is_not() {
        assert!(ProviderError::transport("upstash_redis", "ETIMEDOUT").is_retryable());
        assert!(!ProviderError::validation("upstash_redis", "bad key").is_retryable());
    }
}
