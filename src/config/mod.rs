//! Environment-driven configuration
//!
//! Every deployment knob comes in through environment variables. Provider
//! credentials are optional groups: when a group is incomplete the
//! corresponding subsystem is disabled at startup instead of failing boot.

use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Configuration errors surfaced at startup.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("invalid value for {name}: {value}")]
    Invalid { name: &'static str, value: String },
}

/// Cloudflare KV credentials (primary L2 provider).
#[derive(Debug, Clone)]
pub struct CloudflareKvConfig {
    pub account_id: String,
    pub namespace_id: String,
    pub token: String,
}

/// Upstash Redis REST credentials (backup L2 provider; enables failover).
#[derive(Debug, Clone)]
pub struct UpstashConfig {
    pub rest_url: String,
    pub rest_token: String,
}

/// Cloudflare D1 credentials (durable task store).
#[derive(Debug, Clone)]
pub struct D1Config {
    pub account_id: String,
    pub database_id: String,
    pub token: String,
}

/// Durable queue publisher settings.
#[derive(Debug, Clone)]
pub struct QueueConfig {
    /// Publish endpoint prefix of the at-least-once delivery service
    pub publish_url: String,
    pub token: String,
    /// Public base the webhook router is reachable at
    pub webhook_base: String,
    /// Key used to verify `upstash-signature` headers
    pub signing_key: String,
}

/// Top-level application configuration.
#[derive(Debug, Clone)]
pub struct AppConfig {
    /// Webhook router port
    pub port: u16,

    /// Privileged user id; always passes the global guard
    pub owner_id: Option<i64>,

    /// Fallback access mode when the setting row is absent
    pub access_mode: String,

    /// Local cache path for downloads and the local-cache probe
    pub download_dir: PathBuf,

    /// Default upload path under each drive
    pub remote_folder: String,

    pub cf_kv: Option<CloudflareKvConfig>,
    pub upstash: Option<UpstashConfig>,
    pub d1: Option<D1Config>,
    pub queue: Option<QueueConfig>,

    /// Leader lock TTL
    pub leader_ttl: Duration,

    /// Instance activity timeout (heartbeat liveness window)
    pub activity_timeout: Duration,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            port: 8787,
            owner_id: None,
            access_mode: "public".to_string(),
            download_dir: PathBuf::from("./downloads"),
            remote_folder: "/".to_string(),
            cf_kv: None,
            upstash: None,
            d1: None,
            queue: None,
            leader_ttl: Duration::from_secs(60),
            activity_timeout: Duration::from_secs(120),
        }
    }
}

fn env(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.is_empty())
}

impl AppConfig {
    /// Assemble configuration from the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = AppConfig::default();

        if let Some(port) = env("PORT") {
            config.port = port.parse().map_err(|_| ConfigError::Invalid {
                name: "PORT",
                value: port.clone(),
            })?;
        }

        if let Some(owner) = env("OWNER_ID") {
            config.owner_id = Some(owner.parse().map_err(|_| ConfigError::Invalid {
                name: "OWNER_ID",
                value: owner.clone(),
            })?);
        }

        if let Some(mode) = env("ACCESS_MODE") {
            if mode != "public" && mode != "private" {
                return Err(ConfigError::Invalid {
                    name: "ACCESS_MODE",
                    value: mode,
                });
            }
            config.access_mode = mode;
        }

        if let Some(dir) = env("DOWNLOAD_DIR") {
            config.download_dir = PathBuf::from(dir);
        }
        if let Some(folder) = env("REMOTE_FOLDER") {
            config.remote_folder = folder;
        }

        config.cf_kv = match (
            env("CF_KV_ACCOUNT_ID"),
            env("CF_KV_NAMESPACE_ID"),
            env("CF_KV_TOKEN"),
        ) {
            (Some(account_id), Some(namespace_id), Some(token)) => Some(CloudflareKvConfig {
                account_id,
                namespace_id,
                token,
            }),
            _ => None,
        };

        config.upstash = match (env("UPSTASH_REDIS_REST_URL"), env("UPSTASH_REDIS_REST_TOKEN")) {
            (Some(rest_url), Some(rest_token)) => Some(UpstashConfig {
                rest_url,
                rest_token,
            }),
            _ => None,
        };

        config.d1 = match (
            env("CF_D1_ACCOUNT_ID"),
            env("CF_D1_DATABASE_ID"),
            env("CF_D1_TOKEN"),
        ) {
            (Some(account_id), Some(database_id), Some(token)) => Some(D1Config {
                account_id,
                database_id,
                token,
            }),
            _ => None,
        };

        config.queue = match (
            env("QSTASH_URL"),
            env("QSTASH_TOKEN"),
            env("WEBHOOK_BASE_URL"),
            env("QSTASH_SIGNING_KEY"),
        ) {
            (Some(publish_url), Some(token), Some(webhook_base), Some(signing_key)) => {
                Some(QueueConfig {
                    publish_url,
                    token,
                    webhook_base,
                    signing_key,
                })
            }
            _ => None,
        };

        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let config = AppConfig::default();
        assert_eq!(config.port, 8787);
        assert_eq!(config.access_mode, "public");
        assert!(config.cf_kv.is_none());
        assert_eq!(config.leader_ttl, Duration::from_secs(60));
        assert_eq!(config.activity_timeout, Duration::from_secs(120));
    }
}
