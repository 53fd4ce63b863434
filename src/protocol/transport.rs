//! Chat transport seam
//!
//! The wire library itself is an external collaborator; this trait fixes
//! the surface the rest of the system depends on. The supervisor owns the
//! single long-lived connection and is the only caller of
//! `connect`/`disconnect`/`reset_session`.

use crate::pipeline::cancel::CancelToken;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Error surfaced by the wire library. `code` carries protocol-level error
/// codes (e.g. 406); `message` is matched by the classifier.
#[derive(Debug, Clone, thiserror::Error)]
#[error("{message}")]
pub struct ClientError {
    pub code: Option<i32>,
    pub message: String,
}

impl ClientError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            code: None,
            message: message.into(),
        }
    }

    pub fn with_code(code: i32, message: impl Into<String>) -> Self {
        Self {
            code: Some(code),
            message: message.into(),
        }
    }

    pub fn timeout(context: &str) -> Self {
        Self::new(format!("{context}: timed out"))
    }

    pub fn not_connected() -> Self {
        Self::new("client not connected")
    }

    /// Raised by the circuit breaker while open. Reads as a connectivity
    /// problem so the standard classification applies.
    pub fn breaker_open(wait_secs: u64) -> Self {
        Self::new(format!(
            "circuit breaker open, client not connected; retry in {wait_secs}s"
        ))
    }
}

/// Media attachment metadata carried by a message.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MediaInfo {
    pub file_name: String,
    pub file_size: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mime_type: Option<String>,
}

/// Inbound chat message.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatMessage {
    pub chat_id: i64,
    pub msg_id: i64,
    pub sender_id: i64,
    #[serde(default)]
    pub text: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub media: Option<MediaInfo>,
    /// Album id; messages sharing it are aggregated into one batch
    #[serde(skip_serializing_if = "Option::is_none")]
    pub grouped_id: Option<String>,
}

/// Inbound callback query (inline button press).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CallbackQuery {
    pub query_id: String,
    pub user_id: i64,
    pub chat_id: i64,
    pub msg_id: i64,
    pub data: String,
}

/// Event stream element delivered to the dispatcher.
#[derive(Debug, Clone)]
pub enum ChatEvent {
    Message(ChatMessage),
    Callback(CallbackQuery),
}

/// Byte-progress callback: `(transferred, total)`.
pub type ProgressFn<'a> = Option<&'a (dyn Fn(u64, u64) + Send + Sync)>;

/// Long-lived chat protocol connection.
#[async_trait]
pub trait ChatTransport: Send + Sync {
    async fn connect(&self) -> Result<(), ClientError>;

    async fn disconnect(&self) -> Result<(), ClientError>;

    /// Destroy the underlying session/sender; next connect starts fresh.
    async fn reset_session(&self) -> Result<(), ClientError>;

    /// No-op liveness call used by the watchdog.
    async fn ping(&self) -> Result<(), ClientError>;

    fn is_connected(&self) -> bool;

    /// Pull the next inbound event. `Ok(None)` when the stream is idle or
    /// the connection is down; the caller paces itself.
    async fn next_event(&self) -> Result<Option<ChatEvent>, ClientError>;

    async fn get_message(
        &self,
        chat_id: i64,
        msg_id: i64,
    ) -> Result<Option<ChatMessage>, ClientError>;

    /// Stream a message's media to `dest`; returns bytes written. The
    /// implementation must poll `cancel` between chunks.
    async fn download_media(
        &self,
        message: &ChatMessage,
        dest: &Path,
        progress: ProgressFn<'_>,
        cancel: &CancelToken,
    ) -> Result<u64, ClientError>;

    /// Send a text message; returns the new message id.
    async fn send_message(&self, chat_id: i64, text: &str) -> Result<i64, ClientError>;

    async fn edit_message(&self, chat_id: i64, msg_id: i64, text: &str)
        -> Result<(), ClientError>;

    /// Acknowledge a callback query (toast on the user's side).
    async fn answer_callback(&self, query_id: &str, text: &str) -> Result<(), ClientError>;
}

/// Placeholder transport for deployments where no wire client is linked
/// (webhook-only instances, tests of the HTTP surface). Every operation
/// reports not-connected.
#[derive(Debug, Default)]
pub struct DetachedTransport;

#[async_trait]
impl ChatTransport for DetachedTransport {
    async fn connect(&self) -> Result<(), ClientError> {
        Err(ClientError::not_connected())
    }

    async fn disconnect(&self) -> Result<(), ClientError> {
        Ok(())
    }

    async fn reset_session(&self) -> Result<(), ClientError> {
        Ok(())
    }

    async fn ping(&self) -> Result<(), ClientError> {
        Err(ClientError::not_connected())
    }

    fn is_connected(&self) -> bool {
        false
    }

    async fn next_event(&self) -> Result<Option<ChatEvent>, ClientError> {
        // Nothing ever arrives; keep the poll loop from spinning.
        tokio::time::sleep(std::time::Duration::from_secs(5)).await;
        Ok(None)
    }

    async fn get_message(
        &self,
        _chat_id: i64,
        _msg_id: i64,
    ) -> Result<Option<ChatMessage>, ClientError> {
        Err(ClientError::not_connected())
    }

    async fn download_media(
        &self,
        _message: &ChatMessage,
        _dest: &Path,
        _progress: ProgressFn<'_>,
        _cancel: &CancelToken,
    ) -> Result<u64, ClientError> {
        Err(ClientError::not_connected())
    }

    async fn send_message(&self, _chat_id: i64, _text: &str) -> Result<i64, ClientError> {
        Err(ClientError::not_connected())
    }

    async fn edit_message(
        &self,
        _chat_id: i64,
        _msg_id: i64,
        _text: &str,
    ) -> Result<(), ClientError> {
        Err(ClientError::not_connected())
    }

    async fn answer_callback(&self, _query_id: &str, _text: &str) -> Result<(), ClientError> {
        Err(ClientError::not_connected())
    }
}
