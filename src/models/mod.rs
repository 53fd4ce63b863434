//! Shared persistent records
//!
//! Row types stored in the durable task store and the KV namespace:
//! - Transfer tasks with their status state machine
//! - Per-user drive bindings
//! - Instance registrations and heartbeats
//! - Lock records, settings, and conversational sessions
//!
//! All of these serialize to camelCase JSON; that is the wire and storage
//! format everywhere (KV values, D1 rows, webhook payloads).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Lifecycle of a transfer task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Hash)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    /// Created, waiting for the download webhook
    Queued,
    /// Bytes are being fetched from the chat protocol
    Downloading,
    /// Bytes are on local disk, upload not started
    Downloaded,
    /// Bytes are streaming to the drive provider
    Uploading,
    /// Transfer finished (terminal)
    Completed,
    /// Transfer failed (terminal)
    Failed,
    /// Cancelled by the owning user (terminal)
    Cancelled,
}

impl TaskStatus {
    /// Terminal states admit no further transitions.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Cancelled
        )
    }

    /// Whether moving from `self` to `next` is a legal transition.
    ///
    /// The graph:
    /// ```text
    /// queued -> downloading -> downloaded -> uploading -> completed
    /// queued ------------------------------------------> completed
    ///  *     -> failed
    ///  *     -> cancelled
    /// ```
    pub fn can_transition_to(&self, next: TaskStatus) -> bool {
        if self.is_terminal() {
            return false;
        }
        match next {
            TaskStatus::Failed | TaskStatus::Cancelled => true,
            TaskStatus::Queued => false,
            TaskStatus::Downloading => *self == TaskStatus::Queued,
            TaskStatus::Downloaded => *self == TaskStatus::Downloading,
            TaskStatus::Uploading => *self == TaskStatus::Downloaded,
            // Direct queued -> completed is the dedup fast-path.
            TaskStatus::Completed => matches!(
                self,
                TaskStatus::Queued | TaskStatus::Uploading | TaskStatus::Downloaded
            ),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Queued => "queued",
            TaskStatus::Downloading => "downloading",
            TaskStatus::Downloaded => "downloaded",
            TaskStatus::Uploading => "uploading",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
            TaskStatus::Cancelled => "cancelled",
        }
    }
}

impl std::str::FromStr for TaskStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "queued" => Ok(TaskStatus::Queued),
            "downloading" => Ok(TaskStatus::Downloading),
            "downloaded" => Ok(TaskStatus::Downloaded),
            "uploading" => Ok(TaskStatus::Uploading),
            "completed" => Ok(TaskStatus::Completed),
            "failed" => Ok(TaskStatus::Failed),
            "cancelled" => Ok(TaskStatus::Cancelled),
            other => Err(format!("unknown task status: {other}")),
        }
    }
}

/// A single media transfer, persisted in the task table.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Task {
    /// Globally unique task id
    pub id: String,

    /// Owning user
    pub user_id: i64,

    /// Chat the media originated from
    pub chat_id: i64,

    /// Outbound status message (edited with progress)
    pub msg_id: i64,

    /// Message carrying the media reference
    pub source_msg_id: i64,

    pub file_name: String,

    /// Size in bytes as reported by the source message
    pub file_size: u64,

    pub status: TaskStatus,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_msg: Option<String>,

    /// Media-group id when the task was created from an album
    #[serde(skip_serializing_if = "Option::is_none")]
    pub group_id: Option<String>,

    /// Set once the bytes reached local disk
    #[serde(skip_serializing_if = "Option::is_none")]
    pub local_path: Option<String>,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Task {
    pub fn new(
        user_id: i64,
        chat_id: i64,
        msg_id: i64,
        source_msg_id: i64,
        file_name: String,
        file_size: u64,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            user_id,
            chat_id,
            msg_id,
            source_msg_id,
            file_name,
            file_size,
            status: TaskStatus::Queued,
            error_msg: None,
            group_id: None,
            local_path: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn with_group(mut self, group_id: String) -> Self {
        self.group_id = Some(group_id);
        self
    }

    /// The `(user_id, file_name, file_size)` triple used for dedup lookups.
    pub fn dedup_key(&self) -> (i64, &str, u64) {
        (self.user_id, &self.file_name, self.file_size)
    }
}

/// Supported drive backends. Concrete provider implementations are plugged
/// in through the factory registry; this tag only selects them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DriveType {
    WebDav,
    S3,
    Sftp,
}

impl DriveType {
    pub fn as_str(&self) -> &'static str {
        match self {
            DriveType::WebDav => "web_dav",
            DriveType::S3 => "s3",
            DriveType::Sftp => "sftp",
        }
    }

    pub fn all() -> &'static [DriveType] {
        &[DriveType::WebDav, DriveType::S3, DriveType::Sftp]
    }
}

impl std::str::FromStr for DriveType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "web_dav" | "webdav" => Ok(DriveType::WebDav),
            "s3" => Ok(DriveType::S3),
            "sftp" => Ok(DriveType::Sftp),
            other => Err(format!("unknown drive type: {other}")),
        }
    }
}

/// Per-user drive binding.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Drive {
    pub id: String,
    pub user_id: i64,

    /// Display name shown in the drive list
    pub name: String,

    #[serde(rename = "type")]
    pub drive_type: DriveType,

    /// Opaque provider credentials (validated by the provider, not here)
    pub credentials: serde_json::Value,

    /// At most one default drive per user
    pub is_default: bool,
}

/// Liveness of a registered instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InstanceStatus {
    Active,
    Offline,
}

/// Row in the instance table, refreshed by the heartbeat loop.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InstanceRecord {
    pub id: String,
    pub hostname: String,
    pub region: String,
    pub started_at: DateTime<Utc>,
    pub last_heartbeat: DateTime<Utc>,
    pub status: InstanceStatus,
}

impl InstanceRecord {
    /// An instance is alive iff its heartbeat is within `activity_timeout`.
    pub fn is_alive(&self, now: DateTime<Utc>, activity_timeout: chrono::Duration) -> bool {
        self.status == InstanceStatus::Active && now - self.last_heartbeat <= activity_timeout
    }
}

/// Value stored under `lock:<name>` in the KV namespace.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LockRecord {
    pub owner_instance_id: String,

    /// Unix seconds at acquisition; expiration is wall-clock
    pub acquired_at: u64,

    pub ttl_seconds: u64,
}

impl LockRecord {
    pub fn is_expired(&self, now_secs: u64) -> bool {
        now_secs >= self.acquired_at + self.ttl_seconds
    }

    /// Remaining tenure in seconds (zero when expired).
    pub fn remaining_secs(&self, now_secs: u64) -> u64 {
        (self.acquired_at + self.ttl_seconds).saturating_sub(now_secs)
    }
}

/// Conversational state for the drive config flow, stored under
/// `session:<userId>` with an idle TTL.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Session {
    pub current_step: String,
    #[serde(default)]
    pub temp_data: HashMap<String, String>,
    pub updated_at: DateTime<Utc>,
}

impl Session {
    pub fn new(step: impl Into<String>) -> Self {
        Self {
            current_step: step.into(),
            temp_data: HashMap::new(),
            updated_at: Utc::now(),
        }
    }

    pub fn touch(&mut self) {
        self.updated_at = Utc::now();
    }
}
