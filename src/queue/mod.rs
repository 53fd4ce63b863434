//! Durable-queue adapter
//!
//! Thin typed wrapper over an external at-least-once HTTP delivery service.
//! Each task stage transition is published as a JSON message to a
//! topic-shaped URL under the configured webhook base; the service redelivers
//! with exponential backoff until the webhook acknowledges.
//!
//! Publish failures are logged and swallowed at this layer: the task row is
//! already durable, so a lost publish is recoverable by a later sweep.

pub mod signature;

use crate::config::QueueConfig;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Webhook topics the pipeline listens on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueTopic {
    Download,
    Upload,
    MediaBatch,
}

impl QueueTopic {
    pub fn path(&self) -> &'static str {
        match self {
            QueueTopic::Download => "/api/tasks/download",
            QueueTopic::Upload => "/api/tasks/upload",
            QueueTopic::MediaBatch => "/api/tasks/batch",
        }
    }
}

/// Payload of a download-stage message.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DownloadMessage {
    pub task_id: String,
    pub user_id: i64,
    pub chat_id: i64,
    pub msg_id: i64,
}

/// Payload of an upload-stage message.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadMessage {
    pub task_id: String,
    pub user_id: i64,
    pub chat_id: i64,
    pub msg_id: i64,
    pub local_path: String,
}

/// Payload of a media-batch message.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MediaBatchMessage {
    pub group_id: String,
    pub task_ids: Vec<String>,
}

/// Publisher seam for the external durable queue.
#[async_trait]
pub trait TaskQueue: Send + Sync {
    async fn enqueue_download_task(&self, message: DownloadMessage);
    async fn enqueue_upload_task(&self, message: UploadMessage);
    async fn enqueue_media_batch(&self, message: MediaBatchMessage);
}

/// HTTP publisher for a QStash-style delivery service.
pub struct HttpQueuePublisher {
    http: reqwest::Client,
    config: QueueConfig,
}

impl HttpQueuePublisher {
    pub fn new(http: reqwest::Client, config: QueueConfig) -> Self {
        Self { http, config }
    }

    /// Publish one message; errors are logged, never propagated.
    async fn publish<T: Serialize>(&self, topic: QueueTopic, payload: &T) {
        let destination = format!(
            "{}{}",
            self.config.webhook_base.trim_end_matches('/'),
            topic.path()
        );
        let url = format!(
            "{}/{}",
            self.config.publish_url.trim_end_matches('/'),
            destination
        );

        let result = self
            .http
            .post(&url)
            .bearer_auth(&self.config.token)
            .timeout(Duration::from_secs(10))
            .json(payload)
            .send()
            .await;

        match result {
            Ok(response) if response.status().is_success() => {
                tracing::debug!(topic = topic.path(), "queue message published");
            }
            Ok(response) => {
                tracing::warn!(
                    topic = topic.path(),
                    status = %response.status(),
                    "queue publish rejected; task row remains for republish"
                );
            }
            Err(err) => {
                tracing::warn!(
                    topic = topic.path(),
                    error = %err,
                    "queue publish failed; task row remains for republish"
                );
            }
        }
    }
}

#[async_trait]
impl TaskQueue for HttpQueuePublisher {
    async fn enqueue_download_task(&self, message: DownloadMessage) {
        self.publish(QueueTopic::Download, &message).await;
    }

    async fn enqueue_upload_task(&self, message: UploadMessage) {
        self.publish(QueueTopic::Upload, &message).await;
    }

    async fn enqueue_media_batch(&self, message: MediaBatchMessage) {
        self.publish(QueueTopic::MediaBatch, &message).await;
    }
}

/// Stand-in when no durable queue is configured: drops every publish with
/// a warning. Stage transitions then only happen via manual webhook calls.
pub struct DisabledQueue;

#[async_trait]
impl TaskQueue for DisabledQueue {
    async fn enqueue_download_task(&self, message: DownloadMessage) {
        tracing::warn!(task_id = %message.task_id, "durable queue disabled; download stage not published");
    }

    async fn enqueue_upload_task(&self, message: UploadMessage) {
        tracing::warn!(task_id = %message.task_id, "durable queue disabled; upload stage not published");
    }

    async fn enqueue_media_batch(&self, message: MediaBatchMessage) {
        tracing::warn!(group_id = %message.group_id, "durable queue disabled; batch not published");
    }
}

/// Recording queue for tests: captures every publish in order.
#[derive(Default)]
pub struct RecordingQueue {
    pub downloads: parking_lot::Mutex<Vec<DownloadMessage>>,
    pub uploads: parking_lot::Mutex<Vec<UploadMessage>>,
    pub batches: parking_lot::Mutex<Vec<MediaBatchMessage>>,
}

impl RecordingQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn download_count(&self) -> usize {
        self.downloads.lock().len()
    }

    pub fn upload_count(&self) -> usize {
        self.uploads.lock().len()
    }
}

#[async_trait]
impl TaskQueue for RecordingQueue {
    async fn enqueue_download_task(&self, message: DownloadMessage) {
        self.downloads.lock().push(message);
    }

    async fn enqueue_upload_task(&self, message: UploadMessage) {
        self.uploads.lock().push(message);
    }

    async fn enqueue_media_batch(&self, message: MediaBatchMessage) {
        self.batches.lock().push(message);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn topic_paths_match_router() {
        assert_eq!(QueueTopic::Download.path(), "/api/tasks/download");
        assert_eq!(QueueTopic::Upload.path(), "/api/tasks/upload");
        assert_eq!(QueueTopic::MediaBatch.path(), "/api/tasks/batch");
    }

    #[test]
    fn messages_serialize_camel_case() {
        let message = UploadMessage {
            task_id: "t-1".into(),
            user_id: 7,
            chat_id: 9,
            msg_id: 11,
            local_path: "/tmp/video.mp4".into(),
        };
        let json = serde_json::to_value(&message).unwrap();
        assert_eq!(json["taskId"], "t-1");
        assert_eq!(json["localPath"], "/tmp/video.mp4");
    }

    #[tokio::test]
    async fn recording_queue_captures_order() {
        let queue = RecordingQueue::new();
        queue
            .enqueue_download_task(DownloadMessage {
                task_id: "a".into(),
                user_id: 1,
                chat_id: 2,
                msg_id: 3,
            })
            .await;
        queue
            .enqueue_download_task(DownloadMessage {
                task_id: "b".into(),
                user_id: 1,
                chat_id: 2,
                msg_id: 4,
            })
            .await;

        let downloads = queue.downloads.lock();
        assert_eq!(downloads.len(), 2);
        assert_eq!(downloads[0].task_id, "a");
        assert_eq!(downloads[1].task_id, "b");
    }
}
