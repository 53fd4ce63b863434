//! Task pipeline
//!
//! The download/upload state machine behind the webhook surface. Stage
//! transitions are driven by the external durable queue; the in-memory
//! pools only smooth bursts. Every mutation of a task row happens under
//! that task's cluster-wide lock, and the leader gate precedes all work.
//!
//! ```text
//! queued -> downloading -> downloaded -> uploading -> completed
//! queued ------------------------------------------> completed  (sec-transfer)
//!  *     -> failed
//!  *     -> cancelled
//! ```

pub mod cancel;
pub mod workers;

mod transfer;

pub use cancel::{CancelRegistry, CancelToken};
pub use workers::{WorkerPool, WorkerPoolConfig};

use crate::coordinator::{CoordinatorError, InstanceCoordinator, LEADER_LOCK};
use crate::drive::{DriveError, DriveProvider, DriveProviderFactory};
use crate::kv::CacheError;
use crate::limits::{Priority, RateLimiter, RetryPolicy, RetryableError};
use crate::models::{Task, TaskStatus};
use crate::protocol::{classify, ChatMessage, ClientError, ClientSupervisor, ErrorKind};
use crate::queue::{DownloadMessage, MediaBatchMessage, TaskQueue};
use crate::repository::{DriveStore, RepositoryError, TaskRepository};
use dashmap::DashMap;
use once_cell::sync::OnceCell;
use std::path::PathBuf;
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::oneshot;

/// Pipeline error kinds; each maps onto a webhook status code.
#[derive(Error, Debug)]
pub enum PipelineError {
    /// Task row, source message, or local file missing (404)
    #[error("not found: {0}")]
    NotFound(String),

    /// Leader gate failed at entry (503)
    #[error("not leader")]
    NotLeader,

    /// Timeout, network, lock, cache (503; the queue redelivers)
    #[error("transient: {0}")]
    Transient(String),

    /// Unrecoverable protocol/database condition (500)
    #[error("permanent: {0}")]
    Permanent(String),

    /// Size mismatch, refused upload, unsupported media (500, task failed)
    #[error("{0}")]
    Business(String),

    /// Cooperative cancel observed
    #[error("cancelled")]
    Cancelled,
}

impl PipelineError {
    /// Webhook status mapping.
    pub fn status_code(&self) -> u16 {
        match self {
            PipelineError::NotFound(_) => 404,
            PipelineError::NotLeader | PipelineError::Transient(_) => 503,
            PipelineError::Permanent(_) | PipelineError::Business(_) => 500,
            // No error code for a cancel; the queue must stop redelivering.
            PipelineError::Cancelled => 200,
        }
    }

    /// Whether the task row should be marked failed.
    fn marks_failed(&self) -> bool {
        matches!(
            self,
            PipelineError::Permanent(_) | PipelineError::Business(_)
        )
    }
}

impl From<CoordinatorError> for PipelineError {
    fn from(err: CoordinatorError) -> Self {
        PipelineError::Transient(err.to_string())
    }
}

impl From<CacheError> for PipelineError {
    fn from(err: CacheError) -> Self {
        if err.is_retryable() {
            PipelineError::Transient(err.to_string())
        } else {
            PipelineError::Permanent(err.to_string())
        }
    }
}

impl From<RepositoryError> for PipelineError {
    fn from(err: RepositoryError) -> Self {
        match err {
            RepositoryError::NotFound(what) => PipelineError::NotFound(what),
            RepositoryError::Http(_) => PipelineError::Transient(err.to_string()),
            RepositoryError::Cache(cache) => cache.into(),
            other => PipelineError::Permanent(other.to_string()),
        }
    }
}

impl From<DriveError> for PipelineError {
    fn from(err: DriveError) -> Self {
        match err {
            DriveError::Remote(_) => PipelineError::Transient(err.to_string()),
            DriveError::Refused(_) | DriveError::Validation(_) | DriveError::NotBound(_) => {
                PipelineError::Business(err.to_string())
            }
            DriveError::Io(_) => PipelineError::Permanent(err.to_string()),
        }
    }
}

impl From<ClientError> for PipelineError {
    fn from(err: ClientError) -> Self {
        match classify(&err) {
            ErrorKind::Timeout
            | ErrorKind::Network
            | ErrorKind::ConnectionLost
            | ErrorKind::NotConnected => PipelineError::Transient(err.message),
            _ => PipelineError::Permanent(err.message),
        }
    }
}

/// Result handed back to the webhook router.
#[derive(Debug, Clone)]
pub struct WebhookResponse {
    pub success: bool,
    pub status_code: u16,
    pub message: Option<String>,
}

impl WebhookResponse {
    pub fn ok() -> Self {
        Self {
            success: true,
            status_code: 200,
            message: None,
        }
    }

    pub fn ok_with(message: impl Into<String>) -> Self {
        Self {
            success: true,
            status_code: 200,
            message: Some(message.into()),
        }
    }

    pub fn from_error(err: &PipelineError) -> Self {
        if matches!(err, PipelineError::Cancelled) {
            return Self::ok_with("cancelled");
        }
        Self {
            success: false,
            status_code: err.status_code(),
            message: Some(err.to_string()),
        }
    }
}

/// Size tolerance for the sec-transfer and local-cache probes: 10 KiB for
/// files up to 1 MiB, 1 MiB above that.
pub fn size_tolerance(size: u64) -> u64 {
    const MIB: u64 = 1024 * 1024;
    if size <= MIB {
        10 * 1024
    } else {
        MIB
    }
}

/// `|actual - expected| <= tolerance(expected)`.
pub fn within_tolerance(actual: u64, expected: u64) -> bool {
    actual.abs_diff(expected) <= size_tolerance(expected)
}

/// Pipeline tuning.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub download_dir: PathBuf,
    /// Minimum spacing between progress edits per task
    pub ui_min_interval: Duration,
    pub retry: RetryPolicy,
    pub download_pool: WorkerPoolConfig,
    pub upload_pool: WorkerPoolConfig,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            download_dir: PathBuf::from("./downloads"),
            ui_min_interval: Duration::from_secs(3),
            retry: RetryPolicy::exponential(3, Duration::from_secs(1)),
            download_pool: WorkerPoolConfig::download(),
            upload_pool: WorkerPoolConfig::upload(),
        }
    }
}

/// Download-phase job: the waiting-tasks cache entry.
struct DownloadJob {
    task: Task,
    message: ChatMessage,
    respond: oneshot::Sender<WebhookResponse>,
}

/// Upload-phase job: the waiting-upload-tasks cache entry.
struct UploadJob {
    task: Task,
    respond: oneshot::Sender<WebhookResponse>,
}

/// The task manager.
pub struct TaskManager {
    repo: Arc<TaskRepository>,
    drives: Arc<dyn DriveStore>,
    factory: Arc<DriveProviderFactory>,
    queue: Arc<dyn TaskQueue>,
    coordinator: Arc<InstanceCoordinator>,
    supervisor: Arc<ClientSupervisor>,
    limiter: Arc<RateLimiter>,
    config: PipelineConfig,
    cancels: CancelRegistry,
    /// Per-task timestamp of the last progress edit
    progress_marks: DashMap<String, Instant>,
    download_pool: OnceCell<WorkerPool<DownloadJob>>,
    upload_pool: OnceCell<WorkerPool<UploadJob>>,
}

impl TaskManager {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        repo: Arc<TaskRepository>,
        drives: Arc<dyn DriveStore>,
        factory: Arc<DriveProviderFactory>,
        queue: Arc<dyn TaskQueue>,
        coordinator: Arc<InstanceCoordinator>,
        supervisor: Arc<ClientSupervisor>,
        limiter: Arc<RateLimiter>,
        config: PipelineConfig,
    ) -> Self {
        Self {
            repo,
            drives,
            factory,
            queue,
            coordinator,
            supervisor,
            limiter,
            config,
            cancels: CancelRegistry::new(),
            progress_marks: DashMap::new(),
            download_pool: OnceCell::new(),
            upload_pool: OnceCell::new(),
        }
    }

    /// Build and start the worker pools. Pools hold weak references back to
    /// the manager so shutdown is not kept alive by queued jobs.
    pub fn start(self: &Arc<Self>) {
        let weak: Weak<TaskManager> = Arc::downgrade(self);
        let download_pool = WorkerPool::new(self.config.download_pool.clone(), move |job: DownloadJob| {
            let manager = weak.clone();
            async move {
                let response = match manager.upgrade() {
                    Some(manager) => manager.process_download(job.task, job.message).await,
                    None => WebhookResponse::from_error(&PipelineError::Transient(
                        "pipeline shutting down".into(),
                    )),
                };
                let _ = job.respond.send(response);
            }
        });
        download_pool.start();
        let _ = self.download_pool.set(download_pool);

        let weak: Weak<TaskManager> = Arc::downgrade(self);
        let upload_pool = WorkerPool::new(self.config.upload_pool.clone(), move |job: UploadJob| {
            let manager = weak.clone();
            async move {
                let response = match manager.upgrade() {
                    Some(manager) => manager.process_upload(job.task).await,
                    None => WebhookResponse::from_error(&PipelineError::Transient(
                        "pipeline shutting down".into(),
                    )),
                };
                let _ = job.respond.send(response);
            }
        });
        upload_pool.start();
        let _ = self.upload_pool.set(upload_pool);
    }

    async fn leader_gate(&self) -> Result<(), PipelineError> {
        if self.coordinator.has_lock(LEADER_LOCK).await {
            Ok(())
        } else {
            Err(PipelineError::NotLeader)
        }
    }

    /// Resolve the drive provider for a user's default drive.
    async fn provider_for_user(
        &self,
        user_id: i64,
    ) -> Result<Arc<dyn DriveProvider>, PipelineError> {
        let drive = self
            .drives
            .find_default(user_id)
            .await?
            .ok_or(DriveError::NotBound(user_id))?;
        Ok(self.factory.create(&drive)?)
    }

    // ========================================================================
    // Ingress
    // ========================================================================

    /// Create a task for a media message and publish its download stage.
    pub async fn add_task(
        &self,
        user_id: i64,
        chat_id: i64,
        message: &ChatMessage,
    ) -> Result<Task, PipelineError> {
        let media = message
            .media
            .as_ref()
            .ok_or_else(|| PipelineError::Business("unsupported media".into()))?;

        // Dedup fast-path: an identical completed transfer short-circuits.
        if let Some(existing) = self
            .repo
            .find_completed_by_file(user_id, &media.file_name, media.file_size)
            .await?
        {
            tracing::info!(
                task_id = %existing.id,
                file = %media.file_name,
                "duplicate of completed transfer; short-circuiting"
            );
            let msg_id = self
                .notify(chat_id, &format!("{} is already on your drive", media.file_name))
                .await;
            let mut task = Task::new(
                user_id,
                chat_id,
                msg_id,
                message.msg_id,
                media.file_name.clone(),
                media.file_size,
            );
            task.status = TaskStatus::Completed;
            self.repo.create(&task).await?;
            return Ok(task);
        }

        let msg_id = self
            .notify(chat_id, &format!("queued: {}", media.file_name))
            .await;

        let mut task = Task::new(
            user_id,
            chat_id,
            msg_id,
            message.msg_id,
            media.file_name.clone(),
            media.file_size,
        );
        if let Some(group_id) = &message.grouped_id {
            task = task.with_group(group_id.clone());
        }
        self.repo.create(&task).await?;

        self.queue
            .enqueue_download_task(DownloadMessage {
                task_id: task.id.clone(),
                user_id,
                chat_id,
                msg_id: message.msg_id,
            })
            .await;

        Ok(task)
    }

    /// Create tasks for an aggregated media group and publish one batch
    /// message covering all of them.
    pub async fn add_batch_tasks(
        &self,
        group_id: &str,
        user_id: i64,
        chat_id: i64,
        messages: &[ChatMessage],
    ) -> Result<Vec<Task>, PipelineError> {
        let mut tasks = Vec::with_capacity(messages.len());
        for message in messages {
            let media = match &message.media {
                Some(media) => media,
                None => continue,
            };
            let msg_id = self
                .notify(chat_id, &format!("queued: {}", media.file_name))
                .await;
            tasks.push(
                Task::new(
                    user_id,
                    chat_id,
                    msg_id,
                    message.msg_id,
                    media.file_name.clone(),
                    media.file_size,
                )
                .with_group(group_id.to_string()),
            );
        }

        if tasks.is_empty() {
            return Err(PipelineError::Business("group carried no media".into()));
        }

        self.repo.create_batch(&tasks).await?;
        self.queue
            .enqueue_media_batch(MediaBatchMessage {
                group_id: group_id.to_string(),
                task_ids: tasks.iter().map(|t| t.id.clone()).collect(),
            })
            .await;

        Ok(tasks)
    }

    // ========================================================================
    // Webhook handlers
    // ========================================================================

    /// `POST /api/tasks/download {taskId}`
    pub async fn handle_download_webhook(&self, task_id: &str) -> WebhookResponse {
        if self.leader_gate().await.is_err() {
            return WebhookResponse {
                success: false,
                status_code: 503,
                message: Some("Not Leader".into()),
            };
        }

        let task = match self.repo.find_by_id(task_id).await {
            Ok(Some(task)) => task,
            Ok(None) => {
                return WebhookResponse::from_error(&PipelineError::NotFound(
                    "Task not found".into(),
                ))
            }
            Err(err) => return WebhookResponse::from_error(&err.into()),
        };

        if task.status.is_terminal() {
            // Redelivery of an already settled task is acknowledged.
            return WebhookResponse::ok_with(format!("already {}", task.status.as_str()));
        }

        // Fetch the media reference before committing a worker.
        let supervisor = self.supervisor.clone();
        let (chat_id, source_msg_id) = (task.chat_id, task.source_msg_id);
        let message = match supervisor
            .call(Priority::High, || async {
                supervisor
                    .transport()
                    .get_message(chat_id, source_msg_id)
                    .await
            })
            .await
        {
            Ok(Some(message)) if message.media.is_some() => message,
            Ok(_) => {
                let _ = self
                    .repo
                    .update_status(task_id, TaskStatus::Failed, Some("Source message missing"))
                    .await;
                return WebhookResponse::from_error(&PipelineError::NotFound(
                    "Source message missing".into(),
                ));
            }
            Err(err) => return WebhookResponse::from_error(&err.into()),
        };

        let (respond, outcome) = oneshot::channel();
        match self.download_pool.get() {
            Some(pool) => pool.submit(DownloadJob {
                task,
                message,
                respond,
            }),
            None => {
                return WebhookResponse::from_error(&PipelineError::Transient(
                    "pipeline not started".into(),
                ))
            }
        }

        outcome.await.unwrap_or_else(|_| {
            WebhookResponse::from_error(&PipelineError::Transient("worker dropped job".into()))
        })
    }

    /// `POST /api/tasks/upload {taskId}`
    pub async fn handle_upload_webhook(&self, task_id: &str) -> WebhookResponse {
        if self.leader_gate().await.is_err() {
            return WebhookResponse {
                success: false,
                status_code: 503,
                message: Some("Not Leader".into()),
            };
        }

        let task = match self.repo.find_by_id(task_id).await {
            Ok(Some(task)) => task,
            Ok(None) => {
                return WebhookResponse::from_error(&PipelineError::NotFound(
                    "Task not found".into(),
                ))
            }
            Err(err) => return WebhookResponse::from_error(&err.into()),
        };

        if task.status.is_terminal() {
            return WebhookResponse::ok_with(format!("already {}", task.status.as_str()));
        }

        let (respond, outcome) = oneshot::channel();
        match self.upload_pool.get() {
            Some(pool) => pool.submit(UploadJob { task, respond }),
            None => {
                return WebhookResponse::from_error(&PipelineError::Transient(
                    "pipeline not started".into(),
                ))
            }
        }

        outcome.await.unwrap_or_else(|_| {
            WebhookResponse::from_error(&PipelineError::Transient("worker dropped job".into()))
        })
    }

    /// `POST /api/tasks/batch {groupId, taskIds}` — serial downloads, first
    /// non-success wins so the queue retries the whole batch.
    pub async fn handle_media_batch_webhook(
        &self,
        group_id: &str,
        task_ids: &[String],
    ) -> WebhookResponse {
        tracing::info!(group_id, count = task_ids.len(), "processing media batch");
        for task_id in task_ids {
            let response = self.handle_download_webhook(task_id).await;
            if !response.success {
                return response;
            }
        }
        WebhookResponse::ok()
    }

    // ========================================================================
    // Cancellation
    // ========================================================================

    /// Cancel a task. Only the owning user (or the privileged owner role)
    /// may cancel.
    pub async fn cancel_task(
        &self,
        task_id: &str,
        user_id: i64,
        privileged: bool,
    ) -> Result<(), PipelineError> {
        let task = self
            .repo
            .find_by_id(task_id)
            .await?
            .ok_or_else(|| PipelineError::NotFound("Task not found".into()))?;

        if task.user_id != user_id && !privileged {
            return Err(PipelineError::Business(
                "only the task owner may cancel".into(),
            ));
        }
        if task.status.is_terminal() {
            return Ok(());
        }

        // Terminal write first so a racing worker observes it.
        self.repo.mark_cancelled(task_id).await?;
        self.cancels.cancel(task_id);

        if let Some(pool) = self.download_pool.get() {
            pool.remove_where(|job| job.task.id == task_id);
        }
        if let Some(pool) = self.upload_pool.get() {
            pool.remove_where(|job| job.task.id == task_id);
        }

        // Best-effort local cleanup.
        if let Some(local_path) = &task.local_path {
            let _ = tokio::fs::remove_file(local_path).await;
        }
        let _ = tokio::fs::remove_file(self.temp_path(task_id)).await;

        self.edit_status(&task, "cancelled").await;
        tracing::info!(task_id, "task cancelled");
        Ok(())
    }

    // ========================================================================
    // Messaging helpers
    // ========================================================================

    /// Send a status message; failures degrade to msg id 0 rather than
    /// blocking the transfer.
    async fn notify(&self, chat_id: i64, text: &str) -> i64 {
        let supervisor = self.supervisor.clone();
        let text = text.to_string();
        match supervisor
            .call(Priority::Ui, || async {
                supervisor.transport().send_message(chat_id, &text).await
            })
            .await
        {
            Ok(msg_id) => msg_id,
            Err(err) => {
                tracing::debug!(error = %err, "status message send failed");
                0
            }
        }
    }

    /// Edit the task's status message (unthrottled; terminal updates).
    async fn edit_status(&self, task: &Task, text: &str) {
        if task.msg_id == 0 {
            return;
        }
        let supervisor = self.supervisor.clone();
        let (chat_id, msg_id) = (task.chat_id, task.msg_id);
        let text = format!("{}: {}", task.file_name, text);
        if let Err(err) = supervisor
            .call(Priority::Ui, || async {
                supervisor.transport().edit_message(chat_id, msg_id, &text).await
            })
            .await
        {
            tracing::debug!(error = %err, "status edit failed");
        }
    }

    /// Throttled progress edit: at most one per `ui_min_interval` per task.
    fn maybe_edit_progress(self: &Arc<Self>, task: &Task, transferred: u64, total: u64) {
        if task.msg_id == 0 {
            return;
        }

        let now = Instant::now();
        let due = {
            let mut entry = self
                .progress_marks
                .entry(task.id.clone())
                .or_insert_with(|| now - self.config.ui_min_interval);
            if now.duration_since(*entry) >= self.config.ui_min_interval {
                *entry = now;
                true
            } else {
                false
            }
        };
        if !due {
            return;
        }

        let percent = if total > 0 {
            (transferred as f64 / total as f64 * 100.0).min(100.0)
        } else {
            0.0
        };
        let text = format!(
            "downloading {:.0}% ({} / {})",
            percent,
            human_size(transferred),
            human_size(total)
        );

        let manager = Arc::clone(self);
        let task = task.clone();
        tokio::spawn(async move {
            manager.edit_status(&task, &text).await;
        });
    }

    fn temp_path(&self, task_id: &str) -> PathBuf {
        self.config.download_dir.join(format!(".tmp-{task_id}"))
    }

    fn final_path(&self, file_name: &str) -> PathBuf {
        // Files are named by the sec-transfer key.
        self.config.download_dir.join(file_name)
    }

    /// Queue depths, for `/status` rendering and tests.
    pub fn queue_depths(&self) -> (usize, usize) {
        (
            self.download_pool.get().map(|p| p.depth()).unwrap_or(0),
            self.upload_pool.get().map(|p| p.depth()).unwrap_or(0),
        )
    }
}

/// Render a byte count for humans.
pub fn human_size(bytes: u64) -> String {
    const KIB: f64 = 1024.0;
    const MIB: f64 = 1024.0 * 1024.0;
    const GIB: f64 = 1024.0 * 1024.0 * 1024.0;
    let bytes = bytes as f64;
    if bytes >= GIB {
        format!("{:.2} GiB", bytes / GIB)
    } else if bytes >= MIB {
        format!("{:.1} MiB", bytes / MIB)
    } else if bytes >= KIB {
        format!("{:.0} KiB", bytes / KIB)
    } else {
        format!("{bytes:.0} B")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tolerance_bands() {
        const MIB: u64 = 1024 * 1024;
        assert_eq!(size_tolerance(512 * 1024), 10 * 1024);
        assert_eq!(size_tolerance(MIB), 10 * 1024);
        assert_eq!(size_tolerance(MIB + 1), MIB);
        assert_eq!(size_tolerance(10 * MIB), MIB);
    }

    #[test]
    fn tolerance_comparison() {
        const MIB: u64 = 1024 * 1024;
        let size = 10 * MIB;
        // 512 000 bytes over: inside the 1 MiB band.
        assert!(within_tolerance(size + 512_000, size));
        // 2 MiB over: outside.
        assert!(!within_tolerance(size + 2 * MIB, size));

        let small = 500 * 1024;
        assert!(within_tolerance(small + 9 * 1024, small));
        assert!(!within_tolerance(small + 11 * 1024, small));
    }

    #[test]
    fn error_status_codes() {
        assert_eq!(PipelineError::NotFound("x".into()).status_code(), 404);
        assert_eq!(PipelineError::NotLeader.status_code(), 503);
        assert_eq!(PipelineError::Transient("x".into()).status_code(), 503);
        assert_eq!(PipelineError::Permanent("x".into()).status_code(), 500);
        assert_eq!(PipelineError::Business("x".into()).status_code(), 500);
        assert_eq!(PipelineError::Cancelled.status_code(), 200);
    }

    #[test]
    fn cancelled_maps_to_acknowledged() {
        let response = WebhookResponse::from_error(&PipelineError::Cancelled);
        assert!(response.success);
        assert_eq!(response.status_code, 200);
    }

    #[test]
    fn client_error_mapping_follows_classifier() {
        let err: PipelineError = ClientError::new("request timed out").into();
        assert!(matches!(err, PipelineError::Transient(_)));

        let err: PipelineError = ClientError::with_code(406, "AUTH_KEY_DUPLICATED").into();
        assert!(matches!(err, PipelineError::Permanent(_)));
    }

    #[test]
    fn human_sizes() {
        assert_eq!(human_size(512), "512 B");
        assert_eq!(human_size(2048), "2 KiB");
        assert_eq!(human_size(10 * 1024 * 1024), "10.0 MiB");
    }
}
