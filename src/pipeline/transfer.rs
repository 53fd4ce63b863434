//! Download and upload stage execution
//!
//! Each stage runs under the task's cluster-wide lock. The download stage
//! tries the two fast paths first (remote sec-transfer probe, local cache
//! probe) before streaming bytes; the lock is always released before the
//! next stage's message is published so any instance can pick it up.

use super::{within_tolerance, CancelToken, PipelineError, TaskManager, WebhookResponse};
use crate::drive::DriveError;
use crate::limits::{with_retry, Priority};
use crate::models::{Task, TaskStatus};
use crate::protocol::{ChatMessage, ClientError};
use crate::queue::UploadMessage;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

/// What the download stage decided.
enum DownloadOutcome {
    /// Sec-transfer hit; the task is complete without a download
    Completed,
    /// Bytes are on disk; publish the upload stage
    ReadyForUpload(UploadMessage),
    /// The row reached a terminal state underneath us
    AlreadySettled(TaskStatus),
}

impl TaskManager {
    /// Download-phase worker entry: lock, run, release, then publish.
    pub(crate) async fn process_download(
        self: &Arc<Self>,
        task: Task,
        message: ChatMessage,
    ) -> WebhookResponse {
        match self.coordinator.acquire_task_lock(&task.id).await {
            Ok(true) => {}
            Ok(false) => {
                return WebhookResponse::from_error(&PipelineError::Transient(
                    "task lock held by another instance".into(),
                ))
            }
            Err(err) => return WebhookResponse::from_error(&err.into()),
        }

        let token = self.cancels.register(&task.id);
        let result = self.download_task(task.clone(), &message, &token).await;

        // Release before any enqueue so the upload webhook can re-acquire
        // on this or any other instance.
        if let Err(err) = self.coordinator.release_task_lock(&task.id).await {
            tracing::warn!(task_id = %task.id, error = %err, "task lock release failed");
        }

        match result {
            Ok(DownloadOutcome::Completed) => {
                self.settle(&task.id);
                WebhookResponse::ok_with("sec-transfer")
            }
            Ok(DownloadOutcome::ReadyForUpload(upload)) => {
                self.queue.enqueue_upload_task(upload).await;
                WebhookResponse::ok()
            }
            Ok(DownloadOutcome::AlreadySettled(status)) => {
                self.settle(&task.id);
                WebhookResponse::ok_with(format!("already {}", status.as_str()))
            }
            Err(err) => self.settle_error(&task, err).await,
        }
    }

    /// Upload-phase worker entry.
    pub(crate) async fn process_upload(self: &Arc<Self>, task: Task) -> WebhookResponse {
        match self.coordinator.acquire_task_lock(&task.id).await {
            Ok(true) => {}
            Ok(false) => {
                return WebhookResponse::from_error(&PipelineError::Transient(
                    "task lock held by another instance".into(),
                ))
            }
            Err(err) => return WebhookResponse::from_error(&err.into()),
        }

        let token = self.cancels.register(&task.id);
        let result = self.upload_task(&task, &token).await;

        if let Err(err) = self.coordinator.release_task_lock(&task.id).await {
            tracing::warn!(task_id = %task.id, error = %err, "task lock release failed");
        }

        match result {
            Ok(()) => {
                self.settle(&task.id);
                WebhookResponse::ok_with("uploaded")
            }
            Err(err) => self.settle_error(&task, err).await,
        }
    }

    /// Drop per-task bookkeeping once a task settles.
    fn settle(&self, task_id: &str) {
        self.cancels.remove(task_id);
        self.progress_marks.remove(task_id);
    }

    /// Map a stage error to its webhook response, marking the row failed
    /// only for permanent/business conditions. Transient errors leave the
    /// row untouched so redelivery can resume where the cluster left off.
    async fn settle_error(&self, task: &Task, err: PipelineError) -> WebhookResponse {
        match &err {
            PipelineError::Cancelled => {
                self.settle(&task.id);
                tracing::info!(task_id = %task.id, "stage observed cancellation");
            }
            _ if err.marks_failed() => {
                let reason = err.to_string();
                if let Err(write_err) = self
                    .repo
                    .update_status(&task.id, TaskStatus::Failed, Some(&reason))
                    .await
                {
                    tracing::warn!(task_id = %task.id, error = %write_err, "failed-status write failed");
                }
                self.edit_status(task, &format!("failed: {reason}")).await;
                self.settle(&task.id);
            }
            _ => {
                tracing::warn!(task_id = %task.id, error = %err, "transient stage failure; awaiting redelivery");
            }
        }
        WebhookResponse::from_error(&err)
    }

    /// The download state machine: sec-transfer probe, local cache probe,
    /// then the full network download.
    async fn download_task(
        self: &Arc<Self>,
        mut task: Task,
        message: &ChatMessage,
        token: &CancelToken,
    ) -> Result<DownloadOutcome, PipelineError> {
        if token.is_cancelled() {
            return Err(PipelineError::Cancelled);
        }

        let media = message
            .media
            .as_ref()
            .ok_or_else(|| PipelineError::Business("unsupported media".into()))?;
        let file_name = media.file_name.clone();
        let file_size = media.file_size;

        // a. Sec-transfer probe: a byte-size-equivalent remote file
        //    completes the task outright.
        let provider = self.provider_for_user(task.user_id).await?;
        self.limiter
            .acquire(Priority::Normal)
            .await
            .map_err(|e| PipelineError::Transient(e.to_string()))?;
        let user_id = task.user_id;
        let remote = with_retry(&self.config.retry, || {
            let provider = provider.clone();
            let file_name = file_name.clone();
            async move {
                tokio::time::timeout(
                    Duration::from_secs(15),
                    provider.get_remote_file_info(&file_name, user_id),
                )
                .await
                .map_err(|_| DriveError::Remote("remote probe timed out".into()))?
            }
        })
        .await?;

        if let Some(remote) = remote {
            if within_tolerance(remote.size, file_size) {
                tracing::info!(
                    task_id = %task.id,
                    file = %file_name,
                    remote_size = remote.size,
                    "sec-transfer hit"
                );
                self.repo
                    .update_status(&task.id, TaskStatus::Completed, None)
                    .await?;
                self.edit_status(&task, "already on drive").await;
                return Ok(DownloadOutcome::Completed);
            }
            tracing::debug!(
                task_id = %task.id,
                remote_size = remote.size,
                expected = file_size,
                "remote size outside tolerance; downloading"
            );
        }

        if token.is_cancelled() {
            return Err(PipelineError::Cancelled);
        }

        // b. Local cache probe: a previous run (or another task with the
        //    same dedup key) may have left the bytes on disk.
        let final_path = self.final_path(&file_name);
        if let Ok(meta) = tokio::fs::metadata(&final_path).await {
            if meta.is_file() && within_tolerance(meta.len(), file_size) {
                tracing::info!(task_id = %task.id, path = %final_path.display(), "local cache hit");
                self.repo
                    .set_local_path(&task.id, &final_path.to_string_lossy())
                    .await?;
                self.repo
                    .update_status(&task.id, TaskStatus::Downloaded, None)
                    .await?;
                self.edit_status(&task, "cached locally; uploading").await;
                return Ok(DownloadOutcome::ReadyForUpload(UploadMessage {
                    task_id: task.id.clone(),
                    user_id: task.user_id,
                    chat_id: task.chat_id,
                    msg_id: task.msg_id,
                    local_path: final_path.to_string_lossy().into_owned(),
                }));
            }
        }

        // c. Full download.
        if task.status == TaskStatus::Queued {
            let claimed = self
                .repo
                .claim(&task.id, self.coordinator.instance_id())
                .await?;
            if !claimed {
                let current = self
                    .repo
                    .find_by_id(&task.id)
                    .await?
                    .ok_or_else(|| PipelineError::NotFound("Task not found".into()))?;
                if current.status.is_terminal() {
                    return Ok(DownloadOutcome::AlreadySettled(current.status));
                }
            }
            task.status = TaskStatus::Downloading;
        } else {
            self.repo
                .update_status(&task.id, TaskStatus::Downloading, None)
                .await?;
        }

        tokio::fs::create_dir_all(&self.config.download_dir)
            .await
            .map_err(|e| PipelineError::Permanent(format!("download dir: {e}")))?;

        let temp_path = self.temp_path(&task.id);
        let progress: Arc<dyn Fn(u64, u64) + Send + Sync> = {
            let manager = Arc::clone(self);
            let task = task.clone();
            Arc::new(move |transferred, total| {
                manager.maybe_edit_progress(&task, transferred, total);
            })
        };

        let supervisor = self.supervisor.clone();
        let download_result = with_retry(&self.config.retry, || {
            let supervisor = supervisor.clone();
            let message = message.clone();
            let temp_path = temp_path.clone();
            let token = token.clone();
            let progress = progress.clone();
            async move {
                // Checked after each retry attempt as well as between
                // chunks inside the transport.
                if token.is_cancelled() {
                    return Err(ClientError::new("download cancelled"));
                }
                supervisor
                    .call(Priority::Background, || async {
                        supervisor
                            .transport()
                            .download_media(&message, &temp_path, Some(progress.as_ref()), &token)
                            .await
                    })
                    .await
            }
        })
        .await;

        if token.is_cancelled() {
            let _ = tokio::fs::remove_file(&temp_path).await;
            return Err(PipelineError::Cancelled);
        }
        let written = download_result.map_err(PipelineError::from)?;

        if !within_tolerance(written, file_size) {
            let _ = tokio::fs::remove_file(&temp_path).await;
            return Err(PipelineError::Business(format!(
                "size mismatch after download: got {written}, expected {file_size}"
            )));
        }

        // Atomic swap into the shared cache path; readers never observe a
        // partial file.
        tokio::fs::rename(&temp_path, &final_path)
            .await
            .map_err(|e| PipelineError::Permanent(format!("rename: {e}")))?;

        self.repo
            .set_local_path(&task.id, &final_path.to_string_lossy())
            .await?;
        self.repo
            .update_status(&task.id, TaskStatus::Downloaded, None)
            .await?;
        self.edit_status(&task, "downloaded; uploading").await;

        Ok(DownloadOutcome::ReadyForUpload(UploadMessage {
            task_id: task.id.clone(),
            user_id: task.user_id,
            chat_id: task.chat_id,
            msg_id: task.msg_id,
            local_path: final_path.to_string_lossy().into_owned(),
        }))
    }

    /// The upload stage: assert the local artifact, stream it to the
    /// user's drive, then clean up.
    async fn upload_task(
        self: &Arc<Self>,
        task: &Task,
        token: &CancelToken,
    ) -> Result<(), PipelineError> {
        if token.is_cancelled() {
            return Err(PipelineError::Cancelled);
        }

        let local_path = task
            .local_path
            .clone()
            .ok_or_else(|| PipelineError::NotFound("local file missing".into()))?;
        let meta = tokio::fs::metadata(&local_path)
            .await
            .map_err(|_| PipelineError::NotFound("local file missing".into()))?;

        if !within_tolerance(meta.len(), task.file_size) {
            return Err(PipelineError::Business(format!(
                "local size mismatch: got {}, expected {}",
                meta.len(),
                task.file_size
            )));
        }

        self.repo
            .update_status(&task.id, TaskStatus::Uploading, None)
            .await?;

        let provider = self.provider_for_user(task.user_id).await?;
        let upload_result = with_retry(&self.config.retry, || {
            let provider = provider.clone();
            let task = task.clone();
            let local_path = local_path.clone();
            let token = token.clone();
            let limiter = self.limiter.clone();
            async move {
                if token.is_cancelled() {
                    return Err(DriveError::Io("upload cancelled".into()));
                }
                limiter
                    .acquire(Priority::Background)
                    .await
                    .map_err(|e| DriveError::Remote(e.to_string()))?;
                provider.upload_file(&task, Path::new(&local_path)).await
            }
        })
        .await;

        if token.is_cancelled() {
            return Err(PipelineError::Cancelled);
        }
        upload_result?;

        self.repo
            .update_status(&task.id, TaskStatus::Completed, None)
            .await?;

        // Local artifact is expendable once the drive holds the bytes.
        if let Err(err) = tokio::fs::remove_file(&local_path).await {
            tracing::debug!(task_id = %task.id, error = %err, "local cleanup failed");
        }

        self.edit_status(task, "uploaded").await;
        tracing::info!(task_id = %task.id, file = %task.file_name, "transfer completed");
        Ok(())
    }
}
