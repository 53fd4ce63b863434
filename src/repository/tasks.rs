//! Task rows and the write-coalescing status buffer
//!
//! The store trait carries the CRUD/batch surface; `TaskRepository` wraps a
//! store and coalesces non-terminal status transitions for up to the flush
//! interval (or the batch cap). Terminal transitions flush immediately and
//! bypass the buffer. Buffered entries older than 30 minutes are discarded
//! rather than written stale.

use super::d1::{col_i64, col_opt_str, col_str, col_u64, D1Client};
use super::RepositoryError;
use crate::clock::Clock;
use crate::models::{Task, TaskStatus};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

/// One buffered (or batched) status transition.
#[derive(Debug, Clone)]
pub struct StatusUpdate {
    pub task_id: String,
    pub status: TaskStatus,
    pub error_msg: Option<String>,
    pub at: DateTime<Utc>,
}

/// Durable task table.
#[async_trait]
pub trait TaskStore: Send + Sync {
    async fn create(&self, task: &Task) -> Result<(), RepositoryError>;

    async fn create_batch(&self, tasks: &[Task]) -> Result<(), RepositoryError>;

    async fn find_by_id(&self, id: &str) -> Result<Option<Task>, RepositoryError>;

    /// Look up by the outbound status message.
    async fn find_by_msg_id(
        &self,
        chat_id: i64,
        msg_id: i64,
    ) -> Result<Option<Task>, RepositoryError>;

    async fn find_by_user(&self, user_id: i64, limit: u32) -> Result<Vec<Task>, RepositoryError>;

    async fn find_pending(
        &self,
        since: DateTime<Utc>,
        status: Option<TaskStatus>,
    ) -> Result<Vec<Task>, RepositoryError>;

    /// Dedup lookup over `(user_id, file_name, file_size)`.
    async fn find_completed_by_file(
        &self,
        user_id: i64,
        file_name: &str,
        file_size: u64,
    ) -> Result<Option<Task>, RepositoryError>;

    async fn update_status(
        &self,
        id: &str,
        status: TaskStatus,
        error_msg: Option<&str>,
    ) -> Result<(), RepositoryError>;

    async fn update_status_batch(&self, updates: &[StatusUpdate]) -> Result<(), RepositoryError>;

    async fn set_local_path(&self, id: &str, local_path: &str) -> Result<(), RepositoryError>;

    /// CAS `queued -> downloading` scoped to the claiming instance.
    /// Returns whether this call won the claim.
    async fn claim(&self, id: &str, instance_id: &str) -> Result<bool, RepositoryError>;
}

// ============================================================================
// D1 implementation
// ============================================================================

fn row_to_task(row: &Value) -> Result<Task, RepositoryError> {
    let status = TaskStatus::from_str(&col_str(row, "status")?)
        .map_err(RepositoryError::Decode)?;
    let parse_time = |name: &str| -> Result<DateTime<Utc>, RepositoryError> {
        DateTime::parse_from_rfc3339(&col_str(row, name)?)
            .map(|t| t.with_timezone(&Utc))
            .map_err(|e| RepositoryError::Decode(format!("{name}: {e}")))
    };

    Ok(Task {
        id: col_str(row, "id")?,
        user_id: col_i64(row, "user_id")?,
        chat_id: col_i64(row, "chat_id")?,
        msg_id: col_i64(row, "msg_id")?,
        source_msg_id: col_i64(row, "source_msg_id")?,
        file_name: col_str(row, "file_name")?,
        file_size: col_u64(row, "file_size")?,
        status,
        error_msg: col_opt_str(row, "error_msg"),
        group_id: col_opt_str(row, "group_id"),
        local_path: col_opt_str(row, "local_path"),
        created_at: parse_time("created_at")?,
        updated_at: parse_time("updated_at")?,
    })
}

fn task_params(task: &Task) -> Vec<Value> {
    vec![
        json!(task.id),
        json!(task.user_id),
        json!(task.chat_id),
        json!(task.msg_id),
        json!(task.source_msg_id),
        json!(task.file_name),
        json!(task.file_size),
        json!(task.status.as_str()),
        json!(task.error_msg),
        json!(task.group_id),
        json!(task.local_path),
        json!(task.created_at.to_rfc3339()),
        json!(task.updated_at.to_rfc3339()),
    ]
}

const INSERT_SQL: &str = "INSERT INTO tasks \
    (id, user_id, chat_id, msg_id, source_msg_id, file_name, file_size, status, \
     error_msg, group_id, local_path, created_at, updated_at) \
    VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)";

/// D1-backed task store.
pub struct D1TaskStore {
    d1: D1Client,
}

impl D1TaskStore {
    pub fn new(d1: D1Client) -> Self {
        Self { d1 }
    }
}

#[async_trait]
impl TaskStore for D1TaskStore {
    async fn create(&self, task: &Task) -> Result<(), RepositoryError> {
        self.d1.exec(INSERT_SQL, &task_params(task)).await
    }

    async fn create_batch(&self, tasks: &[Task]) -> Result<(), RepositoryError> {
        for task in tasks {
            self.d1.exec(INSERT_SQL, &task_params(task)).await?;
        }
        Ok(())
    }

    async fn find_by_id(&self, id: &str) -> Result<Option<Task>, RepositoryError> {
        let rows = self
            .d1
            .query("SELECT * FROM tasks WHERE id = ? LIMIT 1", &[json!(id)])
            .await?;
        rows.first().map(row_to_task).transpose()
    }

    async fn find_by_msg_id(
        &self,
        chat_id: i64,
        msg_id: i64,
    ) -> Result<Option<Task>, RepositoryError> {
        let rows = self
            .d1
            .query(
                "SELECT * FROM tasks WHERE chat_id = ? AND msg_id = ? LIMIT 1",
                &[json!(chat_id), json!(msg_id)],
            )
            .await?;
        rows.first().map(row_to_task).transpose()
    }

    async fn find_by_user(&self, user_id: i64, limit: u32) -> Result<Vec<Task>, RepositoryError> {
        let rows = self
            .d1
            .query(
                "SELECT * FROM tasks WHERE user_id = ? ORDER BY created_at DESC LIMIT ?",
                &[json!(user_id), json!(limit)],
            )
            .await?;
        rows.iter().map(row_to_task).collect()
    }

    async fn find_pending(
        &self,
        since: DateTime<Utc>,
        status: Option<TaskStatus>,
    ) -> Result<Vec<Task>, RepositoryError> {
        let rows = match status {
            Some(status) => {
                self.d1
                    .query(
                        "SELECT * FROM tasks WHERE created_at >= ? AND status = ? \
                         ORDER BY created_at ASC",
                        &[json!(since.to_rfc3339()), json!(status.as_str())],
                    )
                    .await?
            }
            None => {
                self.d1
                    .query(
                        "SELECT * FROM tasks WHERE created_at >= ? AND status IN \
                         ('queued', 'downloading', 'downloaded', 'uploading') \
                         ORDER BY created_at ASC",
                        &[json!(since.to_rfc3339())],
                    )
                    .await?
            }
        };
        rows.iter().map(row_to_task).collect()
    }

    async fn find_completed_by_file(
        &self,
        user_id: i64,
        file_name: &str,
        file_size: u64,
    ) -> Result<Option<Task>, RepositoryError> {
        let rows = self
            .d1
            .query(
                "SELECT * FROM tasks WHERE user_id = ? AND file_name = ? AND file_size = ? \
                 AND status = 'completed' LIMIT 1",
                &[json!(user_id), json!(file_name), json!(file_size)],
            )
            .await?;
        rows.first().map(row_to_task).transpose()
    }

    async fn update_status(
        &self,
        id: &str,
        status: TaskStatus,
        error_msg: Option<&str>,
    ) -> Result<(), RepositoryError> {
        self.d1
            .exec(
                "UPDATE tasks SET status = ?, error_msg = ?, updated_at = ? WHERE id = ?",
                &[
                    json!(status.as_str()),
                    json!(error_msg),
                    json!(Utc::now().to_rfc3339()),
                    json!(id),
                ],
            )
            .await
    }

    async fn update_status_batch(&self, updates: &[StatusUpdate]) -> Result<(), RepositoryError> {
        for update in updates {
            self.d1
                .exec(
                    "UPDATE tasks SET status = ?, error_msg = ?, updated_at = ? WHERE id = ?",
                    &[
                        json!(update.status.as_str()),
                        json!(update.error_msg),
                        json!(update.at.to_rfc3339()),
                        json!(update.task_id),
                    ],
                )
                .await?;
        }
        Ok(())
    }

    async fn set_local_path(&self, id: &str, local_path: &str) -> Result<(), RepositoryError> {
        self.d1
            .exec(
                "UPDATE tasks SET local_path = ?, updated_at = ? WHERE id = ?",
                &[
                    json!(local_path),
                    json!(Utc::now().to_rfc3339()),
                    json!(id),
                ],
            )
            .await
    }

    async fn claim(&self, id: &str, _instance_id: &str) -> Result<bool, RepositoryError> {
        let rows = self
            .d1
            .query(
                "UPDATE tasks SET status = 'downloading', updated_at = ? \
                 WHERE id = ? AND status = 'queued' RETURNING id",
                &[json!(Utc::now().to_rfc3339()), json!(id)],
            )
            .await?;
        Ok(!rows.is_empty())
    }
}

// ============================================================================
// In-memory implementation (tests, single-node runs)
// ============================================================================

/// In-memory task store.
#[derive(Default)]
pub struct MemoryTaskStore {
    tasks: Mutex<HashMap<String, Task>>,
}

impl MemoryTaskStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.tasks.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.lock().is_empty()
    }
}

#[async_trait]
impl TaskStore for MemoryTaskStore {
    async fn create(&self, task: &Task) -> Result<(), RepositoryError> {
        self.tasks.lock().insert(task.id.clone(), task.clone());
        Ok(())
    }

    async fn create_batch(&self, tasks: &[Task]) -> Result<(), RepositoryError> {
        let mut map = self.tasks.lock();
        for task in tasks {
            map.insert(task.id.clone(), task.clone());
        }
        Ok(())
    }

    async fn find_by_id(&self, id: &str) -> Result<Option<Task>, RepositoryError> {
        Ok(self.tasks.lock().get(id).cloned())
    }

    async fn find_by_msg_id(
        &self,
        chat_id: i64,
        msg_id: i64,
    ) -> Result<Option<Task>, RepositoryError> {
        Ok(self
            .tasks
            .lock()
            .values()
            .find(|t| t.chat_id == chat_id && t.msg_id == msg_id)
            .cloned())
    }

    async fn find_by_user(&self, user_id: i64, limit: u32) -> Result<Vec<Task>, RepositoryError> {
        let mut tasks: Vec<Task> = self
            .tasks
            .lock()
            .values()
            .filter(|t| t.user_id == user_id)
            .cloned()
            .collect();
        tasks.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        tasks.truncate(limit as usize);
        Ok(tasks)
    }

    async fn find_pending(
        &self,
        since: DateTime<Utc>,
        status: Option<TaskStatus>,
    ) -> Result<Vec<Task>, RepositoryError> {
        let mut tasks: Vec<Task> = self
            .tasks
            .lock()
            .values()
            .filter(|t| t.created_at >= since)
            .filter(|t| match status {
                Some(status) => t.status == status,
                None => !t.status.is_terminal(),
            })
            .cloned()
            .collect();
        tasks.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(tasks)
    }

    async fn find_completed_by_file(
        &self,
        user_id: i64,
        file_name: &str,
        file_size: u64,
    ) -> Result<Option<Task>, RepositoryError> {
        Ok(self
            .tasks
            .lock()
            .values()
            .find(|t| {
                t.user_id == user_id
                    && t.file_name == file_name
                    && t.file_size == file_size
                    && t.status == TaskStatus::Completed
            })
            .cloned())
    }

    async fn update_status(
        &self,
        id: &str,
        status: TaskStatus,
        error_msg: Option<&str>,
    ) -> Result<(), RepositoryError> {
        let mut tasks = self.tasks.lock();
        let task = tasks
            .get_mut(id)
            .ok_or_else(|| RepositoryError::NotFound(id.to_string()))?;
        task.status = status;
        task.error_msg = error_msg.map(|s| s.to_string());
        task.updated_at = Utc::now();
        Ok(())
    }

    async fn update_status_batch(&self, updates: &[StatusUpdate]) -> Result<(), RepositoryError> {
        let mut tasks = self.tasks.lock();
        for update in updates {
            if let Some(task) = tasks.get_mut(&update.task_id) {
                task.status = update.status;
                task.error_msg = update.error_msg.clone();
                task.updated_at = update.at;
            }
        }
        Ok(())
    }

    async fn set_local_path(&self, id: &str, local_path: &str) -> Result<(), RepositoryError> {
        let mut tasks = self.tasks.lock();
        let task = tasks
            .get_mut(id)
            .ok_or_else(|| RepositoryError::NotFound(id.to_string()))?;
        task.local_path = Some(local_path.to_string());
        task.updated_at = Utc::now();
        Ok(())
    }

    async fn claim(&self, id: &str, _instance_id: &str) -> Result<bool, RepositoryError> {
        let mut tasks = self.tasks.lock();
        match tasks.get_mut(id) {
            Some(task) if task.status == TaskStatus::Queued => {
                task.status = TaskStatus::Downloading;
                task.updated_at = Utc::now();
                Ok(true)
            }
            Some(_) => Ok(false),
            None => Err(RepositoryError::NotFound(id.to_string())),
        }
    }
}

// ============================================================================
// Coalescing repository
// ============================================================================

/// Buffer tuning.
#[derive(Debug, Clone)]
pub struct TaskRepositoryConfig {
    pub flush_interval: Duration,
    pub batch_max: usize,
    /// Buffered entries older than this are discarded at flush
    pub max_entry_age: Duration,
}

impl Default for TaskRepositoryConfig {
    fn default() -> Self {
        Self {
            flush_interval: Duration::from_secs(1),
            batch_max: 25,
            max_entry_age: Duration::from_secs(30 * 60),
        }
    }
}

#[derive(Debug, Clone)]
struct BufferedUpdate {
    status: TaskStatus,
    error_msg: Option<String>,
    at: DateTime<Utc>,
    buffered_at_secs: u64,
}

/// Task repository with write coalescing for non-terminal transitions.
pub struct TaskRepository {
    store: Arc<dyn TaskStore>,
    buffer: Mutex<HashMap<String, BufferedUpdate>>,
    config: TaskRepositoryConfig,
    clock: Arc<dyn Clock>,
}

impl TaskRepository {
    pub fn new(
        store: Arc<dyn TaskStore>,
        clock: Arc<dyn Clock>,
        config: TaskRepositoryConfig,
    ) -> Self {
        Self {
            store,
            buffer: Mutex::new(HashMap::new()),
            config,
            clock,
        }
    }

    pub fn store(&self) -> Arc<dyn TaskStore> {
        self.store.clone()
    }

    pub async fn create(&self, task: &Task) -> Result<(), RepositoryError> {
        self.store.create(task).await
    }

    pub async fn create_batch(&self, tasks: &[Task]) -> Result<(), RepositoryError> {
        self.store.create_batch(tasks).await
    }

    /// Read a task, overlaying any buffered status so callers observe
    /// their own writes.
    pub async fn find_by_id(&self, id: &str) -> Result<Option<Task>, RepositoryError> {
        let mut task = self.store.find_by_id(id).await?;
        if let Some(task) = task.as_mut() {
            if let Some(buffered) = self.buffer.lock().get(id) {
                task.status = buffered.status;
                task.error_msg = buffered.error_msg.clone();
                task.updated_at = buffered.at;
            }
        }
        Ok(task)
    }

    pub async fn find_by_msg_id(
        &self,
        chat_id: i64,
        msg_id: i64,
    ) -> Result<Option<Task>, RepositoryError> {
        self.store.find_by_msg_id(chat_id, msg_id).await
    }

    pub async fn find_by_user(
        &self,
        user_id: i64,
        limit: u32,
    ) -> Result<Vec<Task>, RepositoryError> {
        self.store.find_by_user(user_id, limit).await
    }

    pub async fn find_pending(
        &self,
        since: DateTime<Utc>,
        status: Option<TaskStatus>,
    ) -> Result<Vec<Task>, RepositoryError> {
        self.store.find_pending(since, status).await
    }

    pub async fn find_completed_by_file(
        &self,
        user_id: i64,
        file_name: &str,
        file_size: u64,
    ) -> Result<Option<Task>, RepositoryError> {
        self.store
            .find_completed_by_file(user_id, file_name, file_size)
            .await
    }

    pub async fn set_local_path(&self, id: &str, local_path: &str) -> Result<(), RepositoryError> {
        self.store.set_local_path(id, local_path).await
    }

    pub async fn claim(&self, id: &str, instance_id: &str) -> Result<bool, RepositoryError> {
        self.store.claim(id, instance_id).await
    }

    /// Terminal cancellation shortcut.
    pub async fn mark_cancelled(&self, id: &str) -> Result<(), RepositoryError> {
        self.update_status(id, TaskStatus::Cancelled, None).await
    }

    /// Record a status transition. Terminal transitions bypass the buffer
    /// and hit the store immediately; everything else coalesces.
    pub async fn update_status(
        &self,
        id: &str,
        status: TaskStatus,
        error_msg: Option<&str>,
    ) -> Result<(), RepositoryError> {
        if status.is_terminal() {
            // Any pending buffered write is superseded.
            self.buffer.lock().remove(id);
            return self.store.update_status(id, status, error_msg).await;
        }

        let over_capacity = {
            let mut buffer = self.buffer.lock();
            buffer.insert(
                id.to_string(),
                BufferedUpdate {
                    status,
                    error_msg: error_msg.map(|s| s.to_string()),
                    at: Utc::now(),
                    buffered_at_secs: self.clock.now_secs(),
                },
            );
            buffer.len() >= self.config.batch_max
        };

        if over_capacity {
            self.flush().await;
        }
        Ok(())
    }

    /// Drain the buffer into one batch write. Stale entries are dropped.
    pub async fn flush(&self) {
        let drained: Vec<(String, BufferedUpdate)> = {
            let mut buffer = self.buffer.lock();
            buffer.drain().collect()
        };
        if drained.is_empty() {
            return;
        }

        let now_secs = self.clock.now_secs();
        let max_age = self.config.max_entry_age.as_secs();
        let mut updates = Vec::with_capacity(drained.len());
        for (task_id, buffered) in drained {
            if now_secs.saturating_sub(buffered.buffered_at_secs) > max_age {
                tracing::warn!(task_id, "dropping stale buffered status update");
                continue;
            }
            updates.push(StatusUpdate {
                task_id,
                status: buffered.status,
                error_msg: buffered.error_msg,
                at: buffered.at,
            });
        }

        if updates.is_empty() {
            return;
        }
        if let Err(err) = self.store.update_status_batch(&updates).await {
            tracing::warn!(error = %err, count = updates.len(), "status batch write failed");
        }
    }

    /// Periodic flush driver; spawned by the composition root.
    pub async fn run_flush_loop(self: Arc<Self>) {
        let mut ticker = tokio::time::interval(self.config.flush_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            self.flush().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;

    fn repository() -> (Arc<MemoryTaskStore>, TaskRepository, Arc<ManualClock>) {
        let store = Arc::new(MemoryTaskStore::new());
        let clock = Arc::new(ManualClock::new(1_000_000_000));
        let repo = TaskRepository::new(
            store.clone(),
            clock.clone(),
            TaskRepositoryConfig::default(),
        );
        (store, repo, clock)
    }

    fn sample_task() -> Task {
        Task::new(7, 100, 200, 199, "video.mp4".into(), 10 * 1024 * 1024)
    }

    #[tokio::test]
    async fn non_terminal_updates_coalesce_until_flush() {
        let (store, repo, _) = repository();
        let task = sample_task();
        repo.create(&task).await.unwrap();

        repo.update_status(&task.id, TaskStatus::Downloading, None)
            .await
            .unwrap();

        // Store still has the old status; the repository overlays.
        assert_eq!(
            store.find_by_id(&task.id).await.unwrap().unwrap().status,
            TaskStatus::Queued
        );
        assert_eq!(
            repo.find_by_id(&task.id).await.unwrap().unwrap().status,
            TaskStatus::Downloading
        );

        repo.flush().await;
        assert_eq!(
            store.find_by_id(&task.id).await.unwrap().unwrap().status,
            TaskStatus::Downloading
        );
    }

    #[tokio::test]
    async fn terminal_updates_bypass_the_buffer() {
        let (store, repo, _) = repository();
        let task = sample_task();
        repo.create(&task).await.unwrap();

        repo.update_status(&task.id, TaskStatus::Downloading, None)
            .await
            .unwrap();
        repo.update_status(&task.id, TaskStatus::Failed, Some("boom"))
            .await
            .unwrap();

        let stored = store.find_by_id(&task.id).await.unwrap().unwrap();
        assert_eq!(stored.status, TaskStatus::Failed);
        assert_eq!(stored.error_msg.as_deref(), Some("boom"));

        // The superseded buffered entry must not resurrect the task.
        repo.flush().await;
        assert_eq!(
            store.find_by_id(&task.id).await.unwrap().unwrap().status,
            TaskStatus::Failed
        );
    }

    #[tokio::test]
    async fn stale_buffered_entries_are_discarded() {
        let (store, repo, clock) = repository();
        let task = sample_task();
        repo.create(&task).await.unwrap();

        repo.update_status(&task.id, TaskStatus::Downloading, None)
            .await
            .unwrap();

        clock.advance_secs(31 * 60);
        repo.flush().await;

        assert_eq!(
            store.find_by_id(&task.id).await.unwrap().unwrap().status,
            TaskStatus::Queued
        );
    }

    #[tokio::test]
    async fn batch_cap_triggers_inline_flush() {
        let store = Arc::new(MemoryTaskStore::new());
        let repo = TaskRepository::new(
            store.clone(),
            Arc::new(ManualClock::new(0)),
            TaskRepositoryConfig {
                batch_max: 2,
                ..Default::default()
            },
        );

        let a = sample_task();
        let b = sample_task();
        repo.create(&a).await.unwrap();
        repo.create(&b).await.unwrap();

        repo.update_status(&a.id, TaskStatus::Downloading, None)
            .await
            .unwrap();
        repo.update_status(&b.id, TaskStatus::Downloading, None)
            .await
            .unwrap();

        // Cap reached: both already written.
        assert_eq!(
            store.find_by_id(&a.id).await.unwrap().unwrap().status,
            TaskStatus::Downloading
        );
        assert_eq!(
            store.find_by_id(&b.id).await.unwrap().unwrap().status,
            TaskStatus::Downloading
        );
    }

    #[tokio::test]
    async fn claim_is_single_winner() {
        let (store, repo, _) = repository();
        let task = sample_task();
        repo.create(&task).await.unwrap();

        assert!(repo.claim(&task.id, "i-1").await.unwrap());
        assert!(!repo.claim(&task.id, "i-2").await.unwrap());
        assert_eq!(
            store.find_by_id(&task.id).await.unwrap().unwrap().status,
            TaskStatus::Downloading
        );
    }

    #[tokio::test]
    async fn dedup_lookup_matches_completed_only() {
        let (_, repo, _) = repository();
        let mut task = sample_task();
        repo.create(&task).await.unwrap();

        assert!(repo
            .find_completed_by_file(7, "video.mp4", task.file_size)
            .await
            .unwrap()
            .is_none());

        repo.update_status(&task.id, TaskStatus::Completed, None)
            .await
            .unwrap();
        task.status = TaskStatus::Completed;

        let found = repo
            .find_completed_by_file(7, "video.mp4", task.file_size)
            .await
            .unwrap();
        assert_eq!(found.map(|t| t.id), Some(task.id));
    }
}
