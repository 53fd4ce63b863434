//! Event dispatch
//!
//! Inbound chat events route through here: leader gate first, then the
//! global access guard, then by kind. Callback payloads are prefix-encoded
//! strings; messages split into session input (drive config flow), media
//! (task creation, with album aggregation), and commands.

pub mod flow;
pub mod groups;
pub mod guard;

pub use flow::DriveConfigFlow;
pub use groups::{GroupAggregator, GroupAggregatorConfig, GroupBatch};
pub use guard::AuthGuard;

use crate::coordinator::{InstanceCoordinator, LEADER_LOCK};
use crate::drive::DriveProviderFactory;
use crate::limits::Priority;
use crate::models::TaskStatus;
use crate::pipeline::TaskManager;
use crate::protocol::{CallbackQuery, ChatEvent, ChatMessage, ClientSupervisor};
use crate::repository::{DriveStore, TaskRepository};
use std::sync::Arc;
use std::time::Duration;

const FILES_PAGE_SIZE: usize = 10;

/// Normalized event context.
#[derive(Debug, Clone)]
pub struct EventContext {
    pub user_id: i64,
    pub chat_id: i64,
    pub is_callback: bool,
    pub query_id: Option<String>,
}

/// Pull the guard-relevant fields out of an event.
pub fn extract_context(event: &ChatEvent) -> EventContext {
    match event {
        ChatEvent::Message(message) => EventContext {
            user_id: message.sender_id,
            chat_id: message.chat_id,
            is_callback: false,
            query_id: None,
        },
        ChatEvent::Callback(query) => EventContext {
            user_id: query.user_id,
            chat_id: query.chat_id,
            is_callback: true,
            query_id: Some(query.query_id.clone()),
        },
    }
}

/// Decoded callback payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CallbackAction {
    Cancel(String),
    DriveAdd,
    DriveList,
    DriveSetDefault(String),
    DriveDelete(String),
    FilesPage(usize),
    ManagerBack,
    Unknown(String),
}

/// Parse a prefix-encoded callback payload.
pub fn parse_callback(data: &str) -> CallbackAction {
    if let Some(task_id) = data.strip_prefix("cancel_") {
        return CallbackAction::Cancel(task_id.to_string());
    }
    if data == "drive_add" {
        return CallbackAction::DriveAdd;
    }
    if data == "drive_list" {
        return CallbackAction::DriveList;
    }
    if let Some(drive_id) = data.strip_prefix("drive_default_") {
        return CallbackAction::DriveSetDefault(drive_id.to_string());
    }
    if let Some(drive_id) = data.strip_prefix("drive_del_") {
        return CallbackAction::DriveDelete(drive_id.to_string());
    }
    if let Some(page) = data.strip_prefix("files_") {
        if let Ok(page) = page.parse() {
            return CallbackAction::FilesPage(page);
        }
    }
    if data == "manager_back" {
        return CallbackAction::ManagerBack;
    }
    CallbackAction::Unknown(data.to_string())
}

/// Inbound event router.
pub struct Dispatcher {
    supervisor: Arc<ClientSupervisor>,
    coordinator: Arc<InstanceCoordinator>,
    manager: Arc<TaskManager>,
    guard: AuthGuard,
    flow: Arc<DriveConfigFlow>,
    groups: GroupAggregator,
    drives: Arc<dyn DriveStore>,
    factory: Arc<DriveProviderFactory>,
    repo: Arc<TaskRepository>,
}

impl Dispatcher {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        supervisor: Arc<ClientSupervisor>,
        coordinator: Arc<InstanceCoordinator>,
        manager: Arc<TaskManager>,
        guard: AuthGuard,
        flow: Arc<DriveConfigFlow>,
        drives: Arc<dyn DriveStore>,
        factory: Arc<DriveProviderFactory>,
        repo: Arc<TaskRepository>,
        group_config: GroupAggregatorConfig,
    ) -> Self {
        let batch_manager = Arc::downgrade(&manager);
        let groups = GroupAggregator::new(group_config, move |batch: GroupBatch| {
            let manager = batch_manager.clone();
            async move {
                let Some(manager) = manager.upgrade() else { return };
                if let Err(err) = manager
                    .add_batch_tasks(&batch.group_id, batch.user_id, batch.chat_id, &batch.messages)
                    .await
                {
                    tracing::warn!(group_id = %batch.group_id, error = %err, "batch ingest failed");
                }
            }
        });

        Self {
            supervisor,
            coordinator,
            manager,
            guard,
            flow,
            groups,
            drives,
            factory,
            repo,
        }
    }

    /// Event-ingest loop; pulls from the transport while leading.
    pub async fn run(self: Arc<Self>) {
        loop {
            if !self.coordinator.has_lock(LEADER_LOCK).await {
                tokio::time::sleep(Duration::from_secs(2)).await;
                continue;
            }

            match self.supervisor.transport().next_event().await {
                Ok(Some(event)) => self.handle_event(event).await,
                Ok(None) => {}
                Err(err) => {
                    tracing::debug!(error = %err, "event poll failed");
                    tokio::time::sleep(Duration::from_secs(1)).await;
                }
            }
        }
    }

    /// Route one event: leader gate, global guard, then by kind.
    pub async fn handle_event(&self, event: ChatEvent) {
        if !self.coordinator.has_lock(LEADER_LOCK).await {
            tracing::debug!("dropping event; not leader");
            return;
        }

        let ctx = extract_context(&event);
        if !self.guard.allow(ctx.user_id).await {
            tracing::debug!(user_id = ctx.user_id, "blocked by access guard");
            if let Some(query_id) = &ctx.query_id {
                self.answer(query_id, "Access denied").await;
            }
            return;
        }

        match event {
            ChatEvent::Callback(query) => self.handle_callback(query).await,
            ChatEvent::Message(message) => self.handle_message(message).await,
        }
    }

    async fn handle_message(&self, message: ChatMessage) {
        let user_id = message.sender_id;
        let chat_id = message.chat_id;

        if message.media.is_some() {
            match message.grouped_id.clone() {
                Some(group_id) => {
                    self.groups.add(&group_id, user_id, chat_id, message);
                }
                None => {
                    if let Err(err) = self.manager.add_task(user_id, chat_id, &message).await {
                        tracing::warn!(error = %err, "task creation failed");
                        self.say(chat_id, &format!("Cannot transfer this: {err}")).await;
                    }
                }
            }
            return;
        }

        let text = message.text.trim().to_string();

        // An open config session consumes plain input.
        if self.flow.handle_input(user_id, chat_id, &text).await {
            return;
        }

        if text.starts_with('/') {
            self.handle_command(user_id, chat_id, &text).await;
        }
    }

    async fn handle_command(&self, user_id: i64, chat_id: i64, text: &str) {
        let mut parts = text.split_whitespace();
        let command = parts.next().unwrap_or_default();
        let arg = parts.next();

        match command {
            "/start" => {
                self.say(
                    chat_id,
                    "Send me media and I will move it to your cloud drive.\n\
                     /drive - bind or manage drives\n\
                     /files - browse your drive\n\
                     /status - your transfers\n\
                     /cancel - cancel a transfer\n\
                     /unbind - remove all drives",
                )
                .await;
            }
            "/drive" => self.command_drive(user_id, chat_id).await,
            "/files" => self.render_files_page(user_id, chat_id, 0).await,
            "/status" => self.command_status(user_id, chat_id).await,
            "/unbind" => self.command_unbind(user_id, chat_id).await,
            "/cancel" => self.command_cancel(user_id, chat_id, arg).await,
            other => {
                tracing::debug!(command = other, "unknown command");
                self.say(chat_id, "Unknown command; see /start").await;
            }
        }
    }

    async fn command_drive(&self, user_id: i64, chat_id: i64) {
        match self.drives.list_by_user(user_id).await {
            Ok(drives) if !drives.is_empty() => {
                let mut lines = vec!["Your drives:".to_string()];
                for drive in &drives {
                    lines.push(format!(
                        "- {} ({}){}",
                        drive.name,
                        drive.drive_type.as_str(),
                        if drive.is_default { " [default]" } else { "" }
                    ));
                }
                lines.push("Reply with a type to bind another.".into());
                self.say(chat_id, &lines.join("\n")).await;
                self.flow.start(user_id, chat_id).await;
            }
            Ok(_) => self.flow.start(user_id, chat_id).await,
            Err(err) => {
                tracing::warn!(error = %err, "drive list failed");
                self.say(chat_id, "Drive lookup failed; try again later").await;
            }
        }
    }

    async fn command_status(&self, user_id: i64, chat_id: i64) {
        match self.repo.find_by_user(user_id, 10).await {
            Ok(tasks) if !tasks.is_empty() => {
                let (download_depth, upload_depth) = self.manager.queue_depths();
                let mut lines = vec![format!(
                    "Queues: {download_depth} downloading, {upload_depth} uploading"
                )];
                for task in tasks {
                    let note = match (&task.status, &task.error_msg) {
                        (TaskStatus::Failed, Some(reason)) => format!(" ({reason})"),
                        _ => String::new(),
                    };
                    lines.push(format!(
                        "- {} [{}]{}",
                        task.file_name,
                        task.status.as_str(),
                        note
                    ));
                }
                self.say(chat_id, &lines.join("\n")).await;
            }
            Ok(_) => self.say(chat_id, "No transfers yet").await,
            Err(err) => {
                tracing::warn!(error = %err, "status lookup failed");
                self.say(chat_id, "Status lookup failed; try again later").await;
            }
        }
    }

    async fn command_unbind(&self, user_id: i64, chat_id: i64) {
        match self.drives.delete_all(user_id).await {
            Ok(0) => self.say(chat_id, "No drives bound").await,
            Ok(count) => {
                self.say(chat_id, &format!("Removed {count} drive binding(s)")).await
            }
            Err(err) => {
                tracing::warn!(error = %err, "unbind failed");
                self.say(chat_id, "Unbind failed; try again later").await;
            }
        }
    }

    async fn command_cancel(&self, user_id: i64, chat_id: i64, arg: Option<&str>) {
        let task_id = match arg {
            Some(task_id) => Some(task_id.to_string()),
            None => {
                // Default to the newest active transfer.
                match self.repo.find_by_user(user_id, 10).await {
                    Ok(tasks) => tasks
                        .into_iter()
                        .find(|t| !t.status.is_terminal())
                        .map(|t| t.id),
                    Err(_) => None,
                }
            }
        };

        let Some(task_id) = task_id else {
            self.say(chat_id, "Nothing to cancel").await;
            return;
        };

        match self
            .manager
            .cancel_task(&task_id, user_id, self.guard.is_owner(user_id))
            .await
        {
            Ok(()) => {}
            Err(err) => self.say(chat_id, &format!("Cancel failed: {err}")).await,
        }
    }

    async fn handle_callback(&self, query: CallbackQuery) {
        let action = parse_callback(&query.data);
        tracing::debug!(user_id = query.user_id, ?action, "callback");

        match action {
            CallbackAction::Cancel(task_id) => {
                let result = self
                    .manager
                    .cancel_task(&task_id, query.user_id, self.guard.is_owner(query.user_id))
                    .await;
                let reply = match result {
                    Ok(()) => "Cancelled".to_string(),
                    Err(err) => format!("Cancel failed: {err}"),
                };
                self.answer(&query.query_id, &reply).await;
            }
            CallbackAction::DriveAdd => {
                self.answer(&query.query_id, "Starting drive setup").await;
                self.flow.start(query.user_id, query.chat_id).await;
            }
            CallbackAction::DriveList => {
                self.answer(&query.query_id, "").await;
                self.command_drive(query.user_id, query.chat_id).await;
            }
            CallbackAction::DriveSetDefault(drive_id) => {
                let reply = match self.drives.set_default(query.user_id, &drive_id).await {
                    Ok(()) => "Default drive updated",
                    Err(_) => "Update failed",
                };
                self.answer(&query.query_id, reply).await;
            }
            CallbackAction::DriveDelete(drive_id) => {
                let reply = match self.drives.delete(query.user_id, &drive_id).await {
                    Ok(()) => "Drive removed",
                    Err(_) => "Removal failed",
                };
                self.answer(&query.query_id, reply).await;
            }
            CallbackAction::FilesPage(page) => {
                self.answer(&query.query_id, "").await;
                self.render_files_page(query.user_id, query.chat_id, page).await;
            }
            CallbackAction::ManagerBack => {
                self.answer(&query.query_id, "").await;
                self.say(query.chat_id, "Back to the main menu; see /start").await;
            }
            CallbackAction::Unknown(data) => {
                tracing::warn!(data = %data, "unknown callback payload");
                self.answer(&query.query_id, "Unknown action").await;
            }
        }
    }

    /// Render one page of the user's remote files.
    async fn render_files_page(&self, user_id: i64, chat_id: i64, page: usize) {
        let drive = match self.drives.find_default(user_id).await {
            Ok(Some(drive)) => drive,
            Ok(None) => {
                self.say(chat_id, "No drive bound; use /drive first").await;
                return;
            }
            Err(err) => {
                tracing::warn!(error = %err, "drive lookup failed");
                self.say(chat_id, "Drive lookup failed; try again later").await;
                return;
            }
        };

        let provider = match self.factory.create(&drive) {
            Ok(provider) => provider,
            Err(err) => {
                self.say(chat_id, &format!("Drive unavailable: {err}")).await;
                return;
            }
        };

        match provider.list_remote_files(user_id, "/").await {
            Ok(entries) if !entries.is_empty() => {
                let pages = entries.len().div_ceil(FILES_PAGE_SIZE);
                let page = page.min(pages.saturating_sub(1));
                let start = page * FILES_PAGE_SIZE;
                let mut lines = vec![format!(
                    "{} - files (page {}/{})",
                    drive.name,
                    page + 1,
                    pages
                )];
                for entry in entries.iter().skip(start).take(FILES_PAGE_SIZE) {
                    let size = entry
                        .size
                        .map(crate::pipeline::human_size)
                        .unwrap_or_default();
                    let marker = if entry.is_dir { "/" } else { "" };
                    lines.push(format!("- {}{marker} {size}", entry.name));
                }
                self.say(chat_id, &lines.join("\n")).await;
            }
            Ok(_) => self.say(chat_id, "Drive is empty").await,
            Err(err) => {
                self.say(chat_id, &format!("Listing failed: {err}")).await;
            }
        }
    }

    async fn say(&self, chat_id: i64, text: &str) {
        let supervisor = self.supervisor.clone();
        let text = text.to_string();
        if let Err(err) = supervisor
            .call(Priority::Ui, || async {
                supervisor.transport().send_message(chat_id, &text).await
            })
            .await
        {
            tracing::debug!(error = %err, "dispatcher send failed");
        }
    }

    async fn answer(&self, query_id: &str, text: &str) {
        let supervisor = self.supervisor.clone();
        let (query_id, text) = (query_id.to_string(), text.to_string());
        if let Err(err) = supervisor
            .call(Priority::Ui, || async {
                supervisor.transport().answer_callback(&query_id, &text).await
            })
            .await
        {
            tracing::debug!(error = %err, "callback answer failed");
        }
    }

    /// Groups currently buffered (tests, /status detail).
    pub fn pending_groups(&self) -> usize {
        self.groups.pending_groups()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn context_extraction() {
        let message = ChatEvent::Message(ChatMessage {
            chat_id: 5,
            msg_id: 6,
            sender_id: 7,
            text: "/start".into(),
            media: None,
            grouped_id: None,
        });
        let ctx = extract_context(&message);
        assert_eq!(ctx.user_id, 7);
        assert_eq!(ctx.chat_id, 5);
        assert!(!ctx.is_callback);
        assert!(ctx.query_id.is_none());

        let callback = ChatEvent::Callback(CallbackQuery {
            query_id: "q1".into(),
            user_id: 8,
            chat_id: 9,
            msg_id: 10,
            data: "cancel_t-1".into(),
        });
        let ctx = extract_context(&callback);
        assert_eq!(ctx.user_id, 8);
        assert!(ctx.is_callback);
        assert_eq!(ctx.query_id.as_deref(), Some("q1"));
    }

    #[test]
    fn callback_payload_parsing() {
        assert_eq!(
            parse_callback("cancel_t-42"),
            CallbackAction::Cancel("t-42".into())
        );
        assert_eq!(parse_callback("drive_add"), CallbackAction::DriveAdd);
        assert_eq!(parse_callback("drive_list"), CallbackAction::DriveList);
        assert_eq!(
            parse_callback("drive_default_d-1"),
            CallbackAction::DriveSetDefault("d-1".into())
        );
        assert_eq!(
            parse_callback("drive_del_d-2"),
            CallbackAction::DriveDelete("d-2".into())
        );
        assert_eq!(parse_callback("files_3"), CallbackAction::FilesPage(3));
        assert_eq!(parse_callback("manager_back"), CallbackAction::ManagerBack);
        assert_eq!(
            parse_callback("files_x"),
            CallbackAction::Unknown("files_x".into())
        );
        assert_eq!(
            parse_callback("bogus"),
            CallbackAction::Unknown("bogus".into())
        );
    }
}
