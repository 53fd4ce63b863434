//! Drive configuration flow
//!
//! Session-driven conversation that binds a cloud drive to a user. The
//! session's `current_step` walks `select_type` then the provider's
//! binding steps; answers accumulate in `temp_data` and become the
//! credentials blob. The finished config is validated against the live
//! backend before the row is written.

use crate::drive::{binding_steps, DriveProviderFactory};
use crate::limits::Priority;
use crate::models::{Drive, DriveType, Session};
use crate::protocol::ClientSupervisor;
use crate::repository::{DriveStore, SessionStore};
use std::str::FromStr;
use std::sync::Arc;

const STEP_SELECT_TYPE: &str = "select_type";

fn bind_step(drive_type: DriveType, index: usize) -> String {
    format!("bind:{}:{}", drive_type.as_str(), index)
}

fn parse_bind_step(step: &str) -> Option<(DriveType, usize)> {
    let mut parts = step.splitn(3, ':');
    if parts.next() != Some("bind") {
        return None;
    }
    let drive_type = DriveType::from_str(parts.next()?).ok()?;
    let index = parts.next()?.parse().ok()?;
    Some((drive_type, index))
}

/// The binding conversation.
pub struct DriveConfigFlow {
    sessions: Arc<SessionStore>,
    drives: Arc<dyn DriveStore>,
    factory: Arc<DriveProviderFactory>,
    supervisor: Arc<ClientSupervisor>,
}

impl DriveConfigFlow {
    pub fn new(
        sessions: Arc<SessionStore>,
        drives: Arc<dyn DriveStore>,
        factory: Arc<DriveProviderFactory>,
        supervisor: Arc<ClientSupervisor>,
    ) -> Self {
        Self {
            sessions,
            drives,
            factory,
            supervisor,
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
            tracing::debug!(error = %err, "flow message send failed");
        }
    }

    /// Begin (or restart) the flow for a user.
    pub async fn start(&self, user_id: i64, chat_id: i64) {
        let types: Vec<&str> = self
            .factory
            .supported_types()
            .iter()
            .map(|t| t.as_str())
            .collect();
        if let Err(err) = self
            .sessions
            .put(user_id, Session::new(STEP_SELECT_TYPE))
            .await
        {
            tracing::warn!(error = %err, "session write failed");
            return;
        }
        self.say(
            chat_id,
            &format!("Which drive type do you want to bind? ({})", types.join(", ")),
        )
        .await;
    }

    /// Abort the flow, clearing the session.
    pub async fn cancel(&self, user_id: i64, chat_id: i64) {
        let _ = self.sessions.clear(user_id).await;
        self.say(chat_id, "Drive setup cancelled").await;
    }

    /// Feed one user message into the flow. Returns `false` when no
    /// session exists (the dispatcher routes the message elsewhere).
    pub async fn handle_input(&self, user_id: i64, chat_id: i64, text: &str) -> bool {
        let session = match self.sessions.get(user_id).await {
            Ok(Some(session)) => session,
            Ok(None) => return false,
            Err(err) => {
                tracing::warn!(error = %err, "session read failed");
                return false;
            }
        };

        let input = text.trim();
        if input.eq_ignore_ascii_case("/cancel") {
            self.cancel(user_id, chat_id).await;
            return true;
        }

        if session.current_step == STEP_SELECT_TYPE {
            self.handle_type_selection(user_id, chat_id, input).await;
            return true;
        }

        if let Some((drive_type, index)) = parse_bind_step(&session.current_step) {
            self.handle_step_answer(user_id, chat_id, session, drive_type, index, input)
                .await;
            return true;
        }

        tracing::warn!(step = %session.current_step, "unknown session step; clearing");
        let _ = self.sessions.clear(user_id).await;
        false
    }

    async fn handle_type_selection(&self, user_id: i64, chat_id: i64, input: &str) {
        let drive_type = match DriveType::from_str(&input.to_lowercase()) {
            Ok(drive_type) if self.factory.supported_types().contains(&drive_type) => drive_type,
            _ => {
                self.say(chat_id, "Unknown drive type; try again or /cancel").await;
                return;
            }
        };

        let mut session = Session::new(bind_step(drive_type, 0));
        session
            .temp_data
            .insert("type".into(), drive_type.as_str().to_string());
        if self.sessions.put(user_id, session).await.is_err() {
            return;
        }

        let step = &binding_steps(drive_type)[0];
        self.say(chat_id, step.prompt).await;
    }

    async fn handle_step_answer(
        &self,
        user_id: i64,
        chat_id: i64,
        mut session: Session,
        drive_type: DriveType,
        index: usize,
        input: &str,
    ) {
        let steps = binding_steps(drive_type);
        let Some(step) = steps.get(index) else {
            let _ = self.sessions.clear(user_id).await;
            return;
        };

        let answer = if step.secret {
            crate::drive::process_password(input)
        } else {
            input.trim().to_string()
        };
        session.temp_data.insert(step.key.to_string(), answer);

        if index + 1 < steps.len() {
            session.current_step = bind_step(drive_type, index + 1);
            let next_prompt = steps[index + 1].prompt;
            if self.sessions.put(user_id, session).await.is_ok() {
                self.say(chat_id, next_prompt).await;
            }
            return;
        }

        self.finish(user_id, chat_id, session, drive_type).await;
    }

    /// All steps answered: validate against the backend and persist.
    async fn finish(&self, user_id: i64, chat_id: i64, session: Session, drive_type: DriveType) {
        let credentials = serde_json::to_value(
            session
                .temp_data
                .iter()
                .filter(|(k, _)| k.as_str() != "type")
                .collect::<std::collections::HashMap<_, _>>(),
        )
        .unwrap_or_default();

        let existing = self.drives.list_by_user(user_id).await.unwrap_or_default();
        let drive = Drive {
            id: uuid::Uuid::new_v4().to_string(),
            user_id,
            name: format!("{}-{}", drive_type.as_str(), existing.len() + 1),
            drive_type,
            credentials,
            is_default: existing.is_empty(),
        };

        match self.factory.create(&drive) {
            Ok(provider) => {
                if let Err(err) = provider.validate_config().await {
                    self.say(chat_id, &format!("Validation failed: {err}. Try /drive again"))
                        .await;
                    let _ = self.sessions.clear(user_id).await;
                    return;
                }
            }
            Err(err) => {
                self.say(chat_id, &format!("Cannot bind: {err}")).await;
                let _ = self.sessions.clear(user_id).await;
                return;
            }
        }

        match self.drives.create(&drive).await {
            Ok(()) => {
                self.say(chat_id, &format!("Drive {} bound", drive.name)).await;
            }
            Err(err) => {
                tracing::warn!(error = %err, "drive row write failed");
                self.say(chat_id, "Storing the drive failed; try again later").await;
            }
        }
        let _ = self.sessions.clear(user_id).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bind_step_round_trip() {
        let step = bind_step(DriveType::WebDav, 2);
        assert_eq!(parse_bind_step(&step), Some((DriveType::WebDav, 2)));
        assert_eq!(parse_bind_step("select_type"), None);
        assert_eq!(parse_bind_step("bind:nope:0"), None);
    }
}
