use crate::{
    client::{ChatRequest, ChatResponse},
    dataset::FinancialData,
    storage::StoreSnapshot,
};
use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub const NO_RESPONSE_PLACEHOLDER: &str = "No response available";

const SESSION_ID_KEY: &str = "session_id";
const MESSAGES_KEY: &str = "messages";
const LAST_INPUT_KEY: &str = "last_processed_input";
const SESSION_INFO_KEY: &str = "session_info";
const BACKUP_KEY: &str = "backup";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
}

impl ChatMessage {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
        }
    }
}

/// Display-only metadata about when the service opened the current session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionInfo {
    pub session_id: Option<String>,
    pub is_new: bool,
    pub started_at: DateTime<Utc>,
}

/// Secondary copy of the identity fields, used when the primary values go missing from the store.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionBackup {
    pub session_id: Option<String>,
    pub messages: Vec<ChatMessage>,
    pub session_info: Option<SessionInfo>,
}

impl SessionBackup {
    #[cfg_attr(not(test), allow(dead_code))]
    pub fn is_empty(&self) -> bool {
        self.session_id.is_none() && self.messages.is_empty() && self.session_info.is_none()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Accepted,
    /// Same text as the immediately preceding admitted input.
    Duplicate,
    Empty,
}

impl Admission {
    pub fn is_accepted(self) -> bool {
        matches!(self, Admission::Accepted)
    }
}

/// Owns the conversation identity for one session key and decides, turn by turn, whether the
/// service-assigned session id is reused, adopted, or reset.
#[derive(Debug, Clone, Default)]
pub struct SessionReconciler {
    session_id: Option<String>,
    messages: Vec<ChatMessage>,
    last_processed_input: Option<String>,
    session_info: Option<SessionInfo>,
    backup: SessionBackup,
    // Session id the outbound request was built with; not persisted.
    in_flight: Option<String>,
}

impl SessionReconciler {
    /// Rebuilds state from a store snapshot. Primary fields missing from the store are taken from
    /// the backup; an empty backup yields fresh values.
    pub fn restore(snapshot: &StoreSnapshot) -> Self {
        let backup: SessionBackup = snapshot.get(BACKUP_KEY).unwrap_or_default();
        let mut restored = Vec::new();

        let session_id = match snapshot.get::<Option<String>>(SESSION_ID_KEY) {
            Some(value) => value,
            None => {
                if backup.session_id.is_some() {
                    restored.push(SESSION_ID_KEY);
                }
                backup.session_id.clone()
            }
        };
        let messages = match snapshot.get::<Vec<ChatMessage>>(MESSAGES_KEY) {
            Some(value) => value,
            None => {
                if !backup.messages.is_empty() {
                    restored.push(MESSAGES_KEY);
                }
                backup.messages.clone()
            }
        };
        let session_info = match snapshot.get::<Option<SessionInfo>>(SESSION_INFO_KEY) {
            Some(value) => value,
            None => {
                if backup.session_info.is_some() {
                    restored.push(SESSION_INFO_KEY);
                }
                backup.session_info.clone()
            }
        };
        let last_processed_input = snapshot.get::<Option<String>>(LAST_INPUT_KEY).flatten();

        if !restored.is_empty() {
            tracing::info!(
                fields = ?restored,
                session_id = ?session_id,
                messages = messages.len(),
                "session restored from backup"
            );
        }

        Self {
            session_id,
            messages,
            last_processed_input,
            session_info,
            backup,
            in_flight: None,
        }
    }

    pub fn persist(&self, snapshot: &mut StoreSnapshot) -> Result<()> {
        snapshot.set(SESSION_ID_KEY, &self.session_id)?;
        snapshot.set(MESSAGES_KEY, &self.messages)?;
        snapshot.set(LAST_INPUT_KEY, &self.last_processed_input)?;
        snapshot.set(SESSION_INFO_KEY, &self.session_info)?;
        snapshot.set(BACKUP_KEY, &self.backup)?;
        Ok(())
    }

    pub fn session_id(&self) -> Option<&str> {
        self.session_id.as_deref()
    }

    pub fn messages(&self) -> &[ChatMessage] {
        &self.messages
    }

    pub fn session_info(&self) -> Option<&SessionInfo> {
        self.session_info.as_ref()
    }

    #[cfg_attr(not(test), allow(dead_code))]
    pub fn last_processed_input(&self) -> Option<&str> {
        self.last_processed_input.as_deref()
    }

    #[cfg_attr(not(test), allow(dead_code))]
    pub fn backup(&self) -> &SessionBackup {
        &self.backup
    }

    pub fn admit(&mut self, input: &str) -> Admission {
        if input.trim().is_empty() {
            tracing::debug!("empty input rejected");
            return Admission::Empty;
        }
        if self.last_processed_input.as_deref() == Some(input) {
            tracing::debug!(session_id = ?self.session_id, "duplicate input suppressed");
            return Admission::Duplicate;
        }

        self.last_processed_input = Some(input.to_string());
        self.messages.push(ChatMessage::user(input));
        self.backup.messages = self.messages.clone();

        tracing::info!(
            session_id = ?self.session_id,
            messages = self.messages.len(),
            "input admitted"
        );
        Admission::Accepted
    }

    /// Builds the outbound payload. The session id is only attached once the service has
    /// assigned one; its absence asks the service for a new session.
    pub fn build_request<'a>(&mut self, input: &'a str, data: &'a FinancialData) -> ChatRequest<'a> {
        self.in_flight = self.session_id.clone();
        ChatRequest {
            data,
            question: input,
            session_id: self.session_id.clone(),
        }
    }

    pub fn reconcile(&mut self, response: &ChatResponse) {
        let in_flight = self.in_flight.take();
        if self.session_id.is_none() {
            if let Some(sent) = in_flight {
                tracing::warn!(session_id = %sent, "session id cleared while request was in flight; restoring");
                self.session_id = Some(sent);
            }
        }
        let prior_id = self.session_id.clone();
        let declared_new = response.is_new_session.unwrap_or(false);

        if let Some(returned) = response.session_id.as_deref() {
            if prior_id.as_deref() != Some(returned) {
                match prior_id.as_deref() {
                    Some(held) if !declared_new => {
                        // The service may rewrite ids on routine turns; the client id stays
                        // authoritative unless a new session is declared.
                        tracing::warn!(
                            held,
                            returned,
                            "service returned a different session id without declaring a new session; keeping client id"
                        );
                    }
                    _ => {
                        tracing::info!(
                            previous = ?prior_id,
                            session_id = returned,
                            is_new = declared_new,
                            "session adopted"
                        );
                        self.session_id = Some(returned.to_string());
                    }
                }
            }
        }

        if declared_new {
            self.session_info = Some(SessionInfo {
                session_id: response.session_id.clone(),
                is_new: true,
                started_at: Utc::now(),
            });
        }

        let text = response.text.as_deref().unwrap_or_else(|| {
            tracing::warn!("response carried no text; using placeholder");
            NO_RESPONSE_PLACEHOLDER
        });
        self.messages.push(ChatMessage::assistant(text));

        self.backup = SessionBackup {
            session_id: self.session_id.clone(),
            messages: self.messages.clone(),
            session_info: self.session_info.clone(),
        };
    }

    /// Clears the conversation. The backup is left as is until the next reconcile.
    pub fn reset(&mut self) {
        tracing::info!(session_id = ?self.session_id, "session reset");
        self.session_id = None;
        self.session_info = None;
        self.messages.clear();
        self.last_processed_input = None;
    }
}
