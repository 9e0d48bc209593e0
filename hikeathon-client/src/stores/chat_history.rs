use std::sync::Arc;

use chrono::{DateTime, Utc};
use hikeathon_core::KeyValueStore;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::{
    Observable,
    chat::{ChatMessage, ChatState, Role},
};

pub const CHAT_HISTORY_KEY: &str = "chat-history";
pub const DEFAULT_SESSION_NAME: &str = "New Chat";
const NAME_CHARS: usize = 40;

/// One saved conversation with the parameters it was held under.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatSession {
    pub id: String,
    pub name: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub messages: Vec<ChatMessage>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub selected_gpt: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub initial_prompt: Option<String>,
    pub model: String,
    pub temperature: f32,
    pub max_tokens: u32,
    pub top_p: f32,
}

impl ChatSession {
    pub fn conversation(&self) -> impl Iterator<Item = &ChatMessage> {
        self.messages.iter().filter(|m| m.role != Role::System)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ChatHistory {
    /// Newest first.
    pub sessions: Vec<ChatSession>,
    pub current_session_id: Option<String>,
}

impl ChatHistory {
    pub fn current_session(&self) -> Option<&ChatSession> {
        let id = self.current_session_id.as_deref()?;
        self.sessions.iter().find(|s| s.id == id)
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    fn session_mut(&mut self, id: &str) -> Option<&mut ChatSession> {
        self.sessions.iter_mut().find(|s| s.id == id)
    }
}

/// Fields of [`ChatSession`] that `update_session_settings` may change.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SessionSettings {
    pub model: Option<String>,
    pub temperature: Option<f32>,
    pub max_tokens: Option<u32>,
    pub top_p: Option<f32>,
}

/// Named conversations kept in durable storage, one of them current.
pub struct ChatHistoryStore {
    storage: Arc<dyn KeyValueStore>,
    state: Observable<ChatHistory>,
}

impl ChatHistoryStore {
    pub fn open(storage: Arc<dyn KeyValueStore>) -> Self {
        let mut history = storage
            .get(CHAT_HISTORY_KEY)
            .and_then(|raw| match serde_json::from_str::<ChatHistory>(&raw) {
                Ok(history) => Some(history),
                Err(err) => {
                    warn!("saved chat history unreadable: {err}");
                    None
                }
            })
            .unwrap_or_default();
        if history.current_session().is_none() {
            history.current_session_id = None;
        }
        debug!(sessions = history.session_count(), "chat history loaded");

        Self {
            storage,
            state: Observable::new(history),
        }
    }

    pub fn state(&self) -> ChatHistory {
        self.state.get()
    }

    pub fn subscribe(&self) -> watch::Receiver<ChatHistory> {
        self.state.subscribe()
    }

    pub fn current_session(&self) -> Option<ChatSession> {
        self.state.read(|h| h.current_session().cloned())
    }

    pub fn session_count(&self) -> usize {
        self.state.read(ChatHistory::session_count)
    }

    pub fn session(&self, id: &str) -> Option<ChatSession> {
        self.state
            .read(|h| h.sessions.iter().find(|s| s.id == id).cloned())
    }

    /// Starts a session with `chat`'s parameters and makes it current. It is
    /// named after the first 40 characters of `initial_prompt`.
    pub fn create_session(
        &self,
        initial_prompt: Option<&str>,
        selected_gpt: Option<&str>,
        chat: &ChatState,
    ) -> ChatSession {
        let prompt = initial_prompt.map(str::trim).filter(|p| !p.is_empty());
        let now = Utc::now();
        let session = ChatSession {
            id: Uuid::new_v4().to_string(),
            name: prompt.map_or_else(|| DEFAULT_SESSION_NAME.to_owned(), session_name),
            created_at: now,
            updated_at: now,
            messages: Vec::new(),
            selected_gpt: selected_gpt.map(str::to_owned),
            initial_prompt: prompt.map(str::to_owned),
            model: chat.current_model.clone(),
            temperature: chat.temperature,
            max_tokens: chat.max_tokens,
            top_p: chat.top_p,
        };
        self.state.update(|h| {
            h.sessions.insert(0, session.clone());
            h.current_session_id = Some(session.id.clone());
        });
        info!(id = %session.id, name = %session.name, "chat session created");
        self.persist();
        session
    }

    pub fn switch_session(&self, id: &str) -> bool {
        self.modify(|h| {
            if h.sessions.iter().all(|s| s.id != id) {
                return false;
            }
            h.current_session_id = Some(id.to_owned());
            true
        })
    }

    pub fn update_session_messages(&self, id: &str, messages: &[ChatMessage]) -> bool {
        self.modify_session(id, |session| {
            session.messages = messages.to_vec();
            for message in &mut session.messages {
                message.is_streaming = false;
            }
        })
    }

    pub fn update_session_gpt(&self, id: &str, selected_gpt: Option<&str>) -> bool {
        self.modify_session(id, |session| {
            session.selected_gpt = selected_gpt.map(str::to_owned);
        })
    }

    pub fn update_session_settings(&self, id: &str, settings: SessionSettings) -> bool {
        self.modify_session(id, |session| {
            if let Some(model) = settings.model {
                session.model = model;
            }
            if let Some(temperature) = settings.temperature {
                session.temperature = temperature;
            }
            if let Some(max_tokens) = settings.max_tokens {
                session.max_tokens = max_tokens;
            }
            if let Some(top_p) = settings.top_p {
                session.top_p = top_p;
            }
        })
    }

    /// Blank names are refused.
    pub fn rename_session(&self, id: &str, name: &str) -> bool {
        let name = name.trim();
        if name.is_empty() {
            return false;
        }
        self.modify_session(id, |session| session.name = name.to_owned())
    }

    pub fn clear_session_messages(&self, id: &str) -> bool {
        self.modify_session(id, |session| session.messages.clear())
    }

    /// Removing the current session makes the newest remaining one current.
    pub fn delete_session(&self, id: &str) -> bool {
        self.modify(|h| {
            let before = h.sessions.len();
            h.sessions.retain(|s| s.id != id);
            if h.sessions.len() == before {
                return false;
            }
            if h.current_session_id.as_deref() == Some(id) {
                h.current_session_id = h.sessions.first().map(|s| s.id.clone());
            }
            true
        })
    }

    pub fn delete_all_sessions(&self) {
        self.state.set(ChatHistory::default());
        info!("chat history cleared");
        self.persist();
    }

    /// Copies the live conversation and its parameters into the current
    /// session, starting one named after the first user message when none
    /// is current. Returns the session id.
    pub fn save_chat(&self, chat: &ChatState) -> String {
        let id = match self.current_session() {
            Some(session) => session.id,
            None => {
                let first = chat
                    .messages
                    .iter()
                    .find(|m| m.role == Role::User)
                    .map(|m| m.content.as_str());
                self.create_session(first, None, chat).id
            }
        };
        self.modify_session(&id, |session| {
            session.messages = chat.messages.clone();
            for message in &mut session.messages {
                message.is_streaming = false;
            }
            session.model = chat.current_model.clone();
            session.temperature = chat.temperature;
            session.max_tokens = chat.max_tokens;
            session.top_p = chat.top_p;
        });
        id
    }

    fn modify_session(&self, id: &str, f: impl FnOnce(&mut ChatSession)) -> bool {
        self.modify(|h| {
            let Some(session) = h.session_mut(id) else {
                return false;
            };
            f(session);
            session.updated_at = Utc::now();
            true
        })
    }

    fn modify(&self, f: impl FnOnce(&mut ChatHistory) -> bool) -> bool {
        let mut changed = false;
        self.state.update(|h| changed = f(h));
        if changed {
            self.persist();
        }
        changed
    }

    fn persist(&self) {
        let encoded = self.state.read(serde_json::to_string);
        match encoded {
            Ok(json) => {
                if let Err(err) = self.storage.set(CHAT_HISTORY_KEY, &json) {
                    warn!("failed to save chat history: {err}");
                }
            }
            Err(err) => warn!("failed to encode chat history: {err}"),
        }
    }
}

fn session_name(prompt: &str) -> String {
    prompt.chars().take(NAME_CHARS).collect::<String>().trim_end().to_owned()
}

#[cfg(test)]
mod tests {
    use hikeathon_core::MemoryStore;

    use super::*;

    fn store() -> (Arc<MemoryStore>, ChatHistoryStore) {
        let storage = Arc::new(MemoryStore::default());
        let history = ChatHistoryStore::open(storage.clone());
        (storage, history)
    }

    #[test]
    fn sessions_are_named_after_the_prompt() {
        let (_, history) = store();
        let chat = ChatState::default();
        let long = history.create_session(
            Some("  Plan a two-day hike through the Black Forest with huts  "),
            Some("trail-guide"),
            &chat,
        );
        assert_eq!(long.name, "Plan a two-day hike through the Black Fo");
        assert_eq!(long.selected_gpt.as_deref(), Some("trail-guide"));
        assert_eq!(long.model, chat.current_model);

        let blank = history.create_session(Some("   "), None, &chat);
        assert_eq!(blank.name, DEFAULT_SESSION_NAME);
        assert_eq!(blank.initial_prompt, None);

        let state = history.state();
        assert_eq!(state.session_count(), 2);
        assert_eq!(state.sessions[0].id, blank.id);
        assert_eq!(state.current_session_id.as_deref(), Some(blank.id.as_str()));
    }

    #[test]
    fn deleting_the_current_session_falls_back_to_the_newest() {
        let (_, history) = store();
        let chat = ChatState::default();
        let first = history.create_session(Some("first"), None, &chat);
        let second = history.create_session(Some("second"), None, &chat);
        let third = history.create_session(Some("third"), None, &chat);

        assert!(history.switch_session(&first.id));
        assert!(history.delete_session(&first.id));
        assert_eq!(history.current_session().map(|s| s.id), Some(third.id.clone()));

        assert!(history.delete_session(&second.id));
        assert_eq!(history.current_session().map(|s| s.id), Some(third.id.clone()));
        assert!(!history.delete_session(&second.id));
        assert!(!history.switch_session(&second.id));

        assert!(history.delete_session(&third.id));
        assert_eq!(history.current_session(), None);
        assert_eq!(history.session_count(), 0);
    }

    #[test]
    fn edits_touch_only_the_named_session() {
        let (_, history) = store();
        let chat = ChatState::default();
        let kept = history.create_session(Some("kept"), None, &chat);
        let edited = history.create_session(Some("edited"), None, &chat);

        assert!(history.rename_session(&edited.id, "  Hut list  "));
        assert!(!history.rename_session(&edited.id, "   "));
        assert!(history.update_session_gpt(&edited.id, Some("planner")));
        assert!(history.update_session_settings(
            &edited.id,
            SessionSettings {
                temperature: Some(0.2),
                ..SessionSettings::default()
            },
        ));
        assert!(!history.update_session_settings("missing", SessionSettings::default()));

        let edited = history.session(&edited.id).expect("edited session");
        assert_eq!(edited.name, "Hut list");
        assert_eq!(edited.selected_gpt.as_deref(), Some("planner"));
        assert_eq!(edited.temperature, 0.2);
        assert_eq!(edited.max_tokens, chat.max_tokens);
        assert!(edited.updated_at >= edited.created_at);
        assert_eq!(history.session(&kept.id), Some(kept));
    }

    #[test]
    fn unknown_current_session_is_dropped_on_open() {
        let storage = Arc::new(MemoryStore::default());
        storage
            .set(
                CHAT_HISTORY_KEY,
                r#"{"sessions":[],"currentSessionId":"gone"}"#,
            )
            .expect("seeded");
        let history = ChatHistoryStore::open(storage);
        assert_eq!(history.state().current_session_id, None);
    }
}
