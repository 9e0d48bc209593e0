use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Utc};
use hikeathon_core::{
    KeyValueStore,
    catalog::{ChatModel, DEFAULT_CHAT_MODEL, chat_model},
};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tokio::{sync::watch, task::AbortHandle};
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::{Observable, chat_history::ChatSession};
use crate::{
    api::{ApiClient, ApiRequest},
    error::StoreError,
};

pub const CHAT_FUNCTION: &str = "proxy-chat";
pub const CHAT_STATE_KEY: &str = "chat-state";
pub const DEFAULT_SYSTEM_PROMPT: &str = "You are a helpful AI assistant supporting teams at HIKEathon 2025. Be concise, accurate, and friendly.";
pub const ERROR_REPLY: &str = "Sorry, an error occurred while generating the response.";
/// Messages sent along with each request, besides the system prompt.
pub const CONTEXT_WINDOW: usize = 20;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
    System,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatMessage {
    pub id: String,
    pub role: Role,
    pub content: String,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tokens: Option<u32>,
    #[serde(default)]
    pub is_streaming: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ChatMessage {
    fn new(role: Role, content: &str) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            role,
            content: content.to_owned(),
            timestamp: Utc::now(),
            model: None,
            tokens: None,
            is_streaming: false,
            error: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ChatState {
    pub messages: Vec<ChatMessage>,
    pub current_model: String,
    pub system_prompt: String,
    pub temperature: f32,
    pub max_tokens: u32,
    pub top_p: f32,
    #[serde(skip)]
    pub is_generating: bool,
    /// Assistant message currently being streamed into.
    #[serde(skip)]
    pub streaming_id: Option<String>,
    #[serde(skip)]
    pub total_tokens: u32,
    #[serde(skip)]
    pub context_tokens: u32,
}

impl Default for ChatState {
    fn default() -> Self {
        Self {
            messages: Vec::new(),
            current_model: DEFAULT_CHAT_MODEL.to_owned(),
            system_prompt: DEFAULT_SYSTEM_PROMPT.to_owned(),
            temperature: 0.7,
            max_tokens: 2048,
            top_p: 0.9,
            is_generating: false,
            streaming_id: None,
            total_tokens: 0,
            context_tokens: 0,
        }
    }
}

impl ChatState {
    pub fn current_model_info(&self) -> Option<&'static ChatModel> {
        chat_model(&self.current_model)
    }

    pub fn context_usage_percent(&self) -> f64 {
        let Some(model) = self.current_model_info() else {
            return 0.0;
        };
        (f64::from(self.context_tokens) / f64::from(model.context_length) * 100.0).min(100.0)
    }

    pub fn conversation_history(&self) -> impl Iterator<Item = &ChatMessage> {
        self.messages.iter().filter(|m| m.role != Role::System)
    }

    fn recount_tokens(&mut self) {
        let window_start = self.messages.len().saturating_sub(CONTEXT_WINDOW);
        let mut total = 0;
        let mut context = estimate_tokens(&self.system_prompt);
        for (index, message) in self.messages.iter().enumerate() {
            let tokens = message
                .tokens
                .unwrap_or_else(|| estimate_tokens(&message.content));
            total += tokens;
            if index >= window_start {
                context += tokens;
            }
        }
        self.total_tokens = total;
        self.context_tokens = context;
    }

    fn message_mut(&mut self, id: &str) -> Option<&mut ChatMessage> {
        self.messages.iter_mut().find(|m| m.id == id)
    }
}

/// Roughly four characters per token.
pub fn estimate_tokens(text: &str) -> u32 {
    text.chars().count().div_ceil(4) as u32
}

/// Streaming chat against the `proxy-chat` edge function.
pub struct ChatStore {
    api: ApiClient,
    storage: Option<Arc<dyn KeyValueStore>>,
    state: Arc<Observable<ChatState>>,
    active: Mutex<Option<(String, AbortHandle)>>,
}

impl ChatStore {
    pub fn new(api: ApiClient) -> Self {
        Self {
            api,
            storage: None,
            state: Arc::new(Observable::default()),
            active: Mutex::new(None),
        }
    }

    /// Restores the conversation and preferences saved in `storage` and
    /// keeps them there as they change.
    pub fn with_storage(api: ApiClient, storage: Arc<dyn KeyValueStore>) -> Self {
        let mut state = storage
            .get(CHAT_STATE_KEY)
            .and_then(|raw| match serde_json::from_str::<ChatState>(&raw) {
                Ok(state) => Some(state),
                Err(err) => {
                    warn!("saved chat state unreadable: {err}");
                    None
                }
            })
            .unwrap_or_default();
        for message in &mut state.messages {
            message.is_streaming = false;
        }
        state.recount_tokens();

        Self {
            api,
            storage: Some(storage),
            state: Arc::new(Observable::new(state)),
            active: Mutex::new(None),
        }
    }

    pub fn state(&self) -> ChatState {
        self.state.get()
    }

    pub fn subscribe(&self) -> watch::Receiver<ChatState> {
        self.state.subscribe()
    }

    /// Sends `content` and streams the reply into a new assistant message.
    /// Ignored while another reply is generating. Returns the assistant
    /// message id, or `None` when ignored.
    pub async fn send_message(&self, content: &str) -> Result<Option<String>, StoreError> {
        let user = ChatMessage::new(Role::User, content);
        let mut assistant = ChatMessage::new(Role::Assistant, "");
        assistant.is_streaming = true;
        let assistant_id = assistant.id.clone();

        let mut request_body = None;
        self.state.update(|s| {
            if s.is_generating {
                return;
            }
            assistant.model = Some(s.current_model.clone());
            s.messages.push(user);

            let history = s.messages[s.messages.len().saturating_sub(CONTEXT_WINDOW)..]
                .iter()
                .map(|m| json!({ "role": m.role, "content": m.content }));
            let messages: Vec<Value> = std::iter::once(json!({
                "role": Role::System,
                "content": s.system_prompt,
            }))
            .chain(history)
            .collect();
            request_body = Some(json!({
                "model": s.current_model,
                "messages": messages,
                "temperature": s.temperature,
                "max_tokens": s.max_tokens,
                "top_p": s.top_p,
                "stream": true,
            }));

            s.messages.push(assistant);
            s.is_generating = true;
            s.streaming_id = Some(assistant_id.clone());
        });
        let Some(body) = request_body else {
            debug!("chat send ignored while generating");
            return Ok(None);
        };

        let result = self.stream_reply(&assistant_id, body).await;
        self.finish(&assistant_id, result.as_ref().err().map(ToString::to_string));
        result.map(|()| Some(assistant_id))
    }

    async fn stream_reply(&self, assistant_id: &str, body: Value) -> Result<(), StoreError> {
        let request = ApiRequest::post(ApiClient::function_path(CHAT_FUNCTION)).json(body);
        let state = Arc::clone(&self.state);
        let target = assistant_id.to_owned();
        let handle = self
            .api
            .stream(request, move |chunk| {
                let Some(delta) = chunk
                    .pointer("/choices/0/delta/content")
                    .and_then(Value::as_str)
                    .filter(|delta| !delta.is_empty())
                else {
                    return;
                };
                state.update(|s| {
                    if let Some(message) = s.message_mut(&target) {
                        message.content.push_str(delta);
                    }
                });
            })
            .await?;

        {
            let still_ours = self
                .state
                .read(|s| s.streaming_id.as_deref() == Some(assistant_id));
            if !still_ours {
                handle.cancel();
            }
            *self.active() = Some((assistant_id.to_owned(), handle.abort_handle()));
        }
        handle.finished().await?;
        Ok(())
    }

    fn finish(&self, assistant_id: &str, error: Option<String>) {
        {
            let mut active = self.active();
            if active.as_ref().is_some_and(|(id, _)| id == assistant_id) {
                *active = None;
            }
        }
        self.state.update(|s| {
            if s.streaming_id.as_deref() == Some(assistant_id) {
                s.streaming_id = None;
                s.is_generating = false;
            }
            if let Some(message) = s.message_mut(assistant_id) {
                message.is_streaming = false;
                if let Some(error) = error {
                    warn!("chat generation failed: {error}");
                    message.error = Some(error);
                    message.content = ERROR_REPLY.to_owned();
                }
                message.tokens = Some(estimate_tokens(&message.content));
            }
            s.recount_tokens();
        });
        self.persist();
    }

    /// Cancels the reply being streamed. Text received so far stays.
    pub fn stop_generation(&self) {
        if let Some((_, handle)) = self.active().take() {
            handle.abort();
            info!("chat generation stopped");
        }
        self.state.update(|s| {
            if let Some(id) = s.streaming_id.take()
                && let Some(message) = s.message_mut(&id)
            {
                message.is_streaming = false;
            }
            s.is_generating = false;
        });
    }

    pub fn clear_messages(&self) {
        self.state.update(|s| {
            s.messages.clear();
            s.total_tokens = 0;
            s.context_tokens = 0;
        });
        self.persist();
    }

    /// Replaces the live conversation with a saved session's messages and
    /// parameters. A reply in flight is stopped first.
    pub fn open_session(&self, session: &ChatSession) {
        self.stop_generation();
        self.state.update(|s| {
            s.messages = session.messages.clone();
            for message in &mut s.messages {
                message.is_streaming = false;
            }
            if chat_model(&session.model).is_some() {
                s.current_model = session.model.clone();
            } else {
                warn!(model = %session.model, "saved session uses an unknown model");
            }
            s.temperature = session.temperature.clamp(0.0, 2.0);
            s.max_tokens = session.max_tokens.clamp(1, 4096);
            s.top_p = session.top_p.clamp(0.0, 1.0);
            s.recount_tokens();
        });
        info!(id = %session.id, "chat session opened");
        self.persist();
    }

    pub fn delete_message(&self, id: &str) -> bool {
        let mut found = false;
        self.state.update(|s| {
            let before = s.messages.len();
            s.messages.retain(|m| m.id != id);
            found = s.messages.len() != before;
            if found {
                s.recount_tokens();
            }
        });
        if found {
            self.persist();
        }
        found
    }

    pub fn edit_message(&self, id: &str, content: &str) -> bool {
        let mut found = false;
        self.state.update(|s| {
            if let Some(message) = s.message_mut(id) {
                message.content = content.to_owned();
                message.tokens = None;
                found = true;
                s.recount_tokens();
            }
        });
        if found {
            self.persist();
        }
        found
    }

    /// Switches to a catalogue model; unknown ids are refused.
    pub fn set_model(&self, model_id: &str) -> bool {
        if chat_model(model_id).is_none() {
            return false;
        }
        self.state.update(|s| s.current_model = model_id.to_owned());
        self.persist();
        true
    }

    pub fn set_system_prompt(&self, prompt: &str) {
        self.state.update(|s| {
            s.system_prompt = prompt.to_owned();
            s.recount_tokens();
        });
        self.persist();
    }

    pub fn set_temperature(&self, temperature: f32) {
        self.state.update(|s| s.temperature = temperature.clamp(0.0, 2.0));
        self.persist();
    }

    pub fn set_max_tokens(&self, max_tokens: u32) {
        self.state.update(|s| s.max_tokens = max_tokens.clamp(1, 4096));
        self.persist();
    }

    pub fn set_top_p(&self, top_p: f32) {
        self.state.update(|s| s.top_p = top_p.clamp(0.0, 1.0));
        self.persist();
    }

    fn persist(&self) {
        let Some(storage) = &self.storage else {
            return;
        };
        let encoded = self.state.read(serde_json::to_string);
        match encoded {
            Ok(json) => {
                if let Err(err) = storage.set(CHAT_STATE_KEY, &json) {
                    warn!("failed to save chat state: {err}");
                }
            }
            Err(err) => warn!("failed to encode chat state: {err}"),
        }
    }

    fn active(&self) -> MutexGuard<'_, Option<(String, AbortHandle)>> {
        self.active.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
