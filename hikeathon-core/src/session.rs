use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
};

use serde::{Deserialize, Serialize};

use crate::{
    CoreError, SESSION_TTL_MS, UnixMillis, now_unix_ms,
    token::{EncryptedToken, is_session_valid_at},
};

pub const SESSION_KEY: &str = "team-session";
pub const SESSION_BACKUP_KEY: &str = "team-session-backup";
pub const CSRF_TOKEN_KEY: &str = "csrf-token";
const CSRF_TOKEN_BYTES: usize = 32;

/// One storage tier. Implementations use interior mutability so a tier can be
/// shared between the vault, the CSRF guard and the stores.
pub trait KeyValueStore: Send + Sync {
    fn get(&self, key: &str) -> Option<String>;
    fn set(&self, key: &str, value: &str) -> Result<(), CoreError>;
    fn remove(&self, key: &str);
}

/// Process-lifetime tier, the counterpart of a browser tab's session storage.
#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: Mutex<HashMap<String, String>>,
}

impl MemoryStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl KeyValueStore for MemoryStore {
    fn get(&self, key: &str) -> Option<String> {
        self.entries
            .lock()
            .ok()
            .and_then(|entries| entries.get(key).cloned())
    }

    fn set(&self, key: &str, value: &str) -> Result<(), CoreError> {
        let mut entries = self
            .entries
            .lock()
            .map_err(|_| CoreError::Storage("memory store poisoned".to_owned()))?;
        entries.insert(key.to_owned(), value.to_owned());
        Ok(())
    }

    fn remove(&self, key: &str) {
        if let Ok(mut entries) = self.entries.lock() {
            entries.remove(key);
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct SessionEnvelope {
    #[serde(flatten)]
    pub token: EncryptedToken,
    pub team_name: String,
    pub expires_at: UnixMillis,
}

#[derive(Clone)]
pub struct SessionVault {
    ephemeral: Arc<dyn KeyValueStore>,
    durable: Arc<dyn KeyValueStore>,
}

impl SessionVault {
    pub fn new(ephemeral: Arc<dyn KeyValueStore>, durable: Arc<dyn KeyValueStore>) -> Self {
        Self { ephemeral, durable }
    }

    pub fn store_session(
        &self,
        encrypted: &EncryptedToken,
        team_name: &str,
    ) -> Result<SessionEnvelope, CoreError> {
        let envelope = SessionEnvelope {
            token: encrypted.clone(),
            team_name: team_name.to_owned(),
            expires_at: now_unix_ms().saturating_add(SESSION_TTL_MS),
        };
        let json = serde_json::to_string(&envelope)
            .map_err(|err| CoreError::Serialization(err.to_string()))?;
        self.ephemeral.set(SESSION_KEY, &json)?;
        self.durable.set(SESSION_BACKUP_KEY, &json)?;
        Ok(envelope)
    }

    pub fn get_stored_session(&self) -> Option<SessionEnvelope> {
        self.get_stored_session_at(now_unix_ms())
    }

    pub fn get_stored_session_at(&self, now: UnixMillis) -> Option<SessionEnvelope> {
        if let Some(raw) = self.ephemeral.get(SESSION_KEY) {
            match serde_json::from_str::<SessionEnvelope>(&raw) {
                Ok(envelope) => return Some(envelope),
                Err(_) => self.ephemeral.remove(SESSION_KEY),
            }
        }

        let backup = self.durable.get(SESSION_BACKUP_KEY)?;
        let envelope = match serde_json::from_str::<SessionEnvelope>(&backup) {
            Ok(envelope) => envelope,
            Err(_) => {
                self.durable.remove(SESSION_BACKUP_KEY);
                return None;
            }
        };

        if !is_session_valid_at(&envelope.token, now) {
            self.durable.remove(SESSION_BACKUP_KEY);
            return None;
        }

        // A failed restore still returns the session; the next read simply
        // falls back to the backup again.
        let _ = self.ephemeral.set(SESSION_KEY, &backup);
        Some(envelope)
    }

    pub fn clear_session(&self) {
        self.ephemeral.remove(SESSION_KEY);
        self.ephemeral.remove(CSRF_TOKEN_KEY);
        self.durable.remove(SESSION_BACKUP_KEY);
    }
}

#[derive(Clone)]
pub struct CsrfGuard {
    store: Arc<dyn KeyValueStore>,
}

impl CsrfGuard {
    pub fn new(store: Arc<dyn KeyValueStore>) -> Self {
        Self { store }
    }

    pub fn token(&self) -> String {
        if let Some(existing) = self.store.get(CSRF_TOKEN_KEY) {
            return existing;
        }
        self.rotate()
    }

    pub fn rotate(&self) -> String {
        let bytes: [u8; CSRF_TOKEN_BYTES] = rand::random();
        let token = hex::encode(bytes);
        let _ = self.store.set(CSRF_TOKEN_KEY, &token);
        token
    }

    pub fn validate(&self, candidate: &str) -> bool {
        candidate.len() == CSRF_TOKEN_BYTES * 2
            && self
                .store
                .get(CSRF_TOKEN_KEY)
                .is_some_and(|stored| stored == candidate)
    }
}
