use std::time::{SystemTime, UNIX_EPOCH};

use sha2::{Digest, Sha256};
use thiserror::Error;

pub mod cache;
pub mod catalog;
pub mod presence;
pub mod protocol;
pub mod reconnect;
pub mod records;
pub mod refresh;
pub mod session;
pub mod sse;
pub mod token;

pub use cache::{RateWindow, TtlCache};
pub use protocol::{ChannelName, SubscribeStatus};
pub use refresh::RefreshGate;
pub use session::{CsrfGuard, KeyValueStore, MemoryStore, SessionEnvelope, SessionVault};
pub use sse::{SseDecoder, SseEvent};
pub use token::{EncryptedToken, TokenSecurity, is_session_valid, is_session_valid_at};

pub const TEAM_CODE_LEN: usize = 8;
pub const SESSION_TTL_MS: u64 = 48 * 60 * 60 * 1000;

pub type TeamId = String;
pub type UnixMillis = u64;

#[derive(Debug, Error)]
pub enum CoreError {
    #[error("token and team code are required")]
    MissingInput,
    #[error("team code must be exactly 8 characters")]
    InvalidTeamCode,
    #[error("failed to encrypt token")]
    EncryptionFailed,
    #[error("failed to decrypt token - invalid team code or corrupted data")]
    DecryptionFailed,
    #[error("serialization error: {0}")]
    Serialization(String),
    #[error("invalid realtime frame: {0}")]
    InvalidFrame(String),
    #[error("storage error: {0}")]
    Storage(String),
}

/// Upper-cases and validates a team code as typed by a user.
pub fn normalize_team_code(team_code: &str) -> Result<String, CoreError> {
    let code = team_code.trim();
    if code.chars().count() != TEAM_CODE_LEN {
        return Err(CoreError::InvalidTeamCode);
    }
    Ok(code.to_uppercase())
}

/// Short, non-reversible identifier for a team code, safe to put in logs.
pub fn team_fingerprint(team_code: &str) -> String {
    let digest = Sha256::digest(team_code.as_bytes());
    hex::encode(&digest[..6])
}

pub fn now_unix_ms() -> UnixMillis {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
