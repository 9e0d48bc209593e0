use aes_gcm::{
    Aes256Gcm, KeyInit,
    aead::{Aead, Payload, generic_array::GenericArray},
};
use base64::{Engine, engine::general_purpose::STANDARD};
use serde::{Deserialize, Serialize};
use sha2::Sha256;

use crate::{CoreError, SESSION_TTL_MS, TEAM_CODE_LEN, UnixMillis, now_unix_ms};

pub const PBKDF2_ITERATIONS: u32 = 600_000;
pub const SALT_LEN: usize = 16;
pub const IV_LEN: usize = 12;
pub const KEY_LEN: usize = 32;

/// A bearer token sealed with a key derived from the team code.
///
/// All byte fields are standard base64. `timestamp` is the creation time in
/// unix milliseconds and drives the 48 hour validity window.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct EncryptedToken {
    pub ciphertext: String,
    pub salt: String,
    pub iv: String,
    pub timestamp: UnixMillis,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TokenSecurity {
    iterations: u32,
}

impl Default for TokenSecurity {
    fn default() -> Self {
        Self::new()
    }
}

impl TokenSecurity {
    #[must_use]
    pub fn new() -> Self {
        Self {
            iterations: PBKDF2_ITERATIONS,
        }
    }

    /// Lower iteration counts are only meant for tests.
    #[must_use]
    pub fn with_iterations(iterations: u32) -> Self {
        Self {
            iterations: iterations.max(1),
        }
    }

    pub fn iterations(&self) -> u32 {
        self.iterations
    }

    pub fn encrypt_token(&self, token: &str, team_code: &str) -> Result<EncryptedToken, CoreError> {
        check_inputs(token, team_code)?;

        let salt: [u8; SALT_LEN] = rand::random();
        let iv: [u8; IV_LEN] = rand::random();
        let key = self.derive_key(team_code, &salt);

        let cipher =
            Aes256Gcm::new_from_slice(&key).map_err(|_| CoreError::EncryptionFailed)?;
        let ciphertext = cipher
            .encrypt(
                GenericArray::from_slice(&iv),
                Payload {
                    msg: token.as_bytes(),
                    aad: &[],
                },
            )
            .map_err(|_| CoreError::EncryptionFailed)?;

        Ok(EncryptedToken {
            ciphertext: STANDARD.encode(ciphertext),
            salt: STANDARD.encode(salt),
            iv: STANDARD.encode(iv),
            timestamp: now_unix_ms(),
        })
    }

    pub fn decrypt_token(
        &self,
        encrypted: &EncryptedToken,
        team_code: &str,
    ) -> Result<String, CoreError> {
        if team_code.is_empty() {
            return Err(CoreError::MissingInput);
        }
        if team_code.chars().count() != TEAM_CODE_LEN {
            return Err(CoreError::InvalidTeamCode);
        }

        // Every failure below collapses into the same error: callers must not
        // learn whether the code was wrong or the blob was damaged.
        let salt = STANDARD
            .decode(&encrypted.salt)
            .map_err(|_| CoreError::DecryptionFailed)?;
        let iv = STANDARD
            .decode(&encrypted.iv)
            .map_err(|_| CoreError::DecryptionFailed)?;
        let ciphertext = STANDARD
            .decode(&encrypted.ciphertext)
            .map_err(|_| CoreError::DecryptionFailed)?;
        if iv.len() != IV_LEN {
            return Err(CoreError::DecryptionFailed);
        }

        let key = self.derive_key(team_code, &salt);
        let cipher =
            Aes256Gcm::new_from_slice(&key).map_err(|_| CoreError::DecryptionFailed)?;
        let plaintext = cipher
            .decrypt(
                GenericArray::from_slice(&iv),
                Payload {
                    msg: ciphertext.as_slice(),
                    aad: &[],
                },
            )
            .map_err(|_| CoreError::DecryptionFailed)?;

        String::from_utf8(plaintext).map_err(|_| CoreError::DecryptionFailed)
    }

    fn derive_key(&self, team_code: &str, salt: &[u8]) -> [u8; KEY_LEN] {
        let mut key = [0_u8; KEY_LEN];
        pbkdf2::pbkdf2_hmac::<Sha256>(team_code.as_bytes(), salt, self.iterations, &mut key);
        key
    }
}

pub fn is_session_valid(encrypted: &EncryptedToken) -> bool {
    is_session_valid_at(encrypted, now_unix_ms())
}

pub fn is_session_valid_at(encrypted: &EncryptedToken, now: UnixMillis) -> bool {
    now.saturating_sub(encrypted.timestamp) < SESSION_TTL_MS
}

fn check_inputs(token: &str, team_code: &str) -> Result<(), CoreError> {
    if token.is_empty() || team_code.is_empty() {
        return Err(CoreError::MissingInput);
    }
    if team_code.chars().count() != TEAM_CODE_LEN {
        return Err(CoreError::InvalidTeamCode);
    }
    Ok(())
}
