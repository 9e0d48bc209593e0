use std::{
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    time::Duration,
};

use futures::future::BoxFuture;
use hikeathon_core::{
    EncryptedToken, SessionVault, TeamId, TokenSecurity, UnixMillis, normalize_team_code,
    now_unix_ms, team_fingerprint,
};
use serde::Deserialize;
use serde_json::json;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use super::Observable;
use crate::{
    api::{ApiClient, ApiRequest, AuthProvider},
    error::{ApiError, StoreError},
    realtime::RealtimeIdentity,
};

pub const AUTH_FUNCTION: &str = "auth-validate";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Team {
    pub id: TeamId,
    pub name: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AuthState {
    pub team: Option<Team>,
    pub is_admin: bool,
    pub session_expires_at: Option<UnixMillis>,
    pub is_loading: bool,
    pub error: Option<String>,
}

impl AuthState {
    pub fn is_authenticated(&self) -> bool {
        self.team.is_some()
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ValidatedTeam {
    token: String,
    #[serde(default)]
    token_id: Option<String>,
    team_name: String,
    #[serde(default)]
    is_admin: bool,
}

/// Plaintext secrets live only in memory for the lifetime of the session.
#[derive(Default)]
struct Secrets {
    team_code: Option<String>,
    token: Option<String>,
}

/// Team authentication. Holds the decrypted bearer token in memory, keeps
/// the encrypted copy in the session vault and acts as the API client's
/// `AuthProvider`.
pub struct AuthStore {
    api: ApiClient,
    security: TokenSecurity,
    vault: SessionVault,
    state: Observable<AuthState>,
    secrets: Mutex<Secrets>,
}

impl AuthStore {
    /// Builds the store and registers it as `api`'s auth provider.
    pub fn new(api: ApiClient, vault: SessionVault, security: TokenSecurity) -> Arc<Self> {
        let store = Arc::new(Self {
            api: api.clone(),
            security,
            vault,
            state: Observable::default(),
            secrets: Mutex::new(Secrets::default()),
        });
        let provider: Arc<dyn AuthProvider> = store.clone();
        api.set_auth_provider(Arc::downgrade(&provider));
        store
    }

    pub fn state(&self) -> AuthState {
        self.state.get()
    }

    pub fn subscribe(&self) -> watch::Receiver<AuthState> {
        self.state.subscribe()
    }

    pub async fn login(&self, team_code: &str) -> Result<(), StoreError> {
        self.state.update(|s| {
            s.is_loading = true;
            s.error = None;
        });

        let result = self.authenticate(team_code).await;
        self.state.update(|s| {
            s.is_loading = false;
            if let Err(err) = &result {
                s.error = Some(err.to_string());
            }
        });
        result
    }

    async fn authenticate(&self, team_code: &str) -> Result<(), StoreError> {
        let code = normalize_team_code(team_code).map_err(|_| StoreError::InvalidCredentials)?;
        let fingerprint = team_fingerprint(&code);

        let validated = match self.validate(&code).await {
            Ok(validated) => validated,
            Err(err) => {
                warn!(team = %fingerprint, "team validation failed: {err}");
                return Err(err);
            }
        };

        let security = self.security;
        let (token, code_for_seal) = (validated.token.clone(), code.clone());
        let encrypted = tokio::task::spawn_blocking(move || {
            security.encrypt_token(&token, &code_for_seal)
        })
        .await
        .map_err(|err| StoreError::Storage(format!("encryption task failed: {err}")))??;

        let envelope = self.vault.store_session(&encrypted, &validated.team_name)?;

        {
            let mut secrets = self.secrets();
            secrets.team_code = Some(code);
            secrets.token = Some(validated.token);
        }
        self.state.update(|s| {
            s.team = Some(Team {
                id: validated.team_name.clone(),
                name: validated.team_name.clone(),
            });
            s.is_admin = validated.is_admin;
            s.session_expires_at = Some(envelope.expires_at);
        });
        info!(
            team = %validated.team_name,
            fingerprint = %fingerprint,
            token_id = validated.token_id.as_deref().unwrap_or("-"),
            admin = validated.is_admin,
            "team logged in"
        );
        Ok(())
    }

    async fn validate(&self, code: &str) -> Result<ValidatedTeam, StoreError> {
        let request = ApiRequest::post(ApiClient::function_path(AUTH_FUNCTION))
            .json(json!({ "teamCode": code }))
            .skip_auth();
        let response = self.api.request(request).await?;
        match response.status().as_u16() {
            200..=299 => {}
            400 | 401 | 403 | 404 => return Err(StoreError::InvalidCredentials),
            status => {
                return Err(ApiError::Status {
                    status,
                    body: response.text(),
                }
                .into());
            }
        }
        let validated: ValidatedTeam = response.json()?;
        if validated.token.is_empty() {
            return Err(StoreError::InvalidCredentials);
        }
        Ok(validated)
    }

    /// Reopens a stored session with the team code that sealed it. Returns
    /// `false` when there is nothing to restore or the session lapsed.
    pub async fn restore_session(&self, team_code: &str) -> Result<bool, StoreError> {
        let Some(envelope) = self.vault.get_stored_session() else {
            return Ok(false);
        };
        if envelope.expires_at <= now_unix_ms() {
            debug!("stored session expired");
            self.vault.clear_session();
            return Ok(false);
        }

        let code = normalize_team_code(team_code).map_err(|_| StoreError::InvalidCredentials)?;
        let token = self.unseal(envelope.token, &code).await?;

        {
            let mut secrets = self.secrets();
            secrets.team_code = Some(code.clone());
            secrets.token = Some(token);
        }
        self.state.update(|s| {
            s.team = Some(Team {
                id: envelope.team_name.clone(),
                name: envelope.team_name.clone(),
            });
            // Admin rights are only granted by a fresh validation.
            s.is_admin = false;
            s.session_expires_at = Some(envelope.expires_at);
            s.error = None;
        });
        info!(team = %envelope.team_name, fingerprint = %team_fingerprint(&code), "session restored");
        Ok(true)
    }

    async fn unseal(&self, encrypted: EncryptedToken, code: &str) -> Result<String, StoreError> {
        let security = self.security;
        let code = code.to_owned();
        tokio::task::spawn_blocking(move || security.decrypt_token(&encrypted, &code))
            .await
            .map_err(|err| StoreError::Storage(format!("decryption task failed: {err}")))?
            .map_err(|_| StoreError::InvalidCredentials)
    }

    pub fn logout(&self) {
        let was_authenticated = self.state.read(AuthState::is_authenticated);
        self.vault.clear_session();
        *self.secrets() = Secrets::default();
        self.state.set(AuthState::default());
        if was_authenticated {
            info!("team logged out");
        }
    }

    /// Logs in again with the cached team code.
    pub async fn refresh_session(&self) -> Result<(), StoreError> {
        let code = self
            .secrets()
            .team_code
            .clone()
            .ok_or(StoreError::NotAuthenticated)?;
        self.login(&code).await
    }

    /// The bearer token while the session is valid. An expired session is
    /// logged out on the spot.
    pub fn get_token(&self) -> Option<String> {
        if !self.is_session_valid() {
            if self.secrets().token.is_some() {
                info!("session expired; logging out");
                self.logout();
            }
            return None;
        }
        self.secrets().token.clone()
    }

    pub fn is_session_valid(&self) -> bool {
        self.state
            .read(|s| s.session_expires_at.is_some_and(|at| now_unix_ms() < at))
    }

    pub fn time_until_expiry(&self) -> Duration {
        let remaining = self.state.read(|s| {
            s.session_expires_at
                .map_or(0, |at| at.saturating_sub(now_unix_ms()))
        });
        Duration::from_millis(remaining)
    }

    pub fn current_team(&self) -> Option<Team> {
        self.state.read(|s| s.team.clone())
    }

    pub fn is_admin(&self) -> bool {
        self.state.read(|s| s.team.is_some() && s.is_admin)
    }

    /// Identity for the realtime channels, if logged in. The team token is
    /// meant for the AI gateway, so channels keep using the anon key.
    pub fn realtime_identity(&self) -> Option<RealtimeIdentity> {
        let team = self.current_team()?;
        Some(RealtimeIdentity {
            team_id: team.id,
            team_name: team.name,
            access_token: None,
        })
    }

    fn secrets(&self) -> MutexGuard<'_, Secrets> {
        self.secrets.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl AuthProvider for AuthStore {
    fn bearer_token(&self) -> BoxFuture<'_, Option<String>> {
        Box::pin(async move { self.get_token() })
    }

    fn refresh(&self) -> BoxFuture<'_, Result<(), String>> {
        Box::pin(async move { self.refresh_session().await.map_err(|err| err.to_string()) })
    }

    fn force_logout(&self) -> BoxFuture<'_, ()> {
        Box::pin(async move { self.logout() })
    }
}
