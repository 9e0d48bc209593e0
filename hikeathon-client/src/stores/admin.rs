use std::{sync::Arc, time::Duration};

use chrono::{DateTime, Utc};
use hikeathon_core::{
    UnixMillis, now_unix_ms,
    records::{BroadcastStats, TodoStats},
};
use serde::Serialize;
use serde_json::{Value, json};
use tokio::sync::watch;
use tracing::{info, warn};
use uuid::Uuid;

use super::{AuthStore, BroadcastService, Observable, TodoService};
use crate::error::StoreError;

pub const ADMIN_SESSION_TTL_MS: u64 = 2 * 60 * 60 * 1000;
pub const AUDIT_LOG_CAP: usize = 1000;
pub const DEFAULT_AUDIT_LIMIT: usize = 100;
pub const ALL_PERMISSIONS: &str = "*";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdminSession {
    pub token: String,
    pub team_name: String,
    pub permissions: Vec<String>,
    pub expires_at: UnixMillis,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditEntry {
    pub id: String,
    pub actor: String,
    pub action: String,
    pub resource: String,
    pub details: Value,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Default)]
pub struct AuditFilters {
    pub actor: Option<String>,
    /// Substring match on the action name.
    pub action: Option<String>,
    pub resource: Option<String>,
    pub from: Option<DateTime<Utc>>,
    pub to: Option<DateTime<Utc>>,
    /// Defaults to 100.
    pub limit: Option<usize>,
}

impl AuditFilters {
    fn matches(&self, entry: &AuditEntry) -> bool {
        self.actor.as_ref().is_none_or(|actor| &entry.actor == actor)
            && self
                .action
                .as_ref()
                .is_none_or(|action| entry.action.contains(action.as_str()))
            && self
                .resource
                .as_ref()
                .is_none_or(|resource| &entry.resource == resource)
            && self.from.is_none_or(|from| entry.timestamp >= from)
            && self.to.is_none_or(|to| entry.timestamp <= to)
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct AdminState {
    pub session: Option<AdminSession>,
    /// Newest first.
    pub audit_log: Vec<AuditEntry>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AdminDashboard {
    pub todos: TodoStats,
    pub broadcasts: BroadcastStats,
}

/// Admin session gate and audit trail. Sessions are only granted to teams
/// the auth function flagged as admin, and last two hours.
pub struct AdminStore {
    auth: Arc<AuthStore>,
    todos: TodoService,
    broadcasts: BroadcastService,
    state: Observable<AdminState>,
}

impl AdminStore {
    pub fn new(auth: Arc<AuthStore>, todos: TodoService, broadcasts: BroadcastService) -> Self {
        Self {
            auth,
            todos,
            broadcasts,
            state: Observable::default(),
        }
    }

    pub fn state(&self) -> AdminState {
        self.state.get()
    }

    pub fn subscribe(&self) -> watch::Receiver<AdminState> {
        self.state.subscribe()
    }

    /// Opens an admin session for the logged-in team.
    pub fn open_session(&self) -> Result<AdminSession, StoreError> {
        let Some(team) = self.auth.current_team() else {
            return Err(StoreError::NotAuthenticated);
        };
        if !self.auth.is_admin() {
            warn!(team = %team.name, "admin session refused");
            self.log_action(&team.name, "admin_login_attempt", "auth", json!({ "success": false }));
            return Err(StoreError::PermissionDenied("admin".to_owned()));
        }

        let session = AdminSession {
            token: format!("admin_{}", Uuid::new_v4().simple()),
            team_name: team.name.clone(),
            permissions: vec![ALL_PERMISSIONS.to_owned()],
            expires_at: now_unix_ms() + ADMIN_SESSION_TTL_MS,
        };
        self.state.update(|s| s.session = Some(session.clone()));
        self.log_action(&team.name, "admin_login_success", "auth", json!({ "sessionDuration": "2h" }));
        info!(team = %team.name, "admin session opened");
        Ok(session)
    }

    pub fn close_session(&self) {
        let closed = self.state.read(|s| s.session.clone());
        self.state.update(|s| s.session = None);
        if let Some(session) = closed {
            self.log_action(&session.team_name, "admin_logout", "auth", Value::Null);
            info!(team = %session.team_name, "admin session closed");
        }
    }

    pub fn is_session_valid(&self) -> bool {
        self.state
            .read(|s| s.session.as_ref().is_some_and(|session| now_unix_ms() < session.expires_at))
    }

    pub fn session_time_remaining(&self) -> Duration {
        let remaining = self.state.read(|s| {
            s.session
                .as_ref()
                .map_or(0, |session| session.expires_at.saturating_sub(now_unix_ms()))
        });
        Duration::from_millis(remaining)
    }

    pub fn has_permission(&self, permission: &str) -> bool {
        self.is_session_valid()
            && self.state.read(|s| {
                s.session.as_ref().is_some_and(|session| {
                    session
                        .permissions
                        .iter()
                        .any(|granted| granted == ALL_PERMISSIONS || granted == permission)
                })
            })
    }

    pub fn require_permission(&self, permission: &str) -> Result<(), StoreError> {
        if !self.is_session_valid() {
            return Err(StoreError::NotAuthenticated);
        }
        if !self.has_permission(permission) {
            return Err(StoreError::PermissionDenied(permission.to_owned()));
        }
        Ok(())
    }

    /// Records an action at the head of the audit log.
    pub fn record(&self, action: &str, resource: &str, details: Value) {
        let actor = self
            .state
            .read(|s| s.session.as_ref().map(|session| session.team_name.clone()))
            .unwrap_or_else(|| "unknown".to_owned());
        self.log_action(&actor, action, resource, details);
    }

    fn log_action(&self, actor: &str, action: &str, resource: &str, details: Value) {
        let entry = AuditEntry {
            id: Uuid::new_v4().to_string(),
            actor: actor.to_owned(),
            action: action.to_owned(),
            resource: resource.to_owned(),
            details,
            timestamp: Utc::now(),
        };
        info!(actor, action, resource, "admin action");
        self.state.update(|s| {
            s.audit_log.insert(0, entry);
            s.audit_log.truncate(AUDIT_LOG_CAP);
        });
    }

    pub fn audit_log(&self, filters: &AuditFilters) -> Vec<AuditEntry> {
        let limit = filters.limit.unwrap_or(DEFAULT_AUDIT_LIMIT);
        self.state.read(|s| {
            s.audit_log
                .iter()
                .filter(|entry| filters.matches(entry))
                .take(limit)
                .cloned()
                .collect()
        })
    }

    /// Todo and broadcast statistics for the admin overview.
    pub async fn dashboard(&self) -> Result<AdminDashboard, StoreError> {
        self.require_permission("dashboard.view")?;
        let (todos, broadcasts) = tokio::try_join!(self.todos.stats(), self.broadcasts.stats())?;
        self.record("dashboard_viewed", "dashboard", Value::Null);
        Ok(AdminDashboard { todos, broadcasts })
    }
}

#[cfg(test)]
mod tests {
    use hikeathon_core::{MemoryStore, SessionVault, TokenSecurity};

    use super::*;
    use crate::{api::ApiClient, backend::Backend};

    fn store() -> AdminStore {
        let api = ApiClient::new("http://127.0.0.1:9", "anon").unwrap();
        let vault = SessionVault::new(Arc::new(MemoryStore::new()), Arc::new(MemoryStore::new()));
        let auth = AuthStore::new(api.clone(), vault, TokenSecurity::with_iterations(1_000));
        let backend = Backend::new(api);
        AdminStore::new(auth, TodoService::new(backend.clone()), BroadcastService::new(backend))
    }

    #[test]
    fn sessions_require_a_logged_in_admin_team() {
        let admin = store();
        assert!(matches!(admin.open_session(), Err(StoreError::NotAuthenticated)));
        assert!(!admin.has_permission("todos.write"));
        assert!(matches!(
            admin.require_permission("todos.write"),
            Err(StoreError::NotAuthenticated)
        ));
        assert_eq!(admin.session_time_remaining(), Duration::ZERO);
    }

    #[test]
    fn audit_log_is_capped_and_filtered() {
        let admin = store();
        for i in 0..1005 {
            let resource = if i % 2 == 0 { "todos" } else { "broadcasts" };
            admin.record(&format!("update_{i}"), resource, json!({ "n": i }));
        }
        let state = admin.state();
        assert_eq!(state.audit_log.len(), AUDIT_LOG_CAP);
        assert_eq!(state.audit_log[0].action, "update_1004");
        assert_eq!(state.audit_log[0].actor, "unknown");

        let todos = admin.audit_log(&AuditFilters {
            resource: Some("todos".to_owned()),
            ..AuditFilters::default()
        });
        assert_eq!(todos.len(), DEFAULT_AUDIT_LIMIT);
        assert!(todos.iter().all(|entry| entry.resource == "todos"));

        let one = admin.audit_log(&AuditFilters {
            action: Some("update_1003".to_owned()),
            limit: Some(5),
            ..AuditFilters::default()
        });
        assert_eq!(one.len(), 1);
        assert_eq!(one[0].details, json!({ "n": 1003 }));
    }
}
