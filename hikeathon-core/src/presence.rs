use std::collections::{BTreeMap, HashMap};

use crate::{
    TeamId, UnixMillis,
    protocol::{PresenceUser, TypingIndicator},
};

pub const TYPING_TTL_MS: u64 = 3_000;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PresenceRoster {
    users: BTreeMap<String, PresenceUser>,
}

impl PresenceRoster {
    pub fn sync(&mut self, state: HashMap<String, PresenceUser>) {
        self.users = state.into_iter().collect();
    }

    pub fn apply_diff(&mut self, joins: HashMap<String, PresenceUser>, leaves: &[String]) {
        for key in leaves {
            self.users.remove(key);
        }
        self.users.extend(joins);
    }

    pub fn clear(&mut self) {
        self.users.clear();
    }

    pub fn len(&self) -> usize {
        self.users.len()
    }

    pub fn is_empty(&self) -> bool {
        self.users.is_empty()
    }

    pub fn get(&self, key: &str) -> Option<&PresenceUser> {
        self.users.get(key)
    }

    pub fn users(&self) -> impl Iterator<Item = &PresenceUser> {
        self.users.values()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct TypingEntry {
    indicator: TypingIndicator,
    expires_at: UnixMillis,
}

/// Teams currently typing, excluding our own. Entries lapse
/// `TYPING_TTL_MS` after their last `isTyping` event.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TypingTracker {
    own_team: Option<TeamId>,
    entries: BTreeMap<TeamId, TypingEntry>,
}

impl TypingTracker {
    pub fn new(own_team: Option<TeamId>) -> Self {
        Self {
            own_team,
            entries: BTreeMap::new(),
        }
    }

    pub fn set_own_team(&mut self, own_team: Option<TeamId>) {
        self.own_team = own_team;
    }

    pub fn apply(&mut self, indicator: TypingIndicator, now: UnixMillis) {
        if self.own_team.as_deref() == Some(indicator.team_id.as_str()) {
            return;
        }
        if indicator.is_typing {
            self.entries.insert(
                indicator.team_id.clone(),
                TypingEntry {
                    indicator,
                    expires_at: now.saturating_add(TYPING_TTL_MS),
                },
            );
        } else {
            self.entries.remove(&indicator.team_id);
        }
    }

    pub fn prune(&mut self, now: UnixMillis) {
        self.entries.retain(|_, entry| entry.expires_at > now);
    }

    pub fn next_expiry(&self) -> Option<UnixMillis> {
        self.entries.values().map(|entry| entry.expires_at).min()
    }

    pub fn typing(&self) -> impl Iterator<Item = &TypingIndicator> {
        self.entries.values().map(|entry| &entry.indicator)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn user(id: &str) -> PresenceUser {
        PresenceUser {
            team_id: id.to_owned(),
            team_name: format!("Team {id}"),
            online_at: "2025-01-01T00:00:00Z".to_owned(),
            status: None,
        }
    }

    fn typing(id: &str, is_typing: bool) -> TypingIndicator {
        TypingIndicator {
            team_id: id.to_owned(),
            team_name: format!("Team {id}"),
            is_typing,
        }
    }

    #[test]
    fn sync_replaces_and_diff_updates() {
        let mut roster = PresenceRoster::default();
        roster.sync(HashMap::from([("a".to_owned(), user("a")), ("b".to_owned(), user("b"))]));
        assert_eq!(roster.len(), 2);

        roster.apply_diff(HashMap::from([("c".to_owned(), user("c"))]), &["a".to_owned()]);
        assert!(roster.get("a").is_none());
        assert!(roster.get("c").is_some());

        roster.sync(HashMap::new());
        assert!(roster.is_empty());
    }

    #[test]
    fn typing_expires_after_three_seconds() {
        let mut tracker = TypingTracker::new(None);
        tracker.apply(typing("t1", true), 10_000);
        tracker.prune(12_999);
        assert_eq!(tracker.len(), 1);
        tracker.prune(13_000);
        assert!(tracker.is_empty());
    }

    #[test]
    fn repeated_typing_extends_the_window() {
        let mut tracker = TypingTracker::new(None);
        tracker.apply(typing("t1", true), 0);
        tracker.apply(typing("t1", true), 2_000);
        tracker.prune(4_000);
        assert_eq!(tracker.len(), 1);
        assert_eq!(tracker.next_expiry(), Some(5_000));
    }

    #[test]
    fn explicit_stop_and_own_team_are_handled() {
        let mut tracker = TypingTracker::new(Some("me".to_owned()));
        tracker.apply(typing("me", true), 0);
        assert!(tracker.is_empty());

        tracker.apply(typing("t1", true), 0);
        tracker.apply(typing("t1", false), 100);
        assert!(tracker.is_empty());
    }
}
