use std::collections::BTreeMap;

use chrono::{DateTime, Days, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

use crate::protocol::BroadcastKind;

const ACTIVITY_WINDOW_DAYS: u64 = 7;
const COUNTDOWN_GRACE_MS: i64 = 5 * 60 * 1000;
const DAY_MS: f64 = 24.0 * 60.0 * 60.0 * 1000.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TodoStatus {
    #[default]
    Open,
    InProgress,
    Completed,
    Blocked,
}

impl TodoStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            TodoStatus::Open => "open",
            TodoStatus::InProgress => "in_progress",
            TodoStatus::Completed => "completed",
            TodoStatus::Blocked => "blocked",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Todo {
    pub id: String,
    pub title: String,
    #[serde(default)]
    pub description: Option<String>,
    pub is_global: bool,
    pub priority: i32,
    pub category: String,
    pub status: TodoStatus,
    pub estimated_points: i32,
    #[serde(default)]
    pub actual_points: Option<i32>,
    #[serde(default)]
    pub assignee: Option<String>,
    #[serde(default)]
    pub due_date: Option<DateTime<Utc>>,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Todo {
    pub fn is_overdue_at(&self, now: DateTime<Utc>) -> bool {
        self.status != TodoStatus::Completed && self.due_date.is_some_and(|due| due < now)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct TodoFormData {
    pub title: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub is_global: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub priority: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub category: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<TodoStatus>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub estimated_points: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub assignee: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub due_date: Option<DateTime<Utc>>,
}

/// Row sent on insert, with server-side defaults made explicit.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct NewTodo {
    pub title: String,
    pub description: Option<String>,
    pub is_global: bool,
    pub priority: i32,
    pub category: String,
    pub status: TodoStatus,
    pub estimated_points: i32,
    pub assignee: Option<String>,
    pub due_date: Option<DateTime<Utc>>,
}

impl From<TodoFormData> for NewTodo {
    fn from(form: TodoFormData) -> Self {
        Self {
            title: form.title,
            description: form.description,
            is_global: form.is_global.unwrap_or(true),
            priority: form.priority.unwrap_or(0),
            category: form
                .category
                .filter(|category| !category.is_empty())
                .unwrap_or_else(|| "general".to_owned()),
            status: form.status.unwrap_or_default(),
            estimated_points: form.estimated_points.filter(|p| *p > 0).unwrap_or(1),
            assignee: form.assignee,
            due_date: form.due_date,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, PartialEq)]
pub struct TodoUpdate {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub is_global: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub priority: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub category: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<TodoStatus>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub estimated_points: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub actual_points: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub assignee: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub due_date: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
}

impl TodoUpdate {
    /// Completing a todo records when it happened unless the caller did.
    pub fn stamped(mut self, now: DateTime<Utc>) -> Self {
        if self.status == Some(TodoStatus::Completed) && self.completed_at.is_none() {
            self.completed_at = Some(now);
        }
        self
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct TodoFilters {
    pub category: Option<String>,
    pub status: Option<TodoStatus>,
    pub assignee: Option<String>,
    pub is_global: Option<bool>,
    pub priority_min: Option<i32>,
    pub priority_max: Option<i32>,
    pub due_before: Option<DateTime<Utc>>,
    pub due_after: Option<DateTime<Utc>>,
    pub overdue: Option<bool>,
}

impl TodoFilters {
    /// The overdue filter runs client-side; everything else is pushed to the query.
    pub fn retain_overdue(&self, todos: &mut Vec<Todo>, now: DateTime<Utc>) {
        if let Some(overdue) = self.overdue {
            todos.retain(|todo| todo.is_overdue_at(now) == overdue);
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TeamTodo {
    pub id: String,
    pub team_id: String,
    pub todo_id: String,
    pub completed: bool,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub notes: Option<String>,
    pub progress_percentage: i32,
    #[serde(default)]
    pub todo: Option<Todo>,
}

/// Upsert row for `team_todos`. Anything short of 100 % clears the
/// completion so a finished todo can be reopened.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct TeamTodoProgress {
    pub team_id: String,
    pub todo_id: String,
    pub progress_percentage: i32,
    pub notes: Option<String>,
    pub completed: bool,
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
}

impl TeamTodoProgress {
    pub fn new(
        team_id: &str,
        todo_id: &str,
        progress: i32,
        notes: Option<String>,
        now: DateTime<Utc>,
    ) -> Self {
        let progress_percentage = progress.clamp(0, 100);
        let completed = progress_percentage == 100;
        Self {
            team_id: team_id.to_owned(),
            todo_id: todo_id.to_owned(),
            progress_percentage,
            notes: notes.filter(|n| !n.is_empty()),
            completed,
            completed_at: completed.then_some(now),
            started_at: (progress_percentage > 0 && !completed).then_some(now),
        }
    }
}

#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TeamProgress {
    pub team_id: String,
    pub team_name: Option<String>,
    pub total_todos: usize,
    pub completed_todos: usize,
    pub completion_rate: f64,
    pub average_progress: f64,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TodoActivity {
    pub date: NaiveDate,
    pub created: usize,
    pub completed: usize,
    pub in_progress: usize,
}

#[derive(Debug, Clone, Default, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TodoStats {
    pub total_todos: usize,
    pub completed_todos: usize,
    pub in_progress_todos: usize,
    pub blocked_todos: usize,
    pub overdue_todos: usize,
    /// Days from creation to completion, averaged over completed todos.
    pub average_completion_time: f64,
    pub completion_rate: f64,
    pub by_category: BTreeMap<String, usize>,
    pub by_priority: BTreeMap<i32, usize>,
    pub by_status: BTreeMap<String, usize>,
    pub team_progress: Vec<TeamProgress>,
    pub recent_activity: Vec<TodoActivity>,
}

pub fn todo_stats(todos: &[Todo], team_todos: &[TeamTodo], now: DateTime<Utc>) -> TodoStats {
    let mut stats = TodoStats {
        total_todos: todos.len(),
        ..TodoStats::default()
    };

    let mut completion_days = 0.0;
    let mut timed_completions = 0_usize;
    for todo in todos {
        match todo.status {
            TodoStatus::Completed => {
                stats.completed_todos += 1;
                if let Some(done) = todo.completed_at {
                    let elapsed = (done - todo.created_at).num_milliseconds() as f64;
                    completion_days += elapsed / DAY_MS;
                    timed_completions += 1;
                }
            }
            TodoStatus::InProgress => stats.in_progress_todos += 1,
            TodoStatus::Blocked => stats.blocked_todos += 1,
            TodoStatus::Open => {}
        }
        if todo.is_overdue_at(now) {
            stats.overdue_todos += 1;
        }
        *stats.by_category.entry(todo.category.clone()).or_default() += 1;
        *stats.by_priority.entry(todo.priority).or_default() += 1;
        *stats
            .by_status
            .entry(todo.status.as_str().to_owned())
            .or_default() += 1;
    }

    stats.completion_rate = percentage(stats.completed_todos, stats.total_todos);
    if timed_completions > 0 {
        stats.average_completion_time = completion_days / timed_completions as f64;
    }
    stats.team_progress = team_progress(team_todos);

    let mut activity: BTreeMap<NaiveDate, TodoActivity> = activity_window(now)
        .map(|date| {
            (
                date,
                TodoActivity {
                    date,
                    created: 0,
                    completed: 0,
                    in_progress: 0,
                },
            )
        })
        .collect();
    for todo in todos {
        if let Some(day) = activity.get_mut(&todo.created_at.date_naive()) {
            day.created += 1;
        }
        if let Some(done) = todo.completed_at
            && let Some(day) = activity.get_mut(&done.date_naive())
        {
            day.completed += 1;
        }
        if todo.status == TodoStatus::InProgress
            && let Some(day) = activity.get_mut(&todo.updated_at.date_naive())
        {
            day.in_progress += 1;
        }
    }
    stats.recent_activity = activity.into_values().collect();
    stats
}

pub fn team_progress(team_todos: &[TeamTodo]) -> Vec<TeamProgress> {
    struct Tally {
        total: usize,
        completed: usize,
        progress: i64,
    }

    let mut teams: BTreeMap<&str, Tally> = BTreeMap::new();
    for entry in team_todos {
        let tally = teams.entry(entry.team_id.as_str()).or_insert(Tally {
            total: 0,
            completed: 0,
            progress: 0,
        });
        tally.total += 1;
        tally.progress += i64::from(entry.progress_percentage);
        if entry.completed {
            tally.completed += 1;
        }
    }

    teams
        .into_iter()
        .map(|(team_id, tally)| TeamProgress {
            team_id: team_id.to_owned(),
            team_name: None,
            total_todos: tally.total,
            completed_todos: tally.completed,
            completion_rate: percentage(tally.completed, tally.total),
            average_progress: tally.progress as f64 / tally.total as f64,
        })
        .collect()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BroadcastPriority {
    Low,
    #[default]
    Normal,
    High,
    Urgent,
}

impl BroadcastPriority {
    pub const ALL: [BroadcastPriority; 4] = [
        BroadcastPriority::Low,
        BroadcastPriority::Normal,
        BroadcastPriority::High,
        BroadcastPriority::Urgent,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            BroadcastPriority::Low => "low",
            BroadcastPriority::Normal => "normal",
            BroadcastPriority::High => "high",
            BroadcastPriority::Urgent => "urgent",
        }
    }

    pub fn kind(self) -> BroadcastKind {
        match self {
            BroadcastPriority::Urgent => BroadcastKind::Error,
            BroadcastPriority::High => BroadcastKind::Warning,
            BroadcastPriority::Low => BroadcastKind::Info,
            BroadcastPriority::Normal => BroadcastKind::Success,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BroadcastRecord {
    pub id: String,
    pub title: String,
    pub message: String,
    pub priority: BroadcastPriority,
    pub active: bool,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub expires_at: Option<DateTime<Utc>>,
}

impl BroadcastRecord {
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|expires| expires < now)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct BroadcastFormData {
    pub title: String,
    pub message: String,
    #[serde(default)]
    pub priority: BroadcastPriority,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub active: Option<bool>,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct NewBroadcast {
    pub title: String,
    pub message: String,
    pub priority: BroadcastPriority,
    pub expires_at: Option<DateTime<Utc>>,
    pub active: bool,
}

impl From<BroadcastFormData> for NewBroadcast {
    fn from(form: BroadcastFormData) -> Self {
        Self {
            title: form.title,
            message: form.message,
            priority: form.priority,
            expires_at: form.expires_at,
            active: form.active.unwrap_or(true),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, PartialEq)]
pub struct BroadcastUpdate {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub priority: Option<BroadcastPriority>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub active: Option<bool>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct BroadcastFilters {
    pub priority: Option<BroadcastPriority>,
    pub active: Option<bool>,
    pub expired: Option<bool>,
    pub from: Option<DateTime<Utc>>,
    pub to: Option<DateTime<Utc>>,
}

impl BroadcastFilters {
    pub fn retain_expired(&self, records: &mut Vec<BroadcastRecord>, now: DateTime<Utc>) {
        if let Some(expired) = self.expired {
            records.retain(|record| record.is_expired_at(now) == expired);
        }
    }
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct DailyCount {
    pub date: NaiveDate,
    pub count: usize,
}

#[derive(Debug, Clone, Default, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct BroadcastStats {
    pub total: usize,
    pub active: usize,
    pub expired: usize,
    pub by_priority: BTreeMap<String, usize>,
    pub recent_activity: Vec<DailyCount>,
}

pub fn broadcast_stats(records: &[BroadcastRecord], now: DateTime<Utc>) -> BroadcastStats {
    let mut stats = BroadcastStats {
        total: records.len(),
        by_priority: BroadcastPriority::ALL
            .iter()
            .map(|priority| (priority.as_str().to_owned(), 0))
            .collect(),
        ..BroadcastStats::default()
    };

    let mut activity: BTreeMap<NaiveDate, usize> = activity_window(now).map(|d| (d, 0)).collect();
    for record in records {
        *stats
            .by_priority
            .entry(record.priority.as_str().to_owned())
            .or_default() += 1;

        let expired = record.is_expired_at(now);
        if expired {
            stats.expired += 1;
        } else if record.active {
            stats.active += 1;
        }

        if let Some(count) = activity.get_mut(&record.created_at.date_naive()) {
            *count += 1;
        }
    }

    stats.recent_activity = activity
        .into_iter()
        .map(|(date, count)| DailyCount { date, count })
        .collect();
    stats
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Countdown {
    pub id: String,
    pub title: String,
    pub deadline: DateTime<Utc>,
    pub active: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, Default, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct TimeRemaining {
    pub days: i64,
    pub hours: i64,
    pub minutes: i64,
    pub seconds: i64,
    /// Milliseconds until the deadline, negative once it has passed.
    pub total: i64,
    pub is_past: bool,
}

impl Countdown {
    /// Active countdowns stay visible until five minutes past the deadline.
    pub fn is_visible_at(&self, now: DateTime<Utc>) -> bool {
        self.active && (now - self.deadline).num_milliseconds() <= COUNTDOWN_GRACE_MS
    }

    pub fn time_remaining_at(&self, now: DateTime<Utc>) -> TimeRemaining {
        let total = (self.deadline - now).num_milliseconds();
        let abs = total.unsigned_abs() as i64;
        TimeRemaining {
            days: abs / 86_400_000,
            hours: abs % 86_400_000 / 3_600_000,
            minutes: abs % 3_600_000 / 60_000,
            seconds: abs % 60_000 / 1_000,
            total,
            is_past: total < 0,
        }
    }
}

fn activity_window(now: DateTime<Utc>) -> impl Iterator<Item = NaiveDate> {
    let today = now.date_naive();
    (0..ACTIVITY_WINDOW_DAYS)
        .rev()
        .filter_map(move |back| today.checked_sub_days(Days::new(back)))
}

fn percentage(part: usize, whole: usize) -> f64 {
    if whole == 0 {
        0.0
    } else {
        part as f64 / whole as f64 * 100.0
    }
}

#[cfg(test)]
mod tests {
    use chrono::{Duration, TimeZone};

    use super::*;

    fn at(day: u32, hour: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 3, day, hour, 0, 0).unwrap()
    }

    fn todo(id: &str, status: TodoStatus, created: DateTime<Utc>) -> Todo {
        Todo {
            id: id.to_owned(),
            title: format!("Todo {id}"),
            description: None,
            is_global: true,
            priority: 1,
            category: "general".to_owned(),
            status,
            estimated_points: 1,
            actual_points: None,
            assignee: None,
            due_date: None,
            completed_at: None,
            created_at: created,
            updated_at: created,
        }
    }

    fn team_todo(team: &str, progress: i32, completed: bool) -> TeamTodo {
        TeamTodo {
            id: format!("{team}-{progress}"),
            team_id: team.to_owned(),
            todo_id: "t".to_owned(),
            completed,
            started_at: None,
            completed_at: None,
            updated_at: at(1, 0),
            notes: None,
            progress_percentage: progress,
            todo: None,
        }
    }

    #[test]
    fn new_todo_applies_defaults() {
        let row = NewTodo::from(TodoFormData {
            title: "Ship it".to_owned(),
            ..TodoFormData::default()
        });
        assert!(row.is_global);
        assert_eq!(row.priority, 0);
        assert_eq!(row.category, "general");
        assert_eq!(row.status, TodoStatus::Open);
        assert_eq!(row.estimated_points, 1);

        let json = serde_json::to_value(&row).unwrap();
        assert_eq!(json["status"], "open");
    }

    #[test]
    fn completing_a_todo_stamps_completion_time() {
        let now = at(10, 12);
        let update = TodoUpdate {
            status: Some(TodoStatus::Completed),
            ..TodoUpdate::default()
        }
        .stamped(now);
        assert_eq!(update.completed_at, Some(now));

        let untouched = TodoUpdate {
            title: Some("x".to_owned()),
            ..TodoUpdate::default()
        }
        .stamped(now);
        assert!(untouched.completed_at.is_none());
        assert_eq!(serde_json::to_value(&untouched).unwrap(), serde_json::json!({"title": "x"}));
    }

    #[test]
    fn overdue_filter_excludes_completed() {
        let now = at(10, 12);
        let mut late = todo("late", TodoStatus::Open, at(1, 0));
        late.due_date = Some(at(5, 0));
        let mut done = todo("done", TodoStatus::Completed, at(1, 0));
        done.due_date = Some(at(5, 0));
        let fresh = todo("fresh", TodoStatus::Open, at(1, 0));

        let filters = TodoFilters {
            overdue: Some(true),
            ..TodoFilters::default()
        };
        let mut todos = vec![late, done, fresh];
        filters.retain_overdue(&mut todos, now);
        assert_eq!(todos.len(), 1);
        assert_eq!(todos[0].id, "late");
    }

    #[test]
    fn team_progress_update_tracks_completion() {
        let now = at(10, 12);
        let done = TeamTodoProgress::new("team", "todo", 150, None, now);
        assert_eq!(done.progress_percentage, 100);
        assert!(done.completed);
        assert_eq!(done.completed_at, Some(now));

        let started = TeamTodoProgress::new("team", "todo", 40, Some("halfway".into()), now);
        assert!(!started.completed);
        assert_eq!(started.completed_at, None);
        assert_eq!(started.started_at, Some(now));

        let idle = TeamTodoProgress::new("team", "todo", -5, None, now);
        assert_eq!(idle.progress_percentage, 0);
        assert!(!idle.completed);
        assert_eq!(idle.started_at, None);
        let row = serde_json::to_value(&idle).expect("json");
        assert_eq!(row["completed"], false);
        assert!(row["completed_at"].is_null());
    }

    #[test]
    fn todo_stats_aggregate_everything() {
        let now = at(10, 12);
        let mut done = todo("a", TodoStatus::Completed, at(8, 12));
        done.completed_at = Some(at(9, 12));
        let mut working = todo("b", TodoStatus::InProgress, at(9, 0));
        working.updated_at = at(10, 0);
        working.category = "backend".to_owned();
        let mut late = todo("c", TodoStatus::Blocked, at(1, 0));
        late.due_date = Some(at(2, 0));

        let teams = [
            team_todo("t1", 100, true),
            team_todo("t1", 50, false),
            team_todo("t2", 0, false),
        ];
        let stats = todo_stats(&[done, working, late], &teams, now);

        assert_eq!(stats.total_todos, 3);
        assert_eq!(stats.completed_todos, 1);
        assert_eq!(stats.in_progress_todos, 1);
        assert_eq!(stats.blocked_todos, 1);
        assert_eq!(stats.overdue_todos, 1);
        assert!((stats.average_completion_time - 1.0).abs() < 1e-9);
        assert!((stats.completion_rate - 100.0 / 3.0).abs() < 1e-9);
        assert_eq!(stats.by_category["general"], 2);
        assert_eq!(stats.by_status["in_progress"], 1);

        assert_eq!(stats.team_progress.len(), 2);
        assert_eq!(stats.team_progress[0].completion_rate, 50.0);
        assert_eq!(stats.team_progress[0].average_progress, 75.0);

        assert_eq!(stats.recent_activity.len(), 7);
        let today = stats.recent_activity.last().unwrap();
        assert_eq!(today.date, now.date_naive());
        assert_eq!(today.in_progress, 1);
        let ninth = &stats.recent_activity[5];
        assert_eq!(ninth.completed, 1);
        assert_eq!(ninth.created, 1);
    }

    #[test]
    fn priority_maps_to_message_kind() {
        assert_eq!(BroadcastPriority::Urgent.kind(), BroadcastKind::Error);
        assert_eq!(BroadcastPriority::High.kind(), BroadcastKind::Warning);
        assert_eq!(BroadcastPriority::Low.kind(), BroadcastKind::Info);
        assert_eq!(BroadcastPriority::Normal.kind(), BroadcastKind::Success);
    }

    #[test]
    fn broadcast_stats_count_priorities_and_expiry() {
        let now = at(10, 12);
        let record = |id: &str,
                      priority: BroadcastPriority,
                      active: bool,
                      expires_at: Option<DateTime<Utc>>| BroadcastRecord {
            id: id.to_owned(),
            title: id.to_owned(),
            message: "hello".to_owned(),
            priority,
            active,
            created_at: at(10, 8),
            expires_at,
        };
        let records = [
            record("a", BroadcastPriority::Urgent, true, None),
            record("b", BroadcastPriority::Low, true, Some(at(9, 0))),
            record("c", BroadcastPriority::Low, false, None),
        ];
        let stats = broadcast_stats(&records, now);

        assert_eq!(stats.total, 3);
        assert_eq!(stats.active, 1);
        assert_eq!(stats.expired, 1);
        assert_eq!(stats.by_priority["low"], 2);
        assert_eq!(stats.by_priority["high"], 0);
        assert_eq!(stats.recent_activity.last().map(|d| d.count), Some(3));
    }

    #[test]
    fn countdown_visibility_and_breakdown() {
        let deadline = at(10, 12);
        let countdown = Countdown {
            id: "c".to_owned(),
            title: "Final pitch".to_owned(),
            deadline,
            active: true,
            created_at: at(1, 0),
            updated_at: at(1, 0),
        };

        assert!(countdown.is_visible_at(deadline - Duration::hours(1)));
        assert!(countdown.is_visible_at(deadline + Duration::minutes(5)));
        assert!(!countdown.is_visible_at(deadline + Duration::minutes(6)));

        let left = countdown.time_remaining_at(deadline - Duration::seconds(90_061));
        assert_eq!((left.days, left.hours, left.minutes, left.seconds), (1, 1, 1, 1));
        assert!(!left.is_past);

        let over = countdown.time_remaining_at(deadline + Duration::seconds(30));
        assert!(over.is_past);
        assert_eq!(over.seconds, 30);
        assert_eq!(over.total, -30_000);

        let inactive = Countdown {
            active: false,
            ..countdown
        };
        assert!(!inactive.is_visible_at(deadline));
    }
}
