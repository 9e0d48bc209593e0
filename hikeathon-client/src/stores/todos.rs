use std::collections::BTreeSet;

use chrono::{DateTime, SecondsFormat, Utc};
use hikeathon_core::records::{
    NewTodo, TeamTodo, TeamTodoProgress, Todo, TodoFilters, TodoFormData, TodoStats, TodoUpdate,
    todo_stats,
};
use serde_json::{Map, Value};
use tracing::{debug, info};

use crate::{backend::Backend, error::StoreError};

pub const TODOS_TABLE: &str = "todos";
pub const TEAM_TODOS_TABLE: &str = "team_todos";
const TEAM_TODO_COLUMNS: &str = "*,todo:todos(*)";
const TEAM_TODO_KEY: &str = "team_id,todo_id";

/// CRUD over the shared `todos` table and per-team progress in `team_todos`.
#[derive(Clone)]
pub struct TodoService {
    backend: Backend,
}

impl TodoService {
    pub fn new(backend: Backend) -> Self {
        Self { backend }
    }

    pub async fn create(&self, form: TodoFormData) -> Result<Todo, StoreError> {
        let todo: Todo = self
            .backend
            .from(TODOS_TABLE)
            .insert(&NewTodo::from(form))
            .await?;
        info!(id = %todo.id, category = %todo.category, "todo created");
        Ok(todo)
    }

    /// Completing a todo stamps `completed_at` unless the caller set it.
    pub async fn update(&self, id: &str, changes: TodoUpdate) -> Result<Todo, StoreError> {
        let changes = changes.stamped(Utc::now());
        let rows: Vec<Todo> = self
            .backend
            .from(TODOS_TABLE)
            .eq("id", id)
            .update(&changes)
            .await?;
        rows.into_iter()
            .next()
            .ok_or_else(|| StoreError::NotFound(format!("todo {id}")))
    }

    pub async fn delete(&self, id: &str) -> Result<(), StoreError> {
        self.backend.from(TODOS_TABLE).eq("id", id).delete().await?;
        info!(id, "todo deleted");
        Ok(())
    }

    /// Highest priority first, then newest.
    pub async fn list(&self, filters: &TodoFilters) -> Result<Vec<Todo>, StoreError> {
        let mut query = self
            .backend
            .from(TODOS_TABLE)
            .order("priority", false)
            .order("created_at", false);
        if let Some(category) = &filters.category {
            query = query.eq("category", category);
        }
        if let Some(status) = filters.status {
            query = query.eq("status", status.as_str());
        }
        if let Some(assignee) = &filters.assignee {
            query = query.eq("assignee", assignee);
        }
        if let Some(is_global) = filters.is_global {
            query = query.eq("is_global", is_global);
        }
        if let Some(min) = filters.priority_min {
            query = query.gte("priority", min);
        }
        if let Some(max) = filters.priority_max {
            query = query.lte("priority", max);
        }
        if let Some(before) = filters.due_before {
            query = query.lte("due_date", iso(before));
        }
        if let Some(after) = filters.due_after {
            query = query.gte("due_date", iso(after));
        }
        let mut todos: Vec<Todo> = query.fetch().await?;
        filters.retain_overdue(&mut todos, Utc::now());
        debug!(count = todos.len(), "todos listed");
        Ok(todos)
    }

    pub async fn get(&self, id: &str) -> Result<Option<Todo>, StoreError> {
        Ok(self.backend.from(TODOS_TABLE).eq("id", id).single().await?)
    }

    /// Progress rows with their todo embedded, for one team or all of them.
    pub async fn team_todos(&self, team_id: Option<&str>) -> Result<Vec<TeamTodo>, StoreError> {
        let mut query = self.backend.from(TEAM_TODOS_TABLE).select(TEAM_TODO_COLUMNS);
        if let Some(team_id) = team_id {
            query = query.eq("team_id", team_id);
        }
        Ok(query.fetch().await?)
    }

    /// Records a team's progress on a todo. 100 marks it complete, anything
    /// above zero marks it started. Progress is clamped to 0..=100.
    pub async fn set_progress(
        &self,
        team_id: &str,
        todo_id: &str,
        progress: i32,
        notes: Option<String>,
    ) -> Result<TeamTodo, StoreError> {
        let row = TeamTodoProgress::new(team_id, todo_id, progress, notes, Utc::now());
        let saved: TeamTodo = self
            .backend
            .from(TEAM_TODOS_TABLE)
            .select(TEAM_TODO_COLUMNS)
            .on_conflict(TEAM_TODO_KEY)
            .upsert(&row)
            .await?;
        info!(
            team = team_id,
            todo = todo_id,
            progress = saved.progress_percentage,
            "team progress saved"
        );
        Ok(saved)
    }

    /// Flips a team's completion of a todo between 0 % and 100 %.
    pub async fn toggle_completion(&self, team_id: &str, todo_id: &str) -> Result<TeamTodo, StoreError> {
        let current: Option<TeamTodo> = self
            .backend
            .from(TEAM_TODOS_TABLE)
            .eq("team_id", team_id)
            .eq("todo_id", todo_id)
            .single()
            .await?;
        let (progress, notes) = match current {
            Some(entry) if entry.completed => (0, entry.notes),
            Some(entry) => (100, entry.notes),
            None => (100, None),
        };
        self.set_progress(team_id, todo_id, progress, notes).await
    }

    pub async fn stats(&self) -> Result<TodoStats, StoreError> {
        let todos: Vec<Todo> = self.backend.from(TODOS_TABLE).fetch().await?;
        let team_todos = self.team_todos(None).await?;
        Ok(todo_stats(&todos, &team_todos, Utc::now()))
    }

    /// Distinct categories in use, sorted.
    pub async fn categories(&self) -> Result<Vec<String>, StoreError> {
        self.distinct("category").await
    }

    /// Distinct assignees in use, sorted.
    pub async fn assignees(&self) -> Result<Vec<String>, StoreError> {
        self.distinct("assignee").await
    }

    async fn distinct(&self, column: &str) -> Result<Vec<String>, StoreError> {
        let rows: Vec<Map<String, Value>> = self
            .backend
            .from(TODOS_TABLE)
            .select(column)
            .not_null(column)
            .fetch()
            .await?;
        let values: BTreeSet<String> = rows
            .into_iter()
            .filter_map(|row| row.get(column)?.as_str().map(str::to_owned))
            .collect();
        Ok(values.into_iter().collect())
    }
}

fn iso(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Millis, true)
}
