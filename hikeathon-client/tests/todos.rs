use std::{
    collections::HashMap,
    net::SocketAddr,
    sync::{Arc, Mutex},
};

use axum::{
    Json, Router,
    extract::{Query, State},
    http::{HeaderMap, StatusCode, header},
    response::{IntoResponse, Response},
    routing::get,
};
use hikeathon_client::{ApiClient, Backend, StoreError, stores::TodoService};
use hikeathon_core::records::{TodoFilters, TodoStatus, TodoUpdate};
use serde_json::{Value, json};
use tokio::{net::TcpListener, sync::oneshot};

type Params = Query<HashMap<String, String>>;

/// Just enough PostgREST for `todos` and `team_todos`.
#[derive(Clone, Default)]
struct Tables {
    todos: Arc<Mutex<Vec<Value>>>,
    team_todos: Arc<Mutex<Vec<Value>>>,
    patches: Arc<Mutex<Vec<Value>>>,
    /// `(on_conflict, Prefer)` of every upsert.
    upserts: Arc<Mutex<Vec<(String, String)>>>,
}

fn todo_row(id: &str, status: &str, due_date: Option<&str>) -> Value {
    json!({
        "id": id,
        "title": format!("Todo {id}"),
        "is_global": true,
        "priority": 3,
        "category": "research",
        "status": status,
        "estimated_points": 2,
        "due_date": due_date,
        "created_at": "2025-09-01T08:00:00Z",
        "updated_at": "2025-09-01T08:00:00Z",
    })
}

fn eq_value<'a>(params: &'a HashMap<String, String>, column: &str) -> Option<&'a str> {
    params.get(column)?.strip_prefix("eq.")
}

fn merge(row: &mut Value, changes: &Value) {
    if let (Some(row), Some(changes)) = (row.as_object_mut(), changes.as_object()) {
        for (key, value) in changes {
            row.insert(key.clone(), value.clone());
        }
    }
}

async fn get_todos(State(tables): State<Tables>, Query(params): Params) -> Response {
    let rows: Vec<Value> = tables
        .todos
        .lock()
        .expect("todos lock")
        .iter()
        .filter(|row| eq_value(&params, "status").is_none_or(|status| row["status"] == status))
        .cloned()
        .collect();
    Json(rows).into_response()
}

async fn patch_todos(
    State(tables): State<Tables>,
    Query(params): Params,
    Json(changes): Json<Value>,
) -> Response {
    let Some(id) = eq_value(&params, "id") else {
        return StatusCode::BAD_REQUEST.into_response();
    };
    tables.patches.lock().expect("patches lock").push(changes.clone());
    let mut todos = tables.todos.lock().expect("todos lock");
    let updated: Vec<Value> = todos
        .iter_mut()
        .filter(|row| row["id"] == id)
        .map(|row| {
            merge(row, &changes);
            row.clone()
        })
        .collect();
    Json(updated).into_response()
}

async fn get_team_todos(
    State(tables): State<Tables>,
    Query(params): Params,
    headers: HeaderMap,
) -> Response {
    let rows: Vec<Value> = tables
        .team_todos
        .lock()
        .expect("team todos lock")
        .iter()
        .filter(|row| {
            ["team_id", "todo_id"]
                .iter()
                .all(|column| eq_value(&params, column).is_none_or(|value| row[*column] == value))
        })
        .cloned()
        .collect();

    let single = headers.get(header::ACCEPT).and_then(|v| v.to_str().ok())
        == Some("application/vnd.pgrst.object+json");
    if !single {
        return Json(rows).into_response();
    }
    match rows.into_iter().next() {
        Some(row) => Json(row).into_response(),
        None => (
            StatusCode::NOT_ACCEPTABLE,
            Json(json!({ "code": "PGRST116", "message": "no rows" })),
        )
            .into_response(),
    }
}

async fn upsert_team_todo(
    State(tables): State<Tables>,
    Query(params): Params,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> Response {
    let prefer = headers
        .get("Prefer")
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default()
        .to_owned();
    let on_conflict = params.get("on_conflict").cloned().unwrap_or_default();
    tables
        .upserts
        .lock()
        .expect("upserts lock")
        .push((on_conflict, prefer));

    let mut table = tables.team_todos.lock().expect("team todos lock");
    let existing = table
        .iter()
        .position(|row| row["team_id"] == body["team_id"] && row["todo_id"] == body["todo_id"]);
    let index = match existing {
        Some(index) => index,
        None => {
            let id = format!("tt-{}", table.len() + 1);
            table.push(json!({ "id": id, "completed": false, "progress_percentage": 0 }));
            table.len() - 1
        }
    };
    let row = &mut table[index];
    merge(row, &body);
    row["updated_at"] = json!("2025-09-01T10:00:00Z");
    Json(vec![row.clone()]).into_response()
}

async fn start_tables(tables: Tables) -> (TodoService, oneshot::Sender<()>) {
    let app = Router::new()
        .route("/rest/v1/todos", get(get_todos).patch(patch_todos))
        .route("/rest/v1/team_todos", get(get_team_todos).post(upsert_team_todo))
        .with_state(tables);
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let address: SocketAddr = listener.local_addr().expect("local addr");
    let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
    tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(async {
                let _ = shutdown_rx.await;
            })
            .await
            .expect("serve");
    });
    let api = ApiClient::new(&format!("http://{address}"), "anon").expect("client");
    (TodoService::new(Backend::new(api)), shutdown_tx)
}

#[tokio::test]
async fn completing_a_todo_stamps_completed_at() {
    let tables = Tables::default();
    tables
        .todos
        .lock()
        .expect("todos lock")
        .push(todo_row("t-1", "open", None));
    let (todos, shutdown_tx) = start_tables(tables.clone()).await;

    let renamed = todos
        .update(
            "t-1",
            TodoUpdate {
                title: Some("Interview hikers".to_owned()),
                ..TodoUpdate::default()
            },
        )
        .await
        .expect("renamed");
    assert_eq!(renamed.title, "Interview hikers");
    assert_eq!(renamed.completed_at, None);

    let done = todos
        .update(
            "t-1",
            TodoUpdate {
                status: Some(TodoStatus::Completed),
                ..TodoUpdate::default()
            },
        )
        .await
        .expect("completed");
    assert_eq!(done.status, TodoStatus::Completed);
    assert!(done.completed_at.is_some());

    let patches = tables.patches.lock().expect("patches lock").clone();
    assert_eq!(patches[0], json!({ "title": "Interview hikers" }));
    assert_eq!(patches[1]["status"], "completed");
    assert!(patches[1]["completed_at"].is_string());

    let missing = todos
        .update("t-404", TodoUpdate::default())
        .await
        .expect_err("no such todo");
    assert!(matches!(missing, StoreError::NotFound(_)));

    let _ = shutdown_tx.send(());
}

#[tokio::test]
async fn team_progress_is_upserted_and_toggled() {
    let tables = Tables::default();
    let (todos, shutdown_tx) = start_tables(tables.clone()).await;

    let started = todos
        .set_progress("Blue Owls", "t-1", 40, Some("halfway".to_owned()))
        .await
        .expect("progress saved");
    assert_eq!(started.progress_percentage, 40);
    assert!(!started.completed);
    assert!(started.started_at.is_some());
    assert_eq!(started.notes.as_deref(), Some("halfway"));

    let done = todos
        .toggle_completion("Blue Owls", "t-1")
        .await
        .expect("toggled on");
    assert_eq!(done.id, started.id);
    assert_eq!(done.progress_percentage, 100);
    assert!(done.completed);
    assert!(done.completed_at.is_some());
    assert_eq!(done.notes.as_deref(), Some("halfway"));

    let reopened = todos
        .toggle_completion("Blue Owls", "t-1")
        .await
        .expect("toggled off");
    assert_eq!(reopened.progress_percentage, 0);
    assert!(!reopened.completed);
    assert_eq!(reopened.completed_at, None);

    let fresh = todos
        .toggle_completion("Blue Owls", "t-2")
        .await
        .expect("first toggle");
    assert!(fresh.completed);
    assert_eq!(fresh.progress_percentage, 100);

    assert_eq!(tables.team_todos.lock().expect("team todos lock").len(), 2);
    assert_eq!(todos.team_todos(Some("Blue Owls")).await.expect("listed").len(), 2);
    assert!(todos.team_todos(Some("Red Foxes")).await.expect("listed").is_empty());

    let upserts = tables.upserts.lock().expect("upserts lock").clone();
    assert_eq!(upserts.len(), 4);
    for (on_conflict, prefer) in upserts {
        assert_eq!(on_conflict, "team_id,todo_id");
        assert!(prefer.contains("resolution=merge-duplicates"));
    }

    let _ = shutdown_tx.send(());
}

#[tokio::test]
async fn overdue_filter_composes_with_query_filters() {
    let tables = Tables::default();
    tables.todos.lock().expect("todos lock").extend([
        todo_row("late", "open", Some("2020-01-01T00:00:00Z")),
        todo_row("late-but-done", "completed", Some("2020-01-01T00:00:00Z")),
        todo_row("upcoming", "open", Some("2099-01-01T00:00:00Z")),
        todo_row("undated", "open", None),
    ]);
    let (todos, shutdown_tx) = start_tables(tables).await;
    let ids = |list: Vec<hikeathon_core::records::Todo>| -> Vec<String> {
        list.into_iter().map(|todo| todo.id).collect()
    };

    let overdue = todos
        .list(&TodoFilters {
            overdue: Some(true),
            ..TodoFilters::default()
        })
        .await
        .expect("listed");
    assert_eq!(ids(overdue), vec!["late"]);

    let on_track = todos
        .list(&TodoFilters {
            overdue: Some(false),
            ..TodoFilters::default()
        })
        .await
        .expect("listed");
    assert_eq!(ids(on_track), vec!["late-but-done", "upcoming", "undated"]);

    let open_on_track = todos
        .list(&TodoFilters {
            status: Some(TodoStatus::Open),
            overdue: Some(false),
            ..TodoFilters::default()
        })
        .await
        .expect("listed");
    assert_eq!(ids(open_on_track), vec!["upcoming", "undated"]);

    let _ = shutdown_tx.send(());
}
