use std::{
    net::SocketAddr,
    sync::{Arc, Mutex},
};

use axum::{
    Json, Router,
    extract::{RawQuery, State},
    http::{HeaderMap, StatusCode, header},
    response::{IntoResponse, Response},
    routing::{get, post},
};
use hikeathon_client::{
    ApiClient, Backend, FileStore, StoreError,
    stores::{AuthStore, ChatStore, CountdownStore, ImageStore, TodoService, chat::ERROR_REPLY},
};
use hikeathon_core::{
    CsrfGuard, KeyValueStore, MemoryStore, SessionVault, TokenSecurity,
    records::{TodoFilters, TodoStatus},
    session::{SESSION_BACKUP_KEY, SESSION_KEY},
};
use serde_json::{Value, json};
use tempfile::TempDir;
use tokio::{net::TcpListener, sync::oneshot};

const TEAM_CODE: &str = "HIKEMIKE";
const TEAM_TOKEN: &str = "team-token-1";

#[derive(Clone, Default)]
struct Backstage {
    chat_requests: Arc<Mutex<Vec<Value>>>,
    todo_queries: Arc<Mutex<Vec<String>>>,
    csrf_seen: Arc<Mutex<Vec<String>>>,
}

async fn auth_validate(State(state): State<Backstage>, headers: HeaderMap, Json(body): Json<Value>) -> Response {
    if let Some(token) = headers.get("X-CSRF-Token").and_then(|v| v.to_str().ok()) {
        state.csrf_seen.lock().expect("csrf lock").push(token.to_owned());
    }
    match body["teamCode"].as_str() {
        Some(TEAM_CODE) => Json(json!({
            "token": TEAM_TOKEN,
            "tokenId": "tok-1",
            "teamName": "Blue Owls",
            "isAdmin": true,
        }))
        .into_response(),
        Some("GONEGONE") => StatusCode::NOT_FOUND.into_response(),
        _ => (StatusCode::UNAUTHORIZED, Json(json!({ "error": "invalid team code" }))).into_response(),
    }
}

fn bearer(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "))
}

async fn proxy_chat(State(state): State<Backstage>, headers: HeaderMap, Json(body): Json<Value>) -> Response {
    if bearer(&headers) != Some(TEAM_TOKEN) {
        return StatusCode::UNAUTHORIZED.into_response();
    }
    let failing = body["messages"]
        .as_array()
        .and_then(|messages| messages.last())
        .and_then(|last| last["content"].as_str())
        == Some("break please");
    state.chat_requests.lock().expect("chat lock").push(body);
    if failing {
        return (StatusCode::BAD_GATEWAY, "model unavailable").into_response();
    }

    let chunk = |text: &str| {
        format!(
            "data: {}\n\n",
            json!({ "choices": [{ "delta": { "content": text } }] })
        )
    };
    let body = format!("{}{}data: [DONE]\n\n", chunk("Hiking "), chunk("is great."));
    ([(header::CONTENT_TYPE, "text/event-stream")], body).into_response()
}

async fn proxy_images(headers: HeaderMap, Json(body): Json<Value>) -> Response {
    if bearer(&headers) != Some(TEAM_TOKEN) {
        return StatusCode::UNAUTHORIZED.into_response();
    }
    Json(json!({
        "data": [{
            "url": "/files/generated.png",
            "revised_prompt": format!("A detailed {}", body["prompt"].as_str().unwrap_or_default()),
        }]
    }))
    .into_response()
}

async fn generated_png() -> Response {
    ([(header::CONTENT_TYPE, "image/png")], b"\x89PNG fake".to_vec()).into_response()
}

async fn list_todos(State(state): State<Backstage>, headers: HeaderMap, RawQuery(query): RawQuery) -> Response {
    if headers.get("apikey").and_then(|v| v.to_str().ok()) != Some("anon") || bearer(&headers) != Some("anon") {
        return StatusCode::UNAUTHORIZED.into_response();
    }
    state
        .todo_queries
        .lock()
        .expect("todo lock")
        .push(query.unwrap_or_default());
    Json(json!([
        {
            "id": "t-1",
            "title": "Interview five hikers",
            "is_global": true,
            "priority": 5,
            "category": "research",
            "status": "open",
            "estimated_points": 3,
            "due_date": "2020-01-01T00:00:00Z",
            "created_at": "2019-12-01T00:00:00Z",
            "updated_at": "2019-12-01T00:00:00Z",
        },
        {
            "id": "t-2",
            "title": "Draft the pitch",
            "is_global": true,
            "priority": 3,
            "category": "research",
            "status": "open",
            "estimated_points": 2,
            "due_date": "2099-01-01T00:00:00Z",
            "created_at": "2019-12-02T00:00:00Z",
            "updated_at": "2019-12-02T00:00:00Z",
        }
    ]))
    .into_response()
}

async fn no_countdown() -> Response {
    (
        StatusCode::NOT_ACCEPTABLE,
        Json(json!({ "code": "PGRST116", "message": "JSON object requested, multiple (or no) rows returned" })),
    )
        .into_response()
}

async fn start_backend(state: Backstage) -> (String, oneshot::Sender<()>) {
    let app = Router::new()
        .route("/functions/v1/auth-validate", post(auth_validate))
        .route("/functions/v1/proxy-chat", post(proxy_chat))
        .route("/functions/v1/proxy-images", post(proxy_images))
        .route("/files/generated.png", get(generated_png))
        .route("/rest/v1/todos", get(list_todos))
        .route("/rest/v1/countdowns", get(no_countdown))
        .with_state(state);
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
    (format!("http://{address}"), shutdown_tx)
}

struct Client {
    api: ApiClient,
    ephemeral: Arc<dyn KeyValueStore>,
    durable: Arc<dyn KeyValueStore>,
    auth: Arc<AuthStore>,
}

/// A fresh process: new ephemeral tier, durable tier on `dir`.
fn client(base_url: &str, dir: &TempDir) -> Client {
    let durable: Arc<dyn KeyValueStore> =
        Arc::new(FileStore::open(dir.path()).expect("open durable store"));
    let ephemeral: Arc<dyn KeyValueStore> = Arc::new(MemoryStore::new());
    let csrf = CsrfGuard::new(Arc::clone(&ephemeral));
    let api = ApiClient::with_csrf(base_url, "anon", csrf).expect("client");
    let vault = SessionVault::new(Arc::clone(&ephemeral), Arc::clone(&durable));
    let auth = AuthStore::new(api.clone(), vault, TokenSecurity::with_iterations(1_000));
    Client {
        api,
        ephemeral,
        durable,
        auth,
    }
}

#[tokio::test]
async fn login_seals_the_token_and_a_restart_restores_it() {
    let state = Backstage::default();
    let (base_url, shutdown_tx) = start_backend(state.clone()).await;
    let dir = TempDir::new().expect("tempdir");

    let first = client(&base_url, &dir);
    first.auth.login("hikemike").await.expect("login");
    let auth = first.auth.state();
    assert_eq!(auth.team.as_ref().map(|t| t.name.as_str()), Some("Blue Owls"));
    assert!(auth.is_admin);
    assert!(!auth.is_loading);
    assert_eq!(first.auth.get_token().as_deref(), Some(TEAM_TOKEN));
    let hours = first.auth.time_until_expiry().as_secs() / 3600;
    assert!(hours == 47 || hours == 48);

    let stored = first.durable.get(SESSION_BACKUP_KEY).expect("durable copy");
    assert!(!stored.contains(TEAM_TOKEN));
    assert!(first.ephemeral.get(SESSION_KEY).is_some());
    assert_eq!(state.csrf_seen.lock().expect("csrf lock").len(), 1);

    let second = client(&base_url, &dir);
    assert!(matches!(
        second.auth.restore_session("WRONGCOD").await,
        Err(StoreError::InvalidCredentials)
    ));
    assert!(second.auth.restore_session(TEAM_CODE).await.expect("restore"));
    assert_eq!(second.auth.get_token().as_deref(), Some(TEAM_TOKEN));
    let restored = second.auth.state();
    assert_eq!(restored.team.map(|t| t.name), Some("Blue Owls".to_owned()));
    assert!(!restored.is_admin);
    assert!(second.ephemeral.get(SESSION_KEY).is_some());

    second.auth.logout();
    assert!(second.durable.get(SESSION_BACKUP_KEY).is_none());
    assert_eq!(second.auth.get_token(), None);
    let third = client(&base_url, &dir);
    assert!(!third.auth.restore_session(TEAM_CODE).await.expect("nothing stored"));

    let _ = shutdown_tx.send(());
}

#[tokio::test]
async fn rejected_team_codes_are_invalid_credentials() {
    let (base_url, shutdown_tx) = start_backend(Backstage::default()).await;
    let dir = TempDir::new().expect("tempdir");
    let client = client(&base_url, &dir);

    for code in ["WRONGCOD", "GONEGONE", "short"] {
        let result = client.auth.login(code).await;
        assert!(
            matches!(result, Err(StoreError::InvalidCredentials)),
            "{code}: {result:?}"
        );
        let state = client.auth.state();
        assert!(!state.is_authenticated());
        assert!(state.error.is_some());
    }
    assert!(client.durable.get(SESSION_BACKUP_KEY).is_none());

    let _ = shutdown_tx.send(());
}

#[tokio::test]
async fn chat_streams_the_reply_with_the_team_token() {
    let state = Backstage::default();
    let (base_url, shutdown_tx) = start_backend(state.clone()).await;
    let dir = TempDir::new().expect("tempdir");
    let client = client(&base_url, &dir);
    client.auth.login(TEAM_CODE).await.expect("login");

    let chat = ChatStore::with_storage(client.api.clone(), Arc::clone(&client.durable));
    chat.set_system_prompt("Talk like a mountain guide.");
    let reply_id = chat
        .send_message("Why hike?")
        .await
        .expect("reply streamed")
        .expect("not ignored");

    let chat_state = chat.state();
    assert!(!chat_state.is_generating);
    assert_eq!(chat_state.streaming_id, None);
    assert_eq!(chat_state.messages.len(), 2);
    let reply = chat_state
        .messages
        .iter()
        .find(|message| message.id == reply_id)
        .expect("reply kept");
    assert_eq!(reply.content, "Hiking is great.");
    assert!(!reply.is_streaming);
    assert!(reply.tokens.is_some());

    let requests = state.chat_requests.lock().expect("chat lock").clone();
    assert_eq!(requests.len(), 1);
    assert_eq!(requests[0]["stream"], true);
    assert_eq!(requests[0]["messages"][0]["role"], "system");
    assert_eq!(requests[0]["messages"][0]["content"], "Talk like a mountain guide.");
    assert_eq!(requests[0]["messages"][1]["content"], "Why hike?");

    let failure = chat
        .send_message("break please")
        .await
        .expect_err("upstream failure surfaces");
    assert!(matches!(failure, StoreError::Api(_)));
    let chat_state = chat.state();
    let failed = chat_state.messages.last().expect("assistant placeholder");
    assert_eq!(failed.content, ERROR_REPLY);
    assert!(failed.error.is_some());
    assert!(!chat_state.is_generating);

    let reopened = ChatStore::with_storage(client.api.clone(), Arc::clone(&client.durable));
    assert_eq!(reopened.state().messages.len(), 4);
    assert_eq!(reopened.state().system_prompt, "Talk like a mountain guide.");

    let _ = shutdown_tx.send(());
}

#[tokio::test]
async fn images_are_generated_kept_and_downloaded() {
    let (base_url, shutdown_tx) = start_backend(Backstage::default()).await;
    let dir = TempDir::new().expect("tempdir");
    let out = TempDir::new().expect("tempdir");
    let client = client(&base_url, &dir);
    client.auth.login(TEAM_CODE).await.expect("login");

    let images = ImageStore::new(client.api.clone(), Arc::clone(&client.durable));
    assert_eq!(images.generate_image("   ").await.expect("blank"), None);

    let image = images
        .generate_image("a summit at dawn")
        .await
        .expect("generated")
        .expect("not ignored");
    assert_eq!(image.url, "/files/generated.png");
    assert_eq!(image.revised_prompt.as_deref(), Some("A detailed a summit at dawn"));
    assert_eq!(images.state().history.len(), 1);
    assert_eq!(images.state().today().len(), 1);

    let path = images.download(&image, out.path()).await.expect("downloaded");
    assert_eq!(std::fs::read(&path).expect("saved file"), b"\x89PNG fake");
    assert!(
        path.file_name()
            .and_then(|name| name.to_str())
            .is_some_and(|name| name.starts_with("hikeathon-image-") && name.ends_with(".png"))
    );

    let reopened = ImageStore::new(client.api.clone(), Arc::clone(&client.durable));
    assert_eq!(reopened.state().history, vec![image]);

    let _ = shutdown_tx.send(());
}

#[tokio::test]
async fn todo_filters_become_postgrest_query_params() {
    let state = Backstage::default();
    let (base_url, shutdown_tx) = start_backend(state.clone()).await;
    let api = ApiClient::new(&base_url, "anon").expect("client");
    let todos = TodoService::new(Backend::new(api));

    let listed = todos
        .list(&TodoFilters {
            status: Some(TodoStatus::Open),
            category: Some("research".to_owned()),
            priority_min: Some(3),
            overdue: Some(true),
            ..TodoFilters::default()
        })
        .await
        .expect("listed");
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0].id, "t-1");

    let queries = state.todo_queries.lock().expect("todo lock").clone();
    let query = &queries[0];
    assert!(query.contains("select=*") || query.contains("select=%2A"));
    assert!(query.contains("status=eq.open"));
    assert!(query.contains("category=eq.research"));
    assert!(query.contains("priority=gte.3"));
    assert!(query.contains("order=priority.desc%2Ccreated_at.desc"));

    let _ = shutdown_tx.send(());
}

#[tokio::test]
async fn missing_countdown_is_none() {
    let (base_url, shutdown_tx) = start_backend(Backstage::default()).await;
    let api = ApiClient::new(&base_url, "anon").expect("client");
    let countdown = CountdownStore::new(Backend::new(api));

    assert_eq!(countdown.fetch_active().await.expect("fetched"), None);
    let state = countdown.state();
    assert!(!state.is_loading);
    assert_eq!(state.error, None);
    assert!(!countdown.is_visible());

    let _ = shutdown_tx.send(());
}
