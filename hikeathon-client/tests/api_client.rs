use std::{
    net::SocketAddr,
    sync::{
        Arc, Mutex,
        atomic::{AtomicUsize, Ordering},
    },
    time::{Duration, Instant},
};

use axum::{
    Router,
    body::Body,
    extract::{Path, State},
    http::{HeaderMap, StatusCode, header},
    response::{IntoResponse, Response},
    routing::{get, post},
};
use futures::{future::BoxFuture, stream};
use hikeathon_client::{ApiClient, ApiError, ApiRequest, AuthProvider};
use serde_json::{Value, json};
use tokio::{net::TcpListener, sync::oneshot, time::timeout};

#[derive(Clone, Default)]
struct ServerState {
    /// Request ids in the order they were served successfully.
    served: Arc<Mutex<Vec<u32>>>,
    hits: Arc<AtomicUsize>,
}

async fn start_server(app: Router) -> (String, oneshot::Sender<()>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind test server");
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

/// Hands out "stale" until refreshed, then "fresh". Refreshing takes a
/// while so other requests pile up behind it.
struct SlowRefresh {
    token: Mutex<String>,
    refreshes: AtomicUsize,
    logouts: AtomicUsize,
    succeed: bool,
}

impl SlowRefresh {
    fn new(succeed: bool) -> Arc<Self> {
        Arc::new(Self {
            token: Mutex::new("stale".to_owned()),
            refreshes: AtomicUsize::new(0),
            logouts: AtomicUsize::new(0),
            succeed,
        })
    }
}

impl AuthProvider for SlowRefresh {
    fn bearer_token(&self) -> BoxFuture<'_, Option<String>> {
        Box::pin(async move { Some(self.token.lock().expect("token lock").clone()) })
    }

    fn refresh(&self) -> BoxFuture<'_, Result<(), String>> {
        Box::pin(async move {
            self.refreshes.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(300)).await;
            if !self.succeed {
                return Err("team code rejected".to_owned());
            }
            *self.token.lock().expect("token lock") = "fresh".to_owned();
            Ok(())
        })
    }

    fn force_logout(&self) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            self.logouts.fetch_add(1, Ordering::SeqCst);
        })
    }
}

async fn guarded_item(
    State(state): State<ServerState>,
    Path(id): Path<u32>,
    headers: HeaderMap,
) -> Response {
    let authorized = headers
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        == Some("Bearer fresh");
    if !authorized {
        return StatusCode::UNAUTHORIZED.into_response();
    }
    state.served.lock().expect("served lock").push(id);
    axum::Json(json!({ "id": id })).into_response()
}

fn attach(api: &ApiClient, provider: &Arc<SlowRefresh>) {
    let provider: Arc<dyn AuthProvider> = provider.clone();
    api.set_auth_provider(Arc::downgrade(&provider));
}

async fn wait_for(mut condition: impl FnMut() -> bool) {
    timeout(Duration::from_secs(2), async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}

#[tokio::test]
async fn requests_during_refresh_are_replayed_in_order_after_one_refresh() {
    let state = ServerState::default();
    let app = Router::new()
        .route("/items/{id}", get(guarded_item))
        .with_state(state.clone());
    let (base_url, shutdown_tx) = start_server(app).await;

    let api = ApiClient::new(&base_url, "anon").expect("client");
    let provider = SlowRefresh::new(true);
    attach(&api, &provider);

    let mut tasks = Vec::new();
    let first = api.clone();
    tasks.push(tokio::spawn(async move { first.get("/items/1").await }));
    wait_for(|| api.is_refreshing()).await;

    for id in 2..=5_u32 {
        let client = api.clone();
        tasks.push(tokio::spawn(async move {
            client.get(&format!("/items/{id}")).await
        }));
        let expected = (id - 1) as usize;
        wait_for(|| api.queued_requests() == expected).await;
    }

    for (index, task) in tasks.into_iter().enumerate() {
        let response = task.await.expect("join").expect("request succeeds");
        assert_eq!(response.status().as_u16(), 200);
        let body: Value = response.json().expect("json body");
        assert_eq!(body["id"], json!(index + 1));
    }

    assert_eq!(provider.refreshes.load(Ordering::SeqCst), 1);
    assert_eq!(*state.served.lock().expect("served lock"), vec![1, 2, 3, 4, 5]);
    assert!(!api.is_refreshing());
    assert_eq!(api.queued_requests(), 0);

    let _ = shutdown_tx.send(());
}

#[tokio::test]
async fn failed_refresh_rejects_queued_requests_and_logs_out() {
    let state = ServerState::default();
    let app = Router::new()
        .route("/items/{id}", get(guarded_item))
        .with_state(state.clone());
    let (base_url, shutdown_tx) = start_server(app).await;

    let api = ApiClient::new(&base_url, "anon").expect("client");
    let provider = SlowRefresh::new(false);
    attach(&api, &provider);

    let first = api.clone();
    let lead = tokio::spawn(async move { first.get("/items/1").await });
    wait_for(|| api.is_refreshing()).await;
    let second = api.clone();
    let queued = tokio::spawn(async move { second.get("/items/2").await });
    wait_for(|| api.queued_requests() == 1).await;

    let lead = lead.await.expect("join");
    let queued = queued.await.expect("join");
    assert!(matches!(lead, Err(ApiError::RefreshFailed(_))));
    assert!(matches!(queued, Err(ApiError::RefreshFailed(_))));
    assert_eq!(provider.refreshes.load(Ordering::SeqCst), 1);
    assert_eq!(provider.logouts.load(Ordering::SeqCst), 1);
    assert!(state.served.lock().expect("served lock").is_empty());

    let _ = shutdown_tx.send(());
}

#[tokio::test]
async fn refresh_settles_when_the_leading_request_is_dropped() {
    let state = ServerState::default();
    let app = Router::new()
        .route("/items/{id}", get(guarded_item))
        .with_state(state.clone());
    let (base_url, shutdown_tx) = start_server(app).await;

    let api = ApiClient::new(&base_url, "anon").expect("client");
    let provider = SlowRefresh::new(true);
    attach(&api, &provider);

    let first = api.clone();
    let lead = tokio::spawn(async move { first.get("/items/1").await });
    wait_for(|| api.is_refreshing()).await;
    lead.abort();
    assert!(lead.await.expect_err("aborted").is_cancelled());

    let follow_up = timeout(Duration::from_secs(3), api.get("/items/2"))
        .await
        .expect("client is not stuck refreshing")
        .expect("request succeeds");
    assert_eq!(follow_up.status().as_u16(), 200);
    assert!(!api.is_refreshing());
    assert_eq!(provider.refreshes.load(Ordering::SeqCst), 1);

    let _ = shutdown_tx.send(());
}

async fn limited_once(State(state): State<ServerState>) -> Response {
    if state.hits.fetch_add(1, Ordering::SeqCst) == 0 {
        return (StatusCode::TOO_MANY_REQUESTS, [(header::RETRY_AFTER, "2")]).into_response();
    }
    axum::Json(json!({ "ok": true })).into_response()
}

async fn always_limited(State(state): State<ServerState>) -> Response {
    state.hits.fetch_add(1, Ordering::SeqCst);
    (StatusCode::TOO_MANY_REQUESTS, [(header::RETRY_AFTER, "1")]).into_response()
}

#[tokio::test]
async fn retry_after_is_honoured_and_request_resent_once() {
    let state = ServerState::default();
    let app = Router::new()
        .route("/limited", get(limited_once))
        .with_state(state.clone());
    let (base_url, shutdown_tx) = start_server(app).await;

    let api = ApiClient::new(&base_url, "anon").expect("client");
    let started = Instant::now();
    let response = api
        .request(ApiRequest::get("/limited").skip_auth())
        .await
        .expect("second attempt succeeds");

    assert!(started.elapsed() >= Duration::from_millis(2_000));
    assert_eq!(response.status().as_u16(), 200);
    assert_eq!(state.hits.load(Ordering::SeqCst), 2);

    let _ = shutdown_tx.send(());
}

#[tokio::test]
async fn second_rate_limit_is_reported() {
    let state = ServerState::default();
    let app = Router::new()
        .route("/limited", get(always_limited))
        .with_state(state.clone());
    let (base_url, shutdown_tx) = start_server(app).await;

    let api = ApiClient::new(&base_url, "anon").expect("client");
    let result = api.request(ApiRequest::get("/limited").skip_auth()).await;

    assert!(matches!(result, Err(ApiError::RateLimited)));
    assert_eq!(state.hits.load(Ordering::SeqCst), 2);

    let _ = shutdown_tx.send(());
}

#[tokio::test]
async fn network_errors_back_off_then_give_up() {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let address = listener.local_addr().expect("local addr");
    drop(listener);

    let api = ApiClient::new(&format!("http://{address}"), "anon").expect("client");
    let started = Instant::now();
    let result = api
        .request(
            ApiRequest::get("/unreachable")
                .skip_auth()
                .retries(2)
                .retry_delay(Duration::from_millis(100)),
        )
        .await;

    assert!(matches!(result, Err(ApiError::Network(_))));
    // 100 ms, then 200 ms.
    assert!(started.elapsed() >= Duration::from_millis(300));
}

#[tokio::test]
async fn network_retry_reaches_a_server_that_comes_up_late() {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let address = listener.local_addr().expect("local addr");
    drop(listener);

    let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(150)).await;
        let listener = TcpListener::bind(address).await.expect("rebind");
        let app = Router::new().route("/late", get(|| async { "up" }));
        axum::serve(listener, app)
            .with_graceful_shutdown(async {
                let _ = shutdown_rx.await;
            })
            .await
            .expect("serve");
    });

    let api = ApiClient::new(&format!("http://{address}"), "anon").expect("client");
    let response = api
        .request(
            ApiRequest::get("/late")
                .skip_auth()
                .retries(4)
                .retry_delay(Duration::from_millis(100)),
        )
        .await
        .expect("eventually reachable");
    assert_eq!(response.text(), "up");

    let _ = shutdown_tx.send(());
}

fn sse_chunk(text: &str) -> String {
    format!(
        "data: {}\n\n",
        json!({ "choices": [{ "delta": { "content": text } }] })
    )
}

async fn finite_stream() -> Response {
    let body = format!(
        "{}: keep-alive comment\n\n{}data: [DONE]\n\n{}",
        sse_chunk("Hello"),
        sse_chunk(", world"),
        sse_chunk("ignored after done"),
    );
    ([(header::CONTENT_TYPE, "text/event-stream")], body).into_response()
}

async fn stalled_stream() -> Response {
    let chunks = stream::unfold(0_u32, |step| async move {
        match step {
            0 => Some((Ok::<_, std::io::Error>(sse_chunk("first")), 1)),
            1 => {
                tokio::time::sleep(Duration::from_secs(30)).await;
                Some((Ok(sse_chunk("never seen")), 2))
            }
            _ => None,
        }
    });
    (
        [(header::CONTENT_TYPE, "text/event-stream")],
        Body::from_stream(chunks),
    )
        .into_response()
}

fn collect_deltas(received: &Arc<Mutex<Vec<String>>>) -> impl FnMut(Value) + Send + 'static {
    let received = Arc::clone(received);
    move |chunk| {
        if let Some(delta) = chunk
            .pointer("/choices/0/delta/content")
            .and_then(Value::as_str)
        {
            received.lock().expect("received lock").push(delta.to_owned());
        }
    }
}

#[tokio::test]
async fn sse_stream_stops_at_done_marker() {
    let app = Router::new().route("/functions/v1/proxy-chat", post(finite_stream));
    let (base_url, shutdown_tx) = start_server(app).await;

    let api = ApiClient::new(&base_url, "anon").expect("client");
    let received = Arc::new(Mutex::new(Vec::new()));
    let handle = api
        .stream(
            ApiRequest::post("/functions/v1/proxy-chat").json(json!({ "stream": true })),
            collect_deltas(&received),
        )
        .await
        .expect("stream opens");
    handle.finished().await.expect("stream ends cleanly");

    assert_eq!(*received.lock().expect("received lock"), vec!["Hello", ", world"]);

    let _ = shutdown_tx.send(());
}

#[tokio::test]
async fn cancelled_stream_keeps_what_arrived() {
    let app = Router::new().route("/functions/v1/proxy-chat", post(stalled_stream));
    let (base_url, shutdown_tx) = start_server(app).await;

    let api = ApiClient::new(&base_url, "anon").expect("client");
    let received = Arc::new(Mutex::new(Vec::new()));
    let handle = api
        .stream(
            ApiRequest::post("/functions/v1/proxy-chat").json(json!({ "stream": true })),
            collect_deltas(&received),
        )
        .await
        .expect("stream opens");

    wait_for(|| !received.lock().expect("received lock").is_empty()).await;
    handle.cancel();
    timeout(Duration::from_secs(2), handle.finished())
        .await
        .expect("cancel is prompt")
        .expect("cancelled stream counts as finished");

    assert_eq!(*received.lock().expect("received lock"), vec!["first"]);

    let _ = shutdown_tx.send(());
}

#[tokio::test]
async fn stream_reports_error_status() {
    let app = Router::new().route(
        "/functions/v1/proxy-chat",
        post(|| async { (StatusCode::BAD_GATEWAY, "upstream down") }),
    );
    let (base_url, shutdown_tx) = start_server(app).await;

    let api = ApiClient::new(&base_url, "anon").expect("client");
    let result = api
        .stream(ApiRequest::post("/functions/v1/proxy-chat"), |_| {})
        .await;
    match result {
        Err(ApiError::Status { status, body }) => {
            assert_eq!(status, 502);
            assert_eq!(body, "upstream down");
        }
        other => panic!("expected status error, got {other:?}"),
    }

    let _ = shutdown_tx.send(());
}
