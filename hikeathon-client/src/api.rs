use std::{
    collections::VecDeque,
    sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock, Weak},
    time::Duration,
};

use bytes::Bytes;
use futures::{StreamExt, future::BoxFuture};
use hikeathon_core::{
    CsrfGuard, RefreshGate, SseDecoder, SseEvent,
    refresh::{Ticket, Unauthorized},
};
use reqwest::{
    Method, RequestBuilder, StatusCode,
    header::{ACCEPT, AUTHORIZATION, CONTENT_TYPE, HeaderMap, RETRY_AFTER},
};
use serde::{Serialize, de::DeserializeOwned};
use serde_json::Value;
use tokio::{
    sync::oneshot,
    task::{AbortHandle, JoinHandle},
};
use tracing::{debug, error, info, warn};
use url::Url;

use crate::error::ApiError;

pub const DEFAULT_RATE_LIMIT_DELAY: Duration = Duration::from_millis(5_000);
pub const DEFAULT_RETRY_DELAY: Duration = Duration::from_millis(1_000);
pub const CSRF_HEADER: &str = "X-CSRF-Token";
const APIKEY_HEADER: &str = "apikey";

/// Source of the bearer token and the hooks the client calls around a 401.
pub trait AuthProvider: Send + Sync {
    fn bearer_token(&self) -> BoxFuture<'_, Option<String>>;
    fn refresh(&self) -> BoxFuture<'_, Result<(), String>>;
    fn force_logout(&self) -> BoxFuture<'_, ()>;
}

#[derive(Debug, Clone)]
pub struct ApiRequest {
    pub method: Method,
    pub path: String,
    pub body: Option<Value>,
    pub headers: Vec<(String, String)>,
    pub skip_auth: bool,
    pub retries: u32,
    pub retry_delay: Duration,
}

impl ApiRequest {
    pub fn new(method: Method, path: impl Into<String>) -> Self {
        Self {
            method,
            path: path.into(),
            body: None,
            headers: Vec::new(),
            skip_auth: false,
            retries: 0,
            retry_delay: DEFAULT_RETRY_DELAY,
        }
    }

    pub fn get(path: impl Into<String>) -> Self {
        Self::new(Method::GET, path)
    }

    pub fn post(path: impl Into<String>) -> Self {
        Self::new(Method::POST, path)
    }

    pub fn json(mut self, body: Value) -> Self {
        self.body = Some(body);
        self
    }

    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    pub fn skip_auth(mut self) -> Self {
        self.skip_auth = true;
        self
    }

    pub fn retries(mut self, retries: u32) -> Self {
        self.retries = retries;
        self
    }

    pub fn retry_delay(mut self, delay: Duration) -> Self {
        self.retry_delay = delay;
        self
    }
}

#[derive(Debug, Clone)]
pub struct ApiResponse {
    status: StatusCode,
    headers: HeaderMap,
    body: Bytes,
}

impl ApiResponse {
    pub fn status(&self) -> StatusCode {
        self.status
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    pub fn is_success(&self) -> bool {
        self.status.is_success()
    }

    pub fn bytes(&self) -> &Bytes {
        &self.body
    }

    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }

    pub fn json<T: DeserializeOwned>(&self) -> Result<T, ApiError> {
        serde_json::from_slice(&self.body).map_err(|err| ApiError::Decode(err.to_string()))
    }

    pub fn error_for_status(self) -> Result<Self, ApiError> {
        if self.status.is_success() {
            Ok(self)
        } else {
            Err(ApiError::Status {
                status: self.status.as_u16(),
                body: self.text(),
            })
        }
    }
}

struct Parked {
    request: ApiRequest,
    reply: oneshot::Sender<Result<ApiResponse, ApiError>>,
}

impl Parked {
    fn new(request: ApiRequest) -> (Self, oneshot::Receiver<Result<ApiResponse, ApiError>>) {
        let (reply, rx) = oneshot::channel();
        (Self { request, reply }, rx)
    }
}

struct Inner {
    http: reqwest::Client,
    base_url: String,
    anon_key: String,
    csrf: Option<CsrfGuard>,
    auth: RwLock<Option<Weak<dyn AuthProvider>>>,
    gate: Mutex<RefreshGate<Parked>>,
}

/// HTTP client for the backend with token refresh, rate-limit and network
/// retry handling. Cheap to clone.
#[derive(Clone)]
pub struct ApiClient {
    inner: Arc<Inner>,
}

impl ApiClient {
    pub fn new(base_url: &str, anon_key: &str) -> Result<Self, ApiError> {
        Self::build_client(base_url, anon_key, None)
    }

    /// Same as `new`, but every request also carries the guard's token in
    /// the `X-CSRF-Token` header.
    pub fn with_csrf(base_url: &str, anon_key: &str, csrf: CsrfGuard) -> Result<Self, ApiError> {
        Self::build_client(base_url, anon_key, Some(csrf))
    }

    fn build_client(
        base_url: &str,
        anon_key: &str,
        csrf: Option<CsrfGuard>,
    ) -> Result<Self, ApiError> {
        Url::parse(base_url).map_err(|err| ApiError::InvalidUrl(format!("{base_url}: {err}")))?;
        let http = reqwest::Client::builder()
            .build()
            .map_err(|err| ApiError::Network(err.to_string()))?;
        Ok(Self {
            inner: Arc::new(Inner {
                http,
                base_url: base_url.trim_end_matches('/').to_owned(),
                anon_key: anon_key.to_owned(),
                csrf,
                auth: RwLock::new(None),
                gate: Mutex::new(RefreshGate::new()),
            }),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.inner.base_url
    }

    pub fn anon_key(&self) -> &str {
        &self.inner.anon_key
    }

    /// The provider is held weakly so it can own a clone of this client.
    pub fn set_auth_provider(&self, provider: Weak<dyn AuthProvider>) {
        let mut slot = self
            .inner
            .auth
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        *slot = Some(provider);
    }

    pub fn is_refreshing(&self) -> bool {
        self.gate().is_refreshing()
    }

    pub fn queued_requests(&self) -> usize {
        self.gate().queued_len()
    }

    pub async fn get(&self, path: &str) -> Result<ApiResponse, ApiError> {
        self.request(ApiRequest::get(path)).await
    }

    pub async fn post<B: Serialize>(&self, path: &str, body: &B) -> Result<ApiResponse, ApiError> {
        self.request(ApiRequest::post(path).json(to_value(body)?)).await
    }

    pub async fn put<B: Serialize>(&self, path: &str, body: &B) -> Result<ApiResponse, ApiError> {
        self.request(ApiRequest::new(Method::PUT, path).json(to_value(body)?))
            .await
    }

    pub async fn patch<B: Serialize>(&self, path: &str, body: &B) -> Result<ApiResponse, ApiError> {
        self.request(ApiRequest::new(Method::PATCH, path).json(to_value(body)?))
            .await
    }

    pub async fn delete(&self, path: &str) -> Result<ApiResponse, ApiError> {
        self.request(ApiRequest::new(Method::DELETE, path)).await
    }

    pub fn function_path(name: &str) -> String {
        format!("/functions/v1/{name}")
    }

    pub async fn invoke_function<B: Serialize>(
        &self,
        name: &str,
        body: &B,
    ) -> Result<ApiResponse, ApiError> {
        self.post(&Self::function_path(name), body).await
    }

    pub async fn request(&self, request: ApiRequest) -> Result<ApiResponse, ApiError> {
        if request.skip_auth {
            return self.send_with_policies(&request).await;
        }

        let mut request = request;
        loop {
            let (parked, rx) = Parked::new(request);
            let ticket = self.gate().admit(parked);
            let generation = match ticket {
                Ticket::Queued => {
                    debug!("request parked until session refresh completes");
                    return await_parked(rx).await;
                }
                Ticket::Send { generation, waiter } => {
                    request = waiter.request;
                    generation
                }
            };

            let response = self.send_with_policies(&request).await?;
            if response.status() != StatusCode::UNAUTHORIZED {
                return Ok(response);
            }

            let (parked, rx) = Parked::new(request);
            let verdict = self.gate().on_unauthorized(generation, parked);
            match verdict {
                Unauthorized::Queued => return await_parked(rx).await,
                Unauthorized::Retry(parked) => request = parked.request,
                Unauthorized::Lead(parked) => {
                    self.spawn_refresh(parked);
                    return await_parked(rx).await;
                }
            }
        }
    }

    /// Runs the refresh on its own task so it settles even when the leading
    /// caller is dropped. The leader's result comes back on its own reply
    /// channel, ahead of the queued replays.
    fn spawn_refresh(&self, leader: Parked) {
        let client = self.clone();
        tokio::spawn(async move { client.run_refresh(leader).await });
    }

    async fn run_refresh(&self, leader: Parked) {
        info!(path = %leader.request.path, "unauthorized; refreshing session");
        let provider = self.auth_provider();
        let outcome = match &provider {
            Some(provider) => provider.refresh().await,
            None => Err("no auth provider configured".to_owned()),
        };

        match outcome {
            Ok(()) => {
                let queued = self.gate().settle(true);
                info!(queued = queued.len(), "session refreshed; replaying requests");
                let own = self.replay(&leader.request).await;
                let _ = leader.reply.send(own);
                self.replay_queue(queued).await;
            }
            Err(reason) => {
                let queued = self.gate().settle(false);
                error!(queued = queued.len(), "session refresh failed: {reason}");
                for parked in queued {
                    let _ = parked.reply.send(Err(ApiError::RefreshFailed(reason.clone())));
                }
                if let Some(provider) = provider {
                    provider.force_logout().await;
                }
                let _ = leader.reply.send(Err(ApiError::RefreshFailed(reason)));
            }
        }
    }

    async fn replay_queue(&self, queued: VecDeque<Parked>) {
        for parked in queued {
            let result = self.replay(&parked.request).await;
            let _ = parked.reply.send(result);
        }
    }

    async fn replay(&self, request: &ApiRequest) -> Result<ApiResponse, ApiError> {
        let response = self.send_with_policies(request).await?;
        if response.status() == StatusCode::UNAUTHORIZED {
            warn!(path = %request.path, "still unauthorized after refresh");
            return Err(ApiError::Unauthorized);
        }
        Ok(response)
    }

    async fn send_with_policies(&self, request: &ApiRequest) -> Result<ApiResponse, ApiError> {
        let response = self.send_with_retries(request).await?;
        if response.status() != StatusCode::TOO_MANY_REQUESTS {
            return Ok(response);
        }

        let delay = retry_after(response.headers()).unwrap_or(DEFAULT_RATE_LIMIT_DELAY);
        warn!(
            path = %request.path,
            delay_ms = delay.as_millis() as u64,
            "rate limited; retrying once"
        );
        tokio::time::sleep(delay).await;

        let response = self.send_with_retries(request).await?;
        if response.status() == StatusCode::TOO_MANY_REQUESTS {
            return Err(ApiError::RateLimited);
        }
        Ok(response)
    }

    async fn send_with_retries(&self, request: &ApiRequest) -> Result<ApiResponse, ApiError> {
        let mut remaining = request.retries;
        let mut delay = request.retry_delay;
        loop {
            match self.send_once(request).await {
                Err(ApiError::Network(err)) if remaining > 0 => {
                    warn!(
                        path = %request.path,
                        remaining,
                        delay_ms = delay.as_millis() as u64,
                        "network error; retrying: {err}"
                    );
                    tokio::time::sleep(delay).await;
                    delay = delay.saturating_mul(2);
                    remaining -= 1;
                }
                other => return other,
            }
        }
    }

    async fn send_once(&self, request: &ApiRequest) -> Result<ApiResponse, ApiError> {
        let response = self
            .build(request, false)
            .await?
            .send()
            .await
            .map_err(|err| ApiError::Network(err.to_string()))?;
        let status = response.status();
        let headers = response.headers().clone();
        let body = response
            .bytes()
            .await
            .map_err(|err| ApiError::Network(err.to_string()))?;
        debug!(method = %request.method, path = %request.path, status = status.as_u16(), "response");
        Ok(ApiResponse {
            status,
            headers,
            body,
        })
    }

    async fn build(&self, request: &ApiRequest, event_stream: bool) -> Result<RequestBuilder, ApiError> {
        let url = self.resolve(&request.path)?;
        let mut builder = self
            .inner
            .http
            .request(request.method.clone(), url)
            .header(APIKEY_HEADER, &self.inner.anon_key)
            .header(CONTENT_TYPE, "application/json");

        if !request.skip_auth
            && let Some(provider) = self.auth_provider()
            && let Some(token) = provider.bearer_token().await
        {
            builder = builder.header(AUTHORIZATION, format!("Bearer {token}"));
        }
        if let Some(csrf) = &self.inner.csrf {
            builder = builder.header(CSRF_HEADER, csrf.token());
        }
        if event_stream {
            builder = builder.header(ACCEPT, "text/event-stream");
        }
        for (name, value) in &request.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }
        if let Some(body) = &request.body {
            builder = builder.json(body);
        }
        Ok(builder)
    }

    fn resolve(&self, path: &str) -> Result<Url, ApiError> {
        let full = if path.starts_with("http://") || path.starts_with("https://") {
            path.to_owned()
        } else {
            format!("{}{}", self.inner.base_url, path)
        };
        Url::parse(&full).map_err(|err| ApiError::InvalidUrl(format!("{full}: {err}")))
    }

    fn auth_provider(&self) -> Option<Arc<dyn AuthProvider>> {
        self.inner
            .auth
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .and_then(Weak::upgrade)
    }

    fn gate(&self) -> MutexGuard<'_, RefreshGate<Parked>> {
        self.inner.gate.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Opens a server-sent event stream and feeds each JSON payload to
    /// `on_message` from a background task until `[DONE]`, end of body or
    /// cancellation.
    pub async fn stream<F>(&self, request: ApiRequest, mut on_message: F) -> Result<StreamHandle, ApiError>
    where
        F: FnMut(Value) + Send + 'static,
    {
        let response = self
            .build(&request, true)
            .await?
            .send()
            .await
            .map_err(|err| ApiError::Network(err.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ApiError::Status {
                status: status.as_u16(),
                body,
            });
        }

        let path = request.path;
        let task = tokio::spawn(async move {
            let mut decoder = SseDecoder::new();
            let mut body = response.bytes_stream();
            while let Some(chunk) = body.next().await {
                let chunk = chunk.map_err(|err| ApiError::Stream(err.to_string()))?;
                for event in decoder.push(&chunk) {
                    match event {
                        SseEvent::Message(value) => on_message(value),
                        SseEvent::Invalid { line, error } => {
                            warn!(path = %path, line = %line, "failed to parse SSE data: {error}");
                        }
                        SseEvent::Done => return Ok(()),
                    }
                }
            }
            if let Some(SseEvent::Message(value)) = decoder.finish() {
                on_message(value);
            }
            Ok::<(), ApiError>(())
        });

        Ok(StreamHandle { task })
    }
}

#[derive(Debug)]
pub struct StreamHandle {
    task: JoinHandle<Result<(), ApiError>>,
}

impl StreamHandle {
    pub fn cancel(&self) {
        self.task.abort();
    }

    pub fn abort_handle(&self) -> AbortHandle {
        self.task.abort_handle()
    }

    /// Resolves when the reader stops. A cancelled stream counts as finished.
    pub async fn finished(self) -> Result<(), ApiError> {
        match self.task.await {
            Ok(result) => result,
            Err(err) if err.is_cancelled() => Ok(()),
            Err(err) => Err(ApiError::Stream(err.to_string())),
        }
    }
}

async fn await_parked(
    rx: oneshot::Receiver<Result<ApiResponse, ApiError>>,
) -> Result<ApiResponse, ApiError> {
    rx.await
        .unwrap_or_else(|_| Err(ApiError::RefreshFailed("refresh abandoned".to_owned())))
}

fn retry_after(headers: &HeaderMap) -> Option<Duration> {
    let seconds = headers.get(RETRY_AFTER)?.to_str().ok()?.trim().parse::<u64>().ok()?;
    Some(Duration::from_secs(seconds))
}

fn to_value<B: Serialize>(body: &B) -> Result<Value, ApiError> {
    serde_json::to_value(body).map_err(|err| ApiError::Decode(err.to_string()))
}
