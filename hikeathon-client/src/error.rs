use hikeathon_core::{ChannelName, CoreError};
use thiserror::Error;

#[derive(Debug, Clone, Error)]
pub enum ApiError {
    #[error("network error: {0}")]
    Network(String),
    #[error("request failed with status {status}: {body}")]
    Status { status: u16, body: String },
    #[error("rate limited by server")]
    RateLimited,
    #[error("unauthorized")]
    Unauthorized,
    #[error("session refresh failed: {0}")]
    RefreshFailed(String),
    #[error("stream error: {0}")]
    Stream(String),
    #[error("failed to decode response: {0}")]
    Decode(String),
    #[error("invalid url: {0}")]
    InvalidUrl(String),
}

impl ApiError {
    pub fn status(&self) -> Option<u16> {
        match self {
            ApiError::Status { status, .. } => Some(*status),
            ApiError::RateLimited => Some(429),
            ApiError::Unauthorized => Some(401),
            _ => None,
        }
    }
}

impl From<reqwest::Error> for ApiError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_decode() {
            ApiError::Decode(err.to_string())
        } else {
            ApiError::Network(err.to_string())
        }
    }
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("invalid credentials")]
    InvalidCredentials,
    #[error("session expired")]
    SessionExpired,
    #[error("not authenticated")]
    NotAuthenticated,
    #[error("permission denied: {0}")]
    PermissionDenied(String),
    #[error("{0} not found")]
    NotFound(String),
    #[error(transparent)]
    Api(#[from] ApiError),
    #[error(transparent)]
    Core(#[from] CoreError),
    #[error(transparent)]
    Realtime(#[from] RealtimeError),
    #[error("storage error: {0}")]
    Storage(String),
    #[error(transparent)]
    WebTool(#[from] WebToolError),
}

#[derive(Debug, Clone, Error)]
pub enum WebToolError {
    #[error("search query is empty")]
    EmptyQuery,
    #[error("invalid url: {0}")]
    InvalidUrl(String),
    #[error("rate limit exceeded, at most {0} requests per minute")]
    RateLimited(usize),
    #[error("access denied to {0}")]
    AccessDenied(String),
    #[error("unsupported content at {0}")]
    UnsupportedContent(String),
    #[error("timed out fetching {0}")]
    Timeout(String),
    #[error(transparent)]
    Api(#[from] ApiError),
}

#[derive(Debug, Clone, Error)]
pub enum RealtimeError {
    #[error("{0} channel not initialized")]
    ChannelMissing(ChannelName),
    #[error("realtime backend error: {0}")]
    Backend(String),
    #[error("realtime manager stopped")]
    Stopped,
}
