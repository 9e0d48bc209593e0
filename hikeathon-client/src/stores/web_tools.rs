use std::{
    sync::{Mutex, MutexGuard, PoisonError},
    time::Duration,
};

use chrono::{DateTime, Utc};
use hikeathon_core::{RateWindow, TtlCache};
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tokio::{sync::watch, time::Instant};
use tracing::{debug, info, warn};
use url::Url;

use super::Observable;
use crate::{
    api::ApiClient,
    error::{ApiError, WebToolError},
};

pub const SEARCH_FUNCTION: &str = "search-web";
pub const FETCH_FUNCTION: &str = "fetch-url";
pub const CACHE_TTL: Duration = Duration::from_secs(15 * 60);
pub const CACHE_CAPACITY: usize = 50;
pub const SEARCHES_PER_MINUTE: usize = 10;
pub const FETCHES_PER_MINUTE: usize = 20;
pub const FETCH_TIMEOUT: Duration = Duration::from_secs(30);
pub const DEFAULT_RESULT_COUNT: u32 = 10;
/// Links followed from one message or one search.
pub const MAX_URLS: usize = 5;
pub const SUMMARY_CHARS: usize = 200;
pub const RELEVANT_CHARS: usize = 2000;

const DOCUMENT_EXTENSIONS: &[&str] = &[
    ".pdf", ".doc", ".docx", ".txt", ".xls", ".xlsx", ".ppt", ".pptx",
];
const TRAILING_PUNCTUATION: &[char] = &['.', ',', ';', ':', '!', '?', ')', ']', '>', '"', '\''];
const LEADING_PUNCTUATION: &[char] = &['(', '[', '<', '"', '\''];

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchResult {
    pub title: String,
    pub link: String,
    #[serde(default)]
    pub snippet: String,
    #[serde(default)]
    pub position: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SearchResponse {
    pub query: String,
    #[serde(default)]
    pub results: Vec<SearchResult>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub knowledge_graph: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub answer_box: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub search_time: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FetchedPage {
    pub url: String,
    #[serde(default)]
    pub content_type: String,
    pub content: String,
    pub fetched_at: DateTime<Utc>,
}

impl FetchedPage {
    pub fn summary(&self) -> String {
        let head: String = self.content.chars().take(SUMMARY_CHARS).collect();
        head.trim().to_owned()
    }

    pub fn is_document(&self) -> bool {
        is_document_url(&self.url)
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct WebToolsState {
    pub is_searching: bool,
    pub is_fetching: bool,
    pub search_results: Option<SearchResponse>,
    pub fetched: Option<FetchedPage>,
    pub search_error: Option<String>,
    pub fetch_error: Option<String>,
}

struct Limits {
    searches: TtlCache<SearchResponse>,
    pages: TtlCache<FetchedPage>,
    search_window: RateWindow,
    fetch_window: RateWindow,
}

/// Web search and page fetching through the `search-web` and `fetch-url`
/// edge functions, with per-minute limits and a short-lived cache.
pub struct WebTools {
    api: ApiClient,
    limits: Mutex<Limits>,
    state: Observable<WebToolsState>,
}

impl WebTools {
    pub fn new(api: ApiClient) -> Self {
        Self {
            api,
            limits: Mutex::new(Limits {
                searches: TtlCache::new(CACHE_TTL, CACHE_CAPACITY),
                pages: TtlCache::new(CACHE_TTL, CACHE_CAPACITY),
                search_window: RateWindow::per_minute(SEARCHES_PER_MINUTE),
                fetch_window: RateWindow::per_minute(FETCHES_PER_MINUTE),
            }),
            state: Observable::default(),
        }
    }

    pub fn state(&self) -> WebToolsState {
        self.state.get()
    }

    pub fn subscribe(&self) -> watch::Receiver<WebToolsState> {
        self.state.subscribe()
    }

    /// Cached answers are served without counting against the limit.
    pub async fn search_web(&self, query: &str, num: u32) -> Result<SearchResponse, WebToolError> {
        let query = query.trim();
        if query.is_empty() {
            return Err(WebToolError::EmptyQuery);
        }
        let key = format!("{query}-{num}");
        let now = Instant::now().into_std();
        {
            let mut limits = self.limits();
            if let Some(cached) = limits.searches.get(&key, now) {
                debug!(query, "search served from cache");
                self.state.update(|s| s.search_results = Some(cached.clone()));
                return Ok(cached);
            }
            if !limits.search_window.try_acquire(now) {
                warn!("search rate limit reached");
                return Err(WebToolError::RateLimited(SEARCHES_PER_MINUTE));
            }
        }

        self.state.update(|s| {
            s.is_searching = true;
            s.search_error = None;
        });
        let result = self.run_search(query, num).await;
        self.state.update(|s| {
            s.is_searching = false;
            match &result {
                Ok(response) => s.search_results = Some(response.clone()),
                Err(err) => s.search_error = Some(err.to_string()),
            }
        });

        let response = result?;
        info!(query, results = response.results.len(), "web search complete");
        self.limits()
            .searches
            .insert(key, response.clone(), Instant::now().into_std());
        Ok(response)
    }

    async fn run_search(&self, query: &str, num: u32) -> Result<SearchResponse, WebToolError> {
        let response = self
            .api
            .invoke_function(SEARCH_FUNCTION, &json!({ "query": query, "num": num }))
            .await?
            .error_for_status()?;
        Ok(response.json()?)
    }

    pub async fn fetch_url(&self, url: &str) -> Result<FetchedPage, WebToolError> {
        let url = sanitize_url(url).ok_or_else(|| WebToolError::InvalidUrl(url.to_owned()))?;
        let now = Instant::now().into_std();
        {
            let mut limits = self.limits();
            if let Some(cached) = limits.pages.get(&url, now) {
                debug!(%url, "page served from cache");
                self.state.update(|s| s.fetched = Some(cached.clone()));
                return Ok(cached);
            }
            if !limits.fetch_window.try_acquire(now) {
                warn!("fetch rate limit reached");
                return Err(WebToolError::RateLimited(FETCHES_PER_MINUTE));
            }
        }

        self.state.update(|s| {
            s.is_fetching = true;
            s.fetch_error = None;
        });
        let result = match tokio::time::timeout(FETCH_TIMEOUT, self.run_fetch(&url)).await {
            Ok(result) => result,
            Err(_) => Err(WebToolError::Timeout(host_of(&url))),
        };
        self.state.update(|s| {
            s.is_fetching = false;
            match &result {
                Ok(page) => s.fetched = Some(page.clone()),
                Err(err) => s.fetch_error = Some(err.to_string()),
            }
        });

        let page = result?;
        info!(%url, chars = page.content.chars().count(), "page fetched");
        self.limits()
            .pages
            .insert(url, page.clone(), Instant::now().into_std());
        Ok(page)
    }

    async fn run_fetch(&self, url: &str) -> Result<FetchedPage, WebToolError> {
        let response = self
            .api
            .invoke_function(FETCH_FUNCTION, &json!({ "url": url }))
            .await?;
        match response.status() {
            status if status.is_success() => Ok(response.json()?),
            StatusCode::BAD_REQUEST => Err(WebToolError::InvalidUrl(url.to_owned())),
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
                Err(WebToolError::AccessDenied(host_of(url)))
            }
            StatusCode::UNSUPPORTED_MEDIA_TYPE => {
                Err(WebToolError::UnsupportedContent(host_of(url)))
            }
            status => Err(WebToolError::Api(ApiError::Status {
                status: status.as_u16(),
                body: response.text(),
            })),
        }
    }

    /// Fetches up to [`MAX_URLS`] distinct links one after another. Each
    /// link reports its own outcome.
    pub async fn fetch_urls(
        &self,
        urls: &[String],
    ) -> Vec<(String, Result<FetchedPage, WebToolError>)> {
        let mut distinct: Vec<&String> = Vec::new();
        for url in urls {
            if !distinct.contains(&url) {
                distinct.push(url);
            }
        }
        let mut outcomes = Vec::new();
        for url in distinct.into_iter().take(MAX_URLS) {
            let outcome = self.fetch_url(url).await;
            outcomes.push((url.clone(), outcome));
        }
        outcomes
    }

    /// Searches, then fetches the top `count` hits. Hits that fail to load
    /// are skipped.
    pub async fn search_and_fetch(
        &self,
        query: &str,
        count: usize,
    ) -> Result<(SearchResponse, Vec<FetchedPage>), WebToolError> {
        let search = self.search_web(query, DEFAULT_RESULT_COUNT).await?;
        let mut pages = Vec::new();
        for hit in search.results.iter().take(count) {
            match self.fetch_url(&hit.link).await {
                Ok(page) => pages.push(page),
                Err(err) => warn!(link = %hit.link, "skipping search hit: {err}"),
            }
        }
        Ok((search, pages))
    }

    pub fn clear_search_results(&self) {
        self.state.update(|s| {
            s.search_results = None;
            s.search_error = None;
        });
    }

    pub fn clear_fetched_content(&self) {
        self.state.update(|s| {
            s.fetched = None;
            s.fetch_error = None;
        });
    }

    pub fn clear_caches(&self) {
        let mut limits = self.limits();
        limits.searches.clear();
        limits.pages.clear();
    }

    fn limits(&self) -> MutexGuard<'_, Limits> {
        self.limits.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Markdown list of the hits, ready to drop into a chat prompt.
pub fn format_search_results(response: &SearchResponse) -> String {
    response
        .results
        .iter()
        .enumerate()
        .map(|(index, hit)| {
            format!(
                "{}. [{}]({})\n   {}",
                index + 1,
                hit.title,
                hit.link,
                hit.snippet
            )
        })
        .collect::<Vec<_>>()
        .join("\n\n")
}

/// For each page, the ten sentences mentioning the most query words (words
/// of three letters or more), best first, cut to `max_chars`.
pub fn extract_relevant_content(pages: &[FetchedPage], query: &str, max_chars: usize) -> Vec<String> {
    let words: Vec<String> = query
        .split_whitespace()
        .map(str::to_lowercase)
        .filter(|word| word.chars().count() > 2)
        .collect();

    pages
        .iter()
        .map(|page| {
            let mut scored: Vec<(usize, &str)> = sentences(&page.content)
                .into_iter()
                .map(|sentence| {
                    let lower = sentence.to_lowercase();
                    let score = words.iter().filter(|w| lower.contains(w.as_str())).count();
                    (score, sentence)
                })
                .filter(|(score, _)| *score > 0)
                .collect();
            scored.sort_by(|a, b| b.0.cmp(&a.0));
            let joined = scored
                .into_iter()
                .take(10)
                .map(|(_, sentence)| sentence)
                .collect::<Vec<_>>()
                .join(" ");
            joined.chars().take(max_chars).collect()
        })
        .collect()
}

/// Sentences ending in `.`, `!` or `?`; an unterminated tail is dropped.
fn sentences(text: &str) -> Vec<&str> {
    let mut found = Vec::new();
    let mut start = 0;
    let mut chars = text.char_indices().peekable();
    while let Some((index, ch)) = chars.next() {
        if !matches!(ch, '.' | '!' | '?') {
            continue;
        }
        let mut end = index + ch.len_utf8();
        while let Some(&(next, c)) = chars.peek() {
            if !matches!(c, '.' | '!' | '?') {
                break;
            }
            end = next + c.len_utf8();
            chars.next();
        }
        let sentence = text[start..end].trim();
        if sentence.len() > 1 {
            found.push(sentence);
        }
        start = end;
    }
    found
}

/// Links in free text: explicit http(s) URLs, `www.` hosts and bare domains.
/// Bare hosts get `https://`; anything but http(s) is dropped. Order of first
/// appearance, no duplicates.
pub fn extract_urls(text: &str) -> Vec<String> {
    let mut found: Vec<String> = Vec::new();
    for token in text.split_whitespace() {
        let token = token
            .trim_start_matches(LEADING_PUNCTUATION)
            .trim_end_matches(TRAILING_PUNCTUATION);
        let candidate = if token.contains("://") {
            token.to_owned()
        } else if looks_like_domain(token) {
            format!("https://{token}")
        } else {
            continue;
        };
        if let Some(url) = sanitize_url(&candidate)
            && !found.contains(&url)
        {
            found.push(url);
        }
    }
    found
}

/// Parses `raw` and keeps it only for http and https.
pub fn sanitize_url(raw: &str) -> Option<String> {
    let url = Url::parse(raw.trim()).ok()?;
    matches!(url.scheme(), "http" | "https").then(|| url.to_string())
}

pub fn is_document_url(url: &str) -> bool {
    let lower = url.to_lowercase();
    DOCUMENT_EXTENSIONS.iter().any(|ext| lower.ends_with(ext))
}

fn looks_like_domain(token: &str) -> bool {
    let host = token.split(['/', '?', '#']).next().unwrap_or_default();
    if host.contains('@') {
        return false;
    }
    let Some((name, tld)) = host.rsplit_once('.') else {
        return false;
    };
    !name.is_empty()
        && !name.starts_with('.')
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '.')
        && tld.len() >= 2
        && tld.chars().all(|c| c.is_ascii_alphabetic())
}

fn host_of(url: &str) -> String {
    Url::parse(url)
        .ok()
        .and_then(|url| url.host_str().map(str::to_owned))
        .unwrap_or_else(|| url.to_owned())
}
