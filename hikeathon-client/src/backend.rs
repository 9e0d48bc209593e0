use reqwest::{Method, StatusCode};
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use serde_json::Value;
use tracing::debug;

use crate::{
    api::{ApiClient, ApiRequest, ApiResponse},
    error::ApiError,
};

const REST_PREFIX: &str = "/rest/v1";
const PREFER_REPRESENTATION: &str = "return=representation";
const SINGLE_OBJECT: &str = "application/vnd.pgrst.object+json";
const NO_ROWS_CODE: &str = "PGRST116";

/// Entry point for PostgREST tables. Table requests authenticate with the
/// anon key, as the project's row-level policies expect.
#[derive(Clone)]
pub struct Backend {
    api: ApiClient,
}

impl Backend {
    pub fn new(api: ApiClient) -> Self {
        Self { api }
    }

    pub fn api(&self) -> &ApiClient {
        &self.api
    }

    pub fn from(&self, table: &str) -> TableQuery {
        TableQuery {
            api: self.api.clone(),
            table: table.to_owned(),
            columns: "*".to_owned(),
            filters: Vec::new(),
            order: Vec::new(),
            limit: None,
        }
    }
}

#[derive(Debug, Deserialize)]
struct PostgrestError {
    #[serde(default)]
    code: Option<String>,
    #[serde(default)]
    message: Option<String>,
}

/// A query against one table. Filters accumulate; the terminal methods
/// (`fetch`, `single`, `insert`, `update`, `delete`) send the request.
#[derive(Clone)]
pub struct TableQuery {
    api: ApiClient,
    table: String,
    columns: String,
    filters: Vec<(String, String)>,
    order: Vec<String>,
    limit: Option<usize>,
}

impl TableQuery {
    pub fn select(mut self, columns: &str) -> Self {
        self.columns = columns.to_owned();
        self
    }

    pub fn eq(self, column: &str, value: impl ToString) -> Self {
        self.filter(column, "eq", value)
    }

    pub fn gte(self, column: &str, value: impl ToString) -> Self {
        self.filter(column, "gte", value)
    }

    pub fn lte(self, column: &str, value: impl ToString) -> Self {
        self.filter(column, "lte", value)
    }

    pub fn lt(self, column: &str, value: impl ToString) -> Self {
        self.filter(column, "lt", value)
    }

    pub fn gt(self, column: &str, value: impl ToString) -> Self {
        self.filter(column, "gt", value)
    }

    /// Raw PostgREST disjunction, e.g. `is_global.eq.true,assignee.eq.TEAM`.
    pub fn or(mut self, expression: &str) -> Self {
        self.filters
            .push(("or".to_owned(), format!("({expression})")));
        self
    }

    pub fn not_null(mut self, column: &str) -> Self {
        self.filters
            .push((column.to_owned(), "not.is.null".to_owned()));
        self
    }

    /// Unique columns an `upsert` merges on.
    pub fn on_conflict(mut self, columns: &str) -> Self {
        self.filters
            .push(("on_conflict".to_owned(), columns.to_owned()));
        self
    }

    pub fn order(mut self, column: &str, ascending: bool) -> Self {
        let direction = if ascending { "asc" } else { "desc" };
        self.order.push(format!("{column}.{direction}"));
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    fn filter(mut self, column: &str, op: &str, value: impl ToString) -> Self {
        self.filters
            .push((column.to_owned(), format!("{op}.{}", value.to_string())));
        self
    }

    /// Path plus query string. `select` is left out for writes that do not
    /// ask for a representation.
    pub fn path(&self, with_select: bool) -> String {
        let mut query = url::form_urlencoded::Serializer::new(String::new());
        if with_select {
            query.append_pair("select", &self.columns);
        }
        for (key, value) in &self.filters {
            query.append_pair(key, value);
        }
        if !self.order.is_empty() {
            query.append_pair("order", &self.order.join(","));
        }
        if let Some(limit) = self.limit {
            query.append_pair("limit", &limit.to_string());
        }
        let query = query.finish();
        if query.is_empty() {
            format!("{REST_PREFIX}/{}", self.table)
        } else {
            format!("{REST_PREFIX}/{}?{query}", self.table)
        }
    }

    fn request(&self, method: Method, with_select: bool) -> ApiRequest {
        ApiRequest::new(method, self.path(with_select))
            .skip_auth()
            .header("Authorization", format!("Bearer {}", self.api.anon_key()))
    }

    pub async fn fetch<T: DeserializeOwned>(self) -> Result<Vec<T>, ApiError> {
        let response = self.api.request(self.request(Method::GET, true)).await?;
        check(&self.table, response)?.json()
    }

    /// Exactly one row, or `None` when the filters match nothing.
    pub async fn single<T: DeserializeOwned>(self) -> Result<Option<T>, ApiError> {
        let request = self
            .request(Method::GET, true)
            .header("Accept", SINGLE_OBJECT);
        let response = self.api.request(request).await?;
        if response.status() == StatusCode::NOT_ACCEPTABLE || is_no_rows(&response) {
            debug!(table = %self.table, "single row lookup matched nothing");
            return Ok(None);
        }
        check(&self.table, response)?.json().map(Some)
    }

    /// Inserts one row and returns it as stored.
    pub async fn insert<B, T>(self, row: &B) -> Result<T, ApiError>
    where
        B: Serialize + ?Sized,
        T: DeserializeOwned,
    {
        let request = self
            .request(Method::POST, true)
            .header("Prefer", PREFER_REPRESENTATION)
            .json(to_value(row)?);
        let response = self.api.request(request).await?;
        first_row(&self.table, check(&self.table, response)?)
    }

    /// Inserts or merges on the table's unique key.
    pub async fn upsert<B, T>(self, row: &B) -> Result<T, ApiError>
    where
        B: Serialize + ?Sized,
        T: DeserializeOwned,
    {
        let request = self
            .request(Method::POST, true)
            .header(
                "Prefer",
                format!("{PREFER_REPRESENTATION},resolution=merge-duplicates"),
            )
            .json(to_value(row)?);
        let response = self.api.request(request).await?;
        first_row(&self.table, check(&self.table, response)?)
    }

    /// Applies `changes` to every row the filters match and returns them.
    pub async fn update<B, T>(self, changes: &B) -> Result<Vec<T>, ApiError>
    where
        B: Serialize + ?Sized,
        T: DeserializeOwned,
    {
        let request = self
            .request(Method::PATCH, true)
            .header("Prefer", PREFER_REPRESENTATION)
            .json(to_value(changes)?);
        let response = self.api.request(request).await?;
        check(&self.table, response)?.json()
    }

    pub async fn delete(self) -> Result<(), ApiError> {
        let response = self.api.request(self.request(Method::DELETE, false)).await?;
        check(&self.table, response).map(|_| ())
    }
}

fn check(table: &str, response: ApiResponse) -> Result<ApiResponse, ApiError> {
    if response.is_success() {
        return Ok(response);
    }
    let status = response.status().as_u16();
    let body = match response.json::<PostgrestError>() {
        Ok(PostgrestError {
            message: Some(message),
            ..
        }) => message,
        _ => response.text(),
    };
    debug!(table, status, "table request failed: {body}");
    Err(ApiError::Status { status, body })
}

fn is_no_rows(response: &ApiResponse) -> bool {
    !response.is_success()
        && response
            .json::<PostgrestError>()
            .is_ok_and(|err| err.code.as_deref() == Some(NO_ROWS_CODE))
}

fn first_row<T: DeserializeOwned>(table: &str, response: ApiResponse) -> Result<T, ApiError> {
    let rows: Vec<T> = response.json()?;
    rows.into_iter()
        .next()
        .ok_or_else(|| ApiError::Decode(format!("{table}: write returned no rows")))
}

fn to_value<B: Serialize + ?Sized>(body: &B) -> Result<Value, ApiError> {
    serde_json::to_value(body).map_err(|err| ApiError::Decode(err.to_string()))
}
