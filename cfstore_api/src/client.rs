//! HTTP client for a PostgREST-style bulk store.

use std::time::Duration;

use reqwest::{header::HeaderMap, Method, RequestBuilder};
use serde_json::Value;
use url::Url;

use crate::{
    query::{Filter, InsertMode, Query, Select},
    Error,
};

/// One table row as a JSON object.
pub type Row = serde_json::Map<String, Value>;

const REST_PREFIX: &str = "/rest/v1";

/// HTTP client for the store's REST interface.
///
/// Every request carries the service key both as `apikey` and as a bearer
/// token. The underlying `reqwest::Client` is built once and shared, so a
/// `Client` is cheap to clone across worker tasks.
#[derive(Clone)]
pub struct Client {
    http: reqwest::Client,
    /// Project URL without the `/rest/v1` suffix.
    base_url: String,
    api_key: String,
}

impl Client {
    /// Creates a client with a 30-second request timeout.
    pub fn new(base_url: &str, api_key: &str) -> Result<Self, Error> {
        Self::with_timeout(base_url, api_key, Duration::from_secs(30))
    }

    pub fn with_timeout(base_url: &str, api_key: &str, timeout: Duration) -> Result<Self, Error> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .gzip(true)
            .build()
            .map_err(|e| {
                tracing::error!("Failed to build HTTP client: {}", e);
                Error::from(e)
            })?;
        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key: api_key.to_string(),
        })
    }

    fn table_url(&self, table: &str) -> Result<Url, Error> {
        Url::parse(&format!("{}{}/{}", self.base_url, REST_PREFIX, table)).map_err(|e| {
            tracing::error!("Invalid URL constructed: {}", e);
            Error::InvalidUrl(e.to_string())
        })
    }

    fn request(&self, method: Method, url: Url) -> RequestBuilder {
        self.http
            .request(method, url)
            .header("apikey", &self.api_key)
            .header("Authorization", format!("Bearer {}", self.api_key))
            .header("content-type", "application/json")
            .header("accept", "application/json")
    }

    /// Sends the request and turns non-success statuses into [`Error::HttpStatus`].
    async fn send(&self, req: RequestBuilder) -> Result<(HeaderMap, String), Error> {
        let resp = req.send().await.map_err(|e| {
            tracing::warn!("Store request failed: {}", e);
            Error::from(e)
        })?;
        let status = resp.status();
        let headers = resp.headers().clone();
        let body = resp.text().await.map_err(|e| {
            tracing::warn!("Failed to read response body: {}", e);
            Error::from(e)
        })?;

        if !status.is_success() {
            let snippet = truncate_body(&body);
            tracing::debug!("Store request failed with status {}: {}", status, snippet);
            return Err(Error::HttpStatus {
                status: status.as_u16(),
                body: snippet,
            });
        }
        Ok((headers, body))
    }

    fn parse_rows(body: &str) -> Result<Vec<Row>, Error> {
        if body.trim().is_empty() {
            return Ok(Vec::new());
        }
        serde_json::from_str::<Vec<Row>>(body).map_err(|e| {
            let snippet = truncate_body(body);
            tracing::error!("Failed to parse rows: {} | body: {}", e, snippet);
            Error::ParseFailed(e.to_string())
        })
    }

    /// Runs a read query and returns the matching rows.
    pub async fn select(&self, query: &Select) -> Result<Vec<Row>, Error> {
        let url = query.add_to_url(&self.table_url(&query.table)?);
        let (_, body) = self.send(self.request(Method::GET, url)).await?;
        Self::parse_rows(&body)
    }

    /// Inserts `rows` into `table` in a single request.
    ///
    /// Returns the written rows when the mode asks for a representation,
    /// otherwise an empty vector. An empty `rows` slice issues no request.
    pub async fn insert(
        &self,
        table: &str,
        rows: &[Row],
        mode: &InsertMode,
    ) -> Result<Vec<Row>, Error> {
        if rows.is_empty() {
            return Ok(Vec::new());
        }
        let mut url = self.table_url(table)?;
        if let Some(on) = mode.on_conflict() {
            url.query_pairs_mut().append_pair("on_conflict", on);
        }
        let req = self
            .request(Method::POST, url)
            .header("Prefer", mode.prefer_header())
            .json(rows);
        let (_, body) = self.send(req).await?;
        Self::parse_rows(&body)
    }

    /// Applies `patch` to every row matching `filters`.
    pub async fn update(&self, table: &str, filters: &[Filter], patch: &Row) -> Result<(), Error> {
        let url = filters.add_to_url(&self.table_url(table)?);
        let req = self
            .request(Method::PATCH, url)
            .header("Prefer", "return=minimal")
            .json(patch);
        self.send(req).await?;
        Ok(())
    }

    /// Deletes every row matching `filters`.
    ///
    /// The store refuses unfiltered deletes, and so does this method.
    pub async fn delete(&self, table: &str, filters: &[Filter]) -> Result<(), Error> {
        if filters.is_empty() {
            return Err(Error::InvalidUrl(format!(
                "refusing unfiltered delete on {}",
                table
            )));
        }
        let url = filters.add_to_url(&self.table_url(table)?);
        let req = self
            .request(Method::DELETE, url)
            .header("Prefer", "return=minimal");
        self.send(req).await?;
        Ok(())
    }

    /// Counts rows matching `filters` using the `Content-Range` total.
    pub async fn count(&self, table: &str, filters: &[Filter]) -> Result<u64, Error> {
        let mut url = self.table_url(table)?;
        url.query_pairs_mut()
            .append_pair("select", "*")
            .append_pair("limit", "1");
        let url = filters.add_to_url(&url);
        let req = self
            .request(Method::GET, url)
            .header("Prefer", "count=exact");
        let (headers, _) = self.send(req).await?;
        headers
            .get("content-range")
            .and_then(|v| v.to_str().ok())
            .and_then(parse_content_range)
            .ok_or_else(|| Error::ParseFailed("missing or malformed Content-Range".to_string()))
    }
}

/// Extracts the total from `0-0/123` or `*/0`.
fn parse_content_range(value: &str) -> Option<u64> {
    value.rsplit_once('/')?.1.trim().parse().ok()
}

fn truncate_body(body: &str) -> String {
    const MAX: usize = 2000;
    if body.len() <= MAX {
        return body.to_string();
    }
    let mut end = MAX;
    while !body.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}...[truncated]", &body[..end])
}
