//! Client for the state disclosure website: filing PDFs and the paged
//! transaction table.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;
use serde_json::Value;
use url::Url;

use crate::retry::{RequestTracker, RetryPolicy};

/// URL fragment of reports that were scheduled but never filed. Those links
/// answer 404, which is an expected absence rather than a failure.
pub const UNFILED_REPORT_PATTERN: &str = "/ReportFile/";

const TRANSACTIONS_PATH: &str = "/Reporting/GetNEWDetailedTableData";
const TABLE_COLUMNS: &[&str] = &[
    "",
    "TransactionId",
    "TransactionDate",
    "Amount",
    "TransactionType",
    "ReceivedFromOrPaidTo",
];
const USER_AGENT: &str =
    "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/537.36 (KHTML, like Gecko)";

/// Errors from the filing source.
#[derive(thiserror::Error, Debug)]
pub enum FilingsError {
    #[error("request failed: {0}")]
    Network(String),
    #[error("filing source returned status {status}: {body}")]
    HttpStatus { status: u16, body: String },
    #[error("failed to parse response: {0}")]
    ParseFailed(String),
    #[error("invalid URL: {0}")]
    InvalidUrl(String),
    #[error("failed to save document: {0}")]
    Io(#[from] std::io::Error),
}

impl From<reqwest::Error> for FilingsError {
    fn from(e: reqwest::Error) -> Self {
        Self::Network(e.to_string())
    }
}

impl FilingsError {
    /// Network failures and 5xx. Every 4xx, including 429, is terminal.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Network(_) => true,
            Self::HttpStatus { status, .. } => *status >= 500,
            _ => false,
        }
    }
}

/// Result of a document download.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Download {
    /// The document was written to the requested path.
    Saved { bytes: usize },
    /// The URL points at an unfiled report and the site answered 404.
    NotFiled,
}

pub fn is_unfiled_url(url: &str) -> bool {
    url.contains(UNFILED_REPORT_PATTERN)
}

/// One page of the DataTables transaction endpoint.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct TransactionPage {
    #[serde(rename = "recordsTotal", default)]
    pub records_total: u64,
    #[serde(default)]
    pub data: Vec<Value>,
}

/// HTTP client for documents and transaction pages.
#[derive(Clone)]
pub struct FilingsClient {
    http: reqwest::Client,
    base_url: String,
    retry: RetryPolicy,
    tracker: Arc<RequestTracker>,
}

impl FilingsClient {
    pub fn new(
        base_url: &str,
        retry: RetryPolicy,
        tracker: Arc<RequestTracker>,
    ) -> Result<Self, FilingsError> {
        let http = reqwest::Client::builder()
            .user_agent(USER_AGENT)
            .timeout(Duration::from_secs(30))
            .gzip(true)
            .build()?;
        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            retry,
            tracker,
        })
    }

    /// Downloads `url` into `dest`. A 404 on an unfiled-report URL is
    /// [`Download::NotFiled`]; a 404 anywhere else is an error.
    pub async fn download_document(
        &self,
        url: &str,
        dest: &Path,
    ) -> Result<Download, FilingsError> {
        let label = format!("download {}", url);
        self.retry
            .run(&label, &self.tracker, FilingsError::is_retryable, || {
                self.download_once(url, dest)
            })
            .await
    }

    async fn download_once(&self, url: &str, dest: &Path) -> Result<Download, FilingsError> {
        let resp = self.http.get(url).send().await?;
        let status = resp.status();
        if status.as_u16() == 404 && is_unfiled_url(url) {
            tracing::debug!("unfiled report at {}", url);
            return Ok(Download::NotFiled);
        }
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(FilingsError::HttpStatus {
                status: status.as_u16(),
                body: body.chars().take(500).collect(),
            });
        }
        let bytes = resp.bytes().await?;
        tokio::fs::write(dest, &bytes).await?;
        Ok(Download::Saved { bytes: bytes.len() })
    }

    fn transactions_url(
        &self,
        entity_id: i64,
        page: u32,
        length: u32,
    ) -> Result<Url, FilingsError> {
        let mut url = Url::parse(&format!("{}{}", self.base_url, TRANSACTIONS_PATH))
            .map_err(|e| FilingsError::InvalidUrl(e.to_string()))?;
        url.query_pairs_mut()
            .append_pair("Page", "24")
            .append_pair("startYear", "2002")
            .append_pair("endYear", "2026")
            .append_pair("JurisdictionId", "0")
            .append_pair("TablePage", &page.to_string())
            .append_pair("TableLength", &length.to_string())
            .append_pair("Name", &format!("1~{}", entity_id))
            .append_pair("entityId", &entity_id.to_string())
            .append_pair("ChartName", "24")
            .append_pair("IsLessActive", "false")
            .append_pair("ShowOfficeHolder", "false");
        Ok(url)
    }

    /// DataTables form body for page `page` (1-based).
    fn transactions_form(page: u32, length: u32) -> Vec<(String, String)> {
        let start = (page.saturating_sub(1) as u64) * length as u64;
        let mut form = vec![
            ("draw".to_string(), "1".to_string()),
            ("start".to_string(), start.to_string()),
            ("length".to_string(), length.to_string()),
            ("search[value]".to_string(), String::new()),
            ("search[regex]".to_string(), "false".to_string()),
            ("order[0][column]".to_string(), "2".to_string()),
            ("order[0][dir]".to_string(), "desc".to_string()),
        ];
        for (i, column) in TABLE_COLUMNS.iter().enumerate() {
            let flag = if i > 0 { "true" } else { "false" };
            form.push((format!("columns[{}][data]", i), column.to_string()));
            form.push((format!("columns[{}][name]", i), String::new()));
            form.push((format!("columns[{}][searchable]", i), flag.to_string()));
            form.push((format!("columns[{}][orderable]", i), flag.to_string()));
            form.push((format!("columns[{}][search][value]", i), String::new()));
            form.push((format!("columns[{}][search][regex]", i), "false".to_string()));
        }
        form
    }

    async fn fetch_page_once(
        &self,
        entity_id: i64,
        page: u32,
        length: u32,
    ) -> Result<TransactionPage, FilingsError> {
        let url = self.transactions_url(entity_id, page, length)?;
        let resp = self
            .http
            .post(url)
            .form(&Self::transactions_form(page, length))
            .send()
            .await?;
        let status = resp.status();
        let body = resp.text().await?;
        if !status.is_success() {
            return Err(FilingsError::HttpStatus {
                status: status.as_u16(),
                body: body.chars().take(500).collect(),
            });
        }
        serde_json::from_str(&body).map_err(|e| {
            tracing::error!("unparsable transaction page for entity {}: {}", entity_id, e);
            FilingsError::ParseFailed(e.to_string())
        })
    }

    /// One page of an entity's transactions, under the retry policy.
    pub async fn fetch_transactions_page(
        &self,
        entity_id: i64,
        page: u32,
        length: u32,
    ) -> Result<TransactionPage, FilingsError> {
        let label = format!("entity {} page {}", entity_id, page);
        self.retry
            .run(&label, &self.tracker, FilingsError::is_retryable, || {
                self.fetch_page_once(entity_id, page, length)
            })
            .await
    }

    /// Every transaction of an entity. `recordsTotal` on the first page sets
    /// the page count; any page that ultimately fails fails the whole fetch.
    pub async fn fetch_all_transactions(
        &self,
        entity_id: i64,
        length: u32,
    ) -> Result<Vec<Value>, FilingsError> {
        let length = length.max(1);
        let first = self.fetch_transactions_page(entity_id, 1, length).await?;
        if first.records_total == 0 {
            return Ok(Vec::new());
        }
        let total_pages = first.records_total.div_ceil(length as u64) as u32;
        let mut all = first.data;
        for page in 2..=total_pages {
            let next = self.fetch_transactions_page(entity_id, page, length).await?;
            if next.data.is_empty() {
                break;
            }
            all.extend(next.data);
            if page % 10 == 0 {
                tracing::info!(
                    "entity {}: fetched page {}/{}",
                    entity_id,
                    page,
                    total_pages
                );
            }
        }
        Ok(all)
    }
}
