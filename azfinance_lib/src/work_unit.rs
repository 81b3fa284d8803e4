//! Work units and their persisted status.
//!
//! A unit is one row of a queue table (`cf_report_pdfs` for documents,
//! `cf_entities` for committees). Its `status` column moves
//! `unprocessed -> processed | skipped`; a failed attempt leaves it
//! `unprocessed` with a `last_error` note so the next run picks it up again.
//! Only [`WorkQueue::reset`] moves a unit back to `unprocessed`.

use std::fmt;
use std::str::FromStr;

use cfstore_api::{Error, Filter, Row, Select};
use chrono::Utc;
use serde::Serialize;
use serde_json::{json, Value};

use crate::config::MAX_PAGE_SIZE;
use crate::store::{row_i64, BulkStore};

pub const STATUS_COLUMN: &str = "status";

/// Persisted unit status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkStatus {
    Unprocessed,
    Processed,
    Skipped,
}

impl WorkStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Unprocessed => "unprocessed",
            Self::Processed => "processed",
            Self::Skipped => "skipped",
        }
    }

    pub const ALL: [WorkStatus; 3] = [Self::Unprocessed, Self::Processed, Self::Skipped];
}

impl fmt::Display for WorkStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for WorkStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "unprocessed" => Ok(Self::Unprocessed),
            "processed" => Ok(Self::Processed),
            "skipped" => Ok(Self::Skipped),
            other => Err(format!(
                "unknown status '{}'. Valid values: unprocessed, processed, skipped",
                other
            )),
        }
    }
}

/// One unit fetched from a queue table.
#[derive(Debug, Clone, PartialEq)]
pub struct WorkUnit {
    pub id: i64,
    /// Owning entity for documents; `None` for entity units.
    pub parent_id: Option<i64>,
    pub row: Row,
}

impl WorkUnit {
    pub fn text(&self, column: &str) -> &str {
        self.row.get(column).and_then(Value::as_str).unwrap_or("")
    }
}

/// Per-status totals for one queue.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct StatusCounts {
    pub unprocessed: u64,
    pub processed: u64,
    pub skipped: u64,
    /// Unprocessed units that carry a `last_error` from an earlier attempt.
    pub failed_attempts: u64,
}

impl StatusCounts {
    pub fn total(&self) -> u64 {
        self.unprocessed + self.processed + self.skipped
    }
}

/// Where a kind of work unit lives and how it is keyed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkQueue {
    pub table: String,
    pub id_column: String,
    pub parent_column: Option<String>,
    /// Columns fetched with each unit.
    pub columns: Vec<String>,
}

impl WorkQueue {
    /// Filing documents awaiting extraction.
    pub fn report_pdfs() -> Self {
        Self {
            table: "cf_report_pdfs".to_string(),
            id_column: "pdf_id".to_string(),
            parent_column: Some("entity_id".to_string()),
            columns: ["pdf_id", "entity_id", "pdf_url", "report_name"]
                .iter()
                .map(|c| c.to_string())
                .collect(),
        }
    }

    /// Committees awaiting a transaction fetch.
    pub fn entities() -> Self {
        Self {
            table: "cf_entities".to_string(),
            id_column: "entity_id".to_string(),
            parent_column: None,
            columns: vec!["entity_id".to_string()],
        }
    }

    fn id_filter(&self, id: i64) -> Vec<Filter> {
        vec![Filter::eq(&self.id_column, id)]
    }

    fn scope_filters(&self, status: Option<WorkStatus>, parent: Option<i64>) -> Vec<Filter> {
        let mut filters = Vec::new();
        if let Some(status) = status {
            filters.push(Filter::eq(STATUS_COLUMN, status));
        }
        if let (Some(column), Some(parent)) = (&self.parent_column, parent) {
            filters.push(Filter::eq(column, parent));
        }
        filters
    }

    fn to_unit(&self, row: Row) -> Option<WorkUnit> {
        let id = row_i64(&row, &self.id_column)?;
        let parent_id = self
            .parent_column
            .as_deref()
            .and_then(|c| row_i64(&row, c));
        Some(WorkUnit { id, parent_id, row })
    }

    /// Units in `status`, optionally scoped to one parent, ordered by id and
    /// read in pages of at most 1000. Stops after `limit` units.
    pub async fn fetch<S: BulkStore>(
        &self,
        store: &S,
        status: WorkStatus,
        parent: Option<i64>,
        limit: Option<usize>,
    ) -> Result<Vec<WorkUnit>, Error> {
        let columns: Vec<&str> = self.columns.iter().map(String::as_str).collect();
        let base = Select::from(&self.table)
            .columns(&columns)
            .filters(self.scope_filters(Some(status), parent))
            .order_by(&self.id_column);

        let mut units = Vec::new();
        let mut offset = 0;
        loop {
            let page_size = match limit {
                Some(limit) => (limit - units.len()).min(MAX_PAGE_SIZE),
                None => MAX_PAGE_SIZE,
            };
            if page_size == 0 {
                break;
            }
            let page = store
                .select(&base.clone().limit(page_size).offset(offset))
                .await?;
            let fetched = page.len();
            units.extend(page.into_iter().filter_map(|row| self.to_unit(row)));
            if fetched < page_size {
                break;
            }
            offset += fetched;
        }
        Ok(units)
    }

    /// Terminal success: status, timestamp and aggregates in one update.
    pub async fn mark_processed<S: BulkStore>(
        &self,
        store: &S,
        id: i64,
        row_count: usize,
        total_amount: f64,
    ) -> Result<(), Error> {
        let patch = json!({
            "status": WorkStatus::Processed.as_str(),
            "processed_at": Utc::now().to_rfc3339(),
            "row_count": row_count,
            "total_amount": total_amount,
            "last_error": Value::Null,
        });
        store
            .update(&self.table, &self.id_filter(id), &as_row(patch))
            .await
    }

    /// Terminal expected absence, with the reason.
    pub async fn mark_skipped<S: BulkStore>(
        &self,
        store: &S,
        id: i64,
        reason: &str,
    ) -> Result<(), Error> {
        let patch = json!({
            "status": WorkStatus::Skipped.as_str(),
            "status_reason": reason,
            "processed_at": Utc::now().to_rfc3339(),
        });
        store
            .update(&self.table, &self.id_filter(id), &as_row(patch))
            .await
    }

    /// Records why an attempt failed. The status stays `unprocessed`.
    pub async fn note_failure<S: BulkStore>(
        &self,
        store: &S,
        id: i64,
        error: &str,
    ) -> Result<(), Error> {
        let patch = json!({
            "last_error": error.chars().take(1000).collect::<String>(),
            "last_attempt_at": Utc::now().to_rfc3339(),
        });
        let mut filters = self.id_filter(id);
        filters.push(Filter::eq(STATUS_COLUMN, WorkStatus::Unprocessed));
        store.update(&self.table, &filters, &as_row(patch)).await
    }

    /// Moves units in `from` back to `unprocessed`. Returns how many moved.
    pub async fn reset<S: BulkStore>(
        &self,
        store: &S,
        from: WorkStatus,
        parent: Option<i64>,
    ) -> Result<u64, Error> {
        let filters = self.scope_filters(Some(from), parent);
        let n = store.count(&self.table, &filters).await?;
        if n == 0 || from == WorkStatus::Unprocessed {
            return Ok(0);
        }
        let patch = json!({
            "status": WorkStatus::Unprocessed.as_str(),
            "status_reason": Value::Null,
            "processed_at": Value::Null,
            "last_error": Value::Null,
        });
        store.update(&self.table, &filters, &as_row(patch)).await?;
        Ok(n)
    }

    /// Re-flags specific units as `unprocessed`, whatever their current status.
    pub async fn reflag<S: BulkStore>(
        &self,
        store: &S,
        ids: &[i64],
        reason: &str,
    ) -> Result<(), Error> {
        if ids.is_empty() {
            return Ok(());
        }
        let patch = json!({
            "status": WorkStatus::Unprocessed.as_str(),
            "status_reason": reason,
            "processed_at": Value::Null,
        });
        for chunk in ids.chunks(50) {
            store
                .update(
                    &self.table,
                    &[Filter::in_list(&self.id_column, chunk)],
                    &as_row(patch.clone()),
                )
                .await?;
        }
        Ok(())
    }

    pub async fn counts<S: BulkStore>(
        &self,
        store: &S,
        parent: Option<i64>,
    ) -> Result<StatusCounts, Error> {
        let mut counts = StatusCounts::default();
        for status in WorkStatus::ALL {
            let n = store
                .count(&self.table, &self.scope_filters(Some(status), parent))
                .await?;
            match status {
                WorkStatus::Unprocessed => counts.unprocessed = n,
                WorkStatus::Processed => counts.processed = n,
                WorkStatus::Skipped => counts.skipped = n,
            }
        }
        let mut failed = self.scope_filters(Some(WorkStatus::Unprocessed), parent);
        failed.push(Filter::not_null("last_error"));
        counts.failed_attempts = store.count(&self.table, &failed).await?;
        Ok(counts)
    }
}

pub(crate) fn as_row(value: Value) -> Row {
    match value {
        Value::Object(map) => map,
        _ => Row::new(),
    }
}
