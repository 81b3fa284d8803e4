//! The bulk-store seam.
//!
//! [`BulkStore`] is the narrow set of table operations the pipeline needs.
//! The REST client implements it for production; `memory::MemoryStore`
//! implements it in-process for tests (`test-util` feature).

use std::future::Future;

use cfstore_api::{Client, Error, Filter, InsertMode, Row, Select};

#[cfg(any(test, feature = "test-util"))]
pub mod memory;

/// Table-level operations against the store.
pub trait BulkStore: Send + Sync {
    /// Rows matching `query`. A single call returns at most one page.
    fn select(&self, query: &Select) -> impl Future<Output = Result<Vec<Row>, Error>> + Send;

    /// Writes `rows` in one request; returns them when `mode` asks for a representation.
    fn insert(
        &self,
        table: &str,
        rows: &[Row],
        mode: &InsertMode,
    ) -> impl Future<Output = Result<Vec<Row>, Error>> + Send;

    fn update(
        &self,
        table: &str,
        filters: &[Filter],
        patch: &Row,
    ) -> impl Future<Output = Result<(), Error>> + Send;

    fn delete(&self, table: &str, filters: &[Filter])
        -> impl Future<Output = Result<(), Error>> + Send;

    fn count(&self, table: &str, filters: &[Filter])
        -> impl Future<Output = Result<u64, Error>> + Send;
}

impl BulkStore for Client {
    fn select(&self, query: &Select) -> impl Future<Output = Result<Vec<Row>, Error>> + Send {
        Client::select(self, query)
    }

    fn insert(
        &self,
        table: &str,
        rows: &[Row],
        mode: &InsertMode,
    ) -> impl Future<Output = Result<Vec<Row>, Error>> + Send {
        Client::insert(self, table, rows, mode)
    }

    fn update(
        &self,
        table: &str,
        filters: &[Filter],
        patch: &Row,
    ) -> impl Future<Output = Result<(), Error>> + Send {
        Client::update(self, table, filters, patch)
    }

    fn delete(
        &self,
        table: &str,
        filters: &[Filter],
    ) -> impl Future<Output = Result<(), Error>> + Send {
        Client::delete(self, table, filters)
    }

    fn count(
        &self,
        table: &str,
        filters: &[Filter],
    ) -> impl Future<Output = Result<u64, Error>> + Send {
        Client::count(self, table, filters)
    }
}

/// Reads every row matching `query`, following `offset` in pages of `page_size`.
pub async fn select_all<S: BulkStore>(
    store: &S,
    query: Select,
    page_size: usize,
) -> Result<Vec<Row>, Error> {
    let page_size = page_size.clamp(1, crate::config::MAX_PAGE_SIZE);
    let mut all = Vec::new();
    let mut offset = query.offset.unwrap_or(0);
    loop {
        let page = store
            .select(&query.clone().limit(page_size).offset(offset))
            .await?;
        let fetched = page.len();
        all.extend(page);
        if fetched < page_size {
            break;
        }
        offset += fetched;
    }
    Ok(all)
}

/// Integer column value; accepts JSON numbers and numeric strings.
pub fn row_i64(row: &Row, column: &str) -> Option<i64> {
    match row.get(column)? {
        serde_json::Value::Number(n) => n.as_i64().or_else(|| n.as_f64().map(|f| f as i64)),
        serde_json::Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

pub fn row_f64(row: &Row, column: &str) -> Option<f64> {
    match row.get(column)? {
        serde_json::Value::Number(n) => n.as_f64(),
        serde_json::Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

pub fn row_str<'a>(row: &'a Row, column: &str) -> Option<&'a str> {
    row.get(column)?.as_str()
}
