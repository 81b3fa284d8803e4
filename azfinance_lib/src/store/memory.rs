//! In-process [`BulkStore`] with PostgREST-like semantics.
//!
//! Supports identity columns, `on_conflict` resolution, the filter operators
//! of [`Filter`], ordering and paging. Every call is appended to a log so
//! tests can assert on request order, and failures can be scripted per
//! operation and table.

use std::cmp::Ordering;
use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::sync::Mutex;

use cfstore_api::{Conflict, Error, Filter, InsertMode, Returning, Row, Select, SortDirection};
use serde_json::Value;

use super::BulkStore;

/// Store operation kinds, as recorded in the call log.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Op {
    Select,
    Insert,
    Update,
    Delete,
    Count,
}

/// One logged call.
#[derive(Debug, Clone, PartialEq)]
pub struct StoreCall {
    pub op: Op,
    pub table: String,
    /// Rows sent (inserts) or affected (updates, deletes).
    pub rows: usize,
    pub failed: bool,
}

/// A failure to inject instead of executing a call.
#[derive(Debug, Clone)]
pub struct Failure {
    status: Option<u16>,
    body: String,
}

impl Failure {
    pub fn status(status: u16, body: &str) -> Self {
        Self {
            status: Some(status),
            body: body.to_string(),
        }
    }

    /// A 500 carrying the Postgres deadlock code.
    pub fn deadlock() -> Self {
        Self::status(500, r#"{"code":"40P01","message":"deadlock detected"}"#)
    }

    /// No response at all.
    pub fn network() -> Self {
        Self {
            status: None,
            body: "connection reset by peer".to_string(),
        }
    }

    fn to_error(&self) -> Error {
        match self.status {
            Some(status) => Error::HttpStatus {
                status,
                body: self.body.clone(),
            },
            None => Error::RequestFailed(self.body.clone()),
        }
    }
}

struct Scripted {
    op: Op,
    table: String,
    failure: Failure,
}

#[derive(Default)]
struct Inner {
    tables: HashMap<String, Vec<Row>>,
    /// table -> (identity column, next value)
    identities: HashMap<String, (String, i64)>,
    /// table -> column that rejects duplicates on plain inserts
    unique: HashMap<String, String>,
    /// table -> widest `in.(...)` list accepted before answering 414
    uri_limits: HashMap<String, usize>,
    once: VecDeque<Scripted>,
    always: Vec<Scripted>,
    log: Vec<StoreCall>,
}

/// Thread-safe in-memory store.
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Assigns increasing integers to `column` for rows inserted without one.
    pub fn with_identity(self, table: &str, column: &str) -> Self {
        self.lock()
            .identities
            .insert(table.to_string(), (column.to_string(), 1));
        self
    }

    /// Makes plain inserts fail with 409 when `column` collides.
    pub fn with_unique(self, table: &str, column: &str) -> Self {
        self.lock()
            .unique
            .insert(table.to_string(), column.to_string());
        self
    }

    /// Answers 414 when an `in.(...)` filter on `table` lists more than `max` values.
    pub fn with_uri_limit(self, table: &str, max: usize) -> Self {
        self.lock().uri_limits.insert(table.to_string(), max);
        self
    }

    /// Inserts rows directly, bypassing the log and scripted failures.
    pub fn seed(&self, table: &str, rows: Vec<Row>) {
        let mut inner = self.lock();
        for row in rows {
            let row = assign_identity(&mut inner, table, row);
            inner.tables.entry(table.to_string()).or_default().push(row);
        }
    }

    /// Fails the next matching call once.
    pub fn fail_next(&self, op: Op, table: &str, failure: Failure) {
        self.lock().once.push_back(Scripted {
            op,
            table: table.to_string(),
            failure,
        });
    }

    /// Fails every matching call.
    pub fn fail_always(&self, op: Op, table: &str, failure: Failure) {
        self.lock().always.push(Scripted {
            op,
            table: table.to_string(),
            failure,
        });
    }

    pub fn rows(&self, table: &str) -> Vec<Row> {
        self.lock().tables.get(table).cloned().unwrap_or_default()
    }

    pub fn calls(&self) -> Vec<StoreCall> {
        self.lock().log.clone()
    }

    /// Number of logged calls (successful or not) for `op` on `table`.
    pub fn call_count(&self, op: Op, table: &str) -> usize {
        self.lock()
            .log
            .iter()
            .filter(|c| c.op == op && c.table == table)
            .count()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn scripted_failure(inner: &mut Inner, op: Op, table: &str) -> Option<Error> {
        if let Some(pos) = inner
            .once
            .iter()
            .position(|s| s.op == op && s.table == table)
        {
            return inner.once.remove(pos).map(|s| s.failure.to_error());
        }
        inner
            .always
            .iter()
            .find(|s| s.op == op && s.table == table)
            .map(|s| s.failure.to_error())
    }

    fn check_uri_limit(inner: &Inner, table: &str, filters: &[Filter]) -> Option<Error> {
        let max = *inner.uri_limits.get(table)?;
        filters.iter().find_map(|f| match f {
            Filter::In(_, values) if values.len() > max => Some(Error::HttpStatus {
                status: 414,
                body: "URI Too Long".to_string(),
            }),
            _ => None,
        })
    }

    /// Runs `body` unless a failure is scripted, logging the call either way.
    fn execute<T>(
        &self,
        op: Op,
        table: &str,
        filters: &[Filter],
        sent: usize,
        body: impl FnOnce(&mut Inner) -> Result<(T, usize), Error>,
    ) -> Result<T, Error> {
        let mut inner = self.lock();
        let injected = Self::scripted_failure(&mut inner, op, table)
            .or_else(|| Self::check_uri_limit(&inner, table, filters));
        let result = match injected {
            Some(err) => Err(err),
            None => body(&mut inner),
        };
        let (rows, failed) = match &result {
            Ok((_, affected)) => (sent.max(*affected), false),
            Err(_) => (sent, true),
        };
        inner.log.push(StoreCall {
            op,
            table: table.to_string(),
            rows,
            failed,
        });
        result.map(|(value, _)| value)
    }

    fn do_select(&self, query: &Select) -> Result<Vec<Row>, Error> {
        self.execute(Op::Select, &query.table, &query.filters, 0, |inner| {
            let mut rows: Vec<Row> = inner
                .tables
                .get(&query.table)
                .map(|rows| {
                    rows.iter()
                        .filter(|r| matches_all(r, &query.filters))
                        .cloned()
                        .collect()
                })
                .unwrap_or_default();
            if !query.order.is_empty() {
                rows.sort_by(|a, b| {
                    for (column, dir) in &query.order {
                        let ord = compare_values(a.get(column), b.get(column));
                        let ord = match dir {
                            SortDirection::Asc => ord,
                            SortDirection::Desc => ord.reverse(),
                        };
                        if ord != Ordering::Equal {
                            return ord;
                        }
                    }
                    Ordering::Equal
                });
            }
            let offset = query.offset.unwrap_or(0);
            let limit = query.limit.unwrap_or(usize::MAX);
            let rows: Vec<Row> = rows
                .into_iter()
                .skip(offset)
                .take(limit)
                .map(|r| project(r, &query.columns))
                .collect();
            Ok((rows, 0))
        })
    }

    fn do_insert(&self, table: &str, rows: &[Row], mode: &InsertMode) -> Result<Vec<Row>, Error> {
        if rows.is_empty() {
            return Ok(Vec::new());
        }
        self.execute(Op::Insert, table, &[], rows.len(), |inner| {
            let conflict_cols: Vec<String> = mode
                .on_conflict()
                .map(|on| on.split(',').map(|c| c.trim().to_string()).collect())
                .unwrap_or_default();
            let unique = inner.unique.get(table).cloned();

            // Validate before mutating so a rejected request writes nothing.
            if matches!(mode.conflict, Conflict::Reject) {
                if let Some(column) = &unique {
                    let existing = inner.tables.get(table).cloned().unwrap_or_default();
                    for row in rows {
                        let key = value_text(row.get(column));
                        if key.is_some()
                            && existing.iter().any(|e| value_text(e.get(column)) == key)
                        {
                            return Err(Error::HttpStatus {
                                status: 409,
                                body: format!(
                                    r#"{{"code":"23505","message":"duplicate key value violates unique constraint on {}"}}"#,
                                    column
                                ),
                            });
                        }
                    }
                }
            }

            let mut returned = Vec::new();
            for row in rows {
                let position = if conflict_cols.is_empty() {
                    None
                } else {
                    inner.tables.get(table).and_then(|existing| {
                        existing.iter().position(|e| {
                            conflict_cols.iter().all(|c| {
                                let key = value_text(e.get(c));
                                key.is_some() && key == value_text(row.get(c))
                            })
                        })
                    })
                };
                match (position, &mode.conflict) {
                    (Some(_), Conflict::IgnoreDuplicates { .. }) => {}
                    (Some(pos), _) => {
                        let target = &mut inner.tables.entry(table.to_string()).or_default()[pos];
                        for (k, v) in row {
                            target.insert(k.clone(), v.clone());
                        }
                        returned.push(target.clone());
                    }
                    (None, _) => {
                        let row = assign_identity(inner, table, row.clone());
                        returned.push(row.clone());
                        inner.tables.entry(table.to_string()).or_default().push(row);
                    }
                }
            }
            let affected = returned.len();
            let out = match mode.returning {
                Returning::Minimal => Vec::new(),
                Returning::Representation => returned,
            };
            Ok((out, affected))
        })
    }

    fn do_update(&self, table: &str, filters: &[Filter], patch: &Row) -> Result<(), Error> {
        self.execute(Op::Update, table, filters, 0, |inner| {
            let mut affected = 0;
            if let Some(rows) = inner.tables.get_mut(table) {
                for row in rows.iter_mut().filter(|r| matches_all(r, filters)) {
                    for (k, v) in patch {
                        row.insert(k.clone(), v.clone());
                    }
                    affected += 1;
                }
            }
            Ok(((), affected))
        })
    }

    fn do_delete(&self, table: &str, filters: &[Filter]) -> Result<(), Error> {
        if filters.is_empty() {
            return Err(Error::InvalidUrl(format!(
                "refusing unfiltered delete on {}",
                table
            )));
        }
        self.execute(Op::Delete, table, filters, 0, |inner| {
            let mut affected = 0;
            if let Some(rows) = inner.tables.get_mut(table) {
                let before = rows.len();
                rows.retain(|r| !matches_all(r, filters));
                affected = before - rows.len();
            }
            Ok(((), affected))
        })
    }

    fn do_count(&self, table: &str, filters: &[Filter]) -> Result<u64, Error> {
        self.execute(Op::Count, table, filters, 0, |inner| {
            let n = inner
                .tables
                .get(table)
                .map(|rows| rows.iter().filter(|r| matches_all(r, filters)).count())
                .unwrap_or(0);
            Ok((n as u64, 0))
        })
    }
}

impl BulkStore for MemoryStore {
    fn select(&self, query: &Select) -> impl Future<Output = Result<Vec<Row>, Error>> + Send {
        let result = self.do_select(query);
        async move { result }
    }

    fn insert(
        &self,
        table: &str,
        rows: &[Row],
        mode: &InsertMode,
    ) -> impl Future<Output = Result<Vec<Row>, Error>> + Send {
        let result = self.do_insert(table, rows, mode);
        async move { result }
    }

    fn update(
        &self,
        table: &str,
        filters: &[Filter],
        patch: &Row,
    ) -> impl Future<Output = Result<(), Error>> + Send {
        let result = self.do_update(table, filters, patch);
        async move { result }
    }

    fn delete(
        &self,
        table: &str,
        filters: &[Filter],
    ) -> impl Future<Output = Result<(), Error>> + Send {
        let result = self.do_delete(table, filters);
        async move { result }
    }

    fn count(
        &self,
        table: &str,
        filters: &[Filter],
    ) -> impl Future<Output = Result<u64, Error>> + Send {
        let result = self.do_count(table, filters);
        async move { result }
    }
}

fn assign_identity(inner: &mut Inner, table: &str, mut row: Row) -> Row {
    if let Some((column, next)) = inner.identities.get_mut(table) {
        match row.get(column.as_str()).and_then(Value::as_i64) {
            Some(explicit) => *next = (*next).max(explicit + 1),
            None => {
                row.insert(column.clone(), Value::from(*next));
                *next += 1;
            }
        }
    }
    row
}

fn project(row: Row, columns: &[String]) -> Row {
    if columns.is_empty() || columns.iter().any(|c| c == "*") {
        return row;
    }
    row.into_iter()
        .filter(|(k, _)| columns.contains(k))
        .collect()
}

fn matches_all(row: &Row, filters: &[Filter]) -> bool {
    filters.iter().all(|f| matches(row, f))
}

fn matches(row: &Row, filter: &Filter) -> bool {
    let value = row.get(filter.column());
    match filter {
        Filter::Eq(_, expected) => value_text(value).as_deref() == Some(expected.as_str()),
        Filter::Gt(_, bound) => match (value.and_then(Value::as_f64), bound.parse::<f64>()) {
            (Some(v), Ok(b)) => v > b,
            _ => value_text(value)
                .map(|v| v.as_str() > bound.as_str())
                .unwrap_or(false),
        },
        Filter::In(_, values) => value_text(value)
            .map(|v| values.contains(&v))
            .unwrap_or(false),
        Filter::IsNull(_) => value.map_or(true, Value::is_null),
        Filter::NotNull(_) => !value.map_or(true, Value::is_null),
    }
}

/// Text form used for filter comparisons; `None` for missing or null.
fn value_text(value: Option<&Value>) -> Option<String> {
    match value? {
        Value::Null => None,
        Value::String(s) => Some(s.clone()),
        Value::Bool(b) => Some(b.to_string()),
        Value::Number(n) => Some(match n.as_i64() {
            Some(i) => i.to_string(),
            None => n.as_f64().map(|f| f.to_string()).unwrap_or_default(),
        }),
        other => Some(other.to_string()),
    }
}

/// Numbers numerically, strings lexically, nulls last.
fn compare_values(a: Option<&Value>, b: Option<&Value>) -> Ordering {
    let a = a.filter(|v| !v.is_null());
    let b = b.filter(|v| !v.is_null());
    match (a, b) {
        (None, None) => Ordering::Equal,
        (None, Some(_)) => Ordering::Greater,
        (Some(_), None) => Ordering::Less,
        (Some(a), Some(b)) => match (a.as_f64(), b.as_f64()) {
            (Some(x), Some(y)) => x.partial_cmp(&y).unwrap_or(Ordering::Equal),
            _ => value_text(Some(a)).cmp(&value_text(Some(b))),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn row(v: Value) -> Row {
        v.as_object().cloned().unwrap()
    }

    #[tokio::test]
    async fn identity_and_select_order() {
        let store = MemoryStore::new().with_identity("cf_donations", "donation_id");
        store.seed(
            "cf_donations",
            vec![
                row(json!({"report_id": 2, "donor_name": "B"})),
                row(json!({"report_id": 1, "donor_name": "A"})),
            ],
        );
        let rows = store
            .select(&Select::from("cf_donations").order_desc("donation_id"))
            .await
            .unwrap();
        assert_eq!(rows[0]["donation_id"], json!(2));
        assert_eq!(rows[1]["donation_id"], json!(1));
    }

    #[tokio::test]
    async fn ignore_duplicates_keeps_original() {
        let store = MemoryStore::new();
        store.seed("cf_entities", vec![row(json!({"entity_id": 1, "name": "old"}))]);
        let mode = InsertMode::ignore_duplicates("entity_id");
        store
            .insert("cf_entities", &[row(json!({"entity_id": 1, "name": "new"}))], &mode)
            .await
            .unwrap();
        let rows = store.rows("cf_entities");
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0]["name"], json!("old"));
    }

    #[tokio::test]
    async fn merge_duplicates_returns_existing_identity() {
        let store = MemoryStore::new().with_identity("cf_reports", "report_id");
        let mode = InsertMode::merge_duplicates("pdf_id").returning_rows();
        let first = store
            .insert("cf_reports", &[row(json!({"pdf_id": 10, "rpt_name": "a"}))], &mode)
            .await
            .unwrap();
        let second = store
            .insert("cf_reports", &[row(json!({"pdf_id": 10, "rpt_name": "b"}))], &mode)
            .await
            .unwrap();
        assert_eq!(first[0]["report_id"], second[0]["report_id"]);
        assert_eq!(store.rows("cf_reports").len(), 1);
        assert_eq!(store.rows("cf_reports")[0]["rpt_name"], json!("b"));
    }

    #[tokio::test]
    async fn scripted_failure_fires_once() {
        let store = MemoryStore::new();
        store.fail_next(Op::Insert, "t", Failure::status(503, ""));
        let rows = [row(json!({"a": 1}))];
        assert!(store.insert("t", &rows, &InsertMode::plain()).await.is_err());
        assert!(store.insert("t", &rows, &InsertMode::plain()).await.is_ok());
        let calls = store.calls();
        assert!(calls[0].failed);
        assert!(!calls[1].failed);
    }

    #[tokio::test]
    async fn uri_limit_answers_414() {
        let store = MemoryStore::new().with_uri_limit("cf_entities", 2);
        let err = store
            .select(&Select::from("cf_entities").filter(Filter::in_list("entity_id", &[1, 2, 3])))
            .await
            .unwrap_err();
        assert!(err.is_uri_too_long());
    }

    #[tokio::test]
    async fn unique_column_rejects_plain_duplicate() {
        let store = MemoryStore::new().with_unique("cf_entities", "entity_id");
        store.seed("cf_entities", vec![row(json!({"entity_id": 1}))]);
        let err = store
            .insert("cf_entities", &[row(json!({"entity_id": 1}))], &InsertMode::plain())
            .await
            .unwrap_err();
        assert_eq!(err.status(), Some(409));
    }

    #[tokio::test]
    async fn filters_and_count() {
        let store = MemoryStore::new();
        store.seed(
            "t",
            vec![
                row(json!({"id": 1, "status": "unprocessed", "amt": 5.5})),
                row(json!({"id": 2, "status": "processed", "amt": 0})),
                row(json!({"id": 3, "status": "unprocessed", "amt": null})),
            ],
        );
        let n = store
            .count("t", &[Filter::eq("status", "unprocessed")])
            .await
            .unwrap();
        assert_eq!(n, 2);
        assert_eq!(store.count("t", &[Filter::gt("amt", 0)]).await.unwrap(), 1);
        assert_eq!(store.count("t", &[Filter::is_null("amt")]).await.unwrap(), 1);
        store.delete("t", &[Filter::in_list("id", &[1, 2])]).await.unwrap();
        assert_eq!(store.rows("t").len(), 1);
    }
}
