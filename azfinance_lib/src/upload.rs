//! Idempotent upload coordinator.
//!
//! Writes one unit's rows in three ordered phases:
//!
//! 1. pre-create every referenced counterparty entity (stub rows, ignore-duplicates),
//! 2. insert the dependent rows in chunks, each chunk under the retry policy,
//! 3. mark the work unit `processed`, only after every chunk succeeded.
//!
//! A failure in phase 1 means no dependent row is written. A failure in phase 2
//! leaves earlier chunks in place; the consistency pass cleans those up.

use std::collections::btree_map::Entry;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use cfstore_api::{Error, Filter, InsertMode, Row, Select};
use dashmap::DashSet;
use serde_json::{json, Value};

use crate::config::UploadConfig;
use crate::error::PipelineError;
use crate::normalize::{Counterparty, MULTIPLE_CONTRIBUTORS_ID};
use crate::retry::{RequestTracker, RetryPolicy};
use crate::store::{row_i64, BulkStore};
use crate::work_unit::WorkQueue;

/// Counterparty entity table referenced by transaction rows.
pub const ENTITY_TABLE: &str = "cf_transaction_entities";

const SAMPLE_LEN: usize = 300;

/// A counterparty that must exist before rows referencing it are written.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReferencedEntity {
    pub entity_id: i64,
    pub entity_name: String,
    pub first_name: Option<String>,
    pub middle_name: Option<String>,
    pub last_name: Option<String>,
    pub entity_type_id: Option<i64>,
    pub group_number: Option<i64>,
    pub group_id: Option<i64>,
}

impl ReferencedEntity {
    /// Minimal entity known only by id.
    pub fn stub(entity_id: i64) -> Self {
        Self {
            entity_id,
            entity_name: format!("Entity {}", entity_id),
            first_name: None,
            middle_name: None,
            last_name: None,
            entity_type_id: None,
            group_number: None,
            group_id: None,
        }
    }

    pub fn to_row(&self) -> Row {
        let value = json!({
            "entity_id": self.entity_id,
            "entity_name": self.entity_name,
            "first_name": self.first_name,
            "middle_name": self.middle_name,
            "last_name": self.last_name,
            "entity_type_id": self.entity_type_id,
            "group_number": self.group_number,
            "group_id": self.group_id,
        });
        match value {
            Value::Object(map) => map,
            _ => Row::new(),
        }
    }

    /// Folds a later sighting of the same counterparty into this one.
    ///
    /// Keeps the better name (full name over last name over placeholder) and
    /// fills any field still missing.
    pub fn merge(&mut self, other: &ReferencedEntity) {
        if other.name_rank() > self.name_rank() {
            self.entity_name = other.entity_name.clone();
        }
        fill(&mut self.first_name, &other.first_name);
        fill(&mut self.middle_name, &other.middle_name);
        fill(&mut self.last_name, &other.last_name);
        fill(&mut self.entity_type_id, &other.entity_type_id);
        fill(&mut self.group_number, &other.group_number);
        fill(&mut self.group_id, &other.group_id);
    }

    fn name_rank(&self) -> u8 {
        let name = self.entity_name.trim();
        if name.is_empty() || name == format!("Entity {}", self.entity_id) {
            0
        } else if self.last_name.as_deref().map(str::trim) == Some(name) {
            1
        } else {
            2
        }
    }
}

fn fill<T: Clone>(slot: &mut Option<T>, other: &Option<T>) {
    if slot.is_none() {
        slot.clone_from(other);
    }
}

impl From<&Counterparty> for ReferencedEntity {
    fn from(cp: &Counterparty) -> Self {
        let name = cp.display_name();
        Self {
            entity_id: cp.entity_id,
            entity_name: if name.is_empty() {
                format!("Entity {}", cp.entity_id)
            } else {
                name
            },
            first_name: cp.first_name.clone(),
            middle_name: cp.middle_name.clone(),
            last_name: cp.last_name.clone(),
            entity_type_id: cp.entity_type_id,
            group_number: cp.group_number,
            group_id: cp.group_id,
        }
    }
}

/// A row the coordinator can write.
pub trait UploadRow {
    fn to_row(&self) -> Row;

    /// The counterparty this row points at, if any.
    fn referenced_entity(&self) -> Option<ReferencedEntity> {
        None
    }

    /// Contribution to the unit's `total_amount`.
    fn amount(&self) -> f64 {
        0.0
    }
}

impl UploadRow for Row {
    fn to_row(&self) -> Row {
        self.clone()
    }
}

/// Outcome of a successful pre-creation step.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PrecreateSummary {
    /// Distinct ids considered after dropping the aggregate sentinel.
    pub referenced: usize,
    /// Ids already confirmed earlier in this process.
    pub cached: usize,
    /// Stub rows sent.
    pub created: usize,
}

/// Coordinates ordered, chunked, retried writes for one store.
pub struct UploadCoordinator<S> {
    store: Arc<S>,
    config: UploadConfig,
    retry: RetryPolicy,
    tracker: Arc<RequestTracker>,
    /// Entity ids confirmed to exist, shared by every worker.
    known: Arc<DashSet<i64>>,
}

impl<S> Clone for UploadCoordinator<S> {
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
            config: self.config,
            retry: self.retry,
            tracker: Arc::clone(&self.tracker),
            known: Arc::clone(&self.known),
        }
    }
}

impl<S: BulkStore> UploadCoordinator<S> {
    pub fn new(
        store: Arc<S>,
        config: UploadConfig,
        retry: RetryPolicy,
        tracker: Arc<RequestTracker>,
    ) -> Self {
        Self {
            store,
            config,
            retry,
            tracker,
            known: Arc::new(DashSet::new()),
        }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn retry(&self) -> &RetryPolicy {
        &self.retry
    }

    pub fn tracker(&self) -> &RequestTracker {
        &self.tracker
    }

    /// Ensures every referenced entity exists. Runs as one retried step; on
    /// failure nothing dependent may be written.
    pub async fn precreate_entities(
        &self,
        entities: &[ReferencedEntity],
    ) -> Result<PrecreateSummary, PipelineError> {
        let mut merged: BTreeMap<i64, ReferencedEntity> = BTreeMap::new();
        for entity in entities {
            if entity.entity_id == MULTIPLE_CONTRIBUTORS_ID {
                continue;
            }
            match merged.entry(entity.entity_id) {
                Entry::Vacant(slot) => {
                    slot.insert(entity.clone());
                }
                Entry::Occupied(mut slot) => slot.get_mut().merge(entity),
            }
        }

        let mut pending = Vec::new();
        let mut summary = PrecreateSummary::default();
        for (id, entity) in merged {
            summary.referenced += 1;
            if self.known.contains(&id) {
                summary.cached += 1;
            } else {
                pending.push(entity);
            }
        }
        if pending.is_empty() {
            return Ok(summary);
        }

        let label = format!("pre-create {} entities", pending.len());
        summary.created = self
            .retry
            .run(&label, &self.tracker, Error::is_retryable, || {
                self.precreate_once(&pending)
            })
            .await
            .map_err(PipelineError::EntityPrecreate)?;

        for entity in &pending {
            self.known.insert(entity.entity_id);
        }
        Ok(summary)
    }

    async fn precreate_once(&self, pending: &[ReferencedEntity]) -> Result<usize, Error> {
        let ids: Vec<i64> = pending.iter().map(|e| e.entity_id).collect();
        let mut existing = BTreeSet::new();
        for chunk in ids.chunks(self.config.entity_check_chunk.max(1)) {
            existing.extend(self.existing_ids(chunk).await?);
        }

        let stubs: Vec<Row> = pending
            .iter()
            .filter(|e| !existing.contains(&e.entity_id))
            .map(ReferencedEntity::to_row)
            .collect();
        if stubs.is_empty() {
            return Ok(0);
        }
        tracing::debug!("creating {} stub entities", stubs.len());
        let mode = InsertMode::ignore_duplicates("entity_id");
        for chunk in stubs.chunks(self.config.entity_insert_chunk.max(1)) {
            self.store.insert(ENTITY_TABLE, chunk, &mode).await?;
        }
        Ok(stubs.len())
    }

    /// Ids from `chunk` already in the entity table. A 414 on the list query
    /// falls back to one lookup per id.
    async fn existing_ids(&self, chunk: &[i64]) -> Result<Vec<i64>, Error> {
        let query = Select::from(ENTITY_TABLE)
            .columns(&["entity_id"])
            .filter(Filter::in_list("entity_id", chunk));
        match self.store.select(&query).await {
            Ok(rows) => Ok(rows.iter().filter_map(|r| row_i64(r, "entity_id")).collect()),
            Err(e) if e.is_uri_too_long() => {
                tracing::warn!(
                    "existence check for {} ids hit 414, checking one at a time",
                    chunk.len()
                );
                let mut found = Vec::new();
                for id in chunk {
                    let query = Select::from(ENTITY_TABLE)
                        .columns(&["entity_id"])
                        .filter(Filter::eq("entity_id", id))
                        .limit(1);
                    if !self.store.select(&query).await?.is_empty() {
                        found.push(*id);
                    }
                }
                Ok(found)
            }
            Err(e) => Err(e),
        }
    }

    /// Writes `rows` in chunks of `row_chunk`. Returns the number of rows sent.
    pub async fn insert_rows(
        &self,
        table: &str,
        rows: &[Row],
        mode: &InsertMode,
    ) -> Result<usize, PipelineError> {
        let chunk_size = self.config.row_chunk.max(1);
        let total_chunks = rows.len().div_ceil(chunk_size);
        for (i, chunk) in rows.chunks(chunk_size).enumerate() {
            let label = format!("{} chunk {}/{}", table, i + 1, total_chunks);
            self.retry
                .run(&label, &self.tracker, Error::is_retryable, || {
                    self.store.insert(table, chunk, mode)
                })
                .await
                .map_err(|source| PipelineError::ChunkFailed {
                    table: table.to_string(),
                    chunk: i + 1,
                    sample: payload_sample(chunk),
                    source,
                })?;
        }
        Ok(rows.len())
    }

    /// Upserts a single parent row and returns the value of `id_column` the
    /// store assigned (or already had).
    pub async fn upsert_parent(
        &self,
        table: &str,
        row: &Row,
        conflict_column: &str,
        id_column: &str,
    ) -> Result<i64, PipelineError> {
        let mode = InsertMode::merge_duplicates(conflict_column).returning_rows();
        let rows = std::slice::from_ref(row);
        let label = format!("upsert {}", table);
        let returned = self
            .retry
            .run(&label, &self.tracker, Error::is_retryable, || {
                self.store.insert(table, rows, &mode)
            })
            .await?;
        returned
            .first()
            .and_then(|r| row_i64(r, id_column))
            .ok_or_else(|| {
                PipelineError::InvalidData(format!(
                    "{} upsert returned no {}",
                    table, id_column
                ))
            })
    }

    /// Terminal success for a unit.
    pub async fn complete(
        &self,
        queue: &WorkQueue,
        unit_id: i64,
        row_count: usize,
        total_amount: f64,
    ) -> Result<(), PipelineError> {
        let label = format!("mark {} {} processed", queue.table, unit_id);
        self.retry
            .run(&label, &self.tracker, Error::is_retryable, || {
                queue.mark_processed(self.store.as_ref(), unit_id, row_count, total_amount)
            })
            .await?;
        Ok(())
    }

    /// All three phases for one unit's rows.
    pub async fn upload<R: UploadRow>(
        &self,
        queue: &WorkQueue,
        unit_id: i64,
        table: &str,
        rows: &[R],
        mode: &InsertMode,
    ) -> Result<usize, PipelineError> {
        let entities: Vec<ReferencedEntity> =
            rows.iter().filter_map(UploadRow::referenced_entity).collect();
        if !entities.is_empty() {
            self.precreate_entities(&entities).await?;
        }
        let payload: Vec<Row> = rows.iter().map(UploadRow::to_row).collect();
        let written = self.insert_rows(table, &payload, mode).await?;
        let total: f64 = rows.iter().map(UploadRow::amount).sum();
        self.complete(queue, unit_id, written, total).await?;
        Ok(written)
    }
}

fn payload_sample(chunk: &[Row]) -> String {
    let text = chunk
        .first()
        .and_then(|r| serde_json::to_string(r).ok())
        .unwrap_or_default();
    if text.len() <= SAMPLE_LEN {
        return text;
    }
    let mut end = SAMPLE_LEN;
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}...", &text[..end])
}
