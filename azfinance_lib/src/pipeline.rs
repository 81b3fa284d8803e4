//! Bounded worker pool that runs one strategy per work unit.
//!
//! Every unit is spawned into a `JoinSet`; each task waits on a shared
//! `Semaphore`, checks the shutdown flag, runs the strategy end to end, and
//! sends one [`UnitReport`] over an `mpsc` channel. A single receiver loop owns
//! [`RunStats`], so no counter is shared between workers.

use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use cfstore_api::{Error, Filter, InsertMode};
use serde::Serialize;
use tokio::sync::{mpsc, Semaphore};
use tokio::task::JoinSet;

use crate::error::PipelineError;
use crate::extractor::Extractor;
use crate::filings::{Download, FilingsClient};
use crate::normalize::DonorClassifier;
use crate::report::{shape_report, ReportSource, DONATION_TABLE, REPORT_TABLE};
use crate::store::BulkStore;
use crate::transactions::{shape_transactions, TRANSACTION_KEY, TRANSACTION_TABLE};
use crate::upload::UploadCoordinator;
use crate::work_unit::{WorkQueue, WorkUnit};

/// Terminal result of a unit that did not fail.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum UnitOutcome {
    Processed { rows: usize, total_amount: f64 },
    Skipped { reason: String },
}

/// What a worker sends to the aggregator for one unit.
#[derive(Debug, Clone, PartialEq)]
pub struct UnitReport {
    pub unit_id: i64,
    pub outcome: Result<UnitOutcome, String>,
    pub elapsed: Duration,
}

/// Processes a single unit end to end.
pub trait UnitStrategy: Send + Sync + 'static {
    /// Short noun for log lines ("report", "entity").
    fn label(&self) -> &'static str;

    fn process(
        &self,
        unit: &WorkUnit,
    ) -> impl Future<Output = Result<UnitOutcome, PipelineError>> + Send;

    /// Best-effort note after a failed attempt. The unit stays `unprocessed`.
    fn record_failure(
        &self,
        unit: &WorkUnit,
        error: &PipelineError,
    ) -> impl Future<Output = ()> + Send;
}

/// Counters owned by the aggregator.
#[derive(Debug, Clone)]
pub struct RunStats {
    pub total: usize,
    pub processed: usize,
    pub skipped: usize,
    pub failed: usize,
    pub rows: usize,
    pub amount: f64,
    pub started: Instant,
}

impl RunStats {
    pub fn new(total: usize) -> Self {
        Self {
            total,
            processed: 0,
            skipped: 0,
            failed: 0,
            rows: 0,
            amount: 0.0,
            started: Instant::now(),
        }
    }

    pub fn finished(&self) -> usize {
        self.processed + self.skipped + self.failed
    }

    /// Units that never started, because of shutdown.
    pub fn not_started(&self) -> usize {
        self.total.saturating_sub(self.finished())
    }

    /// Finished units per second.
    pub fn rate(&self) -> f64 {
        let secs = self.started.elapsed().as_secs_f64();
        if secs <= 0.0 {
            return 0.0;
        }
        self.finished() as f64 / secs
    }

    pub fn eta(&self) -> Option<Duration> {
        let rate = self.rate();
        if rate <= 0.0 {
            return None;
        }
        let remaining = self.total.saturating_sub(self.finished()) as f64;
        Some(Duration::from_secs_f64(remaining / rate))
    }

    fn record(&mut self, report: &UnitReport) {
        match &report.outcome {
            Ok(UnitOutcome::Processed { rows, total_amount }) => {
                self.processed += 1;
                self.rows += rows;
                self.amount += total_amount;
            }
            Ok(UnitOutcome::Skipped { .. }) => self.skipped += 1,
            Err(_) => self.failed += 1,
        }
    }

    pub fn summary(&self) -> RunSummary {
        RunSummary {
            total: self.total,
            processed: self.processed,
            skipped: self.skipped,
            failed: self.failed,
            not_started: self.not_started(),
            rows: self.rows,
            amount: self.amount,
            elapsed_secs: self.started.elapsed().as_secs_f64(),
            rate_per_sec: self.rate(),
        }
    }
}

/// Serializable end-of-run snapshot.
#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub total: usize,
    pub processed: usize,
    pub skipped: usize,
    pub failed: usize,
    pub not_started: usize,
    pub rows: usize,
    pub amount: f64,
    pub elapsed_secs: f64,
    pub rate_per_sec: f64,
}

/// Worker pool configuration plus the shutdown flag.
#[derive(Debug, Clone)]
pub struct Runner {
    workers: usize,
    shutdown: Arc<AtomicBool>,
}

impl Runner {
    pub fn new(workers: usize) -> Self {
        Self {
            workers: workers.max(1),
            shutdown: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Flag that stops dispatch when set. Units already running finish.
    pub fn shutdown_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.shutdown)
    }

    pub fn workers(&self) -> usize {
        self.workers
    }

    /// Runs `strategy` over every unit. Per-unit failures never abort the run.
    pub async fn run<T, F>(
        &self,
        strategy: Arc<T>,
        units: Vec<WorkUnit>,
        mut on_report: F,
    ) -> RunStats
    where
        T: UnitStrategy,
        F: FnMut(&UnitReport, &RunStats),
    {
        let mut stats = RunStats::new(units.len());
        let semaphore = Arc::new(Semaphore::new(self.workers));
        let (tx, mut rx) = mpsc::channel::<UnitReport>(self.workers * 2);
        let mut join_set = JoinSet::new();

        for unit in units {
            let sem = Arc::clone(&semaphore);
            let sender = tx.clone();
            let strategy = Arc::clone(&strategy);
            let shutdown = Arc::clone(&self.shutdown);

            join_set.spawn(async move {
                let Ok(_permit) = sem.acquire().await else {
                    return;
                };
                if shutdown.load(Ordering::SeqCst) {
                    return;
                }
                let started = Instant::now();
                let outcome = match strategy.process(&unit).await {
                    Ok(outcome) => Ok(outcome),
                    Err(e) => {
                        tracing::error!("{} {} failed: {}", strategy.label(), unit.id, e);
                        strategy.record_failure(&unit, &e).await;
                        Err(e.to_string())
                    }
                };
                let _ = sender
                    .send(UnitReport {
                        unit_id: unit.id,
                        outcome,
                        elapsed: started.elapsed(),
                    })
                    .await;
            });
        }
        drop(tx);

        while let Some(report) = rx.recv().await {
            stats.record(&report);
            on_report(&report, &stats);
        }

        while let Some(joined) = join_set.join_next().await {
            if let Err(e) = joined {
                if e.is_panic() {
                    tracing::error!("{} worker panicked: {}", strategy.label(), e);
                    stats.failed += 1;
                }
            }
        }

        if self.shutdown.load(Ordering::SeqCst) && stats.not_started() > 0 {
            tracing::warn!(
                "shutdown requested: {} {} units not started",
                stats.not_started(),
                strategy.label()
            );
        }
        stats
    }
}

/// Downloads a filing, extracts it, repairs and shapes it, and uploads the
/// report with its donations.
pub struct ReportStrategy<S, E> {
    coordinator: UploadCoordinator<S>,
    filings: FilingsClient,
    extractor: E,
    classifier: DonorClassifier,
    work_dir: PathBuf,
    queue: WorkQueue,
}

impl<S: BulkStore + 'static, E: Extractor + 'static> ReportStrategy<S, E> {
    pub fn new(
        coordinator: UploadCoordinator<S>,
        filings: FilingsClient,
        extractor: E,
        classifier: DonorClassifier,
        work_dir: &Path,
    ) -> Self {
        Self {
            coordinator,
            filings,
            extractor,
            classifier,
            work_dir: work_dir.to_path_buf(),
            queue: WorkQueue::report_pdfs(),
        }
    }

    async fn process_unit(&self, unit: &WorkUnit) -> Result<UnitOutcome, PipelineError> {
        let url = unit.text("pdf_url");
        if url.is_empty() {
            return Err(PipelineError::InvalidData(format!(
                "document {} has no pdf_url",
                unit.id
            )));
        }
        let entity_id = unit.parent_id.ok_or_else(|| {
            PipelineError::InvalidData(format!("document {} has no entity_id", unit.id))
        })?;

        // Removed with everything in it when the unit finishes, on any path.
        let scratch = tempfile::Builder::new()
            .prefix(&format!("doc-{}-", unit.id))
            .tempdir_in(&self.work_dir)?;
        let pdf = scratch.path().join(format!("{}.pdf", unit.id));
        let csv = scratch.path().join(format!("{}.csv", unit.id));

        if let Download::NotFiled = self.filings.download_document(url, &pdf).await? {
            let reason = "report not filed (404)";
            self.queue
                .mark_skipped(self.coordinator.store(), unit.id, reason)
                .await?;
            tracing::info!("document {} skipped: {}", unit.id, reason);
            return Ok(UnitOutcome::Skipped {
                reason: reason.to_string(),
            });
        }

        let table = self.extractor.extract(&pdf, &csv).await?;
        let shaped = shape_report(
            &table,
            ReportSource {
                pdf_id: unit.id,
                entity_id,
                report_name: unit.text("report_name"),
            },
            &self.classifier,
        );
        if shaped.was_shifted {
            tracing::info!("document {}: repaired shifted contact fields", unit.id);
        }

        let report_id = self
            .coordinator
            .upsert_parent(REPORT_TABLE, &shaped.report.to_row(), "pdf_id", "report_id")
            .await?;

        // Donations have no natural key; replace the report's set wholesale.
        let filters = [Filter::eq("report_id", report_id)];
        let store = self.coordinator.store();
        self.coordinator
            .retry()
            .run(
                &format!("clear donations of report {}", report_id),
                self.coordinator.tracker(),
                Error::is_retryable,
                || store.delete(DONATION_TABLE, &filters),
            )
            .await?;

        let mut donations = shaped.donations;
        for d in &mut donations {
            d.report_id = Some(report_id);
        }
        let total: f64 = donations.iter().map(|d| d.donation_amt).sum();
        let rows = self
            .coordinator
            .upload(
                &self.queue,
                unit.id,
                DONATION_TABLE,
                &donations,
                &InsertMode::plain(),
            )
            .await?;
        Ok(UnitOutcome::Processed {
            rows,
            total_amount: total,
        })
    }
}

impl<S: BulkStore + 'static, E: Extractor + 'static> UnitStrategy for ReportStrategy<S, E> {
    fn label(&self) -> &'static str {
        "document"
    }

    fn process(
        &self,
        unit: &WorkUnit,
    ) -> impl Future<Output = Result<UnitOutcome, PipelineError>> + Send {
        self.process_unit(unit)
    }

    fn record_failure(
        &self,
        unit: &WorkUnit,
        error: &PipelineError,
    ) -> impl Future<Output = ()> + Send {
        note_failure(self.coordinator.store(), &self.queue, unit.id, error.to_string())
    }
}

/// Fetches a committee's transactions and upserts them with their lookups
/// and counterparty entities.
pub struct TransactionStrategy<S> {
    coordinator: UploadCoordinator<S>,
    filings: FilingsClient,
    page_length: u32,
    queue: WorkQueue,
}

impl<S: BulkStore + 'static> TransactionStrategy<S> {
    pub fn new(
        coordinator: UploadCoordinator<S>,
        filings: FilingsClient,
        page_length: u32,
    ) -> Self {
        Self {
            coordinator,
            filings,
            page_length,
            queue: WorkQueue::entities(),
        }
    }

    async fn process_unit(&self, unit: &WorkUnit) -> Result<UnitOutcome, PipelineError> {
        let raw = self
            .filings
            .fetch_all_transactions(unit.id, self.page_length)
            .await?;
        let shaped = shape_transactions(raw, unit.id);
        if shaped.dropped > 0 {
            tracing::warn!(
                "entity {}: dropped {} unshapeable transactions",
                unit.id,
                shaped.dropped
            );
        }

        for (table, key, rows) in shaped.lookups.tables() {
            if let Err(e) = self
                .coordinator
                .insert_rows(table, &rows, &InsertMode::merge_duplicates(key))
                .await
            {
                tracing::warn!("entity {}: lookup upsert into {} failed: {}", unit.id, table, e);
            }
        }

        let total: f64 = shaped.rows.iter().map(|r| r.amount).sum();
        let rows = self
            .coordinator
            .upload(
                &self.queue,
                unit.id,
                TRANSACTION_TABLE,
                &shaped.rows,
                &InsertMode::merge_duplicates(TRANSACTION_KEY),
            )
            .await?;
        Ok(UnitOutcome::Processed {
            rows,
            total_amount: total,
        })
    }
}

impl<S: BulkStore + 'static> UnitStrategy for TransactionStrategy<S> {
    fn label(&self) -> &'static str {
        "entity"
    }

    fn process(
        &self,
        unit: &WorkUnit,
    ) -> impl Future<Output = Result<UnitOutcome, PipelineError>> + Send {
        self.process_unit(unit)
    }

    fn record_failure(
        &self,
        unit: &WorkUnit,
        error: &PipelineError,
    ) -> impl Future<Output = ()> + Send {
        note_failure(self.coordinator.store(), &self.queue, unit.id, error.to_string())
    }
}

async fn note_failure<S: BulkStore>(store: &S, queue: &WorkQueue, id: i64, error: String) {
    if let Err(e) = queue.note_failure(store, id, &error).await {
        tracing::warn!("could not record failure on {} {}: {}", queue.table, id, e);
    }
}
