//! CLI subcommand implementations.

pub mod fetch_transactions;
pub mod process_reports;
pub mod repair;
pub mod reset;
pub mod status;

use std::sync::atomic::Ordering;
use std::sync::Arc;

use anyhow::{Context, Result};
use azfinance_lib::cfstore_api::Client;
use azfinance_lib::pipeline::RunSummary;
use azfinance_lib::{
    FilingsClient, RequestTracker, RetryPolicy, Runner, RunStats, StoreConfig, UnitStrategy,
    UploadConfig, UploadCoordinator, WorkQueue, WorkUnit,
};
use clap::ValueEnum;
use indicatif::{ProgressBar, ProgressStyle};

/// Which work-unit queue a maintenance command targets.
#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
pub enum QueueKind {
    /// Report documents (cf_report_pdfs)
    Reports,
    /// Committees awaiting a transaction fetch (cf_entities)
    Entities,
}

impl QueueKind {
    pub fn queue(self) -> WorkQueue {
        match self {
            Self::Reports => WorkQueue::report_pdfs(),
            Self::Entities => WorkQueue::entities(),
        }
    }
}

/// Store client and retry state shared by one command run.
pub struct Services {
    pub store: Arc<Client>,
    pub retry: RetryPolicy,
    pub tracker: Arc<RequestTracker>,
}

impl Services {
    pub fn from_env() -> Result<Self> {
        let config = StoreConfig::from_env()?;
        let store = config
            .client()
            .with_context(|| format!("connecting to store at {}", config.url))?;
        Ok(Self {
            store: Arc::new(store),
            retry: RetryPolicy::from_env(),
            tracker: Arc::new(RequestTracker::new()),
        })
    }

    pub fn coordinator(&self) -> UploadCoordinator<Client> {
        UploadCoordinator::new(
            Arc::clone(&self.store),
            UploadConfig::from_env(),
            self.retry,
            Arc::clone(&self.tracker),
        )
    }

    pub fn filings(&self) -> Result<FilingsClient> {
        let url = azfinance_lib::config::filings_url();
        FilingsClient::new(&url, self.retry, Arc::clone(&self.tracker))
            .with_context(|| format!("building filing-source client for {}", url))
    }
}

/// Sets the runner's shutdown flag on the first Ctrl-C.
pub fn stop_on_ctrl_c(runner: &Runner) {
    let flag = runner.shutdown_flag();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            eprintln!("Shutdown requested; finishing units already in flight");
            flag.store(true, Ordering::SeqCst);
        }
    });
}

/// Runs the pool with a progress bar fed by the aggregator callback.
pub async fn run_with_progress<T: UnitStrategy>(
    runner: &Runner,
    strategy: Arc<T>,
    units: Vec<WorkUnit>,
) -> RunSummary {
    let pb = ProgressBar::new(units.len() as u64);
    let template = "[{elapsed_precise}] {bar:40.cyan/blue} {pos:>7}/{len:7} {msg}";
    if let Ok(style) = ProgressStyle::with_template(template) {
        pb.set_style(style);
    }
    pb.set_message(format!("{} workers", runner.workers()));

    let stats = runner
        .run(strategy, units, |report, stats| {
            if let Err(e) = &report.outcome {
                pb.println(format!("  Failed {}: {}", report.unit_id, e));
            }
            pb.set_message(progress_message(stats));
            pb.inc(1);
        })
        .await;

    pb.finish_with_message(format!(
        "{} processed, {} skipped, {} failed",
        stats.processed, stats.skipped, stats.failed
    ));
    stats.summary()
}

fn progress_message(stats: &RunStats) -> String {
    let eta = stats
        .eta()
        .map(|d| format!("{}s", d.as_secs()))
        .unwrap_or_else(|| "-".to_string());
    format!(
        "ok {} skip {} fail {} | {} rows | {:.2}/s | eta {}",
        stats.processed,
        stats.skipped,
        stats.failed,
        stats.rows,
        stats.rate(),
        eta
    )
}
