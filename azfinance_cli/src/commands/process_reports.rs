//! Report pipeline: download each pending document, extract it with the R
//! wrapper, repair shifted contact fields and upload report plus donations.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use azfinance_lib::normalize::DonorClassifier;
use azfinance_lib::pipeline::ReportStrategy;
use azfinance_lib::{RscriptExtractor, Runner, WorkQueue, WorkStatus};
use clap::Args;

use super::{run_with_progress, stop_on_ctrl_c, Services};
use crate::output::{print_json, print_run_table, OutputFormat, RunReport};

#[derive(Args)]
pub struct ProcessReportsArgs {
    /// Concurrent documents
    #[arg(long, default_value = "4")]
    pub workers: usize,

    /// Stop after this many documents
    #[arg(long)]
    pub limit: Option<usize>,

    /// Only documents belonging to this committee
    #[arg(long)]
    pub entity: Option<i64>,

    /// R wrapper that converts one filing PDF to CSV
    #[arg(long)]
    pub extractor_script: PathBuf,

    /// Interpreter used to run the wrapper script
    #[arg(long, default_value = "Rscript")]
    pub rscript: String,
}

pub async fn run(args: &ProcessReportsArgs, format: &OutputFormat) -> Result<()> {
    if !args.extractor_script.exists() {
        bail!(
            "Extractor script not found: {}",
            args.extractor_script.display()
        );
    }

    let services = Services::from_env()?;
    let queue = WorkQueue::report_pdfs();
    let units = queue
        .fetch(services.store.as_ref(), WorkStatus::Unprocessed, args.entity, args.limit)
        .await
        .context("loading pending documents")?;

    if units.is_empty() {
        eprintln!("No unprocessed documents");
        return Ok(());
    }
    eprintln!(
        "Processing {} document(s) with {} worker(s)",
        units.len(),
        args.workers
    );

    let scratch = tempfile::Builder::new()
        .prefix("azfinance-reports-")
        .tempdir()
        .context("creating scratch directory")?;
    let extractor =
        RscriptExtractor::new(args.extractor_script.clone()).with_program(&args.rscript);
    let classifier = DonorClassifier::from_seed()?;
    let strategy = Arc::new(ReportStrategy::new(
        services.coordinator(),
        services.filings()?,
        extractor,
        classifier,
        scratch.path(),
    ));

    let runner = Runner::new(args.workers);
    stop_on_ctrl_c(&runner);
    let summary = run_with_progress(&runner, strategy, units).await;
    let requests = services.tracker.summary();

    match format {
        OutputFormat::Table => print_run_table(&summary, &requests),
        OutputFormat::Json => print_json(&RunReport {
            command: "process-reports",
            finished_at: chrono::Utc::now().to_rfc3339(),
            run: &summary,
            requests: &requests,
        }),
    }

    if summary.failed > 0 {
        eprintln!(
            "{} document(s) failed and stay unprocessed; rerun to retry them",
            summary.failed
        );
    }
    Ok(())
}
