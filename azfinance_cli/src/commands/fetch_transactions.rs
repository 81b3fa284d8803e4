//! Transaction pipeline: page through each pending committee's itemized
//! transactions and upsert them with their counterparties.

use std::sync::Arc;

use anyhow::{Context, Result};
use azfinance_lib::pipeline::TransactionStrategy;
use azfinance_lib::{Runner, WorkQueue, WorkStatus};
use clap::Args;

use super::{run_with_progress, stop_on_ctrl_c, Services};
use crate::output::{print_json, print_run_table, OutputFormat, RunReport};

#[derive(Args)]
pub struct FetchTransactionsArgs {
    /// Concurrent committees
    #[arg(long, default_value = "4")]
    pub workers: usize,

    /// Stop after this many committees
    #[arg(long)]
    pub limit: Option<usize>,

    /// Only this committee
    #[arg(long)]
    pub entity: Option<i64>,

    /// Transactions requested per page
    #[arg(long, default_value = "500")]
    pub page_length: u32,
}

pub async fn run(args: &FetchTransactionsArgs, format: &OutputFormat) -> Result<()> {
    let services = Services::from_env()?;
    let queue = WorkQueue::entities();

    let mut units = queue
        .fetch(services.store.as_ref(), WorkStatus::Unprocessed, None, None)
        .await
        .context("loading pending committees")?;
    if let Some(entity) = args.entity {
        units.retain(|u| u.id == entity);
        if units.is_empty() {
            eprintln!("Committee {} has no pending fetch", entity);
            return Ok(());
        }
    }
    if let Some(limit) = args.limit {
        units.truncate(limit);
    }

    if units.is_empty() {
        eprintln!("No committees awaiting a transaction fetch");
        return Ok(());
    }
    eprintln!(
        "Fetching transactions for {} committee(s) with {} worker(s)",
        units.len(),
        args.workers
    );

    let strategy = Arc::new(TransactionStrategy::new(
        services.coordinator(),
        services.filings()?,
        args.page_length.max(1),
    ));

    let runner = Runner::new(args.workers);
    stop_on_ctrl_c(&runner);
    let summary = run_with_progress(&runner, strategy, units).await;
    let requests = services.tracker.summary();

    match format {
        OutputFormat::Table => print_run_table(&summary, &requests),
        OutputFormat::Json => print_json(&RunReport {
            command: "fetch-transactions",
            finished_at: chrono::Utc::now().to_rfc3339(),
            run: &summary,
            requests: &requests,
        }),
    }
    Ok(())
}
