use anyhow::{Context, Result};
use azfinance_lib::{repair, RepairOptions};
use clap::Args;

use super::Services;
use crate::output::{print_json, print_repair_table, OutputFormat};

#[derive(Args)]
pub struct RepairArgs {
    /// Report what would change without writing
    #[arg(long)]
    pub dry_run: bool,

    /// Also re-flag documents whose stored report still has shifted contact fields
    #[arg(long)]
    pub reflag_shifted: bool,
}

pub async fn run(args: &RepairArgs, format: &OutputFormat) -> Result<()> {
    let services = Services::from_env()?;
    let options = RepairOptions {
        dry_run: args.dry_run,
        reflag_shifted: args.reflag_shifted,
    };

    let summary = repair::run(services.store.as_ref(), options)
        .await
        .context("consistency repair failed")?;

    match format {
        OutputFormat::Table => print_repair_table(&summary),
        OutputFormat::Json => print_json(&summary),
    }

    if summary.dry_run && !summary.is_clean() {
        eprintln!("Dry run: nothing was written. Rerun without --dry-run to apply.");
    } else if summary.is_clean() {
        eprintln!("Store is consistent");
    }
    Ok(())
}
