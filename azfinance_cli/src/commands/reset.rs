use anyhow::{bail, Context, Result};
use azfinance_lib::WorkStatus;
use clap::Args;

use super::{QueueKind, Services};
use crate::output::{print_json, OutputFormat};

#[derive(Args)]
pub struct ResetArgs {
    /// Queue to reset
    #[arg(long, value_enum, default_value = "reports")]
    pub queue: QueueKind,

    /// Status to move back to unprocessed: processed or skipped
    #[arg(long)]
    pub from: WorkStatus,

    /// Only units belonging to this committee (reports queue only)
    #[arg(long)]
    pub entity: Option<i64>,
}

pub async fn run(args: &ResetArgs, format: &OutputFormat) -> Result<()> {
    if args.from == WorkStatus::Unprocessed {
        bail!("--from must be processed or skipped");
    }
    if args.entity.is_some() && args.queue == QueueKind::Entities {
        bail!("--entity only applies to the reports queue");
    }

    let services = Services::from_env()?;
    let queue = args.queue.queue();
    let moved = queue
        .reset(services.store.as_ref(), args.from, args.entity)
        .await
        .with_context(|| format!("resetting {} units in {}", args.from, queue.table))?;

    match format {
        OutputFormat::Table => eprintln!(
            "Moved {} {} unit(s) in {} back to unprocessed",
            moved, args.from, queue.table
        ),
        OutputFormat::Json => print_json(&serde_json::json!({
            "queue": queue.table,
            "from": args.from,
            "reset": moved,
        })),
    }
    Ok(())
}
