use anyhow::{Context, Result};
use clap::Args;

use super::{QueueKind, Services};
use crate::output::{print_status_json, print_status_table, OutputFormat};

#[derive(Args)]
pub struct StatusArgs {
    /// Restrict to one queue; both are shown by default
    #[arg(long, value_enum)]
    pub queue: Option<QueueKind>,

    /// Only units belonging to this committee (reports queue only)
    #[arg(long)]
    pub entity: Option<i64>,
}

pub async fn run(args: &StatusArgs, format: &OutputFormat) -> Result<()> {
    let services = Services::from_env()?;
    let kinds = match args.queue {
        Some(kind) => vec![kind],
        None => vec![QueueKind::Reports, QueueKind::Entities],
    };

    let mut counts = Vec::with_capacity(kinds.len());
    for kind in kinds {
        let queue = kind.queue();
        let parent = queue.parent_column.as_ref().and(args.entity);
        let c = queue
            .counts(services.store.as_ref(), parent)
            .await
            .with_context(|| format!("counting {}", queue.table))?;
        counts.push((queue.table, c));
    }

    match format {
        OutputFormat::Table => print_status_table(&counts),
        OutputFormat::Json => print_status_json(&counts),
    }
    Ok(())
}
