mod commands;
mod output;

use anyhow::Result;
use clap::{Parser, Subcommand};

use crate::output::OutputFormat;

#[derive(Parser)]
#[command(name = "azfinance")]
#[command(about = "Ingest Arizona campaign-finance filings into the reporting store")]
struct Cli {
    /// Output format: table or json
    #[arg(long, default_value = "table", global = true)]
    output: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Download, extract and upload pending report documents
    ProcessReports(commands::process_reports::ProcessReportsArgs),
    /// Fetch itemized transactions for pending committees
    FetchTransactions(commands::fetch_transactions::FetchTransactionsArgs),
    /// Remove duplicate and orphaned donations and re-flag broken reports
    ///
    /// Run it while no process-reports job is writing: uploads in flight can
    /// be counted as orphans or empty reports.
    Repair(commands::repair::RepairArgs),
    /// Move processed or skipped work units back to unprocessed
    Reset(commands::reset::ResetArgs),
    /// Show work-unit counts per status
    Status(commands::status::StatusArgs),
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("azfinance=info".parse()?)
                .add_directive("azfinance_lib=info".parse()?),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    let format = match cli.output.as_str() {
        "json" => OutputFormat::Json,
        _ => OutputFormat::Table,
    };

    match &cli.command {
        Commands::ProcessReports(args) => commands::process_reports::run(args, &format).await?,
        Commands::FetchTransactions(args) => {
            commands::fetch_transactions::run(args, &format).await?
        }
        Commands::Repair(args) => commands::repair::run(args, &format).await?,
        Commands::Reset(args) => commands::reset::run(args, &format).await?,
        Commands::Status(args) => commands::status::run(args, &format).await?,
    }

    Ok(())
}
