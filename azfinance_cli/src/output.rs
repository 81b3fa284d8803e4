use azfinance_lib::pipeline::RunSummary;
use azfinance_lib::work_unit::StatusCounts;
use azfinance_lib::{RepairSummary, TrackerSummary};
use serde::Serialize;
use tabled::settings::Style;
use tabled::{Table, Tabled};

#[derive(Clone, Debug)]
pub enum OutputFormat {
    Table,
    Json,
}

#[derive(Tabled, Serialize)]
struct StatusRow {
    #[tabled(rename = "Queue")]
    #[serde(rename = "Queue")]
    queue: String,
    #[tabled(rename = "Unprocessed")]
    #[serde(rename = "Unprocessed")]
    unprocessed: u64,
    #[tabled(rename = "Processed")]
    #[serde(rename = "Processed")]
    processed: u64,
    #[tabled(rename = "Skipped")]
    #[serde(rename = "Skipped")]
    skipped: u64,
    #[tabled(rename = "Failed Attempts")]
    #[serde(rename = "Failed Attempts")]
    failed_attempts: u64,
    #[tabled(rename = "Total")]
    #[serde(rename = "Total")]
    total: u64,
}

#[derive(Tabled)]
struct MetricRow {
    #[tabled(rename = "Metric")]
    metric: &'static str,
    #[tabled(rename = "Value")]
    value: String,
}

/// Run summary plus request counters, as printed with `--output json`.
#[derive(Serialize)]
pub struct RunReport<'a> {
    pub command: &'a str,
    pub finished_at: String,
    pub run: &'a RunSummary,
    pub requests: &'a TrackerSummary,
}

fn build_status_rows(counts: &[(String, StatusCounts)]) -> Vec<StatusRow> {
    counts
        .iter()
        .map(|(queue, c)| StatusRow {
            queue: queue.clone(),
            unprocessed: c.unprocessed,
            processed: c.processed,
            skipped: c.skipped,
            failed_attempts: c.failed_attempts,
            total: c.total(),
        })
        .collect()
}

fn metric(metric: &'static str, value: impl ToString) -> MetricRow {
    MetricRow {
        metric,
        value: value.to_string(),
    }
}

fn build_run_rows(run: &RunSummary, requests: &TrackerSummary) -> Vec<MetricRow> {
    vec![
        metric("Units", run.total),
        metric("Processed", run.processed),
        metric("Skipped", run.skipped),
        metric("Failed", run.failed),
        metric("Not started", run.not_started),
        metric("Rows written", run.rows),
        metric("Amount", format_amount(run.amount)),
        metric("Elapsed", format!("{:.1}s", run.elapsed_secs)),
        metric("Rate", format!("{:.2} units/s", run.rate_per_sec)),
        metric("Requests", requests.requests_made),
        metric("Retried", requests.requests_retried),
        metric("Backoff", format!("{:.1}s", requests.total_backoff_secs)),
    ]
}

fn build_repair_rows(summary: &RepairSummary) -> Vec<MetricRow> {
    let verb = if summary.dry_run { "would delete" } else { "deleted" };
    vec![
        metric("Reports scanned", summary.reports_scanned),
        metric("Donations scanned", summary.donations_scanned),
        metric("Duplicate groups", summary.duplicate_groups),
        metric("Duplicates", format!("{} ({})", summary.duplicates_deleted, verb)),
        metric("Orphans", format!("{} ({})", summary.orphans_deleted, verb)),
        metric("Empty reports", summary.empty_reports),
        metric("Shifted reports", summary.shifted_reports),
        metric("Documents re-flagged", summary.documents_reflagged),
        metric("Invalid states", summary.invalid_states),
    ]
}

pub fn print_status_table(counts: &[(String, StatusCounts)]) {
    let mut table = Table::new(build_status_rows(counts));
    table.with(Style::rounded());
    println!("{}", table);
}

pub fn print_status_json(counts: &[(String, StatusCounts)]) {
    print_json(&build_status_rows(counts));
}

pub fn print_run_table(run: &RunSummary, requests: &TrackerSummary) {
    let mut table = Table::new(build_run_rows(run, requests));
    table.with(Style::rounded());
    println!("{}", table);
}

pub fn print_repair_table(summary: &RepairSummary) {
    let mut table = Table::new(build_repair_rows(summary));
    table.with(Style::rounded());
    println!("{}", table);
}

pub fn print_json<T: serde::Serialize>(data: &T) {
    match serde_json::to_string_pretty(data) {
        Ok(json) => println!("{}", json),
        Err(e) => eprintln!("Failed to serialize to JSON: {}", e),
    }
}

fn format_amount(value: f64) -> String {
    if value >= 1_000_000.0 {
        format!("${:.1}M", value / 1_000_000.0)
    } else if value >= 1_000.0 {
        format!("${:.1}K", value / 1_000.0)
    } else {
        format!("${:.2}", value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn counts() -> Vec<(String, StatusCounts)> {
        vec![(
            "cf_report_pdfs".to_string(),
            StatusCounts {
                unprocessed: 4,
                processed: 10,
                skipped: 2,
                failed_attempts: 1,
            },
        )]
    }

    #[test]
    fn test_format_amount() {
        assert_eq!(format_amount(2_500_000.0), "$2.5M");
        assert_eq!(format_amount(1_500.0), "$1.5K");
        assert_eq!(format_amount(99.5), "$99.50");
        assert_eq!(format_amount(0.0), "$0.00");
    }

    #[test]
    fn test_status_rows_total() {
        let rows = build_status_rows(&counts());
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].total, 16);
        assert_eq!(rows[0].failed_attempts, 1);
    }

    #[test]
    fn test_status_json_uses_display_names() {
        let json = serde_json::to_value(build_status_rows(&counts())).unwrap();
        assert_eq!(json[0]["Queue"], "cf_report_pdfs");
        assert_eq!(json[0]["Failed Attempts"], 1);
    }

    #[test]
    fn test_status_table_headers() {
        let rendered = Table::new(build_status_rows(&counts())).to_string();
        assert!(rendered.contains("Unprocessed"));
        assert!(rendered.contains("cf_report_pdfs"));
    }

    #[test]
    fn test_repair_rows_dry_run_wording() {
        let summary = RepairSummary {
            dry_run: true,
            duplicates_deleted: 3,
            ..Default::default()
        };
        let rows = build_repair_rows(&summary);
        let dup = rows.iter().find(|r| r.metric == "Duplicates").unwrap();
        assert_eq!(dup.value, "3 (would delete)");
    }
}
