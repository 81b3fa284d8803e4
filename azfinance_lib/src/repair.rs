//! Offline deduplication and consistency pass over stored reports and donations.
//!
//! Every step is idempotent: once the store has converged a second run
//! finds nothing to delete.

use std::collections::{BTreeMap, BTreeSet};

use cfstore_api::{Filter, Select};
use serde::Serialize;

use crate::normalize::is_valid_state;
use crate::report::{DONATION_TABLE, REPORT_TABLE};
use crate::shift::{shift_symptoms, OrgContact};
use crate::store::{row_f64, row_i64, row_str, select_all, BulkStore};
use crate::work_unit::WorkQueue;

/// Rows per delete request.
pub const DELETE_BATCH: usize = 50;

#[derive(thiserror::Error, Debug)]
pub enum RepairError {
    #[error("store error: {0}")]
    Store(#[from] cfstore_api::Error),
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RepairOptions {
    /// Report findings without writing anything.
    pub dry_run: bool,
    /// Re-flag documents whose stored report still shows shifted contact fields.
    pub reflag_shifted: bool,
}

/// Findings and actions of one pass. In a dry run the action counts are what
/// would have been done.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RepairSummary {
    pub dry_run: bool,
    pub reports_scanned: usize,
    pub donations_scanned: usize,
    pub duplicate_groups: usize,
    pub duplicates_deleted: usize,
    pub orphans_deleted: usize,
    /// Reports recording donations with none stored.
    pub empty_reports: usize,
    pub shifted_reports: usize,
    pub documents_reflagged: usize,
    /// Donations with a state code outside the US and territories.
    pub invalid_states: usize,
}

impl RepairSummary {
    /// True when the pass found nothing to delete or re-flag.
    pub fn is_clean(&self) -> bool {
        self.duplicates_deleted == 0 && self.orphans_deleted == 0 && self.documents_reflagged == 0
    }
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
struct DonationKey {
    report_id: i64,
    donor_name: String,
    donation_date: String,
    amount_cents: i64,
}

struct StoredReport {
    report_id: i64,
    pdf_id: Option<i64>,
    donation_count: i64,
    contact: OrgContact,
}

/// Runs the full pass.
///
/// Meant to run while no pipeline is writing. Donations are snapshotted
/// before reports, so a report created mid-pass can only make its own
/// donations look missing (re-flagged and reprocessed), never turn a live
/// donation into an orphan.
pub async fn run<S: BulkStore>(
    store: &S,
    options: RepairOptions,
) -> Result<RepairSummary, RepairError> {
    let mut summary = RepairSummary {
        dry_run: options.dry_run,
        ..Default::default()
    };

    let donations = select_all(
        store,
        Select::from(DONATION_TABLE)
            .columns(&[
                "donation_id",
                "report_id",
                "donor_name",
                "donation_date",
                "donation_amt",
                "donor_state",
            ])
            .order_by("donation_id"),
        crate::config::MAX_PAGE_SIZE,
    )
    .await?;
    summary.donations_scanned = donations.len();
    let reports = load_reports(store).await?;
    summary.reports_scanned = reports.len();

    let report_ids: BTreeSet<i64> = reports.iter().map(|r| r.report_id).collect();
    let mut groups: BTreeMap<DonationKey, Vec<i64>> = BTreeMap::new();
    let mut orphans = Vec::new();
    let mut with_donations = BTreeSet::new();

    for row in &donations {
        let Some(donation_id) = row_i64(row, "donation_id") else {
            continue;
        };
        if let Some(state) = row_str(row, "donor_state") {
            if !state.trim().is_empty() && !is_valid_state(state) {
                summary.invalid_states += 1;
            }
        }
        let Some(report_id) = row_i64(row, "report_id") else {
            continue;
        };
        if !report_ids.contains(&report_id) {
            orphans.push(donation_id);
            continue;
        }
        with_donations.insert(report_id);
        let key = DonationKey {
            report_id,
            donor_name: row_str(row, "donor_name").unwrap_or("").trim().to_string(),
            donation_date: row_str(row, "donation_date").unwrap_or("").to_string(),
            amount_cents: row_f64(row, "donation_amt")
                .map(|a| (a * 100.0).round() as i64)
                .unwrap_or(0),
        };
        groups.entry(key).or_default().push(donation_id);
    }

    // Keep the lowest id of each group.
    let mut duplicates = Vec::new();
    for ids in groups.values_mut().filter(|ids| ids.len() > 1) {
        summary.duplicate_groups += 1;
        ids.sort_unstable();
        duplicates.extend_from_slice(&ids[1..]);
    }
    summary.duplicates_deleted = duplicates.len();
    summary.orphans_deleted = orphans.len();
    if summary.duplicate_groups > 0 {
        tracing::info!(
            "{} duplicate donation groups, {} rows to delete",
            summary.duplicate_groups,
            duplicates.len()
        );
    }
    if !orphans.is_empty() {
        tracing::info!("{} orphaned donations", orphans.len());
    }

    let mut reflag = BTreeSet::new();
    for report in &reports {
        if report.donation_count > 0 && !with_donations.contains(&report.report_id) {
            summary.empty_reports += 1;
            reflag.extend(report.pdf_id);
        }
        if !shift_symptoms(&report.contact).is_empty() {
            summary.shifted_reports += 1;
            if options.reflag_shifted {
                reflag.extend(report.pdf_id);
            }
        }
    }
    summary.documents_reflagged = reflag.len();
    if summary.invalid_states > 0 {
        tracing::warn!("{} donations carry an invalid state code", summary.invalid_states);
    }

    if options.dry_run {
        return Ok(summary);
    }

    delete_in_batches(store, &duplicates).await?;
    delete_in_batches(store, &orphans).await?;
    let ids: Vec<i64> = reflag.into_iter().collect();
    WorkQueue::report_pdfs()
        .reflag(store, &ids, "flagged by consistency repair")
        .await?;
    Ok(summary)
}

async fn load_reports<S: BulkStore>(store: &S) -> Result<Vec<StoredReport>, RepairError> {
    let rows = select_all(
        store,
        Select::from(REPORT_TABLE)
            .columns(&[
                "report_id",
                "pdf_id",
                "donation_count",
                "org_email",
                "org_phone",
                "org_address",
                "org_treasurer",
                "org_jurisdiction",
            ])
            .order_by("report_id"),
        crate::config::MAX_PAGE_SIZE,
    )
    .await?;
    let text = |row: &crate::Row, c: &str| row_str(row, c).unwrap_or("").to_string();
    Ok(rows
        .iter()
        .filter_map(|row| {
            Some(StoredReport {
                report_id: row_i64(row, "report_id")?,
                pdf_id: row_i64(row, "pdf_id"),
                donation_count: row_i64(row, "donation_count").unwrap_or(0),
                contact: OrgContact {
                    email: text(row, "org_email"),
                    phone: text(row, "org_phone"),
                    address: text(row, "org_address"),
                    treasurer: text(row, "org_treasurer"),
                    jurisdiction: text(row, "org_jurisdiction"),
                },
            })
        })
        .collect())
}

async fn delete_in_batches<S: BulkStore>(store: &S, ids: &[i64]) -> Result<(), RepairError> {
    for batch in ids.chunks(DELETE_BATCH) {
        store
            .delete(DONATION_TABLE, &[Filter::in_list("donation_id", batch)])
            .await?;
        tracing::debug!("deleted {} donations", batch.len());
    }
    Ok(())
}
