//! Report and donation rows shaped from an extracted filing.

use chrono::{NaiveDate, Utc};
use serde::Serialize;
use serde_json::Value;

use crate::extractor::{ExtractedRecord, ExtractedTable};
use crate::normalize::{
    parse_address, parse_amount, parse_csv_date, parse_occupation, DonorClassifier,
};
use crate::shift::{repair_record, DEFAULT_JURISDICTION};
use crate::upload::UploadRow;
use crate::work_unit::as_row;
use crate::Row;

pub const REPORT_TABLE: &str = "cf_reports";
pub const DONATION_TABLE: &str = "cf_donations";

const DEFAULT_REPORT_NAME: &str = "Campaign Finance Report";

/// One `cf_reports` row. Keyed by `pdf_id`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ReportRow {
    pub pdf_id: i64,
    pub entity_id: i64,
    pub rpt_title: String,
    pub rpt_name: String,
    pub rpt_cycle: Option<i64>,
    pub rpt_file_date: Option<NaiveDate>,
    pub rpt_period: String,
    pub org_name: String,
    pub org_email: String,
    pub org_phone: String,
    pub org_address: String,
    pub org_treasurer: String,
    pub org_jurisdiction: String,
    pub total_donations: f64,
    pub donation_count: usize,
    pub processed_date: String,
}

/// One `cf_donations` row. `report_id` is filled in once the parent exists.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DonationRow {
    pub report_id: Option<i64>,
    pub entity_id: i64,
    pub donor_name: String,
    pub donor_addr: String,
    pub donor_city: String,
    pub donor_state: String,
    pub donor_zip: String,
    pub donor_full_address: String,
    pub donor_occupation: String,
    pub donor_employer: String,
    pub donation_date: NaiveDate,
    pub donation_amt: f64,
    pub donation_type: String,
    pub cycle_to_date_amt: Option<f64>,
    pub page_num: Option<i64>,
    pub page_type: String,
    pub meta_segment_name: String,
    pub meta_file_name: String,
    pub is_pac: bool,
    pub is_corporate: bool,
    pub import_date: String,
}

impl UploadRow for DonationRow {
    fn to_row(&self) -> Row {
        as_row(serde_json::to_value(self).unwrap_or(Value::Null))
    }

    fn amount(&self) -> f64 {
        self.donation_amt
    }
}

impl ReportRow {
    pub fn to_row(&self) -> Row {
        as_row(serde_json::to_value(self).unwrap_or(Value::Null))
    }
}

/// Identifies the document a table was extracted from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReportSource<'a> {
    pub pdf_id: i64,
    pub entity_id: i64,
    /// Name recorded on the queue row, used when the filing carries none.
    pub report_name: &'a str,
}

/// A report with its donations, ready to upload.
#[derive(Debug, Clone, PartialEq)]
pub struct ShapedReport {
    pub report: ReportRow,
    pub donations: Vec<DonationRow>,
    /// Extracted rows that were not donations (metadata rows, missing amount or date).
    pub dropped: usize,
    pub was_shifted: bool,
}

fn digits_only(value: &str) -> Option<i64> {
    let v = value.trim();
    if v.is_empty() || !v.chars().all(|c| c.is_ascii_digit()) {
        return None;
    }
    v.parse().ok()
}

fn text(record: &ExtractedRecord, field: &str) -> String {
    record.present(field).unwrap_or("").to_string()
}

/// Builds a donation row, or `None` for rows without a donor name, amount or date.
pub fn shape_donation(
    record: &ExtractedRecord,
    entity_id: i64,
    classifier: &DonorClassifier,
    now: &str,
) -> Option<DonationRow> {
    let donor_name = record.present("Donor_Name")?.to_string();
    let donation_amt = parse_amount(record.value("Donation_Amt"))?;
    let donation_date = parse_csv_date(record.value("Donation_Date"))?;
    let (occupation, employer) = parse_occupation(record.value("Donor_Occupation"));
    let address = parse_address(record.value("Donor_Addr"));
    let kind = classifier.classify(&donor_name);
    Some(DonationRow {
        report_id: None,
        entity_id,
        donor_name,
        donor_addr: address.street,
        donor_city: address.city,
        donor_state: address.state,
        donor_zip: address.zip,
        donor_full_address: address.full,
        donor_occupation: occupation,
        donor_employer: employer,
        donation_date,
        donation_amt,
        donation_type: text(record, "Donation_Type"),
        cycle_to_date_amt: parse_amount(record.value("CycleToDate_Amt")),
        page_num: digits_only(record.value("PageNum")),
        page_type: text(record, "PageType"),
        meta_segment_name: text(record, "META_SegmentName"),
        meta_file_name: text(record, "META_FileName"),
        is_pac: kind.is_pac,
        is_corporate: kind.is_corporate,
        import_date: now.to_string(),
    })
}

/// Shapes a whole extracted table. The first record supplies the report
/// metadata after shift repair; totals come from the donations kept.
pub fn shape_report(
    table: &ExtractedTable,
    source: ReportSource<'_>,
    classifier: &DonorClassifier,
) -> ShapedReport {
    let now = Utc::now().to_rfc3339();
    let first = table.first().cloned().unwrap_or_default();
    let was_shifted = crate::shift::OrgContact::from_record(&first).is_shifted();
    let meta = repair_record(&first);

    let donations: Vec<DonationRow> = table
        .records
        .iter()
        .filter_map(|r| shape_donation(r, source.entity_id, classifier, &now))
        .collect();
    let dropped = table.records.len() - donations.len();

    let rpt_name = meta
        .present("Rpt_Name")
        .or_else(|| Some(source.report_name.trim()).filter(|s| !s.is_empty()))
        .unwrap_or(DEFAULT_REPORT_NAME)
        .to_string();
    let jurisdiction = meta
        .present("Jurisdiction")
        .unwrap_or(DEFAULT_JURISDICTION)
        .to_string();

    let report = ReportRow {
        pdf_id: source.pdf_id,
        entity_id: source.entity_id,
        rpt_title: meta.present("Rpt_Title").unwrap_or(DEFAULT_REPORT_NAME).to_string(),
        rpt_name,
        rpt_cycle: digits_only(meta.value("Rpt_Cycle")),
        rpt_file_date: parse_csv_date(meta.value("Rpt_FileDate")),
        rpt_period: text(&meta, "Rpt_Period"),
        org_name: text(&meta, "OrgNm"),
        org_email: text(&meta, "OrgEml"),
        org_phone: text(&meta, "OrgTel"),
        org_address: text(&meta, "OrgAdr"),
        org_treasurer: text(&meta, "OrgTreasurer"),
        org_jurisdiction: jurisdiction,
        total_donations: donations.iter().map(|d| d.donation_amt).sum(),
        donation_count: donations.len(),
        processed_date: now,
    };

    ShapedReport {
        report,
        donations,
        dropped,
        was_shifted,
    }
}
