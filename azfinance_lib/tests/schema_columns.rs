//! Every column the pipeline writes exists in the shipped schema.

use std::collections::BTreeSet;

use azfinance_lib::normalize::DonorClassifier;
use azfinance_lib::report::{shape_report, ReportSource};
use azfinance_lib::transactions::shape_transactions;
use azfinance_lib::{ExtractedTable, ReferencedEntity, Row, UploadRow};

const SCHEMA: &str = include_str!("../../schema/postgres.sql");

fn columns(table: &str) -> BTreeSet<String> {
    let header = format!("CREATE TABLE IF NOT EXISTS {} (", table);
    let start = SCHEMA
        .find(&header)
        .unwrap_or_else(|| panic!("table {} missing from schema", table))
        + header.len();
    let body = &SCHEMA[start..];
    let end = body.find("\n);").unwrap();
    body[..end]
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty() && !l.starts_with("CHECK"))
        .filter_map(|l| l.split_whitespace().next())
        .map(str::to_string)
        .collect()
}

fn assert_covered(table: &str, row: &Row) {
    let known = columns(table);
    for key in row.keys() {
        assert!(known.contains(key), "{}.{} not in schema", table, key);
    }
}

#[test]
fn report_and_donation_columns_exist() {
    let csv = "OrgNm,Donor_Name,Donation_Date,Donation_Amt\nFriends,Jane Doe,01/02/2024,10\n";
    let table = ExtractedTable::from_reader(csv.as_bytes()).unwrap();
    let shaped = shape_report(
        &table,
        ReportSource {
            pdf_id: 1,
            entity_id: 2,
            report_name: "Q1",
        },
        &DonorClassifier::from_seed().unwrap(),
    );
    assert_covered("cf_reports", &shaped.report.to_row());
    assert_covered("cf_donations", &shaped.donations[0].to_row());
}

#[test]
fn transaction_and_lookup_columns_exist() {
    let page: serde_json::Value = serde_json::from_str(
        &std::fs::read_to_string("tests/fixtures/transactions_page.json").unwrap(),
    )
    .unwrap();
    let raw = page["data"].as_array().unwrap().clone();
    let shaped = shape_transactions(raw, 100);
    assert!(!shaped.rows.is_empty());
    for row in &shaped.rows {
        assert_covered("cf_transactions", &row.to_row());
        if let Some(entity) = row.referenced_entity() {
            assert_covered("cf_transaction_entities", &entity.to_row());
        }
    }
    for (table, key, rows) in shaped.lookups.tables() {
        assert!(columns(table).contains(key));
        for row in &rows {
            assert_covered(table, row);
        }
    }
}

#[test]
fn queue_tables_carry_status_columns() {
    for table in ["cf_report_pdfs", "cf_entities"] {
        let known = columns(table);
        for col in [
            "status",
            "status_reason",
            "last_error",
            "last_attempt_at",
            "processed_at",
            "row_count",
            "total_amount",
        ] {
            assert!(known.contains(col), "{}.{} not in schema", table, col);
        }
    }
    assert_covered(
        "cf_transaction_entities",
        &ReferencedEntity::stub(7).to_row(),
    );
}
