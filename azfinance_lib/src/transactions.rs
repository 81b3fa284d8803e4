//! Transaction rows shaped from the filing source's table endpoint.

use std::collections::BTreeMap;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{json, Value};

use crate::error::PipelineError;
use crate::normalize::{parse_counterparty, parse_ms_date, Counterparty};
use crate::upload::{ReferencedEntity, UploadRow};
use crate::work_unit::as_row;
use crate::Row;

pub const TRANSACTION_TABLE: &str = "cf_transactions";
pub const TRANSACTION_KEY: &str = "public_transaction_id";

/// Accepts a JSON number, a numeric string, or null.
fn lenient_i64<'de, D: Deserializer<'de>>(d: D) -> Result<Option<i64>, D::Error> {
    Ok(match Option::<Value>::deserialize(d)? {
        Some(Value::Number(n)) => n.as_i64().or_else(|| n.as_f64().map(|f| f as i64)),
        Some(Value::String(s)) => s.trim().parse().ok(),
        _ => None,
    })
}

fn lenient_f64<'de, D: Deserializer<'de>>(d: D) -> Result<Option<f64>, D::Error> {
    Ok(match Option::<Value>::deserialize(d)? {
        Some(Value::Number(n)) => n.as_f64(),
        Some(Value::String(s)) => s.replace(['$', ','], "").trim().parse().ok(),
        _ => None,
    })
}

/// One row of the transaction table as the site sends it.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct RawTransaction {
    #[serde(deserialize_with = "lenient_i64")]
    pub public_transaction_id: Option<i64>,
    #[serde(deserialize_with = "lenient_i64")]
    pub transaction_id: Option<i64>,
    #[serde(deserialize_with = "lenient_i64")]
    pub committee_id: Option<i64>,
    pub committee_unique_id: Option<String>,
    pub committee_name: Option<String>,
    pub transaction_date: Option<String>,
    #[serde(deserialize_with = "lenient_i64")]
    pub transaction_date_year: Option<i64>,
    pub transaction_date_year_month: Option<String>,
    #[serde(deserialize_with = "lenient_i64")]
    pub transaction_type_id: Option<i64>,
    pub transaction_type: Option<String>,
    #[serde(deserialize_with = "lenient_i64")]
    pub transaction_type_disposition_id: Option<i64>,
    #[serde(deserialize_with = "lenient_f64")]
    pub amount: Option<f64>,
    #[serde(deserialize_with = "lenient_i64")]
    pub transaction_entity_type_id: Option<i64>,
    pub transaction_first_name: Option<String>,
    pub transaction_middle_name: Option<String>,
    pub transaction_last_name: Option<String>,
    pub received_from_or_paid_to: Option<String>,
    pub transaction_occupation: Option<String>,
    pub transaction_employer: Option<String>,
    pub transaction_city: Option<String>,
    pub transaction_state: Option<String>,
    pub transaction_zip_code: Option<String>,
    #[serde(deserialize_with = "lenient_i64")]
    pub entity_type_id: Option<i64>,
    pub entity_description: Option<String>,
    #[serde(deserialize_with = "lenient_i64")]
    pub transaction_group_number: Option<i64>,
    pub transaction_group_name: Option<String>,
    pub transaction_group_color: Option<String>,
    #[serde(deserialize_with = "lenient_i64")]
    pub subject_committee_id: Option<i64>,
    pub subject_committee_name: Option<String>,
    pub is_for_benefit: Option<bool>,
    pub benefited_opposed: Option<String>,
    #[serde(deserialize_with = "lenient_i64")]
    pub candidate_cycle_id: Option<i64>,
    #[serde(deserialize_with = "lenient_i64")]
    pub candidate_office_id: Option<i64>,
    #[serde(deserialize_with = "lenient_i64")]
    pub candidate_party_id: Option<i64>,
    pub candidate_first_name: Option<String>,
    pub candidate_last_name: Option<String>,
    #[serde(deserialize_with = "lenient_i64")]
    pub ballot_measure_id: Option<i64>,
    pub ballot_measure_number: Option<String>,
    #[serde(deserialize_with = "lenient_i64")]
    pub jurisdiction_id: Option<i64>,
    pub jurisdiction_name: Option<String>,
    #[serde(deserialize_with = "lenient_i64")]
    pub report_id: Option<i64>,
    pub memo: Option<String>,
}

/// One `cf_transactions` row, keyed by `public_transaction_id`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TransactionRow {
    pub public_transaction_id: i64,
    pub transaction_id: Option<i64>,
    /// The committee the transactions were fetched for.
    pub entity_id: i64,
    /// The counterparty; `-1` for aggregated small donors.
    pub transaction_entity_id: Option<i64>,
    pub committee_id: Option<i64>,
    pub committee_unique_id: Option<String>,
    pub committee_name: Option<String>,
    pub transaction_date: Option<NaiveDate>,
    pub transaction_date_timestamp: Option<DateTime<Utc>>,
    pub transaction_date_year: Option<i64>,
    pub transaction_date_year_month: Option<NaiveDate>,
    pub transaction_type_id: Option<i64>,
    pub transaction_type: Option<String>,
    pub transaction_type_disposition_id: Option<i64>,
    pub amount: f64,
    pub transaction_entity_type_id: Option<i64>,
    pub transaction_first_name: Option<String>,
    pub transaction_middle_name: Option<String>,
    pub transaction_last_name: Option<String>,
    pub received_from_or_paid_to: Option<String>,
    pub transaction_occupation: Option<String>,
    pub transaction_employer: Option<String>,
    pub transaction_city: Option<String>,
    pub transaction_state: Option<String>,
    pub transaction_zip_code: Option<String>,
    pub entity_type_id: Option<i64>,
    pub entity_description: Option<String>,
    pub transaction_group_number: Option<i64>,
    pub transaction_group_name: Option<String>,
    pub subject_committee_id: Option<i64>,
    pub subject_committee_name: Option<String>,
    pub is_for_benefit: Option<bool>,
    pub benefited_opposed: Option<String>,
    pub candidate_cycle_id: Option<i64>,
    pub candidate_office_id: Option<i64>,
    pub candidate_party_id: Option<i64>,
    pub candidate_first_name: Option<String>,
    pub candidate_last_name: Option<String>,
    pub ballot_measure_id: Option<i64>,
    pub ballot_measure_number: Option<String>,
    pub jurisdiction_id: i64,
    pub jurisdiction_name: Option<String>,
    pub report_id: Option<i64>,
    pub memo: Option<String>,
    #[serde(skip)]
    pub counterparty: Option<Counterparty>,
}

impl UploadRow for TransactionRow {
    fn to_row(&self) -> Row {
        as_row(serde_json::to_value(self).unwrap_or(Value::Null))
    }

    fn referenced_entity(&self) -> Option<ReferencedEntity> {
        self.counterparty.as_ref().map(ReferencedEntity::from)
    }

    fn amount(&self) -> f64 {
        self.amount
    }
}

impl TransactionRow {
    /// Shapes a raw row for committee `entity_id`. Rows without a public
    /// transaction id cannot be upserted and are rejected.
    pub fn from_raw(raw: RawTransaction, entity_id: i64) -> Result<Self, PipelineError> {
        let public_transaction_id = raw.public_transaction_id.ok_or_else(|| {
            PipelineError::InvalidData(format!(
                "transaction {:?} for entity {} has no PublicTransactionId",
                raw.transaction_id, entity_id
            ))
        })?;
        let counterparty = raw
            .received_from_or_paid_to
            .as_deref()
            .and_then(parse_counterparty);
        let timestamp = raw.transaction_date.as_deref().and_then(parse_ms_date);
        let year_month = raw
            .transaction_date_year_month
            .as_deref()
            .and_then(parse_ms_date)
            .map(|d| d.date_naive());

        // Parsed counterparty names win over the flat name columns.
        let (first, middle, last) = match &counterparty {
            Some(cp) => (
                cp.first_name.clone(),
                cp.middle_name.clone(),
                cp.last_name.clone(),
            ),
            None => (
                raw.transaction_first_name,
                raw.transaction_middle_name,
                raw.transaction_last_name,
            ),
        };

        Ok(Self {
            public_transaction_id,
            transaction_id: raw.transaction_id,
            entity_id,
            transaction_entity_id: counterparty.as_ref().map(|cp| cp.entity_id),
            committee_id: raw.committee_id,
            committee_unique_id: raw.committee_unique_id,
            committee_name: raw.committee_name,
            transaction_date: timestamp.map(|d| d.date_naive()),
            transaction_date_timestamp: timestamp,
            transaction_date_year: raw.transaction_date_year,
            transaction_date_year_month: year_month,
            transaction_type_id: raw.transaction_type_id,
            transaction_type: raw.transaction_type,
            transaction_type_disposition_id: raw.transaction_type_disposition_id,
            amount: raw.amount.unwrap_or(0.0),
            transaction_entity_type_id: raw.transaction_entity_type_id,
            transaction_first_name: first,
            transaction_middle_name: middle,
            transaction_last_name: last,
            received_from_or_paid_to: raw.received_from_or_paid_to,
            transaction_occupation: raw.transaction_occupation,
            transaction_employer: raw.transaction_employer,
            transaction_city: raw.transaction_city,
            transaction_state: raw.transaction_state,
            transaction_zip_code: raw.transaction_zip_code,
            entity_type_id: raw.entity_type_id,
            entity_description: raw.entity_description,
            transaction_group_number: raw.transaction_group_number,
            transaction_group_name: raw.transaction_group_name,
            subject_committee_id: raw.subject_committee_id,
            subject_committee_name: raw.subject_committee_name,
            is_for_benefit: raw.is_for_benefit,
            benefited_opposed: raw.benefited_opposed,
            candidate_cycle_id: raw.candidate_cycle_id,
            candidate_office_id: raw.candidate_office_id,
            candidate_party_id: raw.candidate_party_id,
            candidate_first_name: raw.candidate_first_name,
            candidate_last_name: raw.candidate_last_name,
            ballot_measure_id: raw.ballot_measure_id,
            ballot_measure_number: raw.ballot_measure_number,
            jurisdiction_id: raw.jurisdiction_id.unwrap_or(0),
            jurisdiction_name: raw.jurisdiction_name,
            report_id: raw.report_id,
            memo: raw.memo,
            counterparty,
        })
    }
}

/// Lookup rows seen across a batch of transactions, keyed by their ids.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Lookups {
    pub transaction_types: BTreeMap<i64, Row>,
    pub transaction_groups: BTreeMap<i64, Row>,
    pub entity_types: BTreeMap<i64, Row>,
}

impl Lookups {
    fn observe(&mut self, raw: &RawTransaction) {
        if let Some(id) = raw.transaction_type_id.filter(|id| *id != 0) {
            self.transaction_types.entry(id).or_insert_with(|| {
                as_row(json!({
                    "transaction_type_id": id,
                    "transaction_type_name": raw.transaction_type,
                    "transaction_disposition_id": raw.transaction_type_disposition_id,
                }))
            });
        }
        if let Some(n) = raw.transaction_group_number.filter(|n| *n != 0) {
            self.transaction_groups.entry(n).or_insert_with(|| {
                as_row(json!({
                    "group_number": n,
                    "group_name": raw.transaction_group_name,
                    "group_color": raw.transaction_group_color,
                }))
            });
        }
        if let Some(id) = raw.transaction_entity_type_id.filter(|id| *id != 0) {
            self.entity_types.entry(id).or_insert_with(|| {
                as_row(json!({
                    "entity_type_id": id,
                    "entity_type_name": raw.entity_description,
                }))
            });
        }
    }

    /// `(table, conflict column, rows)` for each non-empty lookup.
    pub fn tables(&self) -> Vec<(&'static str, &'static str, Vec<Row>)> {
        [
            ("cf_transaction_types", "transaction_type_id", &self.transaction_types),
            ("cf_transaction_groups", "group_number", &self.transaction_groups),
            ("cf_entity_types", "entity_type_id", &self.entity_types),
        ]
        .into_iter()
        .filter(|(_, _, rows)| !rows.is_empty())
        .map(|(table, key, rows)| (table, key, rows.values().cloned().collect()))
        .collect()
    }
}

/// Shaped rows for one committee.
#[derive(Debug, Clone, Default)]
pub struct ShapedTransactions {
    pub rows: Vec<TransactionRow>,
    pub lookups: Lookups,
    /// Raw rows that could not be shaped.
    pub dropped: usize,
}

/// Shapes every raw row. Unparsable rows and rows without a public id are
/// dropped with a warning; duplicates of the same public id keep the last copy.
pub fn shape_transactions(raw: Vec<Value>, entity_id: i64) -> ShapedTransactions {
    let mut out = ShapedTransactions::default();
    let mut by_id: BTreeMap<i64, TransactionRow> = BTreeMap::new();
    for value in raw {
        let parsed: RawTransaction = match serde_json::from_value(value) {
            Ok(t) => t,
            Err(e) => {
                tracing::warn!("entity {}: unparsable transaction: {}", entity_id, e);
                out.dropped += 1;
                continue;
            }
        };
        out.lookups.observe(&parsed);
        match TransactionRow::from_raw(parsed, entity_id) {
            Ok(row) => {
                by_id.insert(row.public_transaction_id, row);
            }
            Err(e) => {
                tracing::warn!("{}", e);
                out.dropped += 1;
            }
        }
    }
    out.rows = by_id.into_values().collect();
    out
}
