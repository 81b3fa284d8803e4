//! Detection and repair of left-shifted organisation contact fields.
//!
//! Some filings come out of the extractor with the contact block shifted one
//! slot to the left: the email slot holds `Phone: ...`, the phone slot holds
//! the street address, the address slot holds `Treasurer: ...` and so on.
//! The email itself is lost. [`OrgContact::repaired`] undoes the shift
//! without inventing data.

use std::sync::OnceLock;

use regex::Regex;
use serde::Serialize;

use crate::extractor::ExtractedRecord;

/// Jurisdiction recorded when a shifted record leaves the slot empty.
pub const DEFAULT_JURISDICTION: &str = "Arizona Secretary of State";

const PHONE_LABEL: &str = "Phone:";
const TREASURER_LABEL: &str = "Treasurer:";
const JURISDICTION_LABEL: &str = "Jurisdiction:";

pub const FIELD_EMAIL: &str = "OrgEml";
pub const FIELD_PHONE: &str = "OrgTel";
pub const FIELD_ADDRESS: &str = "OrgAdr";
pub const FIELD_TREASURER: &str = "OrgTreasurer";
pub const FIELD_JURISDICTION: &str = "Jurisdiction";

/// The five contact slots in their logical order.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct OrgContact {
    pub email: String,
    pub phone: String,
    pub address: String,
    pub treasurer: String,
    pub jurisdiction: String,
}

impl OrgContact {
    pub fn from_record(record: &ExtractedRecord) -> Self {
        Self {
            email: record.value(FIELD_EMAIL).to_string(),
            phone: record.value(FIELD_PHONE).to_string(),
            address: record.value(FIELD_ADDRESS).to_string(),
            treasurer: record.value(FIELD_TREASURER).to_string(),
            jurisdiction: record.value(FIELD_JURISDICTION).to_string(),
        }
    }

    /// The canary: a phone label in the email slot.
    pub fn is_shifted(&self) -> bool {
        self.email.contains(PHONE_LABEL)
    }

    /// Returns the contact with the shift undone, or an identical copy when
    /// the canary is absent. Applying it twice equals applying it once.
    pub fn repaired(&self) -> OrgContact {
        if !self.is_shifted() {
            return self.clone();
        }
        let jurisdiction = strip_label(&self.treasurer, JURISDICTION_LABEL);
        OrgContact {
            email: String::new(),
            phone: self.email.replace(PHONE_LABEL, "").trim().to_string(),
            address: self.phone.clone(),
            treasurer: strip_label(&self.address, TREASURER_LABEL),
            jurisdiction: if jurisdiction.is_empty() {
                DEFAULT_JURISDICTION.to_string()
            } else {
                jurisdiction
            },
        }
    }
}

/// Removes `label` and trims when present; otherwise returns the value as is.
fn strip_label(value: &str, label: &str) -> String {
    if value.contains(label) {
        value.replace(label, "").trim().to_string()
    } else {
        value.to_string()
    }
}

/// Repairs the contact block of one extracted record. Other fields are untouched,
/// and a clean record comes back equal to the input.
pub fn repair_record(record: &ExtractedRecord) -> ExtractedRecord {
    let contact = OrgContact::from_record(record);
    if !contact.is_shifted() {
        return record.clone();
    }
    let fixed = contact.repaired();
    let mut out = record.clone();
    out.set(FIELD_EMAIL, fixed.email);
    out.set(FIELD_PHONE, fixed.phone);
    out.set(FIELD_ADDRESS, fixed.address);
    out.set(FIELD_TREASURER, fixed.treasurer);
    out.set(FIELD_JURISDICTION, fixed.jurisdiction);
    out
}

/// Evidence that a stored contact block is still shifted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ShiftSymptom {
    PhoneInEmail,
    AddressInPhone,
    TreasurerInAddress,
    JurisdictionInTreasurer,
}

fn street_words() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?i)\b(street|st|ave|avenue|road|rd|drive|dr|court|ct|lane|ln|way|blvd)\b")
            .unwrap_or_else(|e| panic!("invalid street-word regex: {}", e))
    })
}

/// Lists every shift symptom present. An empty list means the block looks clean.
pub fn shift_symptoms(contact: &OrgContact) -> Vec<ShiftSymptom> {
    let mut symptoms = Vec::new();
    if contact.email.contains(PHONE_LABEL) {
        symptoms.push(ShiftSymptom::PhoneInEmail);
    }
    if contact.phone.chars().any(|c| c.is_ascii_digit()) && street_words().is_match(&contact.phone)
    {
        symptoms.push(ShiftSymptom::AddressInPhone);
    }
    if contact.address.contains(TREASURER_LABEL) {
        symptoms.push(ShiftSymptom::TreasurerInAddress);
    }
    if contact.treasurer.contains(JURISDICTION_LABEL) {
        symptoms.push(ShiftSymptom::JurisdictionInTreasurer);
    }
    symptoms
}
