//! Field normalisation for extracted and fetched records: amounts, dates,
//! occupation/employer, addresses, donor classification and the pipe-separated
//! counterparty field.

use std::sync::OnceLock;

use chrono::{DateTime, NaiveDate, Utc};
use regex::Regex;
use serde::Deserialize;

/// US state and territory codes accepted as a donor state.
pub const VALID_STATES: &[&str] = &[
    "AL", "AK", "AZ", "AR", "CA", "CO", "CT", "DE", "FL", "GA", "HI", "ID", "IL", "IN", "IA",
    "KS", "KY", "LA", "ME", "MD", "MA", "MI", "MN", "MS", "MO", "MT", "NE", "NV", "NH", "NJ",
    "NM", "NY", "NC", "ND", "OH", "OK", "OR", "PA", "RI", "SC", "SD", "TN", "TX", "UT", "VT",
    "VA", "WA", "WV", "WI", "WY", "DC", "AS", "GU", "MP", "PR", "VI",
];

/// Counterparty id the filing source uses for aggregated small donors.
pub const MULTIPLE_CONTRIBUTORS_ID: i64 = -1;

const CSV_DATE_FORMATS: &[&str] = &["%m/%d/%Y", "%Y-%m-%d", "%B %d, %Y", "%b %d, %Y"];

/// True for empty strings and the extractor's `NA` marker.
pub fn is_blank(value: &str) -> bool {
    let v = value.trim();
    v.is_empty() || v == "NA"
}

/// Parses `$1,234.50`-style amounts. Blank or unparsable input is `None`.
pub fn parse_amount(value: &str) -> Option<f64> {
    if is_blank(value) {
        return None;
    }
    value
        .replace(['$', ','], "")
        .trim()
        .parse::<f64>()
        .ok()
        .filter(|v| v.is_finite())
}

/// Parses the date formats the extractor emits.
pub fn parse_csv_date(value: &str) -> Option<NaiveDate> {
    if is_blank(value) {
        return None;
    }
    let value = value.trim();
    CSV_DATE_FORMATS
        .iter()
        .find_map(|fmt| NaiveDate::parse_from_str(value, fmt).ok())
}

/// Parses `/Date(1577836800000)/` epoch-millisecond stamps as UTC.
pub fn parse_ms_date(value: &str) -> Option<DateTime<Utc>> {
    let inner = value.trim().strip_prefix("/Date(")?.strip_suffix(")/")?;
    // Some stamps carry a timezone suffix such as `-0700`; the millis are UTC regardless.
    let digits_end = inner
        .char_indices()
        .skip(1)
        .find(|(_, c)| *c == '+' || *c == '-')
        .map(|(i, _)| i)
        .unwrap_or(inner.len());
    let millis: i64 = inner[..digits_end].parse().ok()?;
    DateTime::from_timestamp_millis(millis)
}

fn is_none_marker(value: &str) -> bool {
    matches!(value.to_lowercase().as_str(), "n/a" | "none" | "na")
}

/// Splits `Occupation, Employer` on the first comma.
pub fn parse_occupation(value: &str) -> (String, String) {
    if is_blank(value) {
        return (String::new(), String::new());
    }
    let lower = value.trim().to_lowercase();
    match lower.as_str() {
        "retired" | "retired, n/a" | "retired, none" => {
            return ("Retired".to_string(), String::new())
        }
        "self" | "self-employed" | "self employed" => {
            return ("Self-employed".to_string(), "Self".to_string())
        }
        "none, none" | "n/a, n/a" => return (String::new(), String::new()),
        _ => {}
    }
    match value.split_once(',') {
        Some((occupation, employer)) => {
            let occupation = occupation.trim();
            let employer = employer.trim();
            (
                if is_none_marker(occupation) {
                    String::new()
                } else {
                    occupation.to_string()
                },
                if is_none_marker(employer) {
                    String::new()
                } else {
                    employer.to_string()
                },
            )
        }
        None => (value.trim().to_string(), String::new()),
    }
}

/// A donor address split into components.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AddressParts {
    pub street: String,
    pub city: String,
    pub state: String,
    pub zip: String,
    /// The input as given, blank for `NA`.
    pub full: String,
}

fn state_zip_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^([A-Z]{2})\s+(\d{5}(?:-\d{4})?)$")
            .unwrap_or_else(|e| panic!("invalid state/zip regex: {}", e))
    })
}

fn split_state_zip(value: &str, parts: &mut AddressParts) {
    let value = value.trim();
    if let Some(caps) = state_zip_re().captures(value) {
        parts.state = caps[1].to_string();
        parts.zip = caps[2].to_string();
        return;
    }
    let tokens: Vec<&str> = value.split_whitespace().collect();
    if tokens.len() >= 2 {
        parts.state = tokens[0].chars().take(2).collect();
        parts.zip = tokens[1..].join(" ");
    } else {
        parts.state = value.chars().take(2).collect();
    }
}

/// Splits `street[, unit], city, ST 12345` addresses of one to four parts.
/// Longer inputs keep only the full text.
pub fn parse_address(value: &str) -> AddressParts {
    let mut out = AddressParts::default();
    if is_blank(value) {
        return out;
    }
    out.full = value.to_string();
    let parts: Vec<&str> = value.split(',').map(str::trim).collect();
    match parts.as_slice() {
        [street] => out.street = street.to_string(),
        [street, city] => {
            out.street = street.to_string();
            out.city = city.to_string();
        }
        [street, city, state_zip] => {
            out.street = street.to_string();
            out.city = city.to_string();
            split_state_zip(state_zip, &mut out);
        }
        [street, unit, city, state_zip] => {
            out.street = format!("{} {}", street, unit);
            out.city = city.to_string();
            split_state_zip(state_zip, &mut out);
        }
        _ => {}
    }
    out
}

pub fn is_valid_state(code: &str) -> bool {
    VALID_STATES.contains(&code.trim().to_uppercase().as_str())
}

/// Donor classification flags.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DonorKind {
    pub is_pac: bool,
    pub is_corporate: bool,
}

/// Errors loading the embedded indicator seed.
#[derive(thiserror::Error, Debug)]
pub enum SeedError {
    #[error("TOML parse error: {0}")]
    TomlParse(String),
    #[error("indicator pattern error: {0}")]
    Pattern(String),
}

#[derive(Deserialize)]
struct IndicatorList {
    indicators: Vec<String>,
}

#[derive(Deserialize)]
struct IndicatorSeed {
    pac: IndicatorList,
    corporate: IndicatorList,
}

/// Classifies donor names as PAC and/or corporate by indicator words.
#[derive(Debug, Clone)]
pub struct DonorClassifier {
    pac: Regex,
    corporate: Regex,
}

impl DonorClassifier {
    /// Builds the classifier from the indicator list embedded at compile time.
    pub fn from_seed() -> Result<Self, SeedError> {
        Self::from_toml(include_str!("../../seed_data/donor_indicators.toml"))
    }

    pub fn from_toml(content: &str) -> Result<Self, SeedError> {
        let seed: IndicatorSeed =
            toml::from_str(content).map_err(|e| SeedError::TomlParse(e.to_string()))?;
        Ok(Self {
            pac: indicator_regex(&seed.pac.indicators)?,
            corporate: indicator_regex(&seed.corporate.indicators)?,
        })
    }

    pub fn classify(&self, name: &str) -> DonorKind {
        let upper = name.to_uppercase();
        DonorKind {
            is_pac: self.pac.is_match(&upper),
            is_corporate: self.corporate.is_match(&upper),
        }
    }
}

/// Indicators match only when flanked by non-alphanumerics, so `PAC` does not
/// fire inside `PACHECO` and `CO.` still matches at the end of a name.
fn indicator_regex(indicators: &[String]) -> Result<Regex, SeedError> {
    let alternation = indicators
        .iter()
        .map(|i| regex::escape(&i.to_uppercase()))
        .collect::<Vec<_>>()
        .join("|");
    Regex::new(&format!(r"(?:^|[^A-Z0-9])(?:{})(?:$|[^A-Z0-9])", alternation))
        .map_err(|e| SeedError::Pattern(e.to_string()))
}

/// The `ReceivedFromOrPaidTo` field, split on `|`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Counterparty {
    pub entity_id: i64,
    pub last_name: Option<String>,
    pub first_name: Option<String>,
    pub middle_name: Option<String>,
    pub entity_type_id: Option<i64>,
    pub group_number: Option<i64>,
    pub group_id: Option<i64>,
    pub full_name: Option<String>,
}

fn non_empty(value: &str) -> Option<String> {
    let v = value.trim();
    (!v.is_empty()).then(|| v.to_string())
}

/// Parses the pipe-separated counterparty field. Fewer than ten parts is `None`;
/// an empty or unparsable id becomes [`MULTIPLE_CONTRIBUTORS_ID`].
pub fn parse_counterparty(value: &str) -> Option<Counterparty> {
    let parts: Vec<&str> = value.split('|').collect();
    if parts.len() < 10 {
        return None;
    }
    Some(Counterparty {
        entity_id: parts[0].trim().parse().unwrap_or(MULTIPLE_CONTRIBUTORS_ID),
        last_name: non_empty(parts[1]),
        first_name: non_empty(parts[2]),
        middle_name: non_empty(parts[3]),
        entity_type_id: parts[4].trim().parse().ok(),
        group_number: parts[5].trim().parse().ok(),
        group_id: parts[6].trim().parse().ok(),
        full_name: non_empty(parts[9]),
    })
}

impl Counterparty {
    pub fn is_aggregate(&self) -> bool {
        self.entity_id == MULTIPLE_CONTRIBUTORS_ID
    }

    /// Full-name fragment when present, otherwise the last name.
    pub fn display_name(&self) -> String {
        self.full_name
            .clone()
            .or_else(|| self.last_name.clone())
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Datelike, Timelike};

    #[test]
    fn amounts() {
        assert_eq!(parse_amount("$1,234.50"), Some(1234.5));
        assert_eq!(parse_amount(" 25 "), Some(25.0));
        assert_eq!(parse_amount("NA"), None);
        assert_eq!(parse_amount(""), None);
        assert_eq!(parse_amount("abc"), None);
    }

    #[test]
    fn csv_dates() {
        let d = NaiveDate::from_ymd_opt(2024, 3, 5).unwrap();
        assert_eq!(parse_csv_date("03/05/2024"), Some(d));
        assert_eq!(parse_csv_date("2024-03-05"), Some(d));
        assert_eq!(parse_csv_date("March 05, 2024"), Some(d));
        assert_eq!(parse_csv_date("Mar 5, 2024"), Some(d));
        assert_eq!(parse_csv_date("NA"), None);
        assert_eq!(parse_csv_date("5th of March"), None);
    }

    #[test]
    fn ms_dates_are_utc() {
        let dt = parse_ms_date("/Date(1577836800000)/").unwrap();
        assert_eq!((dt.year(), dt.month(), dt.day()), (2020, 1, 1));
        assert_eq!(dt.hour(), 0);
        let with_zone = parse_ms_date("/Date(1577836800000-0700)/").unwrap();
        assert_eq!(with_zone, dt);
        assert!(parse_ms_date("/Date(-86400000)/").is_some());
        assert!(parse_ms_date("2020-01-01").is_none());
    }

    #[test]
    fn occupations() {
        assert_eq!(
            parse_occupation("Attorney, Smith & Jones"),
            ("Attorney".into(), "Smith & Jones".into())
        );
        assert_eq!(parse_occupation("Retired"), ("Retired".into(), "".into()));
        assert_eq!(
            parse_occupation("self employed"),
            ("Self-employed".into(), "Self".into())
        );
        assert_eq!(parse_occupation("Teacher, N/A"), ("Teacher".into(), "".into()));
        assert_eq!(parse_occupation("n/a, n/a"), ("".into(), "".into()));
        assert_eq!(parse_occupation("Nurse"), ("Nurse".into(), "".into()));
        assert_eq!(parse_occupation("NA"), ("".into(), "".into()));
    }

    #[test]
    fn addresses() {
        let a = parse_address("123 Main St, Phoenix, AZ 85001");
        assert_eq!(a.street, "123 Main St");
        assert_eq!(a.city, "Phoenix");
        assert_eq!(a.state, "AZ");
        assert_eq!(a.zip, "85001");

        let b = parse_address("1 Elm Rd, Apt 2, Tucson, AZ 85701-1234");
        assert_eq!(b.street, "1 Elm Rd Apt 2");
        assert_eq!(b.zip, "85701-1234");

        let c = parse_address("PO Box 9, Mesa");
        assert_eq!((c.street.as_str(), c.city.as_str()), ("PO Box 9", "Mesa"));

        let d = parse_address("1 Elm, Mesa, Arizona 85201");
        assert_eq!(d.state, "Ar");
        assert_eq!(d.zip, "85201");

        assert_eq!(parse_address("NA"), AddressParts::default());
    }

    #[test]
    fn states() {
        assert!(is_valid_state("az"));
        assert!(is_valid_state("PR"));
        assert!(!is_valid_state("Ar"));
        assert!(!is_valid_state("XX"));
    }

    #[test]
    fn donor_kinds_use_word_boundaries() {
        let c = DonorClassifier::from_seed().unwrap();
        assert!(c.classify("Friends of Jane Doe").is_pac);
        assert!(c.classify("Realtors PAC").is_pac);
        assert!(!c.classify("Maria Pacheco").is_pac);
        assert!(c.classify("Acme Co.").is_corporate);
        assert!(c.classify("Desert Holdings LLC").is_corporate);
        assert!(!c.classify("Lincoln Smith").is_corporate);
        assert_eq!(c.classify("John Smith"), DonorKind::default());
    }

    #[test]
    fn counterparty_parsing() {
        let cp = parse_counterparty("12345|Doe|Jane|Q|1|2|3|x|y|Jane Q Doe").unwrap();
        assert_eq!(cp.entity_id, 12345);
        assert_eq!(cp.last_name.as_deref(), Some("Doe"));
        assert_eq!(cp.entity_type_id, Some(1));
        assert_eq!(cp.display_name(), "Jane Q Doe");

        let agg = parse_counterparty("|Multiple Contributors||||||||").unwrap();
        assert!(agg.is_aggregate());
        assert_eq!(agg.display_name(), "Multiple Contributors");

        assert!(parse_counterparty("1|Doe|Jane").is_none());
    }
}
